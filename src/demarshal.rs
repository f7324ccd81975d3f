//! Decoding of values from the D-Bus wire format.

use std::collections::HashMap;

use thiserror::Error;

use crate::marshal::Endianness;
use crate::signature::{self, SignatureError, MAX_ARRAY_DEPTH, MAX_STRUCT_DEPTH, MAX_TOTAL_DEPTH};
use crate::types::{
    validate_object_path, Array, BasicValue, Dictionary, Path, Signature, Struct, Type, Value,
    Variant,
};

/// Arrays on the wire may not exceed 64 MiB.
pub const MAX_ARRAY_LEN: u32 = 1 << 26;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DemarshalError {
    #[error("message too short")]
    MessageTooShort,
    #[error("corrupted message")]
    CorruptedMessage,
    #[error("string is not valid UTF-8")]
    BadUTF8,
    #[error("bad signature")]
    BadSignature,
    #[error("element exceeds its size bound")]
    ElementTooBig,
    #[error("value nesting deeper than the protocol allows")]
    DepthExceeded,
}

impl From<SignatureError> for DemarshalError {
    fn from(e: SignatureError) -> Self {
        match e {
            SignatureError::DepthExceeded => DemarshalError::DepthExceeded,
            _ => DemarshalError::BadSignature,
        }
    }
}

/// A cursor over an encoded buffer.  The offset is the position relative to
/// the start of the containing message, which is what alignment is computed
/// against.
pub struct Demarshaller<'a> {
    buf: &'a [u8],
    offset: usize,
    endian: Endianness,
    array_depth: usize,
    struct_depth: usize,
    total_depth: usize,
}

impl<'a> Demarshaller<'a> {
    pub fn new(buf: &'a [u8], endian: Endianness) -> Demarshaller<'a> {
        Demarshaller::with_offset(buf, endian, 0)
    }

    /// Start decoding at `offset` within `buf`.  Used for header fields,
    /// which begin at offset 12 of the message.
    pub fn with_offset(buf: &'a [u8], endian: Endianness, offset: usize) -> Demarshaller<'a> {
        Demarshaller {
            buf,
            offset,
            endian,
            array_depth: 0,
            struct_depth: 0,
            total_depth: 0,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    /// Skip padding up to an alignment boundary.  Padding content is not
    /// validated on read.
    fn align_to(&mut self, align: usize) -> Result<(), DemarshalError> {
        let rem = self.offset % align;
        if rem == 0 {
            return Ok(());
        }
        let delta = align - rem;
        if self.remaining() < delta {
            return Err(DemarshalError::MessageTooShort);
        }
        self.offset += delta;
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DemarshalError> {
        if self.remaining() < n {
            return Err(DemarshalError::MessageTooShort);
        }
        let out = &self.buf[self.offset..self.offset + n];
        self.offset += n;
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8, DemarshalError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, DemarshalError> {
        self.align_to(2)?;
        let mut b = [0u8; 2];
        b.copy_from_slice(self.take(2)?);
        Ok(match self.endian {
            Endianness::Little => u16::from_le_bytes(b),
            Endianness::Big => u16::from_be_bytes(b),
        })
    }

    pub fn get_u32(&mut self) -> Result<u32, DemarshalError> {
        self.align_to(4)?;
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4)?);
        Ok(match self.endian {
            Endianness::Little => u32::from_le_bytes(b),
            Endianness::Big => u32::from_be_bytes(b),
        })
    }

    pub fn get_u64(&mut self) -> Result<u64, DemarshalError> {
        self.align_to(8)?;
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(match self.endian {
            Endianness::Little => u64::from_le_bytes(b),
            Endianness::Big => u64::from_be_bytes(b),
        })
    }

    fn enter_array(&mut self) -> Result<(), DemarshalError> {
        self.array_depth += 1;
        self.total_depth += 1;
        if self.array_depth > MAX_ARRAY_DEPTH || self.total_depth > MAX_TOTAL_DEPTH {
            return Err(DemarshalError::DepthExceeded);
        }
        Ok(())
    }

    fn leave_array(&mut self) {
        self.array_depth -= 1;
        self.total_depth -= 1;
    }

    fn enter_struct(&mut self) -> Result<(), DemarshalError> {
        self.struct_depth += 1;
        self.total_depth += 1;
        if self.struct_depth > MAX_STRUCT_DEPTH || self.total_depth > MAX_TOTAL_DEPTH {
            return Err(DemarshalError::DepthExceeded);
        }
        Ok(())
    }

    fn leave_struct(&mut self) {
        self.struct_depth -= 1;
        self.total_depth -= 1;
    }

    /// Decode one complete value of type `ty`.
    pub fn demarshal(&mut self, ty: &Type) -> Result<Value, DemarshalError> {
        match *ty {
            Type::Byte => Ok(Value::BasicValue(BasicValue::Byte(self.get_u8()?))),
            Type::Boolean => self.demarshal_bool(),
            Type::Int16 => Ok(Value::BasicValue(BasicValue::Int16(self.get_u16()? as i16))),
            Type::Uint16 => Ok(Value::BasicValue(BasicValue::Uint16(self.get_u16()?))),
            Type::Int32 => Ok(Value::BasicValue(BasicValue::Int32(self.get_u32()? as i32))),
            Type::Uint32 => Ok(Value::BasicValue(BasicValue::Uint32(self.get_u32()?))),
            Type::Int64 => Ok(Value::BasicValue(BasicValue::Int64(self.get_u64()? as i64))),
            Type::Uint64 => Ok(Value::BasicValue(BasicValue::Uint64(self.get_u64()?))),
            Type::Double => Ok(Value::Double(f64::from_bits(self.get_u64()?))),
            Type::UnixFd => Ok(Value::BasicValue(BasicValue::UnixFd(self.get_u32()?))),
            Type::String => {
                let s = self.demarshal_string()?;
                Ok(Value::BasicValue(BasicValue::String(s)))
            }
            Type::ObjectPath => {
                let s = self.demarshal_string()?;
                validate_object_path(&s).map_err(|_| DemarshalError::CorruptedMessage)?;
                Ok(Value::BasicValue(BasicValue::ObjectPath(Path(s))))
            }
            Type::Signature => {
                let s = self.demarshal_signature_string()?;
                Ok(Value::BasicValue(BasicValue::Signature(Signature(s))))
            }
            Type::Array(ref elem) => self.demarshal_array(elem),
            Type::Struct(ref fields) => self.demarshal_struct(fields),
            Type::DictEntry(ref k, ref v) => self.demarshal_dict_entry(k, v),
            Type::Variant => self.demarshal_variant(),
        }
    }

    fn demarshal_bool(&mut self) -> Result<Value, DemarshalError> {
        match self.get_u32()? {
            0 => Ok(Value::BasicValue(BasicValue::Boolean(false))),
            1 => Ok(Value::BasicValue(BasicValue::Boolean(true))),
            _ => Err(DemarshalError::CorruptedMessage),
        }
    }

    fn demarshal_string(&mut self) -> Result<String, DemarshalError> {
        let len = self.get_u32()? as usize;
        if len > self.remaining() {
            return Err(DemarshalError::MessageTooShort);
        }
        let bytes = self.take(len)?.to_vec();
        // The terminating NUL is on the wire but not in the length.
        if self.get_u8()? != 0 {
            return Err(DemarshalError::CorruptedMessage);
        }
        let s = String::from_utf8(bytes).map_err(|_| DemarshalError::BadUTF8)?;
        if s.contains('\0') {
            return Err(DemarshalError::CorruptedMessage);
        }
        Ok(s)
    }

    fn demarshal_signature_string(&mut self) -> Result<String, DemarshalError> {
        let len = self.get_u8()? as usize;
        let bytes = self.take(len)?.to_vec();
        if self.get_u8()? != 0 {
            return Err(DemarshalError::CorruptedMessage);
        }
        let s = String::from_utf8(bytes).map_err(|_| DemarshalError::BadUTF8)?;
        // Contents must themselves form a valid signature.
        signature::parse(&s)?;
        Ok(s)
    }

    fn demarshal_array(&mut self, elem: &Type) -> Result<Value, DemarshalError> {
        let array_len = self.get_u32()?;
        if array_len > MAX_ARRAY_LEN {
            return Err(DemarshalError::ElementTooBig);
        }
        self.align_to(elem.alignment())?;
        if (array_len as usize) > self.remaining() {
            return Err(DemarshalError::MessageTooShort);
        }
        self.enter_array()?;
        let end = self.offset + array_len as usize;
        let mut vec = Vec::new();
        while self.offset < end {
            vec.push(self.demarshal(elem)?);
        }
        if self.offset != end {
            return Err(DemarshalError::CorruptedMessage);
        }
        self.leave_array();

        if let Type::DictEntry(ref k, ref v) = *elem {
            let mut map: HashMap<BasicValue, Value> = HashMap::new();
            for x in vec {
                let mut st = match x {
                    Value::Struct(st) => st,
                    _ => return Err(DemarshalError::CorruptedMessage),
                };
                let val = st.objects.remove(1);
                let key = match st.objects.remove(0) {
                    Value::BasicValue(b) => b,
                    _ => return Err(DemarshalError::CorruptedMessage),
                };
                map.insert(key, val);
            }
            return Ok(Value::Dictionary(Dictionary::new_with_sig(
                map,
                k.to_signature(),
                v.to_signature(),
            )));
        }

        Ok(Value::Array(Array::new_with_sig(vec, elem.to_signature())))
    }

    fn demarshal_struct(&mut self, fields: &[Type]) -> Result<Value, DemarshalError> {
        self.align_to(8)?;
        self.enter_struct()?;
        let mut vec = Vec::with_capacity(fields.len());
        for t in fields {
            vec.push(self.demarshal(t)?);
        }
        self.leave_struct();
        Ok(Value::Struct(Struct {
            objects: vec,
            signature: Signature(Type::Struct(fields.to_vec()).to_signature()),
        }))
    }

    fn demarshal_dict_entry(&mut self, k: &Type, v: &Type) -> Result<Value, DemarshalError> {
        self.align_to(8)?;
        self.enter_struct()?;
        let key = self.demarshal(k)?;
        let val = self.demarshal(v)?;
        self.leave_struct();
        Ok(Value::Struct(Struct {
            objects: vec![key, val],
            signature: Signature(
                "(".to_string() + &k.to_signature() + &v.to_signature() + ")",
            ),
        }))
    }

    fn demarshal_variant(&mut self) -> Result<Value, DemarshalError> {
        let sig = self.demarshal_signature_string()?;
        let inner = signature::parse_single(&sig)?;
        self.total_depth += 1;
        if self.total_depth > MAX_TOTAL_DEPTH {
            return Err(DemarshalError::DepthExceeded);
        }
        let object = self.demarshal(&inner)?;
        self.total_depth -= 1;
        Ok(Value::Variant(Variant {
            object: Box::new(object),
            signature: Signature(sig),
        }))
    }
}

/// Decode a whole message body: a sequence of complete types that must
/// consume the buffer exactly.
pub fn demarshal_body(
    buf: &[u8],
    endian: Endianness,
    sig: &str,
) -> Result<Vec<Value>, DemarshalError> {
    let types = signature::parse(sig)?;
    let mut dm = Demarshaller::new(buf, endian);
    let mut out = Vec::with_capacity(types.len());
    for t in &types {
        out.push(dm.demarshal(t)?);
    }
    if dm.remaining() != 0 {
        return Err(DemarshalError::CorruptedMessage);
    }
    Ok(out)
}
