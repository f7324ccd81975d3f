//! The D-Bus type system: types, values and the typecheck between them.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use crate::signature;

/// A D-Bus object path, e.g. `/org/freedesktop/DBus`.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct Path(pub String);

impl Path {
    pub fn new(s: &str) -> Result<Path, TypeMismatch> {
        validate_object_path(s)?;
        Ok(Path(s.to_owned()))
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A D-Bus type signature, e.g. `a{sv}`.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct Signature(pub String);

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The closed set of D-Bus types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    Byte,
    Boolean,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Double,
    String,
    ObjectPath,
    Signature,
    UnixFd,
    Array(Box<Type>),
    Struct(Vec<Type>),
    Variant,
    DictEntry(Box<Type>, Box<Type>),
}

impl Type {
    /// Natural alignment of this type on the wire.
    pub fn alignment(&self) -> usize {
        match *self {
            Type::Byte | Type::Signature | Type::Variant => 1,
            Type::Int16 | Type::Uint16 => 2,
            Type::Boolean
            | Type::Int32
            | Type::Uint32
            | Type::String
            | Type::ObjectPath
            | Type::UnixFd
            | Type::Array(_) => 4,
            Type::Int64 | Type::Uint64 | Type::Double | Type::Struct(_) | Type::DictEntry(..) => 8,
        }
    }

    pub fn is_basic(&self) -> bool {
        !matches!(
            *self,
            Type::Array(_) | Type::Struct(_) | Type::Variant | Type::DictEntry(..)
        )
    }

    /// The signature string denoting this single type.
    pub fn to_signature(&self) -> String {
        let mut out = String::new();
        self.write_signature(&mut out);
        out
    }

    fn write_signature(&self, out: &mut String) {
        match *self {
            Type::Byte => out.push('y'),
            Type::Boolean => out.push('b'),
            Type::Int16 => out.push('n'),
            Type::Uint16 => out.push('q'),
            Type::Int32 => out.push('i'),
            Type::Uint32 => out.push('u'),
            Type::Int64 => out.push('x'),
            Type::Uint64 => out.push('t'),
            Type::Double => out.push('d'),
            Type::String => out.push('s'),
            Type::ObjectPath => out.push('o'),
            Type::Signature => out.push('g'),
            Type::UnixFd => out.push('h'),
            Type::Variant => out.push('v'),
            Type::Array(ref t) => {
                out.push('a');
                t.write_signature(out);
            }
            Type::Struct(ref fields) => {
                out.push('(');
                for t in fields {
                    t.write_signature(out);
                }
                out.push(')');
            }
            Type::DictEntry(ref k, ref v) => {
                out.push('{');
                k.write_signature(out);
                v.write_signature(out);
                out.push('}');
            }
        }
    }
}

/// The basic values.  Everything in here is `Eq + Hash` so it can key a
/// dictionary; `double` therefore lives directly on [`Value`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BasicValue {
    Byte(u8),
    Boolean(bool),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    String(String),
    ObjectPath(Path),
    Signature(Signature),
    /// Index into the message's out-of-band file-descriptor list.
    UnixFd(u32),
}

impl BasicValue {
    pub fn get_type(&self) -> Type {
        match *self {
            BasicValue::Byte(_) => Type::Byte,
            BasicValue::Boolean(_) => Type::Boolean,
            BasicValue::Int16(_) => Type::Int16,
            BasicValue::Uint16(_) => Type::Uint16,
            BasicValue::Int32(_) => Type::Int32,
            BasicValue::Uint32(_) => Type::Uint32,
            BasicValue::Int64(_) => Type::Int64,
            BasicValue::Uint64(_) => Type::Uint64,
            BasicValue::String(_) => Type::String,
            BasicValue::ObjectPath(_) => Type::ObjectPath,
            BasicValue::Signature(_) => Type::Signature,
            BasicValue::UnixFd(_) => Type::UnixFd,
        }
    }
}

/// A struct value together with its signature, e.g. `(su)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Struct {
    pub objects: Vec<Value>,
    pub signature: Signature,
}

/// An array value.  The element signature is carried explicitly so that
/// empty arrays stay typed.
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    pub objects: Vec<Value>,
    pub element_signature: Signature,
}

impl Array {
    pub fn new_with_sig(objects: Vec<Value>, element_signature: String) -> Array {
        Array {
            objects,
            element_signature: Signature(element_signature),
        }
    }
}

/// A dictionary value (`a{..}` on the wire).
#[derive(Debug, Clone, PartialEq)]
pub struct Dictionary {
    pub map: HashMap<BasicValue, Value>,
    pub key_signature: Signature,
    pub value_signature: Signature,
}

impl Dictionary {
    pub fn new_with_sig(
        map: HashMap<BasicValue, Value>,
        key_signature: String,
        value_signature: String,
    ) -> Dictionary {
        Dictionary {
            map,
            key_signature: Signature(key_signature),
            value_signature: Signature(value_signature),
        }
    }
}

/// A variant: a value carrying its own type tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub object: Box<Value>,
    pub signature: Signature,
}

impl Variant {
    pub fn new(v: Value, sig: &str) -> Variant {
        Variant {
            object: Box::new(v),
            signature: Signature(sig.to_owned()),
        }
    }
}

/// A D-Bus value tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    BasicValue(BasicValue),
    Double(f64),
    Array(Array),
    Struct(Struct),
    Variant(Variant),
    Dictionary(Dictionary),
}

impl Value {
    pub fn get_type(&self) -> Type {
        match *self {
            Value::BasicValue(ref b) => b.get_type(),
            Value::Double(_) => Type::Double,
            Value::Array(ref a) => {
                // The element signature was validated when the array was
                // built or decoded.
                let elem = signature::parse_single(&a.element_signature.0)
                    .unwrap_or(Type::Variant);
                Type::Array(Box::new(elem))
            }
            Value::Struct(ref s) => {
                let fields = signature::parse(strip_parens(&s.signature.0)).unwrap_or_default();
                Type::Struct(fields)
            }
            Value::Variant(_) => Type::Variant,
            Value::Dictionary(ref d) => {
                let k = signature::parse_single(&d.key_signature.0).unwrap_or(Type::String);
                let v = signature::parse_single(&d.value_signature.0).unwrap_or(Type::Variant);
                Type::Array(Box::new(Type::DictEntry(Box::new(k), Box::new(v))))
            }
        }
    }

    /// Check this value against `ty`.  Runs in O(size of the value).
    pub fn typecheck(&self, ty: &Type) -> Result<(), TypeMismatch> {
        match (self, ty) {
            (Value::BasicValue(b), _) if b.get_type() == *ty => match *b {
                BasicValue::String(ref s) => check_string(s),
                BasicValue::ObjectPath(ref p) => validate_object_path(&p.0),
                BasicValue::Signature(ref s) => signature::parse(&s.0)
                    .map(|_| ())
                    .map_err(|_| TypeMismatch::BadSignatureValue(s.0.clone())),
                _ => Ok(()),
            },
            (Value::Double(_), Type::Double) => Ok(()),
            (Value::Array(a), Type::Array(elem)) => {
                if a.element_signature.0 != elem.to_signature() {
                    return Err(TypeMismatch::Mismatch {
                        expected: ty.to_signature(),
                        found: self.get_type().to_signature(),
                    });
                }
                for v in &a.objects {
                    v.typecheck(elem)?;
                }
                Ok(())
            }
            (Value::Struct(s), Type::Struct(fields)) => {
                if s.objects.len() != fields.len() {
                    return Err(TypeMismatch::Mismatch {
                        expected: ty.to_signature(),
                        found: self.get_type().to_signature(),
                    });
                }
                for (v, t) in s.objects.iter().zip(fields) {
                    v.typecheck(t)?;
                }
                Ok(())
            }
            (Value::Variant(var), Type::Variant) => {
                let inner = signature::parse_single(&var.signature.0)
                    .map_err(|_| TypeMismatch::BadSignatureValue(var.signature.0.clone()))?;
                var.object.typecheck(&inner)
            }
            (Value::Dictionary(d), Type::Array(elem)) => {
                if let Type::DictEntry(ref k, ref v) = **elem {
                    for (key, val) in &d.map {
                        Value::BasicValue(key.clone()).typecheck(k)?;
                        val.typecheck(v)?;
                    }
                    Ok(())
                } else {
                    Err(TypeMismatch::Mismatch {
                        expected: ty.to_signature(),
                        found: self.get_type().to_signature(),
                    })
                }
            }
            _ => Err(TypeMismatch::Mismatch {
                expected: ty.to_signature(),
                found: self.get_type().to_signature(),
            }),
        }
    }
}

fn strip_parens(s: &str) -> &str {
    s.strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .unwrap_or(s)
}

fn check_string(s: &str) -> Result<(), TypeMismatch> {
    if s.contains('\0') {
        Err(TypeMismatch::EmbeddedNul)
    } else {
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeMismatch {
    #[error("expected {expected}, found {found}")]
    Mismatch { expected: String, found: String },
    #[error("string contains an embedded NUL")]
    EmbeddedNul,
    #[error("invalid object path `{0}`")]
    BadObjectPath(String),
    #[error("invalid signature value `{0}`")]
    BadSignatureValue(String),
    #[error("invalid name `{0}`")]
    BadName(String),
}

impl From<u8> for Value {
    fn from(x: u8) -> Value {
        Value::BasicValue(BasicValue::Byte(x))
    }
}
impl From<bool> for Value {
    fn from(x: bool) -> Value {
        Value::BasicValue(BasicValue::Boolean(x))
    }
}
impl From<i16> for Value {
    fn from(x: i16) -> Value {
        Value::BasicValue(BasicValue::Int16(x))
    }
}
impl From<u16> for Value {
    fn from(x: u16) -> Value {
        Value::BasicValue(BasicValue::Uint16(x))
    }
}
impl From<i32> for Value {
    fn from(x: i32) -> Value {
        Value::BasicValue(BasicValue::Int32(x))
    }
}
impl From<u32> for Value {
    fn from(x: u32) -> Value {
        Value::BasicValue(BasicValue::Uint32(x))
    }
}
impl From<i64> for Value {
    fn from(x: i64) -> Value {
        Value::BasicValue(BasicValue::Int64(x))
    }
}
impl From<u64> for Value {
    fn from(x: u64) -> Value {
        Value::BasicValue(BasicValue::Uint64(x))
    }
}
impl From<f64> for Value {
    fn from(x: f64) -> Value {
        Value::Double(x)
    }
}
impl From<&str> for Value {
    fn from(x: &str) -> Value {
        Value::BasicValue(BasicValue::String(x.to_owned()))
    }
}
impl From<String> for Value {
    fn from(x: String) -> Value {
        Value::BasicValue(BasicValue::String(x))
    }
}
impl From<Path> for Value {
    fn from(x: Path) -> Value {
        Value::BasicValue(BasicValue::ObjectPath(x))
    }
}

impl<'a> TryFrom<&'a Value> for &'a str {
    type Error = TypeMismatch;
    fn try_from(v: &'a Value) -> Result<&'a str, TypeMismatch> {
        match *v {
            Value::BasicValue(BasicValue::String(ref s)) => Ok(s),
            _ => Err(TypeMismatch::Mismatch {
                expected: "s".to_owned(),
                found: v.get_type().to_signature(),
            }),
        }
    }
}

impl TryFrom<&Value> for u32 {
    type Error = TypeMismatch;
    fn try_from(v: &Value) -> Result<u32, TypeMismatch> {
        match *v {
            Value::BasicValue(BasicValue::Uint32(x)) => Ok(x),
            _ => Err(TypeMismatch::Mismatch {
                expected: "u".to_owned(),
                found: v.get_type().to_signature(),
            }),
        }
    }
}

impl TryFrom<&Value> for bool {
    type Error = TypeMismatch;
    fn try_from(v: &Value) -> Result<bool, TypeMismatch> {
        match *v {
            Value::BasicValue(BasicValue::Boolean(x)) => Ok(x),
            _ => Err(TypeMismatch::Mismatch {
                expected: "b".to_owned(),
                found: v.get_type().to_signature(),
            }),
        }
    }
}

/// Matches `(/[A-Za-z0-9_]+)+` or the literal `/`.
pub fn validate_object_path(s: &str) -> Result<(), TypeMismatch> {
    if s == "/" {
        return Ok(());
    }
    if !s.starts_with('/') || s.ends_with('/') {
        return Err(TypeMismatch::BadObjectPath(s.to_owned()));
    }
    for segment in s[1..].split('/') {
        if segment.is_empty()
            || !segment
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            return Err(TypeMismatch::BadObjectPath(s.to_owned()));
        }
    }
    Ok(())
}

fn valid_name_segment(s: &str) -> bool {
    let mut bytes = s.bytes();
    match bytes.next() {
        Some(b) if b.is_ascii_alphabetic() || b == b'_' || b == b'-' => {}
        _ => return false,
    }
    bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Interface names: dot-joined segments, at least two, total length <= 255.
pub fn validate_interface_name(s: &str) -> Result<(), TypeMismatch> {
    if s.len() > 255 {
        return Err(TypeMismatch::BadName(s.to_owned()));
    }
    let segments: Vec<&str> = s.split('.').collect();
    if segments.len() < 2 || !segments.iter().all(|seg| valid_name_segment(seg)) {
        return Err(TypeMismatch::BadName(s.to_owned()));
    }
    Ok(())
}

/// Bus names: either a unique name beginning with `:` or a well-known name
/// following the interface grammar.
pub fn validate_bus_name(s: &str) -> Result<(), TypeMismatch> {
    if s.len() > 255 {
        return Err(TypeMismatch::BadName(s.to_owned()));
    }
    if let Some(rest) = s.strip_prefix(':') {
        let segments: Vec<&str> = rest.split('.').collect();
        if segments.len() < 2
            || !segments.iter().all(|seg| {
                !seg.is_empty()
                    && seg
                        .bytes()
                        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
            })
        {
            return Err(TypeMismatch::BadName(s.to_owned()));
        }
        return Ok(());
    }
    validate_interface_name(s)
}

/// Member names: a single name segment, length <= 255.
pub fn validate_member_name(s: &str) -> Result<(), TypeMismatch> {
    if s.len() > 255 || !valid_name_segment(s) {
        return Err(TypeMismatch::BadName(s.to_owned()));
    }
    Ok(())
}

/// Error names follow the interface grammar.
pub fn validate_error_name(s: &str) -> Result<(), TypeMismatch> {
    validate_interface_name(s)
}
