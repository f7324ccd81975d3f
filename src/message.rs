//! Functions for creating and modifying messages to send across the message bus.

use std::os::fd::OwnedFd;

use thiserror::Error;

use crate::demarshal::{demarshal_body, Demarshaller, DemarshalError};
use crate::marshal::{Endianness, Marshal, Marshaller};
use crate::types::{
    validate_bus_name, validate_error_name, validate_interface_name, validate_member_name,
    BasicValue, Path, Signature, Type, TypeMismatch, Value, Variant,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageType(pub u8);
pub const MESSAGE_TYPE_INVALID: MessageType = MessageType(0);
pub const MESSAGE_TYPE_METHOD_CALL: MessageType = MessageType(1);
pub const MESSAGE_TYPE_METHOD_RETURN: MessageType = MessageType(2);
pub const MESSAGE_TYPE_ERROR: MessageType = MessageType(3);
pub const MESSAGE_TYPE_SIGNAL: MessageType = MessageType(4);

pub const HEADER_FIELD_INVALID: u8 = 0;
pub const HEADER_FIELD_PATH: u8 = 1;
pub const HEADER_FIELD_INTERFACE: u8 = 2;
pub const HEADER_FIELD_MEMBER: u8 = 3;
pub const HEADER_FIELD_ERROR_NAME: u8 = 4;
pub const HEADER_FIELD_REPLY_SERIAL: u8 = 5;
pub const HEADER_FIELD_DESTINATION: u8 = 6;
pub const HEADER_FIELD_SENDER: u8 = 7;
pub const HEADER_FIELD_SIGNATURE: u8 = 8;
pub const HEADER_FIELD_UNIX_FDS: u8 = 9;

pub const FLAGS_NO_REPLY_EXPECTED: u8 = 1;
pub const FLAGS_NO_AUTO_START: u8 = 2;
pub const FLAGS_ALLOW_INTERACTIVE_AUTHORIZATION: u8 = 4;

pub const PROTOCOL_VERSION: u8 = 1;

/// Total encoded size of a message may not exceed 128 MiB.
pub const MAX_MESSAGE_SIZE: usize = 128 * 1024 * 1024;

/// The fixed header is 12 bytes; the following 4 bytes hold the header
/// field array's byte-length, so 16 bytes tell a reader how much to fetch.
pub const FIXED_HEADER_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("first header byte is neither 'l' nor 'B'")]
    BadEndianness,
    #[error("unknown message type {0}")]
    BadMessageType(u8),
    #[error("unsupported protocol version {0}")]
    BadProtocolVersion(u8),
    #[error("message serial is zero")]
    ZeroSerial,
    #[error("message exceeds the 128 MiB bound")]
    MessageTooBig,
    #[error("required header field `{0}` is missing")]
    MissingRequiredField(&'static str),
    #[error("header field `{0}` is forbidden for this message kind")]
    ForbiddenField(&'static str),
    #[error("header field code {0} appears more than once")]
    DuplicateField(u8),
    #[error("header field code {0} carries a value of the wrong type")]
    BadFieldType(u8),
    #[error("message framing does not add up")]
    BadFraming,
    #[error("fewer file descriptors arrived than the header announced")]
    MissingUnixFds,
    #[error("body does not match the declared signature")]
    BodyMismatch,
    #[error(transparent)]
    Demarshal(#[from] DemarshalError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeaderField(pub u8, pub Variant);

impl Marshal for HeaderField {
    fn dbus_encode(&self, buf: &mut Marshaller) {
        buf.pad_to_multiple(8);
        self.0.dbus_encode(buf);
        self.1.dbus_encode(buf);
    }
    fn get_type(&self) -> String {
        "(yv)".to_owned()
    }
}

/// One D-Bus message: the four header words, the header field list, the
/// encoded body, and any file descriptors travelling out of band.
#[derive(Debug)]
pub struct Message {
    pub endianness: Endianness,
    pub message_type: MessageType,
    pub flags: u8,
    pub version: u8,
    pub serial: u32,
    pub headers: Vec<HeaderField>,
    pub body: Vec<u8>,
    pub fds: Vec<OwnedFd>,
}

impl Message {
    fn empty(message_type: MessageType) -> Message {
        Message {
            endianness: Endianness::Little,
            message_type,
            flags: 0,
            version: PROTOCOL_VERSION,
            serial: 0,
            headers: Vec::new(),
            body: Vec::new(),
            fds: Vec::new(),
        }
    }
}

/// Create a Message for a D-Bus method call.  Once a Message is created,
/// arguments can be added with `Message::add_arg`.
pub fn create_method_call(
    dest: &str,
    path: &str,
    iface: &str,
    method: &str,
) -> Result<Message, TypeMismatch> {
    validate_bus_name(dest)?;
    validate_member_name(method)?;
    let mut msg = Message::empty(MESSAGE_TYPE_METHOD_CALL)
        .add_header(HEADER_FIELD_DESTINATION, Variant::new(Value::from(dest), "s"))
        .add_header(
            HEADER_FIELD_PATH,
            Variant::new(Value::from(Path::new(path)?), "o"),
        );
    if !iface.is_empty() {
        validate_interface_name(iface)?;
        msg = msg.add_header(HEADER_FIELD_INTERFACE, Variant::new(Value::from(iface), "s"));
    }
    Ok(msg.add_header(HEADER_FIELD_MEMBER, Variant::new(Value::from(method), "s")))
}

/// Create a Message for a D-Bus method return.  Return values can be added
/// with `Message::add_arg`.
pub fn create_method_return(reply_serial: u32) -> Message {
    Message::empty(MESSAGE_TYPE_METHOD_RETURN).add_header(
        HEADER_FIELD_REPLY_SERIAL,
        Variant::new(Value::from(reply_serial), "u"),
    )
}

/// Create a Message for a D-Bus error reply.
pub fn create_error(error_name: &str, reply_serial: u32) -> Result<Message, TypeMismatch> {
    validate_error_name(error_name)?;
    Ok(Message::empty(MESSAGE_TYPE_ERROR)
        .add_header(
            HEADER_FIELD_REPLY_SERIAL,
            Variant::new(Value::from(reply_serial), "u"),
        )
        .add_header(
            HEADER_FIELD_ERROR_NAME,
            Variant::new(Value::from(error_name), "s"),
        ))
}

/// Create a Message for a D-Bus signal.
pub fn create_signal(path: &str, interface: &str, member: &str) -> Result<Message, TypeMismatch> {
    validate_interface_name(interface)?;
    validate_member_name(member)?;
    Ok(Message::empty(MESSAGE_TYPE_SIGNAL)
        .add_header(
            HEADER_FIELD_PATH,
            Variant::new(Value::from(Path::new(path)?), "o"),
        )
        .add_header(HEADER_FIELD_INTERFACE, Variant::new(Value::from(interface), "s"))
        .add_header(HEADER_FIELD_MEMBER, Variant::new(Value::from(member), "s")))
}

impl Message {
    /// Add the given argument to the Message.  Accepts anything that
    /// implements the Marshal trait, which is most basic types, as well as
    /// the general-purpose [`Value`] enum.
    ///
    /// Calls can be chained together to add multiple arguments.
    pub fn add_arg(mut self, arg: &dyn Marshal) -> Message {
        if self.get_header(HEADER_FIELD_SIGNATURE).is_none() {
            let value = Value::BasicValue(BasicValue::Signature(Signature(String::new())));
            self = self.add_header(HEADER_FIELD_SIGNATURE, Variant::new(value, "g"));
        }
        if let Some(existing) = self.signature_mut() {
            existing.push_str(&arg.get_type());
        }
        let mut m = Marshaller::new(self.endianness);
        m.put_bytes(&self.body);
        arg.dbus_encode(&mut m);
        self.body = m.into_bytes();
        self
    }

    /// Attach a file descriptor and add the `unix_fd` index argument
    /// referencing it.
    pub fn add_fd(mut self, fd: OwnedFd) -> Message {
        let idx = self.fds.len() as u32;
        self.fds.push(fd);
        self = self.add_arg(&BasicValue::UnixFd(idx));
        let n = self.fds.len() as u32;
        if self.get_header(HEADER_FIELD_UNIX_FDS).is_none() {
            return self.add_header(HEADER_FIELD_UNIX_FDS, Variant::new(Value::from(n), "u"));
        }
        if let Some(v) = self.get_header_mut(HEADER_FIELD_UNIX_FDS) {
            *v = Variant::new(Value::from(n), "u");
        }
        self
    }

    pub fn add_header(mut self, name: u8, val: Variant) -> Message {
        self.headers.push(HeaderField(name, val));
        self
    }

    pub fn get_header(&self, name: u8) -> Option<&Variant> {
        self.headers.iter().find(|x| x.0 == name).map(|x| &x.1)
    }

    pub fn get_header_mut(&mut self, name: u8) -> Option<&mut Variant> {
        self.headers
            .iter_mut()
            .find(|x| x.0 == name)
            .map(|x| &mut x.1)
    }

    fn signature_mut(&mut self) -> Option<&mut String> {
        let v = self.get_header_mut(HEADER_FIELD_SIGNATURE)?;
        match *v.object {
            Value::BasicValue(BasicValue::Signature(ref mut s)) => Some(&mut s.0),
            _ => None,
        }
    }

    fn header_str(&self, name: u8) -> Option<&str> {
        match self.get_header(name)?.object.as_ref() {
            Value::BasicValue(BasicValue::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn path(&self) -> Option<&str> {
        match self.get_header(HEADER_FIELD_PATH)?.object.as_ref() {
            Value::BasicValue(BasicValue::ObjectPath(p)) => Some(&p.0),
            _ => None,
        }
    }

    pub fn interface(&self) -> Option<&str> {
        self.header_str(HEADER_FIELD_INTERFACE)
    }

    pub fn member(&self) -> Option<&str> {
        self.header_str(HEADER_FIELD_MEMBER)
    }

    pub fn error_name(&self) -> Option<&str> {
        self.header_str(HEADER_FIELD_ERROR_NAME)
    }

    pub fn destination(&self) -> Option<&str> {
        self.header_str(HEADER_FIELD_DESTINATION)
    }

    pub fn sender(&self) -> Option<&str> {
        self.header_str(HEADER_FIELD_SENDER)
    }

    pub fn reply_serial(&self) -> Option<u32> {
        match self.get_header(HEADER_FIELD_REPLY_SERIAL)?.object.as_ref() {
            Value::BasicValue(BasicValue::Uint32(x)) => Some(*x),
            _ => None,
        }
    }

    pub fn unix_fds(&self) -> Option<u32> {
        match self.get_header(HEADER_FIELD_UNIX_FDS)?.object.as_ref() {
            Value::BasicValue(BasicValue::Uint32(x)) => Some(*x),
            _ => None,
        }
    }

    pub fn body_signature(&self) -> Option<&str> {
        match self.get_header(HEADER_FIELD_SIGNATURE)?.object.as_ref() {
            Value::BasicValue(BasicValue::Signature(s)) => Some(&s.0),
            _ => None,
        }
    }

    pub fn no_reply_expected(&self) -> bool {
        self.flags & FLAGS_NO_REPLY_EXPECTED != 0
    }

    /// Get the sequence of Values out of a Message.  Returns None if the
    /// message has no body.
    pub fn get_body(&self) -> Result<Option<Vec<Value>>, DemarshalError> {
        if self.body.is_empty() {
            return Ok(None);
        }
        let sig = match self.body_signature() {
            Some(s) => s.to_owned(),
            None => return Ok(None),
        };
        demarshal_body(&self.body, self.endianness, &sig).map(Some)
    }

    /// Enforce the required/forbidden header field table for this kind.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.serial == 0 {
            return Err(ProtocolError::ZeroSerial);
        }
        if self.version != PROTOCOL_VERSION {
            return Err(ProtocolError::BadProtocolVersion(self.version));
        }
        let required: &[(&'static str, bool)] = match self.message_type {
            MESSAGE_TYPE_METHOD_CALL => &[
                ("path", true),
                ("member", true),
                ("reply_serial", false),
                ("error_name", false),
            ],
            MESSAGE_TYPE_METHOD_RETURN => &[
                ("reply_serial", true),
                ("member", false),
                ("error_name", false),
            ],
            MESSAGE_TYPE_ERROR => &[
                ("error_name", true),
                ("reply_serial", true),
                ("member", false),
            ],
            MESSAGE_TYPE_SIGNAL => &[
                ("path", true),
                ("interface", true),
                ("member", true),
                ("reply_serial", false),
                ("error_name", false),
            ],
            MessageType(t) => return Err(ProtocolError::BadMessageType(t)),
        };
        for &(field, must_exist) in required {
            let present = match field {
                "path" => self.path().is_some(),
                "interface" => self.interface().is_some(),
                "member" => self.member().is_some(),
                "error_name" => self.error_name().is_some(),
                "reply_serial" => self.reply_serial().is_some(),
                _ => continue,
            };
            if must_exist && !present {
                return Err(ProtocolError::MissingRequiredField(field));
            }
            if !must_exist && present {
                return Err(ProtocolError::ForbiddenField(field));
            }
        }
        Ok(())
    }

    /// Encode the message for the wire.  The serial must have been assigned.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        self.validate()?;
        let mut m = Marshaller::new(self.endianness);
        m.put_u8(self.endianness.wire_byte());
        m.put_u8(self.message_type.0);
        m.put_u8(self.flags);
        m.put_u8(self.version);
        m.put_u32(self.body.len() as u32);
        m.put_u32(self.serial);

        let len_at = m.reserve_u32();
        let start = m.len();
        for field in &self.headers {
            field.dbus_encode(&mut m);
        }
        let fields_len = (m.len() - start) as u32;
        m.patch_u32(len_at, fields_len);
        m.pad_to_multiple(8);
        m.put_bytes(&self.body);

        let out = m.into_bytes();
        if out.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooBig);
        }
        Ok(out)
    }
}

/// The decoded 16-byte prefix: enough to know how much more to read.
#[derive(Debug, Clone, Copy)]
pub struct FixedHeader {
    pub endianness: Endianness,
    pub message_type: MessageType,
    pub flags: u8,
    pub version: u8,
    pub body_len: u32,
    pub serial: u32,
    pub fields_len: u32,
}

impl FixedHeader {
    pub fn parse(buf: &[u8; FIXED_HEADER_LEN]) -> Result<FixedHeader, ProtocolError> {
        let endianness =
            Endianness::from_wire_byte(buf[0]).ok_or(ProtocolError::BadEndianness)?;
        let message_type = MessageType(buf[1]);
        if !(1..=4).contains(&message_type.0) {
            return Err(ProtocolError::BadMessageType(message_type.0));
        }
        let version = buf[3];
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::BadProtocolVersion(version));
        }
        let mut dm = Demarshaller::with_offset(buf, endianness, 4);
        let body_len = dm.get_u32()?;
        let serial = dm.get_u32()?;
        if serial == 0 {
            return Err(ProtocolError::ZeroSerial);
        }
        let fields_len = dm.get_u32()?;
        Ok(FixedHeader {
            endianness,
            message_type,
            flags: buf[2],
            version,
            body_len,
            serial,
            fields_len,
        })
    }

    /// How many bytes follow the 16-byte prefix: the header fields padded
    /// to 8, then the body.
    pub fn rest_len(&self) -> Result<usize, ProtocolError> {
        let fields = self.fields_len as usize;
        let padded = (fields + 7) & !7;
        let total = FIXED_HEADER_LEN + padded + self.body_len as usize;
        if total > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooBig);
        }
        Ok(padded + self.body_len as usize)
    }
}

fn known_field_type(code: u8) -> Option<Type> {
    match code {
        HEADER_FIELD_PATH => Some(Type::ObjectPath),
        HEADER_FIELD_INTERFACE
        | HEADER_FIELD_MEMBER
        | HEADER_FIELD_ERROR_NAME
        | HEADER_FIELD_DESTINATION
        | HEADER_FIELD_SENDER => Some(Type::String),
        HEADER_FIELD_REPLY_SERIAL | HEADER_FIELD_UNIX_FDS => Some(Type::Uint32),
        HEADER_FIELD_SIGNATURE => Some(Type::Signature),
        _ => None,
    }
}

/// Decode a complete message frame.  `buf` holds the whole message,
/// starting at its first byte.
pub fn decode(buf: &[u8]) -> Result<Message, ProtocolError> {
    if buf.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooBig);
    }
    if buf.len() < FIXED_HEADER_LEN {
        return Err(ProtocolError::Demarshal(DemarshalError::MessageTooShort));
    }
    let mut first = [0u8; FIXED_HEADER_LEN];
    first.copy_from_slice(&buf[..FIXED_HEADER_LEN]);
    let fixed = FixedHeader::parse(&first)?;
    if buf.len() != FIXED_HEADER_LEN + fixed.rest_len()? {
        return Err(ProtocolError::BadFraming);
    }

    // The header field array starts at offset 12 (its length word) so the
    // struct elements land 8-aligned at 16.
    let mut dm = Demarshaller::with_offset(buf, fixed.endianness, 12);
    let fields_ty = Type::Array(Box::new(Type::Struct(vec![Type::Byte, Type::Variant])));
    let fields_val = dm.demarshal(&fields_ty)?;

    let mut headers = Vec::new();
    let mut seen = [false; 10];
    if let Value::Array(arr) = fields_val {
        for entry in arr.objects {
            let mut st = match entry {
                Value::Struct(st) => st,
                _ => return Err(ProtocolError::Demarshal(DemarshalError::CorruptedMessage)),
            };
            let variant = match st.objects.remove(1) {
                Value::Variant(v) => v,
                _ => return Err(ProtocolError::Demarshal(DemarshalError::CorruptedMessage)),
            };
            let code = match st.objects.remove(0) {
                Value::BasicValue(BasicValue::Byte(c)) => c,
                _ => return Err(ProtocolError::Demarshal(DemarshalError::CorruptedMessage)),
            };
            match known_field_type(code) {
                Some(expect) => {
                    if seen[code as usize] {
                        return Err(ProtocolError::DuplicateField(code));
                    }
                    seen[code as usize] = true;
                    if variant.object.get_type() != expect {
                        return Err(ProtocolError::BadFieldType(code));
                    }
                    headers.push(HeaderField(code, variant));
                }
                // Unknown codes are ignored on read.
                None => continue,
            }
        }
    } else {
        return Err(ProtocolError::Demarshal(DemarshalError::CorruptedMessage));
    }

    // Body starts at the next 8-byte boundary.
    let fields_end = dm.offset();
    let body_start = (fields_end + 7) & !7;
    if body_start + fixed.body_len as usize != buf.len() {
        return Err(ProtocolError::BadFraming);
    }
    let body = buf[body_start..].to_vec();

    let msg = Message {
        endianness: fixed.endianness,
        message_type: fixed.message_type,
        flags: fixed.flags,
        version: fixed.version,
        serial: fixed.serial,
        headers,
        body,
        fds: Vec::new(),
    };
    msg.validate()?;

    // The body must parse under its declared signature, exactly.
    if !msg.body.is_empty() {
        let sig = msg
            .body_signature()
            .ok_or(ProtocolError::MissingRequiredField("signature"))?;
        demarshal_body(&msg.body, msg.endianness, sig).map_err(|_| ProtocolError::BodyMismatch)?;
    } else if let Some(sig) = msg.body_signature() {
        if !sig.is_empty() {
            return Err(ProtocolError::BodyMismatch);
        }
    }
    Ok(msg)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_msg() {
        create_method_call("org.example.Foo", "/bar", "org.example.Baz", "floob")
            .unwrap()
            .add_arg(&1u32)
            .add_arg(&2u32);
    }

    #[test]
    fn test_bad_names() {
        create_method_call("org", "/bar", "org.example.Baz", "floob").unwrap_err();
        create_method_call("org.example.Foo", "bar", "org.example.Baz", "floob").unwrap_err();
        create_method_call("org.example.Foo", "/bar", "org.example.Baz", "flo ob").unwrap_err();
        create_signal("/x", "nodots", "Member").unwrap_err();
        create_error("org.example.Err", 1).unwrap();
        create_error("noperiod", 1).unwrap_err();
    }

    #[test]
    fn test_hello_golden() {
        // A Hello call with serial 1 encodes to exactly 128 bytes.
        let mut msg = create_method_call(
            "org.freedesktop.DBus",
            "/org/freedesktop/DBus",
            "org.freedesktop.DBus",
            "Hello",
        )
        .unwrap();
        msg.serial = 1;
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes.len(), 128);
        assert_eq!(
            &bytes[..12],
            &[0x6c, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_round_trip() {
        let mut msg = create_method_call(
            "org.freedesktop.DBus",
            "/org/freedesktop/DBus",
            "org.freedesktop.DBus",
            "RequestName",
        )
        .unwrap()
        .add_arg(&"com.example.Test")
        .add_arg(&4u32);
        msg.serial = 7;
        let bytes = msg.encode().unwrap();
        let out = decode(&bytes).unwrap();
        assert_eq!(out.message_type, MESSAGE_TYPE_METHOD_CALL);
        assert_eq!(out.serial, 7);
        assert_eq!(out.member(), Some("RequestName"));
        assert_eq!(out.destination(), Some("org.freedesktop.DBus"));
        assert_eq!(out.body_signature(), Some("su"));
        let body = out.get_body().unwrap().unwrap();
        assert_eq!(body[0], Value::from("com.example.Test"));
        assert_eq!(body[1], Value::from(4u32));
    }

    #[test]
    fn test_round_trip_big_endian() {
        let mut msg = create_signal("/org/freedesktop/DBus", "org.freedesktop.DBus", "NameLost")
            .unwrap();
        msg.endianness = Endianness::Big;
        let mut msg = msg.add_arg(&"com.example.Gone");
        msg.serial = 3;
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes[0], b'B');
        let out = decode(&bytes).unwrap();
        assert_eq!(out.endianness, Endianness::Big);
        assert_eq!(out.member(), Some("NameLost"));
        let body = out.get_body().unwrap().unwrap();
        assert_eq!(body[0], Value::from("com.example.Gone"));
    }

    #[test]
    fn test_decode_name_owner_changed() {
        let mut msg = create_signal(
            "/org/freedesktop/DBus",
            "org.freedesktop.DBus",
            "NameOwnerChanged",
        )
        .unwrap()
        .add_arg(&"com.example")
        .add_arg(&"")
        .add_arg(&":1.42");
        msg.serial = 2;
        let out = decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(out.message_type, MESSAGE_TYPE_SIGNAL);
        assert_eq!(out.path(), Some("/org/freedesktop/DBus"));
        assert_eq!(out.interface(), Some("org.freedesktop.DBus"));
        assert_eq!(out.member(), Some("NameOwnerChanged"));
        let body = out.get_body().unwrap().unwrap();
        assert_eq!(
            body,
            vec![
                Value::from("com.example"),
                Value::from(""),
                Value::from(":1.42")
            ]
        );
    }

    #[test]
    fn test_required_fields() {
        // Signal without interface.
        let mut msg = Message::empty(MESSAGE_TYPE_SIGNAL)
            .add_header(
                HEADER_FIELD_PATH,
                Variant::new(Value::from(Path::new("/x").unwrap()), "o"),
            )
            .add_header(HEADER_FIELD_MEMBER, Variant::new(Value::from("M"), "s"));
        msg.serial = 1;
        assert_eq!(
            msg.validate().unwrap_err(),
            ProtocolError::MissingRequiredField("interface")
        );

        // Method return with an error name is rejected.
        let mut msg = create_method_return(5).add_header(
            HEADER_FIELD_ERROR_NAME,
            Variant::new(Value::from("org.example.Err"), "s"),
        );
        msg.serial = 1;
        assert_eq!(
            msg.validate().unwrap_err(),
            ProtocolError::ForbiddenField("error_name")
        );
    }

    #[test]
    fn test_zero_serial_rejected() {
        let msg = create_method_return(5);
        assert_eq!(msg.validate().unwrap_err(), ProtocolError::ZeroSerial);
        assert!(msg.encode().is_err());
    }

    #[test]
    fn test_fixed_header_rejects() {
        let mut buf = [0u8; 16];
        buf[0] = b'x';
        assert_eq!(
            FixedHeader::parse(&buf).unwrap_err(),
            ProtocolError::BadEndianness
        );
        buf[0] = b'l';
        buf[1] = 9;
        assert_eq!(
            FixedHeader::parse(&buf).unwrap_err(),
            ProtocolError::BadMessageType(9)
        );
        buf[1] = 1;
        buf[3] = 2;
        assert_eq!(
            FixedHeader::parse(&buf).unwrap_err(),
            ProtocolError::BadProtocolVersion(2)
        );
        buf[3] = 1;
        // Serial zero.
        assert_eq!(
            FixedHeader::parse(&buf).unwrap_err(),
            ProtocolError::ZeroSerial
        );
    }

    #[test]
    fn test_oversize_rejected() {
        let mut buf = [0u8; 16];
        buf[0] = b'l';
        buf[1] = 1;
        buf[3] = 1;
        buf[4..8].copy_from_slice(&(u32::MAX).to_le_bytes()); // body length
        buf[8..12].copy_from_slice(&1u32.to_le_bytes()); // serial
        let fixed = FixedHeader::parse(&buf).unwrap();
        assert_eq!(fixed.rest_len().unwrap_err(), ProtocolError::MessageTooBig);
    }

    #[test]
    fn test_body_signature_mismatch() {
        // Declared signature says "u" but the body holds a string.
        let mut msg = create_method_return(9);
        msg.serial = 1;
        let mut msg = msg.add_arg(&"text");
        match msg.signature_mut() {
            Some(s) => {
                s.clear();
                s.push('u');
            }
            None => panic!("signature header missing"),
        }
        let bytes = msg.encode().unwrap();
        assert_eq!(decode(&bytes).unwrap_err(), ProtocolError::BodyMismatch);
    }

    #[test]
    fn test_duplicate_field_rejected() {
        let mut msg = create_method_return(9).add_header(
            HEADER_FIELD_REPLY_SERIAL,
            Variant::new(Value::from(9u32), "u"),
        );
        msg.serial = 4;
        let bytes = msg.encode().unwrap();
        assert_eq!(
            decode(&bytes).unwrap_err(),
            ProtocolError::DuplicateField(HEADER_FIELD_REPLY_SERIAL)
        );
    }

    #[test]
    fn test_unknown_field_ignored() {
        let mut msg = create_method_return(9)
            .add_header(200, Variant::new(Value::from("future"), "s"));
        msg.serial = 4;
        let out = decode(&msg.encode().unwrap()).unwrap();
        assert!(out.get_header(200).is_none());
        assert_eq!(out.reply_serial(), Some(9));
    }
}
