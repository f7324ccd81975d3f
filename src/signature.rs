//! Parsing and serializing of D-Bus type signatures.
//!
//! A signature is a string of type codes where each top-level element
//! denotes one complete type.  The grammar is enforced here: dict entries
//! only directly inside arrays, balanced parens and braces, bounded
//! nesting, total length at most 255 bytes.

use thiserror::Error;

use crate::types::Type;

pub const MAX_SIGNATURE_LEN: usize = 255;
/// Nesting bounds from the protocol: 32 levels of arrays, 32 of structs,
/// 64 combined.
pub const MAX_ARRAY_DEPTH: usize = 32;
pub const MAX_STRUCT_DEPTH: usize = 32;
pub const MAX_TOTAL_DEPTH: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature longer than {MAX_SIGNATURE_LEN} bytes")]
    TooLong,
    #[error("unknown type code `{0}`")]
    UnknownTypeCode(char),
    #[error("unbalanced parentheses or braces")]
    MismatchedParens,
    #[error("empty struct")]
    EmptyStruct,
    #[error("dict entry not directly inside an array")]
    MisplacedDictEntry,
    #[error("dict entry key must be a basic type")]
    NonBasicDictKey,
    #[error("dict entry must contain exactly two types")]
    BadDictEntry,
    #[error("array has no element type")]
    MissingArrayElement,
    #[error("nesting deeper than the protocol allows")]
    DepthExceeded,
    #[error("expected exactly one complete type")]
    NotSingleType,
}

struct Parser<'a> {
    rest: &'a [u8],
    array_depth: usize,
    struct_depth: usize,
}

impl<'a> Parser<'a> {
    fn next(&mut self) -> Option<u8> {
        let (&c, rest) = self.rest.split_first()?;
        self.rest = rest;
        Some(c)
    }

    fn peek(&self) -> Option<u8> {
        self.rest.first().copied()
    }

    fn check_depth(&self) -> Result<(), SignatureError> {
        if self.array_depth > MAX_ARRAY_DEPTH
            || self.struct_depth > MAX_STRUCT_DEPTH
            || self.array_depth + self.struct_depth > MAX_TOTAL_DEPTH
        {
            Err(SignatureError::DepthExceeded)
        } else {
            Ok(())
        }
    }

    /// Parse one complete type.  `in_array` permits a dict entry as the
    /// immediate element.
    fn parse_one(&mut self, in_array: bool) -> Result<Type, SignatureError> {
        let c = self.next().ok_or(SignatureError::MismatchedParens)?;
        match c {
            b'y' => Ok(Type::Byte),
            b'b' => Ok(Type::Boolean),
            b'n' => Ok(Type::Int16),
            b'q' => Ok(Type::Uint16),
            b'i' => Ok(Type::Int32),
            b'u' => Ok(Type::Uint32),
            b'x' => Ok(Type::Int64),
            b't' => Ok(Type::Uint64),
            b'd' => Ok(Type::Double),
            b's' => Ok(Type::String),
            b'o' => Ok(Type::ObjectPath),
            b'g' => Ok(Type::Signature),
            b'h' => Ok(Type::UnixFd),
            b'v' => Ok(Type::Variant),
            b'a' => {
                self.array_depth += 1;
                self.check_depth()?;
                if self.peek().is_none() {
                    return Err(SignatureError::MissingArrayElement);
                }
                let elem = self.parse_one(true)?;
                self.array_depth -= 1;
                Ok(Type::Array(Box::new(elem)))
            }
            b'(' => {
                self.struct_depth += 1;
                self.check_depth()?;
                let mut fields = Vec::new();
                loop {
                    match self.peek() {
                        Some(b')') => {
                            self.next();
                            break;
                        }
                        Some(_) => fields.push(self.parse_one(false)?),
                        None => return Err(SignatureError::MismatchedParens),
                    }
                }
                self.struct_depth -= 1;
                if fields.is_empty() {
                    return Err(SignatureError::EmptyStruct);
                }
                Ok(Type::Struct(fields))
            }
            b'{' => {
                if !in_array {
                    return Err(SignatureError::MisplacedDictEntry);
                }
                self.struct_depth += 1;
                self.check_depth()?;
                let key = self.parse_one(false)?;
                if !key.is_basic() {
                    return Err(SignatureError::NonBasicDictKey);
                }
                let value = self.parse_one(false)?;
                match self.next() {
                    Some(b'}') => {}
                    Some(_) => return Err(SignatureError::BadDictEntry),
                    None => return Err(SignatureError::MismatchedParens),
                }
                self.struct_depth -= 1;
                Ok(Type::DictEntry(Box::new(key), Box::new(value)))
            }
            b')' | b'}' => Err(SignatureError::MismatchedParens),
            other => Err(SignatureError::UnknownTypeCode(other as char)),
        }
    }
}

/// Parse a signature string into its sequence of complete types.
pub fn parse(s: &str) -> Result<Vec<Type>, SignatureError> {
    if s.len() > MAX_SIGNATURE_LEN {
        return Err(SignatureError::TooLong);
    }
    let mut p = Parser {
        rest: s.as_bytes(),
        array_depth: 0,
        struct_depth: 0,
    };
    let mut types = Vec::new();
    while p.peek().is_some() {
        types.push(p.parse_one(false)?);
    }
    Ok(types)
}

/// Parse a signature that must denote exactly one complete type.
pub fn parse_single(s: &str) -> Result<Type, SignatureError> {
    let mut types = parse(s)?;
    if types.len() != 1 {
        return Err(SignatureError::NotSingleType);
    }
    Ok(types.remove(0))
}

/// Serialize a sequence of types back to a signature string.
pub fn serialize(types: &[Type]) -> String {
    let mut out = String::new();
    for t in types {
        out.push_str(&t.to_signature());
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_basic() {
        assert_eq!(parse("u").unwrap(), vec![Type::Uint32]);
        assert_eq!(
            parse("sus").unwrap(),
            vec![Type::String, Type::Uint32, Type::String]
        );
        assert_eq!(parse("").unwrap(), vec![]);
    }

    #[test]
    fn test_containers() {
        assert_eq!(
            parse("au").unwrap(),
            vec![Type::Array(Box::new(Type::Uint32))]
        );
        assert_eq!(
            parse("(su)").unwrap(),
            vec![Type::Struct(vec![Type::String, Type::Uint32])]
        );
        assert_eq!(
            parse("a{sv}").unwrap(),
            vec![Type::Array(Box::new(Type::DictEntry(
                Box::new(Type::String),
                Box::new(Type::Variant)
            )))]
        );
        parse("aa{s(iu)}").unwrap();
    }

    #[test]
    fn test_round_trip() {
        for sig in ["", "y", "a{sv}", "(yv)", "aas", "a(yv)", "ha{us}x", "v"] {
            assert_eq!(serialize(&parse(sig).unwrap()), sig);
        }
    }

    #[test]
    fn test_rejects() {
        assert_eq!(parse("z").unwrap_err(), SignatureError::UnknownTypeCode('z'));
        assert_eq!(parse("(").unwrap_err(), SignatureError::MismatchedParens);
        assert_eq!(parse("()").unwrap_err(), SignatureError::EmptyStruct);
        assert_eq!(parse("{sv}").unwrap_err(), SignatureError::MisplacedDictEntry);
        assert_eq!(parse("a{vs}").unwrap_err(), SignatureError::NonBasicDictKey);
        assert_eq!(parse("a{syv}").unwrap_err(), SignatureError::BadDictEntry);
        assert_eq!(parse("a").unwrap_err(), SignatureError::MissingArrayElement);
        parse("(s))").unwrap_err();
    }

    #[test]
    fn test_depth_limits() {
        let deep_array = "a".repeat(33) + "u";
        assert_eq!(parse(&deep_array).unwrap_err(), SignatureError::DepthExceeded);
        let ok_array = "a".repeat(32) + "u";
        parse(&ok_array).unwrap();

        let deep_struct = "(".repeat(33) + "u" + &")".repeat(33);
        assert_eq!(parse(&deep_struct).unwrap_err(), SignatureError::DepthExceeded);
    }

    #[test]
    fn test_length_limit() {
        let long = "u".repeat(256);
        assert_eq!(parse(&long).unwrap_err(), SignatureError::TooLong);
        parse(&"u".repeat(255)).unwrap();
    }

    #[test]
    fn test_single() {
        parse_single("a{sv}").unwrap();
        assert_eq!(parse_single("uu").unwrap_err(), SignatureError::NotSingleType);
        assert_eq!(parse_single("").unwrap_err(), SignatureError::NotSingleType);
    }
}
