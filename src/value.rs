//! A small, closed typed-value model.
//!
//! This plays the role that the spec assigns to an external "Value & Signature model"
//! collaborator (see `DESIGN.md`). It is intentionally not a generic serde-based type
//! system: it covers exactly the D-Bus basic and container types the connection engine
//! needs to move method arguments, signal payloads, and header fields around.

use std::{error, fmt, result, str};

/// A typed D-Bus value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(u8),
    Bool(bool),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F64(f64),
    Str(String),
    ObjectPath(String),
    Signature(String),
    /// An array of elements sharing a single element signature.
    Array(String, Vec<Value>),
    Struct(Vec<Value>),
    Variant(Box<Value>),
}

impl Value {
    /// The D-Bus signature character(s) for this value.
    pub fn signature(&self) -> String {
        match self {
            Value::Byte(_) => "y".into(),
            Value::Bool(_) => "b".into(),
            Value::I16(_) => "n".into(),
            Value::U16(_) => "q".into(),
            Value::I32(_) => "i".into(),
            Value::U32(_) => "u".into(),
            Value::I64(_) => "x".into(),
            Value::U64(_) => "t".into(),
            Value::F64(_) => "d".into(),
            Value::Str(_) => "s".into(),
            Value::ObjectPath(_) => "o".into(),
            Value::Signature(_) => "g".into(),
            Value::Array(elem_sig, _) => format!("a{}", elem_sig),
            Value::Struct(fields) => {
                let mut s = String::from("(");
                for f in fields {
                    s.push_str(&f.signature());
                }
                s.push(')');
                s
            }
            Value::Variant(_) => "v".into(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::ObjectPath(s) | Value::Signature(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(_, values) => Some(values),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::U32(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// The signature of a whole argument list (body), i.e. the concatenation of each
/// top-level value's own signature -- *not* wrapped in `(...)`.
pub fn body_signature(values: &[Value]) -> String {
    values.iter().map(Value::signature).collect()
}

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    IncorrectType,
    Utf8(str::Utf8Error),
    InsufficientData,
    PaddingNotZero,
    InvalidSignature(String),
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Utf8(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => e.fmt(f),
            Error::IncorrectType => write!(f, "incorrect type"),
            Error::Utf8(e) => write!(f, "{}", e),
            Error::InsufficientData => write!(f, "insufficient data"),
            Error::PaddingNotZero => write!(f, "non-zero padding byte(s)"),
            Error::InvalidSignature(s) => write!(f, "invalid signature: {}", s),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<str::Utf8Error> for Error {
    fn from(e: str::Utf8Error) -> Self {
        Error::Utf8(e)
    }
}

/// Alias for a `Result` with the error type [`Error`].
pub type Result<T> = result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_signatures() {
        assert_eq!(Value::Str("x".into()).signature(), "s");
        assert_eq!(Value::U32(1).signature(), "u");
        assert_eq!(Value::ObjectPath("/a".into()).signature(), "o");
        assert_eq!(Value::Signature("s".into()).signature(), "g");
    }

    #[test]
    fn array_signature() {
        let arr = Value::Array("s".into(), vec![Value::Str("a".into())]);
        assert_eq!(arr.signature(), "as");
    }

    #[test]
    fn struct_signature() {
        let s = Value::Struct(vec![Value::U32(1), Value::Str("a".into())]);
        assert_eq!(s.signature(), "(us)");
    }

    #[test]
    fn body_signature_concatenates_without_parens() {
        let body = vec![Value::Str("a".into()), Value::U32(1)];
        assert_eq!(body_signature(&body), "su");
    }
}
