//! Parsed value trees shared by all response decoders.
//!
//! Everything string-shaped on the wire collapses into [`Payload`]:
//! quoted strings and small literals are held in memory, oversized
//! literals are represented by the [`StreamHandle`] their chunks were
//! delivered under. `NIL` stays distinct from the empty string: an
//! absent value is `Value::Nil` (or `None` through the typed accessors),
//! never `Payload::Inline(b"")`.

use std::collections::HashMap;

use bytes::Bytes;

use crate::error::ParseError;

/// Identifier of a literal that was streamed to the registered sink
/// instead of being buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub u64);

/// A string value from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Quoted string or literal small enough to keep in memory.
    Inline(Bytes),
    /// Literal handed off chunk-by-chunk; only the handle and length remain.
    Stream {
        /// Handle the chunks were delivered under.
        handle: StreamHandle,
        /// Total payload length in bytes.
        len: usize,
    },
}

impl Payload {
    /// The bytes, if they were kept in memory.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Inline(b) => Some(b),
            Payload::Stream { .. } => None,
        }
    }

    /// The in-memory bytes decoded as UTF-8.
    pub fn to_str(&self) -> Result<&str, ParseError> {
        let bytes = self.as_bytes().ok_or(ParseError::DataNotUtf8)?;
        std::str::from_utf8(bytes).map_err(|_| ParseError::DataNotUtf8)
    }

    /// Payload length in bytes, streamed or not.
    pub fn len(&self) -> usize {
        match self {
            Payload::Inline(b) => b.len(),
            Payload::Stream { len, .. } => *len,
        }
    }

    /// True for a zero-length payload.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn inline(bytes: impl Into<Bytes>) -> Self {
        Payload::Inline(bytes.into())
    }
}

/// One node of the S-expression-shaped data inside a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// The atom `NIL`: an absent string, number or list.
    Nil,
    /// An unsigned number.
    Number(u64),
    /// An unquoted atom, flags included (`\Seen`).
    Atom(String),
    /// A quoted string or literal.
    Str(Payload),
    /// A parenthesized group.
    List(Vec<Value>),
}

impl Value {
    /// Borrow the payload of a string value.
    pub fn as_payload(&self) -> Option<&Payload> {
        match self {
            Value::Str(p) => Some(p),
            _ => None,
        }
    }

    /// Borrow the elements of a list value.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// The numeric value, if this is a number.
    pub fn as_number(&self) -> Option<u64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// True for `NIL`.
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Decode a string-or-NIL position into an owned string.
    ///
    /// Atoms are accepted where sloppy servers send them unquoted.
    pub fn to_nstring(&self) -> Result<Option<String>, ParseError> {
        match self {
            Value::Nil => Ok(None),
            Value::Str(p) => p.to_str().map(|s| Some(s.to_string())),
            Value::Atom(a) => Ok(Some(a.clone())),
            other => Err(unexpected("string or NIL", other)),
        }
    }
}

/// Decode a positional parameter list (`("CHARSET" "US-ASCII" ...)` or
/// `NIL`) into a key/value map. Keys compare case-insensitively and are
/// stored uppercased.
pub(crate) fn params_from_value(value: &Value) -> Result<HashMap<String, String>, ParseError> {
    let mut map = HashMap::new();
    let items = match value {
        Value::Nil => return Ok(map),
        Value::List(items) => items,
        other => return Err(unexpected("parameter list or NIL", other)),
    };
    let mut iter = items.iter();
    while let Some(key) = iter.next() {
        let key = key
            .to_nstring()?
            .ok_or_else(|| unexpected("parameter name", key))?;
        let value = match iter.next() {
            Some(v) => v.to_nstring()?.unwrap_or_default(),
            None => String::new(),
        };
        map.insert(key.to_ascii_uppercase(), value);
    }
    Ok(map)
}

pub(crate) fn unexpected(expected: &'static str, got: &Value) -> ParseError {
    ParseError::UnexpectedToken {
        expected,
        got: format!("{got:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_and_empty_string_stay_distinct() {
        let nil = Value::Nil;
        let empty = Value::Str(Payload::inline(&b""[..]));
        assert_eq!(nil.to_nstring().unwrap(), None);
        assert_eq!(empty.to_nstring().unwrap(), Some(String::new()));
    }

    #[test]
    fn params_pair_up_positionally() {
        let value = Value::List(vec![
            Value::Str(Payload::inline(&b"charset"[..])),
            Value::Str(Payload::inline(&b"US-ASCII"[..])),
            Value::Str(Payload::inline(&b"FORMAT"[..])),
            Value::Str(Payload::inline(&b"flowed"[..])),
        ]);
        let params = params_from_value(&value).unwrap();
        assert_eq!(params["CHARSET"], "US-ASCII");
        assert_eq!(params["FORMAT"], "flowed");
    }

    #[test]
    fn streamed_payload_reports_length_only() {
        let p = Payload::Stream {
            handle: StreamHandle(7),
            len: 1 << 20,
        };
        assert_eq!(p.len(), 1 << 20);
        assert!(p.as_bytes().is_none());
    }
}
