//! Structural decoding of BODY and BODYSTRUCTURE values.

use std::collections::HashMap;

use crate::error::ParseError;
use crate::types::value::{params_from_value, unexpected, Value};

/// A single MIME part.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Part {
    /// Media type, uppercased (`TEXT`, `IMAGE`, ...).
    pub content_type: String,
    /// Media subtype, uppercased (`PLAIN`, `PNG`, ...).
    pub subtype: String,
    /// Body parameters (`CHARSET`, `NAME`, ...), keys uppercased.
    pub params: HashMap<String, String>,
    /// The `Content-Id:` value.
    pub id: Option<String>,
    /// The `Content-Description:` value.
    pub description: Option<String>,
    /// Content transfer encoding, uppercased (`7BIT`, `BASE64`, ...).
    pub encoding: String,
    /// Body size in octets, after transfer encoding.
    pub size: u64,
    /// Line count, present for `TEXT/*` and `MESSAGE/RFC822` parts.
    pub lines: Option<u64>,
}

/// A multipart container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Multipart {
    /// The nested parts, in order.
    pub parts: Vec<BodyStructure>,
    /// Multipart subtype, uppercased (`MIXED`, `ALTERNATIVE`, ...).
    pub subtype: String,
    /// Multipart body parameters (`BOUNDARY`, ...), keys uppercased.
    pub params: HashMap<String, String>,
    /// The `Content-Disposition:` type, when the server sent extension
    /// data.
    pub disposition: Option<String>,
}

/// The MIME shape of a message.
///
/// The wire form is a parenthesized group; a group whose first element
/// is itself a group describes a multipart, anything else a single
/// part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyStructure {
    /// A leaf MIME part.
    Part(Part),
    /// A container of further parts.
    Multipart(Multipart),
}

impl BodyStructure {
    /// Decode a parsed BODY/BODYSTRUCTURE group.
    pub fn decode(value: &Value) -> Result<BodyStructure, ParseError> {
        let items = value
            .as_list()
            .ok_or_else(|| unexpected("body structure group", value))?;
        match items.first() {
            Some(Value::List(_)) => decode_multipart(items).map(BodyStructure::Multipart),
            Some(_) => decode_part(items).map(BodyStructure::Part),
            None => Err(ParseError::Malformed("empty body structure".into())),
        }
    }

    /// The part at the end of a dotted section path like `1.2`.
    pub fn part_at(&self, path: &[usize]) -> Option<&BodyStructure> {
        let mut node = self;
        for &index in path {
            match node {
                BodyStructure::Multipart(mp) => node = mp.parts.get(index.checked_sub(1)?)?,
                BodyStructure::Part(_) => return None,
            }
        }
        Some(node)
    }
}

fn decode_multipart(items: &[Value]) -> Result<Multipart, ParseError> {
    let mut parts = Vec::new();
    let mut iter = items.iter().peekable();
    while let Some(Value::List(_)) = iter.peek() {
        if let Some(part) = iter.next() {
            parts.push(BodyStructure::decode(part)?);
        }
    }
    let subtype = iter
        .next()
        .ok_or_else(|| ParseError::Malformed("multipart without a subtype".into()))?
        .to_nstring()?
        .unwrap_or_default()
        .to_ascii_uppercase();
    // extension data: parameters, disposition, language, location
    let params = match iter.next() {
        Some(value) => params_from_value(value)?,
        None => HashMap::new(),
    };
    let disposition = match iter.next() {
        Some(Value::List(fields)) => fields.first().map(|v| v.to_nstring()).transpose()?.flatten(),
        _ => None,
    };
    Ok(Multipart {
        parts,
        subtype,
        params,
        disposition,
    })
}

fn decode_part(items: &[Value]) -> Result<Part, ParseError> {
    if items.len() < 7 {
        return Err(ParseError::Malformed(format!(
            "body part has {} fields, expected at least 7",
            items.len()
        )));
    }
    let content_type = items[0]
        .to_nstring()?
        .unwrap_or_default()
        .to_ascii_uppercase();
    let subtype = items[1]
        .to_nstring()?
        .unwrap_or_default()
        .to_ascii_uppercase();
    let params = params_from_value(&items[2])?;
    let id = items[3].to_nstring()?;
    let description = items[4].to_nstring()?;
    let encoding = items[5]
        .to_nstring()?
        .unwrap_or_default()
        .to_ascii_uppercase();
    let size = items[6]
        .as_number()
        .ok_or_else(|| unexpected("body size", &items[6]))?;
    // TEXT/* carries its line count next; MESSAGE/RFC822 nests an
    // envelope and a body structure before its own line count
    let lines = if content_type == "TEXT" {
        items.get(7).and_then(Value::as_number)
    } else if content_type == "MESSAGE" && subtype == "RFC822" {
        items.get(9).and_then(Value::as_number)
    } else {
        None
    };
    Ok(Part {
        content_type,
        subtype,
        params,
        id,
        description,
        encoding,
        size,
        lines,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch_parser::parse_fetch_body;

    fn decode(wire: &[u8]) -> BodyStructure {
        let mut text = b"(BODYSTRUCTURE ".to_vec();
        text.extend_from_slice(wire);
        text.push(b')');
        let items = parse_fetch_body(&text, &[]).unwrap();
        BodyStructure::decode(&items[0].1).unwrap()
    }

    #[test]
    fn single_text_part() {
        // from the FETCH example in RFC 3501 section 7.4.2
        let body = decode(b"(\"TEXT\" \"PLAIN\" (\"CHARSET\" \"US-ASCII\") NIL NIL \"7BIT\" 3028 92)");
        let BodyStructure::Part(part) = body else {
            panic!("expected a single part");
        };
        assert_eq!(part.content_type, "TEXT");
        assert_eq!(part.subtype, "PLAIN");
        assert_eq!(part.params["CHARSET"], "US-ASCII");
        assert_eq!(part.id, None);
        assert_eq!(part.description, None);
        assert_eq!(part.encoding, "7BIT");
        assert_eq!(part.size, 3028);
        assert_eq!(part.lines, Some(92));
    }

    #[test]
    fn multipart_nests_its_children() {
        let body = decode(
            b"((\"TEXT\" \"PLAIN\" (\"CHARSET\" \"UTF-8\") NIL NIL \"QUOTED-PRINTABLE\" 412 11)\
(\"TEXT\" \"HTML\" (\"CHARSET\" \"UTF-8\") NIL NIL \"BASE64\" 1396 18) \"ALTERNATIVE\" \
(\"BOUNDARY\" \"0000b6\"))",
        );
        let BodyStructure::Multipart(mp) = body else {
            panic!("expected a multipart");
        };
        assert_eq!(mp.subtype, "ALTERNATIVE");
        assert_eq!(mp.params["BOUNDARY"], "0000b6");
        assert_eq!(mp.parts.len(), 2);
        let BodyStructure::Part(html) = &mp.parts[1] else {
            panic!("expected a part");
        };
        assert_eq!(html.subtype, "HTML");
        assert_eq!(html.lines, Some(18));
    }

    #[test]
    fn non_text_parts_have_no_line_count() {
        let body = decode(b"(\"IMAGE\" \"PNG\" NIL NIL NIL \"BASE64\" 18630)");
        let BodyStructure::Part(part) = body else {
            panic!("expected a single part");
        };
        assert_eq!(part.content_type, "IMAGE");
        assert_eq!(part.params.len(), 0);
        assert_eq!(part.lines, None);
    }

    #[test]
    fn part_at_walks_dotted_paths() {
        let body = decode(
            b"((\"TEXT\" \"PLAIN\" NIL NIL NIL \"7BIT\" 10 1)\
(\"TEXT\" \"HTML\" NIL NIL NIL \"7BIT\" 20 2) \"MIXED\")",
        );
        let BodyStructure::Part(part) = body.part_at(&[2]).unwrap() else {
            panic!("expected a part");
        };
        assert_eq!(part.subtype, "HTML");
        assert!(body.part_at(&[3]).is_none());
        assert!(body.part_at(&[1, 1]).is_none());
    }
}
