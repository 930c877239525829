//! Resumable parser for FETCH message attributes.
//!
//! A FETCH response body is a parenthesized list of `key value` pairs
//! whose values range over atoms, numbers, quoted strings, literal
//! references and arbitrarily nested lists. The parser here is driven
//! by an explicit stack of frames instead of recursive descent, so it
//! can stop on any byte boundary (exhausted input, or a literal whose
//! bytes have not arrived) and resume later with the stack intact.
//!
//! Tokens are lexed with `nom` streaming combinators: an `Incomplete`
//! from the lexer surfaces as [`Step::NeedMore`] without committing the
//! cursor, which is all the suspension machinery there is.

use nom::{bytes::streaming::take_while1, IResult, Needed};

use crate::error::ParseError;
use crate::types::value::{Payload, Value};

/// Hard cap on wire numbers, chosen so they always fit a signed 64-bit
/// consumer.
const MAX_NUMBER: u64 = i64::MAX as u64;

/// One `key value` pair of a FETCH response, in server order.
pub type FetchAttr = (String, Value);

/// What [`FetchParser::parse`] came back with.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    /// Input ran out mid-structure; feed more text and call again.
    NeedMore,
    /// The text references literal `k`, which has not been added yet.
    NeedLiteral(usize),
    /// The whole response has been consumed.
    Done(Vec<FetchAttr>),
}

/// How a keyword's value is shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    /// `NIL`, a quoted string, or a literal reference.
    NString,
    /// An unsigned number.
    Number,
    /// Any value, lists included; the typed decoders take it from here.
    Any,
}

/// Keyword table for FETCH data items. `BODY[...]` keys are recognized
/// structurally by the key lexer and are not listed here.
const KEYWORDS: &[(&str, Shape)] = &[
    ("FLAGS", Shape::Any),
    ("INTERNALDATE", Shape::NString),
    ("RFC822.SIZE", Shape::Number),
    ("RFC822.HEADER", Shape::NString),
    ("RFC822.TEXT", Shape::NString),
    ("RFC822", Shape::NString),
    ("UID", Shape::Number),
    ("ENVELOPE", Shape::Any),
    ("BODYSTRUCTURE", Shape::Any),
    ("BODY", Shape::Any),
];

fn shape_for(key: &str) -> Option<Shape> {
    if key.starts_with("BODY[") {
        return Some(Shape::NString);
    }
    KEYWORDS.iter().find(|(k, _)| *k == key).map(|&(_, s)| s)
}

/// An outstanding parse obligation.
#[derive(Debug)]
enum Frame {
    /// The top-level `"(" item (SP item)* ")"` list. `key` holds the
    /// item whose value is still being parsed.
    Items {
        key: Option<String>,
        items: Vec<FetchAttr>,
    },
    /// The interior of a parenthesized value.
    List { acc: Vec<Value> },
}

/// What happened when a completed frame or value was folded upward.
enum Folded {
    Value(Value),
    Response(Vec<FetchAttr>),
}

/// Stateful, resumable FETCH response parser.
///
/// Feed it text (and literal payloads as they become available), then
/// call [`parse`](Self::parse) until it reports [`Step::Done`].
#[derive(Debug, Default)]
pub struct FetchParser {
    text: Vec<u8>,
    pos: usize,
    literals: Vec<Payload>,
    stack: Vec<Frame>,
    opened: bool,
}

impl FetchParser {
    /// A parser with no input yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append response text. Literal announcements must already be
    /// replaced by `{B<k>}` placeholders (the framer's job).
    pub fn feed(&mut self, text: &[u8]) {
        self.text.extend_from_slice(text);
    }

    /// Resolve the next literal placeholder, in announcement order.
    pub fn add_literal(&mut self, payload: Payload) {
        self.literals.push(payload);
    }

    /// Advance the parse as far as the input allows.
    pub fn parse(&mut self) -> Result<Step, ParseError> {
        loop {
            self.skip_ws();
            if !self.opened {
                match self.peek() {
                    None => return Ok(Step::NeedMore),
                    Some(b'(') => {
                        self.pos += 1;
                        self.opened = true;
                        self.stack.push(Frame::Items {
                            key: None,
                            items: Vec::new(),
                        });
                    }
                    Some(c) => return Err(self.unexpected("'('", c)),
                }
                continue;
            }
            let frame = match self.stack.pop() {
                Some(frame) => frame,
                // stack drained: the response was fully consumed earlier
                None => return Ok(Step::Done(Vec::new())),
            };
            match self.step(frame)? {
                Advance::Suspend(frame, step) => {
                    self.stack.push(frame);
                    return Ok(step);
                }
                Advance::Continue(frame) => self.stack.push(frame),
                Advance::Push(parent, child) => {
                    self.stack.push(parent);
                    self.stack.push(child);
                }
                Advance::Complete(folded) => match folded {
                    Folded::Response(items) => return Ok(Step::Done(items)),
                    Folded::Value(value) => self.fold(value)?,
                },
            }
        }
    }

    /// Run one transition of the frame on top of the stack.
    fn step(&mut self, mut frame: Frame) -> Result<Advance, ParseError> {
        self.skip_ws();
        match &mut frame {
            Frame::Items { key, items } => {
                if key.is_none() {
                    match self.peek() {
                        None => return Ok(Advance::Suspend(frame, Step::NeedMore)),
                        Some(b')') => {
                            self.pos += 1;
                            let Frame::Items { items, .. } = frame else {
                                unreachable!()
                            };
                            return Ok(Advance::Complete(Folded::Response(items)));
                        }
                        Some(_) => {}
                    }
                    let lexed = match self.lex_key()? {
                        Some(k) => k,
                        None => return Ok(Advance::Suspend(frame, Step::NeedMore)),
                    };
                    if shape_for(&lexed).is_none() {
                        return Err(ParseError::UnknownFetchItem(lexed));
                    }
                    if items.iter().any(|(k, _)| *k == lexed) {
                        return Err(ParseError::DuplicateFetchItem(lexed));
                    }
                    *key = Some(lexed);
                    self.skip_ws();
                }
                // the key is known; parse its value
                let shape = shape_for(key.as_deref().unwrap_or_default())
                    .unwrap_or(Shape::Any);
                match self.lex_value(shape)? {
                    Lexed::Value(value) => {
                        let Frame::Items { key, items } = &mut frame else {
                            unreachable!()
                        };
                        let key = key.take().unwrap_or_default();
                        items.push((key, value));
                        Ok(Advance::Continue(frame))
                    }
                    Lexed::OpenList => Ok(Advance::Push(frame, Frame::List { acc: Vec::new() })),
                    Lexed::Suspend(step) => Ok(Advance::Suspend(frame, step)),
                }
            }
            Frame::List { acc } => {
                if self.peek() == Some(b')') {
                    self.pos += 1;
                    let Frame::List { acc } = frame else {
                        unreachable!()
                    };
                    return Ok(Advance::Complete(Folded::Value(Value::List(acc))));
                }
                match self.lex_value(Shape::Any)? {
                    Lexed::Value(value) => {
                        acc.push(value);
                        Ok(Advance::Continue(frame))
                    }
                    Lexed::OpenList => Ok(Advance::Push(frame, Frame::List { acc: Vec::new() })),
                    Lexed::Suspend(step) => Ok(Advance::Suspend(frame, step)),
                }
            }
        }
    }

    /// Fold a completed value into the frame now on top of the stack.
    fn fold(&mut self, value: Value) -> Result<(), ParseError> {
        match self.stack.last_mut() {
            Some(Frame::List { acc }) => {
                acc.push(value);
                Ok(())
            }
            Some(Frame::Items { key, items }) => {
                let key = key.take().ok_or_else(|| {
                    ParseError::Malformed("value completed without a pending item".into())
                })?;
                items.push((key, value));
                Ok(())
            }
            None => Err(ParseError::Malformed(
                "value completed outside the response".into(),
            )),
        }
    }

    /// Lex one value of the given shape, without descending into lists
    /// (the caller pushes a frame for those).
    fn lex_value(&mut self, shape: Shape) -> Result<Lexed, ParseError> {
        match self.peek() {
            None => Ok(Lexed::Suspend(Step::NeedMore)),
            Some(b'(') => {
                if shape == Shape::Any {
                    self.pos += 1;
                    Ok(Lexed::OpenList)
                } else {
                    Err(self.unexpected(shape.expected(), b'('))
                }
            }
            Some(b'"') => {
                let rest = &self.text[self.pos..];
                match quoted(rest) {
                    Ok((remaining, bytes)) => {
                        if shape == Shape::Number {
                            return Err(ParseError::UnexpectedToken {
                                expected: "number",
                                got: String::from_utf8_lossy(&bytes).into_owned(),
                            });
                        }
                        self.pos = self.text.len() - remaining.len();
                        Ok(Lexed::Value(Value::Str(Payload::inline(bytes))))
                    }
                    Err(nom::Err::Incomplete(_)) => Ok(Lexed::Suspend(Step::NeedMore)),
                    Err(_) => Err(ParseError::Malformed("unterminated quoted string".into())),
                }
            }
            Some(_) => {
                let rest = &self.text[self.pos..];
                let (remaining, token) = match word(rest) {
                    Ok(ok) => ok,
                    Err(nom::Err::Incomplete(_)) => return Ok(Lexed::Suspend(Step::NeedMore)),
                    Err(_) => {
                        let got = self.text[self.pos];
                        return Err(self.unexpected(shape.expected(), got));
                    }
                };
                let classified = classify(token, &self.literals)?;
                let value = match classified {
                    Classified::Pending(k) => return Ok(Lexed::Suspend(Step::NeedLiteral(k))),
                    Classified::Value(v) => v,
                };
                let ok = match (shape, &value) {
                    (Shape::Any, _) => true,
                    (Shape::Number, Value::Number(_)) => true,
                    (Shape::NString, Value::Nil | Value::Str(_)) => true,
                    _ => false,
                };
                if !ok {
                    return Err(ParseError::UnexpectedToken {
                        expected: shape.expected(),
                        got: String::from_utf8_lossy(token).into_owned(),
                    });
                }
                self.pos = self.text.len() - remaining.len();
                Ok(Lexed::Value(value))
            }
        }
    }

    /// Lex a FETCH item key. `BODY[...]` keys include the balanced
    /// bracket group and an optional `<origin>` suffix; everything is
    /// uppercased for case-insensitive matching.
    fn lex_key(&mut self) -> Result<Option<String>, ParseError> {
        let rest = &self.text[self.pos..];
        let prefix = b"BODY[";
        let probe = rest.len().min(prefix.len());
        if rest[..probe].eq_ignore_ascii_case(&prefix[..probe]) {
            if probe < prefix.len() {
                // could still become BODY[...]; wait for more input
                return Ok(None);
            }
            let mut depth = 1usize;
            let mut i = prefix.len();
            while depth > 0 {
                match rest.get(i) {
                    None => return Ok(None),
                    Some(b'[') => depth += 1,
                    Some(b']') => depth -= 1,
                    Some(_) => {}
                }
                i += 1;
            }
            if rest.get(i) == Some(&b'<') {
                loop {
                    i += 1;
                    match rest.get(i) {
                        None => return Ok(None),
                        Some(b'>') => {
                            i += 1;
                            break;
                        }
                        Some(_) => {}
                    }
                }
            }
            let key = String::from_utf8_lossy(&rest[..i]).to_ascii_uppercase();
            self.pos += i;
            return Ok(Some(key));
        }
        match word(rest) {
            Ok((remaining, token)) => {
                let key = String::from_utf8_lossy(token).to_ascii_uppercase();
                self.pos = self.text.len() - remaining.len();
                Ok(Some(key))
            }
            Err(nom::Err::Incomplete(_)) => Ok(None),
            Err(_) => {
                let got = self.text[self.pos];
                Err(self.unexpected("FETCH item name", got))
            }
        }
    }

    fn skip_ws(&mut self) {
        while self.peek() == Some(b' ') {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<u8> {
        self.text.get(self.pos).copied()
    }

    fn unexpected(&self, expected: &'static str, got: u8) -> ParseError {
        ParseError::UnexpectedToken {
            expected,
            got: (got as char).to_string(),
        }
    }
}

impl Shape {
    fn expected(self) -> &'static str {
        match self {
            Shape::NString => "string or NIL",
            Shape::Number => "number",
            Shape::Any => "value",
        }
    }
}

enum Advance {
    Suspend(Frame, Step),
    Continue(Frame),
    Push(Frame, Frame),
    Complete(Folded),
}

enum Lexed {
    Value(Value),
    OpenList,
    Suspend(Step),
}

enum Classified {
    Value(Value),
    Pending(usize),
}

fn is_token_char(c: u8) -> bool {
    !matches!(c, b' ' | b'(' | b')' | b'"' | b'\r' | b'\n')
}

/// One unquoted token: an atom, flag, number, `NIL`, or placeholder.
fn word(i: &[u8]) -> IResult<&[u8], &[u8]> {
    take_while1(is_token_char)(i)
}

/// `quoted = DQUOTE *QUOTED-CHAR DQUOTE`, unescaping `\"` and `\\`.
fn quoted(i: &[u8]) -> IResult<&[u8], Vec<u8>> {
    if i.first() != Some(&b'"') {
        return Err(nom::Err::Error(nom::error::Error::new(
            i,
            nom::error::ErrorKind::Char,
        )));
    }
    let mut out = Vec::new();
    let mut idx = 1;
    loop {
        match i.get(idx) {
            None => return Err(nom::Err::Incomplete(Needed::Unknown)),
            Some(b'"') => return Ok((&i[idx + 1..], out)),
            Some(b'\\') => match i.get(idx + 1) {
                None => return Err(nom::Err::Incomplete(Needed::Unknown)),
                Some(&c) => {
                    out.push(c);
                    idx += 2;
                }
            },
            Some(&c) => {
                out.push(c);
                idx += 1;
            }
        }
    }
}

/// Sort a lexed word into the value space.
fn classify(token: &[u8], literals: &[Payload]) -> Result<Classified, ParseError> {
    if token.eq_ignore_ascii_case(b"NIL") {
        return Ok(Classified::Value(Value::Nil));
    }
    if let Some(k) = placeholder_index(token) {
        return Ok(match literals.get(k) {
            Some(payload) => Classified::Value(Value::Str(payload.clone())),
            None => Classified::Pending(k),
        });
    }
    if token.iter().all(u8::is_ascii_digit) {
        // all ASCII digits
        let text = std::str::from_utf8(token).map_err(|_| ParseError::DataNotUtf8)?;
        let n = text.parse::<u64>().map_err(|_| ParseError::Overflow)?;
        if n > MAX_NUMBER {
            return Err(ParseError::Overflow);
        }
        return Ok(Classified::Value(Value::Number(n)));
    }
    let atom = std::str::from_utf8(token).map_err(|_| ParseError::DataNotUtf8)?;
    Ok(Classified::Value(Value::Atom(atom.to_string())))
}

/// `{B<k>}` markers the framer substituted for literal announcements.
fn placeholder_index(token: &[u8]) -> Option<usize> {
    let inner = token.strip_prefix(b"{B")?.strip_suffix(b"}")?;
    if inner.is_empty() || !inner.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(inner).ok()?.parse().ok()
}

/// Parse a complete FETCH body in one call.
///
/// The text and literal table come from a framed response unit, so a
/// suspension here means the unit itself is damaged.
pub fn parse_fetch_body(text: &[u8], literals: &[Payload]) -> Result<Vec<FetchAttr>, ParseError> {
    let mut parser = FetchParser::new();
    parser.feed(text);
    for payload in literals {
        parser.add_literal(payload.clone());
    }
    match parser.parse()? {
        Step::Done(items) => Ok(items),
        Step::NeedMore => Err(ParseError::Malformed("truncated FETCH response".into())),
        Step::NeedLiteral(k) => Err(ParseError::Malformed(format!(
            "unresolved literal reference {k}"
        ))),
    }
}
