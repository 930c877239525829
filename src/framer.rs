//! Line/literal framer.
//!
//! Splits the inbound byte stream into *response units*: one logical
//! server line, where any number of `{N}` literals may extend the line
//! past its CRLFs. Each literal announcement is replaced in the unit
//! text by a `{B<k>}` placeholder and the N payload octets are captured
//! verbatim, or forwarded to the registered sink when they exceed the
//! in-memory ceiling. The framer is resumable at any byte boundary, so
//! feeding it a stream in arbitrary slices yields the same units as
//! feeding it whole.

use std::mem;

use bytes::{Bytes, BytesMut};
use log::trace;

use crate::buffer::Buffer;
use crate::error::ParseError;
use crate::types::value::{Payload, StreamHandle};

/// Receives the chunks of literals too large to buffer.
///
/// Called with the literal's handle, the next run of payload bytes, and
/// whether this run completes the literal.
pub type LiteralSink = Box<dyn FnMut(StreamHandle, &[u8], bool)>;

/// Literals up to this many bytes are buffered in the unit by default.
pub const DEFAULT_LITERAL_CEILING: usize = 64 * 1024;

/// One logical server line with its literals resolved out-of-band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseUnit {
    /// Line text without the trailing CRLF; every literal announcement
    /// is replaced by `{B<k>}`.
    pub text: Vec<u8>,
    /// Captured literal payloads, ordered by placeholder index.
    pub literals: Vec<Payload>,
}

impl ResponseUnit {
    /// The payload behind placeholder `k`.
    pub fn literal(&self, k: usize) -> Option<&Payload> {
        self.literals.get(k)
    }
}

#[derive(Debug)]
enum Mode {
    Line,
    Literal { remaining: usize, dest: Dest },
}

#[derive(Debug)]
enum Dest {
    Inline(BytesMut),
    Stream(StreamHandle),
}

/// Converts the raw byte stream into [`ResponseUnit`]s.
pub struct Framer {
    mode: Mode,
    text: Vec<u8>,
    literals: Vec<Payload>,
    /// Prefix of the unread buffer already scanned without finding LF.
    scanned: usize,
    ceiling: usize,
    sink: Option<LiteralSink>,
    next_stream: u64,
}

impl std::fmt::Debug for Framer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framer")
            .field("mode", &self.mode)
            .field("text", &String::from_utf8_lossy(&self.text))
            .field("literals", &self.literals.len())
            .field("ceiling", &self.ceiling)
            .finish()
    }
}

impl Framer {
    /// A framer in line mode. Literals up to `ceiling` bytes are kept
    /// in the unit; larger ones require a sink.
    pub fn new(ceiling: usize) -> Self {
        Framer {
            mode: Mode::Line,
            text: Vec::new(),
            literals: Vec::new(),
            scanned: 0,
            ceiling,
            sink: None,
            next_stream: 0,
        }
    }

    /// Register the sink that takes over literals past the ceiling.
    pub fn set_sink(&mut self, sink: LiteralSink) {
        self.sink = Some(sink);
    }

    /// Pull the next complete response unit out of `buf`, if the bytes
    /// for one have arrived. `Ok(None)` means feed more input.
    pub fn pull(&mut self, buf: &mut Buffer) -> Result<Option<ResponseUnit>, ParseError> {
        loop {
            let mut literal_done = false;
            if let Mode::Literal { remaining, dest } = &mut self.mode {
                let take = (*remaining).min(buf.remaining());
                if take == 0 {
                    return Ok(None);
                }
                let chunk = buf.advance(take);
                *remaining -= take;
                let last = *remaining == 0;
                match dest {
                    Dest::Inline(acc) => acc.extend_from_slice(&chunk),
                    Dest::Stream(handle) => {
                        let handle = *handle;
                        if let Some(sink) = self.sink.as_mut() {
                            sink(handle, &chunk, last);
                        }
                    }
                }
                literal_done = last;
            } else {
                let pending = buf.unread();
                let nl = match pending[self.scanned..].iter().position(|&b| b == b'\n') {
                    Some(rel) => self.scanned + rel,
                    None => {
                        self.scanned = pending.len();
                        return Ok(None);
                    }
                };
                // tolerate a lone LF on input; emit is always CRLF
                let line_end = if nl > 0 && pending[nl - 1] == b'\r' {
                    nl - 1
                } else {
                    nl
                };
                let fragment = &pending[..line_end];
                let announcement = literal_announcement(fragment)?;
                match announcement {
                    Some((keep, n)) => {
                        self.text.extend_from_slice(&fragment[..keep]);
                        let k = self.literals.len();
                        self.text.extend_from_slice(format!("{{B{k}}}").as_bytes());
                        if n > self.ceiling {
                            if self.sink.is_none() {
                                return Err(ParseError::LiteralTooLarge(n));
                            }
                            let handle = StreamHandle(self.next_stream);
                            self.next_stream += 1;
                            self.literals.push(Payload::Stream { handle, len: n });
                            self.mode = Mode::Literal {
                                remaining: n,
                                dest: Dest::Stream(handle),
                            };
                        } else if n == 0 {
                            self.literals.push(Payload::Inline(Bytes::new()));
                        } else {
                            self.mode = Mode::Literal {
                                remaining: n,
                                dest: Dest::Inline(BytesMut::with_capacity(n)),
                            };
                        }
                        buf.advance(nl + 1);
                        self.scanned = 0;
                    }
                    None => {
                        self.text.extend_from_slice(fragment);
                        buf.advance(nl + 1);
                        self.scanned = 0;
                        let unit = ResponseUnit {
                            text: mem::take(&mut self.text),
                            literals: mem::take(&mut self.literals),
                        };
                        trace!(
                            "framed unit: {:?} (+{} literals)",
                            String::from_utf8_lossy(&unit.text),
                            unit.literals.len()
                        );
                        return Ok(Some(unit));
                    }
                }
            }
            if literal_done {
                let prev = mem::replace(&mut self.mode, Mode::Line);
                if let Mode::Literal {
                    dest: Dest::Inline(acc),
                    ..
                } = prev
                {
                    self.literals.push(Payload::Inline(acc.freeze()));
                }
            }
        }
    }
}

/// Recognize a `{N}` immediately before the CRLF.
///
/// Returns the length of the text to keep and the announced byte count.
/// A brace group anywhere else in the line, or one that is not all
/// digits, is ordinary text; a digit group too large for `usize` is a
/// syntax error since the payload could never be consumed.
fn literal_announcement(fragment: &[u8]) -> Result<Option<(usize, usize)>, ParseError> {
    if fragment.last() != Some(&b'}') {
        return Ok(None);
    }
    let open = match fragment.iter().rposition(|&b| b == b'{') {
        Some(i) => i,
        None => return Ok(None),
    };
    let digits = &fragment[open + 1..fragment.len() - 1];
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Ok(None);
    }
    // all ASCII digits
    let text = std::str::from_utf8(digits).map_err(|_| ParseError::DataNotUtf8)?;
    let n = text.parse::<usize>().map_err(|_| {
        ParseError::BadLiteralSyntax(String::from_utf8_lossy(&fragment[open..]).into_owned())
    })?;
    Ok(Some((open, n)))
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    fn frame_all(framer: &mut Framer, buf: &mut Buffer) -> Vec<ResponseUnit> {
        let mut units = Vec::new();
        while let Some(unit) = framer.pull(buf).unwrap() {
            units.push(unit);
        }
        units
    }

    fn units_of(input: &[u8]) -> Vec<ResponseUnit> {
        let mut framer = Framer::new(DEFAULT_LITERAL_CEILING);
        let mut buf = Buffer::new();
        buf.append(input);
        frame_all(&mut framer, &mut buf)
    }

    #[test]
    fn plain_lines_become_units() {
        let units = units_of(b"* OK ready\r\nA0001 OK done\r\n");
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].text, b"* OK ready");
        assert_eq!(units[1].text, b"A0001 OK done");
        assert!(units[0].literals.is_empty());
    }

    #[test]
    fn lone_lf_is_tolerated() {
        let units = units_of(b"* OK ready\n");
        assert_eq!(units[0].text, b"* OK ready");
    }

    #[test]
    fn literal_is_captured_and_replaced() {
        let units = units_of(b"* 1 FETCH (TEST {5}\r\n12345)\r\n");
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].text, b"* 1 FETCH (TEST {B0})");
        assert_eq!(units[0].literal(0).unwrap().as_bytes().unwrap(), b"12345");
    }

    #[test]
    fn literal_capture_is_content_blind() {
        // ')' '"' and CRLF inside the payload are payload, not syntax
        let units = units_of(b"* 1 FETCH (BODY[] {8}\r\n)\"\r\nhi\r\n)\r\n");
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].text, b"* 1 FETCH (BODY[] {B0})");
        assert_eq!(
            units[0].literal(0).unwrap().as_bytes().unwrap(),
            b")\"\r\nhi\r\n"
        );
    }

    #[test]
    fn multiple_literals_are_indexed_in_order() {
        let units = units_of(b"* 1 FETCH (A {2}\r\nab B {3}\r\ncde)\r\n");
        assert_eq!(units[0].text, b"* 1 FETCH (A {B0} B {B1})");
        assert_eq!(units[0].literal(0).unwrap().as_bytes().unwrap(), b"ab");
        assert_eq!(units[0].literal(1).unwrap().as_bytes().unwrap(), b"cde");
    }

    #[test]
    fn empty_literal_yields_empty_payload() {
        let units = units_of(b"* 1 FETCH (BODY[HEADER] {0}\r\n)\r\n");
        assert_eq!(units[0].text, b"* 1 FETCH (BODY[HEADER] {B0})");
        assert!(units[0].literal(0).unwrap().is_empty());
    }

    #[test]
    fn brace_group_mid_line_is_plain_text() {
        let units = units_of(b"* OK {5} looks like one but is not\r\n");
        assert_eq!(units[0].text, b"* OK {5} looks like one but is not");
        assert!(units[0].literals.is_empty());
    }

    #[test]
    fn framing_is_partition_independent() {
        let input: &[u8] = b"* 1 FETCH (FLAGS (\\Seen) BODY[] {11}\r\nhello\r\nbye )\r\nA1 OK done\r\n";
        let whole = units_of(input);
        for split in 1..input.len() {
            let mut framer = Framer::new(DEFAULT_LITERAL_CEILING);
            let mut buf = Buffer::new();
            buf.append(&input[..split]);
            let mut units = frame_all(&mut framer, &mut buf);
            buf.append(&input[split..]);
            units.extend(frame_all(&mut framer, &mut buf));
            assert_eq!(units, whole, "split at {split}");
        }
    }

    #[test]
    fn oversized_literal_streams_to_sink() {
        let chunks: Rc<RefCell<Vec<(u64, Vec<u8>, bool)>>> = Rc::default();
        let seen = chunks.clone();
        let mut framer = Framer::new(4);
        framer.set_sink(Box::new(move |handle, bytes, last| {
            seen.borrow_mut().push((handle.0, bytes.to_vec(), last));
        }));
        let mut buf = Buffer::new();
        buf.append(b"* 1 FETCH (BODY[] {10}\r\n0123");
        assert!(framer.pull(&mut buf).unwrap().is_none());
        buf.append(b"456789)\r\n");
        let unit = framer.pull(&mut buf).unwrap().unwrap();
        assert_eq!(unit.text, b"* 1 FETCH (BODY[] {B0})");
        assert_eq!(
            unit.literal(0),
            Some(&Payload::Stream {
                handle: StreamHandle(0),
                len: 10
            })
        );
        let chunks = chunks.borrow();
        let total: Vec<u8> = chunks.iter().flat_map(|(_, b, _)| b.clone()).collect();
        assert_eq!(total, b"0123456789");
        assert!(chunks.last().unwrap().2, "final chunk flagged last");
    }

    #[test]
    fn oversized_literal_without_sink_is_an_error() {
        let mut framer = Framer::new(4);
        let mut buf = Buffer::new();
        buf.append(b"* 1 FETCH (BODY[] {10}\r\n0123456789)\r\n");
        match framer.pull(&mut buf) {
            Err(ParseError::LiteralTooLarge(10)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn absurd_literal_length_is_bad_syntax() {
        let mut framer = Framer::new(DEFAULT_LITERAL_CEILING);
        let mut buf = Buffer::new();
        buf.append(b"* 1 FETCH (BODY[] {99999999999999999999999}\r\n");
        match framer.pull(&mut buf) {
            Err(ParseError::BadLiteralSyntax(_)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
