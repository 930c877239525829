//! Outbound request framing.

use std::collections::VecDeque;

use crate::error::{Result, ValidateError};
use crate::utf7;

/// Strings longer than this go out as literals even when they contain
/// nothing a quoted string could not carry.
const LITERAL_THRESHOLD: usize = 1000;

/// One command ready for the wire.
///
/// `segments[0]` (prefixed with the tag) is written immediately. Every
/// segment that announces a literal ends with its `{N}` marker; the
/// following segment starts with the literal payload and may only be
/// written once the server has invited it with `+`.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Request {
    pub tag: Option<String>,
    pub segments: VecDeque<Vec<u8>>,
}

/// Assembles a command line, deciding per argument between atom, quoted
/// and literal form.
#[derive(Debug)]
pub(crate) struct RequestBuilder {
    done: VecDeque<Vec<u8>>,
    current: Vec<u8>,
}

impl RequestBuilder {
    pub fn new(command: &str) -> Self {
        RequestBuilder {
            done: VecDeque::new(),
            current: command.as_bytes().to_vec(),
        }
    }

    /// Append preformatted syntax (sequence sets, item lists, flags).
    pub fn raw(mut self, arg: &str) -> Result<Self> {
        if let Some(c) = arg.chars().find(|&c| c == '\r' || c == '\n') {
            return Err(ValidateError(c).into());
        }
        self.current.push(b' ');
        self.current.extend_from_slice(arg.as_bytes());
        Ok(self)
    }

    /// Append a string argument, quoting it or lowering it to a literal
    /// when quoting cannot carry it.
    pub fn astring(mut self, arg: &str) -> Self {
        let bytes = arg.as_bytes();
        let needs_literal = bytes.len() > LITERAL_THRESHOLD
            || bytes.iter().any(|&b| b == b'\r' || b == b'\n' || b >= 0x80);
        if needs_literal {
            self.current
                .extend_from_slice(format!(" {{{}}}", bytes.len()).as_bytes());
            self.done.push_back(std::mem::take(&mut self.current));
            self.current.extend_from_slice(bytes);
        } else {
            self.current.push(b' ');
            self.current.extend_from_slice(quote_astring(arg).as_bytes());
        }
        self
    }

    /// Append a mailbox name, encoding it to modified UTF-7 first.
    pub fn mailbox(self, name: &str) -> Self {
        self.astring(&utf7::encode(name))
    }

    pub fn finish(mut self, tag: Option<String>) -> Request {
        self.done.push_back(self.current);
        Request {
            tag,
            segments: self.done,
        }
    }
}

/// Render a string in quoted form, escaping `\` and `"`.
pub(crate) fn quote_astring(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', r"\\").replace('"', "\\\""))
}
