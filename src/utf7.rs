//! Modified UTF-7 mailbox name coding.
//!
//! International mailbox names cross the wire in the modified UTF-7 of
//! [RFC 3501 section 5.1.3](https://tools.ietf.org/html/rfc3501#section-5.1.3):
//! printable US-ASCII passes through, `&` shifts into a modified base64
//! rendering of UTF-16BE terminated by `-`, and the ampersand itself is
//! spelled `&-`.

use base64::engine::general_purpose::NO_PAD;
use base64::engine::GeneralPurpose;
use base64::{alphabet, Engine};

use crate::error::ParseError;

// base64 with ',' in place of '/', never padded
fn mb64() -> GeneralPurpose {
    let alphabet = match alphabet::Alphabet::new(
        "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+,",
    ) {
        Ok(alphabet) => alphabet,
        Err(_) => unreachable!("modified base64 alphabet is well formed"),
    };
    GeneralPurpose::new(&alphabet, NO_PAD)
}

/// Encode a mailbox name for the wire.
pub fn encode(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut run: Vec<u16> = Vec::new();
    for c in name.chars() {
        if ('\x20'..='\x7e').contains(&c) {
            flush(&mut out, &mut run);
            if c == '&' {
                out.push_str("&-");
            } else {
                out.push(c);
            }
        } else {
            let mut units = [0u16; 2];
            run.extend_from_slice(c.encode_utf16(&mut units));
        }
    }
    flush(&mut out, &mut run);
    out
}

fn flush(out: &mut String, run: &mut Vec<u16>) {
    if run.is_empty() {
        return;
    }
    let mut bytes = Vec::with_capacity(run.len() * 2);
    for unit in run.drain(..) {
        bytes.extend_from_slice(&unit.to_be_bytes());
    }
    out.push('&');
    out.push_str(&mb64().encode(bytes));
    out.push('-');
}

/// Decode a mailbox name from the wire.
pub fn decode(wire: &str) -> Result<String, ParseError> {
    let bad = || ParseError::BadUtf7(wire.to_string());
    let mut out = String::with_capacity(wire.len());
    let mut chars = wire.char_indices();
    while let Some((start, c)) = chars.next() {
        if c != '&' {
            out.push(c);
            continue;
        }
        let end = loop {
            match chars.next() {
                Some((i, '-')) => break i,
                Some(_) => {}
                None => return Err(bad()),
            }
        };
        let shifted = &wire[start + 1..end];
        if shifted.is_empty() {
            out.push('&');
            continue;
        }
        let bytes = mb64().decode(shifted).map_err(|_| bad())?;
        if bytes.len() % 2 != 0 {
            return Err(bad());
        }
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        out.push_str(&String::from_utf16(&units).map_err(|_| bad())?);
    }
    Ok(out)
}
