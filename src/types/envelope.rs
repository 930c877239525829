//! Message envelopes and addresses.

use crate::error::ParseError;
use crate::types::value::{unexpected, Value};

/// One electronic mail address from an envelope address list.
///
/// Servers encode a group header as an address whose `host` is absent;
/// this decoder keeps such entries untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Address {
    /// Display name.
    pub name: Option<String>,
    /// SMTP source route, long obsolete but still on the wire.
    pub source_route: Option<String>,
    /// Local part of the address.
    pub mailbox: Option<String>,
    /// Domain part of the address.
    pub host: Option<String>,
}

/// The structured header block of a message, as computed by the server
/// for `FETCH (ENVELOPE)`.
///
/// See [RFC 3501 section 7.4.2](https://tools.ietf.org/html/rfc3501#section-7.4.2).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    /// The `Date:` header, verbatim.
    pub date: Option<String>,
    /// The `Subject:` header, verbatim.
    pub subject: Option<String>,
    /// `From:` addresses; `None` when the header is absent.
    pub from: Option<Vec<Address>>,
    /// `Sender:` addresses, defaulted by the server from `From:`.
    pub sender: Option<Vec<Address>>,
    /// `Reply-To:` addresses, defaulted by the server from `From:`.
    pub reply_to: Option<Vec<Address>>,
    /// `To:` addresses.
    pub to: Option<Vec<Address>>,
    /// `Cc:` addresses.
    pub cc: Option<Vec<Address>>,
    /// `Bcc:` addresses.
    pub bcc: Option<Vec<Address>>,
    /// The `In-Reply-To:` header, verbatim.
    pub in_reply_to: Option<String>,
    /// The `Message-Id:` header, verbatim.
    pub message_id: Option<String>,
}

impl Envelope {
    /// Decode the ten-element envelope group.
    pub fn decode(value: &Value) -> Result<Envelope, ParseError> {
        let items = value
            .as_list()
            .ok_or_else(|| unexpected("envelope group", value))?;
        if items.len() != 10 {
            return Err(ParseError::Malformed(format!(
                "envelope has {} fields, expected 10",
                items.len()
            )));
        }
        Ok(Envelope {
            date: items[0].to_nstring()?,
            subject: items[1].to_nstring()?,
            from: decode_address_list(&items[2])?,
            sender: decode_address_list(&items[3])?,
            reply_to: decode_address_list(&items[4])?,
            to: decode_address_list(&items[5])?,
            cc: decode_address_list(&items[6])?,
            bcc: decode_address_list(&items[7])?,
            in_reply_to: items[8].to_nstring()?,
            message_id: items[9].to_nstring()?,
        })
    }

    /// Re-encode with the standard quoting rules.
    ///
    /// Produces the byte form the server would have sent had it used no
    /// literals, which makes decode-then-encode the identity on such
    /// input.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(b'(');
        write_nstring(&mut out, self.date.as_deref());
        out.push(b' ');
        write_nstring(&mut out, self.subject.as_deref());
        for list in [
            &self.from,
            &self.sender,
            &self.reply_to,
            &self.to,
            &self.cc,
            &self.bcc,
        ] {
            out.push(b' ');
            write_address_list(&mut out, list.as_deref());
        }
        out.push(b' ');
        write_nstring(&mut out, self.in_reply_to.as_deref());
        out.push(b' ');
        write_nstring(&mut out, self.message_id.as_deref());
        out.push(b')');
        out
    }
}

/// `NIL` or a list of four-element address groups, each promoted to an
/// [`Address`] record.
fn decode_address_list(value: &Value) -> Result<Option<Vec<Address>>, ParseError> {
    let items = match value {
        Value::Nil => return Ok(None),
        Value::List(items) => items,
        other => return Err(unexpected("address list or NIL", other)),
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let fields = item
            .as_list()
            .ok_or_else(|| unexpected("address group", item))?;
        if fields.len() != 4 {
            return Err(ParseError::Malformed(format!(
                "address has {} fields, expected 4",
                fields.len()
            )));
        }
        out.push(Address {
            name: fields[0].to_nstring()?,
            source_route: fields[1].to_nstring()?,
            mailbox: fields[2].to_nstring()?,
            host: fields[3].to_nstring()?,
        });
    }
    Ok(Some(out))
}

fn write_nstring(out: &mut Vec<u8>, value: Option<&str>) {
    match value {
        None => out.extend_from_slice(b"NIL"),
        Some(s) => {
            out.push(b'"');
            for &b in s.as_bytes() {
                if b == b'"' || b == b'\\' {
                    out.push(b'\\');
                }
                out.push(b);
            }
            out.push(b'"');
        }
    }
}

fn write_address_list(out: &mut Vec<u8>, list: Option<&[Address]>) {
    match list {
        None => out.extend_from_slice(b"NIL"),
        Some(addresses) => {
            out.push(b'(');
            for address in addresses {
                out.push(b'(');
                write_nstring(out, address.name.as_deref());
                out.push(b' ');
                write_nstring(out, address.source_route.as_deref());
                out.push(b' ');
                write_nstring(out, address.mailbox.as_deref());
                out.push(b' ');
                write_nstring(out, address.host.as_deref());
                out.push(b')');
            }
            out.push(b')');
        }
    }
}
