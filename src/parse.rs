//! Response unit classification.
//!
//! Every framed unit is routed by its leading token: `+` continuation
//! requests, `*` untagged data (text or numeric), and tagged command
//! completions. FETCH bodies are handed to the FETCH parser together
//! with the unit's literal table; everything else is single-line
//! grammar parsed here.

use log::warn;
use nom::{
    branch::alt,
    bytes::complete::{tag_no_case, take_while1},
    character::complete::{char, digit1},
    combinator::{map, map_res, value},
    multi::separated_list0,
    sequence::{delimited, preceded},
    IResult,
};

use crate::error::{Error, ParseError};
use crate::fetch_parser::parse_fetch_body;
use crate::framer::ResponseUnit;
use crate::types::{
    Flag, Name, NameAttribute, ResponseCode, ResponseEvent, Status, StatusItem, UntaggedResponse,
};
use crate::utf7;

/// Classify one framed response unit.
pub(crate) fn parse_unit(unit: &ResponseUnit) -> Result<ResponseEvent, Error> {
    let text = unit.text.as_slice();
    if let Some(rest) = text.strip_prefix(b"+") {
        // some servers send a bare "+" with no space
        let rest = rest.strip_prefix(b" ").unwrap_or(rest);
        let info = if rest.is_empty() {
            None
        } else {
            Some(utf8(rest)?.to_string())
        };
        return Ok(ResponseEvent::Continue { info });
    }
    if let Some(rest) = text.strip_prefix(b"* ") {
        return untagged(rest, unit).map(ResponseEvent::Untagged);
    }
    tagged(text)
}

fn tagged(text: &[u8]) -> Result<ResponseEvent, Error> {
    let (tag, rest) = split_word(text);
    let (status_word, rest) = split_word(rest);
    if tag.is_empty() || status_word.is_empty() {
        return Err(malformed(text));
    }
    let status = match () {
        _ if status_word.eq_ignore_ascii_case(b"OK") => Status::Ok,
        _ if status_word.eq_ignore_ascii_case(b"NO") => Status::No,
        _ if status_word.eq_ignore_ascii_case(b"BAD") => Status::Bad,
        _ => return Err(malformed(text)),
    };
    let (code, info) = resp_text(rest)?;
    Ok(ResponseEvent::Tagged {
        tag: utf8(tag)?.to_string(),
        status,
        code,
        info,
    })
}

fn untagged(rest: &[u8], unit: &ResponseUnit) -> Result<UntaggedResponse, Error> {
    let (word, tail) = split_word(rest);
    if !word.is_empty() && word.iter().all(u8::is_ascii_digit) {
        return untagged_numeric(word, tail, unit);
    }
    let keyword = utf8(word)?.to_ascii_uppercase();
    match keyword.as_str() {
        "OK" | "NO" | "BAD" | "PREAUTH" | "BYE" => {
            let status = match keyword.as_str() {
                "OK" => Status::Ok,
                "NO" => Status::No,
                "BAD" => Status::Bad,
                "PREAUTH" => Status::PreAuth,
                _ => Status::Bye,
            };
            let (code, info) = resp_text(tail)?;
            Ok(UntaggedResponse::Condition { status, code, info })
        }
        "CAPABILITY" => Ok(UntaggedResponse::Capabilities(
            utf8(tail)?.split_ascii_whitespace().map(String::from).collect(),
        )),
        "FLAGS" => {
            let (_, flags) = flag_list(tail).map_err(|_| malformed(tail))?;
            Ok(UntaggedResponse::Flags(flags))
        }
        "LIST" => name_line(tail, unit).map(UntaggedResponse::List),
        "LSUB" => name_line(tail, unit).map(UntaggedResponse::Lsub),
        "STATUS" => status_line(tail, unit),
        "SEARCH" => {
            let mut ids = Vec::new();
            for id in utf8(tail)?.split_ascii_whitespace() {
                ids.push(id.parse().map_err(|_| malformed(tail))?);
            }
            Ok(UntaggedResponse::Search(ids))
        }
        _ => {
            warn!(
                "ignoring unknown untagged response: {:?}",
                String::from_utf8_lossy(rest)
            );
            Ok(UntaggedResponse::Unknown(
                String::from_utf8_lossy(rest).into_owned(),
            ))
        }
    }
}

fn untagged_numeric(
    word: &[u8],
    tail: &[u8],
    unit: &ResponseUnit,
) -> Result<UntaggedResponse, Error> {
    let n: u32 = utf8(word)?.parse().map_err(|_| malformed(word))?;
    let (keyword, rest) = split_word(tail);
    match () {
        _ if keyword.eq_ignore_ascii_case(b"EXISTS") => Ok(UntaggedResponse::Exists(n)),
        _ if keyword.eq_ignore_ascii_case(b"RECENT") => Ok(UntaggedResponse::Recent(n)),
        _ if keyword.eq_ignore_ascii_case(b"EXPUNGE") => Ok(UntaggedResponse::Expunge(n)),
        _ if keyword.eq_ignore_ascii_case(b"FETCH") => {
            let attrs = parse_fetch_body(rest, &unit.literals)?;
            Ok(UntaggedResponse::Fetch(n, attrs))
        }
        _ => {
            warn!(
                "ignoring unknown numeric response: {} {:?}",
                n,
                String::from_utf8_lossy(keyword)
            );
            Ok(UntaggedResponse::Unknown(format!(
                "{} {}",
                n,
                String::from_utf8_lossy(tail)
            )))
        }
    }
}

/// `["[" resp-text-code "]" SP] text`
fn resp_text(rest: &[u8]) -> Result<(Option<ResponseCode>, String), Error> {
    if let Some(inner) = rest.strip_prefix(b"[") {
        let close = inner
            .iter()
            .position(|&b| b == b']')
            .ok_or_else(|| malformed(rest))?;
        let code = resp_code(&inner[..close])?;
        let text = &inner[close + 1..];
        let text = text.strip_prefix(b" ").unwrap_or(text);
        Ok((Some(code), utf8(text)?.to_string()))
    } else {
        Ok((None, utf8(rest)?.to_string()))
    }
}

fn resp_code(content: &[u8]) -> Result<ResponseCode, Error> {
    let parsed: IResult<&[u8], ResponseCode> = alt((
        value(ResponseCode::Alert, tag_no_case("ALERT")),
        map(
            preceded(tag_no_case("CAPABILITY "), capability_atoms),
            ResponseCode::Capability,
        ),
        map(
            preceded(tag_no_case("PERMANENTFLAGS "), flag_list),
            ResponseCode::PermanentFlags,
        ),
        value(ResponseCode::ReadOnly, tag_no_case("READ-ONLY")),
        value(ResponseCode::ReadWrite, tag_no_case("READ-WRITE")),
        value(ResponseCode::TryCreate, tag_no_case("TRYCREATE")),
        map(
            preceded(tag_no_case("UIDVALIDITY "), number),
            ResponseCode::UidValidity,
        ),
        map(preceded(tag_no_case("UIDNEXT "), number), ResponseCode::UidNext),
        map(preceded(tag_no_case("UNSEEN "), number), ResponseCode::Unseen),
    ))(content);
    match parsed {
        Ok((remaining, code)) if remaining.is_empty() => Ok(code),
        _ => Ok(ResponseCode::Other(utf8(content)?.to_string())),
    }
}

fn number(i: &[u8]) -> IResult<&[u8], u32> {
    map_res(digit1, |digits: &[u8]| {
        // digit1 yields ASCII only
        std::str::from_utf8(digits)
            .map_err(|_| ())
            .and_then(|s| s.parse::<u32>().map_err(|_| ()))
    })(i)
}

fn capability_atoms(i: &[u8]) -> IResult<&[u8], Vec<String>> {
    separated_list0(
        char(' '),
        map_res(take_while1(|c| c != b' '), |bytes: &[u8]| {
            std::str::from_utf8(bytes).map(String::from)
        }),
    )(i)
}

fn flag_list(i: &[u8]) -> IResult<&[u8], Vec<Flag>> {
    delimited(
        char('('),
        separated_list0(
            char(' '),
            map_res(
                take_while1(|c| c != b' ' && c != b'(' && c != b')'),
                |bytes: &[u8]| std::str::from_utf8(bytes).map(Flag::from),
            ),
        ),
        char(')'),
    )(i)
}

/// `LIST`/`LSUB` payload: attribute list, delimiter, name.
fn name_line(tail: &[u8], unit: &ResponseUnit) -> Result<Name, Error> {
    let (rest, attributes) = delimited(
        char('('),
        separated_list0(
            char(' '),
            map_res(
                take_while1(|c: u8| c != b' ' && c != b'(' && c != b')'),
                |bytes: &[u8]| std::str::from_utf8(bytes).map(NameAttribute::from),
            ),
        ),
        char(')'),
    )(tail)
    .map_err(|_: nom::Err<nom::error::Error<&[u8]>>| malformed(tail))?;
    let rest = expect_space(rest)?;
    let (rest, delimiter_tok) = string_token(rest)?;
    let rest = expect_space(rest)?;
    let (_, name_tok) = string_token(rest)?;
    let delimiter = resolve(delimiter_tok, unit)?;
    let raw_name = resolve(name_tok, unit)?.ok_or_else(|| malformed(tail))?;
    Ok(Name {
        attributes,
        delimiter,
        name: utf7::decode(&raw_name)?,
    })
}

fn status_line(tail: &[u8], unit: &ResponseUnit) -> Result<UntaggedResponse, Error> {
    let (rest, mailbox_tok) = string_token(tail)?;
    let rest = expect_space(rest)?;
    let (_, items) = delimited(char('('), separated_list0(char(' '), status_item), char(')'))(rest)
        .map_err(|_: nom::Err<nom::error::Error<&[u8]>>| malformed(tail))?;
    let mailbox = resolve(mailbox_tok, unit)?.ok_or_else(|| malformed(tail))?;
    Ok(UntaggedResponse::MailboxStatus {
        mailbox: utf7::decode(&mailbox)?,
        items,
    })
}

fn status_item(i: &[u8]) -> IResult<&[u8], StatusItem> {
    alt((
        map(preceded(tag_no_case("MESSAGES "), number), StatusItem::Messages),
        map(preceded(tag_no_case("RECENT "), number), StatusItem::Recent),
        map(preceded(tag_no_case("UIDNEXT "), number), StatusItem::UidNext),
        map(
            preceded(tag_no_case("UIDVALIDITY "), number),
            StatusItem::UidValidity,
        ),
        map(preceded(tag_no_case("UNSEEN "), number), StatusItem::Unseen),
    ))(i)
}

/// A string position on a classified line: quoted, literal placeholder,
/// `NIL`, or a bare atom running to the next space.
enum Tok<'a> {
    Nil,
    Quoted(Vec<u8>),
    Word(&'a [u8]),
}

fn string_token(i: &[u8]) -> Result<(&[u8], Tok<'_>), Error> {
    if i.first() == Some(&b'"') {
        let mut out = Vec::new();
        let mut idx = 1;
        loop {
            match i.get(idx) {
                None => return Err(malformed(i)),
                Some(b'"') => return Ok((&i[idx + 1..], Tok::Quoted(out))),
                Some(b'\\') => match i.get(idx + 1) {
                    None => return Err(malformed(i)),
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
    let (word, rest) = split_word(i);
    if word.is_empty() {
        return Err(malformed(i));
    }
    if word.eq_ignore_ascii_case(b"NIL") {
        Ok((rest_with_space(i, word), Tok::Nil))
    } else {
        Ok((rest_with_space(i, word), Tok::Word(word)))
    }
}

// split_word eats the separating space; keep offsets consistent for
// callers that expect to skip it themselves
fn rest_with_space<'a>(i: &'a [u8], word: &[u8]) -> &'a [u8] {
    &i[word.len()..]
}

fn resolve(tok: Tok<'_>, unit: &ResponseUnit) -> Result<Option<String>, Error> {
    match tok {
        Tok::Nil => Ok(None),
        Tok::Quoted(bytes) => Ok(Some(utf8(&bytes)?.to_string())),
        Tok::Word(word) => {
            if let Some(k) = placeholder_index(word) {
                let payload = unit
                    .literal(k)
                    .ok_or_else(|| malformed(word))?;
                let bytes = payload.as_bytes().ok_or_else(|| {
                    Error::Parse(ParseError::Malformed(
                        "mailbox name delivered as a stream".into(),
                    ))
                })?;
                Ok(Some(utf8(bytes)?.to_string()))
            } else {
                Ok(Some(utf8(word)?.to_string()))
            }
        }
    }
}

fn placeholder_index(word: &[u8]) -> Option<usize> {
    let inner = word.strip_prefix(b"{B")?.strip_suffix(b"}")?;
    if inner.is_empty() || !inner.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(inner).ok()?.parse().ok()
}

fn split_word(text: &[u8]) -> (&[u8], &[u8]) {
    match text.iter().position(|&b| b == b' ') {
        Some(i) => (&text[..i], &text[i + 1..]),
        None => (text, &[][..]),
    }
}

fn expect_space(i: &[u8]) -> Result<&[u8], Error> {
    i.strip_prefix(b" ").ok_or_else(|| malformed(i))
}

fn utf8(bytes: &[u8]) -> Result<&str, Error> {
    std::str::from_utf8(bytes).map_err(|_| Error::Parse(ParseError::DataNotUtf8))
}

fn malformed(context: &[u8]) -> Error {
    Error::Parse(ParseError::Malformed(
        String::from_utf8_lossy(context).into_owned(),
    ))
}
