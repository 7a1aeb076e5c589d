//-
// Copyright (c) 2016, Jason Lingle
//
// This file is part of PGPEnvelope.
//
// PGPEnvelope is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// PGPEnvelope is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along with
// PGPEnvelope. If not, see <http://www.gnu.org/licenses/>.

//! Low-level facilities for reading MIME messages.
//!
//! This module knows about physical lines, header fields and the Content-Type
//! header; assembling those into a tree is the job of the `tree` module.
//!
//! Both UNIX and DOS line-endings are supported, and are preserved exactly.
//! Nothing in here ever normalises line endings; a lone CR is simply part of
//! the line text.
//!
//! Relevant standards:
//!   [RFC  822]        Basic definition of MIME format
//!   [RFC 2045]        Defines the Content-* headers
//!   [RFC 2046]        Defines Multipart syntax
//!   [RFC 2231]        Parameter value continuations and encoding

use std::collections::BTreeMap;
use std::str;

use base64::Engine as _;

static CRLF : [u8;2] = [b'\r', b'\n'];

/// Indicates the ending character(s) on a line.
#[derive(Clone,Copy,Debug,PartialEq,Eq)]
pub enum LineEnding {
    /// Carraige-Return followed by Line-Feed, as required by RFC 822.
    CRLF,
    /// Bare Line-Feed, as used on sane systems.
    LF,
    /// No line ending. The end of the input was reached without finding one.
    Nil,
}

impl LineEnding {
    /// Returns the bytes this line ending stands for.
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            LineEnding::CRLF => &CRLF[..],
            LineEnding::LF => &CRLF[1..],
            LineEnding::Nil => &CRLF[0..0],
        }
    }

    /// Returns `self`, or `fallback` if `self` is `Nil`.
    pub fn or(self, fallback: LineEnding) -> LineEnding {
        match self {
            LineEnding::Nil => fallback,
            _ => self,
        }
    }
}

/// A physical line within an in-memory buffer.
#[derive(Clone,Copy,Debug,PartialEq,Eq)]
pub struct Line<'a> {
    /// The text of this line, without its line ending.
    pub text: &'a[u8],
    /// The line ending which delimited this line.
    pub ending: LineEnding,
    /// The byte offset of the start of this line within the buffer.
    pub offset: usize,
}

/// Returns whether the given character is a "linear whitespace" character
/// according to RFC 822.
pub fn is_lwsp(ch: u8) -> bool {
    b' ' == ch || b'\t' == ch
}

impl<'a> Line<'a> {
    /// Returns the offset just past the end of this line, including its
    /// ending.
    pub fn end(&self) -> usize {
        self.offset + self.text.len() + self.ending.as_bytes().len()
    }

    /// Returns whether the given line is a header continuation (assuming it is
    /// in a header block).
    pub fn is_header_continuation(&self) -> bool {
        !self.text.is_empty() && is_lwsp(self.text[0])
    }

    /// Returns whether this line is blank.
    pub fn is_blank(&self) -> bool {
        self.text.is_empty()
    }

    /// Like `split_header`, but operates on a plain slice.
    pub fn split_header_slice(text: &[u8]) -> Option<(&str,&[u8])> {
        // MIME's weird quoting/commenting rules do not take place before the
        // colon ending the header name.
        //
        // [RFC 822, section 3.1.2]
        //
        // > The  field-name must be composed of printable ASCII characters
        // > (i.e., characters that  have  values  between  33.  and  126.,
        // > decimal, except colon).  The field-body may be composed of any
        // > ASCII characters, except CR or LF.
        //
        // (Though note that our header unfolder preserves CR and LF in the
        // field-body.)

        let mut colon = 0;
        loop {
            if colon >= text.len() {
                return None;
            }
            if b':' == text[colon] {
                break;
            }
            if text[colon] < 33 || text[colon] > 126 {
                return None;
            }
            colon += 1;
        }

        // field-name is invalid if empty
        if 0 == colon {
            return None;
        }

        str::from_utf8(&text[0..colon]).ok().map(
            |name| (name, &text[colon + 1 ..]))
    }

    /// Attempts to interpret this line as a MIME header, splitting it into its
    /// name and value parts.
    ///
    /// Leading whitespace in the value is not removed. While the header name
    /// is constrained to printable ASCII, this function permits arbitrary
    /// binary data in the value.
    pub fn split_header(&self) -> Option<(&'a str,&'a [u8])> {
        Line::split_header_slice(self.text)
    }
}

/// Iterates over the physical lines of an in-memory buffer.
///
/// Concatenating `text` and `ending` of every line yields exactly the input.
#[derive(Clone,Debug)]
pub struct Lines<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Lines<'a> {
    pub fn new(src: &'a [u8]) -> Self {
        Lines { src: src, pos: 0 }
    }
}

impl<'a> Iterator for Lines<'a> {
    type Item = Line<'a>;

    fn next(&mut self) -> Option<Line<'a>> {
        if self.pos >= self.src.len() {
            return None;
        }

        let offset = self.pos;
        let rest = &self.src[offset..];
        let line = match rest.iter().position(|&b| b'\n' == b) {
            Some(lf) if lf > 0 && b'\r' == rest[lf - 1] => Line {
                text: &rest[..lf - 1],
                ending: LineEnding::CRLF,
                offset: offset,
            },
            Some(lf) => Line {
                text: &rest[..lf],
                ending: LineEnding::LF,
                offset: offset,
            },
            None => Line {
                text: rest,
                ending: LineEnding::Nil,
                offset: offset,
            },
        };
        self.pos = line.end();
        Some(line)
    }
}

/// Returns the line ending used by the first line of `src` that has one.
pub fn first_line_ending(src: &[u8]) -> LineEnding {
    Lines::new(src).map(|line| line.ending)
        .find(|&ending| LineEnding::Nil != ending)
        .unwrap_or(LineEnding::Nil)
}

/// Rewrites every line ending in `src` to `ending`.
///
/// A final line without an ending is left without one.
pub fn convert_line_endings(src: &[u8], ending: LineEnding) -> Vec<u8> {
    let mut dst = Vec::with_capacity(src.len() + src.len() / 32);
    for line in Lines::new(src) {
        dst.extend_from_slice(line.text);
        if LineEnding::Nil != line.ending {
            dst.extend_from_slice(ending.as_bytes());
        }
    }
    dst
}

/// Splits a trailing line ending off `src`, if it has one.
pub fn split_trailing_ending(src: &[u8]) -> (&[u8], LineEnding) {
    if src.ends_with(b"\r\n") {
        (&src[..src.len() - 2], LineEnding::CRLF)
    } else if src.ends_with(b"\n") {
        (&src[..src.len() - 1], LineEnding::LF)
    } else {
        (src, LineEnding::Nil)
    }
}

/// The role a line plays within a multipart body.
#[derive(Clone,Copy,Debug,PartialEq,Eq)]
pub enum DelimiterKind {
    /// `--boundary`, starting a new body part.
    Delimiter,
    /// `--boundary--`, terminating the multipart.
    Close,
}

/// Determines whether `text` is a delimiter line for `boundary`.
///
/// A line only counts if nothing but linear whitespace follows the boundary
/// (and its closing `--`), so a nested boundary which merely extends the outer
/// one never terminates the outer part. On success, returns the kind of the
/// line and the trailing whitespace ("transport padding").
pub fn classify_delimiter<'a>(text: &'a [u8], boundary: &[u8])
                              -> Option<(DelimiterKind, &'a [u8])> {
    if text.len() < boundary.len() + 2 ||
        b"--"[..] != text[0..2] ||
        boundary != &text[2..2 + boundary.len()]
    {
        return None;
    }

    let rest = &text[2 + boundary.len()..];
    let (kind, padding) = if rest.starts_with(b"--") {
        (DelimiterKind::Close, &rest[2..])
    } else {
        (DelimiterKind::Delimiter, rest)
    };

    if padding.iter().all(|&ch| is_lwsp(ch)) {
        Some((kind, padding))
    } else {
        None
    }
}

/// Returns whether any line of `src` begins with `--` followed by `boundary`.
pub fn contains_delimiter_prefix(src: &[u8], boundary: &[u8]) -> bool {
    Lines::new(src).any(|line| {
        line.text.len() >= boundary.len() + 2 &&
            b"--"[..] == line.text[0..2] &&
            boundary == &line.text[2..2 + boundary.len()]
    })
}

/// A deserialised representation of the Content-Type header.
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct ContentType {
    /// The top-level content type, eg, "multipart" or "text".
    pub toplevel: Vec<u8>,
    /// The content subtype, eg, "alternative" or "plain".
    pub subtype: Vec<u8>,
    /// All attribute/value pairs, in the order they occurred.
    pub params: Vec<(Vec<u8>, Vec<u8>)>,
}

impl ContentType {
    /// Returns whether this `ContentType` has a top-level type matching `tl`.
    pub fn is_toplevel_type(&self, tl: &str) -> bool {
        tl.as_bytes().eq_ignore_ascii_case(&self.toplevel)
    }

    /// Returns whether this `ContentType` has a subtype matching `st`.
    ///
    /// The actual subtype may be an X- prefix to `st`.
    pub fn is_subtype(&self, st: &str) -> bool {
        st.as_bytes().eq_ignore_ascii_case(&self.subtype) ||
            (self.subtype.len() > 2 &&
             b"x-".eq_ignore_ascii_case(&self.subtype[0..2]) &&
             st.as_bytes().eq_ignore_ascii_case(&self.subtype[2..]))
    }

    /// Returns whether this is `tl/st`.
    pub fn is(&self, tl: &str, st: &str) -> bool {
        self.is_toplevel_type(tl) && self.is_subtype(st)
    }

    /// Returns the value of the last non-empty parameter named `name`.
    pub fn param(&self, name: &str) -> Option<&[u8]> {
        self.params.iter().rev()
            .find(|pair| {
                name.as_bytes().eq_ignore_ascii_case(&pair.0) &&
                    !pair.1.is_empty()
            })
            .map(|pair| &pair.1[..])
    }

    /// If the Content-Type defines a "boundary" attribute, the value of that
    /// boundary.
    pub fn boundary(&self) -> Option<&[u8]> {
        self.param("boundary")
    }
}

/// Formats a Content-Type header value from a MIME type and parameters.
///
/// Parameter values are always emitted as quoted-strings.
pub fn format_content_type(mime_type: &str, params: &[(&str, &[u8])]) -> Vec<u8> {
    let mut value = mime_type.as_bytes().to_vec();
    for &(attr, val) in params {
        value.extend_from_slice(b"; ");
        value.extend_from_slice(attr.as_bytes());
        value.extend_from_slice(b"=\"");
        for &ch in val {
            if b'"' == ch || b'\\' == ch {
                value.push(b'\\');
            }
            value.push(ch);
        }
        value.push(b'"');
    }
    value
}

#[derive(Clone,Copy,Debug,PartialEq,Eq)]
enum Token {
    Byte(u8),
    Space,
    Slash,
    Semicolon,
    Equals,
}

/// Tokenises a Content-Type value per [RFC 2045], which differs in small ways
/// from the structured header syntax of [RFC 822].
///
/// Anything goes: binary data is accepted, `<>@,[]?` are plain bytes, quoted
/// strings may be glued to tokens within one word, and unclosed quotes or
/// comments and a dangling backslash are ignored.
fn tokenize(data: &[u8]) -> Vec<Token> {
    let mut tokens = Vec::with_capacity(data.len());
    let mut comment_depth = 0u32;
    let mut in_quote = false;
    let mut escaped = false;

    for &ch in data {
        if escaped {
            escaped = false;
            if 0 == comment_depth {
                tokens.push(Token::Byte(ch));
            }
            continue;
        }

        match ch {
            b'\\' => escaped = true,
            // Quotes toggle even inside comments.
            b'"' => in_quote = !in_quote,
            // Folding within a quoted-string disappears.
            b'\r' | b'\n' if in_quote => (),
            _ if in_quote => if 0 == comment_depth {
                tokens.push(Token::Byte(ch));
            },
            b'(' => comment_depth += 1,
            b')' => {
                comment_depth = comment_depth.saturating_sub(1);
                tokens.push(Token::Space);
            },
            _ if comment_depth > 0 => (),
            b'/' => tokens.push(Token::Slash),
            b'=' => tokens.push(Token::Equals),
            b';' => tokens.push(Token::Semicolon),
            // Header values keep their folding, hence CR and LF.
            b' ' | b'\t' | b'\r' | b'\n' => tokens.push(Token::Space),
            _ => tokens.push(Token::Byte(ch)),
        }
    }

    tokens
}

struct Tokens {
    tokens: Vec<Token>,
    pos: usize,
}

impl Tokens {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).cloned()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    /// Reads the next run of bytes, skipping leading whitespace.
    fn word(&mut self) -> Vec<u8> {
        while Some(Token::Space) == self.peek() {
            self.pos += 1;
        }

        let mut dst = Vec::new();
        while let Some(Token::Byte(ch)) = self.peek() {
            dst.push(ch);
            self.pos += 1;
        }
        dst
    }

    fn skip_past(&mut self, stop: Token) {
        while let Some(token) = self.peek() {
            self.pos += 1;
            if stop == token {
                break;
            }
        }
    }
}

/// Parses a Content-Type header.
///
/// The parser accepts nearly anything. A result is only guaranteed to have a
/// non-empty top-level type and subtype. [RFC 2231] continuations and
/// percent-encoded parameters are merged and decoded; the charset they
/// declare is not applied.
pub fn parse_content_type(data: &[u8]) -> Option<ContentType> {
    let mut tokens = Tokens { tokens: tokenize(data), pos: 0 };

    let toplevel = tokens.word();
    tokens.skip_past(Token::Slash);
    let subtype = tokens.word();
    tokens.skip_past(Token::Semicolon);
    if toplevel.is_empty() || subtype.is_empty() {
        return None;
    }

    let mut params = Vec::new();
    while !tokens.at_end() {
        let attr = tokens.word();
        tokens.skip_past(Token::Equals);
        let value = tokens.word();
        tokens.skip_past(Token::Semicolon);

        if !attr.is_empty() {
            params.push((attr, value));
        }
    }

    Some(ContentType {
        toplevel: toplevel,
        subtype: subtype,
        params: merge_extended_params(params),
    })
}

/// An [RFC 2231] attribute: `name*`, `name*N` or `name*N*`.
struct ExtendedAttr<'a> {
    name: &'a [u8],
    section: Option<u32>,
    encoded: bool,
}

fn extended_attr(attr: &[u8]) -> Option<ExtendedAttr> {
    let star = attr.iter().position(|&ch| b'*' == ch)?;
    let (name, rest) = (&attr[..star], &attr[star + 1..]);
    if name.is_empty() {
        return None;
    }
    if rest.is_empty() {
        return Some(ExtendedAttr { name: name, section: None, encoded: true });
    }

    let (digits, encoded) = match rest.split_last() {
        Some((&b'*', digits)) => (digits, true),
        _ => (rest, false),
    };
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let section = str::from_utf8(digits).ok()?.parse().ok()?;
    Some(ExtendedAttr { name: name, section: Some(section), encoded: encoded })
}

/// Drops the `charset'language'` prefix of an initial extended value.
fn strip_charset(value: &[u8]) -> &[u8] {
    let mut quotes = value.iter().enumerate()
        .filter(|&(_, &ch)| b'\'' == ch)
        .map(|(ix, _)| ix);
    match (quotes.next(), quotes.next()) {
        (Some(_), Some(second)) => &value[second + 1..],
        _ => value,
    }
}

fn percent_decode(src: &[u8]) -> Vec<u8> {
    let mut dst = Vec::with_capacity(src.len());
    let mut i = 0;
    while i < src.len() {
        if b'%' == src[i] {
            if let (Some(hi), Some(lo)) = (
                src.get(i + 1).cloned().and_then(hex_value),
                src.get(i + 2).cloned().and_then(hex_value))
            {
                dst.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        dst.push(src[i]);
        i += 1;
    }
    dst
}

/// Joins the sections of continued parameters and decodes extended values.
///
/// A merged parameter takes the place of its first section; sections are
/// ordered by number, not by appearance.
fn merge_extended_params(params: Vec<(Vec<u8>, Vec<u8>)>)
                         -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut merged: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(params.len());
    let mut continued: BTreeMap<Vec<u8>, (usize, Vec<(u32, Vec<u8>)>)> =
        BTreeMap::new();

    for (attr, value) in params {
        let ext = match extended_attr(&attr) {
            Some(ext) => ext,
            None => {
                merged.push((attr, value));
                continue;
            },
        };

        let section = match ext.section {
            None => {
                merged.push((ext.name.to_vec(),
                             percent_decode(strip_charset(&value))));
                continue;
            },
            Some(section) => section,
        };

        let decoded = match (ext.encoded, section) {
            (false, _) => value,
            (true, 0) => percent_decode(strip_charset(&value)),
            (true, _) => percent_decode(&value),
        };
        let slot = merged.len();
        let entry = continued.entry(ext.name.to_ascii_lowercase())
            .or_insert_with(|| (slot, Vec::new()));
        if slot == entry.0 {
            merged.push((ext.name.to_vec(), Vec::new()));
        }
        entry.1.push((section, decoded));
    }

    for (_, (slot, mut sections)) in continued {
        sections.sort_by_key(|&(section, _)| section);
        merged[slot].1 = sections.into_iter()
            .flat_map(|(_, value)| value).collect();
    }

    merged
}

/// Undoes a Content-Transfer-Encoding.
///
/// Only base64 and quoted-printable change anything; every other encoding
/// (7bit, 8bit, binary, or something unknown) is returned as-is. Malformed
/// base64 is also returned as-is rather than half-decoded.
pub fn decode_transfer_encoding(encoding: Option<&str>, body: &[u8]) -> Vec<u8> {
    match encoding.map(|e| e.trim().to_ascii_lowercase()) {
        Some(ref e) if "base64" == e => {
            let compact: Vec<u8> = body.iter().cloned()
                .filter(|ch| !ch.is_ascii_whitespace())
                .collect();
            base64::engine::general_purpose::STANDARD.decode(&compact)
                .unwrap_or_else(|_| body.to_vec())
        },
        Some(ref e) if "quoted-printable" == e => decode_quoted_printable(body),
        _ => body.to_vec(),
    }
}

fn hex_value(ch: u8) -> Option<u8> {
    match ch {
        b'0'..=b'9' => Some(ch - b'0'),
        b'a'..=b'f' => Some(ch - b'a' + 10),
        b'A'..=b'F' => Some(ch - b'A' + 10),
        _ => None,
    }
}

/// Decodes quoted-printable text as per [RFC 2045] section 6.7.
///
/// Line endings are kept as they appear in the input. Invalid escapes are
/// passed through literally.
pub fn decode_quoted_printable(body: &[u8]) -> Vec<u8> {
    let mut dst = Vec::with_capacity(body.len());
    for line in Lines::new(body) {
        // Trailing whitespace was added in transport and is not content.
        let mut text = line.text;
        while let Some((&last, rest)) = text.split_last() {
            if !is_lwsp(last) {
                break;
            }
            text = rest;
        }

        let mut soft_break = false;
        let mut i = 0;
        while i < text.len() {
            if b'=' == text[i] {
                if i + 1 == text.len() {
                    soft_break = true;
                    break;
                }
                if let (Some(hi), Some(lo)) = (
                    text.get(i + 1).cloned().and_then(hex_value),
                    text.get(i + 2).cloned().and_then(hex_value))
                {
                    dst.push(hi << 4 | lo);
                    i += 3;
                    continue;
                }
            }
            dst.push(text[i]);
            i += 1;
        }

        if !soft_break {
            dst.extend_from_slice(line.ending.as_bytes());
        }
    }
    dst
}
