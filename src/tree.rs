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

//! In-memory tree representation of a MIME message.
//!
//! Parsing is lossless: for any input accepted by `parse()`, serialising the
//! resulting tree reproduces the input byte-for-byte. To get there, every
//! header remembers its own folding and line ending, every delimiter line
//! remembers the line ending in front of it (which [RFC 2046] counts as part
//! of the delimiter, not the preceding body part) and any transport padding
//! behind it, and bodies are kept in their transfer encoding.
//!
//! Trees built from scratch by the envelope code use the same types, with
//! `Multipart::new()` supplying the conventional layout.

use std::collections::BTreeSet;
use std::slice;

use tracing::debug;

use crate::error::{Error, Result};
use crate::mime::{self, ContentType, DelimiterKind, LineEnding, Lines};

/// Maximum depth of nesting before we simply keep the rest of the entity as
/// an opaque leaf instead of recursing.
const MAX_DEPTH : u32 = 256;

const CONTENT_PREFIX : &str = "Content-";
pub const CONTENT_TYPE : &str = "Content-Type";
pub const CONTENT_TRANSFER_ENCODING : &str = "Content-Transfer-Encoding";
pub const MIME_VERSION : &str = "MIME-Version";

/// A single header field.
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct Header {
    pub name: String,
    /// Everything after the colon, verbatim. This includes leading whitespace
    /// and, for folded headers, the interior line endings.
    pub value: Vec<u8>,
    /// The line ending terminating the last physical line of the header.
    pub ending: LineEnding,
}

impl Header {
    /// Creates a header in the conventional `Name: value` form.
    pub fn new(name: &str, value: &[u8], ending: LineEnding) -> Header {
        let mut raw = Vec::with_capacity(value.len() + 1);
        raw.push(b' ');
        raw.extend_from_slice(value);
        Header { name: name.to_owned(), value: raw, ending: ending }
    }

    /// Returns whether this header is called `name`, ignoring case.
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// Returns whether this is one of the `Content-*` headers that describe
    /// the body rather than the message.
    pub fn is_content_header(&self) -> bool {
        let name = self.name.as_bytes();
        name.len() > CONTENT_PREFIX.len() &&
            name[..CONTENT_PREFIX.len()].eq_ignore_ascii_case(
                CONTENT_PREFIX.as_bytes())
    }

    /// The value with folding removed and surrounding whitespace trimmed.
    pub fn unfolded(&self) -> Vec<u8> {
        let unfolded: Vec<u8> = self.value.iter().cloned()
            .filter(|&ch| b'\r' != ch && b'\n' != ch)
            .collect();
        let start = unfolded.iter().position(|&ch| !mime::is_lwsp(ch))
            .unwrap_or(unfolded.len());
        let end = unfolded.iter().rposition(|&ch| !mime::is_lwsp(ch))
            .map_or(start, |ix| ix + 1);
        unfolded[start..end].to_vec()
    }

    /// Like `unfolded()`, but as a (lossily decoded) string.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.unfolded()).into_owned()
    }

    pub fn write_to(&self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(self.name.as_bytes());
        dst.push(b':');
        dst.extend_from_slice(&self.value);
        dst.extend_from_slice(self.ending.as_bytes());
    }
}

/// An ordered header block.
///
/// This is deliberately not a map: duplicates are kept, in order, and lookups
/// by name can return every match.
#[derive(Clone,Debug,Default,PartialEq,Eq)]
pub struct Headers {
    fields: Vec<Header>,
}

impl Headers {
    pub fn new() -> Self {
        Headers::default()
    }

    pub fn iter(&self) -> slice::Iter<Header> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn push(&mut self, header: Header) {
        self.fields.push(header);
    }

    /// Returns all headers named `name`, in order.
    pub fn get_all<'a>(&'a self, name: &'a str)
                       -> impl Iterator<Item = &'a Header> + 'a {
        self.fields.iter().filter(move |h| h.is(name))
    }

    /// Returns the first header named `name`.
    pub fn get(&self, name: &str) -> Option<&Header> {
        self.fields.iter().find(|h| h.is(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Removes every header named `name`, returning how many there were.
    pub fn remove_all(&mut self, name: &str) -> usize {
        let before = self.fields.len();
        self.fields.retain(|h| !h.is(name));
        before - self.fields.len()
    }

    pub fn retain<F : FnMut(&Header) -> bool>(&mut self, f: F) {
        self.fields.retain(f);
    }

    pub fn iter_mut(&mut self) -> slice::IterMut<Header> {
        self.fields.iter_mut()
    }

    /// Extracts and parses the first Content-Type header.
    pub fn content_type(&self) -> Option<ContentType> {
        self.get(CONTENT_TYPE).and_then(
            |ct| mime::parse_content_type(&ct.value))
    }

    /// Returns the Content-Transfer-Encoding, lowercased.
    pub fn transfer_encoding(&self) -> Option<String> {
        self.get(CONTENT_TRANSFER_ENCODING).map(
            |h| h.text().to_ascii_lowercase())
    }

    /// Splits this block into the message headers and the `Content-*`
    /// headers, keeping the relative order within each.
    pub fn split_content(self) -> (Headers, Headers) {
        let (content, other): (Vec<_>, Vec<_>) = self.fields.into_iter()
            .partition(|h| h.is_content_header());
        (Headers { fields: other }, Headers { fields: content })
    }

    pub fn extend<I : IntoIterator<Item = Header>>(&mut self, iter: I) {
        self.fields.extend(iter);
    }

    pub fn write_to(&self, dst: &mut Vec<u8>) {
        for header in &self.fields {
            header.write_to(dst);
        }
    }
}

impl IntoIterator for Headers {
    type Item = Header;
    type IntoIter = ::std::vec::IntoIter<Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a Header;
    type IntoIter = slice::Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}

impl ::std::iter::FromIterator<Header> for Headers {
    fn from_iter<I : IntoIterator<Item = Header>>(iter: I) -> Self {
        Headers { fields: iter.into_iter().collect() }
    }
}

/// A delimiter line within a multipart body.
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct Delimiter {
    /// The line ending preceding the delimiter line; `Nil` if the delimiter
    /// is at the very start of the multipart body.
    pub lead: LineEnding,
    /// Whitespace following the boundary on the delimiter line.
    pub padding: Vec<u8>,
    /// The ending of the delimiter line itself.
    pub ending: LineEnding,
}

impl Delimiter {
    fn write_to(&self, dst: &mut Vec<u8>, boundary: &[u8], close: bool) {
        dst.extend_from_slice(self.lead.as_bytes());
        dst.extend_from_slice(b"--");
        dst.extend_from_slice(boundary);
        if close {
            dst.extend_from_slice(b"--");
        }
        dst.extend_from_slice(&self.padding);
        dst.extend_from_slice(self.ending.as_bytes());
    }
}

#[derive(Clone,Debug,PartialEq,Eq)]
pub struct Part {
    pub delimiter: Delimiter,
    pub node: MimeNode,
}

#[derive(Clone,Debug,PartialEq,Eq)]
pub struct Multipart {
    pub boundary: Vec<u8>,
    pub preamble: Vec<u8>,
    pub parts: Vec<Part>,
    /// The close delimiter, if the input had one.
    pub close: Option<Delimiter>,
    /// Anything following the close delimiter.
    pub epilogue: Vec<u8>,
}

impl Multipart {
    /// Assembles a new multipart from `children`, with no preamble or
    /// epilogue and every line terminated by `ending`.
    pub fn new(boundary: Vec<u8>, children: Vec<MimeNode>,
               ending: LineEnding) -> Multipart {
        let parts = children.into_iter().enumerate().map(|(ix, node)| Part {
            delimiter: Delimiter {
                lead: if 0 == ix { LineEnding::Nil } else { ending },
                padding: Vec::new(),
                ending: ending,
            },
            node: node,
        }).collect();

        Multipart {
            boundary: boundary,
            preamble: Vec::new(),
            parts: parts,
            close: Some(Delimiter {
                lead: ending,
                padding: Vec::new(),
                ending: ending,
            }),
            epilogue: Vec::new(),
        }
    }

    /// Sets the text shown by non-MIME readers before the first part.
    pub fn with_preamble(mut self, text: &[u8]) -> Multipart {
        self.preamble = text.to_vec();
        if let Some(first) = self.parts.first_mut() {
            first.delimiter.lead = first.delimiter.ending;
        }
        self
    }

    /// Removes and returns the part at `index`.
    ///
    /// The following delimiter inherits the removed one's leading line ending
    /// so the surrounding text is left as it was.
    pub fn remove_part(&mut self, index: usize) -> MimeNode {
        let removed = self.parts.remove(index);
        if let Some(next) = self.parts.get_mut(index) {
            next.delimiter.lead = removed.delimiter.lead;
        } else if let Some(ref mut close) = self.close {
            close.lead = removed.delimiter.lead;
        }
        removed.node
    }

    pub fn children(&self) -> impl Iterator<Item = &MimeNode> {
        self.parts.iter().map(|part| &part.node)
    }

    fn write_to(&self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(&self.preamble);
        for part in &self.parts {
            part.delimiter.write_to(dst, &self.boundary, false);
            part.node.write_to(dst);
        }
        if let Some(ref close) = self.close {
            close.write_to(dst, &self.boundary, true);
            dst.extend_from_slice(&self.epilogue);
        }
    }
}

#[derive(Clone,Debug,PartialEq,Eq)]
pub enum Body {
    /// Raw body bytes, still in their transfer encoding.
    Leaf(Vec<u8>),
    Composite(Multipart),
    /// The body of a `message/rfc822` entity.
    Message(Box<MimeNode>),
}

/// A MIME entity: a header block and a body.
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct MimeNode {
    pub headers: Headers,
    /// The ending of the blank line separating headers and body, or `Nil` if
    /// the entity has no such line (and thus no body).
    pub separator: LineEnding,
    pub body: Body,
}

impl MimeNode {
    pub fn leaf(headers: Headers, body: Vec<u8>, ending: LineEnding)
                -> MimeNode {
        MimeNode {
            headers: headers,
            separator: ending,
            body: Body::Leaf(body),
        }
    }

    pub fn composite(headers: Headers, multipart: Multipart,
                     ending: LineEnding) -> MimeNode {
        MimeNode {
            headers: headers,
            separator: ending,
            body: Body::Composite(multipart),
        }
    }

    pub fn content_type(&self) -> Option<ContentType> {
        self.headers.content_type()
    }

    pub fn transfer_encoding(&self) -> Option<String> {
        self.headers.transfer_encoding()
    }

    pub fn charset(&self) -> Option<String> {
        self.content_type()
            .and_then(|ct| ct.param("charset").map(
                |cs| String::from_utf8_lossy(cs).to_ascii_lowercase()))
    }

    /// Returns the line-ending convention of this entity, judged by its
    /// header block.
    pub fn line_ending(&self) -> LineEnding {
        self.headers.iter().map(|h| h.ending)
            .find(|&ending| LineEnding::Nil != ending)
            .unwrap_or(self.separator)
    }

    /// Adds the boundary of every multipart in this tree to `into`.
    pub fn collect_boundaries(&self, into: &mut BTreeSet<Vec<u8>>) {
        match self.body {
            Body::Leaf(_) => (),
            Body::Message(ref inner) => inner.collect_boundaries(into),
            Body::Composite(ref multipart) => {
                into.insert(multipart.boundary.clone());
                for child in multipart.children() {
                    child.collect_boundaries(into);
                }
            },
        }
    }

    /// Returns the serialised body with any transfer encoding undone.
    ///
    /// Only leaves are ever encoded; other bodies are returned as serialised.
    pub fn decoded_body(&self) -> Vec<u8> {
        match self.body {
            Body::Leaf(ref body) => mime::decode_transfer_encoding(
                self.transfer_encoding().as_deref(), body),
            _ => self.body_bytes(),
        }
    }

    /// Returns the serialised body, without the header block.
    pub fn body_bytes(&self) -> Vec<u8> {
        let mut dst = Vec::new();
        self.write_body_to(&mut dst);
        dst
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut dst = Vec::new();
        self.write_to(&mut dst);
        dst
    }

    pub fn write_to(&self, dst: &mut Vec<u8>) {
        self.headers.write_to(dst);
        dst.extend_from_slice(self.separator.as_bytes());
        self.write_body_to(dst);
    }

    fn write_body_to(&self, dst: &mut Vec<u8>) {
        match self.body {
            Body::Leaf(ref body) => dst.extend_from_slice(body),
            Body::Composite(ref multipart) => multipart.write_to(dst),
            Body::Message(ref inner) => inner.write_to(dst),
        }
    }
}

/// Parses a complete message.
pub fn parse(src: &[u8]) -> Result<MimeNode> {
    parse_entity(src, 0)
}

/// An entity whose header block has been read but whose body has not.
#[derive(Clone,Debug)]
pub struct Entity<'a> {
    pub headers: Headers,
    pub separator: LineEnding,
    pub body: &'a [u8],
}

/// Reads the header block at the start of `src`.
///
/// The block ends at the first blank line. A line which is neither a header
/// nor a continuation also ends it; in that case there is no separator and
/// the body starts at that line, which keeps serialisation lossless for
/// messages missing the blank line.
pub fn split_entity(src: &[u8]) -> Entity {
    let mut headers = Headers::new();

    for line in Lines::new(src) {
        if line.is_blank() {
            return Entity {
                headers: headers,
                separator: line.ending,
                body: &src[line.end()..],
            };
        }

        if line.is_header_continuation() {
            if let Some(last) = headers.fields.last_mut() {
                last.value.extend_from_slice(last.ending.as_bytes());
                last.value.extend_from_slice(line.text);
                last.ending = line.ending;
                continue;
            }
        } else if let Some((name, value)) = line.split_header() {
            headers.push(Header {
                name: name.to_owned(),
                value: value.to_vec(),
                ending: line.ending,
            });
            continue;
        }

        return Entity {
            headers: headers,
            separator: LineEnding::Nil,
            body: &src[line.offset..],
        };
    }

    Entity {
        headers: headers,
        separator: LineEnding::Nil,
        body: &src[src.len()..],
    }
}

fn parse_entity(src: &[u8], depth: u32) -> Result<MimeNode> {
    let entity = split_entity(src);
    let body = parse_body(&entity.headers, entity.body, depth)?;
    Ok(MimeNode {
        headers: entity.headers,
        separator: entity.separator,
        body: body,
    })
}

/// Interprets `body` according to the Content-Type in `headers`.
pub fn parse_body(headers: &Headers, body: &[u8], depth: u32) -> Result<Body> {
    let content_type = match headers.content_type() {
        Some(ct) => ct,
        None => return Ok(Body::Leaf(body.to_vec())),
    };

    if depth >= MAX_DEPTH {
        debug!("MIME nesting too deep, keeping entity opaque");
        return Ok(Body::Leaf(body.to_vec()));
    }

    if content_type.is_toplevel_type("multipart") {
        let boundary = content_type.boundary().ok_or_else(|| Error::Parse(
            format!("{}/{} has no boundary",
                    String::from_utf8_lossy(&content_type.toplevel),
                    String::from_utf8_lossy(&content_type.subtype))))?;
        parse_multipart(body, boundary, depth).map(Body::Composite)
    } else if content_type.is("message", "rfc822") &&
        is_identity_encoding(headers.transfer_encoding().as_deref())
    {
        match parse_entity(body, depth + 1) {
            Ok(inner) => Ok(Body::Message(Box::new(inner))),
            Err(err) => {
                debug!("keeping unparseable message/rfc822 opaque: {}", err);
                Ok(Body::Leaf(body.to_vec()))
            },
        }
    } else {
        Ok(Body::Leaf(body.to_vec()))
    }
}

fn is_identity_encoding(encoding: Option<&str>) -> bool {
    match encoding {
        None | Some("7bit") | Some("8bit") | Some("binary") => true,
        _ => false,
    }
}

fn parse_multipart(body: &[u8], boundary: &[u8], depth: u32)
                   -> Result<Multipart> {
    let split = split_multipart(body, boundary)?;
    let mut parts = Vec::with_capacity(split.parts.len());
    for (delimiter, content) in split.parts {
        parts.push(Part {
            delimiter: delimiter,
            node: parse_entity(content, depth + 1)?,
        });
    }

    Ok(Multipart {
        boundary: boundary.to_vec(),
        preamble: split.preamble.to_vec(),
        parts: parts,
        close: split.close,
        epilogue: split.epilogue.to_vec(),
    })
}

/// The raw pieces of a multipart body.
///
/// Each part slice is exactly the octets [RFC 1847] says a signature over that
/// part covers: everything between its delimiter line and the line ending
/// preceding the next delimiter.
#[derive(Clone,Debug)]
pub struct MultipartSplit<'a> {
    pub preamble: &'a [u8],
    pub parts: Vec<(Delimiter, &'a [u8])>,
    pub close: Option<Delimiter>,
    pub epilogue: &'a [u8],
}

/// Cuts a multipart body into its parts without parsing them.
///
/// Fails if no delimiter line for `boundary` occurs at all.
pub fn split_multipart<'a>(body: &'a [u8], boundary: &[u8])
                           -> Result<MultipartSplit<'a>> {
    let mut preamble = None;
    let mut parts = Vec::new();
    let mut open: Option<Delimiter> = None;
    let mut segment_start = 0;

    for line in Lines::new(body) {
        let (kind, padding) = match mime::classify_delimiter(
            line.text, boundary)
        {
            Some(delim) => delim,
            None => continue,
        };

        let (content, lead) = mime::split_trailing_ending(
            &body[segment_start..line.offset]);
        let delimiter = Delimiter {
            lead: lead,
            padding: padding.to_vec(),
            ending: line.ending,
        };
        match open.take() {
            Some(prev) => parts.push((prev, content)),
            None => preamble = Some(content),
        }
        segment_start = line.end();

        match kind {
            DelimiterKind::Delimiter => open = Some(delimiter),
            DelimiterKind::Close => return Ok(MultipartSplit {
                preamble: preamble.unwrap_or(content),
                parts: parts,
                close: Some(delimiter),
                epilogue: &body[segment_start..],
            }),
        }
    }

    let preamble = preamble.ok_or_else(|| Error::Parse(format!(
        "no delimiter for boundary \"{}\"",
        String::from_utf8_lossy(boundary))))?;
    // Unterminated multipart; the last part runs to the end of the input.
    if let Some(prev) = open {
        parts.push((prev, &body[segment_start..]));
    }
    Ok(MultipartSplit {
        preamble: preamble,
        parts: parts,
        close: None,
        epilogue: &body[body.len()..],
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn roundtrip(input: &str) -> MimeNode {
        let node = parse(input.as_bytes()).expect("parse failed");
        let output = node.serialize();
        if input.as_bytes() != &output[..] {
            println!("Expected:\n{}\nGot:\n{}\n",
                     input, String::from_utf8_lossy(&output));
            panic!("Serialisation was not lossless.");
        }
        node
    }

    fn composite(node: &MimeNode) -> &Multipart {
        match node.body {
            Body::Composite(ref mp) => mp,
            ref other => panic!("Not a multipart: {:?}", other),
        }
    }

    fn leaf(node: &MimeNode) -> &[u8] {
        match node.body {
            Body::Leaf(ref body) => body,
            ref other => panic!("Not a leaf: {:?}", other),
        }
    }

    #[test]
    fn simple_message() {
        let node = roundtrip("From: jason@lin.gl\n\
                              Subject: Test\n\
                              \n\
                              Body\n");
        assert_eq!(2, node.headers.len());
        assert_eq!("Test", node.headers.get("subject").unwrap().text());
        assert_eq!(LineEnding::LF, node.separator);
        assert_eq!(b"Body\n", leaf(&node));
    }

    #[test]
    fn empty_input() {
        let node = roundtrip("");
        assert!(node.headers.is_empty());
        assert_eq!(LineEnding::Nil, node.separator);
    }

    #[test]
    fn headers_only_message() {
        let node = roundtrip("From: a@example.com\r\nSubject: Hi");
        assert_eq!(2, node.headers.len());
        assert_eq!(LineEnding::Nil, node.separator);
        assert_eq!(b"", leaf(&node));
        assert_eq!(LineEnding::CRLF, node.line_ending());
    }

    #[test]
    fn folded_headers_kept_verbatim() {
        let node = roundtrip("Received: from example.com\n    by example.com\r\n\
                              \tfor <alice@example.com>\n\
                              Message-ID:\n <123@example.com>\n\
                              \n\
                              x");
        let received = node.headers.get("received").unwrap();
        assert_eq!(&b" from example.com\n    by example.com\r\n\
                      \tfor <alice@example.com>"[..], &received.value[..]);
        assert_eq!("from example.com    by example.com\tfor <alice@example.com>",
                   received.text());
        assert_eq!("<123@example.com>",
                   node.headers.get("Message-Id").unwrap().text());
    }

    #[test]
    fn duplicate_headers_kept_in_order() {
        let node = roundtrip("Received: one\n\
                              Subject: s\n\
                              Received: two\n\
                              \n");
        let received: Vec<_> = node.headers.get_all("Received")
            .map(|h| h.text()).collect();
        assert_eq!(vec!["one", "two"], received);
    }

    #[test]
    fn missing_blank_line_starts_body() {
        let node = roundtrip("Subject: s\n\
                              this is not a header\n");
        assert_eq!(1, node.headers.len());
        assert_eq!(LineEnding::Nil, node.separator);
        assert_eq!(b"this is not a header\n", leaf(&node));
    }

    const NESTED : &str =
        "From: jason@lin.gl\r\n\
         Content-Type: multipart/mixed; boundary=\"b1\"\r\n\
         \r\n\
         This is a multipart message.\r\n\
         --b1\r\n\
         Content-Type: multipart/alternative; boundary=b11\r\n\
         \r\n\
         --b11  \r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Transfer-Encoding: 8bit\r\n\
         \r\n\
         Für alle Räuber\r\n\
         --b11\r\n\
         Content-Type: text/html\r\n\
         \r\n\
         <p>hi</p>\r\n\
         \r\n\
         --b11--\r\n\
         --b1\r\n\
         Content-Type: message/rfc822\r\n\
         \r\n\
         Subject: forwarded\r\n\
         Content-Type: multipart/mixed; boundary=b1x\r\n\
         \r\n\
         --b1x\r\n\
         \r\n\
         inner\r\n\
         --b1x--\r\n\
         --b1--\r\n\
         epilogue\r\n";

    #[test]
    fn nested_multipart_structure() {
        let node = roundtrip(NESTED);
        let outer = composite(&node);
        assert_eq!(b"b1", &outer.boundary[..]);
        assert_eq!(b"This is a multipart message.", &outer.preamble[..]);
        assert_eq!(2, outer.parts.len());
        assert_eq!(b"epilogue\r\n", &outer.epilogue[..]);

        let alternative = composite(&outer.parts[0].node);
        assert_eq!(b"b11", &alternative.boundary[..]);
        assert_eq!(b"  ", &alternative.parts[0].delimiter.padding[..]);
        assert_eq!(LineEnding::Nil, alternative.parts[0].delimiter.lead);
        assert_eq!("Für alle Räuber".as_bytes(),
                   leaf(&alternative.parts[0].node));
        assert_eq!(Some("utf-8".to_owned()), alternative.parts[0].node.charset());
        assert_eq!(b"<p>hi</p>\r\n", leaf(&alternative.parts[1].node));

        match outer.parts[1].node.body {
            Body::Message(ref inner) => {
                assert_eq!("forwarded",
                           inner.headers.get("subject").unwrap().text());
                let mp = composite(inner);
                assert_eq!(b"b1x", &mp.boundary[..]);
                assert_eq!(b"inner", leaf(&mp.parts[0].node));
            },
            ref other => panic!("Not a message: {:?}", other),
        }

        let mut boundaries = BTreeSet::new();
        node.collect_boundaries(&mut boundaries);
        let expected: BTreeSet<Vec<u8>> = vec![
            b"b1".to_vec(), b"b11".to_vec(), b"b1x".to_vec()]
            .into_iter().collect();
        assert_eq!(expected, boundaries);
    }

    #[test]
    fn unterminated_multipart_lossless() {
        let node = roundtrip("Content-Type: multipart/mixed; boundary=x\n\
                              \n\
                              --x\n\
                              \n\
                              no close delimiter\n");
        let mp = composite(&node);
        assert!(mp.close.is_none());
        assert_eq!(b"no close delimiter\n", leaf(&mp.parts[0].node));
    }

    #[test]
    fn encoded_message_rfc822_kept_opaque() {
        let node = roundtrip("Content-Type: message/rfc822\n\
                              Content-Transfer-Encoding: base64\n\
                              \n\
                              U3ViamVjdDogeA==\n");
        assert_eq!(b"U3ViamVjdDogeA==\n", leaf(&node));
        assert_eq!(b"Subject: x".to_vec(), node.decoded_body());
    }

    #[test]
    fn multipart_without_boundary_rejected() {
        match parse(b"Content-Type: multipart/mixed\n\nfoo\n") {
            Err(Error::Parse(_)) => (),
            other => panic!("Unexpected result: {:?}", other),
        }
    }

    #[test]
    fn multipart_without_delimiter_rejected() {
        match parse(b"Content-Type: multipart/mixed; boundary=foo\n\nbar\n") {
            Err(Error::Parse(_)) => (),
            other => panic!("Unexpected result: {:?}", other),
        }
    }

    #[test]
    fn split_multipart_yields_signed_octets() {
        let body = b"--s\n\
                     Content-Type: text/plain\n\
                     \n\
                     signed text\n\
                     \n\
                     --s\n\
                     sig\n\
                     --s--\n";
        let split = split_multipart(body, b"s").unwrap();
        assert_eq!(2, split.parts.len());
        assert_eq!(&b"Content-Type: text/plain\n\nsigned text\n"[..],
                   split.parts[0].1);
        assert_eq!(LineEnding::LF, split.parts[1].0.lead);
        assert_eq!(b"sig", split.parts[1].1);
    }

    #[test]
    fn new_multipart_layout() {
        let mut headers = Headers::new();
        headers.push(Header::new(CONTENT_TYPE, b"text/plain", LineEnding::LF));
        let first = MimeNode::leaf(headers.clone(), b"one\n".to_vec(),
                                   LineEnding::LF);
        let second = MimeNode::leaf(headers, b"two".to_vec(), LineEnding::LF);
        let mp = Multipart::new(b"B".to_vec(), vec![first, second],
                                LineEnding::LF)
            .with_preamble(b"Preamble");

        let mut outer = Headers::new();
        outer.push(Header::new(CONTENT_TYPE, b"multipart/mixed; boundary=B",
                               LineEnding::LF));
        let node = MimeNode::composite(outer, mp, LineEnding::LF);
        let expected = "Content-Type: multipart/mixed; boundary=B\n\
                        \n\
                        Preamble\n\
                        --B\n\
                        Content-Type: text/plain\n\
                        \n\
                        one\n\
                        \n\
                        --B\n\
                        Content-Type: text/plain\n\
                        \n\
                        two\n\
                        --B--\n";
        assert_eq!(expected, String::from_utf8(node.serialize()).unwrap());
        assert_eq!(node, roundtrip(expected));
    }

    #[test]
    fn remove_part_keeps_layout() {
        let mut node = roundtrip("Content-Type: multipart/mixed; boundary=B\n\
                                  \n\
                                  --B\n\
                                  \n\
                                  one\n\
                                  --B\n\
                                  \n\
                                  two\n\
                                  --B--\n");
        if let Body::Composite(ref mut mp) = node.body {
            let removed = mp.remove_part(0);
            assert_eq!(b"one", leaf(&removed));
        }
        assert_eq!("Content-Type: multipart/mixed; boundary=B\n\
                    \n\
                    --B\n\
                    \n\
                    two\n\
                    --B--\n",
                   String::from_utf8(node.serialize()).unwrap());
    }

    #[test]
    fn split_content_headers() {
        let node = roundtrip("Subject: s\n\
                              Content-Type: text/plain\n\
                              MIME-Version: 1.0\n\
                              content-transfer-encoding: 7bit\n\
                              \n");
        let (other, content) = node.headers.split_content();
        let names: Vec<_> = other.iter().map(|h| h.name.clone()).collect();
        assert_eq!(vec!["Subject", "MIME-Version"], names);
        assert_eq!(2, content.len());
    }
}
