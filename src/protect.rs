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

//! "Memory Hole" header protection.
//!
//! Sensitive headers are copied into a `text/rfc822-headers` part which
//! travels inside the signed or encrypted payload. Optionally, their cleartext
//! copies in the outer header block are replaced with a placeholder.

use tracing::debug;

use crate::mime::{self, LineEnding};
use crate::tree::{self, Header, Headers, MimeNode, Multipart, CONTENT_TYPE,
                  MIME_VERSION};

/// The value cleartext copies of protected headers are replaced with.
pub const PLACEHOLDER : &str = "...";

/// The headers protected unless configured otherwise.
pub const DEFAULT_PROTECTED : [&str; 5] = [
    "Date", "From", "Message-ID", "Subject", "To",
];

pub const PROTECTED_HEADERS_PARAM : &str = "protected-headers";
pub const PROTECTED_HEADERS_VERSION : &[u8] = b"v1";

#[derive(Clone,Debug,PartialEq,Eq)]
pub struct ProtectOptions {
    /// Names of protected headers, matched case-insensitively.
    pub names: Vec<String>,
    /// Whether to replace the outer copies with `PLACEHOLDER`.
    pub placeholders: bool,
}

impl Default for ProtectOptions {
    fn default() -> Self {
        ProtectOptions {
            names: DEFAULT_PROTECTED.iter().map(|&n| n.to_owned()).collect(),
            placeholders: false,
        }
    }
}

impl ProtectOptions {
    pub fn is_protected(&self, name: &str) -> bool {
        self.names.iter().any(|n| n.eq_ignore_ascii_case(name))
    }

    /// Returns a copy of these options with placeholders switched on or off.
    pub fn with_placeholders(&self, placeholders: bool) -> Self {
        ProtectOptions {
            names: self.names.clone(),
            placeholders: placeholders,
        }
    }
}

/// Splits `headers` into the header block to leave in cleartext and the
/// `text/rfc822-headers` part carrying the protected ones.
///
/// The part lists protected headers in the order they occur in `headers`,
/// folding intact. Headers missing from the input are not invented.
pub fn protect(headers: &Headers, options: &ProtectOptions,
               ending: LineEnding) -> (Headers, MimeNode) {
    let mut outer = headers.clone();
    let mut body = Vec::new();

    for header in headers.iter().filter(|h| options.is_protected(&h.name)) {
        Header {
            ending: ending,
            .. header.clone()
        }.write_to(&mut body);
    }

    if options.placeholders {
        for header in outer.iter_mut()
            .filter(|h| options.is_protected(&h.name))
        {
            header.value = format!(" {}", PLACEHOLDER).into_bytes();
        }
    }

    (outer, protected_part(body, ending))
}

fn protected_part(body: Vec<u8>, ending: LineEnding) -> MimeNode {
    let mut headers = Headers::new();
    headers.push(Header::new(CONTENT_TYPE, &mime::format_content_type(
        "text/rfc822-headers",
        &[(PROTECTED_HEADERS_PARAM, PROTECTED_HEADERS_VERSION)]), ending));
    headers.push(Header::new("Content-Disposition", b"inline", ending));
    MimeNode::leaf(headers, body, ending)
}

/// Returns whether `node` is a `text/rfc822-headers` part.
pub fn is_protected_part(node: &MimeNode) -> bool {
    node.content_type().map_or(false, |ct| ct.is("text", "rfc822-headers"))
}

/// Returns whether `node` declares `protected-headers="v1"`.
pub fn declares_protected_headers(node: &MimeNode) -> bool {
    node.content_type().map_or(false, |ct| {
        ct.param(PROTECTED_HEADERS_PARAM).map_or(
            false, |v| v.eq_ignore_ascii_case(PROTECTED_HEADERS_VERSION))
    })
}

/// Reads the header lines carried by a `text/rfc822-headers` part, undoing
/// any transfer encoding first.
pub fn parse_protected_part(node: &MimeNode) -> Headers {
    let decoded = node.decoded_body();
    tree::split_entity(&decoded).headers
}

/// Overlays protected headers onto an outer header block.
///
/// Where both blocks have the same number of headers of a name, the outer
/// values are replaced pairwise. Protected headers beyond the outer count are
/// appended. If the outer block has more headers of a name than the protected
/// one, they were added in transit and are left alone. Outer headers the
/// protected block does not mention are kept.
pub fn unprotect(outer: &Headers, protected: &Headers) -> Headers {
    let mut result = outer.clone();
    let ending = outer.iter().map(|h| h.ending)
        .find(|&e| LineEnding::Nil != e);

    let mut names: Vec<String> = Vec::new();
    for header in protected {
        let name = header.name.to_ascii_lowercase();
        if !names.contains(&name) {
            names.push(name);
        }
    }

    for name in &names {
        let recovered: Vec<&Header> = protected.get_all(name).collect();
        let present = result.get_all(name).count();
        if present > recovered.len() {
            debug!("more {} headers outside than protected, keeping them",
                   name);
            continue;
        }

        let mut values = recovered.into_iter();
        for header in result.iter_mut().filter(|h| h.is(name)) {
            if let Some(p) = values.next() {
                header.value = p.value.clone();
            }
        }
        for p in values {
            result.push(Header {
                ending: ending.unwrap_or(p.ending).or(LineEnding::CRLF),
                .. p.clone()
            });
        }
    }

    result
}

/// A message re-rooted under a protected-headers wrapper.
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct ProtectedEnvelope {
    /// Headers to leave on the outermost message.
    pub outer_headers: Headers,
    /// The true non-`Content-*` headers, repeated on the wrapper.
    pub root_headers: Headers,
    /// The `text/rfc822-headers` part.
    pub protected_part: MimeNode,
    /// The original body, with the original `Content-*` headers.
    pub body: MimeNode,
    pub ending: LineEnding,
}

impl ProtectedEnvelope {
    /// Splits `message` into outer headers, protected part and body.
    pub fn new(message: MimeNode, options: &ProtectOptions)
               -> ProtectedEnvelope {
        let ending = message.line_ending().or(LineEnding::CRLF);
        let MimeNode { headers, separator, body } = message;
        let (message_headers, content_headers) = headers.split_content();
        let (outer_headers, protected_part) = protect(
            &message_headers, options, ending);

        ProtectedEnvelope {
            outer_headers: outer_headers,
            root_headers: message_headers,
            protected_part: protected_part,
            body: MimeNode {
                headers: content_headers,
                separator: separator.or(ending),
                body: body,
            },
            ending: ending,
        }
    }

    /// Assembles the `multipart/mixed; protected-headers="v1"` node that
    /// gets signed or encrypted.
    ///
    /// Its header block repeats the true message headers, with MIME-Version
    /// (if the message had one) right after Content-Type. Readers showing the
    /// payload root thus never see placeholders.
    pub fn wrapper(&self, boundary: Vec<u8>) -> MimeNode {
        let mut headers = Headers::new();
        headers.push(Header::new(CONTENT_TYPE, &mime::format_content_type(
            "multipart/mixed",
            &[(PROTECTED_HEADERS_PARAM, PROTECTED_HEADERS_VERSION),
              ("boundary", &boundary[..])]), self.ending));
        let (versions, others): (Vec<&Header>, Vec<&Header>) =
            self.root_headers.iter().partition(|h| h.is(MIME_VERSION));
        for header in versions.into_iter().chain(others) {
            headers.push(Header {
                ending: self.ending,
                .. header.clone()
            });
        }

        MimeNode::composite(headers, Multipart::new(
            boundary, vec![self.protected_part.clone(), self.body.clone()],
            self.ending), self.ending)
    }
}
