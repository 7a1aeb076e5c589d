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

//! Construction of [RFC 3156] PGP/MIME messages.
//!
//! Every mode first re-roots the message under a protected-headers wrapper
//! (see `protect`). Encryption then embeds the encrypted wrapper in a
//! `multipart/encrypted`; signing pairs it with a detached signature in a
//! `multipart/signed`. Signing then encrypting simply encrypts the signed
//! message, so the decrypted payload contains the signed one whole.

use std::collections::BTreeSet;

use tracing::{debug, info};

use crate::boundary::{BoundaryGenerator, SeparatorGen};
use crate::crypt::CryptoEngine;
use crate::error::Result;
use crate::mime::{self, LineEnding};
use crate::protect::{ProtectOptions, ProtectedEnvelope};
use crate::tree::{Header, Headers, MimeNode, Multipart, CONTENT_TYPE,
                  MIME_VERSION};

pub const MICALG : &str = "pgp-sha512";
pub const SIGNATURE_PROTOCOL : &str = "application/pgp-signature";
pub const ENCRYPTION_PROTOCOL : &str = "application/pgp-encrypted";

const ENCRYPTED_PREAMBLE : &[u8] =
    b"This is an OpenPGP/MIME encrypted message (RFC 4880 and 3156)";
const SIGNED_PREAMBLE : &[u8] =
    b"This is an OpenPGP/MIME signed message (RFC 4880 and 3156)";

/// Existing cryptographic protection of a message.
#[derive(Clone,Copy,Debug,PartialEq,Eq)]
pub enum Protection {
    Plain,
    Signed,
    Encrypted,
}

/// Determines whether `node` is already signed or encrypted, judging by its
/// top-level Content-Type.
pub fn protection_of(node: &MimeNode) -> Protection {
    match node.content_type() {
        Some(ref ct) if ct.is("multipart", "encrypted") ||
            ct.is("application", "pgp-encrypted") ||
            ct.is("application", "pkcs7-mime") => Protection::Encrypted,
        Some(ref ct) if ct.is("multipart", "signed") => Protection::Signed,
        _ => Protection::Plain,
    }
}

/// A `multipart/signed` in the making.
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct SignedEnvelope {
    pub micalg: &'static str,
    pub protocol: &'static str,
    /// The node that was signed.
    pub signed_part: MimeNode,
    /// The exact octets the signature covers; `signed_part` serialised.
    pub signed_bytes: Vec<u8>,
    /// ASCII-armoured detached signature.
    pub signature: Vec<u8>,
}

impl SignedEnvelope {
    fn into_node(self, mut headers: Headers, boundary: Vec<u8>,
                 ending: LineEnding) -> MimeNode {
        let mut sig_headers = Headers::new();
        sig_headers.push(Header::new(CONTENT_TYPE, &mime::format_content_type(
            SIGNATURE_PROTOCOL, &[("name", &b"signature.asc"[..])]), ending));
        sig_headers.push(Header::new("Content-Description",
                                     b"OpenPGP digital signature", ending));
        sig_headers.push(Header::new(
            "Content-Disposition", b"attachment; filename=\"signature.asc\"",
            ending));
        let signature = MimeNode::leaf(
            sig_headers, mime::convert_line_endings(&self.signature, ending),
            ending);

        headers.push(Header::new(CONTENT_TYPE, &mime::format_content_type(
            "multipart/signed",
            &[("micalg", self.micalg.as_bytes()),
              ("protocol", self.protocol.as_bytes()),
              ("boundary", &boundary[..])]), ending));
        add_mime_version(&mut headers, ending);

        MimeNode::composite(headers, Multipart::new(
            boundary, vec![self.signed_part, signature], ending)
                            .with_preamble(SIGNED_PREAMBLE), ending)
    }
}

fn add_mime_version(headers: &mut Headers, ending: LineEnding) {
    if !headers.contains(MIME_VERSION) {
        headers.push(Header::new(MIME_VERSION, b"1.0", ending));
    }
}

/// Builds PGP/MIME messages, delegating the cryptography to a
/// `CryptoEngine`.
pub struct EnvelopeBuilder<'a, E, G> {
    engine: &'a mut E,
    boundaries: BoundaryGenerator<G>,
    options: ProtectOptions,
}

impl<'a, E : CryptoEngine, G : SeparatorGen> EnvelopeBuilder<'a, E, G> {
    pub fn new(engine: &'a mut E, sgen: G, options: ProtectOptions) -> Self {
        EnvelopeBuilder {
            engine: engine,
            boundaries: BoundaryGenerator::new(sgen),
            options: options,
        }
    }

    /// Encrypts `message` to `recipients`, producing a `multipart/encrypted`
    /// message.
    ///
    /// If header placeholders are enabled, the outer copies of the protected
    /// headers are replaced.
    pub fn encrypt(&mut self, message: MimeNode, recipients: &[String])
                   -> Result<MimeNode> {
        let mut existing = BTreeSet::new();
        message.collect_boundaries(&mut existing);

        let options = self.options.clone();
        let envelope = ProtectedEnvelope::new(message, &options);
        let wrapper = self.wrap(&envelope, &existing);

        info!("encrypting to {} recipient(s)", recipients.len());
        let ciphertext = self.engine.encrypt(&wrapper.serialize(), recipients)?;

        Ok(self.encrypted_message(envelope.outer_headers, &ciphertext,
                                  envelope.ending))
    }

    /// Signs `message` with `key`, producing a `multipart/signed` message.
    ///
    /// The outer headers are left intact; placeholders would hide them from
    /// every reader, since nothing here is encrypted.
    pub fn sign(&mut self, message: MimeNode, key: &str,
                passphrase: Option<&str>) -> Result<MimeNode> {
        let mut existing = BTreeSet::new();
        message.collect_boundaries(&mut existing);

        if self.options.placeholders {
            debug!("header placeholders do not apply to signing");
        }
        let options = self.options.with_placeholders(false);
        let envelope = ProtectedEnvelope::new(message, &options);
        let wrapper = self.wrap(&envelope, &existing);
        existing.extend(wrapper.content_type()
                        .and_then(|ct| ct.boundary().map(|b| b.to_vec())));

        let signed = self.sign_node(wrapper, key, passphrase)?;
        let mut content = signed.signed_bytes.clone();
        content.extend_from_slice(&signed.signature);
        let boundary = self.boundaries.generate(&existing, &content);

        Ok(signed.into_node(envelope.outer_headers, boundary, envelope.ending))
    }

    /// Signs `message`, then encrypts the whole signed message.
    pub fn sign_then_encrypt(&mut self, message: MimeNode, key: &str,
                             passphrase: Option<&str>, recipients: &[String])
                             -> Result<MimeNode> {
        let signed = self.sign(message, key, passphrase)?;
        self.encrypt(signed, recipients)
    }

    /// Produces a detached signature over the serialised `node`.
    pub fn sign_node(&mut self, node: MimeNode, key: &str,
                     passphrase: Option<&str>) -> Result<SignedEnvelope> {
        let signed_bytes = node.serialize();
        info!("signing with {}", key);
        let signature = self.engine.sign(&signed_bytes, key, passphrase)?;
        Ok(SignedEnvelope {
            micalg: MICALG,
            protocol: SIGNATURE_PROTOCOL,
            signed_part: node,
            signed_bytes: signed_bytes,
            signature: signature,
        })
    }

    fn wrap(&mut self, envelope: &ProtectedEnvelope,
            existing: &BTreeSet<Vec<u8>>) -> MimeNode {
        let mut content = envelope.protected_part.serialize();
        envelope.body.write_to(&mut content);
        let boundary = self.boundaries.generate(existing, &content);
        envelope.wrapper(boundary)
    }

    fn encrypted_message(&mut self, mut headers: Headers, ciphertext: &[u8],
                         ending: LineEnding) -> MimeNode {
        let ciphertext = mime::convert_line_endings(ciphertext, ending);

        let mut version_headers = Headers::new();
        version_headers.push(Header::new(
            CONTENT_TYPE, ENCRYPTION_PROTOCOL.as_bytes(), ending));
        version_headers.push(Header::new(
            "Content-Description", b"PGP/MIME version identification", ending));
        let version = MimeNode::leaf(version_headers, b"Version: 1".to_vec(),
                                     ending);

        let mut payload_headers = Headers::new();
        payload_headers.push(Header::new(
            CONTENT_TYPE, &mime::format_content_type(
                "application/octet-stream",
                &[("name", &b"encrypted.asc"[..])]), ending));
        payload_headers.push(Header::new(
            "Content-Description", b"OpenPGP encrypted message", ending));
        payload_headers.push(Header::new(
            "Content-Disposition", b"inline; filename=\"encrypted.asc\"",
            ending));
        let boundary = self.boundaries.generate(&BTreeSet::new(), &ciphertext);
        let payload = MimeNode::leaf(payload_headers, ciphertext, ending);

        headers.push(Header::new(CONTENT_TYPE, &mime::format_content_type(
            "multipart/encrypted",
            &[("protocol", ENCRYPTION_PROTOCOL.as_bytes()),
              ("boundary", &boundary[..])]), ending));
        add_mime_version(&mut headers, ending);

        MimeNode::composite(headers, Multipart::new(
            boundary, vec![version, payload], ending)
                            .with_preamble(ENCRYPTED_PREAMBLE), ending)
    }
}
