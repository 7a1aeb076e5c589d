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

//! Taking PGP/MIME messages apart again.
//!
//! Layers are peeled off the raw bytes one at a time, since a signature is
//! only meaningful over the exact octets that were signed. Each layer may
//! contribute headers: the non-`Content-*` headers of a layer and those in a
//! protected-headers part are overlaid onto what has been recovered so far.

use tracing::{debug, info, warn};

use crate::crypt::{CryptoEngine, VerificationStatus};
use crate::envelope::{ENCRYPTION_PROTOCOL, SIGNATURE_PROTOCOL};
use crate::error::{Error, Result};
use crate::mime::ContentType;
use crate::protect;
use crate::tree::{self, Body, Headers, MimeNode, Multipart, MIME_VERSION};

/// The result of opening a PGP/MIME message.
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct Opened {
    /// The recovered message.
    pub message: MimeNode,
    /// Outcome of every signature met on the way, outermost first.
    pub verification: Vec<VerificationStatus>,
    /// Whether a decryption took place.
    pub decrypted: bool,
}

fn protocol_is(ct: &ContentType, protocol: &str) -> bool {
    ct.param("protocol").map_or(
        true, |p| p.eq_ignore_ascii_case(protocol.as_bytes()))
}

fn is_pgp_signed(ct: &ContentType) -> bool {
    ct.is("multipart", "signed") && protocol_is(ct, SIGNATURE_PROTOCOL)
}

fn is_protected_wrapper(ct: &Option<ContentType>, multipart: &Multipart)
                        -> bool {
    let ct = match *ct {
        Some(ref ct) if ct.is("multipart", "mixed") => ct,
        _ => return false,
    };

    ct.param(protect::PROTECTED_HEADERS_PARAM).is_some() ||
        multipart.parts.first().map_or(false, |part| {
            protect::is_protected_part(&part.node) &&
                protect::declares_protected_headers(&part.node)
        })
}

fn join(mut outer: Headers, content: Headers) -> Headers {
    outer.extend(content);
    outer
}

/// Decrypts and verifies PGP/MIME messages.
pub struct EnvelopeParser<'a, E> {
    engine: &'a mut E,
    key: Option<&'a str>,
    passphrase: Option<&'a str>,
}

impl<'a, E : CryptoEngine> EnvelopeParser<'a, E> {
    pub fn new(engine: &'a mut E, key: Option<&'a str>,
               passphrase: Option<&'a str>) -> Self {
        EnvelopeParser {
            engine: engine,
            key: key,
            passphrase: passphrase,
        }
    }

    /// Opens `input` if it is a PGP/MIME encrypted or signed message.
    ///
    /// Returns `None` for anything else. Bad signatures are reported in the
    /// result, never as errors.
    pub fn open(&mut self, input: &[u8]) -> Result<Option<Opened>> {
        let message = tree::parse(input)?;
        let ct = match message.content_type() {
            Some(ct) => ct,
            None => return Ok(None),
        };

        let mut verification = Vec::new();
        if ct.is("multipart", "encrypted") {
            if !protocol_is(&ct, ENCRYPTION_PROTOCOL) {
                info!("multipart/encrypted is not PGP/MIME, leaving it alone");
                return Ok(None);
            }

            let ciphertext = match message.body {
                Body::Composite(ref mp) => mp.children().find(|child| {
                    child.content_type().map_or(
                        false, |ct| ct.is("application", "octet-stream"))
                }).map(|child| child.decoded_body()),
                _ => None,
            }.ok_or_else(|| Error::Parse(
                "multipart/encrypted without encrypted payload".to_owned()))?;

            let plaintext = self.engine.decrypt(
                &ciphertext, self.key, self.passphrase)?;
            if plaintext.iter().all(u8::is_ascii_whitespace) {
                return Err(Error::Decryption(
                    "decrypted payload is empty".to_owned()));
            }
            info!("decrypted {} bytes", plaintext.len());
            let (outer, _) = message.headers.split_content();
            let message = self.peel(plaintext, outer, &mut verification)?;
            Ok(Some(Opened {
                message: message,
                verification: verification,
                decrypted: true,
            }))
        } else if is_pgp_signed(&ct) {
            let message = self.peel(input.to_vec(), Headers::new(),
                                    &mut verification)?;
            Ok(Some(Opened {
                message: message,
                verification: verification,
                decrypted: false,
            }))
        } else {
            Ok(None)
        }
    }

    /// Strips signature and protected-headers layers off `bytes`, overlaying
    /// recovered headers onto `outer`.
    fn peel(&mut self, mut bytes: Vec<u8>, mut outer: Headers,
            verification: &mut Vec<VerificationStatus>) -> Result<MimeNode> {
        loop {
            let MimeNode { headers, separator, body } = tree::parse(&bytes)?;
            let (own, content) = headers.split_content();
            outer = protect::unprotect(&outer, &own);
            let ct = content.content_type();

            if let Some(ref signed) = ct {
                if is_pgp_signed(signed) {
                    bytes = self.verify_signed(&bytes, signed, verification)?;
                    continue;
                }
            }

            let mut multipart = match body {
                Body::Composite(mp) if is_protected_wrapper(&ct, &mp) => mp,
                body => return Ok(MimeNode {
                    headers: join(outer, content),
                    separator: separator,
                    body: body,
                }),
            };

            // Our wrapper repeats the true headers, MIME-Version included
            // only if the message had one; the outer layers always add it.
            let root_declares = ct.as_ref().map_or(false, |ct| {
                ct.param(protect::PROTECTED_HEADERS_PARAM).is_some()
            });
            if root_declares && !own.contains(MIME_VERSION) &&
                outer.remove_all(MIME_VERSION) > 0
            {
                debug!("dropping MIME-Version the original did not have");
            }

            if multipart.parts.first().map_or(
                false, |part| protect::is_protected_part(&part.node))
            {
                let protected = protect::parse_protected_part(
                    &multipart.remove_part(0));
                outer = protect::unprotect(&outer, &protected);
            }

            if 1 == multipart.parts.len() {
                bytes = multipart.remove_part(0).serialize();
                continue;
            }

            return Ok(MimeNode {
                headers: join(outer, content),
                separator: separator,
                body: Body::Composite(multipart),
            });
        }
    }

    /// Checks the signature of the `multipart/signed` entity in `bytes`,
    /// returning the signed part.
    fn verify_signed(&mut self, bytes: &[u8], ct: &ContentType,
                     verification: &mut Vec<VerificationStatus>)
                     -> Result<Vec<u8>> {
        let boundary = ct.boundary().ok_or_else(|| Error::Parse(
            "multipart/signed without boundary".to_owned()))?;
        let entity = tree::split_entity(bytes);
        let split = tree::split_multipart(entity.body, boundary)?;
        if split.parts.len() < 2 {
            return Err(Error::Parse(
                "multipart/signed without signature".to_owned()));
        }

        let signed = split.parts[0].1;
        let signature = tree::parse(split.parts[1].1)?.decoded_body();
        let status = self.engine.verify(signed, &signature);
        match status {
            VerificationStatus::Good => info!("signature is {}", status),
            _ => warn!("signature is {}", status),
        }
        verification.push(status);

        Ok(signed.to_vec())
    }
}

#[cfg(test)]
mod test {
    use std::str::from_utf8;

    use super::*;
    use crate::boundary::DetSeparatorGen;
    use crate::crypt::fake::{FakeEngine, WRONG_PASSPHRASE};
    use crate::envelope::EnvelopeBuilder;
    use crate::protect::{ProtectOptions, PLACEHOLDER};
    use crate::tree::parse;

    const SIMPLE : &str =
        "Return-Path: <alice@example.com>\n\
         Received: from a by b\n\
         Received: from b by c\n\
         Date: Mon, 1 Jan 2018 00:00:00 +0000\n\
         From: Alice <alice@example.com>\n\
         To: Bob <bob@example.com>\n\
         Subject: =?utf-8?q?F=C3=BCr_alle?=\n\
         Message-ID: <1@example.com>\n\
         MIME-Version: 1.0\n\
         Content-Type: text/plain; charset=utf-8\n\
         Content-Transfer-Encoding: quoted-printable\n\
         \n\
         F=C3=BCr alle R=C3=A4uber\n";

    const NESTED : &str =
        "From: Alice <alice@example.com>\r\n\
         To: Bob <bob@example.com>\r\n\
         Subject: Fwd: pictures\r\n\
         MIME-Version: 1.0\r\n\
         Content-Type: multipart/mixed; boundary=\"outer1\"\r\n\
         \r\n\
         --outer1\r\n\
         Content-Type: multipart/alternative; boundary=\"outer10\"\r\n\
         \r\n\
         --outer10\r\n\
         Content-Type: text/plain\r\n\
         \r\n\
         See below.\r\n\
         --outer10\r\n\
         Content-Type: text/html\r\n\
         \r\n\
         <p>See below.</p>\r\n\
         --outer10--\r\n\
         --outer1\r\n\
         Content-Type: message/rfc822\r\n\
         \r\n\
         From: Carol <carol@example.com>\r\n\
         Subject: pictures\r\n\
         \r\n\
         Inner text\r\n\
         --outer1\r\n\
         Content-Type: image/png; name=\"a.png\"\r\n\
         Content-Transfer-Encoding: base64\r\n\
         \r\n\
         iVBORw0KGgo=\r\n\
         --outer1--\r\n";

    fn header_list(node: &MimeNode) -> Vec<(String, Vec<u8>)> {
        let mut list: Vec<_> = node.headers.iter()
            .map(|h| (h.name.clone(), h.value.clone()))
            .collect();
        list.sort();
        list
    }

    fn recipients() -> Vec<String> {
        vec!["bob@example.com".to_owned()]
    }

    fn builder(engine: &mut FakeEngine, placeholders: bool)
               -> EnvelopeBuilder<FakeEngine, DetSeparatorGen> {
        EnvelopeBuilder::new(engine, DetSeparatorGen::default(),
                             ProtectOptions::default()
                             .with_placeholders(placeholders))
    }

    fn open(engine: &mut FakeEngine, wire: &[u8]) -> Opened {
        EnvelopeParser::new(engine, None, None).open(wire)
            .expect("open failed").expect("not PGP/MIME")
    }

    fn assert_restored(original: &str, opened: &Opened) {
        let original = parse(original.as_bytes()).unwrap();
        assert_eq!(header_list(&original), header_list(&opened.message));
        assert_eq!(from_utf8(&original.body_bytes()).unwrap(),
                   from_utf8(&opened.message.body_bytes()).unwrap());
    }

    #[test]
    fn encrypt_then_open_restores_message() {
        for &placeholders in &[false, true] {
            for &input in &[SIMPLE, NESTED] {
                let mut engine = FakeEngine::default();
                let encrypted = builder(&mut engine, placeholders)
                    .encrypt(parse(input.as_bytes()).unwrap(), &recipients())
                    .unwrap();
                let opened = open(&mut engine, &encrypted.serialize());
                assert!(opened.decrypted);
                assert!(opened.verification.is_empty());
                assert_restored(input, &opened);
            }
        }
    }

    #[test]
    fn crlf_message_with_empty_body_restored() {
        let input = "From: a@example.com\r\n\
                     Subject: s\r\n\
                     MIME-Version: 1.0\r\n\
                     Content-Type: text/plain; charset=utf-8\r\n\
                     \r\n";
        let mut engine = FakeEngine::default();
        let encrypted = builder(&mut engine, false)
            .encrypt(parse(input.as_bytes()).unwrap(), &recipients())
            .unwrap();
        let opened = open(&mut engine, &encrypted.serialize());
        assert_restored(input, &opened);
        assert_eq!(input, from_utf8(&opened.message.serialize()).unwrap());
    }

    #[test]
    fn absent_mime_version_not_invented() {
        let input = "From: a@example.com\n\
                     To: b@example.com\n\
                     Subject: s\n\
                     \n\
                     hello\n";
        let mut engine = FakeEngine::default();
        let encrypted = builder(&mut engine, true)
            .sign_then_encrypt(parse(input.as_bytes()).unwrap(), "alice",
                               None, &recipients())
            .unwrap();
        assert!(encrypted.headers.contains("MIME-Version"));

        let opened = open(&mut engine, &encrypted.serialize());
        assert_eq!(vec![VerificationStatus::Good], opened.verification);
        assert!(!opened.message.headers.contains("MIME-Version"));
        assert_restored(input, &opened);
    }

    #[test]
    fn empty_plaintext_is_decryption_error() {
        let mut engine = FakeEngine::default();
        let ciphertext = engine.encrypt(b"\n", &recipients()).unwrap();
        let input = format!(
            "Content-Type: multipart/encrypted; boundary=b\n\
             \n\
             --b\n\
             Content-Type: application/octet-stream\n\
             \n\
             {}\n\
             --b--\n", from_utf8(&ciphertext).unwrap());
        match EnvelopeParser::new(&mut engine, None, None)
            .open(input.as_bytes())
        {
            Err(Error::Decryption(_)) => (),
            other => panic!("Unexpected result: {:?}", other),
        }
    }

    #[test]
    fn sign_then_open_verifies() {
        let mut engine = FakeEngine::default();
        let signed = builder(&mut engine, false)
            .sign(parse(NESTED.as_bytes()).unwrap(), "alice", None)
            .unwrap();
        let opened = open(&mut engine, &signed.serialize());
        assert!(!opened.decrypted);
        assert_eq!(vec![VerificationStatus::Good], opened.verification);
        assert_eq!(vec!["sign", "verify"], engine.calls);
        assert_restored(NESTED, &opened);
    }

    #[test]
    fn tampered_signature_reported_not_fatal() {
        let mut engine = FakeEngine::default();
        let signed = builder(&mut engine, false)
            .sign(parse(SIMPLE.as_bytes()).unwrap(), "alice", None)
            .unwrap();
        let wire = String::from_utf8(signed.serialize()).unwrap()
            .replace("R=C3=A4uber", "Rauber");
        let opened = open(&mut engine, wire.as_bytes());
        assert_eq!(vec![VerificationStatus::Bad], opened.verification);
        assert_eq!("Für alle Rauber\n".as_bytes().to_vec(),
                   opened.message.decoded_body());
    }

    #[test]
    fn sign_then_encrypt_then_open() {
        let mut engine = FakeEngine::default();
        let encrypted = builder(&mut engine, true)
            .sign_then_encrypt(parse(SIMPLE.as_bytes()).unwrap(), "alice",
                               None, &recipients())
            .unwrap();
        assert_eq!(PLACEHOLDER,
                   encrypted.headers.get("From").unwrap().text());
        let opened = open(&mut engine, &encrypted.serialize());
        assert!(opened.decrypted);
        assert_eq!(vec![VerificationStatus::Good], opened.verification);
        assert_restored(SIMPLE, &opened);
    }

    #[test]
    fn plain_message_not_opened() {
        let mut engine = FakeEngine::default();
        let result = EnvelopeParser::new(&mut engine, None, None)
            .open(SIMPLE.as_bytes()).unwrap();
        assert!(result.is_none());
        assert!(engine.calls.is_empty());
    }

    #[test]
    fn smime_signed_not_opened() {
        let mut engine = FakeEngine::default();
        let input = b"Content-Type: multipart/signed; \
                      protocol=\"application/pkcs7-signature\"; boundary=b\n\
                      \n\
                      --b\n\
                      \n\
                      x\n\
                      --b\n\
                      \n\
                      sig\n\
                      --b--\n";
        let result = EnvelopeParser::new(&mut engine, None, None)
            .open(input).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn decryption_failure_propagates() {
        let mut engine = FakeEngine::default();
        let encrypted = builder(&mut engine, false)
            .encrypt(parse(SIMPLE.as_bytes()).unwrap(), &recipients())
            .unwrap();
        match EnvelopeParser::new(&mut engine, None, Some(WRONG_PASSPHRASE))
            .open(&encrypted.serialize())
        {
            Err(Error::Decryption(_)) => (),
            other => panic!("Unexpected result: {:?}", other),
        }
    }

    #[test]
    fn missing_payload_is_parse_error() {
        let mut engine = FakeEngine::default();
        let input = b"Content-Type: multipart/encrypted; boundary=b\n\
                      \n\
                      --b\n\
                      Content-Type: application/pgp-encrypted\n\
                      \n\
                      Version: 1\n\
                      --b--\n";
        match EnvelopeParser::new(&mut engine, None, None).open(input) {
            Err(Error::Parse(_)) => (),
            other => panic!("Unexpected result: {:?}", other),
        }
    }

    #[test]
    fn foreign_payload_headers_honoured() {
        let mut engine = FakeEngine::default();
        let ciphertext = engine.encrypt(
            b"Subject: The real subject\n\
              Content-Type: text/plain\n\
              \n\
              hidden\n", &recipients()).unwrap();
        let input = format!(
            "From: a@example.com\n\
             Subject: ...\n\
             MIME-Version: 1.0\n\
             Content-Type: multipart/encrypted;\n\
             \tprotocol=\"application/pgp-encrypted\"; boundary=\"b\"\n\
             \n\
             --b\n\
             Content-Type: application/pgp-encrypted\n\
             \n\
             Version: 1\n\
             --b\n\
             Content-Type: application/octet-stream\n\
             \n\
             {}\n\
             --b--\n", from_utf8(&ciphertext).unwrap());
        let opened = open(&mut engine, input.as_bytes());
        let message = opened.message;
        assert_eq!("The real subject",
                   message.headers.get("subject").unwrap().text());
        assert_eq!(1, message.headers.get_all("subject").count());
        assert_eq!("a@example.com", message.headers.get("from").unwrap().text());
        assert_eq!(b"hidden\n".to_vec(), message.body_bytes());
    }

    #[test]
    fn wrapper_with_several_parts_kept_composite() {
        let mut engine = FakeEngine::default();
        let ciphertext = engine.encrypt(
            b"Content-Type: multipart/mixed; protected-headers=\"v1\"; \
              boundary=w\n\
              \n\
              --w\n\
              Content-Type: text/rfc822-headers; protected-headers=\"v1\"\n\
              \n\
              Subject: real\n\
              \n\
              --w\n\
              \n\
              first\n\
              --w\n\
              \n\
              second\n\
              --w--\n", &recipients()).unwrap();
        let input = format!(
            "Subject: ...\n\
             Content-Type: multipart/encrypted; boundary=b\n\
             \n\
             --b\n\
             Content-Type: application/octet-stream\n\
             \n\
             {}\n\
             --b--\n", from_utf8(&ciphertext).unwrap());
        let opened = open(&mut engine, input.as_bytes());
        assert_eq!("real", opened.message.headers.get("Subject").unwrap().text());
        match opened.message.body {
            Body::Composite(ref mp) => {
                assert_eq!(2, mp.parts.len());
                assert_eq!(b"w", &mp.boundary[..]);
            },
            ref other => panic!("Not a multipart: {:?}", other),
        }
    }
}
