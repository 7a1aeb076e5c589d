//-
// Copyright (c) 2016, Jason Lingle
//
// Permission to  use, copy,  modify, and/or distribute  this software  for any
// purpose  with or  without fee  is hereby  granted, provided  that the  above
// copyright notice and this permission notice appear in all copies.
//
// THE SOFTWARE  IS PROVIDED "AS  IS" AND  THE AUTHOR DISCLAIMS  ALL WARRANTIES
// WITH  REGARD   TO  THIS  SOFTWARE   INCLUDING  ALL  IMPLIED   WARRANTIES  OF
// MERCHANTABILITY AND FITNESS. IN NO EVENT  SHALL THE AUTHOR BE LIABLE FOR ANY
// SPECIAL,  DIRECT,   INDIRECT,  OR  CONSEQUENTIAL  DAMAGES   OR  ANY  DAMAGES
// WHATSOEVER RESULTING FROM LOSS OF USE, DATA OR PROFITS, WHETHER IN AN ACTION
// OF  CONTRACT, NEGLIGENCE  OR OTHER  TORTIOUS ACTION,  ARISING OUT  OF OR  IN
// CONNECTION WITH THE USE OR PERFORMANCE OF THIS SOFTWARE.

//! Implements the message pipeline: one message in, one message out.
//!
//! This module itself does not know how to encrypt messages; this is found in
//! the `crypt` module.
//!
//! Whatever goes wrong, the pipeline never loses mail. If a message cannot be
//! processed, the input is emitted unchanged and the error is handed back to
//! the caller for the exit status.
//!
//! Relevant standards:
//!   [RFC 2045] Standard content types
//!   [RFC 2046] Multipart structure
//!   [RFC 3156] PGP/MIME

use std::fmt;

use tracing::{debug, error, info, warn};

use crate::boundary::SeparatorGen;
use crate::crypt::{CryptoEngine, VerificationStatus};
use crate::envelope::{self, EnvelopeBuilder, Protection};
use crate::error::{Error, Result};
use crate::mime::LineEnding;
use crate::protect::ProtectOptions;
use crate::tree::{self, Header, MimeNode};
use crate::unwrap::EnvelopeParser;

/// The header identifying the process which produced a message.
pub const IDENTITY_HEADER : &str = "X-PGPEnvelope";

/// The mbox envelope line some delivery agents put in front of a message.
const ENVELOPE_LINE_PREFIX : &[u8] = b"From ";

#[derive(Clone,Debug,PartialEq,Eq)]
pub enum Mode {
    Encrypt { recipients: Vec<String> },
    Sign { key: String },
    SignThenEncrypt { key: String, recipients: Vec<String> },
    /// Decrypts encrypted messages and verifies signed ones.
    Decrypt { key: Option<String> },
}

/// Identifies this program in the messages it produces.
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct Identity {
    pub name: String,
    pub version: String,
    pub hostname: String,
}

impl Identity {
    /// Builds the identity of the running process.
    pub fn detect() -> Identity {
        Identity {
            name: env!("CARGO_PKG_NAME").to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            hostname: hostname().unwrap_or_else(|| "localhost".to_owned()),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} v{} on {}", self.name, self.version, self.hostname)
    }
}

fn hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: the buffer outlives the call and its length is passed along,
    // so gethostname cannot write out of bounds.
    let ret = unsafe {
        libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len())
    };
    if 0 != ret {
        debug!("gethostname() failed: {}", ::std::io::Error::last_os_error());
        return None;
    }

    let len = buf.iter().position(|&ch| 0 == ch).unwrap_or(buf.len());
    String::from_utf8(buf[..len].to_vec()).ok()
        .filter(|name| !name.is_empty())
}

/// Everything the pipeline needs to know besides the message itself.
#[derive(Clone,Debug)]
pub struct Settings {
    pub mode: Mode,
    pub protect: ProtectOptions,
    pub passphrase: Option<String>,
    pub identity: Identity,
}

/// The result of running one message through the pipeline.
#[derive(Debug)]
pub struct Outcome {
    /// What to write to the output. Equal to the input if nothing was done.
    pub output: Vec<u8>,
    /// Why the message was passed through unchanged, if it was for an error.
    pub error: Option<Error>,
    /// Signatures checked while decrypting.
    pub verification: Vec<VerificationStatus>,
}

impl Outcome {
    pub fn exit_status(&self) -> i32 {
        self.error.as_ref().map_or(0, Error::exit_status)
    }
}

/// Splits a leading mbox `From ` line off `input`.
fn split_envelope_line(input: &[u8]) -> (&[u8], &[u8]) {
    if !input.starts_with(ENVELOPE_LINE_PREFIX) {
        return (&input[..0], input);
    }

    let end = input.iter().position(|&ch| b'\n' == ch)
        .map_or(input.len(), |lf| lf + 1);
    input.split_at(end)
}

/// Runs `input` through the pipeline as configured by `settings`.
pub fn process<E : CryptoEngine, G : SeparatorGen>(
    input: &[u8], settings: &Settings, engine: &mut E, sgen: G) -> Outcome
{
    let (envelope_line, message) = split_envelope_line(input);
    let mut verification = Vec::new();

    match transform(message, settings, engine, sgen, &mut verification) {
        Ok(Some(mut node)) => {
            stamp(&mut node, &settings.identity);
            let mut output = envelope_line.to_vec();
            node.write_to(&mut output);
            Outcome {
                output: output,
                error: None,
                verification: verification,
            }
        },

        Ok(None) => Outcome {
            output: input.to_vec(),
            error: None,
            verification: verification,
        },

        Err(err) => {
            error!("{}; passing message through unmodified", err);
            Outcome {
                output: input.to_vec(),
                error: Some(err),
                verification: Vec::new(),
            }
        },
    }
}

/// Produces the new message, or `None` if `message` is to be left alone.
fn transform<E : CryptoEngine, G : SeparatorGen>(
    message: &[u8], settings: &Settings, engine: &mut E, sgen: G,
    verification: &mut Vec<VerificationStatus>) -> Result<Option<MimeNode>>
{
    if message.iter().all(|ch| ch.is_ascii_whitespace()) {
        warn!("empty message, passing it through");
        return Ok(None);
    }

    let passphrase = settings.passphrase.as_deref();

    if let Mode::Decrypt { ref key } = settings.mode {
        let opened = EnvelopeParser::new(engine, key.as_deref(), passphrase)
            .open(message)?;
        return match opened {
            Some(opened) => {
                if !opened.decrypted {
                    info!("message was only signed, nothing to decrypt");
                }
                *verification = opened.verification;
                Ok(Some(opened.message))
            },
            None => {
                info!("not a PGP/MIME message, passing it through");
                Ok(None)
            },
        };
    }

    let skip = match settings.mode {
        Mode::Sign { .. } => Protection::Signed,
        _ => Protection::Encrypted,
    };
    let node = match unprotected(message, skip)? {
        Some(node) => node,
        None => return Ok(None),
    };

    let mut builder = EnvelopeBuilder::new(
        engine, sgen, settings.protect.clone());
    match settings.mode {
        Mode::Encrypt { ref recipients } =>
            builder.encrypt(node, recipients).map(Some),
        Mode::Sign { ref key } =>
            builder.sign(node, key, passphrase).map(Some),
        Mode::SignThenEncrypt { ref key, ref recipients } =>
            builder.sign_then_encrypt(node, key, passphrase, recipients)
            .map(Some),
        Mode::Decrypt { .. } => Ok(None),
    }
}

/// Parses `message` unless it already has protection of kind `skip`, or
/// stronger.
fn unprotected(message: &[u8], skip: Protection) -> Result<Option<MimeNode>> {
    let node = tree::parse(message)?;
    let protection = envelope::protection_of(&node);
    let already = match protection {
        Protection::Plain => false,
        Protection::Signed => Protection::Signed == skip,
        Protection::Encrypted => true,
    };

    if already {
        info!("message is already {:?}, passing it through", protection);
        Ok(None)
    } else {
        Ok(Some(node))
    }
}

/// Adds the identification header, dropping any left by an earlier hop.
fn stamp(node: &mut MimeNode, identity: &Identity) {
    let stale = node.headers.remove_all(IDENTITY_HEADER);
    if stale > 0 {
        debug!("replacing {} stale {} header(s)", stale, IDENTITY_HEADER);
    }

    let ending = node.line_ending().or(LineEnding::CRLF);
    node.headers.push(Header::new(
        IDENTITY_HEADER, identity.to_string().as_bytes(), ending));
}


#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::test::*;
    use super::*;
    use crate::boundary::DetSeparatorGen;

    fn message(subject: &str, lines: &[String], ending: &str,
               multipart: bool, mime_version: bool) -> String {
        let mut text = String::new();
        text.push_str(&format!("From: alice@example.com{0}\
                                To: bob@example.com{0}\
                                Subject: {1}{0}", ending, subject));
        if mime_version {
            text.push_str(&format!("MIME-Version: 1.0{}", ending));
        }
        let body: String = lines.iter()
            .map(|line| format!("{}{}", line, ending)).collect();

        if multipart {
            // Deliberately reuse the boundaries the pipeline would pick first.
            let taken = String::from_utf8(
                DetSeparatorGen::default().gen()).unwrap();
            text.push_str(&format!(
                "Content-Type: multipart/alternative; boundary=\"{1}\"{0}\
                 {0}\
                 --{1}{0}\
                 Content-Type: text/plain; charset=utf-8{0}\
                 {0}\
                 {2}\
                 --{1}{0}\
                 Content-Type: text/html; charset=utf-8{0}\
                 {0}\
                 <pre>{2}</pre>{0}\
                 --{1}--{0}", ending, taken, body));
        } else {
            text.push_str(&format!(
                "Content-Type: text/plain; charset=utf-8{0}\
                 Content-Transfer-Encoding: 8bit{0}\
                 {0}\
                 {1}", ending, body));
        }
        text
    }

    proptest! {
        #[test]
        fn round_trip_preserves_message(
            subject in "[A-Za-z][A-Za-z0-9 ]{11,39}",
            lines in prop::collection::vec("[A-Za-z0-9äöüÄÖÜß .,!?]{12,60}", 0..8),
            crlf in any::<bool>(),
            multipart in any::<bool>(),
            placeholders in any::<bool>(),
            sign in any::<bool>(),
            mime_version in any::<bool>()
        ) {
            let ending = if crlf { "\r\n" } else { "\n" };
            let input = message(&subject, &lines, ending, multipart,
                                mime_version);
            let mode = if sign {
                Mode::SignThenEncrypt {
                    key: "alice".to_owned(),
                    recipients: vec!["bob".to_owned()],
                }
            } else {
                encrypt_mode()
            };

            let (encrypted, decrypted) = round_trip(
                input.as_bytes(), mode, placeholders);
            assert_equivalent(input.as_bytes(), &decrypted.output);
            if sign {
                prop_assert_eq!(vec![VerificationStatus::Good],
                                decrypted.verification);
            }

            let wire = String::from_utf8_lossy(&encrypted.output).into_owned();
            for line in &lines {
                prop_assert!(!wire.contains(line.as_str()));
            }
            if placeholders {
                prop_assert!(!wire.contains(subject.as_str()));
            }
        }
    }
}
