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

//! Implements the actual cryptography through GPG.

use std::fmt;
use std::io::Write;

use gpgme::{self, Context, EncryptFlags, PassphraseRequest, PinentryMode,
            Protocol};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::mime::{self, LineEnding};

/// Outcome of checking a detached signature. Purely advisory.
#[derive(Clone,Copy,Debug,PartialEq,Eq)]
pub enum VerificationStatus {
    /// Every signature checked out.
    Good,
    /// At least one signature does not match the data.
    Bad,
    /// The signature could not be checked, eg for lack of the public key.
    Unknown,
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            VerificationStatus::Good => "good",
            VerificationStatus::Bad => "BAD",
            VerificationStatus::Unknown => "unknown",
        })
    }
}

/// The OpenPGP operations the envelope code needs.
///
/// Everything is passed as complete in-memory buffers; signatures and
/// ciphertext are expected to be ASCII-armoured.
pub trait CryptoEngine {
    /// Encrypts `plaintext` to every one of `recipients`.
    ///
    /// Fails with `Error::InvalidRecipient` if any recipient lacks a usable
    /// public key.
    fn encrypt(&mut self, plaintext: &[u8], recipients: &[String])
               -> Result<Vec<u8>>;

    /// Produces a detached signature over `data` with the secret key `key`.
    fn sign(&mut self, data: &[u8], key: &str, passphrase: Option<&str>)
            -> Result<Vec<u8>>;

    fn decrypt(&mut self, ciphertext: &[u8], key: Option<&str>,
               passphrase: Option<&str>) -> Result<Vec<u8>>;

    /// Checks a detached `signature` over `data`. Never fails; problems are
    /// reported as `VerificationStatus::Unknown`.
    fn verify(&mut self, data: &[u8], signature: &[u8]) -> VerificationStatus;
}

#[derive(Clone,Copy,Debug,PartialEq,Eq)]
enum KeyUse {
    Encrypt,
    Sign,
    Decrypt,
}

/// The GPG-based implementation of `CryptoEngine`.
#[derive(Debug)]
pub struct GpgEngine {
    ctx: Context,
}

fn engine_error(err: gpgme::Error) -> Error {
    Error::Engine(err.to_string())
}

impl GpgEngine {
    /// Creates a new `GpgEngine`, optionally using a GnuPG home directory
    /// other than the default.
    pub fn new(home: Option<&str>) -> Result<GpgEngine> {
        let mut ctx = Context::from_protocol(Protocol::OpenPgp)
            .map_err(engine_error)?;
        if let Some(home) = home {
            ctx.set_engine_home_dir(home).map_err(engine_error)?;
        }
        ctx.set_armor(true);
        // There is nobody to ask for a passphrase; it comes from the command
        // line or not at all.
        if let Err(err) = ctx.set_pinentry_mode(PinentryMode::Loopback) {
            debug!("cannot enable loopback pinentry: {}", err);
        }

        Ok(GpgEngine { ctx: ctx })
    }

    /// Looks up the first key matching `pattern` that is fit for `key_use`.
    fn find_key(&mut self, pattern: &str, key_use: KeyUse)
                -> gpgme::Result<Option<gpgme::Key>> {
        let keys = match key_use {
            KeyUse::Encrypt => self.ctx.find_keys(Some(pattern))?,
            KeyUse::Sign | KeyUse::Decrypt =>
                self.ctx.find_secret_keys(Some(pattern))?,
        };

        for key in keys {
            let key = key?;
            let fit = match key_use {
                KeyUse::Sign => key.can_sign(),
                KeyUse::Encrypt | KeyUse::Decrypt => key.can_encrypt(),
            };
            if fit && !key.is_revoked() && !key.is_expired() &&
                !key.is_disabled() && !key.is_invalid()
            {
                return Ok(Some(key));
            }
        }

        Ok(None)
    }
}

/// Runs `f` with `passphrase`, if any, supplied through a loopback callback.
fn with_passphrase<T, F>(ctx: &mut Context, passphrase: Option<&str>, f: F)
                         -> gpgme::Result<T>
where F : FnOnce(&mut Context) -> gpgme::Result<T> {
    match passphrase {
        None => f(ctx),
        Some(passphrase) => ctx.with_passphrase_provider(
            |_: PassphraseRequest, out: &mut dyn Write| {
                out.write_all(passphrase.as_bytes())?;
                out.write_all(b"\n")?;
                Ok(())
            }, f),
    }
}

impl CryptoEngine for GpgEngine {
    fn encrypt(&mut self, plaintext: &[u8], recipients: &[String])
               -> Result<Vec<u8>> {
        if recipients.is_empty() {
            return Err(Error::InvalidRecipient("no recipients given".to_owned()));
        }

        let mut keys = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            match self.find_key(recipient, KeyUse::Encrypt)
                .map_err(engine_error)?
            {
                Some(key) => keys.push(key),
                None => return Err(Error::InvalidRecipient(format!(
                    "{}: no usable public key", recipient))),
            }
        }

        let mut ciphertext = Vec::new();
        let result = self.ctx.encrypt_with_flags(
            &keys, plaintext, &mut ciphertext, EncryptFlags::ALWAYS_TRUST)
            .map_err(|err| {
                if err.code() == gpgme::Error::UNUSABLE_PUBKEY.code() {
                    Error::InvalidRecipient(err.to_string())
                } else {
                    engine_error(err)
                }
            })?;

        if let Some(invalid) = result.invalid_recipients().next() {
            return Err(Error::InvalidRecipient(format!(
                "{}: {}", invalid.fingerprint().unwrap_or("???"),
                invalid.reason().map_or_else(
                    || "unknown reason".to_owned(), |r| r.to_string()))));
        }

        Ok(ciphertext)
    }

    fn sign(&mut self, data: &[u8], key: &str, passphrase: Option<&str>)
            -> Result<Vec<u8>> {
        let signer = self.find_key(key, KeyUse::Sign)
            .map_err(|err| Error::Signing(format!("{}: {}", key, err)))?
            .ok_or_else(|| Error::Signing(format!(
                "{}: no usable secret key", key)))?;

        self.ctx.clear_signers();
        self.ctx.add_signer(&signer)
            .map_err(|err| Error::Signing(format!("{}: {}", key, err)))?;

        // [RFC 3156] signatures are over the CRLF canonical form.
        let canonical = mime::convert_line_endings(data, LineEnding::CRLF);
        let mut signature = Vec::new();
        with_passphrase(&mut self.ctx, passphrase, |ctx| {
            ctx.sign_detached(&canonical[..], &mut signature)
        }).map_err(|err| Error::Signing(format!("{}: {}", key, err)))?;

        Ok(signature)
    }

    fn decrypt(&mut self, ciphertext: &[u8], key: Option<&str>,
               passphrase: Option<&str>) -> Result<Vec<u8>> {
        if let Some(key) = key {
            if self.find_key(key, KeyUse::Decrypt)
                .map_err(|err| Error::Decryption(err.to_string()))?
                .is_none()
            {
                return Err(Error::Decryption(format!(
                    "{}: no usable secret key", key)));
            }
        }

        let mut plaintext = Vec::new();
        with_passphrase(&mut self.ctx, passphrase, |ctx| {
            ctx.decrypt(ciphertext, &mut plaintext)
        }).map_err(|err| Error::Decryption(err.to_string()))?;

        Ok(plaintext)
    }

    fn verify(&mut self, data: &[u8], signature: &[u8]) -> VerificationStatus {
        let canonical = mime::convert_line_endings(data, LineEnding::CRLF);
        let result = match self.ctx.verify_detached(signature, &canonical[..]) {
            Ok(result) => result,
            Err(err) => {
                warn!("could not verify signature: {}", err);
                return VerificationStatus::Unknown;
            },
        };

        let mut status = VerificationStatus::Unknown;
        for sig in result.signatures() {
            match sig.status() {
                Ok(()) => if VerificationStatus::Unknown == status {
                    status = VerificationStatus::Good;
                },
                Err(err) if err.code() ==
                    gpgme::Error::BAD_SIGNATURE.code() =>
                    return VerificationStatus::Bad,
                Err(err) => {
                    debug!("signature by {} not checked: {}",
                           sig.fingerprint().unwrap_or("???"), err);
                    return VerificationStatus::Unknown;
                },
            }
        }
        status
    }
}
