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

//! Errors which abort processing of a message.
//!
//! Every variant is fatal for the message at hand; the pipeline reacts to all
//! of them by passing the input through unmodified.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The input is not MIME we are willing to take apart.
    #[error("malformed MIME: {0}")]
    Parse(String),

    /// A recipient has no usable public key.
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    /// The signing key is missing, locked, or the passphrase is wrong.
    #[error("signing failed: {0}")]
    Signing(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Any other failure reported by the OpenPGP engine.
    #[error("OpenPGP engine error: {0}")]
    Engine(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = ::std::result::Result<T, Error>;

impl Error {
    /// Returns the sysexits(3) status the process should exit with.
    pub fn exit_status(&self) -> i32 {
        match *self {
            Error::Io(_) => 71 /* EX_IOERR */,
            _ => 65 /* EX_DATAERR */,
        }
    }
}
