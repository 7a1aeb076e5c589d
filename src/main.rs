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

use std::env;
use std::fs;
use std::io::{self, Read, Write, stderr, stdin, stdout};
use std::process::exit;

use getopts::{Matches, Options};
use tracing::{error, warn};
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt,
    prelude::*,
};

mod boundary;
mod crypt;
mod envelope;
mod error;
mod mime;
mod pipe;
mod protect;
mod tree;
mod unwrap;

use crate::boundary::UuidSeparatorGen;
use crate::crypt::GpgEngine;
use crate::error::Error;
use crate::pipe::{Identity, Mode, Outcome, Settings};
use crate::protect::ProtectOptions;

const EX_USAGE : i32 = 64;

/// Everything configurable from the command line.
#[derive(Clone,Debug)]
struct Config {
    mode: Mode,
    protect: ProtectOptions,
    passphrase: Option<String>,
    gnupghome: Option<String>,
}

fn main() {
    let args: Vec<_> = env::args().collect();
    let program = args.first().cloned()
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_owned());

    let opts = options();
    let matches = match opts.parse(args.iter().skip(1)) {
        Ok(m) => m,
        Err(f) => {
            let _ = writeln!(stderr(), "Invalid usage: {}", f);
            print_usage(stderr(), &program, &opts);
            exit(EX_USAGE);
        }
    };

    if matches.opt_present("h") {
        print_usage(stdout(), &program, &opts);
        exit(0);
    }

    if matches.opt_present("V") {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        exit(0);
    }

    init_logging(matches.opt_count("v"));

    let config = match Config::from_matches(&matches) {
        Ok(config) => config,
        Err(msg) => {
            let _ = writeln!(stderr(), "Invalid usage: {}", msg);
            print_usage(stderr(), &program, &opts);
            exit(EX_USAGE);
        }
    };

    exit(run(config));
}

fn options() -> Options {
    let mut opts = Options::new();
    opts.optmulti("e", "encrypt",
                  "encrypt to RECIPIENT; may be repeated", "RECIPIENT");
    opts.optopt("s", "sign", "sign with KEY", "KEY");
    opts.optopt("E", "sign-encrypt",
                "sign with KEY, then encrypt to KEY and every --recipient",
                "KEY");
    opts.optmulti("r", "recipient",
                  "additional RECIPIENT for --encrypt or --sign-encrypt",
                  "RECIPIENT");
    opts.optflag("d", "decrypt",
                 "decrypt an encrypted message, or verify a signed one");
    opts.optopt("k", "key", "secret KEY to decrypt with", "KEY");
    opts.optopt("p", "passphrase", "PASSPHRASE of the secret key",
                "PASSPHRASE");
    opts.optopt("", "passphrase-file",
                "read the passphrase from the first line of FILE", "FILE");
    opts.optopt("", "gnupghome", "use DIR as the GnuPG home directory", "DIR");
    opts.optflag("H", "encrypt-headers",
                 "replace the cleartext copies of protected headers with \
                  \"...\"");
    opts.optmulti("", "protect-header",
                  "protect header NAME in addition to Date, From, \
                   Message-ID, Subject and To", "NAME");
    opts.optflagmulti("v", "verbose", "log more; may be repeated");
    opts.optflag("h", "help", "print this help menu");
    opts.optflag("V", "version", "print the version and exit");
    opts
}

fn print_usage<W : Write>(mut dst: W, program: &str, opts: &Options) {
    let brief = format!(
        "Usage: {} (-e RECIPIENT | -s KEY | -E KEY | -d) [options] \
         < message > result", program);
    let _ = write!(dst, "{}", opts.usage(&brief));
}

fn init_logging(verbosity: usize) {
    let level = match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        _ => LevelFilter::DEBUG,
    };

    // stdout carries the message, so logs go to stderr only.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr).with_target(false))
        .with(EnvFilter::builder()
              .with_default_directive(level.into())
              .from_env_lossy())
        .init();
}

impl Config {
    fn from_matches(matches: &Matches) -> Result<Config, String> {
        let modes = ["e", "s", "E", "d"].iter()
            .filter(|&&name| matches.opt_present(name))
            .count();
        if 1 != modes {
            return Err("exactly one of -e, -s, -E and -d is required"
                       .to_owned());
        }

        let extra_recipients = matches.opt_strs("r");
        let mode = if matches.opt_present("e") {
            let mut recipients = matches.opt_strs("e");
            recipients.extend(extra_recipients);
            Mode::Encrypt { recipients: recipients }
        } else if let Some(key) = matches.opt_str("E") {
            let mut recipients = vec![key.clone()];
            recipients.extend(extra_recipients);
            Mode::SignThenEncrypt { key: key, recipients: recipients }
        } else if !extra_recipients.is_empty() {
            return Err("-r only makes sense with -e or -E".to_owned());
        } else if let Some(key) = matches.opt_str("s") {
            Mode::Sign { key: key }
        } else {
            Mode::Decrypt { key: matches.opt_str("k") }
        };

        let passphrase = match matches.opt_str("passphrase-file") {
            Some(path) => {
                let contents = fs::read_to_string(&path)
                    .map_err(|err| format!("{}: {}", path, err))?;
                Some(contents.lines().next().unwrap_or("").to_owned())
            },
            None => matches.opt_str("p"),
        };

        let mut protect = ProtectOptions::default();
        for name in matches.opt_strs("protect-header") {
            if !protect.is_protected(&name) {
                protect.names.push(name);
            }
        }
        protect.placeholders = matches.opt_present("H");
        if protect.placeholders {
            if let Mode::Sign { .. } = mode {
                warn!("-H has no effect when only signing");
            }
        }

        Ok(Config {
            mode: mode,
            protect: protect,
            passphrase: passphrase,
            gnupghome: matches.opt_str("gnupghome"),
        })
    }
}

fn run(config: Config) -> i32 {
    let mut input = Vec::new();
    if let Err(err) = stdin().read_to_end(&mut input) {
        let err = Error::from(err);
        error!("cannot read message: {}", err);
        return err.exit_status();
    }

    let settings = Settings {
        mode: config.mode,
        protect: config.protect,
        passphrase: config.passphrase,
        identity: Identity::detect(),
    };

    let outcome = match GpgEngine::new(config.gnupghome.as_deref()) {
        Ok(mut engine) => pipe::process(
            &input, &settings, &mut engine, UuidSeparatorGen),
        Err(err) => {
            error!("{}; passing message through unmodified", err);
            Outcome {
                output: input,
                error: Some(err),
                verification: Vec::new(),
            }
        },
    };

    let mut out = stdout();
    if let Err(err) = out.write_all(&outcome.output).and_then(|_| out.flush()) {
        let err = Error::from(err);
        error!("cannot write message: {}", err);
        return err.exit_status();
    }

    outcome.exit_status()
}
