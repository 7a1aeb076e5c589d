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

//! Generation of multipart boundaries for the multiparts we introduce.

use std::collections::BTreeSet;

use tracing::debug;
use uuid::Uuid;

use crate::mime;

/// Number of fresh candidates to try before falling back to suffixing.
const MAX_ATTEMPTS : u32 = 16;

const DIGIT_MODULUS : u128 = 10_000_000_000_000_000_000;

/// Trait for generating candidate multipart boundaries.
///
/// In practical use, this will always be `UuidSeparatorGen`, but the tests
/// provide their own deterministic implementation.
pub trait SeparatorGen {
    /// Generates a new multipart boundary candidate. The boundary must be safe
    /// to splice into a quoted-string without escaping, and must not exceed
    /// 70 characters in length.
    fn gen(&mut self) -> Vec<u8>;
}

/// Separator generator based on random UUIDs.
///
/// Boundaries look like `===============0123456789012345678==`, the shape
/// most mail user agents produce.
#[derive(Clone,Copy,Debug,Default)]
pub struct UuidSeparatorGen;
impl SeparatorGen for UuidSeparatorGen {
    fn gen(&mut self) -> Vec<u8> {
        format_boundary(Uuid::new_v4().as_u128() % DIGIT_MODULUS)
    }
}

fn format_boundary(digits: u128) -> Vec<u8> {
    format!("==============={:019}==", digits).into_bytes()
}

/// Produces boundaries which collide with nothing in the message being
/// wrapped.
///
/// The generator remembers everything it has handed out, so nested wrapping
/// layers built through the same generator never share a boundary.
#[derive(Debug)]
pub struct BoundaryGenerator<G> {
    sgen: G,
    issued: BTreeSet<Vec<u8>>,
}

impl<G : SeparatorGen> BoundaryGenerator<G> {
    pub fn new(sgen: G) -> Self {
        BoundaryGenerator {
            sgen: sgen,
            issued: BTreeSet::new(),
        }
    }

    /// Generates a boundary for a new multipart whose parts will contain
    /// `content`.
    ///
    /// The result is distinct from every member of `existing` and from every
    /// boundary this generator returned before, and no line of `content`
    /// starts with `--` followed by it.
    pub fn generate(&mut self, existing: &BTreeSet<Vec<u8>>, content: &[u8])
                    -> Vec<u8> {
        let mut attempt = 0;
        loop {
            let mut candidate = self.sgen.gen();
            if attempt >= MAX_ATTEMPTS {
                // The generator keeps repeating itself; make it unique by
                // brute force.
                candidate.extend_from_slice(
                    format!(".{}", attempt - MAX_ATTEMPTS).as_bytes());
            }

            if self.is_fresh(&candidate, existing, content) {
                self.issued.insert(candidate.clone());
                return candidate;
            }

            debug!("boundary candidate \"{}\" collides, retrying",
                   String::from_utf8_lossy(&candidate));
            attempt += 1;
        }
    }

    fn is_fresh(&self, candidate: &[u8], existing: &BTreeSet<Vec<u8>>,
                content: &[u8]) -> bool {
        !existing.contains(candidate) &&
            !self.issued.contains(candidate) &&
            !mime::contains_delimiter_prefix(content, candidate)
    }
}

/// Deterministic generator for tests, counting up from 1.
#[cfg(test)]
#[derive(Clone,Debug,Default)]
pub struct DetSeparatorGen {
    counter: u128,
}

#[cfg(test)]
impl SeparatorGen for DetSeparatorGen {
    fn gen(&mut self) -> Vec<u8> {
        self.counter += 1;
        format_boundary(self.counter)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct StuckSeparatorGen;
    impl SeparatorGen for StuckSeparatorGen {
        fn gen(&mut self) -> Vec<u8> {
            b"stuck".to_vec()
        }
    }

    fn det(n: u128) -> Vec<u8> {
        format_boundary(n)
    }

    #[test]
    fn uuid_boundaries_have_expected_shape() {
        let boundary = UuidSeparatorGen.gen();
        assert_eq!(36, boundary.len());
        assert!(boundary.starts_with(b"==============="));
        assert!(boundary.ends_with(b"=="));
        assert!(boundary[15..34].iter().all(|ch| ch.is_ascii_digit()));
    }

    #[test]
    fn det_boundaries_are_zero_padded() {
        assert_eq!(&b"===============0000000000000000042=="[..], &det(42)[..]);
    }

    #[test]
    fn first_candidate_used_if_fresh() {
        let mut bgen = BoundaryGenerator::new(DetSeparatorGen::default());
        assert_eq!(det(1), bgen.generate(&BTreeSet::new(), b"hello"));
    }

    #[test]
    fn existing_boundaries_skipped() {
        let mut bgen = BoundaryGenerator::new(DetSeparatorGen::default());
        let existing: BTreeSet<Vec<u8>> = vec![det(1), det(2)]
            .into_iter().collect();
        assert_eq!(det(3), bgen.generate(&existing, b""));
    }

    #[test]
    fn boundaries_never_reissued() {
        let mut bgen = BoundaryGenerator::new(StuckSeparatorGen);
        let first = bgen.generate(&BTreeSet::new(), b"");
        let second = bgen.generate(&BTreeSet::new(), b"");
        assert_eq!(&b"stuck"[..], &first[..]);
        assert_eq!(&b"stuck.0"[..], &second[..]);
    }

    #[test]
    fn delimiter_prefixes_in_content_skipped() {
        let mut bgen = BoundaryGenerator::new(DetSeparatorGen::default());
        let mut content = b"text\n--".to_vec();
        content.extend_from_slice(&det(1));
        content.extend_from_slice(b"-suffix\nmore\n");
        assert_eq!(det(2), bgen.generate(&BTreeSet::new(), &content));
    }

    #[test]
    fn suffix_fallback_skips_content_collisions() {
        let mut bgen = BoundaryGenerator::new(StuckSeparatorGen);
        let existing: BTreeSet<Vec<u8>> = vec![b"stuck".to_vec()]
            .into_iter().collect();
        let boundary = bgen.generate(&existing, b"--stuck.0\n");
        assert_eq!(&b"stuck.1"[..], &boundary[..]);
    }
}
