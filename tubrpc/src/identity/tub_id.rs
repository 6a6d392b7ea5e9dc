//
// Copyright 2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Tub identifiers, incarnations and connection sequence numbers.

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Length of a textual [`TubId`] in characters.
pub const TUB_ID_LEN: usize = 32;

/// RFC 4648 base32 alphabet, lowercased.
const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// Stable identifier of a Tub.
///
/// A `TubId` is 32 characters drawn from the lowercase base32 alphabet
/// (`a-z`, `2-7`). Identifiers are totally ordered by their text; in any
/// pairwise negotiation the larger identifier is the master.
///
/// # Examples
///
/// ```rust
/// use tubrpc::identity::TubId;
///
/// let a: TubId = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".parse().unwrap();
/// let b: TubId = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb".parse().unwrap();
/// assert!(b > a);
/// assert!(tubrpc::identity::is_master(&b, &a));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TubId(String);

impl TubId {
    /// Generates a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; 20];
        rand::thread_rng().fill(&mut bytes[..]);
        Self(base32_encode(&bytes))
    }

    /// Derives the identifier bound to a DER-encoded certificate.
    ///
    /// The identifier is the base32 encoding of the first 20 bytes of the
    /// certificate's SHA-256 digest, so a peer proving possession of the
    /// certificate's key also proves its identity.
    #[must_use]
    pub fn from_certificate(der: &[u8]) -> Self {
        let digest = Sha256::digest(der);
        Self(base32_encode(&digest[..20]))
    }

    /// Returns the textual form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns an abbreviated form for log lines.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..8]
    }

    fn validate(text: &str) -> Result<(), InvalidTubId> {
        if text.len() != TUB_ID_LEN {
            return Err(InvalidTubId {
                value: text.to_string(),
                reason: format!("expected {} characters, got {}", TUB_ID_LEN, text.len()),
            });
        }
        if let Some(bad) = text.bytes().find(|b| !BASE32_ALPHABET.contains(b)) {
            return Err(InvalidTubId {
                value: text.to_string(),
                reason: format!("character '{}' is outside the base32 alphabet", bad as char),
            });
        }
        Ok(())
    }
}

impl fmt::Display for TubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TubId {
    type Err = InvalidTubId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::validate(s)?;
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for TubId {
    type Error = InvalidTubId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::validate(&value)?;
        Ok(Self(value))
    }
}

impl From<TubId> for String {
    fn from(id: TubId) -> Self {
        id.0
    }
}

/// Error returned when parsing a malformed [`TubId`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid tub id '{value}': {reason}")]
pub struct InvalidTubId {
    /// The rejected text.
    pub value: String,
    /// Why it was rejected.
    pub reason: String,
}

/// Returns `true` when `local` is the master of a negotiation with `remote`.
///
/// This is a pure comparison over the identifiers; it never consults
/// connection state.
#[must_use]
pub fn is_master(local: &TubId, remote: &TubId) -> bool {
    local.cmp(remote) == Ordering::Greater
}

/// Identifies one process lifetime of a Tub.
///
/// A new incarnation is drawn every time a Tub is constructed, so a peer that
/// restarts is recognisable even though its [`TubId`] is unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Incarnation(uuid::Uuid);

impl Incarnation {
    /// Draws a fresh incarnation.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Builds an incarnation from raw bytes. Intended for tests.
    #[must_use]
    pub fn from_u128(value: u128) -> Self {
        Self(uuid::Uuid::from_u128(value))
    }
}

impl fmt::Display for Incarnation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Per-pair connection counter assigned by the master on each accepted
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    /// The sequence number offered before any connection was ever accepted.
    pub const FIRST: SequenceNumber = SequenceNumber(1);

    /// Creates a sequence number.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns the sequence number that follows this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lowercase RFC 4648 base32 without padding.
fn base32_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity((bytes.len() * 8).div_ceil(5));
    let mut buffer: u32 = 0;
    let mut bits = 0u32;
    for &byte in bytes {
        buffer = (buffer << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_valid() {
        let id = TubId::generate();
        assert_eq!(id.as_str().len(), TUB_ID_LEN);
        assert!(id.as_str().parse::<TubId>().is_ok());
    }

    #[test]
    fn test_rejects_bad_length_and_alphabet() {
        assert!("abc".parse::<TubId>().is_err());
        let err = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa1".parse::<TubId>().unwrap_err();
        assert!(err.reason.contains("base32"));
    }

    #[test]
    fn test_master_is_total_and_antisymmetric() {
        let a: TubId = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".parse().unwrap();
        let b: TubId = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaab".parse().unwrap();
        assert!(is_master(&b, &a));
        assert!(!is_master(&a, &b));
        assert!(!is_master(&a, &a));
    }

    #[test]
    fn test_base32_known_vector() {
        assert_eq!(base32_encode(b"foobar"), "mzxw6ytboi");
        assert_eq!(base32_encode(&[0u8; 20]).len(), 32);
    }

    #[test]
    fn test_certificate_binding_is_deterministic() {
        let a = TubId::from_certificate(b"certificate bytes");
        let b = TubId::from_certificate(b"certificate bytes");
        assert_eq!(a, b);
        assert_ne!(a, TubId::from_certificate(b"other bytes"));
    }

    #[test]
    fn test_sequence_next() {
        assert_eq!(SequenceNumber::FIRST.next(), SequenceNumber::new(2));
        assert!(SequenceNumber::new(3) > SequenceNumber::new(2));
    }

    #[test]
    fn test_incarnations_differ() {
        assert_ne!(Incarnation::generate(), Incarnation::generate());
    }
}
