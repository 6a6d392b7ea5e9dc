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

//! FURLs and location hints.
//!
//! A FURL names a remote object in a self-authenticating way:
//!
//! ```text
//! pb://<tubid>@<hint1>,<hint2>,.../<name>
//! ```
//!
//! The tub id authenticates whoever answers; the hints only say where to look.

use crate::identity::{InvalidTubId, TubId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// FURL scheme prefix.
pub const FURL_PREFIX: &str = "pb://";

/// A `(transport-type, address)` pair telling a connector where a Tub may be
/// reachable.
///
/// Hints are opaque to everything except the resolver that recognises their
/// scheme. A bare `host:port` is accepted as a legacy TCP hint.
///
/// # Examples
///
/// ```rust
/// use tubrpc::identity::LocationHint;
///
/// let hint: LocationHint = "tcp:example.org:4433".parse().unwrap();
/// assert_eq!(hint.scheme(), "tcp");
/// assert_eq!(hint.address(), "example.org:4433");
///
/// let legacy: LocationHint = "example.org:4433".parse().unwrap();
/// assert_eq!(legacy.scheme(), "tcp");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocationHint {
    scheme: String,
    address: String,
}

impl LocationHint {
    /// Creates a hint from its parts.
    pub fn new(scheme: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            address: address.into(),
        }
    }

    /// Shorthand for a `tcp:` hint.
    pub fn tcp(address: impl Into<String>) -> Self {
        Self::new("tcp", address)
    }

    /// Shorthand for an in-process `mem:` hint.
    pub fn memory(address: impl Into<String>) -> Self {
        Self::new("mem", address)
    }

    /// Returns the transport type.
    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Returns the scheme-specific address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl fmt::Display for LocationHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme, self.address)
    }
}

impl FromStr for LocationHint {
    type Err = FurlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.contains(',') || s.contains('/') {
            return Err(FurlError::InvalidHint(s.to_string()));
        }
        let (head, tail) = s
            .split_once(':')
            .ok_or_else(|| FurlError::InvalidHint(s.to_string()))?;
        if tail.is_empty() {
            return Err(FurlError::InvalidHint(s.to_string()));
        }
        // "host:port" with a numeric tail and no further colon is legacy TCP.
        if !tail.contains(':') && tail.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(Self::tcp(s));
        }
        if head.is_empty() || !head.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
            return Err(FurlError::InvalidHint(s.to_string()));
        }
        Ok(Self::new(head.to_ascii_lowercase(), tail))
    }
}

/// A self-authenticating reference to a named object in a remote Tub.
///
/// # Examples
///
/// ```rust
/// use tubrpc::identity::Furl;
///
/// let furl: Furl = "pb://aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa@tcp:10.0.0.1:4433,mem:alice/calc"
///     .parse()
///     .unwrap();
/// assert_eq!(furl.hints().len(), 2);
/// assert_eq!(furl.name(), "calc");
/// assert_eq!(furl.to_string().parse::<Furl>().unwrap(), furl);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Furl {
    tub_id: TubId,
    hints: Vec<LocationHint>,
    name: String,
}

impl Furl {
    /// Assembles a FURL from its parts.
    ///
    /// # Errors
    ///
    /// Returns [`FurlError::InvalidName`] if `name` is empty or contains `/`.
    pub fn new(
        tub_id: TubId,
        hints: Vec<LocationHint>,
        name: impl Into<String>,
    ) -> Result<Self, FurlError> {
        let name = name.into();
        if name.is_empty() || name.contains('/') {
            return Err(FurlError::InvalidName(name));
        }
        Ok(Self {
            tub_id,
            hints,
            name,
        })
    }

    /// Returns the identity of the Tub that owns the object.
    #[must_use]
    pub fn tub_id(&self) -> &TubId {
        &self.tub_id
    }

    /// Returns the location hints, in listed order.
    #[must_use]
    pub fn hints(&self) -> &[LocationHint] {
        &self.hints
    }

    /// Returns the object name within the owning Tub.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Furl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}@", FURL_PREFIX, self.tub_id)?;
        for (i, hint) in self.hints.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", hint)?;
        }
        write!(f, "/{}", self.name)
    }
}

impl FromStr for Furl {
    type Err = FurlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(FURL_PREFIX)
            .ok_or_else(|| FurlError::MissingPrefix(s.to_string()))?;
        let (tub_part, rest) = rest
            .split_once('@')
            .ok_or_else(|| FurlError::Malformed(s.to_string()))?;
        let (hint_part, name) = rest
            .split_once('/')
            .ok_or_else(|| FurlError::Malformed(s.to_string()))?;

        let tub_id = tub_part.parse::<TubId>()?;
        let hints = if hint_part.is_empty() {
            Vec::new()
        } else {
            hint_part
                .split(',')
                .map(str::parse)
                .collect::<Result<Vec<LocationHint>, _>>()?
        };
        Self::new(tub_id, hints, name)
    }
}

impl TryFrom<String> for Furl {
    type Error = FurlError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Furl> for String {
    fn from(furl: Furl) -> Self {
        furl.to_string()
    }
}

/// Errors produced while parsing FURLs and hints.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FurlError {
    /// The text does not start with `pb://`.
    #[error("not a FURL (missing 'pb://' prefix): {0}")]
    MissingPrefix(String),

    /// The text lacks the `@` or `/` separators.
    #[error("malformed FURL: {0}")]
    Malformed(String),

    /// The tub id part is invalid.
    #[error(transparent)]
    TubId(#[from] InvalidTubId),

    /// A location hint is malformed.
    #[error("invalid location hint '{0}'")]
    InvalidHint(String),

    /// The object name is empty or contains '/'.
    #[error("invalid object name '{0}'")]
    InvalidName(String),
}
