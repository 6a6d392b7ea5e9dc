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

//! Protocol version ranges and agreement.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The wire protocol versions this build speaks.
pub const SUPPORTED_VERSIONS: VersionRange = VersionRange { min: 1, max: 1 };

/// An inclusive `[min, max]` range of protocol versions.
///
/// # Examples
///
/// ```rust
/// use tubrpc::identity::{VersionRange, negotiate_version};
///
/// let ours = VersionRange::new(1, 3).unwrap();
/// let theirs = VersionRange::new(2, 5).unwrap();
/// assert_eq!(negotiate_version(ours, theirs), Some(3)); // highest common
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionRange {
    min: u32,
    max: u32,
}

impl VersionRange {
    /// Creates a range, returning `None` when `min > max`.
    #[must_use]
    pub fn new(min: u32, max: u32) -> Option<Self> {
        (min <= max).then_some(Self { min, max })
    }

    /// Creates a range holding exactly one version.
    #[must_use]
    pub const fn exactly(version: u32) -> Self {
        Self {
            min: version,
            max: version,
        }
    }

    /// Lowest supported version.
    #[must_use]
    pub const fn min(&self) -> u32 {
        self.min
    }

    /// Highest supported version.
    #[must_use]
    pub const fn max(&self) -> u32 {
        self.max
    }

    /// Returns `true` if `version` lies in the range.
    #[must_use]
    pub const fn contains(&self, version: u32) -> bool {
        self.min <= version && version <= self.max
    }
}

impl Default for VersionRange {
    fn default() -> Self {
        SUPPORTED_VERSIONS
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

/// Returns the highest version common to both ranges, or `None` when they do
/// not intersect.
#[must_use]
pub fn negotiate_version(ours: VersionRange, theirs: VersionRange) -> Option<u32> {
    let low = ours.min.max(theirs.min);
    let high = ours.max.min(theirs.max);
    (low <= high).then_some(high)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_range() {
        assert!(VersionRange::new(3, 2).is_none());
        assert!(VersionRange::new(2, 2).is_some());
    }

    #[test]
    fn test_highest_common_version() {
        let a = VersionRange::new(1, 4).unwrap();
        let b = VersionRange::new(2, 6).unwrap();
        assert_eq!(negotiate_version(a, b), Some(4));
        assert_eq!(negotiate_version(b, a), Some(4));
    }

    #[test]
    fn test_touching_ranges() {
        let a = VersionRange::new(1, 2).unwrap();
        let b = VersionRange::new(2, 3).unwrap();
        assert_eq!(negotiate_version(a, b), Some(2));
    }

    #[test]
    fn test_disjoint_ranges() {
        let a = VersionRange::new(1, 2).unwrap();
        let b = VersionRange::new(3, 4).unwrap();
        assert_eq!(negotiate_version(a, b), None);
    }

    #[test]
    fn test_contains() {
        assert!(SUPPORTED_VERSIONS.contains(1));
        assert!(!VersionRange::exactly(2).contains(1));
    }
}
