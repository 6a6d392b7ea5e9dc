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

//! Identity and versioning support types.
//!
//! - [`TubId`]: stable, totally ordered identifier of a Tub. The larger id of
//!   any pair is the master of their negotiations ([`is_master`]).
//! - [`Incarnation`]: changes every time a Tub is constructed.
//! - [`SequenceNumber`]: per-pair counter assigned by the master.
//! - [`LocationHint`] and [`Furl`]: where and what to connect to.
//! - [`VersionRange`] and [`negotiate_version`]: protocol version agreement.

mod furl;
mod tub_id;
mod version;

pub use furl::{FURL_PREFIX, Furl, FurlError, LocationHint};
pub use tub_id::{Incarnation, InvalidTubId, SequenceNumber, TUB_ID_LEN, TubId, is_master};
pub use version::{SUPPORTED_VERSIONS, VersionRange, negotiate_version};
