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

//! Tubs: the endpoints applications use.
//!
//! A [`Tub`] ties the layers together:
//!
//! - **Publishing**: [`Tub::register`] names an object and returns its
//!   FURL; objects sent to peers are named automatically so they can be
//!   passed on to third parties.
//! - **Listening**: [`Tub::listen`] accepts and negotiates inbound
//!   connections on any [`TransportListener`](crate::transport::TransportListener).
//! - **Connecting**: [`Tub::get_reference`] reuses the live connection to
//!   the FURL's Tub or races every location hint, first accepted wins; a
//!   failed race reports what happened per hint ([`HintReport`]).
//! - **Staying connected**: [`Tub::connect_to`] returns a
//!   [`Reconnector`](crate::reconnection::Reconnector).
//! - **Shutdown**: [`Tub::shutdown`] closes listeners and connections.
//!
//! Every connection's CLID 0 is the Tub's root object, whose only method,
//! [`GET_REFERENCE_BY_NAME`], looks up registered names.

mod config;
mod peers;
mod race;
mod registry;
#[allow(clippy::module_inception)]
mod tub;

pub use config::TubConfig;
pub use race::{ConnectionRaceExhausted, HintOutcome, HintReport};
pub use registry::{SWISSNUM_LEN, generate_swissnum};
pub use tub::{GET_REFERENCE_BY_NAME, Tub};

pub(crate) use tub::TubInner;
