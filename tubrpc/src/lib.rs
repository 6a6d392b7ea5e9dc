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

#![doc = include_str!("../../README.md")]
#![allow(clippy::module_inception)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

//! # tubrpc
//!
//! Capability-style RPC between peers called Tubs:
//!
//! - **Identity**: every Tub has a [`TubId`](identity::TubId), and objects
//!   are addressed by FURLs (`pb://<tubid>@<hints>/<name>`)
//! - **Connection races**: every location hint of a FURL is tried at once
//!   and the first accepted connection wins
//! - **Deduplication**: at most one live connection per pair of Tubs, kept
//!   consistent across restarts by incarnations and sequence numbers
//! - **References**: objects travel by reference, with distributed
//!   reference counting and third-party handoff (gifts)
//! - **Pluggable transports and security**: TCP, in-memory, and TLS with
//!   certificates pinned to tub ids
//!
//! ## Architecture
//!
//! - **[`identity`]**: tub ids, incarnations, FURLs and version ranges
//! - **[`transport`]**: byte streams and hint resolution
//! - **[`serialization`]**: message encoding with length-prefixed framing
//! - **[`negotiation`]**: the handshake and the duplicate-connection rules
//! - **[`broker`]**: calls, answers and reference tables of one connection
//! - **[`tub`]**: the endpoint: registry, listeners, connection races
//! - **[`reconnection`]**: strategies for keeping references alive
//!
//! ## Error Handling
//!
//! Each layer has its own error type, composed by [`TubError`]:
//!
//! - [`TransportError`](transport::TransportError): I/O and connection errors
//! - [`NegotiationError`](negotiation::NegotiationError): failed or refused
//!   handshakes
//! - [`ConnectionRaceExhausted`](tub::ConnectionRaceExhausted): every hint
//!   failed, with a per-hint report
//! - [`CallError`](broker::CallError): dead references, violations and
//!   remote exceptions
//!
//! ## Features
//!
//! - **`tracing`** (default): log through the `tracing` crate
//! - **`tls`**: TLS transport security with rustls
//!
//! ## Safety
//!
//! tubrpc is written in 100% safe Rust with `#![deny(unsafe_code)]`.
//! All concurrency is handled through Tokio's async runtime.

pub mod broker;
pub mod error;
pub mod identity;
pub mod negotiation;
pub mod reconnection;
pub mod serialization;
pub mod transport;
pub mod tub;

pub use broker::{Broker, CallError, Referenceable, RemoteReference, Value};
pub use error::TubError;
pub use identity::{Furl, LocationHint, TubId};
pub use tub::{Tub, TubConfig};
