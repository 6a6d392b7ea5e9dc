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

//! Brokers: calls, answers and references over one connection.
//!
//! Once negotiation accepts a connection, a [`Broker`] takes it over.
//!
//! - [`Value`]: what calls carry; plain data, or references to objects.
//! - [`Referenceable`]: an object remote peers can call.
//! - [`RemoteReference`]: a proxy for an object in another Tub.
//! - [`PendingCall`]: the future answer of a call.
//! - [`InterfaceSchema`]: optional checks on arguments and results.
//!
//! Each connection keeps its own reference tables. An object passed to a
//! peer gets a connection-local id (CLID) and a count of how many times it
//! was sent; the peer's proxy reports that count back when it is dropped.
//! References to objects in a third Tub travel as gifts, which the receiver
//! fetches by FURL while the sender holds its own reference alive.

mod connection;
mod error;
pub mod messages;
mod notifier;
mod pending;
mod reference;
mod schema;
mod tables;
mod value;

pub use self::connection::{Broker, BrokerSettings, BrokerState};
pub use self::error::{CallError, DeadReferenceError, Failure, RemoteException};
pub use self::notifier::{DisconnectNotifier, DisconnectToken};
pub use self::pending::{CallResult, PendingCall, PendingCalls, RequestIdGenerator};
pub use self::reference::{ReferenceResolver, Referenceable, RemoteReference};
pub use self::schema::{InterfaceSchema, MethodSchema, ValueKind, Violation};
pub use self::tables::ROOT_CLID;
pub use self::value::{Value, WireValue};
