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

//! Reconnection strategies and the reconnector that uses them.
//!
//! A [`Reconnector`] keeps a reference to a FURL alive. When the connection
//! behind it is lost, or a connection race fails, its
//! [`ReconnectionStrategy`] decides whether to race again and how long to
//! wait first.
//!
//! # Available Strategies
//!
//! - [`ExponentialBackoff`]: delays grow exponentially (default)
//! - [`FixedDelay`]: the same delay every time
//! - [`NoReconnect`]: never try again
//!
//! # Examples
//!
//! ## Using Exponential Backoff
//!
//! ```
//! use tubrpc::reconnection::ExponentialBackoff;
//! use std::time::Duration;
//!
//! let strategy = ExponentialBackoff::builder()
//!     .initial_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(30))
//!     .multiplier(2.0)
//!     .jitter(true)
//!     .max_attempts(Some(10))
//!     .build();
//! ```
//!
//! ## Using Fixed Delay
//!
//! ```
//! use tubrpc::reconnection::FixedDelay;
//! use std::time::Duration;
//!
//! let strategy = FixedDelay::new(Duration::from_secs(5));
//! ```
//!
//! ## Keeping a Reference Alive
//!
//! ```rust,no_run
//! use tubrpc::tub::{Tub, TubConfig};
//! use tubrpc::reconnection::FixedDelay;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), tubrpc::TubError> {
//! let config = TubConfig::new()
//!     .with_reconnection_strategy(Arc::new(FixedDelay::new(Duration::from_secs(1))));
//! let tub = Tub::new(config)?;
//! let furl = "pb://abcdefghijklmnopqrstuvwxyz234567@tcp:example.org:7000/calc".parse()?;
//! let reconnector = tub.connect_to(furl, |calc| {
//!     println!("connected to {:?}", calc.peer());
//! });
//! // ...
//! reconnector.stop();
//! # Ok(())
//! # }
//! ```

mod exponential;
mod fixed;
mod no_reconnect;
mod reconnector;
mod traits;

pub use exponential::{ExponentialBackoff, ExponentialBackoffBuilder};
pub use fixed::{FixedDelay, FixedDelayBuilder};
pub use no_reconnect::NoReconnect;
pub use reconnector::Reconnector;
pub use traits::{ReconnectionMetrics, ReconnectionStrategy};
