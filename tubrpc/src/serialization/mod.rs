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

//! Serialization and framing.
//!
//! - [`Serializer`]: pluggable value encoding
//! - [`PostcardSerializer`]: compact binary format for broker traffic
//! - [`JsonSerializer`]: readable format for negotiation messages
//! - [`framing`]: 4-byte length-prefixed frames with a size cap

pub mod framing;
mod error;
mod json;
mod postcard;
mod traits;

pub use self::error::{DeserializationError, SerializationError};
pub use self::json::JsonSerializer;
pub use self::postcard::PostcardSerializer;
pub use self::traits::Serializer;
