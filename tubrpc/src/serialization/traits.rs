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

//! Serialization trait definitions.

use crate::serialization::{DeserializationError, SerializationError};

/// Pluggable encoding for values carried inside frames.
///
/// The negotiation layer encodes its hello and decision messages with
/// [`JsonSerializer`](crate::serialization::JsonSerializer); brokers encode
/// calls and answers with
/// [`PostcardSerializer`](crate::serialization::PostcardSerializer).
///
/// # Examples
///
/// ```rust
/// use tubrpc::serialization::{PostcardSerializer, Serializer};
///
/// let serializer = PostcardSerializer::default();
/// let bytes = serializer.serialize(&(1u32, "two")).unwrap();
/// let (a, b): (u32, String) = serializer.deserialize(&bytes).unwrap();
/// assert_eq!((a, b.as_str()), (1, "two"));
/// ```
pub trait Serializer: Send + Sync + 'static {
    /// Serializes a value to bytes.
    ///
    /// # Errors
    ///
    /// Returns a [`SerializationError`] if the value cannot be encoded.
    fn serialize<T>(&self, value: &T) -> Result<Vec<u8>, SerializationError>
    where
        T: serde::Serialize + ?Sized;

    /// Deserializes bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns a [`DeserializationError`] if the bytes are malformed.
    fn deserialize<T>(&self, bytes: &[u8]) -> Result<T, DeserializationError>
    where
        T: serde::de::DeserializeOwned;

    /// Returns a stable name for this format, used in log lines.
    fn name(&self) -> &'static str;
}
