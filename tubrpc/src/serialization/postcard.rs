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

//! Postcard serializer used for broker frames.

use crate::serialization::{DeserializationError, SerializationError, Serializer};

/// Compact binary serializer based on the postcard format.
///
/// An optional size limit rejects oversized payloads before they are decoded.
///
/// # Examples
///
/// ```rust
/// use tubrpc::serialization::{PostcardSerializer, Serializer};
///
/// let serializer = PostcardSerializer::new().with_max_size(16);
/// assert!(serializer.deserialize::<Vec<u8>>(&[0u8; 32]).is_err());
/// ```
#[derive(Clone, Debug, Default)]
pub struct PostcardSerializer {
    max_size: Option<usize>,
}

impl PostcardSerializer {
    /// Creates a serializer with no size limit.
    pub fn new() -> Self {
        Self { max_size: None }
    }

    /// Rejects payloads larger than `max_size` bytes on decode.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }
}

impl Serializer for PostcardSerializer {
    fn serialize<T>(&self, value: &T) -> Result<Vec<u8>, SerializationError>
    where
        T: serde::Serialize + ?Sized,
    {
        let bytes = postcard::to_allocvec(value)?;
        if let Some(max_size) = self.max_size {
            if bytes.len() > max_size {
                return Err(SerializationError::new(format!(
                    "encoded size {} exceeds maximum allowed size {}",
                    bytes.len(),
                    max_size
                )));
            }
        }
        Ok(bytes)
    }

    fn deserialize<T>(&self, bytes: &[u8]) -> Result<T, DeserializationError>
    where
        T: serde::de::DeserializeOwned,
    {
        if let Some(max_size) = self.max_size {
            if bytes.len() > max_size {
                return Err(DeserializationError::new(format!(
                    "data size {} exceeds maximum allowed size {}",
                    bytes.len(),
                    max_size
                )));
            }
        }
        Ok(postcard::from_bytes(bytes)?)
    }

    fn name(&self) -> &'static str {
        "postcard"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    enum Nested {
        Leaf(i64),
        Branch(Vec<Nested>),
        Map(BTreeMap<String, Nested>),
    }

    #[test]
    fn test_recursive_enum() {
        let serializer = PostcardSerializer::default();
        let mut map = BTreeMap::new();
        map.insert("k".to_string(), Nested::Leaf(-7));
        let value = Nested::Branch(vec![Nested::Leaf(1), Nested::Map(map)]);

        let bytes = serializer.serialize(&value).unwrap();
        let decoded: Nested = serializer.deserialize(&bytes).unwrap();
        assert_eq!(value, decoded);
    }

    #[test]
    fn test_max_size_on_encode() {
        let serializer = PostcardSerializer::new().with_max_size(4);
        assert!(serializer.serialize(&vec![0u8; 10]).is_err());
        assert!(serializer.serialize(&1u8).is_ok());
    }

    #[test]
    fn test_truncated_input() {
        let serializer = PostcardSerializer::default();
        let bytes = serializer.serialize(&"hello".to_string()).unwrap();
        let result: Result<String, _> = serializer.deserialize(&bytes[..3]);
        assert!(result.is_err());
    }
}
