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

//! Serialization error types.

use std::fmt;
use std::io;

/// Error that occurs while encoding a value or writing a frame.
///
/// # Examples
///
/// ```rust
/// use tubrpc::serialization::SerializationError;
///
/// let error = SerializationError::new("frame too large");
/// assert!(error.to_string().contains("frame too large"));
/// ```
#[derive(Debug)]
pub struct SerializationError {
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl SerializationError {
    /// Creates a new serialization error with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new serialization error with a message and source.
    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Returns `true` if the error came from the underlying writer rather
    /// than from encoding.
    pub fn is_io(&self) -> bool {
        self.source
            .as_ref()
            .is_some_and(|e| e.downcast_ref::<io::Error>().is_some())
    }
}

impl fmt::Display for SerializationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "serialization error: {}", self.message)?;
        if let Some(source) = &self.source {
            write!(f, " (caused by: {})", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for SerializationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Error that occurs while reading a frame or decoding a value.
///
/// A read that hits end-of-stream before a frame header arrives is reported
/// as an error for which [`is_eof`](Self::is_eof) returns `true`, so callers
/// can tell an orderly close apart from corruption.
#[derive(Debug)]
pub struct DeserializationError {
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
    eof: bool,
}

impl DeserializationError {
    /// Creates a new deserialization error with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
            eof: false,
        }
    }

    /// Creates a new deserialization error with a message and source.
    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
            eof: false,
        }
    }

    /// Wraps an I/O failure, remembering whether it was end-of-stream.
    pub fn from_io(message: impl Into<String>, source: io::Error) -> Self {
        let eof = source.kind() == io::ErrorKind::UnexpectedEof;
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
            eof,
        }
    }

    /// Returns `true` if the stream ended.
    pub fn is_eof(&self) -> bool {
        self.eof
    }
}

impl fmt::Display for DeserializationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "deserialization error: {}", self.message)?;
        if let Some(source) = &self.source {
            write!(f, " (caused by: {})", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for DeserializationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<postcard::Error> for SerializationError {
    fn from(err: postcard::Error) -> Self {
        Self::with_source("postcard encoding failed", err)
    }
}

impl From<postcard::Error> for DeserializationError {
    fn from(err: postcard::Error) -> Self {
        Self::with_source("postcard decoding failed", err)
    }
}

impl From<serde_json::Error> for SerializationError {
    fn from(err: serde_json::Error) -> Self {
        Self::with_source("JSON encoding failed", err)
    }
}

impl From<serde_json::Error> for DeserializationError {
    fn from(err: serde_json::Error) -> Self {
        Self::with_source("JSON decoding failed", err)
    }
}
