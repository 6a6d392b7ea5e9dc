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

//! Call error types.

use crate::broker::Violation;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// An exception raised by a remote method, as sent over the wire.
///
/// Implementations of [`Referenceable`](crate::broker::Referenceable) return
/// it to fail a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Exception type name, e.g. `"ValueError"`.
    pub kind: String,
    /// Human readable description.
    pub message: String,
    /// The violation, when the failure is a schema failure.
    pub violation: Option<Violation>,
}

impl Failure {
    /// Creates a failure.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            violation: None,
        }
    }

    /// The failure for a method the target does not have.
    pub fn no_such_method(method: &str) -> Self {
        Self::new("NoSuchMethod", format!("no method named '{}'", method))
    }
}

impl From<Violation> for Failure {
    fn from(violation: Violation) -> Self {
        Self {
            kind: "Violation".to_string(),
            message: violation.to_string(),
            violation: Some(violation),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// A call failed on the far side.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("remote exception: {0}")]
pub struct RemoteException(pub Failure);

impl RemoteException {
    /// Returns the remote violation, if the remote failure was one.
    pub fn violation(&self) -> Option<&Violation> {
        self.0.violation.as_ref()
    }
}

/// A call went through a reference whose connection is gone.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("dead reference: {reason}")]
pub struct DeadReferenceError {
    /// Why the connection is gone.
    pub reason: String,
}

impl DeadReferenceError {
    /// Creates the error.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Why a remote call did not produce a value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    /// The connection was lost or shut down.
    #[error(transparent)]
    DeadReference(#[from] DeadReferenceError),

    /// A schema check failed on this side, or on the far side when remote
    /// exception types are exposed.
    #[error(transparent)]
    Violation(#[from] Violation),

    /// The far side raised an exception.
    #[error(transparent)]
    Remote(#[from] RemoteException),

    /// The call could not be encoded.
    #[error("failed to encode call: {0}")]
    Encoding(String),

    /// A third-party reference in the call could not be fetched.
    #[error("could not resolve gift {furl}: {reason}")]
    GiftUnavailable {
        /// FURL of the gift
        furl: String,
        /// What went wrong
        reason: String,
    },
}

impl CallError {
    /// Returns `true` for [`CallError::DeadReference`].
    pub fn is_dead_reference(&self) -> bool {
        matches!(self, Self::DeadReference(_))
    }

    /// Returns `true` for a locally reported violation.
    pub fn is_violation(&self) -> bool {
        matches!(self, Self::Violation(_))
    }

    /// Returns `true` for an exception raised on the far side.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    pub(crate) fn dead(reason: impl Into<String>) -> Self {
        Self::DeadReference(DeadReferenceError::new(reason))
    }

    /// Converts the error into a failure to send back to a caller.
    pub(crate) fn into_failure(self) -> Failure {
        match self {
            Self::Violation(v) => v.into(),
            Self::Remote(RemoteException(failure)) => failure,
            Self::DeadReference(e) => Failure::new("DeadReferenceError", e.reason),
            other => Failure::new("CallError", other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_failure_keeps_payload() {
        let failure: Failure = Violation::new("calc.add", "bad").into();
        assert_eq!(failure.kind, "Violation");
        let remote = RemoteException(failure);
        assert_eq!(remote.violation().map(|v| v.message.as_str()), Some("bad"));
    }

    #[test]
    fn test_classification() {
        assert!(CallError::dead("connection lost").is_dead_reference());
        assert!(CallError::from(Violation::new("x", "y")).is_violation());
        let remote = CallError::from(RemoteException(Failure::new("ValueError", "nope")));
        assert!(remote.is_remote());
        assert_eq!(remote.to_string(), "remote exception: ValueError: nope");
    }
}
