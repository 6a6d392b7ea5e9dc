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

//! Messages exchanged by brokers once a connection is accepted.
//!
//! Each message travels in its own length-prefixed frame, encoded with
//! postcard.

use crate::broker::{Failure, WireValue};
use serde::{Deserialize, Serialize};

/// One broker-to-broker message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BrokerMessage {
    /// Invoke `method` on the receiver's object `target`.
    Call {
        /// Request id, or `None` for a call that expects no answer
        req_id: Option<u64>,
        /// Receiver's CLID of the target object; 0 is the root object
        target: u64,
        /// Method name
        method: String,
        /// Positional arguments
        args: Vec<WireValue>,
    },
    /// Successful result of the call `req_id`.
    Answer {
        /// Request id of the call
        req_id: u64,
        /// The result
        value: WireValue,
    },
    /// Failed result of the call `req_id`.
    Error {
        /// Request id of the call
        req_id: u64,
        /// The failure
        failure: Failure,
    },
    /// The sender dropped `count` receipts of the receiver's object `clid`.
    Decref {
        /// Receiver's CLID
        clid: u64,
        /// Number of receipts released
        count: u32,
    },
    /// The sender finished claiming the gift `gift_id`.
    DecGift {
        /// Gift id chosen by the receiver
        gift_id: u64,
    },
}

impl BrokerMessage {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Call { .. } => "call",
            Self::Answer { .. } => "answer",
            Self::Error { .. } => "error",
            Self::Decref { .. } => "decref",
            Self::DecGift { .. } => "decgift",
        }
    }
}
