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

//! Call arguments and results.

use crate::broker::{Referenceable, RemoteReference, ValueKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A value passed to or returned from a remote method.
///
/// Plain data is copied. [`Value::Local`] passes one of our objects by
/// reference; the receiver gets a [`RemoteReference`] to it. Passing the same
/// object twice over one connection yields the same reference on the other
/// side. [`Value::Remote`] passes a reference we hold: back to its owner it
/// arrives as the owner's original object; to anybody else it travels as a
/// gift.
#[derive(Clone, Default)]
pub enum Value {
    /// No value.
    #[default]
    None,
    /// A boolean.
    Bool(bool),
    /// A signed integer.
    Int(i64),
    /// A float.
    Float(f64),
    /// A string.
    Str(String),
    /// A byte string.
    Bytes(Vec<u8>),
    /// A sequence.
    List(Vec<Value>),
    /// A string-keyed mapping.
    Dict(BTreeMap<String, Value>),
    /// One of our objects, passed by reference.
    Local(Arc<dyn Referenceable>),
    /// A reference to an object in another tub.
    Remote(RemoteReference),
}

impl Value {
    /// Wraps a local object.
    pub fn local<T: Referenceable>(object: T) -> Self {
        Self::Local(Arc::new(object))
    }

    /// Returns the kind of this value, for schema checks.
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::None => ValueKind::None,
            Self::Bool(_) => ValueKind::Bool,
            Self::Int(_) => ValueKind::Int,
            Self::Float(_) => ValueKind::Float,
            Self::Str(_) => ValueKind::Str,
            Self::Bytes(_) => ValueKind::Bytes,
            Self::List(_) => ValueKind::List,
            Self::Dict(_) => ValueKind::Dict,
            Self::Local(_) | Self::Remote(_) => ValueKind::Reference,
        }
    }

    /// Returns the integer, if this is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the boolean, if this is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the string, if this is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the elements, if this is a list.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the remote reference, if this is one.
    pub fn as_remote(&self) -> Option<&RemoteReference> {
        match self {
            Self::Remote(r) => Some(r),
            _ => None,
        }
    }

    /// Converts into the remote reference, if this is one.
    pub fn into_remote(self) -> Option<RemoteReference> {
        match self {
            Self::Remote(r) => Some(r),
            _ => None,
        }
    }

    /// Returns the local object, if this is one.
    pub fn as_local(&self) -> Option<&Arc<dyn Referenceable>> {
        match self {
            Self::Local(o) => Some(o),
            _ => None,
        }
    }

    /// Returns the value at `path`, walking list indices and dict keys.
    pub(crate) fn at_path_mut(&mut self, path: &[PathSegment]) -> Option<&mut Value> {
        let mut current = self;
        for segment in path {
            current = match (current, segment) {
                (Self::List(items), PathSegment::Index(i)) => items.get_mut(*i)?,
                (Self::Dict(map), PathSegment::Key(k)) => map.get_mut(k)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

/// One step into a nested [`Value`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PathSegment {
    Index(usize),
    Key(String),
}

impl PartialEq for Value {
    /// Data compares structurally; references compare by identity.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Dict(a), Self::Dict(b)) => a == b,
            (Self::Local(a), Self::Local(b)) => same_object(a, b),
            (Self::Remote(a), Self::Remote(b)) => a.same_object(b),
            _ => false,
        }
    }
}

/// Identity of a local object, ignoring vtable pointers.
pub(crate) fn object_key(object: &Arc<dyn Referenceable>) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

pub(crate) fn same_object(a: &Arc<dyn Referenceable>, b: &Arc<dyn Referenceable>) -> bool {
    object_key(a) == object_key(b)
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(v) => write!(f, "Bool({})", v),
            Self::Int(v) => write!(f, "Int({})", v),
            Self::Float(v) => write!(f, "Float({})", v),
            Self::Str(v) => write!(f, "Str({:?})", v),
            Self::Bytes(v) => write!(f, "Bytes({} bytes)", v.len()),
            Self::List(v) => f.debug_tuple("List").field(v).finish(),
            Self::Dict(v) => f.debug_tuple("Dict").field(v).finish(),
            Self::Local(o) => write!(f, "Local({:#x})", object_key(o)),
            Self::Remote(r) => write!(f, "{:?}", r),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::List(v)
    }
}

impl From<RemoteReference> for Value {
    fn from(v: RemoteReference) -> Self {
        Self::Remote(v)
    }
}

impl From<Arc<dyn Referenceable>> for Value {
    fn from(v: Arc<dyn Referenceable>) -> Self {
        Self::Local(v)
    }
}

/// Encoded form of a [`Value`] on one connection.
///
/// Reference variants are named from the sender's point of view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireValue {
    /// No value.
    None,
    /// A boolean.
    Bool(bool),
    /// A signed integer.
    Int(i64),
    /// A float.
    Float(f64),
    /// A string.
    Str(String),
    /// A byte string.
    Bytes(Vec<u8>),
    /// A sequence.
    List(Vec<WireValue>),
    /// A string-keyed mapping.
    Dict(BTreeMap<String, WireValue>),
    /// An object exported by the sender under `clid`.
    MyReference {
        /// Sender's connection-local id for the object
        clid: u64,
        /// FURL under which the sender registered the object
        furl: Option<String>,
    },
    /// An object the receiver exported earlier under `clid`.
    YourReference {
        /// Receiver's connection-local id for the object
        clid: u64,
    },
    /// An object owned by a third tub.
    TheirReference {
        /// Where to fetch it
        furl: String,
        /// Sender's id for the pending transfer
        gift_id: u64,
    },
}
