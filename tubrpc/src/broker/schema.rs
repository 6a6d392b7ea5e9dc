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

//! Interface schemas and violations.
//!
//! A [`Referenceable`](crate::broker::Referenceable) may describe its methods
//! with an [`InterfaceSchema`]. The receiver checks every inbound call against
//! it before the method runs; a caller that attaches the schema to a
//! reference checks outbound calls before any bytes are sent.

use crate::broker::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Coarse type of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    /// Anything.
    Any,
    /// `Value::None`
    None,
    /// `Value::Bool`
    Bool,
    /// `Value::Int`
    Int,
    /// `Value::Float`
    Float,
    /// `Value::Str`
    Str,
    /// `Value::Bytes`
    Bytes,
    /// `Value::List`
    List,
    /// `Value::Dict`
    Dict,
    /// A local or remote object reference.
    Reference,
}

impl ValueKind {
    /// Returns `true` if `value` is acceptable where this kind is expected.
    pub fn accepts(self, value: &Value) -> bool {
        self == Self::Any || self == value.kind()
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A schema or constraint failure.
///
/// Always reported by the side that detects it: a caller that checks
/// arguments before sending gets it locally; a receiver that rejects a call
/// sends it back wrapped in a remote exception.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("Violation in {location}: {message}")]
pub struct Violation {
    /// Where the failure was found, e.g. `"calc.add(arg 1)"`.
    pub location: String,
    /// What was wrong.
    pub message: String,
}

impl Violation {
    /// Creates a violation.
    pub fn new(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            message: message.into(),
        }
    }
}

/// Signature of one method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSchema {
    /// Expected kinds of the positional arguments.
    pub args: Vec<ValueKind>,
    /// Expected kind of the result.
    pub returns: ValueKind,
}

impl MethodSchema {
    /// Creates a method schema.
    pub fn new(args: Vec<ValueKind>, returns: ValueKind) -> Self {
        Self { args, returns }
    }
}

/// Methods an object answers, with their signatures.
///
/// # Examples
///
/// ```rust
/// use tubrpc::broker::{InterfaceSchema, MethodSchema, Value, ValueKind};
///
/// let schema = InterfaceSchema::new("calc")
///     .method("add", MethodSchema::new(vec![ValueKind::Int, ValueKind::Int], ValueKind::Int));
/// assert!(schema.check_call("add", &[Value::Int(1), Value::Int(2)]).is_ok());
/// assert!(schema.check_call("add", &[Value::Int(1), "two".into()]).is_err());
/// assert!(schema.check_call("sub", &[]).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSchema {
    name: String,
    methods: BTreeMap<String, MethodSchema>,
}

impl InterfaceSchema {
    /// Creates an empty interface.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: BTreeMap::new(),
        }
    }

    /// Adds a method.
    pub fn method(mut self, name: impl Into<String>, schema: MethodSchema) -> Self {
        self.methods.insert(name.into(), schema);
        self
    }

    /// Returns the interface name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Checks the method name and the arguments of a call.
    pub fn check_call(&self, method: &str, args: &[Value]) -> Result<(), Violation> {
        let location = format!("{}.{}", self.name, method);
        let schema = self
            .methods
            .get(method)
            .ok_or_else(|| Violation::new(&location, "no such method in interface"))?;
        if args.len() != schema.args.len() {
            return Err(Violation::new(
                &location,
                format!("expected {} arguments, got {}", schema.args.len(), args.len()),
            ));
        }
        for (i, (kind, arg)) in schema.args.iter().zip(args).enumerate() {
            if !kind.accepts(arg) {
                return Err(Violation::new(
                    format!("{}(arg {})", location, i),
                    format!("expected {}, got {}", kind, arg.kind()),
                ));
            }
        }
        Ok(())
    }

    /// Checks the result of a call.
    pub fn check_return(&self, method: &str, result: &Value) -> Result<(), Violation> {
        match self.methods.get(method) {
            Some(schema) if !schema.returns.accepts(result) => Err(Violation::new(
                format!("{}.{}(return)", self.name, method),
                format!("expected {}, got {}", schema.returns, result.kind()),
            )),
            _ => Ok(()),
        }
    }
}
