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

//! Names under which a Tub publishes its objects.
//!
//! Objects registered by the application are held strongly until they are
//! unregistered. Objects that only acquire a name because they were sent to
//! a peer are held weakly: the name lives as long as somebody, such as a
//! connection's export table, keeps the object alive.

use crate::broker::Referenceable;
use crate::error::TubError;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Length of generated names.
pub const SWISSNUM_LEN: usize = 32;

const SWISSNUM_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz234567";

/// Generates an unguessable object name.
pub fn generate_swissnum() -> String {
    let mut rng = rand::thread_rng();
    (0..SWISSNUM_LEN)
        .map(|_| SWISSNUM_ALPHABET[rng.gen_range(0..SWISSNUM_ALPHABET.len())] as char)
        .collect()
}

enum Entry {
    Strong(Arc<dyn Referenceable>),
    Weak(Weak<dyn Referenceable>),
}

impl Entry {
    fn get(&self) -> Option<Arc<dyn Referenceable>> {
        match self {
            Entry::Strong(object) => Some(Arc::clone(object)),
            Entry::Weak(object) => object.upgrade(),
        }
    }
}

fn key(object: &Arc<dyn Referenceable>) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

#[derive(Default)]
pub(crate) struct Registry {
    by_name: HashMap<String, Entry>,
    by_object: HashMap<usize, String>,
}

impl Registry {
    /// Publishes `object`, under `name` or a generated one.
    pub(crate) fn register(
        &mut self,
        object: Arc<dyn Referenceable>,
        name: Option<String>,
    ) -> Result<String, TubError> {
        self.prune();
        let name = match name {
            Some(name) => {
                if name.is_empty() || name.contains('/') {
                    return Err(TubError::InvalidName { name });
                }
                name
            }
            None => match self.name_of(&object) {
                Some(existing) => existing,
                None => generate_swissnum(),
            },
        };
        if let Some(existing) = self.by_name.get(&name).and_then(Entry::get) {
            if key(&existing) != key(&object) {
                return Err(TubError::NameInUse { name });
            }
        }
        self.by_object.insert(key(&object), name.clone());
        self.by_name.insert(name.clone(), Entry::Strong(object));
        Ok(name)
    }

    /// Names an object that is being sent to a peer, without keeping it alive.
    pub(crate) fn name_for_export(&mut self, object: &Arc<dyn Referenceable>) -> String {
        if let Some(name) = self.name_of(object) {
            return name;
        }
        self.prune();
        let name = generate_swissnum();
        self.by_object.insert(key(object), name.clone());
        self.by_name
            .insert(name.clone(), Entry::Weak(Arc::downgrade(object)));
        name
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<Arc<dyn Referenceable>> {
        self.by_name.get(name).and_then(Entry::get)
    }

    /// The name `object` is published under, if it is still alive there.
    pub(crate) fn name_of(&self, object: &Arc<dyn Referenceable>) -> Option<String> {
        let name = self.by_object.get(&key(object))?;
        let current = self.by_name.get(name).and_then(Entry::get)?;
        (key(&current) == key(object)).then(|| name.clone())
    }

    pub(crate) fn unregister(&mut self, name: &str) -> bool {
        match self.by_name.remove(name) {
            Some(entry) => {
                if let Some(object) = entry.get() {
                    self.by_object.remove(&key(&object));
                }
                true
            }
            None => false,
        }
    }

    fn prune(&mut self) {
        let dead: Vec<String> = self
            .by_name
            .iter()
            .filter(|(_, entry)| matches!(entry, Entry::Weak(w) if w.strong_count() == 0))
            .map(|(name, _)| name.clone())
            .collect();
        for name in dead {
            self.by_name.remove(&name);
            self.by_object.retain(|_, n| *n != name);
        }
    }
}
