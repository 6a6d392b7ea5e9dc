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

//! Per-connection reference tables.
//!
//! The export table maps CLIDs to our objects, with a count of how many
//! times each was sent. Outbound messages stage their exports in an
//! [`ExportStage`] and commit it only once the frame is queued, so an encode
//! failure leaves no CLID behind. The gift table holds references we passed
//! to a third party until the receiver reports the claim finished.

use crate::broker::value::object_key;
use crate::broker::{Referenceable, RemoteReference};
use std::collections::HashMap;
use std::sync::Arc;

/// CLID of a connection's root object.
pub const ROOT_CLID: u64 = 0;

struct ExportEntry {
    object: Arc<dyn Referenceable>,
    refcount: u32,
}

/// Objects we exported over one connection.
pub(crate) struct ExportTable {
    root: Arc<dyn Referenceable>,
    next_clid: u64,
    entries: HashMap<u64, ExportEntry>,
    by_object: HashMap<usize, u64>,
}

/// Exports of one outbound message, not yet committed.
#[derive(Default)]
pub(crate) struct ExportStage {
    staged: HashMap<usize, (u64, u32, Arc<dyn Referenceable>)>,
}

/// Result of applying a decref.
pub(crate) enum Decref {
    /// No such CLID.
    Unknown,
    /// The entry survives with this count.
    Remaining(u32),
    /// The entry was removed; drop the object outside the lock.
    Released(Arc<dyn Referenceable>),
}

impl ExportTable {
    pub(crate) fn new(root: Arc<dyn Referenceable>) -> Self {
        Self {
            root,
            next_clid: ROOT_CLID + 1,
            entries: HashMap::new(),
            by_object: HashMap::new(),
        }
    }

    /// Looks up an exported object; CLID 0 is the root.
    pub(crate) fn get(&self, clid: u64) -> Option<Arc<dyn Referenceable>> {
        if clid == ROOT_CLID {
            return Some(Arc::clone(&self.root));
        }
        self.entries.get(&clid).map(|e| Arc::clone(&e.object))
    }

    pub(crate) fn refcount(&self, clid: u64) -> Option<u32> {
        self.entries.get(&clid).map(|e| e.refcount)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Picks the CLID `object` travels under and records the send in `stage`.
    pub(crate) fn stage(&mut self, stage: &mut ExportStage, object: &Arc<dyn Referenceable>) -> u64 {
        let key = object_key(object);
        if let Some((clid, count, _)) = stage.staged.get_mut(&key) {
            *count += 1;
            return *clid;
        }
        let clid = match self.by_object.get(&key) {
            Some(clid) => *clid,
            None => {
                let clid = self.next_clid;
                self.next_clid += 1;
                clid
            }
        };
        stage.staged.insert(key, (clid, 1, Arc::clone(object)));
        clid
    }

    /// Applies a staged set of exports.
    pub(crate) fn commit(&mut self, stage: ExportStage) {
        for (key, (clid, count, object)) in stage.staged {
            self.entries
                .entry(clid)
                .and_modify(|e| e.refcount = e.refcount.saturating_add(count))
                .or_insert(ExportEntry {
                    object,
                    refcount: count,
                });
            self.by_object.insert(key, clid);
        }
    }

    /// Releases `count` sends of `clid`.
    pub(crate) fn decref(&mut self, clid: u64, count: u32) -> Decref {
        let Some(entry) = self.entries.get_mut(&clid) else {
            return Decref::Unknown;
        };
        entry.refcount = entry.refcount.saturating_sub(count);
        if entry.refcount > 0 {
            return Decref::Remaining(entry.refcount);
        }
        match self.entries.remove(&clid) {
            Some(entry) => {
                self.by_object.remove(&object_key(&entry.object));
                Decref::Released(entry.object)
            }
            None => Decref::Unknown,
        }
    }

    /// Empties the table, returning the objects so they can be dropped
    /// outside the lock.
    pub(crate) fn clear(&mut self) -> Vec<Arc<dyn Referenceable>> {
        self.by_object.clear();
        self.entries.drain().map(|(_, e)| e.object).collect()
    }
}

/// References handed to a third party and not yet claimed.
#[derive(Default)]
pub(crate) struct GiftTable {
    entries: HashMap<u64, RemoteReference>,
}

impl GiftTable {
    pub(crate) fn insert(&mut self, gift_id: u64, reference: RemoteReference) {
        self.entries.insert(gift_id, reference);
    }

    pub(crate) fn remove(&mut self, gift_id: u64) -> Option<RemoteReference> {
        self.entries.remove(&gift_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn take_all(&mut self) -> HashMap<u64, RemoteReference> {
        std::mem::take(&mut self.entries)
    }
}
