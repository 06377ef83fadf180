//! The string interning table.
//!
//! Every string is interned when it is allocated: equal contents always
//! resolve to the same [`HeapId`], so string equality is pointer identity
//! and dict keys can compare by id. The table holds *weak* entries — it does
//! not keep strings alive. The collector removes an entry just before
//! reclaiming its string, which is what lets short-lived strings be freed at
//! all.

use ahash::AHashMap;

use crate::heap::HeapId;

#[derive(Debug, Default)]
pub(crate) struct Interner {
    map: AHashMap<Box<str>, HeapId>,
}

impl Interner {
    /// Looks up the canonical id for `text`, if one is live.
    pub(crate) fn get(&self, text: &str) -> Option<HeapId> {
        self.map.get(text).copied()
    }

    /// Registers `id` as the canonical string for `text`.
    ///
    /// The caller must have just allocated `id` with exactly this content;
    /// an existing entry would indicate a missed `get` and is a bug.
    pub(crate) fn insert(&mut self, text: &str, id: HeapId) {
        let previous = self.map.insert(text.into(), id);
        debug_assert!(previous.is_none(), "string {text:?} interned twice");
    }

    /// Drops the entry for a string about to be swept.
    pub(crate) fn remove(&mut self, text: &str) {
        self.map.remove(text);
    }

    /// Number of live interned strings.
    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }
}
