//! The garbage-collected heap.
//!
//! All object payloads live in a slot arena: a `Vec` of entries plus a free
//! list, so slots freed by the collector are reused and long-running
//! allocation loops keep a stable footprint. A [`HeapId`] is an index into
//! the arena and is the only way to reach an object; the heap exclusively
//! owns every payload.
//!
//! Collection is stop-the-world tri-color mark-and-sweep. Allocations grow a
//! byte estimate; once it passes the `next_gc` watermark the VM (the only
//! caller, at its dispatch-loop safe point) gathers roots and calls
//! [`Heap::collect`]. After a sweep the watermark is reset to
//! `max(live_bytes * growth_factor, heap_initial)`.

use std::collections::BTreeMap;
use std::hash::{BuildHasher, Hash, Hasher};

use indexmap::IndexMap;
use smallvec::SmallVec;

use crate::{
    bytecode::FuncId,
    intern::Interner,
    value::{Value, values_equal},
};

/// Index of a heap object in the slot arena.
///
/// `u32` keeps `Value` small; four billion live objects is far beyond any
/// realistic heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId(u32);

impl HeapId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Payload of a heap object.
#[derive(Debug)]
pub(crate) enum HeapData {
    /// Immutable UTF-8 string, interned on creation.
    Str(Box<str>),
    /// Growable array of values.
    Array(Vec<Value>),
    /// Insertion-ordered dictionary with string/number keys.
    Dict(Dict),
    /// A function plus its captured upvalues.
    Closure(Closure),
    /// A captured variable cell; open while the variable is still on the
    /// stack, closed (owning) afterward.
    Upvalue(Upvalue),
}

impl HeapData {
    /// Static name of the object kind, for stats and error messages.
    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "Str",
            Self::Array(_) => "Array",
            Self::Dict(_) => "Dict",
            Self::Closure(_) => "Closure",
            Self::Upvalue(_) => "Upvalue",
        }
    }

    /// Rough byte footprint, used for the GC trigger watermark.
    fn estimate_size(&self) -> usize {
        const VALUE_SIZE: usize = size_of::<Value>();
        match self {
            Self::Str(s) => 24 + s.len(),
            Self::Array(items) => 32 + items.capacity() * VALUE_SIZE,
            Self::Dict(dict) => 48 + dict.entries.capacity() * (VALUE_SIZE * 2 + 16),
            Self::Closure(closure) => 40 + closure.upvalues.len() * size_of::<HeapId>(),
            Self::Upvalue(_) => 32,
        }
    }
}

/// A closure: a function prototype id plus the captured upvalue cells.
#[derive(Debug)]
pub(crate) struct Closure {
    pub func: FuncId,
    pub upvalues: SmallVec<[HeapId; 4]>,
}

/// A captured variable.
///
/// The transition is monotone: `Open` (pointing at a live stack slot)
/// becomes `Closed` (owning the value) exactly once, when the slot is about
/// to be popped, and never reverts.
#[derive(Debug)]
pub(crate) enum Upvalue {
    /// Absolute index into the VM's value stack.
    Open(usize),
    Closed(Value),
}

/// A dict key with its hash precomputed at insertion time.
///
/// Hashing a key needs heap access (string content), which `Hash` cannot
/// express, so the hash is computed up front by [`Heap::dict_key`] and the
/// `Hash` impl just replays it. Equality is [`values_equal`]: numeric with
/// int/float promotion, identity for strings — and string identity *is*
/// content equality because strings are interned.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DictKey {
    hash: u64,
    pub key: Value,
}

impl Hash for DictKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl PartialEq for DictKey {
    fn eq(&self, other: &Self) -> bool {
        values_equal(self.key, other.key)
    }
}

impl Eq for DictKey {}

/// Insertion-ordered hash table backing the dict object kind.
#[derive(Debug, Default)]
pub(crate) struct Dict {
    entries: IndexMap<DictKey, Value, ahash::RandomState>,
}

impl Dict {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: IndexMap::with_capacity_and_hasher(capacity, ahash::RandomState::default()),
        }
    }

    pub(crate) fn get(&self, key: &DictKey) -> Option<Value> {
        self.entries.get(key).copied()
    }

    pub(crate) fn insert(&mut self, key: DictKey, value: Value) {
        self.entries.insert(key, value);
    }

    pub(crate) fn contains(&self, key: &DictKey) -> bool {
        self.entries.contains_key(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Key of the `index`th entry in insertion order.
    pub(crate) fn key_at(&self, index: usize) -> Option<Value> {
        self.entries.get_index(index).map(|(k, _)| k.key)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries.iter().map(|(k, &v)| (k.key, v))
    }
}

/// A live arena slot.
#[derive(Debug)]
struct Entry {
    marked: bool,
    data: HeapData,
}

/// Snapshot of heap occupancy at a point in time.
///
/// Modeled for tests and embedders that want to assert GC behavior: the GC
/// stress suite checks that `live_objects` stabilizes while garbage is being
/// produced and that reachable objects survive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapStats {
    /// Number of live objects on the heap.
    pub live_objects: usize,
    /// Free (recycled) slots available for reuse.
    pub free_slots: usize,
    /// Total arena capacity (live + free).
    pub total_slots: usize,
    /// Estimated bytes held by live objects.
    pub bytes_allocated: usize,
    /// Watermark at which the next collection triggers.
    pub next_gc: usize,
    /// Live entries in the string interning table.
    pub interned_strings: usize,
    /// Breakdown of live objects by kind name.
    ///
    /// `BTreeMap` for deterministic iteration order in test output.
    pub objects_by_type: BTreeMap<&'static str, usize>,
    /// Number of collections run so far.
    pub collections: u64,
}

impl HeapStats {
    /// Computes the difference between `self` ("before") and `other`
    /// ("after").
    ///
    /// Positive deltas mean growth. Useful for asserting what a snippet of
    /// code allocated or freed without caring about absolute counts.
    #[must_use]
    pub fn diff(&self, other: &Self) -> HeapDiff {
        let mut objects_by_type_delta: BTreeMap<&'static str, isize> = BTreeMap::new();
        let mut new_types = Vec::new();
        let mut removed_types = Vec::new();

        for (&kind, &count) in &other.objects_by_type {
            let before = self.objects_by_type.get(kind).copied().unwrap_or(0);
            if before == 0 {
                new_types.push(kind);
            }
            objects_by_type_delta.insert(kind, isize_delta(before, count));
        }
        for (&kind, &count) in &self.objects_by_type {
            if !other.objects_by_type.contains_key(kind) {
                removed_types.push(kind);
                objects_by_type_delta.insert(kind, isize_delta(count, 0));
            }
        }

        HeapDiff {
            live_objects_delta: isize_delta(self.live_objects, other.live_objects),
            bytes_allocated_delta: isize_delta(self.bytes_allocated, other.bytes_allocated),
            interned_strings_delta: isize_delta(self.interned_strings, other.interned_strings),
            objects_by_type_delta,
            new_types,
            removed_types,
            collections_delta: other.collections - self.collections,
        }
    }
}

/// Difference between two heap snapshots, computed by [`HeapStats::diff`].
///
/// Only kinds present in at least one snapshot appear in
/// `objects_by_type_delta`; kinds exclusive to the "after" snapshot are
/// listed in `new_types`, kinds exclusive to "before" in `removed_types`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapDiff {
    /// Change in live object count (`after - before`).
    pub live_objects_delta: isize,
    /// Change in the live-byte estimate.
    pub bytes_allocated_delta: isize,
    /// Change in interned string count.
    pub interned_strings_delta: isize,
    /// Per-kind live-object deltas.
    pub objects_by_type_delta: BTreeMap<&'static str, isize>,
    /// Kinds that appeared in "after" but not "before".
    pub new_types: Vec<&'static str>,
    /// Kinds that appeared in "before" but not "after".
    pub removed_types: Vec<&'static str>,
    /// Collections run between the two snapshots.
    pub collections_delta: u64,
}

impl HeapDiff {
    /// True when nothing changed between the two snapshots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live_objects_delta == 0
            && self.bytes_allocated_delta == 0
            && self.interned_strings_delta == 0
            && self.new_types.is_empty()
            && self.removed_types.is_empty()
            && self.objects_by_type_delta.values().all(|&delta| delta == 0)
            && self.collections_delta == 0
    }
}

impl std::fmt::Display for HeapDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "HeapDiff: no changes");
        }
        write!(
            f,
            "HeapDiff: {:+} live objects, {:+} bytes",
            self.live_objects_delta, self.bytes_allocated_delta
        )?;
        for (&kind, &delta) in &self.objects_by_type_delta {
            if delta != 0 {
                write!(f, "\n  {kind}: {delta:+}")?;
            }
        }
        if !self.new_types.is_empty() {
            write!(f, "\n  New types: {}", self.new_types.join(", "))?;
        }
        if !self.removed_types.is_empty() {
            write!(f, "\n  Removed types: {}", self.removed_types.join(", "))?;
        }
        Ok(())
    }
}

fn isize_delta(before: usize, after: usize) -> isize {
    isize::try_from(after).expect("count fits isize") - isize::try_from(before).expect("count fits isize")
}

/// The garbage-collected slot arena.
pub struct Heap {
    entries: Vec<Option<Entry>>,
    /// Slots freed by the sweep, reused by `alloc`.
    free_list: Vec<HeapId>,
    interner: Interner,
    /// Shared hash state for dict keys, so a key hashes identically in every
    /// dict of this VM.
    hasher: ahash::RandomState,
    bytes_allocated: usize,
    next_gc: usize,
    heap_initial: usize,
    growth_factor: f64,
    /// Gray worklist, kept allocated between collections.
    gray: Vec<HeapId>,
    collections: u64,
}

impl Heap {
    pub(crate) fn new(heap_initial: usize, growth_factor: f64) -> Self {
        Self {
            entries: Vec::new(),
            free_list: Vec::new(),
            interner: Interner::default(),
            hasher: ahash::RandomState::default(),
            bytes_allocated: 0,
            next_gc: heap_initial,
            heap_initial,
            growth_factor,
            gray: Vec::new(),
            collections: 0,
        }
    }

    /// Allocates a heap object and returns its id.
    ///
    /// Never collects: collection happens only at the VM's safe point, so
    /// callers holding ids of not-yet-rooted objects stay sound.
    pub(crate) fn alloc(&mut self, data: HeapData) -> HeapId {
        self.bytes_allocated += data.estimate_size();
        let entry = Entry { marked: false, data };
        if let Some(id) = self.free_list.pop() {
            debug_assert!(self.entries[id.index()].is_none(), "free list slot occupied");
            self.entries[id.index()] = Some(entry);
            id
        } else {
            let index = u32::try_from(self.entries.len()).expect("heap exceeds u32 slots");
            self.entries.push(Some(entry));
            HeapId(index)
        }
    }

    /// Allocates (or reuses) the interned string for `text`.
    pub(crate) fn alloc_str(&mut self, text: &str) -> HeapId {
        if let Some(id) = self.interner.get(text) {
            return id;
        }
        let id = self.alloc(HeapData::Str(text.into()));
        self.interner.insert(text, id);
        id
    }

    /// Shared access to a live object.
    ///
    /// # Panics
    /// Panics if the slot was already swept — reachable-after-free is an
    /// internal invariant violation, never a recoverable state.
    pub(crate) fn get(&self, id: HeapId) -> &HeapData {
        &self
            .entries
            .get(id.index())
            .and_then(Option::as_ref)
            .expect("use of freed heap object")
            .data
    }

    /// Mutable access to a live object.
    pub(crate) fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        &mut self
            .entries
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .expect("use of freed heap object")
            .data
    }

    /// Content of a string object.
    ///
    /// # Panics
    /// Panics if `id` is not a string; callers must have checked the kind.
    pub(crate) fn str_value(&self, id: HeapId) -> &str {
        match self.get(id) {
            HeapData::Str(s) => s,
            other => panic!("expected Str, found {}", other.kind_name()),
        }
    }

    /// Builds a pre-hashed dict key from a value.
    ///
    /// Returns `None` for types that cannot be dict keys (only strings and
    /// numbers are hashable). An int and the float with the same integral
    /// value hash identically so they find the same entry, matching the
    /// numeric-promotion equality rule.
    pub(crate) fn dict_key(&self, value: Value) -> Option<DictKey> {
        #[expect(clippy::cast_possible_truncation, reason = "integral float checked to fit i64")]
        let hash = match value {
            Value::Int(n) => self.hasher.hash_one(n),
            Value::Float(f) => {
                if f.fract() == 0.0 && f >= -(2f64.powi(63)) && f < 2f64.powi(63) {
                    self.hasher.hash_one(f as i64)
                } else {
                    self.hasher.hash_one(f.to_bits())
                }
            }
            Value::Ref(id) => match self.get(id) {
                HeapData::Str(s) => self.hasher.hash_one(s.as_ref()),
                _ => return None,
            },
            _ => return None,
        };
        Some(DictKey { hash, key: value })
    }

    /// Whether the allocation watermark has been passed.
    #[inline]
    pub(crate) fn should_gc(&self) -> bool {
        self.bytes_allocated > self.next_gc
    }

    /// Runs a full stop-the-world mark-and-sweep collection.
    ///
    /// `roots` must contain every heap id reachable from outside the heap:
    /// the value stack, the globals table, the open-upvalue list, and any
    /// caches the VM holds. Objects reachable from a root survive with their
    /// mark cleared; everything else is freed onto the free list. Strings
    /// are unregistered from the interning table before their slot is
    /// reclaimed, and the byte estimate is recomputed from survivors.
    pub(crate) fn collect(&mut self, roots: impl IntoIterator<Item = HeapId>) {
        // Mark phase: seed the gray worklist with the roots, then trace.
        debug_assert!(self.gray.is_empty());
        for id in roots {
            self.mark(id);
        }
        while let Some(id) = self.gray.pop() {
            self.trace_children(id);
        }

        // Sweep phase: free unmarked slots, unmark survivors.
        let mut live_bytes = 0;
        for index in 0..self.entries.len() {
            let Some(entry) = &mut self.entries[index] else {
                continue;
            };
            if entry.marked {
                entry.marked = false;
                live_bytes += entry.data.estimate_size();
            } else {
                let entry = self.entries[index].take().expect("checked above");
                if let HeapData::Str(text) = &entry.data {
                    self.interner.remove(text);
                }
                self.free_list.push(HeapId(u32::try_from(index).expect("heap exceeds u32 slots")));
            }
        }

        self.bytes_allocated = live_bytes;
        #[expect(clippy::cast_sign_loss, reason = "growth factor is validated positive")]
        #[expect(clippy::cast_possible_truncation, reason = "watermark saturates at usize")]
        {
            self.next_gc = ((live_bytes as f64 * self.growth_factor) as usize).max(self.heap_initial);
        }
        self.collections += 1;
    }

    /// Marks an object gray if it has not been reached yet.
    fn mark(&mut self, id: HeapId) {
        let entry = self.entries[id.index()]
            .as_mut()
            .expect("GC root points at freed object");
        if !entry.marked {
            entry.marked = true;
            self.gray.push(id);
        }
    }

    /// Pushes every object directly referenced by `id` onto the worklist.
    fn trace_children(&mut self, id: HeapId) {
        // Collect child ids first: marking needs `&mut self` and the
        // borrow of the entry's payload must end before that.
        let mut children: SmallVec<[HeapId; 8]> = SmallVec::new();
        match &self.entries[id.index()].as_ref().expect("gray object freed").data {
            HeapData::Str(_) => {}
            HeapData::Array(items) => {
                for value in items {
                    if let Value::Ref(child) = value {
                        children.push(*child);
                    }
                }
            }
            HeapData::Dict(dict) => {
                for (key, value) in dict.iter() {
                    if let Value::Ref(child) = key {
                        children.push(child);
                    }
                    if let Value::Ref(child) = value {
                        children.push(child);
                    }
                }
            }
            HeapData::Closure(closure) => {
                children.extend(closure.upvalues.iter().copied());
            }
            HeapData::Upvalue(upvalue) => match upvalue {
                // Open upvalues point into the value stack, which is a root
                // of its own; there is nothing heap-side to trace.
                Upvalue::Open(_) => {}
                Upvalue::Closed(value) => {
                    if let Value::Ref(child) = value {
                        children.push(*child);
                    }
                }
            },
        }
        for child in children {
            self.mark(child);
        }
    }

    /// Snapshot of current heap occupancy.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut objects_by_type: BTreeMap<&'static str, usize> = BTreeMap::new();
        let mut live_objects = 0;
        for entry in self.entries.iter().flatten() {
            live_objects += 1;
            *objects_by_type.entry(entry.data.kind_name()).or_insert(0) += 1;
        }
        HeapStats {
            live_objects,
            free_slots: self.free_list.len(),
            total_slots: self.entries.len(),
            bytes_allocated: self.bytes_allocated,
            next_gc: self.next_gc,
            interned_strings: self.interner.len(),
            objects_by_type,
            collections: self.collections,
        }
    }

    /// Whether the slot is still live. Test-support only.
    #[cfg(test)]
    pub(crate) fn is_live(&self, id: HeapId) -> bool {
        self.entries.get(id.index()).is_some_and(Option::is_some)
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("live_objects", &(self.entries.len() - self.free_list.len()))
            .field("bytes_allocated", &self.bytes_allocated)
            .field("next_gc", &self.next_gc)
            .field("collections", &self.collections)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_heap() -> Heap {
        Heap::new(1024, 2.0)
    }

    #[test]
    fn interning_dedupes_equal_contents() {
        let mut heap = test_heap();
        let a = heap.alloc_str("hello");
        let b = heap.alloc_str("hello");
        let c = heap.alloc_str("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn collect_frees_unreachable_and_keeps_reachable() {
        let mut heap = test_heap();
        let keep = heap.alloc_str("keep");
        let drop = heap.alloc_str("drop");
        heap.collect([keep]);
        assert!(heap.is_live(keep));
        assert!(!heap.is_live(drop));
        assert_eq!(heap.stats().live_objects, 1);
    }

    #[test]
    fn sweep_unregisters_interned_strings() {
        let mut heap = test_heap();
        let first = heap.alloc_str("transient");
        heap.collect([]);
        // A fresh allocation with the same content must get a fresh slot,
        // not the stale table entry.
        let second = heap.alloc_str("transient");
        assert!(heap.is_live(second));
        assert_eq!(first, second, "slot should be recycled through the free list");
        assert_eq!(heap.stats().interned_strings, 1);
    }

    #[test]
    fn marking_traces_array_elements() {
        let mut heap = test_heap();
        let inner = heap.alloc_str("inner");
        let array = heap.alloc(HeapData::Array(vec![Value::Ref(inner), Value::Int(1)]));
        heap.collect([array]);
        assert!(heap.is_live(array));
        assert!(heap.is_live(inner));
    }

    #[test]
    fn marking_traces_cycles_once() {
        let mut heap = test_heap();
        let a = heap.alloc(HeapData::Array(Vec::new()));
        let b = heap.alloc(HeapData::Array(vec![Value::Ref(a)]));
        // Close the cycle a -> b -> a.
        match heap.get_mut(a) {
            HeapData::Array(items) => items.push(Value::Ref(b)),
            _ => unreachable!(),
        }
        heap.collect([a]);
        assert!(heap.is_live(a));
        assert!(heap.is_live(b));
        // Unrooted, the cycle is collected even though refcounts never drop.
        heap.collect([]);
        assert!(!heap.is_live(a));
        assert!(!heap.is_live(b));
    }

    #[test]
    fn dict_keys_promote_numerics() {
        let mut heap = test_heap();
        let mut dict = Dict::default();
        let int_key = heap.dict_key(Value::Int(3)).unwrap();
        dict.insert(int_key, Value::Int(30));
        let float_key = heap.dict_key(Value::Float(3.0)).unwrap();
        assert!(matches!(dict.get(&float_key), Some(Value::Int(30))));
    }

    #[test]
    fn dict_rejects_unhashable_keys() {
        let mut heap = test_heap();
        let array = heap.alloc(HeapData::Array(Vec::new()));
        assert!(heap.dict_key(Value::Ref(array)).is_none());
        assert!(heap.dict_key(Value::Nil).is_none());
    }

    #[test]
    fn heap_diff_tracks_growth_and_new_types() {
        let mut heap = test_heap();
        let before = heap.stats();
        let kept = heap.alloc_str("diffed");
        let _array = heap.alloc(HeapData::Array(vec![Value::Ref(kept)]));
        let after = heap.stats();
        let diff = before.diff(&after);
        assert_eq!(diff.live_objects_delta, 2);
        assert_eq!(diff.interned_strings_delta, 1);
        assert!(diff.new_types.contains(&"Array"));
        assert!(!diff.is_empty());
        assert!(diff.to_string().contains("+2 live objects"));
    }

    #[test]
    fn heap_diff_of_identical_snapshots_is_empty() {
        let mut heap = test_heap();
        heap.alloc_str("stable");
        let stats = heap.stats();
        assert!(stats.diff(&stats.clone()).is_empty());
    }

    #[test]
    fn watermark_grows_after_collection() {
        let mut heap = test_heap();
        let mut keep = Vec::new();
        for i in 0..64 {
            keep.push(heap.alloc_str(&format!("string-{i}")));
        }
        assert!(heap.should_gc());
        heap.collect(keep.iter().copied());
        assert!(!heap.should_gc());
        let stats = heap.stats();
        assert!(stats.next_gc >= stats.bytes_allocated);
    }
}
