//! Open-addressing hash table keyed by interned strings
//!
//! Keys are `Rc<ObjString>` and probe by identity; the precomputed hash
//! stored on the string picks the bucket. The same table type backs the
//! global environment and the string intern pool, which additionally
//! probes by content through `find_string`.

use std::rc::Rc;

use crate::object::ObjString;
use crate::value::Value;

const TABLE_MAX_LOAD: f64 = 0.75;

fn grow_capacity(capacity: usize) -> usize {
    if capacity < 8 {
        8
    } else {
        capacity * 2
    }
}

#[derive(Clone)]
struct Entry {
    key: Option<Rc<ObjString>>,
    value: Value,
}

impl Entry {
    fn empty() -> Self {
        Entry {
            key: None,
            value: Value::Nil,
        }
    }
}

pub struct Table {
    /// Live entries plus tombstones; the load-factor check measures
    /// probe-chain occupancy, so deletion never lowers it
    count: usize,
    entries: Vec<Entry>,
}

/// Locate the slot for `key`: either the entry holding it, or the slot an
/// insertion should use (the first tombstone seen, else the trailing
/// empty slot).
fn find_entry(entries: &[Entry], key: &Rc<ObjString>) -> usize {
    let capacity = entries.len();
    let mut index = key.hash as usize % capacity;
    let mut tombstone: Option<usize> = None;

    loop {
        let entry = &entries[index];
        match &entry.key {
            None => {
                if entry.value.is_nil() {
                    return tombstone.unwrap_or(index);
                }
                if tombstone.is_none() {
                    tombstone = Some(index);
                }
            }
            Some(entry_key) => {
                if Rc::ptr_eq(entry_key, key) {
                    return index;
                }
            }
        }
        index = (index + 1) % capacity;
    }
}

impl Table {
    pub fn new() -> Self {
        Table {
            count: 0,
            entries: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Probe-chain occupancy: live entries plus tombstones
    pub fn count(&self) -> usize {
        self.count
    }

    fn adjust_capacity(&mut self, capacity: usize) {
        let mut entries = vec![Entry::empty(); capacity];

        // Rehash live entries only; tombstones are dropped here
        self.count = 0;
        for entry in &self.entries {
            if let Some(key) = &entry.key {
                let dest = find_entry(&entries, key);
                entries[dest].key = Some(key.clone());
                entries[dest].value = entry.value.clone();
                self.count += 1;
            }
        }

        self.entries = entries;
    }

    /// Insert or overwrite. Returns true when the key was not already
    /// present.
    pub fn set(&mut self, key: Rc<ObjString>, value: Value) -> bool {
        if (self.count + 1) as f64 > self.entries.len() as f64 * TABLE_MAX_LOAD {
            let capacity = grow_capacity(self.entries.len());
            self.adjust_capacity(capacity);
        }

        let index = find_entry(&self.entries, &key);
        let entry = &mut self.entries[index];
        let is_new_key = entry.key.is_none();
        // Reusing a tombstone does not raise probe-chain occupancy
        if is_new_key && entry.value.is_nil() {
            self.count += 1;
        }

        entry.key = Some(key);
        entry.value = value;
        is_new_key
    }

    pub fn get(&self, key: &Rc<ObjString>) -> Option<Value> {
        if self.count == 0 {
            return None;
        }

        let entry = &self.entries[find_entry(&self.entries, key)];
        entry.key.as_ref()?;
        Some(entry.value.clone())
    }

    /// Replace the entry with a tombstone. Returns false when the key was
    /// absent.
    pub fn delete(&mut self, key: &Rc<ObjString>) -> bool {
        if self.count == 0 {
            return false;
        }

        let index = find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        if entry.key.is_none() {
            return false;
        }

        entry.key = None;
        entry.value = Value::Bool(true);
        true
    }

    /// Copy every live entry of `from` into this table
    pub fn add_all(&mut self, from: &Table) {
        for entry in &from.entries {
            if let Some(key) = &entry.key {
                self.set(key.clone(), entry.value.clone());
            }
        }
    }

    /// Content-equality probe used to deduplicate strings before they are
    /// allocated: length, hash, then a byte compare
    pub fn find_string(&self, chars: &str, hash: u32) -> Option<Rc<ObjString>> {
        if self.count == 0 {
            return None;
        }

        let capacity = self.entries.len();
        let mut index = hash as usize % capacity;
        loop {
            let entry = &self.entries[index];
            match &entry.key {
                None => {
                    // A fully empty slot ends the probe; a tombstone does not
                    if entry.value.is_nil() {
                        return None;
                    }
                }
                Some(key) => {
                    if key.chars.len() == chars.len() && key.hash == hash && key.chars == chars {
                        return Some(key.clone());
                    }
                }
            }
            index = (index + 1) % capacity;
        }
    }
}

impl Default for Table {
    fn default() -> Self {
        Table::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Heap;

    fn key(heap: &mut Heap, name: &str) -> Rc<ObjString> {
        heap.copy_string(name)
    }

    #[test]
    fn test_set_get_overwrite() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let k = key(&mut heap, "x");

        assert!(table.set(k.clone(), Value::Number(1.0)));
        assert!(!table.set(k.clone(), Value::Number(2.0)));
        assert!(matches!(table.get(&k), Some(Value::Number(n)) if n == 2.0));
    }

    #[test]
    fn test_get_missing() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let present = key(&mut heap, "here");
        let absent = key(&mut heap, "gone");

        assert!(table.get(&absent).is_none());
        table.set(present, Value::Nil);
        assert!(table.get(&absent).is_none());
    }

    #[test]
    fn test_delete_leaves_tombstone_in_count() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let k = key(&mut heap, "doomed");

        table.set(k.clone(), Value::Bool(true));
        let count_before = table.count();
        assert!(table.delete(&k));
        assert!(table.get(&k).is_none());
        // Deletion never lowers probe-chain occupancy
        assert_eq!(table.count(), count_before);
        assert!(!table.delete(&k));
    }

    #[test]
    fn test_tombstone_reuse_does_not_bump_count() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let k = key(&mut heap, "slot");

        table.set(k.clone(), Value::Number(1.0));
        table.delete(&k);
        let count = table.count();
        // The re-insert lands on the tombstone left behind
        assert!(table.set(k.clone(), Value::Number(2.0)));
        assert_eq!(table.count(), count);
        assert!(matches!(table.get(&k), Some(Value::Number(n)) if n == 2.0));
    }

    #[test]
    fn test_probe_past_tombstone() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let keys: Vec<_> = (0..6).map(|i| key(&mut heap, &format!("k{}", i))).collect();
        for (i, k) in keys.iter().enumerate() {
            table.set(k.clone(), Value::Number(i as f64));
        }

        table.delete(&keys[2]);
        for (i, k) in keys.iter().enumerate() {
            if i == 2 {
                assert!(table.get(k).is_none());
            } else {
                assert!(matches!(table.get(k), Some(Value::Number(n)) if n == i as f64));
            }
        }
    }

    #[test]
    fn test_rehash_preserves_values() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let keys: Vec<_> = (0..32).map(|i| key(&mut heap, &format!("g{}", i))).collect();
        for (i, k) in keys.iter().enumerate() {
            table.set(k.clone(), Value::Number(i as f64));
        }

        assert!(table.capacity() >= 32);
        for (i, k) in keys.iter().enumerate() {
            assert!(matches!(table.get(k), Some(Value::Number(n)) if n == i as f64));
        }
    }

    #[test]
    fn test_capacity_growth_policy() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        table.set(key(&mut heap, "first"), Value::Nil);
        assert_eq!(table.capacity(), 8);
    }

    #[test]
    fn test_add_all_skips_tombstones() {
        let mut heap = Heap::new();
        let mut from = Table::new();
        let kept = key(&mut heap, "kept");
        let dropped = key(&mut heap, "dropped");
        from.set(kept.clone(), Value::Number(1.0));
        from.set(dropped.clone(), Value::Number(2.0));
        from.delete(&dropped);

        let mut to = Table::new();
        to.add_all(&from);
        assert!(matches!(to.get(&kept), Some(Value::Number(n)) if n == 1.0));
        assert!(to.get(&dropped).is_none());
    }

    #[test]
    fn test_find_string_by_content() {
        let mut heap = Heap::new();
        let interned = heap.copy_string("needle");
        // The heap interns through its own table; build an independent one
        let mut table = Table::new();
        table.set(interned.clone(), Value::Nil);

        let hash = crate::object::hash_string("needle");
        let found = table.find_string("needle", hash).unwrap();
        assert!(Rc::ptr_eq(&found, &interned));
        assert!(table
            .find_string("noodle", crate::object::hash_string("noodle"))
            .is_none());
    }
}
