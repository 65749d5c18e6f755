//! Fixed-capacity set of fixed-length strings.
//!
//! Backs the script cache, the edit-and-continue queue, and filter
//! pattern storage. All storage is one flat byte pool carved at
//! construction; slots freed by removal are reused by later additions.

use crate::allocator::SequentialAllocator;
use crate::Result;

/// Configuration for a [`StringSet`].
#[derive(Debug, Clone, Copy)]
pub struct StringSetConfig {
    /// Number of slots.
    pub max_entries: u16,
    /// Slot size in bytes; an entry may hold at most `max_entry_len - 1`
    /// bytes (one byte is reserved, matching consumers that append a
    /// terminator).
    pub max_entry_len: u16,
    /// Whether the same string may be stored twice.
    pub allow_duplicates: bool,
}

/// Fixed-capacity string set with free-slot tracking.
#[derive(Debug)]
pub struct StringSet {
    pool: Box<[u8]>,
    lens: Box<[u16]>,
    used: Box<[bool]>,
    entry_len: usize,
    count: u16,
    allow_duplicates: bool,
}

impl StringSet {
    #[must_use]
    pub fn new(config: &StringSetConfig) -> Self {
        let entries = config.max_entries as usize;
        let entry_len = config.max_entry_len as usize;
        Self {
            pool: vec![0u8; entries * entry_len].into_boxed_slice(),
            lens: vec![0u16; entries].into_boxed_slice(),
            used: vec![false; entries].into_boxed_slice(),
            entry_len,
            count: 0,
            allow_duplicates: config.allow_duplicates,
        }
    }

    /// Walk this set's storage layout through a sizing or allocating pass.
    /// Must stay in lockstep with [`StringSet::new`].
    ///
    /// # Errors
    ///
    /// Propagates allocator exhaustion.
    pub fn required_memory(
        config: &StringSetConfig,
        alloc: &mut dyn SequentialAllocator,
    ) -> Result<()> {
        let entries = config.max_entries as usize;
        alloc.allocate(entries * config.max_entry_len as usize, 1)?;
        alloc.allocate(entries * core::mem::size_of::<u16>(), 1)?;
        alloc.allocate(entries, 1)?;
        Ok(())
    }

    /// Bytes reserved by this set.
    #[must_use]
    pub fn footprint(&self) -> usize {
        self.pool.len() + self.lens.len() * core::mem::size_of::<u16>() + self.used.len()
    }

    #[must_use]
    pub const fn len(&self) -> u16 {
        self.count
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.count as usize == self.used.len()
    }

    #[must_use]
    pub fn max_entries(&self) -> u16 {
        self.used.len() as u16
    }

    /// Add a string. Fails when the set is full, the string does not fit
    /// in a slot, the string is empty, or it is a rejected duplicate.
    pub fn add(&mut self, value: &str) -> bool {
        if value.is_empty()
            || self.entry_len == 0
            || value.len() > self.entry_len - 1
            || self.is_full()
        {
            return false;
        }
        if !self.allow_duplicates && self.contains(value) {
            return false;
        }
        for slot in 0..self.used.len() {
            if !self.used[slot] {
                let base = slot * self.entry_len;
                self.pool[base..base + value.len()].copy_from_slice(value.as_bytes());
                self.lens[slot] = value.len() as u16;
                self.used[slot] = true;
                self.count += 1;
                return true;
            }
        }
        false
    }

    /// Remove the first slot holding `value`.
    pub fn remove(&mut self, value: &str) -> bool {
        for slot in 0..self.used.len() {
            if self.used[slot] && self.slot_str(slot) == value {
                self.used[slot] = false;
                self.lens[slot] = 0;
                self.count -= 1;
                return true;
            }
        }
        false
    }

    pub fn clear(&mut self) {
        self.used.fill(false);
        self.lens.fill(0);
        self.count = 0;
    }

    #[must_use]
    pub fn contains(&self, value: &str) -> bool {
        self.iter().any(|entry| entry == value)
    }

    /// The `index`-th occupied entry, in slot order.
    #[must_use]
    pub fn get(&self, index: u16) -> Option<&str> {
        self.iter().nth(index as usize)
    }

    /// Iterate occupied entries in slot order, skipping free slots.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        (0..self.used.len()).filter_map(move |slot| {
            if self.used[slot] {
                Some(self.slot_str(slot))
            } else {
                None
            }
        })
    }

    fn slot_str(&self, slot: usize) -> &str {
        let base = slot * self.entry_len;
        let len = self.lens[slot] as usize;
        // Slots are only ever written from &str, so this cannot fail.
        core::str::from_utf8(&self.pool[base..base + len]).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::{StringSet, StringSetConfig};

    fn set(max_entries: u16, max_entry_len: u16, allow_duplicates: bool) -> StringSet {
        StringSet::new(&StringSetConfig {
            max_entries,
            max_entry_len,
            allow_duplicates,
        })
    }

    #[test]
    fn add_and_iterate_in_insertion_order() {
        let mut cache = set(4, 64, false);
        assert!(cache.add("a/foo.lua"));
        assert!(cache.add("a/bar.lua"));
        let entries: Vec<&str> = cache.iter().collect();
        assert_eq!(entries, vec!["a/foo.lua", "a/bar.lua"]);
        assert_eq!(cache.get(1), Some("a/bar.lua"));
    }

    #[test]
    fn duplicates_follow_policy() {
        let mut unique = set(4, 16, false);
        assert!(unique.add("x"));
        assert!(!unique.add("x"));

        let mut multi = set(4, 16, true);
        assert!(multi.add("x"));
        assert!(multi.add("x"));
        assert_eq!(multi.len(), 2);
    }

    #[test]
    fn rejects_oversize_and_full() {
        let mut tiny = set(1, 4, false);
        assert!(!tiny.add("toolong"));
        assert!(tiny.add("ok"));
        assert!(!tiny.add("no"));
        assert!(tiny.is_full());
    }

    #[test]
    fn removal_frees_slot_for_reuse() {
        let mut cache = set(2, 16, false);
        assert!(cache.add("one"));
        assert!(cache.add("two"));
        assert!(cache.remove("one"));
        assert!(!cache.remove("one"));
        assert!(cache.add("three"));
        let entries: Vec<&str> = cache.iter().collect();
        assert_eq!(entries, vec!["three", "two"]);
    }

    #[test]
    fn clear_empties_everything() {
        let mut cache = set(2, 16, false);
        cache.add("one");
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.iter().count(), 0);
    }
}
