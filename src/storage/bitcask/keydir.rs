use crate::error::{Error, Result};
use crate::region::Region;

use super::files::FileId;

/// The on-disk location of a key's most recent record. `val_offset` is the
/// byte offset of the record's header start within `file`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyDirEntry {
    pub file: FileId,
    pub val_len: u64,
    pub val_offset: u64,
    pub timestamp: i64,
}

/// An open-addressed hash table mapping keys to the location of their latest
/// record, probing linearly from the FNV-1a hash of the key.
///
/// Slots are three-state: vacated slots are treated as occupied while probing
/// for a match (so deletion never severs a probe chain) and as reusable while
/// probing for an insertion. When occupancy passes 0.7 of capacity the table
/// doubles and rehashes its live slots. Key bytes are interned in the region
/// on first insertion and reused for the table's whole lifetime.
pub struct KeyDir<'r> {
    region: &'r Region,
    slots: Vec<Slot<'r>>,
    live: usize,
    vacated: usize,
}

#[derive(Clone, Copy)]
enum Slot<'r> {
    Empty,
    Live { key: &'r [u8], entry: KeyDirEntry },
    Vacated,
}

enum Placement {
    Overwrite(usize),
    Place(usize),
}

impl<'r> KeyDir<'r> {
    /// Creates a table with the given capacity, which must be a nonzero
    /// power of two.
    pub fn with_capacity(region: &'r Region, capacity: usize) -> Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(Error::InvalidSize);
        }
        Ok(Self { region, slots: vec![Slot::Empty; capacity], live: 0, vacated: 0 })
    }

    /// Inserts or overwrites the entry for a key. Overwrites happen in place
    /// and reuse the interned key.
    pub fn insert(&mut self, key: &[u8], entry: KeyDirEntry) -> Result<()> {
        if (self.live + self.vacated + 1) * 10 > self.slots.len() * 7 {
            self.grow()?;
        }
        match self.probe_for_insert(key) {
            Some(Placement::Overwrite(i)) => {
                if let Slot::Live { entry: slot_entry, .. } = &mut self.slots[i] {
                    *slot_entry = entry;
                }
                Ok(())
            }
            Some(Placement::Place(i)) => {
                let key = self.region.copy_bytes(key)?;
                if matches!(self.slots[i], Slot::Vacated) {
                    self.vacated -= 1;
                }
                self.slots[i] = Slot::Live { key, entry };
                self.live += 1;
                Ok(())
            }
            None => Err(Error::InsertFailed),
        }
    }

    /// Looks up the entry for a key.
    pub fn get(&self, key: &[u8]) -> Option<&KeyDirEntry> {
        let i = self.find(key)?;
        match &self.slots[i] {
            Slot::Live { entry, .. } => Some(entry),
            _ => None,
        }
    }

    /// Removes a key, vacating its slot. Returns whether it was present.
    pub fn delete(&mut self, key: &[u8]) -> bool {
        match self.find(key) {
            Some(i) => {
                self.slots[i] = Slot::Vacated;
                self.live -= 1;
                self.vacated += 1;
                true
            }
            None => false,
        }
    }

    /// Rewrites every entry pointing at `from` to point at `to`. Used when a
    /// merge renames or supersedes a file.
    pub fn repoint(&mut self, from: FileId, to: FileId) {
        for slot in &mut self.slots {
            if let Slot::Live { entry, .. } = slot {
                if entry.file == from {
                    entry.file = to;
                }
            }
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Probes for a key, stopping at the first empty slot. Keys compare by
    /// length, then bytes.
    fn find(&self, key: &[u8]) -> Option<usize> {
        let mask = self.slots.len() - 1;
        let mut i = (Self::hash(key) as usize) & mask;
        for _ in 0..self.slots.len() {
            match &self.slots[i] {
                Slot::Empty => return None,
                Slot::Live { key: slot_key, .. } if *slot_key == key => return Some(i),
                _ => {}
            }
            i = (i + 1) & mask;
        }
        None
    }

    /// Probes for the slot an insertion should land in: the matching live
    /// slot, else the first vacated slot passed, else the empty slot that
    /// ended the probe.
    fn probe_for_insert(&self, key: &[u8]) -> Option<Placement> {
        let mask = self.slots.len() - 1;
        let mut i = (Self::hash(key) as usize) & mask;
        let mut vacated_at = None;
        for _ in 0..self.slots.len() {
            match &self.slots[i] {
                Slot::Empty => return Some(Placement::Place(vacated_at.unwrap_or(i))),
                Slot::Live { key: slot_key, .. } if *slot_key == key => {
                    return Some(Placement::Overwrite(i));
                }
                Slot::Vacated if vacated_at.is_none() => vacated_at = Some(i),
                _ => {}
            }
            i = (i + 1) & mask;
        }
        vacated_at.map(Placement::Place)
    }

    fn grow(&mut self) -> Result<()> {
        let capacity = self.slots.len().checked_mul(2).ok_or(Error::ArithmeticOverflow)?;
        let mask = capacity - 1;
        let old = std::mem::replace(&mut self.slots, vec![Slot::Empty; capacity]);
        self.vacated = 0;
        for slot in old {
            if let Slot::Live { key, entry } = slot {
                let mut i = (Self::hash(key) as usize) & mask;
                while !matches!(self.slots[i], Slot::Empty) {
                    i = (i + 1) & mask;
                }
                self.slots[i] = Slot::Live { key, entry };
            }
        }
        Ok(())
    }

    /// FNV-1a over the key bytes.
    fn hash(key: &[u8]) -> u64 {
        let mut hash = 0xCBF2_9CE4_8422_2325u64;
        for &byte in key {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x0000_0100_0000_01B3);
        }
        hash
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn entry(n: u32) -> KeyDirEntry {
        KeyDirEntry { file: FileId::Data(n), val_len: 3, val_offset: 7, timestamp: 1 }
    }

    #[test_case(0 => false; "zero")]
    #[test_case(1 => true; "one")]
    #[test_case(3 => false; "three")]
    #[test_case(12 => false; "twelve")]
    #[test_case(4096 => true; "default capacity")]
    fn capacity_must_be_a_nonzero_power_of_two(capacity: usize) -> bool {
        let region = Region::with_capacity(1024);
        KeyDir::with_capacity(&region, capacity).is_ok()
    }

    #[test]
    fn insert_get_overwrite() {
        let region = Region::with_capacity(1024);
        let mut keydir = KeyDir::with_capacity(&region, 16).unwrap();
        assert!(keydir.get(b"k").is_none());
        keydir.insert(b"k", entry(1)).unwrap();
        assert_eq!(keydir.get(b"k"), Some(&entry(1)));
        assert_eq!(keydir.len(), 1);
        keydir.insert(b"k", entry(2)).unwrap();
        assert_eq!(keydir.get(b"k"), Some(&entry(2)));
        assert_eq!(keydir.len(), 1);
    }

    #[test]
    fn delete_vacates_without_breaking_probe_chains() {
        let region = Region::with_capacity(1024);
        let mut keydir = KeyDir::with_capacity(&region, 4).unwrap();

        // Two single-byte keys that collide under the table mask.
        let mut colliding = None;
        'outer: for a in 0u8..=255 {
            for b in 0u8..a {
                if KeyDir::hash(&[a]) & 3 == KeyDir::hash(&[b]) & 3 {
                    colliding = Some(([a], [b]));
                    break 'outer;
                }
            }
        }
        let (first, second) = colliding.unwrap();

        keydir.insert(&first, entry(1)).unwrap();
        keydir.insert(&second, entry(2)).unwrap();
        assert!(keydir.delete(&first));
        // The second key sits past the vacated slot and must stay reachable.
        assert_eq!(keydir.get(&second), Some(&entry(2)));
        assert!(keydir.get(&first).is_none());
        assert!(!keydir.delete(&first));

        // Reinsertion reuses the vacated slot rather than extending the chain.
        keydir.insert(&first, entry(3)).unwrap();
        assert_eq!(keydir.get(&first), Some(&entry(3)));
        assert_eq!(keydir.len(), 2);
        assert_eq!(keydir.capacity(), 4);
    }

    #[test]
    fn grows_past_the_load_factor() {
        let region = Region::with_capacity(4096);
        let mut keydir = KeyDir::with_capacity(&region, 4).unwrap();
        for i in 0u32..32 {
            keydir.insert(&i.to_le_bytes(), entry(i)).unwrap();
        }
        assert_eq!(keydir.len(), 32);
        assert!(keydir.capacity() >= 64);
        for i in 0u32..32 {
            assert_eq!(keydir.get(&i.to_le_bytes()), Some(&entry(i)));
        }
    }

    #[test]
    fn repoint_rewrites_matching_entries() {
        let region = Region::with_capacity(1024);
        let mut keydir = KeyDir::with_capacity(&region, 16).unwrap();
        keydir.insert(b"a", entry(1)).unwrap();
        keydir.insert(b"b", entry(2)).unwrap();
        keydir.repoint(FileId::Data(1), FileId::Merged(9));
        assert_eq!(keydir.get(b"a").unwrap().file, FileId::Merged(9));
        assert_eq!(keydir.get(b"b").unwrap().file, FileId::Data(2));
    }

    #[test]
    fn region_exhaustion_surfaces_as_out_of_memory() {
        let region = Region::with_capacity(4);
        let mut keydir = KeyDir::with_capacity(&region, 16).unwrap();
        keydir.insert(b"ab", entry(1)).unwrap();
        assert!(matches!(keydir.insert(b"cdef", entry(2)), Err(Error::OutOfMemory)));
        // The failed insert must not corrupt the table.
        assert_eq!(keydir.get(b"ab"), Some(&entry(1)));
        assert_eq!(keydir.len(), 1);
    }
}
