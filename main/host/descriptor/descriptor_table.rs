use std::collections::{BTreeSet, HashMap};

use log::*;

use crate::host::descriptor::Descriptor;

/// Map of file handles to file descriptors. Typically owned by a Process.
pub struct DescriptorTable {
    descriptors: HashMap<u32, Descriptor>,

    // Indices less than `next_index` known to be available.
    available_indices: BTreeSet<u32>,

    // Lowest index not in `available_indices` that *might* be available. We
    // still need to verify availability in `descriptors`, though.
    next_index: u32,
}

impl DescriptorTable {
    pub fn new() -> Self {
        DescriptorTable {
            descriptors: HashMap::new(),
            available_indices: BTreeSet::new(),
            next_index: 0,
        }
    }

    /// Add the descriptor at an unused index, and return the index. The index
    /// will be the lowest unused index at least `min_index`.
    pub fn add(&mut self, descriptor: Descriptor, min_index: u32) -> u32 {
        let idx = if let Some(idx) = self.available_indices.range(min_index..).next() {
            // Un-borrow from `available_indices`.
            let idx = *idx;
            trace!("Reusing available index {}", idx);
            self.available_indices.remove(&idx);
            idx
        } else {
            // Start our search at either the next likely available index or
            // the minimum index, whichever is larger.
            let mut idx = std::cmp::max(self.next_index, min_index);

            // Only update next_index if we started at it, otherwise there may
            // be other available indexes lower than idx.
            let should_update_next_index = idx == self.next_index;

            // Skip past any indexes that are in use. This can happen after
            // calling `set` with a value greater than `next_index`.
            while self.descriptors.contains_key(&idx) {
                trace!("Skipping past in-use index {}", idx);
                idx += 1;
            }

            if should_update_next_index {
                self.next_index = idx + 1;
            }

            trace!("Using index {}", idx);
            idx
        };

        let prev = self.descriptors.insert(idx, descriptor);
        debug_assert!(prev.is_none(), "Already a descriptor at {}", idx);

        idx
    }

    // Call after inserting to `available_indices`, to free any that are
    // contiguous with `next_index`.
    fn trim_tail(&mut self) {
        while let Some(last_in_available) = self.available_indices.iter().next_back().copied() {
            if (last_in_available + 1) == self.next_index {
                // Last entry in available_indices is adjacent to next_index.
                // We can merge them, freeing an entry in `available_indices`.
                self.next_index -= 1;
                self.available_indices.remove(&last_in_available);
            } else {
                break;
            }
        }
    }

    /// Remove the descriptor at the given index and return it.
    pub fn remove(&mut self, idx: u32) -> Option<Descriptor> {
        let maybe_descriptor = self.descriptors.remove(&idx);
        self.available_indices.insert(idx);
        self.trim_tail();
        maybe_descriptor
    }

    /// Get the descriptor at `idx`, if any.
    pub fn get(&self, idx: u32) -> Option<&Descriptor> {
        self.descriptors.get(&idx)
    }

    /// Get the descriptor at `idx`, if any.
    pub fn get_mut(&mut self, idx: u32) -> Option<&mut Descriptor> {
        self.descriptors.get_mut(&idx)
    }

    /// Insert a descriptor at `index`. If a descriptor is already present at
    /// that index, it is unregistered from that index and returned.
    pub fn set(&mut self, index: u32, descriptor: Descriptor) -> Option<Descriptor> {
        // We ensure the index is no longer in `self.available_indices`. We
        // *don't* ensure `self.next_index` is > `index`, since that'd require
        // adding the indices in between to `self.available_indices`.
        self.available_indices.remove(&index);

        if let Some(prev) = self.descriptors.insert(index, descriptor) {
            trace!("Overwriting index {}", index);
            Some(prev)
        } else {
            trace!("Setting to unused index {}", index);
            None
        }
    }

    /// Remove and return all descriptors.
    pub fn remove_all(&mut self) -> impl Iterator<Item = Descriptor> {
        // reset the descriptor table
        let old_self = std::mem::replace(self, Self::new());
        // return the old descriptors
        old_self.descriptors.into_values()
    }

    /// Iterate over the `(fd, descriptor)` pairs in the table.
    pub fn iter(&self) -> impl Iterator<Item = (&u32, &Descriptor)> {
        self.descriptors.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::descriptor::eventfd::EventFd;
    use crate::host::descriptor::{File, FileStatus, OpenFile};

    fn descriptor() -> Descriptor {
        let file = EventFd::new(0, false, FileStatus::empty());
        Descriptor::new(OpenFile::new(File::EventFd(file)))
    }

    #[test]
    fn test_lowest_unused_allocation() {
        let mut table = DescriptorTable::new();

        assert_eq!(table.add(descriptor(), 0), 0);
        assert_eq!(table.add(descriptor(), 0), 1);
        assert_eq!(table.add(descriptor(), 0), 2);

        // removing an index makes it the next one allocated
        table.remove(1).unwrap();
        assert_eq!(table.add(descriptor(), 0), 1);

        // allocation respects the minimum index
        assert_eq!(table.add(descriptor(), 10), 10);

        // and freed indices below the minimum stay available
        table.remove(0).unwrap();
        assert_eq!(table.add(descriptor(), 0), 0);
    }

    #[test]
    fn test_set_and_recycle() {
        let mut table = DescriptorTable::new();

        assert_eq!(table.add(descriptor(), 0), 0);

        // dup2-style set at an arbitrary index
        assert!(table.set(7, descriptor()).is_none());
        assert!(table.get(7).is_some());

        // setting over an existing descriptor returns the old one
        assert!(table.set(7, descriptor()).is_some());

        // allocation skips past in-use indices
        assert_eq!(table.add(descriptor(), 7), 8);
    }
}
