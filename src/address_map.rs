//! Device-address side table
//!
//! Some resources (buffers, acceleration structures) are also reachable by a
//! device address range. The mapping from address back to identity changes
//! after the resource is published, so it lives beside the registry with its
//! own lock instead of inside a control block.
//!
//! The map stores identities, not handles: it never keeps an object alive.
//! Control blocks add their range in `populate` and remove it in `teardown`,
//! so a lookup that hits a range can take a reference with
//! `Handle::from_identity` and gets `NotFound` if the object is going away.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use smallvec::SmallVec;
use thiserror::Error;

use crate::identity::IdentityKey;

/// Rejected insertions.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMapError {
    #[error("empty address range at {base:#x}")]
    EmptyRange { base: u64 },

    #[error("address range {base:#x}+{size:#x} overflows the address space")]
    Overflow { base: u64, size: u64 },

    #[error("address range {base:#x}+{size:#x} overlaps the range at {existing:#x}")]
    Overlap { base: u64, size: u64, existing: u64 },
}

/// A resolved address: the owning identity and the offset into its range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressHit<I> {
    pub identity: I,
    pub base: u64,
    pub offset: u64,
}

/// Non-overlapping address ranges keyed by base address.
pub struct AddressMap<I: IdentityKey> {
    ranges: RwLock<BTreeMap<u64, (u64, I)>>,
}

impl<I: IdentityKey> Default for AddressMap<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: IdentityKey> AddressMap<I> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ranges: RwLock::new(BTreeMap::new()),
        }
    }

    /// Records `[base, base + size)` as belonging to `identity`.
    pub fn insert(&self, base: u64, size: u64, identity: I) -> Result<(), AddressMapError> {
        if size == 0 {
            return Err(AddressMapError::EmptyRange { base });
        }
        let end = base
            .checked_add(size)
            .ok_or(AddressMapError::Overflow { base, size })?;

        let mut ranges = self.ranges.write();
        // Closest range starting at or before `base`, then the first one after it.
        if let Some((&existing, &(existing_size, _))) = ranges.range(..=base).next_back() {
            if existing + existing_size > base {
                return Err(AddressMapError::Overlap { base, size, existing });
            }
        }
        if let Some((&existing, _)) = ranges.range(base..end).next() {
            return Err(AddressMapError::Overlap { base, size, existing });
        }

        ranges.insert(base, (size, identity));
        Ok(())
    }

    /// Finds the range containing `address`.
    pub fn resolve(&self, address: u64) -> Option<AddressHit<I>> {
        let ranges = self.ranges.read();
        let (&base, &(size, identity)) = ranges.range(..=address).next_back()?;
        let offset = address - base;
        (offset < size).then_some(AddressHit { identity, base, offset })
    }

    /// Removes the range starting at `base`.
    pub fn remove(&self, base: u64) -> Option<I> {
        self.ranges.write().remove(&base).map(|(_, identity)| identity)
    }

    /// Removes every range owned by `identity`, returning their bases.
    pub fn remove_identity(&self, identity: I) -> SmallVec<[u64; 2]> {
        let mut ranges = self.ranges.write();
        let bases: SmallVec<[u64; 2]> = ranges
            .iter()
            .filter(|(_, (_, owner))| *owner == identity)
            .map(|(&base, _)| base)
            .collect();
        for base in &bases {
            ranges.remove(base);
        }
        bases
    }

    /// `(base, size)` of every range owned by `identity`.
    pub fn ranges_of(&self, identity: I) -> SmallVec<[(u64, u64); 2]> {
        self.ranges
            .read()
            .iter()
            .filter(|(_, (_, owner))| *owner == identity)
            .map(|(&base, &(size, _))| (base, size))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ranges.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.read().is_empty()
    }
}
