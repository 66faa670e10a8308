//! Bitmap data structure helper.

use std::fmt;

use fixedbitset::FixedBitSet;

use serde::{Deserialize, Serialize};

/// Compact bitmap for replica ID -> bool mapping. Grows on demand since
/// membership may introduce IDs beyond the initial group size.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Bitmap(FixedBitSet);

impl Bitmap {
    /// Creates an empty bitmap with room for `size` IDs.
    pub fn new(size: u8) -> Self {
        Bitmap(FixedBitSet::with_capacity(size as usize))
    }

    /// Creates a bitmap with the given IDs set.
    pub fn from_ids(ids: impl IntoIterator<Item = u8>) -> Self {
        let mut bitmap = Self::default();
        for id in ids {
            bitmap.insert(id);
        }
        bitmap
    }

    /// Sets the bit for `id`, returning true if it was not set before.
    #[inline]
    pub fn insert(&mut self, id: u8) -> bool {
        let idx = id as usize;
        if idx >= self.0.len() {
            self.0.grow(idx + 1);
        }
        !self.0.put(idx)
    }

    /// Clears the bit for `id`.
    #[inline]
    pub fn remove(&mut self, id: u8) {
        if (id as usize) < self.0.len() {
            self.0.set(id as usize, false);
        }
    }

    #[inline]
    pub fn contains(&self, id: u8) -> bool {
        self.0.contains(id as usize)
    }

    /// Returns the number of set bits.
    #[inline]
    pub fn count(&self) -> u8 {
        self.0.count_ones(..) as u8
    }

    /// Counts the set bits that belong to `members`.
    pub fn count_within(&self, members: &[u8]) -> u8 {
        members.iter().filter(|&&id| self.contains(id)).count() as u8
    }

    /// Clears all bits.
    #[inline]
    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Iterates over the set IDs in increasing order.
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        self.0.ones().map(|idx| idx as u8)
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
