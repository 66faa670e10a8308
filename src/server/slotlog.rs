//! In-memory window of a group's log instances, addressed by slot number.

use std::collections::VecDeque;

use crate::utils::GuidStoreError;

/// What the log needs to know about its entries.
pub trait LogSlot {
    /// An empty placeholder entry for a slot nothing is known about.
    fn null() -> Self;

    /// Whether a value has been decided for this slot.
    fn is_decided(&self) -> bool;

    /// Takes over whatever `prev`, the entry being replaced at the same
    /// slot, tracked about the slot itself rather than its value.
    fn carry_over(&mut self, _prev: &Self) {}
}

/// Window of instances covering slots `[start_slot, end_slot)`. Slots below
/// `start_slot` have been compacted into a checkpoint.
#[derive(Debug, Clone)]
pub struct SlotLog<T> {
    start_slot: usize,
    insts: VecDeque<T>,
}

impl<T: LogSlot> SlotLog<T> {
    /// Creates an empty log starting at `start_slot`.
    pub fn new(start_slot: usize) -> Self {
        SlotLog {
            start_slot,
            insts: VecDeque::new(),
        }
    }

    /// First slot still held in memory.
    #[inline]
    pub fn start_slot(&self) -> usize {
        self.start_slot
    }

    /// One past the last slot held in memory.
    #[inline]
    pub fn end_slot(&self) -> usize {
        self.start_slot + self.insts.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    /// Instance at `slot`, if held.
    pub fn get(&self, slot: usize) -> Option<&T> {
        if slot < self.start_slot {
            return None;
        }
        self.insts.get(slot - self.start_slot)
    }

    /// Mutable instance at `slot`, if held.
    pub fn get_mut(&mut self, slot: usize) -> Option<&mut T> {
        if slot < self.start_slot {
            return None;
        }
        self.insts.get_mut(slot - self.start_slot)
    }

    /// Mutable instance at `slot`, filling null instances up to it if the
    /// log does not reach that far yet. Compacted slots cannot be located.
    pub fn locate(&mut self, slot: usize) -> Result<&mut T, GuidStoreError> {
        if slot < self.start_slot {
            return Err(GuidStoreError::msg(format!(
                "slot {} already compacted (start {})",
                slot, self.start_slot
            )));
        }
        while self.end_slot() <= slot {
            self.insts.push_back(T::null());
        }
        self.insts
            .get_mut(slot - self.start_slot)
            .ok_or_else(|| GuidStoreError::msg("slot locate failed"))
    }

    /// Places `entry` at `slot`, filling null instances up to it. Decided
    /// slots are never overwritten.
    pub fn append(
        &mut self,
        slot: usize,
        mut entry: T,
    ) -> Result<&mut T, GuidStoreError> {
        let inst = self.locate(slot)?;
        if inst.is_decided() {
            return Err(GuidStoreError::msg(format!(
                "slot {} already decided",
                slot
            )));
        }
        entry.carry_over(inst);
        *inst = entry;
        Ok(inst)
    }

    /// Discards every instance up to and including `through_slot`. The log
    /// may jump forward past its current end.
    pub fn truncate(&mut self, through_slot: usize) {
        let new_start = through_slot + 1;
        if new_start <= self.start_slot {
            return;
        }
        let drop_cnt = (new_start - self.start_slot).min(self.insts.len());
        self.insts.drain(..drop_cnt);
        self.start_slot = new_start;
    }

    /// Discards every instance at `from_slot` and beyond.
    pub fn truncate_tail(&mut self, from_slot: usize) {
        if from_slot < self.start_slot {
            self.insts.clear();
        } else if from_slot < self.end_slot() {
            self.insts.truncate(from_slot - self.start_slot);
        }
    }

    /// Iterates `(slot, instance)` pairs from `from_slot` onwards.
    pub fn iter_from(
        &self,
        from_slot: usize,
    ) -> impl Iterator<Item = (usize, &T)> + '_ {
        let skip = from_slot.saturating_sub(self.start_slot);
        let start = self.start_slot;
        self.insts
            .iter()
            .enumerate()
            .skip(skip)
            .map(move |(idx, inst)| (start + idx, inst))
    }

    /// Mutable version of `iter_from`.
    pub fn iter_mut_from(
        &mut self,
        from_slot: usize,
    ) -> impl Iterator<Item = (usize, &mut T)> + '_ {
        let skip = from_slot.saturating_sub(self.start_slot);
        let start = self.start_slot;
        self.insts
            .iter_mut()
            .enumerate()
            .skip(skip)
            .map(move |(idx, inst)| (start + idx, inst))
    }
}
