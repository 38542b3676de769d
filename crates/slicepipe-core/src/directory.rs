//! Slice buffer directory
//!
//! One [`SliceSlot`] per slice of the simulation box, indexed by slice. A
//! slot owns the slice's metadata, at most one transport buffer and the
//! transport requests in flight for each sub-channel.

use crate::arena::Arena;
use crate::buffer::SliceBuffer;
use crate::meta::SliceMetadata;
use crate::state::SlotState;
use crate::{Error, Result};

/// Transfer bookkeeping of one slice
pub struct SliceSlot<R> {
    pub(crate) state: SlotState,
    pub(crate) meta: SliceMetadata,
    pub(crate) buffer: Option<SliceBuffer>,
    /// Data send or receive in flight
    pub(crate) request: Option<R>,
    /// Metadata send or receive in flight
    pub(crate) metadata_request: Option<R>,
}

impl<R> SliceSlot<R> {
    fn new(num_species: usize, state: SlotState) -> Self {
        Self {
            state,
            meta: SliceMetadata::new(num_species),
            buffer: None,
            request: None,
            metadata_request: None,
        }
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn meta(&self) -> &SliceMetadata {
        &self.meta
    }

    /// Size of the held transport buffer, if any
    pub fn buffer_words(&self) -> Option<usize> {
        self.buffer.as_ref().map(SliceBuffer::words)
    }

    /// Allocate the slot's transport buffer from `arena`
    pub(crate) fn allocate_buffer(
        &mut self,
        slice: usize,
        arena: &mut Arena,
        words: usize,
    ) -> Result<()> {
        if self.buffer.is_some() {
            return Err(Error::invariant(slice, "transport buffer already held"));
        }
        self.buffer = Some(arena.allocate(words)?);
        Ok(())
    }

    /// Return the slot's transport buffer to `arena`, if it holds one
    pub(crate) fn free_buffer(&mut self, arena: &mut Arena) {
        if let Some(buffer) = self.buffer.take() {
            arena.free(buffer);
        }
    }
}

/// All slots of one stage
pub struct SlotDirectory<R> {
    slots: Vec<SliceSlot<R>>,
}

impl<R> SlotDirectory<R> {
    pub fn new(total_slices: usize, num_species: usize, initial: SlotState) -> Self {
        Self {
            slots: (0..total_slices)
                .map(|_| SliceSlot::new(num_species, initial))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, slice: usize) -> Result<&SliceSlot<R>> {
        let total = self.slots.len();
        self.slots.get(slice).ok_or(Error::SliceOutOfRange {
            index: slice,
            total,
        })
    }

    pub fn get_mut(&mut self, slice: usize) -> Result<&mut SliceSlot<R>> {
        let total = self.slots.len();
        self.slots.get_mut(slice).ok_or(Error::SliceOutOfRange {
            index: slice,
            total,
        })
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut SliceSlot<R>> {
        self.slots.iter_mut()
    }
}

#[cfg(all(test, not(feature = "cuda")))]
mod tests {
    use super::*;
    use crate::state::CommProgress;
    use crate::storage::DomainKind;

    #[test]
    fn test_lookup() {
        let dir: SlotDirectory<()> = SlotDirectory::new(3, 2, SlotState::both(CommProgress::Sent));
        assert_eq!(dir.len(), 3);
        assert_eq!(dir.get(2).unwrap().state().data, CommProgress::Sent);
        assert_eq!(dir.get(0).unwrap().meta().num_species(), 2);
        assert!(matches!(
            dir.get(3),
            Err(Error::SliceOutOfRange { index: 3, total: 3 })
        ));
    }

    #[test]
    fn test_single_buffer_per_slot() {
        let mut arena = Arena::select(DomainKind::Device).unwrap();
        let mut dir: SlotDirectory<()> =
            SlotDirectory::new(1, 1, SlotState::both(CommProgress::InUse));
        let slot = dir.get_mut(0).unwrap();
        slot.allocate_buffer(0, &mut arena, 16).unwrap();
        assert_eq!(slot.buffer_words(), Some(16));
        assert!(matches!(
            slot.allocate_buffer(0, &mut arena, 8),
            Err(Error::Invariant { slice: 0, .. })
        ));
        slot.free_buffer(&mut arena);
        slot.free_buffer(&mut arena);
        assert_eq!(slot.buffer_words(), None);
        assert_eq!(arena.live(), 0);
    }
}
