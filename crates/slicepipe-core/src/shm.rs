//! Host-pinned memory segments
//!
//! Pinned buffers are anonymous POSIX shared memory mappings. The mapping is
//! page aligned, so it can be viewed as a slice of storage words, and it is
//! reachable by any transport, including ones that hand the memory to the
//! kernel or to another process.

use crate::{Error, Result};
use shared_memory::{Shmem, ShmemConf};

/// Size of one storage word in bytes
pub const WORD_BYTES: usize = std::mem::size_of::<u64>();

/// One mapped segment, unlinked when dropped
pub struct SharedMemory {
    inner: Shmem,
    words: usize,
}

impl SharedMemory {
    /// Map a fresh zero-filled segment holding `words` storage words
    pub fn create(words: usize) -> Result<Self> {
        if words == 0 {
            return Err(Error::SharedMemory("zero-sized segment".to_string()));
        }
        let shmem = ShmemConf::new()
            .size(words * WORD_BYTES)
            .create()
            .map_err(|e| Error::SharedMemory(e.to_string()))?;

        Ok(Self {
            inner: shmem,
            words,
        })
    }

    /// Get the size in storage words
    pub fn words(&self) -> usize {
        self.words
    }

    /// Get a word slice view of the segment
    pub fn as_words(&self) -> &[u64] {
        // mappings are page aligned and at least `words * 8` bytes long
        unsafe { std::slice::from_raw_parts(self.inner.as_ptr() as *const u64, self.words) }
    }

    /// Get a mutable word slice view of the segment
    pub fn as_words_mut(&mut self) -> &mut [u64] {
        unsafe { std::slice::from_raw_parts_mut(self.inner.as_ptr() as *mut u64, self.words) }
    }
}

// Safety: the segment is owned by exactly one SharedMemory and only reached
// through &self / &mut self.
unsafe impl Send for SharedMemory {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_zero_rejected() {
        assert!(SharedMemory::create(0).is_err());
    }

    #[test]
    fn test_create_write_read() {
        let mut shm = SharedMemory::create(16).unwrap();
        assert_eq!(shm.words(), 16);
        assert!(shm.as_words().iter().all(|&w| w == 0));
        shm.as_words_mut()[3] = 42;
        assert_eq!(shm.as_words()[3], 42);
    }
}
