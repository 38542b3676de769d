//! Transport buffer storage

#[cfg(feature = "cuda")]
use crate::cuda::CudaBuffer;
use crate::shm::SharedMemory;
use crate::storage::DomainKind;
use crate::{Error, Result};
use std::borrow::Cow;

/// One slice's transport buffer, in whichever domain its arena allocated it
pub enum SliceBuffer {
    Pinned(SharedMemory),
    #[cfg(feature = "cuda")]
    Device(CudaBuffer),
    /// Without CUDA the device arena aliases host memory
    #[cfg(not(feature = "cuda"))]
    Device(Box<[u64]>),
}

impl SliceBuffer {
    /// Get the domain of the storage
    pub fn kind(&self) -> DomainKind {
        match self {
            SliceBuffer::Pinned(_) => DomainKind::HostPinned,
            SliceBuffer::Device(_) => DomainKind::Device,
        }
    }

    /// Get size in storage words
    pub fn words(&self) -> usize {
        match self {
            SliceBuffer::Pinned(shm) => shm.words(),
            #[cfg(feature = "cuda")]
            SliceBuffer::Device(buf) => buf.words(),
            #[cfg(not(feature = "cuda"))]
            SliceBuffer::Device(buf) => buf.len(),
        }
    }

    /// Get a host view of the whole buffer, staging device memory if needed
    pub fn to_host(&self) -> Result<Cow<'_, [u64]>> {
        match self {
            SliceBuffer::Pinned(shm) => Ok(Cow::Borrowed(shm.as_words())),
            #[cfg(feature = "cuda")]
            SliceBuffer::Device(buf) => Ok(Cow::Owned(buf.to_host()?)),
            #[cfg(not(feature = "cuda"))]
            SliceBuffer::Device(buf) => Ok(Cow::Borrowed(&buf[..])),
        }
    }

    /// Copy `src` into the buffer at word `offset`
    pub fn write_words(&mut self, offset: usize, src: &[u64]) -> Result<()> {
        self.check_bounds(offset, src.len())?;
        match self {
            SliceBuffer::Pinned(shm) => {
                shm.as_words_mut()[offset..offset + src.len()].copy_from_slice(src);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            SliceBuffer::Device(buf) => buf.copy_in(offset, src),
            #[cfg(not(feature = "cuda"))]
            SliceBuffer::Device(buf) => {
                buf[offset..offset + src.len()].copy_from_slice(src);
                Ok(())
            }
        }
    }

    /// Copy words at `offset` out into `dst`
    pub fn read_words(&self, offset: usize, dst: &mut [u64]) -> Result<()> {
        self.check_bounds(offset, dst.len())?;
        match self {
            SliceBuffer::Pinned(shm) => {
                dst.copy_from_slice(&shm.as_words()[offset..offset + dst.len()]);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            SliceBuffer::Device(buf) => buf.copy_out(offset, dst),
            #[cfg(not(feature = "cuda"))]
            SliceBuffer::Device(buf) => {
                dst.copy_from_slice(&buf[offset..offset + dst.len()]);
                Ok(())
            }
        }
    }

    /// Wait for outstanding copies into or out of the buffer
    pub fn synchronize(&self) -> Result<()> {
        match self {
            #[cfg(feature = "cuda")]
            SliceBuffer::Device(buf) => buf.synchronize(),
            _ => Ok(()),
        }
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<()> {
        let words = self.words();
        if offset.checked_add(len).map_or(true, |end| end > words) {
            return Err(Error::OutOfBounds { offset, len, words });
        }
        Ok(())
    }
}

impl std::fmt::Debug for SliceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SliceBuffer")
            .field("kind", &self.kind())
            .field("words", &self.words())
            .finish()
    }
}

#[cfg(all(test, not(feature = "cuda")))]
mod tests {
    use super::*;

    #[test]
    fn test_device_fallback_write_read() {
        let mut buf = SliceBuffer::Device(vec![0u64; 8].into_boxed_slice());
        buf.write_words(2, &[7, 8, 9]).unwrap();
        let mut out = [0u64; 3];
        buf.read_words(2, &mut out).unwrap();
        assert_eq!(out, [7, 8, 9]);
        let mut last = [0u64; 1];
        buf.read_words(4, &mut last).unwrap();
        assert_eq!(last, [9]);
    }

    #[test]
    fn test_out_of_bounds() {
        let mut buf = SliceBuffer::Device(vec![0u64; 4].into_boxed_slice());
        let err = buf.write_words(3, &[1, 2]).unwrap_err();
        assert!(matches!(err, Error::OutOfBounds { offset: 3, len: 2, words: 4 }));
    }
}
