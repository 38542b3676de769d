//! Memory arena selection for transport buffers
//!
//! A pipeline picks one [`DomainKind`] for the whole run. Every transport
//! buffer is then allocated from the matching [`MemoryDomain`] immediately
//! before it is needed and freed as soon as its transfer is finished.

use crate::buffer::SliceBuffer;
#[cfg(feature = "cuda")]
use crate::cuda::CudaBuffer;
use crate::shm::SharedMemory;
use crate::storage::DomainKind;
use crate::Result;
#[cfg(feature = "cuda")]
use cudarc::driver::CudaDevice;
#[cfg(feature = "cuda")]
use std::sync::Arc;

/// A memory domain able to hold transport buffers
pub trait MemoryDomain: Send {
    /// Domain this arena allocates in
    fn kind(&self) -> DomainKind;

    /// Allocate a zero-filled buffer of `words` storage words
    fn allocate(&self, words: usize) -> Result<SliceBuffer>;

    /// Release a buffer obtained from [`MemoryDomain::allocate`]
    fn free(&self, buffer: SliceBuffer) {
        drop(buffer);
    }

    /// Copy host words into `buffer` at `offset`
    fn copy_to(&self, buffer: &mut SliceBuffer, offset: usize, src: &[u64]) -> Result<()> {
        buffer.write_words(offset, src)
    }

    /// Copy words of `buffer` at `offset` out to the host
    fn copy_from(&self, buffer: &SliceBuffer, offset: usize, dst: &mut [u64]) -> Result<()> {
        buffer.read_words(offset, dst)
    }

    /// Wait until every copy issued on `buffer` has landed
    fn synchronize(&self, buffer: &SliceBuffer) -> Result<()> {
        buffer.synchronize()
    }
}

/// Page-aligned host segments
#[derive(Debug, Default, Clone, Copy)]
pub struct HostPinnedArena;

impl MemoryDomain for HostPinnedArena {
    fn kind(&self) -> DomainKind {
        DomainKind::HostPinned
    }

    fn allocate(&self, words: usize) -> Result<SliceBuffer> {
        Ok(SliceBuffer::Pinned(SharedMemory::create(words)?))
    }
}

/// Device-resident buffers
pub struct DeviceArena {
    #[cfg(feature = "cuda")]
    device: Arc<CudaDevice>,
}

impl DeviceArena {
    #[cfg(feature = "cuda")]
    pub fn new(device_id: usize) -> Result<Self> {
        Ok(Self {
            device: CudaBuffer::open_device(device_id)?,
        })
    }

    #[cfg(not(feature = "cuda"))]
    pub fn new(_device_id: usize) -> Result<Self> {
        Ok(Self {})
    }
}

impl MemoryDomain for DeviceArena {
    fn kind(&self) -> DomainKind {
        DomainKind::Device
    }

    #[cfg(feature = "cuda")]
    fn allocate(&self, words: usize) -> Result<SliceBuffer> {
        Ok(SliceBuffer::Device(CudaBuffer::alloc(&self.device, words)?))
    }

    #[cfg(not(feature = "cuda"))]
    fn allocate(&self, words: usize) -> Result<SliceBuffer> {
        Ok(SliceBuffer::Device(vec![0u64; words].into_boxed_slice()))
    }
}

/// Pick the arena of the run
pub fn select_arena(kind: DomainKind) -> Result<Arena> {
    Arena::select(kind)
}

/// The run-wide arena with allocation bookkeeping
pub struct Arena {
    domain: Box<dyn MemoryDomain>,
    live: usize,
    allocations: u64,
}

impl Arena {
    /// Select the arena for `kind`; device arenas use device 0
    pub fn select(kind: DomainKind) -> Result<Self> {
        let domain: Box<dyn MemoryDomain> = match kind {
            DomainKind::HostPinned => Box::new(HostPinnedArena),
            DomainKind::Device => Box::new(DeviceArena::new(0)?),
        };
        Ok(Self::from_domain(domain))
    }

    /// Wrap a custom domain
    pub fn from_domain(domain: Box<dyn MemoryDomain>) -> Self {
        Self {
            domain,
            live: 0,
            allocations: 0,
        }
    }

    /// Get the domain kind
    pub fn kind(&self) -> DomainKind {
        self.domain.kind()
    }

    /// Allocate a buffer
    pub fn allocate(&mut self, words: usize) -> Result<SliceBuffer> {
        let buffer = self.domain.allocate(words)?;
        self.live += 1;
        self.allocations += 1;
        Ok(buffer)
    }

    /// Free a buffer
    pub fn free(&mut self, buffer: SliceBuffer) {
        self.live = self.live.saturating_sub(1);
        self.domain.free(buffer);
    }

    /// Borrow the underlying domain for copies
    pub fn domain(&self) -> &dyn MemoryDomain {
        self.domain.as_ref()
    }

    /// Number of buffers currently allocated and not yet freed
    pub fn live(&self) -> usize {
        self.live
    }

    /// Number of allocations over the arena's lifetime
    pub fn allocations(&self) -> u64 {
        self.allocations
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("kind", &self.kind())
            .field("live", &self.live)
            .field("allocations", &self.allocations)
            .finish()
    }
}
