//! slicepipe - Double-buffered per-slice particle transport between
//! quasi-static pipeline stages

pub mod arena;
pub mod buffer;
pub mod codec;
pub mod config;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod directory;
pub mod error;
pub mod meta;
pub mod particles;
pub mod pipeline;
pub mod shm;
pub mod state;
pub mod storage;
pub mod topology;
pub mod transport;

pub use arena::{select_arena, Arena, DeviceArena, HostPinnedArena, MemoryDomain};
pub use buffer::SliceBuffer;
pub use codec::{round_up, PayloadCodec, DEFAULT_GRANULARITY, MAX_PAYLOAD_WORDS};
pub use config::PipelineConfig;
pub use directory::{SliceSlot, SlotDirectory};
pub use error::{Error, Result};
pub use meta::SliceMetadata;
pub use particles::{beam_idx, AttributeLayout, BeamStore, Injector, MultiBeam, ParticleSlice};
pub use pipeline::SlicePipeline;
pub use state::{CommProgress, SlotState};
pub use storage::DomainKind;
pub use topology::{StageLinks, StageRole, Tags, Topology};
pub use transport::{
    Completion, LocalFabric, LocalRequest, LocalTransport, Tag, TcpRequest, TcpTransport,
    Transport,
};
