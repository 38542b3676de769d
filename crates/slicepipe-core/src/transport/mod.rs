//! Non-blocking point-to-point transport between stages
//!
//! The pipeline only needs tagged, ordered messages of storage words with
//! non-blocking send/receive, completion testing, blocking completion and
//! cancellation. Messages between a pair of stages are matched by
//! `(source, tag)` in the order they were sent.

pub mod local;
mod matcher;
pub mod tcp;

pub use local::{LocalFabric, LocalRequest, LocalTransport};
pub use tcp::{TcpRequest, TcpTransport};

use crate::Result;

/// Message tag
pub type Tag = u32;

/// Outcome of a finished request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Sent,
    Received(Vec<u64>),
}

/// Tagged non-blocking message transport
///
/// A request is finished once [`Transport::test`] returned `Some` or
/// [`Transport::wait`] returned; it must not be used afterwards.
pub trait Transport {
    type Request;

    /// Id of the stage this endpoint belongs to
    fn stage_id(&self) -> usize;

    /// Number of stages reachable through this transport
    fn stage_count(&self) -> usize;

    /// Whether device-resident buffers can be handed to the transport
    fn device_aware(&self) -> bool {
        false
    }

    /// Start sending `words` to `dest`
    fn isend(&mut self, dest: usize, tag: Tag, words: &[u64]) -> Result<Self::Request>;

    /// Start receiving a message of exactly `len` words from `source`
    fn irecv(&mut self, source: usize, tag: Tag, len: usize) -> Result<Self::Request>;

    /// Check once whether `request` finished
    fn test(&mut self, request: &mut Self::Request) -> Result<Option<Completion>>;

    /// Block until `request` finished
    fn wait(&mut self, request: &mut Self::Request) -> Result<Completion>;

    /// Withdraw an unfinished request
    fn cancel(&mut self, request: Self::Request) -> Result<()>;
}
