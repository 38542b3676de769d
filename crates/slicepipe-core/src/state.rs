//! Per-slice transfer progress

/// Progress of one sub-channel (metadata or data) of one slice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommProgress {
    /// Waiting for the stage to produce the slice
    IdleToProduce,
    /// Payload written, send not posted yet
    ReadyToSend,
    SendInProgress,
    /// Send finished; a receive may be posted
    Sent,
    ReceiveInProgress,
    Received,
    /// Contents handed to the stage for the current time step
    InUse,
    /// The run is over for this slice
    RunComplete,
}

/// Progress of both sub-channels of one slice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotState {
    pub metadata: CommProgress,
    pub data: CommProgress,
}

impl SlotState {
    pub const fn both(progress: CommProgress) -> Self {
        Self {
            metadata: progress,
            data: progress,
        }
    }
}
