//! Producer collaborator
//!
//! The engine issues announce/queue/revoke and streaming commands through
//! [`Transport`] and never touches the device protocol itself. Memory moves
//! by value: queueing hands a block to the producer, a delivery hands it
//! back, and revoking returns whatever the producer still holds.

use std::time::Duration;

use crate::buffer::{BufferInfo, ContextTag, RawBlock};
use crate::error::TransportError;
use crate::features::AcquisitionMode;

/// Producer-side identity of an announced buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub u64);

/// Registration for new-buffer notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventToken(pub u64);

/// A filled buffer handed back by the producer
#[derive(Debug)]
pub struct Delivery {
    pub handle: BufferHandle,
    pub block: RawBlock,
    pub info: BufferInfo,
}

/// A queue request the producer refused. The block comes back so it is never lost.
#[derive(Debug)]
pub struct QueueRejected {
    pub error: TransportError,
    pub block: RawBlock,
}

/// Data-stream side of a GenTL-style producer
pub trait Transport: Send + Sync {
    /// Fewest buffers the producer accepts for a session.
    fn min_announce_count(&self) -> Result<usize, TransportError>;

    /// Payload size the stream declares, if it declares one.
    fn payload_size(&self) -> Option<usize>;

    fn create_data_stream(&self) -> Result<(), TransportError>;

    fn close_data_stream(&self) -> Result<(), TransportError>;

    /// Register a block of `size` bytes identified by `tag`.
    fn announce(&self, tag: ContextTag, size: usize) -> Result<BufferHandle, TransportError>;

    /// Submit a block for filling.
    fn queue(&self, handle: BufferHandle, block: RawBlock) -> Result<(), QueueRejected>;

    /// Release an announced buffer, returning memory the producer still holds.
    fn revoke(&self, handle: BufferHandle) -> Result<Option<RawBlock>, TransportError>;

    fn start_acquisition(&self, mode: AcquisitionMode) -> Result<(), TransportError>;

    fn stop_acquisition(&self) -> Result<(), TransportError>;

    /// Discard every queued buffer. Memory stays with the producer until revoked.
    fn flush_buffer_queue(&self) -> Result<(), TransportError>;

    fn register_new_buffer_event(&self) -> Result<EventToken, TransportError>;

    fn unregister_event(&self, token: EventToken) -> Result<(), TransportError>;

    /// Block up to `timeout` for the next delivery.
    ///
    /// Returns [`TransportError::Timeout`] when nothing arrived and
    /// [`TransportError::Aborted`] when a flush woke the waiter.
    fn wait_event(&self, token: EventToken, timeout: Duration) -> Result<Delivery, TransportError>;

    /// Drop pending notifications and wake any blocked waiter.
    fn flush_event_queue(&self, token: EventToken) -> Result<(), TransportError>;

    /// Tick frequency of delivery timestamps in Hz.
    fn timestamp_frequency(&self) -> Option<u64> {
        None
    }
}
