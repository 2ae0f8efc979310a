//! Raw blocks, delivery metadata and the consumer-side buffer handle

use std::fmt;
use std::sync::Arc;

use tracing::debug;
use zerocopy::IntoBytes;

use crate::chunk::{parse_chunks, Chunk, ChunkDescriptor};
use crate::error::{HarvestError, Result};
use crate::payload::{Payload, PayloadDecoder, PayloadType};
use crate::transport::BufferHandle;

/// Correlates announce, queue and revoke calls for one block
pub type ContextTag = usize;

/// Fixed-size producer-visible memory.
///
/// Backed by `u64` words so the start is 8-byte aligned and typed
/// views over 16/32-bit pixel data line up.
#[derive(Default)]
pub struct RawBlock {
    tag: ContextTag,
    len: usize,
    words: Box<[u64]>,
}

impl RawBlock {
    pub fn allocate(tag: ContextTag, len: usize) -> Result<Self> {
        let word_count = len.div_ceil(8);
        let mut words: Vec<u64> = Vec::new();
        words.try_reserve_exact(word_count).map_err(|e| {
            HarvestError::AllocationFailed(format!("{} bytes for block {}: {}", len, tag, e))
        })?;
        words.resize(word_count, 0);
        Ok(Self {
            tag,
            len,
            words: words.into_boxed_slice(),
        })
    }

    pub fn tag(&self) -> ContextTag {
        self.tag
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bytes(&self) -> &[u8] {
        &self.words.as_bytes()[..self.len]
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.words.as_mut_bytes()[..len]
    }
}

impl fmt::Debug for RawBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawBlock")
            .field("tag", &self.tag)
            .field("len", &self.len)
            .finish()
    }
}

/// Geometry the producer reports for a single-image payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageInfo {
    pub width: Option<usize>,
    pub height: Option<usize>,
    /// Lines actually delivered, for line-scan producers that report height 0
    pub delivered_image_height: Option<usize>,
    pub x_offset: Option<usize>,
    pub y_offset: Option<usize>,
    pub x_padding: usize,
    pub y_padding: usize,
    pub pixel_format: Option<u32>,
}

/// One part of a multi-part payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartInfo {
    pub data_offset: usize,
    pub data_size: usize,
    pub width: usize,
    pub height: usize,
    pub x_offset: usize,
    pub y_offset: usize,
    pub x_padding: usize,
    pub pixel_format: u32,
}

/// Metadata attached to a delivery
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BufferInfo {
    pub frame_id: u64,
    pub timestamp: Option<u64>,
    /// Tick frequency of `timestamp` in Hz
    pub timestamp_frequency: Option<u64>,
    pub payload_type: PayloadType,
    pub incomplete: bool,
    /// Bytes written by the producer; the whole block when absent
    pub size_filled: Option<usize>,
    pub image: ImageInfo,
    pub parts: Vec<PartInfo>,
    pub chunks: Vec<ChunkDescriptor>,
}

/// A delivered block waiting in the hold list or lent to a consumer
#[derive(Debug)]
pub(crate) struct HeldSlot {
    pub session: u64,
    pub handle: BufferHandle,
    pub block: RawBlock,
    pub info: BufferInfo,
}

/// Takes a consumer's buffer back into the session it came from
pub(crate) trait Recycler: Send + Sync {
    fn recycle(&self, slot: HeldSlot) -> Result<()>;
}

/// A filled buffer lent to the consumer.
///
/// Returned to the producer by [`FilledBuffer::queue`] or, on every other
/// exit path, when dropped.
pub struct FilledBuffer {
    session: u64,
    handle: BufferHandle,
    block: RawBlock,
    info: BufferInfo,
    returned: bool,
    recycler: Arc<dyn Recycler>,
    decoder: Arc<PayloadDecoder>,
}

impl FilledBuffer {
    pub(crate) fn new(
        slot: HeldSlot,
        recycler: Arc<dyn Recycler>,
        decoder: Arc<PayloadDecoder>,
    ) -> Self {
        Self {
            session: slot.session,
            handle: slot.handle,
            block: slot.block,
            info: slot.info,
            returned: false,
            recycler,
            decoder,
        }
    }

    pub fn frame_id(&self) -> u64 {
        self.info.frame_id
    }

    pub fn timestamp(&self) -> Option<u64> {
        self.info.timestamp
    }

    pub fn info(&self) -> &BufferInfo {
        &self.info
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn context_tag(&self) -> ContextTag {
        self.block.tag()
    }

    /// Bytes the producer filled.
    pub fn bytes(&self) -> &[u8] {
        let bytes = self.block.bytes();
        let filled = self.info.size_filled.map_or(bytes.len(), |n| n.min(bytes.len()));
        &bytes[..filled]
    }

    /// Decode into a typed payload. Borrowed views, no copy.
    pub fn payload(&self) -> Payload<'_> {
        self.decoder.decode(&self.info, self.bytes())
    }

    pub fn chunks(&self) -> Result<Vec<Chunk<'_>>> {
        parse_chunks(self.bytes(), &self.info.chunks)
    }

    /// Hand the buffer back to the producer.
    pub fn queue(mut self) -> Result<()> {
        match self.take_slot() {
            Some(slot) => self.recycler.recycle(slot),
            None => Ok(()),
        }
    }

    fn take_slot(&mut self) -> Option<HeldSlot> {
        if self.returned {
            return None;
        }
        self.returned = true;
        Some(HeldSlot {
            session: self.session,
            handle: self.handle,
            block: std::mem::take(&mut self.block),
            info: std::mem::take(&mut self.info),
        })
    }
}

impl Drop for FilledBuffer {
    fn drop(&mut self) {
        if let Some(slot) = self.take_slot() {
            let frame_id = slot.info.frame_id;
            if let Err(e) = self.recycler.recycle(slot) {
                debug!(frame_id, error = %e, "buffer returned on drop was not requeued");
            }
        }
    }
}

impl fmt::Debug for FilledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilledBuffer")
            .field("frame_id", &self.info.frame_id)
            .field("handle", &self.handle)
            .field("tag", &self.block.tag())
            .field("len", &self.block.len())
            .finish()
    }
}
