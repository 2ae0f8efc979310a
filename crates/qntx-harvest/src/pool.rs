//! Announced buffer pool
//!
//! Tracks one record per context tag. Memory lives in exactly one place at
//! a time: the pool (announced, idle), the producer (queued), the hold list
//! or a consumer. The record state says which.

use serde::Serialize;
use tracing::{debug, warn};

use crate::buffer::{ContextTag, RawBlock};
use crate::error::{HarvestError, Result};
use crate::transport::{BufferHandle, QueueRejected, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BlockState {
    /// Registered with the producer, memory in the pool
    Announced,
    /// Producer may fill it
    Queued,
    /// Delivered, waiting in the hold list
    Held,
    /// Lent to a consumer through fetch
    Borrowed,
    Revoked,
}

struct BlockRecord {
    handle: BufferHandle,
    state: BlockState,
    memory: Option<RawBlock>,
}

/// Count of blocks per state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolCensus {
    pub announced: usize,
    pub queued: usize,
    pub held: usize,
    pub borrowed: usize,
    pub revoked: usize,
}

impl PoolCensus {
    /// Blocks not yet revoked.
    pub fn live(&self) -> usize {
        self.announced + self.queued + self.held + self.borrowed
    }
}

pub struct BufferPool {
    records: Vec<BlockRecord>,
    buffer_size: usize,
}

impl BufferPool {
    /// Allocate and announce `num_buffers` blocks of `buffer_size` bytes.
    ///
    /// A failure part-way revokes what was already announced.
    pub fn create(
        transport: &dyn Transport,
        num_buffers: usize,
        buffer_size: usize,
        producer_minimum: usize,
    ) -> Result<Self> {
        if num_buffers == 0 || num_buffers < producer_minimum {
            return Err(HarvestError::Allocation {
                requested: num_buffers,
                minimum: producer_minimum.max(1),
            });
        }

        let mut pool = Self {
            records: Vec::with_capacity(num_buffers),
            buffer_size,
        };
        for tag in 0..num_buffers {
            if let Err(e) = pool.announce_one(transport, tag) {
                pool.revoke_all(transport);
                return Err(e);
            }
        }
        debug!(num_buffers, buffer_size, "buffers announced");
        Ok(pool)
    }

    fn announce_one(&mut self, transport: &dyn Transport, tag: ContextTag) -> Result<()> {
        let block = RawBlock::allocate(tag, self.buffer_size)?;
        let handle = transport.announce(tag, self.buffer_size)?;
        self.records.push(BlockRecord {
            handle,
            state: BlockState::Announced,
            memory: Some(block),
        });
        Ok(())
    }

    /// Submit every idle block to the producer.
    pub fn queue_all(&mut self, transport: &dyn Transport) -> Result<()> {
        for record in self.records.iter_mut() {
            if record.state != BlockState::Announced {
                continue;
            }
            let Some(block) = record.memory.take() else {
                continue;
            };
            match transport.queue(record.handle, block) {
                Ok(()) => record.state = BlockState::Queued,
                Err(QueueRejected { error, block }) => {
                    record.memory = Some(block);
                    return Err(error.into());
                }
            }
        }
        Ok(())
    }

    pub(crate) fn mark_delivered(&mut self, tag: ContextTag, handle: BufferHandle) -> Result<()> {
        let record = self.record_mut(tag)?;
        if record.handle != handle || record.state != BlockState::Queued {
            return Err(HarvestError::InvalidState(format!(
                "delivery of block {} in state {:?}",
                tag, record.state
            )));
        }
        record.state = BlockState::Held;
        Ok(())
    }

    pub(crate) fn mark_borrowed(&mut self, tag: ContextTag) -> Result<()> {
        let record = self.record_mut(tag)?;
        if record.state != BlockState::Held {
            return Err(HarvestError::InvalidState(format!(
                "fetch of block {} in state {:?}",
                tag, record.state
            )));
        }
        record.state = BlockState::Borrowed;
        Ok(())
    }

    /// Give a held or borrowed block back to the producer.
    pub(crate) fn requeue(&mut self, transport: &dyn Transport, block: RawBlock) -> Result<()> {
        let tag = block.tag();
        let record = self.record_mut(tag)?;
        if !matches!(record.state, BlockState::Held | BlockState::Borrowed) {
            return Err(HarvestError::InvalidState(format!(
                "requeue of block {} in state {:?}",
                tag, record.state
            )));
        }
        match transport.queue(record.handle, block) {
            Ok(()) => {
                record.state = BlockState::Queued;
                Ok(())
            }
            Err(QueueRejected { error, block }) => {
                record.memory = Some(block);
                record.state = BlockState::Announced;
                Err(error.into())
            }
        }
    }

    /// Take a held or borrowed block back into the pool without queueing it.
    pub(crate) fn reclaim(&mut self, block: RawBlock) -> Result<()> {
        let tag = block.tag();
        let record = self.record_mut(tag)?;
        if !matches!(record.state, BlockState::Held | BlockState::Borrowed) {
            return Err(HarvestError::InvalidState(format!(
                "reclaim of block {} in state {:?}",
                tag, record.state
            )));
        }
        record.memory = Some(block);
        record.state = BlockState::Announced;
        Ok(())
    }

    /// Revoke every block a consumer does not hold. Safe to call repeatedly.
    ///
    /// Teardown never fails: producer errors are logged and the block is
    /// considered released. Returns how many blocks were revoked by this call.
    pub fn revoke_all(&mut self, transport: &dyn Transport) -> usize {
        let mut revoked = 0;
        for (tag, record) in self.records.iter_mut().enumerate() {
            if matches!(record.state, BlockState::Borrowed | BlockState::Revoked) {
                continue;
            }
            match transport.revoke(record.handle) {
                Ok(_memory) => {}
                Err(e) => warn!(tag, error = %e, "revoking buffer failed"),
            }
            record.memory = None;
            record.state = BlockState::Revoked;
            revoked += 1;
        }
        revoked
    }

    pub fn census(&self) -> PoolCensus {
        let mut census = PoolCensus::default();
        for record in &self.records {
            match record.state {
                BlockState::Announced => census.announced += 1,
                BlockState::Queued => census.queued += 1,
                BlockState::Held => census.held += 1,
                BlockState::Borrowed => census.borrowed += 1,
                BlockState::Revoked => census.revoked += 1,
            }
        }
        census
    }

    pub fn state_of(&self, tag: ContextTag) -> Option<BlockState> {
        self.records.get(tag).map(|r| r.state)
    }

    pub fn handle_of(&self, tag: ContextTag) -> Option<BufferHandle> {
        self.records.get(tag).map(|r| r.handle)
    }

    /// Tags the producer currently owns.
    pub fn queued_tags(&self) -> Vec<ContextTag> {
        self.tags_in(BlockState::Queued)
    }

    pub fn tags_in(&self, state: BlockState) -> Vec<ContextTag> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.state == state)
            .map(|(tag, _)| tag)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn record_mut(&mut self, tag: ContextTag) -> Result<&mut BlockRecord> {
        self.records
            .get_mut(tag)
            .ok_or_else(|| HarvestError::InvalidState(format!("unknown block {}", tag)))
    }
}
