//! Chunk data carried alongside image bytes

use crate::error::{HarvestError, Result};

/// Location of one chunk inside a delivered buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub id: u64,
    pub offset: usize,
    pub size: usize,
}

/// Borrowed view of one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    pub id: u64,
    pub data: &'a [u8],
}

impl Chunk<'_> {
    /// Little-endian integer value for chunks of 1 to 8 bytes.
    pub fn as_u64_le(&self) -> Option<u64> {
        if self.data.is_empty() || self.data.len() > 8 {
            return None;
        }
        let mut raw = [0u8; 8];
        raw[..self.data.len()].copy_from_slice(self.data);
        Some(u64::from_le_bytes(raw))
    }
}

/// Resolve descriptors against `bytes`. Any descriptor outside the buffer fails the whole parse.
pub fn parse_chunks<'a>(bytes: &'a [u8], descriptors: &[ChunkDescriptor]) -> Result<Vec<Chunk<'a>>> {
    descriptors
        .iter()
        .map(|d| {
            let end = d.offset.checked_add(d.size).ok_or_else(|| {
                HarvestError::ChunkParse(format!("chunk {:#x} range overflows", d.id))
            })?;
            let data = bytes.get(d.offset..end).ok_or_else(|| {
                HarvestError::ChunkParse(format!(
                    "chunk {:#x} spans {}..{} beyond {} bytes",
                    d.id,
                    d.offset,
                    end,
                    bytes.len()
                ))
            })?;
            Ok(Chunk { id: d.id, data })
        })
        .collect()
}
