//! Fixed-size block storage with free-slot recycling.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::{Read, Write};

use bytes::Bytes;
use tracing::*;

use super::range::ceil_div;
use crate::error::BlockError;
use crate::framed::FramedFile;

pub const BLOCK_UNALLOCATED: i64 = -1;
pub const BLOCK_ZERO: i64 = -2;

const STATE_MAGIC: &[u8; 4] = b"BLK2";

/// File storing fixed-size blocks of data.
///
/// Logical block indices map through `block_map` to physical slots in the
/// backing file; all-zero blocks are a sentinel and take no slot. Freed
/// slots are recycled lowest-first.
pub struct BlockStorage {
    f: FramedFile,
    block_size: u64,
    block_map: Vec<i64>,
    free_map: BinaryHeap<Reverse<u64>>,
    free_block_idx: u64,
}

impl BlockStorage {
    pub fn new(f: FramedFile, block_size: u64) -> Self {
        let mut this = Self {
            f,
            block_size,
            block_map: Vec::new(),
            free_map: BinaryHeap::new(),
            free_block_idx: 0,
        };
        this.reconstruct_free_map();
        this
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// The logical block map; entries are slot indices or the
    /// `BLOCK_UNALLOCATED`/`BLOCK_ZERO` sentinels.
    pub fn map(&self) -> &[i64] {
        &self.block_map
    }

    fn reconstruct_free_map(&mut self) {
        let max_block = self.block_map.iter().copied().max().unwrap_or(-1);
        if max_block < 0 {
            self.free_block_idx = 0;
            self.free_map = BinaryHeap::new();
            return;
        }

        let mut mask = vec![false; max_block as usize + 1];
        for &x in &self.block_map {
            if x >= 0 {
                mask[x as usize] = true;
            }
        }
        self.free_map = mask
            .iter()
            .enumerate()
            .filter(|(_, used)| !**used)
            .map(|(j, _)| Reverse(j as u64))
            .collect();
        self.free_block_idx = max_block as u64 + 1;
    }

    fn get_free_slot(&mut self) -> u64 {
        if let Some(Reverse(idx)) = self.free_map.pop() {
            return idx;
        }
        let idx = self.free_block_idx;
        self.free_block_idx += 1;
        idx
    }

    fn truncate_free_map(&mut self, end_block: u64) {
        self.free_block_idx = end_block;
        let last_size = self.free_map.len();
        let kept: Vec<_> = self
            .free_map
            .iter()
            .filter(|Reverse(x)| *x < end_block)
            .copied()
            .collect();
        if kept.len() != last_size {
            self.free_map = kept.into_iter().collect();
        }
    }

    pub fn contains(&self, idx: u64) -> bool {
        match self.block_map.get(idx as usize) {
            Some(&entry) => entry != BLOCK_UNALLOCATED,
            None => false,
        }
    }

    pub async fn get(&mut self, idx: u64) -> Result<Bytes, BlockError> {
        if !self.contains(idx) {
            return Err(BlockError::NotAllocated(idx));
        }

        let slot = self.block_map[idx as usize];
        if slot >= 0 {
            let mut block = self
                .f
                .read_at(self.block_size * slot as u64, self.block_size as usize)
                .await?;
            // Partial block (end-of-file): considered zero-padded
            block.resize(self.block_size as usize, 0);
            Ok(block.into())
        } else if slot == BLOCK_ZERO {
            Ok(Bytes::from(vec![0u8; self.block_size as usize]))
        } else {
            Err(BlockError::CorruptedMap)
        }
    }

    /// Store a block; `None` (or a buffer of all null bytes) records the
    /// sparse zero sentinel and releases any slot the index held.
    pub async fn set(&mut self, idx: u64, data: Option<&[u8]>) -> Result<(), BlockError> {
        let idx = idx as usize;
        if idx >= self.block_map.len() {
            self.block_map.resize(idx + 1, BLOCK_UNALLOCATED);
        }

        let is_zero = match data {
            None => true,
            Some(d) => d.len() == self.block_size as usize && d.iter().all(|&b| b == 0),
        };
        if is_zero {
            let slot = self.block_map[idx];
            if slot >= 0 {
                self.free_map.push(Reverse(slot as u64));
            }
            self.block_map[idx] = BLOCK_ZERO;
            return Ok(());
        }

        let data = data.unwrap_or_default();
        if data.len() > self.block_size as usize {
            return Err(BlockError::Oversized);
        }

        let slot = match self.block_map[idx] {
            s if s >= 0 => s as u64,
            _ => self.get_free_slot(),
        };
        self.block_map[idx] = slot as i64;

        let pos = self.block_size * slot;
        if data.len() < self.block_size as usize && self.f.len() > pos + data.len() as u64 {
            // Partial blocks are OK at the end of the file only; such blocks
            // are implicitly zero-padded once later slots are written.
            // Mid-file short blocks need explicit padding.
            let mut padded = data.to_vec();
            padded.resize(self.block_size as usize, 0);
            self.f.write_at(pos, &padded).await?;
        } else {
            self.f.write_at(pos, data).await?;
        }
        Ok(())
    }

    pub async fn truncate(&mut self, num_blocks: u64) -> Result<(), BlockError> {
        self.block_map.truncate(num_blocks as usize);

        let end_block = self
            .block_map
            .iter()
            .copied()
            .max()
            .map_or(0, |m| (m + 1).max(0)) as u64;
        self.f.truncate(self.block_size * end_block).await?;
        self.truncate_free_map(end_block);
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), BlockError> {
        Ok(self.f.flush().await?)
    }

    pub async fn save_state(&mut self, out: &mut FramedFile) -> Result<(), BlockError> {
        out.truncate(0).await?;

        // Compressing the map obfuscates the total size of sparse files: the
        // state file size correlates with the amount of downloaded data, not
        // with the logical size.
        let mut enc =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::new(9));
        for entry in &self.block_map {
            enc.write_all(&entry.to_le_bytes())
                .map_err(|_| BlockError::InvalidState)?;
        }
        let compressed = enc.finish().map_err(|_| BlockError::InvalidState)?;

        let mut buf = Vec::with_capacity(20 + compressed.len());
        buf.extend_from_slice(STATE_MAGIC);
        buf.extend_from_slice(&self.block_size.to_le_bytes());
        buf.extend_from_slice(&(compressed.len() as u64).to_le_bytes());
        buf.extend_from_slice(&compressed);
        out.write_at(0, &buf).await?;
        Ok(())
    }

    /// Rebuild a storage from `state_file`, reusing `f` as the backing file.
    /// Returns the storage and the offset in `state_file` just past the blob.
    pub async fn restore_state(
        f: FramedFile,
        state_file: &mut FramedFile,
    ) -> Result<(Self, u64), BlockError> {
        let header = state_file.read_at(0, 20).await?;
        if header.len() != 20 || &header[..4] != STATE_MAGIC {
            return Err(BlockError::InvalidState);
        }
        let block_size = u64::from_le_bytes(header[4..12].try_into().unwrap());
        let data_size = u64::from_le_bytes(header[12..20].try_into().unwrap());
        if block_size == 0 {
            return Err(BlockError::InvalidState);
        }

        let compressed = state_file.read_at(20, data_size as usize).await?;
        if compressed.len() as u64 != data_size {
            return Err(BlockError::InvalidState);
        }
        let mut raw = Vec::new();
        flate2::read::ZlibDecoder::new(&compressed[..])
            .read_to_end(&mut raw)
            .map_err(|_| BlockError::InvalidState)?;
        if raw.len() % 8 != 0 {
            return Err(BlockError::InvalidState);
        }
        let block_map: Vec<i64> = raw
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        debug!(
            blocks = block_map.len(),
            block_size, "Restored block storage state"
        );

        let mut this = Self {
            f,
            block_size,
            block_map,
            free_map: BinaryHeap::new(),
            free_block_idx: 0,
        };
        this.reconstruct_free_map();
        Ok((this, 20 + data_size))
    }

    /// Number of slots the backing file currently extends over.
    pub fn slot_extent(&self) -> u64 {
        ceil_div(self.f.len(), self.block_size)
    }

    /// Flush and hand back the backing file, e.g. for a restore cycle.
    pub async fn into_file(mut self) -> Result<FramedFile, BlockError> {
        self.f.flush().await?;
        Ok(self.f)
    }
}
