//! Block cache for a remote file.

use bytes::{Bytes, BytesMut};
use tracing::*;

use super::range::{block_range, ceil_div};
use super::storage::BlockStorage;
use super::BLOCK_SIZE;
use crate::error::BlockError;
use crate::framed::FramedFile;

/// A sparse local copy of a remote file that supports overwriting.
///
/// Data is cached per block, tracking which blocks still need to be
/// retrieved. Before each read or write, [`Self::pre_read`] or
/// [`Self::pre_write`] names the next range that must be fetched from the
/// remote and fed in through [`Self::receive_cached_data`]; once they return
/// `None` the operation can proceed locally.
pub struct BlockCachedFile {
    storage: BlockStorage,
    block_size: u64,
    /// Logical file size; may exceed what is cached.
    size: u64,
    /// Size within which the remote is authoritative; fetches never reach
    /// beyond it.
    cache_size: u64,
    /// Every block below this watermark is present locally.
    first_uncached_block: u64,
}

impl BlockCachedFile {
    pub fn new(f: FramedFile, initial_cache_size: u64, block_size: Option<u64>) -> Self {
        let block_size = block_size.unwrap_or(BLOCK_SIZE);
        Self {
            storage: BlockStorage::new(f, block_size),
            block_size,
            size: initial_cache_size,
            cache_size: initial_cache_size,
            first_uncached_block: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn cache_size(&self) -> u64 {
        self.cache_size
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn storage(&self) -> &BlockStorage {
        &self.storage
    }

    pub async fn save_state(&mut self, out: &mut FramedFile) -> Result<(), BlockError> {
        self.storage.save_state(out).await?;
        let mut buf = [0u8; 24];
        buf[..8].copy_from_slice(&self.size.to_le_bytes());
        buf[8..16].copy_from_slice(&self.cache_size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.first_uncached_block.to_le_bytes());
        out.write_at(out.len(), &buf).await?;
        Ok(())
    }

    pub async fn restore_state(
        f: FramedFile,
        state_file: &mut FramedFile,
    ) -> Result<Self, BlockError> {
        let (storage, offset) = BlockStorage::restore_state(f, state_file).await?;
        let tail = state_file.read_at(offset, 24).await?;
        if tail.len() != 24 {
            return Err(BlockError::InvalidState);
        }
        let block_size = storage.block_size();
        Ok(Self {
            storage,
            block_size,
            size: u64::from_le_bytes(tail[..8].try_into().unwrap()),
            cache_size: u64::from_le_bytes(tail[8..16].try_into().unwrap()),
            first_uncached_block: u64::from_le_bytes(tail[16..24].try_into().unwrap()),
        })
    }

    /// Grow the virtual size to `new_size`, recording the intermediate
    /// blocks as sparse zeros. The last existing block, if partial, is
    /// implicitly null-padded by the storage layer.
    async fn pad_file(&mut self, new_size: u64) -> Result<(), BlockError> {
        if new_size <= self.size {
            return Ok(());
        }
        let r = block_range(self.size, new_size - self.size, self.block_size, None)?;

        if let Some(s) = r.start {
            if s.start == 0 {
                self.storage.set(s.idx, None).await?;
            }
        }
        if let Some((lo, hi)) = r.mid {
            for idx in lo..hi {
                self.storage.set(idx, None).await?;
            }
        }
        if let Some(e) = r.end {
            self.storage.set(e.idx, None).await?;
        }

        self.size = new_size;
        Ok(())
    }

    /// Commit every whole block contained in the received span, unless the
    /// block was already written locally. Returns the new stream offset and
    /// any trailing bytes that did not complete a block, for reuse on the
    /// next read.
    pub async fn receive_cached_data(
        &mut self,
        offset: u64,
        chunks: Vec<Bytes>,
    ) -> Result<(u64, Vec<Bytes>), BlockError> {
        let data_size: u64 = chunks.iter().map(|c| c.len() as u64).sum();

        let r = block_range(offset, data_size, self.block_size, Some(self.cache_size))?;
        let Some((lo, hi)) = r.mid else {
            // Not enough data for full blocks
            return Ok((offset, chunks));
        };

        let mut data = BytesMut::with_capacity(data_size as usize);
        for c in &chunks {
            data.extend_from_slice(c);
        }
        let data = data.freeze();

        // Skip the initial partial part
        let mut i: u64 = match r.start {
            Some(s) => self.block_size - s.start as u64,
            None => 0,
        };

        for j in lo..hi {
            if !self.storage.contains(j) {
                let end = (i + self.block_size).min(data_size);
                self.storage
                    .set(j, Some(&data[i as usize..end as usize]))
                    .await?;
            }
            i += self.block_size.min(data_size - i);
        }

        if lo <= self.first_uncached_block {
            self.first_uncached_block = self.first_uncached_block.max(hi);
        }

        // Hand back trailing data for possible future use
        let rest = if i < data_size {
            vec![data.slice(i as usize..)]
        } else {
            Vec::new()
        };
        Ok((offset + i, rest))
    }

    pub async fn truncate(&mut self, size: u64) -> Result<(), BlockError> {
        if size < self.size {
            self.storage
                .truncate(ceil_div(size, self.block_size))
                .await?;
            self.size = size;
        } else if size > self.size {
            self.pad_file(size).await?;
        }
        self.cache_size = self.cache_size.min(size);
        Ok(())
    }

    /// Write within the cached file. The caller must have satisfied
    /// [`Self::pre_write`]; a write touching a partial block that is neither
    /// cached nor padded fails.
    pub async fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), BlockError> {
        if offset > self.size {
            // Explicit POSIX behavior for write-past-end
            self.pad_file(offset).await?;
        }
        if data.is_empty() {
            return Ok(());
        }

        let r = block_range(offset, data.len() as u64, self.block_size, None)?;
        self.pad_file(offset + data.len() as u64).await?;

        let mut i = 0usize;
        if let Some(s) = r.start {
            let block = self.storage.get(s.idx).await?;
            i = s.end - s.start;
            let mut buf = BytesMut::with_capacity(self.block_size as usize);
            buf.extend_from_slice(&block[..s.start]);
            buf.extend_from_slice(&data[..i]);
            buf.extend_from_slice(&block[s.end..]);
            self.storage.set(s.idx, Some(&buf[..])).await?;
        }
        if let Some((lo, hi)) = r.mid {
            for idx in lo..hi {
                self.storage
                    .set(idx, Some(&data[i..i + self.block_size as usize]))
                    .await?;
                i += self.block_size as usize;
            }
        }
        if let Some(e) = r.end {
            let block = self.storage.get(e.idx).await?;
            let mut buf = BytesMut::with_capacity(self.block_size as usize);
            buf.extend_from_slice(&data[i..]);
            buf.extend_from_slice(&block[e.end..]);
            self.storage.set(e.idx, Some(&buf[..])).await?;
        }
        Ok(())
    }

    /// Read within the cached file; short iff the offset is at or past the
    /// logical size.
    pub async fn read(&mut self, offset: u64, length: u64) -> Result<Bytes, BlockError> {
        let length = self.size.saturating_sub(offset).min(length);
        if length == 0 {
            return Ok(Bytes::new());
        }

        let r = block_range(offset, length, self.block_size, None)?;
        let mut out = BytesMut::with_capacity(length as usize);

        if let Some(s) = r.start {
            let block = self.storage.get(s.idx).await?;
            out.extend_from_slice(&block[s.start..s.end]);
        }
        if let Some((lo, hi)) = r.mid {
            for idx in lo..hi {
                let block = self.storage.get(idx).await?;
                out.extend_from_slice(&block);
            }
        }
        if let Some(e) = r.end {
            let block = self.storage.get(e.idx).await?;
            out.extend_from_slice(&block[..e.end]);
        }
        Ok(out.freeze())
    }

    /// The first `(offset, length)` that must be fetched and fed through
    /// [`Self::receive_cached_data`] before a read at `[offset, offset +
    /// length)` can succeed. `None` when the cache is ready. More than one
    /// fetch may be necessary.
    pub fn pre_read(&self, offset: u64, length: u64) -> Option<(u64, u64)> {
        // Limit to inside the cached area
        let cache_end = ceil_div(self.cache_size, self.block_size) * self.block_size;
        let length = length.min(cache_end.saturating_sub(offset));
        if length == 0 {
            return None;
        }

        let start_block = offset / self.block_size;
        let end_block = ceil_div(offset + length, self.block_size);

        // Combine consecutive missing blocks into a single fetch
        let mut j = start_block.max(self.first_uncached_block);
        while j < end_block && self.storage.contains(j) {
            j += 1;
        }
        if j >= end_block {
            return None;
        }

        let end = (j + 1..end_block)
            .find(|k| self.storage.contains(*k))
            .unwrap_or(end_block);
        if j >= end {
            return None;
        }

        let start_pos = j * self.block_size;
        let end_pos = end * self.block_size;
        if start_pos < self.cache_size {
            return Some((start_pos, end_pos.min(self.cache_size) - start_pos));
        }
        None
    }

    /// Like [`Self::pre_read`], but for write operations: only partially
    /// overwritten blocks at either end need their current content.
    pub fn pre_write(&self, offset: u64, length: u64) -> Option<(u64, u64)> {
        let r = block_range(offset, length, self.block_size, None).ok()?;

        let edges = [
            r.start.map(|s| s.idx),
            r.end.map(|e| e.idx),
        ];
        for idx in edges.into_iter().flatten() {
            if idx >= self.first_uncached_block && !self.storage.contains(idx) {
                let start_pos = idx * self.block_size;
                let end_pos = (idx + 1) * self.block_size;
                if start_pos < self.cache_size {
                    return Some((start_pos, end_pos.min(self.cache_size) - start_pos));
                }
            }
        }

        // No reads required
        None
    }

    /// Materialize sparse padding up to the logical size, so the cached file
    /// can be streamed out as a contiguous whole.
    pub async fn pad_to_size(&mut self) -> Result<(), BlockError> {
        let size = self.size;
        if let Err(e) = self.pad_file(size).await {
            warn!("Failed to pad cached file before streaming: {}", e);
            return Err(e);
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), BlockError> {
        self.storage.flush().await
    }
}
