//! Framed cache files.
//!
//! Every on-disk cache artifact is stored in a simple framed format: a
//! 16-byte header (`"FOD0"`, block size, logical data size) followed by
//! `ceil(data_size / block_size)` slots of exactly `block_size` bytes, the
//! final slot null-padded. A BSD advisory flock (shared for read-only,
//! exclusive for writing) is held for the lifetime of an open.

use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::*;

use crate::error::FramedError;

pub const MAGIC: &[u8; 4] = b"FOD0";
pub const HEADER_SIZE: u64 = 16;
pub const DEFAULT_BLOCK_SIZE: u32 = 131072;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Mode {
    /// Existing file, shared lock.
    Read,
    /// Existing file, exclusive lock.
    ReadWrite,
    /// Truncate or create, exclusive lock.
    Create,
}

/// A file of fixed-size slots behind a validated header.
///
/// Offsets in the API are logical data offsets; the header and the slot
/// padding are not addressable. Reads past the logical size return null
/// bytes for regions the backing file has not materialized yet.
pub struct FramedFile {
    f: tokio::fs::File,
    path: PathBuf,
    mode: Mode,
    block_size: u32,
    data_size: u64,
}

impl FramedFile {
    pub async fn open(path: &Path, mode: Mode, block_size: u32) -> Result<Self, FramedError> {
        let mut opts = std::fs::OpenOptions::new();
        opts.read(true);
        match mode {
            Mode::Read => {}
            Mode::ReadWrite => {
                opts.write(true);
            }
            Mode::Create => {
                opts.write(true).create(true).mode(0o600);
            }
        }
        let std_f = opts.open(path)?;
        match mode {
            Mode::Read => std_f.lock_shared()?,
            _ => std_f.lock_exclusive()?,
        }
        // Truncate only after the lock is held
        if mode == Mode::Create {
            std_f.set_len(0)?;
        }

        let f = tokio::fs::File::from_std(std_f);
        let mut this = Self {
            path: path.to_owned(),
            mode,
            block_size,
            data_size: 0,
            f,
        };
        if mode == Mode::Create {
            this.write_header().await?;
        } else {
            let mut header = [0u8; HEADER_SIZE as usize];
            this.f
                .read_exact(&mut header)
                .await
                .map_err(|_| FramedError::InvalidHeader)?;
            if &header[..4] != MAGIC {
                return Err(FramedError::InvalidHeader);
            }
            let found = u32::from_le_bytes(header[4..8].try_into().unwrap());
            if found != block_size {
                return Err(FramedError::BlockSizeMismatch {
                    expected: block_size,
                    found,
                });
            }
            this.data_size = u64::from_le_bytes(header[8..16].try_into().unwrap());
        }
        Ok(this)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Logical data size.
    pub fn len(&self) -> u64 {
        self.data_size
    }

    pub fn is_empty(&self) -> bool {
        self.data_size == 0
    }

    async fn write_header(&mut self) -> Result<(), FramedError> {
        let mut header = [0u8; HEADER_SIZE as usize];
        header[..4].copy_from_slice(MAGIC);
        header[4..8].copy_from_slice(&self.block_size.to_le_bytes());
        header[8..16].copy_from_slice(&self.data_size.to_le_bytes());
        self.f.seek(std::io::SeekFrom::Start(0)).await?;
        self.f.write_all(&header).await?;
        Ok(())
    }

    /// Read up to `len` bytes at `offset`, clamped to the logical size.
    /// Regions inside the logical size that the backing file has not
    /// materialized read as null bytes.
    pub async fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, FramedError> {
        if offset >= self.data_size {
            return Ok(Vec::new());
        }
        let len = len.min((self.data_size - offset) as usize);
        self.f
            .seek(std::io::SeekFrom::Start(HEADER_SIZE + offset))
            .await?;
        let mut buf = vec![0u8; len];
        let mut read = 0;
        while read < len {
            let n = self.f.read(&mut buf[read..]).await?;
            if n == 0 {
                // Past the materialized end: considered zero-padded
                break;
            }
            read += n;
        }
        Ok(buf)
    }

    pub async fn read_all(&mut self) -> Result<Vec<u8>, FramedError> {
        self.read_at(0, self.data_size as usize).await
    }

    pub async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), FramedError> {
        if self.mode == Mode::Read {
            return Err(FramedError::ReadOnly);
        }
        if data.is_empty() {
            return Ok(());
        }
        self.f
            .seek(std::io::SeekFrom::Start(HEADER_SIZE + offset))
            .await?;
        self.f.write_all(data).await?;
        self.data_size = self.data_size.max(offset + data.len() as u64);
        Ok(())
    }

    /// Set the logical size. Shrinking discards the tail bytes on disk, so a
    /// later regrowth reads null bytes rather than stale data.
    pub async fn truncate(&mut self, size: u64) -> Result<(), FramedError> {
        if self.mode == Mode::Read {
            return Err(FramedError::ReadOnly);
        }
        if size < self.data_size {
            self.f.set_len(HEADER_SIZE + size).await?;
        }
        self.data_size = size;
        Ok(())
    }

    /// Persist the header and pad the final slot out to `block_size`.
    pub async fn flush(&mut self) -> Result<(), FramedError> {
        if self.mode != Mode::Read {
            let slots = if self.data_size == 0 {
                0
            } else {
                1 + (self.data_size - 1) / u64::from(self.block_size)
            };
            self.f
                .set_len(HEADER_SIZE + slots * u64::from(self.block_size))
                .await?;
            self.write_header().await?;
        }
        self.f.flush().await?;
        Ok(())
    }

    pub async fn close(mut self) -> Result<(), FramedError> {
        if let Err(e) = self.flush().await {
            warn!(path = ?self.path, "Failed to flush framed file on close: {}", e);
            return Err(e);
        }
        Ok(())
    }
}
