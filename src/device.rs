//! Block device abstraction and the `Bio` type submitted against it.
//!
//! The log device and the data device are both modeled as `BlockDevice`
//! implementors. The reference implementation, [`FileDevice`], wraps a
//! regular file and is what tests and the redo engine use; any `Send + Sync`
//! implementor works against the pipeline.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, WalbError};

pub const SECTOR_SIZE: u64 = 512;

/// Direction of an IO request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BioDirection {
    Read,
    Write,
    /// Zero-length flush barrier.
    Flush,
    Discard,
}

/// A block IO request: a sector range plus (for writes) owned bytes.
#[derive(Debug, Clone)]
pub struct Bio {
    pub pos: u64,
    pub len_sectors: u64,
    pub direction: BioDirection,
    pub data: Vec<u8>,
    pub is_flush: bool,
}

impl Bio {
    pub fn new_write(pos: u64, data: Vec<u8>) -> Self {
        let len_sectors = data.len() as u64 / SECTOR_SIZE;
        Self {
            pos,
            len_sectors,
            direction: BioDirection::Write,
            data,
            is_flush: false,
        }
    }

    pub fn new_flush() -> Self {
        Self {
            pos: 0,
            len_sectors: 0,
            direction: BioDirection::Flush,
            data: Vec::new(),
            is_flush: true,
        }
    }

    pub fn new_discard(pos: u64, len_sectors: u64) -> Self {
        Self {
            pos,
            len_sectors,
            direction: BioDirection::Discard,
            data: Vec::new(),
            is_flush: false,
        }
    }

    pub fn new_read(pos: u64, len_sectors: u64) -> Self {
        Self {
            pos,
            len_sectors,
            direction: BioDirection::Read,
            data: vec![0u8; (len_sectors * SECTOR_SIZE) as usize],
            is_flush: false,
        }
    }

    pub fn end_sector(&self) -> u64 {
        self.pos + self.len_sectors
    }

    /// Deep-clone the bio, copying its data buffer, for the data-device
    /// dispatch path (the original bio's pages may be released once the log
    /// write is durable).
    pub fn deep_clone(&self) -> Self {
        self.clone()
    }

    /// Split this bio into chunks no larger than `chunk_sectors` (0 means no
    /// limit).
    pub fn split(self, chunk_sectors: u32) -> Vec<Bio> {
        if chunk_sectors == 0 || self.len_sectors <= chunk_sectors as u64 {
            return vec![self];
        }
        let chunk = chunk_sectors as u64;
        let mut out = Vec::new();
        let mut offset = 0u64;
        while offset < self.len_sectors {
            let this_len = chunk.min(self.len_sectors - offset);
            let byte_start = (offset * SECTOR_SIZE) as usize;
            let byte_end = ((offset + this_len) * SECTOR_SIZE) as usize;
            let data = if self.data.is_empty() {
                Vec::new()
            } else {
                self.data[byte_start..byte_end].to_vec()
            };
            out.push(Bio {
                pos: self.pos + offset,
                len_sectors: this_len,
                direction: self.direction,
                data,
                is_flush: false,
            });
            offset += this_len;
        }
        out
    }
}

/// A block device that can submit bios and report completion synchronously.
///
/// Submission is kept synchronous-and-cheap (an in-process file write); the
/// pipeline provides the asynchrony by running submission on a blocking-safe
/// worker task and awaiting the result through a channel, the same way the
/// kernel core awaits bio completion callbacks.
pub trait BlockDevice: Send + Sync {
    fn submit(&self, bio: &Bio) -> Result<()>;
    fn flush(&self) -> Result<()>;
    /// Byte length of the device, if known.
    fn size_bytes(&self) -> Option<u64> {
        None
    }
}

/// A `BlockDevice` backed by a regular file, used for the log device, data
/// device, and all tests.
#[derive(Clone)]
pub struct FileDevice {
    file: Arc<Mutex<File>>,
}

impl FileDevice {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn from_file(file: File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }

    pub fn read_at(&self, pos_sectors: u64, len_sectors: u64) -> Result<Vec<u8>> {
        let mut file = self.file.lock();
        let mut buf = vec![0u8; (len_sectors * SECTOR_SIZE) as usize];
        file.seek(SeekFrom::Start(pos_sectors * SECTOR_SIZE))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

impl BlockDevice for FileDevice {
    fn submit(&self, bio: &Bio) -> Result<()> {
        match bio.direction {
            BioDirection::Flush => self.flush(),
            BioDirection::Discard => Ok(()),
            BioDirection::Read => Err(WalbError::InvalidLogpackHeader(
                "read bios must go through read_at".to_string(),
            )),
            BioDirection::Write => {
                let mut file = self.file.lock();
                file.seek(SeekFrom::Start(bio.pos * SECTOR_SIZE))?;
                file.write_all(&bio.data)?;
                Ok(())
            }
        }
    }

    fn flush(&self) -> Result<()> {
        let mut file = self.file.lock();
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }

    fn size_bytes(&self) -> Option<u64> {
        let file = self.file.lock();
        file.metadata().ok().map(|m| m.len())
    }
}
