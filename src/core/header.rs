//! ROM container layout
//!
//! All multi-byte fields are big-endian.
//!
//! ```text
//! offset 14   u16   sample count
//! offset 18   directory, `count` entries of 10 bytes each:
//!               +0  u32  first byte of the sample (source file offset)
//!               +4  u32  last byte of the sample, inclusive
//!               +8  2 bytes not used by the parser
//! ```

use crate::error::{EspromError, Result};

/// Offset of the big-endian sample count
pub const SAMPLE_COUNT_OFFSET: u64 = 14;

/// Offset of the first directory entry
pub const DIRECTORY_OFFSET: u64 = 18;

/// Distance between consecutive directory entries
pub const DIRECTORY_STRIDE: u64 = 10;

/// Bytes of each directory entry the parser reads
pub const DIRECTORY_ENTRY_LEN: usize = 8;

/// Decode the sample count field
pub fn decode_sample_count(bytes: [u8; 2]) -> u16 {
    u16::from_be_bytes(bytes)
}

/// One directory entry: an inclusive byte range of the source file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub start: u32,
    pub end: u32,
}

impl DirectoryEntry {
    pub fn new(start: u32, end: u32) -> Self {
        DirectoryEntry { start, end }
    }

    /// File offset of entry `index`
    pub fn offset_of(index: u16) -> u64 {
        DIRECTORY_OFFSET + DIRECTORY_STRIDE * index as u64
    }

    /// File offset one past the last byte the parser reads for `count` entries
    pub fn table_end(count: u16) -> u64 {
        match count {
            0 => DIRECTORY_OFFSET,
            n => Self::offset_of(n - 1) + DIRECTORY_ENTRY_LEN as u64,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < DIRECTORY_ENTRY_LEN {
            return Err(EspromError::Format(format!(
                "directory entry needs {} bytes, got {}",
                DIRECTORY_ENTRY_LEN,
                bytes.len()
            )));
        }

        let start = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let end = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Ok(DirectoryEntry { start, end })
    }

    pub fn to_bytes(&self) -> [u8; DIRECTORY_ENTRY_LEN] {
        let mut bytes = [0u8; DIRECTORY_ENTRY_LEN];
        bytes[..4].copy_from_slice(&self.start.to_be_bytes());
        bytes[4..].copy_from_slice(&self.end.to_be_bytes());
        bytes
    }

    /// Number of bytes covered, `None` if `end < start`
    pub fn len(&self) -> Option<u64> {
        (self.end >= self.start).then(|| (self.end - self.start) as u64 + 1)
    }

    /// Check the entry describes a non-empty range inside a source of
    /// `source_len` bytes
    pub fn validate(&self, index: u16, source_len: u64) -> Result<()> {
        if self.end < self.start {
            return Err(EspromError::Format(format!(
                "sample {} ends at {} before it starts at {}",
                index, self.end, self.start
            )));
        }
        if self.end as u64 >= source_len {
            return Err(EspromError::Format(format!(
                "sample {} ends at {} past the end of the {}-byte source",
                index, self.end, source_len
            )));
        }
        Ok(())
    }
}
