//! Per-sample cursor over a [`RomCatalog`]
//!
//! A [`SampleView`] is rebased onto the chunk holding its sample's first
//! byte, so rewinding or seeking within the sample never walks the pool
//! from its start. Windows are clamped to the sample's own last byte even
//! when the backing chunk continues into the next sample.

use crate::catalog::RomCatalog;
use crate::chunk::ChunkCursor;
use crate::error::{EspromError, Result};
use std::io::SeekFrom;

/// Read-only view of one sample; borrows the catalog that owns the bytes
#[derive(Debug, Clone)]
pub struct SampleView<'a> {
    catalog: &'a RomCatalog,
    cursor: ChunkCursor,
    /// First byte, in the rebased cursor's address space
    start: usize,
    /// Last byte (inclusive), in the rebased cursor's address space
    end: usize,
}

impl<'a> SampleView<'a> {
    /// `cursor` must be rebased so that its position is the sample's first
    /// byte and its size ends after the sample's last byte
    pub(crate) fn new(catalog: &'a RomCatalog, cursor: ChunkCursor) -> Self {
        let start = cursor.position();
        let end = cursor.len() - 1;
        SampleView {
            catalog,
            cursor,
            start,
            end,
        }
    }

    /// Sample size in bytes
    pub fn len(&self) -> usize {
        self.end - self.start + 1
    }

    /// Always false; samples hold at least one byte
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Position relative to the sample's first byte
    pub fn position(&self) -> usize {
        self.cursor.position() - self.start
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> usize {
        (self.end + 1).saturating_sub(self.cursor.position())
    }

    /// Next run of contiguous sample bytes, advancing past them
    ///
    /// Returns an empty slice once the sample is exhausted.
    pub fn next_window(&mut self) -> Result<&'a [u8]> {
        let pool = self.catalog.pool();
        let window = self.cursor.window(pool);
        let n = window.len().min(self.remaining());
        if n == 0 {
            return Ok(&[]);
        }

        self.cursor.seek(pool, SeekFrom::Current(n as i64))?;
        Ok(&window[..n])
    }

    /// Restart from the sample's first byte
    pub fn rewind(&mut self) -> Result<()> {
        self.cursor
            .seek(self.catalog.pool(), SeekFrom::Start(self.start as u64))?;
        Ok(())
    }

    /// Move within the sample; `SeekFrom::Start` is relative to its first byte
    ///
    /// Returns the new position relative to the first byte. Targets before
    /// the first byte or past one-after-the-last fail with
    /// [`EspromError::SeekOverrun`].
    pub fn seek(&mut self, pos: SeekFrom) -> Result<usize> {
        let target: i128 = match pos {
            SeekFrom::Start(offset) => self.start as i128 + offset as i128,
            SeekFrom::Current(delta) => self.cursor.position() as i128 + delta as i128,
            SeekFrom::End(delta) => self.end as i128 + 1 + delta as i128,
        };
        if target < self.start as i128 || target > self.end as i128 + 1 {
            return Err(EspromError::SeekOverrun {
                target: target - self.start as i128,
                size: self.len() as u64,
            });
        }

        self.cursor
            .seek(self.catalog.pool(), SeekFrom::Start(target as u64))?;
        Ok(self.position())
    }

    /// Copy of the remaining bytes, consuming them
    pub fn to_vec(&mut self) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(self.remaining());
        loop {
            let window = self.next_window()?;
            if window.is_empty() {
                return Ok(bytes);
            }
            bytes.extend_from_slice(window);
        }
    }
}

impl std::io::Read for SampleView<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let pool = self.catalog.pool();
        let window = self.cursor.window(pool);
        let n = window.len().min(self.remaining()).min(buf.len());
        if n == 0 {
            return Ok(0);
        }

        buf[..n].copy_from_slice(&window[..n]);
        self.cursor.seek(pool, SeekFrom::Current(n as i64))?;
        Ok(n)
    }
}

impl std::io::Seek for SampleView<'_> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        SampleView::seek(self, pos)
            .map(|p| p as u64)
            .map_err(Into::into)
    }
}
