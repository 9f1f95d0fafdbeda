//! Chunked address space
//!
//! A [`ChunkPool`] is one flat byte range assembled from fixed-size chunks
//! instead of a single large allocation. Chunks live in an arena and link
//! to their successor by index, so any number of [`ChunkCursor`]s can walk
//! the same pool without aliasing concerns.
//!
//! Cursors are optimised for forward, sequential access: a seek that lands
//! at or after the start of the cursor's current chunk walks forward from
//! there, anything earlier restarts from the cursor's base chunk.

use crate::error::{EspromError, Result};
use std::io::SeekFrom;

/// Default chunk payload: an 8 KiB allocation less one link word
pub const DEFAULT_CHUNK_PAYLOAD: usize = 8 * 1024 - 8;

struct Chunk {
    payload: Box<[u8]>,
    next: Option<usize>,
}

/// Arena of equally sized chunks forming one addressable region
pub struct ChunkPool {
    chunks: Vec<Chunk>,
    payload: usize,
    size: usize,
}

impl ChunkPool {
    /// Allocate `ceil(total / DEFAULT_CHUNK_PAYLOAD)` chunks
    pub fn allocate(total: usize) -> Result<Self> {
        Self::with_payload(total, DEFAULT_CHUNK_PAYLOAD)
    }

    /// Allocate enough `payload`-sized chunks to address `total` bytes
    ///
    /// Chunks already allocated are released if a later one fails.
    pub fn with_payload(total: usize, payload: usize) -> Result<Self> {
        if payload == 0 {
            return Err(EspromError::Allocation(
                "chunk payload size must be non-zero".to_string(),
            ));
        }

        let count = total.div_ceil(payload);
        let mut chunks = Vec::new();
        chunks
            .try_reserve_exact(count)
            .map_err(|e| EspromError::Allocation(format!("chunk table of {count}: {e}")))?;

        for index in 0..count {
            let mut buf: Vec<u8> = Vec::new();
            buf.try_reserve_exact(payload).map_err(|e| {
                EspromError::Allocation(format!("chunk {index} of {count} ({payload} bytes): {e}"))
            })?;
            buf.resize(payload, 0);

            chunks.push(Chunk {
                payload: buf.into_boxed_slice(),
                next: (index + 1 < count).then_some(index + 1),
            });
        }

        Ok(ChunkPool {
            chunks,
            payload,
            size: total,
        })
    }

    /// Addressable bytes
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn payload_size(&self) -> usize {
        self.payload
    }

    /// Cursor at offset 0 spanning the whole pool
    pub fn cursor(&self) -> ChunkCursor {
        ChunkCursor {
            base: 0,
            current: 0,
            position: 0,
            offset: 0,
            size: self.size,
        }
    }

    fn next(&self, index: usize) -> Option<usize> {
        self.chunks.get(index).and_then(|chunk| chunk.next)
    }

    fn payload(&self, index: usize) -> Option<&[u8]> {
        self.chunks.get(index).map(|chunk| &chunk.payload[..])
    }

    fn payload_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        self.chunks.get_mut(index).map(|chunk| &mut chunk.payload[..])
    }
}

impl std::fmt::Debug for ChunkPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkPool")
            .field("size", &self.size)
            .field("payload", &self.payload)
            .field("chunks", &self.chunks.len())
            .finish()
    }
}

/// Position within a [`ChunkPool`]
///
/// A cursor does not borrow its pool; every operation takes the pool it was
/// created from. Copying a cursor is cheap and yields an independent one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkCursor {
    /// Chunk that address 0 of this cursor falls in
    base: usize,
    /// Chunk holding `position`
    current: usize,
    /// Address relative to the start of `base`
    position: usize,
    /// Offset of `position` within `current`
    offset: usize,
    /// Addressable bytes, relative to the start of `base`
    size: usize,
}

impl ChunkCursor {
    pub fn position(&self) -> usize {
        self.position
    }

    /// Addressable size of this cursor
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Bytes between the position and the end of the addressable range
    pub fn remaining(&self) -> usize {
        self.size - self.position
    }

    /// Offset of the position inside the current chunk
    pub fn offset_in_chunk(&self) -> usize {
        self.offset
    }

    /// Move to an absolute address
    ///
    /// Targets outside `0..=len()`, or beyond the end of the chunk chain,
    /// fail with [`EspromError::SeekOverrun`] and leave the cursor untouched.
    pub fn seek(&mut self, pool: &ChunkPool, pos: SeekFrom) -> Result<usize> {
        let target: i128 = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
            SeekFrom::End(delta) => self.size as i128 + delta as i128,
        };
        let size = self.size as u64;
        let overrun = move || EspromError::SeekOverrun { target, size };
        if target < 0 || target > self.size as i128 {
            return Err(overrun());
        }
        let target = target as usize;

        let mut cursor = *self;
        let chunk_start = cursor.position - cursor.offset;
        let mut remaining = if chunk_start <= target {
            cursor.position = chunk_start;
            target - chunk_start
        } else {
            cursor.current = cursor.base;
            cursor.position = 0;
            target
        };
        cursor.offset = 0;

        let payload = pool.payload_size();
        loop {
            let next = pool.next(cursor.current);
            // one-past-the-end of the final chunk is a valid position
            if remaining < payload || (remaining == payload && next.is_none()) {
                cursor.offset = remaining;
                cursor.position += remaining;
                break;
            }

            cursor.current = next.ok_or_else(overrun)?;
            cursor.position += payload;
            remaining -= payload;
        }

        *self = cursor;
        Ok(self.position)
    }

    /// Bytes from the position to the end of the current chunk
    ///
    /// The window never extends past the cursor's addressable size. It is
    /// only meaningful until the cursor moves.
    pub fn window<'p>(&self, pool: &'p ChunkPool) -> &'p [u8] {
        match pool.payload(self.current) {
            Some(chunk) => {
                let (start, end) = self.window_bounds(chunk.len());
                &chunk[start..end]
            }
            None => &[],
        }
    }

    /// Mutable variant of [`window`](Self::window)
    pub fn window_mut<'p>(&self, pool: &'p mut ChunkPool) -> &'p mut [u8] {
        match pool.payload_mut(self.current) {
            Some(chunk) => {
                let (start, end) = self.window_bounds(chunk.len());
                &mut chunk[start..end]
            }
            None => &mut [],
        }
    }

    fn window_bounds(&self, chunk_len: usize) -> (usize, usize) {
        let start = self.offset.min(chunk_len);
        let end = (start + self.remaining()).min(chunk_len);
        (start, end)
    }

    /// Copy bytes out of the pool, advancing the cursor
    pub fn read(&mut self, pool: &ChunkPool, buf: &mut [u8]) -> Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            let window = self.window(pool);
            if window.is_empty() {
                break;
            }
            let n = window.len().min(buf.len() - total);
            buf[total..total + n].copy_from_slice(&window[..n]);
            self.seek(pool, SeekFrom::Current(n as i64))?;
            total += n;
        }
        Ok(total)
    }

    /// Copy bytes into the pool, advancing the cursor
    pub fn write(&mut self, pool: &mut ChunkPool, buf: &[u8]) -> Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            let window = self.window_mut(pool);
            if window.is_empty() {
                break;
            }
            let n = window.len().min(buf.len() - total);
            window[..n].copy_from_slice(&buf[total..total + n]);
            self.seek(pool, SeekFrom::Current(n as i64))?;
            total += n;
        }
        Ok(total)
    }

    /// Re-anchor the cursor on its current chunk and limit it to `len`
    /// bytes past the current position
    ///
    /// Address 0 becomes the start of the current chunk, so the position
    /// keeps its in-chunk offset and rewinds restart from this chunk rather
    /// than from the start of the pool.
    pub(crate) fn rebase(&mut self, len: usize) {
        self.base = self.current;
        self.position = self.offset;
        self.size = self.offset + len;
    }
}
