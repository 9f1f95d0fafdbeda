//! Sample catalog of a ROM container
//!
//! Building a catalog takes two passes over the directory:
//!
//! 1. **Size pass** reads every entry and computes the span between the
//!    lowest first byte and the highest last byte.
//! 2. **Fill pass** allocates a [`ChunkPool`] and copies each entry's bytes,
//!    in table order, into consecutive destination ranges.
//!
//! Entries are never deduplicated. Two entries describing the same (or
//! overlapping) source bytes each get their own destination copy, so
//! destination ranges are always disjoint. The pool is therefore sized to
//! the larger of the span and the summed entry lengths.

use crate::chunk::{ChunkCursor, ChunkPool, DEFAULT_CHUNK_PAYLOAD};
use crate::error::{EspromError, Result};
use crate::header::{decode_sample_count, DirectoryEntry, DIRECTORY_ENTRY_LEN, SAMPLE_COUNT_OFFSET};
use crate::io::DirectFile;
use crate::sample::SampleView;
use serde::Serialize;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{debug, info};

/// Inclusive destination range of one sample inside the catalog's pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SampleRange {
    pub start: usize,
    pub end: usize,
}

impl SampleRange {
    pub fn len(&self) -> usize {
        self.end - self.start + 1
    }

    /// Always false; a range covers at least one byte
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Default upper bound on the bytes a catalog may materialize (256 MiB)
pub const DEFAULT_MAX_POOL_BYTES: u64 = 256 * 1024 * 1024;

/// Tuning for [`RomCatalog`] construction
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    /// Payload bytes per pool chunk
    pub chunk_payload: usize,
    /// Sample counts above this are rejected as implausible
    pub max_samples: u16,
    /// Directories whose samples add up to more than this are rejected
    /// before anything is allocated
    pub max_pool_bytes: u64,
}

impl CatalogConfig {
    pub fn new() -> Self {
        CatalogConfig {
            chunk_payload: DEFAULT_CHUNK_PAYLOAD,
            max_samples: u16::MAX,
            max_pool_bytes: DEFAULT_MAX_POOL_BYTES,
        }
    }

    pub fn chunk_payload(mut self, payload: usize) -> Self {
        self.chunk_payload = payload;
        self
    }

    pub fn max_samples(mut self, max: u16) -> Self {
        self.max_samples = max;
        self
    }

    pub fn max_pool_bytes(mut self, max: u64) -> Self {
        self.max_pool_bytes = max;
        self
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Samples of a ROM container, materialized in memory
#[derive(Debug)]
pub struct RomCatalog {
    pool: ChunkPool,
    cursor: ChunkCursor,
    samples: Vec<SampleRange>,
    span: u64,
}

impl RomCatalog {
    /// Load the ROM at `path` with the default configuration
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use esprom_rs::RomCatalog;
    ///
    /// # fn main() -> esprom_rs::Result<()> {
    /// let catalog = RomCatalog::open("/roms/piano.bin")?;
    /// let mut sample = catalog.sample_view(0)?;
    /// loop {
    ///     let window = sample.next_window()?;
    ///     if window.is_empty() {
    ///         break;
    ///     }
    ///     // feed `window` to the synth
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, &CatalogConfig::default())
    }

    /// Load the ROM at `path` through a [`DirectFile`]
    pub fn open_with<P: AsRef<Path>>(path: P, config: &CatalogConfig) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading ROM catalog from {:?}", path);

        let mut file = DirectFile::open(path)?;
        let catalog = Self::from_source(&mut file, config)?;
        file.close()?;
        Ok(catalog)
    }

    /// Build a catalog from any seekable byte source
    ///
    /// On failure everything allocated so far is released.
    pub fn from_source<R: Read + Seek>(source: &mut R, config: &CatalogConfig) -> Result<Self> {
        let source_len = source.seek(SeekFrom::End(0))?;

        let count = read_sample_count(source, source_len)?;
        if count == 0 || count > config.max_samples {
            return Err(EspromError::Format(format!(
                "implausible sample count {} (limit {})",
                count, config.max_samples
            )));
        }
        let table_end = DirectoryEntry::table_end(count);
        if table_end > source_len {
            return Err(EspromError::Format(format!(
                "directory of {} entries ends at {} past the end of the {}-byte source",
                count, table_end, source_len
            )));
        }

        // size pass
        let mut entries = Vec::new();
        entries
            .try_reserve_exact(count as usize)
            .map_err(|e| EspromError::Allocation(format!("directory of {count}: {e}")))?;

        let mut lowest = u64::MAX;
        let mut highest = 0u64;
        let mut total = 0u64;
        for index in 0..count {
            let entry = read_entry(source, index)?;
            entry.validate(index, source_len)?;

            lowest = lowest.min(entry.start as u64);
            highest = highest.max(entry.end as u64);
            total += entry.len().unwrap_or(0);
            entries.push(entry);
        }

        let span = highest + 1 - lowest;
        if span == 0 {
            return Err(EspromError::Format("samples span zero bytes".to_string()));
        }
        let needed = span.max(total);
        if needed > config.max_pool_bytes {
            return Err(EspromError::Format(format!(
                "{} samples need {} bytes in memory, more than the {}-byte limit",
                count, needed, config.max_pool_bytes
            )));
        }
        let pool_len = usize::try_from(needed).map_err(|_| {
            EspromError::Allocation(format!("{} bytes exceed the address space", needed))
        })?;
        debug!(
            "Size pass: {} samples, span {} bytes ({}..={}), {} bytes of sample data",
            count, span, lowest, highest, total
        );

        // fill pass
        let mut pool = ChunkPool::with_payload(pool_len, config.chunk_payload)?;
        let mut cursor = pool.cursor();
        let mut samples = Vec::new();
        samples
            .try_reserve_exact(entries.len())
            .map_err(|e| EspromError::Allocation(format!("sample table of {count}: {e}")))?;

        for entry in &entries {
            let len = entry.len().unwrap_or(0) as usize;
            let start = cursor.position();
            source.seek(SeekFrom::Start(entry.start as u64))?;

            let mut remaining = len;
            while remaining > 0 {
                let window = cursor.window_mut(&mut pool);
                let n = window.len().min(remaining);
                if n == 0 {
                    return Err(EspromError::SeekOverrun {
                        target: (cursor.position() + remaining) as i128,
                        size: pool_len as u64,
                    });
                }
                source.read_exact(&mut window[..n])?;
                cursor.seek(&pool, SeekFrom::Current(n as i64))?;
                remaining -= n;
            }

            samples.push(SampleRange {
                start,
                end: start + len - 1,
            });
        }

        info!(
            "Built ROM catalog: {} samples in {} bytes across {} chunks",
            samples.len(),
            pool.len(),
            pool.chunk_count()
        );

        let cursor = pool.cursor();
        Ok(RomCatalog {
            pool,
            cursor,
            samples,
            span,
        })
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Bytes between the lowest and highest source address of any sample
    pub fn span(&self) -> u64 {
        self.span
    }

    /// The in-memory address space holding every sample
    pub fn pool(&self) -> &ChunkPool {
        &self.pool
    }

    /// Destination ranges, indexed by sample id
    pub fn samples(&self) -> &[SampleRange] {
        &self.samples
    }

    pub fn sample_range(&self, id: usize) -> Option<SampleRange> {
        self.samples.get(id).copied()
    }

    /// Cursor over sample `id` only
    pub fn sample_view(&self, id: usize) -> Result<SampleView<'_>> {
        let range = self.sample_range(id).ok_or(EspromError::OutOfRange {
            id,
            count: self.samples.len(),
        })?;

        let mut cursor = self.cursor;
        cursor.seek(&self.pool, SeekFrom::Start(range.start as u64))?;
        cursor.rebase(range.len());
        Ok(SampleView::new(self, cursor))
    }

    /// Owned copy of sample `id`
    pub fn sample_bytes(&self, id: usize) -> Result<Vec<u8>> {
        let mut view = self.sample_view(id)?;
        let mut bytes = Vec::with_capacity(view.len());
        loop {
            let window = view.next_window()?;
            if window.is_empty() {
                break;
            }
            bytes.extend_from_slice(window);
        }
        Ok(bytes)
    }
}

fn read_sample_count<R: Read + Seek>(source: &mut R, source_len: u64) -> Result<u16> {
    if source_len < SAMPLE_COUNT_OFFSET + 2 {
        return Err(EspromError::Format(format!(
            "{source_len}-byte source is too short for a ROM header"
        )));
    }
    source.seek(SeekFrom::Start(SAMPLE_COUNT_OFFSET))?;
    let mut raw = [0u8; 2];
    source.read_exact(&mut raw)?;
    Ok(decode_sample_count(raw))
}

fn read_entry<R: Read + Seek>(source: &mut R, index: u16) -> Result<DirectoryEntry> {
    source.seek(SeekFrom::Start(DirectoryEntry::offset_of(index)))?;
    let mut raw = [0u8; DIRECTORY_ENTRY_LEN];
    source.read_exact(&mut raw)?;
    DirectoryEntry::from_bytes(&raw)
}
