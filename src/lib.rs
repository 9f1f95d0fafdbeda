//! # esprom-rs - Direct I/O and ROM sample extraction for embedded Linux
//!
//! `esprom-rs` loads sample data out of ESPROM ROM containers on systems
//! whose storage only accepts sector-aligned (`O_DIRECT`) transfers:
//!
//! - **[`DirectFile`]** - random-access reads and writes at any offset on top
//!   of `O_DIRECT`, staged through one 4 KiB aligned block per handle
//! - **[`SharedBlock`]** - reference-counted staging block that several
//!   handles may share
//! - **[`ChunkPool`] / [`ChunkCursor`]** - a growable address space built from
//!   fixed-size chunks, with cheap sequential seeks
//! - **[`RomCatalog`] / [`SampleView`]** - two-pass ROM loader and per-sample
//!   windowed readers
//! - **[`bulk_copy`]** - whole-file copy through an aligned scratch buffer
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use esprom_rs::{RomCatalog, Result};
//!
//! # fn main() -> Result<()> {
//! let catalog = RomCatalog::open("/roms/strings.bin")?;
//! println!("{} samples", catalog.len());
//!
//! let mut view = catalog.sample_view(3)?;
//! let mut total = 0;
//! loop {
//!     let window = view.next_window()?;
//!     if window.is_empty() {
//!         break;
//!     }
//!     total += window.len();
//! }
//! assert_eq!(total, view.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Unaligned writes on direct I/O
//!
//! ```rust,no_run
//! use esprom_rs::{DirectFile, Result};
//! use std::io::SeekFrom;
//!
//! # fn main() -> Result<()> {
//! let mut file = DirectFile::create("/data/patch.bin")?;
//! file.seek(SeekFrom::Start(1000));
//! file.write(b"unaligned")?;
//! // flushes the staging block and trims block padding
//! file.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Thread safety
//!
//! Nothing in this crate locks. [`SharedBlock`] (and every [`DirectFile`]
//! holding one) is `!Send`; a [`SampleView`] borrows its catalog.

// Core implementation
pub mod core;

// Re-export core modules internally so crate:: paths in core still work
#[allow(unused_imports)]
pub(crate) use crate::core::{block, catalog, chunk, copy, error, header, io, registry, sample};

pub use crate::core::{
    block::{SharedBlock, ALIGNMENT, BLOCKSIZE},
    catalog::{CatalogConfig, RomCatalog, SampleRange, DEFAULT_MAX_POOL_BYTES},
    chunk::{ChunkCursor, ChunkPool, DEFAULT_CHUNK_PAYLOAD},
    copy::bulk_copy,
    error::{EspromError, Result},
    header::DirectoryEntry,
    io::{AccessMode, DirectFile, DirectOpenOptions},
    registry::FileRegistry,
    sample::SampleView,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
