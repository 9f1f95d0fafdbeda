//! Core implementation
//!
//! - [`block`] - sector-aligned staging blocks and their shared handle
//! - [`registry`] - file identities
//! - [`io`] - [`DirectFile`](io::DirectFile), unaligned random access over `O_DIRECT`
//! - [`chunk`] - chunked in-memory address space and cursors
//! - [`header`] - ROM container layout
//! - [`catalog`] - two-pass ROM loader
//! - [`sample`] - per-sample views
//! - [`copy`] - whole-file copy

pub mod block;
pub mod catalog;
pub mod chunk;
pub mod copy;
pub mod error;
pub mod header;
pub mod io;
pub mod registry;
pub mod sample;

pub use block::{SharedBlock, ALIGNMENT, BLOCKSIZE};
pub use catalog::{CatalogConfig, RomCatalog, SampleRange, DEFAULT_MAX_POOL_BYTES};
pub use chunk::{ChunkCursor, ChunkPool, DEFAULT_CHUNK_PAYLOAD};
pub use copy::bulk_copy;
pub use error::{EspromError, Result};
pub use io::{AccessMode, DirectFile, DirectOpenOptions};
pub use registry::FileRegistry;
pub use sample::SampleView;
