//! File identity registry
//!
//! Every [`DirectFile`](crate::core::io::DirectFile) receives a unique
//! identity when it is opened. The identity tags the data a file leaves in
//! a shared block so another file never mistakes it for its own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

/// Hands out strictly increasing file identities
#[derive(Debug, Default)]
pub struct FileRegistry {
    next: AtomicU64,
}

impl FileRegistry {
    pub const fn new() -> Self {
        FileRegistry {
            next: AtomicU64::new(0),
        }
    }

    /// Process-wide registry used by [`DirectFile::open`](crate::core::io::DirectFile::open)
    ///
    /// Files that share a block must draw their identities from the same
    /// registry.
    pub fn global() -> &'static FileRegistry {
        static GLOBAL: OnceLock<FileRegistry> = OnceLock::new();
        GLOBAL.get_or_init(FileRegistry::new)
    }

    /// Allocate the next identity
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of identities handed out so far
    pub fn issued(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}
