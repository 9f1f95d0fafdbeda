//! Sector-aligned staging blocks for direct I/O
//!
//! `O_DIRECT` requires the user buffer, the file offset and the transfer
//! length to be multiples of the device sector size. `Vec<u8>` only
//! guarantees byte alignment, so the block storage is allocated through
//! `std::alloc` with an explicit [`Layout`].
//!
//! A block is shared between file handles through [`SharedBlock`], a
//! reference-counted handle. The last handle to be released frees the
//! storage. There is no internal locking: a `SharedBlock` is `!Send`, and
//! files sharing one must not be used in an interleaved fashion while the
//! block is dirty (see [`crate::core::io::DirectFile::flush`]).

use crate::error::{EspromError, Result};
use std::alloc::{self, Layout};
use std::cell::{Ref, RefCell, RefMut};
use std::ptr::NonNull;
use std::rc::Rc;

/// Device sector size. File offsets handed to storage are multiples of this.
pub const ALIGNMENT: usize = 512;

/// Size of one staging block. Must be a multiple of [`ALIGNMENT`].
pub const BLOCKSIZE: usize = 4096;

const _: () = assert!(BLOCKSIZE % ALIGNMENT == 0);

/// Round `offset` down to the previous sector boundary
#[inline]
pub fn align_down(offset: u64) -> u64 {
    offset - offset % ALIGNMENT as u64
}

/// Round `len` up to the next sector boundary
#[inline]
pub fn align_up(len: usize) -> usize {
    len.div_ceil(ALIGNMENT) * ALIGNMENT
}

/// Heap memory aligned to [`ALIGNMENT`]
pub(crate) struct AlignedBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl AlignedBuf {
    /// Allocate `size` zeroed bytes, rounded up to a whole number of sectors
    pub(crate) fn zeroed(size: usize) -> Result<Self> {
        let size = align_up(size.max(1));
        let layout = Layout::from_size_align(size, ALIGNMENT)
            .map_err(|e| EspromError::Allocation(format!("invalid layout: {e}")))?;

        // SAFETY: `layout` has a non-zero size (at least one sector) and a
        // power-of-two alignment.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            EspromError::Allocation(format!("{size} bytes aligned to {ALIGNMENT}"))
        })?;

        Ok(AlignedBuf { ptr, layout })
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` points to `layout.size()` initialized bytes owned by
        // `self`; the borrow of `self` bounds the slice lifetime.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // SAFETY: `ptr` was returned by `alloc_zeroed` with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// One [`BLOCKSIZE`] staging region plus the bookkeeping describing which
/// part of which file it currently caches.
pub struct AlignedBlock {
    buf: AlignedBuf,
    /// Identity of the file that last filled this block
    owner: Option<u64>,
    /// Aligned file offset of `buf[0]`
    offset: u64,
    /// Number of valid bytes starting at `offset`
    valid: usize,
    dirty: bool,
}

impl AlignedBlock {
    fn new() -> Result<Self> {
        Ok(AlignedBlock {
            buf: AlignedBuf::zeroed(BLOCKSIZE)?,
            owner: None,
            offset: 0,
            valid: 0,
            dirty: false,
        })
    }

    /// Identity of the file whose data the block holds
    pub fn owner(&self) -> Option<u64> {
        self.owner
    }

    /// Aligned file offset the block caches
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Valid byte count (never exceeds [`BLOCKSIZE`])
    pub fn valid_len(&self) -> usize {
        self.valid
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether the block holds `position` of file `file_id`
    pub(crate) fn covers(&self, file_id: u64, position: u64) -> bool {
        self.valid > 0
            && self.owner == Some(file_id)
            && position >= self.offset
            && position < self.offset + self.valid as u64
    }

    /// Whether a write at `position` of `file_id` can land in this block
    ///
    /// Unlike [`covers`](Self::covers) this accepts positions past the valid
    /// bytes: the tail of a refilled block is zeroed and may be appended to.
    pub(crate) fn covers_for_write(&self, file_id: u64, position: u64) -> bool {
        self.valid > 0
            && self.owner == Some(file_id)
            && position >= self.offset
            && position < self.offset + BLOCKSIZE as u64
    }

    /// Treat the whole block as valid (its unread tail is already zeroed)
    pub(crate) fn extend_to_full(&mut self) {
        self.valid = BLOCKSIZE;
    }

    /// Record that the block now caches `valid` bytes of `file_id` at `offset`
    pub(crate) fn assign(&mut self, file_id: u64, offset: u64, valid: usize) {
        debug_assert_eq!(offset % ALIGNMENT as u64, 0);
        debug_assert!(valid <= BLOCKSIZE);
        self.owner = Some(file_id);
        self.offset = offset;
        self.valid = valid;
    }

    /// Forget the cached region so the next access refills
    pub(crate) fn invalidate(&mut self) {
        self.valid = 0;
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub(crate) fn data(&self) -> &[u8] {
        &self.buf.as_slice()[..BLOCKSIZE]
    }

    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf.as_mut_slice()[..BLOCKSIZE]
    }
}

impl std::fmt::Debug for AlignedBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBlock")
            .field("owner", &self.owner)
            .field("offset", &self.offset)
            .field("valid", &self.valid)
            .field("dirty", &self.dirty)
            .finish()
    }
}

/// Reference-counted handle to an [`AlignedBlock`]
///
/// Cloning the handle attaches another user; dropping a handle releases
/// it. The storage is freed when the last handle goes away.
#[derive(Clone, Debug)]
pub struct SharedBlock {
    inner: Rc<RefCell<AlignedBlock>>,
}

impl SharedBlock {
    /// Allocate a fresh block with a reference count of one
    pub fn allocate() -> Result<Self> {
        Ok(SharedBlock {
            inner: Rc::new(RefCell::new(AlignedBlock::new()?)),
        })
    }

    /// Attach another user to the same block
    pub fn share(&self) -> Self {
        self.clone()
    }

    /// Release this handle; the block is freed if it was the last one
    pub fn release(self) {
        drop(self);
    }

    /// Number of live handles
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.inner)
    }

    /// Whether two handles refer to the same block
    pub fn same_block(&self, other: &SharedBlock) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn borrow(&self) -> Ref<'_, AlignedBlock> {
        self.inner.borrow()
    }

    pub(crate) fn borrow_mut(&self) -> RefMut<'_, AlignedBlock> {
        self.inner.borrow_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_storage_is_aligned() {
        let block = SharedBlock::allocate().unwrap();
        let guard = block.borrow();
        assert_eq!(guard.data().as_ptr() as usize % ALIGNMENT, 0);
        assert_eq!(guard.data().len(), BLOCKSIZE);
        assert!(guard.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_refcount_follows_handles() {
        let block = SharedBlock::allocate().unwrap();
        assert_eq!(block.ref_count(), 1);

        let second = block.share();
        assert_eq!(block.ref_count(), 2);
        assert!(block.same_block(&second));

        second.release();
        assert_eq!(block.ref_count(), 1);
    }

    #[test]
    fn test_covers_requires_owner_and_range() {
        let block = SharedBlock::allocate().unwrap();
        let mut guard = block.borrow_mut();
        assert!(!guard.covers(0, 0));

        guard.assign(7, 512, 1000);
        assert!(guard.covers(7, 512));
        assert!(guard.covers(7, 1511));
        assert!(!guard.covers(7, 1512));
        assert!(!guard.covers(7, 511));
        assert!(!guard.covers(8, 600));

        guard.invalidate();
        assert!(!guard.covers(7, 600));
    }

    #[test]
    fn test_alignment_helpers() {
        assert_eq!(align_down(0), 0);
        assert_eq!(align_down(511), 0);
        assert_eq!(align_down(513), 512);
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), 512);
        assert_eq!(align_up(512), 512);
        assert_eq!(align_up(4097), 4608);
    }
}
