//! Random-access file I/O on top of `O_DIRECT`
//!
//! [`DirectFile`] hides the sector alignment that direct I/O imposes. Every
//! transfer against storage moves one whole [`BLOCKSIZE`] block starting at
//! a sector-aligned offset, while callers read and write arbitrary byte
//! ranges at arbitrary positions.
//!
//! Each handle caches exactly one block. A read or write that leaves the
//! cached region flushes the block (if dirty) and refills it at the
//! sector-aligned floor of the current position. Unaligned writes are
//! read-modify-write cycles against that block, which is why write-only
//! access is upgraded to read-write.
//!
//! Block-sized write-back can leave padding past the logical end of the
//! file; [`DirectFile::close`] trims it again.

use crate::block::{align_down, AlignedBlock, SharedBlock, ALIGNMENT, BLOCKSIZE};
use crate::error::{EspromError, Result};
use crate::registry::FileRegistry;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, SeekFrom};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

/// Requested access for [`DirectOpenOptions`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    /// Upgraded to [`AccessMode::ReadWrite`] at open time
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    /// Unaligned writes need to read back the surrounding block
    fn effective(self) -> Self {
        match self {
            AccessMode::WriteOnly => AccessMode::ReadWrite,
            other => other,
        }
    }
}

/// Builder for [`DirectFile`]
///
/// # Examples
///
/// ```rust,no_run
/// use esprom_rs::{AccessMode, DirectOpenOptions, SharedBlock};
///
/// # fn main() -> esprom_rs::Result<()> {
/// let block = SharedBlock::allocate()?;
/// let mut out = DirectOpenOptions::new()
///     .access(AccessMode::WriteOnly)
///     .create(true)
///     .mode(0o644)
///     .shared_block(&block)
///     .open("/data/out.bin")?;
///
/// out.write(b"hello")?;
/// out.close()?;
/// # Ok(())
/// # }
/// ```
///
/// The builder only borrows a shared block; the file takes its own handle
/// when it is opened, so a retained builder never keeps a block alive.
#[derive(Debug, Clone)]
pub struct DirectOpenOptions<'b> {
    access: AccessMode,
    create: bool,
    truncate: bool,
    mode: u32,
    shared: Option<&'b SharedBlock>,
    allow_buffered_fallback: bool,
}

impl<'b> DirectOpenOptions<'b> {
    /// Read-only, no creation, mode `0o644`, private block, buffered fallback on
    pub fn new() -> Self {
        DirectOpenOptions {
            access: AccessMode::ReadOnly,
            create: false,
            truncate: false,
            mode: 0o644,
            shared: None,
            allow_buffered_fallback: true,
        }
    }

    pub fn access(mut self, access: AccessMode) -> Self {
        self.access = access;
        self
    }

    /// Create the file if it does not exist (needs write access)
    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    /// Truncate an existing file to zero length (needs write access)
    pub fn truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }

    /// Permission bits used when the file is created
    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    /// Stage transfers through an existing block instead of allocating one
    pub fn shared_block(mut self, block: &'b SharedBlock) -> Self {
        self.shared = Some(block);
        self
    }

    /// Retry without `O_DIRECT` when the filesystem rejects it (tmpfs does)
    pub fn allow_buffered_fallback(mut self, allow: bool) -> Self {
        self.allow_buffered_fallback = allow;
        self
    }

    /// Open `path`, drawing the file identity from the process-wide registry
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<DirectFile> {
        self.open_in(FileRegistry::global(), path)
    }

    /// Open `path`, drawing the file identity from `registry`
    pub fn open_in<P: AsRef<Path>>(&self, registry: &FileRegistry, path: P) -> Result<DirectFile> {
        let path = path.as_ref();
        let open_err = |source: std::io::Error| EspromError::Open {
            path: path.to_path_buf(),
            source,
        };

        let access = self.access.effective();

        let block = match &self.shared {
            Some(shared) => shared.share(),
            None => SharedBlock::allocate()
                .map_err(|e| open_err(std::io::Error::new(ErrorKind::OutOfMemory, e)))?,
        };

        let (file, direct) = self.open_file(path, access).map_err(open_err)?;
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);
        let id = registry.next_id();

        debug!(
            "Opened {:?} as file {} ({:?}, direct: {}, size: {}, block refs: {})",
            path,
            id,
            access,
            direct,
            size,
            block.ref_count()
        );

        Ok(DirectFile {
            file: Some(file),
            path: path.to_path_buf(),
            id,
            position: 0,
            size,
            block,
            direct,
            writable: access == AccessMode::ReadWrite,
        })
    }

    fn open_file(&self, path: &Path, access: AccessMode) -> std::io::Result<(File, bool)> {
        let mut options = OpenOptions::new();
        options
            .read(true)
            .write(access == AccessMode::ReadWrite)
            .create(self.create)
            .truncate(self.truncate)
            .mode(self.mode);

        match options.clone().custom_flags(libc::O_DIRECT).open(path) {
            Ok(file) => Ok((file, true)),
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) && self.allow_buffered_fallback => {
                warn!(
                    "Filesystem holding {:?} rejected O_DIRECT, falling back to buffered I/O",
                    path
                );
                options.open(path).map(|file| (file, false))
            }
            Err(e) => Err(e),
        }
    }
}

impl Default for DirectOpenOptions<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// A file accessed through one sector-aligned staging block
///
/// The logical position always stays within `0..=len()`.
///
/// Files are opened with `O_DIRECT`. Filesystems that reject it (tmpfs)
/// are reopened through the page cache with a warning unless
/// [`DirectOpenOptions::allow_buffered_fallback`] is turned off; check
/// [`is_direct`](DirectFile::is_direct) when alignment must be enforced.
pub struct DirectFile {
    /// `None` once the file has been closed
    file: Option<File>,
    path: PathBuf,
    id: u64,
    position: u64,
    size: u64,
    block: SharedBlock,
    direct: bool,
    writable: bool,
}

impl DirectFile {
    /// Open an existing file read-only
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        DirectOpenOptions::new().open(path)
    }

    /// Open or create a file for reading and writing
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        DirectOpenOptions::new()
            .access(AccessMode::ReadWrite)
            .create(true)
            .open(path)
    }

    /// Identity drawn from the registry at open time
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Logical position
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Logical size, including bytes still buffered in the block
    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Whether the descriptor was opened with `O_DIRECT`
    pub fn is_direct(&self) -> bool {
        self.direct
    }

    /// The staging block (share it to open further files on the same block)
    pub fn block(&self) -> &SharedBlock {
        &self.block
    }

    /// Move the logical position; the result is clamped into `0..=len()`
    pub fn seek(&mut self, pos: SeekFrom) -> u64 {
        let target: i128 = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
            SeekFrom::End(delta) => self.size as i128 + delta as i128,
        };
        self.position = target.clamp(0, self.size as i128) as u64;
        self.position
    }

    /// Read up to `buf.len()` bytes at the logical position
    ///
    /// Returns fewer bytes than requested only at end of file.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let file = open_handle(&self.file)?;
        let block = self.block.clone();
        let mut block = block.borrow_mut();

        let mut total = 0;
        while total < buf.len() && self.position < self.size {
            if !block.covers(self.id, self.position) {
                write_back(file, self.id, &mut block)?;
                refill(file, self.id, self.position, &mut block, false)?;
                if !block.covers(self.id, self.position) {
                    break;
                }
            }

            let within = (self.position - block.offset()) as usize;
            let until_eof = self.size - self.position;
            let n = (buf.len() - total)
                .min(block.valid_len() - within)
                .min(usize::try_from(until_eof).unwrap_or(usize::MAX));

            buf[total..total + n].copy_from_slice(&block.data()[within..within + n]);
            self.position += n as u64;
            total += n;
        }

        Ok(total)
    }

    /// Write `buf` at the logical position, growing the file if needed
    ///
    /// Data is staged in the block and reaches storage on [`flush`], on a
    /// refill that moves the block elsewhere, or on [`close`].
    ///
    /// [`flush`]: DirectFile::flush
    /// [`close`]: DirectFile::close
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let file = open_handle(&self.file)?;
        if !self.writable {
            return Err(EspromError::Io(std::io::Error::new(
                ErrorKind::PermissionDenied,
                format!("{:?} was opened read-only", self.path),
            )));
        }
        let block = self.block.clone();
        let mut block = block.borrow_mut();

        let mut total = 0;
        while total < buf.len() {
            if block.covers_for_write(self.id, self.position) {
                block.extend_to_full();
            } else {
                write_back(file, self.id, &mut block)?;
                refill(file, self.id, self.position, &mut block, true)?;
            }

            let within = (self.position - block.offset()) as usize;
            let n = (buf.len() - total).min(block.valid_len() - within);

            block.data_mut()[within..within + n].copy_from_slice(&buf[total..total + n]);
            if n > 0 {
                block.mark_dirty();
            }

            self.position += n as u64;
            total += n;
            if self.position > self.size {
                self.size = self.position;
            }
        }

        Ok(total)
    }

    /// Write the block back if it is dirty
    ///
    /// Fails with [`EspromError::CrossOwnerConflict`] when the block holds
    /// another file's unflushed data. On failure the block stays dirty so
    /// the flush can be retried.
    pub fn flush(&mut self) -> Result<()> {
        let file = open_handle(&self.file)?;
        let mut block = self.block.borrow_mut();
        write_back(file, self.id, &mut block)
    }

    /// Flush, release the block and trim storage to the logical size
    ///
    /// The block is always released and the file always trimmed; the first
    /// error encountered is returned. To retry a failed write-back, call
    /// [`flush`](DirectFile::flush) before closing.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };

        let flushed = {
            let mut block = self.block.borrow_mut();
            if block.owner() == Some(self.id) {
                let result = write_back(&file, self.id, &mut block);
                // no later handle can carry this identity
                block.mark_clean();
                block.invalidate();
                result
            } else {
                Ok(())
            }
        };

        let trimmed = if self.writable {
            file.set_len(self.size).map_err(EspromError::from)
        } else {
            Ok(())
        };
        debug!(
            "Closed file {} ({:?}), size {}",
            self.id, self.path, self.size
        );
        drop(file);

        flushed.and(trimmed)
    }
}

impl Drop for DirectFile {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Implicit close of {:?} failed: {}", self.path, e);
        }
    }
}

impl std::fmt::Debug for DirectFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectFile")
            .field("path", &self.path)
            .field("id", &self.id)
            .field("position", &self.position)
            .field("size", &self.size)
            .field("direct", &self.direct)
            .field("writable", &self.writable)
            .field("open", &self.file.is_some())
            .finish()
    }
}

impl std::io::Read for DirectFile {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        DirectFile::read(self, buf).map_err(Into::into)
    }
}

impl std::io::Write for DirectFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        DirectFile::write(self, buf).map_err(Into::into)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        DirectFile::flush(self).map_err(Into::into)
    }
}

impl std::io::Seek for DirectFile {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        Ok(DirectFile::seek(self, pos))
    }
}

fn open_handle(file: &Option<File>) -> Result<&File> {
    file.as_ref().ok_or_else(|| {
        EspromError::Io(std::io::Error::new(
            ErrorKind::NotConnected,
            "file already closed",
        ))
    })
}

/// Store a dirty block at its aligned offset as one full block
fn write_back(file: &File, id: u64, block: &mut AlignedBlock) -> Result<()> {
    if !block.is_dirty() {
        return Ok(());
    }

    let owner = block.owner().unwrap_or(u64::MAX);
    if owner != id {
        return Err(EspromError::CrossOwnerConflict {
            owner,
            requester: id,
        });
    }

    file.write_all_at(block.data(), block.offset())?;
    block.mark_clean();
    trace!("Flushed block at {} for file {}", block.offset(), id);
    Ok(())
}

/// Load the block holding `position` of file `id`
///
/// The unread tail is zeroed. For writes the whole block becomes valid so
/// data can be appended past end of file.
fn refill(
    file: &File,
    id: u64,
    position: u64,
    block: &mut AlignedBlock,
    for_write: bool,
) -> Result<()> {
    let offset = align_down(position);
    block.invalidate();

    let read = read_block_at(file, block.data_mut(), offset)?;
    block.data_mut()[read..].fill(0);

    let valid = if for_write { BLOCKSIZE } else { read };
    block.assign(id, offset, valid);
    trace!(
        "Refilled block at {} for file {} ({} bytes from storage)",
        offset,
        id,
        read
    );
    Ok(())
}

/// Read one block at a sector-aligned offset; short only at end of file
fn read_block_at(file: &File, buf: &mut [u8], offset: u64) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => {
                filled += n;
                // a partial sector means end of file; further direct reads
                // would be unaligned
                if n % ALIGNMENT != 0 {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn scratch() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scratch.bin");
        (dir, path)
    }

    #[test]
    fn test_open_missing_file_fails() {
        let (_dir, path) = scratch();
        let err = DirectFile::open(&path).unwrap_err();
        assert!(matches!(err, EspromError::Open { .. }));
    }

    #[test]
    fn test_write_only_is_upgraded() {
        let (_dir, path) = scratch();
        let mut file = DirectOpenOptions::new()
            .access(AccessMode::WriteOnly)
            .create(true)
            .open(&path)
            .unwrap();

        file.write(b"abcdef").unwrap();
        file.seek(SeekFrom::Start(2));
        let mut buf = [0u8; 3];
        assert_eq!(file.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"cde");
    }

    #[test]
    fn test_read_only_rejects_writes_and_keeps_size() {
        let (_dir, path) = scratch();
        std::fs::write(&path, vec![7u8; 600]).unwrap();

        let mut file = DirectFile::open(&path).unwrap();
        let err = file.write(b"nope").unwrap_err();
        assert!(matches!(err, EspromError::Io(ref e) if e.kind() == ErrorKind::PermissionDenied));
        file.close().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![7u8; 600]);
    }

    #[test]
    fn test_seek_clamps() {
        let (_dir, path) = scratch();
        std::fs::write(&path, vec![1u8; 100]).unwrap();
        let mut file = DirectFile::open(&path).unwrap();

        assert_eq!(file.seek(SeekFrom::Start(1000)), 100);
        assert_eq!(file.seek(SeekFrom::Current(-1000)), 0);
        assert_eq!(file.seek(SeekFrom::End(-10)), 90);
        assert_eq!(file.seek(SeekFrom::End(10)), 100);
        assert_eq!(file.seek(SeekFrom::Current(i64::MIN)), 0);
    }

    #[test]
    fn test_read_stops_at_eof() {
        let (_dir, path) = scratch();
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let mut file = DirectFile::open(&path).unwrap();
        file.seek(SeekFrom::Start(4990));
        let mut buf = [0u8; 64];
        assert_eq!(file.read(&mut buf).unwrap(), 10);
        assert_eq!(&buf[..10], &data[4990..]);
        assert_eq!(file.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_unaligned_read_spans_blocks() {
        let (_dir, path) = scratch();
        let data: Vec<u8> = (0..20_000u32).map(|i| (i * 7 % 256) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let mut file = DirectFile::open(&path).unwrap();
        file.seek(SeekFrom::Start(777));
        let mut buf = vec![0u8; 9000];
        assert_eq!(file.read(&mut buf).unwrap(), 9000);
        assert_eq!(&buf[..], &data[777..9777]);
        assert_eq!(file.position(), 9777);
    }

    #[test]
    fn test_write_extends_and_close_trims() {
        let (_dir, path) = scratch();
        std::fs::write(&path, vec![9u8; 1000]).unwrap();

        let mut file = DirectFile::create(&path).unwrap();
        file.seek(SeekFrom::End(0));
        assert_eq!(file.write(&[5u8; 300]).unwrap(), 300);
        assert_eq!(file.len(), 1300);
        file.close().unwrap();

        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(on_disk.len(), 1300);
        assert!(on_disk[..1000].iter().all(|&b| b == 9));
        assert!(on_disk[1000..].iter().all(|&b| b == 5));
    }

    #[test]
    fn test_flush_leaves_padding_until_close() {
        let (_dir, path) = scratch();
        let mut file = DirectFile::create(&path).unwrap();
        file.write(b"hello").unwrap();
        file.flush().unwrap();
        assert!(!file.block().borrow().is_dirty());

        assert_eq!(std::fs::metadata(&path).unwrap().len(), BLOCKSIZE as u64);
        file.close().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn test_shared_block_cross_owner_conflict() {
        let (dir, path) = scratch();
        let other = dir.path().join("other.bin");
        std::fs::write(&other, vec![3u8; 100]).unwrap();

        let registry = FileRegistry::new();
        let block = SharedBlock::allocate().unwrap();
        let mut writer = DirectOpenOptions::new()
            .access(AccessMode::ReadWrite)
            .create(true)
            .shared_block(&block)
            .open_in(&registry, &path)
            .unwrap();
        let mut reader = DirectOpenOptions::new()
            .shared_block(&block)
            .open_in(&registry, &other)
            .unwrap();
        assert_eq!(block.ref_count(), 3);

        writer.write(b"pending").unwrap();

        let mut buf = [0u8; 4];
        let err = reader.read(&mut buf).unwrap_err();
        assert!(matches!(err, EspromError::CrossOwnerConflict { .. }));
        let err = reader.flush().unwrap_err();
        assert!(matches!(err, EspromError::CrossOwnerConflict { .. }));

        writer.flush().unwrap();
        assert_eq!(reader.read(&mut buf).unwrap(), 4);
        assert_eq!(buf, [3u8; 4]);

        writer.close().unwrap();
        reader.close().unwrap();
        assert_eq!(block.ref_count(), 1);
        assert_eq!(std::fs::read(&path).unwrap(), b"pending");
    }

    #[test]
    fn test_failed_flush_keeps_block_dirty() {
        let full = Path::new("/dev/full");
        if !full.exists() {
            return;
        }

        let mut file = DirectOpenOptions::new()
            .access(AccessMode::WriteOnly)
            .open(full)
            .unwrap();
        file.write(b"abc").unwrap();

        let err = file.flush().unwrap_err();
        assert!(matches!(err, EspromError::Io(_)));
        assert!(file.block().borrow().is_dirty());

        // still dirty, so a second attempt writes again and fails again
        assert!(file.flush().is_err());
        assert!(file.block().borrow().is_dirty());
    }

    #[test]
    fn test_builder_does_not_hold_shared_block() {
        let (_dir, path) = scratch();
        std::fs::write(&path, b"x").unwrap();
        let block = SharedBlock::allocate().unwrap();

        let options = DirectOpenOptions::new().shared_block(&block);
        assert_eq!(block.ref_count(), 1);

        let file = options.open(&path).unwrap();
        assert_eq!(block.ref_count(), 2);
        assert!(file.block().same_block(&block));

        drop(file);
        assert_eq!(block.ref_count(), 1);
        drop(options);
    }

    #[test]
    fn test_strict_direct_open_never_falls_back() {
        let (_dir, path) = scratch();
        std::fs::write(&path, vec![4u8; 700]).unwrap();

        // either the filesystem takes O_DIRECT or the open fails outright
        match DirectOpenOptions::new()
            .allow_buffered_fallback(false)
            .open(&path)
        {
            Ok(file) => assert!(file.is_direct()),
            Err(err) => assert!(matches!(err, EspromError::Open { .. })),
        }

        // the default tolerates filesystems without O_DIRECT
        let mut file = DirectFile::open(&path).unwrap();
        let mut buf = [0u8; 700];
        assert_eq!(file.read(&mut buf).unwrap(), 700);
    }

    #[test]
    fn test_drop_closes_and_trims() {
        let (_dir, path) = scratch();
        {
            let mut file = DirectFile::create(&path).unwrap();
            file.write(&[1u8; 10]).unwrap();
        }
        assert_eq!(std::fs::read(&path).unwrap(), vec![1u8; 10]);
    }

    #[test]
    fn test_ids_come_from_registry() {
        let (_dir, path) = scratch();
        std::fs::write(&path, b"x").unwrap();
        let registry = FileRegistry::new();
        let a = DirectOpenOptions::new().open_in(&registry, &path).unwrap();
        let b = DirectOpenOptions::new().open_in(&registry, &path).unwrap();
        assert!(b.id() > a.id());
        assert_eq!(registry.issued(), 2);
    }
}
