//! Whole-file copy through an aligned scratch buffer
//!
//! Direct I/O wants sector-sized writes, so every write is rounded up to
//! the next [`ALIGNMENT`] multiple. The destination is truncated to the
//! exact source size afterwards.

use crate::block::{align_up, AlignedBuf, ALIGNMENT, BLOCKSIZE};
use crate::error::{EspromError, Result};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use tracing::{debug, warn};

/// Copy `from` to `to`, creating `to` with permission bits `mode`
///
/// Returns the number of bytes copied.
pub fn bulk_copy<P: AsRef<Path>, Q: AsRef<Path>>(from: P, to: Q, mode: u32) -> Result<u64> {
    let from = from.as_ref();
    let to = to.as_ref();
    let open_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| EspromError::Open { path, source }
    };

    let size = std::fs::metadata(from).map_err(open_err(from))?.len();
    let scratch_len = if size < BLOCKSIZE as u64 {
        align_up(size as usize).max(ALIGNMENT)
    } else {
        BLOCKSIZE
    };
    let mut scratch = AlignedBuf::zeroed(scratch_len)?;

    let mut src = File::open(from).map_err(open_err(from))?;
    let mut dst = open_destination(to, mode).map_err(open_err(to))?;

    let mut copied = 0u64;
    loop {
        let buf = scratch.as_mut_slice();
        let n = fill(&mut src, buf)?;
        if n == 0 {
            break;
        }

        let padded = align_up(n).min(buf.len());
        buf[n..padded].fill(0);
        let written = dst.write(&buf[..padded])?;
        if written != padded {
            return Err(EspromError::Io(std::io::Error::new(
                ErrorKind::WriteZero,
                format!("short write to {to:?}: {written} of {padded} bytes"),
            )));
        }

        copied += n as u64;
        if n < buf.len() {
            break;
        }
    }

    dst.set_len(size)?;
    debug!("Copied {} bytes from {:?} to {:?}", copied, from, to);
    Ok(copied)
}

fn open_destination(path: &Path, mode: u32) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).mode(mode);

    match options.clone().custom_flags(libc::O_DIRECT).open(path) {
        Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
            warn!(
                "Filesystem holding {:?} rejected O_DIRECT, copying through the page cache",
                path
            );
            options.open(path)
        }
        other => other,
    }
}

/// Read until `buf` is full or the source is exhausted
fn fill(src: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
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

    fn copy_roundtrip(len: usize) {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("from.bin");
        let to = dir.path().join("to.bin");
        let data: Vec<u8> = (0..len).map(|i| (i % 241) as u8).collect();
        std::fs::write(&from, &data).unwrap();

        assert_eq!(bulk_copy(&from, &to, 0o644).unwrap(), len as u64);
        assert_eq!(std::fs::read(&to).unwrap(), data);
    }

    #[test]
    fn test_copy_small_file() {
        copy_roundtrip(100);
    }

    #[test]
    fn test_copy_multi_block_file_with_tail() {
        copy_roundtrip(3 * BLOCKSIZE + 1234);
    }

    #[test]
    fn test_copy_empty_file() {
        copy_roundtrip(0);
    }

    #[test]
    fn test_copy_shrinks_existing_destination() {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("from.bin");
        let to = dir.path().join("to.bin");
        std::fs::write(&from, b"short").unwrap();
        std::fs::write(&to, vec![0xEE; 10_000]).unwrap();

        bulk_copy(&from, &to, 0o644).unwrap();
        assert_eq!(std::fs::read(&to).unwrap(), b"short");
    }

    #[test]
    fn test_missing_source_is_open_error() {
        let dir = TempDir::new().unwrap();
        let err = bulk_copy(dir.path().join("nope"), dir.path().join("out"), 0o644).unwrap_err();
        assert!(matches!(err, EspromError::Open { .. }));
    }
}
