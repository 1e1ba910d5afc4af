//! Anonymous Shared Memory Allocation
//!
//! Provides file-descriptor-backed memory segments that can be mapped by both
//! this process and the compositor. Used for the screencopy pixel buffer and
//! for handing the serialized XKB keymap to the virtual-keyboard device.
//!
//! The returned fd is owned by the caller. The usual lifecycle is: allocate,
//! map, pass the fd to the compositor in a binding request, then drop the fd
//! locally. The mapping stays valid after the fd is closed.
//!
//! # Platform Support
//!
//! Requires Linux 3.17+ with memfd_create syscall support.

use std::os::fd::OwnedFd;

use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::unistd::ftruncate;
use thiserror::Error;
use tracing::debug;

/// Error type for shared-memory allocation
///
/// There is a single failure mode: the segment could not be created or sized.
#[derive(Error, Debug)]
#[error("shared memory allocation of {size} bytes failed: {source}")]
pub struct ShmError {
    /// Requested segment size
    pub size: usize,
    /// Underlying errno
    #[source]
    pub source: nix::Error,
}

/// Allocate an anonymous memory segment of `size` bytes
///
/// The segment is created with `memfd_create` and truncated to the requested
/// size. Both sides of the fd may `mmap` it with read/write access.
pub fn alloc_fd(size: usize) -> Result<OwnedFd, ShmError> {
    let fd = memfd_create(c"wayrfb-shm", MemFdCreateFlag::MFD_CLOEXEC)
        .map_err(|source| ShmError { size, source })?;

    ftruncate(&fd, size as i64).map_err(|source| ShmError { size, source })?;

    debug!("allocated {} byte shm segment", size);

    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Seek, SeekFrom, Write};

    #[test]
    fn test_alloc_fd_size() {
        let fd = alloc_fd(4096).unwrap();
        let file = File::from(fd);
        assert_eq!(file.metadata().unwrap().len(), 4096);
    }

    #[test]
    fn test_alloc_fd_read_write() {
        let fd = alloc_fd(128).unwrap();
        let mut file = File::from(fd);

        file.write_all(b"frame data").unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let mut buf = [0u8; 10];
        file.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"frame data");
    }

    #[test]
    fn test_mapping_survives_fd_close() {
        // The compositor-side contract: the local fd is closed right after the
        // binding call while the mapping continues to be written through.
        let fd = alloc_fd(64).unwrap();
        let file = File::from(fd);
        let mut map = unsafe { memmap2::MmapOptions::new().len(64).map_mut(&file).unwrap() };
        drop(file);

        map[0] = 0xab;
        assert_eq!(map[0], 0xab);
    }
}
