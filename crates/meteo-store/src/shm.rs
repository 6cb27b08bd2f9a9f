//! File-backed `MAP_SHARED` mappings. A path under `/dev/shm` gives a RAM-backed
//! segment that any process knowing the path can map.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

pub struct SharedRegion {
    ptr: *mut u8,
    len: usize,
    #[allow(dead_code)]
    file: File,
    path: PathBuf,
    /// Unlink the backing file on drop.
    owns_file: bool,
}

impl SharedRegion {
    /// Open the segment read-write, creating it if needed and sizing it to `size`.
    /// Returns whether the file already existed with exactly `size` bytes.
    pub fn create_or_open(path: &Path, size: usize) -> io::Result<(Self, bool)> {
        if size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size must be > 0"));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_permissions(std::fs::Permissions::from_mode(0o644))?;

        let existing = file.metadata()?.len() as usize == size;
        if !existing {
            file.set_len(size as u64)?;
        }
        let ptr = map(&file, size, libc::PROT_READ | libc::PROT_WRITE)?;
        Ok((Self { ptr, len: size, file, path: path.to_path_buf(), owns_file: true }, existing))
    }

    /// Map an existing segment read-only. The file size determines the mapping size.
    pub fn open_read_only(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        let size = file.metadata()?.len() as usize;
        if size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "segment file is empty"));
        }
        let ptr = map(&file, size, libc::PROT_READ)?;
        Ok(Self { ptr, len: size, file, path: path.to_path_buf(), owns_file: false })
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn map(file: &File, size: usize, prot: libc::c_int) -> io::Result<*mut u8> {
    // SAFETY: fd is valid for the call; the kernel validates size and protection.
    let ptr = unsafe {
        libc::mmap(std::ptr::null_mut(), size, prot, libc::MAP_SHARED, file.as_raw_fd(), 0)
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(ptr as *mut u8)
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len come from a successful mmap and are unmapped exactly once.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
        if self.owns_file {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

// SAFETY: the mapping lives as long as the region; concurrent access discipline is
// enforced by the store types built on top.
unsafe impl Send for SharedRegion {}
