// CXLMemSim shared memory region
//
// Two backings share one type:
// - POSIX named segments via shm_open() + mmap (the fabric message bus and
//   per-node data segments live under names like "/cxlmemsim_dist")
// - plain file backing via memmap2 (optional, for persistent data segments)

use crate::error::{CxlError, CxlResult};
use memmap2::MmapOptions;
use std::ffi::CString;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

enum Backing {
    Posix {
        fd: libc::c_int,
        ptr: *mut u8,
    },
    File {
        mmap: memmap2::MmapMut,
        _file: std::fs::File,
        path: PathBuf,
    },
}

/// A mapped shared memory region, unlinked on drop only by its owner.
pub struct ShmRegion {
    backing: Backing,
    size: usize,
    name: String,
    owner: bool,
    unlink_on_drop: bool,
}

// The region is raw shared bytes; callers synchronize through atomics and
// the directory locks, never through &mut aliasing.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

fn c_name(name: &str) -> CxlResult<CString> {
    CString::new(name).map_err(|e| CxlError::shm(format!("invalid shm name '{}': {}", name, e)))
}

fn map_fd(fd: libc::c_int, size: usize) -> CxlResult<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        unsafe { libc::close(fd) };
        return Err(CxlError::shm(format!(
            "mmap failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(ptr as *mut u8)
}

impl ShmRegion {
    /// Create a fresh POSIX segment, unlinking any stale one first.
    ///
    /// Used by the fabric coordinator, which owns the segment lifetime.
    pub fn create(name: &str, size: usize) -> CxlResult<Self> {
        let cname = c_name(name)?;
        unsafe { libc::shm_unlink(cname.as_ptr()) };

        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o666,
            )
        };
        if fd < 0 {
            return Err(CxlError::shm(format!(
                "shm_open('{}') failed: {}",
                name,
                std::io::Error::last_os_error()
            )));
        }

        if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(cname.as_ptr());
            }
            return Err(CxlError::shm(format!("ftruncate({}) failed: {}", size, err)));
        }

        let ptr = map_fd(fd, size)?;
        log::info!("Created shm segment '{}' ({} bytes)", name, size);

        Ok(Self {
            backing: Backing::Posix { fd, ptr },
            size,
            name: name.to_string(),
            owner: true,
            unlink_on_drop: true,
        })
    }

    /// Open an existing POSIX segment created by another node.
    pub fn open(name: &str, size: usize) -> CxlResult<Self> {
        let cname = c_name(name)?;
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0o666) };
        if fd < 0 {
            return Err(CxlError::shm(format!(
                "shm segment '{}' does not exist: {}",
                name,
                std::io::Error::last_os_error()
            )));
        }

        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } != 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(CxlError::shm(format!("fstat failed: {}", err)));
        }
        if (stat.st_size as usize) < size {
            unsafe { libc::close(fd) };
            return Err(CxlError::shm(format!(
                "shm segment '{}' too small: {} < {}",
                name, stat.st_size, size
            )));
        }

        let ptr = map_fd(fd, size)?;
        log::info!("Opened shm segment '{}' ({} bytes)", name, size);

        Ok(Self {
            backing: Backing::Posix { fd, ptr },
            size,
            name: name.to_string(),
            owner: false,
            unlink_on_drop: false,
        })
    }

    /// Create or reuse a POSIX segment.
    ///
    /// An existing segment of the exact size is reused with its contents
    /// preserved; a size mismatch recreates it. Used by the per-node data
    /// segments so a restarted node finds its memory image again.
    pub fn create_or_open(name: &str, size: usize) -> CxlResult<Self> {
        let cname = c_name(name)?;
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0o666) };
        if fd >= 0 {
            let mut stat: libc::stat = unsafe { std::mem::zeroed() };
            if unsafe { libc::fstat(fd, &mut stat) } == 0 && stat.st_size as usize == size {
                let ptr = map_fd(fd, size)?;
                log::info!("Reusing existing shm segment '{}'", name);
                return Ok(Self {
                    backing: Backing::Posix { fd, ptr },
                    size,
                    name: name.to_string(),
                    owner: false,
                    unlink_on_drop: false,
                });
            }
            unsafe {
                libc::close(fd);
                libc::shm_unlink(cname.as_ptr());
            }
        }
        Self::create(name, size)
    }

    /// Map a regular file as the backing store (created/truncated as needed).
    pub fn create_file<P: AsRef<Path>>(path: P, size: usize) -> CxlResult<Self> {
        let path = path.as_ref().to_path_buf();
        let existed = path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        if file.metadata()?.len() != size as u64 {
            file.set_len(size as u64)?;
        }

        let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file)? };
        log::info!(
            "Mapped backing file {} ({} bytes)",
            path.display(),
            size
        );

        Ok(Self {
            backing: Backing::File {
                mmap,
                _file: file,
                path,
            },
            size,
            name: String::new(),
            owner: !existed,
            unlink_on_drop: false,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        match &self.backing {
            Backing::Posix { ptr, .. } => *ptr,
            Backing::File { mmap, .. } => mmap.as_ptr() as *mut u8,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Whether the segment is unlinked when this mapping drops.
    pub fn set_unlink_on_drop(&mut self, unlink: bool) {
        self.unlink_on_drop = unlink;
    }

    /// Flush the pages covering `[offset, offset + len)` to the backing store.
    pub fn sync_range(&self, offset: usize, len: usize) -> CxlResult<()> {
        if offset + len > self.size {
            return Err(CxlError::shm(format!(
                "sync range {}..{} beyond segment size {}",
                offset,
                offset + len,
                self.size
            )));
        }
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let start = offset & !(page - 1);
        let end = (offset + len + page - 1) & !(page - 1);
        let end = end.min(self.size);
        let rc = unsafe {
            libc::msync(
                self.as_ptr().add(start) as *mut libc::c_void,
                end - start,
                libc::MS_SYNC | libc::MS_INVALIDATE,
            )
        };
        if rc != 0 {
            return Err(CxlError::shm(format!(
                "msync failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        match &mut self.backing {
            Backing::Posix { fd, ptr } => {
                unsafe {
                    libc::munmap(*ptr as *mut libc::c_void, self.size);
                    libc::close(*fd);
                }
                if self.unlink_on_drop {
                    if let Ok(cname) = c_name(&self.name) {
                        unsafe { libc::shm_unlink(cname.as_ptr()) };
                    }
                    log::debug!("Unlinked shm segment '{}'", self.name);
                }
            }
            Backing::File { path, .. } => {
                if self.unlink_on_drop {
                    let _ = std::fs::remove_file(&*path);
                }
            }
        }
    }
}
