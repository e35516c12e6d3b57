use std::fs::File;
use std::io;
use std::os::fd::{IntoRawFd, OwnedFd};
use std::ptr::NonNull;
use std::thread;
use std::time::Duration;

use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc::c_void;
use nix::sys::mman::{munmap, shm_open, shm_unlink};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use tracing::{debug, warn};

use crate::error::{AttachError, DetachError};

/// Attempts at opening a segment when it keeps appearing and disappearing
/// underneath us (another process creating or unlinking it concurrently).
const OPEN_ATTEMPTS: u32 = 16;

/// How long to wait for a creator to size a segment it just created.
const SIZE_POLL_INTERVAL: Duration = Duration::from_millis(1);
const SIZE_POLL_ATTEMPTS: u32 = 5_000;

/// One named POSIX shared memory object mapped read-write into this process.
///
/// Dropping the segment unmaps it and closes the descriptor; the named
/// object itself stays until [`Segment::unlink`] removes it.
pub struct Segment {
    name: String,
    mmap: MmapMut,
    file: File,
    created: bool,
}

impl Segment {
    /// Opens `name` if it exists, otherwise creates it with exactly `size`
    /// bytes. Exactly one of several racing processes creates the object;
    /// [`Segment::created`] tells which.
    pub fn open_or_create(name: &str, size: usize) -> Result<Self, AttachError> {
        for _ in 0..OPEN_ATTEMPTS {
            match shm_open(name, OFlag::O_RDWR, Mode::empty()) {
                Ok(fd) => return Self::map_existing(name, fd, size),
                Err(Errno::ENOENT) => {}
                Err(source) => return Err(open_error(name, source)),
            }

            match shm_open(name, OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR, shared_mode()) {
                Ok(fd) => return Self::map_created(name, fd, size),
                // Lost the creation race, open what the winner made.
                Err(Errno::EEXIST) => continue,
                Err(source) => return Err(open_error(name, source)),
            }
        }
        Err(open_error(name, Errno::EAGAIN))
    }

    /// Opens `name`, which must already exist with exactly `size` bytes.
    pub fn open_existing(name: &str, size: usize) -> Result<Self, AttachError> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty()).map_err(|e| open_error(name, e))?;
        Self::map_existing(name, fd, size)
    }

    fn map_created(name: &str, fd: OwnedFd, size: usize) -> Result<Self, AttachError> {
        let result = ftruncate(&fd, size as nix::libc::off_t)
            .map_err(|e| AttachError::Size {
                segment: name.to_string(),
                source: io::Error::from(e),
            })
            .and_then(|()| Self::map(name, File::from(fd), size, true));

        if result.is_err() {
            // Nobody else can ever initialize it, so do not leave it behind.
            if let Err(e) = shm_unlink(name) {
                warn!(segment = name, error = %e, "failed to remove half-created segment");
            }
        } else {
            debug!(segment = name, size, "created shared memory segment");
        }
        result
    }

    fn map_existing(name: &str, fd: OwnedFd, size: usize) -> Result<Self, AttachError> {
        let file = File::from(fd);
        let size_error = |source: io::Error| AttachError::Size {
            segment: name.to_string(),
            source,
        };

        // The creator sizes the object right after creating it; a zero length
        // means we got in between.
        let mut len = file.metadata().map_err(size_error)?.len();
        let mut attempts = 0;
        while len == 0 && attempts < SIZE_POLL_ATTEMPTS {
            thread::sleep(SIZE_POLL_INTERVAL);
            len = file.metadata().map_err(size_error)?.len();
            attempts += 1;
        }
        if len == 0 {
            return Err(AttachError::NotReady {
                segment: name.to_string(),
            });
        }
        if len != size as u64 {
            return Err(AttachError::LayoutMismatch {
                segment: name.to_string(),
                detail: format!("segment is {len} bytes, expected {size}"),
            });
        }

        debug!(segment = name, size, "opened existing shared memory segment");
        Self::map(name, file, size, false)
    }

    fn map(name: &str, file: File, size: usize, created: bool) -> Result<Self, AttachError> {
        let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file) }.map_err(|source| {
            AttachError::Map {
                segment: name.to_string(),
                source,
            }
        })?;
        Ok(Self {
            name: name.to_string(),
            mmap,
            file,
            created,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this process created the named object.
    pub fn created(&self) -> bool {
        self.created
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Start of the mapping. Valid for as long as the segment is alive.
    pub(crate) fn base(&mut self) -> NonNull<u8> {
        // A successful mapping is never null.
        NonNull::new(self.mmap.as_mut_ptr()).unwrap_or(NonNull::dangling())
    }

    /// Unmaps the segment and closes its descriptor, reporting failures
    /// instead of swallowing them the way `Drop` does. Both steps are
    /// attempted; the unmap failure wins if both fail.
    pub fn close(self) -> Result<(), DetachError> {
        let Self { name, mmap, file, .. } = self;
        let len = mmap.len();
        let addr = NonNull::new(mmap.as_ptr() as *mut c_void);
        // The mapping starts at offset 0, so it is exactly `addr..addr+len`
        // and unmapping it here leaves nothing for `MmapMut` to release.
        std::mem::forget(mmap);
        let unmapped = match addr {
            Some(addr) => unsafe { munmap(addr, len) }.map_err(|source| DetachError::Unmap {
                segment: name.clone(),
                source,
            }),
            None => Ok(()),
        };
        let closed = nix::unistd::close(file.into_raw_fd()).map_err(|source| DetachError::Close {
            segment: name,
            source,
        });

        match (unmapped, closed) {
            (Err(unmap), Err(close)) => {
                warn!(error = %close, "close failed after failed unmap");
                Err(unmap)
            }
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    /// Removes the named object so no later attach can find it. Processes
    /// that still have it mapped keep their mapping.
    ///
    /// A segment that is already gone counts as removed.
    pub fn unlink(name: &str) -> Result<(), DetachError> {
        match shm_unlink(name) {
            Ok(()) | Err(Errno::ENOENT) => {
                debug!(segment = name, "unlinked shared memory segment");
                Ok(())
            }
            Err(source) => Err(DetachError::Unlink {
                segment: name.to_string(),
                source,
            }),
        }
    }
}

fn shared_mode() -> Mode {
    Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IWGRP | Mode::S_IROTH | Mode::S_IWOTH
}

fn open_error(name: &str, source: Errno) -> AttachError {
    AttachError::Open {
        segment: name.to_string(),
        source,
    }
}
