//! POSIX shared memory region viewed as 32-bit words

use crate::memory::{word_count, Memory, WORD_SIZE};
use crate::{Error, Result};
use shared_memory::{Shmem, ShmemConf, ShmemError};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Attempts to map an existing region before giving up
const ATTACH_ATTEMPTS: u32 = 8;

/// Wait before the second attach attempt, doubled after each failure
const ATTACH_BACKOFF: Duration = Duration::from_millis(1);

/// Keep the errno of OS failures, describe everything else
fn shmem_error(e: ShmemError) -> Error {
    match e {
        ShmemError::MapCreateFailed(code)
        | ShmemError::MapOpenFailed(code)
        | ShmemError::UnknownOsError(code) => {
            Error::Io(std::io::Error::from_raw_os_error(code as i32))
        }
        e => Error::SharedMemory(e.to_string()),
    }
}

/// Named shared memory region.
///
/// Every process opening the same name with the same size sees the same
/// bytes. Dropping or closing a handle only unmaps it from this process, the
/// object itself lives until [`SharedRegion::destroy`] is called.
pub struct SharedRegion {
    inner: Option<Shmem>,
    name: String,
    size: usize,
    words: usize,
    creator: bool,
}

// Safety: the mapping is process-wide and all access to its words goes
// through atomics.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create the region, or attach to it if `name` already exists.
    ///
    /// `size_bytes` must be the same for every opener of `name`. A fresh
    /// object is reserved rounded up to a whole number of words and starts
    /// out zeroed, an existing one is mapped as is.
    pub fn open(name: &str, size_bytes: usize) -> Result<Self> {
        let words = word_count(size_bytes);
        let reserved = words * WORD_SIZE;

        let created = ShmemConf::new().size(reserved).os_id(name).create();
        let (mut shmem, creator) = match created {
            Ok(shmem) => (shmem, true),
            Err(ShmemError::MappingIdExists) => (Self::attach(name, reserved)?, false),
            Err(e) => return Err(shmem_error(e)),
        };

        // Unlinking is left to destroy(), never to drop
        shmem.set_owner(false);

        if shmem.len() < reserved {
            return Err(Error::SharedMemory(format!(
                "region {} is {} bytes, {} required",
                name,
                shmem.len(),
                reserved
            )));
        }

        if creator {
            tracing::debug!(name = %name, size = size_bytes, words, "created shared region");
        } else {
            tracing::debug!(name = %name, size = size_bytes, words, "attached shared region");
        }

        Ok(Self {
            inner: Some(shmem),
            name: name.to_string(),
            size: size_bytes,
            words,
            creator,
        })
    }

    /// Map an existing object.
    ///
    /// The creator sizes the object only after creating it, so an attach
    /// racing with creation can find it empty. Retries with backoff until
    /// the object is at least `reserved` bytes.
    fn attach(name: &str, reserved: usize) -> Result<Shmem> {
        let mut backoff = ATTACH_BACKOFF;
        let mut attempt = 1;
        loop {
            let err = match ShmemConf::new().os_id(name).open() {
                Ok(shmem) if shmem.len() >= reserved => return Ok(shmem),
                Ok(shmem) => Error::SharedMemory(format!(
                    "region {} is {} bytes, {} required",
                    name,
                    shmem.len(),
                    reserved
                )),
                Err(e @ ShmemError::MapOpenFailed(_)) => shmem_error(e),
                Err(e) => return Err(shmem_error(e)),
            };
            if attempt == ATTACH_ATTEMPTS {
                return Err(err);
            }
            tracing::trace!(name = %name, attempt, "region not ready, retrying attach");
            std::thread::sleep(backoff);
            backoff *= 2;
            attempt += 1;
        }
    }

    /// Remove `name` from the shared memory namespace.
    ///
    /// Existing mappings stay valid until closed; later opens of `name`
    /// create a new object.
    pub fn destroy(name: &str) -> Result<()> {
        nix::sys::mman::shm_unlink(name)?;
        tracing::debug!(name = %name, "destroyed shared region");
        Ok(())
    }

    /// Get the name of the shared region
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this handle created the underlying object
    pub fn is_creator(&self) -> bool {
        self.creator
    }

    /// Whether this handle is still mapped
    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    /// Unmap the region from this process. Calling it again is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.inner.take().is_some() {
            tracing::debug!(name = %self.name, "closed shared region");
        }
        Ok(())
    }

    /// Read word `index`
    pub fn load_word(&self, index: usize) -> Result<u32> {
        Ok(self.word(index)?.load(Ordering::Acquire))
    }

    /// Overwrite word `index`
    pub fn store_word(&self, index: usize, value: u32) -> Result<()> {
        self.word(index)?.store(value, Ordering::Release);
        Ok(())
    }

    fn word(&self, index: usize) -> Result<&AtomicU32> {
        let words = self.words()?;
        words.get(index).ok_or(Error::OutOfRange {
            number: index as u64,
            max: words.len() as u64,
        })
    }
}

impl Memory for SharedRegion {
    fn words(&self) -> Result<&[AtomicU32]> {
        let shmem = self.inner.as_ref().ok_or(Error::Closed)?;
        let ptr = shmem.as_ptr() as *const AtomicU32;
        // Safety: the mapping is page aligned and at least `words` words long
        // (checked in open), and it stays mapped for as long as `self` is
        // borrowed since close() needs `&mut self`.
        Ok(unsafe { std::slice::from_raw_parts(ptr, self.words) })
    }

    fn size(&self) -> usize {
        self.size
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("words", &self.words)
            .field("creator", &self.creator)
            .field("open", &self.is_open())
            .finish()
    }
}
