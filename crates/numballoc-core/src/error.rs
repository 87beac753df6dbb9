//! Error types for numballoc

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("shared memory error: {0}")]
    SharedMemory(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("shared memory region is closed")]
    Closed,

    /// Every number below `max` is currently allocated
    #[error("could not allocate a free number")]
    NoFreeNumber,

    #[error("number {number} out of range: max is {max}")]
    OutOfRange { number: u64, max: u64 },
}

impl Error {
    /// Whether this is the expected exhaustion outcome of an allocation
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Error::NoFreeNumber)
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Error::Io(std::io::Error::from(errno))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
