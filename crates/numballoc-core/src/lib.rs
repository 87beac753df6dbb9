//! numballoc - Lock-free number allocator over cross-process shared memory

pub mod allocator;
pub mod error;
pub mod memory;
pub mod shm;

pub use allocator::{BitmapAllocator, NumberAllocator};
pub use error::{Error, Result};
pub use memory::{HeapMemory, Memory, BITS_PER_WORD, WORD_SIZE};
pub use shm::SharedRegion;
