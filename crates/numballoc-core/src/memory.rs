//! Word-array views that a bitmap allocator can operate over

use crate::Result;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

/// Number of bits (and so numbers) held by one word
pub const BITS_PER_WORD: u64 = 32;

/// Size of one word in bytes
pub const WORD_SIZE: usize = std::mem::size_of::<u32>();

/// Number of words needed to view `size_bytes` bytes, at least one
pub const fn word_count(size_bytes: usize) -> usize {
    let n = size_bytes.div_ceil(WORD_SIZE);
    if n == 0 {
        1
    } else {
        n
    }
}

/// A fixed array of 32-bit words shared by every user of the memory.
///
/// Words are in native byte order. All mutation goes through the atomics, so
/// implementations only hand out shared references.
pub trait Memory {
    /// The words of this memory
    fn words(&self) -> Result<&[AtomicU32]>;

    /// Size in bytes, as requested by the creator
    fn size(&self) -> usize;
}

impl<M: Memory + ?Sized> Memory for &M {
    fn words(&self) -> Result<&[AtomicU32]> {
        (**self).words()
    }

    fn size(&self) -> usize {
        (**self).size()
    }
}

impl<M: Memory + ?Sized> Memory for Arc<M> {
    fn words(&self) -> Result<&[AtomicU32]> {
        (**self).words()
    }

    fn size(&self) -> usize {
        (**self).size()
    }
}

/// Process-local memory, zero-initialized
pub struct HeapMemory {
    words: Box<[AtomicU32]>,
    size: usize,
}

impl HeapMemory {
    /// Allocate `size_bytes` bytes of zeroed words
    pub fn new(size_bytes: usize) -> Self {
        let words = (0..word_count(size_bytes))
            .map(|_| AtomicU32::new(0))
            .collect();
        Self {
            words,
            size: size_bytes,
        }
    }
}

impl Memory for HeapMemory {
    fn words(&self) -> Result<&[AtomicU32]> {
        Ok(&self.words)
    }

    fn size(&self) -> usize {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_word_count() {
        assert_eq!(word_count(0), 1);
        assert_eq!(word_count(1), 1);
        assert_eq!(word_count(4), 1);
        assert_eq!(word_count(5), 2);
        assert_eq!(word_count(256), 64);
    }

    #[test]
    fn test_heap_memory_is_zeroed() {
        let mem = HeapMemory::new(256);
        assert_eq!(mem.size(), 256);
        let words = mem.words().unwrap();
        assert_eq!(words.len(), 64);
        assert!(words.iter().all(|w| w.load(Ordering::SeqCst) == 0));
    }

    #[test]
    fn test_shared_views() {
        let mem = Arc::new(HeapMemory::new(8));
        let other = Arc::clone(&mem);
        other.words().unwrap()[1].store(0xCAFE_CAFE, Ordering::SeqCst);
        assert_eq!(mem.words().unwrap()[1].load(Ordering::SeqCst), 0xCAFE_CAFE);
    }
}
