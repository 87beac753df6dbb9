//! Lock-free bitmap number allocator

use crate::memory::{Memory, BITS_PER_WORD};
use crate::{Error, Result};
use std::sync::atomic::{AtomicU32, Ordering};

/// Most significant bit of a word, the bit of offset 0
const FIRST_BIT: u32 = 0x8000_0000;

/// Hands out unique numbers in `[0, max)`
pub trait NumberAllocator {
    /// Number of numbers that can be allocated
    fn max(&self) -> u64;

    /// Claim a free number, or fail with [`Error::NoFreeNumber`]
    fn allocate(&self) -> Result<u64>;

    /// Release a number so it can be allocated again
    fn free(&self, number: u64) -> Result<()>;
}

/// Allocator storing free/used numbers as a bitmap.
///
/// Number `n` is bit `n % 32` of word `n / 32`, counted from the most
/// significant bit; 1 means allocated. The bitmap lives in the memory, so any
/// number of allocators in any number of processes can share it. Words are
/// only ever changed by compare-and-swap.
pub struct BitmapAllocator<M> {
    memory: M,
    max: u64,
    /// Word to start the next scan from
    hint: AtomicU32,
}

impl<M: Memory> BitmapAllocator<M> {
    /// Allocator over the full bit capacity of `memory`
    pub fn new(memory: M) -> Self {
        Self::with_max(memory, 0)
    }

    /// Allocator over at most `max` numbers.
    ///
    /// `max` is capped to `memory.size() * 8`; 0 means no cap.
    pub fn with_max(memory: M, max: u64) -> Self {
        let capacity = memory.size() as u64 * 8;
        let max = if max != 0 && max < capacity {
            max
        } else {
            capacity
        };
        tracing::debug!(max, capacity, "created bitmap allocator");

        Self {
            memory,
            max,
            hint: AtomicU32::new(0),
        }
    }

    /// Get the underlying memory
    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// Word the next allocation starts scanning from
    pub fn hint(&self) -> usize {
        self.hint.load(Ordering::Relaxed) as usize
    }

    /// Whether `number` is currently allocated
    pub fn is_allocated(&self, number: u64) -> Result<bool> {
        let (word, mask) = self.locate(number)?;
        Ok(word.load(Ordering::Acquire) & mask != 0)
    }

    /// Number of words holding valid bits
    fn word_count(&self) -> usize {
        self.max.div_ceil(BITS_PER_WORD) as usize
    }

    /// Word and bit mask of `number`
    fn locate(&self, number: u64) -> Result<(&AtomicU32, u32)> {
        if number >= self.max {
            return Err(Error::OutOfRange {
                number,
                max: self.max,
            });
        }
        let words = self.memory.words()?;
        let index = (number / BITS_PER_WORD) as usize;
        let word = words.get(index).ok_or(Error::OutOfRange {
            number,
            max: words.len() as u64 * BITS_PER_WORD,
        })?;
        Ok((word, FIRST_BIT >> (number % BITS_PER_WORD)))
    }
}

/// Offset of the first clear bit of `word` below `limit`, from the MSB
fn first_free(word: u32, limit: u32) -> Option<u32> {
    let offset = (!word).leading_zeros();
    (offset < limit).then_some(offset)
}

impl<M: Memory> NumberAllocator for BitmapAllocator<M> {
    fn max(&self) -> u64 {
        self.max
    }

    /// Scans every word once, starting from the word of the last successful
    /// allocation. When allocations and frees are balanced this tends to find
    /// a free bit right away.
    fn allocate(&self) -> Result<u64> {
        let words = self.memory.words()?;
        let count = self.word_count();
        if count == 0 {
            return Err(Error::NoFreeNumber);
        }
        let tail = (self.max % BITS_PER_WORD) as u32;
        let start = self.hint() % count;

        for step in 0..count {
            let index = (start + step) % count;
            // Memory shorter than its size claims
            let Some(word) = words.get(index) else {
                continue;
            };
            let limit = if index == count - 1 && tail != 0 {
                tail
            } else {
                BITS_PER_WORD as u32
            };

            let mut current = word.load(Ordering::Acquire);
            // Retry this word until a bit is claimed or none is left
            while let Some(offset) = first_free(current, limit) {
                let claimed = current | (FIRST_BIT >> offset);
                match word.compare_exchange_weak(
                    current,
                    claimed,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        self.hint.store(index as u32, Ordering::Relaxed);
                        return Ok(index as u64 * BITS_PER_WORD + offset as u64);
                    }
                    Err(actual) => current = actual,
                }
            }
        }

        tracing::trace!(max = self.max, "no free number");
        Err(Error::NoFreeNumber)
    }

    /// Spins until the bit is cleared. Freeing a free number is a no-op.
    fn free(&self, number: u64) -> Result<()> {
        let (word, mask) = self.locate(number)?;
        let mut current = word.load(Ordering::Acquire);
        loop {
            let cleared = current & !mask;
            if cleared == current {
                return Ok(());
            }
            match word.compare_exchange_weak(current, cleared, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(()),
                Err(actual) => {
                    current = actual;
                    std::hint::spin_loop();
                }
            }
        }
    }
}
