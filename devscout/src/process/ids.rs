use crate::{Error, Result};

/// Hands out the smallest process id not currently held.
///
/// Ids are small integers so a bitset is enough.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    words: Vec<u64>,
    capacity: usize,
}

impl IdAllocator {
    pub const DEFAULT_CAPACITY: usize = 4096;

    pub fn new(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity.div_ceil(64)],
            capacity,
        }
    }

    /// Claim the smallest free id.
    pub fn acquire(&mut self) -> Result<usize> {
        for (index, word) in self.words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros() as usize;
            let id = index * 64 + bit;
            if id >= self.capacity {
                break;
            }
            *word |= 1 << bit;
            return Ok(id);
        }
        Err(Error::IdSpaceExhausted {
            capacity: self.capacity,
        })
    }

    /// Give `id` back. Returns `false` if it was not held.
    pub fn release(&mut self, id: usize) -> bool {
        let Some(word) = self.words.get_mut(id / 64) else {
            return false;
        };
        let mask = 1 << (id % 64);
        let held = *word & mask != 0;
        *word &= !mask;
        held
    }

    pub fn is_held(&self, id: usize) -> bool {
        self.words
            .get(id / 64)
            .is_some_and(|word| word & (1 << (id % 64)) != 0)
    }

    /// Number of ids currently held.
    pub fn held(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_is_sequential_from_zero() {
        let mut ids = IdAllocator::default();
        let got: Vec<_> = (0..5).map(|_| ids.acquire().unwrap()).collect();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
        assert_eq!(ids.held(), 5);
    }

    #[test]
    fn test_released_id_is_reused_first() {
        // {0, 1, 3} held -> next is 2, then 4.
        let mut ids = IdAllocator::default();
        for _ in 0..4 {
            ids.acquire().unwrap();
        }
        assert!(ids.release(2));
        assert!(!ids.release(2));
        assert!(!ids.is_held(2));

        assert_eq!(ids.acquire().unwrap(), 2);
        assert_eq!(ids.acquire().unwrap(), 4);
    }

    #[test]
    fn test_crosses_word_boundary() {
        let mut ids = IdAllocator::new(130);
        for expected in 0..130 {
            assert_eq!(ids.acquire().unwrap(), expected);
        }
        ids.release(70);
        assert_eq!(ids.acquire().unwrap(), 70);
    }

    #[test]
    fn test_exhaustion() {
        let mut ids = IdAllocator::new(2);
        ids.acquire().unwrap();
        ids.acquire().unwrap();
        assert!(matches!(
            ids.acquire(),
            Err(Error::IdSpaceExhausted { capacity: 2 })
        ));
        assert!(!ids.release(99));
    }
}
