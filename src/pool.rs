//! Deduplicated literal storage for compiled programs.
//!
//! [`ConstantPool`] accepts values only while code is being emitted.
//! [`ConstantPool::seal`] consumes it and yields a [`SealedPool`] with no
//! way to add slots, so a late mutation cannot be expressed at all.

use hashbrown::HashMap;

use crate::NumT;

#[derive(Debug, Default)]
pub struct ConstantPool {
    values: Vec<NumT>,
    slots: HashMap<NumT, u32>,
}

impl ConstantPool {
    pub fn with_capacity(n: usize) -> Self {
        ConstantPool {
            values: Vec::with_capacity(n),
            slots: HashMap::with_capacity(n),
        }
    }

    /// Returns the slot holding `value`, appending it if unseen.
    pub fn intern(&mut self, value: NumT) -> u32 {
        if let Some(&slot) = self.slots.get(&value) {
            return slot;
        }
        let slot = self.values.len() as u32;
        self.values.push(value);
        self.slots.insert(value, slot);
        slot
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn seal(self) -> SealedPool {
        SealedPool { values: self.values }
    }
}

/// Read-only pool. Slot `i` is element `i`, which is also its memory layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPool {
    values: Vec<NumT>,
}

impl SealedPool {
    pub fn values(&self) -> &[NumT] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_assigns_in_order() {
        let mut pool = ConstantPool::default();
        assert_eq!(pool.intern(10), 0);
        assert_eq!(pool.intern(-3), 1);
        assert_eq!(pool.intern(0), 2);
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn test_intern_dedup_returns_original_slot() {
        let mut pool = ConstantPool::default();
        let a = pool.intern(5);
        pool.intern(6);
        assert_eq!(pool.intern(5), a);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_intern_is_deterministic() {
        let seq = [4, 8, 4, 15, 16, 23, 42, 8, 15];
        let run = || {
            let mut pool = ConstantPool::default();
            seq.iter().map(|&v| pool.intern(v)).collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
        assert_eq!(run(), [0, 1, 0, 2, 3, 4, 5, 1, 2]);
    }

    #[test]
    fn test_seal_preserves_layout() {
        let mut pool = ConstantPool::with_capacity(4);
        for v in [7, i64::MIN, 7, i64::MAX] {
            pool.intern(v);
        }
        let sealed = pool.seal();
        assert_eq!(sealed.values(), &[7, i64::MIN, i64::MAX]);
        assert_eq!(sealed.values()[1], i64::MIN);
        assert_eq!(sealed.len(), 3);
    }

    #[test]
    fn test_empty_pool() {
        let pool = ConstantPool::default();
        assert!(pool.is_empty());
        assert!(pool.seal().is_empty());
    }
}
