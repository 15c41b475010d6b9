//! Byte-range locks held through one open.
//!
//! Locks live in a slot table owned by the open and are mutated only under its
//! lock. A [`LockId`] stays valid until its lock is released, whatever else is
//! added or removed in between.

use smb_msg::{LockElement, LockFlag};

/// Stable handle to a held lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeldLock {
    pub offset: u64,
    pub length: u64,
    pub exclusive: bool,
}

impl HeldLock {
    fn matches(&self, offset: u64, length: u64) -> bool {
        self.offset == offset && self.length == length
    }

    /// The element that releases this lock.
    pub fn unlock_element(&self) -> LockElement {
        LockElement {
            offset: self.offset,
            length: self.length,
            flags: LockFlag::new().with_unlock(true),
        }
    }
}

#[derive(Debug, Default)]
pub struct ByteRangeLocks {
    slots: Vec<Option<HeldLock>>,
    free: Vec<usize>,
}

impl ByteRangeLocks {
    pub fn new() -> ByteRangeLocks {
        ByteRangeLocks::default()
    }

    pub fn insert(&mut self, lock: HeldLock) -> LockId {
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(lock);
                LockId(index)
            }
            None => {
                self.slots.push(Some(lock));
                LockId(self.slots.len() - 1)
            }
        }
    }

    pub fn get(&self, id: LockId) -> Option<&HeldLock> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    pub fn remove(&mut self, id: LockId) -> Option<HeldLock> {
        let lock = self.slots.get_mut(id.0)?.take()?;
        self.free.push(id.0);
        Some(lock)
    }

    /// Releases the lock covering exactly `[offset, offset + length)`. SMB2
    /// unlocks must name a range exactly as it was locked.
    pub fn release(&mut self, offset: u64, length: u64) -> Option<HeldLock> {
        let index = self
            .slots
            .iter()
            .position(|s| s.is_some_and(|l| l.matches(offset, length)))?;
        self.remove(LockId(index))
    }

    /// Applies the elements of a granted LOCK request.
    pub fn apply(&mut self, elements: &[LockElement]) {
        for element in elements {
            if element.flags.unlock() {
                if self.release(element.offset, element.length).is_none() {
                    log::debug!(
                        "Unlocked {}+{} which was not tracked",
                        element.offset,
                        element.length
                    );
                }
            } else {
                self.insert(HeldLock {
                    offset: element.offset,
                    length: element.length,
                    exclusive: element.flags.exclusive(),
                });
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (LockId, &HeldLock)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|l| (LockId(i), l)))
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets every lock; the server dropped them with the handle.
    pub fn clear(&mut self) -> usize {
        let count = self.len();
        self.slots.clear();
        self.free.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn held(offset: u64, length: u64) -> HeldLock {
        HeldLock {
            offset,
            length,
            exclusive: true,
        }
    }

    #[test]
    fn test_ids_survive_other_removals() {
        let mut locks = ByteRangeLocks::new();
        let a = locks.insert(held(0, 10));
        let b = locks.insert(held(10, 10));
        let c = locks.insert(held(20, 10));
        assert_eq!(locks.remove(b), Some(held(10, 10)));
        assert_eq!(locks.get(a), Some(&held(0, 10)));
        assert_eq!(locks.get(c), Some(&held(20, 10)));
        assert_eq!(locks.get(b), None);
        assert_eq!(locks.remove(b), None);

        // The freed slot is reused.
        let d = locks.insert(held(30, 5));
        assert_eq!(d, b);
        assert_eq!(locks.len(), 3);
    }

    #[test]
    fn test_apply_lock_and_unlock() {
        let mut locks = ByteRangeLocks::new();
        locks.apply(&[
            LockElement {
                offset: 0,
                length: 100,
                flags: LockFlag::new().with_exclusive(true),
            },
            LockElement {
                offset: 200,
                length: 50,
                flags: LockFlag::new().with_shared(true),
            },
        ]);
        assert_eq!(locks.len(), 2);

        // Partial ranges do not release anything.
        assert!(locks.release(0, 50).is_none());
        locks.apply(&[held(0, 100).unlock_element()]);
        let remaining: Vec<_> = locks.iter().map(|(_, l)| *l).collect();
        assert_eq!(
            remaining,
            vec![HeldLock {
                offset: 200,
                length: 50,
                exclusive: false
            }]
        );

        assert_eq!(locks.clear(), 1);
        assert!(locks.is_empty());
    }
}
