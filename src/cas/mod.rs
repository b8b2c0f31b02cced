//! CAS lock service
//!
//! Offset-scoped mutual exclusion keyed by (region, offset). The fabric does
//! not offer a native compare-and-swap for every backend, so a client builds a
//! linearizable read-modify-write out of plain get/put while holding the lock.

use std::{
    collections::HashMap,
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use log::debug;

use crate::{
    error::{FamError, Result},
    region::RegionId,
};

/// Identity of a lock holder (the issuing context id)
pub type HolderId = u64;

type LockKey = (RegionId, u64);

/// Table of held CAS locks
#[derive(Debug, Default)]
pub struct CasLockTable {
    held: Mutex<HashMap<LockKey, HolderId>>,
    released: Condvar,
}

impl CasLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn held(&self) -> MutexGuard<'_, HashMap<LockKey, HolderId>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reject_reentry(held: &HashMap<LockKey, HolderId>, key: LockKey, holder: HolderId) -> Result<()> {
        if held.get(&key) == Some(&holder) {
            return Err(FamError::invalid_state(format!(
                "holder {} already owns the lock on region {} offset {}",
                holder, key.0, key.1
            )));
        }
        Ok(())
    }

    /// Block until the lock is free, then take it
    pub fn acquire(&self, region_id: RegionId, offset: u64, holder: HolderId) -> Result<()> {
        let key = (region_id, offset);
        let mut held = self.held();
        Self::reject_reentry(&held, key, holder)?;
        while held.contains_key(&key) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        held.insert(key, holder);
        debug!("cas lock ({}, {}) acquired by {}", region_id, offset, holder);
        Ok(())
    }

    /// Like [`acquire`](Self::acquire), but give up after `timeout`
    pub fn acquire_timeout(
        &self,
        region_id: RegionId,
        offset: u64,
        holder: HolderId,
        timeout: Duration,
    ) -> Result<()> {
        let key = (region_id, offset);
        let deadline = Instant::now() + timeout;
        let mut held = self.held();
        Self::reject_reentry(&held, key, holder)?;
        while held.contains_key(&key) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(FamError::timeout(format!(
                    "cas lock on region {} offset {} not acquired within {:?}",
                    region_id, offset, timeout
                )));
            }
            held = self
                .released
                .wait_timeout(held, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        held.insert(key, holder);
        debug!("cas lock ({}, {}) acquired by {}", region_id, offset, holder);
        Ok(())
    }

    /// Take the lock if it is free; never blocks
    pub fn try_acquire(&self, region_id: RegionId, offset: u64, holder: HolderId) -> Result<bool> {
        let key = (region_id, offset);
        let mut held = self.held();
        Self::reject_reentry(&held, key, holder)?;
        if held.contains_key(&key) {
            return Ok(false);
        }
        held.insert(key, holder);
        Ok(true)
    }

    /// Release a lock held by `holder`; anyone else gets `NotOwner` and the
    /// lock stays as it was
    pub fn release(&self, region_id: RegionId, offset: u64, holder: HolderId) -> Result<()> {
        let key = (region_id, offset);
        let mut held = self.held();
        match held.get(&key) {
            Some(&current) if current == holder => {
                held.remove(&key);
                drop(held);
                self.released.notify_all();
                debug!("cas lock ({}, {}) released by {}", region_id, offset, holder);
                Ok(())
            }
            Some(&current) => Err(FamError::not_owner(format!(
                "lock on region {} offset {} is held by {}, not {}",
                region_id, offset, current, holder
            ))),
            None => Err(FamError::not_owner(format!(
                "lock on region {} offset {} is not held",
                region_id, offset
            ))),
        }
    }

    /// Drop every lock of a destroyed region and wake its waiters
    pub fn release_region(&self, region_id: RegionId) {
        let mut held = self.held();
        let before = held.len();
        held.retain(|(region, _), _| *region != region_id);
        let dropped = before - held.len();
        drop(held);
        if dropped > 0 {
            debug!("dropped {} cas lock(s) of region {}", dropped, region_id);
            self.released.notify_all();
        }
    }

    pub fn holder(&self, region_id: RegionId, offset: u64) -> Option<HolderId> {
        self.held().get(&(region_id, offset)).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread,
    };

    #[test]
    fn test_second_acquirer_waits_for_release() {
        let table = Arc::new(CasLockTable::new());
        table.acquire(1, 64, 10).unwrap();

        let acquired = Arc::new(AtomicBool::new(false));
        let waiter = {
            let table = table.clone();
            let acquired = acquired.clone();
            thread::spawn(move || {
                table.acquire(1, 64, 20).unwrap();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));

        table.release(1, 64, 10).unwrap();
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        assert_eq!(table.holder(1, 64), Some(20));
    }

    #[test]
    fn test_release_by_non_holder() {
        let table = CasLockTable::new();
        table.acquire(1, 0, 10).unwrap();

        let err = table.release(1, 0, 11).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotOwner);
        assert_eq!(table.holder(1, 0), Some(10));

        let err = table.release(1, 8, 10).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotOwner);
    }

    #[test]
    fn test_timeout_is_distinct_from_not_owner() {
        let table = CasLockTable::new();
        table.acquire(2, 0, 1).unwrap();

        let err = table
            .acquire_timeout(2, 0, 2, Duration::from_millis(20))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(!table.try_acquire(2, 0, 3).unwrap());
    }

    #[test]
    fn test_locks_are_region_scoped() {
        let table = CasLockTable::new();
        table.acquire(1, 0, 1).unwrap();
        assert!(table.try_acquire(2, 0, 2).unwrap());

        table.release_region(1);
        assert_eq!(table.holder(1, 0), None);
        assert_eq!(table.holder(2, 0), Some(2));
    }
}
