//! Integration tests for CAS locks and compare-and-swap built on them

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Barrier,
    },
    thread,
    time::Duration,
};

use famsvc::{
    ErrorKind, Fam, FamOptions, LocalMemoryService, MemoryService, Owner, Permission,
    ServiceConfig,
};
use tempfile::TempDir;

#[cfg(test)]
mod tests {
    use super::*;

    fn config(temp_dir: &TempDir) -> ServiceConfig {
        ServiceConfig::new(0)
            .with_backup_dir(temp_dir.path().join("backups"))
            .with_credentials(Owner::new(1000, 1000))
    }

    fn session(temp_dir: &TempDir, app: &str) -> Fam {
        Fam::initialize(app, FamOptions::default().with_service(config(temp_dir))).unwrap()
    }

    #[test]
    fn test_concurrent_acquire_exactly_one_wins() {
        let temp_dir = TempDir::new().unwrap();
        let fam = Arc::new(session(&temp_dir, "cas_race"));
        let region = fam.create_region("race", 4096, Permission::new(0o777)).unwrap();
        let item = fam.allocate(&region, 64, Permission::new(0o777)).unwrap();

        let first = fam.context_open().unwrap();
        let second = fam.context_open().unwrap();
        let barrier = Arc::new(Barrier::new(2));

        let attempts: Vec<_> = [Arc::clone(&first), Arc::clone(&second)]
            .into_iter()
            .map(|ctx| {
                let item = item.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    ctx.try_acquire_cas_lock(&item, 0).unwrap()
                })
            })
            .collect();
        let won: Vec<bool> = attempts.into_iter().map(|t| t.join().unwrap()).collect();
        assert_eq!(won.iter().filter(|&&w| w).count(), 1);

        let (holder, waiter) = if won[0] { (first, second) } else { (second, first) };

        // The loser blocks until the winner releases.
        let acquired = Arc::new(AtomicBool::new(false));
        let blocked = {
            let waiter = Arc::clone(&waiter);
            let item = item.clone();
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                waiter.acquire_cas_lock(&item, 0).unwrap();
                acquired.store(true, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));

        // A release from the non-holder fails and leaves the lock held.
        assert_eq!(
            waiter.release_cas_lock(&item, 0).unwrap_err().kind(),
            ErrorKind::NotOwner
        );
        thread::sleep(Duration::from_millis(20));
        assert!(!acquired.load(Ordering::SeqCst));

        holder.release_cas_lock(&item, 0).unwrap();
        blocked.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        waiter.release_cas_lock(&item, 0).unwrap();
    }

    #[test]
    fn test_locks_are_scoped_per_offset() {
        let temp_dir = TempDir::new().unwrap();
        let fam = session(&temp_dir, "cas_scope");
        let region = fam.create_region("scope", 4096, Permission::new(0o777)).unwrap();
        let item = fam.allocate(&region, 64, Permission::new(0o777)).unwrap();

        let a = fam.context_open().unwrap();
        let b = fam.context_open().unwrap();
        a.acquire_cas_lock(&item, 0).unwrap();
        assert!(b.try_acquire_cas_lock(&item, 8).unwrap());
        assert!(!b.try_acquire_cas_lock(&item, 0).unwrap());

        // Re-acquiring a held lock is refused rather than deadlocking.
        assert_eq!(
            a.acquire_cas_lock(&item, 0).unwrap_err().kind(),
            ErrorKind::InvalidState
        );
        assert_eq!(
            b.acquire_cas_lock(&item, 100).unwrap_err().kind(),
            ErrorKind::InvalidRange
        );

        a.release_cas_lock(&item, 0).unwrap();
        b.release_cas_lock(&item, 8).unwrap();
        fam.finalize("cas_scope").unwrap();
    }

    #[test]
    fn test_bounded_acquire_times_out() {
        let temp_dir = TempDir::new().unwrap();
        let svc = LocalMemoryService::new(config(&temp_dir)).unwrap();
        let region = svc.create_region("bounded", 4096, Permission::new(0o600)).unwrap();

        svc.acquire_cas_lock(region, 0, 1).unwrap();
        let err = svc
            .acquire_cas_lock_timeout(region, 0, 2, Duration::from_millis(30))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);

        svc.release_cas_lock(region, 0, 1).unwrap();
        svc.acquire_cas_lock_timeout(region, 0, 2, Duration::from_millis(30))
            .unwrap();
    }

    #[test]
    fn test_configured_default_timeout() {
        let temp_dir = TempDir::new().unwrap();
        let config = config(&temp_dir).with_cas_lock_timeout(Some(Duration::from_millis(20)));
        let svc = LocalMemoryService::new(config).unwrap();
        let region = svc.create_region("default", 4096, Permission::new(0o600)).unwrap();

        svc.acquire_cas_lock(region, 64, 1).unwrap();
        assert_eq!(
            svc.acquire_cas_lock(region, 64, 2).unwrap_err().kind(),
            ErrorKind::Timeout
        );
    }

    #[test]
    fn test_destroy_drops_region_locks() {
        let temp_dir = TempDir::new().unwrap();
        let svc = LocalMemoryService::new(config(&temp_dir)).unwrap();
        let region = svc.create_region("doomed", 4096, Permission::new(0o600)).unwrap();

        svc.acquire_cas_lock(region, 0, 1).unwrap();
        svc.destroy_region(region).unwrap();
        assert_eq!(
            svc.release_cas_lock(region, 0, 1).unwrap_err().kind(),
            ErrorKind::NotOwner
        );
        assert_eq!(
            svc.acquire_cas_lock(region, 0, 1).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_compare_swap() {
        let temp_dir = TempDir::new().unwrap();
        let fam = session(&temp_dir, "cas_swap");
        let region = fam.create_region("swap", 4096, Permission::new(0o777)).unwrap();
        let item = fam.allocate(&region, 64, Permission::new(0o777)).unwrap();
        let ctx = fam.context_open().unwrap();

        ctx.put(&item, 16, 5u64.to_le_bytes().to_vec()).unwrap();
        assert_eq!(ctx.compare_swap_u64(&item, 16, 4, 9).unwrap(), 5);
        assert_eq!(ctx.compare_swap_u64(&item, 16, 5, 9).unwrap(), 5);
        assert_eq!(ctx.compare_swap_u64(&item, 16, 9, 1).unwrap(), 9);

        let bytes = ctx.get(&item, 16, 8).unwrap().wait().unwrap();
        assert_eq!(u64::from_le_bytes(bytes.try_into().unwrap()), 1);

        // The lock is free again after every swap.
        assert!(ctx.try_acquire_cas_lock(&item, 16).unwrap());
        ctx.release_cas_lock(&item, 16).unwrap();
        fam.finalize("cas_swap").unwrap();
    }

    #[test]
    fn test_compare_swap_counter_across_threads() {
        let temp_dir = TempDir::new().unwrap();
        let fam = Arc::new(session(&temp_dir, "cas_counter"));
        let region = fam.create_region("counter", 4096, Permission::new(0o777)).unwrap();
        let item = fam.allocate(&region, 64, Permission::new(0o777)).unwrap();

        let threads = 4;
        let increments = 25;
        let barrier = Arc::new(Barrier::new(threads));
        let workers: Vec<_> = (0..threads)
            .map(|_| {
                let ctx = fam.context_open().unwrap();
                let item = item.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..increments {
                        loop {
                            let seen = ctx.compare_swap_u64(&item, 0, u64::MAX, 0).unwrap();
                            if ctx.compare_swap_u64(&item, 0, seen, seen + 1).unwrap() == seen {
                                break;
                            }
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let bytes = fam.default_context().get(&item, 0, 8).unwrap().wait().unwrap();
        assert_eq!(
            u64::from_le_bytes(bytes.try_into().unwrap()),
            (threads * increments) as u64
        );
    }
}
