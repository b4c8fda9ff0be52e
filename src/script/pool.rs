//! Bounded pool of pre-warmed interpreters.
//!
//! Each slot is its own `Mutex`; holding the guard is the busy mark. When
//! every slot is busy a one-off overflow interpreter is built and dropped
//! after use.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, TryLockError};

use serde::Serialize;
use tracing::{debug, warn};

use super::interpreter::Interpreter;
use super::record_repository::RecordRepository;
use super::sandbox::Sandbox;
use crate::{Result, WardenError};

/// Builds interpreters for the pool.
pub type InterpreterFactory = Arc<dyn Fn() -> Result<Interpreter> + Send + Sync>;

/// Pool occupancy snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub busy: usize,
    pub overflow_total: u64,
}

/// Pool of sandboxed interpreters.
pub struct InterpreterPool {
    slots: Vec<Mutex<Interpreter>>,
    factory: InterpreterFactory,
    busy: AtomicUsize,
    overflow_total: AtomicU64,
}

impl InterpreterPool {
    /// Pre-warm `capacity` interpreters.
    pub fn new(capacity: usize, factory: InterpreterFactory) -> Result<Self> {
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            let interpreter = factory().map_err(|e| {
                WardenError::Resource(format!("failed to pre-warm interpreter pool: {e}"))
            })?;
            slots.push(Mutex::new(interpreter));
        }
        debug!("Interpreter pool ready with {} slots", capacity);

        Ok(Self {
            slots,
            factory,
            busy: AtomicUsize::new(0),
            overflow_total: AtomicU64::new(0),
        })
    }

    /// Pool whose interpreters are hardened by `sandbox`, falling back to
    /// minimal interpreters when hardening fails.
    pub fn with_sandbox(capacity: usize, sandbox: Sandbox) -> Result<Self> {
        let factory: InterpreterFactory =
            Arc::new(move || Interpreter::hardened_or_minimal(&sandbox));
        Self::new(capacity, factory)
    }

    /// Like [`InterpreterPool::with_sandbox`], with `dbx` scripts reading
    /// and writing `records`.
    pub fn with_records(capacity: usize, sandbox: Sandbox, records: RecordRepository) -> Result<Self> {
        let factory: InterpreterFactory = Arc::new(move || {
            Interpreter::hardened_or_minimal(&sandbox).map(|i| i.with_records(records.clone()))
        });
        Self::new(capacity, factory)
    }

    /// Run `f` with exclusive access to an interpreter.
    pub fn run<T>(&self, f: impl FnOnce(&Interpreter) -> T) -> Result<T> {
        for slot in &self.slots {
            match slot.try_lock() {
                Ok(guard) => {
                    let _busy = BusyMark::new(&self.busy);
                    return Ok(f(&guard));
                }
                Err(TryLockError::WouldBlock) => continue,
                Err(TryLockError::Poisoned(poisoned)) => {
                    warn!("Rebuilding poisoned interpreter slot");
                    let mut guard = poisoned.into_inner();
                    *guard = (self.factory)()?;
                    slot.clear_poison();
                    let _busy = BusyMark::new(&self.busy);
                    return Ok(f(&guard));
                }
            }
        }

        self.overflow_total.fetch_add(1, Ordering::Relaxed);
        debug!("All {} interpreter slots busy, using overflow", self.slots.len());
        let interpreter = (self.factory)()?;
        let _busy = BusyMark::new(&self.busy);
        Ok(f(&interpreter))
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.slots.len(),
            busy: self.busy.load(Ordering::Relaxed),
            overflow_total: self.overflow_total.load(Ordering::Relaxed),
        }
    }
}

/// Counts an interpreter as busy until dropped.
struct BusyMark<'a>(&'a AtomicUsize);

impl<'a> BusyMark<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for BusyMark<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::sandbox::SandboxProfile;
    use std::sync::Barrier;

    fn pool(capacity: usize) -> InterpreterPool {
        let sandbox = Sandbox::new(Arc::new(SandboxProfile::default()));
        InterpreterPool::with_sandbox(capacity, sandbox).unwrap()
    }

    #[test]
    fn test_prewarm() {
        let pool = pool(3);
        assert_eq!(pool.capacity(), 3);
        assert_eq!(
            pool.stats(),
            PoolStats {
                capacity: 3,
                busy: 0,
                overflow_total: 0
            }
        );
    }

    #[test]
    fn test_factory_failure_is_resource_error() {
        let factory: InterpreterFactory =
            Arc::new(|| Err(WardenError::Resource("no interpreter".to_string())));
        let result = InterpreterPool::new(2, factory);
        assert!(matches!(result, Err(WardenError::Resource(_))));
    }

    #[test]
    fn test_run_releases_slot() {
        let pool = pool(1);
        pool.run(|_| ()).unwrap();
        pool.run(|_| ()).unwrap();
        assert_eq!(pool.stats().busy, 0);
        assert_eq!(pool.stats().overflow_total, 0);
    }

    #[test]
    fn test_overflow_when_all_busy() {
        let pool = Arc::new(pool(1));
        let barrier = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));

        let holder = {
            let pool = Arc::clone(&pool);
            let barrier = Arc::clone(&barrier);
            let release = Arc::clone(&release);
            std::thread::spawn(move || {
                pool.run(|_| {
                    barrier.wait();
                    release.wait();
                })
                .unwrap();
            })
        };

        barrier.wait();
        assert_eq!(pool.stats().busy, 1);
        let minimal = pool.run(|interp| interp.is_minimal()).unwrap();
        assert!(!minimal);
        assert_eq!(pool.stats().overflow_total, 1);

        release.wait();
        holder.join().unwrap();
        assert_eq!(pool.stats().busy, 0);
    }

    #[test]
    fn test_overflow_factory_failure_leaves_no_busy_slot() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sandbox = Sandbox::new(Arc::new(SandboxProfile::default()));
        let counter = Arc::clone(&calls);
        // First call pre-warms the only slot; later calls fail.
        let factory: InterpreterFactory = Arc::new(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Interpreter::new(&sandbox)
            } else {
                Err(WardenError::Resource("exhausted".to_string()))
            }
        });
        let pool = InterpreterPool::new(1, factory).unwrap();

        let nested = pool.run(|_| pool.run(|_| ())).unwrap();
        assert!(matches!(nested, Err(WardenError::Resource(_))));
        assert_eq!(pool.stats().busy, 0);
    }

    #[test]
    fn test_poisoned_slot_is_rebuilt() {
        let pool = Arc::new(pool(1));
        let p = Arc::clone(&pool);
        let panicked = std::thread::spawn(move || {
            let _ = p.run(|_| {
                panic!("boom");
            });
        })
        .join();
        assert!(panicked.is_err());
        assert_eq!(pool.stats().busy, 0);

        // The slot is usable again and no overflow was needed
        pool.run(|_| ()).unwrap();
        assert_eq!(pool.stats().overflow_total, 0);
    }
}
