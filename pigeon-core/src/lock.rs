//! A process-wide, key-scoped lock manager. [`FileStore::update`] and
//! attachment mutations use this to serialize read-modify-write critical
//! sections without blocking unrelated keys.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

#[derive(Default)]
pub struct LockManager {
    locks: Mutex<HashMap<String, Weak<Mutex<()>>>>,
}

/// Holds one or more key locks for the lifetime of the guard. Dropping it
/// releases every lock, including on early-return via `?`.
pub struct LockGuard {
    // Struct fields drop in declaration order, so `_guards` must come
    // first: each MutexGuard borrows from the Mutex<()> kept alive by the
    // matching entry in `_arcs`, and unlocking a mutex that's already been
    // deallocated is undefined behavior.
    _guards: Vec<MutexGuard<'static, ()>>,
    _arcs: Vec<Arc<Mutex<()>>>,
}

impl LockManager {
    pub fn new() -> Self {
        LockManager::default()
    }

    fn arc_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock manager mutex poisoned");
        if let Some(existing) = locks.get(key).and_then(Weak::upgrade) {
            return existing;
        }
        let arc = Arc::new(Mutex::new(()));
        locks.insert(key.to_string(), Arc::downgrade(&arc));
        arc
    }

    /// Acquires a single key's lock.
    pub fn lock_one(&self, key: &str) -> LockGuard {
        self.lock_many(std::slice::from_ref(&key.to_string()))
    }

    /// Acquires a single key's lock only if it is free right now. Returns
    /// `None` when another holder has it, without blocking.
    pub fn try_lock_one(&self, key: &str) -> Option<LockGuard> {
        let arc = self.arc_for(key);
        // SAFETY: same erasure as in `lock_many` — the guard's real
        // lifetime is tied to `arc`, stored alongside it in the LockGuard.
        let guard = match arc.try_lock() {
            Ok(g) => unsafe { std::mem::transmute::<MutexGuard<'_, ()>, MutexGuard<'static, ()>>(g) },
            Err(std::sync::TryLockError::WouldBlock) => return None,
            Err(std::sync::TryLockError::Poisoned(_)) => panic!("per-key mutex poisoned"),
        };
        Some(LockGuard {
            _guards: vec![guard],
            _arcs: vec![arc],
        })
    }

    /// Acquires locks for every key, in sorted order, to avoid deadlocks
    /// between operations that need more than one path lock at a time.
    pub fn lock_many(&self, keys: &[String]) -> LockGuard {
        let mut sorted: Vec<String> = keys.to_vec();
        sorted.sort();
        sorted.dedup();

        let arcs: Vec<Arc<Mutex<()>>> = sorted.iter().map(|k| self.arc_for(k)).collect();
        // SAFETY: `guards` never outlives `arcs`; both are stored together in
        // `LockGuard` and dropped together. The 'static transmute only
        // erases a lifetime that is actually tied to `arcs`' heap
        // allocation, which outlives the guards for the whole struct's life.
        let guards: Vec<MutexGuard<'static, ()>> = arcs
            .iter()
            .map(|arc| {
                let guard = arc.lock().expect("per-key mutex poisoned");
                unsafe {
                    std::mem::transmute::<MutexGuard<'_, ()>, MutexGuard<'static, ()>>(guard)
                }
            })
            .collect();

        LockGuard {
            _guards: guards,
            _arcs: arcs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    #[test]
    fn same_key_serializes_access() {
        let manager = Arc::new(LockManager::new());
        let counter = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                let _guard = manager.lock_one("same-key");
                let before = counter.load(Ordering::SeqCst);
                thread::yield_now();
                counter.store(before + 1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn lock_many_sorts_keys() {
        let manager = LockManager::new();
        let _guard = manager.lock_many(&["b".to_string(), "a".to_string()]);
    }
}
