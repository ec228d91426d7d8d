//! A process-local, best-effort `pathUpdated` pub/sub bus. Delivery is
//! deferred to a background dispatch thread so a slow listener never blocks
//! the writer that triggered it, and listener panics are caught and logged
//! rather than propagated.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

pub type Listener = Box<dyn Fn(&str, u64) + Send + Sync + 'static>;

struct Inner {
    listeners: Mutex<Vec<Listener>>,
}

/// A handle to the background dispatcher. Dropping it stops the thread.
pub struct EventBus {
    inner: Arc<Inner>,
    /// `None` only during drop, which closes the channel so the dispatch
    /// thread's `recv` disconnects and the join below can finish.
    sender: Option<Sender<(String, u64)>>,
    worker: Option<JoinHandle<()>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(usize::MAX)
    }

    /// `queue_capacity` is a diagnostic threshold, not a bound: emitting
    /// never blocks regardless of how many events are pending. When a
    /// single dispatch batch coalesces more than `queue_capacity` distinct
    /// paths, a warning is logged so a runaway producer is visible without
    /// slowing it down.
    pub fn with_capacity(queue_capacity: usize) -> Self {
        let inner = Arc::new(Inner {
            listeners: Mutex::new(Vec::new()),
        });
        let (sender, receiver) = mpsc::channel::<(String, u64)>();
        let dispatch_inner = inner.clone();
        let worker = std::thread::spawn(move || {
            loop {
                let first = match receiver.recv() {
                    Ok(item) => item,
                    Err(_) => return, // sender dropped: shut down
                };
                // Coalesce everything already queued for this tick by
                // (path, maxVersion).
                let mut batch: HashMap<String, u64> = HashMap::new();
                batch.insert(first.0, first.1);
                while let Ok((path, version)) = receiver.try_recv() {
                    batch
                        .entry(path)
                        .and_modify(|v| *v = (*v).max(version))
                        .or_insert(version);
                }
                if batch.len() > queue_capacity {
                    tracing::warn!(
                        batch_len = batch.len(),
                        queue_capacity,
                        "pathUpdated dispatch batch exceeded configured queue capacity"
                    );
                }
                let listeners = dispatch_inner
                    .listeners
                    .lock()
                    .expect("event bus listeners mutex poisoned");
                for (path, version) in batch {
                    for listener in listeners.iter() {
                        let result = panic::catch_unwind(AssertUnwindSafe(|| {
                            listener(&path, version);
                        }));
                        if result.is_err() {
                            tracing::warn!(path = %path, version, "pathUpdated listener panicked, skipping");
                        }
                    }
                }
            }
        });
        EventBus {
            inner,
            sender: Some(sender),
            worker: Some(worker),
        }
    }

    /// Registers a listener, invoked in registration order for every batch.
    pub fn on(&self, listener: Listener) {
        self.inner
            .listeners
            .lock()
            .expect("event bus listeners mutex poisoned")
            .push(listener);
    }

    /// Emits a `pathUpdated(path, version)` event, delivered asynchronously.
    pub fn emit(&self, path: impl Into<String>, version: u64) {
        // A closed receiver (dispatcher thread panicked) makes delivery
        // best-effort by definition; dropping the event is the only
        // sensible outcome here.
        if let Some(sender) = &self.sender {
            let _ = sender.send((path.into(), version));
        }
    }

    /// Blocks briefly to give the dispatcher thread a chance to drain the
    /// queue; intended for tests.
    #[cfg(test)]
    pub fn flush_for_test(&self) {
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        // Close the channel first: the dispatcher exits once `recv`
        // disconnects, and only then can the join return.
        self.sender = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn listener_receives_emitted_event() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicU64::new(0));
        let seen2 = seen.clone();
        bus.on(Box::new(move |_path, version| {
            seen2.store(version, Ordering::SeqCst);
        }));
        bus.emit("pigeon-optics:/s/u:n", 3);
        bus.flush_for_test();
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn emit_never_blocks_even_past_queue_capacity() {
        let bus = EventBus::with_capacity(1);
        let seen = Arc::new(AtomicU64::new(0));
        let seen2 = seen.clone();
        bus.on(Box::new(move |_path, version| {
            seen2.store(version, Ordering::SeqCst);
        }));
        for i in 0..5 {
            bus.emit(format!("p{i}"), i);
        }
        bus.flush_for_test();
        // No assertion on which path "won" the coalesce race; the point is
        // that five emits past a capacity of one didn't panic or block.
        assert!(seen.load(Ordering::SeqCst) < 5);
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicU64::new(0));
        let seen2 = seen.clone();
        bus.on(Box::new(|_path, _version| panic!("boom")));
        bus.on(Box::new(move |_path, version| {
            seen2.store(version, Ordering::SeqCst);
        }));
        bus.emit("p", 9);
        bus.flush_for_test();
        assert_eq!(seen.load(Ordering::SeqCst), 9);
    }
}
