//! Registry of in-flight child processes.
//!
//! Every handle that enters the registry leaves it exactly once: through
//! [`ProcessRegistry::deregister`] when the owner finishes normally, through
//! [`ProcessRegistry::kill`] when the owner gives up on the process, or through
//! [`ProcessRegistry::kill_all`] at shutdown. A handle removed by one path can
//! no longer be reached by the others, so a process is never killed after its
//! owner deregistered it.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

/// Something that can terminate a running process.
pub trait KillHandle: Send + Sync {
    /// Request termination. Must not block.
    fn kill(&self) -> std::io::Result<()>;
}

/// A cancellation token doubles as a kill switch: the task that owns the
/// child selects on `cancelled()` and kills it.
#[cfg(feature = "tokio")]
impl KillHandle for tokio_util::sync::CancellationToken {
    fn kill(&self) -> std::io::Result<()> {
        self.cancel();
        Ok(())
    }
}

/// Returned by [`ProcessRegistry::register`] when the key is already taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("a process is already registered under this key")]
pub struct AlreadyRegistered;

/// Proof of registration, required to deregister or kill a specific entry.
///
/// A stale registration (its entry was already removed, possibly replaced by
/// a newer process under the same key) never touches the newer entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Registration<K> {
    key: K,
    id: u64,
}

impl<K> Registration<K> {
    pub fn key(&self) -> &K {
        &self.key
    }
}

/// Outcome of [`ProcessRegistry::kill_all`].
#[derive(Debug, Default)]
pub struct KillReport<K> {
    /// Number of handles that accepted the kill request.
    pub killed: usize,
    /// Handles whose kill request failed. They are still removed.
    pub failed: Vec<(K, std::io::Error)>,
}

struct Entry {
    id: u64,
    handle: Box<dyn KillHandle>,
}

/// Thread-safe map from key to a killable process handle.
pub struct ProcessRegistry<K> {
    entries: Mutex<HashMap<K, Entry>>,
    next_id: AtomicU64,
}

impl<K> Default for ProcessRegistry<K>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> ProcessRegistry<K>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Track a running process under `key`.
    pub fn register(
        &self,
        key: K,
        handle: impl KillHandle + 'static,
    ) -> Result<Registration<K>, AlreadyRegistered> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&key) {
            return Err(AlreadyRegistered);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        entries.insert(
            key.clone(),
            Entry {
                id,
                handle: Box::new(handle),
            },
        );
        debug!(?key, "Registered process");
        Ok(Registration { key, id })
    }

    /// Remove the entry after normal completion.
    ///
    /// Returns `false` if the entry was already removed (killed or
    /// deregistered before).
    pub fn deregister(&self, registration: &Registration<K>) -> bool {
        self.take(registration).is_some()
    }

    /// Remove the entry and kill its process.
    ///
    /// Returns `None` if the entry was already removed.
    pub fn kill(&self, registration: &Registration<K>) -> Option<std::io::Result<()>> {
        // Take under the lock, kill outside of it.
        let entry = self.take(registration)?;
        debug!(key = ?registration.key, "Killing registered process");
        Some(entry.handle.kill())
    }

    /// Remove every entry and kill its process. Leaves the registry empty.
    pub fn kill_all(&self) -> KillReport<K> {
        let drained: Vec<(K, Entry)> = self.entries.lock().drain().collect();

        let mut report = KillReport {
            killed: 0,
            failed: Vec::new(),
        };
        for (key, entry) in drained {
            match entry.handle.kill() {
                Ok(()) => report.killed += 1,
                Err(e) => {
                    warn!(?key, error = %e, "Failed to kill process");
                    report.failed.push((key, e));
                }
            }
        }
        report
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Snapshot of the keys currently registered.
    pub fn keys(&self) -> Vec<K> {
        self.entries.lock().keys().cloned().collect()
    }

    fn take(&self, registration: &Registration<K>) -> Option<Entry> {
        let mut entries = self.entries.lock();
        match entries.get(&registration.key) {
            Some(entry) if entry.id == registration.id => entries.remove(&registration.key),
            _ => None,
        }
    }
}

impl<K: fmt::Debug> fmt::Debug for ProcessRegistry<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.lock();
        f.debug_struct("ProcessRegistry")
            .field("keys", &entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    /// Handle that counts how often it was killed.
    #[derive(Clone, Default)]
    struct CountingHandle {
        kills: Arc<AtomicUsize>,
    }

    impl KillHandle for CountingHandle {
        fn kill(&self) -> std::io::Result<()> {
            self.kills.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingHandle;

    impl KillHandle for FailingHandle {
        fn kill(&self) -> std::io::Result<()> {
            Err(std::io::Error::other("no such process"))
        }
    }

    #[test]
    fn test_register_and_deregister() {
        let registry = ProcessRegistry::new();
        let handle = CountingHandle::default();
        let reg = registry.register("job-1/720p", handle.clone()).unwrap();

        assert!(registry.contains(&"job-1/720p"));
        assert!(registry.deregister(&reg));
        assert!(!registry.deregister(&reg));
        assert!(registry.is_empty());
        assert_eq!(handle.kills.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let registry = ProcessRegistry::new();
        let _reg = registry.register("a", CountingHandle::default()).unwrap();
        assert_eq!(
            registry.register("a", CountingHandle::default()),
            Err(AlreadyRegistered)
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_kill_removes_entry() {
        let registry = ProcessRegistry::new();
        let handle = CountingHandle::default();
        let reg = registry.register("a", handle.clone()).unwrap();

        assert!(matches!(registry.kill(&reg), Some(Ok(()))));
        assert!(registry.kill(&reg).is_none());
        assert!(!registry.deregister(&reg));
        assert_eq!(handle.kills.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stale_registration_does_not_touch_new_entry() {
        let registry = ProcessRegistry::new();
        let first = CountingHandle::default();
        let second = CountingHandle::default();

        let old = registry.register("a", first.clone()).unwrap();
        registry.kill_all();
        let _new = registry.register("a", second.clone()).unwrap();

        assert!(!registry.deregister(&old));
        assert!(registry.kill(&old).is_none());
        assert!(registry.contains(&"a"));
        assert_eq!(second.kills.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_kill_all_reports_failures_and_empties() {
        let registry = ProcessRegistry::new();
        registry.register("ok", CountingHandle::default()).unwrap();
        registry.register("bad", FailingHandle).unwrap();

        let report = registry.kill_all();
        assert_eq!(report.killed, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "bad");
        assert!(registry.is_empty());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Register(u8),
        Deregister(usize),
        Kill(usize),
        KillAll,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..4).prop_map(Op::Register),
            any::<usize>().prop_map(Op::Deregister),
            any::<usize>().prop_map(Op::Kill),
            Just(Op::KillAll),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Every handle leaves the registry at most once, a deregistered
        /// handle is never killed, and kill_all always empties the registry.
        #[test]
        fn prop_each_handle_removed_once(ops in prop::collection::vec(op_strategy(), 1..60)) {
            let registry = ProcessRegistry::new();
            // (registration, handle, deregistered_ok)
            let mut issued: Vec<(Registration<u8>, CountingHandle, bool)> = Vec::new();

            for op in ops {
                match op {
                    Op::Register(key) => {
                        let handle = CountingHandle::default();
                        if let Ok(reg) = registry.register(key, handle.clone()) {
                            issued.push((reg, handle, false));
                        }
                    }
                    Op::Deregister(i) if !issued.is_empty() => {
                        let idx = i % issued.len();
                        if registry.deregister(&issued[idx].0) {
                            issued[idx].2 = true;
                        }
                    }
                    Op::Kill(i) if !issued.is_empty() => {
                        let idx = i % issued.len();
                        let _ = registry.kill(&issued[idx].0);
                    }
                    Op::KillAll => {
                        registry.kill_all();
                        prop_assert!(registry.is_empty());
                    }
                    _ => {}
                }
            }

            registry.kill_all();
            prop_assert!(registry.is_empty());

            for (_, handle, deregistered) in &issued {
                let kills = handle.kills.load(Ordering::SeqCst);
                if *deregistered {
                    prop_assert_eq!(kills, 0);
                } else {
                    prop_assert_eq!(kills, 1);
                }
            }
        }
    }
}
