//! Scoped resource transactions with guaranteed cleanup.
//!
//! A [`Transaction`] groups the side-effecting resources a request
//! creates (saved uploads, temp files) so they can be torn down together
//! on every exit path. Cleanup runs in reverse registration order — the
//! last-registered resource is the most dependent — and attempts every
//! resource even after a failure, aggregating all failures into one
//! [`CleanupError`] so "workflow failed" and "workflow succeeded but
//! cleanup partially failed" stay distinguishable.
//!
//! The [`TransactionManager`] owns the process-wide set of active
//! transactions, rejects duplicate request ids, and sweeps transactions
//! that outlive `max_age` — the safety net for scopes that never closed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{error, info};

use crate::error::{CleanupError, GatewayError};

/// A resource whose teardown the transaction guarantees.
pub trait Resource: Send + Sync {
    /// Stable identifier, e.g. a file path.
    fn id(&self) -> String;

    /// Resource kind label for logs, e.g. `"file"`.
    fn kind(&self) -> &'static str;

    /// Whether this resource is scratch state. Temporary resources are
    /// cleaned on every exit; durable ones survive a successful commit
    /// and are only removed on rollback or a stale sweep.
    fn is_temp(&self) -> bool {
        true
    }

    /// Tear the resource down. Must be idempotent against an
    /// already-absent resource.
    fn cleanup(&self) -> Result<(), String>;
}

/// A file or directory on disk.
///
/// `is_temp` marks scratch files that any cleanup may delete. A
/// non-temporary file is the request's durable output: rollback and
/// stale sweeps delete it (the request failed, so the file must not
/// leak), but a committed transaction leaves it in place.
pub struct FileResource {
    path: PathBuf,
    is_temp: bool,
}

impl FileResource {
    pub fn temp(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            is_temp: true,
        }
    }

    pub fn durable(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            is_temp: false,
        }
    }

    fn remove(&self) -> Result<(), String> {
        if !self.path.exists() {
            return Ok(());
        }
        let result = if self.path.is_dir() {
            std::fs::remove_dir_all(&self.path)
        } else {
            std::fs::remove_file(&self.path)
        };
        result.map_err(|e| format!("failed to clean up file {}: {}", self.path.display(), e))
    }
}

impl Resource for FileResource {
    fn id(&self) -> String {
        self.path.display().to_string()
    }

    fn kind(&self) -> &'static str {
        "file"
    }

    fn is_temp(&self) -> bool {
        self.is_temp
    }

    fn cleanup(&self) -> Result<(), String> {
        self.remove()
    }
}

/// Terminal state of a transaction, set exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Active,
    Completed,
    Failed,
}

struct TransactionInner {
    request_id: String,
    resources: Vec<Box<dyn Resource>>,
    started_at: Instant,
    outcome: Outcome,
    /// When true, cleanup skips non-temporary resources: the workflow
    /// succeeded and its durable outputs must survive.
    keep_durable: bool,
}

impl TransactionInner {
    /// Clean registered resources in reverse registration order,
    /// attempting all of them and draining those that succeed so a later
    /// sweep never cleans them a second time.
    fn cleanup(&mut self) -> Result<(), CleanupError> {
        let mut failures = Vec::new();
        let mut remaining: Vec<Box<dyn Resource>> = Vec::new();

        for resource in self.resources.drain(..).rev() {
            if self.keep_durable && !resource.is_temp() {
                continue;
            }
            match resource.cleanup() {
                Ok(()) => {
                    info!(
                        request_id = %self.request_id,
                        resource_kind = resource.kind(),
                        resource_id = %resource.id(),
                        "cleaned up resource"
                    );
                }
                Err(e) => {
                    error!(
                        request_id = %self.request_id,
                        resource_kind = resource.kind(),
                        resource_id = %resource.id(),
                        error = %e,
                        "resource cleanup failed"
                    );
                    failures.push(e);
                    remaining.push(resource);
                }
            }
        }

        // Failed resources stay registered so a stale sweep can retry them.
        remaining.reverse();
        self.resources = remaining;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CleanupError::new(failures))
        }
    }
}

/// Handle to one request's transaction. Obtained from
/// [`TransactionManager::begin`]; must be finished with exactly one of
/// [`commit`](Transaction::commit) or [`rollback`](Transaction::rollback).
pub struct Transaction {
    inner: Arc<Mutex<TransactionInner>>,
    manager: TransactionManager,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("request_id", &self.request_id())
            .finish_non_exhaustive()
    }
}

impl Transaction {
    pub fn request_id(&self) -> String {
        self.inner.lock().expect("transaction lock poisoned").request_id.clone()
    }

    /// Register a resource for cleanup. No teardown happens yet.
    pub fn register(&self, resource: Box<dyn Resource>) {
        let mut inner = self.inner.lock().expect("transaction lock poisoned");
        info!(
            request_id = %inner.request_id,
            resource_kind = resource.kind(),
            resource_id = %resource.id(),
            "registered resource"
        );
        inner.resources.push(resource);
    }

    /// Successful exit: clean temporary resources, keep durable ones,
    /// mark completed. Cleanup failures are returned but the transaction
    /// still terminates.
    pub fn commit(self) -> Result<(), CleanupError> {
        self.finish(Outcome::Completed, true)
    }

    /// Failed exit: clean everything, durable resources included, mark
    /// failed.
    pub fn rollback(self) -> Result<(), CleanupError> {
        self.finish(Outcome::Failed, false)
    }

    fn finish(self, outcome: Outcome, keep_durable: bool) -> Result<(), CleanupError> {
        let result = {
            let mut inner = self.inner.lock().expect("transaction lock poisoned");
            inner.keep_durable = keep_durable;
            let result = inner.cleanup();
            inner.outcome = outcome;

            info!(
                request_id = %inner.request_id,
                duration_secs = inner.started_at.elapsed().as_secs_f64(),
                status = ?outcome,
                "transaction finished"
            );
            result
        };
        self.manager.remove(&self.request_id());
        result
    }
}

/// Process-wide registry of active transactions.
///
/// Cloning shares the underlying set; the orchestrator holds one clone,
/// the sweep path another.
#[derive(Clone)]
pub struct TransactionManager {
    active: Arc<Mutex<HashMap<String, Arc<Mutex<TransactionInner>>>>>,
    max_age: Duration,
}

impl TransactionManager {
    pub fn new(max_age: Duration) -> Self {
        Self {
            active: Arc::new(Mutex::new(HashMap::new())),
            max_age,
        }
    }

    /// Start a transaction for `request_id`. A second begin for the same
    /// id while the first is active is a collision, never a merge.
    pub fn begin(&self, request_id: &str) -> Result<Transaction, GatewayError> {
        let inner = Arc::new(Mutex::new(TransactionInner {
            request_id: request_id.to_string(),
            resources: Vec::new(),
            started_at: Instant::now(),
            outcome: Outcome::Active,
            keep_durable: false,
        }));

        {
            let mut active = self.active.lock().expect("transaction registry poisoned");
            if active.contains_key(request_id) {
                return Err(GatewayError::TransactionCollision(request_id.to_string()));
            }
            active.insert(request_id.to_string(), inner.clone());
        }

        info!(request_id = %request_id, "starting transaction");
        Ok(Transaction {
            inner,
            manager: self.clone(),
        })
    }

    fn remove(&self, request_id: &str) {
        self.active
            .lock()
            .expect("transaction registry poisoned")
            .remove(request_id);
    }

    /// Force-clean and drop every active transaction older than the
    /// configured `max_age`. Safety net for scopes that never closed;
    /// returns the number of transactions swept.
    pub fn sweep_stale(&self) -> usize {
        let stale: Vec<(String, Arc<Mutex<TransactionInner>>)> = {
            let active = self.active.lock().expect("transaction registry poisoned");
            active
                .iter()
                .filter(|(_, inner)| {
                    inner
                        .lock()
                        .expect("transaction lock poisoned")
                        .started_at
                        .elapsed()
                        > self.max_age
                })
                .map(|(id, inner)| (id.clone(), inner.clone()))
                .collect()
        };

        let mut swept = 0;
        for (request_id, inner) in stale {
            let mut guard = inner.lock().expect("transaction lock poisoned");
            match guard.cleanup() {
                Ok(()) => {
                    info!(request_id = %request_id, "swept stale transaction");
                }
                Err(e) => {
                    error!(request_id = %request_id, error = %e, "failed to sweep stale transaction");
                }
            }
            guard.outcome = Outcome::Failed;
            drop(guard);
            self.remove(&request_id);
            swept += 1;
        }
        swept
    }

    /// Number of currently active transactions.
    pub fn active_count(&self) -> usize {
        self.active.lock().expect("transaction registry poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records the order its cleanup runs in; optionally fails.
    struct ProbeResource {
        label: &'static str,
        order: Arc<Mutex<Vec<&'static str>>>,
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl ProbeResource {
        fn new(
            label: &'static str,
            order: &Arc<Mutex<Vec<&'static str>>>,
            fail: bool,
        ) -> (Box<Self>, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Box::new(Self {
                    label,
                    order: order.clone(),
                    calls: calls.clone(),
                    fail,
                }),
                calls,
            )
        }
    }

    impl Resource for ProbeResource {
        fn id(&self) -> String {
            self.label.to_string()
        }
        fn kind(&self) -> &'static str {
            "probe"
        }
        fn cleanup(&self) -> Result<(), String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.order.lock().unwrap().push(self.label);
            if self.fail {
                Err(format!("{} exploded", self.label))
            } else {
                Ok(())
            }
        }
    }

    fn manager() -> TransactionManager {
        TransactionManager::new(Duration::from_secs(3600))
    }

    #[test]
    fn commit_cleans_in_reverse_order_exactly_once() {
        let mgr = manager();
        let order = Arc::new(Mutex::new(Vec::new()));

        let txn = mgr.begin("r1").unwrap();
        let (a, a_calls) = ProbeResource::new("a", &order, false);
        let (b, b_calls) = ProbeResource::new("b", &order, false);
        let (c, c_calls) = ProbeResource::new("c", &order, false);
        txn.register(a);
        txn.register(b);
        txn.register(c);

        txn.commit().unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["c", "b", "a"]);
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
        assert_eq!(c_calls.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.active_count(), 0);
    }

    #[test]
    fn rollback_also_cleans_every_resource() {
        let mgr = manager();
        let order = Arc::new(Mutex::new(Vec::new()));

        let txn = mgr.begin("r1").unwrap();
        let (a, a_calls) = ProbeResource::new("a", &order, false);
        txn.register(a);
        txn.rollback().unwrap();

        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.active_count(), 0);
    }

    #[test]
    fn failing_resource_does_not_stop_earlier_cleanups() {
        let mgr = manager();
        let order = Arc::new(Mutex::new(Vec::new()));

        let txn = mgr.begin("r1").unwrap();
        let (a, _) = ProbeResource::new("a", &order, false);
        let (b, _) = ProbeResource::new("b", &order, true);
        let (c, _) = ProbeResource::new("c", &order, true);
        txn.register(a);
        txn.register(b);
        txn.register(c);

        let err = txn.commit().unwrap_err();

        // All three were attempted despite two failures...
        assert_eq!(*order.lock().unwrap(), vec!["c", "b", "a"]);
        // ...and the aggregate error names every failure.
        assert_eq!(err.failures.len(), 2);
        assert!(err.failures.iter().any(|f| f.contains("b exploded")));
        assert!(err.failures.iter().any(|f| f.contains("c exploded")));
    }

    #[test]
    fn duplicate_request_id_is_a_collision() {
        let mgr = manager();
        let _txn = mgr.begin("r1").unwrap();
        let err = mgr.begin("r1").unwrap_err();
        assert!(matches!(err, GatewayError::TransactionCollision(_)));
    }

    #[test]
    fn request_id_free_again_after_finish() {
        let mgr = manager();
        let txn = mgr.begin("r1").unwrap();
        txn.commit().unwrap();
        assert!(mgr.begin("r1").is_ok());
    }

    #[test]
    fn sweep_ignores_fresh_cleans_stale() {
        let mgr = TransactionManager::new(Duration::from_millis(10));
        let order = Arc::new(Mutex::new(Vec::new()));

        let txn = mgr.begin("stale").unwrap();
        let (a, a_calls) = ProbeResource::new("a", &order, false);
        txn.register(a);
        // Leak the handle: the scope never closed.
        std::mem::forget(txn);

        assert_eq!(mgr.sweep_stale(), 0, "fresh transaction must not be swept");
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(mgr.sweep_stale(), 1);
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.active_count(), 0);

        // A cleaned resource is gone; a second sweep finds nothing.
        assert_eq!(mgr.sweep_stale(), 0);
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn commit_keeps_durable_file_rollback_removes_it() {
        let tmp = tempfile::tempdir().unwrap();
        let kept = tmp.path().join("kept.txt");
        let removed = tmp.path().join("removed.txt");
        std::fs::write(&kept, "x").unwrap();
        std::fs::write(&removed, "x").unwrap();

        let mgr = manager();
        let txn = mgr.begin("r1").unwrap();
        txn.register(Box::new(FileResource::durable(&kept)));
        txn.commit().unwrap();
        assert!(kept.exists(), "durable file deleted on commit");

        let txn = mgr.begin("r2").unwrap();
        txn.register(Box::new(FileResource::durable(&removed)));
        txn.rollback().unwrap();
        assert!(!removed.exists(), "durable file survived rollback");
    }

    #[test]
    fn temp_file_removed_on_commit() {
        let tmp = tempfile::tempdir().unwrap();
        let scratch = tmp.path().join("scratch.txt");
        std::fs::write(&scratch, "x").unwrap();

        let mgr = manager();
        let txn = mgr.begin("r1").unwrap();
        txn.register(Box::new(FileResource::temp(&scratch)));
        txn.commit().unwrap();
        assert!(!scratch.exists());
    }

    #[test]
    fn cleanup_of_missing_file_is_ok() {
        let mgr = manager();
        let txn = mgr.begin("r1").unwrap();
        txn.register(Box::new(FileResource::temp("/nonexistent/never/was.txt")));
        txn.commit().unwrap();
    }
}
