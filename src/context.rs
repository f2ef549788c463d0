//! Per-request context registry.
//!
//! A [`RequestContext`] is created when a request is admitted and
//! destroyed when it completes; in between, the orchestrator records how
//! long each collaborator step took. Final metrics for the request are
//! emitted exactly once, at destruction. The registry is an explicitly
//! owned, lock-guarded store injected into the orchestrator — there is no
//! ambient global.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{info, warn};
use uuid::Uuid;

/// Timing state for one in-flight request.
struct RequestContext {
    start_time: Instant,
    /// Step name → duration, in call order.
    service_timings: Vec<(&'static str, Duration)>,
}

/// Process-wide map from request id to in-flight context.
#[derive(Clone)]
pub struct RequestContextRegistry {
    contexts: Arc<Mutex<HashMap<String, RequestContext>>>,
}

impl Default for RequestContextRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestContextRegistry {
    pub fn new() -> Self {
        Self {
            contexts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create a context and return its generated request id.
    pub fn create(&self) -> String {
        let request_id = Uuid::new_v4().to_string();
        let context = RequestContext {
            start_time: Instant::now(),
            service_timings: Vec::new(),
        };
        self.contexts
            .lock()
            .expect("context registry poisoned")
            .insert(request_id.clone(), context);
        info!(request_id = %request_id, "created request context");
        request_id
    }

    /// Record how long a collaborator step took. Emits the step metric
    /// immediately; the aggregate is emitted at [`finish`](Self::finish).
    pub fn record_timing(&self, request_id: &str, step: &'static str, duration: Duration) {
        let mut contexts = self.contexts.lock().expect("context registry poisoned");
        match contexts.get_mut(request_id) {
            Some(ctx) => {
                ctx.service_timings.push((step, duration));
                info!(
                    request_id = %request_id,
                    service = step,
                    duration_secs = duration.as_secs_f64(),
                    "service timing"
                );
            }
            None => {
                warn!(request_id = %request_id, service = step, "timing for unknown request context");
            }
        }
    }

    /// Destroy the context and emit its final metrics record. Idempotent:
    /// a second finish for the same id is a no-op.
    pub fn finish(&self, request_id: &str) {
        let removed = self
            .contexts
            .lock()
            .expect("context registry poisoned")
            .remove(request_id);

        if let Some(ctx) = removed {
            let timings: Vec<String> = ctx
                .service_timings
                .iter()
                .map(|(step, d)| format!("{}={:.3}s", step, d.as_secs_f64()))
                .collect();
            info!(
                request_id = %request_id,
                total_duration_secs = ctx.start_time.elapsed().as_secs_f64(),
                service_timings = %timings.join(","),
                "request completed"
            );
        }
    }

    /// Number of requests currently in flight.
    pub fn active_count(&self) -> usize {
        self.contexts.lock().expect("context registry poisoned").len()
    }
}
