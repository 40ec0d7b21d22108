use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Lifetime counters for native objects, plus per-model outcome counts.
#[derive(Debug, Default)]
pub struct EngineStats {
    requests_created: AtomicU64,
    requests_released: AtomicU64,
    responses_created: AtomicU64,
    responses_released: AtomicU64,
    models: Mutex<BTreeMap<String, ModelCounters>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ModelCounters {
    pub success: u64,
    pub failure: u64,
    pub compute_nanos: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub requests_created: u64,
    pub requests_released: u64,
    pub responses_created: u64,
    pub responses_released: u64,
}

impl StatsSnapshot {
    pub fn live_requests(&self) -> u64 {
        self.requests_created.saturating_sub(self.requests_released)
    }

    pub fn live_responses(&self) -> u64 {
        self.responses_created.saturating_sub(self.responses_released)
    }
}

impl EngineStats {
    pub(crate) fn request_created(&self) {
        self.requests_created.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn request_released(&self) {
        self.requests_released.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn response_created(&self) {
        self.responses_created.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn response_released(&self) {
        self.responses_released.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record(&self, model: &str, ok: bool, compute: Duration) {
        let mut models = self.models.lock().unwrap_or_else(PoisonError::into_inner);
        let counters = models.entry(model.to_string()).or_default();
        if ok {
            counters.success += 1;
        } else {
            counters.failure += 1;
        }
        counters.compute_nanos += u64::try_from(compute.as_nanos()).unwrap_or(u64::MAX);
    }

    /// Release counters are read before creation counters, so a snapshot
    /// never reports more releases than creations.
    pub fn snapshot(&self) -> StatsSnapshot {
        let requests_released = self.requests_released.load(Ordering::SeqCst);
        let responses_released = self.responses_released.load(Ordering::SeqCst);
        StatsSnapshot {
            requests_created: self.requests_created.load(Ordering::SeqCst),
            requests_released,
            responses_created: self.responses_created.load(Ordering::SeqCst),
            responses_released,
        }
    }

    pub fn model(&self, name: &str) -> ModelCounters {
        self.models
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
            .unwrap_or_default()
    }

    /// Prometheus text exposition of every counter.
    pub fn render(&self, versions: &BTreeMap<String, i64>) -> String {
        let models = self.models.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = String::new();
        let mut family = |name: &str,
                          help: &str,
                          kind: &str,
                          value: &dyn Fn(&ModelCounters) -> u64| {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} {kind}");
            for (model, counters) in models.iter() {
                let version = versions.get(model).copied().unwrap_or(1);
                let _ = writeln!(
                    out,
                    "{name}{{model=\"{model}\",version=\"{version}\"}} {}",
                    value(counters)
                );
            }
        };
        family(
            "embedinfer_inference_request_success",
            "Number of successful inference requests",
            "counter",
            &|c: &ModelCounters| c.success,
        );
        family(
            "embedinfer_inference_request_failure",
            "Number of failed inference requests",
            "counter",
            &|c: &ModelCounters| c.failure,
        );
        family(
            "embedinfer_inference_compute_duration_ns",
            "Cumulative model execution time in nanoseconds",
            "counter",
            &|c: &ModelCounters| c.compute_nanos,
        );

        let snap = self.snapshot();
        let _ = writeln!(out, "# HELP embedinfer_live_requests Native requests not yet released");
        let _ = writeln!(out, "# TYPE embedinfer_live_requests gauge");
        let _ = writeln!(out, "embedinfer_live_requests {}", snap.live_requests());
        let _ = writeln!(out, "# HELP embedinfer_live_responses Responses not yet released");
        let _ = writeln!(out, "# TYPE embedinfer_live_responses gauge");
        let _ = writeln!(out, "embedinfer_live_responses {}", snap.live_responses());
        out
    }
}
