//! In-process metrics sink.
//!
//! Counters, gauges, histograms with a bounded sample window, and timers.
//! Cheap enough to call from hot paths; the snapshot feeds the rich status
//! view.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Samples retained per histogram.
const HISTOGRAM_WINDOW: usize = 512;

#[derive(Debug, Default)]
struct MetricsState {
    counters: HashMap<String, u64>,
    gauges: HashMap<String, f64>,
    histograms: HashMap<String, Vec<f64>>,
}

/// Summary of one histogram's sample window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramSummary {
    pub count: usize,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub max: f64,
}

/// Point-in-time view of all metrics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, f64>,
    pub histograms: HashMap<String, HistogramSummary>,
}

/// Registry of counters, gauges, histograms, and timers.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    state: Mutex<MetricsState>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by 1.
    pub fn incr(&self, name: &str) {
        self.incr_by(name, 1);
    }

    /// Increment a counter by `delta`.
    pub fn incr_by(&self, name: &str, delta: u64) {
        if let Ok(mut state) = self.state.lock() {
            *state.counters.entry(name.to_string()).or_insert(0) += delta;
        }
    }

    /// Set a gauge to an absolute value.
    pub fn gauge(&self, name: &str, value: f64) {
        if let Ok(mut state) = self.state.lock() {
            state.gauges.insert(name.to_string(), value);
        }
    }

    /// Record a histogram sample.
    pub fn observe(&self, name: &str, value: f64) {
        if let Ok(mut state) = self.state.lock() {
            let samples = state.histograms.entry(name.to_string()).or_default();
            if samples.len() == HISTOGRAM_WINDOW {
                samples.remove(0);
            }
            samples.push(value);
        }
    }

    /// Start a timer that records elapsed milliseconds into a histogram on
    /// drop.
    pub fn timer(self: &Arc<Self>, name: impl Into<String>) -> TimerGuard {
        TimerGuard {
            registry: Arc::clone(self),
            name: name.into(),
            started: Instant::now(),
        }
    }

    /// Current value of a counter (0 if never incremented).
    pub fn counter_value(&self, name: &str) -> u64 {
        self.state
            .lock()
            .map(|state| state.counters.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Current value of a gauge.
    pub fn gauge_value(&self, name: &str) -> Option<f64> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.gauges.get(name).copied())
    }

    /// Snapshot all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let Ok(state) = self.state.lock() else {
            return MetricsSnapshot::default();
        };
        let histograms = state
            .histograms
            .iter()
            .filter(|(_, samples)| !samples.is_empty())
            .map(|(name, samples)| (name.clone(), summarize(samples)))
            .collect();
        MetricsSnapshot {
            counters: state.counters.clone(),
            gauges: state.gauges.clone(),
            histograms,
        }
    }
}

fn summarize(samples: &[f64]) -> HistogramSummary {
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let count = sorted.len();
    let mean = sorted.iter().sum::<f64>() / count as f64;
    let percentile = |p: f64| {
        let idx = ((count as f64 - 1.0) * p).round() as usize;
        sorted[idx]
    };
    HistogramSummary {
        count,
        mean,
        p50: percentile(0.5),
        p95: percentile(0.95),
        max: sorted[count - 1],
    }
}

/// Records elapsed wall time into a histogram when dropped.
pub struct TimerGuard {
    registry: Arc<MetricsRegistry>,
    name: String,
    started: Instant,
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        self.registry.observe(&self.name, elapsed_ms);
    }
}

/// Well-known metric names.
pub mod names {
    pub const TASKS_SUBMITTED: &str = "scheduler.tasks.submitted";
    pub const TASKS_COMPLETED: &str = "scheduler.tasks.completed";
    pub const TASKS_FAILED: &str = "scheduler.tasks.failed";
    pub const TASKS_RETRIED: &str = "scheduler.tasks.retried";
    pub const TASKS_CANCELLED: &str = "scheduler.tasks.cancelled";
    pub const AGENTS_TOTAL: &str = "scheduler.agents.total";
    pub const TASK_WAIT_TIME: &str = "scheduler.task_wait_time";
    pub const TASK_EXECUTION_TIME: &str = "scheduler.task_execution_time";
    pub const SCHEDULE_TICK_TIME: &str = "scheduler.tick_time";

    pub const SWARM_TASKS_COMPLETED: &str = "swarm.tasks.completed";
    pub const SWARM_TASKS_FAILED: &str = "swarm.tasks.failed";
    pub const SWARM_WORKERS_CREATED: &str = "swarm.workers.created";
    pub const SWARM_WORKERS_REMOVED: &str = "swarm.workers.removed";
    pub const SWARM_WORKERS_CREATION_FAILED: &str = "swarm.workers.creation_failed";
    pub const SWARM_WORKERS_ACTIVE: &str = "swarm.workers.active";
    pub const SWARM_EXECUTION_TIME: &str = "swarm.execution_time";
    pub const SUBTASK_EXECUTION_TIME: &str = "swarm.subtask_execution_time";

    pub const LB_SELECTIONS_SUCCESS: &str = "loadbalancer.selections.success";
    pub const LB_SELECTIONS_FAILED: &str = "loadbalancer.selections.failed";
    pub const LB_RESPONSE_TIME: &str = "loadbalancer.response_time";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let registry = MetricsRegistry::new();
        registry.incr(names::TASKS_SUBMITTED);
        registry.incr_by(names::TASKS_SUBMITTED, 2);
        assert_eq!(registry.counter_value(names::TASKS_SUBMITTED), 3);
        assert_eq!(registry.counter_value("unknown"), 0);
    }

    #[test]
    fn test_gauges() {
        let registry = MetricsRegistry::new();
        registry.gauge(names::AGENTS_TOTAL, 4.0);
        registry.gauge(names::AGENTS_TOTAL, 2.0);
        assert_eq!(registry.gauge_value(names::AGENTS_TOTAL), Some(2.0));
    }

    #[test]
    fn test_histogram_summary() {
        let registry = MetricsRegistry::new();
        for v in [10.0, 20.0, 30.0, 40.0, 100.0] {
            registry.observe(names::TASK_WAIT_TIME, v);
        }
        let snapshot = registry.snapshot();
        let summary = snapshot.histograms.get(names::TASK_WAIT_TIME).unwrap();
        assert_eq!(summary.count, 5);
        assert!((summary.mean - 40.0).abs() < f64::EPSILON);
        assert!((summary.p50 - 30.0).abs() < f64::EPSILON);
        assert!((summary.max - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_timer_records_sample() {
        let registry = Arc::new(MetricsRegistry::new());
        {
            let _guard = registry.timer(names::SCHEDULE_TICK_TIME);
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let snapshot = registry.snapshot();
        let summary = snapshot.histograms.get(names::SCHEDULE_TICK_TIME).unwrap();
        assert_eq!(summary.count, 1);
        assert!(summary.max >= 5.0);
    }

    #[test]
    fn test_histogram_window_bounded() {
        let registry = MetricsRegistry::new();
        for i in 0..(HISTOGRAM_WINDOW + 100) {
            registry.observe("h", i as f64);
        }
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.histograms.get("h").unwrap().count, HISTOGRAM_WINDOW);
    }
}
