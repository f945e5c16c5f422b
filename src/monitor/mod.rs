//! Per-endpoint call statistics.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

/// Aggregated timings and outcomes for one endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointStats {
    pub count: u64,
    pub errors: u64,
    pub min: Duration,
    pub max: Duration,
    pub total: Duration,
}

impl EndpointStats {
    fn record(&mut self, duration: Duration, success: bool) {
        if self.count == 0 || duration < self.min {
            self.min = duration;
        }
        self.max = self.max.max(duration);
        self.total += duration;
        self.count += 1;
        if !success {
            self.errors += 1;
        }
    }

    pub fn average(&self) -> Duration {
        match u32::try_from(self.count) {
            Ok(0) => Duration::ZERO,
            Ok(count) => self.total / count,
            Err(_) => Duration::from_secs_f64(self.total.as_secs_f64() / self.count as f64),
        }
    }

    /// Failed calls as a fraction of all calls, `0.0` when nothing was recorded.
    pub fn error_rate(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.errors as f64 / self.count as f64
        }
    }

    /// Millisecond view suitable for a JSON status endpoint.
    pub fn summary(&self) -> EndpointSummary {
        EndpointSummary {
            count: self.count,
            errors: self.errors,
            min_ms: self.min.as_secs_f64() * 1000.0,
            max_ms: self.max.as_secs_f64() * 1000.0,
            avg_ms: self.average().as_secs_f64() * 1000.0,
            error_rate: self.error_rate(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointSummary {
    pub count: u64,
    pub errors: u64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
    pub error_rate: f64,
}

/// Collects call timings keyed by endpoint. Shared by the client and the
/// monitoring middleware.
#[derive(Default)]
pub struct Monitor {
    endpoints: Mutex<HashMap<String, EndpointStats>>,
}

impl Monitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, endpoint: &str, duration: Duration, success: bool) {
        let mut endpoints = self.endpoints.lock();
        endpoints
            .entry(endpoint.to_owned())
            .or_default()
            .record(duration, success);
        debug!(endpoint, ?duration, success, "call recorded");
    }

    pub fn stats(&self, endpoint: &str) -> Option<EndpointStats> {
        self.endpoints.lock().get(endpoint).copied()
    }

    /// Summaries of every endpoint seen so far, ordered by endpoint.
    pub fn summaries(&self) -> BTreeMap<String, EndpointSummary> {
        self.endpoints
            .lock()
            .iter()
            .map(|(endpoint, stats)| (endpoint.clone(), stats.summary()))
            .collect()
    }

    pub fn reset(&self) {
        self.endpoints.lock().clear();
    }
}
