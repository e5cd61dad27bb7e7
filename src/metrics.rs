//! Rolling latency / throughput counters
//!
//! Both roles keep a bounded ring of per-message samples. Latency is the
//! difference between the local clock and the timestamp embedded by the
//! sender; master and slave clocks are not synchronized, so the value is
//! indicative, not authoritative.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::protocol::SyncMessage;

/// Default ring capacity
pub const METRICS_WINDOW: usize = 512;

/// How many recent samples are returned for display
const RECENT_SAMPLES: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    pub timestamp: i64,
    pub message_type: String,
    pub latency_ms: f64,
    pub byte_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerfMetrics {
    pub average_latency_ms: f64,
    pub total_messages: usize,
    pub messages_per_second: f64,
    pub total_bytes: usize,
    pub recent_metrics: Vec<MetricSample>,
}

/// Bounded sample ring. Single writer per role; snapshots for readers.
pub struct MetricsRecorder {
    samples: Mutex<VecDeque<MetricSample>>,
    capacity: usize,
}

impl MetricsRecorder {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Record a received sync message, deriving latency from its embedded
    /// sender timestamp. Negative skew clamps to zero.
    pub fn record_message(&self, message: &SyncMessage, byte_count: usize) {
        let now = chrono::Utc::now().timestamp_millis();
        let latency_ms = (now - message.timestamp).max(0) as f64;
        self.record(message.kind.as_str(), latency_ms, byte_count);
    }

    pub fn record(&self, message_type: &str, latency_ms: f64, byte_count: usize) {
        let sample = MetricSample {
            timestamp: chrono::Utc::now().timestamp_millis(),
            message_type: message_type.to_string(),
            latency_ms,
            byte_count,
        };

        let mut samples = self.samples.lock();
        if samples.len() >= self.capacity {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    /// Aggregate the current window
    pub fn snapshot(&self) -> PerfMetrics {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return PerfMetrics {
                average_latency_ms: 0.0,
                total_messages: 0,
                messages_per_second: 0.0,
                total_bytes: 0,
                recent_metrics: Vec::new(),
            };
        }

        let total_messages = samples.len();
        let average_latency_ms =
            samples.iter().map(|s| s.latency_ms).sum::<f64>() / total_messages as f64;
        let total_bytes: usize = samples.iter().map(|s| s.byte_count).sum();

        // Rate over the window span; a single sample has no span
        let messages_per_second = if total_messages > 1 {
            let span_secs = (samples.back().unwrap().timestamp
                - samples.front().unwrap().timestamp) as f64
                / 1000.0;
            if span_secs > 0.0 {
                total_messages as f64 / span_secs
            } else {
                0.0
            }
        } else {
            0.0
        };

        PerfMetrics {
            average_latency_ms,
            total_messages,
            messages_per_second,
            total_bytes,
            recent_metrics: samples
                .iter()
                .rev()
                .take(RECENT_SAMPLES)
                .cloned()
                .collect(),
        }
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new(METRICS_WINDOW)
    }
}
