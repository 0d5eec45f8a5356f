//! Timing statistics for a single inference call.
//!
//! Numbers here are computed from wall-clock time and an observed token
//! count. They are comparable across backends but approximate; the
//! backend's own usage figures travel separately as `server_stats`.

use std::time::{Duration, Instant};

use serde::Serialize;

/// Snapshot taken when the first fragment arrives.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionStats {
    /// Milliseconds from call start to first fragment.
    pub ingestion_time: u64,
    pub ingestion_time_seconds: f64,
}

/// Full statistics for a completed call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceStats {
    pub ingestion_time: u64,
    /// Generation time in milliseconds (total minus ingestion).
    pub inference_time: u64,
    pub total_time: u64,
    pub ingestion_time_seconds: f64,
    pub inference_time_seconds: f64,
    pub total_time_seconds: f64,
    pub total_tokens: u64,
    pub tokens_per_second: f64,
}

impl InferenceStats {
    /// Derive the statistics from measured durations.
    ///
    /// `ingestion` is clamped to `total`. Throughput is computed from the
    /// reported whole-millisecond generation time, so it is zero whenever
    /// `inference_time` is.
    pub fn compute(ingestion: Duration, total: Duration, total_tokens: u64) -> Self {
        let ingestion = ingestion.min(total);
        let generation = total - ingestion;

        let inference_time = millis(generation);
        let tokens_per_second = if inference_time > 0 {
            round1(total_tokens as f64 / (inference_time as f64 / 1000.0))
        } else {
            0.0
        };

        InferenceStats {
            ingestion_time: millis(ingestion),
            inference_time,
            total_time: millis(total),
            ingestion_time_seconds: seconds(ingestion),
            inference_time_seconds: seconds(generation),
            total_time_seconds: seconds(total),
            total_tokens,
            tokens_per_second,
        }
    }
}

/// Per-call clock. Not shared across calls.
#[derive(Debug, Clone)]
pub struct StatsEngine {
    started: Instant,
    first_token: Option<Duration>,
}

impl StatsEngine {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            first_token: None,
        }
    }

    /// Record the ingestion duration. Only the first call has an effect;
    /// later calls return `None`.
    pub fn mark_first_token(&mut self) -> Option<IngestionStats> {
        if self.first_token.is_some() {
            return None;
        }
        let elapsed = self.started.elapsed();
        self.first_token = Some(elapsed);
        Some(IngestionStats {
            ingestion_time: millis(elapsed),
            ingestion_time_seconds: seconds(elapsed),
        })
    }

    pub fn has_first_token(&self) -> bool {
        self.first_token.is_some()
    }

    /// Close the measurement. A call that never produced a fragment counts
    /// its whole duration as ingestion.
    pub fn finish(&self, total_tokens: u64) -> InferenceStats {
        let total = self.started.elapsed();
        let ingestion = self.first_token.unwrap_or(total);
        InferenceStats::compute(ingestion, total, total_tokens)
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis().min(u128::from(u64::MAX)) as u64
}

fn seconds(d: Duration) -> f64 {
    round1(d.as_secs_f64())
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

// ─── Tests ───────────────────────────────────────────────────────────────────
