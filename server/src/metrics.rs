// Metrics collection and tracking

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use avatar_core::{StrategyKind, StreamStats};
use chrono::{DateTime, Utc};
use serde::Serialize;

const LATENCY_SAMPLES: usize = 1000;

/// Time from request arrival to the first response byte of `/mjpeg`
/// (fetch, decode, feature extraction).
#[derive(Debug, Default)]
pub struct SetupMetrics {
    request_count: AtomicU64,
    error_count: AtomicU64,
    total_latency_ms: AtomicU64,
    max_latency_ms: AtomicU64,
    samples: Mutex<VecDeque<u64>>,
}

impl SetupMetrics {
    pub fn record_request(&self, latency_ms: u64) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.max_latency_ms.fetch_max(latency_ms, Ordering::Relaxed);
        if let Ok(mut samples) = self.samples.lock() {
            if samples.len() == LATENCY_SAMPLES {
                samples.pop_front();
            }
            samples.push_back(latency_ms);
        }
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn avg_latency_ms(&self) -> f64 {
        let count = self.request_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.total_latency_ms.load(Ordering::Relaxed) as f64 / count as f64
    }

    fn percentile(&self, p: usize) -> u64 {
        let Ok(samples) = self.samples.lock() else {
            return 0;
        };
        if samples.is_empty() {
            return 0;
        }
        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        sorted.sort_unstable();
        sorted[(sorted.len() * p / 100).min(sorted.len() - 1)]
    }

    pub fn snapshot(&self) -> SetupStats {
        SetupStats {
            request_count: self.request_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            avg_latency_ms: self.avg_latency_ms(),
            max_latency_ms: self.max_latency_ms.load(Ordering::Relaxed),
            p50_latency_ms: self.percentile(50),
            p95_latency_ms: self.percentile(95),
        }
    }
}

/// Counters over every stream the process has served.
#[derive(Debug, Default)]
pub struct StreamMetrics {
    started: AtomicU64,
    completed: AtomicU64,
    aborted: AtomicU64,
    frames: AtomicU64,
    model_frames: AtomicU64,
    fallback_frames: AtomicU64,
    max_lag_ms: AtomicU64,
}

impl StreamMetrics {
    pub fn stream_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_emitted(&self, source: StrategyKind, lag: Duration) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        if source == StrategyKind::ModelBacked {
            self.model_frames.fetch_add(1, Ordering::Relaxed);
        }
        self.max_lag_ms.fetch_max(lag.as_millis() as u64, Ordering::Relaxed);
    }

    /// Record how a stream ended.
    pub fn stream_finished(&self, completed: bool, stats: &StreamStats) {
        if completed {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.aborted.fetch_add(1, Ordering::Relaxed);
        }
        self.fallback_frames
            .fetch_add(stats.fallback_frames as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StreamCounters {
        StreamCounters {
            started: self.started.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            frames_emitted: self.frames.load(Ordering::Relaxed),
            model_frames: self.model_frames.load(Ordering::Relaxed),
            fallback_frames: self.fallback_frames.load(Ordering::Relaxed),
            max_lag_ms: self.max_lag_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
pub struct AppMetrics {
    pub setup: SetupMetrics,
    pub streams: StreamMetrics,
}

#[derive(Serialize)]
pub struct MetricsResponse {
    pub timestamp: DateTime<Utc>,
    pub system: SystemMetrics,
    pub setup: SetupStats,
    pub streams: StreamCounters,
    pub avatar_cache: CacheStats,
}

#[derive(Serialize)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub memory_usage_percent: f32,
    pub request_count: u64,
    pub uptime_seconds: u64,
    pub system_load: Option<f64>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct SetupStats {
    pub request_count: u64,
    pub error_count: u64,
    pub avg_latency_ms: f64,
    pub max_latency_ms: u64,
    pub p50_latency_ms: u64,
    pub p95_latency_ms: u64,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct StreamCounters {
    pub started: u64,
    pub completed: u64,
    pub aborted: u64,
    pub frames_emitted: u64,
    pub model_frames: u64,
    pub fallback_frames: u64,
    pub max_lag_ms: u64,
}

#[derive(Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}
