//! Frame timing monitor
//!
//! Keeps a fixed-size sliding window of recent frame arrivals and turns it
//! into a [`PerformanceSnapshot`] on demand. Ingestion records into it; the
//! quality controller reads from it on its tick.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Number of recent frame arrivals kept
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Span over which FPS is measured (milliseconds)
    #[serde(default = "default_fps_window_ms")]
    pub fps_window_ms: u64,

    /// Nominal camera frame rate, used for the overhead ratio
    #[serde(default = "default_nominal_fps")]
    pub nominal_fps: f64,
}

fn default_window_size() -> usize {
    120
}
fn default_fps_window_ms() -> u64 {
    5000
}
fn default_nominal_fps() -> f64 {
    30.0
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            fps_window_ms: default_fps_window_ms(),
            nominal_fps: default_nominal_fps(),
        }
    }
}

/// Rolling performance aggregate
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PerformanceSnapshot {
    /// Mean processing latency over the window
    pub avg_latency: Duration,
    /// Dropped share of frames seen since the previous snapshot
    pub drop_rate: f64,
    /// Processing latency relative to the nominal frame interval
    pub processing_overhead_ratio: f64,
    /// Frame buffer fill level in 0.0..=1.0
    pub buffer_utilization: f64,
    /// Standard deviation of inter-arrival intervals, in seconds
    pub jitter: f64,
    /// Measured ingest frame rate
    pub fps: f64,
    /// Samples the aggregate was computed from
    pub sample_count: usize,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    arrived_at: Instant,
    latency: Duration,
}

#[derive(Debug, Default)]
struct MonitorState {
    samples: VecDeque<Sample>,
    received_since_snapshot: u64,
    dropped_since_snapshot: u64,
    first_arrival: Option<Instant>,
}

/// Sliding-window frame timing monitor
pub struct PerformanceMonitor {
    config: MonitorConfig,
    state: Mutex<MonitorState>,
}

impl PerformanceMonitor {
    /// Create an empty monitor
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config: MonitorConfig {
                window_size: config.window_size.max(2),
                ..config
            },
            state: Mutex::new(MonitorState::default()),
        }
    }

    /// Record a frame that just arrived
    pub fn record_frame(&self, latency: Duration) {
        self.record_frame_at(Instant::now(), latency);
    }

    /// Record a frame arrival at an explicit instant
    pub fn record_frame_at(&self, arrived_at: Instant, latency: Duration) {
        let mut state = self.state.lock();
        state.first_arrival.get_or_insert(arrived_at);
        state.received_since_snapshot += 1;
        state.samples.push_back(Sample {
            arrived_at,
            latency,
        });
        while state.samples.len() > self.config.window_size {
            state.samples.pop_front();
        }
    }

    /// Record frames lost to eviction or validation
    pub fn record_dropped(&self, count: u64) {
        if count > 0 {
            self.state.lock().dropped_since_snapshot += count;
        }
    }

    /// Compute the aggregate now
    pub fn snapshot(&self, buffer_utilization: f64) -> PerformanceSnapshot {
        self.snapshot_at(Instant::now(), buffer_utilization)
    }

    /// Compute the aggregate as of `now`; resets the drop-rate counters
    pub fn snapshot_at(&self, now: Instant, buffer_utilization: f64) -> PerformanceSnapshot {
        let mut state = self.state.lock();

        let seen = state.received_since_snapshot + state.dropped_since_snapshot;
        let drop_rate = if seen == 0 {
            0.0
        } else {
            (state.dropped_since_snapshot as f64 / seen as f64).min(1.0)
        };
        state.received_since_snapshot = 0;
        state.dropped_since_snapshot = 0;

        let count = state.samples.len();
        let avg_latency = if count == 0 {
            Duration::ZERO
        } else {
            state.samples.iter().map(|s| s.latency).sum::<Duration>() / count as u32
        };

        let nominal_interval = 1.0 / self.config.nominal_fps.max(0.001);
        let processing_overhead_ratio = avg_latency.as_secs_f64() / nominal_interval;

        PerformanceSnapshot {
            avg_latency,
            drop_rate,
            processing_overhead_ratio,
            buffer_utilization: buffer_utilization.clamp(0.0, 1.0),
            jitter: jitter(&state.samples),
            fps: self.fps(&state, now),
            sample_count: count,
        }
    }

    /// Current ingest rate, leaving the snapshot counters alone
    pub fn current_fps(&self) -> f64 {
        let state = self.state.lock();
        self.fps(&state, Instant::now())
    }

    fn fps(&self, state: &MonitorState, now: Instant) -> f64 {
        let Some(first) = state.first_arrival else {
            return 0.0;
        };
        let window = Duration::from_millis(self.config.fps_window_ms.max(1));
        let mut in_window = state
            .samples
            .iter()
            .rev()
            .take_while(|s| now.saturating_duration_since(s.arrived_at) <= window);
        let Some(newest) = in_window.next() else {
            return 0.0;
        };
        let (intervals, oldest) = in_window.fold((0usize, newest), |(n, _), s| (n + 1, s));

        if intervals == 0 {
            // A single arrival has no interval yet.
            let span = window
                .min(now.saturating_duration_since(first))
                .max(Duration::from_millis(500));
            return 1.0 / span.as_secs_f64();
        }

        // Rate over the span the retained samples actually cover, so a ring
        // smaller than the window cannot cap the reading. Silence since the
        // newest arrival widens the span.
        let span = now.saturating_duration_since(oldest.arrived_at);
        if span.is_zero() {
            return 0.0;
        }
        intervals as f64 / span.as_secs_f64()
    }
}

fn jitter(samples: &VecDeque<Sample>) -> f64 {
    if samples.len() < 3 {
        return 0.0;
    }
    let intervals: Vec<f64> = samples
        .iter()
        .zip(samples.iter().skip(1))
        .map(|(a, b)| b.arrived_at.saturating_duration_since(a.arrived_at).as_secs_f64())
        .collect();
    let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
    let variance =
        intervals.iter().map(|i| (i - mean).powi(2)).sum::<f64>() / intervals.len() as f64;
    variance.sqrt()
}
