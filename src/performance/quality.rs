//! Quality Controller
//!
//! Feedback loop that turns a [`PerformanceSnapshot`] into an encode
//! quality and a pacing compensation factor.
//!
//! # FPS Bands (ratio = measured / target, defaults)
//!
//! | Band | Ratio | Action |
//! |------|-------|--------|
//! | Severe | < 0.50 | reduce by shortfall, floor `severe_floor` (60) |
//! | Moderate | 0.50 - 0.80 | reduce by shortfall, floor `moderate_floor` (70) |
//! | Dead zone | 0.80 - 0.95 | no change |
//! | Healthy | >= 0.95 | +`increase_step` after `sustain_ticks` healthy ticks, cap `max_quality` |
//!
//! A floor only limits reductions. Quality that is already below the
//! moderate floor (after a severe episode) stays where it is on a moderate
//! tick.
//!
//! # Compensation
//!
//! ```text
//! raw  = (1 + jitter * jitter_gain)
//!      * (1 + (1 - buffer_utilization) * emptiness_gain)
//!      * (1 + fps_shortfall * shortfall_gain)
//! comp = clamp(smoothing * raw + (1 - smoothing) * previous, 1.0, max_compensation)
//! ```
//!
//! Broadcast pacing multiplies its nominal frame interval by `comp`.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use super::monitor::PerformanceSnapshot;

/// Quality controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Target ingest frame rate
    #[serde(default = "default_target_fps")]
    pub target_fps: f64,

    /// Encode quality at startup
    #[serde(default = "default_initial_quality")]
    pub initial_quality: u8,

    /// Lowest quality, reached only under severe shortfall
    #[serde(default = "default_severe_floor")]
    pub severe_floor: u8,

    /// Lowest quality reachable under moderate shortfall
    #[serde(default = "default_moderate_floor")]
    pub moderate_floor: u8,

    /// Highest quality
    #[serde(default = "default_max_quality")]
    pub max_quality: u8,

    /// Below this FPS ratio the shortfall is severe
    #[serde(default = "default_severe_ratio")]
    pub severe_ratio: f64,

    /// Lower edge of the dead zone
    #[serde(default = "default_dead_zone_low")]
    pub dead_zone_low: f64,

    /// FPS ratio considered healthy (upper edge of the dead zone)
    #[serde(default = "default_upgrade_ratio")]
    pub upgrade_ratio: f64,

    /// Quality points removed per unit of FPS shortfall
    #[serde(default = "default_reduction_gain")]
    pub reduction_gain: f64,

    /// Smallest reduction applied
    #[serde(default = "default_min_step")]
    pub min_step: u8,

    /// Quality points added after a sustained healthy window
    #[serde(default = "default_increase_step")]
    pub increase_step: u8,

    /// Consecutive healthy ticks before an increase
    #[serde(default = "default_sustain_ticks")]
    pub sustain_ticks: u32,

    /// Jitter (seconds) that counts as network stress
    #[serde(default = "default_jitter_threshold")]
    pub jitter_threshold: f64,

    /// Buffer utilization that counts as pressure
    #[serde(default = "default_buffer_pressure")]
    pub buffer_pressure: f64,

    /// Compensation growth per second of jitter
    #[serde(default = "default_jitter_gain")]
    pub jitter_gain: f64,

    /// Compensation growth for a fully empty buffer
    #[serde(default = "default_emptiness_gain")]
    pub emptiness_gain: f64,

    /// Compensation growth for a full FPS shortfall
    #[serde(default = "default_shortfall_gain")]
    pub shortfall_gain: f64,

    /// Upper clamp for the compensation factor
    #[serde(default = "default_max_compensation")]
    pub max_compensation: f64,

    /// Weight of the newest compensation sample (0.0-1.0)
    #[serde(default = "default_smoothing")]
    pub smoothing: f64,

    /// Controller tick period (milliseconds)
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

fn default_target_fps() -> f64 {
    30.0
}
fn default_initial_quality() -> u8 {
    80
}
fn default_severe_floor() -> u8 {
    60
}
fn default_moderate_floor() -> u8 {
    70
}
fn default_max_quality() -> u8 {
    90
}
fn default_severe_ratio() -> f64 {
    0.5
}
fn default_dead_zone_low() -> f64 {
    0.8
}
fn default_upgrade_ratio() -> f64 {
    0.95
}
fn default_reduction_gain() -> f64 {
    25.0
}
fn default_min_step() -> u8 {
    2
}
fn default_increase_step() -> u8 {
    2
}
fn default_sustain_ticks() -> u32 {
    3
}
fn default_jitter_threshold() -> f64 {
    0.25
}
fn default_buffer_pressure() -> f64 {
    0.9
}
fn default_jitter_gain() -> f64 {
    4.0
}
fn default_emptiness_gain() -> f64 {
    0.5
}
fn default_shortfall_gain() -> f64 {
    1.0
}
fn default_max_compensation() -> f64 {
    2.5
}
fn default_smoothing() -> f64 {
    0.7
}
fn default_tick_interval_ms() -> u64 {
    2000
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            target_fps: default_target_fps(),
            initial_quality: default_initial_quality(),
            severe_floor: default_severe_floor(),
            moderate_floor: default_moderate_floor(),
            max_quality: default_max_quality(),
            severe_ratio: default_severe_ratio(),
            dead_zone_low: default_dead_zone_low(),
            upgrade_ratio: default_upgrade_ratio(),
            reduction_gain: default_reduction_gain(),
            min_step: default_min_step(),
            increase_step: default_increase_step(),
            sustain_ticks: default_sustain_ticks(),
            jitter_threshold: default_jitter_threshold(),
            buffer_pressure: default_buffer_pressure(),
            jitter_gain: default_jitter_gain(),
            emptiness_gain: default_emptiness_gain(),
            shortfall_gain: default_shortfall_gain(),
            max_compensation: default_max_compensation(),
            smoothing: default_smoothing(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

impl QualityConfig {
    /// Check floors, ceilings and band edges are ordered
    pub fn validate(&self) -> Result<(), String> {
        if !(self.severe_floor <= self.moderate_floor && self.moderate_floor <= self.max_quality) {
            return Err(format!(
                "quality floors must satisfy severe_floor ({}) <= moderate_floor ({}) <= max_quality ({})",
                self.severe_floor, self.moderate_floor, self.max_quality
            ));
        }
        if self.max_quality > 100 || self.severe_floor == 0 {
            return Err("quality values must lie in 1..=100".to_string());
        }
        if !(0.0 < self.severe_ratio
            && self.severe_ratio <= self.dead_zone_low
            && self.dead_zone_low <= self.upgrade_ratio)
        {
            return Err("FPS bands must satisfy 0 < severe_ratio <= dead_zone_low <= upgrade_ratio".to_string());
        }
        if self.target_fps <= 0.0 {
            return Err("target_fps must be positive".to_string());
        }
        if self.max_compensation < 1.0 {
            return Err("max_compensation must be >= 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.smoothing) {
            return Err("smoothing must lie in 0.0..=1.0".to_string());
        }
        Ok(())
    }
}

/// Where the measured frame rate sits relative to target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpsBand {
    /// No frames at all (camera offline); nothing is adjusted
    NoSignal,
    /// Far below target
    Severe,
    /// Below target
    Moderate,
    /// Just below target; no adjustment
    DeadZone,
    /// At or above target
    Healthy,
}

impl fmt::Display for FpsBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSignal => write!(f, "no-signal"),
            Self::Severe => write!(f, "severe"),
            Self::Moderate => write!(f, "moderate"),
            Self::DeadZone => write!(f, "dead-zone"),
            Self::Healthy => write!(f, "healthy"),
        }
    }
}

/// Output of one controller tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityDecision {
    /// Encode quality to use from now on
    pub quality: u8,
    /// Quality before this tick
    pub previous_quality: u8,
    /// Pacing compensation factor (>= 1.0)
    pub compensation: f64,
    /// Band the snapshot fell into
    pub band: FpsBand,
}

impl QualityDecision {
    /// True when the tick moved quality
    pub fn changed(&self) -> bool {
        self.quality != self.previous_quality
    }
}

/// Controller counters
#[derive(Debug, Clone, Default)]
pub struct QualityStats {
    /// Ticks evaluated
    pub ticks: u64,
    /// Ticks that lowered quality
    pub reductions: u64,
    /// Ticks that raised quality
    pub increases: u64,
    /// Ticks that landed in the dead zone
    pub dead_zone_ticks: u64,
}

/// Hysteresis-based quality controller
pub struct QualityController {
    config: QualityConfig,
    quality: u8,
    compensation: f64,
    healthy_ticks: u32,
    stats: QualityStats,
}

impl QualityController {
    /// Create a controller starting at the configured initial quality
    pub fn new(config: QualityConfig) -> Self {
        let quality = config
            .initial_quality
            .clamp(config.severe_floor, config.max_quality.max(config.severe_floor));
        Self {
            config,
            quality,
            compensation: 1.0,
            healthy_ticks: 0,
            stats: QualityStats::default(),
        }
    }

    /// Current encode quality
    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Current compensation factor
    pub fn compensation(&self) -> f64 {
        self.compensation
    }

    /// Controller counters
    pub fn stats(&self) -> &QualityStats {
        &self.stats
    }

    /// Classify an FPS reading
    pub fn band_for(&self, fps: f64) -> FpsBand {
        if !fps.is_finite() || fps <= 0.0 {
            return FpsBand::NoSignal;
        }
        let ratio = fps / self.config.target_fps;
        if ratio < self.config.severe_ratio {
            FpsBand::Severe
        } else if ratio < self.config.dead_zone_low {
            FpsBand::Moderate
        } else if ratio < self.config.upgrade_ratio {
            FpsBand::DeadZone
        } else {
            FpsBand::Healthy
        }
    }

    /// Evaluate one snapshot and update quality and compensation
    pub fn evaluate(&mut self, snapshot: &PerformanceSnapshot) -> QualityDecision {
        self.stats.ticks += 1;
        let previous_quality = self.quality;
        let fps = finite_or_zero(snapshot.fps);
        let band = self.band_for(fps);
        let shortfall = (1.0 - fps / self.config.target_fps).clamp(0.0, 1.0);

        match band {
            FpsBand::NoSignal => {
                self.healthy_ticks = 0;
            }
            FpsBand::Severe => {
                self.healthy_ticks = 0;
                self.reduce(self.shortfall_step(shortfall), self.config.severe_floor);
            }
            FpsBand::Moderate => {
                self.healthy_ticks = 0;
                self.reduce(self.shortfall_step(shortfall), self.config.moderate_floor);
            }
            FpsBand::DeadZone => {
                self.healthy_ticks = 0;
                self.stats.dead_zone_ticks += 1;
            }
            FpsBand::Healthy => {
                let jitter = finite_or_zero(snapshot.jitter);
                let buffer = finite_or_zero(snapshot.buffer_utilization);
                if jitter > self.config.jitter_threshold || buffer > self.config.buffer_pressure {
                    self.healthy_ticks = 0;
                    self.reduce(self.config.min_step, self.config.moderate_floor);
                } else {
                    self.healthy_ticks += 1;
                    if self.healthy_ticks >= self.config.sustain_ticks {
                        self.healthy_ticks = 0;
                        self.quality = self
                            .quality
                            .saturating_add(self.config.increase_step)
                            .min(self.config.max_quality);
                    }
                }
            }
        }

        if band != FpsBand::NoSignal {
            self.compensation = self.next_compensation(snapshot, shortfall);
        }

        if self.quality < previous_quality {
            self.stats.reductions += 1;
            debug!(
                "Quality reduced {} -> {} (fps {:.1}, band {})",
                previous_quality, self.quality, fps, band
            );
        } else if self.quality > previous_quality {
            self.stats.increases += 1;
            debug!(
                "Quality increased {} -> {} (fps {:.1})",
                previous_quality, self.quality, fps
            );
        } else {
            debug!(
                "Quality held at {} (fps {:.1}, band {}, compensation {:.2})",
                self.quality, fps, band, self.compensation
            );
        }

        QualityDecision {
            quality: self.quality,
            previous_quality,
            compensation: self.compensation,
            band,
        }
    }

    fn shortfall_step(&self, shortfall: f64) -> u8 {
        let step = (shortfall * self.config.reduction_gain).round().clamp(0.0, 100.0) as u8;
        step.max(self.config.min_step)
    }

    fn reduce(&mut self, step: u8, floor: u8) {
        let lowered = self.quality.saturating_sub(step);
        // Floors only bound reductions.
        self.quality = if lowered < floor {
            floor.min(self.quality)
        } else {
            lowered
        };
    }

    fn next_compensation(&self, snapshot: &PerformanceSnapshot, shortfall: f64) -> f64 {
        let jitter = finite_or_zero(snapshot.jitter).max(0.0);
        let emptiness = (1.0 - finite_or_zero(snapshot.buffer_utilization)).clamp(0.0, 1.0);

        let raw = (1.0 + jitter * self.config.jitter_gain)
            * (1.0 + emptiness * self.config.emptiness_gain)
            * (1.0 + shortfall * self.config.shortfall_gain);
        let smoothed =
            self.config.smoothing * raw + (1.0 - self.config.smoothing) * self.compensation;
        smoothed.clamp(1.0, self.config.max_compensation.max(1.0))
    }
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn snapshot(fps: f64) -> PerformanceSnapshot {
        PerformanceSnapshot {
            fps,
            buffer_utilization: 0.5,
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_valid() {
        assert!(QualityConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_floors_rejected() {
        let config = QualityConfig {
            severe_floor: 75,
            moderate_floor: 70,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_severe_shortfall_converges_to_floor() {
        let config = QualityConfig::default();
        let mut qc = QualityController::new(config.clone());

        let mut last = qc.quality();
        for _ in 0..5 {
            last = qc.evaluate(&snapshot(config.target_fps * 0.4)).quality;
        }
        assert_eq!(last, config.severe_floor);

        for _ in 0..5 {
            let decision = qc.evaluate(&snapshot(config.target_fps * 0.4));
            assert_eq!(decision.quality, config.severe_floor);
            assert!(!decision.changed());
        }
    }

    #[derive(Clone, Default)]
    struct Captured(std::sync::Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn reduce_once_at(level: tracing::Level) -> String {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let config = QualityConfig::default();
        let mut qc = QualityController::new(config.clone());
        tracing::subscriber::with_default(subscriber, || {
            assert!(qc.evaluate(&snapshot(config.target_fps * 0.4)).changed());
        });
        let bytes = captured.0.lock().clone();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[test]
    fn test_quality_change_logged_at_debug() {
        // The server's quality loop reports changes at info
        assert!(reduce_once_at(tracing::Level::INFO).is_empty());
        assert!(reduce_once_at(tracing::Level::DEBUG).contains("Quality reduced 80 -> "));
    }

    #[test]
    fn test_moderate_floor() {
        let config = QualityConfig::default();
        let mut qc = QualityController::new(config.clone());
        for _ in 0..20 {
            qc.evaluate(&snapshot(config.target_fps * 0.7));
        }
        assert_eq!(qc.quality(), config.moderate_floor);
    }

    #[test]
    fn test_moderate_tick_never_raises_quality() {
        let config = QualityConfig::default();
        let mut qc = QualityController::new(config.clone());
        for _ in 0..5 {
            qc.evaluate(&snapshot(config.target_fps * 0.2));
        }
        assert_eq!(qc.quality(), config.severe_floor);

        let decision = qc.evaluate(&snapshot(config.target_fps * 0.7));
        assert_eq!(decision.quality, config.severe_floor);
    }

    #[test]
    fn test_dead_zone_holds() {
        let config = QualityConfig::default();
        let mut qc = QualityController::new(config.clone());
        for _ in 0..10 {
            let decision = qc.evaluate(&snapshot(config.target_fps * 0.9));
            assert_eq!(decision.band, FpsBand::DeadZone);
            assert_eq!(decision.quality, config.initial_quality);
        }
        assert_eq!(qc.stats().dead_zone_ticks, 10);
    }

    #[test]
    fn test_increase_needs_sustained_window() {
        let config = QualityConfig::default();
        let mut qc = QualityController::new(config.clone());
        let healthy = snapshot(config.target_fps);

        qc.evaluate(&healthy);
        qc.evaluate(&healthy);
        assert_eq!(qc.quality(), config.initial_quality);
        qc.evaluate(&healthy);
        assert_eq!(qc.quality(), config.initial_quality + config.increase_step);

        // A dead-zone tick breaks the streak
        qc.evaluate(&healthy);
        qc.evaluate(&snapshot(config.target_fps * 0.9));
        qc.evaluate(&healthy);
        qc.evaluate(&healthy);
        assert_eq!(qc.quality(), config.initial_quality + config.increase_step);
    }

    #[test]
    fn test_increase_capped() {
        let config = QualityConfig::default();
        let mut qc = QualityController::new(config.clone());
        for _ in 0..100 {
            qc.evaluate(&snapshot(config.target_fps));
        }
        assert_eq!(qc.quality(), config.max_quality);
    }

    #[test]
    fn test_jitter_blocks_increase() {
        let config = QualityConfig::default();
        let mut qc = QualityController::new(config.clone());
        let jittery = PerformanceSnapshot {
            fps: config.target_fps,
            jitter: 0.4,
            buffer_utilization: 0.5,
            ..Default::default()
        };
        for _ in 0..10 {
            qc.evaluate(&jittery);
        }
        assert_eq!(qc.quality(), config.moderate_floor);
    }

    #[test]
    fn test_no_signal_changes_nothing() {
        let mut qc = QualityController::new(QualityConfig::default());
        let decision = qc.evaluate(&snapshot(0.0));
        assert_eq!(decision.band, FpsBand::NoSignal);
        assert!(!decision.changed());
        assert_eq!(decision.compensation, 1.0);
    }

    #[test]
    fn test_compensation_grows_with_stress() {
        let config = QualityConfig::default();
        let mut calm = QualityController::new(config.clone());
        let mut stressed = QualityController::new(config.clone());

        let calm_snap = PerformanceSnapshot {
            fps: config.target_fps,
            buffer_utilization: 1.0,
            ..Default::default()
        };
        let stressed_snap = PerformanceSnapshot {
            fps: config.target_fps * 0.5,
            jitter: 0.1,
            buffer_utilization: 0.1,
            ..Default::default()
        };
        for _ in 0..5 {
            calm.evaluate(&calm_snap);
            stressed.evaluate(&stressed_snap);
        }
        assert!((calm.compensation() - 1.0).abs() < 1e-9);
        assert!(stressed.compensation() > 1.5);
        assert!(stressed.compensation() <= config.max_compensation);
    }

    #[test]
    fn test_compensation_clamped() {
        let config = QualityConfig::default();
        let mut qc = QualityController::new(config.clone());
        let awful = PerformanceSnapshot {
            fps: 0.5,
            jitter: 5.0,
            buffer_utilization: 0.0,
            ..Default::default()
        };
        for _ in 0..10 {
            qc.evaluate(&awful);
        }
        assert_eq!(qc.compensation(), config.max_compensation);
    }

    #[test]
    fn test_initial_quality_clamped() {
        let qc = QualityController::new(QualityConfig {
            initial_quality: 99,
            ..Default::default()
        });
        assert_eq!(qc.quality(), 90);
    }

    proptest! {
        #[test]
        fn prop_quality_stays_in_range(
            ticks in proptest::collection::vec(
                (-10.0f64..80.0, 0.0f64..3.0, -0.5f64..1.5),
                1..60,
            )
        ) {
            let config = QualityConfig::default();
            let mut qc = QualityController::new(config.clone());
            for (fps, jitter, util) in ticks {
                let decision = qc.evaluate(&PerformanceSnapshot {
                    fps,
                    jitter,
                    buffer_utilization: util,
                    ..Default::default()
                });
                prop_assert!(decision.quality >= config.severe_floor);
                prop_assert!(decision.quality <= config.max_quality);
                prop_assert!(decision.compensation >= 1.0);
                prop_assert!(decision.compensation <= config.max_compensation);
            }
        }
    }
}
