//! Configuration management
//!
//! Handles loading, validation, and merging of configuration from:
//! - TOML files
//! - Environment variables (through clap, see `main.rs`)
//! - CLI arguments
//!
//! Every field has a default, so an empty file is a valid configuration
//! apart from the credentials, which must be supplied.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

pub mod types;

pub use types::{DeviceConfig, LoggingConfig, ServerConfig, ViewerConfig, ViewerToken};

use crate::broadcast::BroadcastConfig;
use crate::buffer::FrameBufferConfig;
use crate::link::LinkConfig;
use crate::performance::{MonitorConfig, QualityConfig};
use crate::processor::ProcessorConfig;
use crate::recording::RecordingConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Device credentials
    #[serde(default)]
    pub devices: DeviceConfig,
    /// Viewer credentials
    #[serde(default)]
    pub viewers: ViewerConfig,
    /// Device link behavior, including the heartbeat
    #[serde(default)]
    pub link: LinkConfig,
    /// Recent frame buffer
    #[serde(default)]
    pub buffer: FrameBufferConfig,
    /// Frame processing pipeline
    #[serde(default)]
    pub processor: ProcessorConfig,
    /// Adaptive quality controller
    #[serde(default)]
    pub quality: QualityConfig,
    /// Ingest performance monitor
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Segment recording
    #[serde(default)]
    pub recording: RecordingConfig,
    /// Live view fan-out
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &str) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).context(format!("Failed to read config file: {}", path))?;

        let config = Self::parse(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML without validating
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Create default configuration
    pub fn default_config() -> Result<Self> {
        Ok(Self::default())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        // Validate listen address
        self.server
            .listen_addr
            .parse::<SocketAddr>()
            .context("Invalid listen address")?;

        // Credentials
        if self.devices.camera_tokens.iter().all(|t| t.trim().is_empty()) {
            anyhow::bail!("No camera tokens configured (devices.camera_tokens)");
        }
        if self.devices.controller_tokens.iter().all(|t| t.trim().is_empty()) {
            anyhow::bail!("No controller tokens configured (devices.controller_tokens)");
        }
        if self.viewers.tokens.is_empty() {
            anyhow::bail!("No viewer tokens configured (viewers.tokens)");
        }
        if let Some(entry) = self.viewers.tokens.iter().find(|t| t.token.trim().is_empty()) {
            anyhow::bail!("Viewer token for '{}' is empty", entry.principal);
        }

        // Link limits
        if self.link.max_text_bytes == 0 || self.link.max_message_bytes < self.link.max_text_bytes {
            anyhow::bail!(
                "link.max_message_bytes ({}) must be at least link.max_text_bytes ({}) and non-zero",
                self.link.max_message_bytes,
                self.link.max_text_bytes
            );
        }
        if self.link.outbound_capacity == 0 {
            anyhow::bail!("link.outbound_capacity must be at least 1");
        }
        let heartbeat = &self.link.heartbeat;
        if !(heartbeat.escalation_factor.is_finite() && heartbeat.escalation_factor >= 1.0) {
            anyhow::bail!(
                "link.heartbeat.escalation_factor must be >= 1.0, got {}",
                heartbeat.escalation_factor
            );
        }
        if heartbeat.initial_probe_interval_secs > heartbeat.max_probe_interval_secs {
            anyhow::bail!(
                "link.heartbeat.initial_probe_interval_secs ({}) exceeds max_probe_interval_secs ({})",
                heartbeat.initial_probe_interval_secs,
                heartbeat.max_probe_interval_secs
            );
        }

        // Buffer
        if self.buffer.capacity == 0 {
            anyhow::bail!("buffer.capacity must be at least 1");
        }
        if !(self.buffer.drop_ratio > 0.0 && self.buffer.drop_ratio <= 1.0) {
            anyhow::bail!("buffer.drop_ratio must be in (0, 1], got {}", self.buffer.drop_ratio);
        }

        // Processor
        let processor = &self.processor;
        if processor.max_frame_size == 0 {
            anyhow::bail!("processor.max_frame_size must be positive");
        }
        if processor.target_width == 0
            || processor.target_height == 0
            || processor.target_width > processor.max_dimension
            || processor.target_height > processor.max_dimension
        {
            anyhow::bail!(
                "processor target {}x{} must be non-zero and within max_dimension {}",
                processor.target_width,
                processor.target_height,
                processor.max_dimension
            );
        }
        if processor.min_compression_quality == 0 || processor.min_compression_quality > 100 {
            anyhow::bail!(
                "processor.min_compression_quality must be in 1..=100, got {}",
                processor.min_compression_quality
            );
        }

        processor
            .enhancement
            .validate()
            .map_err(anyhow::Error::msg)?;

        // Monitor
        if self.monitor.window_size < 2 {
            anyhow::bail!("monitor.window_size must be at least 2");
        }

        self.quality.validate().map_err(anyhow::Error::msg)?;
        self.recording.validate().map_err(anyhow::Error::msg)?;
        self.broadcast.validate().map_err(anyhow::Error::msg)?;

        Ok(())
    }

    /// Override config with CLI arguments
    pub fn with_overrides(mut self, listen: Option<String>, port: Option<u16>) -> Self {
        match (listen, port) {
            (Some(listen_addr), Some(port)) => {
                self.server.listen_addr = format!("{}:{}", listen_addr, port);
            }
            (Some(listen_addr), None) => {
                let port = self
                    .server
                    .listen_addr
                    .parse::<SocketAddr>()
                    .map(|addr| addr.port())
                    .unwrap_or(8765);
                self.server.listen_addr = format!("{}:{}", listen_addr, port);
            }
            (None, Some(port)) => {
                // Just update port
                if let Ok(mut addr) = self.server.listen_addr.parse::<SocketAddr>() {
                    addr.set_port(port);
                    self.server.listen_addr = addr.to_string();
                }
            }
            (None, None) => {}
        }

        self
    }
}
