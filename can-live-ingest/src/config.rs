//! Ingestion configuration types
//!
//! This module defines the small set of knobs the ingestion engine needs.
//! Channel selection and bus parameters belong to the application layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::types::{IngestError, Result};

/// How the engine discovers newly arrived frames
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadMode {
    /// A worker thread drains every active channel on a fixed interval
    #[default]
    Polling,
    /// The driver signals a channel and the engine drains that channel
    Event,
}

impl fmt::Display for ReadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadMode::Polling => write!(f, "polling"),
            ReadMode::Event => write!(f, "event"),
        }
    }
}

impl FromStr for ReadMode {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "polling" | "timer" => Ok(ReadMode::Polling),
            "event" => Ok(ReadMode::Event),
            other => Err(IngestError::InvalidConfig(format!("unknown read mode: {}", other))),
        }
    }
}

/// Configuration for the ingestion engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Frame delivery strategy
    #[serde(default)]
    pub mode: ReadMode,

    /// Interval between polling ticks in milliseconds (default: 10ms)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Whether to request and store hardware timestamps
    #[serde(default)]
    pub timestamps: bool,
}

fn default_poll_interval() -> u64 {
    10
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            mode: ReadMode::default(),
            poll_interval_ms: default_poll_interval(),
            timestamps: false,
        }
    }
}

impl IngestConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: set the read mode
    pub fn with_mode(mut self, mode: ReadMode) -> Self {
        self.mode = mode;
        self
    }

    /// Builder method: set the polling interval
    pub fn with_poll_interval_ms(mut self, interval_ms: u64) -> Self {
        self.poll_interval_ms = interval_ms;
        self
    }

    /// Builder method: enable or disable hardware timestamps
    pub fn with_timestamps(mut self, enabled: bool) -> Self {
        self.timestamps = enabled;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(IngestError::InvalidConfig(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
