//! Session configuration
//!
//! Tuning knobs for retries, timeouts, chunk sizes and the keep-alive timer.
//! Every value passes through the same clamps whether it comes from a setter
//! or from a JSON file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::commands::IDENTIFY_RESPONSE_LEN;
use super::crc::CRC_LEN;
use super::ProtocolError;

/// Hard ceiling for the receive timeout in milliseconds
pub const MAX_RECEIVE_TIMEOUT_MS: u64 = 254_000;

/// Smallest download frame: one data byte plus CRC
pub const MIN_DOWNLOAD_SIZE: usize = 1 + CRC_LEN;

/// Smallest upload response limit: the longest fixed-size response
pub const MIN_UPLOAD_SIZE: usize = IDENTIFY_RESPONSE_LEN;

fn default_min_receive_timeout_ms() -> u64 {
    2000
}

fn default_max_retries() -> u32 {
    3
}

fn default_chunk_size() -> usize {
    256
}

fn default_keep_alive_interval_ms() -> u64 {
    5000
}

fn default_keep_alive_retries() -> u32 {
    3
}

fn default_wake_attempts() -> u32 {
    35
}

fn default_wake_poll_ms() -> u64 {
    100
}

fn default_wake_settle_ms() -> u64 {
    1000
}

/// Session tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Deadline for a complete response, in milliseconds
    #[serde(default = "default_min_receive_timeout_ms")]
    pub min_receive_timeout_ms: u64,

    /// Send attempts per exchange
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Largest Upload response (ACK + data + CRC) requested in one frame
    #[serde(default = "default_chunk_size")]
    pub max_upload_size: usize,

    /// Largest Download data frame (data + CRC) sent in one frame
    #[serde(default = "default_chunk_size")]
    pub max_download_size: usize,

    /// Idle time before a keep-alive Enquire is sent
    #[serde(default = "default_keep_alive_interval_ms")]
    pub keep_alive_interval_ms: u64,

    /// Enquire attempts per keep-alive before the timer gives up
    #[serde(default = "default_keep_alive_retries")]
    pub keep_alive_retries: u32,

    /// Enquire attempts made by WakeUp
    #[serde(default = "default_wake_attempts")]
    pub wake_attempts: u32,

    /// How long each WakeUp/keep-alive Enquire waits for its ACK
    #[serde(default = "default_wake_poll_ms")]
    pub wake_poll_ms: u64,

    /// Pause after a successful WakeUp before the next command
    #[serde(default = "default_wake_settle_ms")]
    pub wake_settle_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            min_receive_timeout_ms: default_min_receive_timeout_ms(),
            max_retries: default_max_retries(),
            max_upload_size: default_chunk_size(),
            max_download_size: default_chunk_size(),
            keep_alive_interval_ms: default_keep_alive_interval_ms(),
            keep_alive_retries: default_keep_alive_retries(),
            wake_attempts: default_wake_attempts(),
            wake_poll_ms: default_wake_poll_ms(),
            wake_settle_ms: default_wake_settle_ms(),
        }
    }
}

impl SessionConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ProtocolError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
            .map_err(|e| ProtocolError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Parse a JSON config string
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let config: SessionConfig =
            serde_json::from_str(text).map_err(|e| ProtocolError::Config(e.to_string()))?;
        Ok(config.normalized())
    }

    /// Apply every clamp
    pub fn normalized(mut self) -> Self {
        self.set_min_receive_timeout(self.min_receive_timeout_ms);
        self.set_max_retries(self.max_retries);
        self.set_max_upload_size(self.max_upload_size);
        self.set_max_download_size(self.max_download_size);
        self.keep_alive_retries = self.keep_alive_retries.max(1);
        self.wake_attempts = self.wake_attempts.max(1);
        self
    }

    /// Set the receive deadline, capped at [`MAX_RECEIVE_TIMEOUT_MS`]
    pub fn set_min_receive_timeout(&mut self, ms: u64) {
        self.min_receive_timeout_ms = ms.min(MAX_RECEIVE_TIMEOUT_MS);
    }

    /// Set the attempts per exchange; at least one
    pub fn set_max_retries(&mut self, retries: u32) {
        self.max_retries = retries.max(1);
    }

    /// Set the upload response limit, never below [`MIN_UPLOAD_SIZE`]
    pub fn set_max_upload_size(&mut self, size: usize) {
        self.max_upload_size = size.max(MIN_UPLOAD_SIZE);
    }

    /// Set the download frame limit, never below [`MIN_DOWNLOAD_SIZE`]
    pub fn set_max_download_size(&mut self, size: usize) {
        self.max_download_size = size.max(MIN_DOWNLOAD_SIZE);
    }

    /// Response deadline as a [`Duration`]
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.min_receive_timeout_ms)
    }

    /// Idle interval before a keep-alive probe
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    /// Wait per Enquire
    pub fn wake_poll(&self) -> Duration {
        Duration::from_millis(self.wake_poll_ms)
    }

    /// Pause after a successful WakeUp
    pub fn wake_settle(&self) -> Duration {
        Duration::from_millis(self.wake_settle_ms)
    }
}
