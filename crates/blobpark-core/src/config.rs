//! Parking configuration that downstream crates can serialize/deserialize.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Which eligibility heuristic decides when a frozen blob may be parked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Parkable as soon as it is frozen.
    Immediate,
    /// Parkable once `parking_delay_ms` has elapsed since freezing or last use.
    Delayed,
}

impl PolicyKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "immediate" => Some(PolicyKind::Immediate),
            "delayed" => Some(PolicyKind::Delayed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParkingConfig {
    /// Blobs smaller than this are never parked; they leave the manager on freeze.
    pub min_parking_size: usize,

    /// Floor for freshly allocated buffer blocks.
    pub min_block_size: usize,

    /// Period of the debounced parking sweep.
    pub sweep_interval_ms: u64,

    pub policy: PolicyKind,

    /// Only consulted by `PolicyKind::Delayed`.
    pub parking_delay_ms: u64,

    /// Upper bound on the backing file's logical size. `None` means unbounded.
    pub max_disk_bytes: Option<u64>,

    /// Directory for the anonymous backing file (OS temp dir when unset).
    pub spill_dir: Option<String>,

    /// When false no backing file is opened and every blob stays resident.
    pub disk_enabled: bool,

    /// Blocking threads available for disk writes.
    pub io_threads: usize,

    /// Verify the blake3 checksum of every chunk read back from disk.
    pub verify_checksums: bool,
}

impl Default for ParkingConfig {
    fn default() -> Self {
        Self {
            min_parking_size: 1024,
            min_block_size: 4096,
            sweep_interval_ms: 2_000,
            policy: PolicyKind::Immediate,
            parking_delay_ms: 30_000,
            max_disk_bytes: None,
            spill_dir: None,
            disk_enabled: true,
            io_threads: 2,
            verify_checksums: true,
        }
    }
}

impl ParkingConfig {
    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `BLOBPARK_MIN_PARKING_SIZE`: minimum blob size worth parking
    /// - `BLOBPARK_MIN_BLOCK_SIZE`: buffer block allocation floor
    /// - `BLOBPARK_SWEEP_INTERVAL_MS`: sweep period
    /// - `BLOBPARK_POLICY`: `immediate` or `delayed`
    /// - `BLOBPARK_PARKING_DELAY_MS`: delay used by the delayed policy
    /// - `BLOBPARK_MAX_DISK_BYTES`: on-disk capacity
    /// - `BLOBPARK_SPILL_DIR`: backing file directory
    /// - `BLOBPARK_DISK_ENABLED`: `true`/`false`
    /// - `BLOBPARK_IO_THREADS`: blocking I/O threads
    /// - `BLOBPARK_VERIFY_CHECKSUMS`: `true`/`false`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(s) = std::env::var("BLOBPARK_MIN_PARKING_SIZE") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.min_parking_size = v;
            }
        }

        if let Ok(s) = std::env::var("BLOBPARK_MIN_BLOCK_SIZE") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.min_block_size = v;
            }
        }

        if let Ok(s) = std::env::var("BLOBPARK_SWEEP_INTERVAL_MS") {
            if let Ok(v) = s.parse::<u64>() {
                cfg.sweep_interval_ms = v;
            }
        }

        if let Ok(s) = std::env::var("BLOBPARK_POLICY") {
            if let Some(v) = PolicyKind::parse(&s) {
                cfg.policy = v;
            }
        }

        if let Ok(s) = std::env::var("BLOBPARK_PARKING_DELAY_MS") {
            if let Ok(v) = s.parse::<u64>() {
                cfg.parking_delay_ms = v;
            }
        }

        if let Ok(s) = std::env::var("BLOBPARK_MAX_DISK_BYTES") {
            if let Ok(v) = s.parse::<u64>() {
                cfg.max_disk_bytes = Some(v);
            }
        }

        if let Ok(s) = std::env::var("BLOBPARK_SPILL_DIR") {
            cfg.spill_dir = Some(s);
        }

        if let Ok(s) = std::env::var("BLOBPARK_DISK_ENABLED") {
            if let Some(v) = parse_bool(&s) {
                cfg.disk_enabled = v;
            }
        }

        if let Ok(s) = std::env::var("BLOBPARK_IO_THREADS") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.io_threads = v;
            }
        }

        if let Ok(s) = std::env::var("BLOBPARK_VERIFY_CHECKSUMS") {
            if let Some(v) = parse_bool(&s) {
                cfg.verify_checksums = v;
            }
        }

        cfg
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.min_block_size == 0 {
            return Err(Error::Config("min_block_size must be > 0".into()));
        }
        if self.io_threads == 0 {
            return Err(Error::Config("io_threads must be > 0".into()));
        }
        if self.sweep_interval_ms == 0 {
            return Err(Error::Config("sweep_interval_ms must be > 0".into()));
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn parking_delay(&self) -> Duration {
        Duration::from_millis(self.parking_delay_ms)
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
