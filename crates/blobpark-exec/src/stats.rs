//! Point-in-time parking statistics.

use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParkingStats {
    pub resident_blobs: usize,
    pub resident_bytes: u64,
    pub on_disk_blobs: usize,
    pub on_disk_bytes: u64,
    /// Bytes currently reserved or written in the backing file.
    pub disk_allocated_bytes: u64,
    pub disk_peak_bytes: u64,
    /// Logical size of the backing file.
    pub disk_file_tail: u64,
    pub parks: u64,
    pub unparks: u64,
    pub write_failures: u64,
    pub sweeps: u64,
    pub writes_enabled: bool,
}

impl ParkingStats {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
