use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LocationType {
    Store,
    Cache,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocationConfig {
    /// Mount point root; chunks live under `<path>/chunks/<xx>/<id>`.
    pub path: PathBuf,
    /// Medium class (e.g. "ssd", "hdd") grouping locations with the same
    /// performance profile (§3 "Location").
    pub medium_name: String,
    pub location_type: LocationType,
    /// Fraction of the filesystem that may be used before
    /// `HasEnoughSpace` starts rejecting admissions (a watermark, not raw
    /// free space — §4.1).
    #[serde(default = "default_low_watermark")]
    pub low_watermark_bytes: u64,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Sustained bytes/second this location's writer invoker may spend on
    /// outbound or inbound traffic before the location-level throttler
    /// starts delaying callers (§4.3).
    #[serde(default)]
    pub io_rate_limit: Option<u64>,
}

fn default_low_watermark() -> u64 {
    5 * 1024 * 1024 * 1024
}

fn default_max_sessions() -> usize {
    64
}
