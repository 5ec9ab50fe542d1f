use std::fmt;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// Stable 64-bit identity of a scanned endpoint, derived from (service, ip, port).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanKey(pub u64);

impl fmt::Display for ScanKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// The latest known scan outcome for one service endpoint.
/// This is the canonical data model used by the ingestion path, the store and the monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRecord {
    /// Scanned service name, e.g. "HTTP"
    pub service: String,

    /// Scanned address, kept verbatim as received
    pub ip: String,

    /// Scanned port
    pub port: u32,

    /// Unix seconds at which the scan was performed (not when it was stored)
    pub timestamp: i64,

    /// Wire format version the payload was decoded from
    pub version: u8,

    /// Decoded service response, or the "unknown" placeholder
    pub data: String,
}

impl ScanRecord {
    /// Scan time as a UTC datetime, `None` if the timestamp is out of chrono's range.
    pub fn scanned_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.timestamp, 0)
    }

    /// RFC 3339 scan time for log lines, falling back to the raw seconds.
    pub fn scanned_at_display(&self) -> String {
        self.scanned_at()
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| self.timestamp.to_string())
    }
}
