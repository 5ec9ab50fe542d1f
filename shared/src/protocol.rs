/// Ingestion endpoint; also serves the full snapshot on GET
pub const SCANS_PATH: &str = "/v1/scans";

/// Latest consistency monitor report
pub const MONITOR_PATH: &str = "/v1/monitor";

/// Stored in place of a payload that could not be decoded
pub const UNKNOWN_PAYLOAD: &str = "unknown";
