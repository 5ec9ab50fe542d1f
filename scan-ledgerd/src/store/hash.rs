use serde::Serialize;
use sha2::{Sha256, Digest};
use shared::types::{ScanKey, ScanRecord};
use super::db::Snapshot;

/// Derive the key for a (service, ip, port) triple: the first 64-bit word of
/// MurmurHash3 x64_128 (seed 0) over `"<service>-<ip>-<port>"`, the same value
/// Go's `murmur3.Sum64` yields for existing `scan_results` rows.
pub fn scan_key(service: &str, ip: &str, port: u32) -> ScanKey {
    let canonical = format!("{}-{}-{}", service, ip, port);
    ScanKey(murmur3_sum64(canonical.as_bytes()))
}

fn murmur3_sum64(mut bytes: &[u8]) -> u64 {
    // h1 occupies the low half of the 128-bit result
    murmur3::murmur3_x64_128(&mut bytes, 0)
        .expect("Reading from a byte slice cannot fail") as u64
}

pub fn record_key(record: &ScanRecord) -> ScanKey {
    scan_key(&record.service, &record.ip, record.port)
}

#[derive(Serialize)]
struct DigestView<'a> {
    key: ScanKey,
    timestamp: i64,
    version: u8,
    data: &'a str,
}

/// SHA-256 over the snapshot's records sorted by key.
/// Identity fields are covered by the key itself.
pub fn snapshot_digest(snapshot: &Snapshot) -> String {
    let mut keys: Vec<&ScanKey> = snapshot.keys().collect();
    keys.sort();

    let mut hasher = Sha256::new();
    for key in keys {
        let record = &snapshot[key];
        let view = DigestView {
            key: *key,
            timestamp: record.timestamp,
            version: record.version,
            data: &record.data,
        };
        // A struct of plain fields always serializes
        if let Ok(line) = serde_json::to_vec(&view) {
            hasher.update(&line);
            hasher.update(b"\n");
        }
    }

    hex::encode(hasher.finalize())
}
