use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use anyhow::Result;
use shared::types::ScanKey;
use crate::config::MonitorConfig;
use crate::store::db::Snapshot;
use crate::store::hash::snapshot_digest;
use crate::store::{CallGuard, StoreError};
use crate::store_manager::StoreHandle;

/// A key whose stored timestamp went backwards between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Regression {
    pub key: ScanKey,
    pub service: String,
    pub ip: String,
    pub port: u32,
    pub previous_timestamp: i64,
    pub current_timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Findings {
    pub regressions: Vec<Regression>,
    /// Keys present in the previous snapshot but gone from the current one.
    /// Records are never deleted, so this is its own class of anomaly.
    pub missing: Vec<ScanKey>,
}

/// Outcome of one consistency check, published to the API.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    /// Cycles run so far, including this one
    pub cycle: u64,
    pub regressions: Vec<Regression>,
    pub missing: Vec<ScanKey>,
    /// Records in the snapshot taken this cycle
    pub records: usize,
    pub digest: Option<String>,
    /// The snapshot could not be read; the previous baseline was kept
    pub fetch_failed: bool,
    /// This cycle only established the baseline
    pub bootstrap: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Compare every key of `previous` against `current`.
pub fn compare(previous: &Snapshot, current: &Snapshot) -> Findings {
    let mut findings = Findings::default();

    for (key, before) in previous {
        let Some(after) = current.get(key) else {
            findings.missing.push(*key);
            continue;
        };
        if after.timestamp < before.timestamp {
            findings.regressions.push(Regression {
                key: *key,
                service: after.service.clone(),
                ip: after.ip.clone(),
                port: after.port,
                previous_timestamp: before.timestamp,
                current_timestamp: after.timestamp,
            });
        }
    }

    findings.regressions.sort_by_key(|r| r.key);
    findings.missing.sort();
    findings
}

/// One step of the monitor state machine. Takes the held baseline by value and
/// returns the baseline for the next cycle alongside the report.
pub fn evaluate(
    cycle: u64,
    baseline: Option<Snapshot>,
    fetched: Result<Snapshot, StoreError>,
) -> (CycleReport, Option<Snapshot>) {
    let mut report = CycleReport {
        cycle,
        completed_at: Some(Utc::now()),
        ..Default::default()
    };

    let current = match fetched {
        Ok(current) => current,
        Err(e) => {
            tracing::error!("Cannot read scan results from the store: {}", e);
            report.fetch_failed = true;
            return (report, baseline);
        }
    };

    report.records = current.len();
    report.digest = Some(snapshot_digest(&current));

    let Some(previous) = baseline else {
        report.bootstrap = true;
        return (report, Some(current));
    };

    let findings = compare(&previous, &current);
    for key in &findings.missing {
        tracing::error!(key = %key, "Stored scan result disappeared from the store");
    }
    for r in &findings.regressions {
        tracing::error!(
            service = %r.service,
            ip = %r.ip,
            port = r.port,
            previous_timestamp = r.previous_timestamp,
            current_timestamp = r.current_timestamp,
            "Fresher scan result has been overridden by an older one"
        );
    }

    report.regressions = findings.regressions;
    report.missing = findings.missing;
    (report, Some(current))
}

fn log_summary(report: &CycleReport) {
    let found = report.regressions.len();
    if found == 0 {
        tracing::info!(
            "Consistency check {} completed: {} incorrect transitions found",
            report.cycle,
            found
        );
    } else {
        tracing::error!(
            "Consistency check {} completed: {} incorrect transitions found",
            report.cycle,
            found
        );
    }
}

/// Monitor event loop - snapshots the store every interval until cancelled.
/// No single cycle's failure stops the loop.
pub async fn run(
    store: StoreHandle,
    config: MonitorConfig,
    report_tx: watch::Sender<CycleReport>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut interval = tokio::time::interval(config.interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut baseline: Option<Snapshot> = None;
    let mut cycle: u64 = 0;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                cycle += 1;
                tracing::debug!("Consistency check {} started", cycle);

                let guard = CallGuard::new(config.snapshot_timeout(), cancel.child_token());
                let fetched = store.snapshot_all(guard).await;
                // A snapshot cut short by shutdown is not a store failure
                if cancel.is_cancelled() {
                    break;
                }
                let (report, next) = evaluate(cycle, baseline.take(), fetched);
                baseline = next;

                log_summary(&report);
                report_tx.send_replace(report);
            }
        }
    }

    tracing::info!("Consistency monitor shutting down");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use shared::types::ScanRecord;
    use crate::store::db::RecordStore;
    use crate::store::hash::{record_key, scan_key};

    fn record(port: u32, timestamp: i64) -> ScanRecord {
        ScanRecord {
            service: "HTTP".to_string(),
            ip: "10.1.2.3".to_string(),
            port,
            timestamp,
            version: 2,
            data: format!("seen at {timestamp}"),
        }
    }

    fn snapshot_of(records: &[ScanRecord]) -> Snapshot {
        records.iter().map(|r| (record_key(r), r.clone())).collect()
    }

    #[test]
    fn test_detects_regression() {
        let previous = snapshot_of(&[record(80, 100), record(443, 100)]);
        let current = snapshot_of(&[record(80, 50), record(443, 120)]);

        let findings = compare(&previous, &current);
        assert_eq!(findings.regressions.len(), 1);
        let r = &findings.regressions[0];
        assert_eq!(r.key, scan_key("HTTP", "10.1.2.3", 80));
        assert_eq!((r.service.as_str(), r.ip.as_str(), r.port), ("HTTP", "10.1.2.3", 80));
        assert_eq!((r.previous_timestamp, r.current_timestamp), (100, 50));
        assert!(findings.missing.is_empty());
    }

    #[test]
    fn test_unchanged_and_new_keys_are_clean() {
        let previous = snapshot_of(&[record(80, 100)]);
        let current = snapshot_of(&[record(80, 100), record(22, 1)]);
        assert_eq!(compare(&previous, &current), Findings::default());
    }

    #[test]
    fn test_missing_key_is_not_a_regression() {
        let previous = snapshot_of(&[record(80, 100), record(443, 100)]);
        let current = snapshot_of(&[record(443, 10)]);

        let findings = compare(&previous, &current);
        assert_eq!(findings.missing, vec![scan_key("HTTP", "10.1.2.3", 80)]);
        // The scan carries on past the missing key
        assert_eq!(findings.regressions.len(), 1);
        assert_eq!(findings.regressions[0].port, 443);
    }

    #[test]
    fn test_first_cycle_only_sets_baseline() {
        let current = snapshot_of(&[record(80, 100)]);
        let (report, baseline) = evaluate(1, None, Ok(current.clone()));

        assert!(report.bootstrap);
        assert!(report.regressions.is_empty());
        assert_eq!(report.records, 1);
        assert_eq!(baseline, Some(current));
    }

    #[test]
    fn test_regression_reported_then_baseline_replaced() {
        let previous = snapshot_of(&[record(80, 100)]);
        let current = snapshot_of(&[record(80, 50)]);

        let (report, baseline) = evaluate(2, Some(previous), Ok(current.clone()));
        assert_eq!(report.cycle, 2);
        assert_eq!(report.regressions.len(), 1);
        assert!(!report.bootstrap);
        assert_eq!(baseline, Some(current));
    }

    #[test]
    fn test_fetch_failure_keeps_baseline() {
        let previous = snapshot_of(&[record(80, 100)]);

        let (report, baseline) = evaluate(3, Some(previous.clone()), Err(StoreError::Timeout));
        assert!(report.fetch_failed);
        assert!(report.regressions.is_empty());
        assert_eq!(report.digest, None);
        assert_eq!(baseline, Some(previous.clone()));

        // The next good snapshot is still compared against the old baseline
        let (report, _) = evaluate(4, baseline, Ok(snapshot_of(&[record(80, 40)])));
        assert_eq!(report.regressions.len(), 1);
    }

    #[test]
    fn test_fetch_failure_without_baseline_stays_empty() {
        let (report, baseline) = evaluate(1, None, Err(StoreError::Unavailable));
        assert!(report.fetch_failed);
        assert!(!report.bootstrap);
        assert_eq!(baseline, None);
    }

    #[tokio::test]
    async fn test_run_publishes_reports_until_cancelled() {
        let store = StoreHandle::spawn(RecordStore::open(":memory:").unwrap());
        let guard = CallGuard::new(Duration::from_secs(10), CancellationToken::new());
        store.upsert(record(80, 100), guard).await.unwrap();

        let config = MonitorConfig {
            enabled: true,
            interval_ms: 10,
            snapshot_timeout_ms: 1000,
        };
        let (report_tx, mut report_rx) = watch::channel(CycleReport::default());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(store, config, report_tx, cancel.clone()));

        let report = loop {
            report_rx.changed().await.unwrap();
            let report = report_rx.borrow_and_update().clone();
            if report.cycle >= 2 {
                break report;
            }
        };
        assert!(report.regressions.is_empty());
        assert_eq!(report.records, 1);
        assert!(report.digest.is_some());

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_stops_quietly_when_already_cancelled() {
        let store = StoreHandle::spawn(RecordStore::open(":memory:").unwrap());
        store.upsert(record(80, 100), CallGuard::new(Duration::from_secs(10), CancellationToken::new()))
            .await
            .unwrap();

        let config = MonitorConfig {
            enabled: true,
            interval_ms: 10,
            snapshot_timeout_ms: 1000,
        };
        let (report_tx, report_rx) = watch::channel(CycleReport::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        run(store, config, report_tx, cancel).await.unwrap();

        // No cycle ran, so no failed fetch was ever published
        assert!(!report_rx.has_changed().unwrap_or(false));
        let report = report_rx.borrow();
        assert_eq!(report.cycle, 0);
        assert!(!report.fetch_failed);
    }
}
