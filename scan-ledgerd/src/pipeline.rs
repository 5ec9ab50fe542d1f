use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use shared::types::ScanRecord;
use crate::store::{CallGuard, StoreError, UpsertOutcome};
use crate::store_manager::StorePool;

/// What the transport should do with the inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Persisted, or already superseded by a fresher record
    Ack,
    /// Not persisted; leave it for redelivery
    Nack,
}

impl Delivery {
    pub fn for_result<T, E>(result: &Result<T, E>) -> Self {
        match result {
            Ok(_) => Self::Ack,
            Err(_) => Self::Nack,
        }
    }
}

/// Bridges decoded scan records to the store. Retries are left to the
/// transport, driven by the [`Delivery`] decision.
#[derive(Clone)]
pub struct Pipeline {
    stores: Arc<StorePool>,
    upsert_timeout: Duration,
}

impl Pipeline {
    pub fn new(stores: Arc<StorePool>, upsert_timeout: Duration) -> Self {
        Self { stores, upsert_timeout }
    }

    /// Persist one record with last-write-wins semantics.
    ///
    /// The write is bounded by the configured timeout and is rolled back if
    /// `cancel` fires, or if this future is dropped, before it commits.
    pub async fn process(
        &self,
        record: ScanRecord,
        cancel: &CancellationToken,
    ) -> Result<UpsertOutcome, StoreError> {
        let token = cancel.child_token();
        let _abandon = token.clone().drop_guard();
        let guard = CallGuard::new(self.upsert_timeout, token);

        let result = self.stores.handle().upsert(record.clone(), guard).await;

        match &result {
            Ok(outcome) => tracing::info!(
                "[Service: {}, IP: {}, Port: {}, Timestamp: {}] stored as {:?}, {} row(s) affected",
                record.service,
                record.ip,
                record.port,
                record.scanned_at_display(),
                outcome,
                outcome.rows_affected()
            ),
            Err(e) => tracing::error!(
                "[Service: {}, IP: {}, Port: {}, Timestamp: {}] failed to store: {}",
                record.service,
                record.ip,
                record.port,
                record.scanned_at_display(),
                e
            ),
        }

        result
    }
}
