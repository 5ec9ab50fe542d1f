use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use tokio::sync::{mpsc, oneshot};
use anyhow::{bail, Context, Result};
use shared::types::ScanRecord;
use crate::store::db::{RecordStore, Snapshot};
use crate::store::{CallGuard, StoreError, UpsertOutcome};

type Reply<T> = oneshot::Sender<Result<T, StoreError>>;

/// Commands sent to a store thread
pub enum StoreCommand {
    Upsert(ScanRecord, CallGuard, Reply<UpsertOutcome>),
    Snapshot(CallGuard, Reply<Snapshot>),
    Shutdown,
}

/// Handle to one store thread. The thread owns a single SQLite connection.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreCommand>,
}

impl StoreHandle {
    /// Spawn a new store thread owning the given connection
    pub fn spawn(mut store: RecordStore) -> Self {
        let (tx, mut rx) = mpsc::channel::<StoreCommand>(256);

        thread::spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    StoreCommand::Upsert(record, guard, reply) => {
                        let _ = reply.send(store.upsert(&record, &guard));
                    }
                    StoreCommand::Snapshot(guard, reply) => {
                        let _ = reply.send(store.snapshot_all(&guard));
                    }
                    StoreCommand::Shutdown => {
                        tracing::debug!("Store thread shutting down");
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    /// Last-write-wins upsert of one record.
    pub async fn upsert(&self, record: ScanRecord, guard: CallGuard) -> Result<UpsertOutcome, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.call(StoreCommand::Upsert(record, guard.clone(), reply), rx, &guard).await
    }

    /// Read every stored record.
    pub async fn snapshot_all(&self, guard: CallGuard) -> Result<Snapshot, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.call(StoreCommand::Snapshot(guard.clone(), reply), rx, &guard).await
    }

    /// Shutdown the store thread
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        self.tx
            .send(StoreCommand::Shutdown)
            .await
            .map_err(|_| StoreError::Unavailable)
    }

    // Queueing is raced against the guard. Once queued, the thread itself
    // honors the guard, so the reply always arrives in bounded time.
    async fn call<T>(
        &self,
        cmd: StoreCommand,
        rx: oneshot::Receiver<Result<T, StoreError>>,
        guard: &CallGuard,
    ) -> Result<T, StoreError> {
        tokio::select! {
            sent = self.tx.send(cmd) => sent.map_err(|_| StoreError::Unavailable)?,
            reason = guard.expired() => return Err(reason),
        }
        rx.await.map_err(|_| StoreError::Unavailable)?
    }
}

/// A fixed set of store threads, each with its own connection to the same
/// database file. Writers picked from the pool contend only inside SQLite.
pub struct StorePool {
    handles: Vec<StoreHandle>,
    next: AtomicUsize,
}

impl StorePool {
    pub fn open(path: impl AsRef<Path>, connections: usize) -> Result<Self> {
        let path = path.as_ref();
        let handles = (0..connections.max(1))
            .map(|i| {
                RecordStore::open(path)
                    .with_context(|| format!("Failed to open store connection {}", i))
                    .map(StoreHandle::spawn)
            })
            .collect::<Result<Vec<_>>>()?;

        Self::from_handles(handles)
    }

    pub(crate) fn from_handles(handles: Vec<StoreHandle>) -> Result<Self> {
        if handles.is_empty() {
            bail!("A store pool needs at least one connection");
        }
        Ok(Self {
            handles,
            next: AtomicUsize::new(0),
        })
    }

    /// Next handle in round-robin order
    pub fn handle(&self) -> &StoreHandle {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.handles.len();
        &self.handles[i]
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Stop every store thread, logging failures
    pub async fn shutdown(&self) {
        for handle in &self.handles {
            if let Err(e) = handle.shutdown().await {
                tracing::error!("Failed to shutdown store thread: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use crate::store::hash::record_key;

    fn guard() -> CallGuard {
        CallGuard::new(Duration::from_secs(10), CancellationToken::new())
    }

    fn scan(timestamp: i64) -> ScanRecord {
        ScanRecord {
            service: "SSH".to_string(),
            ip: "192.168.1.20".to_string(),
            port: 22,
            timestamp,
            version: 2,
            data: format!("banner-{timestamp}"),
        }
    }

    #[tokio::test]
    async fn test_handle_round_trip() {
        let handle = StoreHandle::spawn(RecordStore::open(":memory:").unwrap());

        assert_eq!(handle.upsert(scan(10), guard()).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(handle.upsert(scan(5), guard()).await.unwrap(), UpsertOutcome::Stale);

        let snapshot = handle.snapshot_all(guard()).await.unwrap();
        assert_eq!(snapshot[&record_key(&scan(0))].timestamp, 10);
    }

    #[tokio::test]
    async fn test_shutdown_makes_handle_unavailable() {
        let handle = StoreHandle::spawn(RecordStore::open(":memory:").unwrap());
        handle.shutdown().await.unwrap();

        // Anything queued behind the shutdown is dropped along with its reply
        let result = handle.upsert(scan(1), guard()).await;
        assert!(matches!(result, Err(StoreError::Unavailable)));
    }

    #[test]
    fn test_empty_pool_is_rejected() {
        assert!(StorePool::from_handles(Vec::new()).is_err());
    }

    #[tokio::test]
    async fn test_pool_cycles_through_handles() {
        let pool = StorePool::from_handles(vec![
            StoreHandle::spawn(RecordStore::open(":memory:").unwrap()),
            StoreHandle::spawn(RecordStore::open(":memory:").unwrap()),
        ])
        .unwrap();

        // Separate in-memory databases, so each write lands on a different handle
        assert_eq!(pool.handle().upsert(scan(1), guard()).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(pool.handle().upsert(scan(1), guard()).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(pool.handle().upsert(scan(1), guard()).await.unwrap(), UpsertOutcome::Stale);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_pool_writers_never_lose_fresh_writes() {
        let dir = tempfile::tempdir().unwrap();
        let pool = std::sync::Arc::new(StorePool::open(dir.path().join("scans.db"), 4).unwrap());
        assert_eq!(pool.len(), 4);

        let mut tasks = tokio::task::JoinSet::new();
        for worker in 0..4i64 {
            let pool = pool.clone();
            tasks.spawn(async move {
                // Each worker walks its own stride, newest first for odd workers
                let mut timestamps: Vec<i64> = (0..25).map(|n| n * 4 + worker).collect();
                if worker % 2 == 1 {
                    timestamps.reverse();
                }
                for ts in timestamps {
                    pool.handle().upsert(scan(ts), guard()).await.unwrap();
                }
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }

        let snapshot = pool.handle().snapshot_all(guard()).await.unwrap();
        let current = &snapshot[&record_key(&scan(0))];
        assert_eq!(current.timestamp, 99);
        assert_eq!(current.data, "banner-99");

        pool.shutdown().await;
    }
}
