//! Replication worker
//!
//! Handles:
//! - Resolving the remote database, retrying while it is unreachable
//! - Pushing local changes and pulling remote ones by sequence number
//! - Waking on either side's change feed, or after the retry interval

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};
use url::Url;

use super::{ReplicationRequest, ReplicationState, ReplicationStatus};
use crate::error::{StoreError, StoreResult};
use crate::storage::{ChangeEvent, Database, LocalServer};

/// Maximum number of changes read per batch
const BATCH_SIZE: usize = 500;

#[derive(Debug, Default, Clone, Copy)]
struct Checkpoint {
    pushed_seq: u64,
    pulled_seq: u64,
}

/// Copies documents in both directions between a local database and a
/// database on a registered in-process server.
pub struct ReplicationWorker {
    local: Database,
    remote: Url,
    remote_db: String,
    doc_ids: Option<Vec<String>>,
    retry_interval: Duration,
    remotes: Arc<DashMap<String, LocalServer>>,
    status: Arc<watch::Sender<ReplicationStatus>>,
}

impl ReplicationWorker {
    pub fn new(
        request: ReplicationRequest,
        remote_db: String,
        remotes: Arc<DashMap<String, LocalServer>>,
        status: Arc<watch::Sender<ReplicationStatus>>,
    ) -> Self {
        Self {
            local: request.local,
            remote: request.remote,
            remote_db,
            doc_ids: request.doc_ids,
            retry_interval: request.retry_interval,
            remotes,
            status,
        }
    }

    pub async fn run(self) {
        let mut local_rx = self.local.subscribe();
        let (remote, mut remote_rx) = self.connect().await;
        let mut checkpoint = Checkpoint::default();

        loop {
            self.update(|status| status.state = ReplicationState::Active);

            match self.replicate_once(&remote, &mut checkpoint) {
                Ok((pushed, pulled)) => {
                    if pushed + pulled > 0 {
                        debug!(
                            "Replicated {} <-> {}: pushed {}, pulled {}",
                            self.local.name, self.remote, pushed, pulled
                        );
                    }
                    self.update(|status| status.record_pass(pushed, pulled));
                }
                Err(e) => {
                    warn!("Replication {} <-> {} failed: {}", self.local.name, self.remote, e);
                    self.update(|status| status.record_failure(&e));
                }
            }

            let woke = tokio::select! {
                r = local_rx.recv() => Wake::Local(r),
                r = remote_rx.recv() => Wake::Remote(r),
                _ = tokio::time::sleep(self.retry_interval) => Wake::Timer,
            };
            match woke {
                Wake::Local(Err(broadcast::error::RecvError::Closed)) => {
                    local_rx = self.local.subscribe();
                }
                Wake::Remote(Err(broadcast::error::RecvError::Closed)) => {
                    remote_rx = remote.subscribe();
                }
                _ => {}
            }
        }
    }

    /// Resolve the remote database, retrying until its server is registered
    async fn connect(&self) -> (Database, broadcast::Receiver<ChangeEvent>) {
        loop {
            match self.resolve_remote() {
                Ok(db) => {
                    let rx = db.subscribe();
                    return (db, rx);
                }
                Err(e) => {
                    debug!("Remote {} unreachable: {}", self.remote, e);
                    self.update(|status| status.record_failure(&e));
                    tokio::time::sleep(self.retry_interval).await;
                }
            }
        }
    }

    fn resolve_remote(&self) -> StoreResult<Database> {
        let origin = self.remote.origin().ascii_serialization();
        let server = self
            .remotes
            .get(&origin)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::RemoteUnavailable(self.remote.to_string()))?;
        server.create_database(&self.remote_db)
    }

    fn replicate_once(&self, remote: &Database, checkpoint: &mut Checkpoint) -> StoreResult<(u64, u64)> {
        let pushed = self.copy(&self.local, remote, &mut checkpoint.pushed_seq)?;
        let pulled = self.copy(remote, &self.local, &mut checkpoint.pulled_seq)?;
        Ok((pushed, pulled))
    }

    fn copy(&self, source: &Database, target: &Database, since: &mut u64) -> StoreResult<u64> {
        let mut applied = 0;
        loop {
            let batch = source.changes_since(*since, BATCH_SIZE)?;
            if batch.is_empty() {
                return Ok(applied);
            }
            for (seq, doc) in batch {
                if self.wants(&doc.id) && target.put_replicated(&doc)? {
                    applied += 1;
                }
                *since = seq;
            }
        }
    }

    /// Apply a status change unless the handle already marked us stopped
    fn update(&self, change: impl FnOnce(&mut ReplicationStatus)) {
        self.status.send_if_modified(|status| {
            if status.state == ReplicationState::Stopped {
                return false;
            }
            change(status);
            true
        });
    }

    fn wants(&self, id: &str) -> bool {
        self.doc_ids
            .as_ref()
            .map(|ids| ids.iter().any(|wanted| wanted == id))
            .unwrap_or(true)
    }
}

enum Wake {
    Local(Result<ChangeEvent, broadcast::error::RecvError>),
    Remote(Result<ChangeEvent, broadcast::error::RecvError>),
    Timer,
}
