//! Continuous replication between a local database and a remote one
//!
//! The [`Replicator`] trait is the seam to whatever actually moves documents
//! to the remote service. A running replication is owned through a
//! [`ReplicationHandle`]; dropping or stopping the handle ends it.

pub mod loopback;
pub mod worker;

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use url::Url;

use crate::error::StoreResult;
use crate::storage::Database;

pub use loopback::LoopbackReplicator;
pub use worker::ReplicationWorker;

/// Default delay between retries of a failing or idle replication
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Starts continuous, bidirectional replications
pub trait Replicator: Send + Sync {
    fn replicate(&self, request: ReplicationRequest) -> StoreResult<ReplicationHandle>;
}

/// Credentials presented to the remote service
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("secret", &"***")
            .finish()
    }
}

/// What to replicate, and with whom
#[derive(Debug, Clone)]
pub struct ReplicationRequest {
    pub local: Database,
    pub remote: Url,
    pub credentials: Option<Credentials>,
    /// Restrict replication to these document ids
    pub doc_ids: Option<Vec<String>>,
    pub retry_interval: Duration,
}

impl ReplicationRequest {
    pub fn new(local: Database, remote: Url) -> Self {
        Self {
            local,
            remote,
            credentials: None,
            doc_ids: None,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_doc_ids(mut self, doc_ids: Vec<String>) -> Self {
        self.doc_ids = Some(doc_ids);
        self
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationState {
    Starting,
    /// Copying documents
    Active,
    /// Caught up, waiting for changes
    Idle,
    /// Remote unreachable or the last pass failed; will retry
    Offline,
    Stopped,
}

/// Progress and last failure of a replication
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicationStatus {
    pub state: ReplicationState,
    pub pushed: u64,
    pub pulled: u64,
    pub last_error: Option<String>,
}

impl Default for ReplicationStatus {
    fn default() -> Self {
        Self {
            state: ReplicationState::Starting,
            pushed: 0,
            pulled: 0,
            last_error: None,
        }
    }
}

impl ReplicationStatus {
    /// Record a completed pass
    pub(crate) fn record_pass(&mut self, pushed: u64, pulled: u64) {
        self.state = ReplicationState::Idle;
        self.pushed += pushed;
        self.pulled += pulled;
        self.last_error = None;
    }

    /// Record a failed pass or an unreachable remote
    pub(crate) fn record_failure(&mut self, error: impl ToString) {
        self.state = ReplicationState::Offline;
        self.last_error = Some(error.to_string());
    }
}

/// Owns a running replication task
pub struct ReplicationHandle {
    id: String,
    local: String,
    remote: Url,
    status: Arc<watch::Sender<ReplicationStatus>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ReplicationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationHandle")
            .field("id", &self.id)
            .field("local", &self.local)
            .field("remote", &self.remote.as_str())
            .field("state", &self.status.borrow().state)
            .finish()
    }
}

impl ReplicationHandle {
    pub fn new(
        local: &Database,
        remote: Url,
        status: Arc<watch::Sender<ReplicationStatus>>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            local: local.name.clone(),
            remote,
            status,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    pub fn remote(&self) -> &Url {
        &self.remote
    }

    pub fn status(&self) -> ReplicationStatus {
        self.status.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ReplicationStatus> {
        self.status.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Stop replicating. Calling this more than once is harmless.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            tracing::info!(
                "Stopped replication {} ({} <-> {})",
                self.id,
                self.local,
                self.remote
            );
        }
        self.status.send_modify(|status| status.state = ReplicationState::Stopped);
    }
}

impl Drop for ReplicationHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_pass_is_offline_until_next_success() {
        let mut status = ReplicationStatus::default();
        status.record_pass(2, 1);
        assert_eq!(status.state, ReplicationState::Idle);

        status.record_failure("disk I/O error");
        assert_eq!(status.state, ReplicationState::Offline);
        assert_eq!(status.last_error.as_deref(), Some("disk I/O error"));
        assert_eq!((status.pushed, status.pulled), (2, 1));

        status.record_pass(0, 3);
        assert_eq!(status.state, ReplicationState::Idle);
        assert!(status.last_error.is_none());
        assert_eq!((status.pushed, status.pulled), (2, 4));
    }
}
