//! In-process replicator
//!
//! Resolves a remote URL's origin to a [`LocalServer`] registered under it and
//! the URL's last path segment to a database on that server. Useful for
//! running a device against an in-process stand-in for the remote service,
//! and as the default when no remote is reachable: unregistered origins
//! report `Offline` and are retried.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::watch;
use url::Url;

use super::{ReplicationHandle, ReplicationRequest, ReplicationStatus, ReplicationWorker, Replicator};
use crate::error::{StoreError, StoreResult};
use crate::storage::{validate_database_name, LocalServer};

#[derive(Clone, Default)]
pub struct LoopbackReplicator {
    remotes: Arc<DashMap<String, LocalServer>>,
}

impl LoopbackReplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `url`'s origin from `server`
    pub fn register(&self, url: &Url, server: LocalServer) {
        let origin = url.origin().ascii_serialization();
        tracing::debug!("Registered loopback remote {}", origin);
        self.remotes.insert(origin, server);
    }

    pub fn unregister(&self, url: &Url) {
        self.remotes.remove(&url.origin().ascii_serialization());
    }
}

impl Replicator for LoopbackReplicator {
    fn replicate(&self, request: ReplicationRequest) -> StoreResult<ReplicationHandle> {
        let runtime = tokio::runtime::Handle::try_current()?;
        let remote_db = remote_database_name(&request.remote)?;

        let (status, _) = watch::channel(ReplicationStatus::default());
        let status = Arc::new(status);
        let local = request.local.clone();
        let remote = request.remote.clone();

        tracing::info!("Starting replication {} <-> {}", local.name, remote);
        let worker = ReplicationWorker::new(request, remote_db, self.remotes.clone(), status.clone());
        let task = runtime.spawn(worker.run());

        Ok(ReplicationHandle::new(&local, remote, status, task))
    }
}

/// The database a remote URL points at: its last non-empty path segment
pub fn remote_database_name(url: &Url) -> StoreResult<String> {
    let name = url
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .ok_or_else(|| StoreError::RemoteUnavailable(url.to_string()))?;
    validate_database_name(name)?;
    Ok(name.to_string())
}
