//! Client entry point
//!
//! Opens the local store, owns the [`Session`] and feeds it the control
//! database's change notifications from a background task.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::error::{StoreError, SyncpointResult};
use crate::models::{Channel, ModelQuery, Session};
use crate::replication::{LoopbackReplicator, Replicator};
use crate::storage::{ChangeEvent, Database, LocalServer};

/// Pairs with the server and tracks channels and subscriptions
pub struct Client {
    session: Session,
    server: LocalServer,
    config: ClientConfig,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("app_id", &self.config.app_id)
            .field("remote_url", &self.config.remote_url)
            .field("session", &self.session)
            .finish()
    }
}

impl Client {
    /// Open the store for `app_id` in the user data directory. Without a
    /// registered remote the in-process replicator reports every replication
    /// offline and keeps retrying.
    pub fn initialize(remote_url: &str, app_id: &str) -> SyncpointResult<Self> {
        Self::initialize_with_config(
            ClientConfig::new(remote_url, app_id),
            Arc::new(LoopbackReplicator::new()),
        )
    }

    /// Open the store described by `config`
    pub fn initialize_with_config(
        config: ClientConfig,
        replicator: Arc<dyn Replicator>,
    ) -> SyncpointResult<Self> {
        config.validate()?;
        let server = LocalServer::open(config.store_path())?;
        Self::with_server(server, config, replicator)
    }

    /// Use an application-provided local server. Must be called within a
    /// Tokio runtime.
    pub fn with_server(
        server: LocalServer,
        config: ClientConfig,
        replicator: Arc<dyn Replicator>,
    ) -> SyncpointResult<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(StoreError::from)?;

        // Subscribe before the session loads so no change falls in between
        let control = server.create_database(&config.control_database)?;
        let changes = control.subscribe();

        let session = Session::open(server.clone(), config.clone(), replicator)?;
        session.reconcile();
        let pump = runtime.spawn(pump_changes(session.clone(), changes));
        info!("Syncpoint client for '{}' started, session {}", config.app_id, session.id());

        Ok(Self {
            session,
            server,
            config,
            pump: Mutex::new(Some(pump)),
        })
    }

    /// Request pairing. The outcome is observed on the session's state.
    pub fn pair(&self, pairing_type: &str, token: &str) -> SyncpointResult<()> {
        self.session.pair(pairing_type, token)
    }

    /// The local identity's channel with this name, created if missing. It
    /// is installed as soon as the service marks it ready.
    pub fn channel_named(&self, name: &str) -> SyncpointResult<Channel> {
        let channel = match self.session.my_channel_named(name) {
            Some(channel) => channel,
            None => self.session.make_channel(name)?,
        };
        channel.install_when_ready()?;
        Ok(channel)
    }

    /// Live query over the local identity's channels
    pub fn my_channels_query(&self) -> ModelQuery<Channel> {
        self.session.my_channels()
    }

    /// The local replica of the control database
    pub fn my_database(&self) -> Database {
        self.session.database().clone()
    }

    pub fn local_server(&self) -> &LocalServer {
        &self.server
    }

    pub fn app_id(&self) -> &str {
        &self.config.app_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Stop change handling and every replication
    pub fn shutdown(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.session.stop_all();
        info!("Syncpoint client for '{}' shut down", self.config.app_id);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

async fn pump_changes(session: Session, mut changes: broadcast::Receiver<ChangeEvent>) {
    loop {
        match changes.recv().await {
            Ok(event) => session.handle_change(&event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Missed {} control changes", missed);
                if let Err(e) = session.resync() {
                    error!("Failed to resynchronise session {}: {}", session.id(), e);
                }
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!("Control change feed closed");
                break;
            }
        }
    }
}
