//! Installations: a device's replicating binding of a local database to a
//! subscribed channel

use serde::Serialize;
use tracing::{debug, info};
use url::Url;

use super::{fields, Channel, Model, Session, Subscription};
use crate::error::{StoreError, SyncpointError, SyncpointResult};
use crate::replication::{ReplicationRequest, ReplicationStatus};
use crate::storage::{Database, Document};

pub const DOC_TYPE: &str = "installation";

pub(crate) const STATE_CREATED: &str = "created";
const STATE_UNINSTALLED: &str = "uninstalled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallationState {
    Unstarted,
    Syncing,
    Stopped,
    /// Terminal
    Uninstalled,
}

impl InstallationState {
    /// `replication` is `Some(running)` when this process started the
    /// installation's replication.
    pub fn derive(doc: &Document, replication: Option<bool>) -> Self {
        if doc.deleted || doc.get_str(fields::STATE) == Some(STATE_UNINSTALLED) {
            return InstallationState::Uninstalled;
        }
        match replication {
            Some(true) => InstallationState::Syncing,
            Some(false) => InstallationState::Stopped,
            None => InstallationState::Unstarted,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Installation {
    session: Session,
    doc: Document,
}

impl Model for Installation {
    const DOC_TYPE: &'static str = DOC_TYPE;

    fn from_document(session: &Session, doc: Document) -> Self {
        Self {
            session: session.clone(),
            doc,
        }
    }

    fn document(&self) -> &Document {
        &self.doc
    }

    fn is_active(&self) -> bool {
        !self.is_uninstalled()
    }

    fn did_change(&self) -> SyncpointResult<()> {
        if !self.is_local() {
            return Ok(());
        }
        if self.is_uninstalled() {
            self.session.release_replication(self.id());
            return Ok(());
        }

        match self.subscription() {
            None => {
                debug!("Installation {} has no subscription here, stopping", self.id());
                self.session.stop_replication(self.id());
                Ok(())
            }
            Some(subscription) if !subscription.is_active() => {
                info!("Subscription {} ended, uninstalling {}", subscription.id(), self.id());
                self.uninstall()
            }
            Some(_) => {
                let ready = self.channel().map(|c| c.is_ready()).unwrap_or(false);
                if self.session.config().auto_sync
                    && ready
                    && self.session.is_paired()
                    && self.state() == InstallationState::Unstarted
                {
                    self.sync()?;
                }
                Ok(())
            }
        }
    }
}

impl Installation {
    pub fn state(&self) -> InstallationState {
        InstallationState::derive(&self.doc, self.session.replication_running(self.id()))
    }

    pub fn is_uninstalled(&self) -> bool {
        self.doc.deleted || self.doc.get_str(fields::STATE) == Some(STATE_UNINSTALLED)
    }

    /// Created by this device, as opposed to replicated from another one
    pub fn is_local(&self) -> bool {
        self.doc.get_str(fields::SESSION_ID) == Some(self.session.id())
    }

    pub fn channel_id(&self) -> Option<&str> {
        self.doc.get_non_empty(fields::CHANNEL_ID)
    }

    pub fn subscription_id(&self) -> Option<&str> {
        self.doc.get_non_empty(fields::SUBSCRIPTION_ID)
    }

    pub fn local_db_name(&self) -> Option<&str> {
        self.doc.get_non_empty(fields::LOCAL_DB_NAME)
    }

    pub fn subscription(&self) -> Option<Subscription> {
        self.session.subscription(self.subscription_id()?)
    }

    pub fn channel(&self) -> Option<Channel> {
        self.session.channel(self.channel_id()?)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The bound local database. Only meaningful on the device that created
    /// the installation.
    pub fn local_database(&self) -> SyncpointResult<Database> {
        let name = self.local_db_name().ok_or_else(|| {
            StoreError::InvalidDocument(format!("installation '{}' has no local database", self.id()))
        })?;
        Ok(self.session.server().create_database(name)?)
    }

    /// Remote database of the installed channel
    pub fn remote_url(&self) -> SyncpointResult<Url> {
        let not_ready = || SyncpointError::NotReady(self.channel_id().unwrap_or_default().to_string());
        let channel = self.channel().ok_or_else(not_ready)?;
        let cloud_database = channel.cloud_database().ok_or_else(not_ready)?;
        Ok(self.session.remote_url().join(cloud_database).map_err(StoreError::from)?)
    }

    /// Start replicating with the channel's remote database. Calling it on an
    /// installation that is already syncing does nothing.
    pub fn sync(&self) -> SyncpointResult<()> {
        if !self.is_local() {
            return Err(SyncpointError::NotLocal(self.id().to_string()));
        }
        let current = self.reload();
        if current.is_uninstalled() {
            return Err(SyncpointError::Uninstalled(self.id().to_string()));
        }
        let credentials = self.session.credentials().ok_or(SyncpointError::NotPaired)?;
        if !current.channel().map(|c| c.is_ready()).unwrap_or(false) {
            return Err(SyncpointError::NotReady(
                self.channel_id().unwrap_or_default().to_string(),
            ));
        }

        let request = ReplicationRequest::new(current.local_database()?, current.remote_url()?)
            .with_credentials(credentials)
            .with_retry_interval(self.session.config().retry_interval());
        self.session.start_replication(self.id(), request)
    }

    /// Pause replication; [`Installation::sync`] resumes it
    pub fn stop(&self) -> SyncpointResult<()> {
        if !self.is_local() {
            return Err(SyncpointError::NotLocal(self.id().to_string()));
        }
        self.session.stop_replication(self.id());
        Ok(())
    }

    /// Stop replication and mark the installation uninstalled. The local
    /// database and its data are kept. Repeated calls are no-ops.
    pub fn uninstall(&self) -> SyncpointResult<()> {
        if !self.is_local() {
            return Err(SyncpointError::NotLocal(self.id().to_string()));
        }
        self.session.release_replication(self.id());

        let result = self.session.update_document(self.id(), |doc| {
            if doc.get_str(fields::STATE) == Some(STATE_UNINSTALLED) {
                return false;
            }
            doc.set(fields::STATE, STATE_UNINSTALLED);
            true
        });
        match result {
            Ok(_) => {
                info!("Uninstalled {}", self.id());
                Ok(())
            }
            Err(SyncpointError::Store(StoreError::DocumentNotFound(_))) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Status of the running or last replication
    pub fn status(&self) -> Option<ReplicationStatus> {
        self.session.replication_status(self.id())
    }

    fn reload(&self) -> Installation {
        self.session
            .repository()
            .get_any(self.id())
            .map(|doc| Installation::from_document(&self.session, doc))
            .unwrap_or_else(|| self.clone())
    }
}
