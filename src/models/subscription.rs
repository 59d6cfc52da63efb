//! Subscriptions: the local identity's claim on a channel

use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::{fields, Channel, Installation, Model, Session};
use crate::error::{StoreError, SyncpointError, SyncpointResult};
use crate::storage::{Database, Document};

pub const DOC_TYPE: &str = "subscription";

pub(crate) const STATE_ACTIVE: &str = "active";
const STATE_UNSUBSCRIBED: &str = "unsubscribed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Active,
    Unsubscribed,
}

impl SubscriptionState {
    pub fn derive(doc: &Document) -> Self {
        if !doc.deleted && doc.get_str(fields::STATE) == Some(STATE_ACTIVE) {
            SubscriptionState::Active
        } else {
            SubscriptionState::Unsubscribed
        }
    }
}

#[derive(Debug, Clone)]
pub struct Subscription {
    session: Session,
    doc: Document,
}

impl Model for Subscription {
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
        self.state() == SubscriptionState::Active
    }

    fn did_change(&self) -> SyncpointResult<()> {
        for installation in self.installations().into_iter().filter(Installation::is_local) {
            installation.did_change()?;
        }
        Ok(())
    }
}

impl Subscription {
    pub fn state(&self) -> SubscriptionState {
        SubscriptionState::derive(&self.doc)
    }

    pub fn channel_id(&self) -> Option<&str> {
        self.doc.get_non_empty(fields::CHANNEL_ID)
    }

    pub fn channel(&self) -> Option<Channel> {
        self.session.channel(self.channel_id()?)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub(crate) fn is_mine(&self) -> bool {
        match (self.owner_id(), self.session.owner_id()) {
            (Some(owner), Some(mine)) => owner == mine,
            _ => false,
        }
    }

    /// Installations of this subscription on every device
    pub fn installations(&self) -> Vec<Installation> {
        self.session
            .repository()
            .of_type(super::installation::DOC_TYPE)
            .into_iter()
            .map(|doc| Installation::from_document(&self.session, doc))
            .filter(|i| i.subscription_id() == Some(self.id()))
            .collect()
    }

    /// This device's installation; the earliest one if there are several
    pub fn installation(&self) -> Option<Installation> {
        self.installations()
            .into_iter()
            .find(|i| i.is_local() && !i.is_uninstalled())
    }

    /// Bind a local database to this subscription on this device. Without a
    /// database, a fresh one with a random name is created.
    ///
    /// An existing installation is not checked for: a second call creates a
    /// second, independent replication.
    pub fn make_installation(&self, local_database: Option<&Database>) -> SyncpointResult<Installation> {
        let owner_id = self.session.owner_id().ok_or(SyncpointError::NotPaired)?;
        let channel_id = self
            .channel_id()
            .ok_or_else(|| SyncpointError::NotReady(self.id().to_string()))?;

        let database = match local_database {
            Some(database) if !self.session.server().owns(database) => {
                return Err(StoreError::DatabaseNotFound(database.name.clone()).into());
            }
            Some(database) => self.session.server().create_database(&database.name)?,
            None => self.session.server().create_database(&generate_database_name())?,
        };

        let doc = self.session.create_document(json!({
            fields::TYPE: super::installation::DOC_TYPE,
            fields::STATE: super::installation::STATE_CREATED,
            fields::OWNER_ID: owner_id,
            fields::CHANNEL_ID: channel_id,
            fields::SUBSCRIPTION_ID: self.id(),
            fields::SESSION_ID: self.session.id(),
            fields::LOCAL_DB_NAME: database.name,
        }))?;
        info!(
            "Installed subscription {} as {} into '{}'",
            self.id(),
            doc.id,
            database.name
        );

        let installation = Installation::from_document(&self.session, doc);
        if let Err(e) = installation.did_change() {
            warn!("Installation {} not started: {}", installation.id(), e);
        }
        Ok(installation)
    }

    /// Uninstall this device's installations, then mark the subscription
    /// unsubscribed. Other devices stop theirs when the change reaches them.
    pub fn unsubscribe(&self) -> SyncpointResult<()> {
        for installation in self.installations().into_iter().filter(Installation::is_local) {
            installation.uninstall()?;
        }

        self.session.update_document(self.id(), |doc| {
            if doc.get_str(fields::STATE) == Some(STATE_UNSUBSCRIBED) {
                return false;
            }
            doc.set(fields::STATE, STATE_UNSUBSCRIBED);
            true
        })?;
        info!("Unsubscribed {}", self.id());
        Ok(())
    }
}

/// Collision-resistant name for a new local database
fn generate_database_name() -> String {
    format!("channel-{}", Uuid::new_v4().simple())
}
