//! Channels: remote databases advertised to, or owned by, the local identity

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::{fields, Installation, Model, Session, Subscription};
use crate::error::{SyncpointError, SyncpointResult};
use crate::storage::{Database, Document};

pub const DOC_TYPE: &str = "channel";

pub(crate) const STATE_NEW: &str = "new";
const STATE_UNPAIRED: &str = "unpaired";
const STATE_READY: &str = "ready";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    New,
    Unpaired,
    /// Provisioned by the service; may be subscribed to
    Ready,
}

impl ChannelState {
    pub fn derive(doc: &Document) -> Self {
        match doc.get_str(fields::STATE) {
            Some(STATE_READY) if doc.get_non_empty(fields::OWNER_ID).is_some() => ChannelState::Ready,
            Some(STATE_UNPAIRED) => ChannelState::Unpaired,
            _ => ChannelState::New,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Channel {
    session: Session,
    doc: Document,
}

impl Model for Channel {
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
        self.is_ready()
    }

    /// Proceed with a pending install once ready, and let this channel's
    /// local installations catch up with its readiness.
    fn did_change(&self) -> SyncpointResult<()> {
        if self.doc.deleted {
            return Ok(());
        }
        self.run_pending_install()?;
        for installation in self.local_installations() {
            installation.did_change()?;
        }
        Ok(())
    }
}

impl Channel {
    pub fn state(&self) -> ChannelState {
        ChannelState::derive(&self.doc)
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ChannelState::Ready
    }

    pub fn is_unpaired(&self) -> bool {
        self.state() == ChannelState::Unpaired
    }

    pub fn name(&self) -> Option<&str> {
        self.doc.get_str(fields::NAME)
    }

    /// Remote database assigned by the service
    pub fn cloud_database(&self) -> Option<&str> {
        self.doc.get_non_empty(fields::CLOUD_DATABASE)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Created or subscribed to by the local identity
    pub fn is_mine(&self) -> bool {
        let Some(owner_id) = self.session.owner_id() else {
            return false;
        };
        self.owner_id() == Some(owner_id.as_str()) || self.subscription().is_some()
    }

    /// Latest indexed revision of this channel
    pub fn reload(&self) -> Channel {
        self.session.channel(self.id()).unwrap_or_else(|| self.clone())
    }

    /// The local identity's active subscription to this channel
    pub fn subscription(&self) -> Option<Subscription> {
        let owner_id = self.session.owner_id()?;
        self.session
            .repository()
            .of_type(super::subscription::DOC_TYPE)
            .into_iter()
            .map(|doc| Subscription::from_document(&self.session, doc))
            .find(|s| s.channel_id() == Some(self.id()) && s.owner_id() == Some(owner_id.as_str()) && s.is_active())
    }

    /// This device's installation of this channel
    pub fn installation(&self) -> Option<Installation> {
        self.subscription()?.installation()
    }

    /// The local database bound to this channel, if it is installed here
    pub fn local_database(&self) -> SyncpointResult<Option<Database>> {
        match self.installation() {
            Some(installation) => installation.local_database().map(Some),
            None => Ok(None),
        }
    }

    fn local_installations(&self) -> Vec<Installation> {
        self.session
            .repository()
            .of_type(super::installation::DOC_TYPE)
            .into_iter()
            .map(|doc| Installation::from_document(&self.session, doc))
            .filter(|i| i.channel_id() == Some(self.id()) && i.is_local())
            .collect()
    }

    /// Subscribe the local identity to this channel
    pub fn subscribe(&self) -> SyncpointResult<Subscription> {
        let lock = self.session.channel_lock(self.id());
        let _guard = lock.lock();
        self.subscribe_locked()
    }

    fn subscribe_locked(&self) -> SyncpointResult<Subscription> {
        let channel = self.reload();
        if !channel.is_ready() {
            return Err(SyncpointError::NotReady(self.id().to_string()));
        }
        let owner_id = self.session.owner_id().ok_or(SyncpointError::NotPaired)?;
        if channel.subscription().is_some() {
            return Err(SyncpointError::AlreadySubscribed(self.id().to_string()));
        }

        let doc = self.session.create_document(json!({
            fields::TYPE: super::subscription::DOC_TYPE,
            fields::STATE: super::subscription::STATE_ACTIVE,
            fields::OWNER_ID: owner_id,
            fields::CHANNEL_ID: self.id(),
        }))?;
        info!("Subscribed to channel '{}' ({})", self.id(), doc.id);
        Ok(Subscription::from_document(&self.session, doc))
    }

    /// The local database bound to this channel, subscribing and installing
    /// first if needed. Concurrent calls within a process create at most one
    /// installation.
    pub fn ensure_local_database(&self) -> SyncpointResult<Database> {
        let lock = self.session.channel_lock(self.id());
        let _guard = lock.lock();

        if let Some(installation) = self.installation() {
            return installation.local_database();
        }
        let subscription = match self.subscription() {
            Some(subscription) => subscription,
            None => self.subscribe_locked()?,
        };
        let installation = subscription.make_installation(None)?;
        debug!("Channel '{}' installed as {}", self.id(), installation.id());
        installation.local_database()
    }

    /// Install now if ready, otherwise as soon as the service marks the
    /// channel ready and the session is paired. The request stays queued
    /// until an install succeeds.
    pub fn install_when_ready(&self) -> SyncpointResult<Option<Database>> {
        // Queue before checking, so a ready revision applied in between
        // still finds the request
        self.session.add_pending_install(self.id());
        if self.session.owner_id().is_none() {
            warn!("Channel '{}' queued for install before pairing", self.id());
            return Ok(None);
        }
        let channel = self.reload();
        if !channel.is_ready() {
            return Ok(None);
        }
        channel.install_pending()
    }

    /// Run a queued install if the channel and the session allow it
    pub(crate) fn run_pending_install(&self) -> SyncpointResult<()> {
        if self.doc.deleted || !self.is_ready() || !self.session.is_paired() {
            return Ok(());
        }
        if !self.session.is_pending_install(self.id()) {
            return Ok(());
        }
        info!("Channel '{}' is ready, installing", self.id());
        self.install_pending().map(|_| ())
    }

    /// Install, then dequeue; a failed install stays queued for the next change
    fn install_pending(&self) -> SyncpointResult<Option<Database>> {
        let database = self.ensure_local_database()?;
        self.session.take_pending_install(self.id());
        Ok(Some(database))
    }

    /// Queued by [`Channel::install_when_ready`] and not yet installed
    pub fn is_install_pending(&self) -> bool {
        self.session.is_pending_install(self.id())
    }
}
