//! The local identity and its pairing state machine
//!
//! Pairing is a two-phase handshake carried by the session document itself:
//! the device writes a pairing request onto it and replicates just that
//! document to the service's handshake database; the service answers by
//! writing `owner_id` and a `control_database` (or an `error`) onto the same
//! document, which replicates back. Once paired, the whole local control
//! database replicates with the owner's remote control database.

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use url::Url;

use super::{fields, Channel, Installation, Model, ModelQuery, Repository, Subscription};
use crate::config::ClientConfig;
use crate::error::{StoreError, SyncpointError, SyncpointResult};
use crate::replication::{Credentials, ReplicationHandle, ReplicationRequest, ReplicationStatus, Replicator};
use crate::storage::{ChangeEvent, Database, Document, LocalServer};

pub const DOC_TYPE: &str = "session";

const STATE_NEW: &str = "new";
const STATE_PAIRED: &str = "paired";
const STATE_ERROR: &str = "error";

/// Attempts of a read-modify-write before a conflict is reported
const MAX_WRITE_ATTEMPTS: usize = 3;

/// Capacity of the session's own change feed
const CHANGES_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unpaired,
    ReadyToPair,
    /// Request written, waiting for the service
    Pairing,
    Paired,
    Error,
}

impl SessionState {
    /// Derive the pairing state from a session document
    pub fn derive(doc: &Document) -> Self {
        let state = doc.get_str(fields::STATE);
        if state == Some(STATE_PAIRED) && doc.get_non_empty(fields::OWNER_ID).is_some() {
            SessionState::Paired
        } else if doc.get_non_empty(fields::ERROR).is_some() || state == Some(STATE_ERROR) {
            SessionState::Error
        } else if doc.get_non_empty(fields::PAIRING_TOKEN).is_some() {
            SessionState::Pairing
        } else if state == Some(STATE_NEW) {
            SessionState::ReadyToPair
        } else {
            SessionState::Unpaired
        }
    }
}

struct SessionInner {
    id: String,
    server: LocalServer,
    database: Database,
    repository: Repository,
    config: ClientConfig,
    remote_url: Url,
    replicator: Arc<dyn Replicator>,
    state: watch::Sender<SessionState>,
    handshake: Mutex<Option<ReplicationHandle>>,
    control: Mutex<Option<ReplicationHandle>>,
    /// Replications of local installations, by installation id
    installs: DashMap<String, ReplicationHandle>,
    channel_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Channels to install as soon as they become ready
    pending_installs: DashSet<String>,
    changes: broadcast::Sender<ChangeEvent>,
}

/// Handle to the local identity; cheap to clone
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("control", &self.inner.database.name)
            .finish()
    }
}

impl Session {
    /// Open the session stored in `server`, creating its document on first
    /// use. Reconciliation doesn't start until [`Session::reconcile`] runs.
    pub fn open(
        server: LocalServer,
        config: ClientConfig,
        replicator: Arc<dyn Replicator>,
    ) -> SyncpointResult<Self> {
        config.validate()?;
        let remote_url = config.remote_url()?;
        let database = server.create_database(&config.control_database)?;

        let repository = Repository::new();
        repository.load(database.all_documents()?);

        let id_key = format!("{}:session_id", database.name);
        let known = server
            .get_metadata(&id_key)?
            .filter(|id| repository.get(id).is_some());
        let id = match known {
            Some(id) => id,
            None => {
                let doc = database.save(&Document::new(json!({
                    fields::TYPE: DOC_TYPE,
                    fields::STATE: STATE_NEW,
                })))?;
                repository.apply(&doc);
                server.set_metadata(&id_key, &doc.id)?;
                info!("Created session {}", doc.id);
                doc.id
            }
        };

        let initial = repository
            .get(&id)
            .map(|doc| SessionState::derive(&doc))
            .unwrap_or(SessionState::Unpaired);
        let (state, _) = watch::channel(initial);
        let (changes, _) = broadcast::channel(CHANGES_CAPACITY);

        Ok(Self {
            inner: Arc::new(SessionInner {
                id,
                server,
                database,
                repository,
                config,
                remote_url,
                replicator,
                state,
                handshake: Mutex::new(None),
                control: Mutex::new(None),
                installs: DashMap::new(),
                channel_locks: DashMap::new(),
                pending_installs: DashSet::new(),
                changes,
            }),
        })
    }

    /// Id of this device's session document
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Current session document
    pub fn document(&self) -> Document {
        self.inner
            .repository
            .get_any(&self.inner.id)
            .unwrap_or_else(|| Document::with_id(self.inner.id.clone(), json!({ fields::TYPE: DOC_TYPE })))
    }

    pub fn state(&self) -> SessionState {
        SessionState::derive(&self.document())
    }

    /// Observe pairing progress
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn is_ready_to_pair(&self) -> bool {
        self.state() == SessionState::ReadyToPair
    }

    pub fn is_paired(&self) -> bool {
        self.state() == SessionState::Paired
    }

    pub fn owner_id(&self) -> Option<String> {
        let doc = self.document();
        if SessionState::derive(&doc) != SessionState::Paired {
            return None;
        }
        doc.get_non_empty(fields::OWNER_ID).map(str::to_string)
    }

    /// Rejection reported by the service for the last pairing request
    pub fn error(&self) -> Option<SyncpointError> {
        let doc = self.document();
        if SessionState::derive(&doc) != SessionState::Error {
            return None;
        }
        let message = doc
            .get_non_empty(fields::ERROR)
            .unwrap_or("pairing rejected")
            .to_string();
        Some(SyncpointError::PairingRejected(message))
    }

    /// Remote control database assigned by the service
    pub fn control_database(&self) -> Option<String> {
        self.document()
            .get_non_empty(fields::CONTROL_DATABASE)
            .map(str::to_string)
    }

    /// Fields of the pairing request
    pub fn pairing_user_properties(&self) -> Map<String, Value> {
        let doc = self.document();
        [fields::PAIRING_TYPE, fields::PAIRING_TOKEN, fields::PAIRING_APP_ID]
            .into_iter()
            .filter_map(|field| doc.get(field).map(|value| (field.to_string(), value.clone())))
            .collect()
    }

    /// Request pairing with the service. The outcome arrives asynchronously;
    /// observe it through [`Session::watch_state`]. A new request supersedes
    /// one still in flight.
    pub fn pair(&self, pairing_type: &str, token: &str) -> SyncpointResult<()> {
        if self.is_paired() {
            info!("Session {} is already paired", self.id());
            return Ok(());
        }

        let app_id = self.inner.config.app_id.clone();
        self.update_document(&self.inner.id.clone(), |doc| {
            doc.set(fields::PAIRING_TYPE, pairing_type);
            doc.set(fields::PAIRING_TOKEN, token);
            doc.set(fields::PAIRING_APP_ID, app_id.as_str());
            doc.set(fields::STATE, STATE_NEW);
            true
        })?;
        info!("Requested pairing of session {} with type '{}'", self.id(), pairing_type);

        // Restart the handshake so it presents the new token
        self.stop_handshake();
        self.reconcile_pairing()
    }

    pub fn channel(&self, id: &str) -> Option<Channel> {
        self.model(id)
    }

    pub fn subscription(&self, id: &str) -> Option<Subscription> {
        self.model(id)
    }

    pub fn installation(&self, id: &str) -> Option<Installation> {
        self.model(id)
    }

    fn model<T: Model>(&self, id: &str) -> Option<T> {
        self.inner
            .repository
            .get(id)
            .filter(|doc| doc.doc_type() == Some(T::DOC_TYPE))
            .map(|doc| T::from_document(self, doc))
    }

    /// Channel with this name among those known locally; the lowest id wins
    /// when several share it.
    pub fn channel_named(&self, name: &str) -> Option<Channel> {
        let name = name.to_string();
        ModelQuery::new(self, move |channel: &Channel| channel.name() == Some(name.as_str())).first()
    }

    /// Like [`Session::channel_named`], restricted to [`Session::my_channels`]
    pub fn my_channel_named(&self, name: &str) -> Option<Channel> {
        let name = name.to_string();
        ModelQuery::new(self, move |channel: &Channel| {
            channel.name() == Some(name.as_str()) && channel.is_mine()
        })
        .first()
    }

    /// Create a channel owned by the local identity
    pub fn make_channel(&self, name: &str) -> SyncpointResult<Channel> {
        let owner_id = self.owner_id().ok_or(SyncpointError::NotPaired)?;
        let doc = self.create_document(json!({
            fields::TYPE: super::channel::DOC_TYPE,
            fields::STATE: super::channel::STATE_NEW,
            fields::NAME: name,
            fields::OWNER_ID: owner_id,
        }))?;
        info!("Created channel '{}' ({})", name, doc.id);
        Ok(Channel::from_document(self, doc))
    }

    pub fn ready_channels(&self) -> ModelQuery<Channel> {
        ModelQuery::new(self, Channel::is_ready)
    }

    pub fn unpaired_channels(&self) -> ModelQuery<Channel> {
        ModelQuery::new(self, Channel::is_unpaired)
    }

    /// Channels the local identity created or subscribed to
    pub fn my_channels(&self) -> ModelQuery<Channel> {
        ModelQuery::new(self, Channel::is_mine)
    }

    /// Active subscriptions of the local identity whose channel is ready
    pub fn active_subscriptions(&self) -> ModelQuery<Subscription> {
        ModelQuery::new(self, |subscription: &Subscription| {
            subscription.is_active()
                && subscription.is_mine()
                && subscription.channel().map(|c| c.is_ready()).unwrap_or(false)
        })
    }

    /// Subscriptions installed on this device
    pub fn installed_subscriptions(&self) -> ModelQuery<Subscription> {
        ModelQuery::new(self, |subscription: &Subscription| subscription.installation().is_some())
    }

    /// Installations of every device, as replicated locally
    pub fn all_installations(&self) -> ModelQuery<Installation> {
        ModelQuery::new(self, |_: &Installation| true)
    }

    /// The local replica of the control database
    pub fn database(&self) -> &Database {
        &self.inner.database
    }

    pub fn server(&self) -> &LocalServer {
        &self.inner.server
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn remote_url(&self) -> &Url {
        &self.inner.remote_url
    }

    pub fn handshake_status(&self) -> Option<ReplicationStatus> {
        self.inner.handshake.lock().as_ref().map(ReplicationHandle::status)
    }

    pub fn control_status(&self) -> Option<ReplicationStatus> {
        self.inner.control.lock().as_ref().map(ReplicationHandle::status)
    }

    /// Notified after every control-database change has been applied
    pub fn changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.changes.subscribe()
    }

    pub(crate) fn repository(&self) -> &Repository {
        &self.inner.repository
    }

    /// Apply a control-database change and re-derive everything it touches.
    /// Safe to call with duplicate or stale events.
    pub fn handle_change(&self, event: &ChangeEvent) {
        if event.database != self.inner.database.name {
            return;
        }
        self.inner.repository.apply(&event.document);

        // Dispatch on the indexed revision, which may be newer than the event
        if let Some(doc) = self.inner.repository.get_any(&event.id) {
            let result = self.dispatch(doc);
            if let Err(e) = result {
                error!("Failed to reconcile '{}': {}", event.id, e);
            }
        }

        let _ = self.inner.changes.send(event.clone());
    }

    fn dispatch(&self, doc: Document) -> SyncpointResult<()> {
        match doc.doc_type() {
            Some(DOC_TYPE) if doc.id == self.inner.id => self.reconcile_pairing(),
            Some(super::channel::DOC_TYPE) => Channel::from_document(self, doc).did_change(),
            Some(super::subscription::DOC_TYPE) => Subscription::from_document(self, doc).did_change(),
            Some(super::installation::DOC_TYPE) => Installation::from_document(self, doc).did_change(),
            _ => Ok(()),
        }
    }

    /// Re-derive the state of every known model
    pub fn reconcile(&self) {
        if let Err(e) = self.reconcile_pairing() {
            error!("Failed to reconcile session {}: {}", self.id(), e);
        }
        for doc_type in [
            super::channel::DOC_TYPE,
            super::subscription::DOC_TYPE,
            super::installation::DOC_TYPE,
        ] {
            for doc in self.inner.repository.of_type(doc_type) {
                let id = doc.id.clone();
                let result = match doc_type {
                    super::channel::DOC_TYPE => Channel::from_document(self, doc).did_load(),
                    super::subscription::DOC_TYPE => Subscription::from_document(self, doc).did_load(),
                    _ => Installation::from_document(self, doc).did_load(),
                };
                if let Err(e) = result {
                    error!("Failed to reconcile '{}': {}", id, e);
                }
            }
        }
    }

    /// Reload the index from the store and reconcile; used after missed
    /// change notifications.
    pub fn resync(&self) -> SyncpointResult<()> {
        warn!("Resynchronising session {} from the local store", self.id());
        let docs = self.inner.database.all_documents()?;
        for doc in &docs {
            self.inner.repository.apply(doc);
        }
        self.reconcile();
        Ok(())
    }

    fn reconcile_pairing(&self) -> SyncpointResult<()> {
        let state = self.state();
        self.inner.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            info!("Session {} state {:?} -> {:?}", self.inner.id, current, state);
            *current = state;
            true
        });

        match state {
            SessionState::Pairing | SessionState::Error => self.start_handshake(),
            SessionState::Paired => {
                self.stop_handshake();
                self.run_pending_installs();
                match self.control_database() {
                    Some(control) => self.start_control(&control),
                    None => {
                        debug!("Session {} paired without a control database yet", self.id());
                        Ok(())
                    }
                }
            }
            SessionState::Unpaired | SessionState::ReadyToPair => Ok(()),
        }
    }

    /// Retry queued installs; channels may have become ready before pairing
    fn run_pending_installs(&self) {
        let pending: Vec<String> = self.inner.pending_installs.iter().map(|id| id.clone()).collect();
        for id in pending {
            let Some(channel) = self.channel(&id) else {
                continue;
            };
            if let Err(e) = channel.run_pending_install() {
                error!("Failed to install channel '{}': {}", id, e);
            }
        }
    }

    fn start_handshake(&self) -> SyncpointResult<()> {
        let mut handshake = self.inner.handshake.lock();
        if handshake.as_ref().map(ReplicationHandle::is_running).unwrap_or(false) {
            return Ok(());
        }

        let remote = self.inner.remote_url.join(&self.inner.config.handshake_database).map_err(StoreError::from)?;
        let token = self.document().get_str(fields::PAIRING_TOKEN).unwrap_or_default().to_string();
        let request = ReplicationRequest::new(self.inner.database.clone(), remote)
            .with_doc_ids(vec![self.inner.id.clone()])
            .with_credentials(Credentials {
                user: self.inner.id.clone(),
                secret: token,
            })
            .with_retry_interval(self.inner.config.retry_interval());
        *handshake = Some(self.inner.replicator.replicate(request)?);
        info!("Started pairing handshake for session {}", self.id());
        Ok(())
    }

    fn stop_handshake(&self) {
        if let Some(handle) = self.inner.handshake.lock().take() {
            handle.stop();
            info!("Stopped pairing handshake for session {}", self.id());
        }
    }

    fn start_control(&self, control: &str) -> SyncpointResult<()> {
        let mut slot = self.inner.control.lock();
        if slot.as_ref().map(ReplicationHandle::is_running).unwrap_or(false) {
            return Ok(());
        }

        let remote = self.inner.remote_url.join(control).map_err(StoreError::from)?;
        let credentials = self.credentials().ok_or(SyncpointError::NotPaired)?;
        let request = ReplicationRequest::new(self.inner.database.clone(), remote)
            .with_credentials(credentials)
            .with_retry_interval(self.inner.config.retry_interval());
        *slot = Some(self.inner.replicator.replicate(request)?);
        info!("Started control replication with '{}'", control);
        Ok(())
    }

    /// Credentials of the paired identity
    pub(crate) fn credentials(&self) -> Option<Credentials> {
        let owner_id = self.owner_id()?;
        let secret = self
            .document()
            .get_str(fields::PAIRING_TOKEN)
            .unwrap_or_default()
            .to_string();
        Some(Credentials { user: owner_id, secret })
    }

    /// Start an installation's replication unless one is already running
    pub(crate) fn start_replication(&self, installation_id: &str, request: ReplicationRequest) -> SyncpointResult<()> {
        use dashmap::mapref::entry::Entry;

        match self.inner.installs.entry(installation_id.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_running() {
                    return Ok(());
                }
                entry.insert(self.inner.replicator.replicate(request)?);
            }
            Entry::Vacant(entry) => {
                entry.insert(self.inner.replicator.replicate(request)?);
            }
        }
        info!("Installation {} is syncing", installation_id);
        Ok(())
    }

    /// Stop an installation's replication, keeping its handle for status
    pub(crate) fn stop_replication(&self, installation_id: &str) {
        if let Some(handle) = self.inner.installs.get(installation_id) {
            if handle.is_running() {
                handle.stop();
                info!("Installation {} stopped", installation_id);
            }
        }
    }

    /// Stop an installation's replication and forget it
    pub(crate) fn release_replication(&self, installation_id: &str) {
        if let Some((_, handle)) = self.inner.installs.remove(installation_id) {
            handle.stop();
            debug!("Released replication of installation {}", installation_id);
        }
    }

    /// `Some(running)` if the installation was started on this session
    pub(crate) fn replication_running(&self, installation_id: &str) -> Option<bool> {
        self.inner.installs.get(installation_id).map(|handle| handle.is_running())
    }

    pub(crate) fn replication_status(&self, installation_id: &str) -> Option<ReplicationStatus> {
        self.inner.installs.get(installation_id).map(|handle| handle.status())
    }

    /// Serializes installation of one channel within this process
    pub(crate) fn channel_lock(&self, channel_id: &str) -> Arc<Mutex<()>> {
        self.inner
            .channel_locks
            .entry(channel_id.to_string())
            .or_default()
            .clone()
    }

    pub(crate) fn add_pending_install(&self, channel_id: &str) {
        if self.inner.pending_installs.insert(channel_id.to_string()) {
            debug!("Channel {} will be installed once ready", channel_id);
        }
    }

    pub(crate) fn take_pending_install(&self, channel_id: &str) -> bool {
        self.inner.pending_installs.remove(channel_id).is_some()
    }

    pub(crate) fn is_pending_install(&self, channel_id: &str) -> bool {
        self.inner.pending_installs.contains(channel_id)
    }

    /// Write a new document to the control database
    pub(crate) fn create_document(&self, data: Value) -> SyncpointResult<Document> {
        let saved = self.inner.database.save(&Document::new(data))?;
        self.inner.repository.apply(&saved);
        Ok(saved)
    }

    /// Read-modify-write of a control document, retried when a replicated
    /// revision lands in between. `change` returns false to skip the write.
    pub(crate) fn update_document(
        &self,
        id: &str,
        mut change: impl FnMut(&mut Document) -> bool,
    ) -> SyncpointResult<Document> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut doc = self
                .inner
                .database
                .get(id)?
                .ok_or_else(|| StoreError::DocumentNotFound(id.to_string()))?;
            if !change(&mut doc) {
                self.inner.repository.apply(&doc);
                return Ok(doc);
            }
            match self.inner.database.save(&doc) {
                Ok(saved) => {
                    self.inner.repository.apply(&saved);
                    return Ok(saved);
                }
                Err(StoreError::Conflict(_)) if attempt < MAX_WRITE_ATTEMPTS => {
                    debug!("Conflict updating '{}', retrying", id);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Stop every replication owned by this session
    pub fn stop_all(&self) {
        self.stop_handshake();
        if let Some(handle) = self.inner.control.lock().take() {
            handle.stop();
        }
        self.inner.installs.iter().for_each(|handle| handle.stop());
        self.inner.installs.clear();
        info!("Stopped all replications of session {}", self.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::LoopbackReplicator;

    fn session_doc(data: Value) -> Document {
        Document::with_id("s", data)
    }

    fn open_session() -> Session {
        let server = LocalServer::open_in_memory().unwrap();
        let config = ClientConfig::new("http://syncpoint.test/", "notes");
        Session::open(server, config, Arc::new(LoopbackReplicator::new())).unwrap()
    }

    #[test]
    fn test_derive_state() {
        assert_eq!(SessionState::derive(&session_doc(json!({}))), SessionState::Unpaired);
        assert_eq!(
            SessionState::derive(&session_doc(json!({"state": "new"}))),
            SessionState::ReadyToPair
        );
        assert_eq!(
            SessionState::derive(&session_doc(json!({"state": "new", "pairing_token": "t"}))),
            SessionState::Pairing
        );
        assert_eq!(
            SessionState::derive(&session_doc(json!({"state": "error", "pairing_token": "t"}))),
            SessionState::Error
        );
        assert_eq!(
            SessionState::derive(&session_doc(json!({"state": "new", "error": "bad token"}))),
            SessionState::Error
        );
        // Paired needs an owner
        assert_eq!(
            SessionState::derive(&session_doc(json!({"state": "paired", "pairing_token": "t"}))),
            SessionState::Pairing
        );
        // A successful pairing clears an earlier error
        assert_eq!(
            SessionState::derive(&session_doc(
                json!({"state": "paired", "owner_id": "u1", "error": "bad token"})
            )),
            SessionState::Paired
        );
    }

    #[test]
    fn test_open_creates_one_session() {
        let server = LocalServer::open_in_memory().unwrap();
        let config = ClientConfig::new("http://syncpoint.test/", "notes");
        let replicator: Arc<dyn Replicator> = Arc::new(LoopbackReplicator::new());

        let first = Session::open(server.clone(), config.clone(), replicator.clone()).unwrap();
        assert_eq!(first.state(), SessionState::ReadyToPair);
        assert!(first.owner_id().is_none());
        assert!(first.error().is_none());

        let second = Session::open(server.clone(), config, replicator).unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(server.database("sp_control").unwrap().documents_of_type("session").unwrap().len(), 1);
    }

    #[test]
    fn test_unpaired_session_cannot_make_channels() {
        let session = open_session();
        assert!(matches!(session.make_channel("inbox"), Err(SyncpointError::NotPaired)));
        assert!(session.channel_named("inbox").is_none());
        assert_eq!(session.my_channels().count(), 0);
    }

    #[tokio::test]
    async fn test_pair_writes_request() {
        let session = open_session();
        let mut states = session.watch_state();

        session.pair("console", "anything").unwrap();

        assert_eq!(session.state(), SessionState::Pairing);
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), SessionState::Pairing);

        let properties = session.pairing_user_properties();
        assert_eq!(properties["pairing_type"], "console");
        assert_eq!(properties["pairing_token"], "anything");
        assert_eq!(properties["pairing_app_id"], "notes");

        // Nothing serves the remote, so the handshake keeps retrying
        assert!(session.handshake_status().is_some());
        session.stop_all();
        assert!(session.handshake_status().is_none());
    }

    #[test]
    fn test_update_document_skips_unchanged() {
        let session = open_session();
        let before = session.document();
        let after = session.update_document(session.id(), |_| false).unwrap();
        assert_eq!(before.rev, after.rev);

        let missing = session.update_document("nope", |_| true);
        assert!(matches!(
            missing.unwrap_err().store_cause(),
            Some(StoreError::DocumentNotFound(_))
        ));
    }
}
