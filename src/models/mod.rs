//! Session-related model objects
//!
//! Each model is a snapshot of one control-database document plus a handle to
//! the [`Session`] that resolves its relations. Lifecycle state is never
//! stored on the model itself; it is derived from document fields every time
//! it is asked for, so local writes and remote updates converge through the
//! same path.

pub mod channel;
pub mod installation;
pub mod repository;
pub mod session;
pub mod subscription;

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::SyncpointResult;
use crate::storage::{ChangeEvent, Document};

pub use channel::{Channel, ChannelState};
pub use installation::{Installation, InstallationState};
pub use repository::Repository;
pub use session::{Session, SessionState};
pub use subscription::{Subscription, SubscriptionState};

/// Common behaviour of session, channel, subscription and installation models
pub trait Model: Sized {
    /// Value of the document's `type` field
    const DOC_TYPE: &'static str;

    fn from_document(session: &Session, doc: Document) -> Self;

    fn document(&self) -> &Document;

    /// Has this object been registered with the server?
    fn is_active(&self) -> bool;

    fn id(&self) -> &str {
        &self.document().id
    }

    fn revision(&self) -> Option<&str> {
        self.document().revision()
    }

    /// Raw `state` field
    fn state_field(&self) -> Option<&str> {
        self.document().get_str(fields::STATE)
    }

    fn owner_id(&self) -> Option<&str> {
        self.document().get_non_empty(fields::OWNER_ID)
    }

    /// Invoked once for every model found when the session loads
    fn did_load(&self) -> SyncpointResult<()> {
        self.did_change()
    }

    /// Invoked whenever the model's document changes, locally or remotely.
    /// Must be idempotent.
    fn did_change(&self) -> SyncpointResult<()> {
        Ok(())
    }
}

/// Document field names shared with the remote service
pub mod fields {
    pub const TYPE: &str = "type";
    pub const STATE: &str = "state";
    pub const OWNER_ID: &str = "owner_id";
    pub const ERROR: &str = "error";
    pub const PAIRING_TYPE: &str = "pairing_type";
    pub const PAIRING_TOKEN: &str = "pairing_token";
    pub const PAIRING_APP_ID: &str = "pairing_app_id";
    pub const CONTROL_DATABASE: &str = "control_database";
    pub const NAME: &str = "name";
    pub const CLOUD_DATABASE: &str = "cloud_database";
    pub const CHANNEL_ID: &str = "channel_id";
    pub const SUBSCRIPTION_ID: &str = "subscription_id";
    pub const SESSION_ID: &str = "session_id";
    pub const LOCAL_DB_NAME: &str = "local_db_name";
}

type Filter<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Restartable enumeration over the models of one kind. Every call to
/// [`ModelQuery::iter`] re-reads the current index, so results follow remote
/// updates.
pub struct ModelQuery<T: Model> {
    session: Session,
    filter: Filter<T>,
}

impl<T: Model> Clone for ModelQuery<T> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            filter: self.filter.clone(),
        }
    }
}

impl<T: Model> ModelQuery<T> {
    pub(crate) fn new(session: &Session, filter: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        Self {
            session: session.clone(),
            filter: Arc::new(filter),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        self.session
            .repository()
            .of_type(T::DOC_TYPE)
            .into_iter()
            .map(move |doc| T::from_document(&self.session, doc))
            .filter(move |model| (self.filter)(model))
    }

    pub fn first(&self) -> Option<T> {
        self.iter().next()
    }

    pub fn count(&self) -> usize {
        self.iter().count()
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.iter().collect()
    }

    /// Notified after the session applies any control-database change; re-run
    /// the query when it fires.
    pub fn changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.session.changes()
    }
}
