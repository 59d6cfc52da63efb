pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod models;
pub mod replication;
pub mod storage;

pub use client::Client;
pub use config::ClientConfig;
pub use error::{StoreError, StoreResult, SyncpointError, SyncpointResult};
pub use models::{
    Channel, ChannelState, Installation, InstallationState, Model, ModelQuery, Session,
    SessionState, Subscription, SubscriptionState,
};
pub use replication::{
    Credentials, LoopbackReplicator, ReplicationHandle, ReplicationRequest, ReplicationState,
    ReplicationStatus, Replicator,
};
pub use storage::{ChangeEvent, Database, Document, LocalServer};
