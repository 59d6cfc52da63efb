//! Common test utilities for client lifecycle tests
//!
//! Provides shared helper functions for:
//! - Running an in-process stand-in for the remote Syncpoint service
//! - Creating clients that replicate with it
//! - Waiting for asynchronous state transitions

#![allow(dead_code)]

use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use syncpoint::{Client, ClientConfig, Database, Document, LocalServer, LoopbackReplicator};
use tokio::task::JoinHandle;
use url::Url;

pub const REMOTE_URL: &str = "http://syncpoint.test/";
pub const HANDSHAKE_DB: &str = "sp_handshake";

/// Plays the server side of Syncpoint: answers pairing requests on the
/// handshake database and provisions new channels in control databases.
pub struct FakeService {
    pub server: LocalServer,
    pub replicator: LoopbackReplicator,
    auto_provision: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl FakeService {
    pub fn start() -> Self {
        let server = LocalServer::open_in_memory().expect("Failed to open service store");
        let replicator = LoopbackReplicator::new();
        replicator.register(&Url::parse(REMOTE_URL).unwrap(), server.clone());

        let auto_provision = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(serve(server.clone(), auto_provision.clone()));

        Self {
            server,
            replicator,
            auto_provision,
            task,
        }
    }

    /// Whether new channels are marked ready automatically
    pub fn set_auto_provision(&self, enabled: bool) {
        self.auto_provision.store(enabled, Ordering::SeqCst);
    }

    pub fn database(&self, name: &str) -> Database {
        self.server.create_database(name).unwrap()
    }

    /// Insert or replace a document in a remote database, as the service
    /// itself would
    pub fn write(&self, database: &str, id: &str, data: serde_json::Value) -> Document {
        let db = self.database(database);
        let mut doc = Document::with_id(id, data);
        for _ in 0..20 {
            doc.rev = db.get(id).unwrap().and_then(|d| d.rev);
            if let Ok(saved) = db.save(&doc) {
                return saved;
            }
        }
        panic!("could not write '{}' to '{}'", id, database);
    }

    /// Update fields of a remote document
    pub fn update(&self, database: &str, id: &str, change: impl Fn(&mut Document)) -> Document {
        let db = self.database(database);
        for _ in 0..20 {
            let mut doc = db.get(id).unwrap().expect("document to update");
            change(&mut doc);
            if let Ok(saved) = db.save(&doc) {
                return saved;
            }
        }
        panic!("could not update '{}' in '{}'", id, database);
    }

    /// Provision a channel: mark it ready and create its cloud database
    pub fn provision(&self, control: &str, channel_id: &str) -> String {
        let cloud = cloud_database_name(channel_id);
        self.database(&cloud);
        let cloud_name = cloud.clone();
        self.update(control, channel_id, move |doc| {
            doc.set("state", "ready");
            doc.set("cloud_database", cloud_name.as_str());
        });
        cloud
    }
}

impl Drop for FakeService {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn cloud_database_name(channel_id: &str) -> String {
    format!("db-{}", channel_id.to_lowercase())
}

async fn serve(server: LocalServer, auto_provision: Arc<AtomicBool>) {
    let mut owners: HashMap<String, String> = HashMap::new();
    loop {
        answer_pairing_requests(&server, &mut owners);
        if auto_provision.load(Ordering::SeqCst) {
            provision_channels(&server);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Tokens starting with "reject" are refused; any other token pairs, the
/// same token always mapping to the same owner.
fn answer_pairing_requests(server: &LocalServer, owners: &mut HashMap<String, String>) {
    let Ok(handshake) = server.create_database(HANDSHAKE_DB) else {
        return;
    };
    let Ok(sessions) = handshake.documents_of_type("session") else {
        return;
    };

    for mut doc in sessions {
        if doc.get_str("state") != Some("new") {
            continue;
        }
        let Some(token) = doc.get_non_empty("pairing_token").map(str::to_string) else {
            continue;
        };

        if token.starts_with("reject") {
            doc.set("state", "error");
            doc.set("error", "invalid pairing token");
        } else {
            let next = owners.len() + 1;
            let owner = owners
                .entry(token)
                .or_insert_with(|| format!("user-{}", next))
                .clone();
            let control = format!("control-{}", owner);
            let _ = server.create_database(&control);
            doc.set("state", "paired");
            doc.set("owner_id", owner.as_str());
            doc.set("control_database", control.as_str());
            doc.remove("error");
        }
        // A concurrent replicated write wins; the request is seen again next round
        let _ = handshake.save(&doc);
    }
}

fn provision_channels(server: &LocalServer) {
    let Ok(names) = server.list_databases() else {
        return;
    };
    for name in names.iter().filter(|name| name.starts_with("control-")) {
        let Ok(control) = server.database(name) else {
            continue;
        };
        let Ok(channels) = control.documents_of_type("channel") else {
            continue;
        };
        for mut doc in channels {
            if doc.get_str("state") != Some("new") || doc.get_non_empty("owner_id").is_none() {
                continue;
            }
            let cloud = cloud_database_name(&doc.id);
            if server.create_database(&cloud).is_err() {
                continue;
            }
            doc.set("state", "ready");
            doc.set("cloud_database", cloud.as_str());
            let _ = control.save(&doc);
        }
    }
}

pub fn test_config() -> ClientConfig {
    ClientConfig::new(REMOTE_URL, "notes").with_retry_interval(Duration::from_millis(20))
}

/// A client on a fresh in-memory store, replicating with `service`
pub fn create_client(service: &FakeService) -> Client {
    let server = LocalServer::open_in_memory().expect("Failed to open local store");
    Client::with_server(server, test_config(), Arc::new(service.replicator.clone()))
        .expect("Failed to start client")
}

/// A client paired under `token`
pub async fn create_paired_client(service: &FakeService, token: &str) -> Client {
    let client = create_client(service);
    client.pair("console", token).unwrap();
    wait_until(|| client.session().is_paired()).await;
    client
}

/// Poll `condition` until it holds, panicking after about five seconds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// The control database the service assigned to a paired client
pub fn control_database(client: &Client) -> String {
    client
        .session()
        .control_database()
        .expect("paired client has a control database")
}

pub fn channel_doc(name: &str, owner: &str, state: &str) -> serde_json::Value {
    json!({"type": "channel", "name": name, "owner_id": owner, "state": state})
}
