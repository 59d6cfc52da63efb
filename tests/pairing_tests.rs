//! Pairing handshake tests
//!
//! Drives sessions against the in-process service in tests/common.

mod common;

use common::*;
use syncpoint::{Client, LocalServer, ReplicationState, SessionState, SyncpointError};
use std::sync::Arc;
use tempfile::TempDir;

#[tokio::test]
async fn test_console_pairing_assigns_owner() {
    let service = FakeService::start();
    let client = create_client(&service);
    let session = client.session();

    assert_eq!(session.state(), SessionState::ReadyToPair);
    assert!(session.is_ready_to_pair());
    assert!(session.owner_id().is_none());

    let mut states = session.watch_state();
    client.pair("console", "anything").unwrap();
    assert_eq!(session.state(), SessionState::Pairing);

    wait_until(|| session.is_paired()).await;
    assert_eq!(session.owner_id().as_deref(), Some("user-1"));
    assert!(session.error().is_none());
    assert_eq!(session.control_database().as_deref(), Some("control-user-1"));

    // The watch channel ends on the paired state
    states
        .wait_for(|state| *state == SessionState::Paired)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_paired_session_replicates_control_database() {
    let service = FakeService::start();
    let client = create_paired_client(&service, "anything").await;
    let session = client.session();

    // The handshake is over and the control replication took over
    wait_until(|| session.handshake_status().is_none()).await;
    wait_until(|| {
        session
            .control_status()
            .map(|status| status.state == ReplicationState::Idle)
            .unwrap_or(false)
    })
    .await;

    let control = service.database(&control_database(&client));
    wait_until(|| control.get(session.id()).unwrap().is_some()).await;
}

#[tokio::test]
async fn test_rejected_token_sets_error() {
    let service = FakeService::start();
    let client = create_client(&service);
    let session = client.session();

    client.pair("console", "reject-me").unwrap();
    wait_until(|| session.state() == SessionState::Error).await;

    assert!(session.owner_id().is_none());
    match session.error() {
        Some(SyncpointError::PairingRejected(message)) => {
            assert_eq!(message, "invalid pairing token")
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(matches!(session.make_channel("inbox"), Err(SyncpointError::NotPaired)));
}

#[tokio::test]
async fn test_error_cleared_by_successful_pairing() {
    let service = FakeService::start();
    let client = create_client(&service);
    let session = client.session();

    client.pair("console", "reject-me").unwrap();
    wait_until(|| session.state() == SessionState::Error).await;

    // A new request supersedes the rejected one
    client.pair("console", "valid").unwrap();
    assert_eq!(session.pairing_user_properties()["pairing_token"], "valid");
    wait_until(|| session.is_paired()).await;
    assert!(session.error().is_none());
    assert!(session.owner_id().is_some());
}

#[tokio::test]
async fn test_pair_when_paired_is_noop() {
    let service = FakeService::start();
    let client = create_paired_client(&service, "anything").await;
    let session = client.session();
    let before = session.document().rev;

    client.pair("console", "another").unwrap();

    assert_eq!(session.document().rev, before);
    assert_eq!(session.pairing_user_properties()["pairing_token"], "anything");
}

#[tokio::test]
async fn test_same_token_pairs_same_owner() {
    let service = FakeService::start();
    let first = create_paired_client(&service, "shared").await;
    let second = create_paired_client(&service, "shared").await;
    let other = create_paired_client(&service, "different").await;

    assert_ne!(first.session().id(), second.session().id());
    assert_eq!(first.session().owner_id(), second.session().owner_id());
    assert_ne!(first.session().owner_id(), other.session().owner_id());
}

#[tokio::test]
async fn test_pairing_is_observed_after_restart() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("syncpoint.db");
    let service = FakeService::start();

    let (session_id, owner_id) = {
        let server = LocalServer::open(&path).unwrap();
        let client =
            Client::with_server(server, test_config(), Arc::new(service.replicator.clone())).unwrap();
        client.pair("console", "anything").unwrap();
        wait_until(|| client.session().is_paired()).await;
        client.shutdown();
        (client.session().id().to_string(), client.session().owner_id())
    };

    let server = LocalServer::open(&path).unwrap();
    let client = Client::with_server(server, test_config(), Arc::new(service.replicator.clone())).unwrap();
    assert_eq!(client.session().id(), session_id);
    assert!(client.session().is_paired());
    assert_eq!(client.session().owner_id(), owner_id);

    // Control replication resumes without another handshake
    wait_until(|| client.session().control_status().is_some()).await;
    assert!(client.session().handshake_status().is_none());
}

#[tokio::test]
async fn test_unreachable_service_keeps_request() {
    // Nothing registered under the remote URL
    let server = LocalServer::open_in_memory().unwrap();
    let client = Client::with_server(
        server,
        test_config(),
        Arc::new(syncpoint::LoopbackReplicator::new()),
    )
    .unwrap();

    client.pair("console", "anything").unwrap();
    let session = client.session();
    wait_until(|| {
        session
            .handshake_status()
            .map(|status| status.state == ReplicationState::Offline)
            .unwrap_or(false)
    })
    .await;
    assert_eq!(session.state(), SessionState::Pairing);
}
