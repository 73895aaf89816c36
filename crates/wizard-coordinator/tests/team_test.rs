// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Team server and client tests.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{Notify, mpsc};

use common::wait_until;
use wizard_coordinator::team::{
    TeamClient, TeamRegistry, TeamServer, TeamServerConfig, refresh_team, try_connection,
};
use wizard_protocol::Endpoint;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct TestServer {
    endpoint: Endpoint,
    registry: TeamRegistry,
    shutdown: Arc<Notify>,
}

impl TestServer {
    async fn start(secret: Option<&str>) -> Self {
        let config = TeamServerConfig::new(0).with_secret(secret.map(String::from));
        let server = TeamServer::bind(config).await.unwrap();
        let endpoint = Endpoint::localhost(server.local_addr().port());
        let registry = server.registry();
        let shutdown = Arc::new(Notify::new());
        tokio::spawn(server.run(shutdown.clone()));
        Self {
            endpoint,
            registry,
            shutdown,
        }
    }

    async fn connect(&self, user: &str, project: &str) -> (TeamClient, mpsc::UnboundedReceiver<Value>) {
        TeamClient::connect(self.endpoint.clone(), user, project, None)
            .await
            .unwrap()
    }

    async fn wait_for_users(&self, project: &str, expected: &[&str]) -> bool {
        let registry = &self.registry;
        wait_until(RECV_TIMEOUT, || async move {
            registry.users(project).await == expected
        })
        .await
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.notify_one();
    }
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
    tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for a team message")
        .expect("team connection closed")
}

async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<Value>) {
    let got = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(got.is_err(), "unexpected team message: {got:?}");
}

// ============================================================================
// Presence
// ============================================================================

#[tokio::test]
async fn test_presence_is_announced_both_ways() {
    let server = TestServer::start(None).await;
    let (_lea, mut lea_rx) = server.connect("lea", "forest").await;
    assert!(server.wait_for_users("forest", &["lea"]).await);

    let (max, mut max_rx) = server.connect("max", "forest").await;

    assert_eq!(
        next(&mut lea_rx).await,
        json!({"type": "new_user", "user_name": "max", "project": "forest"})
    );
    assert_eq!(
        next(&mut max_rx).await,
        json!({"type": "new_user", "user_name": "lea", "project": "forest"})
    );
    assert!(server.wait_for_users("forest", &["lea", "max"]).await);

    max.stop();
    assert_eq!(
        next(&mut lea_rx).await,
        json!({"type": "remove_user", "user_name": "max", "project": "forest"})
    );
    assert!(server.wait_for_users("forest", &["lea"]).await);
}

#[tokio::test]
async fn test_presence_stays_within_project() {
    let server = TestServer::start(None).await;
    let (_lea, mut lea_rx) = server.connect("lea", "forest").await;
    assert!(server.wait_for_users("forest", &["lea"]).await);

    let (_tom, mut tom_rx) = server.connect("tom", "desert").await;
    assert!(server.wait_for_users("desert", &["tom"]).await);

    assert_silent(&mut lea_rx).await;
    assert_silent(&mut tom_rx).await;
}

#[tokio::test]
async fn test_duplicate_user_is_rejected() {
    let server = TestServer::start(None).await;
    let (_lea, _lea_rx) = server.connect("lea", "forest").await;
    assert!(server.wait_for_users("forest", &["lea"]).await);

    let (_again, mut again_rx) = server.connect("lea", "forest").await;
    let closed = tokio::time::timeout(RECV_TIMEOUT, again_rx.recv())
        .await
        .expect("duplicate connection was not closed");
    assert_eq!(closed, None);
    assert_eq!(server.registry.users("forest").await, vec!["lea"]);
}

#[tokio::test]
async fn test_wrong_secret_is_rejected() {
    let server = TestServer::start(Some("s3cret")).await;

    let (_intruder, mut intruder_rx) =
        TeamClient::connect(server.endpoint.clone(), "eve", "forest", Some("guess"))
            .await
            .unwrap();
    let closed = tokio::time::timeout(RECV_TIMEOUT, intruder_rx.recv())
        .await
        .expect("rejected connection was not closed");
    assert_eq!(closed, None);

    let (_lea, _lea_rx) =
        TeamClient::connect(server.endpoint.clone(), "lea", "forest", Some("s3cret"))
            .await
            .unwrap();
    assert!(server.wait_for_users("forest", &["lea"]).await);
}

// ============================================================================
// Refresh and pranks
// ============================================================================

#[tokio::test]
async fn test_refresh_reaches_project_members() {
    let server = TestServer::start(None).await;
    let (lea, mut lea_rx) = server.connect("lea", "forest").await;
    let (_max, mut max_rx) = server.connect("max", "forest").await;
    let (_tom, mut tom_rx) = server.connect("tom", "desert").await;
    assert!(server.wait_for_users("forest", &["lea", "max"]).await);
    assert!(server.wait_for_users("desert", &["tom"]).await);
    // Drain presence.
    next(&mut lea_rx).await;
    next(&mut max_rx).await;

    assert!(lea.refresh_team().await);
    assert_eq!(
        next(&mut max_rx).await,
        json!({"type": "refresh_team", "project": "forest"})
    );
    assert_silent(&mut lea_rx).await;
    assert_silent(&mut tom_rx).await;

    // A one-shot refresh has no sender to skip.
    assert!(refresh_team(&server.endpoint, "desert").await);
    assert_eq!(
        next(&mut tom_rx).await,
        json!({"type": "refresh_team", "project": "desert"})
    );
}

#[tokio::test]
async fn test_prank_is_routed_to_one_user() {
    let server = TestServer::start(None).await;
    let (lea, mut lea_rx) = server.connect("lea", "forest").await;
    let (_max, mut max_rx) = server.connect("max", "forest").await;
    assert!(server.wait_for_users("forest", &["lea", "max"]).await);
    next(&mut lea_rx).await;
    next(&mut max_rx).await;

    let delivered = lea.send_prank("max", json!({"message": "boo"})).await;
    assert_eq!(delivered, Some(true));

    let prank = next(&mut max_rx).await;
    assert_eq!(prank["type"], "prank");
    assert_eq!(prank["prank_data"]["message"], "boo");
    assert_eq!(prank["prank_data"]["origin_user"], "lea");
    assert_eq!(prank["prank_data"]["destination_user"], "max");
    assert_silent(&mut lea_rx).await;

    assert_eq!(lea.send_prank("ghost", json!("hi")).await, Some(false));
}

#[tokio::test]
async fn test_refresh_after_stop_reports_failure() {
    let server = TestServer::start(None).await;
    let (lea, _lea_rx) = server.connect("lea", "forest").await;
    assert!(server.wait_for_users("forest", &["lea"]).await);

    lea.stop();
    let client = &lea;
    assert!(wait_until(RECV_TIMEOUT, || async move { client.is_finished() }).await);
    assert!(!lea.refresh_team().await);
}

#[tokio::test]
async fn test_try_connection() {
    let server = TestServer::start(None).await;
    assert!(try_connection(&server.endpoint).await);

    let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = closed.local_addr().unwrap().port();
    drop(closed);
    assert!(!try_connection(&Endpoint::localhost(port)).await);
    assert!(!refresh_team(&Endpoint::localhost(port), "forest").await);
}
