use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use postman_core::db::memory_pool;
use postman_core::ipc::{PostmanRequest, PostmanResponse};
use postman_core::QueueStore;
use postman_server::router::{self, ControlState};
use postman_server::server;
use postman_server::subsystems::orchestrator::{Orchestrator, OrchestratorConfig};
use postman_server::subsystems::poll::SessionDefaults;
use postman_server::subsystems::terminal::{TerminalError, TerminalRunner};
use tokio::net::UnixStream;
use tokio::sync::broadcast;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

#[derive(Default)]
struct StubRunner {
    live: Mutex<HashSet<String>>,
}

#[async_trait]
impl TerminalRunner for StubRunner {
    async fn new_session(&self, name: &str, _dir: &str) -> Result<(), TerminalError> {
        self.live.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    async fn send_keys(&self, _name: &str, _text: &str) -> Result<(), TerminalError> {
        Ok(())
    }

    async fn capture_pane(&self, _name: &str, _max_lines: u32) -> Result<String, TerminalError> {
        Ok(String::new())
    }

    async fn kill_session(&self, name: &str) -> Result<(), TerminalError> {
        self.live.lock().unwrap().remove(name);
        Ok(())
    }

    async fn has_session(&self, name: &str) -> bool {
        self.live.lock().unwrap().contains(name)
    }
}

async fn state(dir: &std::path::Path) -> ControlState {
    let store = QueueStore::new(memory_pool().await.unwrap());
    let orchestrator = Orchestrator::new(
        store,
        Arc::new(StubRunner::default()),
        OrchestratorConfig {
            fifo_dir: dir.to_path_buf(),
            agent_command: "claude".to_string(),
            capture_lines: 100,
            settle_delay: Duration::ZERO,
            reattach_live_listeners: false,
            subject_tag: "[claude-postman]".to_string(),
        },
    );
    ControlState {
        orchestrator,
        defaults: SessionDefaults {
            model: "sonnet".to_string(),
            working_dir: "/srv/work".to_string(),
        },
    }
}

#[tokio::test]
async fn test_ping_and_health() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(dir.path()).await;

    let resp = router::handle_request(PostmanRequest::Ping, &state).await;
    assert!(resp.is_ok());
    assert_eq!(resp.data.unwrap()["pong"], true);

    let resp = router::handle_request(PostmanRequest::Health, &state).await;
    assert!(resp.is_ok(), "{:?}", resp.error);
    let data = resp.data.unwrap();
    assert_eq!(data["status"], "healthy");
    assert_eq!(data["schema_version"], 1);
    assert_eq!(data["live_sessions"], 0);
}

#[tokio::test]
async fn test_session_commands() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(dir.path()).await;

    let resp = router::handle_request(
        PostmanRequest::CreateSession {
            working_dir: None,
            model: None,
            prompt: "  ".into(),
        },
        &state,
    )
    .await;
    assert!(!resp.is_ok());

    let resp = router::handle_request(
        PostmanRequest::CreateSession {
            working_dir: None,
            model: None,
            prompt: "summarise the README".into(),
        },
        &state,
    )
    .await;
    assert!(resp.is_ok(), "{:?}", resp.error);
    let id = resp.data.unwrap()["id"].as_str().unwrap().to_string();

    let resp = router::handle_request(PostmanRequest::GetSession { id: id.clone() }, &state).await;
    let data = resp.data.unwrap();
    assert_eq!(data["session"]["status"], "active");
    assert_eq!(data["session"]["working_dir"], "/srv/work");
    assert_eq!(data["session"]["model"], "sonnet");

    let resp = router::handle_request(PostmanRequest::ListSessions, &state).await;
    assert_eq!(resp.data.unwrap()["count"], 1);

    // Active sessions do not take deliveries.
    let resp = router::handle_request(PostmanRequest::DeliverNext { id: id.clone() }, &state).await;
    assert!(!resp.is_ok());
    assert!(resp.error.unwrap().contains("not idle"));

    let resp = router::handle_request(PostmanRequest::EndSession { id: id.clone() }, &state).await;
    assert!(resp.is_ok());
    let resp = router::handle_request(PostmanRequest::EndSession { id: id.clone() }, &state).await;
    assert!(resp.error.unwrap().contains("already ended"));

    let resp = router::handle_request(
        PostmanRequest::GetSession {
            id: "00000000-0000-0000-0000-000000000000".into(),
        },
        &state,
    )
    .await;
    assert!(resp.error.unwrap().contains("not found"));
}

#[tokio::test]
async fn test_get_session_reports_inbox_failure() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(dir.path()).await;
    let store = state.orchestrator.store().clone();
    let session = postman_core::Session::new("/w", "sonnet", "p");
    store.create_session(&session).await.unwrap();

    sqlx::query("DROP TABLE inbox").execute(store.pool()).await.unwrap();

    let resp = router::handle_request(PostmanRequest::GetSession { id: session.id.clone() }, &state).await;
    assert!(!resp.is_ok());
    assert!(resp.data.is_none());
    assert!(resp.error.unwrap().contains("store error"));
}

#[tokio::test]
async fn test_socket_round_trip_and_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("run").join("control.sock");
    let socket_str = socket.to_str().unwrap().to_string();
    let state = state(dir.path()).await;

    let (tx, rx) = broadcast::channel(1);
    let server = tokio::spawn(async move { server::run_unix_server(&socket_str, state, rx).await });

    let mut stream = None;
    for _ in 0..100 {
        if let Ok(s) = UnixStream::connect(&socket).await {
            stream = Some(s);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let codec = LengthDelimitedCodec::builder().little_endian().new_codec();
    let mut framed = Framed::new(stream.expect("server never bound"), codec);

    let req = rmp_serde::to_vec_named(&PostmanRequest::Ping).unwrap();
    framed.send(Bytes::from(req)).await.unwrap();
    let frame = framed.next().await.unwrap().unwrap();
    let resp: PostmanResponse = rmp_serde::from_slice(&frame).unwrap();
    assert!(resp.is_ok());

    // Garbage gets an error frame, and the connection stays usable.
    framed.send(Bytes::from_static(b"\xc1")).await.unwrap();
    let frame = framed.next().await.unwrap().unwrap();
    let resp: PostmanResponse = rmp_serde::from_slice(&frame).unwrap();
    assert!(resp.error.unwrap().starts_with("Deserialization error"));

    tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(!socket.exists());
}
