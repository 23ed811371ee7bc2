use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use kt_bridge::http_api::{api_router, ApiState};
use kt_core::cache::{ResourceCache, WatchEvent};
use kt_core::resolve::{LookupError, PodLookup, PodResolver};
use kt_core::types::{ContainerRef, ObjectKey, Pod};
use kt_session::logs::{LogError, LogOptions, LogSource, LogStream};
use kt_session::protocol::{Message as Frame, TerminalSize};
use kt_session::transport::{ExecError, ExecTransport, StreamIo};
use tokio_tungstenite::tungstenite::protocol::Message;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StaticPods {
    pods: HashMap<ObjectKey, Pod>,
}

#[async_trait]
impl PodLookup for StaticPods {
    async fn get_pod(&self, key: &ObjectKey) -> Result<Pod, LookupError> {
        self.pods
            .get(key)
            .cloned()
            .ok_or_else(|| LookupError::NotFound(key.clone()))
    }
}

/// `bash` is missing; `sh` echoes stdin back and records sizes.
#[derive(Default)]
struct EchoShell {
    attempts: Mutex<Vec<String>>,
    sizes: Mutex<Vec<TerminalSize>>,
}

#[async_trait]
impl ExecTransport for EchoShell {
    async fn stream(
        &self,
        _target: &ContainerRef,
        command: &[String],
        io: &StreamIo,
    ) -> Result<(), ExecError> {
        self.attempts.lock().unwrap().push(command[0].clone());
        if command[0] != "sh" {
            return Err(ExecError::start_failed(command, "executable file not found"));
        }
        let echo = async {
            loop {
                let outcome = io.stdin.read_stdin().await;
                if outcome.is_end() {
                    return Ok::<_, ExecError>(());
                }
                if !outcome.bytes().is_empty() {
                    io.stdout.write_stdout(outcome.bytes()).await?;
                }
            }
        };
        let sizes = async {
            while let Some(size) = io.sizes.next_size().await {
                self.sizes.lock().unwrap().push(size);
            }
            std::future::pending::<()>().await
        };
        tokio::select! {
            result = echo => result,
            _ = sizes => Ok(()),
        }
    }
}

struct CannedLogs;

#[async_trait]
impl LogSource for CannedLogs {
    async fn stream_logs(
        &self,
        target: &ContainerRef,
        options: &LogOptions,
    ) -> Result<LogStream, LogError> {
        if target.container == "sidecar" {
            return Err(LogError::Unsupported("no logs for sidecars".into()));
        }
        if target.pod == "fresh" {
            // "café" with the two bytes of 'é' in separate chunks.
            let chunks = vec![
                Ok(Bytes::from_static(b"caf\xc3")),
                Ok(Bytes::from_static(b"\xa9\n")),
            ];
            return Ok(futures_util::stream::iter(chunks).boxed());
        }
        let header = format!("tail={:?}\n", options.tail_lines);
        let chunks = vec![
            Ok(Bytes::from(header)),
            Ok(Bytes::from_static(b"line 1\n")),
            Ok(Bytes::from_static(b"line 2\n")),
        ];
        Ok(futures_util::stream::iter(chunks).boxed())
    }
}

struct TestServer {
    base: String,
    exec: Arc<EchoShell>,
    _static_dir: tempfile::TempDir,
}

/// Spin up the router on an ephemeral port.
///
/// `default/web` (containers `app`, `sidecar`) is in the cache; `default/fresh`
/// is only known to the authority.
async fn start_test_server() -> TestServer {
    let cache = ResourceCache::new();
    cache.apply(WatchEvent::Restarted(vec![Pod::with_containers(
        "default",
        "web",
        ["app", "sidecar"],
    )]));
    let mut authority = StaticPods::default();
    authority.pods.insert(
        ObjectKey::new("default", "fresh"),
        Pod::with_containers("default", "fresh", ["app"]),
    );

    let static_dir = tempfile::tempdir().unwrap();
    std::fs::write(static_dir.path().join("terminal.html"), "<title>terminal</title>").unwrap();
    std::fs::write(static_dir.path().join("logs.html"), "<title>logs</title>").unwrap();
    std::fs::write(static_dir.path().join("terminal.js"), "// js").unwrap();

    let exec = Arc::new(EchoShell::default());
    let state = Arc::new(ApiState {
        resolver: PodResolver::new(cache, Arc::new(authority)),
        exec: exec.clone(),
        logs: Arc::new(CannedLogs),
        shells: vec!["bash".into(), "sh".into()],
        static_dir: static_dir.path().to_path_buf(),
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind to ephemeral port");
    let addr = listener.local_addr().unwrap();
    let router = api_router(state);
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    TestServer {
        base: format!("http://{addr}"),
        exec,
        _static_dir: static_dir,
    }
}

fn ws_url(base: &str, path: &str) -> String {
    base.replace("http://", "ws://") + path
}

/// Next protocol frame; `None` on close or timeout.
async fn next_frame<S>(ws: &mut S) -> Option<Frame>
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match tokio::time::timeout(Duration::from_secs(3), ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return Frame::decode(&text).ok(),
            Ok(Some(Ok(Message::Close(_)))) | Ok(Some(Err(_))) | Ok(None) | Err(_) => return None,
            Ok(Some(Ok(_))) => continue,
        }
    }
}

// ===========================================================================
// Plain HTTP
// ===========================================================================

#[tokio::test]
async fn probes_return_ok() {
    let server = start_test_server().await;
    for path in ["/-/healthy", "/-/ready"] {
        let resp = reqwest::get(format!("{}{path}", server.base)).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert!(resp.headers().contains_key("x-request-id"));
        assert_eq!(resp.text().await.unwrap(), "ok");
    }
}

#[tokio::test]
async fn pages_and_static_assets_are_served() {
    let server = start_test_server().await;

    let page = reqwest::get(format!("{}/terminal?namespace=default&pod=web&container=app", server.base))
        .await
        .unwrap();
    assert_eq!(page.status(), 200);
    assert!(page.text().await.unwrap().contains("terminal"));

    let logs = reqwest::get(format!("{}/logs", server.base)).await.unwrap();
    assert!(logs.text().await.unwrap().contains("logs"));

    let asset = reqwest::get(format!("{}/static/terminal.js", server.base))
        .await
        .unwrap();
    assert_eq!(asset.status(), 200);

    let missing = reqwest::get(format!("{}/static/nope.js", server.base))
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
}

// ===========================================================================
// Terminal sessions
// ===========================================================================

#[tokio::test]
async fn webshell_echo_end_to_end() {
    let server = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(ws_url(&server.base, "/ws/default/web/app/webshell"))
        .await
        .expect("failed to connect");

    let resize = Frame::Resize { rows: 40, cols: 120 }.encode().unwrap();
    ws.send(Message::Text(resize.into())).await.unwrap();
    let stdin = Frame::Stdin { data: "echo hi\r".into() }.encode().unwrap();
    ws.send(Message::Text(stdin.into())).await.unwrap();

    let frame = next_frame(&mut ws).await.expect("expected stdout frame");
    assert_eq!(frame, Frame::Stdout { data: "echo hi\r".into() });

    ws.close(None).await.unwrap();
    // The server tears the session down once the client leaves.
    assert!(next_frame(&mut ws).await.is_none());

    assert_eq!(*server.exec.attempts.lock().unwrap(), vec!["bash", "sh"]);
    assert_eq!(*server.exec.sizes.lock().unwrap(), vec![TerminalSize::new(120, 40)]);
}

#[tokio::test]
async fn webshell_falls_back_to_authority_on_cache_miss() {
    let server = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(ws_url(&server.base, "/ws/default/fresh/app/webshell"))
        .await
        .unwrap();

    let stdin = Frame::Stdin { data: "x".into() }.encode().unwrap();
    ws.send(Message::Text(stdin.into())).await.unwrap();
    assert_eq!(next_frame(&mut ws).await, Some(Frame::Stdout { data: "x".into() }));
}

#[tokio::test]
async fn unknown_pod_gets_toast_then_close() {
    let server = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(ws_url(&server.base, "/ws/default/ghost/app/webshell"))
        .await
        .unwrap();

    match next_frame(&mut ws).await {
        Some(Frame::Toast { data }) => assert!(data.contains("default/ghost"), "{data}"),
        other => panic!("expected toast, got {other:?}"),
    }
    assert!(next_frame(&mut ws).await.is_none());
    assert!(server.exec.attempts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_container_lists_available_ones() {
    let server = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(ws_url(&server.base, "/ws/default/fresh/db/webshell"))
        .await
        .unwrap();

    match next_frame(&mut ws).await {
        Some(Frame::Toast { data }) => {
            assert!(data.contains("'db'"), "{data}");
            assert!(data.contains("app"), "{data}");
        }
        other => panic!("expected toast, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_frame_ends_session() {
    let server = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(ws_url(&server.base, "/ws/default/web/app/webshell"))
        .await
        .unwrap();

    ws.send(Message::Text("not json".into())).await.unwrap();
    assert!(next_frame(&mut ws).await.is_none());
}

// ===========================================================================
// Log streaming
// ===========================================================================

#[tokio::test]
async fn logs_arrive_as_raw_text() {
    let server = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(ws_url(&server.base, "/ws/default/web/app/logs?tail=20"))
        .await
        .unwrap();

    let mut received = String::new();
    while let Ok(Some(Ok(message))) = tokio::time::timeout(Duration::from_secs(3), ws.next()).await {
        match message {
            Message::Text(text) => received.push_str(&text),
            Message::Close(_) => break,
            _ => {}
        }
    }
    assert_eq!(received, "tail=Some(20)\nline 1\nline 2\n");
}

#[tokio::test]
async fn split_multibyte_log_text_is_reassembled() {
    let server = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(ws_url(&server.base, "/ws/default/fresh/app/logs"))
        .await
        .unwrap();

    let mut received = String::new();
    while let Ok(Some(Ok(message))) = tokio::time::timeout(Duration::from_secs(3), ws.next()).await {
        match message {
            Message::Text(text) => received.push_str(&text),
            Message::Close(_) => break,
            _ => {}
        }
    }
    assert_eq!(received, "café\n");
}

#[tokio::test]
async fn logs_tail_zero_means_everything() {
    let server = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(ws_url(&server.base, "/ws/default/web/app/logs?tail=0"))
        .await
        .unwrap();
    let first = tokio::time::timeout(Duration::from_secs(3), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(first.to_text().unwrap(), "tail=None\n");
}

#[tokio::test]
async fn unsupported_logs_are_reported_as_text() {
    let server = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(ws_url(&server.base, "/ws/default/web/sidecar/logs"))
        .await
        .unwrap();
    let first = tokio::time::timeout(Duration::from_secs(3), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(first.to_text().unwrap().contains("not supported"));
}

#[tokio::test]
async fn negative_tail_is_rejected() {
    let server = start_test_server().await;
    let result =
        tokio_tungstenite::connect_async(ws_url(&server.base, "/ws/default/web/app/logs?tail=-1")).await;
    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(resp)) => assert_eq!(resp.status(), 400),
        Err(e) => panic!("expected HTTP 400, got {e}"),
        Ok(_) => panic!("expected the upgrade to be rejected"),
    }
}
