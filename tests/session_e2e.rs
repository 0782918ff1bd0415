//! End-to-end tests against an in-process sandbox backend.
//!
//! The backend speaks the same HTTP and WebSocket surface as the real
//! sandbox service: file updates, execute, health, workspace listing,
//! file download and the `/ws/{session_id}` shell.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, HeaderName, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Notify};

use cmux_session::api::WorkspaceApi;
use cmux_session::{
    CallerIdentity, ClientConfig, ConnectionState, DisplayKind, HttpWorkspaceClient,
    ReconnectPolicy, Scrollback, SessionController, SessionError, SessionId, TerminalEvent,
};

const WAIT: Duration = Duration::from_secs(10);
// "hello" base64
const ARTIFACT_PAYLOAD: &str = "aGVsbG8=";

#[derive(Clone, Default)]
struct Backend {
    files: Arc<Mutex<HashMap<String, HashMap<String, String>>>>,
    executed: Arc<Mutex<Vec<Value>>>,
    commands: Arc<Mutex<Vec<Value>>>,
    connections: Arc<AtomicUsize>,
    drop_shell: Arc<Notify>,
}

impl Backend {
    fn file(&self, session: &str, name: &str) -> Option<String> {
        self.files
            .lock()
            .get(session)
            .and_then(|files| files.get(name).cloned())
    }
}

async fn update_file(
    State(backend): State<Backend>,
    Path(session_id): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let filename = body["filename"].as_str().unwrap_or_default().to_string();
    let content = body["content"].as_str().unwrap_or_default().to_string();
    backend
        .files
        .lock()
        .entry(session_id)
        .or_default()
        .insert(filename, content);
    Json(json!({ "status": "success" }))
}

async fn execute(
    State(backend): State<Backend>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let source = body["sourceCode"].as_str().unwrap_or_default().to_string();
    backend.executed.lock().push(body);

    if source.contains("explode") {
        return Err((StatusCode::INTERNAL_SERVER_ERROR, "boom".to_string()));
    }
    if source.contains("raise") {
        return Ok(Json(json!({
            "run": { "stdout": "", "stderr": "ValueError: bad\n", "code": 1 },
            "files": []
        })));
    }
    if source.contains("plot") {
        return Ok(Json(json!({
            "run": { "stdout": null, "stderr": null, "code": 0 },
            "files": [{ "name": "plot.png", "type": "image/png", "content": ARTIFACT_PAYLOAD }]
        })));
    }
    Ok(Json(json!({
        "run": { "stdout": format!("ran {} bytes\n", source.len()), "stderr": "", "code": 0 }
    })))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy", "service": "code-execution-api", "docker_available": true }))
}

async fn list_files(
    State(backend): State<Backend>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let files = backend.files.lock();
    let Some(workspace) = files.get(&session_id) else {
        return Err(StatusCode::NOT_FOUND);
    };
    let entries: Vec<Value> = workspace
        .iter()
        .map(|(name, content)| {
            json!({
                "name": name,
                "size": content.len(),
                "modified": 1_700_000_000,
                "download_url": format!("/files/{}/{}", session_id, name),
            })
        })
        .collect();
    Ok(Json(json!({
        "session_id": session_id,
        "count": entries.len(),
        "files": entries,
    })))
}

async fn download(
    State(backend): State<Backend>,
    Path((session_id, filename)): Path<(String, String)>,
) -> Result<([(HeaderName, &'static str); 1], Vec<u8>), StatusCode> {
    let content = backend
        .file(&session_id, &filename)
        .ok_or(StatusCode::NOT_FOUND)?;
    let media_type = if filename.ends_with(".png") {
        "image/png"
    } else {
        "application/octet-stream"
    };
    Ok(([(header::CONTENT_TYPE, media_type)], content.into_bytes()))
}

async fn shell(
    State(backend): State<Backend>,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| serve_shell(socket, backend, session_id))
}

async fn serve_shell(mut socket: WebSocket, backend: Backend, session_id: String) {
    backend.connections.fetch_add(1, Ordering::SeqCst);

    // Split the greeting inside the two-byte 'é'
    let greeting = format!("{} héllo\r\n$ ", session_id).into_bytes();
    let split = greeting.iter().position(|&b| b == 0xc3).unwrap() + 1;
    let _ = socket
        .send(Message::Binary(greeting[..split].to_vec().into()))
        .await;
    let _ = socket
        .send(Message::Binary(greeting[split..].to_vec().into()))
        .await;

    loop {
        tokio::select! {
            _ = backend.drop_shell.notified() => return,
            frame = socket.recv() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let command: Value = serde_json::from_str(text.as_str()).unwrap_or(Value::Null);
                    let echoed = command["command"].as_str().unwrap_or_default().to_string();
                    backend.commands.lock().push(command);
                    if socket.send(Message::Text(format!("echo:{}", echoed).into())).await.is_err() {
                        return;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => {}
            }
        }
    }
}

async fn spawn_backend() -> (String, Backend) {
    let backend = Backend::default();
    let app = Router::new()
        .route("/update-file/{session_id}", post(update_file))
        .route("/execute", post(execute))
        .route("/health", get(health))
        .route("/files/{session_id}", get(list_files))
        .route("/download/{session_id}/{filename}", get(download))
        .route("/ws/{session_id}", get(shell))
        .with_state(backend.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), backend)
}

fn config(address: &str) -> ClientConfig {
    ClientConfig::new(address)
        .unwrap()
        .with_identity(CallerIdentity::email("dev@example.com"))
        .with_reconnect(ReconnectPolicy::Fixed(Duration::from_millis(50)))
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never became true");
}

async fn wait_for_state(events: &mut broadcast::Receiver<TerminalEvent>, target: ConnectionState) {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(TerminalEvent::StateChanged { to, .. }) if to == target => return,
                Ok(_) => {}
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for terminal state");
}

#[tokio::test]
async fn test_http_client_against_backend() {
    let (address, backend) = spawn_backend().await;
    let client = HttpWorkspaceClient::new(&config(&address)).unwrap();
    let session = SessionId::new("create_http");

    assert_eq!(client.list_files(&session).await.unwrap(), None);

    client
        .update_file(&session, "script.py", "print('hi')")
        .await
        .unwrap();
    assert_eq!(
        backend.file("create_http", "script.py").as_deref(),
        Some("print('hi')")
    );

    let listing = client.list_files(&session).await.unwrap().unwrap();
    assert_eq!(listing.count, 1);
    assert_eq!(listing.files[0].name, "script.py");
    assert_eq!(listing.files[0].size, 11);

    let response = client.execute(&session, "print('hi')").await.unwrap();
    assert_eq!(response.run.stdout, "ran 11 bytes\n");
    assert!(response.files.is_empty());
    assert_eq!(
        backend.executed.lock()[0],
        json!({ "sourceCode": "print('hi')", "email": "dev@example.com" })
    );

    let health = client.health().await.unwrap();
    assert_eq!(health.status, "healthy");
    assert_eq!(health.docker_available, Some(true));
}

#[tokio::test]
async fn test_download_workspace_file() {
    let (address, _backend) = spawn_backend().await;
    let controller = SessionController::connect(
        SessionId::new("create_dl"),
        &config(&address),
        Arc::new(Scrollback::new()),
    )
    .unwrap();

    assert!(matches!(
        controller.download_workspace_file("data.csv").await,
        Err(SessionError::ArtifactNotFound(_))
    ));

    controller.push_file("data 1.csv", "a,b\n1,2\n").await.unwrap();
    let download = controller.download_workspace_file("data 1.csv").await.unwrap();
    assert_eq!(download.mime_type, "application/octet-stream");
    assert_eq!(download.bytes, b"a,b\n1,2\n");

    let dir = tempfile::tempdir().unwrap();
    let saved = download.save_into(dir.path()).await.unwrap();
    assert_eq!(saved, dir.path().join("data 1.csv"));
    assert_eq!(std::fs::read(saved).unwrap(), b"a,b\n1,2\n");

    assert!(matches!(
        controller.download_workspace_file("missing.csv").await,
        Err(SessionError::ArtifactNotFound(name)) if name == "missing.csv"
    ));
}

#[tokio::test]
async fn test_server_error_becomes_execution_failure() {
    let (address, _backend) = spawn_backend().await;
    let controller = SessionController::connect(
        SessionId::new("create_err"),
        &config(&address),
        Arc::new(Scrollback::new()),
    )
    .unwrap();

    controller.on_buffer_changed("explode()");
    let err = controller.run_requested().await.unwrap_err();
    match err {
        SessionError::Execution(message) => assert!(message.contains("500"), "{message}"),
        other => panic!("unexpected error: {other}"),
    }
    let display = controller.state().last_run.unwrap();
    assert!(display.is_error);
    assert!(display.text.starts_with("Execution failed: "));
}

#[tokio::test]
async fn test_run_classifies_and_saves_artifacts() {
    let (address, backend) = spawn_backend().await;
    let controller = SessionController::connect(
        SessionId::new("create_run"),
        &config(&address),
        Arc::new(Scrollback::new()),
    )
    .unwrap();

    controller.on_buffer_changed("plot()");
    let report = controller.run_requested().await.unwrap().unwrap();
    assert_eq!(report.display.kind, DisplayKind::ArtifactsOnly);
    assert_eq!(report.result.exit_code, Some(0));
    assert_eq!(backend.file("create_run", "script.py").as_deref(), Some("plot()"));

    let dir = tempfile::tempdir().unwrap();
    let download = controller.prepare_download("plot.png").unwrap();
    let saved = download.save_into(dir.path()).await.unwrap();
    assert_eq!(std::fs::read(saved).unwrap(), b"hello");

    controller.on_buffer_changed("raise ValueError('bad')");
    let report = controller.run_requested().await.unwrap().unwrap();
    assert_eq!(report.display.kind, DisplayKind::Stderr);
    assert!(report.display.is_error);
    assert!(controller.state().artifacts.is_empty());
}

#[tokio::test]
async fn test_terminal_round_trip_and_reconnect() {
    let (address, backend) = spawn_backend().await;
    let surface = Arc::new(Scrollback::new());
    let controller = SessionController::connect(
        SessionId::new("create_term"),
        &config(&address),
        surface.clone(),
    )
    .unwrap();

    controller
        .on_buffer_changed("print(1)")
        .unwrap()
        .await
        .unwrap()
        .unwrap();

    let mut events = controller.terminal().subscribe();
    controller.start().unwrap();
    controller.terminal().wait_until_open(WAIT).await.unwrap();

    // Multibyte character split across binary frames survives
    eventually(|| surface.contents().contains("create_term héllo")).await;

    controller.send_terminal_input("ls\r").unwrap();
    eventually(|| surface.contents().contains("echo:ls\r")).await;
    assert_eq!(
        backend.commands.lock()[0],
        json!({ "command": "ls\r", "email": "dev@example.com" })
    );

    backend.drop_shell.notify_one();
    wait_for_state(&mut events, ConnectionState::Reconnecting).await;
    wait_for_state(&mut events, ConnectionState::Open).await;
    eventually(|| backend.connections.load(Ordering::SeqCst) == 2).await;

    let contents = surface.contents();
    assert_eq!(contents.matches("Disconnected from virtual terminal").count(), 1);
    assert_eq!(contents.matches("Reconnected to virtual terminal").count(), 1);

    controller.send_terminal_input("pwd\r").unwrap();
    eventually(|| surface.contents().contains("echo:pwd\r")).await;

    controller.stop().await;
    assert_eq!(controller.state().terminal, ConnectionState::Closed);
    assert_eq!(backend.file("create_term", "script.py").as_deref(), Some("print(1)"));
}
