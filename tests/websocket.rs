use fishbowl::credentials::FileCredentialStore;
use fishbowl::runtime::MemoryRuntime;
use fishbowl::terminal::testing::LoopbackPty;
use fishbowl::{http_server, AppState, Config};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);
/// Long enough to drain a flooded terminal.
const DRAIN: Duration = Duration::from_secs(30);

struct Server {
    addr: SocketAddr,
    runtime: Arc<MemoryRuntime>,
    pty: Arc<LoopbackPty>,
    _storage: tempfile::TempDir,
    _shutdown: oneshot::Sender<()>,
}

async fn start() -> Server {
    start_with_queue(Config::default().outbound_queue).await
}

async fn start_with_queue(outbound_queue: usize) -> Server {
    let storage = tempfile::tempdir().unwrap();
    let runtime = Arc::new(MemoryRuntime::new());
    let pty = Arc::new(LoopbackPty::new());
    let config = Config {
        storage_root: storage.path().to_path_buf(),
        credentials_file: None,
        outbound_queue,
        ..Config::default()
    };
    let state = AppState::new(
        runtime.clone(),
        Arc::new(FileCredentialStore::in_memory()),
        pty.clone(),
        config,
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        http_server::serve(listener, state, async {
            let _ = rx.await;
        })
        .await
        .unwrap();
    });

    Server {
        addr,
        runtime,
        pty,
        _storage: storage,
        _shutdown: tx,
    }
}

async fn connect(addr: SocketAddr) -> Socket {
    let (socket, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    socket
}

async fn send(socket: &mut Socket, frame: Value) {
    socket
        .send(Message::Text(frame.to_string()))
        .await
        .unwrap();
}

async fn next_frame(socket: &mut Socket) -> Value {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("socket ended: {other:?}"),
        }
    }
}

/// Reads frames until one has the given `type`, returning it.
async fn expect(socket: &mut Socket, kind: &str) -> Value {
    expect_within(socket, kind, WAIT).await
}

async fn expect_within(socket: &mut Socket, kind: &str, wait: Duration) -> Value {
    tokio::time::timeout(wait, async {
        loop {
            let frame = next_frame(socket).await;
            if frame["type"] == kind {
                return frame;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {kind}"))
}

/// Makes the shell in `sandbox_id` print about 16 MiB.
fn flood(pty: &LoopbackPty, sandbox_id: &str) {
    let chunk = vec![b'x'; 4096];
    for _ in 0..4000 {
        pty.emit(sandbox_id, &chunk);
    }
}

async fn login(socket: &mut Socket, username: &str) -> Value {
    send(
        socket,
        json!({"type": "login", "username": username, "password": "secret1"}),
    )
    .await;
    expect(socket, "login.ok").await
}

fn b64(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

fn unb64(frame: &Value) -> Vec<u8> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(frame["data"].as_str().unwrap())
        .unwrap()
}

#[tokio::test]
async fn health_check_answers_ok() {
    let server = start().await;
    let body = reqwest::get(format!("http://{}/health", server.addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "OK");
}

#[tokio::test]
async fn login_reports_progress_then_sandbox() {
    let server = start().await;
    let mut socket = connect(server.addr).await;

    send(
        &mut socket,
        json!({"type": "login", "username": "alice", "password": "secret1"}),
    )
    .await;

    let mut last = 0;
    loop {
        let frame = tokio::time::timeout(WAIT, socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let frame: Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
        match frame["type"].as_str().unwrap() {
            "provision.progress" => {
                let percent = frame["percent"].as_u64().unwrap();
                assert!(percent >= last);
                last = percent;
            }
            "login.ok" => {
                assert_eq!(frame["created"], true);
                let sandbox_id = frame["sandbox_id"].as_str().unwrap();
                assert!(server.runtime.is_running(sandbox_id));
                break;
            }
            other => panic!("unexpected frame {other}"),
        }
    }
    assert_eq!(last, 100);

    let users = expect(&mut socket, "presence.users").await;
    assert_eq!(users["users"], json!(["alice"]));
}

#[tokio::test]
async fn shell_echoes_input() {
    let server = start().await;
    let mut socket = connect(server.addr).await;
    login(&mut socket, "alice").await;

    send(
        &mut socket,
        json!({"type": "terminal.input", "data": b64(b"ls\n")}),
    )
    .await;
    let output = expect(&mut socket, "terminal.output").await;
    assert_eq!(unb64(&output), b"ls\n");
}

#[tokio::test]
async fn observer_sees_owner_terminal() {
    let server = start().await;
    let mut alice = connect(server.addr).await;
    login(&mut alice, "alice").await;

    let mut bob = connect(server.addr).await;
    login(&mut bob, "bob").await;
    let joined = expect(&mut alice, "presence.joined").await;
    assert_eq!(joined["username"], "bob");

    send(&mut bob, json!({"type": "observe.start", "username": "alice"})).await;
    // ping round trip guarantees the observe request was handled
    send(&mut bob, json!({"type": "ping"})).await;
    expect(&mut bob, "pong").await;

    send(
        &mut alice,
        json!({"type": "terminal.input", "data": b64(b"whoami\n")}),
    )
    .await;
    let seen = expect(&mut bob, "observe.output").await;
    assert_eq!(seen["username"], "alice");
    assert_eq!(unb64(&seen), b"whoami\n");

    drop(alice);
    let ended = expect(&mut bob, "observe.ended").await;
    assert_eq!(ended["username"], "alice");
    let left = expect(&mut bob, "presence.left").await;
    assert_eq!(left["username"], "alice");
}

#[tokio::test]
async fn wrong_password_is_rejected() {
    let server = start().await;
    let mut first = connect(server.addr).await;
    login(&mut first, "alice").await;

    let mut second = connect(server.addr).await;
    send(
        &mut second,
        json!({"type": "login", "username": "alice", "password": "nope123"}),
    )
    .await;
    let error = expect(&mut second, "error").await;
    assert_eq!(error["code"], "authentication_failed");
}

#[tokio::test]
async fn input_before_login_is_refused() {
    let server = start().await;
    let mut socket = connect(server.addr).await;
    send(
        &mut socket,
        json!({"type": "terminal.input", "data": b64(b"id\n")}),
    )
    .await;
    let error = expect(&mut socket, "error").await;
    assert_eq!(error["code"], "not_logged_in");

    send(&mut socket, json!({"type": "bogus"})).await;
    let error = expect(&mut socket, "error").await;
    assert_eq!(error["code"], "bad_request");
}

#[tokio::test]
async fn second_login_takes_over_the_terminal() {
    let server = start().await;
    let mut first = connect(server.addr).await;
    login(&mut first, "alice").await;

    let mut second = connect(server.addr).await;
    let handle = login(&mut second, "alice").await;
    assert_eq!(handle["created"], false);

    let evicted = expect(&mut first, "error").await;
    assert_eq!(evicted["code"], "evicted");
}

#[tokio::test]
async fn users_endpoint_lists_active_sandboxes() {
    let server = start().await;
    let mut socket = connect(server.addr).await;
    let handle = login(&mut socket, "alice").await;
    expect(&mut socket, "presence.users").await;

    let body = reqwest::get(format!("http://{}/api/users", server.addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let users: Value = serde_json::from_str(&body).unwrap();
    let users = users.as_array().unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0]["username"], "alice");
    assert_eq!(users[0]["sandbox_id"], handle["sandbox_id"]);
    assert_eq!(users[0]["online"], true);
    assert_eq!(users[0]["observers"], 0);
}

#[tokio::test]
async fn non_owner_cannot_reset_or_extend() {
    let server = start().await;
    let mut alice = connect(server.addr).await;
    let handle = login(&mut alice, "alice").await;
    let mut bob = connect(server.addr).await;
    login(&mut bob, "bob").await;

    for kind in ["reset", "extend"] {
        send(&mut bob, json!({"type": kind, "username": "alice"})).await;
        let error = expect(&mut bob, "error").await;
        assert_eq!(error["code"], "forbidden", "{kind}");
    }
    let sandbox_id = handle["sandbox_id"].as_str().unwrap();
    assert!(server.runtime.is_running(sandbox_id));
}

#[tokio::test]
async fn input_from_replaced_connection_never_reaches_the_shell() {
    let server = start().await;
    let mut first = connect(server.addr).await;
    login(&mut first, "alice").await;

    let mut second = connect(server.addr).await;
    login(&mut second, "alice").await;
    expect(&mut first, "error").await;

    // The old socket may already be closed; either way nothing may arrive.
    let _ = first
        .send(Message::Text(
            json!({"type": "terminal.input", "data": b64(b"intruder\n")}).to_string(),
        ))
        .await;
    send(
        &mut second,
        json!({"type": "terminal.input", "data": b64(b"mine\n")}),
    )
    .await;
    let output = expect(&mut second, "terminal.output").await;
    assert_eq!(unb64(&output), b"mine\n");
}

#[tokio::test]
async fn reset_swaps_in_a_fresh_sandbox_and_shell() {
    let server = start().await;
    let mut alice = connect(server.addr).await;
    let old = login(&mut alice, "alice").await;
    let old_id = old["sandbox_id"].as_str().unwrap().to_string();

    let mut bob = connect(server.addr).await;
    login(&mut bob, "bob").await;

    send(&mut alice, json!({"type": "reset", "username": "alice"})).await;
    let reset = expect(&mut alice, "reset.ok").await;
    let new_id = reset["sandbox_id"].as_str().unwrap().to_string();
    assert_ne!(new_id, old_id);
    assert!(!server.runtime.exists(&old_id));
    assert!(server.runtime.is_running(&new_id));

    let announced = expect(&mut bob, "presence.reset").await;
    assert_eq!(announced["username"], "alice");

    send(
        &mut alice,
        json!({"type": "terminal.input", "data": b64(b"pwd\n")}),
    )
    .await;
    let output = expect(&mut alice, "terminal.output").await;
    assert_eq!(unb64(&output), b"pwd\n");
    let spawned = server.pty.spawned();
    assert_eq!(spawned.last().unwrap().sandbox_id, new_id);
}

#[tokio::test]
async fn extend_returns_deadline_one_idle_timeout_away() {
    let server = start().await;
    let mut alice = connect(server.addr).await;
    login(&mut alice, "alice").await;

    send(&mut alice, json!({"type": "extend", "username": "alice"})).await;
    let extended = expect(&mut alice, "extend.ok").await;
    let deadline: chrono::DateTime<chrono::Utc> =
        serde_json::from_value(extended["deadline"].clone()).unwrap();
    let ahead = deadline - chrono::Utc::now();
    let timeout = chrono::Duration::from_std(Config::default().idle_timeout).unwrap();
    assert!(ahead <= timeout);
    assert!(ahead > timeout - chrono::Duration::minutes(1));
}

#[tokio::test]
async fn busy_owner_keeps_receiving_presence_events() {
    let server = start_with_queue(8).await;
    let mut alice = connect(server.addr).await;
    let handle = login(&mut alice, "alice").await;
    expect(&mut alice, "presence.users").await;

    // alice stops reading while her shell floods her terminal queue.
    flood(&server.pty, handle["sandbox_id"].as_str().unwrap());
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut carol = connect(server.addr).await;
    login(&mut carol, "carol").await;

    let joined = tokio::time::timeout(DRAIN, async {
        loop {
            let frame = next_frame(&mut alice).await;
            match frame["type"].as_str().unwrap() {
                "error" => panic!("owner lost the connection: {frame}"),
                "presence.joined" => return frame,
                _ => {}
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(joined["username"], "carol");
}

#[tokio::test]
async fn overflowing_observer_is_dropped_promptly() {
    let server = start_with_queue(8).await;
    let mut alice = connect(server.addr).await;
    let handle = login(&mut alice, "alice").await;

    let mut bob = connect(server.addr).await;
    login(&mut bob, "bob").await;
    expect(&mut alice, "presence.joined").await;
    send(&mut bob, json!({"type": "observe.start", "username": "alice"})).await;
    send(&mut bob, json!({"type": "ping"})).await;
    expect(&mut bob, "pong").await;

    // bob never reads again; alice keeps draining her own output.
    flood(&server.pty, handle["sandbox_id"].as_str().unwrap());

    let left = expect_within(&mut alice, "presence.left", DRAIN).await;
    assert_eq!(left["username"], "bob");
    assert!(!server_lists(&server, "bob").await);
}

/// Whether `/api/users` reports `username` as online.
async fn server_lists(server: &Server, username: &str) -> bool {
    let body = reqwest::get(format!("http://{}/api/users", server.addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let users: Value = serde_json::from_str(&body).unwrap();
    users
        .as_array()
        .unwrap()
        .iter()
        .any(|u| u["username"] == username && u["online"] == true)
}
