//! One WebSocket connection: a reader loop that dispatches client frames and
//! a writer task that drains the connection's outbound queue.
//!
//! Frames leave through two queues. The owner's own terminal output uses a
//! backpressured queue of its own; everything else (replies, presence events,
//! observed output) shares the queue that presence may evict on.
//!
//! A connection starts anonymous. After a successful `login` it owns that
//! user's terminal: only the owner may write to it, resize it, reset or
//! extend the sandbox. Any connection may observe any user.

use crate::presence::{ConnId, Registration};
use crate::protocol::{ClientMessage, ErrorCode, ServerMessage};
use crate::provision::{valid_username, Progress, ProgressSink};
use crate::state::AppState;
use crate::terminal::{SessionId, TerminalOutput};
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn serve_socket(state: AppState, socket: WebSocket) {
    let Registration {
        id,
        mut rx,
        tx,
        evicted,
    } = state.presence.register();
    let (terminal_tx, mut terminal_rx) = mpsc::channel(state.config.outbound_queue.max(1));
    let (mut ws_tx, mut ws_rx) = socket.split();
    info!(conn = %id, "WebSocket connected");

    let writer = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                biased;
                Some(msg) = rx.recv() => msg,
                Some(msg) = terminal_rx.recv() => msg,
                else => break,
            };
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    warn!(conn = %id, error = %e, "Failed to encode frame");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let size = (state.config.default_cols, state.config.default_rows);
    let mut conn = Connection {
        id,
        state,
        tx,
        terminal_tx,
        evicted,
        gone: AtomicBool::new(false),
        owner: None,
        size,
    };

    loop {
        if conn.is_gone() {
            conn.notify_evicted();
            break;
        }
        tokio::select! {
            _ = conn.evicted.notified() => {
                conn.notify_evicted();
                break;
            }
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => conn.handle_text(&text).await,
                Some(Ok(Message::Binary(_))) => {
                    conn.reply(ServerMessage::error(
                        ErrorCode::BadRequest,
                        "binary frames are not supported",
                    ))
                    .await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(conn = %id, error = %e, "WebSocket read failed");
                    break;
                }
            },
        }
    }

    conn.release();
    conn.state.presence.unregister(id);
    drop(conn);
    // The writer drains what is queued and exits once every sender is gone.
    let abort = writer.abort_handle();
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        abort.abort();
    }
    info!(conn = %id, "WebSocket disconnected");
}

/// The terminal a logged-in connection owns.
struct Owner {
    username: String,
    sandbox_id: String,
    session: Option<SessionId>,
    pump: Option<JoinHandle<()>>,
}

struct Connection {
    id: ConnId,
    state: AppState,
    tx: mpsc::Sender<ServerMessage>,
    terminal_tx: mpsc::Sender<ServerMessage>,
    evicted: Arc<Notify>,
    /// Set when an eviction fired while a reply was waiting for queue space.
    gone: AtomicBool,
    owner: Option<Owner>,
    size: (u16, u16),
}

impl Connection {
    async fn reply(&self, msg: ServerMessage) {
        if self.is_gone() {
            return;
        }
        tokio::select! {
            _ = self.tx.send(msg) => {}
            _ = self.evicted.notified() => self.gone.store(true, Ordering::SeqCst),
        }
    }

    fn is_gone(&self) -> bool {
        self.gone.load(Ordering::SeqCst)
    }

    /// Best effort: the queue is usually full when this happens.
    fn notify_evicted(&self) {
        let _ = self.tx.try_send(ServerMessage::error(
            ErrorCode::Evicted,
            "connection closed by server",
        ));
    }

    async fn handle_text(&mut self, text: &str) {
        let msg = match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(conn = %self.id, error = %e, "Malformed frame");
                self.reply(ServerMessage::error(
                    ErrorCode::BadRequest,
                    format!("malformed frame: {e}"),
                ))
                .await;
                return;
            }
        };

        match msg {
            ClientMessage::Login { username, password } => self.login(username, password).await,
            ClientMessage::TerminalInput { data } => self.input(data).await,
            ClientMessage::TerminalResize { cols, rows } => self.resize(cols, rows).await,
            ClientMessage::ObserveStart { username } => self.observe(username).await,
            ClientMessage::ObserveStop { username } => {
                self.state.presence.unobserve(self.id, &username);
            }
            ClientMessage::PresenceList => {
                let users = self.state.presence.current_users();
                self.reply(ServerMessage::PresenceUsers { users }).await;
            }
            ClientMessage::Reset { username } => self.reset(username).await,
            ClientMessage::Extend { username } => self.extend(username).await,
            ClientMessage::Ping => {
                if let Some(owner) = &self.owner {
                    self.state.lifecycle.touch(&owner.username);
                }
                self.reply(ServerMessage::Pong).await;
            }
        }
    }

    async fn login(&mut self, username: String, password: String) {
        self.release();

        let (progress, forward) = self.forward_progress();
        let result = self
            .state
            .lifecycle
            .resolve(&username, &password, Some(&progress))
            .await;
        drop(progress);
        let _ = forward.await;

        let handle = match result {
            Ok(handle) => handle,
            Err(e) => {
                info!(conn = %self.id, username = %username, error = %e, "Login failed");
                self.reply(ServerMessage::from(&e)).await;
                return;
            }
        };

        let taken_over = self.state.presence.join(&username, self.id).is_some();
        info!(
            conn = %self.id,
            username = %username,
            sandbox = %handle.sandbox_id,
            created = handle.created,
            "Login succeeded"
        );
        self.reply(ServerMessage::LoginOk {
            sandbox_id: handle.sandbox_id.clone(),
            created: handle.created,
            message: handle.message,
        })
        .await;

        self.owner = Some(Owner {
            username: username.clone(),
            sandbox_id: handle.sandbox_id,
            session: None,
            pump: None,
        });
        self.attach().await;

        if !taken_over {
            self.state
                .presence
                .broadcast(ServerMessage::PresenceJoined { username }, Some(self.id));
        }
        let users = self.state.presence.current_users();
        self.reply(ServerMessage::PresenceUsers { users }).await;
    }

    /// Spawns the owner's shell and starts pumping its output.
    async fn attach(&mut self) {
        let (cols, rows) = self.size;
        let Some(owner) = self.owner.as_mut() else {
            return;
        };
        match self
            .state
            .terminals
            .attach(&owner.sandbox_id, &owner.username, cols, rows)
        {
            Ok((session, output)) => {
                owner.session = Some(session);
                owner.pump = Some(spawn_pump(
                    self.state.clone(),
                    self.id,
                    owner.username.clone(),
                    self.terminal_tx.clone(),
                    output,
                ));
            }
            Err(e) => {
                warn!(conn = %self.id, username = %owner.username, error = %e, "Failed to attach terminal");
                owner.session = None;
                let frame = ServerMessage::from(&e);
                self.reply(frame).await;
            }
        }
    }

    async fn input(&mut self, data: Bytes) {
        let Some(owner) = &self.owner else {
            self.not_logged_in().await;
            return;
        };
        self.state.lifecycle.touch(&owner.username);
        let Some(session) = owner.session else {
            self.reply(ServerMessage::error(
                ErrorCode::SessionNotFound,
                "no terminal attached",
            ))
            .await;
            return;
        };
        if let Err(e) = self.state.terminals.write(session, &data) {
            debug!(conn = %self.id, error = %e, "Dropped input for closed terminal");
            self.reply(ServerMessage::from(&e)).await;
        }
    }

    async fn resize(&mut self, cols: u16, rows: u16) {
        if cols == 0 || rows == 0 {
            self.reply(ServerMessage::error(
                ErrorCode::BadRequest,
                "terminal size must be non-zero",
            ))
            .await;
            return;
        }
        self.size = (cols, rows);
        let Some(owner) = &self.owner else {
            self.not_logged_in().await;
            return;
        };
        self.state.lifecycle.touch(&owner.username);
        if let Some(session) = owner.session {
            if let Err(e) = self.state.terminals.resize(session, cols, rows) {
                debug!(conn = %self.id, error = %e, "Resize of closed terminal ignored");
                self.reply(ServerMessage::from(&e)).await;
            }
        }
    }

    async fn observe(&mut self, username: String) {
        if self.owner.is_none() {
            self.not_logged_in().await;
            return;
        }
        if !valid_username(&username) {
            self.reply(ServerMessage::error(
                ErrorCode::InvalidIdentity,
                format!("invalid username: {username}"),
            ))
            .await;
            return;
        }
        self.state.presence.observe(self.id, &username);
        debug!(conn = %self.id, target = %username, "Observing");
    }

    async fn reset(&mut self, username: String) {
        if !self.owns(&username).await {
            return;
        }
        // Stop pumping first so the old shell's exit is not reported as a crash.
        self.detach();

        let (progress, forward) = self.forward_progress();
        let result = self.state.lifecycle.reset(&username, Some(&progress)).await;
        drop(progress);
        let _ = forward.await;

        match result {
            Ok(handle) => {
                if let Some(owner) = self.owner.as_mut() {
                    owner.sandbox_id = handle.sandbox_id.clone();
                }
                self.reply(ServerMessage::ResetOk {
                    sandbox_id: handle.sandbox_id,
                    message: handle.message,
                })
                .await;
                self.attach().await;
                self.state
                    .presence
                    .broadcast(ServerMessage::PresenceReset { username }, Some(self.id));
            }
            Err(e) => {
                warn!(conn = %self.id, username = %username, error = %e, "Reset failed");
                self.reply(ServerMessage::from(&e)).await;
            }
        }
    }

    async fn extend(&mut self, username: String) {
        if !self.owns(&username).await {
            return;
        }
        match self.state.lifecycle.extend(&username) {
            Ok(deadline) => self.reply(ServerMessage::ExtendOk { deadline }).await,
            Err(e) => self.reply(ServerMessage::from(&e)).await,
        }
    }

    /// Replies with an error unless this connection owns `username`.
    async fn owns(&self, username: &str) -> bool {
        match &self.owner {
            None => {
                self.not_logged_in().await;
                false
            }
            Some(owner) if owner.username != username => {
                self.reply(ServerMessage::error(
                    ErrorCode::Forbidden,
                    format!("only {username} may do that"),
                ))
                .await;
                false
            }
            Some(_) => true,
        }
    }

    async fn not_logged_in(&self) {
        self.reply(ServerMessage::error(ErrorCode::NotLoggedIn, "log in first"))
            .await;
    }

    fn forward_progress(&self) -> (ProgressSink, JoinHandle<()>) {
        let (progress, mut updates) = mpsc::unbounded_channel::<Progress>();
        let tx = self.tx.clone();
        let forward = tokio::spawn(async move {
            while let Some(p) = updates.recv().await {
                let _ = tx
                    .send(ServerMessage::ProvisionProgress {
                        percent: p.percent,
                        message: p.message,
                    })
                    .await;
            }
        });
        (progress, forward)
    }

    /// Closes the owner's terminal without touching ownership.
    fn detach(&mut self) {
        let Some(owner) = self.owner.as_mut() else {
            return;
        };
        if let Some(pump) = owner.pump.take() {
            pump.abort();
        }
        if let Some(session) = owner.session.take() {
            self.state.terminals.close(session);
        }
    }

    /// Gives up the owned terminal and, unless someone took it over, the
    /// username's presence.
    fn release(&mut self) {
        self.detach();
        let Some(owner) = self.owner.take() else {
            return;
        };
        if self.state.presence.leave(&owner.username, self.id) {
            self.state.presence.feed_ended(&owner.username);
            self.state.presence.broadcast(
                ServerMessage::PresenceLeft {
                    username: owner.username.clone(),
                },
                Some(self.id),
            );
            info!(conn = %self.id, username = %owner.username, "User left");
        }
    }
}

/// Copies terminal output to the owner and mirrors it to observers. `tx` is
/// the owner's terminal queue, so a busy shell only ever slows itself down.
fn spawn_pump(
    state: AppState,
    id: ConnId,
    username: String,
    tx: mpsc::Sender<ServerMessage>,
    mut output: TerminalOutput,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(chunk) = output.next().await {
            state.presence.route(&username, &chunk);
            if tx
                .send(ServerMessage::TerminalOutput { data: chunk })
                .await
                .is_err()
            {
                return;
            }
        }
        // The shell exited on its own.
        if state.presence.is_owner(&username, id) {
            let _ = tx.send(ServerMessage::TerminalExit).await;
            state.presence.feed_ended(&username);
        }
    })
}
