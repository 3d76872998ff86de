//! Terminal session multiplexer.
//!
//! One pseudo-terminal per attached owner. Input comes from exactly one
//! writer; output is an ordered stream of byte chunks that the transport fans
//! out to the owner and to any observers.

use crate::error::TerminalError;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::Stream;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::io::{ErrorKind, Read, Write};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub type SessionId = Uuid;

const PTY_READ_BUFFER_SIZE: usize = 4096;
const PTY_WRITE_CHUNK_SIZE: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub sandbox_id: String,
    pub user: String,
    pub cols: u16,
    pub rows: u16,
}

/// Out-of-band control over a spawned pty process.
pub trait PtyControl: Send {
    fn resize(&mut self, cols: u16, rows: u16) -> std::io::Result<()>;

    /// Kills the process group. Must tolerate being called after exit.
    fn terminate(&mut self);
}

pub struct PtyProcess {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub control: Box<dyn PtyControl>,
}

/// Spawns the process behind a terminal session.
pub trait PtyBackend: Send + Sync {
    fn spawn(&self, request: &SpawnRequest) -> Result<PtyProcess, TerminalError>;
}

/// Runs `docker exec -it` against the sandbox under a local pty.
pub struct DockerExecPty {
    docker_bin: String,
}

impl DockerExecPty {
    pub fn new() -> Self {
        Self {
            docker_bin: "docker".to_string(),
        }
    }
}

impl Default for DockerExecPty {
    fn default() -> Self {
        Self::new()
    }
}

impl PtyBackend for DockerExecPty {
    fn spawn(&self, request: &SpawnRequest) -> Result<PtyProcess, TerminalError> {
        let spawn_err = |e: anyhow::Error| TerminalError::SpawnError(e.to_string());

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: request.rows,
                cols: request.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(spawn_err)?;

        let home = format!("/home/{}", request.user);
        let mut cmd = CommandBuilder::new(&self.docker_bin);
        cmd.args([
            "exec",
            "-it",
            "-u",
            request.user.as_str(),
            "-w",
            home.as_str(),
            "-e",
            "TERM=xterm-256color",
            request.sandbox_id.as_str(),
            "/bin/bash",
            "-l",
        ]);
        cmd.env("TERM", "xterm-256color");

        let child = pair.slave.spawn_command(cmd).map_err(spawn_err)?;
        drop(pair.slave);

        let reader = pair.master.try_clone_reader().map_err(spawn_err)?;
        let writer = pair.master.take_writer().map_err(spawn_err)?;

        Ok(PtyProcess {
            reader,
            writer,
            control: Box::new(NativePtyControl {
                master: pair.master,
                child,
            }),
        })
    }
}

struct NativePtyControl {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
}

impl PtyControl for NativePtyControl {
    fn resize(&mut self, cols: u16, rows: u16) -> std::io::Result<()> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(std::io::Error::other)
    }

    fn terminate(&mut self) {
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }
        // The child leads its own session, so its pid is the group id.
        #[cfg(target_os = "linux")]
        if let Some(pid) = self.child.process_id() {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGHUP);
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Output of one terminal session. Ends when the pty process exits.
pub struct TerminalOutput {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl TerminalOutput {
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

impl Stream for TerminalOutput {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        self.rx.poll_recv(cx)
    }
}

struct TerminalSession {
    sandbox_id: String,
    user: String,
    input_tx: Mutex<Option<std::sync::mpsc::Sender<Vec<u8>>>>,
    control: Mutex<Box<dyn PtyControl>>,
    size: Mutex<(u16, u16)>,
    closed: AtomicBool,
}

impl TerminalSession {
    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.input_tx.lock().take();
        self.control.lock().terminate();
    }
}

type Sessions = Arc<DashMap<SessionId, Arc<TerminalSession>>>;

pub struct TerminalMultiplexer {
    backend: Arc<dyn PtyBackend>,
    sessions: Sessions,
}

impl TerminalMultiplexer {
    pub fn new(backend: Arc<dyn PtyBackend>) -> Self {
        Self {
            backend,
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Spawns a login shell inside `sandbox_id` as `user`.
    pub fn attach(
        &self,
        sandbox_id: &str,
        user: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(SessionId, TerminalOutput), TerminalError> {
        let request = SpawnRequest {
            sandbox_id: sandbox_id.to_string(),
            user: user.to_string(),
            cols,
            rows,
        };
        let PtyProcess {
            reader,
            writer,
            control,
        } = self.backend.spawn(&request)?;

        let id = Uuid::new_v4();
        let (input_tx, input_rx) = std::sync::mpsc::channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();

        let session = Arc::new(TerminalSession {
            sandbox_id: request.sandbox_id,
            user: request.user,
            input_tx: Mutex::new(Some(input_tx)),
            control: Mutex::new(control),
            size: Mutex::new((cols, rows)),
            closed: AtomicBool::new(false),
        });
        // Registered before the reader starts so an immediate exit can find it.
        self.sessions.insert(id, session.clone());

        let started = spawn_writer_thread(id, writer, input_rx)
            .and_then(|_| spawn_reader_thread(id, reader, output_tx, self.sessions.clone()));
        if let Err(e) = started {
            self.sessions.remove(&id);
            session.shutdown();
            return Err(TerminalError::SpawnError(e.to_string()));
        }

        info!(session = %id, sandbox = sandbox_id, user, cols, rows, "Terminal attached");
        Ok((id, TerminalOutput { rx: output_rx }))
    }

    /// Forwards `data` to the pty unchanged.
    pub fn write(&self, id: SessionId, data: &[u8]) -> Result<(), TerminalError> {
        let session = self.get(id)?;
        if data.is_empty() {
            return Ok(());
        }
        let input = session.input_tx.lock();
        match input.as_ref() {
            Some(tx) if tx.send(data.to_vec()).is_ok() => Ok(()),
            _ => Err(TerminalError::SessionNotFound(id.to_string())),
        }
    }

    pub fn resize(&self, id: SessionId, cols: u16, rows: u16) -> Result<(), TerminalError> {
        let session = self.get(id)?;
        let mut size = session.size.lock();
        if *size == (cols, rows) {
            return Ok(());
        }
        session.control.lock().resize(cols, rows)?;
        *size = (cols, rows);
        debug!(session = %id, cols, rows, "Terminal resized");
        Ok(())
    }

    /// Terminates the session. Closing an unknown or closed session is a no-op.
    pub fn close(&self, id: SessionId) {
        if let Some((_, session)) = self.sessions.remove(&id) {
            session.shutdown();
            info!(session = %id, sandbox = %session.sandbox_id, "Terminal closed");
        }
    }

    /// Closes every session bound to `sandbox_id`, returning how many there were.
    pub fn close_sandbox(&self, sandbox_id: &str) -> usize {
        let ids: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().sandbox_id == sandbox_id)
            .map(|entry| *entry.key())
            .collect();
        for id in &ids {
            self.close(*id);
        }
        ids.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// The user a live session was spawned for.
    pub fn user_of(&self, id: SessionId) -> Option<String> {
        self.sessions.get(&id).map(|s| s.user.clone())
    }

    fn get(&self, id: SessionId) -> Result<Arc<TerminalSession>, TerminalError> {
        let session = self
            .sessions
            .get(&id)
            .map(|s| s.value().clone())
            .ok_or_else(|| TerminalError::SessionNotFound(id.to_string()))?;
        if session.closed.load(Ordering::SeqCst) {
            return Err(TerminalError::SessionNotFound(id.to_string()));
        }
        Ok(session)
    }
}

fn spawn_writer_thread(
    id: SessionId,
    mut writer: Box<dyn Write + Send>,
    input_rx: std::sync::mpsc::Receiver<Vec<u8>>,
) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name(format!("pty-writer-{id}"))
        .spawn(move || {
            while let Ok(data) = input_rx.recv() {
                for chunk in data.chunks(PTY_WRITE_CHUNK_SIZE) {
                    if let Err(e) = writer.write_all(chunk).and_then(|_| writer.flush()) {
                        error!(session = %id, error = %e, "pty write failed");
                        return;
                    }
                }
            }
            debug!(session = %id, "Writer thread finished");
        })
        .map(|_| ())
}

fn spawn_reader_thread(
    id: SessionId,
    mut reader: Box<dyn Read + Send>,
    output_tx: mpsc::UnboundedSender<Bytes>,
    sessions: Sessions,
) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name(format!("pty-reader-{id}"))
        .spawn(move || {
            let mut buf = [0u8; PTY_READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    // Keep draining after the consumer left so the shell never
                    // blocks on a full pty buffer.
                    Ok(n) => {
                        let _ = output_tx.send(Bytes::copy_from_slice(&buf[..n]));
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // EIO is how Linux reports a hung-up pty master.
                        debug!(session = %id, error = %e, "pty read ended");
                        break;
                    }
                }
            }
            if let Some((_, session)) = sessions.remove(&id) {
                session.shutdown();
                warn!(session = %id, sandbox = %session.sandbox_id, "Terminal process exited");
            }
        })
        .map(|_| ())
}

/// In-process pty backend that echoes input back as output.
#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::mpsc::{Receiver, Sender};

    /// An empty chunk tells the reader the process exited.
    const HANGUP: Vec<u8> = Vec::new();

    #[derive(Default)]
    pub struct LoopbackPty {
        spawned: Mutex<Vec<SpawnRequest>>,
        resizes: Arc<Mutex<Vec<(String, u16, u16)>>>,
        lines: Mutex<HashMap<String, Vec<Sender<Vec<u8>>>>>,
        fail: AtomicBool,
    }

    impl LoopbackPty {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_fail(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        pub fn spawned(&self) -> Vec<SpawnRequest> {
            self.spawned.lock().clone()
        }

        pub fn resizes(&self) -> Vec<(String, u16, u16)> {
            self.resizes.lock().clone()
        }

        /// Makes every shell in `sandbox_id` exit as if the user typed `exit`.
        pub fn hang_up(&self, sandbox_id: &str) {
            if let Some(lines) = self.lines.lock().remove(sandbox_id) {
                for line in lines {
                    let _ = line.send(HANGUP);
                }
            }
        }

        /// Writes `data` to every shell in `sandbox_id` as if the process printed it.
        pub fn emit(&self, sandbox_id: &str, data: &[u8]) {
            if let Some(lines) = self.lines.lock().get(sandbox_id) {
                for line in lines {
                    let _ = line.send(data.to_vec());
                }
            }
        }
    }

    impl PtyBackend for LoopbackPty {
        fn spawn(&self, request: &SpawnRequest) -> Result<PtyProcess, TerminalError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TerminalError::SpawnError("loopback spawn refused".into()));
            }
            self.spawned.lock().push(request.clone());

            let (tx, rx) = std::sync::mpsc::channel();
            self.lines
                .lock()
                .entry(request.sandbox_id.clone())
                .or_default()
                .push(tx.clone());

            Ok(PtyProcess {
                reader: Box::new(EchoReader {
                    rx,
                    pending: Vec::new(),
                }),
                writer: Box::new(EchoWriter { tx: tx.clone() }),
                control: Box::new(EchoControl {
                    sandbox_id: request.sandbox_id.clone(),
                    tx: Some(tx),
                    resizes: self.resizes.clone(),
                }),
            })
        }
    }

    struct EchoReader {
        rx: Receiver<Vec<u8>>,
        pending: Vec<u8>,
    }

    impl Read for EchoReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pending.is_empty() {
                match self.rx.recv() {
                    Ok(chunk) if !chunk.is_empty() => self.pending = chunk,
                    _ => return Ok(0),
                }
            }
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }
    }

    struct EchoWriter {
        tx: Sender<Vec<u8>>,
    }

    impl Write for EchoWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if buf.is_empty() {
                return Ok(0);
            }
            self.tx
                .send(buf.to_vec())
                .map_err(|_| std::io::Error::from(ErrorKind::BrokenPipe))?;
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct EchoControl {
        sandbox_id: String,
        tx: Option<Sender<Vec<u8>>>,
        resizes: Arc<Mutex<Vec<(String, u16, u16)>>>,
    }

    impl PtyControl for EchoControl {
        fn resize(&mut self, cols: u16, rows: u16) -> std::io::Result<()> {
            self.resizes.lock().push((self.sandbox_id.clone(), cols, rows));
            Ok(())
        }

        fn terminate(&mut self) {
            if let Some(tx) = self.tx.take() {
                let _ = tx.send(HANGUP);
            }
        }
    }
}
