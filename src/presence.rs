//! Presence tracking and observer fan-out.
//!
//! Every WebSocket connection registers here and gets one bounded outbound
//! queue. A username is owned by at most one connection; any number of
//! connections may observe it. Deliveries to observers never wait: an
//! observer whose queue is full or gone is evicted instead.

use crate::protocol::ServerMessage;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type ConnId = Uuid;

/// What a connection gets back from [`Presence::register`].
pub struct Registration {
    pub id: ConnId,
    /// Frames for this connection; drained by its writer task.
    pub rx: mpsc::Receiver<ServerMessage>,
    /// For frames the connection sends to itself, with backpressure.
    pub tx: mpsc::Sender<ServerMessage>,
    /// Fires once if the connection is evicted or taken over.
    pub evicted: Arc<Notify>,
}

struct Connection {
    tx: mpsc::Sender<ServerMessage>,
    evicted: Arc<Notify>,
    username: Option<String>,
    watching: HashSet<String>,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnId, Connection>,
    owners: HashMap<String, ConnId>,
    observers: HashMap<String, HashSet<ConnId>>,
}

impl Inner {
    fn evict(&mut self, id: ConnId, reason: &str) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        for target in conn.watching.drain() {
            if let Some(set) = self.observers.get_mut(&target) {
                set.remove(&id);
                if set.is_empty() {
                    self.observers.remove(&target);
                }
            }
        }
        conn.evicted.notify_one();
        warn!(conn = %id, reason, "Evicting connection");
    }

    fn deliver(&mut self, id: ConnId, msg: ServerMessage) -> bool {
        let Some(conn) = self.connections.get(&id) else {
            return false;
        };
        match conn.tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.evict(id, "outbound queue full");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.evict(id, "outbound queue closed");
                false
            }
        }
    }
}

pub struct Presence {
    queue: usize,
    inner: Mutex<Inner>,
}

impl Presence {
    /// `queue` is the capacity of each connection's outbound queue.
    pub fn new(queue: usize) -> Self {
        Self {
            queue: queue.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn register(&self) -> Registration {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.queue);
        let evicted = Arc::new(Notify::new());
        self.inner.lock().connections.insert(
            id,
            Connection {
                tx: tx.clone(),
                evicted: evicted.clone(),
                username: None,
                watching: HashSet::new(),
            },
        );
        debug!(conn = %id, "Connection registered");
        Registration {
            id,
            rx,
            tx,
            evicted,
        }
    }

    /// Forgets a connection. Returns the username it still owned, if any.
    pub fn unregister(&self, id: ConnId) -> Option<String> {
        let mut inner = self.inner.lock();
        let conn = inner.connections.remove(&id)?;
        for target in &conn.watching {
            if let Some(set) = inner.observers.get_mut(target) {
                set.remove(&id);
                if set.is_empty() {
                    inner.observers.remove(target);
                }
            }
        }
        let username = conn.username?;
        if inner.owners.get(&username) == Some(&id) {
            inner.owners.remove(&username);
            debug!(conn = %id, username = %username, "Connection unregistered");
            Some(username)
        } else {
            None
        }
    }

    /// Makes `id` the owner of `username`. A previous owner connection is
    /// evicted and returned.
    pub fn join(&self, username: &str, id: ConnId) -> Option<ConnId> {
        let mut inner = self.inner.lock();
        if let Some(conn) = inner.connections.get_mut(&id) {
            conn.username = Some(username.to_string());
        }
        let previous = inner
            .owners
            .insert(username.to_string(), id)
            .filter(|prev| *prev != id)?;
        if let Some(prev) = inner.connections.get_mut(&previous) {
            prev.username = None;
            prev.evicted.notify_one();
        }
        info!(username, old = %previous, new = %id, "Session taken over");
        Some(previous)
    }

    /// Drops `id`'s ownership of `username`. Returns `false` if `id` was not
    /// the owner.
    pub fn leave(&self, username: &str, id: ConnId) -> bool {
        let mut inner = self.inner.lock();
        if inner.owners.get(username) != Some(&id) {
            return false;
        }
        inner.owners.remove(username);
        if let Some(conn) = inner.connections.get_mut(&id) {
            conn.username = None;
        }
        true
    }

    pub fn current_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.inner.lock().owners.keys().cloned().collect();
        users.sort();
        users
    }

    pub fn is_owner(&self, username: &str, id: ConnId) -> bool {
        self.inner.lock().owners.get(username) == Some(&id)
    }

    pub fn is_online(&self, username: &str) -> bool {
        self.inner.lock().owners.contains_key(username)
    }

    /// Binds `id` as a read-only observer of `username`.
    pub fn observe(&self, id: ConnId, username: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(conn) = inner.connections.get_mut(&id) else {
            return false;
        };
        conn.watching.insert(username.to_string());
        inner
            .observers
            .entry(username.to_string())
            .or_default()
            .insert(id);
        true
    }

    pub fn unobserve(&self, id: ConnId, username: &str) {
        let mut inner = self.inner.lock();
        if let Some(conn) = inner.connections.get_mut(&id) {
            conn.watching.remove(username);
        }
        if let Some(set) = inner.observers.get_mut(username) {
            set.remove(&id);
            if set.is_empty() {
                inner.observers.remove(username);
            }
        }
    }

    pub fn observer_count(&self, username: &str) -> usize {
        self.inner
            .lock()
            .observers
            .get(username)
            .map_or(0, HashSet::len)
    }

    /// Mirrors one output chunk of `username`'s terminal to its observers.
    /// Returns how many observers received it.
    pub fn route(&self, username: &str, chunk: &Bytes) -> usize {
        let mut inner = self.inner.lock();
        let targets: Vec<ConnId> = match inner.observers.get(username) {
            Some(set) => set.iter().copied().collect(),
            None => return 0,
        };
        targets
            .into_iter()
            .filter(|id| {
                inner.deliver(
                    *id,
                    ServerMessage::ObserveOutput {
                        username: username.to_string(),
                        data: chunk.clone(),
                    },
                )
            })
            .count()
    }

    /// Tells every observer of `username` that the feed is gone and drops
    /// their bindings.
    pub fn feed_ended(&self, username: &str) {
        let mut inner = self.inner.lock();
        let Some(targets) = inner.observers.remove(username) else {
            return;
        };
        for id in targets {
            if let Some(conn) = inner.connections.get_mut(&id) {
                conn.watching.remove(username);
            }
            inner.deliver(
                id,
                ServerMessage::ObserveEnded {
                    username: username.to_string(),
                },
            );
        }
    }

    /// Sends `msg` to every connection except `except`.
    pub fn broadcast(&self, msg: ServerMessage, except: Option<ConnId>) {
        let mut inner = self.inner.lock();
        let targets: Vec<ConnId> = inner
            .connections
            .keys()
            .copied()
            .filter(|id| Some(*id) != except)
            .collect();
        for id in targets {
            inner.deliver(id, msg.clone());
        }
    }
}
