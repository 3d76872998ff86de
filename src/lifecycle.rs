//! Container lifecycle manager.
//!
//! Owns the username → sandbox mapping. Every username gets a [`Slot`] with
//! two locks: an async operation lock held across engine round-trips, so at
//! most one resolve/reset/sweep works on a user at a time, and a short sync
//! lock around the record itself that `touch` can take without waiting for
//! the engine.

use crate::config::Config;
use crate::credentials::CredentialStore;
use crate::error::{LifecycleError, ProvisionError, RuntimeError};
use crate::provision::{
    container_name, report, username_of, valid_username, ProgressSink, Provisioner, NAME_PREFIX,
};
use crate::runtime::SandboxRuntime;
use crate::terminal::TerminalMultiplexer;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Provisioning,
    Running,
    Resetting,
    Removed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SandboxRecord {
    pub username: String,
    pub container_id: String,
    pub container_name: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: Instant,
    pub state: SandboxState,
}

#[derive(Debug, Clone, Serialize)]
pub struct SandboxHandle {
    pub sandbox_id: String,
    pub created: bool,
    pub message: String,
}

/// One row of [`LifecycleManager::list_active`].
#[derive(Debug, Clone, Serialize)]
pub struct ActiveSandbox {
    pub username: String,
    pub sandbox_id: String,
    pub created_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub idle_secs: u64,
}

#[derive(Default)]
struct Slot {
    op: tokio::sync::Mutex<()>,
    record: parking_lot::Mutex<Option<SandboxRecord>>,
}

impl Slot {
    fn install(&self, username: &str, container_id: &str) {
        let mut record = self.record.lock();
        let created_at = match record.as_ref() {
            Some(r) if r.container_id == container_id && r.state != SandboxState::Removed => {
                r.created_at
            }
            _ => Utc::now(),
        };
        *record = Some(SandboxRecord {
            username: username.to_string(),
            container_id: container_id.to_string(),
            container_name: container_name(username),
            created_at,
            last_activity: Instant::now(),
            state: SandboxState::Running,
        });
    }

    /// Moves a tracked record to `state`, returning its container id.
    fn mark(&self, state: SandboxState) -> Option<String> {
        self.record.lock().as_mut().map(|r| {
            r.state = state;
            r.container_id.clone()
        })
    }
}

pub struct LifecycleManager {
    runtime: Arc<dyn SandboxRuntime>,
    credentials: Arc<dyn CredentialStore>,
    terminals: Arc<TerminalMultiplexer>,
    provisioner: Provisioner,
    config: Arc<Config>,
    slots: DashMap<String, Arc<Slot>>,
}

impl LifecycleManager {
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        credentials: Arc<dyn CredentialStore>,
        terminals: Arc<TerminalMultiplexer>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            provisioner: Provisioner::new(runtime.clone(), config.clone()),
            runtime,
            credentials,
            terminals,
            config,
            slots: DashMap::new(),
        }
    }

    fn slot(&self, username: &str) -> Arc<Slot> {
        self.slots.entry(username.to_string()).or_default().clone()
    }

    /// Logs `username` in, creating the user and their sandbox on first use.
    pub async fn resolve(
        &self,
        username: &str,
        password: &str,
        progress: Option<&ProgressSink>,
    ) -> Result<SandboxHandle, LifecycleError> {
        if !valid_username(username) {
            return Err(LifecycleError::InvalidIdentity(username.to_string()));
        }
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(LifecycleError::WeakCredential {
                min: MIN_PASSWORD_LEN,
            });
        }

        let slot = self.slot(username);
        let _op = slot.op.lock().await;

        let handle = if self.credentials.get_user(username).await?.is_some() {
            if !self.credentials.verify_password(username, password).await? {
                warn!(username, "Rejected login with wrong password");
                return Err(LifecycleError::AuthenticationFailed(username.to_string()));
            }
            let handle = self.reuse_or_reprovision(&slot, username, progress).await?;
            if let Err(e) = self.credentials.update_last_login(username).await {
                warn!(username, error = %e, "Failed to record last login");
            }
            handle
        } else {
            self.close_stale_sessions(&slot);
            let id = self.provisioner.provision(username, progress).await?;
            if let Err(e) = self.credentials.create_user(username, password, &id).await {
                if let Err(rollback) = self.provisioner.teardown(&id).await {
                    warn!(username, error = %rollback, "Failed to roll back unregistered sandbox");
                }
                return Err(ProvisionError::Registration(e.to_string()).into());
            }
            slot.install(username, &id);
            info!(username, container = %id, "Registered new user");
            SandboxHandle {
                sandbox_id: id,
                created: true,
                message: format!("Welcome, {username}! Your sandbox is ready."),
            }
        };

        report(progress, 100, &handle.message);
        Ok(handle)
    }

    async fn reuse_or_reprovision(
        &self,
        slot: &Slot,
        username: &str,
        progress: Option<&ProgressSink>,
    ) -> Result<SandboxHandle, LifecycleError> {
        // The engine is authoritative; the map may be stale after a restart.
        let existing = self
            .runtime
            .inspect(&container_name(username))
            .await
            .map_err(|e| ProvisionError::from_runtime(e, ProvisionError::Start))?;

        if let Some(info) = existing {
            if !info.running {
                report(progress, 50, "Starting your sandbox");
                self.runtime
                    .start(&info.id)
                    .await
                    .map_err(|e| ProvisionError::from_runtime(e, ProvisionError::Start))?;
                info!(username, container = %info.id, "Restarted stopped sandbox");
            }
            slot.install(username, &info.id);
            return Ok(SandboxHandle {
                sandbox_id: info.id,
                created: false,
                message: format!("Welcome back, {username}!"),
            });
        }

        info!(username, "Sandbox missing from engine, reprovisioning");
        self.close_stale_sessions(slot);
        slot.mark(SandboxState::Provisioning);
        match self.provisioner.provision(username, progress).await {
            Ok(id) => {
                slot.install(username, &id);
                Ok(SandboxHandle {
                    sandbox_id: id,
                    created: true,
                    message: format!("Welcome back, {username}! Your sandbox was recreated."),
                })
            }
            Err(e) => {
                *slot.record.lock() = None;
                Err(e.into())
            }
        }
    }

    fn close_stale_sessions(&self, slot: &Slot) {
        let stale = slot.record.lock().as_ref().map(|r| r.container_id.clone());
        if let Some(id) = stale {
            self.terminals.close_sandbox(&id);
        }
    }

    /// Destroys the user's sandbox and home directory and builds a new one.
    pub async fn reset(
        &self,
        username: &str,
        progress: Option<&ProgressSink>,
    ) -> Result<SandboxHandle, LifecycleError> {
        if !valid_username(username) {
            return Err(LifecycleError::InvalidIdentity(username.to_string()));
        }
        let slot = self.slot(username);
        let _op = slot.op.lock().await;

        let old = slot.mark(SandboxState::Resetting);
        if let Some(old) = &old {
            let closed = self.terminals.close_sandbox(old);
            debug!(username, container = %old, closed, "Closed sessions before reset");
        }

        let target = old.clone().unwrap_or_else(|| container_name(username));
        if let Err(e) = self.provisioner.teardown(&target).await {
            slot.mark(SandboxState::Running);
            return Err(ProvisionError::from_runtime(e, ProvisionError::Create).into());
        }
        self.provisioner.release_storage(username).await;

        slot.mark(SandboxState::Provisioning);
        let id = match self.provisioner.provision(username, progress).await {
            Ok(id) => id,
            Err(e) => {
                *slot.record.lock() = None;
                return Err(e.into());
            }
        };
        slot.install(username, &id);
        info!(username, old = ?old, new = %id, "Sandbox reset");

        let handle = SandboxHandle {
            sandbox_id: id,
            created: true,
            message: "Sandbox reset. You have a fresh environment.".to_string(),
        };
        report(progress, 100, &handle.message);
        Ok(handle)
    }

    /// Records activity. Never fails; untracked or removed sandboxes are ignored.
    pub fn touch(&self, username: &str) {
        let Some(slot) = self.slots.get(username).map(|s| s.value().clone()) else {
            return;
        };
        let mut record = slot.record.lock();
        if let Some(r) = record.as_mut().filter(|r| r.state != SandboxState::Removed) {
            r.last_activity = Instant::now();
        }
    }

    /// Touches the sandbox and returns when it will be reclaimed if left idle.
    pub fn extend(&self, username: &str) -> Result<DateTime<Utc>, LifecycleError> {
        let slot = self
            .slots
            .get(username)
            .map(|s| s.value().clone())
            .ok_or_else(|| LifecycleError::SandboxNotFound(username.to_string()))?;
        let mut record = slot.record.lock();
        match record.as_mut() {
            Some(r) if r.state != SandboxState::Removed => r.last_activity = Instant::now(),
            _ => return Err(LifecycleError::SandboxNotFound(username.to_string())),
        }
        let grace = chrono::Duration::from_std(self.config.idle_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        Ok(Utc::now() + grace)
    }

    /// Tears down every sandbox idle for longer than the configured timeout.
    /// Returns the usernames that were reclaimed.
    pub async fn sweep(&self) -> Vec<String> {
        let threshold = self.config.idle_timeout;
        let candidates: Vec<(String, Arc<Slot>)> = self
            .slots
            .iter()
            .filter(|entry| is_idle(&entry.value().record.lock(), threshold))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut reclaimed = Vec::new();
        for (username, slot) in candidates {
            let _op = slot.op.lock().await;

            // A touch that landed since the scan above wins.
            let container_id = {
                let mut record = slot.record.lock();
                if !is_idle(&record, threshold) {
                    debug!(username = %username, "Sandbox became active again, skipping");
                    continue;
                }
                match record.as_mut() {
                    Some(r) => {
                        r.state = SandboxState::Removed;
                        r.container_id.clone()
                    }
                    None => continue,
                }
            };

            self.terminals.close_sandbox(&container_id);
            match self.provisioner.teardown(&container_id).await {
                Ok(()) => {
                    *slot.record.lock() = None;
                    self.provisioner.release_storage(&username).await;
                    info!(username = %username, container = %container_id, "Reclaimed idle sandbox");
                    reclaimed.push(username);
                }
                Err(e) => {
                    warn!(username = %username, error = %e, "Engine unavailable during sweep, retrying next cycle");
                    slot.mark(SandboxState::Running);
                }
            }
        }
        reclaimed
    }

    /// Runs [`sweep`](Self::sweep) every `sweep_interval` until aborted.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let reclaimed = manager.sweep().await;
                if !reclaimed.is_empty() {
                    info!(count = reclaimed.len(), users = ?reclaimed, "Idle sweep finished");
                }
            }
        })
    }

    pub fn list_active(&self) -> Vec<ActiveSandbox> {
        let now = Utc::now();
        let mut active: Vec<ActiveSandbox> = self
            .slots
            .iter()
            .filter_map(|entry| {
                let record = entry.value().record.lock();
                let r = record.as_ref().filter(|r| r.state == SandboxState::Running)?;
                Some(ActiveSandbox {
                    username: r.username.clone(),
                    sandbox_id: r.container_id.clone(),
                    created_at: r.created_at,
                    uptime_secs: (now - r.created_at).num_seconds().max(0),
                    idle_secs: r.last_activity.elapsed().as_secs(),
                })
            })
            .collect();
        active.sort_by(|a, b| a.username.cmp(&b.username));
        active
    }

    pub fn record(&self, username: &str) -> Option<SandboxRecord> {
        let slot = self.slots.get(username).map(|s| s.value().clone())?;
        let record = slot.record.lock().clone();
        record
    }

    /// Starts tracking sandboxes left behind by a previous process so the
    /// sweep can reclaim them. Returns how many were adopted.
    pub async fn adopt_existing(&self) -> Result<usize, RuntimeError> {
        let mut adopted = 0;
        for info in self.runtime.list_by_name(NAME_PREFIX).await? {
            let Some(username) = username_of(&info.name) else {
                continue;
            };
            let slot = self.slot(username);
            if slot.record.lock().is_some() {
                continue;
            }
            slot.install(username, &info.id);
            adopted += 1;
            debug!(username, container = %info.id, running = info.running, "Adopted sandbox");
        }
        if adopted > 0 {
            info!(adopted, "Adopted existing sandboxes");
        }
        Ok(adopted)
    }
}

fn is_idle(record: &Option<SandboxRecord>, threshold: Duration) -> bool {
    record
        .as_ref()
        .is_some_and(|r| r.state == SandboxState::Running && r.last_activity.elapsed() > threshold)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::FileCredentialStore;
    use crate::runtime::MemoryRuntime;
    use crate::terminal::testing::LoopbackPty;
    use tokio::sync::mpsc;

    struct Harness {
        runtime: Arc<MemoryRuntime>,
        credentials: Arc<FileCredentialStore>,
        terminals: Arc<TerminalMultiplexer>,
        manager: Arc<LifecycleManager>,
        _storage: tempfile::TempDir,
    }

    fn harness(idle_timeout: Duration) -> Harness {
        harness_with(idle_timeout, Arc::new(FileCredentialStore::in_memory()))
    }

    fn harness_with(idle_timeout: Duration, credentials: Arc<FileCredentialStore>) -> Harness {
        let storage = tempfile::tempdir().unwrap();
        let config = Config {
            storage_root: storage.path().to_path_buf(),
            idle_timeout,
            ..Config::default()
        };
        let runtime = Arc::new(MemoryRuntime::new());
        let terminals = Arc::new(TerminalMultiplexer::new(Arc::new(LoopbackPty::new())));
        let manager = Arc::new(LifecycleManager::new(
            runtime.clone(),
            credentials.clone(),
            terminals.clone(),
            Arc::new(config),
        ));
        Harness {
            runtime,
            credentials,
            terminals,
            manager,
            _storage: storage,
        }
    }

    const LONG: Duration = Duration::from_secs(3600);
    const SHORT: Duration = Duration::from_millis(150);

    #[tokio::test]
    async fn bob_logs_in_twice_and_survives_a_wrong_password() {
        let h = harness(LONG);

        let first = h.manager.resolve("bob", "secret1", None).await.unwrap();
        assert!(first.created);

        let second = h.manager.resolve("bob", "secret1", None).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.sandbox_id, first.sandbox_id);

        let err = h.manager.resolve("bob", "wrong-pass", None).await.unwrap_err();
        assert!(matches!(err, LifecycleError::AuthenticationFailed(_)));

        let third = h.manager.resolve("bob", "secret1", None).await.unwrap();
        assert_eq!(third.sandbox_id, first.sandbox_id);
        assert_eq!(h.runtime.create_count(), 1);
    }

    #[tokio::test]
    async fn wrong_password_leaves_record_untouched() {
        let h = harness(LONG);
        h.manager.resolve("bob", "secret1", None).await.unwrap();
        let before = h.manager.record("bob").unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        h.manager.resolve("bob", "nope-nope", None).await.unwrap_err();

        assert_eq!(h.manager.record("bob").unwrap(), before);
    }

    #[tokio::test]
    async fn validates_identity_before_anything_else() {
        let h = harness(LONG);

        assert!(h.manager.resolve("al", "secret1", None).await.is_ok());
        for bad in ["Al1", "a-"] {
            let err = h.manager.resolve(bad, "secret1", None).await.unwrap_err();
            assert!(matches!(err, LifecycleError::InvalidIdentity(_)), "{bad}");
        }
        let err = h.manager.resolve("carol", "12345", None).await.unwrap_err();
        assert!(matches!(err, LifecycleError::WeakCredential { min: 6 }));

        assert_eq!(h.runtime.create_count(), 1);
        assert!(h.credentials.get_user("carol").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_resolves_create_one_sandbox() {
        let h = harness(LONG);
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let manager = h.manager.clone();
                tokio::spawn(async move { manager.resolve("bob", "secret1", None).await })
            })
            .collect();

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap().unwrap());
        }
        assert_eq!(h.runtime.create_count(), 1);
        assert_eq!(handles.iter().filter(|h| h.created).count(), 1);
        assert!(handles.iter().all(|x| x.sandbox_id == handles[0].sandbox_id));
    }

    #[tokio::test]
    async fn stuck_provision_does_not_block_other_users() {
        let h = harness(LONG);
        // Image and network are shared; get them out of the way first.
        h.manager.resolve("alice", "secret0", None).await.unwrap();

        let gate = h
            .runtime
            .hold_name(&crate::provision::container_name("bob"))
            .await;
        let bob = {
            let manager = h.manager.clone();
            tokio::spawn(async move { manager.resolve("bob", "secret1", None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!bob.is_finished());

        let carol = tokio::time::timeout(
            Duration::from_secs(10),
            h.manager.resolve("carol", "secret2", None),
        )
        .await
        .expect("carol waited on bob's provisioning")
        .unwrap();
        assert!(carol.created);
        h.manager.touch("alice");
        assert!(h.manager.extend("alice").is_ok());
        assert!(!bob.is_finished());

        drop(gate);
        let bob = bob.await.unwrap().unwrap();
        assert!(bob.created);
        assert_eq!(h.runtime.create_count(), 3);
    }

    #[tokio::test]
    async fn restarts_stopped_and_recreates_missing_sandboxes() {
        let h = harness(LONG);
        let first = h.manager.resolve("bob", "secret1", None).await.unwrap();

        h.runtime.force_stop(&first.sandbox_id);
        let again = h.manager.resolve("bob", "secret1", None).await.unwrap();
        assert_eq!(again.sandbox_id, first.sandbox_id);
        assert!(h.runtime.is_running(&first.sandbox_id));

        h.runtime.force_remove(&first.sandbox_id);
        let rebuilt = h.manager.resolve("bob", "secret1", None).await.unwrap();
        assert_ne!(rebuilt.sandbox_id, first.sandbox_id);
        assert!(rebuilt.created);
        assert_eq!(h.runtime.container_count(), 1);
    }

    #[tokio::test]
    async fn reports_progress_up_to_completion() {
        let h = harness(LONG);
        let (tx, mut rx) = mpsc::unbounded_channel();
        h.manager.resolve("bob", "secret1", Some(&tx)).await.unwrap();
        drop(tx);

        let mut seen = Vec::new();
        while let Some(p) = rx.recv().await {
            seen.push(p.percent);
        }
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "{seen:?}");
        assert_eq!(seen.last(), Some(&100));
    }

    #[tokio::test]
    async fn reset_replaces_container_and_closes_sessions() {
        let h = harness(LONG);
        let before = h.manager.resolve("bob", "secret1", None).await.unwrap();
        let (_session, mut output) = h.terminals.attach(&before.sandbox_id, "bob", 80, 24).unwrap();

        let after = h.manager.reset("bob", None).await.unwrap();

        assert_ne!(after.sandbox_id, before.sandbox_id);
        assert!(!h.runtime.exists(&before.sandbox_id));
        assert!(h.runtime.is_running(&after.sandbox_id));
        assert_eq!(h.terminals.session_count(), 0);
        assert!(output.recv().await.is_none());
        // Credentials survive a reset.
        assert!(h.credentials.verify_password("bob", "secret1").await.unwrap());
    }

    #[tokio::test]
    async fn sweep_reclaims_only_idle_sandboxes() {
        let h = harness(SHORT);
        let bob = h.manager.resolve("bob", "secret1", None).await.unwrap();
        h.terminals.attach(&bob.sandbox_id, "bob", 80, 24).unwrap();
        tokio::time::sleep(SHORT * 2).await;
        h.manager.resolve("carol", "secret2", None).await.unwrap();

        let reclaimed = h.manager.sweep().await;

        assert_eq!(reclaimed, vec!["bob".to_string()]);
        assert!(!h.runtime.exists(&bob.sandbox_id));
        assert_eq!(h.runtime.remove_count(), 1);
        assert!(h.manager.record("bob").is_none());
        assert!(h.manager.record("carol").is_some());
        assert_eq!(h.terminals.session_count(), 0);
        assert!(h.credentials.get_user("bob").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sweep_leaves_fresh_sandboxes_alone() {
        let h = harness(LONG);
        h.manager.resolve("bob", "secret1", None).await.unwrap();
        assert!(h.manager.sweep().await.is_empty());
        assert_eq!(h.runtime.container_count(), 1);
    }

    #[tokio::test]
    async fn touch_before_destructive_step_prevents_removal() {
        let h = harness(SHORT);
        h.manager.resolve("bob", "secret1", None).await.unwrap();
        tokio::time::sleep(SHORT * 2).await;

        // Park the sweep right after its scan by holding the user's op lock.
        let slot = h.manager.slot("bob");
        let op = slot.op.lock().await;
        let manager = h.manager.clone();
        let sweep = tokio::spawn(async move { manager.sweep().await });
        tokio::time::sleep(Duration::from_millis(5)).await;

        h.manager.touch("bob");
        drop(op);

        assert!(sweep.await.unwrap().is_empty());
        assert_eq!(h.runtime.container_count(), 1);
        assert_eq!(h.manager.record("bob").unwrap().state, SandboxState::Running);
    }

    #[tokio::test]
    async fn sweep_retries_when_engine_is_down() {
        let h = harness(SHORT);
        h.manager.resolve("bob", "secret1", None).await.unwrap();
        tokio::time::sleep(SHORT * 2).await;

        h.runtime.set_unavailable(true);
        assert!(h.manager.sweep().await.is_empty());
        assert_eq!(h.manager.record("bob").unwrap().state, SandboxState::Running);

        h.runtime.set_unavailable(false);
        assert_eq!(h.manager.sweep().await, vec!["bob".to_string()]);
    }

    #[tokio::test]
    async fn touch_after_removal_is_a_no_op() {
        let h = harness(SHORT);
        h.manager.resolve("bob", "secret1", None).await.unwrap();
        tokio::time::sleep(SHORT * 2).await;
        h.manager.sweep().await;

        h.manager.touch("bob");
        h.manager.touch("nobody");
        assert!(h.manager.record("bob").is_none());
        assert!(matches!(
            h.manager.extend("bob").unwrap_err(),
            LifecycleError::SandboxNotFound(_)
        ));
    }

    #[tokio::test]
    async fn extend_returns_deadline_one_timeout_away() {
        let h = harness(LONG);
        h.manager.resolve("bob", "secret1", None).await.unwrap();
        let deadline = h.manager.extend("bob").unwrap();
        let remaining = deadline - Utc::now();
        assert!(remaining.num_seconds() > 3500 && remaining.num_seconds() <= 3600);
    }

    #[tokio::test]
    async fn setup_failure_leaves_nothing_behind() {
        let h = harness(LONG);
        h.runtime.set_fail_setup(true);

        let err = h.manager.resolve("bob", "secret1", None).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Provision(ProvisionError::Setup(_))));
        assert_eq!(h.runtime.container_count(), 0);
        assert!(h.manager.record("bob").is_none());
        assert!(h.credentials.get_user("bob").await.unwrap().is_none());

        h.runtime.set_fail_setup(false);
        assert!(h.manager.resolve("bob", "secret1", None).await.unwrap().created);
    }

    #[tokio::test]
    async fn failed_registration_rolls_back_container() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        // Persisting goes through `users.json.tmp`; a directory there makes it fail.
        std::fs::create_dir(dir.path().join("users.json.tmp")).unwrap();
        let credentials = Arc::new(FileCredentialStore::open(path).await.unwrap());
        let h = harness_with(LONG, credentials);

        let err = h.manager.resolve("bob", "secret1", None).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Provision(ProvisionError::Registration(_))));
        assert_eq!(h.runtime.container_count(), 0);
        assert!(h.manager.record("bob").is_none());
    }

    #[tokio::test]
    async fn adopts_leftover_containers() {
        let h = harness(LONG);
        h.manager.resolve("bob", "secret1", None).await.unwrap();

        let restarted = LifecycleManager::new(
            h.runtime.clone(),
            h.credentials.clone(),
            h.terminals.clone(),
            Arc::new(Config::default()),
        );
        assert_eq!(restarted.adopt_existing().await.unwrap(), 1);
        let active = restarted.list_active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].username, "bob");
        assert_eq!(restarted.adopt_existing().await.unwrap(), 0);
    }
}
