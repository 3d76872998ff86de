//! An engine that lives in a `HashMap`. Used by the test suites to drive the
//! lifecycle manager without a Docker daemon.

use super::{ContainerInfo, ContainerSpec, ExecOutput, SandboxRuntime};
use crate::error::RuntimeError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

#[derive(Debug, Clone)]
struct MemContainer {
    name: String,
    running: bool,
    spec: ContainerSpec,
}

#[derive(Default)]
pub struct MemoryRuntime {
    containers: Mutex<HashMap<String, MemContainer>>,
    execs: Mutex<Vec<(String, Vec<String>)>>,
    /// Images present locally.
    images: Mutex<HashSet<String>>,
    /// Images a pull can fetch.
    registry: Mutex<HashSet<String>>,
    builds: Mutex<Vec<(String, String)>>,
    next_id: AtomicUsize,
    creates: AtomicUsize,
    removes: AtomicUsize,
    pulls: AtomicUsize,
    unavailable: AtomicBool,
    fail_setup: AtomicBool,
    fail_build: AtomicBool,
    gates: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stalls `inspect` and `create_container` calls for container `name`
    /// until the returned guard is dropped.
    pub async fn hold_name(&self, name: &str) -> OwnedRwLockWriteGuard<()> {
        let gate = self
            .gates
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone();
        gate.write_owned().await
    }

    /// Makes `image` available to `pull_image`.
    pub fn publish(&self, image: &str) {
        self.registry.lock().insert(image.to_string());
    }

    pub fn set_fail_build(&self, fail: bool) {
        self.fail_build.store(fail, Ordering::SeqCst);
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.images.lock().contains(image)
    }

    /// `(tag, dockerfile)` for every build, in call order.
    pub fn builds(&self) -> Vec<(String, String)> {
        self.builds.lock().clone()
    }

    /// Makes every call fail as if the daemon were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes post-start `exec` calls exit non-zero.
    pub fn set_fail_setup(&self, fail: bool) {
        self.fail_setup.store(fail, Ordering::SeqCst);
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn remove_count(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }

    /// Pull attempts, successful or not.
    pub fn pull_count(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn container_count(&self) -> usize {
        self.containers.lock().len()
    }

    pub fn exists(&self, id: &str) -> bool {
        self.containers.lock().contains_key(id)
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.containers.lock().get(id).is_some_and(|c| c.running)
    }

    pub fn spec_of(&self, id: &str) -> Option<ContainerSpec> {
        self.containers.lock().get(id).map(|c| c.spec.clone())
    }

    /// Commands passed to `exec`, in call order.
    pub fn exec_log(&self) -> Vec<(String, Vec<String>)> {
        self.execs.lock().clone()
    }

    /// Stops a container behind the manager's back, as `docker stop` would.
    pub fn force_stop(&self, id: &str) {
        if let Some(c) = self.containers.lock().get_mut(id) {
            c.running = false;
        }
    }

    /// Deletes a container behind the manager's back, as `docker rm -f` would.
    pub fn force_remove(&self, id: &str) {
        self.containers.lock().remove(id);
    }

    fn enter(&self) -> Result<(), RuntimeError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RuntimeError::Unavailable("memory engine offline".into()));
        }
        Ok(())
    }

    /// Waits while a test holds the gate for `name_or_id`.
    async fn pass_gate(&self, name_or_id: &str) {
        let name = self
            .containers
            .lock()
            .get(name_or_id)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| name_or_id.to_string());
        let gate = self.gates.lock().get(&name).cloned();
        if let Some(gate) = gate {
            let _passed = gate.read().await;
        }
    }

    fn resolve_id(&self, name_or_id: &str) -> Option<String> {
        let containers = self.containers.lock();
        if containers.contains_key(name_or_id) {
            return Some(name_or_id.to_string());
        }
        containers
            .iter()
            .find(|(_, c)| c.name == name_or_id)
            .map(|(id, _)| id.clone())
    }
}

#[async_trait]
impl SandboxRuntime for MemoryRuntime {
    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        self.enter()?;
        Ok(self.has_image(image))
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.enter()?;
        self.pulls.fetch_add(1, Ordering::SeqCst);
        if !self.registry.lock().contains(image) {
            return Err(RuntimeError::NotFound(format!(
                "pull access denied for {image}"
            )));
        }
        self.images.lock().insert(image.to_string());
        Ok(())
    }

    async fn build_image(&self, image: &str, dockerfile: &str) -> Result<(), RuntimeError> {
        self.enter()?;
        self.builds
            .lock()
            .push((image.to_string(), dockerfile.to_string()));
        if self.fail_build.load(Ordering::SeqCst) {
            return Err(RuntimeError::Engine("build step exited with 100".into()));
        }
        self.images.lock().insert(image.to_string());
        Ok(())
    }

    async fn ensure_network(&self, _name: &str) -> Result<(), RuntimeError> {
        self.enter()?;
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.pass_gate(&spec.name).await;
        self.enter()?;
        if !self.has_image(&spec.image) {
            return Err(RuntimeError::NotFound(format!("no such image: {}", spec.image)));
        }
        let mut containers = self.containers.lock();
        if containers.values().any(|c| c.name == spec.name) {
            return Err(RuntimeError::Engine(format!(
                "409: container name {} already in use",
                spec.name
            )));
        }
        let id = format!("mem{:08}", self.next_id.fetch_add(1, Ordering::SeqCst));
        containers.insert(
            id.clone(),
            MemContainer {
                name: spec.name.clone(),
                running: false,
                spec: spec.clone(),
            },
        );
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.enter()?;
        let id = self
            .resolve_id(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        if let Some(c) = self.containers.lock().get_mut(&id) {
            c.running = true;
        }
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        self.enter()?;
        let id = self
            .resolve_id(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        if let Some(c) = self.containers.lock().get_mut(&id) {
            c.running = false;
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.enter()?;
        let id = self
            .resolve_id(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        self.containers.lock().remove(&id);
        self.removes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn exec(&self, id: &str, cmd: Vec<String>) -> Result<ExecOutput, RuntimeError> {
        self.enter()?;
        if !self.is_running(id) {
            return Err(RuntimeError::Engine(format!("409: container {id} is not running")));
        }
        self.execs.lock().push((id.to_string(), cmd));
        if self.fail_setup.load(Ordering::SeqCst) {
            return Ok(ExecOutput {
                exit_code: 1,
                output: "useradd: failure".into(),
            });
        }
        Ok(ExecOutput {
            exit_code: 0,
            output: String::new(),
        })
    }

    async fn inspect(&self, name_or_id: &str) -> Result<Option<ContainerInfo>, RuntimeError> {
        self.pass_gate(name_or_id).await;
        self.enter()?;
        let Some(id) = self.resolve_id(name_or_id) else {
            return Ok(None);
        };
        Ok(self.containers.lock().get(&id).map(|c| ContainerInfo {
            id: id.clone(),
            name: c.name.clone(),
            running: c.running,
        }))
    }

    async fn list_by_name(&self, prefix: &str) -> Result<Vec<ContainerInfo>, RuntimeError> {
        self.enter()?;
        let mut found: Vec<ContainerInfo> = self
            .containers
            .lock()
            .iter()
            .filter(|(_, c)| c.name.starts_with(prefix))
            .map(|(id, c)| ContainerInfo {
                id: id.clone(),
                name: c.name.clone(),
                running: c.running,
            })
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }
}
