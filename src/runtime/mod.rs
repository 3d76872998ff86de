//! Container engine boundary.
//!
//! The lifecycle manager only talks to the engine through [`SandboxRuntime`].
//! [`docker::DockerRuntime`] is the production implementation. With the
//! `testing` feature, `memory::MemoryRuntime` keeps containers in a map.

pub mod docker;
#[cfg(any(test, feature = "testing"))]
pub mod memory;

use crate::config::Limits;
use crate::error::RuntimeError;
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{info, warn};

pub use docker::DockerRuntime;
#[cfg(any(test, feature = "testing"))]
pub use memory::MemoryRuntime;

/// Everything needed to create one sandbox container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub hostname: String,
    pub env: Vec<String>,
    pub working_dir: String,
    /// `host:container[:mode]` bind mounts.
    pub binds: Vec<String>,
    pub network: String,
    pub limits: Limits,
    pub cap_add: Vec<String>,
    pub labels: HashMap<String, String>,
}

/// What the engine reports about a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub running: bool,
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Where [`SandboxRuntime::ensure_image`] found the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    Local,
    Pulled,
    Built,
}

#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError>;

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Builds `dockerfile` (with an otherwise empty context) and tags it `image`.
    async fn build_image(&self, image: &str, dockerfile: &str) -> Result<(), RuntimeError>;

    /// Makes sure `image` exists locally: a local copy wins, then a registry
    /// pull, then a build from `dockerfile`.
    async fn ensure_image(&self, image: &str, dockerfile: &str) -> Result<ImageSource, RuntimeError> {
        if self.image_exists(image).await? {
            return Ok(ImageSource::Local);
        }
        match self.pull_image(image).await {
            Ok(()) => {
                info!(image, "Pulled sandbox image");
                return Ok(ImageSource::Pulled);
            }
            Err(e @ RuntimeError::Unavailable(_)) => return Err(e),
            Err(e) => warn!(image, error = %e, "Pull failed, building image locally"),
        }
        self.build_image(image, dockerfile).await?;
        info!(image, "Built sandbox image");
        Ok(ImageSource::Built)
    }

    /// Makes sure the isolated bridge network exists.
    async fn ensure_network(&self, name: &str) -> Result<(), RuntimeError>;

    /// Creates (but does not start) a container, returning its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    async fn stop(&self, id: &str) -> Result<(), RuntimeError>;

    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;

    /// Runs `cmd` as root inside a running container and waits for it.
    async fn exec(&self, id: &str, cmd: Vec<String>) -> Result<ExecOutput, RuntimeError>;

    /// Looks a container up by name or id. `Ok(None)` means the engine does
    /// not know it.
    async fn inspect(&self, name_or_id: &str) -> Result<Option<ContainerInfo>, RuntimeError>;

    /// Lists all containers (running or not) whose name starts with `prefix`.
    async fn list_by_name(&self, prefix: &str) -> Result<Vec<ContainerInfo>, RuntimeError>;
}
