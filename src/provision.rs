//! Building a sandbox container from nothing: image, network, host storage,
//! container, post-start setup.

use crate::config::Config;
use crate::error::{ProvisionError, RuntimeError};
use crate::runtime::{ContainerSpec, ImageSource, SandboxRuntime};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, info, warn};

/// Every sandbox container is named `sandbox-<username>`.
pub const NAME_PREFIX: &str = "sandbox-";

pub const MAX_USERNAME_LEN: usize = 32;

/// Built and tagged as the configured image when it cannot be found or pulled.
pub const SANDBOX_DOCKERFILE: &str = include_str!("../docker/sandbox.Dockerfile");

const CAPABILITIES: &[&str] = &[
    "CHOWN",
    "DAC_OVERRIDE",
    "FOWNER",
    "SETGID",
    "SETUID",
    "AUDIT_WRITE",
];

pub fn container_name(username: &str) -> String {
    format!("{NAME_PREFIX}{username}")
}

/// Inverse of [`container_name`]; `None` for containers we did not create.
pub fn username_of(container_name: &str) -> Option<&str> {
    container_name
        .strip_prefix(NAME_PREFIX)
        .filter(|u| valid_username(u))
}

/// `^[a-z][a-z0-9_-]{0,31}$`, not ending in `-`.
pub fn valid_username(username: &str) -> bool {
    let bytes = username.as_bytes();
    match bytes.first() {
        Some(b) if b.is_ascii_lowercase() => {}
        _ => return false,
    }
    bytes.len() <= MAX_USERNAME_LEN
        && !username.ends_with('-')
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'_' || *b == b'-')
}

/// A provisioning milestone. `percent` only grows; 100 is the last one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub percent: u8,
    pub message: String,
}

pub type ProgressSink = mpsc::UnboundedSender<Progress>;

pub(crate) fn report(sink: Option<&ProgressSink>, percent: u8, message: &str) {
    if let Some(sink) = sink {
        // A client that went away mid-provision is not an error.
        let _ = sink.send(Progress {
            percent,
            message: message.to_string(),
        });
    }
}

pub struct Provisioner {
    runtime: Arc<dyn SandboxRuntime>,
    config: Arc<Config>,
    image_ready: OnceCell<()>,
    network_ready: OnceCell<()>,
}

impl Provisioner {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, config: Arc<Config>) -> Self {
        Self {
            runtime,
            config,
            image_ready: OnceCell::new(),
            network_ready: OnceCell::new(),
        }
    }

    pub fn storage_dir(&self, username: &str) -> PathBuf {
        self.config.storage_root.join(username)
    }

    /// Creates and starts a fresh sandbox for `username`, returning the
    /// container id. On failure nothing half-built is left in the engine.
    pub async fn provision(
        &self,
        username: &str,
        progress: Option<&ProgressSink>,
    ) -> Result<String, ProvisionError> {
        report(progress, 10, "Preparing sandbox image");
        self.image_ready
            .get_or_try_init(|| async {
                let source = self
                    .runtime
                    .ensure_image(&self.config.image, SANDBOX_DOCKERFILE)
                    .await
                    .map_err(|e| match e {
                        RuntimeError::Unavailable(msg) => ProvisionError::EngineUnavailable(msg),
                        other => ProvisionError::Image {
                            image: self.config.image.clone(),
                            reason: other.to_string(),
                        },
                    })?;
                if source != ImageSource::Local {
                    info!(image = %self.config.image, ?source, "Sandbox image ready");
                }
                Ok::<(), ProvisionError>(())
            })
            .await?;

        report(progress, 20, "Preparing isolated network");
        self.network_ready
            .get_or_try_init(|| async {
                self.runtime
                    .ensure_network(&self.config.network)
                    .await
                    .map_err(|e| ProvisionError::from_runtime(e, ProvisionError::Create))
            })
            .await?;

        report(progress, 30, "Preparing home directory");
        let storage = self.storage_dir(username);
        tokio::fs::create_dir_all(&storage).await?;

        let name = container_name(username);
        self.remove_stale(&name).await?;

        report(progress, 40, "Creating container");
        let spec = self.container_spec(username, &storage);
        let id = self
            .runtime
            .create_container(&spec)
            .await
            .map_err(|e| ProvisionError::from_runtime(e, ProvisionError::Create))?;

        report(progress, 60, "Starting container");
        if let Err(e) = self.runtime.start(&id).await {
            self.rollback(&id).await;
            return Err(ProvisionError::from_runtime(e, ProvisionError::Start));
        }

        report(progress, 80, "Configuring user environment");
        if let Err(e) = self.setup_user(&id, username).await {
            self.rollback(&id).await;
            return Err(e);
        }

        info!(username, container = %id, "Sandbox provisioned");
        Ok(id)
    }

    /// Stops and removes a container; a container the engine no longer knows
    /// counts as removed. Only `Unavailable` is reported back.
    pub async fn teardown(&self, container: &str) -> Result<(), RuntimeError> {
        match self.runtime.stop(container).await {
            Ok(()) => {}
            Err(RuntimeError::Unavailable(msg)) => return Err(RuntimeError::Unavailable(msg)),
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => debug!(container, error = %e, "Stop failed, removing anyway"),
        }
        match self.runtime.remove(container).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(RuntimeError::Unavailable(msg)) => Err(RuntimeError::Unavailable(msg)),
            Err(e) => {
                warn!(container, error = %e, "Failed to remove container");
                Ok(())
            }
        }
    }

    /// Deletes the user's home directory on the host.
    pub async fn release_storage(&self, username: &str) {
        let dir = self.storage_dir(username);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!(username, "Released sandbox storage"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(username, path = %dir.display(), error = %e, "Failed to release storage"),
        }
    }

    fn container_spec(&self, username: &str, storage: &std::path::Path) -> ContainerSpec {
        let home = format!("/home/{username}");
        ContainerSpec {
            name: container_name(username),
            image: self.config.image.clone(),
            hostname: format!("fishbowl-{username}"),
            env: vec![
                format!("USER={username}"),
                format!("HOME={home}"),
                "TERM=xterm-256color".to_string(),
                "TMOUT=0".to_string(),
            ],
            working_dir: home.clone(),
            binds: vec![format!("{}:{home}", storage.display())],
            network: self.config.network.clone(),
            limits: self.config.limits.clone(),
            cap_add: CAPABILITIES.iter().map(|c| c.to_string()).collect(),
            labels: HashMap::from([
                ("fishbowl.user".to_string(), username.to_string()),
                ("fishbowl.managed".to_string(), "true".to_string()),
            ]),
        }
    }

    /// An orphan holding our deterministic name would make `create` fail.
    async fn remove_stale(&self, name: &str) -> Result<(), ProvisionError> {
        let stale = self
            .runtime
            .inspect(name)
            .await
            .map_err(|e| ProvisionError::from_runtime(e, ProvisionError::Create))?;
        if let Some(stale) = stale {
            info!(container = name, id = %stale.id, "Removing stale container");
            self.teardown(&stale.id)
                .await
                .map_err(|e| ProvisionError::from_runtime(e, ProvisionError::Create))?;
        }
        Ok(())
    }

    async fn setup_user(&self, id: &str, username: &str) -> Result<(), ProvisionError> {
        for (step, script) in setup_steps(username) {
            let out = self
                .runtime
                .exec(id, vec!["bash".into(), "-c".into(), script])
                .await
                .map_err(|e| ProvisionError::from_runtime(e, ProvisionError::Setup))?;
            if !out.success() {
                return Err(ProvisionError::Setup(format!(
                    "{step} exited with {}: {}",
                    out.exit_code,
                    out.output.trim()
                )));
            }
            debug!(username, step, "Setup step done");
        }
        Ok(())
    }

    async fn rollback(&self, id: &str) {
        if let Err(e) = self.runtime.remove(id).await {
            if !e.is_not_found() {
                warn!(container = id, error = %e, "Rollback of half-created container failed");
            }
        }
    }
}

/// The fixed post-start script, split into named steps. `username` must
/// already have passed [`valid_username`], which keeps it shell-safe.
pub fn setup_steps(username: &str) -> Vec<(&'static str, String)> {
    let home = format!("/home/{username}");
    vec![
        (
            "create-user",
            format!(
                "id -u {username} >/dev/null 2>&1 || useradd -M -d {home} -s /bin/bash {username}\n\
                 cp -rn /etc/skel/. {home}/ 2>/dev/null || true\n\
                 chown {username}:{username} {home}"
            ),
        ),
        (
            "sudoers",
            format!(
                "mkdir -p /etc/sudoers.d\n\
                 cat > /etc/sudoers.d/fishbowl-{username} <<'EOF'\n\
                 {sudoers}EOF\n\
                 chmod 0440 /etc/sudoers.d/fishbowl-{username}",
                sudoers = sudoers_policy(username)
            ),
        ),
        (
            "shell-profile",
            format!(
                "grep -q '# fishbowl' {home}/.bashrc 2>/dev/null || cat >> {home}/.bashrc <<'EOF'\n\
                 # fishbowl\n\
                 export TMOUT=0\n\
                 export HISTSIZE=1000\n\
                 export HISTFILESIZE=2000\n\
                 export PS1='\\u@fishbowl:\\w\\$ '\n\
                 [ -f ~/welcome.txt ] && cat ~/welcome.txt\n\
                 EOF\n\
                 chown {username}:{username} {home}/.bashrc"
            ),
        ),
        (
            "welcome",
            format!(
                "cat > {home}/welcome.txt <<'EOF'\n\
                 {welcome}EOF\n\
                 chown {username}:{username} {home}/welcome.txt",
                welcome = welcome_text(username)
            ),
        ),
    ]
}

/// Passwordless sudo for package and service management only.
pub fn sudoers_policy(username: &str) -> String {
    format!(
        "Cmnd_Alias FISHBOWL_ADMIN = /usr/bin/apt, /usr/bin/apt-get, /usr/bin/dpkg, \
         /usr/sbin/service, /usr/bin/systemctl\n\
         Cmnd_Alias FISHBOWL_DENY = /bin/su, /usr/bin/su, /usr/bin/sudo, /bin/mount, \
         /usr/bin/mount, /bin/umount, /usr/bin/umount, /usr/sbin/chroot, /bin/sh, \
         /bin/bash, /usr/bin/sh, /usr/bin/bash, /bin/dash\n\
         Defaults:{username} !lecture\n\
         {username} ALL=(root) NOPASSWD: FISHBOWL_ADMIN, !FISHBOWL_DENY\n"
    )
}

fn welcome_text(username: &str) -> String {
    format!(
        "Welcome to the fishbowl, {username}.\n\
         \n\
         This is your own Linux sandbox. Everyone in the room can watch\n\
         this terminal, so keep secrets out of it.\n\
         \n\
         - Install packages with: sudo apt-get install <package>\n\
         - Your files live in {home} until the sandbox is reset or idles out.\n\
         - Idle sandboxes are reclaimed after a while; type something to stay.\n",
        home = format!("/home/{username}")
    )
}
