//! Docker implementation of [`SandboxRuntime`] on top of bollard.

use super::{ContainerInfo, ContainerSpec, ExecOutput, SandboxRuntime};
use crate::error::RuntimeError;
use async_trait::async_trait;
use bollard::errors::Error as BollardError;
use bollard::exec::{StartExecOptions, StartExecResults};
use bollard::models::{
    ContainerCreateBody, ContainerSummaryStateEnum, ExecConfig, HostConfig, NetworkCreateRequest,
};
use bollard::query_parameters::{
    BuildImageOptionsBuilder, CreateContainerOptionsBuilder, CreateImageOptionsBuilder,
    ListContainersOptions, RemoveContainerOptionsBuilder, StopContainerOptionsBuilder,
};
use bollard::{body_full, Docker};
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use tracing::{debug, info};

/// Paths under /proc and /sys a sandbox must not read or write.
const MASKED_PATHS: &[&str] = &[
    "/proc/kcore",
    "/proc/keys",
    "/proc/timer_list",
    "/proc/sched_debug",
    "/sys/firmware",
    "/proc/scsi",
];

const READONLY_PATHS: &[&str] = &[
    "/proc/bus",
    "/proc/fs",
    "/proc/irq",
    "/proc/sys",
    "/proc/sysrq-trigger",
];

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects using `DOCKER_HOST` or the platform's default socket.
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        Ok(Self { docker })
    }

    /// Fails with [`RuntimeError::Unavailable`] when the daemon is unreachable.
    pub async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await.map_err(classify)?;
        Ok(())
    }
}

fn classify(err: BollardError) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::Engine(format!("{status_code}: {message}")),
        // Errors reported inside a progress stream (failed pulls or builds).
        BollardError::DockerStreamError { error } => RuntimeError::Engine(error),
        other => RuntimeError::Unavailable(other.to_string()),
    }
}

fn split_image(image: &str) -> (&str, &str) {
    // Registry ports contain ':' too, so only split after the last '/'.
    let name_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[name_start..].rfind(':') {
        Some(i) => (&image[..name_start + i], &image[name_start + i + 1..]),
        None => (image, "latest"),
    }
}

/// A build context holding nothing but `Dockerfile`.
fn dockerfile_context(dockerfile: &str) -> std::io::Result<Vec<u8>> {
    let mut header = tar::Header::new_gnu();
    header.set_size(dockerfile.len() as u64);
    header.set_mode(0o644);
    let mut archive = tar::Builder::new(Vec::new());
    archive.append_data(&mut header, "Dockerfile", dockerfile.as_bytes())?;
    archive.into_inner()
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) => match classify(e) {
                RuntimeError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        let (from_image, tag) = split_image(image);
        info!(image, "Pulling sandbox image");
        self.docker
            .create_image(
                Some(
                    CreateImageOptionsBuilder::new()
                        .from_image(from_image)
                        .tag(tag)
                        .build(),
                ),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn build_image(&self, image: &str, dockerfile: &str) -> Result<(), RuntimeError> {
        let context = dockerfile_context(dockerfile)
            .map_err(|e| RuntimeError::Engine(format!("build context: {e}")))?;
        let options = BuildImageOptionsBuilder::new()
            .dockerfile("Dockerfile")
            .t(image)
            .rm(true)
            .build();

        info!(image, "Building sandbox image");
        let steps = self
            .docker
            .build_image(options, None, Some(body_full(Bytes::from(context))))
            .try_collect::<Vec<_>>()
            .await
            .map_err(classify)?;
        for step in steps {
            if let Some(detail) = step.error_detail {
                return Err(RuntimeError::Engine(
                    detail
                        .message
                        .unwrap_or_else(|| "image build failed".to_string()),
                ));
            }
            if let Some(line) = step.stream.as_deref().map(str::trim) {
                if !line.is_empty() {
                    debug!(image, "{line}");
                }
            }
        }
        Ok(())
    }

    async fn ensure_network(&self, name: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .inspect_network(name, None::<bollard::query_parameters::InspectNetworkOptions>)
            .await
        {
            Ok(_) => return Ok(()),
            Err(e) => match classify(e) {
                RuntimeError::NotFound(_) => {}
                other => return Err(other),
            },
        }

        info!(network = name, "Creating isolated network");
        let request = NetworkCreateRequest {
            name: name.to_string(),
            driver: Some("bridge".to_string()),
            options: Some(HashMap::from([(
                "com.docker.network.bridge.enable_icc".to_string(),
                "false".to_string(),
            )])),
            ..Default::default()
        };
        self.docker.create_network(request).await.map_err(classify)?;
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let host_config = HostConfig {
            memory: Some(spec.limits.memory_bytes),
            cpu_shares: Some(spec.limits.cpu_shares),
            pids_limit: Some(spec.limits.pids),
            network_mode: Some(spec.network.clone()),
            binds: Some(spec.binds.clone()),
            cap_drop: Some(vec!["ALL".to_string()]),
            cap_add: Some(spec.cap_add.clone()),
            masked_paths: Some(MASKED_PATHS.iter().map(|p| p.to_string()).collect()),
            readonly_paths: Some(READONLY_PATHS.iter().map(|p| p.to_string()).collect()),
            readonly_rootfs: Some(false),
            ..HostConfig::default()
        };

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            hostname: Some(spec.hostname.clone()),
            env: Some(spec.env.clone()),
            working_dir: Some(spec.working_dir.clone()),
            cmd: Some(vec!["/bin/bash".to_string()]),
            tty: Some(true),
            open_stdin: Some(true),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..ContainerCreateBody::default()
        };

        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&spec.name).build()),
                body,
            )
            .await
            .map_err(classify)?;
        debug!(name = %spec.name, id = %response.id, "Container created");
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<bollard::query_parameters::StartContainerOptions>)
            .await
            .map_err(classify)
    }

    async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .stop_container(id, Some(StopContainerOptionsBuilder::new().t(5).build()))
            .await
            .map_err(classify)
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptionsBuilder::new().force(true).v(true).build()),
            )
            .await
            .map_err(classify)
    }

    async fn exec(&self, id: &str, cmd: Vec<String>) -> Result<ExecOutput, RuntimeError> {
        let config = ExecConfig {
            cmd: Some(cmd),
            user: Some("root".to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self.docker.create_exec(id, config).await.map_err(classify)?;

        let mut output = String::new();
        match self
            .docker
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await
            .map_err(classify)?
        {
            StartExecResults::Attached { output: mut stream, .. } => {
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(classify)?;
                    output.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
                }
            }
            StartExecResults::Detached => {}
        }

        let inspect = self.docker.inspect_exec(&exec.id).await.map_err(classify)?;
        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            output,
        })
    }

    async fn inspect(&self, name_or_id: &str) -> Result<Option<ContainerInfo>, RuntimeError> {
        match self
            .docker
            .inspect_container(name_or_id, None::<bollard::query_parameters::InspectContainerOptions>)
            .await
        {
            Ok(response) => Ok(Some(ContainerInfo {
                id: response.id.unwrap_or_default(),
                name: response
                    .name
                    .unwrap_or_default()
                    .trim_start_matches('/')
                    .to_string(),
                running: response.state.and_then(|s| s.running).unwrap_or(false),
            })),
            Err(e) => match classify(e) {
                RuntimeError::NotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn list_by_name(&self, prefix: &str) -> Result<Vec<ContainerInfo>, RuntimeError> {
        let options = ListContainersOptions {
            all: true,
            filters: Some(HashMap::from([(
                "name".to_string(),
                vec![prefix.to_string()],
            )])),
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(classify)?;

        // The engine's name filter is a substring match.
        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let name = c
                    .names?
                    .into_iter()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .find(|n| n.starts_with(prefix))?;
                Some(ContainerInfo {
                    id: c.id?,
                    name,
                    running: c.state == Some(ContainerSummaryStateEnum::RUNNING),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_image_references() {
        assert_eq!(split_image("ubuntu:22.04"), ("ubuntu", "22.04"));
        assert_eq!(split_image("ubuntu"), ("ubuntu", "latest"));
        assert_eq!(
            split_image("registry.local:5000/team/box:v2"),
            ("registry.local:5000/team/box", "v2")
        );
        assert_eq!(
            split_image("registry.local:5000/team/box"),
            ("registry.local:5000/team/box", "latest")
        );
    }

    #[test]
    fn build_context_holds_only_the_dockerfile() {
        let context = dockerfile_context("FROM ubuntu:22.04\n").unwrap();
        let mut archive = tar::Archive::new(&context[..]);
        let mut entries: Vec<(String, String)> = archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let path = entry.path().unwrap().display().to_string();
                let mut body = String::new();
                std::io::Read::read_to_string(&mut entry, &mut body).unwrap();
                (path, body)
            })
            .collect();
        assert_eq!(entries.len(), 1);
        let (path, body) = entries.remove(0);
        assert_eq!(path, "Dockerfile");
        assert_eq!(body, "FROM ubuntu:22.04\n");
    }

    #[test]
    fn classifies_engine_errors() {
        let missing = classify(BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container".into(),
        });
        assert!(missing.is_not_found());

        let conflict = classify(BollardError::DockerResponseServerError {
            status_code: 409,
            message: "name in use".into(),
        });
        assert!(matches!(conflict, RuntimeError::Engine(_)));

        let denied = classify(BollardError::DockerStreamError {
            error: "pull access denied for fishbowl-sandbox".into(),
        });
        assert!(matches!(denied, RuntimeError::Engine(_)));
    }
}
