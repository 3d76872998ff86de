//! Error types shared across the lifecycle manager, terminal multiplexer and
//! runtime adapter.

use thiserror::Error;

/// Errors surfaced by the container engine adapter.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The engine answered, but the container/image does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The engine could not be reached at all.
    #[error("container engine unavailable: {0}")]
    Unavailable(String),

    /// The engine rejected the request.
    #[error("container engine error: {0}")]
    Engine(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }
}

/// Provisioning failures. Any partially created container has been rolled
/// back by the time one of these is returned, so the caller may retry.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("container engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("failed to prepare image {image}: {reason}")]
    Image { image: String, reason: String },

    #[error("failed to prepare storage: {0}")]
    Storage(#[from] std::io::Error),

    #[error("failed to create container: {0}")]
    Create(String),

    #[error("failed to start container: {0}")]
    Start(String),

    #[error("post-start setup failed: {0}")]
    Setup(String),

    #[error("failed to register user: {0}")]
    Registration(String),
}

impl ProvisionError {
    /// Classifies an engine error raised during a given provisioning step.
    pub fn from_runtime(err: RuntimeError, step: fn(String) -> ProvisionError) -> Self {
        match err {
            RuntimeError::Unavailable(msg) => ProvisionError::EngineUnavailable(msg),
            other => step(other.to_string()),
        }
    }
}

/// Errors returned by [`crate::lifecycle::LifecycleManager`] operations.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("invalid username: {0}")]
    InvalidIdentity(String),

    #[error("password must be at least {min} characters")]
    WeakCredential { min: usize },

    #[error("authentication failed for {0}")]
    AuthenticationFailed(String),

    #[error("no sandbox tracked for {0}")]
    SandboxNotFound(String),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error("credential store error: {0}")]
    Credentials(#[from] CredentialError),
}

/// Errors returned by [`crate::terminal::TerminalMultiplexer`].
#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("failed to spawn pty: {0}")]
    SpawnError(String),

    #[error("terminal session not found: {0}")]
    SessionNotFound(String),

    #[error("pty i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by the credential store.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("user already exists: {0}")]
    AlreadyExists(String),

    #[error("credential file i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("credential file is corrupt: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("password hashing failed: {0}")]
    Hash(String),
}
