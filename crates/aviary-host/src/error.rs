use aviary_instance::InstanceId;
use aviary_instance::manifest::ManifestError;

/// Errors surfaced at the management boundary. Everything a caller can
/// observe maps onto one of these; worker-internal failures never do.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("instance not found: {0}")]
    NotFound(InstanceId),
    #[error("instance is owned by another user")]
    Forbidden,
    #[error("instance already running: {0}")]
    AlreadyRunning(InstanceId),
    #[error("instance not running: {0}")]
    NotRunning(InstanceId),
    #[error(transparent)]
    Invalid(#[from] aviary_instance::ValidationError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
