use crate::backup::BackupError;
use crate::config::ConfigError;
use crate::dataset::DecodeError;
use crate::fetch::FetchError;
use tokio::sync::AcquireError;

/// Errors surfaced by the synchronization layer.
///
/// During steady-state polling these are only ever reported to the [crate::SyncListener]; they
/// reach a caller directly only from [crate::SyncController::refresh] and from startup when a
/// synchronous first fetch was requested.
#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("could not fetch features: {0}")]
    Fetch(#[from] FetchError),

    #[error("could not decode features: {0}")]
    Decode(#[from] DecodeError),

    #[error("backup failed: {0}")]
    Backup(#[from] BackupError),

    #[error("could not initialize client, got response code {status}{}", location_suffix(.location))]
    Unavailable {
        status: u16,
        location: Option<String>,
    },

    #[error("the client has been shut down")]
    ShutDown(#[from] AcquireError),

    #[error("{count} clients already running for app [{app_name}] with instance id [{instance_id}]")]
    InstanceConflict {
        app_name: String,
        instance_id: String,
        count: usize,
    },
}

fn location_suffix(location: &Option<String>) -> String {
    match location {
        Some(location) => format!(", location: {}", location),
        None => String::new(),
    }
}
