use log::{debug, info, warn};

/// Everything noteworthy the synchronization layer does, delivered to a [SyncListener].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncEvent {
    /// The first refresh succeeded. Sent at most once per controller.
    Ready,
    /// A refresh got an answer from the server; `changed` is false for a not-modified response.
    FeaturesFetched { changed: bool, features: usize },
    /// The initial dataset came from the backup.
    BackupRestored { features: usize },
    /// The initial dataset came from the bootstrap payload.
    BootstrapLoaded { features: usize },
    /// A new dataset was written to the backup.
    BackupWritten { features: usize },
    /// Something went wrong. Never fatal by itself.
    Error { message: String },
}

impl SyncEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::Ready => "ready",
            SyncEvent::FeaturesFetched { .. } => "features-fetched",
            SyncEvent::BackupRestored { .. } => "backup-restored",
            SyncEvent::BootstrapLoaded { .. } => "bootstrap-loaded",
            SyncEvent::BackupWritten { .. } => "backup-written",
            SyncEvent::Error { .. } => "error",
        }
    }

    pub(crate) fn error(error: impl std::fmt::Display) -> SyncEvent {
        SyncEvent::Error {
            message: error.to_string(),
        }
    }
}

/// Receives [SyncEvent]s. Called from whichever task produced the event, so implementations
/// must not block.
pub trait SyncListener: Send + Sync {
    fn on_event(&self, event: &SyncEvent);
}

/// The default listener: writes every event to the log.
#[derive(Clone, Debug, Default)]
pub struct LoggingListener;

impl SyncListener for LoggingListener {
    fn on_event(&self, event: &SyncEvent) {
        match event {
            SyncEvent::Ready => info!("Unleash client is ready"),
            SyncEvent::FeaturesFetched { changed, features } => debug!(
                "fetched features: changed={} features={}",
                changed, features
            ),
            SyncEvent::BackupRestored { features } => {
                info!("restored {} features from backup", features)
            }
            SyncEvent::BootstrapLoaded { features } => {
                info!("loaded {} features from bootstrap", features)
            }
            SyncEvent::BackupWritten { features } => {
                debug!("wrote {} features to backup", features)
            }
            SyncEvent::Error { message } => warn!("{}", message),
        }
    }
}
