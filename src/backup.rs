//! The persistence chain keeps a client servable when the server cannot be reached: the last
//! dataset it received is stored locally, and a static bootstrap payload can stand in before any
//! dataset was ever stored.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};

use crate::dataset::{ClientFeatures, Dataset, DatasetDecoder};
use crate::event::{SyncEvent, SyncListener};

/// The environment variable naming a bootstrap file when none was configured.
pub const BOOTSTRAP_FILE_ENV: &str = "UNLEASH_BOOTSTRAP_FILE";

#[derive(thiserror::Error, Debug)]
pub enum BackupError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Stores the last dataset received so the next start can use it without network access.
pub trait BackupHandler: Send + Sync {
    /// Reads the stored dataset. `Ok(None)` means nothing was stored yet.
    fn read(&self) -> Result<Option<Dataset>, BackupError>;

    /// Replaces the stored dataset.
    fn write(&self, dataset: &Dataset) -> Result<(), BackupError>;
}

/// Keeps the backup as a JSON document in a single file, overwritten on every write.
pub struct FileBackupHandler {
    path: PathBuf,
}

impl FileBackupHandler {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileBackupHandler { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BackupHandler for FileBackupHandler {
    fn read(&self) -> Result<Option<Dataset>, BackupError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!(
                    "Unleash will try to load feature toggle states from temporary backup. Could not find backup file {}. This is expected the first time the client runs in a new environment.",
                    self.path.display()
                );
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        let client_features: ClientFeatures = serde_json::from_reader(BufReader::new(file))?;
        Ok(Some(client_features.into()))
    }

    fn write(&self, dataset: &Dataset) -> Result<(), BackupError> {
        // Create or overwrite file
        let file = File::create(&self.path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &dataset.to_client_features())?;
        writer.flush()?;
        Ok(())
    }
}

/// Keeps nothing. For clients that must never touch the file system.
pub struct NoopBackupHandler;

impl BackupHandler for NoopBackupHandler {
    fn read(&self) -> Result<Option<Dataset>, BackupError> {
        Ok(None)
    }

    fn write(&self, _dataset: &Dataset) -> Result<(), BackupError> {
        Ok(())
    }
}

/// A read-only source of an initial features payload, consulted only when no backup exists.
pub trait BootstrapProvider: Send + Sync {
    fn read(&self) -> Option<String>;
}

/// Reads the bootstrap payload from a file.
pub struct FileBootstrapProvider {
    path: PathBuf,
}

impl FileBootstrapProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileBootstrapProvider { path: path.into() }
    }
}

impl BootstrapProvider for FileBootstrapProvider {
    fn read(&self) -> Option<String> {
        let path = &self.path;
        match fs::read_to_string(path) {
            Ok(payload) => Some(payload),
            Err(err) => {
                warn!("Could not read bootstrap file {}: {}", path.display(), err);
                None
            }
        }
    }
}

/// Serves a payload held in memory.
pub struct StaticBootstrapProvider {
    payload: String,
}

impl StaticBootstrapProvider {
    pub fn new(payload: impl Into<String>) -> Self {
        StaticBootstrapProvider {
            payload: payload.into(),
        }
    }
}

impl BootstrapProvider for StaticBootstrapProvider {
    fn read(&self) -> Option<String> {
        Some(self.payload.clone())
    }
}

/// Orders the sources of an initial dataset: the backup, then the bootstrap payload, then
/// nothing at all.
pub struct PersistenceChain {
    backup: Arc<dyn BackupHandler>,
    bootstrap: Option<Arc<dyn BootstrapProvider>>,
    decoder: Arc<dyn DatasetDecoder>,
}

impl PersistenceChain {
    pub fn new(
        backup: Arc<dyn BackupHandler>,
        bootstrap: Option<Arc<dyn BootstrapProvider>>,
        decoder: Arc<dyn DatasetDecoder>,
    ) -> Self {
        PersistenceChain {
            backup,
            bootstrap,
            decoder,
        }
    }

    /// Finds the dataset to start with. Never fails: an unreadable source is logged and skipped,
    /// and the empty dataset is the last resort.
    pub fn load(&self, listener: &dyn SyncListener) -> Dataset {
        match self.backup.read() {
            Ok(Some(dataset)) if !dataset.is_empty() => {
                listener.on_event(&SyncEvent::BackupRestored {
                    features: dataset.len(),
                });
                return dataset;
            }
            Ok(_) => {}
            Err(err) => {
                warn!("Failed to read backup: {}", err);
                listener.on_event(&SyncEvent::error(format!("failed to read backup: {}", err)));
            }
        }

        if let Some(dataset) = self.load_bootstrap(listener) {
            listener.on_event(&SyncEvent::BootstrapLoaded {
                features: dataset.len(),
            });
            return dataset;
        }

        Dataset::default()
    }

    fn load_bootstrap(&self, listener: &dyn SyncListener) -> Option<Dataset> {
        let payload = self.bootstrap.as_ref()?.read()?;
        match self.decoder.decode(&payload) {
            Ok(dataset) if !dataset.is_empty() => Some(dataset),
            Ok(_) => None,
            Err(err) => {
                warn!("Failed to decode bootstrap payload: {}", err);
                listener.on_event(&SyncEvent::error(format!(
                    "failed to decode bootstrap payload: {}",
                    err
                )));
                None
            }
        }
    }

    /// Stores `dataset` as the new backup. A failed write is reported but otherwise ignored.
    pub fn save(&self, dataset: &Dataset, listener: &dyn SyncListener) {
        match self.backup.write(dataset) {
            Ok(()) => listener.on_event(&SyncEvent::BackupWritten {
                features: dataset.len(),
            }),
            Err(err) => {
                warn!("Unleash was unable to backup feature toggles: {}", err);
                listener.on_event(&SyncEvent::error(format!("failed to write backup: {}", err)));
            }
        }
    }
}
