use std::collections::HashMap;
use std::sync::Arc;

use lazy_static::lazy_static;
use log::error;
use parking_lot::Mutex;

use crate::config::SyncConfig;
use crate::error::SyncError;

lazy_static! {
    static ref GLOBAL: Arc<InstanceRegistry> = Arc::new(InstanceRegistry::new());
}

/// Counts the live controllers per client identifier, so that accidentally running several
/// clients with the same identity can be noticed.
///
/// Controllers use [InstanceRegistry::global] unless they were given a registry of their own.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    instances: Mutex<HashMap<String, usize>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        InstanceRegistry::default()
    }

    /// The registry shared by every controller of the process.
    pub fn global() -> Arc<InstanceRegistry> {
        GLOBAL.clone()
    }

    /// Records one more client for `config`'s identity.
    ///
    /// A duplicate is logged; it is refused with [SyncError::InstanceConflict] instead when
    /// `config` asks to fail on multiple instantiations. A refused client is not counted.
    pub fn register(&self, config: &SyncConfig) -> Result<(), SyncError> {
        let mut instances = self.instances.lock();
        let count = instances
            .entry(config.client_identifier())
            .or_insert(0);
        if *count > 0 {
            if config.fail_on_multiple_instantiations() {
                return Err(SyncError::InstanceConflict {
                    app_name: config.app_name().to_string(),
                    instance_id: config.instance_id().to_string(),
                    count: *count,
                });
            }
            error!(
                "You already have {} clients for AppName [{}] with instanceId: [{}] running. Please double check your code where you are instantiating the Unleash client",
                count,
                config.app_name(),
                config.instance_id()
            );
        }
        *count += 1;
        Ok(())
    }

    /// Forgets one client for `config`'s identity.
    pub fn deregister(&self, config: &SyncConfig) {
        let mut instances = self.instances.lock();
        let identifier = config.client_identifier();
        if let Some(count) = instances.get_mut(&identifier) {
            *count -= 1;
            if *count == 0 {
                instances.remove(&identifier);
            }
        }
    }

    /// The number of live clients for `config`'s identity.
    pub fn count(&self, config: &SyncConfig) -> usize {
        self.instances
            .lock()
            .get(&config.client_identifier())
            .copied()
            .unwrap_or(0)
    }
}
