#![cfg(test)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::backup::{BackupError, BackupHandler, BootstrapProvider};
use crate::config::{SyncConfig, SyncConfigBuilder};
use crate::controller::{SyncController, SyncControllerBuilder};
use crate::dataset::{Dataset, DatasetDecoder, JsonDecoder};
use crate::event::{SyncEvent, SyncListener};
use crate::fetch::{FeatureFetcher, FetchError, FetchResponse};
use crate::registry::InstanceRegistry;
use crate::scheduler::{RefreshTask, Scheduler};

pub const FIVE_FEATURES_V2: &str = r#"{
    "version": 2,
    "features": [
        {
            "name": "featureX",
            "description": "guarded by a segment",
            "enabled": true,
            "strategies": [{"name": "default", "parameters": {}, "segments": [1]}],
            "impressionData": false
        },
        {
            "name": "featureY",
            "enabled": false,
            "strategies": [
                {
                    "name": "flexibleRollout",
                    "parameters": {"rollout": "50", "stickiness": "default", "groupId": "featureY"}
                }
            ]
        },
        {
            "name": "featureZ",
            "enabled": true,
            "strategies": [
                {
                    "name": "userWithId",
                    "parameters": {"userIds": "1,2,3"},
                    "constraints": [
                        {"contextName": "environment", "operator": "IN", "values": ["prod", "dev"]},
                        {"contextName": "version", "operator": "SEMVER_GT", "value": "1.2.0", "inverted": true}
                    ]
                }
            ]
        },
        {
            "name": "featureVariants",
            "enabled": true,
            "strategies": [{"name": "default", "parameters": null}],
            "variants": [
                {"name": "blue", "weight": 500, "payload": {"type": "string", "value": "sky"}, "stickiness": "tenant"},
                {"name": "green", "weight": 500, "overrides": [{"contextName": "userId", "values": ["7"]}]}
            ],
            "impressionData": true
        },
        {
            "name": "featureDependent",
            "enabled": true,
            "strategies": [],
            "dependencies": [{"feature": "featureVariants", "variants": ["blue"]}]
        }
    ],
    "segments": [
        {
            "id": 1,
            "name": "internal",
            "constraints": [{"contextName": "email", "operator": "STR_ENDS_WITH", "values": ["@example.com"]}],
            "createdBy": "admin",
            "createdAt": "2023-01-12T09:01:33.812Z"
        }
    ]
}"#;

pub const TWO_FEATURES_V1: &str = r#"{
    "version": 1,
    "features": [
        {"name": "featureA", "enabled": true, "strategies": [{"name": "default"}]},
        {"name": "featureB", "enabled": false, "strategies": [{"name": "default"}]}
    ]
}"#;

pub const ONE_FEATURE_V0: &str = r#"{
    "features": [
        {
            "name": "featureLegacy",
            "enabled": true,
            "strategy": "gradualRolloutRandom",
            "parameters": {"percentage": "50"}
        }
    ]
}"#;

pub fn changed(payload: &str, etag: Option<&str>) -> FetchResponse {
    FetchResponse::Changed {
        payload: payload.to_string(),
        etag: etag.map(str::to_string),
    }
}

pub fn test_config() -> SyncConfigBuilder {
    let mut builder = SyncConfig::builder();
    builder
        .api_url("http://localhost:4242/api")
        .app_name("test-app")
        .instance_id("test-instance");
    builder
}

/// A builder with test doubles for every collaborator: a fetcher that always answers
/// not-modified, an empty in-memory backup, a manual scheduler and a private registry.
pub fn controller_builder_for(config: SyncConfig) -> SyncControllerBuilder {
    let mut builder = SyncController::builder(config);
    builder
        .fetcher(Arc::new(TestFetcher::repeating(FetchResponse::NotChanged)))
        .backup_handler(Arc::new(MemoryBackup::default()))
        .scheduler(Arc::new(ManualScheduler::default()))
        .registry(Arc::new(InstanceRegistry::new()));
    builder
}

pub fn controller_builder() -> SyncControllerBuilder {
    controller_builder_for(test_config().build().unwrap())
}

/// Answers fetches from a script, or with the same response forever.
pub struct TestFetcher {
    script: Mutex<VecDeque<Result<FetchResponse, FetchError>>>,
    repeat: Option<FetchResponse>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    etags: Mutex<Vec<Option<String>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl TestFetcher {
    /// Once the script runs out, every fetch answers not-modified.
    pub fn scripted(script: Vec<Result<FetchResponse, FetchError>>) -> Self {
        TestFetcher {
            script: Mutex::new(script.into()),
            repeat: None,
            delay: None,
            calls: AtomicUsize::new(0),
            etags: Mutex::new(vec![]),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn repeating(response: FetchResponse) -> Self {
        TestFetcher {
            repeat: Some(response),
            ..TestFetcher::scripted(vec![])
        }
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        TestFetcher {
            delay: Some(delay),
            ..self
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn etags(&self) -> Vec<Option<String>> {
        self.etags.lock().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeatureFetcher for TestFetcher {
    async fn fetch_features(&self, etag: Option<&str>) -> Result<FetchResponse, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.etags.lock().push(etag.map(str::to_string));
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(response) = &self.repeat {
            return Ok(response.clone());
        }
        let next = self.script.lock().pop_front();
        next.unwrap_or(Ok(FetchResponse::NotChanged))
    }
}

/// Keeps the backup in memory.
#[derive(Default)]
pub struct MemoryBackup {
    stored: Mutex<Option<Dataset>>,
    writes: AtomicUsize,
    fail_writes: bool,
}

impl MemoryBackup {
    pub fn with_payload(payload: &str) -> Self {
        MemoryBackup {
            stored: Mutex::new(Some(JsonDecoder.decode(payload).unwrap())),
            ..MemoryBackup::default()
        }
    }

    pub fn failing_writes() -> Self {
        MemoryBackup {
            fail_writes: true,
            ..MemoryBackup::default()
        }
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl BackupHandler for MemoryBackup {
    fn read(&self) -> Result<Option<Dataset>, BackupError> {
        Ok(self.stored.lock().clone())
    }

    fn write(&self, dataset: &Dataset) -> Result<(), BackupError> {
        if self.fail_writes {
            return Err(BackupError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only backup",
            )));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        *self.stored.lock() = Some(dataset.clone());
        Ok(())
    }
}

pub struct CountingBootstrap {
    payload: Option<String>,
    reads: AtomicUsize,
}

impl CountingBootstrap {
    pub fn new(payload: Option<&str>) -> Self {
        CountingBootstrap {
            payload: payload.map(str::to_string),
            reads: AtomicUsize::new(0),
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl BootstrapProvider for CountingBootstrap {
    fn read(&self) -> Option<String> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.payload.clone()
    }
}

/// Records what was scheduled and runs it only when asked to.
#[derive(Default)]
pub struct ManualScheduler {
    once: Mutex<Vec<RefreshTask>>,
    once_count: AtomicUsize,
    interval: Mutex<Option<(Duration, Duration)>>,
    shut_down: AtomicBool,
}

impl ManualScheduler {
    pub fn once_count(&self) -> usize {
        self.once_count.load(Ordering::SeqCst)
    }

    /// The initial delay and period of the recurring task, if one was set.
    pub fn interval(&self) -> Option<(Duration, Duration)> {
        *self.interval.lock()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Runs the pending one-off tasks.
    pub async fn run_all(&self) {
        let tasks: Vec<RefreshTask> = self.once.lock().drain(..).collect();
        for task in tasks {
            task.run().await;
        }
    }
}

impl Scheduler for ManualScheduler {
    fn set_interval(&self, _task: RefreshTask, initial_delay: Duration, interval: Duration) {
        *self.interval.lock() = Some((initial_delay, interval));
    }

    fn schedule_once(&self, task: RefreshTask) {
        self.once_count.fetch_add(1, Ordering::SeqCst);
        self.once.lock().push(task);
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<SyncEvent>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().clone()
    }

    pub fn event_names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(SyncEvent::name).collect()
    }
}

impl SyncListener for RecordingListener {
    fn on_event(&self, event: &SyncEvent) {
        self.events.lock().push(event.clone());
    }
}
