use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{AcquireError, Semaphore, SemaphorePermit};

use crate::backup::{
    BackupHandler, BootstrapProvider, FileBackupHandler, FileBootstrapProvider, PersistenceChain,
};
use crate::config::SyncConfig;
use crate::dataset::{Dataset, DatasetDecoder, JsonDecoder};
use crate::error::SyncError;
use crate::event::{LoggingListener, SyncEvent, SyncListener};
use crate::fetch::{FeatureFetcher, FetchResponse, HttpFeatureFetcher};
use crate::registry::InstanceRegistry;
use crate::scheduler::{RefreshTask, Scheduler, TokioScheduler};
use crate::throttle::Throttler;

/// Decides what happens to an error of the synchronous first fetch. Returning the error aborts
/// startup; returning `Ok` carries on with whatever dataset the persistence chain provided.
pub type StartupFailureHandler = Arc<dyn Fn(SyncError) -> Result<(), SyncError> + Send + Sync>;

/// What a single refresh cycle did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The throttler asked to sit this cycle out; the server was not contacted.
    Skipped,
    /// A new dataset was adopted.
    Changed,
    /// The server confirmed the current dataset.
    NotChanged,
    /// The server answered with an unsuccessful status.
    Unavailable { status: u16 },
    /// The server could not be reached or its answer could not be decoded.
    Failed,
}

/// SyncController keeps a [Dataset] in sync with the server and serves it to evaluators.
///
/// Create one with [SyncController::builder]. The controller starts from the backup (or the
/// bootstrap payload) and refreshes in the background until [SyncController::shutdown] is called
/// or it is dropped.
pub struct SyncController {
    inner: Arc<SyncInner>,
    scheduler: Arc<dyn Scheduler>,
    registry: Arc<InstanceRegistry>,
    shut_down: AtomicBool,
}

impl SyncController {
    pub fn builder(config: SyncConfig) -> SyncControllerBuilder {
        SyncControllerBuilder::new(config)
    }

    /// The current dataset. Later refreshes publish new datasets and never touch this one.
    pub fn dataset(&self) -> Arc<Dataset> {
        self.inner.dataset.read().clone()
    }

    pub fn feature_names(&self) -> Vec<String> {
        self.inner.dataset.read().feature_names()
    }

    /// Whether a refresh was attempted since startup, successful or not.
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Acquire)
    }

    pub fn failures(&self) -> u32 {
        self.inner.throttler.lock().failures()
    }

    pub fn skips(&self) -> u32 {
        self.inner.throttler.lock().skips()
    }

    /// When the server last delivered a new dataset.
    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        *self.inner.last_updated.read()
    }

    /// Runs one refresh cycle now, in line with the scheduled ones.
    pub async fn refresh(&self) -> Result<CycleOutcome, SyncError> {
        self.inner.refresh_cycle().await
    }

    /// Stops background refreshes. A cycle in progress is allowed to finish; further calls to
    /// [SyncController::refresh] fail with [SyncError::ShutDown].
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.scheduler.shutdown();
        self.inner.update_lock.close();
        self.registry.deregister(&self.inner.config);
        debug!("client for {} shut down", self.inner.config.app_name());
    }
}

impl Drop for SyncController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// State shared between a controller and its scheduled refresh tasks.
pub(crate) struct SyncInner {
    config: SyncConfig,
    fetcher: Arc<dyn FeatureFetcher>,
    decoder: Arc<dyn DatasetDecoder>,
    persistence: PersistenceChain,
    listener: Arc<dyn SyncListener>,
    dataset: RwLock<Arc<Dataset>>,
    throttler: Mutex<Throttler>,
    etag: Mutex<Option<String>>,
    update_lock: Semaphore,
    // Set once any refresh attempt has completed.
    ready: AtomicBool,
    // Set once a refresh has succeeded. Gates the Ready event and error classification.
    synced: AtomicBool,
    last_updated: RwLock<Option<DateTime<Utc>>>,
}

impl SyncInner {
    pub(crate) async fn refresh_cycle(&self) -> Result<CycleOutcome, SyncError> {
        // Hold permit for the duration of the cycle
        let _permit = self.get_permit().await?;

        {
            let mut throttler = self.throttler.lock();
            if !throttler.perform_action() {
                throttler.skipped();
                return Ok(CycleOutcome::Skipped);
            }
        }

        let result = self.attempt().await;
        self.ready.store(true, Ordering::Release);
        result
    }

    async fn attempt(&self) -> Result<CycleOutcome, SyncError> {
        let etag = self.etag.lock().clone();
        let response = match self.fetcher.fetch_features(etag.as_deref()).await {
            Ok(response) => response,
            Err(err) => return self.failed(err.into()),
        };

        match response {
            FetchResponse::Changed { payload, etag } => {
                let dataset = match self.decoder.decode(&payload) {
                    Ok(dataset) => Arc::new(dataset),
                    Err(err) => return self.failed(err.into()),
                };
                self.adopt(dataset, etag);
                self.succeeded();
                Ok(CycleOutcome::Changed)
            }
            FetchResponse::NotChanged => {
                self.listener.on_event(&SyncEvent::FeaturesFetched {
                    changed: false,
                    features: self.dataset.read().len(),
                });
                self.succeeded();
                Ok(CycleOutcome::NotChanged)
            }
            FetchResponse::Unavailable { status, location } => {
                let err = SyncError::Unavailable { status, location };
                self.listener.on_event(&SyncEvent::error(&err));
                if self.is_startup_fatal() {
                    return Err(err);
                }
                if self.synced.load(Ordering::Acquire) {
                    self.throttler.lock().handle_http_error(status);
                }
                Ok(CycleOutcome::Unavailable { status })
            }
        }
    }

    fn adopt(&self, dataset: Arc<Dataset>, etag: Option<String>) {
        *self.dataset.write() = dataset.clone();
        *self.etag.lock() = etag;
        *self.last_updated.write() = Some(Utc::now());
        self.listener.on_event(&SyncEvent::FeaturesFetched {
            changed: true,
            features: dataset.len(),
        });
        // A failed write is reported by the chain and does not fail the cycle.
        self.persistence.save(&dataset, self.listener.as_ref());
    }

    fn succeeded(&self) {
        self.throttler.lock().decrement_failure_count_and_reset_skips();
        if !self.synced.swap(true, Ordering::AcqRel) {
            info!("Unleash client for {} is ready", self.config.app_name());
            self.listener.on_event(&SyncEvent::Ready);
        }
    }

    fn failed(&self, err: SyncError) -> Result<CycleOutcome, SyncError> {
        self.listener.on_event(&SyncEvent::error(&err));
        if self.is_startup_fatal() {
            return Err(err);
        }
        Ok(CycleOutcome::Failed)
    }

    fn is_startup_fatal(&self) -> bool {
        self.config.synchronous_fetch_on_init() && !self.synced.load(Ordering::Acquire)
    }

    /// Guard that ensures only one refresh cycle is in progress at a time.
    async fn get_permit(&self) -> Result<SemaphorePermit<'_>, AcquireError> {
        self.update_lock.acquire().await
    }
}

/// Contains methods for configuring a [SyncController].
///
/// Every collaborator has a default: HTTP fetching from the configured URL, a JSON backup file,
/// the configured bootstrap file, a tokio scheduler, a logging listener and the process-wide
/// instance registry.
pub struct SyncControllerBuilder {
    config: SyncConfig,
    fetcher: Option<Arc<dyn FeatureFetcher>>,
    backup: Option<Arc<dyn BackupHandler>>,
    bootstrap: Option<Arc<dyn BootstrapProvider>>,
    decoder: Arc<dyn DatasetDecoder>,
    scheduler: Option<Arc<dyn Scheduler>>,
    listener: Arc<dyn SyncListener>,
    startup_failure_handler: StartupFailureHandler,
    registry: Option<Arc<InstanceRegistry>>,
}

impl SyncControllerBuilder {
    fn new(config: SyncConfig) -> Self {
        SyncControllerBuilder {
            config,
            fetcher: None,
            backup: None,
            bootstrap: None,
            decoder: Arc::new(JsonDecoder),
            scheduler: None,
            listener: Arc::new(LoggingListener),
            startup_failure_handler: Arc::new(|err| Err(err)),
            registry: None,
        }
    }

    pub fn fetcher(&mut self, fetcher: Arc<dyn FeatureFetcher>) -> &mut Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn backup_handler(&mut self, backup: Arc<dyn BackupHandler>) -> &mut Self {
        self.backup = Some(backup);
        self
    }

    pub fn bootstrap(&mut self, bootstrap: Arc<dyn BootstrapProvider>) -> &mut Self {
        self.bootstrap = Some(bootstrap);
        self
    }

    pub fn decoder(&mut self, decoder: Arc<dyn DatasetDecoder>) -> &mut Self {
        self.decoder = decoder;
        self
    }

    pub fn scheduler(&mut self, scheduler: Arc<dyn Scheduler>) -> &mut Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn listener(&mut self, listener: Arc<dyn SyncListener>) -> &mut Self {
        self.listener = listener;
        self
    }

    pub fn startup_failure_handler(&mut self, handler: StartupFailureHandler) -> &mut Self {
        self.startup_failure_handler = handler;
        self
    }

    pub fn registry(&mut self, registry: Arc<InstanceRegistry>) -> &mut Self {
        self.registry = Some(registry);
        self
    }

    /// Creates the controller: restores the initial dataset, performs the synchronous first
    /// fetch if configured, and schedules background refreshes.
    pub async fn start(&self) -> Result<SyncController, SyncError> {
        let config = self.config.clone();

        let fetcher: Arc<dyn FeatureFetcher> = match &self.fetcher {
            Some(fetcher) => fetcher.clone(),
            None => Arc::new(HttpFeatureFetcher::new(&config)?),
        };
        let backup: Arc<dyn BackupHandler> = match &self.backup {
            Some(backup) => backup.clone(),
            None => Arc::new(FileBackupHandler::new(config.backup_file())),
        };
        let bootstrap: Option<Arc<dyn BootstrapProvider>> = match &self.bootstrap {
            Some(bootstrap) => Some(bootstrap.clone()),
            None => config
                .bootstrap_file()
                .map(|path| Arc::new(FileBootstrapProvider::new(path)) as Arc<dyn BootstrapProvider>),
        };
        let scheduler: Arc<dyn Scheduler> = match &self.scheduler {
            Some(scheduler) => scheduler.clone(),
            None => Arc::new(TokioScheduler::new()),
        };
        let registry = self.registry.clone().unwrap_or_else(InstanceRegistry::global);

        registry.register(&config)?;

        let persistence = PersistenceChain::new(backup, bootstrap, self.decoder.clone());
        let initial = persistence.load(self.listener.as_ref());
        debug!("starting with {} features", initial.len());

        let fetch_interval = config.fetch_interval();
        let throttler = Throttler::new(
            fetch_interval.as_secs(),
            config.max_backoff_interval().as_secs(),
            config.fetch_url().as_str(),
        );
        let inner = Arc::new(SyncInner {
            fetcher,
            decoder: self.decoder.clone(),
            persistence,
            listener: self.listener.clone(),
            dataset: RwLock::new(Arc::new(initial)),
            throttler: Mutex::new(throttler),
            etag: Mutex::new(None),
            update_lock: Semaphore::new(1),
            ready: AtomicBool::new(false),
            synced: AtomicBool::new(false),
            last_updated: RwLock::new(None),
            config,
        });
        // From here on, dropping the controller deregisters it.
        let controller = SyncController {
            inner,
            scheduler,
            registry,
            shut_down: AtomicBool::new(false),
        };

        let synchronous = controller.inner.config.synchronous_fetch_on_init();
        if synchronous {
            if let Err(err) = controller.inner.refresh_cycle().await {
                (self.startup_failure_handler)(err)?;
            }
        }

        let task = RefreshTask::new(controller.inner.clone());
        if !controller.inner.config.disable_polling() && !fetch_interval.is_zero() {
            // The synchronous fetch already covered the first tick.
            let initial_delay = if synchronous {
                fetch_interval
            } else {
                Duration::ZERO
            };
            controller
                .scheduler
                .set_interval(task, initial_delay, fetch_interval);
        } else if !synchronous {
            controller.scheduler.schedule_once(task);
        }

        Ok(controller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupHandler;
    use crate::fetch::FetchError;
    use crate::test_common::{
        changed, controller_builder, controller_builder_for, test_config, CountingBootstrap,
        ManualScheduler, MemoryBackup, RecordingListener, TestFetcher, FIVE_FEATURES_V2,
        TWO_FEATURES_V1,
    };
    use spectral::prelude::*;

    #[tokio::test]
    async fn test_cold_start_with_polling_disabled() {
        let config = test_config().disable_polling(true).build().unwrap();
        let scheduler = Arc::new(ManualScheduler::default());
        let fetcher = Arc::new(TestFetcher::repeating(FetchResponse::Unavailable {
            status: 503,
            location: None,
        }));

        let controller = controller_builder_for(config)
            .fetcher(fetcher.clone())
            .scheduler(scheduler.clone())
            .start()
            .await
            .unwrap();

        assert_that!(controller.feature_names()).is_empty();
        assert!(!controller.is_ready());
        assert_eq!(scheduler.once_count(), 1);
        assert_that!(scheduler.interval()).is_none();

        scheduler.run_all().await;

        assert_eq!(fetcher.calls(), 1);
        assert!(controller.is_ready());
        assert_that!(controller.feature_names()).is_empty();
    }

    #[tokio::test]
    async fn test_zero_interval_schedules_a_single_refresh() {
        let config = test_config().fetch_interval(Duration::ZERO).build().unwrap();
        let scheduler = Arc::new(ManualScheduler::default());

        let _controller = controller_builder_for(config)
            .scheduler(scheduler.clone())
            .start()
            .await
            .unwrap();

        assert_eq!(scheduler.once_count(), 1);
        assert_that!(scheduler.interval()).is_none();
    }

    #[tokio::test]
    async fn test_polling_is_scheduled_immediately_and_then_every_interval() {
        let scheduler = Arc::new(ManualScheduler::default());

        let _controller = controller_builder()
            .scheduler(scheduler.clone())
            .start()
            .await
            .unwrap();

        assert_eq!(scheduler.once_count(), 0);
        assert_that!(scheduler.interval())
            .contains_value((Duration::ZERO, Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn test_backup_wins_over_bootstrap() {
        let bootstrap = Arc::new(CountingBootstrap::new(Some(TWO_FEATURES_V1)));
        let listener = Arc::new(RecordingListener::default());

        let controller = controller_builder()
            .backup_handler(Arc::new(MemoryBackup::with_payload(FIVE_FEATURES_V2)))
            .bootstrap(bootstrap.clone())
            .listener(listener.clone())
            .start()
            .await
            .unwrap();

        assert_that!(controller.feature_names()).has_length(5);
        assert_eq!(bootstrap.reads(), 0);
        assert_eq!(listener.event_names(), vec!["backup-restored"]);
    }

    #[tokio::test]
    async fn test_bootstrap_used_without_backup() {
        let bootstrap = Arc::new(CountingBootstrap::new(Some(TWO_FEATURES_V1)));

        let controller = controller_builder()
            .bootstrap(bootstrap.clone())
            .start()
            .await
            .unwrap();

        assert_that!(controller.feature_names()).has_length(2);
        assert_eq!(bootstrap.reads(), 1);
    }

    #[tokio::test]
    async fn test_changed_payload_is_adopted_and_backed_up() {
        let backup = Arc::new(MemoryBackup::default());
        let fetcher = Arc::new(TestFetcher::scripted(vec![
            Ok(changed(TWO_FEATURES_V1, Some("\"etag-1\""))),
            Ok(FetchResponse::NotChanged),
        ]));
        let listener = Arc::new(RecordingListener::default());
        let controller = controller_builder()
            .fetcher(fetcher.clone())
            .backup_handler(backup.clone())
            .listener(listener.clone())
            .start()
            .await
            .unwrap();
        let before = controller.dataset();

        assert_that!(controller.refresh().await).is_ok_containing(CycleOutcome::Changed);
        assert_that!(controller.feature_names()).has_length(2);
        assert_that!(before.len()).is_equal_to(0);
        assert_that!(controller.last_updated()).is_some();
        assert_eq!(backup.writes(), 1);
        assert_that!(backup.read().unwrap().unwrap().len()).is_equal_to(2);

        assert_that!(controller.refresh().await).is_ok_containing(CycleOutcome::NotChanged);
        assert_eq!(fetcher.etags(), vec![None, Some("\"etag-1\"".to_string())]);
        assert_eq!(backup.writes(), 1);
        assert_eq!(
            listener.event_names(),
            vec!["features-fetched", "backup-written", "ready", "features-fetched"]
        );
    }

    #[tokio::test]
    async fn test_ready_event_is_sent_once() {
        let listener = Arc::new(RecordingListener::default());
        let controller = controller_builder()
            .fetcher(Arc::new(TestFetcher::repeating(FetchResponse::NotChanged)))
            .listener(listener.clone())
            .start()
            .await
            .unwrap();

        for _ in 0..3 {
            controller.refresh().await.unwrap();
        }

        let readies = listener
            .events()
            .into_iter()
            .filter(|event| *event == SyncEvent::Ready)
            .count();
        assert_eq!(readies, 1);
    }

    #[tokio::test]
    async fn test_not_found_after_ready_maximizes_skips_and_ramps_down() {
        let mut script = vec![Ok(FetchResponse::NotChanged), Ok(unavailable(404))];
        script.push(Ok(FetchResponse::NotChanged));
        let fetcher = Arc::new(TestFetcher::scripted(script));
        let controller = controller_builder()
            .fetcher(fetcher.clone())
            .start()
            .await
            .unwrap();

        controller.refresh().await.unwrap();
        assert_that!(controller.refresh().await)
            .is_ok_containing(CycleOutcome::Unavailable { status: 404 });
        assert_eq!(controller.failures(), 1);
        assert_eq!(controller.skips(), 30);

        for remaining in (0..30).rev() {
            assert_that!(controller.refresh().await).is_ok_containing(CycleOutcome::Skipped);
            assert_eq!(controller.skips(), remaining);
        }
        assert_eq!(fetcher.calls(), 2);

        assert_that!(controller.refresh().await).is_ok_containing(CycleOutcome::NotChanged);
        assert_eq!(controller.failures(), 0);
        assert_eq!(controller.skips(), 0);
    }

    #[tokio::test]
    async fn test_repeated_not_found_after_skipping_backs_off_again() {
        let fetcher = Arc::new(TestFetcher::scripted(vec![
            Ok(FetchResponse::NotChanged),
            Ok(unavailable(404)),
            Ok(unavailable(404)),
        ]));
        let controller = controller_builder().fetcher(fetcher).start().await.unwrap();

        controller.refresh().await.unwrap();
        controller.refresh().await.unwrap();
        for _ in 0..30 {
            controller.refresh().await.unwrap();
        }
        controller.refresh().await.unwrap();

        assert_eq!(controller.failures(), 2);
        assert_eq!(controller.skips(), 30);
    }

    #[tokio::test]
    async fn test_rate_limiting_ramps_up_and_down() {
        let fetcher = Arc::new(TestFetcher::scripted(vec![
            Ok(FetchResponse::NotChanged),
            Ok(unavailable(429)),
            Ok(unavailable(429)),
            Ok(FetchResponse::NotChanged),
        ]));
        let controller = controller_builder().fetcher(fetcher).start().await.unwrap();

        controller.refresh().await.unwrap();
        controller.refresh().await.unwrap();
        assert_eq!((controller.failures(), controller.skips()), (1, 1));

        assert_that!(controller.refresh().await).is_ok_containing(CycleOutcome::Skipped);
        controller.refresh().await.unwrap();
        assert_eq!((controller.failures(), controller.skips()), (2, 2));

        controller.refresh().await.unwrap();
        controller.refresh().await.unwrap();
        assert_that!(controller.refresh().await).is_ok_containing(CycleOutcome::NotChanged);
        assert_eq!((controller.failures(), controller.skips()), (1, 1));
    }

    #[tokio::test]
    async fn test_errors_before_first_success_are_not_throttled() {
        let fetcher = Arc::new(TestFetcher::repeating(unavailable(500)));
        let controller = controller_builder()
            .fetcher(fetcher.clone())
            .start()
            .await
            .unwrap();

        for _ in 0..3 {
            assert_that!(controller.refresh().await)
                .is_ok_containing(CycleOutcome::Unavailable { status: 500 });
        }
        assert_eq!(fetcher.calls(), 3);
        assert_eq!((controller.failures(), controller.skips()), (0, 0));
        assert!(controller.is_ready());
    }

    #[tokio::test]
    async fn test_synchronous_startup_failure_aborts_by_default() {
        let config = test_config().synchronous_fetch_on_init(true).build().unwrap();
        let registry = Arc::new(InstanceRegistry::new());

        let result = controller_builder_for(config.clone())
            .fetcher(Arc::new(TestFetcher::repeating(unavailable(401))))
            .registry(registry.clone())
            .start()
            .await;

        let err = result.err().expect("startup should fail");
        assert!(matches!(err, SyncError::Unavailable { status: 401, .. }));
        assert_eq!(registry.count(&config), 0);
    }

    #[tokio::test]
    async fn test_synchronous_startup_failure_can_be_swallowed() {
        let config = test_config().synchronous_fetch_on_init(true).build().unwrap();
        let scheduler = Arc::new(ManualScheduler::default());

        let controller = controller_builder_for(config)
            .fetcher(Arc::new(TestFetcher::repeating(unavailable(500))))
            .backup_handler(Arc::new(MemoryBackup::with_payload(TWO_FEATURES_V1)))
            .scheduler(scheduler.clone())
            .startup_failure_handler(Arc::new(|_| Ok(())))
            .start()
            .await
            .unwrap();

        assert!(controller.is_ready());
        assert_that!(controller.feature_names()).has_length(2);
        assert_that!(scheduler.interval())
            .contains_value((Duration::from_secs(10), Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn test_synchronous_startup_adopts_fetched_features() {
        let config = test_config().synchronous_fetch_on_init(true).build().unwrap();
        let fetcher = Arc::new(TestFetcher::scripted(vec![Ok(changed(FIVE_FEATURES_V2, None))]));

        let controller = controller_builder_for(config)
            .fetcher(fetcher.clone())
            .start()
            .await
            .unwrap();

        assert_eq!(fetcher.calls(), 1);
        assert!(controller.is_ready());
        assert_that!(controller.feature_names()).has_length(5);
    }

    #[tokio::test]
    async fn test_transport_failure_during_synchronous_startup_is_fatal() {
        let config = test_config().synchronous_fetch_on_init(true).build().unwrap();
        let fetcher = Arc::new(TestFetcher::scripted(vec![Err(FetchError::InvalidRedirect(
            "::".to_string(),
        ))]));

        let result = controller_builder_for(config).fetcher(fetcher).start().await;

        assert!(matches!(result, Err(SyncError::Fetch(_))));
    }

    #[tokio::test]
    async fn test_undecodable_payload_keeps_last_dataset() {
        let listener = Arc::new(RecordingListener::default());
        let backup = Arc::new(MemoryBackup::with_payload(FIVE_FEATURES_V2));
        let fetcher = Arc::new(TestFetcher::scripted(vec![
            Ok(changed("{\"features\": 12}", Some("\"bad\""))),
            Ok(FetchResponse::NotChanged),
        ]));
        let controller = controller_builder()
            .fetcher(fetcher.clone())
            .backup_handler(backup.clone())
            .listener(listener.clone())
            .start()
            .await
            .unwrap();

        assert_that!(controller.refresh().await).is_ok_containing(CycleOutcome::Failed);
        assert_that!(controller.feature_names()).has_length(5);
        assert_eq!(backup.writes(), 0);
        assert!(controller.is_ready());
        assert_eq!(listener.event_names(), vec!["backup-restored", "error"]);

        // The token of a payload that was not adopted is not presented again.
        controller.refresh().await.unwrap();
        assert_eq!(fetcher.etags(), vec![None, None]);
    }

    #[tokio::test]
    async fn test_failed_backup_write_does_not_fail_the_cycle() {
        let fetcher = Arc::new(TestFetcher::scripted(vec![Ok(changed(TWO_FEATURES_V1, None))]));
        let controller = controller_builder()
            .fetcher(fetcher)
            .backup_handler(Arc::new(MemoryBackup::failing_writes()))
            .start()
            .await
            .unwrap();

        assert_that!(controller.refresh().await).is_ok_containing(CycleOutcome::Changed);
        assert_that!(controller.feature_names()).has_length(2);
        assert_eq!(controller.failures(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_do_not_overlap() {
        let fetcher = Arc::new(
            TestFetcher::repeating(FetchResponse::NotChanged).with_delay(Duration::from_millis(20)),
        );
        let controller = controller_builder()
            .fetcher(fetcher.clone())
            .start()
            .await
            .unwrap();

        let (a, b, c) = tokio::join!(controller.refresh(), controller.refresh(), controller.refresh());
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(fetcher.calls(), 3);
        assert_eq!(fetcher.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_refreshes_and_deregisters() {
        let registry = Arc::new(InstanceRegistry::new());
        let scheduler = Arc::new(ManualScheduler::default());
        let config = test_config().build().unwrap();
        let controller = controller_builder_for(config.clone())
            .scheduler(scheduler.clone())
            .registry(registry.clone())
            .start()
            .await
            .unwrap();
        assert_eq!(registry.count(&config), 1);

        controller.shutdown();
        controller.shutdown();

        assert!(scheduler.is_shut_down());
        assert_eq!(registry.count(&config), 0);
        assert!(matches!(controller.refresh().await, Err(SyncError::ShutDown(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_lets_a_running_cycle_finish() {
        let fetcher = Arc::new(
            TestFetcher::scripted(vec![Ok(changed(TWO_FEATURES_V1, None))])
                .with_delay(Duration::from_millis(50)),
        );
        let controller = controller_builder()
            .fetcher(fetcher.clone())
            .start()
            .await
            .unwrap();

        let (in_flight, _) = tokio::join!(controller.refresh(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            controller.shutdown();
        });

        assert_that!(in_flight).is_ok_containing(CycleOutcome::Changed);
        assert_that!(controller.feature_names()).has_length(2);
        assert!(matches!(controller.refresh().await, Err(SyncError::ShutDown(_))));
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_instance_is_refused_when_configured() {
        let registry = Arc::new(InstanceRegistry::new());
        let config = test_config()
            .fail_on_multiple_instantiations(true)
            .build()
            .unwrap();

        let _first = controller_builder_for(config.clone())
            .registry(registry.clone())
            .start()
            .await
            .unwrap();
        let second = controller_builder_for(config.clone())
            .registry(registry.clone())
            .start()
            .await;

        assert!(matches!(second, Err(SyncError::InstanceConflict { count: 1, .. })));
        assert_eq!(registry.count(&config), 1);
    }

    #[tokio::test]
    async fn test_readers_keep_their_snapshot_across_refresh() {
        let fetcher = Arc::new(TestFetcher::scripted(vec![
            Ok(changed(FIVE_FEATURES_V2, None)),
            Ok(changed(TWO_FEATURES_V1, None)),
        ]));
        let controller = controller_builder().fetcher(fetcher).start().await.unwrap();

        controller.refresh().await.unwrap();
        let held = controller.dataset();
        controller.refresh().await.unwrap();

        assert_eq!(held.len(), 5);
        assert_eq!(controller.dataset().len(), 2);
    }

    fn unavailable(status: u16) -> FetchResponse {
        FetchResponse::Unavailable {
            status,
            location: None,
        }
    }
}
