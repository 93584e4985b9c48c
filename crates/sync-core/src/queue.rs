//! Owns the serial `max_concurrent = 1` operation queue and its observable
//! publishers (spec.md §4.8).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{info, warn};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::endpoints::Endpoints;
use crate::error::{backoff_seconds, FeatureError};
use crate::http_client::HttpClient;
use crate::operation::{SyncOperation, SyncOperationDeps};
use crate::provider::DataProvider;
use crate::scheduler::Scheduler;
use crate::secure_store::SecretStore;
use crate::types::FeatureSyncSetupState;

const FINISH_CHANNEL_CAPACITY: usize = 16;
const HTTP_ERROR_CHANNEL_CAPACITY: usize = 16;

/// Clone-friendly summary of a finished `SyncOperation`, suitable for a
/// broadcast channel (the richer `SyncOperationError` holds a `reqwest`
/// error behind `SyncError::Transport` and isn't `Clone`).
#[derive(Debug, Clone)]
pub enum SyncFinishOutcome {
    Success,
    Failure { per_feature: Vec<String> },
}

impl From<&FeatureError> for String {
    fn from(err: &FeatureError) -> Self {
        format!("{}: {}", err.feature, err.source)
    }
}

/// Supplemented read-only status snapshot (SPEC_FULL.md §3), queryable
/// without subscribing to a channel.
#[derive(Debug, Clone, Default)]
pub struct SyncEngineStatus {
    pub last_sync_at: Option<String>,
    pub consecutive_failures: i32,
    pub last_error: Option<String>,
}

/// Collaborators needed to build each `SyncOperation` the queue runs.
pub struct SyncQueueConfig {
    pub http_client: Arc<HttpClient>,
    pub endpoints: Arc<Endpoints>,
    pub secure_store: Arc<dyn SecretStore>,
    pub providers: Vec<Arc<dyn DataProvider>>,
}

/// Serial operation queue: at most one `SyncOperation` executing at a time
/// (spec.md §4.8, §5 invariant 3).
pub struct SyncQueue {
    http_client: Arc<HttpClient>,
    endpoints: Arc<Endpoints>,
    secure_store: Arc<dyn SecretStore>,
    providers: Vec<Arc<dyn DataProvider>>,

    enabled: AtomicBool,
    suspended: AtomicBool,
    in_progress: Arc<AtomicBool>,
    current_cancel_flag: Mutex<Option<Arc<AtomicBool>>>,
    current_task: Mutex<Option<JoinHandle<()>>>,

    is_sync_in_progress_tx: watch::Sender<bool>,
    sync_did_finish_tx: broadcast::Sender<SyncFinishOutcome>,
    sync_http_request_error_tx: broadcast::Sender<u16>,

    status: Mutex<SyncEngineStatus>,
}

impl SyncQueue {
    pub fn new(config: SyncQueueConfig) -> Arc<Self> {
        let (is_sync_in_progress_tx, _) = watch::channel(false);
        let (sync_did_finish_tx, _) = broadcast::channel(FINISH_CHANNEL_CAPACITY);
        let (sync_http_request_error_tx, _) = broadcast::channel(HTTP_ERROR_CHANNEL_CAPACITY);

        Arc::new(SyncQueue {
            http_client: config.http_client,
            endpoints: config.endpoints,
            secure_store: config.secure_store,
            providers: config.providers,
            enabled: AtomicBool::new(true),
            suspended: AtomicBool::new(false),
            in_progress: Arc::new(AtomicBool::new(false)),
            current_cancel_flag: Mutex::new(None),
            current_task: Mutex::new(None),
            is_sync_in_progress_tx,
            sync_did_finish_tx,
            sync_http_request_error_tx,
            status: Mutex::new(SyncEngineStatus::default()),
        })
    }

    pub fn subscribe_is_sync_in_progress(&self) -> watch::Receiver<bool> {
        self.is_sync_in_progress_tx.subscribe()
    }

    pub fn subscribe_sync_did_finish(&self) -> broadcast::Receiver<SyncFinishOutcome> {
        self.sync_did_finish_tx.subscribe()
    }

    pub fn subscribe_sync_http_request_error(&self) -> broadcast::Receiver<u16> {
        self.sync_http_request_error_tx.subscribe()
    }

    pub fn status(&self) -> SyncEngineStatus {
        self.status.lock().expect("status lock poisoned").clone()
    }

    /// Seconds to wait before `resume()` is allowed to re-trigger after a
    /// retryable failure, grown from the queue's own failure count
    /// (SPEC_FULL.md §3).
    pub fn next_retry_delay_seconds(&self) -> i64 {
        let failures = self.status.lock().expect("status lock poisoned").consecutive_failures;
        backoff_seconds(failures)
    }

    /// Iterates unregistered `DataProvider`s, calls `prepare_for_first_sync`
    /// then `register_feature`. If some providers are already registered
    /// while others are not, the new ones are registered as
    /// `NeedsRemoteDataFetch` regardless of `needs_remote_data_fetch`: a
    /// mixed registration state means this device must catch up (spec.md
    /// §4.8).
    pub async fn prepare_data_models_for_sync(&self, needs_remote_data_fetch: bool) {
        let unregistered: Vec<_> = self
            .providers
            .iter()
            .filter(|dp| !dp.is_registered())
            .cloned()
            .collect();
        if unregistered.is_empty() {
            return;
        }

        let any_already_registered = self.providers.iter().any(|dp| dp.is_registered());
        let state = if any_already_registered || needs_remote_data_fetch {
            FeatureSyncSetupState::NeedsRemoteDataFetch
        } else {
            FeatureSyncSetupState::ReadyToSync
        };

        for provider in unregistered {
            if let Err(err) = provider.prepare_for_first_sync().await {
                warn!(
                    "prepare_for_first_sync failed for {}: {err}",
                    provider.feature()
                );
                continue;
            }
            provider.register_feature(state);
        }
    }

    /// When disabled, cancels all in-flight and enqueued operations
    /// (spec.md §4.8).
    pub fn set_data_syncing_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.cancel_ongoing_and_suspend();
        }
    }

    /// Schedule exactly one `SyncOperation`; a no-op if disabled, suspended,
    /// or one is already executing (spec.md §4.8, §5 invariant 3). Takes
    /// `Arc<Self>` by value (the only reference-counted receiver stable Rust
    /// allows) — callers holding a shared `Arc<SyncQueue>` pass
    /// `Arc::clone(&queue)`.
    pub fn start_sync(self: Arc<Self>) {
        if !self.enabled.load(Ordering::SeqCst) || self.suspended.load(Ordering::SeqCst) {
            return;
        }
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let _ = self.is_sync_in_progress_tx.send(true);

        let cancel_flag = Arc::new(AtomicBool::new(false));
        *self
            .current_cancel_flag
            .lock()
            .expect("cancel flag lock poisoned") = Some(cancel_flag.clone());

        let this = self.clone();
        let handle = tokio::spawn(async move {
            let deps = SyncOperationDeps {
                http_client: this.http_client.clone(),
                endpoints: this.endpoints.clone(),
                secure_store: this.secure_store.clone(),
                providers: this.providers.clone(),
                http_error_tx: this.sync_http_request_error_tx.clone(),
            };
            let operation = SyncOperation::new(deps);
            let result = operation.run(&cancel_flag).await;

            let outcome = match &result {
                Ok(()) => SyncFinishOutcome::Success,
                Err(err) => SyncFinishOutcome::Failure {
                    per_feature: err.per_feature_errors.iter().map(String::from).collect(),
                },
            };

            {
                let mut status = this.status.lock().expect("status lock poisoned");
                match &outcome {
                    SyncFinishOutcome::Success => {
                        status.consecutive_failures = 0;
                        status.last_error = None;
                        status.last_sync_at = Some(chrono::Utc::now().to_rfc3339());
                    }
                    SyncFinishOutcome::Failure { per_feature } => {
                        status.consecutive_failures += 1;
                        status.last_error = per_feature.first().cloned();
                    }
                }
            }

            this.in_progress.store(false, Ordering::SeqCst);
            *this
                .current_cancel_flag
                .lock()
                .expect("cancel flag lock poisoned") = None;
            let _ = this.is_sync_in_progress_tx.send(false);

            if matches!(outcome, SyncFinishOutcome::Failure { .. }) {
                warn!("sync operation finished with failures");
            } else {
                info!("sync operation finished successfully");
            }
            let _ = this.sync_did_finish_tx.send(outcome);
        });

        *self.current_task.lock().expect("task lock poisoned") = Some(handle);
    }

    /// Cancel the current operation and suspend the queue; `start_sync`
    /// becomes a no-op until `resume()` is called (spec.md §4.8).
    pub fn cancel_ongoing_and_suspend(&self) {
        self.suspended.store(true, Ordering::SeqCst);
        if let Some(flag) = self
            .current_cancel_flag
            .lock()
            .expect("cancel flag lock poisoned")
            .as_ref()
        {
            flag.store(true, Ordering::SeqCst);
        }
    }

    /// Lift suspension; dispatch resumes on the next `start_sync` call.
    pub fn resume(&self) {
        self.suspended.store(false, Ordering::SeqCst);
    }

    /// Drives `start_sync`/`cancel_sync`/`resume_sync` from a `Scheduler`'s
    /// signals on a dedicated background task, matching the teacher's
    /// single-loop `ensure_background_engine_started` pattern.
    pub fn spawn_scheduler_bridge(self: Arc<Self>, scheduler: Arc<Scheduler>) -> JoinHandle<()> {
        let mut start_sync_rx = scheduler.subscribe_start_sync();
        let mut cancel_sync_rx = scheduler.subscribe_cancel_sync();
        let mut resume_sync_rx = scheduler.subscribe_resume_sync();
        let this = self;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = start_sync_rx.recv() => {
                        match result {
                            Ok(()) => Arc::clone(&this).start_sync(),
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    result = cancel_sync_rx.recv() => {
                        match result {
                            Ok(()) => this.cancel_ongoing_and_suspend(),
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    result = resume_sync_rx.recv() => {
                        match result {
                            Ok(()) => this.resume(),
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secure_store::InMemorySecureStore;
    use crate::types::{Account, AccountState, Feature, KeyBytes};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct NoopProvider {
        feature: Feature,
        registered: StdMutex<bool>,
    }

    #[async_trait]
    impl DataProvider for NoopProvider {
        fn feature(&self) -> Feature {
            self.feature.clone()
        }

        fn is_registered(&self) -> bool {
            *self.registered.lock().unwrap()
        }

        fn feature_sync_setup_state(&self) -> FeatureSyncSetupState {
            FeatureSyncSetupState::ReadyToSync
        }

        fn register_feature(&self, _state: FeatureSyncSetupState) {
            *self.registered.lock().unwrap() = true;
        }

        fn last_sync_timestamp(&self) -> Option<String> {
            None
        }

        async fn prepare_for_first_sync(&self) -> std::result::Result<(), crate::error::SyncError> {
            Ok(())
        }

        async fn fetch_changed_objects(
            &self,
            _crypter: &crate::provider::Crypter,
        ) -> std::result::Result<Vec<crate::types::Syncable>, crate::error::SyncError> {
            Ok(vec![])
        }

        async fn handle_sync_response(
            &self,
            _received: Vec<crate::types::Syncable>,
            _client_timestamp: &str,
            _server_timestamp: Option<&str>,
            _crypter: &crate::provider::Crypter,
        ) -> std::result::Result<(), crate::error::SyncError> {
            Ok(())
        }

        async fn handle_initial_sync_response(
            &self,
            _received: Vec<crate::types::Syncable>,
            _client_timestamp: &str,
            _server_timestamp: Option<&str>,
            _crypter: &crate::provider::Crypter,
        ) -> std::result::Result<(), crate::error::SyncError> {
            Ok(())
        }

        async fn handle_sync_error(&self, _error: &crate::error::SyncError) {}
    }

    fn queue_with_no_account() -> Arc<SyncQueue> {
        SyncQueue::new(SyncQueueConfig {
            http_client: Arc::new(HttpClient::new()),
            endpoints: Arc::new(Endpoints::new("https://s.example")),
            secure_store: Arc::new(InMemorySecureStore::new_isolated_for_test()),
            providers: vec![],
        })
    }

    #[test]
    fn disabling_sets_suspended_so_start_sync_becomes_a_no_op() {
        let queue = queue_with_no_account();
        queue.set_data_syncing_enabled(false);
        assert!(queue.suspended.load(Ordering::SeqCst));
        assert!(!queue.enabled.load(Ordering::SeqCst));
    }

    #[test]
    fn resume_lifts_suspension() {
        let queue = queue_with_no_account();
        queue.cancel_ongoing_and_suspend();
        assert!(queue.suspended.load(Ordering::SeqCst));
        queue.resume();
        assert!(!queue.suspended.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn start_sync_emits_in_progress_then_false_with_no_account() {
        let queue = queue_with_no_account();
        let mut rx = queue.subscribe_is_sync_in_progress();

        queue.start_sync();

        // `changed()` resolves once the spawned task has flipped the value.
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        rx.changed().await.unwrap();
        assert!(!*rx.borrow());
    }

    #[tokio::test]
    async fn prepare_data_models_registers_unregistered_providers() {
        let provider = Arc::new(NoopProvider {
            feature: Feature::new("bookmarks"),
            registered: StdMutex::new(false),
        });
        let queue = SyncQueue::new(SyncQueueConfig {
            http_client: Arc::new(HttpClient::new()),
            endpoints: Arc::new(Endpoints::new("https://s.example")),
            secure_store: Arc::new(InMemorySecureStore::new_isolated_for_test()),
            providers: vec![provider.clone()],
        });

        queue.prepare_data_models_for_sync(false).await;
        assert!(provider.is_registered());
    }

    #[allow(dead_code)]
    fn sample_account() -> Account {
        Account {
            user_id: "u1".to_string(),
            primary_key: KeyBytes([1u8; 32]),
            secret_key: KeyBytes([2u8; 32]),
            token: "tok".to_string(),
            device_id: "d1".to_string(),
            device_name: "phone".to_string(),
            device_type: "mobile".to_string(),
            state: AccountState::Active,
        }
    }
}
