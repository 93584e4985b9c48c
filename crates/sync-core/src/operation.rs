//! The heart of the engine: per-feature collect → request → decode → hand
//! off to the `DataProvider` (spec.md §4.9, §5).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use log::{info, warn};
use tokio::sync::broadcast;

use crate::endpoints::Endpoints;
use crate::error::{FeatureError, SyncError, SyncOperationError};
use crate::http_client::{HttpClient, DEFAULT_READ_TIMEOUT, DEFAULT_SYNC_TIMEOUT};
use crate::provider::{Crypter, DataProvider};
use crate::request::RequestMaker;
use crate::secure_store::SecretStore;
use crate::types::{Account, AccountState, FeatureSyncSetupState};

/// Per-feature task outcome. `Cancelled` is deliberately not an error: it
/// must not surface in `SyncOperationError` (spec.md §8 invariant around
/// S6 — cancellation ends the operation in success).
enum FeatureOutcome {
    Completed,
    Cancelled,
    Failed(FeatureError),
}

/// Collaborators a `SyncOperation` needs; constructed once by `SyncQueue`
/// and handed to each operation it runs.
pub struct SyncOperationDeps {
    pub http_client: Arc<HttpClient>,
    pub endpoints: Arc<Endpoints>,
    pub secure_store: Arc<dyn SecretStore>,
    pub providers: Vec<Arc<dyn DataProvider>>,
    /// Forwards `unexpectedStatusCode` to the queue's dedicated HTTP-error
    /// publisher, in addition to the regular finish event (spec.md §4.8).
    pub http_error_tx: broadcast::Sender<u16>,
}

/// One run of the five-step sync algorithm (spec.md §4.9).
pub struct SyncOperation {
    deps: SyncOperationDeps,
}

impl SyncOperation {
    pub fn new(deps: SyncOperationDeps) -> Self {
        SyncOperation { deps }
    }

    /// Run the operation to completion. Returns `Ok(())` on success
    /// (including "nothing to do" and "fully cancelled" cases) or
    /// `Err(SyncOperationError)` aggregating the features that failed.
    pub async fn run(&self, cancel: &AtomicBool) -> std::result::Result<(), SyncOperationError> {
        if cancel.load(Ordering::SeqCst) {
            return Ok(());
        }

        let account = match self.deps.secure_store.account() {
            Ok(Some(account)) if account.state != AccountState::Inactive => account,
            Ok(_) => return Ok(()),
            Err(err) => {
                return Err(SyncOperationError {
                    per_feature_errors: vec![FeatureError {
                        feature: "<account>".to_string(),
                        source: err,
                    }],
                })
            }
        };

        let pending_first_sync: Vec<Arc<dyn DataProvider>> = self
            .deps
            .providers
            .iter()
            .filter(|dp| dp.feature_sync_setup_state() == FeatureSyncSetupState::NeedsRemoteDataFetch)
            .cloned()
            .collect();

        let mut errors = Vec::new();

        if !pending_first_sync.is_empty() {
            let outcomes = self
                .run_phase(true, &pending_first_sync, &account, cancel)
                .await;
            errors.extend(outcomes);
        }

        if cancel.load(Ordering::SeqCst) {
            return Ok(());
        }

        let outcomes = self
            .run_phase(false, &self.deps.providers, &account, cancel)
            .await;
        errors.extend(outcomes);

        if errors.is_empty() {
            if account.state == AccountState::AddNewDevice {
                let mut activated = account;
                activated.state = AccountState::Active;
                if let Err(err) = self.deps.secure_store.persist(activated) {
                    return Err(SyncOperationError {
                        per_feature_errors: vec![FeatureError {
                            feature: "<account>".to_string(),
                            source: err,
                        }],
                    });
                }
            }
            info!("sync operation finished successfully");
            Ok(())
        } else {
            warn!("sync operation finished with {} feature error(s)", errors.len());
            Err(SyncOperationError {
                per_feature_errors: errors,
            })
        }
    }

    async fn run_phase(
        &self,
        fetch_only: bool,
        providers: &[Arc<dyn DataProvider>],
        account: &Account,
        cancel: &AtomicBool,
    ) -> Vec<FeatureError> {
        let request_maker = RequestMaker::new(&self.deps.http_client, &self.deps.endpoints);
        let crypter = Crypter::new(account.secret_key.clone());

        let tasks = providers.iter().map(|provider| {
            self.run_one_feature(
                fetch_only,
                provider.clone(),
                account,
                &crypter,
                &request_maker,
                cancel,
            )
        });

        join_all(tasks)
            .await
            .into_iter()
            .filter_map(|outcome| match outcome {
                FeatureOutcome::Failed(err) => Some(err),
                FeatureOutcome::Completed | FeatureOutcome::Cancelled => None,
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_one_feature(
        &self,
        fetch_only: bool,
        provider: Arc<dyn DataProvider>,
        account: &Account,
        crypter: &Crypter,
        request_maker: &RequestMaker<'_>,
        cancel: &AtomicBool,
    ) -> FeatureOutcome {
        let feature = provider.feature();

        if cancel.load(Ordering::SeqCst) {
            return FeatureOutcome::Cancelled;
        }

        let previous_sync_timestamp = provider.last_sync_timestamp();

        let sent = if fetch_only {
            Vec::new()
        } else {
            match provider.fetch_changed_objects(crypter).await {
                Ok(items) => items,
                Err(err) => {
                    provider.handle_sync_error(&err).await;
                    return FeatureOutcome::Failed(FeatureError {
                        feature: feature.name().to_string(),
                        source: err,
                    });
                }
            }
        };

        if cancel.load(Ordering::SeqCst) {
            return FeatureOutcome::Cancelled;
        }

        let client_timestamp = chrono::Utc::now().to_rfc3339();
        let timeout = if sent.is_empty() {
            DEFAULT_READ_TIMEOUT
        } else {
            DEFAULT_SYNC_TIMEOUT
        };

        // GET when there is nothing to send, never a PATCH with empty
        // updates (spec.md §4.9 tie-break).
        let is_patch = !sent.is_empty();

        // Builds the uncompressed PATCH; reused both as the fallback after a
        // gzip rejection and, rarely, after a local encode failure.
        let uncompressed_retry = || {
            request_maker.build_patch(
                &feature,
                sent.clone(),
                previous_sync_timestamp.clone(),
                &account.token,
                timeout,
                false,
            )
        };

        let request = if !is_patch {
            Ok(request_maker.build_get(std::slice::from_ref(&feature), &account.token, timeout))
        } else {
            match request_maker.build_patch(
                &feature,
                sent.clone(),
                previous_sync_timestamp.clone(),
                &account.token,
                timeout,
                true,
            ) {
                Ok(request) => Ok(request),
                Err(SyncError::PatchPayloadCompressionFailed(code)) => {
                    // Local `flate2` encode failure; practically never
                    // happens over an in-memory buffer, but handled the
                    // same way as a server-side rejection below.
                    let err = SyncError::PatchPayloadCompressionFailed(code);
                    provider.handle_sync_error(&err).await;
                    uncompressed_retry()
                }
                Err(other) => Err(other),
            }
        };

        let request = match request {
            Ok(request) => request,
            Err(err) => {
                provider.handle_sync_error(&err).await;
                return FeatureOutcome::Failed(FeatureError {
                    feature: feature.name().to_string(),
                    source: err,
                });
            }
        };

        if cancel.load(Ordering::SeqCst) {
            return FeatureOutcome::Cancelled;
        }

        let mut response = self.deps.http_client.execute(request).await;

        if cancel.load(Ordering::SeqCst) {
            return FeatureOutcome::Cancelled;
        }

        // A server can reject a gzipped PATCH body (unsupported encoding, a
        // proxy stripping it, ...), and that only shows up here as an
        // ordinary unexpected status code. Retry once, uncompressed.
        if is_patch {
            if let Err(SyncError::UnexpectedStatusCode(_)) = &response {
                let compression_err =
                    SyncError::PatchPayloadCompressionFailed(crate::error::GzipError::UNKNOWN);
                provider.handle_sync_error(&compression_err).await;

                let retry_request = match uncompressed_retry() {
                    Ok(request) => request,
                    Err(err) => {
                        provider.handle_sync_error(&err).await;
                        return FeatureOutcome::Failed(FeatureError {
                            feature: feature.name().to_string(),
                            source: err,
                        });
                    }
                };

                if cancel.load(Ordering::SeqCst) {
                    return FeatureOutcome::Cancelled;
                }
                response = self.deps.http_client.execute(retry_request).await;
                if cancel.load(Ordering::SeqCst) {
                    return FeatureOutcome::Cancelled;
                }
            }
        }

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                if let SyncError::UnexpectedStatusCode(status) = &err {
                    let _ = self.deps.http_error_tx.send(*status);
                    if *status == 403 {
                        // 403 must clear the local Account before the
                        // operation's finish signal fires (spec.md §7,
                        // §8 invariant 7).
                        let _ = self.deps.secure_store.remove_account();
                    }
                }
                provider.handle_sync_error(&err).await;
                return FeatureOutcome::Failed(FeatureError {
                    feature: feature.name().to_string(),
                    source: err,
                });
            }
        };

        let (received, server_timestamp) = if response.status == 200 {
            let body = match response.body {
                Some(body) => body,
                None => {
                    let err = SyncError::NoResponseBody;
                    provider.handle_sync_error(&err).await;
                    return FeatureOutcome::Failed(FeatureError {
                        feature: feature.name().to_string(),
                        source: err,
                    });
                }
            };
            match crate::codec::decode_response_envelope(&body, std::slice::from_ref(&feature)) {
                Ok(mut decoded) => match decoded.remove(feature.name()) {
                    Some(feature_body) => (feature_body.entries, Some(feature_body.last_modified)),
                    None => {
                        let err = SyncError::UnexpectedResponseBody(format!(
                            "missing feature key {:?}",
                            feature.name()
                        ));
                        provider.handle_sync_error(&err).await;
                        return FeatureOutcome::Failed(FeatureError {
                            feature: feature.name().to_string(),
                            source: err,
                        });
                    }
                },
                Err(err) => {
                    provider.handle_sync_error(&err).await;
                    return FeatureOutcome::Failed(FeatureError {
                        feature: feature.name().to_string(),
                        source: err,
                    });
                }
            }
        } else {
            // 204/304: empty received, no server timestamp (spec.md §4.9
            // step e, §8 invariant 6).
            (Vec::new(), None)
        };

        let handler_result = if fetch_only {
            provider
                .handle_initial_sync_response(
                    received,
                    &client_timestamp,
                    server_timestamp.as_deref(),
                    crypter,
                )
                .await
        } else {
            provider
                .handle_sync_response(
                    received,
                    &client_timestamp,
                    server_timestamp.as_deref(),
                    crypter,
                )
                .await
        };

        match handler_result {
            Ok(()) => FeatureOutcome::Completed,
            Err(err) => {
                provider.handle_sync_error(&err).await;
                FeatureOutcome::Failed(FeatureError {
                    feature: feature.name().to_string(),
                    source: err,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoints::Endpoints;
    use crate::secure_store::InMemorySecureStore;
    use crate::types::{Feature, KeyBytes, Syncable};
    use async_trait::async_trait;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Mutex as AsyncMutex;

    struct FakeProvider {
        feature: Feature,
        setup_state: StdMutex<FeatureSyncSetupState>,
        last_sync_timestamp: StdMutex<Option<String>>,
        to_send: Vec<Syncable>,
        received: AsyncMutex<Vec<Syncable>>,
        errors_seen: AsyncMutex<Vec<String>>,
        handled_response: AsyncMutex<bool>,
    }

    impl FakeProvider {
        fn new(name: &str, to_send: Vec<Syncable>) -> Self {
            FakeProvider {
                feature: Feature::new(name),
                setup_state: StdMutex::new(FeatureSyncSetupState::ReadyToSync),
                last_sync_timestamp: StdMutex::new(None),
                to_send,
                received: AsyncMutex::new(Vec::new()),
                errors_seen: AsyncMutex::new(Vec::new()),
                handled_response: AsyncMutex::new(false),
            }
        }
    }

    #[async_trait]
    impl DataProvider for FakeProvider {
        fn feature(&self) -> Feature {
            self.feature.clone()
        }

        fn is_registered(&self) -> bool {
            true
        }

        fn feature_sync_setup_state(&self) -> FeatureSyncSetupState {
            *self.setup_state.lock().unwrap()
        }

        fn register_feature(&self, state: FeatureSyncSetupState) {
            *self.setup_state.lock().unwrap() = state;
        }

        fn last_sync_timestamp(&self) -> Option<String> {
            self.last_sync_timestamp.lock().unwrap().clone()
        }

        async fn prepare_for_first_sync(&self) -> std::result::Result<(), SyncError> {
            Ok(())
        }

        async fn fetch_changed_objects(
            &self,
            _crypter: &Crypter,
        ) -> std::result::Result<Vec<Syncable>, SyncError> {
            Ok(self.to_send.clone())
        }

        async fn handle_sync_response(
            &self,
            received: Vec<Syncable>,
            _client_timestamp: &str,
            server_timestamp: Option<&str>,
            _crypter: &Crypter,
        ) -> std::result::Result<(), SyncError> {
            *self.received.lock().await = received;
            *self.last_sync_timestamp.lock().unwrap() = server_timestamp.map(str::to_string);
            *self.handled_response.lock().await = true;
            Ok(())
        }

        async fn handle_initial_sync_response(
            &self,
            received: Vec<Syncable>,
            client_timestamp: &str,
            server_timestamp: Option<&str>,
            crypter: &Crypter,
        ) -> std::result::Result<(), SyncError> {
            self.handle_sync_response(received, client_timestamp, server_timestamp, crypter)
                .await
        }

        async fn handle_sync_error(&self, error: &SyncError) {
            self.errors_seen.lock().await.push(error.to_string());
        }
    }

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

    fn start_mock_server(status_line: &'static str, body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 8192];
                let _ = stream.read(&mut buf);
                let response = format!(
                    "{status_line}\r\nContent-Length: {}\r\nContent-Type: application/json\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn not_modified_response_yields_empty_received_and_no_server_timestamp() {
        let base_url = start_mock_server("HTTP/1.1 304 Not Modified", String::new());
        let store = Arc::new(InMemorySecureStore::new_isolated_for_test());
        store.persist(sample_account()).unwrap();

        let fake = Arc::new(FakeProvider::new("bookmarks", vec![]));
        let provider: Arc<dyn DataProvider> = fake.clone();
        let (http_error_tx, _rx) = broadcast::channel(4);

        let op = SyncOperation::new(SyncOperationDeps {
            http_client: Arc::new(HttpClient::new()),
            endpoints: Arc::new(Endpoints::new(base_url)),
            secure_store: store,
            providers: vec![provider],
            http_error_tx,
        });

        let cancel = AtomicBool::new(false);
        let result = op.run(&cancel).await;
        assert!(result.is_ok());

        assert!(*fake.handled_response.lock().await);
        assert!(fake.received.lock().await.is_empty());
        assert!(fake.last_sync_timestamp.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn no_account_finishes_with_success_and_calls_no_provider() {
        let store = Arc::new(InMemorySecureStore::new_isolated_for_test());
        let fake = Arc::new(FakeProvider::new("bookmarks", vec![]));
        let provider: Arc<dyn DataProvider> = fake.clone();
        let (http_error_tx, _rx) = broadcast::channel(4);

        let op = SyncOperation::new(SyncOperationDeps {
            http_client: Arc::new(HttpClient::new()),
            endpoints: Arc::new(Endpoints::new("https://s.example")),
            secure_store: store,
            providers: vec![provider],
            http_error_tx,
        });

        let cancel = AtomicBool::new(false);
        assert!(op.run(&cancel).await.is_ok());

        assert!(!*fake.handled_response.lock().await);
    }

    /// Serves exactly two requests in order, so a test can see what gets
    /// sent on a retry after the first response.
    fn start_two_response_mock_server(
        first: (&'static str, String),
        second: (&'static str, String),
    ) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for (status_line, body) in [first, second] {
                if let Ok((mut stream, _)) = listener.accept() {
                    let mut buf = [0u8; 8192];
                    let _ = stream.read(&mut buf);
                    let response = format!(
                        "{status_line}\r\nContent-Length: {}\r\nContent-Type: application/json\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = stream.write_all(response.as_bytes());
                }
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn gzip_rejected_by_server_falls_back_to_one_uncompressed_retry() {
        let base_url = start_two_response_mock_server(
            ("HTTP/1.1 400 Bad Request", String::new()),
            (
                "HTTP/1.1 200 OK",
                r#"{"bookmarks":{"last_modified":"T2","entries":[]}}"#.to_string(),
            ),
        );

        let store = Arc::new(InMemorySecureStore::new_isolated_for_test());
        store.persist(sample_account()).unwrap();

        let fake = Arc::new(FakeProvider::new(
            "bookmarks",
            vec![Syncable {
                id: "b1".to_string(),
                deleted: false,
                fields: serde_json::Map::new(),
            }],
        ));
        let provider: Arc<dyn DataProvider> = fake.clone();
        let (http_error_tx, mut http_error_rx) = broadcast::channel(4);

        let op = SyncOperation::new(SyncOperationDeps {
            http_client: Arc::new(HttpClient::new()),
            endpoints: Arc::new(Endpoints::new(base_url)),
            secure_store: store,
            providers: vec![provider],
            http_error_tx,
        });

        let cancel = AtomicBool::new(false);
        assert!(op.run(&cancel).await.is_ok());

        let errors_seen = fake.errors_seen.lock().await.clone();
        assert_eq!(errors_seen.len(), 1);
        assert!(errors_seen[0].contains("patch payload compression failed"));

        assert!(*fake.handled_response.lock().await);
        assert!(fake.received.lock().await.is_empty());
        assert_eq!(fake.last_sync_timestamp.lock().unwrap().clone().unwrap(), "T2");

        // The rejected gzip attempt never reaches the queue's HTTP-error
        // publisher; only a final, still-failing status would.
        assert!(http_error_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancelling_before_the_request_skips_the_handler() {
        let store = Arc::new(InMemorySecureStore::new_isolated_for_test());
        store.persist(sample_account()).unwrap();
        let fake = Arc::new(FakeProvider::new("bookmarks", vec![]));
        let provider: Arc<dyn DataProvider> = fake.clone();
        let (http_error_tx, _rx) = broadcast::channel(4);

        let op = SyncOperation::new(SyncOperationDeps {
            http_client: Arc::new(HttpClient::new()),
            endpoints: Arc::new(Endpoints::new("https://s.example")),
            secure_store: store,
            providers: vec![provider],
            http_error_tx,
        });

        let cancel = AtomicBool::new(true);
        assert!(op.run(&cancel).await.is_ok());

        assert!(!*fake.handled_response.lock().await);
    }
}
