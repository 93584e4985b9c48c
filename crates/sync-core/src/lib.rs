//! Client-side end-to-end-encrypted device sync engine core.
//!
//! Top-level modules mirror the components of the system: `crypto` wraps the
//! fixed primitive set, `account_manager`/`connect` own the account
//! lifecycle, `scheduler`/`queue`/`operation` run the sync loop, and
//! `request`/`codec` own the wire format. `SyncEngine` wires a set of
//! `DataProvider`s to all of the above.

pub mod account_manager;
pub mod codec;
pub mod config;
pub mod connect;
pub mod crypto;
pub mod endpoints;
pub mod error;
pub mod http_client;
pub mod operation;
pub mod provider;
pub mod queue;
pub mod request;
pub mod scheduler;
pub mod secure_store;
pub mod types;

use std::sync::Arc;

use tokio::task::JoinHandle;

use account_manager::AccountManager;
use config::SyncConfig;
use connect::{RecoveryKeyTransmitter, RemoteConnector};
use endpoints::Endpoints;
use http_client::HttpClient;
use provider::DataProvider;
use queue::{SyncEngineStatus, SyncFinishOutcome, SyncQueue, SyncQueueConfig};
use scheduler::Scheduler;
use secure_store::SecretStore;

/// Top-level facade gluing the account, scheduling, and queue components
/// together for an embedding application, the way the teacher's
/// `DeviceSyncRuntimeState` composes its own collaborators behind one type.
pub struct SyncEngine {
    pub account_manager: AccountManager,
    pub scheduler: Arc<Scheduler>,
    pub queue: Arc<SyncQueue>,
    http_client: Arc<HttpClient>,
    endpoints: Arc<Endpoints>,
    bridge_task: JoinHandle<()>,
}

impl SyncEngine {
    /// Build the engine, registering `providers` with the sync queue and
    /// starting the scheduler-to-queue bridge task.
    pub fn new(
        config: &SyncConfig,
        secure_store: Arc<dyn SecretStore>,
        providers: Vec<Arc<dyn DataProvider>>,
    ) -> Self {
        let http_client = Arc::new(HttpClient::new());
        let endpoints = Arc::new(Endpoints::new(config.base_url.clone()));

        let account_manager = AccountManager::new(
            HttpClient::new(),
            Endpoints::new(config.base_url.clone()),
            secure_store.clone(),
        );

        let scheduler = Arc::new(Scheduler::new(config));

        let queue = SyncQueue::new(SyncQueueConfig {
            http_client: http_client.clone(),
            endpoints: endpoints.clone(),
            secure_store,
            providers,
        });

        let bridge_task = queue.clone().spawn_scheduler_bridge(scheduler.clone());

        SyncEngine {
            account_manager,
            scheduler,
            queue,
            http_client,
            endpoints,
            bridge_task,
        }
    }

    /// A `RemoteConnector` scoped to this engine's HTTP client/endpoints, for
    /// the "new device" side of a connect handshake.
    pub fn remote_connector(&self) -> RemoteConnector<'_> {
        RemoteConnector::new(&self.http_client, &self.endpoints)
    }

    /// A `RecoveryKeyTransmitter` scoped to this engine, for the already
    /// signed-in "source device" side of a connect handshake.
    pub fn recovery_key_transmitter(&self) -> RecoveryKeyTransmitter<'_> {
        RecoveryKeyTransmitter::new(&self.http_client, &self.endpoints)
    }

    pub fn status(&self) -> SyncEngineStatus {
        self.queue.status()
    }

    pub fn subscribe_sync_did_finish(&self) -> tokio::sync::broadcast::Receiver<SyncFinishOutcome> {
        self.queue.subscribe_sync_did_finish()
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.bridge_task.abort();
    }
}
