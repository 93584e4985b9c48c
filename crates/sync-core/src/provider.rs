//! The boundary to each synced feature (spec.md §2 item 11, §9): a
//! capability set the engine drives without knowing the concrete entity,
//! directly grounded in the teacher's `EntitySyncAdapter` trait.

use async_trait::async_trait;

use crate::crypto;
use crate::error::SyncError;
use crate::types::{Feature, FeatureSyncSetupState, KeyBytes, Syncable};

/// One feature's outbound batch for one `SyncOperation` (spec.md §3).
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub feature: Feature,
    pub previous_sync_timestamp: Option<String>,
    pub sent: Vec<Syncable>,
}

/// One feature's decoded response for one `SyncOperation` (spec.md §3).
#[derive(Debug, Clone)]
pub struct SyncResult {
    pub server_timestamp: Option<String>,
    pub received: Vec<Syncable>,
}

/// Handed to `DataProvider::fetch_changed_objects` so a provider can encrypt
/// user-text fields without holding the secret key itself (spec.md §3
/// ownership note: "CryptoProvider holds a reference to SecureStore solely
/// to fetch the secret key on demand").
#[derive(Clone)]
pub struct Crypter {
    key: KeyBytes,
}

impl Crypter {
    pub fn new(key: KeyBytes) -> Self {
        Crypter { key }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, SyncError> {
        Ok(crypto::encrypt_string(plaintext, &self.key)?)
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<String, SyncError> {
        Ok(crypto::decrypt_string(ciphertext, &self.key)?)
    }
}

/// The boundary between the generic sync engine and one feature's storage
/// (spec.md §2 item 11, §9). Implementations own their own persistence; the
/// core never reaches into it directly.
#[async_trait]
pub trait DataProvider: Send + Sync {
    /// The feature this provider is uniquely registered under.
    fn feature(&self) -> Feature;

    /// Whether `register_feature` has ever been called for this provider —
    /// distinct from `feature_sync_setup_state`, which only has meaning once
    /// registered (spec.md §4.8 `prepare_data_models_for_sync`).
    fn is_registered(&self) -> bool;

    /// Current setup state; drives whether this provider takes part in the
    /// first-sync (fetch-only) phase (spec.md §4.9 step 2).
    fn feature_sync_setup_state(&self) -> FeatureSyncSetupState;

    /// Record the provider's setup state after `prepare_for_first_sync` runs
    /// (spec.md §4.8 `prepare_data_models_for_sync`).
    fn register_feature(&self, state: FeatureSyncSetupState);

    /// The last `last_modified` this provider remembers, sent verbatim as
    /// `modified_since` (spec.md §3, §4.10).
    fn last_sync_timestamp(&self) -> Option<String>;

    /// Called once before a feature's first sync, prior to registration.
    async fn prepare_for_first_sync(&self) -> Result<(), SyncError>;

    /// Collect and encrypt locally changed records for this sync cycle
    /// (spec.md §4.9 step a). Not called during the fetch-only phase.
    async fn fetch_changed_objects(&self, crypter: &Crypter) -> Result<Vec<Syncable>, SyncError>;

    /// Merge a regular-sync response (spec.md §4.9 step e).
    async fn handle_sync_response(
        &self,
        received: Vec<Syncable>,
        client_timestamp: &str,
        server_timestamp: Option<&str>,
        crypter: &Crypter,
    ) -> Result<(), SyncError>;

    /// Merge a first-sync (fetch-only) response (spec.md §4.9 step e).
    async fn handle_initial_sync_response(
        &self,
        received: Vec<Syncable>,
        client_timestamp: &str,
        server_timestamp: Option<&str>,
        crypter: &Crypter,
    ) -> Result<(), SyncError>;

    /// Notified of a per-feature failure (spec.md §4.9 step f, §7).
    async fn handle_sync_error(&self, error: &SyncError);
}
