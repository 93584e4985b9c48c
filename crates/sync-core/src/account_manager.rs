//! Orchestrates signup, login, device refresh, logout, delete, and device
//! listing (spec.md §4.5).

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::crypto;
use crate::endpoints::Endpoints;
use crate::error::{Result, SyncError};
use crate::http_client::{bearer_header, HttpClient, HttpMethod};
use crate::secure_store::SecretStore;
use crate::types::{
    Account, AccountState, DeviceInfo, LoginRequest, LoginResponse, LogoutRequest,
    LogoutResponse, RecoveryKey, SignupRequest, SignupResponse,
};

const DEVICES_CACHE_NONE: Option<Vec<DeviceInfo>> = None;

/// Orchestrates the account lifecycle. Holds no secret material itself
/// (everything authoritative lives in the `SecretStore`), but caches the
/// last device list as a non-authoritative read-through convenience.
pub struct AccountManager {
    http_client: HttpClient,
    endpoints: Endpoints,
    secure_store: Arc<dyn SecretStore>,
    device_cache: std::sync::Mutex<Option<Vec<DeviceInfo>>>,
}

impl AccountManager {
    pub fn new(http_client: HttpClient, endpoints: Endpoints, secure_store: Arc<dyn SecretStore>) -> Self {
        AccountManager {
            http_client,
            endpoints,
            secure_store,
            device_cache: std::sync::Mutex::new(DEVICES_CACHE_NONE),
        }
    }

    fn clear_device_cache(&self) {
        *self.device_cache.lock().expect("device cache lock poisoned") = None;
    }

    /// `create_account(device_name, device_type) -> Account` (spec.md §4.5).
    pub async fn create_account(&self, device_name: &str, device_type: &str) -> Result<Account> {
        let user_id = Uuid::new_v4().to_string();
        let password = Uuid::new_v4().to_string();
        let device_id = Uuid::new_v4().to_string();

        let keys = crypto::create_account_keys(&user_id, &password)?;
        let protected_encryption_key =
            base64::engine::general_purpose::STANDARD.encode(&keys.protected_secret_key);

        let request = SignupRequest {
            user_id: user_id.clone(),
            hashed_password: keys.password_hash.clone(),
            protected_encryption_key,
            device_id: device_id.clone(),
            device_name: device_name.to_string(),
            device_type: device_type.to_string(),
        };

        let body = serde_json::to_vec(&request)?;
        let http_request = self.http_client.create_request(
            self.endpoints.signup(),
            HttpMethod::Post,
            vec![],
            vec![],
            Some(body),
            Some("application/json".to_string()),
            Duration::from_secs(4),
        );

        let response = self.http_client.execute(http_request).await?;
        let raw = response.body.ok_or(SyncError::NoResponseBody)?;
        let decoded: SignupResponse = serde_json::from_slice(&raw)
            .map_err(|e| SyncError::UnableToDecodeResponse(e.to_string()))?;

        let account = Account {
            user_id: decoded.user_id,
            primary_key: keys.primary_key,
            secret_key: keys.secret_key,
            token: decoded.token,
            device_id,
            device_name: device_name.to_string(),
            device_type: device_type.to_string(),
            state: AccountState::Active,
        };

        self.secure_store.persist(account.clone())?;
        info!("account created for user {}", account.user_id);
        Ok(account)
    }

    /// `login(recovery_key, device_name, device_type) -> {account,
    /// registered_devices}` (spec.md §4.5).
    pub async fn login(
        &self,
        recovery_key: &RecoveryKey,
        device_name: &str,
        device_type: &str,
    ) -> Result<(Account, Vec<DeviceInfo>)> {
        let login_info = crypto::extract_login_info(recovery_key)?;
        let device_id = Uuid::new_v4().to_string();

        let request = LoginRequest {
            user_id: recovery_key.user_id.clone(),
            hashed_password: login_info.password_hash.clone(),
            device_id: device_id.clone(),
            device_name: device_name.to_string(),
            device_type: device_type.to_string(),
        };

        let (token, protected_encryption_key, devices) =
            self.post_login(&request).await?;

        let encryption_key_bytes = base64::engine::general_purpose::STANDARD
            .decode(&protected_encryption_key)
            .map_err(|e| SyncError::InvalidDataInResponse(e.to_string()))?;
        let secret_key =
            crypto::extract_secret_key(&encryption_key_bytes, &login_info.stretched_primary_key)?;

        let account = Account {
            user_id: recovery_key.user_id.clone(),
            primary_key: recovery_key.primary_key.clone(),
            secret_key,
            token,
            device_id,
            device_name: device_name.to_string(),
            device_type: device_type.to_string(),
            // Stays `AddNewDevice` until the first sync completes (spec.md
            // §4.5, §4.9); `SyncOperation` flips it to `Active`.
            state: AccountState::AddNewDevice,
        };

        self.secure_store.persist(account.clone())?;
        self.clear_device_cache();
        info!("login succeeded for user {}", account.user_id);
        Ok((account, devices))
    }

    /// `refresh_token(account, device_name) -> {account, registered_devices}`,
    /// same as `login` but reuses `device_id` (spec.md §4.5).
    pub async fn refresh_token(
        &self,
        account: &Account,
        device_name: &str,
    ) -> Result<(Account, Vec<DeviceInfo>)> {
        let recovery_key = RecoveryKey {
            user_id: account.user_id.clone(),
            primary_key: account.primary_key.clone(),
        };
        let login_info = crypto::extract_login_info(&recovery_key)?;

        let request = LoginRequest {
            user_id: account.user_id.clone(),
            hashed_password: login_info.password_hash.clone(),
            device_id: account.device_id.clone(),
            device_name: device_name.to_string(),
            device_type: account.device_type.clone(),
        };

        let (token, protected_encryption_key, devices) =
            self.post_login(&request).await?;

        let encryption_key_bytes = base64::engine::general_purpose::STANDARD
            .decode(&protected_encryption_key)
            .map_err(|e| SyncError::InvalidDataInResponse(e.to_string()))?;
        let secret_key =
            crypto::extract_secret_key(&encryption_key_bytes, &login_info.stretched_primary_key)?;

        let refreshed = Account {
            user_id: account.user_id.clone(),
            primary_key: account.primary_key.clone(),
            secret_key,
            token,
            device_id: account.device_id.clone(),
            device_name: device_name.to_string(),
            device_type: account.device_type.clone(),
            state: account.state,
        };

        self.secure_store.persist(refreshed.clone())?;
        self.clear_device_cache();
        Ok((refreshed, devices))
    }

    async fn post_login(&self, request: &LoginRequest) -> Result<(String, String, Vec<DeviceInfo>)> {
        let body = serde_json::to_vec(request)?;
        let http_request = self.http_client.create_request(
            self.endpoints.login(),
            HttpMethod::Post,
            vec![],
            vec![],
            Some(body),
            Some("application/json".to_string()),
            Duration::from_secs(4),
        );

        let response = self.http_client.execute(http_request).await?;
        let raw = response.body.ok_or(SyncError::NoResponseBody)?;
        let decoded: LoginResponse = serde_json::from_slice(&raw)
            .map_err(|e| SyncError::UnableToDecodeResponse(e.to_string()))?;
        Ok((decoded.token, decoded.protected_encryption_key, decoded.devices))
    }

    /// `logout(device_id, token)` — the server must echo `device_id` or the
    /// call is considered failed (spec.md §4.5, §6).
    pub async fn logout(&self, device_id: &str, token: &str) -> Result<()> {
        let request = LogoutRequest {
            device_id: device_id.to_string(),
        };
        let body = serde_json::to_vec(&request)?;
        let http_request = self.http_client.create_request(
            self.endpoints.logout(),
            HttpMethod::Post,
            vec![bearer_header(token)],
            vec![],
            Some(body),
            Some("application/json".to_string()),
            Duration::from_secs(4),
        );

        let response = self.http_client.execute(http_request).await?;
        let raw = response.body.ok_or(SyncError::NoResponseBody)?;
        let decoded: LogoutResponse = serde_json::from_slice(&raw)
            .map_err(|e| SyncError::UnableToDecodeResponse(e.to_string()))?;

        if decoded.device_id != device_id {
            warn!("logout response echoed a different device_id than requested");
            return Err(SyncError::UnexpectedResponseBody(
                "logout response did not echo device_id".to_string(),
            ));
        }

        self.secure_store.remove_account()?;
        self.clear_device_cache();
        debug!("device {device_id} logged out");
        Ok(())
    }

    /// `delete_account(account)` — removes the local Account only on success
    /// (spec.md §4.5).
    pub async fn delete_account(&self, account: &Account) -> Result<()> {
        let http_request = self.http_client.create_request(
            self.endpoints.delete_account(),
            HttpMethod::Post,
            vec![bearer_header(&account.token)],
            vec![],
            None,
            None,
            Duration::from_secs(4),
        );

        self.http_client.execute(http_request).await?;
        self.secure_store.remove_account()?;
        self.clear_device_cache();
        info!("account {} deleted", account.user_id);
        Ok(())
    }

    /// `fetch_devices(account) -> [{device_id, device_name, device_type}]`
    /// (spec.md §4.5). Non-authoritative cache cleared on logout/delete.
    pub async fn fetch_devices(&self, account: &Account) -> Result<Vec<DeviceInfo>> {
        let http_request = self.http_client.create_request(
            self.endpoints.devices(),
            HttpMethod::Get,
            vec![bearer_header(&account.token)],
            vec![],
            None,
            None,
            Duration::from_secs(4),
        );

        let response = self.http_client.execute(http_request).await?;
        let raw = response.body.ok_or(SyncError::NoResponseBody)?;
        let devices: Vec<DeviceInfo> = serde_json::from_slice(&raw)
            .map_err(|e| SyncError::UnableToDecodeResponse(e.to_string()))?;

        *self.device_cache.lock().expect("device cache lock poisoned") = Some(devices.clone());
        Ok(devices)
    }

    /// The last-fetched device list, if any has been cached yet.
    pub fn cached_devices(&self) -> Option<Vec<DeviceInfo>> {
        self.device_cache.lock().expect("device cache lock poisoned").clone()
    }
}
