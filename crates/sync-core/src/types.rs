//! Domain and wire types (spec.md §3, §6).

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Lifecycle state of the local `Account` (spec.md §3).
///
/// The source material spells the first-sync state two ways
/// (`addingNewDevice` / `addNewDevice`); this crate settles on
/// `AddNewDevice` (see DESIGN.md Open Questions); behavior is identical
/// either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountState {
    Inactive,
    Active,
    AddNewDevice,
}

/// 32 bytes of key material that zeroizes on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyBytes(pub [u8; 32]);

impl KeyBytes {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for KeyBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyBytes(..)")
    }
}

impl PartialEq for KeyBytes {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for KeyBytes {}

/// The single-user sync identity persisted by `SecureStore` (spec.md §3).
#[derive(Clone)]
pub struct Account {
    pub user_id: String,
    pub primary_key: KeyBytes,
    pub secret_key: KeyBytes,
    pub token: String,
    pub device_id: String,
    pub device_name: String,
    pub device_type: String,
    pub state: AccountState,
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("device_name", &self.device_name)
            .field("device_type", &self.device_type)
            .field("state", &self.state)
            .field("token", &"<redacted>")
            .field("primary_key", &"<redacted>")
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Restore credential (spec.md §3).
#[derive(Clone)]
pub struct RecoveryKey {
    pub user_id: String,
    pub primary_key: KeyBytes,
}

/// The self-describing "sync code" JSON wrapper for a `RecoveryKey`
/// (spec.md §6, §9 glossary).
#[derive(Debug, Serialize, Deserialize)]
struct RecoveryCodeWrapper {
    recovery: RecoveryCodeInner,
}

#[derive(Debug, Serialize, Deserialize)]
struct RecoveryCodeInner {
    user_id: String,
    primary_key: String,
}

impl RecoveryKey {
    /// Encode as the base64-wrapped "sync code" JSON envelope.
    pub fn encode_sync_code(&self) -> String {
        let wrapper = RecoveryCodeWrapper {
            recovery: RecoveryCodeInner {
                user_id: self.user_id.clone(),
                primary_key: base64::engine::general_purpose::STANDARD
                    .encode(self.primary_key.as_bytes()),
            },
        };
        let json = serde_json::to_vec(&wrapper).expect("recovery code serializes");
        base64::engine::general_purpose::STANDARD.encode(json)
    }

    /// Decode a base64-wrapped "sync code" JSON envelope.
    pub fn decode_sync_code(code: &str) -> crate::error::Result<Self> {
        let json = base64::engine::general_purpose::STANDARD
            .decode(code.trim())
            .map_err(|e| crate::error::SyncError::InvalidDataInResponse(e.to_string()))?;
        let wrapper: RecoveryCodeWrapper = serde_json::from_slice(&json)?;
        let primary_key_bytes = base64::engine::general_purpose::STANDARD
            .decode(wrapper.recovery.primary_key)
            .map_err(|e| crate::error::SyncError::InvalidDataInResponse(e.to_string()))?;
        let primary_key: [u8; 32] = primary_key_bytes.as_slice().try_into().map_err(|_| {
            crate::error::SyncError::InvalidDataInResponse("primary_key must be 32 bytes".into())
        })?;
        Ok(RecoveryKey {
            user_id: wrapper.recovery.user_id,
            primary_key: KeyBytes(primary_key),
        })
    }
}

use base64::Engine;

/// Device-to-device handoff state (spec.md §3).
#[derive(Clone)]
pub struct ConnectInfo {
    pub device_id: String,
    pub public_key: [u8; 32],
    pub secret_key: KeyBytes,
}

#[derive(Debug, Serialize, Deserialize)]
struct ConnectCodeWrapper {
    connect: ConnectCodeInner,
}

#[derive(Debug, Serialize, Deserialize)]
struct ConnectCodeInner {
    device_id: String,
    // Named `secret_key` on the wire by design; it carries the public half
    // of the ephemeral pair (spec.md §6).
    secret_key: String,
}

impl ConnectInfo {
    /// Encode the publishable "connect code": `{device_id, public_key}`.
    pub fn encode_connect_code(&self) -> String {
        let wrapper = ConnectCodeWrapper {
            connect: ConnectCodeInner {
                device_id: self.device_id.clone(),
                secret_key: base64::engine::general_purpose::STANDARD.encode(self.public_key),
            },
        };
        let json = serde_json::to_vec(&wrapper).expect("connect code serializes");
        base64::engine::general_purpose::STANDARD.encode(json)
    }

    /// Decode a connect code into `(device_id, public_key)`.
    pub fn decode_connect_code(code: &str) -> crate::error::Result<(String, [u8; 32])> {
        let json = base64::engine::general_purpose::STANDARD
            .decode(code.trim())
            .map_err(|e| crate::error::SyncError::InvalidDataInResponse(e.to_string()))?;
        let wrapper: ConnectCodeWrapper = serde_json::from_slice(&json)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(wrapper.connect.secret_key)
            .map_err(|e| crate::error::SyncError::InvalidDataInResponse(e.to_string()))?;
        let public_key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            crate::error::SyncError::InvalidDataInResponse("public_key must be 32 bytes".into())
        })?;
        Ok((wrapper.connect.device_id, public_key))
    }
}

/// Identity of a synced data kind (spec.md §3). Equality is by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Feature(pub String);

impl Feature {
    pub fn new(name: impl Into<String>) -> Self {
        Feature(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One record of one feature — an opaque JSON object (spec.md §3, §9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Syncable {
    pub id: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

/// Setup state of a `DataProvider` for a feature (spec.md §4.9, §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureSyncSetupState {
    NeedsRemoteDataFetch,
    ReadyToSync,
}

// ───────────────────────────────────────────────────────────────────────────
// Wire types (spec.md §6)
// ───────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct SignupRequest {
    pub user_id: String,
    pub hashed_password: String,
    pub protected_encryption_key: String,
    pub device_id: String,
    pub device_name: String,
    pub device_type: String,
}

#[derive(Debug, Deserialize)]
pub struct SignupResponse {
    pub user_id: String,
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct LoginRequest {
    pub user_id: String,
    pub hashed_password: String,
    pub device_id: String,
    pub device_name: String,
    pub device_type: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub protected_encryption_key: String,
    pub devices: Vec<DeviceInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_name: String,
    pub device_type: String,
}

#[derive(Debug, Serialize)]
pub struct LogoutRequest {
    pub device_id: String,
}

#[derive(Debug, Deserialize)]
pub struct LogoutResponse {
    pub device_id: String,
}

#[derive(Debug, Serialize)]
pub struct ConnectSubmitRequest {
    pub device_id: String,
    pub encrypted_recovery_key: String,
}

#[derive(Debug, Deserialize)]
pub struct ConnectPollResponse {
    pub encrypted_recovery_key: String,
}

/// Inbound per-feature response body (spec.md §4.10).
#[derive(Debug, Deserialize)]
pub struct FeatureResponseBody {
    pub last_modified: String,
    #[serde(default)]
    pub entries: Vec<Syncable>,
}

/// Outbound per-feature PATCH body (spec.md §4.10).
#[derive(Debug, Serialize)]
pub struct FeatureRequestBody {
    pub updates: Vec<Syncable>,
    pub modified_since: Option<String>,
}
