//! Persists the single local `Account` (spec.md §4.2).
//!
//! The concrete keychain-backed implementation is an external collaborator
//! (spec.md §1 carve-out); this module provides the `SecretStore` trait and
//! an in-process stand-in suitable for tests and short-lived processes,
//! grounded in the teacher's `wealthfolio_core::secrets::SecretStore` /
//! `KeyringSecretStore` split.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use crate::error::Result;
use crate::types::Account;

/// Storage backend for the local `Account` (spec.md §4.2).
///
/// A single process-wide lock guards all access: concurrent callers
/// serialize rather than race on read-modify-write of the account record.
pub trait SecretStore: Send + Sync {
    /// Persist `account`, replacing any existing one.
    fn persist(&self, account: Account) -> Result<()>;

    /// The currently persisted account, if any.
    fn account(&self) -> Result<Option<Account>>;

    /// Remove the persisted account (spec.md §4.5 `delete_account`/`logout`).
    fn remove_account(&self) -> Result<()>;
}

/// Backs every `InMemorySecureStore::new()` instance in the process, the way
/// the teacher guards `SNAPSHOT_UPLOAD_IN_FLIGHT` in `device-sync/src/client.rs`
/// with a single `OnceLock<Mutex<..>>`.
static SHARED_ACCOUNT: OnceLock<Mutex<Option<Account>>> = OnceLock::new();

fn shared_account_lock() -> &'static Mutex<Option<Account>> {
    SHARED_ACCOUNT.get_or_init(|| Mutex::new(None))
}

enum Storage {
    /// Backed by `SHARED_ACCOUNT`; every instance in `Storage::Shared` mode
    /// sees the same account, as spec.md §4.2/§5 require.
    Shared,
    /// A private `Mutex` scoped to this instance, for test isolation.
    Isolated(Mutex<Option<Account>>),
}

/// An in-memory `SecretStore`. The secret key material zeroizes on drop
/// because it is held in `Account`'s `KeyBytes` fields, not because this
/// store does anything special — the same guarantee a keyring-backed store
/// gets for free from the OS.
pub struct InMemorySecureStore {
    storage: Storage,
}

impl InMemorySecureStore {
    /// Production constructor. Every instance shares one process-wide lock
    /// over one account slot, so `persist`/`remove_account` on any instance
    /// is visible through any other.
    pub fn new() -> Self {
        Self {
            storage: Storage::Shared,
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Test-only constructor with a private, per-instance account slot.
    /// Tests run concurrently and must not see each other's accounts through
    /// the process-wide static that production code relies on.
    #[cfg(test)]
    pub fn new_isolated_for_test() -> Self {
        Self {
            storage: Storage::Isolated(Mutex::new(None)),
        }
    }

    fn with_lock<T>(&self, f: impl FnOnce(MutexGuard<'_, Option<Account>>) -> T) -> T {
        match &self.storage {
            Storage::Shared => f(shared_account_lock().lock().expect("secure store lock poisoned")),
            Storage::Isolated(mutex) => f(mutex.lock().expect("secure store lock poisoned")),
        }
    }
}

impl Default for InMemorySecureStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretStore for InMemorySecureStore {
    fn persist(&self, account: Account) -> Result<()> {
        self.with_lock(|mut guard| {
            *guard = Some(account);
            Ok(())
        })
    }

    fn account(&self) -> Result<Option<Account>> {
        self.with_lock(|guard| Ok(guard.clone()))
    }

    fn remove_account(&self) -> Result<()> {
        self.with_lock(|mut guard| {
            *guard = None;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccountState, KeyBytes};

    fn sample_account() -> Account {
        Account {
            user_id: "user-1".to_string(),
            primary_key: KeyBytes([1u8; 32]),
            secret_key: KeyBytes([2u8; 32]),
            token: "tok".to_string(),
            device_id: "device-1".to_string(),
            device_name: "Test Device".to_string(),
            device_type: "desktop".to_string(),
            state: AccountState::Active,
        }
    }

    #[test]
    fn persisted_account_round_trips() {
        let store = InMemorySecureStore::new_isolated_for_test();
        assert!(store.account().unwrap().is_none());

        store.persist(sample_account()).unwrap();
        let fetched = store.account().unwrap().expect("account present");
        assert_eq!(fetched.user_id, "user-1");

        store.remove_account().unwrap();
        assert!(store.account().unwrap().is_none());
    }

    #[test]
    fn persist_replaces_existing_account() {
        let store = InMemorySecureStore::new_isolated_for_test();
        store.persist(sample_account()).unwrap();
        let mut second = sample_account();
        second.device_name = "Other Device".to_string();
        store.persist(second).unwrap();

        let fetched = store.account().unwrap().unwrap();
        assert_eq!(fetched.device_name, "Other Device");
    }

    /// Exercises `InMemorySecureStore::new()`'s process-wide sharing
    /// directly; the only test in the crate allowed to touch it, so it
    /// can't race with another test's account.
    #[test]
    fn new_instances_share_process_wide_storage() {
        let a = InMemorySecureStore::new();
        let b = InMemorySecureStore::new();

        a.persist(sample_account()).unwrap();
        assert_eq!(b.account().unwrap().unwrap().user_id, "user-1");

        b.remove_account().unwrap();
        assert!(a.account().unwrap().is_none());
    }
}
