//! A small in-memory bookmark tree implementing `sync_core::provider::DataProvider`.
//!
//! Illustrative only: shows what a real feature's adapter looks like against
//! the sync engine core. Not part of the engine itself.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use sync_core::error::SyncError;
use sync_core::provider::{Crypter, DataProvider};
use sync_core::types::{Feature, FeatureSyncSetupState, Syncable};

/// One bookmark. `title` and `url` are the only fields encrypted before
/// leaving the device; `parent_id` and ordering are left in the clear so a
/// server could offer folder-aware features without decrypting content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bookmark {
    pub id: String,
    pub parent_id: Option<String>,
    pub title: String,
    pub url: String,
    pub position: i32,
}

struct State {
    bookmarks: HashMap<String, Bookmark>,
    tombstones: Vec<String>,
    dirty: HashSet<String>,
    last_sync_timestamp: Option<String>,
    setup_state: FeatureSyncSetupState,
    registered: bool,
}

/// `DataProvider` for a bookmark tree, backed by an in-process store.
pub struct BookmarksProvider {
    state: Mutex<State>,
}

impl BookmarksProvider {
    pub fn new() -> Self {
        BookmarksProvider {
            state: Mutex::new(State {
                bookmarks: HashMap::new(),
                tombstones: Vec::new(),
                dirty: HashSet::new(),
                last_sync_timestamp: None,
                setup_state: FeatureSyncSetupState::NeedsRemoteDataFetch,
                registered: false,
            }),
        }
    }

    /// Insert or update a bookmark locally and mark it dirty for the next
    /// sync cycle.
    pub fn upsert(&self, bookmark: Bookmark) {
        let mut state = self.state.lock().expect("bookmarks lock poisoned");
        state.dirty.insert(bookmark.id.clone());
        state.bookmarks.insert(bookmark.id.clone(), bookmark);
    }

    /// Mark a bookmark deleted locally and mark it dirty for the next sync
    /// cycle.
    pub fn delete(&self, id: &str) {
        let mut state = self.state.lock().expect("bookmarks lock poisoned");
        state.bookmarks.remove(id);
        state.tombstones.push(id.to_string());
        state.dirty.insert(id.to_string());
    }

    pub fn get(&self, id: &str) -> Option<Bookmark> {
        self.state
            .lock()
            .expect("bookmarks lock poisoned")
            .bookmarks
            .get(id)
            .cloned()
    }

    pub fn all(&self) -> Vec<Bookmark> {
        self.state
            .lock()
            .expect("bookmarks lock poisoned")
            .bookmarks
            .values()
            .cloned()
            .collect()
    }
}

impl Default for BookmarksProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn encode(crypter: &Crypter, bookmark: &Bookmark) -> Result<Syncable, SyncError> {
    let title = crypter.encrypt(&bookmark.title)?;
    let url = crypter.encrypt(&bookmark.url)?;
    let mut fields = serde_json::Map::new();
    fields.insert("title".to_string(), json!(title));
    fields.insert("url".to_string(), json!(url));
    fields.insert("parent_id".to_string(), json!(bookmark.parent_id));
    fields.insert("position".to_string(), json!(bookmark.position));
    Ok(Syncable {
        id: bookmark.id.clone(),
        deleted: false,
        fields,
    })
}

fn encode_tombstone(id: &str) -> Syncable {
    Syncable {
        id: id.to_string(),
        deleted: true,
        fields: serde_json::Map::new(),
    }
}

fn decode(crypter: &Crypter, item: &Syncable) -> Result<Bookmark, SyncError> {
    let title = item
        .fields
        .get("title")
        .and_then(|v| v.as_str())
        .ok_or_else(|| SyncError::InvalidDataInResponse("bookmark missing title".to_string()))?;
    let url = item
        .fields
        .get("url")
        .and_then(|v| v.as_str())
        .ok_or_else(|| SyncError::InvalidDataInResponse("bookmark missing url".to_string()))?;
    let parent_id = item
        .fields
        .get("parent_id")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let position = item
        .fields
        .get("position")
        .and_then(|v| v.as_i64())
        .unwrap_or(0) as i32;

    Ok(Bookmark {
        id: item.id.clone(),
        parent_id,
        title: crypter.decrypt(title)?,
        url: crypter.decrypt(url)?,
        position,
    })
}

#[async_trait]
impl DataProvider for BookmarksProvider {
    fn feature(&self) -> Feature {
        Feature::new("bookmarks")
    }

    fn is_registered(&self) -> bool {
        self.state.lock().expect("bookmarks lock poisoned").registered
    }

    fn feature_sync_setup_state(&self) -> FeatureSyncSetupState {
        self.state.lock().expect("bookmarks lock poisoned").setup_state
    }

    fn register_feature(&self, state: FeatureSyncSetupState) {
        let mut guard = self.state.lock().expect("bookmarks lock poisoned");
        guard.setup_state = state;
        guard.registered = true;
    }

    fn last_sync_timestamp(&self) -> Option<String> {
        self.state
            .lock()
            .expect("bookmarks lock poisoned")
            .last_sync_timestamp
            .clone()
    }

    async fn prepare_for_first_sync(&self) -> Result<(), SyncError> {
        Ok(())
    }

    async fn fetch_changed_objects(&self, crypter: &Crypter) -> Result<Vec<Syncable>, SyncError> {
        let (dirty, bookmarks, tombstones) = {
            let mut guard = self.state.lock().expect("bookmarks lock poisoned");
            let dirty = std::mem::take(&mut guard.dirty);
            (dirty, guard.bookmarks.clone(), std::mem::take(&mut guard.tombstones))
        };

        let mut out = Vec::with_capacity(dirty.len());
        for id in dirty {
            if tombstones.contains(&id) {
                out.push(encode_tombstone(&id));
            } else if let Some(bookmark) = bookmarks.get(&id) {
                out.push(encode(crypter, bookmark)?);
            }
        }
        Ok(out)
    }

    async fn handle_sync_response(
        &self,
        received: Vec<Syncable>,
        _client_timestamp: &str,
        server_timestamp: Option<&str>,
        crypter: &Crypter,
    ) -> Result<(), SyncError> {
        let mut decoded = Vec::with_capacity(received.len());
        for item in &received {
            if !item.deleted {
                decoded.push(decode(crypter, item)?);
            }
        }

        let mut guard = self.state.lock().expect("bookmarks lock poisoned");
        for item in &received {
            if item.deleted {
                guard.bookmarks.remove(&item.id);
            }
        }
        for bookmark in decoded {
            guard.bookmarks.insert(bookmark.id.clone(), bookmark);
        }
        if let Some(ts) = server_timestamp {
            guard.last_sync_timestamp = Some(ts.to_string());
        }
        Ok(())
    }

    async fn handle_initial_sync_response(
        &self,
        received: Vec<Syncable>,
        client_timestamp: &str,
        server_timestamp: Option<&str>,
        crypter: &Crypter,
    ) -> Result<(), SyncError> {
        self.handle_sync_response(received, client_timestamp, server_timestamp, crypter)
            .await
    }

    async fn handle_sync_error(&self, _error: &SyncError) {}
}
