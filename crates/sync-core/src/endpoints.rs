//! Fixed URL construction from a base URL (spec.md §4.3).

/// Immutable set of URLs derived from a base URL. Cheap to rebuild when the
/// environment switch flips, so callers just construct a new `Endpoints`
/// rather than mutate one in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    base_url: String,
}

impl Endpoints {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Endpoints { base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn signup(&self) -> String {
        format!("{}/sync/signup", self.base_url)
    }

    pub fn login(&self) -> String {
        format!("{}/sync/login", self.base_url)
    }

    pub fn logout(&self) -> String {
        format!("{}/sync/logout-device", self.base_url)
    }

    pub fn delete_account(&self) -> String {
        format!("{}/sync/delete-account", self.base_url)
    }

    pub fn connect(&self) -> String {
        format!("{}/sync/connect", self.base_url)
    }

    pub fn connect_poll(&self, device_id: &str) -> String {
        format!(
            "{}/sync/connect/{}",
            self.base_url,
            urlencoding::encode(device_id)
        )
    }

    /// `GET sync/<f1>,<f2>,...` (spec.md §4.3, §4.10).
    pub fn sync_get(&self, features: &[&str]) -> String {
        let joined = features.join(",");
        format!("{}/sync/{}", self.base_url, joined)
    }

    /// `PATCH sync/data`.
    pub fn sync_patch(&self) -> String {
        format!("{}/sync/data", self.base_url)
    }

    /// `GET sync/devices` — spec.md §4.5 names `fetch_devices` as an
    /// operation but §6 doesn't pin its route; this follows the same
    /// `sync/<noun>` convention as the rest of the surface.
    pub fn devices(&self) -> String {
        format!("{}/sync/devices", self.base_url)
    }
}
