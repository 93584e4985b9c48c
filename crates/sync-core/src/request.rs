//! Assembles `HttpRequest`s for the sync GET/PATCH routes (spec.md §4.10, §6).

use std::time::Duration;

use crate::codec::{encode_patch_envelope, gzip_compress};
use crate::endpoints::Endpoints;
use crate::error::{Result, SyncError};
use crate::http_client::{bearer_header, HttpClient, HttpMethod, HttpRequest};
use crate::types::{Feature, Syncable};

const CONTENT_ENCODING_GZIP: (&str, &str) = ("Content-Encoding", "gzip");

/// Builds the GET and PATCH requests for the sync wire protocol. Stateless;
/// holds nothing the caller couldn't pass in directly, kept as a type for
/// symmetry with the other components spec.md names.
pub struct RequestMaker<'a> {
    http_client: &'a HttpClient,
    endpoints: &'a Endpoints,
}

impl<'a> RequestMaker<'a> {
    pub fn new(http_client: &'a HttpClient, endpoints: &'a Endpoints) -> Self {
        RequestMaker {
            http_client,
            endpoints,
        }
    }

    /// `GET sync/<f1>,<f2>,...` — used when a feature's collected changes are
    /// empty (spec.md §4.9 tie-break: GET, not PATCH with empty updates).
    pub fn build_get(&self, features: &[Feature], token: &str, timeout: Duration) -> HttpRequest {
        let names: Vec<&str> = features.iter().map(Feature::name).collect();
        self.http_client.create_request(
            self.endpoints.sync_get(&names),
            HttpMethod::Get,
            vec![bearer_header(token)],
            vec![],
            None,
            None,
            timeout,
        )
    }

    /// `PATCH sync/data`, gzip-compressed unless `gzip` is false (spec.md
    /// §4.9 step c: gzip failure triggers exactly one uncompressed retry).
    pub fn build_patch(
        &self,
        feature: &Feature,
        updates: Vec<Syncable>,
        modified_since: Option<String>,
        token: &str,
        timeout: Duration,
        gzip: bool,
    ) -> Result<HttpRequest> {
        let envelope = encode_patch_envelope(&[(feature.clone(), updates, modified_since)])?;

        let mut headers = vec![bearer_header(token)];
        let body = if gzip {
            let compressed = gzip_compress(&envelope)
                .map_err(|e| SyncError::PatchPayloadCompressionFailed(e.0))?;
            headers.push((
                CONTENT_ENCODING_GZIP.0.to_string(),
                CONTENT_ENCODING_GZIP.1.to_string(),
            ));
            compressed
        } else {
            envelope
        };

        Ok(self.http_client.create_request(
            self.endpoints.sync_patch(),
            HttpMethod::Patch,
            headers,
            vec![],
            Some(body),
            Some("application/json".to_string()),
            timeout,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_request_carries_bearer_auth_and_comma_joined_features() {
        let http_client = HttpClient::new();
        let endpoints = Endpoints::new("https://s.example");
        let maker = RequestMaker::new(&http_client, &endpoints);

        let request = maker.build_get(
            &[Feature::new("bookmarks"), Feature::new("history")],
            "tok",
            Duration::from_secs(4),
        );

        assert_eq!(request.url, "https://s.example/sync/bookmarks,history");
        assert!(request
            .headers
            .contains(&("Authorization".to_string(), "Bearer tok".to_string())));
    }

    #[test]
    fn gzip_patch_request_sets_content_encoding_header() {
        let http_client = HttpClient::new();
        let endpoints = Endpoints::new("https://s.example");
        let maker = RequestMaker::new(&http_client, &endpoints);

        let request = maker
            .build_patch(
                &Feature::new("bookmarks"),
                vec![],
                Some("T1".to_string()),
                "tok",
                Duration::from_secs(60),
                true,
            )
            .unwrap();

        assert!(request
            .headers
            .iter()
            .any(|(k, v)| k == "Content-Encoding" && v == "gzip"));
    }

    #[test]
    fn uncompressed_patch_request_has_no_content_encoding_header() {
        let http_client = HttpClient::new();
        let endpoints = Endpoints::new("https://s.example");
        let maker = RequestMaker::new(&http_client, &endpoints);

        let request = maker
            .build_patch(
                &Feature::new("bookmarks"),
                vec![],
                None,
                "tok",
                Duration::from_secs(60),
                false,
            )
            .unwrap();

        assert!(!request.headers.iter().any(|(k, _)| k == "Content-Encoding"));
    }
}
