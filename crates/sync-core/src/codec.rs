//! Wire envelope encode/decode and gzip compression (spec.md §4.10, §6).

use std::collections::HashMap;
use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;

use crate::error::{GzipError, Result, SyncError};
use crate::types::{Feature, FeatureRequestBody, FeatureResponseBody, Syncable};

/// Build the outbound PATCH envelope: `{"<feature>": {"updates": [...],
/// "modified_since": ...}}`. Supports merging more than one feature into a
/// single body even though current callers send one feature per PATCH
/// (spec.md §9 Open Question).
pub fn encode_patch_envelope(
    features: &[(Feature, Vec<Syncable>, Option<String>)],
) -> Result<Vec<u8>> {
    let mut envelope = serde_json::Map::new();
    for (feature, updates, modified_since) in features {
        let body = FeatureRequestBody {
            updates: updates.clone(),
            modified_since: modified_since.clone(),
        };
        envelope.insert(feature.name().to_string(), serde_json::to_value(body)?);
    }
    Ok(serde_json::to_vec(&Value::Object(envelope))?)
}

/// Decode the inbound response: `{"<feature>": {"last_modified": "...",
/// "entries": [...]}}`. A missing key for a requested feature while status
/// was 200 is a decode failure (spec.md §4.10, §8 invariant 5).
pub fn decode_response_envelope(
    body: &[u8],
    expected_features: &[Feature],
) -> Result<HashMap<String, FeatureResponseBody>> {
    let mut parsed: HashMap<String, FeatureResponseBody> = serde_json::from_slice(body)
        .map_err(|e| SyncError::UnableToDecodeResponse(e.to_string()))?;

    for feature in expected_features {
        if !parsed.contains_key(feature.name()) {
            return Err(SyncError::UnexpectedResponseBody(format!(
                "missing feature key {:?} in 200 response",
                feature.name()
            )));
        }
    }

    for (_, response) in parsed.iter() {
        if response.last_modified.is_empty() {
            return Err(SyncError::UnexpectedResponseBody(
                "last_modified must not be empty".to_string(),
            ));
        }
    }

    parsed.retain(|name, _| expected_features.iter().any(|f| f.name() == name));
    Ok(parsed)
}

/// Gzip-compress a payload. Mapped to the numeric error codes spec.md §6
/// specifies for observability.
pub fn gzip_compress(payload: &[u8]) -> std::result::Result<Vec<u8>, GzipError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(payload)
        .map_err(|e| GzipError::from_io(&e))?;
    encoder.finish().map_err(|e| GzipError::from_io(&e))
}

/// Gzip-decompress a payload (used by tests and any future server-initiated
/// compressed push; the outbound PATCH path is the only one exercised in
/// normal operation).
pub fn gzip_decompress(payload: &[u8]) -> std::result::Result<Vec<u8>, GzipError> {
    let mut decoder = GzDecoder::new(payload);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| GzipError::from_io(&e))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn syncable(id: &str) -> Syncable {
        Syncable {
            id: id.to_string(),
            deleted: false,
            fields: serde_json::Map::new(),
        }
    }

    #[test]
    fn encodes_single_feature_envelope_with_exactly_one_top_level_key() {
        let features = vec![(
            Feature::new("bookmarks"),
            vec![syncable("b1")],
            Some("T1".to_string()),
        )];
        let bytes = encode_patch_envelope(&features).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 1);
        assert!(obj.contains_key("bookmarks"));
        assert_eq!(obj["bookmarks"]["modified_since"], json!("T1"));
    }

    #[test]
    fn encodes_multi_feature_envelope() {
        let features = vec![
            (Feature::new("bookmarks"), vec![], None),
            (Feature::new("history"), vec![syncable("h1")], None),
        ];
        let bytes = encode_patch_envelope(&features).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 2);
    }

    #[test]
    fn missing_feature_key_in_200_response_is_a_decode_failure() {
        let body = br#"{"history":{"last_modified":"T1","entries":[]}}"#;
        let err = decode_response_envelope(body, &[Feature::new("bookmarks")]).unwrap_err();
        assert!(matches!(err, SyncError::UnexpectedResponseBody(_)));
    }

    #[test]
    fn decodes_entries_for_the_requested_feature() {
        let body = br#"{"bookmarks":{"last_modified":"T1","entries":[{"id":"b1","title":"x"}]}}"#;
        let decoded = decode_response_envelope(body, &[Feature::new("bookmarks")]).unwrap();
        let bookmarks = &decoded["bookmarks"];
        assert_eq!(bookmarks.last_modified, "T1");
        assert_eq!(bookmarks.entries.len(), 1);
    }

    #[test]
    fn gzip_round_trips() {
        let payload = b"some json payload".repeat(10);
        let compressed = gzip_compress(&payload).unwrap();
        assert_ne!(compressed, payload);
        let decompressed = gzip_decompress(&compressed).unwrap();
        assert_eq!(decompressed, payload);
    }
}
