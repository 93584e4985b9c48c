//! Device-to-device pairing without a typed recovery code (spec.md §4.6).

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use base64::Engine;
use log::debug;
use tokio::time::sleep;

use crate::crypto;
use crate::endpoints::Endpoints;
use crate::error::{Result, SyncError};
use crate::http_client::{bearer_header, HttpClient, HttpMethod};
use crate::types::{ConnectInfo, ConnectPollResponse, ConnectSubmitRequest, RecoveryKey};

/// Interval between connect-poll GETs (spec.md §4.6).
pub const CONNECT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Runs on the "new" device: publishes a connect code, then polls for the
/// sealed recovery key (spec.md §4.6).
pub struct RemoteConnector<'a> {
    http_client: &'a HttpClient,
    endpoints: &'a Endpoints,
}

impl<'a> RemoteConnector<'a> {
    pub fn new(http_client: &'a HttpClient, endpoints: &'a Endpoints) -> Self {
        RemoteConnector {
            http_client,
            endpoints,
        }
    }

    /// `prepare_for_connect()` plus the encoded "connect code" to publish
    /// out-of-band (spec.md §4.1, §4.6).
    pub fn begin(&self) -> Result<(ConnectInfo, String)> {
        let connect_info = crypto::prepare_for_connect()?;
        let code = connect_info.encode_connect_code();
        Ok((connect_info, code))
    }

    /// Poll `GET sync/connect/{device_id}` every `CONNECT_POLL_INTERVAL`
    /// until the sealed recovery key arrives, 404 means "not yet". Checks
    /// `cancel` between sleeps so cancellation stops polling promptly
    /// (spec.md §4.6).
    pub async fn poll_for_recovery_key(
        &self,
        connect_info: &ConnectInfo,
        cancel: &AtomicBool,
    ) -> Result<RecoveryKey> {
        self.poll_for_recovery_key_with_interval(connect_info, cancel, CONNECT_POLL_INTERVAL)
            .await
    }

    /// Same as `poll_for_recovery_key` with an explicit poll interval, so
    /// tests don't have to wait on the real 5-second cadence.
    pub async fn poll_for_recovery_key_with_interval(
        &self,
        connect_info: &ConnectInfo,
        cancel: &AtomicBool,
        poll_interval: Duration,
    ) -> Result<RecoveryKey> {
        loop {
            if cancel.load(Ordering::SeqCst) {
                return Err(SyncError::Cancelled);
            }

            let request = self.http_client.create_request(
                self.endpoints.connect_poll(&connect_info.device_id),
                HttpMethod::Get,
                vec![],
                vec![],
                None,
                None,
                Duration::from_secs(4),
            );

            match self.http_client.execute(request).await {
                Ok(response) => {
                    if let Some(body) = response.body {
                        let decoded: ConnectPollResponse = serde_json::from_slice(&body)
                            .map_err(|e| SyncError::UnableToDecodeResponse(e.to_string()))?;
                        let sealed = base64::engine::general_purpose::STANDARD
                            .decode(decoded.encrypted_recovery_key)
                            .map_err(|e| SyncError::InvalidDataInResponse(e.to_string()))?;
                        let opened = crypto::unseal(
                            &sealed,
                            &connect_info.public_key,
                            &connect_info.secret_key,
                        )?;
                        let sync_code = String::from_utf8(opened)
                            .map_err(|_| SyncError::InvalidDataInResponse(
                                "unsealed payload was not valid UTF-8".to_string(),
                            ))?;
                        debug!("connect poll received recovery key for device {}", connect_info.device_id);
                        return RecoveryKey::decode_sync_code(&sync_code);
                    }
                }
                Err(SyncError::UnexpectedStatusCode(404)) => {
                    // not yet available, keep polling
                }
                Err(other) => return Err(other),
            }

            if cancel.load(Ordering::SeqCst) {
                return Err(SyncError::Cancelled);
            }
            sleep(poll_interval).await;
        }
    }
}

/// Runs on the already-signed-in "source" device: seals the recovery key to
/// the new device's public key and submits it (spec.md §4.6).
pub struct RecoveryKeyTransmitter<'a> {
    http_client: &'a HttpClient,
    endpoints: &'a Endpoints,
}

impl<'a> RecoveryKeyTransmitter<'a> {
    pub fn new(http_client: &'a HttpClient, endpoints: &'a Endpoints) -> Self {
        RecoveryKeyTransmitter {
            http_client,
            endpoints,
        }
    }

    /// Decode a connect code, seal `recovery_key` to it, and POST to
    /// `/sync/connect`.
    pub async fn send(&self, connect_code: &str, recovery_key: &RecoveryKey, token: &str) -> Result<()> {
        let (device_id, public_key) = ConnectInfo::decode_connect_code(connect_code)?;
        let sync_code = recovery_key.encode_sync_code();
        let sealed = crypto::seal(sync_code.as_bytes(), &public_key)?;
        let encrypted_recovery_key = base64::engine::general_purpose::STANDARD.encode(sealed);

        let request = ConnectSubmitRequest {
            device_id,
            encrypted_recovery_key,
        };
        let body = serde_json::to_vec(&request)?;

        let http_request = self.http_client.create_request(
            self.endpoints.connect(),
            HttpMethod::Post,
            vec![bearer_header(token)],
            vec![],
            Some(body),
            Some("application/json".to_string()),
            Duration::from_secs(4),
        );

        self.http_client.execute(http_request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_code_round_trips_device_id_and_public_key() {
        let connect_info = crypto::prepare_for_connect().unwrap();
        let code = connect_info.encode_connect_code();
        let (device_id, public_key) = ConnectInfo::decode_connect_code(&code).unwrap();
        assert_eq!(device_id, connect_info.device_id);
        assert_eq!(public_key, connect_info.public_key);
    }

    #[tokio::test]
    async fn poll_stops_after_recovery_key_arrives() {
        use std::io::{Read, Write};
        use std::net::TcpListener;

        let connect_info = crypto::prepare_for_connect().unwrap();
        let recovery_key = RecoveryKey {
            user_id: "u1".to_string(),
            primary_key: crate::types::KeyBytes([9u8; 32]),
        };
        let sync_code = recovery_key.encode_sync_code();
        let sealed = crypto::seal(sync_code.as_bytes(), &connect_info.public_key).unwrap();
        let encrypted_recovery_key = base64::engine::general_purpose::STANDARD.encode(sealed);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server_task = tokio::task::spawn_blocking(move || {
            // First request: 404 ("not yet").
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf);
            let _ = stream.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n");
            drop(stream);

            // Second request: 200 with the sealed payload.
            let (mut stream, _) = listener.accept().unwrap();
            let _ = stream.read(&mut buf);
            let body = format!(r#"{{"encrypted_recovery_key":"{encrypted_recovery_key}"}}"#);
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: application/json\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes());
        });

        let http_client = HttpClient::new();
        let endpoints = Endpoints::new(format!("http://{addr}"));
        let connector = RemoteConnector::new(&http_client, &endpoints);
        let cancel = AtomicBool::new(false);

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            connector.poll_for_recovery_key_with_interval(
                &connect_info,
                &cancel,
                Duration::from_millis(10),
            ),
        )
        .await
        .expect("poll did not complete in time")
        .unwrap();

        assert_eq!(result.user_id, "u1");
        server_task.await.unwrap();
    }
}
