//! Thin wrapper over the HTTP library (spec.md §4.4): build a request,
//! execute it, map non-2xx/non-304 to a typed status-code error.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};

use crate::error::{Result, SyncError};

/// Default timeout for low-latency reads (spec.md §5).
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(4);
/// Default timeout for a full sync request (spec.md §5).
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Patch,
    Delete,
}

/// An assembled, not-yet-executed HTTP request (spec.md §4.4).
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub method: HttpMethod,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub content_type: Option<String>,
    pub timeout: Duration,
}

/// The outcome of executing an `HttpRequest`.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Option<Vec<u8>>,
}

impl HttpResponse {
    /// 304 is an explicit, valid success outcome (spec.md §4.4, §8 invariant 6).
    pub fn is_not_modified(&self) -> bool {
        self.status == 304
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status) || self.status == 304
    }
}

/// Wraps `reqwest` the way the core is allowed to: build, execute, classify.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Build a request. Pure; does not touch the network.
    #[allow(clippy::too_many_arguments)]
    pub fn create_request(
        &self,
        url: impl Into<String>,
        method: HttpMethod,
        headers: Vec<(String, String)>,
        query: Vec<(String, String)>,
        body: Option<Vec<u8>>,
        content_type: Option<String>,
        timeout: Duration,
    ) -> HttpRequest {
        HttpRequest {
            url: url.into(),
            method,
            headers,
            query,
            body,
            content_type,
            timeout,
        }
    }

    /// Execute a request. Non-2xx/non-304 becomes `unexpectedStatusCode`.
    pub async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
            HttpMethod::Patch => self.client.patch(&request.url),
            HttpMethod::Delete => self.client.delete(&request.url),
        };

        builder = builder.timeout(request.timeout);

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }

        let mut header_map = HeaderMap::new();
        for (name, value) in &request.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| SyncError::InvalidDataInResponse(e.to_string()))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|e| SyncError::InvalidDataInResponse(e.to_string()))?;
            header_map.insert(header_name, header_value);
        }
        if let Some(content_type) = &request.content_type {
            header_map.insert(
                CONTENT_TYPE,
                HeaderValue::from_str(content_type)
                    .map_err(|e| SyncError::InvalidDataInResponse(e.to_string()))?,
            );
        }
        builder = builder.headers(header_map);

        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();

        if !(200..300).contains(&status) && status != 304 {
            // Drain the body so the connection can be reused, but ignore its
            // contents: the caller only sees the status code.
            let _ = response.bytes().await;
            return Err(SyncError::UnexpectedStatusCode(status));
        }

        let body = if status == 204 || status == 304 {
            None
        } else {
            let bytes = response.bytes().await?;
            if bytes.is_empty() {
                None
            } else {
                Some(bytes.to_vec())
            }
        };

        Ok(HttpResponse { status, body })
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

pub fn bearer_header(token: &str) -> (String, String) {
    ("Authorization".to_string(), format!("Bearer {token}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn read_http_request(stream: &mut std::net::TcpStream) -> String {
        let mut buf = [0u8; 8192];
        let n = stream.read(&mut buf).unwrap_or(0);
        String::from_utf8_lossy(&buf[..n]).to_string()
    }

    fn start_mock_server(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let _ = read_http_request(&mut stream);
                let response = format!(
                    "{status_line}\r\nContent-Length: {}\r\nContent-Type: application/json\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn non_2xx_status_becomes_unexpected_status_code() {
        let base_url = start_mock_server("HTTP/1.1 400 Bad Request", "{}");
        let client = HttpClient::new();
        let request = client.create_request(
            format!("{base_url}/sync/data"),
            HttpMethod::Patch,
            vec![],
            vec![],
            Some(b"{}".to_vec()),
            Some("application/json".to_string()),
            DEFAULT_SYNC_TIMEOUT,
        );

        let err = client.execute(request).await.unwrap_err();
        match err {
            SyncError::UnexpectedStatusCode(400) => {}
            other => panic!("expected UnexpectedStatusCode(400), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn status_304_is_a_valid_outcome_with_no_body() {
        let base_url = start_mock_server("HTTP/1.1 304 Not Modified", "");
        let client = HttpClient::new();
        let request = client.create_request(
            format!("{base_url}/sync/bookmarks"),
            HttpMethod::Get,
            vec![],
            vec![],
            None,
            None,
            DEFAULT_READ_TIMEOUT,
        );

        let response = client.execute(request).await.unwrap();
        assert!(response.is_not_modified());
        assert!(response.body.is_none());
    }

    #[tokio::test]
    async fn status_200_carries_the_body_through() {
        let base_url = start_mock_server("HTTP/1.1 200 OK", "{\"ok\":true}");
        let client = HttpClient::new();
        let request = client.create_request(
            format!("{base_url}/sync/bookmarks"),
            HttpMethod::Get,
            vec![],
            vec![],
            None,
            None,
            DEFAULT_READ_TIMEOUT,
        );

        let response = client.execute(request).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body.unwrap(), b"{\"ok\":true}");
    }
}
