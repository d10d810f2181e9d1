//! Network Helpers
//!
//! The shared REST client used by network drivers (blocking facade over
//! the tokio runtime with a hard per-request budget), and the
//! length-prefixed stream codec used by the push protocols.

use std::time::Duration;

use log::debug;
use serde_json::Value;
use tokio::runtime::Handle;

/// Default budget for one blocking network call.
pub const DEFAULT_NET_TIMEOUT: Duration = Duration::from_millis(500);

/// Synthetic status for calls that exceed the blocking budget.
pub const STATUS_TIMEOUT: u16 = 408;

/// Outcome of one REST call.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Value,
    pub error: Option<String>,
}

impl HttpResponse {
    pub fn is_error(&self) -> bool {
        self.error.is_some() || self.status >= 400
    }

    pub fn error_reason(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| format!("http status {}", self.status))
    }

    fn failed(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            body: Value::Null,
            error: Some(reason.into()),
        }
    }
}

/// Minimal REST provider: base URL + path, custom headers, JSON bodies.
/// Every call blocks the driver thread for at most the configured
/// budget; a timeout synthesizes a 408 instead of hanging the
/// dispatcher.
pub struct RestApi {
    runtime: Handle,
    client: reqwest::Client,
    base_url: String,
    base_path: String,
    headers: Vec<(String, String)>,
    timeout: Duration,
}

impl RestApi {
    pub fn new(runtime: Handle, host: &str, port: u16) -> Self {
        Self {
            runtime,
            client: reqwest::Client::new(),
            base_url: format!("http://{host}:{port}"),
            base_path: String::new(),
            headers: Vec::new(),
            timeout: DEFAULT_NET_TIMEOUT,
        }
    }

    pub fn set_base_path(&mut self, path: &str) {
        self.base_path = path.to_string();
    }

    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, self.base_path, path)
    }

    pub fn get(&self, path: &str) -> HttpResponse {
        self.execute(reqwest::Method::GET, path, None)
    }

    pub fn put(&self, path: &str, body: String) -> HttpResponse {
        self.execute(reqwest::Method::PUT, path, Some(body))
    }

    pub fn post(&self, path: &str, body: String) -> HttpResponse {
        self.execute(reqwest::Method::POST, path, Some(body))
    }

    fn execute(&self, method: reqwest::Method, path: &str, body: Option<String>) -> HttpResponse {
        let url = self.url(path);
        debug!("{} {}", method, url);

        let mut request = self.client.request(method, url.as_str()).timeout(self.timeout);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            request = request
                .header("Content-Type", "application/json")
                .body(body);
        }

        let result = self.runtime.block_on(async move {
            let response = request.send().await?;
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            Ok::<(u16, String), reqwest::Error>((status, text))
        });

        match result {
            Ok((status, text)) => {
                let body = serde_json::from_str(&text).unwrap_or(Value::Null);
                let error = (status >= 400).then(|| format!("http status {status}"));
                HttpResponse {
                    status,
                    body,
                    error,
                }
            }
            Err(err) if err.is_timeout() => {
                HttpResponse::failed(STATUS_TIMEOUT, "request timeout")
            }
            Err(err) => HttpResponse::failed(0, err.to_string()),
        }
    }
}

/// Encode one frame of the push-stream protocol:
/// `[len: u32 big-endian][payload]`.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Incremental decoder for the same framing.
#[derive(Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns every complete frame payload now available.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();
        loop {
            if self.buffer.len() < 4 {
                break;
            }
            let len = u32::from_be_bytes([
                self.buffer[0],
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
            ]) as usize;
            if self.buffer.len() < 4 + len {
                break;
            }
            let payload = self.buffer[4..4 + len].to_vec();
            self.buffer.drain(..4 + len);
            frames.push(payload);
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let payload = b"hello frame";
        let encoded = encode_frame(payload);
        assert_eq!(encoded.len(), payload.len() + 4);
        assert_eq!(&encoded[..4], &(payload.len() as u32).to_be_bytes());

        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(&encoded);
        assert_eq!(frames, vec![payload.to_vec()]);
    }

    #[test]
    fn decoder_handles_partial_and_batched_input() {
        let a = encode_frame(b"one");
        let b = encode_frame(b"two");

        let mut decoder = FrameDecoder::new();
        // Split mid-header.
        assert!(decoder.push(&a[..2]).is_empty());
        let frames = decoder.push(&a[2..]);
        assert_eq!(frames, vec![b"one".to_vec()]);

        // Two frames in one push.
        let mut joined = a.clone();
        joined.extend_from_slice(&b);
        let frames = decoder.push(&joined);
        assert_eq!(frames, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn empty_payload_frame() {
        let encoded = encode_frame(b"");
        assert_eq!(encoded, vec![0, 0, 0, 0]);
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.push(&encoded), vec![Vec::<u8>::new()]);
    }
}
