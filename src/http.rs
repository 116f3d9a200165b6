//! HTTP transport used for gateway calls, delta stats and registry fetches.
//!
//! The agent only ever needs four request shapes: a bounded GET, a POST,
//! a PUT, and a streaming download. Non-2xx responses are returned as values so
//! callers decide what a status means; only transport failures are errors.
//! Nothing here retries.

use std::io::{self, Read};
use std::time::Duration;

use serde::de::DeserializeOwned;

/// Errors that prevent a response from being obtained at all.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("request to {url} failed: {reason}")]
    Transport { url: String, reason: String },

    #[error("response from {url} exceeds the maximum of {limit} bytes")]
    TooLarge { url: String, limit: u64 },

    #[error("download from {url} aborted: {reason}")]
    Aborted { url: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = core::result::Result<T, HttpError>;

/// A request header as sent on the wire.
pub type Header = (String, String);

/// Status and body of a completed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn status_str(&self) -> String {
        format!("{} {}", self.status, self.text())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }
}

/// Receives body chunks during a streaming download.
///
/// Returning `Err` aborts the transfer.
pub type ChunkSink<'a> = dyn FnMut(&[u8]) -> core::result::Result<(), String> + 'a;

/// The transport seam. Implementations must not retry.
pub trait HttpTransport {
    /// GET `url`, failing with [`HttpError::TooLarge`] if the body exceeds `max_bytes`.
    fn get(&self, url: &str, headers: &[Header], max_bytes: u64) -> Result<HttpResponse>;

    /// POST `body` to `url`. The body is JSON unless `headers` say otherwise.
    fn post(&self, url: &str, headers: &[Header], body: &[u8]) -> Result<HttpResponse>;

    /// PUT a JSON `body` to `url`.
    fn put(&self, url: &str, headers: &[Header], body: &[u8]) -> Result<HttpResponse>;

    /// GET `url`, handing the body to `sink` chunk by chunk.
    ///
    /// The returned response has an empty body on success; on a non-2xx
    /// status the body carries the server's error text and `sink` is never called.
    fn download(&self, url: &str, headers: &[Header], sink: &mut ChunkSink<'_>)
    -> Result<HttpResponse>;
}

/// Blocking transport backed by a shared `ureq` agent.
pub struct UreqTransport {
    agent: ureq::Agent,
    default_headers: Vec<Header>,
}

impl UreqTransport {
    const CHUNK_SIZE: usize = 64 * 1024;
    const ERROR_BODY_LIMIT: u64 = 64 * 1024;

    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .build();
        Self {
            agent,
            default_headers: Vec::new(),
        }
    }

    /// Adds a header sent with every request (e.g. the device's correlation header).
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.push((name.into(), value.into()));
        self
    }

    fn request(&self, method: &str, url: &str, headers: &[Header]) -> ureq::Request {
        let mut req = self.agent.request(method, url);
        for (name, value) in self.default_headers.iter().chain(headers) {
            req = req.set(name, value);
        }
        req
    }

    /// Sends `body`, labelled JSON unless the caller set a content type.
    fn send(&self, method: &str, url: &str, headers: &[Header], body: &[u8]) -> Result<HttpResponse> {
        let headers = with_default_content_type(headers);
        match Self::settle(url, self.request(method, url, &headers).send_bytes(body))? {
            Ok(resp) => {
                let status = resp.status();
                let body = read_limited(url, resp.into_reader(), Self::ERROR_BODY_LIMIT)?;
                Ok(HttpResponse::new(status, body))
            }
            Err(failed) => Ok(failed),
        }
    }

    /// Turns a ureq outcome into a response, keeping non-2xx statuses as values.
    fn settle(
        url: &str,
        outcome: core::result::Result<ureq::Response, ureq::Error>,
    ) -> Result<core::result::Result<ureq::Response, HttpResponse>> {
        match outcome {
            Ok(resp) => Ok(Ok(resp)),
            Err(ureq::Error::Status(status, resp)) => {
                let body = read_limited(url, resp.into_reader(), Self::ERROR_BODY_LIMIT)
                    .unwrap_or_default();
                Ok(Err(HttpResponse::new(status, body)))
            }
            Err(ureq::Error::Transport(t)) => Err(HttpError::Transport {
                url: url.to_string(),
                reason: t.to_string(),
            }),
        }
    }
}

impl HttpTransport for UreqTransport {
    fn get(&self, url: &str, headers: &[Header], max_bytes: u64) -> Result<HttpResponse> {
        tracing::debug!(url, "GET");
        match Self::settle(url, self.request("GET", url, headers).call())? {
            Ok(resp) => {
                let status = resp.status();
                let body = read_limited(url, resp.into_reader(), max_bytes)?;
                Ok(HttpResponse::new(status, body))
            }
            Err(failed) => Ok(failed),
        }
    }

    fn post(&self, url: &str, headers: &[Header], body: &[u8]) -> Result<HttpResponse> {
        tracing::debug!(url, "POST");
        self.send("POST", url, headers, body)
    }

    fn put(&self, url: &str, headers: &[Header], body: &[u8]) -> Result<HttpResponse> {
        tracing::debug!(url, "PUT");
        self.send("PUT", url, headers, body)
    }

    fn download(
        &self,
        url: &str,
        headers: &[Header],
        sink: &mut ChunkSink<'_>,
    ) -> Result<HttpResponse> {
        tracing::debug!(url, "GET (streaming)");
        let resp = match Self::settle(url, self.request("GET", url, headers).call())? {
            Ok(resp) => resp,
            Err(failed) => return Ok(failed),
        };
        let status = resp.status();
        let mut reader = resp.into_reader();
        let mut buf = vec![0u8; Self::CHUNK_SIZE];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            sink(&buf[..n]).map_err(|reason| HttpError::Aborted {
                url: url.to_string(),
                reason,
            })?;
        }
        Ok(HttpResponse::new(status, Vec::new()))
    }
}

fn with_default_content_type(headers: &[Header]) -> Vec<Header> {
    let mut all = Vec::with_capacity(headers.len() + 1);
    if !headers.iter().any(|(name, _)| name.eq_ignore_ascii_case("Content-Type")) {
        all.push(("Content-Type".to_string(), "application/json".to_string()));
    }
    all.extend_from_slice(headers);
    all
}

fn read_limited(url: &str, reader: impl Read, max_bytes: u64) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    reader.take(max_bytes.saturating_add(1)).read_to_end(&mut body)?;
    if body.len() as u64 > max_bytes {
        return Err(HttpError::TooLarge {
            url: url.to_string(),
            limit: max_bytes,
        });
    }
    Ok(body)
}
