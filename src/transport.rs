//! HTTP plumbing under the client: a minimal request/response model, the
//! [`Transport`] seam, the reqwest-backed transport and the logging
//! decorator that dumps traffic through a [`LogSink`].

use async_trait::async_trait;
use reqwest::header::{HeaderMap, AUTHORIZATION};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::context::Context;
use crate::error::Result;
use crate::logging::{LogLevel, LogSink};

/// An outgoing HTTP request, fully built
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        HttpRequest {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }
}

/// A received HTTP response with its body fully read
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// Sends one request and returns the response, whatever its status.
///
/// Only failures to get an answer at all are errors here; status handling
/// belongs to the client.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn round_trip(&self, ctx: &Context, request: HttpRequest) -> Result<HttpResponse>;
}

/// Transport backed by a pooled `reqwest::Client`
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build the default transport.
    ///
    /// `skip_verify_certificate` disables TLS certificate checks and must
    /// only be used against development endpoints.
    pub fn new(skip_verify_certificate: bool) -> Result<Self> {
        if skip_verify_certificate {
            log::warn!("TLS certificate verification is disabled");
        }
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(50)
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(skip_verify_certificate)
            .build()?;
        Ok(ReqwestTransport { client })
    }

    /// Reuse an already configured reqwest client
    pub fn from_client(client: reqwest::Client) -> Self {
        ReqwestTransport { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn round_trip(&self, _ctx: &Context, request: HttpRequest) -> Result<HttpResponse> {
        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Decorator that dumps full requests and responses when the level is
/// `detailed`. It always forwards to the wrapped transport and returns its
/// result untouched; a dump that cannot be produced is reported as a single
/// `[ERROR]` line instead.
pub struct LoggingTransport {
    inner: Arc<dyn Transport>,
    sink: Arc<dyn LogSink>,
    level: LogLevel,
}

impl LoggingTransport {
    pub fn new(inner: Arc<dyn Transport>, sink: Arc<dyn LogSink>, level: LogLevel) -> Self {
        LoggingTransport { inner, sink, level }
    }
}

#[async_trait]
impl Transport for LoggingTransport {
    async fn round_trip(&self, ctx: &Context, request: HttpRequest) -> Result<HttpResponse> {
        let detailed = self.level == LogLevel::Detailed;

        if detailed {
            let message = match dump_request(&request) {
                Ok(dump) => pretty_json_lines(&dump),
                Err(e) => format!("[ERROR] Could not dump request: {}", e),
            };
            self.sink.log(ctx, LogLevel::Detailed, &message);
        }

        let result = self.inner.round_trip(ctx, request).await;

        if detailed {
            if let Ok(response) = &result {
                let message = match dump_response(response) {
                    Ok(dump) => pretty_json_lines(&dump),
                    Err(e) => format!("[ERROR] Could not dump response: {}", e),
                };
                self.sink.log(ctx, LogLevel::Detailed, &message);
            }
        }

        result
    }
}

#[derive(Debug, Error)]
pub enum DumpError {
    #[error("header {0} is not printable")]
    Header(String),

    #[error("body is not valid UTF-8: {0}")]
    Body(#[from] std::str::Utf8Error),

    #[error("formatting failed")]
    Fmt(#[from] std::fmt::Error),
}

/// Render a request the way it goes on the wire (credentials redacted)
pub fn dump_request(request: &HttpRequest) -> std::result::Result<String, DumpError> {
    let url = &request.url;
    let mut out = String::new();

    write!(out, "{} {}", request.method, url.path())?;
    if let Some(query) = url.query() {
        write!(out, "?{}", query)?;
    }
    out.push_str(" HTTP/1.1\r\n");

    if let Some(host) = url.host_str() {
        match url.port() {
            Some(port) => write!(out, "Host: {}:{}\r\n", host, port)?,
            None => write!(out, "Host: {}\r\n", host)?,
        }
    }
    write_headers(&mut out, &request.headers)?;
    out.push_str("\r\n");

    if let Some(body) = &request.body {
        out.push_str(std::str::from_utf8(body)?);
    }
    Ok(out)
}

/// Render a response status line, headers and body
pub fn dump_response(response: &HttpResponse) -> std::result::Result<String, DumpError> {
    let mut out = String::new();
    write!(out, "HTTP/1.1 {}\r\n", response.status)?;
    write_headers(&mut out, &response.headers)?;
    out.push_str("\r\n");
    out.push_str(std::str::from_utf8(&response.body)?);
    Ok(out)
}

fn write_headers(out: &mut String, headers: &HeaderMap) -> std::result::Result<(), DumpError> {
    for (name, value) in headers {
        if *name == AUTHORIZATION {
            write!(out, "{}: <redacted>\r\n", name)?;
            continue;
        }
        let value = value
            .to_str()
            .map_err(|_| DumpError::Header(name.to_string()))?;
        write!(out, "{}: {}\r\n", name, value)?;
    }
    Ok(())
}

/// Re-indent every line that parses as a JSON object or array; other lines
/// pass through unchanged.
pub fn pretty_json_lines(text: &str) -> String {
    text.lines()
        .map(|line| {
            let trimmed = line.trim();
            if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
                return line.to_string();
            }
            serde_json::from_str::<Value>(trimmed)
                .ok()
                .and_then(|v| serde_json::to_string_pretty(&v).ok())
                .unwrap_or_else(|| line.to_string())
        })
        .collect::<Vec<_>>()
        .join("\n")
}
