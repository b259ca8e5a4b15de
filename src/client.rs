use base64::{engine::general_purpose::STANDARD, Engine};
use log::{debug, warn};
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT,
};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::time::Instant;
use url::{form_urlencoded, Url};

use crate::auth::{AuthResponse, Token};
use crate::config::{Config, Settings};
use crate::context::Context;
use crate::error::{Result, ScmError};
use crate::logging::{LogLevel, LogSink, StdLogSink};
use crate::servers::ServerTable;
use crate::transport::{HttpRequest, LoggingTransport, ReqwestTransport, Transport};

/// Retries allowed after the first attempt of one logical request
pub const MAX_RETRIES: usize = 5;

/// A request against a resource endpoint, relative to the API path prefix
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    /// Resource module (`objects`, `security`, ...) used to pick the prefix
    pub module: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl ApiRequest {
    pub fn new(method: Method, module: impl Into<String>, path: impl Into<String>) -> Self {
        ApiRequest {
            method,
            module: module.into(),
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(module: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::GET, module, path)
    }

    pub fn post(module: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::POST, module, path)
    }

    pub fn put(module: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::PUT, module, path)
    }

    pub fn delete(module: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, module, path)
    }

    /// Append a query parameter
    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    /// Append a query parameter when a value is present
    pub fn query_opt<V: ToString>(self, key: impl Into<String>, value: Option<V>) -> Self {
        match value {
            Some(v) => self.query(key, v),
            None => self,
        }
    }

    /// Set the JSON body
    pub fn json<I: Serialize + ?Sized>(mut self, input: &I) -> Result<Self> {
        self.body = Some(serde_json::to_vec(input)?);
        Ok(self)
    }
}

/// Progress of one logical request through the retry loop
#[derive(Debug)]
struct Attempt {
    count: usize,
    last_status: Option<u16>,
    started: Instant,
}

impl Attempt {
    fn new() -> Self {
        Attempt {
            count: 0,
            last_status: None,
            started: Instant::now(),
        }
    }

    /// Count a retryable failure, or hand it back as the final error once
    /// [`MAX_RETRIES`] retries have been spent
    fn record(&mut self, status: u16, body: Vec<u8>) -> Result<()> {
        if self.count >= MAX_RETRIES {
            debug!(
                "client.execute giving up status={} attempts={} elapsed={:?}",
                status,
                self.count + 1,
                self.started.elapsed()
            );
            return Err(ScmError::api(status, body));
        }
        self.count += 1;
        self.last_status = Some(status);
        Ok(())
    }
}

/// What the latest refresh wave left behind for callers that waited on it
#[derive(Debug, Clone)]
struct FailedRefresh {
    message: String,
    status: Option<u16>,
    body: Option<Vec<u8>>,
}

impl FailedRefresh {
    fn from_error(err: &ScmError) -> Self {
        FailedRefresh {
            message: err.to_string(),
            status: err.status_code(),
            body: match err {
                ScmError::Auth {
                    detail: Some(detail),
                    ..
                } => Some(detail.clone().into_bytes()),
                other => other.body().map(<[u8]>::to_vec),
            },
        }
    }

    fn to_error(&self) -> ScmError {
        ScmError::RefreshFailed {
            message: self.message.clone(),
            status: self.status,
            body: self.body.clone(),
        }
    }
}

/// Sleep before retry number `prior + 1`: one `unit` per attempt so far
pub fn backoff_delay(unit: Duration, prior: usize) -> Duration {
    let factor = u32::try_from(prior.saturating_add(1)).unwrap_or(u32::MAX);
    unit.saturating_mul(factor)
}

/// Client for the SCM configuration API.
///
/// Create it with [`Client::new`], call [`Client::setup`] once, then share it
/// (typically behind an `Arc`) between any number of concurrent callers.
pub struct Client {
    config: Config,
    settings: Option<Settings>,
    api_prefix: String,
    extra_headers: HeaderMap,
    transport: Option<Arc<dyn Transport>>,
    base_transport: Option<Arc<dyn Transport>>,
    sink: Arc<dyn LogSink>,
    servers: ServerTable,
    backoff_unit: Duration,
    token: RwLock<Option<Token>>,
    generation: AtomicU64,
    /// Held by the caller refreshing; holds the failure of the last wave
    refresh_lock: tokio::sync::Mutex<Option<FailedRefresh>>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("api_prefix", &self.api_prefix)
            .field("servers", &self.servers)
            .field("backoff_unit", &self.backoff_unit)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl Client {
    /// Create a client; nothing is resolved until [`Client::setup`]
    pub fn new(config: Config) -> Self {
        Client {
            config,
            settings: None,
            api_prefix: String::new(),
            extra_headers: HeaderMap::new(),
            transport: None,
            base_transport: None,
            sink: Arc::new(StdLogSink),
            servers: ServerTable::default(),
            backoff_unit: Duration::from_secs(1),
            token: RwLock::new(None),
            generation: AtomicU64::new(0),
            refresh_lock: tokio::sync::Mutex::new(None),
        }
    }

    /// Send through `transport` instead of building a reqwest one
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.base_transport = Some(transport);
        self
    }

    /// Route request logs to `sink`
    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replace the host → path prefix table
    pub fn with_servers(mut self, servers: ServerTable) -> Self {
        self.servers = servers;
        self
    }

    /// Base unit of the linear retry backoff
    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    /// Resolve the configuration and build the transport.
    pub fn setup(&mut self) -> Result<()> {
        let settings = self.config.resolve()?;

        let mut extra_headers = HeaderMap::new();
        for (name, value) in &settings.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ScmError::Config(format!("invalid header name {:?}", name)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| ScmError::Config(format!("invalid value for header {}", name)))?;
            extra_headers.insert(name, value);
        }

        let base: Arc<dyn Transport> = match &self.base_transport {
            Some(transport) => transport.clone(),
            None => Arc::new(ReqwestTransport::new(settings.skip_verify_certificate)?),
        };
        let transport: Arc<dyn Transport> = if settings.skip_logging_transport {
            base
        } else {
            Arc::new(LoggingTransport::new(base, self.sink.clone(), settings.logging))
        };

        if let Some(jwt) = &settings.jwt {
            *self
                .token
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner) = Some(Token::from_jwt(jwt.clone()));
        }

        self.api_prefix = settings.api_prefix();
        debug!(
            "client.setup api_prefix={} logging={} skip_logging_transport={}",
            self.api_prefix, settings.logging, settings.skip_logging_transport
        );
        self.extra_headers = extra_headers;
        self.transport = Some(transport);
        self.settings = Some(settings);
        Ok(())
    }

    /// `protocol://host[:port]`; empty until setup has run
    pub fn api_prefix(&self) -> &str {
        &self.api_prefix
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Resolved configuration, once set up
    pub fn settings(&self) -> Option<&Settings> {
        self.settings.as_ref()
    }

    pub fn servers(&self) -> &ServerTable {
        &self.servers
    }

    /// Current bearer token, if any
    pub fn jwt(&self) -> Option<String> {
        self.read_token().as_ref().map(|t| t.access_token.clone())
    }

    pub fn token(&self) -> Option<Token> {
        self.read_token().clone()
    }

    fn read_token(&self) -> RwLockReadGuard<'_, Option<Token>> {
        self.token.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_token(&self) -> RwLockWriteGuard<'_, Option<Token>> {
        self.token.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn ready(&self) -> Result<(&Settings, &Arc<dyn Transport>)> {
        match (&self.settings, &self.transport) {
            (Some(settings), Some(transport)) if !self.api_prefix.is_empty() => {
                Ok((settings, transport))
            }
            _ => Err(ScmError::NotSetUp),
        }
    }

    fn log(&self, ctx: &Context, level: LogLevel, message: &str) {
        if let Some(settings) = &self.settings {
            if settings.logging.allows(level) {
                self.sink.log(ctx, level, message);
            }
        }
    }

    /// Full URL for `request`: api prefix, host path prefix, path, query
    pub fn request_url(&self, request: &ApiRequest) -> Result<Url> {
        let (settings, _) = self.ready()?;
        let prefix = self.servers.resolve(&settings.host, &request.module)?;
        let path = request.path.trim_start_matches('/');
        let mut url = Url::parse(&format!("{}{}/{}", self.api_prefix, prefix, path))?;
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&request.query);
        }
        Ok(url)
    }

    /// Fetch a new bearer token.
    ///
    /// Concurrent callers collapse into one token endpoint call: whoever
    /// gets the refresh lock first performs it, everyone who was waiting
    /// gets its outcome. Waiters on a failed call receive
    /// [`ScmError::RefreshFailed`] describing that failure.
    pub async fn refresh_jwt(&self, ctx: &Context) -> Result<()> {
        let seen = self.generation.load(Ordering::Acquire);
        self.refresh_after(ctx, seen).await
    }

    /// Refresh unless a wave has completed since generation `seen`
    async fn refresh_after(&self, ctx: &Context, seen: u64) -> Result<()> {
        let (settings, transport) = self.ready()?;
        let mut last_failure = ctx.run(async { Ok(self.refresh_lock.lock().await) }).await?;

        if self.generation.load(Ordering::Acquire) != seen {
            return match last_failure.as_ref() {
                Some(failure) => {
                    debug!("client.refresh_jwt joined failed refresh: {}", failure.message);
                    Err(failure.to_error())
                }
                None => {
                    debug!("client.refresh_jwt joined in-flight refresh");
                    Ok(())
                }
            };
        }

        self.log(ctx, LogLevel::Basic, "refreshing JWT");
        match self.request_token(ctx, settings, transport).await {
            Ok(token) => {
                debug!(
                    "client.refresh_jwt ok expires_in={:?} scope={}",
                    token.expires_in, token.scope
                );
                *self.write_token() = Some(token);
                *last_failure = None;
                self.generation.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            // the caller gave up, not the token endpoint: waiters try themselves
            Err(err @ (ScmError::Cancelled | ScmError::DeadlineExceeded)) => Err(err),
            Err(err) => {
                warn!("client.refresh_jwt failed: {}", err);
                *last_failure = Some(FailedRefresh::from_error(&err));
                self.generation.fetch_add(1, Ordering::AcqRel);
                Err(err)
            }
        }
    }

    async fn request_token(
        &self,
        ctx: &Context,
        settings: &Settings,
        transport: &Arc<dyn Transport>,
    ) -> Result<Token> {
        let url = Url::parse(&settings.auth_url)?;
        let form = form_urlencoded::Serializer::new(String::new())
            .append_pair("scope", &settings.scope)
            .append_pair("grant_type", "client_credentials")
            .finish();

        let credentials = STANDARD.encode(format!(
            "{}:{}",
            settings.client_id, settings.client_secret
        ));
        let mut basic = HeaderValue::try_from(format!("Basic {}", credentials))
            .map_err(|_| ScmError::Config("client credentials are not valid header text".into()))?;
        basic.set_sensitive(true);

        let mut request = HttpRequest::new(Method::POST, url);
        request.headers.extend(self.extra_headers.clone());
        request.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        request
            .headers
            .insert(ACCEPT, HeaderValue::from_static("application/json"));
        request.headers.insert(AUTHORIZATION, basic);
        request.body = Some(form.into_bytes());

        let response = ctx.run(transport.round_trip(ctx, request)).await?;
        let status = response.status.as_u16();

        let auth: AuthResponse = match serde_json::from_slice(&response.body) {
            Ok(auth) => auth,
            Err(source) => {
                return Err(ScmError::Decode {
                    source,
                    body: response.body,
                })
            }
        };
        auth.failed(status, &response.body)?;
        Ok(auth.into_token())
    }

    /// Make sure a usable token is held; returns the generation it belongs to
    async fn ensure_token(&self, ctx: &Context) -> Result<u64> {
        let seen = self.generation.load(Ordering::Acquire);
        let stale = match &*self.read_token() {
            Some(token) => token.access_token.is_empty() || token.is_expired(),
            None => true,
        };
        if !stale {
            return Ok(seen);
        }
        self.refresh_after(ctx, seen).await?;
        Ok(self.generation.load(Ordering::Acquire))
    }

    fn build_request(&self, settings: &Settings, request: &ApiRequest, url: Url) -> Result<HttpRequest> {
        let mut http = HttpRequest::new(request.method.clone(), url);
        http.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(agent) = &settings.user_agent {
            let value = HeaderValue::from_str(agent)
                .map_err(|_| ScmError::Config(format!("invalid user agent {:?}", agent)))?;
            http.headers.insert(USER_AGENT, value);
        }
        if let Some(jwt) = self.jwt() {
            let mut value = HeaderValue::try_from(format!("Bearer {}", jwt))
                .map_err(|_| ScmError::Other("bearer token is not valid header text".into()))?;
            value.set_sensitive(true);
            http.headers.insert(AUTHORIZATION, value);
        }
        http.headers.extend(self.extra_headers.clone());
        http.body = request.body.clone();
        Ok(http)
    }

    /// Send `request`, handling token refresh and transient failures, and
    /// return the raw success body.
    ///
    /// - 2xx: the body
    /// - 404: [`ScmError::ObjectNotFound`] with the body
    /// - 401: refresh the token and retry, unless the previous attempt was
    ///   a 401 as well
    /// - 429/502/503/504: linear backoff, then retry
    /// - anything else: [`ScmError::Api`] with the decoded envelope
    ///
    /// Once [`MAX_RETRIES`] retries are spent, the failure that would have
    /// needed one more is returned as [`ScmError::Api`].
    pub async fn execute(&self, ctx: &Context, request: &ApiRequest) -> Result<Vec<u8>> {
        let (settings, transport) = self.ready()?;
        let url = self.request_url(request)?;
        let mut attempt = Attempt::new();

        loop {
            let generation = self.ensure_token(ctx).await?;
            let http = self.build_request(settings, request, url.clone())?;
            self.log(ctx, LogLevel::Basic, &format!("({}) {}", request.method, url));

            let response = ctx.run(transport.round_trip(ctx, http)).await?;
            let status = response.status.as_u16();
            debug!(
                "client.execute method={} url={} status={} attempt={}",
                request.method, url, status, attempt.count
            );

            match status {
                200..=299 => return Ok(response.body),
                404 => return Err(ScmError::ObjectNotFound { body: response.body }),
                401 => {
                    if attempt.last_status == Some(401) {
                        return Err(ScmError::api(status, response.body));
                    }
                    attempt.record(status, response.body)?;
                    self.refresh_after(ctx, generation).await?;
                }
                429 | 502 | 503 | 504 => {
                    let delay = backoff_delay(self.backoff_unit, attempt.count);
                    attempt.record(status, response.body)?;
                    debug!("client.execute backoff status={} delay={:?}", status, delay);
                    ctx.sleep(delay).await?;
                }
                _ => return Err(ScmError::api(status, response.body)),
            }
        }
    }

    /// [`Client::execute`] and decode the body as JSON.
    ///
    /// A body that does not decode comes back inside [`ScmError::Decode`].
    pub async fn execute_json<O: DeserializeOwned>(
        &self,
        ctx: &Context,
        request: &ApiRequest,
    ) -> Result<O> {
        let body = self.execute(ctx, request).await?;
        match serde_json::from_slice(&body) {
            Ok(output) => Ok(output),
            Err(source) => Err(ScmError::Decode { source, body }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::HttpResponse;
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use serde::Deserialize;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Answers API calls from a queue and the token endpoint from a template
    #[derive(Default)]
    struct Scripted {
        responses: Mutex<VecDeque<(u16, String)>>,
        token_reply: Mutex<Option<(u16, String)>>,
        token_delay: Duration,
        api_stall: bool,
        api_calls: AtomicUsize,
        token_calls: AtomicUsize,
        seen: Mutex<Vec<HttpRequest>>,
    }

    impl Scripted {
        fn new(responses: &[(u16, &str)]) -> Arc<Self> {
            Arc::new(Scripted {
                responses: Mutex::new(
                    responses
                        .iter()
                        .map(|(s, b)| (*s, b.to_string()))
                        .collect(),
                ),
                ..Default::default()
            })
        }

        fn api_calls(&self) -> usize {
            self.api_calls.load(Ordering::SeqCst)
        }

        fn token_calls(&self) -> usize {
            self.token_calls.load(Ordering::SeqCst)
        }

        fn auth_header(&self, index: usize) -> String {
            self.seen.lock().unwrap()[index].headers[AUTHORIZATION]
                .to_str()
                .unwrap()
                .to_string()
        }
    }

    fn reply(status: u16, body: String) -> HttpResponse {
        HttpResponse {
            status: StatusCode::from_u16(status).unwrap(),
            headers: HeaderMap::new(),
            body: body.into_bytes(),
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn round_trip(&self, _ctx: &Context, request: HttpRequest) -> Result<HttpResponse> {
            if request.url.path().ends_with("/access_token") {
                let n = self.token_calls.fetch_add(1, Ordering::SeqCst) + 1;
                if !self.token_delay.is_zero() {
                    tokio::time::sleep(self.token_delay).await;
                }
                if let Some((status, body)) = self.token_reply.lock().unwrap().clone() {
                    return Ok(reply(status, body));
                }
                let body = json!({
                    "access_token": format!("token-{}", n),
                    "token_type": "Bearer",
                    "scope": "tsg_id:1",
                    "expires_in": 899,
                });
                return Ok(reply(200, body.to_string()));
            }

            self.api_calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(request);
            if self.api_stall {
                std::future::pending::<()>().await;
            }
            let (status, body) = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or((500, "{}".to_string()));
            Ok(reply(status, body))
        }
    }

    fn config() -> Config {
        Config {
            host: Some("api.sase.paloaltonetworks.com".to_string()),
            client_id: Some("id".to_string()),
            client_secret: Some("secret".to_string()),
            scope: Some("tsg_id:1".to_string()),
            logging: Some(LogLevel::Quiet),
            jwt: Some("initial".to_string()),
            ..Default::default()
        }
    }

    fn client_with(config: Config, transport: Arc<Scripted>) -> Client {
        let mut client = Client::new(config)
            .with_transport(transport)
            .with_backoff_unit(Duration::from_millis(1));
        client.setup().unwrap();
        client
    }

    fn tags() -> ApiRequest {
        ApiRequest::get("objects", "tags").query("folder", "Shared")
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Tag {
        id: String,
    }

    #[tokio::test]
    async fn test_execute_before_setup_fails_fast() {
        let transport = Scripted::new(&[(200, "{}")]);
        let client = Client::new(config()).with_transport(transport.clone());
        assert_eq!(client.api_prefix(), "");

        let err = client.execute(&Context::new(), &tags()).await.unwrap_err();
        assert!(matches!(err, ScmError::NotSetUp));
        assert_eq!(transport.api_calls(), 0);
        assert_eq!(transport.token_calls(), 0);
    }

    #[tokio::test]
    async fn test_success_decodes_output() {
        let transport = Scripted::new(&[(201, r#"{"id":"t1"}"#)]);
        let client = client_with(config(), transport.clone());

        let tag: Tag = client.execute_json(&Context::new(), &tags()).await.unwrap();
        assert_eq!(tag, Tag { id: "t1".into() });
        assert_eq!(transport.auth_header(0), "Bearer initial");
        assert_eq!(transport.token_calls(), 0);

        let seen = transport.seen.lock().unwrap();
        assert_eq!(
            seen[0].url.as_str(),
            "https://api.sase.paloaltonetworks.com/sse/config/v1/tags?folder=Shared"
        );
        assert_eq!(seen[0].headers[CONTENT_TYPE], "application/json");
    }

    #[tokio::test]
    async fn test_success_statuses_are_never_errors() {
        for status in [200, 201, 202] {
            let transport = Scripted::new(&[(status, "not json")]);
            let client = client_with(config(), transport);
            let body = client.execute(&Context::new(), &tags()).await.unwrap();
            assert_eq!(body, b"not json");
        }
    }

    #[tokio::test]
    async fn test_decode_failure_keeps_body() {
        let transport = Scripted::new(&[(200, "not json")]);
        let client = client_with(config(), transport);
        let err = client
            .execute_json::<Tag>(&Context::new(), &tags())
            .await
            .unwrap_err();
        assert!(matches!(err, ScmError::Decode { .. }));
        assert_eq!(err.body(), Some(&b"not json"[..]));
    }

    #[tokio::test]
    async fn test_not_found_sentinel() {
        let transport = Scripted::new(&[(404, r#"{"_errors":[]}"#)]);
        let client = client_with(config(), transport.clone());
        let err = client.execute(&Context::new(), &tags()).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.body(), Some(&br#"{"_errors":[]}"#[..]));
        assert_eq!(transport.api_calls(), 1);
    }

    #[tokio::test]
    async fn test_client_error_is_terminal() {
        let body = r#"{"_errors":[{"code":"API_I00035","message":"Invalid Request Payload","details":["\"folder\" is required"]}],"_request_id":"r"}"#;
        let transport = Scripted::new(&[(400, body)]);
        let client = client_with(config(), transport.clone());

        match client.execute(&Context::new(), &tags()).await.unwrap_err() {
            ScmError::Api {
                status, response, ..
            } => {
                assert_eq!(status, 400);
                assert!(response.failed());
                assert_eq!(response.errors[0].code, "API_I00035");
            }
            other => panic!("expected ScmError::Api, got {:?}", other),
        }
        assert_eq!(transport.api_calls(), 1);
    }

    #[tokio::test]
    async fn test_401_refreshes_and_retries() {
        let transport = Scripted::new(&[(401, "{}"), (200, r#"{"id":"t1"}"#)]);
        let client = client_with(config(), transport.clone());

        let tag: Tag = client.execute_json(&Context::new(), &tags()).await.unwrap();
        assert_eq!(tag.id, "t1");
        assert_eq!(transport.token_calls(), 1);
        assert_eq!(transport.api_calls(), 2);
        assert_eq!(transport.auth_header(0), "Bearer initial");
        assert_eq!(transport.auth_header(1), "Bearer token-1");
        assert_eq!(client.jwt().as_deref(), Some("token-1"));
        assert!(client.token().unwrap().expires_at().is_some());
    }

    #[tokio::test]
    async fn test_consecutive_401_stops_without_second_refresh() {
        let transport = Scripted::new(&[(401, "{}"), (401, r#"{"_errors":[{"code":"E016"}]}"#)]);
        let client = client_with(config(), transport.clone());

        let err = client.execute(&Context::new(), &tags()).await.unwrap_err();
        assert_eq!(err.status_code(), Some(401));
        assert_eq!(err.to_string(), "[HTTP 401] E016");
        assert_eq!(transport.token_calls(), 1);
        assert_eq!(transport.api_calls(), 2);
    }

    #[tokio::test]
    async fn test_refresh_error_propagates() {
        let transport = Scripted::new(&[(401, "{}")]);
        *transport.token_reply.lock().unwrap() = Some((
            401,
            r#"{"error":"invalid_client","error_description":"Client authentication failed"}"#
                .to_string(),
        ));
        let client = client_with(config(), transport.clone());

        let err = client.execute(&Context::new(), &tags()).await.unwrap_err();
        assert_eq!(err.to_string(), "invalid_client: Client authentication failed");
        assert_eq!(transport.api_calls(), 1);
    }

    #[tokio::test]
    async fn test_refresh_with_bad_json() {
        let transport = Scripted::new(&[]);
        *transport.token_reply.lock().unwrap() = Some((200, "<html>".to_string()));
        let client = client_with(config(), transport.clone());

        let err = client.refresh_jwt(&Context::new()).await.unwrap_err();
        assert!(matches!(err, ScmError::Decode { .. }));
        assert_eq!(client.jwt().as_deref(), Some("initial"));
    }

    #[tokio::test]
    async fn test_missing_token_is_fetched_before_first_request() {
        let transport = Scripted::new(&[(200, "{}")]);
        let config = Config {
            jwt: None,
            ..config()
        };
        let client = client_with(config, transport.clone());

        client.execute(&Context::new(), &tags()).await.unwrap();
        assert_eq!(transport.token_calls(), 1);
        assert_eq!(transport.auth_header(0), "Bearer token-1");
    }

    #[tokio::test]
    async fn test_retry_cap_returns_last_error() {
        let transport = Scripted::new(&[(503, "{}"); 8]);
        let client = client_with(config(), transport.clone());

        let err = client.execute(&Context::new(), &tags()).await.unwrap_err();
        assert!(matches!(err, ScmError::Api { status: 503, .. }));
        assert!(!err.is_too_many_retries());
        assert_eq!(transport.api_calls(), MAX_RETRIES + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_with_attempts() {
        let transport = Scripted::new(&[(429, "{}"), (502, "{}"), (504, "{}"), (200, "{}")]);
        let mut client = Client::new(config()).with_transport(transport.clone());
        client.setup().unwrap();

        let start = Instant::now();
        client.execute(&Context::new(), &tags()).await.unwrap();
        let elapsed = start.elapsed();

        // 1s + 2s + 3s
        assert!(elapsed >= Duration::from_secs(6), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(7), "elapsed {:?}", elapsed);
        assert_eq!(transport.api_calls(), 4);
    }

    #[test]
    fn test_backoff_delay_is_monotonic() {
        let unit = Duration::from_secs(1);
        let delays: Vec<Duration> = (0..=MAX_RETRIES).map(|n| backoff_delay(unit, n)).collect();
        assert_eq!(delays[0], Duration::from_secs(1));
        assert!(delays.windows(2).all(|w| w[1] > w[0]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_refresh_is_single_flight() {
        let transport = Arc::new(Scripted {
            token_delay: Duration::from_millis(50),
            ..Default::default()
        });
        let client = Arc::new(client_with(config(), transport.clone()));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move { client.refresh_jwt(&Context::new()).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(transport.token_calls(), 1);
        assert_eq!(client.jwt().as_deref(), Some("token-1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failed_refresh_is_shared_with_waiters() {
        let transport = Arc::new(Scripted {
            token_delay: Duration::from_millis(50),
            token_reply: Mutex::new(Some((503, r#"{"status":"down"}"#.to_string()))),
            ..Default::default()
        });
        let client = Arc::new(client_with(config(), transport.clone()));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move { client.refresh_jwt(&Context::new()).await })
            })
            .collect();
        let mut shared = 0;
        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            assert!(
                err.to_string()
                    .contains("Unknown error, enable receive logging for more info"),
                "unexpected error {}",
                err
            );
            if let ScmError::RefreshFailed { body, .. } = &err {
                assert_eq!(body.as_deref(), Some(&br#"{"status":"down"}"#[..]));
                shared += 1;
            }
        }

        assert_eq!(transport.token_calls(), 1);
        assert_eq!(shared, 15);
        assert_eq!(client.jwt().as_deref(), Some("initial"));

        // the next wave tries again
        *transport.token_reply.lock().unwrap() = None;
        client.refresh_jwt(&Context::new()).await.unwrap();
        assert_eq!(transport.token_calls(), 2);
        assert_eq!(client.jwt().as_deref(), Some("token-2"));
    }

    #[tokio::test]
    async fn test_cancel_aborts_pending_round_trip() {
        let transport = Arc::new(Scripted {
            api_stall: true,
            ..Default::default()
        });
        let client = client_with(config(), transport.clone());
        let ctx = Context::new();
        let cancel = ctx.cancellation_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let err = tokio::time::timeout(Duration::from_secs(5), client.execute(&ctx, &tags()))
            .await
            .expect("cancellation did not interrupt the round trip")
            .unwrap_err();
        assert!(matches!(err, ScmError::Cancelled));
        assert_eq!(transport.api_calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_context_makes_no_call() {
        let transport = Scripted::new(&[(200, "{}")]);
        let client = client_with(config(), transport.clone());
        let ctx = Context::new();
        ctx.cancel();

        let err = client.execute(&ctx, &tags()).await.unwrap_err();
        assert!(matches!(err, ScmError::Cancelled));
        assert_eq!(transport.api_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_interrupts_backoff() {
        let transport = Scripted::new(&[(429, "{}"), (200, "{}")]);
        let mut client = Client::new(config())
            .with_transport(transport.clone())
            .with_backoff_unit(Duration::from_secs(30));
        client.setup().unwrap();

        let ctx = Context::new().with_timeout(Duration::from_secs(5));
        let err = client.execute(&ctx, &tags()).await.unwrap_err();
        assert!(matches!(err, ScmError::DeadlineExceeded));
        assert_eq!(transport.api_calls(), 1);
    }

    #[tokio::test]
    async fn test_unknown_host() {
        let transport = Scripted::new(&[(200, "{}")]);
        let config = Config {
            host: Some("example.com".to_string()),
            ..config()
        };
        let client = client_with(config, transport.clone());

        let err = client.execute(&Context::new(), &tags()).await.unwrap_err();
        assert!(err.is_unknown_host());
        assert_eq!(transport.api_calls(), 0);
    }

    #[tokio::test]
    async fn test_headers_and_prefix_template() {
        let transport = Scripted::new(&[(200, "{}")]);
        let mut headers = std::collections::BTreeMap::new();
        headers.insert("x-tenant".to_string(), "42".to_string());
        let config = Config {
            host: Some("api.strata.paloaltonetworks.com".to_string()),
            port: Some(8443),
            user_agent: Some("scm-sdk-tests".to_string()),
            headers: Some(headers),
            ..config()
        };
        let client = client_with(config, transport.clone());

        let request = ApiRequest::post("security", "/security-rules")
            .query("position", "pre")
            .json(&json!({"name": "allow-dns"}))
            .unwrap();
        client.execute(&Context::new(), &request).await.unwrap();

        let seen = transport.seen.lock().unwrap();
        assert_eq!(
            seen[0].url.as_str(),
            "https://api.strata.paloaltonetworks.com:8443/config/security/v1/security-rules?position=pre"
        );
        assert_eq!(seen[0].headers["x-tenant"], "42");
        assert_eq!(seen[0].headers[USER_AGENT], "scm-sdk-tests");
        assert_eq!(seen[0].body.as_deref(), Some(&br#"{"name":"allow-dns"}"#[..]));
    }

    #[test]
    fn test_debug_redacts_token() {
        let transport = Scripted::new(&[]);
        let client = client_with(config(), transport);
        let debug = format!("{:?}", client);
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("initial"));
    }
}
