//! 📡 Endpoint — one upstream dataway, its URLs, its HTTP client, its retry habits.
//!
//! 🎬 *[a body arrives. it is POSTed. the server answers 503. we wait. we POST again.
//! the exact same bytes. the server answers 200. nobody speaks of the 503 again.]*
//!
//! # Knowledge Graph 🧠
//! - `Endpoint::new` parses `scheme://host/?token=...` and precomputes one URL per API path.
//! - `send_req` is the only place a request leaves the process: retries on transport errors
//!   and 5xx, never on 4xx, replays the same `Bytes` each attempt.
//! - `write_point_data` turns a `Body` into a POST and the answer into `Ok`/`WritePoints4XX`/
//!   `DatawayInternal`, counting bytes and points on the way out.
//! - `apis.rs` carries the auxiliary calls (pull, election, token check, ...).

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::{Method, StatusCode, Url};
use tracing::{debug, info, warn};

use crate::body::{Body, BodyFrom, unix_now};
use crate::category::Category;
use crate::context::RuntimeContext;
use crate::error::{DatawayError, Result};

mod apis;

pub use apis::DatawayList;

pub const API_DATAKIT_PULL: &str = "/v1/datakit/pull";
pub const API_ELECTION: &str = "/v1/election";
pub const API_ELECTION_HEARTBEAT: &str = "/v1/election/heartbeat";
pub const API_QUERY_RAW: &str = "/v1/query/raw";
pub const API_WORKSPACE: &str = "/v1/workspace";
pub const API_OBJECT_LABELS: &str = "/v1/object/labels";
pub const API_LOG_UPLOAD: &str = "/v1/log";
pub const API_LIST_DATAWAY: &str = "/v2/list/dataway";
pub const API_CHECK_TOKEN: &str = "/v1/check/token";
pub const API_USAGE_TRACE: &str = "/v1/datakit/usage_trace";
pub const API_NTP: &str = "/v1/ntp/";
pub const API_REMOTE_JOB: &str = "/v1/write/remote_job";
pub const API_PROFILING_UPLOAD: &str = "/v1/upload/profiling";

const AUX_APIS: &[&str] = &[
    API_DATAKIT_PULL,
    API_ELECTION,
    API_ELECTION_HEARTBEAT,
    API_QUERY_RAW,
    API_WORKSPACE,
    API_OBJECT_LABELS,
    API_LOG_UPLOAD,
    API_LIST_DATAWAY,
    API_USAGE_TRACE,
    API_NTP,
    API_REMOTE_JOB,
    API_PROFILING_UPLOAD,
];

/// 🔧 Knobs for one endpoint. Built from `DatawayConfig`.
#[derive(Debug, Clone)]
pub struct EndpointOptions {
    /// attempts per request, clamped to 1..=10
    pub max_retry_count: u32,
    pub retry_delay: Duration,
    pub http_timeout: Duration,
    pub proxy: Option<String>,
    pub http_headers: BTreeMap<String, String>,
    pub max_idle_conns_per_host: usize,
    pub idle_timeout: Duration,
    pub hostname: String,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            max_retry_count: 4,
            retry_delay: Duration::from_secs(1),
            http_timeout: Duration::from_secs(30),
            proxy: None,
            http_headers: BTreeMap::new(),
            max_idle_conns_per_host: 64,
            idle_timeout: Duration::from_secs(90),
            hostname: String::new(),
        }
    }
}

/// 📨 A request that can be sent more than once. `body` is cheap to clone.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    /// metric label, the API path without per-call suffixes
    pub api: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl ApiRequest {
    pub fn new(method: Method, url: impl Into<String>, api: impl Into<String>) -> Self {
        Self { method, url: url.into(), api: api.into(), headers: Vec::new(), body: None }
    }

    pub fn header(mut self, k: impl Into<String>, v: impl Into<String>) -> Self {
        self.headers.push((k.into(), v.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }
}

#[derive(Debug)]
pub struct Endpoint {
    raw_url: String,
    scheme: String,
    host: String,
    token: Option<String>,
    query: String,
    category_urls: HashMap<&'static str, String>,
    headers: Vec<(String, String)>,
    opts: EndpointOptions,
    user_agent: String,
    client: RwLock<reqwest::Client>,
    ctx: RuntimeContext,
}

/// 🏷️ `http.StatusText`-style label: "OK", "Internal Server Error", ...
pub(crate) fn status_text(code: StatusCode) -> String {
    code.canonical_reason().map(str::to_string).unwrap_or_else(|| code.as_str().to_string())
}

/// 🕵️ Buckets a transport error into a short metric label.
fn classify(err: &reqwest::Error) -> &'static str {
    if err.is_timeout() {
        return "timeout";
    }
    let mut chain = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(s) = source {
        chain.push_str(": ");
        chain.push_str(&s.to_string());
        source = s.source();
    }
    let chain = chain.to_ascii_lowercase();
    if chain.contains("reset by peer") {
        "reset-by-peer"
    } else if chain.contains("connection refused") {
        "connection-refused"
    } else if chain.contains("network is unreachable") {
        "network-is-unreachable"
    } else {
        "unwrapped-url-error"
    }
}

fn validate_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| DatawayError::InvalidUrl(format!("{raw}: {e}")))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(DatawayError::UnsupportedScheme(other.to_string())),
    }
    if url.host_str().is_none() {
        return Err(DatawayError::InvalidUrl(format!("{raw}: missing host")));
    }
    Ok(url)
}

impl Endpoint {
    /// 🏗️ Parses the dataway URL and builds the HTTP client.
    pub fn new(raw_url: &str, opts: EndpointOptions, ctx: RuntimeContext) -> Result<Self> {
        let url = validate_url(raw_url)?;
        let scheme = url.scheme().to_string();
        let host = match (url.host_str(), url.port()) {
            (Some(h), Some(p)) => format!("{h}:{p}"),
            (Some(h), None) => h.to_string(),
            (None, _) => return Err(DatawayError::InvalidUrl(raw_url.to_string())),
        };
        let token = url.query_pairs().find(|(k, _)| k == "token").map(|(_, v)| v.into_owned());
        let query = url.query().unwrap_or_default().to_string();

        let mut opts = opts;
        opts.max_retry_count = opts.max_retry_count.clamp(1, 10);

        let mut headers = Vec::new();
        for (k, v) in &opts.http_headers {
            if v.is_empty() {
                warn!("⚠️ ignoring empty HTTP header {:?} on {}", k, host);
                continue;
            }
            headers.push((k.clone(), v.clone()));
        }

        let mut ep = Self {
            raw_url: raw_url.to_string(),
            user_agent: format!(
                "datakit-{}-{}/{}/{}",
                std::env::consts::OS,
                std::env::consts::ARCH,
                env!("CARGO_PKG_VERSION"),
                opts.hostname
            ),
            client: RwLock::new(build_client(&opts)?),
            scheme,
            host,
            token,
            query,
            category_urls: HashMap::new(),
            headers,
            opts,
            ctx,
        };

        let apis = Category::all().filter_map(Category::url_path).chain(AUX_APIS.iter().copied());
        for api in apis {
            let url = ep.make_url(api);
            info!("📡 endpoint registered dataway API {:?}: {:?}", api, url);
            ep.category_urls.insert(api, url);
        }
        Ok(ep)
    }

    fn make_url(&self, api: &str) -> String {
        if self.query.is_empty() {
            format!("{}://{}{}", self.scheme, self.host, api)
        } else {
            format!("{}://{}{}?{}", self.scheme, self.host, api, self.query)
        }
    }

    /// 🔗 Full URL for an API path, token query included.
    pub fn api_url(&self, api: &str) -> String {
        self.category_urls.get(api).cloned().unwrap_or_else(|| self.make_url(api))
    }

    pub fn category_urls(&self) -> &HashMap<&'static str, String> {
        &self.category_urls
    }

    pub fn raw_url(&self) -> &str {
        &self.raw_url
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn max_retry_count(&self) -> u32 {
        self.opts.max_retry_count
    }

    fn client(&self) -> reqwest::Client {
        match self.client.read() {
            Ok(c) => c.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// 🔄 Swaps in a fresh client (new connection pool, fresh DNS).
    pub fn rebuild_client(&self) -> Result<()> {
        let fresh = build_client(&self.opts)?;
        match self.client.write() {
            Ok(mut c) => *c = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
        debug!("🔄 rebuilt HTTP client for {}", self.host);
        Ok(())
    }

    /// 🏷️ One value per header name, later entries replacing earlier ones (case-insensitive).
    fn header_map(&self, req: &ApiRequest) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(req.headers.len() + 1);
        if let Ok(ua) = HeaderValue::from_str(&self.user_agent) {
            map.insert(USER_AGENT, ua);
        }
        for (k, v) in &req.headers {
            match (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(v)) {
                (Ok(name), Ok(value)) => {
                    map.insert(name, value);
                }
                _ => warn!("⚠️ skipping malformed header {:?} for {}", k, req.url),
            }
        }
        map
    }

    /// 📡 One attempt. Records latency by API and status.
    async fn do_send_req(&self, req: &ApiRequest) -> std::result::Result<reqwest::Response, reqwest::Error> {
        let started = Instant::now();
        let mut builder = self.client().request(req.method.clone(), &req.url).headers(self.header_map(req));
        if let Some(body) = &req.body {
            builder = builder.body(body.clone());
        }

        let res = builder.send().await;
        let status = match &res {
            Ok(resp) => status_text(resp.status()),
            Err(e) => classify(e).to_string(),
        };
        self.ctx
            .metrics
            .api_latency
            .with_label_values(&[req.api.as_str(), status.as_str()])
            .observe(started.elapsed().as_secs_f64());
        res
    }

    /// 🔁 Sends with retries. Transport errors and 5xx are retried after `retry_delay`,
    /// up to `max_retry_count` attempts in total; anything else returns right away.
    /// After the last attempt the last response comes back as-is for the caller to judge.
    pub async fn send_req(&self, req: ApiRequest) -> Result<reqwest::Response> {
        let attempts = self.opts.max_retry_count;
        let mut last = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                if self.ctx.exit.is_set() {
                    debug!("🛑 exit requested, no more retries for {}", req.url);
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(self.opts.retry_delay) => {}
                    _ = self.ctx.exit.wait() => {
                        debug!("🛑 exit requested mid-backoff for {}", req.url);
                        break;
                    }
                }
            }

            let status = match self.do_send_req(&req).await {
                Ok(resp) if !resp.status().is_server_error() => return Ok(resp),
                Ok(resp) => {
                    let status = status_text(resp.status());
                    last = Some(Ok(resp));
                    status
                }
                Err(e) => {
                    let status = classify(&e).to_string();
                    last = Some(Err(e));
                    status
                }
            };
            if attempt < attempts {
                self.ctx.metrics.api_retry.with_label_values(&[req.api.as_str(), status.as_str()]).inc();
                warn!("🔁 {} failed ({}), retry {}/{}", req.url, status, attempt, attempts - 1);
            }
        }

        match last {
            Some(Ok(resp)) => Ok(resp),
            Some(Err(e)) => {
                Err(DatawayError::AllRetryFailed { attempts, last_error: e.to_string() })
            }
            None => Err(DatawayError::RequestTerminated),
        }
    }

    /// 🔗 Where a body goes: its category URL, else its own dynamic URL.
    fn body_url(&self, body: &Body) -> Result<(String, String)> {
        if let Some(path) = body.category().url_path() {
            if let Some(url) = self.category_urls.get(path) {
                return Ok((url.clone(), path.to_string()));
            }
        }
        match body.dynamic_url() {
            Some(raw) => {
                let url = validate_url(raw)?;
                Ok((raw.to_string(), url.path().to_string()))
            }
            None => Err(DatawayError::InvalidUrl(format!("no URL for category {}", body.category()))),
        }
    }

    /// 📤 POSTs one body. 2xx is success, 4xx is the body's fault, the rest is ours.
    pub async fn write_point_data(&self, body: &Body) -> Result<()> {
        let (url, api) = self.body_url(body)?;

        let mut req = ApiRequest::new(Method::POST, url.clone(), api)
            .header("X-Points", body.npts().unwrap_or_default().to_string())
            .header("Content-Type", body.encoding().content_type());
        if body.gzon() {
            req = req.header("Content-Encoding", "gzip");
        }
        // endpoint headers first, writer headers replace them by name
        req.headers.extend(self.headers.iter().cloned());
        req.headers.extend(body.headers().iter().cloned());
        let req = req.body(Bytes::copy_from_slice(body.payload()));

        let outcome = self.send_req(req).await;

        let (status, result) = match outcome {
            Ok(resp) => {
                let code = resp.status();
                let status = status_text(code);
                let result = if code.is_success() {
                    if url.contains("/v1/write/") {
                        self.ctx.metrics.beyond_usage.set(0);
                    }
                    debug!("✅ {} -> {}: {}", body, url, status);
                    Ok(())
                } else {
                    let text = resp.text().await.unwrap_or_default();
                    if code.is_client_error() {
                        if code == StatusCode::FORBIDDEN && text.contains("beyondDataUsage") {
                            warn!("🚫 workspace over its data quota, upstream says: {}", text);
                            self.ctx.metrics.beyond_usage.set(unix_now());
                        } else {
                            warn!("🚫 {} rejected {}: {} {}", url, body, status, text);
                        }
                        Err(DatawayError::WritePoints4XX { status: code.as_u16() })
                    } else {
                        warn!("🔥 {} failed {} after retries: {} {}", url, body, status, text);
                        Err(DatawayError::DatawayInternal { status: code.as_u16() })
                    }
                };
                (status, result)
            }
            Err(e) => {
                warn!("🔥 {} unreachable for {}: {}", url, body, e);
                ("error".to_string(), Err(e))
            }
        };

        // replays were counted the first time around
        if body.from() != BodyFrom::FailCache {
            let cat = body.category().name();
            let enc = if body.gzon() { "gzip" } else { "raw" };
            let m = &self.ctx.metrics;
            m.bytes.with_label_values(&[cat, enc, status.as_str()]).inc_by(body.payload().len() as u64);
            m.bytes.with_label_values(&[cat, "raw", "total"]).inc_by(body.raw_len() as u64);
            m.points
                .with_label_values(&[cat, status.as_str()])
                .inc_by(body.npts().unwrap_or_default() as u64);
        }
        result
    }
}

fn build_client(opts: &EndpointOptions) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(opts.http_timeout.min(Duration::from_secs(10)))
        .timeout(opts.http_timeout)
        .pool_max_idle_per_host(opts.max_idle_conns_per_host)
        .pool_idle_timeout(opts.idle_timeout);

    if let Some(proxy) = opts.proxy.as_deref().filter(|p| !p.is_empty()) {
        let parsed = Url::parse(proxy).map_err(|e| DatawayError::InvalidUrl(format!("proxy {proxy}: {e}")))?;
        match parsed.scheme() {
            "http" | "https" => builder = builder.proxy(reqwest::Proxy::all(proxy)?),
            other => return Err(DatawayError::UnsupportedScheme(format!("proxy {other}"))),
        }
    }
    Ok(builder.build()?)
}
