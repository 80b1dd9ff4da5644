//! 🛰️ The other things a dataway answers besides `/v1/write/*`.
//!
//! All of these go through `send_req` (same retries, same User-Agent, same latency
//! histogram) and come back as the raw response bytes unless noted.

use bytes::Bytes;
use reqwest::Method;
use serde::Deserialize;
use tracing::debug;

use super::{
    API_CHECK_TOKEN, API_DATAKIT_PULL, API_ELECTION, API_ELECTION_HEARTBEAT, API_LIST_DATAWAY, API_LOG_UPLOAD, API_NTP,
    API_OBJECT_LABELS, API_PROFILING_UPLOAD, API_QUERY_RAW, API_REMOTE_JOB, API_USAGE_TRACE, API_WORKSPACE, ApiRequest,
    Endpoint, status_text,
};
use crate::body::unix_now;
use crate::error::{DatawayError, Result};

/// 🗺️ `/v2/list/dataway` answer: where else to send data, and how often to ask again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DatawayList {
    #[serde(default)]
    pub dataway_list: Vec<String>,
    /// seconds
    #[serde(default)]
    pub interval: i64,
}

#[derive(Deserialize)]
struct Content<T> {
    content: T,
}

#[derive(Deserialize)]
struct NtpReply {
    timestamp_sec: i64,
}

/// 🔗 Tacks `extra` onto `url`'s query string, opening one when there is none.
fn with_query(url: String, extra: &str) -> String {
    if extra.is_empty() {
        return url;
    }
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{url}{sep}{extra}")
}

impl Endpoint {
    /// 📞 Sends and insists on a 2xx, returning the body bytes.
    async fn call(&self, req: ApiRequest) -> Result<Bytes> {
        let api = req.api.clone();
        let resp = self.send_req(req).await?;
        let status = resp.status();
        let body = resp.bytes().await?;
        if !status.is_success() {
            return Err(DatawayError::Status {
                api,
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        debug!("🛰️ {} -> {}, {} bytes", api, status_text(status), body.len());
        Ok(body)
    }

    fn require_token(&self) -> Result<&str> {
        self.token().ok_or(DatawayError::TokenMissing)
    }

    /// ⬇️ Pulls remote config (pipelines, filters, ...). `args` is appended as-is.
    pub async fn datakit_pull(&self, args: &str) -> Result<Bytes> {
        let url = with_query(self.api_url(API_DATAKIT_PULL), args);
        self.call(ApiRequest::new(Method::GET, url, API_DATAKIT_PULL)).await
    }

    /// 🗳️ Campaigns for leadership of `namespace`.
    pub async fn election(&self, namespace: &str, id: &str) -> Result<Bytes> {
        self.require_token()?;
        let url = with_query(self.api_url(API_ELECTION), &format!("namespace={namespace}&id={id}"));
        self.call(ApiRequest::new(Method::POST, url, API_ELECTION)).await
    }

    /// 💓 Keeps an election win alive.
    pub async fn election_heartbeat(&self, namespace: &str, id: &str) -> Result<Bytes> {
        self.require_token()?;
        let url = with_query(self.api_url(API_ELECTION_HEARTBEAT), &format!("namespace={namespace}&id={id}"));
        self.call(ApiRequest::new(Method::POST, url, API_ELECTION_HEARTBEAT)).await
    }

    pub async fn dataway_list(&self) -> Result<DatawayList> {
        let body = self.call(ApiRequest::new(Method::GET, self.api_url(API_LIST_DATAWAY), API_LIST_DATAWAY)).await?;
        let parsed: Content<DatawayList> = serde_json::from_slice(&body)?;
        Ok(parsed.content)
    }

    /// 🔑 Asks the dataway whether `token` exists. `Ok(false)` on any non-2xx.
    pub async fn check_token_remote(&self, token: &str) -> Result<bool> {
        let url = format!("{}://{}{}/{}", self.scheme, self.host, API_CHECK_TOKEN, token);
        // per-token URLs share one latency series
        let resp = self.send_req(ApiRequest::new(Method::GET, url, API_CHECK_TOKEN)).await?;
        Ok(resp.status().is_success())
    }

    /// ⏱️ Seconds the dataway clock is ahead of ours (negative when behind).
    pub async fn time_diff(&self) -> Result<i64> {
        let body = self.call(ApiRequest::new(Method::GET, self.api_url(API_NTP), API_NTP)).await?;
        let reply: Content<NtpReply> = serde_json::from_slice(&body)?;
        Ok(reply.content.timestamp_sec - unix_now())
    }

    pub async fn upsert_object_labels(&self, payload: impl Into<Bytes>) -> Result<Bytes> {
        let req = ApiRequest::new(Method::POST, self.api_url(API_OBJECT_LABELS), API_OBJECT_LABELS)
            .header("Content-Type", "application/json")
            .body(payload);
        self.call(req).await
    }

    pub async fn delete_object_labels(&self, payload: impl Into<Bytes>) -> Result<Bytes> {
        let req = ApiRequest::new(Method::DELETE, self.api_url(API_OBJECT_LABELS), API_OBJECT_LABELS)
            .header("Content-Type", "application/json")
            .body(payload);
        self.call(req).await
    }

    /// 🛠️ Reports a remote job result.
    pub async fn remote_job(&self, payload: impl Into<Bytes>) -> Result<Bytes> {
        let req = ApiRequest::new(Method::POST, self.api_url(API_REMOTE_JOB), API_REMOTE_JOB)
            .header("Content-Type", "application/json")
            .body(payload);
        self.call(req).await
    }

    pub async fn usage_trace(&self, payload: impl Into<Bytes>) -> Result<Bytes> {
        let req = ApiRequest::new(Method::POST, self.api_url(API_USAGE_TRACE), API_USAGE_TRACE)
            .header("Content-Type", "application/json")
            .body(payload);
        self.call(req).await
    }

    pub async fn workspace_query(&self, payload: impl Into<Bytes>) -> Result<Bytes> {
        let req = ApiRequest::new(Method::POST, self.api_url(API_WORKSPACE), API_WORKSPACE)
            .header("Content-Type", "application/json")
            .body(payload);
        self.call(req).await
    }

    pub async fn query_raw(&self, payload: impl Into<Bytes>) -> Result<Bytes> {
        let req = ApiRequest::new(Method::POST, self.api_url(API_QUERY_RAW), API_QUERY_RAW)
            .header("Content-Type", "application/json")
            .body(payload);
        self.call(req).await
    }

    /// 📜 Ships the agent's own log file contents.
    pub async fn upload_log(&self, hostname: &str, payload: impl Into<Bytes>) -> Result<Bytes> {
        let req = ApiRequest::new(Method::POST, self.api_url(API_LOG_UPLOAD), API_LOG_UPLOAD)
            .header("Host-Name", hostname)
            .body(payload);
        self.call(req).await
    }

    /// 🔬 Uploads a profile; `content_type` is usually a multipart boundary header.
    pub async fn upload_profile(&self, content_type: &str, payload: impl Into<Bytes>) -> Result<Bytes> {
        let req = ApiRequest::new(Method::POST, self.api_url(API_PROFILING_UPLOAD), API_PROFILING_UPLOAD)
            .header("Content-Type", content_type)
            .body(payload);
        self.call(req).await
    }
}
