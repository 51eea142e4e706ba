use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::{json, Map, Value};
use std::fmt;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::Config;
use crate::model::FailureKind;
use crate::publisher::model::{CreatePostResp, GraphErrorResp};

pub mod model;

const GRAPH_API_BASE: &str = "https://graph.facebook.com/v18.0/";

/// A publish attempt that did not yield an external post id. The kind tells
/// the retry policy whether another attempt can help.
#[derive(Debug, Error)]
#[error("publish failed ({kind:?}): {message}")]
pub struct PublishError {
    pub kind: FailureKind,
    pub message: String,
}

impl PublishError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }
}

/// The content payload handed to a publisher: the body text plus opaque
/// media references already known to the platform.
#[derive(Debug, Clone)]
pub struct PublishContent {
    pub body: String,
    pub media_refs: Vec<String>,
}

/// Capability boundary to the external platform. The dispatch worker only
/// ever talks to this trait; tests substitute recording fakes.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        page_external_id: &str,
        content: &PublishContent,
    ) -> Result<String, PublishError>;
}

#[derive(Clone)]
pub struct GraphPublisher {
    http: Client,
    base_url: Url,
    access_token: String,
}

impl fmt::Debug for GraphPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphPublisher")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl GraphPublisher {
    pub fn new(access_token: String) -> Self {
        let base_url = Url::parse(GRAPH_API_BASE).expect("valid default Graph URL");
        Self::with_base_url(access_token, base_url)
    }

    pub fn with_base_url(access_token: String, base_url: Url) -> Self {
        let http = Client::builder()
            .user_agent("pagecast/0.1")
            .no_proxy()
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            access_token,
        }
    }

    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let mut base = cfg.platform.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).context("invalid platform.base_url")?;
        Ok(Self::with_base_url(cfg.platform.access_token.clone(), base_url))
    }

    pub fn build_request(
        &self,
        page_external_id: &str,
        content: &PublishContent,
    ) -> Result<reqwest::Request, PublishError> {
        let endpoint = self
            .base_url
            .join(&format!("{}/feed", page_external_id))
            .map_err(|e| PublishError::permanent(format!("invalid feed URL: {}", e)))?;
        let body = build_feed_request(content);
        self.http
            .post(endpoint)
            .header("Authorization", format!("Bearer {}", self.access_token))
            .header("Content-Type", "application/json")
            .json(&body)
            .build()
            .map_err(|e| PublishError::permanent(format!("failed to build request: {}", e)))
    }
}

#[async_trait]
impl Publisher for GraphPublisher {
    async fn publish(
        &self,
        page_external_id: &str,
        content: &PublishContent,
    ) -> Result<String, PublishError> {
        let request = self.build_request(page_external_id, content)?;
        info!(url = %request.url(), page = page_external_id, "publishing to platform");

        let res = self
            .http
            .execute(request)
            .await
            .map_err(|e| PublishError::transient(format!("failed to reach platform: {}", e)))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            let message = match serde_json::from_str::<GraphErrorResp>(&body) {
                Ok(parsed) => format!("platform error {} (code {})", parsed.error.message, parsed.error.code),
                Err(_) => format!("platform error {}: {}", status, body),
            };
            warn!(%status, page = page_external_id, "publish rejected");
            return Err(PublishError {
                kind: classify_status(status),
                message,
            });
        }

        let payload: CreatePostResp = res
            .json()
            .await
            .map_err(|e| PublishError::transient(format!("invalid platform response: {}", e)))?;
        info!(page = page_external_id, post = %payload.id, "published");
        Ok(payload.id)
    }
}

/// Rate limits, timeouts and server-side errors are worth retrying; every
/// other rejection (bad token, removed page, malformed post) is final.
fn classify_status(status: StatusCode) -> FailureKind {
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        FailureKind::Transient
    } else {
        FailureKind::Permanent
    }
}

pub fn build_feed_request(content: &PublishContent) -> Value {
    let mut body = Map::new();
    body.insert("message".into(), json!(content.body));
    if !content.media_refs.is_empty() {
        let media: Vec<Value> = content
            .media_refs
            .iter()
            .map(|r| json!({ "media_fbid": r }))
            .collect();
        body.insert("attached_media".into(), Value::Array(media));
    }
    Value::Object(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_content() -> PublishContent {
        PublishContent {
            body: "hello world".into(),
            media_refs: vec!["m-1".into(), "m-2".into()],
        }
    }

    #[test]
    fn build_feed_request_includes_media() {
        let body = build_feed_request(&sample_content());
        assert_eq!(body["message"], "hello world");
        assert_eq!(body["attached_media"][0]["media_fbid"], "m-1");
        assert_eq!(body["attached_media"][1]["media_fbid"], "m-2");
    }

    #[test]
    fn build_feed_request_omits_empty_media() {
        let body = build_feed_request(&PublishContent {
            body: "text only".into(),
            media_refs: vec![],
        });
        assert!(body.get("attached_media").is_none());
    }

    #[test]
    fn build_request_sets_headers_and_path() {
        let publisher = GraphPublisher::new("token".into());
        let request = publisher.build_request("page-77", &sample_content()).unwrap();
        assert_eq!(request.method(), reqwest::Method::POST);
        assert!(request.url().path().ends_with("page-77/feed"));
        let headers = request.headers();
        assert_eq!(
            headers.get("Authorization").and_then(|h| h.to_str().ok()).unwrap(),
            "Bearer token"
        );
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), FailureKind::Transient);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), FailureKind::Transient);
        assert_eq!(classify_status(StatusCode::REQUEST_TIMEOUT), FailureKind::Transient);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), FailureKind::Permanent);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), FailureKind::Permanent);
    }
}
