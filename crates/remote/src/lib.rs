//! Tether remote: `DevOpsClient` over the DevOps REST API.
//!
//! Each [`Locator`] maps to one route. Bodies and responses pass through as
//! JSON; non-success statuses are classified with [`ExternalError::classify`].

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde_json::Value as Json;
use tether_core::Kind;
use tether_reconcile::{ConnectionParams, Connector, DevOpsClient, ExternalError, Locator};
use tracing::debug;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const FEEDS_HOST: &str = "feeds.dev.azure.com";
const HOSTED: &str = "dev.azure.com";

fn invalid(message: impl Into<String>) -> ExternalError { ExternalError::Status { code: 400, message: message.into() } }

/// Parent id at `i` in the locator scope.
fn scope(at: &Locator, i: usize) -> Result<&str, ExternalError> {
    at.scope.get(i).map(String::as_str).ok_or_else(|| invalid(format!("{} is missing a parent id", at)))
}

/// Pull the service's `message` out of an error body, else the raw text.
fn message_of(body: &str) -> String {
    serde_json::from_str::<Json>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Json::as_str).map(str::to_string))
        .unwrap_or_else(|| body.chars().take(512).collect())
}

/// Client bound to one organization and personal access token.
pub struct HttpClient {
    http: reqwest::Client,
    base: Url,
    feeds: Url,
    api_version: String,
    token: String,
}

impl HttpClient {
    pub fn new(http: reqwest::Client, params: &ConnectionParams) -> Result<Self, ExternalError> {
        let base = Url::parse(params.organization_url.trim_end_matches('/'))
            .map_err(|e| invalid(format!("organization url {}: {}", params.organization_url, e)))?;
        let token = String::from_utf8(params.credential.0.clone())
            .map_err(|_| ExternalError::Unauthorized("credential is not valid UTF-8".to_string()))?;
        let token = token.trim().to_string();
        if token.is_empty() {
            return Err(ExternalError::Unauthorized("empty credential".to_string()));
        }
        Ok(Self { feeds: feeds_base(&base), http, base, api_version: params.api_version.clone(), token })
    }

    /// URL for `at`, including the `api-version` query.
    pub fn route(&self, at: &Locator) -> Result<Url, ExternalError> {
        let (base, path): (&Url, Vec<&str>) = match at.kind {
            Kind::TeamProject => (&self.base, vec!["_apis", "projects"]),
            Kind::GitRepository => (&self.base, vec![scope(at, 0)?, "_apis", "git", "repositories"]),
            Kind::Pipeline => (&self.base, vec![scope(at, 0)?, "_apis", "build", "definitions"]),
            Kind::PipelinePermission => (&self.base, vec![scope(at, 0)?, "_apis", "pipelines", "pipelinepermissions"]),
            Kind::PullRequest => {
                (&self.base, vec![scope(at, 0)?, "_apis", "git", "repositories", scope(at, 1)?, "pullrequests"])
            }
            Kind::Policy => (&self.base, vec![scope(at, 0)?, "_apis", "policy", "configurations"]),
            Kind::Feed => {
                let mut p: Vec<&str> = at.scope.iter().map(String::as_str).collect();
                p.extend(["_apis", "packaging", "feeds"]);
                (&self.feeds, p)
            }
            Kind::ConnectorConfig => return Err(invalid("ConnectorConfig has no external resource")),
        };
        let mut url = base.clone();
        {
            let mut segs = url.path_segments_mut().map_err(|_| invalid(format!("{} cannot be a base url", base)))?;
            segs.pop_if_empty().extend(path);
            // Authorization ids are `type/id` and span two segments.
            if let Some(id) = &at.id {
                segs.extend(id.split('/'));
            }
        }
        url.query_pairs_mut().append_pair("api-version", &self.api_version_for(at.kind));
        Ok(url)
    }

    fn api_version_for(&self, kind: Kind) -> String {
        match kind {
            Kind::PipelinePermission | Kind::Feed if !self.api_version.contains("preview") => {
                format!("{}-preview.1", self.api_version)
            }
            _ => self.api_version.clone(),
        }
    }

    async fn send(&self, method: Method, url: Url, body: Option<&Json>) -> Result<Option<Json>, ExternalError> {
        let mut req = self.http.request(method.clone(), url.clone()).basic_auth("", Some(&self.token));
        if let Some(b) = body {
            req = req.json(b);
        }
        let resp = req.send().await.map_err(|e| ExternalError::Transport(e.to_string()))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| ExternalError::Transport(e.to_string()))?;
        debug!(%method, path = url.path(), status = status.as_u16(), "external call");
        if !status.is_success() {
            return Err(ExternalError::classify(status.as_u16(), message_of(&text)));
        }
        if text.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&text)?))
    }

    fn expect_doc(at: &Locator, doc: Option<Json>) -> Result<Json, ExternalError> {
        doc.ok_or_else(|| ExternalError::Decode(format!("empty response for {}", at)))
    }
}

/// Packaging lives on its own host for the hosted service.
fn feeds_base(base: &Url) -> Url {
    let mut feeds = base.clone();
    if base.host_str() == Some(HOSTED) && feeds.set_host(Some(FEEDS_HOST)).is_err() {
        return base.clone();
    }
    feeds
}

#[async_trait::async_trait]
impl DevOpsClient for HttpClient {
    async fn get(&self, at: &Locator) -> Result<Option<Json>, ExternalError> {
        match self.send(Method::GET, self.route(at)?, None).await {
            Err(ExternalError::NotFound(_)) => Ok(None),
            other => other,
        }
    }

    async fn list(&self, at: &Locator) -> Result<Vec<Json>, ExternalError> {
        let doc = self.send(Method::GET, self.route(&at.collection())?, None).await?;
        match doc {
            None => Ok(Vec::new()),
            Some(Json::Array(items)) => Ok(items),
            Some(mut d) => match d.get_mut("value").map(Json::take) {
                Some(Json::Array(items)) => Ok(items),
                _ => Err(ExternalError::Decode(format!("list {} did not return a value array", at))),
            },
        }
    }

    async fn create(&self, at: &Locator, body: &Json) -> Result<Json, ExternalError> {
        // Caller-chosen ids are written in place; everything else is posted to the collection.
        let method = if at.id.is_some() { Method::PATCH } else { Method::POST };
        let doc = self.send(method, self.route(at)?, Some(body)).await?;
        Self::expect_doc(at, doc)
    }

    async fn update(&self, at: &Locator, body: &Json) -> Result<Json, ExternalError> {
        let method = match at.kind {
            Kind::Pipeline | Kind::Policy => Method::PUT,
            _ => Method::PATCH,
        };
        let doc = self.send(method, self.route(at)?, Some(body)).await?;
        Self::expect_doc(at, doc)
    }

    async fn delete(&self, at: &Locator) -> Result<(), ExternalError> {
        self.send(Method::DELETE, self.route(at)?, None).await.map(|_| ())
    }
}

/// Builds [`HttpClient`]s sharing one connection pool.
#[derive(Clone)]
pub struct HttpConnector {
    http: reqwest::Client,
}

impl HttpConnector {
    pub fn new() -> Result<Self, ExternalError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("tether/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ExternalError::Transport(e.to_string()))?;
        Ok(Self { http })
    }
}

#[async_trait::async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, params: &ConnectionParams) -> Result<Arc<dyn DevOpsClient>, ExternalError> {
        Ok(Arc::new(HttpClient::new(self.http.clone(), params)?))
    }
}
