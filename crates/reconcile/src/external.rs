//! Seam to the external system. The core only sees JSON documents addressed
//! by a [`Locator`] and four outcome classes: success, not-found,
//! conflict/already-exists, and failure.

use std::fmt;
use std::sync::Arc;

use serde_json::Value as Json;
use smallvec::SmallVec;
use tether_core::Kind;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExternalError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("status {code}: {message}")]
    Status { code: u16, message: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("decode: {0}")]
    Decode(String),
}

impl ExternalError {
    /// Map a non-success HTTP status to an error class.
    pub fn classify(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            404 => ExternalError::NotFound(message),
            409 => ExternalError::Conflict(message),
            401 | 403 => ExternalError::Unauthorized(message),
            _ => ExternalError::Status { code, message },
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ExternalError::NotFound(_) => "not_found",
            ExternalError::Conflict(_) => "conflict",
            ExternalError::Unauthorized(_) => "unauthorized",
            ExternalError::Status { .. } => "status",
            ExternalError::Transport(_) => "transport",
            ExternalError::Decode(_) => "decode",
        }
    }
}

impl From<serde_json::Error> for ExternalError {
    fn from(e: serde_json::Error) -> Self { ExternalError::Decode(e.to_string()) }
}

/// Address of an external resource or collection: the kind, the chain of
/// parent ids (project, then repository) and the resource id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locator {
    pub kind: Kind,
    pub scope: SmallVec<[String; 2]>,
    pub id: Option<String>,
}

impl Locator {
    pub fn new(kind: Kind) -> Self { Self { kind, scope: SmallVec::new(), id: None } }

    pub fn under(mut self, parent: impl Into<String>) -> Self {
        self.scope.push(parent.into());
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Same scope, no id.
    pub fn collection(&self) -> Self { Self { kind: self.kind, scope: self.scope.clone(), id: None } }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for s in &self.scope {
            write!(f, "/{}", s)?;
        }
        if let Some(id) = &self.id {
            write!(f, "#{}", id)?;
        }
        Ok(())
    }
}

/// External client bound to one organization and credential.
#[async_trait::async_trait]
pub trait DevOpsClient: Send + Sync {
    /// `Ok(None)` when the resource does not exist.
    async fn get(&self, at: &Locator) -> Result<Option<Json>, ExternalError>;

    async fn list(&self, at: &Locator) -> Result<Vec<Json>, ExternalError>;

    /// Create in the collection at `at`. A locator carrying an id addresses a
    /// resource whose id the caller chooses (e.g. an authorization record).
    async fn create(&self, at: &Locator, body: &Json) -> Result<Json, ExternalError>;

    async fn update(&self, at: &Locator, body: &Json) -> Result<Json, ExternalError>;

    async fn delete(&self, at: &Locator) -> Result<(), ExternalError>;
}

/// Credential bytes, passed through untouched and never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(pub Vec<u8>);

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "Credential(<{} bytes>)", self.0.len()) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub organization_url: String,
    pub api_version: String,
    pub credential: Credential,
}

/// Builds clients from resolved connection parameters.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, params: &ConnectionParams) -> Result<Arc<dyn DevOpsClient>, ExternalError>;
}

/// Counts every call by kind, operation and result class.
pub struct Metered(pub Arc<dyn DevOpsClient>);

fn record<T>(at: &Locator, op: &'static str, res: &Result<T, ExternalError>) {
    let result = match res {
        Ok(_) => "ok",
        Err(e) => e.label(),
    };
    metrics::counter!("external_calls_total", 1u64, "kind" => at.kind.as_str(), "op" => op, "result" => result);
}

#[async_trait::async_trait]
impl DevOpsClient for Metered {
    async fn get(&self, at: &Locator) -> Result<Option<Json>, ExternalError> {
        let res = self.0.get(at).await;
        record(at, "get", &res);
        res
    }

    async fn list(&self, at: &Locator) -> Result<Vec<Json>, ExternalError> {
        let res = self.0.list(at).await;
        record(at, "list", &res);
        res
    }

    async fn create(&self, at: &Locator, body: &Json) -> Result<Json, ExternalError> {
        let res = self.0.create(at, body).await;
        record(at, "create", &res);
        res
    }

    async fn update(&self, at: &Locator, body: &Json) -> Result<Json, ExternalError> {
        let res = self.0.update(at, body).await;
        record(at, "update", &res);
        res
    }

    async fn delete(&self, at: &Locator) -> Result<(), ExternalError> {
        let res = self.0.delete(at).await;
        record(at, "delete", &res);
        res
    }
}

/// Render an id that may arrive as a JSON number or string.
pub fn id_string(v: &Json) -> Option<String> {
    match v {
        Json::String(s) if !s.is_empty() => Some(s.clone()),
        Json::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_maps_status_codes() {
        assert!(matches!(ExternalError::classify(404, "x"), ExternalError::NotFound(_)));
        assert!(matches!(ExternalError::classify(409, "x"), ExternalError::Conflict(_)));
        assert!(matches!(ExternalError::classify(403, "x"), ExternalError::Unauthorized(_)));
        assert_eq!(ExternalError::classify(503, "busy"), ExternalError::Status { code: 503, message: "busy".into() });
    }

    #[test]
    fn locator_display_and_collection() {
        let at = Locator::new(Kind::PullRequest).under("p").under("r").id("7");
        assert_eq!(at.to_string(), "PullRequest/p/r#7");
        assert_eq!(at.collection().id, None);
        assert_eq!(at.collection().scope.len(), 2);
    }

    #[test]
    fn credential_debug_is_redacted() {
        let c = Credential(b"secret-token".to_vec());
        assert_eq!(format!("{:?}", c), "Credential(<12 bytes>)");
    }

    #[test]
    fn id_string_accepts_numbers_and_strings() {
        assert_eq!(id_string(&serde_json::json!(12)), Some("12".into()));
        assert_eq!(id_string(&serde_json::json!("abc")), Some("abc".into()));
        assert_eq!(id_string(&serde_json::json!("")), None);
        assert_eq!(id_string(&serde_json::Value::Null), None);
    }
}
