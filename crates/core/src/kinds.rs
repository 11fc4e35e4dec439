//! Typed spec views for each kind at the storage version.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::{Kind, ManagementPolicy, Reference, Selector};

/// A field that can hold a literal value, a named reference, or a selector.
/// An explicit reference or selector takes over from a literal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<Reference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<Selector>,
}

impl Link {
    pub fn to(name: &str) -> Self { Self { reference: Some(Reference::new(name, None)), ..Default::default() } }

    pub fn literal(v: &str) -> Self { Self { value: Some(v.to_string()), ..Default::default() } }
}

/// Fields common to every managed kind, with the kind parameters flattened in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedSpec<P> {
    pub connector_config_ref: Reference,
    #[serde(default)]
    pub management_policy: ManagementPolicy,
    #[serde(flatten)]
    pub params: P,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Private,
    Public,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceControl {
    #[default]
    Git,
    Tfvc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamProjectParams {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub visibility: Visibility,
    /// Create-only.
    #[serde(default)]
    pub source_control: SourceControl,
    /// Create-only.
    #[serde(default)]
    pub process_template_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitRepositoryParams {
    pub project: Link,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_branch: Option<String>,
}

fn root_folder() -> String { "\\".to_string() }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineParams {
    pub project: Link,
    pub repository: Link,
    pub name: String,
    #[serde(default = "root_folder")]
    pub folder: String,
    pub yaml_path: String,
}

/// Kinds a typed reference may point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReferencableKind {
    TeamProject,
    GitRepository,
    Pipeline,
    Feed,
}

impl ReferencableKind {
    pub const ALL: [ReferencableKind; 4] =
        [ReferencableKind::TeamProject, ReferencableKind::GitRepository, ReferencableKind::Pipeline, ReferencableKind::Feed];

    pub fn kind(self) -> Kind {
        match self {
            ReferencableKind::TeamProject => Kind::TeamProject,
            ReferencableKind::GitRepository => Kind::GitRepository,
            ReferencableKind::Pipeline => Kind::Pipeline,
            ReferencableKind::Feed => Kind::Feed,
        }
    }

    /// Resource type string the external permissions API uses.
    pub fn resource_type(self) -> &'static str {
        match self {
            ReferencableKind::TeamProject => "project",
            ReferencableKind::GitRepository => "repository",
            ReferencableKind::Pipeline => "pipeline",
            ReferencableKind::Feed => "feed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported resource type: {0}")]
pub struct UnsupportedResourceType(pub String);

impl FromStr for ReferencableKind {
    type Err = UnsupportedResourceType;

    /// Parses the external resource type string. Anything outside the closed set is rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ReferencableKind::ALL
            .into_iter()
            .find(|k| k.resource_type() == s)
            .ok_or_else(|| UnsupportedResourceType(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedLink {
    pub kind: ReferencableKind,
    #[serde(flatten)]
    pub link: Link,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelinePermissionParams {
    pub project: Link,
    pub resource: TypedLink,
    #[serde(default)]
    pub pipelines: Vec<Link>,
    #[serde(default)]
    pub authorize_all: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullRequestStatus {
    #[default]
    Active,
    Abandoned,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestParams {
    pub project: Link,
    pub repository: Link,
    pub source_branch: String,
    pub target_branch: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: PullRequestStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchKind {
    #[default]
    Exact,
    Prefix,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyScope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<Link>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_name: Option<String>,
    #[serde(default)]
    pub match_kind: MatchKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyParams {
    pub project: Link,
    pub type_id: String,
    #[serde(default = "enabled")]
    pub is_enabled: bool,
    #[serde(default)]
    pub is_blocking: bool,
    #[serde(default)]
    pub scope: Vec<PolicyScope>,
    #[serde(default)]
    pub settings: Map<String, Json>,
}

fn enabled() -> bool { true }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamSource {
    pub name: String,
    pub protocol: String,
    pub location: String,
    #[serde(default = "public_upstream")]
    pub upstream_source_type: String,
}

fn public_upstream() -> String { "public".to_string() }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<Link>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub upstream_enabled: bool,
    #[serde(default)]
    pub upstream_sources: Vec<UpstreamSource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeySelector {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub secret_ref: SecretKeySelector,
}

fn default_rest_version() -> String { "7.1".to_string() }

/// Spec of the connection-parameters kind read by Connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorConfigSpec {
    pub organization_url: String,
    #[serde(default = "default_rest_version")]
    pub api_version: String,
    pub credentials: Credentials,
}
