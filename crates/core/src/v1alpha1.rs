//! Legacy schema. Fields that later became references hold plain literals
//! here: owning project and repository by external name, permission targets
//! and pipelines by external id. Kinds not listed are shaped the same in
//! both versions.

use serde::{Deserialize, Serialize};

fn root_folder() -> String { "\\".to_string() }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitRepositoryParams {
    /// Project name.
    pub project: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_branch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryName {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineParams {
    /// Project name.
    pub project: String,
    pub repository: RepositoryName,
    pub name: String,
    #[serde(default = "root_folder")]
    pub folder: String,
    pub yaml_path: String,
}

/// Protected resource as the permissions API names it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionResource {
    #[serde(rename = "type")]
    pub type_: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelinePermissionParams {
    /// Project name.
    pub project: String,
    pub resource: PermissionResource,
    /// Pipeline ids.
    #[serde(default)]
    pub pipelines: Vec<String>,
    #[serde(default)]
    pub authorize_all: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_resource_uses_type_key() {
        let p: PipelinePermissionParams = serde_json::from_value(serde_json::json!({
            "project": "Demo",
            "resource": {"type": "repository", "id": "r-1"},
            "pipelines": ["7"]
        }))
        .unwrap();
        assert_eq!(p.resource.type_, "repository");
        assert!(!p.authorize_all);
        assert_eq!(serde_json::to_value(&p.resource).unwrap()["type"], "repository");
    }
}
