use serde_json::{json, Value as Json};
use tether_core::kinds::PipelineParams;
use tether_core::{ExternalObservation, Kind};
use tether_resolve::extract;

use super::{CreateOutcome, ExternalResource, Pass};
use crate::compare::covers;
use crate::error::ReconcileResult;
use crate::external::{ExternalError, Locator};

pub struct Pipeline(pub PipelineParams);

struct Scope {
    at: Locator,
    repository: String,
}

/// The compared subset: name, folder, yaml path and repository id.
fn compared(p: &PipelineParams, repository: &str) -> Json {
    json!({
        "name": p.name,
        "path": p.folder,
        "process": { "yamlFilename": p.yaml_path },
        "repository": { "id": repository },
    })
}

pub fn pipeline_up_to_date(p: &PipelineParams, repository: &str, observed: &Json) -> bool {
    covers(&compared(p, repository), observed)
}

fn definition(p: &PipelineParams, repository: &str) -> Json {
    json!({
        "name": p.name,
        "path": p.folder,
        "type": "build",
        "process": { "type": 2, "yamlFilename": p.yaml_path },
        "repository": { "id": repository, "type": "TfsGit" },
    })
}

impl Pipeline {
    async fn scope(&self, cx: &mut Pass<'_>) -> ReconcileResult<Scope> {
        let project = cx.bind("project", Kind::TeamProject, &self.0.project, extract::external_id).await?;
        let repository = cx.bind("repository", Kind::GitRepository, &self.0.repository, extract::external_id).await?;
        Ok(Scope { at: Locator::new(Kind::Pipeline).under(project), repository })
    }
}

#[async_trait::async_trait]
impl ExternalResource for Pipeline {
    async fn observe(&self, cx: &mut Pass<'_>) -> ReconcileResult<ExternalObservation> {
        let s = self.scope(cx).await?;
        let Some(doc) = cx.find(&s.at, &self.0.name).await? else { return Ok(ExternalObservation::missing()) };
        cx.record(&doc, "id", Some("name"));
        Ok(ExternalObservation::found(pipeline_up_to_date(&self.0, &s.repository, &doc)))
    }

    async fn create(&self, cx: &mut Pass<'_>) -> ReconcileResult<CreateOutcome> {
        let s = self.scope(cx).await?;
        match cx.client.create(&s.at, &definition(&self.0, &s.repository)).await {
            Ok(doc) => {
                cx.record(&doc, "id", Some("name"));
                Ok(CreateOutcome::Created)
            }
            Err(ExternalError::Conflict(_)) => cx.adopt_named(&s.at, &self.0.name, "id").await,
            Err(e) => Err(e.into()),
        }
    }

    /// Definitions are replaced whole; the service wants the revision it last handed out.
    async fn update(&self, cx: &mut Pass<'_>) -> ReconcileResult<()> {
        let s = self.scope(cx).await?;
        let id = cx.require_id()?;
        let mut body = definition(&self.0, &s.repository);
        body["id"] = cx.status.at_provider.get("id").cloned().unwrap_or_else(|| json!(id));
        if let Some(rev) = cx.status.at_provider.get("revision") {
            body["revision"] = rev.clone();
        }
        let doc = cx.client.update(&s.at.id(id), &body).await?;
        cx.record(&doc, "id", Some("name"));
        Ok(())
    }

    async fn delete(&self, cx: &mut Pass<'_>) -> ReconcileResult<()> {
        let Some(id) = cx.external_id() else { return Ok(()) };
        let s = self.scope(cx).await?;
        cx.client.delete(&s.at.id(id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::kinds::Link;

    fn params() -> PipelineParams {
        PipelineParams {
            project: Link::to("p"),
            repository: Link::to("r"),
            name: "ci".into(),
            folder: "\\team".into(),
            yaml_path: "azure-pipelines.yml".into(),
        }
    }

    #[test]
    fn compares_repository_and_yaml_path() {
        let observed = json!({
            "id": 12, "revision": 3, "name": "ci", "path": "\\team",
            "process": {"type": 2, "yamlFilename": "azure-pipelines.yml"},
            "repository": {"id": "repo-1", "type": "TfsGit", "url": "https://x"},
            "createdDate": "2024-01-01"
        });
        assert!(pipeline_up_to_date(&params(), "repo-1", &observed));
        assert!(!pipeline_up_to_date(&params(), "repo-2", &observed));
        let mut moved = params();
        moved.yaml_path = "ci/build.yml".into();
        assert!(!pipeline_up_to_date(&moved, "repo-1", &observed));
    }
}
