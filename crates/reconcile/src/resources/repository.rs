use serde_json::{json, Map, Value as Json};
use tether_core::kinds::GitRepositoryParams;
use tether_core::{ExternalObservation, Kind};
use tether_resolve::extract;

use super::{normalize_ref, CreateOutcome, ExternalResource, Pass};
use crate::compare::{changed_keys, patch_body};
use crate::error::ReconcileResult;
use crate::external::{ExternalError, Locator};

const COMPARED: &[&str] = &["name", "defaultBranch"];

pub struct GitRepository(pub GitRepositoryParams);

fn desired(p: &GitRepositoryParams) -> Map<String, Json> {
    let mut d = Map::new();
    d.insert("name".into(), json!(p.name));
    // An unset default branch is left to the service.
    if let Some(b) = &p.default_branch {
        d.insert("defaultBranch".into(), json!(normalize_ref(b)));
    }
    d
}

pub fn repository_up_to_date(p: &GitRepositoryParams, observed: &Json) -> bool {
    changed_keys(&desired(p), observed, COMPARED).is_empty()
}

impl GitRepository {
    async fn at(&self, cx: &mut Pass<'_>) -> ReconcileResult<(Locator, String)> {
        let project = cx.bind("project", Kind::TeamProject, &self.0.project, extract::external_id).await?;
        Ok((Locator::new(Kind::GitRepository).under(project.clone()), project))
    }
}

#[async_trait::async_trait]
impl ExternalResource for GitRepository {
    async fn observe(&self, cx: &mut Pass<'_>) -> ReconcileResult<ExternalObservation> {
        let (at, _) = self.at(cx).await?;
        let Some(doc) = cx.find(&at, &self.0.name).await? else { return Ok(ExternalObservation::missing()) };
        cx.record(&doc, "id", Some("name"));
        Ok(ExternalObservation::found(repository_up_to_date(&self.0, &doc)))
    }

    async fn create(&self, cx: &mut Pass<'_>) -> ReconcileResult<CreateOutcome> {
        let (at, project) = self.at(cx).await?;
        let body = json!({ "name": self.0.name, "project": { "id": project } });
        match cx.client.create(&at, &body).await {
            Ok(doc) => {
                cx.record(&doc, "id", Some("name"));
                Ok(CreateOutcome::Created)
            }
            Err(ExternalError::Conflict(_)) => cx.adopt_named(&at, &self.0.name, "id").await,
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, cx: &mut Pass<'_>) -> ReconcileResult<()> {
        let (at, _) = self.at(cx).await?;
        let id = cx.require_id()?;
        if let Some(body) = patch_body(&desired(&self.0), &cx.status.at_provider, COMPARED) {
            let doc = cx.client.update(&at.id(id), &body).await?;
            cx.record(&doc, "id", Some("name"));
        }
        Ok(())
    }

    async fn delete(&self, cx: &mut Pass<'_>) -> ReconcileResult<()> {
        let Some(id) = cx.external_id() else { return Ok(()) };
        let (at, _) = self.at(cx).await?;
        cx.client.delete(&at.id(id)).await?;
        Ok(())
    }
}
