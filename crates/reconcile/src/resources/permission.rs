use serde_json::{json, Value as Json};
use tether_core::kinds::PipelinePermissionParams;
use tether_core::{ExternalObservation, Kind};
use tether_resolve::extract;
use tracing::debug;

use super::{CreateOutcome, ExternalResource, Pass};
use crate::error::ReconcileResult;
use crate::external::{id_string, Locator};

/// Authorization of pipelines on a protected resource (repository, feed, ...).
///
/// The record has no lifecycle of its own: it "exists" when the desired
/// grants are in force. The service recomputes grants as a side effect of
/// other changes, so Update does nothing and drift sends us back to Create.
pub struct PipelinePermission(pub PipelinePermissionParams);

struct Target {
    at: Locator,
    resource_type: &'static str,
    resource_id: String,
    pipelines: Vec<String>,
}

impl PipelinePermission {
    async fn target(&self, cx: &mut Pass<'_>) -> ReconcileResult<Target> {
        let p = &self.0;
        let project = cx.bind("project", Kind::TeamProject, &p.project, extract::external_id).await?;
        let resource_id = cx.bind("resource", p.resource.kind.kind(), &p.resource.link, extract::external_id).await?;
        let mut pipelines = Vec::with_capacity(p.pipelines.len());
        for (i, link) in p.pipelines.iter().enumerate() {
            pipelines.push(cx.bind(&format!("pipelines[{}]", i), Kind::Pipeline, link, extract::external_id).await?);
        }
        let resource_type = p.resource.kind.resource_type();
        let at = Locator::new(Kind::PipelinePermission).under(project).id(format!("{}/{}", resource_type, resource_id));
        Ok(Target { at, resource_type, resource_id, pipelines })
    }

    fn body(&self, t: &Target, authorized: bool) -> Json {
        let pipelines: Vec<Json> =
            t.pipelines.iter().map(|id| json!({ "id": pipeline_id(id), "authorized": authorized })).collect();
        let mut body = json!({
            "resource": { "type": t.resource_type, "id": t.resource_id },
            "pipelines": pipelines,
        });
        if self.0.authorize_all {
            body["allPipelines"] = json!({ "authorized": authorized });
        }
        body
    }
}

fn pipeline_id(id: &str) -> Json { id.parse::<u64>().map(|n| json!(n)).unwrap_or_else(|_| json!(id)) }

/// True when every desired grant appears authorized in `observed`.
pub fn authorization_in_force(pipelines: &[String], authorize_all: bool, observed: &Json) -> bool {
    if authorize_all && observed.pointer("/allPipelines/authorized").and_then(Json::as_bool) != Some(true) {
        return false;
    }
    let granted: Vec<String> = observed
        .get("pipelines")
        .and_then(Json::as_array)
        .map(|a| {
            a.iter()
                .filter(|p| p.get("authorized").and_then(Json::as_bool).unwrap_or(false))
                .filter_map(|p| p.get("id").and_then(id_string))
                .collect()
        })
        .unwrap_or_default();
    pipelines.iter().all(|want| granted.iter().any(|g| g == want))
}

#[async_trait::async_trait]
impl ExternalResource for PipelinePermission {
    async fn observe(&self, cx: &mut Pass<'_>) -> ReconcileResult<ExternalObservation> {
        let t = self.target(cx).await?;
        let Some(doc) = cx.client.get(&t.at).await? else { return Ok(ExternalObservation::missing()) };
        cx.status.at_provider = doc.clone();
        if authorization_in_force(&t.pipelines, self.0.authorize_all, &doc) {
            Ok(ExternalObservation::found(true))
        } else {
            Ok(ExternalObservation::missing())
        }
    }

    async fn create(&self, cx: &mut Pass<'_>) -> ReconcileResult<CreateOutcome> {
        let t = self.target(cx).await?;
        let doc = cx.client.create(&t.at, &self.body(&t, true)).await?;
        cx.status.external_id = t.at.id.clone();
        cx.status.at_provider = doc;
        Ok(CreateOutcome::Created)
    }

    async fn update(&self, _cx: &mut Pass<'_>) -> ReconcileResult<()> {
        debug!("pipeline permissions are recomputed by the service; nothing to update");
        Ok(())
    }

    async fn delete(&self, cx: &mut Pass<'_>) -> ReconcileResult<()> {
        if cx.external_id().is_none() {
            return Ok(());
        }
        let t = self.target(cx).await?;
        cx.client.update(&t.at, &self.body(&t, false)).await?;
        Ok(())
    }
}
