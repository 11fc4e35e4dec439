use serde_json::{json, Value as Json};
use tether_core::kinds::{SourceControl, TeamProjectParams, Visibility};
use tether_core::{ExternalObservation, Kind};

use super::{CreateOutcome, ExternalResource, Pass};
use crate::compare::{changed_keys, patch_body, str_field};
use crate::error::ReconcileResult;
use crate::external::{id_string, ExternalError, Locator};

const COMPARED: &[&str] = &["name", "description", "visibility"];

pub struct TeamProject(pub TeamProjectParams);

fn desired(p: &TeamProjectParams) -> Json {
    let visibility = match p.visibility {
        Visibility::Private => "private",
        Visibility::Public => "public",
    };
    json!({ "name": p.name, "description": p.description, "visibility": visibility })
}

pub fn project_up_to_date(p: &TeamProjectParams, observed: &Json) -> bool {
    match desired(p) {
        Json::Object(d) => changed_keys(&d, observed, COMPARED).is_empty(),
        _ => false,
    }
}

fn at() -> Locator { Locator::new(Kind::TeamProject) }

#[async_trait::async_trait]
impl ExternalResource for TeamProject {
    async fn observe(&self, cx: &mut Pass<'_>) -> ReconcileResult<ExternalObservation> {
        let Some(doc) = cx.find(&at(), &self.0.name).await? else { return Ok(ExternalObservation::missing()) };
        cx.record(&doc, "id", Some("name"));
        Ok(ExternalObservation::found(project_up_to_date(&self.0, &doc)))
    }

    async fn create(&self, cx: &mut Pass<'_>) -> ReconcileResult<CreateOutcome> {
        let p = &self.0;
        let mut body = desired(p);
        body["capabilities"] = json!({
            "versioncontrol": { "sourceControlType": match p.source_control { SourceControl::Git => "Git", SourceControl::Tfvc => "Tfvc" } },
            "processTemplate": { "templateTypeId": p.process_template_id },
        });
        // A recorded id here belongs to a project that no longer exists.
        cx.status.external_id = None;
        match cx.client.create(&at(), &body).await {
            Ok(created) => {
                // Project creation may answer with an operation record; only a
                // document carrying our name holds the project id.
                if str_field(&created, "name") == p.name {
                    cx.status.external_id = created.get("id").and_then(id_string);
                }
                cx.status.external_name = Some(p.name.clone());
                Ok(CreateOutcome::Created)
            }
            Err(ExternalError::Conflict(_)) => cx.adopt_named(&at(), &p.name, "id").await,
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, cx: &mut Pass<'_>) -> ReconcileResult<()> {
        let id = cx.require_id()?;
        let Json::Object(d) = desired(&self.0) else { return Ok(()) };
        if let Some(body) = patch_body(&d, &cx.status.at_provider, COMPARED) {
            let doc = cx.client.update(&at().id(id), &body).await?;
            cx.record(&doc, "id", Some("name"));
        }
        Ok(())
    }

    async fn delete(&self, cx: &mut Pass<'_>) -> ReconcileResult<()> {
        let Some(id) = cx.external_id() else { return Ok(()) };
        cx.client.delete(&at().id(id)).await?;
        Ok(())
    }
}
