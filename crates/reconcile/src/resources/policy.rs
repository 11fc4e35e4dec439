use serde_json::{json, Map, Value as Json};
use tether_core::kinds::{MatchKind, PolicyParams};
use tether_core::{ExternalObservation, Kind};
use tether_resolve::extract;

use super::{CreateOutcome, ExternalResource, Pass};
use crate::compare::{covers, same_set, str_field};
use crate::error::ReconcileResult;
use crate::external::{ExternalError, Locator};

/// Top-level policy fields compared against the service.
pub const POLICY_COMPARED_FIELDS: &[&str] = &["isEnabled", "isBlocking", "type", "scope"];

/// Settings keys compared against the service. The service rewrites or adds
/// other settings on its own, so only these count as drift.
pub const POLICY_COMPARED_SETTINGS: &[&str] =
    &["minimumApproverCount", "creatorVoteCounts", "allowDownvotes", "resetOnSourcePush"];

pub struct Policy(pub PolicyParams);

type ScopeKey = (String, String, String);

fn scope_keys(v: &Json) -> Vec<ScopeKey> {
    v.pointer("/settings/scope")
        .and_then(Json::as_array)
        .map(|a| {
            a.iter()
                .map(|s| {
                    (
                        str_field(s, "repositoryId").to_string(),
                        str_field(s, "refName").to_string(),
                        str_field(s, "matchKind").to_ascii_lowercase(),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Compare `desired` with `observed` on the allow-listed fields only.
pub fn policy_up_to_date(desired: &Json, observed: &Json) -> bool {
    let fields_match = POLICY_COMPARED_FIELDS.iter().all(|f| match *f {
        "type" => desired.pointer("/type/id") == observed.pointer("/type/id"),
        "scope" => same_set(&scope_keys(desired), &scope_keys(observed)),
        f => desired.get(f) == observed.get(f),
    });
    let settings_match = POLICY_COMPARED_SETTINGS.iter().all(|k| match desired.pointer(&format!("/settings/{}", k)) {
        Some(d) => observed.pointer(&format!("/settings/{}", k)).map(|o| covers(d, o)).unwrap_or(false),
        None => true,
    });
    fields_match && settings_match
}

fn match_kind_str(m: MatchKind) -> &'static str {
    match m {
        MatchKind::Exact => "exact",
        MatchKind::Prefix => "prefix",
    }
}

impl Policy {
    /// Build the configuration document, resolving repository references in scopes.
    async fn configuration(&self, cx: &mut Pass<'_>) -> ReconcileResult<(Locator, Json)> {
        let p = &self.0;
        let project = cx.bind("project", Kind::TeamProject, &p.project, extract::external_id).await?;
        let mut scope = Vec::with_capacity(p.scope.len());
        for (i, s) in p.scope.iter().enumerate() {
            let mut entry = Map::new();
            if let Some(link) = &s.repository {
                let repo = cx.bind(&format!("scope[{}].repository", i), Kind::GitRepository, link, extract::external_id).await?;
                entry.insert("repositoryId".into(), json!(repo));
            }
            if let Some(r) = &s.ref_name {
                entry.insert("refName".into(), json!(r));
            }
            entry.insert("matchKind".into(), json!(match_kind_str(s.match_kind)));
            scope.push(Json::Object(entry));
        }
        let mut settings = p.settings.clone();
        settings.insert("scope".into(), Json::Array(scope));
        let doc = json!({
            "isEnabled": p.is_enabled,
            "isBlocking": p.is_blocking,
            "type": { "id": p.type_id },
            "settings": settings,
        });
        Ok((Locator::new(Kind::Policy).under(project), doc))
    }
}

/// Policies have no natural name: an existing configuration with the same
/// type and scope stands for ours.
async fn find_matching(cx: &Pass<'_>, at: &Locator, desired: &Json) -> Result<Option<Json>, ExternalError> {
    let type_id = desired.pointer("/type/id");
    let scope = scope_keys(desired);
    Ok(cx
        .client
        .list(&at.collection())
        .await?
        .into_iter()
        .find(|d| d.pointer("/type/id") == type_id && same_set(&scope_keys(d), &scope)))
}

#[async_trait::async_trait]
impl ExternalResource for Policy {
    async fn observe(&self, cx: &mut Pass<'_>) -> ReconcileResult<ExternalObservation> {
        let (at, desired) = self.configuration(cx).await?;
        let doc = match cx.external_id() {
            Some(id) => cx.client.get(&at.id(id)).await?,
            None => find_matching(cx, &at, &desired).await?,
        };
        let Some(doc) = doc else { return Ok(ExternalObservation::missing()) };
        cx.record(&doc, "id", None);
        Ok(ExternalObservation::found(policy_up_to_date(&desired, &doc)))
    }

    async fn create(&self, cx: &mut Pass<'_>) -> ReconcileResult<CreateOutcome> {
        let (at, desired) = self.configuration(cx).await?;
        match cx.client.create(&at, &desired).await {
            Ok(doc) => {
                cx.record(&doc, "id", None);
                Ok(CreateOutcome::Created)
            }
            Err(ExternalError::Conflict(_)) => match find_matching(cx, &at, &desired).await? {
                Some(doc) => {
                    cx.record(&doc, "id", None);
                    Ok(CreateOutcome::Adopted)
                }
                None => Ok(CreateOutcome::Pending),
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, cx: &mut Pass<'_>) -> ReconcileResult<()> {
        let (at, desired) = self.configuration(cx).await?;
        let id = cx.require_id()?;
        let doc = cx.client.update(&at.id(id), &desired).await?;
        cx.record(&doc, "id", None);
        Ok(())
    }

    async fn delete(&self, cx: &mut Pass<'_>) -> ReconcileResult<()> {
        let Some(id) = cx.external_id() else { return Ok(()) };
        let (at, _) = self.configuration(cx).await?;
        cx.client.delete(&at.id(id)).await?;
        Ok(())
    }
}
