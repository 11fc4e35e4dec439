use serde_json::{json, Map, Value as Json};
use tether_core::kinds::{PullRequestParams, PullRequestStatus};
use tether_core::{ExternalObservation, Kind};
use tether_resolve::extract;
use tracing::info;

use super::{CreateOutcome, ExternalResource, Pass};
use crate::compare::{changed_keys, patch_body, str_field};
use crate::error::ReconcileResult;
use crate::external::{ExternalError, Locator};

const COMPARED: &[&str] = &["title", "description", "status"];
const ID: &str = "pullRequestId";

pub struct PullRequest(pub PullRequestParams);

/// Branch names may be given short (`main`) or fully qualified.
pub fn normalize_ref(branch: &str) -> String {
    if branch.starts_with("refs/") {
        branch.to_string()
    } else {
        format!("refs/heads/{}", branch)
    }
}

fn status_str(s: PullRequestStatus) -> &'static str {
    match s {
        PullRequestStatus::Active => "active",
        PullRequestStatus::Abandoned => "abandoned",
        PullRequestStatus::Completed => "completed",
    }
}

fn desired(p: &PullRequestParams) -> Map<String, Json> {
    let mut d = Map::new();
    d.insert("title".into(), json!(p.title));
    d.insert("description".into(), json!(p.description));
    d.insert("status".into(), json!(status_str(p.status)));
    d
}

pub fn pull_request_up_to_date(p: &PullRequestParams, observed: &Json) -> bool {
    changed_keys(&desired(p), observed, COMPARED).is_empty()
}

impl PullRequest {
    async fn at(&self, cx: &mut Pass<'_>) -> ReconcileResult<Locator> {
        let project = cx.bind("project", Kind::TeamProject, &self.0.project, extract::external_id).await?;
        let repository = cx.bind("repository", Kind::GitRepository, &self.0.repository, extract::external_id).await?;
        Ok(Locator::new(Kind::PullRequest).under(project).under(repository))
    }

    /// The active pull request between our two branches, if any.
    async fn find_open(&self, cx: &Pass<'_>, at: &Locator) -> Result<Option<Json>, ExternalError> {
        let (source, target) = (normalize_ref(&self.0.source_branch), normalize_ref(&self.0.target_branch));
        Ok(cx.client.list(at).await?.into_iter().find(|d| {
            str_field(d, "status") == "active" && str_field(d, "sourceRefName") == source && str_field(d, "targetRefName") == target
        }))
    }
}

#[async_trait::async_trait]
impl ExternalResource for PullRequest {
    async fn observe(&self, cx: &mut Pass<'_>) -> ReconcileResult<ExternalObservation> {
        let at = self.at(cx).await?;
        let doc = match cx.external_id() {
            Some(id) => cx.client.get(&at.clone().id(id)).await?,
            None => self.find_open(cx, &at).await?,
        };
        let Some(doc) = doc else { return Ok(ExternalObservation::missing()) };
        cx.record(&doc, ID, None);
        Ok(ExternalObservation::found(pull_request_up_to_date(&self.0, &doc)))
    }

    async fn create(&self, cx: &mut Pass<'_>) -> ReconcileResult<CreateOutcome> {
        let at = self.at(cx).await?;
        let body = json!({
            "sourceRefName": normalize_ref(&self.0.source_branch),
            "targetRefName": normalize_ref(&self.0.target_branch),
            "title": self.0.title,
            "description": self.0.description,
        });
        match cx.client.create(&at, &body).await {
            Ok(doc) => {
                cx.record(&doc, ID, None);
                Ok(CreateOutcome::Created)
            }
            Err(ExternalError::Conflict(_)) => match self.find_open(cx, &at).await? {
                Some(doc) => {
                    cx.record(&doc, ID, None);
                    Ok(CreateOutcome::Adopted)
                }
                None => Ok(CreateOutcome::Pending),
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Abandoning or completing goes through here as a status change.
    async fn update(&self, cx: &mut Pass<'_>) -> ReconcileResult<()> {
        let at = self.at(cx).await?;
        let id = cx.require_id()?;
        if let Some(body) = patch_body(&desired(&self.0), &cx.status.at_provider, COMPARED) {
            let doc = cx.client.update(&at.id(id), &body).await?;
            cx.record(&doc, ID, None);
        }
        Ok(())
    }

    async fn delete(&self, cx: &mut Pass<'_>) -> ReconcileResult<()> {
        info!(id = ?cx.external_id(), "pull requests cannot be deleted; leaving it in place");
        Ok(())
    }
}
