use serde::Deserialize;
use serde_json::{json, Value as Json};
use tether_core::kinds::{FeedParams, UpstreamSource};
use tether_core::{ExternalObservation, Kind};
use tether_resolve::extract;

use super::{CreateOutcome, ExternalResource, Pass};
use crate::compare::same_set;
use crate::error::ReconcileResult;
use crate::external::{ExternalError, Locator};

pub struct Feed(pub FeedParams);

/// The part of a feed document we compare. Everything else the service
/// returns is ignored on decode.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ObservedFeed {
    name: String,
    description: Option<String>,
    upstream_enabled: bool,
    upstream_sources: Vec<ObservedUpstream>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ObservedUpstream {
    name: String,
    protocol: String,
    location: String,
}

type UpstreamKey = (String, String, String);

fn key(name: &str, protocol: &str, location: &str) -> UpstreamKey {
    (name.to_string(), protocol.to_ascii_lowercase(), location.trim_end_matches('/').to_string())
}

pub fn feed_up_to_date(p: &FeedParams, observed: &Json) -> bool {
    let Ok(o) = ObservedFeed::deserialize(observed) else { return false };
    let want: Vec<UpstreamKey> = p.upstream_sources.iter().map(|u| key(&u.name, &u.protocol, &u.location)).collect();
    let have: Vec<UpstreamKey> = o.upstream_sources.iter().map(|u| key(&u.name, &u.protocol, &u.location)).collect();
    o.name == p.name
        && o.description.unwrap_or_default() == p.description
        && o.upstream_enabled == p.upstream_enabled
        && same_set(&want, &have)
}

fn upstream_json(u: &UpstreamSource) -> Json {
    json!({
        "name": u.name,
        "protocol": u.protocol,
        "location": u.location,
        "upstreamSourceType": u.upstream_source_type,
    })
}

fn body(p: &FeedParams) -> Json {
    json!({
        "name": p.name,
        "description": p.description,
        "upstreamEnabled": p.upstream_enabled,
        "upstreamSources": p.upstream_sources.iter().map(upstream_json).collect::<Vec<_>>(),
    })
}

impl Feed {
    /// Feeds are organization scoped unless a project is given.
    async fn at(&self, cx: &mut Pass<'_>) -> ReconcileResult<Locator> {
        let at = Locator::new(Kind::Feed);
        Ok(match &self.0.project {
            Some(link) => at.under(cx.bind("project", Kind::TeamProject, link, extract::external_id).await?),
            None => at,
        })
    }
}

#[async_trait::async_trait]
impl ExternalResource for Feed {
    async fn observe(&self, cx: &mut Pass<'_>) -> ReconcileResult<ExternalObservation> {
        let at = self.at(cx).await?;
        let Some(doc) = cx.find(&at, &self.0.name).await? else { return Ok(ExternalObservation::missing()) };
        cx.record(&doc, "id", Some("name"));
        Ok(ExternalObservation::found(feed_up_to_date(&self.0, &doc)))
    }

    async fn create(&self, cx: &mut Pass<'_>) -> ReconcileResult<CreateOutcome> {
        let at = self.at(cx).await?;
        match cx.client.create(&at, &body(&self.0)).await {
            Ok(doc) => {
                cx.record(&doc, "id", Some("name"));
                Ok(CreateOutcome::Created)
            }
            Err(ExternalError::Conflict(_)) => cx.adopt_named(&at, &self.0.name, "id").await,
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, cx: &mut Pass<'_>) -> ReconcileResult<()> {
        let at = self.at(cx).await?;
        let id = cx.require_id()?;
        let doc = cx.client.update(&at.id(id), &body(&self.0)).await?;
        cx.record(&doc, "id", Some("name"));
        Ok(())
    }

    async fn delete(&self, cx: &mut Pass<'_>) -> ReconcileResult<()> {
        let Some(id) = cx.external_id() else { return Ok(()) };
        let at = self.at(cx).await?;
        cx.client.delete(&at.id(id)).await?;
        Ok(())
    }
}
