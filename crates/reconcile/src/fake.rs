//! In-memory stand-in for the external system, used by tests and dry runs.
//!
//! Echoes a superset of what it is sent (ids, urls, timestamps), rejects
//! duplicate names with a conflict, and accepts injected failures per
//! operation.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{json, Value as Json};
use tether_core::Kind;

use crate::compare::str_field;
use crate::external::{id_string, ConnectionParams, Connector, DevOpsClient, ExternalError, Locator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Op {
    Get,
    List,
    Create,
    Update,
    Delete,
}

type Slot = (Kind, Vec<String>, String);

#[derive(Default)]
struct FakeState {
    resources: BTreeMap<Slot, Json>,
    next_id: u64,
    failures: BTreeMap<(Op, Kind), VecDeque<ExternalError>>,
    calls: Vec<(Op, Locator)>,
    stall: Option<Duration>,
}

#[derive(Default)]
pub struct FakeDevOps {
    state: Mutex<FakeState>,
}

/// Field carrying the id in documents of `kind`.
pub fn id_field(kind: Kind) -> &'static str {
    match kind {
        Kind::PullRequest => "pullRequestId",
        _ => "id",
    }
}

fn numeric_ids(kind: Kind) -> bool { matches!(kind, Kind::Pipeline | Kind::Policy | Kind::PullRequest) }

fn slot(at: &Locator, id: &str) -> Slot { (at.kind, at.scope.to_vec(), id.to_string()) }

impl FakeDevOps {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    fn lock(&self) -> MutexGuard<'_, FakeState> { self.state.lock().unwrap_or_else(|e| e.into_inner()) }

    /// Make the next `op` on `kind` fail with `err`. Queued failures fire in order.
    pub fn fail_next(&self, op: Op, kind: Kind, err: ExternalError) {
        self.lock().failures.entry((op, kind)).or_default().push_back(err);
    }

    /// Delay every later call by `d`, like an endpoint that stops answering.
    pub fn stall(&self, d: Duration) { self.lock().stall = Some(d); }

    /// Seed a document out of band, as if someone created it directly.
    pub fn insert(&self, at: &Locator, doc: Json) -> String {
        let mut st = self.lock();
        let id = at.id.clone().unwrap_or_else(|| Self::mint(&mut st, at.kind));
        let mut doc = doc;
        if let Some(o) = doc.as_object_mut() {
            o.insert(id_field(at.kind).to_string(), Self::id_json(at.kind, &id));
        }
        st.resources.insert(slot(at, &id), doc);
        id
    }

    /// Remove a document out of band (drift).
    pub fn remove(&self, at: &Locator) -> bool {
        let Some(id) = at.id.as_deref() else { return false };
        self.lock().resources.remove(&slot(at, id)).is_some()
    }

    pub fn lookup(&self, at: &Locator) -> Option<Json> {
        let id = at.id.as_deref()?;
        self.lock().resources.get(&slot(at, id)).cloned()
    }

    pub fn all(&self, kind: Kind) -> Vec<Json> {
        self.lock().resources.iter().filter(|((k, _, _), _)| *k == kind).map(|(_, v)| v.clone()).collect()
    }

    /// Number of recorded calls of `op`, across kinds.
    pub fn count(&self, op: Op) -> usize { self.lock().calls.iter().filter(|(o, _)| *o == op).count() }

    pub fn calls(&self) -> Vec<(Op, Locator)> { self.lock().calls.clone() }

    fn mint(st: &mut FakeState, kind: Kind) -> String {
        st.next_id += 1;
        if numeric_ids(kind) {
            st.next_id.to_string()
        } else {
            format!("00000000-0000-0000-0000-{:012}", st.next_id)
        }
    }

    fn id_json(kind: Kind, id: &str) -> Json {
        match id.parse::<u64>() {
            Ok(n) if numeric_ids(kind) => json!(n),
            _ => json!(id),
        }
    }

    async fn enter(&self, op: Op, at: &Locator) -> Result<MutexGuard<'_, FakeState>, ExternalError> {
        let stall = self.lock().stall;
        if let Some(d) = stall {
            tokio::time::sleep(d).await;
        }
        let mut st = self.lock();
        st.calls.push((op, at.clone()));
        if let Some(err) = st.failures.get_mut(&(op, at.kind)).and_then(|q| q.pop_front()) {
            return Err(err);
        }
        Ok(st)
    }

    fn conflicts(st: &FakeState, at: &Locator, body: &Json) -> bool {
        let siblings = st.resources.iter().filter(|((k, s, _), _)| *k == at.kind && s.as_slice() == at.scope.as_slice());
        match at.kind {
            Kind::PullRequest => siblings.map(|(_, d)| d).any(|d| {
                str_field(d, "status") == "active"
                    && str_field(d, "sourceRefName") == str_field(body, "sourceRefName")
                    && str_field(d, "targetRefName") == str_field(body, "targetRefName")
            }),
            Kind::TeamProject | Kind::GitRepository | Kind::Pipeline | Kind::Feed => {
                let name = str_field(body, "name");
                !name.is_empty() && siblings.map(|(_, d)| d).any(|d| str_field(d, "name").eq_ignore_ascii_case(name))
            }
            _ => false,
        }
    }
}

fn merge(into: &mut Json, patch: &Json) {
    if let (Some(dst), Some(src)) = (into.as_object_mut(), patch.as_object()) {
        for (k, v) in src {
            dst.insert(k.clone(), v.clone());
        }
    }
}

#[async_trait::async_trait]
impl DevOpsClient for FakeDevOps {
    async fn get(&self, at: &Locator) -> Result<Option<Json>, ExternalError> {
        let st = self.enter(Op::Get, at).await?;
        let Some(id) = at.id.as_deref() else { return Err(ExternalError::classify(400, "get without id")) };
        Ok(st.resources.get(&slot(at, id)).cloned())
    }

    async fn list(&self, at: &Locator) -> Result<Vec<Json>, ExternalError> {
        let st = self.enter(Op::List, at).await?;
        Ok(st
            .resources
            .iter()
            .filter(|((k, s, _), _)| *k == at.kind && s.as_slice() == at.scope.as_slice())
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn create(&self, at: &Locator, body: &Json) -> Result<Json, ExternalError> {
        let mut st = self.enter(Op::Create, at).await?;
        if Self::conflicts(&st, at, body) {
            return Err(ExternalError::Conflict(format!("{} already exists", at)));
        }
        let id = match at.id.clone() {
            Some(id) => id,
            None => Self::mint(&mut st, at.kind),
        };
        let mut doc = body.clone();
        if let Some(o) = doc.as_object_mut() {
            o.insert(id_field(at.kind).to_string(), Self::id_json(at.kind, &id));
            o.insert("url".into(), json!(format!("https://fake.invalid/{}/{}", at.kind.plural(), id)));
            o.insert("createdDate".into(), json!("2024-01-01T00:00:00Z"));
            o.insert("revision".into(), json!(1));
            if at.kind == Kind::PullRequest {
                o.entry("status").or_insert_with(|| json!("active"));
            }
        }
        st.resources.insert(slot(at, &id), doc.clone());
        Ok(doc)
    }

    async fn update(&self, at: &Locator, body: &Json) -> Result<Json, ExternalError> {
        let mut st = self.enter(Op::Update, at).await?;
        let Some(id) = at.id.clone() else { return Err(ExternalError::classify(400, "update without id")) };
        let key = slot(at, &id);
        // Authorization records are upserted.
        if at.kind == Kind::PipelinePermission && !st.resources.contains_key(&key) {
            st.resources.insert(key.clone(), json!({ "id": id }));
        }
        let Some(doc) = st.resources.get_mut(&key) else { return Err(ExternalError::NotFound(at.to_string())) };
        merge(doc, body);
        if let Some(rev) = doc.get("revision").and_then(Json::as_u64) {
            doc["revision"] = json!(rev + 1);
        }
        Ok(doc.clone())
    }

    async fn delete(&self, at: &Locator) -> Result<(), ExternalError> {
        let mut st = self.enter(Op::Delete, at).await?;
        let Some(id) = at.id.as_deref() else { return Err(ExternalError::classify(400, "delete without id")) };
        match st.resources.remove(&slot(at, id)) {
            Some(_) => Ok(()),
            None => Err(ExternalError::NotFound(at.to_string())),
        }
    }
}

/// Connector handing out one shared [`FakeDevOps`]. An empty credential is
/// rejected the way a real endpoint rejects a missing token.
pub struct FakeConnector {
    pub client: Arc<FakeDevOps>,
    seen: Mutex<Vec<ConnectionParams>>,
}

impl FakeConnector {
    pub fn new(client: Arc<FakeDevOps>) -> Self { Self { client, seen: Mutex::new(Vec::new()) } }

    pub fn connections(&self) -> Vec<ConnectionParams> { self.seen.lock().unwrap_or_else(|e| e.into_inner()).clone() }
}

#[async_trait::async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, params: &ConnectionParams) -> Result<Arc<dyn DevOpsClient>, ExternalError> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).push(params.clone());
        if params.credential.0.is_empty() {
            return Err(ExternalError::Unauthorized("empty credential".into()));
        }
        Ok(self.client.clone())
    }
}

/// Id of a fake document, whichever field carries it.
pub fn doc_id(kind: Kind, doc: &Json) -> Option<String> { doc.get(id_field(kind)).and_then(id_string) }
