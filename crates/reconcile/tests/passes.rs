#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value as Json};
use tether_core::prelude::*;
use tether_core::{ControllerConfig, FINALIZER};
use tether_reconcile::fake::{FakeConnector, FakeDevOps, Op};
use tether_queue::Disposition;
use tether_reconcile::{
    process, Controller, CreateOutcome, DevOpsClient, ExternalError, Locator, Managed, Outcome, Pass, ReconcileError, Reconciler,
};
use tether_resolve::{ReferenceError, Resolver};
use tether_store::{MemoryStore, Store};
use tokio_util::sync::CancellationToken;

const NS: &str = "team";

#[derive(Default)]
struct Recorded(Mutex<Vec<(String, Event)>>);

#[async_trait::async_trait]
impl EventSink for Recorded {
    async fn publish(&self, on: &Object, event: Event) { self.0.lock().unwrap().push((on.metadata.name.clone(), event)); }
}

impl Recorded {
    fn reasons(&self) -> Vec<String> { self.0.lock().unwrap().iter().map(|(_, e)| e.reason.clone()).collect() }
}

struct Env {
    store: Arc<MemoryStore>,
    fake: Arc<FakeDevOps>,
    events: Arc<Recorded>,
    rec: Reconciler,
}

fn env_with(secret: bool, config: ControllerConfig) -> Env {
    let store = Arc::new(MemoryStore::new());
    if secret {
        store.put_secret("pat", Some(NS), "token", b"t0ken");
    }
    let cfg = Object::new(
        Kind::ConnectorConfig,
        ObjectMeta::named("org", Some(NS)),
        json!({
            "organizationUrl": "https://dev.example.com/acme",
            "credentials": {"secretRef": {"name": "pat", "key": "token"}}
        }),
    );
    store.apply(cfg).unwrap();
    let fake = FakeDevOps::new();
    let events = Arc::new(Recorded::default());
    let rec = Reconciler::new(store.clone(), store.clone(), Arc::new(FakeConnector::new(fake.clone())), events.clone(), config);
    Env { store, fake, events, rec }
}

fn env() -> Env { env_with(true, ControllerConfig::default()) }

fn managed(kind: Kind, name: &str, mut params: Json) -> Object {
    params["connectorConfigRef"] = json!({"name": "org"});
    Object::new(kind, ObjectMeta::named(name, Some(NS)), params)
}

fn key(kind: Kind, name: &str) -> ItemKey { ItemKey::new(kind, name, Some(NS)) }

impl Env {
    async fn get(&self, kind: Kind, name: &str) -> Object { self.store.get(kind, name, Some(NS)).await.unwrap().unwrap() }

    /// A record some other controller already provisioned.
    async fn provisioned(&self, kind: Kind, name: &str, id: &str) {
        let mut o = self.store.apply(managed(kind, name, json!({"name": name}))).unwrap();
        o.status.external_id = Some(id.to_string());
        self.store.update_status(&o).await.unwrap();
    }

    fn pass<'a>(&'a self, client: &'a FakeDevOps, resolver: &'a Resolver, status: ResourceStatus) -> Pass<'a> {
        Pass::new(client, resolver, Some(NS), status)
    }
}

fn repo(project: &str) -> Object {
    managed(Kind::GitRepository, "svc", json!({"project": {"ref": {"name": project}}, "name": "svc"}))
}

#[tokio::test]
async fn create_records_id_then_settles_to_idle() {
    let e = env();
    e.store.apply(managed(Kind::TeamProject, "demo", json!({"name": "Demo", "description": "d"}))).unwrap();
    let k = key(Kind::TeamProject, "demo");

    assert_eq!(e.rec.reconcile(&k).await.unwrap(), Outcome::Created);
    let obj = e.get(Kind::TeamProject, "demo").await;
    assert!(obj.metadata.has_finalizer(FINALIZER));
    let id = obj.status.external_id.clone().expect("id persisted after create");

    assert_eq!(e.rec.reconcile(&k).await.unwrap(), Outcome::Idle);
    let obj = e.get(Kind::TeamProject, "demo").await;
    assert!(obj.is_ready());
    assert_eq!(obj.status.external_id.as_deref(), Some(id.as_str()));
    assert_eq!(e.fake.count(Op::Create), 1);
    assert!(e.events.reasons().contains(&"Created".to_string()));
}

#[tokio::test]
async fn observe_reports_drift_when_recorded_id_is_gone() {
    let e = env();
    e.provisioned(Kind::TeamProject, "demo", "p-1").await;
    let mut obj = repo("demo");
    obj.status.external_id = Some("r-404".into());

    let resolver = Resolver::new(e.store.clone());
    let mut cx = e.pass(&e.fake, &resolver, obj.status.clone());
    let decoded = Managed::decode(&obj).unwrap();
    let obs = decoded.resource.handler().observe(&mut cx).await.unwrap();
    assert!(!obs.resource_exists);
    assert!(!obs.resource_up_to_date);
}

#[tokio::test]
async fn drift_is_surfaced_and_recreated() {
    let e = env();
    e.store.apply(managed(Kind::TeamProject, "demo", json!({"name": "Demo"}))).unwrap();
    let k = key(Kind::TeamProject, "demo");
    e.rec.reconcile(&k).await.unwrap();
    let id = e.get(Kind::TeamProject, "demo").await.status.external_id.unwrap();

    assert!(e.fake.remove(&Locator::new(Kind::TeamProject).id(&id)));
    assert_eq!(e.rec.reconcile(&k).await.unwrap(), Outcome::Created);
    assert!(e.events.reasons().contains(&"ExternalResourceMissing".to_string()));
    let again = e.get(Kind::TeamProject, "demo").await.status.external_id.unwrap();
    assert_ne!(again, id);
}

#[tokio::test]
async fn create_conflict_adopts_existing_resource() {
    let e = env();
    e.provisioned(Kind::TeamProject, "demo", "p-1").await;
    let seeded = e.fake.insert(&Locator::new(Kind::GitRepository).under("p-1"), json!({"name": "svc"}));
    let obj = repo("demo");

    let resolver = Resolver::new(e.store.clone());
    let mut cx = e.pass(&e.fake, &resolver, obj.status.clone());
    let decoded = Managed::decode(&obj).unwrap();
    let h = decoded.resource.handler();
    assert_eq!(h.create(&mut cx).await.unwrap(), CreateOutcome::Adopted);
    assert_eq!(cx.status.external_id.as_deref(), Some(seeded.as_str()));

    let obs = h.observe(&mut cx).await.unwrap();
    assert!(obs.resource_exists && obs.resource_up_to_date);
}

#[tokio::test]
async fn unseen_conflict_defers_to_next_observe() {
    let e = env();
    e.provisioned(Kind::TeamProject, "demo", "p-1").await;
    e.store.apply(repo("demo")).unwrap();
    let k = key(Kind::GitRepository, "svc");

    e.fake.fail_next(Op::Create, Kind::GitRepository, ExternalError::Conflict("already exists".into()));
    assert_eq!(e.rec.reconcile(&k).await.unwrap(), Outcome::Pending);
    assert!(e.get(Kind::GitRepository, "svc").await.status.external_id.is_none());

    let seeded = e.fake.insert(&Locator::new(Kind::GitRepository).under("p-1"), json!({"name": "svc"}));
    assert_eq!(e.rec.reconcile(&k).await.unwrap(), Outcome::Idle);
    assert_eq!(e.get(Kind::GitRepository, "svc").await.status.external_id, Some(seeded));
}

#[tokio::test]
async fn unprovisioned_reference_is_transient_and_visible() {
    let e = env();
    e.store.apply(managed(Kind::TeamProject, "demo", json!({"name": "Demo"}))).unwrap();
    e.store.apply(repo("demo")).unwrap();

    let err = e.rec.reconcile(&key(Kind::GitRepository, "svc")).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Reference(ReferenceError::NotReady { .. })));
    assert!(err.is_transient());

    let obj = e.get(Kind::GitRepository, "svc").await;
    let ready = obj.status.condition(ConditionType::Ready).unwrap();
    assert_eq!(ready.status, ConditionStatus::False);
    assert_eq!(ready.reason, "ReferenceNotReady");
    assert_eq!(e.fake.count(Op::Create), 0);
    assert!(!obj.metadata.has_finalizer(FINALIZER));
}

#[tokio::test]
async fn bound_reference_survives_spec_repoint() {
    let e = env();
    e.provisioned(Kind::TeamProject, "demo", "p-1").await;
    e.provisioned(Kind::TeamProject, "other", "p-2").await;
    e.store.apply(repo("demo")).unwrap();
    let k = key(Kind::GitRepository, "svc");
    assert_eq!(e.rec.reconcile(&k).await.unwrap(), Outcome::Created);

    e.store.apply(repo("other")).unwrap();
    assert_eq!(e.rec.reconcile(&k).await.unwrap(), Outcome::Idle);
    let obj = e.get(Kind::GitRepository, "svc").await;
    assert_eq!(obj.status.bound_references["project"].name, "demo");
    assert_eq!(obj.status.bound_references["project"].value, "p-1");
    assert!(e.events.reasons().contains(&"ReferenceImmutable".to_string()));
    assert_eq!(e.fake.count(Op::Create), 1);
}

#[tokio::test]
async fn update_sends_only_changed_fields() {
    let e = env();
    e.store.apply(managed(Kind::TeamProject, "demo", json!({"name": "Demo", "description": "old"}))).unwrap();
    let k = key(Kind::TeamProject, "demo");
    e.rec.reconcile(&k).await.unwrap();

    e.store.apply(managed(Kind::TeamProject, "demo", json!({"name": "Demo", "description": "new"}))).unwrap();
    assert_eq!(e.rec.reconcile(&k).await.unwrap(), Outcome::Updated);
    let id = e.get(Kind::TeamProject, "demo").await.status.external_id.unwrap();
    let doc = e.fake.lookup(&Locator::new(Kind::TeamProject).id(&id)).unwrap();
    assert_eq!(doc["description"], "new");
    assert_eq!(e.fake.count(Op::Update), 1);
    assert_eq!(e.rec.reconcile(&k).await.unwrap(), Outcome::Idle);
}

#[tokio::test]
async fn management_policy_short_circuits_create() {
    let e = env();
    e.store
        .apply(managed(Kind::TeamProject, "demo", json!({"name": "Demo", "managementPolicy": {"create": false}})))
        .unwrap();
    assert_eq!(e.rec.reconcile(&key(Kind::TeamProject, "demo")).await.unwrap(), Outcome::Skipped);
    let obj = e.get(Kind::TeamProject, "demo").await;
    assert_eq!(obj.status.condition(ConditionType::Ready).unwrap().reason, "CreationDisallowed");
    assert_eq!(e.fake.count(Op::Create), 0);
    assert!(!obj.metadata.has_finalizer(FINALIZER));
}

#[tokio::test]
async fn missing_credential_is_a_connect_error() {
    let e = env_with(false, ControllerConfig::default());
    e.store.apply(managed(Kind::TeamProject, "demo", json!({"name": "Demo"}))).unwrap();
    let err = e.rec.reconcile(&key(Kind::TeamProject, "demo")).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Connect(_)));
    let obj = e.get(Kind::TeamProject, "demo").await;
    assert_eq!(obj.status.condition(ConditionType::Ready).unwrap().reason, "ConnectFailed");
}

#[tokio::test]
async fn deletion_removes_external_resource_then_record() {
    let e = env();
    e.provisioned(Kind::TeamProject, "demo", "p-1").await;
    e.store.apply(repo("demo")).unwrap();
    let k = key(Kind::GitRepository, "svc");
    e.rec.reconcile(&k).await.unwrap();
    assert_eq!(e.fake.all(Kind::GitRepository).len(), 1);

    e.store.delete(Kind::GitRepository, "svc", Some(NS)).unwrap();
    assert_eq!(e.rec.reconcile(&k).await.unwrap(), Outcome::Deleted);
    assert!(e.fake.all(Kind::GitRepository).is_empty());
    assert!(e.store.get(Kind::GitRepository, "svc", Some(NS)).await.unwrap().is_none());
    assert_eq!(e.rec.reconcile(&k).await.unwrap(), Outcome::Gone);
}

#[tokio::test]
async fn deletion_policy_and_pull_requests_leave_external_state() {
    let e = env();
    e.provisioned(Kind::TeamProject, "demo", "p-1").await;
    e.provisioned(Kind::GitRepository, "svc", "r-1").await;
    e.store
        .apply(managed(
            Kind::PullRequest,
            "pr",
            json!({
                "project": {"ref": {"name": "demo"}},
                "repository": {"ref": {"name": "svc"}},
                "sourceBranch": "feature/x",
                "targetBranch": "main",
                "title": "Add x"
            }),
        ))
        .unwrap();
    e.store
        .apply(managed(Kind::Feed, "pkgs", json!({"name": "pkgs", "managementPolicy": {"delete": false}})))
        .unwrap();
    for (kind, name) in [(Kind::PullRequest, "pr"), (Kind::Feed, "pkgs")] {
        assert_eq!(e.rec.reconcile(&key(kind, name)).await.unwrap(), Outcome::Created);
        e.store.delete(kind, name, Some(NS)).unwrap();
        assert_eq!(e.rec.reconcile(&key(kind, name)).await.unwrap(), Outcome::Deleted);
    }
    assert_eq!(e.fake.all(Kind::PullRequest).len(), 1);
    assert_eq!(e.fake.all(Kind::Feed).len(), 1);
    assert_eq!(e.fake.count(Op::Delete), 0);
}

#[tokio::test]
async fn revoked_permission_is_granted_again() {
    let e = env();
    e.provisioned(Kind::TeamProject, "demo", "p-1").await;
    e.provisioned(Kind::GitRepository, "svc", "r-1").await;
    e.provisioned(Kind::Pipeline, "ci", "7").await;
    e.store
        .apply(managed(
            Kind::PipelinePermission,
            "svc-ci",
            json!({
                "project": {"ref": {"name": "demo"}},
                "resource": {"kind": "GitRepository", "ref": {"name": "svc"}},
                "pipelines": [{"ref": {"name": "ci"}}]
            }),
        ))
        .unwrap();
    let k = key(Kind::PipelinePermission, "svc-ci");
    assert_eq!(e.rec.reconcile(&k).await.unwrap(), Outcome::Created);
    assert_eq!(e.rec.reconcile(&k).await.unwrap(), Outcome::Idle);
    assert_eq!(e.get(Kind::PipelinePermission, "svc-ci").await.status.external_id.as_deref(), Some("repository/r-1"));

    let at = Locator::new(Kind::PipelinePermission).under("p-1").id("repository/r-1");
    e.fake.update(&at, &json!({"pipelines": [{"id": 7, "authorized": false}]})).await.unwrap();
    assert_eq!(e.rec.reconcile(&k).await.unwrap(), Outcome::Created);
    assert_eq!(e.fake.count(Op::Create), 2);
    assert!(e.events.reasons().contains(&"ExternalResourceMissing".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn controller_converges_dependent_records() {
    let config = ControllerConfig {
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(200),
        poll_interval: Duration::from_secs(1),
        pass_timeout: Duration::from_secs(5),
        workers: 2,
        ..ControllerConfig::default()
    };
    let e = env_with(true, config);
    let rec = Arc::new(e.rec);
    let shutdown = CancellationToken::new();
    let run = tokio::spawn(
        Controller::new(rec.clone()).run(vec![Kind::TeamProject, Kind::GitRepository], shutdown.clone()),
    );

    e.store.apply(repo("demo")).unwrap();
    e.store.apply(managed(Kind::TeamProject, "demo", json!({"name": "Demo"}))).unwrap();

    let mut converged = false;
    for _ in 0..100 {
        let r = e.store.get(Kind::GitRepository, "svc", Some(NS)).await.unwrap().unwrap();
        if r.is_ready() && r.status.external_id.is_some() {
            converged = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    shutdown.cancel();
    run.await.unwrap().unwrap();
    assert!(converged, "repository never became ready");
    assert_eq!(e.fake.all(Kind::GitRepository).len(), 1);
}

fn policy_spec() -> Json {
    json!({
        "project": {"ref": {"name": "demo"}},
        "typeId": "fa4e907d",
        "isBlocking": true,
        "scope": [{"repository": {"ref": {"name": "svc"}}, "refName": "refs/heads/main"}],
        "settings": {"minimumApproverCount": 2}
    })
}

fn served_policy() -> Json {
    json!({
        "isEnabled": true,
        "isBlocking": true,
        "type": {"id": "fa4e907d", "displayName": "Minimum number of reviewers"},
        "settings": {
            "minimumApproverCount": 2,
            "creatorVoteCounts": false,
            "scope": [{"repositoryId": "r-1", "refName": "refs/heads/main", "matchKind": "Exact"}]
        }
    })
}

#[tokio::test]
async fn policy_conflict_waits_then_adopts_without_second_create() {
    let e = env();
    e.provisioned(Kind::TeamProject, "demo", "p-1").await;
    e.provisioned(Kind::GitRepository, "svc", "r-1").await;
    e.store.apply(managed(Kind::Policy, "reviewers", policy_spec())).unwrap();
    let k = key(Kind::Policy, "reviewers");

    e.fake.fail_next(Op::Create, Kind::Policy, ExternalError::Conflict("policy already exists".into()));
    assert_eq!(e.rec.reconcile(&k).await.unwrap(), Outcome::Pending);
    assert!(e.get(Kind::Policy, "reviewers").await.status.external_id.is_none());

    let seeded = e.fake.insert(&Locator::new(Kind::Policy).under("p-1"), served_policy());
    assert_eq!(e.rec.reconcile(&k).await.unwrap(), Outcome::Idle);
    let obj = e.get(Kind::Policy, "reviewers").await;
    assert_eq!(obj.status.external_id, Some(seeded));
    assert!(obj.is_ready());
    assert_eq!(e.fake.count(Op::Create), 1);
    assert_eq!(e.fake.all(Kind::Policy).len(), 1);
}

#[tokio::test]
async fn policy_create_conflict_adopts_matching_configuration() {
    let e = env();
    e.provisioned(Kind::TeamProject, "demo", "p-1").await;
    e.provisioned(Kind::GitRepository, "svc", "r-1").await;
    let other = json!({"isEnabled": true, "type": {"id": "0609b952"}, "settings": {"scope": []}});
    e.fake.insert(&Locator::new(Kind::Policy).under("p-1"), other);
    let seeded = e.fake.insert(&Locator::new(Kind::Policy).under("p-1"), served_policy());
    let obj = managed(Kind::Policy, "reviewers", policy_spec());

    let resolver = Resolver::new(e.store.clone());
    let mut cx = e.pass(&e.fake, &resolver, obj.status.clone());
    let decoded = Managed::decode(&obj).unwrap();
    e.fake.fail_next(Op::Create, Kind::Policy, ExternalError::Conflict("policy already exists".into()));
    assert_eq!(decoded.resource.handler().create(&mut cx).await.unwrap(), CreateOutcome::Adopted);
    assert_eq!(cx.status.external_id.as_deref(), Some(seeded.as_str()));
}

#[tokio::test]
async fn pipeline_is_created_observed_and_replaced() {
    let e = env();
    e.provisioned(Kind::TeamProject, "demo", "p-1").await;
    e.provisioned(Kind::GitRepository, "svc", "r-1").await;
    let spec = |yaml: &str| {
        json!({
            "project": {"ref": {"name": "demo"}},
            "repository": {"ref": {"name": "svc"}},
            "name": "ci",
            "yamlPath": yaml
        })
    };
    e.store.apply(managed(Kind::Pipeline, "ci", spec("azure-pipelines.yml"))).unwrap();
    let k = key(Kind::Pipeline, "ci");

    e.fake.fail_next(Op::Create, Kind::Pipeline, ExternalError::Conflict("definition exists".into()));
    assert_eq!(e.rec.reconcile(&k).await.unwrap(), Outcome::Pending);
    let seeded = e.fake.insert(
        &Locator::new(Kind::Pipeline).under("p-1"),
        json!({
            "name": "ci", "path": "\\", "revision": 1,
            "process": {"type": 2, "yamlFilename": "azure-pipelines.yml"},
            "repository": {"id": "r-1", "type": "TfsGit"}
        }),
    );
    assert_eq!(e.rec.reconcile(&k).await.unwrap(), Outcome::Idle);
    assert_eq!(e.get(Kind::Pipeline, "ci").await.status.external_id, Some(seeded.clone()));

    e.store.apply(managed(Kind::Pipeline, "ci", spec("ci/build.yml"))).unwrap();
    assert_eq!(e.rec.reconcile(&k).await.unwrap(), Outcome::Updated);
    let doc = e.fake.lookup(&Locator::new(Kind::Pipeline).under("p-1").id(&seeded)).unwrap();
    assert_eq!(doc["process"]["yamlFilename"], "ci/build.yml");
    assert_eq!(doc["revision"], 2);
    assert_eq!(e.rec.reconcile(&k).await.unwrap(), Outcome::Idle);
    assert_eq!(e.fake.count(Op::Create), 1);
}

#[tokio::test]
async fn update_gate_leaves_drift_visible() {
    let e = env();
    e.store.apply(managed(Kind::TeamProject, "demo", json!({"name": "Demo", "description": "old"}))).unwrap();
    let k = key(Kind::TeamProject, "demo");
    e.rec.reconcile(&k).await.unwrap();
    assert_eq!(e.rec.reconcile(&k).await.unwrap(), Outcome::Idle);

    e.store
        .apply(managed(
            Kind::TeamProject,
            "demo",
            json!({"name": "Demo", "description": "new", "managementPolicy": {"update": false}}),
        ))
        .unwrap();
    assert_eq!(e.rec.reconcile(&k).await.unwrap(), Outcome::Skipped);
    let obj = e.get(Kind::TeamProject, "demo").await;
    let synced = obj.status.condition(ConditionType::Synced).unwrap();
    assert_eq!(synced.status, ConditionStatus::False);
    assert_eq!(synced.reason, "UpdateDisallowed");
    assert_eq!(e.fake.count(Op::Update), 0);
}

#[tokio::test]
async fn undecodable_record_without_external_id_is_released() {
    let e = env();
    let mut broken = managed(Kind::Feed, "broken", json!({"name": 3}));
    broken.metadata.finalizers.push(FINALIZER.to_string());
    e.store.apply(broken).unwrap();
    e.store.delete(Kind::Feed, "broken", Some(NS)).unwrap();

    assert_eq!(e.rec.reconcile(&key(Kind::Feed, "broken")).await.unwrap(), Outcome::Deleted);
    assert!(e.store.get(Kind::Feed, "broken", Some(NS)).await.unwrap().is_none());
}

#[tokio::test]
async fn stale_project_id_is_dropped_before_create() {
    let e = env();
    let mut obj = managed(Kind::TeamProject, "demo", json!({"name": "Demo"}));
    obj.status.external_id = Some("p-stale".into());

    let resolver = Resolver::new(e.store.clone());
    let mut cx = e.pass(&e.fake, &resolver, obj.status.clone());
    let decoded = Managed::decode(&obj).unwrap();
    e.fake.fail_next(Op::Create, Kind::TeamProject, ExternalError::Conflict("project exists".into()));
    assert_eq!(decoded.resource.handler().create(&mut cx).await.unwrap(), CreateOutcome::Pending);
    assert_eq!(cx.status.external_id, None);
}

#[tokio::test]
async fn abandoned_pass_surfaces_timeout_condition() {
    let config = ControllerConfig { pass_timeout: Duration::from_millis(50), ..ControllerConfig::default() };
    let e = env_with(true, config);
    e.store.apply(managed(Kind::TeamProject, "demo", json!({"name": "Demo"}))).unwrap();
    e.fake.stall(Duration::from_millis(500));

    assert_eq!(process(&e.rec, key(Kind::TeamProject, "demo")).await, Disposition::RateLimited);
    let obj = e.get(Kind::TeamProject, "demo").await;
    let ready = obj.status.condition(ConditionType::Ready).unwrap();
    assert_eq!(ready.status, ConditionStatus::False);
    assert_eq!(ready.reason, "Timeout");
    assert_eq!(e.fake.count(Op::Create), 0);
}
