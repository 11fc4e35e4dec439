use std::sync::Arc;

use serde_json::json;
use tether_convert::{review, ConversionError, ConversionReview, Converter};
use tether_core::{api_version, Kind, Object, ObjectMeta, LEGACY_VERSION, STORAGE_VERSION};
use tether_resolve::ReferenceError;
use tether_store::{MemoryStore, Store};

const NS: &str = "team";

async fn provisioned(store: &MemoryStore, kind: Kind, name: &str, id: &str, external_name: &str) {
    let mut o = store.apply(Object::new(kind, ObjectMeta::named(name, Some(NS)), json!({}))).unwrap();
    o.status.external_id = Some(id.to_string());
    o.status.external_name = Some(external_name.to_string());
    store.update_status(&o).await.unwrap();
}

async fn seeded() -> (Arc<MemoryStore>, Converter) {
    let store = Arc::new(MemoryStore::new());
    provisioned(&store, Kind::TeamProject, "demo", "p-1", "Demo").await;
    provisioned(&store, Kind::GitRepository, "svc", "r-1", "svc-repo").await;
    provisioned(&store, Kind::Pipeline, "build", "42", "build").await;
    let conv = Converter::new(store.clone());
    (store, conv)
}

fn object(kind: Kind, version: &str, name: &str, spec: serde_json::Value) -> Object {
    let mut o = Object::new(kind, ObjectMeta::named(name, Some(NS)), spec);
    o.api_version = api_version(version);
    o
}

fn policy() -> serde_json::Value { json!({"create": true, "update": true, "delete": true}) }

#[tokio::test]
async fn permission_round_trips_through_storage_version() {
    let (_store, conv) = seeded().await;
    let legacy = object(
        Kind::PipelinePermission,
        LEGACY_VERSION,
        "allow-build",
        json!({
            "connectorConfigRef": {"name": "org"},
            "managementPolicy": policy(),
            "project": "Demo",
            "resource": {"type": "repository", "id": "r-1"},
            "pipelines": ["42"],
            "authorizeAll": false
        }),
    );

    let hub = conv.convert(&legacy, &api_version(STORAGE_VERSION)).await.unwrap();
    assert_eq!(hub.version(), STORAGE_VERSION);
    assert_eq!(hub.spec["project"], json!({"ref": {"name": "demo"}}));
    assert_eq!(hub.spec["resource"], json!({"kind": "GitRepository", "ref": {"name": "svc"}}));
    assert_eq!(hub.spec["pipelines"], json!([{"ref": {"name": "build"}}]));
    assert_eq!(hub.metadata, legacy.metadata);

    let back = conv.convert(&hub, &api_version(LEGACY_VERSION)).await.unwrap();
    assert_eq!(back, legacy);
}

#[tokio::test]
async fn pipeline_round_trips_from_storage_version() {
    let (_store, conv) = seeded().await;
    let hub = object(
        Kind::Pipeline,
        STORAGE_VERSION,
        "build",
        json!({
            "connectorConfigRef": {"name": "org"},
            "managementPolicy": policy(),
            "project": {"ref": {"name": "demo"}},
            "repository": {"ref": {"name": "svc"}},
            "name": "build",
            "folder": "\\ci",
            "yamlPath": "azure-pipelines.yml"
        }),
    );
    let legacy = conv.convert(&hub, &api_version(LEGACY_VERSION)).await.unwrap();
    assert_eq!(legacy.spec["project"], "Demo");
    assert_eq!(legacy.spec["repository"], json!({"name": "svc-repo"}));
    assert_eq!(legacy.spec["folder"], "\\ci");

    let again = conv.convert(&legacy, &api_version(STORAGE_VERSION)).await.unwrap();
    assert_eq!(again, hub);
}

#[tokio::test]
async fn literal_project_id_is_named_through_its_record() {
    let (_store, conv) = seeded().await;
    let hub = object(
        Kind::GitRepository,
        STORAGE_VERSION,
        "svc",
        json!({"connectorConfigRef": {"name": "org"}, "project": {"value": "p-1"}, "name": "svc-repo"}),
    );
    let legacy = conv.convert(&hub, &api_version(LEGACY_VERSION)).await.unwrap();
    assert_eq!(legacy.spec["project"], "Demo");
    assert_eq!(legacy.spec["name"], "svc-repo");
}

#[tokio::test]
async fn unresolved_target_fails_without_side_effects() {
    let (store, conv) = seeded().await;
    let before = store.snapshot();
    let legacy = object(
        Kind::Pipeline,
        LEGACY_VERSION,
        "deploy",
        json!({
            "connectorConfigRef": {"name": "org"},
            "project": "Demo",
            "repository": {"name": "missing"},
            "name": "deploy",
            "yamlPath": "deploy.yml"
        }),
    );
    let err = conv.convert(&legacy, &api_version(STORAGE_VERSION)).await.unwrap_err();
    match err {
        ConversionError::Unresolved { field, source: ReferenceError::NotFound { kind, .. } } => {
            assert_eq!(field, "repository");
            assert_eq!(kind, Kind::GitRepository);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(store.snapshot(), before);
}

#[tokio::test]
async fn unknown_resource_type_and_version_are_rejected() {
    let (_store, conv) = seeded().await;
    let legacy = object(
        Kind::PipelinePermission,
        LEGACY_VERSION,
        "allow-file",
        json!({
            "connectorConfigRef": {"name": "org"},
            "project": "Demo",
            "resource": {"type": "securefile", "id": "s-1"},
            "pipelines": []
        }),
    );
    let err = conv.convert(&legacy, &api_version(STORAGE_VERSION)).await.unwrap_err();
    assert!(matches!(err, ConversionError::UnknownKind(_)), "{err}");

    let err = conv.convert(&legacy, "devops.tether.dev/v2").await.unwrap_err();
    assert!(matches!(err, ConversionError::UnknownVersion(v) if v == "v2"));
}

#[tokio::test]
async fn same_version_and_unchanged_kinds_only_relabel() {
    let (_store, conv) = seeded().await;
    let feed = object(Kind::Feed, LEGACY_VERSION, "pkgs", json!({"connectorConfigRef": {"name": "org"}, "name": "pkgs"}));
    let up = conv.convert(&feed, &api_version(STORAGE_VERSION)).await.unwrap();
    assert_eq!(up.spec, feed.spec);
    assert_eq!(up.version(), STORAGE_VERSION);

    // Same version: the spec is not even decoded.
    let odd = object(Kind::Pipeline, LEGACY_VERSION, "x", json!({"anything": 1}));
    let same = conv.convert(&odd, &api_version(LEGACY_VERSION)).await.unwrap();
    assert_eq!(same, odd);
}

fn review_of(objects: Vec<serde_json::Value>, to: &str) -> ConversionReview {
    serde_json::from_value(json!({
        "apiVersion": "apiextensions.k8s.io/v1",
        "kind": "ConversionReview",
        "request": {"uid": "u-1", "desiredAPIVersion": api_version(to), "objects": objects}
    }))
    .unwrap()
}

#[tokio::test]
async fn review_converts_spec_and_keeps_other_fields() {
    let (_store, conv) = seeded().await;
    let raw = json!({
        "apiVersion": api_version(LEGACY_VERSION),
        "kind": "GitRepository",
        "metadata": {"name": "svc", "namespace": NS, "managedFields": [{"manager": "kubectl"}]},
        "spec": {"connectorConfigRef": {"name": "org"}, "project": "Demo", "name": "svc-repo"},
        "status": {"externalId": "r-1"}
    });
    let out = review(&conv, review_of(vec![raw.clone()], STORAGE_VERSION)).await;
    let resp = out.response.unwrap();
    assert_eq!(resp.uid, "u-1");
    assert!(resp.result.is_success(), "{:?}", resp.result);
    let converted = &resp.converted_objects[0];
    assert_eq!(converted["apiVersion"], api_version(STORAGE_VERSION));
    assert_eq!(converted["spec"]["project"], json!({"ref": {"name": "demo"}}));
    assert_eq!(converted["metadata"], raw["metadata"]);
    assert_eq!(converted["status"], raw["status"]);
}

#[tokio::test]
async fn review_failure_returns_no_objects() {
    let (_store, conv) = seeded().await;
    let good = json!({
        "apiVersion": api_version(LEGACY_VERSION),
        "kind": "GitRepository",
        "metadata": {"name": "svc", "namespace": NS},
        "spec": {"connectorConfigRef": {"name": "org"}, "project": "Demo", "name": "svc-repo"}
    });
    let bad = json!({
        "apiVersion": api_version(LEGACY_VERSION),
        "kind": "GitRepository",
        "metadata": {"name": "other", "namespace": NS},
        "spec": {"connectorConfigRef": {"name": "org"}, "project": "Nowhere", "name": "other"}
    });
    let out = review(&conv, review_of(vec![good, bad], STORAGE_VERSION)).await;
    let resp = out.response.unwrap();
    assert!(!resp.result.is_success());
    assert!(resp.converted_objects.is_empty());
    assert!(resp.result.message.unwrap().contains("project"));
}

async fn repository_in(store: &MemoryStore, name: &str, project: &str, id: &str, external_name: &str) {
    let spec = json!({"connectorConfigRef": {"name": "org"}, "project": {"ref": {"name": project}}, "name": external_name});
    let mut o = store.apply(Object::new(Kind::GitRepository, ObjectMeta::named(name, Some(NS)), spec)).unwrap();
    o.status.external_id = Some(id.to_string());
    o.status.external_name = Some(external_name.to_string());
    store.update_status(&o).await.unwrap();
}

#[tokio::test]
async fn same_repository_name_in_two_projects_picks_the_pipelines_project() {
    let store = Arc::new(MemoryStore::new());
    provisioned(&store, Kind::TeamProject, "a", "p-a", "A").await;
    provisioned(&store, Kind::TeamProject, "b", "p-b", "B").await;
    repository_in(&store, "a-infra", "a", "r-a", "infra").await;
    repository_in(&store, "b-infra", "b", "r-b", "infra").await;
    let conv = Converter::new(store.clone());

    let legacy = object(
        Kind::Pipeline,
        LEGACY_VERSION,
        "deploy",
        json!({
            "connectorConfigRef": {"name": "org"},
            "project": "B",
            "repository": {"name": "infra"},
            "name": "deploy",
            "yamlPath": "deploy.yml"
        }),
    );
    let hub = conv.convert(&legacy, &api_version(STORAGE_VERSION)).await.unwrap();
    assert_eq!(hub.spec["project"], json!({"ref": {"name": "b"}}));
    assert_eq!(hub.spec["repository"], json!({"ref": {"name": "b-infra"}}));
}

#[tokio::test]
async fn target_without_external_name_is_not_ready() {
    let (store, conv) = seeded().await;
    store.apply(Object::new(Kind::TeamProject, ObjectMeta::named("pending", Some(NS)), json!({}))).unwrap();
    let hub = object(
        Kind::GitRepository,
        STORAGE_VERSION,
        "svc",
        json!({"connectorConfigRef": {"name": "org"}, "project": {"ref": {"name": "pending"}}, "name": "svc-repo"}),
    );
    let err = conv.convert(&hub, &api_version(LEGACY_VERSION)).await.unwrap_err();
    match err {
        ConversionError::Unresolved { field, source: ReferenceError::NotReady { kind, name } } => {
            assert_eq!(field, "project");
            assert_eq!(kind, Kind::TeamProject);
            assert_eq!(name, "pending");
        }
        other => panic!("unexpected error: {other}"),
    }

    store.apply(Object::new(Kind::GitRepository, ObjectMeta::named("fresh", Some(NS)), json!({}))).unwrap();
    let permission = object(
        Kind::PipelinePermission,
        STORAGE_VERSION,
        "allow-fresh",
        json!({
            "connectorConfigRef": {"name": "org"},
            "project": {"ref": {"name": "demo"}},
            "resource": {"kind": "GitRepository", "ref": {"name": "fresh"}},
            "pipelines": [{"ref": {"name": "build"}}]
        }),
    );
    let err = conv.convert(&permission, &api_version(LEGACY_VERSION)).await.unwrap_err();
    assert!(
        matches!(&err, ConversionError::Unresolved { field, source: ReferenceError::NotReady { .. } } if field == "resource"),
        "{err}"
    );
}
