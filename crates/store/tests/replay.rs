#![forbid(unsafe_code)]

use std::time::Duration;

use tether_core::{Condition, Kind, Object, ObjectMeta, Selector, StoreError};
use tether_store::{write_status, Delta, DeltaKind, MemoryStore, Store};
use tokio::sync::mpsc;

fn obj(kind: Kind, name: &str, ns: &str) -> Object {
    Object::new(kind, ObjectMeta::named(name, Some(ns)), serde_json::json!({ "name": name }))
}

#[tokio::test]
async fn status_writes_are_conditional_on_resource_version() {
    let store = MemoryStore::new();
    let stored = store.apply(obj(Kind::TeamProject, "p", "ns")).unwrap();

    let mut a = stored.clone();
    a.status.external_id = Some("id-1".into());
    let after = store.update_status(&a).await.unwrap();
    assert_ne!(after.metadata.resource_version, stored.metadata.resource_version);

    // Second writer still holds the old version.
    let mut b = stored.clone();
    b.status.external_id = Some("id-2".into());
    match store.update_status(&b).await {
        Err(StoreError::Conflict(_)) => {}
        other => panic!("expected conflict, got {:?}", other.map(|o| o.status)),
    }
    let cur = store.get(Kind::TeamProject, "p", Some("ns")).await.unwrap().unwrap();
    assert_eq!(cur.status.external_id.as_deref(), Some("id-1"));
}

#[tokio::test]
async fn write_status_retries_on_conflict_with_fresh_read() {
    let store = MemoryStore::new();
    let stored = store.apply(obj(Kind::Feed, "f", "ns")).unwrap();
    // Spec edit bumps the version behind our back.
    let mut edited = stored.clone();
    edited.spec = serde_json::json!({ "name": "f2" });
    store.apply(edited).unwrap();

    let mut status = stored.status.clone();
    status.set_condition(Condition::available());
    let written = write_status(&store, &stored, &status, 3).await.unwrap();
    assert!(written.is_ready());
    assert_eq!(written.spec["name"], "f2");
}

#[tokio::test]
async fn apply_keeps_status_and_bumps_generation_on_spec_change() {
    let store = MemoryStore::new();
    let s = store.apply(obj(Kind::Policy, "x", "ns")).unwrap();
    let mut with_status = s.clone();
    with_status.status.external_id = Some("42".into());
    store.update_status(&with_status).await.unwrap();

    let same = store.apply(obj(Kind::Policy, "x", "ns")).unwrap();
    assert_eq!(same.metadata.generation, Some(1));
    assert_eq!(same.status.external_id.as_deref(), Some("42"));

    let mut changed = obj(Kind::Policy, "x", "ns");
    changed.spec = serde_json::json!({ "name": "y" });
    let changed = store.apply(changed).unwrap();
    assert_eq!(changed.metadata.generation, Some(2));
}

#[tokio::test]
async fn delete_with_finalizer_marks_then_removes() {
    let store = MemoryStore::new();
    let mut o = obj(Kind::GitRepository, "r", "ns");
    o.metadata.finalizers.push(tether_core::FINALIZER.to_string());
    store.apply(o).unwrap();

    store.delete(Kind::GitRepository, "r", Some("ns")).unwrap();
    let marked = store.get(Kind::GitRepository, "r", Some("ns")).await.unwrap().unwrap();
    assert!(marked.metadata.is_deleting());

    let mut cleared = marked.clone();
    cleared.metadata.finalizers.clear();
    store.update_finalizers(&cleared).await.unwrap();
    assert!(store.get(Kind::GitRepository, "r", Some("ns")).await.unwrap().is_none());
}

#[tokio::test]
async fn list_filters_by_namespace_and_labels() {
    let store = MemoryStore::new();
    let mut a = obj(Kind::TeamProject, "a", "ns1");
    a.metadata.labels.insert("team".into(), "blue".into());
    store.apply(a).unwrap();
    store.apply(obj(Kind::TeamProject, "b", "ns1")).unwrap();
    store.apply(obj(Kind::TeamProject, "c", "ns2")).unwrap();
    store.apply(obj(Kind::Feed, "d", "ns1")).unwrap();

    assert_eq!(store.list(Kind::TeamProject, None, None).await.unwrap().len(), 3);
    assert_eq!(store.list(Kind::TeamProject, Some("ns1"), None).await.unwrap().len(), 2);
    let mut sel = Selector::default();
    sel.match_labels.insert("team".into(), "blue".into());
    let hits = store.list(Kind::TeamProject, None, Some(&sel)).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].metadata.name, "a");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watch_replays_existing_then_streams_changes_for_one_kind() {
    let store = std::sync::Arc::new(MemoryStore::new());
    store.apply(obj(Kind::TeamProject, "pre", "ns")).unwrap();
    store.apply(obj(Kind::Feed, "other", "ns")).unwrap();

    let (tx, mut rx) = mpsc::channel::<Delta>(16);
    let s = store.clone();
    let task = tokio::spawn(async move { s.watch(Kind::TeamProject, None, tx).await });

    let first = rx.recv().await.unwrap();
    assert_eq!(first.key.name, "pre");
    assert_eq!(first.kind, DeltaKind::Applied);

    tokio::time::sleep(Duration::from_millis(10)).await;
    store.apply(obj(Kind::Feed, "ignored", "ns")).unwrap();
    store.apply(obj(Kind::TeamProject, "new", "ns")).unwrap();
    store.delete(Kind::TeamProject, "pre", Some("ns")).unwrap();

    let next = rx.recv().await.unwrap();
    assert_eq!((next.key.name.as_str(), next.kind), ("new", DeltaKind::Applied));
    let gone = rx.recv().await.unwrap();
    assert_eq!((gone.key.name.as_str(), gone.kind), ("pre", DeltaKind::Deleted));

    drop(rx);
    store.apply(obj(Kind::TeamProject, "wake", "ns")).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn status_writes_do_not_wake_watchers() {
    let store = std::sync::Arc::new(MemoryStore::new());
    let mut a = store.apply(obj(Kind::TeamProject, "a", "ns")).unwrap();

    let (tx, mut rx) = mpsc::channel::<Delta>(16);
    let s = store.clone();
    let task = tokio::spawn(async move { s.watch(Kind::TeamProject, None, tx).await });
    assert_eq!(rx.recv().await.unwrap().key.name, "a");

    tokio::time::sleep(Duration::from_millis(10)).await;
    a.status.external_id = Some("p-1".into());
    store.update_status(&a).await.unwrap();
    store.apply(obj(Kind::TeamProject, "b", "ns")).unwrap();
    assert_eq!(rx.recv().await.unwrap().key.name, "b");

    drop(rx);
    store.apply(obj(Kind::TeamProject, "wake", "ns")).unwrap();
    task.await.unwrap().unwrap();
}
