//! Retention and cleanup tests.

use checkpoint_store::{
    Checkpoint, CheckpointStore, CleanupOptions, CleanupReport, ListOptions, Metadata,
    StoreConfig, StoreEvent, SubscriptionConfig, Timestamp,
};
use serde_json::json;
use std::time::Duration;
use tempfile::TempDir;

const HOUR_MS: i64 = 3_600_000;

fn test_store(dir: &TempDir) -> CheckpointStore {
    CheckpointStore::open(StoreConfig {
        path: dir.path().join("store"),
        offload_threshold: 32,
        ..Default::default()
    })
    .unwrap()
}

fn put(store: &CheckpointStore, thread: &str, namespace: &str, id: &str) {
    store
        .put(thread, namespace, None, &Checkpoint::with_id(id, json!({"id": id})), &Metadata::new())
        .unwrap();
}

fn ids(store: &CheckpointStore, thread: &str, namespace: &str) -> Vec<String> {
    store
        .list(thread, namespace, &ListOptions::default())
        .unwrap()
        .map(|s| s.unwrap().address.snapshot_id)
        .collect()
}

#[test]
fn test_cleanup_without_policy_is_noop() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    put(&store, "t", "", "1");
    put(&store, "t", "", "2");

    let report = store.cleanup(&CleanupOptions::default()).unwrap();
    assert_eq!(
        report,
        CleanupReport {
            threads_scanned: 1,
            snapshots_removed: 0,
            blobs_removed: 0,
        }
    );
    assert_eq!(ids(&store, "t", ""), vec!["2", "1"]);
}

#[test]
fn test_cleanup_by_count_per_partition() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    for id in 1..=5 {
        put(&store, "a", "", &id.to_string());
        put(&store, "b", "sub", &id.to_string());
    }

    let report = store
        .cleanup(&CleanupOptions::default().max_per_thread(2))
        .unwrap();

    assert_eq!(report.threads_scanned, 2);
    assert_eq!(report.snapshots_removed, 6);
    assert_eq!(ids(&store, "a", ""), vec!["5", "4"]);
    assert_eq!(ids(&store, "b", "sub"), vec!["5", "4"]);
    assert_eq!(store.stats().unwrap().snapshot_count, 4);
}

#[test]
fn test_cleanup_by_age() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let now = Timestamp::now().0;
    let old = (now - 2 * HOUR_MS).to_string();
    let older = (now - 3 * HOUR_MS).to_string();
    let recent = now.to_string();
    put(&store, "t", "", &older);
    put(&store, "t", "", &old);
    put(&store, "t", "", &recent);
    put(&store, "t", "", "named");

    let report = store
        .cleanup(&CleanupOptions::default().max_age(Duration::from_secs(3600)))
        .unwrap();

    assert_eq!(report.snapshots_removed, 2);
    // Ids that are not timestamps never age out.
    assert_eq!(ids(&store, "t", ""), vec!["named".to_string(), recent]);
}

#[test]
fn test_cleanup_combines_age_and_count() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let now = Timestamp::now().0;
    let stale = (now - 2 * HOUR_MS).to_string();
    let fresh: Vec<String> = (0..3).map(|i| (now - i).to_string()).collect();
    put(&store, "t", "", &stale);
    for id in &fresh {
        put(&store, "t", "", id);
    }

    let report = store
        .cleanup(
            &CleanupOptions::default()
                .max_age(Duration::from_secs(3600))
                .max_per_thread(2),
        )
        .unwrap();

    assert_eq!(report.snapshots_removed, 2);
    assert_eq!(ids(&store, "t", ""), vec![fresh[0].clone(), fresh[1].clone()]);
}

#[test]
fn test_cleanup_scoped_to_one_thread() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    for id in 1..=3 {
        put(&store, "target", "", &id.to_string());
        put(&store, "target", "child", &id.to_string());
        put(&store, "target-other", "", &id.to_string());
    }

    let report = store
        .cleanup(&CleanupOptions::default().max_per_thread(1).thread("target"))
        .unwrap();

    assert_eq!(report.threads_scanned, 2);
    assert_eq!(report.snapshots_removed, 4);
    assert_eq!(ids(&store, "target", ""), vec!["3"]);
    assert_eq!(ids(&store, "target", "child"), vec!["3"]);
    assert_eq!(ids(&store, "target-other", ""), vec!["3", "2", "1"]);
}

#[test]
fn test_cleanup_removes_writes_and_blobs() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    store
        .put(
            "t",
            "",
            None,
            &Checkpoint::with_id("1", json!("an offloaded checkpoint payload")),
            &Metadata::new(),
        )
        .unwrap();
    store
        .put_writes("t", "", "1", "task", &[("out", json!("a write value long enough to be offloaded"))])
        .unwrap();
    put(&store, "t", "", "2");
    assert_eq!(store.stats().unwrap().blob_count, 2);

    let report = store
        .cleanup(&CleanupOptions::default().max_per_thread(1))
        .unwrap();

    assert_eq!(report.snapshots_removed, 1);
    assert_eq!(report.blobs_removed, 2);
    assert_eq!(store.stats().unwrap().blob_count, 0);
    assert!(store.get("t", "", Some("1")).unwrap().is_none());
}

#[test]
fn test_cleanup_persists_across_reopen() {
    let dir = TempDir::new().unwrap();

    {
        let store = test_store(&dir);
        for id in 1..=4 {
            put(&store, "t", "", &id.to_string());
        }
        store
            .cleanup(&CleanupOptions::default().max_per_thread(2))
            .unwrap();
    }

    let store = test_store(&dir);
    assert_eq!(ids(&store, "t", ""), vec!["4", "3"]);
    assert_eq!(store.stats().unwrap().snapshot_count, 2);
}

#[test]
fn test_cleanup_emits_event() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let handle = store.subscribe(SubscriptionConfig::default());
    put(&store, "t", "", "1");
    put(&store, "t", "", "2");

    store
        .cleanup(&CleanupOptions::default().max_per_thread(1))
        .unwrap();

    let events = handle.drain();
    assert!(matches!(
        events.last(),
        Some(StoreEvent::CleanupCompleted { snapshots_removed: 1, .. })
    ));
}

#[test]
fn test_cleanup_with_unbounded_age_keeps_everything() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let now = Timestamp::now().0;
    let stamps: Vec<String> = (0..3).map(|i| (now - i * HOUR_MS).to_string()).collect();
    for id in &stamps {
        put(&store, "t", "", id);
    }

    let report = store
        .cleanup(&CleanupOptions::default().max_age(Duration::from_secs(u64::MAX)))
        .unwrap();

    assert_eq!(report.snapshots_removed, 0);
    assert_eq!(ids(&store, "t", ""), stamps);
}
