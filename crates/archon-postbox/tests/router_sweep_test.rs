//! Integration tests for the router sweep semantics.

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;

use archon_postbox::{
    ArchiveBucket, ArchiveStore, Envelope, MessageType, PostboxStore, Router, RouterConfig,
};

// ===========================================================================
// Helpers
// ===========================================================================

struct RouterHarness {
    _dir: tempfile::TempDir,
    store: PostboxStore,
    archive: ArchiveStore,
    router: Router,
}

impl RouterHarness {
    fn new() -> Self {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let store = PostboxStore::open(dir.path().join("postbox")).expect("postbox");
        let archive = ArchiveStore::open(dir.path().join("archive")).expect("archive");
        let config = RouterConfig::new(dir.path().join("routing_log.jsonl"));
        let router = Router::new(store.clone(), archive.clone(), config);
        Self {
            _dir: dir,
            store,
            archive,
            router,
        }
    }
}

fn status_message(task_id: &str, sender: &str, recipient: &str) -> Envelope {
    Envelope::new(
        MessageType::TaskStatus,
        sender,
        recipient,
        task_id,
        json!({"progress": 0.5}),
    )
    .with_trace_id(format!("trace-{task_id}"))
}

// ===========================================================================
// Tests
// ===========================================================================

#[test]
fn sweep_delivers_in_outbox_order() {
    let h = RouterHarness::new();
    for i in 0..3 {
        h.store
            .enqueue_outbox("CA", &status_message(&format!("T{i}"), "CA", "CC"))
            .unwrap();
    }

    let report = h.router.sweep().unwrap();
    assert_eq!(report.delivered, 3);
    assert_eq!(report.invalid, 0);

    let inbox = h.store.drain_inbox("CC").unwrap();
    let ids: Vec<&str> = inbox.iter().map(|e| e.task_id.as_str()).collect();
    assert_eq!(ids, vec!["T0", "T1", "T2"]);

    // Outbox is empty and everything is archived.
    assert!(h.store.drain_outbox("CA").unwrap().is_empty());
    assert_eq!(h.archive.count(ArchiveBucket::Archive).unwrap(), 3);
}

#[test]
fn undecodable_message_goes_to_invalid() {
    let h = RouterHarness::new();
    h.store.ensure_agent("CA").unwrap();
    let outbox = h.store.root().join("CA").join("outbox");
    std::fs::write(outbox.join("00000000_garbage.json"), "{ not json").unwrap();

    let report = h.router.sweep().unwrap();
    assert_eq!(report.invalid, 1);
    assert_eq!(h.archive.count(ArchiveBucket::Invalid).unwrap(), 1);
    assert_eq!(h.router.invalid_message_count(), 1);
    assert!(h.store.outbox_files("CA").unwrap().is_empty());
}

#[test]
fn schema_invalid_message_goes_to_invalid() {
    let h = RouterHarness::new();
    // task_assignment from a non-ARCH sender fails validation.
    let bad = Envelope::new(
        MessageType::TaskAssignment,
        "CA",
        "CC",
        "T1",
        json!({"action": "noop"}),
    );
    h.store.enqueue_outbox("CA", &bad).unwrap();

    let report = h.router.sweep().unwrap();
    assert_eq!(report.invalid, 1);
    assert_eq!(h.archive.count(ArchiveBucket::Invalid).unwrap(), 1);
}

#[test]
fn expired_message_goes_to_expired() {
    let h = RouterHarness::new();
    let mut env = status_message("T1", "CA", "CC");
    env.timestamp = Utc::now() - ChronoDuration::seconds(120);
    env.max_age_seconds = Some(60);
    h.store.enqueue_outbox("CA", &env).unwrap();

    let report = h.router.sweep().unwrap();
    assert_eq!(report.expired, 1);
    assert_eq!(h.archive.count(ArchiveBucket::Expired).unwrap(), 1);
    assert!(h.store.drain_inbox("CC").unwrap().is_empty());
}

#[test]
fn retry_exhausted_message_goes_to_dead() {
    let h = RouterHarness::new();
    let env = status_message("T1", "CA", "CC").with_retry_count(10);
    h.store.enqueue_outbox("CA", &env).unwrap();

    let report = h.router.sweep().unwrap();
    assert_eq!(report.dead, 1);
    assert_eq!(h.archive.count(ArchiveBucket::Dead).unwrap(), 1);
    assert!(h.store.drain_inbox("CC").unwrap().is_empty());
}

#[test]
fn unknown_recipient_goes_to_invalid() {
    let h = RouterHarness::new();
    let env = status_message("T1", "CA", "SYSTEM_MONITOR");
    h.store.enqueue_outbox("CA", &env).unwrap();

    let report = h.router.sweep().unwrap();
    assert_eq!(report.invalid, 1);
    assert_eq!(h.archive.count(ArchiveBucket::Invalid).unwrap(), 1);
}

#[test]
fn sweep_is_idempotent() {
    let h = RouterHarness::new();
    h.store
        .enqueue_outbox("CA", &status_message("T1", "CA", "CC"))
        .unwrap();

    let first = h.router.sweep().unwrap();
    assert_eq!(first.delivered, 1);

    // Nothing left to do: the second sweep observes the same final state.
    let second = h.router.sweep().unwrap();
    assert_eq!(second.scanned, 0);
    assert_eq!(second.delivered, 0);

    let inbox = h.store.drain_inbox("CC").unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(h.archive.count(ArchiveBucket::Archive).unwrap(), 1);
}

#[test]
fn routing_log_records_outcomes() {
    let h = RouterHarness::new();
    h.store
        .enqueue_outbox("CA", &status_message("T1", "CA", "CC"))
        .unwrap();
    h.store
        .enqueue_outbox("CA", &status_message("T2", "CA", "NOBODY_42"))
        .unwrap();
    h.router.sweep().unwrap();

    let log = std::fs::read_to_string(h._dir.path().join("routing_log.jsonl")).unwrap();
    let entries: Vec<serde_json::Value> = log
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(entries.len(), 2);
    let outcomes: Vec<&str> = entries
        .iter()
        .map(|e| e["outcome"].as_str().unwrap())
        .collect();
    assert!(outcomes.contains(&"delivered"));
    assert!(outcomes.contains(&"invalid"));
}
