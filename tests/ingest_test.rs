//! End-to-end ingestion scenarios.
//!
//! Each test runs a full [`galleryd::App`] (coordinator, thumbnail pool,
//! broadcaster) over a tempdir root and drives it through the queue, the
//! event endpoint or the directory watcher.

mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use axum::http::StatusCode;
use common::{StaticHook, TestHarness};
use galleryd::ingest::{Discovery, IngestEvent, IngestOutcome};
use galleryd::state::MessageKind;
use galleryd_common::{DiscoverySource, Rating, ThumbnailStatus};
use serde_json::json;

#[tokio::test]
async fn watched_file_is_registered_rated_and_fetched() {
    let harness = TestHarness::with(
        |config| config.watch.enabled = true,
        vec![StaticHook::arc("prompt", "prompt", json!("a cat"))],
    )
    .await;
    // give the watcher a moment to register its inotify watches
    tokio::time::sleep(Duration::from_millis(100)).await;

    harness.write_png("img_001.png", 16, 16);
    let record = harness.wait_for_record("img_001.png", |_| true).await;
    assert_eq!(record.source, DiscoverySource::Watched);

    let (status, body) = harness
        .request("POST", "/api/rating", Some(json!({"filename": "img_001.png", "rating": 1})))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["rating"], 1);

    let (status, body) = harness.request("GET", "/api/images/img_001.png", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["filename"], "img_001.png");
    assert_eq!(body["rating"], 1);
    assert_eq!(body["metadata"], json!({"prompt": "a cat"}));

    harness.shutdown().await;
}

#[tokio::test]
async fn same_event_twice_is_accepted_then_duplicate() {
    let harness = TestHarness::new().await;
    harness.write_png("conduit/J1/a.png", 8, 8);
    let event = json!({"job_id": "J1", "outputs": [{"path": "conduit/J1/a.png"}]});

    let (status, body) = harness.post_event(event.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["job_id"], "J1");
    assert_eq!(body["results"][0]["status"], "accepted");
    assert_eq!(body["results"][0]["filename"], "conduit/J1/a.png");

    let (status, body) = harness.post_event(event).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"][0]["status"], "duplicate");

    let (_, page) = harness.request("GET", "/api/images", None).await;
    assert_eq!(page["total"], 1);
    let record = harness.record("conduit/J1/a.png").unwrap();
    assert_eq!(record.source, DiscoverySource::Event);
    assert_eq!(record.job_id.as_deref(), Some("J1"));

    let generation = harness.app.context().broadcaster.snapshot().generation;
    assert_eq!(generation.jobs_received, 2);
    assert_eq!(generation.outputs_accepted, 1);
    assert_eq!(generation.outputs_duplicate, 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn later_hook_wins_on_conflicting_keys() {
    let harness = TestHarness::with(
        |_| {},
        vec![
            StaticHook::arc("hookB", "x", json!(2)),
            StaticHook::arc("hookA", "x", json!(1)),
        ],
    )
    .await;
    harness.write_png("a.png", 8, 8);

    let (_, body) = harness
        .post_event(json!({"job_id": "J7", "outputs": [{"path": "a.png"}]}))
        .await;
    assert_eq!(body["results"][0]["status"], "accepted");
    assert_eq!(harness.record("a.png").unwrap().metadata["x"], json!(2));

    harness.shutdown().await;
}

#[tokio::test]
async fn deleted_file_stays_visible_through_grace_window() {
    let harness = TestHarness::with(|config| config.ingest.removal_grace_secs = 1, vec![]).await;
    let path = harness.write_png("a.png", 8, 8);
    let ticket = harness
        .app
        .queue()
        .submit(IngestEvent::Discovered(Discovery::watched(path.clone())))
        .await
        .unwrap();
    assert_eq!(ticket.outcome().await.unwrap(), IngestOutcome::Created);

    std::fs::remove_file(&path).unwrap();
    let ticket = harness
        .app
        .queue()
        .submit(IngestEvent::Removed { path })
        .await
        .unwrap();
    assert_eq!(ticket.outcome().await.unwrap(), IngestOutcome::PendingRemoval);

    let (_, page) = harness.request("GET", "/api/images", None).await;
    assert_eq!(page["total"], 1);
    assert!(harness.record("a.png").unwrap().missing_since.is_some());

    harness.wait_for_absence("a.png").await;
    let (_, page) = harness.request("GET", "/api/images", None).await;
    assert_eq!(page["total"], 0);
    let (status, _) = harness.request("GET", "/api/images/a.png", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    harness.shutdown().await;
}

#[tokio::test]
async fn watcher_then_event_keeps_first_source() {
    let harness = TestHarness::new().await;
    let path = harness.write_png("conduit/J2/a.png", 8, 8);

    let ticket = harness
        .app
        .queue()
        .submit(IngestEvent::Discovered(Discovery::watched(path)))
        .await
        .unwrap();
    assert_matches!(ticket.outcome().await, Ok(IngestOutcome::Created));

    let (_, body) = harness
        .post_event(json!({"job_id": "J2", "outputs": [{"path": "conduit/J2/a.png"}]}))
        .await;
    assert_eq!(body["results"][0]["status"], "duplicate");

    let record = harness.record("conduit/J2/a.png").unwrap();
    assert_eq!(record.source, DiscoverySource::Watched);
    assert_eq!(record.job_id.as_deref(), Some("J2"));

    harness.shutdown().await;
}

#[tokio::test]
async fn thumbnails_follow_content() {
    let harness = TestHarness::new().await;
    harness.write_png("a.png", 64, 32);
    harness
        .post_event(json!({"job_id": "J1", "outputs": [{"path": "a.png"}]}))
        .await;

    let (status, headers, first) = harness
        .raw_request("GET", "/api/thumbnails/a.png", None, &[])
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["content-type"], "image/jpeg");
    let first_etag = headers["etag"].clone();
    let decoded = image::load_from_memory(&first).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (32, 16));

    let (_, headers, again) = harness
        .raw_request("GET", "/api/thumbnails/a.png", None, &[])
        .await;
    assert_eq!(headers["etag"], first_etag);
    assert_eq!(again, first);
    let old = harness.record("a.png").unwrap();
    assert_eq!(old.thumbnail_status, ThumbnailStatus::Ready);

    // new content, new fingerprint, new artifact
    harness.write_png("a.png", 48, 96);
    let (_, body) = harness
        .post_event(json!({"job_id": "J2", "outputs": [{"path": "a.png"}]}))
        .await;
    assert_eq!(body["results"][0]["status"], "accepted");

    let (status, headers, second) = harness
        .raw_request("GET", "/api/thumbnails/a.png", None, &[])
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(headers["etag"], first_etag);
    let decoded = image::load_from_memory(&second).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (16, 32));

    let current = harness.record("a.png").unwrap();
    assert_ne!(current.fingerprint, old.fingerprint);
    let storage = harness.app.context().thumbnails.storage();
    assert!(!storage.artifact_path(&old.fingerprint).exists());
    assert!(storage.artifact_path(&current.fingerprint).exists());

    harness.shutdown().await;
}

#[tokio::test]
async fn subscriber_sees_versions_increase() {
    let harness = TestHarness::new().await;
    let broadcaster = harness.app.context().broadcaster.clone();
    let mut subscription = broadcaster.subscribe();

    let snapshot = subscription.rx.recv().await.unwrap();
    assert_eq!(snapshot.kind, MessageKind::State);

    harness.write_png("a.png", 8, 8);
    harness
        .post_event(json!({"job_id": "J1", "outputs": [{"path": "a.png"}]}))
        .await;
    harness
        .request("POST", "/api/rating", Some(json!({"filename": "a.png", "rating": -1})))
        .await;

    let mut last = snapshot.version;
    let mut kinds = Vec::new();
    while let Ok(message) = subscription.rx.try_recv() {
        assert!(message.version > last);
        last = message.version;
        kinds.push(message.kind);
    }
    assert!(kinds.contains(&MessageKind::RecordAdded));
    assert!(kinds.contains(&MessageKind::GenerationStatus));
    assert_eq!(kinds.last(), Some(&MessageKind::RecordUpdated));
    assert_eq!(harness.record("a.png").unwrap().rating, Rating::Dislike);

    // resync never goes backwards
    assert!(broadcaster.resync(subscription.id));
    let resync = loop {
        let message = subscription.rx.recv().await.unwrap();
        if message.kind == MessageKind::State {
            break message;
        }
    };
    assert!(resync.version >= last);

    harness.shutdown().await;
}

#[tokio::test]
async fn startup_scan_reconciles_existing_files() {
    let harness = TestHarness::with(
        |config| {
            config.ingest.scan_on_startup = true;
            let img = image::RgbImage::new(8, 8);
            img.save(config.watch.root.join("early.png")).unwrap();
        },
        vec![],
    )
    .await;

    let record = harness.wait_for_record("early.png", |_| true).await;
    assert_eq!(record.source, DiscoverySource::Watched);

    harness.shutdown().await;
}
