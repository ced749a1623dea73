//! HTTP API integration tests.
//!
//! Requests go through the router in-process against a [`TestHarness`] app
//! with an in-memory SQLite database.

mod common;

use axum::http::StatusCode;
use common::{StaticHook, TestHarness};
use galleryd_common::Fingerprint;
use galleryd::server::auth::{sign_event, SIGNATURE_HEADER};
use serde_json::json;

async fn ingest(harness: &TestHarness, job_id: &str, paths: &[&str]) {
    let outputs: Vec<_> = paths.iter().map(|p| json!({"path": p})).collect();
    let (status, body) = harness
        .post_event(json!({"job_id": job_id, "outputs": outputs}))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_check_returns_200() {
    let harness = TestHarness::new().await;
    let (status, _) = harness.request("GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    harness.shutdown().await;
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn event_without_job_id_is_400() {
    let harness = TestHarness::new().await;
    let (status, body) = harness
        .post_event(json!({"job_id": "", "outputs": [{"path": "a.png"}]}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_event_payload");
    harness.shutdown().await;
}

#[tokio::test]
async fn malformed_event_is_400() {
    let harness = TestHarness::new().await;
    let (status, body) = harness.post_event(json!({"outputs": "nope"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_event_payload");
    harness.shutdown().await;
}

#[tokio::test]
async fn escaping_output_root_is_400() {
    let harness = TestHarness::new().await;
    let (status, _) = harness
        .post_event(json!({"job_id": "J1", "output_root": "../..", "outputs": []}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    harness.shutdown().await;
}

#[tokio::test]
async fn per_output_rejections_are_200() {
    let harness = TestHarness::new().await;
    harness.write_png("conduit/J1/a.png", 8, 8);
    let (status, body) = harness
        .post_event(json!({
            "job_id": "J1",
            "output_root": "conduit/J1",
            "outputs": [{"path": "a.png"}, {"path": "../../../etc/x.png"}, {"path": "missing.png"}]
        }))
        .await;
    assert_eq!(status, StatusCode::OK);
    let results = body["results"].as_array().unwrap();
    assert_eq!(results[0]["status"], "accepted");
    assert_eq!(results[1]["status"], "rejected");
    assert_eq!(results[2]["status"], "rejected");
    assert_eq!(results[2]["reason"], "file not found");
    assert!(results[2].get("retryable").is_none());
    harness.shutdown().await;
}

#[tokio::test]
async fn signed_events_require_valid_signature() {
    let harness = TestHarness::with(
        |config| config.server.event_secret = Some("s3cret".into()),
        vec![],
    )
    .await;
    harness.write_png("a.png", 8, 8);
    let event = json!({"job_id": "J1", "outputs": [{"path": "a.png"}]});

    let (status, _, _) = harness
        .raw_request("POST", "/api/events", Some(event.clone()), &[])
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, _) = harness
        .raw_request(
            "POST",
            "/api/events",
            Some(event.clone()),
            &[(SIGNATURE_HEADER, "sha256=00")],
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let signature = sign_event("s3cret", event.to_string().as_bytes());
    let (status, _, body) = harness
        .raw_request(
            "POST",
            "/api/events",
            Some(event),
            &[(SIGNATURE_HEADER, signature.as_str())],
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["results"][0]["status"], "accepted");
    harness.shutdown().await;
}

// ---------------------------------------------------------------------------
// Queries and edits
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_image_is_404() {
    let harness = TestHarness::new().await;
    let (status, body) = harness.request("GET", "/api/images/nope.png", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");

    let (status, _) = harness
        .request("POST", "/api/rating", Some(json!({"filename": "nope.png", "rating": 1})))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = harness.request("GET", "/api/thumbnails/nope.png", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    harness.shutdown().await;
}

#[tokio::test]
async fn out_of_range_rating_is_400() {
    let harness = TestHarness::new().await;
    harness.write_png("a.png", 8, 8);
    ingest(&harness, "J1", &["a.png"]).await;

    for rating in [2, -2, 300] {
        let (status, body) = harness
            .request("POST", "/api/rating", Some(json!({"filename": "a.png", "rating": rating})))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_input");
    }
    harness.shutdown().await;
}

#[tokio::test]
async fn flag_sets_and_toggles() {
    let harness = TestHarness::new().await;
    harness.write_png("a.png", 8, 8);
    ingest(&harness, "J1", &["a.png"]).await;

    let (_, body) = harness
        .request("POST", "/api/flag", Some(json!({"filename": "a.png"})))
        .await;
    assert_eq!(body["flagged"], true);
    let (_, body) = harness
        .request("POST", "/api/flag", Some(json!({"filename": "a.png"})))
        .await;
    assert_eq!(body["flagged"], false);
    let (_, body) = harness
        .request("POST", "/api/flag", Some(json!({"filename": "a.png", "flagged": true})))
        .await;
    assert_eq!(body["flagged"], true);

    let (_, page) = harness.request("GET", "/api/images?flagged=true", None).await;
    assert_eq!(page["total"], 1);
    harness.shutdown().await;
}

#[tokio::test]
async fn listing_filters_and_pages() {
    let harness = TestHarness::with(|_| {}, vec![StaticHook::arc("prompt", "prompt", json!("a cat"))]).await;
    for name in ["a.png", "b.png", "c.png"] {
        harness.write_png(name, 8, 8);
    }
    ingest(&harness, "J1", &["a.png", "b.png"]).await;
    ingest(&harness, "J2", &["c.png"]).await;
    harness
        .request("POST", "/api/rating", Some(json!({"filename": "b.png", "rating": 1})))
        .await;

    let (_, page) = harness.request("GET", "/api/images?job_id=J1", None).await;
    assert_eq!(page["total"], 2);

    let (_, page) = harness.request("GET", "/api/images?rating=1", None).await;
    assert_eq!(page["total"], 1);
    assert_eq!(page["records"][0]["filename"], "b.png");

    let (_, page) = harness
        .request("GET", "/api/images?meta.prompt=a%20cat&sort=filename&limit=2", None)
        .await;
    assert_eq!(page["total"], 3);
    assert_eq!(page["limit"], 2);
    let names: Vec<_> = page["records"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["filename"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["a.png", "b.png"]);

    let (_, page) = harness.request("GET", "/api/images?meta.seed=", None).await;
    assert_eq!(page["total"], 0);

    let (status, _) = harness.request("GET", "/api/images?sort=random", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    harness.shutdown().await;
}

#[tokio::test]
async fn stats_and_hooks() {
    let harness = TestHarness::with(|_| {}, vec![StaticHook::arc("prompt", "prompt", json!("x"))]).await;
    harness.write_png("a.png", 8, 8);
    ingest(&harness, "J1", &["a.png"]).await;

    let (status, body) = harness.request("GET", "/api/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["registrations"]["total"], 1);
    assert_eq!(body["thumbnails"]["workers"], 2);
    assert!(body["version"].as_u64().unwrap() >= 1);

    let (status, body) = harness.request("GET", "/api/hooks", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["name"], "prompt");
    assert_eq!(body[0]["active"], true);
    harness.shutdown().await;
}

// ---------------------------------------------------------------------------
// Maintenance
// ---------------------------------------------------------------------------

#[tokio::test]
async fn thumbnail_cleanup_honours_dry_run() {
    let harness = TestHarness::new().await;
    let orphan = harness
        .app
        .context()
        .thumbnails
        .storage()
        .artifact_path(&Fingerprint::new("dead00"));
    std::fs::create_dir_all(orphan.parent().unwrap()).unwrap();
    std::fs::write(&orphan, b"jpeg").unwrap();

    let (status, body) = harness
        .request("POST", "/api/maintenance/thumbnails", Some(json!({"dry_run": true})))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["orphaned"], 1);
    assert_eq!(body["removed"], 0);
    assert_eq!(body["dry_run"], true);
    assert!(orphan.exists());

    let (status, body) = harness.request("POST", "/api/maintenance/thumbnails", None).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["removed"], 1);
    assert_eq!(body["dry_run"], false);
    assert!(!orphan.exists());
    harness.shutdown().await;
}

#[tokio::test]
async fn registration_cleanup_queues_missing_files() {
    let harness = TestHarness::with(|c| c.ingest.removal_grace_secs = 60, Vec::new()).await;
    harness.write_png("a.png", 8, 8);
    harness.write_png("b.png", 8, 8);
    ingest(&harness, "J1", &["a.png", "b.png"]).await;
    std::fs::remove_file(harness.path("b.png")).unwrap();

    let (status, body) = harness
        .request("POST", "/api/maintenance/registrations", Some(json!({"dry_run": true})))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["orphaned"], json!(["b.png"]));
    assert_eq!(body["queued"], 0);
    assert!(harness.record("b.png").unwrap().missing_since.is_none());

    let (status, body) = harness.request("POST", "/api/maintenance/registrations", None).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["queued"], 1);

    // still listed while the grace window runs
    harness.wait_for_record("b.png", |r| r.is_pending_removal()).await;
    assert!(harness.record("a.png").unwrap().missing_since.is_none());
    harness.shutdown().await;
}

#[tokio::test]
async fn malformed_cleanup_body_is_400() {
    let harness = TestHarness::new().await;
    let (status, body) = harness
        .request("POST", "/api/maintenance/registrations", Some(json!("nope")))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
    harness.shutdown().await;
}
