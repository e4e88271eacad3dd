use super::*;
use crate::db::Db;
use crate::llm::tests::{service_with, ScriptedGenerator};
use crate::orchestrator::ServiceOptions;
use crate::pregen::PregenOptions;
use axum::body::{to_bytes, Body};
use axum::http::Request;
use serde_json::Value;
use tower::ServiceExt;

async fn test_router(generator: ScriptedGenerator) -> Router {
    let service = Arc::new(ReviewService::new(
        Db::in_memory().await.unwrap(),
        Arc::new(service_with(Arc::new(generator))),
        ServiceOptions::default(),
    ));
    let pregen = Arc::new(PreGenerator::new(Arc::clone(&service), PregenOptions::default()));
    app_router(ApiState { service, pregen })
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn create(router: &Router, description: &str, intensity: &str) -> i64 {
    let (status, body) = send(
        router,
        "POST",
        "/api/notes",
        Some(json!({ "title": "Rust", "description": description, "intensity": intensity })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body["id"].as_i64().unwrap()
}

#[tokio::test]
async fn test_note_crud() {
    let router = test_router(ScriptedGenerator::always("unused")).await;
    let id = create(&router, "Lifetimes tie borrows to scopes", "moderate").await;

    let (status, body) = send(&router, "GET", &format!("/api/notes/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["description"], "Lifetimes tie borrows to scopes");
    assert_eq!(body["intensity"], "moderate");

    let (status, body) = send(
        &router,
        "PUT",
        &format!("/api/notes/{}", id),
        Some(json!({ "intensity": "intensive" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["intensity"], "intensive");

    let (_, list) = send(&router, "GET", "/api/notes?intensity=intensive", None).await;
    assert_eq!(list.as_array().unwrap().len(), 1);
    let (_, list) = send(&router, "GET", "/api/notes?intensity=chill", None).await;
    assert!(list.as_array().unwrap().is_empty());

    let (status, _) = send(&router, "DELETE", &format!("/api/notes/{}", id), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(&router, "GET", &format!("/api/notes/{}", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["message"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn test_invalid_note_is_bad_request() {
    let router = test_router(ScriptedGenerator::always("unused")).await;
    let (status, body) = send(
        &router,
        "POST",
        "/api/notes",
        Some(json!({ "description": "   ", "intensity": "chill" })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].is_string());
}

#[tokio::test]
async fn test_session_flow() {
    let router = test_router(ScriptedGenerator::new(vec![
        Ok("What does Send mean for a type?".into()),
        Ok("CORRECT\nRight, it can move across threads.".into()),
    ]))
    .await;
    let id = create(&router, "Send and Sync marker traits", "moderate").await;

    let (status, session) = send(
        &router,
        "POST",
        "/api/session/start",
        Some(json!({ "intensity": "moderate" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(session["total_notes"], 1);
    let session_id = session["session_id"].as_str().unwrap().to_string();

    let (status, question) = send(
        &router,
        "GET",
        &format!("/api/session/{}/next?note_id={}", session_id, id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(question["source"], "generated");
    assert_eq!(question["question"], "What does Send mean for a type?");

    let (status, outcome) = send(
        &router,
        "POST",
        "/api/session/submit",
        Some(json!({
            "session_id": session_id,
            "note_id": id,
            "question": question["question"],
            "model": question["model"],
            "user_response": "The value may be moved to another thread",
            "response_time": 6.0,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["evaluation"]["is_correct"], true);
    assert_eq!(outcome["scheduling_summary"]["review_count"], 1);

    let (_, stats) = send(&router, "GET", &format!("/api/notes/{}/stats", id), None).await;
    assert_eq!(stats["total"], 1);

    let (status, reviews) = send(&router, "GET", &format!("/api/session/{}/reviews", session_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reviews.as_array().unwrap().len(), 1);
    assert_eq!(reviews[0]["note_id"], id);

    // The only note now has a future review date, so nothing is due.
    let (status, priority) = send(&router, "GET", "/api/session/priority?intensity=moderate", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(priority.is_null());
}

#[tokio::test]
async fn test_next_question_requires_note_id() {
    let router = test_router(ScriptedGenerator::always("Q?")).await;
    let (status, _) = send(&router, "GET", "/api/session/abc/next", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_submit_for_unknown_note_is_not_found() {
    let router = test_router(ScriptedGenerator::always("CORRECT\nfine")).await;
    let (status, _) = send(
        &router,
        "POST",
        "/api/session/submit",
        Some(json!({
            "session_id": "s",
            "note_id": 999,
            "question": "Q?",
            "user_response": "a long enough answer",
            "response_time": 3.0,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_scheduler_config_update() {
    let router = test_router(ScriptedGenerator::always("unused")).await;

    let (status, config) = send(&router, "GET", "/api/config/scheduler", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(config["base_hours"]["moderate"], 12.0);

    let (status, config) = send(
        &router,
        "PUT",
        "/api/config/scheduler",
        Some(json!({ "base_hours": { "moderate": 6.0 }, "difficulty_multipliers": { "5": 2.0 } })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(config["base_hours"]["moderate"], 6.0);
    assert_eq!(config["difficulty_multipliers"][4], 2.0);

    let (status, _) = send(
        &router,
        "PUT",
        "/api/config/scheduler",
        Some(json!({ "base_hours": { "chill": -1.0 } })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_stats_endpoints() {
    let router = test_router(ScriptedGenerator::always("Q?")).await;
    create(&router, "Iterator adaptors are lazy", "chill").await;

    let (status, global) = send(&router, "GET", "/api/stats/global", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(global["total"], 0);
    assert_eq!(global["total_notes"], 0);

    let (status, queue) = send(&router, "GET", "/api/queue/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(queue["total_processed"], 0);

    let (status, cache) = send(&router, "GET", "/api/cache/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cache["stats"]["total"], 0);
    assert_eq!(cache["metrics"]["hits"], 0);

    let (status, ai) = send(&router, "GET", "/api/config/ai", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(ai["provider"].is_string());

    let (status, due) = send(&router, "GET", "/api/due", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(due.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_upcoming_rejects_out_of_range_lookahead() {
    let router = test_router(ScriptedGenerator::always("Q?")).await;
    let (status, _) = send(&router, "GET", "/api/session/upcoming?lookahead_hours=0", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&router, "GET", "/api/session/upcoming?lookahead_hours=9000000000000", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("lookahead_hours"));

    let (status, _) = send(&router, "GET", "/api/session/upcoming?lookahead_hours=8784", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&router, "GET", "/api/session/upcoming", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_array());
}

#[tokio::test]
async fn test_priority_note_prefers_oldest_new_note() {
    let router = test_router(ScriptedGenerator::always("Q?")).await;
    let first = create(&router, "Pattern matching is exhaustive", "intensive").await;
    create(&router, "Closures capture by reference", "intensive").await;

    let (status, note) = send(&router, "GET", "/api/session/priority?intensity=intensive", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(note["id"], first);
}

#[tokio::test]
async fn test_cache_maintenance_routes() {
    let router = test_router(ScriptedGenerator::always("What is a trait object?")).await;
    let id = create(&router, "dyn Trait uses a vtable", "chill").await;

    send(&router, "GET", &format!("/api/session/s1/next?note_id={}", id), None).await;
    let (_, question) = send(&router, "GET", &format!("/api/session/s1/next?note_id={}", id), None).await;
    assert_eq!(question["source"], "cache");

    let (_, cache) = send(&router, "GET", "/api/cache/stats", None).await;
    assert_eq!(cache["stats"]["valid"], 1);
    assert_eq!(cache["metrics"]["hits"], 1);

    let (status, cleaned) = send(&router, "POST", "/api/cache/clean", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cleaned["removed"], 0);

    let (status, _) = send(&router, "POST", "/api/cache/metrics/reset", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, cache) = send(&router, "GET", "/api/cache/stats", None).await;
    assert_eq!(cache["metrics"]["hits"], 0);
    assert_eq!(cache["stats"]["total"], 1);
}

#[tokio::test]
async fn test_pregenerate_route_reports() {
    let router = test_router(ScriptedGenerator::always("Q?")).await;
    let (status, report) = send(&router, "POST", "/api/pregenerate", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["enabled"], true);
    assert_eq!(report["summary"]["total"], 0);
}

#[tokio::test]
async fn test_schedule_preview() {
    let router = test_router(ScriptedGenerator::always("unused")).await;

    // moderate 12h x rating 3 (x1.0) x first review (x1.0)
    let (status, summary) = send(
        &router,
        "POST",
        "/api/schedule/preview",
        Some(json!({ "intensity": "moderate", "difficulty_rating": 3.0, "review_count": 0, "was_correct": true })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["interval_hours"], 12.0);
    assert_eq!(summary["intensity"], "moderate");

    let (status, body) = send(
        &router,
        "POST",
        "/api/schedule/preview",
        Some(json!({ "intensity": "weekly", "difficulty_rating": 7.0, "review_count": -1, "was_correct": true })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let message = body["message"].as_str().unwrap();
    assert!(message.contains("Invalid intensity"));
    assert!(message.contains("difficulty_rating"));
    assert!(message.contains("review_count"));
}
