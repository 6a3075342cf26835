
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use click_fraud_service::api::{build_router, AppState};
use serde_json::{json, Value};
use tower::ServiceExt;
use test_utils::setup_service;

fn app() -> Router {
    build_router(AppState::new(setup_service(), None), Duration::from_secs(5))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(body) => Body::from(body.to_string()),
            None => Body::empty(),
        })
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn register(app: &Router) -> (String, String) {
    let (status, website) = send(
        app,
        "POST",
        "/api/websites",
        Some(json!({"name": "Shop", "url": "Shop.Example.com/"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(website["url"], "https://shop.example.com");
    (
        website["id"].as_str().unwrap().to_string(),
        website["snippetId"].as_str().unwrap().to_string(),
    )
}

#[tokio::test]
async fn track_click_round_trip() {
    let app = app();
    let (website_id, snippet_id) = register(&app).await;

    let (status, body) = send(
        &app,
        "POST",
        "/track-click",
        Some(json!({
            "snippetId": snippet_id,
            "ip": "8.8.8.8",
            "userAgent": "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) Safari/604.1",
            "referrer": "https://ads.example.net",
            "geo": {"country": "US"}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["decision"], "allow");
    assert_eq!(body["recorded"], true);

    let (status, view) = send(&app, "GET", &format!("/api/analytics/{}", website_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["rollup"]["totalClicks"], 1);
    assert_eq!(view["rollup"]["fraudulentClicks"], 0);
    assert!(view["warning"].is_null());

    let (_, overview) = send(&app, "GET", "/api/overview", None).await;
    assert_eq!(overview["websites"], 1);
    assert_eq!(overview["totalClicks"], 1);
}

#[tokio::test]
async fn unknown_snippet_is_404() {
    let app = app();
    let (status, body) = send(
        &app,
        "POST",
        "/track-click",
        Some(json!({"snippetId": "missing", "ip": "8.8.8.8", "userAgent": "curl/8.0"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn blacklisted_ip_is_blocked_and_removable() {
    let app = app();
    let (website_id, snippet_id) = register(&app).await;

    let (status, entry) = send(
        &app,
        "POST",
        &format!("/api/ip-management/{}", website_id),
        Some(json!({"ip": "9.9.9.0/24", "note": "scraper farm", "type": "blacklist"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let entry_id = entry["id"].as_str().unwrap().to_string();

    let (_, body) = send(
        &app,
        "POST",
        "/track-click",
        Some(json!({"snippetId": snippet_id, "ip": "9.9.9.9", "userAgent": "curl/8.0"})),
    )
    .await;
    assert_eq!(body["decision"], "block");
    assert_eq!(body["reason"]["kind"], "manualExclusion");

    let (status, lookup) = send(&app, "GET", &format!("/api/blocklist/{}/9.9.9.9", website_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(lookup["blocked"], true);
    assert_eq!(lookup["status"], "excluded");
    assert_eq!(lookup["pattern"], "9.9.9.0/24");

    let (status, _) = send(
        &app,
        "DELETE",
        &format!("/api/ip-management/{}/{}", website_id, entry_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(
        &app,
        "POST",
        "/track-click",
        Some(json!({"snippetId": snippet_id, "ip": "9.9.9.9", "userAgent": "curl/8.0"})),
    )
    .await;
    assert_eq!(body["decision"], "allow");
}

#[tokio::test]
async fn invalid_configuration_is_rejected() {
    let app = app();
    let (website_id, _) = register(&app).await;

    let (status, body) = send(
        &app,
        "POST",
        &format!("/api/ip-management/{}", website_id),
        Some(json!({"ip": "300.1.1.1", "type": "whitelist"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "bad_request");

    let rules: Vec<Value> = (0..6)
        .map(|i| json!({"id": format!("r{}", i), "maxCount": 5, "windowDuration": {"value": 1, "unit": "days"}}))
        .collect();
    let (status, _) = send(
        &app,
        "POST",
        &format!("/api/protection-rules/{}", website_id),
        Some(json!({"rules": rules, "blockPeriodDays": 7, "refreshRate": 100})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        "POST",
        &format!("/api/protection-rules/{}", website_id),
        Some(json!({"rules": [], "blockPeriodDays": 91, "refreshRate": 100})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, stored) = send(&app, "GET", &format!("/api/protection-rules/{}", website_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stored["blockPeriodDays"], 7);
    assert_eq!(stored["rules"].as_array().map(Vec::len), Some(0));
}

#[tokio::test]
async fn protection_rules_replace_whole_tenant() {
    let app = app();
    let (website_id, _) = register(&app).await;

    let (status, stored) = send(
        &app,
        "POST",
        &format!("/api/protection-rules/{}", website_id),
        Some(json!({
            "rules": [{"id": "burst", "maxCount": 3, "windowDuration": {"value": 10, "unit": "minutes"}}],
            "blockPeriodDays": 14,
            "refreshRate": 50,
            "whitelist": ["10.0.0.*"],
            "manualExclusion": ["192.0.2.0/24"]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stored["blockPeriodDays"], 14);
    assert_eq!(stored["whitelist"][0]["ip"], "10.0.0.*");

    let (_, lists) = send(&app, "GET", &format!("/api/ip-management/{}", website_id), None).await;
    assert_eq!(lists["manualExclusion"][0]["ip"], "192.0.2.0/24");
    assert_eq!(lists["refreshRate"], 50);
}

#[tokio::test]
async fn unblock_unknown_entry_is_404() {
    let app = app();
    let (website_id, _) = register(&app).await;

    let (status, _) = send(&app, "DELETE", &format!("/api/blocklist/{}/8.8.8.8", website_id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, "DELETE", &format!("/api/blocklist/{}/not-an-ip", website_id), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn diagnostics_ends_with_overall_summary() {
    let app = app();
    register(&app).await;

    let (status, report) = send(&app, "GET", "/api/diagnostics", None).await;
    assert_eq!(status, StatusCode::OK);
    let results = report["results"].as_array().unwrap();
    assert_eq!(results.last().unwrap()["category"], "Overall Summary");
    assert_eq!(report["summary"]["error"], 0);

    let (status, repairs) = send(&app, "POST", "/api/diagnostics/repair-urls", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(repairs.as_array().map(Vec::len), Some(0));
}

#[tokio::test]
async fn health_reports_store() {
    let app = app();
    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["store"], "up");

    let (status, _) = send(&app, "GET", "/metrics", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
