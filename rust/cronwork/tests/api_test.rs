//! HTTP surface: routing, envelopes and error mapping.

mod common;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use common::runtime;

fn app() -> Router {
    cronwork::api::app(runtime().service)
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(body) => {
            request = request.header("content-type", "application/json");
            Body::from(body.to_string())
        }
        None => Body::empty(),
    };

    let response = app
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn test_health() {
    let app = app();
    let (status, body) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_task_crud_round_trip() {
    let app = app();

    let (status, created) = send(
        &app,
        Method::POST,
        "/tasks",
        Some(json!({
            "name": "backup",
            "cron": "0 3 * * *",
            "command": "echo backup",
            "envs": { "TARGET": "s3" }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["meta"], Value::Null);
    let id = created["data"]["id"].as_i64().unwrap();
    assert_eq!(created["data"]["enabled"], true);
    assert_eq!(created["data"]["envs"]["TARGET"], "s3");

    let (status, fetched) = send(&app, Method::GET, &format!("/tasks/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["data"]["name"], "backup");

    let (status, patched) = send(
        &app,
        Method::PATCH,
        &format!("/tasks/{id}"),
        Some(json!({ "cron": "0 4 * * *", "enabled": false })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(patched["data"]["cron"], "0 4 * * *");
    assert_eq!(patched["data"]["enabled"], false);

    let (status, metrics) = send(&app, Method::GET, &format!("/tasks/{id}/metrics"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(metrics["data"]["totalRuns"], 0);
    assert_eq!(metrics["data"]["failedRuns"], 0);

    let (status, executions) =
        send(&app, Method::GET, &format!("/tasks/{id}/executions?page=1&limit=5"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(executions["data"], json!([]));
    assert_eq!(executions["meta"], json!({ "total": 0, "page": 1, "limit": 5 }));

    let (status, deleted) = send(&app, Method::DELETE, &format!("/tasks/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deleted["data"]["id"], id);

    let (status, missing) = send(&app, Method::GET, &format!("/tasks/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(missing["data"], Value::Null);
    assert_eq!(missing["meta"]["code"], "TASK_NOT_FOUND");
    assert_eq!(missing["meta"]["message"], "task not found.");
}

#[tokio::test]
async fn test_list_reports_next_cursor() {
    let app = app();
    for name in ["a", "b", "c"] {
        let (status, _) = send(
            &app,
            Method::POST,
            "/tasks",
            Some(json!({ "name": name, "cron": "0 * * * *", "command": "true" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, page) = send(&app, Method::GET, "/tasks?limit=2", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["data"].as_array().unwrap().len(), 2);
    let cursor = page["meta"]["nextCursor"].as_i64().unwrap();

    let (_, rest) = send(&app, Method::GET, &format!("/tasks?limit=2&cursor={cursor}"), None).await;
    assert_eq!(rest["data"].as_array().unwrap().len(), 1);
    assert_eq!(rest["meta"], Value::Null);
}

#[tokio::test]
async fn test_validation_errors_are_bad_requests() {
    let app = app();

    let (status, body) = send(
        &app,
        Method::POST,
        "/tasks",
        Some(json!({ "name": "x", "cron": "every day", "command": "true" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["meta"]["code"], "VALIDATION_ERROR");
    assert_eq!(body["meta"]["message"], "invalid cron expression");

    let (status, body) = send(&app, Method::POST, "/tasks", Some(json!({ "name": "x" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["meta"]["code"], "VALIDATION_ERROR");

    let (status, body) = send(&app, Method::GET, "/tasks/abc", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["meta"]["code"], "VALIDATION_ERROR");

    let (status, _) = send(&app, Method::GET, "/tasks?limit=500", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, Method::GET, "/tasks/0", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
