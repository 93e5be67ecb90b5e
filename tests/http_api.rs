//! HTTP surface driven through the router without binding a socket.

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use http_body_util::BodyExt;
use playbymail_back::{
    config::AppConfig,
    dao::database::DbHandle,
    routes,
    sheets::{ocr::EmbeddedTextOcr, registry::ProcessorRegistry},
    state::AppState,
    transport::TransportSet,
};
use serde_json::{Value, json};
use tower::ServiceExt;

const TOKEN: &str = "s3cret";

fn app() -> Router {
    let config = AppConfig {
        admin_token: Some(TOKEN.into()),
        ..AppConfig::default()
    };
    let state = AppState::new(
        DbHandle::open_in_memory().unwrap(),
        ProcessorRegistry::with_defaults(Arc::new(EmbeddedTextOcr)),
        TransportSet::default(),
        config,
    );
    routes::router(state)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn admin_post(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("x-admin-token", TOKEN)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn healthcheck_reports_queue_depth() {
    let response = app()
        .oneshot(Request::get("/healthcheck").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["pending_jobs"], 0);
}

#[tokio::test]
async fn admin_routes_require_the_token() {
    let app = app();
    let missing = Request::post("/admin/accounts")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({ "name": "Ann" }).to_string()))
        .unwrap();
    let response = app.clone().oneshot(missing).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(admin_post("/admin/accounts", json!({ "name": "Ann" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(body_json(response).await["name"], "Ann");
}

#[tokio::test]
async fn invalid_admin_payload_is_a_bad_request() {
    let response = app()
        .oneshot(admin_post(
            "/admin/accounts",
            json!({ "name": "Ann", "email": "not an address" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn game_setup_over_http() {
    let app = app();
    let response = app
        .clone()
        .oneshot(admin_post(
            "/admin/games",
            json!({ "name": "The Lost Town", "game_type": "adventure", "turn_duration_hours": 48 }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let game_id = body_json(response).await["id"].as_str().unwrap().to_owned();

    let response = app
        .clone()
        .oneshot(admin_post(
            &format!("/admin/games/{game_id}/instances"),
            json!({ "required_player_count": 1 }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let instance = body_json(response).await;
    assert_eq!(instance["state"], "pending");
    assert_eq!(instance["current_turn_number"], 0);
    let instance_id = instance["id"].as_str().unwrap().to_owned();

    let response = app
        .oneshot(admin_post(
            &format!("/admin/instances/{instance_id}/start"),
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn scans_are_accepted_and_queryable() {
    let app = app();
    let empty = Request::post("/scans").body(Body::empty()).unwrap();
    let response = app.clone().oneshot(empty).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let upload = Request::post("/scans?source=mailroom&file_name=page-1.txt")
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Body::from("Turn Sheet Code: A1B2C0-ZZ2000"))
        .unwrap();
    let response = app.clone().oneshot(upload).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let accepted = body_json(response).await;
    assert_eq!(accepted["submission"], 1);
    let scan_id = accepted["id"].as_str().unwrap().to_owned();

    let response = app
        .oneshot(
            Request::get(format!("/scans/{scan_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let scan = body_json(response).await;
    assert_eq!(scan["state"], "pending");
    assert_eq!(scan["origin"], "mailroom");
    assert_eq!(scan["file_name"], "page-1.txt");
}

#[tokio::test]
async fn openapi_document_lists_the_scan_routes() {
    let response = app()
        .oneshot(
            Request::get(routes::docs::OPENAPI_PATH)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let doc = body_json(response).await;
    assert!(doc["paths"]["/scans"].is_object());
    assert!(doc["paths"]["/admin/instances/{id}/start"].is_object());
}
