//! Integration tests for the HTTP API over the local transport.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use base64::Engine as _;
use farm_core::{Config, Transport};
use farmd::channel::{Channel, LocalChannel};
use farmd::server::{create_router, AppState};
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

fn create_test_app(auth_token: Option<&str>) -> (axum::Router, TempDir) {
    create_test_app_with(auth_token, |_| {})
}

fn create_test_app_with(
    auth_token: Option<&str>,
    adjust: impl FnOnce(&mut Config),
) -> (axum::Router, TempDir) {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.transport = Transport::Local;
    config.jobs_root = dir.path().join("jobs").to_string_lossy().into_owned();
    config.tool_bin = "/opt/flow/bin/flow".to_string();
    adjust(&mut config);
    let channel = Arc::new(Channel::Local(LocalChannel::new(config.max_output_bytes)));
    let state = Arc::new(AppState::new(
        channel,
        config,
        auth_token.map(str::to_string),
    ));
    (create_router(state), dir)
}

async fn body_to_json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(body).unwrap()))
        .unwrap()
}

fn status_uri(job_dir: &str) -> String {
    format!("/jobs/status?job_dir={}", urlencode(job_dir))
}

fn urlencode(value: &str) -> String {
    value
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                (b as char).to_string()
            }
            _ => format!("%{b:02X}"),
        })
        .collect()
}

#[tokio::test]
async fn health_reports_channel() {
    let (app, _dir) = create_test_app(Some("secret"));
    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["channel"], "local");
}

#[tokio::test]
async fn start_then_poll_until_completed() {
    let (app, _dir) = create_test_app(None);

    let response = app
        .clone()
        .oneshot(post(
            "/jobs",
            &serde_json::json!({
                "command": "echo 'Area: 512'; echo 'Flow completed successfully'",
                "info": {"tool": "flow", "design": "alu"}
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let handle = body_to_json(response).await;
    let job_dir = handle["job_dir"].as_str().unwrap().to_string();
    assert!(handle["job_id"].as_str().is_some());

    let mut last = Value::Null;
    for _ in 0..50 {
        let response = app.clone().oneshot(get(&status_uri(&job_dir))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        last = body_to_json(response).await;
        if last["state"] != "running" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(last["state"], "completed");
    assert_eq!(last["exit_code"], 0);
    assert_eq!(last["stats"]["area"], "512");
    assert_eq!(last["metadata"]["design"], "alu");
}

#[tokio::test]
async fn tool_invocation_builds_command() {
    let (app, _dir) = create_test_app(None);
    let response = app
        .oneshot(post(
            "/jobs",
            &serde_json::json!({
                "tool": {"input": "/data/alu.v", "top": "alu", "frequency_mhz": 250}
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let handle = body_to_json(response).await;
    let job_dir = handle["job_dir"].as_str().unwrap();

    let meta: Value =
        serde_json::from_slice(&std::fs::read(format!("{job_dir}/meta.json")).unwrap()).unwrap();
    let command = meta["command"].as_str().unwrap();
    assert!(command.starts_with("'/opt/flow/bin/flow'"));
    assert!(command.contains("--top 'alu'"));
    assert!(command.contains(&format!("{job_dir}/output")));
    assert_eq!(meta["tool"], "flow");
    assert_eq!(meta["design"], "alu");
}

#[tokio::test]
async fn start_requires_exactly_one_of_command_and_tool() {
    let (app, _dir) = create_test_app(None);
    let response = app
        .clone()
        .oneshot(post("/jobs", &serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(post(
            "/jobs",
            &serde_json::json!({"command": "true", "tool": {"input": "a.v", "top": "a"}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn reused_job_dir_conflicts() {
    let (app, dir) = create_test_app(None);
    let job_dir = dir.path().join("fixed").to_string_lossy().into_owned();
    let body = serde_json::json!({"command": "true", "job_dir": job_dir});

    let first = app.clone().oneshot(post("/jobs", &body)).await.unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);
    let second = app.oneshot(post("/jobs", &body)).await.unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn unknown_job_dir_is_not_found() {
    let (app, dir) = create_test_app(None);
    let missing = dir.path().join("missing").to_string_lossy().into_owned();
    let response = app.oneshot(get(&status_uri(&missing))).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(body_to_json(response).await["error"]
        .as_str()
        .unwrap()
        .contains("missing"));
}

#[tokio::test]
async fn exec_returns_output_and_times_out() {
    let (app, _dir) = create_test_app(None);
    let response = app
        .clone()
        .oneshot(post("/exec", &serde_json::json!({"command": "echo hi"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_to_json(response).await["output"], "hi\n");

    let response = app
        .oneshot(post(
            "/exec",
            &serde_json::json!({"command": "sleep 5", "timeout_sec": 1}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn upload_then_fetch_artifact() {
    let (app, dir) = create_test_app(None);
    let job_dir = dir.path().join("job").to_string_lossy().into_owned();
    let content = b"\x00\x06\x00\x02gds\xff".to_vec();
    let encoded = base64::engine::general_purpose::STANDARD.encode(&content);

    let response = app
        .clone()
        .oneshot(post(
            "/uploads",
            &serde_json::json!({
                "dir": format!("{job_dir}/output"),
                "filename": "alu.gds",
                "content_b64": encoded,
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let uploaded = body_to_json(response).await;
    assert_eq!(uploaded["bytes"], content.len());
    assert_eq!(uploaded["sha256"].as_str().unwrap().len(), 64);

    let uri = format!("/artifacts?job_dir={}&name=alu.gds", urlencode(&job_dir));
    let response = app.clone().oneshot(get(&uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let artifact = body_to_json(response).await;
    let fetched = base64::engine::general_purpose::STANDARD
        .decode(artifact["content_b64"].as_str().unwrap())
        .unwrap();
    assert_eq!(fetched, content);

    let uri = format!("/artifacts?job_dir={}&name=../meta.json", urlencode(&job_dir));
    let response = app.oneshot(get(&uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn upload_accepts_multi_megabyte_file() {
    let (app, dir) = create_test_app(None);
    let job_dir = dir.path().join("job").to_string_lossy().into_owned();
    let content: Vec<u8> = (0..3 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let encoded = base64::engine::general_purpose::STANDARD.encode(&content);

    let response = app
        .oneshot(post(
            "/uploads",
            &serde_json::json!({
                "dir": format!("{job_dir}/input"),
                "filename": "top.def",
                "content_b64": encoded,
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let uploaded = body_to_json(response).await;
    assert_eq!(uploaded["bytes"], content.len());
    let on_disk = std::fs::read(dir.path().join("job/input/top.def")).unwrap();
    assert_eq!(on_disk.len(), content.len());
}

#[tokio::test]
async fn upload_over_configured_limit_is_rejected() {
    let (app, dir) = create_test_app_with(None, |config| config.max_upload_bytes = 1024);
    let job_dir = dir.path().join("job").to_string_lossy().into_owned();

    // Within the body limit but over the decoded limit.
    let encoded = base64::engine::general_purpose::STANDARD.encode(vec![7u8; 2048]);
    let response = app
        .clone()
        .oneshot(post(
            "/uploads",
            &serde_json::json!({
                "dir": job_dir.clone(),
                "filename": "big.bin",
                "content_b64": encoded,
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

    // Over the body limit altogether.
    let encoded = base64::engine::general_purpose::STANDARD.encode(vec![7u8; 256 * 1024]);
    let response = app
        .oneshot(post(
            "/uploads",
            &serde_json::json!({
                "dir": job_dir,
                "filename": "big.bin",
                "content_b64": encoded,
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert!(!dir.path().join("job/big.bin").exists());
}

#[tokio::test]
async fn upload_rejects_path_in_file_name() {
    let (app, dir) = create_test_app(None);
    let response = app
        .oneshot(post(
            "/uploads",
            &serde_json::json!({
                "dir": dir.path().to_string_lossy(),
                "filename": "../escape.v",
                "content_b64": "",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn auth_token_is_enforced() {
    let (app, _dir) = create_test_app(Some("secret"));

    let response = app
        .clone()
        .oneshot(post("/exec", &serde_json::json!({"command": "true"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .method("POST")
        .uri("/exec")
        .header("content-type", "application/json")
        .header("authorization", "Bearer wrong")
        .body(Body::from(r#"{"command":"true"}"#))
        .unwrap();
    assert_eq!(
        app.clone().oneshot(request).await.unwrap().status(),
        StatusCode::UNAUTHORIZED
    );

    let request = Request::builder()
        .method("POST")
        .uri("/exec")
        .header("content-type", "application/json")
        .header("authorization", "Bearer secret")
        .body(Body::from(r#"{"command":"true"}"#))
        .unwrap();
    assert_eq!(app.oneshot(request).await.unwrap().status(), StatusCode::OK);
}
