//! End-to-end tests: a real listener on 127.0.0.1 driven over HTTP.

use std::fs;
use std::time::{Duration, Instant};

use reqwest::multipart::{Form, Part};
use reqwest::{redirect, StatusCode};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::AppState;
use crate::config::{MapConfig, ServerConfig};
use crate::db::test_support::{open_test_db, TestDb};
use crate::error::{codes, MapMarkError};
use crate::proxy::MapProxy;
use crate::server::{WebServer, SHUTDOWN_GRACE};
use crate::upload::test_images::{PNG, TEXT};
use crate::upload::UploadStore;

const MAX_FILE_SIZE: u64 = 1024;

struct TestApp {
    base: String,
    client: reqwest::Client,
    test_db: TestDb,
    upload_dir: TempDir,
    _static_dir: TempDir,
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<Result<(), MapMarkError>>,
}

impl TestApp {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn create_marker(&self, body: Value) -> Value {
        let resp = self
            .client
            .post(self.url("/api/markers"))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        resp.json().await.unwrap()
    }

    async fn upload(&self, marker_id: i64, files: &[(&str, &[u8])]) -> reqwest::Response {
        let mut form = Form::new();
        for (name, bytes) in files {
            form = form.part("images", Part::bytes(bytes.to_vec()).file_name(name.to_string()));
        }
        self.client
            .post(self.url(&format!("/api/markers/{}/images", marker_id)))
            .multipart(form)
            .send()
            .await
            .unwrap()
    }

    async fn markers(&self) -> Vec<Value> {
        self.client
            .get(self.url("/api/markers"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    fn upload_count(&self) -> usize {
        fs::read_dir(self.upload_dir.path()).unwrap().count()
    }

    async fn stop(mut self) -> Result<(), MapMarkError> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        (&mut self.server).await.unwrap()
    }
}

async fn spawn_app_with_map(static_map_url: &str) -> TestApp {
    spawn_app_with(static_map_url, |_| {}).await
}

async fn spawn_app_with(static_map_url: &str, configure: impl FnOnce(&mut ServerConfig)) -> TestApp {
    let test_db = open_test_db();
    let upload_dir = TempDir::new().unwrap();
    let static_dir = TempDir::new().unwrap();
    fs::write(static_dir.path().join("index.html"), "<h1>admin</h1>").unwrap();
    fs::create_dir(static_dir.path().join("css")).unwrap();
    fs::write(static_dir.path().join("css/site.css"), "body {}").unwrap();

    let mut server_config = ServerConfig {
        host: "127.0.0.1".to_string(),
        upload_dir: upload_dir.path().to_string_lossy().into_owned(),
        static_dir: static_dir.path().to_string_lossy().into_owned(),
        max_file_size: MAX_FILE_SIZE,
        ..ServerConfig::default()
    };
    configure(&mut server_config);
    let map_config = MapConfig {
        api_key: "server-key".to_string(),
        static_map_url: static_map_url.to_string(),
    };

    let state = AppState::new(
        test_db.db.clone(),
        UploadStore::from_config(&server_config),
        MapProxy::new(&map_config, Duration::from_secs(server_config.read_timeout)).unwrap(),
        static_dir.path().to_path_buf(),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(WebServer::new(server_config, state).serve(listener, async move {
        let _ = shutdown_rx.await;
    }));

    let client = reqwest::Client::builder()
        .redirect(redirect::Policy::none())
        .build()
        .unwrap();

    TestApp {
        base: format!("http://{}", addr),
        client,
        test_db,
        upload_dir,
        _static_dir: static_dir,
        shutdown: Some(shutdown_tx),
        server,
    }
}

async fn spawn_app() -> TestApp {
    spawn_app_with_map("http://127.0.0.1:9/v3/staticmap").await
}

#[tokio::test]
async fn test_create_then_list_marker() {
    let app = spawn_app().await;

    let created = app
        .create_marker(json!({"latitude": 39.9, "longitude": 116.4, "value": 5, "required_value": 10}))
        .await;
    assert!(created["id"].as_i64().is_some());
    assert_eq!(created["value"], 5.0);
    assert_eq!(created["required_value"], 10.0);
    assert_eq!(created["sufficient_color"], "#409EFF");
    assert_eq!(created["insufficient_color"], "#F56C6C");
    assert_eq!(created["status"], "insufficient");

    let markers = app.markers().await;
    assert_eq!(markers.len(), 1);
    assert_eq!(markers[0]["id"], created["id"]);
    assert_eq!(markers[0]["images"], json!([]));

    app.stop().await.unwrap();
}

#[tokio::test]
async fn test_malformed_json_is_invalid_param() {
    let app = spawn_app().await;

    let resp = app
        .client
        .post(app.url("/api/markers"))
        .header("content-type", "application/json")
        .body("{\"latitude\": 1.0,")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], codes::INVALID_PARAM);

    let resp = app
        .client
        .post(app.url("/api/markers"))
        .json(&json!({"latitude": 200.0, "longitude": 0.0}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(app.markers().await.is_empty());
}

#[tokio::test]
async fn test_update_marker() {
    let app = spawn_app().await;
    let created = app
        .create_marker(json!({"latitude": 1.0, "longitude": 2.0, "value": 1, "required_value": 5}))
        .await;
    let id = created["id"].as_i64().unwrap();

    let resp = app
        .client
        .put(app.url(&format!("/api/markers/{}", id)))
        .json(&json!({"latitude": 3.0, "longitude": 4.0, "value": 9, "required_value": 5,
                      "sufficient_color": "#00FF00"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let updated: Value = resp.json().await.unwrap();
    assert_eq!(updated["latitude"], 3.0);
    assert_eq!(updated["status"], "sufficient");
    assert_eq!(updated["sufficient_color"], "#00FF00");

    let resp = app
        .client
        .put(app.url("/api/markers/9999"))
        .json(&json!({"latitude": 3.0, "longitude": 4.0}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], codes::MARKER_NOT_FOUND);
}

#[tokio::test]
async fn test_upload_serve_and_delete_marker() {
    let app = spawn_app().await;
    let marker = app.create_marker(json!({"latitude": 1.0, "longitude": 2.0})).await;
    let id = marker["id"].as_i64().unwrap();

    let resp = app.upload(id, &[("a.png", PNG), ("b.png", PNG)]).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    let files: Vec<String> = serde_json::from_value(body["files"].clone()).unwrap();
    assert_eq!(files.len(), 2);
    assert_eq!(app.upload_count(), 2);

    let markers = app.markers().await;
    assert_eq!(markers[0]["images"].as_array().unwrap().len(), 2);

    let resp = app
        .client
        .get(app.url(&format!("/uploads/{}", files[0])))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["cache-control"], "public, max-age=3600");
    assert_eq!(resp.headers()["content-type"], "image/png");
    assert_eq!(resp.bytes().await.unwrap().as_ref(), PNG);

    let resp = app
        .client
        .delete(app.url(&format!("/api/markers/{}", id)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert!(body["message"].is_string());

    assert!(app.markers().await.is_empty());
    assert_eq!(app.upload_count(), 0);

    let resp = app
        .client
        .delete(app.url(&format!("/api/markers/{}", id)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_rejected_uploads_leave_nothing_behind() {
    let app = spawn_app().await;
    let marker = app.create_marker(json!({"latitude": 1.0, "longitude": 2.0})).await;
    let id = marker["id"].as_i64().unwrap();

    let oversized = vec![0u8; MAX_FILE_SIZE as usize + 1];
    let resp = app.upload(id, &[("big.png", oversized.as_slice())]).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], codes::FILE_TOO_LARGE);

    let resp = app.upload(id, &[("ok.png", PNG), ("fake.png", TEXT)]).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], codes::INVALID_FILE_TYPE);

    let resp = app.upload(9999, &[("ok.png", PNG)]).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    assert_eq!(app.upload_count(), 0);
    assert_eq!(app.markers().await[0]["images"], json!([]));
}

#[tokio::test]
async fn test_image_delete_requires_ownership() {
    let app = spawn_app().await;
    let a = app.create_marker(json!({"latitude": 1.0, "longitude": 2.0})).await["id"]
        .as_i64()
        .unwrap();
    let b = app.create_marker(json!({"latitude": 3.0, "longitude": 4.0})).await["id"]
        .as_i64()
        .unwrap();

    let body: Value = app.upload(b, &[("b.png", PNG)]).await.json().await.unwrap();
    let b_file = body["files"][0].as_str().unwrap().to_string();

    let resp = app
        .client
        .delete(app.url(&format!("/api/markers/{}/images/{}", a, b_file)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], codes::IMAGE_NOT_FOUND);
    assert_eq!(app.upload_count(), 1);

    let resp = app
        .client
        .delete(app.url(&format!("/api/markers/{}/images/{}", b, b_file)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(app.upload_count(), 0);

    let markers = app.markers().await;
    assert!(markers.iter().all(|m| m["images"] == json!([])));
}

#[tokio::test]
async fn test_visits_and_actions_are_logged() {
    let app = spawn_app().await;

    let resp = app
        .client
        .post(app.url("/api/markers"))
        .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
        .header("user-agent", "e2e-agent")
        .header("referer", "http://maps.local/admin")
        .json(&json!({"latitude": 1.0, "longitude": 2.0, "value": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().contains_key("x-request-id"));

    let visits: Vec<Value> = app
        .client
        .get(app.url("/api/visits"))
        .header("x-forwarded-for", "203.0.113.9")
        .header("user-agent", "e2e-agent")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let group = visits
        .iter()
        .find(|v| v["ip"] == "203.0.113.9" && v["userAgent"] == "e2e-agent")
        .expect("visitor group");
    assert_eq!(group["visitCount"], 2);
    assert_eq!(group["paths"], json!(["/api/markers", "/api/visits"]));
    assert_eq!(group["referers"], json!(["http://maps.local/admin"]));
    assert_eq!(group["actions"][0]["type"], "create_marker");

    let conn = app.test_db.db.conn().unwrap();
    let actions: i64 = conn
        .query_row("SELECT COUNT(*) FROM user_actions", [], |row| row.get(0))
        .unwrap();
    assert_eq!(actions, 1);
}

#[tokio::test]
async fn test_failed_mutation_records_no_action() {
    let app = spawn_app().await;

    let resp = app
        .client
        .delete(app.url("/api/markers/12345"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let conn = app.test_db.db.conn().unwrap();
    let actions: i64 = conn
        .query_row("SELECT COUNT(*) FROM user_actions", [], |row| row.get(0))
        .unwrap();
    assert_eq!(actions, 0);
}

#[tokio::test]
async fn test_static_pages_and_redirect() {
    let app = spawn_app().await;

    let resp = app.client.get(app.url("/")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(resp.headers()["location"], "/admin");

    let resp = app.client.get(app.url("/admin")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "<h1>admin</h1>");

    let resp = app.client.get(app.url("/static/css/site.css")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "text/css");

    let resp = app.client.get(app.url("/view")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = app.client.get(app.url("/health")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_map_proxy_failure_is_server_error() {
    // Port 9 (discard) is not listening on the test host
    let app = spawn_app().await;

    let resp = app
        .client
        .get(app.url("/api/amap-staticmap?location=1,2"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], codes::INTERNAL);
    assert_eq!(body["error"], "Map service request failed");
}

#[tokio::test]
async fn test_map_proxy_forwards_through_router() {
    use axum::{extract::RawQuery, routing::get, Router};

    let upstream = Router::new().route(
        "/v3/staticmap",
        get(|RawQuery(query): RawQuery| async move { query.unwrap_or_default() }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, upstream).await.unwrap();
    });

    let app = spawn_app_with_map(&format!("http://{}/v3/staticmap", upstream_addr)).await;
    let resp = app
        .client
        .get(app.url("/api/amap-staticmap?key=mine&zoom=12"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["access-control-allow-origin"], "*");
    assert_eq!(resp.text().await.unwrap(), "key=server-key&zoom=12");
}

#[tokio::test]
async fn test_shutdown_stops_server() {
    let app = spawn_app().await;
    let base = app.base.clone();

    app.stop().await.unwrap();

    let client = reqwest::Client::new();
    assert!(client.get(format!("{}/health", base)).send().await.is_err());
}

#[tokio::test]
async fn test_slow_mutation_completes_and_is_logged() {
    let app = spawn_app_with("http://127.0.0.1:9/v3/staticmap", |config| {
        config.write_timeout = 1;
    })
    .await;

    // Make every marker insert spend a while in SQLite
    {
        let conn = app.test_db.db.conn().unwrap();
        conn.execute_batch(
            "CREATE TABLE burn (x INTEGER);
             INSERT INTO burn
                WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 8000)
                SELECT x FROM c;
             CREATE TRIGGER slow_marker_insert AFTER INSERT ON markers
             BEGIN
                SELECT count(*) FROM burn a, burn b WHERE (a.x + b.x) % 9973 = 0;
             END;",
        )
        .unwrap();
    }

    let resp = app
        .client
        .post(app.url("/api/markers"))
        .json(&json!({"latitude": 1.0, "longitude": 2.0}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let marker: Value = resp.json().await.unwrap();

    let conn = app.test_db.db.conn().unwrap();
    let markers: i64 = conn
        .query_row("SELECT COUNT(*) FROM markers", [], |row| row.get(0))
        .unwrap();
    let actions: Vec<String> = conn
        .prepare("SELECT target_id FROM user_actions WHERE action_type = 'create_marker'")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(markers, 1);
    assert_eq!(actions, vec![marker["id"].as_i64().unwrap().to_string()]);
}

#[tokio::test]
async fn test_shutdown_aborts_requests_after_grace_period() {
    // Accepts connections but never answers, so a proxied request hangs
    let silent_upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = silent_upstream.local_addr().unwrap();

    let app = spawn_app_with_map(&format!("http://{}/v3/staticmap", upstream_addr)).await;

    let client = app.client.clone();
    let hanging_url = app.url("/api/amap-staticmap?zoom=3");
    let in_flight = tokio::spawn(async move { client.get(hanging_url).send().await });
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!in_flight.is_finished());

    let started = Instant::now();
    app.stop().await.unwrap();
    let elapsed = started.elapsed();

    assert!(
        elapsed >= SHUTDOWN_GRACE - Duration::from_millis(500),
        "server stopped after {:?} without waiting for the in-flight request",
        elapsed
    );
    assert!(
        elapsed < SHUTDOWN_GRACE + Duration::from_secs(3),
        "server took {:?} to stop",
        elapsed
    );

    in_flight.abort();
    drop(silent_upstream);
}
