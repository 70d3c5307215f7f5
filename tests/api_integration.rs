//! Management API tests over real sockets

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flate2::write::GzEncoder;
use flate2::Compression;
use shepherd::api::{ApiContext, ApiServer};
use shepherd::config::{hash_secret, PathsConfig, RuntimeConfig, TimingConfig};
use shepherd::registry::AppRegistry;
use shepherd::runtime::RuntimeManager;
use shepherd::supervisor::Supervisor;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

const SECRET: &str = "correct-horse";

/// Delay applied to failed auth attempts; short so tests can measure it.
const AUTH_DELAY_MS: u64 = 200;

struct TestAgent {
    _dir: TempDir,
    paths: PathsConfig,
    addr: SocketAddr,
    _shutdown: watch::Sender<bool>,
}

/// A full API server on an ephemeral port over a throwaway data dir.
async fn spawn_agent() -> TestAgent {
    let dir = TempDir::new().unwrap();
    let paths = PathsConfig {
        data_dir: dir.path().to_path_buf(),
    };
    tokio::fs::create_dir_all(paths.apps_dir()).await.unwrap();
    tokio::fs::create_dir_all(paths.logs_dir()).await.unwrap();

    let timing = TimingConfig {
        startup_grace_secs: 0,
        restart_delay_secs: 0,
        auth_delay_ms: AUTH_DELAY_MS,
        ..TimingConfig::default()
    };

    let registry = Arc::new(AppRegistry::open(&paths).await.unwrap());
    let runtime = RuntimeManager::new(
        RuntimeConfig {
            root_dir: dir.path().join("runtime"),
            installer: dir.path().join("runtime-install"),
        },
        timing.install_ack(),
    );
    let (supervisor, _events) = Supervisor::new(
        Arc::clone(&registry),
        paths.clone(),
        Arc::clone(&runtime),
        timing.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let context = ApiContext {
        paths: paths.clone(),
        timing,
        registry,
        supervisor,
        runtime,
        secret_hash: hash_secret(SECRET),
        started_at: Instant::now(),
    };

    let server = ApiServer::bind("127.0.0.1:0".parse().unwrap(), context, shutdown_rx)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    TestAgent {
        _dir: dir,
        paths,
        addr,
        _shutdown: shutdown_tx,
    }
}

/// Send one HTTP/1.1 request over a raw socket and read the whole response.
async fn request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    secret: Option<&str>,
    body: Option<&str>,
) -> String {
    let mut raw = format!("{method} {path} HTTP/1.1\r\nHost: 127.0.0.1\r\n");
    if let Some(secret) = secret {
        raw.push_str(&format!("x-agent-secret: {secret}\r\n"));
    }
    if let Some(body) = body {
        raw.push_str(&format!(
            "Content-Type: application/json\r\nContent-Length: {}\r\n",
            body.len()
        ));
    }
    raw.push_str("Connection: close\r\n\r\n");
    if let Some(body) = body {
        raw.push_str(body);
    }

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

fn status_of(response: &str) -> u16 {
    response
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("response should carry a status line")
}

fn json_of(response: &str) -> serde_json::Value {
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body)
        .unwrap_or("");
    serde_json::from_str(body).expect("response body should be JSON")
}

/// Gzipped tar archive from (name, contents) pairs.
fn tgz_package(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, contents.as_bytes())
            .unwrap();
    }
    let archive = builder.into_inner().unwrap();

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    std::io::Write::write_all(&mut encoder, &archive).unwrap();
    encoder.finish().unwrap()
}

// ============================================================================
// Auth
// ============================================================================

#[tokio::test]
async fn test_info_probe_answers_without_credentials() {
    let agent = spawn_agent().await;

    let response = request(agent.addr, "GET", "/", None, None).await;
    assert!(response.contains("200 OK"));

    let info = json_of(&response);
    assert_eq!(info["name"], "shepherd");
    assert!(info["version"].is_string());
    assert!(info["apps"].as_array().unwrap().is_empty());
    assert!(info["running"].as_array().unwrap().is_empty());
    assert_eq!(info["node_versions"], serde_json::json!([]));
}

#[tokio::test]
async fn test_missing_or_wrong_secret_is_delayed_401() {
    let agent = spawn_agent().await;

    let started = Instant::now();
    let response = request(agent.addr, "GET", "/logs", None, None).await;
    assert!(
        started.elapsed() >= Duration::from_millis(AUTH_DELAY_MS),
        "auth failure answered too quickly"
    );
    assert_eq!(status_of(&response), 401);
    assert_eq!(json_of(&response)["error"], "unauthorized");

    let response = request(agent.addr, "GET", "/logs", Some("guessed"), None).await;
    assert_eq!(status_of(&response), 401);
}

#[tokio::test]
async fn test_secret_is_accepted_as_query_parameter() {
    let agent = spawn_agent().await;

    let response = request(
        agent.addr,
        "GET",
        &format!("/logs?secret={SECRET}"),
        None,
        None,
    )
    .await;
    assert!(response.contains("200 OK"));
}

// ============================================================================
// App lifecycle over HTTP
// ============================================================================

#[tokio::test]
async fn test_create_get_delete_flow() {
    let agent = spawn_agent().await;

    let created = json_of(
        &request(
            agent.addr,
            "POST",
            "/apps",
            Some(SECRET),
            Some(r#"{"id":"alpha","env":{"GREETING":"hi","COUNT":2}}"#),
        )
        .await,
    );
    assert_eq!(created["id"], "alpha");
    assert_eq!(created["port"], 3050);
    assert_eq!(created["status"], "created");
    assert_eq!(created["env"]["COUNT"], 2);

    let fetched = json_of(&request(agent.addr, "GET", "/apps/alpha", Some(SECRET), None).await);
    assert_eq!(fetched["port"], 3050);
    assert_eq!(fetched["env"]["GREETING"], "hi");

    let removed = json_of(&request(agent.addr, "DELETE", "/apps/alpha", Some(SECRET), None).await);
    assert_eq!(removed["id"], "alpha");

    let response = request(agent.addr, "GET", "/apps/alpha", Some(SECRET), None).await;
    assert_eq!(status_of(&response), 404);
    assert_eq!(json_of(&response)["error"], "not_found");
}

#[tokio::test]
async fn test_duplicate_ids_conflict_and_ports_stay_unique() {
    let agent = spawn_agent().await;

    let first = json_of(
        &request(
            agent.addr,
            "POST",
            "/apps",
            Some(SECRET),
            Some(r#"{"id":"alpha"}"#),
        )
        .await,
    );
    let second = json_of(
        &request(
            agent.addr,
            "POST",
            "/apps",
            Some(SECRET),
            Some(r#"{"id":"beta"}"#),
        )
        .await,
    );
    assert_eq!(first["port"], 3050);
    assert_eq!(second["port"], 3051);

    let duplicate = request(
        agent.addr,
        "POST",
        "/apps",
        Some(SECRET),
        Some(r#"{"id":"alpha"}"#),
    )
    .await;
    assert_eq!(status_of(&duplicate), 400);
    assert_eq!(json_of(&duplicate)["error"], "conflict");

    let invalid = request(
        agent.addr,
        "POST",
        "/apps",
        Some(SECRET),
        Some(r#"{"id":"no/slashes"}"#),
    )
    .await;
    assert_eq!(status_of(&invalid), 400);
    assert_eq!(json_of(&invalid)["error"], "validation");
}

#[tokio::test]
async fn test_push_package_without_install() {
    let agent = spawn_agent().await;
    request(
        agent.addr,
        "POST",
        "/apps",
        Some(SECRET),
        Some(r#"{"id":"alpha"}"#),
    )
    .await;

    let manifest = r#"{"main":"server.js","engines":{"node":"0.0.1"},"domains":["alpha.test"]}"#;
    let archive = tgz_package(&[
        ("package.json", manifest),
        ("server.js", "console.log('hi')"),
    ]);
    let body = serde_json::json!({
        "pkg": BASE64.encode(&archive),
        "skip_install": true,
    })
    .to_string();

    let pushed = json_of(
        &request(agent.addr, "PUT", "/apps/alpha/pkg", Some(SECRET), Some(&body)).await,
    );
    assert_eq!(pushed["status"], "pushed");
    assert_eq!(pushed["logs"], "push ok");

    // Extracted tree is in place, the uploaded archive is not kept.
    let extracted = agent.paths.app_dir("alpha").join("server.js");
    assert!(tokio::fs::try_exists(&extracted).await.unwrap());
    assert!(!tokio::fs::try_exists(agent.paths.app_archive("alpha"))
        .await
        .unwrap());

    let rejected = request(
        agent.addr,
        "PUT",
        "/apps/alpha/pkg",
        Some(SECRET),
        Some(r#"{"pkg":"***not-base64***"}"#),
    )
    .await;
    assert_eq!(status_of(&rejected), 400);
}

// ============================================================================
// Environment endpoints
// ============================================================================

#[tokio::test]
async fn test_setvar_applies_numeric_coercion() {
    let agent = spawn_agent().await;
    request(
        agent.addr,
        "POST",
        "/apps",
        Some(SECRET),
        Some(r#"{"id":"alpha"}"#),
    )
    .await;

    let after_num = json_of(
        &request(
            agent.addr,
            "PUT",
            "/apps/alpha/setvar",
            Some(SECRET),
            Some(r#"{"key":"WORKERS","val":"42"}"#),
        )
        .await,
    );
    assert_eq!(after_num["env"]["WORKERS"], 42);

    let after_zero = json_of(
        &request(
            agent.addr,
            "PUT",
            "/apps/alpha/setvar",
            Some(SECRET),
            Some(r#"{"key":"AGENT_CODE","val":"007"}"#),
        )
        .await,
    );
    assert_eq!(after_zero["env"]["AGENT_CODE"], "007");

    let empty_key = request(
        agent.addr,
        "PUT",
        "/apps/alpha/setvar",
        Some(SECRET),
        Some(r#"{"key":"","val":"x"}"#),
    )
    .await;
    assert_eq!(status_of(&empty_key), 400);
}

#[tokio::test]
async fn test_env_replacement_is_whole_map() {
    let agent = spawn_agent().await;
    request(
        agent.addr,
        "POST",
        "/apps",
        Some(SECRET),
        Some(r#"{"id":"alpha","env":{"OLD":"1"}}"#),
    )
    .await;

    let replaced = json_of(
        &request(
            agent.addr,
            "PUT",
            "/apps/alpha/env",
            Some(SECRET),
            Some(r#"{"NEW":"yes","N":3}"#),
        )
        .await,
    );
    assert_eq!(replaced["env"]["NEW"], "yes");
    assert_eq!(replaced["env"]["N"], 3);
    assert!(replaced["env"].get("OLD").is_none());

    let rejected = request(
        agent.addr,
        "PUT",
        "/apps/alpha/env",
        Some(SECRET),
        Some(r#"{"FLAG":true}"#),
    )
    .await;
    assert_eq!(status_of(&rejected), 400);
}

// ============================================================================
// Diagnostics
// ============================================================================

#[tokio::test]
async fn test_info_scrubs_tls_and_env() {
    let agent = spawn_agent().await;
    request(
        agent.addr,
        "POST",
        "/apps",
        Some(SECRET),
        Some(r#"{"id":"alpha","env":{"TOKEN":"t0ps3cret"}}"#),
    )
    .await;
    request(
        agent.addr,
        "PUT",
        "/apps/alpha/ssl",
        Some(SECRET),
        Some(r#"{"key":"FAKE-PEM-KEY","cert":"FAKE-PEM-CERT"}"#),
    )
    .await;

    let response = request(agent.addr, "GET", "/", None, None).await;
    let info = json_of(&response);
    let app = &info["apps"][0];
    assert_eq!(app["id"], "alpha");
    assert_eq!(app["ssl"], true);
    assert!(app.get("key").is_none());
    assert!(app.get("env").is_none());
    assert!(!response.contains("t0ps3cret"));
    assert!(!response.contains("FAKE-PEM-KEY"));

    // The authenticated per-app endpoint still has the full record.
    let full = json_of(&request(agent.addr, "GET", "/apps/alpha", Some(SECRET), None).await);
    assert_eq!(full["env"]["TOKEN"], "t0ps3cret");
    assert_eq!(full["key"], "FAKE-PEM-KEY");
}

#[tokio::test]
async fn test_app_logs_read_as_empty_until_written() {
    let agent = spawn_agent().await;
    request(
        agent.addr,
        "POST",
        "/apps",
        Some(SECRET),
        Some(r#"{"id":"alpha"}"#),
    )
    .await;

    let logs = json_of(&request(agent.addr, "GET", "/apps/alpha/logs", Some(SECRET), None).await);
    assert_eq!(logs["stdout"], "");
    assert_eq!(logs["stderr"], "");

    tokio::fs::write(agent.paths.app_stdout_log("alpha"), "hello from app\n")
        .await
        .unwrap();
    let logs = json_of(&request(agent.addr, "GET", "/apps/alpha/logs", Some(SECRET), None).await);
    assert_eq!(logs["stdout"], "hello from app\n");
}

#[tokio::test]
async fn test_host_logs_report_missing_files_as_null() {
    let agent = spawn_agent().await;

    let logs = json_of(&request(agent.addr, "GET", "/logs", Some(SECRET), None).await);
    assert_eq!(logs["logs"], serde_json::Value::Null);
    assert_eq!(logs["stdout"], serde_json::Value::Null);
    assert_eq!(logs["stderr"], serde_json::Value::Null);

    tokio::fs::write(agent.paths.data_dir.join("agent.log"), "agent booted\n")
        .await
        .unwrap();
    let logs = json_of(&request(agent.addr, "GET", "/logs", Some(SECRET), None).await);
    assert_eq!(logs["logs"], "agent booted\n");
}

#[tokio::test]
async fn test_unmatched_routes_are_404() {
    let agent = spawn_agent().await;

    let response = request(agent.addr, "GET", "/nope", Some(SECRET), None).await;
    assert_eq!(status_of(&response), 404);

    let response = request(agent.addr, "PATCH", "/apps", Some(SECRET), None).await;
    assert_eq!(status_of(&response), 404);
}
