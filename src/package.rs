//! Pushed application packages: decode, extract, validate, install
//!
//! A push replaces whatever was there before. The uploaded archive is a
//! base64-encoded gzipped tarball whose root holds the app files, including
//! a `package.json` manifest.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flate2::read::GzDecoder;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::PathsConfig;
use crate::error::{AgentError, AgentResult};
use crate::registry::{AppPatch, AppRecord, AppRegistry, AppStatus};
use crate::runtime::{parse_exact_version, RuntimeManager};

/// The manifest fields the agent reads from `package.json`.
#[derive(Debug, Deserialize)]
struct RawManifest {
    #[serde(default)]
    main: Option<String>,
    #[serde(default)]
    engines: Option<RawEngines>,
    #[serde(default)]
    domains: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct RawEngines {
    #[serde(default)]
    node: Option<String>,
}

/// A manifest that passed validation.
#[derive(Debug, Clone)]
pub struct AppManifest {
    pub main: String,
    pub runtime: String,
    pub domains: Vec<String>,
}

/// Read and validate `package.json` from an extracted app directory. The
/// runtime version must be exact and the domains entries non-empty strings;
/// ranges would leave the host guessing which runtime to launch.
pub async fn read_manifest(app_dir: &Path) -> AgentResult<AppManifest> {
    let path = app_dir.join("package.json");
    let contents = tokio::fs::read_to_string(&path).await.map_err(|_| {
        AgentError::Validation("package.json is missing from the app package".to_string())
    })?;
    let raw: RawManifest = serde_json::from_str(&contents)
        .map_err(|e| AgentError::Validation(format!("package.json does not parse: {e}")))?;

    let main = match raw.main {
        Some(main) if !main.is_empty() => main,
        _ => {
            return Err(AgentError::Validation(
                "package.json must declare a main entry point".to_string(),
            ))
        }
    };

    let node = raw
        .engines
        .and_then(|e| e.node)
        .ok_or_else(|| {
            AgentError::Validation("package.json must declare engines.node".to_string())
        })?;
    let runtime = parse_exact_version(&node)?;

    let raw_domains = raw.domains.ok_or_else(|| {
        AgentError::Validation("package.json must declare a domains array".to_string())
    })?;
    let mut domains = Vec::with_capacity(raw_domains.len());
    for value in raw_domains {
        match value {
            serde_json::Value::String(s) if !s.is_empty() => domains.push(s),
            other => {
                return Err(AgentError::Validation(format!(
                    "domains entries must be non-empty strings, got {other}"
                )))
            }
        }
    }

    Ok(AppManifest {
        main,
        runtime,
        domains,
    })
}

/// Unpack a gzipped tarball. Runs on the blocking pool; archives can be
/// large and the tar reader is synchronous.
pub async fn extract_archive(archive: &Path, dest: &Path) -> AgentResult<()> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || -> AgentResult<()> {
        std::fs::create_dir_all(&dest)?;
        let file = std::fs::File::open(&archive)?;
        let mut unpacker = tar::Archive::new(GzDecoder::new(file));
        unpacker
            .unpack(&dest)
            .map_err(|e| AgentError::Validation(format!("package extraction failed: {e}")))?;
        Ok(())
    })
    .await
    .map_err(|e| AgentError::Internal(format!("extraction task failed: {e}")))?
}

/// The whole push pipeline for one app. Idempotent: a re-push clears the
/// previous archive and extracted tree first.
pub async fn push_package(
    registry: &AppRegistry,
    paths: &PathsConfig,
    runtime: &RuntimeManager,
    id: &str,
    encoded: &str,
    skip_install: bool,
) -> AgentResult<AppRecord> {
    registry.get(id).await?;

    if encoded.is_empty() {
        return Err(AgentError::Validation(
            "pkg must be a non-empty base64 string".to_string(),
        ));
    }
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| AgentError::Validation(format!("pkg is not valid base64: {e}")))?;

    let archive = paths.app_archive(id);
    let app_dir = paths.app_dir(id);
    clear_previous(&archive, &app_dir).await;

    tokio::fs::write(&archive, &bytes).await?;
    extract_archive(&archive, &app_dir).await?;
    let manifest = read_manifest(&app_dir).await?;
    debug!(app = %id, runtime = %manifest.runtime, "package extracted");

    if skip_install {
        let record = registry
            .update(
                id,
                AppPatch {
                    status: Some(AppStatus::Pushed),
                    logs: Some(Some("push ok".to_string())),
                    ..Default::default()
                },
            )
            .await?;
        remove_archive(&archive).await;
        info!(app = %id, "package pushed (dependency install skipped)");
        return Ok(record);
    }

    let npm = runtime.npm_bin(&manifest.runtime);
    let output = Command::new(&npm)
        .arg("install")
        .current_dir(&app_dir)
        .output()
        .await;

    match output {
        Ok(out) if out.status.success() => {
            let stdout = String::from_utf8_lossy(&out.stdout).trim().to_string();
            let logs = if stdout.is_empty() {
                "push ok".to_string()
            } else {
                stdout
            };
            let record = registry
                .update(
                    id,
                    AppPatch {
                        status: Some(AppStatus::Pushed),
                        logs: Some(Some(logs)),
                        ..Default::default()
                    },
                )
                .await?;
            remove_archive(&archive).await;
            info!(app = %id, "package pushed and dependencies installed");
            Ok(record)
        }
        Ok(out) => {
            let mut detail = String::from_utf8_lossy(&out.stderr).trim().to_string();
            if detail.is_empty() {
                detail = String::from_utf8_lossy(&out.stdout).trim().to_string();
            }
            record_install_failure(registry, id, &detail).await;
            Err(AgentError::Install(detail))
        }
        Err(err) => {
            let detail = format!("failed to run {}: {err}", npm.display());
            record_install_failure(registry, id, &detail).await;
            Err(AgentError::Install(detail))
        }
    }
}

async fn record_install_failure(registry: &AppRegistry, id: &str, detail: &str) {
    let patch = AppPatch {
        status: Some(AppStatus::InstallFail),
        logs: Some(Some(detail.to_string())),
        ..Default::default()
    };
    if let Err(err) = registry.update(id, patch).await {
        warn!(app = %id, %err, "failed to record install failure");
    }
}

async fn clear_previous(archive: &Path, app_dir: &Path) {
    match tokio::fs::remove_file(archive).await {
        Ok(()) => debug!(path = %archive.display(), "removed previous archive"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %archive.display(), %err, "could not remove previous archive"),
    }
    match tokio::fs::remove_dir_all(app_dir).await {
        Ok(()) => debug!(path = %app_dir.display(), "removed previous app directory"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %app_dir.display(), %err, "could not remove previous app directory"),
    }
}

async fn remove_archive(archive: &Path) {
    if let Err(err) = tokio::fs::remove_file(archive).await {
        warn!(path = %archive.display(), %err, "could not remove archive after push");
    }
}
