//! Host info served on the unauthenticated probe endpoint

use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use tracing::warn;

use crate::config::PathsConfig;
use crate::registry::AppRegistry;
use crate::runtime::RuntimeManager;
use crate::supervisor::Supervisor;

#[derive(Debug, Serialize)]
pub struct StorageUsage {
    pub bytes: u64,
    pub human: String,
}

impl StorageUsage {
    fn new(bytes: u64) -> Self {
        Self {
            human: bytes_human(bytes),
            bytes,
        }
    }
}

/// What the info probe reports about this host. The probe answers without
/// credentials, so records are scrubbed: no env, TLS down to an `ssl` flag.
#[derive(Debug, Serialize)]
pub struct HostInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub hostname: String,
    pub os: &'static str,
    pub arch: &'static str,
    pub uptime_secs: u64,
    pub apps_size: StorageUsage,
    pub logs_size: StorageUsage,
    pub running: Vec<String>,
    pub apps: Vec<serde_json::Value>,
    pub node_versions: Vec<String>,
}

pub async fn collect(
    paths: &PathsConfig,
    registry: &AppRegistry,
    supervisor: &Supervisor,
    runtime: &RuntimeManager,
    started_at: Instant,
) -> HostInfo {
    let apps_size = StorageUsage::new(dir_size(&paths.apps_dir()).await);
    let logs_size = StorageUsage::new(dir_size(&paths.logs_dir()).await);
    let apps = registry
        .list()
        .await
        .iter()
        .map(|record| record.scrubbed())
        .collect();

    HostInfo {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        hostname: hostname().await,
        os: std::env::consts::OS,
        arch: std::env::consts::ARCH,
        uptime_secs: started_at.elapsed().as_secs(),
        apps_size,
        logs_size,
        running: supervisor.running(),
        apps,
        node_versions: runtime.installed_versions().await,
    }
}

async fn hostname() -> String {
    match tokio::fs::read_to_string("/proc/sys/kernel/hostname").await {
        Ok(name) => name.trim().to_string(),
        Err(_) => std::env::var("HOSTNAME").unwrap_or_default(),
    }
}

/// Total size of everything under `root`, walked with an explicit work
/// list. Symlinks count as their own size and are not followed, so a
/// link cycle cannot hang the walk.
pub async fn dir_size(root: &Path) -> u64 {
    let mut total = 0u64;
    let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %dir.display(), %err, "could not read directory");
                }
                continue;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            // DirEntry metadata does not traverse symlinks.
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            if meta.is_dir() {
                pending.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    total
}

/// 1024-based size formatting, one decimal: `"3.4mb"`.
pub fn bytes_human(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["b", "kb", "mb", "gb", "tb"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1}{}", UNITS[unit])
}
