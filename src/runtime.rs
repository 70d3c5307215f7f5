//! Versioned language runtimes: resolution, listing, installation

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::config::RuntimeConfig;
use crate::error::{AgentError, AgentResult};

/// Accepts a specific `X.Y.Z` version, tolerating a leading `v`. Ranges,
/// wildcards and anything else are rejected: an app must pin the exact
/// runtime it runs on.
pub fn parse_exact_version(raw: &str) -> AgentResult<String> {
    let trimmed = raw.strip_prefix('v').unwrap_or(raw);
    let parts: Vec<&str> = trimmed.split('.').collect();
    let well_formed = parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
    if well_formed {
        Ok(trimmed.to_string())
    } else {
        Err(AgentError::Validation(format!(
            "runtime version must be exact (X.Y.Z), got {raw:?}"
        )))
    }
}

/// Outcome of an install request: either the installer finished inside the
/// acknowledgement window, or it is still running in the background.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallAck {
    Completed,
    Started,
}

pub struct RuntimeManager {
    config: RuntimeConfig,
    ack_timeout: Duration,
    installing: AtomicBool,
}

impl RuntimeManager {
    pub fn new(config: RuntimeConfig, ack_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            config,
            ack_timeout,
            installing: AtomicBool::new(false),
        })
    }

    pub fn node_bin(&self, version: &str) -> PathBuf {
        self.config.node_bin(version)
    }

    pub fn npm_bin(&self, version: &str) -> PathBuf {
        self.config.npm_bin(version)
    }

    /// Versions present under the runtime root, sorted ascending. A missing
    /// root means no runtimes, not an error.
    pub async fn installed_versions(&self) -> Vec<String> {
        let mut versions: Vec<(u64, u64, u64)> = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.config.root_dir).await {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(rest) = name.strip_prefix('v') else {
                continue;
            };
            if let Some(parts) = split_version(rest) {
                versions.push(parts);
            }
        }
        versions.sort_unstable();
        versions
            .into_iter()
            .map(|(a, b, c)| format!("{a}.{b}.{c}"))
            .collect()
    }

    /// Kick off `<installer> install vX.Y.Z`. The call returns after at most
    /// the acknowledgement window; a still-running install continues in the
    /// background and logs its result. One install at a time.
    pub async fn install(self: &Arc<Self>, version: &str) -> AgentResult<InstallAck> {
        let version = parse_exact_version(version)?;

        if self.installing.swap(true, Ordering::SeqCst) {
            return Err(AgentError::Conflict(
                "a runtime install is already in flight".to_string(),
            ));
        }

        let (tx, rx) = oneshot::channel();
        let manager = Arc::clone(self);
        let ver = version.clone();
        tokio::spawn(async move {
            let result = manager.run_installer(&ver).await;
            manager.installing.store(false, Ordering::SeqCst);
            match &result {
                Ok(()) => info!(version = %ver, "runtime install finished"),
                Err(err) => error!(version = %ver, %err, "runtime install failed"),
            }
            let _ = tx.send(result);
        });

        match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(Ok(()))) => Ok(InstallAck::Completed),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_)) => Err(AgentError::Internal("install task dropped".to_string())),
            Err(_elapsed) => {
                info!(version = %version, "runtime install still running, answering early");
                Ok(InstallAck::Started)
            }
        }
    }

    async fn run_installer(&self, version: &str) -> AgentResult<()> {
        let output = Command::new(&self.config.installer)
            .arg("install")
            .arg(format!("v{version}"))
            .output()
            .await
            .map_err(|e| {
                AgentError::Install(format!(
                    "failed to run {}: {e}",
                    self.config.installer.display()
                ))
            })?;

        if output.status.success() {
            Ok(())
        } else {
            // Install output belongs to the caller; stderr first, stdout as
            // the fallback.
            let mut detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if detail.is_empty() {
                detail = String::from_utf8_lossy(&output.stdout).trim().to_string();
            }
            if detail.is_empty() {
                detail = format!("installer exited with {}", output.status);
            }
            warn!(version, %detail, "installer exited with failure");
            Err(AgentError::Install(detail))
        }
    }
}

fn split_version(s: &str) -> Option<(u64, u64, u64)> {
    let mut parts = s.split('.');
    let a = parts.next()?.parse().ok()?;
    let b = parts.next()?.parse().ok()?;
    let c = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((a, b, c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(root: PathBuf, installer: &str, ack: Duration) -> Arc<RuntimeManager> {
        RuntimeManager::new(
            RuntimeConfig {
                root_dir: root,
                installer: PathBuf::from(installer),
            },
            ack,
        )
    }

    #[test]
    fn test_parse_exact_version() {
        assert_eq!(parse_exact_version("16.14.2").unwrap(), "16.14.2");
        assert_eq!(parse_exact_version("v16.14.2").unwrap(), "16.14.2");
        assert_eq!(parse_exact_version("0.10.33").unwrap(), "0.10.33");

        assert!(parse_exact_version("").is_err());
        assert!(parse_exact_version("16").is_err());
        assert!(parse_exact_version("16.14").is_err());
        assert!(parse_exact_version("16.14.x").is_err());
        assert!(parse_exact_version(">=16.0.0").is_err());
        assert!(parse_exact_version("^16.14.2").is_err());
        assert!(parse_exact_version("16.14.2.1").is_err());
        assert!(parse_exact_version("16.14.2 ").is_err());
    }

    #[test]
    fn test_binary_paths() {
        let m = manager(PathBuf::from("/opt/nvm"), "/bin/true", Duration::from_secs(1));
        assert_eq!(m.node_bin("18.2.0"), PathBuf::from("/opt/nvm/v18.2.0/bin/node"));
        assert_eq!(m.npm_bin("18.2.0"), PathBuf::from("/opt/nvm/v18.2.0/bin/npm"));
    }

    #[tokio::test]
    async fn test_installed_versions_sorted_numerically() {
        let dir = TempDir::new().unwrap();
        for name in ["v9.0.0", "v16.14.2", "v16.2.0", "junk", "v18", ".cache"] {
            tokio::fs::create_dir_all(dir.path().join(name)).await.unwrap();
        }

        let m = manager(dir.path().to_path_buf(), "/bin/true", Duration::from_secs(1));
        assert_eq!(
            m.installed_versions().await,
            vec!["9.0.0", "16.2.0", "16.14.2"]
        );
    }

    #[tokio::test]
    async fn test_installed_versions_missing_root() {
        let m = manager(
            PathBuf::from("/definitely/not/here"),
            "/bin/true",
            Duration::from_secs(1),
        );
        assert!(m.installed_versions().await.is_empty());
    }

    #[tokio::test]
    async fn test_install_completes_within_ack() {
        let m = manager(PathBuf::from("/tmp"), "/bin/true", Duration::from_secs(5));
        let ack = m.install("1.2.3").await.unwrap();
        assert_eq!(ack, InstallAck::Completed);
        // The single-flight guard is released after completion.
        let ack = m.install("1.2.3").await.unwrap();
        assert_eq!(ack, InstallAck::Completed);
    }

    #[tokio::test]
    async fn test_install_failure_surfaces() {
        let m = manager(PathBuf::from("/tmp"), "/bin/false", Duration::from_secs(5));
        let err = m.install("1.2.3").await.unwrap_err();
        assert!(matches!(err, AgentError::Install(_)));
    }

    #[tokio::test]
    async fn test_install_failure_carries_installer_output() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("broken-installer");
        tokio::fs::write(&script, "#!/bin/sh\necho 'curl: mirror unreachable' >&2\nexit 3\n")
            .await
            .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let m = manager(
            dir.path().to_path_buf(),
            script.to_str().unwrap(),
            Duration::from_secs(5),
        );
        let err = m.install("1.2.3").await.unwrap_err();
        assert!(matches!(err, AgentError::Install(_)));
        // What the installer wrote is what the API answers with.
        assert!(err.public_message().contains("curl: mirror unreachable"));
    }

    #[tokio::test]
    async fn test_install_answers_early_and_rejects_concurrent() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("slow-installer");
        tokio::fs::write(&script, "#!/bin/sh\nsleep 2\n").await.unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let m = manager(
            dir.path().to_path_buf(),
            script.to_str().unwrap(),
            Duration::from_millis(100),
        );
        let ack = m.install("1.2.3").await.unwrap();
        assert_eq!(ack, InstallAck::Started);

        let err = m.install("4.5.6").await.unwrap_err();
        assert!(matches!(err, AgentError::Conflict(_)));
    }

    #[test]
    fn test_install_rejects_ranges() {
        let m = manager(PathBuf::from("/tmp"), "/bin/true", Duration::from_secs(1));
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let err = rt.block_on(m.install(">=16")).unwrap_err();
        assert!(matches!(err, AgentError::Validation(_)));
    }
}
