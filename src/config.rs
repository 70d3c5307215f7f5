//! Agent configuration and host identity

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

/// Environment variable that, when set at boot, replaces the stored shared
/// secret with the hash of its value.
pub const SECRET_RESET_ENV: &str = "SHEPHERD_SECRET_RESET";

/// Global configuration for the agent
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AgentConfig {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// On-disk layout
    #[serde(default)]
    pub paths: PathsConfig,

    /// Language runtime locations
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Timers and delays; the defaults are the production contract
    #[serde(default)]
    pub timing: TimingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for all listeners (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Management API port (default: 3000)
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Plaintext proxy port (default: 3001; production deployments use 80)
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// TLS proxy port (default: 3002; production deployments use 443)
    #[serde(default = "default_https_port")]
    pub https_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            api_port: default_api_port(),
            http_port: default_http_port(),
            https_port: default_https_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// Root for everything the agent writes: apps, logs, registry, identity
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl PathsConfig {
    pub fn apps_dir(&self) -> PathBuf {
        self.data_dir.join("apps")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn registry_file(&self) -> PathBuf {
        self.data_dir.join("apps.json")
    }

    pub fn host_file(&self) -> PathBuf {
        self.data_dir.join("host.json")
    }

    pub fn cert_file(&self) -> PathBuf {
        self.data_dir.join("agent.crt")
    }

    pub fn key_file(&self) -> PathBuf {
        self.data_dir.join("agent.key")
    }

    /// Host-level log files served by `GET /logs`.
    pub fn host_log_files(&self) -> [(&'static str, PathBuf); 3] {
        [
            ("logs", self.data_dir.join("agent.log")),
            ("stdout", self.data_dir.join("agent-out.log")),
            ("stderr", self.data_dir.join("agent-err.log")),
        ]
    }

    pub fn app_dir(&self, id: &str) -> PathBuf {
        self.apps_dir().join(id)
    }

    pub fn app_archive(&self, id: &str) -> PathBuf {
        self.apps_dir().join(format!("{id}.tgz"))
    }

    pub fn app_stdout_log(&self, id: &str) -> PathBuf {
        self.logs_dir().join(format!("{id}-out.log"))
    }

    pub fn app_stderr_log(&self, id: &str) -> PathBuf {
        self.logs_dir().join(format!("{id}-err.log"))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Versioned runtimes live at `<root_dir>/vX.Y.Z/bin/{node,npm}`
    #[serde(default = "default_runtime_root")]
    pub root_dir: PathBuf,

    /// Program invoked as `<installer> install vX.Y.Z`
    #[serde(default = "default_runtime_installer")]
    pub installer: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            root_dir: default_runtime_root(),
            installer: default_runtime_installer(),
        }
    }
}

impl RuntimeConfig {
    pub fn version_dir(&self, version: &str) -> PathBuf {
        self.root_dir.join(format!("v{version}"))
    }

    pub fn node_bin(&self, version: &str) -> PathBuf {
        self.version_dir(version).join("bin").join("node")
    }

    pub fn npm_bin(&self, version: &str) -> PathBuf {
        self.version_dir(version).join("bin").join("npm")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TimingConfig {
    /// Window a starting process must survive before start reports success
    #[serde(default = "default_startup_grace_secs")]
    pub startup_grace_secs: u64,

    /// Pause between the kill and start halves of a restart
    #[serde(default = "default_restart_delay_secs")]
    pub restart_delay_secs: u64,

    /// How long a runtime install may run before the API answers "started"
    #[serde(default = "default_install_ack_secs")]
    pub install_ack_secs: u64,

    /// Pause before answering a failed auth attempt
    #[serde(default = "default_auth_delay_ms")]
    pub auth_delay_ms: u64,

    /// Pause before answering a request for an unknown hostname
    #[serde(default = "default_no_response_delay_ms")]
    pub no_response_delay_ms: u64,

    /// Interval between route/certificate table rebuilds
    #[serde(default = "default_rebuild_interval_secs")]
    pub rebuild_interval_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            startup_grace_secs: default_startup_grace_secs(),
            restart_delay_secs: default_restart_delay_secs(),
            install_ack_secs: default_install_ack_secs(),
            auth_delay_ms: default_auth_delay_ms(),
            no_response_delay_ms: default_no_response_delay_ms(),
            rebuild_interval_secs: default_rebuild_interval_secs(),
        }
    }
}

impl TimingConfig {
    pub fn startup_grace(&self) -> Duration {
        Duration::from_secs(self.startup_grace_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }

    pub fn install_ack(&self) -> Duration {
        Duration::from_secs(self.install_ack_secs)
    }

    pub fn auth_delay(&self) -> Duration {
        Duration::from_millis(self.auth_delay_ms)
    }

    pub fn no_response_delay(&self) -> Duration {
        Duration::from_millis(self.no_response_delay_ms)
    }

    pub fn rebuild_interval(&self) -> Duration {
        Duration::from_secs(self.rebuild_interval_secs)
    }
}

impl AgentConfig {
    /// Load configuration from a TOML file. A missing file means built-in
    /// defaults; a present but malformed file is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        } else {
            Self::default()
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration, collecting all errors before failing.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        let ports = [
            ("api_port", self.server.api_port),
            ("http_port", self.server.http_port),
            ("https_port", self.server.https_port),
        ];
        for (i, (name_a, port_a)) in ports.iter().enumerate() {
            for (name_b, port_b) in &ports[i + 1..] {
                if port_a == port_b {
                    errors.push(format!("{name_a} and {name_b} are both {port_a}"));
                }
            }
        }

        if self.timing.rebuild_interval_secs == 0 {
            errors.push("rebuild_interval_secs must be greater than zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("invalid configuration:\n  - {}", errors.join("\n  - "))
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    3000
}

fn default_http_port() -> u16 {
    3001
}

fn default_https_port() -> u16 {
    3002
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./shepherd_data")
}

fn default_runtime_root() -> PathBuf {
    PathBuf::from("/usr/local/nvm")
}

fn default_runtime_installer() -> PathBuf {
    PathBuf::from("/usr/local/bin/nvm")
}

fn default_startup_grace_secs() -> u64 {
    5
}

fn default_restart_delay_secs() -> u64 {
    3
}

fn default_install_ack_secs() -> u64 {
    4
}

fn default_auth_delay_ms() -> u64 {
    500
}

fn default_no_response_delay_ms() -> u64 {
    500
}

fn default_rebuild_interval_secs() -> u64 {
    300
}

/// SHA-256 of the shared secret, base64-encoded. Only this form is ever
/// persisted; the API hashes each presented secret and compares.
pub fn hash_secret(plain: &str) -> String {
    BASE64.encode(Sha256::digest(plain.as_bytes()))
}

/// Host identity file: the public address apps are reached through and the
/// hashed shared secret the control plane authenticates with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostIdentity {
    pub ip: String,
    pub secret: String,
}

impl HostIdentity {
    /// Load `host.json`, generating a fresh identity when the file is absent.
    /// The generated secret is logged once so the operator can capture it.
    pub async fn load_or_create(path: &Path) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => {
                let identity: HostIdentity = serde_json::from_str(&contents)
                    .with_context(|| format!("failed to parse {}", path.display()))?;
                Ok(identity)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let plain = Uuid::new_v4().to_string();
                warn!(
                    secret = %plain,
                    "no host identity found; generated a shared secret (shown once)"
                );
                let identity = HostIdentity {
                    ip: "127.0.0.1".to_string(),
                    secret: hash_secret(&plain),
                };
                identity.save(path).await?;
                Ok(identity)
            }
            Err(err) => {
                Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self).context("failed to serialize identity")?;
        tokio::fs::write(path, data)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Apply the secret-reset environment variable, if set. The plaintext is
    /// hashed and persisted; it is never logged.
    pub async fn apply_secret_reset(&mut self, path: &Path) -> Result<bool> {
        let Ok(plain) = std::env::var(SECRET_RESET_ENV) else {
            return Ok(false);
        };
        self.secret = hash_secret(&plain);
        self.save(path).await?;
        info!("shared secret replaced from {}", SECRET_RESET_ENV);
        Ok(true)
    }
}
