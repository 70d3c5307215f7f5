//! Application records and the durable JSON registry
//!
//! The registry is the agent's single source of durable state: one JSON
//! array on disk, mirrored in memory. Every mutation happens under one
//! async lock held across the file write, so writes never interleave.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::PathsConfig;
use crate::error::{AgentError, AgentResult};

/// Lowest port handed to an application; allocation scans upward from here.
pub const BASE_PORT: u16 = 3050;

/// Lifecycle states an application moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppStatus {
    Created,
    Pushed,
    InstallFail,
    Start,
    Ok,
    Restart,
    Stop,
    Exit,
    Error,
}

impl AppStatus {
    /// Statuses whose domains the proxy forwards. Everything else routes to
    /// the 503 sentinel rather than disappearing from the table.
    pub fn is_reachable(self) -> bool {
        matches!(self, AppStatus::Start | AppStatus::Ok | AppStatus::Restart)
    }
}

/// Environment values keep the type the control plane sent: numbers stay
/// numbers, strings stay strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    Number(serde_json::Number),
    Text(String),
}

impl EnvValue {
    /// Strict conversion used when whole env maps are supplied: strings and
    /// numbers pass through, anything else is rejected.
    pub fn from_value(value: serde_json::Value) -> AgentResult<EnvValue> {
        match value {
            serde_json::Value::Number(n) => Ok(EnvValue::Number(n)),
            serde_json::Value::String(s) => Ok(EnvValue::Text(s)),
            other => Err(AgentError::Validation(format!(
                "env values must be strings or numbers, got {other}"
            ))),
        }
    }

    /// Conversion used by the set-variable operation. A non-empty string
    /// that does not begin with `0` and parses as a number is stored as a
    /// number: `"42"` becomes `42`, while `"007"` and `"0"` stay strings.
    pub fn coerce(value: serde_json::Value) -> AgentResult<EnvValue> {
        match value {
            serde_json::Value::String(s) => Ok(Self::coerce_text(s)),
            other => Self::from_value(other),
        }
    }

    fn coerce_text(s: String) -> EnvValue {
        let numeric = !s.is_empty()
            && !s.starts_with('0')
            && s.parse::<f64>().map(f64::is_finite).unwrap_or(false);
        if numeric {
            if let Ok(i) = s.parse::<i64>() {
                return EnvValue::Number(i.into());
            }
            if let Some(n) = s.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
                return EnvValue::Number(n);
            }
        }
        EnvValue::Text(s)
    }

    /// Value as handed to a child process environment.
    pub fn as_env_string(&self) -> String {
        match self {
            EnvValue::Number(n) => n.to_string(),
            EnvValue::Text(s) => s.clone(),
        }
    }
}

/// One hosted application, as persisted in the registry file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppRecord {
    pub id: String,
    #[serde(default)]
    pub domains: Vec<String>,
    pub port: u16,
    #[serde(default)]
    pub main: String,
    #[serde(default)]
    pub runtime: String,
    #[serde(default)]
    pub env: BTreeMap<String, EnvValue>,
    pub status: AppStatus,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
    /// Transient provisioning diagnostics; cleared when a start succeeds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,
}

impl AppRecord {
    pub fn has_tls(&self) -> bool {
        self.key.is_some() && self.cert.is_some()
    }

    /// The record as exposed by the unauthenticated info probe: env and TLS
    /// material removed, TLS presence kept as an `ssl` flag. The full record
    /// stays available through the authenticated per-app endpoint.
    pub fn scrubbed(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}));
        if let Some(map) = value.as_object_mut() {
            for field in ["env", "key", "cert", "passphrase", "ca"] {
                map.remove(field);
            }
            map.insert("ssl".to_string(), serde_json::Value::Bool(self.has_tls()));
        }
        value
    }
}

/// Field-wise partial update; only the fields present are touched.
#[derive(Debug, Default, Clone)]
pub struct AppPatch {
    pub domains: Option<Vec<String>>,
    pub main: Option<String>,
    pub runtime: Option<String>,
    pub env: Option<BTreeMap<String, EnvValue>>,
    pub status: Option<AppStatus>,
    /// `Some(None)` clears the diagnostics field
    pub logs: Option<Option<String>>,
}

impl AppPatch {
    pub fn status(status: AppStatus) -> Self {
        AppPatch {
            status: Some(status),
            ..Default::default()
        }
    }

    fn apply(self, record: &mut AppRecord) {
        if let Some(domains) = self.domains {
            record.domains = domains;
        }
        if let Some(main) = self.main {
            record.main = main;
        }
        if let Some(runtime) = self.runtime {
            record.runtime = runtime;
        }
        if let Some(env) = self.env {
            record.env = env;
        }
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(logs) = self.logs {
            record.logs = logs;
        }
    }
}

/// PEM material uploaded for an app. Setting it replaces all four fields,
/// so an upload without a passphrase clears any stored one.
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub key: String,
    pub cert: String,
    pub passphrase: Option<String>,
    pub ca: Option<String>,
}

/// App ids name directories under the apps root, so the charset is strict:
/// ASCII alphanumerics plus `.`, `-`, `_`, no leading dot, at most 64 chars.
pub fn validate_app_id(id: &str) -> AgentResult<()> {
    if id.is_empty() || id.len() > 64 {
        return Err(AgentError::Validation(
            "id must be between 1 and 64 characters".to_string(),
        ));
    }
    if id.starts_with('.') {
        return Err(AgentError::Validation(
            "id must not begin with a dot".to_string(),
        ));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err(AgentError::Validation(
            "id may only contain letters, digits, dots, hyphens and underscores".to_string(),
        ));
    }
    Ok(())
}

/// Durable registry of hosted applications.
pub struct AppRegistry {
    path: PathBuf,
    logs_dir: PathBuf,
    inner: Mutex<Vec<AppRecord>>,
}

impl AppRegistry {
    /// Open the registry file, recreating it as an empty list when it is
    /// missing or does not parse. Only called at boot, before any mutation.
    pub async fn open(paths: &PathsConfig) -> AgentResult<Self> {
        let path = paths.registry_file();
        let records = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => match serde_json::from_str::<Vec<AppRecord>>(&contents) {
                Ok(records) => records,
                Err(err) => {
                    warn!(%err, path = %path.display(), "registry file unreadable, recreating as empty");
                    Vec::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no registry file, starting empty");
                Vec::new()
            }
            Err(err) => return Err(err.into()),
        };

        let registry = Self {
            path,
            logs_dir: paths.logs_dir(),
            inner: Mutex::new(records),
        };
        {
            // The file always exists after boot, even when it had to be reset.
            let inner = registry.inner.lock().await;
            registry.persist(&inner).await?;
        }
        Ok(registry)
    }

    pub async fn list(&self) -> Vec<AppRecord> {
        self.inner.lock().await.clone()
    }

    pub async fn get(&self, id: &str) -> AgentResult<AppRecord> {
        self.inner
            .lock()
            .await
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| AgentError::NotFound(format!("no app with id {id}")))
    }

    /// Create a record with a freshly allocated port. Allocation and insert
    /// happen under one lock, so concurrent creates cannot share a port.
    pub async fn create(
        &self,
        id: &str,
        env: BTreeMap<String, EnvValue>,
    ) -> AgentResult<AppRecord> {
        validate_app_id(id)?;

        let mut inner = self.inner.lock().await;
        if inner.iter().any(|r| r.id == id) {
            return Err(AgentError::Conflict(format!("app {id} already exists")));
        }

        let port = next_free_port(&inner);
        let record = AppRecord {
            id: id.to_string(),
            domains: Vec::new(),
            port,
            main: String::new(),
            runtime: String::new(),
            env,
            status: AppStatus::Created,
            stdout_log: self.logs_dir.join(format!("{id}-out.log")),
            stderr_log: self.logs_dir.join(format!("{id}-err.log")),
            logs: None,
            key: None,
            cert: None,
            passphrase: None,
            ca: None,
        };

        let mut next = inner.clone();
        next.push(record.clone());
        self.persist(&next).await?;
        *inner = next;

        info!(app = %id, port, "app created");
        Ok(record)
    }

    pub async fn update(&self, id: &str, patch: AppPatch) -> AgentResult<AppRecord> {
        let mut inner = self.inner.lock().await;
        let mut next = inner.clone();
        let record = next
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| AgentError::NotFound(format!("no app with id {id}")))?;
        patch.apply(record);
        let updated = record.clone();
        self.persist(&next).await?;
        *inner = next;
        Ok(updated)
    }

    pub async fn set_env_var(
        &self,
        id: &str,
        key: &str,
        value: EnvValue,
    ) -> AgentResult<AppRecord> {
        if key.is_empty() {
            return Err(AgentError::Validation(
                "env key must be a non-empty string".to_string(),
            ));
        }

        let mut inner = self.inner.lock().await;
        let mut next = inner.clone();
        let record = next
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| AgentError::NotFound(format!("no app with id {id}")))?;
        record.env.insert(key.to_string(), value);
        let updated = record.clone();
        self.persist(&next).await?;
        *inner = next;
        Ok(updated)
    }

    pub async fn set_tls(&self, id: &str, material: TlsMaterial) -> AgentResult<AppRecord> {
        let mut inner = self.inner.lock().await;
        let mut next = inner.clone();
        let record = next
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| AgentError::NotFound(format!("no app with id {id}")))?;
        record.key = Some(material.key);
        record.cert = Some(material.cert);
        record.passphrase = material.passphrase;
        record.ca = material.ca;
        let updated = record.clone();
        self.persist(&next).await?;
        *inner = next;
        info!(app = %id, "tls material stored");
        Ok(updated)
    }

    pub async fn remove(&self, id: &str) -> AgentResult<AppRecord> {
        let mut inner = self.inner.lock().await;
        let pos = inner
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| AgentError::NotFound(format!("no app with id {id}")))?;
        let mut next = inner.clone();
        let removed = next.remove(pos);
        self.persist(&next).await?;
        *inner = next;
        info!(app = %id, "app removed");
        Ok(removed)
    }

    /// Serialize first, write second: a serialization failure must never
    /// leave a half-written file behind.
    async fn persist(&self, records: &[AppRecord]) -> AgentResult<()> {
        let data = serde_json::to_string_pretty(records)
            .map_err(|e| AgentError::Internal(format!("registry serialization failed: {e}")))?;
        tokio::fs::write(&self.path, data).await?;
        Ok(())
    }
}

fn next_free_port(records: &[AppRecord]) -> u16 {
    let mut port = BASE_PORT;
    while records.iter().any(|r| r.port == port) {
        port += 1;
    }
    port
}
