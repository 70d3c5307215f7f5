//! Child process lifecycle
//!
//! One monitor task per running app owns the `tokio::process::Child` and is
//! the only place that waits on it. Everyone else talks to the monitor over
//! a command channel, so status transitions are serialized per app. Children
//! run in their own process groups and deliberately survive an agent
//! restart; boot resumes them from their recorded status.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{PathsConfig, TimingConfig};
use crate::error::{AgentError, AgentResult};
use crate::package::read_manifest;
use crate::registry::{AppPatch, AppRecord, AppRegistry, AppStatus};
use crate::runtime::RuntimeManager;

/// Variable injected into every child environment, overriding anything the
/// control plane set under the same name.
pub const PORT_VAR: &str = "PORT";

/// How much of the stderr log a startup failure report carries.
const LOG_TAIL_BYTES: usize = 2048;

/// Lifecycle notifications for listeners outside the supervisor.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// An app survived its startup grace window.
    Started { id: String },
}

enum ProcessCommand {
    Stop {
        reply: oneshot::Sender<AgentResult<()>>,
    },
}

struct AppProcess {
    commands: mpsc::UnboundedSender<ProcessCommand>,
}

pub struct Supervisor {
    registry: Arc<AppRegistry>,
    paths: PathsConfig,
    runtime: Arc<RuntimeManager>,
    timing: TimingConfig,
    procs: DashMap<String, AppProcess>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
}

impl Supervisor {
    /// Returns the supervisor and the receiving end of its event stream.
    pub fn new(
        registry: Arc<AppRegistry>,
        paths: PathsConfig,
        runtime: Arc<RuntimeManager>,
        timing: TimingConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let supervisor = Arc::new(Self {
            registry,
            paths,
            runtime,
            timing,
            procs: DashMap::new(),
            events,
        });
        (supervisor, receiver)
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.procs.contains_key(id)
    }

    /// Ids with a live handle, sorted for stable diagnostics output.
    pub fn running(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.procs.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Launch an app and hold the call until it has survived the startup
    /// grace window. Validation failures and early exits record status
    /// `error` with the reason in the record's `logs`.
    pub async fn start(self: &Arc<Self>, id: &str) -> AgentResult<AppRecord> {
        self.registry.get(id).await?;
        if self.procs.contains_key(id) {
            return Err(AgentError::Conflict(format!("app {id} is already running")));
        }

        let app_dir = self.paths.app_dir(id);
        let manifest = match read_manifest(&app_dir).await {
            Ok(manifest) => manifest,
            Err(err) => {
                self.record_start_failure(id, &err.to_string()).await;
                return Err(err);
            }
        };
        let entry = app_dir.join(&manifest.main);
        if !tokio::fs::try_exists(&entry).await.unwrap_or(false) {
            let detail = format!("main script {} not found in package", manifest.main);
            self.record_start_failure(id, &detail).await;
            return Err(AgentError::Validation(detail));
        }
        let node = self.runtime.node_bin(&manifest.runtime);
        if !tokio::fs::try_exists(&node).await.unwrap_or(false) {
            let detail = format!("runtime {} is not installed", manifest.runtime);
            self.record_start_failure(id, &detail).await;
            return Err(AgentError::Validation(detail));
        }

        // The record follows the manifest; a stale push cannot leave old
        // domains or a removed runtime version behind.
        let record = self
            .registry
            .update(
                id,
                AppPatch {
                    domains: Some(manifest.domains),
                    main: Some(manifest.main),
                    runtime: Some(manifest.runtime),
                    ..Default::default()
                },
            )
            .await?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        match self.procs.entry(id.to_string()) {
            Entry::Occupied(_) => {
                return Err(AgentError::Conflict(format!("app {id} is already running")))
            }
            Entry::Vacant(slot) => {
                slot.insert(AppProcess { commands });
            }
        }

        let mut child = match self.launch(&record) {
            Ok(child) => child,
            Err(err) => {
                self.procs.remove(id);
                let detail = format!("failed to spawn process: {err}");
                self.record_start_failure(id, &detail).await;
                return Err(AgentError::Internal(detail));
            }
        };
        debug!(app = %id, pid = child.id(), port = record.port, "process spawned");

        match timeout(self.timing.startup_grace(), child.wait()).await {
            Ok(exited) => {
                self.procs.remove(id);
                let detail = match exited {
                    Ok(status) => match stderr_tail(&record.stderr_log).await {
                        Some(tail) => tail,
                        None => format!("process exited during startup ({status})"),
                    },
                    Err(err) => format!("failed to monitor process: {err}"),
                };
                self.record_start_failure(id, &detail).await;
                Err(AgentError::Internal(detail))
            }
            Err(_) => {
                let pid = child.id().unwrap_or(0);
                tokio::spawn(self.clone().monitor(id.to_string(), child, pid, command_rx));
                let record = self
                    .registry
                    .update(
                        id,
                        AppPatch {
                            status: Some(AppStatus::Start),
                            logs: Some(None),
                            ..Default::default()
                        },
                    )
                    .await?;
                let _ = self.events.send(SupervisorEvent::Started { id: id.to_string() });
                info!(app = %id, pid, port = record.port, "app started");
                Ok(record)
            }
        }
    }

    /// Forcibly terminate a running app's whole process group and record
    /// status `stop`. An app without a live handle is an error, and the
    /// registry is left untouched in that case.
    pub async fn kill(&self, id: &str) -> AgentResult<AppRecord> {
        self.registry.get(id).await?;
        let commands = match self.procs.get(id) {
            Some(handle) => handle.commands.clone(),
            None => {
                return Err(AgentError::NotFound(format!("app {id} is not running")));
            }
        };

        let (reply, outcome) = oneshot::channel();
        if commands.send(ProcessCommand::Stop { reply }).is_err() {
            // The monitor exited between the handle lookup and the send;
            // whatever it recorded stands.
            return self.registry.get(id).await;
        }
        match outcome.await {
            Ok(result) => result?,
            Err(_) => warn!(app = %id, "monitor dropped the stop reply"),
        }
        self.registry.get(id).await
    }

    /// Kill, wait out the restart delay, then start again. Status `restart`
    /// marks the gap so the app's domains stay in any table built meanwhile.
    pub async fn restart(self: &Arc<Self>, id: &str) -> AgentResult<AppRecord> {
        self.kill(id).await?;
        self.registry
            .update(id, AppPatch::status(AppStatus::Restart))
            .await?;
        tokio::time::sleep(self.timing.restart_delay()).await;
        self.start(id).await
    }

    /// Start every app the registry says was running before the agent went
    /// down. Individual failures are logged and skipped.
    pub async fn resume_running_apps(self: &Arc<Self>) {
        for record in self.registry.list().await {
            if matches!(
                record.status,
                AppStatus::Stop | AppStatus::Error | AppStatus::Created
            ) {
                continue;
            }
            info!(app = %record.id, status = ?record.status, "resuming app from previous run");
            if let Err(err) = self.start(&record.id).await {
                warn!(app = %record.id, %err, "could not resume app");
            }
        }
    }

    fn launch(&self, record: &AppRecord) -> AgentResult<Child> {
        let stdout = append_log(&record.stdout_log)?;
        let stderr = append_log(&record.stderr_log)?;

        let mut command = Command::new(self.runtime.node_bin(&record.runtime));
        command
            .arg(&record.main)
            .current_dir(self.paths.app_dir(&record.id))
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        for (key, value) in &record.env {
            command.env(key, value.as_env_string());
        }
        command.env(PORT_VAR, record.port.to_string());
        #[cfg(unix)]
        command.process_group(0);

        Ok(command.spawn()?)
    }

    /// Steady-state watcher, spawned once an app clears its grace window.
    /// Owns the child; exits once the process is gone.
    async fn monitor(
        self: Arc<Self>,
        id: String,
        mut child: Child,
        pid: u32,
        mut commands: mpsc::UnboundedReceiver<ProcessCommand>,
    ) {
        let mut commands_open = true;
        loop {
            tokio::select! {
                exited = child.wait() => {
                    self.procs.remove(&id);
                    match exited {
                        Ok(status) => info!(app = %id, %status, "process exited"),
                        Err(err) => warn!(app = %id, %err, "lost track of process"),
                    }
                    if let Err(err) = self
                        .registry
                        .update(&id, AppPatch::status(AppStatus::Exit))
                        .await
                    {
                        warn!(app = %id, %err, "failed to record exit");
                    }
                    break;
                }
                command = commands.recv(), if commands_open => {
                    match command {
                        Some(ProcessCommand::Stop { reply }) => {
                            let killed = kill_group(pid);
                            if killed.is_ok() {
                                let _ = child.wait().await;
                            }
                            self.procs.remove(&id);
                            let outcome = match killed {
                                Ok(()) => self
                                    .registry
                                    .update(&id, AppPatch::status(AppStatus::Stop))
                                    .await
                                    .map(|_| ()),
                                Err(err) => Err(AgentError::Internal(format!(
                                    "could not kill process group {pid}: {err}"
                                ))),
                            };
                            let _ = reply.send(outcome);
                            break;
                        }
                        None => commands_open = false,
                    }
                }
            }
        }
    }

    async fn record_start_failure(&self, id: &str, detail: &str) {
        let patch = AppPatch {
            status: Some(AppStatus::Error),
            logs: Some(Some(detail.to_string())),
            ..Default::default()
        };
        if let Err(err) = self.registry.update(id, patch).await {
            warn!(app = %id, %err, "failed to record start failure");
        }
    }
}

fn append_log(path: &Path) -> AgentResult<std::fs::File> {
    Ok(std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?)
}

/// Last stretch of the stderr log, for startup failure reports.
async fn stderr_tail(path: &Path) -> Option<String> {
    let bytes = tokio::fs::read(path).await.ok()?;
    let start = bytes.len().saturating_sub(LOG_TAIL_BYTES);
    let tail = String::from_utf8_lossy(&bytes[start..]).trim().to_string();
    if tail.is_empty() {
        None
    } else {
        Some(tail)
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) -> std::io::Result<()> {
    // pid 0 would signal our own process group
    if pid == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "refusing to signal pid 0",
        ));
    }
    let ret = unsafe { libc::kill(-(pid as i32), libc::SIGKILL) };
    if ret == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    // The group vanishing on its own achieves what the signal was for.
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "process group signalling requires unix",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        paths: PathsConfig,
        registry: Arc<AppRegistry>,
        supervisor: Arc<Supervisor>,
        events: mpsc::UnboundedReceiver<SupervisorEvent>,
    }

    /// Test runtime tree whose `node` hands the main script to `/bin/sh`.
    async fn harness(grace_secs: u64) -> Harness {
        let dir = TempDir::new().unwrap();
        let paths = PathsConfig {
            data_dir: dir.path().to_path_buf(),
        };
        tokio::fs::create_dir_all(paths.apps_dir()).await.unwrap();
        tokio::fs::create_dir_all(paths.logs_dir()).await.unwrap();

        let bin = dir.path().join("runtime").join("v0.0.1").join("bin");
        tokio::fs::create_dir_all(&bin).await.unwrap();
        let node = bin.join("node");
        tokio::fs::write(&node, "#!/bin/sh\nexec /bin/sh \"$@\"\n")
            .await
            .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&node, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let registry = Arc::new(AppRegistry::open(&paths).await.unwrap());
        let runtime = RuntimeManager::new(
            RuntimeConfig {
                root_dir: dir.path().join("runtime"),
                installer: PathBuf::from("/bin/true"),
            },
            Duration::from_secs(1),
        );
        let timing = TimingConfig {
            startup_grace_secs: grace_secs,
            restart_delay_secs: 0,
            ..TimingConfig::default()
        };
        let (supervisor, events) =
            Supervisor::new(registry.clone(), paths.clone(), runtime, timing);
        Harness {
            _dir: dir,
            paths,
            registry,
            supervisor,
            events,
        }
    }

    /// Registers an app whose main is a shell script with the given body.
    async fn install_app(h: &Harness, id: &str, script: &str) {
        h.registry.create(id, BTreeMap::new()).await.unwrap();
        let app_dir = h.paths.app_dir(id);
        tokio::fs::create_dir_all(&app_dir).await.unwrap();
        tokio::fs::write(
            app_dir.join("package.json"),
            format!(
                r#"{{"main":"app.sh","engines":{{"node":"0.0.1"}},"domains":["{id}.test"]}}"#
            ),
        )
        .await
        .unwrap();
        tokio::fs::write(app_dir.join("app.sh"), script).await.unwrap();
    }

    async fn wait_for_status(h: &Harness, id: &str, want: AppStatus) {
        for _ in 0..100 {
            if h.registry.get(id).await.unwrap().status == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!(
            "app {id} never reached {want:?}, stuck at {:?}",
            h.registry.get(id).await.unwrap().status
        );
    }

    #[tokio::test]
    async fn test_start_unknown_app() {
        let h = harness(0).await;
        let err = h.supervisor.start("ghost").await.unwrap_err();
        assert!(matches!(err, AgentError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_start_without_package_records_error() {
        let h = harness(0).await;
        h.registry.create("bare", BTreeMap::new()).await.unwrap();

        let err = h.supervisor.start("bare").await.unwrap_err();
        assert!(matches!(err, AgentError::Validation(_)));

        let record = h.registry.get("bare").await.unwrap();
        assert_eq!(record.status, AppStatus::Error);
        assert!(record.logs.is_some());
        assert!(!h.supervisor.is_running("bare"));
    }

    #[tokio::test]
    async fn test_start_and_kill() {
        let mut h = harness(0).await;
        install_app(&h, "runner", "sleep 30\n").await;

        let record = h.supervisor.start("runner").await.unwrap();
        assert_eq!(record.status, AppStatus::Start);
        assert_eq!(record.domains, vec!["runner.test".to_string()]);
        assert!(record.logs.is_none());
        assert!(h.supervisor.is_running("runner"));
        assert_eq!(h.supervisor.running(), vec!["runner".to_string()]);

        match h.events.try_recv().unwrap() {
            SupervisorEvent::Started { id } => assert_eq!(id, "runner"),
        }

        let record = h.supervisor.kill("runner").await.unwrap();
        assert_eq!(record.status, AppStatus::Stop);
        assert!(!h.supervisor.is_running("runner"));
    }

    #[tokio::test]
    async fn test_crash_inside_grace_window() {
        let h = harness(2).await;
        install_app(&h, "crasher", "echo boom >&2\nexit 3\n").await;

        let err = h.supervisor.start("crasher").await.unwrap_err();
        assert!(err.to_string().contains("boom"));

        let record = h.registry.get("crasher").await.unwrap();
        assert_eq!(record.status, AppStatus::Error);
        assert!(record.logs.as_deref().unwrap().contains("boom"));
        assert!(!h.supervisor.is_running("crasher"));
    }

    #[tokio::test]
    async fn test_double_start_conflicts() {
        let h = harness(0).await;
        install_app(&h, "dup", "sleep 30\n").await;

        h.supervisor.start("dup").await.unwrap();
        let err = h.supervisor.start("dup").await.unwrap_err();
        assert!(matches!(err, AgentError::Conflict(_)));

        h.supervisor.kill("dup").await.unwrap();
    }

    #[tokio::test]
    async fn test_kill_without_handle() {
        let h = harness(0).await;
        install_app(&h, "idle", "sleep 30\n").await;

        let err = h.supervisor.kill("idle").await.unwrap_err();
        assert!(matches!(err, AgentError::NotFound(_)));
        // Registry state is untouched by a failed kill.
        assert_eq!(
            h.registry.get("idle").await.unwrap().status,
            AppStatus::Created
        );

        let err = h.supervisor.kill("ghost").await.unwrap_err();
        assert!(matches!(err, AgentError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unsolicited_exit() {
        let h = harness(0).await;
        install_app(&h, "brief", "sleep 0.3\nexit 0\n").await;

        h.supervisor.start("brief").await.unwrap();
        wait_for_status(&h, "brief", AppStatus::Exit).await;
        assert!(!h.supervisor.is_running("brief"));
    }

    #[tokio::test]
    async fn test_restart() {
        let mut h = harness(0).await;
        install_app(&h, "cycle", "sleep 30\n").await;

        h.supervisor.start("cycle").await.unwrap();
        let record = h.supervisor.restart("cycle").await.unwrap();
        assert_eq!(record.status, AppStatus::Start);
        assert!(h.supervisor.is_running("cycle"));

        // One Started event per successful start.
        let mut started = 0;
        while h.events.try_recv().is_ok() {
            started += 1;
        }
        assert_eq!(started, 2);

        h.supervisor.kill("cycle").await.unwrap();

        // Restart needs a live handle, same as kill.
        let err = h.supervisor.restart("cycle").await.unwrap_err();
        assert!(matches!(err, AgentError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_resume_skips_stopped_and_broken() {
        let h = harness(0).await;
        install_app(&h, "wasup", "sleep 30\n").await;
        install_app(&h, "wasdown", "sleep 30\n").await;
        h.registry
            .update("wasup", AppPatch::status(AppStatus::Ok))
            .await
            .unwrap();
        h.registry
            .update("wasdown", AppPatch::status(AppStatus::Stop))
            .await
            .unwrap();

        h.supervisor.resume_running_apps().await;

        assert!(h.supervisor.is_running("wasup"));
        assert!(!h.supervisor.is_running("wasdown"));

        h.supervisor.kill("wasup").await.unwrap();
    }
}
