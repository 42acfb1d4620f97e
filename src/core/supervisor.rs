//! Process supervision - Spawning, signalling and tracking instance runs

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::config::InstanceRegistry;
use super::error::{ManagerError, Result};
use super::ingest::StreamIngester;
use super::instance::{InstanceConfig, InstanceState, RunRecord, RunStatus};
use super::log_entry::{LogEntry, LogQuery, StreamKind};
use crate::persistence::{InstanceStateStore, LogStore};
use crate::platform;

/// How often an adopted instance is checked for exit
const ADOPTED_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// A successfully launched run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartedRun {
    pub instance_name: String,
    pub start_id: i64,
    pub pid: u32,
    pub start_time: DateTime<Utc>,
}

/// Snapshot of an instance's current and latest run
#[derive(Debug, Clone, Serialize)]
pub struct InstanceReport {
    pub instance_name: String,
    pub state: Option<InstanceState>,
    pub latest_run: Option<RunRecord>,
    /// The recorded pid still refers to the recorded process
    pub alive: bool,
    /// This manager owns the run's stdin
    pub attached: bool,
}

/// Outcome of reconciling persisted state at startup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub adopted: Vec<String>,
    pub cleared: Vec<String>,
}

/// Resolves when an attached run has finished
pub struct RunExit {
    receiver: watch::Receiver<Option<RunStatus>>,
}

impl RunExit {
    /// Final status of the run, or `None` if its watcher went away
    pub async fn wait(mut self) -> Option<RunStatus> {
        let status = match self.receiver.wait_for(Option::is_some).await {
            Ok(status) => *status,
            Err(_) => None,
        };
        status
    }
}

/// In-memory view of a name this manager is working on
enum Slot {
    /// A start is in flight
    Starting,
    /// Spawned by this manager, stdin held here
    Attached(AttachedRun),
}

struct AttachedRun {
    start_id: i64,
    pid: u32,
    stdin: Arc<tokio::sync::Mutex<Option<ChildStdin>>>,
    stop_requested: Arc<AtomicBool>,
}

struct Shared {
    registry: Arc<InstanceRegistry>,
    logs: Arc<LogStore>,
    states: Arc<InstanceStateStore>,
    stop_command: String,
    slots: Mutex<HashMap<String, Slot>>,
    /// Exit signal of the most recent attached run per name, kept after it ends
    exits: Mutex<HashMap<String, watch::Receiver<Option<RunStatus>>>>,
}

/// Starts instances, delivers commands to them and records their lifecycle.
///
/// Cheap to clone; clones share the same bookkeeping.
#[derive(Clone)]
pub struct ProcessSupervisor {
    shared: Arc<Shared>,
}

impl ProcessSupervisor {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        logs: Arc<LogStore>,
        states: Arc<InstanceStateStore>,
        stop_command: impl Into<String>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry,
                logs,
                states,
                stop_command: stop_command.into(),
                slots: Mutex::new(HashMap::new()),
                exits: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn logs(&self) -> &Arc<LogStore> {
        &self.shared.logs
    }

    pub fn states(&self) -> &Arc<InstanceStateStore> {
        &self.shared.states
    }

    fn slots(&self) -> Result<MutexGuard<'_, HashMap<String, Slot>>> {
        self.shared.slots()
    }

    // === Lifecycle ===

    /// Launch an instance and return as soon as it is running
    pub async fn start(&self, name: &str) -> Result<StartedRun> {
        let registry = Arc::clone(&self.shared.registry);
        let owned = name.to_string();
        let config = blocking(move || registry.resolve_config(&owned)).await?;

        self.reserve(name)?;
        let result = self.launch(config).await;
        if result.is_err() {
            self.release(name);
        }
        result
    }

    fn reserve(&self, name: &str) -> Result<()> {
        let mut slots = self.slots()?;
        if slots.contains_key(name) {
            return Err(ManagerError::AlreadyRunning(name.to_string()));
        }
        slots.insert(name.to_string(), Slot::Starting);
        Ok(())
    }

    fn release(&self, name: &str) {
        if let Ok(mut slots) = self.slots() {
            if matches!(slots.get(name), Some(Slot::Starting)) {
                slots.remove(name);
            }
        }
    }

    async fn launch(&self, config: InstanceConfig) -> Result<StartedRun> {
        let name = config.name.clone();

        if let Some(state) = self.load_state(&name).await? {
            if platform::is_same_process(state.pid, state.process_started_at) {
                info!(
                    "Instance '{}' is already running as pid {} (run #{})",
                    name, state.pid, state.start_id
                );
                return Err(ManagerError::AlreadyRunning(name));
            }
            warn!(
                "Clearing stale state for '{}': pid {} is gone",
                name, state.pid
            );
            self.shared.retire(&state, RunStatus::Crashed).await;
        }

        let logs = Arc::clone(&self.shared.logs);
        let owned = name.clone();
        let run = blocking(move || logs.begin_run(&owned)).await?;

        info!(
            "Spawning instance '{}' (run #{}) from {:?}",
            name, run.start_id, config.executable_path
        );
        let mut cmd = Command::new(&config.executable_path);
        cmd.args(&config.args)
            .current_dir(&config.work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        platform::detach(&mut cmd);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                error!("Failed to spawn '{}': {}", name, source);
                self.shared
                    .finish(&name, run.start_id, RunStatus::Crashed, None)
                    .await;
                return Err(ManagerError::SpawnFailed { name, source });
            }
        };

        let registered = match self.register(&run, &mut child).await {
            Ok(registered) => registered,
            Err(e) => {
                // Never leave an orphan behind a failed start
                error!(
                    "Start of '{}' failed after spawn, killing the process: {}",
                    name, e
                );
                if let Err(kill_err) = child.start_kill() {
                    warn!("Failed to kill pid {:?}: {}", child.id(), kill_err);
                }
                let _ = child.wait().await;
                self.shared
                    .finish(&name, run.start_id, RunStatus::Crashed, None)
                    .await;
                let states = Arc::clone(&self.shared.states);
                let owned = name.clone();
                let start_id = run.start_id;
                let _ = blocking(move || states.remove_if_run(&owned, start_id)).await;
                return Err(e);
            }
        };

        let started = self.attach(run, registered, child)?;
        info!(
            "Started instance '{}' as pid {} (run #{})",
            started.instance_name, started.pid, started.start_id
        );
        Ok(started)
    }

    /// Record the spawned pid in the run and the state store
    async fn register(&self, run: &RunRecord, child: &mut Child) -> Result<InstanceState> {
        let pid = child.id().ok_or_else(|| ManagerError::SpawnFailed {
            name: run.instance_name.clone(),
            source: std::io::Error::other("process exited before its pid was read"),
        })?;

        let logs = Arc::clone(&self.shared.logs);
        let states = Arc::clone(&self.shared.states);
        let state = InstanceState {
            instance_name: run.instance_name.clone(),
            pid,
            start_id: run.start_id,
            start_time: run.start_time,
            process_started_at: None,
        };

        blocking(move || {
            let state = InstanceState {
                process_started_at: platform::process_start_time(pid),
                ..state
            };
            logs.mark_running(&state.instance_name, state.start_id, pid)?;
            states.update(state.clone())?;
            Ok(state)
        })
        .await
    }

    /// Hook up ingesters and the exit watcher, and publish the run as attached
    fn attach(
        &self,
        run: RunRecord,
        state: InstanceState,
        mut child: Child,
    ) -> Result<StartedRun> {
        let name = run.instance_name.clone();
        let stdin = Arc::new(tokio::sync::Mutex::new(child.stdin.take()));
        let stop_requested = Arc::new(AtomicBool::new(false));
        let (exit_tx, exit_rx) = watch::channel(None);

        let logs = &self.shared.logs;
        let stdout = child.stdout.take().map(|out| {
            StreamIngester::new(&name, run.start_id, StreamKind::Stdout, Arc::clone(logs)).spawn(out)
        });
        let stderr = child.stderr.take().map(|err| {
            StreamIngester::new(&name, run.start_id, StreamKind::Stderr, Arc::clone(logs)).spawn(err)
        });

        // Published before the watcher exists so its cleanup always finds the slot
        self.slots()?.insert(
            name.clone(),
            Slot::Attached(AttachedRun {
                start_id: run.start_id,
                pid: state.pid,
                stdin,
                stop_requested: Arc::clone(&stop_requested),
            }),
        );
        if let Ok(mut exits) = self.shared.exits.lock() {
            exits.insert(name.clone(), exit_rx);
        }

        let shared = Arc::clone(&self.shared);
        let watcher_name = name.clone();
        let watcher_stop = stop_requested;
        let start_id = run.start_id;
        tokio::spawn(async move {
            let mut lines = 0;
            for handle in [stdout, stderr].into_iter().flatten() {
                match handle.await {
                    Ok(count) => lines += count,
                    Err(e) => error!("Ingester of '{}' failed: {}", watcher_name, e),
                }
            }

            let (status, exit_code) = match child.wait().await {
                Ok(exit) => {
                    let status = if watcher_stop.load(Ordering::SeqCst) || exit.success() {
                        RunStatus::Stopped
                    } else {
                        RunStatus::Crashed
                    };
                    (status, exit.code())
                }
                Err(e) => {
                    error!("Failed to reap '{}': {}", watcher_name, e);
                    (RunStatus::Crashed, None)
                }
            };
            info!(
                "Instance '{}' (run #{}) exited with {:?} after {} line(s): {}",
                watcher_name, start_id, exit_code, lines, status
            );

            shared.complete(&watcher_name, start_id, status, exit_code).await;
            let _ = exit_tx.send(Some(status));
        });

        Ok(StartedRun {
            instance_name: name,
            start_id: run.start_id,
            pid: state.pid,
            start_time: run.start_time,
        })
    }

    /// Write one line to the instance's stdin
    pub async fn send_command(&self, name: &str, text: &str) -> Result<()> {
        self.deliver(name, text).await?;
        info!("Sent command to instance '{}': {}", name, text);
        Ok(())
    }

    /// Ask the instance to shut down through its own console
    pub async fn stop(&self, name: &str) -> Result<()> {
        let stop_command = self.shared.stop_command.clone();
        let start_id = self.deliver(name, &stop_command).await?;

        if let Some(Slot::Attached(run)) = self.slots()?.get(name) {
            run.stop_requested.store(true, Ordering::SeqCst);
        }
        self.shared
            .set_status(name, start_id, RunStatus::Stopping)
            .await;
        info!("Requested stop of instance '{}'", name);
        Ok(())
    }

    async fn deliver(&self, name: &str, text: &str) -> Result<i64> {
        let state = self
            .load_state(name)
            .await?
            .ok_or_else(|| ManagerError::InstanceNotRunning(name.to_string()))?;

        if !platform::is_same_process(state.pid, state.process_started_at) {
            warn!(
                "Instance '{}' is recorded as pid {} but that process is gone",
                name, state.pid
            );
            self.shared.retire(&state, RunStatus::Crashed).await;
            return Err(ManagerError::ProcessSignalFailed {
                pid: state.pid,
                reason: "process no longer exists".to_string(),
            });
        }

        let stdin = match self.slots()?.get(name) {
            Some(Slot::Attached(run)) if run.start_id == state.start_id => Arc::clone(&run.stdin),
            _ => return Err(ManagerError::StdinDetached(name.to_string())),
        };

        let mut guard = stdin.lock().await;
        let Some(pipe) = guard.as_mut() else {
            return Err(ManagerError::ProcessSignalFailed {
                pid: state.pid,
                reason: "stdin is closed".to_string(),
            });
        };
        if let Err(e) = write_line(pipe, text).await {
            *guard = None;
            return Err(ManagerError::ProcessSignalFailed {
                pid: state.pid,
                reason: e.to_string(),
            });
        }
        Ok(state.start_id)
    }

    /// Kill the recorded process and clear its state regardless of the outcome
    pub async fn force_stop(&self, name: &str) -> Result<()> {
        let state = self
            .load_state(name)
            .await?
            .ok_or_else(|| ManagerError::InstanceNotRunning(name.to_string()))?;

        // Detach so a new start does not wait for the old streams to drain
        let attached = {
            let mut slots = self.slots()?;
            match slots.get(name) {
                Some(Slot::Attached(run)) if run.start_id == state.start_id => {
                    run.stop_requested.store(true, Ordering::SeqCst);
                    slots.remove(name);
                    true
                }
                _ => false,
            }
        };
        self.shared
            .set_status(name, state.start_id, RunStatus::Stopping)
            .await;

        let signal = if platform::is_same_process(state.pid, state.process_started_at) {
            platform::kill_process(state.pid).map_err(|e| e.to_string())
        } else {
            Err("process no longer exists".to_string())
        };

        let states = Arc::clone(&self.shared.states);
        let owned = name.to_string();
        if let Err(e) = blocking(move || states.remove(&owned)).await {
            error!("Failed to clear state of '{}': {}", name, e);
        }

        if !attached {
            let status = if signal.is_ok() {
                RunStatus::Stopped
            } else {
                RunStatus::Crashed
            };
            self.shared.finish(name, state.start_id, status, None).await;
        }

        match signal {
            Ok(()) => {
                info!("Forcefully stopped instance '{}' (pid {})", name, state.pid);
                Ok(())
            }
            Err(reason) => {
                warn!(
                    "Could not kill instance '{}' (pid {}): {}",
                    name, state.pid, reason
                );
                Err(ManagerError::ProcessSignalFailed {
                    pid: state.pid,
                    reason,
                })
            }
        }
    }

    /// Resolves when the latest run this manager attached for `name` ends.
    ///
    /// Stays available after the run is over and then resolves immediately.
    pub fn exit_signal(&self, name: &str) -> Option<RunExit> {
        let exits = self.shared.exits.lock().ok()?;
        exits.get(name).map(|receiver| RunExit {
            receiver: receiver.clone(),
        })
    }

    /// Wait for the latest attached run of `name` to end; `None` if there never was one
    pub async fn wait_for_exit(&self, name: &str) -> Option<RunStatus> {
        match self.exit_signal(name) {
            Some(exit) => exit.wait().await,
            None => None,
        }
    }

    // === Recovery ===

    /// Adopt still-running instances from an earlier session and clear dead ones
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let states = Arc::clone(&self.shared.states);
        let recorded = blocking(move || states.all()).await?;
        let mut report = ReconcileReport::default();

        for state in recorded {
            let name = state.instance_name.clone();
            if self.slots()?.contains_key(&name) {
                continue;
            }

            if platform::is_same_process(state.pid, state.process_started_at) {
                info!(
                    "Adopting running instance '{}' (pid {}, run #{})",
                    name, state.pid, state.start_id
                );
                self.shared.adopt(&state).await;
                let shared = Arc::clone(&self.shared);
                tokio::spawn(async move { shared.watch_adopted(state).await });
                report.adopted.push(name);
            } else {
                warn!(
                    "Instance '{}' (pid {}) exited while unsupervised",
                    name, state.pid
                );
                self.shared.retire(&state, RunStatus::Crashed).await;
                report.cleared.push(name);
            }
        }

        Ok(report)
    }

    // === Queries ===

    /// Names of all configured instances
    pub async fn list_instances(&self) -> Result<Vec<String>> {
        let registry = Arc::clone(&self.shared.registry);
        blocking(move || registry.list_instances()).await
    }

    /// Every recorded instance state, attached or not
    pub async fn running(&self) -> Result<Vec<InstanceState>> {
        let states = Arc::clone(&self.shared.states);
        blocking(move || states.all()).await
    }

    pub async fn query_logs(&self, name: &str, query: LogQuery) -> Result<Vec<LogEntry>> {
        let logs = Arc::clone(&self.shared.logs);
        let owned = name.to_string();
        blocking(move || logs.query(&owned, &query)).await
    }

    pub async fn runs(&self, name: &str) -> Result<Vec<RunRecord>> {
        let logs = Arc::clone(&self.shared.logs);
        let owned = name.to_string();
        blocking(move || logs.runs(&owned)).await
    }

    pub async fn status(&self, name: &str) -> Result<InstanceReport> {
        let state = self.load_state(name).await?;
        let logs = Arc::clone(&self.shared.logs);
        let owned = name.to_string();
        let latest_run = blocking(move || logs.latest_run(&owned)).await?;

        let alive = state
            .as_ref()
            .is_some_and(|s| platform::is_same_process(s.pid, s.process_started_at));
        let attached = match (self.slots()?.get(name), &state) {
            (Some(Slot::Attached(run)), Some(s)) => run.start_id == s.start_id && run.pid == s.pid,
            _ => false,
        };

        Ok(InstanceReport {
            instance_name: name.to_string(),
            state,
            latest_run,
            alive,
            attached,
        })
    }

    /// Drop finished runs older than the retention window
    pub async fn cleanup_logs(&self, retention_days: u32) -> Result<usize> {
        let logs = Arc::clone(&self.shared.logs);
        blocking(move || logs.cleanup(retention_days)).await
    }

    async fn load_state(&self, name: &str) -> Result<Option<InstanceState>> {
        let states = Arc::clone(&self.shared.states);
        let owned = name.to_string();
        blocking(move || states.get(&owned)).await
    }
}

impl Shared {
    fn slots(&self) -> Result<MutexGuard<'_, HashMap<String, Slot>>> {
        self.slots
            .lock()
            .map_err(|_| ManagerError::LockPoisoned("supervisor"))
    }

    /// Final bookkeeping once an attached run's streams closed and it was reaped
    async fn complete(
        self: &Arc<Self>,
        name: &str,
        start_id: i64,
        status: RunStatus,
        exit_code: Option<i32>,
    ) {
        self.finish(name, start_id, status, exit_code).await;

        let states = Arc::clone(&self.states);
        let owned = name.to_string();
        if let Err(e) = blocking(move || states.remove_if_run(&owned, start_id)).await {
            error!("Failed to clear state of '{}': {}", name, e);
        }

        if let Ok(mut slots) = self.slots() {
            if matches!(slots.get(name), Some(Slot::Attached(run)) if run.start_id == start_id) {
                slots.remove(name);
            }
        }
    }

    /// Clear a state whose process is gone and close its run
    async fn retire(self: &Arc<Self>, state: &InstanceState, status: RunStatus) {
        let states = Arc::clone(&self.states);
        let name = state.instance_name.clone();
        let start_id = state.start_id;
        if let Err(e) = blocking(move || states.remove_if_run(&name, start_id)).await {
            error!(
                "Failed to clear stale state of '{}': {}",
                state.instance_name, e
            );
        }
        self.finish(&state.instance_name, state.start_id, status, None)
            .await;
    }

    async fn adopt(self: &Arc<Self>, state: &InstanceState) {
        let logs = Arc::clone(&self.logs);
        let name = state.instance_name.clone();
        let start_id = state.start_id;
        let result = blocking(move || match logs.get_run(&name, start_id)? {
            Some(run) if run.status == RunStatus::Starting => {
                logs.set_status(&name, start_id, RunStatus::Running)
            }
            _ => Ok(()),
        })
        .await;
        if let Err(e) = result {
            warn!(
                "Failed to update run #{} of '{}': {}",
                state.start_id, state.instance_name, e
            );
        }
    }

    /// Poll an adopted instance until it exits, then close its run
    async fn watch_adopted(self: Arc<Self>, state: InstanceState) {
        let mut interval = tokio::time::interval(ADOPTED_POLL_INTERVAL);
        loop {
            interval.tick().await;
            if !platform::is_same_process(state.pid, state.process_started_at) {
                break;
            }
        }

        let logs = Arc::clone(&self.logs);
        let name = state.instance_name.clone();
        let start_id = state.start_id;
        let status = match blocking(move || logs.get_run(&name, start_id)).await {
            Ok(Some(run)) if run.status == RunStatus::Stopping => RunStatus::Stopped,
            _ => RunStatus::Crashed,
        };
        info!(
            "Adopted instance '{}' (pid {}) exited",
            state.instance_name, state.pid
        );
        self.retire(&state, status).await;
    }

    async fn finish(
        self: &Arc<Self>,
        name: &str,
        start_id: i64,
        status: RunStatus,
        exit_code: Option<i32>,
    ) {
        let logs = Arc::clone(&self.logs);
        let owned = name.to_string();
        if let Err(e) = blocking(move || logs.finish_run(&owned, start_id, status, exit_code)).await
        {
            error!("Failed to close run #{} of '{}': {}", start_id, name, e);
        }
    }

    async fn set_status(self: &Arc<Self>, name: &str, start_id: i64, status: RunStatus) {
        let logs = Arc::clone(&self.logs);
        let owned = name.to_string();
        if let Err(e) = blocking(move || logs.set_status(&owned, start_id, status)).await {
            warn!(
                "Failed to mark run #{} of '{}' as {}: {}",
                start_id, name, status, e
            );
        }
    }
}

async fn write_line(pipe: &mut ChildStdin, text: &str) -> std::io::Result<()> {
    let mut line = String::with_capacity(text.len() + 1);
    line.push_str(text);
    line.push('\n');
    pipe.write_all(line.as_bytes()).await?;
    pipe.flush().await?;
    debug!("Wrote {} byte(s) to stdin", line.len());
    Ok(())
}

/// Run synchronous store or filesystem work off the async workers
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::config::ConfigFile;
    use std::path::PathBuf;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _temp: TempDir,
        registry: Arc<InstanceRegistry>,
        supervisor: ProcessSupervisor,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = tempdir().unwrap();
            let registry = Arc::new(InstanceRegistry::new(temp.path().join("instances")));
            let logs = Arc::new(LogStore::open_in_memory().unwrap());
            let states =
                Arc::new(InstanceStateStore::open(temp.path().join("state.json")).unwrap());
            let supervisor =
                ProcessSupervisor::new(Arc::clone(&registry), logs, states, "stop");
            Self {
                _temp: temp,
                registry,
                supervisor,
            }
        }

        /// Configure `name` to run a shell script
        fn script(&self, name: &str, script: &str) {
            let config = ConfigFile::Command {
                executable: PathBuf::from("/bin/sh"),
                args: vec!["-c".to_string(), script.to_string()],
                work_dir: None,
            };
            self.registry.save_config(name, &config).unwrap();
        }
    }

    const ECHO_UNTIL_STOP: &str = r#"echo "[12:00:01] [Server/INFO]: Hello"
while read line; do
  if [ "$line" = "stop" ]; then echo "[12:00:02] [Server/INFO]: Stopping"; exit 0; fi
  echo "[12:00:03] [Server/INFO]: got $line"
done"#;

    #[tokio::test]
    async fn test_start_ingests_output_and_finishes() {
        let fx = Fixture::new();
        fx.script("lobby", "echo '[12:00:01] [Server/INFO]: Hello'; echo 'plain' >&2");

        let started = fx.supervisor.start("lobby").await.unwrap();
        assert_eq!(started.start_id, 1);
        assert_eq!(
            fx.supervisor.wait_for_exit("lobby").await,
            Some(RunStatus::Stopped)
        );

        let entries = fx
            .supervisor
            .query_logs("lobby", LogQuery::for_run(started.start_id))
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        let hello = entries.iter().find(|e| e.message == "Hello").unwrap();
        assert_eq!(hello.thread, "Server");
        let plain = entries.iter().find(|e| e.message == "plain").unwrap();
        assert_eq!(plain.thread, "System");
        assert_eq!(plain.stream, StreamKind::Stderr);

        let run = fx.supervisor.runs("lobby").await.unwrap().remove(0);
        assert_eq!(run.status, RunStatus::Stopped);
        assert_eq!(run.exit_code, Some(0));
        assert!(fx.supervisor.states().get("lobby").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failing_process_is_crashed() {
        let fx = Fixture::new();
        fx.script("broken", "echo boom >&2; exit 3");

        fx.supervisor.start("broken").await.unwrap();
        assert_eq!(
            fx.supervisor.wait_for_exit("broken").await,
            Some(RunStatus::Crashed)
        );
        let run = fx.supervisor.runs("broken").await.unwrap().remove(0);
        assert_eq!(run.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_commands_and_graceful_stop() {
        let fx = Fixture::new();
        fx.script("lobby", ECHO_UNTIL_STOP);

        let started = fx.supervisor.start("lobby").await.unwrap();
        let state = fx.supervisor.states().get("lobby").unwrap().unwrap();
        assert_eq!(state.pid, started.pid);
        assert_eq!(state.start_id, started.start_id);

        fx.supervisor.send_command("lobby", "list").await.unwrap();
        fx.supervisor.stop("lobby").await.unwrap();
        assert_eq!(
            fx.supervisor.wait_for_exit("lobby").await,
            Some(RunStatus::Stopped)
        );

        let messages: Vec<String> = fx
            .supervisor
            .query_logs("lobby", LogQuery::latest())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(messages, vec!["Hello", "got list", "Stopping"]);
        assert!(fx.supervisor.states().get("lobby").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stop_without_state_is_not_running() {
        let fx = Fixture::new();
        fx.script("lobby", ECHO_UNTIL_STOP);
        let err = fx.supervisor.stop("lobby").await.unwrap_err();
        assert!(matches!(err, ManagerError::InstanceNotRunning(ref n) if n == "lobby"));
    }

    #[tokio::test]
    async fn test_start_rejects_missing_config() {
        let fx = Fixture::new();
        let err = fx.supervisor.start("nope").await.unwrap_err();
        assert!(matches!(err, ManagerError::ConfigNotFound { .. }));
        assert!(fx.supervisor.runs("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let fx = Fixture::new();
        fx.script("lobby", ECHO_UNTIL_STOP);

        fx.supervisor.start("lobby").await.unwrap();
        let err = fx.supervisor.start("lobby").await.unwrap_err();
        assert!(matches!(err, ManagerError::AlreadyRunning(_)));
        assert_eq!(fx.supervisor.runs("lobby").await.unwrap().len(), 1);

        fx.supervisor.force_stop("lobby").await.unwrap();
    }

    #[tokio::test]
    async fn test_force_stop_clears_state_and_next_run_is_newer() {
        let fx = Fixture::new();
        fx.script("lobby", "echo up; exec sleep 30");

        let first = fx.supervisor.start("lobby").await.unwrap();
        let exit = fx.supervisor.exit_signal("lobby").unwrap();
        fx.supervisor.force_stop("lobby").await.unwrap();
        assert!(fx.supervisor.states().get("lobby").unwrap().is_none());

        let second = fx.supervisor.start("lobby").await.unwrap();
        assert!(second.start_id > first.start_id);

        assert_eq!(exit.wait().await, Some(RunStatus::Stopped));
        let running = fx.supervisor.running().await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].start_id, second.start_id);

        fx.supervisor.force_stop("lobby").await.unwrap();
        let runs = fx.supervisor.runs("lobby").await.unwrap();
        assert_eq!(runs.len(), 2);
        assert!(fx.supervisor.running().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_force_stop_without_state() {
        let fx = Fixture::new();
        let err = fx.supervisor.force_stop("lobby").await.unwrap_err();
        assert!(matches!(err, ManagerError::InstanceNotRunning(_)));
    }

    #[tokio::test]
    async fn test_dead_pid_is_cleaned_up() {
        let fx = Fixture::new();
        fx.script("lobby", ECHO_UNTIL_STOP);

        let mut gone = std::process::Command::new("true").spawn().unwrap();
        let pid = gone.id();
        gone.wait().unwrap();

        let run = fx.supervisor.logs().begin_run("lobby").unwrap();
        fx.supervisor
            .states()
            .update(InstanceState {
                instance_name: "lobby".to_string(),
                pid,
                start_id: run.start_id,
                start_time: run.start_time,
                process_started_at: None,
            })
            .unwrap();

        let err = fx.supervisor.send_command("lobby", "say hi").await.unwrap_err();
        assert!(matches!(err, ManagerError::ProcessSignalFailed { pid: p, .. } if p == pid));
        assert!(fx.supervisor.states().get("lobby").unwrap().is_none());
        let closed = fx.supervisor.logs().get_run("lobby", run.start_id).unwrap().unwrap();
        assert_eq!(closed.status, RunStatus::Crashed);

        // Subsequent calls report the instance as not running
        let err = fx.supervisor.stop("lobby").await.unwrap_err();
        assert!(matches!(err, ManagerError::InstanceNotRunning(_)));
    }

    #[tokio::test]
    async fn test_force_stop_of_dead_pid_reports_failure_and_clears() {
        let fx = Fixture::new();
        let mut gone = std::process::Command::new("true").spawn().unwrap();
        let pid = gone.id();
        gone.wait().unwrap();

        let run = fx.supervisor.logs().begin_run("lobby").unwrap();
        fx.supervisor
            .states()
            .update(InstanceState {
                instance_name: "lobby".to_string(),
                pid,
                start_id: run.start_id,
                start_time: run.start_time,
                process_started_at: None,
            })
            .unwrap();

        let err = fx.supervisor.force_stop("lobby").await.unwrap_err();
        assert!(matches!(err, ManagerError::ProcessSignalFailed { .. }));
        assert!(fx.supervisor.states().get("lobby").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_adopted_instance_has_no_stdin() {
        let fx = Fixture::new();
        fx.script("lobby", ECHO_UNTIL_STOP);

        // A live process this supervisor did not spawn
        let mut foreign = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = foreign.id();
        let run = fx.supervisor.logs().begin_run("lobby").unwrap();
        fx.supervisor
            .states()
            .update(InstanceState {
                instance_name: "lobby".to_string(),
                pid,
                start_id: run.start_id,
                start_time: run.start_time,
                process_started_at: platform::process_start_time(pid),
            })
            .unwrap();

        let report = fx.supervisor.reconcile().await.unwrap();
        assert_eq!(report.adopted, vec!["lobby".to_string()]);

        let err = fx.supervisor.send_command("lobby", "say hi").await.unwrap_err();
        assert!(matches!(err, ManagerError::StdinDetached(_)));
        let err = fx.supervisor.start("lobby").await.unwrap_err();
        assert!(matches!(err, ManagerError::AlreadyRunning(_)));

        let status = fx.supervisor.status("lobby").await.unwrap();
        assert!(status.alive);
        assert!(!status.attached);

        fx.supervisor.force_stop("lobby").await.unwrap();
        foreign.wait().unwrap();
        let closed = fx.supervisor.logs().get_run("lobby", run.start_id).unwrap().unwrap();
        assert_eq!(closed.status, RunStatus::Stopped);
    }

    #[tokio::test]
    async fn test_reconcile_clears_dead_states() {
        let fx = Fixture::new();
        let mut gone = std::process::Command::new("true").spawn().unwrap();
        let pid = gone.id();
        gone.wait().unwrap();

        let run = fx.supervisor.logs().begin_run("old").unwrap();
        fx.supervisor
            .states()
            .update(InstanceState {
                instance_name: "old".to_string(),
                pid,
                start_id: run.start_id,
                start_time: run.start_time,
                process_started_at: Some(1),
            })
            .unwrap();

        let report = fx.supervisor.reconcile().await.unwrap();
        assert_eq!(report.cleared, vec!["old".to_string()]);
        assert!(fx.supervisor.states().all().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_starts_of_distinct_instances() {
        let fx = Fixture::new();
        fx.script("alpha", ECHO_UNTIL_STOP);
        fx.script("beta", ECHO_UNTIL_STOP);

        let (a, b) = tokio::join!(fx.supervisor.start("alpha"), fx.supervisor.start("beta"));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a.pid, b.pid);
        assert_eq!((a.start_id, b.start_id), (1, 1));

        fx.supervisor.stop("alpha").await.unwrap();
        fx.supervisor.stop("beta").await.unwrap();
        assert_eq!(fx.supervisor.wait_for_exit("alpha").await, Some(RunStatus::Stopped));
        assert_eq!(fx.supervisor.wait_for_exit("beta").await, Some(RunStatus::Stopped));
    }

    #[tokio::test]
    async fn test_failure_after_spawn_kills_the_child() {
        let temp = tempdir().unwrap();
        let registry = Arc::new(InstanceRegistry::new(temp.path().join("instances")));
        let logs = Arc::new(LogStore::open_in_memory().unwrap());
        let state_dir = temp.path().join("state");
        let states = Arc::new(InstanceStateStore::open(state_dir.join("state.json")).unwrap());
        let supervisor =
            ProcessSupervisor::new(Arc::clone(&registry), Arc::clone(&logs), states, "stop");
        let config = ConfigFile::Command {
            executable: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), "exec sleep 30".to_string()],
            work_dir: None,
        };
        registry.save_config("lobby", &config).unwrap();

        // State writes now fail once the process is already running
        std::fs::remove_dir_all(&state_dir).unwrap();

        let err = supervisor.start("lobby").await.unwrap_err();
        assert!(matches!(err, ManagerError::Io(_)));

        let run = logs.latest_run("lobby").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Crashed);
        assert!(run.ended_at.is_some());
        let pid = run.pid.unwrap();
        assert!(!platform::is_process_running(pid));
        assert!(supervisor.states().get("lobby").unwrap().is_none());

        // The name is free again
        assert!(supervisor.exit_signal("lobby").is_none());
        assert!(!supervisor.status("lobby").await.unwrap().attached);
    }

    #[tokio::test]
    async fn test_list_instances_passthrough() {
        let fx = Fixture::new();
        fx.script("beta", "true");
        fx.script("alpha", "true");
        assert_eq!(
            fx.supervisor.list_instances().await.unwrap(),
            vec!["alpha", "beta"]
        );
    }
}
