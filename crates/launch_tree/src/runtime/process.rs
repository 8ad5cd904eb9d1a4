//! Process supervision
//!
//! [`ProcessSupervisor`] owns the registry of every process spawned during a
//! session. Other components only ever hold [`ProcessId`]s. The registry is
//! written both by the tree walk (spawn) and by background tasks reporting
//! exits, so it lives behind a lock shared with the [`EventSink`].

use crate::config::OutputPolicy;
use crate::runtime::events::{Event, EventKind, Notification, OutputStream, ProcessId};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

/// How long to wait for output readers to drain after a process exits
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Poll interval while waiting for processes to exit during shutdown
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Process status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Spawn requested, not yet confirmed running
    Starting,
    /// Process is running
    Running,
    /// Process has exited with exit code (`None` if killed by a signal)
    Exited(Option<i32>),
    /// Process failed to start
    Failed,
}

impl ProcessStatus {
    /// Check if process is live
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessStatus::Running | ProcessStatus::Starting)
    }
}

/// Configuration for spawning a process
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ProcessConfig {
    /// Fully qualified process name
    pub name: String,
    /// Executable path
    pub executable: String,
    /// Command line arguments
    pub args: Vec<String>,
    /// Environment variables
    pub env: IndexMap<String, String>,
    /// Working directory
    pub working_dir: Option<PathBuf>,
}

/// Registry entry for a spawned process
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub id: ProcessId,
    pub config: ProcessConfig,
    pub output: OutputPolicy,
    pub status: ProcessStatus,
    pub pid: Option<u32>,
}

impl ProcessRecord {
    pub fn name(&self) -> &str {
        &self.config.name
    }
}

type Registry = Arc<RwLock<IndexMap<ProcessId, ProcessRecord>>>;

/// Reports lifecycle transitions: updates the registry, then queues the event
#[derive(Clone)]
pub struct EventSink {
    registry: Registry,
    tx: mpsc::UnboundedSender<Notification>,
}

impl EventSink {
    pub fn emit(&self, id: ProcessId, kind: EventKind) {
        // Queue while holding the lock so a reader never sees the new status
        // without the event being in the channel
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(record) = registry.get_mut(&id) {
            match &kind {
                EventKind::ProcessStarted { pid } => {
                    record.status = ProcessStatus::Running;
                    record.pid = *pid;
                }
                EventKind::ProcessExited { code } => {
                    record.status = ProcessStatus::Exited(*code);
                    record.pid = None;
                }
                EventKind::SpawnFailed { .. } => record.status = ProcessStatus::Failed,
                EventKind::OutputLine { .. } => {}
            }
        }
        let _ = self.tx.send(Notification::Process(Event::new(id, kind)));
    }

    pub fn started(&self, id: ProcessId, pid: Option<u32>) {
        self.emit(id, EventKind::ProcessStarted { pid });
    }

    pub fn output(&self, id: ProcessId, text: String, stream: OutputStream) {
        self.emit(id, EventKind::OutputLine { text, stream });
    }

    pub fn exited(&self, id: ProcessId, code: Option<i32>) {
        self.emit(id, EventKind::ProcessExited { code });
    }
}

/// How to ask a process to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// Graceful (SIGTERM on unix)
    Terminate,
    /// Forced
    Kill,
}

/// Host process API.
///
/// `spawn` must report `ProcessStarted` through the sink before any output
/// or exit event for that process.
pub trait ProcessBackend: Send + Sync {
    fn spawn(
        &self,
        id: ProcessId,
        config: &ProcessConfig,
        sink: EventSink,
    ) -> Result<(), ProcessError>;

    fn signal(&self, id: ProcessId, signal: StopSignal) -> Result<(), ProcessError>;
}

struct ChildControl {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
}

/// Spawns real OS processes on the tokio runtime
#[derive(Default)]
pub struct OsBackend {
    children: Arc<Mutex<HashMap<ProcessId, ChildControl>>>,
}

impl OsBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn forward_lines<R>(
    reader: R,
    id: ProcessId,
    stream: OutputStream,
    sink: EventSink,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            sink.output(id, line, stream);
        }
    })
}

impl ProcessBackend for OsBackend {
    fn spawn(
        &self,
        id: ProcessId,
        config: &ProcessConfig,
        sink: EventSink,
    ) -> Result<(), ProcessError> {
        log::info!(
            "[{}] Starting: {} {}",
            config.name,
            config.executable,
            config.args.join(" ")
        );

        let mut cmd = Command::new(&config.executable);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| ProcessError::SpawnFailed {
            name: config.name.clone(),
            source: e,
        })?;

        let pid = child.id();
        let (kill_tx, mut kill_rx) = oneshot::channel();
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                ChildControl {
                    pid,
                    kill_tx: Some(kill_tx),
                },
            );
        sink.started(id, pid);

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(forward_lines(stdout, id, OutputStream::Stdout, sink.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(forward_lines(stderr, id, OutputStream::Stderr, sink.clone()));
        }

        let children = Arc::clone(&self.children);
        let name = config.name.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                Ok(()) = &mut kill_rx => {
                    log::warn!("[{}] Forcing kill", name);
                    let _ = child.kill().await;
                    child.wait().await
                }
            };

            // Output lines are delivered before the exit event
            for reader in readers {
                let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await;
            }

            children
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    log::error!("[{}] Error waiting for process: {}", name, e);
                    None
                }
            };
            sink.exited(id, code);
        });

        Ok(())
    }

    fn signal(&self, id: ProcessId, signal: StopSignal) -> Result<(), ProcessError> {
        let mut children = self.children.lock().unwrap_or_else(PoisonError::into_inner);
        let control = children
            .get_mut(&id)
            .ok_or(ProcessError::NotRunning(id))?;

        match signal {
            #[cfg(unix)]
            StopSignal::Terminate => {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;

                let pid = control.pid.ok_or(ProcessError::NotRunning(id))?;
                kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
                    .map_err(|e| ProcessError::Signal(id, e.to_string()))
            }
            // On non-Unix there is no graceful stop, kill immediately
            #[cfg(not(unix))]
            StopSignal::Terminate => control
                .kill_tx
                .take()
                .ok_or(ProcessError::NotRunning(id))?
                .send(())
                .map_err(|_| ProcessError::NotRunning(id)),
            StopSignal::Kill => control
                .kill_tx
                .take()
                .ok_or(ProcessError::NotRunning(id))?
                .send(())
                .map_err(|_| ProcessError::NotRunning(id)),
        }
    }
}

/// Records spawn requests without starting anything (dry runs)
#[derive(Default)]
pub struct PlanBackend {
    requests: Mutex<Vec<(ProcessId, ProcessConfig)>>,
}

impl PlanBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn requests in the order they were made
    pub fn requests(&self) -> Vec<(ProcessId, ProcessConfig)> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ProcessBackend for PlanBackend {
    fn spawn(
        &self,
        id: ProcessId,
        config: &ProcessConfig,
        _sink: EventSink,
    ) -> Result<(), ProcessError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, config.clone()));
        Ok(())
    }

    fn signal(&self, id: ProcessId, _signal: StopSignal) -> Result<(), ProcessError> {
        Err(ProcessError::NotRunning(id))
    }
}

/// Owns every process handle of a session
pub struct ProcessSupervisor {
    backend: Arc<dyn ProcessBackend>,
    registry: Registry,
    next_id: AtomicU64,
    shutting_down: AtomicBool,
    sink: EventSink,
}

impl ProcessSupervisor {
    pub fn new(backend: Arc<dyn ProcessBackend>, tx: mpsc::UnboundedSender<Notification>) -> Self {
        let registry: Registry = Arc::default();
        Self {
            backend,
            sink: EventSink {
                registry: Arc::clone(&registry),
                tx,
            },
            registry,
            next_id: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Register and spawn a process. Does not wait for it.
    ///
    /// On failure the record is marked `Failed` and a `SpawnFailed` event is
    /// emitted for the new id.
    pub fn spawn(
        &self,
        config: ProcessConfig,
        output: OutputPolicy,
    ) -> Result<ProcessId, ProcessError> {
        if self.is_shutting_down() {
            return Err(ProcessError::ShuttingDown(config.name));
        }

        let id = ProcessId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                ProcessRecord {
                    id,
                    config: config.clone(),
                    output,
                    status: ProcessStatus::Starting,
                    pid: None,
                },
            );

        match self.backend.spawn(id, &config, self.sink.clone()) {
            Ok(()) => Ok(id),
            Err(e) => {
                log::error!("[{}] {}", config.name, e);
                self.sink.emit(
                    id,
                    EventKind::SpawnFailed {
                        error: e.to_string(),
                    },
                );
                Err(e)
            }
        }
    }

    pub fn record(&self, id: ProcessId) -> Option<ProcessRecord> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn status(&self, id: ProcessId) -> Option<ProcessStatus> {
        self.record(id).map(|r| r.status)
    }

    /// All records in spawn order
    pub fn records(&self) -> Vec<ProcessRecord> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Number of processes starting or running
    pub fn live_count(&self) -> usize {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|r| r.status.is_running())
            .count()
    }

    fn live_ids(&self) -> Vec<ProcessId> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|r| r.status.is_running())
            .map(|r| r.id)
            .collect()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Stop every live process: graceful signal, then kill after `timeout`
    pub async fn shutdown(&self, timeout: Duration) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let live = self.live_ids();
        if live.is_empty() {
            return;
        }
        log::info!("Stopping {} processes...", live.len());

        // Reverse spawn order
        for id in live.iter().rev() {
            if let Err(e) = self.backend.signal(*id, StopSignal::Terminate) {
                log::debug!("Terminate {}: {}", id, e);
            }
        }

        if self.wait_for_exit(timeout).await {
            return;
        }

        for id in self.live_ids().iter().rev() {
            let name = self.record(*id).map(|r| r.config.name).unwrap_or_default();
            log::warn!("[{}] Process did not exit gracefully, forcing kill", name);
            if let Err(e) = self.backend.signal(*id, StopSignal::Kill) {
                log::debug!("Kill {}: {}", id, e);
            }
        }

        if !self.wait_for_exit(timeout).await {
            log::error!("{} processes still running after kill", self.live_count());
        }
    }

    async fn wait_for_exit(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.live_count() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }
    }
}

/// Errors that can occur with managed processes
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn process '{name}': {source}")]
    SpawnFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process {0} is not running")]
    NotRunning(ProcessId),

    #[error("Failed to signal process {0}: {1}")]
    Signal(ProcessId, String),

    #[error("Session is shutting down, not starting '{0}'")]
    ShuttingDown(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str) -> ProcessConfig {
        ProcessConfig {
            name: name.to_string(),
            executable: format!("/bin/{name}"),
            args: Vec::new(),
            env: IndexMap::new(),
            working_dir: None,
        }
    }

    struct FailingBackend;

    impl ProcessBackend for FailingBackend {
        fn spawn(&self, _: ProcessId, config: &ProcessConfig, _: EventSink) -> Result<(), ProcessError> {
            Err(ProcessError::SpawnFailed {
                name: config.name.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            })
        }

        fn signal(&self, id: ProcessId, _: StopSignal) -> Result<(), ProcessError> {
            Err(ProcessError::NotRunning(id))
        }
    }

    #[test]
    fn test_ids_are_unique_and_ordered() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let backend = Arc::new(PlanBackend::new());
        let supervisor = ProcessSupervisor::new(backend.clone(), tx);

        let a = supervisor.spawn(config("a"), OutputPolicy::Log).unwrap();
        let b = supervisor.spawn(config("a"), OutputPolicy::Log).unwrap();
        assert_ne!(a, b);
        assert!(a < b);

        let names: Vec<_> = backend
            .requests()
            .into_iter()
            .map(|(_, c)| c.name)
            .collect();
        assert_eq!(names, vec!["a", "a"]);
        assert_eq!(supervisor.status(a), Some(ProcessStatus::Starting));
    }

    #[test]
    fn test_sink_drives_state_machine() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let supervisor = ProcessSupervisor::new(Arc::new(PlanBackend::new()), tx);
        let id = supervisor.spawn(config("p"), OutputPolicy::Log).unwrap();

        supervisor.sink.started(id, Some(42));
        assert_eq!(supervisor.status(id), Some(ProcessStatus::Running));
        assert_eq!(supervisor.live_count(), 1);

        supervisor.sink.exited(id, Some(3));
        assert_eq!(supervisor.status(id), Some(ProcessStatus::Exited(Some(3))));
        assert_eq!(supervisor.live_count(), 0);

        let mut kinds = Vec::new();
        while let Ok(Notification::Process(event)) = rx.try_recv() {
            kinds.push(event.kind);
        }
        assert_eq!(
            kinds,
            vec![
                EventKind::ProcessStarted { pid: Some(42) },
                EventKind::ProcessExited { code: Some(3) },
            ]
        );
    }

    #[test]
    fn test_spawn_failure_marks_record_failed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let supervisor = ProcessSupervisor::new(Arc::new(FailingBackend), tx);

        let result = supervisor.spawn(config("ghost"), OutputPolicy::Log);
        assert!(matches!(result, Err(ProcessError::SpawnFailed { .. })));

        let records = supervisor.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, ProcessStatus::Failed);
        assert!(matches!(
            rx.try_recv(),
            Ok(Notification::Process(Event {
                kind: EventKind::SpawnFailed { .. },
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn test_no_spawn_after_shutdown() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let supervisor = ProcessSupervisor::new(Arc::new(PlanBackend::new()), tx);
        supervisor.shutdown(Duration::from_millis(10)).await;

        assert!(matches!(
            supervisor.spawn(config("late"), OutputPolicy::Log),
            Err(ProcessError::ShuttingDown(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_os_backend_reports_output_then_exit() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let supervisor = ProcessSupervisor::new(Arc::new(OsBackend::new()), tx);
        let mut cfg = config("echo");
        cfg.executable = "sh".to_string();
        cfg.args = vec!["-c".to_string(), "echo hello; exit 7".to_string()];

        let id = supervisor.spawn(cfg, OutputPolicy::Quiet).unwrap();

        let mut kinds = Vec::new();
        while let Some(Notification::Process(event)) =
            tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .ok()
                .flatten()
        {
            assert_eq!(event.process, id);
            let done = matches!(event.kind, EventKind::ProcessExited { .. });
            kinds.push(event.kind);
            if done {
                break;
            }
        }

        assert!(matches!(kinds[0], EventKind::ProcessStarted { pid: Some(_) }));
        assert_eq!(
            kinds[1],
            EventKind::OutputLine {
                text: "hello".to_string(),
                stream: OutputStream::Stdout
            }
        );
        assert_eq!(kinds.last(), Some(&EventKind::ProcessExited { code: Some(7) }));
        assert_eq!(supervisor.status(id), Some(ProcessStatus::Exited(Some(7))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_terminates_live_processes() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let supervisor = ProcessSupervisor::new(Arc::new(OsBackend::new()), tx);
        let mut cfg = config("sleeper");
        cfg.executable = "sleep".to_string();
        cfg.args = vec!["30".to_string()];

        let id = supervisor.spawn(cfg, OutputPolicy::Log).unwrap();
        assert_eq!(supervisor.live_count(), 1);

        supervisor.shutdown(Duration::from_secs(2)).await;
        assert_eq!(supervisor.live_count(), 0);
        assert!(matches!(
            supervisor.status(id),
            Some(ProcessStatus::Exited(_))
        ));
    }
}
