//! Launch executor - walks the action tree and drives the event dispatch loop

use crate::config::{
    should_run, Action, DescriptionSource, EventHandler, Group, Include, LaunchContext,
    LaunchFileError, OutputPolicy, ProcessLaunch, Resolve, ResolutionError, StandardResolver,
    Substitution,
};
use crate::runtime::events::{
    EventBus, EventKind, EventMatcher, Notification, OutputStream, ProcessId, Reaction, TimerId,
};
use crate::runtime::process::{
    ProcessBackend, ProcessConfig, ProcessError, ProcessRecord, ProcessStatus, ProcessSupervisor,
};
use indexmap::IndexMap;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Launch executor configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Grace period between SIGTERM and SIGKILL at shutdown
    pub shutdown_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// A node that failed without aborting the session
#[derive(Debug, Clone, PartialEq)]
pub struct NodeFailure {
    /// Label of the failed action, e.g. `process 'talker'`
    pub action: String,
    pub error: NodeError,
}

/// Node-scoped errors: reported, siblings continue
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("Failed to spawn '{name}': {message}")]
    Spawn { name: String, message: String },

    #[error("Timers require a running tokio runtime")]
    NoRuntime,
}

/// Failures and launches produced by one `run`
#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub launched: Vec<ProcessId>,
    pub failures: Vec<NodeFailure>,
}

/// Pending actions with the scope they run in
struct PendingWork {
    actions: Arc<[Action]>,
    context: LaunchContext,
    include_stack: Vec<String>,
}

impl From<Reaction> for PendingWork {
    fn from(reaction: Reaction) -> Self {
        Self {
            actions: reaction.actions,
            context: reaction.context,
            include_stack: reaction.include_stack,
        }
    }
}

/// Why executing one action stopped early
enum Interrupt {
    Node(NodeError),
    Fatal(ExecutorError),
}

impl From<ResolutionError> for Interrupt {
    fn from(e: ResolutionError) -> Self {
        Interrupt::Node(NodeError::Resolution(e))
    }
}

impl From<ExecutorError> for Interrupt {
    fn from(e: ExecutorError) -> Self {
        Interrupt::Fatal(e)
    }
}

/// Launch executor state
pub struct Executor {
    config: ExecutorConfig,
    source: Arc<dyn DescriptionSource>,
    resolver: Arc<dyn Resolve>,
    supervisor: ProcessSupervisor,
    bus: EventBus,
    pending: VecDeque<PendingWork>,
    timers: HashMap<TimerId, PendingWork>,
    next_timer: u64,
    launched: Vec<ProcessId>,
    failures: Vec<NodeFailure>,
    root_context: Option<LaunchContext>,
    shutdown_reason: Option<String>,
    event_tx: mpsc::UnboundedSender<Notification>,
    event_rx: mpsc::UnboundedReceiver<Notification>,
}

impl Executor {
    /// Create a new executor
    pub fn new(
        source: Arc<dyn DescriptionSource>,
        backend: Arc<dyn ProcessBackend>,
        config: ExecutorConfig,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            config,
            source,
            resolver: Arc::new(StandardResolver),
            supervisor: ProcessSupervisor::new(backend, event_tx.clone()),
            bus: EventBus::new(),
            pending: VecDeque::new(),
            timers: HashMap::new(),
            next_timer: 0,
            launched: Vec::new(),
            failures: Vec::new(),
            root_context: None,
            shutdown_reason: None,
            event_tx,
            event_rx,
        }
    }

    /// Replace the substitution resolver
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolve>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Walk the description at `path` with `context` as the root scope.
    ///
    /// Processes are spawned without waiting on them. Node-level failures are
    /// collected in the report; parse, cycle and include-path errors abort.
    pub fn run(
        &mut self,
        path: &str,
        context: LaunchContext,
    ) -> Result<ExecutionReport, ExecutorError> {
        let launched_before = self.launched.len();
        let failures_before = self.failures.len();

        let canonical = self.source.canonical(path);
        log::info!("Loading launch description: {}", path);
        let description = self
            .source
            .load(path)
            .map_err(|e| ExecutorError::Load {
                path: path.to_string(),
                source: e,
            })?;

        let mut context = context;
        let mut stack = vec![canonical];
        let result = self
            .walk(&description.actions, &mut context, &mut stack)
            .and_then(|()| self.drain_pending());
        self.root_context = Some(context);
        result?;

        Ok(ExecutionReport {
            launched: self.launched[launched_before..].to_vec(),
            failures: self.failures[failures_before..].to_vec(),
        })
    }

    /// Execute actions in declaration order. Node failures are recorded and
    /// the walk continues with the next sibling.
    fn walk(
        &mut self,
        actions: &[Action],
        context: &mut LaunchContext,
        stack: &mut Vec<String>,
    ) -> Result<(), ExecutorError> {
        for action in actions {
            if self.shutdown_reason.is_some() || self.supervisor.is_shutting_down() {
                log::debug!("Shutdown requested, skipping remaining actions");
                break;
            }

            match self.execute(action, context, stack) {
                Ok(()) => {}
                Err(Interrupt::Node(error)) => {
                    log::error!("{} failed: {}", action.label(), error);
                    self.failures.push(NodeFailure {
                        action: action.label(),
                        error,
                    });
                }
                Err(Interrupt::Fatal(error)) => return Err(error),
            }
        }
        Ok(())
    }

    fn execute(
        &mut self,
        action: &Action,
        context: &mut LaunchContext,
        stack: &mut Vec<String>,
    ) -> Result<(), Interrupt> {
        match action {
            Action::Arg(decl) => {
                // Bindings from enclosing scopes win over the declared default
                let value = if let Some(bound) = context.lookup(&decl.name).map(str::to_string) {
                    bound
                } else {
                    let default = decl
                        .default
                        .as_ref()
                        .ok_or_else(|| ResolutionError::UndefinedArgument(decl.name.clone()))?;
                    let value = self.resolve(default, context)?;
                    context.declare(&decl.name, || value).to_string()
                };

                if !decl.choices.is_empty() && !decl.choices.contains(&value) {
                    return Err(ResolutionError::InvalidChoice {
                        name: decl.name.clone(),
                        value,
                        choices: decl.choices.clone(),
                    }
                    .into());
                }
                log::debug!("arg {} = {}", decl.name, value);
            }
            Action::SetEnv(set) => {
                let value = self.resolve(&set.value, context)?;
                context.set_env(set.name.clone(), value);
            }
            Action::Include(include) => self.include(include, context, stack)?,
            Action::Process(launch) => self.launch_process(launch, context)?,
            Action::Group(group) => self.group(group, context, stack)?,
            Action::If(conditional) | Action::Unless(conditional) => {
                if should_run(action, context, self.resolver.as_ref())? {
                    self.walk(&conditional.actions, context, stack)?;
                } else {
                    log::debug!("Skipping {} ({})", action.kind(), conditional.condition);
                }
            }
            Action::OnEvent(handler) => self.register_handler(handler, context, stack)?,
            Action::Timer(timer) => {
                let runtime = tokio::runtime::Handle::try_current()
                    .map_err(|_| Interrupt::Node(NodeError::NoRuntime))?;
                let id = TimerId(self.next_timer);
                self.next_timer += 1;
                self.timers.insert(
                    id,
                    PendingWork {
                        actions: timer.actions.clone().into(),
                        context: context.clone(),
                        include_stack: stack.clone(),
                    },
                );

                let tx = self.event_tx.clone();
                let period = Duration::from_millis(timer.period_ms);
                runtime.spawn(async move {
                    tokio::time::sleep(period).await;
                    let _ = tx.send(Notification::TimerElapsed(id));
                });
            }
            Action::Log(message) => {
                log::info!("{}", self.resolve(&message.message, context)?);
            }
            Action::Shutdown(shutdown) => {
                let reason = match &shutdown.reason {
                    Some(reason) => self.resolve(reason, context)?,
                    None => "shutdown action".to_string(),
                };
                log::info!("Shutdown requested: {}", reason);
                self.shutdown_reason = Some(reason);
            }
        }
        Ok(())
    }

    fn resolve(
        &self,
        subst: &Substitution,
        context: &LaunchContext,
    ) -> Result<String, ResolutionError> {
        self.resolver.resolve(subst, context)
    }

    fn include(
        &mut self,
        include: &Include,
        context: &LaunchContext,
        stack: &mut Vec<String>,
    ) -> Result<(), Interrupt> {
        // An unresolvable include path is structural, not node-scoped
        let path = self
            .resolve(&include.path, context)
            .map_err(|e| ExecutorError::IncludeResolution {
                path: include.path.source().to_string(),
                source: e,
            })?;

        let canonical = self.source.canonical(&path);
        if stack.contains(&canonical) {
            let mut chain = stack.clone();
            chain.push(canonical);
            return Err(ExecutorError::CycleDetected(chain).into());
        }

        let description = self.source.load(&path).map_err(|e| ExecutorError::Load {
            path: path.clone(),
            source: e,
        })?;

        let mut child = context.child();
        for (name, value) in &include.args {
            let value = self.resolve(value, context)?;
            child.bind(name.clone(), value);
        }

        log::debug!("Including {}", path);
        stack.push(canonical);
        let result = self.walk(&description.actions, &mut child, stack);
        stack.pop();
        result.map_err(Interrupt::Fatal)
    }

    fn group(
        &mut self,
        group: &Group,
        context: &LaunchContext,
        stack: &mut Vec<String>,
    ) -> Result<(), Interrupt> {
        let mut child = context.child();
        if let Some(namespace) = &group.namespace {
            let namespace = self.resolve(namespace, context)?;
            child.push_namespace(&namespace);
        }
        for (name, value) in &group.args {
            let value = self.resolve(value, context)?;
            child.bind(name.clone(), value);
        }
        self.walk(&group.actions, &mut child, stack)?;
        Ok(())
    }

    fn launch_process(
        &mut self,
        launch: &ProcessLaunch,
        context: &LaunchContext,
    ) -> Result<(), Interrupt> {
        let executable = self.resolve(&launch.executable, context)?;
        let name = match &launch.name {
            Some(name) => self.resolve(name, context)?,
            None => Path::new(&executable)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| executable.clone()),
        };

        let mut args = Vec::with_capacity(launch.args.len());
        for arg in &launch.args {
            args.push(self.resolve(arg, context)?);
        }

        let mut env = context.environment();
        for (key, value) in &launch.env {
            env.insert(key.clone(), self.resolve(value, context)?);
        }

        let working_dir = match &launch.working_dir {
            Some(dir) => Some(PathBuf::from(self.resolve(dir, context)?)),
            None => None,
        };

        let config = ProcessConfig {
            name: context.qualify(&name),
            executable,
            args,
            env,
            working_dir,
        };

        let name = config.name.clone();
        match self.supervisor.spawn(config, launch.output) {
            Ok(id) => {
                log::debug!("[{}] spawned as {}", name, id);
                self.launched.push(id);
                Ok(())
            }
            Err(e) => Err(Interrupt::Node(NodeError::Spawn {
                name,
                message: spawn_message(&e),
            })),
        }
    }

    fn register_handler(
        &mut self,
        handler: &EventHandler,
        context: &LaunchContext,
        stack: &[String],
    ) -> Result<(), Interrupt> {
        let target = match &handler.target {
            Some(target) => Some(context.qualify(&self.resolve(target, context)?)),
            None => None,
        };

        self.bus.register(
            EventMatcher {
                filter: handler.event,
                target,
                pattern: handler.pattern.clone(),
            },
            Reaction {
                actions: handler.actions.clone().into(),
                context: context.clone(),
                include_stack: stack.to_vec(),
            },
            handler.once,
        );
        Ok(())
    }

    /// Run queued reactions to completion, in the order they were queued
    fn drain_pending(&mut self) -> Result<(), ExecutorError> {
        while let Some(mut work) = self.pending.pop_front() {
            let actions = Arc::clone(&work.actions);
            self.walk(&actions, &mut work.context, &mut work.include_stack)?;
        }
        Ok(())
    }

    /// Deliver one notification and run the reactions it triggers
    pub fn handle_notification(&mut self, notification: Notification) -> Result<(), ExecutorError> {
        if self.supervisor.is_shutting_down() {
            return Ok(());
        }

        match notification {
            Notification::Process(event) => {
                let Some(record) = self.supervisor.record(event.process) else {
                    log::warn!("Event for unknown process {}", event.process);
                    return Ok(());
                };
                report_event(&record, &event.kind);

                for reaction in self.bus.dispatch(&event, record.name()) {
                    self.pending.push_back(reaction.into());
                }
            }
            Notification::TimerElapsed(id) => {
                if let Some(work) = self.timers.remove(&id) {
                    self.pending.push_back(work);
                }
            }
        }

        self.drain_pending()
    }

    /// Handle every notification already queued, without waiting.
    ///
    /// Returns the number handled.
    pub fn dispatch_pending(&mut self) -> Result<usize, ExecutorError> {
        let mut handled = 0;
        while let Ok(notification) = self.event_rx.try_recv() {
            self.handle_notification(notification)?;
            handled += 1;
        }
        Ok(handled)
    }

    /// True when nothing is running, queued or scheduled
    pub fn is_idle(&self) -> bool {
        self.supervisor.live_count() == 0
            && self.timers.is_empty()
            && self.pending.is_empty()
            && self.event_rx.is_empty()
    }

    /// Dispatch events until shutdown is requested or the session goes idle
    pub async fn wait(&mut self, mut shutdown_rx: watch::Receiver<()>) -> Result<(), ExecutorError> {
        loop {
            if let Some(reason) = &self.shutdown_reason {
                log::info!("Stopping session: {}", reason);
                break;
            }
            if self.is_idle() {
                log::info!("All processes have stopped");
                break;
            }

            tokio::select! {
                Ok(()) = shutdown_rx.changed() => {
                    log::info!("Shutdown signal received");
                    break;
                }

                Some(notification) = self.event_rx.recv() => {
                    self.handle_notification(notification)?;
                }
            }
        }
        Ok(())
    }

    /// Stop all processes and suppress further dispatch
    pub async fn shutdown(&mut self) {
        log::info!("Shutting down all processes...");
        self.supervisor.shutdown(self.config.shutdown_timeout).await;
        self.bus.clear();
        self.timers.clear();
        self.pending.clear();
        while self.event_rx.try_recv().is_ok() {}
        log::info!("All processes shut down");
    }

    pub fn shutdown_reason(&self) -> Option<&str> {
        self.shutdown_reason.as_deref()
    }

    /// All node-level failures so far, including those from reactions
    pub fn failures(&self) -> &[NodeFailure] {
        &self.failures
    }

    /// Every process record in spawn order
    pub fn processes(&self) -> Vec<ProcessRecord> {
        self.supervisor.records()
    }

    pub fn process(&self, id: ProcessId) -> Option<ProcessRecord> {
        self.supervisor.record(id)
    }

    /// Get process status summary
    pub fn status(&self) -> Vec<(String, ProcessStatus)> {
        self.supervisor
            .records()
            .into_iter()
            .map(|r| (r.config.name, r.status))
            .collect()
    }

    pub fn handler_count(&self) -> usize {
        self.bus.len()
    }

    /// Snapshot of what was (or would be) launched, for dry runs
    pub fn plan(&self) -> LaunchPlan {
        LaunchPlan {
            args: self
                .root_context
                .as_ref()
                .map(LaunchContext::arguments)
                .unwrap_or_default(),
            processes: self
                .supervisor
                .records()
                .into_iter()
                .filter(|r| r.status != ProcessStatus::Failed)
                .map(|r| r.config)
                .collect(),
            handlers: self.bus.len(),
            failures: self
                .failures
                .iter()
                .map(|f| format!("{}: {}", f.action, f.error))
                .collect(),
        }
    }
}

fn spawn_message(error: &ProcessError) -> String {
    match error {
        ProcessError::SpawnFailed { source, .. } => source.to_string(),
        other => other.to_string(),
    }
}

/// Hand lifecycle events to the log
fn report_event(record: &ProcessRecord, kind: &EventKind) {
    let name = record.name();
    match kind {
        EventKind::OutputLine { text, stream } => {
            if record.output == OutputPolicy::Log {
                match stream {
                    OutputStream::Stdout => log::info!("[{}] {}", name, text),
                    OutputStream::Stderr => log::warn!("[{}] {}", name, text),
                }
            }
        }
        EventKind::ProcessStarted { pid } => match pid {
            Some(pid) => log::info!("[{}] Process started with PID: {}", name, pid),
            None => log::info!("[{}] Process started", name),
        },
        EventKind::ProcessExited { code: Some(0) } => {
            log::info!("[{}] Process exited with code: 0", name)
        }
        EventKind::ProcessExited { code } => {
            log::warn!("[{}] Process failed with code: {:?}", name, code)
        }
        EventKind::SpawnFailed { error } => log::error!("[{}] Process failed: {}", name, error),
    }
}

/// Launch plan for dry-run mode
#[derive(Debug, serde::Serialize)]
pub struct LaunchPlan {
    /// Root arguments after declarations
    pub args: IndexMap<String, String>,
    /// Processes in launch order
    pub processes: Vec<ProcessConfig>,
    /// Number of registered event handlers
    pub handlers: usize,
    /// Node-level failures
    pub failures: Vec<String>,
}

/// Errors that abort the whole session
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Failed to load '{path}': {source}")]
    Load {
        path: String,
        #[source]
        source: LaunchFileError,
    },

    #[error("Include cycle detected: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    #[error("Cannot resolve include path '{path}': {source}")]
    IncludeResolution {
        path: String,
        #[source]
        source: ResolutionError,
    },
}

/// Display the launch plan in a human-readable format
impl std::fmt::Display for LaunchPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Launch Plan")?;
        writeln!(f, "===========")?;
        writeln!(f)?;

        if !self.args.is_empty() {
            writeln!(f, "Arguments:")?;
            for (key, value) in &self.args {
                writeln!(f, "  {}: {}", key, value)?;
            }
            writeln!(f)?;
        }

        writeln!(f, "Processes (in launch order):")?;
        for (i, process) in self.processes.iter().enumerate() {
            writeln!(f)?;
            writeln!(f, "  {}. {}", i + 1, process.name)?;
            writeln!(
                f,
                "     Command: {} {}",
                process.executable,
                process.args.join(" ")
            )?;

            if let Some(dir) = &process.working_dir {
                writeln!(f, "     Working dir: {}", dir.display())?;
            }

            if !process.env.is_empty() {
                writeln!(f, "     Environment:")?;
                for (key, value) in &process.env {
                    writeln!(f, "       {}={}", key, value)?;
                }
            }
        }

        if self.handlers > 0 {
            writeln!(f)?;
            writeln!(f, "Event handlers registered: {}", self.handlers)?;
        }

        if !self.failures.is_empty() {
            writeln!(f)?;
            writeln!(f, "Failures:")?;
            for failure in &self.failures {
                writeln!(f, "  - {}", failure)?;
            }
        }

        Ok(())
    }
}
