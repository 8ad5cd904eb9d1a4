//! Launch Tree
//!
//! A hierarchical launch-description orchestrator inspired by ROS2 launch.
//!
//! # Overview
//!
//! A launch description is an ordered tree of actions. The executor walks it
//! in declaration order:
//! - Resolves `$(arg ...)`, `$(env ...)` and `$(timestamp)` substitutions
//!   lazily, only when the owning action runs
//! - Splices in included descriptions with their own argument scope
//! - Skips `if` / `unless` subtrees without resolving anything inside them
//! - Spawns processes without waiting for them
//! - Registers event handlers that react to process start, exit and output
//!
//! # Example Launch File
//!
//! ```yaml
//! version: "1.0"
//!
//! actions:
//!   - arg: { name: ns, default: robot1 }
//!   - include:
//!       path: "sensors.launch.yaml"
//!       args: { ns: "$(arg ns)" }
//!   - group:
//!       namespace: "$(arg ns)"
//!       actions:
//!         - process: { name: driver, executable: "bin/driver" }
//!   - on_event:
//!       event: exit
//!       target: "/robot1/driver"
//!       actions:
//!         - shutdown: { reason: "driver exited" }
//! ```

pub mod cli;
pub mod config;
pub mod runtime;

pub use cli::LaunchArgs;
pub use config::{
    Action, DescriptionSource, FileSource, LaunchContext, LaunchDescription, LaunchFileError,
    MemorySource, Resolve, ResolutionError, StandardResolver, Substitution, SubstitutionError,
};
pub use runtime::{
    Event, EventBus, EventKind, ExecutionReport, Executor, ExecutorConfig, ExecutorError,
    LaunchPlan, NodeError, NodeFailure, OsBackend, PlanBackend, ProcessBackend, ProcessConfig,
    ProcessError, ProcessId, ProcessStatus, ProcessSupervisor,
};
