//! Launch description YAML schema definitions

use crate::config::Substitution;
use crate::runtime::EventFilter;
use indexmap::IndexMap;
use regex::Regex;
use serde::Deserialize;

/// Description format versions this crate understands
const SUPPORTED_VERSIONS: &[&str] = &["1.0"];

/// Root of a parsed launch description. Immutable once parsed.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LaunchDescription {
    /// Description format version
    #[serde(default = "default_version")]
    pub version: String,

    /// Actions in declaration order. Each action is a single-key map
    /// (`- process: {...}`); nested action lists are read the same way.
    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    pub actions: Vec<Action>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// One node of the action tree
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Declare a launch argument with an optional default
    Arg(DeclareArgument),
    /// Set an environment variable for the current scope
    SetEnv(SetEnv),
    /// Splice another launch description into the tree
    Include(Include),
    /// Spawn a process
    Process(ProcessLaunch),
    /// Nested actions sharing a scoped context
    Group(Group),
    /// Run the wrapped actions only when the condition is `true`
    If(Conditional),
    /// Run the wrapped actions only when the condition is `false`
    Unless(Conditional),
    /// Register a reaction to process lifecycle events
    OnEvent(EventHandler),
    /// Run actions once after a delay
    Timer(Timer),
    /// Emit a log line
    Log(LogMessage),
    /// Request session shutdown
    Shutdown(Shutdown),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeclareArgument {
    pub name: String,
    #[serde(default)]
    pub default: Option<Substitution>,
    #[serde(default)]
    pub description: Option<String>,
    /// Allowed values (empty = anything)
    #[serde(default)]
    pub choices: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetEnv {
    pub name: String,
    pub value: Substitution,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Include {
    /// Path of the child description
    pub path: Substitution,
    /// Arguments seeded into the child's scope
    #[serde(default)]
    pub args: IndexMap<String, Substitution>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessLaunch {
    /// Process name; defaults to the executable's file name
    #[serde(default)]
    pub name: Option<Substitution>,
    pub executable: Substitution,
    #[serde(default)]
    pub args: Vec<Substitution>,
    #[serde(default)]
    pub env: IndexMap<String, Substitution>,
    #[serde(default)]
    pub working_dir: Option<Substitution>,
    #[serde(default)]
    pub output: OutputPolicy,
}

/// What happens to a process's stdout/stderr lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputPolicy {
    /// Log each line as `[name] line`
    #[default]
    Log,
    /// Only deliver lines to event handlers
    Quiet,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Group {
    #[serde(default)]
    pub namespace: Option<Substitution>,
    /// Arguments bound in the group's scope
    #[serde(default)]
    pub args: IndexMap<String, Substitution>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Conditional {
    pub condition: Substitution,
    #[serde(default)]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventHandler {
    pub event: EventFilter,
    /// Process name to react to (any process when omitted)
    #[serde(default)]
    pub target: Option<Substitution>,
    /// Regex tested against output lines (only for `event: output`)
    #[serde(default)]
    pub pattern: Option<OutputPattern>,
    /// Unregister after the first delivery
    #[serde(default)]
    pub once: bool,
    #[serde(default)]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Timer {
    pub period_ms: u64,
    #[serde(default)]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogMessage {
    pub message: Substitution,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Shutdown {
    #[serde(default)]
    pub reason: Option<Substitution>,
}

/// Compiled output-line matcher
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "String")]
pub struct OutputPattern(Regex);

impl OutputPattern {
    pub fn is_match(&self, text: &str) -> bool {
        self.0.is_match(text)
    }
}

impl TryFrom<String> for OutputPattern {
    type Error = regex::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Regex::new(&value).map(OutputPattern)
    }
}

impl Action {
    /// Short tag used in logs and failure reports
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Arg(_) => "arg",
            Action::SetEnv(_) => "set_env",
            Action::Include(_) => "include",
            Action::Process(_) => "process",
            Action::Group(_) => "group",
            Action::If(_) => "if",
            Action::Unless(_) => "unless",
            Action::OnEvent(_) => "on_event",
            Action::Timer(_) => "timer",
            Action::Log(_) => "log",
            Action::Shutdown(_) => "shutdown",
        }
    }

    /// Human readable label, e.g. `process 'talker'`
    pub fn label(&self) -> String {
        match self {
            Action::Arg(decl) => format!("arg '{}'", decl.name),
            Action::SetEnv(set) => format!("set_env '{}'", set.name),
            Action::Include(inc) => format!("include '{}'", inc.path),
            Action::Process(p) => match &p.name {
                Some(name) => format!("process '{}'", name),
                None => format!("process '{}'", p.executable),
            },
            Action::OnEvent(h) => match &h.target {
                Some(target) => format!("on_event {:?} '{}'", h.event, target),
                None => format!("on_event {:?}", h.event),
            },
            other => other.kind().to_string(),
        }
    }

    /// Nested actions, if this variant has any
    pub fn children(&self) -> &[Action] {
        match self {
            Action::Group(g) => &g.actions,
            Action::If(c) | Action::Unless(c) => &c.actions,
            Action::OnEvent(h) => &h.actions,
            Action::Timer(t) => &t.actions,
            _ => &[],
        }
    }
}

impl LaunchDescription {
    /// Load launch description from a YAML file
    pub fn from_file(path: &str) -> Result<Self, LaunchFileError> {
        let content = std::fs::read_to_string(path).map_err(|e| LaunchFileError::Io {
            path: path.to_string(),
            source: e,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse launch description from YAML string
    pub fn from_yaml(content: &str) -> Result<Self, LaunchFileError> {
        let description: LaunchDescription =
            serde_yaml::from_str(content).map_err(LaunchFileError::Parse)?;
        description.validate()?;
        Ok(description)
    }

    /// Validate the launch description
    pub fn validate(&self) -> Result<(), LaunchFileError> {
        if !SUPPORTED_VERSIONS.contains(&self.version.as_str()) {
            return Err(LaunchFileError::Validation(format!(
                "Unsupported version '{}' (supported: {})",
                self.version,
                SUPPORTED_VERSIONS.join(", ")
            )));
        }
        validate_actions(&self.actions)
    }

    /// Arguments declared at the top level of this description
    pub fn declared_arguments(&self) -> Vec<&DeclareArgument> {
        self.actions
            .iter()
            .filter_map(|action| match action {
                Action::Arg(decl) => Some(decl),
                _ => None,
            })
            .collect()
    }

    /// Total number of actions, counting nested ones
    pub fn action_count(&self) -> usize {
        fn count(actions: &[Action]) -> usize {
            actions.iter().map(|a| 1 + count(a.children())).sum()
        }
        count(&self.actions)
    }
}

fn validate_actions(actions: &[Action]) -> Result<(), LaunchFileError> {
    for action in actions {
        match action {
            Action::Arg(decl) => {
                if !is_identifier(&decl.name) {
                    return Err(LaunchFileError::Validation(format!(
                        "Argument name '{}' is not a valid identifier",
                        decl.name
                    )));
                }
            }
            Action::SetEnv(set) if set.name.is_empty() => {
                return Err(LaunchFileError::Validation(
                    "set_env requires a non-empty name".to_string(),
                ));
            }
            Action::Include(inc) => {
                if inc.path.source().trim().is_empty() {
                    return Err(LaunchFileError::Validation(
                        "include requires a non-empty path".to_string(),
                    ));
                }
                check_argument_names(inc.args.keys(), "include")?;
            }
            Action::Process(p) => {
                if p.executable.source().trim().is_empty() {
                    return Err(LaunchFileError::Validation(
                        "process requires a non-empty executable".to_string(),
                    ));
                }
                if p.name.as_ref().is_some_and(|n| n.source().trim().is_empty()) {
                    return Err(LaunchFileError::Validation(format!(
                        "process '{}': name must not be empty",
                        p.executable
                    )));
                }
            }
            Action::Group(g) => check_argument_names(g.args.keys(), "group")?,
            Action::OnEvent(h) => {
                if h.pattern.is_some() && h.event != EventFilter::Output {
                    return Err(LaunchFileError::Validation(format!(
                        "on_event {:?}: 'pattern' is only valid for output events",
                        h.event
                    )));
                }
            }
            _ => {}
        }
        validate_actions(action.children())?;
    }
    Ok(())
}

fn check_argument_names<'a>(
    names: impl Iterator<Item = &'a String>,
    owner: &str,
) -> Result<(), LaunchFileError> {
    for name in names {
        if !is_identifier(name) {
            return Err(LaunchFileError::Validation(format!(
                "{} argument '{}' is not a valid identifier",
                owner, name
            )));
        }
    }
    Ok(())
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Errors that can occur when loading a launch description
#[derive(Debug, thiserror::Error)]
pub enum LaunchFileError {
    #[error("Failed to read launch file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse launch file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Launch description not found: {0}")]
    NotFound(String),
}
