//! Scoped launch context
//!
//! A child context inherits from its parent by copy-on-write: lookups fall
//! back through the parent chain, writes always land in the local scope, so
//! sibling scopes never observe each other's bindings.

use indexmap::IndexMap;
use std::sync::Arc;

/// Argument bindings, environment overrides and namespace for one scope
#[derive(Debug, Clone, Default)]
pub struct LaunchContext {
    parent: Option<Arc<LaunchContext>>,
    args: IndexMap<String, String>,
    env: IndexMap<String, String>,
    namespace: Vec<String>,
}

impl LaunchContext {
    /// Create an empty root context
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a root context seeded with externally supplied arguments
    pub fn from_arguments<I, K, V>(args: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            args: args
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            ..Self::default()
        }
    }

    /// Derive a child scope that inherits from this one
    pub fn child(&self) -> Self {
        Self {
            parent: Some(Arc::new(self.clone())),
            args: IndexMap::new(),
            env: IndexMap::new(),
            namespace: self.namespace.clone(),
        }
    }

    /// Derive a child scope with one extra local binding
    pub fn with_argument(&self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let mut child = self.child();
        child.bind(name, value);
        child
    }

    /// Look up an argument, walking outward through parent scopes
    pub fn lookup(&self, name: &str) -> Option<&str> {
        match self.args.get(name) {
            Some(value) => Some(value.as_str()),
            None => self.parent.as_deref().and_then(|p| p.lookup(name)),
        }
    }

    /// Bind an argument in the local scope, replacing any local value
    pub fn bind(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.args.insert(name.into(), value.into());
    }

    /// Declare an argument: first writer wins.
    ///
    /// A binding anywhere in the enclosing scopes (including externally
    /// supplied arguments) takes precedence over `value`, which is only
    /// evaluated and bound locally when the name is unbound. Returns the
    /// value in effect after the declaration.
    pub fn declare(&mut self, name: &str, value: impl FnOnce() -> String) -> &str {
        if self.lookup(name).is_none() {
            self.args.insert(name.to_string(), value());
        }
        self.lookup(name).unwrap_or_default()
    }

    /// Set an environment override visible to this scope and its children
    pub fn set_env(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.env.insert(name.into(), value.into());
    }

    /// Scoped override first, then the process environment
    pub fn env_var(&self, name: &str) -> Option<String> {
        self.env_override(name)
            .map(str::to_string)
            .or_else(|| std::env::var(name).ok())
    }

    fn env_override(&self, name: &str) -> Option<&str> {
        match self.env.get(name) {
            Some(value) => Some(value.as_str()),
            None => self.parent.as_deref().and_then(|p| p.env_override(name)),
        }
    }

    /// All environment overrides visible from this scope, innermost winning
    pub fn environment(&self) -> IndexMap<String, String> {
        let mut env = self
            .parent
            .as_deref()
            .map(LaunchContext::environment)
            .unwrap_or_default();
        for (k, v) in &self.env {
            env.insert(k.clone(), v.clone());
        }
        env
    }

    /// All arguments visible from this scope, innermost winning
    pub fn arguments(&self) -> IndexMap<String, String> {
        let mut args = self
            .parent
            .as_deref()
            .map(LaunchContext::arguments)
            .unwrap_or_default();
        for (k, v) in &self.args {
            args.insert(k.clone(), v.clone());
        }
        args
    }

    /// Append a namespace segment to this scope
    pub fn push_namespace(&mut self, segment: &str) {
        self.namespace.extend(
            segment
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        );
    }

    /// The namespace path, e.g. `/robot1/arm`, or empty at the root
    pub fn namespace(&self) -> String {
        self.namespace
            .iter()
            .map(|segment| format!("/{segment}"))
            .collect()
    }

    /// Qualify a relative name with this scope's namespace
    pub fn qualify(&self, name: &str) -> String {
        if name.starts_with('/') || self.namespace.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.namespace(), name)
        }
    }
}
