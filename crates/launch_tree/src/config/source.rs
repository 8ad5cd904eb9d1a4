//! Where launch descriptions come from

use crate::config::{LaunchDescription, LaunchFileError};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Loads and parses launch descriptions by path
pub trait DescriptionSource: Send + Sync {
    /// Load and parse the description at `path`
    fn load(&self, path: &str) -> Result<Arc<LaunchDescription>, LaunchFileError>;

    /// Stable key for `path`, used for include cycle detection
    fn canonical(&self, path: &str) -> String {
        path.to_string()
    }
}

/// Descriptions read from YAML files, relative paths resolved against `root`
pub struct FileSource {
    root: PathBuf,
    cache: Mutex<HashMap<PathBuf, Arc<LaunchDescription>>>,
}

impl FileSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// A source rooted at the current working directory
    pub fn current_dir() -> Self {
        Self::new(std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }

    fn full_path(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        std::fs::canonicalize(&joined).unwrap_or(joined)
    }
}

impl DescriptionSource for FileSource {
    fn load(&self, path: &str) -> Result<Arc<LaunchDescription>, LaunchFileError> {
        let full_path = self.full_path(path);
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(description) = cache.get(&full_path) {
            return Ok(Arc::clone(description));
        }

        log::debug!("Loading launch description: {}", full_path.display());
        let description = Arc::new(LaunchDescription::from_file(&full_path.to_string_lossy())?);
        cache.insert(full_path, Arc::clone(&description));
        Ok(description)
    }

    fn canonical(&self, path: &str) -> String {
        self.full_path(path).to_string_lossy().into_owned()
    }
}

/// Descriptions held in memory, keyed by path
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    files: IndexMap<String, String>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a YAML document under `path`
    pub fn with_file(mut self, path: impl Into<String>, yaml: impl Into<String>) -> Self {
        self.files.insert(path.into(), yaml.into());
        self
    }
}

impl DescriptionSource for MemorySource {
    fn load(&self, path: &str) -> Result<Arc<LaunchDescription>, LaunchFileError> {
        let yaml = self
            .files
            .get(path)
            .ok_or_else(|| LaunchFileError::NotFound(path.to_string()))?;
        LaunchDescription::from_yaml(yaml).map(Arc::new)
    }
}
