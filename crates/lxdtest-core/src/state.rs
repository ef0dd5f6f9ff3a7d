//! Instance request and state types
//!
//! `create` takes a [`TestInstance`] plus the caller's current
//! [`InstanceState`] and returns the updated state. The CLI keeps one JSON
//! file per instance so later commands can reconnect.

use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// The test instance a container is created for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestInstance {
    /// Instance name; also the container name
    pub name: String,
    /// Platform image reference passed to launch
    pub image: String,
}

impl TestInstance {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
        }
    }
}

/// What the caller knows about a created container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceState {
    pub name: Option<String>,
    pub hostname: Option<String>,
    pub ssh_key: Option<String>,
    pub username: Option<String>,
}

impl InstanceState {
    /// State for an instance that has only a name so far
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Container name, required before a connection can be built
    pub fn require_name(&self) -> Result<&str> {
        self.name
            .as_deref()
            .ok_or_else(|| CoreError::InvalidState("instance state has no container name".into()))
    }
}

/// Directory of per-instance state files
#[derive(Debug, Clone)]
pub struct InstanceStore {
    dir: PathBuf,
}

impl InstanceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store rooted under the lxdtest data directory
    pub fn open_default() -> Result<Self> {
        Ok(Self::new(lxdtest_config::Config::data_dir()?.join("instances")))
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    /// Load the state for `name`, or an empty named state if none was saved
    pub fn load(&self, name: &str) -> Result<InstanceState> {
        let path = self.path_for(name);
        if !path.exists() {
            tracing::debug!("No saved state for {} at {:?}", name, path);
            return Ok(InstanceState::named(name));
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, name: &str, state: &InstanceState) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let content = serde_json::to_string_pretty(state)?;
        atomic_write(&self.path_for(name), content.as_bytes())?;
        Ok(())
    }

    /// Remove the state file; missing files are not an error
    pub fn remove(&self, name: &str) -> Result<()> {
        match std::fs::remove_file(self.path_for(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Write via a temp file in the same directory, then rename over `path`
fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(content)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
