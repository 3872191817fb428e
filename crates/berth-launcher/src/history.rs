use std::{
    path::PathBuf,
    sync::{Mutex, PoisonError},
};

use anyhow::Context;
use berth_process::WorkspacePath;

use crate::state_file;

/// Ordered list of opened workspaces, oldest first.
pub trait ProjectHistory: Send + Sync {
    fn get(&self) -> anyhow::Result<Vec<WorkspacePath>>;
    fn set(&self, paths: &[WorkspacePath]) -> anyhow::Result<()>;
}

/// Appends `path` unless it is already listed. Returns whether the list changed.
pub fn add_project(store: &dyn ProjectHistory, path: &WorkspacePath) -> anyhow::Result<bool> {
    let mut paths = store.get()?;
    if paths.contains(path) {
        return Ok(false);
    }
    paths.push(path.clone());
    store.set(&paths)?;
    Ok(true)
}

pub fn remove_project(store: &dyn ProjectHistory, path: &WorkspacePath) -> anyhow::Result<bool> {
    let mut paths = store.get()?;
    let before = paths.len();
    paths.retain(|p| p != path);
    if paths.len() == before {
        return Ok(false);
    }
    store.set(&paths)?;
    Ok(true)
}

/// Most recently opened first.
pub fn recent(store: &dyn ProjectHistory) -> anyhow::Result<Vec<WorkspacePath>> {
    let mut paths = store.get()?;
    paths.reverse();
    Ok(paths)
}

#[derive(Debug, Default)]
pub struct MemoryHistory {
    paths: Mutex<Vec<WorkspacePath>>,
}

impl ProjectHistory for MemoryHistory {
    fn get(&self) -> anyhow::Result<Vec<WorkspacePath>> {
        Ok(self
            .paths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn set(&self, paths: &[WorkspacePath]) -> anyhow::Result<()> {
        *self.paths.lock().unwrap_or_else(PoisonError::into_inner) = paths.to_vec();
        Ok(())
    }
}

/// History kept as a JSON array in a file. A missing or unreadable file reads as empty.
#[derive(Debug)]
pub struct JsonFileHistory {
    path: PathBuf,
}

impl JsonFileHistory {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl ProjectHistory for JsonFileHistory {
    fn get(&self) -> anyhow::Result<Vec<WorkspacePath>> {
        let raw = match std::fs::read(&self.path) {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("read {}", self.path.display()));
            }
        };
        match serde_json::from_slice::<Vec<WorkspacePath>>(&raw) {
            Ok(paths) => Ok(paths),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "ignoring corrupt project history");
                Ok(Vec::new())
            }
        }
    }

    fn set(&self, paths: &[WorkspacePath]) -> anyhow::Result<()> {
        state_file::write_json_atomic(&self.path, paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> WorkspacePath {
        WorkspacePath::from(s)
    }

    #[test]
    fn add_is_append_if_absent() {
        let store = MemoryHistory::default();
        assert!(add_project(&store, &p("/a")).unwrap());
        assert!(add_project(&store, &p("/b")).unwrap());
        assert!(!add_project(&store, &p("/a")).unwrap());
        assert_eq!(store.get().unwrap(), vec![p("/a"), p("/b")]);
        assert_eq!(recent(&store).unwrap(), vec![p("/b"), p("/a")]);
    }

    #[test]
    fn remove_drops_entry() {
        let store = MemoryHistory::default();
        store.set(&[p("/a"), p("/b")]).unwrap();
        assert!(remove_project(&store, &p("/a")).unwrap());
        assert!(!remove_project(&store, &p("/a")).unwrap());
        assert_eq!(store.get().unwrap(), vec![p("/b")]);
    }

    #[test]
    fn json_file_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("projects.json");

        let store = JsonFileHistory::new(path.clone());
        assert!(store.get().unwrap().is_empty());
        add_project(&store, &p("/home/me/one")).unwrap();
        add_project(&store, &p("/home/me/two")).unwrap();

        let reloaded = JsonFileHistory::new(path.clone());
        assert_eq!(
            reloaded.get().unwrap(),
            vec![p("/home/me/one"), p("/home/me/two")]
        );
        let raw = std::fs::read_to_string(path).unwrap();
        assert!(raw.contains("\"/home/me/one\""));
    }

    #[test]
    fn corrupt_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("projects.json");
        std::fs::write(&path, b"{not json").unwrap();
        let store = JsonFileHistory::new(path);
        assert!(store.get().unwrap().is_empty());
    }
}
