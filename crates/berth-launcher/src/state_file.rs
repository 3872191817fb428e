use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::{Serialize, de::DeserializeOwned};

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

/// Replaces `path` with `value` as pretty JSON. Readers see the old or the new file, never
/// a partial one.
pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    let data = serde_json::to_vec_pretty(value)
        .with_context(|| format!("encode {}", path.display()))?;
    let tmp = tmp_path(path);
    std::fs::write(&tmp, data).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("persist {}", path.display()))?;
    Ok(())
}

/// `Ok(None)` when the file does not exist.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    let value = serde_json::from_slice(&raw).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_leaves_no_tmp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("state.json");

        write_json_atomic(&path, &vec!["x", "y"]).unwrap();
        write_json_atomic(&path, &vec!["z"]).unwrap();

        let back: Option<Vec<String>> = read_json(&path).unwrap();
        assert_eq!(back, Some(vec!["z".to_string()]));
        assert!(!dir.path().join("a").join("state.json.tmp").exists());
    }

    #[test]
    fn missing_file_is_none_and_garbage_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        assert!(read_json::<Vec<String>>(&path).unwrap().is_none());

        std::fs::write(&path, b"[1,").unwrap();
        let err = read_json::<Vec<String>>(&path).unwrap_err();
        assert!(format!("{err:#}").contains("parse"));
    }
}
