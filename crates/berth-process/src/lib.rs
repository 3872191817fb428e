use std::fmt;

/// Workspace directory a backing server instance serves.
///
/// NOTE: This is an opaque key. It is compared as given and never canonicalized here,
/// so callers decide whether `/a/b` and `/a/b/` name the same workspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct WorkspacePath(pub String);

impl WorkspacePath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path segment, used as a display title.
    pub fn name(&self) -> &str {
        let trimmed = self.0.trim_end_matches(['/', '\\']);
        trimmed
            .rsplit(['/', '\\'])
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.0)
    }
}

impl fmt::Display for WorkspacePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkspacePath {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for WorkspacePath {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum InstanceState {
    Launching,
    Running,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InstanceStatus {
    pub path: WorkspacePath,
    pub state: InstanceState,
    pub url: Option<String>,
    pub port: Option<u16>,
    pub pid: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_name_is_last_segment() {
        assert_eq!(WorkspacePath::from("/home/me/project").name(), "project");
        assert_eq!(WorkspacePath::from("/home/me/project/").name(), "project");
        assert_eq!(WorkspacePath::from("C:\\work\\site").name(), "site");
        assert_eq!(WorkspacePath::from("plain").name(), "plain");
    }

    #[test]
    fn workspace_path_serializes_as_string() {
        let p = WorkspacePath::from("/a");
        assert_eq!(serde_json::to_string(&p).unwrap(), "\"/a\"");
    }
}
