use std::sync::Arc;

use anyhow::Context;
use berth_process::WorkspacePath;

use crate::error::format_error_chain;
use crate::history::{self, ProjectHistory};
use crate::supervisor::Supervisor;
use crate::window::WindowManager;

/// What the launcher UI talks to: opening a project records it, makes sure its server
/// runs and shows it in a window.
#[derive(Clone)]
pub struct Desktop {
    supervisor: Supervisor,
    windows: Arc<dyn WindowManager>,
    history: Arc<dyn ProjectHistory>,
}

impl Desktop {
    pub fn new(
        supervisor: Supervisor,
        windows: Arc<dyn WindowManager>,
        history: Arc<dyn ProjectHistory>,
    ) -> Self {
        Self {
            supervisor,
            windows,
            history,
        }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub async fn open_project(&self, path: &WorkspacePath) -> anyhow::Result<String> {
        // A broken history file must not keep the project from opening.
        if let Err(e) = history::add_project(self.history.as_ref(), path) {
            tracing::warn!(path = %path, error = %format_error_chain(&e), "failed to record project");
        }

        let url = self
            .supervisor
            .ensure_running(path)
            .await
            .with_context(|| format!("start server for {path}"))?;

        self.windows.open_or_focus(&url)?;
        Ok(url)
    }

    pub fn recent_projects(&self) -> anyhow::Result<Vec<WorkspacePath>> {
        history::recent(self.history.as_ref())
    }

    pub fn forget_project(&self, path: &WorkspacePath) -> anyhow::Result<bool> {
        history::remove_project(self.history.as_ref(), path)
    }
}
