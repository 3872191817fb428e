use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use berth_process::{InstanceState, InstanceStatus, WorkspacePath};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{Instrument, info_span};

use crate::boot_monitor::{BootFailure, BootMonitor, BootOutcome};
use crate::config::LauncherConfig;
use crate::console_log::{LogSink, RunInfo, instance_slug, write_run_json};
use crate::error::SupervisorError;
use crate::port_alloc::PortAllocator;
use crate::process_launcher::{
    LaunchSpec, LaunchedProcess, OUTPUT_DRAIN_TIMEOUT, ProcessEvent, ProcessLauncher,
};

/// Console lines attached to a boot failure warning.
const FAILURE_CONSOLE_LINES: usize = 20;

pub fn service_url(port: u16) -> String {
    format!("http://localhost:{port}")
}

type LaunchResult = Result<String, SupervisorError>;

#[derive(Clone)]
struct InstanceEntry {
    state: InstanceState,
    url: Option<String>,
    port: Option<u16>,
    pid: Option<u32>,
    /// Set once a port is claimed and the console is being captured.
    logs: Option<LogSink>,
    /// Resolves once the launch that created this entry settles.
    settled: watch::Receiver<Option<LaunchResult>>,
}

/// Keeps one backing server per workspace.
///
/// Cheap to clone; clones share the instance table.
#[derive(Clone)]
pub struct Supervisor {
    cfg: Arc<LauncherConfig>,
    ports: PortAllocator,
    launcher: Arc<dyn ProcessLauncher>,
    inner: Arc<Mutex<HashMap<WorkspacePath, InstanceEntry>>>,
}

impl Supervisor {
    pub fn new(cfg: LauncherConfig, launcher: Arc<dyn ProcessLauncher>) -> Self {
        let ports = PortAllocator::new(cfg.port_range.clone()).with_host_probe(cfg.probe_ports);
        Self {
            cfg: Arc::new(cfg),
            ports,
            launcher,
            inner: Arc::default(),
        }
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    fn instance_dir(&self, path: &WorkspacePath) -> PathBuf {
        self.cfg.instances_dir().join(instance_slug(path.as_str()))
    }

    /// Returns the URL of the server for `path`, starting one if needed.
    ///
    /// Concurrent calls for the same path share one launch and its result.
    pub async fn ensure_running(&self, path: &WorkspacePath) -> LaunchResult {
        let mut settled = {
            let mut inner = self.inner.lock().await;
            match inner.get(path) {
                Some(e) => {
                    if let (InstanceState::Running, Some(url)) = (e.state, &e.url) {
                        return Ok(url.clone());
                    }
                    tracing::debug!(path = %path, "joining pending launch");
                    e.settled.clone()
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    inner.insert(
                        path.clone(),
                        InstanceEntry {
                            state: InstanceState::Launching,
                            url: None,
                            port: None,
                            pid: None,
                            logs: None,
                            settled: rx.clone(),
                        },
                    );

                    // Detached so a caller that stops waiting cannot strand the entry.
                    let this = self.clone();
                    let key = path.clone();
                    let span = info_span!("launch", path = %key);
                    tokio::spawn(
                        async move {
                            let res = this.launch(&key).await;
                            this.settle(&key, &res).await;
                            let _ = tx.send(Some(res));
                        }
                        .instrument(span),
                    );
                    rx
                }
            }
        };

        let res = match settled.wait_for(Option::is_some).await {
            Ok(v) => (*v).clone(),
            Err(_) => None,
        };
        res.unwrap_or(Err(SupervisorError::Abandoned))
    }

    async fn update(&self, path: &WorkspacePath, f: impl FnOnce(&mut InstanceEntry)) {
        let mut inner = self.inner.lock().await;
        if let Some(e) = inner.get_mut(path) {
            f(e);
        }
    }

    async fn settle(&self, path: &WorkspacePath, res: &LaunchResult) {
        let mut inner = self.inner.lock().await;
        match res {
            Ok(_) => {
                if let Some(e) = inner.get_mut(path) {
                    e.state = InstanceState::Running;
                }
            }
            Err(_) => {
                inner.remove(path);
            }
        }
    }

    async fn launch(&self, path: &WorkspacePath) -> LaunchResult {
        let claim = match self.ports.claim_scoped(path) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "cannot start workspace server");
                return Err(e);
            }
        };
        let port = claim.port();
        let url = service_url(port);
        let dir = self.instance_dir(path);
        let logs = LogSink::with_file(&dir, &self.cfg);
        self.update(path, |e| {
            e.port = Some(port);
            e.url = Some(url.clone());
            e.logs = Some(logs.clone());
        })
        .await;

        let spec = LaunchSpec::new(
            path.clone(),
            port,
            self.cfg.server_exec.clone(),
            self.cfg.server_args.clone(),
            &self.cfg.addons_blacklist,
        )
        .with_terminate_grace(self.cfg.terminate_grace);

        let mut run = RunInfo::new(&spec, &url);
        tracing::info!(port, exec = %spec.exec.display(), "launching workspace server");
        logs.emit(format!(
            "[berth] exec: {} {} port={port} workspace={path}",
            spec.exec.display(),
            spec.args.join(" ")
        ))
        .await;

        let LaunchedProcess {
            pid,
            events,
            mut control,
        } = self.launcher.launch(&spec);
        self.update(path, |e| e.pid = pid).await;
        run.pid = pid;
        if let Err(e) = write_run_json(&dir, &run).await {
            tracing::debug!(error = %e, "run.json not written");
        }

        let (monitor, booted) = BootMonitor::new();
        let mut pump = tokio::spawn(
            pump_events(events, monitor, logs.clone()).in_current_span(),
        );

        let outcome = match self.cfg.boot_timeout {
            Some(limit) => match tokio::time::timeout(limit, booted).await {
                Ok(res) => res.unwrap_or(BootOutcome::Failure(BootFailure::Abandoned)),
                Err(_) => BootOutcome::Failure(BootFailure::TimedOut(limit)),
            },
            None => booted
                .await
                .unwrap_or(BootOutcome::Failure(BootFailure::Abandoned)),
        };

        let reason = match outcome {
            BootOutcome::Success => {
                claim.keep();
                tracing::info!(%url, ?pid, "workspace server is up");
                logs.emit(format!("[berth] listening at {url}")).await;
                return Ok(url);
            }
            BootOutcome::Failure(reason) => reason,
        };

        // A server that exited may still have left children behind; a hung one is
        // still running. Either way the group goes, and the port is held until the
        // event stream ends so nobody else races the process for the bind.
        control.terminate();
        let settle = self.cfg.terminate_grace + OUTPUT_DRAIN_TIMEOUT + Duration::from_secs(1);
        if tokio::time::timeout(settle, &mut pump).await.is_err() {
            tracing::warn!(port, "server output did not end after termination; detaching");
            pump.abort();
        }

        let err = match reason {
            BootFailure::Exited(code) => SupervisorError::BootFailure { code },
            BootFailure::LaunchError(msg) => SupervisorError::LaunchError(msg),
            BootFailure::TimedOut(limit) => SupervisorError::BootTimeout(limit),
            BootFailure::Abandoned => SupervisorError::Abandoned,
        };
        let console = logs.recent(FAILURE_CONSOLE_LINES).await;
        tracing::warn!(
            port,
            error = %err,
            console = %console.join("\n"),
            "workspace server failed to boot"
        );
        logs.emit(format!("[berth] boot failed: {err}")).await;
        drop(claim);
        Err(err)
    }

    pub async fn url_of(&self, path: &WorkspacePath) -> Option<String> {
        let inner = self.inner.lock().await;
        let e = inner.get(path)?;
        match e.state {
            InstanceState::Running => e.url.clone(),
            InstanceState::Launching => None,
        }
    }

    pub async fn status(&self, path: &WorkspacePath) -> Option<InstanceStatus> {
        let inner = self.inner.lock().await;
        inner.get(path).map(|e| to_status(path, e))
    }

    pub async fn list(&self) -> Vec<InstanceStatus> {
        let inner = self.inner.lock().await;
        let mut out: Vec<InstanceStatus> = inner.iter().map(|(p, e)| to_status(p, e)).collect();
        out.sort_by(|a, b| a.path.cmp(&b.path));
        out
    }

    /// Up to `limit` of the newest console lines captured for `path`, oldest first.
    ///
    /// `None` while nothing is captured: no instance, or its port is not claimed yet.
    pub async fn tail_logs(&self, path: &WorkspacePath, limit: usize) -> Option<Vec<String>> {
        let logs = {
            let inner = self.inner.lock().await;
            inner.get(path)?.logs.clone()?
        };
        Some(logs.recent(limit).await)
    }
}

fn to_status(path: &WorkspacePath, e: &InstanceEntry) -> InstanceStatus {
    InstanceStatus {
        path: path.clone(),
        state: e.state,
        url: e.url.clone(),
        port: e.port,
        pid: e.pid,
    }
}

/// Drains one process's events into its console log and boot monitor.
///
/// Keeps running after boot so the console stays captured for the instance's lifetime.
async fn pump_events(
    mut events: mpsc::UnboundedReceiver<ProcessEvent>,
    mut monitor: BootMonitor,
    logs: LogSink,
) {
    while let Some(event) = events.recv().await {
        match &event {
            ProcessEvent::Stdout(chunk) => logs.stdout_chunk(chunk).await,
            ProcessEvent::Stderr(chunk) => logs.stderr_chunk(chunk).await,
            ProcessEvent::Exited(code) => {
                logs.flush().await;
                logs.emit(format!("[berth] process exited: exit_code={code:?}"))
                    .await;
                if monitor.is_booted() {
                    // No reaping: the instance stays recorded at its URL.
                    tracing::warn!(exit_code = ?code, "workspace server exited after boot");
                }
            }
            ProcessEvent::LaunchError(err) => {
                logs.emit(format!("[berth] launch error: {err}")).await;
            }
        }
        monitor.observe(&event);
    }
    logs.flush().await;
    monitor.finish();
}
