use std::{
    collections::BTreeMap,
    path::PathBuf,
    process::Stdio,
    time::Duration,
};

use berth_process::WorkspacePath;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    sync::{mpsc, oneshot},
};

/// Environment variable carrying the workspace directory to the server.
pub const ENV_WORKSPACE_DIR: &str = "WORKSPACE_DIR";
/// Environment variable carrying the port the server binds.
pub const ENV_PORT: &str = "PORT";
/// Environment variable listing addon modules the server must not load.
pub const ENV_ADDONS_BLACKLIST: &str = "WORKSPACE_ADDONS_BLACKLIST";

const READ_CHUNK_BYTES: usize = 8 * 1024;
pub(crate) const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Something observed on a launched server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Stdout(String),
    Stderr(String),
    Exited(Option<i32>),
    LaunchError(String),
}

/// What to run for one workspace.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub workspace: WorkspacePath,
    pub port: u16,
    pub exec: PathBuf,
    pub args: Vec<String>,
    /// Set on top of the inherited environment.
    pub env: BTreeMap<String, String>,
    pub terminate_grace: Duration,
}

impl LaunchSpec {
    pub fn new(
        workspace: WorkspacePath,
        port: u16,
        exec: PathBuf,
        args: Vec<String>,
        addons_blacklist: &[String],
    ) -> Self {
        let mut env = BTreeMap::new();
        env.insert(ENV_WORKSPACE_DIR.to_string(), workspace.to_string());
        env.insert(ENV_PORT.to_string(), port.to_string());
        env.insert(ENV_ADDONS_BLACKLIST.to_string(), addons_blacklist.join(","));
        Self {
            workspace,
            port,
            exec,
            args,
            env,
            terminate_grace: Duration::from_secs(5),
        }
    }

    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }
}

/// Handle used to stop a launched process.
#[derive(Debug)]
pub struct ProcessControl {
    kill_tx: Option<oneshot::Sender<()>>,
}

impl ProcessControl {
    pub fn new(kill_tx: oneshot::Sender<()>) -> Self {
        Self {
            kill_tx: Some(kill_tx),
        }
    }

    /// A control for a process that never started.
    pub fn detached() -> Self {
        Self { kill_tx: None }
    }

    /// Asks the process to terminate. The exit still arrives as [`ProcessEvent::Exited`].
    pub fn terminate(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A spawned server process.
///
/// `events` yields output chunks in arrival order and ends after exactly one of
/// `Exited` / `LaunchError`.
#[derive(Debug)]
pub struct LaunchedProcess {
    pub pid: Option<u32>,
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
    pub control: ProcessControl,
}

impl LaunchedProcess {
    /// A process whose spawn failed; the failure is delivered as its only event.
    pub fn failed(err: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(ProcessEvent::LaunchError(err.into()));
        Self {
            pid: None,
            events: rx,
            control: ProcessControl::detached(),
        }
    }
}

pub trait ProcessLauncher: Send + Sync + 'static {
    /// Starts the server described by `spec`. Spawn failures are reported through the
    /// returned event stream rather than as an error.
    fn launch(&self, spec: &LaunchSpec) -> LaunchedProcess;
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the launcher dies (crash/kill), take the server down with it.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn signal_group(pgid: i32, sig: i32) {
    unsafe {
        libc::kill(-pgid, sig);
    }
}

fn forward_chunks<R>(
    mut reader: R,
    tx: mpsc::UnboundedSender<ProcessEvent>,
    wrap: fn(String) -> ProcessEvent,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK_BYTES];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                    if tx.send(wrap(chunk)).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// Launches the server as a real child process.
#[derive(Debug, Default, Clone)]
pub struct CommandLauncher;

impl ProcessLauncher for CommandLauncher {
    fn launch(&self, spec: &LaunchSpec) -> LaunchedProcess {
        let mut cmd = Command::new(&spec.exec);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return LaunchedProcess::failed(format!(
                    "spawn {}: {e}",
                    spec.exec.display()
                ));
            }
        };

        let pid = child.id();
        let (tx, rx) = mpsc::unbounded_channel();
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();

        let stdout = child
            .stdout
            .take()
            .map(|out| forward_chunks(out, tx.clone(), ProcessEvent::Stdout));
        let stderr = child
            .stderr
            .take()
            .map(|err| forward_chunks(err, tx.clone(), ProcessEvent::Stderr));

        let grace = spec.terminate_grace;
        tokio::spawn(async move {
            let res = tokio::select! {
                res = child.wait() => res,
                Ok(()) = &mut kill_rx => {
                    // SIGTERM the whole group first, SIGKILL whatever is left after the grace.
                    #[cfg(unix)]
                    if let Some(pid) = pid {
                        signal_group(pid as i32, libc::SIGTERM);
                    }
                    match tokio::time::timeout(grace, child.wait()).await {
                        Ok(res) => res,
                        Err(_) => {
                            #[cfg(unix)]
                            if let Some(pid) = pid {
                                signal_group(pid as i32, libc::SIGKILL);
                            }
                            let _ = child.start_kill();
                            child.wait().await
                        }
                    }
                }
            };

            // Deliver remaining output before the exit event. A reader still blocked after
            // the drain window means something the server started holds the pipe; the
            // stream must end with the leader, so drop the reader and the leftovers.
            let mut lingering = false;
            for mut reader in [stdout, stderr].into_iter().flatten() {
                if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut reader)
                    .await
                    .is_err()
                {
                    reader.abort();
                    lingering = true;
                }
            }
            if lingering {
                tracing::debug!(?pid, "server left processes holding its output; killing group");
                #[cfg(unix)]
                if let Some(pid) = pid {
                    signal_group(pid as i32, libc::SIGKILL);
                }
            }

            let event = match res {
                Ok(status) => ProcessEvent::Exited(status.code()),
                Err(e) => ProcessEvent::LaunchError(format!("wait failed: {e}")),
            };
            let _ = tx.send(event);
        });

        LaunchedProcess {
            pid,
            events: rx,
            control: ProcessControl::new(kill_tx),
        }
    }
}
