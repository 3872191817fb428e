use std::{path::Path, sync::Arc};

use anyhow::Context;
use berth_launcher::{
    config::LauncherConfig,
    console_log::{instance_slug, read_console_tail, read_run_json},
    desktop::Desktop,
    error::format_error_chain,
    history::JsonFileHistory,
    process_launcher::CommandLauncher,
    supervisor::Supervisor,
    window::{BrowserBackend, WindowRegistry},
};
use berth_process::WorkspacePath;
use clap::{Parser, Subcommand};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Parser)]
#[command(name = "berth", version, about = "Run one workspace server per project and open it")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start (or reuse) servers for the given workspaces and open them.
    ///
    /// Without a path, reopens the most recent project. Servers stay up until berth exits.
    Open {
        paths: Vec<String>,
        /// Print instance status as JSON once everything has booted.
        #[arg(long)]
        json: bool,
    },
    /// List recently opened projects, newest first.
    Recent,
    /// Remove a project from the recent list.
    Forget { path: String },
    /// Print the newest lines of a workspace server's console.
    Logs {
        path: String,
        /// Number of lines to print.
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
    },
}

fn init_tracing(logs_dir: &Path) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("create {}", logs_dir.display()))?;
    let file = rolling::RollingFileAppender::builder()
        .rotation(rolling::Rotation::DAILY)
        .filename_prefix("berth")
        .filename_suffix("log")
        .build(logs_dir)
        .context("init log file")?;
    let (file_writer, guard) = tracing_appender::non_blocking(file);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();
    Ok(guard)
}

/// Workspace keys are canonical directory paths so `./site` and `/home/me/site` share
/// one server.
fn workspace_arg(raw: &str) -> anyhow::Result<WorkspacePath> {
    let dir = std::fs::canonicalize(raw).with_context(|| format!("resolve {raw}"))?;
    if !dir.is_dir() {
        anyhow::bail!("not a directory: {}", dir.display());
    }
    Ok(WorkspacePath::new(dir.display().to_string()))
}

/// Reads what a `berth open` (possibly another one) captured for `path`.
fn logs(instances_dir: &Path, path: &WorkspacePath, lines: usize) -> anyhow::Result<()> {
    let dir = instances_dir.join(instance_slug(path.as_str()));
    let Some(run) = read_run_json(&dir)? else {
        anyhow::bail!("{path} has never been launched");
    };
    println!(
        "# {} pid={} {}",
        run.url,
        run.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
        run.command.join(" ")
    );
    for line in read_console_tail(&dir, lines)? {
        println!("{line}");
    }
    Ok(())
}

async fn open(desktop: &Desktop, paths: Vec<String>, json: bool) -> anyhow::Result<()> {
    let targets = if paths.is_empty() {
        let recent = desktop.recent_projects()?;
        let Some(last) = recent.into_iter().next() else {
            anyhow::bail!("no recent projects; pass a workspace directory");
        };
        vec![last]
    } else {
        paths
            .iter()
            .map(|p| workspace_arg(p))
            .collect::<anyhow::Result<Vec<_>>>()?
    };

    let mut tasks = Vec::new();
    for path in targets {
        let desktop = desktop.clone();
        tasks.push(tokio::spawn(async move {
            let res = desktop.open_project(&path).await;
            (path, res)
        }));
    }

    let mut opened = 0usize;
    for task in tasks {
        let (path, res) = task.await.context("open task panicked")?;
        match res {
            Ok(url) => {
                opened += 1;
                println!("{path}\t{url}");
            }
            Err(e) => {
                eprintln!("{path}\terror: {}", format_error_chain(&e));
            }
        }
    }

    if json {
        let list = desktop.supervisor().list().await;
        println!("{}", serde_json::to_string_pretty(&list)?);
    }

    if opened == 0 {
        anyhow::bail!("no workspace server could be started");
    }

    tracing::info!(opened, "servers running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("wait for Ctrl-C")?;
    tracing::info!("shutting down");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = LauncherConfig::from_env()?;
    let _guard = init_tracing(&cfg.logs_dir())?;

    let instances_dir = cfg.instances_dir();
    let history = Arc::new(JsonFileHistory::new(cfg.history_file()));
    let windows = Arc::new(WindowRegistry::new(BrowserBackend::default()));
    let supervisor = Supervisor::new(cfg, Arc::new(CommandLauncher));
    let desktop = Desktop::new(supervisor, windows, history);

    match cli.command {
        Command::Open { paths, json } => open(&desktop, paths, json).await,
        Command::Recent => {
            let recent = desktop.recent_projects()?;
            if recent.is_empty() {
                println!("No recent folders");
            }
            for path in recent {
                println!("{}\t{}", path.name(), path);
            }
            Ok(())
        }
        Command::Forget { path } => {
            // Directories that no longer exist are still forgettable by their stored path.
            let path = workspace_arg(&path).unwrap_or_else(|_| WorkspacePath::new(path));
            if !desktop.forget_project(&path)? {
                anyhow::bail!("not in recent projects: {path}");
            }
            Ok(())
        }
        Command::Logs { path, lines } => {
            let path = workspace_arg(&path).unwrap_or_else(|_| WorkspacePath::new(path));
            logs(&instances_dir, &path, lines)
        }
    }
}
