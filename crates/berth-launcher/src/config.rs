use std::{
    ops::Range,
    path::PathBuf,
    time::Duration,
};

const DEFAULT_PORT_LOW: u16 = 19000;
const DEFAULT_PORT_HIGH: u16 = 20000;
const DEFAULT_SERVER_EXEC: &str = "bin/server";
const DEFAULT_ADDONS_BLACKLIST: &str = "cb.offline";
const DEFAULT_BOOT_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_LOG_MAX_LINES: usize = 1000;
const DEFAULT_LOG_FILE_MAX_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB
const DEFAULT_LOG_FILE_MAX_FILES: usize = 3;

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

pub(crate) fn env_u16(name: &str) -> Option<u16> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u16>().ok())
}

pub(crate) fn env_bool(name: &str) -> Option<bool> {
    let v = std::env::var(name).ok()?;
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn absolutize(p: PathBuf) -> PathBuf {
    if p.is_absolute() {
        return p;
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(p)
}

pub(crate) fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Runtime settings for the launcher, read once at startup.
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Half-open range `[low, high)` ports are handed out from.
    pub port_range: Range<u16>,
    /// Skip ports some other host process already has bound.
    pub probe_ports: bool,
    pub server_exec: PathBuf,
    pub server_args: Vec<String>,
    /// Addon modules the embedded server should not load.
    pub addons_blacklist: Vec<String>,
    /// `None` waits for the boot sentinel forever.
    pub boot_timeout: Option<Duration>,
    pub terminate_grace: Duration,
    pub data_root: PathBuf,
    pub log_max_lines: usize,
    pub log_file_max_bytes: u64,
    pub log_file_max_files: usize,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            port_range: DEFAULT_PORT_LOW..DEFAULT_PORT_HIGH,
            probe_ports: false,
            server_exec: PathBuf::from(DEFAULT_SERVER_EXEC),
            server_args: vec!["run".to_string()],
            addons_blacklist: parse_list(DEFAULT_ADDONS_BLACKLIST),
            boot_timeout: Some(Duration::from_millis(DEFAULT_BOOT_TIMEOUT_MS)),
            terminate_grace: Duration::from_secs(5),
            data_root: PathBuf::from("./data"),
            log_max_lines: DEFAULT_LOG_MAX_LINES,
            log_file_max_bytes: DEFAULT_LOG_FILE_MAX_BYTES,
            log_file_max_files: DEFAULT_LOG_FILE_MAX_FILES,
        }
    }
}

impl LauncherConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let low = env_u16("BERTH_PORT_LOW").unwrap_or(DEFAULT_PORT_LOW);
        let high = env_u16("BERTH_PORT_HIGH").unwrap_or(DEFAULT_PORT_HIGH);
        if low == 0 || high <= low {
            anyhow::bail!(
                "invalid port range: BERTH_PORT_LOW={low} BERTH_PORT_HIGH={high} (need 0 < low < high)"
            );
        }

        let server_exec = std::env::var("BERTH_SERVER_EXEC")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.server_exec);

        let addons_blacklist = std::env::var("BERTH_ADDONS_BLACKLIST")
            .map(|v| parse_list(&v))
            .unwrap_or(defaults.addons_blacklist);

        // 0 disables the boot timeout.
        let boot_timeout = match env_u64("BERTH_BOOT_TIMEOUT_MS") {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms.clamp(1000, 30 * 60 * 1000))),
            None => defaults.boot_timeout,
        };

        let terminate_grace = env_u64("BERTH_TERM_GRACE_SEC")
            .map(|v| Duration::from_secs(v.clamp(1, 60)))
            .unwrap_or(defaults.terminate_grace);

        let data_root = std::env::var("BERTH_DATA_ROOT")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.data_root);

        Ok(Self {
            port_range: low..high,
            probe_ports: env_bool("BERTH_PORT_PROBE").unwrap_or(false),
            server_exec: absolutize(server_exec),
            server_args: defaults.server_args,
            addons_blacklist,
            boot_timeout,
            terminate_grace,
            data_root: absolutize(data_root),
            log_max_lines: env_usize("BERTH_LOG_MAX_LINES")
                .map(|v| v.clamp(100, 50_000))
                .unwrap_or(DEFAULT_LOG_MAX_LINES),
            log_file_max_bytes: env_u64("BERTH_LOG_FILE_MAX_BYTES")
                .map(|v| v.clamp(256 * 1024, 1024 * 1024 * 1024))
                .unwrap_or(DEFAULT_LOG_FILE_MAX_BYTES),
            log_file_max_files: env_usize("BERTH_LOG_FILE_MAX_FILES")
                .map(|v| v.clamp(1, 20))
                .unwrap_or(DEFAULT_LOG_FILE_MAX_FILES),
        })
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.data_root.join("instances")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_root.join("logs")
    }

    pub fn history_file(&self) -> PathBuf {
        self.data_root.join("projects.json")
    }
}
