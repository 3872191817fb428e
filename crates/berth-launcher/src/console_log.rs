use std::{
    collections::{BTreeMap, VecDeque},
    ffi::OsString,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tokio::{
    io::AsyncWriteExt,
    sync::{Mutex, mpsc},
};

use crate::config::LauncherConfig;
use crate::process_launcher::LaunchSpec;
use crate::state_file;

const RUN_FILE: &str = "run.json";

/// Stable per-workspace directory name (workspace paths are not safe file names).
pub fn instance_slug(workspace: &str) -> String {
    let digest = Sha1::digest(workspace.as_bytes());
    hex::encode(&digest[..8])
}

pub fn console_path(instance_dir: &Path) -> PathBuf {
    instance_dir.join("logs").join("console.log")
}

/// `console.log` -> `console.log.<n>`; 1 is the most recently rolled file.
fn rolled_path(current: &Path, n: usize) -> PathBuf {
    let mut name = OsString::from(current.as_os_str());
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

/// The last lines an instance printed, newest at the back.
#[derive(Debug)]
pub struct ConsoleBuffer {
    capacity: usize,
    lines: VecDeque<String>,
    dropped: u64,
}

impl ConsoleBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            lines: VecDeque::new(),
            dropped: 0,
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
            self.dropped += 1;
        }
        self.lines.push_back(line);
    }

    /// Up to `limit` of the newest lines, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(limit);
        self.lines.iter().skip(skip).cloned().collect()
    }

    /// Lines pushed out by newer output since the instance started.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Splits a chunked stream into lines; a trailing partial line waits for the next chunk.
#[derive(Debug, Default)]
struct LineSplitter {
    partial: String,
}

impl LineSplitter {
    fn push(&mut self, chunk: &str) -> Vec<String> {
        self.partial.push_str(chunk);
        let mut out = Vec::new();
        while let Some(idx) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=idx).collect();
            out.push(line.trim_end_matches(['\r', '\n']).to_string());
        }
        out
    }

    fn flush(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.partial))
    }
}

/// One instance's console: recent lines in memory and, optionally, a rolled file on disk.
#[derive(Clone)]
pub struct LogSink {
    recent: Arc<Mutex<ConsoleBuffer>>,
    file_tx: Option<mpsc::UnboundedSender<String>>,
    stdout: Arc<Mutex<LineSplitter>>,
    stderr: Arc<Mutex<LineSplitter>>,
}

impl LogSink {
    pub fn memory(max_lines: usize) -> Self {
        Self {
            recent: Arc::new(Mutex::new(ConsoleBuffer::new(max_lines))),
            file_tx: None,
            stdout: Arc::default(),
            stderr: Arc::default(),
        }
    }

    /// Also appends every line to `<instance_dir>/logs/console.log` from a background task.
    pub fn with_file(instance_dir: &Path, cfg: &LauncherConfig) -> Self {
        let mut sink = Self::memory(cfg.log_max_lines);
        let path = console_path(instance_dir);
        let (max_bytes, keep) = (cfg.log_file_max_bytes, cfg.log_file_max_files);
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            match ConsoleFile::open(path.clone(), max_bytes, keep).await {
                Ok(file) => file.run(rx).await,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "console log unavailable");
                }
            }
        });
        sink.file_tx = Some(tx);
        sink
    }

    pub async fn recent(&self, limit: usize) -> Vec<String> {
        self.recent.lock().await.recent(limit)
    }

    pub async fn emit(&self, line: impl Into<String>) {
        let line = line.into();
        if let Some(tx) = &self.file_tx {
            let _ = tx.send(line.clone());
        }
        self.recent.lock().await.push(line);
    }

    pub async fn stdout_chunk(&self, chunk: &str) {
        let lines = self.stdout.lock().await.push(chunk);
        for line in lines {
            self.emit(format!("[stdout] {line}")).await;
        }
    }

    pub async fn stderr_chunk(&self, chunk: &str) {
        let lines = self.stderr.lock().await.push(chunk);
        for line in lines {
            self.emit(format!("[stderr] {line}")).await;
        }
    }

    /// Emits whatever partial lines are still pending.
    pub async fn flush(&self) {
        if let Some(line) = self.stdout.lock().await.flush() {
            self.emit(format!("[stdout] {line}")).await;
        }
        if let Some(line) = self.stderr.lock().await.flush() {
            self.emit(format!("[stderr] {line}")).await;
        }
    }
}

/// Append-only console file that rolls to `console.log.1..=keep` once it would exceed
/// `max_bytes` (0 never rolls).
struct ConsoleFile {
    path: PathBuf,
    max_bytes: u64,
    keep: usize,
    len: u64,
    out: tokio::fs::File,
}

impl ConsoleFile {
    async fn open(path: PathBuf, max_bytes: u64, keep: usize) -> std::io::Result<Self> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let out = Self::append_handle(&path).await?;
        let len = out.metadata().await.map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            max_bytes,
            keep,
            len,
            out,
        })
    }

    async fn append_handle(path: &Path) -> std::io::Result<tokio::fs::File> {
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
    }

    /// Writes lines as they arrive, batching whatever queued up during the last write.
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<String>) {
        while let Some(first) = rx.recv().await {
            let mut batch = first;
            batch.push('\n');
            while let Ok(line) = rx.try_recv() {
                batch.push_str(&line);
                batch.push('\n');
            }
            if let Err(e) = self.append(&batch).await {
                tracing::debug!(path = %self.path.display(), error = %e, "console write failed");
            }
        }
    }

    async fn append(&mut self, batch: &str) -> std::io::Result<()> {
        let n = batch.len() as u64;
        if self.max_bytes > 0 && self.len > 0 && self.len + n > self.max_bytes {
            self.roll().await?;
        }
        self.out.write_all(batch.as_bytes()).await?;
        self.out.flush().await?;
        self.len += n;
        Ok(())
    }

    async fn roll(&mut self) -> std::io::Result<()> {
        self.out.flush().await?;
        if self.keep == 0 {
            self.out.set_len(0).await?;
            self.len = 0;
            return Ok(());
        }

        // The oldest segment falls off; the rest shift up by one.
        let _ = tokio::fs::remove_file(rolled_path(&self.path, self.keep)).await;
        for n in (1..self.keep).rev() {
            let from = rolled_path(&self.path, n);
            if tokio::fs::try_exists(&from).await.unwrap_or(false) {
                tokio::fs::rename(&from, rolled_path(&self.path, n + 1)).await?;
            }
        }
        tokio::fs::rename(&self.path, rolled_path(&self.path, 1)).await?;

        self.out = Self::append_handle(&self.path).await?;
        self.len = 0;
        Ok(())
    }
}

/// The newest `limit` lines written to an instance's console file, reaching back into
/// rolled segments when the current file is short.
pub fn read_console_tail(instance_dir: &Path, limit: usize) -> anyhow::Result<Vec<String>> {
    let current = console_path(instance_dir);
    let mut out = VecDeque::new();
    let mut segment = 0;
    'segments: while out.len() < limit {
        let path = match segment {
            0 => current.clone(),
            n => rolled_path(&current, n),
        };
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        for line in text.lines().rev() {
            if out.len() == limit {
                break 'segments;
            }
            out.push_front(line.to_string());
        }
        segment += 1;
    }
    Ok(out.into())
}

/// What was launched for an instance, kept as `run.json` next to its console log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInfo {
    pub workspace: String,
    pub url: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub command: Vec<String>,
    /// Only the variables the launcher sets; the rest is inherited.
    pub env: BTreeMap<String, String>,
    pub started_at_unix_ms: u64,
}

impl RunInfo {
    pub fn new(spec: &LaunchSpec, url: &str) -> Self {
        let started_at_unix_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let command = std::iter::once(spec.exec.display().to_string())
            .chain(spec.args.iter().cloned())
            .collect();
        Self {
            workspace: spec.workspace.to_string(),
            url: url.to_string(),
            port: spec.port,
            pid: None,
            command,
            env: spec.env.clone(),
            started_at_unix_ms,
        }
    }
}

pub async fn write_run_json(instance_dir: &Path, info: &RunInfo) -> anyhow::Result<()> {
    let path = instance_dir.join(RUN_FILE);
    let info = info.clone();
    tokio::task::spawn_blocking(move || state_file::write_json_atomic(&path, &info))
        .await
        .context("run.json writer panicked")?
}

pub fn read_run_json(instance_dir: &Path) -> anyhow::Result<Option<RunInfo>> {
    state_file::read_json(&instance_dir.join(RUN_FILE))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn slug_is_stable_and_path_safe() {
        let a = instance_slug("/home/me/site");
        assert_eq!(a, instance_slug("/home/me/site"));
        assert_ne!(a, instance_slug("/home/me/other"));
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn buffer_keeps_newest_lines() {
        let mut buf = ConsoleBuffer::new(3);
        for line in ["a", "b", "c", "d", "e"] {
            buf.push(line.to_string());
        }
        assert_eq!(buf.recent(10), vec!["c", "d", "e"]);
        assert_eq!(buf.recent(2), vec!["d", "e"]);
        assert!(buf.recent(0).is_empty());
        assert_eq!(buf.dropped(), 2);
    }

    #[test]
    fn splitter_holds_partial_lines() {
        let mut s = LineSplitter::default();
        assert!(s.push("Starting").is_empty());
        assert_eq!(s.push(" up...\r\nready\n"), vec!["Starting up...", "ready"]);
        assert_eq!(s.push("tail"), Vec::<String>::new());
        assert_eq!(s.flush(), Some("tail".to_string()));
        assert_eq!(s.flush(), None);
    }

    #[tokio::test]
    async fn sink_tags_streams() {
        let sink = LogSink::memory(100);
        sink.stdout_chunk("one\ntw").await;
        sink.stderr_chunk("oops\n").await;
        sink.stdout_chunk("o\n").await;
        assert_eq!(
            sink.recent(10).await,
            vec!["[stdout] one", "[stderr] oops", "[stdout] two"]
        );
    }

    #[tokio::test]
    async fn console_file_rolls_and_drops_oldest_segment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.log");
        let mut file = ConsoleFile::open(path.clone(), 16, 2).await.unwrap();
        for batch in ["first one\n", "second one\n", "third one\n", "fourth one\n"] {
            file.append(batch).await.unwrap();
        }

        let read = |p: PathBuf| std::fs::read_to_string(p).unwrap();
        assert_eq!(read(path.clone()), "fourth one\n");
        assert_eq!(read(rolled_path(&path, 1)), "third one\n");
        assert_eq!(read(rolled_path(&path, 2)), "second one\n");
        assert!(!rolled_path(&path, 3).exists());
    }

    #[tokio::test]
    async fn tail_reads_back_through_rolled_segments() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = ConsoleFile::open(console_path(dir.path()), 12, 3).await.unwrap();
        for i in 1..=5 {
            file.append(&format!("line {i}\n")).await.unwrap();
        }

        assert_eq!(read_console_tail(dir.path(), 3).unwrap(), vec!["line 3", "line 4", "line 5"]);
        assert_eq!(read_console_tail(dir.path(), 100).unwrap().len(), 4);
        assert!(read_console_tail(&dir.path().join("missing"), 5).unwrap().is_empty());
    }

    #[tokio::test]
    async fn sink_with_file_writes_console_log() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = LauncherConfig::default();
        let sink = LogSink::with_file(dir.path(), &cfg);
        sink.emit("hello").await;
        sink.emit("world").await;

        let mut lines = Vec::new();
        for _ in 0..50 {
            lines = read_console_tail(dir.path(), 10).unwrap();
            if lines.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(lines, vec!["hello", "world"]);
    }

    #[tokio::test]
    async fn run_json_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let spec = LaunchSpec::new(
            "/w".into(),
            19000,
            PathBuf::from("/bin/server"),
            vec!["run".to_string()],
            &["cb.offline".to_string()],
        );
        let mut info = RunInfo::new(&spec, "http://localhost:19000");
        info.pid = Some(77);
        write_run_json(dir.path(), &info).await.unwrap();

        let back = read_run_json(dir.path()).unwrap().unwrap();
        assert_eq!(back.url, "http://localhost:19000");
        assert_eq!(back.pid, Some(77));
        assert_eq!(back.command, vec!["/bin/server", "run"]);
        assert!(read_run_json(&dir.path().join("nope")).unwrap().is_none());
    }
}
