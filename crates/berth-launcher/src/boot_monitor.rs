//! Turns a server's unstructured startup output into a single boot outcome.
//!
//! The server prints [`BOOT_SENTINEL`] once it accepts connections. Whichever comes
//! first of {sentinel on stdout or stderr, exit, launch error} decides the outcome;
//! everything after that is ignored.

use std::time::Duration;

use tokio::sync::oneshot;

use crate::process_launcher::ProcessEvent;

/// Log fragment the server prints when it starts listening.
///
/// This is a compatibility contract with the server's startup log line.
pub const BOOT_SENTINEL: &str = "Server is listening on";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootFailure {
    Exited(Option<i32>),
    LaunchError(String),
    TimedOut(Duration),
    /// The event stream closed without an exit or launch error.
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootOutcome {
    Success,
    Failure(BootFailure),
}

/// Finds a needle in a chunked stream, including matches split across chunk borders.
#[derive(Debug)]
struct SentinelScanner {
    needle: &'static str,
    carry: String,
}

impl SentinelScanner {
    fn new(needle: &'static str) -> Self {
        Self {
            needle,
            carry: String::new(),
        }
    }

    fn feed(&mut self, chunk: &str) -> bool {
        self.carry.push_str(chunk);
        if self.carry.contains(self.needle) {
            self.carry.clear();
            return true;
        }

        // Keep just enough tail to complete a match with the next chunk.
        let keep = self.needle.len().saturating_sub(1);
        if self.carry.len() > keep {
            let mut start = self.carry.len() - keep;
            while !self.carry.is_char_boundary(start) {
                start += 1;
            }
            self.carry.drain(..start);
        }
        false
    }
}

/// Resolves one [`BootOutcome`] per monitored process.
#[derive(Debug)]
pub struct BootMonitor {
    stdout: SentinelScanner,
    stderr: SentinelScanner,
    resolver: Option<oneshot::Sender<BootOutcome>>,
    outcome: Option<BootOutcome>,
}

impl BootMonitor {
    pub fn new() -> (Self, oneshot::Receiver<BootOutcome>) {
        Self::with_sentinel(BOOT_SENTINEL)
    }

    pub fn with_sentinel(sentinel: &'static str) -> (Self, oneshot::Receiver<BootOutcome>) {
        let (tx, rx) = oneshot::channel();
        let monitor = Self {
            stdout: SentinelScanner::new(sentinel),
            stderr: SentinelScanner::new(sentinel),
            resolver: Some(tx),
            outcome: None,
        };
        (monitor, rx)
    }

    pub fn outcome(&self) -> Option<&BootOutcome> {
        self.outcome.as_ref()
    }

    pub fn is_booted(&self) -> bool {
        matches!(self.outcome, Some(BootOutcome::Success))
    }

    /// Feeds one process event. Returns `true` if this event resolved the outcome.
    pub fn observe(&mut self, event: &ProcessEvent) -> bool {
        if self.outcome.is_some() {
            return false;
        }

        let outcome = match event {
            ProcessEvent::Stdout(chunk) if self.stdout.feed(chunk) => BootOutcome::Success,
            ProcessEvent::Stderr(chunk) if self.stderr.feed(chunk) => BootOutcome::Success,
            ProcessEvent::Stdout(_) | ProcessEvent::Stderr(_) => return false,
            ProcessEvent::Exited(code) => BootOutcome::Failure(BootFailure::Exited(*code)),
            ProcessEvent::LaunchError(err) => {
                BootOutcome::Failure(BootFailure::LaunchError(err.clone()))
            }
        };
        self.resolve(outcome)
    }

    /// Ends monitoring. Resolves `Abandoned` if nothing decided the outcome yet.
    pub fn finish(&mut self) -> bool {
        self.resolve(BootOutcome::Failure(BootFailure::Abandoned))
    }

    fn resolve(&mut self, outcome: BootOutcome) -> bool {
        let Some(tx) = self.resolver.take() else {
            return false;
        };
        self.outcome = Some(outcome.clone());
        // The receiver may have stopped waiting (boot timeout); the outcome is still recorded.
        let _ = tx.send(outcome);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn out(s: &str) -> ProcessEvent {
        ProcessEvent::Stdout(s.to_string())
    }

    fn err(s: &str) -> ProcessEvent {
        ProcessEvent::Stderr(s.to_string())
    }

    #[tokio::test]
    async fn sentinel_after_startup_noise_is_success() {
        let (mut monitor, rx) = BootMonitor::new();
        assert!(!monitor.observe(&out("Starting up...\n")));
        assert!(monitor.observe(&out("Server is listening on 19000\n")));
        assert_eq!(rx.await.unwrap(), BootOutcome::Success);
        assert!(monitor.is_booted());
    }

    #[tokio::test]
    async fn sentinel_on_stderr_counts() {
        let (mut monitor, rx) = BootMonitor::new();
        assert!(monitor.observe(&err("info: Server is listening on 19001")));
        assert_eq!(rx.await.unwrap(), BootOutcome::Success);
    }

    #[tokio::test]
    async fn resolves_once_even_with_repeated_sentinel_and_late_exit() {
        let (mut monitor, rx) = BootMonitor::new();
        assert!(monitor.observe(&out("Server is listening on 1\nServer is listening on 2\n")));
        assert!(!monitor.observe(&out("Server is listening on 3\n")));
        assert!(!monitor.observe(&ProcessEvent::Exited(Some(1))));
        assert!(!monitor.finish());
        assert_eq!(rx.await.unwrap(), BootOutcome::Success);
        assert_eq!(monitor.outcome(), Some(&BootOutcome::Success));
    }

    #[tokio::test]
    async fn exit_without_output_is_failure() {
        let (mut monitor, rx) = BootMonitor::new();
        assert!(monitor.observe(&ProcessEvent::Exited(Some(1))));
        assert!(!monitor.observe(&out("Server is listening on 19000")));
        assert_eq!(
            rx.await.unwrap(),
            BootOutcome::Failure(BootFailure::Exited(Some(1)))
        );
    }

    #[tokio::test]
    async fn launch_error_is_failure() {
        let (mut monitor, rx) = BootMonitor::new();
        assert!(monitor.observe(&ProcessEvent::LaunchError("no such file".to_string())));
        assert_eq!(
            rx.await.unwrap(),
            BootOutcome::Failure(BootFailure::LaunchError("no such file".to_string()))
        );
    }

    #[tokio::test]
    async fn sentinel_split_across_chunks_is_found() {
        let (mut monitor, rx) = BootMonitor::new();
        assert!(!monitor.observe(&out("booting\nServer is lis")));
        assert!(monitor.observe(&out("tening on 19000\n")));
        assert_eq!(rx.await.unwrap(), BootOutcome::Success);
    }

    #[tokio::test]
    async fn halves_on_different_streams_do_not_combine() {
        let (mut monitor, _rx) = BootMonitor::new();
        assert!(!monitor.observe(&out("Server is lis")));
        assert!(!monitor.observe(&err("tening on 19000")));
        assert!(monitor.outcome().is_none());
    }

    #[tokio::test]
    async fn finish_without_events_is_abandoned() {
        let (mut monitor, rx) = BootMonitor::new();
        assert!(monitor.finish());
        assert_eq!(rx.await.unwrap(), BootOutcome::Failure(BootFailure::Abandoned));
    }

    #[test]
    fn outcome_is_recorded_after_receiver_dropped() {
        let (mut monitor, rx) = BootMonitor::new();
        drop(rx);
        assert!(monitor.observe(&ProcessEvent::Exited(Some(2))));
        assert_eq!(
            monitor.outcome(),
            Some(&BootOutcome::Failure(BootFailure::Exited(Some(2))))
        );
    }

    #[test]
    fn scanner_carry_handles_multibyte_tail() {
        let mut s = SentinelScanner::new("abc");
        assert!(!s.feed("ééé"));
        assert!(!s.feed("xa"));
        assert!(s.feed("bc"));
    }
}
