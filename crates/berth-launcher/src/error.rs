use std::time::Duration;

/// Failures of a single `ensure_running` call.
///
/// Cloneable so every caller joined on the same pending launch receives the same error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SupervisorError {
    #[error("no free port in range {low}..{high}")]
    ExhaustedRange { low: u16, high: u16 },

    #[error("server failed to start: {0}")]
    LaunchError(String),

    #[error("server exited before it finished booting (exit code {})", fmt_code(.code))]
    BootFailure { code: Option<i32> },

    #[error("server did not finish booting within {}ms", .0.as_millis())]
    BootTimeout(Duration),

    #[error("server output ended without a boot outcome")]
    Abandoned,
}

fn fmt_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "none".to_string())
}

/// Renders `err` and its causes as `outer: inner: root`, skipping empty and repeated links.
pub fn format_error_chain(err: &anyhow::Error) -> String {
    let mut links: Vec<String> = err
        .chain()
        .map(|cause| cause.to_string())
        .filter(|s| !s.is_empty())
        .collect();
    links.dedup();
    if links.is_empty() {
        return "unknown error".to_string();
    }
    links.join(": ")
}
