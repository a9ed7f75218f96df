//! Configuration structs shared between the `catchup` library and its CLI.

/// Tokio runtime shape for the async portions of catchup (the online-snapshot
/// controller's database connection and, in remote mode, the `DataDirIo`
/// capability). The parallel transfer pool itself does not use this runtime —
/// it runs on real OS threads (see `catchup::transfer`).
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    /// Number of tokio worker threads (0 = let tokio pick based on CPU count).
    pub worker_threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { worker_threads: 0 }
    }
}

/// Resource throttles applied to the transfer pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThrottleConfig {
    /// Maximum number of files the transfer pool may hold open at once.
    /// `0` means unlimited.
    pub max_open_files: usize,
}

impl ThrottleConfig {
    pub fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Controls what gets printed to stdout/stderr, independent of the `tracing`
/// log level (set separately via `RUST_LOG`/`--verbose`).
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress non-error output.
    pub quiet: bool,
    /// Verbosity level: 0 = warn, 1 = info, 2 = debug, 3+ = trace.
    pub verbose: u8,
    /// Print a byte/file-count summary when catchup finishes.
    pub print_summary: bool,
}
