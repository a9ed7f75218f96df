//! Structured logging setup, shared by the `catchup` binary and its tests.

use crate::config::OutputConfig;

/// Initializes the global `tracing` subscriber.
///
/// `RUST_LOG` always wins when set; otherwise the level is derived from
/// `output.verbose`/`output.quiet`. Safe to call more than once per process
/// (subsequent calls are no-ops) so tests can call it unconditionally.
pub fn init(output: &OutputConfig) {
    let default_directive = if output.quiet {
        "error"
    } else {
        match output.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn init_is_safe_to_call_more_than_once() {
        let output = OutputConfig {
            quiet: false,
            verbose: 2,
            print_summary: false,
        };
        init(&output);
        init(&output);
        tracing::debug!("logging initialized");
        assert!(logs_contain("logging initialized"));
    }
}
