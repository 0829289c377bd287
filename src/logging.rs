//! Tracing subscriber setup.
//!
//! Log lines go to stderr so command output on stdout stays machine
//! readable. Verbosity follows `RUST_LOG`; without it, only warnings and
//! errors are shown, or `info` when `verbose` is set.
//!
//! ```text
//! RUST_LOG=agent_stack=debug,agent_stack_core=debug agent-stack bootstrap
//! ```

use tracing_subscriber::EnvFilter;

pub fn setup_tracing(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // A second init (e.g. from tests) is harmless.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
