//! numjit: an interpreter and native compilers for numeric register bytecode.
//!
//! Functions are read from `.nbc` files ([`bytecode::asm`]), checked for
//! native eligibility ([`jit::analysis`]), and compiled by one of the
//! [`jit::Backend`]s. Anything the backends refuse still runs in the
//! [`interpreter`].

pub mod bench;
pub mod bytecode;
pub mod config;
pub mod diagnostics;
pub mod interpreter;
pub mod jit;

use tracing_subscriber::{EnvFilter, fmt};

/// Variable read for the log filter, in `tracing_subscriber` directive syntax.
pub const ENV_LOG: &str = "NUMJIT_LOG";

/// Install the global subscriber. Logs go to stderr so `--json` output stays
/// parseable. `verbose` forces `numjit=debug` regardless of `NUMJIT_LOG`.
pub fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("warn,numjit=debug")
    } else {
        EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
