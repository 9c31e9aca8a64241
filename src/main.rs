mod cli;
mod domain;
mod infra;

use crate::cli::CliInvocation;
use crate::infra::{
    DEFAULT_TRANSIENT_CAPACITY, JsonCacheStore, SessionCache, resolve_sessions_dir,
    resolve_state_dir,
};
use std::io::{self, Write};
use thiserror::Error;

#[derive(Debug, Error)]
enum MainError {
    #[error(transparent)]
    ResolveSessionsDir(#[from] infra::ResolveSessionsDirError),

    #[error(transparent)]
    Cli(#[from] cli::CliRunError),
}

fn main() {
    if let Err(error) = run_main() {
        let mut err = io::stderr().lock();
        let _ = writeln!(err, "{error}");
        std::process::exit(1);
    }
}

fn run_main() -> Result<(), MainError> {
    let args = std::env::args().collect::<Vec<_>>();
    let invocation = match cli::parse_invocation(&args) {
        Ok(invocation) => invocation,
        Err(error) => {
            let mut err = io::stderr().lock();
            let _ = writeln!(err, "{error}");
            let _ = writeln!(err);
            cli::print_help();
            std::process::exit(2);
        }
    };

    match invocation {
        CliInvocation::PrintHelp => {
            cli::print_help();
            Ok(())
        }
        CliInvocation::PrintVersion => {
            let mut out = io::stdout().lock();
            let _ = writeln!(out, "{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliInvocation::Command(command) => {
            let sessions_dir = resolve_sessions_dir()?;
            let cache = match resolve_state_dir() {
                Ok(state_dir) => SessionCache::new(
                    DEFAULT_TRANSIENT_CAPACITY,
                    Box::new(JsonCacheStore::new(&state_dir)),
                ),
                // No home directory: run with an in-process cache only.
                Err(_) => SessionCache::in_memory(),
            };
            cli::run(command, &sessions_dir, &cache)?;
            // Persistence failures degrade to a cache miss on the next run.
            let _ = cache.persist();
            Ok(())
        }
    }
}
