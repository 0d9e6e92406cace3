//! Entry point: parses argv into a [`rld::cli::Cli`], builds a `Config` and
//! an `Action` stream from it, and hands both to [`rld::driver::run`]. All
//! link logic lives in the library; this binary only wires stdio and the
//! process exit code (spec §8).

use clap::Parser;
use rld::cli::{eldflags_prefix, Cli};
use rld::diag::DiagEngine;
use rld::driver;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut argv = vec![std::env::args().next().unwrap_or_default()];
    argv.extend(eldflags_prefix());
    argv.extend(std::env::args().skip(1));

    let cli = Cli::parse_from(&argv);
    let actions = Cli::actions_from_argv(&argv);

    let config = match cli.to_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("rld: fatal error: {e:#}");
            std::process::exit(1);
        }
    };

    let mut diag = DiagEngine::new();
    let outcome = driver::run(&config, &actions, &mut diag);

    for message in diag.messages() {
        eprintln!("rld: {message}");
    }
    if diag.verbose > 0 || diag.has_fatal() || diag.error_count() > 0 {
        eprintln!("rld: {}", diag.summary());
    }

    if let Err(e) = outcome {
        eprintln!("rld: fatal error: {e:#}");
        std::process::exit(1);
    }

    std::process::exit(diag.exit_code());
}
