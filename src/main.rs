//! ijexec - ImageJ macro filter for search hosts

mod cli;

use std::io;

use anyhow::{Context, Result};
use clap::Parser;
use clap::error::ErrorKind;
use owo_colors::{OwoColorize, Stream::Stderr};

use cli::Cli;
use ijexec::config::FilterConfig;
use ijexec::host::run_filter_main;
use ijexec::logging::{self, LogConfig};

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.kind() == ErrorKind::DisplayVersion => {
            print!("{}", e.render());
            std::process::exit(0);
        }
        Err(_) => {
            eprintln!("{}", cli::usage());
            std::process::exit(1);
        }
    };

    if cli.no_color {
        owo_colors::set_override(false);
    }

    if !cli.filter {
        eprintln!("{}", cli::usage());
        std::process::exit(1);
    }

    if let Err(e) = cmd_filter() {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

/// Serve one filter instance over stdin/stdout until the host lets go.
fn cmd_filter() -> Result<()> {
    logging::init(LogConfig::default().with_env_overrides());

    let config = FilterConfig::new().with_env_overrides();
    let stdin = io::stdin().lock();
    let stdout = io::stdout().lock();

    run_filter_main(stdin, stdout, &config).context("filter session failed")
}
