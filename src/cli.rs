//! Command-line interface definitions using clap.

use clap::Parser;

/// Runs ImageJ macros against objects on behalf of a search host.
#[derive(Parser, Debug)]
#[command(name = "ijexec")]
#[command(version = ijexec::version::full_version(), about, long_about = None)]
#[command(disable_help_flag = true)]
pub struct Cli {
    /// Serve the host filter protocol on stdin/stdout.
    #[arg(long)]
    pub filter: bool,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR")]
    pub no_color: bool,
}

/// Short usage text printed for anything but `--version` or `--filter`.
pub fn usage() -> String {
    "usage: ijexec --filter | --version".to_string()
}
