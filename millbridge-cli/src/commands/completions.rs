//! `completions` command: generate shell completion scripts.

use clap::Command;
use clap_complete::{Shell, generate};

/// Write a completion script for `shell` to stdout.
pub fn run(shell: Shell, cmd: &mut Command) {
    let name = cmd.get_name().to_string();
    generate(shell, cmd, name, &mut std::io::stdout());
}
