mod cli;
mod commands;
mod error_fmt;
mod logging;

use clap::Parser;

use crate::cli::{Cli, JSON_MODE};
use crate::error_fmt::{exit_code_for_error, format_error_json, humanize};

fn run(cli: &Cli) -> eyre::Result<()> {
    let cfg = pump_config::load_file(&cli.config)?;
    logging::init(cli.json, &cli.log_level, &cfg.logging)?;
    tracing::debug!(config = ?cli.config, cmd = ?cli.cmd, "starting");
    commands::execute(cli, &cfg)
}

fn main() {
    let _ = color_eyre::install();
    let cli = Cli::parse();
    let _ = JSON_MODE.set(cli.json);

    if let Err(e) = run(&cli) {
        tracing::error!(error = %e, "command failed");
        if JSON_MODE.get().copied().unwrap_or(false) {
            eprintln!("{}", format_error_json(&e));
        } else {
            eprintln!("{}", humanize(&e));
        }
        std::process::exit(exit_code_for_error(&e));
    }
}
