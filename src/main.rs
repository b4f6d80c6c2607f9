//! Rehearse CLI entry point.

use std::process::ExitCode;

use clap::Parser;

use rehearse::cli::{self, context::load_config, Cli};
use rehearse::infrastructure::logging::{LogConfig, LogHandle};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let json_mode = cli.json;

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => return cli::handle_error(&err, json_mode),
    };

    let _logger = match LogHandle::init(&LogConfig::from(&config.logging).verbose(cli.verbose)) {
        Ok(logger) => logger,
        Err(err) => return cli::handle_error(&err, json_mode),
    };

    match cli::dispatch(cli, config).await {
        Ok(code) => code,
        Err(err) => cli::handle_error(&err, json_mode),
    }
}
