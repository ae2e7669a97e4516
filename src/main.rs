//! MovieStream - watch torrent-backed movies while they download
//!
//! Searches the YTS catalog, hands the chosen release to a transfer bridge
//! and plays the loopback stream in mpv or VLC.
//!
//! # Usage
//!
//! ```bash
//! moviestream search "big buck bunny"
//! moviestream watch sintel --quality 1080p
//! moviestream stream <info-hash> --title "Sintel" --player vlc
//! ```

mod cli;
mod commands;

use std::path::Path;

use clap::Parser;

use crate::cli::{Cli, Command, ExitCode, Output};
use moviestream::logging;
use moviestream::Config;

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    logging::init_tracing(logging::level_for(cli.verbose, cli.quiet));

    run_cli(cli).await.into()
}

/// Run CLI command and return exit code
async fn run_cli(cli: Cli) -> ExitCode {
    let output = Output::new(&cli);
    let config = || load_config(cli.config.as_deref(), &output);

    match cli.command {
        // The bridge is driven by the orchestrator and takes no config
        Command::Bridge(cmd) => commands::bridge_cmd(cmd).await,
        Command::Search(cmd) => match config() {
            Ok(config) => commands::search_cmd(cmd, &config, &output).await,
            Err(code) => code,
        },
        Command::Subtitles(cmd) => match config() {
            Ok(config) => commands::subtitles_cmd(cmd, &config, &output).await,
            Err(code) => code,
        },
        Command::Stream(cmd) => match config() {
            Ok(config) => commands::stream_cmd(cmd, &config, &output).await,
            Err(code) => code,
        },
        Command::Watch(cmd) => match config() {
            Ok(config) => commands::watch_cmd(cmd, &config, &output).await,
            Err(code) => code,
        },
    }
}

/// Load the config file, reporting a bad one as invalid arguments
fn load_config(path: Option<&Path>, output: &Output) -> Result<Config, ExitCode> {
    let loaded = match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    loaded.map_err(|e| output.error(format!("{:#}", e), ExitCode::InvalidArgs))
}
