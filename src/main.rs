mod cache;
mod cli;
mod commands;
mod config;
mod converge;
mod error;
mod facts;
mod handlers;
mod paths;
mod run;
mod sync;
mod transport;
mod ui;
mod upload;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use config::ClientConfig;
use std::io;
use std::path::PathBuf;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    /// Explicit client.toml path
    pub config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
        config: cli.config,
    };

    match cli.command {
        Command::Run(args) => commands::run::run(&ctx, args),
        Command::Manifest { dir, version } => commands::cookbook::manifest(&dir, version.as_deref()),
        Command::Deps { repo, items } => commands::cookbook::deps(&ctx, &repo, &items),
        Command::Upload { depot, dirs } => {
            let config = ClientConfig::load(ctx.config.as_deref())?;
            commands::cookbook::upload(&ctx, &config, &depot, &dirs)
        }
        Command::Node { depot, command } => {
            let config = ClientConfig::load(ctx.config.as_deref())?;
            let server = commands::open_local(&depot, &config)?;
            commands::node::run(&ctx, &server, command)
        }
        Command::Completions { shell } => {
            generate(shell, &mut Cli::command(), "pantry", &mut io::stdout());
            Ok(())
        }
    }
}
