mod cli;
mod cmd;
mod dispatch;
mod format;
mod table;

use clap::Parser;

use baler_core::config;
use baler_core::Engine;

use cli::{Cli, Commands};
use dispatch::{apply_limit_overrides, dispatch_command};

fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // `config` writes a starter file, so it must not need one.
    if let Commands::Config { dest } = &cli.command {
        if let Err(e) = cmd::config::run_config(dest.as_deref()) {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
        return;
    }

    let source = match config::resolve_config_path(cli.config.as_deref()) {
        Some(s) => s,
        None => {
            eprintln!("Error: no configuration file found.");
            eprintln!("Searched:");
            for (path, level) in config::default_config_search_paths() {
                eprintln!("  {} ({})", path.display(), level);
            }
            eprintln!();
            eprintln!("Run `baler config` to generate a starter config file.");
            std::process::exit(1);
        }
    };

    tracing::info!("Using config: {source}");

    let result = config::load_config(source.path())
        .and_then(Engine::from_config)
        .map_err(|e| -> Box<dyn std::error::Error> { Box::new(e) })
        .and_then(|engine| apply_limit_overrides(engine, &cli))
        .and_then(|engine| {
            tracing::debug!(command = cli.command.name(), "dispatching");
            dispatch_command(&cli.command, &engine)
        });

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
