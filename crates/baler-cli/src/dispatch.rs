use baler_core::config::parse_human_duration;
use baler_core::Engine;

use crate::cli::{Cli, Commands};
use crate::cmd::{self, CmdResult};

/// Apply `--budget` and `--max-iterations` on top of the configured limits.
pub(crate) fn apply_limit_overrides(
    engine: Engine,
    cli: &Cli,
) -> Result<Engine, Box<dyn std::error::Error>> {
    let mut limits = engine.limits();
    if let Some(budget) = &cli.budget {
        limits = limits.with_time_budget(Some(parse_human_duration(budget)?));
    }
    if let Some(n) = cli.max_iterations {
        limits = limits.with_max_iterations(n);
    }
    Ok(engine.with_limits(limits))
}

pub(crate) fn dispatch_command(command: &Commands, engine: &Engine) -> CmdResult {
    match command {
        Commands::Build { filters } => cmd::build::run_build(engine, filters),
        Commands::Continue { package } => cmd::build::run_continue(engine, package.as_deref()),
        Commands::Run { filters } => cmd::build::run_run(engine, filters),
        Commands::Restart { package } => cmd::build::run_restart(engine, package.as_deref()),
        Commands::Status { package, json } => {
            cmd::status::run_status(engine, package.as_deref(), *json)
        }
        Commands::List => cmd::status::run_list(engine),
        Commands::Storages => cmd::status::run_storages(engine),
        Commands::Upload { storage, package } => {
            cmd::transfer::run_upload(engine, storage, package.as_deref())
        }
        Commands::Download { storage, package } => {
            cmd::transfer::run_download(engine, storage, package)
        }
        Commands::Cancel { package, storage } => {
            cmd::transfer::run_cancel(engine, package.as_deref(), storage.as_deref())
        }
        Commands::Purge {
            storage,
            max_kept,
            keep,
        } => cmd::purge::run_purge(engine, storage, keep, *max_kept),
        Commands::Expand { package, dest } => cmd::expand::run_expand(engine, package, dest),
        Commands::Tree { path, depth, json } => {
            cmd::tree::run_tree(engine, path.as_deref(), *depth, *json)
        }
        Commands::BreakLock => cmd::break_lock::run_break_lock(engine),
        Commands::Config { .. } => Err("`config` does not use an engine".into()),
    }
}
