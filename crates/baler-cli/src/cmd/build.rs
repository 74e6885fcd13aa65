use baler_core::scan::InstanceFilters;
use baler_core::{BuildReport, BuildStatus, Engine};

use super::CmdResult;
use crate::cli::FilterArgs;
use crate::format::{format_status, format_stop, format_transfer};

fn instance_filters(args: &FilterArgs) -> InstanceFilters {
    InstanceFilters {
        dirs: args.dirs.clone(),
        files: args.files.clone(),
        exts: args.exts.clone(),
    }
}

pub(crate) fn run_build(engine: &Engine, filters: &FilterArgs) -> CmdResult {
    let progress = engine.start_build(instance_filters(filters))?;
    println!("Package started: {}", progress.name);
    let report = engine.continue_build(Some(&progress.name))?;
    print_report(&report)
}

pub(crate) fn run_continue(engine: &Engine, package: Option<&str>) -> CmdResult {
    let report = engine.continue_build(package)?;
    print_report(&report)
}

pub(crate) fn run_run(engine: &Engine, filters: &FilterArgs) -> CmdResult {
    let report = engine.run(instance_filters(filters))?;
    print_report(&report)
}

pub(crate) fn run_restart(engine: &Engine, package: Option<&str>) -> CmdResult {
    let progress = engine.restart(package)?;
    println!("Package reset: {}", progress.name);
    println!("Run `baler continue` to build it again.");
    Ok(())
}

fn print_report(report: &BuildReport) -> CmdResult {
    println!("Package: {}", report.package);
    for phase in &report.phases_completed {
        println!("  {phase} done");
    }
    for record in &report.transfers {
        println!("  {}", format_transfer(record));
    }

    match report.status {
        BuildStatus::Built => {
            println!("Status: {}", format_status(report.status));
            Ok(())
        }
        BuildStatus::Building => {
            if let Some(error) = &report.error {
                eprintln!("Warning: {} phase failed, will retry: {error}", report.phase);
            }
            match report.stopped {
                Some(reason) => println!(
                    "Status: building, {} phase ({})",
                    report.phase,
                    format_stop(reason)
                ),
                None => println!("Status: building, {} phase", report.phase),
            }
            println!("Run `baler continue` to resume.");
            Ok(())
        }
        BuildStatus::Failed => Err(format!(
            "build of {} failed: {}",
            report.package,
            report.error.as_deref().unwrap_or("unknown error")
        )
        .into()),
    }
}
