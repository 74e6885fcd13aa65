use baler_core::Engine;

use super::CmdResult;

pub(crate) fn run_purge(
    engine: &Engine,
    storage: &str,
    keep: &[String],
    max_kept: Option<i64>,
) -> CmdResult {
    let report = engine.purge(storage, keep, max_kept)?;
    for name in &report.deleted {
        println!("Deleted: {name}");
    }
    println!(
        "Kept {} package(s), deleted {} on '{storage}'.",
        report.kept.len(),
        report.deleted.len()
    );

    if report.failed.is_empty() {
        return Ok(());
    }
    for (object, error) in &report.failed {
        eprintln!("  {object}: {error}");
    }
    Err(format!("{} object(s) could not be deleted", report.failed.len()).into())
}
