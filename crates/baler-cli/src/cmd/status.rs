use baler_core::Engine;
use comfy_table::Cell;

use super::CmdResult;
use crate::format::{format_bytes, format_progress, format_status, format_time, format_transfer};
use crate::table::TableStyle;

pub(crate) fn run_status(engine: &Engine, package: Option<&str>, json: bool) -> CmdResult {
    let Some(progress) = engine.status(package)? else {
        println!("No packages found.");
        return Ok(());
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&progress)?);
        return Ok(());
    }

    let style = TableStyle::detect();
    let mut table = style.fields();
    style.field(&mut table, "Package", &progress.name);
    style.field(&mut table, "Status", format_status(progress.status));
    style.field(&mut table, "Phase", progress.phase);
    style.field(&mut table, "Created", format_time(progress.created_at));
    if let Some(started) = progress.started_at {
        style.field(&mut table, "Started", format_time(started));
    }
    if let Some(completed) = progress.completed_at {
        style.field(&mut table, "Completed", format_time(completed));
    }
    style.field(
        &mut table,
        "Files",
        format!(
            "{} files, {} dirs",
            progress.create_state.file_index, progress.create_state.dir_index
        ),
    );
    style.field(
        &mut table,
        "Archived",
        format_progress(progress.processed_bytes, progress.expected_bytes),
    );
    style.field(&mut table, "Database rows", progress.database.rows_written);
    style.field(&mut table, "Retries", progress.retries);
    if let Some(error) = &progress.last_error {
        style.field(&mut table, "Last error", error);
    }
    if let Some(storage) = &progress.downloaded_from {
        style.field(&mut table, "Downloaded from", storage);
    }
    for (phase, secs) in &progress.phase_durations {
        style.field(&mut table, &format!("Time in {phase}"), format!("{secs:.1}s"));
    }
    for record in &progress.transfers {
        style.field(&mut table, "Transfer", format_transfer(record));
    }
    println!("{table}");
    Ok(())
}

pub(crate) fn run_list(engine: &Engine) -> CmdResult {
    let packages = engine.list_packages()?;
    if packages.is_empty() {
        println!("No packages found.");
        return Ok(());
    }

    let style = TableStyle::detect();
    let mut table = style.columns(&["Package", "Status", "Phase", "Created", "Size"]);
    for progress in &packages {
        table.add_row(vec![
            Cell::new(&progress.name),
            Cell::new(format_status(progress.status)),
            Cell::new(progress.phase),
            Cell::new(format_time(progress.created_at)),
            Cell::new(format_bytes(progress.processed_bytes)),
        ]);
    }
    println!("{table}");
    Ok(())
}

pub(crate) fn run_storages(engine: &Engine) -> CmdResult {
    let registry = engine.registry();
    if registry.is_empty() {
        println!("No storage targets configured.");
        return Ok(());
    }

    let style = TableStyle::detect();
    let mut table = style.columns(&["ID", "Kind", "Authorized", "Free"]);
    for storage in registry.iter() {
        let free = match storage.free_space() {
            Ok(Some(bytes)) => format_bytes(bytes),
            Ok(None) => "-".to_string(),
            Err(e) => {
                tracing::warn!(storage = storage.id(), error = %e, "free space check failed");
                "?".to_string()
            }
        };
        table.add_row(vec![
            Cell::new(storage.id()),
            Cell::new(storage.kind()),
            Cell::new(if storage.is_authorized() { "yes" } else { "no" }),
            Cell::new(free),
        ]);
    }
    println!("{table}");
    Ok(())
}
