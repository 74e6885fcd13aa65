use chrono::{DateTime, Local, Utc};

use baler_core::chunking::StopReason;
use baler_core::transfer::{TransferDirection, TransferRecord};
use baler_core::BuildStatus;

pub(crate) fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// `done / total` with a percentage; `-` when the total is unknown.
pub(crate) fn format_progress(done: u64, total: u64) -> String {
    if total == 0 {
        return "-".to_string();
    }
    let pct = (done.min(total) as f64 / total as f64) * 100.0;
    format!("{} / {} ({pct:.1}%)", format_bytes(done), format_bytes(total))
}

pub(crate) fn format_status(status: BuildStatus) -> &'static str {
    match status {
        BuildStatus::Building => "building",
        BuildStatus::Built => "built",
        BuildStatus::Failed => "failed",
    }
}

pub(crate) fn format_stop(reason: StopReason) -> &'static str {
    match reason {
        StopReason::IterationLimit => "iteration limit reached",
        StopReason::TimeBudget => "time budget spent",
        StopReason::Cancelled => "cancelled",
    }
}

pub(crate) fn format_time(time: DateTime<Utc>) -> String {
    time.with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

pub(crate) fn format_transfer(record: &TransferRecord) -> String {
    let direction = match record.direction {
        TransferDirection::Upload => "upload",
        TransferDirection::Download => "download",
    };
    let mut out = format!("{} {direction} {}", record.storage_id, record.status);
    if record.total_bytes > 0 {
        out.push_str(&format!(
            "  {}",
            format_progress(record.bytes_transferred, record.total_bytes)
        ));
    }
    if let Some(error) = &record.error {
        out.push_str(&format!("  ({error})"));
    }
    out
}
