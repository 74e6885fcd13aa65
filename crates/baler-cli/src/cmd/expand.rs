use std::path::Path;

use baler_core::archive::ExpandOutcome;
use baler_core::Engine;

use super::CmdResult;
use crate::format::format_bytes;

pub(crate) fn run_expand(engine: &Engine, package: &str, dest: &str) -> CmdResult {
    match engine.expand(package, Path::new(dest))? {
        ExpandOutcome::Complete(state) => {
            println!(
                "Expanded {} files, {} dirs ({}) into {dest}",
                state.files_created,
                state.dirs_created,
                format_bytes(state.bytes_written)
            );
            Ok(())
        }
        ExpandOutcome::Stopped(state) => {
            println!(
                "Expanded {} files so far ({}).",
                state.files_created,
                format_bytes(state.bytes_written)
            );
            println!("Run `baler expand {package} {dest}` again to continue.");
            Ok(())
        }
        ExpandOutcome::Error(failure) => Err(failure.to_string().into()),
    }
}
