use baler_core::Engine;

use super::CmdResult;

pub(crate) fn run_break_lock(engine: &Engine) -> CmdResult {
    if engine.break_lock()? {
        println!("Removed stale build lock.");
    } else {
        println!("No lock found.");
    }
    Ok(())
}
