use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;

use baler_core::config;

use super::CmdResult;

pub(crate) fn run_config(dest: Option<&str>) -> CmdResult {
    let path = Path::new(dest.unwrap_or("baler.yaml"));
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            return Err(format!("file already exists: {}", path.display()).into())
        }
        Err(e) => return Err(e.into()),
    };
    file.write_all(config::minimal_config_template().as_bytes())?;

    println!("Config written to: {}", path.display());
    println!("Set backup_dir, sources and storages before the first build.");
    Ok(())
}
