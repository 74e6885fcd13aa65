pub mod fs;

/// Name of this machine: the default installation id and the owner recorded
/// in lock files. Falls back to `localhost`.
pub fn hostname() -> String {
    host_name().unwrap_or_else(|| "localhost".to_string())
}

#[cfg(unix)]
fn host_name() -> Option<String> {
    let name = nix::unistd::gethostname().ok()?;
    let name = name.to_string_lossy().trim().to_string();
    (!name.is_empty()).then_some(name)
}

#[cfg(not(unix))]
fn host_name() -> Option<String> {
    std::env::var("COMPUTERNAME").ok().filter(|n| !n.is_empty())
}
