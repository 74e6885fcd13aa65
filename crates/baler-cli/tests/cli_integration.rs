use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::TempDir;

struct CliFixture {
    _tmp: TempDir,
    root: PathBuf,
    home_dir: PathBuf,
    source: PathBuf,
    nas: PathBuf,
    config_path: PathBuf,
}

impl CliFixture {
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        let home_dir = root.join("home");
        let source = root.join("site");
        let nas = root.join("nas");
        let config_path = root.join("baler.yaml");

        std::fs::create_dir_all(&home_dir).unwrap();
        std::fs::create_dir_all(source.join("pages")).unwrap();
        std::fs::create_dir_all(&nas).unwrap();
        std::fs::write(source.join("index.html"), b"<h1>home</h1>").unwrap();
        std::fs::write(source.join("pages/about.html"), b"<h1>about</h1>").unwrap();
        let blob: Vec<u8> = (0..30_000u32).map(|i| (i % 253) as u8).collect();
        std::fs::write(source.join("pages/photo.jpg"), blob).unwrap();

        Self {
            _tmp: tmp,
            root,
            home_dir,
            source,
            nas,
            config_path,
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(baler_binary_path());
        cmd.args(args);
        cmd.current_dir(&self.root);
        cmd.env("HOME", &self.home_dir);
        cmd.env("XDG_CONFIG_HOME", self.home_dir.join(".config"));
        cmd.env("NO_COLOR", "1");
        cmd.env_remove("BALER_CONFIG");
        cmd
    }

    fn run(&self, args: &[&str]) -> Output {
        self.command(args).output().unwrap()
    }

    fn run_ok(&self, args: &[&str]) -> String {
        let output = self.run(args);
        if !output.status.success() {
            panic!(
                "command failed: {:?}\nstdout:\n{}\nstderr:\n{}",
                args,
                stdout(&output),
                stderr(&output)
            );
        }
        stdout(&output)
    }

    fn run_err(&self, args: &[&str]) -> (String, String) {
        let output = self.run(args);
        assert!(
            !output.status.success(),
            "command unexpectedly succeeded: {:?}\nstdout:\n{}\nstderr:\n{}",
            args,
            stdout(&output),
            stderr(&output)
        );
        (stdout(&output), stderr(&output))
    }

    fn config_arg(&self) -> String {
        self.config_path.to_string_lossy().to_string()
    }

    fn write_config(&self, backup_dir: &Path, upload: bool) {
        let mut config = format!(
            "backup_dir: {}\nlabel: site\nsources:\n  - {}\narchive:\n  glob_size: 4KiB\nchunk:\n  time_budget: null\nlock:\n  mode: file\nstorages:\n  - id: nas\n    kind: local\n    path: {}\n    max_kept: 3\n",
            yaml_quote_path(backup_dir),
            yaml_quote_path(&self.source),
            yaml_quote_path(&self.nas),
        );
        if upload {
            config.push_str("build:\n  upload_to: [nas]\n");
        }
        std::fs::write(&self.config_path, config).unwrap();
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

fn baler_binary_path() -> PathBuf {
    if let Some(path) = std::env::var_os("CARGO_BIN_EXE_baler") {
        return PathBuf::from(path);
    }

    let current_exe = std::env::current_exe().expect("failed to resolve current test binary path");
    let debug_dir = current_exe
        .parent()
        .and_then(|p| p.parent())
        .expect("unexpected test binary path layout");

    #[cfg(windows)]
    let candidate = debug_dir.join("baler.exe");
    #[cfg(not(windows))]
    let candidate = debug_dir.join("baler");

    assert!(
        candidate.exists(),
        "unable to locate baler binary at {:?}",
        candidate
    );
    candidate
}

fn yaml_quote_path(path: &Path) -> String {
    let raw = path.to_string_lossy();
    format!("\"{}\"", raw.replace('\\', "\\\\").replace('"', "\\\""))
}

fn parse_package(output: &str) -> String {
    output
        .lines()
        .find_map(|line| line.strip_prefix("Package: "))
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| panic!("missing package name in output:\n{output}"))
}

#[test]
fn config_generates_template_once() {
    let fx = CliFixture::new();
    let dest = fx.root.join("conf/baler.yaml");
    let dest_arg = dest.to_string_lossy().to_string();

    let out = fx.run_ok(&["config", "--dest", &dest_arg]);
    assert!(out.contains("Config written to:"));
    let written = std::fs::read_to_string(&dest).unwrap();
    assert!(written.contains("backup_dir:"));

    let (_, err) = fx.run_err(&["config", "--dest", &dest_arg]);
    assert!(err.contains("file already exists"));
}

#[test]
fn missing_config_lists_search_paths() {
    let fx = CliFixture::new();
    let (_, err) = fx.run_err(&["status"]);
    assert!(err.contains("no configuration file found"));
    assert!(err.contains("baler.yaml (project)"));
    assert!(err.contains("baler config"));
}

#[test]
fn project_config_is_found_in_working_directory() {
    let fx = CliFixture::new();
    fx.write_config(&fx.root.join("backups"), false);
    let out = fx.run_ok(&["status"]);
    assert!(out.contains("No packages found."));
    let out = fx.run_ok(&["list"]);
    assert!(out.contains("No packages found."));
}

#[test]
fn run_builds_and_uploads_in_one_invocation() {
    let fx = CliFixture::new();
    fx.write_config(&fx.root.join("backups"), true);
    let config = fx.config_arg();

    let out = fx.run_ok(&["--config", &config, "run"]);
    let package = parse_package(&out);
    assert!(out.contains("scan done"));
    assert!(out.contains("installer done"));
    assert!(out.contains("nas upload succeeded"));
    assert!(out.contains("Status: built"));
    assert!(fx.nas.join(&package).join("archive.balr").exists());

    let out = fx.run_ok(&["--config", &config, "list"]);
    assert!(out.contains(&package));
    assert!(out.contains("built"));

    let out = fx.run_ok(&["--config", &config, "status", "--json"]);
    let progress: serde_json::Value = serde_json::from_str(&out).unwrap();
    assert_eq!(progress["name"], package.as_str());
    assert_eq!(progress["installer_built"], true);

    let out = fx.run_ok(&["--config", &config, "storages"]);
    assert!(out.contains("nas"));
    assert!(out.contains("local"));
}

#[test]
fn limited_build_is_continued_until_built() {
    let fx = CliFixture::new();
    fx.write_config(&fx.root.join("backups"), false);
    let config = fx.config_arg();

    let out = fx.run_ok(&["--config", &config, "build", "--max-iterations", "2"]);
    assert!(out.contains("Package started:"));
    assert!(out.contains("Status: building"));
    assert!(out.contains("iteration limit reached"));
    let package = parse_package(&out);

    let mut rounds = 0;
    loop {
        rounds += 1;
        assert!(rounds < 200, "build does not finish");
        let out = fx.run_ok(&["--config", &config, "continue", "--max-iterations", "2"]);
        assert_eq!(parse_package(&out), package);
        if out.contains("Status: built") {
            break;
        }
    }

    let out = fx.run_ok(&["--config", &config, "status", &package]);
    assert!(out.contains("built"));
    assert!(out.contains("3 files, 2 dirs"));

    // Nothing is left to continue.
    let (_, err) = fx.run_err(&["--config", &config, "continue"]);
    assert!(err.starts_with("Error: package not found"));
}

#[test]
fn upload_download_and_expand_round_trip() {
    let fx = CliFixture::new();
    fx.write_config(&fx.root.join("backups"), false);
    let config = fx.config_arg();
    let package = parse_package(&fx.run_ok(&["--config", &config, "run"]));

    let out = fx.run_ok(&["--config", &config, "upload", "nas"]);
    assert!(out.contains("nas upload succeeded"));

    // Same storage, fresh backup dir.
    fx.write_config(&fx.root.join("restored-backups"), false);
    let out = fx.run_ok(&["--config", &config, "download", "nas", &package]);
    assert!(out.contains(&format!("Downloaded {package} from 'nas'")));

    let dest = fx.root.join("out");
    let dest_arg = dest.to_string_lossy().to_string();
    let out = fx.run_ok(&["--config", &config, "expand", &package, &dest_arg]);
    assert!(out.contains("Expanded 3 files, 2 dirs"));
    assert_eq!(
        std::fs::read(dest.join("site/pages/photo.jpg")).unwrap(),
        std::fs::read(fx.source.join("pages/photo.jpg")).unwrap()
    );

    let (_, err) = fx.run_err(&["--config", &config, "download", "nas", &package]);
    assert!(err.contains("already exists"));
}

#[test]
fn purge_keeps_the_requested_count() {
    let fx = CliFixture::new();
    fx.write_config(&fx.root.join("backups"), false);
    let config = fx.config_arg();
    let package = parse_package(&fx.run_ok(&["--config", &config, "run"]));
    fx.run_ok(&["--config", &config, "upload", "nas", &package]);

    let out = fx.run_ok(&["--config", &config, "purge", "nas", "--max-kept", "0"]);
    assert!(out.contains("Kept 0 package(s), deleted 0"));

    let out = fx.run_ok(&["--config", &config, "purge", "nas", "--max-kept", "1"]);
    assert!(out.contains("Kept 1 package(s), deleted 0"));
    assert!(fx.nas.join(&package).exists());
}

#[test]
fn cancel_marker_stops_the_build() {
    let fx = CliFixture::new();
    fx.write_config(&fx.root.join("backups"), false);
    let config = fx.config_arg();

    let package = parse_package(&fx.run_ok(&["--config", &config, "build", "--max-iterations", "1"]));
    let out = fx.run_ok(&["--config", &config, "cancel"]);
    assert!(out.contains("Cancel requested:"));

    let (out, err) = fx.run_err(&["--config", &config, "continue", &package]);
    assert!(out.contains(&package));
    assert!(err.contains("failed: cancelled"));

    let out = fx.run_ok(&["--config", &config, "cancel", &package, "--storage", "nas"]);
    assert!(out.contains("No running upload"));
}

#[test]
fn break_lock_is_refused_for_file_locks() {
    let fx = CliFixture::new();
    fx.write_config(&fx.root.join("backups"), false);
    let config = fx.config_arg();
    let (_, err) = fx.run_err(&["--config", &config, "break-lock"]);
    assert!(err.contains("Error: unsupported backend"));
}

#[test]
fn invalid_budget_is_reported() {
    let fx = CliFixture::new();
    fx.write_config(&fx.root.join("backups"), false);
    let config = fx.config_arg();
    let (_, err) = fx.run_err(&["--config", &config, "run", "--budget", "soon"]);
    assert!(err.starts_with("Error:"));
}

#[test]
fn tree_shows_configured_sources() {
    let fx = CliFixture::new();
    fx.write_config(&fx.root.join("backups"), false);
    let config = fx.config_arg();

    let out = fx.run_ok(&["--config", &config, "tree"]);
    assert!(out.contains("pages/"));
    assert!(out.contains("index.html"));
    assert!(out.contains("photo.jpg"));

    let out = fx.run_ok(&["--config", &config, "tree", "--depth", "0", "--json"]);
    let roots: serde_json::Value = serde_json::from_str(&out).unwrap();
    assert_eq!(roots.as_array().map(Vec::len), Some(1));
    assert!(!out.contains("photo.jpg"));
}
