use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "baler",
    version,
    about = "Resumable, crash-safe site packages",
    after_help = "\
Every command does one bounded slice of work and exits. Run it again
(from cron, a queue or a shell loop) until the package is built.

Configuration file lookup order:
  1. --config <path>             (explicit flag)
  2. $BALER_CONFIG               (environment variable)
  3. ./baler.yaml                (project)
  4. Platform user config dir + /baler/config.yaml"
)]
pub(crate) struct Cli {
    /// Path to configuration file (overrides BALER_CONFIG and default search)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Time budget for this invocation (e.g. 25s, 2m); overrides chunk.time_budget
    #[arg(long, global = true)]
    pub budget: Option<String>,

    /// Stop each job after this many items; overrides chunk.max_iterations
    #[arg(long, global = true)]
    pub max_iterations: Option<u64>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Per-run exclusions on top of the configured filters.
#[derive(clap::Args, Clone, Default)]
pub(crate) struct FilterArgs {
    /// Exclude this directory (absolute path)
    #[arg(long = "exclude-dir")]
    pub dirs: Vec<String>,

    /// Exclude this file (absolute path)
    #[arg(long = "exclude-file")]
    pub files: Vec<String>,

    /// Exclude files with this extension
    #[arg(long = "exclude-ext")]
    pub exts: Vec<String>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Start a new package build and run its first slice
    Build {
        #[command(flatten)]
        filters: FilterArgs,
    },

    /// Continue an unfinished build or pending upload
    Continue {
        /// Package name (default: newest package with work left)
        package: Option<String>,
    },

    /// Continue the unfinished package, or start a new one
    Run {
        #[command(flatten)]
        filters: FilterArgs,
    },

    /// Discard a package's work and rebuild it from the scan phase
    Restart {
        /// Package name (default: newest building package)
        package: Option<String>,
    },

    /// Show progress of a package
    Status {
        /// Package name (default: newest package)
        package: Option<String>,

        /// Print the raw progress record as JSON
        #[arg(long)]
        json: bool,
    },

    /// List packages in the backup directory
    List,

    /// List configured storage targets
    Storages,

    /// Upload a built package to one storage target
    Upload {
        /// Storage id from the configuration
        storage: String,
        /// Package name (default: newest package)
        package: Option<String>,
    },

    /// Download a package from a storage target
    Download {
        /// Storage id from the configuration
        storage: String,
        /// Package name as listed on the storage target
        package: String,
    },

    /// Ask running work on a package to stop, or cancel a transfer
    Cancel {
        /// Package name (default: newest package with work left)
        package: Option<String>,

        /// Cancel the upload to this storage target instead
        #[arg(long)]
        storage: Option<String>,
    },

    /// Delete old packages on a storage target
    Purge {
        /// Storage id from the configuration
        storage: String,

        /// Number of packages to keep (default: the target's max_kept)
        #[arg(long)]
        max_kept: Option<i64>,

        /// Package that is always kept (repeatable)
        #[arg(long)]
        keep: Vec<String>,
    },

    /// Expand a package's archive into a directory
    Expand {
        /// Package name
        package: String,
        /// Destination directory
        dest: String,
    },

    /// Show the directory tree a build would scan
    Tree {
        /// Directory to show (default: every configured source)
        path: Option<String>,

        /// Levels below each root to expand
        #[arg(long, default_value = "2")]
        depth: usize,

        /// Print the tree as JSON
        #[arg(long)]
        json: bool,
    },

    /// Release a named build lock left by a killed invocation
    BreakLock,

    /// Generate a minimal configuration file
    Config {
        /// Destination path (default: ./baler.yaml)
        #[arg(short, long)]
        dest: Option<String>,
    },
}

impl Commands {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Build { .. } => "build",
            Self::Continue { .. } => "continue",
            Self::Run { .. } => "run",
            Self::Restart { .. } => "restart",
            Self::Status { .. } => "status",
            Self::List => "list",
            Self::Storages => "storages",
            Self::Upload { .. } => "upload",
            Self::Download { .. } => "download",
            Self::Cancel { .. } => "cancel",
            Self::Purge { .. } => "purge",
            Self::Expand { .. } => "expand",
            Self::Tree { .. } => "tree",
            Self::BreakLock => "break-lock",
            Self::Config { .. } => "config",
        }
    }
}
