//! CLI argument model for the `deckhand` binary.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "deckhand", version, about = "Chat-driven host operations assistant")]
pub struct Cli {
    /// Path to the configuration file (defaults to ./deckhand.toml when present).
    #[arg(long, env = "DECKHAND_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Override the shared store database path.
    #[arg(long, env = "DECKHAND_DB", value_name = "FILE")]
    pub db: Option<PathBuf>,

    /// Override the plugin root directory.
    #[arg(long, env = "DECKHAND_PLUGIN_ROOT", value_name = "DIR")]
    pub plugin_root: Option<PathBuf>,

    /// List and validate plugin manifests without loading anything.
    #[arg(long)]
    pub plugin_list: bool,

    /// Validate a single plugin manifest.
    #[arg(long, value_name = "MANIFEST")]
    pub plugin_validate: Option<PathBuf>,

    /// Run the path gate against a path and print the verdict.
    #[arg(long, value_name = "PATH")]
    pub check_path: Option<String>,

    /// Execute an allowlisted program through the command gate.
    #[arg(long, value_name = "PROGRAM")]
    pub exec: Option<String>,

    /// Argument for --exec; repeat the flag for each argument.
    #[arg(long = "exec-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub exec_args: Vec<String>,

    /// Read a file through the path gate and the read-file tool.
    #[arg(long, value_name = "PATH")]
    pub read: Option<String>,

    /// Load context files from a directory (stricter path rules apply).
    #[arg(long, value_name = "DIR")]
    pub context_dir: Option<String>,

    /// Load plugins and print the aggregate tool catalog.
    #[arg(long)]
    pub tools: bool,
}
