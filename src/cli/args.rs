use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::skills::DEFAULT_SEARCH_LIMIT;

#[derive(Debug, Parser, Clone, PartialEq, Eq)]
#[command(name = "ashare-agent")]
#[command(
    about = "A-share equities assistant with a guarded Python sandbox",
    long_about = "A-share equities assistant with a guarded Python sandbox\n\nConfig file loading:\n  - --config <path> (explicit file, overrides default path discovery)\n  - Default search path when --config is not provided:\n    1. $XDG_CONFIG_HOME/ashare-agent/config.toml\n    2. ~/.config/ashare-agent/config.toml"
)]
pub struct CliArgs {
    /// Load config from this file path instead of the default discovery path.
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Check that the embedded interpreter starts, then exit.
    #[arg(long)]
    pub smoke_python: bool,

    #[command(subcommand)]
    pub command: Option<CliCommand>,
}

#[derive(Debug, Subcommand, Clone, PartialEq, Eq)]
pub enum CliCommand {
    /// Interactive REPL (default).
    Chat,
    /// Run a Python file through the sandbox and print the outcome as JSON.
    Exec {
        #[arg(long, value_name = "ID")]
        session: Option<String>,
        file: PathBuf,
    },
    /// Inspect the skill catalog.
    Skills {
        #[command(subcommand)]
        action: SkillsAction,
    },
}

#[derive(Debug, Subcommand, Clone, PartialEq, Eq)]
pub enum SkillsAction {
    List,
    Search {
        query: String,
        #[arg(long, default_value_t = DEFAULT_SEARCH_LIMIT)]
        limit: usize,
    },
    Show {
        skill_id: String,
    },
}
