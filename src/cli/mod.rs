mod args;
mod commands;
mod repl;

pub use args::{CliArgs, CliCommand, SkillsAction};
pub use repl::{AppState, Mode, run_repl};
