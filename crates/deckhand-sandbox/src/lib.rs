//! Access-control sandbox for the Deckhand host.
//!
//! Provides the command-execution gate (program allowlist, subcommand and
//! flag rules, shell-free spawning) and the file-access gate (prefix
//! allowlists, sensitive-pattern screening, symlink-aware resolution) used by
//! chat command handlers, agent tools, and loaded plugins.

mod command;
mod paths;

pub use command::*;
pub use paths::*;

#[cfg(test)]
mod tests;
