//! Context-directory loading for the agent prompt.
//!
//! Stricter than the general path gate: `..` segments are refused outright
//! and a fixed set of OS-root system directories is never readable, on top of
//! the usual prefix and content screening.

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Result};
use deckhand_sandbox::PathGate;
use tracing::warn;

use crate::ToolLimits;

pub const CONTEXT_BLOCKED_ROOTS: &[&str] = &["/boot", "/dev", "/proc", "/run", "/sys"];

#[derive(Debug, Clone, PartialEq, Eq)]
/// One context file loaded for the agent prompt.
pub struct ContextFile {
    pub path: PathBuf,
    pub content: String,
}

/// Loads every readable text file directly under `dir` (non-recursive).
/// Files that fail the gate or the content check are skipped with a warning
/// rather than aborting the whole load.
pub fn load_context_directory(
    gate: &PathGate,
    dir: &str,
    limits: &ToolLimits,
) -> Result<Vec<ContextFile>> {
    let raw = Path::new(dir);
    if raw
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        bail!("context directory '{dir}' must not contain '..' segments");
    }
    for blocked in CONTEXT_BLOCKED_ROOTS {
        if raw.starts_with(blocked) {
            bail!("context directory '{dir}' is under blocked system root '{blocked}'");
        }
    }

    let real_dir = gate.check_path(dir)?;
    if !real_dir.is_dir() {
        bail!("context directory '{}' is not a directory", real_dir.display());
    }

    let mut entries: Vec<PathBuf> = std::fs::read_dir(&real_dir)?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.is_file())
        .collect();
    entries.sort();

    let mut files = Vec::new();
    for path in entries {
        let raw_path = path.display().to_string();
        let real_path = match gate.check_path(&raw_path) {
            Ok(real_path) => real_path,
            Err(denial) => {
                warn!(path = %raw_path, %denial, "context file skipped by path gate");
                continue;
            }
        };
        if let Err(denial) = gate.check_readable_content(&real_path) {
            warn!(path = %raw_path, %denial, "context file skipped by content check");
            continue;
        }
        match std::fs::read_to_string(&real_path) {
            Ok(content) => {
                let mut capped = content;
                if capped.len() > limits.max_read_bytes {
                    let mut end = limits.max_read_bytes;
                    while end > 0 && !capped.is_char_boundary(end) {
                        end -= 1;
                    }
                    capped.truncate(end);
                }
                files.push(ContextFile {
                    path: real_path,
                    content: capped,
                });
            }
            Err(error) => {
                warn!(path = %raw_path, %error, "context file skipped: read failed");
            }
        }
    }
    Ok(files)
}
