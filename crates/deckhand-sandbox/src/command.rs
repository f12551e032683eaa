//! Command-execution gate: program allowlist, subcommand and flag rules, and
//! direct (shell-free) process spawning with bounded timeout and output.

use std::{
    collections::BTreeMap,
    path::PathBuf,
    process::Stdio,
    time::{Duration, Instant},
};

use serde::Deserialize;
use thiserror::Error;
use tokio::{process::Command, time::timeout};
use tracing::warn;

use crate::paths::{AccessDenied, PathGate};

/// Shell metacharacters rejected in every argument token before any other
/// per-program rule is consulted.
pub const FORBIDDEN_ARGUMENT_CHARACTERS: &[char] = &[';', '&', '|', '`', '$', '\n', '\r'];

const SAFE_COMMAND_ENV_VARS: &[&str] = &["PATH", "HOME", "USER", "LANG", "LC_ALL", "TERM", "TZ"];

pub const COMMAND_TIMEOUT_MS_DEFAULT: u64 = 30_000;
pub const COMMAND_MAX_OUTPUT_BYTES_DEFAULT: usize = 64_000;

pub const DOCKER_SUBCOMMANDS: &[&str] = &[
    "images", "info", "inspect", "logs", "network", "ps", "version",
];
pub const SYSTEMCTL_SUBCOMMANDS: &[&str] = &[
    "is-active",
    "list-timers",
    "list-units",
    "show",
    "status",
];
pub const JOURNALCTL_BLOCKED_FLAGS: &[&str] = &[
    "--flush",
    "--rotate",
    "--vacuum-files",
    "--vacuum-size",
    "--vacuum-time",
];

#[derive(Debug, Clone, Deserialize)]
/// Per-program refinement rules attached to a Command Policy entry.
pub struct CommandRule {
    pub executable: PathBuf,
    #[serde(default)]
    pub subcommands: Option<Vec<String>>,
    #[serde(default)]
    pub blocked_flags: Vec<String>,
    #[serde(default)]
    pub consumes_paths: bool,
}

impl CommandRule {
    pub fn plain(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            subcommands: None,
            blocked_flags: Vec::new(),
            consumes_paths: false,
        }
    }

    pub fn with_subcommands(executable: impl Into<PathBuf>, subcommands: &[&str]) -> Self {
        Self {
            subcommands: Some(
                subcommands
                    .iter()
                    .map(|subcommand| (*subcommand).to_string())
                    .collect(),
            ),
            ..Self::plain(executable)
        }
    }

    pub fn with_blocked_flags(executable: impl Into<PathBuf>, blocked_flags: &[&str]) -> Self {
        Self {
            blocked_flags: blocked_flags.iter().map(|flag| (*flag).to_string()).collect(),
            ..Self::plain(executable)
        }
    }

    pub fn file_reader(executable: impl Into<PathBuf>) -> Self {
        Self {
            consumes_paths: true,
            ..Self::plain(executable)
        }
    }
}

#[derive(Debug, Clone)]
/// Static allowlist table mapping program names to their execution rules.
pub struct CommandPolicy {
    programs: BTreeMap<String, CommandRule>,
    pub timeout_ms: u64,
    pub max_output_bytes: usize,
}

impl CommandPolicy {
    pub fn empty() -> Self {
        Self {
            programs: BTreeMap::new(),
            timeout_ms: COMMAND_TIMEOUT_MS_DEFAULT,
            max_output_bytes: COMMAND_MAX_OUTPUT_BYTES_DEFAULT,
        }
    }

    /// The default host-operations surface: container, service, and log
    /// inspection plus a handful of read-only system utilities.
    pub fn host_operations() -> Self {
        let mut policy = Self::empty();
        policy.insert(
            "docker",
            CommandRule::with_subcommands("/usr/bin/docker", DOCKER_SUBCOMMANDS),
        );
        policy.insert(
            "systemctl",
            CommandRule::with_subcommands("/usr/bin/systemctl", SYSTEMCTL_SUBCOMMANDS),
        );
        policy.insert(
            "journalctl",
            CommandRule::with_blocked_flags("/usr/bin/journalctl", JOURNALCTL_BLOCKED_FLAGS),
        );
        policy.insert("ps", CommandRule::plain("/usr/bin/ps"));
        policy.insert("df", CommandRule::plain("/usr/bin/df"));
        policy.insert("free", CommandRule::plain("/usr/bin/free"));
        policy.insert("uptime", CommandRule::plain("/usr/bin/uptime"));
        policy.insert("uname", CommandRule::plain("/usr/bin/uname"));
        policy.insert("ss", CommandRule::plain("/usr/bin/ss"));
        policy.insert("cat", CommandRule::file_reader("/usr/bin/cat"));
        policy.insert("head", CommandRule::file_reader("/usr/bin/head"));
        policy.insert("tail", CommandRule::file_reader("/usr/bin/tail"));
        policy
    }

    pub fn insert(&mut self, program: impl Into<String>, rule: CommandRule) {
        self.programs.insert(program.into(), rule);
    }

    pub fn rule(&self, program: &str) -> Option<&CommandRule> {
        self.programs.get(program)
    }

    pub fn program_names(&self) -> impl Iterator<Item = &str> {
        self.programs.keys().map(String::as_str)
    }
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self::host_operations()
    }
}

#[derive(Debug, Error)]
/// A request the Command Gate refused before spawning anything.
pub enum PolicyViolation {
    #[error("command '{program}' is not in the allowlist")]
    NotAllowlisted { program: String },
    #[error("argument '{argument}' to '{program}' contains forbidden characters")]
    ForbiddenCharacters { program: String, argument: String },
    #[error("command '{program}' requires a subcommand")]
    SubcommandRequired { program: String },
    #[error("subcommand '{subcommand}' is not allowed for '{program}'")]
    SubcommandNotAllowed { program: String, subcommand: String },
    #[error("flag '{flag}' is not allowed for '{program}'")]
    FlagNotAllowed { program: String, flag: String },
    #[error("argument '{argument}' to '{program}' was denied: {denial}")]
    ArgumentPathDenied {
        program: String,
        argument: String,
        #[source]
        denial: AccessDenied,
    },
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Policy(#[from] PolicyViolation),
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("command '{program}' timed out after {timeout_ms} ms")]
    Timeout { program: String, timeout_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Outcome of an executed command; a non-zero exit status is a normal result
/// here, not a gate failure.
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
/// Public struct `CommandGate` used across Deckhand components.
pub struct CommandGate {
    policy: CommandPolicy,
    path_gate: PathGate,
}

impl CommandGate {
    pub fn new(policy: CommandPolicy, path_gate: PathGate) -> Self {
        Self { policy, path_gate }
    }

    pub fn policy(&self) -> &CommandPolicy {
        &self.policy
    }

    /// Pure policy decision for a `(program, args)` pair. Every check runs
    /// before any process exists, in allowlist → forbidden-characters →
    /// subcommand → flag → path-argument order, short-circuiting on the first
    /// failure.
    pub fn authorize(&self, program: &str, args: &[String]) -> Result<&CommandRule, PolicyViolation> {
        let Some(rule) = self.policy.rule(program) else {
            return Err(PolicyViolation::NotAllowlisted {
                program: program.to_string(),
            });
        };

        for argument in args {
            if argument.contains(FORBIDDEN_ARGUMENT_CHARACTERS) {
                return Err(PolicyViolation::ForbiddenCharacters {
                    program: program.to_string(),
                    argument: argument.clone(),
                });
            }
        }

        if let Some(subcommands) = &rule.subcommands {
            let Some(first) = args.first() else {
                return Err(PolicyViolation::SubcommandRequired {
                    program: program.to_string(),
                });
            };
            if !subcommands.iter().any(|subcommand| subcommand == first) {
                return Err(PolicyViolation::SubcommandNotAllowed {
                    program: program.to_string(),
                    subcommand: first.clone(),
                });
            }
        }

        if !rule.blocked_flags.is_empty() {
            for argument in args {
                if rule
                    .blocked_flags
                    .iter()
                    .any(|flag| argument == flag || argument.starts_with(&format!("{flag}=")))
                {
                    return Err(PolicyViolation::FlagNotAllowed {
                        program: program.to_string(),
                        flag: argument.clone(),
                    });
                }
            }
        }

        if rule.consumes_paths {
            for argument in args.iter().filter(|argument| looks_like_path_argument(argument)) {
                if let Err(denial) = self.path_gate.check_path(argument) {
                    return Err(PolicyViolation::ArgumentPathDenied {
                        program: program.to_string(),
                        argument: argument.clone(),
                        denial,
                    });
                }
            }
        }

        Ok(rule)
    }

    /// Authorizes and runs `program` with `args`. The child is spawned from
    /// the policy table's absolute executable with the argument vector as-is;
    /// no shell interpreter is ever involved. A timed-out child is reported
    /// as `CommandError::Timeout` but left to finish on its own.
    pub async fn execute(
        &self,
        program: &str,
        args: &[String],
        options: ExecuteOptions,
    ) -> Result<CommandOutput, CommandError> {
        let rule = match self.authorize(program, args) {
            Ok(rule) => rule,
            Err(violation) => {
                warn!(program, %violation, "command gate denied execution");
                return Err(violation.into());
            }
        };

        let timeout_ms = options.timeout_ms.unwrap_or(self.policy.timeout_ms).max(1);
        let mut command = Command::new(&rule.executable);
        command.args(args);
        command.stdin(Stdio::null());
        command.env_clear();
        for key in SAFE_COMMAND_ENV_VARS {
            if let Ok(value) = std::env::var(key) {
                command.env(key, value);
            }
        }

        let started_at = Instant::now();
        let output = match timeout(Duration::from_millis(timeout_ms), command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(CommandError::Spawn {
                    program: program.to_string(),
                    source,
                });
            }
            Err(_) => {
                warn!(program, timeout_ms, "command timed out");
                return Err(CommandError::Timeout {
                    program: program.to_string(),
                    timeout_ms,
                });
            }
        };

        Ok(CommandOutput {
            stdout: truncate_output(
                &String::from_utf8_lossy(&output.stdout),
                self.policy.max_output_bytes,
            ),
            stderr: truncate_output(
                &String::from_utf8_lossy(&output.stderr),
                self.policy.max_output_bytes,
            ),
            exit_code: output.status.code(),
            duration_ms: started_at.elapsed().as_millis() as u64,
        })
    }
}

/// An argument is screened as a path when it is not flag-shaped and not
/// purely numeric (line counts, durations, and similar option values).
pub(crate) fn looks_like_path_argument(argument: &str) -> bool {
    !argument.is_empty()
        && !argument.starts_with('-')
        && !argument.chars().all(|character| character.is_ascii_digit())
}

pub(crate) fn truncate_output(value: &str, limit: usize) -> String {
    if value.len() <= limit {
        return value.to_string();
    }

    if limit == 0 {
        return "<output truncated>".to_string();
    }

    let mut end = limit.min(value.len());
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }

    let mut output = value[..end].to_string();
    output.push_str("\n<output truncated>");
    output
}
