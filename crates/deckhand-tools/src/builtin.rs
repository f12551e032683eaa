//! Built-in sandboxed tools: gated command execution and capped file reads.

use std::{io::Read, sync::Arc};

use async_trait::async_trait;
use deckhand_sandbox::{CommandError, CommandGate, ExecuteOptions, PathGate, PolicyViolation};
use deckhand_store::SharedStore;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::{
    current_unix_timestamp_ms, redact_secrets, required_string, resolve_local_principal, ChatTool,
    RateLimitDecision, ToolDefinition, ToolExecutionResult, ToolRateLimiter,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
/// Output and quota limits applied by the built-in tools.
pub struct ToolLimits {
    pub max_read_bytes: usize,
    pub max_read_lines: usize,
    pub rate_limit_max_requests: u32,
    pub rate_limit_window_ms: u64,
}

impl Default for ToolLimits {
    fn default() -> Self {
        Self {
            max_read_bytes: 64_000,
            max_read_lines: 400,
            rate_limit_max_requests: 20,
            rate_limit_window_ms: 60_000,
        }
    }
}

/// Public struct `RunCommandTool` used across Deckhand components.
pub struct RunCommandTool {
    gate: Arc<CommandGate>,
    store: SharedStore,
    limits: ToolLimits,
    rate_limiter: Arc<ToolRateLimiter>,
}

impl RunCommandTool {
    pub fn new(
        gate: Arc<CommandGate>,
        store: SharedStore,
        limits: ToolLimits,
        rate_limiter: Arc<ToolRateLimiter>,
    ) -> Self {
        Self {
            gate,
            store,
            limits,
            rate_limiter,
        }
    }
}

fn policy_rule_name(violation: &PolicyViolation) -> &'static str {
    match violation {
        PolicyViolation::NotAllowlisted { .. } => "allowlist",
        PolicyViolation::ForbiddenCharacters { .. } => "forbidden_characters",
        PolicyViolation::SubcommandRequired { .. } => "subcommand_required",
        PolicyViolation::SubcommandNotAllowed { .. } => "subcommand_not_allowed",
        PolicyViolation::FlagNotAllowed { .. } => "flag_blocklist",
        PolicyViolation::ArgumentPathDenied { .. } => "path_argument",
    }
}

fn optional_string_array(arguments: &Value, key: &str) -> Result<Vec<String>, String> {
    let Some(value) = arguments.get(key) else {
        return Ok(Vec::new());
    };
    let entries = value
        .as_array()
        .ok_or_else(|| format!("optional argument '{key}' must be an array of strings"))?;
    let mut collected = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(entry) = entry.as_str() else {
            return Err(format!("optional argument '{key}' must contain only strings"));
        };
        collected.push(entry.to_string());
    }
    Ok(collected)
}

#[async_trait]
impl ChatTool for RunCommandTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "run_command".to_string(),
            description: "Run an allowlisted host command with an argument vector".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "program": { "type": "string" },
                    "args": { "type": "array", "items": { "type": "string" } },
                    "timeout_ms": { "type": "integer" }
                },
                "required": ["program"],
                "additionalProperties": false
            }),
        }
    }

    async fn execute(&self, arguments: Value) -> ToolExecutionResult {
        let program = match required_string(&arguments, "program") {
            Ok(program) => program,
            Err(error) => return ToolExecutionResult::error(json!({ "error": error })),
        };
        let args = match optional_string_array(&arguments, "args") {
            Ok(args) => args,
            Err(error) => return ToolExecutionResult::error(json!({ "error": error })),
        };
        let timeout_ms = arguments.get("timeout_ms").and_then(Value::as_u64);

        let principal = resolve_local_principal();
        let decision = self.rate_limiter.evaluate(
            &principal,
            self.limits.rate_limit_max_requests,
            self.limits.rate_limit_window_ms,
            current_unix_timestamp_ms(),
        );
        if let RateLimitDecision::Throttled {
            retry_after_ms, ..
        } = decision
        {
            return ToolExecutionResult::error(json!({
                "policy_rule": "rate_limit",
                "principal": principal,
                "program": program,
                "retry_after_ms": retry_after_ms,
                "error": format!("tool rate limit exceeded for principal '{principal}'"),
            }));
        }

        let output = match self
            .gate
            .execute(&program, &args, ExecuteOptions { timeout_ms })
            .await
        {
            Ok(output) => output,
            Err(CommandError::Policy(violation)) => {
                return ToolExecutionResult::error(json!({
                    "policy_rule": policy_rule_name(&violation),
                    "program": program,
                    "args": args,
                    "error": violation.to_string(),
                }));
            }
            Err(error) => {
                return ToolExecutionResult::error(json!({
                    "program": program,
                    "args": args,
                    "error": error.to_string(),
                }));
            }
        };

        if let Err(error) = self
            .store
            .record_command_audit(&program, &args, output.exit_code)
        {
            warn!(program = %program, %error, "failed to record command audit row");
        }

        ToolExecutionResult::ok(json!({
            "program": program,
            "args": args,
            "exit_code": output.exit_code,
            "success": output.exit_code == Some(0),
            "stdout": redact_secrets(&output.stdout),
            "stderr": redact_secrets(&output.stderr),
            "duration_ms": output.duration_ms,
        }))
    }
}

/// Public struct `ReadFileTool` used across Deckhand components.
pub struct ReadFileTool {
    gate: Arc<PathGate>,
    limits: ToolLimits,
}

impl ReadFileTool {
    pub fn new(gate: Arc<PathGate>, limits: ToolLimits) -> Self {
        Self { gate, limits }
    }
}

#[async_trait]
impl ChatTool for ReadFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "read_file".to_string(),
            description: "Read a text file from an allowed directory".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" }
                },
                "required": ["path"],
                "additionalProperties": false
            }),
        }
    }

    async fn execute(&self, arguments: Value) -> ToolExecutionResult {
        let path = match required_string(&arguments, "path") {
            Ok(path) => path,
            Err(error) => return ToolExecutionResult::error(json!({ "error": error })),
        };

        let real_path = match self.gate.check_path(&path) {
            Ok(real_path) => real_path,
            Err(denial) => {
                return ToolExecutionResult::error(json!({
                    "policy_rule": "path_gate",
                    "path": path,
                    "error": denial.to_string(),
                }));
            }
        };
        if let Err(denial) = self.gate.check_readable_content(&real_path) {
            return ToolExecutionResult::error(json!({
                "policy_rule": "content_check",
                "path": path,
                "real_path": real_path.display().to_string(),
                "error": denial.to_string(),
            }));
        }

        let (content, truncated) =
            match read_capped(&real_path, self.limits.max_read_bytes, self.limits.max_read_lines) {
                Ok(read) => read,
                Err(error) => {
                    return ToolExecutionResult::error(json!({
                        "path": path,
                        "real_path": real_path.display().to_string(),
                        "error": format!("failed to read '{}': {error}", real_path.display()),
                    }));
                }
            };

        ToolExecutionResult::ok(json!({
            "path": path,
            "real_path": real_path.display().to_string(),
            "content": redact_secrets(&content),
            "truncated": truncated,
        }))
    }
}

/// Reads at most `max_bytes` bytes and `max_lines` lines, reporting whether
/// either cap cut the content.
fn read_capped(
    path: &std::path::Path,
    max_bytes: usize,
    max_lines: usize,
) -> std::io::Result<(String, bool)> {
    let file = std::fs::File::open(path)?;
    let mut buffer = Vec::with_capacity(max_bytes.min(64_000) + 1);
    file.take(max_bytes as u64 + 1).read_to_end(&mut buffer)?;

    let mut truncated = buffer.len() > max_bytes;
    if truncated {
        buffer.truncate(max_bytes);
        while !buffer.is_empty() && String::from_utf8(buffer.clone()).is_err() {
            buffer.pop();
        }
    }
    let text = String::from_utf8_lossy(&buffer).to_string();

    let mut lines: Vec<&str> = text.lines().collect();
    if lines.len() > max_lines {
        lines.truncate(max_lines);
        truncated = true;
    }
    Ok((lines.join("\n"), truncated))
}
