//! Tests for the built-in tool surface and the plugin tool adapter.

use std::sync::Arc;

use deckhand_plugins::PluginHost;
use deckhand_sandbox::{CommandGate, CommandPolicy, CommandRule, PathGate, PathPolicy};
use deckhand_store::SharedStore;
use serde_json::json;
use tempfile::tempdir;

use super::{
    build_tool_catalog, load_context_directory, ChatTool, RateLimitDecision, ReadFileTool,
    RunCommandTool, ToolLimits, ToolRateLimiter,
};

fn default_path_gate() -> Arc<PathGate> {
    Arc::new(PathGate::new(PathPolicy::default()).expect("build path gate"))
}

fn gate_for(root: &std::path::Path) -> Arc<PathGate> {
    Arc::new(
        PathGate::new(PathPolicy {
            allowed_prefixes: vec![root.to_path_buf()],
            unsafe_prefixes: Vec::new(),
            sensitive_patterns: PathPolicy::default().sensitive_patterns,
        })
        .expect("build path gate"),
    )
}

fn echo_command_gate() -> Arc<CommandGate> {
    let mut policy = CommandPolicy::empty();
    policy.insert("echo", CommandRule::plain("/bin/echo"));
    Arc::new(CommandGate::new(
        policy,
        PathGate::new(PathPolicy::default()).expect("build path gate"),
    ))
}

fn run_command_tool(gate: Arc<CommandGate>, store: SharedStore, limits: ToolLimits) -> RunCommandTool {
    RunCommandTool::new(gate, store, limits, Arc::new(ToolRateLimiter::default()))
}

#[test]
fn unit_rate_limiter_allows_then_throttles_then_resets() {
    let limiter = ToolRateLimiter::default();
    assert_eq!(limiter.evaluate("ops", 2, 1_000, 0), RateLimitDecision::Allow);
    assert_eq!(limiter.evaluate("ops", 2, 1_000, 10), RateLimitDecision::Allow);

    match limiter.evaluate("ops", 2, 1_000, 20) {
        RateLimitDecision::Throttled {
            retry_after_ms,
            principal_throttle_events,
            throttle_events_total,
        } => {
            assert_eq!(retry_after_ms, 980);
            assert_eq!(principal_throttle_events, 1);
            assert_eq!(throttle_events_total, 1);
        }
        RateLimitDecision::Allow => panic!("third request in the window must throttle"),
    }

    // A different principal has its own window.
    assert_eq!(limiter.evaluate("bot", 2, 1_000, 20), RateLimitDecision::Allow);

    // The window resets once it elapses.
    assert_eq!(
        limiter.evaluate("ops", 2, 1_000, 1_500),
        RateLimitDecision::Allow
    );

    let counters = limiter.counters();
    assert_eq!(counters.throttle_events_total, 1);
    assert_eq!(counters.tracked_principals, 2);
}

#[tokio::test]
async fn functional_run_command_tool_reports_policy_rule_on_denial() {
    let path_gate = PathGate::new(PathPolicy::default()).expect("build path gate");
    let gate = Arc::new(CommandGate::new(CommandPolicy::host_operations(), path_gate));
    let store = SharedStore::open_in_memory().expect("open store");
    let tool = run_command_tool(gate, store, ToolLimits::default());

    let result = tool.execute(json!({ "program": "rm" })).await;
    assert!(result.is_error);
    assert_eq!(result.content["policy_rule"], "allowlist");

    let result = tool
        .execute(json!({ "program": "docker", "args": ["exec", "sh"] }))
        .await;
    assert!(result.is_error);
    assert_eq!(result.content["policy_rule"], "subcommand_not_allowed");
}

#[tokio::test]
async fn functional_run_command_tool_executes_and_records_audit() {
    let store = SharedStore::open_in_memory().expect("open store");
    let tool = run_command_tool(echo_command_gate(), store.clone(), ToolLimits::default());

    let result = tool
        .execute(json!({ "program": "echo", "args": ["hello"] }))
        .await;
    assert!(!result.is_error, "got {:?}", result.content);
    assert_eq!(result.content["exit_code"], 0);
    assert_eq!(result.content["success"], true);
    assert_eq!(result.content["stdout"].as_str().map(str::trim), Some("hello"));

    let audit = store.recent_command_audit(1).expect("read audit trail");
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].program, "echo");
    assert_eq!(audit[0].exit_code, Some(0));
}

#[tokio::test]
async fn regression_run_command_tool_throttles_after_quota() {
    let store = SharedStore::open_in_memory().expect("open store");
    let limits = ToolLimits {
        rate_limit_max_requests: 1,
        rate_limit_window_ms: 60_000,
        ..ToolLimits::default()
    };
    let tool = run_command_tool(echo_command_gate(), store, limits);

    let first = tool.execute(json!({ "program": "echo", "args": ["a"] })).await;
    assert!(!first.is_error);
    let second = tool.execute(json!({ "program": "echo", "args": ["b"] })).await;
    assert!(second.is_error);
    assert_eq!(second.content["policy_rule"], "rate_limit");
    assert!(second.content["retry_after_ms"].as_u64().is_some());
}

#[tokio::test]
async fn functional_read_file_tool_caps_lines_and_redacts_secrets() {
    std::env::set_var("DECKHAND_TEST_TOKEN", "hunter2secret");
    let temp = tempdir().expect("create tempdir");
    let root = temp.path().canonicalize().expect("canonicalize tempdir");
    let file = root.join("service.log");
    std::fs::write(
        &file,
        "line one hunter2secret\nline two\nline three\nline four\n",
    )
    .expect("write log file");

    let limits = ToolLimits {
        max_read_lines: 2,
        ..ToolLimits::default()
    };
    let tool = ReadFileTool::new(gate_for(&root), limits);

    let result = tool
        .execute(json!({ "path": file.display().to_string() }))
        .await;
    assert!(!result.is_error, "got {:?}", result.content);
    let content = result.content["content"].as_str().expect("content string");
    assert!(content.contains("[REDACTED]"));
    assert!(!content.contains("hunter2secret"));
    assert_eq!(content.lines().count(), 2);
    assert_eq!(result.content["truncated"], true);
}

#[tokio::test]
async fn functional_read_file_tool_denies_binary_and_outside_paths() {
    let temp = tempdir().expect("create tempdir");
    let root = temp.path().canonicalize().expect("canonicalize tempdir");
    let binary = root.join("dump.log");
    std::fs::write(&binary, b"\x00\x01\x02").expect("write binary file");

    let tool = ReadFileTool::new(gate_for(&root), ToolLimits::default());
    let result = tool
        .execute(json!({ "path": binary.display().to_string() }))
        .await;
    assert!(result.is_error);
    assert_eq!(result.content["policy_rule"], "content_check");

    let result = tool.execute(json!({ "path": "/etc/passwd" })).await;
    assert!(result.is_error);
    assert_eq!(result.content["policy_rule"], "path_gate");
}

#[test]
fn unit_load_context_directory_rejects_dotdot_and_blocked_roots() {
    let gate = default_path_gate();
    let limits = ToolLimits::default();

    let error = load_context_directory(&gate, "/var/log/../../etc", &limits)
        .expect_err("dotdot segments are refused outright");
    assert!(error.to_string().contains("'..' segments"));

    let error = load_context_directory(&gate, "/proc/self", &limits)
        .expect_err("system roots are blocked");
    assert!(error.to_string().contains("blocked system root"));
}

#[test]
fn functional_load_context_directory_skips_denied_files() {
    let temp = tempdir().expect("create tempdir");
    let root = temp.path().canonicalize().expect("canonicalize tempdir");
    std::fs::write(root.join("readme.md"), "context").expect("write readme");
    std::fs::write(root.join("id_rsa"), "private").expect("write key-shaped file");
    std::fs::write(root.join("blob.dat"), "opaque").expect("write opaque file");

    let gate = gate_for(&root);
    let files = load_context_directory(&gate, &root.display().to_string(), &ToolLimits::default())
        .expect("load context directory");
    assert_eq!(files.len(), 1);
    assert!(files[0].path.ends_with("readme.md"));
    assert_eq!(files[0].content, "context");
}

#[test]
fn functional_build_tool_catalog_includes_builtins_and_plugin_tools() {
    let temp = tempdir().expect("create tempdir");
    let plugin_dir = temp.path().join("echoer");
    std::fs::create_dir_all(&plugin_dir).expect("create plugin dir");
    std::fs::write(
        plugin_dir.join("run.sh"),
        "#!/bin/sh\necho '{\"content\": \"ok\"}'\n",
    )
    .expect("write plugin script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let script = plugin_dir.join("run.sh");
        let mut permissions = std::fs::metadata(&script)
            .expect("script metadata")
            .permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(&script, permissions).expect("set script permissions");
    }
    std::fs::write(
        plugin_dir.join("plugin.json"),
        r#"{
  "schema_version": 1,
  "name": "echoer",
  "version": "0.1.0",
  "entrypoint": "run.sh",
  "tools": [
    { "name": "echo_back", "description": "Echo", "parameters": { "type": "object" } }
  ]
}"#,
    )
    .expect("write manifest");

    let store = SharedStore::open_in_memory().expect("open store");
    let mut host = PluginHost::new(temp.path());
    let summary = host.load_all(&store);
    assert_eq!(summary.loaded, vec!["echoer".to_string()]);

    let catalog = build_tool_catalog(
        echo_command_gate(),
        default_path_gate(),
        ToolLimits::default(),
        store,
        &host,
    );
    let names: Vec<String> = catalog
        .iter()
        .map(|tool| tool.definition().name)
        .collect();
    assert_eq!(
        names,
        vec![
            "run_command".to_string(),
            "read_file".to_string(),
            "echo_back".to_string()
        ]
    );
}
