//! Tests for the command-execution and file-access gates.

use std::path::PathBuf;

use tempfile::tempdir;

use super::{
    normalize_lexically, truncate_output, AccessDenied, CommandError, CommandGate, CommandPolicy,
    CommandRule, ExecuteOptions, PathGate, PathPolicy, PolicyViolation,
};

fn host_gate() -> CommandGate {
    let path_gate = PathGate::new(PathPolicy::default()).expect("build path gate");
    CommandGate::new(CommandPolicy::host_operations(), path_gate)
}

fn args(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| (*value).to_string()).collect()
}

#[test]
fn unit_authorize_rejects_program_not_in_allowlist() {
    let gate = host_gate();
    let error = gate
        .authorize("rm", &args(&["-rf", "/"]))
        .expect_err("rm must not be allowlisted");
    assert!(matches!(error, PolicyViolation::NotAllowlisted { .. }));
    assert!(error.to_string().contains("not in the allowlist"));
}

#[test]
fn unit_authorize_rejects_forbidden_characters_for_any_allowlisted_program() {
    let gate = host_gate();
    for injected in [
        "ps; rm -rf /",
        "ps && true",
        "ps | tee /tmp/out",
        "ps `id`",
        "ps $HOME",
        "ps\nid",
    ] {
        let error = gate
            .authorize("docker", &args(&[injected]))
            .expect_err("metacharacters must be rejected");
        assert!(
            matches!(error, PolicyViolation::ForbiddenCharacters { .. }),
            "expected forbidden-characters failure for {injected:?}, got {error}"
        );
        assert!(error.to_string().contains("forbidden characters"));
    }
}

#[test]
fn unit_authorize_requires_subcommand_when_rules_exist() {
    let gate = host_gate();
    let error = gate
        .authorize("docker", &[])
        .expect_err("docker without a subcommand must fail");
    assert!(matches!(error, PolicyViolation::SubcommandRequired { .. }));
    assert!(error.to_string().contains("requires a subcommand"));
}

#[test]
fn unit_authorize_rejects_subcommand_outside_allowlist() {
    let gate = host_gate();
    let error = gate
        .authorize("docker", &args(&["exec", "sh"]))
        .expect_err("docker exec must be rejected");
    assert!(matches!(
        error,
        PolicyViolation::SubcommandNotAllowed { .. }
    ));
    assert!(error.to_string().contains("not allowed"));
}

#[test]
fn unit_authorize_accepts_allowed_subcommand() {
    let gate = host_gate();
    gate.authorize("docker", &args(&["ps"]))
        .expect("docker ps is an allowed subcommand");
}

#[test]
fn unit_authorize_rejects_blocked_flags_including_value_forms() {
    let gate = host_gate();
    let error = gate
        .authorize("journalctl", &args(&["--rotate"]))
        .expect_err("journalctl --rotate must be rejected");
    assert!(matches!(error, PolicyViolation::FlagNotAllowed { .. }));

    let error = gate
        .authorize("journalctl", &args(&["--vacuum-size=1G"]))
        .expect_err("journalctl --vacuum-size=1G must be rejected");
    assert!(matches!(error, PolicyViolation::FlagNotAllowed { .. }));

    gate.authorize("journalctl", &args(&["-u", "nginx.service"]))
        .expect("plain unit filtering stays allowed");
}

#[test]
fn unit_authorize_screens_path_arguments_for_file_readers() {
    let gate = host_gate();
    let error = gate
        .authorize("cat", &args(&["/opt/../root/notes.txt"]))
        .expect_err("traversal outside allowed prefixes must be rejected");
    assert!(matches!(error, PolicyViolation::ArgumentPathDenied { .. }));

    // Flag-shaped and purely numeric arguments are not treated as paths.
    gate.authorize("tail", &args(&["-n", "50", "/var/log/syslog"]))
        .expect("tail with numeric option value and allowed path");
}

#[tokio::test]
async fn functional_execute_returns_output_and_exit_code() {
    let path_gate = PathGate::new(PathPolicy::default()).expect("build path gate");
    let mut policy = CommandPolicy::empty();
    policy.insert("echo", CommandRule::plain("/bin/echo"));
    let gate = CommandGate::new(policy, path_gate);

    let output = gate
        .execute("echo", &args(&["hello"]), ExecuteOptions::default())
        .await
        .expect("echo executes");
    assert_eq!(output.exit_code, Some(0));
    assert_eq!(output.stdout.trim(), "hello");
    assert!(output.stderr.is_empty());
}

#[tokio::test]
async fn functional_execute_reports_nonzero_exit_as_normal_result() {
    let path_gate = PathGate::new(PathPolicy::default()).expect("build path gate");
    let mut policy = CommandPolicy::empty();
    policy.insert("false", CommandRule::plain("/bin/false"));
    let gate = CommandGate::new(policy, path_gate);

    let output = gate
        .execute("false", &[], ExecuteOptions::default())
        .await
        .expect("non-zero exit is not a gate failure");
    assert_ne!(output.exit_code, Some(0));
}

#[tokio::test]
async fn functional_execute_enforces_timeout() {
    let path_gate = PathGate::new(PathPolicy::default()).expect("build path gate");
    let mut policy = CommandPolicy::empty();
    policy.insert("sleep", CommandRule::plain("/bin/sleep"));
    let gate = CommandGate::new(policy, path_gate);

    let error = gate
        .execute(
            "sleep",
            &args(&["5"]),
            ExecuteOptions {
                timeout_ms: Some(100),
            },
        )
        .await
        .expect_err("sleep must exceed the deadline");
    assert!(matches!(error, CommandError::Timeout { .. }));
}

#[tokio::test]
async fn regression_execute_policy_failure_surfaces_before_spawning() {
    let gate = host_gate();
    let error = gate
        .execute("rm", &args(&["-rf", "/tmp/x"]), ExecuteOptions::default())
        .await
        .expect_err("rm is not allowlisted");
    assert!(matches!(
        error,
        CommandError::Policy(PolicyViolation::NotAllowlisted { .. })
    ));
}

#[test]
fn unit_truncate_output_respects_char_boundaries() {
    assert_eq!(truncate_output("short", 16), "short");
    let truncated = truncate_output("héllo wörld", 3);
    assert!(truncated.ends_with("<output truncated>"));
    assert!(truncated.len() < 32);
}

#[test]
fn unit_normalize_lexically_resolves_dot_segments() {
    assert_eq!(
        normalize_lexically(&PathBuf::from("/opt/app/../../etc/passwd")),
        PathBuf::from("/etc/passwd")
    );
    assert_eq!(
        normalize_lexically(&PathBuf::from("/var/./log/nginx")),
        PathBuf::from("/var/log/nginx")
    );
    assert_eq!(
        normalize_lexically(&PathBuf::from("/../../etc")),
        PathBuf::from("/etc")
    );
}

#[test]
fn unit_check_path_denies_traversal_outside_allowed_prefixes() {
    let gate = PathGate::new(PathPolicy {
        allowed_prefixes: vec![PathBuf::from("/opt"), PathBuf::from("/var/log")],
        unsafe_prefixes: Vec::new(),
        sensitive_patterns: Vec::new(),
    })
    .expect("build path gate");

    let error = gate
        .check_path("/opt/app/../../etc/passwd")
        .expect_err("normalized path escapes the allowed prefixes");
    assert!(matches!(error, AccessDenied::OutsideAllowed { .. }));
}

#[test]
fn unit_check_path_accepts_path_under_allowed_prefix() {
    let gate = PathGate::new(PathPolicy {
        allowed_prefixes: vec![PathBuf::from("/opt"), PathBuf::from("/var/log")],
        unsafe_prefixes: Vec::new(),
        sensitive_patterns: Vec::new(),
    })
    .expect("build path gate");

    let real = gate
        .check_path("/opt/app/config.yaml")
        .expect("path under /opt is allowed");
    assert_eq!(real, PathBuf::from("/opt/app/config.yaml"));
}

#[test]
fn unit_check_path_rejects_sensitive_patterns_on_logical_form() {
    let gate = PathGate::new(PathPolicy::default()).expect("build path gate");
    let error = gate
        .check_path("/var/log/../../root/.ssh/id_rsa")
        .expect_err("sensitive pattern must be rejected before prefix checks");
    assert!(matches!(error, AccessDenied::SensitivePattern { .. }));

    let error = gate
        .check_path("/opt/app/.ENV")
        .expect_err("sensitive matching is case-insensitive");
    assert!(matches!(error, AccessDenied::SensitivePattern { .. }));
}

#[test]
fn unit_check_path_unsafe_prefix_vetoes_allowed_prefix() {
    let gate = PathGate::new(PathPolicy::default()).expect("build path gate");
    let error = gate
        .check_path("/etc/ssl/private/server.pem")
        .expect_err("unsafe prefix wins over the allowed /etc prefix");
    assert!(matches!(error, AccessDenied::UnsafePrefix { .. }));
}

#[cfg(unix)]
#[test]
fn regression_check_path_denies_symlink_escape() {
    let allowed = tempdir().expect("create allowed dir");
    let outside = tempdir().expect("create outside dir");
    let allowed_root = allowed.path().canonicalize().expect("canonicalize allowed");
    let target = outside.path().join("target.log");
    std::fs::write(&target, "secret").expect("write target");
    let link = allowed_root.join("link.log");
    std::os::unix::fs::symlink(&target, &link).expect("create symlink");

    let gate = PathGate::new(PathPolicy {
        allowed_prefixes: vec![allowed_root.clone()],
        unsafe_prefixes: Vec::new(),
        sensitive_patterns: Vec::new(),
    })
    .expect("build path gate");

    let error = gate
        .check_path(&link.display().to_string())
        .expect_err("symlink target escapes the allowed prefix");
    assert!(matches!(error, AccessDenied::OutsideAllowed { .. }));
}

#[test]
fn regression_check_path_is_idempotent_for_accepted_paths() {
    let temp = tempdir().expect("create tempdir");
    let root = temp.path().canonicalize().expect("canonicalize tempdir");
    let file = root.join("service.log");
    std::fs::write(&file, "ok").expect("write file");

    let gate = PathGate::new(PathPolicy {
        allowed_prefixes: vec![root.clone()],
        unsafe_prefixes: Vec::new(),
        sensitive_patterns: Vec::new(),
    })
    .expect("build path gate");

    let first = gate
        .check_path(&file.display().to_string())
        .expect("file under allowed root");
    let second = gate
        .check_path(&first.display().to_string())
        .expect("re-checking the returned real path succeeds");
    assert_eq!(first, second);
}

#[test]
fn unit_check_readable_content_screens_binary_and_extensions() {
    let temp = tempdir().expect("create tempdir");
    let gate = PathGate::new(PathPolicy::default()).expect("build path gate");

    let binary = temp.path().join("core.log");
    std::fs::write(&binary, b"text\x00more").expect("write binary file");
    let error = gate
        .check_readable_content(&binary)
        .expect_err("null byte marks the file as binary");
    assert!(matches!(error, AccessDenied::BinaryContent { .. }));

    let opaque = temp.path().join("payload.sqlite");
    std::fs::write(&opaque, b"data").expect("write opaque file");
    let error = gate
        .check_readable_content(&opaque)
        .expect_err("unknown extension is rejected");
    assert!(matches!(error, AccessDenied::ExtensionNotAllowed { .. }));

    let manifest = temp.path().join("Makefile");
    std::fs::write(&manifest, "all:\n\ttrue\n").expect("write manifest file");
    gate.check_readable_content(&manifest)
        .expect("extensionless text files are readable");
}
