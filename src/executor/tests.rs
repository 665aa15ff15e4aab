use super::*;
use crate::config::{FileOpsPolicy, ToolPolicy};
use tempfile::TempDir;

fn policy_for_tests() -> ToolPolicy {
    ToolPolicy {
        safe_commands: ["echo", "ls", "cat", "sleep", "false", "pwd"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        denied_commands: vec!["rm".to_string(), "sudo".to_string()],
        default_timeout_seconds: 10,
        metachar_allowed_commands: Vec::new(),
    }
}

fn executor_in(dir: &TempDir) -> ToolExecutor {
    ToolExecutor::new(FileOpsPolicy::default(), policy_for_tests(), dir.path())
}

#[tokio::test]
async fn reads_existing_file() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("a.txt"), "hello").unwrap();

    let executor = executor_in(&dir);
    let result = executor.read_file("a.txt").await;

    assert!(result.success);
    assert_eq!(result.stdout.as_deref(), Some("hello"));
}

#[tokio::test]
async fn path_traversal_is_blocked() {
    let dir = TempDir::new().unwrap();
    let executor = executor_in(&dir);

    let result = executor.read_file("../../etc/passwd").await;
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("not in allowed directories"));

    let result = executor
        .write_file("/etc/hivekit-should-not-exist", "x", true)
        .await;
    assert_eq!(result.error.as_deref(), Some("not in allowed directories"));
}

#[tokio::test]
async fn unlisted_command_is_blocked() {
    let dir = TempDir::new().unwrap();
    let executor = executor_in(&dir);

    let result = executor.execute_bash("rm -rf /", None, None).await;
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("command not permitted"));
}

#[tokio::test]
async fn safe_command_runs_and_captures_output() {
    let dir = TempDir::new().unwrap();
    let executor = executor_in(&dir);

    let result = executor.execute_bash("echo hi", None, None).await;
    assert!(result.success);
    assert_eq!(result.stdout.as_deref(), Some("hi\n"));
    assert_eq!(result.return_code, Some(0));
}

#[tokio::test]
async fn denied_token_rejects_even_with_safe_first_token() {
    let dir = TempDir::new().unwrap();
    let executor = executor_in(&dir);

    let result = executor.execute_bash("echo rm", None, None).await;
    assert_eq!(result.error.as_deref(), Some("command not permitted"));
}

#[tokio::test]
async fn metacharacters_are_rejected_by_default() {
    let dir = TempDir::new().unwrap();
    let executor = executor_in(&dir);

    for command in ["echo hi; ls", "echo hi | cat", "echo $(pwd)", "echo hi > out"] {
        let result = executor.execute_bash(command, None, None).await;
        assert_eq!(
            result.error.as_deref(),
            Some("command not permitted"),
            "{command} should be rejected"
        );
    }
}

#[tokio::test]
async fn whitelisted_command_may_use_metacharacters() {
    let dir = TempDir::new().unwrap();
    let mut policy = policy_for_tests();
    policy.metachar_allowed_commands = vec!["echo".to_string()];
    let executor = ToolExecutor::new(FileOpsPolicy::default(), policy, dir.path());

    let result = executor.execute_bash("echo a; echo b", None, None).await;
    assert!(result.success);
    assert_eq!(result.stdout.as_deref(), Some("a\nb\n"));
}

#[tokio::test]
async fn command_timeout_kills_the_child() {
    let dir = TempDir::new().unwrap();
    let executor = executor_in(&dir);

    let result = executor.execute_bash("sleep 30", None, Some(1)).await;
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("timed out after 1s"));
}

#[tokio::test]
async fn oversized_file_is_refused() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("big.txt"), "x".repeat(4096)).unwrap();

    let mut file_ops = FileOpsPolicy::default();
    file_ops.max_file_size_kb = 1;
    let executor = ToolExecutor::new(file_ops, policy_for_tests(), dir.path());

    let result = executor.read_file("big.txt").await;
    assert_eq!(result.error.as_deref(), Some("file too large"));

    let result = executor.write_file("out.txt", &"y".repeat(4096), false).await;
    assert_eq!(result.error.as_deref(), Some("file too large"));
}

#[tokio::test]
async fn missing_file_read_fails() {
    let dir = TempDir::new().unwrap();
    let executor = executor_in(&dir);

    let result = executor.read_file("ghost.txt").await;
    assert_eq!(result.error.as_deref(), Some("file does not exist"));
}

#[tokio::test]
async fn write_respects_overwrite_flag() {
    let dir = TempDir::new().unwrap();
    let executor = executor_in(&dir);

    assert!(executor.write_file("f.txt", "one", false).await.success);

    let result = executor.write_file("f.txt", "two", false).await;
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("file already exists"));

    let result = executor.write_file("f.txt", "two", true).await;
    assert!(result.success);
    assert!(result.stderr.unwrap().contains("overwrote existing file"));
    assert_eq!(std::fs::read_to_string(dir.path().join("f.txt")).unwrap(), "two");
}

#[tokio::test]
async fn write_creates_parent_directories() {
    let dir = TempDir::new().unwrap();
    let executor = executor_in(&dir);

    let result = executor.write_file("nested/deep/f.txt", "data", false).await;
    assert!(result.success);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("nested/deep/f.txt")).unwrap(),
        "data"
    );
}

#[tokio::test]
async fn edit_replaces_and_backs_up() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("code.rs"), "old old new").unwrap();
    let executor = executor_in(&dir);

    let result = executor.edit_file("code.rs", "old", "fresh").await;
    assert!(result.success);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("code.rs")).unwrap(),
        "fresh fresh new"
    );
    // original preserved beside the file
    assert_eq!(
        std::fs::read_to_string(dir.path().join("code.rs.backup")).unwrap(),
        "old old new"
    );
}

#[tokio::test]
async fn edit_without_match_fails() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("code.rs"), "content").unwrap();
    let executor = executor_in(&dir);

    let result = executor.edit_file("code.rs", "absent", "x").await;
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("find text not found"));
    // no backup taken for a refused edit
    assert!(!dir.path().join("code.rs.backup").exists());
}

#[tokio::test]
async fn list_filters_by_glob() {
    let dir = TempDir::new().unwrap();
    for name in ["a.rs", "b.rs", "c.txt"] {
        std::fs::write(dir.path().join(name), "").unwrap();
    }
    let executor = executor_in(&dir);

    let result = executor.list_files(".", Some("*.rs")).await;
    assert!(result.success);
    assert_eq!(result.stdout.as_deref(), Some("a.rs\nb.rs"));

    let result = executor.list_files(".", None).await;
    assert_eq!(result.stdout.as_deref(), Some("a.rs\nb.rs\nc.txt"));
}

#[tokio::test]
async fn dispatch_reports_missing_arguments() {
    let dir = TempDir::new().unwrap();
    let executor = executor_in(&dir);

    let result = executor
        .dispatch(ToolSpec::WriteFile, &serde_json::json!({"path": "x.txt"}))
        .await;
    assert_eq!(result.error.as_deref(), Some("missing argument: content"));

    let result = executor
        .dispatch(ToolSpec::ExecuteBash, &serde_json::json!({}))
        .await;
    assert_eq!(result.error.as_deref(), Some("missing argument: command"));
}

#[tokio::test]
async fn dispatch_routes_to_the_right_tool() {
    let dir = TempDir::new().unwrap();
    let executor = executor_in(&dir);

    let result = executor
        .dispatch(
            ToolSpec::WriteFile,
            &serde_json::json!({"path": "via.txt", "content": "dispatched"}),
        )
        .await;
    assert!(result.success);

    let result = executor
        .dispatch(ToolSpec::ReadFile, &serde_json::json!({"path": "via.txt"}))
        .await;
    assert_eq!(result.stdout.as_deref(), Some("dispatched"));
}

#[test]
fn tool_spec_round_trips_through_names() {
    for tool in [
        ToolSpec::ExecuteBash,
        ToolSpec::ExecutePythonScript,
        ToolSpec::ReadFile,
        ToolSpec::WriteFile,
        ToolSpec::EditFile,
        ToolSpec::ListFiles,
    ] {
        let parsed: ToolSpec = tool.to_string().parse().unwrap();
        assert_eq!(parsed, tool);
    }
    assert!("launch_missiles".parse::<ToolSpec>().is_err());
}

#[test]
fn mutation_classification_honours_read_only_bash() {
    let none = serde_json::json!({});
    assert!(ToolSpec::WriteFile.is_mutating(&none));
    assert!(ToolSpec::EditFile.is_mutating(&none));
    assert!(ToolSpec::ExecuteBash.is_mutating(&none));
    assert!(!ToolSpec::ExecuteBash.is_mutating(&serde_json::json!({"read_only": true})));
    assert!(!ToolSpec::ReadFile.is_mutating(&none));
    assert!(!ToolSpec::ListFiles.is_mutating(&none));
}

#[test]
fn touched_paths_come_from_arguments() {
    let args = serde_json::json!({"path": "a.txt", "content": "x"});
    assert_eq!(ToolSpec::WriteFile.touched_paths(&args), vec!["a.txt"]);

    let args = serde_json::json!({"command": "echo", "paths": ["x", "y"]});
    assert_eq!(ToolSpec::ExecuteBash.touched_paths(&args), vec!["x", "y"]);

    assert!(ToolSpec::ReadFile
        .touched_paths(&serde_json::json!({"path": "a"}))
        .is_empty());
}
