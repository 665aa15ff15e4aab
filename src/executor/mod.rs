//! Sandboxed tool execution: shell commands, script runs, and file
//! operations with path containment, size limits, allow/deny lists, and
//! timeouts.
//!
//! Every operation returns a [`ToolResult`]; no failure propagates as an
//! error out of the executor. Callers branch on `success`.

mod paths;

use crate::config::{FileOpsPolicy, ToolPolicy};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;

/// Cap on captured stdout/stderr per execution.
const MAX_CAPTURE_BYTES: usize = 1024 * 1024;

/// Interpreter used for `execute_python_script`.
const PYTHON_BIN: &str = "python3";

/// Shell metacharacters rejected unless the command is whitelisted.
const METACHARACTERS: &[char] = &[';', '|', '&', '>', '<', '`', '$', '(', ')'];

/// The closed set of tools agents and plans may invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ToolSpec {
    /// Run a shell command from the safe list.
    #[serde(rename = "execute_bash")]
    ExecuteBash,
    /// Run a python script with arguments.
    #[serde(rename = "execute_python_script")]
    ExecutePythonScript,
    /// Read a UTF-8 file.
    #[serde(rename = "read_file_tool")]
    ReadFile,
    /// Write a file atomically.
    #[serde(rename = "write_file_tool")]
    WriteFile,
    /// Find-and-replace inside a file.
    #[serde(rename = "edit_file_tool")]
    EditFile,
    /// List directory entries against a glob.
    #[serde(rename = "list_files_tool")]
    ListFiles,
}

impl ToolSpec {
    /// Whether a step running this tool can mutate state and therefore
    /// needs a checkpoint first.
    ///
    /// Bash steps may declare `"read_only": true` in their arguments to
    /// opt out.
    pub fn is_mutating(&self, arguments: &serde_json::Value) -> bool {
        match self {
            ToolSpec::WriteFile | ToolSpec::EditFile | ToolSpec::ExecutePythonScript => true,
            ToolSpec::ExecuteBash => !arguments
                .get("read_only")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            ToolSpec::ReadFile | ToolSpec::ListFiles => false,
        }
    }

    /// Paths a step using this tool declares it will touch, for
    /// checkpoint snapshots.
    ///
    /// File tools touch their `path`; bash and python steps may declare a
    /// `"paths"` array.
    pub fn touched_paths(&self, arguments: &serde_json::Value) -> Vec<String> {
        match self {
            ToolSpec::WriteFile | ToolSpec::EditFile => arguments
                .get("path")
                .and_then(|v| v.as_str())
                .map(|s| vec![s.to_string()])
                .unwrap_or_default(),
            ToolSpec::ExecuteBash | ToolSpec::ExecutePythonScript => arguments
                .get("paths")
                .and_then(|v| v.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str())
                        .map(|s| s.to_string())
                        .collect()
                })
                .unwrap_or_default(),
            ToolSpec::ReadFile | ToolSpec::ListFiles => Vec::new(),
        }
    }
}

impl std::fmt::Display for ToolSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ToolSpec::ExecuteBash => "execute_bash",
            ToolSpec::ExecutePythonScript => "execute_python_script",
            ToolSpec::ReadFile => "read_file_tool",
            ToolSpec::WriteFile => "write_file_tool",
            ToolSpec::EditFile => "edit_file_tool",
            ToolSpec::ListFiles => "list_files_tool",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for ToolSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "execute_bash" => Ok(ToolSpec::ExecuteBash),
            "execute_python_script" => Ok(ToolSpec::ExecutePythonScript),
            "read_file_tool" => Ok(ToolSpec::ReadFile),
            "write_file_tool" => Ok(ToolSpec::WriteFile),
            "edit_file_tool" => Ok(ToolSpec::EditFile),
            "list_files_tool" => Ok(ToolSpec::ListFiles),
            _ => Err(anyhow::anyhow!("unknown tool: {}", s)),
        }
    }
}

/// Outcome of one tool execution.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ToolResult {
    /// Whether the operation succeeded.
    pub success: bool,
    /// Captured standard output, or the operation's primary payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    /// Captured standard error, or a non-fatal warning.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    /// Child process exit code, when a process ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_code: Option<i32>,
    /// Failure description when `success` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock duration of the operation.
    pub duration_ms: u64,
}

impl ToolResult {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    fn output(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: Some(stdout.into()),
            ..Default::default()
        }
    }

    fn stamped(mut self, started: Instant) -> Self {
        self.duration_ms = started.elapsed().as_millis() as u64;
        self
    }
}

enum CommandPlan {
    /// Exec the tokens directly, no shell.
    Direct(Vec<String>),
    /// The command was whitelisted for metacharacters; hand it to a shell.
    Shell(String),
}

/// Sandboxed executor for the six tools.
///
/// Holds the file-operation and command policies plus a canonical working
/// directory. When the policy lists no allowed directories, containment
/// collapses to "inside the working directory".
#[derive(Debug)]
pub struct ToolExecutor {
    file_ops: FileOpsPolicy,
    tool_policy: ToolPolicy,
    working_dir: PathBuf,
    allowed: Vec<PathBuf>,
}

impl ToolExecutor {
    /// Build an executor.
    ///
    /// # Arguments
    /// * `file_ops` - File operation policy.
    /// * `tool_policy` - Command allow/deny policy and default timeout.
    /// * `working_dir` - Base directory for relative paths and child
    ///   processes.
    pub fn new(file_ops: FileOpsPolicy, tool_policy: ToolPolicy, working_dir: &Path) -> Self {
        let working_dir = paths::canonicalize_lenient(&paths::normalize_lexically(
            &if working_dir.is_absolute() {
                working_dir.to_path_buf()
            } else {
                std::env::current_dir()
                    .unwrap_or_else(|_| PathBuf::from("."))
                    .join(working_dir)
            },
        ));

        let allowed = if file_ops.allowed_directories.is_empty() {
            vec![working_dir.clone()]
        } else {
            file_ops
                .allowed_directories
                .iter()
                .map(|dir| {
                    let joined = if dir.is_absolute() {
                        dir.clone()
                    } else {
                        working_dir.join(dir)
                    };
                    paths::canonicalize_lenient(&paths::normalize_lexically(&joined))
                })
                .collect()
        };

        Self {
            file_ops,
            tool_policy,
            working_dir,
            allowed,
        }
    }

    /// The executor's working directory.
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Change the working directory. Must exist and be a directory.
    pub fn set_working_dir(&mut self, working_dir: &Path) -> anyhow::Result<()> {
        if !working_dir.is_dir() {
            return Err(anyhow::anyhow!(
                "not a directory: {}",
                working_dir.display()
            ));
        }
        self.working_dir = paths::canonicalize_lenient(working_dir);
        Ok(())
    }

    fn contain(&self, raw: &str) -> Result<PathBuf, String> {
        paths::contain(raw, &self.working_dir, &self.allowed)
    }

    /// Run a raw path through the containment rules without touching it.
    ///
    /// The workflow engine uses this to canonicalise the paths a step
    /// declares before snapshotting them.
    pub fn resolve_path(&self, raw: &str) -> Result<PathBuf, String> {
        self.contain(raw)
    }

    fn validate_command(&self, command: &str) -> Result<CommandPlan, String> {
        let tokens: Vec<String> = command.split_whitespace().map(str::to_string).collect();
        let first = match tokens.first() {
            Some(first) => first.clone(),
            None => return Err("command not permitted".to_string()),
        };

        if !self.tool_policy.safe_commands.iter().any(|c| *c == first) {
            return Err("command not permitted".to_string());
        }
        if tokens
            .iter()
            .any(|t| self.tool_policy.denied_commands.iter().any(|d| d == t))
        {
            return Err("command not permitted".to_string());
        }

        if command.chars().any(|c| METACHARACTERS.contains(&c)) {
            if self
                .tool_policy
                .metachar_allowed_commands
                .iter()
                .any(|c| *c == first)
            {
                return Ok(CommandPlan::Shell(command.to_string()));
            }
            return Err("command not permitted".to_string());
        }

        Ok(CommandPlan::Direct(tokens))
    }

    async fn run_child(
        &self,
        mut cmd: Command,
        timeout_seconds: u64,
        started: Instant,
    ) -> ToolResult {
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        match timeout(Duration::from_secs(timeout_seconds), cmd.output()).await {
            Ok(Ok(output)) => {
                let mut stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let mut stderr = String::from_utf8_lossy(&output.stderr).to_string();
                stdout.truncate(MAX_CAPTURE_BYTES);
                stderr.truncate(MAX_CAPTURE_BYTES);

                ToolResult {
                    success: output.status.success(),
                    stdout: Some(stdout),
                    stderr: Some(stderr),
                    return_code: Some(output.status.code().unwrap_or(-1)),
                    error: if output.status.success() {
                        None
                    } else {
                        Some(format!(
                            "exited with code {}",
                            output.status.code().unwrap_or(-1)
                        ))
                    },
                    duration_ms: 0,
                }
                .stamped(started)
            }
            Ok(Err(e)) => {
                ToolResult::failure(format!("failed to execute command: {e}")).stamped(started)
            }
            Err(_) => {
                // the timed-out child is killed on drop
                ToolResult::failure(format!("timed out after {timeout_seconds}s")).stamped(started)
            }
        }
    }

    /// Run a shell command under the allow/deny policy.
    ///
    /// Commands without metacharacters exec directly; whitelisted ones go
    /// through `sh -c`. The child runs in `working_dir` (contained) and is
    /// killed on timeout.
    pub async fn execute_bash(
        &self,
        command: &str,
        working_dir: Option<&str>,
        timeout_seconds: Option<u64>,
    ) -> ToolResult {
        let started = Instant::now();

        let plan = match self.validate_command(command) {
            Ok(plan) => plan,
            Err(e) => return ToolResult::failure(e).stamped(started),
        };

        let dir = match working_dir {
            Some(raw) => match self.contain(raw) {
                Ok(dir) if dir.is_dir() => dir,
                Ok(dir) => {
                    return ToolResult::failure(format!(
                        "working directory does not exist: {}",
                        dir.display()
                    ))
                    .stamped(started)
                }
                Err(e) => return ToolResult::failure(e).stamped(started),
            },
            None => self.working_dir.clone(),
        };

        let mut cmd = match plan {
            CommandPlan::Direct(tokens) => {
                let mut cmd = Command::new(&tokens[0]);
                cmd.args(&tokens[1..]);
                cmd
            }
            CommandPlan::Shell(line) => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(line);
                cmd
            }
        };
        cmd.current_dir(&dir);

        let limit = timeout_seconds.unwrap_or(self.tool_policy.default_timeout_seconds);
        self.run_child(cmd, limit, started).await
    }

    /// Run a python script with arguments under the same containment and
    /// timeout rules as bash.
    pub async fn execute_python_script(
        &self,
        script_path: &str,
        args: &[String],
        timeout_seconds: Option<u64>,
    ) -> ToolResult {
        let started = Instant::now();

        let script = match self.contain(script_path) {
            Ok(path) => path,
            Err(e) => return ToolResult::failure(e).stamped(started),
        };
        if !script.is_file() {
            return ToolResult::failure("file does not exist").stamped(started);
        }

        let mut cmd = Command::new(PYTHON_BIN);
        cmd.arg(&script).args(args).current_dir(&self.working_dir);

        let limit = timeout_seconds.unwrap_or(self.tool_policy.default_timeout_seconds);
        self.run_child(cmd, limit, started).await
    }

    /// Read a contained UTF-8 file, refusing oversized ones.
    pub async fn read_file(&self, path: &str) -> ToolResult {
        let started = Instant::now();

        if !self.file_ops.allow_read {
            return ToolResult::failure("read operations are disabled").stamped(started);
        }
        let path = match self.contain(path) {
            Ok(path) => path,
            Err(e) => return ToolResult::failure(e).stamped(started),
        };

        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta,
            _ => return ToolResult::failure("file does not exist").stamped(started),
        };
        if meta.len() > self.file_ops.max_file_size_kb * 1024 {
            return ToolResult::failure("file too large").stamped(started);
        }

        match tokio::fs::read(&path).await {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(text) => ToolResult::output(text).stamped(started),
                Err(_) => ToolResult::failure("file is not valid UTF-8").stamped(started),
            },
            Err(e) => ToolResult::failure(format!("read failed: {e}")).stamped(started),
        }
    }

    /// Write a contained file atomically (temp-then-rename).
    ///
    /// Refuses oversized content, and existing targets unless `overwrite`
    /// is set. Overwrites carry a warning in `stderr` when the policy asks
    /// for one.
    pub async fn write_file(&self, path: &str, content: &str, overwrite: bool) -> ToolResult {
        let started = Instant::now();

        if !self.file_ops.allow_write {
            return ToolResult::failure("write operations are disabled").stamped(started);
        }
        let path = match self.contain(path) {
            Ok(path) => path,
            Err(e) => return ToolResult::failure(e).stamped(started),
        };
        if content.len() as u64 > self.file_ops.max_file_size_kb * 1024 {
            return ToolResult::failure("file too large").stamped(started);
        }

        let existed = path.exists();
        if existed && !overwrite {
            return ToolResult::failure("file already exists").stamped(started);
        }

        if let Err(e) = self.write_atomic(&path, content.as_bytes()).await {
            return ToolResult::failure(format!("write failed: {e}")).stamped(started);
        }

        let mut result = ToolResult::output(format!(
            "wrote {} bytes to {}",
            content.len(),
            path.display()
        ));
        if existed && self.file_ops.overwrite_warning {
            result.stderr = Some(format!("warning: overwrote existing file {}", path.display()));
        }
        result.stamped(started)
    }

    /// Replace every occurrence of `find` in a contained file, taking a
    /// `<path>.backup` copy first when the policy asks for one.
    pub async fn edit_file(&self, path: &str, find: &str, replace: &str) -> ToolResult {
        let started = Instant::now();

        if !self.file_ops.allow_edit {
            return ToolResult::failure("edit operations are disabled").stamped(started);
        }
        let path = match self.contain(path) {
            Ok(path) => path,
            Err(e) => return ToolResult::failure(e).stamped(started),
        };
        if !path.is_file() {
            return ToolResult::failure("file does not exist").stamped(started);
        }

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) => return ToolResult::failure(format!("read failed: {e}")).stamped(started),
        };
        if !content.contains(find) {
            return ToolResult::failure("find text not found").stamped(started);
        }

        if self.file_ops.backup_before_edit {
            let backup = PathBuf::from(format!("{}.backup", path.display()));
            if let Err(e) = tokio::fs::copy(&path, &backup).await {
                return ToolResult::failure(format!("backup failed: {e}")).stamped(started);
            }
        }

        let occurrences = content.matches(find).count();
        let updated = content.replace(find, replace);
        if let Err(e) = self.write_atomic(&path, updated.as_bytes()).await {
            return ToolResult::failure(format!("write failed: {e}")).stamped(started);
        }

        ToolResult::output(format!(
            "edited {} ({} replacement{})",
            path.display(),
            occurrences,
            if occurrences == 1 { "" } else { "s" }
        ))
        .stamped(started)
    }

    /// List entry names in a contained directory, optionally filtered by a
    /// glob pattern, sorted, one per line in `stdout`.
    pub async fn list_files(&self, directory: &str, pattern: Option<&str>) -> ToolResult {
        let started = Instant::now();

        let dir = match self.contain(directory) {
            Ok(dir) => dir,
            Err(e) => return ToolResult::failure(e).stamped(started),
        };
        if !dir.is_dir() {
            return ToolResult::failure("directory does not exist").stamped(started);
        }

        let matcher = match pattern {
            Some(raw) => match glob::Pattern::new(raw) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    return ToolResult::failure(format!("invalid pattern: {e}")).stamped(started)
                }
            },
            None => None,
        };

        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) => return ToolResult::failure(format!("list failed: {e}")).stamped(started),
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if matcher.as_ref().map(|m| m.matches(&name)).unwrap_or(true) {
                names.push(name);
            }
        }
        names.sort();

        ToolResult::output(names.join("\n")).stamped(started)
    }

    /// Invoke a tool by spec with JSON arguments, as workflow steps do.
    ///
    /// Missing or mistyped arguments fail the result; nothing panics on
    /// model-shaped input.
    pub async fn dispatch(&self, tool: ToolSpec, arguments: &serde_json::Value) -> ToolResult {
        fn req_str<'a>(args: &'a serde_json::Value, key: &str) -> Result<&'a str, String> {
            args.get(key)
                .and_then(|v| v.as_str())
                .ok_or_else(|| format!("missing argument: {key}"))
        }

        let timeout_seconds = arguments.get("timeout_seconds").and_then(|v| v.as_u64());

        match tool {
            ToolSpec::ExecuteBash => match req_str(arguments, "command") {
                Ok(command) => {
                    let dir = arguments.get("working_dir").and_then(|v| v.as_str());
                    self.execute_bash(command, dir, timeout_seconds).await
                }
                Err(e) => ToolResult::failure(e),
            },
            ToolSpec::ExecutePythonScript => match req_str(arguments, "script_path") {
                Ok(script) => {
                    let args: Vec<String> = arguments
                        .get("args")
                        .and_then(|v| v.as_array())
                        .map(|items| {
                            items
                                .iter()
                                .filter_map(|v| v.as_str())
                                .map(str::to_string)
                                .collect()
                        })
                        .unwrap_or_default();
                    self.execute_python_script(script, &args, timeout_seconds)
                        .await
                }
                Err(e) => ToolResult::failure(e),
            },
            ToolSpec::ReadFile => match req_str(arguments, "path") {
                Ok(path) => self.read_file(path).await,
                Err(e) => ToolResult::failure(e),
            },
            ToolSpec::WriteFile => {
                match (req_str(arguments, "path"), req_str(arguments, "content")) {
                    (Ok(path), Ok(content)) => {
                        let overwrite = arguments
                            .get("overwrite")
                            .and_then(|v| v.as_bool())
                            .unwrap_or(false);
                        self.write_file(path, content, overwrite).await
                    }
                    (Err(e), _) | (_, Err(e)) => ToolResult::failure(e),
                }
            }
            ToolSpec::EditFile => {
                match (
                    req_str(arguments, "path"),
                    req_str(arguments, "find"),
                    req_str(arguments, "replace"),
                ) {
                    (Ok(path), Ok(find), Ok(replace)) => {
                        self.edit_file(path, find, replace).await
                    }
                    (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => ToolResult::failure(e),
                }
            }
            ToolSpec::ListFiles => match req_str(arguments, "directory") {
                Ok(dir) => {
                    let pattern = arguments.get("pattern").and_then(|v| v.as_str());
                    self.list_files(dir, pattern).await
                }
                Err(e) => ToolResult::failure(e),
            },
        }
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await
    }
}

#[cfg(test)]
mod tests;
