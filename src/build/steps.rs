//! External build, install and uninstall commands
//!
//! Commands run through `sh -c` with a fixed environment. When one fails,
//! the configured logs (`config.log` and friends) are searched for known
//! failure lines, which travel with the error and are printed right away.

use crate::core::output;
use crate::error::{Error, IoContext, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// Logs searched when a package lists none
pub const DEFAULT_DIAGNOSTIC_LOGS: &[&str] = &["config.log", "CMakeFiles/CMakeError.log"];

/// Lines containing any of these (case-insensitively) are reported
const FAILURE_MARKERS: &[&str] = &[
    "error:",
    "fatal error",
    "not found",
    "cannot find",
    "no such file",
    "undefined reference",
    "configure: error",
    "c compiler cannot create executables",
    "permission denied",
];

/// Reported lines per log, keeping the last ones
const MAX_LINES_PER_LOG: usize = 20;

/// Builder for a single shell command.
#[derive(Debug, Clone)]
pub struct ShellCmd {
    cmd: String,
    cwd: Option<PathBuf>,
    env: BTreeMap<String, String>,
}

impl ShellCmd {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    pub fn dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.env.insert(k.into(), v.into());
        }
        self
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", &self.cmd]);
        if let Some(ref cwd) = self.cwd {
            cmd.current_dir(cwd);
        }
        cmd.envs(&self.env);
        cmd
    }

    /// Run to completion; a non-zero exit becomes [`Error::CommandFailed`].
    pub fn run(&self) -> Result<()> {
        let status = self
            .build_command()
            .status()
            .io_context(|| format!("cannot start: {}", self.display_cmd()))?;
        if !status.success() {
            return Err(Error::CommandFailed {
                cmd: self.display_cmd(),
                code: status.code(),
                diagnostics: Vec::new(),
            });
        }
        Ok(())
    }

    pub fn cmd(&self) -> &str {
        &self.cmd
    }

    /// Command shortened to 60 characters for messages.
    pub fn display_cmd(&self) -> String {
        if self.cmd.chars().count() > 60 {
            let head: String = self.cmd.chars().take(57).collect();
            format!("{}...", head)
        } else {
            self.cmd.clone()
        }
    }
}

/// Runs a package's command lists in one directory with a shared environment.
#[derive(Debug, Clone)]
pub struct StepRunner {
    dir: PathBuf,
    env: BTreeMap<String, String>,
    diagnostic_logs: Vec<PathBuf>,
}

impl StepRunner {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            env: BTreeMap::new(),
            diagnostic_logs: DEFAULT_DIAGNOSTIC_LOGS.iter().map(PathBuf::from).collect(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.env.insert(k.into(), v.into());
        }
        self
    }

    /// Logs to search on failure, relative to the working directory.
    /// An empty list keeps the defaults.
    pub fn diagnostic_logs<I, P>(mut self, logs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let logs: Vec<PathBuf> = logs.into_iter().map(Into::into).collect();
        if !logs.is_empty() {
            self.diagnostic_logs = logs;
        }
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Run `commands` in order, stopping at the first failure.
    pub fn run_all(&self, stage: &str, commands: &[String]) -> Result<()> {
        if commands.is_empty() {
            debug!(stage, "no commands");
            return Ok(());
        }
        std::fs::create_dir_all(&self.dir)
            .io_context(|| format!("cannot create {}", self.dir.display()))?;

        for command in commands {
            output::detail(&format!("{}: {}", stage, command));
            let result = ShellCmd::new(command.as_str())
                .dir(&self.dir)
                .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .run();

            match result {
                Ok(()) => {}
                Err(Error::CommandFailed { cmd, code, .. }) => {
                    let diagnostics = scan_logs(&self.dir, &self.diagnostic_logs);
                    for line in &diagnostics {
                        output::warning(line);
                    }
                    return Err(Error::CommandFailed {
                        cmd,
                        code,
                        diagnostics,
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Collect failure lines from the logs that exist under `dir`.
pub fn scan_logs(dir: &Path, logs: &[PathBuf]) -> Vec<String> {
    let mut found = Vec::new();
    for log in logs {
        let path = dir.join(log);
        let Ok(bytes) = std::fs::read(&path) else {
            continue;
        };
        let text = String::from_utf8_lossy(&bytes);
        let hits: Vec<&str> = text
            .lines()
            .map(str::trim)
            .filter(|line| {
                let lower = line.to_lowercase();
                FAILURE_MARKERS.iter().any(|m| lower.contains(m))
            })
            .collect();
        let skip = hits.len().saturating_sub(MAX_LINES_PER_LOG);
        found.extend(
            hits.into_iter()
                .skip(skip)
                .map(|line| format!("{}: {}", log.display(), line)),
        );
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_cmd_env_and_dir() {
        let dir = tempfile::tempdir().unwrap();
        ShellCmd::new("echo \"$GREETING\" > out.txt")
            .dir(dir.path())
            .env("GREETING", "hello_world")
            .run()
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("out.txt")).unwrap(),
            "hello_world\n"
        );
    }

    #[test]
    fn test_shell_cmd_failure_reports_code() {
        let err = ShellCmd::new("exit 42").run().unwrap_err();
        assert!(matches!(err, Error::CommandFailed { code: Some(42), .. }));
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn test_display_cmd_truncates() {
        assert_eq!(ShellCmd::new("make -j4").display_cmd(), "make -j4");
        let long = ShellCmd::new("a".repeat(100));
        assert_eq!(long.display_cmd().chars().count(), 60);
        assert!(long.display_cmd().ends_with("..."));
    }

    #[test]
    fn test_run_all_stops_at_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let commands = vec![
            "touch first".to_string(),
            "false".to_string(),
            "touch third".to_string(),
        ];
        let err = StepRunner::new(dir.path())
            .run_all("build", &commands)
            .unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
        assert!(dir.path().join("first").exists());
        assert!(!dir.path().join("third").exists());
    }

    #[test]
    fn test_run_all_attaches_log_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.log"),
            "checking for gcc... gcc\nconfigure: error: C compiler cannot create executables\nok line\n",
        )
        .unwrap();

        let err = StepRunner::new(dir.path())
            .run_all("build", &["exit 1".to_string()])
            .unwrap_err();

        assert_eq!(
            err.diagnostics(),
            ["config.log: configure: error: C compiler cannot create executables".to_string()]
        );
    }

    #[test]
    fn test_run_all_env_visible() {
        let dir = tempfile::tempdir().unwrap();
        StepRunner::new(dir.path())
            .env("PREFIX", "/opt/cross")
            .run_all("install", &["test \"$PREFIX\" = /opt/cross".to_string()])
            .unwrap();
    }

    #[test]
    fn test_scan_logs_keeps_last_lines() {
        let dir = tempfile::tempdir().unwrap();
        let text: String = (0..30).map(|i| format!("error: number {}\n", i)).collect();
        std::fs::write(dir.path().join("build.log"), text).unwrap();

        let lines = scan_logs(dir.path(), &[PathBuf::from("build.log"), PathBuf::from("absent.log")]);
        assert_eq!(lines.len(), MAX_LINES_PER_LOG);
        assert_eq!(lines.last().unwrap(), "build.log: error: number 29");
    }
}
