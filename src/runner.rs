//! Host command execution seam.
//!
//! Every subprocess this tool runs (`docker compose`, `apt-get`,
//! `systemctl`, `iptables`, `certbot`, `tailscale`) goes through the
//! [`CommandRunner`] trait so deployment logic can be exercised against
//! scripted doubles. [`HostRunner`] is the production implementation over
//! `tokio::process::Command`.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// A command to run on the host.
#[derive(Debug, Clone)]
pub struct HostCommand {
    /// Program name or path.
    pub program: String,
    /// Arguments, unescaped.
    pub args: Vec<String>,
    /// Working directory, or inherit.
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Optional wall-clock limit.
    pub timeout: Option<Duration>,
}

impl HostCommand {
    /// Build a command from a program and its arguments.
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            working_dir: None,
            env: Vec::new(),
            timeout: None,
        }
    }

    /// Set the working directory.
    pub fn with_working_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    /// Set a wall-clock timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The command as a single loggable line.
    pub fn display_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Captured output of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    /// A successful empty output.
    pub fn ok() -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    /// A failing output carrying diagnostic text.
    pub fn failed(exit_code: i32, stderr: &str) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout and stderr joined, for pattern matching over diagnostics.
    pub fn combined(&self) -> String {
        let mut text = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&self.stderr);
        }
        text
    }
}

/// Command execution errors.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command timed out after {0:?}")]
    Timeout(Duration),
}

/// Runs [`HostCommand`]s and reports their output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, cmd: HostCommand) -> Result<CommandOutput, RunnerError>;
}

/// Production runner over `tokio::process::Command`.
#[derive(Debug, Clone, Default)]
pub struct HostRunner;

impl HostRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for HostRunner {
    async fn run(&self, cmd: HostCommand) -> Result<CommandOutput, RunnerError> {
        debug!("running: {}", cmd.display_line());

        let mut command = Command::new(&cmd.program);
        command.args(&cmd.args);
        if let Some(ref dir) = cmd.working_dir {
            command.current_dir(dir);
        }
        for (key, value) in &cmd.env {
            command.env(key, value);
        }

        let spawn_err = |source| RunnerError::Spawn {
            program: cmd.program.clone(),
            source,
        };

        let output = if let Some(timeout) = cmd.timeout {
            match tokio::time::timeout(timeout, command.output()).await {
                Ok(result) => result.map_err(spawn_err)?,
                Err(_) => return Err(RunnerError::Timeout(timeout)),
            }
        } else {
            command.output().await.map_err(spawn_err)?
        };

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

/// Scripted doubles for exercising deployment flows without a host.
///
/// Used by this crate's own unit and integration tests; not part of the
/// stable API surface.
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    struct Rule {
        pattern: String,
        remaining: Option<usize>,
        output: CommandOutput,
    }

    /// A [`CommandRunner`] that records every command line and answers
    /// according to substring-matched rules (first match wins), succeeding
    /// with empty output otherwise.
    #[derive(Default)]
    pub struct ScriptedRunner {
        calls: Mutex<Vec<String>>,
        rules: Mutex<Vec<Rule>>,
    }

    impl ScriptedRunner {
        /// A runner that succeeds on everything.
        pub fn new() -> Self {
            Self::default()
        }

        /// Answer `output` every time a command line contains `pattern`.
        pub fn respond(self, pattern: &str, output: CommandOutput) -> Self {
            self.rules.lock().unwrap().push(Rule {
                pattern: pattern.to_string(),
                remaining: None,
                output,
            });
            self
        }

        /// Answer `output` for the first `times` matching commands only.
        pub fn respond_times(self, pattern: &str, times: usize, output: CommandOutput) -> Self {
            self.rules.lock().unwrap().push(Rule {
                pattern: pattern.to_string(),
                remaining: Some(times),
                output,
            });
            self
        }

        /// Every command line seen so far.
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        /// Command lines containing `pattern`.
        pub fn calls_matching(&self, pattern: &str) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter(|line| line.contains(pattern))
                .collect()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, cmd: HostCommand) -> Result<CommandOutput, RunnerError> {
            let line = cmd.display_line();
            self.calls.lock().unwrap().push(line.clone());

            let mut rules = self.rules.lock().unwrap();
            for rule in rules.iter_mut() {
                if !line.contains(&rule.pattern) {
                    continue;
                }
                match &mut rule.remaining {
                    Some(0) => continue,
                    Some(n) => *n -= 1,
                    None => {}
                }
                return Ok(rule.output.clone());
            }
            Ok(CommandOutput::ok())
        }
    }
}
