use crate::constants::timeouts::COMMAND_DEFAULT_MS;
use crate::errors::PersonaError;
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize)]
pub struct CommandRequest {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub env_remove: Vec<String>,
    pub cwd: Option<PathBuf>,
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

impl CommandRequest {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn env_remove(mut self, key: impl Into<String>) -> Self {
        self.env_remove.push(key.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// Converts a non-zero exit into an execution error naming the command.
    pub fn into_result(self, request: &CommandRequest) -> Result<CommandOutput, PersonaError> {
        if self.success() {
            return Ok(self);
        }
        Err(PersonaError::execution(format!(
            "'{}' exited with {}: {}",
            request.display(),
            self.exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string()),
            self.stderr.trim()
        ))
        .with_details(serde_json::json!({
            "program": request.program,
            "exit_code": self.exit_code,
        })))
    }
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, request: CommandRequest) -> Result<CommandOutput, PersonaError>;
}

#[derive(Debug, Clone, Default)]
pub struct SystemCommandExecutor;

impl SystemCommandExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, request: CommandRequest) -> Result<CommandOutput, PersonaError> {
        let mut cmd = tokio::process::Command::new(&request.program);
        cmd.args(&request.args);
        for key in &request.env_remove {
            cmd.env_remove(key);
        }
        for (key, value) in &request.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = request.cwd.as_ref() {
            cmd.current_dir(cwd);
        }
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let child = cmd.spawn().map_err(|err| {
            PersonaError::execution(format!("Failed to spawn '{}': {}", request.program, err))
                .with_hint(format!("Ensure '{}' is installed and on PATH.", request.program))
        })?;
        let limit = request
            .timeout
            .unwrap_or_else(|| Duration::from_millis(COMMAND_DEFAULT_MS));
        let output = match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(result) => result.map_err(|err| {
                PersonaError::execution(format!("Failed to run '{}': {}", request.display(), err))
            })?,
            Err(_) => {
                return Err(PersonaError::timeout(format!(
                    "'{}' timed out after {}ms",
                    request.display(),
                    limit.as_millis()
                )))
            }
        };
        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}
