use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::platform::{CommandOutput, CommandRequest, SystemRunner};

mod params;
mod paths;

pub use params::{validate_install_dir, validate_source, validate_version};
pub use paths::{ExecPaths, go_bin_dir, well_known_dirs};

pub const FORBIDDEN_SEQUENCES: &[&str] = &["$(", "`", "${", "||", "&&", ";", "|"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Program {
    Go,
    Python3,
    GolangciLint,
    Gosec,
    Govulncheck,
    Semgrep,
    Syft,
    Git,
    Curl,
    Sh,
    Bash,
    Pip,
    Pip3,
    Pipx,
    Make,
}

impl Program {
    pub const ALL: [Program; 15] = [
        Program::Go,
        Program::Python3,
        Program::GolangciLint,
        Program::Gosec,
        Program::Govulncheck,
        Program::Semgrep,
        Program::Syft,
        Program::Git,
        Program::Curl,
        Program::Sh,
        Program::Bash,
        Program::Pip,
        Program::Pip3,
        Program::Pipx,
        Program::Make,
    ];

    pub const fn executable(self) -> &'static str {
        match self {
            Program::Go => "go",
            Program::Python3 => "python3",
            Program::GolangciLint => "golangci-lint",
            Program::Gosec => "gosec",
            Program::Govulncheck => "govulncheck",
            Program::Semgrep => "semgrep",
            Program::Syft => "syft",
            Program::Git => "git",
            Program::Curl => "curl",
            Program::Sh => "sh",
            Program::Bash => "bash",
            Program::Pip => "pip",
            Program::Pip3 => "pip3",
            Program::Pipx => "pipx",
            Program::Make => "make",
        }
    }

    /// Looks up a program by the base name of `name`. Directories are
    /// ignored, so `/tmp/evil/go` resolves to [`Program::Go`] and is then
    /// launched from our own resolved location, never from `/tmp/evil`.
    pub fn from_name(name: &str) -> Option<Program> {
        let base = Path::new(name.trim()).file_name()?.to_str()?;
        Program::ALL.into_iter().find(|p| p.executable() == base)
    }
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("command is not allow-listed: {0}")]
    DisallowedCommand(String),

    #[error("argument rejected for {program}: {reason}")]
    DisallowedArgument { program: String, reason: String },

    #[error("invalid install parameter: {0}")]
    InvalidParameter(String),

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{program} timed out after {timeout:?}")]
    TimedOut {
        program: String,
        timeout: Duration,
        output: String,
    },

    #[error("{program} exited with status {code}")]
    NonZeroExit {
        program: String,
        code: i32,
        output: String,
    },
}

impl GateError {
    /// Policy violations are final and must never be retried.
    pub fn is_policy_violation(&self) -> bool {
        matches!(
            self,
            GateError::DisallowedCommand(_)
                | GateError::DisallowedArgument { .. }
                | GateError::InvalidParameter(_)
        )
    }

    pub fn output(&self) -> Option<&str> {
        match self {
            GateError::TimedOut { output, .. } | GateError::NonZeroExit { output, .. } => {
                Some(output)
            }
            _ => None,
        }
    }
}

pub trait ProcessRunner: Send + Sync {
    fn run(&self, request: &CommandRequest) -> anyhow::Result<CommandOutput>;
}

#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub name: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub env_remove: Vec<String>,
    pub timeout: Option<Duration>,
}

impl Invocation {
    pub fn new<I, S>(name: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn from_argv(argv: &[String]) -> Self {
        let (name, args) = argv.split_first().map_or(("", &[][..]), |(n, a)| (n.as_str(), a));
        Self::new(name, args.iter().cloned())
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn env_remove(mut self, key: impl Into<String>) -> Self {
        self.env_remove.push(key.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

pub struct CommandGate {
    paths: ExecPaths,
    runner: Box<dyn ProcessRunner>,
    timeout: Duration,
}

impl CommandGate {
    pub fn new(paths: ExecPaths, timeout: Duration) -> Self {
        Self::with_runner(paths, timeout, Box::new(SystemRunner))
    }

    pub fn with_runner(paths: ExecPaths, timeout: Duration, runner: Box<dyn ProcessRunner>) -> Self {
        Self {
            paths,
            runner,
            timeout,
        }
    }

    pub fn paths(&self) -> &ExecPaths {
        &self.paths
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn with_paths(self, paths: ExecPaths) -> Self {
        Self { paths, ..self }
    }

    pub fn execute(&self, invocation: &Invocation) -> Result<CommandOutput, GateError> {
        self.execute_in(&self.paths, invocation)
    }

    pub fn execute_in(
        &self,
        paths: &ExecPaths,
        invocation: &Invocation,
    ) -> Result<CommandOutput, GateError> {
        let request = self.authorize_in(paths, invocation)?;
        let program = invocation.name.clone();

        tracing::debug!(
            program = %program,
            executable = %request.executable.display(),
            args = ?request.args,
            "executing"
        );

        let output = self
            .runner
            .run(&request)
            .map_err(|source| GateError::Spawn {
                program: program.clone(),
                source,
            })?;

        if output.timed_out {
            return Err(GateError::TimedOut {
                program,
                timeout: request.timeout,
                output: output.combined(),
            });
        }
        if output.exit_code != 0 {
            return Err(GateError::NonZeroExit {
                program,
                code: output.exit_code,
                output: output.combined(),
            });
        }
        Ok(output)
    }

    pub fn run(&self, name: &str, args: &[&str]) -> Result<CommandOutput, GateError> {
        self.execute(&Invocation::new(name, args.iter().copied()))
    }

    pub fn authorize(&self, invocation: &Invocation) -> Result<CommandRequest, GateError> {
        self.authorize_in(&self.paths, invocation)
    }

    fn authorize_in(
        &self,
        paths: &ExecPaths,
        invocation: &Invocation,
    ) -> Result<CommandRequest, GateError> {
        let program = Program::from_name(&invocation.name)
            .ok_or_else(|| GateError::DisallowedCommand(invocation.name.clone()))?;

        for arg in &invocation.args {
            validate_arg(arg).map_err(|reason| GateError::DisallowedArgument {
                program: program.executable().to_string(),
                reason,
            })?;
        }
        for key in invocation
            .env
            .iter()
            .map(|(k, _)| k)
            .chain(invocation.env_remove.iter())
        {
            if !is_env_name(key) {
                return Err(GateError::DisallowedArgument {
                    program: program.executable().to_string(),
                    reason: format!("invalid environment variable name: {key:?}"),
                });
            }
        }

        let executable = paths
            .locate(program.executable())
            .unwrap_or_else(|| PathBuf::from(program.executable()));

        Ok(CommandRequest {
            executable,
            args: invocation.args.clone(),
            env: invocation.env.clone(),
            env_remove: invocation.env_remove.clone(),
            path_env: paths.to_path_env(),
            timeout: invocation.timeout.unwrap_or(self.timeout),
        })
    }
}

pub fn validate_arg(arg: &str) -> Result<(), String> {
    if arg.contains('\0') {
        return Err("argument contains a NUL byte".to_string());
    }
    if let Some(seq) = FORBIDDEN_SEQUENCES.iter().find(|seq| arg.contains(**seq)) {
        return Err(format!("argument contains forbidden sequence {seq:?}: {arg:?}"));
    }
    Ok(())
}

fn is_env_name(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
