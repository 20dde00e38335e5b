use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success,
    InvalidArgs,
    ToolsFailed,
    InstallFailed,
    ArtifactWriteFailed,
}

impl ExitCode {
    pub const fn as_i32(self) -> i32 {
        match self {
            ExitCode::Success => 0,
            ExitCode::InvalidArgs => 2,
            ExitCode::ToolsFailed => 10,
            ExitCode::InstallFailed => 20,
            ExitCode::ArtifactWriteFailed => 30,
        }
    }
}

#[derive(Debug)]
pub struct ExitError {
    pub code: ExitCode,
    pub err: anyhow::Error,
}

impl ExitError {
    pub fn new(code: ExitCode, err: anyhow::Error) -> Self {
        Self { code, err }
    }
}

impl fmt::Display for ExitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.err.fmt(f)
    }
}

impl std::error::Error for ExitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.err.as_ref())
    }
}

pub fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(exit) = err.downcast_ref::<ExitError>() {
        return exit.code.as_i32();
    }
    ExitCode::ToolsFailed.as_i32()
}

pub fn invalid_args_err(err: anyhow::Error) -> anyhow::Error {
    ExitError::new(ExitCode::InvalidArgs, err).into()
}

pub fn tools_failed(failed: usize, total: usize) -> anyhow::Error {
    ExitError::new(
        ExitCode::ToolsFailed,
        anyhow::anyhow!("{failed} of {total} tools failed"),
    )
    .into()
}

pub fn install_failed_err(err: anyhow::Error) -> anyhow::Error {
    ExitError::new(ExitCode::InstallFailed, err).into()
}

pub fn artifact_write_err(err: anyhow::Error) -> anyhow::Error {
    ExitError::new(ExitCode::ArtifactWriteFailed, err).into()
}
