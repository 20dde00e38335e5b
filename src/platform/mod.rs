use std::ffi::OsString;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use wait_timeout::ChildExt;

use crate::gate::ProcessRunner;

/// A fully resolved process launch. Only the command gate builds these.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub env_remove: Vec<String>,
    pub path_env: Option<OsString>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }

    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => {
                let mut out = self.stdout.clone();
                if !out.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str(&self.stderr);
                out
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
    fn run(&self, request: &CommandRequest) -> Result<CommandOutput> {
        run_command(request)
    }
}

pub fn run_command(request: &CommandRequest) -> Result<CommandOutput> {
    let display = request.executable.display().to_string();

    let mut command = Command::new(&request.executable);
    command
        .args(&request.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if let Some(path) = &request.path_env {
        command.env("PATH", path);
    }
    for key in &request.env_remove {
        command.env_remove(key);
    }
    for (k, v) in &request.env {
        command.env(k, v);
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to start process: {display}"))?;

    // Drain both pipes while waiting so a chatty child cannot block on a full pipe.
    let stdout_reader = child.stdout.take().map(|mut out| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = out.read_to_end(&mut buf);
            buf
        })
    });
    let stderr_reader = child.stderr.take().map(|mut err| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = err.read_to_end(&mut buf);
            buf
        })
    });

    let waited = child
        .wait_timeout(request.timeout)
        .with_context(|| format!("failed to wait for process: {display}"))?;
    let (exit_code, timed_out) = match waited {
        Some(status) => (status.code().unwrap_or(-1), false),
        None => {
            let _ = child.kill();
            let _ = child.wait();
            (-1, true)
        }
    };

    let stdout = join_reader(stdout_reader)?;
    let stderr = join_reader(stderr_reader)?;

    Ok(CommandOutput {
        exit_code,
        stdout,
        stderr,
        timed_out,
    })
}

fn join_reader(reader: Option<thread::JoinHandle<Vec<u8>>>) -> Result<String> {
    let Some(reader) = reader else {
        return Ok(String::new());
    };
    let buf = reader
        .join()
        .map_err(|_| anyhow!("output reader thread panicked"))?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

pub fn effective_home_dir() -> Result<PathBuf> {
    std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("HOME is not set"))
}
