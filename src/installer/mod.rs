use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};

use crate::core::{InstallMethod, ToolSpec};
use crate::gate::{CommandGate, ExecPaths, GateError, Invocation};

mod strategy;

#[derive(Debug, Clone)]
pub struct InstallSettings {
    pub install_dir: PathBuf,
    pub go_bin_dir: PathBuf,
    pub retries: u32,
    pub backoff: Duration,
    pub prefer_local: bool,
    pub check_versions: bool,
    pub pip_fallback: bool,
    pub deadline: Option<Instant>,
}

impl InstallSettings {
    pub fn command_timeout(&self, default: Duration) -> Result<Duration> {
        let Some(deadline) = self.deadline else {
            return Ok(default);
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(anyhow!("install time budget exhausted"));
        }
        Ok(std::cmp::min(default, remaining))
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.retries,
            backoff: self.backoff,
            deadline: self.deadline,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    pub tool: String,
    pub location: PathBuf,
    pub version: Option<String>,
    pub installed: bool,
}

pub struct Installer<'a> {
    gate: &'a CommandGate,
    settings: &'a InstallSettings,
}

impl<'a> Installer<'a> {
    pub fn new(gate: &'a CommandGate, settings: &'a InstallSettings) -> Self {
        Self { gate, settings }
    }

    pub fn ensure(&self, tool: &ToolSpec) -> Result<InstallOutcome> {
        let exe = tool.executable();

        if let Some(location) = self.gate.paths().locate(exe) {
            let version = self.version_at(tool, &location);
            if self.settings.prefer_local || self.verified(tool, version.as_deref()) {
                tracing::info!(
                    tool = %tool.name,
                    location = %location.display(),
                    version = version.as_deref().unwrap_or("unknown"),
                    "using existing installation"
                );
                return Ok(InstallOutcome {
                    tool: tool.name.clone(),
                    location,
                    version,
                    installed: false,
                });
            }
            tracing::info!(
                tool = %tool.name,
                location = %location.display(),
                found = version.as_deref().unwrap_or("unknown"),
                expected = %tool.version,
                "installed version is not compatible, reinstalling"
            );
        }

        if tool.install_method == InstallMethod::BuiltIn {
            return Err(anyhow!(
                "{} is a built-in tool and no compatible `{exe}` was found on the search path",
                tool.name
            ));
        }

        strategy::validate(tool, self.settings)
            .with_context(|| format!("refusing to install {}", tool.name))?;

        tracing::info!(
            tool = %tool.name,
            method = %tool.install_method,
            version = %tool.version,
            "installing"
        );
        let (location, version) =
            install_with_retry(&tool.name, &self.settings.retry_policy(), |attempt| {
                tracing::debug!(tool = %tool.name, attempt, "install attempt");
                strategy::install(self.gate, tool, self.settings)?;
                let location = self.installed_location(tool)?;
                let version = self.version_at(tool, &location);
                if !self.verified(tool, version.as_deref()) {
                    bail!(
                        "{} reports version {}, expected {}",
                        location.display(),
                        version.as_deref().unwrap_or("unknown"),
                        tool.version
                    );
                }
                Ok((location, version))
            })?;

        tracing::info!(
            tool = %tool.name,
            location = %location.display(),
            version = version.as_deref().unwrap_or("unknown"),
            "installed"
        );
        Ok(InstallOutcome {
            tool: tool.name.clone(),
            location,
            version,
            installed: true,
        })
    }

    fn verified(&self, tool: &ToolSpec, version: Option<&str>) -> bool {
        !self.settings.check_versions || version_compatible(version.unwrap_or(""), &tool.version)
    }

    /// The method's own target directory first, so a stale copy earlier on
    /// the search path is never mistaken for the fresh one.
    fn installed_location(&self, tool: &ToolSpec) -> Result<PathBuf> {
        let exe = tool.executable();
        if let Some(dir) = strategy::target_dir(tool, self.settings) {
            if let Some(found) = ExecPaths::new(vec![dir.to_path_buf()]).locate(exe) {
                return Ok(found);
            }
        }
        self.gate
            .paths()
            .locate(exe)
            .ok_or_else(|| anyhow!("`{exe}` is still not on the search path after install"))
    }

    fn version_at(&self, tool: &ToolSpec, location: &Path) -> Option<String> {
        let timeout = self.settings.command_timeout(self.gate.timeout()).ok()?;
        let paths = self
            .gate
            .paths()
            .with_pinned(tool.executable(), location.to_path_buf());
        probe_version(self.gate, &paths, tool, timeout)
    }
}

pub fn reported_version(gate: &CommandGate, tool: &ToolSpec, timeout: Duration) -> Option<String> {
    probe_version(gate, gate.paths(), tool, timeout)
}

fn probe_version(
    gate: &CommandGate,
    paths: &ExecPaths,
    tool: &ToolSpec,
    timeout: Duration,
) -> Option<String> {
    if tool.check_command.is_empty() {
        return None;
    }
    let invocation = Invocation::from_argv(&tool.check_command).timeout(timeout);
    match gate.execute_in(paths, &invocation) {
        Ok(output) => output
            .combined()
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string),
        Err(err) => {
            tracing::debug!(tool = %tool.name, error = %err, "version probe failed");
            None
        }
    }
}

/// Loose compatibility check: exact match, or the reported string contains
/// the expected version without its leading `v`. `"v1.2.30"` therefore
/// matches `1.2.3`.
pub fn version_compatible(local: &str, expected: &str) -> bool {
    let expected = expected.trim();
    if expected.is_empty() || expected.eq_ignore_ascii_case("latest") {
        return true;
    }
    let local = local.trim();
    if local == expected {
        return true;
    }
    let bare = expected.strip_prefix('v').unwrap_or(expected);
    !bare.is_empty() && local.contains(bare)
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff: Duration,
    pub deadline: Option<Instant>,
}

pub fn install_with_retry<T>(
    tool: &str,
    policy: &RetryPolicy,
    mut attempt: impl FnMut(u32) -> Result<T>,
) -> Result<T> {
    let attempts = policy.retries.saturating_add(1);
    let mut last: Option<anyhow::Error> = None;

    for n in 1..=attempts {
        if policy.deadline.is_some_and(|d| Instant::now() >= d) {
            let err = last.unwrap_or_else(|| anyhow!("install time budget exhausted"));
            return Err(err.context(format!(
                "install of {tool} stopped at the deadline after {} attempt(s)",
                n - 1
            )));
        }

        match attempt(n) {
            Ok(value) => return Ok(value),
            Err(err) if is_policy_violation(&err) => {
                return Err(err.context(format!("install of {tool} rejected by policy")));
            }
            Err(err) => {
                tracing::warn!(tool, attempt = n, of = attempts, error = %format!("{err:#}"), "install attempt failed");
                last = Some(err);
            }
        }

        if n < attempts {
            let mut delay = policy.backoff.saturating_mul(n);
            if let Some(deadline) = policy.deadline {
                delay = std::cmp::min(delay, deadline.saturating_duration_since(Instant::now()));
            }
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
        }
    }

    let err = last.unwrap_or_else(|| anyhow!("no install attempt was made"));
    Err(err.context(format!("failed to install {tool} after {attempts} attempt(s)")))
}

fn is_policy_violation(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|e| e.downcast_ref::<GateError>())
        .any(GateError::is_policy_violation)
}
