use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};

use crate::core::{InstallMethod, ToolRole, ToolSpec};
use crate::telemetry::LogFormat;

pub const DEFAULT_CONFIG_FILE: &str = "secattest.toml";
pub const CONFIG_ENV: &str = "SECATTEST_CONFIG";

#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub project: ProjectConfig,
    pub execution: ExecutionConfig,
    pub features: FeatureConfig,
    pub output: OutputConfig,
    pub env: EnvNames,
    pub tools: Vec<ToolSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
    /// Problems that did not stop loading. Logged once logging is up.
    #[serde(skip)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProjectConfig {
    pub name: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionConfig {
    pub parallel: bool,
    pub max_workers: usize,
    pub install_retries: u32,
    pub retry_backoff_ms: u64,
    pub command_timeout_secs: u64,
    pub install_timeout_secs: u64,
    pub install_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeatureConfig {
    pub parallel: bool,
    pub prefer_local: bool,
    pub pip_fallback: bool,
    pub version_check: bool,
    pub coverage: bool,
    pub sbom: bool,
    pub auth: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputConfig {
    pub dir: PathBuf,
    pub report_file: String,
    pub digest_file: String,
    pub coverage_file: String,
    pub verbose: bool,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvNames {
    pub project_name: String,
    pub project_version: String,
    pub output_dir: String,
    pub verbose: String,
    pub parallel: String,
    pub log_format: String,
}

impl Default for EnvNames {
    fn default() -> Self {
        Self {
            project_name: "SECATTEST_PROJECT_NAME".to_string(),
            project_version: "SECATTEST_PROJECT_VERSION".to_string(),
            output_dir: "SECATTEST_OUTPUT_DIR".to_string(),
            verbose: "SECATTEST_VERBOSE".to_string(),
            parallel: "SECATTEST_PARALLEL".to_string(),
            log_format: "SECATTEST_LOG_FORMAT".to_string(),
        }
    }
}

impl EffectiveConfig {
    fn defaults(home_dir: &Path) -> Self {
        Self {
            project: ProjectConfig::default(),
            execution: ExecutionConfig {
                parallel: true,
                max_workers: 4,
                install_retries: 2,
                retry_backoff_ms: 1000,
                command_timeout_secs: 600,
                install_timeout_secs: 900,
                install_dir: home_dir.join(".cache/secattest/bin"),
            },
            features: FeatureConfig {
                parallel: true,
                prefer_local: true,
                pip_fallback: true,
                version_check: true,
                coverage: true,
                sbom: true,
                auth: false,
            },
            output: OutputConfig {
                dir: PathBuf::from("attestation"),
                report_file: "attestation.json".to_string(),
                digest_file: "attestation.txt".to_string(),
                coverage_file: "coverage.out".to_string(),
                verbose: false,
                log_format: LogFormat::Text,
            },
            env: EnvNames::default(),
            tools: Vec::new(),
            config_path: None,
            warnings: Vec::new(),
        }
    }

    pub fn parallel(&self) -> bool {
        self.execution.parallel && self.features.parallel
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    project: Option<RawProjectConfig>,
    execution: Option<RawExecutionConfig>,
    features: Option<RawFeatureConfig>,
    output: Option<RawOutputConfig>,
    env: Option<RawEnvNames>,
    #[serde(default)]
    tools: Vec<RawTool>,
}

#[derive(Debug, Deserialize)]
struct RawProjectConfig {
    name: Option<String>,
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawExecutionConfig {
    parallel: Option<bool>,
    max_workers: Option<usize>,
    install_retries: Option<u32>,
    retry_backoff_ms: Option<u64>,
    command_timeout_secs: Option<u64>,
    install_timeout_secs: Option<u64>,
    install_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct RawFeatureConfig {
    parallel: Option<bool>,
    prefer_local: Option<bool>,
    pip_fallback: Option<bool>,
    version_check: Option<bool>,
    coverage: Option<bool>,
    sbom: Option<bool>,
    auth: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawOutputConfig {
    dir: Option<PathBuf>,
    report_file: Option<String>,
    digest_file: Option<String>,
    coverage_file: Option<String>,
    verbose: Option<bool>,
    log_format: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEnvNames {
    project_name: Option<String>,
    project_version: Option<String>,
    output_dir: Option<String>,
    verbose: Option<String>,
    parallel: Option<String>,
    log_format: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTool {
    name: String,
    role: Option<String>,
    #[serde(default)]
    version: String,
    install_method: Option<String>,
    #[serde(default)]
    install_source: String,
    #[serde(default)]
    check_command: Vec<String>,
    #[serde(default)]
    run_command: Vec<String>,
    #[serde(default)]
    output_file: String,
    auth_env: Option<String>,
    fallback: Option<String>,
}

pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    match std::env::var(CONFIG_ENV) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => PathBuf::from(DEFAULT_CONFIG_FILE),
    }
}

pub fn load(config_path: Option<&Path>, home_dir: &Path) -> Result<EffectiveConfig> {
    let path = resolve_config_path(config_path);
    let s = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let mut cfg = parse(&s, home_dir)
        .with_context(|| format!("invalid config file: {}", path.display()))?;
    cfg.config_path = Some(path.display().to_string());

    apply_env_overrides(&mut cfg)?;
    validate(&cfg)?;
    Ok(cfg)
}

pub fn parse(s: &str, home_dir: &Path) -> Result<EffectiveConfig> {
    let raw: RawConfig = toml::from_str(s).context("failed to parse config (TOML)")?;
    let mut cfg = EffectiveConfig::defaults(home_dir);
    apply_raw_config(&mut cfg, raw, home_dir)?;
    Ok(cfg)
}

fn apply_raw_config(cfg: &mut EffectiveConfig, raw: RawConfig, home_dir: &Path) -> Result<()> {
    if let Some(project) = raw.project {
        cfg.project.name = non_empty(project.name);
        cfg.project.version = non_empty(project.version);
    }

    if let Some(execution) = raw.execution {
        if let Some(parallel) = execution.parallel {
            cfg.execution.parallel = parallel;
        }
        if let Some(max_workers) = execution.max_workers {
            cfg.execution.max_workers = max_workers;
        }
        if let Some(install_retries) = execution.install_retries {
            cfg.execution.install_retries = install_retries;
        }
        if let Some(retry_backoff_ms) = execution.retry_backoff_ms {
            cfg.execution.retry_backoff_ms = retry_backoff_ms;
        }
        if let Some(command_timeout_secs) = execution.command_timeout_secs {
            cfg.execution.command_timeout_secs = command_timeout_secs;
        }
        if let Some(install_timeout_secs) = execution.install_timeout_secs {
            cfg.execution.install_timeout_secs = install_timeout_secs;
        }
        if let Some(install_dir) = execution.install_dir {
            cfg.execution.install_dir = expand_home(&install_dir, home_dir);
        }
    }

    if let Some(features) = raw.features {
        let f = &mut cfg.features;
        for (slot, value) in [
            (&mut f.parallel, features.parallel),
            (&mut f.prefer_local, features.prefer_local),
            (&mut f.pip_fallback, features.pip_fallback),
            (&mut f.version_check, features.version_check),
            (&mut f.coverage, features.coverage),
            (&mut f.sbom, features.sbom),
            (&mut f.auth, features.auth),
        ] {
            if let Some(value) = value {
                *slot = value;
            }
        }
    }

    if let Some(output) = raw.output {
        if let Some(dir) = output.dir {
            cfg.output.dir = dir;
        }
        if let Some(report_file) = output.report_file {
            cfg.output.report_file = report_file;
        }
        if let Some(digest_file) = output.digest_file {
            cfg.output.digest_file = digest_file;
        }
        if let Some(coverage_file) = output.coverage_file {
            cfg.output.coverage_file = coverage_file;
        }
        if let Some(verbose) = output.verbose {
            cfg.output.verbose = verbose;
        }
        if let Some(log_format) = output.log_format {
            cfg.output.log_format = log_format
                .parse::<LogFormat>()
                .map_err(anyhow::Error::msg)
                .context("output.log_format")?;
        }
    }

    if let Some(env) = raw.env {
        let names = &mut cfg.env;
        for (slot, value) in [
            (&mut names.project_name, env.project_name),
            (&mut names.project_version, env.project_version),
            (&mut names.output_dir, env.output_dir),
            (&mut names.verbose, env.verbose),
            (&mut names.parallel, env.parallel),
            (&mut names.log_format, env.log_format),
        ] {
            if let Some(value) = non_empty(value) {
                *slot = value;
            }
        }
    }

    for raw_tool in raw.tools {
        let tool = tool_from_raw(raw_tool, &mut cfg.warnings)?;
        cfg.tools.push(tool);
    }
    Ok(())
}

fn tool_from_raw(raw: RawTool, warnings: &mut Vec<String>) -> Result<ToolSpec> {
    let role = match raw.role.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(role) => match role.parse::<ToolRole>() {
            Ok(role) => Some(role),
            Err(err) => {
                warnings.push(format!("tool {}: {err}; it will not be run", raw.name.trim()));
                None
            }
        },
    };

    let install_method = match raw.install_method.as_deref().map(str::trim) {
        None | Some("") => InstallMethod::BuiltIn,
        Some(method) => method
            .parse::<InstallMethod>()
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("tool {}", raw.name))?,
    };

    Ok(ToolSpec {
        name: raw.name.trim().to_string(),
        role,
        version: raw.version.trim().to_string(),
        install_method,
        install_source: raw.install_source.trim().to_string(),
        check_command: raw.check_command,
        run_command: raw.run_command,
        output_file: raw.output_file.trim().to_string(),
        auth_env: non_empty(raw.auth_env),
        fallback: non_empty(raw.fallback),
    })
}

pub fn validate(cfg: &EffectiveConfig) -> Result<()> {
    if cfg.tools.is_empty() {
        bail!("config defines no tools");
    }
    if cfg.execution.max_workers == 0 {
        bail!("execution.max_workers must be at least 1");
    }

    let reserved = [
        ("output.report_file", cfg.output.report_file.as_str()),
        ("output.digest_file", cfg.output.digest_file.as_str()),
        ("output.coverage_file", cfg.output.coverage_file.as_str()),
    ];
    for (i, (key, file)) in reserved.iter().enumerate() {
        if file.trim().is_empty() {
            bail!("{key} is empty");
        }
        if let Some((other, _)) = reserved[..i].iter().find(|(_, f)| f == file) {
            bail!("{key} and {other} are both {file:?}");
        }
    }

    let mut seen = HashSet::new();
    let mut outputs: HashMap<&str, &str> = HashMap::new();
    for tool in &cfg.tools {
        if tool.name.is_empty() {
            bail!("tool with an empty name");
        }
        if !tool
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            bail!("tool name may only contain [A-Za-z0-9._-]: {:?}", tool.name);
        }
        if !seen.insert(tool.name.as_str()) {
            bail!("duplicate tool name: {}", tool.name);
        }
        if tool.run_command.is_empty() || tool.run_command[0].trim().is_empty() {
            bail!("tool {} has an empty run_command", tool.name);
        }
        if tool.check_command.is_empty() || tool.check_command[0].trim().is_empty() {
            bail!("tool {} has an empty check_command", tool.name);
        }
        if tool.output_file.is_empty() {
            bail!("tool {} has an empty output_file", tool.name);
        }
        if let Some((key, _)) = reserved.iter().find(|(_, f)| *f == tool.output_file) {
            bail!(
                "tool {} output_file {:?} collides with {key}",
                tool.name,
                tool.output_file
            );
        }
        if let Some(other) = outputs.insert(tool.output_file.as_str(), tool.name.as_str()) {
            bail!(
                "tools {other} and {} share output_file {:?}",
                tool.name,
                tool.output_file
            );
        }
    }
    Ok(())
}

fn apply_env_overrides(cfg: &mut EffectiveConfig) -> Result<()> {
    let names = cfg.env.clone();

    if let Some(v) = env_value(&names.project_name) {
        cfg.project.name = Some(v);
    }
    if let Some(v) = env_value(&names.project_version) {
        cfg.project.version = Some(v);
    }
    if let Some(v) = env_value(&names.output_dir) {
        cfg.output.dir = PathBuf::from(v);
    }
    if let Some(v) = env_value(&names.verbose) {
        cfg.output.verbose = parse_bool(&v).with_context(|| names.verbose.clone())?;
    }
    if let Some(v) = env_value(&names.parallel) {
        let parallel = parse_bool(&v).with_context(|| names.parallel.clone())?;
        cfg.execution.parallel = parallel;
        cfg.features.parallel = parallel;
    }
    if let Some(v) = env_value(&names.log_format) {
        cfg.output.log_format = v
            .parse::<LogFormat>()
            .map_err(anyhow::Error::msg)
            .with_context(|| names.log_format.clone())?;
    }

    Ok(())
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn expand_home(path: &Path, home_dir: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home_dir.join(rest),
        Err(_) => path.to_path_buf(),
    }
}

pub fn parse_bool(s: &str) -> Result<bool> {
    let s = s.trim().to_ascii_lowercase();
    match s.as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow!(
            "invalid boolean: {s} (expected true|false|1|0|yes|no|on|off)"
        )),
    }
}
