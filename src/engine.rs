use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};

use crate::artifacts::{ArtifactDir, ArtifactError};
use crate::config::EffectiveConfig;
use crate::core::{AttestationReport, ExecutionResult, Platform, ProjectInfo, ToolRole, ToolSpec};
use crate::exit;
use crate::gate::{CommandGate, ExecPaths, ProcessRunner, go_bin_dir};
use crate::installer::{InstallOutcome, InstallSettings, Installer};
use crate::platform::SystemRunner;
use crate::report::{self, WrittenReport};
use crate::runner::{self, RunSettings};
use crate::scheduler::{self, Unit, UnitError};

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub home_dir: PathBuf,
    pub show_progress: bool,
}

pub struct Engine {
    cfg: EffectiveConfig,
    opts: EngineOptions,
    gate: CommandGate,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub report: AttestationReport,
    pub written: WrittenReport,
    pub installs: Vec<InstallOutcome>,
    pub unit_errors: Vec<UnitError>,
}

impl Engine {
    pub fn new(cfg: EffectiveConfig, opts: EngineOptions) -> Self {
        let paths = ExecPaths::discover(&opts.home_dir);
        Self::with_runner(cfg, opts, Box::new(SystemRunner), paths)
    }

    pub fn with_runner(
        cfg: EffectiveConfig,
        opts: EngineOptions,
        runner: Box<dyn ProcessRunner>,
        paths: ExecPaths,
    ) -> Self {
        let timeout = Duration::from_secs(cfg.execution.command_timeout_secs.max(1));
        let paths = paths.with_dirs([
            cfg.execution.install_dir.clone(),
            go_bin_dir(&opts.home_dir),
        ]);
        let gate = CommandGate::with_runner(paths, timeout, runner);
        Self { cfg, opts, gate }
    }

    pub fn config(&self) -> &EffectiveConfig {
        &self.cfg
    }

    pub fn run(self) -> Result<RunOutcome> {
        let Engine { cfg, opts, gate } = self;

        let artifacts = ArtifactDir::create(&cfg.output.dir).map_err(|err| match err {
            ArtifactError::InvalidDir { .. } => exit::invalid_args_err(err.into()),
            _ => exit::artifact_write_err(err.into()),
        })?;
        let project = resolve_project(&gate, &cfg);
        tracing::info!(
            project = %project.name,
            version = %project.version,
            output = %artifacts.root().display(),
            parallel = cfg.parallel(),
            workers = cfg.execution.max_workers,
            "starting attestation"
        );

        let active: Vec<&ToolSpec> = cfg
            .tools
            .iter()
            .filter(|tool| {
                if tool.role == Some(ToolRole::Sbom) && !cfg.features.sbom {
                    tracing::info!(tool = %tool.name, "sbom generation disabled, skipping");
                    return false;
                }
                true
            })
            .collect();

        let progress = Progress::start(opts.show_progress, "installing tools...");
        let installs = install_phase(&gate, &cfg, &opts.home_dir, &active);
        progress.finish();
        let installs = installs?;

        let paths = pin_installs(gate.paths(), &installs);
        let gate = gate.with_paths(paths);

        let settings = RunSettings {
            project: project.clone(),
            artifacts: artifacts.clone(),
            coverage: cfg.features.coverage,
            coverage_file: cfg.output.coverage_file.clone(),
            auth: cfg.features.auth,
        };
        let runnable: Vec<&ToolSpec> = active
            .into_iter()
            .filter(|tool| {
                if tool.role.is_none() {
                    tracing::warn!(tool = %tool.name, "tool has no known role, not running it");
                    return false;
                }
                true
            })
            .collect();

        let progress = Progress::start(opts.show_progress, "running tools...");
        let (results, unit_errors) = run_phase(&gate, &cfg, &settings, &runnable);
        progress.finish();
        for err in &unit_errors {
            tracing::warn!(tool = %err.unit, error = %format!("{:#}", err.error), "run unit reported an error");
        }

        let report = report::aggregate(project, Platform::current(), report::now_rfc3339(), results);
        let written = report::write_report(
            &report,
            &artifacts,
            &cfg.output.report_file,
            &cfg.output.digest_file,
        )
        .map_err(exit::artifact_write_err)?;

        tracing::info!(
            total = report.summary.total,
            succeeded = report.summary.succeeded,
            failed = report.summary.failed,
            "attestation finished"
        );
        Ok(RunOutcome {
            report,
            written,
            installs,
            unit_errors,
        })
    }
}

fn install_phase(
    gate: &CommandGate,
    cfg: &EffectiveConfig,
    home_dir: &Path,
    tools: &[&ToolSpec],
) -> Result<Vec<InstallOutcome>> {
    let settings = InstallSettings {
        install_dir: cfg.execution.install_dir.clone(),
        go_bin_dir: go_bin_dir(home_dir),
        retries: cfg.execution.install_retries,
        backoff: Duration::from_millis(cfg.execution.retry_backoff_ms),
        prefer_local: cfg.features.prefer_local,
        check_versions: cfg.features.version_check,
        pip_fallback: cfg.features.pip_fallback,
        deadline: Some(Instant::now() + Duration::from_secs(cfg.execution.install_timeout_secs)),
    };
    let installer = Installer::new(gate, &settings);
    let outcomes = Mutex::new(Vec::with_capacity(tools.len()));

    let units: Vec<Unit<'_>> = tools
        .iter()
        .map(|tool| {
            let installer = &installer;
            let outcomes = &outcomes;
            Unit::new(tool.name.clone(), move || {
                let outcome = installer.ensure(tool)?;
                outcomes
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(outcome);
                Ok(())
            })
        })
        .collect();

    let errors = scheduler::run(units, cfg.execution.max_workers, cfg.parallel());
    if !errors.is_empty() {
        for err in &errors {
            tracing::error!(tool = %err.unit, error = %format!("{:#}", err.error), "install failed");
        }
        let names = errors
            .iter()
            .map(|e| e.unit.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let first = errors
            .into_iter()
            .next()
            .map(|e| e.error)
            .unwrap_or_else(|| anyhow!("install failed"));
        return Err(exit::install_failed_err(
            first.context(format!("could not install: {names}")),
        ));
    }

    let mut outcomes = outcomes.into_inner().unwrap_or_else(PoisonError::into_inner);
    outcomes.sort_by(|a, b| a.tool.cmp(&b.tool));
    Ok(outcomes)
}

fn pin_installs(paths: &ExecPaths, installs: &[InstallOutcome]) -> ExecPaths {
    let mut paths =
        paths.with_dirs(installs.iter().filter_map(|o| o.location.parent().map(Path::to_path_buf)));
    for outcome in installs {
        if let Some(name) = outcome.location.file_name().and_then(|n| n.to_str()) {
            paths = paths.with_pinned(name, outcome.location.clone());
        }
    }
    paths
}

fn run_phase(
    gate: &CommandGate,
    cfg: &EffectiveConfig,
    settings: &RunSettings,
    tools: &[&ToolSpec],
) -> (BTreeMap<String, ExecutionResult>, Vec<UnitError>) {
    let results = Mutex::new(BTreeMap::new());

    let units: Vec<Unit<'_>> = tools
        .iter()
        .map(|tool| {
            let results = &results;
            Unit::new(tool.name.clone(), move || {
                let result = runner::run_tool(gate, tool, settings);
                let artifact_error = result.artifact_error.clone();
                results
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(tool.name.clone(), result);
                match artifact_error {
                    Some(err) => Err(anyhow!("output not saved: {err}")),
                    None => Ok(()),
                }
            })
        })
        .collect();

    let errors = scheduler::run(units, cfg.execution.max_workers, cfg.parallel());
    let results = results.into_inner().unwrap_or_else(PoisonError::into_inner);
    (results, errors)
}

fn resolve_project(gate: &CommandGate, cfg: &EffectiveConfig) -> ProjectInfo {
    let name = cfg.project.name.clone().unwrap_or_else(|| {
        std::env::current_dir()
            .ok()
            .and_then(|dir| dir.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "unknown".to_string())
    });
    let version = cfg
        .project
        .version
        .clone()
        .or_else(|| git_describe(gate))
        .unwrap_or_else(|| "unknown".to_string());
    ProjectInfo { name, version }
}

fn git_describe(gate: &CommandGate) -> Option<String> {
    match gate.run("git", &["describe", "--tags", "--always"]) {
        Ok(out) => out
            .stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(ToOwned::to_owned),
        Err(err) => {
            tracing::debug!(error = %err, "git describe failed");
            None
        }
    }
}

struct Progress(Option<indicatif::ProgressBar>);

impl Progress {
    fn start(enabled: bool, message: &'static str) -> Self {
        use std::io::IsTerminal;
        if !enabled || !std::io::stderr().is_terminal() {
            return Self(None);
        }
        let pb = indicatif::ProgressBar::new_spinner();
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb.set_message(message);
        pb.enable_steady_tick(Duration::from_millis(120));
        Self(Some(pb))
    }

    fn finish(self) {
        if let Some(pb) = self.0 {
            pb.finish_and_clear();
        }
    }
}
