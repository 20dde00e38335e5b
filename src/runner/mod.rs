use std::time::Instant;

use crate::artifacts::ArtifactDir;
use crate::core::{ExecutionResult, ProjectInfo, ToolSpec};
use crate::gate::CommandGate;
use crate::installer::reported_version;

mod hooks;

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub project: ProjectInfo,
    pub artifacts: ArtifactDir,
    pub coverage: bool,
    pub coverage_file: String,
    pub auth: bool,
}

/// Runs one tool and records what happened. Never fails: every problem ends
/// up in the returned result.
pub fn run_tool(gate: &CommandGate, tool: &ToolSpec, settings: &RunSettings) -> ExecutionResult {
    let version = reported_version(gate, tool, gate.timeout()).unwrap_or_default();

    let mut result = ExecutionResult {
        tool: tool.name.clone(),
        version,
        success: false,
        output: String::new(),
        error: None,
        duration_ms: 0,
        output_file: tool.output_file.clone(),
        artifact_error: None,
    };

    match hooks::prepare(gate, tool, settings) {
        Ok(invocation) => {
            tracing::info!(tool = %tool.name, "running");
            let started = Instant::now();
            let outcome = gate.execute(&invocation);
            result.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            match outcome {
                Ok(output) => {
                    result.success = true;
                    result.output = output.combined();
                }
                Err(err) => {
                    result.output = err.output().unwrap_or_default().to_string();
                    result.error = Some(err.to_string());
                }
            }
        }
        Err(err) => {
            result.error = Some(format!("{err:#}"));
        }
    }

    if result.success {
        tracing::info!(tool = %tool.name, duration_ms = result.duration_ms, "passed");
    } else {
        tracing::warn!(
            tool = %tool.name,
            duration_ms = result.duration_ms,
            error = result.error.as_deref().unwrap_or(""),
            "failed"
        );
    }

    match settings
        .artifacts
        .write(&tool.output_file, result.output.as_bytes())
    {
        Ok(path) => tracing::debug!(tool = %tool.name, path = %path.display(), "output saved"),
        Err(err) => {
            tracing::warn!(tool = %tool.name, error = %err, "could not save output");
            result.artifact_error = Some(err.to_string());
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::core::{InstallMethod, ToolRole};
    use crate::gate::{ExecPaths, ProcessRunner};
    use crate::platform::{CommandOutput, CommandRequest};

    type Seen = Arc<Mutex<Vec<CommandRequest>>>;

    struct FakeTools {
        fail_args: Vec<&'static str>,
        seen: Seen,
    }

    impl ProcessRunner for FakeTools {
        fn run(&self, request: &CommandRequest) -> anyhow::Result<CommandOutput> {
            self.seen.lock().expect("lock").push(request.clone());
            if request.args.iter().any(|a| a == "--version") {
                return Ok(CommandOutput {
                    stdout: "tool 1.2.3\n".to_string(),
                    ..CommandOutput::default()
                });
            }
            let fail = request
                .args
                .iter()
                .any(|a| self.fail_args.contains(&a.as_str()));
            Ok(CommandOutput {
                exit_code: if fail { 1 } else { 0 },
                stdout: format!("ran {}", request.args.join(" ")),
                stderr: if fail { "findings".to_string() } else { String::new() },
                timed_out: false,
            })
        }
    }

    fn gate(fail_args: Vec<&'static str>) -> (CommandGate, Seen) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let runner = FakeTools {
            fail_args,
            seen: Arc::clone(&seen),
        };
        let gate = CommandGate::with_runner(
            ExecPaths::default(),
            Duration::from_secs(5),
            Box::new(runner),
        );
        (gate, seen)
    }

    fn tool(name: &str, role: ToolRole, run: &[&str]) -> ToolSpec {
        ToolSpec {
            name: name.to_string(),
            role: Some(role),
            version: "1.2.3".to_string(),
            install_method: InstallMethod::BuiltIn,
            install_source: String::new(),
            check_command: vec![run[0].to_string(), "--version".to_string()],
            run_command: run.iter().map(|s| s.to_string()).collect(),
            output_file: format!("{name}.txt"),
            auth_env: None,
            fallback: None,
        }
    }

    fn settings(dir: &std::path::Path) -> RunSettings {
        RunSettings {
            project: ProjectInfo {
                name: "demo".to_string(),
                version: "1.0.0".to_string(),
            },
            artifacts: ArtifactDir::create(dir).expect("artifacts"),
            coverage: true,
            coverage_file: "coverage.out".to_string(),
            auth: false,
        }
    }

    fn last_run_args(seen: &Seen) -> Vec<String> {
        seen.lock()
            .expect("lock")
            .iter()
            .rev()
            .find(|r| !r.args.iter().any(|a| a == "--version" || a == "--validate"))
            .expect("run request")
            .args
            .clone()
    }

    #[test]
    fn successful_run_records_output_version_and_artifact() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let settings = settings(tmp.path());
        let (gate, _) = gate(vec![]);

        let result = run_tool(
            &gate,
            &tool("golangci-lint", ToolRole::Linter, &["golangci-lint", "run", "./..."]),
            &settings,
        );
        assert!(result.success);
        assert_eq!(result.version, "tool 1.2.3");
        assert_eq!(result.output, "ran run ./...");
        assert!(result.error.is_none());
        let saved = std::fs::read_to_string(settings.artifacts.root().join("golangci-lint.txt"))
            .expect("artifact");
        assert_eq!(saved, "ran run ./...");
    }

    #[test]
    fn nonzero_exit_is_a_failed_result_with_output() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let settings = settings(tmp.path());
        let (gate, _) = gate(vec!["./..."]);

        let result = run_tool(
            &gate,
            &tool("gosec", ToolRole::SecurityScanner, &["gosec", "./..."]),
            &settings,
        );
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap_or("").contains("status 1"));
        assert!(result.output.contains("findings"));
        assert!(result.artifact_error.is_none());
    }

    #[test]
    fn disallowed_command_is_captured_not_raised() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let settings = settings(tmp.path());
        let (gate, seen) = gate(vec![]);

        let result = run_tool(&gate, &tool("evil", ToolRole::Linter, &["rm", "-rf", "/"]), &settings);
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap_or("").contains("allow-listed"));
        assert!(seen.lock().expect("lock").is_empty());
    }

    #[test]
    fn unwritable_artifact_is_separate_from_tool_outcome() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let settings = settings(tmp.path());
        let (gate, _) = gate(vec![]);
        let mut tool = tool("syft", ToolRole::Sbom, &["syft", "dir:."]);
        tool.output_file = "../escape.json".to_string();

        let result = run_tool(&gate, &tool, &settings);
        assert!(result.success);
        assert!(result.artifact_error.is_some());
        assert!(!tmp.path().parent().expect("parent").join("escape.json").exists());
    }

    #[test]
    fn sbom_gets_project_identity() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (gate, seen) = gate(vec![]);
        run_tool(&gate, &tool("syft", ToolRole::Sbom, &["syft", "dir:."]), &settings(tmp.path()));
        assert_eq!(
            last_run_args(&seen),
            ["dir:.", "--source-name", "demo", "--source-version", "1.0.0"]
        );
    }

    #[test]
    fn sast_falls_back_when_primary_rules_fail_validation() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (gate, seen) = gate(vec!["p/broken"]);
        let mut sast = tool("semgrep", ToolRole::Sast, &["semgrep", "scan", "--config", "p/broken"]);
        sast.fallback = Some("auto".to_string());

        let result = run_tool(&gate, &sast, &settings(tmp.path()));
        assert!(result.success);
        assert_eq!(last_run_args(&seen), ["scan", "--config", "auto"]);
    }

    #[test]
    fn sast_keeps_valid_primary_rules() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (gate, seen) = gate(vec![]);
        let mut sast = tool("semgrep", ToolRole::Sast, &["semgrep", "scan", "--config=p/golang"]);
        sast.fallback = Some("auto".to_string());

        run_tool(&gate, &sast, &settings(tmp.path()));
        assert_eq!(last_run_args(&seen), ["scan", "--config=p/golang"]);
    }

    #[test]
    fn test_runner_writes_coverage_into_output_dir() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let settings = settings(tmp.path());
        let (gate, seen) = gate(vec![]);
        let tests = tool(
            "go-test",
            ToolRole::TestRunner,
            &["go", "test", "-coverprofile=/tmp/elsewhere.out", "./..."],
        );

        run_tool(&gate, &tests, &settings);
        let expected = format!(
            "-coverprofile={}",
            settings.artifacts.root().join("coverage.out").display()
        );
        assert_eq!(last_run_args(&seen), ["test", expected.as_str(), "./..."]);
    }

    #[test]
    fn coverage_disabled_strips_profile_flag() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut settings = settings(tmp.path());
        settings.coverage = false;
        let (gate, seen) = gate(vec![]);
        let tests = tool(
            "go-test",
            ToolRole::TestRunner,
            &["go", "test", "-coverprofile", "c.out", "./..."],
        );

        run_tool(&gate, &tests, &settings);
        assert_eq!(last_run_args(&seen), ["test", "./..."]);
    }

    #[test]
    fn auth_token_is_removed_unless_enabled() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut settings = settings(tmp.path());
        let (gate, seen) = gate(vec![]);
        let mut sast = tool("semgrep", ToolRole::Sast, &["semgrep", "scan"]);
        sast.auth_env = Some("HOME".to_string());

        run_tool(&gate, &sast, &settings);
        {
            let seen = seen.lock().expect("lock");
            let run = seen.last().expect("run");
            assert_eq!(run.env_remove, ["HOME"]);
            assert!(run.env.is_empty());
        }

        settings.auth = true;
        run_tool(&gate, &sast, &settings);
        let seen = seen.lock().expect("lock");
        let run = seen.last().expect("run");
        assert!(run.env_remove.is_empty());
        if let Ok(home) = std::env::var("HOME") {
            assert_eq!(run.env, [("HOME".to_string(), home)]);
        }
    }
}
