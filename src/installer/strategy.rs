use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};

use crate::core::{InstallMethod, ToolSpec};
use crate::gate::{
    CommandGate, GateError, Invocation, validate_install_dir, validate_source, validate_version,
};
use crate::installer::InstallSettings;

const PIP_INSTALLERS: &[(&str, &[&str])] = &[
    ("pip3", &["install", "--user"]),
    ("pip", &["install", "--user"]),
    ("python3", &["-m", "pip", "install", "--user"]),
];

pub(super) fn validate(tool: &ToolSpec, settings: &InstallSettings) -> Result<(), GateError> {
    validate_version(&tool.version)?;
    validate_source(tool.install_method, &tool.install_source)?;
    match tool.install_method {
        InstallMethod::Script => validate_install_dir(&settings.install_dir),
        InstallMethod::Package => validate_install_dir(&settings.go_bin_dir),
        InstallMethod::InterpreterPackage | InstallMethod::BuiltIn => Ok(()),
    }
}

pub(super) fn target_dir<'a>(tool: &ToolSpec, settings: &'a InstallSettings) -> Option<&'a Path> {
    match tool.install_method {
        InstallMethod::Script => Some(&settings.install_dir),
        InstallMethod::Package => Some(&settings.go_bin_dir),
        InstallMethod::InterpreterPackage | InstallMethod::BuiltIn => None,
    }
}

pub(super) fn install(gate: &CommandGate, tool: &ToolSpec, settings: &InstallSettings) -> Result<()> {
    match tool.install_method {
        InstallMethod::Script => install_script(gate, tool, settings),
        InstallMethod::Package => go_install(gate, tool, settings),
        InstallMethod::InterpreterPackage => pip_install(gate, tool, settings),
        InstallMethod::BuiltIn => bail!("{} is built in and cannot be installed", tool.name),
    }
}

fn install_script(gate: &CommandGate, tool: &ToolSpec, settings: &InstallSettings) -> Result<()> {
    let dir = &settings.install_dir;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create install directory: {}", dir.display()))?;

    let script = dir.join(format!("{}-install.sh", tool.name));
    let script_arg = path_arg(&script)?;
    let dir_arg = path_arg(dir)?;

    let fetch = Invocation::new(
        "curl",
        [
            "-sSfL",
            "--proto",
            "=https",
            "--tlsv1.2",
            tool.install_source.as_str(),
            "-o",
            script_arg,
        ],
    )
    .timeout(settings.command_timeout(gate.timeout())?);
    gate.execute(&fetch)
        .with_context(|| format!("failed to download installer for {}", tool.name))?;

    let run = Invocation::new("sh", [script_arg, "-b", dir_arg, tool.version.as_str()])
        .timeout(settings.command_timeout(gate.timeout())?);
    let result = gate
        .execute(&run)
        .with_context(|| format!("installer script for {} failed", tool.name));
    let _ = std::fs::remove_file(&script);
    result.map(|_| ())
}

fn go_install(gate: &CommandGate, tool: &ToolSpec, settings: &InstallSettings) -> Result<()> {
    let target = format!("{}@{}", tool.install_source, tool.version);
    let gobin = path_arg(&settings.go_bin_dir)?;
    let invocation = Invocation::new("go", ["install", target.as_str()])
        .env("GOBIN", gobin)
        .timeout(settings.command_timeout(gate.timeout())?);
    gate.execute(&invocation)
        .with_context(|| format!("go install {target} failed"))?;
    Ok(())
}

fn pip_install(gate: &CommandGate, tool: &ToolSpec, settings: &InstallSettings) -> Result<()> {
    let requirement = pip_requirement(&tool.install_source, &tool.version);

    let mut candidates: Vec<(&str, Vec<&str>)> =
        vec![("pipx", vec!["install", "--force", requirement.as_str()])];
    if settings.pip_fallback {
        for (program, prefix) in PIP_INSTALLERS {
            let mut args = prefix.to_vec();
            args.push(requirement.as_str());
            candidates.push((*program, args));
        }
    }

    let mut last: Option<anyhow::Error> = None;
    for (program, args) in candidates {
        if gate.paths().locate(program).is_none() {
            tracing::debug!(tool = %tool.name, installer = program, "installer not found, skipping");
            last = Some(anyhow!("`{program}` is not installed"));
            continue;
        }
        let invocation =
            Invocation::new(program, args).timeout(settings.command_timeout(gate.timeout())?);
        match gate.execute(&invocation) {
            Ok(_) => {
                tracing::debug!(tool = %tool.name, installer = program, "package installed");
                return Ok(());
            }
            Err(err) if err.is_policy_violation() => return Err(err.into()),
            Err(err) => {
                tracing::debug!(tool = %tool.name, installer = program, error = %err, "installer failed");
                last = Some(err.into());
            }
        }
    }

    let err = last.unwrap_or_else(|| anyhow!("no package installer available"));
    Err(err.context(format!("no package installer could install {requirement}")))
}

fn pip_requirement(package: &str, version: &str) -> String {
    if version.eq_ignore_ascii_case("latest") {
        return package.to_string();
    }
    let bare = version.strip_prefix('v').unwrap_or(version);
    format!("{package}=={bare}")
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("path is not valid UTF-8: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::core::ToolRole;
    use crate::gate::{ExecPaths, ProcessRunner};
    use crate::platform::{CommandOutput, CommandRequest};

    struct Scripted {
        fail: Vec<&'static str>,
        seen: Arc<Mutex<Vec<Vec<String>>>>,
    }

    impl ProcessRunner for Scripted {
        fn run(&self, request: &CommandRequest) -> anyhow::Result<CommandOutput> {
            let exe = request
                .executable
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            let mut argv = vec![exe.clone()];
            argv.extend(request.args.iter().cloned());
            self.seen.lock().expect("lock").push(argv);
            let exit_code = if self.fail.iter().any(|f| *f == exe) { 1 } else { 0 };
            Ok(CommandOutput {
                exit_code,
                ..CommandOutput::default()
            })
        }
    }

    fn settings(dir: &Path) -> InstallSettings {
        InstallSettings {
            install_dir: dir.join("bin"),
            go_bin_dir: dir.join("gobin"),
            retries: 0,
            backoff: Duration::ZERO,
            prefer_local: false,
            check_versions: true,
            pip_fallback: true,
            deadline: None,
        }
    }

    fn tool(method: InstallMethod, source: &str, version: &str) -> ToolSpec {
        ToolSpec {
            name: "semgrep".to_string(),
            role: Some(ToolRole::Sast),
            version: version.to_string(),
            install_method: method,
            install_source: source.to_string(),
            check_command: vec!["semgrep".to_string(), "--version".to_string()],
            run_command: vec!["semgrep".to_string(), "scan".to_string()],
            output_file: "semgrep.txt".to_string(),
            auth_env: None,
            fallback: None,
        }
    }

    #[cfg(unix)]
    fn installers_dir(names: &[&str]) -> tempfile::TempDir {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        for name in names {
            let path = dir.path().join(name);
            std::fs::write(&path, b"").expect("write");
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .expect("chmod");
        }
        dir
    }

    fn gate_with(dirs: Vec<PathBuf>, fail: Vec<&'static str>) -> (CommandGate, Arc<Mutex<Vec<Vec<String>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let runner = Scripted {
            fail,
            seen: Arc::clone(&seen),
        };
        let gate = CommandGate::with_runner(ExecPaths::new(dirs), Duration::from_secs(5), Box::new(runner));
        (gate, seen)
    }

    #[cfg(unix)]
    #[test]
    fn pip_falls_back_from_pipx_to_user_installers() {
        let bins = installers_dir(&["pipx", "pip3", "pip"]);
        let tmp = tempfile::tempdir().expect("tempdir");
        let (gate, seen) = gate_with(vec![bins.path().to_path_buf()], vec!["pipx", "pip3"]);

        let tool = tool(InstallMethod::InterpreterPackage, "semgrep", "v1.50.0");
        pip_install(&gate, &tool, &settings(tmp.path())).expect("install");

        let seen = seen.lock().expect("lock");
        let programs: Vec<_> = seen.iter().map(|a| a[0].as_str()).collect();
        assert_eq!(programs, ["pipx", "pip3", "pip"]);
        assert_eq!(seen[2][1..], ["install", "--user", "semgrep==1.50.0"]);
    }

    #[cfg(unix)]
    #[test]
    fn pip_fallback_disabled_stops_after_pipx() {
        let bins = installers_dir(&["pipx", "pip3"]);
        let tmp = tempfile::tempdir().expect("tempdir");
        let (gate, seen) = gate_with(vec![bins.path().to_path_buf()], vec!["pipx"]);
        let mut settings = settings(tmp.path());
        settings.pip_fallback = false;

        let tool = tool(InstallMethod::InterpreterPackage, "semgrep", "latest");
        let err = pip_install(&gate, &tool, &settings).unwrap_err();
        assert!(format!("{err:#}").contains("semgrep"));
        assert_eq!(seen.lock().expect("lock").len(), 1);
    }

    #[test]
    fn script_install_downloads_then_runs_into_install_dir() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (gate, seen) = gate_with(vec![], vec![]);
        let settings = settings(tmp.path());
        let mut tool = tool(
            InstallMethod::Script,
            "https://raw.githubusercontent.com/anchore/syft/main/install.sh",
            "v0.100.0",
        );
        tool.name = "syft".to_string();

        validate(&tool, &settings).expect("valid");
        install(&gate, &tool, &settings).expect("install");

        let seen = seen.lock().expect("lock");
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0][0], "curl");
        assert!(seen[0].contains(&tool.install_source));
        let dir = settings.install_dir.to_str().expect("utf8");
        assert_eq!(seen[1][0], "sh");
        assert_eq!(seen[1][2..], ["-b", dir, "v0.100.0"]);
        assert!(settings.install_dir.is_dir());
    }

    #[test]
    fn relative_install_dir_is_rejected() {
        let mut settings = settings(Path::new("/tmp"));
        settings.install_dir = PathBuf::from("bin");
        let tool = tool(InstallMethod::Script, "https://example.com/install.sh", "v1");
        assert!(validate(&tool, &settings).is_err());
    }

    #[test]
    fn pip_requirement_strips_version_marker() {
        assert_eq!(pip_requirement("semgrep", "v1.2.3"), "semgrep==1.2.3");
        assert_eq!(pip_requirement("semgrep", "latest"), "semgrep");
    }
}
