use anyhow::{Result, bail};

use crate::core::{ProjectInfo, ToolRole, ToolSpec};
use crate::gate::{CommandGate, Invocation};
use crate::runner::RunSettings;

pub(super) fn prepare(gate: &CommandGate, tool: &ToolSpec, settings: &RunSettings) -> Result<Invocation> {
    let Some((program, rest)) = tool.run_command.split_first() else {
        bail!("{} has an empty run command", tool.name);
    };
    let mut args = rest.to_vec();

    match tool.role {
        Some(ToolRole::Sbom) => add_source_identity(&mut args, &settings.project),
        Some(ToolRole::Sast) => choose_rule_set(gate, tool, program, &mut args),
        Some(ToolRole::TestRunner) => redirect_coverage(&mut args, settings)?,
        _ => {}
    }

    let mut invocation = Invocation::new(program.as_str(), args);
    if let Some(var) = &tool.auth_env {
        if settings.auth {
            match std::env::var(var) {
                Ok(token) if !token.is_empty() => invocation = invocation.env(var.as_str(), token),
                _ => tracing::warn!(tool = %tool.name, var = %var, "auth enabled but token is not set"),
            }
        } else {
            invocation = invocation.env_remove(var.as_str());
        }
    }
    Ok(invocation)
}

fn add_source_identity(args: &mut Vec<String>, project: &ProjectInfo) {
    args.extend([
        "--source-name".to_string(),
        project.name.clone(),
        "--source-version".to_string(),
        project.version.clone(),
    ]);
}

fn choose_rule_set(gate: &CommandGate, tool: &ToolSpec, program: &str, args: &mut Vec<String>) {
    let Some(fallback) = tool.fallback.as_deref() else {
        return;
    };

    let Some((index, primary)) = config_arg(args) else {
        args.extend(["--config".to_string(), fallback.to_string()]);
        return;
    };

    let probe = Invocation::new(program, ["--validate", "--config", primary.as_str()]);
    if let Err(err) = gate.execute(&probe) {
        tracing::warn!(
            tool = %tool.name,
            primary = %primary,
            fallback,
            error = %err,
            "primary rule set failed validation, using fallback"
        );
        if args[index].starts_with("--config=") {
            args[index] = format!("--config={fallback}");
        } else {
            args[index] = fallback.to_string();
        }
    }
}

/// Position of the `--config` value (the flag's own slot for `--config=x`).
fn config_arg(args: &[String]) -> Option<(usize, String)> {
    for (i, arg) in args.iter().enumerate() {
        if let Some(value) = arg.strip_prefix("--config=") {
            return Some((i, value.to_string()));
        }
        if arg == "--config" {
            return args.get(i + 1).map(|v| (i + 1, v.clone()));
        }
    }
    None
}

fn redirect_coverage(args: &mut Vec<String>, settings: &RunSettings) -> Result<()> {
    let mut kept = Vec::with_capacity(args.len() + 1);
    let mut iter = std::mem::take(args).into_iter();
    while let Some(arg) = iter.next() {
        let flag = arg.trim_start_matches('-');
        if flag == "coverprofile" {
            iter.next();
            continue;
        }
        if flag.starts_with("coverprofile=") {
            continue;
        }
        kept.push(arg);
    }
    *args = kept;

    if !settings.coverage {
        return Ok(());
    }

    let profile = settings.artifacts.resolve(&settings.coverage_file)?;
    let flag = format!("-coverprofile={}", profile.display());
    let at = if args.first().map(String::as_str) == Some("test") {
        1
    } else {
        args.len()
    };
    args.insert(at, flag);
    Ok(())
}
