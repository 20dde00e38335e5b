use std::ffi::OsString;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;

use anyhow::Result;
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};

use crate::config::EffectiveConfig;
use crate::core::AttestationReport;
use crate::engine::{Engine, EngineOptions};
use crate::ui::UiConfig;

#[derive(Debug, Parser)]
#[command(
    name = "secattest",
    version,
    about = "Install, run and attest security analysis tools for a project",
    disable_help_flag = true
)]
pub struct Cli {
    /// Debug logging and per-tool error details.
    #[arg(short, long)]
    pub verbose: bool,
    /// Only print errors.
    #[arg(short, long)]
    pub quiet: bool,
    /// Run tools one at a time, in configuration order.
    #[arg(long)]
    pub sequential: bool,
    /// Directory for reports and tool output.
    #[arg(short = 'o', long = "output-dir", value_name = "DIR")]
    pub output_dir: Option<PathBuf>,
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
    /// Print the report as JSON on stdout.
    #[arg(long)]
    pub json: bool,
    #[arg(short = 'h', long)]
    pub help: bool,
}

#[derive(Debug)]
pub struct ParsedArgs {
    pub cli: Cli,
    pub ignored: Vec<String>,
}

pub fn run() -> Result<()> {
    let parsed = match parse_args(std::env::args_os()) {
        Ok(parsed) => parsed,
        Err(err) if err.kind() == ErrorKind::DisplayVersion => {
            let _ = err.print();
            return Ok(());
        }
        Err(err) => return Err(crate::exit::invalid_args_err(err.into())),
    };
    let cli = parsed.cli;

    let home_dir = crate::platform::effective_home_dir();

    if cli.help {
        let cfg = home_dir
            .as_ref()
            .ok()
            .and_then(|home| crate::config::load(cli.config.as_deref(), home).ok());
        return print_help(cfg.as_ref());
    }

    let home_dir = home_dir.map_err(crate::exit::invalid_args_err)?;
    let mut cfg = crate::config::load(cli.config.as_deref(), &home_dir)
        .map_err(crate::exit::invalid_args_err)?;
    apply_cli_overrides(&mut cfg, &cli);

    let verbose = cli.verbose || cfg.output.verbose;
    crate::telemetry::init_tracing(
        crate::telemetry::level_for(verbose, cli.quiet || cli.json),
        cfg.output.log_format,
    );
    for arg in &parsed.ignored {
        tracing::warn!(arg = %arg, "ignoring unrecognized argument");
    }
    for warning in &cfg.warnings {
        tracing::warn!("{warning}");
    }

    let ui_cfg = UiConfig {
        color: io::stdout().is_terminal(),
        quiet: cli.quiet,
        verbose,
    };

    let engine = Engine::new(
        cfg,
        EngineOptions {
            home_dir,
            show_progress: !cli.quiet && !cli.json,
        },
    );
    let outcome = engine.run()?;

    if cli.json {
        write_json(&outcome.report)?;
    } else {
        crate::ui::print_summary(&outcome.report, &outcome.written, &ui_cfg);
    }

    if outcome.report.has_failures() {
        return Err(crate::exit::tools_failed(
            outcome.report.summary.failed,
            outcome.report.summary.total,
        ));
    }
    Ok(())
}

/// Parses argv, dropping unknown flags and stray positionals instead of
/// failing on them.
pub fn parse_args<I, T>(argv: I) -> Result<ParsedArgs, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let (kept, ignored) = filter_args(argv.into_iter().map(Into::into).collect());
    let cli = Cli::try_parse_from(kept)?;
    Ok(ParsedArgs { cli, ignored })
}

struct KnownFlag {
    long: Option<String>,
    short: Option<char>,
    takes_value: bool,
}

fn known_flags() -> Vec<KnownFlag> {
    let mut cmd = Cli::command();
    cmd.build();
    let mut flags: Vec<KnownFlag> = cmd
        .get_arguments()
        .filter(|a| !a.is_positional())
        .map(|a| KnownFlag {
            long: a.get_long().map(ToOwned::to_owned),
            short: a.get_short(),
            takes_value: a.get_num_args().is_some_and(|n| n.takes_values()),
        })
        .collect();
    if !flags.iter().any(|f| f.long.as_deref() == Some("version")) {
        flags.push(KnownFlag {
            long: Some("version".to_string()),
            short: Some('V'),
            takes_value: false,
        });
    }
    flags
}

fn filter_args(argv: Vec<OsString>) -> (Vec<OsString>, Vec<String>) {
    let flags = known_flags();
    let mut iter = argv.into_iter();
    let mut kept: Vec<OsString> = iter.next().into_iter().collect();
    let mut ignored = Vec::new();

    while let Some(arg) = iter.next() {
        let Some(s) = arg.to_str().map(ToOwned::to_owned) else {
            ignored.push(arg.to_string_lossy().into_owned());
            continue;
        };

        if let Some(body) = s.strip_prefix("--") {
            if body.is_empty() {
                ignored.extend(iter.by_ref().map(|a| a.to_string_lossy().into_owned()));
                break;
            }
            let (name, inline) = match body.split_once('=') {
                Some((name, _)) => (name, true),
                None => (body, false),
            };
            match flags.iter().find(|f| f.long.as_deref() == Some(name)) {
                Some(flag) => {
                    kept.push(arg);
                    if flag.takes_value && !inline {
                        if let Some(value) = iter.next() {
                            kept.push(value);
                        }
                    }
                }
                None => ignored.push(s),
            }
            continue;
        }

        if let Some(cluster) = s.strip_prefix('-').filter(|c| !c.is_empty()) {
            let mut chars = cluster.chars();
            let first = chars.next().and_then(|c| flags.iter().find(|f| f.short == Some(c)));
            match first {
                Some(flag) if flag.takes_value => {
                    kept.push(arg);
                    if chars.as_str().is_empty() {
                        if let Some(value) = iter.next() {
                            kept.push(value);
                        }
                    }
                }
                Some(_)
                    if cluster.chars().all(|c| {
                        flags
                            .iter()
                            .any(|f| f.short == Some(c) && !f.takes_value)
                    }) =>
                {
                    kept.push(arg);
                }
                _ => ignored.push(s),
            }
            continue;
        }

        ignored.push(s);
    }

    (kept, ignored)
}

/// File < environment (already applied by the loader) < command line.
pub fn apply_cli_overrides(cfg: &mut EffectiveConfig, cli: &Cli) {
    if let Some(dir) = &cli.output_dir {
        cfg.output.dir = dir.clone();
    }
    if cli.sequential {
        cfg.execution.parallel = false;
    }
    if cli.verbose {
        cfg.output.verbose = true;
    }
}

fn print_help(cfg: Option<&EffectiveConfig>) -> Result<()> {
    let mut out = String::new();
    out.push_str(&Cli::command().render_help().to_string());
    out.push('\n');

    out.push_str("Configured tools:\n");
    match cfg {
        Some(cfg) => {
            for tool in &cfg.tools {
                let role = tool.role.map(|r| r.as_str()).unwrap_or("(no role)");
                out.push_str(&format!(
                    "  {:<24} {:<22} {} ({})\n",
                    tool.name, role, tool.version, tool.install_method
                ));
            }
        }
        None => out.push_str("  (no readable configuration found)\n"),
    }
    out.push('\n');

    let names = cfg.map(|c| c.env.clone()).unwrap_or_default();
    out.push_str("Environment:\n");
    for (name, what) in [
        (crate::config::CONFIG_ENV, "config file path"),
        (names.project_name.as_str(), "project name"),
        (names.project_version.as_str(), "project version"),
        (names.output_dir.as_str(), "output directory"),
        (names.verbose.as_str(), "verbose logging (true/false)"),
        (names.parallel.as_str(), "parallel execution (true/false)"),
        (names.log_format.as_str(), "log format on stderr (text/json)"),
        ("RUST_LOG", "log filter"),
    ] {
        out.push_str(&format!("  {name:<28} {what}\n"));
    }
    if let Some(cfg) = cfg {
        for tool in cfg.tools.iter().filter(|t| t.auth_env.is_some()) {
            if let Some(var) = &tool.auth_env {
                out.push_str(&format!(
                    "  {var:<28} auth token for {} (only with features.auth)\n",
                    tool.name
                ));
            }
        }
    }

    let mut stdout = io::stdout().lock();
    match stdout.write_all(out.as_bytes()) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn write_json(report: &AttestationReport) -> Result<()> {
    let buf = serde_json::to_vec_pretty(report)?;

    let mut stdout = io::stdout().lock();
    match stdout.write_all(&buf) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => return Ok(()),
        Err(err) => return Err(err.into()),
    }
    match stdout.write_all(b"\n") {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ParsedArgs {
        let mut argv = vec!["secattest"];
        argv.extend_from_slice(args);
        parse_args(argv).expect("parse")
    }

    #[test]
    fn known_flags_parse() {
        let parsed = parse(&["-v", "--sequential", "-o", "out", "--config=ci.toml", "--json"]);
        assert!(parsed.cli.verbose);
        assert!(parsed.cli.sequential);
        assert!(parsed.cli.json);
        assert_eq!(parsed.cli.output_dir, Some(PathBuf::from("out")));
        assert_eq!(parsed.cli.config, Some(PathBuf::from("ci.toml")));
        assert!(parsed.ignored.is_empty());
    }

    #[test]
    fn unknown_flags_and_positionals_are_dropped() {
        let parsed = parse(&["--frobnicate", "stray", "-x", "-q", "--output-dir", "dist", "--", "more"]);
        assert!(parsed.cli.quiet);
        assert_eq!(parsed.cli.output_dir, Some(PathBuf::from("dist")));
        assert_eq!(parsed.ignored, ["--frobnicate", "stray", "-x", "more"]);
    }

    #[test]
    fn short_clusters_of_switches_are_kept() {
        let parsed = parse(&["-vq"]);
        assert!(parsed.cli.verbose);
        assert!(parsed.cli.quiet);

        let parsed = parse(&["-vz"]);
        assert!(!parsed.cli.verbose);
        assert_eq!(parsed.ignored, ["-vz"]);
    }

    #[test]
    fn attached_short_value_is_kept() {
        let parsed = parse(&["-odist"]);
        assert_eq!(parsed.cli.output_dir, Some(PathBuf::from("dist")));
    }

    #[test]
    fn version_flag_reaches_clap() {
        let err = parse_args(["secattest", "--version"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisplayVersion);
    }

    #[test]
    fn cli_overrides_win() {
        let mut cfg = crate::config::parse(
            "[[tools]]\nname = \"t\"\nrole = \"linter\"\ncheck_command = [\"go\", \"version\"]\nrun_command = [\"go\", \"vet\"]\noutput_file = \"t.txt\"\n",
            std::path::Path::new("/home/dev"),
        )
        .expect("config");
        let parsed = parse(&["--sequential", "-o", "cli-out"]);
        apply_cli_overrides(&mut cfg, &parsed.cli);
        assert!(!cfg.parallel());
        assert_eq!(cfg.output.dir, PathBuf::from("cli-out"));
    }
}
