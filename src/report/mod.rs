use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::{Context, Result};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::artifacts::ArtifactDir;
use crate::core::{AttestationReport, ExecutionResult, Platform, ProjectInfo, Summary};

pub const SCHEMA_VERSION: &str = "1.0";

/// Builds the report; the summary is always derived from `results`.
pub fn aggregate(
    project: ProjectInfo,
    platform: Platform,
    generated_at: String,
    results: BTreeMap<String, ExecutionResult>,
) -> AttestationReport {
    let summary = Summary::from_results(&results);
    AttestationReport {
        schema_version: SCHEMA_VERSION.to_string(),
        tool_version: env!("CARGO_PKG_VERSION").to_string(),
        project,
        generated_at,
        platform,
        results,
        summary,
    }
}

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}

#[derive(Debug, Clone)]
pub struct WrittenReport {
    pub report: PathBuf,
    pub digest: PathBuf,
}

pub fn write_report(
    report: &AttestationReport,
    artifacts: &ArtifactDir,
    report_file: &str,
    digest_file: &str,
) -> Result<WrittenReport> {
    let mut json = serde_json::to_vec_pretty(report).context("failed to serialize report")?;
    json.push(b'\n');
    let report_path = artifacts
        .write(report_file, &json)
        .with_context(|| format!("failed to write report {report_file}"))?;

    let digest_path = artifacts
        .write(digest_file, format_digest(report).as_bytes())
        .with_context(|| format!("failed to write digest {digest_file}"))?;

    tracing::info!(
        report = %report_path.display(),
        digest = %digest_path.display(),
        "report written"
    );
    Ok(WrittenReport {
        report: report_path,
        digest: digest_path,
    })
}

pub fn format_digest(report: &AttestationReport) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "Security attestation: {} {}", report.project.name, report.project.version);
    let _ = writeln!(out, "Generated: {}", report.generated_at);
    let _ = writeln!(
        out,
        "Platform: {}/{} ({})",
        report.platform.os, report.platform.arch, report.platform.family
    );
    let _ = writeln!(out, "secattest {} (schema {})", report.tool_version, report.schema_version);
    let _ = writeln!(out);

    let name_w = report
        .results
        .keys()
        .map(|k| k.chars().count())
        .max()
        .unwrap_or(0)
        .max("TOOL".len());
    let version_w = report
        .results
        .values()
        .map(|r| short_version(&r.version).chars().count())
        .max()
        .unwrap_or(0)
        .max("VERSION".len());

    let _ = writeln!(out, "{:<name_w$}  {:<6}  {:>9}  {:<version_w$}  OUTPUT", "TOOL", "STATUS", "DURATION", "VERSION");
    let _ = writeln!(
        out,
        "{}  {}  {}  {}  {}",
        "-".repeat(name_w),
        "-".repeat(6),
        "-".repeat(9),
        "-".repeat(version_w),
        "-".repeat(6)
    );
    for (name, r) in &report.results {
        let status = if r.success { "PASS" } else { "FAIL" };
        let _ = writeln!(
            out,
            "{name:<name_w$}  {status:<6}  {:>9}  {:<version_w$}  {}",
            format_duration(r.duration_ms),
            short_version(&r.version),
            r.output_file
        );
    }

    let s = &report.summary;
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "Total: {}  Passed: {}  Failed: {}  Time: {}",
        s.total,
        s.succeeded,
        s.failed,
        format_duration(s.total_duration_ms)
    );

    let failures: Vec<&ExecutionResult> = report.results.values().filter(|r| !r.success).collect();
    if !failures.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Failures:");
        for r in failures {
            let reason = r.error.as_deref().unwrap_or("failed");
            let _ = writeln!(out, "  - {}: {reason}", r.tool);
        }
    }

    let unsaved: Vec<&ExecutionResult> = report
        .results
        .values()
        .filter(|r| r.artifact_error.is_some())
        .collect();
    if !unsaved.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Unsaved output:");
        for r in unsaved {
            let _ = writeln!(
                out,
                "  - {}: {}",
                r.tool,
                r.artifact_error.as_deref().unwrap_or_default()
            );
        }
    }

    out
}

fn short_version(version: &str) -> &str {
    let line = version.lines().next().unwrap_or("").trim();
    if line.is_empty() { "-" } else { line }
}

pub fn format_duration(ms: u64) -> String {
    if ms < 1000 {
        return format!("{ms}ms");
    }
    let secs = ms as f64 / 1000.0;
    if secs < 60.0 {
        return format!("{secs:.1}s");
    }
    let total = ms / 1000;
    format!("{}m{:02}s", total / 60, total % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(tool: &str, success: bool, duration_ms: u64) -> ExecutionResult {
        ExecutionResult {
            tool: tool.to_string(),
            version: format!("{tool} 1.0.0\nbuilt by ci"),
            success,
            output: String::new(),
            error: (!success).then(|| format!("{tool} exited with status 1")),
            duration_ms,
            output_file: format!("{tool}.txt"),
            artifact_error: None,
        }
    }

    fn sample() -> AttestationReport {
        let mut results = BTreeMap::new();
        results.insert("gosec".to_string(), result("gosec", false, 1500));
        results.insert("golangci-lint".to_string(), result("golangci-lint", true, 300));
        aggregate(
            ProjectInfo {
                name: "demo".to_string(),
                version: "v1.2.0".to_string(),
            },
            Platform {
                os: "linux".to_string(),
                arch: "x86_64".to_string(),
                family: "unix".to_string(),
            },
            "2026-01-01T00:00:00Z".to_string(),
            results,
        )
    }

    #[test]
    fn summary_is_derived_from_results() {
        let report = sample();
        assert_eq!(report.summary.total, 2);
        assert_eq!(report.summary.succeeded, 1);
        assert_eq!(report.summary.failed, 1);
        assert_eq!(
            report.summary.succeeded + report.summary.failed,
            report.results.len()
        );
        assert_eq!(report.summary.total_duration_ms, 1800);
        assert!(report.has_failures());
    }

    #[test]
    fn empty_results_have_no_failures() {
        let report = aggregate(
            ProjectInfo {
                name: "demo".to_string(),
                version: "unknown".to_string(),
            },
            Platform::current(),
            now_rfc3339(),
            BTreeMap::new(),
        );
        assert_eq!(report.summary.total, 0);
        assert!(!report.has_failures());
    }

    #[test]
    fn digest_lists_tools_and_failures() {
        let digest = format_digest(&sample());
        assert!(digest.contains("Security attestation: demo v1.2.0"));
        assert!(digest.contains("golangci-lint"));
        assert!(digest.contains("PASS"));
        assert!(digest.contains("FAIL"));
        assert!(digest.contains("gosec 1.0.0"));
        assert!(!digest.contains("built by ci"));
        assert!(digest.contains("Total: 2  Passed: 1  Failed: 1  Time: 1.8s"));
        assert!(digest.contains("  - gosec: gosec exited with status 1"));
    }

    #[test]
    fn report_files_land_in_artifact_dir() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let artifacts = ArtifactDir::create(tmp.path()).expect("artifacts");
        let written =
            write_report(&sample(), &artifacts, "attestation.json", "attestation.txt").expect("write");

        let json = std::fs::read_to_string(&written.report).expect("read report");
        let parsed: AttestationReport = serde_json::from_str(&json).expect("parse");
        assert_eq!(parsed, sample());
        assert!(written.digest.starts_with(artifacts.root()));
    }

    #[test]
    fn report_name_escaping_the_dir_is_refused() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let artifacts = ArtifactDir::create(tmp.path()).expect("artifacts");
        assert!(write_report(&sample(), &artifacts, "../attestation.json", "attestation.txt").is_err());
    }

    #[test]
    fn durations_are_human_readable() {
        assert_eq!(format_duration(42), "42ms");
        assert_eq!(format_duration(1500), "1.5s");
        assert_eq!(format_duration(125_000), "2m05s");
    }
}
