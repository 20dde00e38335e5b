use anyhow::Error;
use std::io::{self, Write};

use crate::core::AttestationReport;
use crate::exit::ExitError;
use crate::report::{WrittenReport, format_duration};

#[derive(Debug, Clone)]
pub struct UiConfig {
    pub color: bool,
    pub quiet: bool,
    pub verbose: bool,
}

pub fn eprintln_error(err: &Error) {
    let err = match err.downcast_ref::<ExitError>() {
        Some(exit) => &exit.err,
        None => err,
    };

    let mut stderr = io::stderr().lock();
    let _ = writeln!(stderr, "error: {err}");

    let mut causes = err.chain().skip(1).peekable();
    if causes.peek().is_some() {
        let _ = writeln!(stderr, "caused by:");
        for cause in causes {
            let _ = writeln!(stderr, "  - {cause}");
        }
    }

    let _ = writeln!(stderr, "hint: re-run with `--verbose` for details, or see `secattest --help`");
}

pub fn print_summary(report: &AttestationReport, written: &WrittenReport, cfg: &UiConfig) {
    if cfg.quiet {
        return;
    }
    let mut out = io::stdout().lock();

    let _ = writeln!(
        out,
        "{} {} ({}/{})",
        report.project.name, report.project.version, report.platform.os, report.platform.arch
    );
    let _ = writeln!(out);

    let name_w = report
        .results
        .keys()
        .map(|k| k.chars().count())
        .max()
        .unwrap_or(0)
        .max("TOOL".len());
    let _ = writeln!(out, "{:<name_w$}  {:<6}  {:>9}", "TOOL", "STATUS", "TIME");
    let _ = writeln!(out, "{}  {}  {}", "-".repeat(name_w), "-".repeat(6), "-".repeat(9));
    for (name, r) in &report.results {
        let status = pad_end_ansi(&format_status(r.success, cfg.color), 6);
        let _ = writeln!(
            out,
            "{name:<name_w$}  {status}  {:>9}",
            format_duration(r.duration_ms)
        );
        if cfg.verbose {
            if let Some(error) = &r.error {
                let _ = writeln!(out, "{:name_w$}  {error}", "");
            }
        }
    }

    let s = &report.summary;
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "{} passed, {} failed, {} total in {}",
        s.succeeded,
        s.failed,
        s.total,
        format_duration(s.total_duration_ms)
    );
    let _ = writeln!(out, "report: {}", written.report.display());
    let _ = writeln!(out, "digest: {}", written.digest.display());
}

fn format_status(success: bool, color: bool) -> String {
    let (label, code) = if success { ("PASS", "32") } else { ("FAIL", "31") };
    if !color {
        return label.to_string();
    }
    format!("\x1b[{code}m{label}\x1b[0m")
}

fn pad_end_ansi(s: &str, width: usize) -> String {
    let w = visible_width_ansi(s);
    if w >= width {
        return s.to_string();
    }
    format!("{s}{}", " ".repeat(width - w))
}

fn visible_width_ansi(s: &str) -> usize {
    let mut width: usize = 0;
    let mut chars = s.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\x1b' && chars.peek() == Some(&'[') {
            let _ = chars.next();
            for ch2 in chars.by_ref() {
                if ch2 == 'm' {
                    break;
                }
            }
            continue;
        }
        width += 1;
    }
    width
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ansi_codes_do_not_count_toward_width() {
        let colored = format_status(false, true);
        assert_eq!(visible_width_ansi(&colored), 4);
        assert_eq!(pad_end_ansi(&colored, 6), format!("{colored}  "));
        assert_eq!(format_status(true, false), "PASS");
    }
}
