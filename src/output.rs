//! Console output and report files for the batch runner

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::{OutputFormat, VerbosityLevel};
use crate::error::{Result, ValidationError};
use crate::report::{Report, Severity, Verdict};

/// Human-readable formatter for per-input reports
pub struct Output {
    verbosity: VerbosityLevel,
    show_colors: bool,
}

impl Output {
    pub fn new(verbosity: VerbosityLevel) -> Self {
        Self {
            verbosity,
            show_colors: atty::is(atty::Stream::Stdout),
        }
    }

    pub fn without_colors(mut self) -> Self {
        self.show_colors = false;
        self
    }

    fn colorize(&self, text: &str, color: &str) -> String {
        if self.show_colors {
            format!("\x1b[{}m{}\x1b[0m", color, text)
        } else {
            text.to_string()
        }
    }

    fn verdict_label(&self, verdict: Verdict) -> String {
        let color = match verdict {
            Verdict::Success => "32",
            Verdict::Warning => "33",
            Verdict::Failure => "31",
            Verdict::Undefined => "36",
        };
        self.colorize(&verdict.to_string(), color)
    }

    /// Block printed for one validated input
    pub fn format_report(&self, input: &Path, report: &Report) -> String {
        if self.verbosity == VerbosityLevel::Quiet {
            return format!("{}: {}\n", input.display(), self.verdict_label(report.verdict));
        }

        let counters = report.counters();
        let mut output = format!("Validating {}\n", input.display());
        if let Some(date) = report.date {
            output.push_str(&format!("  Date: {}\n", date.to_rfc3339()));
        }
        output.push_str(&format!("  Result: {}\n", self.verdict_label(report.verdict)));
        output.push_str(&format!("  Errors: {}\n", counters.errors));
        output.push_str(&format!("  Warnings: {}\n", counters.warnings));
        output.push_str(&format!("  Messages: {}\n", counters.infos));

        if self.verbosity >= VerbosityLevel::Verbose {
            for diagnostic in &report.diagnostics {
                let label = match diagnostic.severity {
                    Severity::Error => self.colorize("error", "31"),
                    Severity::Warning => self.colorize("warning", "33"),
                    Severity::Info => self.colorize("info", "36"),
                };
                output.push_str(&format!(
                    "    [{}] {}: {}\n",
                    label,
                    diagnostic.location.as_deref().unwrap_or("-"),
                    diagnostic.description
                ));
                if let Some(id) = &diagnostic.assertion_id {
                    output.push_str(&format!("      rule: {}\n", id));
                }
                if let Some(test) = &diagnostic.test {
                    output.push_str(&format!("      test: {}\n", test));
                }
            }
        }
        output
    }

    /// Line printed for an input whose request was rejected outright
    pub fn format_rejection(&self, input: &Path, error: &ValidationError) -> String {
        format!(
            "{}  {} - {}\n",
            self.colorize("✗ REJECTED", "31"),
            input.display(),
            error
        )
    }

    pub fn format_summary(&self, total: usize, succeeded: usize, duration: Duration) -> String {
        if self.verbosity == VerbosityLevel::Quiet {
            return String::new();
        }
        let failed = total - succeeded;
        let mut output = String::from("Summary:\n");
        output.push_str(&format!("  Inputs: {}\n", total));
        output.push_str(&format!("  {} {}\n", self.colorize("Succeeded:", "32"), succeeded));
        if failed > 0 {
            output.push_str(&format!("  {} {}\n", self.colorize("Failed:", "31"), failed));
        }
        output.push_str(&format!("  Duration: {}\n", format_duration(duration)));
        output
    }
}

/// Serialized form of `report` for stdout or a report file
pub fn render(report: &Report, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => report.to_json(),
        OutputFormat::Human | OutputFormat::Xml => report.to_xml(),
    }
}

/// `report.<index>.xml`, or `.json` for the JSON format
pub fn report_file_name(index: usize, format: OutputFormat) -> String {
    let extension = match format {
        OutputFormat::Json => "json",
        OutputFormat::Human | OutputFormat::Xml => "xml",
    };
    format!("report.{}.{}", index, extension)
}

pub async fn write_report(
    directory: &Path,
    index: usize,
    report: &Report,
    format: OutputFormat,
) -> Result<PathBuf> {
    tokio::fs::create_dir_all(directory).await?;
    let path = directory.join(report_file_name(index, format));
    tokio::fs::write(&path, render(report, format)?).await?;
    Ok(path)
}

fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs_f64();
    if total_secs < 1.0 {
        format!("{:.0}ms", duration.as_millis())
    } else if total_secs < 60.0 {
        format!("{:.2}s", total_secs)
    } else {
        let mins = (total_secs / 60.0) as u64;
        let secs = total_secs % 60.0;
        format!("{}m{:.1}s", mins, secs)
    }
}
