use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Verbosity levels for output
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum VerbosityLevel {
    /// Only the per-input verdict line
    Quiet,
    /// Per-input summary block
    #[default]
    Normal,
    /// Summary block plus every diagnostic
    Verbose,
}

/// How each report is rendered on stdout and saved to disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Human,
    Json,
    Xml,
}

/// Validate XML documents against profile schemas and business rules
#[derive(Parser, Debug, Clone)]
#[command(name = "xml-conformance")]
#[command(about = "Validate XML documents against XML Schema and Schematron rule sets")]
#[command(version)]
pub struct Cli {
    /// Input documents
    #[arg(required = true, help = "XML files to validate")]
    pub inputs: Vec<PathBuf>,

    /// Validation type within the profile
    #[arg(short = 't', long = "type")]
    pub validation_type: Option<String>,

    /// Profile name from the configuration file
    #[arg(short = 'p', long = "profile")]
    pub profile: Option<String>,

    /// Configuration file (TOML or JSON)
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Additional XML Schema (file, or directory holding an unpacked archive)
    #[arg(long = "xsd", action = clap::ArgAction::Append)]
    pub schemas: Vec<PathBuf>,

    /// Additional Schematron rule set (file, or directory holding an unpacked archive)
    #[arg(long = "sch", action = clap::ArgAction::Append)]
    pub rule_sets: Vec<PathBuf>,

    /// Do not write report files
    #[arg(long = "no-reports")]
    pub no_reports: bool,

    /// Directory for report files (defaults to the current directory)
    #[arg(long = "output-dir")]
    pub output_dir: Option<PathBuf>,

    /// Locale used to pick localized rule messages
    #[arg(long = "locale")]
    pub locale: Option<String>,

    /// Report format
    #[arg(long = "format", value_enum)]
    pub format: Option<OutputFormat>,

    /// Print every diagnostic
    #[arg(short = 'v', long = "verbose", help = "Enable verbose output")]
    pub verbose: bool,

    /// Only print verdicts
    #[arg(
        short = 'q',
        long = "quiet",
        help = "Quiet mode",
        conflicts_with = "verbose"
    )]
    pub quiet: bool,

    /// Cache directory for remote artifacts
    #[arg(long = "cache-dir")]
    pub cache_dir: Option<PathBuf>,

    /// HTTP request timeout in seconds
    #[arg(long = "timeout")]
    pub timeout: Option<u64>,

    /// Recompile stylesheets on every use
    #[arg(long = "disable-transform-cache")]
    pub disable_transform_cache: bool,

    /// Number of inputs validated concurrently
    #[arg(short = 'j', long = "threads")]
    pub threads: Option<usize>,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn validate(&self) -> Result<(), String> {
        for input in &self.inputs {
            if !input.is_file() {
                return Err(format!("Input file does not exist: {}", input.display()));
            }
        }
        for artifact in self.schemas.iter().chain(&self.rule_sets) {
            if !artifact.exists() {
                return Err(format!("Artifact does not exist: {}", artifact.display()));
            }
        }
        if let Some(threads) = self.threads
            && threads == 0
        {
            return Err("Number of threads must be greater than 0".to_string());
        }
        Ok(())
    }

    pub fn get_thread_count(&self) -> usize {
        self.threads.unwrap_or_else(num_cpus::get)
    }

    pub fn verbosity(&self) -> VerbosityLevel {
        if self.quiet {
            VerbosityLevel::Quiet
        } else if self.verbose {
            VerbosityLevel::Verbose
        } else {
            VerbosityLevel::Normal
        }
    }
}
