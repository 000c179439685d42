use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use xml_conformance::artifact::UserArtifact;
use xml_conformance::cli::{Cli, OutputFormat, VerbosityLevel};
use xml_conformance::config::{ConfigManager, ValidationProfile};
use xml_conformance::http_client::{AsyncHttpClient, HttpClientConfig};
use xml_conformance::output::{Output, render, write_report};
use xml_conformance::validator::{EngineOptions, ValidationEngine, ValidationRequest};

const DEFAULT_VALIDATION_TYPE: &str = "default";

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_args();
    init_tracing(cli.verbosity());

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

/// `RUST_LOG` wins over the verbosity flags
fn init_tracing(verbosity: VerbosityLevel) {
    let level = match verbosity {
        VerbosityLevel::Quiet => "error",
        VerbosityLevel::Normal => "warn",
        VerbosityLevel::Verbose => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Errors returned from here are configuration problems (exit code 2)
async fn run(cli: Cli) -> Result<ExitCode> {
    cli.validate().map_err(anyhow::Error::msg)?;
    let config = ConfigManager::load_config(&cli)
        .await
        .context("Failed to load configuration")?;

    let profile = if config.profiles.is_empty() {
        let validation_type = cli
            .validation_type
            .as_deref()
            .unwrap_or(DEFAULT_VALIDATION_TYPE);
        Arc::new(ValidationProfile::ad_hoc(validation_type))
    } else {
        ConfigManager::select_profile(&config, cli.profile.as_deref())?
    };
    let validation_type = cli
        .validation_type
        .clone()
        .or_else(|| profile.default_type().map(str::to_string))
        .unwrap_or_else(|| DEFAULT_VALIDATION_TYPE.to_string());
    info!(
        "Validating {} input(s) with profile {} as {}",
        cli.inputs.len(),
        profile.name,
        validation_type
    );

    let fetcher = Arc::new(AsyncHttpClient::new(HttpClientConfig::from(&config.network))?);
    let engine = Arc::new(ValidationEngine::new(EngineOptions::from(&config), fetcher));

    let external_schemas: Vec<UserArtifact> =
        cli.schemas.iter().cloned().map(UserArtifact::from_path).collect();
    let external_rule_sets: Vec<UserArtifact> =
        cli.rule_sets.iter().cloned().map(UserArtifact::from_path).collect();

    let mut requests = Vec::with_capacity(cli.inputs.len());
    for input in &cli.inputs {
        let bytes = tokio::fs::read(input)
            .await
            .with_context(|| format!("Failed to read {}", input.display()))?;
        requests.push(ValidationRequest {
            input: bytes,
            validation_type: validation_type.clone(),
            external_schemas: external_schemas.clone(),
            external_rule_sets: external_rule_sets.clone(),
        });
    }

    let started = Instant::now();
    let results = engine
        .validate_many(requests, profile, cli.get_thread_count())
        .await;

    let format: OutputFormat = config.output.format.into();
    let output = Output::new(cli.verbosity());
    let report_dir = cli.output_dir.clone().unwrap_or_else(|| PathBuf::from("."));
    let mut succeeded = 0;

    for (index, (input, result)) in cli.inputs.iter().zip(results).enumerate() {
        let report = match result {
            Ok(report) => report,
            Err(e) => {
                warn!("{} was not validated: {}", input.display(), e);
                print!("{}", output.format_rejection(input, &e));
                continue;
            }
        };
        if report.is_success() {
            succeeded += 1;
        }

        match format {
            OutputFormat::Human => print!("{}", output.format_report(input, &report)),
            OutputFormat::Json | OutputFormat::Xml => println!("{}", render(&report, format)?),
        }
        if !cli.no_reports {
            let path = write_report(&report_dir, index + 1, &report, format).await?;
            info!("Saved report for {} to {}", input.display(), path.display());
        }
    }

    if format == OutputFormat::Human {
        print!(
            "{}",
            output.format_summary(cli.inputs.len(), succeeded, started.elapsed())
        );
    }

    Ok(if succeeded == cli.inputs.len() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}
