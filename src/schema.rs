//! Grammar (XML Schema) validation through libxml2

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use crate::artifact::ArtifactReference;
use crate::error::Result;
use crate::libxml2::{ErrorLevel, LibXml2Wrapper, StructuredError, ValidationResult};
use crate::location::input_location;
use crate::report::{Diagnostic, Report, ReportAggregator, Severity};
use crate::validator::SchemaValidation;

/// Validates an input file against each resolved schema artifact
///
/// Positions come straight from libxml2's streaming validator, so no
/// line-annotated document is needed here.
pub struct SchemaValidator {
    xml: Arc<LibXml2Wrapper>,
}

impl SchemaValidator {
    pub fn new(xml: Arc<LibXml2Wrapper>) -> Self {
        Self { xml }
    }

    /// One report per artifact, merged in artifact order
    pub fn validate(&self, input: &Path, artifacts: &[ArtifactReference]) -> Report {
        if artifacts.is_empty() {
            return Report::empty_success();
        }
        ReportAggregator::merge(
            artifacts
                .iter()
                .map(|artifact| Some(self.validate_against(input, artifact))),
        )
    }

    /// Problems with the artifact itself become a single failure diagnostic
    pub fn validate_against(&self, input: &Path, artifact: &ArtifactReference) -> Report {
        info!("Validating against schema {}", artifact.path.display());
        let report = match self.run(input, artifact) {
            Ok(report) => report,
            Err(e) => Report::failure(e.to_string(), None),
        };
        debug!(
            "Schema {} verdict {} ({} errors, {} warnings)",
            artifact.path.display(),
            report.verdict,
            report.counters().errors,
            report.counters().warnings
        );
        info!("Finished schema {}", artifact.path.display());
        report
    }

    fn run(&self, input: &Path, artifact: &ArtifactReference) -> Result<Report> {
        let location = artifact.path.to_string_lossy();
        let schema = self.xml.parse_schema(&location, &artifact.chain)?;
        let result = self.xml.validate_file(&schema, input)?;
        Ok(report_from_result(result))
    }
}

impl SchemaValidation for SchemaValidator {
    fn validate(&self, input: &Path, artifacts: &[ArtifactReference]) -> Report {
        SchemaValidator::validate(self, input, artifacts)
    }
}

fn to_diagnostic(error: &StructuredError) -> Diagnostic {
    let severity = match error.level {
        ErrorLevel::Warning => Severity::Warning,
        ErrorLevel::Error | ErrorLevel::Fatal => Severity::Error,
    };
    Diagnostic::new(severity, error.message.clone())
        .with_location(input_location(error.line, error.column))
}

pub(crate) fn report_from_result(result: ValidationResult) -> Report {
    let mut diagnostics: Vec<Diagnostic> = result.messages().iter().map(to_diagnostic).collect();
    if let ValidationResult::Invalid { error_count, .. } = &result
        && !diagnostics.iter().any(|d| d.severity == Severity::Error)
    {
        diagnostics.push(Diagnostic::error(format!(
            "Schema validation reported {} error(s) without details",
            error_count
        )));
    }
    Report::from_diagnostics(diagnostics)
}
