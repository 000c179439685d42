//! Business-rule (Schematron) validation
//!
//! A rule artifact is evaluated in one of two modes. Files ending in `xsl` or
//! `xslt` are precompiled stylesheets run through libxslt, their SVRL output is
//! read back into findings. `sch` files are parsed and evaluated directly. Any
//! other extension is tried as a raw rule file first and as a stylesheet second.

mod engine;
mod rules;
mod svrl;

pub use engine::RuleEngine;
pub use rules::{
    Check, CheckKind, Let, LocalizedDiagnostic, MessagePart, Pattern, Rule, RuleSet,
    SCHEMATRON_NAMESPACE,
};
pub use svrl::{
    DiagnosticReference, Finding, FindingKind, SVRL_NAMESPACE, findings_to_report, parse_svrl,
};

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::artifact::ArtifactReference;
use crate::cache::TransformCache;
use crate::config::ValidationProfile;
use crate::document::LineAnnotatedDocument;
use crate::error::{Result, ValidationError};
use crate::libxml2::{LibXml2Wrapper, XsltStylesheetPtr};
use crate::location::PathLocationTranslator;
use crate::report::{Report, ReportAggregator};
use crate::validator::RuleValidation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleMode {
    Compiled,
    Raw,
    /// Raw first, compiled if the file is not a usable rule file
    RawThenCompiled,
}

impl RuleMode {
    pub fn for_artifact(artifact: &ArtifactReference) -> Self {
        match artifact.extension().as_deref() {
            Some("xsl") | Some("xslt") => RuleMode::Compiled,
            Some("sch") => RuleMode::Raw,
            _ => RuleMode::RawThenCompiled,
        }
    }
}

/// Applies rule artifacts to one parsed input
pub struct RuleValidator {
    xml: Arc<LibXml2Wrapper>,
    stylesheets: Arc<TransformCache<XsltStylesheetPtr>>,
    locale: String,
}

impl RuleValidator {
    pub fn new(
        xml: Arc<LibXml2Wrapper>,
        stylesheets: Arc<TransformCache<XsltStylesheetPtr>>,
        locale: impl Into<String>,
    ) -> Self {
        Self {
            xml,
            stylesheets,
            locale: locale.into(),
        }
    }

    pub fn validate(
        &self,
        input: &[u8],
        document: &LineAnnotatedDocument,
        artifacts: &[ArtifactReference],
        profile: &ValidationProfile,
    ) -> Report {
        ReportAggregator::merge(
            artifacts
                .iter()
                .map(|artifact| Some(self.validate_against(input, document, artifact, profile))),
        )
    }

    /// A broken artifact fails only its own report
    pub fn validate_against(
        &self,
        input: &[u8],
        document: &LineAnnotatedDocument,
        artifact: &ArtifactReference,
        profile: &ValidationProfile,
    ) -> Report {
        let mode = RuleMode::for_artifact(artifact);
        info!(
            "Validating against rule file {} ({:?})",
            artifact.path.display(),
            mode
        );
        let report = match self.run(input, document, artifact, profile, mode) {
            Ok(report) => report,
            Err(e) => {
                warn!("Rule file {} failed: {}", artifact.path.display(), e);
                Report::failure(e.to_string(), None)
            }
        };
        debug!(
            "Rule file {} verdict {} ({} errors, {} warnings)",
            artifact.path.display(),
            report.verdict,
            report.counters().errors,
            report.counters().warnings
        );
        info!("Finished rule file {}", artifact.path.display());
        report
    }

    fn run(
        &self,
        input: &[u8],
        document: &LineAnnotatedDocument,
        artifact: &ArtifactReference,
        profile: &ValidationProfile,
        mode: RuleMode,
    ) -> Result<Report> {
        match mode {
            RuleMode::Compiled => self.run_compiled(input, document, artifact, profile),
            RuleMode::Raw => self.run_raw(document, artifact, profile),
            RuleMode::RawThenCompiled => match self.run_raw(document, artifact, profile) {
                Err(ValidationError::InvalidRuleSet { details, .. }) => {
                    debug!(
                        "{} is not a raw rule file ({}), trying it as a stylesheet",
                        artifact.path.display(),
                        details
                    );
                    self.run_compiled(input, document, artifact, profile)
                        .map_err(|e| ValidationError::InvalidRuleSet {
                            path: artifact.path.clone(),
                            details: e.to_string(),
                        })
                }
                other => other,
            },
        }
    }

    fn run_raw(
        &self,
        document: &LineAnnotatedDocument,
        artifact: &ArtifactReference,
        profile: &ValidationProfile,
    ) -> Result<Report> {
        let rules = RuleSet::load(&artifact.path, &artifact.chain)?;
        debug!(
            "Loaded {} rule(s) in {} pattern(s) from {}",
            rules.rule_count(),
            rules.patterns.len(),
            artifact.path.display()
        );
        let findings = RuleEngine::new(&rules, document).evaluate()?;
        let translator = PathLocationTranslator::new(document, true);
        Ok(findings_to_report(
            Some(findings),
            &translator,
            profile,
            &self.locale,
        ))
    }

    fn run_compiled(
        &self,
        input: &[u8],
        document: &LineAnnotatedDocument,
        artifact: &ArtifactReference,
        profile: &ValidationProfile,
    ) -> Result<Report> {
        let stylesheet = self
            .stylesheets
            .get_or_compile(&artifact.path, |path| {
                self.xml.compile_stylesheet(path, &artifact.chain)
            })
            .map_err(|e| ValidationError::InvalidTransform {
                path: artifact.path.clone(),
                details: e.to_string(),
            })?;
        let output = self
            .xml
            .transform(&stylesheet, input, Some(&artifact.chain))?;
        let findings = parse_svrl(&output)?;
        let translator = PathLocationTranslator::new(document, false);
        Ok(findings_to_report(
            findings,
            &translator,
            profile,
            &self.locale,
        ))
    }
}

impl RuleValidation for RuleValidator {
    fn validate(
        &self,
        input: &[u8],
        document: &LineAnnotatedDocument,
        artifacts: &[ArtifactReference],
        profile: &ValidationProfile,
    ) -> Report {
        RuleValidator::validate(self, input, document, artifacts, profile)
    }
}
