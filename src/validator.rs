//! Validation engine
//!
//! One run validates one input: artifacts are resolved up front, then the schema
//! phase runs, then (unless the profile stops on schema errors) the rule phase,
//! and finally any registered plugins.
//! Both phases are CPU-bound libxml2/rule work and run on the blocking pool so
//! that many runs can share one tokio runtime. Batches of inputs are bounded by a
//! semaphore.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};

use tempfile::TempDir;

use crate::artifact::{ArtifactKind, ArtifactReference, ArtifactResolver, UserArtifact};
use crate::cache::{RemoteArtifactCache, TransformCache};
use crate::config::{Config, ValidationProfile};
use crate::document::LineAnnotatedDocument;
use crate::error::{Result, ValidationError};
use crate::http_client::RemoteFetcher;
use crate::libxml2::{LibXml2Wrapper, XsltStylesheetPtr};
use crate::location::input_location;
use crate::report::{Report, ReportAggregator};
use crate::schema::SchemaValidator;
use crate::schematron::RuleValidator;

const INPUT_FILE_NAME: &str = "input.xml";

/// Grammar phase seam
#[cfg_attr(test, mockall::automock)]
pub trait SchemaValidation: Send + Sync {
    fn validate(&self, input: &Path, artifacts: &[ArtifactReference]) -> Report;
}

/// Rule phase seam
#[cfg_attr(test, mockall::automock)]
pub trait RuleValidation: Send + Sync {
    fn validate(
        &self,
        input: &[u8],
        document: &LineAnnotatedDocument,
        artifacts: &[ArtifactReference],
        profile: &ValidationProfile,
    ) -> Report;
}

/// Extra checks supplied by the embedding application
///
/// Plugins see the input after both built-in phases have run, including when
/// the rule phase was skipped. Returning `None` leaves the report untouched.
#[cfg_attr(test, mockall::automock)]
pub trait ValidatorPlugin: Send + Sync {
    fn name(&self) -> String;

    fn validate(&self, input: &Path, validation_type: &str, work_dir: &Path) -> Option<Report>;
}

/// Per-engine settings taken from [`Config`]
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    pub locale: String,
    pub cache_dir: PathBuf,
    pub max_transforms: u64,
    pub disable_transform_cache: bool,
    /// Parent of the per-run working directories; the system temp dir when unset
    pub work_root: Option<PathBuf>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for EngineOptions {
    fn from(config: &Config) -> Self {
        Self {
            locale: config.output.locale.clone(),
            cache_dir: config.cache.directory.clone(),
            max_transforms: config.cache.max_transforms,
            disable_transform_cache: config.cache.disable_transform_cache,
            work_root: None,
        }
    }
}

/// One input of a batch
#[derive(Debug, Clone)]
pub struct ValidationRequest {
    pub input: Vec<u8>,
    pub validation_type: String,
    pub external_schemas: Vec<UserArtifact>,
    pub external_rule_sets: Vec<UserArtifact>,
}

/// Artifacts for one phase, or the report that replaces the phase when resolution failed
type Resolved = std::result::Result<Vec<ArtifactReference>, Report>;

pub struct ValidationEngine {
    artifacts: Arc<ArtifactResolver>,
    schemas: Arc<dyn SchemaValidation>,
    rules: Arc<dyn RuleValidation>,
    plugins: Vec<Arc<dyn ValidatorPlugin>>,
    work_root: Option<PathBuf>,
}

impl ValidationEngine {
    /// Wire the production services: libxml2, one shared transform cache and the remote cache
    pub fn new(options: EngineOptions, fetcher: Arc<dyn RemoteFetcher>) -> Self {
        let xml = Arc::new(LibXml2Wrapper::new());
        let transforms: Arc<TransformCache<XsltStylesheetPtr>> =
            Arc::new(if options.disable_transform_cache {
                TransformCache::disabled()
            } else {
                TransformCache::new(options.max_transforms)
            });
        let remote = Arc::new(RemoteArtifactCache::new(&options.cache_dir, fetcher));

        Self {
            artifacts: Arc::new(ArtifactResolver::new(remote, Arc::clone(&transforms))),
            schemas: Arc::new(SchemaValidator::new(Arc::clone(&xml))),
            rules: Arc::new(RuleValidator::new(xml, transforms, options.locale)),
            plugins: Vec::new(),
            work_root: options.work_root,
        }
    }

    pub fn with_services(
        artifacts: Arc<ArtifactResolver>,
        schemas: Arc<dyn SchemaValidation>,
        rules: Arc<dyn RuleValidation>,
    ) -> Self {
        Self {
            artifacts,
            schemas,
            rules,
            plugins: Vec::new(),
            work_root: None,
        }
    }

    pub fn with_plugins(mut self, plugins: Vec<Arc<dyn ValidatorPlugin>>) -> Self {
        self.plugins = plugins;
        self
    }

    pub fn with_work_root(mut self, work_root: Option<PathBuf>) -> Self {
        self.work_root = work_root;
        self
    }

    /// Validate `input` for `validation_type` under `profile`
    ///
    /// Only request-level problems come back as `Err`; everything that goes wrong
    /// with an individual artifact or with the input itself ends up in the report.
    pub async fn validate_all(
        &self,
        input: &[u8],
        validation_type: &str,
        external_schemas: &[UserArtifact],
        external_rule_sets: &[UserArtifact],
        profile: Arc<ValidationProfile>,
    ) -> Result<Report> {
        if !profile.supports(validation_type) {
            warn!(
                "Profile {} does not support validation type {}",
                profile.name, validation_type
            );
            return Err(ValidationError::UnknownValidationType {
                validation_type: validation_type.to_string(),
            });
        }

        // Removed on every exit path when dropped
        let work_dir = match self.work_dir() {
            Ok(work_dir) => work_dir,
            Err(e) => {
                warn!("Unable to create a working directory: {}", e);
                let report =
                    Report::failure(format!("Unable to create a working directory: {}", e), None);
                return Ok(finish(report, input, &profile));
            }
        };

        let schemas = self
            .resolve(
                &profile,
                validation_type,
                ArtifactKind::Schema,
                external_schemas,
                work_dir.path(),
            )
            .await?;
        let rule_sets = self
            .resolve(
                &profile,
                validation_type,
                ArtifactKind::RuleSet,
                external_rule_sets,
                work_dir.path(),
            )
            .await?;

        let bytes: Arc<Vec<u8>> = Arc::new(input.to_vec());
        let document = {
            let bytes = Arc::clone(&bytes);
            match tokio::task::spawn_blocking(move || LineAnnotatedDocument::parse(&bytes))
                .await
                .map_err(join_error)?
            {
                Ok(document) => Arc::new(document),
                Err(e) => {
                    warn!("Input is not well-formed: {}", e);
                    let location = match &e {
                        ValidationError::MalformedInput { line, .. } => {
                            Some(input_location(*line, 0))
                        }
                        _ => None,
                    };
                    return Ok(finish(Report::failure(e.to_string(), location), input, &profile));
                }
            }
        };

        let input_path = work_dir.path().join(INPUT_FILE_NAME);
        if let Err(e) = tokio::fs::write(&input_path, input).await {
            warn!("Unable to store the input for validation: {}", e);
            let report =
                Report::failure(format!("Unable to store the input for validation: {}", e), None);
            return Ok(finish(report, input, &profile));
        }

        let schema_report = self.schema_phase(input_path.clone(), schemas).await?;
        let report = if profile.stops_on_schema_errors(validation_type)
            && !schema_report.is_success()
        {
            info!(
                "Schema validation failed for type {}, skipping rule validation",
                validation_type
            );
            schema_report
        } else {
            let rule_report = self
                .rule_phase(bytes, document, rule_sets, Arc::clone(&profile))
                .await?;
            ReportAggregator::merge([Some(schema_report), rule_report])
        };

        let plugin_report = self
            .plugin_phase(input_path, validation_type, work_dir.path())
            .await?;
        let report = match plugin_report {
            Some(plugin_report) => ReportAggregator::merge([Some(report), Some(plugin_report)]),
            None => report,
        };
        debug!(
            "Run for type {} finished with {} ({} diagnostics)",
            validation_type,
            report.verdict,
            report.diagnostics.len()
        );
        Ok(finish(report, input, &profile))
    }

    /// Validate a batch with at most `max_concurrent` runs in flight; results keep request order
    pub async fn validate_many(
        self: &Arc<Self>,
        requests: Vec<ValidationRequest>,
        profile: Arc<ValidationProfile>,
        max_concurrent: usize,
    ) -> Vec<Result<Report>> {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(max_concurrent.max(1)));

        let tasks: Vec<_> = requests
            .into_iter()
            .map(|request| {
                let engine = Arc::clone(self);
                let profile = Arc::clone(&profile);
                let semaphore = Arc::clone(&semaphore);
                tokio::spawn(async move {
                    let _permit = semaphore.acquire().await.map_err(|_| {
                        ValidationError::Concurrency {
                            details: "Failed to acquire validation semaphore".to_string(),
                        }
                    })?;
                    engine
                        .validate_all(
                            &request.input,
                            &request.validation_type,
                            &request.external_schemas,
                            &request.external_rule_sets,
                            profile,
                        )
                        .await
                })
            })
            .collect();

        join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.map_err(join_error).and_then(|result| result))
            .collect()
    }

    fn work_dir(&self) -> std::io::Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("xml-conformance-");
        match &self.work_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
    }

    async fn resolve(
        &self,
        profile: &ValidationProfile,
        validation_type: &str,
        kind: ArtifactKind,
        external: &[UserArtifact],
        work_dir: &Path,
    ) -> Result<Resolved> {
        match self
            .artifacts
            .resolve(profile, validation_type, kind, external, work_dir)
            .await
        {
            Ok(artifacts) => Ok(Ok(artifacts)),
            Err(e) if e.is_request_level() => {
                warn!("Rejecting request: {}", e);
                Err(e)
            }
            Err(e) => {
                warn!("Unable to resolve {} artifacts: {}", kind.as_str(), e);
                Ok(Err(Report::failure(e.to_string(), None)))
            }
        }
    }

    async fn schema_phase(&self, input_path: PathBuf, schemas: Resolved) -> Result<Report> {
        let artifacts = match schemas {
            Ok(artifacts) if artifacts.is_empty() => return Ok(Report::empty_success()),
            Ok(artifacts) => artifacts,
            Err(report) => return Ok(report),
        };
        let validator = Arc::clone(&self.schemas);
        tokio::task::spawn_blocking(move || validator.validate(&input_path, &artifacts))
            .await
            .map_err(join_error)
    }

    /// `None` when no rule artifacts apply
    async fn rule_phase(
        &self,
        input: Arc<Vec<u8>>,
        document: Arc<LineAnnotatedDocument>,
        rule_sets: Resolved,
        profile: Arc<ValidationProfile>,
    ) -> Result<Option<Report>> {
        let artifacts = match rule_sets {
            Ok(artifacts) if artifacts.is_empty() => return Ok(None),
            Ok(artifacts) => artifacts,
            Err(report) => return Ok(Some(report)),
        };
        let validator = Arc::clone(&self.rules);
        tokio::task::spawn_blocking(move || {
            Some(validator.validate(&input, &document, &artifacts, &profile))
        })
        .await
        .map_err(join_error)
    }

    /// `None` when no plugin is registered or none produced a report
    async fn plugin_phase(
        &self,
        input_path: PathBuf,
        validation_type: &str,
        work_dir: &Path,
    ) -> Result<Option<Report>> {
        if self.plugins.is_empty() {
            return Ok(None);
        }
        let plugins = self.plugins.clone();
        let validation_type = validation_type.to_string();
        let work_dir = work_dir.to_path_buf();

        tokio::task::spawn_blocking(move || {
            let reports: Vec<Report> = plugins
                .iter()
                .filter_map(|plugin| {
                    let report = plugin.validate(&input_path, &validation_type, &work_dir)?;
                    info!(
                        "Plugin {} produced {} report item(s)",
                        plugin.name(),
                        report.diagnostics.len()
                    );
                    Some(report)
                })
                .collect();
            (!reports.is_empty()).then(|| ReportAggregator::merge(reports.into_iter().map(Some)))
        })
        .await
        .map_err(join_error)
    }
}

fn join_error(e: tokio::task::JoinError) -> ValidationError {
    ValidationError::Concurrency {
        details: format!("Task join error: {}", e),
    }
}

/// Ordering and completion applied to every final report
fn finish(mut report: Report, input: &[u8], profile: &ValidationProfile) -> Report {
    if profile.reports_ordered {
        report.sort_by_severity();
    }
    let echoed = profile
        .add_input_to_report
        .then(|| String::from_utf8_lossy(input).into_owned());
    report.complete(echoed.as_deref());
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ArtifactDeclaration, ExternalArtifactSupport};
    use crate::http_client::MockRemoteFetcher;
    use crate::report::{Diagnostic, Severity, Verdict};
    use std::fs;

    const SCHEMA: &str = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
  <xs:element name="note">
    <xs:complexType>
      <xs:sequence><xs:element name="to" type="xs:string"/></xs:sequence>
    </xs:complexType>
  </xs:element>
</xs:schema>"#;

    const RULES: &str = r#"<schema xmlns="http://purl.oclc.org/dsdl/schematron">
  <pattern>
    <rule context="to">
      <assert test="string-length(.) &gt; 2" id="TO-LEN" role="warning">Recipient is short</assert>
    </rule>
  </pattern>
</schema>"#;

    fn resolver(cache: &Path) -> Arc<ArtifactResolver> {
        let remote = Arc::new(RemoteArtifactCache::new(
            cache,
            Arc::new(MockRemoteFetcher::new()),
        ));
        Arc::new(ArtifactResolver::new(remote, Arc::new(TransformCache::new(8))))
    }

    fn bundled_profile(dir: &Path) -> ValidationProfile {
        fs::write(dir.join("note.xsd"), SCHEMA).unwrap();
        fs::write(dir.join("note.sch"), RULES).unwrap();
        let mut profile = ValidationProfile::ad_hoc("note");
        profile.schema.insert(
            "note".to_string(),
            ArtifactDeclaration {
                local_path: Some(dir.join("note.xsd")),
                ..ArtifactDeclaration::default()
            },
        );
        profile.schematron.insert(
            "note".to_string(),
            ArtifactDeclaration {
                local_path: Some(dir.join("note.sch")),
                ..ArtifactDeclaration::default()
            },
        );
        profile
    }

    fn engine(temp: &TempDir) -> ValidationEngine {
        ValidationEngine::new(
            EngineOptions {
                cache_dir: temp.path().join("cache"),
                work_root: Some(temp.path().to_path_buf()),
                ..EngineOptions::default()
            },
            Arc::new(MockRemoteFetcher::new()),
        )
    }

    #[tokio::test]
    async fn test_both_phases_are_merged() {
        let temp = TempDir::new().unwrap();
        let profile = Arc::new(bundled_profile(temp.path()));

        let report = engine(&temp)
            .validate_all(b"<note><to>Al</to></note>", "note", &[], &[], profile)
            .await
            .unwrap();

        assert_eq!(report.verdict, Verdict::Success);
        assert_eq!(report.counters().warnings, 1);
        assert_eq!(report.diagnostics[0].location.as_deref(), Some("XML:1:0"));
        assert!(report.date.is_some());
        assert!(report.counters.is_some());
    }

    #[tokio::test]
    async fn test_unknown_type_is_rejected() {
        let temp = TempDir::new().unwrap();
        let profile = Arc::new(ValidationProfile::ad_hoc("note"));
        let result = engine(&temp)
            .validate_all(b"<note/>", "invoice", &[], &[], profile)
            .await;
        assert!(matches!(result, Err(ValidationError::UnknownValidationType { .. })));
    }

    #[tokio::test]
    async fn test_malformed_input_is_a_failure_report() {
        let temp = TempDir::new().unwrap();
        let profile = Arc::new(bundled_profile(temp.path()));
        let report = engine(&temp)
            .validate_all(b"<note>\n<to>\n</note>", "note", &[], &[], profile)
            .await
            .unwrap();
        assert_eq!(report.verdict, Verdict::Failure);
        assert_eq!(report.counters().errors, 1);
        assert!(report.diagnostics[0].location.as_deref().unwrap().starts_with("XML:"));
    }

    #[tokio::test]
    async fn test_work_dir_is_removed_after_run() {
        let temp = TempDir::new().unwrap();
        let work_root = temp.path().join("work");
        fs::create_dir_all(&work_root).unwrap();
        let profile = Arc::new(bundled_profile(temp.path()));
        let engine = engine(&temp).with_work_root(Some(work_root.clone()));

        engine
            .validate_all(b"<note><to>Alice</to></note>", "note", &[], &[], Arc::clone(&profile))
            .await
            .unwrap();
        engine
            .validate_all(b"<note>", "note", &[], &[], profile)
            .await
            .unwrap();

        assert_eq!(fs::read_dir(&work_root).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_stop_on_schema_errors_skips_rule_phase() {
        let temp = TempDir::new().unwrap();
        let mut profile = bundled_profile(temp.path());
        profile.stop_on_schema_errors.insert("note".to_string());

        let mut schemas = MockSchemaValidation::new();
        schemas
            .expect_validate()
            .times(1)
            .returning(|_, _| Report::failure("missing element", Some(input_location(3, 5))));
        let mut rules = MockRuleValidation::new();
        rules.expect_validate().times(0);

        let engine = ValidationEngine::with_services(
            resolver(&temp.path().join("cache")),
            Arc::new(schemas),
            Arc::new(rules),
        );
        let report = engine
            .validate_all(b"<note/>", "note", &[], &[], Arc::new(profile))
            .await
            .unwrap();

        assert_eq!(report.verdict, Verdict::Failure);
        assert_eq!(report.diagnostics.len(), 1);
        assert_eq!(report.diagnostics[0].location.as_deref(), Some("XML:3:5"));
    }

    #[tokio::test]
    async fn test_ordering_and_input_echo_follow_profile() {
        let temp = TempDir::new().unwrap();
        let mut profile = bundled_profile(temp.path());
        profile.reports_ordered = true;
        profile.add_input_to_report = true;

        let mut schemas = MockSchemaValidation::new();
        schemas.expect_validate().returning(|_, _| {
            Report::from_diagnostics(vec![Diagnostic::new(Severity::Warning, "schema warning")])
        });
        let mut rules = MockRuleValidation::new();
        rules
            .expect_validate()
            .returning(|_, _, _, _| Report::failure("rule error", None));

        let engine = ValidationEngine::with_services(
            resolver(&temp.path().join("cache")),
            Arc::new(schemas),
            Arc::new(rules),
        );
        let report = engine
            .validate_all(b"<note/>", "note", &[], &[], Arc::new(profile))
            .await
            .unwrap();

        assert_eq!(report.verdict, Verdict::Failure);
        assert_eq!(report.diagnostics[0].severity, Severity::Error);
        assert_eq!(report.diagnostics[1].severity, Severity::Warning);
        assert_eq!(report.context.as_deref(), Some("<note/>"));
    }

    #[tokio::test]
    async fn test_required_external_artifact_is_request_level() {
        let temp = TempDir::new().unwrap();
        let mut profile = ValidationProfile::ad_hoc("note");
        profile.schema.insert(
            "note".to_string(),
            ArtifactDeclaration {
                external: ExternalArtifactSupport::Required,
                ..ArtifactDeclaration::default()
            },
        );

        let result = engine(&temp)
            .validate_all(b"<note/>", "note", &[], &[], Arc::new(profile))
            .await;
        assert!(matches!(result, Err(ValidationError::ExternalArtifact { .. })));
    }

    #[tokio::test]
    async fn test_batch_keeps_request_order() {
        let temp = TempDir::new().unwrap();
        let profile = Arc::new(bundled_profile(temp.path()));
        let engine = Arc::new(engine(&temp));

        let inputs: [&[u8]; 3] = [b"<note><to>Alice</to></note>", b"<note/>", b"<nope"];
        let requests = inputs
            .iter()
            .map(|input| ValidationRequest {
                input: input.to_vec(),
                validation_type: "note".to_string(),
                external_schemas: Vec::new(),
                external_rule_sets: Vec::new(),
            })
            .collect();

        let results = engine.validate_many(requests, profile, 2).await;
        let verdicts: Vec<Verdict> = results.into_iter().map(|r| r.unwrap().verdict).collect();
        assert_eq!(verdicts, vec![Verdict::Success, Verdict::Failure, Verdict::Failure]);
    }

    #[tokio::test]
    async fn test_missing_work_root_is_a_failure_report() {
        let temp = TempDir::new().unwrap();
        let profile = Arc::new(bundled_profile(temp.path()));
        let engine = engine(&temp).with_work_root(Some(temp.path().join("absent")));

        let report = engine
            .validate_all(b"<note><to>Alice</to></note>", "note", &[], &[], profile)
            .await
            .unwrap();

        assert_eq!(report.verdict, Verdict::Failure);
        assert_eq!(report.counters().errors, 1);
        assert!(report.diagnostics[0].description.contains("working directory"));
        assert!(report.date.is_some());
    }

    #[tokio::test]
    async fn test_plugin_reports_are_merged_last() {
        let temp = TempDir::new().unwrap();
        let profile = Arc::new(bundled_profile(temp.path()));

        let mut silent = MockValidatorPlugin::new();
        silent.expect_validate().times(1).returning(|_, _, _| None);
        silent.expect_name().times(0);
        let mut checker = MockValidatorPlugin::new();
        checker
            .expect_validate()
            .withf(|input, validation_type, work_dir| {
                input.is_file() && input.starts_with(work_dir) && validation_type == "note"
            })
            .times(1)
            .returning(|_, _, _| Some(Report::failure("plugin says no", None)));
        checker.expect_name().return_const("checker".to_string());

        let report = engine(&temp)
            .with_plugins(vec![Arc::new(silent), Arc::new(checker)])
            .validate_all(b"<note><to>Al</to></note>", "note", &[], &[], profile)
            .await
            .unwrap();

        assert_eq!(report.verdict, Verdict::Failure);
        assert_eq!(report.counters().warnings, 1);
        assert_eq!(report.counters().errors, 1);
        let descriptions: Vec<&str> =
            report.diagnostics.iter().map(|d| d.description.as_str()).collect();
        assert_eq!(descriptions, vec!["Recipient is short", "plugin says no"]);
    }

    #[tokio::test]
    async fn test_plugins_run_when_rules_are_skipped() {
        let temp = TempDir::new().unwrap();
        let mut profile = bundled_profile(temp.path());
        profile.stop_on_schema_errors.insert("note".to_string());

        let mut schemas = MockSchemaValidation::new();
        schemas
            .expect_validate()
            .returning(|_, _| Report::failure("missing element", None));
        let mut rules = MockRuleValidation::new();
        rules.expect_validate().times(0);
        let mut plugin = MockValidatorPlugin::new();
        plugin.expect_validate().times(1).returning(|_, _, _| {
            Some(Report::from_diagnostics(vec![Diagnostic::new(Severity::Info, "seen")]))
        });
        plugin.expect_name().return_const("info".to_string());

        let engine = ValidationEngine::with_services(
            resolver(&temp.path().join("cache")),
            Arc::new(schemas),
            Arc::new(rules),
        )
        .with_plugins(vec![Arc::new(plugin)]);
        let report = engine
            .validate_all(b"<note/>", "note", &[], &[], Arc::new(profile))
            .await
            .unwrap();

        assert_eq!(report.verdict, Verdict::Failure);
        assert_eq!(report.diagnostics.len(), 2);
        assert_eq!(report.counters().infos, 1);
    }
}
