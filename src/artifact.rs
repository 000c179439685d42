//! Resolving schema and rule-set artifacts for one validation run
//!
//! Bundled artifacts come first. A remote URL is only consulted when the profile
//! bundles nothing for the type. User-supplied artifacts are appended last. Every
//! resolved artifact carries the [`ResourceChain`] its imports are resolved through.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tracing::{debug, info};

use crate::cache::{RemoteArtifactCache, TransformCache};
use crate::config::{ArtifactDeclaration, ExternalArtifactSupport, ValidationProfile};
use crate::error::{LibXml2Error, Result, ValidationError};
use crate::libxml2::{LibXml2Wrapper, XsltStylesheetPtr};
use crate::resolver::ResourceChain;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Schema,
    RuleSet,
}

impl ArtifactKind {
    /// Name used for cache directories and messages
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Schema => "schema",
            ArtifactKind::RuleSet => "schematron",
        }
    }

    pub fn declaration<'a>(
        self,
        profile: &'a ValidationProfile,
        validation_type: &str,
    ) -> Option<&'a ArtifactDeclaration> {
        match self {
            ArtifactKind::Schema => profile.schema_declaration(validation_type),
            ArtifactKind::RuleSet => profile.rule_declaration(validation_type),
        }
    }

    pub fn accepted_extensions(self, profile: &ValidationProfile) -> &[String] {
        match self {
            ArtifactKind::Schema => &profile.accepted_schema_extensions,
            ArtifactKind::RuleSet => &profile.accepted_schematron_extensions,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    Bundled,
    UserSupplied,
    RemoteCached,
}

/// A concrete artifact file to validate against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactReference {
    pub path: PathBuf,
    pub kind: ArtifactKind,
    pub provenance: Provenance,
    /// Where the artifact's own imports and includes are looked up
    pub chain: ResourceChain,
}

impl ArtifactReference {
    pub fn new(path: impl Into<PathBuf>, kind: ArtifactKind, provenance: Provenance) -> Self {
        let path = path.into();
        let chain = ResourceChain::for_artifact(&path);
        Self {
            path,
            kind,
            provenance,
            chain,
        }
    }

    pub fn with_chain(mut self, chain: ResourceChain) -> Self {
        self.chain = chain;
        self
    }

    /// Lower-cased file extension, if any
    pub fn extension(&self) -> Option<String> {
        file_extension(&self.path)
    }
}

/// An artifact the caller materialized on disk for this request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserArtifact {
    File(PathBuf),
    /// Root directory of an unpacked archive
    Unpacked(PathBuf),
}

impl UserArtifact {
    /// A directory is taken to be an unpacked archive
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if path.is_dir() {
            UserArtifact::Unpacked(path)
        } else {
            UserArtifact::File(path)
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            UserArtifact::File(path) | UserArtifact::Unpacked(path) => path,
        }
    }

    /// Directory the artifact's relative references are resolved against
    fn directory(&self) -> PathBuf {
        match self {
            UserArtifact::File(path) => path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
            UserArtifact::Unpacked(dir) => dir.clone(),
        }
    }
}

fn file_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
}

fn has_accepted_extension(path: &Path, accepted: &[String]) -> bool {
    file_extension(path).is_some_and(|ext| accepted.iter().any(|a| a.eq_ignore_ascii_case(&ext)))
}

/// Regular files directly inside `dir`, sorted by name
async fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut read_dir = fs::read_dir(dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Reject external artifacts the profile does not allow, or their absence when it requires them
pub fn check_external_support(
    declaration: Option<&ArtifactDeclaration>,
    kind: ArtifactKind,
    external: &[UserArtifact],
) -> Result<()> {
    let support = declaration
        .map(|d| d.external)
        .unwrap_or(ExternalArtifactSupport::None);
    match support {
        ExternalArtifactSupport::None if !external.is_empty() => Err(ValidationError::ExternalArtifact {
            kind: kind.as_str().to_string(),
            details: "not supported for this validation type".to_string(),
        }),
        ExternalArtifactSupport::Required if external.is_empty() => Err(ValidationError::ExternalArtifact {
            kind: kind.as_str().to_string(),
            details: "required for this validation type but none were provided".to_string(),
        }),
        _ => Ok(()),
    }
}

/// Resolves the ordered artifact list for a profile, type and kind
pub struct ArtifactResolver {
    remote: Arc<RemoteArtifactCache>,
    preprocessors: Arc<TransformCache<XsltStylesheetPtr>>,
}

impl ArtifactResolver {
    pub fn new(
        remote: Arc<RemoteArtifactCache>,
        preprocessors: Arc<TransformCache<XsltStylesheetPtr>>,
    ) -> Self {
        Self {
            remote,
            preprocessors,
        }
    }

    /// Resolve every artifact of `kind` to apply for `validation_type`
    ///
    /// Preprocessed copies are written to `work_dir`, which the caller owns.
    pub async fn resolve(
        &self,
        profile: &ValidationProfile,
        validation_type: &str,
        kind: ArtifactKind,
        external: &[UserArtifact],
        work_dir: &Path,
    ) -> Result<Vec<ArtifactReference>> {
        let declaration = kind.declaration(profile, validation_type);
        check_external_support(declaration, kind, external)?;

        let accepted = kind.accepted_extensions(profile);
        let external_dir = external.first().map(UserArtifact::directory);
        let mappings: Vec<(String, PathBuf)> = profile
            .remote_import_mappings
            .iter()
            .map(|(url, path)| (url.clone(), path.clone()))
            .collect();

        let mut artifacts = Vec::new();

        if let Some(declaration) = declaration {
            if let Some(local) = &declaration.local_path {
                for path in self.expand_local(local, accepted).await? {
                    let chain = ResourceChain::for_artifact(&path)
                        .with_external_dir(external_dir.clone())
                        .with_mappings(mappings.clone());
                    artifacts.push(
                        ArtifactReference::new(path, kind, Provenance::Bundled).with_chain(chain),
                    );
                }
            } else {
                for url in &declaration.remote {
                    artifacts.push(
                        self.fetch_remote(profile, validation_type, kind, url, external_dir.clone(), &mappings)
                            .await?,
                    );
                }
            }
        }

        for user_artifact in external {
            for path in self.expand_user(user_artifact, kind, accepted).await? {
                let chain = ResourceChain::for_artifact(&path)
                    .with_external_dir(Some(user_artifact.directory()))
                    .with_mappings(mappings.clone());
                artifacts.push(
                    ArtifactReference::new(path, kind, Provenance::UserSupplied).with_chain(chain),
                );
            }
        }

        if let Some(preprocessor) = declaration.and_then(|d| d.preprocessor.clone()) {
            let extension = declaration.and_then(|d| d.preprocessor_output_extension.clone());
            let mut preprocessed = Vec::with_capacity(artifacts.len());
            for artifact in artifacts {
                preprocessed.push(
                    self.preprocess(artifact, &preprocessor, extension.as_deref(), work_dir)
                        .await?,
                );
            }
            artifacts = preprocessed;
        }

        debug!(
            "Resolved {} {} artifact(s) for type {}",
            artifacts.len(),
            kind.as_str(),
            validation_type
        );
        Ok(artifacts)
    }

    /// A bundled file is used as-is; a directory contributes its accepted files
    async fn expand_local(&self, local: &Path, accepted: &[String]) -> Result<Vec<PathBuf>> {
        let metadata = fs::metadata(local).await?;
        if metadata.is_file() {
            return Ok(vec![local.to_path_buf()]);
        }
        Ok(list_files(local)
            .await?
            .into_iter()
            .filter(|path| has_accepted_extension(path, accepted))
            .collect())
    }

    async fn expand_user(
        &self,
        artifact: &UserArtifact,
        kind: ArtifactKind,
        accepted: &[String],
    ) -> Result<Vec<PathBuf>> {
        match artifact {
            UserArtifact::File(path) => Ok(vec![path.clone()]),
            UserArtifact::Unpacked(dir) => {
                let root_files = list_files(dir).await?;
                if kind == ArtifactKind::Schema && root_files.len() != 1 {
                    return Err(ValidationError::AmbiguousArchive {
                        path: dir.clone(),
                        root_files: root_files.len(),
                    });
                }
                Ok(root_files
                    .into_iter()
                    .filter(|path| kind == ArtifactKind::Schema || has_accepted_extension(path, accepted))
                    .collect())
            }
        }
    }

    async fn fetch_remote(
        &self,
        profile: &ValidationProfile,
        validation_type: &str,
        kind: ArtifactKind,
        url: &str,
        external_dir: Option<PathBuf>,
        mappings: &[(String, PathBuf)],
    ) -> Result<ArtifactReference> {
        let (path, import_cache_dir) = match kind {
            ArtifactKind::Schema => {
                let cached = self
                    .remote
                    .fetch_schema(
                        &profile.name,
                        validation_type,
                        kind.as_str(),
                        url,
                        &profile.remote_import_mappings,
                    )
                    .await?;
                (cached.path, Some(cached.cache_dir))
            }
            ArtifactKind::RuleSet => {
                let path = self
                    .remote
                    .fetch_artifact(&profile.name, validation_type, kind.as_str(), url)
                    .await?;
                (path, None)
            }
        };

        let chain = ResourceChain::for_artifact(&path)
            .with_external_dir(external_dir)
            .with_import_cache_dir(import_cache_dir)
            .with_mappings(mappings.iter().cloned());
        Ok(ArtifactReference::new(path, kind, Provenance::RemoteCached).with_chain(chain))
    }

    /// Run the declared preprocessor over an artifact, producing a copy in `work_dir`
    async fn preprocess(
        &self,
        artifact: ArtifactReference,
        preprocessor: &Path,
        output_extension: Option<&str>,
        work_dir: &Path,
    ) -> Result<ArtifactReference> {
        let extension = output_extension
            .map(str::to_string)
            .or_else(|| artifact.extension())
            .unwrap_or_else(|| "xml".to_string());
        let output = work_dir.join(format!("{}.{}", uuid::Uuid::new_v4(), extension));
        info!(
            "Pre-processing {} using {}",
            artifact.path.display(),
            preprocessor.display()
        );

        let source = fs::read(&artifact.path).await?;
        let preprocessors = Arc::clone(&self.preprocessors);
        let preprocessor = preprocessor.to_path_buf();
        let chain = artifact.chain.clone();
        let transformed = tokio::task::spawn_blocking(move || -> std::result::Result<Vec<u8>, LibXml2Error> {
            let xml = LibXml2Wrapper::new();
            let stylesheet = preprocessors.get_or_compile(&preprocessor, |path| {
                xml.compile_stylesheet(path, &ResourceChain::for_artifact(path))
            })?;
            xml.transform(&stylesheet, &source, Some(&chain))
        })
        .await
        .map_err(|e| ValidationError::Concurrency {
            details: e.to_string(),
        })?
        .map_err(|e| ValidationError::InvalidTransform {
            path: artifact.path.clone(),
            details: e.to_string(),
        })?;

        fs::write(&output, transformed).await?;
        let chain = artifact.chain.with_loaded_from(Some(work_dir.to_path_buf()));
        Ok(ArtifactReference {
            path: output,
            chain,
            ..artifact
        })
    }
}
