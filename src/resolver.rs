//! Resource-resolution chain for schema imports and stylesheet includes
//!
//! While a schema or stylesheet is compiled, every external reference it makes is
//! looked up through a [`ResourceChain`]: the artifact's own directory first, then the
//! request's external-artifact directory, then the remote-import cache. References
//! that cannot be found anywhere are reported as unresolved.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::cache::cache_relative_path;

/// Where to look for the targets of `import`, `include` and `document()` references
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceChain {
    artifact_dir: PathBuf,
    /// Directory a preprocessed copy of the artifact was written to
    loaded_from: Option<PathBuf>,
    external_dir: Option<PathBuf>,
    import_cache_dir: Option<PathBuf>,
    mappings: HashMap<String, PathBuf>,
}

impl ResourceChain {
    pub fn new(artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            artifact_dir: artifact_dir.into(),
            ..Self::default()
        }
    }

    /// Chain rooted at the directory containing `artifact`
    pub fn for_artifact(artifact: &Path) -> Self {
        Self::new(artifact.parent().unwrap_or_else(|| Path::new(".")))
    }

    /// Treat references relative to `dir` as relative to the artifact directory
    pub fn with_loaded_from(mut self, dir: Option<PathBuf>) -> Self {
        self.loaded_from = dir;
        self
    }

    pub fn with_external_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.external_dir = dir;
        self
    }

    pub fn with_import_cache_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.import_cache_dir = dir;
        self
    }

    /// Map a remote URL straight to a local file
    pub fn with_mapping(mut self, url: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.mappings.insert(url.into(), path.into());
        self
    }

    pub fn with_mappings<I>(mut self, mappings: I) -> Self
    where
        I: IntoIterator<Item = (String, PathBuf)>,
    {
        self.mappings.extend(mappings);
        self
    }

    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    fn directories(&self) -> impl Iterator<Item = &Path> {
        std::iter::once(self.artifact_dir.as_path())
            .chain(self.external_dir.as_deref())
            .chain(self.import_cache_dir.as_deref())
    }

    /// Local file standing in for `system_id`, if any
    pub fn resolve(&self, system_id: &str) -> Option<PathBuf> {
        if is_remote(system_id) {
            return self.resolve_remote(system_id);
        }

        let local = system_id.strip_prefix("file://").unwrap_or(system_id);
        let path = Path::new(local);
        if path.is_file() {
            return Some(path.to_path_buf());
        }

        let relative = std::iter::once(self.artifact_dir.as_path())
            .chain(self.loaded_from.as_deref())
            .find_map(|base| path.strip_prefix(base).ok())
            .filter(|rest| !rest.as_os_str().is_empty());
        let file_name = path.file_name().map(Path::new);

        for candidate in relative.into_iter().chain(file_name) {
            if candidate.is_absolute() {
                continue;
            }
            if let Some(found) = self
                .directories()
                .map(|dir| dir.join(candidate))
                .find(|joined| joined.is_file())
            {
                return Some(found);
            }
        }
        None
    }

    fn resolve_remote(&self, url: &str) -> Option<PathBuf> {
        if let Some(mapped) = self.mappings.get(url)
            && mapped.is_file()
        {
            return Some(mapped.clone());
        }
        self.import_cache_dir
            .as_ref()
            .map(|dir| dir.join(cache_relative_path(url)))
            .filter(|cached| cached.is_file())
    }
}

pub fn is_remote(system_id: &str) -> bool {
    system_id.starts_with("http://") || system_id.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "<x/>").unwrap();
    }

    #[test]
    fn test_existing_path_is_used_as_is() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("common.xsd");
        touch(&file);

        let chain = ResourceChain::new(temp.path());
        assert_eq!(chain.resolve(file.to_str().unwrap()), Some(file.clone()));
        assert_eq!(
            chain.resolve(&format!("file://{}", file.display())),
            Some(file)
        );
    }

    #[test]
    fn test_falls_back_through_external_and_import_directories() {
        let temp = TempDir::new().unwrap();
        let artifact_dir = temp.path().join("bundled");
        let external_dir = temp.path().join("upload");
        let import_dir = temp.path().join("import");
        fs::create_dir_all(&artifact_dir).unwrap();
        touch(&external_dir.join("types/codes.xsd"));
        touch(&import_dir.join("only-imported.xsd"));

        let chain = ResourceChain::new(&artifact_dir)
            .with_external_dir(Some(external_dir.clone()))
            .with_import_cache_dir(Some(import_dir.clone()));

        let missing_relative = artifact_dir.join("types/codes.xsd");
        assert_eq!(
            chain.resolve(missing_relative.to_str().unwrap()),
            Some(external_dir.join("types/codes.xsd"))
        );

        let elsewhere = temp.path().join("somewhere/only-imported.xsd");
        assert_eq!(
            chain.resolve(elsewhere.to_str().unwrap()),
            Some(import_dir.join("only-imported.xsd"))
        );

        assert_eq!(chain.resolve(artifact_dir.join("nope.xsd").to_str().unwrap()), None);
    }

    #[test]
    fn test_preprocessed_copy_resolves_against_original_directory() {
        let temp = TempDir::new().unwrap();
        let artifact_dir = temp.path().join("bundled");
        let work_dir = temp.path().join("work");
        touch(&artifact_dir.join("sub/common.xsd"));
        fs::create_dir_all(&work_dir).unwrap();

        let chain = ResourceChain::new(&artifact_dir).with_loaded_from(Some(work_dir.clone()));
        assert_eq!(
            chain.resolve(work_dir.join("sub/common.xsd").to_str().unwrap()),
            Some(artifact_dir.join("sub/common.xsd"))
        );
    }

    #[test]
    fn test_remote_identifiers_use_mappings_then_import_cache() {
        let temp = TempDir::new().unwrap();
        let mapped = temp.path().join("mapped.xsd");
        touch(&mapped);
        let import_dir = temp.path().join("import");
        let url = "https://example.org/schemas/common.xsd";
        touch(&import_dir.join(cache_relative_path(url)));

        let chain = ResourceChain::new(temp.path())
            .with_import_cache_dir(Some(import_dir.clone()))
            .with_mapping("https://example.org/root.xsd", &mapped);

        assert_eq!(chain.resolve("https://example.org/root.xsd"), Some(mapped));
        assert_eq!(
            chain.resolve(url),
            Some(import_dir.join(cache_relative_path(url)))
        );
        assert_eq!(chain.resolve("https://example.org/unknown.xsd"), None);
    }
}
