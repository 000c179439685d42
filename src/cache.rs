use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::try_join_all;
use quick_xml::Reader;
use quick_xml::events::Event;
use tokio::fs;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{CacheError, Result, ValidationError};
use crate::http_client::RemoteFetcher;

/// Memoized compiled programs keyed by canonical source path
///
/// Compilation failures are not cached, so a failing source is recompiled on
/// every call until it succeeds. A disabled cache compiles on every call.
pub struct TransformCache<T> {
    cache: moka::sync::Cache<PathBuf, Arc<T>>,
    disabled: bool,
}

impl<T> TransformCache<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(max_capacity: u64) -> Self {
        Self {
            cache: moka::sync::Cache::builder()
                .max_capacity(max_capacity)
                .build(),
            disabled: false,
        }
    }

    /// A cache that never stores anything
    pub fn disabled() -> Self {
        Self {
            disabled: true,
            ..Self::new(1)
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Get the compiled form of `source`, compiling it if missing
    ///
    /// Concurrent callers for the same key wait for a single compilation.
    pub fn get_or_compile<F, E>(&self, source: &Path, compile: F) -> std::result::Result<Arc<T>, E>
    where
        F: FnOnce(&Path) -> std::result::Result<T, E>,
        E: Clone + Send + Sync + 'static,
    {
        let key = canonical_key(source);
        if self.disabled {
            return compile(&key).map(Arc::new);
        }
        self.cache
            .try_get_with(key.clone(), || compile(&key).map(Arc::new))
            .map_err(|e| (*e).clone())
    }

    pub fn contains(&self, source: &Path) -> bool {
        self.cache.contains_key(&canonical_key(source))
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}

fn canonical_key(source: &Path) -> PathBuf {
    source
        .canonicalize()
        .unwrap_or_else(|_| source.to_path_buf())
}

/// Deterministic location of the cached copy of `url`, relative to a cache directory
///
/// The URL's host and path are mirrored so that relative references between
/// cached documents resolve on disk exactly as they would remotely. Query strings
/// are folded into a hash prefix on the last segment.
pub fn cache_relative_path(url: &str) -> PathBuf {
    match Url::parse(url) {
        Ok(parsed) if parsed.host_str().is_some() => {
            let mut path = PathBuf::from(sanitize_segment(&match parsed.port() {
                Some(port) => format!("{}_{}", parsed.host_str().unwrap_or_default(), port),
                None => parsed.host_str().unwrap_or_default().to_string(),
            }));
            let mut segments: Vec<String> = parsed
                .path_segments()
                .map(|segments| segments.map(sanitize_segment).collect())
                .unwrap_or_default();
            match segments.last_mut() {
                Some(last) if !last.is_empty() => {
                    if parsed.query().is_some() {
                        *last = format!("{:016x}-{}", url_hash(url), last);
                    }
                }
                _ => {
                    segments.pop();
                    segments.push(format!("{:016x}-index", url_hash(url)));
                }
            }
            for segment in segments.iter().filter(|s| !s.is_empty()) {
                path.push(segment);
            }
            path
        }
        _ => PathBuf::from(format!("{:016x}-artifact", url_hash(url))),
    }
}

/// 64-bit FNV-1a; cached file names must not change between builds or toolchains
fn url_hash(url: &str) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    url.bytes().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(PRIME)
    })
}

fn sanitize_segment(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.chars().all(|c| c == '.') && !cleaned.is_empty() {
        "_".repeat(cleaned.len())
    } else {
        cleaned
    }
}

/// A remotely fetched schema and the directory mirroring its remote tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedRemoteArtifact {
    pub url: String,
    pub path: PathBuf,
    /// Root of the mirrored tree; absolute remote imports are looked up here
    pub cache_dir: PathBuf,
}

/// On-disk cache of remote artifacts under `<root>/<profile>/<type>/<kind>/`
pub struct RemoteArtifactCache {
    root: PathBuf,
    fetcher: Arc<dyn RemoteFetcher>,
    fetched: moka::future::Cache<PathBuf, u64>,
}

impl RemoteArtifactCache {
    pub fn new(root: impl Into<PathBuf>, fetcher: Arc<dyn RemoteFetcher>) -> Self {
        Self {
            root: root.into(),
            fetcher,
            fetched: moka::future::Cache::builder().build(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_dir(&self, profile: &str, validation_type: &str, kind: &str) -> PathBuf {
        self.root.join(profile).join(validation_type).join(kind)
    }

    /// Fetch `url` into `dir` unless this cache already did so
    ///
    /// Existing files are reused; writes overwrite, so a repeated fetch is harmless.
    pub async fn fetch_into(&self, url: &str, dir: &Path) -> Result<PathBuf> {
        let target = dir.join(cache_relative_path(url));
        let fetcher = Arc::clone(&self.fetcher);
        let destination = target.clone();
        let url_owned = url.to_string();

        self.fetched
            .try_get_with(target.clone(), async move {
                if let Ok(metadata) = fs::metadata(&destination).await
                    && metadata.is_file()
                {
                    debug!("Reusing cached copy of {}", url_owned);
                    return Ok::<u64, ValidationError>(metadata.len());
                }
                info!("Fetching {}", url_owned);
                let bytes = fetcher.fetch(&url_owned).await?;
                if let Some(parent) = destination.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::write(&destination, &bytes).await?;
                Ok(bytes.len() as u64)
            })
            .await
            .map_err(|e| CacheError::WriteError {
                key: url.to_string(),
                details: e.to_string(),
            })?;

        Ok(target)
    }

    /// Fetch a root artifact of any kind
    pub async fn fetch_artifact(
        &self,
        profile: &str,
        validation_type: &str,
        kind: &str,
        url: &str,
    ) -> Result<PathBuf> {
        let dir = self.artifact_dir(profile, validation_type, kind);
        self.fetch_into(url, &dir).await
    }

    /// Fetch a root schema and every schema it transitively imports or includes
    ///
    /// URLs present in `mappings` are served by their local file and are neither
    /// fetched nor scanned.
    pub async fn fetch_schema(
        &self,
        profile: &str,
        validation_type: &str,
        kind: &str,
        url: &str,
        mappings: &BTreeMap<String, PathBuf>,
    ) -> Result<CachedRemoteArtifact> {
        let cache_dir = self.artifact_dir(profile, validation_type, kind);
        if let Some(local) = mappings.get(url) {
            return Ok(CachedRemoteArtifact {
                url: url.to_string(),
                path: local.clone(),
                cache_dir,
            });
        }

        let path = self.fetch_into(url, &cache_dir).await?;
        let mut visited: HashSet<String> = HashSet::from([url.to_string()]);
        let mut frontier = vec![(url.to_string(), path.clone())];

        while !frontier.is_empty() {
            let mut next = Vec::new();
            for (base, file) in &frontier {
                let content = fs::read(file).await.map_err(|e| CacheError::ReadError {
                    key: file.display().to_string(),
                    details: e.to_string(),
                })?;
                for location in schema_references(&content) {
                    let Some(absolute) = resolve_reference(base, &location) else {
                        continue;
                    };
                    if !mappings.contains_key(&absolute) && visited.insert(absolute.clone()) {
                        next.push(absolute);
                    }
                }
            }

            frontier = try_join_all(next.into_iter().map(|import| {
                let cache_dir = cache_dir.clone();
                async move {
                    let file = self.fetch_into(&import, &cache_dir).await?;
                    Ok::<_, ValidationError>((import, file))
                }
            }))
            .await?;
        }

        Ok(CachedRemoteArtifact {
            url: url.to_string(),
            path,
            cache_dir,
        })
    }
}

/// `schemaLocation` values of `import`, `include`, `redefine` and `override` elements
fn schema_references(content: &[u8]) -> Vec<String> {
    let mut reader = Reader::from_reader(content);
    let mut buf = Vec::new();
    let mut locations = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let local_name = e.local_name();
                if matches!(
                    local_name.as_ref(),
                    b"import" | b"include" | b"redefine" | b"override"
                ) {
                    for attribute in e.attributes().flatten() {
                        if attribute.key.local_name().as_ref() == b"schemaLocation"
                            && let Ok(value) = attribute.unescape_value()
                        {
                            locations.push(value.trim().to_string());
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                warn!("Stopped scanning schema references: {}", e);
                break;
            }
            _ => {}
        }
        buf.clear();
    }
    locations
}

/// Absolute remote URL for `location` relative to `base`; local targets are skipped
fn resolve_reference(base: &str, location: &str) -> Option<String> {
    let resolved = Url::parse(base).ok()?.join(location).ok()?;
    matches!(resolved.scheme(), "http" | "https").then(|| resolved.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::MockRemoteFetcher;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[test]
    fn test_cache_path_mirrors_url() {
        assert_eq!(
            cache_relative_path("https://example.com/schemas/invoice.xsd"),
            PathBuf::from("example.com/schemas/invoice.xsd")
        );
        assert_eq!(
            cache_relative_path("http://example.com:8080/a%20b/c.xsd"),
            PathBuf::from("example.com_8080/a_20b/c.xsd")
        );

        let queried = cache_relative_path("https://example.com/get?name=x");
        assert!(queried.starts_with("example.com"));
        assert!(queried.to_string_lossy().ends_with("-get"));
        assert_eq!(queried, cache_relative_path("https://example.com/get?name=x"));
        assert_ne!(queried, cache_relative_path("https://example.com/get?name=y"));

        assert!(
            cache_relative_path("https://example.com/dir/")
                .to_string_lossy()
                .ends_with("-index")
        );
        assert!(
            cache_relative_path("not a url")
                .to_string_lossy()
                .ends_with("-artifact")
        );
    }

    #[test]
    fn test_url_hash_is_stable() {
        assert_eq!(url_hash(""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(url_hash("a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(url_hash("foobar"), 0x8594_4171_f739_67e8);
        assert_eq!(
            cache_relative_path("not a url"),
            PathBuf::from(format!("{:016x}-artifact", url_hash("not a url")))
        );
    }

    #[test]
    fn test_transform_cache_compiles_once() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("rules.xsl");
        std::fs::write(&source, "<xsl/>").unwrap();

        let cache: TransformCache<String> = TransformCache::new(16);
        let compilations = AtomicUsize::new(0);
        let compile = |path: &Path| {
            compilations.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(path.display().to_string())
        };

        let first = cache.get_or_compile(&source, compile).unwrap();
        let second = cache.get_or_compile(&source, compile).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(compilations.load(Ordering::SeqCst), 1);
        assert!(cache.contains(&source));
        assert_eq!(cache.entry_count(), 1);
    }

    #[test]
    fn test_transform_cache_does_not_keep_failures() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("broken.xsl");
        std::fs::write(&source, "<xsl/>").unwrap();

        let cache: TransformCache<String> = TransformCache::new(16);
        let attempts = AtomicUsize::new(0);

        for _ in 0..3 {
            let result = cache.get_or_compile(&source, |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>("does not compile".to_string())
            });
            assert_eq!(result.unwrap_err(), "does not compile");
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(!cache.contains(&source));

        let recovered = cache.get_or_compile(&source, |_| Ok::<_, String>("ok".to_string()));
        assert_eq!(recovered.unwrap().as_str(), "ok");
    }

    #[test]
    fn test_disabled_transform_cache_recompiles() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("rules.xsl");
        std::fs::write(&source, "<xsl/>").unwrap();

        let cache: TransformCache<usize> = TransformCache::disabled();
        let compilations = AtomicUsize::new(0);
        for _ in 0..3 {
            cache
                .get_or_compile(&source, |_| {
                    Ok::<_, String>(compilations.fetch_add(1, Ordering::SeqCst))
                })
                .unwrap();
        }
        assert_eq!(compilations.load(Ordering::SeqCst), 3);
        assert!(cache.is_disabled());
    }

    #[test]
    fn test_transform_cache_concurrent_access() {
        use rayon::prelude::*;

        let temp = TempDir::new().unwrap();
        let sources: Vec<PathBuf> = (0..4)
            .map(|i| {
                let path = temp.path().join(format!("rules{}.xsl", i));
                std::fs::write(&path, "<xsl/>").unwrap();
                path
            })
            .collect();

        let cache: TransformCache<PathBuf> = TransformCache::new(16);
        let results: Vec<Arc<PathBuf>> = (0..200)
            .into_par_iter()
            .map(|i| {
                cache
                    .get_or_compile(&sources[i % sources.len()], |path| {
                        Ok::<_, String>(path.to_path_buf())
                    })
                    .unwrap()
            })
            .collect();

        assert_eq!(results.len(), 200);
        assert_eq!(cache.entry_count(), 4);
    }

    #[test]
    fn test_schema_references_and_resolution() {
        let schema = br#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
  <xs:import namespace="urn:common" schemaLocation="common/types.xsd"/>
  <xs:include schemaLocation="https://other.example/ext.xsd"/>
  <xs:element name="root"/>
</xs:schema>"#;
        let references = schema_references(schema);
        assert_eq!(references, vec!["common/types.xsd", "https://other.example/ext.xsd"]);

        assert_eq!(
            resolve_reference("https://example.org/a/root.xsd", "common/types.xsd"),
            Some("https://example.org/a/common/types.xsd".to_string())
        );
        assert_eq!(
            resolve_reference("https://example.org/a/root.xsd", "../b.xsd"),
            Some("https://example.org/b.xsd".to_string())
        );
        assert_eq!(resolve_reference("not a url", "b.xsd"), None);
    }

    #[tokio::test]
    async fn test_remote_schema_and_imports_are_fetched_once() {
        let temp = TempDir::new().unwrap();
        let mut fetcher = MockRemoteFetcher::new();
        fetcher
            .expect_fetch()
            .withf(|url| url == "https://example.org/root.xsd")
            .times(1)
            .returning(|_| {
                Ok(br#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
  <xs:import namespace="urn:a" schemaLocation="a.xsd"/>
  <xs:import namespace="urn:b" schemaLocation="sub/b.xsd"/>
</xs:schema>"#
                    .to_vec())
            });
        fetcher
            .expect_fetch()
            .withf(|url| url == "https://example.org/a.xsd")
            .times(1)
            .returning(|_| {
                Ok(br#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
  <xs:include schemaLocation="sub/b.xsd"/>
</xs:schema>"#
                    .to_vec())
            });
        fetcher
            .expect_fetch()
            .withf(|url| url == "https://example.org/sub/b.xsd")
            .times(1)
            .returning(|_| {
                Ok(br#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
  <xs:include schemaLocation="../a.xsd"/>
</xs:schema>"#
                    .to_vec())
            });

        let cache = RemoteArtifactCache::new(temp.path(), Arc::new(fetcher));
        let mappings = BTreeMap::new();
        let first = cache
            .fetch_schema("einvoice", "ubl", "schema", "https://example.org/root.xsd", &mappings)
            .await
            .unwrap();
        let second = cache
            .fetch_schema("einvoice", "ubl", "schema", "https://example.org/root.xsd", &mappings)
            .await
            .unwrap();

        let cache_dir = temp.path().join("einvoice/ubl/schema");
        assert_eq!(first, second);
        assert_eq!(first.cache_dir, cache_dir);
        assert_eq!(first.path, cache_dir.join("example.org/root.xsd"));
        assert!(first.path.is_file());
        assert!(cache_dir.join("example.org/a.xsd").is_file());
        assert!(cache_dir.join("example.org/sub/b.xsd").is_file());
    }

    #[tokio::test]
    async fn test_failed_fetch_is_reported_and_retried() {
        let temp = TempDir::new().unwrap();
        let mut fetcher = MockRemoteFetcher::new();
        fetcher.expect_fetch().times(2).returning(|url| {
            Err(ValidationError::HttpStatus {
                url: url.to_string(),
                status: 503,
                message: "HTTP 503: Service Unavailable".to_string(),
            })
        });

        let cache = RemoteArtifactCache::new(temp.path(), Arc::new(fetcher));
        for _ in 0..2 {
            let err = cache
                .fetch_artifact("p", "t", "schematron", "https://example.org/rules.sch")
                .await
                .unwrap_err();
            assert!(err.to_string().contains("503"));
        }
    }
}
