use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use xml_conformance::artifact::ArtifactResolver;
use xml_conformance::cache::{RemoteArtifactCache, TransformCache};
use xml_conformance::config::{ArtifactDeclaration, ValidationProfile};
use xml_conformance::http_client::RemoteFetcher;
use xml_conformance::validator::{EngineOptions, ValidationEngine};

use super::mocks::MockFetcher;

/// `order` must hold at least one `item` (with a `sku`) followed by a `total`
pub const ORDER_XSD: &str = r#"<?xml version="1.0"?>
<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
  <xs:element name="order">
    <xs:complexType>
      <xs:sequence>
        <xs:element name="item" maxOccurs="unbounded">
          <xs:complexType>
            <xs:sequence><xs:element name="sku" type="xs:string"/></xs:sequence>
          </xs:complexType>
        </xs:element>
        <xs:element name="total" type="xs:integer"/>
      </xs:sequence>
    </xs:complexType>
  </xs:element>
</xs:schema>"#;

/// Accepts any `order` content
pub const LAX_ORDER_XSD: &str = r#"<?xml version="1.0"?>
<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
  <xs:element name="order">
    <xs:complexType>
      <xs:sequence>
        <xs:any minOccurs="0" maxOccurs="unbounded" processContents="skip"/>
      </xs:sequence>
    </xs:complexType>
  </xs:element>
</xs:schema>"#;

pub const ORDER_RULES: &str = r#"<schema xmlns="http://purl.oclc.org/dsdl/schematron">
  <pattern id="items">
    <rule context="item">
      <assert test="string-length(sku) = 6" id="SKU-LEN" flag="fatal">SKU <value-of select="sku"/> must have six characters</assert>
    </rule>
  </pattern>
</schema>"#;

pub const VALID_ORDER: &str = "<?xml version=\"1.0\"?>
<order>
  <item><sku>ABC123</sku></item>
  <total>5</total>
</order>
";

/// Five lines; the `item` on line 3 lacks its mandatory `sku`
pub const ORDER_MISSING_SKU: &str = "<?xml version=\"1.0\"?>
<order>
  <item/>
  <total>5</total>
</order>
";

/// Scratch directory holding artifacts for one test
pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, relative: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.dir.path().join("cache")
    }

    pub fn engine(&self) -> ValidationEngine {
        self.engine_with_fetcher(Arc::new(MockFetcher::new()))
    }

    pub fn engine_with_fetcher(&self, fetcher: Arc<dyn RemoteFetcher>) -> ValidationEngine {
        ValidationEngine::new(
            EngineOptions {
                cache_dir: self.cache_dir(),
                ..EngineOptions::default()
            },
            fetcher,
        )
    }

    pub fn resolver(&self) -> Arc<ArtifactResolver> {
        let remote = Arc::new(RemoteArtifactCache::new(
            self.cache_dir(),
            Arc::new(MockFetcher::new()),
        ));
        Arc::new(ArtifactResolver::new(remote, Arc::new(TransformCache::new(8))))
    }
}

/// Profile supporting `validation_type` with the given bundled artifacts
pub fn bundled_profile(
    validation_type: &str,
    schema: Option<PathBuf>,
    rules: Option<PathBuf>,
) -> ValidationProfile {
    let mut profile = ValidationProfile::ad_hoc(validation_type);
    profile.name = "test".to_string();
    if let Some(schema) = schema {
        profile.schema.insert(validation_type.to_string(), bundled(schema));
    }
    if let Some(rules) = rules {
        profile.schematron.insert(validation_type.to_string(), bundled(rules));
    }
    profile
}

fn bundled(path: PathBuf) -> ArtifactDeclaration {
    ArtifactDeclaration {
        local_path: Some(path),
        ..ArtifactDeclaration::default()
    }
}
