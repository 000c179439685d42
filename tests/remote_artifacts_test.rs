mod common;

use std::sync::Arc;

use common::fixtures::{VALID_ORDER, Workspace};
use common::mocks::MockFetcher;
use xml_conformance::cache::cache_relative_path;
use xml_conformance::config::{ArtifactDeclaration, ValidationProfile};
use xml_conformance::error::ValidationError;
use xml_conformance::report::Verdict;

const ROOT_URL: &str = "http://schemas.example.com/order/order.xsd";
const TYPES_URL: &str = "http://schemas.example.com/order/common/types.xsd";

const REMOTE_ORDER_XSD: &str = r#"<?xml version="1.0"?>
<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
  <xs:include schemaLocation="common/types.xsd"/>
  <xs:element name="order">
    <xs:complexType>
      <xs:sequence>
        <xs:element name="item" maxOccurs="unbounded">
          <xs:complexType>
            <xs:sequence><xs:element name="sku" type="SkuType"/></xs:sequence>
          </xs:complexType>
        </xs:element>
        <xs:element name="total" type="xs:integer"/>
      </xs:sequence>
    </xs:complexType>
  </xs:element>
</xs:schema>"#;

const REMOTE_TYPES_XSD: &str = r#"<?xml version="1.0"?>
<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
  <xs:simpleType name="SkuType">
    <xs:restriction base="xs:string">
      <xs:length value="6"/>
    </xs:restriction>
  </xs:simpleType>
</xs:schema>"#;

fn remote_profile() -> ValidationProfile {
    let mut profile = ValidationProfile::ad_hoc("order");
    profile.name = "remote".to_string();
    profile.schema.insert(
        "order".to_string(),
        ArtifactDeclaration {
            remote: vec![ROOT_URL.to_string()],
            ..ArtifactDeclaration::default()
        },
    );
    profile.schematron.clear();
    profile
}

fn serving_fetcher() -> MockFetcher {
    let mut fetcher = MockFetcher::new();
    fetcher
        .expect_fetch()
        .withf(|url| url == ROOT_URL)
        .times(1)
        .returning(|_| Ok(REMOTE_ORDER_XSD.as_bytes().to_vec()));
    fetcher
        .expect_fetch()
        .withf(|url| url == TYPES_URL)
        .times(1)
        .returning(|_| Ok(REMOTE_TYPES_XSD.as_bytes().to_vec()));
    fetcher
}

#[tokio::test]
async fn test_remote_schema_and_its_include_are_fetched_once() {
    let workspace = Workspace::new();
    let fetcher = Arc::new(serving_fetcher());
    let profile = Arc::new(remote_profile());

    let first = workspace.engine_with_fetcher(fetcher.clone());
    let report = first
        .validate_all(VALID_ORDER.as_bytes(), "order", &[], &[], Arc::clone(&profile))
        .await
        .unwrap();
    assert_eq!(report.verdict, Verdict::Success, "{:?}", report.diagnostics);

    let invalid = "<order><item><sku>AB</sku></item><total>1</total></order>";
    let report = first
        .validate_all(invalid.as_bytes(), "order", &[], &[], Arc::clone(&profile))
        .await
        .unwrap();
    assert_eq!(report.verdict, Verdict::Failure);
    assert!(report.counters().errors >= 1);

    // A fresh engine over the same cache directory reuses the files on disk
    let second = workspace.engine_with_fetcher(fetcher);
    let report = second
        .validate_all(VALID_ORDER.as_bytes(), "order", &[], &[], profile)
        .await
        .unwrap();
    assert_eq!(report.verdict, Verdict::Success);
}

#[tokio::test]
async fn test_remote_tree_is_mirrored_in_cache() {
    let workspace = Workspace::new();
    let engine = workspace.engine_with_fetcher(Arc::new(serving_fetcher()));

    engine
        .validate_all(VALID_ORDER.as_bytes(), "order", &[], &[], Arc::new(remote_profile()))
        .await
        .unwrap();

    let schema_dir = workspace.cache_dir().join("remote").join("order").join("schema");
    let root = schema_dir.join(cache_relative_path(ROOT_URL));
    let types = schema_dir.join(cache_relative_path(TYPES_URL));
    assert!(root.is_file());
    assert!(types.is_file());
    assert_eq!(types.parent().unwrap(), root.parent().unwrap().join("common"));
}

#[tokio::test]
async fn test_unreachable_remote_schema_fails_the_phase() {
    let workspace = Workspace::new();
    let mut fetcher = MockFetcher::new();
    fetcher.expect_fetch().times(1).returning(|url| {
        Err(ValidationError::HttpStatus {
            url: url.to_string(),
            status: 404,
            message: "Not Found".to_string(),
        })
    });
    let engine = workspace.engine_with_fetcher(Arc::new(fetcher));

    let report = engine
        .validate_all(VALID_ORDER.as_bytes(), "order", &[], &[], Arc::new(remote_profile()))
        .await
        .unwrap();

    assert_eq!(report.verdict, Verdict::Failure);
    assert_eq!(report.counters().errors, 1);
    assert!(report.diagnostics[0].description.contains(ROOT_URL));
}
