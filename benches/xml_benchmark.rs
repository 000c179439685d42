use std::io::Write;
use std::path::Path;

use divan::Bencher;
use tempfile::NamedTempFile;
use xml_conformance::location::LocationPolicy;
use xml_conformance::schematron::{RuleEngine, RuleSet};
use xml_conformance::{LibXml2Wrapper, LineAnnotatedDocument, PathLocationTranslator, ResourceChain};

fn main() {
    divan::main();
}

const ORDER_XSD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
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

const ORDER_RULES: &str = r#"<schema xmlns="http://purl.oclc.org/dsdl/schematron">
  <pattern>
    <rule context="item">
      <assert test="string-length(sku) = 6" flag="fatal">SKU <value-of select="sku"/> must have six characters</assert>
    </rule>
  </pattern>
</schema>"#;

fn order(items: usize) -> String {
    let mut xml = String::from("<?xml version=\"1.0\"?>\n<order>\n");
    for i in 0..items {
        let sku = if i % 10 == 0 { "SHORT".to_string() } else { format!("S{:05}", i) };
        xml.push_str(&format!("  <item><sku>{}</sku></item>\n", sku));
    }
    xml.push_str("  <total>1</total>\n</order>\n");
    xml
}

fn temp_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{}", content).unwrap();
    file
}

#[divan::bench]
fn parse_schema(bencher: Bencher) {
    let wrapper = LibXml2Wrapper::new();
    let schema = temp_file(ORDER_XSD);
    let location = schema.path().to_string_lossy().into_owned();
    let chain = ResourceChain::for_artifact(schema.path());

    bencher.bench_local(|| wrapper.parse_schema(&location, &chain).unwrap());
}

#[divan::bench(args = [10, 1000])]
fn validate_schema(bencher: Bencher, items: usize) {
    let wrapper = LibXml2Wrapper::new();
    let schema_file = temp_file(ORDER_XSD);
    let chain = ResourceChain::for_artifact(schema_file.path());
    let schema = wrapper
        .parse_schema(&schema_file.path().to_string_lossy(), &chain)
        .unwrap();
    let input = temp_file(&order(items));

    bencher.bench_local(|| wrapper.validate_file(&schema, input.path()).unwrap());
}

#[divan::bench(args = [10, 1000])]
fn line_annotated_parse(bencher: Bencher, items: usize) {
    let input = order(items);

    bencher.bench_local(|| LineAnnotatedDocument::parse(input.as_bytes()).unwrap());
}

#[divan::bench(args = [10, 1000])]
fn evaluate_rules(bencher: Bencher, items: usize) {
    let rules = RuleSet::parse(
        ORDER_RULES.as_bytes(),
        Path::new("order.sch"),
        &ResourceChain::new("."),
    )
    .unwrap();
    let document = LineAnnotatedDocument::parse(order(items).as_bytes()).unwrap();

    bencher.bench_local(|| RuleEngine::new(&rules, &document).evaluate().unwrap());
}

#[divan::bench]
fn locate_findings(bencher: Bencher) {
    let document = LineAnnotatedDocument::parse(order(1000).as_bytes()).unwrap();
    let translator = PathLocationTranslator::new(&document, true);

    bencher.bench_local(|| translator.render("/order[0]/item[500]", LocationPolicy::default()));
}
