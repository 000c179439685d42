//! Rule findings and their conversion into report diagnostics
//!
//! Both rule modes end up here: the raw engine produces [`Finding`]s directly,
//! compiled stylesheets produce SVRL which [`parse_svrl`] reads into the same shape.

use crate::config::ValidationProfile;
use crate::document::{Element, LineAnnotatedDocument, NodeId};
use crate::error::{Result, ValidationError};
use crate::location::{PathLocationTranslator, input_location};
use crate::report::{Diagnostic, Report, Severity};

pub const SVRL_NAMESPACE: &str = "http://purl.oclc.org/dsdl/svrl";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindingKind {
    FailedAssert,
    SuccessfulReport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticReference {
    pub diagnostic: String,
    pub lang: Option<String>,
    pub text: String,
}

/// One failed assertion or successful report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub kind: FindingKind,
    pub id: Option<String>,
    pub flag: Option<String>,
    pub role: Option<String>,
    pub test: Option<String>,
    pub location: Option<String>,
    pub text: String,
    pub diagnostics: Vec<DiagnosticReference>,
}

impl Finding {
    pub fn new(kind: FindingKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            id: None,
            flag: None,
            role: None,
            test: None,
            location: None,
            text: text.into(),
            diagnostics: Vec::new(),
        }
    }

    /// `flag` wins over `role`
    pub fn level(&self) -> Option<&str> {
        self.flag.as_deref().or(self.role.as_deref())
    }

    pub fn severity(&self) -> Severity {
        Severity::from_level(self.level())
    }

    /// Localized text when diagnostics match the locale's language, else the message
    pub fn description(&self, locale: &str) -> String {
        let language = locale
            .split(['-', '_'])
            .next()
            .unwrap_or_default();
        if !language.is_empty() {
            let localized: Vec<&str> = self
                .diagnostics
                .iter()
                .filter(|d| {
                    d.lang
                        .as_deref()
                        .is_some_and(|lang| lang.eq_ignore_ascii_case(language))
                })
                .map(|d| d.text.as_str())
                .collect();
            if !localized.is_empty() {
                return localized.join(" ");
            }
        }
        self.text.trim().to_string()
    }
}

/// Read SVRL output; `Ok(None)` when the transform produced nothing usable
pub fn parse_svrl(output: &[u8]) -> Result<Option<Vec<Finding>>> {
    if output.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let document = LineAnnotatedDocument::parse(output).map_err(|e| ValidationError::Svrl {
        details: e.to_string(),
    })?;
    let root = document.document_element();
    if !document
        .element(root)
        .is_some_and(|element| is_svrl(element, "schematron-output"))
    {
        return Ok(None);
    }

    let mut findings = Vec::new();
    for id in document.descendants(root) {
        let Some(element) = document.element(id) else {
            continue;
        };
        let kind = if is_svrl(element, "failed-assert") {
            FindingKind::FailedAssert
        } else if is_svrl(element, "successful-report") {
            FindingKind::SuccessfulReport
        } else {
            continue;
        };
        findings.push(read_finding(&document, id, element, kind));
    }
    Ok(Some(findings))
}

fn is_svrl(element: &Element, local: &str) -> bool {
    element.name.local == local && element.namespace.as_deref() == Some(SVRL_NAMESPACE)
}

fn attribute(element: &Element, name: &str) -> Option<String> {
    element
        .attributes
        .iter()
        .find(|a| a.name.prefix.is_none() && a.name.local == name)
        .map(|a| a.value.clone())
}

fn read_finding(
    document: &LineAnnotatedDocument,
    id: NodeId,
    element: &Element,
    kind: FindingKind,
) -> Finding {
    let mut finding = Finding::new(kind, "");
    finding.id = attribute(element, "id");
    finding.flag = attribute(element, "flag");
    finding.role = attribute(element, "role");
    finding.test = attribute(element, "test");
    finding.location = attribute(element, "location");

    for child in document.children(id) {
        let Some(child_element) = document.element(*child) else {
            continue;
        };
        if is_svrl(child_element, "text") {
            finding.text = document.string_value(*child);
        } else if is_svrl(child_element, "diagnostic-reference") {
            let lang = child_element
                .attributes
                .iter()
                .find(|a| a.name.prefix.as_deref() == Some("xml") && a.name.local == "lang")
                .map(|a| a.value.clone());
            finding.diagnostics.push(DiagnosticReference {
                diagnostic: attribute(child_element, "diagnostic").unwrap_or_default(),
                lang,
                text: content_text(document, *child),
            });
        }
    }
    finding
}

/// Non-blank text pieces, trimmed and joined with a space
fn content_text(document: &LineAnnotatedDocument, id: NodeId) -> String {
    document
        .descendants(id)
        .filter_map(|node| document.text(node))
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Turn findings into a report; failed assertions are listed before reports
///
/// `None` means the engine produced no output at all, which fails the input.
pub fn findings_to_report(
    findings: Option<Vec<Finding>>,
    translator: &PathLocationTranslator<'_>,
    profile: &ValidationProfile,
    locale: &str,
) -> Report {
    let Some(findings) = findings else {
        return Report::failure(
            "Rule validation produced no output for the input",
            Some(input_location(1, 0)),
        );
    };

    let policy = profile.location_policy();
    let (asserts, reports): (Vec<Finding>, Vec<Finding>) = findings
        .into_iter()
        .partition(|f| f.kind == FindingKind::FailedAssert);

    let diagnostics = asserts
        .iter()
        .chain(reports.iter())
        .map(|finding| {
            let mut diagnostic = Diagnostic::new(finding.severity(), finding.description(locale));
            if let Some(location) = finding.location.as_deref().filter(|l| !l.trim().is_empty()) {
                diagnostic = diagnostic.with_location(translator.render(location, policy));
            }
            if profile.include_test
                && let Some(test) = &finding.test
            {
                diagnostic = diagnostic.with_test(test.trim());
            }
            if profile.include_assertion_id
                && let Some(id) = &finding.id
            {
                diagnostic = diagnostic.with_assertion_id(id.clone());
            }
            diagnostic
        })
        .collect();
    Report::from_diagnostics(diagnostics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::Verdict;

    const SVRL: &str = r#"<svrl:schematron-output xmlns:svrl="http://purl.oclc.org/dsdl/svrl">
  <svrl:active-pattern id="p1"/>
  <svrl:fired-rule context="Line"/>
  <svrl:successful-report test="Note" role="info" location="/Invoice[1]/Line[1]">
    <svrl:text>Line has a note</svrl:text>
  </svrl:successful-report>
  <svrl:failed-assert test="Amount &gt; 0" id="BR-01" flag="fatal" location="/Invoice[1]/Line[2]">
    <svrl:text> Amount must be positive </svrl:text>
    <svrl:diagnostic-reference diagnostic="d1" xml:lang="fr">
      Montant <svrl:emph>invalide</svrl:emph>
    </svrl:diagnostic-reference>
  </svrl:failed-assert>
</svrl:schematron-output>"#;

    const INPUT: &str = "<Invoice>\n  <Line><Note/></Line>\n  <Line/>\n</Invoice>";

    #[test]
    fn test_parse_svrl_reads_findings() {
        let findings = parse_svrl(SVRL.as_bytes()).unwrap().unwrap();
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].kind, FindingKind::SuccessfulReport);
        assert_eq!(findings[0].level(), Some("info"));
        let failed = &findings[1];
        assert_eq!(failed.id.as_deref(), Some("BR-01"));
        assert_eq!(failed.level(), Some("fatal"));
        assert_eq!(failed.diagnostics[0].text, "Montant invalide");
    }

    #[test]
    fn test_empty_or_foreign_output_is_none() {
        assert!(parse_svrl(b"  \n").unwrap().is_none());
        assert!(parse_svrl(b"<html/>").unwrap().is_none());
    }

    #[test]
    fn test_description_prefers_matching_language() {
        let mut finding = Finding::new(FindingKind::FailedAssert, "  plain  ");
        finding.diagnostics = vec![
            DiagnosticReference {
                diagnostic: "a".to_string(),
                lang: Some("FR".to_string()),
                text: "un".to_string(),
            },
            DiagnosticReference {
                diagnostic: "b".to_string(),
                lang: Some("fr".to_string()),
                text: "deux".to_string(),
            },
        ];
        assert_eq!(finding.description("fr-CA"), "un deux");
        assert_eq!(finding.description("en"), "plain");
    }

    #[test]
    fn test_findings_to_report_orders_and_locates() {
        let document = LineAnnotatedDocument::parse(INPUT.as_bytes()).unwrap();
        let translator = PathLocationTranslator::new(&document, false);
        let mut profile = ValidationProfile::ad_hoc("test");
        profile.include_test = true;
        profile.include_assertion_id = true;

        let findings = parse_svrl(SVRL.as_bytes()).unwrap();
        let report = findings_to_report(findings, &translator, &profile, "en");

        assert_eq!(report.verdict, Verdict::Failure);
        let first = &report.diagnostics[0];
        assert_eq!(first.severity, Severity::Error);
        assert_eq!(first.description, "Amount must be positive");
        assert_eq!(first.location.as_deref(), Some("XML:3:0"));
        assert_eq!(first.test.as_deref(), Some("Amount > 0"));
        assert_eq!(first.assertion_id.as_deref(), Some("BR-01"));
        let second = &report.diagnostics[1];
        assert_eq!(second.severity, Severity::Info);
        assert_eq!(second.location.as_deref(), Some("XML:2:0"));
    }

    #[test]
    fn test_missing_output_fails_at_first_line() {
        let document = LineAnnotatedDocument::parse(INPUT.as_bytes()).unwrap();
        let translator = PathLocationTranslator::new(&document, false);
        let report = findings_to_report(None, &translator, &ValidationProfile::ad_hoc("t"), "en");
        assert_eq!(report.verdict, Verdict::Failure);
        assert_eq!(report.diagnostics[0].location.as_deref(), Some("XML:1:0"));
    }
}
