//! Diagnostics, reports and report merging

use std::fmt;
use std::io::Cursor;

use chrono::{DateTime, Utc};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ValidationError};

/// Severity of a single finding; the declaration order is the report ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    /// Map a rule finding's flag or role to a severity; unknown levels count as errors
    pub fn from_level(level: Option<&str>) -> Self {
        match level.map(|l| l.trim().to_ascii_lowercase()).as_deref() {
            Some("success") | Some("info") | Some("information") => Severity::Info,
            Some("warning") | Some("warn") => Severity::Warning,
            _ => Severity::Error,
        }
    }

    fn element_name(self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.element_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Success,
    Warning,
    Failure,
    Undefined,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Verdict::Success => "SUCCESS",
            Verdict::Warning => "WARNING",
            Verdict::Failure => "FAILURE",
            Verdict::Undefined => "UNDEFINED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub errors: usize,
    pub warnings: usize,
    pub infos: usize,
}

impl Counters {
    pub fn from_diagnostics(diagnostics: &[Diagnostic]) -> Self {
        let mut counters = Counters::default();
        for diagnostic in diagnostics {
            match diagnostic.severity {
                Severity::Error => counters.errors += 1,
                Severity::Warning => counters.warnings += 1,
                Severity::Info => counters.infos += 1,
            }
        }
        counters
    }

    fn add(self, other: Counters) -> Self {
        Counters {
            errors: self.errors + other.errors,
            warnings: self.warnings + other.warnings,
            infos: self.infos + other.infos,
        }
    }
}

/// One finding, as a plain value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assertion_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl Diagnostic {
    pub fn new(severity: Severity, description: impl Into<String>) -> Self {
        Self {
            severity,
            description: description.into(),
            test: None,
            assertion_id: None,
            location: None,
        }
    }

    pub fn error(description: impl Into<String>) -> Self {
        Self::new(Severity::Error, description)
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_test(mut self, test: impl Into<String>) -> Self {
        self.test = Some(test.into());
        self
    }

    pub fn with_assertion_id(mut self, id: impl Into<String>) -> Self {
        self.assertion_id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counters: Option<Counters>,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
    /// Echo of the validated input
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl Report {
    pub fn new(verdict: Verdict) -> Self {
        Self {
            verdict,
            date: None,
            counters: None,
            diagnostics: Vec::new(),
            context: None,
        }
    }

    /// Stand-in for a phase with no applicable artifacts
    pub fn empty_success() -> Self {
        Self {
            counters: Some(Counters::default()),
            ..Self::new(Verdict::Success)
        }
    }

    /// Failure if any diagnostic is an error, success otherwise
    pub fn from_diagnostics(diagnostics: Vec<Diagnostic>) -> Self {
        let verdict = if diagnostics.iter().any(|d| d.severity == Severity::Error) {
            Verdict::Failure
        } else {
            Verdict::Success
        };
        Self {
            counters: Some(Counters::from_diagnostics(&diagnostics)),
            diagnostics,
            ..Self::new(verdict)
        }
    }

    /// A failed report carrying one synthetic error
    pub fn failure(description: impl Into<String>, location: Option<String>) -> Self {
        let mut diagnostic = Diagnostic::error(description);
        diagnostic.location = location;
        Self::from_diagnostics(vec![diagnostic])
    }

    /// Stored counters, or counters computed from the diagnostics
    pub fn counters(&self) -> Counters {
        self.counters
            .unwrap_or_else(|| Counters::from_diagnostics(&self.diagnostics))
    }

    pub fn is_success(&self) -> bool {
        self.verdict == Verdict::Success
    }

    /// Fold `other` into this report; see [`ReportAggregator`]
    pub fn merge(mut self, other: Report) -> Report {
        let counters = self.counters().add(other.counters());
        if matches!(self.verdict, Verdict::Undefined | Verdict::Success)
            && other.verdict != Verdict::Undefined
        {
            self.verdict = other.verdict;
        }
        self.counters = Some(counters);
        self.diagnostics.extend(other.diagnostics);
        self.date = self.date.or(other.date);
        self.context = self.context.or(other.context);
        self
    }

    /// Stable sort: errors, then warnings, then informational findings
    pub fn sort_by_severity(&mut self) {
        self.diagnostics.sort_by_key(|d| d.severity);
    }

    /// Guarantee a date, the echoed input when requested, and counters
    pub fn complete(&mut self, input: Option<&str>) {
        if self.date.is_none() {
            self.date = Some(Utc::now());
        }
        if self.context.is_none() {
            self.context = input.map(str::to_string);
        }
        if self.counters.is_none() {
            self.counters = Some(Counters::from_diagnostics(&self.diagnostics));
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| ValidationError::Serialization(e.to_string()))
    }

    pub fn to_xml(&self) -> Result<String> {
        let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
        write(&mut writer, Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let mut root = BytesStart::new("validationReport");
        let verdict = self.verdict.to_string();
        root.push_attribute(("result", verdict.as_str()));
        if let Some(date) = self.date {
            root.push_attribute(("date", date.to_rfc3339().as_str()));
        }
        write(&mut writer, Event::Start(root))?;

        let counters = self.counters();
        write(&mut writer, Event::Start(BytesStart::new("counters")))?;
        text_element(&mut writer, "nrOfErrors", &counters.errors.to_string())?;
        text_element(&mut writer, "nrOfWarnings", &counters.warnings.to_string())?;
        text_element(&mut writer, "nrOfAssertions", &counters.infos.to_string())?;
        write(&mut writer, Event::End(BytesEnd::new("counters")))?;

        if let Some(context) = &self.context {
            write(&mut writer, Event::Start(BytesStart::new("context")))?;
            let mut item = BytesStart::new("item");
            item.push_attribute(("name", "input"));
            write(&mut writer, Event::Start(item))?;
            write(&mut writer, Event::Text(BytesText::new(context)))?;
            write(&mut writer, Event::End(BytesEnd::new("item")))?;
            write(&mut writer, Event::End(BytesEnd::new("context")))?;
        }

        write(&mut writer, Event::Start(BytesStart::new("reports")))?;
        for diagnostic in &self.diagnostics {
            let name = diagnostic.severity.element_name();
            write(&mut writer, Event::Start(BytesStart::new(name)))?;
            text_element(&mut writer, "description", &diagnostic.description)?;
            if let Some(location) = &diagnostic.location {
                text_element(&mut writer, "location", location)?;
            }
            if let Some(test) = &diagnostic.test {
                text_element(&mut writer, "test", test)?;
            }
            if let Some(id) = &diagnostic.assertion_id {
                text_element(&mut writer, "assertionID", id)?;
            }
            write(&mut writer, Event::End(BytesEnd::new(name)))?;
        }
        write(&mut writer, Event::End(BytesEnd::new("reports")))?;
        write(&mut writer, Event::End(BytesEnd::new("validationReport")))?;

        String::from_utf8(writer.into_inner().into_inner())
            .map_err(|e| ValidationError::Serialization(e.to_string()))
    }
}

fn write(writer: &mut Writer<Cursor<Vec<u8>>>, event: Event<'_>) -> Result<()> {
    writer
        .write_event(event)
        .map_err(|e| ValidationError::Serialization(e.to_string()))
}

fn text_element(writer: &mut Writer<Cursor<Vec<u8>>>, name: &str, text: &str) -> Result<()> {
    write(writer, Event::Start(BytesStart::new(name)))?;
    write(writer, Event::Text(BytesText::new(text)))?;
    write(writer, Event::End(BytesEnd::new(name)))
}

/// Merges phase and per-artifact reports into one
///
/// Counters are summed and diagnostics concatenated in input order. The first
/// report's verdict is the seed; a later verdict replaces it only while the seed
/// is still undefined or success, and only if the later verdict is defined.
/// A missing report counts as an empty success.
pub struct ReportAggregator;

impl ReportAggregator {
    pub fn merge<I>(reports: I) -> Report
    where
        I: IntoIterator<Item = Option<Report>>,
    {
        let mut reports = reports
            .into_iter()
            .map(|report| report.unwrap_or_else(Report::empty_success));
        let Some(seed) = reports.next() else {
            return Report::empty_success();
        };
        reports.fold(seed, Report::merge)
    }
}
