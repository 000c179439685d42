//! Rule-file model for raw (uncompiled) Schematron
//!
//! The rule file is read into a [`LineAnnotatedDocument`] and walked into a
//! [`RuleSet`]. Every expression is compiled up front, so a rule file that loads
//! without error cannot fail later on a syntax problem.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::document::{Element, LineAnnotatedDocument, NodeId};
use crate::error::{Result, ValidationError};
use crate::resolver::{ResourceChain, is_remote};
use crate::xpath::XPath;

pub const SCHEMATRON_NAMESPACE: &str = "http://purl.oclc.org/dsdl/schematron";
const LEGACY_SCHEMATRON_NAMESPACE: &str = "http://www.ascc.net/xml/schematron";

const MAX_INCLUDE_DEPTH: usize = 16;

#[derive(Debug, Clone)]
pub struct Let {
    pub name: String,
    pub value: XPath,
}

#[derive(Debug, Clone)]
pub enum MessagePart {
    Text(String),
    ValueOf(XPath),
    /// `<name/>`, optionally naming the node selected by `path`
    Name(Option<XPath>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckKind {
    Assert,
    Report,
}

#[derive(Debug, Clone)]
pub struct Check {
    pub kind: CheckKind,
    pub id: Option<String>,
    pub role: Option<String>,
    pub flag: Option<String>,
    pub test: XPath,
    pub message: Vec<MessagePart>,
    /// Ids of localized diagnostics
    pub diagnostics: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub id: Option<String>,
    pub context: XPath,
    pub lets: Vec<Let>,
    pub checks: Vec<Check>,
}

#[derive(Debug, Clone, Default)]
pub struct Pattern {
    pub id: Option<String>,
    pub lets: Vec<Let>,
    pub rules: Vec<Rule>,
}

/// A `diagnostics/diagnostic` entry
#[derive(Debug, Clone)]
pub struct LocalizedDiagnostic {
    pub id: String,
    pub lang: Option<String>,
    pub message: Vec<MessagePart>,
}

/// A parsed, structurally valid rule file
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub source: PathBuf,
    /// `ns` declarations as (prefix, uri)
    pub namespaces: Vec<(String, String)>,
    pub lets: Vec<Let>,
    pub patterns: Vec<Pattern>,
    pub diagnostics: HashMap<String, LocalizedDiagnostic>,
}

impl RuleSet {
    /// Load and check a rule file; includes are resolved through `chain`
    pub fn load(path: &Path, chain: &ResourceChain) -> Result<Self> {
        let source = std::fs::read(path)?;
        Self::parse(&source, path, chain)
    }

    pub fn parse(source: &[u8], path: &Path, chain: &ResourceChain) -> Result<Self> {
        let document = LineAnnotatedDocument::parse(source).map_err(|e| invalid(path, e.to_string()))?;
        let root = document.document_element();
        let element = document
            .element(root)
            .ok_or_else(|| invalid(path, "no document element"))?;
        if !is_schematron(element, "schema") {
            return Err(invalid(
                path,
                format!("root element {} is not a Schematron schema", element.name),
            ));
        }

        let mut builder = RuleSetBuilder {
            chain,
            abstract_rules: HashMap::new(),
            pending: Vec::new(),
            rule_set: RuleSet {
                source: path.to_path_buf(),
                ..RuleSet::default()
            },
        };
        let file = SourceFile {
            document: &document,
            path,
            depth: 0,
        };
        for child in file.child_elements(root) {
            builder.schema_child(&file, child)?;
        }
        builder.finish()
    }

    pub fn rule_count(&self) -> usize {
        self.patterns.iter().map(|p| p.rules.len()).sum()
    }
}

fn invalid(path: &Path, details: impl Into<String>) -> ValidationError {
    ValidationError::InvalidRuleSet {
        path: path.to_path_buf(),
        details: details.into(),
    }
}

fn is_schematron(element: &Element, local: &str) -> bool {
    element.name.local == local
        && matches!(
            element.namespace.as_deref(),
            Some(SCHEMATRON_NAMESPACE) | Some(LEGACY_SCHEMATRON_NAMESPACE)
        )
}

fn attribute<'e>(element: &'e Element, name: &str) -> Option<&'e str> {
    element
        .attributes
        .iter()
        .find(|a| a.name.prefix.is_none() && a.name.local == name)
        .map(|a| a.value.as_str())
}

fn language(element: &Element) -> Option<String> {
    element
        .attributes
        .iter()
        .find(|a| a.name.prefix.as_deref() == Some("xml") && a.name.local == "lang")
        .map(|a| a.value.clone())
}

/// One rule file being walked, the main one or an included one
struct SourceFile<'d> {
    document: &'d LineAnnotatedDocument,
    path: &'d Path,
    depth: usize,
}

impl<'d> SourceFile<'d> {
    fn element(&self, id: NodeId) -> Option<&'d Element> {
        self.document.element(id)
    }

    fn child_elements(&self, id: NodeId) -> Vec<NodeId> {
        self.document
            .children(id)
            .iter()
            .copied()
            .filter(|child| self.document.is_element(*child))
            .collect()
    }

    fn compile(&self, source: &str, line: usize) -> Result<XPath> {
        XPath::compile(source).map_err(|e| invalid(self.path, format!("line {}: {}", line, e)))
    }

    fn compile_pattern(&self, source: &str, line: usize) -> Result<XPath> {
        XPath::compile_pattern(source)
            .map_err(|e| invalid(self.path, format!("line {}: {}", line, e)))
    }

    fn required<'e>(&self, element: &'e Element, name: &str, line: usize) -> Result<&'e str> {
        attribute(element, name).ok_or_else(|| {
            invalid(
                self.path,
                format!("line {}: {} without {}", line, element.name, name),
            )
        })
    }
}

/// A concrete rule whose `extends` references are resolved once all abstract rules are known
struct PendingRule {
    pattern: usize,
    rule: Rule,
    extends: Vec<String>,
    path: PathBuf,
}

struct RuleSetBuilder<'c> {
    chain: &'c ResourceChain,
    abstract_rules: HashMap<String, (Vec<Let>, Vec<Check>)>,
    pending: Vec<PendingRule>,
    rule_set: RuleSet,
}

/// Where an included fragment lands
#[derive(Clone, Copy)]
enum Scope {
    Schema,
    Pattern(usize),
}

impl RuleSetBuilder<'_> {
    fn schema_child(&mut self, file: &SourceFile<'_>, id: NodeId) -> Result<()> {
        let Some(element) = file.element(id) else {
            return Ok(());
        };
        let line = file.document.line(id);
        if is_schematron(element, "ns") {
            let prefix = file.required(element, "prefix", line)?;
            let uri = file.required(element, "uri", line)?;
            self.rule_set
                .namespaces
                .push((prefix.to_string(), uri.to_string()));
        } else if is_schematron(element, "let") {
            let value = self.parse_let(file, element, line)?;
            self.rule_set.lets.push(value);
        } else if is_schematron(element, "pattern") {
            self.pattern(file, id)?;
        } else if is_schematron(element, "diagnostics") {
            for child in file.child_elements(id) {
                self.diagnostic(file, child)?;
            }
        } else if is_schematron(element, "include") {
            self.include(file, element, line, Scope::Schema)?;
        }
        Ok(())
    }

    fn pattern(&mut self, file: &SourceFile<'_>, id: NodeId) -> Result<()> {
        let Some(element) = file.element(id) else {
            return Ok(());
        };
        let line = file.document.line(id);
        if attribute(element, "abstract") == Some("true") || attribute(element, "is-a").is_some() {
            return Err(invalid(
                file.path,
                format!("line {}: abstract patterns are not supported", line),
            ));
        }
        self.rule_set.patterns.push(Pattern {
            id: attribute(element, "id").map(str::to_string),
            ..Pattern::default()
        });
        let index = self.rule_set.patterns.len() - 1;
        for child in file.child_elements(id) {
            self.pattern_child(file, child, index)?;
        }
        Ok(())
    }

    fn pattern_child(&mut self, file: &SourceFile<'_>, id: NodeId, pattern: usize) -> Result<()> {
        let Some(element) = file.element(id) else {
            return Ok(());
        };
        let line = file.document.line(id);
        if is_schematron(element, "let") {
            let value = self.parse_let(file, element, line)?;
            self.rule_set.patterns[pattern].lets.push(value);
        } else if is_schematron(element, "rule") {
            self.rule(file, id, pattern)?;
        } else if is_schematron(element, "include") {
            self.include(file, element, line, Scope::Pattern(pattern))?;
        }
        Ok(())
    }

    fn rule(&mut self, file: &SourceFile<'_>, id: NodeId, pattern: usize) -> Result<()> {
        let Some(element) = file.element(id) else {
            return Ok(());
        };
        let line = file.document.line(id);
        let mut lets = Vec::new();
        let mut checks = Vec::new();
        let mut extends = Vec::new();

        for child in file.child_elements(id) {
            let Some(child_element) = file.element(child) else {
                continue;
            };
            let child_line = file.document.line(child);
            if is_schematron(child_element, "let") {
                lets.push(self.parse_let(file, child_element, child_line)?);
            } else if is_schematron(child_element, "assert") {
                checks.push(self.check(file, child, CheckKind::Assert)?);
            } else if is_schematron(child_element, "report") {
                checks.push(self.check(file, child, CheckKind::Report)?);
            } else if is_schematron(child_element, "extends") {
                extends.push(file.required(child_element, "rule", child_line)?.to_string());
            }
        }

        let rule_id = attribute(element, "id").map(str::to_string);
        if attribute(element, "abstract") == Some("true") {
            let rule_id = rule_id.ok_or_else(|| {
                invalid(file.path, format!("line {}: abstract rule without id", line))
            })?;
            if !extends.is_empty() {
                return Err(invalid(
                    file.path,
                    format!("line {}: abstract rule {} extends another rule", line, rule_id),
                ));
            }
            self.abstract_rules.insert(rule_id, (lets, checks));
            return Ok(());
        }

        let context = file.required(element, "context", line)?;
        let rule = Rule {
            id: rule_id,
            context: file.compile_pattern(context, line)?,
            lets,
            checks,
        };
        self.pending.push(PendingRule {
            pattern,
            rule,
            extends,
            path: file.path.to_path_buf(),
        });
        Ok(())
    }

    fn check(&mut self, file: &SourceFile<'_>, id: NodeId, kind: CheckKind) -> Result<Check> {
        let line = file.document.line(id);
        let element = file
            .element(id)
            .ok_or_else(|| invalid(file.path, format!("line {}: not an element", line)))?;
        let test = file.required(element, "test", line)?;
        Ok(Check {
            kind,
            id: attribute(element, "id").map(str::to_string),
            role: attribute(element, "role").map(str::to_string),
            flag: attribute(element, "flag").map(str::to_string),
            test: file.compile(test, line)?,
            message: self.message(file, id)?,
            diagnostics: attribute(element, "diagnostics")
                .map(|ids| ids.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
        })
    }

    fn diagnostic(&mut self, file: &SourceFile<'_>, id: NodeId) -> Result<()> {
        let Some(element) = file.element(id) else {
            return Ok(());
        };
        if !is_schematron(element, "diagnostic") {
            return Ok(());
        }
        let line = file.document.line(id);
        let diagnostic_id = file.required(element, "id", line)?.to_string();
        let diagnostic = LocalizedDiagnostic {
            id: diagnostic_id.clone(),
            lang: language(element),
            message: self.message(file, id)?,
        };
        self.rule_set.diagnostics.insert(diagnostic_id, diagnostic);
        Ok(())
    }

    fn parse_let(&self, file: &SourceFile<'_>, element: &Element, line: usize) -> Result<Let> {
        let name = file.required(element, "name", line)?;
        let value = file.required(element, "value", line)?;
        Ok(Let {
            name: name.to_string(),
            value: file.compile(value, line)?,
        })
    }

    /// Mixed message content; unknown markup contributes its text
    fn message(&self, file: &SourceFile<'_>, id: NodeId) -> Result<Vec<MessagePart>> {
        let mut parts = Vec::new();
        for child in file.document.children(id) {
            if let Some(text) = file.document.text(*child) {
                parts.push(MessagePart::Text(text.to_string()));
                continue;
            }
            let Some(element) = file.element(*child) else {
                continue;
            };
            let line = file.document.line(*child);
            if is_schematron(element, "value-of") {
                let select = file.required(element, "select", line)?;
                parts.push(MessagePart::ValueOf(file.compile(select, line)?));
            } else if is_schematron(element, "name") {
                let path = attribute(element, "path")
                    .map(|path| file.compile(path, line))
                    .transpose()?;
                parts.push(MessagePart::Name(path));
            } else {
                parts.extend(self.message(file, *child)?);
            }
        }
        Ok(parts)
    }

    fn include(
        &mut self,
        file: &SourceFile<'_>,
        element: &Element,
        line: usize,
        scope: Scope,
    ) -> Result<()> {
        let href = file.required(element, "href", line)?;
        if file.depth >= MAX_INCLUDE_DEPTH {
            return Err(invalid(
                file.path,
                format!("line {}: includes nested too deeply at {}", line, href),
            ));
        }

        let system_id = if is_remote(href) {
            href.to_string()
        } else {
            file.path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(href)
                .to_string_lossy()
                .into_owned()
        };
        let included_path = self
            .chain
            .resolve(&system_id)
            .ok_or(ValidationError::UnresolvedReference { system_id })?;

        let source = std::fs::read(&included_path)?;
        let document = LineAnnotatedDocument::parse(&source)
            .map_err(|e| invalid(&included_path, e.to_string()))?;
        let included = SourceFile {
            document: &document,
            path: &included_path,
            depth: file.depth + 1,
        };
        let root = document.document_element();
        match scope {
            Scope::Schema => self.schema_child(&included, root),
            Scope::Pattern(pattern) => self.pattern_child(&included, root, pattern),
        }
    }

    fn finish(mut self) -> Result<RuleSet> {
        for pending in std::mem::take(&mut self.pending) {
            let PendingRule {
                pattern,
                mut rule,
                extends,
                path,
            } = pending;
            for base in extends {
                let (lets, checks) = self.abstract_rules.get(&base).ok_or_else(|| {
                    invalid(&path, format!("unknown abstract rule {}", base))
                })?;
                rule.lets.extend(lets.iter().cloned());
                rule.checks.extend(checks.iter().cloned());
            }
            self.rule_set.patterns[pattern].rules.push(rule);
        }

        for pattern in &self.rule_set.patterns {
            for rule in &pattern.rules {
                for check in &rule.checks {
                    if let Some(missing) = check
                        .diagnostics
                        .iter()
                        .find(|id| !self.rule_set.diagnostics.contains_key(*id))
                    {
                        return Err(invalid(
                            &self.rule_set.source,
                            format!("unknown diagnostic {}", missing),
                        ));
                    }
                }
            }
        }
        Ok(self.rule_set)
    }
}
