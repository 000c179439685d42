//! Raw rule evaluation over a line-annotated input
//!
//! Within a pattern each node is handled by the first rule whose context matches
//! it; fired rules are then visited in document order. Locations are written the
//! way the raw engine reports them: qualified names with 0-based positions among
//! same-named siblings, which [`crate::location::PathLocationTranslator`] undoes.

use std::collections::HashSet;

use tracing::trace;

use super::rules::{Check, CheckKind, Let, MessagePart, RuleSet};
use super::svrl::{DiagnosticReference, Finding, FindingKind};
use crate::document::LineAnnotatedDocument;
use crate::error::Result;
use crate::namespace::NamespaceResolver;
use crate::xpath::{EvalContext, Variables, XNode};

pub struct RuleEngine<'a> {
    rules: &'a RuleSet,
    document: &'a LineAnnotatedDocument,
    namespaces: NamespaceResolver,
}

impl<'a> RuleEngine<'a> {
    pub fn new(rules: &'a RuleSet, document: &'a LineAnnotatedDocument) -> Self {
        let namespaces = NamespaceResolver::from_declarations(
            rules
                .namespaces
                .iter()
                .map(|(prefix, uri)| (prefix.as_str(), uri.as_str())),
        );
        Self {
            rules,
            document,
            namespaces,
        }
    }

    /// Every failed assertion and successful report, in evaluation order
    pub fn evaluate(&self) -> Result<Vec<Finding>> {
        let empty = Variables::new();
        let base = EvalContext::new(self.document, &self.namespaces, &empty);
        let root = base.root();
        let schema_variables = self.bind(&self.rules.lets, &empty, root)?;

        let mut findings = Vec::new();
        for pattern in &self.rules.patterns {
            let pattern_variables = self.bind(&pattern.lets, &schema_variables, root)?;
            let ctx = base.with_variables(&pattern_variables);

            let mut handled = HashSet::new();
            let mut fired = Vec::new();
            for (index, rule) in pattern.rules.iter().enumerate() {
                for node in rule.context.select(&ctx, root)? {
                    if handled.insert(node) {
                        fired.push((node, index));
                    }
                }
            }
            fired.sort();
            trace!(
                "Pattern {} fired {} rule(s)",
                pattern.id.as_deref().unwrap_or("<anonymous>"),
                fired.len()
            );

            for (node, index) in fired {
                let rule = &pattern.rules[index];
                let rule_variables = self.bind(&rule.lets, &pattern_variables, node)?;
                for check in &rule.checks {
                    if let Some(finding) = self.check(check, node, &rule_variables)? {
                        findings.push(finding);
                    }
                }
            }
        }
        Ok(findings)
    }

    /// Evaluate `lets` in order on top of `outer`; later bindings see earlier ones
    fn bind(&self, lets: &[Let], outer: &Variables, node: XNode) -> Result<Variables> {
        let mut variables = outer.clone();
        for binding in lets {
            let value = {
                let ctx = EvalContext::new(self.document, &self.namespaces, &variables)
                    .with_current(node);
                binding.value.evaluate(&ctx, node)?
            };
            variables.insert(binding.name.clone(), value);
        }
        Ok(variables)
    }

    fn check(&self, check: &Check, node: XNode, variables: &Variables) -> Result<Option<Finding>> {
        let ctx = EvalContext::new(self.document, &self.namespaces, variables).with_current(node);
        let holds = check.test.evaluate_boolean(&ctx, node)?;
        let kind = match (check.kind, holds) {
            (CheckKind::Assert, false) => FindingKind::FailedAssert,
            (CheckKind::Report, true) => FindingKind::SuccessfulReport,
            _ => return Ok(None),
        };

        let mut finding = Finding::new(kind, self.render(&check.message, &ctx, node)?);
        finding.id = check.id.clone();
        finding.flag = check.flag.clone();
        finding.role = check.role.clone();
        finding.test = Some(check.test.source().to_string());
        finding.location = Some(self.location(node));
        for id in &check.diagnostics {
            if let Some(diagnostic) = self.rules.diagnostics.get(id) {
                finding.diagnostics.push(DiagnosticReference {
                    diagnostic: id.clone(),
                    lang: diagnostic.lang.clone(),
                    text: self.render(&diagnostic.message, &ctx, node)?.trim().to_string(),
                });
            }
        }
        Ok(Some(finding))
    }

    fn render(&self, parts: &[MessagePart], ctx: &EvalContext<'_>, node: XNode) -> Result<String> {
        let mut text = String::new();
        for part in parts {
            match part {
                MessagePart::Text(literal) => text.push_str(literal),
                MessagePart::ValueOf(expression) => {
                    text.push_str(&expression.evaluate_string(ctx, node)?)
                }
                MessagePart::Name(None) => {
                    text.push_str(&node.qualified_name(self.document).unwrap_or_default())
                }
                MessagePart::Name(Some(path)) => {
                    if let Some(named) = path.select(ctx, node)?.first() {
                        text.push_str(&named.qualified_name(self.document).unwrap_or_default());
                    }
                }
            }
        }
        Ok(text.trim().to_string())
    }

    /// `/a[0]/b[2]/@c` style path of `node`
    pub fn location(&self, node: XNode) -> String {
        let mut path = self.element_path(node.owner());
        match node {
            XNode::Attribute(..) => {
                if let Some(name) = node.qualified_name(self.document) {
                    path.push_str("/@");
                    path.push_str(&name);
                }
            }
            XNode::Node(id) if !self.document.is_element(id) && self.document.parent(id).is_some() => {
                path.push_str("/text()");
            }
            XNode::Node(_) => {}
        }
        if path.is_empty() { "/".to_string() } else { path }
    }

    fn element_path(&self, id: crate::document::NodeId) -> String {
        let mut steps = Vec::new();
        let mut current = Some(id);
        while let Some(node) = current {
            if let Some(element) = self.document.element(node) {
                let position = self
                    .document
                    .parent(node)
                    .map(|parent| {
                        self.document
                            .children(parent)
                            .iter()
                            .take_while(|sibling| **sibling != node)
                            .filter(|sibling| {
                                self.document
                                    .element(**sibling)
                                    .is_some_and(|other| other.name == element.name)
                            })
                            .count()
                    })
                    .unwrap_or(0);
                steps.push(format!("/{}[{}]", element.name, position));
            }
            current = self.document.parent(node);
        }
        steps.reverse();
        steps.concat()
    }
}
