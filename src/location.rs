//! Mapping rule-engine location paths back to source lines
//!
//! The raw rule engine writes locations with 0-based positions and unprefixed steps
//! for elements in the default namespace. Before such a path can be re-queried
//! against the [`LineAnnotatedDocument`] the positions are shifted to 1-based and,
//! when the document element declares a default namespace, unprefixed steps get
//! the synthetic `default:` prefix. Lookup is best-effort: anything that does not
//! resolve to exactly one node is reported on line 0.

use std::cell::OnceCell;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use tracing::warn;

use crate::document::LineAnnotatedDocument;
use crate::error::Result;
use crate::namespace::{DEFAULT_PREFIX, NamespaceResolver};
use crate::xpath::{EvalContext, Variables, XPath};

/// Name under which the validated input appears in diagnostic locations
pub const INPUT_XML: &str = "XML";

/// `XML:<line>:<column>`
pub fn input_location(line: usize, column: usize) -> String {
    format!("{}:{}:{}", INPUT_XML, line, column)
}

/// How rule-finding locations are rendered into diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocationPolicy {
    /// Report the cleaned path instead of a line number
    pub as_path: bool,
    /// Append `|<path>` to line-number locations
    pub show_paths: bool,
}

fn index_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\[(\d+)\]").expect("valid index pattern"))
}

fn step_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"/[\w-]+:?\(?").expect("valid step pattern"))
}

fn namespace_predicate_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"\[\s*namespace-uri\(\)\s*=\s*(?:'[^\[\]]+'|"[^\[\]]+")\s*\]"#)
            .expect("valid namespace predicate pattern")
    })
}

/// Rewrite every `[N]` to `[N+1]`
pub fn shift_positions(path: &str) -> String {
    index_pattern()
        .replace_all(path, |caps: &Captures<'_>| match caps[1].parse::<u64>() {
            Ok(index) => format!("[{}]", index + 1),
            Err(_) => caps[0].to_string(),
        })
        .into_owned()
}

/// Drop `*:` wildcards and `[namespace-uri()='...']` predicates
pub fn presentation_path(path: &str) -> String {
    let without_wildcards = path.replace("*:", "");
    namespace_predicate_pattern()
        .replace_all(&without_wildcards, "")
        .into_owned()
}

/// `text()`, `node()` and the other node-type tests, which take no prefix
fn is_node_type_test(step: &str) -> bool {
    step.split('[').next().is_some_and(|test| test.contains('('))
}

/// Prefix every unprefixed element step with `*:`; `None` when nothing changed
fn wildcard_path(path: &str) -> Option<String> {
    let mut changed = false;
    let steps: Vec<String> = path
        .split('/')
        .map(|step| {
            if step.is_empty()
                || step.contains(':')
                || step.starts_with('@')
                || step == "."
                || is_node_type_test(step)
            {
                step.to_string()
            } else {
                changed = true;
                format!("*:{}", step)
            }
        })
        .collect();
    changed.then(|| steps.join("/"))
}

/// Per-document translator; namespace information is computed on first use
pub struct PathLocationTranslator<'a> {
    document: &'a LineAnnotatedDocument,
    rewrite_engine_paths: bool,
    namespaces: OnceCell<NamespaceResolver>,
    has_default_namespace: OnceCell<bool>,
}

impl<'a> PathLocationTranslator<'a> {
    /// `rewrite_engine_paths` is set for paths written by the raw rule engine;
    /// compiled stylesheets already produce standard 1-based paths
    pub fn new(document: &'a LineAnnotatedDocument, rewrite_engine_paths: bool) -> Self {
        Self {
            document,
            rewrite_engine_paths,
            namespaces: OnceCell::new(),
            has_default_namespace: OnceCell::new(),
        }
    }

    fn namespaces(&self) -> &NamespaceResolver {
        self.namespaces
            .get_or_init(|| NamespaceResolver::from_document(self.document, false))
    }

    fn has_default_namespace(&self) -> bool {
        *self.has_default_namespace.get_or_init(|| {
            self.document
                .element(self.document.document_element())
                .map(|root| {
                    root.namespace_declarations
                        .iter()
                        .any(|(prefix, _)| prefix.is_none())
                })
                .unwrap_or(false)
        })
    }

    pub fn translate(&self, raw: &str, for_line_lookup: bool) -> String {
        if !self.rewrite_engine_paths {
            return raw.to_string();
        }
        let shifted = shift_positions(raw);
        if for_line_lookup && self.has_default_namespace() {
            step_pattern()
                .replace_all(&shifted, |caps: &Captures<'_>| {
                    let step = &caps[0];
                    if step.contains(':') || step.ends_with('(') {
                        step.to_string()
                    } else {
                        format!("/{}:{}", DEFAULT_PREFIX, &step[1..])
                    }
                })
                .into_owned()
        } else {
            shifted
        }
    }

    /// Source line of the node `raw` designates, or 0 when it cannot be pinned down
    pub fn line_of(&self, raw: &str) -> usize {
        let query = self.translate(raw, true);
        match self.unique_line(&query) {
            Ok(Some(line)) => return line,
            Ok(None) => {}
            Err(e) => warn!("Unable to locate line for `{}` (`{}`): {}", raw, query, e),
        }

        if let Some(retry) = wildcard_path(&self.translate(raw, false)) {
            match self.unique_line(&retry) {
                Ok(Some(line)) => return line,
                Ok(None) => {}
                Err(e) => warn!("Unable to locate line for `{}` (`{}`): {}", raw, retry, e),
            }
        }
        warn!("No unique node for location `{}`, reporting line 0", raw);
        0
    }

    fn unique_line(&self, query: &str) -> Result<Option<usize>> {
        let expression = XPath::compile(query)?;
        let variables = Variables::new();
        let ctx = EvalContext::new(self.document, self.namespaces(), &variables);
        let nodes = expression.select(&ctx, ctx.root())?;
        Ok(match nodes.as_slice() {
            [node] => Some(node.line(self.document)),
            _ => None,
        })
    }

    /// Render a finding's location according to `policy`
    pub fn render(&self, raw: &str, policy: LocationPolicy) -> String {
        let display = presentation_path(&self.translate(raw, false));
        if policy.as_path {
            return display;
        }
        let line = self.line_of(raw);
        if policy.show_paths {
            format!("{}|{}", input_location(line, 0), display)
        } else {
            input_location(line, 0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVOICE: &str = r#"<Invoice xmlns="urn:inv" xmlns:cac="urn:cac">
  <Line>
    <cac:Item/>
  </Line>
  <Line>
    <cac:Item/>
    <cac:Item code="x"/>
  </Line>
</Invoice>"#;

    fn invoice() -> LineAnnotatedDocument {
        LineAnnotatedDocument::parse(INVOICE.as_bytes()).unwrap()
    }

    #[test]
    fn test_positions_shift_by_one() {
        assert_eq!(shift_positions("/a[0]"), "/a[1]");
        assert_eq!(shift_positions("/a[5]/b[0]"), "/a[6]/b[1]");
        assert_eq!(shift_positions("/a[@x='[1]']"), "/a[@x='[2]']");
        assert_eq!(shift_positions("/a"), "/a");
    }

    #[test]
    fn test_default_namespace_steps_get_prefix() {
        let doc = invoice();
        let translator = PathLocationTranslator::new(&doc, true);
        assert_eq!(
            translator.translate("/Invoice/Line", true),
            "/default:Invoice/default:Line"
        );
        assert_eq!(
            translator.translate("/Invoice[0]/cac:Item[2]/@code", true),
            "/default:Invoice[1]/cac:Item[3]/@code"
        );
        // display paths only get the position shift
        assert_eq!(translator.translate("/Invoice[0]/Line[1]", false), "/Invoice[1]/Line[2]");
    }

    #[test]
    fn test_no_default_namespace_leaves_steps_alone() {
        let doc = LineAnnotatedDocument::parse(b"<Invoice><Line/></Invoice>").unwrap();
        let translator = PathLocationTranslator::new(&doc, true);
        assert_eq!(translator.translate("/Invoice/Line", true), "/Invoice/Line");
    }

    #[test]
    fn test_stylesheet_paths_are_not_rewritten() {
        let doc = invoice();
        let translator = PathLocationTranslator::new(&doc, false);
        let path = "/*:Invoice[namespace-uri()='urn:inv'][1]/*:Line[namespace-uri()='urn:inv'][2]";
        assert_eq!(translator.translate(path, true), path);
        assert_eq!(translator.line_of(path), 5);
        assert_eq!(presentation_path(path), "/Invoice[1]/Line[2]");
    }

    #[test]
    fn test_engine_path_resolves_to_line() {
        let doc = invoice();
        let translator = PathLocationTranslator::new(&doc, true);
        assert_eq!(translator.line_of("/Invoice[0]/Line[1]/cac:Item[1]"), 7);
        assert_eq!(translator.line_of("/Invoice[0]/Line[1]/cac:Item[1]/@code"), 7);
        assert_eq!(translator.line_of("/Invoice[0]"), 1);
    }

    #[test]
    fn test_ambiguous_or_missing_paths_degrade_to_zero() {
        let doc = invoice();
        let translator = PathLocationTranslator::new(&doc, true);
        assert_eq!(translator.line_of("/Invoice/Line"), 0);
        assert_eq!(translator.line_of("/Invoice[0]/Missing[0]"), 0);
        assert_eq!(translator.line_of("/Invoice[0]/zz:Line[0]"), 0);
        assert_eq!(translator.line_of("not a path ]["), 0);
    }

    #[test]
    fn test_wildcard_retry() {
        // Declared default namespace below the root: the `default:` rewrite does not apply
        let doc = LineAnnotatedDocument::parse(b"<a>\n<b xmlns=\"urn:b\">\n<c/></b></a>").unwrap();
        let translator = PathLocationTranslator::new(&doc, true);
        assert_eq!(translator.line_of("/a[0]/b[0]/c[0]"), 3);
        assert_eq!(wildcard_path("/a/p:b/@id"), Some("/*:a/p:b/@id".to_string()));
        assert_eq!(wildcard_path("/p:a"), None);
        assert_eq!(
            wildcard_path("/a[1]/b[1]/text()"),
            Some("/*:a[1]/*:b[1]/text()".to_string())
        );
        assert_eq!(wildcard_path("/p:a/node()"), None);
    }

    #[test]
    fn test_node_type_steps_keep_no_prefix() {
        let doc = invoice();
        let translator = PathLocationTranslator::new(&doc, true);
        assert_eq!(
            translator.translate("/Invoice[0]/Line[0]/text()", true),
            "/default:Invoice[1]/default:Line[1]/text()"
        );
        assert_eq!(
            translator.translate("/Invoice[0]/processing-instruction('x')", true),
            "/default:Invoice[1]/processing-instruction('x')"
        );

        let doc =
            LineAnnotatedDocument::parse(b"<a xmlns=\"urn:x\">\n  <b>hello</b>\n</a>").unwrap();
        let translator = PathLocationTranslator::new(&doc, true);
        assert_eq!(translator.line_of("/a[0]/b[0]/text()"), 2);
    }

    #[test]
    fn test_render_follows_policy() {
        let doc = invoice();
        let translator = PathLocationTranslator::new(&doc, true);
        let raw = "/Invoice[0]/Line[1]";

        assert_eq!(translator.render(raw, LocationPolicy::default()), "XML:5:0");
        assert_eq!(
            translator.render(
                raw,
                LocationPolicy {
                    as_path: false,
                    show_paths: true
                }
            ),
            "XML:5:0|/Invoice[1]/Line[2]"
        );
        assert_eq!(
            translator.render(
                raw,
                LocationPolicy {
                    as_path: true,
                    show_paths: true
                }
            ),
            "/Invoice[1]/Line[2]"
        );
    }
}
