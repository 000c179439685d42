//! Prefix to namespace mapping derived from a document's own declarations

use std::collections::HashMap;

use crate::document::{LineAnnotatedDocument, NodeId};

/// Synthetic prefix under which the default (unprefixed) namespace is registered
pub const DEFAULT_PREFIX: &str = "default";

/// Read-only prefix/URI lookup built from `xmlns` and `xmlns:*` declarations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceResolver {
    prefix_to_uri: HashMap<String, String>,
    uri_to_prefix: HashMap<String, String>,
}

impl NamespaceResolver {
    /// Scan the document element, and all descendants when `recursive` is set
    pub fn from_document(doc: &LineAnnotatedDocument, recursive: bool) -> Self {
        let mut resolver = Self::default();
        resolver.examine(doc, doc.document_element(), recursive);
        resolver
    }

    /// Build from explicit declarations, e.g. the `ns` elements of a rule file
    pub fn from_declarations<'a, I>(declarations: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut resolver = Self::default();
        for (prefix, uri) in declarations {
            resolver.declare(prefix, uri);
        }
        resolver
    }

    fn examine(&mut self, doc: &LineAnnotatedDocument, id: NodeId, recursive: bool) {
        if let Some(element) = doc.element(id) {
            for (prefix, uri) in &element.namespace_declarations {
                match prefix {
                    // First default declaration wins
                    None => {
                        if !self.prefix_to_uri.contains_key(DEFAULT_PREFIX) {
                            self.declare(DEFAULT_PREFIX, uri);
                        }
                    }
                    Some(prefix) => self.declare(prefix, uri),
                }
            }
        }
        if recursive {
            for child in doc.children(id) {
                if doc.is_element(*child) {
                    self.examine(doc, *child, true);
                }
            }
        }
    }

    pub fn declare(&mut self, prefix: &str, uri: &str) {
        self.prefix_to_uri.insert(prefix.to_string(), uri.to_string());
        self.uri_to_prefix.insert(uri.to_string(), prefix.to_string());
    }

    /// URI bound to `prefix`; `None` or an empty prefix yields the default namespace
    pub fn namespace_uri(&self, prefix: Option<&str>) -> Option<&str> {
        match prefix {
            None | Some("") => self.default_namespace(),
            Some(prefix) => self.prefix_to_uri.get(prefix).map(String::as_str),
        }
    }

    pub fn prefix(&self, uri: &str) -> Option<&str> {
        self.uri_to_prefix.get(uri).map(String::as_str)
    }

    pub fn default_namespace(&self) -> Option<&str> {
        self.prefix_to_uri.get(DEFAULT_PREFIX).map(String::as_str)
    }

    pub fn has_default_namespace(&self) -> bool {
        self.prefix_to_uri.contains_key(DEFAULT_PREFIX)
    }

    pub fn is_empty(&self) -> bool {
        self.prefix_to_uri.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_declarations_with_default_prefix() {
        let doc = LineAnnotatedDocument::parse(
            br#"<Invoice xmlns="urn:inv" xmlns:cbc="urn:cbc"><cbc:ID/></Invoice>"#,
        )
        .unwrap();
        let resolver = NamespaceResolver::from_document(&doc, false);

        assert_eq!(resolver.namespace_uri(Some("default")), Some("urn:inv"));
        assert_eq!(resolver.namespace_uri(None), Some("urn:inv"));
        assert_eq!(resolver.namespace_uri(Some("")), Some("urn:inv"));
        assert_eq!(resolver.namespace_uri(Some("cbc")), Some("urn:cbc"));
        assert_eq!(resolver.prefix("urn:cbc"), Some("cbc"));
        assert!(resolver.has_default_namespace());
    }

    #[test]
    fn test_top_level_only_ignores_nested_declarations() {
        let doc =
            LineAnnotatedDocument::parse(br#"<a><b xmlns:x="urn:x" xmlns="urn:b"/></a>"#).unwrap();

        let top = NamespaceResolver::from_document(&doc, false);
        assert!(top.is_empty());
        assert!(!top.has_default_namespace());

        let all = NamespaceResolver::from_document(&doc, true);
        assert_eq!(all.namespace_uri(Some("x")), Some("urn:x"));
        assert_eq!(all.default_namespace(), Some("urn:b"));
    }

    #[test]
    fn test_first_default_namespace_wins() {
        let doc = LineAnnotatedDocument::parse(
            br#"<a xmlns="urn:first"><b xmlns="urn:second"/></a>"#,
        )
        .unwrap();
        let resolver = NamespaceResolver::from_document(&doc, true);
        assert_eq!(resolver.default_namespace(), Some("urn:first"));
    }

    #[test]
    fn test_from_declarations() {
        let resolver =
            NamespaceResolver::from_declarations([("inv", "urn:inv"), ("cac", "urn:cac")]);
        assert_eq!(resolver.namespace_uri(Some("inv")), Some("urn:inv"));
        assert_eq!(resolver.namespace_uri(None), None);
    }
}
