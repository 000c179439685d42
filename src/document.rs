//! Line-annotated document model
//!
//! Parses raw XML into an arena of nodes where every element remembers the source
//! line of its start tag. Node ids are assigned in document order, which the path
//! evaluator relies on for sorting and axis traversal.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use encoding_rs::{Encoding, UTF_8};
use quick_xml::Reader;
use quick_xml::escape::unescape_with;
use quick_xml::events::{BytesStart, Event};
use regex::Regex;

use crate::error::{Result, ValidationError};

pub const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

/// Index of a node inside a [`LineAnnotatedDocument`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A possibly prefixed name exactly as written in the source
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QName {
    pub prefix: Option<String>,
    pub local: String,
}

impl QName {
    pub fn parse(raw: &str) -> Self {
        match raw.split_once(':') {
            Some((prefix, local)) => QName {
                prefix: Some(prefix.to_string()),
                local: local.to_string(),
            },
            None => QName {
                prefix: None,
                local: raw.to_string(),
            },
        }
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.prefix {
            Some(prefix) => write!(f, "{}:{}", prefix, self.local),
            None => f.write_str(&self.local),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: QName,
    pub namespace: Option<String>,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: QName,
    /// Namespace URI the element name resolves to, if any
    pub namespace: Option<String>,
    pub attributes: Vec<Attribute>,
    /// `xmlns` / `xmlns:p` declarations made on this element, in source order
    pub namespace_declarations: Vec<(Option<String>, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Document,
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// 1-based source line; 0 for the document node
    pub line: usize,
    last_descendant: usize,
}

/// Immutable tree mirroring the input, with line numbers on every element
#[derive(Debug, Clone)]
pub struct LineAnnotatedDocument {
    nodes: Vec<Node>,
    document_element: NodeId,
}

impl LineAnnotatedDocument {
    /// Parse raw bytes, failing with `MalformedInput` if they are not well-formed XML
    pub fn parse(input: &[u8]) -> Result<Self> {
        LineAnnotatedParser::new().parse(input)
    }

    pub fn document(&self) -> NodeId {
        NodeId(0)
    }

    pub fn document_element(&self) -> NodeId {
        self.document_element
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn element(&self, id: NodeId) -> Option<&Element> {
        match &self.nodes[id.0].kind {
            NodeKind::Element(element) => Some(element),
            _ => None,
        }
    }

    pub fn text(&self, id: NodeId) -> Option<&str> {
        match &self.nodes[id.0].kind {
            NodeKind::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    pub fn line(&self, id: NodeId) -> usize {
        self.nodes[id.0].line
    }

    /// All nodes strictly inside the subtree of `id`, in document order
    pub fn descendants(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        (id.0 + 1..=self.nodes[id.0].last_descendant).map(NodeId)
    }

    /// Nodes after the end of the subtree of `id`, in document order
    pub fn following(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        (self.nodes[id.0].last_descendant + 1..self.nodes.len()).map(NodeId)
    }

    /// Nodes before `id` that are not its ancestors, in document order
    pub fn preceding(&self, id: NodeId) -> Vec<NodeId> {
        let ancestors: Vec<NodeId> = self.ancestors(id).collect();
        (1..id.0)
            .map(NodeId)
            .filter(|candidate| !ancestors.contains(candidate))
            .collect()
    }

    /// Parent chain from the direct parent up to the document node
    pub fn ancestors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(self.parent(id), move |current| self.parent(*current))
    }

    pub fn is_element(&self, id: NodeId) -> bool {
        matches!(self.nodes[id.0].kind, NodeKind::Element(_))
    }

    /// Concatenated text of all descendant text nodes
    pub fn string_value(&self, id: NodeId) -> String {
        match &self.nodes[id.0].kind {
            NodeKind::Text(text) => text.clone(),
            _ => self
                .descendants(id)
                .filter_map(|descendant| self.text(descendant))
                .collect(),
        }
    }
}

/// Streaming builder that reconstructs the tree with an explicit element stack
#[derive(Debug, Default)]
pub struct LineAnnotatedParser {
    nodes: Vec<Node>,
    stack: Vec<OpenElement>,
    scopes: Vec<(Option<String>, String)>,
    pending_text: String,
    pending_line: usize,
    document_element: Option<NodeId>,
}

#[derive(Debug)]
struct OpenElement {
    id: NodeId,
    scope_len: usize,
}

/// Converts byte offsets into 1-based line numbers, scanning forward only once
struct LineTracker<'a> {
    input: &'a [u8],
    offset: usize,
    line: usize,
}

impl<'a> LineTracker<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            offset: 0,
            line: 1,
        }
    }

    fn line_at(&mut self, position: usize) -> usize {
        let end = position.min(self.input.len());
        if end > self.offset {
            self.line += self.input[self.offset..end]
                .iter()
                .filter(|b| **b == b'\n')
                .count();
            self.offset = end;
        }
        self.line
    }
}

/// Decodes the raw input using its byte order mark or the encoding named in
/// the XML declaration, falling back to UTF-8
fn decode_input(input: &[u8]) -> Result<Cow<'_, str>> {
    let (encoding, bom_length) = match Encoding::for_bom(input) {
        Some(found) => found,
        None => (declared_encoding(input)?, 0),
    };
    let (text, had_errors) = encoding.decode_without_bom_handling(&input[bom_length..]);
    if had_errors {
        return Err(ValidationError::MalformedInput {
            line: 1,
            details: format!("input is not valid {}", encoding.name()),
        });
    }
    Ok(text)
}

fn declared_encoding(input: &[u8]) -> Result<&'static Encoding> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r#"^\s*<\?xml\s[^>]*?\bencoding\s*=\s*["']([A-Za-z0-9._:-]+)["']"#)
            .expect("valid declaration pattern")
    });

    let head = String::from_utf8_lossy(&input[..input.len().min(256)]);
    match pattern.captures(&head) {
        Some(captures) => Encoding::for_label(captures[1].as_bytes()).ok_or_else(|| {
            ValidationError::MalformedInput {
                line: 1,
                details: format!("unsupported encoding `{}`", &captures[1]),
            }
        }),
        None => Ok(UTF_8),
    }
}

/// Collects the internal general entities of a DOCTYPE. Parameter and
/// external entities are skipped; the first declaration of a name wins.
fn declare_entities(doctype: &str, entities: &mut HashMap<String, String>) {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r#"<!ENTITY\s+([^\s%"'>]+)\s+(?:"([^"]*)"|'([^']*)')\s*>"#)
            .expect("valid entity pattern")
    });

    for captures in pattern.captures_iter(doctype) {
        let name = captures[1].to_string();
        if entities.contains_key(&name) {
            continue;
        }
        let raw = captures
            .get(2)
            .or_else(|| captures.get(3))
            .map(|value| value.as_str())
            .unwrap_or_default();
        let value = unescape_with(raw, |reference| entities.get(reference).map(String::as_str))
            .map(Cow::into_owned)
            .unwrap_or_else(|_| raw.to_string());
        entities.insert(name, value);
    }
}

impl LineAnnotatedParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(mut self, input: &[u8]) -> Result<LineAnnotatedDocument> {
        let source = decode_input(input)?;
        let mut entities = HashMap::new();

        let mut reader = Reader::from_str(&source);
        reader.trim_text(false);
        reader.check_end_names(true);
        let mut lines = LineTracker::new(source.as_bytes());

        self.nodes.push(Node {
            kind: NodeKind::Document,
            parent: None,
            children: Vec::new(),
            line: 0,
            last_descendant: 0,
        });

        loop {
            let event = match reader.read_event() {
                Ok(event) => event,
                Err(e) => {
                    return Err(ValidationError::MalformedInput {
                        line: lines.line_at(reader.buffer_position()),
                        details: e.to_string(),
                    });
                }
            };
            let line = lines.line_at(reader.buffer_position());

            match event {
                Event::Start(start) => self.start_element(&start, &entities, line)?,
                Event::Empty(start) => {
                    self.start_element(&start, &entities, line)?;
                    self.end_element(line)?;
                }
                Event::End(_) => self.end_element(line)?,
                Event::DocType(doctype) => {
                    declare_entities(&String::from_utf8_lossy(&doctype), &mut entities)
                }
                Event::Text(text) => {
                    let unescaped = text
                        .unescape_with(|name| entities.get(name).map(String::as_str))
                        .map_err(|e| ValidationError::MalformedInput {
                            line,
                            details: e.to_string(),
                        })?;
                    self.push_text(&unescaped, line)?;
                }
                Event::CData(cdata) => {
                    let raw = cdata.into_inner();
                    self.push_text(&String::from_utf8_lossy(&raw), line)?;
                }
                Event::Eof => break,
                _ => {}
            }
        }

        self.finish(lines.line)
    }

    fn start_element(
        &mut self,
        start: &BytesStart<'_>,
        entities: &HashMap<String, String>,
        line: usize,
    ) -> Result<()> {
        if self.stack.is_empty() && self.document_element.is_some() {
            return Err(ValidationError::MalformedInput {
                line,
                details: "content after the document element".to_string(),
            });
        }
        self.flush_text();

        let scope_len = self.scopes.len();
        let name = QName::parse(&String::from_utf8_lossy(start.name().as_ref()));
        let mut declarations = Vec::new();
        let mut raw_attributes = Vec::new();

        for attribute in start.attributes() {
            let attribute = attribute.map_err(|e| ValidationError::MalformedInput {
                line,
                details: e.to_string(),
            })?;
            let key = String::from_utf8_lossy(attribute.key.as_ref()).to_string();
            let value = attribute
                .unescape_value_with(|name| entities.get(name).map(String::as_str))
                .map_err(|e| ValidationError::MalformedInput {
                    line,
                    details: e.to_string(),
                })?
                .to_string();

            if key == "xmlns" {
                declarations.push((None, value));
            } else if let Some(prefix) = key.strip_prefix("xmlns:") {
                declarations.push((Some(prefix.to_string()), value));
            } else {
                raw_attributes.push((QName::parse(&key), value));
            }
        }

        self.scopes.extend(declarations.iter().cloned());

        let namespace = self.resolve_prefix(name.prefix.as_deref(), true, line)?;
        let mut attributes = Vec::with_capacity(raw_attributes.len());
        for (attribute_name, value) in raw_attributes {
            let attribute_namespace =
                self.resolve_prefix(attribute_name.prefix.as_deref(), false, line)?;
            attributes.push(Attribute {
                name: attribute_name,
                namespace: attribute_namespace,
                value,
            });
        }

        let parent = self.stack.last().map(|open| open.id).unwrap_or(NodeId(0));
        let id = self.push_node(
            NodeKind::Element(Element {
                name,
                namespace,
                attributes,
                namespace_declarations: declarations,
            }),
            parent,
            line,
        );
        self.stack.push(OpenElement { id, scope_len });
        Ok(())
    }

    fn end_element(&mut self, line: usize) -> Result<()> {
        self.flush_text();
        let open = self.stack.pop().ok_or_else(|| ValidationError::MalformedInput {
            line,
            details: "end tag without a matching start tag".to_string(),
        })?;
        self.scopes.truncate(open.scope_len);
        self.nodes[open.id.0].last_descendant = self.nodes.len() - 1;

        if self.stack.is_empty() {
            self.document_element = Some(open.id);
        }
        Ok(())
    }

    fn push_text(&mut self, text: &str, line: usize) -> Result<()> {
        if self.stack.is_empty() {
            if text.trim().is_empty() {
                return Ok(());
            }
            return Err(ValidationError::MalformedInput {
                line,
                details: "character data outside the document element".to_string(),
            });
        }
        if self.pending_text.is_empty() {
            self.pending_line = line;
        }
        self.pending_text.push_str(text);
        Ok(())
    }

    fn flush_text(&mut self) {
        if self.pending_text.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.pending_text);
        if let Some(parent) = self.stack.last().map(|open| open.id) {
            let line = self.pending_line;
            self.push_node(NodeKind::Text(text), parent, line);
        }
    }

    fn push_node(&mut self, kind: NodeKind, parent: NodeId, line: usize) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            kind,
            parent: Some(parent),
            children: Vec::new(),
            line,
            last_descendant: id.0,
        });
        self.nodes[parent.0].children.push(id);
        id
    }

    fn resolve_prefix(
        &self,
        prefix: Option<&str>,
        use_default: bool,
        line: usize,
    ) -> Result<Option<String>> {
        match prefix {
            Some("xml") => Ok(Some(XML_NAMESPACE.to_string())),
            Some(prefix) => self
                .scopes
                .iter()
                .rev()
                .find(|(declared, _)| declared.as_deref() == Some(prefix))
                .map(|(_, uri)| Some(uri.clone()))
                .ok_or_else(|| ValidationError::MalformedInput {
                    line,
                    details: format!("namespace prefix `{}` is not bound", prefix),
                }),
            None if use_default => Ok(self
                .scopes
                .iter()
                .rev()
                .find(|(declared, _)| declared.is_none())
                .map(|(_, uri)| uri.clone())
                .filter(|uri| !uri.is_empty())),
            None => Ok(None),
        }
    }

    fn finish(mut self, last_line: usize) -> Result<LineAnnotatedDocument> {
        if let Some(open) = self.stack.last() {
            let name = self
                .element_name(open.id)
                .unwrap_or_else(|| "element".to_string());
            return Err(ValidationError::MalformedInput {
                line: last_line,
                details: format!("unexpected end of input, `{}` is not closed", name),
            });
        }
        let document_element = self
            .document_element
            .ok_or_else(|| ValidationError::MalformedInput {
                line: last_line,
                details: "no document element".to_string(),
            })?;
        self.nodes[0].last_descendant = self.nodes.len() - 1;

        Ok(LineAnnotatedDocument {
            nodes: self.nodes,
            document_element,
        })
    }

    fn element_name(&self, id: NodeId) -> Option<String> {
        match &self.nodes[id.0].kind {
            NodeKind::Element(element) => Some(element.name.to_string()),
            _ => None,
        }
    }
}
