//! XPath evaluation over a [`LineAnnotatedDocument`]

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use regex::RegexBuilder;

use super::parser::{ArithmeticOp, Axis, CompareOp, Expr, NodeTest, PathExpr, Step};
use crate::document::{LineAnnotatedDocument, NodeId, NodeKind, XML_NAMESPACE};
use crate::namespace::NamespaceResolver;

/// A node as seen by the evaluator: a tree node or one attribute of an element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XNode {
    Node(NodeId),
    Attribute(NodeId, usize),
}

impl XNode {
    /// Attributes sort directly after their owner element and before its children
    fn order_key(self) -> (usize, usize) {
        match self {
            XNode::Node(id) => (id.index(), 0),
            XNode::Attribute(owner, index) => (owner.index(), index + 1),
        }
    }

    /// The tree node itself, or the element owning an attribute
    pub fn owner(self) -> NodeId {
        match self {
            XNode::Node(id) | XNode::Attribute(id, _) => id,
        }
    }

    pub fn string_value(self, doc: &LineAnnotatedDocument) -> String {
        match self {
            XNode::Node(id) => doc.string_value(id),
            XNode::Attribute(owner, index) => doc
                .element(owner)
                .and_then(|element| element.attributes.get(index))
                .map(|attribute| attribute.value.clone())
                .unwrap_or_default(),
        }
    }

    /// Name as written in the source; `None` for document and text nodes
    pub fn qualified_name(self, doc: &LineAnnotatedDocument) -> Option<String> {
        match self {
            XNode::Node(id) => doc.element(id).map(|element| element.name.to_string()),
            XNode::Attribute(owner, index) => doc
                .element(owner)
                .and_then(|element| element.attributes.get(index))
                .map(|attribute| attribute.name.to_string()),
        }
    }

    pub fn local_name(self, doc: &LineAnnotatedDocument) -> Option<String> {
        match self {
            XNode::Node(id) => doc.element(id).map(|element| element.name.local.clone()),
            XNode::Attribute(owner, index) => doc
                .element(owner)
                .and_then(|element| element.attributes.get(index))
                .map(|attribute| attribute.name.local.clone()),
        }
    }

    pub fn namespace_uri(self, doc: &LineAnnotatedDocument) -> Option<String> {
        match self {
            XNode::Node(id) => doc.element(id).and_then(|element| element.namespace.clone()),
            XNode::Attribute(owner, index) => doc
                .element(owner)
                .and_then(|element| element.attributes.get(index))
                .and_then(|attribute| attribute.namespace.clone()),
        }
    }

    /// Source line of the node, or of the owning element for attributes
    pub fn line(self, doc: &LineAnnotatedDocument) -> usize {
        doc.line(self.owner())
    }
}

impl Ord for XNode {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order_key().cmp(&other.order_key())
    }
}

impl PartialOrd for XNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    NodeSet(Vec<XNode>),
    String(String),
    Number(f64),
    Boolean(bool),
}

impl Value {
    pub fn to_boolean(&self) -> bool {
        match self {
            Value::NodeSet(nodes) => !nodes.is_empty(),
            Value::String(s) => !s.is_empty(),
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Boolean(b) => *b,
        }
    }
}

pub type Variables = HashMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalError {
    pub message: String,
}

impl EvalError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for EvalError {}

type EvalResult<T> = std::result::Result<T, EvalError>;

#[derive(Debug, Clone, Copy)]
struct Focus {
    node: XNode,
    position: usize,
    size: usize,
}

/// Everything an expression can see besides its context node
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub document: &'a LineAnnotatedDocument,
    pub namespaces: &'a NamespaceResolver,
    pub variables: &'a Variables,
    /// Node returned by `current()`
    pub current: XNode,
}

impl<'a> EvalContext<'a> {
    pub fn new(
        document: &'a LineAnnotatedDocument,
        namespaces: &'a NamespaceResolver,
        variables: &'a Variables,
    ) -> Self {
        Self {
            document,
            namespaces,
            variables,
            current: XNode::Node(document.document()),
        }
    }

    pub fn root(&self) -> XNode {
        XNode::Node(self.document.document())
    }

    pub fn with_current(self, current: XNode) -> Self {
        Self { current, ..self }
    }

    pub fn with_variables(self, variables: &'a Variables) -> Self {
        Self { variables, ..self }
    }

    pub fn evaluate(&self, expr: &Expr, node: XNode) -> EvalResult<Value> {
        self.eval(
            expr,
            &Focus {
                node,
                position: 1,
                size: 1,
            },
        )
    }

    pub fn string(&self, value: &Value) -> String {
        match value {
            Value::NodeSet(nodes) => nodes
                .first()
                .map(|node| node.string_value(self.document))
                .unwrap_or_default(),
            Value::String(s) => s.clone(),
            Value::Number(n) => number_to_string(*n),
            Value::Boolean(b) => b.to_string(),
        }
    }

    pub fn number(&self, value: &Value) -> f64 {
        match value {
            Value::Number(n) => *n,
            Value::Boolean(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            other => string_to_number(&self.string(other)),
        }
    }

    fn eval(&self, expr: &Expr, focus: &Focus) -> EvalResult<Value> {
        match expr {
            Expr::Or(left, right) => Ok(Value::Boolean(
                self.eval(left, focus)?.to_boolean() || self.eval(right, focus)?.to_boolean(),
            )),
            Expr::And(left, right) => Ok(Value::Boolean(
                self.eval(left, focus)?.to_boolean() && self.eval(right, focus)?.to_boolean(),
            )),
            Expr::Compare(op, left, right) => {
                let left = self.eval(left, focus)?;
                let right = self.eval(right, focus)?;
                Ok(Value::Boolean(self.compare(*op, &left, &right)))
            }
            Expr::Arithmetic(op, left, right) => {
                let left = self.number(&self.eval(left, focus)?);
                let right = self.number(&self.eval(right, focus)?);
                Ok(Value::Number(match op {
                    ArithmeticOp::Add => left + right,
                    ArithmeticOp::Subtract => left - right,
                    ArithmeticOp::Multiply => left * right,
                    ArithmeticOp::Divide => left / right,
                    ArithmeticOp::Modulo => left % right,
                }))
            }
            Expr::Negate(operand) => Ok(Value::Number(-self.number(&self.eval(operand, focus)?))),
            Expr::Union(left, right) => {
                let mut nodes = self.node_set(self.eval(left, focus)?, "|")?;
                nodes.extend(self.node_set(self.eval(right, focus)?, "|")?);
                Ok(Value::NodeSet(sort_unique(nodes)))
            }
            Expr::Path(path) => Ok(Value::NodeSet(self.eval_path(path, focus)?)),
            Expr::Filter {
                primary,
                predicates,
                steps,
            } => {
                let nodes = self.node_set(self.eval(primary, focus)?, "a predicate or path step")?;
                let nodes = self.apply_predicates(nodes, predicates)?;
                Ok(Value::NodeSet(self.apply_steps(nodes, steps)?))
            }
            Expr::Literal(value) => Ok(Value::String(value.clone())),
            Expr::Number(value) => Ok(Value::Number(*value)),
            Expr::Variable(name) => self
                .variables
                .get(name)
                .cloned()
                .ok_or_else(|| EvalError::new(format!("variable `${}` is not bound", name))),
            Expr::Function { name, args } => self.call(name, args, focus),
        }
    }

    fn node_set(&self, value: Value, operation: &str) -> EvalResult<Vec<XNode>> {
        match value {
            Value::NodeSet(nodes) => Ok(nodes),
            _ => Err(EvalError::new(format!(
                "{} requires a node-set operand",
                operation
            ))),
        }
    }

    fn eval_path(&self, path: &PathExpr, focus: &Focus) -> EvalResult<Vec<XNode>> {
        let start = if path.absolute {
            self.root()
        } else {
            focus.node
        };
        self.apply_steps(vec![start], &path.steps)
    }

    fn apply_steps(&self, mut nodes: Vec<XNode>, steps: &[Step]) -> EvalResult<Vec<XNode>> {
        for step in steps {
            let mut next = Vec::new();
            for node in &nodes {
                let mut candidates = Vec::new();
                for candidate in self.axis(*node, step.axis) {
                    if self.matches(candidate, step.axis, &step.test)? {
                        candidates.push(candidate);
                    }
                }
                next.extend(self.apply_predicates(candidates, &step.predicates)?);
            }
            nodes = sort_unique(next);
        }
        Ok(nodes)
    }

    /// Filters `nodes` (given in proximity order) through each predicate in turn
    fn apply_predicates(
        &self,
        mut nodes: Vec<XNode>,
        predicates: &[Expr],
    ) -> EvalResult<Vec<XNode>> {
        for predicate in predicates {
            let size = nodes.len();
            let mut kept = Vec::with_capacity(size);
            for (index, node) in nodes.iter().enumerate() {
                let focus = Focus {
                    node: *node,
                    position: index + 1,
                    size,
                };
                let keep = match self.eval(predicate, &focus)? {
                    Value::Number(n) => n == (index + 1) as f64,
                    other => other.to_boolean(),
                };
                if keep {
                    kept.push(*node);
                }
            }
            nodes = kept;
        }
        Ok(nodes)
    }

    /// Nodes along `axis` from `node`, in proximity order
    fn axis(&self, node: XNode, axis: Axis) -> Vec<XNode> {
        let doc = self.document;
        match node {
            XNode::Attribute(owner, _) => match axis {
                Axis::SelfAxis | Axis::DescendantOrSelf => vec![node],
                Axis::Parent => vec![XNode::Node(owner)],
                Axis::Ancestor => std::iter::once(owner)
                    .chain(doc.ancestors(owner))
                    .map(XNode::Node)
                    .collect(),
                Axis::AncestorOrSelf => std::iter::once(node)
                    .chain(
                        std::iter::once(owner)
                            .chain(doc.ancestors(owner))
                            .map(XNode::Node),
                    )
                    .collect(),
                Axis::Following => doc
                    .descendants(owner)
                    .chain(doc.following(owner))
                    .map(XNode::Node)
                    .collect(),
                Axis::Preceding => doc
                    .preceding(owner)
                    .into_iter()
                    .rev()
                    .map(XNode::Node)
                    .collect(),
                _ => Vec::new(),
            },
            XNode::Node(id) => match axis {
                Axis::Child => doc.children(id).iter().copied().map(XNode::Node).collect(),
                Axis::Descendant => doc.descendants(id).map(XNode::Node).collect(),
                Axis::DescendantOrSelf => std::iter::once(id)
                    .chain(doc.descendants(id))
                    .map(XNode::Node)
                    .collect(),
                Axis::Parent => doc.parent(id).map(XNode::Node).into_iter().collect(),
                Axis::Ancestor => doc.ancestors(id).map(XNode::Node).collect(),
                Axis::AncestorOrSelf => std::iter::once(id)
                    .chain(doc.ancestors(id))
                    .map(XNode::Node)
                    .collect(),
                Axis::FollowingSibling | Axis::PrecedingSibling => {
                    let Some(parent) = doc.parent(id) else {
                        return Vec::new();
                    };
                    let siblings = doc.children(parent);
                    let Some(position) = siblings.iter().position(|sibling| *sibling == id)
                    else {
                        return Vec::new();
                    };
                    if axis == Axis::FollowingSibling {
                        siblings[position + 1..]
                            .iter()
                            .copied()
                            .map(XNode::Node)
                            .collect()
                    } else {
                        siblings[..position]
                            .iter()
                            .rev()
                            .copied()
                            .map(XNode::Node)
                            .collect()
                    }
                }
                Axis::Following => doc.following(id).map(XNode::Node).collect(),
                Axis::Preceding => doc
                    .preceding(id)
                    .into_iter()
                    .rev()
                    .map(XNode::Node)
                    .collect(),
                Axis::Attribute => match doc.element(id) {
                    Some(element) => (0..element.attributes.len())
                        .map(|index| XNode::Attribute(id, index))
                        .collect(),
                    None => Vec::new(),
                },
                Axis::SelfAxis => vec![node],
            },
        }
    }

    fn matches(&self, node: XNode, axis: Axis, test: &NodeTest) -> EvalResult<bool> {
        let doc = self.document;
        match node {
            XNode::Attribute(owner, index) => {
                let Some(attribute) = doc
                    .element(owner)
                    .and_then(|element| element.attributes.get(index))
                else {
                    return Ok(false);
                };
                if matches!(test, NodeTest::Node) {
                    return Ok(true);
                }
                if axis != Axis::Attribute {
                    return Ok(false);
                }
                self.name_matches(test, &attribute.name.local, attribute.namespace.as_deref())
            }
            XNode::Node(id) => match &doc.node(id).kind {
                NodeKind::Document => Ok(matches!(test, NodeTest::Node)),
                NodeKind::Text(_) => Ok(matches!(test, NodeTest::Node | NodeTest::Text)),
                NodeKind::Element(element) => {
                    if matches!(test, NodeTest::Node) {
                        return Ok(true);
                    }
                    if axis == Axis::Attribute {
                        return Ok(false);
                    }
                    self.name_matches(test, &element.name.local, element.namespace.as_deref())
                }
            },
        }
    }

    fn name_matches(
        &self,
        test: &NodeTest,
        local: &str,
        namespace: Option<&str>,
    ) -> EvalResult<bool> {
        Ok(match test {
            NodeTest::Any => true,
            NodeTest::Node => true,
            NodeTest::Text => false,
            NodeTest::LocalAny(expected) => expected == local,
            NodeTest::PrefixAny(prefix) => namespace == Some(self.resolve_prefix(prefix)?),
            NodeTest::Name {
                prefix: None,
                local: expected,
            } => expected == local && namespace.is_none(),
            NodeTest::Name {
                prefix: Some(prefix),
                local: expected,
            } => {
                let uri = self.resolve_prefix(prefix)?;
                expected == local && namespace == Some(uri)
            }
        })
    }

    fn resolve_prefix(&self, prefix: &str) -> EvalResult<&str> {
        if prefix == "xml" {
            return Ok(XML_NAMESPACE);
        }
        self.namespaces
            .namespace_uri(Some(prefix))
            .ok_or_else(|| EvalError::new(format!("namespace prefix `{}` is not declared", prefix)))
    }

    fn compare(&self, op: CompareOp, left: &Value, right: &Value) -> bool {
        match (left, right) {
            (Value::NodeSet(nodes), other) => self.compare_node_set(op, nodes, other),
            (other, Value::NodeSet(nodes)) => self.compare_node_set(op.flipped(), nodes, other),
            (left, right) => self.compare_atomic(op, left, right),
        }
    }

    fn compare_node_set(&self, op: CompareOp, nodes: &[XNode], other: &Value) -> bool {
        let doc = self.document;
        match other {
            Value::NodeSet(others) => {
                let others: Vec<String> = others.iter().map(|n| n.string_value(doc)).collect();
                nodes.iter().any(|node| {
                    let value = node.string_value(doc);
                    others.iter().any(|o| compare_strings(op, &value, o))
                })
            }
            Value::Number(n) => nodes
                .iter()
                .any(|node| compare_numbers(op, string_to_number(&node.string_value(doc)), *n)),
            Value::String(s) => nodes
                .iter()
                .any(|node| compare_strings(op, &node.string_value(doc), s)),
            Value::Boolean(_) => {
                self.compare_atomic(op, &Value::Boolean(!nodes.is_empty()), other)
            }
        }
    }

    fn compare_atomic(&self, op: CompareOp, left: &Value, right: &Value) -> bool {
        match op {
            CompareOp::Eq | CompareOp::Ne => {
                let equal = if matches!(left, Value::Boolean(_))
                    || matches!(right, Value::Boolean(_))
                {
                    left.to_boolean() == right.to_boolean()
                } else if matches!(left, Value::Number(_)) || matches!(right, Value::Number(_)) {
                    self.number(left) == self.number(right)
                } else {
                    self.string(left) == self.string(right)
                };
                (op == CompareOp::Eq) == equal
            }
            _ => compare_numbers(op, self.number(left), self.number(right)),
        }
    }

    fn call(&self, name: &str, args: &[Expr], focus: &Focus) -> EvalResult<Value> {
        let doc = self.document;
        Ok(match name {
            "last" => Value::Number(focus.size as f64),
            "position" => Value::Number(focus.position as f64),
            "count" => Value::Number(self.nodes_arg(args, 0, focus)?.len() as f64),
            "local-name" => Value::String(
                self.optional_node_arg(args, focus)?
                    .and_then(|node| node.local_name(doc))
                    .unwrap_or_default(),
            ),
            "namespace-uri" => Value::String(
                self.optional_node_arg(args, focus)?
                    .and_then(|node| node.namespace_uri(doc))
                    .unwrap_or_default(),
            ),
            "name" => Value::String(
                self.optional_node_arg(args, focus)?
                    .and_then(|node| node.qualified_name(doc))
                    .unwrap_or_default(),
            ),
            "string" => Value::String(self.optional_string_arg(args, focus)?),
            "concat" => {
                let mut result = String::new();
                for index in 0..args.len() {
                    result.push_str(&self.string_arg(args, index, focus)?);
                }
                Value::String(result)
            }
            "starts-with" => Value::Boolean(
                self.string_arg(args, 0, focus)?
                    .starts_with(&self.string_arg(args, 1, focus)?),
            ),
            "ends-with" => Value::Boolean(
                self.string_arg(args, 0, focus)?
                    .ends_with(&self.string_arg(args, 1, focus)?),
            ),
            "contains" => Value::Boolean(
                self.string_arg(args, 0, focus)?
                    .contains(&self.string_arg(args, 1, focus)?),
            ),
            "substring-before" => {
                let haystack = self.string_arg(args, 0, focus)?;
                let needle = self.string_arg(args, 1, focus)?;
                Value::String(
                    haystack
                        .find(&needle)
                        .map(|index| haystack[..index].to_string())
                        .unwrap_or_default(),
                )
            }
            "substring-after" => {
                let haystack = self.string_arg(args, 0, focus)?;
                let needle = self.string_arg(args, 1, focus)?;
                Value::String(
                    haystack
                        .find(&needle)
                        .map(|index| haystack[index + needle.len()..].to_string())
                        .unwrap_or_default(),
                )
            }
            "substring" => {
                let value = self.string_arg(args, 0, focus)?;
                let start = xpath_round(self.number_arg(args, 1, focus)?);
                let end = if args.len() > 2 {
                    start + xpath_round(self.number_arg(args, 2, focus)?)
                } else {
                    f64::INFINITY
                };
                Value::String(
                    value
                        .chars()
                        .enumerate()
                        .filter(|(index, _)| {
                            let position = (*index + 1) as f64;
                            position >= start && position < end
                        })
                        .map(|(_, c)| c)
                        .collect(),
                )
            }
            "string-length" => {
                Value::Number(self.optional_string_arg(args, focus)?.chars().count() as f64)
            }
            "normalize-space" => Value::String(
                self.optional_string_arg(args, focus)?
                    .split_whitespace()
                    .collect::<Vec<_>>()
                    .join(" "),
            ),
            "translate" => {
                let value = self.string_arg(args, 0, focus)?;
                let from: Vec<char> = self.string_arg(args, 1, focus)?.chars().collect();
                let to: Vec<char> = self.string_arg(args, 2, focus)?.chars().collect();
                Value::String(
                    value
                        .chars()
                        .filter_map(|c| match from.iter().position(|f| *f == c) {
                            Some(index) => to.get(index).copied(),
                            None => Some(c),
                        })
                        .collect(),
                )
            }
            "upper-case" => Value::String(self.string_arg(args, 0, focus)?.to_uppercase()),
            "lower-case" => Value::String(self.string_arg(args, 0, focus)?.to_lowercase()),
            "matches" => {
                let value = self.string_arg(args, 0, focus)?;
                let pattern = self.string_arg(args, 1, focus)?;
                let flags = if args.len() > 2 {
                    self.string_arg(args, 2, focus)?
                } else {
                    String::new()
                };
                let regex = RegexBuilder::new(&pattern)
                    .case_insensitive(flags.contains('i'))
                    .multi_line(flags.contains('m'))
                    .dot_matches_new_line(flags.contains('s'))
                    .ignore_whitespace(flags.contains('x'))
                    .build()
                    .map_err(|e| EvalError::new(format!("invalid regular expression: {}", e)))?;
                Value::Boolean(regex.is_match(&value))
            }
            "string-join" => {
                let separator = if args.len() > 1 {
                    self.string_arg(args, 1, focus)?
                } else {
                    String::new()
                };
                let parts: Vec<String> = self
                    .nodes_arg(args, 0, focus)?
                    .iter()
                    .map(|node| node.string_value(doc))
                    .collect();
                Value::String(parts.join(&separator))
            }
            "boolean" => Value::Boolean(self.eval(&args[0], focus)?.to_boolean()),
            "not" => Value::Boolean(!self.eval(&args[0], focus)?.to_boolean()),
            "true" => Value::Boolean(true),
            "false" => Value::Boolean(false),
            "exists" => Value::Boolean(self.eval(&args[0], focus)?.to_boolean_existence()),
            "empty" => Value::Boolean(!self.eval(&args[0], focus)?.to_boolean_existence()),
            "number" => Value::Number(match args.first() {
                Some(arg) => self.number(&self.eval(arg, focus)?),
                None => string_to_number(&focus.node.string_value(doc)),
            }),
            "sum" => Value::Number(
                self.nodes_arg(args, 0, focus)?
                    .iter()
                    .map(|node| string_to_number(&node.string_value(doc)))
                    .sum(),
            ),
            "floor" => Value::Number(self.number_arg(args, 0, focus)?.floor()),
            "ceiling" => Value::Number(self.number_arg(args, 0, focus)?.ceil()),
            "round" => Value::Number(xpath_round(self.number_arg(args, 0, focus)?)),
            "current" => Value::NodeSet(vec![self.current]),
            other => return Err(EvalError::new(format!("unknown function `{}()`", other))),
        })
    }

    fn string_arg(&self, args: &[Expr], index: usize, focus: &Focus) -> EvalResult<String> {
        let value = self.eval(&args[index], focus)?;
        Ok(self.string(&value))
    }

    fn number_arg(&self, args: &[Expr], index: usize, focus: &Focus) -> EvalResult<f64> {
        let value = self.eval(&args[index], focus)?;
        Ok(self.number(&value))
    }

    fn nodes_arg(&self, args: &[Expr], index: usize, focus: &Focus) -> EvalResult<Vec<XNode>> {
        let value = self.eval(&args[index], focus)?;
        self.node_set(value, "function argument")
    }

    fn optional_string_arg(&self, args: &[Expr], focus: &Focus) -> EvalResult<String> {
        match args.first() {
            Some(_) => self.string_arg(args, 0, focus),
            None => Ok(focus.node.string_value(self.document)),
        }
    }

    fn optional_node_arg(&self, args: &[Expr], focus: &Focus) -> EvalResult<Option<XNode>> {
        match args.first() {
            Some(_) => Ok(self.nodes_arg(args, 0, focus)?.first().copied()),
            None => Ok(Some(focus.node)),
        }
    }
}

impl Value {
    /// `exists()` semantics: a node-set exists when non-empty, any atomic value exists
    fn to_boolean_existence(&self) -> bool {
        match self {
            Value::NodeSet(nodes) => !nodes.is_empty(),
            _ => true,
        }
    }
}

fn sort_unique(mut nodes: Vec<XNode>) -> Vec<XNode> {
    nodes.sort();
    nodes.dedup();
    nodes
}

fn compare_strings(op: CompareOp, left: &str, right: &str) -> bool {
    match op {
        CompareOp::Eq => left == right,
        CompareOp::Ne => left != right,
        _ => compare_numbers(op, string_to_number(left), string_to_number(right)),
    }
}

fn compare_numbers(op: CompareOp, left: f64, right: f64) -> bool {
    match op {
        CompareOp::Eq => left == right,
        CompareOp::Ne => left != right,
        CompareOp::Lt => left < right,
        CompareOp::Le => left <= right,
        CompareOp::Gt => left > right,
        CompareOp::Ge => left >= right,
    }
}

/// XPath `round()`: halves round towards positive infinity
fn xpath_round(n: f64) -> f64 {
    if n.is_nan() || n.is_infinite() {
        n
    } else {
        (n + 0.5).floor()
    }
}

/// Only `-? digits (. digits?)?` and `-? . digits` are numbers; everything else is NaN
pub fn string_to_number(s: &str) -> f64 {
    let trimmed = s.trim();
    let unsigned = trimmed.strip_prefix('-').unwrap_or(trimmed);
    let valid = !unsigned.is_empty()
        && unsigned.chars().any(|c| c.is_ascii_digit())
        && unsigned.chars().all(|c| c.is_ascii_digit() || c == '.')
        && unsigned.chars().filter(|c| *c == '.').count() <= 1;
    if valid {
        trimmed.parse().unwrap_or(f64::NAN)
    } else {
        f64::NAN
    }
}

pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n == f64::INFINITY {
        "Infinity".to_string()
    } else if n == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else if n == n.trunc() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xpath::parser::parse;

    const DOC: &str = r#"<Invoice xmlns="urn:inv" xmlns:cac="urn:cac" xmlns:cbc="urn:cbc">
  <cbc:ID>INV-1</cbc:ID>
  <cac:Line id="1"><cbc:Amount>10</cbc:Amount></cac:Line>
  <cac:Line id="2"><cbc:Amount>2.5</cbc:Amount></cac:Line>
  <cac:Line id="3"><cbc:Amount>abc</cbc:Amount></cac:Line>
</Invoice>"#;

    fn fixture() -> (LineAnnotatedDocument, NamespaceResolver) {
        let doc = LineAnnotatedDocument::parse(DOC.as_bytes()).unwrap();
        let namespaces = NamespaceResolver::from_document(&doc, false);
        (doc, namespaces)
    }

    fn eval(doc: &LineAnnotatedDocument, ns: &NamespaceResolver, source: &str) -> Value {
        let variables = Variables::new();
        let ctx = EvalContext::new(doc, ns, &variables);
        ctx.evaluate(&parse(source).unwrap(), ctx.root()).unwrap()
    }

    fn string(doc: &LineAnnotatedDocument, ns: &NamespaceResolver, source: &str) -> String {
        let variables = Variables::new();
        let ctx = EvalContext::new(doc, ns, &variables);
        let value = eval(doc, ns, source);
        ctx.string(&value)
    }

    #[test]
    fn test_prefixed_paths_and_positions() {
        let (doc, ns) = fixture();
        assert_eq!(string(&doc, &ns, "/default:Invoice/cbc:ID"), "INV-1");
        assert_eq!(
            string(&doc, &ns, "/default:Invoice/cac:Line[2]/@id"),
            "2"
        );
        assert_eq!(string(&doc, &ns, "count(//cac:Line)"), "3");
        assert_eq!(string(&doc, &ns, "//cac:Line[last()]/@id"), "3");
    }

    #[test]
    fn test_unprefixed_name_only_matches_no_namespace() {
        let (doc, ns) = fixture();
        assert_eq!(eval(&doc, &ns, "/Invoice"), Value::NodeSet(vec![]));
        assert_eq!(string(&doc, &ns, "count(/*:Invoice/*:Line)"), "3");
    }

    #[test]
    fn test_local_name_and_namespace_uri_predicates() {
        let (doc, ns) = fixture();
        let value = eval(
            &doc,
            &ns,
            "/*[local-name()='Invoice' and namespace-uri()='urn:inv']/*[local-name()='Line'][3]",
        );
        let Value::NodeSet(nodes) = value else {
            panic!("expected node-set");
        };
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].line(&doc), 5);
    }

    #[test]
    fn test_node_set_comparisons_and_sum() {
        let (doc, ns) = fixture();
        assert_eq!(eval(&doc, &ns, "//cbc:Amount = 10"), Value::Boolean(true));
        assert_eq!(eval(&doc, &ns, "//cbc:Amount > 100"), Value::Boolean(false));
        assert_eq!(eval(&doc, &ns, "100 > //cbc:Amount"), Value::Boolean(true));
        assert_eq!(eval(&doc, &ns, "//cac:Line/@id = '2'"), Value::Boolean(true));
        assert_eq!(eval(&doc, &ns, "sum(//cac:Line[position() < 3]/cbc:Amount)"), Value::Number(12.5));
        assert_eq!(string(&doc, &ns, "sum(//cbc:Amount)"), "NaN");
    }

    #[test]
    fn test_reverse_axis_positions() {
        let (doc, ns) = fixture();
        assert_eq!(
            string(&doc, &ns, "//cac:Line[3]/preceding-sibling::cac:Line[1]/@id"),
            "2"
        );
        assert_eq!(
            string(&doc, &ns, "name(//cbc:Amount[1]/ancestor::*[last()])"),
            "Invoice"
        );
    }

    #[test]
    fn test_string_functions() {
        let (doc, ns) = fixture();
        assert_eq!(string(&doc, &ns, "substring('12345', 1.5, 2.6)"), "234");
        assert_eq!(string(&doc, &ns, "substring('12345', 0, 3)"), "12");
        assert_eq!(string(&doc, &ns, "normalize-space('  a  b ')"), "a b");
        assert_eq!(string(&doc, &ns, "translate('bar', 'abc', 'ABC')"), "BAr");
        assert_eq!(string(&doc, &ns, "substring-after('2024-01', '-')"), "01");
        assert_eq!(string(&doc, &ns, "concat('a', 1, true())"), "a1true");
        assert_eq!(string(&doc, &ns, "string-join(//cac:Line/@id, ',')"), "1,2,3");
        assert_eq!(eval(&doc, &ns, "matches('AB-12', '^[a-z]{2}-\\d+$', 'i')"), Value::Boolean(true));
    }

    #[test]
    fn test_number_formatting() {
        assert_eq!(number_to_string(3.0), "3");
        assert_eq!(number_to_string(-0.0), "0");
        assert_eq!(number_to_string(2.5), "2.5");
        assert_eq!(number_to_string(f64::NAN), "NaN");
        assert!(string_to_number("1e3").is_nan());
        assert_eq!(string_to_number(" -4.5 "), -4.5);
    }

    #[test]
    fn test_current_and_variables() {
        let (doc, ns) = fixture();
        let mut variables = Variables::new();
        variables.insert("limit".to_string(), Value::Number(5.0));
        let ctx = EvalContext::new(&doc, &ns, &variables);

        let lines = ctx
            .evaluate(&parse("//cac:Line").unwrap(), ctx.root())
            .unwrap();
        let Value::NodeSet(lines) = lines else {
            panic!("expected node-set");
        };
        let ctx = ctx.with_current(lines[0]);
        let value = ctx
            .evaluate(&parse("cbc:Amount > $limit and current()/@id = '1'").unwrap(), lines[0])
            .unwrap();
        assert_eq!(value, Value::Boolean(true));

        let err = ctx.evaluate(&parse("$missing").unwrap(), lines[0]).unwrap_err();
        assert!(err.message.contains("missing"));
    }

    #[test]
    fn test_undeclared_prefix_is_an_error() {
        let (doc, ns) = fixture();
        let variables = Variables::new();
        let ctx = EvalContext::new(&doc, &ns, &variables);
        assert!(ctx.evaluate(&parse("//x:Thing").unwrap(), ctx.root()).is_err());
    }

    #[test]
    fn test_attributes_order_after_owner() {
        let (doc, ns) = fixture();
        let Value::NodeSet(nodes) = eval(&doc, &ns, "//cac:Line[1]/@id | //cac:Line[1] | //cac:Line[1]/cbc:Amount")
        else {
            panic!("expected node-set");
        };
        assert_eq!(nodes.len(), 3);
        assert!(matches!(nodes[0], XNode::Node(_)));
        assert!(matches!(nodes[1], XNode::Attribute(_, 0)));
    }
}
