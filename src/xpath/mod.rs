//! XPath 1.0 expressions over line-annotated documents
//!
//! Used for rule assertions, rule context patterns and for mapping location paths
//! reported by rule engines back to source lines.

mod eval;
mod parser;

pub use eval::{EvalContext, EvalError, Value, Variables, XNode, number_to_string, string_to_number};
pub use parser::{Axis, Expr, NodeTest, ParseError, PathExpr, Step};

use crate::error::{Result, ValidationError};

/// A parsed expression together with its source text
#[derive(Debug, Clone, PartialEq)]
pub struct XPath {
    source: String,
    expr: Expr,
}

impl XPath {
    pub fn compile(source: &str) -> Result<Self> {
        let expr = parser::parse(source).map_err(|e| ValidationError::XPath {
            expression: source.to_string(),
            details: e.to_string(),
        })?;
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    /// Compile a match pattern such as `cac:Line` or `a | /b//c` into an
    /// expression that selects every matching node when evaluated from the root
    pub fn compile_pattern(source: &str) -> Result<Self> {
        let compiled = Self::compile(source)?;
        let expr = anchor_pattern(compiled.expr).map_err(|details| ValidationError::XPath {
            expression: source.to_string(),
            details,
        })?;
        Ok(Self {
            source: compiled.source,
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn evaluate(&self, ctx: &EvalContext<'_>, node: XNode) -> Result<Value> {
        ctx.evaluate(&self.expr, node).map_err(|e| self.error(e))
    }

    /// Evaluate and require a node-set result
    pub fn select(&self, ctx: &EvalContext<'_>, node: XNode) -> Result<Vec<XNode>> {
        match self.evaluate(ctx, node)? {
            Value::NodeSet(nodes) => Ok(nodes),
            other => Err(ValidationError::XPath {
                expression: self.source.clone(),
                details: format!("expected a node-set, got {:?}", other),
            }),
        }
    }

    pub fn evaluate_boolean(&self, ctx: &EvalContext<'_>, node: XNode) -> Result<bool> {
        Ok(self.evaluate(ctx, node)?.to_boolean())
    }

    pub fn evaluate_string(&self, ctx: &EvalContext<'_>, node: XNode) -> Result<String> {
        let value = self.evaluate(ctx, node)?;
        Ok(ctx.string(&value))
    }

    fn error(&self, e: EvalError) -> ValidationError {
        ValidationError::XPath {
            expression: self.source.clone(),
            details: e.message,
        }
    }
}

fn anchor_pattern(expr: Expr) -> std::result::Result<Expr, String> {
    match expr {
        Expr::Union(left, right) => Ok(Expr::Union(
            Box::new(anchor_pattern(*left)?),
            Box::new(anchor_pattern(*right)?),
        )),
        Expr::Path(PathExpr {
            absolute: false,
            steps,
        }) => {
            let mut anchored = vec![Step {
                axis: Axis::DescendantOrSelf,
                test: NodeTest::Node,
                predicates: Vec::new(),
            }];
            anchored.extend(steps);
            Ok(Expr::Path(PathExpr {
                absolute: true,
                steps: anchored,
            }))
        }
        path @ Expr::Path(_) => Ok(path),
        filter @ Expr::Filter { .. } => Ok(filter),
        _ => Err("a pattern must be a location path or a union of location paths".to_string()),
    }
}
