//! Tokenizer and recursive-descent parser for XPath 1.0 expressions
//!
//! Also accepts the `*:local` name test, which rule-engine location paths use.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
    Arithmetic(ArithmeticOp, Box<Expr>, Box<Expr>),
    Negate(Box<Expr>),
    Union(Box<Expr>, Box<Expr>),
    Path(PathExpr),
    /// `primary[predicate]...` optionally followed by further location steps
    Filter {
        primary: Box<Expr>,
        predicates: Vec<Expr>,
        steps: Vec<Step>,
    },
    Literal(String),
    Number(f64),
    Variable(String),
    Function { name: String, args: Vec<Expr> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    /// Operator to use when the operands are swapped
    pub fn flipped(self) -> Self {
        match self {
            CompareOp::Lt => CompareOp::Gt,
            CompareOp::Le => CompareOp::Ge,
            CompareOp::Gt => CompareOp::Lt,
            CompareOp::Ge => CompareOp::Le,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PathExpr {
    pub absolute: bool,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub axis: Axis,
    pub test: NodeTest,
    pub predicates: Vec<Expr>,
}

impl Step {
    fn descendant_or_self() -> Self {
        Step {
            axis: Axis::DescendantOrSelf,
            test: NodeTest::Node,
            predicates: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Child,
    Descendant,
    DescendantOrSelf,
    Parent,
    Ancestor,
    AncestorOrSelf,
    FollowingSibling,
    PrecedingSibling,
    Following,
    Preceding,
    Attribute,
    SelfAxis,
}

impl Axis {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "child" => Axis::Child,
            "descendant" => Axis::Descendant,
            "descendant-or-self" => Axis::DescendantOrSelf,
            "parent" => Axis::Parent,
            "ancestor" => Axis::Ancestor,
            "ancestor-or-self" => Axis::AncestorOrSelf,
            "following-sibling" => Axis::FollowingSibling,
            "preceding-sibling" => Axis::PrecedingSibling,
            "following" => Axis::Following,
            "preceding" => Axis::Preceding,
            "attribute" => Axis::Attribute,
            "self" => Axis::SelfAxis,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeTest {
    /// `*`
    Any,
    /// `name` or `prefix:name`
    Name {
        prefix: Option<String>,
        local: String,
    },
    /// `prefix:*`
    PrefixAny(String),
    /// `*:local`
    LocalAny(String),
    Node,
    Text,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub position: usize,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at offset {}", self.message, self.position)
    }
}

impl std::error::Error for ParseError {}

/// Functions the evaluator implements, with their accepted argument counts
const FUNCTIONS: &[(&str, usize, usize)] = &[
    ("last", 0, 0),
    ("position", 0, 0),
    ("count", 1, 1),
    ("local-name", 0, 1),
    ("namespace-uri", 0, 1),
    ("name", 0, 1),
    ("string", 0, 1),
    ("concat", 2, usize::MAX),
    ("starts-with", 2, 2),
    ("ends-with", 2, 2),
    ("contains", 2, 2),
    ("substring-before", 2, 2),
    ("substring-after", 2, 2),
    ("substring", 2, 3),
    ("string-length", 0, 1),
    ("normalize-space", 0, 1),
    ("translate", 3, 3),
    ("upper-case", 1, 1),
    ("lower-case", 1, 1),
    ("matches", 2, 3),
    ("string-join", 1, 2),
    ("boolean", 1, 1),
    ("not", 1, 1),
    ("true", 0, 0),
    ("false", 0, 0),
    ("exists", 1, 1),
    ("empty", 1, 1),
    ("number", 0, 1),
    ("sum", 1, 1),
    ("floor", 1, 1),
    ("ceiling", 1, 1),
    ("round", 1, 1),
    ("current", 0, 0),
];

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Slash,
    DoubleSlash,
    Pipe,
    Plus,
    Minus,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    DotDot,
    At,
    Comma,
    ColonColon,
    Multiply,
    And,
    Or,
    Div,
    Mod,
    Literal(String),
    Number(f64),
    Variable(String),
    /// NCName, QName, `*`, `prefix:*` or `*:local` in name-test position
    Name(String),
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ParseError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens: Vec<(usize, Token)> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        // XPath 1.0 §3.7: after these tokens `*` and operator names are not operators
        let operator_position = match tokens.last() {
            None => false,
            Some((_, token)) => !matches!(
                token,
                Token::At
                    | Token::ColonColon
                    | Token::LParen
                    | Token::LBracket
                    | Token::Comma
                    | Token::Slash
                    | Token::DoubleSlash
                    | Token::Pipe
                    | Token::Plus
                    | Token::Minus
                    | Token::Eq
                    | Token::Ne
                    | Token::Lt
                    | Token::Le
                    | Token::Gt
                    | Token::Ge
                    | Token::Multiply
                    | Token::And
                    | Token::Or
                    | Token::Div
                    | Token::Mod
            ),
        };
        let next = chars.get(i + 1).map(|(_, c)| *c);

        let (token, consumed) = match c {
            '/' if next == Some('/') => (Token::DoubleSlash, 2),
            '/' => (Token::Slash, 1),
            '|' => (Token::Pipe, 1),
            '+' => (Token::Plus, 1),
            '-' => (Token::Minus, 1),
            '=' => (Token::Eq, 1),
            '!' if next == Some('=') => (Token::Ne, 2),
            '<' if next == Some('=') => (Token::Le, 2),
            '<' => (Token::Lt, 1),
            '>' if next == Some('=') => (Token::Ge, 2),
            '>' => (Token::Gt, 1),
            '(' => (Token::LParen, 1),
            ')' => (Token::RParen, 1),
            '[' => (Token::LBracket, 1),
            ']' => (Token::RBracket, 1),
            ',' => (Token::Comma, 1),
            '@' => (Token::At, 1),
            ':' if next == Some(':') => (Token::ColonColon, 2),
            '.' if next == Some('.') => (Token::DotDot, 2),
            '.' if next.map(|n| n.is_ascii_digit()).unwrap_or(false) => {
                let (number, len) = read_number(&chars[i..]);
                (Token::Number(number), len)
            }
            '.' => (Token::Dot, 1),
            '"' | '\'' => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end].1 != c {
                    end += 1;
                }
                if end >= chars.len() {
                    return Err(ParseError {
                        position: offset,
                        message: "unterminated string literal".to_string(),
                    });
                }
                let literal: String = chars[start..end].iter().map(|(_, c)| *c).collect();
                (Token::Literal(literal), end - i + 1)
            }
            '0'..='9' => {
                let (number, len) = read_number(&chars[i..]);
                (Token::Number(number), len)
            }
            '$' => {
                let (name, len) = read_qname(&chars[i + 1..]);
                if name.is_empty() {
                    return Err(ParseError {
                        position: offset,
                        message: "expected variable name after `$`".to_string(),
                    });
                }
                (Token::Variable(name), len + 1)
            }
            '*' if operator_position => (Token::Multiply, 1),
            '*' => {
                if next == Some(':') && chars.get(i + 2).map(|(_, c)| is_name_start(*c)) == Some(true)
                {
                    let (local, len) = read_ncname(&chars[i + 2..]);
                    (Token::Name(format!("*:{}", local)), len + 2)
                } else {
                    (Token::Name("*".to_string()), 1)
                }
            }
            c if is_name_start(c) => {
                let (name, len) = read_qname(&chars[i..]);
                let token = if operator_position {
                    match name.as_str() {
                        "and" => Token::And,
                        "or" => Token::Or,
                        "div" => Token::Div,
                        "mod" => Token::Mod,
                        _ => Token::Name(name),
                    }
                } else {
                    Token::Name(name)
                };
                (token, len)
            }
            other => {
                return Err(ParseError {
                    position: offset,
                    message: format!("unexpected character `{}`", other),
                });
            }
        };

        tokens.push((offset, token));
        i += consumed;
    }

    Ok(tokens)
}

fn is_name_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '\u{b7}')
}

fn read_ncname(chars: &[(usize, char)]) -> (String, usize) {
    let len = chars.iter().take_while(|(_, c)| is_name_char(*c)).count();
    if len == 0 || !is_name_start(chars[0].1) {
        return (String::new(), 0);
    }
    (chars[..len].iter().map(|(_, c)| *c).collect(), len)
}

/// NCName, optionally followed by `:NCName` or `:*` (but never `::`)
fn read_qname(chars: &[(usize, char)]) -> (String, usize) {
    let (mut name, mut len) = read_ncname(chars);
    if len == 0 {
        return (name, 0);
    }
    if chars.get(len).map(|(_, c)| *c) == Some(':') {
        match chars.get(len + 1).map(|(_, c)| *c) {
            Some('*') => {
                name.push_str(":*");
                len += 2;
            }
            Some(c) if is_name_start(c) => {
                let (local, local_len) = read_ncname(&chars[len + 1..]);
                name.push(':');
                name.push_str(&local);
                len += 1 + local_len;
            }
            _ => {}
        }
    }
    (name, len)
}

fn read_number(chars: &[(usize, char)]) -> (f64, usize) {
    let mut len = 0;
    let mut seen_dot = false;
    while let Some((_, c)) = chars.get(len) {
        if c.is_ascii_digit() {
            len += 1;
        } else if *c == '.' && !seen_dot && chars.get(len + 1).map(|(_, n)| *n) != Some('.') {
            seen_dot = true;
            len += 1;
        } else {
            break;
        }
    }
    let text: String = chars[..len].iter().map(|(_, c)| *c).collect();
    (text.parse().unwrap_or(f64::NAN), len)
}

/// Parse an XPath expression into its syntax tree
pub fn parse(input: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        position: 0,
        end: input.len(),
    };
    let expr = parser.parse_or()?;
    if parser.position < parser.tokens.len() {
        return Err(parser.error("unexpected trailing tokens"));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    position: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position).map(|(_, token)| token)
    }

    fn peek_at(&self, ahead: usize) -> Option<&Token> {
        self.tokens.get(self.position + ahead).map(|(_, token)| token)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).map(|(_, token)| token.clone());
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<(), ParseError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(self.error(&format!("expected {}", what)))
        }
    }

    fn error(&self, message: &str) -> ParseError {
        ParseError {
            position: self
                .tokens
                .get(self.position)
                .map(|(offset, _)| *offset)
                .unwrap_or(self.end),
            message: message.to_string(),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_equality()?;
        while self.eat(&Token::And) {
            let right = self.parse_equality()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_relational()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => CompareOp::Eq,
                Some(Token::Ne) => CompareOp::Ne,
                _ => return Ok(left),
            };
            self.position += 1;
            let right = self.parse_relational()?;
            left = Expr::Compare(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_relational(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => CompareOp::Lt,
                Some(Token::Le) => CompareOp::Le,
                Some(Token::Gt) => CompareOp::Gt,
                Some(Token::Ge) => CompareOp::Ge,
                _ => return Ok(left),
            };
            self.position += 1;
            let right = self.parse_additive()?;
            left = Expr::Compare(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => ArithmeticOp::Add,
                Some(Token::Minus) => ArithmeticOp::Subtract,
                _ => return Ok(left),
            };
            self.position += 1;
            let right = self.parse_multiplicative()?;
            left = Expr::Arithmetic(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Multiply) => ArithmeticOp::Multiply,
                Some(Token::Div) => ArithmeticOp::Divide,
                Some(Token::Mod) => ArithmeticOp::Modulo,
                _ => return Ok(left),
            };
            self.position += 1;
            let right = self.parse_unary()?;
            left = Expr::Arithmetic(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&Token::Minus) {
            let operand = self.parse_unary()?;
            return Ok(Expr::Negate(Box::new(operand)));
        }
        self.parse_union()
    }

    fn parse_union(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_path()?;
        while self.eat(&Token::Pipe) {
            let right = self.parse_path()?;
            left = Expr::Union(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_path(&mut self) -> Result<Expr, ParseError> {
        match self.peek() {
            Some(Token::Slash) => {
                self.position += 1;
                let steps = if self.starts_step() {
                    self.parse_relative_steps()?
                } else {
                    Vec::new()
                };
                Ok(Expr::Path(PathExpr {
                    absolute: true,
                    steps,
                }))
            }
            Some(Token::DoubleSlash) => {
                self.position += 1;
                let mut steps = vec![Step::descendant_or_self()];
                steps.extend(self.parse_relative_steps()?);
                Ok(Expr::Path(PathExpr {
                    absolute: true,
                    steps,
                }))
            }
            _ if self.starts_filter() => {
                let primary = self.parse_primary()?;
                let predicates = self.parse_predicates()?;
                let mut steps = Vec::new();
                loop {
                    if self.eat(&Token::Slash) {
                        steps.push(self.parse_step()?);
                    } else if self.eat(&Token::DoubleSlash) {
                        steps.push(Step::descendant_or_self());
                        steps.push(self.parse_step()?);
                    } else {
                        break;
                    }
                }
                if predicates.is_empty() && steps.is_empty() {
                    Ok(primary)
                } else {
                    Ok(Expr::Filter {
                        primary: Box::new(primary),
                        predicates,
                        steps,
                    })
                }
            }
            _ => {
                let steps = self.parse_relative_steps()?;
                Ok(Expr::Path(PathExpr {
                    absolute: false,
                    steps,
                }))
            }
        }
    }

    fn starts_step(&self) -> bool {
        match self.peek() {
            Some(Token::Dot) | Some(Token::DotDot) | Some(Token::At) => true,
            Some(Token::Name(_)) => !self.is_function_call(),
            _ => false,
        }
    }

    fn is_function_call(&self) -> bool {
        match (self.peek(), self.peek_at(1)) {
            (Some(Token::Name(name)), Some(Token::LParen)) => !is_node_type(name),
            _ => false,
        }
    }

    fn starts_filter(&self) -> bool {
        match self.peek() {
            Some(Token::Literal(_))
            | Some(Token::Number(_))
            | Some(Token::Variable(_))
            | Some(Token::LParen) => true,
            Some(Token::Name(_)) => self.is_function_call(),
            _ => false,
        }
    }

    fn parse_relative_steps(&mut self) -> Result<Vec<Step>, ParseError> {
        let mut steps = vec![self.parse_step()?];
        loop {
            if self.eat(&Token::Slash) {
                steps.push(self.parse_step()?);
            } else if self.eat(&Token::DoubleSlash) {
                steps.push(Step::descendant_or_self());
                steps.push(self.parse_step()?);
            } else {
                return Ok(steps);
            }
        }
    }

    fn parse_step(&mut self) -> Result<Step, ParseError> {
        if self.eat(&Token::Dot) {
            return Ok(Step {
                axis: Axis::SelfAxis,
                test: NodeTest::Node,
                predicates: Vec::new(),
            });
        }
        if self.eat(&Token::DotDot) {
            return Ok(Step {
                axis: Axis::Parent,
                test: NodeTest::Node,
                predicates: Vec::new(),
            });
        }

        let axis = if self.eat(&Token::At) {
            Axis::Attribute
        } else if let (Some(Token::Name(name)), Some(Token::ColonColon)) =
            (self.peek(), self.peek_at(1))
        {
            let axis = Axis::from_name(name)
                .ok_or_else(|| self.error(&format!("unknown axis `{}`", name)))?;
            self.position += 2;
            axis
        } else {
            Axis::Child
        };

        let test = self.parse_node_test()?;
        let predicates = self.parse_predicates()?;
        Ok(Step {
            axis,
            test,
            predicates,
        })
    }

    fn parse_node_test(&mut self) -> Result<NodeTest, ParseError> {
        let name = match self.peek() {
            Some(Token::Name(name)) => name.clone(),
            _ => return Err(self.error("expected a node test")),
        };
        self.position += 1;

        if is_node_type(&name) && self.peek() == Some(&Token::LParen) {
            self.position += 1;
            self.expect(&Token::RParen, "`)`")?;
            return match name.as_str() {
                "node" => Ok(NodeTest::Node),
                "text" => Ok(NodeTest::Text),
                _ => Err(self.error(&format!("node test `{}()` is not supported", name))),
            };
        }

        Ok(if name == "*" {
            NodeTest::Any
        } else if let Some(local) = name.strip_prefix("*:") {
            NodeTest::LocalAny(local.to_string())
        } else if let Some(prefix) = name.strip_suffix(":*") {
            NodeTest::PrefixAny(prefix.to_string())
        } else if let Some((prefix, local)) = name.split_once(':') {
            NodeTest::Name {
                prefix: Some(prefix.to_string()),
                local: local.to_string(),
            }
        } else {
            NodeTest::Name {
                prefix: None,
                local: name,
            }
        })
    }

    fn parse_predicates(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut predicates = Vec::new();
        while self.eat(&Token::LBracket) {
            predicates.push(self.parse_or()?);
            self.expect(&Token::RBracket, "`]`")?;
        }
        Ok(predicates)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let start = self.position;
        match self.advance() {
            Some(Token::Literal(value)) => Ok(Expr::Literal(value)),
            Some(Token::Number(value)) => Ok(Expr::Number(value)),
            Some(Token::Variable(name)) => Ok(Expr::Variable(name)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen, "`)`")?;
                Ok(inner)
            }
            Some(Token::Name(name)) => {
                self.expect(&Token::LParen, "`(`")?;
                let mut args = Vec::new();
                if !self.eat(&Token::RParen) {
                    loop {
                        args.push(self.parse_or()?);
                        if self.eat(&Token::Comma) {
                            continue;
                        }
                        self.expect(&Token::RParen, "`)`")?;
                        break;
                    }
                }
                let local = name.rsplit(':').next().unwrap_or(&name).to_string();
                check_function(&local, args.len()).map_err(|message| self.error(&message))?;
                Ok(Expr::Function { name: local, args })
            }
            _ => {
                self.position = start;
                Err(self.error("expected an expression"))
            }
        }
    }
}

fn is_node_type(name: &str) -> bool {
    matches!(
        name,
        "node" | "text" | "comment" | "processing-instruction"
    )
}

fn check_function(name: &str, arity: usize) -> Result<(), String> {
    match FUNCTIONS.iter().find(|(known, _, _)| *known == name) {
        None => Err(format!("unknown function `{}()`", name)),
        Some((_, min, max)) if arity < *min || arity > *max => Err(format!(
            "function `{}()` does not accept {} argument(s)",
            name, arity
        )),
        Some(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(local: &str) -> NodeTest {
        NodeTest::Name {
            prefix: None,
            local: local.to_string(),
        }
    }

    #[test]
    fn test_absolute_path_with_positions() {
        let expr = parse("/Invoice[1]/cac:Line[2]").unwrap();
        let Expr::Path(path) = expr else {
            panic!("expected a path");
        };
        assert!(path.absolute);
        assert_eq!(path.steps.len(), 2);
        assert_eq!(path.steps[0].test, name("Invoice"));
        assert_eq!(path.steps[0].predicates, vec![Expr::Number(1.0)]);
        assert_eq!(
            path.steps[1].test,
            NodeTest::Name {
                prefix: Some("cac".to_string()),
                local: "Line".to_string()
            }
        );
    }

    #[test]
    fn test_wildcard_forms() {
        let Expr::Path(path) = parse("/*:Invoice/inv:*/*").unwrap() else {
            panic!("expected a path");
        };
        assert_eq!(path.steps[0].test, NodeTest::LocalAny("Invoice".to_string()));
        assert_eq!(path.steps[1].test, NodeTest::PrefixAny("inv".to_string()));
        assert_eq!(path.steps[2].test, NodeTest::Any);
    }

    #[test]
    fn test_star_is_multiplication_after_operand() {
        let expr = parse("2 * 3").unwrap();
        assert_eq!(
            expr,
            Expr::Arithmetic(
                ArithmeticOp::Multiply,
                Box::new(Expr::Number(2.0)),
                Box::new(Expr::Number(3.0))
            )
        );
    }

    #[test]
    fn test_operator_names_versus_element_names() {
        // `div` here is an element name, then the operator
        let expr = parse("div div 2").unwrap();
        assert!(matches!(expr, Expr::Arithmetic(ArithmeticOp::Divide, _, _)));

        let expr = parse("a and not(b) or c").unwrap();
        assert!(matches!(expr, Expr::Or(_, _)));
    }

    #[test]
    fn test_axes_and_abbreviations() {
        let Expr::Path(path) = parse("../preceding-sibling::x/@id").unwrap() else {
            panic!("expected a path");
        };
        assert_eq!(path.steps[0].axis, Axis::Parent);
        assert_eq!(path.steps[1].axis, Axis::PrecedingSibling);
        assert_eq!(path.steps[2].axis, Axis::Attribute);

        let Expr::Path(path) = parse("//text()").unwrap() else {
            panic!("expected a path");
        };
        assert_eq!(path.steps[0].axis, Axis::DescendantOrSelf);
        assert_eq!(path.steps[1].test, NodeTest::Text);
    }

    #[test]
    fn test_local_name_predicates_from_stylesheets() {
        let expr = parse("/*[local-name()='Invoice' and namespace-uri()='urn:x'][1]").unwrap();
        let Expr::Path(path) = expr else {
            panic!("expected a path");
        };
        assert_eq!(path.steps[0].predicates.len(), 2);
    }

    #[test]
    fn test_filter_expression_with_steps() {
        let expr = parse("$lines[1]/cbc:Amount").unwrap();
        assert!(matches!(expr, Expr::Filter { .. }));

        let expr = parse("current()/@id").unwrap();
        assert!(matches!(expr, Expr::Filter { .. }));
    }

    #[test]
    fn test_numbers_and_literals() {
        assert_eq!(parse(".5").unwrap(), Expr::Number(0.5));
        assert!(parse("'it''s'").is_err());
        assert_eq!(parse("\"a'b\"").unwrap(), Expr::Literal("a'b".to_string()));
    }

    #[test]
    fn test_unknown_function_and_arity() {
        assert!(parse("frobnicate(1)").is_err());
        assert!(parse("count()").is_err());
        assert!(parse("concat('a')").is_err());
        assert!(parse("fn:count(a)").is_ok());
    }

    #[test]
    fn test_syntax_errors() {
        assert!(parse("/a[").is_err());
        assert!(parse("a b").is_err());
        assert!(parse("'open").is_err());
        assert!(parse("").is_err());
    }
}
