//! Tiny, total condition language.
//!
//! Shared by conditional plan groups (`task_<id>_completed AND
//! task_<other>_completed`) and optimizer rules
//! (`resources.cpu.utilization > 80 AND summary.error_rate >= 0.05`).
//!
//! Grammar:
//! ```text
//! expr       := term ( OR term )*
//! term       := factor ( AND factor )*
//! factor     := '(' expr ')' | comparison | variable
//! comparison := path op number        op in { > < >= <= == }
//! path       := ident ( '.' ident )*
//! ```
//! Evaluation is total: anything that fails to parse, or references a path
//! the resolver cannot supply, evaluates to `false`.

use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
}

impl CmpOp {
    fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            CmpOp::Gt => lhs > rhs,
            CmpOp::Lt => lhs < rhs,
            CmpOp::Ge => lhs >= rhs,
            CmpOp::Le => lhs <= rhs,
            CmpOp::Eq => (lhs - rhs).abs() < f64::EPSILON,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Cmp { path: String, op: CmpOp, value: f64 },
    Var(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Op(CmpOp),
    Number(f64),
    Ident(String),
}

fn tokenize(input: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '>' | '<' | '=' => {
                let two = chars.get(i + 1) == Some(&'=');
                let op = match (c, two) {
                    ('>', true) => CmpOp::Ge,
                    ('>', false) => CmpOp::Gt,
                    ('<', true) => CmpOp::Le,
                    ('<', false) => CmpOp::Lt,
                    ('=', true) => CmpOp::Eq,
                    // Lone '=' is not part of the grammar.
                    ('=', false) => return None,
                    _ => unreachable!(),
                };
                tokens.push(Token::Op(op));
                i += if two { 2 } else { 1 };
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(Token::Number(text.parse().ok()?));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.to_ascii_uppercase().as_str() {
                    "AND" => tokens.push(Token::And),
                    "OR" => tokens.push(Token::Or),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            _ => return None,
        }
    }
    Some(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expr(&mut self) -> Option<Expr> {
        let mut lhs = self.term()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let rhs = self.term()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Some(lhs)
    }

    fn term(&mut self) -> Option<Expr> {
        let mut lhs = self.factor()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let rhs = self.factor()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Some(lhs)
    }

    fn factor(&mut self) -> Option<Expr> {
        match self.next()? {
            Token::LParen => {
                let inner = self.expr()?;
                match self.next()? {
                    Token::RParen => Some(inner),
                    _ => None,
                }
            }
            Token::Ident(path) => {
                if let Some(Token::Op(op)) = self.peek().cloned() {
                    self.next();
                    match self.next()? {
                        Token::Number(value) => Some(Expr::Cmp { path, op, value }),
                        _ => None,
                    }
                } else {
                    Some(Expr::Var(path))
                }
            }
            _ => None,
        }
    }
}

/// Parse a condition; `None` when the input does not fit the grammar.
pub fn parse(input: &str) -> Option<Expr> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return None;
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return None;
    }
    Some(expr)
}

fn eval_expr(expr: &Expr, resolve: &dyn Fn(&str) -> Option<f64>) -> bool {
    match expr {
        Expr::Or(a, b) => eval_expr(a, resolve) || eval_expr(b, resolve),
        Expr::And(a, b) => eval_expr(a, resolve) && eval_expr(b, resolve),
        Expr::Cmp { path, op, value } => match resolve(path) {
            Some(lhs) => op.apply(lhs, *value),
            None => false,
        },
        Expr::Var(path) => resolve(path).map(|v| v != 0.0).unwrap_or(false),
    }
}

/// Total evaluation: unparseable input or unresolved paths yield `false`.
pub fn evaluate(input: &str, resolve: &dyn Fn(&str) -> Option<f64>) -> bool {
    match parse(input) {
        Some(expr) => eval_expr(&expr, resolve),
        None => {
            warn!(condition = input, "unparseable condition evaluated to false");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ctx(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn eval(input: &str, vars: &HashMap<String, f64>) -> bool {
        evaluate(input, &|path| vars.get(path).copied())
    }

    #[test]
    fn test_variables_and_boolean_ops() {
        let vars = ctx(&[("task_a_completed", 1.0), ("task_b_completed", 0.0)]);
        assert!(eval("task_a_completed", &vars));
        assert!(!eval("task_b_completed", &vars));
        assert!(!eval("task_a_completed AND task_b_completed", &vars));
        assert!(eval("task_a_completed OR task_b_completed", &vars));
    }

    #[test]
    fn test_comparisons() {
        let vars = ctx(&[("resources.cpu.utilization", 85.0), ("summary.error_rate", 0.02)]);
        assert!(eval("resources.cpu.utilization > 80", &vars));
        assert!(!eval("resources.cpu.utilization >= 90", &vars));
        assert!(eval("summary.error_rate <= 0.02", &vars));
        assert!(eval("resources.cpu.utilization == 85", &vars));
        assert!(eval(
            "resources.cpu.utilization > 80 AND summary.error_rate < 0.05",
            &vars
        ));
    }

    #[test]
    fn test_precedence_and_parentheses() {
        let vars = ctx(&[("a", 1.0), ("b", 0.0), ("c", 1.0)]);
        // AND binds tighter than OR.
        assert!(eval("a OR b AND b", &vars));
        assert!(!eval("(a OR b) AND b", &vars));
        assert!(eval("(a OR b) AND c", &vars));
    }

    #[test]
    fn test_unparseable_is_false() {
        let vars = ctx(&[("a", 1.0)]);
        assert!(!eval("", &vars));
        assert!(!eval("a AND", &vars));
        assert!(!eval("a ==", &vars));
        assert!(!eval("((a)", &vars));
        assert!(!eval("a ! b", &vars));
        assert!(!eval("42 > a", &vars));
    }

    #[test]
    fn test_unknown_path_is_false() {
        let vars = ctx(&[]);
        assert!(!eval("missing_variable", &vars));
        assert!(!eval("missing.path > 1", &vars));
        // But an OR with a resolvable side still fires.
        let vars = ctx(&[("present", 1.0)]);
        assert!(eval("missing OR present", &vars));
    }

    #[test]
    fn test_negative_numbers() {
        let vars = ctx(&[("delta", -3.0)]);
        assert!(eval("delta < -1", &vars));
        assert!(!eval("delta > -1", &vars));
    }

    #[test]
    fn test_case_insensitive_keywords() {
        let vars = ctx(&[("a", 1.0), ("b", 1.0)]);
        assert!(eval("a and b", &vars));
        assert!(eval("a or b", &vars));
    }
}
