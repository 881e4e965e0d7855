//! Restricted boolean expressions for job gating.
//!
//! The `when` grammar admits only: `and`/`or`/`not`, the six comparison
//! operators, boolean literals (case-insensitive), integer/float/string
//! literals, parentheses, and attribute paths rooted at `jobs`, `job`, or
//! `env`. The string is parsed once into a tree at validation time and
//! evaluated against the job-outputs view; anything outside the grammar is
//! rejected at parse.

use serde_json::Value;

use aetherflow_types::error::{FlowError, Result};

const ALLOWED_ROOTS: &[&str] = &["jobs", "job", "env"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Operand of a comparison or a bare truthiness test.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Attribute path such as `jobs.probe.outputs.has_data`.
    Path(Vec<String>),
}

/// Parsed gate expression.
#[derive(Debug, Clone, PartialEq)]
pub enum WhenExpr {
    Or(Box<WhenExpr>, Box<WhenExpr>),
    And(Box<WhenExpr>, Box<WhenExpr>),
    Not(Box<WhenExpr>),
    Compare(Operand, CmpOp, Operand),
    Operand(Operand),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    Op(CmpOp),
    Dot,
    LParen,
    RParen,
}

fn parse_error(msg: &str) -> FlowError {
    FlowError::Spec(format!("invalid when expression: {msg}"))
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
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
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CmpOp::Eq));
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CmpOp::Ne));
                i += 2;
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(CmpOp::Le));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CmpOp::Lt));
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(CmpOp::Ge));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CmpOp::Gt));
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let mut j = start;
                while j < chars.len() && chars[j] != quote {
                    j += 1;
                }
                if j >= chars.len() {
                    return Err(parse_error("unterminated string literal"));
                }
                tokens.push(Token::Str(chars[start..j].iter().collect()));
                i = j + 1;
            }
            '0'..='9' => {
                let start = i;
                let mut is_float = false;
                while i < chars.len()
                    && (chars[i].is_ascii_digit() || (chars[i] == '.' && !is_float))
                {
                    // A dot followed by a non-digit belongs to attribute
                    // syntax, not this number.
                    if chars[i] == '.' {
                        if chars.get(i + 1).is_some_and(char::is_ascii_digit) {
                            is_float = true;
                        } else {
                            break;
                        }
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                if is_float {
                    tokens.push(Token::Float(
                        text.parse().map_err(|_| parse_error("bad float literal"))?,
                    ));
                } else {
                    tokens.push(Token::Int(
                        text.parse().map_err(|_| parse_error("bad integer literal"))?,
                    ));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(parse_error(&format!("unexpected character '{other}'"))),
        }
    }
    Ok(tokens)
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
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn peek_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(id)) if id == kw)
    }

    fn or_expr(&mut self) -> Result<WhenExpr> {
        let mut lhs = self.and_expr()?;
        while self.peek_keyword("or") {
            self.next();
            let rhs = self.and_expr()?;
            lhs = WhenExpr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<WhenExpr> {
        let mut lhs = self.not_expr()?;
        while self.peek_keyword("and") {
            self.next();
            let rhs = self.not_expr()?;
            lhs = WhenExpr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn not_expr(&mut self) -> Result<WhenExpr> {
        if self.peek_keyword("not") {
            self.next();
            return Ok(WhenExpr::Not(Box::new(self.not_expr()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<WhenExpr> {
        if let Some(Token::LParen) = self.peek() {
            self.next();
            let inner = self.or_expr()?;
            match self.next() {
                Some(Token::RParen) => return Ok(inner),
                _ => return Err(parse_error("expected ')'")),
            }
        }

        let lhs = self.operand()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.next();
            let rhs = self.operand()?;
            return Ok(WhenExpr::Compare(lhs, op, rhs));
        }
        Ok(WhenExpr::Operand(lhs))
    }

    fn operand(&mut self) -> Result<Operand> {
        match self.next() {
            Some(Token::Int(n)) => Ok(Operand::Int(n)),
            Some(Token::Float(f)) => Ok(Operand::Float(f)),
            Some(Token::Str(s)) => Ok(Operand::Str(s)),
            Some(Token::Ident(id)) => {
                if id.eq_ignore_ascii_case("true") {
                    return Ok(Operand::Bool(true));
                }
                if id.eq_ignore_ascii_case("false") {
                    return Ok(Operand::Bool(false));
                }
                let mut path = vec![id];
                while matches!(self.peek(), Some(Token::Dot)) {
                    self.next();
                    match self.next() {
                        Some(Token::Ident(part)) => path.push(part),
                        _ => return Err(parse_error("expected identifier after '.'")),
                    }
                }
                if !ALLOWED_ROOTS.contains(&path[0].as_str()) {
                    return Err(parse_error(&format!(
                        "unsupported name '{}' (allowed roots: jobs, job, env)",
                        path[0]
                    )));
                }
                Ok(Operand::Path(path))
            }
            other => Err(parse_error(&format!("unexpected token {other:?}"))),
        }
    }
}

impl WhenExpr {
    /// Parse a gate expression. An empty or blank string is `None` (gate
    /// always passes).
    ///
    /// # Errors
    ///
    /// Returns a spec error naming the offending construct.
    pub fn parse(input: &str) -> Result<Option<Self>> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        let tokens = tokenize(trimmed)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.or_expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(parse_error("trailing tokens"));
        }
        Ok(Some(expr))
    }

    /// Evaluate against a view such as `{"jobs": {...}, "env": {...}}`.
    ///
    /// Missing attribute paths resolve to null: equal only to another
    /// missing value, unordered otherwise.
    ///
    /// # Errors
    ///
    /// Returns a spec error on type-incompatible ordered comparisons.
    pub fn eval(&self, view: &Value) -> Result<bool> {
        match self {
            Self::Or(a, b) => Ok(a.eval(view)? || b.eval(view)?),
            Self::And(a, b) => Ok(a.eval(view)? && b.eval(view)?),
            Self::Not(inner) => Ok(!inner.eval(view)?),
            Self::Compare(lhs, op, rhs) => {
                compare(&resolve(lhs, view), *op, &resolve(rhs, view))
            }
            Self::Operand(operand) => Ok(truthy(&resolve(operand, view))),
        }
    }
}

fn resolve(operand: &Operand, view: &Value) -> Value {
    match operand {
        Operand::Bool(b) => Value::Bool(*b),
        Operand::Int(n) => Value::from(*n),
        Operand::Float(f) => serde_json::Number::from_f64(*f).map_or(Value::Null, Value::Number),
        Operand::Str(s) => Value::String(s.clone()),
        Operand::Path(path) => {
            let mut cur = view;
            for part in path {
                match cur.as_object().and_then(|o| o.get(part)) {
                    Some(v) => cur = v,
                    None => return Value::Null,
                }
            }
            cur.clone()
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn compare(lhs: &Value, op: CmpOp, rhs: &Value) -> Result<bool> {
    match op {
        CmpOp::Eq => Ok(loose_eq(lhs, rhs)),
        CmpOp::Ne => Ok(!loose_eq(lhs, rhs)),
        ordered => {
            let (Some(a), Some(b)) = (as_number(lhs), as_number(rhs)) else {
                if let (Value::String(a), Value::String(b)) = (lhs, rhs) {
                    return Ok(match ordered {
                        CmpOp::Lt => a < b,
                        CmpOp::Le => a <= b,
                        CmpOp::Gt => a > b,
                        CmpOp::Ge => a >= b,
                        CmpOp::Eq | CmpOp::Ne => unreachable!(),
                    });
                }
                return Err(parse_error(&format!(
                    "cannot order {lhs} against {rhs}"
                )));
            };
            Ok(match ordered {
                CmpOp::Lt => a < b,
                CmpOp::Le => a <= b,
                CmpOp::Gt => a > b,
                CmpOp::Ge => a >= b,
                CmpOp::Eq | CmpOp::Ne => unreachable!(),
            })
        }
    }
}

/// Equality across number representations; other cross-type pairs are
/// simply unequal.
fn loose_eq(lhs: &Value, rhs: &Value) -> bool {
    if let (Value::Number(a), Value::Number(b)) = (lhs, rhs) {
        return a.as_f64() == b.as_f64();
    }
    lhs == rhs
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(expr: &str, view: &Value) -> bool {
        WhenExpr::parse(expr).unwrap().unwrap().eval(view).unwrap()
    }

    #[test]
    fn empty_expression_is_absent() {
        assert!(WhenExpr::parse("").unwrap().is_none());
        assert!(WhenExpr::parse("   ").unwrap().is_none());
    }

    #[test]
    fn job_output_gate() {
        let view = json!({"jobs": {"probe": {"outputs": {"has_data": true, "count": 12}}}});
        assert!(eval("jobs.probe.outputs.has_data == true", &view));
        assert!(!eval("jobs.probe.outputs.has_data == false", &view));
        assert!(eval("jobs.probe.outputs.count > 10", &view));
        assert!(eval("jobs.probe.outputs.count >= 12", &view));
        assert!(!eval("jobs.probe.outputs.count < 12", &view));
    }

    #[test]
    fn boolean_literals_case_insensitive() {
        let view = json!({"jobs": {"a": {"outputs": {"flag": true}}}});
        assert!(eval("jobs.a.outputs.flag == True", &view));
        assert!(eval("jobs.a.outputs.flag != FALSE", &view));
    }

    #[test]
    fn and_or_not_precedence() {
        let view = json!({"jobs": {"a": {"outputs": {"x": 1, "y": 0}}}});
        // `or` binds looser than `and`.
        assert!(eval(
            "jobs.a.outputs.y == 1 or jobs.a.outputs.x == 1 and jobs.a.outputs.y == 0",
            &view
        ));
        assert!(eval("not jobs.a.outputs.y == 1", &view));
        assert!(eval("(jobs.a.outputs.x == 1) and not (jobs.a.outputs.y == 1)", &view));
    }

    #[test]
    fn string_comparison() {
        let view = json!({"jobs": {"a": {"outputs": {"mode": "full"}}}});
        assert!(eval("jobs.a.outputs.mode == 'full'", &view));
        assert!(eval("jobs.a.outputs.mode != \"delta\"", &view));
    }

    #[test]
    fn env_root_allowed() {
        let view = json!({"env": {"REGION": "eu"}});
        assert!(eval("env.REGION == 'eu'", &view));
    }

    #[test]
    fn missing_path_is_null() {
        let view = json!({"jobs": {}});
        assert!(!eval("jobs.ghost.outputs.flag == true", &view));
        assert!(eval("jobs.ghost.outputs.flag != true", &view));
        assert!(!eval("jobs.ghost.outputs.flag", &view));
    }

    #[test]
    fn bare_path_truthiness() {
        let view = json!({"jobs": {"a": {"outputs": {"n": 3, "z": 0, "s": ""}}}});
        assert!(eval("jobs.a.outputs.n", &view));
        assert!(!eval("jobs.a.outputs.z", &view));
        assert!(!eval("jobs.a.outputs.s", &view));
    }

    #[test]
    fn float_literals() {
        let view = json!({"jobs": {"a": {"outputs": {"ratio": 0.75}}}});
        assert!(eval("jobs.a.outputs.ratio > 0.5", &view));
        assert!(!eval("jobs.a.outputs.ratio >= 1.0", &view));
    }

    #[test]
    fn rejects_out_of_grammar_constructs() {
        for bad in [
            "len(jobs.a.outputs.x) > 0",
            "jobs.a.outputs.x + 1 == 2",
            "jobs.a.outputs[0]",
            "__import__",
            "steps.a.out == 1",
            "jobs.a.outputs.x ==",
            "jobs.a.outputs.x == 1 extra",
        ] {
            assert!(WhenExpr::parse(bad).is_err(), "accepted: {bad}");
        }
    }

    #[test]
    fn ordered_comparison_on_mismatched_types_errors() {
        let view = json!({"jobs": {"a": {"outputs": {"mode": "full"}}}});
        let expr = WhenExpr::parse("jobs.a.outputs.mode > 3").unwrap().unwrap();
        assert!(expr.eval(&view).is_err());
    }

    #[test]
    fn int_float_equality_unifies() {
        let view = json!({"jobs": {"a": {"outputs": {"n": 1.0}}}});
        assert!(eval("jobs.a.outputs.n == 1", &view));
    }
}
