//! Filter predicates and the text form parser
//!
//! Filters arrive either as structured values or as compact text
//! (`"dec" > 2`, `model like 'Merc%'`, `gear in (3, 4)`). The text form is
//! what table UIs send; parsing happens once here and rendering to a concrete
//! SQL dialect happens in the backend adapter.

use crate::{Result, TableError};
use serde::{Deserialize, Serialize};

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Like,
    ILike,
    In,
    IsNull,
    IsNotNull,
}

/// A literal appearing on the right side of a predicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
    List(Vec<FilterValue>),
}

/// One filter predicate over a single column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub op: CompareOp,
    pub value: FilterValue,
}

impl Filter {
    pub fn new(column: impl Into<String>, op: CompareOp, value: FilterValue) -> Self {
        Self {
            column: column.into(),
            op,
            value,
        }
    }

    /// Parse the compact text form: `column op literal`.
    ///
    /// Columns may be double-quoted; string literals are single-quoted with
    /// `''` escaping; `in` takes a parenthesized list; `is null` and
    /// `is not null` take no literal.
    pub fn parse(input: &str) -> Result<Filter> {
        let mut p = Parser::new(input);
        let column = p.ident()?;
        let op = p.op()?;
        let value = match op {
            CompareOp::IsNull | CompareOp::IsNotNull => FilterValue::Null,
            CompareOp::In => p.list()?,
            _ => p.literal()?,
        };
        p.expect_end()?;
        Ok(Filter::new(column, op, value))
    }
}

struct Parser<'a> {
    input: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            chars: input.char_indices().peekable(),
        }
    }

    fn err(&self, what: &str) -> TableError {
        TableError::QueryTranslation(format!("cannot parse filter {:?}: {}", self.input, what))
    }

    fn skip_ws(&mut self) {
        while matches!(self.chars.peek(), Some((_, c)) if c.is_whitespace()) {
            self.chars.next();
        }
    }

    /// A bare or double-quoted identifier
    fn ident(&mut self) -> Result<String> {
        self.skip_ws();
        match self.chars.peek().copied() {
            Some((_, '"')) => {
                self.chars.next();
                let mut out = String::new();
                loop {
                    match self.chars.next() {
                        Some((_, '"')) => {
                            // "" inside quotes is an escaped quote
                            if matches!(self.chars.peek(), Some((_, '"'))) {
                                self.chars.next();
                                out.push('"');
                            } else {
                                return Ok(out);
                            }
                        }
                        Some((_, c)) => out.push(c),
                        None => return Err(self.err("unterminated quoted identifier")),
                    }
                }
            }
            Some((_, c)) if c.is_alphanumeric() || c == '_' || c == '.' => {
                let mut out = String::new();
                while let Some((_, c)) = self.chars.peek().copied() {
                    if c.is_alphanumeric() || c == '_' || c == '.' {
                        out.push(c);
                        self.chars.next();
                    } else {
                        break;
                    }
                }
                Ok(out)
            }
            _ => Err(self.err("expected column name")),
        }
    }

    fn op(&mut self) -> Result<CompareOp> {
        self.skip_ws();
        // symbolic operators first
        let pos = self.pos();
        let rest = &self.input[pos..];
        for (sym, op) in [
            (">=", CompareOp::GtEq),
            ("<=", CompareOp::LtEq),
            ("!=", CompareOp::NotEq),
            ("<>", CompareOp::NotEq),
            (">", CompareOp::Gt),
            ("<", CompareOp::Lt),
            ("=", CompareOp::Eq),
        ] {
            if rest.starts_with(sym) {
                for _ in 0..sym.len() {
                    self.chars.next();
                }
                return Ok(op);
            }
        }
        // word operators
        let word = self.word()?;
        match word.to_ascii_lowercase().as_str() {
            "like" => Ok(CompareOp::Like),
            "ilike" => Ok(CompareOp::ILike),
            "in" => Ok(CompareOp::In),
            "is" => {
                let next = self.word()?;
                match next.to_ascii_lowercase().as_str() {
                    "null" => Ok(CompareOp::IsNull),
                    "not" => {
                        let last = self.word()?;
                        if last.eq_ignore_ascii_case("null") {
                            Ok(CompareOp::IsNotNull)
                        } else {
                            Err(self.err("expected NULL after IS NOT"))
                        }
                    }
                    _ => Err(self.err("expected NULL after IS")),
                }
            }
            _ => Err(self.err("unknown operator")),
        }
    }

    fn word(&mut self) -> Result<String> {
        self.skip_ws();
        let mut out = String::new();
        while let Some((_, c)) = self.chars.peek().copied() {
            if c.is_alphanumeric() || c == '_' {
                out.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        if out.is_empty() {
            Err(self.err("expected word"))
        } else {
            Ok(out)
        }
    }

    fn literal(&mut self) -> Result<FilterValue> {
        self.skip_ws();
        match self.chars.peek().copied() {
            Some((_, '\'')) => {
                self.chars.next();
                let mut out = String::new();
                loop {
                    match self.chars.next() {
                        Some((_, '\'')) => {
                            if matches!(self.chars.peek(), Some((_, '\''))) {
                                self.chars.next();
                                out.push('\'');
                            } else {
                                return Ok(FilterValue::Text(out));
                            }
                        }
                        Some((_, c)) => out.push(c),
                        None => return Err(self.err("unterminated string literal")),
                    }
                }
            }
            Some((_, c)) if c == '-' || c == '+' || c.is_ascii_digit() => {
                let mut out = String::new();
                while let Some((_, c)) = self.chars.peek().copied() {
                    if c == '-' || c == '+' || c == '.' || c == 'e' || c == 'E' || c.is_ascii_digit()
                    {
                        out.push(c);
                        self.chars.next();
                    } else {
                        break;
                    }
                }
                if let Ok(i) = out.parse::<i64>() {
                    Ok(FilterValue::Int(i))
                } else if let Ok(f) = out.parse::<f64>() {
                    Ok(FilterValue::Float(f))
                } else {
                    Err(self.err("malformed number"))
                }
            }
            Some((_, c)) if c.is_alphabetic() => {
                let word = self.word()?;
                match word.to_ascii_lowercase().as_str() {
                    "true" => Ok(FilterValue::Bool(true)),
                    "false" => Ok(FilterValue::Bool(false)),
                    "null" => Ok(FilterValue::Null),
                    _ => Err(self.err("unquoted string literal")),
                }
            }
            _ => Err(self.err("expected literal")),
        }
    }

    fn list(&mut self) -> Result<FilterValue> {
        self.skip_ws();
        match self.chars.next() {
            Some((_, '(')) => {}
            _ => return Err(self.err("expected ( after IN")),
        }
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if matches!(self.chars.peek(), Some((_, ')'))) {
                self.chars.next();
                break;
            }
            items.push(self.literal()?);
            self.skip_ws();
            match self.chars.peek().copied() {
                Some((_, ',')) => {
                    self.chars.next();
                }
                Some((_, ')')) => {}
                _ => return Err(self.err("expected , or ) in IN list")),
            }
        }
        if items.is_empty() {
            return Err(TableError::QueryTranslation(format!(
                "cannot parse filter {:?}: empty IN list",
                self.input
            )));
        }
        Ok(FilterValue::List(items))
    }

    fn expect_end(&mut self) -> Result<()> {
        self.skip_ws();
        if self.chars.peek().is_some() {
            Err(self.err("trailing input after predicate"))
        } else {
            Ok(())
        }
    }

    fn pos(&mut self) -> usize {
        self.chars
            .peek()
            .map(|(i, _)| *i)
            .unwrap_or(self.input.len())
    }
}
