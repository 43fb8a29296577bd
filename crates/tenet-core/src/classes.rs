//! Class expressions: the guard sublanguage.
//!
//! Class expressions are infix boolean terms over class names with `!`,
//! `&`/`.` (and), `|`/`||` (or), parentheses, and the regex literals
//! `class_matching(/re/)` and `class_count(/re/, min..max)`. Evaluation is
//! short-circuit and pure; invalid syntax is a parse error that the
//! dispatcher turns into a `FAIL` outcome on the owning promise.

use regex::Regex;
use thiserror::Error;

/// Class expression errors.
#[derive(Debug, Error)]
pub enum ClassExprError {
    /// The expression contained an unexpected token.
    #[error("invalid class expression at '{0}'")]
    Syntax(String),

    /// The expression ended prematurely.
    #[error("unexpected end of class expression")]
    UnexpectedEnd,

    /// A `class_matching`/`class_count` regex failed to compile.
    #[error("invalid regex in class expression: {0}")]
    Regex(#[from] regex::Error),
}

/// What an expression is evaluated against: a view over the combined class
/// sets of the evaluation context.
pub trait ClassQuery {
    /// Whether a single (canonical) class is defined.
    fn is_defined(&self, name: &str) -> bool;

    /// How many defined classes match the pattern in full.
    fn count_matching(&self, pattern: &Regex) -> usize;
}

/// Parsed class expression.
#[derive(Debug, Clone)]
pub enum ClassExpr {
    /// A single class name.
    Ident(String),
    /// Negation.
    Not(Box<ClassExpr>),
    /// Conjunction, short-circuit left to right.
    And(Vec<ClassExpr>),
    /// Disjunction, short-circuit left to right.
    Or(Vec<ClassExpr>),
    /// True when at least one defined class matches.
    Matching(Regex),
    /// True when the match count falls within the inclusive range.
    Count {
        /// Pattern applied to every defined class.
        pattern: Regex,
        /// Inclusive lower bound.
        min: usize,
        /// Inclusive upper bound.
        max: usize,
    },
}

impl ClassExpr {
    /// Parse an expression.
    ///
    /// # Errors
    ///
    /// Returns a syntax or regex error; never panics on malformed input.
    pub fn parse(input: &str) -> Result<Self, ClassExprError> {
        let mut parser = Parser::new(input);
        let expr = parser.parse_or()?;
        parser.skip_ws();
        if !parser.at_end() {
            return Err(ClassExprError::Syntax(parser.rest().to_string()));
        }
        Ok(expr)
    }

    /// Evaluate against a class view. Pure: no side effects on the context.
    pub fn eval(&self, query: &dyn ClassQuery) -> bool {
        match self {
            Self::Ident(name) => query.is_defined(name),
            Self::Not(inner) => !inner.eval(query),
            Self::And(terms) => terms.iter().all(|t| t.eval(query)),
            Self::Or(terms) => terms.iter().any(|t| t.eval(query)),
            Self::Matching(pattern) => query.count_matching(pattern) > 0,
            Self::Count { pattern, min, max } => {
                let n = query.count_matching(pattern);
                n >= *min && n <= *max
            }
        }
    }
}

/// Canonicalise a class or handle name: alphanumerics and `_` pass
/// through, every other byte becomes `_`.
#[must_use]
pub fn canonify(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.bump();
        }
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> Result<(), ClassExprError> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(self
                .peek()
                .map_or(ClassExprError::UnexpectedEnd, |_| {
                    ClassExprError::Syntax(self.rest().to_string())
                }))
        }
    }

    fn parse_or(&mut self) -> Result<ClassExpr, ClassExprError> {
        let mut terms = vec![self.parse_and()?];
        loop {
            self.skip_ws();
            if self.eat('|') {
                self.eat('|'); // `||` and `|` are the same operator
                terms.push(self.parse_and()?);
            } else {
                break;
            }
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            ClassExpr::Or(terms)
        })
    }

    fn parse_and(&mut self) -> Result<ClassExpr, ClassExprError> {
        let mut terms = vec![self.parse_not()?];
        loop {
            self.skip_ws();
            if self.eat('.') || self.eat('&') {
                terms.push(self.parse_not()?);
            } else {
                break;
            }
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            ClassExpr::And(terms)
        })
    }

    fn parse_not(&mut self) -> Result<ClassExpr, ClassExprError> {
        self.skip_ws();
        if self.eat('!') {
            Ok(ClassExpr::Not(Box::new(self.parse_not()?)))
        } else {
            self.parse_atom()
        }
    }

    fn parse_atom(&mut self) -> Result<ClassExpr, ClassExprError> {
        self.skip_ws();
        match self.peek() {
            Some('(') => {
                self.bump();
                let expr = self.parse_or()?;
                self.skip_ws();
                self.expect(')')?;
                Ok(expr)
            }
            Some(c) if is_ident_char(c) => {
                let ident = self.parse_ident();
                match ident.as_str() {
                    "class_matching" => {
                        self.skip_ws();
                        self.expect('(')?;
                        let pattern = self.parse_regex_literal()?;
                        self.skip_ws();
                        self.expect(')')?;
                        Ok(ClassExpr::Matching(pattern))
                    }
                    "class_count" => {
                        self.skip_ws();
                        self.expect('(')?;
                        let pattern = self.parse_regex_literal()?;
                        self.skip_ws();
                        self.expect(',')?;
                        let min = self.parse_number()?;
                        self.expect('.')?;
                        self.expect('.')?;
                        let max = self.parse_number()?;
                        self.skip_ws();
                        self.expect(')')?;
                        Ok(ClassExpr::Count { pattern, min, max })
                    }
                    _ => Ok(ClassExpr::Ident(ident)),
                }
            }
            Some(_) => Err(ClassExprError::Syntax(self.rest().to_string())),
            None => Err(ClassExprError::UnexpectedEnd),
        }
    }

    fn parse_ident(&mut self) -> String {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if is_ident_char(c)) {
            self.bump();
        }
        self.input[start..self.pos].to_string()
    }

    fn parse_regex_literal(&mut self) -> Result<Regex, ClassExprError> {
        self.skip_ws();
        self.expect('/')?;
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == '/' {
                break;
            }
            self.bump();
        }
        let pattern = &self.input[start..self.pos];
        self.expect('/')?;
        // Anchor: classes must match the pattern in full.
        Ok(Regex::new(&format!("^(?:{pattern})$"))?)
    }

    fn parse_number(&mut self) -> Result<usize, ClassExprError> {
        self.skip_ws();
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.bump();
        }
        self.input[start..self.pos]
            .parse()
            .map_err(|_| ClassExprError::Syntax(self.rest().to_string()))
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == ':'
}
