//! Pattern clause interpreter
//!
//! A pattern is a list of clause strings from a plugin configuration file,
//! for example `["after 2 minutes", "type = request"]`. Clauses compile
//! all-or-nothing at startup and evaluate as a conjunction against each
//! observed message plus the elapsed session time.
//!
//! Grammar (case-insensitive):
//!   before <int> minute(s)|second(s)|millisecond(s)
//!   after  <int> minute(s)|second(s)|millisecond(s)
//!   msgno = <int>          (alias: num)
//!   type  = request|response|error   (aliases: msg, rpy, err)
//!
//! There is deliberately no OR or negation.

use std::time::Duration;

use thiserror::Error;

use crate::message::{Message, MessageKind};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PatternError {
    #[error("unexpected character {found:?} in clause {clause:?}")]
    BadCharacter { clause: String, found: char },
    #[error("empty clause")]
    EmptyClause,
    #[error("unknown clause keyword {keyword:?} in {clause:?}")]
    UnknownKeyword { clause: String, keyword: String },
    #[error("unknown time unit {unit:?} in {clause:?}")]
    UnknownUnit { clause: String, unit: String },
    #[error("unknown message type {value:?} in {clause:?}")]
    UnknownType { clause: String, value: String },
    #[error("expected {expected} in clause {clause:?}")]
    Expected {
        clause: String,
        expected: &'static str,
    },
    #[error("trailing input after clause {clause:?}")]
    TrailingInput { clause: String },
}

#[derive(Debug, PartialEq, Eq)]
enum Token {
    Ident(String),
    Int(u64),
    Eq,
}

fn lex(clause: &str) -> Result<Vec<Token>, PatternError> {
    let mut tokens = Vec::new();
    let mut chars = clause.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '=' {
            chars.next();
            // `==` is accepted as a synonym for `=`
            if chars.peek() == Some(&'=') {
                chars.next();
            }
            tokens.push(Token::Eq);
        } else if c.is_ascii_digit() {
            let mut value: u64 = 0;
            while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
                value = value.wrapping_mul(10).wrapping_add(u64::from(d));
                chars.next();
            }
            tokens.push(Token::Int(value));
        } else if c.is_ascii_alphabetic() {
            let mut word = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_ascii_alphabetic() {
                    word.push(c.to_ascii_lowercase());
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Ident(word));
        } else {
            return Err(PatternError::BadCharacter {
                clause: clause.to_string(),
                found: c,
            });
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Clause {
    Before(Duration),
    After(Duration),
    MsgNo(u64),
    Kind(MessageKind),
}

struct Parser<'a> {
    clause: &'a str,
    tokens: std::vec::IntoIter<Token>,
}

impl<'a> Parser<'a> {
    fn new(clause: &'a str, tokens: Vec<Token>) -> Self {
        Self {
            clause,
            tokens: tokens.into_iter(),
        }
    }

    fn expected(&self, expected: &'static str) -> PatternError {
        PatternError::Expected {
            clause: self.clause.to_string(),
            expected,
        }
    }

    fn int(&mut self) -> Result<u64, PatternError> {
        match self.tokens.next() {
            Some(Token::Int(n)) => Ok(n),
            _ => Err(self.expected("an integer")),
        }
    }

    fn eq(&mut self) -> Result<(), PatternError> {
        match self.tokens.next() {
            Some(Token::Eq) => Ok(()),
            _ => Err(self.expected("'='")),
        }
    }

    fn ident(&mut self, expected: &'static str) -> Result<String, PatternError> {
        match self.tokens.next() {
            Some(Token::Ident(word)) => Ok(word),
            _ => Err(self.expected(expected)),
        }
    }

    fn duration(&mut self) -> Result<Duration, PatternError> {
        let amount = self.int()?;
        let unit = self.ident("a time unit")?;
        match unit.as_str() {
            "minute" | "minutes" => Ok(Duration::from_secs(amount.saturating_mul(60))),
            "second" | "seconds" => Ok(Duration::from_secs(amount)),
            "millisecond" | "milliseconds" => Ok(Duration::from_millis(amount)),
            _ => Err(PatternError::UnknownUnit {
                clause: self.clause.to_string(),
                unit,
            }),
        }
    }

    fn kind(&mut self) -> Result<MessageKind, PatternError> {
        let value = self.ident("a message type")?;
        match value.as_str() {
            "request" | "msg" => Ok(MessageKind::Request),
            "response" | "rpy" => Ok(MessageKind::Response),
            "error" | "err" => Ok(MessageKind::Error),
            _ => Err(PatternError::UnknownType {
                clause: self.clause.to_string(),
                value,
            }),
        }
    }

    fn clause(&mut self) -> Result<Clause, PatternError> {
        let keyword = match self.tokens.next() {
            Some(Token::Ident(word)) => word,
            None => return Err(PatternError::EmptyClause),
            _ => return Err(self.expected("a clause keyword")),
        };
        let clause = match keyword.as_str() {
            "before" => Clause::Before(self.duration()?),
            "after" => Clause::After(self.duration()?),
            "msgno" | "num" => {
                self.eq()?;
                Clause::MsgNo(self.int()?)
            }
            "type" => {
                self.eq()?;
                Clause::Kind(self.kind()?)
            }
            _ => {
                return Err(PatternError::UnknownKeyword {
                    clause: self.clause.to_string(),
                    keyword,
                })
            }
        };
        if self.tokens.next().is_some() {
            return Err(PatternError::TrailingInput {
                clause: self.clause.to_string(),
            });
        }
        Ok(clause)
    }
}

/// A compiled conjunction of clauses. Compilation happens once at plugin
/// setup; evaluation is cheap and allocation-free.
#[derive(Debug, Clone, Default)]
pub struct Pattern {
    clauses: Vec<Clause>,
}

impl Pattern {
    /// Compile every clause or fail with the first offending one. A
    /// partially-compiled pattern is never observable.
    pub fn compile(clauses: &[String]) -> Result<Self, PatternError> {
        let mut compiled = Vec::with_capacity(clauses.len());
        for raw in clauses {
            let tokens = lex(raw)?;
            compiled.push(Parser::new(raw, tokens).clause()?);
        }
        Ok(Self { clauses: compiled })
    }

    /// True when every clause holds for this message at this point in the
    /// session. The empty pattern is vacuously true.
    pub fn evaluate(&self, message: &Message, elapsed: Duration) -> bool {
        self.clauses.iter().all(|clause| match clause {
            Clause::Before(limit) => elapsed < *limit,
            Clause::After(limit) => elapsed >= *limit,
            Clause::MsgNo(number) => message.number == *number,
            Clause::Kind(kind) => message.kind == *kind,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }
}
