//! Parser for query literals.
//!
//! Two stages: tokens are read into a generic nested [`Literal`], which is
//! then checked against the tag grammar:
//!
//! ```text
//! query := ( "e" , ids-batch )
//!        | ( "p" , [ rel, ... ] , query )
//!        | ( "i" , query , query , ... )
//!        | ( "u" , query , query , ... )
//!        | ( "n" , query )
//! ids-batch := [ id, ... ] | [ [id], ... ]
//! ```

use super::ast::{QueryTag, StructuredQuery};
use super::token::Token;
use crate::error::{Q2PError, Result};
use logos::Logos;

/// Deepest sequence nesting accepted before giving up with a parse error.
pub const MAX_DEPTH: usize = 256;

/// Untyped nested literal.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Seq(Vec<Literal>),
    Str(String),
    Int(usize),
}

/// Parser state.
pub struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    end: usize,
    /// Sequences currently open
    depth: usize,
}

impl Parser {
    /// Tokenize the input, failing on the first unrecognised character.
    pub fn new(input: &str) -> Result<Self> {
        let mut tokens = Vec::new();
        for (token, span) in Token::lexer(input).spanned() {
            match token {
                Ok(t) => tokens.push((t, span.start)),
                Err(()) => {
                    return Err(Q2PError::Parse {
                        position: span.start,
                        message: format!("unexpected input {:?}", &input[span]),
                    })
                }
            }
        }
        Ok(Self {
            tokens,
            pos: 0,
            end: input.len(),
            depth: 0,
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    /// Byte offset of the current token, or end of input.
    fn position(&self) -> usize {
        self.tokens.get(self.pos).map(|(_, p)| *p).unwrap_or(self.end)
    }

    fn error<T>(&self, message: impl Into<String>) -> Result<T> {
        Err(Q2PError::Parse {
            position: self.position(),
            message: message.into(),
        })
    }

    /// Parse one literal value.
    pub fn parse_literal(&mut self) -> Result<Literal> {
        let position = self.position();
        match self.next() {
            Some(Token::Str(s)) => Ok(Literal::Str(s)),
            Some(Token::Int(n)) => Ok(Literal::Int(n)),
            Some(open) if open.is_open() => self.parse_seq(open, position),
            Some(t) => Err(Q2PError::Parse {
                position,
                message: format!("unexpected token {}", t),
            }),
            None => self.error("unexpected end of input"),
        }
    }

    /// Parse the elements of a sequence after its opening bracket.
    fn parse_seq(&mut self, open: Token, start: usize) -> Result<Literal> {
        let close = match open {
            Token::LParen => Token::RParen,
            _ => Token::RBracket,
        };
        if self.depth == MAX_DEPTH {
            return Err(Q2PError::Parse {
                position: start,
                message: format!("nesting deeper than {} levels", MAX_DEPTH),
            });
        }
        self.depth += 1;

        let mut elements = Vec::new();
        loop {
            match self.peek() {
                Some(t) if *t == close => {
                    self.next();
                    break;
                }
                Some(t) if t.is_close() => {
                    let found = t.clone();
                    return self.error(format!(
                        "mismatched {} closing sequence opened at {}",
                        found, start
                    ));
                }
                Some(_) => {}
                None => return self.error(format!("unclosed {} opened at {}", open, start)),
            }

            elements.push(self.parse_literal()?);

            // Separator; a trailing comma before the close is allowed: ("e",)
            match self.peek() {
                Some(Token::Comma) => {
                    self.next();
                }
                Some(t) if t.is_close() => {}
                None => {}
                Some(t) => {
                    let found = t.clone();
                    return self.error(format!("expected ',' or closing bracket, got {}", found));
                }
            }
        }
        self.depth -= 1;
        Ok(Literal::Seq(elements))
    }

    /// Parse a complete query, rejecting trailing input.
    pub fn parse_query(&mut self) -> Result<StructuredQuery> {
        let literal = self.parse_literal()?;
        if let Some(t) = self.peek() {
            let t = t.clone();
            return self.error(format!("trailing input starting at {}", t));
        }
        query_from_literal(&literal)
    }
}

fn ids_of(literal: &Literal, what: &str) -> Result<Vec<usize>> {
    let Literal::Seq(items) = literal else {
        return Err(Q2PError::MalformedQuery(format!(
            "expected a list of {} ids",
            what
        )));
    };
    items
        .iter()
        .map(|item| match item {
            Literal::Int(id) => Ok(*id),
            // A batch element given as a singleton list: [[3], [7]]
            Literal::Seq(inner) => match inner.as_slice() {
                [Literal::Int(id)] => Ok(*id),
                _ => Err(Q2PError::MalformedQuery(format!(
                    "each {} batch element must hold exactly one id, got {} items",
                    what,
                    inner.len()
                ))),
            },
            Literal::Str(s) => Err(Q2PError::MalformedQuery(format!(
                "expected {} id, got string {:?}",
                what, s
            ))),
        })
        .collect()
}

/// Convert an untyped literal into a typed query, enforcing tag arity.
pub fn query_from_literal(literal: &Literal) -> Result<StructuredQuery> {
    let Literal::Seq(items) = literal else {
        return Err(Q2PError::MalformedQuery(
            "query node must be a sequence starting with a tag".into(),
        ));
    };
    let tag = match items.first() {
        Some(Literal::Str(tag)) => QueryTag::from_tag(tag)?,
        _ => {
            return Err(Q2PError::MalformedQuery(
                "query node must start with a tag string".into(),
            ))
        }
    };
    let args = &items[1..];

    let expect_arity = |n: usize| -> Result<()> {
        if args.len() != n {
            return Err(Q2PError::MalformedQuery(format!(
                "'{}' takes {} argument(s), got {}",
                tag,
                n,
                args.len()
            )));
        }
        Ok(())
    };

    match tag {
        QueryTag::Entity => {
            expect_arity(1)?;
            Ok(StructuredQuery::entity(ids_of(&args[0], "entity")?))
        }
        QueryTag::Projection => {
            expect_arity(2)?;
            let relations = ids_of(&args[0], "relation")?;
            let query = query_from_literal(&args[1])?;
            Ok(query.project(relations))
        }
        QueryTag::Negation => {
            expect_arity(1)?;
            Ok(query_from_literal(&args[0])?.not())
        }
        QueryTag::Intersection | QueryTag::Union => {
            if args.len() < 2 {
                return Err(Q2PError::MalformedQuery(format!(
                    "'{}' needs at least 2 sub-queries, got {}",
                    tag,
                    args.len()
                )));
            }
            let queries = args
                .iter()
                .map(query_from_literal)
                .collect::<Result<Vec<_>>>()?;
            Ok(if tag == QueryTag::Intersection {
                StructuredQuery::and(queries)
            } else {
                StructuredQuery::or(queries)
            })
        }
    }
}

/// Convenience function to parse a single query literal.
pub fn parse_query(input: &str) -> Result<StructuredQuery> {
    Parser::new(input)?.parse_query()
}
