//! Syntax module: query tree, lexer and literal parser.

pub mod ast;
mod parser;
mod token;

pub use ast::{QueryTag, StructuredQuery};
pub use parser::{parse_query, query_from_literal, Literal, Parser};
pub use token::Token;
