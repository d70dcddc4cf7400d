//! Token definitions for query literals.
//!
//! Uses the `logos` crate for fast lexing. Both tuple notation
//! `("p", [5], ("e", [[3]]))` and JSON arrays `["p", [5], ["e", [[3]]]]`
//! lex to the same stream.

use logos::Logos;

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
pub enum Token {
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token(",")]
    Comma,

    /// Quoted tag, single or double quotes.
    #[regex(r#""[^"]*""#, |lex| unquote(lex.slice()))]
    #[regex(r"'[^']*'", |lex| unquote(lex.slice()))]
    Str(String),

    #[regex(r"[0-9]+", |lex| lex.slice().parse::<usize>().ok())]
    Int(usize),
}

fn unquote(s: &str) -> String {
    s[1..s.len() - 1].to_string()
}

impl Token {
    /// Whether this token opens a sequence.
    pub fn is_open(&self) -> bool {
        matches!(self, Token::LParen | Token::LBracket)
    }

    /// Whether this token closes a sequence.
    pub fn is_close(&self) -> bool {
        matches!(self, Token::RParen | Token::RBracket)
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Comma => write!(f, ","),
            Token::Str(s) => write!(f, "{:?}", s),
            Token::Int(n) => write!(f, "{}", n),
        }
    }
}
