//! Tokenizer for the SQL dialect.

use crate::error::{LixError, Result};

#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    /// Bare word; keywords are recognized case-insensitively by the parser.
    Word(String),
    /// `"name"` or `` `name` ``.
    QuotedIdent(String),
    String(String),
    Number(String),
    Param,
    Comma,
    Dot,
    Semicolon,
    LParen,
    RParen,
    Star,
    Plus,
    Minus,
    Slash,
    Percent,
    Concat,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub offset: usize,
}

fn error(offset: usize, message: impl Into<String>) -> LixError {
    LixError::SqlParse {
        offset,
        message: message.into(),
    }
}

pub fn tokenize(sql: &str) -> Result<Vec<Spanned>> {
    let chars: Vec<(usize, char)> = sql.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);
        let mut push = |token: Token, width: usize| {
            tokens.push(Spanned { token, offset });
            width
        };

        let advance = match c {
            c if c.is_whitespace() => 1,
            '-' if next == Some('-') => {
                while i < chars.len() && chars[i].1 != '\n' {
                    i += 1;
                }
                0
            }
            ',' => push(Token::Comma, 1),
            '.' if !next.map_or(false, |n| n.is_ascii_digit()) => push(Token::Dot, 1),
            ';' => push(Token::Semicolon, 1),
            '(' => push(Token::LParen, 1),
            ')' => push(Token::RParen, 1),
            '*' => push(Token::Star, 1),
            '+' => push(Token::Plus, 1),
            '-' => push(Token::Minus, 1),
            '/' => push(Token::Slash, 1),
            '%' => push(Token::Percent, 1),
            '?' => push(Token::Param, 1),
            '|' if next == Some('|') => push(Token::Concat, 2),
            '=' if next == Some('=') => push(Token::Eq, 2),
            '=' => push(Token::Eq, 1),
            '!' if next == Some('=') => push(Token::NotEq, 2),
            '<' if next == Some('>') => push(Token::NotEq, 2),
            '<' if next == Some('=') => push(Token::LtEq, 2),
            '<' => push(Token::Lt, 1),
            '>' if next == Some('=') => push(Token::GtEq, 2),
            '>' => push(Token::Gt, 1),
            '\'' | '"' | '`' => {
                let quote = c;
                let mut text = String::new();
                let mut j = i + 1;
                loop {
                    match chars.get(j) {
                        None => return Err(error(offset, "unterminated quoted text")),
                        Some((_, ch)) if *ch == quote => {
                            if chars.get(j + 1).map(|(_, c)| *c) == Some(quote) {
                                text.push(quote);
                                j += 2;
                            } else {
                                j += 1;
                                break;
                            }
                        }
                        Some((_, ch)) => {
                            text.push(*ch);
                            j += 1;
                        }
                    }
                }
                let token = if quote == '\'' {
                    Token::String(text)
                } else {
                    Token::QuotedIdent(text)
                };
                push(token, j - i)
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut j = i;
                let mut seen_dot = false;
                while let Some((_, ch)) = chars.get(j) {
                    if ch.is_ascii_digit() {
                        j += 1;
                    } else if *ch == '.' && !seen_dot {
                        seen_dot = true;
                        j += 1;
                    } else {
                        break;
                    }
                }
                let text: String = chars[i..j].iter().map(|(_, c)| c).collect();
                push(Token::Number(text), j - i)
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut j = i;
                while chars
                    .get(j)
                    .map_or(false, |(_, ch)| ch.is_alphanumeric() || *ch == '_')
                {
                    j += 1;
                }
                let text: String = chars[i..j].iter().map(|(_, c)| c).collect();
                push(Token::Word(text), j - i)
            }
            other => return Err(error(offset, format!("unexpected character '{other}'"))),
        };
        i += advance;
    }

    Ok(tokens)
}
