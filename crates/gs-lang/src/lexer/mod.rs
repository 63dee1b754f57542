//! Tokenizer for the dataflow expression language.
//!
//! Recognizes identifiers (`[A-Za-z0-9]+`), the three operator glyphs (`;`,
//! `|`, `\|`), parentheses, and whitespace. Any other byte is a lex error
//! carrying the `(line, col)` at which it was found.

use std::fmt;

/// 1-indexed source position, as spec'd for grammar error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pos {
    pub line: usize,
    pub col: usize,
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: Pos,
    pub end: Pos,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Ident(String),
    Semi,       // ;
    Pipe,       // |
    ParPipe,    // \|
    LParen,     // (
    RParen,     // )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LexError {
    #[error("unexpected byte {byte:?} at {pos}")]
    UnexpectedByte { byte: char, pos: Pos },
    #[error("dangling '\\' at {pos} (expected '\\|')")]
    DanglingBackslash { pos: Pos },
}

struct Cursor<'a> {
    bytes: &'a [u8],
    idx: usize,
    line: usize,
    col: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str) -> Self {
        Cursor { bytes: input.as_bytes(), idx: 0, line: 1, col: 1 }
    }

    fn pos(&self) -> Pos {
        Pos { line: self.line, col: self.col }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.idx).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.idx + offset).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.idx += 1;
        if b == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(b)
    }
}

/// Lexes `input` into a token stream, or the first lex error encountered.
pub fn lex(input: &str) -> Result<Vec<Token>, LexError> {
    let mut cur = Cursor::new(input);
    let mut tokens = Vec::new();

    loop {
        // skip whitespace
        while matches!(cur.peek(), Some(b) if (b as char).is_whitespace()) {
            cur.bump();
        }
        let Some(b) = cur.peek() else { break };
        let start = cur.pos();
        match b {
            b';' => {
                cur.bump();
                tokens.push(Token { kind: TokenKind::Semi, span: Span { start, end: cur.pos() } });
            }
            b'|' => {
                cur.bump();
                tokens.push(Token { kind: TokenKind::Pipe, span: Span { start, end: cur.pos() } });
            }
            b'(' => {
                cur.bump();
                tokens.push(Token { kind: TokenKind::LParen, span: Span { start, end: cur.pos() } });
            }
            b')' => {
                cur.bump();
                tokens.push(Token { kind: TokenKind::RParen, span: Span { start, end: cur.pos() } });
            }
            b'\\' => {
                if cur.peek_at(1) == Some(b'|') {
                    cur.bump();
                    cur.bump();
                    tokens.push(Token { kind: TokenKind::ParPipe, span: Span { start, end: cur.pos() } });
                } else {
                    cur.bump();
                    return Err(LexError::DanglingBackslash { pos: start });
                }
            }
            b if b.is_ascii_alphanumeric() => {
                let mut ident = String::new();
                while matches!(cur.peek(), Some(b) if b.is_ascii_alphanumeric()) {
                    ident.push(cur.bump().unwrap() as char);
                }
                tokens.push(Token { kind: TokenKind::Ident(ident), span: Span { start, end: cur.pos() } });
            }
            other => {
                cur.bump();
                return Err(LexError::UnexpectedByte { byte: other as char, pos: start });
            }
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexes_identifiers_and_operators() {
        let toks = lex("A ; B \\| C | D").unwrap();
        let kinds: Vec<_> = toks.into_iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Ident("A".into()),
                TokenKind::Semi,
                TokenKind::Ident("B".into()),
                TokenKind::ParPipe,
                TokenKind::Ident("C".into()),
                TokenKind::Pipe,
                TokenKind::Ident("D".into()),
            ]
        );
    }

    #[test]
    fn tracks_line_and_col() {
        let toks = lex("A\n;B").unwrap();
        // ';' is on line 2, col 1
        assert_eq!(toks[1].span.start, Pos { line: 2, col: 1 });
    }

    #[test]
    fn rejects_unknown_byte() {
        let err = lex("A # B").unwrap_err();
        assert_eq!(err, LexError::UnexpectedByte { byte: '#', pos: Pos { line: 1, col: 3 } });
    }

    #[test]
    fn rejects_dangling_backslash() {
        let err = lex("A \\ B").unwrap_err();
        assert_eq!(err, LexError::DanglingBackslash { pos: Pos { line: 1, col: 3 } });
    }
}
