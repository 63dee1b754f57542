//! Recursive-descent parser for the dataflow grammar:
//!
//! ```text
//! dataflow := alt  ( '|'  alt )*
//! alt      := block ( op block )*      // op ∈ { ';', '\|' }, no mixing in a chain
//! block    := IDENT | '(' dataflow ')'
//! ```

pub mod ast;

use crate::lexer::{lex, LexError, Pos, Span, Token, TokenKind};
pub use ast::{Ast, OpKind};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("lex error: {0}")]
    Lex(#[from] LexError),
    #[error("unexpected end of input, expected {expected}")]
    UnexpectedEof { expected: &'static str },
    #[error("unexpected token at {pos}, expected {expected}")]
    Unexpected { pos: Pos, expected: &'static str },
    #[error("operators ';' and '\\|' cannot be mixed in one chain without parentheses, at {pos}")]
    MixedOperators { pos: Pos },
    #[error("empty dataflow expression")]
    Empty,
}

struct Parser {
    tokens: Vec<Token>,
    idx: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.idx)
    }

    fn peek_pos(&self) -> Pos {
        self.peek().map(|t| t.span.start).unwrap_or(Pos { line: 0, col: 0 })
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.idx).cloned();
        if t.is_some() {
            self.idx += 1;
        }
        t
    }

    fn span_from(&self, start: Pos) -> Span {
        let end = if self.idx == 0 { start } else { self.tokens[self.idx - 1].span.end };
        Span { start, end }
    }

    fn parse_dataflow(&mut self) -> Result<Ast, ParseError> {
        let start = self.peek_pos();
        let mut branches = vec![self.parse_alt()?];
        while matches!(self.peek().map(|t| &t.kind), Some(TokenKind::Pipe)) {
            self.bump();
            branches.push(self.parse_alt()?);
        }
        if branches.len() == 1 {
            Ok(branches.pop().unwrap())
        } else {
            Ok(Ast::Operation { kind: OpKind::Alt, children: branches, span: self.span_from(start) })
        }
    }

    fn parse_alt(&mut self) -> Result<Ast, ParseError> {
        let start = self.peek_pos();
        let mut nodes = vec![self.parse_block()?];
        let mut op: Option<OpKind> = None;

        loop {
            let cur_kind = match self.peek().map(|t| &t.kind) {
                Some(TokenKind::Semi) => OpKind::Seq,
                Some(TokenKind::ParPipe) => OpKind::Par,
                _ => break,
            };
            match op {
                None => op = Some(cur_kind),
                Some(existing) if existing != cur_kind => {
                    return Err(ParseError::MixedOperators { pos: self.peek_pos() })
                }
                _ => {}
            }
            self.bump();
            nodes.push(self.parse_block()?);
        }

        if nodes.len() == 1 {
            Ok(nodes.pop().unwrap())
        } else {
            Ok(Ast::Operation { kind: op.unwrap(), children: nodes, span: self.span_from(start) })
        }
    }

    fn parse_block(&mut self) -> Result<Ast, ParseError> {
        match self.bump() {
            Some(Token { kind: TokenKind::Ident(name), span }) => Ok(Ast::Action { name, span }),
            Some(Token { kind: TokenKind::LParen, span: lstart }) => {
                let inner = self.parse_dataflow()?;
                match self.bump() {
                    Some(Token { kind: TokenKind::RParen, .. }) => Ok(inner),
                    Some(t) => Err(ParseError::Unexpected { pos: t.span.start, expected: "')'" }),
                    None => Err(ParseError::UnexpectedEof { expected: "')'" }),
                }
                .map_err(|e| {
                    let _ = lstart;
                    e
                })
            }
            Some(t) => Err(ParseError::Unexpected { pos: t.span.start, expected: "identifier or '('" }),
            None => Err(ParseError::UnexpectedEof { expected: "identifier or '('" }),
        }
    }
}

/// Lexes and parses a dataflow expression into an [`Ast`].
pub fn parse(input: &str) -> Result<Ast, ParseError> {
    let tokens = lex(input)?;
    if tokens.is_empty() {
        return Err(ParseError::Empty);
    }
    let mut parser = Parser { tokens, idx: 0 };
    let ast = parser.parse_dataflow()?;
    if let Some(t) = parser.peek() {
        return Err(ParseError::Unexpected { pos: t.span.start, expected: "end of input" });
    }
    Ok(ast)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_linear_pipeline() {
        let ast = parse("A ; B ; C").unwrap();
        match ast {
            Ast::Operation { kind: OpKind::Seq, children, .. } => assert_eq!(children.len(), 3),
            other => panic!("expected Seq, got {other:?}"),
        }
    }

    #[test]
    fn parses_alternative() {
        let ast = parse("(A | B) ; C").unwrap();
        assert_eq!(ast.entry_set(), vec!["A", "B"]);
        assert_eq!(ast.exit_set(), vec!["C"]);
    }

    #[test]
    fn parses_parallel() {
        let ast = parse("A \\| B").unwrap();
        assert_eq!(ast.entry_set(), vec!["A", "B"]);
        assert_eq!(ast.exit_set(), vec!["A", "B"]);
    }

    #[test]
    fn rejects_mixed_operators_without_parens() {
        let err = parse("A ; B \\| C").unwrap_err();
        assert!(matches!(err, ParseError::MixedOperators { .. }));
    }

    #[test]
    fn double_semicolon_is_a_syntax_error_at_the_second_token() {
        // "A ; ; B" has an empty operand between the two semicolons.
        let err = parse("A ; ; B").unwrap_err();
        match err {
            ParseError::Unexpected { pos, .. } => assert_eq!(pos, Pos { line: 1, col: 5 }),
            other => panic!("expected Unexpected, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_identifier_is_allowed_by_the_parser() {
        // duplicate-name rejection is the planner's job, not the parser's.
        let ast = parse("A ; A").unwrap();
        assert_eq!(ast.all_names(), vec!["A", "A"]);
    }
}
