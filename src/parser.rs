//! Two-stack operator-precedence parser.

use logos::Logos;

use crate::{Ast, AstBuilder, NodeId, NumT, OperatorKind};

#[derive(Logos, Debug, PartialEq, Clone, Copy)]
#[logos(skip r"[ \t\r\n]+")]
pub enum Token {
    // Out-of-range literals fail the callback and surface as lex errors.
    #[regex("[0-9]+", |lex| lex.slice().parse::<NumT>().ok())]
    Int(NumT),
    #[token("+", |_| OperatorKind::Add)]
    #[token("-", |_| OperatorKind::Sub)]
    #[token("*", |_| OperatorKind::Mul)]
    #[token("/", |_| OperatorKind::Div)]
    #[token("^", |_| OperatorKind::Xor)]
    Op(OperatorKind),
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid token '{snippet}' at position {position}")]
    InvalidToken { position: usize, snippet: String },
    #[error("unbalanced parentheses at position {position}")]
    UnbalancedParens { position: usize },
    #[error("malformed expression at position {position}")]
    MalformedExpression { position: usize },
    #[error("empty expression")]
    EmptyExpression,
}

type Result<T> = std::result::Result<T, ParseError>;

enum Pending {
    Op(OperatorKind),
    /// Barrier left by `(`, with its position for error reporting.
    Paren(usize),
}

struct Parser {
    builder: AstBuilder,
    operands: Vec<NodeId>,
    operators: Vec<Pending>,
}

impl Parser {
    fn new() -> Self {
        Parser {
            builder: AstBuilder::new(),
            operands: Vec::new(),
            operators: Vec::new(),
        }
    }

    fn reduce(&mut self, op: OperatorKind, position: usize) -> Result<()> {
        let (Some(right), Some(left)) = (self.operands.pop(), self.operands.pop()) else {
            return Err(ParseError::MalformedExpression { position });
        };
        let node = self.builder.binary(op, left, right);
        self.operands.push(node);
        Ok(())
    }

    fn push_operator(&mut self, op: OperatorKind, position: usize) -> Result<()> {
        while let Some(&Pending::Op(top)) = self.operators.last() {
            let binds_first = if op.is_right_assoc() {
                top.precedence() > op.precedence()
            } else {
                top.precedence() >= op.precedence()
            };
            if !binds_first {
                break;
            }
            self.operators.pop();
            self.reduce(top, position)?;
        }
        self.operators.push(Pending::Op(op));
        Ok(())
    }

    fn close_paren(&mut self, position: usize) -> Result<()> {
        loop {
            match self.operators.pop() {
                Some(Pending::Op(op)) => self.reduce(op, position)?,
                Some(Pending::Paren(_)) => return Ok(()),
                None => return Err(ParseError::UnbalancedParens { position }),
            }
        }
    }

    fn finish(mut self, end: usize) -> Result<Ast> {
        while let Some(pending) = self.operators.pop() {
            match pending {
                Pending::Op(op) => self.reduce(op, end)?,
                Pending::Paren(position) => return Err(ParseError::UnbalancedParens { position }),
            }
        }
        let root = self.operands.pop().ok_or(ParseError::MalformedExpression { position: end })?;
        if !self.operands.is_empty() {
            return Err(ParseError::MalformedExpression { position: end });
        }
        Ok(self.builder.finish(root))
    }
}

/// Parse an expression into an AST. Pure: the result depends only on `src`.
pub fn parse(src: &str) -> Result<Ast> {
    let mut lexer = Token::lexer(src);
    let mut parser = Parser::new();
    let mut seen_token = false;
    // Alternates: an operand or `(` after an operator, an operator or `)` after an operand.
    let mut expect_operand = true;

    while let Some(result) = lexer.next() {
        let span = lexer.span();
        let token = result.map_err(|()| ParseError::InvalidToken {
            position: span.start,
            snippet: src[span.clone()].to_string(),
        })?;
        seen_token = true;

        let starts_operand = matches!(token, Token::Int(_) | Token::LParen);
        if starts_operand != expect_operand {
            return Err(ParseError::MalformedExpression { position: span.start });
        }

        match token {
            Token::Int(v) => {
                let leaf = parser.builder.leaf(v);
                parser.operands.push(leaf);
                expect_operand = false;
            }
            Token::Op(op) => {
                parser.push_operator(op, span.start)?;
                expect_operand = true;
            }
            Token::LParen => parser.operators.push(Pending::Paren(span.start)),
            Token::RParen => parser.close_paren(span.start)?,
        }
    }

    if !seen_token {
        return Err(ParseError::EmptyExpression);
    }
    if expect_operand {
        return Err(ParseError::MalformedExpression { position: src.len() });
    }
    parser.finish(src.len())
}
