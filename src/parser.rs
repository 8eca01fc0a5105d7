//! Recursive-descent parser turning tokenized lines into an [`ast::Program`]
//! (external-collaborator frontend). Blocks are delimited by
//! indentation rather than braces, following the shape of an
//! indentation-sensitive parser (`BaseExpr`/`RecExpr` walked a line
//! list keyed by indent depth); the grammar itself targets this language's
//! typed declarations, `fun`/`if`/`else`/`while`/`return`, and the flat
//! condition form `lower.rs` can actually emit.

use crate::ast::*;
use crate::error::{CompileError, CompileResult, Location};
use crate::ir::CompareOp;
use crate::symbol::ScalarType;
use crate::tokenizer::{Token, TokenLine};

pub fn parse(lines: &[TokenLine]) -> CompileResult<Program> {
    let mut program = Program::default();
    let mut i = 0;
    while i < lines.len() {
        let line = &lines[i];
        if line.indent != 0 {
            return Err(syntax(&line.tokens, "unexpected indentation at top level"));
        }
        match line.tokens.first() {
            Some((Token::Directive(text), _)) => {
                program.directives.push(parse_directive(text, &line.tokens[0].1)?);
                i += 1;
            }
            Some((Token::TypeName(_), _)) => {
                program.globals.push(parse_global(&line.tokens)?);
                i += 1;
            }
            Some((Token::Fun, _)) => {
                let (func, consumed) = parse_function(lines, i)?;
                program.functions.push(func);
                i += consumed;
            }
            _ => return Err(syntax(&line.tokens, "expected a directive, global, or function")),
        }
    }
    Ok(program)
}

fn parse_directive(text: &str, loc: &Location) -> CompileResult<Directive> {
    let text = text.trim();
    if let Some(rest) = text.strip_prefix("stack") {
        let rest = rest.trim();
        if let Some(floor) = rest.strip_prefix('^') {
            let n: u16 = floor.trim().parse().map_err(|_| CompileError::Syntax {
                location: *loc,
                message: format!("bad #stack directive operand '{rest}'"),
            })?;
            return Ok(Directive::StackAtLeast(n));
        }
        let n: u16 = rest.parse().map_err(|_| CompileError::Syntax {
            location: *loc,
            message: format!("bad #stack directive operand '{rest}'"),
        })?;
        return Ok(Directive::Stack(n));
    }
    Err(CompileError::Syntax {
        location: *loc,
        message: format!("unrecognized directive '#{text}'"),
    })
}

fn parse_global(tokens: &[(Token, Location)]) -> CompileResult<Global> {
    let mut p = LineParser::new(tokens);
    let ty = p.expect_type()?;
    let name = p.expect_ident()?;
    p.expect(&Token::Assign)?;
    let value = p.parse_expr()?;
    p.expect_end()?;
    Ok(Global { name, ty, value })
}

/// Parses a `fun` header at `lines[start]` and its indented body, returning
/// the function and the number of lines consumed (header + body).
fn parse_function(lines: &[TokenLine], start: usize) -> CompileResult<(Function, usize)> {
    let header = &lines[start];
    let mut p = LineParser::new(&header.tokens);
    p.expect(&Token::Fun)?;
    let name = p.expect_ident()?;
    p.expect(&Token::LParen)?;
    let mut params = Vec::new();
    if !p.check(&Token::RParen) {
        loop {
            let pname = p.expect_ident()?;
            p.expect(&Token::Colon)?;
            let pty = p.expect_type()?;
            params.push(Param { name: pname, ty: pty });
            if p.check(&Token::Comma) {
                p.advance();
                continue;
            }
            break;
        }
    }
    p.expect(&Token::RParen)?;
    let return_type = if p.check(&Token::Arrow) {
        p.advance();
        ReturnTypeDecl::Scalar(p.expect_type()?)
    } else {
        ReturnTypeDecl::Void
    };
    p.expect(&Token::Colon)?;
    p.expect_end()?;

    let (body, consumed) = parse_block(lines, start + 1, header.indent + 1)?;
    Ok((
        Function {
            name,
            params,
            return_type,
            body,
        },
        1 + consumed,
    ))
}

/// Parses every consecutive line at exactly `indent`, recursing into bodies
/// of `if`/`while` as they're encountered. Returns the statements and the
/// number of source lines consumed.
fn parse_block(lines: &[TokenLine], start: usize, indent: usize) -> CompileResult<(Vec<Stmt>, usize)> {
    let mut stmts = Vec::new();
    let mut i = start;
    while i < lines.len() && lines[i].indent >= indent {
        if lines[i].indent > indent {
            return Err(syntax(&lines[i].tokens, "unexpected indentation"));
        }
        let line = &lines[i];
        match line.tokens.first() {
            Some((Token::If, _)) => {
                let mut p = LineParser::new(&line.tokens);
                p.advance();
                let cond = p.parse_condition()?;
                p.expect(&Token::Colon)?;
                p.expect_end()?;
                let (then_block, consumed) = parse_block(lines, i + 1, indent + 1)?;
                i += 1 + consumed;
                let mut else_block = Vec::new();
                if i < lines.len() && lines[i].indent == indent {
                    if let Some((Token::Else, _)) = lines[i].tokens.first() {
                        let mut ep = LineParser::new(&lines[i].tokens);
                        ep.advance();
                        ep.expect(&Token::Colon)?;
                        ep.expect_end()?;
                        let (block, else_consumed) = parse_block(lines, i + 1, indent + 1)?;
                        else_block = block;
                        i += 1 + else_consumed;
                    }
                }
                stmts.push(Stmt::If {
                    cond,
                    then_block,
                    else_block,
                });
            }
            Some((Token::While, _)) => {
                let mut p = LineParser::new(&line.tokens);
                p.advance();
                let cond = p.parse_condition()?;
                p.expect(&Token::Colon)?;
                p.expect_end()?;
                let (body, consumed) = parse_block(lines, i + 1, indent + 1)?;
                i += 1 + consumed;
                stmts.push(Stmt::While { cond, body });
            }
            Some((Token::Return, _)) => {
                let mut p = LineParser::new(&line.tokens);
                p.advance();
                let value = if p.at_end() { None } else { Some(p.parse_expr()?) };
                p.expect_end()?;
                stmts.push(Stmt::Return(value));
                i += 1;
            }
            Some((Token::TypeName(_), _)) => {
                let mut p = LineParser::new(&line.tokens);
                let ty = p.expect_type()?;
                let name = p.expect_ident()?;
                p.expect(&Token::Assign)?;
                let value = p.parse_expr()?;
                p.expect_end()?;
                stmts.push(Stmt::Let { name, ty, value });
                i += 1;
            }
            Some((Token::Ident(name), _)) => {
                let mut p = LineParser::new(&line.tokens);
                let name = name.clone();
                p.advance();
                if p.check(&Token::Assign) {
                    p.advance();
                    let value = p.parse_expr()?;
                    p.expect_end()?;
                    stmts.push(Stmt::Assign { name, value });
                } else if p.check(&Token::LParen) {
                    let args = p.parse_call_args()?;
                    p.expect_end()?;
                    stmts.push(Stmt::Expr(Expr::Call(name, args)));
                } else {
                    return Err(syntax(&line.tokens, "expected assignment or call"));
                }
                i += 1;
            }
            _ => return Err(syntax(&line.tokens, "unexpected statement")),
        }
    }
    Ok((stmts, i - start))
}

fn syntax(tokens: &[(Token, Location)], message: &str) -> CompileError {
    let location = tokens.first().map(|(_, l)| *l).unwrap_or(Location { line: 0, col: 0 });
    CompileError::Syntax {
        location,
        message: message.to_string(),
    }
}

/// Single-line recursive-descent expression/condition parser.
struct LineParser<'a> {
    tokens: &'a [(Token, Location)],
    pos: usize,
}

impl<'a> LineParser<'a> {
    fn new(tokens: &'a [(Token, Location)]) -> Self {
        LineParser { tokens, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn loc(&self) -> Location {
        self.tokens
            .get(self.pos.min(self.tokens.len().saturating_sub(1)))
            .map(|(_, l)| *l)
            .unwrap_or(Location { line: 0, col: 0 })
    }

    fn advance(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos).map(|(t, _)| t);
        self.pos += 1;
        t
    }

    fn check(&self, expected: &Token) -> bool {
        self.peek() == Some(expected)
    }

    fn expect(&mut self, expected: &Token) -> CompileResult<()> {
        if self.check(expected) {
            self.advance();
            Ok(())
        } else {
            Err(CompileError::Syntax {
                location: self.loc(),
                message: format!("expected {expected:?}"),
            })
        }
    }

    fn expect_end(&self) -> CompileResult<()> {
        if self.at_end() {
            Ok(())
        } else {
            Err(CompileError::Syntax {
                location: self.loc(),
                message: "trailing tokens on line".to_string(),
            })
        }
    }

    fn expect_ident(&mut self) -> CompileResult<String> {
        match self.advance() {
            Some(Token::Ident(name)) => Ok(name.clone()),
            _ => Err(CompileError::Syntax {
                location: self.loc(),
                message: "expected identifier".to_string(),
            }),
        }
    }

    fn expect_type(&mut self) -> CompileResult<ScalarType> {
        match self.advance() {
            Some(Token::TypeName(name)) => scalar_type_named(name, self.loc()),
            _ => Err(CompileError::Syntax {
                location: self.loc(),
                message: "expected a type name".to_string(),
            }),
        }
    }

    fn parse_call_args(&mut self) -> CompileResult<Vec<Expr>> {
        self.expect(&Token::LParen)?;
        let mut args = Vec::new();
        if !self.check(&Token::RParen) {
            loop {
                args.push(self.parse_expr()?);
                if self.check(&Token::Comma) {
                    self.advance();
                    continue;
                }
                break;
            }
        }
        self.expect(&Token::RParen)?;
        Ok(args)
    }

    /// `Expr` alone, or `Expr CompareOp Expr` — the only condition shapes
    /// the backend can lower (see ast.rs doc comment).
    fn parse_condition(&mut self) -> CompileResult<Condition> {
        let lhs = self.parse_expr()?;
        let op = match self.peek() {
            Some(Token::EqEq) => Some(CompareOp::Eq),
            Some(Token::NotEq) => Some(CompareOp::Ne),
            Some(Token::Lt) => Some(CompareOp::Lt),
            Some(Token::Gt) => Some(CompareOp::Gt),
            Some(Token::Le) => Some(CompareOp::Le),
            Some(Token::Ge) => Some(CompareOp::Ge),
            Some(Token::Or) => Some(CompareOp::LogOr),
            Some(Token::And) => Some(CompareOp::LogAnd),
            _ => None,
        };
        match op {
            Some(op) => {
                self.advance();
                let rhs = self.parse_expr()?;
                Ok(Condition::Compare(op, lhs, rhs))
            }
            None => Ok(Condition::Truthy(lhs)),
        }
    }

    fn parse_expr(&mut self) -> CompileResult<Expr> {
        self.parse_additive()
    }

    fn parse_additive(&mut self) -> CompileResult<Expr> {
        let mut lhs = self.parse_shift()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_shift()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_shift(&mut self) -> CompileResult<Expr> {
        let mut lhs = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Shl) => BinOp::Shl,
                Some(Token::Shr) => BinOp::Shr,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_term(&mut self) -> CompileResult<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Rem,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> CompileResult<Expr> {
        if self.check(&Token::Minus) {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> CompileResult<Expr> {
        match self.advance().cloned() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::True) => Ok(Expr::Bool(true)),
            Some(Token::False) => Ok(Expr::Bool(false)),
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if self.check(&Token::LParen) {
                    let args = self.parse_call_args()?;
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Var(name))
                }
            }
            _ => Err(CompileError::Syntax {
                location: self.loc(),
                message: "expected an expression".to_string(),
            }),
        }
    }
}

fn scalar_type_named(name: &str, loc: Location) -> CompileResult<ScalarType> {
    match name {
        "bool" => Ok(ScalarType::Bool),
        "uint8" => Ok(ScalarType::Uint8),
        "uint16" => Ok(ScalarType::Uint16),
        "uint32" => Ok(ScalarType::Uint32),
        "string" => Ok(ScalarType::String),
        _ => Err(CompileError::Syntax {
            location: loc,
            message: format!("unknown type '{name}'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::tokenize;

    #[test]
    fn parses_a_global_and_a_function() {
        let src = "uint32 counter = 0\n\nfun Main():\n    counter = counter + 1\n    return\n";
        let lines = tokenize(src).unwrap();
        let program = parse(&lines).unwrap();
        assert_eq!(program.globals.len(), 1);
        assert_eq!(program.globals[0].name, "counter");
        assert_eq!(program.functions.len(), 1);
        assert_eq!(program.functions[0].name, "Main");
        assert_eq!(program.functions[0].body.len(), 2);
    }

    #[test]
    fn parses_if_else_and_while_with_flat_condition() {
        let src = "fun Main():\n    uint8 x = 0\n    while x < 10:\n        x = x + 1\n    if x == 10:\n        return\n    else:\n        return\n";
        let lines = tokenize(src).unwrap();
        let program = parse(&lines).unwrap();
        let body = &program.functions[0].body;
        assert!(matches!(body[1], Stmt::While { .. }));
        assert!(matches!(body[2], Stmt::If { .. }));
    }

    #[test]
    fn parses_stack_directives() {
        let src = "#stack 2048\n#stack ^512\nfun Main():\n    return\n";
        let lines = tokenize(src).unwrap();
        let program = parse(&lines).unwrap();
        assert!(matches!(program.directives[0], Directive::Stack(2048)));
        assert!(matches!(program.directives[1], Directive::StackAtLeast(512)));
    }

    #[test]
    fn rejects_bad_indentation() {
        let src = "fun Main():\n    uint8 x = 0\n        x = 1\n";
        let lines = tokenize(src).unwrap();
        assert!(parse(&lines).is_err());
    }
}
