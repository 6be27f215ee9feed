//! Recursive descent parser over the layout token stream.

use crate::ast::*;
use crate::error::ParseError;
use crate::lexer::{tokenize, Lexeme, Token, TokenKind};

pub fn parse_module(source: &str) -> Result<Module, ParseError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser::new(&tokens);
    let body = parser.parse_statements_until_eof()?;
    Ok(Module { body })
}

/// Parse a single expression; surrounding newlines are allowed.
pub fn parse_expression(source: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser::new(&tokens);
    parser.skip_newlines();
    let expr = parser.parse_test()?;
    parser.skip_newlines();
    if !parser.at_eof() {
        return Err(parser.unexpected("after expression"));
    }
    Ok(expr)
}

struct Parser<'t> {
    tokens: &'t [Token],
    pos: usize,
}

impl<'t> Parser<'t> {
    fn new(tokens: &'t [Token]) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> &TokenKind {
        self.tokens
            .get(self.pos)
            .map(|t| &t.kind)
            .unwrap_or(&TokenKind::Eof)
    }

    fn peek_nth(&self, n: usize) -> &TokenKind {
        self.tokens
            .get(self.pos + n)
            .map(|t| &t.kind)
            .unwrap_or(&TokenKind::Eof)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(1)
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        kind
    }

    fn at(&self, lexeme: &Lexeme) -> bool {
        matches!(self.peek(), TokenKind::Lex(l) if l == lexeme)
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek(), TokenKind::Eof)
    }

    fn eat(&mut self, lexeme: &Lexeme) -> bool {
        if self.at(lexeme) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, lexeme: Lexeme, context: &str) -> Result<(), ParseError> {
        if self.eat(&lexeme) {
            Ok(())
        } else {
            Err(ParseError::new(
                self.line(),
                format!("expected {:?} {}, found {}", lexeme, context, describe(self.peek())),
            ))
        }
    }

    fn expect_newline(&mut self) -> Result<(), ParseError> {
        match self.peek() {
            TokenKind::Newline => {
                self.pos += 1;
                Ok(())
            }
            TokenKind::Eof => Ok(()),
            _ => Err(self.unexpected("at end of statement")),
        }
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek(), TokenKind::Newline) {
            self.pos += 1;
        }
    }

    fn unexpected(&self, context: &str) -> ParseError {
        ParseError::new(
            self.line(),
            format!("unexpected {} {}", describe(self.peek()), context),
        )
    }

    fn ident(&mut self, context: &str) -> Result<String, ParseError> {
        match self.peek().clone() {
            TokenKind::Lex(Lexeme::Ident(name)) => {
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.unexpected(context)),
        }
    }

    fn parse_statements_until_eof(&mut self) -> Result<Vec<Stmt>, ParseError> {
        let mut body = Vec::new();
        loop {
            self.skip_newlines();
            if self.at_eof() {
                break;
            }
            if matches!(self.peek(), TokenKind::Indent) {
                return Err(ParseError::new(self.line(), "unexpected indent"));
            }
            body.extend(self.parse_statement()?);
        }
        Ok(body)
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>, ParseError> {
        self.expect(Lexeme::Colon, "before block")?;
        if !matches!(self.peek(), TokenKind::Newline) {
            return self.parse_simple_line();
        }
        self.pos += 1;
        self.skip_newlines();
        if !matches!(self.peek(), TokenKind::Indent) {
            return Err(ParseError::new(self.line(), "expected an indented block"));
        }
        self.pos += 1;
        let mut body = Vec::new();
        loop {
            self.skip_newlines();
            match self.peek() {
                TokenKind::Dedent => {
                    self.pos += 1;
                    break;
                }
                TokenKind::Eof => break,
                _ => body.extend(self.parse_statement()?),
            }
        }
        Ok(body)
    }

    fn parse_statement(&mut self) -> Result<Vec<Stmt>, ParseError> {
        let line = self.line();
        let kind = match self.peek() {
            TokenKind::Lex(Lexeme::If) => self.parse_if()?,
            TokenKind::Lex(Lexeme::For) => {
                self.pos += 1;
                let target = self.parse_target_list()?;
                self.expect(Lexeme::In, "in for statement")?;
                let iter = self.parse_test_list()?;
                let body = self.parse_block()?;
                StmtKind::For { target, iter, body }
            }
            TokenKind::Lex(Lexeme::While) => {
                self.pos += 1;
                let test = self.parse_test()?;
                let body = self.parse_block()?;
                StmtKind::While { test, body }
            }
            TokenKind::Lex(Lexeme::Def) => self.parse_def()?,
            TokenKind::Lex(Lexeme::With) => {
                self.pos += 1;
                let context = self.parse_test()?;
                let alias = if self.eat(&Lexeme::As) {
                    Some(self.ident("after 'as'")?)
                } else {
                    None
                };
                let body = self.parse_block()?;
                StmtKind::With {
                    context,
                    alias,
                    body,
                }
            }
            _ => return self.parse_simple_line(),
        };
        Ok(vec![Stmt::new(line, kind)])
    }

    fn parse_if(&mut self) -> Result<StmtKind, ParseError> {
        self.pos += 1;
        let mut branches = Vec::new();
        let test = self.parse_test()?;
        let body = self.parse_block()?;
        branches.push((test, body));
        let mut orelse = Vec::new();
        loop {
            self.skip_newlines_before(&[Lexeme::Elif, Lexeme::Else]);
            if self.eat(&Lexeme::Elif) {
                let test = self.parse_test()?;
                let body = self.parse_block()?;
                branches.push((test, body));
            } else if self.eat(&Lexeme::Else) {
                orelse = self.parse_block()?;
                break;
            } else {
                break;
            }
        }
        Ok(StmtKind::If { branches, orelse })
    }

    /// Blank lines between a block and its `elif`/`else` are already folded by
    /// the layout pass; this only guards against stray newline tokens.
    fn skip_newlines_before(&mut self, continuations: &[Lexeme]) {
        let mut probe = self.pos;
        while matches!(
            self.tokens.get(probe).map(|t| &t.kind),
            Some(TokenKind::Newline)
        ) {
            probe += 1;
        }
        if let Some(TokenKind::Lex(l)) = self.tokens.get(probe).map(|t| &t.kind) {
            if continuations.contains(l) {
                self.pos = probe;
            }
        }
    }

    fn parse_def(&mut self) -> Result<StmtKind, ParseError> {
        self.pos += 1;
        let name = self.ident("after 'def'")?;
        self.expect(Lexeme::LParen, "after function name")?;
        let mut params = Vec::new();
        while !self.at(&Lexeme::RParen) {
            let param = if self.eat(&Lexeme::DoubleStar) {
                Param {
                    name: self.ident("after '**'")?,
                    default: None,
                    kind: ParamKind::KwArgs,
                }
            } else if self.eat(&Lexeme::Star) {
                Param {
                    name: self.ident("after '*'")?,
                    default: None,
                    kind: ParamKind::VarArgs,
                }
            } else {
                let pname = self.ident("in parameter list")?;
                let default = if self.eat(&Lexeme::Assign) {
                    Some(self.parse_test()?)
                } else {
                    None
                };
                Param {
                    name: pname,
                    default,
                    kind: ParamKind::Normal,
                }
            };
            if params.iter().any(|p: &Param| p.name == param.name) {
                return Err(ParseError::new(
                    self.line(),
                    format!("duplicate parameter '{}' in function '{}'", param.name, name),
                ));
            }
            params.push(param);
            if !self.eat(&Lexeme::Comma) {
                break;
            }
        }
        self.expect(Lexeme::RParen, "after parameters")?;
        let body = self.parse_block()?;
        Ok(StmtKind::Def(FunctionDef { name, params, body }))
    }

    fn parse_simple_line(&mut self) -> Result<Vec<Stmt>, ParseError> {
        let mut out = Vec::new();
        loop {
            let line = self.line();
            let kind = self.parse_simple()?;
            out.push(Stmt::new(line, kind));
            if self.eat(&Lexeme::Semicolon) {
                if matches!(self.peek(), TokenKind::Newline | TokenKind::Eof) {
                    break;
                }
                continue;
            }
            break;
        }
        self.expect_newline()?;
        Ok(out)
    }

    fn parse_simple(&mut self) -> Result<StmtKind, ParseError> {
        match self.peek().clone() {
            TokenKind::Lex(Lexeme::Pass) => {
                self.pos += 1;
                Ok(StmtKind::Pass)
            }
            TokenKind::Lex(Lexeme::Break) => {
                self.pos += 1;
                Ok(StmtKind::Break)
            }
            TokenKind::Lex(Lexeme::Continue) => {
                self.pos += 1;
                Ok(StmtKind::Continue)
            }
            TokenKind::Lex(Lexeme::Return) => {
                self.pos += 1;
                if self.at_statement_end() {
                    Ok(StmtKind::Return(None))
                } else {
                    Ok(StmtKind::Return(Some(self.parse_test_list()?)))
                }
            }
            TokenKind::Lex(Lexeme::Raise) => {
                self.pos += 1;
                if self.at_statement_end() {
                    Ok(StmtKind::Raise(None))
                } else {
                    Ok(StmtKind::Raise(Some(self.parse_test()?)))
                }
            }
            TokenKind::Lex(Lexeme::Assert) => {
                self.pos += 1;
                let test = self.parse_test()?;
                let msg = if self.eat(&Lexeme::Comma) {
                    Some(self.parse_test()?)
                } else {
                    None
                };
                Ok(StmtKind::Assert { test, msg })
            }
            TokenKind::Lex(Lexeme::Global) => {
                self.pos += 1;
                let mut names = vec![self.ident("after 'global'")?];
                while self.eat(&Lexeme::Comma) {
                    names.push(self.ident("in global statement")?);
                }
                Ok(StmtKind::Global(names))
            }
            TokenKind::Lex(Lexeme::Import) => {
                self.pos += 1;
                let module = self.dotted_name()?;
                let alias = if self.eat(&Lexeme::As) {
                    Some(self.ident("after 'as'")?)
                } else {
                    None
                };
                Ok(StmtKind::Import { module, alias })
            }
            TokenKind::Lex(Lexeme::From) => {
                self.pos += 1;
                let module = self.dotted_name()?;
                self.expect(Lexeme::Import, "in from-import")?;
                if self.eat(&Lexeme::Star) {
                    return Ok(StmtKind::FromImport {
                        module,
                        names: Vec::new(),
                        star: true,
                    });
                }
                let parens = self.eat(&Lexeme::LParen);
                let mut names = Vec::new();
                loop {
                    let name = self.ident("in import list")?;
                    let alias = if self.eat(&Lexeme::As) {
                        Some(self.ident("after 'as'")?)
                    } else {
                        None
                    };
                    names.push((name, alias));
                    if !self.eat(&Lexeme::Comma) || (parens && self.at(&Lexeme::RParen)) {
                        break;
                    }
                }
                if parens {
                    self.expect(Lexeme::RParen, "after import list")?;
                }
                Ok(StmtKind::FromImport {
                    module,
                    names,
                    star: false,
                })
            }
            _ => self.parse_expression_statement(),
        }
    }

    fn at_statement_end(&self) -> bool {
        matches!(
            self.peek(),
            TokenKind::Newline | TokenKind::Eof | TokenKind::Lex(Lexeme::Semicolon)
        )
    }

    fn dotted_name(&mut self) -> Result<String, ParseError> {
        let mut name = self.ident("in module name")?;
        while self.eat(&Lexeme::Dot) {
            name.push('.');
            name.push_str(&self.ident("in dotted module name")?);
        }
        Ok(name)
    }

    fn parse_expression_statement(&mut self) -> Result<StmtKind, ParseError> {
        let first = self.parse_test_list()?;
        let aug = match self.peek() {
            TokenKind::Lex(Lexeme::PlusEq) => Some(BinOp::Add),
            TokenKind::Lex(Lexeme::MinusEq) => Some(BinOp::Sub),
            TokenKind::Lex(Lexeme::StarEq) => Some(BinOp::Mul),
            TokenKind::Lex(Lexeme::SlashEq) => Some(BinOp::Div),
            _ => None,
        };
        if let Some(op) = aug {
            self.pos += 1;
            if !matches!(
                first,
                Expr::Name(_) | Expr::Attribute { .. } | Expr::Subscript { .. }
            ) {
                return Err(ParseError::new(
                    self.line(),
                    "illegal target for augmented assignment",
                ));
            }
            let value = self.parse_test_list()?;
            return Ok(StmtKind::AugAssign {
                target: first,
                op,
                value,
            });
        }
        if !self.at(&Lexeme::Assign) {
            return Ok(StmtKind::Expr(first));
        }
        let mut targets = vec![first];
        let mut value = None;
        while self.eat(&Lexeme::Assign) {
            let next = self.parse_test_list()?;
            if self.at(&Lexeme::Assign) {
                targets.push(next);
            } else {
                value = Some(next);
            }
        }
        let value = value.ok_or_else(|| self.unexpected("in assignment"))?;
        for target in &targets {
            if !target.is_assignable() {
                return Err(ParseError::new(self.line(), "cannot assign to expression"));
            }
        }
        Ok(StmtKind::Assign { targets, value })
    }

    fn parse_target_list(&mut self) -> Result<Expr, ParseError> {
        let first = self.parse_postfix()?;
        if !self.at(&Lexeme::Comma) {
            if !first.is_assignable() {
                return Err(ParseError::new(self.line(), "cannot assign to expression"));
            }
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&Lexeme::Comma) {
            if self.at(&Lexeme::In) {
                break;
            }
            items.push(self.parse_postfix()?);
        }
        let target = Expr::Tuple(items);
        if !target.is_assignable() {
            return Err(ParseError::new(self.line(), "cannot assign to expression"));
        }
        Ok(target)
    }

    /// `a, b` without brackets becomes a tuple.
    fn parse_test_list(&mut self) -> Result<Expr, ParseError> {
        let first = self.parse_test()?;
        if !self.at(&Lexeme::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&Lexeme::Comma) {
            if self.at_statement_end()
                || self.at(&Lexeme::Assign)
                || self.at(&Lexeme::RParen)
                || self.at(&Lexeme::Colon)
            {
                break;
            }
            items.push(self.parse_test()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn parse_test(&mut self) -> Result<Expr, ParseError> {
        let body = self.parse_or()?;
        if self.at(&Lexeme::If) {
            self.pos += 1;
            let test = self.parse_or()?;
            self.expect(Lexeme::Else, "in conditional expression")?;
            let orelse = self.parse_test()?;
            return Ok(Expr::IfExp {
                test: Box::new(test),
                body: Box::new(body),
                orelse: Box::new(orelse),
            });
        }
        Ok(body)
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let first = self.parse_and()?;
        if !self.at(&Lexeme::Or) {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat(&Lexeme::Or) {
            values.push(self.parse_and()?);
        }
        Ok(Expr::BoolOp {
            op: BoolOp::Or,
            values,
        })
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let first = self.parse_not()?;
        if !self.at(&Lexeme::And) {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat(&Lexeme::And) {
            values.push(self.parse_not()?);
        }
        Ok(Expr::BoolOp {
            op: BoolOp::And,
            values,
        })
    }

    fn parse_not(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&Lexeme::Not) {
            let operand = self.parse_not()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.parse_comparison()
    }

    fn comparison_op(&mut self) -> Option<CmpOp> {
        let op = match self.peek() {
            TokenKind::Lex(Lexeme::EqEq) => CmpOp::Eq,
            TokenKind::Lex(Lexeme::NotEq) => CmpOp::NotEq,
            TokenKind::Lex(Lexeme::Lt) => CmpOp::Lt,
            TokenKind::Lex(Lexeme::LtEq) => CmpOp::LtEq,
            TokenKind::Lex(Lexeme::Gt) => CmpOp::Gt,
            TokenKind::Lex(Lexeme::GtEq) => CmpOp::GtEq,
            TokenKind::Lex(Lexeme::In) => CmpOp::In,
            TokenKind::Lex(Lexeme::Not)
                if matches!(self.peek_nth(1), TokenKind::Lex(Lexeme::In)) =>
            {
                self.pos += 2;
                return Some(CmpOp::NotIn);
            }
            TokenKind::Lex(Lexeme::Is) => {
                if matches!(self.peek_nth(1), TokenKind::Lex(Lexeme::Not)) {
                    self.pos += 2;
                    return Some(CmpOp::IsNot);
                }
                CmpOp::Is
            }
            _ => return None,
        };
        self.pos += 1;
        Some(op)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let left = self.parse_arith()?;
        let mut ops = Vec::new();
        while let Some(op) = self.comparison_op() {
            ops.push((op, self.parse_arith()?));
        }
        if ops.is_empty() {
            return Ok(left);
        }
        Ok(Expr::Compare {
            left: Box::new(left),
            ops,
        })
    }

    fn parse_arith(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek() {
                TokenKind::Lex(Lexeme::Plus) => BinOp::Add,
                TokenKind::Lex(Lexeme::Minus) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_term()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_factor()?;
        loop {
            let op = match self.peek() {
                TokenKind::Lex(Lexeme::Star) => BinOp::Mul,
                TokenKind::Lex(Lexeme::Slash) => BinOp::Div,
                TokenKind::Lex(Lexeme::DoubleSlash) => BinOp::FloorDiv,
                TokenKind::Lex(Lexeme::Percent) => BinOp::Mod,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_factor()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> Result<Expr, ParseError> {
        let op = match self.peek() {
            TokenKind::Lex(Lexeme::Minus) => UnaryOp::Neg,
            TokenKind::Lex(Lexeme::Plus) => UnaryOp::Pos,
            _ => return self.parse_power(),
        };
        self.pos += 1;
        let operand = self.parse_factor()?;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn parse_power(&mut self) -> Result<Expr, ParseError> {
        let base = self.parse_postfix()?;
        if self.eat(&Lexeme::DoubleStar) {
            let exponent = self.parse_factor()?;
            return Ok(Expr::Binary {
                op: BinOp::Pow,
                left: Box::new(base),
                right: Box::new(exponent),
            });
        }
        Ok(base)
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_atom()?;
        loop {
            if self.eat(&Lexeme::Dot) {
                let attr = self.ident("after '.'")?;
                expr = Expr::Attribute {
                    value: Box::new(expr),
                    attr,
                };
            } else if self.eat(&Lexeme::LParen) {
                let args = self.parse_call_args()?;
                expr = Expr::Call {
                    func: Box::new(expr),
                    args,
                };
            } else if self.eat(&Lexeme::LBracket) {
                let index = self.parse_subscript()?;
                self.expect(Lexeme::RBracket, "after subscript")?;
                expr = Expr::Subscript {
                    value: Box::new(expr),
                    index: Box::new(index),
                };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_subscript(&mut self) -> Result<Expr, ParseError> {
        let lower = if self.at(&Lexeme::Colon) {
            None
        } else {
            Some(self.parse_test()?)
        };
        if !self.eat(&Lexeme::Colon) {
            return lower.ok_or_else(|| self.unexpected("in subscript"));
        }
        let upper = if self.at(&Lexeme::RBracket) {
            None
        } else {
            Some(Box::new(self.parse_test()?))
        };
        Ok(Expr::Slice {
            lower: lower.map(Box::new),
            upper,
        })
    }

    fn parse_call_args(&mut self) -> Result<Vec<Arg>, ParseError> {
        let mut args = Vec::new();
        while !self.at(&Lexeme::RParen) {
            if self.eat(&Lexeme::DoubleStar) {
                args.push(Arg::DoubleStar(self.parse_test()?));
            } else if self.eat(&Lexeme::Star) {
                args.push(Arg::Star(self.parse_test()?));
            } else if matches!(self.peek(), TokenKind::Lex(Lexeme::Ident(_)))
                && matches!(self.peek_nth(1), TokenKind::Lex(Lexeme::Assign))
            {
                let name = self.ident("in keyword argument")?;
                self.pos += 1;
                if args
                    .iter()
                    .any(|a| matches!(a, Arg::Keyword(existing, _) if *existing == name))
                {
                    return Err(ParseError::new(
                        self.line(),
                        format!("keyword argument repeated: {}", name),
                    ));
                }
                args.push(Arg::Keyword(name, self.parse_test()?));
            } else {
                if args
                    .iter()
                    .any(|a| matches!(a, Arg::Keyword(..) | Arg::DoubleStar(_)))
                {
                    return Err(ParseError::new(
                        self.line(),
                        "positional argument follows keyword argument",
                    ));
                }
                args.push(Arg::Positional(self.parse_test()?));
            }
            if !self.eat(&Lexeme::Comma) {
                break;
            }
        }
        self.expect(Lexeme::RParen, "after call arguments")?;
        Ok(args)
    }

    fn parse_atom(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        match self.advance() {
            TokenKind::Lex(Lexeme::None) => Ok(Expr::None),
            TokenKind::Lex(Lexeme::True) => Ok(Expr::Bool(true)),
            TokenKind::Lex(Lexeme::False) => Ok(Expr::Bool(false)),
            TokenKind::Lex(Lexeme::Int(v)) => Ok(Expr::Int(v)),
            TokenKind::Lex(Lexeme::Float(v)) => Ok(Expr::Float(v)),
            TokenKind::Lex(Lexeme::Str(s)) => {
                let mut text = s;
                while let TokenKind::Lex(Lexeme::Str(next)) = self.peek().clone() {
                    self.pos += 1;
                    text.push_str(&next);
                }
                Ok(Expr::Str(text))
            }
            TokenKind::Lex(Lexeme::Ident(name)) => Ok(Expr::Name(name)),
            TokenKind::Lex(Lexeme::LParen) => {
                if self.eat(&Lexeme::RParen) {
                    return Ok(Expr::Tuple(Vec::new()));
                }
                let first = self.parse_test()?;
                if self.eat(&Lexeme::RParen) {
                    return Ok(first);
                }
                let mut items = vec![first];
                while self.eat(&Lexeme::Comma) {
                    if self.at(&Lexeme::RParen) {
                        break;
                    }
                    items.push(self.parse_test()?);
                }
                self.expect(Lexeme::RParen, "to close tuple")?;
                Ok(Expr::Tuple(items))
            }
            TokenKind::Lex(Lexeme::LBracket) => {
                if self.eat(&Lexeme::RBracket) {
                    return Ok(Expr::List(Vec::new()));
                }
                let first = self.parse_test()?;
                if self.eat(&Lexeme::For) {
                    let target = self.parse_target_list()?;
                    self.expect(Lexeme::In, "in comprehension")?;
                    let iter = self.parse_or()?;
                    let cond = if self.eat(&Lexeme::If) {
                        Some(Box::new(self.parse_or()?))
                    } else {
                        None
                    };
                    self.expect(Lexeme::RBracket, "to close comprehension")?;
                    return Ok(Expr::ListComp {
                        elt: Box::new(first),
                        target: Box::new(target),
                        iter: Box::new(iter),
                        cond,
                    });
                }
                let mut items = vec![first];
                while self.eat(&Lexeme::Comma) {
                    if self.at(&Lexeme::RBracket) {
                        break;
                    }
                    items.push(self.parse_test()?);
                }
                self.expect(Lexeme::RBracket, "to close list")?;
                Ok(Expr::List(items))
            }
            TokenKind::Lex(Lexeme::LBrace) => {
                let mut items = Vec::new();
                while !self.at(&Lexeme::RBrace) {
                    let item_line = self.line();
                    let key = self.parse_test()?;
                    self.expect(Lexeme::Colon, "after dict key")?;
                    let value = self.parse_test()?;
                    items.push(DictItem {
                        line: item_line,
                        key,
                        value,
                    });
                    if !self.eat(&Lexeme::Comma) {
                        break;
                    }
                }
                self.expect(Lexeme::RBrace, "to close dict")?;
                Ok(Expr::Dict(items))
            }
            other => Err(ParseError::new(
                line,
                format!("unexpected {} in expression", describe(&other)),
            )),
        }
    }
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Lex(Lexeme::Ident(name)) => format!("name '{}'", name),
        TokenKind::Lex(Lexeme::Str(_)) => "string".to_string(),
        TokenKind::Lex(l) => format!("{:?}", l),
        TokenKind::Newline => "end of line".to_string(),
        TokenKind::Indent => "indent".to_string(),
        TokenKind::Dedent => "dedent".to_string(),
        TokenKind::Eof => "end of input".to_string(),
    }
}
