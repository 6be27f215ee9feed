//! Tokenization for step scripts.
//!
//! Lexemes come from logos; [`tokenize`] then runs a layout pass that turns
//! line starts into `Newline`/`Indent`/`Dedent` tokens, ignoring newlines
//! nested inside brackets.

use crate::error::ParseError;
use logos::Logos;

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\f]+")]
#[logos(skip r"#[^\n]*")]
#[logos(skip r"\\\r?\n")]
pub enum Lexeme {
    #[regex(r"\r?\n")]
    Newline,

    #[token("def")]
    Def,
    #[token("return")]
    Return,
    #[token("if")]
    If,
    #[token("elif")]
    Elif,
    #[token("else")]
    Else,
    #[token("for")]
    For,
    #[token("while")]
    While,
    #[token("in")]
    In,
    #[token("not")]
    Not,
    #[token("and")]
    And,
    #[token("or")]
    Or,
    #[token("is")]
    Is,
    #[token("import")]
    Import,
    #[token("from")]
    From,
    #[token("as")]
    As,
    #[token("pass")]
    Pass,
    #[token("break")]
    Break,
    #[token("continue")]
    Continue,
    #[token("raise")]
    Raise,
    #[token("assert")]
    Assert,
    #[token("with")]
    With,
    #[token("global")]
    Global,
    #[token("True")]
    True,
    #[token("False")]
    False,
    #[token("None")]
    None,

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),
    #[regex(r"[0-9]+\.[0-9]*([eE][+-]?[0-9]+)?|\.[0-9]+([eE][+-]?[0-9]+)?|[0-9]+[eE][+-]?[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    Float(f64),
    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),
    #[regex(r#""([^"\\\n]|\\.)*""#, |lex| unescape(strip_quotes(lex.slice(), 1)))]
    #[regex(r#"'([^'\\\n]|\\.)*'"#, |lex| unescape(strip_quotes(lex.slice(), 1)))]
    #[regex(r#""""([^"\\]|\\(.|\n)|"[^"]|""[^"])*""""#, |lex| unescape(strip_quotes(lex.slice(), 3)))]
    #[regex(r#"'''([^'\\]|\\(.|\n)|'[^']|''[^'])*'''"#, |lex| unescape(strip_quotes(lex.slice(), 3)))]
    #[regex(r#"[rR]"[^"\n]*""#, |lex| strip_quotes(&lex.slice()[1..], 1).to_string())]
    #[regex(r#"[rR]'[^'\n]*'"#, |lex| strip_quotes(&lex.slice()[1..], 1).to_string())]
    Str(String),

    #[token("**")]
    DoubleStar,
    #[token("*")]
    Star,
    #[token("//")]
    DoubleSlash,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("+=")]
    PlusEq,
    #[token("-=")]
    MinusEq,
    #[token("*=")]
    StarEq,
    #[token("/=")]
    SlashEq,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<=")]
    LtEq,
    #[token(">=")]
    GtEq,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("=")]
    Assign,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
    #[token(";")]
    Semicolon,
    #[token(".")]
    Dot,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Lex(Lexeme),
    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
}

fn strip_quotes(slice: &str, n: usize) -> &str {
    &slice[n..slice.len() - n]
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some('\n') => {}
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    fn new(source: &str) -> Self {
        let mut starts = vec![0];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                starts.push(i + 1);
            }
        }
        Self { starts }
    }

    /// 1-based line containing byte `offset`.
    fn line_of(&self, offset: usize) -> usize {
        match self.starts.binary_search(&offset) {
            Ok(i) => i + 1,
            Err(i) => i,
        }
    }

    fn column_of(&self, source: &str, offset: usize) -> usize {
        let start = self.starts[self.line_of(offset) - 1];
        let mut col = 0;
        for c in source[start..offset].chars() {
            if c == '\t' {
                col = (col / 8 + 1) * 8;
            } else {
                col += 1;
            }
        }
        col
    }
}

pub fn tokenize(source: &str) -> Result<Vec<Token>, ParseError> {
    let index = LineIndex::new(source);
    let mut out = Vec::new();
    let mut indents = vec![0usize];
    let mut depth: usize = 0;
    let mut at_line_start = true;
    let mut last_line = 1;

    for (result, span) in Lexeme::lexer(source).spanned() {
        let line = index.line_of(span.start);
        last_line = line;
        let lexeme = result.map_err(|_| {
            ParseError::new(line, format!("invalid token {:?}", &source[span.clone()]))
        })?;
        if lexeme == Lexeme::Newline {
            if depth == 0 && !at_line_start {
                out.push(Token {
                    kind: TokenKind::Newline,
                    line,
                });
                at_line_start = true;
            }
            continue;
        }
        if at_line_start && depth == 0 {
            let col = index.column_of(source, span.start);
            let top = *indents.last().unwrap_or(&0);
            if col > top {
                indents.push(col);
                out.push(Token {
                    kind: TokenKind::Indent,
                    line,
                });
            } else if col < top {
                while col < *indents.last().unwrap_or(&0) {
                    indents.pop();
                    out.push(Token {
                        kind: TokenKind::Dedent,
                        line,
                    });
                }
                if col != *indents.last().unwrap_or(&0) {
                    return Err(ParseError::new(
                        line,
                        "unindent does not match any outer indentation level",
                    ));
                }
            }
            at_line_start = false;
        }
        match lexeme {
            Lexeme::LParen | Lexeme::LBracket | Lexeme::LBrace => depth += 1,
            Lexeme::RParen | Lexeme::RBracket | Lexeme::RBrace => {
                depth = depth.saturating_sub(1)
            }
            _ => {}
        }
        out.push(Token {
            kind: TokenKind::Lex(lexeme),
            line,
        });
    }

    if !at_line_start {
        out.push(Token {
            kind: TokenKind::Newline,
            line: last_line,
        });
    }
    while indents.len() > 1 {
        indents.pop();
        out.push(Token {
            kind: TokenKind::Dedent,
            line: last_line,
        });
    }
    out.push(Token {
        kind: TokenKind::Eof,
        line: last_line,
    });
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source)
            .expect("tokenize")
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn indentation_produces_indent_and_dedent() {
        let toks = kinds("if x:\n    y = 1\nz = 2\n");
        assert!(toks.contains(&TokenKind::Indent));
        assert!(toks.contains(&TokenKind::Dedent));
        assert_eq!(toks.last(), Some(&TokenKind::Eof));
    }

    #[test]
    fn newlines_inside_brackets_are_ignored() {
        let toks = kinds("x = [1,\n  2,\n  3]\n");
        let newlines = toks.iter().filter(|t| **t == TokenKind::Newline).count();
        assert_eq!(newlines, 1);
        assert!(!toks.contains(&TokenKind::Indent));
    }

    #[test]
    fn strings_unescape_and_keep_raw_prefix() {
        let toks = kinds(r#"a = "x\ty" + r'\d+'"#);
        assert!(toks.contains(&TokenKind::Lex(Lexeme::Str("x\ty".into()))));
        assert!(toks.contains(&TokenKind::Lex(Lexeme::Str("\\d+".into()))));
    }

    #[test]
    fn triple_quoted_strings_span_lines() {
        let toks = tokenize("s = '''a\nb'''\nt = 1\n").expect("tokenize");
        let t = toks
            .iter()
            .find(|t| t.kind == TokenKind::Lex(Lexeme::Ident("t".into())))
            .expect("t");
        assert_eq!(t.line, 3);
        assert!(toks
            .iter()
            .any(|t| t.kind == TokenKind::Lex(Lexeme::Str("a\nb".into()))));
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let toks = kinds("# header\n\nx = 1  # trailing\n\n");
        assert_eq!(
            toks,
            vec![
                TokenKind::Lex(Lexeme::Ident("x".into())),
                TokenKind::Lex(Lexeme::Assign),
                TokenKind::Lex(Lexeme::Int(1)),
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn bad_dedent_is_rejected() {
        let err = tokenize("if x:\n    a = 1\n  b = 2\n").expect_err("bad dedent");
        assert_eq!(err.line, 3);
    }

    #[test]
    fn floats_and_ints_are_distinguished() {
        let toks = kinds("a = 1.5 + 2 + 3e2\n");
        assert!(toks.contains(&TokenKind::Lex(Lexeme::Float(1.5))));
        assert!(toks.contains(&TokenKind::Lex(Lexeme::Int(2))));
        assert!(toks.contains(&TokenKind::Lex(Lexeme::Float(300.0))));
    }
}
