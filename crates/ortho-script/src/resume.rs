//! Iterative re-execution of step scripts.
//!
//! A fresh compile splices `last_lineno = <line>` after every top-level
//! statement. A resume compares the failed script with the current one
//! statement by statement and turns everything before the resumption point
//! into those markers, so completed work is not repeated but line tracking
//! carries on.

use crate::ast::{Expr, Stmt, StmtKind};
use crate::error::ParseError;
use crate::parser::parse_module;
use thiserror::Error;

pub const LAST_LINENO: &str = "last_lineno";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResumeError {
    #[error("cannot parse the {which} script: line {}: {}", .err.line, .err.message)]
    Parse { which: &'static str, err: ParseError },
    #[error("recorded last line {0} is not a top-level statement of the previous script")]
    LineNotFound(i64),
    #[error("first difference is after the last line")]
    AfterLastLine,
}

#[derive(Debug, Clone)]
pub struct Compiled {
    pub body: Vec<Stmt>,
    /// Index of the first top-level statement that actually runs.
    pub resume_index: usize,
}

fn marker(line: usize) -> Stmt {
    Stmt::new(
        line,
        StmtKind::Assign {
            targets: vec![Expr::Name(LAST_LINENO.to_string())],
            value: Expr::Int(line as i64),
        },
    )
}

fn kept_before_resume(stmt: &Stmt) -> bool {
    stmt.is_import() || matches!(stmt.kind, StmtKind::Def(_))
}

fn splice(statements: Vec<Stmt>, resume_index: usize) -> Vec<Stmt> {
    let mut body = Vec::with_capacity(statements.len() * 2);
    for (i, stmt) in statements.into_iter().enumerate() {
        let line = stmt.line;
        if i >= resume_index || kept_before_resume(&stmt) {
            body.push(stmt);
        }
        body.push(marker(line));
    }
    body
}

pub fn compile_fresh(source: &str) -> Result<Compiled, ParseError> {
    let module = parse_module(source)?;
    Ok(Compiled {
        body: splice(module.body, 0),
        resume_index: 0,
    })
}

/// Compile `new` so that it continues where the run of `old` stopped.
/// `last_lineno` is the marker recorded when `old` failed; `None` means the
/// failure happened before the first statement completed.
pub fn compile_resume(
    old: &str,
    new: &str,
    last_lineno: Option<i64>,
) -> Result<Compiled, ResumeError> {
    let old_body = parse_module(old)
        .map_err(|err| ResumeError::Parse { which: "previous", err })?
        .body;
    let new_body = parse_module(new)
        .map_err(|err| ResumeError::Parse { which: "current", err })?
        .body;
    let old_dumps: Vec<String> = old_body.iter().map(Stmt::dump).collect();
    let new_dumps: Vec<String> = new_body.iter().map(Stmt::dump).collect();

    let failed_index = match last_lineno {
        None => 0,
        Some(line) => old_body
            .iter()
            .position(|s| s.line as i64 == line)
            .map(|i| i + 1)
            .ok_or(ResumeError::LineNotFound(line))?,
    };

    let resume_index = if old_dumps == new_dumps {
        failed_index
    } else {
        let first_difference = old_dumps
            .iter()
            .zip(&new_dumps)
            .position(|(a, b)| a != b)
            .unwrap_or_else(|| old_dumps.len().min(new_dumps.len()));
        if first_difference > failed_index {
            tracing::warn!(
                first_difference,
                failed_index,
                "script changed after the statement that failed; resuming at the change"
            );
        }
        first_difference
    };
    if resume_index >= new_body.len() {
        return Err(ResumeError::AfterLastLine);
    }
    tracing::debug!(resume_index, "resuming script");
    Ok(Compiled {
        body: splice(new_body, resume_index),
        resume_index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker_line(stmt: &Stmt) -> Option<i64> {
        match &stmt.kind {
            StmtKind::Assign { targets, value: Expr::Int(n) }
                if targets == &vec![Expr::Name(LAST_LINENO.to_string())] =>
            {
                Some(*n)
            }
            _ => None,
        }
    }

    const SCRIPT: &str = "a = 1\n\nimport tools\n\nb = 2\n\nc = 3\n\nd = 4\n\ne = 5\n";

    #[test]
    fn fresh_compile_marks_every_statement() {
        let compiled = compile_fresh("x = 1\ny = 2\n").expect("compile");
        assert_eq!(compiled.body.len(), 4);
        assert_eq!(marker_line(&compiled.body[1]), Some(1));
        assert_eq!(marker_line(&compiled.body[3]), Some(2));
        assert_eq!(marker_line(&compiled.body[0]), None);
    }

    #[test]
    fn identical_script_resumes_after_recorded_line() {
        let compiled = compile_resume(SCRIPT, SCRIPT, Some(7)).expect("resume");
        assert_eq!(compiled.resume_index, 4);
        let lines: Vec<(usize, Option<i64>)> = compiled
            .body
            .iter()
            .map(|s| (s.line, marker_line(s)))
            .collect();
        assert_eq!(
            lines,
            vec![
                (1, Some(1)),
                (3, None),
                (3, Some(3)),
                (5, Some(5)),
                (7, Some(7)),
                (9, None),
                (9, Some(9)),
                (11, None),
                (11, Some(11)),
            ]
        );
        assert!(compiled.body[1].is_import());
    }

    #[test]
    fn changed_script_resumes_at_first_difference() {
        let old = "a = 1\nb = 2\nc = 3\nd = 4\n";
        let new = "a = 1\nb = 2\nc = 30\nd = 4\n";
        let compiled = compile_resume(old, new, Some(1)).expect("resume");
        assert_eq!(compiled.resume_index, 2);
        assert_eq!(marker_line(&compiled.body[0]), Some(1));
        assert_eq!(marker_line(&compiled.body[1]), Some(2));
        assert_eq!(marker_line(&compiled.body[2]), None);
    }

    #[test]
    fn definitions_before_resume_point_are_kept() {
        let src = "def f():\n    return 1\nx = f()\ny = x + 1\n";
        let compiled = compile_resume(src, src, Some(3)).expect("resume");
        assert!(matches!(compiled.body[0].kind, StmtKind::Def(_)));
        assert_eq!(compiled.resume_index, 2);
    }

    #[test]
    fn last_statement_recorded_is_an_error() {
        let err = compile_resume(SCRIPT, SCRIPT, Some(11)).expect_err("past end");
        assert_eq!(err.to_string(), "first difference is after the last line");
    }

    #[test]
    fn unknown_recorded_line_is_an_error() {
        assert_eq!(
            compile_resume(SCRIPT, SCRIPT, Some(2)).expect_err("missing"),
            ResumeError::LineNotFound(2)
        );
    }

    #[test]
    fn missing_marker_restarts_from_the_top() {
        let compiled = compile_resume(SCRIPT, SCRIPT, None).expect("resume");
        assert_eq!(compiled.resume_index, 0);
    }
}
