//! The step-script language: parsing, evaluation, layered mappings and the
//! iterative re-executor.

pub mod ast;
pub mod builtins;
pub mod error;
pub mod interp;
pub mod lexer;
pub mod literal;
pub mod mapping;
pub mod parser;
pub mod resume;
pub mod value;

pub use error::{ErrorKind, ParseError, ScriptError, TraceFrame};
pub use interp::Interpreter;
pub use literal::{interpret_value, read_literal, LiteralError};
pub use mapping::{LayeredMap, MapRef, MappingError};
pub use parser::{parse_expression, parse_module};
pub use resume::{compile_fresh, compile_resume, Compiled, ResumeError, LAST_LINENO};
pub use value::{CallHook, Function, Kwargs, Module, Namespace, Value};
