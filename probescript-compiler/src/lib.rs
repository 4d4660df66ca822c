//! probescript code generator
//!
//! Lowers a typed AST of tracing programs (probes with attach points,
//! predicates and action statements) into an eBPF relocatable object. One
//! function is emitted per resolved attach point; in-kernel maps are
//! referenced for aggregation, and asynchronous events flow to user space
//! through the perf ring using the layouts in `probescript-protocol`.
//!
//! Parsing, semantic typing, kernel feature probing and symbol discovery are
//! consumed as services through [`runtime::RuntimeContext`]; they are not
//! implemented here.

pub mod ast;
pub mod codegen;
pub mod runtime;
pub mod types;

use ast::SourceLocation;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodeGenError {
    #[error("LLVM error: {0}")]
    Llvm(String),

    #[error("builder error: {0}")]
    Builder(String),

    #[error("compile phase out of order: expected {expected}, current {actual}")]
    Phase {
        expected: &'static str,
        actual: &'static str,
    },

    // Upstream semantic-analysis gaps. Not recoverable.
    #[error("unknown identifier \"{ident}\" at {loc}")]
    UnknownIdentifier { ident: String, loc: SourceLocation },

    #[error("unknown builtin \"{ident}\" at {loc}")]
    UnknownBuiltin { ident: String, loc: SourceLocation },

    #[error("missing lowering for function \"{func}\" at {loc}")]
    UnknownCall { func: String, loc: SourceLocation },

    #[error("internal error: {0}")]
    Internal(String),

    // Resolution failures, surfaced to the caller with the offending name.
    #[error("could not resolve symbol: {0}")]
    SymbolResolution(String),

    #[error("failed to find usdt probe: {0}")]
    UsdtNotFound(String),

    #[error("map not found: {0}")]
    MapNotFound(String),

    #[error("unknown record type: {0}")]
    UnknownRecord(String),

    #[error("could not create target machine for {0}")]
    TargetMachine(String),

    #[error("failed to write {path}: {message}")]
    ObjectEmission { path: String, message: String },
}

pub type Result<T> = std::result::Result<T, CodeGenError>;

pub use codegen::{CodeGen, CompiledObject, Phase};
