//! Error Module for the Hyperloop native compiler
//!
//! Every failure surfaces as a `CompilerError` carrying a stable code, the
//! originating file and line, and a one-line guarantee the code protects.

#[cfg(feature = "napi")]
use napi_derive::napi;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════════════
// ERROR CODES
// ═══════════════════════════════════════════════════════════════════════════════

pub const ERR_NO_METABASE: &str = "HL-ERR-TYPE-001";
pub const ERR_ALIAS_CHAIN: &str = "HL-ERR-TYPE-002";
pub const ERR_UNKNOWN_TYPE: &str = "HL-ERR-TYPE-003";
pub const ERR_UNDEFINED_SYMBOL: &str = "HL-ERR-SYMBOL-001";
pub const ERR_INVALID_MEMBER: &str = "HL-ERR-SYMBOL-002";
pub const ERR_UNHANDLED_STATEMENT: &str = "HL-ERR-IR-001";
pub const ERR_PARSE: &str = "HL-ERR-PARSE-001";
pub const ERR_IO: &str = "HL-ERR-IO-001";
pub const ERR_JSON: &str = "HL-ERR-JSON-001";
pub const ERR_TOOLCHAIN: &str = "HL-ERR-TOOLCHAIN-001";
pub const ERR_CONFIG: &str = "HL-ERR-CONFIG-001";

// ═══════════════════════════════════════════════════════════════════════════════
// GUARANTEES
// ═══════════════════════════════════════════════════════════════════════════════

fn get_guarantee(code: &str) -> &'static str {
    match code {
        ERR_NO_METABASE => "Types are only resolved against an active metabase.",
        ERR_ALIAS_CHAIN => "Typedef chains resolve in a bounded number of steps.",
        ERR_UNKNOWN_TYPE => "Every native type used by a script has a marshalling pair.",
        ERR_UNDEFINED_SYMBOL => {
            "Every identifier is a script built-in, a local declaration or a native symbol."
        }
        ERR_INVALID_MEMBER => "Native members are only used the way the metabase declares them.",
        ERR_UNHANDLED_STATEMENT => "Every top-level statement lowers to an IR node.",
        ERR_PARSE => "Only syntactically valid scripts reach the transformer.",
        ERR_IO => "Generated units are written atomically per file.",
        ERR_JSON => "Metabase, cache and payload documents are valid JSON.",
        ERR_TOOLCHAIN => "A native unit compiles or the architecture pass aborts.",
        ERR_CONFIG => "Option files are well-formed before compilation starts.",
        _ => "Unknown guarantee.",
    }
}

fn get_error_type(code: &str) -> &'static str {
    match code {
        ERR_NO_METABASE | ERR_ALIAS_CHAIN | ERR_UNKNOWN_TYPE => "TYPE_RESOLUTION",
        ERR_UNDEFINED_SYMBOL | ERR_INVALID_MEMBER => "SYMBOL_RESOLUTION",
        ERR_UNHANDLED_STATEMENT => "COMPILER_INVARIANT_VIOLATION",
        ERR_PARSE => "SYNTAX",
        ERR_TOOLCHAIN => "TOOLCHAIN",
        ERR_IO | ERR_JSON | ERR_CONFIG => "ENVIRONMENT",
        _ => "COMPILER_INVARIANT_VIOLATION",
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMPILER ERROR
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize, Error, PartialEq)]
#[cfg_attr(feature = "napi", napi(object))]
#[serde(rename_all = "camelCase")]
#[error("{code}: {message} at {file}:{line}")]
pub struct CompilerError {
    pub code: String,
    pub error_type: String,
    pub message: String,
    pub guarantee: String,
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub context: Option<String>,
    pub hints: Vec<String>,
}

impl CompilerError {
    pub fn new(code: &str, message: &str, file: &str, line: u32, column: u32) -> Self {
        Self::with_details(code, message, file, line, column, None, vec![])
    }

    pub fn with_details(
        code: &str,
        message: &str,
        file: &str,
        line: u32,
        column: u32,
        context: Option<String>,
        hints: Vec<String>,
    ) -> Self {
        CompilerError {
            code: code.to_string(),
            error_type: get_error_type(code).to_string(),
            message: message.to_string(),
            guarantee: get_guarantee(code).to_string(),
            file: file.to_string(),
            line,
            column,
            context,
            hints,
        }
    }

    /// Error with no source position (type resolution, configuration).
    pub fn bare(code: &str, message: &str) -> Self {
        Self::new(code, message, "<none>", 0, 0)
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hints.push(hint.into());
        self
    }

    /// Re-anchor a position-less error at a source location.
    pub fn at(mut self, file: &str, line: u32, column: u32) -> Self {
        if self.line == 0 {
            self.file = file.to_string();
            self.line = line;
            self.column = column;
        }
        self
    }
}

impl From<std::io::Error> for CompilerError {
    fn from(err: std::io::Error) -> Self {
        CompilerError::bare(ERR_IO, &err.to_string())
    }
}

impl From<serde_json::Error> for CompilerError {
    fn from(err: serde_json::Error) -> Self {
        CompilerError::new(
            ERR_JSON,
            &err.to_string(),
            "<json>",
            err.line() as u32,
            err.column() as u32,
        )
    }
}

pub type CompileResult<T> = Result<T, CompilerError>;
