//! # Hyperloop Native Compiler
//!
//! Turns scripts that call native APIs directly into bridge code for an
//! embedded JavaScriptCore engine.
//!
//! ## Pipeline
//!
//! 1. **Types**: native spellings resolve against the metabase into
//!    `TypeDescriptor`s that know how to marshal themselves.
//! 2. **Transform**: scripts marked `'use hyperloop'` are rewritten so every
//!    native construct calls a generated bridge function.
//! 3. **IR**: rewritten scripts reduce to variables, assignments, bridge
//!    calls and opaque code, coalesced per file.
//! 4. **Codegen**: one unit per class, type, function table and loader,
//!    written through a content-hash cache and optionally compiled.
//!
//! Every architecture gets a fresh `CompileSession`; nothing is shared
//! between them.

#[cfg(feature = "napi")]
use napi_derive::napi;

mod cache;
mod codegen;
mod config;
mod embed;
mod error;
mod ir;
mod metabase;
mod naming;
mod obfuscate;
mod pipeline;
mod rewrite;
mod scope;
mod session;
mod symbols;
mod toolchain;
mod transform;
mod types;

#[cfg(test)]
mod pipeline_tests;
#[cfg(test)]
mod types_tests;

pub use cache::{SourceCache, SourceEntry};
pub use codegen::{write_units, GeneratedUnit, Generator, SourceFile, SourceKind};
pub use config::CompileOptions;
pub use error::{CompileResult, CompilerError};
pub use ir::{Ir, Node};
pub use metabase::Metabase;
pub use obfuscate::Obfuscator;
pub use pipeline::{compile_arch, discover_sources, load_source, run, ArchReport};
pub use session::CompileSession;
pub use symbols::{ClassMap, Symbol, SymbolTable};
pub use toolchain::{CompileJob, Toolchain};
pub use transform::{compile as transform_source, TransformOutput};
pub use types::{ScriptKind, TypeDescriptor, TypeResolver};

/// Runs every configured architecture. `options_json` is layered over the
/// user and project config files; the result is the per-architecture report.
#[cfg(feature = "napi")]
#[napi]
pub fn compile_bridge(options_json: String) -> napi::Result<serde_json::Value> {
    let overrides: serde_json::Value = serde_json::from_str(&options_json)
        .map_err(|e| napi::Error::from_reason(e.to_string()))?;
    let options =
        CompileOptions::load(&overrides).map_err(|e| napi::Error::from_reason(e.to_string()))?;
    let reports = run(&options).map_err(|e| napi::Error::from_reason(e.to_string()))?;
    serde_json::to_value(reports).map_err(|e| napi::Error::from_reason(e.to_string()))
}

/// Classifies one native spelling against a metabase.
#[cfg(feature = "napi")]
#[napi]
pub fn resolve_type(metabase_json: String, spelling: String) -> napi::Result<serde_json::Value> {
    let metabase =
        Metabase::from_json(&metabase_json).map_err(|e| napi::Error::from_reason(e.message))?;
    let mut resolver = TypeResolver::new(std::sync::Arc::new(metabase));
    let descriptor = resolver
        .resolve(&spelling)
        .map_err(|e| napi::Error::from_reason(e.message))?;
    Ok(serde_json::json!({
        "value": descriptor.to_string(),
        "name": descriptor.name,
        "kind": descriptor.native.label(),
        "scriptKind": descriptor.script_kind(),
        "isConst": descriptor.is_const,
        "pointer": descriptor.pointer,
        "cast": descriptor.to_cast(),
    }))
}
