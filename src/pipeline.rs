//! Pipeline Module
//!
//! Drives one compile pass per architecture: discover sources, transform and
//! reduce every script, generate units, write them through the source cache
//! and hand stale units to the native toolchain.
//!
//! Architectures are independent. A failure aborts only the architecture it
//! happened in; whatever earlier architectures wrote stays on disk.

use crate::cache::SourceCache;
use crate::codegen::{write_units, Generator, SourceFile, SourceKind};
use crate::config::CompileOptions;
use crate::error::{CompileResult, CompilerError, ERR_CONFIG, ERR_JSON};
use crate::ir::Ir;
use crate::metabase::Metabase;
use crate::naming::js_filename;
use crate::obfuscate::Obfuscator;
use crate::session::CompileSession;
use crate::toolchain::{CompileJob, Toolchain};
use crate::transform;
use oxc_allocator::Allocator;
use oxc_codegen::Codegen;
use oxc_parser::Parser;
use oxc_span::SourceType;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

const DEFAULT_MODULE_ID: &str = "app";

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArchReport {
    pub arch: String,
    pub units: usize,
    pub cache_hits: usize,
    pub compiled: usize,
    pub native_files: usize,
    pub embedded_files: usize,
}

/// `.js` and `.json` files under `src`, sorted by path. Hidden directories
/// and the output directory are skipped.
pub fn discover_sources(src: &Path, dest: &Path) -> Vec<PathBuf> {
    let dest = dest.canonicalize().ok();
    let mut files = Vec::new();

    let walker = WalkDir::new(src).follow_links(true).into_iter().filter_entry(|entry| {
        let hidden = entry.depth() > 0
            && entry.file_name().to_string_lossy().starts_with('.');
        let is_dest = dest.is_some() && entry.path().canonicalize().ok() == dest;
        !hidden && !is_dest
    });
    for entry in walker.filter_map(|e| e.ok()) {
        let path = entry.path();
        if !entry.file_type().is_file() {
            continue;
        }
        if matches!(path.extension().and_then(|e| e.to_str()), Some("js" | "json")) {
            files.push(path.to_path_buf());
        }
    }

    files.sort();
    files
}

fn relative_path(src: &Path, path: &Path) -> String {
    path.strip_prefix(src)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

/// Transforms and reduces one file. Native-mode scripts feed the session's
/// symbol table; anything else becomes an embedded payload.
pub fn load_source(
    session: &mut CompileSession,
    relative: &str,
    source: String,
) -> CompileResult<SourceFile> {
    if relative.ends_with(".json") {
        serde_json::from_str::<serde_json::Value>(&source).map_err(|e| {
            CompilerError::new(
                ERR_JSON,
                &format!("invalid JSON: {}", e),
                relative,
                e.line() as u32,
                e.column() as u32,
            )
        })?;
        return Ok(SourceFile {
            relative: relative.to_string(),
            code: source,
            kind: SourceKind::Json,
        });
    }

    let output = transform::compile(session, &source, relative)?;
    if !output.active {
        return Ok(SourceFile {
            relative: relative.to_string(),
            code: source,
            kind: SourceKind::Script,
        });
    }
    let ir = Ir::build(&output.code, relative, &output.symbols)?;
    Ok(SourceFile {
        relative: relative.to_string(),
        code: output.code,
        kind: SourceKind::Native {
            ir,
            symbols: output.symbols,
        },
    })
}

fn write_dumps(options: &CompileOptions, arch_dir: &Path, file: &SourceFile) -> CompileResult<()> {
    let SourceKind::Native { ir, .. } = &file.kind else {
        return Ok(());
    };
    let stem = js_filename(&file.relative);
    if options.dump_ir {
        let dir = arch_dir.join("ir");
        fs::create_dir_all(&dir)?;
        fs::write(
            dir.join(format!("{}.json", stem)),
            serde_json::to_string_pretty(&ir.to_json())?,
        )?;
    }
    if options.dump_ast {
        let dir = arch_dir.join("ast");
        fs::create_dir_all(&dir)?;
        let allocator = Allocator::default();
        let ret = Parser::new(&allocator, &file.code, SourceType::default().with_module(true)).parse();
        // rewritten code always parses; fall back to the raw text if it ever doesn't
        let printed = if ret.errors.is_empty() {
            Codegen::new().build(&ret.program).code
        } else {
            file.code.clone()
        };
        fs::write(dir.join(format!("{}.js", stem)), printed)?;
    }
    Ok(())
}

/// One full pass for `arch`.
pub fn compile_arch(options: &CompileOptions, arch: &str) -> CompileResult<ArchReport> {
    let Some(metabase_path) = options.metabase.get(arch) else {
        return Err(CompilerError::bare(
            ERR_CONFIG,
            &format!("no metabase configured for architecture '{}'", arch),
        ));
    };
    let metabase = Arc::new(Metabase::load(metabase_path).map_err(|e| {
        e.at(&metabase_path.to_string_lossy(), 1, 1)
    })?);

    let mut session = CompileSession::new(arch, metabase, options.obfuscate);
    if let Some(prefix) = &options.symbol_prefix {
        session.obfuscator = Obfuscator::new(prefix);
    }

    let arch_dir = options.arch_dir(arch);
    fs::create_dir_all(&arch_dir)?;

    let mut files = Vec::new();
    for path in discover_sources(&options.src, &options.dest) {
        let relative = relative_path(&options.src, &path);
        let source = fs::read_to_string(&path)?;
        log::debug!("[Hyperloop] {}: loading {}", arch, relative);
        let file = load_source(&mut session, &relative, source)?;
        write_dumps(options, &arch_dir, &file)?;
        files.push(file);
    }
    let native_files = files.iter().filter(|f| f.is_native()).count();

    let module_id = options.module_id.as_deref().unwrap_or(DEFAULT_MODULE_ID);
    let units = Generator::new(&mut session, module_id, options.xor.as_deref())
        .generate_all(&files)?;

    let mut cache = SourceCache::load(&arch_dir, &options.hash(), options.force)?;
    let entries = write_units(&units, &arch_dir, &mut cache)?;
    for stale in cache.prune_untouched()? {
        log::info!("[Hyperloop] {}: dropped stale unit {}", arch, stale.display());
    }
    cache.save()?;

    let mut compiled = 0;
    if let Some(compiler) = &options.compiler {
        let toolchain = Toolchain::new(compiler, &options.cflags, options.jobs);
        let jobs = CompileJob::plan(&entries, &arch_dir.join("obj"));
        if let Err(err) = toolchain.compile_all(&jobs) {
            // force the failed batch through the compiler again next time
            for job in &jobs {
                cache.invalidate(&job.source);
            }
            cache.save()?;
            return Err(err);
        }
        compiled = jobs.len();
    }

    let report = ArchReport {
        arch: arch.to_string(),
        units: units.len(),
        cache_hits: cache.hits(),
        compiled,
        native_files,
        embedded_files: files.len() - native_files,
    };
    log::info!(
        "[Hyperloop] {}: {} units, {} cached, {} compiled",
        arch,
        report.units,
        report.cache_hits,
        report.compiled
    );
    Ok(report)
}

/// Every configured architecture in order. All of them run even if one
/// fails; the first failure is returned afterwards.
pub fn run(options: &CompileOptions) -> CompileResult<Vec<ArchReport>> {
    let archs = options.archs();
    if archs.is_empty() {
        return Err(CompilerError::bare(ERR_CONFIG, "no architectures configured")
            .with_hint("add a metabase path per architecture under \"metabase\""));
    }

    let mut reports = Vec::new();
    let mut first_error = None;
    for arch in archs {
        match compile_arch(options, &arch) {
            Ok(report) => reports.push(report),
            Err(err) => {
                log::warn!("[Hyperloop] {} failed: {}", arch, err);
                first_error.get_or_insert(err);
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(reports),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discover_skips_hidden_and_dest() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path();
        fs::create_dir_all(src.join("lib")).unwrap();
        fs::create_dir_all(src.join(".hyperloop")).unwrap();
        fs::create_dir_all(src.join("build")).unwrap();
        fs::write(src.join("app.js"), "").unwrap();
        fs::write(src.join("lib/util.js"), "").unwrap();
        fs::write(src.join("lib/data.json"), "{}").unwrap();
        fs::write(src.join("readme.md"), "").unwrap();
        fs::write(src.join(".hyperloop/config.json"), "{}").unwrap();
        fs::write(src.join("build/out.js"), "").unwrap();

        let found: Vec<String> = discover_sources(src, &src.join("build"))
            .iter()
            .map(|p| relative_path(src, p))
            .collect();
        assert_eq!(found, vec!["app.js", "lib/data.json", "lib/util.js"]);
    }

    #[test]
    fn test_invalid_json_payload_names_file() {
        let metabase = Arc::new(Metabase::default());
        let mut session = CompileSession::new("arm64", metabase, false);
        let err = load_source(&mut session, "conf/settings.json", "{ nope".to_string()).unwrap_err();
        assert_eq!(err.code, ERR_JSON);
        assert_eq!(err.file, "conf/settings.json");
    }

    #[test]
    fn test_plain_script_is_embedded() {
        let metabase = Arc::new(Metabase::default());
        let mut session = CompileSession::new("arm64", metabase, false);
        let file = load_source(&mut session, "util.js", "module.exports = 1;".to_string()).unwrap();
        assert!(matches!(file.kind, SourceKind::Script));
        assert_eq!(file.code, "module.exports = 1;");
    }

    #[test]
    fn test_missing_architectures() {
        let err = run(&CompileOptions::default()).unwrap_err();
        assert_eq!(err.code, ERR_CONFIG);
    }
}
