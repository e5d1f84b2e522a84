//! Compile options and their layered loading.
//!
//! Later layers override earlier keys: defaults, then
//! `$HOME/.hyperloop/config.json`, then `<src>/.hyperloop/config.json`, then
//! explicit overrides from the caller.

use crate::error::{CompileResult, CompilerError, ERR_CONFIG};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_DIR: &str = ".hyperloop";
pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CompileOptions {
    /// Directory holding the script sources.
    pub src: PathBuf,
    /// Directory receiving generated units.
    pub dest: PathBuf,
    /// Metabase per architecture; the key is the architecture name.
    pub metabase: std::collections::BTreeMap<String, PathBuf>,
    /// Architectures to build. Empty means every metabase entry.
    pub arch: Vec<String>,
    pub obfuscate: bool,
    /// Regenerate and recompile every unit regardless of the source cache.
    pub force: bool,
    /// Native compile jobs; 0 means one per CPU.
    pub jobs: usize,
    pub dump_ir: bool,
    pub dump_ast: bool,
    pub module_id: Option<String>,
    /// Native compiler executable. No compilation happens when unset.
    pub compiler: Option<String>,
    pub cflags: Vec<String>,
    /// XOR key for embedded source tables.
    pub xor: Option<String>,
    /// Prefix for obfuscated application symbols.
    pub symbol_prefix: Option<String>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            src: PathBuf::from("."),
            dest: PathBuf::from("build"),
            metabase: Default::default(),
            arch: Vec::new(),
            obfuscate: false,
            force: false,
            jobs: 0,
            dump_ir: false,
            dump_ast: false,
            module_id: None,
            compiler: None,
            cflags: Vec::new(),
            xor: None,
            symbol_prefix: None,
        }
    }
}

impl CompileOptions {
    pub fn from_json(json: &str) -> CompileResult<Self> {
        serde_json::from_str(json).map_err(|e| {
            CompilerError::bare(ERR_CONFIG, &format!("invalid compile options: {}", e))
        })
    }

    /// Defaults, user config, project config, then `overrides`.
    pub fn load(overrides: &Value) -> CompileResult<Self> {
        let mut merged = serde_json::to_value(CompileOptions::default())?;

        if let Some(home) = std::env::var_os("HOME") {
            let path = PathBuf::from(home).join(CONFIG_DIR).join(CONFIG_FILE);
            merge(&mut merged, &read_layer(&path)?);
        }

        // The project layer lives under the source directory the overrides
        // (or the defaults) point at.
        let src = overrides
            .get("src")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .or_else(|| merged.get("src").and_then(Value::as_str).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."));
        merge(&mut merged, &read_layer(&src.join(CONFIG_DIR).join(CONFIG_FILE))?);

        merge(&mut merged, overrides);
        serde_json::from_value(merged).map_err(|e| {
            CompilerError::bare(ERR_CONFIG, &format!("invalid compile options: {}", e))
        })
    }

    pub fn effective_jobs(&self) -> usize {
        if self.jobs == 0 {
            rayon::current_num_threads()
        } else {
            self.jobs
        }
    }

    /// SHA-256 over the options that change generated output. Toggling a
    /// debug dump or the job count leaves it unchanged.
    pub fn hash(&self) -> String {
        let relevant = serde_json::json!({
            "obfuscate": self.obfuscate,
            "moduleId": self.module_id,
            "compiler": self.compiler,
            "cflags": self.cflags,
            "xor": self.xor,
            "metabase": self.metabase,
            "symbolPrefix": self.symbol_prefix,
        });
        let mut hasher = Sha256::new();
        hasher.update(relevant.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn archs(&self) -> Vec<String> {
        self.metabase
            .keys()
            .filter(|arch| self.arch.is_empty() || self.arch.contains(arch))
            .cloned()
            .collect()
    }

    pub fn arch_dir(&self, arch: &str) -> PathBuf {
        self.dest.join(arch)
    }
}

fn read_layer(path: &Path) -> CompileResult<Value> {
    let Ok(data) = fs::read_to_string(path) else {
        return Ok(Value::Object(Map::new()));
    };
    let value: Value = serde_json::from_str(&data).map_err(|e| {
        CompilerError::new(
            ERR_CONFIG,
            &format!("invalid config file: {}", e),
            &path.to_string_lossy(),
            e.line() as u32,
            e.column() as u32,
        )
    })?;
    if !value.is_object() {
        return Err(CompilerError::new(
            ERR_CONFIG,
            "config file must contain a JSON object",
            &path.to_string_lossy(),
            1,
            1,
        ));
    }
    Ok(value)
}

/// Shallow merge; keys unknown to `CompileOptions` are dropped on
/// deserialization.
fn merge(base: &mut Value, layer: &Value) {
    if let (Some(base), Some(layer)) = (base.as_object_mut(), layer.as_object()) {
        for (key, value) in layer {
            base.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_project_layer_then_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_dir = dir.path().join(CONFIG_DIR);
        fs::create_dir_all(&cfg_dir).unwrap();
        fs::write(
            cfg_dir.join(CONFIG_FILE),
            r#"{"obfuscate": true, "jobs": 3, "somethingElse": 1}"#,
        )
        .unwrap();

        let opts = CompileOptions::load(&json!({
            "src": dir.path().to_string_lossy(),
            "jobs": 5
        }))
        .unwrap();
        assert!(opts.obfuscate);
        assert_eq!(opts.jobs, 5);
        assert_eq!(opts.effective_jobs(), 5);
    }

    #[test]
    fn test_invalid_layer_reports_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_dir = dir.path().join(CONFIG_DIR);
        fs::create_dir_all(&cfg_dir).unwrap();
        fs::write(cfg_dir.join(CONFIG_FILE), "[1, 2]").unwrap();
        let err = CompileOptions::load(&json!({ "src": dir.path().to_string_lossy() }))
            .unwrap_err();
        assert_eq!(err.code, ERR_CONFIG);
        assert!(err.file.ends_with(CONFIG_FILE));
    }

    #[test]
    fn test_hash_ignores_debug_flags() {
        let a = CompileOptions::default();
        let b = CompileOptions {
            dump_ir: true,
            jobs: 8,
            ..CompileOptions::default()
        };
        let c = CompileOptions {
            obfuscate: true,
            ..CompileOptions::default()
        };
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn test_from_json_camel_case() {
        let opts = CompileOptions::from_json(
            r#"{"src": "app", "dumpIr": true, "moduleId": "com.example", "metabase": {"arm64": "mb.json"}}"#,
        )
        .unwrap();
        assert!(opts.dump_ir);
        assert_eq!(opts.module_id.as_deref(), Some("com.example"));
        assert_eq!(opts.archs(), vec!["arm64".to_string()]);
        assert_eq!(opts.dest, PathBuf::from("build"));
    }

    #[test]
    fn test_arch_filter() {
        let opts = CompileOptions::from_json(
            r#"{"arch": ["x86_64"], "metabase": {"arm64": "a.json", "x86_64": "b.json"}}"#,
        )
        .unwrap();
        assert_eq!(opts.archs(), vec!["x86_64".to_string()]);
    }
}
