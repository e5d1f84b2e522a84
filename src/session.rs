//! Compile Session Module
//!
//! One `CompileSession` per target architecture owns every piece of state
//! that must not outlive that architecture: the type cache, the merged
//! symbol table and the obfuscation maps. Switching architectures means
//! building a new session.

use crate::metabase::Metabase;
use crate::obfuscate::{Obfuscator, APP_PREFIX, LIB_PREFIX};
use crate::symbols::SymbolTable;
use crate::types::TypeResolver;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// A class declared from script through `defineClass`.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomClass {
    pub name: String,
    pub superclass: Option<String>,
}

#[derive(Debug)]
pub struct CompileSession {
    pub arch: String,
    pub metabase: Arc<Metabase>,
    pub types: TypeResolver,
    pub symbols: SymbolTable,
    pub obfuscator: Obfuscator,
    /// Tokens for names exported by the shared runtime library.
    pub lib_obfuscator: Obfuscator,
    pub obfuscate: bool,
    /// Runtime-provided bridges referenced by scripts (memory access,
    /// comparisons), registered on the global object by every loader.
    pub builtin_symbols: BTreeSet<String>,
    pub custom_classes: BTreeMap<String, CustomClass>,
}

impl CompileSession {
    pub fn new(arch: &str, metabase: Arc<Metabase>, obfuscate: bool) -> Self {
        log::info!("[Hyperloop] starting session for {}", arch);
        Self {
            arch: arch.to_string(),
            types: TypeResolver::new(Arc::clone(&metabase)),
            metabase,
            symbols: SymbolTable::new(),
            obfuscator: Obfuscator::new(APP_PREFIX),
            lib_obfuscator: Obfuscator::new(LIB_PREFIX),
            obfuscate,
            builtin_symbols: BTreeSet::new(),
            custom_classes: BTreeMap::new(),
        }
    }

    /// Script-visible name for a bridge function.
    pub fn bridge_key(&mut self, symbol_name: &str) -> String {
        if self.obfuscate {
            self.obfuscator.obfuscate(symbol_name)
        } else {
            symbol_name.to_string()
        }
    }

    pub fn record_builtin(&mut self, name: &str) {
        self.builtin_symbols.insert(name.to_string());
    }

    pub fn register_custom_class(&mut self, name: &str, superclass: Option<&str>) {
        self.types.register_class(name);
        self.custom_classes.insert(
            name.to_string(),
            CustomClass {
                name: name.to_string(),
                superclass: superclass.map(String::from),
            },
        );
    }

    pub fn custom_class_names(&self) -> BTreeSet<String> {
        self.custom_classes.keys().cloned().collect()
    }

    /// Class (metabase or custom) a member lookup should start from.
    pub fn lookup_class<'a>(&'a self, name: &'a str) -> &'a str {
        match self.custom_classes.get(name) {
            Some(custom) => custom.superclass.as_deref().unwrap_or(name),
            None => name,
        }
    }

    pub fn is_class(&self, name: &str) -> bool {
        self.metabase.classes.contains_key(name) || self.custom_classes.contains_key(name)
    }
}
