//! Symbol Table Module
//!
//! Symbols are recorded by the transformer, one per bridge function, and
//! merged across files into a table keyed by the script-visible bridge name.
//! The code generator regroups them per class.

use crate::error::CompileResult;
use crate::metabase::{FunctionDef, MethodDef, PropertyDef};
use crate::types::TypeResolver;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "member", rename_all = "kebab-case")]
pub enum SymbolKind {
    Constructor,
    InstanceMethod(MethodDef),
    StaticMethod(MethodDef),
    Getter(PropertyDef),
    Setter(PropertyDef),
    Function(FunctionDef),
}

impl SymbolKind {
    pub fn label(&self) -> &'static str {
        match self {
            SymbolKind::Constructor => "constructor",
            SymbolKind::InstanceMethod(_) => "instance-method",
            SymbolKind::StaticMethod(_) => "static-method",
            SymbolKind::Getter(_) => "getter",
            SymbolKind::Setter(_) => "setter",
            SymbolKind::Function(_) => "function",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Location {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Symbol {
    pub kind: SymbolKind,
    /// Owning class; `None` for free functions.
    pub class_name: Option<String>,
    /// Member or function name as written in the script.
    pub name: String,
    /// Native bridge function name.
    pub symbol_name: String,
    /// Script-visible name, the obfuscated token when obfuscation is on.
    pub key: String,
    pub arg_count: usize,
    pub return_type: String,
    pub location: Location,
}

impl Symbol {
    pub fn is_instance(&self) -> bool {
        match &self.kind {
            SymbolKind::InstanceMethod(_) => true,
            SymbolKind::Getter(p) | SymbolKind::Setter(p) => p.instance,
            _ => false,
        }
    }

    /// Argument spellings the bridge converts, in call order.
    pub fn arg_types(&self) -> Vec<String> {
        match &self.kind {
            SymbolKind::InstanceMethod(m) | SymbolKind::StaticMethod(m) => {
                m.args.iter().map(|a| a.ty.clone()).collect()
            }
            SymbolKind::Function(f) => f.arguments.iter().map(|a| a.ty.clone()).collect(),
            SymbolKind::Setter(p) => vec![p.ty.clone()],
            SymbolKind::Constructor | SymbolKind::Getter(_) => Vec::new(),
        }
    }
}

/// Bridge name to symbol, for one file or a whole architecture.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SymbolTable {
    symbols: BTreeMap<String, Symbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// First registration of a key wins; later call sites share it.
    pub fn insert(&mut self, symbol: Symbol) {
        self.symbols.entry(symbol.key.clone()).or_insert(symbol);
    }

    pub fn get(&self, key: &str) -> Option<&Symbol> {
        self.symbols.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.symbols.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Symbol)> {
        self.symbols.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.values()
    }

    pub fn merge(&mut self, other: &SymbolTable) {
        for symbol in other.values() {
            self.insert(symbol.clone());
        }
    }

    /// Drops symbols whose key no longer occurs in the rewritten source.
    pub fn prune_unused(&mut self, code: &str) -> Vec<String> {
        let unused: Vec<String> = self
            .symbols
            .keys()
            .filter(|key| !references(code, key))
            .cloned()
            .collect();
        for key in &unused {
            log::debug!("[Hyperloop] pruned unused symbol {}", key);
            self.symbols.remove(key);
        }
        unused
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

/// True when `key` occurs in `code` as a whole identifier.
fn references(code: &str, key: &str) -> bool {
    code.match_indices(key).any(|(at, _)| {
        let before = code[..at].chars().next_back();
        let after = code[at + key.len()..].chars().next();
        !before.map_or(false, is_ident_char) && !after.map_or(false, is_ident_char)
    })
}

/// Members of one wrapper class, each keyed by native bridge name.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClassEntry {
    pub constructors: BTreeMap<String, Symbol>,
    pub static_methods: BTreeMap<String, Symbol>,
    pub instance_methods: BTreeMap<String, Symbol>,
    pub getters: BTreeMap<String, Symbol>,
    pub setters: BTreeMap<String, Symbol>,
}

impl ClassEntry {
    pub fn len(&self) -> usize {
        self.constructors.len()
            + self.static_methods.len()
            + self.instance_methods.len()
            + self.getters.len()
            + self.setters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ClassMap {
    pub classes: BTreeMap<String, ClassEntry>,
    /// Free functions keyed by native bridge name.
    pub functions: BTreeMap<String, Symbol>,
}

impl ClassMap {
    /// Groups `table` per class. Every member's argument and return types are
    /// resolved so their marshalling code gets emitted; classes reachable only
    /// as a return type get an (empty) entry of their own, as do custom
    /// classes and every class-like type the resolver has seen.
    pub fn build(
        table: &SymbolTable,
        resolver: &mut TypeResolver,
        custom_classes: &BTreeSet<String>,
    ) -> CompileResult<ClassMap> {
        let mut map = ClassMap::default();

        for symbol in table.values() {
            for arg in symbol.arg_types() {
                resolver.resolve(&arg).map_err(|e| {
                    e.at(&symbol.location.file, symbol.location.line, symbol.location.column)
                })?;
            }
            let Some(class_name) = symbol.class_name.clone() else {
                map.functions
                    .insert(symbol.symbol_name.clone(), symbol.clone());
                resolver.resolve(&symbol.return_type)?;
                continue;
            };

            let returned = resolver.resolve(&symbol.return_type).map_err(|e| {
                e.at(&symbol.location.file, symbol.location.line, symbol.location.column)
            })?;
            let entry = map.classes.entry(class_name).or_default();
            let slot = match &symbol.kind {
                SymbolKind::Constructor => &mut entry.constructors,
                SymbolKind::InstanceMethod(_) => &mut entry.instance_methods,
                SymbolKind::StaticMethod(_) => &mut entry.static_methods,
                SymbolKind::Getter(_) => &mut entry.getters,
                SymbolKind::Setter(_) => &mut entry.setters,
                SymbolKind::Function(_) => &mut map.functions,
            };
            slot.insert(symbol.symbol_name.clone(), symbol.clone());

            let returns_object = matches!(
                symbol.kind,
                SymbolKind::InstanceMethod(_) | SymbolKind::StaticMethod(_) | SymbolKind::Getter(_)
            ) && returned.is_class_like();
            if returns_object {
                map.classes.entry(returned.class_key()).or_default();
            }
        }

        for name in custom_classes {
            map.classes.entry(name.clone()).or_default();
        }
        for name in resolver.classes() {
            map.classes.entry(name).or_default();
        }

        log::debug!(
            "[Hyperloop] class map: {} classes, {} functions",
            map.classes.len(),
            map.functions.len()
        );
        Ok(map)
    }

    pub fn get(&self, class_name: &str) -> Option<&ClassEntry> {
        self.classes.get(class_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metabase::{ArgDef, Metabase};
    use std::sync::Arc;

    fn symbol(kind: SymbolKind, class_name: Option<&str>, name: &str, ret: &str) -> Symbol {
        let symbol_name = match class_name {
            Some(c) => format!("{}_{}", c, name),
            None => format!("{}_function", name),
        };
        Symbol {
            kind,
            class_name: class_name.map(String::from),
            name: name.to_string(),
            key: symbol_name.clone(),
            symbol_name,
            arg_count: 0,
            return_type: ret.to_string(),
            location: Location {
                file: "app.js".to_string(),
                line: 1,
                column: 0,
            },
        }
    }

    fn resolver() -> TypeResolver {
        TypeResolver::new(Arc::new(
            Metabase::from_json(r#"{"classes": {"X": {}, "Y": {}, "Z": {}}}"#).unwrap(),
        ))
    }

    #[test]
    fn test_class_map_groups_members() {
        let mut table = SymbolTable::new();
        table.insert(symbol(SymbolKind::Constructor, Some("X"), "constructor", "X *"));
        table.insert(symbol(
            SymbolKind::InstanceMethod(MethodDef {
                name: "run".to_string(),
                return_type: "void".to_string(),
                ..Default::default()
            }),
            Some("X"),
            "run",
            "void",
        ));
        let mut r = resolver();
        let map = ClassMap::build(&table, &mut r, &BTreeSet::new()).unwrap();
        let x = map.get("X").unwrap();
        assert_eq!(x.constructors.len(), 1);
        assert_eq!(x.instance_methods.len(), 1);
        assert!(map.get("Y").is_none());
        assert!(map.get("Z").is_none());
    }

    #[test]
    fn test_returned_class_gets_entry() {
        let mut table = SymbolTable::new();
        table.insert(symbol(
            SymbolKind::StaticMethod(MethodDef {
                name: "make".to_string(),
                instance: false,
                return_type: "Y *".to_string(),
                args: vec![ArgDef {
                    name: None,
                    ty: "int".to_string(),
                }],
                ..Default::default()
            }),
            Some("X"),
            "make",
            "Y *",
        ));
        let mut r = resolver();
        let custom: BTreeSet<String> = ["Mine".to_string()].into_iter().collect();
        let map = ClassMap::build(&table, &mut r, &custom).unwrap();
        assert_eq!(map.get("X").unwrap().static_methods.len(), 1);
        assert!(map.get("Y").unwrap().is_empty());
        assert!(map.get("Mine").is_some());
    }

    #[test]
    fn test_functions_are_separate() {
        let mut table = SymbolTable::new();
        table.insert(symbol(
            SymbolKind::Function(FunctionDef {
                name: "CGPointMake".to_string(),
                ..Default::default()
            }),
            None,
            "CGPointMake",
            "void",
        ));
        let mut r = resolver();
        let map = ClassMap::build(&table, &mut r, &BTreeSet::new()).unwrap();
        assert!(map.classes.is_empty());
        assert!(map.functions.contains_key("CGPointMake_function"));
    }

    #[test]
    fn test_prune_and_merge() {
        let mut a = SymbolTable::new();
        a.insert(symbol(SymbolKind::Constructor, Some("X"), "constructor", "X *"));
        a.insert(symbol(SymbolKind::Constructor, Some("Y"), "constructor", "Y *"));
        let pruned = a.prune_unused("var x = X_constructor();");
        assert_eq!(pruned, vec!["Y_constructor".to_string()]);

        let mut b = SymbolTable::new();
        b.insert(symbol(SymbolKind::Constructor, Some("Z"), "constructor", "Z *"));
        b.merge(&a);
        b.merge(&a);
        assert_eq!(b.len(), 2);
    }

    #[test]
    fn test_prune_matches_whole_identifiers() {
        let mut t = SymbolTable::new();
        t.insert(symbol(SymbolKind::Constructor, Some("UIView"), "constructor", "UIView *"));
        t.insert(symbol(SymbolKind::Constructor, Some("UILabel"), "constructor", "UILabel *"));
        let pruned = t.prune_unused("var v = UIView_constructorX();\nvar l = (UILabel_constructor());");
        assert_eq!(pruned, vec!["UIView_constructor".to_string()]);
        assert!(t.contains("UILabel_constructor"));

        assert!(references("_$a(v)", "_$a"));
        assert!(!references("_$ab(v)", "_$a"));
        assert!(!references("$_$a(v)", "_$a"));
    }
}
