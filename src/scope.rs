//! Script Scope Module
//!
//! Names a script can use without a native lookup: runtime and language
//! globals, plus every name the file declares anywhere in its body.

use oxc_ast::ast::Program;
use oxc_ast_visit::Visit;
use oxc_syntax::scope::ScopeFlags;
use std::collections::HashSet;

lazy_static::lazy_static! {
    /// Identifiers a script may use without declaring them.
    pub static ref SCRIPT_GLOBALS: HashSet<&'static str> = {
        let mut s = HashSet::new();
        // Runtime entry points
        s.insert("Hyperloop");
        s.insert("require");
        s.insert("module");
        s.insert("exports");
        s.insert("__filename");
        s.insert("__dirname");
        s.insert("global");

        // Standard JS Globals
        s.insert("Math");
        s.insert("console");
        s.insert("JSON");
        s.insert("Date");
        s.insert("RegExp");
        s.insert("String");
        s.insert("Number");
        s.insert("Boolean");
        s.insert("Array");
        s.insert("Object");
        s.insert("Function");
        s.insert("Symbol");
        s.insert("Promise");
        s.insert("Map");
        s.insert("Set");
        s.insert("Error");
        s.insert("TypeError");
        s.insert("RangeError");
        s.insert("undefined");
        s.insert("NaN");
        s.insert("Infinity");
        s.insert("parseInt");
        s.insert("parseFloat");
        s.insert("isNaN");
        s.insert("isFinite");
        s.insert("encodeURIComponent");
        s.insert("decodeURIComponent");
        s.insert("setTimeout");
        s.insert("clearTimeout");
        s.insert("setInterval");
        s.insert("clearInterval");
        s.insert("arguments");

        // Test harness globals
        s.insert("mocha");
        s.insert("describe");
        s.insert("it");
        s
    };
}

/// Objects whose members are never native classes.
pub fn is_builtin_object(name: &str) -> bool {
    matches!(
        name,
        "console" | "JSON" | "Math" | "String" | "Date" | "RegExp" | "Array" | "Object" | "Error"
            | "require" | "mocha" | "it" | "describe"
    )
}

pub fn is_global(name: &str) -> bool {
    SCRIPT_GLOBALS.contains(name)
}

/// Every name bound anywhere in a file: variables, functions, classes,
/// parameters and catch bindings.
pub struct BindingCollector<'s> {
    pub symbols: &'s mut HashSet<String>,
}

impl<'s, 'b> Visit<'b> for BindingCollector<'s> {
    fn visit_binding_identifier(&mut self, ident: &oxc_ast::ast::BindingIdentifier<'b>) {
        self.symbols.insert(ident.name.to_string());
    }

    fn visit_function(&mut self, func: &oxc_ast::ast::Function<'b>, flags: ScopeFlags) {
        if let Some(id) = &func.id {
            self.symbols.insert(id.name.to_string());
        }
        oxc_ast_visit::walk::walk_function(self, func, flags);
    }

    fn visit_class(&mut self, class: &oxc_ast::ast::Class<'b>) {
        if let Some(id) = &class.id {
            self.symbols.insert(id.name.to_string());
        }
        oxc_ast_visit::walk::walk_class(self, class);
    }
}

pub fn declared_names(program: &Program) -> HashSet<String> {
    let mut symbols = HashSet::new();
    let mut collector = BindingCollector {
        symbols: &mut symbols,
    };
    collector.visit_program(program);
    symbols
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxc_allocator::Allocator;
    use oxc_parser::Parser;
    use oxc_span::SourceType;

    #[test]
    fn test_declared_names() {
        let allocator = Allocator::default();
        let code = "var a = 1; function f(b) { let c; } class D {} try {} catch (e) {}";
        let ret = Parser::new(&allocator, code, SourceType::default().with_module(true)).parse();
        let names = declared_names(&ret.program);
        for n in ["a", "f", "b", "c", "D", "e"] {
            assert!(names.contains(n), "missing {}", n);
        }
    }

    #[test]
    fn test_globals() {
        assert!(is_global("console"));
        assert!(is_global("Hyperloop"));
        assert!(!is_global("UIView"));
        assert!(is_builtin_object("JSON"));
        assert!(!is_builtin_object("Hyperloop"));
    }
}
