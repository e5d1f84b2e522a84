//! Naming Module for generated bridge code
//!
//! Bridge function names are derived from class and member names only, never
//! from the file they were found in, so the same member always maps to the
//! same native symbol across files.

use regex::Regex;

lazy_static::lazy_static! {
    static ref ANGLE_RE: Regex = Regex::new(r"[<>]").unwrap();
    static ref GENERIC_ARITY_RE: Regex = Regex::new(r"`\d").unwrap();
    static ref PUNCT_RE: Regex = Regex::new(r"[`()\[\],.]").unwrap();
    static ref JS_EXT_RE: Regex = Regex::new(r"\.js(on)?$").unwrap();
    static ref FILE_CHARS_RE: Regex = Regex::new(r"[\s\-/\\]").unwrap();
}

pub const GENERATED_HEADER: &str = "/**\n * DO NOT EDIT - this is a generated file\n * Generated by the Hyperloop native compiler.\n */\n";

/// Turns an arbitrary native spelling into a valid C identifier fragment.
pub fn sanitize_symbol_name(name: &str) -> String {
    let s = name.replacen("[]", "Array", 1);
    let s = ANGLE_RE.replace_all(&s, "$$");
    let s = GENERIC_ARITY_RE.replace(&s, "");
    let s: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    let s = s.replace(':', "_");
    let s = PUNCT_RE.replace_all(&s, "_");
    s.chars()
        .filter(|c| !matches!(c, '^' | '*' | '\''))
        .collect()
}

pub fn constructor_name(class_name: &str) -> String {
    format!("{}_constructor", sanitize_symbol_name(class_name))
}

pub fn method_name(class_name: &str, method: &str) -> String {
    format!("{}_{}", sanitize_symbol_name(class_name), method)
}

pub fn function_name(name: &str) -> String {
    format!("{}_function", sanitize_symbol_name(name))
}

pub fn getter_name(class_name: &str, property: &str) -> String {
    format!("{}_Get_{}", sanitize_symbol_name(class_name), property)
}

pub fn setter_name(class_name: &str, property: &str) -> String {
    format!("{}_Set_{}", sanitize_symbol_name(class_name), property)
}

/// Script methods every wrapper answers without a metabase entry.
pub fn is_builtin_function(name: &str) -> bool {
    name == "toString"
}

/// Loader identifier for a source file path relative to the source root.
pub fn js_filename(relative: &str) -> String {
    let s = FILE_CHARS_RE.replace_all(relative, "_");
    JS_EXT_RE.replace(&s, "").to_string()
}

pub fn multiline_comment(text: &str) -> String {
    let mut out = vec!["/**".to_string()];
    for line in text.split('\n') {
        out.push(format!(" * {}", line));
    }
    out.push(" */".to_string());
    out.join("\n")
}

/// Escapes text for use inside a C string literal.
pub fn c_string(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}

/// Temporary identifier source (`var0`, `var1`, ...). One instance per
/// generated file keeps output deterministic.
#[derive(Debug, Clone, Default)]
pub struct VarNames {
    next: usize,
}

impl VarNames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn make(&mut self) -> String {
        let name = format!("var{}", self.next);
        self.next += 1;
        name
    }

    pub fn reset(&mut self) {
        self.next = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_symbol_name() {
        assert_eq!(sanitize_symbol_name("struct CGPoint *"), "structCGPoint");
        assert_eq!(sanitize_symbol_name("Foo[]"), "FooArray");
        assert_eq!(sanitize_symbol_name("List<int>"), "List$int$");
        assert_eq!(sanitize_symbol_name("ns::Type"), "ns__Type");
        assert_eq!(sanitize_symbol_name("void (^)(int)"), "void___int_");
    }

    #[test]
    fn test_bridge_names() {
        assert_eq!(constructor_name("UIView"), "UIView_constructor");
        assert_eq!(method_name("UIView", "addSubview"), "UIView_addSubview");
        assert_eq!(function_name("CGPointMake"), "CGPointMake_function");
        assert_eq!(getter_name("UIView", "frame"), "UIView_Get_frame");
        assert_eq!(setter_name("UIView", "frame"), "UIView_Set_frame");
    }

    #[test]
    fn test_js_filename() {
        assert_eq!(js_filename("app.js"), "app");
        assert_eq!(js_filename("lib/my-module.js"), "lib_my_module");
        assert_eq!(js_filename("data/config.json"), "data_config");
    }

    #[test]
    fn test_var_names_reset() {
        let mut names = VarNames::new();
        assert_eq!(names.make(), "var0");
        assert_eq!(names.make(), "var1");
        names.reset();
        assert_eq!(names.make(), "var0");
    }

    #[test]
    fn test_c_string() {
        assert_eq!(c_string("a\"b\\c\n"), "a\\\"b\\\\c\\n");
    }

    #[test]
    fn test_multiline_comment() {
        assert_eq!(multiline_comment("a\nb"), "/**\n * a\n * b\n */");
    }
}
