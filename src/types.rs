//! Type Resolution Module for native type spellings
//!
//! Classifies a raw native spelling against the metabase into a
//! `TypeDescriptor` and derives the code that marshals values of that type
//! across the script engine boundary in both directions.

use crate::error::{
    CompileResult, CompilerError, ERR_ALIAS_CHAIN, ERR_NO_METABASE, ERR_UNKNOWN_TYPE,
};
use crate::metabase::{Metabase, TypeDef};
use crate::naming::{multiline_comment, sanitize_symbol_name};
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Longest typedef chain followed before resolution fails.
pub const MAX_ALIAS_DEPTH: usize = 32;

lazy_static::lazy_static! {
    static ref PRIMITIVE_RE: Regex = Regex::new(
        r"^(const)?\s*?(un)?(signed)?\s*(float|int|short|double|long)\s*(long|double)?\s*(\d{0,2})?\s*(\*{0,2})$"
    ).unwrap();
    static ref ENUM_RE: Regex = Regex::new(r"^enum\s*").unwrap();
    static ref STRUCT_RE: Regex = Regex::new(r"^(const)?\s*struct\s*(.*?)(\*)?$").unwrap();
    static ref CHAR_ARRAY_RE: Regex = Regex::new(r"^(const)?\s*(un)?(signed)?\s*char\s*\[(\d+)?\]$").unwrap();
    static ref FUNCTION_POINTER_RE: Regex = Regex::new(r"^(.*)?\s*\(\*\)\((.*)\)$").unwrap();
    static ref BLOCK_RE: Regex = Regex::new(r"^(.*)?\s*\(\^\)\((.*)\)$").unwrap();
    static ref UNION_RE: Regex = Regex::new(r"^union\s*(.*)$").unwrap();
    static ref CONST_POINTER_RE: Regex = Regex::new(r"^const\s+(.*)\*$").unwrap();
    static ref POINTER_RE: Regex = Regex::new(r"(\w+)\s(\*+)$").unwrap();
    static ref ARRAY_RE: Regex = Regex::new(r"(.*)\s\[(\d*)\]").unwrap();
    static ref KEYWORD_PREFIX_RE: Regex = Regex::new(r"^(enum|struct|union)\s*").unwrap();
}

// ═══════════════════════════════════════════════════════════════════════════════
// DESCRIPTOR
// ═══════════════════════════════════════════════════════════════════════════════

/// How a value appears on the script side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptKind {
    Number,
    String,
    Object,
    Boolean,
    Undefined,
    Null,
}

#[derive(Debug, Clone)]
pub struct Signature {
    pub return_type: Arc<TypeDescriptor>,
    pub args: Vec<Arc<TypeDescriptor>>,
}

/// A struct or union member. `ty` is `None` for a member that refers back
/// to a type still being resolved.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub raw: String,
    pub ty: Option<Arc<TypeDescriptor>>,
}

/// How a value is held on the native side.
#[derive(Debug, Clone)]
pub enum NativeKind {
    Primitive,
    Boolean,
    String,
    Null,
    Void,
    Pointer,
    Object,
    Struct(Vec<Field>),
    Union(Vec<Field>),
    FunctionPointer(Signature),
    Block(Signature),
}

impl NativeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NativeKind::Primitive => "primitive",
            NativeKind::Boolean => "boolean",
            NativeKind::String => "string",
            NativeKind::Null => "null",
            NativeKind::Void => "void",
            NativeKind::Pointer => "pointer",
            NativeKind::Object => "object",
            NativeKind::Struct(_) => "struct",
            NativeKind::Union(_) => "union",
            NativeKind::FunctionPointer(_) => "function-pointer",
            NativeKind::Block(_) => "block",
        }
    }
}

/// Side-effect lists produced while marshalling one value. Callers splice
/// `preamble` before the returned expression and `cleanup` after it, once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Marshal {
    pub preamble: Vec<String>,
    pub cleanup: Vec<String>,
    pub declarations: Vec<String>,
}

impl Marshal {
    pub fn declare(&mut self, line: String) {
        if !self.declarations.contains(&line) {
            self.declarations.push(line);
        }
    }
}

#[derive(Debug, Clone)]
pub struct TypeDescriptor {
    /// Spelling this descriptor was resolved from.
    pub raw: String,
    /// Canonical native spelling.
    pub value: String,
    pub name: String,
    pub native: NativeKind,
    pub is_const: bool,
    /// Number of pointer stars.
    pub pointer: usize,
    /// Struct or union spelled by value, boxed behind a pointer internally.
    pub was_not_pointer: bool,
    /// Character count for char strings; `Some(0)` is unbounded.
    pub length: Option<usize>,
    pub is_void: bool,
    pub base_name: Option<String>,
    pub framework: Option<String>,
    pub import: Option<String>,
    pub vector: Option<serde_json::Value>,
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

fn strip_keyword(name: &str, keyword: &str) -> String {
    let re_stripped = name
        .strip_prefix(keyword)
        .map(|rest| rest.trim_start())
        .unwrap_or(name);
    re_stripped
        .replace('*', "")
        .replacen("const ", "", 1)
        .trim()
        .to_string()
}

fn safe_var(var: &str) -> String {
    var.replace(['[', ']'], "_")
}

impl TypeDescriptor {
    fn unclassified(raw: &str) -> Self {
        TypeDescriptor {
            raw: raw.to_string(),
            value: raw.to_string(),
            name: raw.to_string(),
            native: NativeKind::Pointer,
            is_const: false,
            pointer: 0,
            was_not_pointer: false,
            length: None,
            is_void: false,
            base_name: None,
            framework: None,
            import: None,
            vector: None,
        }
    }

    pub fn script_kind(&self) -> ScriptKind {
        match self.native {
            NativeKind::Primitive => ScriptKind::Number,
            NativeKind::Boolean => ScriptKind::Boolean,
            NativeKind::String => ScriptKind::String,
            NativeKind::Null => ScriptKind::Null,
            NativeKind::Void => ScriptKind::Undefined,
            _ => ScriptKind::Object,
        }
    }

    pub fn is_pointer(&self) -> bool {
        self.pointer > 0
    }

    pub fn is_pointer_to_pointer(&self) -> bool {
        self.pointer == 2
    }

    pub fn is_void_pointer(&self) -> bool {
        matches!(self.native, NativeKind::Pointer) && self.is_void
    }

    /// Object, struct or union: values that get a wrapper class.
    pub fn is_class_like(&self) -> bool {
        matches!(
            self.native,
            NativeKind::Object | NativeKind::Struct(_) | NativeKind::Union(_)
        )
    }

    pub fn fields(&self) -> &[Field] {
        match &self.native {
            NativeKind::Struct(fields) | NativeKind::Union(fields) => fields,
            _ => &[],
        }
    }

    pub fn signature(&self) -> Option<&Signature> {
        match &self.native {
            NativeKind::FunctionPointer(sig) | NativeKind::Block(sig) => Some(sig),
            _ => None,
        }
    }

    pub fn char_length(&self) -> usize {
        self.length.unwrap_or(0)
    }

    // ───────────────────────────────────────────────────────────────────────
    // Classification steps
    // ───────────────────────────────────────────────────────────────────────

    fn apply_builtin(&mut self, spelling: &str) -> bool {
        match spelling {
            "null" => self.native = NativeKind::Null,
            "undefined" | "void" => {
                self.native = NativeKind::Void;
                self.is_void = true;
            }
            "void *" => {
                self.native = NativeKind::Pointer;
                self.pointer = self.pointer.max(1);
                self.is_void = true;
            }
            "const void *" => {
                self.native = NativeKind::Pointer;
                self.pointer = self.pointer.max(1);
                self.is_const = true;
                self.is_void = true;
            }
            // unsigned char carries numbers, not text
            "const char" | "unsigned char" => self.native = NativeKind::Primitive,
            "char" => {
                self.native = NativeKind::String;
                self.length = Some(1);
            }
            "bool" | "signed char" => self.native = NativeKind::Boolean,
            "char *" => {
                self.native = NativeKind::String;
                self.pointer = self.pointer.max(1);
            }
            "const char *" => {
                self.native = NativeKind::String;
                self.pointer = self.pointer.max(1);
                self.is_const = true;
            }
            _ => return false,
        }
        true
    }

    /// One typedef substitution; returns the spelling to continue with.
    fn apply_typedef(&mut self, key: &str, def: &TypeDef) -> String {
        let next = match def.alias.as_deref() {
            Some(alias) if alias != key => {
                self.name = alias.to_string();
                alias.to_string()
            }
            _ => {
                let next = def
                    .subtype
                    .clone()
                    .or_else(|| def.ty.clone())
                    .unwrap_or_else(|| key.to_string());
                let mut value = def
                    .alias
                    .clone()
                    .or_else(|| def.subtype.clone())
                    .or_else(|| def.ty.clone())
                    .or_else(|| def.name.clone())
                    .unwrap_or_else(|| key.to_string());
                if value == "definition" {
                    value = key.to_string();
                }
                self.name = value.clone();
                self.value = if self.pointer > 0 {
                    format!("{} {}", value, "*".repeat(self.pointer))
                } else {
                    value
                };
                next
            }
        };
        if let Some(framework) = &def.framework {
            self.framework = Some(framework.clone());
        }
        next
    }

    // ───────────────────────────────────────────────────────────────────────
    // Naming
    // ───────────────────────────────────────────────────────────────────────

    /// Spelling used in native casts and declarations.
    pub fn to_cast(&self) -> String {
        if matches!(self.native, NativeKind::FunctionPointer(_)) {
            return format!("{}Type", self.safe_class_name());
        }
        let cast = self.value.strip_prefix("const ").unwrap_or(&self.value);
        let cast = cast.strip_prefix("union ").unwrap_or(cast);
        cast.trim().to_string()
    }

    pub fn to_name(&self) -> String {
        if matches!(self.native, NativeKind::FunctionPointer(_)) {
            return format!("{}_FunctionCallback", sanitize_symbol_name(&self.name));
        }
        self.name.clone()
    }

    pub fn safe_name(name: &str) -> String {
        name.replacen("struct ", "", 1)
            .replacen("union ", "", 1)
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '*')
            .collect()
    }

    pub fn safe_class_name(&self) -> String {
        sanitize_symbol_name(&Self::safe_name(&self.to_name()))
    }

    pub fn to_script_value_name(&self) -> String {
        format!("{}_ToJSValue", self.safe_class_name())
    }

    pub fn to_native_name(&self) -> String {
        format!("JSValueTo_{}", self.safe_class_name())
    }

    /// Key used to emit one marshalling pair per type regardless of how the
    /// type was spelled (`enum Foo` and `Foo` share a key).
    pub fn as_key(&self) -> String {
        KEYWORD_PREFIX_RE.replace(&self.value, "").to_string()
    }

    /// Name a wrapper class is registered under.
    pub fn class_key(&self) -> String {
        let name = self.name.trim();
        let name = name.strip_prefix("const ").unwrap_or(name);
        let name = KEYWORD_PREFIX_RE.replace(name, "");
        name.replace('*', "").trim().to_string()
    }

    /// Spelling usable inside `sizeof(...)` and `new ...`.
    pub fn to_class_name(&self) -> String {
        self.name.trim_end_matches(['*', ' ']).to_string()
    }

    // ───────────────────────────────────────────────────────────────────────
    // Marshalling
    // ───────────────────────────────────────────────────────────────────────

    /// Native expression `var` converted to a `JSValueRef` expression.
    pub fn to_script_value(&self, var: &str, m: &mut Marshal) -> String {
        match &self.native {
            NativeKind::Primitive => {
                if self.is_pointer() {
                    let var = if self.is_const {
                        format!("const_cast<{}>({})", self.to_cast(), var)
                    } else {
                        var.to_string()
                    };
                    format!(
                        "HyperloopVoidPointerToJSValue(ctx,static_cast<void *>({}),exception)",
                        var
                    )
                } else {
                    format!("JSValueMakeNumber(ctx,static_cast<double>({}))", var)
                }
            }
            NativeKind::Boolean => format!("JSValueMakeBoolean(ctx,{})", var),
            NativeKind::String => {
                if self.length == Some(1) {
                    format!("HyperloopMakeString(ctx,&{},exception)", var)
                } else {
                    format!("HyperloopMakeString(ctx,{},exception)", var)
                }
            }
            NativeKind::Void => "JSValueMakeUndefined(ctx)".to_string(),
            NativeKind::Null => "JSValueMakeNull(ctx)".to_string(),
            NativeKind::FunctionPointer(_) | NativeKind::Block(_) | NativeKind::Pointer => {
                if self.is_const {
                    format!(
                        "HyperloopVoidPointerToJSValue(ctx,const_cast<void *>({}),exception)",
                        var
                    )
                } else {
                    let cast = if matches!(self.native, NativeKind::FunctionPointer(_)) {
                        "reinterpret_cast"
                    } else {
                        "static_cast"
                    };
                    format!(
                        "HyperloopVoidPointerToJSValue(ctx,{}<void *>({}),exception)",
                        cast, var
                    )
                }
            }
            NativeKind::Struct(_) | NativeKind::Union(_) | NativeKind::Object => {
                let mut var = var.to_string();
                if self.was_not_pointer {
                    let cast = self.to_cast();
                    let class_name = self.to_class_name();
                    let copy = format!("{}$", safe_var(&var));
                    m.preamble.push(format!(
                        "{} {} = ({})malloc(sizeof({}));",
                        cast, copy, cast, class_name
                    ));
                    m.preamble
                        .push(format!("memcpy({},&{},sizeof({}));", copy, var, class_name));
                    var = copy;
                }
                m.declare(format!(
                    "JSValueRef {}(JSContextRef,{},JSValueRef *);",
                    self.to_script_value_name(),
                    self.to_cast()
                ));
                format!("{}(ctx,{},exception)", self.to_script_value_name(), var)
            }
        }
    }

    /// Script value `var` converted to a native expression of this type.
    pub fn to_native_value(&self, var: &str, m: &mut Marshal) -> String {
        match &self.native {
            NativeKind::Primitive => {
                if self.is_pointer() {
                    format!(
                        "static_cast<{}>(HyperloopJSValueToVoidPointer(ctx,{},exception))",
                        self.to_cast(),
                        var
                    )
                } else {
                    format!(
                        "static_cast<{}>(JSValueToNumber(ctx,{},exception))",
                        self.to_cast(),
                        var
                    )
                }
            }
            NativeKind::Boolean => format!("JSValueToBoolean(ctx,{})", var),
            NativeKind::String => {
                let sub = safe_var(var);
                m.preamble.push(format!(
                    "auto {}buf = HyperloopJSValueToStringCopy(ctx,{},exception);",
                    sub, var
                ));
                m.cleanup.push(format!("delete [] {}buf;", sub));
                if self.length == Some(1) {
                    format!("{}buf[0]", sub)
                } else {
                    format!("{}buf", sub)
                }
            }
            NativeKind::Void | NativeKind::Null | NativeKind::Block(_) => "nullptr".to_string(),
            NativeKind::Struct(_) | NativeKind::Union(_) | NativeKind::Pointer => {
                self.from_native_pointer(var, m)
            }
            NativeKind::Object => {
                m.declare(format!(
                    "EXPORTAPI {} {}(JSContextRef,JSValueRef,JSValueRef *);",
                    self.to_cast(),
                    self.to_native_name()
                ));
                format!("{}(ctx,{},exception)", self.to_native_name(), var)
            }
            NativeKind::FunctionPointer(sig) => {
                let args: Vec<String> = sig.args.iter().map(|a| a.to_cast()).collect();
                m.declare(format!(
                    "EXPORTAPI {} {}({});",
                    sig.return_type.to_cast(),
                    self.to_name(),
                    args.join(",")
                ));
                self.to_name()
            }
        }
    }

    /// Unwraps a pointer held in a script value: a number is taken as an
    /// address, an object as a wrapped native handle, `null` as nullptr.
    fn from_native_pointer(&self, var: &str, m: &mut Marshal) -> String {
        let sub = safe_var(var);
        let cast = self.to_cast();
        let p = &mut m.preamble;
        p.push(format!("auto is_{}null = JSValueIsNull(ctx,{});", sub, var));
        if matches!(self.native, NativeKind::Struct(_) | NativeKind::Union(_)) {
            p.push(format!("if (is_{}null)", sub));
            p.push("{".to_string());
            p.push(format!(
                "\t*exception = HyperloopMakeException(ctx,\"null is not allowed for {}\");",
                var
            ));
            p.push("\treturn JSValueMakeUndefined(ctx);".to_string());
            p.push("}".to_string());
        }
        p.push(format!("{} {}ptr = nullptr;", cast, sub));
        p.push(format!(
            "if (!is_{}null && JSValueIsNumber(ctx,{}))",
            sub, var
        ));
        p.push("{".to_string());
        p.push(format!(
            "\tauto {}num = JSValueToNumber(ctx,{},exception);",
            sub, var
        ));
        p.push(format!(
            "\t{}ptr = reinterpret_cast<{}>(static_cast<size_t>({}num));",
            sub, cast, sub
        ));
        p.push("}".to_string());
        p.push(format!("else if (!is_{}null)", sub));
        p.push("{".to_string());
        p.push(format!(
            "\tauto {}buf = static_cast<Hyperloop::AbstractObject*>(JSObjectGetPrivate(JSValueToObject(ctx,{},exception)));",
            sub, var
        ));
        p.push(format!(
            "\tauto {}buf2 = static_cast<Hyperloop::NativeObject<{}> *>({}buf);",
            sub, cast, sub
        ));
        p.push(format!("\t{}ptr = {}buf2->getObject();", sub, sub));
        p.push("}".to_string());
        if self.was_not_pointer {
            format!("*{}ptr", sub)
        } else {
            format!("is_{}null ? nullptr : {}ptr", sub, sub)
        }
    }

    /// Call into this type's generated `_ToJSValue` converter.
    pub fn to_script_call(&self, var: &str) -> String {
        match self.native {
            NativeKind::Void => "JSValueMakeUndefined(ctx)".to_string(),
            NativeKind::Null => "JSValueMakeNull(ctx)".to_string(),
            _ => format!("{}(ctx,{},exception)", self.to_script_value_name(), var),
        }
    }

    pub fn to_null_check(&self, var: &str, indent: &str, code: &mut Vec<String>) {
        code.push(format!("{}if ({} == nullptr)", indent, var));
        code.push(format!("{}{{", indent));
        code.push(format!("{}\treturn JSValueMakeNull(ctx);", indent));
        code.push(format!("{}}}", indent));
    }

    /// Opaque wrapper declarations for pointer-like types without a class.
    pub fn to_declaration(&self) -> String {
        let the_name = self.safe_class_name();
        let cast = self.to_cast();
        let mut code = Vec::new();
        if matches!(self.native, NativeKind::FunctionPointer(_)) {
            code.push(format!(
                "typedef {};",
                self.name.replacen("(*)", &format!("(*{})", cast), 1)
            ));
        }
        code.push(format!(
            "typedef Hyperloop::NativeObject<{}> * Native{};",
            cast, the_name
        ));
        code.push(String::new());
        code.push(format!("static void Finalize{}(JSObjectRef object)", the_name));
        code.push("{".to_string());
        code.push("\tauto p = JSObjectGetPrivate(object);".to_string());
        code.push(format!(
            "\tauto po = static_cast<Native{}>(static_cast<Hyperloop::AbstractObject *>(p));",
            the_name
        ));
        code.push("\tdelete po;".to_string());
        code.push("}".to_string());
        code.push(String::new());
        code.push(format!("static JSClassRef Register{}()", the_name));
        code.push("{".to_string());
        code.push("\tstatic JSClassDefinition def = kJSClassDefinitionEmpty;".to_string());
        code.push("\tstatic JSClassRef ref = nullptr;".to_string());
        code.push("\tif (ref==nullptr)".to_string());
        code.push("\t{".to_string());
        code.push(format!("\t\tdef.finalize = Finalize{};", the_name));
        code.push(format!("\t\tdef.className = \"{}\";", the_name));
        code.push("\t\tref = JSClassCreate(&def);".to_string());
        code.push("\t}".to_string());
        code.push("\treturn ref;".to_string());
        code.push("}".to_string());
        code.push(String::new());
        code.join("\n")
    }

    /// Native trampoline with this function pointer's signature that calls
    /// back into a script function. The script function handle travels in the
    /// trailing `void *` parameter; signatures without one get a stub.
    pub fn to_function_callback(&self) -> Option<String> {
        let NativeKind::FunctionPointer(sig) = &self.native else {
            return None;
        };
        let base = sanitize_symbol_name(&self.name);
        let name = self.to_name();
        let argc = sig.args.len();
        let mut externs: Vec<String> = Vec::new();
        let mut params = Vec::new();
        let mut conversions = Vec::new();
        let mut values = Vec::new();

        for (index, arg) in sig.args.iter().enumerate() {
            params.push(format!("{} arg{}", arg, index));
            if index + 1 < argc {
                conversions.push(format!(
                    "\tauto argValue{} = {};",
                    index,
                    arg.to_script_call(&format!("arg{}", index))
                ));
                values.push(format!("argValue{}", index));
            }
            if !arg.is_void {
                let extern_decl = format!(
                    "EXPORTAPI JSValueRef {}(JSContextRef, {}, JSValueRef*);",
                    arg.to_script_value_name(),
                    arg.to_cast()
                );
                if !externs.contains(&extern_decl) {
                    externs.push(extern_decl);
                }
            }
        }

        let ret = &sig.return_type;
        if !ret.is_void {
            let extern_decl = format!(
                "EXPORTAPI {} {}(JSContextRef, JSValueRef, JSValueRef*);",
                ret.to_cast(),
                ret.to_native_name()
            );
            if !externs.contains(&extern_decl) {
                externs.push(extern_decl);
            }
        }

        let mut body = Vec::new();
        body.push(format!("{} {}({})", ret, name, params.join(", ")));
        body.push("{".to_string());
        match sig.args.last() {
            Some(context_arg) if context_arg.is_void_pointer() => {
                body.push("\tauto ctx = HyperloopGlobalContext();".to_string());
                body.push("\tJSValueRef *exception = nullptr;".to_string());
                body.extend(conversions);
                body.push(format!("\tauto argumentCount = {};", argc - 1));
                if values.is_empty() {
                    body.push("\tJSValueRef *arguments = nullptr;".to_string());
                } else {
                    body.push(format!(
                        "\tJSValueRef arguments[] = {{ {} }};",
                        values.join(", ")
                    ));
                }
                let invoke = format!(
                    "HyperloopInvokeFunctionCallback(arg{},argumentCount,arguments,exception);",
                    argc - 1
                );
                if ret.is_void {
                    body.push(format!("\t{}", invoke));
                } else {
                    body.push(format!("\tauto fnCallbackResult = {}", invoke));
                    let mut m = Marshal::default();
                    let gen = ret.to_native_value("fnCallbackResult", &mut m);
                    for line in &m.preamble {
                        body.push(format!("\t{}", line));
                    }
                    body.push(format!("\tauto returnResult = {};", gen));
                    for line in &m.cleanup {
                        body.push(format!("\t{}", line));
                    }
                    body.push("\treturn returnResult;".to_string());
                    for decl in m.declarations {
                        if !externs.contains(&decl) {
                            externs.push(decl);
                        }
                    }
                }
            }
            _ => body.push(
                "\t// never invoked: the last parameter is not a void * callback handle".to_string(),
            ),
        }
        body.push("}".to_string());
        body.push(String::new());
        body.push(multiline_comment(
            "called to allow the construction of a native function callback",
        ));
        body.push(format!(
            "JSValueRef {}_constructor(JSContextRef ctx, JSObjectRef function, JSObjectRef thisObject, size_t argumentCount, const JSValueRef arguments[], JSValueRef* exception)",
            base
        ));
        body.push("{".to_string());
        body.push("\tif (argumentCount==0 || !JSValueIsObject(ctx,arguments[0]) || !JSObjectIsFunction(ctx,JSValueToObject(ctx,arguments[0],exception)))".to_string());
        body.push("\t{".to_string());
        body.push(
            "\t\t*exception = HyperloopMakeException(ctx,\"first argument must be a function callback\");"
                .to_string(),
        );
        body.push("\t\treturn JSValueMakeUndefined(ctx);".to_string());
        body.push("\t}".to_string());
        body.push("\treturn arguments[0];".to_string());
        body.push("}".to_string());

        let mut out = externs;
        out.push(String::new());
        out.extend(body);
        Some(out.join("\n"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RESOLVER
// ═══════════════════════════════════════════════════════════════════════════════

enum Chase<'m> {
    NotFound,
    Builtin,
    Found { def: &'m TypeDef, next: String },
}

/// Follows typedefs starting at `start`, bounded by `MAX_ALIAS_DEPTH`.
/// A two-step cycle stops where the original single substitution would
/// have stopped; longer cycles fail.
fn chase<'m>(
    metabase: &'m Metabase,
    start: &str,
    d: &mut TypeDescriptor,
) -> CompileResult<Chase<'m>> {
    let Some(mut def) = metabase.types.get(start) else {
        return Ok(Chase::NotFound);
    };
    let mut key = start.to_string();
    let mut visited = vec![key.clone()];

    loop {
        let next = d.apply_typedef(&key, def);
        if d.apply_builtin(&next) {
            if d.pointer > 0 {
                d.length = Some(0);
                if !matches!(d.native, NativeKind::String) {
                    d.native = NativeKind::Pointer;
                }
            }
            return Ok(Chase::Builtin);
        }
        let Some(next_def) = metabase.types.get(&next) else {
            return Ok(Chase::Found { def, next });
        };
        if next == key {
            return Ok(Chase::Found { def, next });
        }
        if let Some(pos) = visited.iter().position(|k| *k == next) {
            if pos + 2 == visited.len() {
                return Ok(Chase::Found { def, next });
            }
            return Err(CompilerError::bare(
                ERR_ALIAS_CHAIN,
                &format!(
                    "cyclic typedef chain: {} -> {}",
                    visited.join(" -> "),
                    next
                ),
            ));
        }
        if visited.len() >= MAX_ALIAS_DEPTH {
            return Err(CompilerError::bare(
                ERR_ALIAS_CHAIN,
                &format!(
                    "typedef chain for '{}' exceeds {} steps",
                    start, MAX_ALIAS_DEPTH
                ),
            ));
        }
        visited.push(next.clone());
        key = next;
        def = next_def;
    }
}

/// Per-architecture type cache. Constructing a new resolver (or calling
/// `reset`) is the only way to switch metabases.
#[derive(Debug, Default)]
pub struct TypeResolver {
    metabase: Option<Arc<Metabase>>,
    cache: HashMap<String, Arc<TypeDescriptor>>,
    base_types: Vec<String>,
    classes: BTreeMap<String, Arc<TypeDescriptor>>,
    custom_classes: HashSet<String>,
    in_progress: HashSet<String>,
}

impl TypeResolver {
    pub fn new(metabase: Arc<Metabase>) -> Self {
        Self {
            metabase: Some(metabase),
            ..Self::default()
        }
    }

    pub fn reset(&mut self, metabase: Option<Arc<Metabase>>) {
        log::debug!("[Hyperloop] type cache reset");
        *self = Self {
            metabase,
            ..Self::default()
        };
    }

    pub fn metabase(&self) -> Option<&Arc<Metabase>> {
        self.metabase.as_ref()
    }

    /// Resolves `raw`, returning the cached descriptor on repeat calls.
    pub fn resolve(&mut self, raw: &str) -> CompileResult<Arc<TypeDescriptor>> {
        let Some(metabase) = self.metabase.clone() else {
            return Err(CompilerError::bare(
                ERR_NO_METABASE,
                "missing metabase: types resolve only inside an architecture session",
            ));
        };
        self.resolve_with(raw.trim(), &metabase)
    }

    fn resolve_with(&mut self, raw: &str, metabase: &Metabase) -> CompileResult<Arc<TypeDescriptor>> {
        if raw.is_empty() {
            return Err(CompilerError::bare(ERR_NO_METABASE, "empty type spelling"));
        }
        if let Some(hit) = self.cache.get(raw) {
            return Ok(Arc::clone(hit));
        }

        self.in_progress.insert(raw.to_string());
        let result = self.classify(raw, metabase);
        self.in_progress.remove(raw);
        let descriptor = Arc::new(result?);

        log::debug!(
            "[Hyperloop] resolved '{}' as {} ({})",
            raw,
            descriptor.native.label(),
            descriptor
        );
        self.cache.insert(raw.to_string(), Arc::clone(&descriptor));
        let base = descriptor.base_name.clone().unwrap_or_else(|| raw.to_string());
        if !self.base_types.contains(&base) {
            self.base_types.push(base);
        }
        if descriptor.is_class_like() {
            self.classes
                .entry(descriptor.class_key())
                .or_insert_with(|| Arc::clone(&descriptor));
        }
        Ok(descriptor)
    }

    fn classify(&mut self, raw: &str, metabase: &Metabase) -> CompileResult<TypeDescriptor> {
        let mut d = TypeDescriptor::unclassified(raw);
        if d.apply_builtin(raw) {
            return Ok(d);
        }

        let mut ty = raw.to_string();
        let mut typedef: Option<&TypeDef> = None;
        let mut def_const = false;
        let mut def_pointer = 0;

        if let Some(caps) = CONST_POINTER_RE.captures(raw) {
            let ptype = caps[1].trim().to_string();
            if !metabase.types.contains_key(raw) && metabase.types.contains_key(&ptype) {
                ty = format!("{} *", ptype);
                d.is_const = true;
                def_const = true;
                d.base_name = Some(ptype.clone());
                d.pointer = 1;
                def_pointer = 1;
                for attempt in [format!("{} *", ptype), ptype.clone()] {
                    match chase(metabase, &attempt, &mut d)? {
                        Chase::Builtin => return Ok(d),
                        Chase::Found { def, next } => {
                            d.name = format!("{} *", next);
                            ty = next;
                            typedef = Some(def);
                            break;
                        }
                        Chase::NotFound => {}
                    }
                }
                d.value = format!("const {} *", ptype);
            }
        }

        if typedef.is_none() {
            let chased = match POINTER_RE.captures(&ty) {
                Some(caps) => {
                    d.pointer = caps[2].len();
                    def_pointer = d.pointer;
                    let base = caps[1].to_string();
                    chase(metabase, &base, &mut d)?
                }
                None => {
                    let start = ty.clone();
                    chase(metabase, &start, &mut d)?
                }
            };
            match chased {
                Chase::Builtin => return Ok(d),
                Chase::Found { def, next } => {
                    ty = next;
                    typedef = Some(def);
                }
                Chase::NotFound => {}
            }
            if let Some(caps) = typedef
                .and_then(|t| t.ty.as_deref())
                .and_then(|t| POINTER_RE.captures(t))
            {
                d.pointer = caps[2].len();
                def_pointer = d.pointer;
            }
        }

        if let Some(def) = typedef {
            if let Some(import) = &def.import {
                d.import = Some(import.clone());
            } else if let Some(framework) = &def.framework {
                d.framework = Some(framework.clone());
            }
            if def.vector.is_some() {
                d.vector = def.vector.clone();
            }
        }
        let def_ty: Option<&str> = typedef.and_then(|t| t.ty.as_deref());
        let metatype: Option<&str> = typedef.and_then(|t| t.metatype.as_deref());

        let primitive = PRIMITIVE_RE
            .captures(&ty)
            .or_else(|| def_ty.and_then(|t| PRIMITIVE_RE.captures(t)));
        if let Some(caps) = primitive {
            d.is_const = caps.get(1).is_some() || def_const;
            d.pointer = caps
                .get(7)
                .map(|m| m.as_str().len())
                .filter(|n| *n > 0)
                .unwrap_or(def_pointer);
            d.native = NativeKind::Primitive;
            return Ok(d);
        }

        if ENUM_RE.is_match(&ty)
            || metatype == Some("enum")
            || def_ty.map_or(false, |t| ENUM_RE.is_match(t))
        {
            d.native = NativeKind::Primitive;
            d.name = strip_keyword(&d.name, "enum");
            return Ok(d);
        }

        if STRUCT_RE.is_match(&ty)
            || metatype == Some("struct")
            || def_ty.map_or(false, |t| STRUCT_RE.is_match(t))
            || STRUCT_RE.is_match(raw)
        {
            match STRUCT_RE.captures(&ty) {
                Some(caps) => {
                    d.is_const = caps.get(1).is_some() || def_const;
                    d.pointer = if caps.get(3).is_some() {
                        def_pointer.max(1)
                    } else {
                        def_pointer
                    };
                }
                None => d.pointer = def_pointer,
            }
            let fields = self.resolve_fields(typedef, metabase);
            d.native = NativeKind::Struct(fields);
            if !d.is_pointer() {
                d.value.push_str(" *");
                d.pointer = 1;
                d.was_not_pointer = true;
            }
            return Ok(d);
        }

        if def_ty.map_or(false, |t| UNION_RE.is_match(t)) || UNION_RE.is_match(&ty) {
            let fields = self.resolve_fields(typedef, metabase);
            d.native = NativeKind::Union(fields);
            if !d.is_pointer() {
                d.name = strip_keyword(&d.name, "union");
                d.value.push_str(" *");
                d.pointer = 1;
                d.was_not_pointer = true;
            }
            return Ok(d);
        }

        if let Some(caps) = CHAR_ARRAY_RE.captures(&ty) {
            d.native = NativeKind::String;
            d.is_const = caps.get(1).is_some() || def_const;
            d.length = Some(
                caps.get(4)
                    .and_then(|m| m.as_str().parse().ok())
                    .unwrap_or(0),
            );
            return Ok(d);
        }

        let function = FUNCTION_POINTER_RE
            .captures(&ty)
            .map(|caps| (caps, true))
            .or_else(|| BLOCK_RE.captures(&ty).map(|caps| (caps, false)));
        if let Some((caps, is_function_pointer)) = function {
            let ret = caps.get(1).map_or("", |m| m.as_str().trim());
            let ret = if ret.is_empty() { "void" } else { ret }.to_string();
            let arg_spellings: Vec<String> = caps
                .get(2)
                .map_or("", |m| m.as_str())
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(String::from)
                .collect();
            let return_type = self.resolve_with(&ret, metabase)?;
            let mut args = Vec::with_capacity(arg_spellings.len());
            for spelling in &arg_spellings {
                args.push(self.resolve_with(spelling, metabase)?);
            }
            let sig = Signature { return_type, args };
            d.native = if is_function_pointer {
                NativeKind::FunctionPointer(sig)
            } else {
                NativeKind::Block(sig)
            };
            return Ok(d);
        }

        if let Some(caps) = ARRAY_RE.captures(&ty) {
            d.native = NativeKind::Pointer;
            d.value = format!("{} *", &caps[1]);
            d.name = d.value.clone();
            d.pointer = 1;
            d.length = caps[2].parse().ok();
            return Ok(d);
        }

        let bare = ty.trim_end_matches(['*', ' ']);
        let is_const = bare.starts_with("const ");
        let bare = bare.strip_prefix("const ").unwrap_or(bare).trim();
        if metabase.classes.contains_key(bare) || self.custom_classes.contains(bare) {
            d.native = NativeKind::Object;
            d.name = bare.to_string();
            d.is_const = d.is_const || is_const;
            d.pointer = d.pointer.max(1);
            d.value = format!(
                "{}{} {}",
                if d.is_const { "const " } else { "" },
                bare,
                "*".repeat(d.pointer)
            );
            return Ok(d);
        }

        // pointers to anything else travel as opaque handles
        if typedef.is_some() || d.is_pointer() {
            d.native = NativeKind::Pointer;
            return Ok(d);
        }

        Err(CompilerError::bare(
            ERR_UNKNOWN_TYPE,
            &format!("couldn't resolve native type '{}'", raw),
        )
        .with_hint("declare the type in the metabase or reference it through a pointer"))
    }

    fn resolve_fields(&mut self, typedef: Option<&TypeDef>, metabase: &Metabase) -> Vec<Field> {
        let Some(def) = typedef else {
            return Vec::new();
        };
        let mut fields = Vec::with_capacity(def.fields.len());
        for field in &def.fields {
            let spelling = field.ty.trim();
            let ty = if self.in_progress.contains(spelling) {
                None
            } else {
                match self.resolve_with(spelling, metabase) {
                    Ok(ty) => Some(ty),
                    Err(err) => {
                        log::debug!(
                            "[Hyperloop] field '{}' left opaque: {}",
                            field.name,
                            err.message
                        );
                        None
                    }
                }
            };
            fields.push(Field {
                name: field.name.clone(),
                raw: field.ty.clone(),
                ty,
            });
        }
        fields
    }

    /// Makes a script-declared class resolvable like a metabase class.
    pub fn register_class(&mut self, name: &str) {
        if self.custom_classes.insert(name.to_string()) {
            log::debug!("[Hyperloop] registered custom class {}", name);
        }
    }

    /// Class-like types resolved so far, keyed by wrapper class name.
    pub fn classes(&self) -> Vec<String> {
        self.classes.keys().cloned().collect()
    }

    pub fn class_type(&mut self, class_name: &str) -> CompileResult<Arc<TypeDescriptor>> {
        if let Some(found) = self.classes.get(class_name) {
            return Ok(Arc::clone(found));
        }
        self.resolve(class_name)
    }

    /// Every distinct base spelling resolved so far, in resolution order.
    pub fn types(&self) -> Vec<String> {
        self.base_types.clone()
    }

    pub fn cached(&self, raw: &str) -> Option<Arc<TypeDescriptor>> {
        self.cache.get(raw.trim()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(json: &str) -> TypeResolver {
        TypeResolver::new(Arc::new(Metabase::from_json(json).unwrap()))
    }

    fn empty() -> TypeResolver {
        resolver("{}")
    }

    #[test]
    fn test_requires_metabase() {
        let mut r = TypeResolver::default();
        let err = r.resolve("int").unwrap_err();
        assert_eq!(err.code, ERR_NO_METABASE);
    }

    #[test]
    fn test_cached_instance_is_shared() {
        let mut r = empty();
        let a = r.resolve("int").unwrap();
        let b = r.resolve("int").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_builtins() {
        let mut r = empty();
        assert_eq!(r.resolve("void").unwrap().script_kind(), ScriptKind::Undefined);
        assert_eq!(r.resolve("null").unwrap().script_kind(), ScriptKind::Null);
        let vp = r.resolve("const void *").unwrap();
        assert!(vp.is_void_pointer());
        assert!(vp.is_const);
        assert_eq!(r.resolve("bool").unwrap().script_kind(), ScriptKind::Boolean);
        assert_eq!(
            r.resolve("unsigned char").unwrap().script_kind(),
            ScriptKind::Number
        );
        let c = r.resolve("char").unwrap();
        assert_eq!(c.length, Some(1));
        assert_eq!(c.to_script_value("v", &mut Marshal::default()), "HyperloopMakeString(ctx,&v,exception)");
    }

    #[test]
    fn test_primitive_marshalling_forms() {
        let mut r = empty();
        let mut m = Marshal::default();
        let t = r.resolve("unsigned int").unwrap();
        assert_eq!(
            t.to_native_value("v", &mut m),
            "static_cast<unsigned int>(JSValueToNumber(ctx,v,exception))"
        );
        assert_eq!(
            t.to_script_value("v", &mut m),
            "JSValueMakeNumber(ctx,static_cast<double>(v))"
        );

        let p = r.resolve("const int *").unwrap();
        assert!(p.is_const && p.is_pointer());
        assert_eq!(
            p.to_script_value("v", &mut m),
            "HyperloopVoidPointerToJSValue(ctx,static_cast<void *>(const_cast<int *>(v)),exception)"
        );
        assert_eq!(
            p.to_native_value("v", &mut m),
            "static_cast<int *>(HyperloopJSValueToVoidPointer(ctx,v,exception))"
        );
        assert!(m.preamble.is_empty() && m.cleanup.is_empty());
    }

    #[test]
    fn test_enum_is_number() {
        let mut r = resolver(
            r#"{"types": {"UIViewContentMode": {"type": "enum UIViewContentMode", "metatype": "enum"}}}"#,
        );
        let t = r.resolve("enum UIViewContentMode").unwrap();
        assert_eq!(t.script_kind(), ScriptKind::Number);
        assert_eq!(t.name, "UIViewContentMode");
        let t = r.resolve("UIViewContentMode").unwrap();
        assert_eq!(t.script_kind(), ScriptKind::Number);
    }

    #[test]
    fn test_struct_fields_resolved() {
        let mut r = resolver(
            r#"{"types": {"CGPoint": {"type": "struct CGPoint", "metatype": "struct",
                "fields": [{"name": "x", "type": "double"}, {"name": "y", "type": "double"}]}}}"#,
        );
        let t = r.resolve("CGPoint").unwrap();
        assert!(t.was_not_pointer);
        assert_eq!(t.to_string(), "struct CGPoint *");
        assert_eq!(t.fields().len(), 2);
        assert_eq!(t.fields()[0].ty.as_ref().unwrap().to_cast(), "double");
        assert_eq!(r.classes(), vec!["CGPoint".to_string()]);
    }

    #[test]
    fn test_struct_by_value_copies_on_the_way_out() {
        let mut r = empty();
        let t = r.resolve("struct Foo").unwrap();
        let mut m = Marshal::default();
        let out = t.to_script_value("v", &mut m);
        assert_eq!(out, "Foo_ToJSValue(ctx,v$,exception)");
        assert_eq!(
            m.preamble,
            vec![
                "struct Foo * v$ = (struct Foo *)malloc(sizeof(struct Foo));".to_string(),
                "memcpy(v$,&v,sizeof(struct Foo));".to_string(),
            ]
        );
        assert_eq!(
            m.declarations,
            vec!["JSValueRef Foo_ToJSValue(JSContextRef,struct Foo *,JSValueRef *);".to_string()]
        );

        let mut m = Marshal::default();
        assert_eq!(t.to_native_value("v", &mut m), "*vptr");
        assert!(m.preamble.iter().any(|l| l.contains("null is not allowed for v")));
    }

    #[test]
    fn test_self_referential_struct_terminates() {
        let mut r = resolver(
            r#"{"types": {"Node": {"type": "struct Node", "metatype": "struct",
                "fields": [{"name": "next", "type": "struct Node *"}, {"name": "value", "type": "int"}]}}}"#,
        );
        let t = r.resolve("Node").unwrap();
        let next = t.fields()[0].ty.as_ref().unwrap();
        assert!(next.is_pointer());
        assert_eq!(t.fields()[1].ty.as_ref().unwrap().to_cast(), "int");
    }

    #[test]
    fn test_union_normalized_to_pointer() {
        let mut r = empty();
        let t = r.resolve("union Value").unwrap();
        assert!(matches!(t.native, NativeKind::Union(_)));
        assert!(t.was_not_pointer);
        assert_eq!(t.name, "Value");
        assert_eq!(t.to_cast(), "Value *");
    }

    #[test]
    fn test_char_arrays() {
        let mut r = empty();
        let t = r.resolve("char [32]").unwrap();
        assert_eq!(t.script_kind(), ScriptKind::String);
        assert_eq!(t.char_length(), 32);
        let t = r.resolve("const char []").unwrap();
        assert_eq!(t.char_length(), 0);
        assert!(t.is_const);
    }

    #[test]
    fn test_function_pointer_resolves_signature() {
        let mut r = empty();
        let t = r.resolve("int (*)(double, void *)").unwrap();
        let sig = t.signature().unwrap();
        assert_eq!(sig.return_type.to_cast(), "int");
        assert_eq!(sig.args.len(), 2);
        assert!(sig.args[1].is_void_pointer());
        assert_eq!(t.script_kind(), ScriptKind::Object);

        let callback = t.to_function_callback().unwrap();
        assert!(callback.contains("HyperloopInvokeFunctionCallback(arg1,argumentCount,arguments,exception);"));
        assert!(callback.contains("auto argValue0 = double_ToJSValue(ctx,arg0,exception);"));
        assert!(callback.contains("EXPORTAPI int JSValueTo_int(JSContextRef, JSValueRef, JSValueRef*);"));
    }

    #[test]
    fn test_block_marshals_to_nullptr() {
        let mut r = empty();
        let t = r.resolve("void (^)(int)").unwrap();
        assert!(matches!(t.native, NativeKind::Block(_)));
        assert_eq!(t.to_native_value("v", &mut Marshal::default()), "nullptr");
    }

    #[test]
    fn test_trailing_array_is_pointer() {
        let mut r = empty();
        let t = r.resolve("int [4]").unwrap();
        assert!(matches!(t.native, NativeKind::Pointer));
        assert_eq!(t.to_string(), "int *");
        assert_eq!(t.length, Some(4));
    }

    #[test]
    fn test_class_pointer_is_object() {
        let mut r = resolver(r#"{"classes": {"UIView": {}}}"#);
        let t = r.resolve("UIView *").unwrap();
        assert!(matches!(t.native, NativeKind::Object));
        assert_eq!(t.to_cast(), "UIView *");
        let mut m = Marshal::default();
        assert_eq!(t.to_native_value("v", &mut m), "JSValueTo_UIView(ctx,v,exception)");
        assert_eq!(
            m.declarations,
            vec!["EXPORTAPI UIView * JSValueTo_UIView(JSContextRef,JSValueRef,JSValueRef *);".to_string()]
        );
        assert_eq!(r.classes(), vec!["UIView".to_string()]);
    }

    #[test]
    fn test_typedef_to_builtin_pointer() {
        let mut r = resolver(r#"{"types": {"GLvoid": {"type": "void"}, "GLchar": {"type": "char"}}}"#);
        let t = r.resolve("GLvoid *").unwrap();
        assert!(t.is_void_pointer());
        let t = r.resolve("GLchar *").unwrap();
        assert_eq!(t.script_kind(), ScriptKind::String);
        assert_eq!(t.char_length(), 0);
    }

    #[test]
    fn test_typedef_chain_is_followed() {
        let mut r = resolver(
            r#"{"types": {
                "NSUInteger": {"type": "unsigned long"},
                "UIViewAutoresizing": {"type": "NSUInteger"}
            }}"#,
        );
        let t = r.resolve("UIViewAutoresizing").unwrap();
        assert!(matches!(t.native, NativeKind::Primitive));
        assert_eq!(t.to_cast(), "unsigned long");
    }

    #[test]
    fn test_const_pointer_to_typedef() {
        let mut r = resolver(r#"{"types": {"CGFloat": {"type": "double"}}}"#);
        let t = r.resolve("const CGFloat *").unwrap();
        assert!(t.is_const);
        assert!(t.is_pointer());
        assert_eq!(t.to_string(), "const CGFloat *");
        assert_eq!(r.types(), vec!["CGFloat".to_string()]);
    }

    #[test]
    fn test_two_step_alias_cycle_is_benign() {
        let mut r = resolver(
            r#"{"types": {
                "SEL": {"type": "struct objc_selector *"},
                "struct objc_selector *": {"type": "SEL"}
            }}"#,
        );
        assert!(r.resolve("SEL").is_ok());
    }

    #[test]
    fn test_longer_alias_cycle_fails() {
        let mut r = resolver(
            r#"{"types": {"A": {"type": "B"}, "B": {"type": "C"}, "C": {"type": "A"}}}"#,
        );
        let err = r.resolve("A").unwrap_err();
        assert_eq!(err.code, ERR_ALIAS_CHAIN);
    }

    #[test]
    fn test_deep_alias_chain_fails() {
        let mut types = serde_json::Map::new();
        for i in 0..(MAX_ALIAS_DEPTH + 4) {
            types.insert(
                format!("T{}", i),
                serde_json::json!({ "type": format!("T{}", i + 1) }),
            );
        }
        let json = serde_json::json!({ "types": types }).to_string();
        let mut r = resolver(&json);
        let err = r.resolve("T0").unwrap_err();
        assert_eq!(err.code, ERR_ALIAS_CHAIN);
        assert!(err.message.contains("exceeds"));
    }

    #[test]
    fn test_unknown_value_type_fails() {
        let mut r = empty();
        let err = r.resolve("Mystery").unwrap_err();
        assert_eq!(err.code, ERR_UNKNOWN_TYPE);
        let opaque = r.resolve("Mystery *").unwrap();
        assert!(matches!(opaque.native, NativeKind::Pointer));
    }

    #[test]
    fn test_reset_clears_cache() {
        let mut r = empty();
        r.resolve("int").unwrap();
        assert!(r.cached("int").is_some());
        r.reset(None);
        assert!(r.cached("int").is_none());
        assert!(r.resolve("int").is_err());
    }
}
