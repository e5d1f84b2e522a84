//! Code Generator module
//!
//! Walks the class map, the per-file IR and every type the session resolved,
//! and emits the native units for one architecture:
//!
//! - one wrapper unit per class (`<Class>.cpp`) with its member bridges
//! - `HyperloopFunctions.cpp` with one bridge per native function
//! - one marshalling unit per remaining type (`type_<Name>.cpp`), once per key
//! - one loader unit per compiled script (`js_<file>.cpp`)
//! - `HL_jscode.cpp` with embedded payloads and the module initializer
//! - `hyperloop.h` declaring everything above
//! - `app_symbols.json` and `lib_symbols.json` symbol maps
//!
//! Units are plain text; writing them through the source cache is the
//! caller's job (see `write_units`).

use crate::cache::{SourceCache, SourceEntry};
use crate::embed;
use crate::error::CompileResult;
use crate::ir::Ir;
use crate::naming::{c_string, js_filename, multiline_comment, sanitize_symbol_name, VarNames, GENERATED_HEADER};
use crate::session::CompileSession;
use crate::symbols::{ClassEntry, ClassMap, Symbol, SymbolKind, SymbolTable};
use crate::types::{Marshal, NativeKind, TypeDescriptor};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

pub const HEADER_UNIT: &str = "hyperloop.h";
pub const FUNCTIONS_UNIT: &str = "HyperloopFunctions.cpp";
pub const EMBED_UNIT: &str = "HL_jscode.cpp";
pub const APP_SYMBOLS: &str = "app_symbols.json";
pub const LIB_SYMBOLS: &str = "lib_symbols.json";

const BRIDGE_PARAMS: &str = "JSContextRef ctx, JSObjectRef function, JSObjectRef thisObject, size_t argumentCount, const JSValueRef arguments[], JSValueRef* exception";

// ═══════════════════════════════════════════════════════════════════════════════
// INPUT/OUTPUT TYPES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub enum SourceKind {
    /// Script compiled in native mode, with the bridges it references.
    Native { ir: Ir, symbols: SymbolTable },
    /// Script without the directive, embedded as-is.
    Script,
    /// JSON payload, embedded and parsed by the engine on load.
    Json,
}

#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Path relative to the source root, `/`-separated.
    pub relative: String,
    /// Rewritten code for native files, the original payload otherwise.
    pub code: String,
    pub kind: SourceKind,
}

impl SourceFile {
    pub fn loader_name(&self) -> String {
        format!("HyperloopLoad_{}", js_filename(&self.relative))
    }

    pub fn is_native(&self) -> bool {
        matches!(self.kind, SourceKind::Native { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedUnit {
    /// File name relative to the architecture output directory.
    pub name: String,
    pub code: String,
}

// ═══════════════════════════════════════════════════════════════════════════════
// GENERATOR
// ═══════════════════════════════════════════════════════════════════════════════

pub struct Generator<'a> {
    session: &'a mut CompileSession,
    module_id: String,
    xor: Option<String>,
    /// Marshalling pairs emitted so far, by `TypeDescriptor::as_key`.
    emitted_types: BTreeSet<String>,
    /// Converter function names taken so far. Spellings differing only in
    /// pointer depth share one.
    emitted_converters: BTreeSet<String>,
    /// Wrapper classes emitted so far, by class key.
    emitted_classes: BTreeMap<String, Arc<TypeDescriptor>>,
    /// Converter prototypes for the header.
    converters: BTreeSet<String>,
    includes: BTreeSet<String>,
}

impl<'a> Generator<'a> {
    pub fn new(session: &'a mut CompileSession, module_id: &str, xor: Option<&str>) -> Self {
        Self {
            session,
            module_id: module_id.to_string(),
            xor: xor.map(String::from),
            emitted_types: BTreeSet::new(),
            emitted_converters: BTreeSet::new(),
            emitted_classes: BTreeMap::new(),
            converters: BTreeSet::new(),
            includes: BTreeSet::new(),
        }
    }

    /// Builds the class map from the session's symbol table and generates
    /// every unit.
    pub fn generate_all(&mut self, files: &[SourceFile]) -> CompileResult<Vec<GeneratedUnit>> {
        let custom = self.session.custom_class_names();
        let class_map = ClassMap::build(&self.session.symbols, &mut self.session.types, &custom)?;
        self.generate(&class_map, files)
    }

    pub fn generate(
        &mut self,
        class_map: &ClassMap,
        files: &[SourceFile],
    ) -> CompileResult<Vec<GeneratedUnit>> {
        let mut units = Vec::new();

        for (name, entry) in &class_map.classes {
            if let Some(unit) = self.class_unit(name, entry)? {
                units.push(unit);
            }
        }

        if !class_map.functions.is_empty() {
            units.push(self.functions_unit(&class_map.functions)?);
        }

        // Generating units can resolve further types (fields, callback
        // arguments), so walk the resolver until it stops growing.
        let mut seen = BTreeSet::new();
        loop {
            let pending: Vec<String> = self
                .session
                .types
                .types()
                .into_iter()
                .filter(|raw| !seen.contains(raw))
                .collect();
            if pending.is_empty() {
                break;
            }
            for raw in pending {
                seen.insert(raw.clone());
                let ty = self.session.types.resolve(&raw)?;
                if ty.is_class_like() {
                    let key = ty.class_key();
                    if !self.emitted_classes.contains_key(&key) {
                        if let Some(unit) = self.class_unit(&key, &ClassEntry::default())? {
                            units.push(unit);
                        }
                    }
                    continue;
                }
                if let Some(unit) = self.type_unit(&ty) {
                    units.push(unit);
                }
            }
        }

        for file in files {
            if let SourceKind::Native { ir, symbols } = &file.kind {
                units.push(self.loader_unit(file, ir, symbols));
            }
        }
        units.push(self.embed_unit(files));

        let lib_defines = self.obfuscate_library();
        units.push(self.header_unit(files, &lib_defines));
        units.push(GeneratedUnit {
            name: APP_SYMBOLS.to_string(),
            code: serde_json::to_string_pretty(self.session.obfuscator.symbol_map())?,
        });
        units.push(GeneratedUnit {
            name: LIB_SYMBOLS.to_string(),
            code: serde_json::to_string_pretty(self.session.lib_obfuscator.symbol_map())?,
        });

        log::info!(
            "[Hyperloop] {}: generated {} units ({} classes, {} types)",
            self.session.arch,
            units.len(),
            self.emitted_classes.len(),
            self.emitted_types.len()
        );
        Ok(units)
    }

    fn note_includes(&mut self, ty: &TypeDescriptor) {
        if let Some(import) = &ty.import {
            self.includes.insert(format!("#include \"{}\"", import));
        } else if let Some(framework) = &ty.framework {
            self.includes
                .insert(format!("#include <{}/{}.h>", framework, framework));
        }
    }

    fn display_class_name(&mut self, name: &str) -> String {
        if self.session.obfuscate {
            self.session.obfuscator.obfuscate(name)
        } else {
            name.to_string()
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // Class units
    // ───────────────────────────────────────────────────────────────────────

    fn class_unit(&mut self, name: &str, entry: &ClassEntry) -> CompileResult<Option<GeneratedUnit>> {
        let ty = self.session.types.class_type(name)?;
        let key = ty.class_key();
        if self.emitted_classes.contains_key(&key) {
            return Ok(None);
        }
        self.emitted_classes.insert(key.clone(), Arc::clone(&ty));
        self.note_includes(&ty);
        if let Some(framework) = self
            .session
            .metabase
            .class(name)
            .and_then(|c| c.framework.clone())
        {
            self.includes
                .insert(format!("#include <{}/{}.h>", framework, framework));
        }

        let safe = ty.safe_class_name();
        let cast = ty.to_cast();
        let display = self.display_class_name(&key);
        self.converters.insert(format!(
            "EXPORTAPI JSValueRef {}(JSContextRef,{},JSValueRef*);",
            ty.to_script_value_name(),
            cast
        ));
        self.converters.insert(format!(
            "EXPORTAPI {} {}(JSContextRef,JSValueRef,JSValueRef*);",
            cast,
            ty.to_native_name()
        ));
        self.converters
            .insert(format!("JSClassRef Register{}();", safe));

        let mut code = vec![GENERATED_HEADER.to_string(), "#include \"hyperloop.h\"".to_string(), String::new()];
        let mut declarations: Vec<String> = Vec::new();
        let mut body: Vec<String> = Vec::new();

        body.extend(wrapper_hooks(&ty, &display));
        for symbol in entry
            .constructors
            .values()
            .chain(entry.static_methods.values())
            .chain(entry.instance_methods.values())
            .chain(entry.getters.values())
            .chain(entry.setters.values())
        {
            body.push(multiline_comment(&format!(
                "{} {}.{}",
                symbol.kind.label(),
                key,
                symbol.name
            )));
            body.extend(self.bridge(symbol, Some(&ty), &mut declarations)?);
            body.push(String::new());
        }

        code.extend(declarations);
        code.push(String::new());
        code.extend(body);
        log::debug!("[Hyperloop] class unit {} ({} members)", key, entry.len());
        Ok(Some(GeneratedUnit {
            name: format!("{}.cpp", safe),
            code: code.join("\n"),
        }))
    }

    // ───────────────────────────────────────────────────────────────────────
    // Bridges
    // ───────────────────────────────────────────────────────────────────────

    /// One engine-callable bridge. Instance members take their receiver as
    /// `arguments[0]`.
    fn bridge(
        &mut self,
        symbol: &Symbol,
        class: Option<&Arc<TypeDescriptor>>,
        declarations: &mut Vec<String>,
    ) -> CompileResult<Vec<String>> {
        let location = &symbol.location;
        let anchor = |e: crate::error::CompilerError| e.at(&location.file, location.line, location.column);

        let arg_types = symbol.arg_types();
        let mut args = Vec::with_capacity(arg_types.len());
        for spelling in &arg_types {
            args.push(self.session.types.resolve(spelling).map_err(anchor)?);
        }
        let ret = self.session.types.resolve(&symbol.return_type).map_err(anchor)?;

        let offset = usize::from(symbol.is_instance());
        let required = args.len() + offset;
        let script_name = match &symbol.class_name {
            Some(class_name) => format!("{}.{}", class_name, symbol.name),
            None => symbol.name.clone(),
        };

        let mut code = vec![format!("JSValueRef {}({})", symbol.symbol_name, BRIDGE_PARAMS), "{".to_string()];
        if required > 0 {
            code.push(format!("\tif (argumentCount < {})", required));
            code.push("\t{".to_string());
            code.push(format!(
                "\t\t*exception = HyperloopMakeException(ctx,\"{} expects {} argument(s)\");",
                c_string(&script_name),
                required
            ));
            code.push("\t\treturn JSValueMakeUndefined(ctx);".to_string());
            code.push("\t}".to_string());
        }

        let mut m = Marshal::default();
        if symbol.is_instance() {
            if let Some(class) = class {
                m.declare(format!(
                    "EXPORTAPI {} {}(JSContextRef,JSValueRef,JSValueRef*);",
                    class.to_cast(),
                    class.to_native_name()
                ));
                code.push(format!(
                    "\tauto instance = {}(ctx,arguments[0],exception);",
                    class.to_native_name()
                ));
                code.push("\tCHECK_EXCEPTION(exception);".to_string());
                class.to_null_check("instance", "\t", &mut code);
            }
        }

        let mut values = Vec::with_capacity(args.len());
        for (index, arg) in args.iter().enumerate() {
            let expr = arg.to_native_value(&format!("arguments[{}]", index + offset), &mut m);
            for line in m.preamble.drain(..) {
                code.push(format!("\t{}", line));
            }
            code.push(format!("\tauto arg{} = {};", index, expr));
            values.push(format!("arg{}", index));
        }

        let receiver = class.map(|c| c.to_class_name()).unwrap_or_default();
        let call = match &symbol.kind {
            SymbolKind::Constructor => match class {
                Some(c) if matches!(c.native, NativeKind::Struct(_) | NativeKind::Union(_)) => {
                    format!("static_cast<{}>(calloc(1,sizeof({})))", c.to_cast(), receiver)
                }
                _ => format!("new {}()", receiver),
            },
            SymbolKind::InstanceMethod(def) => {
                format!("instance->{}({})", def.name, values.join(","))
            }
            SymbolKind::StaticMethod(def) => {
                format!("{}::{}({})", receiver, def.name, values.join(","))
            }
            SymbolKind::Getter(def) if def.instance => format!("instance->{}", def.name),
            SymbolKind::Getter(def) => format!("{}::{}", receiver, def.name),
            SymbolKind::Setter(def) if def.instance => {
                format!("instance->{} = {}", def.name, values.join(","))
            }
            SymbolKind::Setter(def) => format!("{}::{} = {}", receiver, def.name, values.join(",")),
            SymbolKind::Function(def) => {
                let name = if def.name.is_empty() { &symbol.name } else { &def.name };
                format!("{}({})", name, values.join(","))
            }
        };

        let returns_nothing = ret.is_void || matches!(symbol.kind, SymbolKind::Setter(_));
        if returns_nothing {
            code.push(format!("\t{};", call));
            for line in m.cleanup.drain(..) {
                code.push(format!("\t{}", line));
            }
            code.push("\treturn JSValueMakeUndefined(ctx);".to_string());
        } else {
            code.push(format!("\tauto result = {};", call));
            let value = match (&symbol.kind, class) {
                // the fresh allocation is already a pointer, never copy it
                (SymbolKind::Constructor, Some(c)) => {
                    format!("{}(ctx,result,exception)", c.to_script_value_name())
                }
                _ => ret.to_script_value("result", &mut m),
            };
            for line in m.preamble.drain(..) {
                code.push(format!("\t{}", line));
            }
            code.push(format!("\tauto resultValue = {};", value));
            for line in m.cleanup.drain(..) {
                code.push(format!("\t{}", line));
            }
            code.push("\treturn resultValue;".to_string());
        }
        code.push("}".to_string());

        for decl in m.declarations {
            if !declarations.contains(&decl) {
                declarations.push(decl);
            }
        }
        Ok(code)
    }

    fn functions_unit(&mut self, functions: &BTreeMap<String, Symbol>) -> CompileResult<GeneratedUnit> {
        let mut declarations = Vec::new();
        let mut body = Vec::new();
        for symbol in functions.values() {
            body.push(multiline_comment(&format!("function {}", symbol.name)));
            body.extend(self.bridge(symbol, None, &mut declarations)?);
            body.push(String::new());
        }
        let mut code = vec![GENERATED_HEADER.to_string(), "#include \"hyperloop.h\"".to_string(), String::new()];
        code.extend(declarations);
        code.push(String::new());
        code.extend(body);
        Ok(GeneratedUnit {
            name: FUNCTIONS_UNIT.to_string(),
            code: code.join("\n"),
        })
    }

    // ───────────────────────────────────────────────────────────────────────
    // Type units
    // ───────────────────────────────────────────────────────────────────────

    /// Marshalling pair for a non-class type; `None` when the key was already
    /// emitted or the type has nothing to convert.
    fn type_unit(&mut self, ty: &Arc<TypeDescriptor>) -> Option<GeneratedUnit> {
        if matches!(ty.native, NativeKind::Void | NativeKind::Null) {
            return None;
        }
        if !self.emitted_types.insert(ty.as_key()) {
            return None;
        }
        if !self.emitted_converters.insert(ty.to_script_value_name()) {
            log::debug!(
                "[Hyperloop] {} shares converters with an emitted type",
                ty.as_key()
            );
            return None;
        }
        self.note_includes(ty);

        let safe = ty.safe_class_name();
        let mut code = vec![GENERATED_HEADER.to_string(), "#include \"hyperloop.h\"".to_string(), String::new()];

        match &ty.native {
            NativeKind::FunctionPointer(_) => {
                code.push(ty.to_declaration());
                let cast = ty.to_cast();
                self.converters.insert(format!(
                    "EXPORTAPI JSValueRef {}(JSContextRef,{},JSValueRef*);",
                    ty.to_script_value_name(),
                    cast
                ));
                let mut m = Marshal::default();
                let value = ty.to_script_value("value", &mut m);
                code.push(format!(
                    "EXPORTAPI JSValueRef {}(JSContextRef ctx, {} value, JSValueRef *exception)",
                    ty.to_script_value_name(),
                    cast
                ));
                code.push("{".to_string());
                code.push(format!("\treturn {};", value));
                code.push("}".to_string());
                code.push(String::new());
                if let Some(callback) = ty.to_function_callback() {
                    code.push(callback);
                }
            }
            NativeKind::Block(_) => {
                let cast = format!("{}Type", safe);
                code.push(format!(
                    "typedef {};",
                    ty.name.replacen("(^)", &format!("(^{})", cast), 1)
                ));
                self.converters.insert(format!(
                    "EXPORTAPI JSValueRef {}(JSContextRef,void *,JSValueRef*);",
                    ty.to_script_value_name()
                ));
                code.push(format!(
                    "EXPORTAPI JSValueRef {}(JSContextRef ctx, void * value, JSValueRef *exception)",
                    ty.to_script_value_name()
                ));
                code.push("{".to_string());
                code.push("\treturn HyperloopVoidPointerToJSValue(ctx,value,exception);".to_string());
                code.push("}".to_string());
            }
            _ => {
                let cast = ty.to_cast();
                self.converters.insert(format!(
                    "EXPORTAPI JSValueRef {}(JSContextRef,{},JSValueRef*);",
                    ty.to_script_value_name(),
                    cast
                ));
                self.converters.insert(format!(
                    "EXPORTAPI {} {}(JSContextRef,JSValueRef,JSValueRef*);",
                    cast,
                    ty.to_native_name()
                ));

                let mut m = Marshal::default();
                let value = ty.to_script_value("value", &mut m);
                code.push(format!(
                    "EXPORTAPI JSValueRef {}(JSContextRef ctx, {} value, JSValueRef *exception)",
                    ty.to_script_value_name(),
                    cast
                ));
                code.push("{".to_string());
                for line in m.preamble.drain(..) {
                    code.push(format!("\t{}", line));
                }
                code.push(format!("\treturn {};", value));
                code.push("}".to_string());
                code.push(String::new());

                let native = ty.to_native_value("value", &mut m);
                code.push(format!(
                    "EXPORTAPI {} {}(JSContextRef ctx, JSValueRef value, JSValueRef *exception)",
                    cast,
                    ty.to_native_name()
                ));
                code.push("{".to_string());
                for line in m.preamble.drain(..) {
                    code.push(format!("\t{}", line));
                }
                code.push(format!("\tauto result = {};", native));
                // the caller owns a returned string buffer
                let hands_out_buffer = matches!(ty.native, NativeKind::String) && ty.is_pointer();
                if !hands_out_buffer {
                    for line in m.cleanup.drain(..) {
                        code.push(format!("\t{}", line));
                    }
                }
                code.push("\treturn result;".to_string());
                code.push("}".to_string());
            }
        }

        log::debug!("[Hyperloop] type unit {} ({})", ty.as_key(), ty.native.label());
        Some(GeneratedUnit {
            name: format!("type_{}.cpp", safe),
            code: code.join("\n"),
        })
    }

    // ───────────────────────────────────────────────────────────────────────
    // Loader units
    // ───────────────────────────────────────────────────────────────────────

    fn loader_unit(&mut self, file: &SourceFile, ir: &Ir, symbols: &SymbolTable) -> GeneratedUnit {
        let loader = file.loader_name();
        let guard = format!("{}_result", loader);
        let mut names = VarNames::new();
        let mut body: Vec<String> = Vec::new();

        body.push(format!("if ({} != nullptr)", guard));
        body.push("{".to_string());
        body.push(format!("\treturn {};", guard));
        body.push("}".to_string());
        body.push(String::new());

        // module context
        let module_name = names.make();
        let exports_name = names.make();
        let filename_name = names.make();
        let filename_value = names.make();
        body.push("// module".to_string());
        body.push(format!("auto {} = JSStringCreateWithUTF8CString(\"module\");", module_name));
        body.push(format!("auto {} = JSStringCreateWithUTF8CString(\"exports\");", exports_name));
        body.push(format!("auto {} = JSStringCreateWithUTF8CString(\"__filename\");", filename_name));
        body.push(format!(
            "auto {} = JSStringCreateWithUTF8CString(\"{}\");",
            filename_value,
            c_string(&file.relative)
        ));
        body.push("auto module$ = JSObjectMake(ctx,nullptr,nullptr);".to_string());
        body.push("auto exports$ = JSObjectMake(ctx,nullptr,nullptr);".to_string());
        body.push(format!("JSObjectSetProperty(ctx,module$,{},exports$,0,exception);", exports_name));
        body.push(format!("JSObjectSetProperty(ctx,object,{},module$,0,exception);", module_name));
        body.push(format!("JSObjectSetProperty(ctx,object,{},exports$,0,exception);", exports_name));
        body.push(format!(
            "JSObjectSetProperty(ctx,object,{},JSValueMakeString(ctx,{}),kJSPropertyAttributeReadOnly,exception);",
            filename_name, filename_value
        ));
        body.push("CHECK_EXCEPTION(exception);".to_string());
        body.push(format!("JSStringRelease({});", filename_name));
        body.push(format!("JSStringRelease({});", filename_value));
        body.push(String::new());

        // bridges visible to this file
        let mut bridges: Vec<(String, String)> = symbols
            .values()
            .map(|s| (s.key.clone(), s.symbol_name.clone()))
            .collect();
        bridges.extend(
            self.session
                .builtin_symbols
                .iter()
                .map(|b| (b.clone(), b.clone())),
        );
        for (key, symbol_name) in bridges {
            let v = names.make();
            body.push(format!("// bridge {}", symbol_name));
            body.push(format!("auto {} = JSStringCreateWithUTF8CString(\"{}\");", v, key));
            body.push(format!(
                "auto {}Fn = JSObjectMakeFunctionWithCallback(ctx,{},{});",
                key, v, symbol_name
            ));
            body.push(format!(
                "JSObjectSetProperty(ctx,object,{},{}Fn,kJSPropertyAttributeDontEnum,exception);",
                v, key
            ));
            body.push("CHECK_EXCEPTION(exception);".to_string());
            body.push(format!("JSStringRelease({});", v));
            body.push(String::new());
        }

        body.extend(ir.to_native(&mut names));

        body.push(format!(
            "auto result = JSObjectGetProperty(ctx,module$,{},exception);",
            exports_name
        ));
        body.push("CHECK_EXCEPTION(exception);".to_string());
        body.push(format!("JSStringRelease({});", module_name));
        body.push(format!("JSStringRelease({});", exports_name));
        body.push("JSValueProtect(ctx,result);".to_string());
        body.push(format!("{} = result;", guard));
        body.push("return result;".to_string());

        let mut code = vec![
            GENERATED_HEADER.to_string(),
            "#include \"hyperloop.h\"".to_string(),
            String::new(),
            format!("static JSValueRef {} = nullptr;", guard),
            String::new(),
            multiline_comment(&format!("loader for {}", file.relative)),
            format!(
                "EXPORTAPI JSValueRef {}(JSContextRef ctx, JSObjectRef object, JSValueRef *exception)",
                loader
            ),
            "{".to_string(),
        ];
        for line in body {
            if line.is_empty() {
                code.push(line);
            } else {
                code.push(format!("\t{}", line));
            }
        }
        code.push("}".to_string());

        log::debug!("[Hyperloop] loader unit {} ({} IR nodes)", file.relative, ir.len());
        GeneratedUnit {
            name: format!("js_{}.cpp", js_filename(&file.relative)),
            code: code.join("\n"),
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // Embedded payloads and module entry
    // ───────────────────────────────────────────────────────────────────────

    fn initialize_name(&self) -> String {
        format!("HyperloopInitialize_{}", sanitize_symbol_name(&self.module_id))
    }

    fn embed_unit(&mut self, files: &[SourceFile]) -> GeneratedUnit {
        let mut defines = Vec::new();
        let mut decoders = Vec::new();
        let mut lookup = Vec::new();
        let mut names = VarNames::new();

        for file in files.iter().filter(|f| !f.is_native()) {
            let varname = embed::varname(&file.relative);
            let embedded = embed::transform(&file.code);
            defines.push(embed::define(&varname, &embedded));
            decoders.push(embed::decoder(&varname));

            let buf = names.make();
            let decoded = names.make();
            let script = names.make();
            let fname = names.make();
            lookup.push(format!("\tif (fn == \"{}\")", c_string(&file.relative)));
            lookup.push("\t{".to_string());
            lookup.extend(embed::decode(&varname, "\t\t", &buf, &decoded, &script));
            match file.kind {
                SourceKind::Json => {
                    lookup.push(format!("\t\tauto result = JSValueMakeFromJSONString(ctx,{});", script));
                    lookup.push(format!("\t\tJSStringRelease({});", script));
                    lookup.push("\t\tif (result == nullptr)".to_string());
                    lookup.push("\t\t{".to_string());
                    lookup.push(format!(
                        "\t\t\t*exception = HyperloopMakeException(ctx,\"invalid JSON in {}\");",
                        c_string(&file.relative)
                    ));
                    lookup.push("\t\t\treturn JSValueMakeUndefined(ctx);".to_string());
                    lookup.push("\t\t}".to_string());
                }
                _ => {
                    lookup.push(format!(
                        "\t\tauto {} = JSStringCreateWithUTF8CString(\"{}\");",
                        fname,
                        c_string(&file.relative)
                    ));
                    lookup.push(format!(
                        "\t\tauto result = JSEvaluateScript(ctx,{},object,{},1,exception);",
                        script, fname
                    ));
                    lookup.push(format!("\t\tJSStringRelease({});", script));
                    lookup.push(format!("\t\tJSStringRelease({});", fname));
                }
            }
            lookup.push("\t\treturn result;".to_string());
            lookup.push("\t}".to_string());
        }

        let mut code = vec![
            GENERATED_HEADER.to_string(),
            "#include \"hyperloop.h\"".to_string(),
            String::new(),
            embed::body(self.xor.as_deref(), &defines),
        ];
        code.extend(decoders);
        code.push(multiline_comment("returns an embedded payload by its source path"));
        code.push("EXPORTAPI JSValueRef HyperloopLoadEmbedSource(JSContextRef ctx, JSObjectRef object, const char *name, JSValueRef *exception)".to_string());
        code.push("{".to_string());
        code.push("\tstd::string fn(name);".to_string());
        code.extend(lookup);
        code.push("\tauto message = std::string(\"MODULE_NOT_FOUND: Cannot find module '\") + fn + \"'\";".to_string());
        code.push("\t*exception = HyperloopMakeException(ctx,message.c_str());".to_string());
        code.push("\treturn JSValueMakeUndefined(ctx);".to_string());
        code.push("}".to_string());
        code.push(String::new());

        code.push(multiline_comment("registers every loader of this module"));
        code.push(format!(
            "EXPORTAPI void {}(JSContextRef ctx, JSObjectRef object)",
            self.initialize_name()
        ));
        code.push("{".to_string());
        for file in files.iter().filter(|f| f.is_native()) {
            code.push(format!(
                "\tHyperloopRegisterLoader(\"{}\",{});",
                c_string(&file.relative),
                file.loader_name()
            ));
        }
        code.push("\tHyperloopRegisterEmbedSource(HyperloopLoadEmbedSource);".to_string());
        code.push("}".to_string());

        GeneratedUnit {
            name: EMBED_UNIT.to_string(),
            code: code.join("\n"),
        }
    }

    /// `#define` lines renaming runtime library bridges to their tokens.
    fn obfuscate_library(&mut self) -> Vec<String> {
        if !self.session.obfuscate {
            return Vec::new();
        }
        let builtins: Vec<String> = self.session.builtin_symbols.iter().cloned().collect();
        builtins
            .iter()
            .map(|name| {
                let token = self.session.lib_obfuscator.obfuscate(name);
                format!("#define {} {}", name, token)
            })
            .collect()
    }

    fn header_unit(&mut self, files: &[SourceFile], lib_defines: &[String]) -> GeneratedUnit {
        let mut code = vec![
            GENERATED_HEADER.to_string(),
            "#pragma once".to_string(),
            String::new(),
            "#include <JavaScriptCore/JavaScript.h>".to_string(),
            "#include <cstdlib>".to_string(),
            "#include <cstring>".to_string(),
            "#include <string>".to_string(),
            "#include \"HyperloopRuntime.h\"".to_string(),
        ];
        code.extend(self.includes.iter().cloned());
        code.push(String::new());
        code.push("#ifndef EXPORTAPI".to_string());
        code.push("#define EXPORTAPI extern \"C\"".to_string());
        code.push("#endif".to_string());
        code.push(String::new());
        code.push("#define CHECK_EXCEPTION(e) if (e!=nullptr && *e!=nullptr) { return JSValueMakeUndefined(ctx); }".to_string());
        code.push(String::new());

        if !lib_defines.is_empty() {
            code.extend(lib_defines.iter().cloned());
            code.push(String::new());
        }
        if self.session.obfuscate {
            for symbol in self.session.symbols.values() {
                if symbol.key != symbol.symbol_name {
                    code.push(format!("#define {} {}", symbol.symbol_name, symbol.key));
                }
            }
            code.push(String::new());
        }

        for custom in self.session.custom_classes.values() {
            match &custom.superclass {
                Some(base) => code.push(format!(
                    "class {} : public {} {{ public: using {}::{}; }};",
                    custom.name, base, base, base
                )),
                None => code.push(format!("class {} {{}};", custom.name)),
            }
        }

        let mut bridges: BTreeSet<&str> = self
            .session
            .symbols
            .values()
            .map(|s| s.symbol_name.as_str())
            .collect();
        bridges.extend(self.session.builtin_symbols.iter().map(String::as_str));
        for name in bridges {
            code.push(format!(
                "EXPORTAPI JSValueRef {}(JSContextRef,JSObjectRef,JSObjectRef,size_t,const JSValueRef[],JSValueRef*);",
                name
            ));
        }
        code.extend(self.converters.iter().cloned());
        code.push(String::new());

        for file in files.iter().filter(|f| f.is_native()) {
            code.push(format!(
                "EXPORTAPI JSValueRef {}(JSContextRef,JSObjectRef,JSValueRef*);",
                file.loader_name()
            ));
        }
        code.push("EXPORTAPI JSValueRef HyperloopLoadEmbedSource(JSContextRef,JSObjectRef,const char*,JSValueRef*);".to_string());
        code.push(format!(
            "EXPORTAPI void {}(JSContextRef,JSObjectRef);",
            self.initialize_name()
        ));

        GeneratedUnit {
            name: HEADER_UNIT.to_string(),
            code: code.join("\n"),
        }
    }
}

/// Wrapper class hooks and converters shared by every class-like type.
fn wrapper_hooks(ty: &TypeDescriptor, display: &str) -> Vec<String> {
    let safe = ty.safe_class_name();
    let cast = ty.to_cast();
    let native = format!("Native{}", safe);
    let private = format!(
        "static_cast<{}>(static_cast<Hyperloop::AbstractObject *>(JSObjectGetPrivate(object)))",
        native
    );
    let mut code = Vec::new();

    code.push(format!("typedef Hyperloop::NativeObject<{}> * {};", cast, native));
    code.push(String::new());
    code.push(format!("static void Initialize{}(JSContextRef ctx, JSObjectRef object)", safe));
    code.push("{".to_string());
    code.push(format!("\tauto po = {};", private));
    code.push("\tif (po != nullptr)".to_string());
    code.push("\t{".to_string());
    code.push("\t\tpo->retain();".to_string());
    code.push("\t}".to_string());
    code.push("}".to_string());
    code.push(String::new());
    code.push(format!("static void Finalize{}(JSObjectRef object)", safe));
    code.push("{".to_string());
    code.push(format!("\tauto po = {};", private));
    code.push("\tif (po != nullptr)".to_string());
    code.push("\t{".to_string());
    code.push("\t\tpo->release();".to_string());
    code.push("\t}".to_string());
    code.push("}".to_string());
    code.push(String::new());
    code.push(format!(
        "static bool HasInstance{}(JSContextRef ctx, JSObjectRef constructor, JSValueRef possibleInstance, JSValueRef* exception)",
        safe
    ));
    code.push("{".to_string());
    code.push(format!(
        "\treturn JSValueIsObjectOfClass(ctx,possibleInstance,Register{}());",
        safe
    ));
    code.push("}".to_string());
    code.push(String::new());
    code.push(format!("static JSValueRef ToString{}({})", safe, BRIDGE_PARAMS));
    code.push("{".to_string());
    code.push(format!(
        "\tauto po = static_cast<{}>(static_cast<Hyperloop::AbstractObject *>(JSObjectGetPrivate(thisObject)));",
        native
    ));
    code.push("\treturn po == nullptr ? JSValueMakeNull(ctx) : po->toString(ctx,exception);".to_string());
    code.push("}".to_string());
    code.push(String::new());
    code.push(format!(
        "static JSValueRef ConvertToType{}(JSContextRef ctx, JSObjectRef object, JSType type, JSValueRef* exception)",
        safe
    ));
    code.push("{".to_string());
    code.push(format!("\tauto po = {};", private));
    code.push("\tif (po != nullptr && type == kJSTypeString)".to_string());
    code.push("\t{".to_string());
    code.push("\t\treturn po->toString(ctx,exception);".to_string());
    code.push("\t}".to_string());
    code.push("\tif (po != nullptr && type == kJSTypeNumber)".to_string());
    code.push("\t{".to_string());
    code.push("\t\treturn JSValueMakeNumber(ctx,static_cast<double>(reinterpret_cast<size_t>(po->getObject())));".to_string());
    code.push("\t}".to_string());
    code.push("\treturn nullptr;".to_string());
    code.push("}".to_string());
    code.push(String::new());
    code.push(format!("static JSStaticFunction StaticFunctions{}[] = {{", safe));
    code.push(format!(
        "\t{{ \"toString\", ToString{}, kJSPropertyAttributeDontEnum }},",
        safe
    ));
    code.push("\t{ 0, 0, 0 }".to_string());
    code.push("};".to_string());
    code.push(String::new());
    code.push(format!("JSClassRef Register{}()", safe));
    code.push("{".to_string());
    code.push("\tstatic JSClassDefinition def = kJSClassDefinitionEmpty;".to_string());
    code.push("\tstatic JSClassRef ref = nullptr;".to_string());
    code.push("\tif (ref == nullptr)".to_string());
    code.push("\t{".to_string());
    code.push(format!("\t\tdef.className = \"{}\";", c_string(display)));
    code.push(format!("\t\tdef.initialize = Initialize{};", safe));
    code.push(format!("\t\tdef.finalize = Finalize{};", safe));
    code.push(format!("\t\tdef.hasInstance = HasInstance{};", safe));
    code.push(format!("\t\tdef.convertToType = ConvertToType{};", safe));
    code.push(format!("\t\tdef.staticFunctions = StaticFunctions{};", safe));
    code.push("\t\tref = JSClassCreate(&def);".to_string());
    code.push("\t}".to_string());
    code.push("\treturn ref;".to_string());
    code.push("}".to_string());
    code.push(String::new());

    code.push(format!(
        "EXPORTAPI JSValueRef {}(JSContextRef ctx, {} value, JSValueRef *exception)",
        ty.to_script_value_name(),
        cast
    ));
    code.push("{".to_string());
    ty.to_null_check("value", "\t", &mut code);
    code.push(format!("\tauto p = new Hyperloop::NativeObject<{}>(value);", cast));
    code.push(format!(
        "\treturn JSObjectMake(ctx,Register{}(),static_cast<void *>(p));",
        safe
    ));
    code.push("}".to_string());
    code.push(String::new());

    code.push(format!(
        "EXPORTAPI {} {}(JSContextRef ctx, JSValueRef value, JSValueRef *exception)",
        cast,
        ty.to_native_name()
    ));
    code.push("{".to_string());
    code.push("\tif (JSValueIsNull(ctx,value) || JSValueIsUndefined(ctx,value))".to_string());
    code.push("\t{".to_string());
    code.push("\t\treturn nullptr;".to_string());
    code.push("\t}".to_string());
    code.push("\tif (!JSValueIsObject(ctx,value))".to_string());
    code.push("\t{".to_string());
    code.push(format!(
        "\t\t*exception = HyperloopMakeException(ctx,\"cannot convert value to {}\");",
        c_string(display)
    ));
    code.push("\t\treturn nullptr;".to_string());
    code.push("\t}".to_string());
    code.push("\tauto object = JSValueToObject(ctx,value,exception);".to_string());
    code.push(format!("\tauto po = {};", private));
    code.push("\treturn po == nullptr ? nullptr : po->getObject();".to_string());
    code.push("}".to_string());
    code.push(String::new());
    code
}

/// Writes every unit under `dir` through `cache`, returning the entries in
/// unit order. Unchanged units are left untouched on disk.
pub fn write_units(
    units: &[GeneratedUnit],
    dir: &Path,
    cache: &mut SourceCache,
) -> CompileResult<Vec<SourceEntry>> {
    let mut entries = Vec::with_capacity(units.len());
    for unit in units {
        entries.push(cache.write_source(&dir.join(&unit.name), &unit.code)?);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metabase::Metabase;
    use crate::transform;
    use pretty_assertions::assert_eq;

    const METABASE: &str = r#"{
        "classes": {
            "UIView": {
                "framework": "UIKit",
                "methods": {
                    "addSubview": [ { "returnType": "void", "args": [ { "type": "UIView *" } ] } ],
                    "viewWithTag": [ { "returnType": "UIView *", "args": [ { "type": "int" } ] } ]
                },
                "properties": {
                    "title": { "type": "char *" },
                    "tag": { "type": "int" }
                }
            }
        },
        "types": {
            "CGPoint": { "type": "struct CGPoint" },
            "struct CGPoint": {
                "type": "struct CGPoint",
                "fields": [ { "name": "x", "type": "double" }, { "name": "y", "type": "double" } ]
            },
            "Callback": { "type": "void (*)(int, void *)" }
        },
        "functions": {
            "CGPointMake": {
                "returnType": "CGPoint",
                "arguments": [ { "type": "double" }, { "type": "double" } ]
            },
            "set_callback": { "returnType": "void", "arguments": [ { "type": "Callback" } ] }
        }
    }"#;

    fn session(obfuscate: bool) -> CompileSession {
        let metabase = Arc::new(Metabase::from_json(METABASE).unwrap());
        CompileSession::new("arm64", metabase, obfuscate)
    }

    fn native_file(session: &mut CompileSession, relative: &str, source: &str) -> SourceFile {
        let out = transform::compile(session, source, relative).unwrap();
        let ir = Ir::build(&out.code, relative, &out.symbols).unwrap();
        SourceFile {
            relative: relative.to_string(),
            code: out.code,
            kind: SourceKind::Native {
                ir,
                symbols: out.symbols,
            },
        }
    }

    fn unit<'u>(units: &'u [GeneratedUnit], name: &str) -> &'u GeneratedUnit {
        units
            .iter()
            .find(|u| u.name == name)
            .unwrap_or_else(|| panic!("missing unit {}", name))
    }

    fn generate(session: &mut CompileSession, files: &[SourceFile]) -> Vec<GeneratedUnit> {
        Generator::new(session, "com.example.app", None)
            .generate_all(files)
            .unwrap()
    }

    #[test]
    fn test_class_unit_members_and_receiver_guard() {
        let mut s = session(false);
        let file = native_file(
            &mut s,
            "app.js",
            "'use hyperloop';\nvar v = new UIView();\nv.addSubview(v.viewWithTag(1));\nv.tag = 3;\n",
        );
        let units = generate(&mut s, &[file]);
        let view = unit(&units, "UIView.cpp");

        assert!(view.code.contains("JSValueRef UIView_constructor(JSContextRef ctx"));
        assert!(view.code.contains("\tauto result = new UIView();"));
        assert!(view.code.contains("\tauto result = instance->viewWithTag(arg0);"));
        assert!(view.code.contains("\tinstance->tag = arg0;"));
        assert!(view.code.contains("\tauto instance = JSValueTo_UIView(ctx,arguments[0],exception);"));
        assert!(view.code.contains("\tif (instance == nullptr)"));
        assert!(view.code.contains("UIView.addSubview expects 2 argument(s)"));
        assert!(view.code.contains("def.hasInstance = HasInstanceUIView;"));
        assert!(view.code.contains("def.convertToType = ConvertToTypeUIView;"));

        let header = unit(&units, HEADER_UNIT);
        assert!(header.code.contains("#include <UIKit/UIKit.h>"));
        assert!(header.code.contains("EXPORTAPI JSValueRef HyperloopLoad_app(JSContextRef,JSObjectRef,JSValueRef*);"));
        assert!(header.code.contains("EXPORTAPI void HyperloopInitialize_com_example_app(JSContextRef,JSObjectRef);"));
    }

    #[test]
    fn test_string_getter_marshals_once() {
        let mut s = session(false);
        let file = native_file(&mut s, "app.js", "'use hyperloop';\nvar v = new UIView();\nv.title = 'x';\n");
        let units = generate(&mut s, &[file]);
        let view = unit(&units, "UIView.cpp");
        assert_eq!(view.code.matches("HyperloopJSValueToStringCopy").count(), 1);
        assert_eq!(view.code.matches("delete [] arguments_1_buf;").count(), 1);
    }

    #[test]
    fn test_function_bridge_and_struct_wrapper() {
        let mut s = session(false);
        let file = native_file(&mut s, "app.js", "'use hyperloop';\nvar p = CGPointMake(1, 2);\n");
        let units = generate(&mut s, &[file]);

        let functions = unit(&units, FUNCTIONS_UNIT);
        assert!(functions.code.contains("JSValueRef CGPointMake_function(JSContextRef ctx"));
        assert!(functions.code.contains("\tauto result = CGPointMake(arg0,arg1);"));
        assert!(functions.code.contains("malloc(sizeof("));

        assert!(units.iter().any(|u| u.code.contains("typedef Hyperloop::NativeObject<")
            && u.code.contains("_ToJSValue(JSContextRef ctx")));
        let double = unit(&units, "type_double.cpp");
        assert!(double.code.contains("return JSValueMakeNumber(ctx,static_cast<double>(value));"));
    }

    #[test]
    fn test_types_emitted_once_per_key() {
        let mut s = session(false);
        let file = native_file(
            &mut s,
            "app.js",
            "'use hyperloop';\nvar v = new UIView();\nv.tag = v.viewWithTag(1).tag;\n",
        );
        let units = generate(&mut s, &[file]);
        let ints = units.iter().filter(|u| u.name == "type_int.cpp").count();
        assert_eq!(ints, 1);
        let mut names: Vec<&str> = units.iter().map(|u| u.name.as_str()).collect();
        let total = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), total);
    }

    #[test]
    fn test_callback_type_unit() {
        let mut s = session(false);
        let file = native_file(&mut s, "app.js", "'use hyperloop';\nset_callback(null);\n");
        let units = generate(&mut s, &[file]);
        let callback = units
            .iter()
            .find(|u| u.code.contains("_FunctionCallback("))
            .expect("callback unit");
        assert!(callback.code.contains("HyperloopInvokeFunctionCallback(arg1,argumentCount,arguments,exception);"));
    }

    #[test]
    fn test_loader_guard_and_bridge_registration() {
        let mut s = session(false);
        let file = native_file(&mut s, "lib/app.js", "'use hyperloop';\nvar v = new UIView();\nfor (;;) { break; }\n");
        let units = generate(&mut s, &[file]);
        let loader = unit(&units, "js_lib_app.cpp");

        assert!(loader.code.contains("static JSValueRef HyperloopLoad_lib_app_result = nullptr;"));
        assert!(loader.code.contains("\tif (HyperloopLoad_lib_app_result != nullptr)"));
        assert!(loader.code.contains("\tauto UIView_constructorFn = JSObjectMakeFunctionWithCallback(ctx,var4,UIView_constructor);"));
        assert!(loader.code.contains("JSEvaluateScript(ctx,"));
        assert!(loader.code.contains("\tHyperloopLoad_lib_app_result = result;"));

        // every engine call is checked before its handles are released
        let lines: Vec<&str> = loader.code.lines().map(str::trim).collect();
        for (i, line) in lines.iter().enumerate() {
            if line.starts_with("JSObjectSetProperty(ctx,object,var4") {
                assert_eq!(lines[i + 1], "CHECK_EXCEPTION(exception);");
                assert_eq!(lines[i + 2], "JSStringRelease(var4);");
            }
        }
    }

    #[test]
    fn test_embed_unit_serves_payloads() {
        let mut s = session(false);
        let files = vec![
            SourceFile {
                relative: "lib/util.js".to_string(),
                code: "module.exports = 1;".to_string(),
                kind: SourceKind::Script,
            },
            SourceFile {
                relative: "data.json".to_string(),
                code: "{\"a\": 1}".to_string(),
                kind: SourceKind::Json,
            },
        ];
        let units = generate(&mut s, &files);
        let embed_unit = unit(&units, EMBED_UNIT);
        assert!(embed_unit.code.contains("#define _HL_XOR 0xAC"));
        assert!(embed_unit.code.contains("\tif (fn == \"lib/util.js\")"));
        assert!(embed_unit.code.contains("JSValueMakeFromJSONString(ctx,"));
        assert!(embed_unit.code.contains("MODULE_NOT_FOUND"));
        assert!(embed_unit.code.contains("HyperloopRegisterEmbedSource(HyperloopLoadEmbedSource);"));
        assert!(!units.iter().any(|u| u.name.starts_with("js_")));
    }

    #[test]
    fn test_obfuscated_symbol_maps() {
        let mut s = session(true);
        let file = native_file(&mut s, "app.js", "'use hyperloop';\nvar v = new UIView();\nvar same = v == v;\n");
        let units = generate(&mut s, &[file]);

        let app: BTreeMap<String, String> =
            serde_json::from_str(&unit(&units, APP_SYMBOLS).code).unwrap();
        assert_eq!(app.get("_$a").map(String::as_str), Some("UIView_constructor"));
        let lib: BTreeMap<String, String> =
            serde_json::from_str(&unit(&units, LIB_SYMBOLS).code).unwrap();
        assert!(lib.values().any(|v| v == "Hyperloop_Binary_IsEqual"));

        let header = unit(&units, HEADER_UNIT);
        assert!(header.code.contains("#define UIView_constructor _$a"));
        assert!(header.code.contains("#define Hyperloop_Binary_IsEqual HL_"));
    }

    #[test]
    fn test_write_units_through_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = SourceCache::load(dir.path(), "o", false).unwrap();
        let units = vec![
            GeneratedUnit { name: "a.cpp".to_string(), code: "int a;".to_string() },
            GeneratedUnit { name: HEADER_UNIT.to_string(), code: "#pragma once".to_string() },
        ];
        let entries = write_units(&units, dir.path(), &mut cache).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].compile);
        assert!(!entries[1].compile);
        assert_eq!(std::fs::read_to_string(dir.path().join("a.cpp")).unwrap(), "int a;");
    }
}
