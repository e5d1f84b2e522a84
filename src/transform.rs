//! Script Transformation Module
//!
//! Rewrites native-looking script constructs in files carrying the
//! `'use hyperloop'` directive into calls of generated bridge functions, and
//! records one symbol per bridge it references.
//!
//! The pass is a read-only post-order visit over the oxc AST. Children are
//! rewritten before their parents, and every rewrite is a span replacement in
//! [`SourceEdits`]. Per-node facts (getter tags, inferred return types) are
//! keyed by the node's span, which is stable for the whole pass.

use crate::error::{
    CompileResult, CompilerError, ERR_INVALID_MEMBER, ERR_PARSE, ERR_UNDEFINED_SYMBOL,
};
use crate::metabase::{MethodDef, PropertyDef};
use crate::naming::{
    constructor_name, function_name, getter_name, is_builtin_function, method_name, setter_name,
};
use crate::rewrite::SourceEdits;
use crate::scope::{declared_names, is_builtin_object, is_global};
use crate::session::CompileSession;
use crate::symbols::{Location, Symbol, SymbolKind, SymbolTable};
use lazy_static::lazy_static;
use oxc_allocator::Allocator;
use oxc_ast::ast::*;
use oxc_ast_visit::{walk, Visit};
use oxc_parser::Parser;
use oxc_span::{GetSpan, SourceType, Span};
use regex::Regex;
use std::collections::{HashMap, HashSet};

pub const DIRECTIVE: &str = "use hyperloop";

lazy_static! {
    static ref MEMORY_RE: Regex =
        Regex::new(r"^(void|float|int|uint|long|short|ushort|double|bool|char)\s\*$").unwrap();
}

/// Result of compiling one script file.
#[derive(Debug, Clone)]
pub struct TransformOutput {
    pub code: String,
    /// False when the file has no `'use hyperloop'` directive; `code` is
    /// then the input unchanged.
    pub active: bool,
    pub symbols: SymbolTable,
}

#[derive(Debug, Clone)]
enum NodeTag {
    Getter {
        class_name: String,
        property: PropertyDef,
        /// Rewritten receiver text; `None` for static properties.
        receiver: Option<String>,
    },
    MemoryGetter {
        setter: String,
        base: String,
        index: String,
    },
}

/// What is known about the value an expression produces.
#[derive(Debug, Clone)]
struct LookupEntry {
    class_name: Option<String>,
    return_type: String,
    constructor: bool,
}

type SpanKey = (u32, u32);

fn span_key(span: Span) -> SpanKey {
    (span.start, span.end)
}

pub fn compile(
    session: &mut CompileSession,
    source: &str,
    filename: &str,
) -> CompileResult<TransformOutput> {
    let allocator = Allocator::default();
    let source_type = SourceType::default().with_module(true);
    let ret = Parser::new(&allocator, source, source_type).parse();
    if let Some(err) = ret.errors.first() {
        return Err(CompilerError::new(ERR_PARSE, &err.to_string(), filename, 1, 0)
            .with_hint("The file must be valid JavaScript before it can be compiled"));
    }

    let declared = declared_names(&ret.program);
    let mut transformer = Transformer::new(session, source, filename, declared);
    transformer.activate(&ret.program);
    if transformer.active {
        transformer.visit_program(&ret.program);
    }
    if let Some(err) = transformer.error.take() {
        return Err(err);
    }

    let active = transformer.active;
    let code = transformer.edits.finish();
    let mut symbols = std::mem::take(&mut transformer.symbols);
    if active {
        symbols.prune_unused(&code);
    }
    session.symbols.merge(&symbols);
    log::debug!(
        "[Hyperloop] {}: {} symbols{}",
        filename,
        symbols.len(),
        if active { "" } else { " (no directive)" }
    );

    Ok(TransformOutput {
        code,
        active,
        symbols,
    })
}

struct Transformer<'c, 's> {
    session: &'c mut CompileSession,
    edits: SourceEdits<'s>,
    filename: &'s str,
    line_starts: Vec<u32>,
    declared: HashSet<String>,
    active: bool,
    tags: HashMap<SpanKey, NodeTag>,
    lookup: HashMap<SpanKey, LookupEntry>,
    var_map: HashMap<String, LookupEntry>,
    /// Member expressions in callee position; never turned into getters.
    callees: HashSet<SpanKey>,
    symbols: SymbolTable,
    error: Option<CompilerError>,
}

impl<'c, 's> Transformer<'c, 's> {
    fn new(
        session: &'c mut CompileSession,
        source: &'s str,
        filename: &'s str,
        declared: HashSet<String>,
    ) -> Self {
        let mut line_starts = vec![0];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i as u32 + 1);
            }
        }
        Self {
            session,
            edits: SourceEdits::new(source),
            filename,
            line_starts,
            declared,
            active: false,
            tags: HashMap::new(),
            lookup: HashMap::new(),
            var_map: HashMap::new(),
            callees: HashSet::new(),
            symbols: SymbolTable::new(),
            error: None,
        }
    }

    fn position(&self, offset: u32) -> (u32, u32) {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        (line as u32 + 1, offset - self.line_starts[line] + 1)
    }

    fn fail_at(&self, code: &str, message: &str, span: Span) -> CompilerError {
        let (line, column) = self.position(span.start);
        CompilerError::new(code, message, self.filename, line, column)
    }

    fn check(&mut self, result: CompileResult<()>) {
        if let Err(err) = result {
            if self.error.is_none() {
                self.error = Some(err);
            }
        }
    }

    /// Only the program prologue switches rewriting on. Directives nested in
    /// function bodies are left alone.
    fn activate(&mut self, program: &Program<'_>) {
        for it in &program.directives {
            if it.directive == DIRECTIVE || it.expression.value == DIRECTIVE {
                self.active = true;
                let mut end = it.span.end;
                if self.edits.source().as_bytes().get(end as usize) == Some(&b';') {
                    end += 1;
                }
                self.edits.replace(Span::new(it.span.start, end), "");
            }
        }
    }

    fn halted(&self) -> bool {
        !self.active || self.error.is_some()
    }

    fn text(&self, span: Span) -> &'s str {
        &self.edits.source()[span.start as usize..span.end as usize]
    }

    fn is_declared(&self, name: &str) -> bool {
        self.declared.contains(name)
    }

    fn args_text(&self, args: &[Argument]) -> String {
        match (args.first(), args.last()) {
            (Some(first), Some(last)) => self
                .edits
                .render(Span::new(first.span().start, last.span().end)),
            _ => String::new(),
        }
    }

    /// Registers the bridge for `kind` and returns its script-visible key.
    #[allow(clippy::too_many_arguments)]
    fn add_symbol(
        &mut self,
        kind: SymbolKind,
        class_name: Option<&str>,
        name: &str,
        symbol_name: String,
        arg_count: usize,
        return_type: &str,
        span: Span,
    ) -> CompileResult<String> {
        let (line, column) = self.position(span.start);
        let symbol = Symbol {
            kind,
            class_name: class_name.map(String::from),
            name: name.to_string(),
            key: self.session.bridge_key(&symbol_name),
            symbol_name,
            arg_count,
            return_type: return_type.to_string(),
            location: Location {
                file: self.filename.to_string(),
                line,
                column,
            },
        };
        for ty in symbol.arg_types().iter().chain([&symbol.return_type]) {
            self.session
                .types
                .resolve(ty)
                .map_err(|e| e.at(self.filename, line, column))?;
        }
        let key = symbol.key.clone();
        self.symbols.insert(symbol);
        Ok(key)
    }

    // ───────────────────────────────────────────────────────────────────────
    // Class inference
    // ───────────────────────────────────────────────────────────────────────

    fn class_from_type(&mut self, ty: &str) -> Option<String> {
        match self.session.types.resolve(ty) {
            Ok(t) if t.is_class_like() => Some(t.class_key()),
            _ => None,
        }
    }

    fn class_from_entry(&mut self, entry: &LookupEntry) -> Option<String> {
        if entry.constructor || entry.return_type == "id" {
            return entry.class_name.clone();
        }
        let ty = entry.return_type.clone();
        self.class_from_type(&ty)
            .or_else(|| entry.class_name.clone().filter(|c| self.session.is_class(c)))
    }

    fn entry_of(&self, expr: &Expression) -> Option<LookupEntry> {
        if let Expression::ParenthesizedExpression(p) = expr {
            return self.entry_of(&p.expression);
        }
        let span = span_key(expr.span());
        if let Some(entry) = self.lookup.get(&span) {
            return Some(entry.clone());
        }
        if let Some(NodeTag::Getter { property, .. }) = self.tags.get(&span) {
            return Some(LookupEntry {
                class_name: None,
                return_type: property.ty.clone(),
                constructor: false,
            });
        }
        if let Expression::Identifier(id) = expr {
            return self.var_map.get(id.name.as_str()).cloned();
        }
        None
    }

    fn class_of(&mut self, expr: &Expression) -> Option<String> {
        let entry = self.entry_of(expr)?;
        self.class_from_entry(&entry)
    }

    fn find_property(&mut self, class_name: &str, property: &str) -> Option<PropertyDef> {
        let lookup = self.session.lookup_class(class_name).to_string();
        if let Some(found) = self.session.metabase.find_property(&lookup, property) {
            return Some(found);
        }
        let resolved = self.session.types.class_type(&lookup).ok()?;
        let field = resolved.fields().iter().find(|f| f.name == property)?;
        Some(PropertyDef {
            name: field.name.clone(),
            ty: field.raw.clone(),
            instance: true,
            ..Default::default()
        })
    }

    fn find_method(&self, class_name: &str, method: &str, argc: usize) -> Option<MethodDef> {
        let lookup = self.session.lookup_class(class_name);
        self.session.metabase.find_method(lookup, method, argc)
    }

    fn memory_type(&self, name: &str) -> Option<String> {
        let entry = self.var_map.get(name)?;
        MEMORY_RE
            .captures(&entry.return_type)
            .map(|c| c[1].to_string())
    }

    fn undefined(&self, name: &str, span: Span) -> CompilerError {
        self.fail_at(
            ERR_UNDEFINED_SYMBOL,
            &format!("{} is an undefined symbol", name),
            span,
        )
        .with_hint("Declare it, or check the spelling against the native framework")
    }

    fn is_known_name(&self, name: &str) -> bool {
        self.is_declared(name)
            || is_global(name)
            || is_builtin_object(name)
            || self.session.metabase.is_valid_symbol(name)
            || self.session.is_class(name)
    }

    // ───────────────────────────────────────────────────────────────────────
    // Rewrites
    // ───────────────────────────────────────────────────────────────────────

    fn rewrite_new(&mut self, it: &NewExpression) -> CompileResult<()> {
        let class_name = match &it.callee {
            Expression::Identifier(id) => id.name.to_string(),
            Expression::StaticMemberExpression(_) => self.text(it.callee.span()).to_string(),
            _ => return Ok(()),
        };
        if self.var_map.contains_key(&class_name) && !self.session.is_class(&class_name) {
            return Ok(());
        }
        if !self.session.is_class(&class_name) {
            if !class_name.contains('.') && !self.is_known_name(&class_name) {
                return Err(self.undefined(&class_name, it.callee.span()));
            }
            return Ok(());
        }

        let key = self.add_symbol(
            SymbolKind::Constructor,
            Some(&class_name),
            "constructor",
            constructor_name(&class_name),
            it.arguments.len(),
            &format!("{} *", class_name),
            it.span,
        )?;
        let args = self.args_text(&it.arguments);
        self.edits.replace(it.span, format!("{}({})", key, args));
        self.lookup.insert(
            span_key(it.span),
            LookupEntry {
                class_name: Some(class_name.clone()),
                return_type: format!("{} *", class_name),
                constructor: true,
            },
        );
        Ok(())
    }

    fn rewrite_static_member(&mut self, it: &StaticMemberExpression) -> CompileResult<()> {
        if self.callees.contains(&span_key(it.span)) {
            return Ok(());
        }
        let property = it.property.name.as_str();

        // `Class.field`, possibly with a dotted class name.
        let printed = self.text(it.span);
        if let Some(dot) = printed.rfind('.') {
            let class_name = printed[..dot].trim().to_string();
            if self.session.is_class(&class_name) && !self.var_map.contains_key(&class_name) {
                let Some(prop) = self.find_property(&class_name, property) else {
                    return Ok(());
                };
                if prop.instance {
                    return Err(self.fail_at(
                        ERR_INVALID_MEMBER,
                        &format!(
                            "Invalid field access for {}, this is not a static field",
                            printed
                        ),
                        it.span,
                    ));
                }
                let key = self.add_symbol(
                    SymbolKind::Getter(prop.clone()),
                    Some(&class_name),
                    property,
                    getter_name(&class_name, property),
                    0,
                    &prop.ty,
                    it.span,
                )?;
                self.edits.replace(it.span, format!("{}()", key));
                self.tags.insert(
                    span_key(it.span),
                    NodeTag::Getter {
                        class_name,
                        property: prop,
                        receiver: None,
                    },
                );
                return Ok(());
            }
        }

        if is_builtin_function(property) {
            return Ok(());
        }
        let Some(class_name) = self.class_of(&it.object) else {
            return Ok(());
        };
        let Some(prop) = self.find_property(&class_name, property) else {
            return Ok(());
        };
        if !prop.instance {
            return Ok(());
        }
        let receiver = self.edits.render(it.object.span());
        let key = self.add_symbol(
            SymbolKind::Getter(prop.clone()),
            Some(&class_name),
            property,
            getter_name(&class_name, property),
            1,
            &prop.ty,
            it.span,
        )?;
        self.edits.replace(it.span, format!("{}({})", key, receiver));
        self.tags.insert(
            span_key(it.span),
            NodeTag::Getter {
                class_name,
                property: prop,
                receiver: Some(receiver),
            },
        );
        Ok(())
    }

    fn rewrite_computed_member(&mut self, it: &ComputedMemberExpression) -> CompileResult<()> {
        let Expression::Identifier(base) = &it.object else {
            return Ok(());
        };
        let Some(ty) = self.memory_type(base.name.as_str()) else {
            return Ok(());
        };
        let getter = format!("Hyperloop_Memory_Get_{}", ty);
        let setter = format!("Hyperloop_Memory_Set_{}", ty);
        self.session.record_builtin(&getter);
        let base_text = base.name.to_string();
        let index = self.edits.render(it.expression.span());
        self.edits
            .replace(it.span, format!("{}({}, {})", getter, base_text, index));
        self.tags.insert(
            span_key(it.span),
            NodeTag::MemoryGetter {
                setter,
                base: base_text,
                index,
            },
        );
        Ok(())
    }

    fn rewrite_assignment(&mut self, it: &AssignmentExpression) -> CompileResult<()> {
        let compound = it.operator != AssignmentOperator::Assign;
        let op = it.operator.as_str().trim_end_matches('=');
        let left_span = it.left.span();

        if let AssignmentTarget::AssignmentTargetIdentifier(id) = &it.left {
            let Some(ty) = self.memory_type(id.name.as_str()) else {
                return Ok(());
            };
            if compound {
                return Err(self.memory_op_error(op, it.span));
            }
            let setter = format!("Hyperloop_Memory_Set_{}", ty);
            self.session.record_builtin(&setter);
            let value = self.edits.render(it.right.span());
            self.edits
                .replace(it.span, format!("{}({}, 0, {})", setter, id.name, value));
            return Ok(());
        }

        match self.tags.get(&span_key(left_span)).cloned() {
            Some(NodeTag::MemoryGetter {
                setter,
                base,
                index,
            }) => {
                if compound {
                    return Err(self.memory_op_error(op, it.span));
                }
                self.session.record_builtin(&setter);
                let value = self.edits.render(it.right.span());
                self.edits.replace(
                    it.span,
                    format!("{}({}, {}, {})", setter, base, index, value),
                );
                Ok(())
            }
            Some(NodeTag::Getter {
                class_name,
                property,
                receiver,
            }) => {
                if property.is_readonly() {
                    return Err(self.fail_at(
                        ERR_INVALID_MEMBER,
                        &format!(
                            "Cannot assign to readonly property {} of class {}",
                            property.name, class_name
                        ),
                        left_span,
                    ));
                }
                let mut value = self.edits.render(it.right.span());
                if let Expression::Identifier(id) = &it.right {
                    if property.ty.starts_with("enum ") && !self.is_declared(&id.name) {
                        let enum_type = property.subtype.as_deref().unwrap_or(&property.ty);
                        if let Some(v) = self.session.metabase.enum_value(enum_type, &id.name) {
                            value = v;
                        }
                    }
                }
                if compound {
                    value = format!("({} {} {})", self.edits.render(left_span), op, value);
                }

                let key = self.add_symbol(
                    SymbolKind::Setter(property.clone()),
                    Some(&class_name),
                    &property.name,
                    setter_name(&class_name, &property.name),
                    if receiver.is_some() { 2 } else { 1 },
                    "void",
                    it.span,
                )?;
                let call = match &receiver {
                    Some(recv) => format!("{}({}, {})", key, recv, value),
                    None => format!("{}({})", key, value),
                };

                // Writing a field of a struct returned by a getter must be
                // stored back through the owner's setter.
                let owner = match &it.left {
                    AssignmentTarget::StaticMemberExpression(m) => {
                        self.tags.get(&span_key(m.object.span())).cloned()
                    }
                    _ => None,
                };
                let text = match owner {
                    Some(NodeTag::Getter {
                        class_name: owner_class,
                        property: owner_prop,
                        receiver: Some(owner_recv),
                    }) if !owner_prop.is_readonly() => {
                        let owner_key = self.add_symbol(
                            SymbolKind::Setter(owner_prop.clone()),
                            Some(&owner_class),
                            &owner_prop.name,
                            setter_name(&owner_class, &owner_prop.name),
                            2,
                            "void",
                            it.span,
                        )?;
                        let owner_value = receiver.unwrap_or_default();
                        format!(
                            "({}, {}({}, {}))",
                            call, owner_key, owner_recv, owner_value
                        )
                    }
                    _ => call,
                };
                self.edits.replace(it.span, text);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn memory_op_error(&self, op: &str, span: Span) -> CompilerError {
        self.fail_at(
            ERR_INVALID_MEMBER,
            &format!("Binary operation for void* type does not support '{}'", op),
            span,
        )
    }

    fn rewrite_binary(&mut self, it: &BinaryExpression) -> CompileResult<()> {
        let bridge = match it.operator {
            BinaryOperator::Equality => "Hyperloop_Binary_IsEqual",
            BinaryOperator::StrictEquality => "Hyperloop_Binary_IsStrictEqual",
            BinaryOperator::Instanceof => "Hyperloop_Binary_InstanceOf",
            _ => return Ok(()),
        };
        let left_known = self.class_of(&it.left).is_some();
        let right_known = self.class_of(&it.right).is_some()
            || matches!(&it.right, Expression::Identifier(id) if self.session.is_class(&id.name));
        if !left_known && !right_known {
            return Ok(());
        }
        self.session.record_builtin(bridge);
        let left = self.edits.render(it.left.span());
        let right = self.edits.render(it.right.span());
        self.edits
            .replace(it.span, format!("{}({}, {})", bridge, left, right));
        Ok(())
    }

    fn rewrite_call(&mut self, it: &CallExpression) -> CompileResult<()> {
        if let Some(chain) = command_chain(it) {
            return self.rewrite_command(it, chain);
        }

        match &it.callee {
            Expression::StaticMemberExpression(member) => {
                let method = member.property.name.as_str();
                if method == "cast" && it.arguments.len() == 1 {
                    if let Some(target) = argument_name(&it.arguments[0]) {
                        let receiver = self.edits.render(member.object.span());
                        self.edits.replace(it.span, receiver);
                        self.lookup.insert(
                            span_key(it.span),
                            LookupEntry {
                                class_name: Some(target.clone()),
                                return_type: target,
                                constructor: false,
                            },
                        );
                        return Ok(());
                    }
                }

                let object_text = self.text(member.object.span()).to_string();
                if self.session.is_class(&object_text) && !self.var_map.contains_key(&object_text)
                {
                    return self.rewrite_static_call(it, &object_text, method);
                }

                if let Some(class_name) = self.class_of(&member.object) {
                    let receiver = self.edits.render(member.object.span());
                    return self.rewrite_instance_call(it, &class_name, method, &receiver);
                }

                if let Expression::Identifier(id) = &member.object {
                    if !self.is_known_name(&id.name) {
                        return Err(self.undefined(&id.name, id.span));
                    }
                }
                Ok(())
            }
            Expression::Identifier(id) => {
                let name = id.name.as_str();
                if self.is_declared(name) {
                    return Ok(());
                }
                if let Some(func) = self.session.metabase.function(name).cloned() {
                    let key = self.add_symbol(
                        SymbolKind::Function(func.clone()),
                        None,
                        name,
                        function_name(name),
                        it.arguments.len(),
                        &func.return_type,
                        it.span,
                    )?;
                    self.edits.replace(id.span, key);
                    self.lookup.insert(
                        span_key(it.span),
                        LookupEntry {
                            class_name: None,
                            return_type: func.return_type.clone(),
                            constructor: false,
                        },
                    );
                    return Ok(());
                }
                if !self.is_known_name(name) {
                    return Err(self.undefined(name, id.span));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn rewrite_static_call(
        &mut self,
        it: &CallExpression,
        class_name: &str,
        method: &str,
    ) -> CompileResult<()> {
        let Some(def) = self.find_method(class_name, method, it.arguments.len()) else {
            return Err(self.missing_method(method, class_name, it.span));
        };
        let key = self.add_symbol(
            SymbolKind::StaticMethod(def.clone()),
            Some(class_name),
            method,
            method_name(class_name, method),
            it.arguments.len(),
            &def.return_type,
            it.span,
        )?;
        let args = self.args_text(&it.arguments);
        self.edits.replace(it.span, format!("{}({})", key, args));
        self.lookup.insert(
            span_key(it.span),
            LookupEntry {
                class_name: Some(class_name.to_string()),
                return_type: def.return_type,
                constructor: false,
            },
        );
        Ok(())
    }

    fn rewrite_instance_call(
        &mut self,
        it: &CallExpression,
        class_name: &str,
        method: &str,
        receiver: &str,
    ) -> CompileResult<()> {
        let def = if is_builtin_function(method) {
            MethodDef {
                name: method.to_string(),
                return_type: "char *".to_string(),
                ..Default::default()
            }
        } else {
            match self.find_method(class_name, method, it.arguments.len()) {
                Some(def) => def,
                None => return Err(self.missing_method(method, class_name, it.span)),
            }
        };
        let key = self.add_symbol(
            SymbolKind::InstanceMethod(def.clone()),
            Some(class_name),
            method,
            method_name(class_name, method),
            it.arguments.len() + 1,
            &def.return_type,
            it.span,
        )?;
        let args = self.args_text(&it.arguments);
        let text = if args.is_empty() {
            format!("{}({})", key, receiver)
        } else {
            format!("{}({}, {})", key, receiver, args)
        };
        self.edits.replace(it.span, text);
        self.lookup.insert(
            span_key(it.span),
            LookupEntry {
                class_name: Some(class_name.to_string()),
                return_type: def.return_type,
                constructor: false,
            },
        );
        Ok(())
    }

    fn missing_method(&self, method: &str, class_name: &str, span: Span) -> CompilerError {
        self.fail_at(
            ERR_INVALID_MEMBER,
            &format!("couldn't find method {} for class {}", method, class_name),
            span,
        )
    }

    fn rewrite_command(
        &mut self,
        it: &CallExpression,
        chain: Vec<(String, Vec<&Argument>)>,
    ) -> CompileResult<()> {
        let command = chain[0].0.clone();
        match command.as_str() {
            "method" => {
                if chain.last().map(|(n, _)| n.as_str()) != Some("call") {
                    return Ok(());
                }
                let method_args = &chain[0].1;
                if method_args.len() < 2 {
                    return Err(self.fail_at(
                        ERR_INVALID_MEMBER,
                        "hyperloop method `call` command requires at least two arguments: (1) class/instance reference and (2) method",
                        it.span,
                    ));
                }
                let Some(method) = argument_name(method_args[1]) else {
                    return Err(self.fail_at(
                        ERR_INVALID_MEMBER,
                        "hyperloop method name must be a string literal",
                        method_args[1].span(),
                    ));
                };
                let call_args: Vec<String> = chain
                    .last()
                    .map(|(_, args)| args.iter().map(|a| self.edits.render(a.span())).collect())
                    .unwrap_or_default();
                let target = method_args[0];
                let target_text = self.text(target.span()).to_string();

                if self.session.is_class(&target_text) && !self.var_map.contains_key(&target_text)
                {
                    let def = self
                        .find_method(&target_text, &method, call_args.len())
                        .ok_or_else(|| self.missing_method(&method, &target_text, it.span))?;
                    let key = self.add_symbol(
                        SymbolKind::StaticMethod(def.clone()),
                        Some(&target_text),
                        &method,
                        method_name(&target_text, &method),
                        call_args.len(),
                        &def.return_type,
                        it.span,
                    )?;
                    self.edits
                        .replace(it.span, format!("{}({})", key, call_args.join(", ")));
                    self.lookup.insert(
                        span_key(it.span),
                        LookupEntry {
                            class_name: Some(target_text),
                            return_type: def.return_type,
                            constructor: false,
                        },
                    );
                    return Ok(());
                }

                let class_name = target
                    .as_expression()
                    .and_then(|e| self.class_of(e))
                    .ok_or_else(|| {
                        self.fail_at(
                            ERR_INVALID_MEMBER,
                            &format!(
                                "couldn't determine the class of {} for method {}",
                                target_text, method
                            ),
                            target.span(),
                        )
                    })?;
                let def = self
                    .find_method(&class_name, &method, call_args.len())
                    .ok_or_else(|| self.missing_method(&method, &class_name, it.span))?;
                let receiver = self.edits.render(target.span());
                let key = self.add_symbol(
                    SymbolKind::InstanceMethod(def.clone()),
                    Some(&class_name),
                    &method,
                    method_name(&class_name, &method),
                    call_args.len() + 1,
                    &def.return_type,
                    it.span,
                )?;
                let mut all = vec![receiver];
                all.extend(call_args);
                self.edits
                    .replace(it.span, format!("{}({})", key, all.join(", ")));
                self.lookup.insert(
                    span_key(it.span),
                    LookupEntry {
                        class_name: Some(class_name),
                        return_type: def.return_type,
                        constructor: false,
                    },
                );
                Ok(())
            }
            "defineClass" => {
                if chain.last().map(|(n, _)| n.as_str()) != Some("build") {
                    return Ok(());
                }
                let Some(name) = chain[0].1.first().and_then(|a| argument_name(a)) else {
                    return Err(self.fail_at(
                        ERR_INVALID_MEMBER,
                        "hyperloop defineClass command requires a class name",
                        it.span,
                    ));
                };
                let superclass = chain
                    .iter()
                    .find(|(n, _)| n == "extends")
                    .and_then(|(_, args)| args.first().and_then(|a| argument_name(a)));
                if let Some(base) = &superclass {
                    if !self.session.is_class(base) {
                        return Err(self.undefined(base, it.span));
                    }
                }
                self.session
                    .register_custom_class(&name, superclass.as_deref());
                let key = self.add_symbol(
                    SymbolKind::Constructor,
                    Some(&name),
                    "constructor",
                    constructor_name(&name),
                    0,
                    &format!("{} *", name),
                    it.span,
                )?;
                self.edits.replace(it.span, key);
                Ok(())
            }
            other => Err(self.fail_at(
                ERR_INVALID_MEMBER,
                &format!("hyperloop command: {} not supported", other),
                it.span,
            )),
        }
    }

    fn record_declarator(&mut self, it: &VariableDeclarator) {
        let (BindingPattern::BindingIdentifier(id), Some(init)) = (&it.id, &it.init) else {
            return;
        };
        if let Some(entry) = self.entry_of(init) {
            self.var_map.insert(id.name.to_string(), entry);
        }
    }
}

/// Name written either as an identifier or a string literal.
fn argument_name(arg: &Argument) -> Option<String> {
    match arg {
        Argument::Identifier(id) => Some(id.name.to_string()),
        Argument::StringLiteral(s) => Some(s.value.to_string()),
        _ => None,
    }
}

/// `Hyperloop.a(..).b(..).c(..)` as `[(a, args), (b, args), (c, args)]`.
fn command_chain<'b, 'a>(
    call: &'b CallExpression<'a>,
) -> Option<Vec<(String, Vec<&'b Argument<'a>>)>> {
    let mut chain = Vec::new();
    let mut current = call;
    loop {
        let Expression::StaticMemberExpression(member) = &current.callee else {
            return None;
        };
        chain.push((
            member.property.name.to_string(),
            current.arguments.iter().collect::<Vec<_>>(),
        ));
        match &member.object {
            Expression::Identifier(id) if id.name == "Hyperloop" => break,
            Expression::CallExpression(inner) => current = &**inner,
            _ => return None,
        }
    }
    chain.reverse();
    Some(chain)
}

impl<'a> Visit<'a> for Transformer<'_, '_> {
    fn visit_new_expression(&mut self, it: &NewExpression<'a>) {
        walk::walk_new_expression(self, it);
        if self.halted() {
            return;
        }
        let result = self.rewrite_new(it);
        self.check(result);
    }

    fn visit_call_expression(&mut self, it: &CallExpression<'a>) {
        if let Expression::StaticMemberExpression(member) = &it.callee {
            self.callees.insert(span_key(member.span));
        }
        walk::walk_call_expression(self, it);
        if self.halted() {
            return;
        }
        let result = self.rewrite_call(it);
        self.check(result);
    }

    fn visit_static_member_expression(&mut self, it: &StaticMemberExpression<'a>) {
        walk::walk_static_member_expression(self, it);
        if self.halted() {
            return;
        }
        let result = self.rewrite_static_member(it);
        self.check(result);
    }

    fn visit_computed_member_expression(&mut self, it: &ComputedMemberExpression<'a>) {
        walk::walk_computed_member_expression(self, it);
        if self.halted() {
            return;
        }
        let result = self.rewrite_computed_member(it);
        self.check(result);
    }

    fn visit_assignment_expression(&mut self, it: &AssignmentExpression<'a>) {
        walk::walk_assignment_expression(self, it);
        if self.halted() {
            return;
        }
        let result = self.rewrite_assignment(it);
        self.check(result);
    }

    fn visit_binary_expression(&mut self, it: &BinaryExpression<'a>) {
        walk::walk_binary_expression(self, it);
        if self.halted() {
            return;
        }
        let result = self.rewrite_binary(it);
        self.check(result);
    }

    fn visit_variable_declarator(&mut self, it: &VariableDeclarator<'a>) {
        walk::walk_variable_declarator(self, it);
        if self.halted() {
            return;
        }
        self.record_declarator(it);
    }
}
