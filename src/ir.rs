//! Intermediate Representation Module
//!
//! Reduces a rewritten script file to a flat list of nodes that the loader
//! unit can emit directly: literal bindings, bridge calls and their results
//! become native engine calls, and everything else stays script source that
//! the engine evaluates at load time.

use crate::error::{CompileResult, CompilerError, ERR_PARSE, ERR_UNHANDLED_STATEMENT};
use crate::naming::{c_string, VarNames};
use crate::symbols::SymbolTable;
use oxc_allocator::Allocator;
use oxc_ast::ast::*;
use oxc_parser::Parser;
use oxc_span::{GetSpan, SourceType, Span};
use serde::Serialize;
use std::collections::HashSet;

pub const API_VERSION: &str = "1";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Literal {
    /// Numeric literal as written.
    Number(String),
    Boolean(bool),
    String(String),
    Null,
    Undefined,
}

impl Literal {
    pub fn metatype(&self) -> &'static str {
        match self {
            Literal::Number(_) => "number",
            Literal::Boolean(_) => "boolean",
            Literal::String(_) => "string",
            Literal::Null => "null",
            Literal::Undefined => "undefined",
        }
    }

    pub fn text(&self) -> String {
        match self {
            Literal::Number(n) => n.clone(),
            Literal::Boolean(b) => b.to_string(),
            Literal::String(s) => s.clone(),
            Literal::Null => "null".to_string(),
            Literal::Undefined => "undefined".to_string(),
        }
    }

    /// Lines producing the engine value, assigned through `target`.
    fn to_native(&self, target: &str, names: &mut VarNames, code: &mut Vec<String>) {
        match self {
            Literal::Number(n) => code.push(format!("{}JSValueMakeNumber(ctx,{});", target, n)),
            Literal::Boolean(b) => code.push(format!("{}JSValueMakeBoolean(ctx,{});", target, b)),
            Literal::String(s) => {
                let v = names.make();
                code.push(format!(
                    "auto {} = JSStringCreateWithUTF8CString(\"{}\");",
                    v,
                    c_string(s)
                ));
                code.push(format!("{}JSValueMakeString(ctx,{});", target, v));
                code.push(format!("JSStringRelease({});", v));
            }
            Literal::Null => code.push(format!("{}JSValueMakeNull(ctx);", target)),
            Literal::Undefined => code.push(format!("{}JSValueMakeUndefined(ctx);", target)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "metatype", content = "value", rename_all = "lowercase")]
pub enum Argument {
    Value(Literal),
    Variable(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeCall {
    /// Script-visible bridge key.
    pub name: String,
    pub symbol_name: String,
    pub arguments: Vec<Argument>,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum VariableValue {
    Literal(Literal),
    /// Copy of another script variable.
    Copy(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub name: String,
    pub value: VariableValue,
    pub is_const: bool,
    pub line: u32,
}

impl Variable {
    pub fn is_static(&self) -> bool {
        matches!(self.value, VariableValue::Literal(_))
    }

    pub fn metatype(&self) -> &'static str {
        match &self.value {
            VariableValue::Literal(l) => l.metatype(),
            VariableValue::Copy(_) => "variable",
        }
    }

    pub fn value_text(&self) -> String {
        match &self.value {
            VariableValue::Literal(l) => l.text(),
            VariableValue::Copy(name) => name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "nodetype", rename_all = "lowercase")]
pub enum Node {
    Variable(Variable),
    Assignment {
        name: String,
        expression: BridgeCall,
        line: u32,
    },
    Expression(BridgeCall),
    Code {
        code: String,
        line: u32,
    },
}

/// IR of one source file.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Ir {
    pub filename: String,
    pub nodes: Vec<Node>,
    /// Script names bound by native-emitted nodes, in binding order.
    pub declared: Vec<String>,
}

impl Ir {
    /// Reduces `source`, the rewritten text of `filename`, to IR nodes.
    /// Calls are recognized by their bridge key in `symbols`.
    pub fn build(source: &str, filename: &str, symbols: &SymbolTable) -> CompileResult<Ir> {
        let allocator = Allocator::default();
        let source_type = SourceType::default().with_module(true);
        let ret = Parser::new(&allocator, source, source_type).parse();
        if let Some(err) = ret.errors.first() {
            return Err(CompilerError::new(ERR_PARSE, &err.to_string(), filename, 1, 0)
                .with_context(source.to_string()));
        }

        let mut builder = Builder {
            source,
            filename,
            symbols,
            line_starts: line_starts(source),
            bound: HashSet::new(),
            ir: Ir {
                filename: filename.to_string(),
                ..Default::default()
            },
        };
        for stmt in &ret.program.body {
            builder.statement(stmt)?;
        }
        let mut ir = builder.ir;
        ir.coalesce();
        log::debug!("[Hyperloop] {}: {} IR nodes", filename, ir.nodes.len());
        Ok(ir)
    }

    /// Merges adjacent `Code` nodes, inserting `;` only where the first one
    /// does not already end with it.
    pub fn coalesce(&mut self) {
        let mut merged: Vec<Node> = Vec::with_capacity(self.nodes.len());
        for node in self.nodes.drain(..) {
            if let (
                Some(Node::Code { code: prev, .. }),
                Node::Code { code: next, .. },
            ) = (merged.last_mut(), &node)
            {
                if !prev.ends_with(';') {
                    prev.push(';');
                }
                prev.push_str(next);
                continue;
            }
            merged.push(node);
        }
        self.nodes = merged;
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "nodes": self.nodes,
            "apiversion": API_VERSION,
        })
    }

    /// Native statements for every node, in order. Temporaries come from
    /// `names`, which the caller scopes to the enclosing unit.
    pub fn to_native(&self, names: &mut VarNames) -> Vec<String> {
        let mut emitter = Emitter {
            filename: &self.filename,
            names,
            declared: HashSet::new(),
        };
        let mut code = Vec::new();
        for node in &self.nodes {
            emitter.node(node, &mut code);
        }
        code
    }
}

fn line_starts(source: &str) -> Vec<u32> {
    let mut starts = vec![0];
    for (i, b) in source.bytes().enumerate() {
        if b == b'\n' {
            starts.push(i as u32 + 1);
        }
    }
    starts
}

struct Builder<'s> {
    source: &'s str,
    filename: &'s str,
    symbols: &'s SymbolTable,
    line_starts: Vec<u32>,
    /// Names a native node has bound so far; only these may be passed to a
    /// bridge as variable arguments.
    bound: HashSet<String>,
    ir: Ir,
}

impl<'s> Builder<'s> {
    fn line(&self, span: Span) -> u32 {
        match self.line_starts.binary_search(&span.start) {
            Ok(i) => i as u32 + 1,
            Err(i) => i as u32,
        }
    }

    fn text(&self, span: Span) -> &'s str {
        &self.source[span.start as usize..span.end as usize]
    }

    fn bind(&mut self, name: &str) {
        if self.bound.insert(name.to_string()) {
            self.ir.declared.push(name.to_string());
        }
    }

    fn code(&mut self, code: String, span: Span) {
        let line = self.line(span);
        self.ir.nodes.push(Node::Code { code, line });
    }

    fn statement(&mut self, stmt: &Statement) -> CompileResult<()> {
        match stmt {
            Statement::EmptyStatement(_) => Ok(()),
            Statement::VariableDeclaration(decl) => {
                self.declaration(decl);
                Ok(())
            }
            Statement::ExpressionStatement(expr) => {
                self.expression_statement(expr);
                Ok(())
            }
            Statement::BlockStatement(_)
            | Statement::BreakStatement(_)
            | Statement::ContinueStatement(_)
            | Statement::DebuggerStatement(_)
            | Statement::DoWhileStatement(_)
            | Statement::ForInStatement(_)
            | Statement::ForOfStatement(_)
            | Statement::ForStatement(_)
            | Statement::IfStatement(_)
            | Statement::LabeledStatement(_)
            | Statement::ReturnStatement(_)
            | Statement::SwitchStatement(_)
            | Statement::ThrowStatement(_)
            | Statement::TryStatement(_)
            | Statement::WhileStatement(_)
            | Statement::WithStatement(_)
            | Statement::FunctionDeclaration(_)
            | Statement::ClassDeclaration(_) => {
                let span = stmt.span();
                self.code(self.text(span).to_string(), span);
                Ok(())
            }
            other => {
                let span = other.span();
                Err(CompilerError::new(
                    ERR_UNHANDLED_STATEMENT,
                    "statement kind has no IR rule",
                    self.filename,
                    self.line(span),
                    0,
                )
                .with_context(self.text(span).to_string()))
            }
        }
    }

    fn declaration(&mut self, decl: &VariableDeclaration) {
        let keyword = decl.kind.as_str();
        let is_const = decl.kind == VariableDeclarationKind::Const;
        for declarator in &decl.declarations {
            let BindingPattern::BindingIdentifier(id) = &declarator.id else {
                let span = declarator.span;
                self.code(format!("{} {};", keyword, self.text(span)), span);
                continue;
            };
            let name = id.name.to_string();
            let line = self.line(declarator.span);

            let node = match &declarator.init {
                None => Some(Node::Variable(Variable {
                    name: name.clone(),
                    value: VariableValue::Literal(Literal::Undefined),
                    is_const,
                    line,
                })),
                Some(init) => {
                    if let Some(expression) = self.bridge_call(init) {
                        Some(Node::Assignment {
                            name: name.clone(),
                            expression,
                            line,
                        })
                    } else if let Some(literal) = literal(init, self.source) {
                        Some(Node::Variable(Variable {
                            name: name.clone(),
                            value: VariableValue::Literal(literal),
                            is_const,
                            line,
                        }))
                    } else {
                        match init {
                            Expression::Identifier(other) if self.bound.contains(other.name.as_str()) => {
                                Some(Node::Variable(Variable {
                                    name: name.clone(),
                                    value: VariableValue::Copy(other.name.to_string()),
                                    is_const,
                                    line,
                                }))
                            }
                            _ => None,
                        }
                    }
                }
            };

            match node {
                Some(node) => {
                    self.ir.nodes.push(node);
                    self.bind(&name);
                }
                None => {
                    // The engine now owns the name; a stale native binding
                    // must not be passed to later bridge calls.
                    self.bound.remove(&name);
                    let span = declarator.span;
                    self.code(format!("{} {};", keyword, self.text(span)), span);
                }
            }
        }
    }

    fn expression_statement(&mut self, stmt: &ExpressionStatement) {
        let span = stmt.span;
        match &stmt.expression {
            Expression::CallExpression(_) => {
                if let Some(expression) = self.bridge_call(&stmt.expression) {
                    self.ir.nodes.push(Node::Expression(expression));
                    return;
                }
            }
            Expression::AssignmentExpression(assign)
                if assign.operator == AssignmentOperator::Assign =>
            {
                if let AssignmentTarget::AssignmentTargetIdentifier(id) = &assign.left {
                    if let Some(expression) = self.bridge_call(&assign.right) {
                        let name = id.name.to_string();
                        self.ir.nodes.push(Node::Assignment {
                            name: name.clone(),
                            expression,
                            line: self.line(span),
                        });
                        self.bind(&name);
                        return;
                    }
                    self.bound.remove(id.name.as_str());
                }
            }
            _ => {}
        }
        self.code(self.text(span).to_string(), span);
    }

    /// A call of a recorded bridge whose arguments are all literals or
    /// natively bound variables.
    fn bridge_call(&self, expr: &Expression) -> Option<BridgeCall> {
        let Expression::CallExpression(call) = expr else {
            return None;
        };
        let Expression::Identifier(callee) = &call.callee else {
            return None;
        };
        let symbol = self.symbols.get(callee.name.as_str())?;
        let mut arguments = Vec::with_capacity(call.arguments.len());
        for arg in &call.arguments {
            let value = arg.as_expression()?;
            if let Some(literal) = literal(value, self.source) {
                arguments.push(Argument::Value(literal));
                continue;
            }
            match value {
                Expression::Identifier(id) if self.bound.contains(id.name.as_str()) => {
                    arguments.push(Argument::Variable(id.name.to_string()))
                }
                _ => return None,
            }
        }
        Some(BridgeCall {
            name: symbol.key.clone(),
            symbol_name: symbol.symbol_name.clone(),
            arguments,
            line: self.line(call.span),
        })
    }
}

fn literal(expr: &Expression, source: &str) -> Option<Literal> {
    match expr {
        Expression::NumericLiteral(n) => Some(Literal::Number(
            source[n.span.start as usize..n.span.end as usize].to_string(),
        )),
        Expression::StringLiteral(s) => Some(Literal::String(s.value.to_string())),
        Expression::BooleanLiteral(b) => Some(Literal::Boolean(b.value)),
        Expression::NullLiteral(_) => Some(Literal::Null),
        Expression::Identifier(id) if id.name == "undefined" => Some(Literal::Undefined),
        Expression::UnaryExpression(u) => {
            let sign = match u.operator {
                UnaryOperator::UnaryNegation => "-",
                UnaryOperator::UnaryPlus => "",
                _ => return None,
            };
            match literal(&u.argument, source)? {
                Literal::Number(n) => Some(Literal::Number(format!("{}{}", sign, n))),
                _ => None,
            }
        }
        Expression::ParenthesizedExpression(p) => literal(&p.expression, source),
        _ => None,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// NATIVE EMISSION
// ═══════════════════════════════════════════════════════════════════════════════
//
// Every statement: allocate engine strings, invoke, check the exception slot,
// release.

struct Emitter<'a> {
    filename: &'a str,
    names: &'a mut VarNames,
    /// C locals already declared in this unit.
    declared: HashSet<String>,
}

impl Emitter<'_> {
    fn assign_prefix(&mut self, target: Option<&str>) -> String {
        match target {
            None => String::new(),
            Some(t) if t.contains('[') || self.declared.contains(t) => format!("{} = ", t),
            Some(t) => {
                self.declared.insert(t.to_string());
                format!("auto {} = ", t)
            }
        }
    }

    fn node(&mut self, node: &Node, code: &mut Vec<String>) {
        match node {
            Node::Variable(var) => self.variable(var, code),
            Node::Assignment {
                name,
                expression,
                line,
            } => {
                code.push(format!("// assignment {}:{}", name, line));
                self.expression(expression, Some(name), code);
                self.publish(name, "0", code);
            }
            Node::Expression(expression) => self.expression(expression, None, code),
            Node::Code { code: source, line } => {
                code.push(format!("// sourcecode:{}", line));
                let v = self.names.make();
                let f = self.names.make();
                code.push(format!(
                    "auto {} = JSStringCreateWithUTF8CString(\"{}\");",
                    v,
                    c_string(source)
                ));
                code.push(format!(
                    "auto {} = JSStringCreateWithUTF8CString(\"{}\");",
                    f,
                    c_string(self.filename)
                ));
                code.push(format!(
                    "JSEvaluateScript(ctx,{},object,{},{},exception);",
                    v, f, line
                ));
                code.push("CHECK_EXCEPTION(exception);".to_string());
                code.push(format!("JSStringRelease({});", v));
                code.push(format!("JSStringRelease({});", f));
                code.push(String::new());
            }
        }
    }

    /// Exposes the C local `name` as a property of the global object.
    fn publish(&mut self, name: &str, attributes: &str, code: &mut Vec<String>) {
        let v = self.names.make();
        code.push(format!(
            "auto {} = JSStringCreateWithUTF8CString(\"{}\");",
            v, name
        ));
        code.push(format!(
            "JSObjectSetProperty(ctx,object,{},{},{},exception);",
            v, name, attributes
        ));
        code.push("CHECK_EXCEPTION(exception);".to_string());
        code.push(format!("JSStringRelease({});", v));
        code.push(String::new());
    }

    fn variable(&mut self, var: &Variable, code: &mut Vec<String>) {
        let attributes = if var.is_const {
            "kJSPropertyAttributeDontDelete|kJSPropertyAttributeReadOnly"
        } else {
            "0"
        };
        code.push(format!(
            "// variable:{}{}",
            var.line,
            if var.is_const { " (const)" } else { "" }
        ));
        match &var.value {
            VariableValue::Literal(literal) => {
                let prefix = self.assign_prefix(Some(&var.name));
                literal.to_native(&prefix, self.names, code);
            }
            VariableValue::Copy(other) => {
                let prefix = self.assign_prefix(Some(&var.name));
                code.push(format!("{}{};", prefix, other));
            }
        }
        self.publish(&var.name, attributes, code);
    }

    fn expression(&mut self, expr: &BridgeCall, target: Option<&str>, code: &mut Vec<String>) {
        code.push(format!("// expression {}:{}", expr.symbol_name, expr.line));
        let argc = expr.arguments.len();
        let argv = if argc > 0 {
            let a = self.names.make();
            code.push(format!("JSValueRef {}[{}];", a, argc));
            a
        } else {
            "nullptr".to_string()
        };
        for (i, arg) in expr.arguments.iter().enumerate() {
            let slot = format!("{}[{}] = ", argv, i);
            match arg {
                Argument::Value(literal) => literal.to_native(&slot, self.names, code),
                Argument::Variable(name) => code.push(format!("{}{};", slot, name)),
            }
        }
        let prefix = self.assign_prefix(target);
        let function = format!("{}Fn", expr.name);
        code.push(format!(
            "{}{}(ctx,{},{},{},{},exception);",
            prefix, expr.symbol_name, function, function, argc, argv
        ));
        code.push("CHECK_EXCEPTION(exception);".to_string());
        code.push(String::new());
    }
}
