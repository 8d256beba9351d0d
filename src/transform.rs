//! Program IR and its lowering into an expression graph.
//!
//! Hosts that cannot call the builder directly describe a program as JSON.
//! Names are resolved lexically: a body's definitions are visible to each
//! other and to everything nested in the body, and a named function can
//! refer to itself. Definitions are bindings, not statements; one that is
//! never used produces no code.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::rc::Rc;

use crate::builder::ScriptBuilder;
use crate::convert::HostValue;
use crate::finalize::{compile, CompileOptions, CompileResult};
use crate::node::{Body, Expr, Part};
use crate::store::ScriptStores;
use crate::validate::{CompilerError, ERR_INVALID_INPUT, ERR_UNKNOWN_NAME};

// ═══════════════════════════════════════════════════════════════════════════════
// IR TYPES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NodeIR {
    Value {
        value: serde_json::Value,
    },
    Raw {
        code: String,
    },
    Ident {
        name: String,
    },
    Template {
        parts: Vec<TemplatePartIR>,
    },
    Member {
        object: Box<NodeIR>,
        property: String,
        #[serde(default)]
        optional: bool,
    },
    Index {
        object: Box<NodeIR>,
        key: Box<NodeIR>,
    },
    Call {
        callee: Box<NodeIR>,
        #[serde(default)]
        args: Vec<NodeIR>,
        #[serde(default)]
        optional: bool,
        /// Exempt from hoisting; may be evaluated at every use.
        #[serde(default)]
        pure: bool,
    },
    New {
        callee: Box<NodeIR>,
        #[serde(default)]
        args: Vec<NodeIR>,
    },
    Function {
        /// Binds the function itself inside its body.
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        params: Vec<String>,
        #[serde(default)]
        definitions: Vec<DefinitionIR>,
        #[serde(default)]
        body: Option<BodyIR>,
    },
    Await {
        value: Box<NodeIR>,
    },
    Assign {
        target: Box<NodeIR>,
        value: Box<NodeIR>,
    },
    Module {
        address: String,
        #[serde(default)]
        export: Option<String>,
    },
    Resource {
        key: String,
        #[serde(default)]
        value: serde_json::Value,
    },
    Ref,
    Use {
        name: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TemplatePartIR {
    Text(String),
    Node(NodeIR),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BodyIR {
    Statements(Vec<NodeIR>),
    Expr(Box<NodeIR>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefinitionIR {
    pub name: String,
    pub value: NodeIR,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramIR {
    #[serde(default)]
    pub definitions: Vec<DefinitionIR>,
    #[serde(default)]
    pub body: Option<BodyIR>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// BINDING TABLE
// ═══════════════════════════════════════════════════════════════════════════════

/// Lexical environment of one body, chained to its enclosing bodies.
#[derive(Debug, Default)]
pub struct BindingTable {
    bindings: HashMap<String, Expr>,
    parent: Option<Rc<BindingTable>>,
}

impl BindingTable {
    pub fn new() -> Self {
        BindingTable::default()
    }

    pub fn child(parent: &Rc<BindingTable>) -> Self {
        BindingTable {
            bindings: HashMap::new(),
            parent: Some(parent.clone()),
        }
    }

    pub fn add(&mut self, name: &str, e: Expr) {
        self.bindings.insert(name.to_string(), e);
    }

    pub fn lookup(&self, name: &str) -> Option<Expr> {
        match self.bindings.get(name) {
            Some(e) => Some(*e),
            None => self.parent.as_ref().and_then(|p| p.lookup(name)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LOWERING
// ═══════════════════════════════════════════════════════════════════════════════

/// Lowers a body in the current scope. Each definition gets a slot first so
/// definitions can refer to each other in any order.
pub fn lower_body(
    cx: &ScriptBuilder,
    definitions: &[DefinitionIR],
    body: Option<&BodyIR>,
    table: BindingTable,
) -> Result<Body, CompilerError> {
    let mut table = table;
    let slots: Vec<Expr> = definitions
        .iter()
        .map(|def| {
            let slot = cx.slot();
            table.add(&def.name, slot);
            slot
        })
        .collect();
    let table = Rc::new(table);

    for (def, slot) in definitions.iter().zip(slots) {
        let value = lower_node(cx, &def.value, &table)?;
        cx.fill(slot, value)?;
    }

    match body {
        Some(BodyIR::Expr(e)) => Ok(Body::Expr(lower_node(cx, e, &table)?)),
        Some(BodyIR::Statements(stmts)) => Ok(Body::Statements(
            stmts
                .iter()
                .map(|s| lower_node(cx, s, &table))
                .collect::<Result<Vec<_>, _>>()?,
        )),
        None => Ok(Body::Statements(vec![])),
    }
}

fn lower_all(cx: &ScriptBuilder, nodes: &[NodeIR], table: &Rc<BindingTable>) -> Result<Vec<Expr>, CompilerError> {
    nodes.iter().map(|n| lower_node(cx, n, table)).collect()
}

pub fn lower_node(cx: &ScriptBuilder, node: &NodeIR, table: &Rc<BindingTable>) -> Result<Expr, CompilerError> {
    let e = match node {
        NodeIR::Value { value } => cx.value(HostValue::Json(value.clone()))?,
        NodeIR::Raw { code } => cx.raw(code.clone()),
        NodeIR::Ident { name } => cx.ident(name),
        NodeIR::Template { parts } => {
            let mut lowered = Vec::with_capacity(parts.len());
            for part in parts {
                lowered.push(match part {
                    TemplatePartIR::Text(t) => Part::Text(t.clone()),
                    TemplatePartIR::Node(n) => Part::Expr(lower_node(cx, n, table)?),
                });
            }
            cx.template(lowered)
        }
        NodeIR::Member {
            object,
            property,
            optional,
        } => {
            let object = lower_node(cx, object, table)?;
            if *optional {
                cx.get_optional(object, property)
            } else {
                cx.get(object, property)
            }
        }
        NodeIR::Index { object, key } => {
            let object = lower_node(cx, object, table)?;
            let key = lower_node(cx, key, table)?;
            cx.index(object, key)
        }
        NodeIR::Call {
            callee,
            args,
            optional,
            pure,
        } => {
            let callee = lower_node(cx, callee, table)?;
            let args = lower_all(cx, args, table)?;
            match (*optional, *pure) {
                (true, _) => cx.call_optional(callee, args),
                (false, true) => cx.call_pure(callee, args),
                (false, false) => cx.call(callee, args),
            }
        }
        NodeIR::New { callee, args } => {
            let callee = lower_node(cx, callee, table)?;
            let args = lower_all(cx, args, table)?;
            cx.new_(callee, args)
        }
        NodeIR::Function {
            name,
            params,
            definitions,
            body,
        } => lower_function(
            cx,
            name.clone(),
            params.clone(),
            definitions.clone(),
            body.clone(),
            table,
        ),
        NodeIR::Await { value } => {
            let value = lower_node(cx, value, table)?;
            cx.await_(value)
        }
        NodeIR::Assign { target, value } => {
            let target = lower_node(cx, target, table)?;
            let value = lower_node(cx, value, table)?;
            cx.assign(target, value)
        }
        NodeIR::Module { address, export } => match export {
            Some(export) => cx.import(address, export),
            None => cx.module(address),
        },
        NodeIR::Resource { key, value } => cx.resource(key, value.clone()),
        NodeIR::Ref => cx.ref_placeholder(),
        NodeIR::Use { name } => table.lookup(name).ok_or_else(|| {
            CompilerError::with_details(
                ERR_UNKNOWN_NAME,
                &format!("Unknown name '{}'.", name),
                None,
                vec!["Names resolve through definitions, parameters and the enclosing function's own name.".to_string()],
            )
        })?,
    };
    Ok(e)
}

/// The body is lowered lazily, when analysis first asks for it, with the
/// function's parameters and name bound.
fn lower_function(
    cx: &ScriptBuilder,
    name: Option<String>,
    params: Vec<String>,
    definitions: Vec<DefinitionIR>,
    body: Option<BodyIR>,
    table: &Rc<BindingTable>,
) -> Expr {
    let outer = table.clone();
    cx.try_recursive_function(params.len(), move |cx, me, args| {
        let mut table = BindingTable::child(&outer);
        if let Some(name) = &name {
            table.add(name, me);
        }
        for (param, arg) in params.iter().zip(args) {
            table.add(param, *arg);
        }
        lower_body(cx, &definitions, body.as_ref(), table)
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// PROGRAM ENTRY POINT
// ═══════════════════════════════════════════════════════════════════════════════

pub fn parse_program(json: &str) -> Result<ProgramIR, CompilerError> {
    serde_json::from_str(json)
        .map_err(|e| CompilerError::new(ERR_INVALID_INPUT, &format!("Invalid program IR: {}", e)))
}

/// Lowers and compiles a program with fresh stores.
pub fn compile_program(program: &ProgramIR, options: &CompileOptions) -> Result<CompileResult, CompilerError> {
    let cx = ScriptBuilder::new();
    let body = lower_body(&cx, &program.definitions, program.body.as_ref(), BindingTable::new())?;
    tracing::debug!(
        definitions = program.definitions.len(),
        nodes = cx.len(),
        "lowered program"
    );
    let resolver = options.resolver();
    let mut stores = ScriptStores::new();
    compile(&cx, &body, options, &mut stores, resolver.as_ref())
}

pub fn compile_program_json(program_json: &str, options_json: Option<&str>) -> Result<CompileResult, CompilerError> {
    let program = parse_program(program_json)?;
    let options = match options_json {
        Some(json) => CompileOptions::from_json(json)?,
        None => CompileOptions::default(),
    };
    compile_program(&program, &options)
}
