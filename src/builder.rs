//! Construction context for expression graphs.
//!
//! A [`ScriptBuilder`] owns every node of one compilation unit. It carries
//! the scope stack explicitly: while a function body is being constructed
//! the function sits on top of the stack, and every node created in the
//! meantime records it as its scope. The stack is restored by a guard on
//! every exit path.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use crate::convert::HostValue;
use crate::escape::{is_identifier, string_literal};
use crate::node::{
    Body, BodyState, Expr, ExprFlags, ExprKind, FunctionNode, NodeData, NodeKind, Part, Scope,
};
use crate::store::ResourceValue;
use crate::validate::{
    CompilerError, ERR_NOT_A_FUNCTION, ERR_REENTRANT_BODY, ERR_SLOT_REFILLED,
};

#[derive(Default)]
pub struct ScriptBuilder {
    nodes: RefCell<Vec<Rc<NodeData>>>,
    scope_stack: RefCell<Vec<Expr>>,
    pub(crate) memo: RefCell<HashMap<usize, (HostValue, Expr)>>,
    module_store: Cell<Option<Expr>>,
    resource_store: Cell<Option<Expr>>,
}

/// Pops the scope stack when dropped.
pub(crate) struct ScopeGuard<'a> {
    cx: &'a ScriptBuilder,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        self.cx.scope_stack.borrow_mut().pop();
    }
}

impl ScriptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes constructed so far.
    pub fn len(&self) -> usize {
        self.nodes.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.borrow().is_empty()
    }

    pub(crate) fn node(&self, e: Expr) -> Rc<NodeData> {
        self.nodes.borrow()[e.index()].clone()
    }

    pub fn current_scope(&self) -> Scope {
        self.scope_stack.borrow().last().copied()
    }

    pub fn scope_of(&self, e: Expr) -> Scope {
        self.node(e).scope
    }

    pub fn flags(&self, e: Expr) -> ExprFlags {
        self.node(e).flags
    }

    pub fn kind(&self, e: Expr) -> NodeKind {
        self.node(e).kind_tag()
    }

    /// Parameters of a function node.
    pub fn params(&self, f: Expr) -> Vec<Expr> {
        match &self.node(f).kind {
            ExprKind::Function(func) => func.params.clone(),
            _ => vec![],
        }
    }

    pub(crate) fn enter_scope(&self, f: Expr) -> ScopeGuard<'_> {
        self.scope_stack.borrow_mut().push(f);
        ScopeGuard { cx: self }
    }

    fn push_in(&self, scope: Scope, kind: ExprKind, flags: ExprFlags) -> Expr {
        let mut nodes = self.nodes.borrow_mut();
        let id = Expr(nodes.len() as u32);
        nodes.push(Rc::new(NodeData { scope, flags, kind }));
        id
    }

    pub(crate) fn push(&self, kind: ExprKind, flags: ExprFlags) -> Expr {
        self.push_in(self.current_scope(), kind, flags)
    }

    fn any_resources(&self, exprs: impl IntoIterator<Item = Expr>) -> bool {
        exprs.into_iter().any(|e| self.flags(e).has_resources)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // TEXT
    // ═══════════════════════════════════════════════════════════════════════════

    /// Raw script text. May be hoisted when shared.
    pub fn raw(&self, code: impl Into<String>) -> Expr {
        self.push(ExprKind::Raw(code.into()), ExprFlags::default())
    }

    /// A global or otherwise side-effect free name; always inlined.
    pub fn ident(&self, name: &str) -> Expr {
        if !is_identifier(name) {
            tracing::warn!(name, "ident() called with a non-identifier");
        }
        self.push(ExprKind::Raw(name.to_string()), ExprFlags::literal())
    }

    pub(crate) fn literal_text(&self, text: String) -> Expr {
        self.push(ExprKind::Raw(text), ExprFlags::literal())
    }

    pub fn template(&self, parts: Vec<Part>) -> Expr {
        self.js().parts(parts).build()
    }

    pub fn js(&self) -> TemplateBuilder<'_> {
        TemplateBuilder {
            cx: self,
            parts: vec![],
            flags: ExprFlags::default(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // OPERATORS
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn get(&self, object: Expr, property: &str) -> Expr {
        self.member(object, property, false)
    }

    pub fn get_optional(&self, object: Expr, property: &str) -> Expr {
        self.member(object, property, true)
    }

    fn member(&self, object: Expr, property: &str, optional: bool) -> Expr {
        let access = match (is_identifier(property), optional) {
            (true, false) => format!(".{}", property),
            (true, true) => format!("?.{}", property),
            (false, false) => format!("[{}]", string_literal(property)),
            (false, true) => format!("?.[{}]", string_literal(property)),
        };
        let mut builder = self.js().expr(object).text(access);
        builder.flags.is_optional = optional;
        builder.build()
    }

    pub fn index(&self, object: Expr, key: Expr) -> Expr {
        self.js().expr(object).text("[").expr(key).text("]").build()
    }

    pub fn call(&self, callee: Expr, args: Vec<Expr>) -> Expr {
        self.call_with(callee, args, ExprFlags::default())
    }

    pub fn call_optional(&self, callee: Expr, args: Vec<Expr>) -> Expr {
        let flags = ExprFlags {
            is_optional: true,
            ..ExprFlags::default()
        };
        self.call_with(callee, args, flags)
    }

    /// A call whose result may be re-evaluated at every use.
    pub fn call_pure(&self, callee: Expr, args: Vec<Expr>) -> Expr {
        self.call_with(callee, args, ExprFlags::literal())
    }

    fn call_with(&self, callee: Expr, args: Vec<Expr>, mut flags: ExprFlags) -> Expr {
        flags.has_resources = self.any_resources(std::iter::once(callee).chain(args.iter().copied()));
        self.push(ExprKind::Call { callee, args }, flags)
    }

    pub fn new_(&self, constructor: Expr, args: Vec<Expr>) -> Expr {
        let mut builder = self.js().text("new ").expr(constructor).text("(");
        for (i, arg) in args.into_iter().enumerate() {
            if i > 0 {
                builder = builder.text(",");
            }
            builder = builder.expr(arg);
        }
        builder.text(")").build()
    }

    pub fn assign(&self, target: Expr, value: Expr) -> Expr {
        self.js().expr(target).text("=").expr(value).build()
    }

    /// `await expr`; marks the enclosing function as suspension-capable.
    pub fn await_(&self, e: Expr) -> Expr {
        self.js().text("await ").expr(e).awaited().build()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // FUNCTIONS
    // ═══════════════════════════════════════════════════════════════════════════

    /// A function literal with `arity` parameters. `body` runs at most once,
    /// lazily, with the new function on top of the scope stack.
    pub fn function<B, F>(&self, arity: usize, body: F) -> Expr
    where
        B: Into<Body>,
        F: FnOnce(&ScriptBuilder, &[Expr]) -> B + 'static,
    {
        self.try_recursive_function(arity, move |cx, _, args| Ok(body(cx, args).into()))
    }

    pub fn try_function<F>(&self, arity: usize, body: F) -> Expr
    where
        F: FnOnce(&ScriptBuilder, &[Expr]) -> Result<Body, CompilerError> + 'static,
    {
        self.try_recursive_function(arity, move |cx, _, args| body(cx, args))
    }

    /// Like [`ScriptBuilder::function`], but `body` also receives the
    /// function's own handle so it can call itself.
    pub fn recursive_function<B, F>(&self, arity: usize, body: F) -> Expr
    where
        B: Into<Body>,
        F: FnOnce(&ScriptBuilder, Expr, &[Expr]) -> B + 'static,
    {
        self.try_recursive_function(arity, move |cx, me, args| Ok(body(cx, me, args).into()))
    }

    pub fn try_recursive_function<F>(&self, arity: usize, body: F) -> Expr
    where
        F: FnOnce(&ScriptBuilder, Expr, &[Expr]) -> Result<Body, CompilerError> + 'static,
    {
        let scope = self.current_scope();
        let mut nodes = self.nodes.borrow_mut();
        let id = Expr(nodes.len() as u32);
        let params: Vec<Expr> = (0..arity).map(|i| Expr(id.0 + 1 + i as u32)).collect();
        nodes.push(Rc::new(NodeData {
            scope,
            flags: ExprFlags::default(),
            kind: ExprKind::Function(FunctionNode {
                params,
                body: RefCell::new(BodyState::Pending(Box::new(body))),
            }),
        }));
        for index in 0..arity {
            nodes.push(Rc::new(NodeData {
                scope: Some(id),
                flags: ExprFlags::literal(),
                kind: ExprKind::Argument { index },
            }));
        }
        id
    }

    /// The body of function `f`, constructing it on first request.
    pub fn body(&self, f: Expr) -> Result<Body, CompilerError> {
        let node = self.node(f);
        let ExprKind::Function(func) = &node.kind else {
            return Err(CompilerError::new(
                ERR_NOT_A_FUNCTION,
                "Requested the body of a node that is not a function.",
            ));
        };

        let init = {
            let mut state = func.body.borrow_mut();
            match std::mem::replace(&mut *state, BodyState::Building) {
                BodyState::Pending(init) => init,
                BodyState::Ready(body) => {
                    *state = BodyState::Ready(body.clone());
                    return Ok(body);
                }
                BodyState::Failed(err) => {
                    *state = BodyState::Failed(err.clone());
                    return Err(err);
                }
                BodyState::Building => {
                    return Err(CompilerError::with_details(
                        ERR_REENTRANT_BODY,
                        "A function body was requested while it was being constructed.",
                        None,
                        vec![
                            "Refer to the function handle itself instead of its body.".to_string(),
                        ],
                    ))
                }
            }
        };

        let result = {
            let _guard = self.enter_scope(f);
            init(self, f, &func.params)
        };

        let mut state = func.body.borrow_mut();
        match result {
            Ok(body) => {
                *state = BodyState::Ready(body.clone());
                Ok(body)
            }
            Err(err) => {
                *state = BodyState::Failed(err.clone());
                Err(err)
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // STORES
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn module_store(&self) -> Expr {
        if let Some(store) = self.module_store.get() {
            return store;
        }
        let flags = ExprFlags {
            must_declare: true,
            is_awaited: true,
            ..ExprFlags::default()
        };
        let store = self.push_in(None, ExprKind::ModuleStore, flags);
        self.module_store.set(Some(store));
        store
    }

    pub fn resource_store(&self) -> Expr {
        if let Some(store) = self.resource_store.get() {
            return store;
        }
        let flags = ExprFlags {
            must_declare: true,
            ..ExprFlags::default()
        };
        let store = self.push_in(None, ExprKind::ResourceStore, flags);
        self.resource_store.set(Some(store));
        store
    }

    /// The namespace of an external module.
    pub fn module(&self, address: &str) -> Expr {
        let store = self.module_store();
        self.push(
            ExprKind::ModuleRef {
                store,
                address: address.to_string(),
            },
            ExprFlags::literal(),
        )
    }

    /// A named export of an external module.
    pub fn import(&self, address: &str, export: &str) -> Expr {
        let namespace = self.module(address);
        self.get(namespace, export)
    }

    pub fn resource(&self, key: &str, value: serde_json::Value) -> Expr {
        self.resource_value(key, ResourceValue::Eager(value))
    }

    /// A resource whose snapshot is produced on first registration.
    pub fn resource_with<F>(&self, key: &str, produce: F) -> Expr
    where
        F: Fn() -> serde_json::Value + 'static,
    {
        self.resource_value(key, ResourceValue::Lazy(Rc::new(produce)))
    }

    fn resource_value(&self, key: &str, value: ResourceValue) -> Expr {
        let store = self.resource_store();
        let flags = ExprFlags {
            has_resources: true,
            ..ExprFlags::literal()
        };
        self.push(
            ExprKind::ResourceRef {
                store,
                key: key.to_string(),
                value,
            },
            flags,
        )
    }

    pub fn ref_placeholder(&self) -> Expr {
        self.push(ExprKind::RefPlaceholder, ExprFlags::literal())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // SLOTS
    // ═══════════════════════════════════════════════════════════════════════════

    /// A forward reference, resolved later with [`ScriptBuilder::fill`].
    pub fn slot(&self) -> Expr {
        self.push(ExprKind::Slot(Cell::new(None)), ExprFlags::literal())
    }

    pub fn fill(&self, slot: Expr, target: Expr) -> Result<(), CompilerError> {
        let node = self.node(slot);
        let ExprKind::Slot(cell) = &node.kind else {
            return Err(CompilerError::new(
                ERR_SLOT_REFILLED,
                "Only slot nodes can be filled.",
            ));
        };
        if cell.get().is_some() {
            return Err(CompilerError::new(
                ERR_SLOT_REFILLED,
                "A slot was filled twice.",
            ));
        }
        cell.set(Some(target));
        Ok(())
    }
}

/// Incrementally assembles a template node.
pub struct TemplateBuilder<'a> {
    cx: &'a ScriptBuilder,
    parts: Vec<Part>,
    flags: ExprFlags,
}

impl<'a> TemplateBuilder<'a> {
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.parts.push(Part::Text(text.into()));
        self
    }

    pub fn expr(mut self, e: Expr) -> Self {
        self.parts.push(Part::Expr(e));
        self
    }

    pub fn parts(mut self, parts: Vec<Part>) -> Self {
        self.parts.extend(parts);
        self
    }

    pub fn awaited(mut self) -> Self {
        self.flags.is_awaited = true;
        self
    }

    /// Never hoist this template.
    pub fn pure(mut self) -> Self {
        self.flags.isnt_assignable = true;
        self
    }

    pub fn build(mut self) -> Expr {
        let children = self.parts.iter().filter_map(|part| match part {
            Part::Expr(e) => Some(*e),
            Part::Text(_) => None,
        });
        self.flags.has_resources = self.cx.any_resources(children.collect::<Vec<_>>());
        self.cx.push(ExprKind::Template(self.parts), self.flags)
    }
}
