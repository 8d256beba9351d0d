//! Codegen module for the script compiler
//!
//! Walks an analysed expression graph and writes script text. Declared nodes
//! are emitted once, as `let` declarations at the head of their scope;
//! everything else is expanded inline at its use site.

use std::collections::HashMap;

use crate::analysis::Analysis;
use crate::builder::ScriptBuilder;
use crate::escape::guard_block_start;
use crate::node::{Body, Expr, ExprKind, Part, Scope};
use crate::store::{ModuleResolver, ResourceMode, ScriptStores};
use crate::validate::{CompilerError, ERR_MISSING_NAME};

// Placeholders for store declarations; their contents are only complete
// once the whole graph has been walked.
const MODULE_STORE_SENTINEL: &str = "\u{0}module-store\u{0}";
const RESOURCE_STORE_SENTINEL: &str = "\u{0}resource-store\u{0}";

// ═══════════════════════════════════════════════════════════════════════════════
// CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy)]
pub struct EmitConfig<'a> {
    pub resource_mode: ResourceMode,
    /// Array through which ref placeholders are recovered.
    pub ref_binding: &'a str,
    /// Client runtime function returning an index-keyed resource reader.
    pub resource_accessor: &'a str,
    /// Host-supplied module address array, instead of inlined addresses.
    pub module_param: Option<&'a str>,
    /// Host-supplied resource reader, instead of calling the accessor.
    pub resource_param: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Emitted {
    pub code: String,
    pub refs: usize,
    pub uses_modules: bool,
    pub uses_resources: bool,
}

/// Where an expansion sits relative to surrounding text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    /// Delimited on both sides: a statement, argument, element or initializer.
    Standalone,
    /// Adjacent to an operator or accessor.
    Operand,
}

// ═══════════════════════════════════════════════════════════════════════════════
// EMITTER
// ═══════════════════════════════════════════════════════════════════════════════

pub struct Emitter<'a> {
    cx: &'a ScriptBuilder,
    analysis: &'a Analysis,
    stores: &'a mut ScriptStores,
    resolver: &'a dyn ModuleResolver,
    config: EmitConfig<'a>,
    refs: HashMap<Expr, usize>,
    uses_modules: bool,
    uses_resources: bool,
}

impl<'a> Emitter<'a> {
    pub fn new(
        cx: &'a ScriptBuilder,
        analysis: &'a Analysis,
        stores: &'a mut ScriptStores,
        resolver: &'a dyn ModuleResolver,
        config: EmitConfig<'a>,
    ) -> Self {
        Emitter {
            cx,
            analysis,
            stores,
            resolver,
            config,
            refs: HashMap::new(),
            uses_modules: false,
            uses_resources: false,
        }
    }

    /// Script body: top-level declarations followed by each statement.
    pub fn statements(&mut self, roots: &[Expr]) -> Result<String, CompilerError> {
        let mut out = self.declarations(None)?;
        for &root in roots {
            let text = self.expand(root, Position::Standalone)?;
            out.push_str(&guard_block_start(text));
            out.push(';');
        }
        Ok(out)
    }

    /// Asynchronous wrapper evaluating `root`. Its parameters name the store
    /// contents the host must pass in.
    pub fn evaluation(&mut self, root: Expr) -> Result<String, CompilerError> {
        let body = self.scope_body(None, &Body::Expr(root))?;
        let mut params = Vec::new();
        if self.uses_modules {
            if let Some(p) = self.config.module_param {
                params.push(p);
            }
        }
        if self.uses_resources && self.config.resource_mode == ResourceMode::Runtime {
            if let Some(p) = self.config.resource_param {
                params.push(p);
            }
        }
        Ok(format!("(async({})=>{})", params.join(","), body))
    }

    /// Splices the store declarations into `code`.
    pub fn finish(self, code: String) -> Emitted {
        let mut code = code;
        if self.uses_modules {
            let rendered = self.stores.render_module_store(self.config.module_param);
            code = code.replace(MODULE_STORE_SENTINEL, &rendered);
        }
        if self.uses_resources {
            let rendered = match (self.config.resource_mode, self.config.resource_param) {
                (ResourceMode::Runtime, Some(param)) => {
                    self.stores
                        .render_resource_store(ResourceMode::Runtime, param, false)
                }
                (mode, _) => {
                    self.stores
                        .render_resource_store(mode, self.config.resource_accessor, true)
                }
            };
            code = code.replace(RESOURCE_STORE_SENTINEL, &rendered);
        }

        tracing::debug!(
            bytes = code.len(),
            modules = self.stores.modules.len(),
            resources = self.stores.resources.len(),
            refs = self.refs.len(),
            "emitted script"
        );

        Emitted {
            code,
            refs: self.refs.len(),
            uses_modules: self.uses_modules,
            uses_resources: self.uses_resources,
        }
    }

    fn name(&self, e: Expr) -> Result<&'a str, CompilerError> {
        self.analysis.name(e).ok_or_else(|| {
            CompilerError::with_details(
                ERR_MISSING_NAME,
                &format!("Node {} has no assigned name.", e.0),
                Some(format!("{:?}", self.cx.kind(e))),
                vec![],
            )
        })
    }

    /// `let a=…,b=…;` for the declarations of `scope`, or nothing.
    fn declarations(&mut self, scope: Scope) -> Result<String, CompilerError> {
        let decls = self.analysis.declarations(scope);
        if decls.is_empty() {
            return Ok(String::new());
        }
        let mut items = Vec::with_capacity(decls.len());
        for &d in decls {
            let name = self.name(d)?;
            let init = self.expansion(d, Position::Standalone)?;
            if self.analysis.is_accessor(d) {
                items.push(format!("{}=()=>{}", name, guard_block_start(init)));
            } else {
                items.push(format!("{}={}", name, init));
            }
        }
        Ok(format!("let {};", items.join(",")))
    }

    /// Arrow function body for `scope`.
    fn scope_body(&mut self, scope: Scope, body: &Body) -> Result<String, CompilerError> {
        let decls = self.declarations(scope)?;
        match body {
            Body::Expr(e) => {
                let text = self.expand(*e, Position::Standalone)?;
                if decls.is_empty() {
                    Ok(guard_block_start(text))
                } else {
                    Ok(format!("{{{}return {}}}", decls, text))
                }
            }
            Body::Statements(stmts) => {
                let mut out = String::from("{");
                out.push_str(&decls);
                for &s in stmts {
                    let text = self.expand(s, Position::Standalone)?;
                    out.push_str(&guard_block_start(text));
                    out.push(';');
                }
                out.push('}');
                Ok(out)
            }
        }
    }

    fn function(&mut self, f: Expr) -> Result<String, CompilerError> {
        let params = self
            .cx
            .params(f)
            .into_iter()
            .map(|p| self.name(p))
            .collect::<Result<Vec<_>, _>>()?;
        let body = match self.analysis.body(f) {
            Some(body) => body.clone(),
            None => self.cx.body(f)?,
        };
        let body = self.scope_body(Some(f), &body)?;
        let prefix = if self.analysis.is_suspending(Some(f)) {
            "async"
        } else {
            ""
        };
        Ok(format!("{}({})=>{}", prefix, params.join(","), body))
    }

    /// A use of `e`: its name when declared, its expansion otherwise.
    fn expand(&mut self, e: Expr, pos: Position) -> Result<String, CompilerError> {
        if self.analysis.is_declared(e) {
            let name = self.name(e)?;
            if self.analysis.is_accessor(e) {
                return Ok(format!("{}()", name));
            }
            return Ok(name.to_string());
        }
        self.expansion(e, pos)
    }

    /// The template of `e`, with children expanded.
    fn expansion(&mut self, e: Expr, pos: Position) -> Result<String, CompilerError> {
        let node = self.cx.node(e);
        let text = match &node.kind {
            ExprKind::Template(parts) => {
                let mut out = String::new();
                for (i, part) in parts.iter().enumerate() {
                    match part {
                        Part::Text(t) => out.push_str(t),
                        Part::Expr(c) => {
                            let child_pos = position_in(parts, i, pos);
                            out.push_str(&self.expand(*c, child_pos)?);
                        }
                    }
                }
                match (node.flags.is_awaited, pos) {
                    (true, Position::Operand) => format!("({})", out),
                    _ => out,
                }
            }
            ExprKind::Function(_) => {
                let text = self.function(e)?;
                match pos {
                    Position::Standalone => text,
                    Position::Operand => format!("({})", text),
                }
            }
            ExprKind::Call { callee, args } => {
                let mut out = self.expand(*callee, Position::Operand)?;
                out.push_str(if node.flags.is_optional { "?.(" } else { "(" });
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&self.expand(*arg, Position::Standalone)?);
                }
                out.push(')');
                out
            }
            ExprKind::Argument { .. } => self.name(e)?.to_string(),
            ExprKind::Raw(code) => code.clone(),
            ExprKind::ModuleRef { store, address } => {
                let index = self.stores.modules.register(address, self.resolver);
                format!("{}[{}]", self.expand(*store, Position::Operand)?, index)
            }
            ExprKind::ResourceRef { store, key, value } => {
                let index = self.stores.resources.register(key, value);
                let store = self.expand(*store, Position::Operand)?;
                match self.config.resource_mode {
                    ResourceMode::Snapshot => format!("{}[{}]", store, index),
                    ResourceMode::Runtime => format!("{}({})", store, index),
                }
            }
            ExprKind::RefPlaceholder => {
                let next = self.refs.len();
                let index = *self.refs.entry(e).or_insert(next);
                format!("{}[{}]", self.config.ref_binding, index)
            }
            ExprKind::ModuleStore => {
                self.uses_modules = true;
                MODULE_STORE_SENTINEL.to_string()
            }
            ExprKind::ResourceStore => {
                self.uses_resources = true;
                RESOURCE_STORE_SENTINEL.to_string()
            }
            ExprKind::Slot(_) => {
                let target = node.children()?;
                match target.first() {
                    Some(&t) => self.expand(t, pos)?,
                    None => String::new(),
                }
            }
        };
        Ok(text)
    }
}

/// Position of the `i`th part of a template whose own position is `outer`.
fn position_in(parts: &[Part], i: usize, outer: Position) -> Position {
    let left_open = match i.checked_sub(1).map(|j| &parts[j]) {
        None => outer == Position::Standalone,
        Some(Part::Text(t)) => opens_expression(t),
        Some(Part::Expr(_)) => false,
    };
    let right_open = match parts.get(i + 1) {
        None => outer == Position::Standalone,
        Some(Part::Text(t)) => closes_expression(t),
        Some(Part::Expr(_)) => false,
    };
    if left_open && right_open {
        Position::Standalone
    } else {
        Position::Operand
    }
}

fn opens_expression(text: &str) -> bool {
    let t = text.trim_end();
    if t.ends_with("=>") {
        return true;
    }
    if let Some(rest) = t.strip_suffix('=') {
        return !rest.ends_with(['=', '!', '<', '>', '+', '-', '*', '/', '%', '&', '|', '^', '?']);
    }
    t.ends_with(['(', '[', ',', '{', ':', ';'])
}

fn closes_expression(text: &str) -> bool {
    text.trim_start().starts_with([')', ']', ',', '}', ';', ':'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positions_in_template() {
        let parts = vec![
            Part::Text("[".into()),
            Part::Expr(Expr(0)),
            Part::Text(",".into()),
            Part::Expr(Expr(1)),
            Part::Text("].x".into()),
        ];
        assert_eq!(position_in(&parts, 1, Position::Operand), Position::Standalone);
        assert_eq!(position_in(&parts, 3, Position::Operand), Position::Standalone);

        let member = vec![Part::Expr(Expr(0)), Part::Text(".name".into())];
        assert_eq!(position_in(&member, 0, Position::Standalone), Position::Operand);

        let whole = vec![Part::Expr(Expr(0))];
        assert_eq!(position_in(&whole, 0, Position::Standalone), Position::Standalone);
        assert_eq!(position_in(&whole, 0, Position::Operand), Position::Operand);
    }

    #[test]
    fn test_expression_openers() {
        assert!(opens_expression("x="));
        assert!(opens_expression("f("));
        assert!(opens_expression("a=>"));
        assert!(!opens_expression("a=="));
        assert!(!opens_expression("a+="));
        assert!(!opens_expression("a+"));
        assert!(closes_expression(" )"));
        assert!(!closes_expression(".x"));
    }
}
