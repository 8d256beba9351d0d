//! Expression node model.
//!
//! Nodes live in the arena of a [`ScriptBuilder`](crate::builder::ScriptBuilder)
//! and are addressed by [`Expr`] handles. Handle identity is node identity:
//! the same handle referenced from several parents is one shared node.

use std::cell::{Cell, RefCell};

use crate::builder::ScriptBuilder;
use crate::store::ResourceValue;
use crate::validate::{CompilerError, ERR_UNFILLED_SLOT};

/// Handle to a node. Only valid for the builder that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Expr(pub(crate) u32);

impl Expr {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Function a node was constructed in; `None` is top level.
pub type Scope = Option<Expr>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExprFlags {
    /// Never hoisted; safe to duplicate textually.
    pub isnt_assignable: bool,
    /// Always hoisted.
    pub must_declare: bool,
    /// Evaluating the node suspends; its scope renders as `async`.
    pub is_awaited: bool,
    /// Short-circuiting member access or call.
    pub is_optional: bool,
    /// Depends on a late-bound resource through children known at
    /// construction. Slots are resolved during analysis.
    pub has_resources: bool,
}

impl ExprFlags {
    pub(crate) const fn literal() -> Self {
        ExprFlags {
            isnt_assignable: true,
            must_declare: false,
            is_awaited: false,
            is_optional: false,
            has_resources: false,
        }
    }
}

/// One fragment of a node's expansion.
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(String),
    Expr(Expr),
}

impl From<Expr> for Part {
    fn from(e: Expr) -> Self {
        Part::Expr(e)
    }
}

impl From<&str> for Part {
    fn from(s: &str) -> Self {
        Part::Text(s.to_string())
    }
}

impl From<String> for Part {
    fn from(s: String) -> Self {
        Part::Text(s)
    }
}

/// Function body: an implicitly returned expression or a statement list.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Expr(Expr),
    Statements(Vec<Expr>),
}

impl Body {
    pub fn roots(&self) -> &[Expr] {
        match self {
            Body::Expr(e) => std::slice::from_ref(e),
            Body::Statements(stmts) => stmts,
        }
    }
}

impl From<Expr> for Body {
    fn from(e: Expr) -> Self {
        Body::Expr(e)
    }
}

impl From<Vec<Expr>> for Body {
    fn from(stmts: Vec<Expr>) -> Self {
        Body::Statements(stmts)
    }
}

/// Builds a body from the function's own handle and its parameters.
pub(crate) type BodyInit = Box<dyn FnOnce(&ScriptBuilder, Expr, &[Expr]) -> Result<Body, CompilerError>>;

pub(crate) enum BodyState {
    Pending(BodyInit),
    Building,
    Ready(Body),
    Failed(CompilerError),
}

pub(crate) struct FunctionNode {
    pub params: Vec<Expr>,
    pub body: RefCell<BodyState>,
}

/// Public tag of a node's kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Template,
    Function,
    Call,
    Argument,
    Raw,
    ModuleRef,
    ResourceRef,
    RefPlaceholder,
    ModuleStore,
    ResourceStore,
    Slot,
}

pub(crate) enum ExprKind {
    Template(Vec<Part>),
    Function(FunctionNode),
    Call { callee: Expr, args: Vec<Expr> },
    Argument { index: usize },
    Raw(String),
    ModuleRef { store: Expr, address: String },
    ResourceRef { store: Expr, key: String, value: ResourceValue },
    RefPlaceholder,
    ModuleStore,
    ResourceStore,
    /// Forward reference, filled once after construction.
    Slot(Cell<Option<Expr>>),
}

pub(crate) struct NodeData {
    pub scope: Scope,
    pub flags: ExprFlags,
    pub kind: ExprKind,
}

impl NodeData {
    pub fn kind_tag(&self) -> NodeKind {
        match &self.kind {
            ExprKind::Template(_) => NodeKind::Template,
            ExprKind::Function(_) => NodeKind::Function,
            ExprKind::Call { .. } => NodeKind::Call,
            ExprKind::Argument { .. } => NodeKind::Argument,
            ExprKind::Raw(_) => NodeKind::Raw,
            ExprKind::ModuleRef { .. } => NodeKind::ModuleRef,
            ExprKind::ResourceRef { .. } => NodeKind::ResourceRef,
            ExprKind::RefPlaceholder => NodeKind::RefPlaceholder,
            ExprKind::ModuleStore => NodeKind::ModuleStore,
            ExprKind::ResourceStore => NodeKind::ResourceStore,
            ExprKind::Slot(_) => NodeKind::Slot,
        }
    }

    /// The node's own expansion in terms of its children.
    ///
    /// Store-backed kinds (module and resource references, stores, ref
    /// placeholders) only know their index or contents during emission; their
    /// template names the store child and leaves the rest to the emitter.
    /// Function bodies are not part of the template.
    pub fn template(&self) -> Result<Vec<Part>, CompilerError> {
        let parts = match &self.kind {
            ExprKind::Template(parts) => parts.clone(),
            ExprKind::Function(_) => vec![],
            ExprKind::Call { callee, args } => {
                let mut parts = vec![Part::Expr(*callee)];
                parts.push(Part::Text(if self.flags.is_optional { "?.(" } else { "(" }.to_string()));
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        parts.push(Part::Text(",".to_string()));
                    }
                    parts.push(Part::Expr(*arg));
                }
                parts.push(Part::Text(")".to_string()));
                parts
            }
            ExprKind::Argument { .. } => vec![],
            ExprKind::Raw(code) => vec![Part::Text(code.clone())],
            ExprKind::ModuleRef { store, .. } | ExprKind::ResourceRef { store, .. } => {
                vec![Part::Expr(*store)]
            }
            ExprKind::RefPlaceholder | ExprKind::ModuleStore | ExprKind::ResourceStore => vec![],
            ExprKind::Slot(target) => match target.get() {
                Some(target) => vec![Part::Expr(target)],
                None => {
                    return Err(CompilerError::with_details(
                        ERR_UNFILLED_SLOT,
                        "A slot was expanded before it was filled.",
                        None,
                        vec!["Call ScriptBuilder::fill before compiling.".to_string()],
                    ))
                }
            },
        };
        Ok(parts)
    }

    /// Child nodes referenced by the template, with multiplicity.
    pub fn children(&self) -> Result<Vec<Expr>, CompilerError> {
        Ok(self
            .template()?
            .into_iter()
            .filter_map(|part| match part {
                Part::Expr(e) => Some(e),
                Part::Text(_) => None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_roots() {
        let a = Expr(1);
        let b = Expr(2);
        assert_eq!(Body::Expr(a).roots(), &[a]);
        assert_eq!(Body::Statements(vec![a, b]).roots(), &[a, b]);
        assert_eq!(Body::from(vec![b]), Body::Statements(vec![b]));
    }

    #[test]
    fn test_call_template_lists_callee_then_args() {
        let node = NodeData {
            scope: None,
            flags: ExprFlags::default(),
            kind: ExprKind::Call {
                callee: Expr(0),
                args: vec![Expr(1), Expr(1)],
            },
        };
        assert_eq!(node.children().unwrap(), vec![Expr(0), Expr(1), Expr(1)]);
        assert_eq!(node.kind_tag(), NodeKind::Call);
    }

    #[test]
    fn test_unfilled_slot_fails_loudly() {
        let node = NodeData {
            scope: None,
            flags: ExprFlags::literal(),
            kind: ExprKind::Slot(Cell::new(None)),
        };
        let err = node.template().unwrap_err();
        assert_eq!(err.code, ERR_UNFILLED_SLOT);
    }
}
