//! Scope and declaration analysis.
//!
//! Decides, for every node reachable from the roots, whether it is declared
//! under a name in its own scope or expanded inline at each use, and which
//! scopes must render as `async`.
//!
//! The pass works on *placements*: the scopes a node's text would land in,
//! with multiplicity. Roots land in the top-level scope and the roots of a
//! function body land in that function. A declared node's expansion lands
//! once, in its own scope; an inlined node hands its placements down to its
//! children. Nodes are settled parents-first, so when a node is decided
//! every placement it will ever receive is already known.
//!
//! Resource dependency is read off the resolved graph, slots included, once
//! every node is settled. A declared node that depends on a resource is
//! emitted as an accessor unless its own expansion awaits.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::builder::ScriptBuilder;
use crate::escape::to_base36;
use crate::node::{Body, Expr, ExprKind, NodeKind, Scope};
use crate::validate::{CompilerError, ERR_CYCLIC_GRAPH, ERR_SCOPE_LEAK};

/// Placement counts saturate here; only "once" and "more than once" matter.
const PLACEMENT_CAP: u32 = 2;

#[derive(Default)]
struct NodeInfo {
    /// Distinct template children with their multiplicity, in template order.
    children: Vec<(Expr, u32)>,
    /// Number of distinct parents through template edges.
    parents: u32,
    placements: Vec<(Scope, u32)>,
}

impl NodeInfo {
    fn place(&mut self, scope: Scope, count: u32) {
        match self.placements.iter_mut().find(|(s, _)| *s == scope) {
            Some((_, n)) => *n = n.saturating_add(count).min(PLACEMENT_CAP),
            None => self.placements.push((scope, count.min(PLACEMENT_CAP))),
        }
    }
}

/// Result of analysing one compilation.
#[derive(Debug, Default)]
pub struct Analysis {
    order: Vec<Expr>,
    children: HashMap<Expr, Vec<Expr>>,
    bodies: HashMap<Expr, Body>,
    names: HashMap<Expr, String>,
    declared: HashSet<Expr>,
    declarations: HashMap<Scope, Vec<Expr>>,
    suspending: HashSet<Scope>,
    resource_dependent: HashSet<Expr>,
    accessors: HashSet<Expr>,
}

impl Analysis {
    /// Reachable nodes in discovery order.
    pub fn order(&self) -> &[Expr] {
        &self.order
    }

    pub fn is_declared(&self, e: Expr) -> bool {
        self.declared.contains(&e)
    }

    /// Name of a declared node or a parameter.
    pub fn name(&self, e: Expr) -> Option<&str> {
        self.names.get(&e).map(String::as_str)
    }

    /// Declarations of `scope`, in emission order.
    pub fn declarations(&self, scope: Scope) -> &[Expr] {
        self.declarations.get(&scope).map_or(&[], Vec::as_slice)
    }

    pub fn is_suspending(&self, scope: Scope) -> bool {
        self.suspending.contains(&scope)
    }

    pub fn body(&self, f: Expr) -> Option<&Body> {
        self.bodies.get(&f)
    }

    pub fn declaration_count(&self) -> usize {
        self.declared.len()
    }

    /// Whether the value of `e` reads a resource, directly or through any
    /// node it expands to.
    pub fn has_resources(&self, e: Expr) -> bool {
        self.resource_dependent.contains(&e)
    }

    /// Declared as `name=()=>…` and used as `name()`.
    pub fn is_accessor(&self, e: Expr) -> bool {
        self.accessors.contains(&e)
    }
}

/// Whether `inner` is `outer` or nested inside it.
pub fn is_within(cx: &ScriptBuilder, mut inner: Scope, outer: Scope) -> bool {
    loop {
        if inner == outer {
            return true;
        }
        match inner {
            None => return false,
            Some(f) => inner = cx.scope_of(f),
        }
    }
}

struct Analyzer<'a> {
    cx: &'a ScriptBuilder,
    prefix: &'a str,
    info: HashMap<Expr, NodeInfo>,
    analysis: Analysis,
    next_name: usize,
}

/// Analyses the graph reachable from `roots`, the body of the implicit
/// top-level function.
pub fn analyze(cx: &ScriptBuilder, roots: &Body, prefix: &str) -> Result<Analysis, CompilerError> {
    let mut analyzer = Analyzer {
        cx,
        prefix,
        info: HashMap::new(),
        analysis: Analysis::default(),
        next_name: 0,
    };
    analyzer.discover(roots)?;
    let settled = analyzer.propagate()?;
    analyzer.classify_resources(&settled);
    analyzer.order_declarations();
    analyzer.warn_unreachable_slots();

    tracing::debug!(
        nodes = analyzer.analysis.order.len(),
        declared = analyzer.analysis.declared.len(),
        suspending = analyzer.analysis.suspending.len(),
        accessors = analyzer.analysis.accessors.len(),
        "analysed expression graph"
    );
    Ok(analyzer.analysis)
}

impl<'a> Analyzer<'a> {
    fn fresh_name(&mut self) -> String {
        let name = format!("{}{}", self.prefix, to_base36(self.next_name));
        self.next_name += 1;
        name
    }

    fn place_roots(&mut self, scope: Scope, roots: &[Expr]) {
        for &r in roots {
            self.info.entry(r).or_default().place(scope, 1);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // DISCOVERY
    // ═══════════════════════════════════════════════════════════════════════

    fn discover(&mut self, roots: &Body) -> Result<(), CompilerError> {
        let mut queue = VecDeque::new();
        let mut seen = HashSet::new();

        self.place_roots(None, roots.roots());
        for &r in roots.roots() {
            if seen.insert(r) {
                queue.push_back(r);
            }
        }

        while let Some(e) = queue.pop_front() {
            self.analysis.order.push(e);
            let node = self.cx.node(e);

            let mut children: Vec<(Expr, u32)> = Vec::new();
            for c in node.children()? {
                match children.iter_mut().find(|(x, _)| *x == c) {
                    Some((_, n)) => *n += 1,
                    None => children.push((c, 1)),
                }
            }
            for &(c, _) in &children {
                self.info.entry(c).or_default().parents += 1;
                if seen.insert(c) {
                    queue.push_back(c);
                }
            }

            if let ExprKind::Function(func) = &node.kind {
                for &p in &func.params {
                    let name = self.fresh_name();
                    if let ExprKind::Argument { index } = &self.cx.node(p).kind {
                        tracing::trace!(function = e.0, index, %name, "named parameter");
                    }
                    self.analysis.names.insert(p, name);
                }
                let body = self.cx.body(e)?;
                self.place_roots(Some(e), body.roots());
                for &r in body.roots() {
                    if seen.insert(r) {
                        queue.push_back(r);
                    }
                }
                self.analysis.bodies.insert(e, body);
            }

            self.analysis
                .children
                .insert(e, children.iter().map(|(c, _)| *c).collect());
            self.info.entry(e).or_default().children = children;
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // PLACEMENT PROPAGATION
    // ═══════════════════════════════════════════════════════════════════════

    /// Settles every node and returns them in settling order, parents first.
    fn propagate(&mut self) -> Result<Vec<Expr>, CompilerError> {
        let mut pending: HashMap<Expr, u32> = HashMap::new();
        let mut ready = VecDeque::new();
        for &e in &self.analysis.order {
            let parents = self.info.get(&e).map_or(0, |i| i.parents);
            if parents == 0 {
                ready.push_back(e);
            }
            pending.insert(e, parents);
        }

        let mut settled = Vec::with_capacity(self.analysis.order.len());
        while let Some(e) = ready.pop_front() {
            settled.push(e);
            let declared = self.settle(e)?;

            let own = self.cx.scope_of(e);
            let info = self.info.get(&e);
            let contributions: Vec<(Scope, u32)> = if declared {
                vec![(own, 1)]
            } else {
                info.map(|i| i.placements.clone()).unwrap_or_default()
            };
            let children = info.map(|i| i.children.clone()).unwrap_or_default();

            for (c, m) in children {
                let child = self.info.entry(c).or_default();
                for &(scope, n) in &contributions {
                    child.place(scope, n.saturating_mul(m));
                }
                if let Some(left) = pending.get_mut(&c) {
                    *left -= 1;
                    if *left == 0 {
                        ready.push_back(c);
                    }
                }
            }
        }

        if settled.len() < self.analysis.order.len() {
            return Err(CompilerError::with_details(
                ERR_CYCLIC_GRAPH,
                "The expression graph contains a cycle outside function bodies.",
                None,
                vec!["A slot was probably filled with an expression that contains it.".to_string()],
            ));
        }
        Ok(settled)
    }

    /// Decides one node once all of its placements are known.
    fn settle(&mut self, e: Expr) -> Result<bool, CompilerError> {
        let node = self.cx.node(e);
        let own = node.scope;
        let flags = node.flags;
        let placements = self
            .info
            .get(&e)
            .map(|i| i.placements.clone())
            .unwrap_or_default();
        let total: u32 = placements.iter().map(|(_, n)| *n).sum();
        let captured = placements.iter().any(|(s, _)| *s != own);

        let declared =
            flags.must_declare || (!flags.isnt_assignable && (total >= PLACEMENT_CAP || captured));

        if declared || node.kind_tag() == NodeKind::Argument {
            if let Some((scope, _)) = placements
                .iter()
                .find(|(s, _)| !is_within(self.cx, *s, own))
            {
                return Err(CompilerError::with_details(
                    ERR_SCOPE_LEAK,
                    &format!(
                        "{:?} node {} is used outside the function it was created in.",
                        node.kind_tag(),
                        e.0
                    ),
                    Some(format!("created in {:?}, used in {:?}", own, scope)),
                    vec![
                        "Create the value before entering the function, or pass it as a parameter."
                            .to_string(),
                    ],
                ));
            }
        }

        if flags.is_awaited {
            self.analysis.suspending.insert(own);
            if !declared {
                self.analysis
                    .suspending
                    .extend(placements.iter().map(|(s, _)| *s));
            }
        }

        if declared {
            tracing::trace!(node = e.0, total, captured, "declared");
            self.analysis.declared.insert(e);
        }
        Ok(declared)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // RESOURCES
    // ═══════════════════════════════════════════════════════════════════════

    /// Children first. Function bodies are not part of a node's value, so a
    /// function literal never depends on a resource itself.
    fn classify_resources(&mut self, settled: &[Expr]) {
        let mut awaits_inline: HashSet<Expr> = HashSet::new();
        for &e in settled.iter().rev() {
            let flags = self.cx.flags(e);
            let children = self.analysis.children.get(&e).map_or(&[][..], Vec::as_slice);
            let depends = flags.has_resources
                || children
                    .iter()
                    .any(|c| self.analysis.resource_dependent.contains(c));
            let awaits = flags.is_awaited
                || children
                    .iter()
                    .any(|c| !self.analysis.declared.contains(c) && awaits_inline.contains(c));

            if awaits {
                awaits_inline.insert(e);
            }
            if depends {
                self.analysis.resource_dependent.insert(e);
                if self.analysis.declared.contains(&e) && !awaits {
                    tracing::trace!(node = e.0, "declared as accessor");
                    self.analysis.accessors.insert(e);
                }
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // DECLARATION ORDER
    // ═══════════════════════════════════════════════════════════════════════

    /// Groups declarations by scope, sorts each group so a declaration
    /// follows the same-scope declarations it refers to, then names them.
    fn order_declarations(&mut self) {
        let mut grouped: HashMap<Scope, Vec<Expr>> = HashMap::new();
        let mut scopes: Vec<Scope> = vec![None];
        for &e in &self.analysis.order {
            if self.analysis.bodies.contains_key(&e) {
                scopes.push(Some(e));
            }
            if self.analysis.declared.contains(&e) {
                grouped.entry(self.cx.scope_of(e)).or_default().push(e);
            }
        }

        let mut ordered: HashMap<Scope, Vec<Expr>> = HashMap::new();
        for (&scope, decls) in &grouped {
            let mut state: HashMap<Expr, bool> = HashMap::new();
            let mut out = Vec::with_capacity(decls.len());
            for &d in decls {
                self.visit_declaration(d, scope, &grouped, &mut state, &mut out);
            }
            ordered.insert(scope, out);
        }

        for scope in scopes {
            let Some(decls) = ordered.remove(&scope) else {
                continue;
            };
            for &d in &decls {
                let name = self.fresh_name();
                self.analysis.names.insert(d, name);
            }
            self.analysis.declarations.insert(scope, decls);
        }
    }

    /// Depth-first placement of `d` after its dependencies. `state` maps a
    /// node to `false` while it is being visited and `true` once placed;
    /// revisiting an in-progress node breaks a recursion cycle.
    fn visit_declaration(
        &self,
        d: Expr,
        scope: Scope,
        grouped: &HashMap<Scope, Vec<Expr>>,
        state: &mut HashMap<Expr, bool>,
        out: &mut Vec<Expr>,
    ) {
        if state.contains_key(&d) {
            return;
        }
        state.insert(d, false);
        let mut deps = Vec::new();
        let mut visited = HashSet::from([d]);
        self.collect_references(d, scope, grouped, &mut visited, &mut deps);
        for dep in deps {
            self.visit_declaration(dep, scope, grouped, state, out);
        }
        state.insert(d, true);
        out.push(d);
    }

    /// Same-scope declarations named anywhere in the expansion of `e`,
    /// including the bodies of function literals it contains.
    fn collect_references(
        &self,
        e: Expr,
        scope: Scope,
        grouped: &HashMap<Scope, Vec<Expr>>,
        visited: &mut HashSet<Expr>,
        out: &mut Vec<Expr>,
    ) {
        let mut next: Vec<Expr> = self.analysis.children.get(&e).cloned().unwrap_or_default();
        if let Some(body) = self.analysis.bodies.get(&e) {
            next.extend_from_slice(body.roots());
            if let Some(inner) = grouped.get(&Some(e)) {
                next.extend_from_slice(inner);
            }
        }

        for c in next {
            if self.analysis.declared.contains(&c) {
                let own = self.cx.scope_of(c);
                if own == scope {
                    if !out.contains(&c) {
                        out.push(c);
                    }
                    continue;
                }
                if !is_within(self.cx, own, scope) {
                    continue;
                }
            }
            if visited.insert(c) {
                self.collect_references(c, scope, grouped, visited, out);
            }
        }
    }

    fn warn_unreachable_slots(&self) {
        for i in 0..self.cx.len() {
            let e = Expr(i as u32);
            if self.analysis.children.contains_key(&e) {
                continue;
            }
            if let ExprKind::Slot(target) = &self.cx.node(e).kind {
                if target.get().is_none() {
                    tracing::warn!(node = e.0, "slot was never filled");
                }
            }
        }
    }
}
