//! Safety Gate Tests for emitted script
//!
//! These tests pin the structural guarantees of emission:
//! - shared nodes are evaluated once
//! - declarations land in the scope the node was constructed in
//! - recursion and suspension render correctly
//! - store indices line up with the boundary arrays

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::builder::ScriptBuilder;
    use crate::finalize::{to_evaluation, to_script, CompileOptions, CompileResult};
    use crate::node::Expr;
    use crate::store::{IdentityResolver, PrefixResolver, ResourceMode, ScriptStores};
    use crate::validate::{ERR_SCOPE_LEAK, ERR_UNFILLED_SLOT};

    fn verified() -> CompileOptions {
        CompileOptions {
            verify_output: true,
            ..CompileOptions::default()
        }
    }

    fn script(cx: &ScriptBuilder, roots: &[Expr]) -> CompileResult {
        to_script(cx, roots, &verified(), &mut ScriptStores::new(), &IdentityResolver).unwrap()
    }

    fn evaluation(cx: &ScriptBuilder, root: Expr, options: CompileOptions) -> CompileResult {
        let options = CompileOptions {
            verify_output: true,
            ..options
        };
        to_evaluation(cx, root, &options, &mut ScriptStores::new(), &IdentityResolver).unwrap()
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // SHARING
    // ═══════════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_shared_expression_declared_once_in_body() {
        let cx = ScriptBuilder::new();
        let f = cx.function(0, |cx, _| {
            let e = cx.call(cx.ident("effect"), vec![]);
            vec![cx.call(cx.ident("a"), vec![e]), cx.call(cx.ident("b"), vec![e])]
        });
        assert_eq!(script(&cx, &[f]).code, "()=>{let _0=effect();a(_0);b(_0);};");
    }

    #[test]
    fn test_diamond_evaluates_side_effect_once() {
        let cx = ScriptBuilder::new();
        let e = cx.raw("effect()");
        let left = cx.call(cx.ident("f1"), vec![e]);
        let right = cx.call(cx.ident("f2"), vec![e]);
        let sum = cx.js().expr(left).text("+").expr(right).build();
        let a = cx.call(cx.ident("log"), vec![sum]);
        let b = cx.call(cx.ident("log2"), vec![sum]);

        let code = script(&cx, &[a, b]).code;
        assert_eq!(code, "let _0=effect(),_1=f1(_0)+f2(_0);log(_1);log2(_1);");
        assert_eq!(code.matches("effect()").count(), 1);
    }

    #[test]
    fn test_single_use_never_declared() {
        let cx = ScriptBuilder::new();
        let inner = cx.raw("inner()");
        let outer = cx.call(cx.ident("outer"), vec![inner]);
        let code = script(&cx, &[outer]).code;
        assert_eq!(code, "outer(inner());");
        assert!(!code.contains("let"));
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // SCOPES
    // ═══════════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_top_level_value_used_in_nested_function() {
        let cx = ScriptBuilder::new();
        let v = cx.call(cx.ident("compute"), vec![]);
        let f = cx.function(0, move |cx, _| cx.call(cx.ident("use"), vec![v]));
        let register = cx.call(cx.ident("register"), vec![f]);
        assert_eq!(
            script(&cx, &[register]).code,
            "let _0=compute();register(()=>use(_0));"
        );
    }

    #[test]
    fn test_capture_declared_in_constructing_scope() {
        let cx = ScriptBuilder::new();
        let f = cx.function(0, |cx, _| {
            let local = cx.call(cx.ident("local"), vec![]);
            let g = cx.function(0, move |cx, _| cx.call(cx.ident("use"), vec![local]));
            cx.call(cx.ident("run"), vec![g])
        });
        assert_eq!(
            script(&cx, &[f]).code,
            "()=>{let _0=local();return run(()=>use(_0))};"
        );
    }

    #[test]
    fn test_use_outside_constructing_scope_is_rejected() {
        let cx = ScriptBuilder::new();
        let slot = cx.slot();
        let f = cx.function(0, move |cx, _| {
            let inner = cx.call(cx.ident("make"), vec![]);
            cx.fill(slot, inner).unwrap();
            inner
        });
        let escape = cx.call(cx.ident("use"), vec![slot]);
        let err = to_script(
            &cx,
            &[f, escape],
            &CompileOptions::default(),
            &mut ScriptStores::new(),
            &IdentityResolver,
        )
        .unwrap_err();
        assert_eq!(err.code, ERR_SCOPE_LEAK);
    }

    #[test]
    fn test_unfilled_slot_fails_compilation() {
        let cx = ScriptBuilder::new();
        let slot = cx.slot();
        let call = cx.call(cx.ident("f"), vec![slot]);
        let err = to_script(
            &cx,
            &[call],
            &CompileOptions::default(),
            &mut ScriptStores::new(),
            &IdentityResolver,
        )
        .unwrap_err();
        assert_eq!(err.code, ERR_UNFILLED_SLOT);
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // RECURSION
    // ═══════════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_self_recursive_function() {
        let cx = ScriptBuilder::new();
        let me = cx.slot();
        let f = cx.function(1, move |cx, args| cx.call(me, vec![args[0]]));
        cx.fill(me, f).unwrap();
        let call = cx.call(f, vec![cx.raw("0")]);
        assert_eq!(script(&cx, &[call]).code, "let _1=(_0)=>_1(_0);_1(0);");
    }

    #[test]
    fn test_recursive_function_without_slot() {
        let cx = ScriptBuilder::new();
        let countdown = cx.recursive_function(1, |cx, me, args| {
            let next = cx.js().expr(args[0]).text("-1").build();
            cx.js()
                .expr(args[0])
                .text(">0&&")
                .expr(cx.call(me, vec![next]))
                .build()
        });
        let call = cx.call(countdown, vec![cx.raw("3")]);
        assert_eq!(script(&cx, &[call]).code, "let _1=(_0)=>_0>0&&_1(_0-1);_1(3);");
    }

    #[test]
    fn test_mutually_recursive_functions() {
        let cx = ScriptBuilder::new();
        let g_slot = cx.slot();
        let f = cx.function(0, move |cx, _| cx.call(g_slot, vec![]));
        let g = cx.function(0, move |cx, _| cx.call(f, vec![]));
        cx.fill(g_slot, g).unwrap();
        let start = cx.call(f, vec![]);

        let code = script(&cx, &[start]).code;
        assert_eq!(code, "let _0=()=>_1(),_1=()=>_0();_1();");
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // SUSPENSION
    // ═══════════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_awaited_node_makes_function_async() {
        let cx = ScriptBuilder::new();
        let f = cx.function(1, |cx, args| cx.await_(cx.call(cx.ident("load"), vec![args[0]])));
        let g = cx.function(1, |cx, args| cx.call(cx.ident("load"), vec![args[0]]));
        let a = cx.call(cx.ident("go"), vec![f]);
        let b = cx.call(cx.ident("go"), vec![g]);
        let result = script(&cx, &[a, b]);
        assert_eq!(result.code, "go(async(_0)=>await load(_0));go((_1)=>load(_1));");
        assert!(!result.top_level_await);
    }

    #[test]
    fn test_declared_await_in_function() {
        let cx = ScriptBuilder::new();
        let f = cx.function(0, |cx, _| {
            let data = cx.await_(cx.call(cx.ident("load"), vec![]));
            vec![cx.call(cx.ident("a"), vec![data]), cx.call(cx.ident("b"), vec![data])]
        });
        let on = cx.call(cx.ident("on"), vec![f]);
        assert_eq!(
            script(&cx, &[on]).code,
            "on(async()=>{let _0=await load();a(_0);b(_0);});"
        );
    }

    #[test]
    fn test_suspension_does_not_leak_to_enclosing_function() {
        let cx = ScriptBuilder::new();
        let f = cx.function(0, |cx, _| {
            let g = cx.function(0, |cx, _| cx.await_(cx.raw("p")));
            cx.call(cx.ident("defer"), vec![g])
        });
        assert_eq!(script(&cx, &[f]).code, "()=>defer(async()=>await p);");
    }

    #[test]
    fn test_top_level_await_reported() {
        let cx = ScriptBuilder::new();
        let wait = cx.await_(cx.raw("ready"));
        let result = script(&cx, &[wait]);
        assert_eq!(result.code, "await ready;");
        assert!(result.top_level_await);
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // STORES
    // ═══════════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_resource_from_two_subtrees_runtime_mode() {
        let cx = ScriptBuilder::new();
        let user = cx.resource("user", json!({"name": "ada"}));
        let a = cx.call(cx.ident("show"), vec![cx.get(user, "name")]);
        let b = cx.call(cx.ident("track"), vec![user]);

        let result = script(&cx, &[a, b]);
        assert_eq!(
            result.code,
            "let _0=__resources([\"user\"]);show(_0(0).name);track(_0(0));"
        );
        assert_eq!(result.resources, vec![("user".to_string(), json!({"name": "ada"}))]);
        assert!(result.modules.is_empty());
    }

    #[test]
    fn test_shared_resource_dependent_is_an_accessor() {
        let cx = ScriptBuilder::new();
        let n = cx.resource("n", json!(2));
        let doubled = cx.js().expr(n).text("*2").build();
        let a = cx.call(cx.ident("a"), vec![doubled]);
        let b = cx.call(cx.ident("b"), vec![doubled]);
        assert_eq!(
            script(&cx, &[a, b]).code,
            "let _0=__resources([\"n\"]),_1=()=>_0(0)*2;a(_1());b(_1());"
        );
    }

    #[test]
    fn test_awaited_resource_dependent_is_declared_as_value() {
        let cx = ScriptBuilder::new();
        let user = cx.resource("user", json!({"id": 1}));
        let data = cx.await_(cx.call(cx.ident("load"), vec![user]));
        let a = cx.call(cx.ident("a"), vec![data]);
        let b = cx.call(cx.ident("b"), vec![data]);
        let result = script(&cx, &[a, b]);
        assert_eq!(
            result.code,
            "let _0=__resources([\"user\"]),_1=await load(_0(0));a(_1);b(_1);"
        );
        assert!(result.top_level_await);
    }

    #[test]
    fn test_resource_dependent_over_inline_await_is_declared_as_value() {
        let cx = ScriptBuilder::new();
        let f = cx.function(0, |cx, _| {
            let n = cx.resource("n", json!(2));
            let fetched = cx.call(cx.get(cx.await_(cx.ident("api")), "get"), vec![n]);
            vec![cx.call(cx.ident("a"), vec![fetched]), cx.call(cx.ident("b"), vec![fetched])]
        });
        assert_eq!(
            script(&cx, &[f]).code,
            "let _0=__resources([\"n\"]);async()=>{let _1=(await api).get(_0(0));a(_1);b(_1);};"
        );
    }

    #[test]
    fn test_snapshot_mode_inlines_values() {
        let cx = ScriptBuilder::new();
        let user = cx.resource("user", json!({"name": "ada"}));
        let name = cx.get(user, "name");
        let result = evaluation(&cx, name, CompileOptions::evaluation());
        assert_eq!(
            result.code,
            "(async()=>{let _0=[{name:\"ada\"}];return _0[0].name})"
        );
    }

    #[test]
    fn test_evaluation_runtime_mode_takes_accessor_parameter() {
        let cx = ScriptBuilder::new();
        let user = cx.resource("user", json!(null));
        let options = CompileOptions {
            resource_mode: Some(ResourceMode::Runtime),
            ..CompileOptions::evaluation()
        };
        let result = evaluation(&cx, user, options);
        assert_eq!(result.code, "(async($r)=>{let _0=$r;return _0(0)})");
    }

    #[test]
    fn test_evaluation_without_stores_has_no_parameters() {
        let cx = ScriptBuilder::new();
        let sum = cx.raw("1+1");
        let result = evaluation(&cx, sum, CompileOptions::evaluation());
        assert_eq!(result.code, "(async()=>1+1)");
        assert!(result.modules.is_empty());
        assert!(result.resources.is_empty());
    }

    #[test]
    fn test_module_store_statement_mode() {
        let cx = ScriptBuilder::new();
        let mount = cx.import("/island.js", "mount");
        let call = cx.call(mount, vec![cx.ref_placeholder()]);
        let result = script(&cx, &[call]);
        assert_eq!(
            result.code,
            "let _0=await Promise.all([\"/island.js\"].map(u=>import(u)));_0[0].mount($refs[0]);"
        );
        assert_eq!(result.modules, vec!["/island.js".to_string()]);
        assert_eq!(result.refs, 1);
        assert!(result.top_level_await);
    }

    #[test]
    fn test_module_store_evaluation_mode() {
        let cx = ScriptBuilder::new();
        let draw = cx.import("/chart.js", "draw");
        let result = evaluation(&cx, draw, CompileOptions::evaluation());
        assert_eq!(
            result.code,
            "(async($m)=>{let _0=await Promise.all($m.map(u=>import(u)));return _0[0].draw})"
        );
        assert!(!result.top_level_await);
    }

    #[test]
    fn test_module_used_in_function_suspends_top_level_only() {
        let cx = ScriptBuilder::new();
        let f = cx.function(0, |cx, _| cx.call(cx.import("/a.js", "run"), vec![]));
        let result = script(&cx, &[f]);
        assert_eq!(
            result.code,
            "let _0=await Promise.all([\"/a.js\"].map(u=>import(u)));()=>_0[0].run();"
        );
        assert!(result.top_level_await);
    }

    #[test]
    fn test_module_addresses_resolved() {
        let cx = ScriptBuilder::new();
        let m = cx.module("./island.js");
        let resolver = PrefixResolver::new("/assets");
        let result = to_script(&cx, &[m], &verified(), &mut ScriptStores::new(), &resolver).unwrap();
        assert_eq!(result.modules, vec!["/assets/island.js".to_string()]);
        assert!(result.code.contains("[\"/assets/island.js\"]"));
    }

    #[test]
    fn test_reused_stores_keep_indices() {
        let mut stores = ScriptStores::new();

        let cx = ScriptBuilder::new();
        let a = cx.import("/a.js", "x");
        to_script(&cx, &[a], &verified(), &mut stores, &IdentityResolver).unwrap();

        let cx = ScriptBuilder::new();
        let b = cx.import("/b.js", "y");
        let a = cx.import("/a.js", "x");
        let result = to_script(&cx, &[b, a], &verified(), &mut stores, &IdentityResolver).unwrap();
        assert_eq!(result.modules, vec!["/a.js".to_string(), "/b.js".to_string()]);
        assert!(result.code.ends_with("_0[1].y;_0[0].x;"));
    }

    #[test]
    fn test_ref_placeholders_numbered_in_emission_order() {
        let cx = ScriptBuilder::new();
        let first = cx.ref_placeholder();
        let second = cx.ref_placeholder();
        let call = cx.call(cx.ident("bind"), vec![second, first, second]);
        let result = script(&cx, &[call]);
        assert_eq!(result.code, "bind($refs[0],$refs[1],$refs[0]);");
        assert_eq!(result.refs, 2);
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // DETERMINISM
    // ═══════════════════════════════════════════════════════════════════════════════

    fn build_page(cx: &ScriptBuilder) -> Vec<Expr> {
        let user = cx.resource("user", json!({"id": 7}));
        let widget = cx.import("/widget.js", "Widget");
        let shared = cx.new_(widget, vec![user]);
        let f = cx.function(1, move |cx, args| {
            let update = cx.call(cx.get(shared, "update"), vec![args[0]]);
            cx.await_(update)
        });
        vec![
            cx.call(cx.ident("listen"), vec![f]),
            cx.call(cx.get(shared, "render"), vec![cx.ref_placeholder()]),
        ]
    }

    #[test]
    fn test_compilation_is_deterministic() {
        let cx1 = ScriptBuilder::new();
        let roots1 = build_page(&cx1);
        let cx2 = ScriptBuilder::new();
        let roots2 = build_page(&cx2);

        let first = script(&cx1, &roots1);
        let again = script(&cx1, &roots1);
        let other = script(&cx2, &roots2);
        assert_eq!(first, again);
        assert_eq!(first, other);
        assert_eq!(first.code.matches("new _").count(), 1);
    }
}
