//! The built-in rule set.
//!
//! Rules never prune the engine's traversal; the scans below walk the
//! subtrees they care about themselves, stopping at the boundaries where the
//! statement they look for would bind to something nearer.

use capsule_js_common::config::Severity;
use phf::phf_set;

use super::{Rule, RuleContext};
use crate::syntax::ast::{Node, NodeKind, NodeType};

/// Array methods whose first-argument callback runs once per element.
static ITERATION_METHODS: phf::Set<&'static str> = phf_set! {
    "forEach", "map", "filter", "find", "findIndex", "some", "every",
    "reduce", "reduceRight", "flatMap",
};

/// Iteration methods that silently drop an async callback's promise.
static ASYNC_BROKEN_METHODS: phf::Set<&'static str> = phf_set! {
    "forEach", "filter", "find", "findIndex", "some", "every",
};

/// Globals through which the Function constructor is reachable by name.
static GLOBAL_ALIASES: phf::Set<&'static str> = phf_set! {
    "globalThis", "self", "window",
};

/// The built-in rules, in reporting order.
pub static RULES: &[Rule] = &[
    Rule {
        name: "no-infinite-loop",
        default_severity: Severity::Error,
        description: "Reject loops with a constant-true condition and no reachable exit",
        visitors: &[
            (NodeType::WhileStatement, no_infinite_loop),
            (NodeType::DoWhileStatement, no_infinite_loop),
            (NodeType::ForStatement, no_infinite_loop),
        ],
    },
    Rule {
        name: "no-nested-loops",
        default_severity: Severity::Warn,
        description: "Warn on loops nested inside loops (potential quadratic complexity)",
        visitors: &[
            (NodeType::WhileStatement, no_nested_loops),
            (NodeType::DoWhileStatement, no_nested_loops),
            (NodeType::ForStatement, no_nested_loops),
            (NodeType::ForInStatement, no_nested_loops),
            (NodeType::ForOfStatement, no_nested_loops),
        ],
    },
    Rule {
        name: "no-adapter-in-loop",
        default_severity: Severity::Warn,
        description: "Warn on adapter calls made once per loop iteration",
        visitors: &[
            (NodeType::WhileStatement, adapter_in_loop),
            (NodeType::DoWhileStatement, adapter_in_loop),
            (NodeType::ForStatement, adapter_in_loop),
            (NodeType::ForInStatement, adapter_in_loop),
            (NodeType::ForOfStatement, adapter_in_loop),
            (NodeType::CallExpression, adapter_in_iteration_callback),
        ],
    },
    Rule {
        name: "no-unhandled-async",
        default_severity: Severity::Warn,
        description: "Warn on async callbacks passed to array iteration methods",
        visitors: &[(NodeType::CallExpression, unhandled_async)],
    },
    Rule {
        name: "no-dangerous-globals",
        default_severity: Severity::Error,
        description: "Reject dynamic code evaluation and module loading; warn on process access",
        visitors: &[
            (NodeType::CallExpression, dangerous_invocation),
            (NodeType::NewExpression, dangerous_invocation),
            (NodeType::Identifier, process_read),
        ],
    },
];

// ── Shared helpers ───────────────────────────────────────────────────────

fn loop_body(node: &Node) -> Option<&Node> {
    match &node.kind {
        NodeKind::WhileStatement { body, .. }
        | NodeKind::DoWhileStatement { body, .. }
        | NodeKind::ForStatement { body, .. }
        | NodeKind::ForInStatement { body, .. }
        | NodeKind::ForOfStatement { body, .. } => Some(body),
        _ => None,
    }
}

fn is_function_node(node: &Node) -> bool {
    matches!(
        node.node_type(),
        NodeType::FunctionExpression | NodeType::ArrowFunctionExpression
    )
}

fn is_async_function_node(node: &Node) -> bool {
    match &node.kind {
        NodeKind::FunctionExpression { function } | NodeKind::ArrowFunctionExpression { function } => {
            function.is_async
        }
        _ => false,
    }
}

fn function_body(node: &Node) -> Option<&Node> {
    match &node.kind {
        NodeKind::FunctionExpression { function } | NodeKind::ArrowFunctionExpression { function } => {
            Some(&function.body)
        }
        _ => None,
    }
}

/// The iteration method name, when `node` is `<expr>.method(...)` with a
/// method from [`ITERATION_METHODS`].
fn iteration_method_name(node: &Node) -> Option<&str> {
    let NodeKind::CallExpression { callee, .. } = &node.kind else {
        return None;
    };
    let NodeKind::MemberExpression {
        property,
        computed: false,
        ..
    } = &callee.kind
    else {
        return None;
    };
    let name = property.identifier_name()?;
    ITERATION_METHODS.contains(name).then_some(name)
}

/// The dotted path of an `adapters.X.Y(...)` call.
fn adapter_call_path(node: &Node) -> Option<String> {
    let NodeKind::CallExpression { callee, .. } = &node.kind else {
        return None;
    };
    let NodeKind::MemberExpression {
        object,
        property,
        computed: false,
        ..
    } = &callee.kind
    else {
        return None;
    };
    let method = property.identifier_name()?;
    let NodeKind::MemberExpression {
        object: root,
        property: adapter,
        computed: false,
        ..
    } = &object.kind
    else {
        return None;
    };
    let adapter = adapter.identifier_name()?;
    if root.identifier_name()? != "adapters" {
        return None;
    }
    Some(format!("adapters.{adapter}.{method}"))
}

// ── R1: no-infinite-loop ─────────────────────────────────────────────────

/// Whether the subtree holds an exit statement that would bind to the
/// enclosing loop. The search stops at nested loops and switches (a `break`
/// would bind there) and at function boundaries (a `return` or `throw`
/// would bind there).
fn subtree_has_exit(node: &Node) -> bool {
    match node.node_type() {
        NodeType::BreakStatement | NodeType::ReturnStatement | NodeType::ThrowStatement => true,
        t if t.is_loop() || t == NodeType::SwitchStatement || t.is_function() => false,
        _ => {
            let mut found = false;
            node.for_each_child(&mut |child| {
                if !found && subtree_has_exit(child) {
                    found = true;
                }
            });
            found
        }
    }
}

fn no_infinite_loop(cx: &mut RuleContext<'_, '_>, node: &Node) {
    let label = match &node.kind {
        NodeKind::WhileStatement { test, .. } if test.is_literal_true() => "while (true)",
        NodeKind::DoWhileStatement { test, .. } if test.is_literal_true() => "do...while (true)",
        NodeKind::ForStatement { test: None, .. } => "for (;;)",
        _ => return,
    };
    let Some(body) = loop_body(node) else { return };
    if !subtree_has_exit(body) {
        cx.report(
            node,
            format!("{label} loop has no break, return, or throw and will never terminate"),
        );
    }
}

// ── R2: no-nested-loops ──────────────────────────────────────────────────

fn contains_loop(node: &Node) -> bool {
    match node.node_type() {
        t if t.is_loop() => true,
        t if t.is_function() => false,
        _ => {
            let mut found = false;
            node.for_each_child(&mut |child| {
                if !found && contains_loop(child) {
                    found = true;
                }
            });
            found
        }
    }
}

fn no_nested_loops(cx: &mut RuleContext<'_, '_>, node: &Node) {
    let Some(body) = loop_body(node) else { return };
    if contains_loop(body) {
        cx.report(
            node,
            "loop nested inside a loop; this can turn into quadratic work on larger inputs",
        );
    }
}

// ── R3: no-adapter-in-loop ───────────────────────────────────────────────

/// Scan for adapter calls, treating iteration-method callbacks as loop
/// context but stopping at every other function boundary.
fn scan_adapter_calls(cx: &mut RuleContext<'_, '_>, node: &Node) {
    match &node.kind {
        NodeKind::CallExpression {
            callee, arguments, ..
        } => {
            if let Some(path) = adapter_call_path(node) {
                cx.report(
                    node,
                    format!(
                        "{path}(...) runs once per iteration; move it out of the loop or batch the requests"
                    ),
                );
            }
            scan_adapter_calls(cx, callee);
            let iteration = iteration_method_name(node).is_some();
            for (index, arg) in arguments.iter().enumerate() {
                if is_function_node(arg) {
                    if index == 0 && iteration {
                        if let Some(body) = function_body(arg) {
                            scan_adapter_calls(cx, body);
                        }
                    }
                } else {
                    scan_adapter_calls(cx, arg);
                }
            }
        }
        _ if is_function_node(node) => {}
        _ => node.for_each_child(&mut |child| scan_adapter_calls(cx, child)),
    }
}

fn adapter_in_loop(cx: &mut RuleContext<'_, '_>, node: &Node) {
    if let Some(body) = loop_body(node) {
        scan_adapter_calls(cx, body);
    }
}

fn adapter_in_iteration_callback(cx: &mut RuleContext<'_, '_>, node: &Node) {
    if iteration_method_name(node).is_none() {
        return;
    }
    let NodeKind::CallExpression { arguments, .. } = &node.kind else {
        return;
    };
    if let Some(first) = arguments.first() {
        if is_function_node(first) {
            if let Some(body) = function_body(first) {
                scan_adapter_calls(cx, body);
            }
        }
    }
}

// ── R4: no-unhandled-async ───────────────────────────────────────────────

fn unhandled_async(cx: &mut RuleContext<'_, '_>, node: &Node) {
    let Some(method) = iteration_method_name(node) else {
        return;
    };
    let NodeKind::CallExpression { arguments, .. } = &node.kind else {
        return;
    };
    let Some(first) = arguments.first() else {
        return;
    };
    if !is_async_function_node(first) {
        return;
    }
    if ASYNC_BROKEN_METHODS.contains(method) {
        cx.report(
            node,
            format!("{method}() does not await an async callback; use a for...of loop instead"),
        );
    } else if method == "map" {
        cx.report(
            node,
            "map() with an async callback returns an array of promises; wrap the result in Promise.all(...) and await it",
        );
    }
}

// ── R5: no-dangerous-globals ─────────────────────────────────────────────

fn dangerous_invocation(cx: &mut RuleContext<'_, '_>, node: &Node) {
    let callee = match &node.kind {
        NodeKind::CallExpression { callee, .. } => callee,
        NodeKind::NewExpression { callee, .. } => callee,
        _ => return,
    };
    match &callee.kind {
        NodeKind::Identifier { name } => match name.as_str() {
            "eval" => cx.report(node, "eval() is not allowed in sandboxed code"),
            "Function" => cx.report(node, "the Function constructor is not allowed in sandboxed code"),
            "require" => cx.report(node, "require() is not available in sandboxed code"),
            _ => {}
        },
        NodeKind::MemberExpression {
            object,
            property,
            computed: false,
            ..
        } => match property.identifier_name() {
            Some("Function") => {
                if object
                    .identifier_name()
                    .is_some_and(|name| GLOBAL_ALIASES.contains(name))
                {
                    cx.report(
                        node,
                        "the Function constructor is not allowed in sandboxed code",
                    );
                }
            }
            Some("constructor") => cx.report(
                node,
                "invoking .constructor is not allowed in sandboxed code (Function constructor escape)",
            ),
            _ => {}
        },
        _ => {}
    }
}

fn process_read(cx: &mut RuleContext<'_, '_>, node: &Node) {
    if node.identifier_name() != Some("process") {
        return;
    }
    if let Some(parent) = cx.parent() {
        match &parent.kind {
            // Property-name position: `obj.process`.
            NodeKind::MemberExpression {
                property,
                computed: false,
                ..
            } if RuleContext::same_node(property, node) => return,
            // Key position or shorthand patterns.
            NodeKind::Property {
                key, shorthand, ..
            } if *shorthand || RuleContext::same_node(key, node) => return,
            NodeKind::MethodDefinition { key, computed: false, .. }
                if RuleContext::same_node(key, node) =>
            {
                return
            }
            NodeKind::PropertyDefinition { key, computed: false, .. }
                if RuleContext::same_node(key, node) =>
            {
                return
            }
            // Declaration positions.
            NodeKind::VariableDeclarator { id, .. } if RuleContext::same_node(id, node) => return,
            NodeKind::ObjectPattern { .. }
            | NodeKind::ArrayPattern { .. }
            | NodeKind::RestElement { .. } => return,
            NodeKind::AssignmentPattern { left, .. } if RuleContext::same_node(left, node) => {
                return
            }
            // Any identifier hanging directly off a function node is a
            // parameter.
            _ if parent.node_type().is_function() => return,
            _ => {}
        }
    }
    cx.report_with(
        node,
        Severity::Warn,
        "process is not available to sandboxed code; environment values come from the read-only env global",
    );
}

#[cfg(test)]
mod tests {
    use capsule_js_common::config::AnalysisSettings;

    use crate::analyze::{analyze, AnalysisReport};

    fn run(source: &str) -> AnalysisReport {
        analyze(source, &AnalysisSettings::default()).unwrap()
    }

    fn rule_names(findings: &[crate::analyze::Finding]) -> Vec<&'static str> {
        findings.iter().map(|f| f.rule).collect()
    }

    // ── no-infinite-loop ────────────────────────────────────────────────

    #[test]
    fn flags_while_true_without_exit() {
        let report = run("while (true) { console.log('x'); }");
        assert_eq!(rule_names(&report.errors), vec!["no-infinite-loop"]);
    }

    #[test]
    fn flags_for_without_test_and_do_while_true() {
        let report = run("for (;;) { tick(); }");
        assert_eq!(rule_names(&report.errors), vec!["no-infinite-loop"]);

        let report = run("do { tick(); } while (true)");
        assert_eq!(rule_names(&report.errors), vec!["no-infinite-loop"]);
    }

    #[test]
    fn break_return_or_throw_clears_the_loop() {
        for src in [
            "while (true) { if (done()) break; }",
            "while (true) { if (done()) return 1; }",
            "while (true) { if (done()) throw new Error('stop'); }",
        ] {
            let report = run(src);
            assert!(report.errors.is_empty(), "{src} flagged: {:?}", report.errors);
        }
    }

    #[test]
    fn exit_bound_to_a_nested_scope_does_not_count() {
        // The break binds to the inner loop.
        let report = run("while (true) { for (const x of xs) { break; } }");
        assert!(rule_names(&report.errors).contains(&"no-infinite-loop"));

        // The return binds to the nested function.
        let report = run("while (true) { const f = () => { return 1; }; f(); }");
        assert!(rule_names(&report.errors).contains(&"no-infinite-loop"));
    }

    #[test]
    fn bounded_while_is_fine() {
        let report = run("let i = 0; while (i < 10) { i++; }");
        assert!(report.errors.is_empty());
    }

    // ── no-nested-loops ─────────────────────────────────────────────────

    #[test]
    fn flags_nested_loops() {
        let report = run("for (const a of xs) { for (const b of ys) { use(a, b); } }");
        assert_eq!(rule_names(&report.warnings), vec!["no-nested-loops"]);
    }

    #[test]
    fn loop_inside_a_nested_function_is_not_nested() {
        let report = run("for (const a of xs) { const f = () => { for (const b of ys) use(b); }; }");
        assert!(rule_names(&report.warnings)
            .iter()
            .all(|r| *r != "no-nested-loops"));
    }

    // ── no-adapter-in-loop ──────────────────────────────────────────────

    #[test]
    fn flags_adapter_call_in_for_of() {
        let report = run("for (const id of [1, 2]) { await adapters.api.get(id); }");
        assert_eq!(rule_names(&report.warnings), vec!["no-adapter-in-loop"]);
        assert!(report.warnings[0].message.contains("adapters.api.get"));
    }

    #[test]
    fn flags_adapter_call_in_iteration_callback() {
        let report = run("ids.map((id) => adapters.api.get(id))");
        assert!(rule_names(&report.warnings).contains(&"no-adapter-in-loop"));
    }

    #[test]
    fn adapter_call_in_plain_callback_inside_loop_is_not_flagged() {
        // The callback is an ordinary function boundary, not a loop context.
        let report = run("for (const x of xs) { defer(() => adapters.api.get(x)); }");
        assert!(rule_names(&report.warnings)
            .iter()
            .all(|r| *r != "no-adapter-in-loop"));
    }

    #[test]
    fn iteration_callback_inside_loop_reports_once() {
        let report =
            run("for (const g of groups) { g.ids.forEach((id) => adapters.api.get(id)); }");
        let count = report
            .warnings
            .iter()
            .filter(|f| f.rule == "no-adapter-in-loop")
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn adapter_call_outside_any_loop_is_fine() {
        let report = run("await adapters.api.get(1)");
        assert!(rule_names(&report.warnings)
            .iter()
            .all(|r| *r != "no-adapter-in-loop"));
    }

    // ── no-unhandled-async ──────────────────────────────────────────────

    #[test]
    fn flags_async_foreach() {
        let report = run("items.forEach(async (x) => { await adapters.api.put(x); })");
        assert!(rule_names(&report.warnings).contains(&"no-unhandled-async"));
    }

    #[test]
    fn async_map_gets_the_promise_all_advisory() {
        let report = run("items.map(async (x) => x * 2)");
        let finding = report
            .warnings
            .iter()
            .find(|f| f.rule == "no-unhandled-async")
            .unwrap();
        assert!(finding.message.contains("Promise.all"));
    }

    #[test]
    fn sync_callbacks_are_fine() {
        let report = run("items.map((x) => x * 2)");
        assert!(rule_names(&report.warnings)
            .iter()
            .all(|r| *r != "no-unhandled-async"));
    }

    #[test]
    fn async_reduce_is_not_flagged() {
        let report = run("items.reduce(async (acc, x) => (await acc) + x, 0)");
        assert!(rule_names(&report.warnings)
            .iter()
            .all(|r| *r != "no-unhandled-async"));
    }

    // ── no-dangerous-globals ────────────────────────────────────────────

    #[test]
    fn flags_eval_and_function_constructor() {
        for src in [
            "eval('1 + 1')",
            "new Function('return 1')()",
            "Function('return 1')()",
            "globalThis.Function('x')",
            "window.Function('x')",
            "self.Function('x')",
            "(function f() {}).constructor('return 1')()",
            "Object.getPrototypeOf(fn).constructor('x')",
        ] {
            let report = run(src);
            assert!(
                rule_names(&report.errors).contains(&"no-dangerous-globals"),
                "{src} not flagged"
            );
        }
    }

    #[test]
    fn flags_require_as_error() {
        let report = run("const fs = require('fs');");
        assert!(rule_names(&report.errors).contains(&"no-dangerous-globals"));
    }

    #[test]
    fn warns_on_process_reads() {
        for src in ["process", "process.env", "const v = process.env.PATH;"] {
            let report = run(src);
            assert!(
                rule_names(&report.warnings).contains(&"no-dangerous-globals"),
                "{src} not warned"
            );
        }
    }

    #[test]
    fn process_as_a_property_name_is_fine() {
        let report = run("const status = job.process;");
        assert!(rule_names(&report.warnings)
            .iter()
            .all(|r| *r != "no-dangerous-globals"));
    }
}
