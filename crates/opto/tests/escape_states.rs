//! Escape states: fixed point properties and the iteration budget.

use opto::escape::{ConnectionGraph, EscapeState};
use opto::ir::{BasicType, Klass, KlassFlags, KlassTable, Node, PtrNull, Type, TypePtr};
use opto::kit::GraphKit;
use opto::settings::{Builder, Flags, builder};
use opto::{Compile, OptoError, RetryReason};

struct Objects {
    outer: Node,
    inner: Node,
    other: Node,
}

fn klasses() -> (KlassTable, Klass) {
    let mut kt = KlassTable::new(true);
    let node = kt.define_instance(
        "Node",
        None,
        &[("next", BasicType::Object), ("val", BasicType::Int)],
        KlassFlags::empty(),
    );
    (kt, node)
}

/// `outer.next = inner; inner.next = param`, plus an unrelated object. With `leak`, `outer` is
/// also handed to an unknown method.
fn build(b: Builder, leak: bool) -> (Compile, Objects) {
    let _ = env_logger::try_init();
    let (kt, k) = klasses();
    let mut c = Compile::new(Flags::new(b), kt);
    let mut kit = GraphKit::new(&mut c);
    let param = kit.parameter(0, Type::Ptr(TypePtr::inst(k, false, PtrNull::Maybe)));
    let outer = kit.new_instance(k);
    let inner = kit.new_instance(k);
    let other = kit.new_instance(k);
    kit.store_field(outer, "next", inner);
    kit.store_field(inner, "next", param);
    let one = kit.c.graph.intcon(1);
    kit.store_field(other, "val", one);
    let loaded = kit.load_field(outer, "next");
    kit.load_field(loaded, "val");
    if leak {
        kit.call_static("leak", &[outer], None, None, &[]);
    }
    kit.safepoint(&[outer, other]);
    kit.return_value(None);
    let objs = Objects {
        outer: kit.c.graph.ideal_allocation(outer).unwrap(),
        inner: kit.c.graph.ideal_allocation(inner).unwrap(),
        other: kit.c.graph.ideal_allocation(other).unwrap(),
    };
    (c, objs)
}

fn states(c: &Compile, objs: &Objects) -> [Option<EscapeState>; 3] {
    [objs.outer, objs.inner, objs.other].map(|n| c.escape_state(n))
}

#[test]
fn converged_states_are_consistent() {
    let (mut c, _) = build(builder(), false);
    ConnectionGraph::do_analysis(&mut c, 0).unwrap();
    let cg = c.congraph().expect("local objects keep the graph");
    for (p, ptn) in cg.iter() {
        assert_ne!(ptn.es, EscapeState::Unknown, "{p}: {ptn}");
        assert!(ptn.fields_es >= ptn.es, "{p}: {ptn}");
        if ptn.is_java_object() && ptn.es > EscapeState::NoEscape {
            assert!(!ptn.scalar_replaceable(), "{p}: {ptn}");
        }
    }
}

#[test]
fn extra_iterations_change_nothing() {
    let (mut c, objs) = build(builder(), false);
    ConnectionGraph::do_analysis(&mut c, 0).unwrap();
    let converged = states(&c, &objs);

    let mut b = builder();
    b.set("escape_analysis_max_iterations", "1000").unwrap();
    b.set("escape_analysis_timeout_ms", "60000").unwrap();
    let (mut c2, objs2) = build(b, false);
    ConnectionGraph::do_analysis(&mut c2, 0).unwrap();
    assert_eq!(states(&c2, &objs2), converged);
}

#[test]
fn analysis_is_deterministic() {
    let (mut a, oa) = build(builder(), true);
    let (mut b, ob) = build(builder(), true);
    ConnectionGraph::do_analysis(&mut a, 0).unwrap();
    ConnectionGraph::do_analysis(&mut b, 0).unwrap();
    assert_eq!(states(&a, &oa), states(&b, &ob));
    assert_eq!(a.graph.live_nodes(), b.graph.live_nodes());
}

#[test]
fn more_escaping_uses_only_raise_states() {
    let (mut local, lo) = build(builder(), false);
    let (mut leaky, le) = build(builder(), true);
    ConnectionGraph::do_analysis(&mut local, 0).unwrap();
    ConnectionGraph::do_analysis(&mut leaky, 0).unwrap();

    let before = states(&local, &lo);
    // Without a connection graph every object counts as escaping.
    let after = states(&leaky, &le).map(|s| s.or(Some(EscapeState::GlobalEscape)));
    for (b, a) in before.iter().zip(after.iter()) {
        let b = b.unwrap_or(EscapeState::GlobalEscape);
        assert!(a.unwrap() >= b, "{b} became {a:?}");
    }
    // The leaked object drags what it references along.
    assert!(!leaky.not_global_escape(le.outer));
    assert!(!leaky.not_global_escape(le.inner));
    // The unrelated object is untouched.
    assert_eq!(leaky.escape_state(le.other), Some(EscapeState::NoEscape));
    assert_eq!(local.escape_state(lo.outer), Some(EscapeState::NoEscape));
}

#[test]
fn iteration_budget_bails_without_mutation() {
    let mut b = builder();
    b.set("escape_analysis_max_iterations", "1").unwrap();
    let (mut c, objs) = build(b, false);
    let live = c.graph.live_nodes();
    let macros = c.graph.macro_nodes().to_vec();

    let err = ConnectionGraph::do_analysis(&mut c, 0).unwrap_err();
    assert_eq!(err, OptoError::Retry(RetryReason::NoEscapeAnalysis));
    assert_eq!(c.failing(), Some(RetryReason::NoEscapeAnalysis));
    assert!(c.congraph().is_none());
    assert_eq!(c.graph.live_nodes(), live);
    assert_eq!(c.graph.macro_nodes(), &macros[..]);
    // Every consumer sees the conservative answer.
    for n in [objs.outer, objs.inner, objs.other] {
        assert_eq!(c.escape_state(n), None);
        assert!(!c.not_global_escape(n));
        assert!(!c.is_scalar_replaceable(n));
    }
}

#[test]
fn later_invocation_asks_for_single_run() {
    let mut b = builder();
    b.set("escape_analysis_max_iterations", "1").unwrap();
    let (mut c, _) = build(b, false);
    let err = ConnectionGraph::do_analysis(&mut c, 1).unwrap_err();
    assert_eq!(err, OptoError::Retry(RetryReason::NoIterativeEscapeAnalysis));
    assert_eq!(err.to_string(), "retry without iterative escape analysis");
}
