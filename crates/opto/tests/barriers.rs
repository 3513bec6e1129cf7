//! Barrier policies: fences around accesses and card mark elision.

use opto::barrier::Decorators;
use opto::escape::ConnectionGraph;
use opto::ir::{BasicType, Graph, Klass, KlassFlags, KlassTable, Opcode, PtrNull, Type, TypePtr};
use opto::kit::GraphKit;
use opto::macro_expand;
use opto::settings::{Builder, Flags, GcKind, builder};
use opto::Compile;
use proptest::prelude::*;

const FENCES: [Opcode; 4] = [
    Opcode::MemBarAcquire,
    Opcode::MemBarRelease,
    Opcode::MemBarVolatile,
    Opcode::MemBarCPUOrder,
];

const ORDERS: [Decorators; 4] = [
    Decorators::MO_UNORDERED,
    Decorators::MO_ACQUIRE,
    Decorators::MO_RELEASE,
    Decorators::MO_SEQ_CST,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    Read,
    Write,
    Atomic,
}

fn fence_counts(g: &Graph) -> [usize; 4] {
    FENCES.map(|op| g.live_node_iter().filter(|&n| g.op(n) == op).count())
}

/// Fences the memory model asks for, as `[acquire, release, volatile, cpu order]`.
fn required(mo: Decorators, kind: Kind, iriw: bool) -> [usize; 4] {
    let seq_cst = mo == Decorators::MO_SEQ_CST;
    let acquire = mo == Decorators::MO_ACQUIRE;
    let release = mo == Decorators::MO_RELEASE;
    let b = usize::from;
    match kind {
        Kind::Read => [b(seq_cst || acquire), 0, b(seq_cst && iriw), 0],
        Kind::Write => [0, b(seq_cst || release), b(seq_cst && !iriw), 0],
        // A read-modify-write is fenced like a tiny synchronized block.
        Kind::Atomic => [
            b(seq_cst || acquire),
            b(release || (seq_cst && !iriw)),
            b(seq_cst && iriw),
            2,
        ],
    }
}

fn holder(kt: &mut KlassTable) -> Klass {
    kt.define_instance(
        "Holder",
        None,
        &[
            ("i", BasicType::Int),
            ("a", BasicType::Object),
            ("b", BasicType::Object),
        ],
        KlassFlags::empty(),
    )
}

fn compile(b: Builder) -> (Compile, Klass) {
    let _ = env_logger::try_init();
    let mut kt = KlassTable::new(true);
    let k = holder(&mut kt);
    (Compile::new(Flags::new(b), kt), k)
}

proptest! {
    #[test]
    fn fences_match_memory_model(order in 0usize..4, kind in 0usize..3, iriw in any::<bool>()) {
        let mo = ORDERS[order];
        let kind = [Kind::Read, Kind::Write, Kind::Atomic][kind];
        let mut b = builder();
        b.gc(GcKind::NoOp);
        b.set("support_iriw", if iriw { "true" } else { "false" }).unwrap();
        let (mut c, k) = compile(b);
        let mut kit = GraphKit::new(&mut c);
        let obj = kit.parameter(0, Type::Ptr(TypePtr::inst(k, false, PtrNull::NotNull)));
        let offset = kit.c.klasses.nonstatic_fields(k)[0].offset;
        let adr = kit.basic_plus_adr(obj, obj, i64::from(offset));
        let one = kit.c.graph.intcon(1);

        let before = fence_counts(&kit.c.graph);
        match kind {
            Kind::Read => {
                kit.access_load_at(obj, adr, BasicType::Int, Type::Int(None), mo);
            }
            Kind::Write => {
                kit.access_store_at(obj, adr, BasicType::Int, one, mo);
            }
            Kind::Atomic => {
                kit.access_atomic_add_at(obj, adr, BasicType::Int, one, mo);
            }
        }
        let after = fence_counts(&kit.c.graph);
        let added: Vec<usize> = after.iter().zip(before.iter()).map(|(a, b)| a - b).collect();
        prop_assert_eq!(added, required(mo, kind, iriw).to_vec(), "{:?} {:?} iriw={}", mo, kind, iriw);
    }
}

fn card_marks(g: &Graph) -> usize {
    g.live_node_iter().filter(|&n| g.op(n) == Opcode::StoreCM).count()
}

fn store_references(kit: &mut GraphKit<'_>, obj: Klass, call_first: bool) -> opto::ir::Node {
    let object = kit.c.klasses.object();
    let v = kit.parameter(0, Type::Ptr(TypePtr::inst(object, false, PtrNull::NotNull)));
    let h = kit.new_instance(obj);
    if call_first {
        kit.call_static("unrelated", &[], None, None, &[]);
    }
    kit.store_field(h, "a", v);
    kit.store_field(h, "b", v);
    h
}

#[test]
fn initializing_stores_are_not_marked() {
    let (mut c, k) = compile(builder());
    let mut kit = GraphKit::new(&mut c);
    store_references(&mut kit, k, false);
    assert_eq!(card_marks(&c.graph), 0);
}

#[test]
fn stores_after_a_call_are_marked() {
    let (mut c, k) = compile(builder());
    let mut kit = GraphKit::new(&mut c);
    store_references(&mut kit, k, true);
    assert_eq!(card_marks(&c.graph), 2);
}

#[test]
fn initial_marks_kept_when_not_reduced() {
    let mut b = builder();
    b.set("reduce_initial_card_marks", "false").unwrap();
    let (mut c, k) = compile(b);
    let mut kit = GraphKit::new(&mut c);
    store_references(&mut kit, k, false);
    assert_eq!(card_marks(&c.graph), 2);
}

#[test]
fn marks_of_eliminated_object_are_removed() {
    let (mut c, k) = compile(builder());
    let mut kit = GraphKit::new(&mut c);
    let h = store_references(&mut kit, k, true);
    kit.safepoint(&[h]);
    kit.return_value(None);
    let alloc = c.graph.ideal_allocation(h).unwrap();
    assert_eq!(card_marks(&c.graph), 2);

    c.optimize().unwrap();

    assert!(c.graph.is_dead(alloc));
    assert_eq!(card_marks(&c.graph), 0);
    let casts = c
        .graph
        .live_node_iter()
        .filter(|&n| c.graph.op(n) == Opcode::CastP2X)
        .count();
    assert_eq!(casts, 0);
}

#[test]
fn satb_barriers_of_eliminated_object_are_removed() {
    let mut b = builder();
    b.gc(GcKind::Satb);
    let (mut c, k) = compile(b);
    let mut kit = GraphKit::new(&mut c);
    let h = store_references(&mut kit, k, true);
    kit.safepoint(&[h]);
    kit.return_value(None);
    let alloc = c.graph.ideal_allocation(h).unwrap();
    let count = |g: &Graph, op: Opcode| g.live_node_iter().filter(|&n| g.op(n) == op).count();
    assert_eq!(count(&c.graph, Opcode::WriteBarrier), 2);

    ConnectionGraph::do_analysis(&mut c, 0).unwrap();
    macro_expand::eliminate_macro_nodes(&mut c).unwrap();

    let g = &c.graph;
    assert!(g.is_dead(alloc));
    // Nothing is overwritten any more; the stored value is still published.
    assert_eq!(count(g, Opcode::WriteBarrier), 0);
    assert_eq!(count(g, Opcode::Store), 0);
    assert!(count(g, Opcode::EnqueueBarrier) > 0);
}
