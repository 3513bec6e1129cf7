//! Copy direction of lowered array copies.

use opto::arraycopy::{self, ArrayCopyKind};
use opto::ir::klass::ARRAY_BASE_OFFSET;
use opto::ir::{BasicType, KlassTable, Node, Opcode, PtrNull, Type, TypePtr, slot};
use opto::kit::GraphKit;
use opto::settings::{Flags, GcKind, builder};
use opto::Compile;

fn compile() -> Compile {
    let _ = env_logger::try_init();
    let mut b = builder();
    b.gc(GcKind::NoOp);
    Compile::new(Flags::new(b), KlassTable::new(true))
}

fn int_array(kit: &mut GraphKit<'_>, i: usize, len: i32) -> Node {
    let k = kit.c.klasses.array_of(BasicType::Int);
    let ty = TypePtr::ary(k, BasicType::Int, Some(len), true, PtrNull::NotNull);
    kit.parameter(i, Type::Ptr(ty))
}

/// Destination element indices of the stores, in the order they happen.
fn store_order(c: &Compile) -> Vec<i32> {
    let g = &c.graph;
    let stores: Vec<Node> = g
        .live_node_iter()
        .filter(|&n| g.op(n) == Opcode::Store)
        .collect();
    let mut cur = stores
        .iter()
        .copied()
        .find(|&st| !g.input(st, slot::mem::MEMORY).is_some_and(|m| stores.contains(&m)));
    let mut order = Vec::new();
    while let Some(st) = cur {
        let off = c.adr_type(st).and_then(|t| t.offset.known()).unwrap();
        order.push((off - ARRAY_BASE_OFFSET) / 4);
        cur = g
            .outs(st)
            .iter()
            .copied()
            .find(|&u| stores.contains(&u) && g.input(u, slot::mem::MEMORY) == Some(st));
    }
    assert_eq!(order.len(), stores.len(), "stores form one chain");
    order
}

fn copy_within(src_pos: i32, dest_pos: i32, count: i32) -> Vec<i32> {
    let mut c = compile();
    let mut kit = GraphKit::new(&mut c);
    let a = int_array(&mut kit, 0, 16);
    let sp = kit.c.graph.intcon(src_pos);
    let dp = kit.c.graph.intcon(dest_pos);
    let n = kit.c.graph.intcon(count);
    let ac = kit.make_arraycopy(ArrayCopyKind::ArrayCopy, a, sp, a, dp, n, true, false);
    kit.return_value(None);
    assert!(arraycopy::lower(&mut c, ac));
    assert!(c.graph.is_dead(ac));
    // The positions are known: no run time test.
    assert!(c.graph.live_node_iter().all(|n| c.graph.op(n) != Opcode::If));
    store_order(&c)
}

#[test]
fn overlapping_copy_up_runs_backward() {
    // Source below destination: copying forward would read already overwritten elements.
    assert_eq!(copy_within(0, 5, 3), [7, 6, 5]);
    assert_eq!(copy_within(2, 3, 4), [6, 5, 4, 3]);
}

#[test]
fn overlapping_copy_down_runs_forward() {
    assert_eq!(copy_within(5, 0, 3), [0, 1, 2]);
    assert_eq!(copy_within(4, 4, 2), [4, 5]);
}

#[test]
fn fresh_destination_skips_overlap_test() {
    let mut c = compile();
    let mut kit = GraphKit::new(&mut c);
    let src = int_array(&mut kit, 0, 16);
    let sp = kit.parameter(1, Type::Int(None));
    let n = kit.c.graph.intcon(4);
    let dest = kit.new_array(BasicType::Int, n);
    let zero = kit.c.graph.intcon(0);
    let ac = kit.make_arraycopy(ArrayCopyKind::ArrayCopy, src, sp, dest, zero, n, true, true);
    kit.return_value(None);
    assert!(arraycopy::lower(&mut c, ac));
    let g = &c.graph;
    for op in [Opcode::If, Opcode::CmpI, Opcode::Region] {
        assert!(g.live_node_iter().all(|x| g.op(x) != op), "{op:?} emitted");
    }
    assert_eq!(store_order(&c), [0, 1, 2, 3]);
}
