//! Allocation elimination end to end: escape analysis, memory splitting, scalar replacement of
//! the fields into debug info and removal of the allocation.

use opto::escape::ConnectionGraph;
use opto::ir::{
    BasicType, BoolTest, Graph, Klass, KlassFlags, KlassTable, Node, NodeInfo, Opcode, PtrNull, Type, TypePtr,
    slot,
};
use opto::kit::GraphKit;
use opto::macro_expand;
use opto::settings::{Builder, Flags, builder};
use opto::Compile;

fn compile(kt: KlassTable, b: Builder) -> Compile {
    let _ = env_logger::try_init();
    Compile::new(Flags::new(b), kt)
}

fn point(kt: &mut KlassTable) -> Klass {
    kt.define_instance(
        "Point",
        None,
        &[("x", BasicType::Int), ("y", BasicType::Int)],
        KlassFlags::empty(),
    )
}

fn live(g: &Graph, op: Opcode) -> Vec<Node> {
    g.live_node_iter().filter(|&n| g.op(n) == op).collect()
}

/// The debug inputs of `sfpt`.
fn debug_inputs(g: &Graph, sfpt: Node) -> Vec<Node> {
    let jvms = g.data(sfpt).jvms().unwrap();
    (jvms.debug_start()..jvms.debug_end())
        .filter_map(|i| g.input(sfpt, i))
        .collect()
}

/// The field values recorded for the scalar replaced object `sobj` at `sfpt`.
fn fields_of(g: &Graph, sfpt: Node, sobj: Node) -> Vec<Node> {
    let jvms = g.data(sfpt).jvms().unwrap();
    let NodeInfo::ScalarObject(info) = g.info(sobj) else {
        panic!("{sobj} does not describe an object");
    };
    let first = jvms.scloff + info.first_index;
    (first..first + info.n_fields)
        .map(|i| g.input(sfpt, i).unwrap())
        .collect()
}

/// `x = 3; y = 4` into a fresh Point, then a safepoint keeping it alive.
#[test]
fn point_scenario() {
    let mut kt = KlassTable::new(true);
    let k = point(&mut kt);
    let mut c = compile(kt, builder());
    let mut kit = GraphKit::new(&mut c);
    let p = kit.new_instance(k);
    let three = kit.c.graph.intcon(3);
    let four = kit.c.graph.intcon(4);
    kit.store_field(p, "x", three);
    kit.store_field(p, "y", four);
    let sfpt = kit.safepoint(&[p]);
    kit.return_value(None);
    let alloc = c.graph.ideal_allocation(p).unwrap();

    c.optimize().unwrap();

    let g = &c.graph;
    assert!(g.is_dead(alloc));
    assert!(live(g, Opcode::Allocate).is_empty());
    assert!(live(g, Opcode::CallRuntime).is_empty());
    assert!(live(g, Opcode::Store).is_empty(), "no heap write survives");
    assert!(live(g, Opcode::StoreCM).is_empty(), "no card mark");
    let sobj = debug_inputs(g, sfpt)
        .into_iter()
        .find(|&d| g.op(d) == Opcode::SafePointScalarObject)
        .expect("the object is described in the debug info");
    let values: Vec<_> = fields_of(g, sfpt, sobj)
        .into_iter()
        .map(|v| g.find_int_con(v))
        .collect();
    assert_eq!(values, [Some(3), Some(4)]);
}

/// Loads of a non-escaping object see the values stored into it.
#[test]
fn loads_keep_their_values() {
    let mut kt = KlassTable::new(true);
    let k = point(&mut kt);
    let mut c = compile(kt, builder());
    let mut kit = GraphKit::new(&mut c);
    let a = kit.parameter(0, Type::Int(None));
    let p = kit.new_instance(k);
    let five = kit.c.graph.intcon(5);
    kit.store_field(p, "x", a);
    kit.store_field(p, "y", five);
    let x = kit.load_field(p, "x");
    let y = kit.load_field(p, "y");
    let top = kit.c.graph.top();
    let sum = kit.c.graph.add_simple(Opcode::AddI, &[top, x, y], Type::Int(None));
    let ret = kit.return_value(Some(sum));
    let alloc = c.graph.ideal_allocation(p).unwrap();

    c.optimize().unwrap();

    let g = &c.graph;
    assert!(g.is_dead(alloc));
    assert!(live(g, Opcode::Load).is_empty());
    assert_eq!(g.input(ret, slot::PARMS), Some(sum));
    assert_eq!(g.input(sum, 1), Some(a));
    assert_eq!(g.find_int_con(g.input(sum, 2).unwrap()), Some(5));
}

/// Every field kind survives the trip through the debug info.
#[test]
fn all_field_kinds_round_trip() {
    let mut kt = KlassTable::new(true);
    let holder = kt.define_instance(
        "Holder",
        None,
        &[
            ("i", BasicType::Int),
            ("l", BasicType::Long),
            ("d", BasicType::Double),
            ("o", BasicType::Object),
            ("z", BasicType::Int),
        ],
        KlassFlags::empty(),
    );
    let object = kt.object();
    let mut c = compile(kt, builder());
    let mut kit = GraphKit::new(&mut c);
    let d = kit.parameter(0, Type::Double);
    let o = kit.parameter(1, Type::Ptr(TypePtr::inst(object, false, PtrNull::Maybe)));
    let h = kit.new_instance(holder);
    let seven = kit.c.graph.intcon(7);
    let minus_one = kit.c.graph.longcon(-1);
    kit.store_field(h, "i", seven);
    kit.store_field(h, "l", minus_one);
    kit.store_field(h, "d", d);
    kit.store_field(h, "o", o);
    let sfpt = kit.safepoint(&[h]);
    kit.return_value(None);
    let alloc = c.graph.ideal_allocation(h).unwrap();

    // What an interpreter would find in the object at the safepoint, by field offset.
    let zero = c.graph.intcon(0);
    let mut expected: Vec<(i32, Node)> = c
        .klasses
        .nonstatic_fields(holder)
        .iter()
        .map(|f| {
            let v = match f.name.as_str() {
                "i" => seven,
                "l" => minus_one,
                "d" => d,
                "o" => o,
                _ => zero,
            };
            (f.offset, v)
        })
        .collect();
    expected.sort_by_key(|&(off, _)| off);
    let expected: Vec<Node> = expected.into_iter().map(|(_, v)| v).collect();

    c.optimize().unwrap();

    let g = &c.graph;
    assert!(g.is_dead(alloc));
    let sobj = debug_inputs(g, sfpt)
        .into_iter()
        .find(|&n| g.op(n) == Opcode::SafePointScalarObject)
        .unwrap();
    assert_eq!(fields_of(g, sfpt, sobj), expected);
}

/// Without allocation elimination the safepoint keeps referring to the object itself.
#[test]
fn disabled_elimination_keeps_object() {
    let mut kt = KlassTable::new(true);
    let k = point(&mut kt);
    let mut b = builder();
    b.set("eliminate_allocations", "false").unwrap();
    let mut c = compile(kt, b);
    let mut kit = GraphKit::new(&mut c);
    let p = kit.new_instance(k);
    let three = kit.c.graph.intcon(3);
    kit.store_field(p, "x", three);
    let sfpt = kit.safepoint(&[p]);
    kit.return_value(None);
    let alloc = c.graph.ideal_allocation(p).unwrap();

    c.optimize().unwrap();

    let g = &c.graph;
    assert_eq!(g.op(alloc), Opcode::CallRuntime);
    assert!(debug_inputs(g, sfpt).contains(&p));
    assert!(live(g, Opcode::SafePointScalarObject).is_empty());
}

/// Evaluate `v` on the path entering `region` through input `path`.
fn on_path(g: &Graph, region: Node, path: usize, v: Node) -> Node {
    if g.op(v) == Opcode::Phi && g.input(v, 0) == Some(region) {
        g.input(v, path).unwrap()
    } else {
        v
    }
}

/// `p = cond ? new Point(x = 1) : new Point(x = 2)` followed only by a safepoint.
#[test]
fn reduced_merge_never_mixes_objects() {
    let mut kt = KlassTable::new(true);
    let k = point(&mut kt);
    let mut c = compile(kt, builder());
    let mut kit = GraphKit::new(&mut c);
    let cond = kit.parameter(0, Type::Int(None));
    let zero = kit.c.graph.intcon(0);
    let cmp = kit.cmp_i(cond, zero);
    let bol = kit.bool(cmp, BoolTest::Ne);
    let (t, f) = kit.make_if(bol, 0.5);
    let entry = kit.state();

    kit.set_control(t);
    let a = kit.new_instance(k);
    let one = kit.c.graph.intcon(1);
    kit.store_field(a, "x", one);
    let sa = kit.state();

    kit.set_state(entry);
    kit.set_control(f);
    let b = kit.new_instance(k);
    let two = kit.c.graph.intcon(2);
    kit.store_field(b, "x", two);
    let sb = kit.state();

    let merged = kit.merge_states(&[sa, sb]);
    kit.set_state(merged);
    let region = kit.control();
    let ty = Type::Ptr(TypePtr::inst(k, true, PtrNull::NotNull));
    let phi = kit.make_phi(region, &[a, b], ty, None);
    let sfpt = kit.safepoint(&[phi]);
    kit.return_value(None);

    ConnectionGraph::do_analysis(&mut c, 0).unwrap();

    let g = &c.graph;
    let jvms = g.data(sfpt).jvms().unwrap().clone();
    let smerge = debug_inputs(g, sfpt)
        .into_iter()
        .find(|&n| g.op(n) == Opcode::SafePointScalarMerge)
        .expect("the merge is described in the debug info");
    let NodeInfo::ScalarMerge(info) = g.info(smerge) else {
        panic!("{smerge} is not a merge description");
    };
    let selector = g.input(sfpt, jvms.scloff + info.merge_pointer_idx + 1).unwrap();
    assert_eq!(g.req(smerge), 3, "root and one description per object");

    // Path 1 came through A's branch, path 2 through B's.
    for (path, want) in [(1, 1), (2, 2)] {
        let sel = on_path(g, region, path, selector);
        let sel = usize::try_from(g.find_int_con(sel).unwrap()).unwrap();
        let sobj = g.input(smerge, 1 + sel).unwrap();
        let x = on_path(g, region, path, fields_of(g, sfpt, sobj)[0]);
        assert_eq!(g.find_int_con(x), Some(want), "path {path}");
    }

    // Both objects then disappear.
    let (aa, ba) = (g.ideal_allocation(a), g.ideal_allocation(b));
    macro_expand::eliminate_macro_nodes(&mut c).unwrap();
    for alloc in [aa, ba].into_iter().flatten() {
        assert!(c.graph.is_dead(alloc));
    }
}

/// An object handed to an unknown method stays.
#[test]
fn escaping_object_survives_as_runtime_call() {
    let mut kt = KlassTable::new(true);
    let k = point(&mut kt);
    let mut c = compile(kt, builder());
    let mut kit = GraphKit::new(&mut c);
    let p = kit.new_instance(k);
    let three = kit.c.graph.intcon(3);
    kit.store_field(p, "x", three);
    kit.call_static("publish", &[p], None, None, &[]);
    kit.return_value(None);
    let alloc = c.graph.ideal_allocation(p).unwrap();

    c.optimize().unwrap();

    let g = &c.graph;
    assert_eq!(g.op(alloc), Opcode::CallRuntime);
    match g.info(alloc) {
        NodeInfo::Call(ci) => assert_eq!(ci.name, "new_instance"),
        other => panic!("unexpected payload {other:?}"),
    }
    assert_eq!(live(g, Opcode::Store).len(), 1);
    assert!(g.macro_nodes().is_empty());
}
