//! The policy of a collector that needs no barriers.

use crate::barrier::BarrierSetC2;

/// Accesses are emitted exactly as the fences and memory nodes require; nothing is added.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpBarrierSetC2;

impl BarrierSetC2 for NoOpBarrierSetC2 {
    fn name(&self) -> &'static str {
        "no-op"
    }
}

#[cfg(test)]
mod tests {
    use crate::barrier::Decorators;
    use crate::compile::Compile;
    use crate::ir::{BasicType, KlassFlags, KlassTable, Opcode, slot};
    use crate::kit::GraphKit;
    use crate::settings::{Flags, GcKind, builder};

    #[test]
    fn reference_store_is_a_single_node() {
        let mut kt = KlassTable::new(false);
        let k = kt.define_instance("Node", None, &[("next", BasicType::Object)], KlassFlags::empty());
        let mut b = builder();
        b.gc(GcKind::NoOp);
        let mut c = Compile::new(Flags::new(b), kt);
        let live = {
            let mut kit = GraphKit::new(&mut c);
            let a = kit.new_instance(k);
            let p = kit.parameter(0, kit.c.graph.ty(a).clone());
            let live = kit.c.graph.live_nodes();
            let st = kit.store_field_with(a, "next", p, Decorators::empty());
            assert_eq!(kit.c.graph.op(st), Opcode::Store);
            assert_eq!(kit.c.graph.input(st, slot::mem::VALUE), Some(p));
            live
        };
        // The store and its address, nothing else.
        assert_eq!(c.graph.live_nodes(), live + 3);
    }
}
