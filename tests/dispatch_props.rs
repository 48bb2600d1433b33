mod common;

use cmix_node::{Chunk, ModuleDef, PayloadStream};
use common::*;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

const BATCH: u32 = 32;

/// Split `[0, BATCH)` at `cuts` and deliver the pieces in a random order.
fn shuffled_pieces() -> impl Strategy<Value = Vec<Chunk>> {
    proptest::collection::btree_set(1..BATCH, 0..10).prop_flat_map(|cuts: BTreeSet<u32>| {
        let mut bounds = vec![0];
        bounds.extend(cuts);
        bounds.push(BATCH);
        let pieces: Vec<Chunk> = bounds.windows(2).map(|w| Chunk::new(w[0], w[1])).collect();
        Just(pieces).prop_shuffle()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn any_input_chunking_yields_every_slot_once(
        pieces in shuffled_pieces(),
        threads in 1u8..4,
        threshold in prop_oneof![Just(0.0f32), Just(0.5), Just(1.0)],
    ) {
        let mut g = generator(4).new_graph("props", Arc::new(PayloadStream::new()));
        let a = g.add_module(ModuleDef::new("a", noop()).assignment_size(4).threads(threads));
        let b = g.add_module(
            ModuleDef::new("b", noop())
                .assignment_size(8)
                .chunk_size(4)
                .start_threshold(threshold)
                .threads(threads),
        );
        g.connect(a, b).unwrap();
        g.first(a);
        g.last(b);
        start(&mut g, BATCH);

        let last = pieces.len() - 1;
        for (i, piece) in pieces.iter().enumerate() {
            prop_assert_eq!(g.send(*piece), i == last);
        }

        let mut slots: Vec<u32> = drain(&g).iter().flat_map(|c| c.range()).collect();
        slots.sort_unstable();
        prop_assert_eq!(slots, (0..BATCH).collect::<Vec<_>>());
        prop_assert!(g.is_complete());
        g.wait();
        for id in [a, b] {
            let module = g.module(id).unwrap();
            prop_assert!(module.assignments().is_consistent());
            prop_assert_eq!(module.assignments().completed() as usize, module.assignments().len());
        }
    }
}
