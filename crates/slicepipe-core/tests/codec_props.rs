//! Property tests for the payload codec

use proptest::prelude::*;
use slicepipe_core::{
    round_up, Arena, AttributeLayout, BeamStore, DomainKind, MultiBeam, PayloadCodec,
    SliceMetadata,
};

#[derive(Debug, Clone)]
struct Particle {
    reals: Vec<f64>,
    ints: Vec<i64>,
}

fn layout() -> impl Strategy<Value = AttributeLayout> {
    (0usize..4, 0usize..3, 0usize..3, 0usize..2).prop_map(|(rb, rx, ib, ix)| {
        // at least one carried attribute so payloads are not always empty
        let rb = rb.max(1);
        AttributeLayout::new(rb, rb + rx, ib, ib + ix).unwrap()
    })
}

fn particles(layout: AttributeLayout, species: usize) -> impl Strategy<Value = Vec<Vec<Particle>>> {
    let particle = (
        prop::collection::vec(-1.0e6f64..1.0e6, layout.real_total),
        prop::collection::vec(any::<i64>(), layout.int_total),
    )
        .prop_map(|(reals, ints)| Particle { reals, ints });
    prop::collection::vec(prop::collection::vec(particle, 0..20), species)
}

fn case() -> impl Strategy<Value = (AttributeLayout, usize, Vec<Vec<Particle>>)> {
    (layout(), 1usize..12, 1usize..4).prop_flat_map(|(layout, granularity, species)| {
        (Just(layout), Just(granularity), particles(layout, species))
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_roundtrip_keeps_carried_attributes((layout, granularity, input) in case()) {
        let codec = PayloadCodec::new(layout, granularity).unwrap();
        let mut source = MultiBeam::empty(input.len(), 1, layout);
        for (species, list) in input.iter().enumerate() {
            for p in list {
                source.slice_mut(species, 0).push(&p.reals, &p.ints);
            }
        }

        let mut meta = SliceMetadata::new(input.len());
        let words = codec.write_metadata(&mut meta, &source, 0).unwrap();
        let expected: u64 = input
            .iter()
            .map(|list| {
                round_up(list.len() as u64, granularity as u64)
                    * (layout.real_in_buffer + layout.int_in_buffer) as u64
            })
            .sum();
        prop_assert_eq!(words, expected);
        prop_assert_eq!(meta.payload_words(), words);
        if words == 0 {
            return Ok(());
        }

        let mut arena = Arena::select(DomainKind::HostPinned).unwrap();
        let mut buffer = arena.allocate(words as usize).unwrap();
        codec.pack(arena.domain(), &mut buffer, &meta, &mut source, 0).unwrap();
        for species in 0..input.len() {
            prop_assert_eq!(source.num_particles(species, 0), 0);
        }

        let mut sink = MultiBeam::empty(input.len(), 1, layout);
        codec.unpack(arena.domain(), &buffer, &meta, &mut sink, 0).unwrap();
        arena.free(buffer);

        for (species, list) in input.iter().enumerate() {
            let out = sink.slice(species, 0);
            prop_assert_eq!(out.len(), list.len());
            for (i, p) in list.iter().enumerate() {
                for comp in 0..layout.real_total {
                    let want = if comp < layout.real_in_buffer { p.reals[comp] } else { 0.0 };
                    prop_assert_eq!(out.real(comp)[i].to_bits(), want.to_bits());
                }
                for comp in 0..layout.int_total {
                    let want = if comp < layout.int_in_buffer { p.ints[comp] } else { 0 };
                    prop_assert_eq!(out.int(comp)[i], want);
                }
            }
        }
        prop_assert_eq!(arena.live(), 0);
    }

    #[test]
    fn prop_offsets_stay_inside_payload((layout, granularity, input) in case()) {
        let codec = PayloadCodec::new(layout, granularity).unwrap();
        let counts: Vec<u64> = input.iter().map(|list| list.len() as u64).collect();
        let mut words = vec![codec.payload_words(&counts).unwrap()];
        words.extend_from_slice(&counts);
        let meta = SliceMetadata::from_words(words, counts.len()).unwrap();

        for (species, &count) in counts.iter().enumerate() {
            if count == 0 {
                continue;
            }
            for comp in 0..layout.real_in_buffer {
                let end = codec.real_offset(&meta, species, comp) as u64 + count;
                prop_assert!(end <= meta.payload_words());
            }
            for comp in 0..layout.int_in_buffer {
                let end = codec.int_offset(&meta, species, comp) as u64 + count;
                prop_assert!(end <= meta.payload_words());
            }
        }
    }
}
