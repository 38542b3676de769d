//! Performance benchmarks for slicepipe
//!
//! Run with: cargo bench --package slicepipe-core

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use slicepipe_core::{
    Arena, AttributeLayout, BeamStore, DomainKind, LocalFabric, MultiBeam, ParticleSlice,
    PayloadCodec, PipelineConfig, SliceMetadata, SlicePipeline, DEFAULT_GRANULARITY,
};

fn filled_beam(count: usize) -> MultiBeam {
    MultiBeam::new(
        1,
        1,
        AttributeLayout::BEAM,
        Box::new(move |_: usize, _: usize, out: &mut ParticleSlice| {
            for i in 0..count {
                let x = i as f64;
                out.push(&[x, x, x, 0.0, 0.0, 1.0, 1.0], &[i as i64]);
            }
        }),
    )
}

fn bench_pack_unpack(c: &mut Criterion) {
    let mut group = c.benchmark_group("pack_unpack");
    let codec = PayloadCodec::new(AttributeLayout::BEAM, DEFAULT_GRANULARITY).unwrap();

    for count in [64usize, 4096, 65536].iter() {
        group.throughput(Throughput::Bytes(
            (*count * AttributeLayout::BEAM.words_per_particle() * 8) as u64,
        ));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let mut arena = Arena::select(DomainKind::HostPinned).unwrap();
            let mut source = filled_beam(count);
            let mut sink = MultiBeam::empty(1, 1, AttributeLayout::BEAM);
            b.iter(|| {
                source.initialize_slice(0, 0, 0);
                let mut meta = SliceMetadata::new(1);
                let words = codec.write_metadata(&mut meta, &source, 0).unwrap();
                let mut buffer = arena.allocate(words as usize).unwrap();
                codec
                    .pack(arena.domain(), &mut buffer, &meta, &mut source, 0)
                    .unwrap();
                codec
                    .unpack(arena.domain(), &buffer, &meta, &mut sink, 0)
                    .unwrap();
                arena.free(buffer);
                black_box(sink.num_particles(0, 0));
            });
        });
    }

    group.finish();
}

fn bench_solo_ring(c: &mut Criterion) {
    let mut group = c.benchmark_group("solo_ring");
    group.sample_size(20);

    for slices in [8usize, 64].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(slices), slices, |b, &slices| {
            b.iter(|| {
                let transport = LocalFabric::create(1).pop().unwrap();
                let config = PipelineConfig::new(slices, 1, 0, 1);
                let mut pipeline = SlicePipeline::initialize(config, transport).unwrap();
                let mut beams = filled_beam(256);
                for is_final in [false, false, true] {
                    for slice in (0..slices).rev() {
                        pipeline.get_data(slice, &mut beams, 0).unwrap();
                        pipeline.put_data(slice, &mut beams, 0, is_final).unwrap();
                    }
                }
                black_box(pipeline.live_buffers());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_pack_unpack, bench_solo_ring);
criterion_main!(benches);
