//! One pipeline stage as its own process
//!
//! Start one process per stage, all with the same address list; stage `k`
//! listens on the `k`-th address. Stage `n - 1` injects the beam, every
//! step pushes the particles forward by one in `x`.
//!
//! Usage:
//! ```bash
//! cargo run --example stage -- 1 127.0.0.1:7000 127.0.0.1:7001 &
//! cargo run --example stage -- 0 127.0.0.1:7000 127.0.0.1:7001
//! ```

use slicepipe_core::{
    beam_idx, AttributeLayout, BeamStore, MultiBeam, ParticleSlice, PipelineConfig,
    SlicePipeline, TcpTransport,
};
use std::net::SocketAddr;

const SLICES: usize = 16;
const STEPS: usize = 6;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let stage: usize = args.next().ok_or("missing stage id")?.parse()?;
    let peers = args
        .map(|a| a.parse::<SocketAddr>())
        .collect::<Result<Vec<_>, _>>()?;
    let stages = peers.len();

    let transport = TcpTransport::bind(stage, peers)?;
    let config = PipelineConfig::new(SLICES, 1, stage, stages);
    let mut pipeline = SlicePipeline::initialize(config, transport)?;
    println!("Stage {} of {} ready ({:?})", stage, stages, pipeline.role());

    let mut beams = MultiBeam::new(
        1,
        1,
        AttributeLayout::BEAM,
        Box::new(|_: usize, slice: usize, out: &mut ParticleSlice| {
            for i in 0..(slice % 5) * 100 {
                out.push(&[0.0, 0.0, slice as f64, 0.0, 0.0, 1.0, 1.0], &[i as i64]);
            }
        }),
    );

    for step in (0..STEPS).filter(|t| t % stages == stages - 1 - stage) {
        let mut moved = 0;
        for slice in (0..SLICES).rev() {
            pipeline.get_data(slice, &mut beams, 0)?;
            let particles = beams.slice_mut(0, 0);
            particles
                .real_mut(beam_idx::X)
                .iter_mut()
                .for_each(|x| *x += 1.0);
            moved += particles.len();
            pipeline.put_data(slice, &mut beams, 0, step + 1 == STEPS)?;
        }
        println!("Step {}: advanced {} particles", step, moved);
    }

    pipeline.flush()?;
    println!("Done, {} buffers allocated", pipeline.buffer_allocations());
    Ok(())
}
