//! Pipeline driver
//!
//! A stage calls [`SlicePipeline::get_data`] before it advances a slice and
//! [`SlicePipeline::put_data`] afterwards. Slices move to the next stage
//! as a metadata message followed, when non-empty, by a payload message.
//! Transfers are only driven from inside these two calls: every
//! `put_data` polls all slices once, `get_data` blocks on the slice it
//! hands out.

use crate::arena::{select_arena, Arena};
use crate::codec::{PayloadCodec, MAX_PAYLOAD_WORDS};
use crate::config::PipelineConfig;
use crate::directory::SlotDirectory;
use crate::meta::SliceMetadata;
use crate::particles::BeamStore;
use crate::state::{CommProgress, SlotState};
use crate::storage::DomainKind;
use crate::topology::{StageLinks, StageRole, Tags};
use crate::transport::{Completion, Transport};
use crate::{Error, Result};

/// Per-stage slice transport
pub struct SlicePipeline<T: Transport> {
    config: PipelineConfig,
    transport: T,
    arena: Arena,
    codec: PayloadCodec,
    links: StageLinks,
    role: StageRole,
    tags: Tags,
    slots: SlotDirectory<T::Request>,
}

/// Test or wait for the request in `request`, clearing it once finished
fn finish<T: Transport>(
    transport: &mut T,
    request: &mut Option<T::Request>,
    slice: usize,
    blocking: bool,
) -> Result<Option<Completion>> {
    let Some(pending) = request.as_mut() else {
        return Err(Error::invariant(slice, "no transport request in flight"));
    };
    let done = if blocking {
        Some(transport.wait(pending)?)
    } else {
        transport.test(pending)?
    };
    if done.is_some() {
        *request = None;
    }
    Ok(done)
}

impl<T: Transport> SlicePipeline<T> {
    /// Set up the slots of this stage and post the first receives
    pub fn initialize(config: PipelineConfig, transport: T) -> Result<Self> {
        config.validate()?;
        if transport.stage_id() != config.stage_id
            || transport.stage_count() != config.stage_count
        {
            return Err(Error::InvalidConfig(format!(
                "transport is stage {} of {}, configuration says {} of {}",
                transport.stage_id(),
                transport.stage_count(),
                config.stage_id,
                config.stage_count
            )));
        }
        if config.domain == DomainKind::Device && !transport.device_aware() {
            return Err(Error::DeviceMemoryUnsupported);
        }

        let arena = select_arena(config.domain)?;
        let codec = PayloadCodec::new(config.layout, config.granularity)?;
        let links = StageLinks::new(config.stage_id, config.stage_count, config.topology);
        let role = StageRole::of(config.stage_id, config.stage_count);
        let tags = Tags::new(config.total_slices);
        let initial = if role.is_origin() {
            SlotState::both(CommProgress::IdleToProduce)
        } else {
            SlotState::both(CommProgress::Sent)
        };
        let slots = SlotDirectory::new(config.total_slices, config.num_species, initial);

        tracing::info!(
            stage = config.stage_id,
            stages = config.stage_count,
            slices = config.total_slices,
            ?role,
            domain = %config.domain,
            topology = ?config.topology,
            "slice pipeline initialized"
        );

        let mut pipeline = Self {
            config,
            transport,
            arena,
            codec,
            links,
            role,
            tags,
            slots,
        };
        for slice in (0..pipeline.config.total_slices).rev() {
            pipeline.make_progress(slice, false)?;
        }
        Ok(pipeline)
    }

    /// Advance the transfers of `slice` as far as they can go
    ///
    /// With `blocking`, waits on every request in flight and requires both
    /// sub-channels to end up received.
    pub fn make_progress(&mut self, slice: usize, blocking: bool) -> Result<()> {
        let send_to = self.links.send_to;
        let receive_from = self.links.receive_from;
        let meta_tag = self.tags.metadata(slice);
        let data_tag = self.tags.data(slice);
        let num_species = self.config.num_species;
        let slot = self.slots.get_mut(slice)?;
        let transport = &mut self.transport;
        let arena = &mut self.arena;

        tracing::trace!(slice, blocking, state = ?slot.state, "progress");

        if slot.state.metadata == CommProgress::ReadyToSend {
            match send_to {
                Some(dest) => {
                    slot.metadata_request =
                        Some(transport.isend(dest, meta_tag, slot.meta.as_words())?);
                    slot.state.metadata = CommProgress::SendInProgress;
                    tracing::debug!(slice, dest, "metadata send posted");
                }
                None => slot.state.metadata = CommProgress::Sent,
            }
        }

        if slot.state.data == CommProgress::ReadyToSend {
            let words = slot.meta.payload_words();
            match send_to {
                Some(dest) if words > 0 => {
                    let buffer = slot.buffer.as_ref().ok_or_else(|| {
                        Error::invariant(slice, "payload announced without a buffer")
                    })?;
                    let host = buffer.to_host()?;
                    slot.request = Some(transport.isend(dest, data_tag, &host)?);
                    slot.state.data = CommProgress::SendInProgress;
                    tracing::debug!(slice, dest, words, "data send posted");
                }
                _ => {
                    slot.free_buffer(arena);
                    slot.state.data = CommProgress::Sent;
                }
            }
        }

        if slot.state.metadata == CommProgress::SendInProgress
            && finish(transport, &mut slot.metadata_request, slice, blocking)?.is_some()
        {
            slot.state.metadata = CommProgress::Sent;
            tracing::debug!(slice, "metadata send complete");
        }

        if slot.state.metadata == CommProgress::Sent {
            if let Some(source) = receive_from {
                slot.metadata_request = Some(transport.irecv(
                    source,
                    meta_tag,
                    SliceMetadata::len_words(num_species),
                )?);
                slot.state.metadata = CommProgress::ReceiveInProgress;
                tracing::debug!(slice, source, "metadata receive posted");
            }
        }

        if slot.state.metadata == CommProgress::ReceiveInProgress {
            match finish(transport, &mut slot.metadata_request, slice, blocking)? {
                Some(Completion::Received(words)) => {
                    slot.meta.copy_from_words(&words)?;
                    slot.state.metadata = CommProgress::Received;
                    tracing::debug!(slice, words = slot.meta.payload_words(), "metadata received");
                }
                Some(Completion::Sent) => {
                    return Err(Error::invariant(slice, "metadata receive completed as a send"))
                }
                None => {}
            }
        }

        if slot.state.data == CommProgress::SendInProgress
            && finish(transport, &mut slot.request, slice, blocking)?.is_some()
        {
            slot.free_buffer(arena);
            slot.state.data = CommProgress::Sent;
            tracing::debug!(slice, "data send complete");
        }

        if slot.state.data == CommProgress::Sent && slot.state.metadata == CommProgress::Received {
            let source = receive_from
                .ok_or_else(|| Error::invariant(slice, "metadata received without a source"))?;
            let words = slot.meta.payload_words();
            if words >= MAX_PAYLOAD_WORDS {
                return Err(Error::PayloadTooLarge {
                    words,
                    limit: MAX_PAYLOAD_WORDS,
                });
            }
            if words == 0 {
                slot.state.data = CommProgress::Received;
            } else {
                slot.allocate_buffer(slice, arena, words as usize)?;
                slot.request = Some(transport.irecv(source, data_tag, words as usize)?);
                slot.state.data = CommProgress::ReceiveInProgress;
                tracing::debug!(slice, source, words, "data receive posted");
            }
        }

        if slot.state.data == CommProgress::ReceiveInProgress {
            match finish(transport, &mut slot.request, slice, blocking)? {
                Some(Completion::Received(words)) => {
                    let buffer = slot.buffer.as_mut().ok_or_else(|| {
                        Error::invariant(slice, "data received without a buffer")
                    })?;
                    arena.domain().copy_to(buffer, 0, &words)?;
                    slot.state.data = CommProgress::Received;
                    tracing::debug!(slice, words = words.len(), "data received");
                }
                Some(Completion::Sent) => {
                    return Err(Error::invariant(slice, "data receive completed as a send"))
                }
                None => {}
            }
        }

        if blocking && slot.state != SlotState::both(CommProgress::Received) {
            return Err(Error::invariant(
                slice,
                format!("expected both sub-channels received, found {:?}", slot.state),
            ));
        }
        Ok(())
    }

    /// Hand the particles of `beam_slice` over to the next stage
    ///
    /// On the final time step of the slice nothing is sent and the slot is
    /// retired for the rest of the run.
    pub fn put_data<B: BeamStore + ?Sized>(
        &mut self,
        slice: usize,
        beams: &mut B,
        beam_slice: usize,
        is_final_time_step: bool,
    ) -> Result<()> {
        let slot = self.slots.get_mut(slice)?;
        if is_final_time_step {
            if slot.buffer.is_some() {
                return Err(Error::invariant(slice, "buffer still held at the final time step"));
            }
            slot.state = SlotState::both(CommProgress::RunComplete);
            tracing::debug!(slice, "slice retired");
        } else {
            if slot.state.data != CommProgress::InUse {
                return Err(Error::invariant(
                    slice,
                    format!("put without a preceding get, found {:?}", slot.state),
                ));
            }
            let words = self.codec.write_metadata(&mut slot.meta, &*beams, beam_slice)?;
            if self.links.send_to.is_none() {
                for species in 0..beams.num_species() {
                    beams.slice_mut(species, beam_slice).resize(0);
                }
            } else if words > 0 {
                slot.allocate_buffer(slice, &mut self.arena, words as usize)?;
                let buffer = slot
                    .buffer
                    .as_mut()
                    .ok_or_else(|| Error::invariant(slice, "buffer lost after allocation"))?;
                self.codec
                    .pack(self.arena.domain(), buffer, &slot.meta, beams, beam_slice)?;
            }
            slot.state = SlotState::both(CommProgress::ReadyToSend);
            tracing::debug!(slice, words, "slice ready to send");
        }

        for slice in (0..self.config.total_slices).rev() {
            self.make_progress(slice, false)?;
        }
        Ok(())
    }

    /// Fill `beam_slice` with the particles of `slice` for this time step
    ///
    /// The origin synthesizes slices it has never received; everybody else
    /// waits for the previous stage.
    pub fn get_data<B: BeamStore + ?Sized>(
        &mut self,
        slice: usize,
        beams: &mut B,
        beam_slice: usize,
    ) -> Result<()> {
        let state = self.slots.get(slice)?.state;
        if state.data == CommProgress::IdleToProduce || self.links.receive_from.is_none() {
            self.finish_sends(slice)?;
            for species in 0..beams.num_species() {
                beams.initialize_slice(species, slice, beam_slice);
            }
            tracing::debug!(slice, "slice synthesized");
        } else {
            self.make_progress(slice, true)?;
            let slot = self.slots.get_mut(slice)?;
            if slot.meta.payload_words() > 0 {
                let buffer = slot
                    .buffer
                    .take()
                    .ok_or_else(|| Error::invariant(slice, "payload received without a buffer"))?;
                let unpacked =
                    self.codec
                        .unpack(self.arena.domain(), &buffer, &slot.meta, beams, beam_slice);
                self.arena.free(buffer);
                unpacked?;
            } else {
                for species in 0..beams.num_species() {
                    let particles = beams.slice_mut(species, beam_slice);
                    particles.resize(0);
                    particles.resize(slot.meta.count(species) as usize);
                }
            }
        }

        self.slots.get_mut(slice)?.state = SlotState::both(CommProgress::InUse);
        Ok(())
    }

    /// Block until every send this stage posted has completed
    ///
    /// Called once a stage is done with the run, so that its last slices
    /// reach the next stage before the pipeline is dropped.
    pub fn flush(&mut self) -> Result<()> {
        for slice in (0..self.config.total_slices).rev() {
            self.finish_sends(slice)?;
        }
        tracing::debug!(stage = self.config.stage_id, "sends flushed");
        Ok(())
    }

    /// Wait for the sends of `slice` still in flight from its last put
    fn finish_sends(&mut self, slice: usize) -> Result<()> {
        let slot = self.slots.get_mut(slice)?;
        if slot.state.metadata == CommProgress::SendInProgress {
            finish(&mut self.transport, &mut slot.metadata_request, slice, true)?;
            slot.state.metadata = CommProgress::Sent;
        }
        if slot.state.data == CommProgress::SendInProgress {
            finish(&mut self.transport, &mut slot.request, slice, true)?;
            slot.free_buffer(&mut self.arena);
            slot.state.data = CommProgress::Sent;
        }
        Ok(())
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn links(&self) -> StageLinks {
        self.links
    }

    pub fn role(&self) -> StageRole {
        self.role
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn slot_state(&self, slice: usize) -> Result<SlotState> {
        Ok(self.slots.get(slice)?.state)
    }

    /// Size of the transport buffer `slice` holds right now
    pub fn buffer_words(&self, slice: usize) -> Result<Option<usize>> {
        Ok(self.slots.get(slice)?.buffer_words())
    }

    /// Metadata last written or received for `slice`
    pub fn metadata(&self, slice: usize) -> Result<&SliceMetadata> {
        Ok(self.slots.get(slice)?.meta())
    }

    /// Transport buffers currently held by this stage
    pub fn live_buffers(&self) -> usize {
        self.arena.live()
    }

    /// Transport buffers allocated since initialization
    pub fn buffer_allocations(&self) -> u64 {
        self.arena.allocations()
    }
}

impl<T: Transport> Drop for SlicePipeline<T> {
    fn drop(&mut self) {
        // only metadata sends are withdrawn; data sends and posted receives
        // are left to the transport
        for (slice, slot) in self.slots.iter_mut().enumerate() {
            if slot.state.metadata != CommProgress::SendInProgress {
                continue;
            }
            if let Some(request) = slot.metadata_request.take() {
                tracing::warn!(slice, "cancelling metadata send at teardown");
                if let Err(e) = self.transport.cancel(request) {
                    tracing::warn!(slice, error = %e, "cancel failed");
                }
            }
        }
        tracing::info!(
            stage = self.config.stage_id,
            live_buffers = self.arena.live(),
            "slice pipeline shut down"
        );
    }
}

#[cfg(all(test, not(feature = "cuda")))]
mod tests {
    use super::*;
    use crate::particles::{AttributeLayout, MultiBeam, ParticleSlice};
    use crate::topology::Topology;
    use crate::transport::{LocalFabric, LocalTransport};
    use std::time::Duration;

    fn fabric(n: usize) -> Vec<LocalTransport> {
        LocalFabric::create_with_timeout(n, Duration::from_secs(5))
    }

    fn injecting_beam(count: usize) -> MultiBeam {
        MultiBeam::new(
            1,
            1,
            AttributeLayout::BEAM,
            Box::new(move |_species: usize, slice: usize, particles: &mut ParticleSlice| {
                for i in 0..count {
                    particles.push(&[slice as f64, i as f64], &[i as i64]);
                }
            }),
        )
    }

    #[test]
    fn test_initial_states() {
        let mut eps = fabric(2);
        let t1 = eps.pop().unwrap();
        let t0 = eps.pop().unwrap();
        let origin = SlicePipeline::initialize(PipelineConfig::new(2, 1, 1, 2), t1).unwrap();
        let terminus = SlicePipeline::initialize(PipelineConfig::new(2, 1, 0, 2), t0).unwrap();

        assert_eq!(origin.role(), StageRole::Origin);
        assert_eq!(
            origin.slot_state(0).unwrap(),
            SlotState::both(CommProgress::IdleToProduce)
        );
        // non-origin slots post their metadata receives right away
        let state = terminus.slot_state(1).unwrap();
        assert_eq!(state.metadata, CommProgress::ReceiveInProgress);
        assert_eq!(state.data, CommProgress::Sent);
    }

    #[test]
    fn test_mismatched_transport() {
        let t = fabric(2).pop().unwrap();
        let err = SlicePipeline::initialize(PipelineConfig::new(2, 1, 0, 2), t).err();
        assert!(matches!(err, Some(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_solo_ring_roundtrip() {
        let t = fabric(1).pop().unwrap();
        let mut pipeline = SlicePipeline::initialize(PipelineConfig::new(1, 1, 0, 1), t).unwrap();
        let mut beam = injecting_beam(3);

        pipeline.get_data(0, &mut beam, 0).unwrap();
        assert_eq!(beam.num_particles(0, 0), 3);
        beam.slice_mut(0, 0).real_mut(0)[2] = 42.0;
        pipeline.put_data(0, &mut beam, 0, false).unwrap();
        assert_eq!(beam.num_particles(0, 0), 0);

        pipeline.get_data(0, &mut beam, 0).unwrap();
        assert_eq!(beam.slice(0, 0).real(0), &[0.0, 0.0, 42.0]);
        assert_eq!(beam.slice(0, 0).int(0), &[0, 1, 2]);
        assert_eq!(pipeline.live_buffers(), 0);

        pipeline.put_data(0, &mut beam, 0, true).unwrap();
        assert_eq!(
            pipeline.slot_state(0).unwrap(),
            SlotState::both(CommProgress::RunComplete)
        );
    }

    #[test]
    fn test_get_twice_is_an_error() {
        let t = fabric(1).pop().unwrap();
        let mut pipeline = SlicePipeline::initialize(PipelineConfig::new(1, 1, 0, 1), t).unwrap();
        let mut beam = injecting_beam(1);
        pipeline.get_data(0, &mut beam, 0).unwrap();
        pipeline.put_data(0, &mut beam, 0, false).unwrap();
        pipeline.get_data(0, &mut beam, 0).unwrap();
        let err = pipeline.get_data(0, &mut beam, 0).unwrap_err();
        assert!(matches!(err, Error::Invariant { slice: 0, .. }));
    }

    #[test]
    fn test_put_without_get() {
        let t = fabric(1).pop().unwrap();
        let mut pipeline = SlicePipeline::initialize(PipelineConfig::new(1, 1, 0, 1), t).unwrap();
        let mut beam = injecting_beam(1);
        assert!(pipeline.put_data(0, &mut beam, 0, false).is_err());
    }

    #[test]
    fn test_slice_out_of_range() {
        let t = fabric(1).pop().unwrap();
        let mut pipeline = SlicePipeline::initialize(PipelineConfig::new(2, 1, 0, 1), t).unwrap();
        let mut beam = injecting_beam(1);
        assert!(matches!(
            pipeline.get_data(2, &mut beam, 0),
            Err(Error::SliceOutOfRange { index: 2, total: 2 })
        ));
    }

    #[test]
    fn test_chain_terminus_consumes() {
        let t = fabric(1).pop().unwrap();
        let config = PipelineConfig::new(1, 1, 0, 1).with_topology(Topology::Chain);
        let mut pipeline = SlicePipeline::initialize(config, t).unwrap();
        let mut beam = injecting_beam(5);

        pipeline.get_data(0, &mut beam, 0).unwrap();
        pipeline.put_data(0, &mut beam, 0, false).unwrap();
        assert_eq!(beam.num_particles(0, 0), 0);
        assert_eq!(pipeline.buffer_allocations(), 0);
        assert_eq!(pipeline.slot_state(0).unwrap(), SlotState::both(CommProgress::Sent));

        // with no source the origin synthesizes every time
        pipeline.get_data(0, &mut beam, 0).unwrap();
        assert_eq!(beam.num_particles(0, 0), 5);
    }

    #[test]
    fn test_device_domain_needs_device_aware_transport() {
        let a = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let peers = vec![a.local_addr().unwrap()];
        let t = crate::transport::TcpTransport::from_listener(0, a, peers).unwrap();
        let config = PipelineConfig::new(1, 1, 0, 1).with_host_pinned(false);
        assert!(matches!(
            SlicePipeline::initialize(config, t),
            Err(Error::DeviceMemoryUnsupported)
        ));

        let t = fabric(1).pop().unwrap();
        let config = PipelineConfig::new(1, 1, 0, 1).with_host_pinned(false);
        assert!(SlicePipeline::initialize(config, t).is_ok());
    }
}
