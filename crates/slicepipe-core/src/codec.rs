//! Payload codec
//!
//! Layout of one slice payload, in storage words:
//!
//! ```text
//! species 0: real 0 | real 1 | ... | int 0 | ... | species 1: real 0 | ...
//! ```
//!
//! Every attribute array is padded to `round_up(count, granularity)` words so
//! the offsets only depend on the metadata. Only the leading in-buffer
//! attributes of the layout are carried; the rest are zeroed on arrival.

use crate::arena::MemoryDomain;
use crate::buffer::SliceBuffer;
use crate::meta::SliceMetadata;
use crate::particles::{AttributeLayout, BeamStore, ParticleSlice};
use crate::{Error, Result};

/// Default rounding granularity of particle counts
pub const DEFAULT_GRANULARITY: usize = 8;

/// Payload sizes must stay below the transport's element count limit
pub const MAX_PAYLOAD_WORDS: u64 = i32::MAX as u64;

/// Round `n` up to a multiple of `granularity`
pub fn round_up(n: u64, granularity: u64) -> u64 {
    n.div_ceil(granularity) * granularity
}

/// Serializes the beam particles of a slice into a transport buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadCodec {
    layout: AttributeLayout,
    granularity: u64,
}

impl PayloadCodec {
    pub fn new(layout: AttributeLayout, granularity: usize) -> Result<Self> {
        layout.validate()?;
        if granularity == 0 {
            return Err(Error::InvalidConfig("granularity must be positive".to_string()));
        }
        Ok(Self {
            layout,
            granularity: granularity as u64,
        })
    }

    pub fn layout(&self) -> &AttributeLayout {
        &self.layout
    }

    pub fn granularity(&self) -> usize {
        self.granularity as usize
    }

    fn padded(&self, count: u64) -> u64 {
        round_up(count, self.granularity)
    }

    /// Words taken by one species with `count` particles
    fn species_words(&self, count: u64) -> u64 {
        self.padded(count) * self.layout.words_per_particle() as u64
    }

    /// Payload size for the given per-species counts
    pub fn payload_words(&self, counts: &[u64]) -> Result<u64> {
        let per_particle = self.layout.words_per_particle() as u64;
        let mut total: u64 = 0;
        for &count in counts {
            let words = count
                .checked_add(self.granularity - 1)
                .map(|c| c / self.granularity * self.granularity)
                .and_then(|padded| padded.checked_mul(per_particle))
                .and_then(|w| total.checked_add(w));
            total = match words {
                Some(t) => t,
                None => {
                    return Err(Error::PayloadTooLarge {
                        words: u64::MAX,
                        limit: MAX_PAYLOAD_WORDS,
                    })
                }
            };
        }
        if total >= MAX_PAYLOAD_WORDS {
            return Err(Error::PayloadTooLarge {
                words: total,
                limit: MAX_PAYLOAD_WORDS,
            });
        }
        Ok(total)
    }

    /// Fill `meta` from the live particles of `beam_slice`, returning the
    /// payload size
    pub fn write_metadata<B: BeamStore + ?Sized>(
        &self,
        meta: &mut SliceMetadata,
        beams: &B,
        beam_slice: usize,
    ) -> Result<u64> {
        self.check_species(meta, beams)?;
        for species in 0..beams.num_species() {
            meta.set_count(species, beams.num_particles(species, beam_slice) as u64);
        }
        let words = self.payload_words(meta.counts())?;
        meta.set_payload_words(words);
        Ok(words)
    }

    fn species_start(&self, meta: &SliceMetadata, species: usize) -> u64 {
        meta.counts()[..species]
            .iter()
            .map(|&count| self.species_words(count))
            .sum()
    }

    /// Word offset of real attribute `comp` of `species`
    pub fn real_offset(&self, meta: &SliceMetadata, species: usize, comp: usize) -> usize {
        let padded = self.padded(meta.count(species));
        (self.species_start(meta, species) + padded * comp as u64) as usize
    }

    /// Word offset of integer attribute `comp` of `species`
    pub fn int_offset(&self, meta: &SliceMetadata, species: usize, comp: usize) -> usize {
        let padded = self.padded(meta.count(species));
        (self.species_start(meta, species)
            + padded * self.layout.real_in_buffer as u64
            + padded * comp as u64) as usize
    }

    fn check_species<B: BeamStore + ?Sized>(&self, meta: &SliceMetadata, beams: &B) -> Result<()> {
        if meta.num_species() != beams.num_species() {
            return Err(Error::InvalidConfig(format!(
                "metadata describes {} species, beam store holds {}",
                meta.num_species(),
                beams.num_species()
            )));
        }
        Ok(())
    }

    fn check_slice(&self, slice: &ParticleSlice) -> Result<()> {
        if slice.num_real_comps() < self.layout.real_in_buffer
            || slice.num_int_comps() < self.layout.int_in_buffer
        {
            return Err(Error::InvalidConfig(format!(
                "particle slice with {} real and {} int attributes cannot carry layout {:?}",
                slice.num_real_comps(),
                slice.num_int_comps(),
                self.layout
            )));
        }
        Ok(())
    }

    /// Copy the in-buffer attributes of every species into `buffer`, then
    /// empty the species' slices
    pub fn pack<B: BeamStore + ?Sized>(
        &self,
        domain: &dyn MemoryDomain,
        buffer: &mut SliceBuffer,
        meta: &SliceMetadata,
        beams: &mut B,
        beam_slice: usize,
    ) -> Result<()> {
        self.check_species(meta, beams)?;
        for species in 0..beams.num_species() {
            let count = meta.count(species) as usize;
            let slice = beams.slice(species, beam_slice);
            self.check_slice(slice)?;
            if slice.len() < count {
                return Err(Error::InvalidConfig(format!(
                    "species {} holds {} particles, metadata announces {}",
                    species,
                    slice.len(),
                    count
                )));
            }
            for comp in 0..self.layout.real_in_buffer {
                let src: &[u64] = bytemuck::cast_slice(&slice.real(comp)[..count]);
                domain.copy_to(buffer, self.real_offset(meta, species, comp), src)?;
            }
            for comp in 0..self.layout.int_in_buffer {
                let src: &[u64] = bytemuck::cast_slice(&slice.int(comp)[..count]);
                domain.copy_to(buffer, self.int_offset(meta, species, comp), src)?;
            }
        }
        // the source arrays may only shrink once every copy has landed
        domain.synchronize(buffer)?;
        for species in 0..beams.num_species() {
            beams.slice_mut(species, beam_slice).resize(0);
        }
        Ok(())
    }

    /// Resize every species to its received count and copy the in-buffer
    /// attributes out of `buffer`; other attributes are zeroed
    pub fn unpack<B: BeamStore + ?Sized>(
        &self,
        domain: &dyn MemoryDomain,
        buffer: &SliceBuffer,
        meta: &SliceMetadata,
        beams: &mut B,
        beam_slice: usize,
    ) -> Result<()> {
        self.check_species(meta, beams)?;
        for species in 0..beams.num_species() {
            let count = meta.count(species) as usize;
            let real_offsets: Vec<usize> = (0..self.layout.real_in_buffer)
                .map(|comp| self.real_offset(meta, species, comp))
                .collect();
            let int_offsets: Vec<usize> = (0..self.layout.int_in_buffer)
                .map(|comp| self.int_offset(meta, species, comp))
                .collect();

            let slice = beams.slice_mut(species, beam_slice);
            self.check_slice(slice)?;
            slice.resize(count);
            for (comp, &offset) in real_offsets.iter().enumerate() {
                let dst: &mut [u64] = bytemuck::cast_slice_mut(slice.real_mut(comp));
                domain.copy_from(buffer, offset, dst)?;
            }
            for comp in self.layout.real_in_buffer..slice.num_real_comps() {
                slice.real_mut(comp).fill(0.0);
            }
            for (comp, &offset) in int_offsets.iter().enumerate() {
                let dst: &mut [u64] = bytemuck::cast_slice_mut(slice.int_mut(comp));
                domain.copy_from(buffer, offset, dst)?;
            }
            for comp in self.layout.int_in_buffer..slice.num_int_comps() {
                slice.int_mut(comp).fill(0);
            }
        }
        domain.synchronize(buffer)
    }
}
