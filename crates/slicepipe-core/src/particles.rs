//! Beam particle containers seen by the pipeline
//!
//! The physics code owns the particles. The pipeline only needs to read the
//! per-slice struct-of-arrays of every species, resize it, and ask the owner
//! to synthesize a fresh slice at the origin stage. [`BeamStore`] is that
//! surface; [`MultiBeam`] is a plain implementation of it.

use crate::{Error, Result};

/// Component indices of the default beam layout
pub mod beam_idx {
    pub const X: usize = 0;
    pub const Y: usize = 1;
    pub const Z: usize = 2;
    pub const UX: usize = 3;
    pub const UY: usize = 4;
    pub const UZ: usize = 5;
    pub const W: usize = 6;
    pub const REAL_NATTRIBS_IN_BUFFER: usize = 7;

    pub const ID: usize = 0;
    pub const INT_NATTRIBS_IN_BUFFER: usize = 1;
}

/// Number of real and integer attributes per particle, and how many of
/// each (the leading ones) are carried by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeLayout {
    pub real_in_buffer: usize,
    pub real_total: usize,
    pub int_in_buffer: usize,
    pub int_total: usize,
}

impl AttributeLayout {
    /// Position, momentum and weight as reals, particle id as integer
    pub const BEAM: Self = Self {
        real_in_buffer: beam_idx::REAL_NATTRIBS_IN_BUFFER,
        real_total: beam_idx::REAL_NATTRIBS_IN_BUFFER,
        int_in_buffer: beam_idx::INT_NATTRIBS_IN_BUFFER,
        int_total: beam_idx::INT_NATTRIBS_IN_BUFFER,
    };

    pub fn new(
        real_in_buffer: usize,
        real_total: usize,
        int_in_buffer: usize,
        int_total: usize,
    ) -> Result<Self> {
        let layout = Self {
            real_in_buffer,
            real_total,
            int_in_buffer,
            int_total,
        };
        layout.validate()?;
        Ok(layout)
    }

    pub fn validate(&self) -> Result<()> {
        if self.real_in_buffer > self.real_total || self.int_in_buffer > self.int_total {
            return Err(Error::InvalidConfig(format!(
                "in-buffer attributes exceed declared attributes: {:?}",
                self
            )));
        }
        Ok(())
    }

    /// Storage words per particle in the payload
    pub fn words_per_particle(&self) -> usize {
        self.real_in_buffer + self.int_in_buffer
    }
}

impl Default for AttributeLayout {
    fn default() -> Self {
        Self::BEAM
    }
}

/// Struct-of-arrays particle data of one species in one beam slice
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParticleSlice {
    reals: Vec<Vec<f64>>,
    ints: Vec<Vec<i64>>,
    len: usize,
}

impl ParticleSlice {
    /// Empty slice with the attribute arrays of `layout`
    pub fn new(layout: &AttributeLayout) -> Self {
        Self {
            reals: vec![Vec::new(); layout.real_total],
            ints: vec![Vec::new(); layout.int_total],
            len: 0,
        }
    }

    /// Number of live particles
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn num_real_comps(&self) -> usize {
        self.reals.len()
    }

    pub fn num_int_comps(&self) -> usize {
        self.ints.len()
    }

    /// Resize every attribute array; new particles start zeroed
    pub fn resize(&mut self, len: usize) {
        for comp in self.reals.iter_mut() {
            comp.resize(len, 0.0);
        }
        for comp in self.ints.iter_mut() {
            comp.resize(len, 0);
        }
        self.len = len;
    }

    /// Append one particle
    pub fn push(&mut self, reals: &[f64], ints: &[i64]) {
        for (comp, &v) in self.reals.iter_mut().zip(reals) {
            comp.push(v);
        }
        for (comp, &v) in self.ints.iter_mut().zip(ints) {
            comp.push(v);
        }
        self.len += 1;
        // attributes the caller did not provide start at zero
        self.resize(self.len);
    }

    pub fn real(&self, comp: usize) -> &[f64] {
        &self.reals[comp]
    }

    pub fn real_mut(&mut self, comp: usize) -> &mut [f64] {
        &mut self.reals[comp]
    }

    pub fn int(&self, comp: usize) -> &[i64] {
        &self.ints[comp]
    }

    pub fn int_mut(&mut self, comp: usize) -> &mut [i64] {
        &mut self.ints[comp]
    }
}

/// Owner of the beam particles of every species
pub trait BeamStore {
    /// Number of beam species, in transport order
    fn num_species(&self) -> usize;

    /// Particles of `species` currently held in `beam_slice`
    fn slice(&self, species: usize, beam_slice: usize) -> &ParticleSlice;

    fn slice_mut(&mut self, species: usize, beam_slice: usize) -> &mut ParticleSlice;

    /// Synthesize the particles of global `slice` into `beam_slice`
    fn initialize_slice(&mut self, species: usize, slice: usize, beam_slice: usize);

    fn num_particles(&self, species: usize, beam_slice: usize) -> usize {
        self.slice(species, beam_slice).len()
    }
}

/// Produces the initial particles of one species for one global slice
pub type Injector = Box<dyn FnMut(usize, usize, &mut ParticleSlice) + Send>;

/// All beam species, each with a small ring of beam slices
pub struct MultiBeam {
    layout: AttributeLayout,
    species: Vec<Vec<ParticleSlice>>,
    injector: Injector,
}

impl MultiBeam {
    /// `injector(species, slice, out)` fills `out`, which arrives empty
    pub fn new(
        num_species: usize,
        beam_slices: usize,
        layout: AttributeLayout,
        injector: Injector,
    ) -> Self {
        let species = (0..num_species)
            .map(|_| vec![ParticleSlice::new(&layout); beam_slices])
            .collect();
        Self {
            layout,
            species,
            injector,
        }
    }

    /// Beam without any injected particles
    pub fn empty(num_species: usize, beam_slices: usize, layout: AttributeLayout) -> Self {
        Self::new(
            num_species,
            beam_slices,
            layout,
            Box::new(|_: usize, _: usize, _: &mut ParticleSlice| {}),
        )
    }

    pub fn layout(&self) -> &AttributeLayout {
        &self.layout
    }
}

impl BeamStore for MultiBeam {
    fn num_species(&self) -> usize {
        self.species.len()
    }

    fn slice(&self, species: usize, beam_slice: usize) -> &ParticleSlice {
        &self.species[species][beam_slice]
    }

    fn slice_mut(&mut self, species: usize, beam_slice: usize) -> &mut ParticleSlice {
        &mut self.species[species][beam_slice]
    }

    fn initialize_slice(&mut self, species: usize, slice: usize, beam_slice: usize) {
        let out = &mut self.species[species][beam_slice];
        *out = ParticleSlice::new(&self.layout);
        (self.injector)(species, slice, out);
    }
}

impl std::fmt::Debug for MultiBeam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiBeam")
            .field("layout", &self.layout)
            .field("species", &self.species)
            .finish_non_exhaustive()
    }
}
