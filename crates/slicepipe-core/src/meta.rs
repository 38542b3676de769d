//! Per-slice metadata message

use crate::{Error, Result};

/// Metadata sent ahead of every slice payload
///
/// Word 0 is the payload size in storage words, words 1..=N the live
/// particle count of each species. The receiver sizes its buffer from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceMetadata {
    words: Vec<u64>,
}

impl SliceMetadata {
    /// Zeroed metadata for `num_species` species
    pub fn new(num_species: usize) -> Self {
        Self {
            words: vec![0; Self::len_words(num_species)],
        }
    }

    /// Message length in words for `num_species` species
    pub const fn len_words(num_species: usize) -> usize {
        1 + num_species
    }

    /// Rebuild from received words
    pub fn from_words(words: Vec<u64>, num_species: usize) -> Result<Self> {
        if words.len() != Self::len_words(num_species) {
            return Err(Error::InvalidConfig(format!(
                "metadata of {} words does not describe {} species",
                words.len(),
                num_species
            )));
        }
        Ok(Self { words })
    }

    pub fn num_species(&self) -> usize {
        self.words.len() - 1
    }

    /// Payload size in storage words
    pub fn payload_words(&self) -> u64 {
        self.words[0]
    }

    /// Live particle count of `species`
    pub fn count(&self, species: usize) -> u64 {
        self.words[species + 1]
    }

    pub fn counts(&self) -> &[u64] {
        &self.words[1..]
    }

    pub(crate) fn set_count(&mut self, species: usize, count: u64) {
        self.words[species + 1] = count;
    }

    pub(crate) fn set_payload_words(&mut self, words: u64) {
        self.words[0] = words;
    }

    pub fn as_words(&self) -> &[u64] {
        &self.words
    }

    /// Overwrite with a received message of the same length
    pub fn copy_from_words(&mut self, words: &[u64]) -> Result<()> {
        if words.len() != self.words.len() {
            return Err(Error::InvalidConfig(format!(
                "metadata of {} words received, expected {}",
                words.len(),
                self.words.len()
            )));
        }
        self.words.copy_from_slice(words);
        Ok(())
    }
}
