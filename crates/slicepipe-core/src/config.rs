//! Pipeline configuration

use crate::codec::DEFAULT_GRANULARITY;
use crate::particles::AttributeLayout;
use crate::storage::DomainKind;
use crate::topology::{Tags, Topology};
use crate::{Error, Result};

/// Run-wide settings of one stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Number of slices in the simulation box
    pub total_slices: usize,
    /// Number of beam species carried in every payload
    pub num_species: usize,
    /// Rank of this stage
    pub stage_id: usize,
    /// Number of stages in the pipeline
    pub stage_count: usize,
    pub domain: DomainKind,
    pub topology: Topology,
    /// Particle counts are padded to a multiple of this
    pub granularity: usize,
    pub layout: AttributeLayout,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            total_slices: 1,
            num_species: 1,
            stage_id: 0,
            stage_count: 1,
            domain: DomainKind::default(),
            topology: Topology::default(),
            granularity: DEFAULT_GRANULARITY,
            layout: AttributeLayout::default(),
        }
    }
}

impl PipelineConfig {
    pub fn new(
        total_slices: usize,
        num_species: usize,
        stage_id: usize,
        stage_count: usize,
    ) -> Self {
        Self {
            total_slices,
            num_species,
            stage_id,
            stage_count,
            ..Self::default()
        }
    }

    pub fn with_domain(mut self, domain: DomainKind) -> Self {
        self.domain = domain;
        self
    }

    /// Host-pinned buffers when `true`, device buffers otherwise
    pub fn with_host_pinned(self, host_pinned: bool) -> Self {
        self.with_domain(if host_pinned {
            DomainKind::HostPinned
        } else {
            DomainKind::Device
        })
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_granularity(mut self, granularity: usize) -> Self {
        self.granularity = granularity;
        self
    }

    pub fn with_layout(mut self, layout: AttributeLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.total_slices == 0 {
            return Err(Error::InvalidConfig("total_slices must be positive".to_string()));
        }
        if self.total_slices > Tags::max_slices() {
            return Err(Error::InvalidConfig(format!(
                "{} slices exceed the {} distinct message tags",
                self.total_slices,
                Tags::max_slices()
            )));
        }
        if self.stage_count == 0 {
            return Err(Error::InvalidConfig("stage_count must be positive".to_string()));
        }
        if self.stage_id >= self.stage_count {
            return Err(Error::InvalidConfig(format!(
                "stage {} outside a pipeline of {} stages",
                self.stage_id, self.stage_count
            )));
        }
        if self.granularity == 0 {
            return Err(Error::InvalidConfig("granularity must be positive".to_string()));
        }
        self.layout.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::new(4, 2, 1, 3);
        assert_eq!(config.granularity, DEFAULT_GRANULARITY);
        assert_eq!(config.domain, DomainKind::HostPinned);
        assert_eq!(config.topology, Topology::Ring);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builders() {
        let config = PipelineConfig::new(4, 1, 0, 1)
            .with_host_pinned(false)
            .with_topology(Topology::Chain)
            .with_granularity(1);
        assert_eq!(config.domain, DomainKind::Device);
        assert_eq!(config.topology, Topology::Chain);
        assert_eq!(config.granularity, 1);
    }

    #[test]
    fn test_validate_rejects() {
        assert!(PipelineConfig::new(0, 1, 0, 1).validate().is_err());
        assert!(PipelineConfig::new(1, 1, 0, 0).validate().is_err());
        assert!(PipelineConfig::new(1, 1, 2, 2).validate().is_err());
        assert!(PipelineConfig::new(1, 1, 0, 1)
            .with_granularity(0)
            .validate()
            .is_err());
    }
}
