//! Stage roles, links and message tags
//!
//! Stage `k` forwards to stage `k - 1` and receives from stage `k + 1`. The
//! highest stage is the origin: it synthesizes slices on its first sweep.
//! Stage 0 is the terminus. In a [`Topology::Ring`] the terminus closes the
//! loop by forwarding to the origin, which then receives for its later
//! sweeps; in a [`Topology::Chain`] neither end has a partner.

use crate::transport::Tag;

/// Shape of the stage chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Topology {
    #[default]
    Ring,
    Chain,
}

/// Position of a stage in the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageRole {
    Origin,
    Interior,
    Terminus,
    /// A single stage is both origin and terminus
    Solo,
}

impl StageRole {
    pub fn of(stage_id: usize, stage_count: usize) -> Self {
        if stage_count == 1 {
            StageRole::Solo
        } else if stage_id + 1 == stage_count {
            StageRole::Origin
        } else if stage_id == 0 {
            StageRole::Terminus
        } else {
            StageRole::Interior
        }
    }

    pub fn is_origin(&self) -> bool {
        matches!(self, StageRole::Origin | StageRole::Solo)
    }

    pub fn is_terminus(&self) -> bool {
        matches!(self, StageRole::Terminus | StageRole::Solo)
    }
}

/// Partners of one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageLinks {
    /// Stage consuming what this stage produces
    pub send_to: Option<usize>,
    /// Stage producing what this stage consumes
    pub receive_from: Option<usize>,
}

impl StageLinks {
    pub fn new(stage_id: usize, stage_count: usize, topology: Topology) -> Self {
        let role = StageRole::of(stage_id, stage_count);
        let send_to = (stage_id + stage_count - 1) % stage_count;
        let receive_from = (stage_id + 1) % stage_count;
        match topology {
            Topology::Ring => Self {
                send_to: Some(send_to),
                receive_from: Some(receive_from),
            },
            Topology::Chain => Self {
                send_to: (!role.is_terminus()).then_some(send_to),
                receive_from: (!role.is_origin()).then_some(receive_from),
            },
        }
    }
}

/// Fixed message tags of every slice, stable for the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tags {
    data_start: Tag,
    metadata_start: Tag,
}

impl Tags {
    pub fn new(total_slices: usize) -> Self {
        let data_start: Tag = 1;
        Self {
            data_start,
            metadata_start: data_start + total_slices as Tag,
        }
    }

    /// Largest slice count whose tags all fit in a [`Tag`]
    pub const fn max_slices() -> usize {
        ((Tag::MAX - 1) / 2) as usize
    }

    pub fn data(&self, slice: usize) -> Tag {
        self.data_start + slice as Tag
    }

    pub fn metadata(&self, slice: usize) -> Tag {
        self.metadata_start + slice as Tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles() {
        assert_eq!(StageRole::of(0, 1), StageRole::Solo);
        assert_eq!(StageRole::of(3, 4), StageRole::Origin);
        assert_eq!(StageRole::of(0, 4), StageRole::Terminus);
        assert_eq!(StageRole::of(2, 4), StageRole::Interior);
        assert!(StageRole::Solo.is_origin() && StageRole::Solo.is_terminus());
    }

    #[test]
    fn test_ring_links_wrap() {
        let links = StageLinks::new(0, 3, Topology::Ring);
        assert_eq!(links.send_to, Some(2));
        assert_eq!(links.receive_from, Some(1));
        let links = StageLinks::new(2, 3, Topology::Ring);
        assert_eq!(links.send_to, Some(1));
        assert_eq!(links.receive_from, Some(0));
    }

    #[test]
    fn test_chain_links_stop_at_ends() {
        assert_eq!(
            StageLinks::new(0, 3, Topology::Chain),
            StageLinks {
                send_to: None,
                receive_from: Some(1)
            }
        );
        assert_eq!(
            StageLinks::new(2, 3, Topology::Chain),
            StageLinks {
                send_to: Some(1),
                receive_from: None
            }
        );
        assert_eq!(
            StageLinks::new(0, 1, Topology::Chain),
            StageLinks {
                send_to: None,
                receive_from: None
            }
        );
    }

    #[test]
    fn test_tags_disjoint() {
        let tags = Tags::new(4);
        assert_eq!(tags.data(0), 1);
        assert_eq!(tags.data(3), 4);
        assert_eq!(tags.metadata(0), 5);
        assert_eq!(tags.metadata(3), 8);
    }
}
