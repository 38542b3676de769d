//! Memory domain definitions

/// Where a transport buffer lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DomainKind {
    /// Page-locked host memory, reachable by any transport
    #[default]
    HostPinned = 0,
    /// Device-resident memory, only for transports that can move it directly
    Device = 1,
}

impl DomainKind {
    /// Short name used in log fields
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainKind::HostPinned => "pinned",
            DomainKind::Device => "device",
        }
    }
}

impl std::fmt::Display for DomainKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_kind_names() {
        assert_eq!(DomainKind::default(), DomainKind::HostPinned);
        assert_eq!(DomainKind::HostPinned.to_string(), "pinned");
        assert_eq!(DomainKind::Device.as_str(), "device");
    }
}
