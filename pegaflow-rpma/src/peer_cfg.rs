use crate::error::{Result, RpmaError};

pub const PEER_CFG_DESCRIPTOR_BYTES: usize = 1;

const DIRECT_WRITE_TO_PMEM: u8 = 1 << 0;

/// Capabilities a peer advertises about its memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeerConfig {
    direct_write_to_pmem: bool,
}

impl PeerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_direct_write_to_pmem(mut self, supported: bool) -> Self {
        self.direct_write_to_pmem = supported;
        self
    }

    pub fn direct_write_to_pmem(&self) -> bool {
        self.direct_write_to_pmem
    }

    pub fn descriptor(&self) -> [u8; PEER_CFG_DESCRIPTOR_BYTES] {
        let mut flags = 0_u8;
        if self.direct_write_to_pmem {
            flags |= DIRECT_WRITE_TO_PMEM;
        }
        [flags]
    }

    pub fn from_descriptor(bytes: &[u8]) -> Result<Self> {
        let [flags] = bytes else {
            return Err(RpmaError::Malformed("peer cfg descriptor has wrong size"));
        };
        if flags & !DIRECT_WRITE_TO_PMEM != 0 {
            return Err(RpmaError::Malformed(
                "peer cfg descriptor has unknown flag bits",
            ));
        }
        Ok(Self {
            direct_write_to_pmem: flags & DIRECT_WRITE_TO_PMEM != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::PeerConfig;
    use crate::error::RpmaError;

    #[test]
    fn default_has_no_pmem_support() {
        assert!(!PeerConfig::new().direct_write_to_pmem());
        assert_eq!(PeerConfig::new().descriptor(), [0]);
    }

    #[test]
    fn descriptor_carries_pmem_flag() {
        let cfg = PeerConfig::new().with_direct_write_to_pmem(true);
        let decoded = PeerConfig::from_descriptor(&cfg.descriptor()).expect("decode");
        assert!(decoded.direct_write_to_pmem());
    }

    #[test]
    fn from_descriptor_rejects_garbage() {
        assert_eq!(
            PeerConfig::from_descriptor(&[]),
            Err(RpmaError::Malformed("peer cfg descriptor has wrong size"))
        );
        assert_eq!(
            PeerConfig::from_descriptor(&[0x02]),
            Err(RpmaError::Malformed(
                "peer cfg descriptor has unknown flag bits"
            ))
        );
    }
}
