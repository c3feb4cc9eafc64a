//! The connection private data both sides exchange at setup:
//!
//! ```text
//! [data_offset: u16 LE][mr_desc_len: u8][pcfg_desc_len: u8][mr_desc][pcfg_desc]
//! ```

use bytes::Bytes;

use crate::{
    error::{Result, RpmaError},
    mr::{LocalMr, RemoteMr},
    peer_cfg::PeerConfig,
};

/// Private data limit of the connection request (RDMA_PS_TCP).
pub const MAX_PRIVATE_DATA: usize = 56;
pub const HANDSHAKE_HEADER_BYTES: usize = 4;
pub const DESCRIPTORS_MAX_SIZE: usize = MAX_PRIVATE_DATA - HANDSHAKE_HEADER_BYTES;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeData {
    data_offset: u16,
    mr_desc: Bytes,
    pcfg_desc: Bytes,
}

impl HandshakeData {
    pub fn new(data_offset: u16, mr_desc: &[u8], pcfg_desc: &[u8]) -> Result<Self> {
        let len = mr_desc.len() + pcfg_desc.len();
        if len > DESCRIPTORS_MAX_SIZE
            || mr_desc.len() > u8::MAX as usize
            || pcfg_desc.len() > u8::MAX as usize
        {
            return Err(RpmaError::DescriptorsTooLarge {
                len,
                max: DESCRIPTORS_MAX_SIZE,
            });
        }
        Ok(Self {
            data_offset,
            mr_desc: Bytes::copy_from_slice(mr_desc),
            pcfg_desc: Bytes::copy_from_slice(pcfg_desc),
        })
    }

    pub fn data_offset(&self) -> u16 {
        self.data_offset
    }

    pub fn mr_descriptor(&self) -> &[u8] {
        &self.mr_desc
    }

    pub fn peer_cfg_descriptor(&self) -> &[u8] {
        &self.pcfg_desc
    }

    pub fn remote_mr(&self) -> Result<RemoteMr> {
        RemoteMr::from_descriptor(&self.mr_desc)
    }

    pub fn peer_cfg(&self) -> Result<PeerConfig> {
        PeerConfig::from_descriptor(&self.pcfg_desc)
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut bytes =
            Vec::with_capacity(HANDSHAKE_HEADER_BYTES + self.mr_desc.len() + self.pcfg_desc.len());
        bytes.extend_from_slice(&self.data_offset.to_le_bytes());
        bytes.push(self.mr_desc.len() as u8);
        bytes.push(self.pcfg_desc.len() as u8);
        bytes.extend_from_slice(&self.mr_desc);
        bytes.extend_from_slice(&self.pcfg_desc);
        Bytes::from(bytes)
    }

    /// Parses raw private data. Trailing bytes past the declared
    /// descriptors are ignored.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HANDSHAKE_HEADER_BYTES {
            return Err(RpmaError::PayloadTooShort {
                got: bytes.len(),
                need: HANDSHAKE_HEADER_BYTES,
            });
        }
        let data_offset = u16::from_le_bytes([bytes[0], bytes[1]]);
        let mr_len = bytes[2] as usize;
        let pcfg_len = bytes[3] as usize;
        let declared = mr_len + pcfg_len;
        let payload = &bytes[HANDSHAKE_HEADER_BYTES..];
        if declared > payload.len() {
            return Err(RpmaError::Truncated {
                declared,
                available: payload.len(),
            });
        }
        if declared > DESCRIPTORS_MAX_SIZE {
            return Err(RpmaError::Malformed("declared descriptors exceed maximum"));
        }
        Ok(Self {
            data_offset,
            mr_desc: Bytes::copy_from_slice(&payload[..mr_len]),
            pcfg_desc: Bytes::copy_from_slice(&payload[mr_len..declared]),
        })
    }
}

/// Packs a region descriptor and a peer config back to back.
pub fn encode(mr: &LocalMr, peer_cfg: &PeerConfig, data_offset: u16) -> Result<Bytes> {
    Ok(HandshakeData::new(data_offset, &mr.descriptor(), &peer_cfg.descriptor())?.to_bytes())
}

/// Reverses [`encode`], yielding the remote region, the peer config and the
/// offset at which the peer expects data.
pub fn decode(bytes: &[u8]) -> Result<(RemoteMr, PeerConfig, u16)> {
    let data = HandshakeData::from_bytes(bytes)?;
    Ok((data.remote_mr()?, data.peer_cfg()?, data.data_offset()))
}

#[cfg(test)]
mod tests {
    use super::{DESCRIPTORS_MAX_SIZE, HandshakeData, MAX_PRIVATE_DATA, decode};
    use crate::{
        error::RpmaError,
        mr::{MR_DESCRIPTOR_BYTES, MrUsage, RemoteMr},
        peer_cfg::PeerConfig,
    };

    fn sample_mr_desc(len: u64) -> [u8; MR_DESCRIPTOR_BYTES] {
        let mut bytes = [0_u8; MR_DESCRIPTOR_BYTES];
        bytes[0..8].copy_from_slice(&0x7f00_dead_b000_u64.to_le_bytes());
        bytes[8..16].copy_from_slice(&len.to_le_bytes());
        bytes[16..20].copy_from_slice(&0x1234_u32.to_le_bytes());
        bytes[20] = (MrUsage::WRITE_DST | MrUsage::READ_SRC).bits();
        bytes
    }

    #[test]
    fn wire_layout_is_bit_exact() {
        let data = HandshakeData::new(0x0102, &[0xaa, 0xbb], &[0x01]).expect("fits");
        assert_eq!(
            data.to_bytes().as_ref(),
            &[0x02, 0x01, 2, 1, 0xaa, 0xbb, 0x01]
        );
    }

    #[test]
    fn roundtrip_region_and_peer_cfg() {
        let pcfg = PeerConfig::new().with_direct_write_to_pmem(true);
        let data = HandshakeData::new(16, &sample_mr_desc(4096), &pcfg.descriptor()).expect("fits");
        let (remote, decoded_cfg, offset) = decode(&data.to_bytes()).expect("decode");
        assert_eq!(remote, RemoteMr::from_descriptor(&sample_mr_desc(4096)).expect("mr"));
        assert_eq!(decoded_cfg, pcfg);
        assert_eq!(offset, 16);
    }

    #[test]
    fn encoded_handshake_fits_private_data() {
        let data = HandshakeData::new(0, &sample_mr_desc(1), &[0]).expect("fits");
        assert!(data.to_bytes().len() <= MAX_PRIVATE_DATA);
    }

    #[test]
    fn new_rejects_oversized_descriptors() {
        let big = vec![0_u8; DESCRIPTORS_MAX_SIZE];
        assert_eq!(
            HandshakeData::new(0, &big, &[0]),
            Err(RpmaError::DescriptorsTooLarge {
                len: DESCRIPTORS_MAX_SIZE + 1,
                max: DESCRIPTORS_MAX_SIZE,
            })
        );
        assert!(HandshakeData::new(0, &big, &[]).is_ok());
    }

    #[test]
    fn short_header_is_payload_too_short() {
        assert_eq!(
            HandshakeData::from_bytes(&[0, 0, 1]),
            Err(RpmaError::PayloadTooShort { got: 3, need: 4 })
        );
    }

    #[test]
    fn every_truncation_fails_without_panicking() {
        let data = HandshakeData::new(8, &sample_mr_desc(2048), &[0]).expect("fits");
        let bytes = data.to_bytes();
        for cut in 4..bytes.len() {
            let err = HandshakeData::from_bytes(&bytes[..cut]).expect_err("truncated");
            assert_eq!(
                err,
                RpmaError::Truncated {
                    declared: MR_DESCRIPTOR_BYTES + 1,
                    available: cut - 4,
                }
            );
        }
    }

    #[test]
    fn declared_lengths_above_maximum_are_malformed() {
        let mut bytes = vec![0_u8, 0, 50, 10];
        bytes.resize(4 + 60, 0);
        assert_eq!(
            HandshakeData::from_bytes(&bytes),
            Err(RpmaError::Malformed("declared descriptors exceed maximum"))
        );
    }

    #[test]
    fn short_payload_with_oversized_lengths_is_truncated() {
        let mut bytes = vec![0_u8, 0, 40, 20];
        bytes.resize(4 + 10, 0);
        assert_eq!(
            HandshakeData::from_bytes(&bytes),
            Err(RpmaError::Truncated {
                declared: 60,
                available: 10,
            })
        );
    }

    #[test]
    fn garbage_descriptors_are_malformed() {
        let data = HandshakeData::new(0, &[1, 2, 3], &[0]).expect("fits");
        assert!(matches!(
            decode(&data.to_bytes()),
            Err(RpmaError::Malformed(_))
        ));
    }
}
