//! The per-QP record exchanged over the control channel.
//!
//! Every field is big-endian and the record has a fixed size, so it travels without a length
//! prefix:
//!
//! ```text
//! | lid: u16 | qp_num: u32 | rkey: u32 | raddr: u64 | rank: u32 |
//! ```

/// Identifiers the remote side needs to address one of our queue pairs and write into our ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QpInfo {
    pub lid: u16,
    pub qp_num: u32,
    pub rkey: u32,
    pub raddr: u64,
    pub rank: u32,
}

impl QpInfo {
    pub const WIRE_LEN: usize = 2 + 4 + 4 + 8 + 4;

    pub fn to_bytes(&self) -> [u8; Self::WIRE_LEN] {
        let mut buf = [0u8; Self::WIRE_LEN];
        buf[0..2].copy_from_slice(&self.lid.to_be_bytes());
        buf[2..6].copy_from_slice(&self.qp_num.to_be_bytes());
        buf[6..10].copy_from_slice(&self.rkey.to_be_bytes());
        buf[10..18].copy_from_slice(&self.raddr.to_be_bytes());
        buf[18..22].copy_from_slice(&self.rank.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::WIRE_LEN]) -> Self {
        let (lid, rest) = buf.split_at(2);
        let (qp_num, rest) = rest.split_at(4);
        let (rkey, rest) = rest.split_at(4);
        let (raddr, rank) = rest.split_at(8);

        QpInfo {
            lid: u16::from_be_bytes([lid[0], lid[1]]),
            qp_num: u32::from_be_bytes([qp_num[0], qp_num[1], qp_num[2], qp_num[3]]),
            rkey: u32::from_be_bytes([rkey[0], rkey[1], rkey[2], rkey[3]]),
            raddr: u64::from_be_bytes([
                raddr[0], raddr[1], raddr[2], raddr[3], raddr[4], raddr[5], raddr[6], raddr[7],
            ]),
            rank: u32::from_be_bytes([rank[0], rank[1], rank[2], rank[3]]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_wire_layout_is_big_endian() {
        let info = QpInfo {
            lid: 0x0102,
            qp_num: 0x0304_0506,
            rkey: 0x0708_090a,
            raddr: 0x0b0c_0d0e_0f10_1112,
            rank: 0x1314_1516,
        };
        let expected: Vec<u8> = (1..=0x16).collect();
        assert_eq!(info.to_bytes().as_slice(), expected.as_slice());
    }

    proptest! {
        #[test]
        fn test_round_trip(lid: u16, qp_num: u32, rkey: u32, raddr: u64, rank: u32) {
            let info = QpInfo { lid, qp_num, rkey, raddr, rank };
            prop_assert_eq!(QpInfo::from_bytes(&info.to_bytes()), info);
        }
    }
}
