//! iSER header (RFC 7145 Section 9.2) and connection-manager private data

use crate::error::{IscsiError, ScsiResult};
use byteorder::{BigEndian, ByteOrder};

pub const ISER_HEADER_LEN: usize = 28;

/// iSER header flags
pub mod iser_flags {
    pub const ISER_VER: u8 = 0x10;
    /// Write STag valid
    pub const WSV: u8 = 0x08;
    /// Read STag valid
    pub const RSV: u8 = 0x04;
}

/// Hello flags carried in the connect private data
pub mod cm_flags {
    pub const ZBVA_NOT_SUPPORTED: u8 = 0x80;
    pub const SEND_W_INV_NOT_SUPPORTED: u8 = 0x40;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IserHeader {
    pub flags: u8,
    pub write_stag: u32,
    pub write_va: u64,
    pub read_stag: u32,
    pub read_va: u64,
}

impl IserHeader {
    /// Plain header with only the version bit set
    pub fn new() -> Self {
        IserHeader {
            flags: iser_flags::ISER_VER,
            ..Default::default()
        }
    }

    pub fn set_read(&mut self, stag: u32, va: u64) {
        self.flags |= iser_flags::RSV;
        self.read_stag = stag;
        self.read_va = va;
    }

    pub fn set_write(&mut self, stag: u32, va: u64) {
        self.flags |= iser_flags::WSV;
        self.write_stag = stag;
        self.write_va = va;
    }

    pub fn has_read(&self) -> bool {
        self.flags & iser_flags::RSV != 0
    }

    pub fn has_write(&self) -> bool {
        self.flags & iser_flags::WSV != 0
    }

    pub fn to_bytes(&self) -> [u8; ISER_HEADER_LEN] {
        let mut buf = [0u8; ISER_HEADER_LEN];
        buf[0] = self.flags;
        BigEndian::write_u32(&mut buf[4..8], self.write_stag);
        BigEndian::write_u64(&mut buf[8..16], self.write_va);
        BigEndian::write_u32(&mut buf[16..20], self.read_stag);
        BigEndian::write_u64(&mut buf[20..28], self.read_va);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> ScsiResult<Self> {
        if buf.len() < ISER_HEADER_LEN {
            return Err(IscsiError::InvalidPdu(format!(
                "iSER header too short: {} bytes",
                buf.len()
            )));
        }
        Ok(IserHeader {
            flags: buf[0],
            write_stag: BigEndian::read_u32(&buf[4..8]),
            write_va: BigEndian::read_u64(&buf[8..16]),
            read_stag: BigEndian::read_u32(&buf[16..20]),
            read_va: BigEndian::read_u64(&buf[20..28]),
        })
    }
}

/// Private data sent with the RDMA connect request
pub fn cm_private_data() -> [u8; 4] {
    [
        cm_flags::ZBVA_NOT_SUPPORTED | cm_flags::SEND_W_INV_NOT_SUPPORTED,
        0,
        0,
        0,
    ]
}
