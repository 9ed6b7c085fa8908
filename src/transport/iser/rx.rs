//! Receive descriptors
//!
//! Before login completes every inbound message lands in one large login
//! buffer. Afterwards a ring of small descriptors is registered and kept
//! topped up.

use super::header::ISER_HEADER_LEN;
use super::verbs::{access, MemoryRegion, ProtectionDomain, QueuePair, RecvWr, Sge};
use crate::error::{IscsiError, ScsiResult};
use crate::pdu::{IscsiPdu, BHS_SIZE};
use log::debug;
use std::sync::Arc;

/// iSER header followed by the iSCSI BHS
pub const HEADERS_LEN: usize = ISER_HEADER_LEN + BHS_SIZE;
pub const RECV_DATA_SEG_LEN: usize = 128;
/// Descriptor size: headers, data segment and padding
pub const RX_PAYLOAD_SIZE: usize = HEADERS_LEN + RECV_DATA_SEG_LEN + 4;
pub const DEF_MAX_RECV_SEG_LEN: u32 = 8192;
pub const RX_LOGIN_SIZE: usize = HEADERS_LEN + DEF_MAX_RECV_SEG_LEN as usize;
pub const DEF_XMIT_CMDS_MAX: u16 = 512;

/// wr_id of the login buffer's receive request
pub const LOGIN_WR_ID: u64 = u64::MAX;

pub struct RxState {
    pd: Arc<dyn ProtectionDomain>,
    login: MemoryRegion,
    ring: Option<MemoryRegion>,
    num_descs: usize,
    head: usize,
    posted: usize,
    min_posted_rx: usize,
}

impl RxState {
    pub fn new(pd: Arc<dyn ProtectionDomain>, max_cmds: u16) -> ScsiResult<Self> {
        let login = pd.reg_mr(RX_LOGIN_SIZE, access::LOCAL_WRITE)?;
        let num_descs = max_cmds.max(1) as usize;
        Ok(RxState {
            pd,
            login,
            ring: None,
            num_descs,
            head: 0,
            posted: 0,
            min_posted_rx: (num_descs >> 2).max(1),
        })
    }

    /// Receive requests currently outstanding on the queue pair
    pub fn posted(&self) -> usize {
        self.posted
    }

    pub fn has_ring(&self) -> bool {
        self.ring.is_some()
    }

    pub fn min_posted_rx(&self) -> usize {
        self.min_posted_rx
    }

    pub fn post_login(&mut self, qp: &mut dyn QueuePair) -> ScsiResult<()> {
        let wr = RecvWr {
            wr_id: LOGIN_WR_ID,
            sge: Sge::from_region(&self.login, 0, RX_LOGIN_SIZE),
        };
        qp.post_recv(&[wr])?;
        self.posted += 1;
        Ok(())
    }

    fn alloc_ring(&mut self) -> ScsiResult<()> {
        let ring = self
            .pd
            .reg_mr(self.num_descs * RX_PAYLOAD_SIZE, access::LOCAL_WRITE)?;
        debug!("Registered {} receive descriptors", self.num_descs);
        self.ring = Some(ring);
        self.head = 0;
        Ok(())
    }

    /// Post `count` ring descriptors starting at the ring head
    pub fn post_ring(&mut self, qp: &mut dyn QueuePair, count: usize) -> ScsiResult<()> {
        let ring = self
            .ring
            .as_ref()
            .ok_or_else(|| IscsiError::Transport("Receive ring not allocated".to_string()))?;

        let mut head = self.head;
        let mut wrs = Vec::with_capacity(count);
        for _ in 0..count {
            wrs.push(RecvWr {
                wr_id: head as u64,
                sge: Sge::from_region(ring, head * RX_PAYLOAD_SIZE, RX_PAYLOAD_SIZE),
            });
            head = (head + 1) % self.num_descs;
        }

        qp.post_recv(&wrs).map_err(|e| {
            IscsiError::Transport(format!("Posting {} receive buffers failed: {}", count, e))
        })?;
        self.posted += count;
        self.head = head;
        Ok(())
    }

    /// Decode the message held by a completed receive request
    pub fn message(&self, wr_id: u64, byte_len: u32) -> ScsiResult<IscsiPdu> {
        let byte_len = byte_len as usize;
        if byte_len < HEADERS_LEN {
            return Err(IscsiError::InvalidPdu(format!(
                "iSER message too short: {} bytes",
                byte_len
            )));
        }

        let raw = if wr_id == LOGIN_WR_ID {
            self.login.read(0, byte_len.min(RX_LOGIN_SIZE))?
        } else {
            let ring = self
                .ring
                .as_ref()
                .ok_or_else(|| IscsiError::Transport("Receive ring not allocated".to_string()))?;
            let slot = wr_id as usize;
            if slot >= self.num_descs {
                return Err(IscsiError::Transport(format!("Unknown receive wr_id {}", wr_id)));
            }
            ring.read(slot * RX_PAYLOAD_SIZE, byte_len.min(RX_PAYLOAD_SIZE))?
        };

        IscsiPdu::from_parts(&raw[ISER_HEADER_LEN..HEADERS_LEN], &raw[HEADERS_LEN..])
    }

    /// Account for a consumed receive request and replenish
    ///
    /// Ring descriptors are re-posted in bulk once `min_posted_rx` slots are
    /// free. A consumed login buffer is re-posted until the session is
    /// logged in; after that the ring is allocated and posted instead.
    pub fn replenish(
        &mut self,
        qp: &mut dyn QueuePair,
        wr_id: u64,
        logged_in: bool,
    ) -> ScsiResult<()> {
        self.posted = self.posted.saturating_sub(1);

        if wr_id != LOGIN_WR_ID {
            let empty = self.num_descs.saturating_sub(self.posted);
            if empty >= self.min_posted_rx {
                self.post_ring(qp, empty)?;
            }
        } else if logged_in {
            self.alloc_ring()?;
            let count = self.min_posted_rx.min(self.num_descs);
            self.post_ring(qp, count)?;
        } else {
            self.post_login(qp)?;
        }
        Ok(())
    }
}

impl Drop for RxState {
    fn drop(&mut self) {
        self.pd.dereg_mr(&self.login);
        if let Some(ring) = &self.ring {
            self.pd.dereg_mr(ring);
        }
    }
}
