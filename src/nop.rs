//! NOP-Out / NOP-In keepalives (RFC 3720 Sections 10.18, 10.19)

use crate::error::{IscsiError, ScsiResult};
use crate::initiator::IscsiInitiator;
use crate::pdu::{opcode, IscsiPdu, RESERVED_TAG};
use crate::queue::{completion_channel, pdu_flags, Outcome, Pdu, Reply, TaskHandle};
use crate::scsi::CommandStatus;
use log::debug;

impl IscsiInitiator {
    /// Send a NOP-Out the target must answer; the reply echoes `data`
    pub fn ping(&mut self, data: Vec<u8>) -> ScsiResult<TaskHandle> {
        if !self.session.is_logged_in() {
            return Err(IscsiError::NotLoggedIn);
        }
        if data.len() > self.session.params.target_max_recv_data_segment_length as usize {
            return Err(IscsiError::InvalidPdu(format!(
                "NOP-Out payload of {} bytes exceeds the target's segment limit",
                data.len()
            )));
        }

        let itt = self.queues.allocate_itt()?;
        let out = IscsiPdu::nop_out(itt, RESERVED_TAG, 0, self.session.cmd_sn, data);

        let (tx, rx) = completion_channel();
        let mut pdu = self.new_pdu(out, Some(opcode::NOP_IN), pdu_flags::DROP_ON_RECONNECT)?;
        pdu.cmd_sn = self.session.cmd_sn;
        pdu.set_completion(tx);
        self.queue_pdu(pdu)?;
        self.nops_in_flight += 1;
        Ok(TaskHandle::new(itt, self.session.cmd_sn, 0, rx))
    }

    /// Pings sent and not yet answered
    pub fn nops_in_flight(&self) -> u32 {
        self.nops_in_flight
    }

    pub(crate) fn process_nop_reply(&mut self, pdu: &mut Pdu, rsp: &IscsiPdu) -> ScsiResult<bool> {
        self.session.update_stat_sn(rsp.stat_sn());
        self.nops_in_flight = self.nops_in_flight.saturating_sub(1);
        debug!("NOP-In reply for itt 0x{:08x}, {} bytes", rsp.itt, rsp.data.len());
        pdu.complete(Outcome::new(CommandStatus::Good, Reply::Nop(rsp.data.clone())));
        Ok(true)
    }

    /// Answer a target-initiated NOP-In when it asks for a reply
    pub(crate) fn process_target_nop_in(&mut self, rsp: &IscsiPdu) -> ScsiResult<()> {
        self.session.update_stat_sn(rsp.stat_sn());
        let ttt = rsp.ttt();
        if ttt == RESERVED_TAG {
            debug!("Target NOP-In without reply requested");
            return Ok(());
        }

        debug!("Answering target NOP-In ttt=0x{:08x}", ttt);
        let mut out = IscsiPdu::nop_out(RESERVED_TAG, ttt, 0, self.session.cmd_sn, Vec::new());
        out.lun = rsp.lun;
        let mut pdu = self.new_pdu(
            out,
            None,
            pdu_flags::DELETE_WHEN_SENT | pdu_flags::NO_CALLBACK | pdu_flags::DROP_ON_RECONNECT,
        )?;
        pdu.cmd_sn = self.session.cmd_sn;
        self.queue_pdu(pdu)
    }
}
