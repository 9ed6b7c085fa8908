//! SCSI commands: submission, solicited and unsolicited Data-Out, and the
//! handling of Data-In, R2T and SCSI Response PDUs

use crate::error::{IscsiError, ScsiResult};
use crate::initiator::IscsiInitiator;
use crate::pdu::{flags, opcode, IscsiPdu, RESERVED_TAG};
use crate::queue::{completion_channel, pdu_flags, Outcome, Pdu, Reply, TaskHandle};
use crate::scsi::{CommandStatus, ResidualStatus, ScsiTask, SenseData, XferDir};
use crate::session::serial32_compare;
use crossbeam_channel::Sender;
use log::{debug, error, warn};
use std::cmp::Ordering;

/// A submission that failed, with the task when it could be recovered
pub(crate) type SubmitError = (IscsiError, Option<ScsiTask>);

/// How the bytes of a WRITE are split between the command PDU, the
/// unsolicited Data-Out train and R2T-solicited data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSplit {
    pub immediate: u32,
    pub unsolicited: u32,
}

impl WriteSplit {
    pub fn new(
        total: u32,
        first_burst: u32,
        target_max_recv_seg: u32,
        immediate_data: bool,
        initial_r2t: bool,
    ) -> Self {
        let immediate = if immediate_data {
            first_burst.min(target_max_recv_seg).min(total)
        } else {
            0
        };
        let unsolicited = if initial_r2t {
            0
        } else {
            total.min(first_burst).saturating_sub(immediate)
        };
        WriteSplit {
            immediate,
            unsolicited,
        }
    }
}

fn set_residual(task: &mut ScsiTask, rsp: &IscsiPdu) {
    task.residual_status = ResidualStatus::None;
    task.residual = 0;
    if rsp.flags & (flags::OVERFLOW | flags::UNDERFLOW) != 0 {
        task.residual = rsp.residual_count();
        task.residual_status = if rsp.flags & flags::UNDERFLOW != 0 {
            ResidualStatus::Underflow
        } else {
            ResidualStatus::Overflow
        };
    }
}

impl IscsiInitiator {
    /// Submit `task` to `lun`
    ///
    /// The task moves into the engine and comes back through the handle's
    /// outcome. On error nothing is left queued.
    pub fn submit(&mut self, task: ScsiTask, lun: u32) -> ScsiResult<TaskHandle> {
        let (tx, rx) = completion_channel();
        let (itt, cmd_sn) = self.issue_command(task, lun, tx).map_err(|(e, _)| e)?;
        Ok(TaskHandle::new(itt, cmd_sn, lun, rx))
    }

    /// Build, queue and (for WRITEs) start the data transfer of a command
    pub(crate) fn issue_command(
        &mut self,
        mut task: ScsiTask,
        lun: u32,
        tx: Sender<Outcome>,
    ) -> Result<(u32, u32), SubmitError> {
        if !self.session.is_logged_in() {
            return Err((IscsiError::NotLoggedIn, Some(task)));
        }
        if self.session.is_discovery() {
            return Err((
                IscsiError::WrongSessionType(
                    "SCSI commands need a normal session, not discovery".to_string(),
                ),
                Some(task),
            ));
        }
        if let Err(e) = task.validate() {
            return Err((e, Some(task)));
        }

        let itt = match self.queues.allocate_itt() {
            Ok(itt) => itt,
            Err(e) => return Err((e, Some(task))),
        };
        let cmd_sn = self.session.cmd_sn;
        let total = task.expected_xfer_len;

        let mut cmd_flags = flags::FINAL | flags::ATTR_SIMPLE;
        let mut split = WriteSplit {
            immediate: 0,
            unsolicited: 0,
        };
        match task.xfer_dir {
            XferDir::Read => cmd_flags |= flags::READ,
            XferDir::Write => {
                cmd_flags |= flags::WRITE;
                let params = &self.session.params;
                split = WriteSplit::new(
                    total,
                    params.first_burst_length,
                    params.target_max_recv_data_segment_length,
                    params.immediate_data,
                    params.initial_r2t,
                );
                if split.unsolicited > 0 {
                    cmd_flags &= !flags::FINAL;
                }
            }
            XferDir::None => {}
        }

        let mut out = match IscsiPdu::scsi_command(lun, itt, cmd_flags, total, cmd_sn, &task.cdb) {
            Ok(out) => out,
            Err(e) => return Err((e, Some(task))),
        };
        if split.immediate > 0 {
            let immediate = task
                .data_out
                .as_ref()
                .map(|data| data.read_at(0, split.immediate as usize));
            match immediate {
                Some(Ok(bytes)) => out.set_data(bytes),
                Some(Err(e)) => return Err((e, Some(task))),
                None => {
                    return Err((
                        IscsiError::Scsi("WRITE task has no data".to_string()),
                        Some(task),
                    ))
                }
            }
        }

        task.itt = itt;
        task.cmd_sn = cmd_sn;
        task.lun = lun;

        let mut pdu = match self.new_pdu(out, Some(opcode::SCSI_RESPONSE), 0) {
            Ok(pdu) => pdu,
            Err(e) => return Err((e, Some(task))),
        };
        pdu.cmd_sn = cmd_sn;
        pdu.lun = lun;
        pdu.immediate_len = split.immediate;
        pdu.task = Some(task);
        pdu.set_completion(tx);

        // Built before queueing: the command PDU is out of reach afterwards
        let data_out = if split.unsolicited > 0 {
            self.build_data_out(&pdu, RESERVED_TAG, split.immediate, split.unsolicited)
        } else {
            Ok(Vec::new())
        };
        let data_out = match data_out {
            Ok(data_out) => data_out,
            Err(e) => {
                let task = pdu.task.take();
                self.free_pdu(pdu);
                return Err((e, task));
            }
        };

        if let Err(e) = self.queue_pdu(pdu) {
            let mut task = None;
            for mut pdu in self.queues.remove_all(itt) {
                pdu.take_completion();
                task = task.or_else(|| pdu.task.take());
                self.free_pdu(pdu);
            }
            for pdu in data_out {
                self.free_pdu(pdu);
            }
            return Err((e, task));
        }
        self.session.next_cmd_sn();

        debug!(
            "SCSI command 0x{:02x} itt=0x{:08x} cmdsn={} lun={} len={} immediate={} unsolicited={}",
            cmd_flags,
            itt,
            cmd_sn,
            lun,
            total,
            split.immediate,
            split.unsolicited
        );

        if let Err(e) = self.queue_data_out(data_out) {
            error!("Unsolicited Data-Out for itt 0x{:08x} failed: {}", itt, e);
            self.abort_transfer(itt);
        }

        Ok((itt, cmd_sn))
    }

    /// Data-Out PDUs covering `len` bytes from `offset` of the command's
    /// payload, each at most the target's MaxRecvDataSegmentLength
    pub(crate) fn build_data_out(
        &mut self,
        cmd: &Pdu,
        ttt: u32,
        offset: u32,
        len: u32,
    ) -> ScsiResult<Vec<Pdu>> {
        let data = cmd
            .task
            .as_ref()
            .and_then(|task| task.data_out.as_ref())
            .ok_or_else(|| IscsiError::Scsi("Can't find data for DATA-OUT".to_string()))?;

        let seg_max = self.session.params.target_max_recv_data_segment_length.max(1);
        let end = offset
            .checked_add(len)
            .ok_or_else(|| IscsiError::Protocol("Data-Out range overflows".to_string()))?;

        let mut pdus = Vec::new();
        let mut pos = offset;
        let mut data_sn = 0;
        while pos < end {
            let seg_len = (end - pos).min(seg_max);
            let last = pos + seg_len == end;
            let bytes = data.read_at(pos as usize, seg_len as usize)?;

            let out = IscsiPdu::scsi_data_out(cmd.lun, cmd.itt, ttt, data_sn, pos, last, bytes);
            let mut pdu = self.new_pdu(out, None, pdu_flags::DELETE_WHEN_SENT | pdu_flags::NO_CALLBACK)?;
            pdu.cmd_sn = cmd.cmd_sn;
            pdu.lun = cmd.lun;
            pdus.push(pdu);

            pos += seg_len;
            data_sn += 1;
        }
        Ok(pdus)
    }

    fn queue_data_out(&mut self, pdus: Vec<Pdu>) -> ScsiResult<()> {
        let mut pdus = pdus.into_iter();
        while let Some(pdu) = pdus.next() {
            if let Err(e) = self.queue_pdu(pdu) {
                for rest in pdus {
                    self.free_pdu(rest);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Send the Data-Out train for one burst of `cmd`
    pub(crate) fn send_data_out(&mut self, cmd: &Pdu, ttt: u32, offset: u32, len: u32) -> ScsiResult<()> {
        let pdus = self.build_data_out(cmd, ttt, offset, len)?;
        self.queue_data_out(pdus)
    }

    /// Remove every PDU of a failed transfer and complete the command with `Error`
    fn abort_transfer(&mut self, itt: u32) {
        for mut pdu in self.queues.remove_all(itt) {
            pdu.complete_with_status(CommandStatus::Error);
            self.free_pdu(pdu);
        }
    }

    /// Whether a status-bearing PDU is older than what we've seen; otherwise
    /// record its StatSN
    fn accept_stat_sn(&mut self, pdu: &mut Pdu, rsp: &IscsiPdu) -> bool {
        let stat_sn = rsp.stat_sn();
        if serial32_compare(stat_sn, self.session.stat_sn) == Ordering::Less {
            warn!(
                "Stale StatSN {} (have {}) for itt 0x{:08x}",
                stat_sn, self.session.stat_sn, pdu.itt
            );
            pdu.complete_with_status(CommandStatus::Error);
            return false;
        }
        self.session.update_stat_sn(stat_sn);
        true
    }

    pub(crate) fn process_scsi_response(&mut self, pdu: &mut Pdu, rsp: &IscsiPdu) -> ScsiResult<bool> {
        if !self.accept_stat_sn(pdu, rsp) {
            return Ok(true);
        }

        if !rsp.is_final() {
            error!("SCSI response for itt 0x{:08x} but Final bit is not set: 0x{:02x}", pdu.itt, rsp.flags);
            pdu.complete_with_status(CommandStatus::Error);
            return Ok(true);
        }
        if rsp.flags & flags::ACK != 0 {
            error!("SCSI response for itt 0x{:08x} asked for ACK: 0x{:02x}", pdu.itt, rsp.flags);
            pdu.complete_with_status(CommandStatus::Error);
            return Ok(true);
        }
        if rsp.response() != 0 {
            error!("Target failure 0x{:02x} for itt 0x{:08x}", rsp.response(), pdu.itt);
            pdu.complete_with_status(CommandStatus::Error);
            return Ok(true);
        }

        let status = CommandStatus::from_scsi(rsp.status());
        let indata = std::mem::take(&mut pdu.indata);
        let Some(mut task) = pdu.task.take() else {
            pdu.complete(Outcome::status(status));
            return Ok(true);
        };

        match status {
            CommandStatus::Good | CommandStatus::ConditionMet => {
                if !indata.is_empty() {
                    task.data_in = indata;
                }
                set_residual(&mut task, rsp);
            }
            CommandStatus::CheckCondition => match SenseData::from_response_data(&rsp.data) {
                Ok(sense) => {
                    warn!(
                        "itt 0x{:08x}: CHECK CONDITION sense key 0x{:x} ASC/ASCQ 0x{:04x}",
                        pdu.itt, sense.key, sense.ascq
                    );
                    task.sense = Some(sense);
                }
                Err(e) => warn!("itt 0x{:08x}: CHECK CONDITION with bad sense: {}", pdu.itt, e),
            },
            other => debug!("itt 0x{:08x} completed with {:?}", pdu.itt, other),
        }

        task.status = Some(status);
        pdu.complete(Outcome::new(status, Reply::Scsi(Box::new(task))));
        Ok(true)
    }

    pub(crate) fn process_data_in(&mut self, pdu: &mut Pdu, rsp: &IscsiPdu) -> ScsiResult<bool> {
        if rsp.flags & flags::ACK != 0 {
            error!("Data-In for itt 0x{:08x} asked for ACK: 0x{:02x}", pdu.itt, rsp.flags);
            pdu.complete_with_status(CommandStatus::Error);
            return Ok(true);
        }

        let placed = match pdu.task.as_mut().and_then(|t| t.data_in_buffer.as_mut()) {
            Some(buffer) => buffer.write_at(rsp.buffer_offset() as usize, &rsp.data),
            None => {
                pdu.indata.extend_from_slice(&rsp.data);
                Ok(())
            }
        };
        if let Err(e) = placed {
            error!("Data-In for itt 0x{:08x} doesn't fit: {}", pdu.itt, e);
            pdu.complete_with_status(CommandStatus::Error);
            return Ok(true);
        }

        if !rsp.is_final() || rsp.flags & flags::STATUS == 0 {
            return Ok(false);
        }

        if !self.accept_stat_sn(pdu, rsp) {
            return Ok(true);
        }

        let status = CommandStatus::from_scsi(rsp.status());
        let indata = std::mem::take(&mut pdu.indata);
        let Some(mut task) = pdu.task.take() else {
            pdu.complete(Outcome::status(status));
            return Ok(true);
        };
        if task.data_in_buffer.is_none() {
            task.data_in = indata;
        }
        set_residual(&mut task, rsp);
        task.status = Some(status);
        pdu.complete(Outcome::new(status, Reply::Scsi(Box::new(task))));
        Ok(true)
    }

    pub(crate) fn process_r2t(&mut self, pdu: &mut Pdu, rsp: &IscsiPdu) -> ScsiResult<bool> {
        let ttt = rsp.ttt();
        let offset = rsp.buffer_offset();
        let len = rsp.desired_data_length();
        debug!(
            "R2T itt=0x{:08x} ttt=0x{:08x} offset={} len={}",
            pdu.itt, ttt, offset, len
        );

        if let Err(e) = self.send_data_out(pdu, ttt, offset, len) {
            error!("Data-Out for R2T on itt 0x{:08x} failed: {}", pdu.itt, e);
            self.abort_transfer(pdu.itt);
            pdu.complete_with_status(CommandStatus::Error);
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::opcode;

    #[test]
    fn test_write_split_immediate_and_unsolicited() {
        // 1 MiB, FirstBurst 256K, segments of 64K
        let split = WriteSplit::new(1 << 20, 256 * 1024, 64 * 1024, true, false);
        assert_eq!(split.immediate, 64 * 1024);
        assert_eq!(split.unsolicited, 192 * 1024);
        assert!(split.immediate + split.unsolicited <= 256 * 1024);
    }

    #[test]
    fn test_write_split_initial_r2t() {
        let split = WriteSplit::new(1 << 20, 256 * 1024, 64 * 1024, true, true);
        assert_eq!(split.immediate, 64 * 1024);
        assert_eq!(split.unsolicited, 0);

        let split = WriteSplit::new(1 << 20, 256 * 1024, 64 * 1024, false, true);
        assert_eq!(split, WriteSplit { immediate: 0, unsolicited: 0 });
    }

    #[test]
    fn test_write_split_small_write() {
        let split = WriteSplit::new(4096, 65536, 8192, true, false);
        assert_eq!(split.immediate, 4096);
        assert_eq!(split.unsolicited, 0);

        let split = WriteSplit::new(4096, 65536, 8192, false, false);
        assert_eq!(split.immediate, 0);
        assert_eq!(split.unsolicited, 4096);
    }

    #[test]
    fn test_write_split_clamps_at_zero() {
        // Immediate already covers the whole first burst
        let split = WriteSplit::new(1 << 20, 8192, 65536, true, false);
        assert_eq!(split.immediate, 8192);
        assert_eq!(split.unsolicited, 0);
    }

    #[test]
    fn test_residual_flags() {
        let mut task = ScsiTask::read10(0, 8, 512);
        let mut rsp = IscsiPdu::scsi_response(1, 1, 1, 1, 0, 0, 1024, None);

        set_residual(&mut task, &rsp);
        assert_eq!(task.residual_status, ResidualStatus::None);
        assert_eq!(task.residual, 0);

        rsp.flags |= flags::UNDERFLOW;
        set_residual(&mut task, &rsp);
        assert_eq!(task.residual_status, ResidualStatus::Underflow);
        assert_eq!(task.residual, 1024);

        rsp.flags = flags::FINAL | flags::OVERFLOW;
        set_residual(&mut task, &rsp);
        assert_eq!(task.residual_status, ResidualStatus::Overflow);
        assert_eq!(rsp.opcode, opcode::SCSI_RESPONSE);
    }
}
