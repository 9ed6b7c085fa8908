//! Task management functions (RFC 3720 Section 10.5)

use crate::error::{IscsiError, ScsiResult};
use crate::initiator::IscsiInitiator;
use crate::pdu::{opcode, tmf_function, tmf_response, IscsiPdu, RESERVED_TAG};
use crate::queue::{completion_channel, pdu_flags, Outcome, Pdu, Reply, TaskHandle};
use crate::scsi::CommandStatus;
use log::{info, warn};

/// Human-readable task management response
pub fn tmf_response_str(response: u8) -> &'static str {
    match response {
        tmf_response::FUNCTION_COMPLETE => "Function complete",
        tmf_response::TASK_DOES_NOT_EXIST => "Task does not exist",
        tmf_response::LUN_DOES_NOT_EXIST => "LUN does not exist",
        tmf_response::TASK_STILL_ALLEGIANT => "Task still allegiant",
        tmf_response::REASSIGNMENT_NOT_SUPPORTED => "Task allegiance reassignment not supported",
        tmf_response::FUNCTION_NOT_SUPPORTED => "Task management function not supported",
        tmf_response::AUTHORIZATION_FAILED => "Function authorization failed",
        tmf_response::FUNCTION_REJECTED => "Function rejected",
        _ => "Unknown",
    }
}

impl IscsiInitiator {
    /// Send a task management request
    ///
    /// Every function except ABORT TASK first cancels all local outstanding
    /// work. The outcome carries the target's response code.
    pub fn task_management(
        &mut self,
        function: u8,
        lun: u32,
        ref_itt: u32,
        ref_cmd_sn: u32,
    ) -> ScsiResult<TaskHandle> {
        if !self.session.is_logged_in() {
            return Err(IscsiError::NotLoggedIn);
        }
        if !(tmf_function::ABORT_TASK..=tmf_function::TASK_REASSIGN).contains(&function) {
            return Err(IscsiError::InvalidPdu(format!(
                "Unknown task management function {}",
                function
            )));
        }

        if function != tmf_function::ABORT_TASK {
            self.cancel_all();
        }

        let itt = self.queues.allocate_itt()?;
        let out = IscsiPdu::task_management_request(
            function,
            lun,
            itt,
            ref_itt,
            self.session.cmd_sn,
            ref_cmd_sn,
        );

        let (tx, rx) = completion_channel();
        let mut pdu = self.new_pdu(
            out,
            Some(opcode::TASK_MANAGEMENT_RESPONSE),
            pdu_flags::DROP_ON_RECONNECT,
        )?;
        pdu.cmd_sn = self.session.cmd_sn;
        pdu.lun = lun;
        pdu.set_completion(tx);
        self.queue_pdu(pdu)?;
        Ok(TaskHandle::new(itt, self.session.cmd_sn, lun, rx))
    }

    /// Ask the target to abort one outstanding command
    pub fn abort_task(&mut self, task: &TaskHandle) -> ScsiResult<TaskHandle> {
        self.task_management(tmf_function::ABORT_TASK, task.lun, task.itt, task.cmd_sn)
    }

    pub fn abort_task_set(&mut self, lun: u32) -> ScsiResult<TaskHandle> {
        self.task_management(
            tmf_function::ABORT_TASK_SET,
            lun,
            RESERVED_TAG,
            self.session.cmd_sn,
        )
    }

    pub fn lun_reset(&mut self, lun: u32) -> ScsiResult<TaskHandle> {
        self.task_management(
            tmf_function::LOGICAL_UNIT_RESET,
            lun,
            RESERVED_TAG,
            self.session.cmd_sn,
        )
    }

    pub fn target_warm_reset(&mut self) -> ScsiResult<TaskHandle> {
        self.task_management(
            tmf_function::TARGET_WARM_RESET,
            0,
            RESERVED_TAG,
            self.session.cmd_sn,
        )
    }

    pub fn target_cold_reset(&mut self) -> ScsiResult<TaskHandle> {
        self.task_management(
            tmf_function::TARGET_COLD_RESET,
            0,
            RESERVED_TAG,
            self.session.cmd_sn,
        )
    }

    pub(crate) fn process_task_mgmt_response(&mut self, pdu: &mut Pdu, rsp: &IscsiPdu) -> ScsiResult<bool> {
        self.session.update_stat_sn(rsp.stat_sn());
        let response = rsp.response();
        if response == tmf_response::FUNCTION_COMPLETE {
            info!("Task management itt 0x{:08x} complete", pdu.itt);
        } else {
            warn!(
                "Task management itt 0x{:08x}: {} (0x{:02x})",
                pdu.itt,
                tmf_response_str(response),
                response
            );
        }
        pdu.complete(Outcome::new(CommandStatus::Good, Reply::TaskMgmt(response)));
        Ok(true)
    }
}
