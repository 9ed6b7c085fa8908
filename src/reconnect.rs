//! Re-establishing a broken connection
//!
//! Outstanding SCSI commands survive a reconnect: they are pulled out of the
//! queues, the transport reconnects and logs in again, and each command is
//! issued anew with a fresh itt and CmdSN, completing through the channel it
//! was submitted with. Everything else is cancelled.

use crate::error::{IscsiError, ScsiResult};
use crate::initiator::IscsiInitiator;
use crate::login::LoginState;
use crate::pdu::opcode;
use crate::queue::{pdu_flags, Outcome, Reply};
use crate::scsi::{CommandStatus, ScsiTask};
use crate::session::sort_by_serial;
use crossbeam_channel::Sender;
use log::{error, info, warn};

/// A command taken out of the queues, waiting to be issued again
struct PendingCommand {
    task: ScsiTask,
    lun: u32,
    tx: Sender<Outcome>,
}

impl IscsiInitiator {
    /// Reconnect, log in again and re-issue outstanding commands
    pub fn reconnect(&mut self) -> ScsiResult<()> {
        let mut pending = Vec::new();
        for mut pdu in self.queues.drain_all() {
            if pdu.opcode() == opcode::SCSI_COMMAND && !pdu.has_flag(pdu_flags::DROP_ON_RECONNECT) {
                if let (Some(task), Some(tx)) = (pdu.task.take(), pdu.take_completion()) {
                    pending.push(PendingCommand {
                        task,
                        lun: pdu.lun,
                        tx,
                    });
                }
            } else if !pdu.has_flag(pdu_flags::NO_CALLBACK) {
                pdu.complete_with_status(CommandStatus::Cancelled);
            }
            self.free_pdu(pdu);
        }
        sort_by_serial(&mut pending, |cmd| cmd.task.cmd_sn);

        warn!(
            "Reconnecting to {} with {} commands to re-issue",
            self.portal,
            pending.len()
        );

        self.disconnect();
        self.login = LoginState::new(&self.config.auth);
        self.queues.reset_itt();
        self.reconnecting = true;

        let result = self.reconnect_loop();
        self.reconnecting = false;

        if let Err(e) = result {
            error!("Reconnect to {} failed: {}", self.portal, e);
            for cmd in pending {
                fail_pending(cmd, CommandStatus::Error);
            }
            return Err(e);
        }

        let count = pending.len();
        for PendingCommand { mut task, lun, tx } in pending {
            task.reset_results();
            if let Err((e, task)) = self.issue_command(task, lun, tx.clone()) {
                error!("Re-issuing command on lun {} failed: {}", lun, e);
                let reply = match task {
                    Some(mut task) => {
                        task.status = Some(CommandStatus::Error);
                        Reply::Scsi(Box::new(task))
                    }
                    None => Reply::None,
                };
                let _ = tx.send(Outcome::new(CommandStatus::Error, reply));
            }
        }
        info!("Reconnected to {}, re-issued {} commands", self.portal, count);
        Ok(())
    }

    fn reconnect_loop(&mut self) -> ScsiResult<()> {
        let attempts = self.config.reconnect_attempts.max(1);
        let mut last_error = IscsiError::Transport("No reconnect attempt made".to_string());
        for attempt in 1..=attempts {
            if attempt > 1 {
                std::thread::sleep(self.config.reconnect_delay);
            }
            info!("Reconnect attempt {}/{} to {}", attempt, attempts, self.portal);
            match self.login_sync() {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("Reconnect attempt {} failed: {}", attempt, e);
                    self.transport.disconnect();
                    self.session.reset();
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

fn fail_pending(cmd: PendingCommand, status: CommandStatus) {
    let mut task = cmd.task;
    task.status = Some(status);
    let _ = cmd.tx.send(Outcome::new(status, Reply::Scsi(Box::new(task))));
}
