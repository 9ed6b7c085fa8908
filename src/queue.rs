//! PDU lifecycle: allocation, task tags, the two PDU queues and completion
//!
//! An outgoing PDU lives in exactly one place at a time: the outqueue
//! (waiting to be written), the waitpdu map (written, waiting for the
//! target's answer, keyed by itt), or in the hands of the code currently
//! processing it.

use crate::error::{IscsiError, ScsiResult};
use crate::login::DiscoveryAddress;
use crate::pdu::{IscsiPdu, RESERVED_TAG};
use crate::scsi::{CommandStatus, ScsiTask};
use crate::session::sort_by_serial;
use crate::transport::PduExtension;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use std::collections::{HashMap, VecDeque};

/// PDU lifecycle flags
pub mod pdu_flags {
    /// Free the PDU once written instead of waiting for a reply
    pub const DELETE_WHEN_SENT: u32 = 0x01;
    /// Never report completion for this PDU
    pub const NO_CALLBACK: u32 = 0x02;
    /// Discard instead of re-issuing after a reconnect
    pub const DROP_ON_RECONNECT: u32 = 0x04;
}

/// What a completed PDU hands back to its submitter
#[derive(Debug)]
pub enum Reply {
    None,
    Scsi(Box<ScsiTask>),
    Login,
    Discovery(Vec<DiscoveryAddress>),
    Nop(Vec<u8>),
    TaskMgmt(u8),
    Logout,
}

/// Final result delivered once per PDU
#[derive(Debug)]
pub struct Outcome {
    pub status: CommandStatus,
    pub reply: Reply,
}

impl Outcome {
    pub fn new(status: CommandStatus, reply: Reply) -> Self {
        Outcome { status, reply }
    }

    /// Outcome without payload
    pub fn status(status: CommandStatus) -> Self {
        Outcome { status, reply: Reply::None }
    }

    /// Take the SCSI task out of the outcome, if it carries one
    pub fn into_task(self) -> Option<ScsiTask> {
        match self.reply {
            Reply::Scsi(task) => Some(*task),
            _ => None,
        }
    }
}

/// Caller's handle to an outstanding request
#[derive(Debug)]
pub struct TaskHandle {
    pub itt: u32,
    pub cmd_sn: u32,
    pub lun: u32,
    rx: Receiver<Outcome>,
    outcome: Option<Outcome>,
    taken: bool,
}

impl TaskHandle {
    pub(crate) fn new(itt: u32, cmd_sn: u32, lun: u32, rx: Receiver<Outcome>) -> Self {
        TaskHandle {
            itt,
            cmd_sn,
            lun,
            rx,
            outcome: None,
            taken: false,
        }
    }

    /// Whether the outcome has arrived
    ///
    /// A handle whose sender was dropped without an outcome counts as
    /// complete with `Error`.
    pub fn is_complete(&mut self) -> bool {
        if self.taken || self.outcome.is_some() {
            return true;
        }
        match self.rx.try_recv() {
            Ok(outcome) => {
                self.outcome = Some(outcome);
                true
            }
            Err(TryRecvError::Empty) => false,
            Err(TryRecvError::Disconnected) => {
                self.outcome = Some(Outcome::status(CommandStatus::Error));
                true
            }
        }
    }

    /// Take the outcome, if it has arrived; yields it only once
    pub fn take_outcome(&mut self) -> Option<Outcome> {
        if self.taken || !self.is_complete() {
            return None;
        }
        self.taken = true;
        self.outcome.take()
    }
}

/// Create the completion channel for a new request
pub(crate) fn completion_channel() -> (Sender<Outcome>, Receiver<Outcome>) {
    crossbeam_channel::bounded(1)
}

/// One outgoing PDU and the bookkeeping needed to match its replies
#[derive(Debug)]
pub struct Pdu {
    pub itt: u32,
    pub cmd_sn: u32,
    pub lun: u32,
    /// Opcode expected in reply; `None` when no reply is expected
    pub response_opcode: Option<u8>,
    /// `pdu_flags` bits
    pub flags: u32,
    /// Header and payload to send
    pub out: IscsiPdu,
    /// Reassembly buffer for multi-PDU replies (text responses)
    pub indata: Vec<u8>,
    /// SCSI task carried by a command PDU
    pub task: Option<ScsiTask>,
    /// Immediate data carried in the command PDU itself
    pub immediate_len: u32,
    completion: Option<Sender<Outcome>>,
    /// Transport-private state
    pub ext: Option<PduExtension>,
}

impl Pdu {
    pub fn new(out: IscsiPdu, response_opcode: Option<u8>, flags: u32) -> Self {
        Pdu {
            itt: out.itt,
            cmd_sn: 0,
            lun: 0,
            response_opcode,
            flags,
            out,
            indata: Vec::new(),
            task: None,
            immediate_len: 0,
            completion: None,
            ext: None,
        }
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    /// Whether the PDU bypasses the CmdSN window
    pub fn is_immediate(&self) -> bool {
        self.out.immediate
    }

    pub fn opcode(&self) -> u8 {
        self.out.opcode
    }

    pub(crate) fn set_completion(&mut self, tx: Sender<Outcome>) {
        self.completion = Some(tx);
    }

    pub(crate) fn take_completion(&mut self) -> Option<Sender<Outcome>> {
        self.completion.take()
    }

    /// Deliver the outcome; fires at most once and never for `NO_CALLBACK` PDUs
    pub fn complete(&mut self, outcome: Outcome) {
        if self.has_flag(pdu_flags::NO_CALLBACK) {
            return;
        }
        if let Some(tx) = self.completion.take() {
            // The caller may have dropped its handle
            let _ = tx.send(outcome);
        }
    }

    /// Complete with a bare status, handing back the task if there is one
    pub fn complete_with_status(&mut self, status: CommandStatus) {
        let reply = match self.task.take() {
            Some(mut task) => {
                task.status = Some(status);
                Reply::Scsi(Box::new(task))
            }
            None => Reply::None,
        };
        self.complete(Outcome::new(status, reply));
    }
}

/// The outqueue and waitpdu collections plus the itt counter
#[derive(Debug)]
pub struct PduQueues {
    pub outqueue: VecDeque<Pdu>,
    pub waitpdu: HashMap<u32, Pdu>,
    next_itt: u32,
}

impl Default for PduQueues {
    fn default() -> Self {
        Self::new()
    }
}

impl PduQueues {
    pub fn new() -> Self {
        PduQueues {
            outqueue: VecDeque::new(),
            waitpdu: HashMap::new(),
            next_itt: 1,
        }
    }

    /// Whether any queued or outstanding PDU uses this itt
    pub fn itt_in_use(&self, itt: u32) -> bool {
        self.waitpdu.contains_key(&itt) || self.outqueue.iter().any(|p| p.itt == itt)
    }

    /// Hand out the next free itt
    ///
    /// Wraps around, skipping the reserved tag and any tag still in use.
    pub fn allocate_itt(&mut self) -> ScsiResult<u32> {
        let attempts = self.len() + 2;
        for _ in 0..attempts {
            let itt = self.next_itt;
            self.next_itt = self.next_itt.wrapping_add(1);
            if self.next_itt == RESERVED_TAG {
                self.next_itt = 0;
            }
            if itt == RESERVED_TAG || self.itt_in_use(itt) {
                continue;
            }
            return Ok(itt);
        }
        Err(IscsiError::Resource("No free initiator task tag".to_string()))
    }

    /// Restart the itt counter (new connection)
    pub fn reset_itt(&mut self) {
        self.next_itt = 1;
    }

    /// Number of PDUs in both queues
    pub fn len(&self) -> usize {
        self.outqueue.len() + self.waitpdu.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outqueue.is_empty() && self.waitpdu.is_empty()
    }

    pub fn push_out(&mut self, pdu: Pdu) {
        self.outqueue.push_back(pdu);
    }

    /// Park a sent PDU until its reply arrives
    ///
    /// Returns the PDU previously waiting under the same itt, if any.
    pub fn insert_wait(&mut self, pdu: Pdu) -> Option<Pdu> {
        self.waitpdu.insert(pdu.itt, pdu)
    }

    pub fn take_wait(&mut self, itt: u32) -> Option<Pdu> {
        self.waitpdu.remove(&itt)
    }

    /// Remove every PDU carrying `itt` from both queues (waitpdu first)
    pub fn remove_all(&mut self, itt: u32) -> Vec<Pdu> {
        let mut removed = Vec::new();
        if let Some(pdu) = self.waitpdu.remove(&itt) {
            removed.push(pdu);
        }
        let (matching, rest): (VecDeque<Pdu>, VecDeque<Pdu>) =
            self.outqueue.drain(..).partition(|p| p.itt == itt);
        self.outqueue = rest;
        removed.extend(matching);
        removed
    }

    /// Empty both queues (waitpdu first, then outqueue in order)
    pub fn drain_all(&mut self) -> Vec<Pdu> {
        let mut removed: Vec<Pdu> = self.waitpdu.drain().map(|(_, p)| p).collect();
        sort_by_serial(&mut removed, |p| p.cmd_sn);
        removed.extend(self.outqueue.drain(..));
        removed
    }
}
