//! Transport drivers
//!
//! The engine talks to the wire only through [`Transport`]. Two drivers
//! exist: [`tcp::TcpTransport`] for a plain byte stream and
//! [`iser::IserTransport`] for an RDMA queue pair.

pub mod iser;
pub mod tcp;

use crate::error::{IscsiError, ScsiResult};
use crate::pdu::IscsiPdu;
use crate::queue::{Pdu, PduQueues};
use crate::session::IscsiSession;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
#[cfg(unix)]
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Which transport a session rides on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    #[default]
    Tcp,
    Iser,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Iser => "iser",
        }
    }
}

/// Readiness bits, laid out like poll(2) revents
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Events(u32);

impl Events {
    pub const NONE: Events = Events(0);
    pub const READABLE: Events = Events(0x01);
    pub const WRITABLE: Events = Events(0x04);
    pub const ERROR: Events = Events(0x08);
    pub const HANGUP: Events = Events(0x10);

    pub fn from_bits(bits: u32) -> Self {
        Events(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: Events) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Events {
    type Output = Events;

    fn bitor(self, rhs: Events) -> Events {
        Events(self.0 | rhs.0)
    }
}

impl BitOrAssign for Events {
    fn bitor_assign(&mut self, rhs: Events) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Events::READABLE) {
            names.push("READABLE");
        }
        if self.contains(Events::WRITABLE) {
            names.push("WRITABLE");
        }
        if self.contains(Events::ERROR) {
            names.push("ERROR");
        }
        if self.contains(Events::HANGUP) {
            names.push("HANGUP");
        }
        write!(f, "Events({})", names.join("|"))
    }
}

/// Per-PDU transport state
#[derive(Debug)]
pub enum PduExtension {
    Tcp(tcp::TcpPduExt),
    Iser(iser::IserPduExt),
}

/// What a driver may touch while queueing or servicing
///
/// The engine owns the queues and the session; drivers borrow them for the
/// duration of one call.
pub struct TransportContext<'a> {
    pub queues: &'a mut PduQueues,
    pub session: &'a IscsiSession,
}

impl<'a> TransportContext<'a> {
    pub fn new(queues: &'a mut PduQueues, session: &'a IscsiSession) -> Self {
        TransportContext { queues, session }
    }
}

/// Capability set every transport driver provides
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Establish the connection to `portal` ("host:port")
    fn connect(&mut self, portal: &str, timeout: Duration) -> ScsiResult<()>;

    /// Tear the connection down; PDUs still queued are left to the engine
    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// Attach transport-private state to a freshly allocated PDU
    fn new_pdu(&mut self, pdu: &mut Pdu) -> ScsiResult<()>;

    /// Release a PDU that is in neither queue
    fn free_pdu(&mut self, pdu: Pdu);

    /// Hand a PDU (ExpStatSN already stamped) to the driver
    fn queue_pdu(&mut self, ctx: TransportContext<'_>, pdu: Pdu) -> ScsiResult<()>;

    /// Perform the I/O the readiness events allow and return every complete
    /// inbound PDU, in arrival order
    fn service(&mut self, ctx: TransportContext<'_>, events: Events) -> ScsiResult<Vec<IscsiPdu>>;

    /// Send PDUs parked while the command window was closed
    fn resume_queued(&mut self, _ctx: TransportContext<'_>) -> ScsiResult<()> {
        Ok(())
    }

    /// Descriptor to poll, when the driver has one
    #[cfg(unix)]
    fn get_fd(&self) -> Option<RawFd>;

    /// Events the caller should wait for
    fn which_events(&self, ctx: &TransportContext<'_>) -> Events;

    /// Block until one of `interest` is ready or `timeout` passes
    ///
    /// Returns the ready events, empty on timeout.
    fn wait_events(&mut self, interest: Events, timeout: Duration) -> ScsiResult<Events>;
}

#[cfg(unix)]
/// Wait on a descriptor with poll(2) and translate its revents
pub(crate) fn poll_fd(fd: RawFd, interest: Events, timeout: Duration) -> ScsiResult<Events> {
    let mut wanted: libc::c_short = 0;
    if interest.contains(Events::READABLE) {
        wanted |= libc::POLLIN;
    }
    if interest.contains(Events::WRITABLE) {
        wanted |= libc::POLLOUT;
    }
    let mut pfd = libc::pollfd {
        fd,
        events: wanted,
        revents: 0,
    };
    let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

    let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            return Ok(Events::NONE);
        }
        return Err(IscsiError::Io(err));
    }

    let mut ready = Events::NONE;
    if pfd.revents & libc::POLLIN != 0 {
        ready |= Events::READABLE;
    }
    if pfd.revents & libc::POLLOUT != 0 {
        ready |= Events::WRITABLE;
    }
    if pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        ready |= Events::ERROR;
    }
    if pfd.revents & libc::POLLHUP != 0 {
        ready |= Events::HANGUP;
    }
    Ok(ready)
}

/// Build the driver for `kind`
///
/// iSER runs over the host's verbs stack. Construct
/// [`iser::IserTransport::new`] directly to use another provider, such as
/// the in-process fabric in [`iser::soft`].
pub fn create(kind: TransportKind, iser_max_cmds: u16) -> ScsiResult<Box<dyn Transport>> {
    match kind {
        TransportKind::Tcp => Ok(Box::new(tcp::TcpTransport::new())),
        TransportKind::Iser => create_iser(iser_max_cmds),
    }
}

#[cfg(target_os = "linux")]
fn create_iser(max_cmds: u16) -> ScsiResult<Box<dyn Transport>> {
    Ok(Box::new(iser::IserTransport::new(iser::ibverbs::IbRdma::new(), max_cmds)))
}

#[cfg(not(target_os = "linux"))]
fn create_iser(_max_cmds: u16) -> ScsiResult<Box<dyn Transport>> {
    Err(IscsiError::Transport("iSER needs the Linux RDMA stack".to_string()))
}
