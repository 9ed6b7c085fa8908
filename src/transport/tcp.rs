//! TCP transport driver
//!
//! Outgoing PDUs are serialised at queue time and written from the FIFO
//! outqueue when the socket is writable. Incoming bytes accumulate in a
//! growable buffer from which every complete frame is cut.

use super::{Events, PduExtension, Transport, TransportContext, TransportKind};
use crate::error::{IscsiError, ScsiResult};
use crate::pdu::{self, opcode, IscsiPdu, BHS_SIZE};
use crate::queue::{pdu_flags, Pdu};
use crate::session::{DigestType, IscsiSession};
use log::{debug, error, info, warn};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

const READ_CHUNK: usize = 64 * 1024;

/// Serialised form of a queued PDU and how much of it has been written
#[derive(Debug, Default)]
pub struct TcpPduExt {
    pub wire: Vec<u8>,
    pub written: usize,
}

/// iSCSI over a TCP byte stream
pub struct TcpTransport {
    stream: Option<TcpStream>,
    inbuf: Vec<u8>,
    portal: Option<String>,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpTransport {
    pub fn new() -> Self {
        TcpTransport {
            stream: None,
            inbuf: Vec::new(),
            portal: None,
        }
    }

    fn stream(&mut self) -> ScsiResult<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| IscsiError::Transport("Not connected".to_string()))
    }

    /// Write queued PDUs while the socket accepts bytes and the window allows
    fn flush_outqueue(&mut self, ctx: &mut TransportContext<'_>) -> ScsiResult<()> {
        loop {
            let Some(front) = ctx.queues.outqueue.front_mut() else {
                return Ok(());
            };

            if !front_may_go(front, ctx.session) {
                debug!(
                    "Command window closed (CmdSN {} > MaxCmdSN {}), holding outqueue",
                    front.cmd_sn, ctx.session.max_cmd_sn
                );
                return Ok(());
            }

            let Some(PduExtension::Tcp(ext)) = front.ext.as_mut() else {
                return Err(IscsiError::Transport(format!(
                    "PDU itt 0x{:08x} has no TCP state",
                    front.itt
                )));
            };

            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| IscsiError::Transport("Not connected".to_string()))?;

            while ext.written < ext.wire.len() {
                match stream.write(&ext.wire[ext.written..]) {
                    Ok(0) => {
                        return Err(IscsiError::Transport(
                            "Connection closed while writing".to_string(),
                        ))
                    }
                    Ok(n) => ext.written += n,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        error!("Write to target failed: {}", e);
                        return Err(IscsiError::Io(e));
                    }
                }
            }

            let Some(sent) = ctx.queues.outqueue.pop_front() else {
                return Ok(());
            };
            debug!(
                "Sent {} itt=0x{:08x} cmdsn={}",
                sent.out.opcode_name(),
                sent.itt,
                sent.cmd_sn
            );

            if sent.has_flag(pdu_flags::DELETE_WHEN_SENT) {
                self.free_pdu(sent);
            } else if let Some(old) = ctx.queues.insert_wait(sent) {
                warn!("itt 0x{:08x} was already waiting for a reply", old.itt);
                self.free_pdu(old);
            }
        }
    }

    /// Pull everything the socket has ready into the input buffer
    fn fill_inbuf(&mut self) -> ScsiResult<()> {
        let mut chunk = vec![0u8; READ_CHUNK];
        let stream = self.stream()?;
        let mut received = Vec::new();
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    if received.is_empty() {
                        return Err(IscsiError::Transport(
                            "Connection closed by target".to_string(),
                        ));
                    }
                    break;
                }
                Ok(n) => received.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Read from target failed: {}", e);
                    return Err(IscsiError::Io(e));
                }
            }
        }
        self.inbuf.extend_from_slice(&received);
        Ok(())
    }
}

/// Cut every complete frame off the front of `buf`
///
/// Partial frames stay in the buffer. A data segment longer than
/// `max_recv_seg` is a protocol error.
pub fn extract_frames(
    buf: &mut Vec<u8>,
    header_digest: bool,
    max_recv_seg: u32,
) -> ScsiResult<Vec<IscsiPdu>> {
    let mut pdus = Vec::new();
    let mut consumed = 0;

    while buf.len() - consumed >= BHS_SIZE {
        let bhs = &buf[consumed..consumed + BHS_SIZE];
        let dsl = pdu::data_segment_length(bhs);
        if dsl > max_recv_seg as usize {
            return Err(IscsiError::Protocol(format!(
                "Data segment of {} bytes exceeds MaxRecvDataSegmentLength {}",
                dsl, max_recv_seg
            )));
        }

        let frame_len = pdu::frame_length(bhs, header_digest);
        if buf.len() - consumed < frame_len {
            break;
        }

        let frame = &buf[consumed..consumed + frame_len];
        pdus.push(IscsiPdu::from_wire(frame, header_digest)?);
        consumed += frame_len;
    }

    buf.drain(..consumed);
    Ok(pdus)
}

impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn connect(&mut self, portal: &str, timeout: Duration) -> ScsiResult<()> {
        if self.stream.is_some() {
            self.disconnect();
        }

        let addrs = portal.to_socket_addrs().map_err(|e| {
            IscsiError::Transport(format!("Cannot resolve portal {}: {}", portal, e))
        })?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_nonblocking(true)?;
                    info!("Connected to {} ({})", portal, addr);
                    self.stream = Some(stream);
                    self.inbuf.clear();
                    self.portal = Some(portal.to_string());
                    return Ok(());
                }
                Err(e) => {
                    debug!("Connect to {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }

        Err(match last_err {
            Some(e) => IscsiError::Transport(format!("Cannot connect to {}: {}", portal, e)),
            None => IscsiError::Transport(format!("Portal {} has no addresses", portal)),
        })
    }

    fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            if let Some(portal) = &self.portal {
                info!("Disconnected from {}", portal);
            }
        }
        self.inbuf.clear();
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn new_pdu(&mut self, pdu: &mut Pdu) -> ScsiResult<()> {
        pdu.ext = Some(PduExtension::Tcp(TcpPduExt::default()));
        Ok(())
    }

    fn free_pdu(&mut self, pdu: Pdu) {
        drop(pdu);
    }

    fn queue_pdu(&mut self, ctx: TransportContext<'_>, mut pdu: Pdu) -> ScsiResult<()> {
        let header_digest = ctx.session.params.header_digest == DigestType::CRC32C;
        let wire = pdu.out.to_wire(header_digest);
        pdu.ext = Some(PduExtension::Tcp(TcpPduExt { wire, written: 0 }));
        ctx.queues.push_out(pdu);
        Ok(())
    }

    fn service(
        &mut self,
        mut ctx: TransportContext<'_>,
        events: Events,
    ) -> ScsiResult<Vec<IscsiPdu>> {
        if self.stream.is_none() {
            return Err(IscsiError::Transport("Not connected".to_string()));
        }

        if events.contains(Events::ERROR) {
            let detail = self
                .stream()?
                .take_error()
                .ok()
                .flatten()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "socket error".to_string());
            return Err(IscsiError::Transport(detail));
        }

        let mut incoming = Vec::new();
        if events.contains(Events::READABLE) || events.contains(Events::HANGUP) {
            self.fill_inbuf()?;
            let header_digest = ctx.session.params.header_digest == DigestType::CRC32C;
            let max_recv = ctx.session.params.initiator_max_recv_data_segment_length;
            incoming = extract_frames(&mut self.inbuf, header_digest, max_recv)?;
        }

        if events.contains(Events::WRITABLE) {
            self.flush_outqueue(&mut ctx)?;
        }

        Ok(incoming)
    }

    #[cfg(unix)]
    fn get_fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }

    fn which_events(&self, ctx: &TransportContext<'_>) -> Events {
        let mut events = Events::READABLE;
        if ctx
            .queues
            .outqueue
            .front()
            .is_some_and(|front| front_may_go(front, ctx.session))
        {
            events |= Events::WRITABLE;
        }
        events
    }

    #[cfg(unix)]
    fn wait_events(&mut self, interest: Events, timeout: Duration) -> ScsiResult<Events> {
        let fd = self.stream()?.as_raw_fd();
        super::poll_fd(fd, interest, timeout)
    }

    #[cfg(not(unix))]
    fn wait_events(&mut self, interest: Events, timeout: Duration) -> ScsiResult<Events> {
        let stream = self.stream()?;
        if interest.contains(Events::WRITABLE) {
            // Reading a non-blocking socket with nothing pending is harmless
            return Ok(Events::READABLE | Events::WRITABLE);
        }

        let mut byte = [0u8; 1];
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        let result = stream.peek(&mut byte);
        stream.set_read_timeout(None)?;
        stream.set_nonblocking(true)?;

        match result {
            Ok(0) => Ok(Events::READABLE | Events::HANGUP),
            Ok(_) => Ok(Events::READABLE),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                Ok(Events::NONE)
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(Events::NONE),
            Err(_) => Ok(Events::ERROR),
        }
    }
}

/// Whether the head of the outqueue may be written now
///
/// Immediate PDUs and Data-Out always may; a numbered command only while
/// its CmdSN is inside the command window.
fn front_may_go(front: &Pdu, session: &IscsiSession) -> bool {
    front.is_immediate()
        || front.opcode() == opcode::SCSI_DATA_OUT
        || session.command_window_open(front.cmd_sn)
}
