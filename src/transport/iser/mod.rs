//! iSER transport driver (iSCSI Extensions for RDMA)
//!
//! PDUs are posted to the queue pair as soon as they are queued. The
//! outqueue is only used while the command window is closed; parked PDUs
//! are revived from [`Transport::resume_queued`]. SCSI data never travels
//! in Data-In / Data-Out PDUs: the target moves it with RDMA READ and WRITE
//! against a registered buffer advertised in the iSER header.

pub mod buffer;
pub mod cm;
pub mod header;
#[cfg(target_os = "linux")]
pub mod ibverbs;
pub mod rx;
pub mod soft;
pub mod verbs;

use self::buffer::{BufferPool, DataBuffer};
use self::cm::{ConnState, ConnectionManager, RdmaProvider};
use self::header::{IserHeader, ISER_HEADER_LEN};
use self::rx::{RxState, DEF_XMIT_CMDS_MAX, HEADERS_LEN};
use self::verbs::{access, MemoryRegion, ProtectionDomain, QpCaps, QueuePair, SendWr, Sge};
use self::verbs::{WcOpcode, WcStatus};
use super::{Events, PduExtension, Transport, TransportContext, TransportKind};
use crate::error::{IscsiError, ScsiResult};
use crate::pdu::{flags, opcode, IscsiPdu};
use crate::queue::Pdu;
use crate::scsi::{ScsiTask, XferDir};
use log::{debug, error, info, warn};
#[cfg(unix)]
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Completions reaped per poll
const CQ_BATCH: usize = 16;
/// Completions handled per `service` call
const CQ_BUDGET: usize = 512;
const MAX_CQ_LEN: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescKind {
    Control,
    Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDir {
    None,
    Read,
    Write,
}

/// Send descriptor of a posted PDU
#[derive(Debug)]
pub struct TxDesc {
    pub header: IserHeader,
    pub kind: DescKind,
    pub dir: DataDir,
    hdr_mr: MemoryRegion,
    data: Option<DataBuffer>,
}

impl TxDesc {
    pub fn data(&self) -> Option<&DataBuffer> {
        self.data.as_ref()
    }
}

/// Per-PDU iSER state
#[derive(Debug, Default)]
pub struct IserPduExt {
    pub tx: Option<TxDesc>,
}

/// Whether the PDU goes out as a control send (headers + copied payload)
pub fn is_control_opcode(op: u8) -> bool {
    matches!(
        op,
        opcode::NOP_OUT | opcode::LOGIN_REQUEST | opcode::LOGOUT_REQUEST | opcode::TEXT_REQUEST
    )
}

struct IserConn {
    pd: Arc<dyn ProtectionDomain>,
    qp: Box<dyn QueuePair>,
    rx: RxState,
    pool: BufferPool,
    hdr_mrs: Vec<MemoryRegion>,
}

impl IserConn {
    fn alloc_tx(&mut self, kind: DescKind, data_size: usize) -> ScsiResult<TxDesc> {
        let hdr_mr = match self.hdr_mrs.pop() {
            Some(mr) => mr,
            None => self.pd.reg_mr(HEADERS_LEN, access::LOCAL_WRITE)?,
        };
        let data = match self.pool.alloc(data_size) {
            Ok(data) => data,
            Err(e) => {
                self.hdr_mrs.push(hdr_mr);
                return Err(e);
            }
        };
        Ok(TxDesc {
            header: IserHeader::new(),
            kind,
            dir: DataDir::None,
            hdr_mr,
            data,
        })
    }

    fn release_tx(&mut self, tx: TxDesc) {
        if let Some(data) = tx.data {
            self.pool.free(data);
        }
        self.hdr_mrs.push(tx.hdr_mr);
    }

    /// Build and post the send for `pdu`
    fn post(&mut self, pdu: &mut Pdu) -> ScsiResult<()> {
        let op = pdu.opcode();
        let control = is_control_opcode(op);
        let data_size = match &pdu.task {
            Some(task) if !control => task.expected_xfer_len as usize,
            _ => pdu.out.data.len(),
        };
        let kind = if control {
            DescKind::Control
        } else {
            DescKind::Command
        };

        let mut tx = self.alloc_tx(kind, data_size)?;
        let prepared = if control {
            prepare_control(&mut tx, &pdu.out)
        } else {
            prepare_command(&mut tx, &pdu.out, pdu.task.as_ref())
        };
        let sg_list = match prepared {
            Ok(sges) => sges,
            Err(e) => {
                self.release_tx(tx);
                return Err(e);
            }
        };

        if let Err(e) = self.post_tx(&tx, &pdu.out, sg_list, pdu.itt) {
            self.release_tx(tx);
            return Err(e);
        }

        pdu.ext = Some(PduExtension::Iser(IserPduExt { tx: Some(tx) }));
        Ok(())
    }

    fn post_tx(&mut self, tx: &TxDesc, out: &IscsiPdu, data_sges: Vec<Sge>, itt: u32) -> ScsiResult<()> {
        tx.hdr_mr.write(0, &tx.header.to_bytes())?;
        tx.hdr_mr.write(ISER_HEADER_LEN, &out.bhs())?;

        let mut sg_list = vec![Sge::from_region(&tx.hdr_mr, 0, HEADERS_LEN)];
        sg_list.extend(data_sges);
        self.qp.post_send(SendWr {
            wr_id: itt as u64,
            sg_list,
            signaled: true,
        })
    }
}

/// Control PDU: payload copied into the registered buffer, sent as SGE 1
fn prepare_control(tx: &mut TxDesc, out: &IscsiPdu) -> ScsiResult<Vec<Sge>> {
    if out.data.is_empty() {
        return Ok(Vec::new());
    }
    let data = tx
        .data
        .as_ref()
        .ok_or_else(|| IscsiError::Resource("No buffer for control payload".to_string()))?;
    data.write(0, &out.data)?;
    Ok(vec![Sge::from_region(data.region(), data.offset(), out.data.len())])
}

/// SCSI command: advertise the data buffer for the target's RDMA
fn prepare_command(tx: &mut TxDesc, out: &IscsiPdu, task: Option<&ScsiTask>) -> ScsiResult<Vec<Sge>> {
    if out.flags & flags::READ != 0 {
        let data = tx.data.as_ref().ok_or_else(|| {
            IscsiError::Scsi("Read command with no expected transfer length".to_string())
        })?;
        tx.header.set_read(data.rkey(), data.addr());
        tx.dir = DataDir::Read;
        return Ok(Vec::new());
    }

    if out.flags & flags::WRITE != 0 {
        let payload = task
            .and_then(|t| t.data_out.as_ref())
            .ok_or_else(|| IscsiError::Scsi("Can't find data for DATA-OUT (RDMA)".to_string()))?;
        let data = tx
            .data
            .as_ref()
            .ok_or_else(|| IscsiError::Resource("No buffer for write payload".to_string()))?;

        let mut offset = 0;
        for segment in payload.segments() {
            data.write(offset, segment)?;
            offset += segment.len();
        }
        tx.dir = DataDir::Write;

        let immediate = out.data.len();
        tx.header
            .set_write(data.rkey(), data.addr() + immediate as u64);
        if immediate > 0 {
            return Ok(vec![Sge::from_region(data.region(), data.offset(), immediate)]);
        }
        return Ok(Vec::new());
    }

    Ok(Vec::new())
}

/// Copy RDMA-written read data from the registered buffer into the task
fn copy_read_data(pdu: &mut Pdu, response: &IscsiPdu) -> ScsiResult<()> {
    let Some(PduExtension::Iser(IserPduExt { tx: Some(tx) })) = pdu.ext.as_ref() else {
        return Ok(());
    };
    if tx.kind != DescKind::Command || tx.dir != DataDir::Read {
        return Ok(());
    }
    let (Some(data), Some(task)) = (tx.data.as_ref(), pdu.task.as_mut()) else {
        return Ok(());
    };

    let mut len = task.expected_xfer_len as usize;
    if response.flags & flags::UNDERFLOW != 0 {
        len = len.saturating_sub(response.residual_count() as usize);
    }
    let bytes = data.read(0, len.min(data.len()))?;
    match task.data_in_buffer.as_mut() {
        Some(buffer) => buffer.write_at(0, &bytes)?,
        None => task.data_in = bytes,
    }
    Ok(())
}

/// iSCSI over an RDMA reliable connection
pub struct IserTransport {
    provider: Arc<dyn RdmaProvider>,
    max_cmds: u16,
    cm: Option<ConnectionManager>,
    conn: Option<IserConn>,
}

impl IserTransport {
    pub fn new<P: RdmaProvider + 'static>(provider: P, max_cmds: u16) -> Self {
        IserTransport {
            provider: Arc::new(provider),
            max_cmds: if max_cmds == 0 {
                DEF_XMIT_CMDS_MAX
            } else {
                max_cmds
            },
            cm: None,
            conn: None,
        }
    }

    pub fn max_cmds(&self) -> u16 {
        self.max_cmds
    }

    /// Receive requests outstanding on the queue pair
    pub fn posted_receives(&self) -> usize {
        self.conn.as_ref().map_or(0, |c| c.rx.posted())
    }

    fn caps(&self) -> QpCaps {
        let cmds = self.max_cmds as u32;
        QpCaps {
            max_send_wr: cmds + 1,
            max_recv_wr: cmds,
            max_send_sge: 2,
            max_recv_sge: 1,
            cq_len: (cmds * 2 + 1).min(MAX_CQ_LEN),
        }
    }

    fn conn(&mut self) -> ScsiResult<&mut IserConn> {
        self.conn
            .as_mut()
            .ok_or_else(|| IscsiError::Transport("Not connected".to_string()))
    }

    /// Post `pdu` and park it in waitpdu
    ///
    /// On a failed post the PDU still lands in waitpdu so the engine's
    /// recovery sees it.
    fn send_pdu(&mut self, ctx: &mut TransportContext<'_>, mut pdu: Pdu) -> ScsiResult<()> {
        pdu.out.set_exp_stat_sn(ctx.session.exp_stat_sn());

        let result = match self.conn.as_mut() {
            Some(conn) => conn.post(&mut pdu),
            None => Err(IscsiError::Transport("Not connected".to_string())),
        };

        match &result {
            Ok(()) => debug!(
                "Posted {} itt=0x{:08x} cmdsn={}",
                pdu.out.opcode_name(),
                pdu.itt,
                pdu.cmd_sn
            ),
            Err(e) => error!("Posting itt 0x{:08x} failed: {}", pdu.itt, e),
        }

        if let Some(old) = ctx.queues.insert_wait(pdu) {
            warn!("itt 0x{:08x} was already waiting for a reply", old.itt);
            self.free_pdu(old);
        }
        result
    }

    fn handle_completions(&mut self, ctx: &mut TransportContext<'_>) -> ScsiResult<Vec<IscsiPdu>> {
        let mut incoming = Vec::new();
        let mut completed = 0;
        let logged_in = ctx.session.is_logged_in();

        loop {
            let conn = self.conn()?;
            let wcs = conn.qp.poll_cq(CQ_BATCH)?;
            if wcs.is_empty() {
                break;
            }
            completed += wcs.len();

            for wc in wcs {
                match (wc.status, wc.opcode) {
                    (WcStatus::Success, WcOpcode::Recv) => {
                        let pdu = conn.rx.message(wc.wr_id, wc.byte_len)?;

                        if pdu.opcode == opcode::SCSI_RESPONSE {
                            if let Some(waiting) = ctx.queues.waitpdu.get_mut(&pdu.itt) {
                                copy_read_data(waiting, &pdu)?;
                            }
                        }

                        let IserConn { rx, qp, .. } = &mut *conn;
                        rx.replenish(qp.as_mut(), wc.wr_id, logged_in)?;
                        incoming.push(pdu);
                    }
                    (WcStatus::Success, WcOpcode::Send) => {}
                    (WcStatus::WrFlushErr, _) => {
                        debug!("Flushed work request 0x{:x}", wc.wr_id);
                    }
                    (WcStatus::Error(status), _) => {
                        return Err(IscsiError::Transport(format!(
                            "Work request 0x{:x} failed: status {} vendor error 0x{:x}",
                            wc.wr_id, status, wc.vendor_err
                        )));
                    }
                }
            }

            if completed >= CQ_BUDGET {
                break;
            }
        }

        Ok(incoming)
    }
}

impl Transport for IserTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Iser
    }

    fn connect(&mut self, portal: &str, timeout: Duration) -> ScsiResult<()> {
        if self.cm.is_some() {
            self.disconnect();
        }

        let mut cm = ConnectionManager::start(
            self.provider.as_ref(),
            portal,
            self.caps(),
            header::cm_private_data().to_vec(),
        )?;
        let resources = cm.wait_established(timeout)?;

        let mut rx = RxState::new(resources.pd.clone(), self.max_cmds)?;
        let mut qp = resources.qp;
        rx.post_login(qp.as_mut())?;

        self.conn = Some(IserConn {
            pool: BufferPool::new(resources.pd.clone()),
            pd: resources.pd,
            qp,
            rx,
            hdr_mrs: Vec::new(),
        });
        self.cm = Some(cm);
        info!("iSER connected to {}", portal);
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(mut cm) = self.cm.take() {
            cm.shutdown();
            info!("iSER disconnected");
        }
        if let Some(conn) = self.conn.take() {
            for mr in &conn.hdr_mrs {
                conn.pd.dereg_mr(mr);
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.conn.is_some()
            && self
                .cm
                .as_ref()
                .is_some_and(|cm| *cm.state() == ConnState::Established)
    }

    fn new_pdu(&mut self, pdu: &mut Pdu) -> ScsiResult<()> {
        pdu.ext = Some(PduExtension::Iser(IserPduExt::default()));
        Ok(())
    }

    fn free_pdu(&mut self, mut pdu: Pdu) {
        if let Some(PduExtension::Iser(IserPduExt { tx: Some(tx) })) = pdu.ext.take() {
            if let Some(conn) = self.conn.as_mut() {
                conn.release_tx(tx);
            }
        }
    }

    fn queue_pdu(&mut self, mut ctx: TransportContext<'_>, pdu: Pdu) -> ScsiResult<()> {
        // Data-Out bytes are fetched by the target with RDMA READ
        if pdu.opcode() == opcode::SCSI_DATA_OUT {
            self.free_pdu(pdu);
            return Ok(());
        }

        if !ctx.queues.outqueue.is_empty()
            || (!pdu.is_immediate() && !ctx.session.command_window_open(pdu.cmd_sn))
        {
            debug!("Command window closed, parking itt 0x{:08x}", pdu.itt);
            ctx.queues.push_out(pdu);
            return Ok(());
        }

        self.send_pdu(&mut ctx, pdu)
    }

    fn service(
        &mut self,
        mut ctx: TransportContext<'_>,
        _events: Events,
    ) -> ScsiResult<Vec<IscsiPdu>> {
        if let Some(cm) = self.cm.as_mut() {
            if let ConnState::Error(msg) = cm.poll_state() {
                return Err(IscsiError::Transport(msg.clone()));
            }
        }
        self.handle_completions(&mut ctx)
    }

    fn resume_queued(&mut self, mut ctx: TransportContext<'_>) -> ScsiResult<()> {
        while let Some(front) = ctx.queues.outqueue.front() {
            if !front.is_immediate() && !ctx.session.command_window_open(front.cmd_sn) {
                break;
            }
            let Some(pdu) = ctx.queues.outqueue.pop_front() else {
                break;
            };
            self.send_pdu(&mut ctx, pdu)?;
        }
        Ok(())
    }

    #[cfg(unix)]
    fn get_fd(&self) -> Option<RawFd> {
        self.conn.as_ref().and_then(|c| c.qp.completion_fd())
    }

    fn which_events(&self, _ctx: &TransportContext<'_>) -> Events {
        Events::READABLE
    }

    fn wait_events(&mut self, _interest: Events, timeout: Duration) -> ScsiResult<Events> {
        if let Some(cm) = self.cm.as_mut() {
            if matches!(cm.poll_state(), ConnState::Error(_)) {
                return Ok(Events::ERROR);
            }
        }
        let ready = self.conn()?.qp.wait_cq(timeout)?;
        Ok(if ready { Events::READABLE } else { Events::NONE })
    }
}

impl Drop for IserTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::RESERVED_TAG;
    use crate::queue::PduQueues;
    use crate::scsi::IoVector;
    use crate::session::IscsiSession;
    use soft::SoftRdma;

    fn connect(portal: &str) -> (IserTransport, soft::SoftPeer, SoftRdma) {
        let rdma = SoftRdma::new();
        let listener = rdma.listen(portal).unwrap();
        let mut transport = IserTransport::new(rdma.clone(), 8);
        let handle = std::thread::spawn(move || {
            let peer = listener.accept(Duration::from_secs(2));
            (peer, listener)
        });
        transport.connect(portal, Duration::from_secs(2)).unwrap();
        let (peer, _listener) = handle.join().unwrap();
        (transport, peer.unwrap(), rdma)
    }

    fn split(message: &[u8]) -> (IserHeader, IscsiPdu) {
        let hdr = IserHeader::from_bytes(message).unwrap();
        let pdu = IscsiPdu::from_parts(&message[ISER_HEADER_LEN..HEADERS_LEN], &message[HEADERS_LEN..])
            .unwrap();
        (hdr, pdu)
    }

    fn framed(pdu: &IscsiPdu) -> Vec<u8> {
        let mut message = IserHeader::new().to_bytes().to_vec();
        message.extend_from_slice(&pdu.bhs());
        message.extend_from_slice(&pdu.data);
        message
    }

    #[test]
    fn test_control_pdu_two_sge_send() {
        let (mut transport, peer, _rdma) = connect("iser:ctl");
        assert_eq!(transport.posted_receives(), 1);

        let mut queues = PduQueues::new();
        let session = IscsiSession::new();
        let out = IscsiPdu::text_request(1, RESERVED_TAG, 0, true, b"SendTargets=All\0".to_vec());
        let mut pdu = Pdu::new(out, Some(opcode::TEXT_RESPONSE), 0);
        transport.new_pdu(&mut pdu).unwrap();
        transport
            .queue_pdu(TransportContext::new(&mut queues, &session), pdu)
            .unwrap();
        assert!(queues.waitpdu.contains_key(&1));

        let message = peer.recv(Duration::from_secs(1)).unwrap();
        let (hdr, pdu) = split(&message);
        assert_eq!(hdr.flags, header::iser_flags::ISER_VER);
        assert_eq!(pdu.opcode, opcode::TEXT_REQUEST);
        assert_eq!(pdu.data, b"SendTargets=All\0");

        let reply = IscsiPdu::text_response(1, RESERVED_TAG, 5, 1, 1, true, b"TargetName=x\0".to_vec());
        peer.send(&framed(&reply)).unwrap();
        let ready = transport.wait_events(Events::READABLE, Duration::from_secs(1)).unwrap();
        assert!(ready.contains(Events::READABLE));
        let incoming = transport
            .service(TransportContext::new(&mut queues, &session), ready)
            .unwrap();
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].data, b"TargetName=x\0");
        // Not logged in yet: the login buffer is re-posted
        assert_eq!(transport.posted_receives(), 1);
    }

    #[test]
    fn test_write_command_advertises_buffer() {
        let (mut transport, peer, _rdma) = connect("iser:write");
        let mut queues = PduQueues::new();
        let mut session = IscsiSession::new();
        session.max_cmd_sn = 10;

        let payload: Vec<u8> = (0..16384u32).map(|i| i as u8).collect();
        let task = ScsiTask::new(vec![0x2a, 0, 0, 0, 0, 0, 0, 0, 32, 0], XferDir::Write, 16384)
            .with_data_out(IoVector::flat(payload.clone()));

        let mut out = IscsiPdu::scsi_command(0, 3, flags::FINAL | flags::WRITE, 16384, 1, &task.cdb)
            .unwrap();
        out.set_data(payload[..4096].to_vec());
        let mut pdu = Pdu::new(out, Some(opcode::SCSI_RESPONSE), 0);
        pdu.cmd_sn = 1;
        pdu.task = Some(task);
        transport
            .queue_pdu(TransportContext::new(&mut queues, &session), pdu)
            .unwrap();

        let message = peer.recv(Duration::from_secs(1)).unwrap();
        let (hdr, cmd) = split(&message);
        assert!(hdr.has_write());
        assert!(!hdr.has_read());
        assert_eq!(cmd.data, &payload[..4096]);

        // The rest is pulled with RDMA READ past the immediate data
        let rest = peer.rdma_read(hdr.write_stag, hdr.write_va, 16384 - 4096).unwrap();
        assert_eq!(rest, &payload[4096..]);
    }

    #[test]
    fn test_read_data_copied_on_response() {
        let (mut transport, peer, _rdma) = connect("iser:read");
        let mut queues = PduQueues::new();
        let mut session = IscsiSession::new();
        session.max_cmd_sn = 10;

        let task = ScsiTask::read10(0, 2, 512);
        let out = IscsiPdu::scsi_command(0, 4, flags::FINAL | flags::READ, 1024, 1, &task.cdb).unwrap();
        let mut pdu = Pdu::new(out, Some(opcode::SCSI_RESPONSE), 0);
        pdu.cmd_sn = 1;
        pdu.task = Some(task);
        transport
            .queue_pdu(TransportContext::new(&mut queues, &session), pdu)
            .unwrap();

        let (hdr, _) = split(&peer.recv(Duration::from_secs(1)).unwrap());
        assert!(hdr.has_read());
        peer.rdma_write(hdr.read_stag, hdr.read_va, &[0xAB; 1024]).unwrap();

        let rsp = IscsiPdu::scsi_response(4, 1, 2, 10, 0, 0, 0, None);
        peer.send(&framed(&rsp)).unwrap();
        transport
            .service(TransportContext::new(&mut queues, &session), Events::READABLE)
            .unwrap();

        let waiting = queues.waitpdu.get(&4).unwrap();
        assert_eq!(waiting.task.as_ref().unwrap().data_in, vec![0xAB; 1024]);
    }

    #[test]
    fn test_closed_window_parks_then_revives() {
        let (mut transport, peer, _rdma) = connect("iser:window");
        let mut queues = PduQueues::new();
        let mut session = IscsiSession::new();
        session.max_cmd_sn = 0;

        let task = ScsiTask::test_unit_ready();
        let out = IscsiPdu::scsi_command(0, 5, flags::FINAL, 0, 1, &task.cdb).unwrap();
        let mut pdu = Pdu::new(out, Some(opcode::SCSI_RESPONSE), 0);
        pdu.cmd_sn = 1;
        pdu.task = Some(task);
        transport
            .queue_pdu(TransportContext::new(&mut queues, &session), pdu)
            .unwrap();
        assert_eq!(queues.outqueue.len(), 1);
        assert!(peer.recv(Duration::from_millis(50)).is_err());

        session.max_cmd_sn = 1;
        transport
            .resume_queued(TransportContext::new(&mut queues, &session))
            .unwrap();
        assert!(queues.outqueue.is_empty());
        assert!(queues.waitpdu.contains_key(&5));
        assert!(peer.recv(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_data_out_not_posted() {
        let (mut transport, peer, _rdma) = connect("iser:dataout");
        let mut queues = PduQueues::new();
        let session = IscsiSession::new();
        let out = IscsiPdu::scsi_data_out(0, 6, RESERVED_TAG, 0, 0, true, vec![1; 512]);
        let pdu = Pdu::new(out, None, 0);
        transport
            .queue_pdu(TransportContext::new(&mut queues, &session), pdu)
            .unwrap();
        assert!(queues.is_empty());
        assert!(peer.recv(Duration::from_millis(50)).is_err());
    }
}
