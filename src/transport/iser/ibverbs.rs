//! RDMA provider over the host verbs stack
//!
//! Connection management runs on librdmacm through `sideway::rdmacm`; memory
//! registration, queue pairs and completions go through `sideway::ibverbs`.
//! Every queue pair gets a completion channel of its own. The channel's
//! descriptor is what [`QueuePair::completion_fd`] hands to the caller's
//! poll loop.
//!
//! The queue pair is not bound to the CM identifier, so the connect
//! response arrives as [`CmEvent::ConnectResponse`] and the queue pair is
//! moved to RTS from [`CmId::establish`].

use super::cm::{CmEvent, CmId, RdmaProvider};
use super::verbs::{
    access, MemoryRegion, ProtectionDomain, QpCaps, QueuePair, RecvWr, SendWr, WcOpcode, WcStatus,
    WorkCompletion,
};
use crate::error::{IscsiError, ScsiResult};
use crate::transport::{poll_fd, Events};
use crossbeam_channel::{Receiver, Sender};
use log::{debug, warn};
use rdma_mummy_sys::{ibv_ack_cq_events, ibv_cq, ibv_get_cq_event, ibv_req_notify_cq, ibv_sge};
use sideway::ibverbs::completion::{
    CompletionChannel, CompletionQueue as _, GenericCompletionQueue, PollCompletionQueueError,
    WorkCompletionOperationType, WorkCompletionStatus,
};
use sideway::ibverbs::device_context::DeviceContext;
use sideway::ibverbs::protection_domain::ProtectionDomain as IbvProtectionDomain;
use sideway::ibverbs::queue_pair::{
    GenericQueuePair, PostSendGuard as _, QueuePair as _, QueuePairState, QueuePairType,
    SetScatterGatherEntry as _, WorkRequestFlags,
};
use sideway::ibverbs::AccessFlags;
use sideway::rdmacm::communication_manager::{
    ConnectionParameter, EventChannel, EventType, Identifier, PortSpace,
};
use std::collections::VecDeque;
use std::ffi::c_void;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

const RESPONDER_RESOURCES: u8 = 4;
const RETRY_COUNT: u8 = 7;
const RNR_RETRY_COUNT: u8 = 6;
/// Completions reaped per CQ poll
const POLL_BATCH: usize = 16;
/// ibv_wc_status value of IBV_WC_WR_FLUSH_ERR
const WC_WR_FLUSH_ERR: u32 = 5;

fn verbs_error(what: &str, err: impl std::fmt::Display) -> IscsiError {
    IscsiError::Transport(format!("{}: {}", what, err))
}

fn poisoned<T>(_: T) -> IscsiError {
    IscsiError::Transport("Queue pair lock poisoned".to_string())
}

/// librdmacm event, as far as the connection manager cares
pub(crate) fn map_cm_event(event: EventType) -> Option<CmEvent> {
    let mapped = match event {
        EventType::AddressResolved => CmEvent::AddrResolved,
        EventType::AddressError => CmEvent::AddrError,
        EventType::RouteResolved => CmEvent::RouteResolved,
        EventType::RouteError => CmEvent::RouteError,
        EventType::ConnectResponse => CmEvent::ConnectResponse,
        EventType::ConnectError => CmEvent::ConnectError,
        EventType::Unreachable => CmEvent::Unreachable,
        EventType::Rejected => CmEvent::Rejected,
        EventType::Established => CmEvent::Established,
        EventType::Disconnected => CmEvent::Disconnected,
        EventType::DeviceRemoval => CmEvent::Disconnected,
        EventType::AddressChange => CmEvent::AddrChange,
        EventType::TimewaitExit => CmEvent::TimewaitExit,
        _ => return None,
    };
    Some(mapped)
}

/// Whether no further event can follow `event` on this identifier
fn is_terminal(event: CmEvent) -> bool {
    matches!(
        event,
        CmEvent::AddrError
            | CmEvent::RouteError
            | CmEvent::ConnectError
            | CmEvent::Unreachable
            | CmEvent::Rejected
            | CmEvent::Disconnected
            | CmEvent::TimewaitExit
    )
}

pub(crate) fn completion_from_raw(
    wr_id: u64,
    status: u32,
    opcode: u32,
    byte_len: u32,
    vendor_err: u32,
) -> WorkCompletion {
    let status = if status == WorkCompletionStatus::Success as u32 {
        WcStatus::Success
    } else if status == WC_WR_FLUSH_ERR {
        WcStatus::WrFlushErr
    } else {
        WcStatus::Error(status)
    };
    // Only sends and receives are posted; the target drives RDMA READ/WRITE
    let opcode = if opcode == WorkCompletionOperationType::Receive as u32 {
        WcOpcode::Recv
    } else {
        WcOpcode::Send
    };
    WorkCompletion {
        wr_id,
        status,
        opcode,
        byte_len,
        vendor_err,
    }
}

pub(crate) fn access_flags(access: u32) -> AccessFlags {
    let remote = access & (access::REMOTE_READ | access::REMOTE_WRITE);
    match remote {
        0 => AccessFlags::LocalWrite,
        r if r == access::REMOTE_WRITE => AccessFlags::LocalWrite | AccessFlags::RemoteWrite,
        r if r == access::REMOTE_READ => AccessFlags::LocalWrite | AccessFlags::RemoteRead,
        _ => AccessFlags::LocalWrite | AccessFlags::RemoteWrite | AccessFlags::RemoteRead,
    }
}

fn resolve_portal(portal: &str) -> ScsiResult<SocketAddr> {
    portal
        .to_socket_addrs()
        .map_err(|e| IscsiError::Transport(format!("Cannot resolve portal {}: {}", portal, e)))?
        .next()
        .ok_or_else(|| IscsiError::Transport(format!("Portal {} has no address", portal)))
}

/// The host RDMA stack
#[derive(Debug, Clone, Copy, Default)]
pub struct IbRdma;

impl IbRdma {
    pub fn new() -> Self {
        IbRdma
    }
}

impl RdmaProvider for IbRdma {
    fn create_id(&self) -> ScsiResult<(Box<dyn CmId>, Receiver<CmEvent>)> {
        let channel =
            EventChannel::new().map_err(|e| verbs_error("Creating CM event channel failed", e))?;
        let id = channel
            .create_id(PortSpace::Tcp)
            .map_err(|e| verbs_error("Creating CM identifier failed", e))?;

        let (tx, rx) = crossbeam_channel::unbounded();
        let pump = EventPump {
            channel: channel.clone(),
            events: tx,
        };
        thread::Builder::new()
            .name("iser-cm-events".to_string())
            .spawn(move || pump.run())?;

        let id = IbCmId {
            id,
            _channel: channel,
            ctx: None,
            pd: None,
            qp: None,
        };
        Ok((Box::new(id), rx))
    }
}

struct EventPump {
    channel: Arc<EventChannel>,
    events: Sender<CmEvent>,
}

// SAFETY: librdmacm event channels may be read from any thread
unsafe impl Send for EventPump {}

impl EventPump {
    fn run(self) {
        loop {
            let event = match self.channel.get_cm_event() {
                Ok(event) => event,
                Err(e) => {
                    warn!("Reading CM event failed: {}", e);
                    return;
                }
            };
            let kind = event.event_type();
            let _ = event.ack();

            let Some(mapped) = map_cm_event(kind) else {
                debug!("Ignoring CM event {:?}", kind);
                continue;
            };
            if self.events.send(mapped).is_err() || is_terminal(mapped) {
                return;
            }
        }
    }
}

struct IbCmId {
    id: Arc<Identifier>,
    _channel: Arc<EventChannel>,
    ctx: Option<Arc<DeviceContext>>,
    pd: Option<Arc<IbvProtectionDomain>>,
    qp: Option<Arc<Mutex<GenericQueuePair>>>,
}

// SAFETY: the identifier and its verbs objects are used by one thread at a
// time; the queue pair is shared only behind a mutex
unsafe impl Send for IbCmId {}

impl IbCmId {
    fn device_context(&mut self) -> ScsiResult<Arc<DeviceContext>> {
        if let Some(ctx) = &self.ctx {
            return Ok(ctx.clone());
        }
        let ctx = self
            .id
            .get_device_context()
            .map(|ctx| ctx.clone())
            .ok_or_else(|| IscsiError::Transport("Route has no RDMA device".to_string()))?;
        self.ctx = Some(ctx.clone());
        Ok(ctx)
    }

    fn modify_qp(&self, state: QueuePairState) -> ScsiResult<()> {
        let qp = self
            .qp
            .as_ref()
            .ok_or_else(|| IscsiError::Transport("No queue pair to modify".to_string()))?;
        let attr = self
            .id
            .get_qp_attr(state)
            .map_err(|e| verbs_error("Querying queue pair attributes failed", e))?;
        qp.lock()
            .map_err(poisoned)?
            .modify(&attr)
            .map_err(|e| verbs_error("Modifying queue pair failed", e))
    }
}

impl CmId for IbCmId {
    fn resolve_addr(&mut self, portal: &str, timeout_ms: u32) -> ScsiResult<()> {
        let addr = resolve_portal(portal)?;
        debug!("Resolving RDMA address {}", addr);
        self.id
            .resolve_addr(None, addr, Duration::from_millis(timeout_ms as u64))
            .map_err(|e| verbs_error("RDMA address resolution failed", e))
    }

    fn resolve_route(&mut self, timeout_ms: u32) -> ScsiResult<()> {
        self.id
            .resolve_route(Duration::from_millis(timeout_ms as u64))
            .map_err(|e| verbs_error("RDMA route resolution failed", e))
    }

    fn alloc_pd(&mut self) -> ScsiResult<Arc<dyn ProtectionDomain>> {
        let ctx = self.device_context()?;
        let pd = ctx
            .alloc_pd()
            .map_err(|e| verbs_error("Allocating protection domain failed", e))?;
        self.pd = Some(pd.clone());
        Ok(Arc::new(IbPd { pd }))
    }

    fn create_qp(
        &mut self,
        _pd: &Arc<dyn ProtectionDomain>,
        caps: QpCaps,
    ) -> ScsiResult<Box<dyn QueuePair>> {
        let ctx = self.device_context()?;
        let pd = self
            .pd
            .clone()
            .ok_or_else(|| IscsiError::Transport("Queue pair before protection domain".to_string()))?;

        let channel = CompletionChannel::new(&ctx)
            .map_err(|e| verbs_error("Creating completion channel failed", e))?;
        channel.set_nonblocking(true)?;

        let mut cq_builder = ctx.create_cq_builder();
        cq_builder
            .setup_cqe(caps.cq_len)
            .setup_comp_channel(&channel, 0);
        let cq: GenericCompletionQueue = cq_builder
            .build()
            .map_err(|e| verbs_error("Creating completion queue failed", e))?
            .into();

        let mut qp_builder = pd.create_qp_builder();
        qp_builder
            .setup_qp_type(QueuePairType::ReliableConnection)
            .setup_send_cq(cq.clone())
            .setup_recv_cq(cq.clone())
            .setup_max_send_wr(caps.max_send_wr)
            .setup_max_recv_wr(caps.max_recv_wr)
            .setup_max_send_sge(caps.max_send_sge)
            .setup_max_recv_sge(caps.max_recv_sge);
        let qp: GenericQueuePair = qp_builder
            .build()
            .map_err(|e| verbs_error("Creating queue pair failed", e))?
            .into();
        let qp = Arc::new(Mutex::new(qp));
        self.qp = Some(qp.clone());
        self.modify_qp(QueuePairState::Init)?;

        let mut ib_qp = IbQp {
            qp,
            cq,
            channel,
            backlog: VecDeque::new(),
        };
        ib_qp.arm()?;
        Ok(Box::new(ib_qp))
    }

    fn connect(&mut self, private_data: &[u8]) -> ScsiResult<()> {
        let qp_number = match &self.qp {
            Some(qp) => qp.lock().map_err(poisoned)?.qp_number(),
            None => return Err(IscsiError::Transport("Connect before queue pair".to_string())),
        };
        let mut param = ConnectionParameter::new();
        param
            .setup_qp_number(qp_number)
            .setup_private_data(private_data)
            .setup_responder_resources(RESPONDER_RESOURCES)
            .setup_retry_count(RETRY_COUNT)
            .setup_rnr_retry_count(RNR_RETRY_COUNT);
        self.id
            .connect(param)
            .map_err(|e| verbs_error("rdma_connect failed", e))
    }

    fn establish(&mut self) -> ScsiResult<()> {
        self.modify_qp(QueuePairState::ReadyToReceive)?;
        self.modify_qp(QueuePairState::ReadyToSend)?;
        self.id
            .establish()
            .map_err(|e| verbs_error("rdma_establish failed", e))
    }

    fn disconnect(&mut self) {
        if let Err(e) = self.id.disconnect() {
            debug!("rdma_disconnect: {}", e);
        }
    }
}

struct IbPd {
    pd: Arc<IbvProtectionDomain>,
}

// SAFETY: verbs protection domains are thread safe
unsafe impl Send for IbPd {}
unsafe impl Sync for IbPd {}

/// Keeps a device registration alive for as long as its region
struct IbRegistration(#[allow(dead_code)] Arc<sideway::ibverbs::memory_region::MemoryRegion>);

// SAFETY: the registration is never touched after creation
unsafe impl Send for IbRegistration {}
unsafe impl Sync for IbRegistration {}

impl ProtectionDomain for IbPd {
    fn reg_mr(&self, len: usize, access: u32) -> ScsiResult<MemoryRegion> {
        let buf = vec![0u8; len];
        let mr = unsafe { self.pd.reg_mr(buf.as_ptr() as usize, buf.len(), access_flags(access)) }
            .map_err(|e| verbs_error("Registering memory failed", e))?;
        let (lkey, rkey) = (mr.lkey(), mr.rkey());
        Ok(MemoryRegion::registered(
            buf,
            lkey,
            rkey,
            access,
            Box::new(IbRegistration(mr)),
        ))
    }

    // The registration goes away with the last handle to the region
    fn dereg_mr(&self, _mr: &MemoryRegion) {}
}

struct IbQp {
    qp: Arc<Mutex<GenericQueuePair>>,
    cq: GenericCompletionQueue,
    channel: Arc<CompletionChannel>,
    backlog: VecDeque<WorkCompletion>,
}

// SAFETY: the completion queue and channel are only used by the thread that
// owns this queue pair
unsafe impl Send for IbQp {}

impl IbQp {
    fn lock(&self) -> ScsiResult<MutexGuard<'_, GenericQueuePair>> {
        self.qp.lock().map_err(poisoned)
    }

    fn cq_ptr(&self) -> *mut ibv_cq {
        unsafe { self.cq.cq().as_ptr() }
    }

    /// Consume channel notifications and request the next one
    fn arm(&mut self) -> ScsiResult<()> {
        let channel = unsafe { self.channel.comp_channel().as_ptr() };
        let mut acked = 0u32;
        loop {
            let mut cq: *mut ibv_cq = ptr::null_mut();
            let mut cq_ctx: *mut c_void = ptr::null_mut();
            // Nonblocking channel: fails with EAGAIN once drained
            if unsafe { ibv_get_cq_event(channel, &mut cq, &mut cq_ctx) } != 0 {
                break;
            }
            acked += 1;
        }
        if acked > 0 {
            unsafe { ibv_ack_cq_events(self.cq_ptr(), acked) };
        }
        let rc = unsafe { ibv_req_notify_cq(self.cq_ptr(), 0) };
        if rc != 0 {
            return Err(verbs_error(
                "ibv_req_notify_cq failed",
                std::io::Error::from_raw_os_error(rc),
            ));
        }
        Ok(())
    }

    fn reap(&mut self) -> ScsiResult<()> {
        match self.cq.start_poll() {
            Ok(mut poller) => {
                for wc in &mut poller {
                    self.backlog.push_back(completion_from_raw(
                        wc.wr_id(),
                        wc.status(),
                        wc.opcode(),
                        wc.byte_len(),
                        wc.vendor_err(),
                    ));
                    if self.backlog.len() >= POLL_BATCH {
                        break;
                    }
                }
                Ok(())
            }
            Err(PollCompletionQueueError::CompletionQueueEmpty) => Ok(()),
            Err(e) => Err(verbs_error("Polling completion queue failed", e)),
        }
    }

    /// Poll; if empty, re-arm and poll once more to close the race with a
    /// completion that landed before the notification request
    fn refill(&mut self) -> ScsiResult<()> {
        if self.backlog.is_empty() {
            self.reap()?;
        }
        if self.backlog.is_empty() {
            self.arm()?;
            self.reap()?;
        }
        Ok(())
    }
}

impl QueuePair for IbQp {
    fn post_send(&mut self, wr: SendWr) -> ScsiResult<()> {
        let sges: Vec<ibv_sge> = wr
            .sg_list
            .iter()
            .map(|sge| ibv_sge {
                addr: sge.addr,
                length: sge.length,
                lkey: sge.lkey,
            })
            .collect();
        // Every send is signaled so its descriptor can be reclaimed
        let mut qp = self.lock()?;
        let mut guard = qp.start_post_send();
        let handle = guard
            .construct_wr(wr.wr_id, WorkRequestFlags::Signaled)
            .setup_send();
        unsafe { handle.setup_sge_list(&sges) };
        guard.post().map_err(|e| verbs_error("ibv_post_send failed", e))
    }

    fn post_recv(&mut self, wrs: &[RecvWr]) -> ScsiResult<()> {
        let mut qp = self.lock()?;
        let mut guard = qp.start_post_recv();
        for wr in wrs {
            let handle = guard.construct_wr(wr.wr_id);
            unsafe { handle.setup_sge(wr.sge.lkey, wr.sge.addr, wr.sge.length) };
        }
        guard.post().map_err(|e| verbs_error("ibv_post_recv failed", e))
    }

    fn poll_cq(&mut self, max: usize) -> ScsiResult<Vec<WorkCompletion>> {
        self.refill()?;
        let n = max.min(self.backlog.len());
        Ok(self.backlog.drain(..n).collect())
    }

    fn wait_cq(&mut self, timeout: Duration) -> ScsiResult<bool> {
        self.refill()?;
        if !self.backlog.is_empty() {
            return Ok(true);
        }
        let ready = poll_fd(self.channel.as_raw_fd(), Events::READABLE, timeout)?;
        if ready.contains(Events::READABLE) {
            self.refill()?;
        }
        Ok(!self.backlog.is_empty())
    }

    fn completion_fd(&self) -> Option<RawFd> {
        Some(self.channel.as_raw_fd())
    }
}
