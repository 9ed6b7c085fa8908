//! In-process software RDMA provider
//!
//! Emulates a reliable-connected fabric inside one process: registered
//! memory lives in a shared table keyed by lkey/rkey, sends are gathered
//! into messages and delivered into the peer's posted receive buffers.
//! [`SoftListener`] and [`SoftPeer`] give the far end of a connection to
//! whatever plays the target. Tests run the iSER driver over this fabric;
//! real connections go through [`super::ibverbs`].

use super::cm::{CmEvent, CmId, RdmaProvider};
use super::verbs::{
    access, MemoryRegion, ProtectionDomain, QpCaps, QueuePair, RecvWr, SendWr, Sge, WcOpcode,
    WcStatus, WorkCompletion,
};
use crate::error::{IscsiError, ScsiResult};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::debug;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

const VA_BASE: u64 = 0x7f00_0000_0000;
const PAGE: u64 = 4096;

fn poisoned<T>(_: T) -> IscsiError {
    IscsiError::Transport("Soft RDMA lock poisoned".to_string())
}

struct Fabric {
    next_key: AtomicU32,
    next_va: AtomicU64,
    regions: Mutex<HashMap<u32, MemoryRegion>>,
    listeners: Mutex<HashMap<String, Sender<PendingConnect>>>,
}

impl Fabric {
    fn reg(&self, len: usize, access: u32) -> ScsiResult<MemoryRegion> {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let span = (len as u64).div_ceil(PAGE) * PAGE + PAGE;
        let addr = self.next_va.fetch_add(span, Ordering::Relaxed);
        let mr = MemoryRegion::new(addr, key, key, access, len);
        self.regions.lock().map_err(poisoned)?.insert(key, mr.clone());
        Ok(mr)
    }

    fn dereg(&self, mr: &MemoryRegion) {
        if let Ok(mut regions) = self.regions.lock() {
            regions.remove(&mr.lkey());
        }
    }

    /// Resolve `[addr, addr + len)` under `key`, checking `needed` access bits
    fn lookup(&self, key: u32, addr: u64, len: usize, needed: u32) -> ScsiResult<(MemoryRegion, usize)> {
        let regions = self.regions.lock().map_err(poisoned)?;
        let mr = regions
            .get(&key)
            .ok_or_else(|| IscsiError::Transport(format!("Unknown memory key 0x{:x}", key)))?;
        if !mr.contains(addr, len) {
            return Err(IscsiError::Transport(format!(
                "Access of {} bytes at 0x{:x} outside region 0x{:x}",
                len, addr, key
            )));
        }
        if mr.access() & needed != needed {
            return Err(IscsiError::Transport(format!(
                "Region 0x{:x} lacks access 0x{:x}",
                key, needed
            )));
        }
        Ok((mr.clone(), (addr - mr.addr()) as usize))
    }

    fn gather(&self, sges: &[Sge]) -> ScsiResult<Vec<u8>> {
        let mut message = Vec::new();
        for sge in sges {
            let (mr, offset) = self.lookup(sge.lkey, sge.addr, sge.length as usize, 0)?;
            message.extend_from_slice(&mr.read(offset, sge.length as usize)?);
        }
        Ok(message)
    }
}

/// Software RDMA device
#[derive(Clone)]
pub struct SoftRdma {
    fabric: Arc<Fabric>,
}

impl Default for SoftRdma {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftRdma {
    /// A fabric of its own, isolated from every other instance
    pub fn new() -> Self {
        SoftRdma {
            fabric: Arc::new(Fabric {
                next_key: AtomicU32::new(0x100),
                next_va: AtomicU64::new(VA_BASE),
                regions: Mutex::new(HashMap::new()),
                listeners: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn alloc_pd(&self) -> Arc<dyn ProtectionDomain> {
        Arc::new(SoftPd {
            fabric: self.fabric.clone(),
        })
    }

    /// Accept connections addressed to `portal`
    pub fn listen(&self, portal: &str) -> ScsiResult<SoftListener> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut listeners = self.fabric.listeners.lock().map_err(poisoned)?;
        if listeners.contains_key(portal) {
            return Err(IscsiError::Transport(format!("{} already has a listener", portal)));
        }
        listeners.insert(portal.to_string(), tx);
        Ok(SoftListener {
            fabric: self.fabric.clone(),
            portal: portal.to_string(),
            pending: rx,
        })
    }

    /// Number of live memory registrations
    pub fn region_count(&self) -> usize {
        self.fabric.regions.lock().map(|r| r.len()).unwrap_or(0)
    }
}

impl RdmaProvider for SoftRdma {
    fn create_id(&self) -> ScsiResult<(Box<dyn CmId>, Receiver<CmEvent>)> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let id = SoftCmId {
            fabric: self.fabric.clone(),
            events: tx,
            portal: None,
            link: None,
        };
        Ok((Box::new(id), rx))
    }
}

struct SoftPd {
    fabric: Arc<Fabric>,
}

impl ProtectionDomain for SoftPd {
    fn reg_mr(&self, len: usize, access: u32) -> ScsiResult<MemoryRegion> {
        self.fabric.reg(len, access)
    }

    fn dereg_mr(&self, mr: &MemoryRegion) {
        self.fabric.dereg(mr);
    }
}

#[derive(Default)]
struct LinkState {
    connected: bool,
    /// Receive requests posted by the initiator
    recvs: VecDeque<RecvWr>,
    /// Initiator completion queue
    cq: VecDeque<WorkCompletion>,
    /// Messages sent by the initiator, oldest first
    to_peer: VecDeque<Vec<u8>>,
}

impl LinkState {
    fn flush_recvs(&mut self) {
        while let Some(wr) = self.recvs.pop_front() {
            self.cq.push_back(WorkCompletion {
                wr_id: wr.wr_id,
                status: WcStatus::WrFlushErr,
                opcode: WcOpcode::Recv,
                byte_len: 0,
                vendor_err: 0,
            });
        }
    }
}

#[derive(Default)]
struct Link {
    state: Mutex<LinkState>,
    cond: Condvar,
}

impl Link {
    fn lock(&self) -> ScsiResult<MutexGuard<'_, LinkState>> {
        self.state.lock().map_err(poisoned)
    }

    fn notify(&self) {
        self.cond.notify_all();
    }

    /// Wait until `ready` holds or `timeout` passes
    fn wait_for<F>(&self, timeout: Duration, ready: F) -> ScsiResult<MutexGuard<'_, LinkState>>
    where
        F: Fn(&LinkState) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock()?;
        while !ready(&state) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let (guard, _) = self.cond.wait_timeout(state, remaining).map_err(poisoned)?;
            state = guard;
        }
        Ok(state)
    }
}

struct PendingConnect {
    link: Arc<Link>,
    events: Sender<CmEvent>,
    private_data: Vec<u8>,
}

struct SoftCmId {
    fabric: Arc<Fabric>,
    events: Sender<CmEvent>,
    portal: Option<String>,
    link: Option<Arc<Link>>,
}

impl SoftCmId {
    fn emit(&self, event: CmEvent) {
        let _ = self.events.send(event);
    }
}

impl CmId for SoftCmId {
    fn resolve_addr(&mut self, portal: &str, _timeout_ms: u32) -> ScsiResult<()> {
        let known = self
            .fabric
            .listeners
            .lock()
            .map_err(poisoned)?
            .contains_key(portal);
        self.portal = Some(portal.to_string());
        self.emit(if known {
            CmEvent::AddrResolved
        } else {
            CmEvent::AddrError
        });
        Ok(())
    }

    fn resolve_route(&mut self, _timeout_ms: u32) -> ScsiResult<()> {
        self.emit(CmEvent::RouteResolved);
        Ok(())
    }

    fn alloc_pd(&mut self) -> ScsiResult<Arc<dyn ProtectionDomain>> {
        Ok(Arc::new(SoftPd {
            fabric: self.fabric.clone(),
        }))
    }

    fn create_qp(
        &mut self,
        _pd: &Arc<dyn ProtectionDomain>,
        caps: QpCaps,
    ) -> ScsiResult<Box<dyn QueuePair>> {
        let link = Arc::new(Link::default());
        self.link = Some(link.clone());
        debug!("Soft QP created: {:?}", caps);
        Ok(Box::new(SoftQp {
            fabric: self.fabric.clone(),
            link,
        }))
    }

    fn connect(&mut self, private_data: &[u8]) -> ScsiResult<()> {
        let link = self
            .link
            .clone()
            .ok_or_else(|| IscsiError::Transport("Connect before queue pair creation".to_string()))?;
        let portal = self.portal.clone().unwrap_or_default();
        let listener = self
            .fabric
            .listeners
            .lock()
            .map_err(poisoned)?
            .get(&portal)
            .cloned();

        let delivered = listener.is_some_and(|tx| {
            tx.send(PendingConnect {
                link,
                events: self.events.clone(),
                private_data: private_data.to_vec(),
            })
            .is_ok()
        });
        if !delivered {
            self.emit(CmEvent::Rejected);
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            if let Ok(mut state) = link.lock() {
                state.connected = false;
                state.flush_recvs();
            }
            link.notify();
        }
    }
}

struct SoftQp {
    fabric: Arc<Fabric>,
    link: Arc<Link>,
}

impl QueuePair for SoftQp {
    fn post_send(&mut self, wr: SendWr) -> ScsiResult<()> {
        let message = self.fabric.gather(&wr.sg_list)?;
        let mut state = self.link.lock()?;
        let status = if state.connected {
            state.to_peer.push_back(message);
            WcStatus::Success
        } else {
            WcStatus::WrFlushErr
        };
        if wr.signaled || status != WcStatus::Success {
            state.cq.push_back(WorkCompletion {
                wr_id: wr.wr_id,
                status,
                opcode: WcOpcode::Send,
                byte_len: 0,
                vendor_err: 0,
            });
        }
        drop(state);
        self.link.notify();
        Ok(())
    }

    fn post_recv(&mut self, wrs: &[RecvWr]) -> ScsiResult<()> {
        let mut state = self.link.lock()?;
        for wr in wrs {
            self.fabric
                .lookup(wr.sge.lkey, wr.sge.addr, wr.sge.length as usize, access::LOCAL_WRITE)?;
            state.recvs.push_back(*wr);
        }
        if !state.connected {
            state.flush_recvs();
        }
        Ok(())
    }

    fn poll_cq(&mut self, max: usize) -> ScsiResult<Vec<WorkCompletion>> {
        let mut state = self.link.lock()?;
        let n = max.min(state.cq.len());
        Ok(state.cq.drain(..n).collect())
    }

    fn wait_cq(&mut self, timeout: Duration) -> ScsiResult<bool> {
        let state = self.link.wait_for(timeout, |s| !s.cq.is_empty())?;
        Ok(!state.cq.is_empty())
    }
}

/// Accepts connections for one portal
pub struct SoftListener {
    fabric: Arc<Fabric>,
    portal: String,
    pending: Receiver<PendingConnect>,
}

impl SoftListener {
    pub fn accept(&self, timeout: Duration) -> ScsiResult<SoftPeer> {
        let pending = match self.pending.recv_timeout(timeout) {
            Ok(pending) => pending,
            Err(RecvTimeoutError::Timeout) => {
                return Err(IscsiError::Timeout(format!("No connection on {}", self.portal)))
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(IscsiError::Transport("Listener closed".to_string()))
            }
        };

        pending.link.lock()?.connected = true;
        let _ = pending.events.send(CmEvent::Established);
        Ok(SoftPeer {
            fabric: self.fabric.clone(),
            link: pending.link,
            events: pending.events,
            private_data: pending.private_data,
        })
    }
}

impl Drop for SoftListener {
    fn drop(&mut self) {
        if let Ok(mut listeners) = self.fabric.listeners.lock() {
            listeners.remove(&self.portal);
        }
    }
}

/// Far end of an accepted connection
pub struct SoftPeer {
    fabric: Arc<Fabric>,
    link: Arc<Link>,
    events: Sender<CmEvent>,
    private_data: Vec<u8>,
}

impl SoftPeer {
    pub fn private_data(&self) -> &[u8] {
        &self.private_data
    }

    /// Receive requests the initiator has outstanding
    pub fn posted_recvs(&self) -> usize {
        self.link.lock().map(|s| s.recvs.len()).unwrap_or(0)
    }

    /// Next message sent by the initiator
    pub fn recv(&self, timeout: Duration) -> ScsiResult<Vec<u8>> {
        let mut state = self
            .link
            .wait_for(timeout, |s| !s.to_peer.is_empty() || !s.connected)?;
        match state.to_peer.pop_front() {
            Some(message) => Ok(message),
            None if !state.connected => Err(IscsiError::Transport("Connection closed".to_string())),
            None => Err(IscsiError::Timeout("No message from initiator".to_string())),
        }
    }

    /// Deliver `message` into the initiator's next posted receive buffer
    pub fn send(&self, message: &[u8]) -> ScsiResult<()> {
        let mut state = self.link.lock()?;
        if !state.connected {
            return Err(IscsiError::Transport("Connection closed".to_string()));
        }
        let wr = state
            .recvs
            .pop_front()
            .ok_or_else(|| IscsiError::Transport("Receiver not ready".to_string()))?;
        if message.len() > wr.sge.length as usize {
            return Err(IscsiError::Transport(format!(
                "Message of {} bytes exceeds {}-byte receive buffer",
                message.len(),
                wr.sge.length
            )));
        }
        let (mr, offset) =
            self.fabric
                .lookup(wr.sge.lkey, wr.sge.addr, message.len(), access::LOCAL_WRITE)?;
        mr.write(offset, message)?;
        state.cq.push_back(WorkCompletion {
            wr_id: wr.wr_id,
            status: WcStatus::Success,
            opcode: WcOpcode::Recv,
            byte_len: message.len() as u32,
            vendor_err: 0,
        });
        drop(state);
        self.link.notify();
        Ok(())
    }

    /// RDMA WRITE into initiator memory
    pub fn rdma_write(&self, rkey: u32, va: u64, data: &[u8]) -> ScsiResult<()> {
        let (mr, offset) = self
            .fabric
            .lookup(rkey, va, data.len(), access::REMOTE_WRITE)?;
        mr.write(offset, data)
    }

    /// RDMA READ from initiator memory
    pub fn rdma_read(&self, rkey: u32, va: u64, len: usize) -> ScsiResult<Vec<u8>> {
        let (mr, offset) = self.fabric.lookup(rkey, va, len, access::REMOTE_READ)?;
        mr.read(offset, len)
    }

    /// Drop the connection; outstanding receives complete with a flush error
    pub fn disconnect(&self) {
        if let Ok(mut state) = self.link.lock() {
            state.connected = false;
            state.flush_recvs();
        }
        self.link.notify();
        let _ = self.events.send(CmEvent::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected_pair(rdma: &SoftRdma, portal: &str) -> (Box<dyn QueuePair>, SoftPeer, Arc<dyn ProtectionDomain>) {
        let listener = rdma.listen(portal).unwrap();
        let (mut id, events) = rdma.create_id().unwrap();
        id.resolve_addr(portal, 100).unwrap();
        assert_eq!(events.recv().unwrap(), CmEvent::AddrResolved);
        id.resolve_route(100).unwrap();
        assert_eq!(events.recv().unwrap(), CmEvent::RouteResolved);
        let pd = id.alloc_pd().unwrap();
        let caps = QpCaps {
            max_send_wr: 4,
            max_recv_wr: 4,
            max_send_sge: 2,
            max_recv_sge: 1,
            cq_len: 8,
        };
        let qp = id.create_qp(&pd, caps).unwrap();
        id.connect(&[]).unwrap();
        let peer = listener.accept(Duration::from_secs(1)).unwrap();
        assert_eq!(events.recv().unwrap(), CmEvent::Established);
        (qp, peer, pd)
    }

    #[test]
    fn test_send_gathers_sges() {
        let rdma = SoftRdma::new();
        let (mut qp, peer, pd) = connected_pair(&rdma, "soft:1");

        let a = pd.reg_mr(8, access::LOCAL_WRITE).unwrap();
        let b = pd.reg_mr(8, access::LOCAL_WRITE).unwrap();
        a.write(0, b"head").unwrap();
        b.write(0, b"tail").unwrap();

        qp.post_send(SendWr {
            wr_id: 9,
            sg_list: vec![Sge::from_region(&a, 0, 4), Sge::from_region(&b, 0, 4)],
            signaled: true,
        })
        .unwrap();

        assert_eq!(peer.recv(Duration::from_secs(1)).unwrap(), b"headtail");
        let wcs = qp.poll_cq(16).unwrap();
        assert_eq!(wcs.len(), 1);
        assert_eq!(wcs[0].opcode, WcOpcode::Send);
        assert_eq!(wcs[0].wr_id, 9);
    }

    #[test]
    fn test_peer_send_needs_posted_receive() {
        let rdma = SoftRdma::new();
        let (mut qp, peer, pd) = connected_pair(&rdma, "soft:2");

        assert!(peer.send(b"early").is_err());

        let rx = pd.reg_mr(16, access::LOCAL_WRITE).unwrap();
        qp.post_recv(&[RecvWr {
            wr_id: 3,
            sge: Sge::from_region(&rx, 0, 16),
        }])
        .unwrap();
        peer.send(b"hello").unwrap();

        assert!(qp.wait_cq(Duration::from_secs(1)).unwrap());
        let wc = qp.poll_cq(16).unwrap()[0];
        assert_eq!(wc.status, WcStatus::Success);
        assert_eq!(wc.byte_len, 5);
        assert_eq!(rx.read(0, 5).unwrap(), b"hello");
    }

    #[test]
    fn test_rdma_access_checked() {
        let rdma = SoftRdma::new();
        let (_qp, peer, pd) = connected_pair(&rdma, "soft:3");

        let data = pd
            .reg_mr(64, access::LOCAL_WRITE | access::REMOTE_WRITE | access::REMOTE_READ)
            .unwrap();
        peer.rdma_write(data.rkey(), data.addr() + 8, b"remote").unwrap();
        assert_eq!(data.read(8, 6).unwrap(), b"remote");
        assert_eq!(peer.rdma_read(data.rkey(), data.addr() + 8, 6).unwrap(), b"remote");
        assert!(peer.rdma_read(data.rkey(), data.addr() + 60, 8).is_err());

        let local = pd.reg_mr(16, access::LOCAL_WRITE).unwrap();
        assert!(peer.rdma_write(local.rkey(), local.addr(), b"x").is_err());
    }

    #[test]
    fn test_disconnect_flushes_receives() {
        let rdma = SoftRdma::new();
        let (mut qp, peer, pd) = connected_pair(&rdma, "soft:4");
        let rx = pd.reg_mr(16, access::LOCAL_WRITE).unwrap();
        qp.post_recv(&[RecvWr {
            wr_id: 1,
            sge: Sge::from_region(&rx, 0, 16),
        }])
        .unwrap();

        peer.disconnect();
        let wcs = qp.poll_cq(16).unwrap();
        assert_eq!(wcs.len(), 1);
        assert_eq!(wcs[0].status, WcStatus::WrFlushErr);
    }
}
