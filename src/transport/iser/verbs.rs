//! RDMA verbs surface used by the iSER driver
//!
//! Memory registration, work requests and completions, modelled after the
//! ibverbs objects of the same names. A provider supplies the protection
//! domain and queue pair implementations.

use crate::error::{IscsiError, ScsiResult};
use std::any::Any;
use std::fmt;
#[cfg(unix)]
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Memory region access flags
pub mod access {
    pub const LOCAL_WRITE: u32 = 0x1;
    pub const REMOTE_WRITE: u32 = 0x2;
    pub const REMOTE_READ: u32 = 0x4;
}

/// Provider object that keeps a registration alive
pub type Registration = Box<dyn Any + Send + Sync>;

struct MrInner {
    addr: u64,
    lkey: u32,
    rkey: u32,
    access: u32,
    // Dropped before `buf` so the device lets go of the memory first
    registration: Option<Registration>,
    buf: Mutex<Vec<u8>>,
}

/// A registered memory region
///
/// Cloning yields another handle to the same memory.
#[derive(Clone)]
pub struct MemoryRegion {
    inner: Arc<MrInner>,
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("addr", &format_args!("0x{:x}", self.inner.addr))
            .field("lkey", &self.inner.lkey)
            .field("rkey", &self.inner.rkey)
            .field("len", &self.len())
            .finish()
    }
}

impl MemoryRegion {
    /// Region at a provider-chosen address; called by providers
    pub fn new(addr: u64, lkey: u32, rkey: u32, access: u32, len: usize) -> Self {
        MemoryRegion {
            inner: Arc::new(MrInner {
                addr,
                lkey,
                rkey,
                access,
                registration: None,
                buf: Mutex::new(vec![0u8; len]),
            }),
        }
    }

    /// Region over `buf` as registered with a device
    ///
    /// The address is that of the buffer's heap allocation, which never
    /// moves since the buffer is never resized. `registration` is held
    /// until the last handle drops.
    pub fn registered(buf: Vec<u8>, lkey: u32, rkey: u32, access: u32, registration: Registration) -> Self {
        MemoryRegion {
            inner: Arc::new(MrInner {
                addr: buf.as_ptr() as u64,
                lkey,
                rkey,
                access,
                registration: Some(registration),
                buf: Mutex::new(buf),
            }),
        }
    }

    /// Whether a device registration backs this region
    pub fn is_registered(&self) -> bool {
        self.inner.registration.is_some()
    }

    pub fn addr(&self) -> u64 {
        self.inner.addr
    }

    pub fn lkey(&self) -> u32 {
        self.inner.lkey
    }

    pub fn rkey(&self) -> u32 {
        self.inner.rkey
    }

    pub fn access(&self) -> u32 {
        self.inner.access
    }

    pub fn len(&self) -> usize {
        self.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `[addr, addr + len)` lies inside the region
    pub fn contains(&self, addr: u64, len: usize) -> bool {
        addr >= self.addr()
            && addr
                .checked_add(len as u64)
                .is_some_and(|end| end <= self.addr() + self.len() as u64)
    }

    /// Whether both handles refer to the same registration
    pub fn same_region(&self, other: &MemoryRegion) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn lock(&self) -> ScsiResult<MutexGuard<'_, Vec<u8>>> {
        self.inner
            .buf
            .lock()
            .map_err(|_| IscsiError::Transport("Memory region lock poisoned".to_string()))
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> ScsiResult<()> {
        let mut buf = self.lock()?;
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= buf.len())
            .ok_or_else(|| {
                IscsiError::Transport(format!(
                    "Write of {} bytes at {} overruns {}-byte region",
                    data.len(),
                    offset,
                    buf.len()
                ))
            })?;
        buf[offset..end].copy_from_slice(data);
        Ok(())
    }

    pub fn read(&self, offset: usize, len: usize) -> ScsiResult<Vec<u8>> {
        let buf = self.lock()?;
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= buf.len())
            .ok_or_else(|| {
                IscsiError::Transport(format!(
                    "Read of {} bytes at {} overruns {}-byte region",
                    len,
                    offset,
                    buf.len()
                ))
            })?;
        Ok(buf[offset..end].to_vec())
    }
}

/// Scatter/gather element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

impl Sge {
    /// Element covering `len` bytes of `mr` starting at `offset`
    pub fn from_region(mr: &MemoryRegion, offset: usize, len: usize) -> Self {
        Sge {
            addr: mr.addr() + offset as u64,
            length: len as u32,
            lkey: mr.lkey(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SendWr {
    pub wr_id: u64,
    pub sg_list: Vec<Sge>,
    pub signaled: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct RecvWr {
    pub wr_id: u64,
    pub sge: Sge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    Recv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    /// Work request flushed because the queue pair left RTS
    WrFlushErr,
    Error(u32),
}

/// Work completion
#[derive(Debug, Clone, Copy)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    pub byte_len: u32,
    pub vendor_err: u32,
}

/// Queue pair sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpCaps {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    pub cq_len: u32,
}

pub trait ProtectionDomain: Send + Sync {
    fn reg_mr(&self, len: usize, access: u32) -> ScsiResult<MemoryRegion>;

    fn dereg_mr(&self, mr: &MemoryRegion);
}

/// A reliable-connected queue pair with its completion queue
pub trait QueuePair: Send {
    fn post_send(&mut self, wr: SendWr) -> ScsiResult<()>;

    fn post_recv(&mut self, wrs: &[RecvWr]) -> ScsiResult<()>;

    /// Reap at most `max` completions
    fn poll_cq(&mut self, max: usize) -> ScsiResult<Vec<WorkCompletion>>;

    /// Block until a completion is available or `timeout` passes
    fn wait_cq(&mut self, timeout: Duration) -> ScsiResult<bool>;

    #[cfg(unix)]
    fn completion_fd(&self) -> Option<RawFd> {
        None
    }
}
