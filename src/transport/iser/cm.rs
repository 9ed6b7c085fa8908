//! RDMA connection management
//!
//! A background thread consumes connection-manager events, walks the
//! connection through address and route resolution, creates the queue pair
//! and sends the connect request. Every transition is reported over a
//! channel; [`ConnectionManager::wait_established`] blocks on it.

use super::verbs::{ProtectionDomain, QpCaps, QueuePair};
use crate::error::{IscsiError, ScsiResult};
use crossbeam_channel::{select, Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, info, warn};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Address and route resolution timeout
pub const RESOLVE_TIMEOUT_MS: u32 = 2000;

/// Connection-manager events, as delivered by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmEvent {
    AddrResolved,
    AddrError,
    RouteResolved,
    RouteError,
    /// The target accepted a queue pair the identifier does not own; it is
    /// readied and the connection confirmed with [`CmId::establish`]
    ConnectResponse,
    Established,
    ConnectError,
    Unreachable,
    Rejected,
    Disconnected,
    AddrChange,
    TimewaitExit,
}

/// Connection identifier of a provider
pub trait CmId: Send {
    fn resolve_addr(&mut self, portal: &str, timeout_ms: u32) -> ScsiResult<()>;

    fn resolve_route(&mut self, timeout_ms: u32) -> ScsiResult<()>;

    fn alloc_pd(&mut self) -> ScsiResult<Arc<dyn ProtectionDomain>>;

    fn create_qp(
        &mut self,
        pd: &Arc<dyn ProtectionDomain>,
        caps: QpCaps,
    ) -> ScsiResult<Box<dyn QueuePair>>;

    fn connect(&mut self, private_data: &[u8]) -> ScsiResult<()>;

    /// Move the queue pair to RTS and confirm the connection
    fn establish(&mut self) -> ScsiResult<()> {
        Ok(())
    }

    fn disconnect(&mut self);
}

/// An RDMA device stack
pub trait RdmaProvider: Send + Sync {
    /// Create a connection identifier and the channel its events arrive on
    fn create_id(&self) -> ScsiResult<(Box<dyn CmId>, Receiver<CmEvent>)>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    AddrResolved,
    /// Queue pair and completion queue exist
    RouteResolved,
    ConnectSent,
    Established,
    Error(String),
}

/// Verbs objects created once the route is known
pub struct ConnResources {
    pub pd: Arc<dyn ProtectionDomain>,
    pub qp: Box<dyn QueuePair>,
}

enum Report {
    State(ConnState),
    Ready(ConnResources),
}

pub struct ConnectionManager {
    reports: Receiver<Report>,
    shutdown: Sender<()>,
    worker: Option<JoinHandle<()>>,
    state: ConnState,
    resources: Option<ConnResources>,
}

impl ConnectionManager {
    /// Start resolving `portal` and spawn the event thread
    pub fn start(
        provider: &dyn RdmaProvider,
        portal: &str,
        caps: QpCaps,
        private_data: Vec<u8>,
    ) -> ScsiResult<Self> {
        let (mut id, events) = provider.create_id()?;
        id.resolve_addr(portal, RESOLVE_TIMEOUT_MS)?;

        let (report_tx, report_rx) = crossbeam_channel::unbounded();
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);

        let worker = thread::Builder::new()
            .name("iser-cm".to_string())
            .spawn(move || {
                let mut worker = CmWorker {
                    id,
                    reports: report_tx,
                    caps,
                    private_data,
                };
                worker.run(events, shutdown_rx);
            })?;

        Ok(ConnectionManager {
            reports: report_rx,
            shutdown: shutdown_tx,
            worker: Some(worker),
            state: ConnState::Disconnected,
            resources: None,
        })
    }

    pub fn state(&self) -> &ConnState {
        &self.state
    }

    fn apply(&mut self, report: Report) {
        match report {
            Report::Ready(resources) => self.resources = Some(resources),
            Report::State(state) => {
                debug!("iSER connection state: {:?}", state);
                self.state = state;
            }
        }
    }

    /// Block until the connection is established
    pub fn wait_established(&mut self, timeout: Duration) -> ScsiResult<ConnResources> {
        let deadline = Instant::now() + timeout;
        loop {
            match &self.state {
                ConnState::Established => {
                    return self.resources.take().ok_or_else(|| {
                        IscsiError::Transport("Established without a queue pair".to_string())
                    });
                }
                ConnState::Error(msg) => return Err(IscsiError::Transport(msg.clone())),
                _ => {}
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.reports.recv_timeout(remaining) {
                Ok(report) => self.apply(report),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(IscsiError::Timeout(format!(
                        "RDMA connection not established (state {:?})",
                        self.state
                    )));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(IscsiError::Transport(
                        "Connection manager thread exited".to_string(),
                    ));
                }
            }
        }
    }

    /// Drain pending transitions without blocking
    pub fn poll_state(&mut self) -> &ConnState {
        loop {
            match self.reports.try_recv() {
                Ok(report) => self.apply(report),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if self.state == ConnState::Established {
                        self.state = ConnState::Disconnected;
                    }
                    break;
                }
            }
        }
        &self.state
    }

    /// Disconnect and stop the event thread
    pub fn shutdown(&mut self) {
        let _ = self.shutdown.try_send(());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("iSER connection manager thread panicked");
            }
        }
        self.state = ConnState::Disconnected;
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct CmWorker {
    id: Box<dyn CmId>,
    reports: Sender<Report>,
    caps: QpCaps,
    private_data: Vec<u8>,
}

impl CmWorker {
    fn run(&mut self, events: Receiver<CmEvent>, shutdown: Receiver<()>) {
        loop {
            select! {
                recv(events) -> event => match event {
                    Ok(event) => {
                        if let Err(msg) = self.handle(event) {
                            self.report(ConnState::Error(msg));
                            return;
                        }
                    }
                    Err(_) => {
                        self.report(ConnState::Error("CM event channel closed".to_string()));
                        return;
                    }
                },
                recv(shutdown) -> _ => {
                    self.id.disconnect();
                    return;
                }
            }
        }
    }

    fn report(&self, state: ConnState) {
        let _ = self.reports.send(Report::State(state));
    }

    fn handle(&mut self, event: CmEvent) -> Result<(), String> {
        debug!("CM event {:?}", event);
        match event {
            CmEvent::AddrResolved => {
                self.report(ConnState::AddrResolved);
                self.id
                    .resolve_route(RESOLVE_TIMEOUT_MS)
                    .map_err(|e| format!("Route resolution failed: {}", e))
            }
            CmEvent::RouteResolved => {
                let pd = self
                    .id
                    .alloc_pd()
                    .map_err(|e| format!("Protection domain allocation failed: {}", e))?;
                let qp = self
                    .id
                    .create_qp(&pd, self.caps)
                    .map_err(|e| format!("Queue pair creation failed: {}", e))?;
                let _ = self.reports.send(Report::Ready(ConnResources { pd, qp }));
                self.report(ConnState::RouteResolved);

                self.id
                    .connect(&self.private_data)
                    .map_err(|e| format!("RDMA connect failed: {}", e))?;
                self.report(ConnState::ConnectSent);
                Ok(())
            }
            CmEvent::ConnectResponse => {
                self.id
                    .establish()
                    .map_err(|e| format!("Completing RDMA connect failed: {}", e))?;
                info!("RDMA connection established");
                self.report(ConnState::Established);
                Ok(())
            }
            CmEvent::Established => {
                info!("RDMA connection established");
                self.report(ConnState::Established);
                Ok(())
            }
            CmEvent::AddrError
            | CmEvent::RouteError
            | CmEvent::ConnectError
            | CmEvent::Unreachable
            | CmEvent::Rejected => Err(format!("RDMA connection failed: {:?}", event)),
            CmEvent::Disconnected | CmEvent::AddrChange | CmEvent::TimewaitExit => {
                Err(format!("RDMA connection lost: {:?}", event))
            }
        }
    }
}
