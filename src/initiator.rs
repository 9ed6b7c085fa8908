//! The initiator: configuration, PDU queueing and the reactive service loop
//!
//! An [`IscsiInitiator`] owns one session, its transport and the two PDU
//! queues. Nothing runs in the background: the caller polls the descriptor
//! from [`IscsiInitiator::get_fd`] for [`IscsiInitiator::which_events`] and
//! hands the ready events to [`IscsiInitiator::service`], or uses the
//! blocking helpers in [`crate::sync`].

use crate::auth::{AuthConfig, ChapCredentials};
use crate::error::{IscsiError, ScsiResult};
use crate::login::LoginState;
use crate::pdu::{opcode, reject_reason_str, IscsiPdu, BHS_SIZE, RESERVED_TAG};
use crate::queue::{Pdu, PduQueues};
use crate::scsi::CommandStatus;
use crate::session::{DigestPreference, IscsiSession, SessionType};
use crate::transport::iser::rx::DEF_MAX_RECV_SEG_LEN;
use crate::transport::{self, Events, Transport, TransportContext, TransportKind};
use byteorder::{BigEndian, ByteOrder};
use log::{debug, error, info, warn};
#[cfg(unix)]
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Largest MaxRecvDataSegmentLength allowed by RFC 3720
const MAX_SEGMENT_LIMIT: u32 = 0x00FF_FFFF;
const MIN_SEGMENT_LIMIT: u32 = 512;

/// Everything needed to reach and log in to one target
#[derive(Debug, Clone)]
pub struct InitiatorConfig {
    pub initiator_name: String,
    pub initiator_alias: Option<String>,
    /// Target IQN; unused for discovery sessions
    pub target_name: String,
    /// "host:port" of the target portal
    pub portal: String,
    pub session_type: SessionType,
    pub auth: AuthConfig,
    pub transport: TransportKind,
    pub header_digest: DigestPreference,

    // Values proposed during login
    pub max_burst_length: u32,
    pub first_burst_length: u32,
    pub max_recv_data_segment_length: u32,
    pub immediate_data: bool,
    pub initial_r2t: bool,

    /// iSER send queue depth and receive descriptor count
    pub iser_max_cmds: u16,
    pub connect_timeout: Duration,
    /// Upper bound for the blocking helpers
    pub command_timeout: Duration,
    /// Reconnect and re-issue outstanding commands on a transport error
    pub auto_reconnect: bool,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl Default for InitiatorConfig {
    fn default() -> Self {
        InitiatorConfig {
            initiator_name: String::new(),
            initiator_alias: None,
            target_name: String::new(),
            portal: String::new(),
            session_type: SessionType::Normal,
            auth: AuthConfig::None,
            transport: TransportKind::Tcp,
            header_digest: DigestPreference::default(),
            max_burst_length: 262144,
            first_burst_length: 262144,
            max_recv_data_segment_length: 262144,
            immediate_data: true,
            initial_r2t: false,
            iser_max_cmds: crate::transport::iser::rx::DEF_XMIT_CMDS_MAX,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(30),
            auto_reconnect: false,
            reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

fn is_valid_iscsi_name(name: &str) -> bool {
    name.starts_with("iqn.") || name.starts_with("eui.") || name.starts_with("naa.")
}

impl InitiatorConfig {
    /// Check names and limits
    pub fn validate(&self) -> ScsiResult<()> {
        if !is_valid_iscsi_name(&self.initiator_name) {
            return Err(IscsiError::Config(format!(
                "Initiator name must start with 'iqn.', 'eui.' or 'naa.': '{}'",
                self.initiator_name
            )));
        }

        if self.session_type == SessionType::Normal && !is_valid_iscsi_name(&self.target_name) {
            return Err(IscsiError::Config(format!(
                "Target name must start with 'iqn.', 'eui.' or 'naa.': '{}'",
                self.target_name
            )));
        }

        if self.portal.is_empty() {
            return Err(IscsiError::Config("Target portal not set".to_string()));
        }

        for (key, value) in [
            ("MaxBurstLength", self.max_burst_length),
            ("FirstBurstLength", self.first_burst_length),
            ("MaxRecvDataSegmentLength", self.max_recv_data_segment_length),
        ] {
            if !(MIN_SEGMENT_LIMIT..=MAX_SEGMENT_LIMIT).contains(&value) {
                return Err(IscsiError::Config(format!(
                    "{} {} out of range ({}-{})",
                    key, value, MIN_SEGMENT_LIMIT, MAX_SEGMENT_LIMIT
                )));
            }
        }

        if self.first_burst_length > self.max_burst_length {
            return Err(IscsiError::Config(format!(
                "FirstBurstLength {} exceeds MaxBurstLength {}",
                self.first_burst_length, self.max_burst_length
            )));
        }

        if self.transport == TransportKind::Iser && self.iser_max_cmds == 0 {
            return Err(IscsiError::Config("iSER max commands must be non-zero".to_string()));
        }

        if let Some(creds) = self.auth.credentials() {
            if creds.username.is_empty() || creds.secret.is_empty() {
                return Err(IscsiError::Config("CHAP username and secret must be set".to_string()));
            }
        }

        Ok(())
    }
}

/// Builder for [`IscsiInitiator`]
#[derive(Debug, Clone, Default)]
pub struct IscsiInitiatorBuilder {
    config: InitiatorConfig,
}

impl IscsiInitiatorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initiator_name(mut self, name: impl Into<String>) -> Self {
        self.config.initiator_name = name.into();
        self
    }

    pub fn initiator_alias(mut self, alias: impl Into<String>) -> Self {
        self.config.initiator_alias = Some(alias.into());
        self
    }

    pub fn target_name(mut self, name: impl Into<String>) -> Self {
        self.config.target_name = name.into();
        self
    }

    /// Target portal ("host:port")
    pub fn portal(mut self, portal: impl Into<String>) -> Self {
        self.config.portal = portal.into();
        self
    }

    pub fn session_type(mut self, session_type: SessionType) -> Self {
        self.config.session_type = session_type;
        self
    }

    /// One-way CHAP
    pub fn chap(mut self, username: impl Into<String>, secret: impl Into<String>) -> Self {
        self.config.auth = AuthConfig::Chap {
            credentials: ChapCredentials::new(username, secret),
        };
        self
    }

    /// Mutual CHAP: the target must answer with `target_username`/`target_secret`
    pub fn mutual_chap(
        mut self,
        username: impl Into<String>,
        secret: impl Into<String>,
        target_username: impl Into<String>,
        target_secret: impl Into<String>,
    ) -> Self {
        self.config.auth = AuthConfig::MutualChap {
            credentials: ChapCredentials::new(username, secret),
            target_credentials: ChapCredentials::new(target_username, target_secret),
        };
        self
    }

    pub fn transport(mut self, kind: TransportKind) -> Self {
        self.config.transport = kind;
        self
    }

    pub fn header_digest(mut self, digest: DigestPreference) -> Self {
        self.config.header_digest = digest;
        self
    }

    pub fn max_burst_length(mut self, len: u32) -> Self {
        self.config.max_burst_length = len;
        self
    }

    pub fn first_burst_length(mut self, len: u32) -> Self {
        self.config.first_burst_length = len;
        self
    }

    pub fn max_recv_data_segment_length(mut self, len: u32) -> Self {
        self.config.max_recv_data_segment_length = len;
        self
    }

    pub fn immediate_data(mut self, enabled: bool) -> Self {
        self.config.immediate_data = enabled;
        self
    }

    pub fn initial_r2t(mut self, enabled: bool) -> Self {
        self.config.initial_r2t = enabled;
        self
    }

    pub fn iser_max_cmds(mut self, max_cmds: u16) -> Self {
        self.config.iser_max_cmds = max_cmds;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.config.command_timeout = timeout;
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.auto_reconnect = enabled;
        self
    }

    pub fn reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.reconnect_attempts = attempts;
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect_delay = delay;
        self
    }

    /// Validated configuration without building an initiator
    pub fn config(self) -> ScsiResult<InitiatorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the initiator with the transport named in the configuration
    pub fn build(self) -> ScsiResult<IscsiInitiator> {
        IscsiInitiator::new(self.config)
    }

    /// Build the initiator on a caller-supplied transport driver
    pub fn build_with_transport(self, transport: Box<dyn Transport>) -> ScsiResult<IscsiInitiator> {
        IscsiInitiator::with_transport(self.config, transport)
    }
}

/// iSCSI initiator session
pub struct IscsiInitiator {
    pub(crate) config: InitiatorConfig,
    pub(crate) session: IscsiSession,
    pub(crate) queues: PduQueues,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) login: LoginState,
    /// Portal in use; differs from the configured one after a redirect
    pub(crate) portal: String,
    pub(crate) nops_in_flight: u32,
    pub(crate) reconnecting: bool,
}

impl std::fmt::Debug for IscsiInitiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IscsiInitiator")
            .field("portal", &self.portal)
            .field("transport", &self.transport.kind())
            .field("state", &self.session.state)
            .field("outstanding", &self.queues.len())
            .finish()
    }
}

impl IscsiInitiator {
    pub fn builder() -> IscsiInitiatorBuilder {
        IscsiInitiatorBuilder::new()
    }

    pub fn new(config: InitiatorConfig) -> ScsiResult<Self> {
        let transport = transport::create(config.transport, config.iser_max_cmds)?;
        Self::with_transport(config, transport)
    }

    pub fn with_transport(config: InitiatorConfig, transport: Box<dyn Transport>) -> ScsiResult<Self> {
        config.validate()?;

        let mut session = IscsiSession::new();
        session.session_type = config.session_type;
        session.want_header_digest = config.header_digest;
        session.params.initiator_name = config.initiator_name.clone();
        session.params.initiator_alias = config.initiator_alias.clone().unwrap_or_default();
        session.params.target_name = config.target_name.clone();
        session.params.max_burst_length = config.max_burst_length;
        session.params.first_burst_length = config.first_burst_length;
        session.params.initiator_max_recv_data_segment_length = config.max_recv_data_segment_length;
        session.params.immediate_data = config.immediate_data;
        session.params.initial_r2t = config.initial_r2t;

        if transport.kind() == TransportKind::Iser {
            // Receive descriptors bound what the target may send
            session.want_header_digest = DigestPreference::None;
            session.params.initiator_max_recv_data_segment_length = DEF_MAX_RECV_SEG_LEN;
            session.params.target_max_recv_data_segment_length = DEF_MAX_RECV_SEG_LEN;
        }

        Ok(IscsiInitiator {
            portal: config.portal.clone(),
            login: LoginState::new(&config.auth),
            config,
            session,
            queues: PduQueues::new(),
            transport,
            nops_in_flight: 0,
            reconnecting: false,
        })
    }

    pub fn config(&self) -> &InitiatorConfig {
        &self.config
    }

    pub fn session(&self) -> &IscsiSession {
        &self.session
    }

    pub fn portal(&self) -> &str {
        &self.portal
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn is_logged_in(&self) -> bool {
        self.session.is_logged_in()
    }

    /// PDUs queued or waiting for a reply
    pub fn outstanding(&self) -> usize {
        self.queues.len()
    }

    /// Whether any queued or outstanding PDU carries `itt`
    pub fn is_outstanding(&self, itt: u32) -> bool {
        self.queues.itt_in_use(itt)
    }

    /// Connect the transport to the current portal
    pub fn connect(&mut self) -> ScsiResult<()> {
        info!(
            "Connecting to {} over {}",
            self.portal,
            self.transport.kind().as_str()
        );
        self.transport.connect(&self.portal, self.config.connect_timeout)?;
        self.queues.reset_itt();
        Ok(())
    }

    /// Drop the connection, failing everything still outstanding
    pub fn disconnect(&mut self) {
        let failed = self.fail_all(CommandStatus::Error);
        if failed > 0 {
            warn!("Disconnect failed {} outstanding PDUs", failed);
        }
        self.transport.disconnect();
        self.session.reset();
        self.nops_in_flight = 0;
    }

    /// Descriptor to poll, when the transport has one
    #[cfg(unix)]
    pub fn get_fd(&self) -> Option<RawFd> {
        self.transport.get_fd()
    }

    /// Events to poll the descriptor for
    pub fn which_events(&mut self) -> Events {
        let ctx = TransportContext::new(&mut self.queues, &self.session);
        self.transport.which_events(&ctx)
    }

    /// Wrap an outgoing PDU and let the transport attach its state
    pub(crate) fn new_pdu(&mut self, out: IscsiPdu, response_opcode: Option<u8>, flags: u32) -> ScsiResult<Pdu> {
        let mut pdu = Pdu::new(out, response_opcode, flags);
        self.transport.new_pdu(&mut pdu)?;
        Ok(pdu)
    }

    pub(crate) fn free_pdu(&mut self, pdu: Pdu) {
        self.transport.free_pdu(pdu);
    }

    /// Stamp ExpStatSN and hand the PDU to the transport
    pub(crate) fn queue_pdu(&mut self, mut pdu: Pdu) -> ScsiResult<()> {
        pdu.out.set_exp_stat_sn(self.session.exp_stat_sn());
        debug!(
            "Queue {} itt=0x{:08x} cmdsn={}",
            pdu.out.opcode_name(),
            pdu.itt,
            pdu.cmd_sn
        );
        let ctx = TransportContext::new(&mut self.queues, &self.session);
        self.transport.queue_pdu(ctx, pdu)
    }

    /// Perform the I/O allowed by `events` and process what arrived
    pub fn service(&mut self, events: Events) -> ScsiResult<()> {
        let ctx = TransportContext::new(&mut self.queues, &self.session);
        let incoming = match self.transport.service(ctx, events) {
            Ok(incoming) => incoming,
            Err(e) => return self.handle_transport_error(e),
        };

        let mut first_error = None;
        for pdu in incoming {
            if let Err(e) = self.process_pdu(pdu) {
                error!("{}", e);
                first_error.get_or_insert(e);
            }
        }

        let ctx = TransportContext::new(&mut self.queues, &self.session);
        if let Err(e) = self.transport.resume_queued(ctx) {
            return self.handle_transport_error(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn handle_transport_error(&mut self, err: IscsiError) -> ScsiResult<()> {
        error!("Transport failure on {}: {}", self.portal, err);
        if self.config.auto_reconnect
            && !self.reconnecting
            && self.session.is_logged_in()
            && !self.session.is_discovery()
        {
            return self.reconnect();
        }
        Err(err)
    }

    /// Decode one inbound PDU and complete whatever it answers
    pub(crate) fn process_pdu(&mut self, rsp: IscsiPdu) -> ScsiResult<()> {
        if rsp.ahs_length != 0 {
            return Err(IscsiError::Protocol(format!(
                "Additional header segments not supported ({} words)",
                rsp.ahs_length
            )));
        }

        debug!(
            "Received {} itt=0x{:08x} statsn={}",
            rsp.opcode_name(),
            rsp.itt,
            rsp.stat_sn()
        );

        if rsp.opcode == opcode::LOGIN_RESPONSE {
            self.session.exp_cmd_sn = rsp.exp_cmd_sn();
            self.session.max_cmd_sn = rsp.max_cmd_sn();
        } else {
            self.session.update_cmd_window(rsp.exp_cmd_sn(), rsp.max_cmd_sn());
        }

        match rsp.opcode {
            opcode::REJECT => return self.process_reject(&rsp),
            opcode::NOP_IN if rsp.itt == RESERVED_TAG => return self.process_target_nop_in(&rsp),
            opcode::ASYNC_MESSAGE => {
                self.session.update_stat_sn(rsp.stat_sn());
                warn!("Ignoring asynchronous message, event {}", rsp.specific[16]);
                return Ok(());
            }
            _ => {}
        }

        let itt = rsp.itt;
        let Some(waiting) = self.queues.waitpdu.get(&itt) else {
            debug!("No PDU waiting for itt 0x{:08x}, dropping {}", itt, rsp.opcode_name());
            return Ok(());
        };

        // A command is answered by Data-In and/or a SCSI response and may
        // solicit data with R2T
        let expected = match (rsp.opcode, waiting.response_opcode) {
            (opcode::SCSI_DATA_IN, Some(opcode::SCSI_RESPONSE)) => Some(opcode::SCSI_DATA_IN),
            (opcode::R2T, _) => Some(opcode::R2T),
            (_, expected) => expected,
        };

        let Some(mut pdu) = self.queues.take_wait(itt) else {
            return Ok(());
        };

        if expected != Some(rsp.opcode) {
            pdu.complete_with_status(CommandStatus::Error);
            self.free_pdu(pdu);
            return Err(IscsiError::Protocol(format!(
                "Got {} for itt 0x{:08x}, expected {}",
                rsp.opcode_name(),
                itt,
                expected.map_or("nothing", crate::pdu::opcode_name)
            )));
        }

        let result = match rsp.opcode {
            opcode::LOGIN_RESPONSE => self.process_login_response(&mut pdu, &rsp),
            opcode::TEXT_RESPONSE => self.process_text_response(&mut pdu, &rsp),
            opcode::LOGOUT_RESPONSE => self.process_logout_response(&mut pdu, &rsp),
            opcode::SCSI_RESPONSE => self.process_scsi_response(&mut pdu, &rsp),
            opcode::SCSI_DATA_IN => self.process_data_in(&mut pdu, &rsp),
            opcode::R2T => self.process_r2t(&mut pdu, &rsp),
            opcode::NOP_IN => self.process_nop_reply(&mut pdu, &rsp),
            opcode::TASK_MANAGEMENT_RESPONSE => self.process_task_mgmt_response(&mut pdu, &rsp),
            other => Err(IscsiError::Protocol(format!(
                "Don't know how to handle opcode 0x{:02x}",
                other
            ))),
        };

        match result {
            Ok(true) => {
                self.free_pdu(pdu);
                Ok(())
            }
            Ok(false) => {
                if let Some(old) = self.queues.insert_wait(pdu) {
                    self.free_pdu(old);
                }
                Ok(())
            }
            Err(e) => {
                pdu.complete_with_status(CommandStatus::Error);
                self.free_pdu(pdu);
                Err(e)
            }
        }
    }

    /// The data segment of a Reject holds the rejected header
    fn process_reject(&mut self, rsp: &IscsiPdu) -> ScsiResult<()> {
        self.session.update_stat_sn(rsp.stat_sn());
        let reason = rsp.response();

        if rsp.data.len() < BHS_SIZE {
            return Err(IscsiError::Protocol(format!(
                "Reject payload too short: {} bytes, need {}",
                rsp.data.len(),
                BHS_SIZE
            )));
        }

        let itt = BigEndian::read_u32(&rsp.data[16..20]);
        error!(
            "Request itt 0x{:08x} was rejected with reason 0x{:02x} ({})",
            itt,
            reason,
            reject_reason_str(reason)
        );

        match self.queues.take_wait(itt) {
            Some(mut pdu) => {
                pdu.complete_with_status(CommandStatus::Error);
                self.free_pdu(pdu);
            }
            None => warn!("Reject does not match any outstanding itt 0x{:08x}", itt),
        }
        Ok(())
    }

    /// Cancel every PDU carrying `itt`
    ///
    /// The completion fires once with `Cancelled`. The target is not told;
    /// use task management for that.
    pub fn cancel(&mut self, itt: u32) -> ScsiResult<()> {
        let removed = self.queues.remove_all(itt);
        if removed.is_empty() {
            return Err(IscsiError::Session(format!("No outstanding task with itt 0x{:08x}", itt)));
        }
        for mut pdu in removed {
            if pdu.opcode() == opcode::NOP_OUT {
                self.nops_in_flight = self.nops_in_flight.saturating_sub(1);
            }
            pdu.complete_with_status(CommandStatus::Cancelled);
            self.free_pdu(pdu);
        }
        debug!("Cancelled itt 0x{:08x}", itt);
        Ok(())
    }

    /// Cancel everything queued or outstanding; returns how many PDUs went
    pub fn cancel_all(&mut self) -> usize {
        let count = self.fail_all(CommandStatus::Cancelled);
        if count > 0 {
            info!("Cancelled {} outstanding PDUs", count);
        }
        count
    }

    fn fail_all(&mut self, status: CommandStatus) -> usize {
        let pdus = self.queues.drain_all();
        let count = pdus.len();
        for mut pdu in pdus {
            pdu.complete_with_status(status);
            self.free_pdu(pdu);
        }
        self.nops_in_flight = 0;
        count
    }
}
