//! iSCSI session management
//!
//! This module handles session state, sequence numbers, and parameter negotiation
//! from the initiator's side, based on RFC 3720: https://datatracker.ietf.org/doc/html/rfc3720

use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp::Ordering;
use std::sync::Mutex;

/// Process-wide random source, seeded once on first use
static RNG: Lazy<Mutex<StdRng>> = Lazy::new(|| Mutex::new(StdRng::from_entropy()));

/// Run `f` with the process-wide random number generator
pub(crate) fn with_rng<T>(f: impl FnOnce(&mut StdRng) -> T) -> T {
    match RNG.lock() {
        Ok(mut rng) => f(&mut rng),
        Err(poisoned) => f(&mut poisoned.into_inner()),
    }
}

/// Session state machine states (RFC 3720 Section 5)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(Default)]
pub enum SessionState {
    /// Not logged in
    #[default]
    Free,
    /// Security negotiation phase (CHAP, etc.)
    SecurityNegotiation,
    /// Login operational parameter negotiation
    LoginOperationalNegotiation,
    /// Full feature phase - ready for SCSI commands
    FullFeaturePhase,
    /// Logout in progress
    Logout,
    /// Session failed/error state
    Failed,
}


/// Session type (RFC 3720 Section 5.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(Default)]
pub enum SessionType {
    /// Normal session for SCSI commands
    #[default]
    Normal,
    /// Discovery session for target discovery (SendTargets)
    Discovery,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Normal => "Normal",
            SessionType::Discovery => "Discovery",
        }
    }
}

/// Digest type for header/data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(Default)]
pub enum DigestType {
    #[default]
    None,
    CRC32C,
}

/// Header digest values offered during login, in order of preference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(Default)]
pub enum DigestPreference {
    None,
    #[default]
    NoneThenCrc32c,
    Crc32cThenNone,
    Crc32c,
}

impl DigestPreference {
    /// Value of the HeaderDigest key
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestPreference::None => "None",
            DigestPreference::NoneThenCrc32c => "None,CRC32C",
            DigestPreference::Crc32cThenNone => "CRC32C,None",
            DigestPreference::Crc32c => "CRC32C",
        }
    }
}

/// Negotiated session parameters (RFC 3720 Section 12)
#[derive(Debug, Clone)]
pub struct SessionParams {
    // Connection parameters
    /// Largest data segment this initiator accepts
    pub initiator_max_recv_data_segment_length: u32,
    /// Largest data segment the target accepts (default: 8192)
    pub target_max_recv_data_segment_length: u32,

    // Session parameters
    /// Maximum burst length for solicited data
    pub max_burst_length: u32,
    /// First burst length for unsolicited data
    pub first_burst_length: u32,
    /// Default time to wait before reconnecting (seconds)
    pub default_time2wait: u16,
    /// Default time to retain connection (seconds)
    pub default_time2retain: u16,
    /// Maximum outstanding R2T (Ready to Transfer) PDUs
    pub max_outstanding_r2t: u32,
    /// Data PDU in order (within a sequence)
    pub data_pdu_in_order: bool,
    /// Data sequence in order
    pub data_sequence_in_order: bool,
    /// Error recovery level (0-2)
    pub error_recovery_level: u8,
    /// Immediate data allowed
    pub immediate_data: bool,
    /// Initial R2T required
    pub initial_r2t: bool,

    // Digest settings
    /// Header digest in use once logged in
    pub header_digest: DigestType,
    /// Data digest (always None)
    pub data_digest: DigestType,

    // Names
    /// Target name (IQN)
    pub target_name: String,
    /// Initiator name (IQN)
    pub initiator_name: String,
    /// Target alias reported during login
    pub target_alias: String,
    /// Initiator alias (optional)
    pub initiator_alias: String,
    /// Portal the target redirected us to
    pub target_address: Option<String>,
}

impl Default for SessionParams {
    fn default() -> Self {
        SessionParams {
            initiator_max_recv_data_segment_length: 262144,
            target_max_recv_data_segment_length: 8192,
            max_burst_length: 262144,
            first_burst_length: 262144,
            default_time2wait: 2,
            default_time2retain: 0,
            max_outstanding_r2t: 1,
            data_pdu_in_order: true,
            data_sequence_in_order: true,
            error_recovery_level: 0,
            immediate_data: true,
            initial_r2t: false,
            header_digest: DigestType::None,
            data_digest: DigestType::None,
            target_name: String::new(),
            initiator_name: String::new(),
            target_alias: String::new(),
            initiator_alias: String::new(),
            target_address: None,
        }
    }
}

/// Compare two 32-bit serial numbers (RFC 1982)
pub fn serial32_compare(a: u32, b: u32) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }
    if (a < b && b - a < 0x8000_0000) || (a > b && a - b > 0x8000_0000) {
        Ordering::Less
    } else {
        Ordering::Greater
    }
}

/// Order `items` by serial number, oldest first
///
/// Distances are taken from the oldest key, so a run of numbers that wraps
/// past 0xffffffff keeps its issue order.
pub fn sort_by_serial<T, F>(items: &mut [T], key: F)
where
    F: Fn(&T) -> u32,
{
    let Some(oldest) = items
        .iter()
        .map(&key)
        .min_by(|a, b| serial32_compare(*a, *b))
    else {
        return;
    };
    items.sort_by_key(|item| key(item).wrapping_sub(oldest));
}

/// iSCSI Session
///
/// Sequence numbers and negotiated limits of the single connection the
/// initiator keeps with the target.
#[derive(Debug, Clone)]
pub struct IscsiSession {
    /// Initiator Session ID (6 bytes)
    pub isid: [u8; 6],
    /// Target Session Identifying Handle (assigned by target)
    pub tsih: u16,
    /// Connection ID
    pub cid: u16,
    /// Session type
    pub session_type: SessionType,
    /// Current session state
    pub state: SessionState,
    /// Negotiated parameters
    pub params: SessionParams,
    /// Header digest values offered during login
    pub want_header_digest: DigestPreference,
    /// Header digest answered by the target, in force once logged in
    pub negotiated_header_digest: DigestType,

    // Sequence numbers
    /// Next command sequence number to assign
    pub cmd_sn: u32,
    /// Next command sequence number the target expects
    pub exp_cmd_sn: u32,
    /// Highest command sequence number the target accepts
    pub max_cmd_sn: u32,
    /// Last status sequence number received
    pub stat_sn: u32,
}

impl Default for IscsiSession {
    fn default() -> Self {
        Self::new()
    }
}

impl IscsiSession {
    /// Create a new session with a random ISID
    pub fn new() -> Self {
        IscsiSession {
            isid: random_isid(),
            tsih: 0,
            cid: 0,
            session_type: SessionType::Normal,
            state: SessionState::Free,
            params: SessionParams::default(),
            want_header_digest: DigestPreference::default(),
            negotiated_header_digest: DigestType::None,
            cmd_sn: 0,
            exp_cmd_sn: 0,
            max_cmd_sn: 0,
            stat_sn: 0,
        }
    }

    /// Forget everything learned from the previous connection, keeping names and proposals
    pub fn reset(&mut self) {
        self.tsih = 0;
        self.state = SessionState::Free;
        self.cmd_sn = 0;
        self.exp_cmd_sn = 0;
        self.max_cmd_sn = 0;
        self.stat_sn = 0;
        self.params.header_digest = DigestType::None;
        self.negotiated_header_digest = DigestType::None;
        self.params.target_address = None;
    }

    /// Switch to full feature phase and turn on the negotiated header digest
    pub fn enter_full_feature_phase(&mut self) {
        self.state = SessionState::FullFeaturePhase;
        self.params.header_digest = self.negotiated_header_digest;
    }

    /// Apply a parameter answered by the target during login
    ///
    /// Lengths take the minimum of both sides, InitialR2T is OR-ed and
    /// ImmediateData is AND-ed.
    pub fn apply_target_param(&mut self, key: &str, value: &str) {
        match key {
            "TargetAlias" => {
                self.params.target_alias = value.to_string();
            }
            "TargetAddress" => {
                self.params.target_address = Some(value.to_string());
            }
            "MaxRecvDataSegmentLength" => {
                if let Ok(v) = value.parse::<u32>() {
                    // This is the target's max recv, which bounds what we send
                    self.params.target_max_recv_data_segment_length = v;
                }
            }
            "MaxBurstLength" => {
                if let Ok(v) = value.parse::<u32>() {
                    self.params.max_burst_length = v.min(self.params.max_burst_length);
                }
            }
            "FirstBurstLength" => {
                if let Ok(v) = value.parse::<u32>() {
                    self.params.first_burst_length = v.min(self.params.first_burst_length);
                }
            }
            "DefaultTime2Wait" => {
                if let Ok(v) = value.parse::<u16>() {
                    self.params.default_time2wait = v.max(self.params.default_time2wait);
                }
            }
            "DefaultTime2Retain" => {
                if let Ok(v) = value.parse::<u16>() {
                    self.params.default_time2retain = v.min(self.params.default_time2retain);
                }
            }
            "MaxOutstandingR2T" => {
                if let Ok(v) = value.parse::<u32>() {
                    self.params.max_outstanding_r2t = v.min(self.params.max_outstanding_r2t);
                }
            }
            "DataPDUInOrder" => {
                self.params.data_pdu_in_order = self.params.data_pdu_in_order || value == "Yes";
            }
            "DataSequenceInOrder" => {
                self.params.data_sequence_in_order =
                    self.params.data_sequence_in_order || value == "Yes";
            }
            "ErrorRecoveryLevel" => {
                if let Ok(v) = value.parse::<u8>() {
                    self.params.error_recovery_level = v.min(self.params.error_recovery_level);
                }
            }
            "ImmediateData" => {
                // AND operation: only true if both want it
                self.params.immediate_data = self.params.immediate_data && (value == "Yes");
            }
            "InitialR2T" => {
                // OR operation: true if either wants it
                self.params.initial_r2t = self.params.initial_r2t || (value == "Yes");
            }
            "HeaderDigest" => {
                self.negotiated_header_digest = if value == "CRC32C" {
                    DigestType::CRC32C
                } else {
                    DigestType::None
                };
            }
            "DataDigest" => {
                self.params.data_digest = DigestType::None;
            }
            _ => {
                log::debug!("Ignoring login parameter: {}={}", key, value);
            }
        }
    }

    /// Operational parameters proposed in the login operational stage
    pub fn operational_params(&self) -> Vec<(String, String)> {
        let yes_no = |b: bool| if b { "Yes" } else { "No" }.to_string();

        let mut params = vec![(
            "HeaderDigest".to_string(),
            self.want_header_digest.as_str().to_string(),
        )];
        params.push(("DataDigest".to_string(), "None".to_string()));

        if self.session_type == SessionType::Normal {
            params.push(("InitialR2T".to_string(), yes_no(self.params.initial_r2t)));
            params.push(("ImmediateData".to_string(), yes_no(self.params.immediate_data)));
            params.push((
                "MaxBurstLength".to_string(),
                self.params.max_burst_length.to_string(),
            ));
            params.push((
                "FirstBurstLength".to_string(),
                self.params.first_burst_length.to_string(),
            ));
            params.push((
                "DefaultTime2Wait".to_string(),
                self.params.default_time2wait.to_string(),
            ));
            params.push((
                "DefaultTime2Retain".to_string(),
                self.params.default_time2retain.to_string(),
            ));
            params.push((
                "MaxOutstandingR2T".to_string(),
                self.params.max_outstanding_r2t.to_string(),
            ));
            params.push((
                "ErrorRecoveryLevel".to_string(),
                self.params.error_recovery_level.to_string(),
            ));
            params.push(("IFMarker".to_string(), "No".to_string()));
            params.push(("OFMarker".to_string(), "No".to_string()));
            params.push(("MaxConnections".to_string(), "1".to_string()));
        }

        params.push((
            "MaxRecvDataSegmentLength".to_string(),
            self.params.initiator_max_recv_data_segment_length.to_string(),
        ));

        if self.session_type == SessionType::Normal {
            params.push(("DataPDUInOrder".to_string(), yes_no(self.params.data_pdu_in_order)));
            params.push((
                "DataSequenceInOrder".to_string(),
                yes_no(self.params.data_sequence_in_order),
            ));
        }

        params
    }

    /// Check if session is in full feature phase
    pub fn is_logged_in(&self) -> bool {
        self.state == SessionState::FullFeaturePhase
    }

    /// Check if this is a discovery session
    pub fn is_discovery(&self) -> bool {
        self.session_type == SessionType::Discovery
    }

    /// Get the CmdSN for a new non-immediate command and advance it
    pub fn next_cmd_sn(&mut self) -> u32 {
        let sn = self.cmd_sn;
        self.cmd_sn = self.cmd_sn.wrapping_add(1);
        sn
    }

    /// ExpStatSN to stamp on outgoing PDUs
    pub fn exp_stat_sn(&self) -> u32 {
        self.stat_sn.wrapping_add(1)
    }

    /// Record the StatSN carried by a status-bearing PDU; never moves backwards
    pub fn update_stat_sn(&mut self, stat_sn: u32) {
        if serial32_compare(stat_sn, self.stat_sn) == Ordering::Greater {
            self.stat_sn = stat_sn;
        }
    }

    /// Advance ExpCmdSN / MaxCmdSN from a target PDU
    pub fn update_cmd_window(&mut self, exp_cmd_sn: u32, max_cmd_sn: u32) {
        if serial32_compare(max_cmd_sn, self.max_cmd_sn) == Ordering::Greater {
            self.max_cmd_sn = max_cmd_sn;
        }
        if serial32_compare(exp_cmd_sn, self.exp_cmd_sn) == Ordering::Greater {
            self.exp_cmd_sn = exp_cmd_sn;
        }
    }

    /// Whether a command with this CmdSN may be sent now
    pub fn command_window_open(&self, cmd_sn: u32) -> bool {
        serial32_compare(cmd_sn, self.max_cmd_sn) != Ordering::Greater
    }
}

/// Random-format ISID (type 0x80, 24 random bits, qualifier 0)
fn random_isid() -> [u8; 6] {
    let rnd: u32 = with_rng(|rng| rng.gen());
    [
        0x80,
        (rnd >> 16) as u8,
        (rnd >> 8) as u8,
        rnd as u8,
        0,
        0,
    ]
}

// ============================================================================
// Unit Tests
// ============================================================================
