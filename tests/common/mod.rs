//! Shared fixtures: configuration, a simulated target and a scripted transport
#![allow(dead_code)]

use iscsi_initiator::auth::{calculate_response, chap_response_value, parse_chap_hex};
use iscsi_initiator::pdu::{
    decode_lun, flags, opcode, opcode_name, parse_text_parameters, scsi_status,
    serialize_text_parameters, IscsiPdu, BHS_SIZE, RESERVED_TAG,
};
use iscsi_initiator::queue::{pdu_flags, Pdu};
use iscsi_initiator::scsi::SenseData;
use iscsi_initiator::transport::{Events, Transport, TransportContext, TransportKind};
use iscsi_initiator::{IscsiError, IscsiInitiator, IscsiInitiatorBuilder, ScsiResult};
use once_cell::sync::Lazy;
use std::collections::{HashMap, VecDeque};
use std::env;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

// ============================================================================
// Test Configuration
// ============================================================================

#[derive(Debug)]
pub struct TestConfig {
    pub target_addr: String,
    pub target_iqn: String,
    pub initiator_iqn: String,
    pub lun: u32,
}

pub static TEST_CONFIG: Lazy<TestConfig> = Lazy::new(|| {
    let contents = std::fs::read_to_string("test-config.toml")
        .expect("Failed to read test-config.toml - config file required");

    let config = contents
        .parse::<toml::Value>()
        .expect("Failed to parse test-config.toml - invalid TOML syntax");

    let target_section = config
        .get("target")
        .expect("Missing [target] section in test-config.toml");

    let portal = target_section
        .get("portal")
        .and_then(|p| p.as_str())
        .expect("Missing or invalid 'portal' in [target] section");

    let target_iqn = target_section
        .get("iqn")
        .and_then(|i| i.as_str())
        .expect("Missing or invalid 'iqn' in [target] section");

    let initiator_iqn = target_section
        .get("initiator_iqn")
        .and_then(|i| i.as_str())
        .expect("Missing or invalid 'initiator_iqn' in [target] section");

    let lun = target_section
        .get("lun")
        .and_then(|l| l.as_integer())
        .expect("Missing or invalid 'lun' in [target] section") as u32;

    // Portal can be overridden to point at a real target
    let target_addr = if let Ok(addr) = env::var("ISCSI_TEST_TARGET") {
        eprintln!("Using target address from ISCSI_TEST_TARGET: {}", addr);
        addr
    } else {
        portal.to_string()
    };

    TestConfig {
        target_addr,
        target_iqn: target_iqn.to_string(),
        initiator_iqn: initiator_iqn.to_string(),
        lun,
    }
});

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn target_iqn() -> &'static str {
    &TEST_CONFIG.target_iqn
}

pub fn initiator_iqn() -> &'static str {
    &TEST_CONFIG.initiator_iqn
}

pub fn builder(portal: &str) -> IscsiInitiatorBuilder {
    IscsiInitiator::builder()
        .initiator_name(initiator_iqn())
        .target_name(target_iqn())
        .portal(portal)
        .command_timeout(Duration::from_secs(5))
}

// ============================================================================
// Target-side PDUs
// ============================================================================

/// Builders for the PDUs a target sends
pub mod reply {
    #![allow(clippy::too_many_arguments)]

    use iscsi_initiator::pdu::{encode_lun, flags, opcode, IscsiPdu, RESERVED_TAG};

    /// Store a big-endian word at BHS byte `offset` (20..=44)
    fn put_field(pdu: &mut IscsiPdu, offset: usize, value: u32) {
        pdu.specific[offset - 20..offset - 16].copy_from_slice(&value.to_be_bytes());
    }

    fn set_target_sn(pdu: &mut IscsiPdu, stat_sn: u32, exp_cmd_sn: u32, max_cmd_sn: u32) {
        put_field(pdu, 24, stat_sn);
        put_field(pdu, 28, exp_cmd_sn);
        put_field(pdu, 32, max_cmd_sn);
    }

    pub fn login_response(
        isid: [u8; 6],
        tsih: u16,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        status_class: u8,
        status_detail: u8,
        csg: u8,
        nsg: u8,
        transit: bool,
        itt: u32,
        data: Vec<u8>,
    ) -> IscsiPdu {
        let mut pdu = IscsiPdu::with_opcode(opcode::LOGIN_RESPONSE, itt);
        pdu.flags = (if transit { flags::TRANSIT } else { 0 }) | ((csg & 0x03) << 2) | (nsg & 0x03);

        let mut lun_bytes = [0u8; 8];
        lun_bytes[0..6].copy_from_slice(&isid);
        lun_bytes[6..8].copy_from_slice(&tsih.to_be_bytes());
        pdu.lun = u64::from_be_bytes(lun_bytes);

        set_target_sn(&mut pdu, stat_sn, exp_cmd_sn, max_cmd_sn);
        pdu.specific[16] = status_class;
        pdu.specific[17] = status_detail;
        pdu.set_data(data);
        pdu
    }

    pub fn text_response(
        itt: u32,
        ttt: u32,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        final_flag: bool,
        data: Vec<u8>,
    ) -> IscsiPdu {
        let mut pdu = IscsiPdu::with_opcode(opcode::TEXT_RESPONSE, itt);
        pdu.flags = if final_flag { flags::FINAL } else { flags::CONTINUE };
        pdu.set_ttt(ttt);
        set_target_sn(&mut pdu, stat_sn, exp_cmd_sn, max_cmd_sn);
        pdu.set_data(data);
        pdu
    }

    pub fn logout_response(
        itt: u32,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        response: u8,
        time2wait: u16,
        time2retain: u16,
    ) -> IscsiPdu {
        let mut pdu = IscsiPdu::with_opcode(opcode::LOGOUT_RESPONSE, itt);
        pdu.flags = flags::FINAL;
        pdu.opcode_specific[0] = response;
        set_target_sn(&mut pdu, stat_sn, exp_cmd_sn, max_cmd_sn);
        pdu.specific[20..22].copy_from_slice(&time2wait.to_be_bytes());
        pdu.specific[22..24].copy_from_slice(&time2retain.to_be_bytes());
        pdu
    }

    /// SCSI Response; sense data goes out behind its SenseLength prefix
    pub fn scsi_response(
        itt: u32,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        status: u8,
        response: u8,
        residual_count: u32,
        sense_data: Option<&[u8]>,
    ) -> IscsiPdu {
        let mut pdu = IscsiPdu::with_opcode(opcode::SCSI_RESPONSE, itt);
        pdu.flags = flags::FINAL;
        pdu.opcode_specific = [response, status];
        set_target_sn(&mut pdu, stat_sn, exp_cmd_sn, max_cmd_sn);
        pdu.set_residual_count(residual_count);

        if let Some(sense) = sense_data {
            let mut data = Vec::with_capacity(sense.len() + 2);
            data.extend_from_slice(&(sense.len() as u16).to_be_bytes());
            data.extend_from_slice(sense);
            pdu.set_data(data);
        }
        pdu
    }

    pub fn scsi_data_in(
        itt: u32,
        ttt: u32,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        data_sn: u32,
        buffer_offset: u32,
        data: Vec<u8>,
        final_flag: bool,
        status: Option<u8>,
    ) -> IscsiPdu {
        let mut pdu = IscsiPdu::with_opcode(opcode::SCSI_DATA_IN, itt);
        if final_flag {
            pdu.flags |= flags::FINAL;
        }
        if let Some(s) = status {
            pdu.flags |= flags::STATUS;
            pdu.opcode_specific[1] = s;
        }
        pdu.set_ttt(ttt);
        set_target_sn(&mut pdu, stat_sn, exp_cmd_sn, max_cmd_sn);
        put_field(&mut pdu, 36, data_sn);
        put_field(&mut pdu, 40, buffer_offset);
        pdu.set_data(data);
        pdu
    }

    pub fn r2t(
        itt: u32,
        ttt: u32,
        lun: u32,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        r2t_sn: u32,
        buffer_offset: u32,
        desired_length: u32,
    ) -> IscsiPdu {
        let mut pdu = IscsiPdu::with_opcode(opcode::R2T, itt);
        pdu.flags = flags::FINAL;
        pdu.lun = encode_lun(lun);
        pdu.set_ttt(ttt);
        set_target_sn(&mut pdu, stat_sn, exp_cmd_sn, max_cmd_sn);
        put_field(&mut pdu, 36, r2t_sn);
        put_field(&mut pdu, 40, buffer_offset);
        put_field(&mut pdu, 44, desired_length);
        pdu
    }

    pub fn nop_in(
        itt: u32,
        ttt: u32,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        lun: u64,
    ) -> IscsiPdu {
        let mut pdu = IscsiPdu::with_opcode(opcode::NOP_IN, itt);
        pdu.flags = flags::FINAL;
        pdu.lun = lun;
        pdu.set_ttt(ttt);
        set_target_sn(&mut pdu, stat_sn, exp_cmd_sn, max_cmd_sn);
        pdu
    }

    pub fn task_management_response(
        itt: u32,
        response: u8,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
    ) -> IscsiPdu {
        let mut pdu = IscsiPdu::with_opcode(opcode::TASK_MANAGEMENT_RESPONSE, itt);
        pdu.flags = flags::FINAL;
        pdu.opcode_specific[0] = response;
        set_target_sn(&mut pdu, stat_sn, exp_cmd_sn, max_cmd_sn);
        pdu
    }

    /// Reject carrying the header of the rejected PDU
    pub fn reject(
        reason: u8,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        rejected: &IscsiPdu,
    ) -> IscsiPdu {
        let mut pdu = IscsiPdu::with_opcode(opcode::REJECT, RESERVED_TAG);
        pdu.flags = flags::FINAL;
        pdu.opcode_specific[0] = reason;
        set_target_sn(&mut pdu, stat_sn, exp_cmd_sn, max_cmd_sn);
        pdu.set_data(rejected.bhs().to_vec());
        pdu
    }

    pub fn async_message(stat_sn: u32, exp_cmd_sn: u32, max_cmd_sn: u32, event: u8) -> IscsiPdu {
        let mut pdu = IscsiPdu::with_opcode(opcode::ASYNC_MESSAGE, RESERVED_TAG);
        pdu.flags = flags::FINAL;
        set_target_sn(&mut pdu, stat_sn, exp_cmd_sn, max_cmd_sn);
        pdu.specific[16] = event;
        pdu
    }
}

/// Login Request fields a target looks at
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub isid: [u8; 6],
    pub tsih: u16,
    pub cid: u16,
    pub itt: u32,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub transit: bool,
    pub csg: u8,
    pub nsg: u8,
    pub parameters: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct ScsiCommandPdu {
    pub lun: u32,
    pub itt: u32,
    pub cmd_sn: u32,
    pub expected_data_length: u32,
    pub cdb: [u8; 16],
    pub read: bool,
    pub write: bool,
    pub final_flag: bool,
}

#[derive(Debug, Clone)]
pub struct ScsiDataOutPdu {
    pub lun: u32,
    pub itt: u32,
    pub ttt: u32,
    pub data_sn: u32,
    pub buffer_offset: u32,
    pub data_len: u32,
    pub final_flag: bool,
}

fn expect_opcode(pdu: &IscsiPdu, wanted: u8) -> ScsiResult<()> {
    if pdu.opcode != wanted {
        return Err(IscsiError::InvalidPdu(format!(
            "Expected {}, got {}",
            opcode_name(wanted),
            pdu.opcode_name()
        )));
    }
    Ok(())
}

pub fn parse_login_request(pdu: &IscsiPdu) -> ScsiResult<LoginRequest> {
    expect_opcode(pdu, opcode::LOGIN_REQUEST)?;
    let lun_bytes = pdu.lun.to_be_bytes();
    let mut isid = [0u8; 6];
    isid.copy_from_slice(&lun_bytes[0..6]);

    Ok(LoginRequest {
        isid,
        tsih: pdu.tsih(),
        cid: u16::from_be_bytes([pdu.specific[0], pdu.specific[1]]),
        itt: pdu.itt,
        cmd_sn: pdu.cmd_sn(),
        exp_stat_sn: pdu.exp_stat_sn(),
        transit: pdu.flags & flags::TRANSIT != 0,
        csg: (pdu.flags >> 2) & 0x03,
        nsg: pdu.flags & 0x03,
        parameters: parse_text_parameters(&pdu.data)?,
    })
}

pub fn parse_scsi_command(pdu: &IscsiPdu) -> ScsiResult<ScsiCommandPdu> {
    expect_opcode(pdu, opcode::SCSI_COMMAND)?;
    let mut cdb = [0u8; 16];
    cdb.copy_from_slice(pdu.cdb());

    Ok(ScsiCommandPdu {
        lun: decode_lun(pdu.lun),
        itt: pdu.itt,
        cmd_sn: pdu.cmd_sn(),
        expected_data_length: pdu.expected_data_length(),
        cdb,
        read: pdu.flags & flags::READ != 0,
        write: pdu.flags & flags::WRITE != 0,
        final_flag: pdu.is_final(),
    })
}

pub fn parse_scsi_data_out(pdu: &IscsiPdu) -> ScsiResult<ScsiDataOutPdu> {
    expect_opcode(pdu, opcode::SCSI_DATA_OUT)?;
    Ok(ScsiDataOutPdu {
        lun: decode_lun(pdu.lun),
        itt: pdu.itt,
        ttt: pdu.ttt(),
        data_sn: pdu.data_sn(),
        buffer_offset: pdu.buffer_offset(),
        data_len: pdu.data.len() as u32,
        final_flag: pdu.is_final(),
    })
}

// ============================================================================
// Simulated target
// ============================================================================

pub const TARGET_CHAP_ID: u8 = 7;
pub const TARGET_CHAP_CHALLENGE: [u8; 16] = [0x5A; 16];
pub const SIM_TSIH: u16 = 0x1234;

#[derive(Debug)]
struct WriteState {
    lba: u64,
    buf: Vec<u8>,
    received: u32,
    ttt: u32,
}

/// Just enough of an iSCSI target to answer the initiator
#[derive(Debug)]
pub struct SimTarget {
    pub target_name: String,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    /// Commands accepted beyond ExpCmdSN
    pub window: u32,
    /// MaxRecvDataSegmentLength announced at login
    pub max_recv_seg: u32,
    pub first_burst: u32,
    pub max_burst: u32,
    pub immediate_data: bool,
    pub initial_r2t: bool,
    /// (username, secret) the initiator must prove
    pub chap: Option<(String, String)>,
    /// (username, secret) answered to a mutual challenge
    pub target_chap: Option<(String, String)>,
    /// Portal handed out with a temporary redirect
    pub redirect_to: Option<String>,
    /// Login failure (class, detail)
    pub login_failure: Option<(u8, u8)>,
    pub block_size: u32,
    pub disk: Vec<u8>,
    /// Largest Data-In segment
    pub data_in_segment: usize,
    pub targets: Vec<(String, Vec<String>)>,
    /// Split SendTargets answers into chunks of this size
    pub text_chunk: Option<usize>,
    /// Leave SCSI commands unanswered
    pub swallow_commands: bool,
    pub received: Vec<IscsiPdu>,
    pub logins: u32,
    writes: HashMap<u32, WriteState>,
    pending_text: Vec<u8>,
    next_ttt: u32,
}

impl SimTarget {
    pub fn new(target_name: &str) -> Self {
        SimTarget {
            target_name: target_name.to_string(),
            stat_sn: 1,
            exp_cmd_sn: 0,
            window: 32,
            max_recv_seg: 65536,
            first_burst: 262144,
            max_burst: 262144,
            immediate_data: true,
            initial_r2t: false,
            chap: None,
            target_chap: None,
            redirect_to: None,
            login_failure: None,
            block_size: 512,
            disk: vec![0u8; 2 * 1024 * 1024],
            data_in_segment: 65536,
            targets: Vec::new(),
            text_chunk: None,
            swallow_commands: false,
            received: Vec::new(),
            logins: 0,
            writes: HashMap::new(),
            pending_text: Vec::new(),
            next_ttt: 0x100,
        }
    }

    pub fn max_cmd_sn(&self) -> u32 {
        self.exp_cmd_sn.wrapping_add(self.window).wrapping_sub(1)
    }

    /// Take the StatSN for a status-bearing reply
    fn next_stat_sn(&mut self) -> u32 {
        let sn = self.stat_sn;
        self.stat_sn = self.stat_sn.wrapping_add(1);
        sn
    }

    pub fn received_with_opcode(&self, op: u8) -> Vec<&IscsiPdu> {
        self.received.iter().filter(|p| p.opcode == op).collect()
    }

    /// Every reply to `pdu`, in order
    pub fn respond(&mut self, pdu: &IscsiPdu) -> Vec<IscsiPdu> {
        self.received.push(pdu.clone());

        if pdu.opcode == opcode::LOGIN_REQUEST {
            self.exp_cmd_sn = pdu.cmd_sn();
        } else if !pdu.immediate && pdu.opcode != opcode::SCSI_DATA_OUT && pdu.cmd_sn() == self.exp_cmd_sn {
            self.exp_cmd_sn = self.exp_cmd_sn.wrapping_add(1);
        }

        match pdu.opcode {
            opcode::LOGIN_REQUEST => self.login(pdu),
            opcode::TEXT_REQUEST => self.text(pdu),
            opcode::SCSI_COMMAND if self.swallow_commands => Vec::new(),
            opcode::SCSI_COMMAND => self.command(pdu),
            opcode::SCSI_DATA_OUT => self.data_out(pdu),
            opcode::NOP_OUT => {
                if pdu.itt == RESERVED_TAG {
                    return Vec::new();
                }
                let mut rsp = reply::nop_in(
                    pdu.itt,
                    RESERVED_TAG,
                    self.next_stat_sn(),
                    self.exp_cmd_sn,
                    self.max_cmd_sn(),
                    pdu.lun,
                );
                rsp.set_data(pdu.data.clone());
                vec![rsp]
            }
            opcode::TASK_MANAGEMENT_REQUEST => {
                self.writes.clear();
                vec![reply::task_management_response(
                    pdu.itt,
                    0,
                    self.next_stat_sn(),
                    self.exp_cmd_sn,
                    self.max_cmd_sn(),
                )]
            }
            opcode::LOGOUT_REQUEST => vec![reply::logout_response(
                pdu.itt,
                self.next_stat_sn(),
                self.exp_cmd_sn,
                self.max_cmd_sn(),
                0,
                2,
                0,
            )],
            _ => Vec::new(),
        }
    }

    fn login_reply(&mut self, pdu: &IscsiPdu, class: u8, transit: bool, nsg: u8, keys: &[(&str, String)]) -> Vec<IscsiPdu> {
        let req = match parse_login_request(pdu) {
            Ok(req) => req,
            Err(_) => return Vec::new(),
        };
        let keys: Vec<(String, String)> = keys.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        let tsih = if transit && nsg == 3 { SIM_TSIH } else { 0 };
        vec![reply::login_response(
            req.isid,
            tsih,
            self.next_stat_sn(),
            self.exp_cmd_sn,
            self.max_cmd_sn(),
            class,
            if class == 0 { 0 } else { self.login_failure.map_or(1, |(_, d)| d) },
            req.csg,
            nsg,
            transit,
            pdu.itt,
            serialize_text_parameters(&keys),
        )]
    }

    fn login(&mut self, pdu: &IscsiPdu) -> Vec<IscsiPdu> {
        self.logins += 1;
        let req = match parse_login_request(pdu) {
            Ok(req) => req,
            Err(_) => return Vec::new(),
        };
        let get = |key: &str| {
            req.parameters
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        };

        if let Some(portal) = self.redirect_to.take() {
            return self.login_reply(pdu, 1, false, 0, &[("TargetAddress", format!("{},1", portal))]);
        }
        if let Some((class, _)) = self.login_failure {
            return self.login_reply(pdu, class, false, 0, &[]);
        }

        if req.csg == 0 {
            if get("AuthMethod").is_some() {
                return if self.chap.is_some() {
                    self.login_reply(pdu, 0, false, 0, &[("AuthMethod", "CHAP".to_string())])
                } else {
                    self.login_reply(pdu, 0, true, 1, &[("AuthMethod", "None".to_string())])
                };
            }
            if get("CHAP_A").is_some() {
                return self.login_reply(
                    pdu,
                    0,
                    false,
                    0,
                    &[
                        ("CHAP_A", "5".to_string()),
                        ("CHAP_I", TARGET_CHAP_ID.to_string()),
                        ("CHAP_C", format!("0x{}", hex::encode(TARGET_CHAP_CHALLENGE))),
                    ],
                );
            }
            let (Some(name), Some(response)) = (get("CHAP_N"), get("CHAP_R")) else {
                return self.login_reply(pdu, 2, false, 0, &[]);
            };
            let Some((user, secret)) = self.chap.clone() else {
                return self.login_reply(pdu, 2, false, 0, &[]);
            };
            let expected = calculate_response(TARGET_CHAP_ID, &secret, &TARGET_CHAP_CHALLENGE);
            if name != user || parse_chap_hex(&response).ok() != Some(expected) {
                self.login_failure = Some((2, 1));
                return self.login_reply(pdu, 2, false, 0, &[]);
            }

            let mut keys = Vec::new();
            if let (Some(id), Some(challenge)) = (get("CHAP_I"), get("CHAP_C")) {
                if let (Some((tuser, tsecret)), Ok(id), Ok(challenge)) =
                    (self.target_chap.clone(), id.parse::<u8>(), parse_chap_hex(&challenge))
                {
                    keys.push(("CHAP_N", tuser));
                    keys.push(("CHAP_R", chap_response_value(id, &tsecret, &challenge)));
                }
            }
            return self.login_reply(pdu, 0, true, 1, &keys);
        }

        let discovery = get("SessionType").as_deref() == Some("Discovery");
        if !discovery && get("TargetName").as_deref() != Some(self.target_name.as_str()) {
            self.login_failure = Some((2, 3));
            return self.login_reply(pdu, 2, false, 0, &[]);
        }

        let yes_no = |b: bool| if b { "Yes" } else { "No" }.to_string();
        let mut keys = vec![
            ("HeaderDigest", "None".to_string()),
            ("DataDigest", "None".to_string()),
            ("MaxRecvDataSegmentLength", self.max_recv_seg.to_string()),
        ];
        if !discovery {
            keys.push(("TargetAlias", "simdisk".to_string()));
            keys.push(("ImmediateData", yes_no(self.immediate_data)));
            keys.push(("InitialR2T", yes_no(self.initial_r2t)));
            keys.push(("FirstBurstLength", self.first_burst.to_string()));
            keys.push(("MaxBurstLength", self.max_burst.to_string()));
        }
        self.login_reply(pdu, 0, true, 3, &keys)
    }

    fn text(&mut self, pdu: &IscsiPdu) -> Vec<IscsiPdu> {
        if pdu.ttt() == RESERVED_TAG {
            let mut keys = Vec::new();
            for (name, portals) in &self.targets {
                keys.push(("TargetName".to_string(), name.clone()));
                for portal in portals {
                    keys.push(("TargetAddress".to_string(), portal.clone()));
                }
            }
            self.pending_text = serialize_text_parameters(&keys);
        }

        let chunk = self.text_chunk.unwrap_or(usize::MAX).min(self.pending_text.len());
        let data: Vec<u8> = self.pending_text.drain(..chunk).collect();
        let done = self.pending_text.is_empty();
        let ttt = if done { RESERVED_TAG } else { 0x77 };
        vec![reply::text_response(
            pdu.itt,
            ttt,
            self.next_stat_sn(),
            self.exp_cmd_sn,
            self.max_cmd_sn(),
            done,
            data,
        )]
    }

    fn check_condition(&mut self, itt: u32, key: u8, asc: u8, ascq: u8) -> IscsiPdu {
        let sense = SenseData::new(key, asc, ascq).to_bytes();
        reply::scsi_response(
            itt,
            self.next_stat_sn(),
            self.exp_cmd_sn,
            self.max_cmd_sn(),
            scsi_status::CHECK_CONDITION,
            0,
            0,
            Some(&sense),
        )
    }

    fn good(&mut self, itt: u32) -> IscsiPdu {
        reply::scsi_response(
            itt,
            self.next_stat_sn(),
            self.exp_cmd_sn,
            self.max_cmd_sn(),
            scsi_status::GOOD,
            0,
            0,
            None,
        )
    }

    /// Data-In train ending with status
    fn data_in(&mut self, itt: u32, data: Vec<u8>) -> Vec<IscsiPdu> {
        let seg = self.data_in_segment.max(1);
        let chunks: Vec<&[u8]> = if data.is_empty() { vec![&[][..]] } else { data.chunks(seg).collect() };
        let count = chunks.len();
        let mut pdus = Vec::new();
        let mut offset = 0u32;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let last = i + 1 == count;
            let stat_sn = if last { self.next_stat_sn() } else { self.stat_sn };
            pdus.push(reply::scsi_data_in(
                itt,
                RESERVED_TAG,
                stat_sn,
                self.exp_cmd_sn,
                self.max_cmd_sn(),
                i as u32,
                offset,
                chunk.to_vec(),
                last,
                if last { Some(scsi_status::GOOD) } else { None },
            ));
            offset += chunk.len() as u32;
        }
        pdus
    }

    fn lba_range(&self, cdb: &[u8], blocks: u64) -> Option<(usize, usize)> {
        let lba = u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]) as u64;
        let start = lba * self.block_size as u64;
        let end = start + blocks * self.block_size as u64;
        if end as usize > self.disk.len() {
            return None;
        }
        Some((start as usize, end as usize))
    }

    fn command(&mut self, pdu: &IscsiPdu) -> Vec<IscsiPdu> {
        let cmd = match parse_scsi_command(pdu) {
            Ok(cmd) => cmd,
            Err(_) => return Vec::new(),
        };
        let cdb = cmd.cdb;
        match cdb[0] {
            0x00 | 0x35 => vec![self.good(cmd.itt)],
            0x12 => {
                let mut inquiry = vec![0u8; 36];
                inquiry[4] = 31;
                inquiry[8..16].copy_from_slice(b"SIMTGT  ");
                inquiry.truncate(cmd.expected_data_length as usize);
                self.data_in(cmd.itt, inquiry)
            }
            0x25 => {
                let last_lba = (self.disk.len() as u32 / self.block_size) - 1;
                let mut data = last_lba.to_be_bytes().to_vec();
                data.extend_from_slice(&self.block_size.to_be_bytes());
                self.data_in(cmd.itt, data)
            }
            0x28 => {
                let blocks = u16::from_be_bytes([cdb[7], cdb[8]]) as u64;
                match self.lba_range(&cdb, blocks) {
                    Some((start, end)) => {
                        let data = self.disk[start..end].to_vec();
                        self.data_in(cmd.itt, data)
                    }
                    None => vec![self.check_condition(cmd.itt, 5, 0x21, 0)],
                }
            }
            0x2a => {
                let blocks = u16::from_be_bytes([cdb[7], cdb[8]]) as u64;
                let Some((start, _)) = self.lba_range(&cdb, blocks) else {
                    return vec![self.check_condition(cmd.itt, 5, 0x21, 0)];
                };
                let total = cmd.expected_data_length;
                let mut state = WriteState {
                    lba: start as u64,
                    buf: vec![0u8; total as usize],
                    received: 0,
                    ttt: RESERVED_TAG,
                };
                let immediate = pdu.data.len().min(total as usize);
                state.buf[..immediate].copy_from_slice(&pdu.data[..immediate]);
                state.received = immediate as u32;
                self.writes.insert(cmd.itt, state);

                if cmd.final_flag {
                    self.advance_write(cmd.itt, cmd.lun)
                } else {
                    Vec::new()
                }
            }
            _ => vec![self.check_condition(cmd.itt, 5, 0x20, 0)],
        }
    }

    fn data_out(&mut self, pdu: &IscsiPdu) -> Vec<IscsiPdu> {
        let Ok(dout) = parse_scsi_data_out(pdu) else {
            return Vec::new();
        };
        let Some(state) = self.writes.get_mut(&dout.itt) else {
            return Vec::new();
        };
        let start = dout.buffer_offset as usize;
        let end = (start + pdu.data.len()).min(state.buf.len());
        state.buf[start..end].copy_from_slice(&pdu.data[..end - start]);
        state.received = state.received.max(end as u32);

        if dout.final_flag {
            self.advance_write(dout.itt, dout.lun)
        } else {
            Vec::new()
        }
    }

    /// Finish the write or solicit the next burst
    fn advance_write(&mut self, itt: u32, lun: u32) -> Vec<IscsiPdu> {
        let Some(state) = self.writes.get_mut(&itt) else {
            return Vec::new();
        };
        let total = state.buf.len() as u32;
        if state.received >= total {
            let state = match self.writes.remove(&itt) {
                Some(state) => state,
                None => return Vec::new(),
            };
            let start = state.lba as usize;
            self.disk[start..start + state.buf.len()].copy_from_slice(&state.buf);
            return vec![self.good(itt)];
        }

        let offset = state.received;
        let len = (total - offset).min(self.max_burst);
        let ttt = self.next_ttt;
        self.next_ttt += 1;
        state.ttt = ttt;
        vec![reply::r2t(
            itt,
            ttt,
            lun,
            self.stat_sn,
            self.exp_cmd_sn,
            self.max_cmd_sn(),
            0,
            offset,
            len,
        )]
    }
}

// ============================================================================
// Scripted transport
// ============================================================================

/// What the scripted transport has seen and will deliver
#[derive(Debug)]
pub struct Wire {
    pub target: SimTarget,
    /// Everything the initiator wrote, in order
    pub sent: Vec<IscsiPdu>,
    pub inbox: VecDeque<IscsiPdu>,
    pub connected: bool,
    pub connects: u32,
    /// Connection attempts to refuse
    pub refuse_connects: u32,
    /// Fail the next service call as if the peer reset the connection
    pub fail_next_service: bool,
    /// Record but don't answer; the test injects replies itself
    pub hold: bool,
    /// Data-Out PDUs to accept before queueing them fails
    pub data_out_budget: Option<u32>,
}

/// In-process transport wired straight to a [`SimTarget`]
#[derive(Clone)]
pub struct ScriptedTransport {
    wire: Arc<Mutex<Wire>>,
}

impl ScriptedTransport {
    pub fn new(target: SimTarget) -> Self {
        ScriptedTransport {
            wire: Arc::new(Mutex::new(Wire {
                target,
                sent: Vec::new(),
                inbox: VecDeque::new(),
                connected: false,
                connects: 0,
                refuse_connects: 0,
                fail_next_service: false,
                hold: false,
                data_out_budget: None,
            })),
        }
    }

    pub fn wire(&self) -> MutexGuard<'_, Wire> {
        match self.wire.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Deliver a reply on the next service call
    pub fn inject(&self, pdu: IscsiPdu) {
        self.wire().inbox.push_back(pdu);
    }

    pub fn sent_with_opcode(&self, op: u8) -> Vec<IscsiPdu> {
        self.wire().sent.iter().filter(|p| p.opcode == op).cloned().collect()
    }
}

impl Transport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn connect(&mut self, portal: &str, _timeout: Duration) -> ScsiResult<()> {
        let mut wire = self.wire();
        wire.connects += 1;
        if wire.refuse_connects > 0 {
            wire.refuse_connects -= 1;
            return Err(IscsiError::Transport(format!("Cannot connect to {}", portal)));
        }
        wire.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut wire = self.wire();
        wire.connected = false;
        wire.inbox.clear();
    }

    fn is_connected(&self) -> bool {
        self.wire().connected
    }

    fn new_pdu(&mut self, _pdu: &mut Pdu) -> ScsiResult<()> {
        Ok(())
    }

    fn free_pdu(&mut self, pdu: Pdu) {
        drop(pdu);
    }

    fn queue_pdu(&mut self, ctx: TransportContext<'_>, pdu: Pdu) -> ScsiResult<()> {
        let mut wire = self.wire();
        if !wire.connected {
            return Err(IscsiError::Transport("Not connected".to_string()));
        }
        if pdu.out.opcode == opcode::SCSI_DATA_OUT {
            if let Some(budget) = wire.data_out_budget.as_mut() {
                if *budget == 0 {
                    return Err(IscsiError::Transport("Send buffer full".to_string()));
                }
                *budget -= 1;
            }
        }
        drop(wire);
        ctx.queues.push_out(pdu);
        Ok(())
    }

    fn service(&mut self, ctx: TransportContext<'_>, events: Events) -> ScsiResult<Vec<IscsiPdu>> {
        let mut wire = self.wire();
        if wire.fail_next_service {
            wire.fail_next_service = false;
            wire.connected = false;
            return Err(IscsiError::Transport("Connection reset by peer".to_string()));
        }
        if !wire.connected {
            return Err(IscsiError::Transport("Not connected".to_string()));
        }

        if events.contains(Events::WRITABLE) {
            while let Some(front) = ctx.queues.outqueue.front() {
                if !front.is_immediate() && !ctx.session.command_window_open(front.cmd_sn) {
                    break;
                }
                let Some(pdu) = ctx.queues.outqueue.pop_front() else {
                    break;
                };
                wire.sent.push(pdu.out.clone());
                if !wire.hold {
                    let replies = wire.target.respond(&pdu.out);
                    wire.inbox.extend(replies);
                }
                if !pdu.has_flag(pdu_flags::DELETE_WHEN_SENT) {
                    ctx.queues.insert_wait(pdu);
                }
            }
        }

        if events.contains(Events::READABLE) {
            return Ok(wire.inbox.drain(..).collect());
        }
        Ok(Vec::new())
    }

    #[cfg(unix)]
    fn get_fd(&self) -> Option<std::os::unix::io::RawFd> {
        None
    }

    fn which_events(&self, ctx: &TransportContext<'_>) -> Events {
        if ctx.queues.outqueue.is_empty() {
            Events::READABLE
        } else {
            Events::READABLE | Events::WRITABLE
        }
    }

    fn wait_events(&mut self, interest: Events, timeout: Duration) -> ScsiResult<Events> {
        let ready = {
            let wire = self.wire();
            if !wire.connected && !wire.fail_next_service {
                return Err(IscsiError::Transport("Not connected".to_string()));
            }
            !wire.inbox.is_empty() || wire.fail_next_service
        };
        if ready || interest.contains(Events::WRITABLE) {
            return Ok(interest | Events::READABLE);
        }
        thread::sleep(timeout.min(Duration::from_millis(1)));
        Ok(Events::NONE)
    }
}

/// Initiator on a scripted transport, not yet connected
pub fn scripted(target: SimTarget, build: impl FnOnce(IscsiInitiatorBuilder) -> IscsiInitiatorBuilder) -> (IscsiInitiator, ScriptedTransport) {
    init_logging();
    let transport = ScriptedTransport::new(target);
    let initiator = build(builder("sim:3260"))
        .build_with_transport(Box::new(transport.clone()))
        .expect("valid configuration");
    (initiator, transport)
}

/// Initiator on a scripted transport, logged in
pub fn logged_in(target: SimTarget, build: impl FnOnce(IscsiInitiatorBuilder) -> IscsiInitiatorBuilder) -> (IscsiInitiator, ScriptedTransport) {
    let (mut initiator, transport) = scripted(target, build);
    initiator.login_sync().expect("login");
    (initiator, transport)
}

/// Pump the engine until `handle` completes
pub fn complete(initiator: &mut IscsiInitiator, handle: &mut iscsi_initiator::TaskHandle) -> iscsi_initiator::Outcome {
    initiator
        .run_until(handle, Duration::from_secs(5))
        .expect("request completes")
}

// ============================================================================
// Loopback TCP target
// ============================================================================

fn read_frame(stream: &mut TcpStream) -> std::io::Result<Option<IscsiPdu>> {
    let mut bhs = [0u8; BHS_SIZE];
    match stream.read_exact(&mut bhs) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let data_len = ((bhs[5] as usize) << 16) | ((bhs[6] as usize) << 8) | bhs[7] as usize;
    let mut data = vec![0u8; (data_len + 3) & !3];
    stream.read_exact(&mut data)?;
    data.truncate(data_len);
    IscsiPdu::from_parts(&bhs, &data)
        .map(Some)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
}

/// Serve one connection with a [`SimTarget`] on a loopback port
///
/// Returns the portal and a handle yielding the target once the initiator
/// hangs up.
pub fn start_tcp_target(mut target: SimTarget) -> (String, JoinHandle<SimTarget>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let portal = listener.local_addr().expect("local addr").to_string();
    let handle = thread::spawn(move || {
        let Ok((mut stream, _)) = listener.accept() else {
            return target;
        };
        while let Ok(Some(pdu)) = read_frame(&mut stream) {
            for reply in target.respond(&pdu) {
                if stream.write_all(&reply.to_bytes()).is_err() {
                    return target;
                }
            }
        }
        target
    });
    (portal, handle)
}

/// Data pattern used by the write/read tests
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}
