//! Login, discovery and logout
//!
//! Login walks the security stage (when CHAP is configured) and the
//! operational stage, one Login Request per target answer, until the
//! target transits to full feature phase. RFC 3720 Section 5.3.

use crate::auth::{chap_response_value, parse_chap_hex, AuthConfig, ChapAlgorithm, ChapChallenge};
use crate::error::{decode_login_status, IscsiError, ScsiResult};
use crate::initiator::IscsiInitiator;
use crate::pdu::{
    flags, login_status, opcode, parse_text_parameters, serialize_text_parameters, stage, IscsiPdu,
    RESERVED_TAG,
};
use crate::queue::{completion_channel, Outcome, Pdu, Reply, TaskHandle};
use crate::scsi::CommandStatus;
use crate::session::{SessionState, SessionType};
use crossbeam_channel::Sender;
use log::{debug, error, info, warn};

/// Login Requests sent before giving up
const MAX_LOGIN_ATTEMPTS: u32 = 10;

/// A target returned by SendTargets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryAddress {
    pub target_name: String,
    /// "address:port,tpgt" entries
    pub portals: Vec<String>,
}

/// Steps of the CHAP exchange in the security stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityPhase {
    #[default]
    OfferChap,
    SelectAlgorithm,
    SendResponse,
}

/// Progress of the login currently running
#[derive(Debug, Default)]
pub(crate) struct LoginState {
    pub stage: u8,
    pub security: SecurityPhase,
    pub itt: u32,
    pub attempts: u32,
    chap_identifier: Option<u8>,
    chap_challenge: Option<Vec<u8>>,
    /// Our challenge to the target (mutual CHAP)
    mutual: Option<ChapChallenge>,
    target_chap_name: Option<String>,
    target_chap_response: Option<Vec<u8>>,
    /// Why the last login failed
    pub failure: Option<IscsiError>,
}

impl LoginState {
    pub fn new(auth: &AuthConfig) -> Self {
        LoginState {
            stage: if auth.requires_auth() {
                stage::SECURITY_NEG
            } else {
                stage::LOGIN_OP_NEG
            },
            ..Default::default()
        }
    }
}

/// Parse a SendTargets answer; a TargetAddress belongs to the TargetName before it
pub fn parse_discovery_data(data: &[u8]) -> ScsiResult<Vec<DiscoveryAddress>> {
    let mut targets: Vec<DiscoveryAddress> = Vec::new();
    for (key, value) in parse_text_parameters(data)? {
        match key.as_str() {
            "TargetName" => targets.push(DiscoveryAddress {
                target_name: value,
                portals: Vec::new(),
            }),
            "TargetAddress" => match targets.last_mut() {
                Some(target) => target.portals.push(value),
                None => {
                    return Err(IscsiError::Protocol(format!(
                        "TargetAddress {} before any TargetName",
                        value
                    )))
                }
            },
            _ => {
                return Err(IscsiError::Protocol(format!(
                    "Don't know how to handle discovery string: {}={}",
                    key, value
                )))
            }
        }
    }
    Ok(targets)
}

/// Strip the portal group tag from a TargetAddress value
pub fn portal_from_target_address(address: &str) -> &str {
    address.split(',').next().unwrap_or(address)
}

impl IscsiInitiator {
    /// Start logging in on the connected transport
    pub fn login(&mut self) -> ScsiResult<TaskHandle> {
        if self.session.is_logged_in() {
            return Err(IscsiError::Session("Trying to login while already logged in".to_string()));
        }
        if !self.transport.is_connected() {
            return Err(IscsiError::Transport("Not connected".to_string()));
        }

        self.login = LoginState::new(&self.config.auth);
        self.login.itt = self.queues.allocate_itt()?;
        if self.config.auth.is_mutual() {
            self.login.mutual = Some(ChapChallenge::new());
        }

        let (tx, rx) = completion_channel();
        self.send_login_pdu(tx)?;
        Ok(TaskHandle::new(self.login.itt, self.session.cmd_sn, 0, rx))
    }

    /// Key/value pairs for the next Login Request
    fn login_keys(&self) -> ScsiResult<Vec<(String, String)>> {
        let mut keys = Vec::new();
        let security = self.login.stage == stage::SECURITY_NEG;

        if !security || self.login.security == SecurityPhase::OfferChap {
            keys.push(("InitiatorName".to_string(), self.config.initiator_name.clone()));
            if let Some(alias) = &self.config.initiator_alias {
                keys.push(("InitiatorAlias".to_string(), alias.clone()));
            }
            if self.session.session_type == SessionType::Normal {
                keys.push(("TargetName".to_string(), self.config.target_name.clone()));
            }
            keys.push((
                "SessionType".to_string(),
                self.session.session_type.as_str().to_string(),
            ));
        }

        if !security {
            keys.extend(self.session.operational_params());
            return Ok(keys);
        }

        match self.login.security {
            SecurityPhase::OfferChap => {
                keys.push(("AuthMethod".to_string(), "CHAP,None".to_string()));
            }
            SecurityPhase::SelectAlgorithm => {
                keys.push(("CHAP_A".to_string(), (ChapAlgorithm::Md5 as u8).to_string()));
            }
            SecurityPhase::SendResponse => {
                let creds = self
                    .config
                    .auth
                    .credentials()
                    .ok_or_else(|| IscsiError::Auth("Target wants CHAP but no credentials are set".to_string()))?;
                let (Some(identifier), Some(challenge)) =
                    (self.login.chap_identifier, self.login.chap_challenge.as_ref())
                else {
                    return Err(IscsiError::Auth(
                        "Target did not send CHAP_I and CHAP_C".to_string(),
                    ));
                };
                keys.push(("CHAP_N".to_string(), creds.username.clone()));
                keys.push((
                    "CHAP_R".to_string(),
                    chap_response_value(identifier, &creds.secret, challenge),
                ));
                if let Some(mutual) = &self.login.mutual {
                    keys.push(("CHAP_I".to_string(), mutual.identifier_str()));
                    keys.push(("CHAP_C".to_string(), mutual.challenge_value()));
                }
            }
        }
        Ok(keys)
    }

    /// Send the Login Request for the current stage; `tx` receives the
    /// outcome of the whole login
    fn send_login_pdu(&mut self, tx: Sender<Outcome>) -> ScsiResult<()> {
        match self.build_login_pdu() {
            Ok(mut pdu) => {
                pdu.set_completion(tx);
                self.queue_pdu(pdu)
            }
            Err(e) => {
                let _ = tx.send(Outcome::status(CommandStatus::Error));
                Err(e)
            }
        }
    }

    fn build_login_pdu(&mut self) -> ScsiResult<Pdu> {
        if self.login.attempts >= MAX_LOGIN_ATTEMPTS {
            return Err(IscsiError::Session("Login took too many tries, giving up".to_string()));
        }
        self.login.attempts += 1;

        let (csg, nsg, transit) = if self.login.stage == stage::SECURITY_NEG {
            self.session.state = SessionState::SecurityNegotiation;
            let transit = self.login.security != SecurityPhase::SelectAlgorithm;
            (stage::SECURITY_NEG, stage::LOGIN_OP_NEG, transit)
        } else {
            self.session.state = SessionState::LoginOperationalNegotiation;
            (stage::LOGIN_OP_NEG, stage::FULL_FEATURE, true)
        };

        let keys = self.login_keys()?;
        debug!(
            "Login request csg={} nsg={} transit={}: {:?}",
            csg,
            nsg,
            transit,
            keys.iter()
                .map(|(k, v)| if k == "CHAP_R" { format!("{}=...", k) } else { format!("{}={}", k, v) })
                .collect::<Vec<_>>()
        );

        let out = IscsiPdu::login_request(
            self.session.isid,
            self.session.tsih,
            self.session.cid,
            self.login.itt,
            self.session.cmd_sn,
            self.session.exp_stat_sn(),
            csg,
            nsg,
            transit,
            serialize_text_parameters(&keys),
        );
        let mut pdu = self.new_pdu(out, Some(opcode::LOGIN_RESPONSE), 0)?;
        pdu.cmd_sn = self.session.cmd_sn;
        Ok(pdu)
    }

    fn fail_login(&mut self, pdu: &mut Pdu, err: IscsiError) -> ScsiResult<bool> {
        error!("Login to {} failed: {}", self.portal, err);
        self.session.state = SessionState::Failed;
        self.login.failure = Some(err);
        pdu.complete_with_status(CommandStatus::Error);
        Ok(true)
    }

    /// Check the target's answer to our mutual CHAP challenge
    fn verify_target_chap(&self) -> ScsiResult<()> {
        let (Some(mutual), Some(expected)) = (&self.login.mutual, self.config.auth.target_credentials())
        else {
            return Ok(());
        };
        let (Some(name), Some(response)) = (&self.login.target_chap_name, &self.login.target_chap_response)
        else {
            return Err(IscsiError::Auth("Target did not answer the mutual CHAP challenge".to_string()));
        };
        if *name != expected.username {
            return Err(IscsiError::Auth(format!("Unexpected target CHAP name '{}'", name)));
        }
        if !mutual.validate_response(response, &expected.secret) {
            return Err(IscsiError::Auth("Target CHAP response does not match".to_string()));
        }
        Ok(())
    }

    pub(crate) fn process_login_response(&mut self, pdu: &mut Pdu, rsp: &IscsiPdu) -> ScsiResult<bool> {
        self.session.stat_sn = rsp.stat_sn();

        let keys = match parse_text_parameters(&rsp.data) {
            Ok(keys) => keys,
            Err(e) => return self.fail_login(pdu, e),
        };
        for (key, value) in keys {
            match key.as_str() {
                "AuthMethod" => {
                    if value == "CHAP" {
                        self.login.security = SecurityPhase::SelectAlgorithm;
                    }
                }
                "CHAP_A" => {
                    if ChapAlgorithm::from_str(&value) != Some(ChapAlgorithm::Md5) {
                        let err = IscsiError::Auth(format!("Unsupported CHAP algorithm {}", value));
                        return self.fail_login(pdu, err);
                    }
                    self.login.security = SecurityPhase::SendResponse;
                }
                "CHAP_I" => match value.parse::<u8>() {
                    Ok(id) => {
                        self.login.chap_identifier = Some(id);
                        self.login.security = SecurityPhase::SendResponse;
                    }
                    Err(_) => {
                        return self.fail_login(pdu, IscsiError::Auth(format!("Bad CHAP_I {}", value)))
                    }
                },
                "CHAP_C" => match parse_chap_hex(&value) {
                    Ok(challenge) => {
                        self.login.chap_challenge = Some(challenge);
                        self.login.security = SecurityPhase::SendResponse;
                    }
                    Err(e) => return self.fail_login(pdu, e),
                },
                "CHAP_N" => self.login.target_chap_name = Some(value),
                "CHAP_R" => match parse_chap_hex(&value) {
                    Ok(response) => self.login.target_chap_response = Some(response),
                    Err(e) => return self.fail_login(pdu, e),
                },
                _ => self.session.apply_target_param(&key, &value),
            }
        }

        let (class, detail) = rsp.login_status();
        if class == login_status::REDIRECTION {
            if let Some(address) = &self.session.params.target_address {
                info!("Target redirects login to {}", address);
                self.session.state = SessionState::Free;
                pdu.complete_with_status(CommandStatus::Redirect);
                return Ok(true);
            }
        }
        if class != login_status::SUCCESS {
            let msg = format!(
                "{} (class 0x{:02x} detail 0x{:02x})",
                decode_login_status(class, detail),
                class,
                detail
            );
            let err = if class == login_status::INITIATOR_ERROR && detail == 0x01 {
                IscsiError::Auth(msg)
            } else {
                IscsiError::Session(msg)
            };
            return self.fail_login(pdu, err);
        }

        let transit = rsp.flags & flags::TRANSIT != 0;
        let nsg = rsp.flags & 0x03;

        if transit && self.login.stage == stage::SECURITY_NEG {
            if let Err(e) = self.verify_target_chap() {
                return self.fail_login(pdu, e);
            }
        }
        if transit {
            self.login.stage = nsg;
        }

        if transit && nsg == stage::FULL_FEATURE {
            self.session.tsih = rsp.tsih();
            self.session.enter_full_feature_phase();
            info!(
                "Logged in to {} ({}) tsih={} statsn={} maxcmdsn={}",
                if self.session.is_discovery() {
                    "discovery session"
                } else {
                    self.config.target_name.as_str()
                },
                self.portal,
                self.session.tsih,
                self.session.stat_sn,
                self.session.max_cmd_sn
            );
            pdu.complete(Outcome::new(CommandStatus::Good, Reply::Login));
            return Ok(true);
        }

        match pdu.take_completion() {
            Some(tx) => {
                if let Err(e) = self.send_login_pdu(tx) {
                    error!("Failed to send continuation login PDU: {}", e);
                    self.session.state = SessionState::Failed;
                    self.login.failure = Some(e);
                }
            }
            None => warn!("Login response for itt 0x{:08x} with nobody waiting", pdu.itt),
        }
        Ok(true)
    }

    /// Ask a discovery session for every target it knows (SendTargets=All)
    pub fn discover(&mut self) -> ScsiResult<TaskHandle> {
        if !self.session.is_logged_in() {
            return Err(IscsiError::NotLoggedIn);
        }
        if !self.session.is_discovery() {
            return Err(IscsiError::WrongSessionType(
                "SendTargets needs a discovery session".to_string(),
            ));
        }

        let itt = self.queues.allocate_itt()?;
        let keys = vec![("SendTargets".to_string(), "All".to_string())];
        let out = IscsiPdu::text_request(
            itt,
            RESERVED_TAG,
            self.session.cmd_sn,
            true,
            serialize_text_parameters(&keys),
        );

        let (tx, rx) = completion_channel();
        let mut pdu = self.new_pdu(out, Some(opcode::TEXT_RESPONSE), 0)?;
        pdu.cmd_sn = self.session.cmd_sn;
        pdu.set_completion(tx);
        self.queue_pdu(pdu)?;
        Ok(TaskHandle::new(itt, self.session.cmd_sn, 0, rx))
    }

    pub(crate) fn process_text_response(&mut self, pdu: &mut Pdu, rsp: &IscsiPdu) -> ScsiResult<bool> {
        self.session.update_stat_sn(rsp.stat_sn());
        pdu.indata.extend_from_slice(&rsp.data);

        if !rsp.is_final() {
            let ttt = rsp.ttt();
            if rsp.flags & flags::CONTINUE == 0 || ttt == RESERVED_TAG {
                error!("Unsupported flags in text reply: 0x{:02x}", rsp.flags);
                pdu.complete_with_status(CommandStatus::Error);
                return Ok(true);
            }

            // Ask for the rest with the same itt, echoing the target's ttt
            let out = IscsiPdu::text_request(pdu.itt, ttt, self.session.cmd_sn, true, Vec::new());
            let mut next = self.new_pdu(out, Some(opcode::TEXT_RESPONSE), 0)?;
            next.cmd_sn = self.session.cmd_sn;
            next.indata = std::mem::take(&mut pdu.indata);
            if let Some(tx) = pdu.take_completion() {
                next.set_completion(tx);
            }
            self.queue_pdu(next)?;
            return Ok(true);
        }

        match parse_discovery_data(&pdu.indata) {
            Ok(targets) => {
                debug!("Discovered {} targets", targets.len());
                pdu.complete(Outcome::new(CommandStatus::Good, Reply::Discovery(targets)));
            }
            Err(e) => {
                error!("{}", e);
                pdu.complete_with_status(CommandStatus::Error);
            }
        }
        Ok(true)
    }

    /// Close the session
    pub fn logout(&mut self) -> ScsiResult<TaskHandle> {
        if !self.session.is_logged_in() {
            return Err(IscsiError::Session("Trying to logout while not logged in".to_string()));
        }

        let itt = self.queues.allocate_itt()?;
        let out = IscsiPdu::logout_request(itt, 0, self.session.cid, self.session.cmd_sn);

        let (tx, rx) = completion_channel();
        let mut pdu = self.new_pdu(out, Some(opcode::LOGOUT_RESPONSE), 0)?;
        pdu.cmd_sn = self.session.cmd_sn;
        pdu.set_completion(tx);
        self.queue_pdu(pdu)?;
        self.session.state = SessionState::Logout;
        Ok(TaskHandle::new(itt, self.session.cmd_sn, 0, rx))
    }

    pub(crate) fn process_logout_response(&mut self, pdu: &mut Pdu, rsp: &IscsiPdu) -> ScsiResult<bool> {
        self.session.update_stat_sn(rsp.stat_sn());
        if rsp.response() != 0 {
            warn!("Logout response 0x{:02x}", rsp.response());
        }
        self.session.state = SessionState::Free;
        info!("Logged out from {}", self.portal);
        pdu.complete(Outcome::new(CommandStatus::Good, Reply::Logout));
        Ok(true)
    }
}
