//! Error types for iSCSI initiator operations

use thiserror::Error;

/// iSCSI initiator errors
#[derive(Debug, Error)]
pub enum IscsiError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("SCSI error: {0}")]
    Scsi(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Invalid PDU: {0}")]
    InvalidPdu(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Not logged in")]
    NotLoggedIn,

    #[error("Wrong session type: {0}")]
    WrongSessionType(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Task cancelled")]
    Cancelled,

    #[error("Timed out: {0}")]
    Timeout(String),
}

/// Result type for SCSI operations
pub type ScsiResult<T> = Result<T, IscsiError>;

/// Turn a login Status-Class / Status-Detail pair (RFC 3720 Section 10.13.5)
/// into a message the user can act on.
pub fn decode_login_status(status_class: u8, status_detail: u8) -> String {
    match (status_class, status_detail) {
        (0x00, _) => "Login success".to_string(),
        (0x01, 0x01) => {
            "Target moved temporarily: retry the login against the portal given in TargetAddress"
                .to_string()
        }
        (0x01, 0x02) => {
            "Target moved permanently: update the portal in your configuration to the new TargetAddress"
                .to_string()
        }
        (0x01, d) => format!("Target redirection (detail 0x{:02x})", d),
        (0x02, 0x00) => "Initiator error: the target rejected the login request".to_string(),
        (0x02, 0x01) => {
            "Authentication failed: check the CHAP username and password configured for this initiator"
                .to_string()
        }
        (0x02, 0x02) => {
            "Authorization failure: the initiator is not in the target ACL \
             (e.g. tgtadm --op bind --mode target --initiator-address ...)"
                .to_string()
        }
        (0x02, 0x03) => {
            "Target not found: the requested TargetName doesn't exist, run discovery to list targets"
                .to_string()
        }
        (0x02, 0x04) => "Target removed: the target has been removed and is no longer available".to_string(),
        (0x02, 0x05) => "Unsupported version: the target does not support this iSCSI version".to_string(),
        (0x02, 0x06) => {
            "Too many connections: the session already has the maximum allowed (MaxConnections)"
                .to_string()
        }
        (0x02, 0x07) => {
            "Missing parameter: a required login key was not sent (InitiatorName, TargetName)"
                .to_string()
        }
        (0x02, 0x08) => "Can't include in session: the connection cannot join this session".to_string(),
        (0x02, 0x09) => "Session type not supported by the target".to_string(),
        (0x02, 0x0a) => "Session does not exist: the TSIH used for the login is unknown".to_string(),
        (0x02, 0x0b) => "Invalid request during login".to_string(),
        (0x02, d) => format!("Initiator error (detail 0x{:02x})", d),
        (0x03, 0x00) => "Target error: the target hit an internal error during login".to_string(),
        (0x03, 0x01) => "Service unavailable: the target is temporarily unable to accept logins".to_string(),
        (0x03, 0x02) => "Out of resources: the target could not allocate resources for the session".to_string(),
        (0x03, d) => format!("Target error (detail 0x{:02x})", d),
        (c, d) => format!("Unknown login status class 0x{:02x} detail 0x{:02x}", c, d),
    }
}
