//! CHAP (Challenge-Handshake Authentication Protocol) for the initiator
//!
//! RFC 3720 Section 8.2 - CHAP Algorithm. The initiator answers the
//! target's challenge and, with mutual CHAP, challenges the target back.

use crate::error::{IscsiError, ScsiResult};
use crate::session::with_rng;
use rand::Rng;

/// CHAP algorithm identifier (RFC 1994)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChapAlgorithm {
    /// MD5 algorithm (algorithm identifier 5)
    Md5 = 5,
}

impl ChapAlgorithm {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "5" => Some(ChapAlgorithm::Md5),
            _ => None,
        }
    }
}

/// CHAP username and secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapCredentials {
    pub username: String,
    pub secret: String,
}

impl ChapCredentials {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AuthConfig {
    /// No authentication
    #[default]
    None,
    /// One-way CHAP: the initiator proves its identity to the target
    Chap {
        credentials: ChapCredentials,
    },
    /// Mutual CHAP: the target must also prove its identity
    MutualChap {
        /// What the initiator answers the target's challenge with
        credentials: ChapCredentials,
        /// What the target must answer the initiator's challenge with
        target_credentials: ChapCredentials,
    },
}

impl AuthConfig {
    /// Check if authentication is required
    pub fn requires_auth(&self) -> bool {
        !matches!(self, AuthConfig::None)
    }

    /// Get the authentication method string
    pub fn auth_method(&self) -> &str {
        match self {
            AuthConfig::None => "None",
            AuthConfig::Chap { .. } | AuthConfig::MutualChap { .. } => "CHAP",
        }
    }

    /// Check if mutual CHAP is required
    pub fn is_mutual(&self) -> bool {
        matches!(self, AuthConfig::MutualChap { .. })
    }

    /// Credentials the initiator authenticates with
    pub fn credentials(&self) -> Option<&ChapCredentials> {
        match self {
            AuthConfig::None => None,
            AuthConfig::Chap { credentials } | AuthConfig::MutualChap { credentials, .. } => {
                Some(credentials)
            }
        }
    }

    /// Credentials the target must authenticate with
    pub fn target_credentials(&self) -> Option<&ChapCredentials> {
        match self {
            AuthConfig::MutualChap {
                target_credentials, ..
            } => Some(target_credentials),
            _ => None,
        }
    }
}

/// Response = MD5(identifier + secret + challenge)
pub fn calculate_response(identifier: u8, secret: &str, challenge: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(1 + secret.len() + challenge.len());
    data.push(identifier);
    data.extend_from_slice(secret.as_bytes());
    data.extend_from_slice(challenge);

    md5::compute(&data).0.to_vec()
}

/// Value of the CHAP_R key answering a target challenge
pub fn chap_response_value(identifier: u8, secret: &str, challenge: &[u8]) -> String {
    format!(
        "0x{}",
        hex::encode_upper(calculate_response(identifier, secret, challenge))
    )
}

/// Decode a CHAP hex value ("0x" prefixed, either case)
pub fn parse_chap_hex(value: &str) -> ScsiResult<Vec<u8>> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .ok_or_else(|| IscsiError::Auth(format!("CHAP value without 0x prefix: {}", value)))?;
    hex::decode(digits).map_err(|e| IscsiError::Auth(format!("Invalid CHAP hex value: {}", e)))
}

/// Challenge sent to the target for mutual CHAP
#[derive(Debug, Clone)]
pub struct ChapChallenge {
    /// CHAP identifier (random byte)
    pub identifier: u8,
    /// CHAP challenge (random bytes)
    pub challenge: Vec<u8>,
}

impl ChapChallenge {
    /// Generate a new CHAP challenge
    pub fn new() -> Self {
        let (identifier, challenge) = with_rng(|rng| {
            let mut challenge = vec![0u8; 16];
            rng.fill(&mut challenge[..]);
            (rng.gen::<u8>(), challenge)
        });

        Self {
            identifier,
            challenge,
        }
    }

    /// Validate the target's CHAP response
    pub fn validate_response(&self, response: &[u8], secret: &str) -> bool {
        let expected = calculate_response(self.identifier, secret, &self.challenge);

        // Constant-time comparison to prevent timing attacks
        if response.len() != expected.len() {
            return false;
        }

        let mut diff = 0u8;
        for (a, b) in response.iter().zip(expected.iter()) {
            diff |= a ^ b;
        }

        diff == 0
    }

    /// Challenge as the value of the CHAP_C key
    pub fn challenge_value(&self) -> String {
        format!("0x{}", hex::encode_upper(&self.challenge))
    }

    /// Identifier as the value of the CHAP_I key
    pub fn identifier_str(&self) -> String {
        self.identifier.to_string()
    }
}

impl Default for ChapChallenge {
    fn default() -> Self {
        Self::new()
    }
}
