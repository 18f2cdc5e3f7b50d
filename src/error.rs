//! Crate-wide error taxonomy.
//!
//! Authorization decisions never travel as errors: the ACL path returns a
//! definite allow/deny and absorbs internal failures as deny. Everything that
//! reaches a calling workflow (issuance, registry mutation, configuration)
//! does so through [`GatewayError`].

use thiserror::Error;

/// Main error type for credential, registry and provisioning operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The OS random source could not be read. Fatal to issuance: weaker
    /// fallback randomness is never substituted.
    #[error("secure random source unavailable")]
    EntropyUnavailable(#[source] rand::Error),

    /// An issuance race was detected by the store's one-active-per-device
    /// constraint. Retried internally before being surfaced.
    #[error("credential issuance conflict for device '{device_id}'")]
    CredentialConflict { device_id: String },

    /// Revocation targeted a device with no active credential.
    #[error("no active credential on record for device '{device_id}'")]
    CredentialNotFound { device_id: String },

    /// The referenced device identity does not exist in the directory.
    #[error("unknown device '{device_id}'")]
    UnknownDevice { device_id: String },

    #[error("namespace resolution failed: {0}")]
    Namespace(#[from] crate::topics::NamespaceError),

    #[error("invalid provisioning data: {0}")]
    DeviceField(#[from] crate::device::DeviceFieldError),

    #[error("no active broker configured")]
    NoActiveBroker,

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Scrub credential material from error text before it reaches a log line.
pub fn redact_secrets(message: &str) -> String {
    let mut redacted = regex::Regex::new(r"(?i)(password|secret|token|key)[=:]\s*\S+")
        .unwrap()
        .replace_all(message, "${1}=***")
        .to_string();

    // Keep log lines bounded even when a transport error embeds a payload
    if redacted.len() > 500 {
        let truncate_suffix = "...[truncated]";
        let mut max_content_len = 500 - truncate_suffix.len();
        while !redacted.is_char_boundary(max_content_len) {
            max_content_len -= 1;
        }
        redacted = format!("{}{}", &redacted[..max_content_len], truncate_suffix);
    }

    redacted
}
