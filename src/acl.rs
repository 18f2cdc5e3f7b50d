//! Topic-scoped authorization for broker access callbacks.
//!
//! The broker invokes [`TopicAuthorizer::authorize`] for every subscribe and
//! publish attempt. The decision is always definite: internal failures of any
//! kind collapse to deny, never to an error on the message-routing path.

use crate::credentials::CredentialStore;
use crate::device::DeviceDirectory;
use crate::error::redact_secrets;
use crate::topics::{canonicalize_topic, resolve_namespace};
use tracing::{debug, warn};

/// Requested broker operation. Both operations currently share the same
/// namespace test; the distinction is carried for future per-operation
/// tightening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Subscribe,
    Publish,
}

impl AccessType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "subscribe" | "read" => Some(AccessType::Subscribe),
            "publish" | "write" => Some(AccessType::Publish),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccessType::Subscribe => "subscribe",
            AccessType::Publish => "publish",
        }
    }
}

/// Authorization verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Allow,
    Deny,
}

impl Access {
    pub fn is_allowed(self) -> bool {
        self == Access::Allow
    }
}

pub struct TopicAuthorizer {
    credentials: CredentialStore,
    devices: DeviceDirectory,
}

impl TopicAuthorizer {
    pub fn new(credentials: CredentialStore, devices: DeviceDirectory) -> Self {
        Self {
            credentials,
            devices,
        }
    }

    /// Decide access for a presented username, topic and operation.
    ///
    /// Allow iff the topic begins with the device's resolved namespace
    /// prefix, or, when the device has opted into the legacy rule, the topic
    /// contains the installation's POD code anywhere.
    ///
    /// The prefix test is a raw string comparison with no segment-boundary
    /// check, so namespace `a/b/dev-1` also admits `a/b/dev-12/...`.
    /// Provisioning keeps device identifiers from being prefixes of each
    /// other when that matters.
    pub fn authorize(&self, username: &str, topic: &str, access: AccessType) -> Access {
        let device_id = match self.credentials.device_for_username(username) {
            Ok(Some(device_id)) => device_id,
            Ok(None) => {
                debug!(username, access = access.as_str(), "no active credential, denying");
                return Access::Deny;
            }
            Err(e) => {
                warn!(username, error = %redact_secrets(&e.to_string()), "credential lookup failed, denying");
                return Access::Deny;
            }
        };

        let device = match self.devices.get(&device_id) {
            Ok(Some(device)) if device.is_active => device,
            Ok(_) => {
                debug!(device_id = %device_id, "device missing or inactive, denying");
                return Access::Deny;
            }
            Err(e) => {
                warn!(device_id = %device_id, error = %redact_secrets(&e.to_string()), "device lookup failed, denying");
                return Access::Deny;
            }
        };

        let namespace = match resolve_namespace(&device) {
            Ok(namespace) => namespace,
            Err(e) => {
                // Surfaced for operator follow-up, never silently widened
                warn!(device_id = %device_id, error = %e, "namespace undetermined, denying");
                return Access::Deny;
            }
        };

        let topic = canonicalize_topic(topic);
        if topic.starts_with(&namespace) {
            return Access::Allow;
        }

        if device.legacy_pod_topics {
            if let Some(pod_code) = device.pod_code.as_deref().filter(|p| !p.is_empty()) {
                if topic.contains(pod_code) {
                    debug!(device_id = %device_id, topic = %topic, "allowed via legacy POD-code rule");
                    return Access::Allow;
                }
            }
        }

        debug!(
            device_id = %device_id,
            topic = %topic,
            namespace = %namespace,
            access = access.as_str(),
            "topic outside device namespace, denying"
        );
        Access::Deny
    }
}
