//! Topic canonicalization and per-device namespace resolution.
//!
//! A device's namespace is the topic prefix it is confined to. It comes from
//! the device's explicit topic template with everything from the first
//! "/status" segment stripped, or, failing that, from a vendor/installation
//! composition. A device with neither source has no governable namespace and
//! resolution fails loudly instead of defaulting.

use crate::device::DeviceIdentity;
use thiserror::Error;

/// Reserved operational segment: templates carry it, namespaces do not.
pub const STATUS_SEGMENT: &str = "/status";

/// Canonical topic form: no empty segments, no leading or trailing slash.
/// Device telemetry topics in this fleet are rooted at the vendor or template
/// prefix, not at "/".
pub fn canonicalize_topic(topic: &str) -> String {
    let mut result = topic.to_string();

    while result.contains("//") {
        result = result.replace("//", "/");
    }

    result.trim_matches('/').to_string()
}

/// Namespace resolution errors
#[derive(Debug, Error, PartialEq)]
pub enum NamespaceError {
    #[error("device '{0}' has no topic template and no installation POD code")]
    Undetermined(String),
}

/// Vendor class for topic composition: the declared vendor with separator
/// characters removed ("shelly_em3" -> "shellyem3").
pub fn vendor_class(vendor: &str) -> String {
    vendor.chars().filter(|c| *c != '_' && *c != '-').collect()
}

/// Resolve the exclusive topic-namespace prefix for a device.
pub fn resolve_namespace(device: &DeviceIdentity) -> Result<String, NamespaceError> {
    if let Some(template) = &device.topic_template {
        let base = match template.find(STATUS_SEGMENT) {
            Some(index) => &template[..index],
            None => template.as_str(),
        };
        let base = canonicalize_topic(base);
        if !base.is_empty() {
            return Ok(base);
        }
    }

    if let Some(pod_code) = device.pod_code.as_deref().filter(|p| !p.is_empty()) {
        return Ok(canonicalize_topic(&format!(
            "{}/{}/{}",
            vendor_class(&device.vendor),
            pod_code,
            device.device_id
        )));
    }

    Err(NamespaceError::Undetermined(device.device_id.clone()))
}
