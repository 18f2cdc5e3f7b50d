//! Device identities and the directory they live in.
//!
//! Devices are provisioned by an external workflow; this core consumes them
//! read-only except for heartbeat updates to `last_seen`. Provisioning input
//! arrives as a flat field map and is decoded against a closed set of named
//! fields: unknown keys are rejected rather than silently accepted.

use crate::error::{GatewayError, GatewayResult};
use crate::store::Db;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use thiserror::Error;

/// A field-installed telemetry source.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIdentity {
    /// Stable, externally assigned identifier.
    pub device_id: String,
    /// Reference code of the owning installation (POD code).
    pub pod_code: Option<String>,
    /// Declared vendor class, e.g. "shelly_em3".
    pub vendor: String,
    /// Explicit topic template; when present, the device's namespace is the
    /// template with everything from the first "/status" segment stripped.
    pub topic_template: Option<String>,
    /// Opt-in legacy rule: permit any topic containing the installation's
    /// POD code. Off by default for new devices.
    pub legacy_pod_topics: bool,
    pub is_active: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Provisioning field errors.
#[derive(Debug, Error, PartialEq)]
pub enum DeviceFieldError {
    #[error("device ID cannot be empty")]
    EmptyDeviceId,
    #[error("device ID contains invalid character: '{0}'")]
    InvalidDeviceIdChar(char),
    #[error("unknown provisioning field: '{0}'")]
    UnknownField(String),
    #[error("missing required field: '{0}'")]
    MissingField(String),
    #[error("invalid value for field '{field}': '{value}'")]
    InvalidValue { field: String, value: String },
}

/// Device identifiers are restricted to `[A-Za-z0-9._-]+`, the character set
/// safe for both topic segments and derived usernames.
pub fn validate_device_id(device_id: &str) -> Result<(), DeviceFieldError> {
    if device_id.is_empty() {
        return Err(DeviceFieldError::EmptyDeviceId);
    }
    for ch in device_id.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(DeviceFieldError::InvalidDeviceIdChar(ch));
        }
    }
    Ok(())
}

impl DeviceIdentity {
    /// New active device with no template, no installation reference and the
    /// legacy fallback disabled.
    pub fn new(device_id: &str) -> Result<Self, DeviceFieldError> {
        validate_device_id(device_id)?;
        Ok(Self {
            device_id: device_id.to_string(),
            pod_code: None,
            vendor: String::new(),
            topic_template: None,
            legacy_pod_topics: false,
            is_active: true,
            last_seen: None,
        })
    }

    /// Decode a provisioning field map. Only the closed set of named fields
    /// is accepted; anything else fails the whole record.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, DeviceFieldError> {
        let device_id = fields
            .get("device_id")
            .ok_or_else(|| DeviceFieldError::MissingField("device_id".to_string()))?;
        let mut device = Self::new(device_id)?;

        for (key, value) in fields {
            match key.as_str() {
                "device_id" => {}
                "pod_code" => device.pod_code = Some(value.clone()),
                "vendor" => device.vendor = value.clone(),
                "topic_template" => device.topic_template = Some(value.clone()),
                "legacy_pod_topics" => device.legacy_pod_topics = parse_flag(key, value)?,
                "is_active" => device.is_active = parse_flag(key, value)?,
                _ => return Err(DeviceFieldError::UnknownField(key.clone())),
            }
        }

        Ok(device)
    }
}

fn parse_flag(field: &str, value: &str) -> Result<bool, DeviceFieldError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(DeviceFieldError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Read-mostly directory of provisioned devices.
#[derive(Clone)]
pub struct DeviceDirectory {
    db: Db,
}

impl DeviceDirectory {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Insert or update a device identity. `last_seen` is owned by the
    /// heartbeat path and is left untouched on update.
    pub fn upsert(&self, device: &DeviceIdentity) -> GatewayResult<()> {
        validate_device_id(&device.device_id)?;
        self.db.lock().execute(
            "INSERT INTO devices (device_id, pod_code, vendor, topic_template, legacy_pod_topics, is_active) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(device_id) DO UPDATE SET \
                 pod_code = excluded.pod_code, \
                 vendor = excluded.vendor, \
                 topic_template = excluded.topic_template, \
                 legacy_pod_topics = excluded.legacy_pod_topics, \
                 is_active = excluded.is_active",
            params![
                device.device_id,
                device.pod_code,
                device.vendor,
                device.topic_template,
                device.legacy_pod_topics as i64,
                device.is_active as i64,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, device_id: &str) -> GatewayResult<Option<DeviceIdentity>> {
        let row = self
            .db
            .lock()
            .query_row(
                "SELECT device_id, pod_code, vendor, topic_template, legacy_pod_topics, is_active, last_seen \
                 FROM devices WHERE device_id = ?1",
                [device_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, Option<i64>>(6)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.map(
            |(device_id, pod_code, vendor, topic_template, legacy, active, last_seen)| {
                DeviceIdentity {
                    device_id,
                    pod_code,
                    vendor,
                    topic_template,
                    legacy_pod_topics: legacy != 0,
                    is_active: active != 0,
                    last_seen: last_seen
                        .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
                }
            },
        ))
    }

    /// Record a heartbeat, updating the device's last-seen timestamp.
    pub fn record_heartbeat(&self, device_id: &str, at: DateTime<Utc>) -> GatewayResult<()> {
        let updated = self.db.lock().execute(
            "UPDATE devices SET last_seen = ?1 WHERE device_id = ?2",
            params![at.timestamp_millis(), device_id],
        )?;
        if updated == 0 {
            return Err(GatewayError::UnknownDevice {
                device_id: device_id.to_string(),
            });
        }
        Ok(())
    }

    /// Count of active devices seen at or after `cutoff`.
    pub fn active_since(&self, cutoff: DateTime<Utc>) -> GatewayResult<u32> {
        let count: i64 = self.db.lock().query_row(
            "SELECT COUNT(*) FROM devices WHERE is_active = 1 AND last_seen >= ?1",
            [cutoff.timestamp_millis()],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }
}
