//! fleetgate - device credential and broker supervision core
//!
//! fleetgate governs which field-installed telemetry devices may connect to an
//! energy community's shared MQTT broker and which topics each device may read
//! or write. It covers:
//!
//! - Per-device credential issuance, rotation and revocation, with secrets
//!   persisted only as digests
//! - Topic-scoped authorization callbacks at message-routing granularity
//! - A registry enforcing the single-active-broker invariant
//! - Bounded-duration connectivity probing and fleet health aggregation
//!
//! # Quick Start
//!
//! ```rust
//! use fleetgate::{Access, AccessType, CredentialStore, DeviceDirectory, DeviceIdentity};
//! use fleetgate::{Db, TopicAuthorizer};
//!
//! let db = Db::open_in_memory().unwrap();
//! let devices = DeviceDirectory::new(db.clone());
//! let credentials = CredentialStore::new(db, 16);
//!
//! let mut device = DeviceIdentity::new("demo-3em-001").unwrap();
//! device.topic_template = Some("fleet/POD123/demo-3em-001".to_string());
//! devices.upsert(&device).unwrap();
//!
//! let issued = credentials.issue("demo-3em-001").unwrap();
//! assert!(credentials.validate(&issued.username, &issued.secret));
//!
//! let authorizer = TopicAuthorizer::new(credentials, devices);
//! let access = authorizer.authorize(
//!     &issued.username,
//!     "fleet/POD123/demo-3em-001/status/em:0",
//!     AccessType::Publish,
//! );
//! assert_eq!(access, Access::Allow);
//! ```

pub mod acl;
pub mod broker;
pub mod config;
pub mod credentials;
pub mod device;
pub mod error;
pub mod health;
pub mod logging;
pub mod probe;
pub mod secret;
pub mod store;
pub mod topics;

pub use acl::{Access, AccessType, TopicAuthorizer};
pub use broker::{BrokerConfig, BrokerRegistry};
pub use config::{ConfigError, GatewayConfig};
pub use credentials::{CredentialStore, IssuedCredential};
pub use device::{DeviceDirectory, DeviceIdentity};
pub use error::{GatewayError, GatewayResult};
pub use health::{HealthAggregator, HealthReport, HealthStatus};
pub use probe::{probe, ConnectivityVerdict, ProbeFailure};
pub use store::Db;
pub use topics::resolve_namespace;
