//! Bounded-duration broker connectivity probe.
//!
//! A probe performs one real MQTT CONNECT against the given broker, with the
//! configured credentials and transport security, and disconnects as soon as
//! the broker acknowledges. The whole attempt races a timer: when the timer
//! wins, the connect future is dropped, not awaited, so a hung network never
//! holds the supervisor. The probe never mutates the broker registry.

use crate::broker::BrokerConfig;
use chrono::{DateTime, Utc};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, MqttOptions, Packet,
    Transport as MqttTransport,
};
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

/// Cause of a failed probe attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeFailure {
    /// The attempt exceeded its wall-clock bound.
    Timeout,
    /// The endpoint actively refused the connection.
    ConnectionRefused,
    /// The broker rejected the configured credentials.
    AuthRejected,
    /// TLS negotiation failed.
    TlsError,
    /// Any other transport-level failure.
    Transport(String),
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeFailure::Timeout => write!(f, "timeout"),
            ProbeFailure::ConnectionRefused => write!(f, "connection refused"),
            ProbeFailure::AuthRejected => write!(f, "authentication rejected"),
            ProbeFailure::TlsError => write!(f, "TLS negotiation failed"),
            ProbeFailure::Transport(detail) => write!(f, "transport error: {detail}"),
        }
    }
}

/// Outcome of a single probe attempt. Transient: nothing is persisted beyond
/// the verdict the health aggregator retains.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectivityVerdict {
    pub attempted_at: DateTime<Utc>,
    pub success: bool,
    pub latency_ms: u64,
    pub error: Option<ProbeFailure>,
}

/// Probe the broker, bounded by `timeout` regardless of network behavior.
pub async fn probe(config: &BrokerConfig, timeout: Duration) -> ConnectivityVerdict {
    let attempted_at = Utc::now();
    let started = Instant::now();

    let outcome = tokio::time::timeout(timeout, attempt_connect(config)).await;
    let (success, error) = match outcome {
        Ok(Ok(())) => (true, None),
        Ok(Err(cause)) => (false, Some(cause)),
        Err(_elapsed) => (false, Some(ProbeFailure::Timeout)),
    };

    let verdict = ConnectivityVerdict {
        attempted_at,
        success,
        latency_ms: started.elapsed().as_millis() as u64,
        error,
    };
    debug!(
        host = %config.host,
        port = config.port,
        success = verdict.success,
        latency_ms = verdict.latency_ms,
        "probe finished"
    );
    verdict
}

async fn attempt_connect(config: &BrokerConfig) -> Result<(), ProbeFailure> {
    let client_id = format!("fleetgate-probe-{}", Utc::now().timestamp_millis());
    let mut options = MqttOptions::new(client_id, &config.host, config.port);
    options.set_keep_alive(Duration::from_secs(10));
    if let Some(username) = &config.username {
        options.set_credentials(username, config.password.clone().unwrap_or_default());
    }
    if config.use_tls {
        options.set_transport(MqttTransport::tls_with_default_config());
    }

    let (client, mut event_loop) = AsyncClient::new(options, 4);
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                let result = match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
                        Err(ProbeFailure::AuthRejected)
                    }
                    other => Err(ProbeFailure::Transport(format!(
                        "connect rejected: {other:?}"
                    ))),
                };
                let _ = client.disconnect().await;
                return result;
            }
            Ok(_) => continue,
            Err(e) => return Err(classify_error(e)),
        }
    }
}

fn classify_error(err: ConnectionError) -> ProbeFailure {
    match err {
        ConnectionError::Io(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            ProbeFailure::ConnectionRefused
        }
        ConnectionError::Tls(_) => ProbeFailure::TlsError,
        ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
                ProbeFailure::AuthRejected
            }
            _ => ProbeFailure::ConnectionRefused,
        },
        other => ProbeFailure::Transport(other.to_string()),
    }
}
