//! End-to-end flows across the credential store, authorizer, broker registry
//! and probe, running against an on-disk database the way a deployment does.

use fleetgate::{
    probe, Access, AccessType, BrokerConfig, BrokerRegistry, CredentialStore, Db, DeviceDirectory,
    DeviceIdentity, TopicAuthorizer,
};
use std::time::Duration;
use tempfile::TempDir;

struct Gateway {
    _dir: TempDir,
    path: String,
    devices: DeviceDirectory,
    credentials: CredentialStore,
    registry: BrokerRegistry,
}

fn gateway() -> Gateway {
    let dir = TempDir::new().unwrap();
    let path = dir
        .path()
        .join("gateway.db")
        .to_string_lossy()
        .into_owned();
    let db = Db::open(&path).unwrap();
    Gateway {
        _dir: dir,
        path,
        devices: DeviceDirectory::new(db.clone()),
        credentials: CredentialStore::new(db.clone(), 16),
        registry: BrokerRegistry::new(db),
    }
}

fn demo_device() -> DeviceIdentity {
    let mut device = DeviceIdentity::new("demo-3em-001").unwrap();
    device.topic_template = Some("fleet/POD123/demo-3em-001".to_string());
    device.pod_code = Some("POD123".to_string());
    device.vendor = "shelly_em3".to_string();
    device
}

#[test]
fn issue_then_authorize_within_and_outside_namespace() {
    let gw = gateway();
    gw.devices.upsert(&demo_device()).unwrap();

    let issued = gw.credentials.issue("demo-3em-001").unwrap();
    assert_eq!(issued.username, "dev_demo-3em-001");
    assert!(gw.credentials.validate(&issued.username, &issued.secret));

    let authorizer = TopicAuthorizer::new(gw.credentials.clone(), gw.devices.clone());
    assert_eq!(
        authorizer.authorize(
            "dev_demo-3em-001",
            "fleet/POD123/demo-3em-001/status/em:0",
            AccessType::Publish
        ),
        Access::Allow
    );
    assert_eq!(
        authorizer.authorize(
            "dev_demo-3em-001",
            "fleet/POD999/other/status/em:0",
            AccessType::Publish
        ),
        Access::Deny
    );
}

#[test]
fn rotation_cuts_over_with_no_grace_period() {
    let gw = gateway();
    gw.devices.upsert(&demo_device()).unwrap();

    let first = gw.credentials.issue("demo-3em-001").unwrap();
    let second = gw.credentials.issue("demo-3em-001").unwrap();

    assert_ne!(first.secret, second.secret);
    assert!(!gw.credentials.validate(&first.username, &first.secret));
    assert!(gw.credentials.validate(&second.username, &second.secret));
}

#[test]
fn credentials_survive_process_restart() {
    let gw = gateway();
    gw.devices.upsert(&demo_device()).unwrap();
    let issued = gw.credentials.issue("demo-3em-001").unwrap();

    // Reopen the same database file, as a fresh process would
    let reopened = Db::open(&gw.path).unwrap();
    let credentials = CredentialStore::new(reopened.clone(), 16);
    let devices = DeviceDirectory::new(reopened);

    assert!(credentials.validate(&issued.username, &issued.secret));
    let authorizer = TopicAuthorizer::new(credentials, devices);
    assert_eq!(
        authorizer.authorize(
            &issued.username,
            "fleet/POD123/demo-3em-001/events",
            AccessType::Subscribe
        ),
        Access::Allow
    );
}

#[test]
fn broker_switchover_retains_audit_history() {
    let gw = gateway();
    let a = BrokerConfig {
        name: "site-a".to_string(),
        host: "broker-a.example.org".to_string(),
        port: 1883,
        username: None,
        password: None,
        use_tls: false,
    };
    let mut b = a.clone();
    b.name = "site-b".to_string();
    b.host = "broker-b.example.org".to_string();
    b.use_tls = true;

    gw.registry.set_active(&a).unwrap();
    gw.registry.set_active(&b).unwrap();
    gw.registry.set_active(&b).unwrap();

    let active = gw.registry.get_active().unwrap().unwrap();
    assert_eq!(active.host, "broker-b.example.org");
    assert!(active.use_tls);

    let history = gw.registry.history().unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().any(|(c, active)| c.name == "site-a" && !active));
}

#[tokio::test]
async fn probe_verdict_is_bounded_and_cause_coded() {
    // No listener: refused immediately, well inside the bound
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let config = BrokerConfig {
        name: "probe-target".to_string(),
        host: "127.0.0.1".to_string(),
        port,
        username: None,
        password: None,
        use_tls: false,
    };

    let started = std::time::Instant::now();
    let verdict = probe(&config, Duration::from_secs(2)).await;
    assert!(!verdict.success);
    assert!(verdict.error.is_some());
    assert!(started.elapsed() < Duration::from_secs(2));
}
