//! Per-device MQTT credential issuance, validation and revocation.
//!
//! Usernames are derived deterministically from the device identifier, so a
//! device's username is stable across rotations and unique without a lookup.
//! Secrets are persisted as SHA-256 digests only; the plaintext exists in the
//! issuance response and nowhere else. The one-active-credential-per-device
//! invariant is enforced by a partial unique index and a deactivate-then-
//! activate transaction.

use crate::error::{GatewayError, GatewayResult};
use crate::secret::generate_secret;
use crate::store::Db;
use chrono::Utc;
use rusqlite::{params, ErrorCode, OptionalExtension};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

/// Fixed username prefix: device `demo-3em-001` authenticates as
/// `dev_demo-3em-001`.
pub const USERNAME_PREFIX: &str = "dev_";

/// Conflicting transactions are retried this many times before the conflict
/// is surfaced to the caller.
const ISSUE_ATTEMPTS: u32 = 3;

/// Credential pair returned once at issuance time.
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedCredential {
    pub username: String,
    pub secret: String,
}

#[derive(Clone)]
pub struct CredentialStore {
    db: Db,
    secret_length: usize,
}

impl CredentialStore {
    pub fn new(db: Db, secret_length: usize) -> Self {
        Self { db, secret_length }
    }

    /// Deterministic username for a device.
    pub fn username_for(device_id: &str) -> String {
        format!("{USERNAME_PREFIX}{device_id}")
    }

    /// Issue a fresh credential for `device_id`, atomically deactivating any
    /// previous one. Returns the plaintext secret exactly once.
    pub fn issue(&self, device_id: &str) -> GatewayResult<IssuedCredential> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.try_issue(device_id) {
                Err(GatewayError::CredentialConflict { .. }) if attempts < ISSUE_ATTEMPTS => {
                    warn!(device_id, attempts, "issuance conflict, retrying");
                    continue;
                }
                other => return other,
            }
        }
    }

    fn try_issue(&self, device_id: &str) -> GatewayResult<IssuedCredential> {
        let secret = generate_secret(self.secret_length)?;
        let username = Self::username_for(device_id);
        let digest = secret_digest(&secret);
        let issued_at = Utc::now().to_rfc3339();

        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        let device_exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM devices WHERE device_id = ?1)",
            [device_id],
            |row| row.get(0),
        )?;
        if !device_exists {
            return Err(GatewayError::UnknownDevice {
                device_id: device_id.to_string(),
            });
        }

        tx.execute(
            "UPDATE credentials SET is_active = 0 WHERE device_id = ?1 AND is_active = 1",
            [device_id],
        )?;

        let inserted = tx.execute(
            "INSERT INTO credentials (device_id, username, secret_hash, is_active, issued_at) \
             VALUES (?1, ?2, ?3, 1, ?4)",
            params![device_id, username, digest, issued_at],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                return Err(GatewayError::CredentialConflict {
                    device_id: device_id.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        tx.commit()?;
        debug!(device_id, username = %username, "credential issued");
        Ok(IssuedCredential { username, secret })
    }

    /// True iff an active credential exists with exactly this username and
    /// secret. The digest comparison is constant-time; an unknown username is
    /// indistinguishable from a wrong secret to the caller.
    pub fn validate(&self, username: &str, secret: &str) -> bool {
        match self.active_digest(username) {
            Ok(Some(stored)) => {
                let presented = secret_digest(secret);
                stored.as_slice().ct_eq(presented.as_slice()).into()
            }
            Ok(None) => false,
            Err(e) => {
                warn!(username, error = %e, "credential lookup failed, failing closed");
                false
            }
        }
    }

    /// Device that owns the active credential with this username, if any.
    /// Single indexed lookup; sits on the authorization hot path.
    pub fn device_for_username(&self, username: &str) -> GatewayResult<Option<String>> {
        let device_id = self
            .db
            .lock()
            .query_row(
                "SELECT device_id FROM credentials WHERE username = ?1 AND is_active = 1",
                [username],
                |row| row.get(0),
            )
            .optional()?;
        Ok(device_id)
    }

    /// Mark the device's active credential inactive. Subsequent validation
    /// fails closed.
    pub fn revoke(&self, device_id: &str) -> GatewayResult<()> {
        let updated = self.db.lock().execute(
            "UPDATE credentials SET is_active = 0 WHERE device_id = ?1 AND is_active = 1",
            [device_id],
        )?;
        if updated == 0 {
            return Err(GatewayError::CredentialNotFound {
                device_id: device_id.to_string(),
            });
        }
        debug!(device_id, "credential revoked");
        Ok(())
    }

    fn active_digest(&self, username: &str) -> GatewayResult<Option<Vec<u8>>> {
        let digest = self
            .db
            .lock()
            .query_row(
                "SELECT secret_hash FROM credentials WHERE username = ?1 AND is_active = 1",
                [username],
                |row| row.get(0),
            )
            .optional()?;
        Ok(digest)
    }
}

fn secret_digest(secret: &str) -> Vec<u8> {
    Sha256::digest(secret.as_bytes()).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceDirectory, DeviceIdentity};

    fn store_with_device(device_id: &str) -> (CredentialStore, Db) {
        let db = Db::open_in_memory().unwrap();
        DeviceDirectory::new(db.clone())
            .upsert(&DeviceIdentity::new(device_id).unwrap())
            .unwrap();
        (CredentialStore::new(db.clone(), 16), db)
    }

    fn active_rows(db: &Db, device_id: &str) -> i64 {
        db.lock()
            .query_row(
                "SELECT COUNT(*) FROM credentials WHERE device_id = ?1 AND is_active = 1",
                [device_id],
                |row| row.get(0),
            )
            .unwrap()
    }

    #[test]
    fn test_issue_then_validate() {
        let (store, _db) = store_with_device("demo-3em-001");
        let issued = store.issue("demo-3em-001").unwrap();

        assert_eq!(issued.username, "dev_demo-3em-001");
        assert_eq!(issued.secret.len(), 16);
        assert!(store.validate(&issued.username, &issued.secret));
        assert!(!store.validate(&issued.username, "wrong-secret"));
    }

    #[test]
    fn test_rotation_invalidates_previous_secret_immediately() {
        let (store, db) = store_with_device("demo-3em-001");

        let first = store.issue("demo-3em-001").unwrap();
        let second = store.issue("demo-3em-001").unwrap();

        assert_ne!(first.secret, second.secret);
        assert!(!store.validate(&first.username, &first.secret));
        assert!(store.validate(&second.username, &second.secret));
        assert_eq!(active_rows(&db, "demo-3em-001"), 1);
    }

    #[test]
    fn test_repeated_issuance_keeps_exactly_one_active_row() {
        let (store, db) = store_with_device("demo-3em-001");
        for _ in 0..10 {
            store.issue("demo-3em-001").unwrap();
            assert_eq!(active_rows(&db, "demo-3em-001"), 1);
        }
        // History of superseded credentials is retained
        let total: i64 = db
            .lock()
            .query_row("SELECT COUNT(*) FROM credentials", [], |row| row.get(0))
            .unwrap();
        assert_eq!(total, 10);
    }

    #[test]
    fn test_concurrent_issuance_never_leaves_two_active_rows() {
        let (store, db) = store_with_device("demo-3em-001");
        store.issue("demo-3em-001").unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let db = db.clone();
            handles.push(std::thread::spawn(move || {
                let mut issued = Vec::new();
                for _ in 0..5 {
                    let credential = store.issue("demo-3em-001").unwrap();
                    store.validate(&credential.username, &credential.secret);
                    // Deactivate-then-insert is one transaction, so a racing
                    // reader must never observe zero or two active rows
                    assert_eq!(active_rows(&db, "demo-3em-001"), 1);
                    issued.push(credential);
                }
                issued
            }));
        }

        let mut all_issued = Vec::new();
        for handle in handles {
            all_issued.extend(handle.join().unwrap());
        }

        assert_eq!(all_issued.len(), 40);
        assert_eq!(active_rows(&db, "demo-3em-001"), 1);

        // Exactly the last-won secret still validates
        let valid = all_issued
            .iter()
            .filter(|c| store.validate(&c.username, &c.secret))
            .count();
        assert_eq!(valid, 1);
    }

    #[test]
    fn test_revoke_fails_validation_closed() {
        let (store, db) = store_with_device("demo-3em-001");
        let issued = store.issue("demo-3em-001").unwrap();

        store.revoke("demo-3em-001").unwrap();
        assert!(!store.validate(&issued.username, &issued.secret));
        assert_eq!(active_rows(&db, "demo-3em-001"), 0);

        // Second revoke has nothing left to deactivate
        let err = store.revoke("demo-3em-001").unwrap_err();
        assert!(matches!(err, GatewayError::CredentialNotFound { .. }));
    }

    #[test]
    fn test_issue_for_unknown_device_fails() {
        let db = Db::open_in_memory().unwrap();
        let store = CredentialStore::new(db, 16);
        let err = store.issue("ghost").unwrap_err();
        assert!(matches!(err, GatewayError::UnknownDevice { .. }));
    }

    #[test]
    fn test_unknown_username_validates_false_not_error() {
        let (store, _db) = store_with_device("demo-3em-001");
        assert!(!store.validate("dev_ghost", "anything"));
    }

    #[test]
    fn test_device_for_username_tracks_active_credential() {
        let (store, _db) = store_with_device("demo-3em-001");
        assert_eq!(store.device_for_username("dev_demo-3em-001").unwrap(), None);

        store.issue("demo-3em-001").unwrap();
        assert_eq!(
            store.device_for_username("dev_demo-3em-001").unwrap(),
            Some("demo-3em-001".to_string())
        );

        store.revoke("demo-3em-001").unwrap();
        assert_eq!(store.device_for_username("dev_demo-3em-001").unwrap(), None);
    }
}
