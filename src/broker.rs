//! Broker registry: the single authoritative MQTT broker configuration.
//!
//! At most one configuration is active at any moment. Activation deactivates
//! every other row inside one transaction, so a reader never observes zero or
//! two active brokers. Superseded configurations are retained for audit;
//! there is no delete.

use crate::error::GatewayResult;
use crate::store::Db;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use tracing::info;

/// One broker endpoint configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrokerConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub use_tls: bool,
}

#[derive(Clone)]
pub struct BrokerRegistry {
    db: Db,
}

impl BrokerRegistry {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Make `config` the single active broker. Re-activating an endpoint that
    /// already has a row updates that row in place, so the operation is
    /// idempotent under repeated identical input.
    pub fn set_active(&self, config: &BrokerConfig) -> GatewayResult<()> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "UPDATE brokers SET is_active = 0, updated_at = ?1 WHERE is_active = 1",
            [&now],
        )?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM brokers WHERE name = ?1 AND host = ?2 AND port = ?3 \
                 ORDER BY id DESC LIMIT 1",
                params![config.name, config.host, config.port],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(id) => {
                tx.execute(
                    "UPDATE brokers SET username = ?1, password = ?2, use_tls = ?3, \
                     is_active = 1, updated_at = ?4 WHERE id = ?5",
                    params![
                        config.username,
                        config.password,
                        config.use_tls as i64,
                        now,
                        id
                    ],
                )?;
            }
            None => {
                tx.execute(
                    "INSERT INTO brokers (name, host, port, username, password, use_tls, is_active, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?7)",
                    params![
                        config.name,
                        config.host,
                        config.port,
                        config.username,
                        config.password,
                        config.use_tls as i64,
                        now
                    ],
                )?;
            }
        }

        tx.commit()?;
        info!(
            name = %config.name,
            host = %config.host,
            port = config.port,
            use_tls = config.use_tls,
            "active broker set"
        );
        Ok(())
    }

    /// The currently authoritative broker, if one is configured.
    pub fn get_active(&self) -> GatewayResult<Option<BrokerConfig>> {
        let config = self
            .db
            .lock()
            .query_row(
                "SELECT name, host, port, username, password, use_tls \
                 FROM brokers WHERE is_active = 1",
                [],
                row_to_config,
            )
            .optional()?;
        Ok(config)
    }

    /// All configurations ever activated, active flag included, for audit.
    pub fn history(&self) -> GatewayResult<Vec<(BrokerConfig, bool)>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT name, host, port, username, password, use_tls, is_active \
             FROM brokers ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row_to_config(row)?, row.get::<_, i64>(6)? != 0))
        })?;
        let mut history = Vec::new();
        for row in rows {
            history.push(row?);
        }
        Ok(history)
    }
}

fn row_to_config(row: &rusqlite::Row<'_>) -> rusqlite::Result<BrokerConfig> {
    Ok(BrokerConfig {
        name: row.get(0)?,
        host: row.get(1)?,
        port: row.get::<_, i64>(2)? as u16,
        username: row.get(3)?,
        password: row.get(4)?,
        use_tls: row.get::<_, i64>(5)? != 0,
    })
}
