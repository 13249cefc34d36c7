//! SQLite-backed store implementation.

use beacon_types::{
    ClientId, EventId, EventInstance, EventKind, InstanceId, SiteId, SiteKind, UserKind,
};
use rusqlite::{params, OptionalExtension, Row};

use crate::pool::DbPool;
use crate::{AccountCredentials, AddOutcome, NewSubscription, Store, StoreError, SubscriptionRow};

/// Production store: SQLite in WAL mode behind an `r2d2` pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Inserts an account row. Used by provisioning tooling and tests;
    /// account CRUD is not part of the core store contract.
    pub fn insert_account(
        &self,
        client_key: &str,
        creds: &AccountCredentials,
    ) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO accounts (
                client_key, site_id, user_id, user_kind, site_kind, salt, salted_password
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                client_key,
                creds.site_id as i64,
                creds.user_id as i64,
                creds.user_kind.as_u8(),
                creds.site_kind.as_u8(),
                creds.salt,
                creds.salted_password,
            ],
        )?;
        Ok(())
    }

    /// Persists an event instance with its argument payload. Used by the
    /// producer-side plumbing and tests.
    pub fn insert_instance(&self, instance: &EventInstance) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO event_instances (
                instance_id, event_id, service_id, created_tick, created_at, is_null, arguments
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                instance.instance_id as i64,
                instance.event_id,
                instance.service_id,
                instance.created_tick as i64,
                instance.created_at,
                instance.is_null,
                instance.arguments,
            ],
        )?;
        Ok(())
    }

    /// Drops the argument blob of an instance, simulating cache/payload
    /// rotation. The instance row itself survives.
    pub fn purge_arguments(&self, instance_id: InstanceId) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE event_instances SET arguments = NULL WHERE instance_id = ?1",
            [instance_id as i64],
        )?;
        Ok(())
    }

    /// The acknowledged instance for (client, event), if any.
    pub fn acknowledged_instance(
        &self,
        client_id: ClientId,
        event_id: EventId,
    ) -> Result<Option<InstanceId>, StoreError> {
        let conn = self.pool.get()?;
        let row: Option<i64> = conn
            .query_row(
                "SELECT instance_id FROM acknowledgments WHERE client_id = ?1 AND event_id = ?2",
                params![client_id as i64, event_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.map(|v| v as InstanceId))
    }
}

fn map_row_to_subscription(row: &Row) -> rusqlite::Result<SubscriptionRow> {
    let kind_raw: u8 = row.get(1)?;
    let kind = EventKind::from_u8(kind_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Integer,
            format!("unknown event kind {kind_raw}").into(),
        )
    })?;
    let cursor: Option<i64> = row.get(3)?;
    Ok(SubscriptionRow {
        event_id: row.get(0)?,
        kind,
        name: row.get(2)?,
        delivered_instance_id: cursor.map(|v| v as InstanceId),
    })
}

impl Store for SqliteStore {
    fn credentials_by_key(
        &self,
        client_key: &str,
    ) -> Result<Option<AccountCredentials>, StoreError> {
        let conn = self.pool.get()?;
        let creds = conn
            .query_row(
                "SELECT site_id, user_id, user_kind, site_kind, salt, salted_password
                 FROM accounts WHERE client_key = ?1",
                [client_key],
                |row| {
                    let user_kind_raw: u8 = row.get(2)?;
                    let site_kind_raw: u8 = row.get(3)?;
                    let user_kind = UserKind::from_u8(user_kind_raw).ok_or_else(|| {
                        rusqlite::Error::FromSqlConversionFailure(
                            2,
                            rusqlite::types::Type::Integer,
                            format!("unknown user kind {user_kind_raw}").into(),
                        )
                    })?;
                    let site_kind = SiteKind::from_u8(site_kind_raw).ok_or_else(|| {
                        rusqlite::Error::FromSqlConversionFailure(
                            3,
                            rusqlite::types::Type::Integer,
                            format!("unknown site kind {site_kind_raw}").into(),
                        )
                    })?;
                    let site_id: i64 = row.get(0)?;
                    let user_id: i64 = row.get(1)?;
                    Ok(AccountCredentials {
                        site_id: site_id as SiteId,
                        user_id: user_id as u64,
                        user_kind,
                        site_kind,
                        salt: row.get(4)?,
                        salted_password: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(creds)
    }

    fn subscriptions(&self, client_id: ClientId) -> Result<Vec<SubscriptionRow>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT event_id, kind, name, delivered_instance_id
             FROM subscriptions WHERE client_id = ?1 ORDER BY event_id ASC",
        )?;
        let rows = stmt.query_map([client_id as i64], map_row_to_subscription)?;
        let mut subscriptions = Vec::new();
        for row in rows {
            subscriptions.push(row?);
        }
        Ok(subscriptions)
    }

    fn add_subscription(
        &self,
        site_id: SiteId,
        client_id: ClientId,
        sub: &NewSubscription,
    ) -> Result<AddOutcome, StoreError> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "INSERT INTO subscriptions (site_id, client_id, event_id, kind, name)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (client_id, event_id) DO NOTHING",
            params![
                site_id as i64,
                client_id as i64,
                sub.event_id,
                sub.kind.as_u8(),
                sub.name,
            ],
        )?;
        if changed == 0 {
            Ok(AddOutcome::Conflict)
        } else {
            Ok(AddOutcome::Added)
        }
    }

    fn remove_subscription(
        &self,
        client_id: ClientId,
        event_id: EventId,
    ) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            "DELETE FROM subscriptions WHERE client_id = ?1 AND event_id = ?2",
            params![client_id as i64, event_id],
        )?;
        Ok(())
    }

    fn arguments(&self, instance_id: InstanceId) -> Result<Option<Vec<u8>>, StoreError> {
        let conn = self.pool.get()?;
        // Two levels of absence collapse into one answer: a purged blob and
        // a rotated-out row both mean "payload no longer available".
        let row: Option<Option<Vec<u8>>> = conn
            .query_row(
                "SELECT arguments FROM event_instances WHERE instance_id = ?1",
                [instance_id as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.flatten())
    }

    fn save_acknowledgment(
        &self,
        client_id: ClientId,
        event_id: EventId,
        instance_id: InstanceId,
    ) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO acknowledgments (client_id, event_id, instance_id)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (client_id, event_id) DO UPDATE SET
                 instance_id = excluded.instance_id,
                 acked_at = datetime('now')",
            params![client_id as i64, event_id, instance_id as i64],
        )?;
        conn.execute(
            "UPDATE subscriptions SET delivered_instance_id = ?3
             WHERE client_id = ?1 AND event_id = ?2",
            params![client_id as i64, event_id, instance_id as i64],
        )?;
        Ok(())
    }
}
