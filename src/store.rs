//! SQLite-backed account store.
//!
//! The database lives at `~/.mailwatch/mailwatch.db` and holds one row per
//! connected mailbox: identity, credential ciphertext, and the subscription
//! sync state the reconciler and router coordinate through. Conditional
//! `UPDATE ... WHERE` writes (affected-row counts as the verdict) are the
//! store's atomicity primitive: a reconcile tick and an in-flight router
//! dispatch never lose each other's updates.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{CreatedSubscription, CredentialBundle, MailAccount, Provider, SyncState};

/// Errors specific to store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),
}

const ACCOUNT_COLUMNS: &str = "id, email, provider, active, identity_nonce, \
     access_token, refresh_token, token_expiry, \
     subscription_id, routing_key, subscription_expiry, watching, \
     last_validated, history_id, watch_started_at, \
     consecutive_failures, last_error, last_error_at, \
     created_at, updated_at";

pub struct AccountStore {
    conn: Mutex<Connection>,
}

impl AccountStore {
    /// Open (or create) the database at `~/.mailwatch/mailwatch.db`.
    pub fn open() -> Result<Self, StoreError> {
        let path = Self::db_path()?;
        Self::open_at(path)
    }

    /// Open a database at an explicit path. Useful for testing.
    pub fn open_at(path: PathBuf) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(StoreError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;

        // WAL keeps router reads from blocking behind reconciler writes.
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        crate::migrations::run_migrations(&conn).map_err(StoreError::Migration)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn db_path() -> Result<PathBuf, StoreError> {
        let home = dirs::home_dir().ok_or(StoreError::HomeDirNotFound)?;
        Ok(home.join(".mailwatch").join("mailwatch.db"))
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    /// Register a mailbox. Mints the account id and the identity nonce the
    /// hashed routing-key fallback is derived from.
    pub fn insert_account(
        &self,
        email: &str,
        provider: Provider,
    ) -> Result<MailAccount, StoreError> {
        let now = Utc::now();
        let account = MailAccount {
            id: Uuid::new_v4().to_string(),
            email: email.trim().to_lowercase(),
            provider,
            active: true,
            identity_nonce: Uuid::new_v4().to_string(),
            credentials: CredentialBundle::default(),
            sync: SyncState::default(),
            created_at: now,
            updated_at: now,
        };

        self.conn.lock().execute(
            "INSERT INTO mail_accounts (id, email, provider, active, identity_nonce, created_at, updated_at)
             VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6)",
            params![
                account.id,
                account.email,
                account.provider.as_str(),
                account.identity_nonce,
                ts(&now),
                ts(&now),
            ],
        )?;

        Ok(account)
    }

    pub fn get_account(&self, id: &str) -> Result<Option<MailAccount>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM mail_accounts WHERE id = ?1"
        ))?;
        let mut rows = stmt.query_map(params![id], map_account_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn find_by_email(&self, email: &str) -> Result<Option<MailAccount>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM mail_accounts WHERE LOWER(email) = LOWER(?1)"
        ))?;
        let mut rows = stmt.query_map(params![email.trim()], map_account_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Resolve an inbound notification's correlation value to its account.
    pub fn find_by_routing_key(
        &self,
        provider: Provider,
        routing_key: &str,
    ) -> Result<Option<MailAccount>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM mail_accounts
             WHERE provider = ?1 AND routing_key = ?2"
        ))?;
        let mut rows = stmt.query_map(params![provider.as_str(), routing_key], map_account_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Whether another account of the same provider already claims a key.
    pub fn routing_key_in_use(
        &self,
        provider: Provider,
        routing_key: &str,
        exclude_account_id: &str,
    ) -> Result<bool, StoreError> {
        let count: i64 = self.conn.lock().query_row(
            "SELECT COUNT(*) FROM mail_accounts
             WHERE provider = ?1 AND routing_key = ?2 AND id != ?3",
            params![provider.as_str(), routing_key, exclude_account_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// All accounts the reconcile tick must examine: active ones, plus any
    /// that still carry subscription state (so deactivation is noticed).
    pub fn find_reconcilable(&self) -> Result<Vec<MailAccount>, StoreError> {
        self.query_accounts(
            "WHERE active = 1 OR watching = 1 OR subscription_id IS NOT NULL
             ORDER BY created_at",
            params![],
        )
    }

    /// Accounts currently believed to hold a live subscription.
    pub fn find_watching(&self) -> Result<Vec<MailAccount>, StoreError> {
        self.query_accounts("WHERE watching = 1 ORDER BY created_at", params![])
    }

    /// Inactive accounts still carrying subscription state. These are the
    /// deep sweep's cleanup targets.
    pub fn find_orphaned(&self) -> Result<Vec<MailAccount>, StoreError> {
        self.query_accounts(
            "WHERE active = 0 AND (watching = 1 OR subscription_id IS NOT NULL)
             ORDER BY created_at",
            params![],
        )
    }

    /// Active accounts with no live subscription.
    pub fn find_missing_subscriptions(&self) -> Result<Vec<MailAccount>, StoreError> {
        self.query_accounts(
            "WHERE active = 1 AND watching = 0 ORDER BY created_at",
            params![],
        )
    }

    pub fn all_accounts(&self) -> Result<Vec<MailAccount>, StoreError> {
        self.query_accounts("ORDER BY created_at", params![])
    }

    /// Routing keys claimed by more than one active, watching account of the
    /// same provider. Returns the offending accounts grouped per key,
    /// ordered within each group by when they started watching (FIFO).
    pub fn find_routing_collisions(&self) -> Result<Vec<Vec<MailAccount>>, StoreError> {
        let accounts = self.query_accounts(
            "WHERE active = 1 AND watching = 1 AND routing_key IS NOT NULL
               AND (provider, routing_key) IN (
                   SELECT provider, routing_key FROM mail_accounts
                   WHERE active = 1 AND watching = 1 AND routing_key IS NOT NULL
                   GROUP BY provider, routing_key
                   HAVING COUNT(*) > 1
               )
             ORDER BY provider, routing_key, watch_started_at, created_at",
            params![],
        )?;

        let mut groups: Vec<Vec<MailAccount>> = Vec::new();
        for account in accounts {
            let same_group = groups.last().and_then(|g| g.last()).is_some_and(|prev| {
                prev.provider == account.provider && prev.sync.routing_key == account.sync.routing_key
            });
            if same_group {
                if let Some(group) = groups.last_mut() {
                    group.push(account);
                }
            } else {
                groups.push(vec![account]);
            }
        }
        Ok(groups)
    }

    pub fn set_active(&self, id: &str, active: bool) -> Result<bool, StoreError> {
        let rows = self.conn.lock().execute(
            "UPDATE mail_accounts SET active = ?1, updated_at = ?2 WHERE id = ?3",
            params![active as i32, ts(&Utc::now()), id],
        )?;
        Ok(rows > 0)
    }

    // =========================================================================
    // Credentials
    // =========================================================================

    pub fn update_credentials(
        &self,
        id: &str,
        bundle: &CredentialBundle,
    ) -> Result<bool, StoreError> {
        let rows = self.conn.lock().execute(
            "UPDATE mail_accounts
             SET access_token = ?1, refresh_token = ?2, token_expiry = ?3, updated_at = ?4
             WHERE id = ?5",
            params![
                bundle.access_token,
                bundle.refresh_token,
                bundle.token_expiry.as_ref().map(ts),
                ts(&Utc::now()),
                id,
            ],
        )?;
        Ok(rows > 0)
    }

    // =========================================================================
    // Subscription sync state
    // =========================================================================

    /// Persist a freshly registered subscription. With `only_if_not_watching`
    /// the write applies only while the account is still un-watched; a
    /// `false` return means another writer won the race and the caller's
    /// remote subscription is a duplicate to discard.
    pub fn store_subscription(
        &self,
        id: &str,
        routing_key: &str,
        sub: &CreatedSubscription,
        only_if_not_watching: bool,
    ) -> Result<bool, StoreError> {
        let now = ts(&Utc::now());
        let guard = if only_if_not_watching {
            " AND watching = 0"
        } else {
            ""
        };
        let sql = format!(
            "UPDATE mail_accounts
             SET subscription_id = ?1, routing_key = ?2, subscription_expiry = ?3,
                 watching = 1, watch_started_at = ?4, last_validated = ?4,
                 history_id = COALESCE(?5, history_id), updated_at = ?4
             WHERE id = ?6{guard}"
        );
        let rows = self.conn.lock().execute(
            &sql,
            params![
                sub.subscription_id,
                routing_key,
                sub.expiry.as_ref().map(ts),
                now,
                sub.cursor,
                id,
            ],
        )?;
        Ok(rows > 0)
    }

    /// Record a successful renewal: new expiry, reachability confirmed.
    pub fn refresh_subscription_expiry(
        &self,
        id: &str,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let now = ts(&Utc::now());
        let rows = self.conn.lock().execute(
            "UPDATE mail_accounts
             SET subscription_expiry = ?1, last_validated = ?2, updated_at = ?2
             WHERE id = ?3 AND watching = 1",
            params![expiry.as_ref().map(ts), now, id],
        )?;
        Ok(rows > 0)
    }

    pub fn touch_validated(&self, id: &str) -> Result<bool, StoreError> {
        let now = ts(&Utc::now());
        let rows = self.conn.lock().execute(
            "UPDATE mail_accounts SET last_validated = ?1, updated_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        Ok(rows > 0)
    }

    /// Clear all subscription state after cleanup. `last_error` survives for
    /// the status report.
    pub fn clear_sync_state(&self, id: &str) -> Result<bool, StoreError> {
        let rows = self.conn.lock().execute(
            "UPDATE mail_accounts
             SET subscription_id = NULL, routing_key = NULL, subscription_expiry = NULL,
                 watching = 0, last_validated = NULL, history_id = NULL,
                 watch_started_at = NULL, consecutive_failures = 0, updated_at = ?1
             WHERE id = ?2",
            params![ts(&Utc::now()), id],
        )?;
        Ok(rows > 0)
    }

    /// Collision repair: hand the account a new routing key and drop it back
    /// to the un-watched state so the next tick re-registers it.
    pub fn repair_routing_key(&self, id: &str, new_key: &str) -> Result<bool, StoreError> {
        let rows = self.conn.lock().execute(
            "UPDATE mail_accounts
             SET routing_key = ?1, subscription_id = NULL, subscription_expiry = NULL,
                 watching = 0, watch_started_at = NULL, updated_at = ?2
             WHERE id = ?3",
            params![new_key, ts(&Utc::now()), id],
        )?;
        Ok(rows > 0)
    }

    /// Advance the Gmail history cursor, monotonically. Out-of-order
    /// redeliveries never move it backwards.
    pub fn advance_history_id(&self, id: &str, history_id: &str) -> Result<bool, StoreError> {
        let rows = self.conn.lock().execute(
            "UPDATE mail_accounts
             SET history_id = ?2, updated_at = ?3
             WHERE id = ?1
               AND (history_id IS NULL
                    OR CAST(history_id AS INTEGER) < CAST(?2 AS INTEGER))",
            params![id, history_id, ts(&Utc::now())],
        )?;
        Ok(rows > 0)
    }

    // =========================================================================
    // Failure accounting
    // =========================================================================

    /// Increment the consecutive-failure counter and return the new count.
    pub fn record_failure(&self, id: &str, message: &str) -> Result<u32, StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE mail_accounts
             SET consecutive_failures = consecutive_failures + 1,
                 last_error = ?1, last_error_at = ?2, updated_at = ?2
             WHERE id = ?3",
            params![message, ts(&Utc::now()), id],
        )?;
        let count: u32 = conn.query_row(
            "SELECT consecutive_failures FROM mail_accounts WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn clear_failures(&self, id: &str) -> Result<(), StoreError> {
        self.conn.lock().execute(
            "UPDATE mail_accounts
             SET consecutive_failures = 0, updated_at = ?1
             WHERE id = ?2 AND consecutive_failures > 0",
            params![ts(&Utc::now()), id],
        )?;
        Ok(())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn query_accounts(
        &self,
        clause: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<MailAccount>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM mail_accounts {clause}"
        ))?;
        let rows = stmt.query_map(args, map_account_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_ts(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn map_account_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MailAccount> {
    let provider_raw: String = row.get(2)?;
    let provider = Provider::parse(&provider_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown provider: {provider_raw}").into(),
        )
    })?;

    Ok(MailAccount {
        id: row.get(0)?,
        email: row.get(1)?,
        provider,
        active: row.get::<_, i32>(3)? != 0,
        identity_nonce: row.get(4)?,
        credentials: CredentialBundle {
            access_token: row.get(5)?,
            refresh_token: row.get(6)?,
            token_expiry: parse_ts(row.get(7)?),
        },
        sync: SyncState {
            subscription_id: row.get(8)?,
            routing_key: row.get(9)?,
            expiry: parse_ts(row.get(10)?),
            watching: row.get::<_, i32>(11)? != 0,
            last_validated: parse_ts(row.get(12)?),
            history_id: row.get(13)?,
            watch_started_at: parse_ts(row.get(14)?),
            consecutive_failures: row.get(15)?,
            last_error: row.get(16)?,
            last_error_at: parse_ts(row.get(17)?),
        },
        created_at: parse_ts(row.get(18)?).unwrap_or_else(Utc::now),
        updated_at: parse_ts(row.get(19)?).unwrap_or_else(Utc::now),
    })
}
