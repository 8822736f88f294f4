//! Embedded SQLite store: users, usage rows, rate limits, price book and
//! price history. Connections come from a fixed-size pool and every call runs
//! on the blocking pool.

use std::path::{Path, PathBuf};
use std::time::Duration;

use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ProxyError;

pub type SqlitePool = r2d2::Pool<SqliteConnectionManager>;

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store busy: {0}")]
    Busy(#[from] r2d2::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("no entropy source for credential generation")]
    Entropy,
}

impl From<StoreError> for ProxyError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Busy(_) => ProxyError::StoreBusy,
            other => ProxyError::Internal(other.to_string()),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct UserRecord {
    pub id: String,
    pub api_key: String,
    pub created_at: u64,
}

#[derive(Clone, Debug)]
pub struct UsageInsert {
    pub user_id: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
    pub request_id: Option<String>,
    pub prompt_preview: Option<String>,
    pub timestamp: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct UsageRecord {
    pub id: i64,
    pub user_id: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost: f64,
    pub request_id: Option<String>,
    pub prompt_preview: Option<String>,
    pub timestamp: u64,
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct UsageTotals {
    pub total_tokens: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_cost: f64,
    pub request_count: u64,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct RateLimitRecord {
    pub requests_per_minute: Option<u64>,
    pub requests_per_day: Option<u64>,
    pub tokens_per_minute: Option<u64>,
    pub tokens_per_day: Option<u64>,
    pub total_token_limit: Option<u64>,
}

impl From<crate::config::DefaultLimits> for RateLimitRecord {
    fn from(defaults: crate::config::DefaultLimits) -> Self {
        Self {
            requests_per_minute: defaults.requests_per_minute,
            requests_per_day: defaults.requests_per_day,
            tokens_per_minute: defaults.tokens_per_minute,
            tokens_per_day: defaults.tokens_per_day,
            total_token_limit: defaults.total_token_limit,
        }
    }
}

/// Partial update for a user's limits row. `None` fields are left untouched.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub struct RateLimitPatch {
    pub requests_per_minute: Option<u64>,
    pub requests_per_day: Option<u64>,
    pub tokens_per_minute: Option<u64>,
    pub tokens_per_day: Option<u64>,
    pub total_token_limit: Option<u64>,
}

impl RateLimitPatch {
    pub fn is_empty(&self) -> bool {
        self.requests_per_minute.is_none()
            && self.requests_per_day.is_none()
            && self.tokens_per_minute.is_none()
            && self.tokens_per_day.is_none()
            && self.total_token_limit.is_none()
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ModelPricingRecord {
    pub model: String,
    pub input_cost_per_million: f64,
    pub output_cost_per_million: f64,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct PricingHistoryRecord {
    pub id: i64,
    pub model: String,
    pub input_cost_per_million: f64,
    pub output_cost_per_million: f64,
    pub changed_by: String,
    pub changed_at: u64,
}

impl Store {
    /// Opens (or creates) the store file, builds the connection pool and runs
    /// schema init plus additive migrations. Corruption is fatal here.
    pub async fn open(path: impl AsRef<Path>, pool_size: u32) -> Result<Self, StoreError> {
        let path: PathBuf = path.as_ref().to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<Self, StoreError> {
            let manager = SqliteConnectionManager::file(path).with_init(|conn| {
                conn.busy_timeout(Duration::from_secs(5))?;
                conn.execute_batch(
                    "PRAGMA journal_mode = WAL;
                     PRAGMA synchronous = NORMAL;
                     PRAGMA foreign_keys = ON;",
                )
            });
            let pool = r2d2::Pool::builder()
                .max_size(pool_size.max(1))
                .connection_timeout(Duration::from_secs(5))
                .build(manager)?;

            let conn = pool.get()?;
            init_schema(&conn)?;
            run_migrations(&conn)?;
            Ok(Self { pool })
        })
        .await?
    }

    /// In-memory store backed by a single shared connection, for tests.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        tokio::task::spawn_blocking(move || -> Result<Self, StoreError> {
            let manager = SqliteConnectionManager::memory();
            let pool = r2d2::Pool::builder().max_size(1).build(manager)?;
            let conn = pool.get()?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            init_schema(&conn)?;
            run_migrations(&conn)?;
            Ok(Self { pool })
        })
        .await?
    }

    async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await?
    }

    // ----- users -----

    pub async fn create_user(
        &self,
        user_id: &str,
        api_key: &str,
        limits: RateLimitRecord,
    ) -> Result<UserRecord, StoreError> {
        let user_id = user_id.to_string();
        let api_key = api_key.to_string();
        let created_at = now_epoch_seconds();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO users (id, api_key, created_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![user_id, api_key, created_at as i64],
            )?;
            tx.execute(
                "INSERT INTO rate_limits
                 (user_id, requests_per_minute, requests_per_day,
                  tokens_per_minute, tokens_per_day, total_token_limit)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    user_id,
                    limits.requests_per_minute.map(u64_to_i64),
                    limits.requests_per_day.map(u64_to_i64),
                    limits.tokens_per_minute.map(u64_to_i64),
                    limits.tokens_per_day.map(u64_to_i64),
                    limits.total_token_limit.map(u64_to_i64),
                ],
            )?;
            tx.commit()?;
            Ok(UserRecord {
                id: user_id,
                api_key,
                created_at,
            })
        })
        .await
    }

    pub async fn user_by_api_key(&self, api_key: &str) -> Result<Option<UserRecord>, StoreError> {
        let api_key = api_key.to_string();
        self.call(move |conn| {
            let record = conn
                .query_row(
                    "SELECT id, api_key, created_at FROM users WHERE api_key = ?1",
                    rusqlite::params![api_key],
                    user_from_row,
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    pub async fn user_by_id(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            let record = conn
                .query_row(
                    "SELECT id, api_key, created_at FROM users WHERE id = ?1",
                    rusqlite::params![user_id],
                    user_from_row,
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    pub async fn list_users(&self) -> Result<Vec<UserRecord>, StoreError> {
        self.call(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, api_key, created_at FROM users ORDER BY created_at, id")?;
            let rows = stmt.query_map([], user_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    /// Removes the user together with their usage rows and limits row.
    pub async fn delete_user(&self, user_id: &str) -> Result<bool, StoreError> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM usage WHERE user_id = ?1",
                rusqlite::params![user_id],
            )?;
            tx.execute(
                "DELETE FROM rate_limits WHERE user_id = ?1",
                rusqlite::params![user_id],
            )?;
            let deleted = tx.execute("DELETE FROM users WHERE id = ?1", rusqlite::params![user_id])?;
            tx.commit()?;
            Ok(deleted > 0)
        })
        .await
    }

    pub async fn delete_all_users(&self) -> Result<u64, StoreError> {
        self.call(|conn| {
            let tx = conn.transaction()?;
            let count: i64 = tx.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
            tx.execute("DELETE FROM usage", [])?;
            tx.execute("DELETE FROM rate_limits", [])?;
            tx.execute("DELETE FROM users", [])?;
            tx.commit()?;
            Ok(i64_to_u64(count))
        })
        .await
    }

    // ----- rate limits -----

    pub async fn rate_limits(&self, user_id: &str) -> Result<Option<RateLimitRecord>, StoreError> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            let record = conn
                .query_row(
                    "SELECT requests_per_minute, requests_per_day,
                            tokens_per_minute, tokens_per_day, total_token_limit
                     FROM rate_limits WHERE user_id = ?1",
                    rusqlite::params![user_id],
                    |row| {
                        Ok(RateLimitRecord {
                            requests_per_minute: opt_u64(row.get(0)?),
                            requests_per_day: opt_u64(row.get(1)?),
                            tokens_per_minute: opt_u64(row.get(2)?),
                            tokens_per_day: opt_u64(row.get(3)?),
                            total_token_limit: opt_u64(row.get(4)?),
                        })
                    },
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    /// Applies a partial limits update. Creates the row when the user has
    /// none yet. Returns false when no fields were given.
    pub async fn update_rate_limits(
        &self,
        user_id: &str,
        patch: RateLimitPatch,
    ) -> Result<bool, StoreError> {
        if patch.is_empty() {
            return Ok(false);
        }
        let user_id = user_id.to_string();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR IGNORE INTO rate_limits (user_id) VALUES (?1)",
                rusqlite::params![user_id],
            )?;

            let mut updates = Vec::new();
            let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
            let mut push = |column: &str, value: Option<u64>| {
                if let Some(value) = value {
                    updates.push(format!("{column} = ?{}", params.len() + 1));
                    params.push(Box::new(u64_to_i64(value)));
                }
            };
            push("requests_per_minute", patch.requests_per_minute);
            push("requests_per_day", patch.requests_per_day);
            push("tokens_per_minute", patch.tokens_per_minute);
            push("tokens_per_day", patch.tokens_per_day);
            push("total_token_limit", patch.total_token_limit);

            params.push(Box::new(user_id));
            let sql = format!(
                "UPDATE rate_limits SET {} WHERE user_id = ?{}",
                updates.join(", "),
                params.len()
            );
            let changed = tx.execute(
                &sql,
                rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
            )?;
            tx.commit()?;
            Ok(changed > 0)
        })
        .await
    }

    // ----- usage -----

    pub async fn insert_usage(&self, row: UsageInsert) -> Result<(), StoreError> {
        self.call(move |conn| {
            let total = row.prompt_tokens.saturating_add(row.completion_tokens);
            conn.execute(
                "INSERT INTO usage
                 (user_id, model, prompt_tokens, completion_tokens, total_tokens,
                  cost, request_id, prompt_preview, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    row.user_id,
                    row.model,
                    u64_to_i64(row.prompt_tokens),
                    u64_to_i64(row.completion_tokens),
                    u64_to_i64(total),
                    row.cost,
                    row.request_id,
                    row.prompt_preview,
                    u64_to_i64(row.timestamp),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn usage_totals(&self, user_id: &str) -> Result<UsageTotals, StoreError> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            let totals = conn.query_row(
                "SELECT COALESCE(SUM(total_tokens), 0),
                        COALESCE(SUM(prompt_tokens), 0),
                        COALESCE(SUM(completion_tokens), 0),
                        COALESCE(SUM(cost), 0.0),
                        COUNT(*)
                 FROM usage WHERE user_id = ?1",
                rusqlite::params![user_id],
                totals_from_row,
            )?;
            Ok(totals)
        })
        .await
    }

    pub async fn usage_by_model(
        &self,
        user_id: &str,
    ) -> Result<Vec<(String, UsageTotals)>, StoreError> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT model,
                        COALESCE(SUM(total_tokens), 0),
                        COALESCE(SUM(prompt_tokens), 0),
                        COALESCE(SUM(completion_tokens), 0),
                        COALESCE(SUM(cost), 0.0),
                        COUNT(*)
                 FROM usage WHERE user_id = ?1
                 GROUP BY model ORDER BY model",
            )?;
            let rows = stmt.query_map(rusqlite::params![user_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    UsageTotals {
                        total_tokens: i64_to_u64(row.get(1)?),
                        prompt_tokens: i64_to_u64(row.get(2)?),
                        completion_tokens: i64_to_u64(row.get(3)?),
                        total_cost: row.get(4)?,
                        request_count: i64_to_u64(row.get(5)?),
                    },
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn usage_history(
        &self,
        user_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<UsageRecord>, StoreError> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, model, prompt_tokens, completion_tokens, total_tokens,
                        cost, request_id, prompt_preview, timestamp
                 FROM usage WHERE user_id = ?1
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?2 OFFSET ?3",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![user_id, i64::from(limit), i64::from(offset)],
                usage_from_row,
            )?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn requests_since(&self, user_id: &str, since: u64) -> Result<u64, StoreError> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM usage WHERE user_id = ?1 AND timestamp > ?2",
                rusqlite::params![user_id, u64_to_i64(since)],
                |row| row.get(0),
            )?;
            Ok(i64_to_u64(count))
        })
        .await
    }

    pub async fn tokens_since(&self, user_id: &str, since: u64) -> Result<u64, StoreError> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            let total: i64 = conn.query_row(
                "SELECT COALESCE(SUM(total_tokens), 0)
                 FROM usage WHERE user_id = ?1 AND timestamp > ?2",
                rusqlite::params![user_id, u64_to_i64(since)],
                |row| row.get(0),
            )?;
            Ok(i64_to_u64(total))
        })
        .await
    }

    pub async fn total_tokens(&self, user_id: &str) -> Result<u64, StoreError> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            let total: i64 = conn.query_row(
                "SELECT COALESCE(SUM(total_tokens), 0) FROM usage WHERE user_id = ?1",
                rusqlite::params![user_id],
                |row| row.get(0),
            )?;
            Ok(i64_to_u64(total))
        })
        .await
    }

    // ----- pricing -----

    pub async fn pricing(&self, model: &str) -> Result<Option<ModelPricingRecord>, StoreError> {
        let model = model.to_string();
        self.call(move |conn| {
            let record = conn
                .query_row(
                    "SELECT model, input_cost_per_million, output_cost_per_million,
                            created_at, updated_at
                     FROM model_pricing WHERE model = ?1",
                    rusqlite::params![model],
                    pricing_from_row,
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    pub async fn all_pricing(&self) -> Result<Vec<ModelPricingRecord>, StoreError> {
        self.call(|conn| {
            let mut stmt = conn.prepare(
                "SELECT model, input_cost_per_million, output_cost_per_million,
                        created_at, updated_at
                 FROM model_pricing ORDER BY model",
            )?;
            let rows = stmt.query_map([], pricing_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    /// Upserts the price row and appends the history entry in one
    /// transaction, so a failed append rolls the upsert back.
    pub async fn set_pricing(
        &self,
        model: &str,
        input_cost_per_million: f64,
        output_cost_per_million: f64,
        changed_by: &str,
    ) -> Result<ModelPricingRecord, StoreError> {
        let model = model.to_string();
        let changed_by = changed_by.to_string();
        let now = now_epoch_seconds();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO model_pricing
                 (model, input_cost_per_million, output_cost_per_million, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(model) DO UPDATE SET
                     input_cost_per_million = excluded.input_cost_per_million,
                     output_cost_per_million = excluded.output_cost_per_million,
                     updated_at = excluded.updated_at",
                rusqlite::params![
                    model,
                    input_cost_per_million,
                    output_cost_per_million,
                    u64_to_i64(now)
                ],
            )?;
            tx.execute(
                "INSERT INTO pricing_history
                 (model, input_cost_per_million, output_cost_per_million, changed_by, changed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    model,
                    input_cost_per_million,
                    output_cost_per_million,
                    changed_by,
                    u64_to_i64(now)
                ],
            )?;
            let record = tx.query_row(
                "SELECT model, input_cost_per_million, output_cost_per_million,
                        created_at, updated_at
                 FROM model_pricing WHERE model = ?1",
                rusqlite::params![model],
                pricing_from_row,
            )?;
            tx.commit()?;
            Ok(record)
        })
        .await
    }

    pub async fn delete_pricing(&self, model: &str) -> Result<bool, StoreError> {
        let model = model.to_string();
        self.call(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM model_pricing WHERE model = ?1",
                rusqlite::params![model],
            )?;
            Ok(deleted > 0)
        })
        .await
    }

    pub async fn pricing_history(
        &self,
        model: Option<&str>,
    ) -> Result<Vec<PricingHistoryRecord>, StoreError> {
        let model = model.map(str::to_string);
        self.call(move |conn| {
            let mut out = Vec::new();
            match model {
                Some(model) => {
                    let mut stmt = conn.prepare(
                        "SELECT id, model, input_cost_per_million, output_cost_per_million,
                                changed_by, changed_at
                         FROM pricing_history WHERE model = ?1
                         ORDER BY changed_at DESC, id DESC",
                    )?;
                    let rows = stmt.query_map(rusqlite::params![model], history_from_row)?;
                    for row in rows {
                        out.push(row?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT id, model, input_cost_per_million, output_cost_per_million,
                                changed_by, changed_at
                         FROM pricing_history
                         ORDER BY changed_at DESC, id DESC",
                    )?;
                    let rows = stmt.query_map([], history_from_row)?;
                    for row in rows {
                        out.push(row?);
                    }
                }
            }
            Ok(out)
        })
        .await
    }
}

/// Credentials are `sk-{user_id}-{random}` with 128 bits of entropy in the
/// suffix. The embedded user id is a diagnostic hint only.
pub fn generate_api_key(user_id: &str) -> Result<String, StoreError> {
    let mut bytes = [0u8; 16];
    getrandom::fill(&mut bytes).map_err(|_| StoreError::Entropy)?;
    Ok(format!("sk-{user_id}-{}", hex_encode(&bytes)))
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY NOT NULL,
            api_key TEXT UNIQUE NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS usage (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            model TEXT NOT NULL,
            prompt_tokens INTEGER NOT NULL,
            completion_tokens INTEGER NOT NULL,
            total_tokens INTEGER NOT NULL,
            timestamp INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_usage_user_timestamp
            ON usage(user_id, timestamp);
        CREATE INDEX IF NOT EXISTS idx_users_api_key
            ON users(api_key);

        CREATE TABLE IF NOT EXISTS rate_limits (
            user_id TEXT PRIMARY KEY NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            requests_per_minute INTEGER,
            requests_per_day INTEGER,
            tokens_per_minute INTEGER,
            tokens_per_day INTEGER,
            total_token_limit INTEGER
        );

        CREATE TABLE IF NOT EXISTS model_pricing (
            model TEXT PRIMARY KEY NOT NULL,
            input_cost_per_million REAL NOT NULL DEFAULT 0.0,
            output_cost_per_million REAL NOT NULL DEFAULT 0.0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS pricing_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            model TEXT NOT NULL,
            input_cost_per_million REAL NOT NULL,
            output_cost_per_million REAL NOT NULL,
            changed_by TEXT NOT NULL DEFAULT 'admin',
            changed_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_pricing_history_model_changed_at
            ON pricing_history(model, changed_at DESC);",
    )
}

/// Additive migrations for stores created before these columns existed.
/// A duplicate-column error means the column is already there.
fn run_migrations(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    add_column_if_missing(conn, "ALTER TABLE usage ADD COLUMN cost REAL DEFAULT 0.0")?;
    add_column_if_missing(conn, "ALTER TABLE usage ADD COLUMN request_id TEXT DEFAULT NULL")?;
    add_column_if_missing(
        conn,
        "ALTER TABLE usage ADD COLUMN prompt_preview TEXT DEFAULT NULL",
    )?;
    Ok(())
}

fn add_column_if_missing(conn: &rusqlite::Connection, sql: &str) -> Result<(), rusqlite::Error> {
    match conn.execute(sql, []) {
        Ok(_) => Ok(()),
        Err(err) if is_duplicate_column(&err) => Ok(()),
        Err(err) => Err(err),
    }
}

fn is_duplicate_column(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(_, Some(message))
            if message.contains("duplicate column name")
    )
}

fn user_from_row(row: &rusqlite::Row<'_>) -> Result<UserRecord, rusqlite::Error> {
    Ok(UserRecord {
        id: row.get(0)?,
        api_key: row.get(1)?,
        created_at: i64_to_u64(row.get(2)?),
    })
}

fn usage_from_row(row: &rusqlite::Row<'_>) -> Result<UsageRecord, rusqlite::Error> {
    Ok(UsageRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        model: row.get(2)?,
        prompt_tokens: i64_to_u64(row.get(3)?),
        completion_tokens: i64_to_u64(row.get(4)?),
        total_tokens: i64_to_u64(row.get(5)?),
        cost: row.get::<_, Option<f64>>(6)?.unwrap_or(0.0),
        request_id: row.get(7)?,
        prompt_preview: row.get(8)?,
        timestamp: i64_to_u64(row.get(9)?),
    })
}

fn totals_from_row(row: &rusqlite::Row<'_>) -> Result<UsageTotals, rusqlite::Error> {
    Ok(UsageTotals {
        total_tokens: i64_to_u64(row.get(0)?),
        prompt_tokens: i64_to_u64(row.get(1)?),
        completion_tokens: i64_to_u64(row.get(2)?),
        total_cost: row.get(3)?,
        request_count: i64_to_u64(row.get(4)?),
    })
}

fn pricing_from_row(row: &rusqlite::Row<'_>) -> Result<ModelPricingRecord, rusqlite::Error> {
    Ok(ModelPricingRecord {
        model: row.get(0)?,
        input_cost_per_million: row.get(1)?,
        output_cost_per_million: row.get(2)?,
        created_at: i64_to_u64(row.get(3)?),
        updated_at: i64_to_u64(row.get(4)?),
    })
}

fn history_from_row(row: &rusqlite::Row<'_>) -> Result<PricingHistoryRecord, rusqlite::Error> {
    Ok(PricingHistoryRecord {
        id: row.get(0)?,
        model: row.get(1)?,
        input_cost_per_million: row.get(2)?,
        output_cost_per_million: row.get(3)?,
        changed_by: row.get(4)?,
        changed_at: i64_to_u64(row.get(5)?),
    })
}

pub(crate) fn now_epoch_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

fn opt_u64(value: Option<i64>) -> Option<u64> {
    value.map(i64_to_u64)
}

fn u64_to_i64(value: u64) -> i64 {
    if value > i64::MAX as u64 {
        i64::MAX
    } else {
        value as i64
    }
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}
