//! Secondary row lookup for the one-time-code flow.
//!
//! Change notifications carry only what the trigger serialized, so the
//! formatter reads the identifier and code back from the source table.
//! [`PgOtpLookup`] keeps one small pool per database name; the base URL's
//! database is replaced by the event's database.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::debug;

use super::id_text;

/// Errors from the one-time-code lookup.
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    /// The event has no key value to look up by.
    #[error("one-time-code event has no row id")]
    MissingId,

    /// No row matches the id.
    #[error("no one-time-code row {id} in {database}")]
    NotFound {
        /// Database queried.
        database: String,
        /// Row id.
        id: String,
    },

    /// The database is not in the lookup allow-set.
    #[error("one-time-code lookup not allowed for database {0}")]
    NotAllowed(String),

    /// A configured table or column name is not a plain SQL identifier.
    #[error("invalid sql identifier: {0}")]
    InvalidIdentifier(String),

    /// Connection or query failure.
    #[error("lookup query failed: {0}")]
    Database(#[from] sqlx::Error),
}

/// Identifier/code pair read from the code table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtpRow {
    /// Who the code is for.
    pub identifier: String,
    /// The code.
    pub code: String,
}

/// Synchronous-from-the-pipeline row fetch by id.
#[async_trait]
pub trait OtpLookup: Send + Sync {
    /// Fetch the row with key `id` from `database`.
    async fn fetch(&self, database: &str, id: &Value) -> Result<Option<OtpRow>, LookupError>;
}

/// Column and table names used by the lookup query.
#[derive(Debug, Clone)]
pub struct OtpColumns {
    /// Code table.
    pub table: String,
    /// Key column.
    pub id_column: String,
    /// Identifier column.
    pub identifier_column: String,
    /// Code column.
    pub code_column: String,
}

impl OtpColumns {
    /// Build the lookup query, validating every identifier.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::InvalidIdentifier`] for a name that is not a
    /// plain (optionally schema-qualified) SQL identifier.
    pub fn query(&self) -> Result<String, LookupError> {
        let table = checked_identifier(&self.table)?;
        let id = checked_identifier(&self.id_column)?;
        let identifier = checked_identifier(&self.identifier_column)?;
        let code = checked_identifier(&self.code_column)?;
        Ok(format!(
            "SELECT {identifier}::text AS identifier, {code}::text AS code \
             FROM {table} WHERE {id}::text = $1 LIMIT 1"
        ))
    }
}

fn checked_identifier(name: &str) -> Result<&str, LookupError> {
    let valid = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$")
        .map(|re| re.is_match(name))
        .unwrap_or(false);
    if valid {
        Ok(name)
    } else {
        Err(LookupError::InvalidIdentifier(name.to_owned()))
    }
}

/// PostgreSQL-backed lookup with one lazily created pool per database.
pub struct PgOtpLookup {
    base: PgConnectOptions,
    query: String,
    databases: std::collections::BTreeSet<String>,
    pools: Mutex<HashMap<String, PgPool>>,
}

impl std::fmt::Debug for PgOtpLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgOtpLookup")
            .field("query", &self.query)
            .field("databases", &self.databases)
            .finish_non_exhaustive()
    }
}

impl PgOtpLookup {
    /// Create a lookup from a base connection URL.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::Database`] when the URL does not parse and
    /// [`LookupError::InvalidIdentifier`] for a bad table or column name.
    pub fn new(
        base_url: &str,
        columns: &OtpColumns,
        databases: std::collections::BTreeSet<String>,
    ) -> Result<Self, LookupError> {
        Ok(Self {
            base: PgConnectOptions::from_str(base_url)?,
            query: columns.query()?,
            databases,
            pools: Mutex::new(HashMap::new()),
        })
    }

    async fn pool_for(&self, database: &str) -> PgPool {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(database) {
            return pool.clone();
        }
        debug!(database, "opening one-time-code lookup pool");
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect_lazy_with(self.base.clone().database(database));
        pools.insert(database.to_owned(), pool.clone());
        pool
    }
}

#[async_trait]
impl OtpLookup for PgOtpLookup {
    async fn fetch(&self, database: &str, id: &Value) -> Result<Option<OtpRow>, LookupError> {
        if !self.databases.contains(database) {
            return Err(LookupError::NotAllowed(database.to_owned()));
        }
        let pool = self.pool_for(database).await;
        let row: Option<(Option<String>, Option<String>)> = sqlx::query_as(&self.query)
            .bind(id_text(id))
            .fetch_optional(&pool)
            .await?;

        Ok(row.map(|(identifier, code)| OtpRow {
            identifier: identifier.unwrap_or_default(),
            code: code.unwrap_or_default(),
        }))
    }
}
