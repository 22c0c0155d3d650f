//! Pooled, instrumented access to the backing store.
//!
//! The [`PersistenceGateway`] owns a SQLite connection pool. Checkout and
//! checkin of physical connections is handled by the pool; concurrent
//! statements on different connections share no lock. Every statement runs
//! between [`Instrumentation::before`] and [`Instrumentation::after`].

use std::str::FromStr;
use std::sync::Arc;

use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Sqlite;
use thiserror::Error;
use tracing::info;

use liftoff_common::DatabaseSettings;

use crate::instrument::Instrumentation;
use crate::params::{Param, Params, UnknownParameter};

/// Persistence errors.
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// The connection URL could not be parsed.
    #[error("Invalid database URL '{url}': {reason}")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
        /// Parse failure description.
        reason: String,
    },

    /// The pool could not open its first connection.
    #[error("Database connection failed: {0}")]
    Connect(#[source] sqlx::Error),

    /// A keyed placeholder had no matching parameter.
    #[error(transparent)]
    Parameter(#[from] UnknownParameter),

    /// The statement itself failed.
    #[error("Statement failed: {0}")]
    Statement(#[from] sqlx::Error),
}

/// Shared handle to the connection pool.
///
/// Cloning is cheap; all clones use the same pool and instrumentation.
#[derive(Clone)]
pub struct PersistenceGateway {
    pool: SqlitePool,
    instrumentation: Arc<Instrumentation>,
}

impl PersistenceGateway {
    /// Open the pool described by `settings`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is malformed or no connection can be opened.
    pub async fn connect(
        settings: &DatabaseSettings,
        instrumentation: Instrumentation,
    ) -> Result<Self, PersistenceError> {
        let options = SqliteConnectOptions::from_str(&settings.url)
            .map_err(|e| PersistenceError::InvalidUrl {
                url: settings.url.clone(),
                reason: e.to_string(),
            })?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(settings.acquire_timeout())
            .connect_with(options)
            .await
            .map_err(PersistenceError::Connect)?;

        info!(
            url = %settings.url,
            max_connections = settings.max_connections,
            observers = instrumentation.observer_count(),
            "Database pool ready"
        );

        Ok(Self {
            pool,
            instrumentation: Arc::new(instrumentation),
        })
    }

    /// Round-trip a trivial statement to prove the pool is usable.
    pub async fn ping(&self) -> Result<(), PersistenceError> {
        self.fetch_optional("SELECT 1", Params::None).await?;
        Ok(())
    }

    /// Execute a statement and return the number of affected rows.
    pub async fn execute(&self, statement: &str, params: Params) -> Result<u64, PersistenceError> {
        let prepared = params.prepare(statement)?;
        let start = self.instrumentation.before(statement, &params);
        let result = bind(sqlx::query(&prepared), &params)
            .execute(&self.pool)
            .await;
        self.instrumentation
            .after(start, statement, &params, result.is_ok());

        Ok(result?.rows_affected())
    }

    /// Execute a query and collect every row.
    pub async fn fetch_all(
        &self,
        statement: &str,
        params: Params,
    ) -> Result<Vec<SqliteRow>, PersistenceError> {
        let prepared = params.prepare(statement)?;
        let start = self.instrumentation.before(statement, &params);
        let result = bind(sqlx::query(&prepared), &params)
            .fetch_all(&self.pool)
            .await;
        self.instrumentation
            .after(start, statement, &params, result.is_ok());

        Ok(result?)
    }

    /// Execute a query and return the first row, if any.
    pub async fn fetch_optional(
        &self,
        statement: &str,
        params: Params,
    ) -> Result<Option<SqliteRow>, PersistenceError> {
        let prepared = params.prepare(statement)?;
        let start = self.instrumentation.before(statement, &params);
        let result = bind(sqlx::query(&prepared), &params)
            .fetch_optional(&self.pool)
            .await;
        self.instrumentation
            .after(start, statement, &params, result.is_ok());

        Ok(result?)
    }

    /// The underlying pool, for callers that need raw sqlx access.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Connections currently open (idle and checked out).
    pub fn connections(&self) -> u32 {
        self.pool.size()
    }

    /// Close the pool, waiting for checked-out connections to return.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database pool closed");
    }
}

impl std::fmt::Debug for PersistenceGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceGateway")
            .field("connections", &self.pool.size())
            .field("instrumentation", &self.instrumentation)
            .finish()
    }
}

fn bind<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &'q Params,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for value in params.values() {
        query = match value {
            Param::Null => query.bind(None::<i64>),
            Param::Bool(v) => query.bind(*v),
            Param::Int(v) => query.bind(*v),
            Param::Float(v) => query.bind(*v),
            Param::Text(v) => query.bind(v.as_str()),
            Param::Bytes(v) => query.bind(v.as_slice()),
        };
    }
    query
}
