//! # Database Pool Management
//!
//! Connection pool creation, per-type write scopes and change notices.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Database Handle                                    │
//! │                                                                         │
//! │  DbConfig::new(path) ← Configure pool settings                         │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Database::new(config).await ← Create pool + run migrations            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌───────────────────┐ ┌───────────────────┐ ┌──────────────────────┐  │
//! │  │    SqlitePool     │ │     TypeLocks     │ │ broadcast::Sender    │  │
//! │  │  (connections)    │ │ (one RwLock per   │ │ <ChangeNotice>       │  │
//! │  │                   │ │  entity type)     │ │ (live queries)       │  │
//! │  └───────────────────┘ └───────────────────┘ └──────────────────────┘  │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  begin_write("bill") ──► WriteScope                                    │
//! │       • holds the "bill" write lock                                    │
//! │       • holds one open transaction                                     │
//! │       • commit(&["bill", "payment"]) → COMMIT, release, notify         │
//! │       • dropped without commit → ROLLBACK, release, no notice          │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## WAL Mode
//! File databases run in WAL mode so readers don't block the writer. The
//! first statement of every write transaction is a write, which takes
//! SQLite's write lock before anything is read.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::{broadcast, OwnedRwLockWriteGuard};
use tracing::{debug, info};

use finsync_core::Entity;

use crate::error::{DbError, DbResult};
use crate::locks::TypeLocks;
use crate::migrations;
use crate::repository::credentials::CredentialRepository;
use crate::store::EntityStore;

/// Capacity of the change-notice channel. Slow live queries that fall
/// further behind re-evaluate once instead of replaying every notice.
const NOTICE_CAPACITY: usize = 256;

// =============================================================================
// Configuration
// =============================================================================

/// Database configuration.
///
/// ## Example
/// ```rust,ignore
/// let config = DbConfig::new("/path/to/finsync.db")
///     .max_connections(4)
///     .busy_timeout(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Path to the SQLite database file. `None` for an in-memory database.
    pub database_path: Option<PathBuf>,

    /// Maximum number of connections in the pool.
    /// Default: 4
    pub max_connections: u32,

    /// Minimum number of connections to keep alive.
    /// Default: 1
    pub min_connections: u32,

    /// Connection acquire timeout.
    /// Default: 30 seconds
    pub connect_timeout: Duration,

    /// How long a writer waits for SQLite's write lock.
    /// Default: 5 seconds
    pub busy_timeout: Duration,

    /// Whether to run migrations on connect.
    /// Default: true
    pub run_migrations: bool,
}

impl DbConfig {
    /// Creates a configuration for a file database, created if missing.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            database_path: Some(path.into()),
            max_connections: 4,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(5),
            run_migrations: true,
        }
    }

    /// Sets the maximum number of connections.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the minimum number of connections.
    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    /// Sets the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the SQLite busy timeout.
    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Sets whether to run migrations on connect.
    pub fn run_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }

    /// Creates an in-memory database configuration (for testing).
    ///
    /// An in-memory database lives inside its one connection, so the pool
    /// is pinned to a single connection that never expires.
    pub fn in_memory() -> Self {
        DbConfig {
            database_path: None,
            max_connections: 1,
            min_connections: 1,
            connect_timeout: Duration::from_secs(5),
            busy_timeout: Duration::from_secs(5),
            run_migrations: true,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.database_path.is_none()
    }
}

// =============================================================================
// Change Notices
// =============================================================================

/// Published after a committed write changed records of `entity_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeNotice {
    pub entity_type: &'static str,
}

// =============================================================================
// Database
// =============================================================================

/// Main database handle: pool, type locks and change notices.
///
/// Cheap to clone; every clone shares the same pool and locks.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    locks: TypeLocks,
    notices: broadcast::Sender<ChangeNotice>,
}

impl Database {
    /// Creates a new database connection pool.
    ///
    /// ## What This Does
    /// 1. Creates the database file if it doesn't exist
    /// 2. Configures SQLite: WAL, NORMAL synchronous, foreign keys, busy timeout
    /// 3. Creates the connection pool
    /// 4. Runs migrations (if enabled)
    pub async fn new(config: DbConfig) -> DbResult<Self> {
        let (connect_options, pool_options) = match &config.database_path {
            Some(path) => {
                info!(path = %path.display(), "Initializing database connection");

                let options = SqliteConnectOptions::new()
                    .filename(path)
                    .journal_mode(SqliteJournalMode::Wal)
                    .synchronous(SqliteSynchronous::Normal)
                    .foreign_keys(true)
                    .busy_timeout(config.busy_timeout)
                    .create_if_missing(true);

                let pool = SqlitePoolOptions::new()
                    .max_connections(config.max_connections)
                    .min_connections(config.min_connections)
                    .acquire_timeout(config.connect_timeout)
                    .idle_timeout(Some(Duration::from_secs(600)));

                (options, pool)
            }
            None => {
                info!("Initializing in-memory database");

                let options = SqliteConnectOptions::from_str("sqlite::memory:")
                    .map_err(|e| DbError::ConnectionFailed(e.to_string()))?
                    .foreign_keys(true)
                    .busy_timeout(config.busy_timeout);

                let pool = SqlitePoolOptions::new()
                    .max_connections(1)
                    .min_connections(1)
                    .acquire_timeout(config.connect_timeout)
                    .idle_timeout(None)
                    .max_lifetime(None);

                (options, pool)
            }
        };

        let pool = pool_options
            .connect_with(connect_options)
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;

        debug!(
            max_connections = config.max_connections,
            "Database pool created"
        );

        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let db = Database {
            pool,
            locks: TypeLocks::new(),
            notices,
        };

        if config.run_migrations {
            db.run_migrations().await?;
        }

        Ok(db)
    }

    /// Runs database migrations.
    pub async fn run_migrations(&self) -> DbResult<()> {
        migrations::run_migrations(&self.pool).await
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Returns the per-type lock map.
    pub fn locks(&self) -> &TypeLocks {
        &self.locks
    }

    /// Typed store for one entity type.
    ///
    /// ## Example
    /// ```rust,ignore
    /// let bills = db.store::<Bill>().query(&QuerySpec::new()).await?;
    /// ```
    pub fn store<T: Entity>(&self) -> EntityStore<T> {
        EntityStore::new(self.clone())
    }

    /// Returns the credential repository.
    pub fn credentials(&self) -> CredentialRepository {
        CredentialRepository::new(self.pool.clone())
    }

    /// Subscribes to change notices for every entity type.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeNotice> {
        self.notices.subscribe()
    }

    /// Takes the write lock of `entity_type` and opens a transaction.
    ///
    /// The lock is acquired before a connection, so a writer queued on a
    /// busy type never holds a pooled connection while it waits.
    pub async fn begin_write(&self, entity_type: &'static str) -> DbResult<WriteScope> {
        let guard = self.locks.write(entity_type).await;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO entity_types (entity_type, last_written_at)
            VALUES (?1, ?2)
            ON CONFLICT(entity_type) DO UPDATE SET
                last_written_at = excluded.last_written_at
            "#,
        )
        .bind(entity_type)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        Ok(WriteScope {
            tx,
            _guard: guard,
            entity_type,
            notices: self.notices.clone(),
        })
    }

    /// When `entity_type` was last written through a write scope.
    pub async fn last_written(&self, entity_type: &str) -> DbResult<Option<DateTime<Utc>>> {
        let at = sqlx::query_scalar::<_, DateTime<Utc>>(
            "SELECT last_written_at FROM entity_types WHERE entity_type = ?1",
        )
        .bind(entity_type)
        .fetch_optional(&self.pool)
        .await?;

        Ok(at)
    }

    /// Closes the database connection pool.
    pub async fn close(&self) {
        info!("Closing database connection pool");
        self.pool.close().await;
    }

    /// Checks if the database is healthy (can execute queries).
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

// =============================================================================
// Write Scope
// =============================================================================

/// Exclusive write access to one entity type inside one transaction.
///
/// Dropping the scope without [`WriteScope::commit`] rolls the transaction
/// back and publishes nothing.
pub struct WriteScope {
    // Field order matters: the transaction is dropped (rolled back) before
    // the type lock is released.
    tx: Transaction<'static, Sqlite>,
    _guard: OwnedRwLockWriteGuard<()>,
    entity_type: &'static str,
    notices: broadcast::Sender<ChangeNotice>,
}

impl std::fmt::Debug for WriteScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteScope")
            .field("entity_type", &self.entity_type)
            .finish_non_exhaustive()
    }
}

impl WriteScope {
    pub fn entity_type(&self) -> &'static str {
        self.entity_type
    }

    /// The transaction's connection.
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut *self.tx
    }

    /// Commits, releases the type lock, then notifies `changed` types.
    pub async fn commit(self, changed: &[&'static str]) -> DbResult<()> {
        let WriteScope {
            tx,
            _guard,
            entity_type,
            notices,
        } = self;

        tx.commit().await?;
        drop(_guard);

        for changed_type in dedup_types(changed) {
            // No receivers is fine: nobody is watching.
            let _ = notices.send(ChangeNotice {
                entity_type: changed_type,
            });
        }

        debug!(entity_type, notified = changed.len(), "Write scope committed");
        Ok(())
    }
}

fn dedup_types(types: &[&'static str]) -> Vec<&'static str> {
    let mut out = types.to_vec();
    out.sort_unstable();
    out.dedup();
    out
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_database() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        assert!(db.health_check().await);

        let (total, applied) = migrations::migration_status(db.pool()).await.unwrap();
        assert_eq!(total, applied);
    }

    #[tokio::test]
    async fn test_config_builder() {
        let config = DbConfig::new("/tmp/finsync.db")
            .max_connections(10)
            .min_connections(2);

        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 2);
        assert!(!config.is_in_memory());
        assert!(DbConfig::in_memory().is_in_memory());
    }

    #[tokio::test]
    async fn test_dropped_scope_publishes_nothing() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut rx = db.subscribe_changes();

        {
            let _scope = db.begin_write("bill").await.unwrap();
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(db.last_written("bill").await.unwrap(), None);

        let scope = db.begin_write("bill").await.unwrap();
        scope.commit(&["bill", "bill", "payment"]).await.unwrap();

        assert_eq!(rx.try_recv().unwrap().entity_type, "bill");
        assert_eq!(rx.try_recv().unwrap().entity_type, "payment");
        assert!(db.last_written("bill").await.unwrap().is_some());
    }
}
