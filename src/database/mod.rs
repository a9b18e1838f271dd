//! Postgres-backed Request Store (C2), Anchor Store (C3), and Metadata
//! Store (C4).
//!
//! Grounded on the teacher's `database::Database` wrapper: a single pool,
//! `SERIALIZABLE` pinned via `after_connect`, a statically linked
//! `sqlx::migrate!` migrator, and a dirty/behind-version startup check.

use std::cmp::Ordering;
use std::ops::Deref;

use anyhow::{anyhow, Context};
use sqlx::migrate::{Migrate, MigrateDatabase, Migrator};
use sqlx::pool::PoolOptions;
use sqlx::{Executor, Pool, Postgres, Row};
use tracing::{error, info, instrument, warn};

pub mod anchor_store;
pub mod metadata_store;
pub mod request_store;

pub use anchor_store::AnchorStore;
pub use metadata_store::MetadataStore;
pub use request_store::RequestStore;

use crate::config::DatabaseConfig;

static MIGRATOR: Migrator = sqlx::migrate!("migrations");

/// Name of the advisory-lock row used as the transaction mutex (§4.1/C9).
pub const TRANSACTION_MUTEX_NAME: &str = "anchor";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Internal(#[from] sqlx::Error),
    #[error("request {0} not found")]
    RequestNotFound(uuid::Uuid),
    #[error("transaction mutex unavailable after {attempts} attempts")]
    MutexUnavailable { attempts: u32 },
}

pub type Result<T> = std::result::Result<T, Error>;

/// A thin wrapper around `Pool<Postgres>`. All store traits are implemented
/// for any `T: Executor<'a, Database = Postgres>`, so callers can pass
/// either `&Database` (pool-backed) or `&mut Transaction<'_, Postgres>`
/// (for operations the Anchor Service must run atomically) to the same
/// methods.
pub struct Database {
    pool: Pool<Postgres>,
}

impl Deref for Database {
    type Target = Pool<Postgres>;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl Database {
    #[instrument(skip_all)]
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        info!(url = %redact(&config.database_url), "connecting to database");

        if config.migrate && !Postgres::database_exists(&config.database_url).await? {
            warn!("database does not exist, creating");
            Postgres::create_database(&config.database_url).await?;
        }

        let pool = PoolOptions::<Postgres>::new()
            .max_connections(config.max_connections)
            .after_connect(|conn, _| {
                Box::pin(async move {
                    conn.execute("SET TIME ZONE 'UTC'").await?;
                    conn.execute("SET DEFAULT_TRANSACTION_ISOLATION TO 'SERIALIZABLE'")
                        .await?;
                    Ok(())
                })
            })
            .connect(&config.database_url)
            .await
            .context("error connecting to database")?;

        let version = pool
            .fetch_one("SELECT version()")
            .await
            .context("error getting database version")?
            .get::<String, _>(0);
        info!(?version, "connected to database");

        let latest = MIGRATOR
            .migrations
            .last()
            .expect("migrator has no migrations")
            .version;

        if config.migrate {
            info!("running migrations");
            MIGRATOR.run(&pool).await?;
        }

        let mut conn = pool.acquire().await?;

        if conn.dirty_version().await?.is_some() {
            error!("database is in an incomplete migration state");
            return Err(anyhow!("database is in an incomplete migration state"));
        }

        let version = conn
            .list_applied_migrations()
            .await?
            .last()
            .expect("no migrations applied")
            .version;

        match version.cmp(&latest) {
            Ordering::Less => {
                error!(version, latest, "database schema is behind the binary");
                return Err(anyhow!("database schema is behind the binary"));
            }
            Ordering::Greater => {
                warn!(version, latest, "database schema is ahead of the binary");
            }
            Ordering::Equal => {}
        }

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

fn redact(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .map(|mut u| {
            let _ = u.set_password(Some("***"));
            u.to_string()
        })
        .unwrap_or_else(|| "<unparseable>".to_string())
}

/// Maps a Postgres serialization-failure SQLSTATE (`40001`) to a retryable
/// condition, per §5's "serialization errors cause the caller to retry".
pub fn is_serialization_failure(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("40001"))
}
