use tokio_postgres::{Client, NoTls};
use tracing::{info, warn};

use crate::error::Result;

const MIGRATION_LOCK_KEY: i64 = 745_010;

pub struct Database {
    conn_str: String,
    client: Client,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self> {
        info!("Connecting to PostgreSQL database");

        let client = Self::open(database_url).await?;

        info!("PostgreSQL connection established");

        Ok(Self {
            conn_str: database_url.to_string(),
            client,
        })
    }

    async fn open(conn_str: &str) -> Result<Client> {
        let (client, connection) = tokio_postgres::connect(conn_str, NoTls).await?;

        // The connection future must be driven for queries to make progress.
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "Database connection task ended");
            }
        });

        Ok(client)
    }

    /// Replaces a broken session with a fresh one. The scheduler calls this
    /// once per iteration when a query fails before retrying the query.
    pub async fn reset(&mut self) -> Result<()> {
        warn!("Resetting database session");

        self.client = Self::open(&self.conn_str).await?;

        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Applies the schema migration file. Idempotent: every statement in it
    /// is written as CREATE IF NOT EXISTS / CREATE OR REPLACE. The advisory
    /// lock serializes concurrent appliers, which would otherwise race on
    /// the trigger re-creation statements.
    pub async fn apply_schema(&self) -> Result<()> {
        self.client
            .batch_execute(&format!("SELECT pg_advisory_lock({MIGRATION_LOCK_KEY})"))
            .await?;

        let applied = self
            .client
            .batch_execute(include_str!("../../migrations/0001_schema.sql"))
            .await;

        let _ = self
            .client
            .batch_execute(&format!("SELECT pg_advisory_unlock({MIGRATION_LOCK_KEY})"))
            .await;

        applied?;

        info!("Database schema applied");

        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        self.client.simple_query("SELECT 1").await?;

        Ok(())
    }

    /// Dropping the client ends the session; this just makes teardown
    /// explicit in the logs.
    pub fn close(self) {
        info!("Database session closed");
    }
}
