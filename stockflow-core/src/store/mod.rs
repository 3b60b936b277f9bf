//! Staging-table storage.
//!
//! `StagingStore` is one open connection; `StoreConnector` opens them. The
//! load and merge steps each open, use and explicitly close their own
//! connection.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStagingStore;
pub use postgres::{PgConnector, PgStagingStore};

use crate::domain::PriceRecord;
use async_trait::async_trait;
use thiserror::Error;

pub const DEFAULT_TABLE: &str = "stock_price_stage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("database query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("invalid table name '{0}' (expected identifier or schema.identifier)")]
    InvalidTableName(String),

    #[error("connection already closed")]
    Closed,

    #[error("{0}")]
    Rejected(String),
}

/// One open connection to the database holding the staging table.
#[async_trait]
pub trait StagingStore: Send {
    /// Start a transaction. Inserts outside a transaction autocommit.
    async fn begin(&mut self) -> Result<(), StoreError>;

    /// Insert rows, ignoring any whose `(ticker, dt)` already exists.
    /// Returns the number of rows actually inserted.
    async fn insert_ignore(&mut self, records: &[PriceRecord]) -> Result<u64, StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;

    /// Run a (possibly multi-statement) SQL script.
    async fn execute_script(&mut self, sql: &str) -> Result<(), StoreError>;

    /// Close the connection. Any further call fails with `Closed`.
    async fn close(&mut self) -> Result<(), StoreError>;
}

/// Opens connections described by a connection profile.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    /// Where connections go, for logs. Never includes credentials.
    fn describe(&self) -> String;

    async fn connect(&self) -> Result<Box<dyn StagingStore>, StoreError>;
}

/// Accepts `table` or `schema.table`, each part a plain SQL identifier.
///
/// The table name is interpolated into SQL text, so anything else is refused.
pub fn validate_table_name(name: &str) -> Result<(), StoreError> {
    let is_ident = |part: &str| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };

    let parts: Vec<&str> = name.split('.').collect();
    if (1..=2).contains(&parts.len()) && parts.iter().all(|p| is_ident(p)) {
        Ok(())
    } else {
        Err(StoreError::InvalidTableName(name.to_string()))
    }
}
