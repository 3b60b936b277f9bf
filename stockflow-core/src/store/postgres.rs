//! PostgreSQL staging store.

use super::{validate_table_name, StagingStore, StoreConnector, StoreError};
use crate::config::ConnectionProfile;
use crate::domain::PriceRecord;
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{Connection, Executor, Postgres, QueryBuilder};
use tracing::debug;

/// Postgres caps a statement at 65535 bind parameters; 9 columns per row.
const INSERT_CHUNK_ROWS: usize = 7000;

/// One connection to the database holding the staging table.
pub struct PgStagingStore {
    conn: Option<PgConnection>,
    table: String,
}

impl PgStagingStore {
    pub async fn connect(profile: &ConnectionProfile, table: &str) -> Result<Self, StoreError> {
        validate_table_name(table)?;

        let options = PgConnectOptions::new()
            .host(&profile.host)
            .port(profile.port)
            .database(&profile.schema)
            .username(&profile.user)
            .password(&profile.password);

        let conn = PgConnection::connect_with(&options)
            .await
            .map_err(|source| StoreError::Connect {
                target: profile.target(),
                source,
            })?;

        Ok(Self {
            conn: Some(conn),
            table: table.to_string(),
        })
    }

    fn conn(&mut self) -> Result<&mut PgConnection, StoreError> {
        self.conn.as_mut().ok_or(StoreError::Closed)
    }

    /// Create the staging table and its `(ticker, dt)` unique constraint if absent.
    pub async fn ensure_table(&mut self) -> Result<(), StoreError> {
        let ddl = create_table_sql(&self.table);
        let conn = self.conn()?;
        conn.execute(sqlx::raw_sql(&ddl)).await?;
        Ok(())
    }
}

pub(crate) fn create_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (\
         ticker text NOT NULL, \
         dt timestamptz NOT NULL, \
         open double precision, \
         high double precision, \
         low double precision, \
         close double precision, \
         volume double precision, \
         dividends double precision, \
         stock_splits double precision, \
         UNIQUE (ticker, dt))"
    )
}

fn insert_prefix(table: &str) -> String {
    format!(
        "INSERT INTO {table} \
         (ticker, dt, open, high, low, close, volume, dividends, stock_splits) "
    )
}

#[async_trait]
impl StagingStore for PgStagingStore {
    async fn begin(&mut self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(sqlx::raw_sql("BEGIN")).await?;
        Ok(())
    }

    async fn insert_ignore(&mut self, records: &[PriceRecord]) -> Result<u64, StoreError> {
        let prefix = insert_prefix(&self.table);
        let mut inserted = 0;

        for chunk in records.chunks(INSERT_CHUNK_ROWS) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(&prefix);
            qb.push_values(chunk, |mut b, r| {
                b.push_bind(r.ticker.as_str().to_string())
                    .push_bind(r.dt)
                    .push_bind(r.open)
                    .push_bind(r.high)
                    .push_bind(r.low)
                    .push_bind(r.close)
                    .push_bind(r.volume)
                    .push_bind(r.dividends)
                    .push_bind(r.stock_splits);
            });
            qb.push(" ON CONFLICT (ticker, dt) DO NOTHING");

            let conn = self.conn()?;

            let result = qb.build().execute(&mut *conn).await?;
            debug!(
                table = %self.table,
                rows = chunk.len(),
                inserted = result.rows_affected(),
                "insert batch"
            );
            inserted += result.rows_affected();
        }

        Ok(inserted)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(sqlx::raw_sql("COMMIT")).await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(sqlx::raw_sql("ROLLBACK")).await?;
        Ok(())
    }

    async fn execute_script(&mut self, sql: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(sqlx::raw_sql(sql)).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        let conn = self.conn.take().ok_or(StoreError::Closed)?;
        conn.close().await?;
        Ok(())
    }
}

/// Opens `PgStagingStore` connections from a connection profile.
pub struct PgConnector {
    profile: ConnectionProfile,
    table: String,
    create_table: bool,
}

impl PgConnector {
    pub fn new(
        profile: ConnectionProfile,
        table: impl Into<String>,
        create_table: bool,
    ) -> Result<Self, StoreError> {
        let table = table.into();
        validate_table_name(&table)?;
        Ok(Self {
            profile,
            table,
            create_table,
        })
    }
}

#[async_trait]
impl StoreConnector for PgConnector {
    fn describe(&self) -> String {
        format!("postgres {} table {}", self.profile.target(), self.table)
    }

    async fn connect(&self) -> Result<Box<dyn StagingStore>, StoreError> {
        let mut store = PgStagingStore::connect(&self.profile, &self.table).await?;
        if self.create_table {
            store.ensure_table().await?;
        }
        Ok(Box::new(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ddl_declares_the_conflict_key() {
        let ddl = create_table_sql("stock_price_stage");
        assert!(ddl.starts_with("CREATE TABLE IF NOT EXISTS stock_price_stage ("));
        assert!(ddl.contains("dt timestamptz NOT NULL"));
        assert!(ddl.contains("UNIQUE (ticker, dt)"));
    }

    #[test]
    fn insert_lists_all_nine_columns() {
        let sql = insert_prefix("staging.prices");
        assert_eq!(
            sql,
            "INSERT INTO staging.prices (ticker, dt, open, high, low, close, volume, dividends, stock_splits) "
        );
    }

    #[test]
    fn connector_rejects_unsafe_table_names() {
        let profile = ConnectionProfile::default();
        assert!(matches!(
            PgConnector::new(profile, "x; DROP TABLE y", false),
            Err(StoreError::InvalidTableName(_))
        ));
    }

    #[test]
    fn chunk_stays_under_bind_limit() {
        assert!(INSERT_CHUNK_ROWS * 9 <= u16::MAX as usize);
    }
}
