//! Postgres connector backed by a raw sqlx connection
//!
//! One `PgConnection` per pool slot; transaction demarcation is driven by
//! the pool, so plain `BEGIN`/`COMMIT`/`ROLLBACK` statements are used
//! rather than sqlx's own transaction type.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::postgres::{PgConnection, PgRow};
use sqlx::{Column, Connection, Row as _, TypeInfo};

use crate::connector::{Connector, RawConnection, Row, SqlValue};
use crate::error::DriverError;

/// Opens raw Postgres connections from a database URL.
#[derive(Debug, Clone)]
pub struct PgConnector {
    url: String,
}

impl PgConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Connection = PgRawConnection;

    async fn connect(&self) -> Result<Self::Connection, DriverError> {
        let conn = PgConnection::connect(&self.url)
            .await
            .map_err(|e| DriverError(e.to_string()))?;
        Ok(PgRawConnection { conn })
    }
}

/// One raw Postgres connection.
pub struct PgRawConnection {
    conn: PgConnection,
}

#[async_trait]
impl RawConnection for PgRawConnection {
    async fn begin(&mut self) -> Result<(), DriverError> {
        sqlx::query("BEGIN")
            .execute(&mut self.conn)
            .await
            .map_err(|e| DriverError(e.to_string()))?;
        Ok(())
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, DriverError> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = match param {
                SqlValue::Null => query.bind(Option::<String>::None),
                SqlValue::Bool(v) => query.bind(*v),
                SqlValue::Int(v) => query.bind(*v),
                SqlValue::Text(v) => query.bind(v.clone()),
                SqlValue::Timestamp(v) => query.bind(*v),
                SqlValue::Json(v) => query.bind(v.clone()),
            };
        }
        let rows = query
            .fetch_all(&mut self.conn)
            .await
            .map_err(|e| DriverError(e.to_string()))?;
        rows.iter().map(decode_row).collect()
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        sqlx::query("COMMIT")
            .execute(&mut self.conn)
            .await
            .map_err(|e| DriverError(e.to_string()))?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        sqlx::query("ROLLBACK")
            .execute(&mut self.conn)
            .await
            .map_err(|e| DriverError(e.to_string()))?;
        Ok(())
    }

    async fn close(self) {
        let _ = self.conn.close().await;
    }
}

fn decode_row(row: &PgRow) -> Result<Row, DriverError> {
    let mut values = Vec::with_capacity(row.len());
    for (i, column) in row.columns().iter().enumerate() {
        let value = match column.type_info().name() {
            "INT2" => row
                .try_get::<Option<i16>, _>(i)
                .map(|v| v.map(|v| SqlValue::Int(v as i64))),
            "INT4" => row
                .try_get::<Option<i32>, _>(i)
                .map(|v| v.map(|v| SqlValue::Int(v as i64))),
            "INT8" => row
                .try_get::<Option<i64>, _>(i)
                .map(|v| v.map(SqlValue::Int)),
            "BOOL" => row
                .try_get::<Option<bool>, _>(i)
                .map(|v| v.map(SqlValue::Bool)),
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => row
                .try_get::<Option<String>, _>(i)
                .map(|v| v.map(SqlValue::Text)),
            "TIMESTAMPTZ" => row
                .try_get::<Option<DateTime<Utc>>, _>(i)
                .map(|v| v.map(SqlValue::Timestamp)),
            "TIMESTAMP" => row
                .try_get::<Option<NaiveDateTime>, _>(i)
                .map(|v| v.map(|v| SqlValue::Timestamp(v.and_utc()))),
            "JSON" | "JSONB" => row
                .try_get::<Option<serde_json::Value>, _>(i)
                .map(|v| v.map(SqlValue::Json)),
            // Functions like pg_advisory_xact_lock select as VOID.
            "VOID" => Ok(None),
            other => {
                return Err(DriverError(format!(
                    "unsupported column type {other} at index {i}"
                )))
            }
        }
        .map_err(|e| DriverError(e.to_string()))?;
        values.push(value.unwrap_or(SqlValue::Null));
    }
    Ok(Row::new(values))
}
