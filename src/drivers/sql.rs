use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{Column, Row, TypeInfo};
use tracing::debug;

use crate::config::{DataKind, DeviceConfig, TagConfig};
use crate::error::GatewayError;
use crate::snapshot::Value;

use super::traits::{ProtocolDriver, WriteOutcome};

/// Dialect of identifier quoting and ordering syntax, resolved once from
/// `db_kind` at open time (DESIGN.md's SQL dialect mapping decision).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SqlDialect {
    Postgres,
    MySql,
    Sqlite,
}

impl SqlDialect {
    fn from_db_kind(kind: &str) -> Result<Self, GatewayError> {
        match kind {
            "postgres" | "postgresql" => Ok(SqlDialect::Postgres),
            "mysql" => Ok(SqlDialect::MySql),
            "sqlite" => Ok(SqlDialect::Sqlite),
            other => Err(GatewayError::Configuration(format!(
                "unsupported db_kind '{other}' — only postgres/mysql/sqlite are implemented"
            ))),
        }
    }

    fn quote(&self, ident: &str) -> String {
        match self {
            SqlDialect::Postgres | SqlDialect::Sqlite => format!("\"{ident}\""),
            SqlDialect::MySql => format!("`{ident}`"),
        }
    }

    fn select_latest(&self, table: &str, order_col: &str) -> String {
        format!(
            "SELECT * FROM {} ORDER BY {} DESC LIMIT 1",
            self.quote(table),
            self.quote(order_col)
        )
    }
}

/// SQL adapter (§4.1). Addresses are column names within a configured
/// table. Stands in for the original's ODBC driver — no ODBC crate exists
/// in the ecosystem this gateway otherwise draws from — using `sqlx`'s
/// Postgres/MySQL/SQLite backends through its dialect-erased `Any` pool.
pub struct SqlDriver {
    config: DeviceConfig,
    dialect: SqlDialect,
    table: String,
    pool: Option<sqlx::AnyPool>,
}

impl SqlDriver {
    pub fn new(config: DeviceConfig) -> Result<Self, GatewayError> {
        let kind = config
            .db_kind
            .as_deref()
            .ok_or_else(|| GatewayError::Configuration("db_kind not set for sql device".into()))?;
        let dialect = SqlDialect::from_db_kind(kind)?;
        let table = config
            .table_name
            .clone()
            .unwrap_or_else(|| "dados_processo".to_string());
        Ok(SqlDriver {
            config,
            dialect,
            table,
            pool: None,
        })
    }

    async fn discover_order_column(pool: &sqlx::AnyPool, dialect: SqlDialect, table: &str) -> Result<String, GatewayError> {
        let probe = format!("SELECT * FROM {} LIMIT 1", dialect.quote(table));
        let row = sqlx::query(&probe)
            .fetch_optional(pool)
            .await
            .map_err(|e| GatewayError::Transport(format!("column discovery failed: {e}")))?;

        let names: Vec<String> = match row {
            Some(r) => r.columns().iter().map(|c| c.name().to_string()).collect(),
            None => return Err(GatewayError::Protocol(format!("table {table} has no columns"))),
        };

        Ok(if names.iter().any(|n| n == "timestamp") {
            "timestamp".to_string()
        } else {
            names.into_iter().next().ok_or_else(|| {
                GatewayError::Protocol(format!("table {table} has no columns"))
            })?
        })
    }

    fn extract_value(row: &AnyRow, column: &str, kind: DataKind) -> Result<Value, GatewayError> {
        let idx = row
            .columns()
            .iter()
            .position(|c| c.name() == column)
            .ok_or_else(|| GatewayError::Configuration(format!("unknown column {column}")))?;

        match kind {
            DataKind::Bool => row
                .try_get::<bool, _>(idx)
                .map(Value::Bool)
                .map_err(|e| GatewayError::Coercion(format!("column {column} not bool: {e}"))),
            DataKind::Int => row
                .try_get::<i64, _>(idx)
                .map(Value::Int)
                .map_err(|e| GatewayError::Coercion(format!("column {column} not int: {e}"))),
            DataKind::Float => row
                .try_get::<f64, _>(idx)
                .map(Value::Float)
                .map_err(|e| GatewayError::Coercion(format!("column {column} not float: {e}"))),
            DataKind::String => row
                .try_get::<String, _>(idx)
                .map(Value::String)
                .map_err(|e| GatewayError::Coercion(format!("column {column} not string: {e}"))),
        }
    }

    /// Decides the auto-filled value for the table's first column when it
    /// is absent from a write's column set (§4.1: timestamp columns get
    /// `now`, integer columns get `max+1`).
    async fn autofill_first_column(
        pool: &sqlx::AnyPool,
        dialect: SqlDialect,
        table: &str,
        first_column: &str,
        first_type: &str,
    ) -> Result<Value, GatewayError> {
        let lowered = first_type.to_lowercase();
        if lowered.contains("date") || lowered.contains("time") {
            return Ok(Value::String(Utc::now().to_rfc3339()));
        }
        if lowered.contains("int") {
            let query = format!(
                "SELECT MAX({}) FROM {}",
                dialect.quote(first_column),
                dialect.quote(table)
            );
            let row = sqlx::query(&query)
                .fetch_one(pool)
                .await
                .map_err(|e| GatewayError::Transport(format!("max lookup failed: {e}")))?;
            let current: Option<i64> = row.try_get(0).ok();
            return Ok(Value::Int(current.unwrap_or(0) + 1));
        }
        Err(GatewayError::Coercion(format!(
            "first column {first_column} has unsupported type {first_type} for autofill"
        )))
    }

    async fn first_column_info(
        pool: &sqlx::AnyPool,
        dialect: SqlDialect,
        table: &str,
    ) -> Result<(String, String), GatewayError> {
        let probe = format!("SELECT * FROM {} LIMIT 1", dialect.quote(table));
        let row = sqlx::query(&probe)
            .fetch_optional(pool)
            .await
            .map_err(|e| GatewayError::Transport(format!("column discovery failed: {e}")))?
            .ok_or_else(|| GatewayError::Protocol(format!("table {table} is empty")))?;

        let col = row
            .columns()
            .first()
            .ok_or_else(|| GatewayError::Protocol(format!("table {table} has no columns")))?;
        Ok((col.name().to_string(), col.type_info().name().to_string()))
    }

    fn value_to_sql(value: &Value) -> String {
        match value {
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        }
    }

    async fn insert_row(
        &self,
        pool: &sqlx::AnyPool,
        mut values: HashMap<String, Value>,
    ) -> Result<(), GatewayError> {
        let (first_col, first_type) = Self::first_column_info(pool, self.dialect, &self.table).await?;
        if !values.contains_key(&first_col) {
            let filled = Self::autofill_first_column(pool, self.dialect, &self.table, &first_col, &first_type).await?;
            values.insert(first_col, filled);
        }

        let columns: Vec<String> = values.keys().cloned().collect();
        let quoted_cols: Vec<String> = columns.iter().map(|c| self.dialect.quote(c)).collect();
        let literals: Vec<String> = columns
            .iter()
            .map(|c| Self::value_to_sql(&values[c]))
            .collect();

        let query = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.dialect.quote(&self.table),
            quoted_cols.join(", "),
            literals.join(", ")
        );

        sqlx::query(&query)
            .execute(pool)
            .await
            .map_err(|e| GatewayError::Transport(format!("insert failed: {e}")))?;
        Ok(())
    }

    async fn update_row(
        &self,
        pool: &sqlx::AnyPool,
        values: HashMap<String, Value>,
        row_id_column: &str,
        row_id: Value,
    ) -> Result<(), GatewayError> {
        if values.is_empty() {
            return Err(GatewayError::Configuration(
                "batch write with no columns".into(),
            ));
        }

        let assignments: Vec<String> = values
            .iter()
            .map(|(col, val)| format!("{} = {}", self.dialect.quote(col), Self::value_to_sql(val)))
            .collect();

        let query = format!(
            "UPDATE {} SET {} WHERE {} = {}",
            self.dialect.quote(&self.table),
            assignments.join(", "),
            self.dialect.quote(row_id_column),
            Self::value_to_sql(&row_id)
        );

        sqlx::query(&query)
            .execute(pool)
            .await
            .map_err(|e| GatewayError::Transport(format!("update failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl ProtocolDriver for SqlDriver {
    async fn open(&mut self, timeout: Duration) -> Result<(), GatewayError> {
        debug!(device = %self.config.id, "opening sql session");

        let pool = AnyPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(timeout)
            .connect(&self.config.endpoint)
            .await
            .map_err(|e| GatewayError::Transport(format!("connect failed: {e}")))?;

        self.pool = Some(pool);
        Ok(())
    }

    async fn read(&mut self, tags: &[TagConfig]) -> Vec<Result<Value, GatewayError>> {
        let pool = match &self.pool {
            Some(p) => p,
            None => {
                return tags
                    .iter()
                    .map(|_| Err(GatewayError::Transport("not connected".into())))
                    .collect()
            }
        };

        let order_col = match Self::discover_order_column(pool, self.dialect, &self.table).await {
            Ok(c) => c,
            Err(e) => return tags.iter().map(|_| Err(e.clone_like())).collect(),
        };

        let query = self.dialect.select_latest(&self.table, &order_col);
        let row = sqlx::query(&query).fetch_optional(pool).await;

        match row {
            Ok(Some(row)) => tags
                .iter()
                .map(|tag| Self::extract_value(&row, &tag.address, tag.data_kind))
                .collect(),
            Ok(None) => tags
                .iter()
                .map(|_| Err(GatewayError::Protocol("no rows in table".into())))
                .collect(),
            Err(e) => tags
                .iter()
                .map(|_| Err(GatewayError::Transport(format!("select failed: {e}"))))
                .collect(),
        }
    }

    async fn write(
        &mut self,
        address: &str,
        value: Value,
        _kind: DataKind,
    ) -> Result<WriteOutcome, GatewayError> {
        let pool = self
            .pool
            .clone()
            .ok_or_else(|| GatewayError::Transport("not connected".into()))?;

        let mut values: HashMap<String, Value> = HashMap::new();
        values.insert(address.to_string(), value);
        self.insert_row(&pool, values).await?;
        Ok(WriteOutcome::unconfirmed())
    }

    /// Batch write (§4.1 SQL, §6 "write wire semantics"): `INSERT` of the
    /// given columns, or `UPDATE ... WHERE <row_id>` when an explicit row
    /// id is supplied.
    async fn write_batch(
        &mut self,
        values: HashMap<String, Value>,
        row_id: Option<(String, Value)>,
    ) -> Result<(), GatewayError> {
        let pool = self
            .pool
            .clone()
            .ok_or_else(|| GatewayError::Transport("not connected".into()))?;

        match row_id {
            Some((column, id)) => self.update_row(&pool, values, &column, id).await,
            None => self.insert_row(&pool, values).await.map(|_| ()),
        }
    }

    async fn close(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }
    }

    fn alive(&self) -> bool {
        self.pool.as_ref().map(|p| !p.is_closed()).unwrap_or(false)
    }
}

impl GatewayError {
    /// `GatewayError` deliberately doesn't derive `Clone` (most variants
    /// wrap formatted strings already); this narrow helper lets one
    /// discovery failure fan out to every tag in a read batch.
    fn clone_like(&self) -> GatewayError {
        GatewayError::Transport(self.to_string())
    }
}
