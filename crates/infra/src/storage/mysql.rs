//! MySQL-backed manager view of computation status.
//!
//! Both operations go through stored procedures owned by the database:
//!
//! - `list_system_data_status()` returns `system_id`, `dataset`, `version`,
//!   `status`, `hash_changed` and `user` for every (system, dataset)
//! - `report_failure(system_id, dataset, message)` records the message and
//!   sets the computation to `error`
//!
//! ## Error Mapping
//!
//! | SQLx Error | StorageError |
//! |------------|--------------|
//! | Database | `Query` (with the failing operation) |
//! | PoolClosed, PoolTimedOut, Io, Tls | `Connection` |
//! | ColumnNotFound, ColumnDecode, Decode | `CorruptRow` |
//! | Other | `Query` |

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions, MySqlRow};
use sqlx::{MySqlPool, Row};
use tracing::{instrument, Span};

use esprr_core::{DataStatus, Dataset, StatusSnapshotEntry, SystemId, UserId};

use super::{ComputeManagement, FailureReport, StorageError};

/// Manager access over a MySQL pool.
///
/// The pool must be opened with the manager account; ordinary API users do
/// not have execute rights on these procedures.
#[derive(Debug, Clone)]
pub struct MySqlComputeManagement {
    pool: MySqlPool,
}

impl MySqlComputeManagement {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    /// Open a small pool; the sync loop runs one step at a time.
    pub async fn connect(options: MySqlConnectOptions) -> Result<Self, StorageError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl ComputeManagement for MySqlComputeManagement {
    #[instrument(skip(self), fields(row_count = tracing::field::Empty), err)]
    async fn list_status(&self) -> Result<Vec<StatusSnapshotEntry>, StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let rows = sqlx::query("CALL list_system_data_status()")
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("list_system_data_status", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        let entries = rows
            .iter()
            .map(entry_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Span::current().record("row_count", entries.len());
        Ok(entries)
    }

    #[instrument(skip(self, reports), fields(report_count = reports.len()), err)]
    async fn report_failures(&self, reports: &[FailureReport]) -> Result<(), StorageError> {
        if reports.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        for report in reports {
            sqlx::query("CALL report_failure(?, ?, ?)")
                .bind(report.system_id.to_string())
                .bind(report.dataset.as_str())
                .bind(&report.message)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("report_failure", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }
}

fn entry_from_row(row: &MySqlRow) -> Result<StatusSnapshotEntry, StorageError> {
    let system_id: String = row
        .try_get("system_id")
        .map_err(|e| map_sqlx_error("list_system_data_status", e))?;
    let dataset: String = row
        .try_get("dataset")
        .map_err(|e| map_sqlx_error("list_system_data_status", e))?;
    let version: Option<String> = row
        .try_get("version")
        .map_err(|e| map_sqlx_error("list_system_data_status", e))?;
    let status: String = row
        .try_get("status")
        .map_err(|e| map_sqlx_error("list_system_data_status", e))?;
    let hash_changed: i64 = row
        .try_get("hash_changed")
        .map_err(|e| map_sqlx_error("list_system_data_status", e))?;
    let user: String = row
        .try_get("user")
        .map_err(|e| map_sqlx_error("list_system_data_status", e))?;

    status_entry(&system_id, dataset, version, &status, hash_changed != 0, user)
}

/// Build a snapshot entry from raw column values.
fn status_entry(
    system_id: &str,
    dataset: String,
    version: Option<String>,
    status: &str,
    hash_changed: bool,
    user: String,
) -> Result<StatusSnapshotEntry, StorageError> {
    let corrupt = |e: esprr_core::DomainError| StorageError::CorruptRow(e.to_string());
    Ok(StatusSnapshotEntry {
        system_id: system_id.parse::<SystemId>().map_err(corrupt)?,
        dataset: Dataset::new(dataset).map_err(corrupt)?,
        version,
        status: DataStatus::from_stored(status).map_err(corrupt)?,
        hash_changed,
        user: UserId::new(user).map_err(corrupt)?,
    })
}

/// Map a SQLx error to a `StorageError`, keeping the failing operation.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::Database(db_err) => StorageError::Query {
            operation: operation.to_string(),
            message: db_err.message().to_string(),
        },
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
            StorageError::Connection(format!("connection pool unavailable in {operation}"))
        }
        sqlx::Error::Io(e) => StorageError::Connection(format!("io error in {operation}: {e}")),
        sqlx::Error::Tls(e) => StorageError::Connection(format!("tls error in {operation}: {e}")),
        e @ (sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)) => StorageError::CorruptRow(format!("{operation}: {e}")),
        other => StorageError::Query {
            operation: operation.to_string(),
            message: other.to_string(),
        },
    }
}
