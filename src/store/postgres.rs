//! PostgreSQL backend.
//!
//! Steps and submission parameters are JSON-serialized for flexibility; the
//! optimistic version lives in a plain `version` column and every update of
//! an existing execution is conditional on it.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::domain::{Batch, Checksum, Execution, ExecutionStatus, OutputFile, Step};
use crate::store::{
    BatchStore, CasOutcome, ExecutionStore, OutputFileStore, Page, PageRequest, StoreError,
    StoreResult,
};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Initialize database schema.
    pub async fn init_schema(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS t_batch (
                id UUID PRIMARY KEY,
                correlation_id TEXT NOT NULL,
                process_business_id UUID NOT NULL,
                process_name TEXT NOT NULL,
                tenant TEXT NOT NULL,
                user_email TEXT NOT NULL,
                user_role TEXT NOT NULL,
                parameters JSONB NOT NULL,
                file_set_stats JSONB NOT NULL,
                created TIMESTAMPTZ NOT NULL
            );

            CREATE TABLE IF NOT EXISTS t_execution (
                id UUID PRIMARY KEY,
                batch_id UUID NOT NULL REFERENCES t_batch(id),
                correlation_id TEXT NOT NULL,
                batch_correlation_id TEXT NOT NULL,
                tenant TEXT NOT NULL,
                user_email TEXT NOT NULL,
                process_name TEXT NOT NULL,
                process_business_id UUID NOT NULL,
                input_files JSONB NOT NULL,
                expected_duration_millis BIGINT NOT NULL,
                timeout_after_millis BIGINT NOT NULL,
                current_status TEXT NOT NULL,
                steps JSONB NOT NULL,
                version BIGINT NOT NULL DEFAULT 0,
                created TIMESTAMPTZ NOT NULL,
                last_updated TIMESTAMPTZ NOT NULL
            );

            -- Index for the timeout sweep
            CREATE INDEX IF NOT EXISTS idx_execution_active
                ON t_execution(last_updated)
                WHERE current_status IN ('REGISTERED', 'RUNNING');

            -- Index for monitoring queries
            CREATE INDEX IF NOT EXISTS idx_execution_tenant_status
                ON t_execution(tenant, current_status, created);

            CREATE TABLE IF NOT EXISTS t_outputfile (
                id UUID PRIMARY KEY,
                exec_id UUID NOT NULL REFERENCES t_execution(id),
                name TEXT NOT NULL,
                checksum_method TEXT NOT NULL,
                checksum_value TEXT NOT NULL,
                url TEXT NOT NULL,
                size_bytes BIGINT NOT NULL,
                created TIMESTAMPTZ NOT NULL,
                downloaded BOOLEAN NOT NULL DEFAULT false,
                deleted BOOLEAN NOT NULL DEFAULT false
            );

            -- Index for the deletion sweep
            CREATE INDEX IF NOT EXISTS idx_outputfile_sweepable
                ON t_outputfile(created)
                WHERE downloaded AND NOT deleted;

            CREATE INDEX IF NOT EXISTS idx_outputfile_exec
                ON t_outputfile(exec_id);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn execution_from_row(row: &PgRow) -> StoreResult<Execution> {
    let status: String = row.get("current_status");
    let steps_json: serde_json::Value = row.get("steps");
    let steps: Vec<Step> = serde_json::from_value(steps_json)?;
    let input_files_json: serde_json::Value = row.get("input_files");
    let input_files: Vec<String> = serde_json::from_value(input_files_json)?;
    let version: i64 = row.get("version");
    Ok(Execution {
        id: row.get("id"),
        batch_id: row.get("batch_id"),
        correlation_id: row.get("correlation_id"),
        batch_correlation_id: row.get("batch_correlation_id"),
        tenant: row.get("tenant"),
        user_email: row.get("user_email"),
        process_name: row.get("process_name"),
        process_business_id: row.get("process_business_id"),
        input_files,
        expected_duration_millis: row.get("expected_duration_millis"),
        timeout_after_millis: row.get("timeout_after_millis"),
        current_status: ExecutionStatus::from_str(&status).map_err(StoreError::Message)?,
        steps,
        version: version as u64,
        created: row.get("created"),
        last_updated: row.get("last_updated"),
    })
}

fn file_from_row(row: &PgRow) -> OutputFile {
    let size: i64 = row.get("size_bytes");
    OutputFile {
        id: row.get("id"),
        exec_id: row.get("exec_id"),
        name: row.get("name"),
        checksum: Checksum {
            method: row.get("checksum_method"),
            value: row.get("checksum_value"),
        },
        url: row.get("url"),
        size_bytes: size as u64,
        created: row.get("created"),
        downloaded: row.get("downloaded"),
        deleted: row.get("deleted"),
    }
}

fn status_names(statuses: &[ExecutionStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

impl BatchStore for PgStore {
    fn clone_box(&self) -> Box<dyn BatchStore> {
        Box::new(self.clone())
    }

    fn insert<'a>(&'a self, batch: &'a Batch) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            sqlx::query(
                r#"
                INSERT INTO t_batch (id, correlation_id, process_business_id, process_name,
                    tenant, user_email, user_role, parameters, file_set_stats, created)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(batch.id)
            .bind(&batch.correlation_id)
            .bind(batch.process_business_id)
            .bind(&batch.process_name)
            .bind(&batch.tenant)
            .bind(&batch.user_email)
            .bind(&batch.user_role)
            .bind(&batch.parameters)
            .bind(serde_json::to_value(&batch.file_set_stats)?)
            .bind(batch.created)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn get(&self, id: Uuid) -> BoxFuture<'_, StoreResult<Option<Batch>>> {
        Box::pin(async move {
            let row = sqlx::query("SELECT * FROM t_batch WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            match row {
                Some(row) => {
                    let stats_json: serde_json::Value = row.get("file_set_stats");
                    Ok(Some(Batch {
                        id: row.get("id"),
                        correlation_id: row.get("correlation_id"),
                        process_business_id: row.get("process_business_id"),
                        process_name: row.get("process_name"),
                        tenant: row.get("tenant"),
                        user_email: row.get("user_email"),
                        user_role: row.get("user_role"),
                        parameters: row.get("parameters"),
                        file_set_stats: serde_json::from_value(stats_json)?,
                        persisted: true,
                        created: row.get("created"),
                    }))
                }
                None => Ok(None),
            }
        })
    }
}

impl ExecutionStore for PgStore {
    fn clone_box(&self) -> Box<dyn ExecutionStore> {
        Box::new(self.clone())
    }

    fn insert<'a>(&'a self, execution: &'a Execution) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            sqlx::query(
                r#"
                INSERT INTO t_execution (id, batch_id, correlation_id, batch_correlation_id,
                    tenant, user_email, process_name, process_business_id, input_files,
                    expected_duration_millis, timeout_after_millis, current_status, steps,
                    version, created, last_updated)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                "#,
            )
            .bind(execution.id)
            .bind(execution.batch_id)
            .bind(&execution.correlation_id)
            .bind(&execution.batch_correlation_id)
            .bind(&execution.tenant)
            .bind(&execution.user_email)
            .bind(&execution.process_name)
            .bind(execution.process_business_id)
            .bind(serde_json::to_value(&execution.input_files)?)
            .bind(execution.expected_duration_millis)
            .bind(execution.timeout_after_millis)
            .bind(execution.current_status.as_str())
            .bind(serde_json::to_value(&execution.steps)?)
            .bind(execution.version as i64)
            .bind(execution.created)
            .bind(execution.last_updated)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn get(&self, id: Uuid) -> BoxFuture<'_, StoreResult<Option<Execution>>> {
        Box::pin(async move {
            let row = sqlx::query("SELECT * FROM t_execution WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            row.as_ref().map(execution_from_row).transpose()
        })
    }

    fn compare_and_swap<'a>(
        &'a self,
        updated: &'a Execution,
        expected_version: u64,
    ) -> BoxFuture<'a, StoreResult<CasOutcome>> {
        Box::pin(async move {
            let result = sqlx::query(
                r#"
                UPDATE t_execution
                SET current_status = $3, steps = $4, last_updated = $5, version = version + 1
                WHERE id = $1 AND version = $2
                "#,
            )
            .bind(updated.id)
            .bind(expected_version as i64)
            .bind(updated.current_status.as_str())
            .bind(serde_json::to_value(&updated.steps)?)
            .bind(updated.last_updated)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                Ok(CasOutcome::Updated)
            } else {
                Ok(CasOutcome::VersionMismatch)
            }
        })
    }

    fn find_by_status<'a>(
        &'a self,
        tenant: &'a str,
        statuses: &'a [ExecutionStatus],
        page: PageRequest,
    ) -> BoxFuture<'a, StoreResult<Page<Execution>>> {
        Box::pin(async move {
            let names = status_names(statuses);
            let total: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM t_execution WHERE tenant = $1 AND current_status = ANY($2)",
            )
            .bind(tenant)
            .bind(&names)
            .fetch_one(&self.pool)
            .await?;

            let rows = sqlx::query(
                r#"
                SELECT * FROM t_execution
                WHERE tenant = $1 AND current_status = ANY($2)
                ORDER BY created, id
                LIMIT $3 OFFSET $4
                "#,
            )
            .bind(tenant)
            .bind(&names)
            .bind(page.size as i64)
            .bind(page.offset() as i64)
            .fetch_all(&self.pool)
            .await?;

            let items = rows
                .iter()
                .map(execution_from_row)
                .collect::<StoreResult<Vec<_>>>()?;
            Ok(Page {
                items,
                page: page.page,
                total: total as u64,
            })
        })
    }

    fn find_timed_out(
        &self,
        now: DateTime<Utc>,
        limit: u64,
    ) -> BoxFuture<'_, StoreResult<Vec<Execution>>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r#"
                SELECT * FROM t_execution
                WHERE current_status IN ('REGISTERED', 'RUNNING')
                  AND last_updated + (timeout_after_millis * INTERVAL '1 millisecond') < $1
                ORDER BY last_updated, id
                LIMIT $2
                "#,
            )
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(execution_from_row).collect()
        })
    }

    fn count_active<'a>(
        &'a self,
        user_email: &'a str,
        process_business_id: Uuid,
    ) -> BoxFuture<'a, StoreResult<u64>> {
        Box::pin(async move {
            let count: i64 = sqlx::query_scalar(
                r#"
                SELECT COUNT(*) FROM t_execution
                WHERE user_email = $1 AND process_business_id = $2
                  AND current_status IN ('REGISTERED', 'RUNNING')
                "#,
            )
            .bind(user_email)
            .bind(process_business_id)
            .fetch_one(&self.pool)
            .await?;
            Ok(count as u64)
        })
    }
}

impl OutputFileStore for PgStore {
    fn clone_box(&self) -> Box<dyn OutputFileStore> {
        Box::new(self.clone())
    }

    fn insert<'a>(&'a self, file: &'a OutputFile) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            sqlx::query(
                r#"
                INSERT INTO t_outputfile (id, exec_id, name, checksum_method, checksum_value,
                    url, size_bytes, created, downloaded, deleted)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(file.id)
            .bind(file.exec_id)
            .bind(&file.name)
            .bind(&file.checksum.method)
            .bind(&file.checksum.value)
            .bind(&file.url)
            .bind(file.size_bytes as i64)
            .bind(file.created)
            .bind(file.downloaded)
            .bind(file.deleted)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn get(&self, id: Uuid) -> BoxFuture<'_, StoreResult<Option<OutputFile>>> {
        Box::pin(async move {
            let row = sqlx::query("SELECT * FROM t_outputfile WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row.as_ref().map(file_from_row))
        })
    }

    fn set_downloaded(&self, id: Uuid) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            sqlx::query("UPDATE t_outputfile SET downloaded = true WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
    }

    fn set_deleted(&self, id: Uuid) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            sqlx::query("UPDATE t_outputfile SET deleted = true WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
    }

    fn find_downloaded_not_deleted<'a>(
        &'a self,
        tenant: &'a str,
        page: PageRequest,
    ) -> BoxFuture<'a, StoreResult<Page<OutputFile>>> {
        Box::pin(async move {
            let total: i64 = sqlx::query_scalar(
                r#"
                SELECT COUNT(*) FROM t_outputfile f
                JOIN t_execution e ON e.id = f.exec_id
                WHERE e.tenant = $1 AND f.downloaded AND NOT f.deleted
                "#,
            )
            .bind(tenant)
            .fetch_one(&self.pool)
            .await?;

            let rows = sqlx::query(
                r#"
                SELECT f.* FROM t_outputfile f
                JOIN t_execution e ON e.id = f.exec_id
                WHERE e.tenant = $1 AND f.downloaded AND NOT f.deleted
                ORDER BY f.created, f.id
                LIMIT $2 OFFSET $3
                "#,
            )
            .bind(tenant)
            .bind(page.size as i64)
            .bind(page.offset() as i64)
            .fetch_all(&self.pool)
            .await?;

            Ok(Page {
                items: rows.iter().map(file_from_row).collect(),
                page: page.page,
                total: total as u64,
            })
        })
    }

    fn find_by_exec_id(&self, exec_id: Uuid) -> BoxFuture<'_, StoreResult<Vec<OutputFile>>> {
        Box::pin(async move {
            let rows =
                sqlx::query("SELECT * FROM t_outputfile WHERE exec_id = $1 ORDER BY created, id")
                    .bind(exec_id)
                    .fetch_all(&self.pool)
                    .await?;
            Ok(rows.iter().map(file_from_row).collect())
        })
    }

    fn live_bytes_for_process(
        &self,
        process_business_id: Uuid,
    ) -> BoxFuture<'_, StoreResult<u64>> {
        Box::pin(async move {
            // SUM over BIGINT yields NUMERIC; cast back for the i64 decode.
            let total: Option<i64> = sqlx::query_scalar(
                r#"
                SELECT SUM(f.size_bytes)::BIGINT FROM t_outputfile f
                JOIN t_execution e ON e.id = f.exec_id
                WHERE e.process_business_id = $1 AND NOT f.deleted
                "#,
            )
            .bind(process_business_id)
            .fetch_one(&self.pool)
            .await?;
            Ok(total.unwrap_or(0) as u64)
        })
    }
}
