//! SQLite execution trace sink.
//!
//! Implements `TraceSink` over `execution_records` (one row per run) and
//! `execution_step_traces` (one row per attempt, ordered by `seq`). Records
//! are written in a single transaction; the audit queries read them back.

use sqlx::Row;
use stepweave_core::repository::TraceSink;
use stepweave_types::error::RepositoryError;
use stepweave_types::execution::{ExecutionRecord, RunStatus, StepStatus, StepTrace};
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, query_error};

pub struct SqliteTraceSink {
    pool: DatabasePool,
}

impl SqliteTraceSink {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Load one execution record with its step traces.
    pub async fn get_record(&self, execution_id: &Uuid) -> Result<Option<ExecutionRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM execution_records WHERE execution_id = ?")
            .bind(execution_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let record = RecordRow::from_row(&row).map_err(query_error)?;
                let steps = self.load_steps(&record.execution_id).await?;
                Ok(Some(record.into_record(steps)?))
            }
            None => Ok(None),
        }
    }

    /// Most recent records first, optionally for one workflow.
    pub async fn list_records(
        &self,
        workflow_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<ExecutionRecord>, RepositoryError> {
        let rows = match workflow_id {
            Some(workflow_id) => {
                sqlx::query(
                    "SELECT * FROM execution_records WHERE workflow_id = ? ORDER BY started_at DESC LIMIT ?",
                )
                .bind(workflow_id)
                .bind(limit as i64)
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM execution_records ORDER BY started_at DESC LIMIT ?")
                    .bind(limit as i64)
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(query_error)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let record = RecordRow::from_row(row).map_err(query_error)?;
            let steps = self.load_steps(&record.execution_id).await?;
            records.push(record.into_record(steps)?);
        }
        Ok(records)
    }

    async fn load_steps(&self, execution_id: &str) -> Result<Vec<StepTrace>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM execution_step_traces WHERE execution_id = ? ORDER BY seq ASC")
            .bind(execution_id)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        let mut steps = Vec::with_capacity(rows.len());
        for row in &rows {
            let step = StepRow::from_row(row).map_err(query_error)?;
            steps.push(step.into_trace()?);
        }
        Ok(steps)
    }
}

impl TraceSink for SqliteTraceSink {
    async fn append(&self, record: &ExecutionRecord) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;
        let execution_id = record.execution_id.to_string();

        sqlx::query(
            r#"INSERT INTO execution_records
               (execution_id, workflow_id, status, error, started_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&execution_id)
        .bind(&record.workflow_id)
        .bind(record.status.as_str())
        .bind(&record.error)
        .bind(format_datetime(&record.started_at))
        .bind(record.completed_at.as_ref().map(format_datetime))
        .execute(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                RepositoryError::Conflict(format!("execution record {execution_id} already exists"))
            }
            other => query_error(other),
        })?;

        for (seq, step) in record.steps.iter().enumerate() {
            sqlx::query(
                r#"INSERT INTO execution_step_traces
                   (execution_id, seq, step_id, group_id, attempt, status, error, started_at, completed_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(&execution_id)
            .bind(seq as i64)
            .bind(&step.step_id)
            .bind(&step.group_id)
            .bind(step.attempt as i64)
            .bind(step.status.as_str())
            .bind(&step.error)
            .bind(format_datetime(&step.started_at))
            .bind(format_datetime(&step.completed_at))
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;
        }

        tx.commit().await.map_err(query_error)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct RecordRow {
    execution_id: String,
    workflow_id: String,
    status: String,
    error: Option<String>,
    started_at: String,
    completed_at: Option<String>,
}

impl RecordRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            execution_id: row.try_get("execution_id")?,
            workflow_id: row.try_get("workflow_id")?,
            status: row.try_get("status")?,
            error: row.try_get("error")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_record(self, steps: Vec<StepTrace>) -> Result<ExecutionRecord, RepositoryError> {
        let execution_id = self
            .execution_id
            .parse::<Uuid>()
            .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))?;
        let status: RunStatus = self.status.parse().map_err(RepositoryError::Query)?;

        Ok(ExecutionRecord {
            execution_id,
            workflow_id: self.workflow_id,
            started_at: parse_datetime(&self.started_at)?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            steps,
            status,
            error: self.error,
        })
    }
}

struct StepRow {
    step_id: String,
    group_id: Option<String>,
    attempt: i64,
    status: String,
    error: Option<String>,
    started_at: String,
    completed_at: String,
}

impl StepRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            step_id: row.try_get("step_id")?,
            group_id: row.try_get("group_id")?,
            attempt: row.try_get("attempt")?,
            status: row.try_get("status")?,
            error: row.try_get("error")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_trace(self) -> Result<StepTrace, RepositoryError> {
        let status: StepStatus = self.status.parse().map_err(RepositoryError::Query)?;
        Ok(StepTrace {
            step_id: self.step_id,
            group_id: self.group_id,
            attempt: u32::try_from(self.attempt)
                .map_err(|_| RepositoryError::Query(format!("invalid attempt: {}", self.attempt)))?,
            started_at: parse_datetime(&self.started_at)?,
            completed_at: parse_datetime(&self.completed_at)?,
            status,
            error: self.error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::pool::tests::test_pool;
    use chrono::{Duration, Utc};

    fn trace(step_id: &str, group_id: Option<&str>, attempt: u32, status: StepStatus) -> StepTrace {
        let now = Utc::now();
        StepTrace {
            step_id: step_id.to_string(),
            group_id: group_id.map(str::to_string),
            attempt,
            started_at: now,
            completed_at: now + Duration::milliseconds(5),
            status,
            error: (status == StepStatus::Error).then(|| "status 503: busy".to_string()),
        }
    }

    fn record(workflow_id: &str, started_offset_secs: i64) -> ExecutionRecord {
        let started_at = Utc::now() + Duration::seconds(started_offset_secs);
        ExecutionRecord {
            execution_id: Uuid::now_v7(),
            workflow_id: workflow_id.to_string(),
            started_at,
            completed_at: Some(started_at + Duration::seconds(1)),
            steps: vec![
                trace("fetch", None, 1, StepStatus::Error),
                trace("fetch", None, 2, StepStatus::Success),
                trace("reviews", Some("enrich"), 1, StepStatus::Success),
                StepTrace::skipped("notify", None),
            ],
            status: RunStatus::Success,
            error: None,
        }
    }

    /// Stored timestamps have microsecond precision.
    fn truncate(mut record: ExecutionRecord) -> ExecutionRecord {
        let round = |dt: chrono::DateTime<Utc>| parse_datetime(&format_datetime(&dt)).unwrap();
        record.started_at = round(record.started_at);
        record.completed_at = record.completed_at.map(round);
        for step in &mut record.steps {
            step.started_at = round(step.started_at);
            step.completed_at = round(step.completed_at);
        }
        record
    }

    #[tokio::test]
    async fn append_and_get_roundtrip() {
        let sink = SqliteTraceSink::new(test_pool().await);
        let original = record("research", 0);

        sink.append(&original).await.unwrap();
        let loaded = sink.get_record(&original.execution_id).await.unwrap().unwrap();

        assert_eq!(loaded, truncate(original));
        assert_eq!(loaded.attempts_for("fetch"), 2);
        assert_eq!(loaded.steps[2].group_id.as_deref(), Some("enrich"));
    }

    #[tokio::test]
    async fn get_missing_record_is_none() {
        let sink = SqliteTraceSink::new(test_pool().await);
        assert!(sink.get_record(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_append_is_a_conflict() {
        let sink = SqliteTraceSink::new(test_pool().await);
        let r = record("research", 0);
        sink.append(&r).await.unwrap();
        assert!(matches!(sink.append(&r).await, Err(RepositoryError::Conflict(_))));
    }

    #[tokio::test]
    async fn list_records_newest_first_with_filter() {
        let sink = SqliteTraceSink::new(test_pool().await);
        let old = record("research", -60);
        let new = record("research", 0);
        let mut failed = record("pricing", -30);
        failed.status = RunStatus::Error;
        failed.error = Some("step 'quote' failed".to_string());

        for r in [&old, &new, &failed] {
            sink.append(r).await.unwrap();
        }

        let all = sink.list_records(None, 10).await.unwrap();
        let ids: Vec<Uuid> = all.iter().map(|r| r.execution_id).collect();
        assert_eq!(ids, vec![new.execution_id, failed.execution_id, old.execution_id]);

        let research = sink.list_records(Some("research"), 1).await.unwrap();
        assert_eq!(research.len(), 1);
        assert_eq!(research[0].execution_id, new.execution_id);

        let pricing = sink.list_records(Some("pricing"), 10).await.unwrap();
        assert_eq!(pricing[0].status, RunStatus::Error);
        assert_eq!(pricing[0].steps.len(), 4);
    }
}
