use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tokio::sync::Mutex;
use tracing::info;

use super::delivery::DeliveryReceipt;
use super::error::{RetryClass, StageError};
use super::event::{CiEvent, CiSource, RawLogRef};
use super::extract::ExtractedSummary;
use super::pipeline::{AttemptMap, PipelineRun, RunState, Stage, StageAttempts};

/// Durable store for CI events and their pipeline runs.
///
/// One sqlite database behind an async mutex; the `event_id` primary key
/// on `pipeline_runs` is the uniqueness constraint that makes concurrent
/// duplicate webhooks race safely — the loser's insert is a no-op and it
/// attaches to the winner's record. Structured fields are JSON columns.
pub struct Store {
    db: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = Connection::open(path.as_ref()).context("opening pipeline store")?;
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS ci_events (
                event_id    TEXT PRIMARY KEY,
                source      TEXT NOT NULL,
                repository  TEXT NOT NULL,
                commit_sha  TEXT NOT NULL,
                raw_log_ref TEXT NOT NULL,
                build_url   TEXT,
                received_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS pipeline_runs (
                event_id          TEXT PRIMARY KEY REFERENCES ci_events(event_id),
                run_id            TEXT NOT NULL,
                state             TEXT NOT NULL,
                attempts          TEXT NOT NULL DEFAULT '{}',
                last_error_kind   TEXT,
                last_error        TEXT,
                extracted_summary TEXT,
                diagnosis         TEXT,
                patch_proposal    TEXT,
                delivery_receipt  TEXT,
                created_at        TEXT NOT NULL,
                updated_at        TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    /// Insert the event and its run if this `event_id` is new. Returns
    /// `true` when a fresh run was created, `false` when one already
    /// existed (duplicate webhook — attach, never restart).
    pub async fn create_run(&self, event: &CiEvent) -> Result<bool> {
        let db = self.db.lock().await;
        let now = Utc::now().to_rfc3339();
        db.execute(
            "INSERT OR IGNORE INTO ci_events
             (event_id, source, repository, commit_sha, raw_log_ref, build_url, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.event_id,
                event.source.as_str(),
                event.repository,
                event.commit_sha,
                serde_json::to_string(&event.raw_log_ref)?,
                event.build_url,
                event.received_at.to_rfc3339(),
            ],
        )?;
        let inserted = db.execute(
            "INSERT OR IGNORE INTO pipeline_runs (event_id, run_id, state, created_at, updated_at)
             VALUES (?1, ?2, 'received', ?3, ?3)",
            params![event.event_id, uuid::Uuid::new_v4().to_string(), now],
        )?;
        if inserted > 0 {
            info!(event_id = %event.event_id, "pipeline run created");
        }
        Ok(inserted > 0)
    }

    pub async fn get_event(&self, event_id: &str) -> Result<Option<CiEvent>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT event_id, source, repository, commit_sha, raw_log_ref, build_url, received_at
             FROM ci_events WHERE event_id = ?1",
        )?;
        stmt.query_row(params![event_id], row_to_event)
            .optional()
            .map_err(Into::into)
    }

    pub async fn get_run(&self, event_id: &str) -> Result<Option<PipelineRun>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!("{} WHERE event_id = ?1", RUN_SELECT))?;
        stmt.query_row(params![event_id], row_to_run)
            .optional()
            .map_err(Into::into)
    }

    /// All non-terminal runs, oldest first. Used by startup resume and the
    /// operator listing.
    pub async fn list_active_runs(&self) -> Result<Vec<PipelineRun>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "{} WHERE state IN ('received', 'extracting', 'diagnosing', 'patching',
                                'skipped_low_confidence', 'delivering')
             ORDER BY created_at ASC",
            RUN_SELECT
        ))?;
        let rows = stmt.query_map([], row_to_run)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Compare-and-swap state transition. Fails the swap (returns `false`)
    /// when the run has moved on or been abandoned since it was loaded;
    /// callers reload and decide.
    pub async fn transition(&self, event_id: &str, from: RunState, to: RunState) -> Result<bool> {
        if !super::pipeline::can_transition(from, to) {
            return Err(anyhow!(
                "illegal transition {} -> {} for {}",
                from.as_str(),
                to.as_str(),
                event_id
            ));
        }
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE pipeline_runs SET state = ?1, updated_at = ?2
             WHERE event_id = ?3 AND state = ?4",
            params![
                to.as_str(),
                Utc::now().to_rfc3339(),
                event_id,
                from.as_str()
            ],
        )?;
        if changed > 0 {
            info!(event_id = %event_id, from = from.as_str(), to = to.as_str(), "state transition");
        }
        Ok(changed > 0)
    }

    /// Record a stage failure before any retry: last error plus the
    /// class-specific attempt counter, in one write.
    pub async fn record_stage_failure(
        &self,
        event_id: &str,
        stage: Stage,
        error: &StageError,
    ) -> Result<StageAttempts> {
        let db = self.db.lock().await;
        let attempts_json: String = db
            .query_row(
                "SELECT attempts FROM pipeline_runs WHERE event_id = ?1",
                params![event_id],
                |row| row.get(0),
            )
            .context("run not found")?;
        let mut attempts: AttemptMap = serde_json::from_str(&attempts_json).unwrap_or_default();
        let entry = attempts.entry(stage).or_default();
        match error.retry_class() {
            RetryClass::Schema => entry.schema += 1,
            _ => entry.transient += 1,
        }
        let updated = *entry;
        db.execute(
            "UPDATE pipeline_runs
             SET attempts = ?1, last_error_kind = ?2, last_error = ?3, updated_at = ?4
             WHERE event_id = ?5",
            params![
                serde_json::to_string(&attempts)?,
                error.kind(),
                error.to_string(),
                Utc::now().to_rfc3339(),
                event_id
            ],
        )?;
        Ok(updated)
    }

    pub async fn set_extracted_summary(
        &self,
        event_id: &str,
        summary: &ExtractedSummary,
    ) -> Result<()> {
        self.set_json_field(event_id, "extracted_summary", summary)
            .await
    }

    pub async fn set_diagnosis(
        &self,
        event_id: &str,
        diagnosis: &super::diagnose::Diagnosis,
    ) -> Result<()> {
        self.set_json_field(event_id, "diagnosis", diagnosis).await
    }

    pub async fn set_patch_proposal(
        &self,
        event_id: &str,
        proposal: &super::patch::PatchProposal,
    ) -> Result<()> {
        self.set_json_field(event_id, "patch_proposal", proposal)
            .await
    }

    /// Persist the PR reference the moment it exists, ahead of the full
    /// receipt, so a delivery retry never opens a second PR.
    pub async fn set_pr_reference(&self, event_id: &str, pr_reference: &str) -> Result<()> {
        let db = self.db.lock().await;
        let current: Option<String> = db
            .query_row(
                "SELECT delivery_receipt FROM pipeline_runs WHERE event_id = ?1",
                params![event_id],
                |row| row.get(0),
            )
            .context("run not found")?;
        let mut receipt: DeliveryReceipt = current
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?
            .unwrap_or_default();
        receipt.pr_reference = Some(pr_reference.to_string());
        db.execute(
            "UPDATE pipeline_runs SET delivery_receipt = ?1, updated_at = ?2 WHERE event_id = ?3",
            params![
                serde_json::to_string(&receipt)?,
                Utc::now().to_rfc3339(),
                event_id
            ],
        )?;
        Ok(())
    }

    pub async fn set_delivery_receipt(
        &self,
        event_id: &str,
        receipt: &DeliveryReceipt,
    ) -> Result<()> {
        self.set_json_field(event_id, "delivery_receipt", receipt)
            .await
    }

    /// Operator action. Allowed from any state that is not already
    /// `done` or `abandoned`.
    pub async fn abandon(&self, event_id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE pipeline_runs SET state = 'abandoned', updated_at = ?1
             WHERE event_id = ?2 AND state NOT IN ('done', 'abandoned')",
            params![Utc::now().to_rfc3339(), event_id],
        )?;
        if changed > 0 {
            info!(event_id = %event_id, "run abandoned by operator");
        }
        Ok(changed > 0)
    }

    async fn set_json_field<T: serde::Serialize>(
        &self,
        event_id: &str,
        column: &str,
        value: &T,
    ) -> Result<()> {
        let db = self.db.lock().await;
        let sql = format!(
            "UPDATE pipeline_runs SET {} = ?1, updated_at = ?2 WHERE event_id = ?3",
            column
        );
        let changed = db.execute(
            &sql,
            params![
                serde_json::to_string(value)?,
                Utc::now().to_rfc3339(),
                event_id
            ],
        )?;
        if changed == 0 {
            return Err(anyhow!("no run for event {}", event_id));
        }
        Ok(())
    }
}

const RUN_SELECT: &str = "SELECT event_id, run_id, state, attempts, last_error_kind, last_error,
        extracted_summary, diagnosis, patch_proposal, delivery_receipt, created_at, updated_at
 FROM pipeline_runs";

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<CiEvent> {
    let source: String = row.get(1)?;
    let raw_ref: String = row.get(4)?;
    let received: String = row.get(6)?;
    Ok(CiEvent {
        event_id: row.get(0)?,
        source: match source.as_str() {
            "jenkins" => CiSource::Jenkins,
            "github_actions" => CiSource::GithubActions,
            _ => CiSource::Other,
        },
        repository: row.get(2)?,
        commit_sha: row.get(3)?,
        raw_log_ref: serde_json::from_str::<RawLogRef>(&raw_ref)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
        build_url: row.get(5)?,
        received_at: parse_ts(&received)?,
    })
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<PipelineRun> {
    let state: String = row.get(2)?;
    let attempts: String = row.get(3)?;
    let created: String = row.get(10)?;
    let updated: String = row.get(11)?;
    Ok(PipelineRun {
        event_id: row.get(0)?,
        run_id: row.get(1)?,
        state: RunState::from_str(&state).unwrap_or(RunState::Abandoned),
        attempts: serde_json::from_str(&attempts).unwrap_or_default(),
        last_error_kind: row.get(4)?,
        last_error: row.get(5)?,
        extracted_summary: json_column(row, 6)?,
        diagnosis: json_column(row, 7)?,
        patch_proposal: json_column(row, 8)?,
        delivery_receipt: json_column(row, 9)?,
        created_at: parse_ts(&created)?,
        updated_at: parse_ts(&updated)?,
    })
}

fn json_column<T: serde::de::DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn parse_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}
