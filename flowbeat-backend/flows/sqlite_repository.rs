use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior, params};
use uuid::Uuid;

use super::error::StoreError;
use super::history::{FlowRun, RunHandle, RunOutcome, RunStatus};
use super::repository::FlowRepository;
use super::{Flow, FlowUpdate, LastRunStatus, NewFlow};

/// How long a claim holds before another heartbeat may take the flow over.
/// Running flows renew their claim (see `extend_claim`), so this only bounds
/// recovery after an executor dies mid-run.
pub const DEFAULT_CLAIM_TTL_SECS: i64 = 900;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS flows (
    id              TEXT PRIMARY KEY,
    name            TEXT NOT NULL UNIQUE,
    description     TEXT NOT NULL DEFAULT '',
    enabled         INTEGER NOT NULL DEFAULT 1,
    configuration   TEXT NOT NULL,
    run_interval    INTEGER NOT NULL CHECK (run_interval > 0),
    last_run_at     INTEGER,
    last_run_status TEXT CHECK (last_run_status IN ('success', 'failed')),
    claimed_until   INTEGER,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_flows_enabled_last_run_at ON flows (enabled, last_run_at);

CREATE TABLE IF NOT EXISTS flow_runs (
    id              TEXT PRIMARY KEY,
    flow_id         TEXT NOT NULL REFERENCES flows (id) ON DELETE CASCADE,
    status          TEXT NOT NULL CHECK (status IN ('pending', 'in_progress', 'success', 'failed')),
    started_at      INTEGER NOT NULL,
    ended_at        INTEGER,
    error_message   TEXT,
    error_backtrace TEXT,
    created_at      INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_flow_runs_flow_id_created_at ON flow_runs (flow_id, created_at);
"#;

const FLOW_COLUMNS: &str = "id, name, description, enabled, configuration, run_interval, \
                            last_run_at, last_run_status, created_at, updated_at";

const RUN_COLUMNS: &str =
    "id, flow_id, status, started_at, ended_at, error_message, error_backtrace";

/// SQLite-backed flow and run store.
///
/// Claims use a `claimed_until` marker instead of row locks: a claim is a
/// compare-and-swap inside a `BEGIN IMMEDIATE` transaction, so two processes
/// sharing the database file never claim the same flow while the marker is
/// live. `record_outcome` clears the marker; an expired marker frees flows
/// left behind by a crashed cycle.
pub struct SqliteFlowRepository {
    conn: Arc<Mutex<Connection>>,
    claim_ttl: Duration,
}

impl SqliteFlowRepository {
    pub fn open(path: &Path, claim_ttl: Duration) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        Self::from_connection(conn, claim_ttl)
    }

    #[cfg(test)]
    pub fn open_in_memory(claim_ttl: Duration) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, claim_ttl)
    }

    fn from_connection(conn: Connection, claim_ttl: Duration) -> Result<Self, StoreError> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!(claim_ttl_secs = claim_ttl.num_seconds(), "Flow store ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            claim_ttl,
        })
    }

    fn claim_expiry(&self, now: DateTime<Utc>) -> i64 {
        now.checked_add_signed(self.claim_ttl)
            .map_or(i64::MAX, |until| until.timestamp_millis())
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            // A panic inside `f` unwinds through its open transaction, which
            // rolls back on drop, so the connection is still usable.
            let mut guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard)
        })
        .await?
    }
}

fn conversion_error<E>(idx: usize, ty: Type, err: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
{
    rusqlite::Error::FromSqlConversionFailure(idx, ty, err.into())
}

fn from_millis(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| conversion_error(idx, Type::Integer, format!("timestamp out of range: {ms}")))
}

fn flow_from_row(row: &Row<'_>) -> rusqlite::Result<Flow> {
    let configuration: String = row.get(4)?;
    let last_run_at: Option<i64> = row.get(6)?;
    let last_run_status: Option<String> = row.get(7)?;

    Ok(Flow {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        enabled: row.get(3)?,
        configuration: serde_json::from_str(&configuration)
            .map_err(|e| conversion_error(4, Type::Text, e))?,
        run_interval: row.get(5)?,
        last_run_at: last_run_at.map(|ms| from_millis(6, ms)).transpose()?,
        last_run_status: last_run_status
            .map(|s| {
                LastRunStatus::parse(&s).ok_or_else(|| {
                    conversion_error(7, Type::Text, format!("unknown last_run_status '{s}'"))
                })
            })
            .transpose()?,
        created_at: from_millis(8, row.get(8)?)?,
        updated_at: from_millis(9, row.get(9)?)?,
    })
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<FlowRun> {
    let status: String = row.get(2)?;
    let ended_at: Option<i64> = row.get(4)?;

    Ok(FlowRun {
        id: row.get(0)?,
        flow_id: row.get(1)?,
        status: RunStatus::parse(&status).ok_or_else(|| {
            conversion_error(2, Type::Text, format!("unknown run status '{status}'"))
        })?,
        started_at: from_millis(3, row.get(3)?)?,
        ended_at: ended_at.map(|ms| from_millis(4, ms)).transpose()?,
        error_message: row.get(5)?,
        error_backtrace: row.get(6)?,
    })
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

fn name_conflict(err: rusqlite::Error, name: &str) -> StoreError {
    if is_constraint_violation(&err) {
        StoreError::Conflict(format!("name has already been taken: {name}"))
    } else {
        err.into()
    }
}

fn select_flow(conn: &Connection, id: &str) -> Result<Option<Flow>, StoreError> {
    let flow = conn
        .query_row(
            &format!("SELECT {FLOW_COLUMNS} FROM flows WHERE id = ?1"),
            params![id],
            flow_from_row,
        )
        .optional()?;
    Ok(flow)
}

fn select_run(conn: &Connection, id: &str) -> Result<Option<FlowRun>, StoreError> {
    let run = conn
        .query_row(
            &format!("SELECT {RUN_COLUMNS} FROM flow_runs WHERE id = ?1"),
            params![id],
            run_from_row,
        )
        .optional()?;
    Ok(run)
}

#[async_trait]
impl FlowRepository for SqliteFlowRepository {
    async fn create_flow(&self, new_flow: NewFlow) -> Result<Flow, StoreError> {
        new_flow.validate()?;
        let now = Utc::now();
        let flow = Flow {
            id: Uuid::new_v4().to_string(),
            name: new_flow.name,
            description: new_flow.description,
            enabled: new_flow.enabled,
            run_interval: new_flow.run_interval,
            configuration: new_flow.configuration,
            last_run_at: None,
            last_run_status: None,
            created_at: now,
            updated_at: now,
        };

        self.with_conn(move |conn| {
            let configuration = serde_json::to_string(&flow.configuration)?;
            conn.execute(
                "INSERT INTO flows (id, name, description, enabled, configuration, run_interval, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    flow.id,
                    flow.name,
                    flow.description,
                    flow.enabled,
                    configuration,
                    flow.run_interval,
                    flow.created_at.timestamp_millis(),
                    flow.updated_at.timestamp_millis(),
                ],
            )
            .map_err(|e| name_conflict(e, &flow.name))?;
            tracing::info!(flow_id = %flow.id, name = %flow.name, "Created flow");
            Ok(flow)
        })
        .await
    }

    async fn get_flow(&self, id: &str) -> Result<Option<Flow>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| select_flow(conn, &id)).await
    }

    async fn get_flow_by_name(&self, name: &str) -> Result<Option<Flow>, StoreError> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let flow = conn
                .query_row(
                    &format!("SELECT {FLOW_COLUMNS} FROM flows WHERE name = ?1"),
                    params![name],
                    flow_from_row,
                )
                .optional()?;
            Ok(flow)
        })
        .await
    }

    async fn list_flows(&self) -> Result<Vec<Flow>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {FLOW_COLUMNS} FROM flows ORDER BY name"))?;
            let flows = stmt
                .query_map([], flow_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(flows)
        })
        .await
    }

    async fn update_flow(&self, id: &str, update: FlowUpdate) -> Result<Flow, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut flow = select_flow(&tx, &id)?.ok_or_else(|| StoreError::FlowNotFound(id.clone()))?;
            update.apply(&mut flow)?;
            flow.updated_at = Utc::now();

            let configuration = serde_json::to_string(&flow.configuration)?;
            tx.execute(
                "UPDATE flows
                 SET name = ?1, description = ?2, enabled = ?3, run_interval = ?4,
                     configuration = ?5, updated_at = ?6
                 WHERE id = ?7",
                params![
                    flow.name,
                    flow.description,
                    flow.enabled,
                    flow.run_interval,
                    configuration,
                    flow.updated_at.timestamp_millis(),
                    flow.id,
                ],
            )
            .map_err(|e| name_conflict(e, &flow.name))?;
            tx.commit()?;
            Ok(flow)
        })
        .await
    }

    async fn delete_flow(&self, id: &str) -> Result<bool, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let deleted = conn.execute("DELETE FROM flows WHERE id = ?1", params![id])?;
            if deleted > 0 {
                tracing::info!(flow_id = %id, "Deleted flow and its runs");
            }
            Ok(deleted > 0)
        })
        .await
    }

    async fn claim_due_flows(&self, now: DateTime<Utc>) -> Result<Vec<Flow>, StoreError> {
        let claimed_until = self.claim_expiry(now);
        let now_ms = now.timestamp_millis();

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let candidates = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {FLOW_COLUMNS} FROM flows
                     WHERE enabled = 1 AND (claimed_until IS NULL OR claimed_until <= ?1)
                     ORDER BY name"
                ))?;
                let rows = stmt
                    .query_map(params![now_ms], flow_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };

            let mut claimed = Vec::new();
            for flow in candidates.into_iter().filter(|f| f.is_due(now)) {
                let changed = tx.execute(
                    "UPDATE flows SET claimed_until = ?1
                     WHERE id = ?2 AND (claimed_until IS NULL OR claimed_until <= ?3)",
                    params![claimed_until, flow.id, now_ms],
                )?;
                if changed == 1 {
                    claimed.push(flow);
                }
            }

            tx.commit()?;
            Ok(claimed)
        })
        .await
    }

    async fn extend_claim(&self, flow_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let flow_id = flow_id.to_string();
        let claimed_until = self.claim_expiry(now);
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE flows SET claimed_until = ?1
                 WHERE id = ?2 AND claimed_until IS NOT NULL",
                params![claimed_until, flow_id],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn record_outcome(
        &self,
        flow_id: &str,
        status: LastRunStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let flow_id = flow_id.to_string();
        self.with_conn(move |conn| {
            let at_ms = at.timestamp_millis();
            let changed = conn.execute(
                "UPDATE flows
                 SET last_run_at = ?1, last_run_status = ?2, claimed_until = NULL, updated_at = ?1
                 WHERE id = ?3",
                params![at_ms, status.as_str(), flow_id],
            )?;
            if changed == 0 {
                return Err(StoreError::FlowNotFound(flow_id));
            }
            Ok(())
        })
        .await
    }

    async fn open_run(
        &self,
        flow_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<RunHandle, StoreError> {
        let flow_id = flow_id.to_string();
        self.with_conn(move |conn| {
            let run_id = Uuid::new_v4().to_string();
            let started_ms = started_at.timestamp_millis();
            let tx = conn.transaction()?;

            tx.execute(
                "INSERT INTO flow_runs (id, flow_id, status, started_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    run_id,
                    flow_id,
                    RunStatus::Pending.as_str(),
                    started_ms,
                    Utc::now().timestamp_millis(),
                ],
            )
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    StoreError::FlowNotFound(flow_id.clone())
                } else {
                    e.into()
                }
            })?;

            tx.execute(
                "UPDATE flow_runs SET status = ?1 WHERE id = ?2 AND status = ?3",
                params![
                    RunStatus::InProgress.as_str(),
                    run_id,
                    RunStatus::Pending.as_str(),
                ],
            )?;
            tx.commit()?;

            Ok(RunHandle::new(run_id, flow_id, started_at))
        })
        .await
    }

    async fn complete_run(
        &self,
        handle: RunHandle,
        outcome: RunOutcome,
        ended_at: DateTime<Utc>,
    ) -> Result<FlowRun, StoreError> {
        let to = outcome.status();
        let (message, backtrace) = match outcome {
            RunOutcome::Success => (None, None),
            RunOutcome::Failed { message, backtrace } => (Some(message), backtrace),
        };
        let run_id = handle.run_id().to_string();
        let flow_id = handle.flow_id().to_string();
        let ended_at = ended_at.max(handle.started_at());

        let run = self
            .with_conn(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let current = select_run(&tx, &run_id)?
                    .ok_or_else(|| StoreError::RunNotFound(run_id.clone()))?;
                if !current.status.can_transition_to(to) {
                    return Err(StoreError::InvalidTransition {
                        run_id,
                        from: current.status,
                        to,
                    });
                }

                tx.execute(
                    "UPDATE flow_runs
                     SET status = ?1, ended_at = ?2, error_message = ?3, error_backtrace = ?4
                     WHERE id = ?5",
                    params![
                        to.as_str(),
                        ended_at.timestamp_millis(),
                        message,
                        backtrace,
                        run_id,
                    ],
                )?;

                let run = select_run(&tx, &run_id)?
                    .ok_or_else(|| StoreError::RunNotFound(run_id.clone()))?;
                tx.commit()?;
                Ok(run)
            })
            .await?;

        tracing::debug!(run_id = %run.id, flow_id = %flow_id, status = run.status.as_str(), "Run completed");
        Ok(run)
    }

    async fn list_runs(&self, flow_id: &str, limit: usize) -> Result<Vec<FlowRun>, StoreError> {
        let flow_id = flow_id.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM flow_runs
                 WHERE flow_id = ?1
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?2"
            ))?;
            let runs = stmt
                .query_map(params![flow_id, limit], run_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(runs)
        })
        .await
    }

    async fn get_run(&self, id: &str) -> Result<Option<FlowRun>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| select_run(conn, &id)).await
    }
}
