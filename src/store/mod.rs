//! Task store: the shared claim queue of problems.
//!
//! Every write that workers make goes through [`TaskStore`]. The SQLite
//! implementation gets its atomic read-and-mark from a conditional
//! `UPDATE ... RETURNING` run inside an `IMMEDIATE` transaction, and tags
//! each claim with a random token that later writes must present.

pub mod problem;

use crate::error::{HarvestError, Result};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

pub use problem::{ClaimLease, Mode, ModeStats, Problem, ProblemType, QueueStats, StatisticsSnapshot};

/// Default timeout for the SQLite busy handler.
///
/// Many workers share one database file; a claim that finds the write lock
/// taken waits this long before surfacing `StoreUnavailable`.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Current schema version.
const SCHEMA_VERSION: u32 = 1;

/// Operations a worker needs from the backing store.
///
/// Implementations must make `claim_next` exclusive: two concurrent callers
/// never receive the same problem for the same mode.
pub trait TaskStore {
    /// Atomically claim one unclaimed problem for `mode`.
    ///
    /// Returns `None` when nothing is eligible.
    fn claim_next(&self, mode: Mode) -> Result<Option<Problem>>;

    /// Set the completion flag for `mode`, and the error flag if requested.
    ///
    /// Returns `false` if the caller no longer holds the claim. Calling it
    /// twice with the same arguments is harmless.
    fn mark_completed(&self, problem: &Problem, mode: Mode, error: bool) -> Result<bool>;

    /// Write the result fields owned by the problem's claimed mode.
    ///
    /// Returns `false` if the caller no longer holds the claim.
    fn update_result(&self, problem: &Problem) -> Result<bool>;

    /// Hand an unfinished claim back to the queue.
    fn release_claim(&self, problem: &Problem) -> Result<bool>;

    /// Reset claims left behind by crashed workers.
    ///
    /// Only rows that are claimed and not generated are touched. With
    /// `older_than`, rows claimed more recently than that are left alone.
    fn reset_stale_claims(&self, mode: Mode, older_than: Option<Duration>) -> Result<usize>;
}

/// SQLite-backed task store.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Open or create a store with a custom busy timeout.
    pub fn open_with_timeout<P: AsRef<Path>>(path: P, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref();
        if path.is_dir() {
            return Err(HarvestError::InvalidConfig(format!(
                "'{}' is a directory, not a database file",
                path.display()
            )));
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;

        // WAL lets readers (status, show) proceed while workers claim.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            "#,
        )?;

        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS problems (
                id INTEGER PRIMARY KEY,
                model_ref TEXT NOT NULL,
                instance_ref TEXT,
                time_limit INTEGER,
                problem_type TEXT,
                time_to_solution REAL,
                solved INTEGER NOT NULL DEFAULT 0,
                error INTEGER NOT NULL DEFAULT 0,
                statistics TEXT NOT NULL DEFAULT '[]',
                claimed_label INTEGER NOT NULL DEFAULT 0,
                claimed_features INTEGER NOT NULL DEFAULT 0,
                generated_label INTEGER NOT NULL DEFAULT 0,
                generated_features INTEGER NOT NULL DEFAULT 0,
                label_claim_token TEXT,
                features_claim_token TEXT,
                label_claimed_at INTEGER,
                features_claimed_at INTEGER,
                updated_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_problems_label_queue
                ON problems(claimed_label, generated_label);
            CREATE INDEX IF NOT EXISTS idx_problems_features_queue
                ON problems(claimed_features, generated_features);
            CREATE INDEX IF NOT EXISTS idx_problems_refs
                ON problems(model_ref, instance_ref);
            "#,
        )?;

        self.conn.execute(
            "INSERT OR IGNORE INTO meta (key, value) VALUES ('schema_version', ?1)",
            params![SCHEMA_VERSION.to_string()],
        )?;
        Ok(())
    }

    fn immediate(&self) -> Result<Transaction<'_>> {
        Ok(Transaction::new_unchecked(
            &self.conn,
            TransactionBehavior::Immediate,
        )?)
    }

    /// Add a problem to the queue, returning its id.
    ///
    /// An identical (model, instance) pair that is already queued is reused.
    pub fn insert_problem(&self, model_ref: &str, instance_ref: Option<&str>) -> Result<i64> {
        let tx = self.immediate()?;
        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM problems WHERE model_ref = ?1 AND instance_ref IS ?2",
                params![model_ref, instance_ref],
                |row| row.get(0),
            )
            .optional()?;
        let id = match existing {
            Some(id) => id,
            None => {
                tx.execute(
                    "INSERT INTO problems (model_ref, instance_ref) VALUES (?1, ?2)",
                    params![model_ref, instance_ref],
                )?;
                tx.last_insert_rowid()
            }
        };
        tx.commit()?;
        Ok(id)
    }

    /// Fetch a problem by id.
    pub fn get_problem(&self, id: i64) -> Result<Option<Problem>> {
        Ok(self
            .conn
            .query_row(
                "SELECT * FROM problems WHERE id = ?1",
                params![id],
                Problem::from_row,
            )
            .optional()?)
    }

    /// Count problems per mode and state.
    pub fn queue_stats(&self) -> Result<QueueStats> {
        let total: u64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM problems", [], |row| row.get(0))?;
        Ok(QueueStats {
            total,
            label: self.mode_stats(Mode::Label)?,
            features: self.mode_stats(Mode::Features)?,
        })
    }

    fn mode_stats(&self, mode: Mode) -> Result<ModeStats> {
        let sql = format!(
            "SELECT
                COALESCE(SUM({c} = 0), 0),
                COALESCE(SUM({c} = 1 AND {g} = 0), 0),
                COALESCE(SUM({g} = 1), 0),
                COALESCE(SUM({g} = 1 AND error = 1), 0)
             FROM problems",
            c = mode.claimed_column(),
            g = mode.generated_column(),
        );
        Ok(self.conn.query_row(&sql, [], |row| {
            Ok(ModeStats {
                pending: row.get(0)?,
                in_flight: row.get(1)?,
                generated: row.get(2)?,
                errored: row.get(3)?,
            })
        })?)
    }
}

/// Extract the lease from a problem, checking it matches `mode` when given.
fn lease_of(problem: &Problem, mode: Option<Mode>) -> Result<&ClaimLease> {
    let lease = problem.lease.as_ref().ok_or_else(|| {
        HarvestError::Worker(format!("Problem {} is not claimed by this worker", problem.id))
    })?;
    if let Some(mode) = mode
        && lease.mode != mode
    {
        return Err(HarvestError::Worker(format!(
            "Problem {} was claimed for {} but completed for {}",
            problem.id, lease.mode, mode
        )));
    }
    Ok(lease)
}

impl TaskStore for SqliteStore {
    #[instrument(level = "debug", skip(self))]
    fn claim_next(&self, mode: Mode) -> Result<Option<Problem>> {
        let token = Uuid::new_v4().to_string();
        let sql = format!(
            "UPDATE problems
             SET {c} = 1, {t} = ?1, {at} = ?2
             WHERE id = (
                 SELECT id FROM problems WHERE {c} = 0 AND {g} = 0 LIMIT 1
             ) AND {c} = 0
             RETURNING *",
            c = mode.claimed_column(),
            g = mode.generated_column(),
            t = mode.token_column(),
            at = mode.claimed_at_column(),
        );

        let tx = self.immediate()?;
        let claimed = tx
            .query_row(&sql, params![token, Utc::now().timestamp()], Problem::from_row)
            .optional()?;
        tx.commit()?;

        Ok(claimed.map(|mut problem| {
            debug!(problem_id = problem.id, %mode, "Claimed problem");
            problem.lease = Some(ClaimLease { mode, token });
            problem
        }))
    }

    #[instrument(level = "debug", skip(self, problem), fields(problem_id = problem.id))]
    fn mark_completed(&self, problem: &Problem, mode: Mode, error: bool) -> Result<bool> {
        let lease = lease_of(problem, Some(mode))?;
        let sql = format!(
            "UPDATE problems
             SET {g} = 1, error = MAX(error, ?3), updated_at = ?4
             WHERE id = ?1 AND {t} = ?2",
            g = mode.generated_column(),
            t = mode.token_column(),
        );
        let tx = self.immediate()?;
        let changed = tx.execute(
            &sql,
            params![problem.id, lease.token, error, Utc::now().timestamp()],
        )?;
        tx.commit()?;
        Ok(changed > 0)
    }

    #[instrument(level = "debug", skip(self, problem), fields(problem_id = problem.id))]
    fn update_result(&self, problem: &Problem) -> Result<bool> {
        let lease = lease_of(problem, None)?;
        let now = Utc::now().timestamp();
        let time_limit = problem.time_limit.map(|t| t as i64);

        let tx = self.immediate()?;
        let changed = match lease.mode {
            Mode::Label => tx.execute(
                "UPDATE problems
                 SET time_to_solution = ?3, solved = ?4, problem_type = ?5,
                     time_limit = ?6, updated_at = ?7
                 WHERE id = ?1 AND label_claim_token = ?2",
                params![
                    problem.id,
                    lease.token,
                    problem.time_to_solution,
                    problem.solved,
                    problem.problem_type.as_str(),
                    time_limit,
                    now
                ],
            )?,
            Mode::Features => tx.execute(
                "UPDATE problems
                 SET statistics = ?3, time_limit = ?4, updated_at = ?5
                 WHERE id = ?1 AND features_claim_token = ?2",
                params![
                    problem.id,
                    lease.token,
                    serde_json::to_string(&problem.statistics)?,
                    time_limit,
                    now
                ],
            )?,
        };
        tx.commit()?;
        Ok(changed > 0)
    }

    #[instrument(level = "debug", skip(self, problem), fields(problem_id = problem.id))]
    fn release_claim(&self, problem: &Problem) -> Result<bool> {
        let lease = lease_of(problem, None)?;
        let sql = format!(
            "UPDATE problems
             SET {c} = 0, {t} = NULL, {at} = NULL, {clear}
             WHERE id = ?1 AND {t} = ?2 AND {g} = 0",
            c = lease.mode.claimed_column(),
            g = lease.mode.generated_column(),
            t = lease.mode.token_column(),
            at = lease.mode.claimed_at_column(),
            clear = partial_result_reset(lease.mode),
        );
        let tx = self.immediate()?;
        let changed = tx.execute(&sql, params![problem.id, lease.token])?;
        tx.commit()?;
        Ok(changed > 0)
    }

    #[instrument(level = "debug", skip(self))]
    fn reset_stale_claims(&self, mode: Mode, older_than: Option<Duration>) -> Result<usize> {
        let cutoff = older_than.map(|age| Utc::now().timestamp() - age.as_secs() as i64);
        let sql = format!(
            "UPDATE problems
             SET {c} = 0, {t} = NULL, {at} = NULL, {clear}
             WHERE {c} = 1 AND {g} = 0
               AND (?1 IS NULL OR {at} IS NULL OR {at} <= ?1)",
            c = mode.claimed_column(),
            g = mode.generated_column(),
            t = mode.token_column(),
            at = mode.claimed_at_column(),
            clear = partial_result_reset(mode),
        );
        let tx = self.immediate()?;
        let reset = tx.execute(&sql, params![cutoff])?;
        tx.commit()?;
        Ok(reset)
    }
}

/// SET fragment clearing the partial results a mode may have written.
fn partial_result_reset(mode: Mode) -> &'static str {
    match mode {
        Mode::Label => "time_to_solution = NULL, problem_type = NULL, solved = 0",
        Mode::Features => "statistics = '[]'",
    }
}
