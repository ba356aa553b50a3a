use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};

use crate::store::{
    CommitOutcome, HistoryStore, StoreError, SubmissionRecord, UserJudgingStats, Versioned,
};
use crate::verdict::{FailingCase, Status};

const DATABASE_NAME: &str = "judge.sqlite3";

const SOLVED: &str = "solved";
const ATTEMPTED: &str = "attempted";

pub fn get_db_path() -> anyhow::Result<PathBuf> {
    use directories::ProjectDirs;

    let proj_dirs =
        ProjectDirs::from("", "", "judge").ok_or_else(|| anyhow!("Unable to find user directory"))?;
    let data_dir = proj_dirs.data_local_dir();

    fs::create_dir_all(data_dir)?;

    Ok(data_dir.join(DATABASE_NAME))
}

pub async fn init_db(db_path: impl AsRef<Path>) -> sqlx::Result<SqlitePool> {
    let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display()); // rwc = read/write/create
    let db_pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(0)
        .connect(&db_url)
        .await?;

    // PRAGMA statements cannot run inside a transaction
    for pragma_sql in &[
        "PRAGMA foreign_keys = ON;",
        "PRAGMA busy_timeout = 2000;",
        "PRAGMA journal_mode = WAL;",
        "PRAGMA synchronous = NORMAL;",
    ] {
        sqlx::query(pragma_sql).execute(&db_pool).await?;
    }

    let mut tx = db_pool.begin().await?;

    for sql in &[
        r"
        CREATE TABLE IF NOT EXISTS user_stats (
            submitter_id     TEXT     PRIMARY KEY,
            version          INTEGER  NOT NULL,
            solved_count     INTEGER  NOT NULL,
            attempted_count  INTEGER  NOT NULL
        );",
        r"
        CREATE TABLE IF NOT EXISTS user_problems (
            submitter_id  TEXT  NOT NULL,
            problem_id    TEXT  NOT NULL,
            kind          TEXT  NOT NULL CHECK (kind IN ('solved', 'attempted')),
            PRIMARY KEY (submitter_id, problem_id, kind),
            FOREIGN KEY (submitter_id)  REFERENCES user_stats (submitter_id)
        );",
        r"
        CREATE TABLE IF NOT EXISTS submissions (
            pk            INTEGER  PRIMARY KEY AUTOINCREMENT,
            submitter_id  TEXT     NOT NULL,
            problem_id    TEXT     NOT NULL,
            problem_name  TEXT     NOT NULL,
            status        TEXT     NOT NULL,
            message       TEXT,
            submitted_at  TEXT     NOT NULL,
            elapsed_ms    INTEGER  NOT NULL,
            source_code   TEXT     NOT NULL,
            failing_case  TEXT,
            FOREIGN KEY (submitter_id)  REFERENCES user_stats (submitter_id)
        );",
        "CREATE INDEX IF NOT EXISTS submissions_by_user ON submissions (submitter_id, problem_id);",
    ] {
        sqlx::query(sql).execute(tx.as_mut()).await?;
    }

    tx.commit().await?;

    log::info!("Initialized database at {}", db_path.as_ref().display());

    Ok(db_pool)
}

pub fn remove_db(db_path: impl AsRef<Path>) {
    // WAL and SHM files might not exist
    let wal_path = format!("{}-wal", db_path.as_ref().display());
    let shm_path = format!("{}-shm", db_path.as_ref().display());
    let _ = fs::remove_file(wal_path);
    let _ = fs::remove_file(shm_path);

    if let Err(e) = std::fs::remove_file(&db_path) {
        log::warn!(
            "Unable to remove database at {}: {e}",
            db_path.as_ref().display()
        );
    } else {
        log::info!("Removed database at {}", db_path.as_ref().display());
    }
}

/// History store backed by SQLite
///
/// The stats row of each user carries a version; a commit only applies when
/// `UPDATE ... WHERE version = ?` touches exactly one row, and the history
/// row is inserted in the same transaction.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(db_path: impl AsRef<Path>) -> sqlx::Result<Self> {
        Ok(Self::new(init_db(db_path).await?))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl HistoryStore for SqliteStore {
    async fn load_stats(&self, submitter_id: &str) -> Result<Versioned<UserJudgingStats>, StoreError> {
        // One read transaction so the counters and the sets come from the same snapshot
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT version, solved_count, attempted_count FROM user_stats WHERE submitter_id = ?",
        )
        .bind(submitter_id)
        .fetch_optional(tx.as_mut())
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(Versioned {
                version: 0,
                value: UserJudgingStats::default(),
            });
        };

        let version: i64 = row.try_get("version")?;
        let solved_count: i64 = row.try_get("solved_count")?;
        let attempted_count: i64 = row.try_get("attempted_count")?;

        let problems = sqlx::query(
            "SELECT problem_id, kind FROM user_problems WHERE submitter_id = ? ORDER BY problem_id",
        )
        .bind(submitter_id)
        .fetch_all(tx.as_mut())
        .await?;
        tx.commit().await?;

        let mut problems_solved = BTreeSet::new();
        let mut problems_attempted = BTreeSet::new();
        for problem in problems {
            let problem_id: String = problem.try_get("problem_id")?;
            let kind: String = problem.try_get("kind")?;
            match kind.as_str() {
                SOLVED => problems_solved.insert(problem_id),
                ATTEMPTED => problems_attempted.insert(problem_id),
                other => {
                    return Err(StoreError::Malformed(format!(
                        "unknown problem kind {other:?} for {submitter_id}"
                    )));
                }
            };
        }

        if problems_solved.len() as i64 != solved_count
            || problems_attempted.len() as i64 != attempted_count
        {
            return Err(StoreError::Malformed(format!(
                "counters of {submitter_id} disagree with their problem sets"
            )));
        }

        Ok(Versioned {
            version: version as u64,
            value: UserJudgingStats {
                problems_solved,
                problems_attempted,
                solved_count: solved_count as u64,
                attempted_count: attempted_count as u64,
            },
        })
    }

    async fn commit(
        &self,
        submitter_id: &str,
        expected_version: u64,
        record: &SubmissionRecord,
        stats: &UserJudgingStats,
    ) -> Result<CommitOutcome, StoreError> {
        let failing_case = record
            .failing_case
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Malformed(e.to_string()))?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"
            INSERT OR IGNORE INTO user_stats (submitter_id, version, solved_count, attempted_count)
            VALUES (?, 0, 0, 0)
            ",
        )
        .bind(submitter_id)
        .execute(tx.as_mut())
        .await?;

        let updated = sqlx::query(
            r"
            UPDATE user_stats
            SET version = version + 1, solved_count = ?, attempted_count = ?
            WHERE submitter_id = ? AND version = ?
            ",
        )
        .bind(stats.solved_count as i64)
        .bind(stats.attempted_count as i64)
        .bind(submitter_id)
        .bind(expected_version as i64)
        .execute(tx.as_mut())
        .await?;

        if updated.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(CommitOutcome::Conflict);
        }

        let sets = [
            (SOLVED, &stats.problems_solved),
            (ATTEMPTED, &stats.problems_attempted),
        ];
        for (kind, problems) in sets {
            for problem_id in problems {
                sqlx::query(
                    "INSERT OR IGNORE INTO user_problems (submitter_id, problem_id, kind) VALUES (?, ?, ?)",
                )
                .bind(submitter_id)
                .bind(problem_id)
                .bind(kind)
                .execute(tx.as_mut())
                .await?;
            }
        }

        sqlx::query(
            r"
            INSERT INTO submissions (submitter_id, problem_id, problem_name, status, message, submitted_at, elapsed_ms, source_code, failing_case)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(submitter_id)
        .bind(&record.problem_id)
        .bind(&record.problem_name)
        .bind(record.status.as_str())
        .bind(&record.message)
        .bind(&record.submitted_at)
        .bind(record.elapsed_ms as i64)
        .bind(&record.source_code)
        .bind(failing_case)
        .execute(tx.as_mut())
        .await?;

        tx.commit().await?;

        log::debug!(
            "Committed {} submission of {submitter_id} at version {}",
            record.problem_id,
            expected_version + 1
        );
        Ok(CommitOutcome::Committed {
            version: expected_version + 1,
        })
    }

    async fn submissions(
        &self,
        submitter_id: &str,
        problem_id: &str,
    ) -> Result<Vec<SubmissionRecord>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT problem_id, problem_name, status, message, submitted_at, elapsed_ms, source_code, failing_case
            FROM submissions
            WHERE submitter_id = ? AND problem_id = ?
            ORDER BY pk
            ",
        )
        .bind(submitter_id)
        .bind(problem_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }
}

fn record_from_row(row: &SqliteRow) -> Result<SubmissionRecord, StoreError> {
    let status: String = row.try_get("status")?;
    let status: Status = status.parse().map_err(StoreError::Malformed)?;
    let failing_case: Option<String> = row.try_get("failing_case")?;
    let failing_case = failing_case
        .map(|raw| serde_json::from_str::<FailingCase>(&raw))
        .transpose()
        .map_err(|e| StoreError::Malformed(e.to_string()))?;
    let elapsed_ms: i64 = row.try_get("elapsed_ms")?;

    Ok(SubmissionRecord {
        problem_id: row.try_get("problem_id")?,
        problem_name: row.try_get("problem_name")?,
        status,
        message: row.try_get("message")?,
        submitted_at: row.try_get("submitted_at")?,
        elapsed_ms: elapsed_ms as u64,
        source_code: row.try_get("source_code")?,
        failing_case,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    static TEST_DB_COUNTER: AtomicU32 = AtomicU32::new(0);

    struct TestDbGuard {
        path: PathBuf,
    }

    impl Drop for TestDbGuard {
        fn drop(&mut self) {
            remove_db(&self.path);
        }
    }

    async fn open_test_store() -> (SqliteStore, TestDbGuard) {
        let n = TEST_DB_COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!(
            "judge_database_test_{}_{n}.sqlite3",
            std::process::id()
        ));
        remove_db(&path);
        let store = SqliteStore::open(&path).await.unwrap();
        (store, TestDbGuard { path })
    }

    fn record(problem_id: &str, status: Status) -> SubmissionRecord {
        SubmissionRecord {
            problem_id: problem_id.to_string(),
            problem_name: "Add Two Numbers".to_string(),
            status,
            message: (status == Status::WrongAnswer)
                .then(|| "Wrong answer on test case 1".to_string()),
            submitted_at: crate::create_timestamp(),
            elapsed_ms: 12,
            source_code: "function add(a, b) { return a - b; }".to_string(),
            failing_case: (status == Status::WrongAnswer).then(|| FailingCase {
                input: vec![json!(2), json!(3)],
                expected: json!(5),
                actual: json!(-1),
            }),
        }
    }

    #[tokio::test]
    async fn new_users_start_at_version_zero() {
        let (store, _guard) = open_test_store().await;
        let loaded = store.load_stats("nobody").await.unwrap();
        assert_eq!(loaded.version, 0);
        assert_eq!(loaded.value, UserJudgingStats::default());
        assert!(store.submissions("nobody", "add").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn commits_round_trip_stats_and_history() {
        let (store, _guard) = open_test_store().await;

        let mut stats = UserJudgingStats::default();
        stats.merge("add", Status::WrongAnswer);
        let wrong = record("add", Status::WrongAnswer);
        let outcome = store.commit("u1", 0, &wrong, &stats).await.unwrap();
        assert_eq!(outcome, CommitOutcome::Committed { version: 1 });

        stats.merge("add", Status::Accepted);
        let accepted = record("add", Status::Accepted);
        let outcome = store.commit("u1", 1, &accepted, &stats).await.unwrap();
        assert_eq!(outcome, CommitOutcome::Committed { version: 2 });

        let loaded = store.load_stats("u1").await.unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.value, stats);

        let history = store.submissions("u1", "add").await.unwrap();
        assert_eq!(history, vec![wrong, accepted]);
    }

    #[tokio::test]
    async fn stale_versions_are_rejected_without_side_effects() {
        let (store, _guard) = open_test_store().await;

        let mut stats = UserJudgingStats::default();
        stats.merge("add", Status::Accepted);
        store
            .commit("u1", 0, &record("add", Status::Accepted), &stats)
            .await
            .unwrap();

        let mut other = UserJudgingStats::default();
        other.merge("sum", Status::RuntimeError);
        let outcome = store
            .commit("u1", 0, &record("sum", Status::RuntimeError), &other)
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Conflict);

        let loaded = store.load_stats("u1").await.unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.value, stats);
        assert!(store.submissions("u1", "sum").await.unwrap().is_empty());
    }
}
