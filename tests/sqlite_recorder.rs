use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use pretty_assertions::assert_eq;

use judge::database::{self as db, SqliteStore};
use judge::engine::Submission;
use judge::recorder::{Recorded, Recorder, RetryPolicy};
use judge::store::HistoryStore;
use judge::verdict::{Status, Verdict};

// Global counter to ensure unique test database names
static TEST_DB_COUNTER: AtomicU32 = AtomicU32::new(0);

struct TestDbGuard {
    db_path: PathBuf,
}

impl Drop for TestDbGuard {
    fn drop(&mut self) {
        db::remove_db(&self.db_path);
    }
}

fn test_db_path() -> TestDbGuard {
    let test_id = TEST_DB_COUNTER.fetch_add(1, Ordering::SeqCst);
    let db_path = std::env::temp_dir().join(format!(
        "test_judge_{}_{test_id}.sqlite3",
        std::process::id()
    ));
    db::remove_db(&db_path);
    TestDbGuard { db_path }
}

fn policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 50,
        base_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(20),
    }
}

fn submission(submitter_id: &str, problem_id: &str) -> Submission {
    Submission {
        submitter_id: submitter_id.to_string(),
        problem_id: problem_id.to_string(),
        source_code: "function add(a,b){return a+b}".to_string(),
        entry_point_name: "add".to_string(),
    }
}

fn verdict(status: Status) -> Verdict {
    Verdict {
        status,
        elapsed_ms: 2,
        failing_case: None,
        message: None,
        tests_passed: 2,
        tests_total: 2,
        memory_measured: true,
        peak_memory_kb: Some(40_000),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_accepts_on_sqlite_count_once() {
    let guard = test_db_path();
    let store = Arc::new(SqliteStore::open(&guard.db_path).await.unwrap());
    let recorder = Arc::new(Recorder::new(store.clone(), policy()));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let recorder = recorder.clone();
        handles.push(tokio::spawn(async move {
            recorder
                .record(&submission("alice", "add"), "Add", verdict(Status::Accepted))
                .await
        }));
    }
    for handle in handles {
        assert!(matches!(handle.await.unwrap(), Recorded::Persisted(_)));
    }

    let stats = store.load_stats("alice").await.unwrap();
    assert_eq!(stats.version, 10);
    assert_eq!(stats.value.solved_count, 1);
    assert_eq!(store.submissions("alice", "add").await.unwrap().len(), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn separate_connections_never_lose_updates() {
    let guard = test_db_path();
    // Two pools on one file behave like two judge processes
    let first_store = Arc::new(SqliteStore::open(&guard.db_path).await.unwrap());
    let second_store = Arc::new(SqliteStore::open(&guard.db_path).await.unwrap());
    let first = Arc::new(Recorder::new(first_store.clone(), policy()));
    let second = Arc::new(Recorder::new(second_store, policy()));

    let problems = ["add", "sum", "max", "min"];
    let mut handles = Vec::new();
    for i in 0..16 {
        let recorder = if i % 2 == 0 { first.clone() } else { second.clone() };
        let problem_id = problems[i % problems.len()];
        let status = if i < 8 {
            Status::Accepted
        } else {
            Status::WrongAnswer
        };
        handles.push(tokio::spawn(async move {
            recorder
                .record(&submission("alice", problem_id), "Problem", verdict(status))
                .await
        }));
    }
    for handle in handles {
        assert!(matches!(handle.await.unwrap(), Recorded::Persisted(_)));
    }

    let stats = first_store.load_stats("alice").await.unwrap();
    assert_eq!(stats.version, 16);
    assert_eq!(stats.value.solved_count, 4);
    assert_eq!(stats.value.attempted_count, 4);
    for problem_id in problems {
        assert_eq!(
            first_store
                .submissions("alice", problem_id)
                .await
                .unwrap()
                .len(),
            4
        );
    }
}

#[tokio::test]
async fn users_are_independent() {
    let guard = test_db_path();
    let store = Arc::new(SqliteStore::open(&guard.db_path).await.unwrap());
    let recorder = Recorder::new(store.clone(), policy());

    recorder
        .record(&submission("alice", "add"), "Add", verdict(Status::Accepted))
        .await;
    recorder
        .record(&submission("bob", "add"), "Add", verdict(Status::RuntimeError))
        .await;

    let alice = recorder.stats("alice").await.unwrap();
    let bob = recorder.stats("bob").await.unwrap();
    assert_eq!((alice.solved_count, alice.attempted_count), (1, 0));
    assert_eq!((bob.solved_count, bob.attempted_count), (0, 1));
    assert_eq!(recorder.history("bob", "add").await.unwrap().len(), 1);
}

#[tokio::test]
async fn history_survives_reopening() {
    let guard = test_db_path();
    {
        let store = Arc::new(SqliteStore::open(&guard.db_path).await.unwrap());
        let recorder = Recorder::new(store.clone(), policy());
        recorder
            .record(&submission("alice", "add"), "Add", verdict(Status::Accepted))
            .await;
        store.pool().close().await;
    }

    let store = SqliteStore::open(&guard.db_path).await.unwrap();
    let history = store.submissions("alice", "add").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, Status::Accepted);
    assert_eq!(history[0].problem_name, "Add");
}
