//! Integration tests for the task executor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jobmill::db::Db;
use jobmill::engine::*;
use jobmill::jobtype::{JobType, JobTypePolicy, JobTypeRegistry};
use jobmill::model::*;
use sqlx::SqliteConnection;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Work function driven by a closure over the attempt context.
struct ScriptedWork<F> {
    script: F,
    calls: AtomicUsize,
}

impl<F> ScriptedWork<F>
where
    F: Fn(&WorkContext) -> anyhow::Result<WorkOutcome> + Send + Sync + 'static,
{
    fn new(script: F) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<F> WorkFunction for ScriptedWork<F>
where
    F: Fn(&WorkContext) -> anyhow::Result<WorkOutcome> + Send + Sync + 'static,
{
    async fn perform(&self, ctx: &WorkContext) -> anyhow::Result<WorkOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.script)(ctx)
    }
}

fn always_ok() -> Arc<dyn WorkFunction> {
    ScriptedWork::new(|_| Ok(WorkOutcome::success()))
}

async fn setup(job_type: JobType) -> (Arc<Db>, TaskExecutor) {
    let db = Arc::new(Db::in_memory().await.expect("in-memory db"));
    let mut registry = JobTypeRegistry::new();
    registry.register(job_type).expect("register job type");
    let executor = TaskExecutor::new(Arc::clone(&db), Arc::new(registry));
    (db, executor)
}

async fn create_job(db: &Db, job_type: &str, subtasks: usize) -> Job {
    db.create_job(NewJob::new(job_type).numbered_subtasks(subtasks))
        .await
        .expect("create job")
}

async fn subtask(db: &Db, job: &Job, subtask_id: &str) -> QueueItem {
    db.find_subtask(&job.job_type, job.id, subtask_id)
        .await
        .unwrap()
        .expect("subtask exists")
}

/// Put a subtask in `processing` as if a worker claimed it `age` ago.
async fn force_processing(db: &Db, job: &Job, subtask_id: &str, age: chrono::Duration) {
    let ts = (Utc::now() - age).timestamp_millis();
    sqlx::query(
        "UPDATE queue_items SET status = 'processing', attempts = attempts + 1, lease_token = 'other-worker', updated_at = ?1
         WHERE job_type = ?2 AND job_id = ?3 AND subtask_id = ?4",
    )
    .bind(ts)
    .bind(&job.job_type)
    .bind(job.id.0)
    .bind(subtask_id)
    .execute(db.pool())
    .await
    .unwrap();
    sqlx::query("UPDATE jobs SET status = 'processing', last_processed_at = ?1 WHERE id = ?2")
        .bind(ts)
        .bind(job.id.0)
        .execute(db.pool())
        .await
        .unwrap();
}

// ---------------------------------------------------------------------------
// Outcomes and finalization
// ---------------------------------------------------------------------------

#[tokio::test]
async fn one_failed_subtask_fails_the_job() {
    let work = ScriptedWork::new(|ctx| {
        if ctx.subtask_id == "2" {
            Ok(WorkOutcome::failure("quota exceeded"))
        } else {
            Ok(WorkOutcome::success())
        }
    });
    let (db, executor) = setup(JobType::new(JobTypePolicy::new("topic"), work)).await;
    let job = create_job(&db, "topic", 3).await;

    let first = executor.process(job.id, "1").await.unwrap();
    assert!(first.success, "{first:?}");
    assert_eq!(first.settled, None);

    let second = executor.process(job.id, "2").await.unwrap();
    assert!(!second.success);
    assert_eq!(second.failure, Some(FailureKind::WorkFailed));
    assert_eq!(second.message, "quota exceeded");
    assert_eq!(second.settled, None);

    let third = executor.process(job.id, "3").await.unwrap();
    assert!(third.success);
    assert_eq!(third.settled, Some(JobStatus::Failed));

    let statuses: Vec<_> = db
        .list_subtasks("topic", job.id)
        .await
        .unwrap()
        .into_iter()
        .map(|i| i.status)
        .collect();
    assert_eq!(
        statuses,
        vec![
            SubtaskStatus::Completed,
            SubtaskStatus::Failed,
            SubtaskStatus::Completed
        ]
    );
    assert_eq!(
        subtask(&db, &job, "2").await.error_message.as_deref(),
        Some("quota exceeded")
    );
    assert_eq!(db.get_job(job.id).await.unwrap().status, JobStatus::Failed);
}

#[tokio::test]
async fn final_status_does_not_depend_on_completion_order() {
    let orders: [[&str; 3]; 4] = [
        ["1", "2", "3"],
        ["3", "2", "1"],
        ["2", "1", "3"],
        ["2", "3", "1"],
    ];

    for order in orders {
        let work = ScriptedWork::new(|ctx| {
            if ctx.subtask_id == "2" {
                Ok(WorkOutcome::failure("bad outline"))
            } else {
                Ok(WorkOutcome::success())
            }
        });
        let (db, executor) = setup(JobType::new(JobTypePolicy::new("article"), work)).await;
        let job = create_job(&db, "article", 3).await;

        for id in order {
            executor.process(job.id, id).await.unwrap();
        }
        assert_eq!(
            db.get_job(job.id).await.unwrap().status,
            JobStatus::Failed,
            "order {order:?}"
        );
    }

    let (db, executor) = setup(JobType::new(JobTypePolicy::new("article"), always_ok())).await;
    let job = create_job(&db, "article", 3).await;
    for id in ["3", "1", "2"] {
        executor.process(job.id, id).await.unwrap();
    }
    assert_eq!(db.get_job(job.id).await.unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn finalization_is_idempotent() {
    let (db, executor) = setup(JobType::new(JobTypePolicy::new("topic"), always_ok())).await;
    let job = create_job(&db, "topic", 2).await;

    executor.process(job.id, "1").await.unwrap();
    let open = db.finalize_job("topic", job.id).await.unwrap();
    assert_eq!(open.settled, None);
    assert!(!open.changed);

    let report = executor.process(job.id, "2").await.unwrap();
    assert_eq!(report.settled, Some(JobStatus::Completed));
    let settled_at = db.get_job(job.id).await.unwrap().updated_at;

    for _ in 0..2 {
        let again = db.finalize_job("topic", job.id).await.unwrap();
        assert_eq!(again.settled, Some(JobStatus::Completed));
        assert!(!again.changed);
    }
    let job = db.get_job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.updated_at, settled_at);
}

#[tokio::test]
async fn progress_reporter_sees_each_resolution() {
    struct Recorder(Mutex<Vec<ProgressUpdate>>);

    #[async_trait]
    impl ProgressReporter for Recorder {
        async fn report(&self, update: &ProgressUpdate) {
            self.0.lock().unwrap().push(update.clone());
        }
    }

    let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
    let work = ScriptedWork::new(|ctx| {
        if ctx.subtask_id == "1" {
            Ok(WorkOutcome::success())
        } else {
            Ok(WorkOutcome::failure(""))
        }
    });
    let job_type = JobType::new(JobTypePolicy::new("topic"), work)
        .with_progress(Arc::clone(&recorder) as Arc<dyn ProgressReporter>);
    let (db, executor) = setup(job_type).await;
    let job = create_job(&db, "topic", 2).await;

    executor.process(job.id, "1").await.unwrap();
    let second = executor.process(job.id, "2").await.unwrap();
    assert_eq!(second.message, "unknown error");

    let updates = recorder.0.lock().unwrap();
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0].result, SubtaskResult::Completed);
    assert_eq!(updates[0].counts.completed, 1);
    assert_eq!(updates[0].counts.pending, 1);
    assert_eq!(
        updates[1].result,
        SubtaskResult::Failed {
            message: "unknown error".to_string()
        }
    );
    assert_eq!(updates[1].counts.resolved(), 2);
}

// ---------------------------------------------------------------------------
// Gates
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_job_subtask_or_job_type_is_rejected() {
    let (db, executor) = setup(JobType::new(JobTypePolicy::new("topic"), always_ok())).await;

    let report = executor.process(JobId(404), "1").await.unwrap();
    assert_eq!(report.failure, Some(FailureKind::JobNotFound));

    let job = create_job(&db, "topic", 1).await;
    let report = executor.process(job.id, "nope").await.unwrap();
    assert_eq!(report.failure, Some(FailureKind::SubtaskNotFound));

    let unknown = create_job(&db, "keyword-research", 1).await;
    let report = executor.process(unknown.id, "1").await.unwrap();
    assert_eq!(report.failure, Some(FailureKind::Unroutable));
    assert_eq!(
        subtask(&db, &unknown, "1").await.status,
        SubtaskStatus::Pending
    );
}

#[tokio::test]
async fn in_flight_subtask_is_not_processable_and_nothing_changes() {
    let work = ScriptedWork::new(|_| Ok(WorkOutcome::success()));
    let (db, executor) = setup(JobType::new(
        JobTypePolicy::new("topic"),
        Arc::clone(&work) as Arc<dyn WorkFunction>,
    ))
    .await;
    let job = create_job(&db, "topic", 1).await;
    force_processing(&db, &job, "1", chrono::Duration::minutes(5)).await;

    let job_before = db.get_job(job.id).await.unwrap();
    let item_before = subtask(&db, &job, "1").await;

    let report = executor.process(job.id, "1").await.unwrap();
    assert_eq!(report.failure, Some(FailureKind::NotProcessable));
    assert_eq!(work.calls(), 0);

    let job_after = db.get_job(job.id).await.unwrap();
    let item_after = subtask(&db, &job, "1").await;
    assert_eq!(job_after.status, job_before.status);
    assert_eq!(job_after.updated_at, job_before.updated_at);
    assert_eq!(item_after.status, SubtaskStatus::Processing);
    assert_eq!(item_after.updated_at, item_before.updated_at);
    assert_eq!(item_after.attempts, item_before.attempts);
    assert_eq!(item_after.lease_token, item_before.lease_token);
}

#[tokio::test]
async fn stale_processing_subtask_is_taken_over() {
    let (db, executor) = setup(JobType::new(JobTypePolicy::new("topic"), always_ok())).await;
    let job = create_job(&db, "topic", 1).await;
    force_processing(&db, &job, "1", chrono::Duration::minutes(40)).await;

    let report = executor.process(job.id, "1").await.unwrap();
    assert!(report.success, "{report:?}");

    let item = subtask(&db, &job, "1").await;
    assert_eq!(item.status, SubtaskStatus::Completed);
    assert_eq!(item.attempts, 2);
    assert_eq!(item.lease_token, None);
    assert_eq!(db.get_job(job.id).await.unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn stale_lock_window_is_per_job_type() {
    let policy = JobTypePolicy::new("topic")
        .with_work_timeout(Duration::from_secs(30))
        .with_stale_lock(Duration::from_secs(60));
    let (db, executor) = setup(JobType::new(policy, always_ok())).await;
    let job = create_job(&db, "topic", 1).await;
    force_processing(&db, &job, "1", chrono::Duration::minutes(2)).await;

    assert!(executor.process(job.id, "1").await.unwrap().success);
}

#[tokio::test]
async fn resolved_subtasks_and_held_jobs_are_not_processable() {
    let (db, executor) = setup(JobType::new(JobTypePolicy::new("topic"), always_ok())).await;

    let job = create_job(&db, "topic", 2).await;
    assert!(executor.process(job.id, "1").await.unwrap().success);
    let again = executor.process(job.id, "1").await.unwrap();
    assert_eq!(again.failure, Some(FailureKind::NotProcessable));

    db.pause_job(job.id).await.unwrap();
    let paused = executor.process(job.id, "2").await.unwrap();
    assert_eq!(paused.failure, Some(FailureKind::NotProcessable));

    db.cancel_job(job.id).await.unwrap();
    let cancelled = executor.process(job.id, "2").await.unwrap();
    assert_eq!(cancelled.failure, Some(FailureKind::NotProcessable));
    assert_eq!(subtask(&db, &job, "2").await.status, SubtaskStatus::Pending);
}

#[tokio::test]
async fn guard_veto_skips_without_touching_state() {
    struct Deny;

    #[async_trait]
    impl ConcurrencyGuard for Deny {
        async fn allow(&self, _db: &Db, _job: &Job, _subtask_id: &str) -> jobmill::error::Result<bool> {
            Ok(false)
        }
    }

    let job_type = JobType::new(JobTypePolicy::new("topic"), always_ok()).with_guard(Arc::new(Deny));
    let (db, executor) = setup(job_type).await;
    let job = create_job(&db, "topic", 1).await;

    let report = executor.process(job.id, "1").await.unwrap();
    assert_eq!(report.failure, Some(FailureKind::ConcurrentSkip));
    assert!(report.failure.unwrap().is_deferral());
    assert!(report.retry_after.is_some());

    let item = subtask(&db, &job, "1").await;
    assert_eq!(item.status, SubtaskStatus::Pending);
    assert_eq!(item.attempts, 0);
    assert_eq!(db.get_job(job.id).await.unwrap().status, JobStatus::Pending);
}

#[tokio::test]
async fn single_flight_blocks_siblings_of_an_active_subtask() {
    let policy = JobTypePolicy::new("article").with_single_flight();
    let (db, executor) = setup(JobType::new(policy, always_ok())).await;
    let job = create_job(&db, "article", 2).await;

    force_processing(&db, &job, "1", chrono::Duration::minutes(1)).await;
    let report = executor.process(job.id, "2").await.unwrap();
    assert_eq!(report.failure, Some(FailureKind::ConcurrentSkip));

    // A dead sibling doesn't block.
    force_processing(&db, &job, "1", chrono::Duration::minutes(45)).await;
    let report = executor.process(job.id, "2").await.unwrap();
    assert!(report.success, "{report:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_flight_holds_under_concurrent_dispatch() {
    /// Tracks how many performs overlap.
    struct Overlap {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl WorkFunction for Overlap {
        async fn perform(&self, _ctx: &WorkContext) -> anyhow::Result<WorkOutcome> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(300)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(WorkOutcome::success())
        }
    }

    let work = Arc::new(Overlap {
        running: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let policy = JobTypePolicy::new("article").with_single_flight();
    let (db, executor) = setup(JobType::new(
        policy,
        Arc::clone(&work) as Arc<dyn WorkFunction>,
    ))
    .await;
    let job = create_job(&db, "article", 4).await;

    let job_id = job.id;
    let mut handles = Vec::new();
    for id in ["1", "2", "3", "4"] {
        let executor = executor.clone();
        handles.push(tokio::spawn(async move {
            executor.process(job_id, id).await.unwrap()
        }));
    }

    let mut successes = 0;
    for handle in handles {
        let report = handle.await.unwrap();
        if report.success {
            successes += 1;
        } else {
            assert_eq!(report.failure, Some(FailureKind::ConcurrentSkip), "{report:?}");
            assert!(report.retry_after.is_some());
        }
    }

    assert!(successes >= 1);
    assert_eq!(work.peak.load(Ordering::SeqCst), 1);

    // Skipped siblings were never claimed.
    let claimed = db
        .list_subtasks("article", job.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|i| i.attempts > 0)
        .count();
    assert_eq!(claimed, successes);
}

#[tokio::test]
async fn job_paused_before_the_claim_is_not_claimed() {
    /// Pauses the job right after the processability gate.
    struct PauseOnCheck;

    #[async_trait]
    impl ConcurrencyGuard for PauseOnCheck {
        async fn allow(&self, db: &Db, job: &Job, _subtask_id: &str) -> jobmill::error::Result<bool> {
            db.pause_job(job.id).await?;
            Ok(true)
        }
    }

    let work = ScriptedWork::new(|_| Ok(WorkOutcome::success()));
    let job_type = JobType::new(
        JobTypePolicy::new("topic"),
        Arc::clone(&work) as Arc<dyn WorkFunction>,
    )
    .with_guard(Arc::new(PauseOnCheck));
    let (db, executor) = setup(job_type).await;
    let job = create_job(&db, "topic", 1).await;

    let report = executor.process(job.id, "1").await.unwrap();
    assert_eq!(report.failure, Some(FailureKind::NotProcessable));
    assert_eq!(report.message, format!("job {} became paused before the claim", job.id));
    assert_eq!(work.calls(), 0);

    let item = subtask(&db, &job, "1").await;
    assert_eq!(item.status, SubtaskStatus::Pending);
    assert_eq!(item.attempts, 0);
    assert_eq!(item.lease_token, None);
    assert_eq!(db.get_job(job.id).await.unwrap().status, JobStatus::Paused);
}

#[tokio::test]
async fn rate_gate_throttles_and_records_even_failed_calls() {
    let work = ScriptedWork::new(|_| Ok(WorkOutcome::failure("model overloaded")));
    let policy = JobTypePolicy::new("topic").with_rate_gate("openai", Duration::from_secs(60));
    let (db, executor) = setup(JobType::new(policy, work)).await;
    let job = create_job(&db, "topic", 2).await;

    let first = executor.process(job.id, "1").await.unwrap();
    assert_eq!(first.failure, Some(FailureKind::WorkFailed));
    assert!(db.rate_gate_last_call("openai").await.unwrap().is_some());

    let second = executor.process(job.id, "2").await.unwrap();
    assert_eq!(second.failure, Some(FailureKind::RateLimited));
    let wait = second.retry_after.expect("retry hint");
    assert!(wait > Duration::from_secs(50) && wait <= Duration::from_secs(60));

    let item = subtask(&db, &job, "2").await;
    assert_eq!(item.status, SubtaskStatus::Pending);
    assert_eq!(item.attempts, 0);
}

#[tokio::test]
async fn concurrent_dispatch_runs_the_work_once() {
    struct SlowWork(AtomicUsize);

    #[async_trait]
    impl WorkFunction for SlowWork {
        async fn perform(&self, _ctx: &WorkContext) -> anyhow::Result<WorkOutcome> {
            self.0.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(WorkOutcome::success())
        }
    }

    let work = Arc::new(SlowWork(AtomicUsize::new(0)));
    let (db, executor) = setup(JobType::new(
        JobTypePolicy::new("topic"),
        Arc::clone(&work) as Arc<dyn WorkFunction>,
    ))
    .await;
    let job = create_job(&db, "topic", 1).await;

    let job_id = job.id;
    let mut handles = Vec::new();
    for _ in 0..8 {
        let executor = executor.clone();
        handles.push(tokio::spawn(async move {
            executor.process(job_id, "1").await.unwrap()
        }));
    }

    let mut successes = 0;
    for handle in handles {
        let report = handle.await.unwrap();
        if report.success {
            successes += 1;
        } else {
            assert_eq!(report.failure, Some(FailureKind::NotProcessable));
        }
    }

    assert_eq!(successes, 1);
    assert_eq!(work.0.load(Ordering::SeqCst), 1);
    assert_eq!(subtask(&db, &job, "1").await.attempts, 1);
}

// ---------------------------------------------------------------------------
// Faults and rollback
// ---------------------------------------------------------------------------

/// Writes an article row in `persist`, optionally failing afterwards.
struct ArticleWriter {
    outcome: WorkOutcome,
    fail_persist: bool,
}

#[async_trait]
impl WorkFunction for ArticleWriter {
    async fn perform(&self, _ctx: &WorkContext) -> anyhow::Result<WorkOutcome> {
        Ok(self.outcome.clone())
    }

    async fn persist(
        &self,
        conn: &mut SqliteConnection,
        ctx: &WorkContext,
        outcome: &WorkOutcome,
    ) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO articles (job_id, subtask_id, body) VALUES (?1, ?2, ?3)")
            .bind(ctx.job.id.0)
            .bind(&ctx.subtask_id)
            .bind(outcome.data.to_string())
            .execute(&mut *conn)
            .await?;
        if self.fail_persist {
            anyhow::bail!("duplicate slug");
        }
        Ok(())
    }
}

async fn article_setup(writer: ArticleWriter) -> (Arc<Db>, TaskExecutor) {
    let (db, executor) = setup(JobType::new(JobTypePolicy::new("article"), Arc::new(writer))).await;
    sqlx::query("CREATE TABLE articles (job_id INTEGER, subtask_id TEXT, body TEXT)")
        .execute(db.pool())
        .await
        .unwrap();
    (db, executor)
}

async fn article_count(db: &Db) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM articles")
        .fetch_one(db.pool())
        .await
        .unwrap()
}

#[tokio::test]
async fn success_commits_domain_rows_with_the_subtask() {
    let (db, executor) = article_setup(ArticleWriter {
        outcome: WorkOutcome::success_with(serde_json::json!({"title": "Composting 101"})),
        fail_persist: false,
    })
    .await;
    let job = create_job(&db, "article", 1).await;

    let report = executor.process(job.id, "1").await.unwrap();
    assert!(report.success);
    assert_eq!(article_count(&db).await, 1);
    assert_eq!(subtask(&db, &job, "1").await.status, SubtaskStatus::Completed);
}

#[tokio::test]
async fn failed_persist_rolls_back_and_fails_the_subtask() {
    let (db, executor) = article_setup(ArticleWriter {
        outcome: WorkOutcome::success_with(serde_json::json!({"title": "Composting 101"})),
        fail_persist: true,
    })
    .await;
    let job = create_job(&db, "article", 1).await;

    let report = executor.process(job.id, "1").await.unwrap();
    assert_eq!(report.failure, Some(FailureKind::ProcessingException));
    assert_eq!(report.message, "duplicate slug");
    assert_eq!(report.settled, Some(JobStatus::Failed));

    assert_eq!(article_count(&db).await, 0);
    let item = subtask(&db, &job, "1").await;
    assert_eq!(item.status, SubtaskStatus::Failed);
    assert_eq!(item.error_message.as_deref(), Some("duplicate slug"));
}

#[tokio::test]
async fn domain_failure_writes_nothing() {
    let (db, executor) = article_setup(ArticleWriter {
        outcome: WorkOutcome::failure("quota exceeded"),
        fail_persist: false,
    })
    .await;
    let job = create_job(&db, "article", 1).await;

    let report = executor.process(job.id, "1").await.unwrap();
    assert_eq!(report.failure, Some(FailureKind::WorkFailed));
    assert_eq!(article_count(&db).await, 0);
    assert_eq!(subtask(&db, &job, "1").await.status, SubtaskStatus::Failed);
}

#[tokio::test]
async fn work_error_is_a_processing_exception() {
    let work = ScriptedWork::new(|_| Err(anyhow::anyhow!("generator crashed")));
    let (db, executor) = setup(JobType::new(JobTypePolicy::new("topic"), work)).await;
    let job = create_job(&db, "topic", 1).await;

    let report = executor.process(job.id, "1").await.unwrap();
    assert!(!report.success);
    assert_eq!(report.failure, Some(FailureKind::ProcessingException));
    assert_eq!(report.message, "generator crashed");

    let item = subtask(&db, &job, "1").await;
    assert_eq!(item.status, SubtaskStatus::Failed);
    assert_eq!(item.error_message.as_deref(), Some("generator crashed"));
    assert_eq!(db.get_job(job.id).await.unwrap().status, JobStatus::Failed);
}

#[tokio::test]
async fn panicking_work_does_not_leave_the_subtask_processing() {
    let work = ScriptedWork::new(|_| -> anyhow::Result<WorkOutcome> { panic!("index out of bounds") });
    let (db, executor) = setup(JobType::new(JobTypePolicy::new("topic"), work)).await;
    let job = create_job(&db, "topic", 1).await;

    let report = executor.process(job.id, "1").await.unwrap();
    assert_eq!(report.failure, Some(FailureKind::ProcessingException));
    assert!(report.message.contains("index out of bounds"), "{}", report.message);
    assert_eq!(subtask(&db, &job, "1").await.status, SubtaskStatus::Failed);
}

#[tokio::test]
async fn slow_work_times_out() {
    struct Hang;

    #[async_trait]
    impl WorkFunction for Hang {
        async fn perform(&self, _ctx: &WorkContext) -> anyhow::Result<WorkOutcome> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(WorkOutcome::success())
        }
    }

    let policy = JobTypePolicy::new("topic").with_work_timeout(Duration::from_secs(1));
    let (db, executor) = setup(JobType::new(policy, Arc::new(Hang))).await;
    let job = create_job(&db, "topic", 1).await;

    let report = executor.process(job.id, "1").await.unwrap();
    assert_eq!(report.failure, Some(FailureKind::ProcessingException));
    assert!(report.message.contains("timed out"), "{}", report.message);
    assert_eq!(subtask(&db, &job, "1").await.status, SubtaskStatus::Failed);
}

#[tokio::test]
async fn reclaimed_attempt_cannot_overwrite_the_subtask() {
    /// Simulates the reclaimer resetting the row while the work runs.
    struct ReclaimedMidFlight(sqlx::SqlitePool);

    #[async_trait]
    impl WorkFunction for ReclaimedMidFlight {
        async fn perform(&self, ctx: &WorkContext) -> anyhow::Result<WorkOutcome> {
            sqlx::query(
                "UPDATE queue_items SET status = 'pending', lease_token = NULL
                 WHERE job_id = ?1 AND subtask_id = ?2",
            )
            .bind(ctx.job.id.0)
            .bind(&ctx.subtask_id)
            .execute(&self.0)
            .await?;
            Ok(WorkOutcome::success())
        }
    }

    let db = Arc::new(Db::in_memory().await.unwrap());
    let mut registry = JobTypeRegistry::new();
    registry
        .register(JobType::new(
            JobTypePolicy::new("topic"),
            Arc::new(ReclaimedMidFlight(db.pool().clone())),
        ))
        .unwrap();
    let executor = TaskExecutor::new(Arc::clone(&db), Arc::new(registry));
    let job = create_job(&db, "topic", 1).await;

    let report = executor.process(job.id, "1").await.unwrap();
    assert_eq!(report.failure, Some(FailureKind::LeaseLost));
    assert_eq!(subtask(&db, &job, "1").await.status, SubtaskStatus::Pending);
    assert_eq!(db.get_job(job.id).await.unwrap().status, JobStatus::Processing);
}
