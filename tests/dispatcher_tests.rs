use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use batchpool::config::{SchedulerConfig, TimeoutPolicy};
use batchpool::manifest::ManifestWriter;
use batchpool::scheduler::{Dispatcher, JobId, JobStatus};
use batchpool::worker::{ExecutorError, JobAssignment, JobExecutor, ProgressReporter, WorkerId};
use batchpool::BatchError;

/// What the scripted executor does with one job.
#[derive(Debug, Clone)]
enum Script {
    Complete(Duration),
    Hang,
    Fail,
    Panic,
}

/// Executor driven by a per-job script, recording when each job started
/// relative to its creation.
struct ScriptedExecutor {
    scripts: Vec<Script>,
    origin: Instant,
    started: Mutex<Vec<(JobId, Duration)>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedExecutor {
    fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts,
            origin: Instant::now(),
            started: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    fn started(&self) -> Vec<(JobId, Duration)> {
        let mut started = self.started.lock().unwrap().clone();
        started.sort_by_key(|(id, _)| *id);
        started
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        job: &JobAssignment,
        progress: &ProgressReporter,
    ) -> Result<String, ExecutorError> {
        self.started
            .lock()
            .unwrap()
            .push((job.job_id, self.origin.elapsed()));
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);

        progress.status(format!("job {}: running", job.ordinal())).await;
        progress.progress(50).await;

        let script = self
            .scripts
            .get(job.job_id)
            .cloned()
            .unwrap_or(Script::Complete(Duration::ZERO));
        let result = match script {
            Script::Complete(after) => {
                tokio::time::sleep(after).await;
                Ok(format!("job-{}.out", job.job_id))
            }
            Script::Hang => std::future::pending().await,
            Script::Fail => Err(ExecutorError::Other(format!(
                "scripted failure on job {}",
                job.job_id
            ))),
            Script::Panic => panic!("scripted panic on job {}", job.job_id),
        };
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

fn payloads(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("https://example.com/{}", i)).collect()
}

fn config(concurrency: usize, timeout: Duration) -> SchedulerConfig {
    SchedulerConfig::default()
        .with_concurrency(concurrency)
        .with_task_timeout(timeout)
}

fn assert_near(actual: Duration, expected_ms: u64) {
    let expected = Duration::from_millis(expected_ms);
    let diff = if actual > expected {
        actual - expected
    } else {
        expected - actual
    };
    assert!(
        diff <= Duration::from_millis(5),
        "expected ~{:?}, got {:?}",
        expected,
        actual
    );
}

#[tokio::test(start_paused = true)]
async fn test_all_jobs_complete() {
    let executor = ScriptedExecutor::new(vec![Script::Complete(Duration::from_secs(1)); 4]);
    let manifest = Arc::new(ManifestWriter::new());

    let dispatcher = Dispatcher::new(config(2, Duration::from_secs(30)), payloads(4), executor.clone())
        .unwrap()
        .with_artifact_sink(manifest.clone());
    let report = dispatcher.run().await.unwrap();

    assert_eq!(report.counts.total, 4);
    assert_eq!(report.counts.completed, 4);
    assert_eq!(report.counts.timed_out, 0);
    assert_eq!(report.workers_spawned, 2);
    for job in &report.jobs {
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.artifact, Some(format!("job-{}.out", job.id)));
        assert!(job.worker.is_some());
        assert!(job.finished_at.is_some());
    }

    let entries = manifest.entries();
    assert_eq!(entries.len(), 4);
    assert_eq!(entries[3], (3, "job-3.out".to_string()));
    assert!(executor.peak() <= 2);
}

#[tokio::test(start_paused = true)]
async fn test_hung_job_times_out_and_queue_drains() {
    let executor = ScriptedExecutor::new(vec![
        Script::Complete(Duration::from_secs(5)),
        Script::Hang,
        Script::Complete(Duration::from_secs(298)),
        Script::Complete(Duration::from_secs(10)),
        Script::Complete(Duration::from_secs(10)),
    ]);

    let dispatcher =
        Dispatcher::new(config(2, Duration::from_secs(300)), payloads(5), executor.clone()).unwrap();
    let report = dispatcher.run().await.unwrap();

    let started = executor.started();
    let ids: Vec<JobId> = started.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    for ((_, at), expected_ms) in started.iter().zip([0, 0, 5_000, 300_000, 303_000]) {
        assert_near(*at, expected_ms);
    }

    assert_eq!(report.counts.completed, 4);
    assert_eq!(report.counts.timed_out, 1);
    assert_eq!(report.jobs[1].status, JobStatus::TimedOut);
    assert_eq!(report.jobs[1].progress, 0);
    assert!(report.jobs[1].artifact.is_none());
    // The hung worker was recycled once.
    assert_eq!(report.workers_spawned, 3);
    assert!(executor.peak() <= 3);
}

#[tokio::test(start_paused = true)]
async fn test_reuse_policy_records_late_completion() {
    let executor = ScriptedExecutor::new(vec![
        Script::Complete(Duration::from_secs(15)),
        Script::Complete(Duration::from_secs(1)),
    ]);
    let manifest = Arc::new(ManifestWriter::new());

    let config = config(1, Duration::from_secs(10)).with_timeout_policy(TimeoutPolicy::Reuse);
    let dispatcher = Dispatcher::new(config, payloads(2), executor.clone())
        .unwrap()
        .with_artifact_sink(manifest.clone());
    let report = dispatcher.run().await.unwrap();

    assert_eq!(report.counts.completed, 1);
    assert_eq!(report.counts.timed_out, 1);
    assert_eq!(report.workers_spawned, 1);

    // First terminal state wins; the late artifact is only a note.
    let late = &report.jobs[0];
    assert_eq!(late.status, JobStatus::TimedOut);
    assert!(late.artifact.is_none());
    assert_eq!(late.late_artifact.as_deref(), Some("job-0.out"));

    let done = &report.jobs[1];
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.worker, late.worker);

    // The reused unit only got to the buffered job once the stale one ended.
    let started = executor.started();
    assert_near(started[1].1, 15_000);

    assert_eq!(manifest.entries(), vec![(1, "job-1.out".to_string())]);
}

#[tokio::test(start_paused = true)]
async fn test_reuse_policy_replaces_unit_that_refuses_a_job() {
    let executor = ScriptedExecutor::new(vec![
        Script::Hang,
        Script::Complete(Duration::from_secs(1)),
        Script::Complete(Duration::from_secs(1)),
        Script::Complete(Duration::from_secs(1)),
    ]);

    let config = config(1, Duration::from_secs(10)).with_timeout_policy(TimeoutPolicy::Reuse);
    let dispatcher = Dispatcher::new(config, payloads(4), executor.clone()).unwrap();
    let status = dispatcher.subscribe();

    let start = Instant::now();
    let report = tokio::time::timeout(Duration::from_secs(3600), dispatcher.run())
        .await
        .expect("batch never completed")
        .unwrap();

    // Job 1 waits behind the hung job and times out at 20s. Job 2 then finds
    // the unit's buffer full, so the unit is retired and job 2 times out at 30s.
    assert_near(start.elapsed(), 30_000);
    assert_eq!(report.counts.total, 4);
    assert_eq!(report.counts.completed + report.counts.timed_out, 4);
    assert_eq!(report.counts.timed_out, 3);
    assert_eq!(report.counts.pending, 0);
    for id in 0..3 {
        assert_eq!(report.jobs[id].status, JobStatus::TimedOut);
        assert_eq!(report.jobs[id].worker, Some(WorkerId(1)));
    }
    assert_eq!(report.jobs[3].status, JobStatus::Completed);
    assert_eq!(report.jobs[3].worker, Some(WorkerId(2)));
    assert_eq!(report.workers_spawned, 2);

    // Only the hung job and the one given to the replacement ever ran.
    let started = executor.started();
    let ids: Vec<JobId> = started.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, vec![0, 3]);
    assert_near(started[1].1, 20_000);

    assert!(status.borrow().finished);
}

#[tokio::test(start_paused = true)]
async fn test_recycle_policy_replaces_timed_out_worker() {
    let executor = ScriptedExecutor::new(vec![
        Script::Complete(Duration::from_secs(15)),
        Script::Complete(Duration::from_secs(1)),
    ]);

    let config = config(1, Duration::from_secs(10)).with_timeout_policy(TimeoutPolicy::Recycle);
    let dispatcher = Dispatcher::new(config, payloads(2), executor.clone()).unwrap();
    let report = dispatcher.run().await.unwrap();

    assert_eq!(report.counts.completed, 1);
    assert_eq!(report.counts.timed_out, 1);
    assert_eq!(report.workers_spawned, 2);

    assert_eq!(report.jobs[0].status, JobStatus::TimedOut);
    assert!(report.jobs[0].late_artifact.is_none());
    assert_eq!(report.jobs[0].worker, Some(WorkerId(1)));
    assert_eq!(report.jobs[1].worker, Some(WorkerId(2)));

    let started = executor.started();
    assert_near(started[1].1, 10_000);
}

#[tokio::test(start_paused = true)]
async fn test_recycle_without_pending_work_spawns_nothing() {
    let executor = ScriptedExecutor::new(vec![Script::Hang]);

    let start = Instant::now();
    let dispatcher =
        Dispatcher::new(config(1, Duration::from_secs(5)), payloads(1), executor).unwrap();
    let report = dispatcher.run().await.unwrap();

    assert_near(start.elapsed(), 5_000);
    assert_eq!(report.counts.timed_out, 1);
    assert_eq!(report.workers_spawned, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_worker_is_respawned() {
    let executor = ScriptedExecutor::new(vec![
        Script::Fail,
        Script::Complete(Duration::from_secs(1)),
    ]);

    let dispatcher =
        Dispatcher::new(config(1, Duration::from_secs(10)), payloads(2), executor.clone()).unwrap();
    let report = dispatcher.run().await.unwrap();

    // The lost job is only resolved by its timeout.
    assert_eq!(report.jobs[0].status, JobStatus::TimedOut);
    assert_eq!(report.jobs[0].worker, Some(WorkerId(1)));
    assert_eq!(report.jobs[1].status, JobStatus::Completed);
    assert_eq!(report.jobs[1].worker, Some(WorkerId(2)));
    assert_eq!(report.workers_spawned, 2);

    let started = executor.started();
    assert_near(started[1].1, 0);
}

#[tokio::test(start_paused = true)]
async fn test_panicked_worker_is_respawned() {
    let executor = ScriptedExecutor::new(vec![
        Script::Panic,
        Script::Complete(Duration::from_secs(1)),
        Script::Complete(Duration::from_secs(1)),
    ]);

    let dispatcher =
        Dispatcher::new(config(2, Duration::from_secs(10)), payloads(3), executor).unwrap();
    let report = dispatcher.run().await.unwrap();

    assert_eq!(report.counts.completed, 2);
    assert_eq!(report.counts.timed_out, 1);
    assert_eq!(report.jobs[0].status, JobStatus::TimedOut);
    assert_eq!(report.workers_spawned, 3);
}

#[tokio::test(start_paused = true)]
async fn test_empty_batch_completes_immediately() {
    let executor = ScriptedExecutor::new(Vec::new());

    let dispatcher =
        Dispatcher::new(config(4, Duration::from_secs(10)), Vec::new(), executor).unwrap();
    let status = dispatcher.subscribe();
    let report = dispatcher.run().await.unwrap();

    assert_eq!(report.counts.total, 0);
    assert_eq!(report.workers_spawned, 0);
    assert!(report.jobs.is_empty());
    assert!(status.borrow().finished);
}

#[tokio::test(start_paused = true)]
async fn test_zero_concurrency_is_rejected() {
    let executor = ScriptedExecutor::new(Vec::new());

    let dispatcher =
        Dispatcher::new(config(0, Duration::from_secs(10)), payloads(2), executor).unwrap();
    let result = dispatcher.run().await;

    assert!(matches!(result, Err(BatchError::PoolExhausted(_))));
}

#[tokio::test]
async fn test_zero_timeout_is_rejected() {
    let executor = ScriptedExecutor::new(Vec::new());
    let result = Dispatcher::new(config(1, Duration::ZERO), payloads(1), executor);
    assert!(matches!(result, Err(BatchError::Config(_))));
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_aborts_run() {
    let executor = ScriptedExecutor::new(vec![Script::Hang; 3]);
    let cancel = CancellationToken::new();

    let dispatcher = Dispatcher::new(config(2, Duration::from_secs(300)), payloads(3), executor)
        .unwrap()
        .with_cancellation(cancel.clone());
    let status = dispatcher.subscribe();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let start = Instant::now();
    let result = dispatcher.run().await;
    assert!(matches!(result, Err(BatchError::Cancelled)));
    assert_near(start.elapsed(), 1_000);

    let snapshot = status.borrow().clone();
    assert!(snapshot.finished);
    assert!(snapshot.workers.is_empty());
    assert_eq!(snapshot.counts.in_progress, 2);
}

#[tokio::test(start_paused = true)]
async fn test_initial_pool_is_bounded_by_job_count() {
    let executor = ScriptedExecutor::new(vec![Script::Complete(Duration::from_secs(2)); 3]);

    let dispatcher =
        Dispatcher::new(config(8, Duration::from_secs(10)), payloads(3), executor.clone()).unwrap();
    let report = dispatcher.run().await.unwrap();

    assert_eq!(report.workers_spawned, 3);
    assert_eq!(report.counts.completed, 3);
    assert_eq!(executor.peak(), 3);
    for (_, at) in executor.started() {
        assert_near(at, 0);
    }
}

#[tokio::test(start_paused = true)]
async fn test_status_snapshots_follow_the_run() {
    let executor = ScriptedExecutor::new(vec![Script::Complete(Duration::from_secs(3)); 2]);

    let dispatcher =
        Dispatcher::new(config(1, Duration::from_secs(10)), payloads(2), executor).unwrap();
    let mut status = dispatcher.subscribe();
    assert_eq!(status.borrow().counts.total, 2);

    let run = tokio::spawn(dispatcher.run());

    tokio::time::sleep(Duration::from_secs(1)).await;
    status.changed().await.unwrap();
    {
        let snapshot = status.borrow_and_update();
        assert_eq!(snapshot.counts.in_progress, 1);
        assert_eq!(snapshot.counts.pending, 1);
        assert_eq!(snapshot.workers.len(), 1);
        assert_eq!(snapshot.workers[0].current_job, Some(0));
        assert_eq!(snapshot.jobs[0].progress, 50);
        assert!(!snapshot.finished);
    }

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.counts.completed, 2);

    let snapshot = status.borrow().clone();
    assert!(snapshot.finished);
    assert_eq!(snapshot.counts.completed, 2);
    assert!(snapshot.jobs.iter().all(|j| j.status == JobStatus::Completed));
}
