//! Retry integration tests.
//!
//! Jobs run through the worker harness against the in-memory store and
//! queue, with failure suppression in front of a recording backend.

#![allow(clippy::unwrap_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use jobretry_queue::exception::classes::{RUNTIME_ERROR, STANDARD_ERROR};
use jobretry_queue::{
    AttemptStore, BackoffStrategy, ConfigError, ExceptionClass, ExceptionDelays, FailureBackend,
    FailureReport, Job, JobFailure, JobPayload, JobQueue, JobRegistry, JobRun, KeyExpiry,
    MemoryQueue, MemoryStore, RetryEngine, RetryError, RetryInspector, RetryOutcome, RetryPolicy,
    RetryResult, RetrySuppressionBackend, RetryWorker,
};
use serde_json::{Value, json};

static CUSTOM: ExceptionClass = ExceptionClass::new("CustomException", &STANDARD_ERROR);
static ANOTHER: ExceptionClass = ExceptionClass::new("AnotherCustomException", &STANDARD_ERROR);

enum Script {
    Succeed,
    AlwaysFail(&'static ExceptionClass),
    Sequence(Vec<&'static ExceptionClass>),
}

struct TestJob {
    name: &'static str,
    queue: &'static str,
    policy: Option<RetryPolicy>,
    script: Script,
    retry_queue: Option<&'static str>,
    runs: AtomicUsize,
}

impl TestJob {
    fn new(name: &'static str, policy: Option<RetryPolicy>, script: Script) -> Self {
        Self {
            name,
            queue: "testing",
            policy,
            script,
            retry_queue: None,
            runs: AtomicUsize::new(0),
        }
    }

    fn retryable(name: &'static str, policy: RetryPolicy, script: Script) -> Arc<Self> {
        Arc::new(Self::new(name, Some(policy), script))
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Job for TestJob {
    fn name(&self) -> &str {
        self.name
    }

    fn queue(&self) -> &str {
        self.queue
    }

    async fn perform(&self, _args: &[Value], _attempt: i64) -> Result<(), JobFailure> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst);
        let raise = match &self.script {
            Script::Succeed => None,
            Script::AlwaysFail(class) => Some(*class),
            Script::Sequence(classes) => classes.get(run).copied(),
        };
        match raise {
            Some(class) => Err(JobFailure::new(class, format!("run {run} failed"))),
            None => Ok(()),
        }
    }

    fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.policy.as_ref()
    }

    fn retry_args(&self, failure: &JobFailure, args: &[Value]) -> Vec<Value> {
        let mut args = args.to_vec();
        if self.retry_queue.is_some() {
            args.push(json!(failure.class().name()));
        }
        args
    }

    fn retry_queue(&self, _failure: &JobFailure, _args: &[Value]) -> Option<String> {
        self.retry_queue.map(str::to_string)
    }
}

#[derive(Default)]
struct RecordingBackend {
    reports: Mutex<Vec<FailureReport>>,
}

impl RecordingBackend {
    fn count(&self) -> usize {
        self.reports.lock().unwrap().len()
    }
}

#[async_trait]
impl FailureBackend for RecordingBackend {
    async fn save(&self, report: &FailureReport) -> RetryResult<()> {
        self.reports.lock().unwrap().push(report.clone());
        Ok(())
    }
}

struct Harness {
    store: MemoryStore,
    queue: MemoryQueue,
    worker: RetryWorker,
    downstream: Arc<RecordingBackend>,
    inspector: RetryInspector,
}

impl Harness {
    fn new(jobs: Vec<Arc<TestJob>>) -> Self {
        let registry = jobs
            .into_iter()
            .fold(JobRegistry::new(), |registry, job| registry.with(job));
        let store = MemoryStore::new();
        let queue = MemoryQueue::new(registry.clone());
        let downstream = Arc::new(RecordingBackend::default());
        let suppression = RetrySuppressionBackend::new(Arc::new(store.clone()), registry.clone())
            .with_backend(downstream.clone());
        let engine = RetryEngine::new(Arc::new(store.clone()), Arc::new(queue.clone()));
        let worker = RetryWorker::new(
            "test-host:1:testing",
            vec!["testing".to_string(), "alternate".to_string()],
            registry.clone(),
            engine,
            Arc::new(queue.clone()),
            Arc::new(suppression),
        );
        let inspector = RetryInspector::new(Arc::new(store.clone()), Arc::new(queue.clone()), registry);
        Self {
            store,
            queue,
            worker,
            downstream,
            inspector,
        }
    }

    /// Run one job, promoting scheduled retries first.
    async fn step(&self) -> JobRun {
        self.queue.promote_all().await;
        self.worker.perform_next().await.unwrap()
    }

    /// Run jobs until the queue drains or `max` runs happened.
    async fn drain(&self, max: usize) -> Vec<JobRun> {
        let mut runs = Vec::new();
        while runs.len() < max {
            match self.step().await {
                JobRun::Idle => break,
                run => runs.push(run),
            }
        }
        runs
    }
}

fn retrying_delay(run: &JobRun) -> Option<i64> {
    match run {
        JobRun::Failed(Some(RetryOutcome::Retrying { delay, .. })) => Some(*delay),
        _ => None,
    }
}

#[tokio::test]
async fn test_positive_limit_runs_at_most_limit_plus_one() {
    let job = TestJob::retryable(
        "LimitThreeJob",
        RetryPolicy::builder().retry_limit(3).build().unwrap(),
        Script::AlwaysFail(&RUNTIME_ERROR),
    );
    let harness = Harness::new(vec![job.clone()]);
    harness.queue.enqueue("LimitThreeJob", vec![json!("x")]).await.unwrap();

    let runs = harness.drain(20).await;
    assert_eq!(job.runs(), 4);
    assert_eq!(runs.last(), Some(&JobRun::Failed(Some(RetryOutcome::GaveUp { attempt: 3 }))));
    assert_eq!(harness.downstream.count(), 1);
    assert!(harness.store.is_empty().await);
}

#[tokio::test]
async fn test_zero_limit_never_retries() {
    let job = TestJob::retryable(
        "NoRetryJob",
        RetryPolicy::builder().retry_limit(0).build().unwrap(),
        Script::AlwaysFail(&CUSTOM),
    );
    let harness = Harness::new(vec![job.clone()]);
    harness.queue.enqueue("NoRetryJob", vec![]).await.unwrap();

    let runs = harness.drain(20).await;
    assert_eq!(runs, vec![JobRun::Failed(Some(RetryOutcome::GaveUp { attempt: 0 }))]);
    assert_eq!(job.runs(), 1);
    assert_eq!(harness.downstream.count(), 1);
}

#[tokio::test]
async fn test_negative_limit_retries_forever() {
    let job = TestJob::retryable(
        "ForeverJob",
        RetryPolicy::builder().retry_limit(-1).build().unwrap(),
        Script::AlwaysFail(&RUNTIME_ERROR),
    );
    let harness = Harness::new(vec![job.clone()]);
    harness.queue.enqueue("ForeverJob", vec![]).await.unwrap();

    let runs = harness.drain(25).await;
    assert_eq!(runs.len(), 25);
    assert!(runs.iter().all(|run| retrying_delay(run).is_some()));
    assert_eq!(harness.store.get("resque-retry:ForeverJob").await.unwrap().as_deref(), Some("24"));
    assert_eq!(harness.downstream.count(), 0);
}

#[tokio::test]
async fn test_failures_suppressed_while_retry_pending() {
    let job = TestJob::retryable(
        "HourlyRetryJob",
        RetryPolicy::builder().retry_limit(3).retry_delay_seconds(3600).build().unwrap(),
        Script::AlwaysFail(&RUNTIME_ERROR),
    );
    let harness = Harness::new(vec![job]);
    harness.queue.enqueue("HourlyRetryJob", vec![json!("foo")]).await.unwrap();
    let failure_key = "failure-resque-retry:HourlyRetryJob:foo";

    for _ in 0..3 {
        let run = harness.step().await;
        assert_eq!(retrying_delay(&run), Some(3600));
        assert_eq!(harness.downstream.count(), 0);
        assert_eq!(harness.store.ttl(failure_key).await.unwrap(), Some(7200));
        assert_eq!(harness.queue.delayed().await.len(), 1);
    }

    let snapshot = harness
        .inspector
        .failure_for_payload(&JobPayload::new("HourlyRetryJob", vec![json!("foo")], "testing"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.exception, "RuntimeError");
    assert_eq!(snapshot.worker, "test-host:1:testing");

    let run = harness.step().await;
    assert_eq!(run, JobRun::Failed(Some(RetryOutcome::GaveUp { attempt: 3 })));
    assert_eq!(harness.downstream.count(), 1);
    assert!(!harness.store.exists(failure_key).await.unwrap());
    assert!(harness.store.is_empty().await);
}

#[tokio::test]
async fn test_ignored_exceptions_do_not_count() {
    let job = TestJob::retryable(
        "IgnoreExceptionsJob",
        RetryPolicy::builder()
            .retry_limit(3)
            .retry_exceptions(&[&CUSTOM, &ANOTHER])
            .ignore_exceptions(&[&CUSTOM])
            .build()
            .unwrap(),
        Script::Sequence(vec![&ANOTHER, &ANOTHER, &CUSTOM, &CUSTOM]),
    );
    let harness = Harness::new(vec![job]);
    harness.queue.enqueue("IgnoreExceptionsJob", vec![]).await.unwrap();
    let retry_key = "resque-retry:IgnoreExceptionsJob";

    for _ in 0..3 {
        harness.step().await;
    }
    assert_eq!(harness.store.get(retry_key).await.unwrap().as_deref(), Some("1"));

    // ignored again: incremented before the run, decremented after
    harness.step().await;
    assert_eq!(harness.store.get(retry_key).await.unwrap().as_deref(), Some("1"));

    assert_eq!(harness.step().await, JobRun::Succeeded);
    assert!(harness.store.is_empty().await);
}

#[tokio::test]
async fn test_conflicting_exception_lists_fail_before_enqueue() {
    let parent = RetryPolicy::builder().fatal_exceptions(&[&ANOTHER]).build().unwrap();
    let result = RetryPolicy::extend(&parent).retry_exceptions(&[&CUSTOM]).build();
    assert_eq!(result.unwrap_err(), ConfigError::AmbiguousExceptionFilter);
}

#[tokio::test]
async fn test_callbacks_fire_in_order() {
    let log = Arc::new(Mutex::new(Vec::<String>::new()));
    let recorder = |label: &'static str| {
        let log = Arc::clone(&log);
        move |failure: &JobFailure, _args: &[Value]| -> anyhow::Result<()> {
            log.lock().unwrap().push(format!("{label}:{}", failure.class()));
            Ok(())
        }
    };
    let policy = RetryPolicy::builder()
        .retry_limit(1)
        .on_try_again(recorder("try_again_1"))
        .on_try_again(recorder("try_again_2"))
        .on_try_again(recorder("try_again_3"))
        .on_give_up(recorder("give_up_1"))
        .on_give_up(recorder("give_up_2"))
        .build()
        .unwrap();
    let harness = Harness::new(vec![TestJob::retryable(
        "CallbackJob",
        policy,
        Script::AlwaysFail(&CUSTOM),
    )]);
    harness.queue.enqueue("CallbackJob", vec![]).await.unwrap();

    harness.step().await;
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "try_again_1:CustomException",
            "try_again_2:CustomException",
            "try_again_3:CustomException",
        ]
    );

    harness.step().await;
    assert_eq!(
        log.lock().unwrap()[3..],
        ["give_up_1:CustomException", "give_up_2:CustomException"]
    );
}

#[tokio::test]
async fn test_callback_error_propagates() {
    let policy = RetryPolicy::builder()
        .retry_limit(2)
        .on_try_again(|_, _| anyhow::bail!("audit log unavailable"))
        .build()
        .unwrap();
    let harness = Harness::new(vec![TestJob::retryable("AuditedJob", policy, Script::AlwaysFail(&CUSTOM))]);
    harness.queue.enqueue("AuditedJob", vec![]).await.unwrap();

    let err = harness.worker.perform_next().await.unwrap_err();
    assert!(matches!(err, RetryError::Callback(_)));
    assert!(harness.queue.pending("testing").await.is_empty());
    // no retry follows, so the job's failure is reported and its state cleared
    assert_eq!(harness.downstream.count(), 1);
    assert_eq!(harness.downstream.reports.lock().unwrap()[0].failure.class(), &CUSTOM);
    assert!(harness.store.is_empty().await);
}

#[tokio::test]
async fn test_jittered_retry_keeps_snapshot_for_twice_the_scheduled_delay() {
    let strategy = BackoffStrategy::new(vec![60])
        .unwrap()
        .with_multiplicands(0.5, 3.0)
        .unwrap();
    let policy = RetryPolicy::builder()
        .backoff(strategy)
        .retry_limit(-1)
        .build()
        .unwrap();
    let harness = Harness::new(vec![TestJob::retryable(
        "JitteredJob",
        policy,
        Script::AlwaysFail(&RUNTIME_ERROR),
    )]);
    harness.queue.enqueue("JitteredJob", vec![]).await.unwrap();

    for _ in 0..20 {
        let delay = retrying_delay(&harness.step().await).unwrap();
        assert!((29..=180).contains(&delay));
        assert_eq!(
            harness.store.ttl("failure-resque-retry:JitteredJob").await.unwrap(),
            Some(2 * delay)
        );
    }
    assert_eq!(harness.downstream.count(), 0);
}

#[tokio::test]
async fn test_retry_delegated_to_other_job_type() {
    let delegate = Arc::new(TestJob {
        queue: "alternate",
        ..TestJob::new("FallbackJob", None, Script::Succeed)
    });
    let job = TestJob::retryable(
        "PrimaryJob",
        RetryPolicy::builder()
            .retry_limit(2)
            .retry_job_delegate("FallbackJob")
            .build()
            .unwrap(),
        Script::AlwaysFail(&RUNTIME_ERROR),
    );
    let harness = Harness::new(vec![job, delegate.clone()]);
    harness.queue.enqueue("PrimaryJob", vec![json!(7)]).await.unwrap();

    let run = harness.step().await;
    let JobRun::Failed(Some(RetryOutcome::Retrying { job_type, queue, .. })) = run else {
        panic!("expected a retry, got {run:?}");
    };
    assert_eq!((job_type.as_str(), queue.as_str()), ("FallbackJob", "alternate"));
    assert_eq!(
        harness.queue.pending("alternate").await,
        vec![JobPayload::new("FallbackJob", vec![json!(7)], "alternate")]
    );
    assert!(!harness.store.exists("resque-retry:PrimaryJob:7").await.unwrap());
    // the delegate's own run happens without any retry state
    assert_eq!(harness.step().await, JobRun::Succeeded);
    assert_eq!(delegate.runs(), 1);
    // no retry key left, so the primary's failure went downstream
    assert_eq!(harness.downstream.count(), 1);
}

#[tokio::test]
async fn test_dynamic_retry_queue_and_args() {
    let job = Arc::new(TestJob {
        retry_queue: Some("alternate"),
        ..TestJob::new(
            "RoutedJob",
            Some(RetryPolicy::builder().retry_limit(1).build().unwrap()),
            Script::Sequence(vec![&CUSTOM]),
        )
    });
    let harness = Harness::new(vec![job.clone()]);
    harness.queue.enqueue("RoutedJob", vec![json!("a")]).await.unwrap();

    harness.step().await;
    assert_eq!(
        harness.queue.pending("alternate").await,
        vec![JobPayload::new("RoutedJob", vec![json!("a"), json!("CustomException")], "alternate")]
    );
    assert_eq!(harness.step().await, JobRun::Succeeded);
    assert_eq!(job.runs(), 2);
}

#[tokio::test]
async fn test_per_exception_delays() {
    let policy = RetryPolicy::builder()
        .exception_delays(
            ExceptionDelays::new()
                .fixed(&CUSTOM, 7)
                .per_attempt(&RUNTIME_ERROR, vec![5, 10, 15]),
        )
        .build()
        .unwrap();
    assert_eq!(policy.retry_limit(), 3);

    let harness = Harness::new(vec![
        TestJob::retryable("SequencedDelayJob", policy.clone(), Script::AlwaysFail(&RUNTIME_ERROR)),
        TestJob::retryable("FixedDelayJob", policy.clone(), Script::Sequence(vec![&CUSTOM])),
        TestJob::retryable("FatalDelayJob", policy, Script::AlwaysFail(&ANOTHER)),
    ]);

    harness.queue.enqueue("SequencedDelayJob", vec![]).await.unwrap();
    let runs = harness.drain(10).await;
    let delays: Vec<_> = runs.iter().filter_map(retrying_delay).collect();
    assert_eq!(delays, vec![5, 10, 15]);
    assert_eq!(runs.len(), 4);

    harness.queue.enqueue("FixedDelayJob", vec![]).await.unwrap();
    assert_eq!(retrying_delay(&harness.step().await), Some(7));
    assert_eq!(harness.step().await, JobRun::Succeeded);

    // not in the table, so not retryable
    harness.queue.enqueue("FatalDelayJob", vec![]).await.unwrap();
    assert_eq!(
        harness.step().await,
        JobRun::Failed(Some(RetryOutcome::GaveUp { attempt: 0 }))
    );
}

#[tokio::test]
async fn test_exponential_backoff_schedule() {
    let policy = RetryPolicy::builder()
        .backoff(BackoffStrategy::new(vec![0, 60, 600]).unwrap())
        .build()
        .unwrap();
    let harness = Harness::new(vec![TestJob::retryable(
        "BackoffJob",
        policy,
        Script::AlwaysFail(&RUNTIME_ERROR),
    )]);
    harness.queue.enqueue("BackoffJob", vec![]).await.unwrap();

    let runs = harness.drain(10).await;
    let delays: Vec<_> = runs.iter().filter_map(retrying_delay).collect();
    assert_eq!(delays, vec![0, 60, 600]);
    assert_eq!(runs.last(), Some(&JobRun::Failed(Some(RetryOutcome::GaveUp { attempt: 3 }))));
}

#[tokio::test]
async fn test_criteria_check_rescues_fatal_exception() {
    let policy = RetryPolicy::builder()
        .retry_limit(2)
        .retry_exceptions(&[&CUSTOM])
        .criteria_check(|ctx| Ok(ctx.args.first() == Some(&json!("retry-anyway"))))
        .build()
        .unwrap();
    let harness = Harness::new(vec![TestJob::retryable(
        "CheckedJob",
        policy,
        Script::Sequence(vec![&ANOTHER]),
    )]);

    harness.queue.enqueue("CheckedJob", vec![json!("retry-anyway")]).await.unwrap();
    assert!(retrying_delay(&harness.step().await).is_some());
    assert_eq!(harness.step().await, JobRun::Succeeded);

    let harness = Harness::new(vec![TestJob::retryable(
        "CheckedJob",
        RetryPolicy::builder()
            .retry_limit(2)
            .retry_exceptions(&[&CUSTOM])
            .criteria_check(|ctx| Ok(ctx.args.first() == Some(&json!("retry-anyway"))))
            .build()
            .unwrap(),
        Script::Sequence(vec![&ANOTHER]),
    )]);
    harness.queue.enqueue("CheckedJob", vec![json!("plain")]).await.unwrap();
    assert_eq!(
        harness.step().await,
        JobRun::Failed(Some(RetryOutcome::GaveUp { attempt: 0 }))
    );
}

#[tokio::test]
async fn test_retry_key_expiry_extends_past_delay() {
    let policy = RetryPolicy::builder()
        .retry_limit(2)
        .retry_delay_seconds(30)
        .expire_retry_key_after(KeyExpiry::Fixed(3600))
        .build()
        .unwrap();
    let harness = Harness::new(vec![TestJob::retryable("ExpiringJob", policy, Script::AlwaysFail(&CUSTOM))]);
    harness.queue.enqueue("ExpiringJob", vec![]).await.unwrap();

    harness.step().await;
    assert_eq!(harness.store.ttl("resque-retry:ExpiringJob").await.unwrap(), Some(3630));
}

#[tokio::test]
async fn test_non_retrying_job_failures_go_downstream() {
    let job = Arc::new(TestJob::new("PlainJob", None, Script::AlwaysFail(&RUNTIME_ERROR)));
    let harness = Harness::new(vec![job]);
    harness.queue.enqueue("PlainJob", vec![json!(1)]).await.unwrap();

    assert_eq!(harness.step().await, JobRun::Failed(None));
    assert_eq!(harness.downstream.count(), 1);
    assert!(harness.store.is_empty().await);
}

#[tokio::test]
async fn test_cancel_pending_retry() {
    let policy = RetryPolicy::builder().retry_limit(5).retry_delay_seconds(600).build().unwrap();
    let harness = Harness::new(vec![TestJob::retryable("CancelledJob", policy, Script::AlwaysFail(&CUSTOM))]);
    let payload = JobPayload::new("CancelledJob", vec![json!("order-1")], "testing");
    harness.queue.enqueue("CancelledJob", payload.args.clone()).await.unwrap();

    harness.step().await;
    assert_eq!(harness.inspector.retry_attempts_for(&payload).await.unwrap(), Some(0));
    assert!(harness.inspector.failure_for_payload(&payload).await.unwrap().is_some());

    assert_eq!(harness.inspector.cancel(&payload).await.unwrap(), 1);
    assert_eq!(harness.inspector.retry_attempts_for(&payload).await.unwrap(), None);
    assert!(harness.store.is_empty().await);
    assert_eq!(harness.step().await, JobRun::Idle);
}

#[tokio::test]
async fn test_inline_mode_bypasses_retries() {
    let job = TestJob::retryable(
        "InlineJob",
        RetryPolicy::builder().retry_limit(3).build().unwrap(),
        Script::AlwaysFail(&CUSTOM),
    );
    let registry = JobRegistry::new().with(job.clone());
    let store = MemoryStore::new();
    let queue = MemoryQueue::new(registry.clone()).inline(true);
    let engine = RetryEngine::new(Arc::new(store.clone()), Arc::new(queue.clone()));
    let worker = RetryWorker::new(
        "inline",
        vec!["testing".to_string()],
        registry,
        engine,
        Arc::new(queue.clone()),
        Arc::new(RecordingBackend::default()),
    );

    let err = worker
        .perform(&JobPayload::new("InlineJob", vec![], "testing"))
        .await
        .unwrap_err();
    assert!(matches!(err, RetryError::Job(failure) if failure.is_a(&CUSTOM)));
    assert_eq!(job.runs(), 1);
    assert!(store.is_empty().await);
    assert!(queue.pending("testing").await.is_empty());
}
