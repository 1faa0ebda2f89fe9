//! Pipeline Integration Tests
//!
//! Lifecycle events, retry backoff, cancellation, timeouts and caching as
//! observed on the bus.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conductor::core::Subscription;
use conductor::{
    CachePolicy, CancellationToken, Dispatcher, EventKind, Executor, Job, JobContext, JobError, JobId,
    JobPayload, MemoryCache, Progress, RetryPolicy, SignalBus,
};
use serde_json::{json, Value};

struct Fetch;

impl JobPayload for Fetch {
    const KIND: &'static str = "test.fetch";
}

#[derive(Clone)]
enum Behavior {
    Succeed(Value),
    ReportThenSucceed,
    AlwaysFail,
    Sleep(Duration),
    Panic,
    PollCancellation,
}

struct Scripted {
    behavior: Behavior,
    calls: Arc<AtomicU32>,
    late_progress_accepted: Arc<AtomicBool>,
}

impl Scripted {
    fn new(behavior: Behavior) -> (Self, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = Self {
            behavior,
            calls: calls.clone(),
            late_progress_accepted: Arc::new(AtomicBool::new(false)),
        };
        (executor, calls)
    }
}

#[async_trait]
impl Executor<Fetch> for Scripted {
    async fn process(&self, _job: &Job<Fetch>, ctx: &JobContext) -> Result<Value, JobError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        match &self.behavior {
            Behavior::Succeed(data) => Ok(data.clone()),
            Behavior::ReportThenSucceed => {
                ctx.report_progress(Progress::from_steps(1, 2).with_message("halfway"));
                ctx.progress(0.25); // regression is allowed
                Ok(json!({ "done": true }))
            }
            Behavior::AlwaysFail => Err(JobError::failed("upstream unavailable")),
            Behavior::Sleep(duration) => {
                tokio::time::sleep(*duration).await;
                let accepted = ctx.progress(1.0);
                self.late_progress_accepted.store(accepted, Ordering::SeqCst);
                Ok(json!("late"))
            }
            Behavior::Panic => panic!("executor bug"),
            Behavior::PollCancellation => loop {
                ctx.throw_if_cancelled()?;
                tokio::time::sleep(Duration::from_millis(10)).await;
            },
        }
    }
}

async fn next_for(sub: &mut Subscription, id: &JobId) -> EventKind {
    loop {
        let event = sub.recv().await.expect("bus closed");
        if event.correlates_with(id) {
            return event.kind.clone();
        }
    }
}

async fn until_terminal(sub: &mut Subscription, id: &JobId) -> Vec<EventKind> {
    let collect = async {
        let mut kinds = Vec::new();
        loop {
            let kind = next_for(sub, id).await;
            let terminal = kind.is_terminal();
            kinds.push(kind);
            if terminal {
                return kinds;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(120), collect)
        .await
        .expect("job never reached a terminal event")
}

fn setup(behavior: Behavior) -> (Dispatcher, Subscription, Arc<AtomicU32>) {
    let bus = SignalBus::new();
    let sub = bus.subscribe().unwrap();
    let dispatcher = Dispatcher::new(bus);
    let (executor, calls) = Scripted::new(behavior);
    dispatcher.register(executor);
    (dispatcher, sub, calls)
}

#[tokio::test]
async fn test_success_lifecycle() {
    let (dispatcher, mut sub, calls) = setup(Behavior::ReportThenSucceed);

    let id = dispatcher.dispatch(Job::new(Fetch).with_id("fetch-1")).unwrap();
    assert_eq!(id.as_str(), "fetch-1");

    let kinds = until_terminal(&mut sub, &id).await;
    assert_eq!(kinds.len(), 4);
    assert_eq!(kinds[0], EventKind::Started);
    assert!(matches!(&kinds[1], EventKind::Progress(p) if p.value == 0.5 && p.step == Some(1)));
    assert!(matches!(&kinds[2], EventKind::Progress(p) if p.value == 0.25));
    assert_eq!(kinds[3], EventKind::Success { data: json!({ "done": true }) });
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_backoff_delays() {
    let (dispatcher, mut sub, calls) = setup(Behavior::AlwaysFail);
    let policy = RetryPolicy::exponential(3, Duration::from_millis(100));

    let start = tokio::time::Instant::now();
    let id = dispatcher.dispatch(Job::new(Fetch).with_retry(policy)).unwrap();
    let kinds = until_terminal(&mut sub, &id).await;

    let retries: Vec<(u32, u64)> = kinds
        .iter()
        .filter_map(|k| match k {
            EventKind::Retrying { attempt, delay_ms, .. } => Some((*attempt, *delay_ms)),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![(1, 100), (2, 200), (3, 400)]);

    assert_eq!(
        kinds.last(),
        Some(&EventKind::Failure {
            error: "upstream unavailable".to_string(),
            was_retried: true,
        })
    );
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert!(start.elapsed() >= Duration::from_millis(700));
}

#[tokio::test(start_paused = true)]
async fn test_failure_without_retry_policy() {
    let (dispatcher, mut sub, _) = setup(Behavior::AlwaysFail);

    let id = dispatcher.dispatch(Job::new(Fetch)).unwrap();
    let kinds = until_terminal(&mut sub, &id).await;

    assert_eq!(kinds.len(), 2);
    assert!(matches!(kinds[1], EventKind::Failure { was_retried: false, .. }));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_retry_wait() {
    let (dispatcher, mut sub, calls) = setup(Behavior::AlwaysFail);
    let token = CancellationToken::new();
    let policy = RetryPolicy::exponential(5, Duration::from_secs(10));

    let id = dispatcher
        .dispatch(Job::new(Fetch).with_retry(policy).with_cancellation(token.clone()))
        .unwrap();

    assert_eq!(next_for(&mut sub, &id).await, EventKind::Started);
    assert!(matches!(next_for(&mut sub, &id).await, EventKind::Retrying { attempt: 1, .. }));

    token.cancel_with_reason("screen closed");
    assert_eq!(
        next_for(&mut sub, &id).await,
        EventKind::Cancelled {
            reason: Some("screen closed".to_string())
        }
    );

    // Nothing follows the terminal event
    tokio::time::sleep(Duration::from_secs(60)).await;
    while let Some(event) = sub.try_recv() {
        assert!(!event.correlates_with(&id), "unexpected {:?}", event.kind);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_precancelled_job_never_runs() {
    let (dispatcher, mut sub, calls) = setup(Behavior::Succeed(json!(1)));
    let token = CancellationToken::new();
    token.cancel();

    let id = dispatcher.dispatch(Job::new(Fetch).with_cancellation(token)).unwrap();
    let kinds = until_terminal(&mut sub, &id).await;

    assert_eq!(kinds, vec![EventKind::Started, EventKind::Cancelled { reason: None }]);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_business_logic_observes_cancellation() {
    let (dispatcher, mut sub, _) = setup(Behavior::PollCancellation);
    let token = CancellationToken::new();

    let id = dispatcher
        .dispatch(Job::new(Fetch).with_cancellation(token.clone()))
        .unwrap();
    assert_eq!(next_for(&mut sub, &id).await, EventKind::Started);

    tokio::time::sleep(Duration::from_millis(35)).await;
    token.cancel_with_reason("user navigated away");

    let kind = next_for(&mut sub, &id).await;
    assert_eq!(
        kind,
        EventKind::Cancelled {
            reason: Some("user navigated away".to_string())
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_timeout_is_terminal_by_default() {
    let (dispatcher, mut sub, calls) = setup(Behavior::Sleep(Duration::from_secs(10)));
    let policy = RetryPolicy::exponential(3, Duration::from_millis(10));

    let id = dispatcher
        .dispatch(
            Job::new(Fetch)
                .with_timeout(Duration::from_millis(100))
                .with_retry(policy),
        )
        .unwrap();
    let kinds = until_terminal(&mut sub, &id).await;

    assert_eq!(kinds, vec![EventKind::Started, EventKind::Timeout { duration_ms: 100 }]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_on_timeout_consumes_attempts() {
    let (dispatcher, mut sub, calls) = setup(Behavior::Sleep(Duration::from_secs(10)));
    let policy = RetryPolicy::exponential(1, Duration::from_millis(10)).retry_on_timeout(true);

    let id = dispatcher
        .dispatch(
            Job::new(Fetch)
                .with_timeout(Duration::from_millis(100))
                .with_retry(policy),
        )
        .unwrap();
    let kinds = until_terminal(&mut sub, &id).await;

    assert_eq!(kinds.len(), 3);
    assert!(matches!(&kinds[1], EventKind::Retrying { attempt: 1, last_error, .. } if last_error.contains("100ms")));
    assert_eq!(kinds[2], EventKind::Timeout { duration_ms: 100 });
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_late_completion_is_discarded() {
    let bus = SignalBus::new();
    let mut sub = bus.subscribe().unwrap();
    let dispatcher = Dispatcher::new(bus);
    let (executor, _) = Scripted::new(Behavior::Sleep(Duration::from_millis(200)));
    let late_progress = executor.late_progress_accepted.clone();
    late_progress.store(true, Ordering::SeqCst);
    dispatcher.register(executor);

    let id = dispatcher
        .dispatch(Job::new(Fetch).with_timeout(Duration::from_millis(50)))
        .unwrap();
    let kinds = until_terminal(&mut sub, &id).await;
    assert_eq!(kinds.last(), Some(&EventKind::Timeout { duration_ms: 50 }));

    // Let the abandoned business call finish
    tokio::time::sleep(Duration::from_secs(1)).await;
    while let Some(event) = sub.try_recv() {
        assert!(!event.correlates_with(&id), "unexpected {:?}", event.kind);
    }
    assert!(!late_progress.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_panic_is_contained() {
    let (dispatcher, mut sub, _) = setup(Behavior::Panic);

    let id = dispatcher.dispatch(Job::new(Fetch)).unwrap();
    let kinds = until_terminal(&mut sub, &id).await;

    assert!(matches!(kinds.last(), Some(EventKind::Failure { was_retried: false, .. })));
}

#[tokio::test]
async fn test_cache_hit_short_circuits() {
    let bus = SignalBus::new();
    let mut sub = bus.subscribe().unwrap();
    let cache = Arc::new(MemoryCache::new(10));
    let dispatcher = Dispatcher::new(bus).with_cache(cache.clone());
    let (executor, calls) = Scripted::new(Behavior::Succeed(json!({ "rows": 3 })));
    dispatcher.register(executor);

    let first = dispatcher
        .dispatch(Job::new(Fetch).with_cache(CachePolicy::new("fetch:rows")))
        .unwrap();
    until_terminal(&mut sub, &first).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let second = dispatcher
        .dispatch(Job::new(Fetch).with_cache(CachePolicy::new("fetch:rows")))
        .unwrap();
    let kinds = until_terminal(&mut sub, &second).await;
    assert_eq!(
        kinds,
        vec![
            EventKind::Started,
            EventKind::CacheHit { data: json!({ "rows": 3 }) },
            EventKind::Success { data: json!({ "rows": 3 }) },
        ]
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let third = dispatcher
        .dispatch(Job::new(Fetch).with_cache(CachePolicy::new("fetch:rows").revalidate()))
        .unwrap();
    let kinds = until_terminal(&mut sub, &third).await;
    assert!(matches!(kinds[1], EventKind::CacheHit { .. }));
    assert!(matches!(kinds[2], EventKind::Success { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cached_result_respects_ttl() {
    let bus = SignalBus::new();
    let mut sub = bus.subscribe().unwrap();
    let dispatcher = Dispatcher::new(bus).with_cache(Arc::new(MemoryCache::unbounded()));
    let (executor, calls) = Scripted::new(Behavior::Succeed(json!("fresh")));
    dispatcher.register(executor);

    let policy = CachePolicy::new("fetch:ttl").with_ttl(Duration::from_millis(10));
    let id = dispatcher.dispatch(Job::new(Fetch).with_cache(policy.clone())).unwrap();
    until_terminal(&mut sub, &id).await;

    tokio::time::sleep(Duration::from_millis(15)).await;

    let id = dispatcher.dispatch(Job::new(Fetch).with_cache(policy)).unwrap();
    let kinds = until_terminal(&mut sub, &id).await;
    assert!(!kinds.iter().any(|k| matches!(k, EventKind::CacheHit { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
