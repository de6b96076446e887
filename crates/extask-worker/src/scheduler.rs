//! The poll loop: claims tasks while there is capacity and dispatches them.

use std::sync::Arc;
use std::time::Duration;

use extask_client::{FetchRequest, LeaseClient, LeaseError};
use extask_core::{TaskLease, WorkerId, WorkerState};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::WorkerConfig;
use crate::error::{ConfigError, WorkerError};
use crate::executor::TaskExecutor;
use crate::handler::HandlerRegistry;
use crate::metrics::{MetricsSnapshot, WorkerMetrics};
use crate::reporter::OutcomeReporter;

/// Counters of a finished poll loop.
pub type RunSummary = MetricsSnapshot;

/// One worker identity polling one topic set.
pub struct PollLoop {
    config: Arc<WorkerConfig>,
    client: Arc<dyn LeaseClient>,
    executor: Arc<TaskExecutor>,
    reporter: Arc<OutcomeReporter>,
    metrics: Arc<WorkerMetrics>,
    state: watch::Sender<WorkerState>,
}

/// Keeps the in-flight gauge honest even when a dispatch task is aborted.
struct InFlightGuard(Arc<WorkerMetrics>);

impl InFlightGuard {
    fn new(metrics: Arc<WorkerMetrics>) -> Self {
        metrics.task_started();
        Self(metrics)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.task_finished();
    }
}

impl PollLoop {
    /// Validate `config` and wire the loop's components.
    pub fn new(
        config: WorkerConfig,
        client: Arc<dyn LeaseClient>,
        handlers: Arc<HandlerRegistry>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        handlers.ensure_covers(&config.topics)?;

        let metrics = Arc::new(WorkerMetrics::new());
        let executor = Arc::new(TaskExecutor::new(
            handlers,
            config.report_margin,
            config.shutdown_grace,
        ));
        let reporter = Arc::new(
            OutcomeReporter::new(client.clone(), config.retry.clone(), metrics.clone())
                .with_attempts(config.report_attempts, config.report_retry_delay),
        );
        let (state, _) = watch::channel(WorkerState::Idle);

        Ok(Self {
            config: Arc::new(config),
            client,
            executor,
            reporter,
            metrics,
            state,
        })
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.config.worker_id
    }

    pub fn metrics(&self) -> Arc<WorkerMetrics> {
        self.metrics.clone()
    }

    /// Current loop state.
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Watch state changes from outside the loop.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: WorkerState) {
        self.state.send_if_modified(|current| match current.transition(next) {
            Ok(state) => {
                *current = state;
                true
            }
            Err(err) => {
                debug!(error = %err, "Ignoring state change");
                false
            }
        });
    }

    /// Poll until `shutdown` is cancelled.
    ///
    /// Returns once every dispatched task has been reported (or given up on).
    /// Fails only when the broker request itself is malformed, which no amount
    /// of retrying can fix.
    pub async fn run(self, shutdown: CancellationToken) -> Result<RunSummary, WorkerError> {
        let config = self.config.clone();
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency));
        let mut inflight: JoinSet<()> = JoinSet::new();
        let mut empty_streak: u32 = 0;
        let mut error_streak: u32 = 0;

        info!(
            worker_id = %config.worker_id,
            topics = ?config.topics.iter().map(|t| t.as_str()).collect::<Vec<_>>(),
            max_concurrency = config.max_concurrency,
            lock_duration_ms = config.lock_duration.as_millis() as u64,
            "Poll loop started"
        );

        let result = loop {
            while let Some(joined) = inflight.try_join_next() {
                log_join(joined);
            }

            let first = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Ok(()),
                },
            };
            let mut permits = vec![first];
            while permits.len() < config.max_tasks as usize {
                match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permits.push(permit),
                    Err(_) => break,
                }
            }

            let request = FetchRequest {
                worker_id: config.worker_id.clone(),
                topics: config.topics.clone(),
                lock_duration: config.lock_duration,
                max_tasks: permits.len() as u32,
            };

            self.set_state(WorkerState::Polling);
            self.metrics.record_poll();
            let fetched = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                fetched = self.client.fetch_and_lock(&request) => fetched,
            };

            match fetched {
                Ok(leases) if leases.is_empty() => {
                    self.metrics.record_empty_poll();
                    error_streak = 0;
                    empty_streak = empty_streak.saturating_add(1);
                    self.set_state(WorkerState::Idle);
                    drop(permits);

                    let delay = config.idle_backoff.delay(empty_streak);
                    debug!(delay_ms = delay.as_millis() as u64, "No tasks available");
                    if !sleep_or_cancel(delay, &shutdown).await {
                        break Ok(());
                    }
                }
                Ok(leases) => {
                    empty_streak = 0;
                    error_streak = 0;
                    self.metrics.record_leased(leases.len());
                    self.set_state(WorkerState::Dispatching);
                    debug!(count = leases.len(), "Leased tasks");

                    for lease in leases {
                        let permit = match permits.pop() {
                            Some(permit) => permit,
                            None => {
                                // The broker handed out more than requested.
                                warn!(task_id = %lease.task_id, "Unrequested lease, waiting for capacity");
                                match semaphore.clone().acquire_owned().await {
                                    Ok(permit) => permit,
                                    Err(_) => break,
                                }
                            }
                        };
                        self.dispatch(&mut inflight, lease, permit, &shutdown);
                    }
                    drop(permits);
                    self.set_state(WorkerState::Idle);
                }
                Err(LeaseError::InvalidRequest(reason)) => {
                    error!(
                        worker_id = %config.worker_id,
                        error = %reason,
                        "Fetch-and-lock request is invalid; stopping poll loop"
                    );
                    break Err(WorkerError::InvalidRequest(reason));
                }
                Err(err) => {
                    self.metrics.record_fetch_error();
                    empty_streak = 0;
                    error_streak = error_streak.saturating_add(1);
                    self.set_state(WorkerState::Idle);
                    drop(permits);

                    let delay = config.error_backoff.delay(error_streak);
                    warn!(
                        worker_id = %config.worker_id,
                        error = %err,
                        attempt = error_streak,
                        delay_ms = delay.as_millis() as u64,
                        "Fetch-and-lock failed, backing off"
                    );
                    if !sleep_or_cancel(delay, &shutdown).await {
                        break Ok(());
                    }
                }
            }
        };

        if !inflight.is_empty() {
            info!(in_flight = inflight.len(), "Waiting for in-flight tasks");
        }
        while let Some(joined) = inflight.join_next().await {
            log_join(joined);
        }
        self.set_state(WorkerState::Stopped);

        let summary = self.metrics.snapshot();
        info!(
            worker_id = %config.worker_id,
            polls = summary.polls,
            completed = summary.completed,
            failures_reported = summary.failures_reported,
            report_failures = summary.report_failures,
            "Poll loop stopped"
        );
        result.map(|()| summary)
    }

    fn dispatch(
        &self,
        inflight: &mut JoinSet<()>,
        lease: TaskLease,
        permit: OwnedSemaphorePermit,
        shutdown: &CancellationToken,
    ) {
        let executor = self.executor.clone();
        let reporter = self.reporter.clone();
        let metrics = self.metrics.clone();
        let shutdown = shutdown.clone();
        let span = info_span!(
            "task",
            task_id = %lease.task_id,
            topic = %lease.topic,
            worker_id = %lease.worker_id
        );

        inflight.spawn(
            async move {
                let _permit = permit;
                let _guard = InFlightGuard::new(metrics);
                let outcome = executor.run(&lease, &shutdown).await;
                debug!(outcome = %outcome.kind(), "Handler finished");
                reporter.report(&lease, outcome).await;
            }
            .instrument(span),
        );
    }
}

/// Returns false if cancelled before `delay` elapsed.
async fn sleep_or_cancel(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown.cancelled() => false,
    }
}

fn log_join(joined: Result<(), JoinError>) {
    if let Err(err) = joined {
        if err.is_panic() {
            error!(error = %err, "Dispatch task panicked");
        } else {
            warn!(error = %err, "Dispatch task cancelled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use extask_core::{BackoffPolicy, TaskOutcome, Topic};
    use serde_json::{json, Map};

    use crate::handler::{TaskContext, TaskHandler};
    use crate::testing::{wait_for, FakeBroker};

    const TOPIC: &str = "demo-topic";

    struct Succeed;

    #[async_trait]
    impl TaskHandler for Succeed {
        async fn handle(&self, _ctx: &TaskContext) -> TaskOutcome {
            TaskOutcome::success("ok")
        }
    }

    /// Panics for the task whose `explode` variable is set.
    struct Selective;

    #[async_trait]
    impl TaskHandler for Selective {
        async fn handle(&self, ctx: &TaskContext) -> TaskOutcome {
            if ctx.variable("explode") == Some(&json!(true)) {
                panic!("unhandled error in handler");
            }
            TaskOutcome::success("ok")
        }
    }

    struct Slow(Duration);

    #[async_trait]
    impl TaskHandler for Slow {
        async fn handle(&self, _ctx: &TaskContext) -> TaskOutcome {
            tokio::time::sleep(self.0).await;
            TaskOutcome::success("late")
        }
    }

    /// Records the highest number of simultaneous invocations.
    #[derive(Default)]
    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl TaskHandler for Arc<Gauge> {
        async fn handle(&self, _ctx: &TaskContext) -> TaskOutcome {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            TaskOutcome::success("ok")
        }
    }

    fn config(worker: &str) -> WorkerConfig {
        let mut config = WorkerConfig::new(WorkerId::new(worker), vec![Topic::new(TOPIC)])
            .with_lock_duration(Duration::from_secs(2))
            .with_report_margin(Duration::from_millis(200))
            .with_limits(4, 4)
            .with_backoff(
                BackoffPolicy::fixed(Duration::from_millis(20)),
                BackoffPolicy::fixed(Duration::from_millis(40)),
            );
        config.shutdown_grace = Duration::from_millis(100);
        config.report_retry_delay = Duration::from_millis(10);
        config
    }

    fn poll_loop(
        config: WorkerConfig,
        broker: &Arc<FakeBroker>,
        handler: Arc<dyn TaskHandler>,
    ) -> PollLoop {
        let handlers = HandlerRegistry::new().with_fallback(handler);
        PollLoop::new(config, broker.clone(), Arc::new(handlers)).unwrap()
    }

    fn spawn(
        poll_loop: PollLoop,
    ) -> (
        CancellationToken,
        tokio::task::JoinHandle<Result<RunSummary, WorkerError>>,
    ) {
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(poll_loop.run(shutdown.clone()));
        (shutdown, handle)
    }

    #[tokio::test]
    async fn test_successful_task_completed_exactly_once() {
        let broker = Arc::new(FakeBroker::new());
        broker.push_task("t1", TOPIC);
        let (shutdown, handle) = spawn(poll_loop(config("w1"), &broker, Arc::new(Succeed)));

        assert!(wait_for(Duration::from_secs(2), || broker.completions().len() == 1).await);
        // Give the loop a few more polls to prove nothing is reported twice.
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        let summary = handle.await.unwrap().unwrap();

        let completions = broker.completions();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].task_id.as_str(), "t1");
        assert_eq!(completions[0].result, json!("ok"));
        assert!(broker.failures().is_empty());
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.tasks_leased, 1);
        assert_eq!(summary.in_flight, 0);
    }

    #[tokio::test]
    async fn test_handler_panic_reported_as_failure() {
        let broker = Arc::new(FakeBroker::new());
        let mut vars = Map::new();
        vars.insert("explode".into(), json!(true));
        broker.push_task_with("t1", TOPIC, vars);
        let (shutdown, handle) = spawn(poll_loop(config("w1"), &broker, Arc::new(Selective)));

        assert!(wait_for(Duration::from_secs(2), || broker.failures().len() == 1).await);
        shutdown.cancel();
        let summary = handle.await.unwrap().unwrap();

        let failures = broker.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].task_id.as_str(), "t1");
        assert_eq!(failures[0].retries, 0);
        assert!(failures[0].retry_timeout > Duration::ZERO);
        assert!(!failures[0].error_message.is_empty());
        assert!(broker.completions().is_empty());
        assert_eq!(summary.technical_errors, 1);
    }

    #[tokio::test]
    async fn test_lost_lease_logged_not_retried() {
        let broker = Arc::new(FakeBroker::new());
        broker.push_task("t1", TOPIC);
        broker.fail_next_complete(LeaseError::LeaseLost {
            task_id: extask_core::TaskId::new("t1"),
            reason: "external task not found".into(),
        });
        let (shutdown, handle) = spawn(poll_loop(config("w1"), &broker, Arc::new(Succeed)));

        assert!(wait_for(Duration::from_secs(2), || broker.complete_calls() == 1).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        let summary = handle.await.unwrap().unwrap();

        assert_eq!(broker.complete_calls(), 1);
        assert_eq!(broker.failure_calls(), 0);
        assert_eq!(summary.lease_lost, 1);
        assert_eq!(summary.report_failures, 0);
    }

    #[tokio::test]
    async fn test_two_workers_never_share_a_task() {
        let broker = Arc::new(FakeBroker::new());
        for i in 0..20 {
            broker.push_task(&format!("t{i}"), TOPIC);
        }
        let (stop_a, a) = spawn(poll_loop(config("w-a"), &broker, Arc::new(Succeed)));
        let (stop_b, b) = spawn(poll_loop(config("w-b"), &broker, Arc::new(Succeed)));

        assert!(wait_for(Duration::from_secs(5), || broker.completions().len() == 20).await);
        stop_a.cancel();
        stop_b.cancel();
        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();

        let mut ids: Vec<String> = broker
            .completions()
            .iter()
            .map(|c| c.task_id.as_str().to_string())
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 20);
        assert_eq!(a.completed + b.completed, 20);
        assert_eq!(a.lease_lost + b.lease_lost, 0);
    }

    #[tokio::test]
    async fn test_empty_polls_use_idle_backoff() {
        let broker = Arc::new(FakeBroker::new());
        let mut config = config("w1");
        config.idle_backoff = BackoffPolicy::fixed(Duration::from_millis(50));
        config.error_backoff = BackoffPolicy::fixed(Duration::from_millis(50));
        let (shutdown, handle) = spawn(poll_loop(config, &broker, Arc::new(Succeed)));

        tokio::time::sleep(Duration::from_millis(230)).await;
        shutdown.cancel();
        let summary = handle.await.unwrap().unwrap();

        assert!(summary.empty_polls >= 2);
        assert!(summary.polls <= 6, "polled {} times", summary.polls);
        assert_eq!(summary.fetch_errors, 0);
    }

    #[tokio::test]
    async fn test_fetch_errors_back_off_and_recover() {
        let broker = Arc::new(FakeBroker::new());
        broker.fail_next_fetch(LeaseError::BrokerUnreachable("connection refused".into()));
        broker.fail_next_fetch(LeaseError::BrokerError {
            status: 503,
            body: "unavailable".into(),
        });
        broker.push_task("t1", TOPIC);
        let (shutdown, handle) = spawn(poll_loop(config("w1"), &broker, Arc::new(Succeed)));

        assert!(wait_for(Duration::from_secs(2), || broker.completions().len() == 1).await);
        shutdown.cancel();
        let summary = handle.await.unwrap().unwrap();

        assert_eq!(summary.fetch_errors, 2);
        assert_eq!(summary.completed, 1);
    }

    #[tokio::test]
    async fn test_invalid_request_stops_loop() {
        let broker = Arc::new(FakeBroker::new());
        broker.fail_next_fetch(LeaseError::InvalidRequest("bad topic".into()));
        let poll_loop = poll_loop(config("w1"), &broker, Arc::new(Succeed));
        let state = poll_loop.subscribe();

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            poll_loop.run(CancellationToken::new()),
        )
        .await
        .unwrap();

        assert!(matches!(result, Err(WorkerError::InvalidRequest(_))));
        assert_eq!(*state.borrow(), WorkerState::Stopped);
        assert_eq!(broker.fetch_calls(), 1);
    }

    #[tokio::test]
    async fn test_slow_handler_fails_before_expiry() {
        let broker = Arc::new(FakeBroker::new());
        broker.push_task("t1", TOPIC);
        let config = config("w1").with_lock_duration(Duration::from_millis(600));
        let (shutdown, handle) = spawn(poll_loop(
            config,
            &broker,
            Arc::new(Slow(Duration::from_secs(5))),
        ));

        assert!(wait_for(Duration::from_secs(2), || broker.failures().len() == 1).await);
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        let failures = broker.failures();
        assert_eq!(failures[0].error_message, "processing exceeded lease budget");
        assert!(broker.completions().is_empty());
        // The failure went through, so the lease was still held when reported.
        assert_eq!(broker.failure_calls(), 1);
    }

    #[tokio::test]
    async fn test_stale_lease_is_dropped_without_broker_call() {
        let broker = Arc::new(FakeBroker::new());
        broker.backdate_locks(Duration::from_secs(30));
        broker.push_task("t1", TOPIC);
        let poll_loop = poll_loop(config("w1"), &broker, Arc::new(Succeed));
        let metrics = poll_loop.metrics();
        let (shutdown, handle) = spawn(poll_loop);

        assert!(wait_for(Duration::from_secs(2), || metrics.snapshot().lease_lost == 1).await);
        shutdown.cancel();
        let summary = handle.await.unwrap().unwrap();

        assert!(broker.failures().is_empty());
        assert_eq!(broker.failure_calls(), 0);
        assert_eq!(broker.complete_calls(), 0);
        assert_eq!(summary.tasks_leased, 1);
        assert_eq!(summary.report_failures, 0);
    }

    #[tokio::test]
    async fn test_panicking_task_does_not_block_others() {
        let broker = Arc::new(FakeBroker::new());
        let mut vars = Map::new();
        vars.insert("explode".into(), json!(true));
        broker.push_task_with("A", TOPIC, vars);
        broker.push_task("B", TOPIC);
        let (shutdown, handle) = spawn(poll_loop(config("w1"), &broker, Arc::new(Selective)));

        assert!(
            wait_for(Duration::from_secs(2), || {
                broker.completions().len() == 1 && broker.failures().len() == 1
            })
            .await
        );
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(broker.completions()[0].task_id.as_str(), "B");
        assert_eq!(broker.failures()[0].task_id.as_str(), "A");
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let broker = Arc::new(FakeBroker::new());
        for i in 0..8 {
            broker.push_task(&format!("t{i}"), TOPIC);
        }
        let gauge = Arc::new(Gauge::default());
        let config = config("w1").with_limits(8, 2);
        let (shutdown, handle) = spawn(poll_loop(config, &broker, Arc::new(gauge.clone())));

        assert!(wait_for(Duration::from_secs(3), || broker.completions().len() == 8).await);
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(broker.pending(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_reports_interrupted_tasks() {
        let broker = Arc::new(FakeBroker::new());
        broker.push_task("t1", TOPIC);
        let poll_loop = poll_loop(
            config("w1"),
            &broker,
            Arc::new(Slow(Duration::from_secs(5))),
        );
        let metrics = poll_loop.metrics();
        let (shutdown, handle) = spawn(poll_loop);

        assert!(wait_for(Duration::from_secs(2), || metrics.snapshot().in_flight == 1).await);
        shutdown.cancel();
        let summary = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let failures = broker.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].error_message, "interrupted by shutdown");
        assert_eq!(summary.in_flight, 0);
    }

    #[test]
    fn test_new_rejects_uncovered_topic() {
        let broker = Arc::new(FakeBroker::new());
        let result = PollLoop::new(config("w1"), broker, Arc::new(HandlerRegistry::new()));
        assert!(matches!(result, Err(ConfigError::MissingHandler(_))));
    }
}
