//! Periodic execution of cycles, isolated from each other's failures.
//!
//! A failed cycle never stops the loop. Consecutive failures stretch the
//! interval to `interval * 2^failures`, capped at the configured maximum, and
//! the first success resets it. Only shutdown or a storage error ends the
//! loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::clock::Ticker;
use crate::error::{Result, SyncError};
use crate::events::{CycleSummary, EventBus, SyncEvent};

/// One task the scheduler can run repeatedly
#[async_trait]
pub trait CycleRunner: Send + Sync {
    fn name(&self) -> &str;

    async fn run_cycle(&self, cycle: u64, shutdown: &CancellationToken) -> Result<CycleSummary>;
}

/// Scheduling state of a task, owned by its loop
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerContext {
    pub interval: Duration,
    pub max_interval: Duration,
    pub consecutive_failures: u32,
    pub next_run: DateTime<Utc>,
    /// Number of the last cycle started
    pub cycle: u64,
}

impl SchedulerContext {
    /// The first cycle is due immediately.
    pub fn new(interval: Duration, max_interval: Duration, now: DateTime<Utc>) -> Self {
        Self {
            interval,
            max_interval,
            consecutive_failures: 0,
            next_run: now,
            cycle: 0,
        }
    }

    pub fn current_delay(&self) -> Duration {
        let cap = self.max_interval.max(self.interval);
        let factor = 2u32.saturating_pow(self.consecutive_failures);
        self.interval.checked_mul(factor).unwrap_or(cap).min(cap)
    }

    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.consecutive_failures = 0;
        self.next_run = now + self.interval;
    }

    /// Returns the delay until the next attempt.
    pub fn record_failure(&mut self, now: DateTime<Utc>) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let delay = self.current_delay();
        self.next_run = now + delay;
        delay
    }
}

pub struct SchedulerLoop {
    runner: Arc<dyn CycleRunner>,
    ticker: Ticker,
    events: EventBus,
    deadline: Duration,
}

impl SchedulerLoop {
    pub fn new(runner: Arc<dyn CycleRunner>, ticker: Ticker, events: EventBus, deadline: Duration) -> Self {
        Self {
            runner,
            ticker,
            events,
            deadline,
        }
    }

    pub fn name(&self) -> &str {
        self.runner.name()
    }

    /// Run a single time-boxed cycle and publish its result.
    pub async fn run_once(&self, cycle: u64, shutdown: &CancellationToken) -> Result<CycleSummary> {
        let task = self.runner.name().to_string();
        self.events.emit(SyncEvent::CycleStarted {
            task: task.clone(),
            cycle,
        });
        tracing::info!(job = %task, cycle, "Cycle started");

        let result = match tokio::time::timeout(self.deadline, self.runner.run_cycle(cycle, shutdown)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::DeadlineExceeded(self.deadline.as_secs())),
        };

        match &result {
            Ok(summary) => {
                tracing::info!(
                    job = %task,
                    cycle,
                    added = summary.added,
                    removed = summary.removed,
                    moved = summary.moved,
                    failed = summary.failed,
                    "Cycle finished"
                );
                self.events.emit(SyncEvent::CycleFinished {
                    task,
                    cycle,
                    summary: *summary,
                });
            }
            Err(e) => {
                tracing::warn!(job = %task, cycle, error = %e, "Cycle abandoned");
                self.events.emit(SyncEvent::CycleAbandoned {
                    task,
                    cycle,
                    reason: e.to_string(),
                });
            }
        }
        result
    }

    /// Run cycles until shutdown. Returns the final context, or the storage
    /// error that stopped the loop.
    pub async fn run(&self, mut context: SchedulerContext, shutdown: &CancellationToken) -> Result<SchedulerContext> {
        loop {
            if !self.ticker.wait_until(context.next_run, shutdown).await {
                break;
            }

            context.cycle += 1;
            match self.run_once(context.cycle, shutdown).await {
                Ok(_) => context.record_success(self.ticker.now()),
                Err(e) if e.is_fatal() => {
                    tracing::error!(job = self.name(), error = %e, "Stopping after a storage failure");
                    return Err(e);
                }
                Err(SyncError::Cancelled) if shutdown.is_cancelled() => break,
                Err(_) => {
                    let delay = context.record_failure(self.ticker.now());
                    tracing::info!(
                        job = self.name(),
                        failures = context.consecutive_failures,
                        delay_ms = delay.as_millis() as u64,
                        "Backing off the schedule"
                    );
                    self.events.emit(SyncEvent::SchedulerBackoff {
                        task: self.name().to_string(),
                        failures: context.consecutive_failures,
                        delay,
                    });
                }
            }
        }

        tracing::info!(job = self.name(), cycles = context.cycle, "Scheduler stopped");
        Ok(context)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::events::testing::drain;
    use crate::sync::clock::Clock;
    use crate::sync::clock::testing::ManualClock;

    enum Step {
        Return(Result<CycleSummary>),
        Hang,
    }

    /// Plays back `steps`, then requests shutdown.
    struct ScriptedRunner {
        steps: Mutex<VecDeque<Step>>,
        calls: AtomicU64,
        stop: CancellationToken,
    }

    impl ScriptedRunner {
        fn new(steps: Vec<Step>, stop: &CancellationToken) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                calls: AtomicU64::new(0),
                stop: stop.clone(),
            })
        }
    }

    #[async_trait]
    impl CycleRunner for ScriptedRunner {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn run_cycle(&self, _cycle: u64, _shutdown: &CancellationToken) -> Result<CycleSummary> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self.steps.lock().unwrap().pop_front();
            match step {
                Some(Step::Return(result)) => result,
                Some(Step::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(CycleSummary::default())
                }
                None => {
                    self.stop.cancel();
                    Ok(CycleSummary::default())
                }
            }
        }
    }

    fn scheduler(runner: Arc<ScriptedRunner>, clock: Arc<ManualClock>, events: &EventBus) -> SchedulerLoop {
        SchedulerLoop::new(runner, Ticker::new(clock), events.clone(), Duration::from_secs(600))
    }

    fn transient() -> Step {
        Step::Return(Err(SyncError::transient("503")))
    }

    #[test]
    fn delay_doubles_per_failure_up_to_the_cap() {
        let now = Utc::now();
        let mut context = SchedulerContext::new(Duration::from_secs(60), Duration::from_secs(300), now);
        let delays: Vec<_> = (0..5).map(|_| context.record_failure(now).as_secs()).collect();
        assert_eq!(delays, vec![120, 240, 300, 300, 300]);

        context.record_success(now);
        assert_eq!(context.current_delay(), Duration::from_secs(60));
        assert_eq!(context.next_run, now + Duration::from_secs(60));
    }

    #[test]
    fn huge_failure_counts_saturate() {
        let mut context = SchedulerContext::new(Duration::from_secs(60), Duration::from_secs(600), Utc::now());
        context.consecutive_failures = 200;
        assert_eq!(context.current_delay(), Duration::from_secs(600));
    }

    #[tokio::test]
    async fn failures_back_off_and_success_resets() {
        let stop = CancellationToken::new();
        let runner = ScriptedRunner::new(
            vec![transient(), transient(), transient(), Step::Return(Ok(CycleSummary::default()))],
            &stop,
        );
        let clock = ManualClock::new();
        let events = EventBus::new(64);
        let mut received = events.subscribe();
        let context = SchedulerContext::new(Duration::from_secs(60), Duration::from_secs(200), clock.now());

        let context = scheduler(runner.clone(), clock.clone(), &events)
            .run(context, &stop)
            .await
            .unwrap();

        assert_eq!(runner.calls.load(Ordering::SeqCst), 5);
        assert_eq!(context.cycle, 5);
        assert_eq!(context.consecutive_failures, 0);
        assert_eq!(
            &clock.sleeps()[..4],
            &[120, 200, 200, 60].map(Duration::from_secs),
        );

        let backoffs: Vec<u32> = drain(&mut received)
            .into_iter()
            .filter_map(|event| match event {
                SyncEvent::SchedulerBackoff { failures, .. } => Some(failures),
                _ => None,
            })
            .collect();
        assert_eq!(backoffs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn storage_errors_stop_the_loop() {
        let stop = CancellationToken::new();
        let runner = ScriptedRunner::new(
            vec![transient(), Step::Return(Err(SyncError::storage("disk full")))],
            &stop,
        );
        let clock = ManualClock::new();
        let context = SchedulerContext::new(Duration::from_secs(60), Duration::from_secs(600), clock.now());

        let err = scheduler(runner.clone(), clock, &EventBus::default())
            .run(context, &stop)
            .await
            .unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
        assert!(!stop.is_cancelled());
    }

    #[tokio::test]
    async fn exhausted_rate_limits_back_off() {
        let stop = CancellationToken::new();
        let runner = ScriptedRunner::new(
            vec![Step::Return(Err(SyncError::RateLimitExhausted { attempts: 5 }))],
            &stop,
        );
        let clock = ManualClock::new();
        let events = EventBus::new(16);
        let mut received = events.subscribe();
        let context = SchedulerContext::new(Duration::from_secs(60), Duration::from_secs(600), clock.now());

        let context = scheduler(runner, clock.clone(), &events).run(context, &stop).await.unwrap();

        assert_eq!(clock.sleeps()[0], Duration::from_secs(120));
        assert_eq!(context.consecutive_failures, 0);
        let abandoned = drain(&mut received)
            .into_iter()
            .filter(|event| matches!(event, SyncEvent::CycleAbandoned { .. } | SyncEvent::SchedulerBackoff { failures: 1, .. }))
            .count();
        assert_eq!(abandoned, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn overrunning_cycles_are_abandoned() {
        let stop = CancellationToken::new();
        let runner = ScriptedRunner::new(vec![Step::Hang], &stop);
        let clock = ManualClock::new();
        let events = EventBus::new(64);
        let mut received = events.subscribe();
        let context = SchedulerContext::new(Duration::from_secs(60), Duration::from_secs(600), clock.now());

        let context = scheduler(runner.clone(), clock, &events).run(context, &stop).await.unwrap();
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(context.cycle, 2);

        let abandoned: Vec<String> = drain(&mut received)
            .into_iter()
            .filter_map(|event| match event {
                SyncEvent::CycleAbandoned { reason, .. } => Some(reason),
                _ => None,
            })
            .collect();
        assert_eq!(abandoned, vec![SyncError::DeadlineExceeded(600).to_string()]);
    }

    #[tokio::test]
    async fn shutdown_before_the_first_cycle_runs_nothing() {
        let stop = CancellationToken::new();
        stop.cancel();
        let runner = ScriptedRunner::new(Vec::new(), &stop);
        let clock = ManualClock::new();
        let context = SchedulerContext::new(Duration::from_secs(60), Duration::from_secs(600), clock.now());

        let context = scheduler(runner.clone(), clock, &EventBus::default())
            .run(context, &stop)
            .await
            .unwrap();
        assert_eq!(context.cycle, 0);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_cycles_do_not_count_as_failures() {
        let stop = CancellationToken::new();
        let cancel = stop.clone();
        struct CancellingRunner(CancellationToken);

        #[async_trait]
        impl CycleRunner for CancellingRunner {
            fn name(&self) -> &str {
                "cancelling"
            }

            async fn run_cycle(&self, _cycle: u64, _shutdown: &CancellationToken) -> Result<CycleSummary> {
                self.0.cancel();
                Err(SyncError::Cancelled)
            }
        }

        let clock = ManualClock::new();
        let context = SchedulerContext::new(Duration::from_secs(60), Duration::from_secs(600), clock.now());
        let context = SchedulerLoop::new(
            Arc::new(CancellingRunner(cancel)),
            Ticker::new(clock.clone()),
            EventBus::default(),
            Duration::from_secs(600),
        )
        .run(context, &stop)
        .await
        .unwrap();

        assert_eq!(context.consecutive_failures, 0);
        assert!(clock.sleeps().is_empty());
    }
}
