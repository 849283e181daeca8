//! Supervisor for stage execution units.
//!
//! The supervisor owns the per-run stage table, launches one execution unit
//! per stage, observes exits at a bounded poll interval, and relaunches
//! crashed units under a configurable restart policy. It returns once every
//! stage has completed successfully exactly once in the current run.
//!
//! All bookkeeping lives inside the supervisor value; there are no
//! process-wide status maps. Relaunches reuse the stage's existing channel
//! bindings, so in-flight queue contents survive a crash (minus whatever the
//! dead unit had already consumed).

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::execution::unit::{ExecutionUnit, UnitExit};
use crate::execution::ExecutionMode;
use crate::stage::Stage;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Restart policy for crashed stages.
#[derive(Clone, Debug)]
pub struct RestartPolicy {
    /// Maximum number of relaunches per stage before the run is failed.
    /// `None` never gives up — the reference behavior, which turns a
    /// permanently failing transform into an infinite restart loop.
    pub max_restarts: Option<u32>,
    /// Initial delay before relaunching.
    pub restart_delay: Duration,
    /// Backoff strategy for repeated failures.
    pub backoff: BackoffStrategy,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: Some(3),
            restart_delay: Duration::from_millis(100),
            backoff: BackoffStrategy::Exponential {
                factor: 2.0,
                max: Duration::from_secs(30),
            },
        }
    }
}

impl RestartPolicy {
    /// Create a policy that never relaunches.
    pub fn never() -> Self {
        Self {
            max_restarts: Some(0),
            ..Default::default()
        }
    }

    /// Create a policy with a fixed relaunch budget.
    pub fn bounded(max_restarts: u32) -> Self {
        Self {
            max_restarts: Some(max_restarts),
            ..Default::default()
        }
    }

    /// Create a policy that relaunches forever.
    pub fn unbounded() -> Self {
        Self {
            max_restarts: None,
            ..Default::default()
        }
    }

    /// Calculate the delay before the nth relaunch (zero-based).
    pub fn delay_for_restart(&self, restart_count: u32) -> Duration {
        match &self.backoff {
            BackoffStrategy::Fixed => self.restart_delay,
            BackoffStrategy::Linear { increment } => {
                self.restart_delay + *increment * restart_count
            }
            BackoffStrategy::Exponential { factor, max } => {
                let delay = self.restart_delay.as_secs_f64() * factor.powi(restart_count as i32);
                Duration::from_secs_f64(delay.min(max.as_secs_f64()))
            }
        }
    }
}

/// Backoff strategy for relaunch delays.
#[derive(Clone, Debug)]
pub enum BackoffStrategy {
    /// Fixed delay between relaunches.
    Fixed,
    /// Linear increase in delay.
    Linear {
        /// Delay increment per relaunch.
        increment: Duration,
    },
    /// Exponential increase in delay.
    Exponential {
        /// Multiplier per relaunch.
        factor: f64,
        /// Maximum delay.
        max: Duration,
    },
}

/// Supervision state of one stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageStatus {
    /// Registered, no unit launched yet.
    NotStarted,
    /// A unit is running (or about to be polled).
    Launched,
    /// The stage completed successfully; terminal for this run.
    Completed,
    /// The last unit died; a relaunch is scheduled.
    Crashed,
}

/// Outcome of one supervised run.
#[derive(Debug)]
pub struct SupervisionReport {
    /// Per-stage results, in pipeline order.
    pub stages: Vec<StageReport>,
}

/// Result of supervising one stage.
#[derive(Debug)]
pub struct StageReport {
    /// Stage name.
    pub name: String,
    /// Number of units launched for this stage (1 = no crashes).
    pub generations: u32,
}

struct StageCell {
    stage: Arc<Stage>,
    status: StageStatus,
    unit: Option<ExecutionUnit>,
    /// Units launched so far.
    launches: u32,
    /// Crashes observed so far.
    crashes: u32,
    /// When a scheduled relaunch may happen.
    next_attempt: Option<Instant>,
}

/// Launches, observes, and relaunches stage execution units.
pub struct Supervisor {
    mode: ExecutionMode,
    policy: RestartPolicy,
    poll_interval: Duration,
    cancel: CancelToken,
}

impl Supervisor {
    /// Create a supervisor with default policy and poll interval.
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            mode,
            policy: RestartPolicy::default(),
            poll_interval: Duration::from_secs(1),
            cancel: CancelToken::new(),
        }
    }

    /// Set the restart policy.
    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the exit-observation interval. Bounds how long a completed or
    /// crashed unit can go unnoticed; the supervisor never spins faster.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Observe an external cancellation token.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The execution mode units are launched in.
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Run every stage to successful completion.
    ///
    /// Returns when all stages have completed once, or fails on
    /// cancellation, on a launch error, or when a stage exhausts its
    /// restart budget. Completion of a single stage never ends the run:
    /// downstream stages may still be draining messages an already
    /// completed upstream produced.
    pub fn supervise(&self, stages: &[Arc<Stage>]) -> Result<SupervisionReport> {
        let mut cells: Vec<StageCell> = stages
            .iter()
            .map(|stage| StageCell {
                stage: Arc::clone(stage),
                status: StageStatus::NotStarted,
                unit: None,
                launches: 0,
                crashes: 0,
                next_attempt: None,
            })
            .collect();

        loop {
            if self.cancel.is_cancelled() {
                self.stop_all(&mut cells);
                return Err(Error::Cancelled);
            }

            let mut all_completed = true;
            for index in 0..cells.len() {
                match cells[index].status {
                    StageStatus::Completed => continue,
                    StageStatus::NotStarted => {
                        if let Err(e) = self.launch(&mut cells[index]) {
                            self.stop_all(&mut cells);
                            return Err(e);
                        }
                        all_completed = false;
                    }
                    StageStatus::Launched => {
                        if let Err(e) = self.observe(&mut cells[index]) {
                            self.stop_all(&mut cells);
                            return Err(e);
                        }
                        if cells[index].status != StageStatus::Completed {
                            all_completed = false;
                        }
                    }
                    StageStatus::Crashed => {
                        let due = cells[index]
                            .next_attempt
                            .map(|at| Instant::now() >= at)
                            .unwrap_or(true);
                        if due {
                            if let Err(e) = self.launch(&mut cells[index]) {
                                self.stop_all(&mut cells);
                                return Err(e);
                            }
                        }
                        all_completed = false;
                    }
                }
            }

            if all_completed {
                return Ok(SupervisionReport {
                    stages: cells
                        .iter()
                        .map(|cell| StageReport {
                            name: cell.stage.name().to_string(),
                            generations: cell.launches,
                        })
                        .collect(),
                });
            }

            std::thread::sleep(self.poll_interval);
        }
    }

    fn launch(&self, cell: &mut StageCell) -> Result<()> {
        let unit = ExecutionUnit::launch(self.mode, &cell.stage)?;
        cell.launches += 1;
        cell.unit = Some(unit);
        cell.status = StageStatus::Launched;
        cell.next_attempt = None;
        if cell.launches == 1 {
            tracing::info!(stage = cell.stage.name(), "stage launched");
        } else {
            tracing::info!(
                stage = cell.stage.name(),
                generation = cell.launches,
                "stage relaunched"
            );
        }
        Ok(())
    }

    /// Poll one launched unit and apply the state transition for its exit.
    fn observe(&self, cell: &mut StageCell) -> Result<()> {
        let Some(unit) = cell.unit.as_mut() else {
            return Ok(());
        };
        let Some(exit) = unit.poll(cell.stage.name())? else {
            return Ok(());
        };
        cell.unit = None;

        match exit {
            UnitExit::Succeeded => {
                tracing::info!(stage = cell.stage.name(), "stage completed");
                cell.status = StageStatus::Completed;
            }
            UnitExit::Failed(error) => {
                tracing::warn!(stage = cell.stage.name(), error = %error, "stage failed");
                self.handle_crash(cell)?;
            }
            UnitExit::Crashed(reason) => {
                tracing::warn!(stage = cell.stage.name(), reason = %reason, "stage crashed");
                self.handle_crash(cell)?;
            }
        }
        Ok(())
    }

    /// Schedule a relaunch, or fail the run if the budget is spent.
    fn handle_crash(&self, cell: &mut StageCell) -> Result<()> {
        cell.crashes += 1;
        if let Some(max) = self.policy.max_restarts {
            if cell.crashes > max {
                return Err(Error::RestartBudgetExhausted {
                    stage: cell.stage.name().to_string(),
                    attempts: cell.launches,
                });
            }
        }
        let delay = self.policy.delay_for_restart(cell.crashes - 1);
        cell.status = StageStatus::Crashed;
        cell.next_attempt = Some(Instant::now() + delay);
        Ok(())
    }

    /// Tear down every still-running unit. Cancels the token first so
    /// thread units blocked on a channel can observe it and exit.
    fn stop_all(&self, cells: &mut [StageCell]) {
        self.cancel.cancel();
        for cell in cells {
            if let Some(mut unit) = cell.unit.take() {
                unit.stop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelConfig, ChannelRegistry, TransportKind};
    use crate::execution::DeliveryMode;
    use crate::message::Message;
    use crate::stage::Feed;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(mode: ExecutionMode) -> Supervisor {
        Supervisor::new(mode)
            .with_poll_interval(Duration::from_millis(5))
            .with_restart_policy(RestartPolicy {
                restart_delay: Duration::from_millis(5),
                backoff: BackoffStrategy::Fixed,
                ..Default::default()
            })
    }

    #[test]
    fn test_restart_policy_default() {
        let policy = RestartPolicy::default();
        assert_eq!(policy.max_restarts, Some(3));
        assert_eq!(policy.restart_delay, Duration::from_millis(100));
    }

    #[test]
    fn test_restart_policy_constructors() {
        assert_eq!(RestartPolicy::never().max_restarts, Some(0));
        assert_eq!(RestartPolicy::bounded(7).max_restarts, Some(7));
        assert_eq!(RestartPolicy::unbounded().max_restarts, None);
    }

    #[test]
    fn test_restart_policy_exponential_backoff() {
        let policy = RestartPolicy {
            restart_delay: Duration::from_millis(100),
            backoff: BackoffStrategy::Exponential {
                factor: 2.0,
                max: Duration::from_secs(10),
            },
            ..Default::default()
        };

        assert_eq!(policy.delay_for_restart(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_restart(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_restart(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_restart(3), Duration::from_millis(800));

        // Capped at max.
        assert_eq!(policy.delay_for_restart(10), Duration::from_secs(10));
    }

    #[test]
    fn test_restart_policy_linear_backoff() {
        let policy = RestartPolicy {
            restart_delay: Duration::from_millis(100),
            backoff: BackoffStrategy::Linear {
                increment: Duration::from_millis(50),
            },
            ..Default::default()
        };

        assert_eq!(policy.delay_for_restart(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_restart(2), Duration::from_millis(200));
    }

    #[test]
    fn test_supervise_single_stage_to_completion() {
        let feed: Feed = Box::new(vec![b"a".to_vec()].into_iter());
        let stage = Arc::new(Stage::new(
            "solo",
            Some(feed),
            Box::new(|p| Ok(p)),
            None,
            None,
            DeliveryMode::AtMostOnce,
            CancelToken::new(),
        ));

        let report = fast(ExecutionMode::Threads).supervise(&[stage]).unwrap();
        assert_eq!(report.stages.len(), 1);
        assert_eq!(report.stages[0].name, "solo");
        assert_eq!(report.stages[0].generations, 1);
    }

    #[test]
    fn test_supervise_relaunches_failed_stage() {
        // Transform fails on its first invocation only; the item it was
        // processing is lost under at-most-once and the relaunched
        // generation drains the rest of the feed.
        let attempts = Arc::new(AtomicU32::new(0));
        let transform = {
            let attempts = Arc::clone(&attempts);
            move |payload: Vec<u8>| {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err("first attempt fails".into())
                } else {
                    Ok(payload)
                }
            }
        };

        let feed: Feed = Box::new(vec![b"a".to_vec(), b"b".to_vec()].into_iter());
        let stage = Arc::new(Stage::new(
            "flaky",
            Some(feed),
            Box::new(transform),
            None,
            None,
            DeliveryMode::AtMostOnce,
            CancelToken::new(),
        ));

        let report = fast(ExecutionMode::Threads).supervise(&[stage]).unwrap();
        assert_eq!(report.stages[0].generations, 2);
    }

    #[test]
    fn test_supervise_exhausts_restart_budget() {
        // A poisoned message under at-least-once is redelivered to every
        // generation, so the stage fails deterministically until the budget
        // is spent.
        let mut reg = ChannelRegistry::new(TransportKind::Memory);
        let input = reg.create("poison-in", ChannelConfig::default()).unwrap();
        let cancel = CancelToken::new();
        input
            .send(Message::data(b"poison".to_vec()), &cancel)
            .unwrap();

        let stage = Arc::new(Stage::new(
            "doomed",
            None,
            Box::new(|_| Err("always fails".into())),
            Some(input),
            None,
            DeliveryMode::AtLeastOnce,
            cancel.clone(),
        ));

        let supervisor = fast(ExecutionMode::Threads).with_restart_policy(RestartPolicy {
            max_restarts: Some(2),
            restart_delay: Duration::from_millis(5),
            backoff: BackoffStrategy::Fixed,
        });

        match supervisor.supervise(&[stage]) {
            Err(Error::RestartBudgetExhausted { stage, attempts }) => {
                assert_eq!(stage, "doomed");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected RestartBudgetExhausted, got {other:?}"),
        }
    }

    #[test]
    fn test_supervise_panic_counts_as_crash() {
        let mut reg = ChannelRegistry::new(TransportKind::Memory);
        let input = reg.create("panic-in", ChannelConfig::default()).unwrap();
        let cancel = CancelToken::new();
        input.send(Message::data(b"x".to_vec()), &cancel).unwrap();
        input.send(Message::EndOfStream, &cancel).unwrap();

        let panicked = Arc::new(AtomicU32::new(0));
        let transform = {
            let panicked = Arc::clone(&panicked);
            move |payload: Vec<u8>| {
                if panicked.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("simulated crash");
                }
                Ok(payload)
            }
        };

        let stage = Arc::new(Stage::new(
            "panicky",
            None,
            Box::new(transform),
            Some(input),
            None,
            DeliveryMode::AtLeastOnce,
            cancel.clone(),
        ));

        let report = fast(ExecutionMode::Threads).supervise(&[stage]).unwrap();
        // First generation crashed mid-message, second redelivered it and
        // then drained the marker.
        assert_eq!(report.stages[0].generations, 2);
    }

    #[test]
    fn test_supervise_cancellation() {
        // A source that never ends, interrupted from outside.
        let cancel = CancelToken::new();
        let feed: Feed = Box::new(std::iter::repeat_with(|| b"tick".to_vec()));
        let mut reg = ChannelRegistry::new(TransportKind::Memory);
        let out = reg
            .create(
                "cancel-out",
                ChannelConfig {
                    capacity: 1,
                    max_message_size: 16,
                },
            )
            .unwrap();

        // No consumer: the source wedges on a full channel until cancelled.
        let stage = Arc::new(Stage::new(
            "endless",
            Some(feed),
            Box::new(|p| Ok(p)),
            None,
            Some(out),
            DeliveryMode::AtMostOnce,
            cancel.clone(),
        ));

        let supervisor = fast(ExecutionMode::Threads).with_cancel_token(cancel.clone());

        let canceller = {
            let cancel = cancel.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                cancel.cancel();
            })
        };

        match supervisor.supervise(&[stage]) {
            Err(Error::Cancelled) => {}
            other => panic!("expected Cancelled, got {other:?}"),
        }
        canceller.join().unwrap();
    }
}
