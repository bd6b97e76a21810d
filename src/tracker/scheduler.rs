//! Round-robin audience scheduler
//!
//! Spreads one pass over the tracked channels evenly across the pass budget:
//! every tick dequeues one channel and issues its audience fetch. Fetches run
//! as spawned tasks and report back over an mpsc channel, so the queue is only
//! ever touched from the tick and completion arms of one `select!` loop.
//!
//! `ScraperQueueState` holds the queue logic with no I/O so it can be driven
//! step by step in tests; `RoundRobinScheduler` is the tokio driver.

use super::error::FetchError;
use super::snapshot_store::{RecordOutcome, SnapshotSink};
use super::types::{AudienceSample, Channel, ChatterSnapshot};
use super::upstream::UpstreamApi;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

const MIN_TICK_INTERVAL: Duration = Duration::from_millis(1);

/// What a tick decided
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickAction {
    /// Issue an audience fetch for this channel
    Fetch(Channel),
    /// Queue empty but fetches still in flight
    Waiting,
    /// Queue drained and nothing in flight; emitted once per pass
    PassComplete,
    /// No active pass
    Idle,
}

/// What happened to a channel after a failed fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureAction {
    Requeued { attempt: u32 },
    Abandoned { attempts: u32 },
}

/// Summary of one pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Distinct channels seeded at `begin`
    pub channels: usize,
    /// Fetches issued (retries included)
    pub visited: usize,
    /// Snapshots accepted by the sink
    pub recorded: usize,
    /// Failed fetches
    pub failures: usize,
    /// Snapshots dropped for a stale generation
    pub stale: usize,
    /// Recorded snapshots the spool failed to mirror
    pub spool_failures: usize,
    /// Channels that exhausted their attempts
    pub abandoned: Vec<Channel>,
}

/// Queue state for one pass
#[derive(Debug)]
pub struct ScraperQueueState {
    queue: VecDeque<Channel>,
    interval: Duration,
    attempts: HashMap<Channel, u32>,
    in_flight: usize,
    max_attempts: u32,
    active: bool,
    report: PassReport,
}

impl ScraperQueueState {
    /// `max_attempts` of 0 retries without limit
    pub fn new(max_attempts: u32) -> Self {
        Self {
            queue: VecDeque::new(),
            interval: MIN_TICK_INTERVAL,
            attempts: HashMap::new(),
            in_flight: 0,
            max_attempts,
            active: false,
            report: PassReport::default(),
        }
    }

    /// Seed a new pass and fix the tick interval at `budget / channel count`
    pub fn begin(&mut self, channels: &[Channel], budget: Duration) {
        let mut seen = HashSet::new();
        self.queue = channels
            .iter()
            .filter(|channel| seen.insert((*channel).clone()))
            .cloned()
            .collect();

        let count = self.queue.len().max(1) as u32;
        self.interval = (budget / count).max(MIN_TICK_INTERVAL);
        self.attempts.clear();
        self.in_flight = 0;
        self.active = true;
        self.report = PassReport {
            channels: self.queue.len(),
            ..PassReport::default()
        };
    }

    pub fn on_tick(&mut self) -> TickAction {
        if !self.active {
            return TickAction::Idle;
        }

        if let Some(channel) = self.queue.pop_front() {
            *self.attempts.entry(channel.clone()).or_insert(0) += 1;
            self.in_flight += 1;
            self.report.visited += 1;
            return TickAction::Fetch(channel);
        }

        if self.in_flight > 0 {
            return TickAction::Waiting;
        }

        self.active = false;
        TickAction::PassComplete
    }

    pub fn on_fetch_success(&mut self, outcome: RecordOutcome) {
        self.in_flight = self.in_flight.saturating_sub(1);
        match outcome {
            RecordOutcome::Stale { .. } => self.report.stale += 1,
            RecordOutcome::Inserted { .. } | RecordOutcome::Merged { .. } => {
                self.report.recorded += 1
            }
            RecordOutcome::SpoolFailed { .. } => {
                self.report.recorded += 1;
                self.report.spool_failures += 1;
            }
        }
    }

    /// Requeue at the tail, or abandon once the attempt budget is spent
    pub fn on_fetch_failure(&mut self, channel: Channel) -> FailureAction {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.report.failures += 1;

        let attempts = self.attempts.get(&channel).copied().unwrap_or(0);
        if self.max_attempts != 0 && attempts >= self.max_attempts {
            self.report.abandoned.push(channel);
            return FailureAction::Abandoned { attempts };
        }

        self.queue.push_back(channel);
        FailureAction::Requeued { attempt: attempts }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn report(&self) -> &PassReport {
        &self.report
    }

    pub fn into_report(self) -> PassReport {
        self.report
    }
}

struct FetchCompletion {
    channel: Channel,
    generation: u64,
    result: Result<AudienceSample, FetchError>,
}

/// Tokio driver for `ScraperQueueState`
pub struct RoundRobinScheduler {
    api: Arc<dyn UpstreamApi>,
    sink: Arc<dyn SnapshotSink>,
    pass_budget: Duration,
    max_fetch_attempts: u32,
}

impl RoundRobinScheduler {
    pub fn new(
        api: Arc<dyn UpstreamApi>,
        sink: Arc<dyn SnapshotSink>,
        pass_budget: Duration,
        max_fetch_attempts: u32,
    ) -> Self {
        Self {
            api,
            sink,
            pass_budget,
            max_fetch_attempts,
        }
    }

    /// Visit every channel once (plus retries) and return when the pass completes
    pub async fn run_pass(&self, channels: &[Channel]) -> PassReport {
        let mut state = ScraperQueueState::new(self.max_fetch_attempts);
        state.begin(channels, self.pass_budget);

        log::info!(
            "🔄 Starting pass over {} channels (tick every {}ms)",
            state.pending(),
            state.interval().as_millis()
        );

        let (tx, mut rx) = mpsc::unbounded_channel::<FetchCompletion>();
        let mut ticker = interval(state.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match state.on_tick() {
                        TickAction::Fetch(channel) => self.spawn_fetch(channel, tx.clone()),
                        TickAction::Waiting => {
                            log::debug!("Queue drained, waiting on {} fetches", state.in_flight());
                        }
                        TickAction::PassComplete | TickAction::Idle => break,
                    }
                }

                Some(completion) = rx.recv() => {
                    self.handle_completion(&mut state, completion);
                }
            }
        }

        let report = state.into_report();
        log::info!(
            "✅ Pass complete: {} recorded, {} failures, {} abandoned, {} stale",
            report.recorded,
            report.failures,
            report.abandoned.len(),
            report.stale
        );
        if report.spool_failures > 0 {
            log::warn!(
                "⚠️  {} snapshots this pass are not on the spool",
                report.spool_failures
            );
        }
        report
    }

    fn spawn_fetch(&self, channel: Channel, tx: mpsc::UnboundedSender<FetchCompletion>) {
        let generation = self.sink.generation();
        let api = Arc::clone(&self.api);

        tokio::spawn(async move {
            // Inner task so a panicking fetch still reports a completion
            let target = channel.clone();
            let result = tokio::spawn(async move { api.fetch_audience(&target).await })
                .await
                .unwrap_or_else(|e| Err(FetchError::Transient(format!("fetch task failed: {}", e))));
            // Receiver outlives every fetch of its pass
            let _ = tx.send(FetchCompletion {
                channel,
                generation,
                result,
            });
        });
    }

    fn handle_completion(&self, state: &mut ScraperQueueState, completion: FetchCompletion) {
        let FetchCompletion {
            channel,
            generation,
            result,
        } = completion;

        match result {
            Ok(sample) => {
                let snapshot = ChatterSnapshot::from_sample(channel.clone(), sample);
                let outcome = self.sink.record(generation, snapshot);
                log::debug!("📥 {}: {:?}", channel, outcome);
                state.on_fetch_success(outcome);
            }
            Err(e) => match state.on_fetch_failure(channel.clone()) {
                FailureAction::Requeued { attempt } => {
                    log::warn!("⚠️  Fetch attempt {} for {} failed: {}", attempt, channel, e);
                }
                FailureAction::Abandoned { attempts } => {
                    log::warn!(
                        "⚠️  Abandoning {} for this pass after {} attempts: {}",
                        channel,
                        attempts,
                        e
                    );
                }
            },
        }
    }
}
