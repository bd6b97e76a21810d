//! Iteration/flush controller
//!
//! ```text
//! Idle → Collecting → Draining → Restarting → Collecting …
//!                         ↓
//!                      Flushing → Restarting
//! ```
//!
//! `IterationState` is persisted after every pass before the flush decision
//! is acted on, and `iterations_since_flush` only returns to 0 once a flush
//! has been written and the snapshot store cleared. A process that dies
//! mid-flush therefore restarts with `iterations_since_flush >= threshold`
//! and resumes the flush in `start()`.

use super::backoff::ExponentialBackoff;
use super::config::TrackerConfig;
use super::db::OverlapDbWriter;
use super::error::{DbError, TrackerError};
use super::overlap::{build_entries, OverlapEngine};
use super::scheduler::{PassReport, RoundRobinScheduler};
use super::snapshot_store::SnapshotStore;
use super::state_store::IterationStateStore;
use super::types::{Channel, IterationState, TopChannel};
use super::upstream::UpstreamApi;
use chrono::Utc;
use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerPhase {
    Idle,
    Collecting,
    Draining,
    Restarting,
    Flushing,
}

/// Tunables the controller needs from `TrackerConfig`
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub pass_budget: Duration,
    pub flush_threshold: u64,
    pub top_channel_limit: usize,
    pub max_fetch_attempts: u32,
}

impl ControllerSettings {
    pub fn from_config(config: &TrackerConfig) -> Self {
        Self {
            pass_budget: config.pass_budget(),
            flush_threshold: config.flush_threshold,
            top_channel_limit: config.top_channel_limit,
            max_fetch_attempts: config.max_fetch_attempts,
        }
    }
}

/// Result of one flush
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushSummary {
    /// Iteration the rows were keyed by
    pub iteration: u64,
    /// Channels that received overlap rows
    pub channels: usize,
    pub rows: usize,
}

/// How a completed pass ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    Continued(IterationState),
    Flushed(FlushSummary),
}

pub struct IterationController {
    settings: ControllerSettings,
    api: Arc<dyn UpstreamApi>,
    db: Arc<dyn OverlapDbWriter>,
    state_store: Arc<dyn IterationStateStore>,
    store: Arc<SnapshotStore>,
    scheduler: RoundRobinScheduler,
    engine: OverlapEngine,
    write_backoff: ExponentialBackoff,
    state: IterationState,
    phase: ControllerPhase,
    tracked: Vec<TopChannel>,
    known_channels: HashSet<Channel>,
}

impl IterationController {
    pub fn new(
        settings: ControllerSettings,
        api: Arc<dyn UpstreamApi>,
        db: Arc<dyn OverlapDbWriter>,
        state_store: Arc<dyn IterationStateStore>,
        store: Arc<SnapshotStore>,
    ) -> Self {
        let scheduler = RoundRobinScheduler::new(
            Arc::clone(&api),
            store.clone(),
            settings.pass_budget,
            settings.max_fetch_attempts,
        );

        Self {
            settings,
            api,
            db,
            state_store,
            store,
            scheduler,
            engine: OverlapEngine::new(),
            write_backoff: ExponentialBackoff::default(),
            state: IterationState::default(),
            phase: ControllerPhase::Idle,
            tracked: Vec::new(),
            known_channels: HashSet::new(),
        }
    }

    /// Override the retry policy for transient database writes
    pub fn with_write_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.write_backoff = backoff;
        self
    }

    pub fn state(&self) -> IterationState {
        self.state
    }

    pub fn phase(&self) -> ControllerPhase {
        self.phase
    }

    pub fn tracked_channels(&self) -> Vec<Channel> {
        self.tracked.iter().map(|top| top.channel.clone()).collect()
    }

    /// Restore durable state and resume an interrupted flush if one is pending
    pub async fn start(&mut self) -> Result<(), TrackerError> {
        self.state = self
            .state_store
            .load()
            .map_err(TrackerError::StateUnreadable)?
            .unwrap_or_default();

        log::info!(
            "🚀 Starting at iteration {} ({} passes since last flush, threshold {})",
            self.state.iteration,
            self.state.iterations_since_flush,
            self.settings.flush_threshold
        );

        let known = retry_transient(&self.write_backoff, "load known channels", || {
            self.db.load_known_channels()
        })
        .await?;
        self.known_channels = known.into_iter().collect();
        log::info!("📋 {} channels already registered", self.known_channels.len());

        if self.state.iterations_since_flush >= self.settings.flush_threshold {
            log::warn!(
                "⚠️  Previous flush of iteration {} did not finish, resuming it",
                self.state.iteration
            );
            self.flush().await?;
        }

        Ok(())
    }

    /// Fetch the top channels, register new ones and enter Collecting
    pub async fn begin_pass(&mut self) -> Result<Vec<Channel>, TrackerError> {
        let top = self
            .api
            .fetch_top_channels(self.settings.top_channel_limit)
            .await?;
        log::info!("📡 Tracking {} top channels", top.len());

        let channels: Vec<Channel> = top.iter().map(|t| t.channel.clone()).collect();
        self.register_new_channels(&channels).await;

        let upcoming = self.state.iteration + 1;
        if let Err(e) = self.db.write_stream_info(upcoming, &top).await {
            log::warn!("⚠️  Failed to store stream info for iteration {}: {}", upcoming, e);
        }

        self.tracked = top;
        self.phase = ControllerPhase::Collecting;
        Ok(channels)
    }

    async fn register_new_channels(&mut self, channels: &[Channel]) {
        let new_channels: Vec<Channel> = channels
            .iter()
            .filter(|channel| !self.known_channels.contains(*channel))
            .cloned()
            .collect();

        if new_channels.is_empty() {
            return;
        }

        // Failures here are retried on the next pass
        let metadata = match self.api.fetch_channel_metadata(&new_channels).await {
            Ok(metadata) => metadata,
            Err(e) => {
                log::warn!("⚠️  Failed to fetch metadata for {} channels: {}", new_channels.len(), e);
                return;
            }
        };

        match self.db.write_channel_metadata(&metadata).await {
            Ok(()) => {
                log::info!("👤 Registered {} new channels", metadata.len());
                self.known_channels
                    .extend(metadata.into_iter().map(|m| m.channel));
            }
            Err(e) => log::warn!("⚠️  Failed to store channel metadata: {}", e),
        }
    }

    /// One full cycle: begin, collect, drain and possibly flush
    pub async fn run_pass(&mut self) -> Result<PassOutcome, TrackerError> {
        let channels = self.begin_pass().await?;
        let report = self.scheduler.run_pass(&channels).await;
        self.complete_pass(&report).await
    }

    /// Draining: count the pass durably, then flush or restart
    pub async fn complete_pass(&mut self, report: &PassReport) -> Result<PassOutcome, TrackerError> {
        self.phase = ControllerPhase::Draining;

        self.state.iteration += 1;
        self.persist_state()?;

        let iteration = self.state.iteration;
        let timestamp = Utc::now();
        retry_transient(&self.write_backoff, "write iteration marker", || {
            self.db.write_iteration_marker(iteration, timestamp)
        })
        .await?;

        self.state.iterations_since_flush += 1;
        self.persist_state()?;

        log::info!(
            "📊 Iteration {} complete ({} recorded, {} abandoned), {}/{} passes toward flush",
            iteration,
            report.recorded,
            report.abandoned.len(),
            self.state.iterations_since_flush,
            self.settings.flush_threshold
        );

        if self.state.iterations_since_flush >= self.settings.flush_threshold {
            let summary = self.flush().await?;
            return Ok(PassOutcome::Flushed(summary));
        }

        self.phase = ControllerPhase::Restarting;
        Ok(PassOutcome::Continued(self.state))
    }

    /// Flushing: compute overlaps, write them, clear the window
    pub async fn flush(&mut self) -> Result<FlushSummary, TrackerError> {
        self.phase = ControllerPhase::Flushing;
        let iteration = self.state.iteration;

        let channels: Vec<Channel> = self
            .tracked
            .iter()
            .map(|t| t.channel.clone())
            .chain(self.store.channels())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        log::info!("🧮 Calculating overlaps for {} channels...", channels.len());

        let totals = self.store.totals();
        let view = Arc::new(self.store.read_all());
        let overlaps = self
            .engine
            .compute_concurrent(&channels, view)
            .await
            .map_err(|e| TrackerError::Overlap(e.to_string()))?;

        for channel in &channels {
            retry_transient(&self.write_backoff, "create channel table", || {
                self.db.ensure_channel_table(channel)
            })
            .await?;
        }

        let mut summary = FlushSummary {
            iteration,
            channels: 0,
            rows: 0,
        };

        for (channel, row) in &overlaps {
            // Channels never fetched this window get no rows
            let Some(total) = totals.get(channel).copied() else {
                continue;
            };

            let entries = build_entries(channel, row, total);
            retry_transient(&self.write_backoff, "write overlap rows", || {
                self.db.write_overlap_rows(channel, iteration, &entries)
            })
            .await?;

            summary.channels += 1;
            summary.rows += entries.len();
        }

        self.store.clear().map_err(TrackerError::Spool)?;

        self.state.iterations_since_flush = 0;
        self.persist_state()?;

        log::info!(
            "💾 Flushed {} overlap rows for {} channels (iteration {})",
            summary.rows,
            summary.channels,
            iteration
        );

        self.phase = ControllerPhase::Restarting;
        Ok(summary)
    }

    /// Run passes until a fatal error occurs
    pub async fn run(&mut self) -> Result<(), TrackerError> {
        self.start().await?;

        loop {
            self.run_pass().await?;
        }
    }

    fn persist_state(&self) -> Result<(), TrackerError> {
        self.state_store
            .save(&self.state)
            .map_err(TrackerError::StateWrite)
    }
}

/// Retry `op` while it fails with a transient database error
async fn retry_transient<T, F, Fut>(
    policy: &ExponentialBackoff,
    what: &str,
    mut op: F,
) -> Result<T, DbError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DbError>>,
{
    let mut backoff = policy.clone();
    backoff.reset();

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                log::warn!("⚠️  {} failed transiently: {}", what, e);
                if backoff.sleep().await.is_err() {
                    log::error!("❌ {} still failing after {} retries", what, backoff.attempts());
                    return Err(e);
                }
            }
            Err(e) => return Err(e),
        }
    }
}
