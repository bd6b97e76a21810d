//! # Overlap Tracker Pipeline
//!
//! Samples chat audiences of the top live channels and turns them into
//! pairwise overlap counts.
//!
//! ## Architecture
//!
//! ```text
//! UpstreamApi::fetch_top_channels()
//!     ↓
//! IterationController (Idle → Collecting)
//!     ↓
//! RoundRobinScheduler (one audience fetch per tick)
//!     ↓
//! SnapshotStore (set union per channel, optional spool)
//!     ↓  pass complete → Draining
//! IterationController (iteration++, durable IterationState)
//!     ↓  every N passes → Flushing
//! OverlapEngine::compute_concurrent()
//!     ↓
//! OverlapDbWriter → SQLite (overlap_<channel>, users, streams, iterations)
//! ```
//!
//! ## Key Principle
//!
//! Audience member lists are never persisted relationally. They live in the
//! snapshot store (and its spool) for one flush window only; only the derived
//! overlap counts reach the database.
//!
//! ## Module Organization
//!
//! - `types` - Channel, ChatterSnapshot, OverlapEntry, IterationState
//! - `error` - Error taxonomy (fetch, upstream, database, state)
//! - `config` - Environment configuration
//! - `backoff` - Exponential backoff for transient writes
//! - `snapshot_store` - Per-window audience sets + SnapshotSink trait
//! - `overlap` - Pairwise intersection engine
//! - `scheduler` - Round-robin queue and tick driver
//! - `state_store` - Durable IterationState
//! - `db` - SQLite writer trait and implementation
//! - `upstream` - Twitch Helix/TMI client
//! - `controller` - Iteration/flush state machine

pub mod backoff;
pub mod config;
pub mod controller;
pub mod db;
pub mod error;
pub mod overlap;
pub mod scheduler;
pub mod snapshot_store;
pub mod state_store;
pub mod types;
pub mod upstream;

// Re-export commonly used types
pub use config::TrackerConfig;
pub use controller::{ControllerPhase, IterationController, PassOutcome};
pub use db::{OverlapDbWriter, SqliteOverlapWriter};
pub use error::{DbError, FetchError, StateError, TrackerError, UpstreamError};
pub use overlap::OverlapEngine;
pub use scheduler::{PassReport, RoundRobinScheduler, ScraperQueueState};
pub use snapshot_store::{SnapshotSink, SnapshotStore};
pub use state_store::{IterationStateStore, JsonFileStateStore};
pub use types::{
    AudienceSample, Channel, ChannelMetadata, ChatterSnapshot, IterationState, OverlapEntry,
    TopChannel,
};
pub use upstream::{HelixClient, UpstreamApi};
