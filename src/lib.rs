//! chatterflow - audience overlap tracker for live broadcast channels
//!
//! Samples the chatters of the current top channels on a rotating schedule and
//! periodically persists pairwise audience-overlap counts to SQLite.
//!
//! See [`tracker`] for the collection pipeline.

pub mod tracker;
