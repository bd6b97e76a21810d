//! Pairwise audience overlap engine
//!
//! For every channel `c` and every other channel `c'` computes
//! `|members(c) ∩ members(c')|`. Channels without a recorded snapshot are
//! treated as an empty audience (overlap 0 with everyone), not skipped.
//!
//! Complexity is O(n²·m). Intersections iterate the smaller set and look up in the
//! larger, so a pair costs O(min(|a|, |b|)).

use super::types::{Channel, OverlapEntry};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinSet;

/// Read-only member view, as produced by `SnapshotStore::read_all`
pub type SnapshotView = HashMap<Channel, Arc<HashSet<String>>>;

/// Overlap rows keyed by source channel, targets in channel order
pub type OverlapMap = BTreeMap<Channel, Vec<(Channel, u64)>>;

/// Stateless overlap calculator
#[derive(Debug, Clone, Copy, Default)]
pub struct OverlapEngine;

impl OverlapEngine {
    pub fn new() -> Self {
        Self
    }

    /// Size of the intersection of two member sets
    pub fn intersection_count(a: &HashSet<String>, b: &HashSet<String>) -> u64 {
        let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
        small.iter().filter(|member| large.contains(*member)).count() as u64
    }

    /// Compute overlaps on the calling thread
    ///
    /// Each unordered pair is intersected once and mirrored into both
    /// directional rows.
    pub fn compute_overlaps(&self, channels: &[Channel], snapshots: &SnapshotView) -> OverlapMap {
        let channels = dedup_sorted(channels);
        let empty = HashSet::new();

        let mut overlaps: OverlapMap = channels
            .iter()
            .map(|channel| (channel.clone(), Vec::with_capacity(channels.len().saturating_sub(1))))
            .collect();

        for (i, channel) in channels.iter().enumerate() {
            for other in &channels[i + 1..] {
                let count = Self::intersection_count(
                    members_of(snapshots, channel, &empty),
                    members_of(snapshots, other, &empty),
                );

                if let Some(row) = overlaps.get_mut(channel) {
                    row.push((other.clone(), count));
                }
                if let Some(row) = overlaps.get_mut(other) {
                    row.push((channel.clone(), count));
                }
            }
        }

        for row in overlaps.values_mut() {
            row.sort_by(|a, b| a.0.cmp(&b.0));
        }

        overlaps
    }

    /// Compute overlaps with one blocking task per source channel
    ///
    /// Tasks only read the shared view and each produces its own row, so no
    /// locking is needed. All tasks are joined before returning.
    pub async fn compute_concurrent(
        &self,
        channels: &[Channel],
        snapshots: Arc<SnapshotView>,
    ) -> Result<OverlapMap, tokio::task::JoinError> {
        let channels = Arc::new(dedup_sorted(channels));
        let mut tasks = JoinSet::new();

        for index in 0..channels.len() {
            let channels = Arc::clone(&channels);
            let snapshots = Arc::clone(&snapshots);

            tasks.spawn_blocking(move || {
                let empty = HashSet::new();
                let channel = &channels[index];
                let members = members_of(&snapshots, channel, &empty);

                let row: Vec<(Channel, u64)> = channels
                    .iter()
                    .filter(|other| *other != channel)
                    .map(|other| {
                        let other_members = members_of(&snapshots, other, &empty);
                        (other.clone(), Self::intersection_count(members, other_members))
                    })
                    .collect();

                (channel.clone(), row)
            });
        }

        let mut overlaps = OverlapMap::new();
        while let Some(joined) = tasks.join_next().await {
            let (channel, row) = joined?;
            log::debug!("🔗 Computed {} overlaps for {}", row.len(), channel);
            overlaps.insert(channel, row);
        }

        Ok(overlaps)
    }
}

/// Turn one channel's overlap row into persistable entries
pub fn build_entries(
    channel: &Channel,
    row: &[(Channel, u64)],
    total_chatters: u64,
) -> Vec<OverlapEntry> {
    row.iter()
        .map(|(other, count)| OverlapEntry {
            channel: channel.clone(),
            other_channel: other.clone(),
            overlap_count: *count,
            total_chatters_of_channel: total_chatters,
        })
        .collect()
}

fn members_of<'a>(
    snapshots: &'a SnapshotView,
    channel: &Channel,
    empty: &'a HashSet<String>,
) -> &'a HashSet<String> {
    snapshots.get(channel).map(|set| &**set).unwrap_or(empty)
}

fn dedup_sorted(channels: &[Channel]) -> Vec<Channel> {
    let mut channels = channels.to_vec();
    channels.sort();
    channels.dedup();
    channels
}
