//! Core data types for the overlap tracker
//!
//! These types flow between the upstream client, scheduler, snapshot store,
//! overlap engine and database writer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Maximum channel login length accepted by the platform
pub const MAX_CHANNEL_LEN: usize = 25;

/// Normalized broadcast channel identifier
///
/// Always lower case and restricted to `[a-z0-9_]{1,25}`. The restriction
/// matters because the identifier becomes part of a table name
/// (`overlap_<channel>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Channel(String);

/// Rejected channel identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidChannel(pub String);

impl fmt::Display for InvalidChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid channel identifier: {:?}", self.0)
    }
}

impl std::error::Error for InvalidChannel {}

impl Channel {
    /// Parse and normalize a raw channel name (case-insensitive)
    pub fn parse(raw: &str) -> Result<Self, InvalidChannel> {
        let normalized = raw.trim().to_lowercase();

        let valid = !normalized.is_empty()
            && normalized.len() <= MAX_CHANNEL_LEN
            && normalized
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

        if !valid {
            return Err(InvalidChannel(raw.to_string()));
        }

        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Channel {
    type Error = InvalidChannel;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Channel::parse(&value)
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

/// Raw audience fetch result for one channel
#[derive(Debug, Clone, PartialEq)]
pub struct AudienceSample {
    /// Chatter count as reported upstream
    pub total_count: u64,

    /// Chatter logins (not yet deduplicated)
    pub members: Vec<String>,
}

/// Audience set recorded for one channel within a flush window
///
/// Member sets are reference counted so the overlap engine can take a
/// consistent view without copying every set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatterSnapshot {
    pub channel: Channel,
    pub total_count: u64,
    pub members: Arc<HashSet<String>>,
}

impl ChatterSnapshot {
    /// Build a snapshot from a fetch result, lower-casing member names
    ///
    /// The total never drops below the distinct member count.
    pub fn from_sample(channel: Channel, sample: AudienceSample) -> Self {
        let members: HashSet<String> = sample
            .members
            .into_iter()
            .map(|m| m.trim().to_lowercase())
            .filter(|m| !m.is_empty())
            .collect();

        Self {
            channel,
            total_count: sample.total_count.max(members.len() as u64),
            members: Arc::new(members),
        }
    }

    /// Union `other` into this snapshot; total becomes the union size
    pub fn merge(&mut self, other: &ChatterSnapshot) {
        let members = Arc::make_mut(&mut self.members);
        members.extend(other.members.iter().cloned());
        self.total_count = members.len() as u64;
    }
}

/// One directional overlap row (`channel` → `other_channel`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlapEntry {
    pub channel: Channel,
    pub other_channel: Channel,
    pub overlap_count: u64,
    pub total_chatters_of_channel: u64,
}

/// Durable collection progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationState {
    /// Completed passes since the tracker was first started
    pub iteration: u64,

    /// Completed passes since the last successful flush
    pub iterations_since_flush: u64,
}

/// Top live channel as returned by the upstream stream listing
#[derive(Debug, Clone, PartialEq)]
pub struct TopChannel {
    pub channel: Channel,
    pub category: String,
    pub category_id: String,
    pub title: String,
    pub viewer_count: u64,
    pub language: String,
    pub started_at: Option<DateTime<Utc>>,
}

impl TopChannel {
    /// Seconds the stream has been live at `now` (0 when unknown)
    pub fn uptime_secs(&self, now: DateTime<Utc>) -> i64 {
        self.started_at
            .map(|started| (now - started).num_seconds().max(0))
            .unwrap_or(0)
    }
}

/// Static channel profile, stored once per channel
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMetadata {
    pub channel: Channel,
    pub channel_id: String,
    pub description: String,
    pub creation_date: DateTime<Utc>,
}
