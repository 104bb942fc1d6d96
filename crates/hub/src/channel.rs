// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory room membership, orthogonal to the subscription index.
//!
//! Channels are ad-hoc, non-durable groupings. Both directions are indexed
//! (channel → members and client → channels) so a disconnecting client is
//! removed in O(channels it joined); empty sets are reaped immediately.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

#[derive(Default)]
pub struct ChannelManager {
    channels: RwLock<HashMap<String, HashSet<String>>>,
    client_channels: RwLock<HashMap<String, HashSet<String>>>,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `client_id` to `channel`. Idempotent.
    pub fn join_channel(&self, client_id: &str, channel: &str) {
        let inserted = self
            .channels
            .write()
            .entry(channel.to_owned())
            .or_default()
            .insert(client_id.to_owned());
        self.client_channels
            .write()
            .entry(client_id.to_owned())
            .or_default()
            .insert(channel.to_owned());
        if inserted {
            tracing::debug!(client_id, channel, "client joined channel");
        }
    }

    /// Remove `client_id` from `channel`, reaping empty sets.
    pub fn leave_channel(&self, client_id: &str, channel: &str) {
        let mut channels = self.channels.write();
        if let Some(members) = channels.get_mut(channel) {
            if members.remove(client_id) {
                tracing::debug!(client_id, channel, "client left channel");
            }
            if members.is_empty() {
                channels.remove(channel);
            }
        }
        drop(channels);

        let mut reverse = self.client_channels.write();
        if let Some(joined) = reverse.get_mut(client_id) {
            joined.remove(channel);
            if joined.is_empty() {
                reverse.remove(client_id);
            }
        }
    }

    /// Current members of a channel (empty when the channel does not exist).
    pub fn channel_members(&self, channel: &str) -> Vec<String> {
        self.channels
            .read()
            .get(channel)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Channels a client has joined.
    pub fn client_channels(&self, client_id: &str) -> Vec<String> {
        self.client_channels
            .read()
            .get(client_id)
            .map(|joined| joined.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_in_channel(&self, client_id: &str, channel: &str) -> bool {
        self.channels
            .read()
            .get(channel)
            .is_some_and(|members| members.contains(client_id))
    }

    /// Drop every membership of a disconnecting client.
    pub fn remove_client(&self, client_id: &str) {
        let joined = match self.client_channels.write().remove(client_id) {
            Some(joined) => joined,
            None => return,
        };
        let mut channels = self.channels.write();
        for channel in joined {
            if let Some(members) = channels.get_mut(&channel) {
                members.remove(client_id);
                if members.is_empty() {
                    channels.remove(&channel);
                }
            }
        }
        tracing::debug!(client_id, "client removed from all channels");
    }

    /// Number of live channels (test observability).
    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }
}

#[cfg(test)]
#[path = "channel_tests.rs"]
mod tests;
