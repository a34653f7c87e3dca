//! Per-guild inverted index: trigger → subscribed users.
//!
//! The index is a local copy of the subscription store and may lag behind it,
//! so every mutation treats a missing guild, trigger, or user as a no-op.
//! Empty subscriber sets and empty guilds are pruned eagerly, keeping the
//! index proportional to live configuration.
//!
//! Ordered maps give deterministic iteration, which fixes the order in which
//! first-match-wins deduplication sees triggers and subscribers.

use std::collections::{BTreeMap, BTreeSet};

/// One guild's trigger → subscribers map.
pub type GuildTriggers = BTreeMap<String, BTreeSet<String>>;

/// Guild id → that guild's triggers. Used for full and partial resyncs.
pub type IndexSnapshot = BTreeMap<String, GuildTriggers>;

/// Inverted index for one trigger kind.
#[derive(Debug, Default, Clone)]
pub struct GuildIndex {
    guilds: IndexSnapshot,
}

impl GuildIndex {
    /// An empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entire index with a fresh snapshot.
    pub fn replace_all(&mut self, snapshot: IndexSnapshot) {
        self.guilds.clear();
        for (guild_id, triggers) in snapshot {
            self.replace_guild(&guild_id, triggers);
        }
    }

    /// Overwrite one guild's map. Does not merge with what was there.
    pub fn replace_guild(&mut self, guild_id: &str, mut triggers: GuildTriggers) {
        triggers.retain(|_, subscribers| !subscribers.is_empty());
        if triggers.is_empty() {
            self.guilds.remove(guild_id);
        } else {
            self.guilds.insert(guild_id.to_string(), triggers);
        }
    }

    /// Subscribe `user_id` to `trigger`, creating the entry if absent.
    pub fn add_subscriber(&mut self, guild_id: &str, trigger: &str, user_id: &str) {
        self.guilds
            .entry(guild_id.to_string())
            .or_default()
            .entry(trigger.to_string())
            .or_default()
            .insert(user_id.to_string());
    }

    /// Merge many triggers for one user into a guild.
    pub fn add_subscriptions<I, T>(&mut self, guild_id: &str, user_id: &str, triggers: I)
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        for trigger in triggers {
            self.add_subscriber(guild_id, trigger.as_ref(), user_id);
        }
    }

    /// Unsubscribe `user_id` from `trigger`, pruning emptied entries.
    ///
    /// Returns whether the user was subscribed.
    pub fn remove_subscriber(&mut self, guild_id: &str, trigger: &str, user_id: &str) -> bool {
        let Some(triggers) = self.guilds.get_mut(guild_id) else {
            return false;
        };
        let Some(subscribers) = triggers.get_mut(trigger) else {
            return false;
        };

        let removed = subscribers.remove(user_id);
        if subscribers.is_empty() {
            triggers.remove(trigger);
        }
        if triggers.is_empty() {
            self.guilds.remove(guild_id);
        }
        removed
    }

    /// Drop a trigger with all its subscribers, returning them.
    pub fn remove_trigger(&mut self, guild_id: &str, trigger: &str) -> Option<BTreeSet<String>> {
        let triggers = self.guilds.get_mut(guild_id)?;
        let subscribers = triggers.remove(trigger);
        if triggers.is_empty() {
            self.guilds.remove(guild_id);
        }
        subscribers
    }

    /// One guild's triggers, if it has any.
    pub fn guild(&self, guild_id: &str) -> Option<&GuildTriggers> {
        self.guilds.get(guild_id)
    }

    /// Number of guilds with at least one trigger.
    pub fn guild_count(&self) -> usize {
        self.guilds.len()
    }

    /// Total number of (guild, trigger) entries.
    pub fn trigger_count(&self) -> usize {
        self.guilds.values().map(BTreeMap::len).sum()
    }

    /// Whether no guild has any trigger.
    pub fn is_empty(&self) -> bool {
        self.guilds.is_empty()
    }

    /// Drop every guild.
    pub fn clear(&mut self) {
        self.guilds.clear();
    }
}
