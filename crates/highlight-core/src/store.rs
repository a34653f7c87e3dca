//! Subscription store contract and an in-memory implementation.
//!
//! The store is the source of truth for who is subscribed to what. Worker
//! units only ever hold copies of it, rebuilt with [`snapshot_for`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::BoxFuture;
use crate::index::IndexSnapshot;
use crate::trigger::TriggerKind;

/// One user's triggers within one guild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub guild_id: String,
    pub user_id: String,
    #[serde(default)]
    pub words: Vec<String>,
    #[serde(default)]
    pub patterns: Vec<String>,
}

impl Subscription {
    /// A subscription with no triggers yet.
    pub fn new(guild_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            guild_id: guild_id.into(),
            user_id: user_id.into(),
            words: Vec::new(),
            patterns: Vec::new(),
        }
    }

    /// Add a word or phrase trigger.
    pub fn with_word(mut self, word: impl Into<String>) -> Self {
        self.words.push(word.into());
        self
    }

    /// Add a regular-expression trigger.
    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.patterns.push(pattern.into());
        self
    }

    /// The triggers of one kind.
    pub fn triggers(&self, kind: TriggerKind) -> &[String] {
        match kind {
            TriggerKind::Word => &self.words,
            TriggerKind::RegularExpression => &self.patterns,
        }
    }

    fn is_empty(&self) -> bool {
        self.words.is_empty() && self.patterns.is_empty()
    }
}

/// Build the index slice one kind of unit needs.
pub fn snapshot_for(subscriptions: &[Subscription], kind: TriggerKind) -> IndexSnapshot {
    let mut snapshot = IndexSnapshot::new();
    for sub in subscriptions {
        for trigger in sub.triggers(kind) {
            snapshot
                .entry(sub.guild_id.clone())
                .or_default()
                .entry(trigger.clone())
                .or_default()
                .insert(sub.user_id.clone());
        }
    }
    snapshot
}

/// Errors from the subscription store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse subscriptions: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize subscriptions: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence collaborator consumed by the manager.
///
/// Object-safe so the manager can hold an `Arc<dyn SubscriptionStore>`.
pub trait SubscriptionStore: Send + Sync {
    /// Every subscription, for a full cache load.
    fn list_all(&self) -> BoxFuture<'_, Result<Vec<Subscription>, StoreError>>;

    /// Subscriptions in one guild.
    fn list_for_guild<'a>(
        &'a self,
        guild_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<Subscription>, StoreError>>;

    /// Forget one user's trigger, e.g. after it was found to be invalid.
    fn delete_trigger<'a>(
        &'a self,
        guild_id: &'a str,
        user_id: &'a str,
        trigger: &'a str,
    ) -> BoxFuture<'a, Result<(), StoreError>>;
}

/// On-disk layout of a subscriptions file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SubscriptionFile {
    #[serde(default)]
    subscriptions: Vec<Subscription>,
}

/// In-memory store, optionally persisted to a TOML file.
///
/// ## TOML Example
///
/// ```toml
/// [[subscriptions]]
/// guild_id = "1"
/// user_id = "42"
/// words = ["rust"]
/// patterns = ["(?i)crab(s)?"]
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
    path: Option<PathBuf>,
}

impl MemoryStore {
    /// A store that lives only in memory.
    pub fn new(subscriptions: Vec<Subscription>) -> Self {
        Self {
            subscriptions: Arc::new(Mutex::new(subscriptions)),
            path: None,
        }
    }

    /// Load from a subscriptions file; deletions are written back to it.
    pub async fn load(path: &Path) -> Result<Self, StoreError> {
        let content = tokio::fs::read_to_string(path).await?;
        let file: SubscriptionFile = toml::from_str(&content)?;
        info!(
            path = %path.display(),
            subscriptions = file.subscriptions.len(),
            "Subscriptions loaded"
        );
        Ok(Self {
            subscriptions: Arc::new(Mutex::new(file.subscriptions)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Snapshot of the current subscriptions.
    pub fn subscriptions(&self) -> Result<Vec<Subscription>, StoreError> {
        self.subscriptions
            .lock()
            .map(|subs| subs.clone())
            .map_err(|_| StoreError::Unavailable("subscription lock poisoned".to_string()))
    }

    /// Add or merge a subscription.
    pub fn upsert(&self, subscription: Subscription) -> Result<(), StoreError> {
        let mut subs = self
            .subscriptions
            .lock()
            .map_err(|_| StoreError::Unavailable("subscription lock poisoned".to_string()))?;
        match subs
            .iter_mut()
            .find(|s| s.guild_id == subscription.guild_id && s.user_id == subscription.user_id)
        {
            Some(existing) => {
                for word in subscription.words {
                    if !existing.words.contains(&word) {
                        existing.words.push(word);
                    }
                }
                for pattern in subscription.patterns {
                    if !existing.patterns.contains(&pattern) {
                        existing.patterns.push(pattern);
                    }
                }
            }
            None => subs.push(subscription),
        }
        Ok(())
    }

    fn remove(&self, guild_id: &str, user_id: &str, trigger: &str) -> Result<bool, StoreError> {
        let mut subs = self
            .subscriptions
            .lock()
            .map_err(|_| StoreError::Unavailable("subscription lock poisoned".to_string()))?;

        let mut removed = false;
        for sub in subs
            .iter_mut()
            .filter(|s| s.guild_id == guild_id && s.user_id == user_id)
        {
            let before = sub.words.len() + sub.patterns.len();
            sub.words.retain(|w| w != trigger);
            sub.patterns.retain(|p| p != trigger);
            removed |= sub.words.len() + sub.patterns.len() != before;
        }
        subs.retain(|s| !s.is_empty());
        Ok(removed)
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = SubscriptionFile {
            subscriptions: self.subscriptions()?,
        };
        let content = toml::to_string_pretty(&file)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }
}

impl SubscriptionStore for MemoryStore {
    fn list_all(&self) -> BoxFuture<'_, Result<Vec<Subscription>, StoreError>> {
        Box::pin(async move { self.subscriptions() })
    }

    fn list_for_guild<'a>(
        &'a self,
        guild_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<Subscription>, StoreError>> {
        Box::pin(async move {
            let mut subs = self.subscriptions()?;
            subs.retain(|s| s.guild_id == guild_id);
            Ok(subs)
        })
    }

    fn delete_trigger<'a>(
        &'a self,
        guild_id: &'a str,
        user_id: &'a str,
        trigger: &'a str,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            if self.remove(guild_id, user_id, trigger)? {
                info!(guild = %guild_id, user = %user_id, trigger = %trigger, "Trigger deleted");
                self.persist().await?;
            }
            Ok(())
        })
    }
}
