//! Highlight manager: owns the worker units and joins their replies.
//!
//! [`HighlightManager`] is a cheap handle; all bookkeeping lives in a
//! coordinator task that is the only owner of the unit handles, the pending
//! scans, and the pending validations. Callers, units, and timers reach it
//! only through channels.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  ManagerCommand   ┌───────────────┐  WorkerCommand   ┌──────────────┐
//! │ Highlight-   │──────────────────▶│  Coordinator  │─────────────────▶│ word unit    │
//! │ Manager      │◀── oneshot ───────│  (tokio task) │─────────────────▶│ regex unit   │
//! └──────────────┘                   └───────▲───────┘                  └──────┬───────┘
//!                                            │          WorkerEvent            │
//!                                            └─────────────────────────────────┘
//! ```
//!
//! Every scan and validation carries a deadline, so a unit that dies or hangs
//! never leaves a caller waiting forever.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use highlight_config::AppConfig;

use crate::engine::{HighlightResult, InvalidTrigger, ParseOutcome};
use crate::index::IndexSnapshot;
use crate::store::{StoreError, Subscription, SubscriptionStore, snapshot_for};
use crate::trigger::TriggerKind;
use crate::worker::{ScanRequest, WorkerCommand, WorkerError, WorkerEvent, WorkerState, WorkerUnit};

/// Errors surfaced to manager callers.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("highlight manager is shut down")]
    ShuttingDown,

    #[error("validation of {input:?} timed out after {timeout:?}")]
    ValidationTimedOut { input: String, timeout: Duration },

    #[error("{0} worker is unavailable")]
    WorkerUnavailable(TriggerKind),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Combined highlights for one message, one outcome per kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageHighlights {
    pub message_id: String,
    pub words: ParseOutcome,
    pub patterns: ParseOutcome,
    /// `false` when a unit did not reply in time or crashed; its outcome is
    /// then empty.
    pub complete: bool,
}

impl MessageHighlights {
    /// The outcome of one kind's scan.
    pub fn outcome(&self, kind: TriggerKind) -> &ParseOutcome {
        match kind {
            TriggerKind::Word => &self.words,
            TriggerKind::RegularExpression => &self.patterns,
        }
    }

    /// Every result, words first.
    pub fn results(&self) -> impl Iterator<Item = (TriggerKind, &HighlightResult)> {
        TriggerKind::ALL
            .into_iter()
            .flat_map(move |kind| self.outcome(kind).results.iter().map(move |r| (kind, r)))
    }

    /// Whether neither kind produced a highlight.
    pub fn is_empty(&self) -> bool {
        self.words.is_empty() && self.patterns.is_empty()
    }
}

/// Supervision snapshot of one unit slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStatus {
    pub kind: TriggerKind,
    pub state: WorkerState,
    pub generation: u64,
}

/// Supervision snapshot of the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerStatus {
    pub workers: Vec<WorkerStatus>,
    pub pending_scans: usize,
    pub pending_validations: usize,
}

impl ManagerStatus {
    /// The slot for one kind.
    pub fn worker(&self, kind: TriggerKind) -> Option<&WorkerStatus> {
        self.workers.iter().find(|w| w.kind == kind)
    }
}

enum ManagerCommand {
    Submit {
        request: ScanRequest,
        reply: oneshot::Sender<MessageHighlights>,
    },
    Route {
        kind: TriggerKind,
        command: WorkerCommand,
    },
    Validate {
        input: String,
        reply: oneshot::Sender<Result<bool, ManagerError>>,
    },
    Status {
        reply: oneshot::Sender<ManagerStatus>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Messages the coordinator sends itself from timers and store tasks.
enum Internal {
    ExpireScan {
        message_id: String,
        seq: u64,
    },
    ExpireValidation {
        input: String,
        seq: u64,
    },
    Resync {
        kind: TriggerKind,
        generation: u64,
        /// Slot epoch when the store fetch started.
        epoch: u64,
        snapshot: IndexSnapshot,
    },
}

/// Handle to the matching subsystem.
///
/// Dropping the handle shuts the subsystem down as [`destroy`](Self::destroy)
/// does.
pub struct HighlightManager {
    commands: mpsc::UnboundedSender<ManagerCommand>,
    store: Arc<dyn SubscriptionStore>,
}

impl HighlightManager {
    /// Spawn both units and the coordinator, then load every subscription.
    pub async fn start(
        config: AppConfig,
        store: Arc<dyn SubscriptionStore>,
    ) -> Result<Self, ManagerError> {
        // Unbounded: the coordinator never awaits a unit and units never block
        // on the coordinator.
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let (internal, internal_rx) = mpsc::unbounded_channel();

        let coordinator = Coordinator::new(config, Arc::clone(&store), events, internal)?;
        tokio::spawn(coordinator.run(command_rx, events_rx, internal_rx));

        let manager = Self { commands, store };
        if let Err(e) = manager.update_all_caches().await {
            manager.destroy().await;
            return Err(e);
        }
        info!("Highlight manager started");
        Ok(manager)
    }

    /// Terminate both units and stop respawning them. Idempotent.
    ///
    /// Requests still in flight fail with [`ManagerError::ShuttingDown`].
    pub async fn destroy(&self) {
        let (done, done_rx) = oneshot::channel();
        if self.send(ManagerCommand::Shutdown { done }).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Find every highlight a message triggers.
    ///
    /// Resolves once both units replied, or after the scan deadline with
    /// whatever arrived (`complete == false`).
    pub async fn submit_message(
        &self,
        guild_id: impl Into<String>,
        author_id: impl Into<String>,
        message_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<MessageHighlights, ManagerError> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(ManagerCommand::Submit {
            request: ScanRequest {
                guild_id: guild_id.into(),
                author_id: author_id.into(),
                message_id: message_id.into(),
                content: content.into(),
            },
            reply,
        })?;
        reply_rx.await.map_err(|_| ManagerError::ShuttingDown)
    }

    /// Reload every unit's index from the store.
    pub async fn update_all_caches(&self) -> Result<(), ManagerError> {
        let subscriptions = self.store.list_all().await?;
        for kind in TriggerKind::ALL {
            let snapshot = snapshot_for(&subscriptions, kind);
            self.route(kind, WorkerCommand::LoadAll(snapshot))?;
        }
        info!(subscriptions = subscriptions.len(), "All caches updated");
        Ok(())
    }

    /// Reload one guild's slice of every unit's index from the store.
    pub async fn update_cache_for_guild(&self, guild_id: &str) -> Result<(), ManagerError> {
        let subscriptions = self.store.list_for_guild(guild_id).await?;
        for kind in TriggerKind::ALL {
            let triggers = snapshot_for(&subscriptions, kind)
                .remove(guild_id)
                .unwrap_or_default();
            self.route(
                kind,
                WorkerCommand::ReplaceGuild {
                    guild_id: guild_id.to_string(),
                    triggers,
                },
            )?;
        }
        debug!(guild = %guild_id, "Guild cache updated");
        Ok(())
    }

    /// Merge a freshly stored subscription into the units without a resync.
    pub fn subscribe_user(&self, subscription: &Subscription) -> Result<(), ManagerError> {
        for kind in TriggerKind::ALL {
            let triggers = subscription.triggers(kind);
            if triggers.is_empty() {
                continue;
            }
            self.route(
                kind,
                WorkerCommand::Subscribe {
                    guild_id: subscription.guild_id.clone(),
                    user_id: subscription.user_id.clone(),
                    triggers: triggers.to_vec(),
                },
            )?;
        }
        Ok(())
    }

    /// Drop one user's trigger from every unit; only the owning kind acts.
    pub fn remove_trigger_for_user(
        &self,
        guild_id: &str,
        user_id: &str,
        trigger: &str,
    ) -> Result<(), ManagerError> {
        for kind in TriggerKind::ALL {
            self.route(
                kind,
                WorkerCommand::RemoveTrigger {
                    guild_id: guild_id.to_string(),
                    user_id: user_id.to_string(),
                    trigger: trigger.to_string(),
                },
            )?;
        }
        Ok(())
    }

    /// Ask the regex unit whether `input` compiles.
    pub async fn validate_pattern(&self, input: impl Into<String>) -> Result<bool, ManagerError> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(ManagerCommand::Validate {
            input: input.into(),
            reply,
        })?;
        reply_rx.await.map_err(|_| ManagerError::ShuttingDown)?
    }

    /// Per-unit state and generation plus pending request counts.
    ///
    /// A unit whose respawn failed shows as `Crashed` until a later command
    /// respawns it.
    pub async fn status(&self) -> Result<ManagerStatus, ManagerError> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(ManagerCommand::Status { reply })?;
        reply_rx.await.map_err(|_| ManagerError::ShuttingDown)
    }

    fn route(&self, kind: TriggerKind, command: WorkerCommand) -> Result<(), ManagerError> {
        self.send(ManagerCommand::Route { kind, command })
    }

    fn send(&self, command: ManagerCommand) -> Result<(), ManagerError> {
        self.commands
            .send(command)
            .map_err(|_| ManagerError::ShuttingDown)
    }
}

/// A scan waiting for one reply per kind.
struct PendingScan {
    seq: u64,
    words: Option<ParseOutcome>,
    patterns: Option<ParseOutcome>,
    complete: bool,
    waiters: Vec<oneshot::Sender<MessageHighlights>>,
}

impl PendingScan {
    fn new(seq: u64, waiter: oneshot::Sender<MessageHighlights>) -> Self {
        Self {
            seq,
            words: None,
            patterns: None,
            complete: true,
            waiters: vec![waiter],
        }
    }

    /// Fill a kind's slot unless it already has a value. `replied` is false
    /// for placeholders standing in for a unit that will never answer.
    fn fill(&mut self, kind: TriggerKind, outcome: ParseOutcome, replied: bool) {
        let slot = match kind {
            TriggerKind::Word => &mut self.words,
            TriggerKind::RegularExpression => &mut self.patterns,
        };
        if slot.is_none() {
            *slot = Some(outcome);
            self.complete &= replied;
        }
    }

    fn missing(&self) -> Vec<TriggerKind> {
        let mut missing = Vec::new();
        if self.words.is_none() {
            missing.push(TriggerKind::Word);
        }
        if self.patterns.is_none() {
            missing.push(TriggerKind::RegularExpression);
        }
        missing
    }

    fn is_ready(&self) -> bool {
        self.words.is_some() && self.patterns.is_some()
    }

    fn resolve(self, message_id: String) {
        let highlights = MessageHighlights {
            message_id,
            complete: self.complete && self.words.is_some() && self.patterns.is_some(),
            words: self.words.unwrap_or_default(),
            patterns: self.patterns.unwrap_or_default(),
        };
        for waiter in self.waiters {
            let _ = waiter.send(highlights.clone());
        }
    }
}

struct PendingValidation {
    seq: u64,
    waiters: Vec<oneshot::Sender<Result<bool, ManagerError>>>,
}

struct WorkerSlot {
    state: WorkerState,
    generation: u64,
    unit: Option<WorkerUnit>,
    /// Bumped for every index mutation routed to the unit.
    epoch: u64,
    /// Epoch of the most recent full load.
    loaded_epoch: u64,
}

/// Owner of all manager state; runs as a single task.
struct Coordinator {
    config: AppConfig,
    store: Arc<dyn SubscriptionStore>,
    slots: BTreeMap<TriggerKind, WorkerSlot>,
    pending: HashMap<String, PendingScan>,
    validations: HashMap<String, PendingValidation>,
    next_seq: u64,
    destroyed: bool,
    events: mpsc::UnboundedSender<WorkerEvent>,
    internal: mpsc::UnboundedSender<Internal>,
}

impl Coordinator {
    fn new(
        config: AppConfig,
        store: Arc<dyn SubscriptionStore>,
        events: mpsc::UnboundedSender<WorkerEvent>,
        internal: mpsc::UnboundedSender<Internal>,
    ) -> Result<Self, ManagerError> {
        let mut coordinator = Self {
            config,
            store,
            slots: BTreeMap::new(),
            pending: HashMap::new(),
            validations: HashMap::new(),
            next_seq: 0,
            destroyed: false,
            events,
            internal,
        };
        for kind in TriggerKind::ALL {
            let unit = WorkerUnit::spawn(
                kind,
                1,
                &coordinator.config.patterns,
                coordinator.events.clone(),
            )?;
            coordinator.slots.insert(
                kind,
                WorkerSlot {
                    state: WorkerState::Starting,
                    generation: 1,
                    unit: Some(unit),
                    epoch: 0,
                    loaded_epoch: 0,
                },
            );
        }
        Ok(coordinator)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<ManagerCommand>,
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(ManagerCommand::Shutdown { done }) => {
                        self.shutdown();
                        // Later sends fail instead of queueing.
                        commands.close();
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(event) = events.recv() => self.handle_event(event),
                Some(message) = internal.recv() => self.handle_internal(message),
            }
        }
        info!("Highlight coordinator stopped");
    }

    fn handle_command(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::Submit { request, reply } => self.submit(request, reply),
            ManagerCommand::Route { kind, command } => {
                self.dispatch(kind, command);
            }
            ManagerCommand::Validate { input, reply } => self.validate(input, reply),
            ManagerCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
            ManagerCommand::Shutdown { done } => {
                self.shutdown();
                let _ = done.send(());
            }
        }
    }

    fn submit(&mut self, request: ScanRequest, reply: oneshot::Sender<MessageHighlights>) {
        if let Some(pending) = self.pending.get_mut(&request.message_id) {
            debug!(message_id = %request.message_id, "Joining in-flight scan");
            pending.waiters.push(reply);
            return;
        }

        let seq = self.next_seq();
        let mut pending = PendingScan::new(seq, reply);
        let request = Arc::new(request);
        for kind in TriggerKind::ALL {
            if !self.dispatch(kind, WorkerCommand::Scan(Arc::clone(&request))) {
                pending.fill(kind, ParseOutcome::default(), false);
            }
        }

        let message_id = request.message_id.clone();
        if pending.is_ready() {
            pending.resolve(message_id);
            return;
        }

        self.schedule(
            self.config.workers.scan_timeout(),
            Internal::ExpireScan {
                message_id: message_id.clone(),
                seq,
            },
        );
        self.pending.insert(message_id, pending);
    }

    fn validate(&mut self, input: String, reply: oneshot::Sender<Result<bool, ManagerError>>) {
        if let Some(pending) = self.validations.get_mut(&input) {
            pending.waiters.push(reply);
            return;
        }

        let kind = TriggerKind::RegularExpression;
        if !self.dispatch(kind, WorkerCommand::Validate { input: input.clone() }) {
            let _ = reply.send(Err(ManagerError::WorkerUnavailable(kind)));
            return;
        }

        let seq = self.next_seq();
        self.schedule(
            self.config.workers.validation_timeout(),
            Internal::ExpireValidation {
                input: input.clone(),
                seq,
            },
        );
        self.validations.insert(
            input,
            PendingValidation {
                seq,
                waiters: vec![reply],
            },
        );
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Ready { kind, generation } => {
                if let Some(slot) = self.slots.get_mut(&kind)
                    && slot.generation == generation
                    && slot.state == WorkerState::Starting
                {
                    slot.state = WorkerState::Ready;
                    info!(kind = %kind, generation, "Worker unit ready");
                }
            }
            WorkerEvent::InvalidPattern(invalid) => self.delete_invalid(invalid),
            WorkerEvent::ScanComplete {
                kind,
                message_id,
                outcome,
                ..
            } => {
                let Some(pending) = self.pending.get_mut(&message_id) else {
                    debug!(kind = %kind, message_id = %message_id, "Late scan reply dropped");
                    return;
                };
                pending.fill(kind, outcome, true);
                if pending.is_ready()
                    && let Some(pending) = self.pending.remove(&message_id)
                {
                    pending.resolve(message_id);
                }
            }
            WorkerEvent::Validated { input, valid } => {
                if let Some(pending) = self.validations.remove(&input) {
                    for waiter in pending.waiters {
                        let _ = waiter.send(Ok(valid));
                    }
                }
            }
            WorkerEvent::Exited {
                kind,
                generation,
                crashed,
            } => self.handle_exit(kind, generation, crashed),
        }
    }

    fn handle_exit(&mut self, kind: TriggerKind, generation: u64, crashed: bool) {
        if self.destroyed {
            return;
        }
        let Some(slot) = self.slots.get_mut(&kind) else {
            return;
        };
        if slot.generation != generation {
            return;
        }

        if crashed {
            error!(kind = %kind, generation, "Worker unit crashed, respawning");
        } else {
            warn!(kind = %kind, generation, "Worker unit exited unexpectedly, respawning");
        }
        slot.state = WorkerState::Crashed;
        if let Some(unit) = slot.unit.take() {
            unit.terminate();
        }

        self.abandon(kind);
        self.respawn(kind);
    }

    /// Give up on every reply the lost unit owed.
    fn abandon(&mut self, kind: TriggerKind) {
        let mut ready = Vec::new();
        for (message_id, pending) in &mut self.pending {
            pending.fill(kind, ParseOutcome::default(), false);
            if pending.is_ready() {
                ready.push(message_id.clone());
            }
        }
        for message_id in ready {
            if let Some(pending) = self.pending.remove(&message_id) {
                pending.resolve(message_id);
            }
        }

        if kind == TriggerKind::RegularExpression {
            for (_, pending) in self.validations.drain() {
                for waiter in pending.waiters {
                    let _ = waiter.send(Err(ManagerError::WorkerUnavailable(kind)));
                }
            }
        }
    }

    /// Replace a lost unit with the next generation.
    ///
    /// On spawn failure the slot stays `Crashed` with no unit; the next
    /// command dispatched to that kind tries again.
    fn respawn(&mut self, kind: TriggerKind) {
        let Some(slot) = self.slots.get_mut(&kind) else {
            return;
        };
        slot.generation += 1;
        let generation = slot.generation;

        match WorkerUnit::spawn(kind, generation, &self.config.patterns, self.events.clone()) {
            Ok(unit) => {
                slot.unit = Some(unit);
                slot.state = WorkerState::Starting;
            }
            Err(e) => {
                slot.state = WorkerState::Crashed;
                error!(kind = %kind, generation, error = %e, "Failed to respawn worker unit");
                return;
            }
        }

        if self.config.workers.resync_on_respawn {
            let epoch = slot.epoch;
            self.start_resync(kind, generation, epoch);
        }
    }

    /// Fetch every subscription and hand the unit's slice back as
    /// [`Internal::Resync`].
    fn start_resync(&self, kind: TriggerKind, generation: u64, epoch: u64) {
        let store = Arc::clone(&self.store);
        let internal = self.internal.clone();
        tokio::spawn(async move {
            match store.list_all().await {
                Ok(subscriptions) => {
                    let _ = internal.send(Internal::Resync {
                        kind,
                        generation,
                        epoch,
                        snapshot: snapshot_for(&subscriptions, kind),
                    });
                }
                Err(e) => warn!(kind = %kind, error = %e, "Resync after respawn failed"),
            }
        });
    }

    /// Apply a resync unless the unit's index moved on while it was fetched.
    ///
    /// A full load since the fetch supersedes it. A partial update since the
    /// fetch means the snapshot may be older than the unit, so fetch again.
    fn apply_resync(
        &mut self,
        kind: TriggerKind,
        generation: u64,
        epoch: u64,
        snapshot: IndexSnapshot,
    ) {
        let Some(slot) = self.slots.get(&kind) else {
            return;
        };
        if slot.generation != generation {
            debug!(kind = %kind, generation, "Resync for a replaced unit dropped");
            return;
        }
        if slot.loaded_epoch > epoch {
            debug!(kind = %kind, generation, "Resync superseded by a full load");
            return;
        }
        if slot.epoch != epoch {
            let current = slot.epoch;
            debug!(kind = %kind, generation, "Index changed during resync, fetching again");
            self.start_resync(kind, generation, current);
            return;
        }

        info!(kind = %kind, generation, guilds = snapshot.len(), "Resyncing respawned unit");
        self.dispatch(kind, WorkerCommand::LoadAll(snapshot));
    }

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::ExpireScan { message_id, seq } => {
                if self.pending.get(&message_id).is_some_and(|p| p.seq == seq)
                    && let Some(pending) = self.pending.remove(&message_id)
                {
                    warn!(
                        message_id = %message_id,
                        missing = ?pending.missing(),
                        "Scan timed out, resolving with partial results"
                    );
                    pending.resolve(message_id);
                }
            }
            Internal::ExpireValidation { input, seq } => {
                if self.validations.get(&input).is_some_and(|p| p.seq == seq)
                    && let Some(pending) = self.validations.remove(&input)
                {
                    let timeout = self.config.workers.validation_timeout();
                    warn!(input = %input, ?timeout, "Pattern validation timed out");
                    for waiter in pending.waiters {
                        let _ = waiter.send(Err(ManagerError::ValidationTimedOut {
                            input: input.clone(),
                            timeout,
                        }));
                    }
                }
            }
            Internal::Resync {
                kind,
                generation,
                epoch,
                snapshot,
            } => self.apply_resync(kind, generation, epoch, snapshot),
        }
    }

    fn delete_invalid(&self, invalid: InvalidTrigger) {
        warn!(
            guild = %invalid.guild_id,
            user = %invalid.user_id,
            trigger = %invalid.trigger,
            "Invalid pattern reported, deleting from store"
        );
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(e) = store
                .delete_trigger(&invalid.guild_id, &invalid.user_id, &invalid.trigger)
                .await
            {
                warn!(trigger = %invalid.trigger, error = %e, "Failed to delete invalid pattern");
            }
        });
    }

    /// Send a command to one unit. Returns whether it was queued.
    ///
    /// A slot left empty by a failed respawn is respawned first.
    fn dispatch(&mut self, kind: TriggerKind, command: WorkerCommand) -> bool {
        let needs_respawn = self
            .slots
            .get(&kind)
            .is_some_and(|slot| slot.unit.is_none() && slot.state == WorkerState::Crashed);
        if needs_respawn && !self.destroyed {
            self.respawn(kind);
        }

        let Some(slot) = self.slots.get_mut(&kind) else {
            return false;
        };
        let Some(unit) = slot.unit.as_ref() else {
            warn!(kind = %kind, "No live worker unit, command dropped");
            return false;
        };

        let full_load = matches!(command, WorkerCommand::LoadAll(_));
        let mutates = full_load
            || matches!(
                command,
                WorkerCommand::ReplaceGuild { .. }
                    | WorkerCommand::Subscribe { .. }
                    | WorkerCommand::RemoveTrigger { .. }
            );
        match unit.send(command) {
            Ok(()) => {
                if mutates {
                    slot.epoch += 1;
                }
                if full_load {
                    slot.loaded_epoch = slot.epoch;
                }
                true
            }
            Err(e) => {
                warn!(kind = %kind, error = %e, "Command dropped");
                false
            }
        }
    }

    fn schedule(&self, after: Duration, message: Internal) {
        let internal = self.internal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = internal.send(message);
        });
    }

    fn status(&self) -> ManagerStatus {
        ManagerStatus {
            workers: self
                .slots
                .iter()
                .map(|(kind, slot)| WorkerStatus {
                    kind: *kind,
                    state: slot.state,
                    generation: slot.generation,
                })
                .collect(),
            pending_scans: self.pending.len(),
            pending_validations: self.validations.len(),
        }
    }

    fn shutdown(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        for slot in self.slots.values_mut() {
            if let Some(unit) = slot.unit.take() {
                unit.terminate();
            }
            slot.state = WorkerState::Destroyed;
        }
        let abandoned = self.pending.len() + self.validations.len();
        self.pending.clear();
        self.validations.clear();
        info!(abandoned, "Highlight manager shut down");
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use highlight_test_utils::config::TestConfigBuilder;
    use pretty_assertions::assert_eq;

    struct Harness {
        coordinator: Coordinator,
        store: Arc<MemoryStore>,
        events: mpsc::UnboundedReceiver<WorkerEvent>,
        internal: mpsc::UnboundedReceiver<Internal>,
    }

    impl Harness {
        /// A coordinator driven by hand, with both units loaded and ready.
        async fn new(config: AppConfig, subscriptions: Vec<Subscription>) -> Self {
            let (events_tx, events) = mpsc::unbounded_channel();
            let (internal_tx, internal) = mpsc::unbounded_channel();
            let store = Arc::new(MemoryStore::new(subscriptions.clone()));
            let mut coordinator =
                Coordinator::new(config, store.clone(), events_tx, internal_tx).unwrap();
            for kind in TriggerKind::ALL {
                coordinator.dispatch(
                    kind,
                    WorkerCommand::LoadAll(snapshot_for(&subscriptions, kind)),
                );
            }
            let mut harness = Self {
                coordinator,
                store,
                events,
                internal,
            };
            harness.pump_until(|e| matches!(e, WorkerEvent::Ready { .. })).await;
            harness.pump_until(|e| matches!(e, WorkerEvent::Ready { .. })).await;
            harness
        }

        async fn pump_one(&mut self) {
            let event = self.events.recv().await.unwrap();
            self.coordinator.handle_event(event);
        }

        /// Feed unit events to the coordinator until one matches.
        async fn pump_until(&mut self, mut stop: impl FnMut(&WorkerEvent) -> bool) {
            loop {
                let event = self.events.recv().await.unwrap();
                let done = stop(&event);
                self.coordinator.handle_event(event);
                if done {
                    return;
                }
            }
        }

        /// Submit a scan and pump until it resolves.
        async fn scan(&mut self, message_id: &str, content: &str) -> MessageHighlights {
            let mut reply = self.submit(message_id, content);
            loop {
                if let Ok(highlights) = reply.try_recv() {
                    return highlights;
                }
                self.pump_one().await;
            }
        }

        /// Crash a unit and pump until its replacement holds the slot.
        async fn crash_and_respawn(&mut self, kind: TriggerKind) {
            let generation = self.generation(kind);
            self.coordinator.dispatch(kind, WorkerCommand::Crash);
            while self.generation(kind) == generation {
                self.pump_one().await;
            }
        }

        fn generation(&self, kind: TriggerKind) -> u64 {
            self.coordinator.status().worker(kind).unwrap().generation
        }

        fn submit(&mut self, message_id: &str, content: &str) -> oneshot::Receiver<MessageHighlights> {
            let (reply, reply_rx) = oneshot::channel();
            self.coordinator.handle_command(ManagerCommand::Submit {
                request: ScanRequest {
                    guild_id: "g1".to_string(),
                    author_id: "author".to_string(),
                    message_id: message_id.to_string(),
                    content: content.to_string(),
                },
                reply,
            });
            reply_rx
        }
    }

    fn subscriptions() -> Vec<Subscription> {
        vec![
            Subscription::new("g1", "u1").with_word("word"),
            Subscription::new("g1", "u2").with_pattern("w.rd"),
        ]
    }

    #[tokio::test]
    async fn test_replies_joined_in_any_order() {
        let mut h = Harness::new(AppConfig::default(), subscriptions()).await;
        let mut reply = h.submit("m1", "a word");

        h.pump_until(|e| matches!(e, WorkerEvent::ScanComplete { .. })).await;
        assert!(reply.try_recv().is_err());
        assert_eq!(h.coordinator.status().pending_scans, 1);

        h.pump_until(|e| matches!(e, WorkerEvent::ScanComplete { .. })).await;
        let highlights = reply.await.unwrap();
        assert!(highlights.complete);
        assert_eq!(highlights.words.matched_user_ids, vec!["u1"]);
        assert_eq!(highlights.patterns.matched_user_ids, vec!["u2"]);
        assert_eq!(h.coordinator.status().pending_scans, 0);
    }

    #[tokio::test]
    async fn test_same_message_joins_pending_scan() {
        let mut h = Harness::new(AppConfig::default(), subscriptions()).await;
        let first = h.submit("m1", "a word");
        let second = h.submit("m1", "a word");
        assert_eq!(h.coordinator.status().pending_scans, 1);

        h.pump_until(|e| matches!(e, WorkerEvent::ScanComplete { .. })).await;
        h.pump_until(|e| matches!(e, WorkerEvent::ScanComplete { .. })).await;
        assert_eq!(first.await.unwrap(), second.await.unwrap());
    }

    #[tokio::test]
    async fn test_scan_deadline_resolves_partial_results() {
        let config = TestConfigBuilder::new().scan_timeout_ms(20).build();
        let mut h = Harness::new(config, subscriptions()).await;
        let reply = h.submit("m1", "a word");

        // Only the word reply reaches the coordinator.
        loop {
            let event = h.events.recv().await.unwrap();
            if let WorkerEvent::ScanComplete { kind, .. } = &event {
                if *kind == TriggerKind::Word {
                    h.coordinator.handle_event(event);
                    break;
                }
            }
        }
        let expire = h.internal.recv().await.unwrap();
        h.coordinator.handle_internal(expire);

        let highlights = reply.await.unwrap();
        assert!(!highlights.complete);
        assert_eq!(highlights.words.matched_user_ids, vec!["u1"]);
        assert!(highlights.patterns.is_empty());
        assert_eq!(h.coordinator.status().pending_scans, 0);
    }

    #[tokio::test]
    async fn test_crash_resolves_pending_and_respawns() {
        let config = TestConfigBuilder::new().resync_on_respawn(false).build();
        let mut h = Harness::new(config, subscriptions()).await;

        h.coordinator
            .dispatch(TriggerKind::RegularExpression, WorkerCommand::Crash);
        let reply = h.submit("m1", "a word");

        // The dead unit may be noticed on dispatch or on its exit event.
        let respawned = |h: &Harness| {
            let status = h.coordinator.status();
            status.pending_scans == 0
                && status.worker(TriggerKind::RegularExpression).unwrap().generation == 2
        };
        while !respawned(&h) {
            h.pump_one().await;
        }

        let highlights = reply.await.unwrap();
        assert!(!highlights.complete);
        assert_eq!(highlights.words.matched_user_ids, vec!["u1"]);
        assert!(highlights.patterns.is_empty());

        while h.coordinator.status().worker(TriggerKind::RegularExpression).unwrap().state
            != WorkerState::Ready
        {
            h.pump_one().await;
        }
        let status = h.coordinator.status();
        assert_eq!(
            status.worker(TriggerKind::RegularExpression).unwrap().state,
            WorkerState::Ready
        );
        assert_eq!(
            status.worker(TriggerKind::Word).unwrap().generation,
            1
        );
    }

    fn fresh_pattern() -> Subscription {
        Subscription::new("g1", "u3").with_pattern("fresh")
    }

    #[tokio::test]
    async fn test_respawned_unit_resynced_from_store() {
        let mut h = Harness::new(AppConfig::default(), subscriptions()).await;
        h.crash_and_respawn(TriggerKind::RegularExpression).await;
        assert_eq!(h.generation(TriggerKind::RegularExpression), 2);

        let resync = h.internal.recv().await.unwrap();
        h.coordinator.handle_internal(resync);

        let highlights = h.scan("m1", "a word").await;
        assert!(highlights.complete);
        assert_eq!(highlights.patterns.matched_user_ids, vec!["u2"]);
    }

    #[tokio::test]
    async fn test_resync_for_replaced_unit_ignored() {
        let mut h = Harness::new(AppConfig::default(), subscriptions()).await;
        h.crash_and_respawn(TriggerKind::RegularExpression).await;
        let stale = h.internal.recv().await.unwrap();

        h.crash_and_respawn(TriggerKind::RegularExpression).await;
        assert_eq!(h.generation(TriggerKind::RegularExpression), 3);
        h.coordinator.handle_internal(stale);

        // Generation 3 has not been resynced, so nothing matches yet.
        let highlights = h.scan("m1", "a word").await;
        assert!(highlights.patterns.is_empty());
        assert_eq!(highlights.words.matched_user_ids, vec!["u1"]);
    }

    #[tokio::test]
    async fn test_resync_refetched_after_guild_update() {
        let mut h = Harness::new(AppConfig::default(), subscriptions()).await;
        h.crash_and_respawn(TriggerKind::RegularExpression).await;
        // Fetched before the store gained the new subscription.
        let outdated = h.internal.recv().await.unwrap();

        h.store.upsert(fresh_pattern()).unwrap();
        let triggers = snapshot_for(
            &h.store.subscriptions().unwrap(),
            TriggerKind::RegularExpression,
        )
        .remove("g1")
        .unwrap();
        h.coordinator.handle_command(ManagerCommand::Route {
            kind: TriggerKind::RegularExpression,
            command: WorkerCommand::ReplaceGuild {
                guild_id: "g1".to_string(),
                triggers,
            },
        });

        h.coordinator.handle_internal(outdated);
        let refetched = h.internal.recv().await.unwrap();
        assert!(matches!(refetched, Internal::Resync { generation: 2, .. }));
        h.coordinator.handle_internal(refetched);

        let highlights = h.scan("m1", "fresh").await;
        assert_eq!(highlights.patterns.matched_user_ids, vec!["u3"]);
        let highlights = h.scan("m2", "a word").await;
        assert_eq!(highlights.patterns.matched_user_ids, vec!["u2"]);
    }

    #[tokio::test]
    async fn test_resync_superseded_by_full_load() {
        let mut h = Harness::new(AppConfig::default(), subscriptions()).await;
        h.crash_and_respawn(TriggerKind::RegularExpression).await;
        let outdated = h.internal.recv().await.unwrap();

        let snapshot = snapshot_for(&[fresh_pattern()], TriggerKind::RegularExpression);
        h.coordinator.handle_command(ManagerCommand::Route {
            kind: TriggerKind::RegularExpression,
            command: WorkerCommand::LoadAll(snapshot),
        });
        h.coordinator.handle_internal(outdated);

        let highlights = h.scan("m1", "fresh word").await;
        assert_eq!(highlights.patterns.matched_user_ids, vec!["u3"]);
    }

    #[tokio::test]
    async fn test_failed_respawn_retried_on_dispatch() {
        let config = TestConfigBuilder::new().resync_on_respawn(false).build();
        let mut h = Harness::new(config, subscriptions()).await;

        // The state a failed spawn leaves behind.
        let slot = h
            .coordinator
            .slots
            .get_mut(&TriggerKind::RegularExpression)
            .unwrap();
        if let Some(unit) = slot.unit.take() {
            unit.terminate();
        }
        slot.state = WorkerState::Crashed;

        let highlights = h.scan("m1", "a word").await;
        assert!(highlights.complete);
        assert!(highlights.patterns.is_empty());
        assert_eq!(h.generation(TriggerKind::RegularExpression), 2);
    }

    #[tokio::test]
    async fn test_crash_fails_pending_validations() {
        let mut h = Harness::new(AppConfig::default(), subscriptions()).await;
        h.coordinator
            .dispatch(TriggerKind::RegularExpression, WorkerCommand::Crash);

        let (reply, reply_rx) = oneshot::channel();
        h.coordinator.handle_command(ManagerCommand::Validate {
            input: "a+".to_string(),
            reply,
        });
        h.pump_until(|e| matches!(e, WorkerEvent::Exited { .. })).await;

        match reply_rx.await.unwrap() {
            // The dead unit's channel may already be closed when dispatching.
            Err(ManagerError::WorkerUnavailable(kind)) => {
                assert_eq!(kind, TriggerKind::RegularExpression)
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_validation_deadline() {
        let config = TestConfigBuilder::new().validation_timeout_ms(10).build();
        let mut h = Harness::new(config, Vec::new()).await;

        let (reply, reply_rx) = oneshot::channel();
        h.coordinator.handle_command(ManagerCommand::Validate {
            input: "a+".to_string(),
            reply,
        });
        let expire = h.internal.recv().await.unwrap();
        h.coordinator.handle_internal(expire);

        assert!(matches!(
            reply_rx.await.unwrap(),
            Err(ManagerError::ValidationTimedOut { .. })
        ));
        assert_eq!(h.coordinator.status().pending_validations, 0);
    }

    #[tokio::test]
    async fn test_shutdown_abandons_requests() {
        let mut h = Harness::new(AppConfig::default(), subscriptions()).await;
        let reply = h.submit("m1", "a word");

        h.coordinator.shutdown();
        assert!(reply.await.is_err());

        let status = h.coordinator.status();
        assert!(
            status
                .workers
                .iter()
                .all(|w| w.state == WorkerState::Destroyed)
        );

        // Exits after destroy never respawn.
        h.coordinator
            .handle_exit(TriggerKind::Word, 1, true);
        assert_eq!(
            h.coordinator.status().worker(TriggerKind::Word).unwrap().generation,
            1
        );
    }

    #[test]
    fn test_message_highlights_results_words_first() {
        let outcome = |member: &str| ParseOutcome {
            results: vec![HighlightResult {
                member_id: member.to_string(),
                trigger: "t".to_string(),
                parsed_content: "c".to_string(),
            }],
            matched_user_ids: vec![member.to_string()],
        };
        let highlights = MessageHighlights {
            message_id: "m1".to_string(),
            words: outcome("u1"),
            patterns: outcome("u2"),
            complete: true,
        };

        let kinds: Vec<(TriggerKind, &str)> = highlights
            .results()
            .map(|(kind, r)| (kind, r.member_id.as_str()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (TriggerKind::Word, "u1"),
                (TriggerKind::RegularExpression, "u2")
            ]
        );
        assert!(!highlights.is_empty());
    }
}
