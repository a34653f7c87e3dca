//! Worker units: one isolated matching thread per trigger kind.
//!
//! A unit owns a [`MatchEngine`] outright; nothing else can reach its index.
//! The manager talks to it only through [`WorkerCommand`]s and hears back
//! through [`WorkerEvent`]s, so a slow or panicking scan stalls only its own
//! unit. Commands are processed one at a time in FIFO order.
//!
//! ## Lifecycle
//!
//! ```text
//! Starting ──Ready──▶ Ready ──panic──▶ Crashed ──respawn──▶ Starting
//!                       │
//!                       └──terminate──▶ Destroyed
//! ```
//!
//! Unit exit, including a panic unwinding through the run loop, is reported
//! by a drop guard as [`WorkerEvent::Exited`].

use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use tokio::sync::mpsc;
use tracing::{debug, info};

use highlight_config::PatternsConfig;

use crate::engine::{InvalidTrigger, MatchEngine, ParseOutcome};
use crate::index::{GuildTriggers, IndexSnapshot};
use crate::trigger::TriggerKind;

/// One message to scan, shared between both units of a broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub guild_id: String,
    pub author_id: String,
    pub message_id: String,
    pub content: String,
}

/// Commands accepted by a unit in the `Ready` state.
#[derive(Debug, Clone)]
pub enum WorkerCommand {
    /// Replace the whole index.
    LoadAll(IndexSnapshot),
    /// Replace one guild's map.
    ReplaceGuild {
        guild_id: String,
        triggers: GuildTriggers,
    },
    /// Merge triggers for one user into a guild.
    Subscribe {
        guild_id: String,
        user_id: String,
        triggers: Vec<String>,
    },
    /// Drop one user's subscription to one trigger.
    RemoveTrigger {
        guild_id: String,
        user_id: String,
        trigger: String,
    },
    /// Scan a message and reply with [`WorkerEvent::ScanComplete`].
    Scan(Arc<ScanRequest>),
    /// Check whether a pattern compiles; reply with [`WorkerEvent::Validated`].
    Validate { input: String },
    /// Stop the unit after the commands queued before this one.
    Shutdown,
    #[cfg(test)]
    Crash,
}

/// Messages a unit sends back to the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Ready {
        kind: TriggerKind,
        generation: u64,
    },
    InvalidPattern(InvalidTrigger),
    ScanComplete {
        kind: TriggerKind,
        generation: u64,
        message_id: String,
        outcome: ParseOutcome,
    },
    Validated {
        input: String,
        valid: bool,
    },
    Exited {
        kind: TriggerKind,
        generation: u64,
        crashed: bool,
    },
}

/// Supervision state of a unit slot, as tracked by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Ready,
    Crashed,
    Destroyed,
}

/// Errors from spawning or addressing a unit.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("{0} worker is not accepting commands")]
    Disconnected(TriggerKind),
}

/// Handle to a running unit.
pub struct WorkerUnit {
    kind: TriggerKind,
    generation: u64,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    halted: Arc<AtomicBool>,
    thread: thread::JoinHandle<()>,
}

impl WorkerUnit {
    /// Start a unit with an empty index on its own thread.
    pub fn spawn(
        kind: TriggerKind,
        generation: u64,
        config: &PatternsConfig,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<Self, WorkerError> {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let halted = Arc::new(AtomicBool::new(false));

        let runtime = WorkerRuntime {
            generation,
            engine: MatchEngine::new(kind, config),
            events,
            halted: Arc::clone(&halted),
        };
        let thread = thread::Builder::new()
            .name(format!("highlight-worker-{kind}"))
            .spawn(move || runtime.run(command_rx))?;

        Ok(Self {
            kind,
            generation,
            commands,
            halted,
            thread,
        })
    }

    /// The trigger kind this unit matches.
    pub fn kind(&self) -> TriggerKind {
        self.kind
    }

    /// Spawn count of this unit's slot, starting at 1.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue a command behind everything already sent to this unit.
    pub fn send(&self, command: WorkerCommand) -> Result<(), WorkerError> {
        self.commands
            .send(command)
            .map_err(|_| WorkerError::Disconnected(self.kind))
    }

    /// Stop the unit without draining its queue.
    ///
    /// A scan already running finishes; nothing queued after it runs.
    pub fn terminate(&self) {
        self.halted.store(true, Ordering::Release);
        let _ = self.commands.send(WorkerCommand::Shutdown);
    }

    /// Whether the unit's thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }
}

/// State living on the unit's thread.
struct WorkerRuntime {
    generation: u64,
    engine: MatchEngine,
    events: mpsc::UnboundedSender<WorkerEvent>,
    halted: Arc<AtomicBool>,
}

impl WorkerRuntime {
    fn run(mut self, mut commands: mpsc::UnboundedReceiver<WorkerCommand>) {
        let kind = self.engine.kind();
        let _guard = ExitGuard {
            kind,
            generation: self.generation,
            events: self.events.clone(),
        };

        info!(kind = %kind, generation = self.generation, "Worker unit started");
        if self
            .emit(WorkerEvent::Ready {
                kind,
                generation: self.generation,
            })
            .is_break()
        {
            return;
        }

        while let Some(command) = commands.blocking_recv() {
            if self.halted.load(Ordering::Acquire) {
                break;
            }
            if self.handle(command).is_break() {
                break;
            }
        }

        info!(kind = %kind, generation = self.generation, "Worker unit stopped");
    }

    fn handle(&mut self, command: WorkerCommand) -> ControlFlow<()> {
        let kind = self.engine.kind();
        match command {
            WorkerCommand::LoadAll(snapshot) => {
                self.engine.index_mut().replace_all(snapshot);
                debug!(
                    kind = %kind,
                    guilds = self.engine.index().guild_count(),
                    triggers = self.engine.index().trigger_count(),
                    "Index loaded"
                );
            }
            WorkerCommand::ReplaceGuild { guild_id, triggers } => {
                debug!(kind = %kind, guild = %guild_id, triggers = triggers.len(), "Guild replaced");
                self.engine.index_mut().replace_guild(&guild_id, triggers);
            }
            WorkerCommand::Subscribe {
                guild_id,
                user_id,
                triggers,
            } => {
                self.engine
                    .index_mut()
                    .add_subscriptions(&guild_id, &user_id, &triggers);
            }
            WorkerCommand::RemoveTrigger {
                guild_id,
                user_id,
                trigger,
            } => {
                if self
                    .engine
                    .index_mut()
                    .remove_subscriber(&guild_id, &trigger, &user_id)
                {
                    debug!(kind = %kind, guild = %guild_id, user = %user_id, "Trigger removed");
                }
            }
            WorkerCommand::Scan(request) => {
                let scan =
                    self.engine
                        .parse(&request.guild_id, &request.author_id, &request.content);
                for invalid in scan.invalid {
                    self.emit(WorkerEvent::InvalidPattern(invalid))?;
                }
                self.emit(WorkerEvent::ScanComplete {
                    kind,
                    generation: self.generation,
                    message_id: request.message_id.clone(),
                    outcome: scan.outcome,
                })?;
            }
            WorkerCommand::Validate { input } => {
                let valid = self.engine.validate(&input);
                self.emit(WorkerEvent::Validated { input, valid })?;
            }
            WorkerCommand::Shutdown => return ControlFlow::Break(()),
            #[cfg(test)]
            WorkerCommand::Crash => panic!("{kind} worker crash requested"),
        }
        ControlFlow::Continue(())
    }

    /// Send an event; a closed channel means the manager is gone.
    fn emit(&self, event: WorkerEvent) -> ControlFlow<()> {
        match self.events.send(event) {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(()),
        }
    }
}

/// Reports unit exit, including exit by panic.
struct ExitGuard {
    kind: TriggerKind,
    generation: u64,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let _ = self.events.send(WorkerEvent::Exited {
            kind: self.kind,
            generation: self.generation,
            crashed: thread::panicking(),
        });
    }
}
