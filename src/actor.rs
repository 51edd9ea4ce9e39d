//! Actor loop that owns one aggregate instance and processes its commands.
//!
//! Each resident instance runs on its own thread and drains a bounded
//! `mpsc` mailbox one message at a time, so commands for one entity are
//! strictly serialized and at most one in-process writer exists per stream.
//! The instance is hydrated from its latest snapshot plus the journal tail
//! before the thread starts, passivates itself after an idle timeout, and
//! snapshots its state on the way out.
//!
//! Public API: [`AggregateHandle`]. Instances are spawned by the
//! [`AggregateStore`](crate::AggregateStore).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use crate::aggregate::Aggregate;
use crate::command::CommandContext;
use crate::config::RuntimeConfig;
use crate::error::{ExecuteError, JournalError, StateError};
use crate::event::{StreamId, decode_domain_event, encode_domain_event, shard_tag};
use crate::journal::{EventJournal, Snapshot};

/// Per-actor settings, taken from [`RuntimeConfig`].
#[derive(Debug, Clone)]
pub(crate) struct ActorConfig {
    pub idle_timeout: Duration,
    pub snapshot_every: u64,
    pub max_conflict_retries: u32,
    pub mailbox_capacity: usize,
    pub tag_count: u32,
}

impl From<&RuntimeConfig> for ActorConfig {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout,
            snapshot_every: config.snapshot_every,
            max_conflict_retries: config.max_conflict_retries,
            mailbox_capacity: config.mailbox_capacity.max(1),
            tag_count: config.tag_count,
        }
    }
}

type ExecuteResult<A> = Result<<A as Aggregate>::Reply, ExecuteError<<A as Aggregate>::Error>>;

pub(crate) enum ActorMessage<A: Aggregate> {
    Execute {
        cmd: A::Command,
        ctx: CommandContext,
        reply: oneshot::Sender<ExecuteResult<A>>,
    },
    GetState {
        reply: oneshot::Sender<Result<A, StateError>>,
    },
    /// Finish queued messages, snapshot, and exit.
    Shutdown,
}

/// The in-memory incarnation of one aggregate instance.
struct Instance<A: Aggregate> {
    stream: StreamId,
    tag: u32,
    state: A,
    /// Last sequence number folded into `state`.
    sequence: u64,
    /// Events folded since the last snapshot.
    unsnapshotted: u64,
    journal: Arc<dyn EventJournal>,
    config: ActorConfig,
}

impl<A: Aggregate> Instance<A> {
    fn hydrate(
        journal: Arc<dyn EventJournal>,
        stream: StreamId,
        config: ActorConfig,
    ) -> Result<Self, JournalError> {
        let (state, sequence) = match journal.load_snapshot(&stream)? {
            Some(snapshot) => match serde_json::from_value::<A>(snapshot.state) {
                Ok(state) => (state, snapshot.sequence),
                Err(e) => {
                    tracing::warn!(
                        stream = %stream,
                        error = %e,
                        "snapshot does not match aggregate state; replaying from start"
                    );
                    (A::default(), 0)
                }
            },
            None => (A::default(), 0),
        };

        let mut instance = Self {
            tag: shard_tag(&stream.key, config.tag_count),
            stream,
            state,
            sequence,
            unsnapshotted: 0,
            journal,
            config,
        };
        let replayed = instance.catch_up()?;
        tracing::info!(
            stream = %instance.stream,
            snapshot_sequence = sequence,
            replayed,
            "actor activated"
        );
        Ok(instance)
    }

    /// Fold every journal event past `self.sequence` into state.
    fn catch_up(&mut self) -> Result<usize, JournalError> {
        let events = self.journal.read_stream(&self.stream, self.sequence + 1)?;
        let count = events.len();
        for stored in events {
            match decode_domain_event::<A>(&stored) {
                Some(event) => self.state = std::mem::take(&mut self.state).apply(&event),
                None => tracing::warn!(
                    stream = %self.stream,
                    sequence = stored.sequence,
                    event_type = %stored.event_type,
                    "skipping undecodable event"
                ),
            }
            self.sequence = stored.sequence;
        }
        self.unsnapshotted += count as u64;
        Ok(count)
    }

    fn execute(&mut self, cmd: A::Command, ctx: &CommandContext) -> ExecuteResult<A> {
        let mut retries = 0;
        loop {
            let (events, reply) = self
                .state
                .handle(cmd.clone())
                .map_err(ExecuteError::Validation)?
                .into_parts();

            if events.is_empty() {
                return Ok(reply.resolve(&self.state));
            }

            let new_events = events
                .iter()
                .map(|e| encode_domain_event::<A>(e, ctx, &self.stream.key))
                .collect::<Result<Vec<_>, _>>()
                .map_err(JournalError::from)?;

            match self
                .journal
                .append(&self.stream, self.sequence, self.tag, new_events)
            {
                Ok(range) => {
                    let state = std::mem::take(&mut self.state);
                    self.state = events.iter().fold(state, |s, e| s.apply(e));
                    self.sequence = range.last_sequence;
                    self.unsnapshotted += range.len();
                    tracing::info!(count = events.len(), sequence = self.sequence, "events appended");
                    if self.config.snapshot_every > 0
                        && self.unsnapshotted >= self.config.snapshot_every
                    {
                        self.snapshot();
                    }
                    return Ok(reply.resolve(&self.state));
                }
                Err(JournalError::Conflict { expected, actual }) => {
                    // Another writer got there first: fold its events in and
                    // decide again against the fresh state.
                    self.catch_up()?;
                    if retries >= self.config.max_conflict_retries {
                        return Err(ExecuteError::ConcurrencyConflict);
                    }
                    retries += 1;
                    tracing::warn!(expected, actual, retry = retries, "sequence conflict; retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn snapshot(&mut self) {
        let state = match serde_json::to_value(&self.state) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(stream = %self.stream, error = %e, "failed to encode snapshot");
                return;
            }
        };
        let snapshot = Snapshot {
            state,
            sequence: self.sequence,
        };
        match self.journal.save_snapshot(&self.stream, snapshot) {
            Ok(()) => {
                self.unsnapshotted = 0;
                tracing::debug!(stream = %self.stream, sequence = self.sequence, "snapshot saved");
            }
            Err(e) => {
                tracing::warn!(stream = %self.stream, error = %e, "failed to save snapshot");
            }
        }
    }
}

fn run_actor<A: Aggregate>(
    mut instance: Instance<A>,
    mut rx: mpsc::Receiver<ActorMessage<A>>,
    rt: tokio::runtime::Runtime,
    stopped: watch::Sender<bool>,
) {
    let idle_timeout = instance.config.idle_timeout;
    loop {
        // The timeout future is created inside `block_on` so its timer
        // registers with this thread's runtime.
        let msg = rt.block_on(async { tokio::time::timeout(idle_timeout, rx.recv()).await });

        match msg {
            Ok(Some(ActorMessage::Execute { cmd, ctx, reply })) => {
                let _span = tracing::info_span!(
                    "execute",
                    aggregate_type = A::AGGREGATE_TYPE,
                    entity_key = %instance.stream.key,
                )
                .entered();
                let result = instance.execute(cmd, &ctx);
                // The caller may have timed out and dropped the receiver.
                let _ = reply.send(result);
            }
            Ok(Some(ActorMessage::GetState { reply })) => {
                let _ = reply.send(Ok(instance.state.clone()));
            }
            Ok(Some(ActorMessage::Shutdown)) | Ok(None) => break,
            Err(_elapsed) => {
                tracing::info!(stream = %instance.stream, "actor idle, passivating");
                break;
            }
        }
    }

    // Refuse new messages, then answer anything already queued.
    rx.close();
    while let Ok(msg) = rx.try_recv() {
        match msg {
            ActorMessage::Execute { cmd, ctx, reply } => {
                let _ = reply.send(instance.execute(cmd, &ctx));
            }
            ActorMessage::GetState { reply } => {
                let _ = reply.send(Ok(instance.state.clone()));
            }
            ActorMessage::Shutdown => {}
        }
    }

    if instance.unsnapshotted > 0 {
        instance.snapshot();
    }
    let _ = stopped.send(true);
}

/// Async handle to a resident aggregate instance.
///
/// Cheap to clone. Commands sent through any clone are processed one at a
/// time in arrival order.
pub struct AggregateHandle<A: Aggregate> {
    sender: mpsc::Sender<ActorMessage<A>>,
    stream: Arc<StreamId>,
    stopped: watch::Receiver<bool>,
}

impl<A: Aggregate> Clone for AggregateHandle<A> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            stream: Arc::clone(&self.stream),
            stopped: self.stopped.clone(),
        }
    }
}

impl<A: Aggregate> std::fmt::Debug for AggregateHandle<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateHandle")
            .field("stream", &self.stream)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl<A: Aggregate> AggregateHandle<A> {
    /// Send a command and wait for its reply.
    ///
    /// # Errors
    ///
    /// - [`ExecuteError::Validation`] if the aggregate rejected the command.
    /// - [`ExecuteError::ConcurrencyConflict`] if appends kept conflicting.
    /// - [`ExecuteError::Persistence`] if the journal failed.
    /// - [`ExecuteError::ActorGone`] if the actor has passivated.
    pub async fn execute(&self, cmd: A::Command, ctx: CommandContext) -> ExecuteResult<A> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::Execute {
                cmd,
                ctx,
                reply: tx,
            })
            .await
            .map_err(|_| ExecuteError::ActorGone)?;
        rx.await.map_err(|_| ExecuteError::ActorGone)?
    }

    /// Current state of the instance.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::ActorGone`] if the actor has passivated.
    pub async fn state(&self) -> Result<A, StateError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::GetState { reply: tx })
            .await
            .map_err(|_| StateError::ActorGone)?;
        rx.await.map_err(|_| StateError::ActorGone)?
    }

    /// Stream this handle addresses.
    pub fn stream(&self) -> &StreamId {
        &self.stream
    }

    /// Returns `true` if the actor is still accepting messages.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Ask the actor to finish its queue and exit, and wait until it has.
    pub(crate) async fn passivate(&self) {
        let _ = self.sender.send(ActorMessage::Shutdown).await;
        self.stopped().await;
    }

    /// Wait until the actor thread has answered its queue and exited.
    pub(crate) async fn stopped(&self) {
        let mut stopped = self.stopped.clone();
        // Err means the actor thread is gone without signalling, which is
        // just as stopped.
        let _ = stopped.wait_for(|s| *s).await;
    }

    /// A handle whose mailbox is already closed and whose thread reports
    /// stopped only when the returned sender says so.
    #[cfg(test)]
    pub(crate) fn closed(stream: StreamId) -> (Self, watch::Sender<bool>) {
        let (sender, _) = mpsc::channel(1);
        let (stopped_tx, stopped) = watch::channel(false);
        let handle = Self {
            sender,
            stream: Arc::new(stream),
            stopped,
        };
        (handle, stopped_tx)
    }
}

/// Hydrate `stream` and start its actor thread.
pub(crate) fn spawn_actor<A: Aggregate>(
    journal: Arc<dyn EventJournal>,
    stream: StreamId,
    config: ActorConfig,
) -> Result<AggregateHandle<A>, JournalError> {
    let capacity = config.mailbox_capacity;
    let instance = Instance::<A>::hydrate(journal, stream.clone(), config)?;

    // A dedicated runtime drives the idle timer even when the caller's
    // runtime is current-thread.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()?;
    let (tx, rx) = mpsc::channel::<ActorMessage<A>>(capacity);
    let (stopped_tx, stopped_rx) = watch::channel(false);

    std::thread::Builder::new()
        .name(format!("actor-{}", A::AGGREGATE_TYPE))
        .spawn(move || run_actor::<A>(instance, rx, rt, stopped_tx))?;

    Ok(AggregateHandle {
        sender: tx,
        stream: Arc::new(stream),
        stopped: stopped_rx,
    })
}
