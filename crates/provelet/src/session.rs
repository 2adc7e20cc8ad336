//! Driver-side transport: the session and its multiplexer.
//!
//! A [`Session`] owns both pipes through two background tasks. The writer
//! task drains an outbound queue, assigns sequence numbers, publishes a
//! completion slot in the in-flight table before emitting bytes, and emits
//! whole frames only. The reader task parses replies and resolves slots by
//! sequence number — reply order on the wire is never relied upon.
//!
//! Handle drops do no I/O: ids land in a pending-removal buffer that the
//! writer flushes by piggybacking a `Remove` ahead of the next request, when
//! the buffer reaches the configured threshold, or on explicit request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{CommandCodec, ReplyCodec};
use crate::bridge::protocol::{Command, CommandFrame, Data, ObjectId, Reply, ReplyFrame};
use crate::convert::ENGINE_BOOTSTRAP;
use crate::error::BridgeError;
use crate::handle::HandleGuard;

/// A multi-awaitable id resolution: every clone observes the same
/// `ObjectId` or the same error.
pub(crate) type PendingId = Shared<BoxFuture<'static, Result<ObjectId, BridgeError>>>;

type ReplySlot = oneshot::Sender<Result<Data, BridgeError>>;

enum Outbound {
    Request {
        command: Command,
        slot: ReplySlot,
        /// Handles whose ids the command embeds, held until the frame is
        /// written so their removal cannot overtake it on the wire.
        guards: Vec<HandleGuard>,
    },
    Flush,
}

/// Lock a mutex, recovering the inner value if a holder panicked.
fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Session configuration.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SessionConfig {
    /// Capacity of the outbound request queue; senders back off beyond it.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Number of buffered removals that triggers a flush on its own.
    #[serde(default = "default_remove_batch")]
    pub remove_batch: usize,
}

fn default_queue_capacity() -> usize {
    64
}

fn default_remove_batch() -> usize {
    32
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            remove_batch: default_remove_batch(),
        }
    }
}

/// State shared between the writer task, the reader task, and the session.
struct SharedState {
    in_flight: StdMutex<HashMap<u64, ReplySlot>>,
    pending_remove: StdMutex<Vec<ObjectId>>,
    closed: AtomicBool,
}

impl SharedState {
    fn new() -> Self {
        Self {
            in_flight: StdMutex::new(HashMap::new()),
            pending_remove: StdMutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Mark the session dead and fail every outstanding slot.
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let slots: Vec<ReplySlot> = lock(&self.in_flight).drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            let _ = slot.send(Err(BridgeError::TransportClosed));
        }
    }

    /// Drain the pending-removal buffer into a `Remove` command, if any.
    fn drain_removals(&self) -> Option<Command> {
        let ids = std::mem::take(&mut *lock(&self.pending_remove));
        if ids.is_empty() {
            return None;
        }
        tracing::trace!(count = ids.len(), "flushing removals");
        let ids = Data::List(
            ids.into_iter()
                .map(|id| Data::Int(id.as_u64() as i64))
                .collect(),
        );
        Some(Command::Remove { ids })
    }
}

struct SessionCore {
    tx: mpsc::Sender<Outbound>,
    state: Arc<SharedState>,
    fn_cache: StdMutex<HashMap<String, PendingId>>,
    remove_batch: usize,
}

/// A live connection to an engine. Cheap to clone; all clones share the
/// same pipes, sequence space, and object lifecycle.
#[derive(Clone)]
pub struct Session {
    core: Arc<SessionCore>,
}

impl Session {
    /// Connect over an inbound/outbound stream pair and perform the
    /// one-time engine bootstrap (carrier declarations).
    pub async fn connect<R, W>(input: R, output: W) -> Result<Self, BridgeError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::connect_with(SessionConfig::default(), input, output).await
    }

    /// [`Session::connect`] with an explicit configuration.
    pub async fn connect_with<R, W>(
        config: SessionConfig,
        input: R,
        output: W,
    ) -> Result<Self, BridgeError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let state = Arc::new(SharedState::new());
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));

        let writer_state = Arc::clone(&state);
        tokio::spawn(async move {
            run_writer(FramedWrite::new(output, CommandCodec::new()), rx, writer_state).await;
        });

        let reader_state = Arc::clone(&state);
        tokio::spawn(async move {
            run_reader(FramedRead::new(input, ReplyCodec::new()), reader_state).await;
        });

        let session = Session {
            core: Arc::new(SessionCore {
                tx,
                state,
                fn_cache: StdMutex::new(HashMap::new()),
                remove_batch: config.remove_batch.max(1),
            }),
        };

        // Declare the universal exception carriers exactly once, before any
        // converter-generated code can reference them.
        session.eval(ENGINE_BOOTSTRAP).await?;
        tracing::debug!("engine session established");
        Ok(session)
    }

    /// Evaluate engine code for its side effects.
    pub async fn eval(&self, code: impl Into<String>) -> Result<(), BridgeError> {
        self.request(Command::Eval { code: code.into() }, Vec::new())
            .await?;
        Ok(())
    }

    /// Queue removal of the given ids, fire-and-forget: the engine's reply
    /// is discarded.
    pub async fn remove(&self, ids: &[ObjectId]) -> Result<(), BridgeError> {
        if ids.is_empty() {
            return Ok(());
        }
        let ids = Data::List(
            ids.iter()
                .map(|id| Data::Int(id.as_u64() as i64))
                .collect(),
        );
        // The receiver is dropped on purpose; the reply resolves nothing.
        let _ = self.enqueue(Command::Remove { ids }, Vec::new()).await?;
        Ok(())
    }

    /// Flush the pending-removal buffer now instead of waiting for the next
    /// request to piggyback it.
    pub async fn flush_removals(&self) -> Result<(), BridgeError> {
        if self.core.state.is_closed() {
            return Err(BridgeError::TransportClosed);
        }
        self.core
            .tx
            .send(Outbound::Flush)
            .await
            .map_err(|_| BridgeError::TransportClosed)
    }

    /// Whether the transport has failed; every request on a closed session
    /// fails immediately with [`BridgeError::TransportClosed`].
    pub fn is_closed(&self) -> bool {
        self.core.state.is_closed()
    }

    // ------------------------------------------------------------------
    // Internals used by the handle/converter layers
    // ------------------------------------------------------------------

    async fn enqueue(
        &self,
        command: Command,
        guards: Vec<HandleGuard>,
    ) -> Result<oneshot::Receiver<Result<Data, BridgeError>>, BridgeError> {
        if self.core.state.is_closed() {
            return Err(BridgeError::TransportClosed);
        }
        let (slot, rx) = oneshot::channel();
        self.core
            .tx
            .send(Outbound::Request {
                command,
                slot,
                guards,
            })
            .await
            .map_err(|_| BridgeError::TransportClosed)?;
        Ok(rx)
    }

    async fn request(
        &self,
        command: Command,
        guards: Vec<HandleGuard>,
    ) -> Result<Data, BridgeError> {
        let rx = self.enqueue(command, guards).await?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::TransportClosed),
        }
    }

    /// Queue a `StoreExpr`; the returned future resolves to the new id.
    pub(crate) async fn submit_store(&self, expr: String) -> PendingId {
        match self.enqueue(Command::Store { expr }, Vec::new()).await {
            Ok(rx) => async move {
                match rx.await {
                    Ok(Ok(Data::Object(id))) => Ok(id),
                    Ok(Ok(other)) => Err(BridgeError::Protocol(format!(
                        "store reply was not an object: {other:?}"
                    ))),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(BridgeError::TransportClosed),
                }
            }
            .boxed()
            .shared(),
            Err(e) => futures::future::ready(Err(e)).boxed().shared(),
        }
    }

    /// Queue an `Apply` whose reply must be an object reference. `guards`
    /// keeps the handles whose ids `arg` embeds alive until the frame is
    /// written.
    pub(crate) async fn submit_apply(
        &self,
        function: ObjectId,
        arg: Data,
        guards: Vec<HandleGuard>,
    ) -> PendingId {
        match self.enqueue(Command::Apply { function, arg }, guards).await {
            Ok(rx) => async move {
                match rx.await {
                    Ok(Ok(Data::Object(id))) => Ok(id),
                    Ok(Ok(other)) => Err(BridgeError::Protocol(format!(
                        "apply reply was not an object: {other:?}"
                    ))),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(BridgeError::TransportClosed),
                }
            }
            .boxed()
            .shared(),
            Err(e) => futures::future::ready(Err(e)).boxed().shared(),
        }
    }

    /// Queue an `Apply` and return the reply payload as-is.
    pub(crate) async fn apply_data(
        &self,
        function: ObjectId,
        arg: Data,
        guards: Vec<HandleGuard>,
    ) -> Result<Data, BridgeError> {
        self.request(Command::Apply { function, arg }, guards).await
    }

    /// Store a converter-internal engine function once per session. The
    /// cache is keyed by the code text itself.
    pub(crate) async fn compiled_fn(&self, code: &str) -> Result<ObjectId, BridgeError> {
        let cached = lock(&self.core.fn_cache).get(code).cloned();
        let pending = match cached {
            Some(pending) => pending,
            None => {
                let pending = self.submit_store(code.to_string()).await;
                lock(&self.core.fn_cache).insert(code.to_string(), pending.clone());
                pending
            }
        };
        pending.await
    }

    /// Buffer an id for batched removal. Called from handle drops, so this
    /// must never block or touch the pipes directly.
    pub(crate) fn defer_remove(&self, id: ObjectId) {
        let buffered = {
            let mut buffer = lock(&self.core.state.pending_remove);
            buffer.push(id);
            buffer.len()
        };
        if buffered >= self.core.remove_batch {
            // Best effort: a full queue just means a request will piggyback
            // the removals soon anyway.
            let _ = self.core.tx.try_send(Outbound::Flush);
        }
    }
}

// ============================================================================
// Writer task
// ============================================================================

async fn run_writer<W>(
    mut sink: FramedWrite<W, CommandCodec>,
    mut rx: mpsc::Receiver<Outbound>,
    state: Arc<SharedState>,
) where
    W: AsyncWrite + Unpin,
{
    let mut next_seq: u64 = 0;
    let mut broken = false;

    'main: while let Some(outbound) = rx.recv().await {
        let (command, slot, guards) = match outbound {
            Outbound::Flush => {
                if let Some(removal) = state.drain_removals() {
                    if write_frame(&mut sink, &mut next_seq, &state, removal, None)
                        .await
                        .is_err()
                    {
                        broken = true;
                        break 'main;
                    }
                }
                continue;
            }
            Outbound::Request {
                command,
                slot,
                guards,
            } => (command, slot, guards),
        };

        // Piggyback buffered removals ahead of the request. Safe: an id
        // only reaches the buffer once every frame embedding it has been
        // written (queued requests hold their guards until then).
        if let Some(removal) = state.drain_removals() {
            if write_frame(&mut sink, &mut next_seq, &state, removal, None)
                .await
                .is_err()
            {
                let _ = slot.send(Err(BridgeError::TransportClosed));
                broken = true;
                break 'main;
            }
        }

        let sent = write_frame(&mut sink, &mut next_seq, &state, command, Some(slot)).await;
        // The frame (or the failure) is final; released guards may now
        // schedule removals.
        drop(guards);
        if sent.is_err() {
            broken = true;
            break 'main;
        }
    }

    if broken {
        state.close();
        // Requests queued behind the failure cannot be sent anymore.
        while let Ok(outbound) = rx.try_recv() {
            if let Outbound::Request { slot, .. } = outbound {
                let _ = slot.send(Err(BridgeError::TransportClosed));
            }
        }
    } else if let Some(removal) = state.drain_removals() {
        // Session dropped normally: give buffered removals one last chance.
        let _ = write_frame(&mut sink, &mut next_seq, &state, removal, None).await;
    }

    tracing::debug!(broken, "session writer exiting");
}

/// Assign a sequence number, publish the completion slot, emit one frame.
async fn write_frame<W>(
    sink: &mut FramedWrite<W, CommandCodec>,
    next_seq: &mut u64,
    state: &SharedState,
    command: Command,
    slot: Option<ReplySlot>,
) -> Result<(), ()>
where
    W: AsyncWrite + Unpin,
{
    let seq = *next_seq;
    match next_seq.checked_add(1) {
        Some(bumped) => *next_seq = bumped,
        None => {
            // Reusing an in-flight key could misdeliver a reply; refuse.
            if let Some(slot) = slot {
                let _ = slot.send(Err(BridgeError::Protocol(
                    "sequence space exhausted".to_string(),
                )));
            }
            return Ok(());
        }
    }

    // Every issued request reserves exactly one slot, even fire-and-forget
    // ones; the reader drops the reply when nobody is listening.
    let slot = match slot {
        Some(slot) => slot,
        None => {
            let (slot, _discarded) = oneshot::channel();
            slot
        }
    };
    lock(&state.in_flight).insert(seq, slot);

    tracing::trace!(seq, kind = command.kind(), "sending command");
    match sink.send(CommandFrame { seq, command }).await {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::warn!(error = %e, "outbound pipe failed");
            Err(())
        }
    }
}

// ============================================================================
// Reader task
// ============================================================================

async fn run_reader<R>(mut stream: FramedRead<R, ReplyCodec>, state: Arc<SharedState>)
where
    R: AsyncRead + Unpin,
{
    while let Some(next) = stream.next().await {
        let ReplyFrame { seq, reply } = match next {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, "inbound protocol error, terminating session");
                break;
            }
        };

        let slot = lock(&state.in_flight).remove(&seq);
        let Some(slot) = slot else {
            tracing::error!(seq, "reply for unknown sequence number, terminating session");
            break;
        };

        let result = match reply {
            Reply::Success(data) => Ok(data),
            Reply::Failure(message) => Err(BridgeError::Engine(message)),
        };

        if let Err(undelivered) = slot.send(result) {
            // The caller gave up on this request. A fresh object id must
            // still be reclaimed or the store entry leaks for the session.
            if let Ok(Data::Object(id)) = undelivered {
                tracing::trace!(%id, "detached reply carried an object, scheduling removal");
                lock(&state.pending_remove).push(id);
            }
        }
    }

    state.close();
    tracing::debug!("session reader exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::codec::CommandEvent;
    use tokio::io::duplex;

    /// A hand-driven fake engine on the far side of the pipes: reads raw
    /// command frames, lets the test script the replies.
    struct FakeEngine {
        commands: FramedRead<tokio::io::ReadHalf<tokio::io::DuplexStream>, CommandCodec>,
        replies: FramedWrite<tokio::io::WriteHalf<tokio::io::DuplexStream>, ReplyCodec>,
    }

    impl FakeEngine {
        async fn next_command(&mut self) -> CommandFrame {
            match self.commands.next().await {
                Some(Ok(CommandEvent::Command(frame))) => frame,
                other => panic!("expected command, got {other:?}"),
            }
        }

        async fn reply(&mut self, seq: u64, reply: Reply) {
            self.replies.send(ReplyFrame { seq, reply }).await.unwrap();
        }
    }

    async fn connect_fake() -> (Session, FakeEngine) {
        let (driver_io, engine_io) = duplex(64 * 1024);
        let (engine_read, engine_write) = tokio::io::split(engine_io);
        let mut fake = FakeEngine {
            commands: FramedRead::new(engine_read, CommandCodec::new()),
            replies: FramedWrite::new(engine_write, ReplyCodec::new()),
        };

        let (read, write) = tokio::io::split(driver_io);
        let connect = tokio::spawn(Session::connect(read, write));

        // Acknowledge the bootstrap eval.
        let bootstrap = fake.next_command().await;
        assert!(matches!(bootstrap.command, Command::Eval { .. }));
        fake.reply(bootstrap.seq, Reply::Success(Data::List(Vec::new())))
            .await;

        (connect.await.unwrap().unwrap(), fake)
    }

    #[tokio::test]
    async fn replies_are_correlated_out_of_order() {
        let (session, mut fake) = connect_fake().await;

        let first = {
            let session = session.clone();
            tokio::spawn(async move { session.submit_store("SOME 1".to_string()).await.await })
        };
        let a = fake.next_command().await;

        let second = {
            let session = session.clone();
            tokio::spawn(async move { session.submit_store("SOME 2".to_string()).await.await })
        };
        let b = fake.next_command().await;

        assert_eq!(a.seq + 1, b.seq);

        // Answer in reverse order; each future must still get its own id.
        fake.reply(b.seq, Reply::Success(Data::Object(ObjectId::from_raw(21))))
            .await;
        fake.reply(a.seq, Reply::Success(Data::Object(ObjectId::from_raw(20))))
            .await;

        assert_eq!(first.await.unwrap().unwrap(), ObjectId::from_raw(20));
        assert_eq!(second.await.unwrap().unwrap(), ObjectId::from_raw(21));
    }

    #[tokio::test]
    async fn engine_failure_is_per_request() {
        let (session, mut fake) = connect_fake().await;

        let request = {
            let session = session.clone();
            tokio::spawn(async move { session.eval("boom").await })
        };
        let frame = fake.next_command().await;
        fake.reply(frame.seq, Reply::Failure("Fail \"boom\"".to_string()))
            .await;

        let err = request.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::Engine(message) if message.contains("boom")));
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn eof_fails_outstanding_and_subsequent_requests() {
        let (session, mut fake) = connect_fake().await;

        let outstanding = {
            let session = session.clone();
            tokio::spawn(async move { session.eval("hang").await })
        };
        let _ = fake.next_command().await;

        drop(fake); // both pipes close

        let err = outstanding.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::TransportClosed));

        // Closed state is sticky.
        let err = session.eval("later").await.unwrap_err();
        assert!(matches!(err, BridgeError::TransportClosed));
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn removals_piggyback_before_the_next_request() {
        let (session, mut fake) = connect_fake().await;

        session.defer_remove(ObjectId::from_raw(6));
        let pending = {
            let session = session.clone();
            tokio::spawn(async move { session.eval("[]").await })
        };

        let removal = fake.next_command().await;
        match removal.command {
            Command::Remove { ids } => {
                assert_eq!(ids, Data::List(vec![Data::Int(6)]));
            }
            other => panic!("expected piggybacked remove, got {other:?}"),
        }
        fake.reply(removal.seq, Reply::Success(Data::List(Vec::new())))
            .await;

        let eval = fake.next_command().await;
        assert!(matches!(eval.command, Command::Eval { .. }));
        assert_eq!(eval.seq, removal.seq + 1);
        fake.reply(eval.seq, Reply::Success(Data::List(Vec::new())))
            .await;

        pending.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn explicit_flush_emits_buffered_removals() {
        let (session, mut fake) = connect_fake().await;

        session.defer_remove(ObjectId::from_raw(1));
        session.defer_remove(ObjectId::from_raw(2));
        session.flush_removals().await.unwrap();

        let removal = fake.next_command().await;
        match removal.command {
            Command::Remove { ids } => {
                assert_eq!(ids, Data::List(vec![Data::Int(1), Data::Int(2)]));
            }
            other => panic!("expected remove, got {other:?}"),
        }
    }
}
