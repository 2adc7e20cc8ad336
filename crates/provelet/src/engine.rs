//! Engine-side command loop.
//!
//! This is the worker half of the bridge: a single-threaded
//! read-dispatch-reply loop over the command/reply pipes. The loop owns the
//! object store; evaluation itself is delegated to an injected
//! [`EngineRuntime`] — the bridge does not interpret engine code.
//!
//! Evaluation failures are answered on the reply channel and the loop
//! continues; framing failures (truncated input, unknown tags) terminate it.

use std::collections::HashMap;
use std::io;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{CommandCodec, CommandEvent, ReplyCodec};
use crate::bridge::protocol::{Command, CommandFrame, Data, ObjectId, Reply, ReplyFrame};

/// An engine-level evaluation failure, rendered into a failure reply
/// unchanged. Distinct from framing errors, which are fatal.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct EngineException(String);

impl EngineException {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// `Data` with object references resolved to engine-side values.
///
/// The loop resolves incoming ids against the store before handing an
/// argument to the runtime, and stores outgoing values before writing their
/// fresh ids on the wire — an id is live at the moment of transmission.
#[derive(Debug, Clone)]
pub enum EngineData<V> {
    Int(i64),
    String(String),
    List(Vec<EngineData<V>>),
    Object(V),
}

/// The evaluator behind the loop. Implementations wrap whatever actually
/// executes engine code; [`crate::miniml::MiniMl`] is the in-crate reference.
pub trait EngineRuntime: Send {
    /// An engine-side value: one instance of the engine's universal
    /// exception carrier. Cloning must be cheap (values are immutable).
    type Value: Clone + Send + 'static;

    /// Evaluate code for its side effects.
    fn eval(&mut self, code: &str) -> Result<(), EngineException>;

    /// Evaluate code to a storable value.
    fn eval_value(&mut self, code: &str) -> Result<Self::Value, EngineException>;

    /// Apply a stored value, which must be the function-from-data-to-data
    /// carrier, to an argument. Must fail with a message naming the value
    /// when it is not a function.
    fn apply(
        &mut self,
        function: &Self::Value,
        argument: EngineData<Self::Value>,
    ) -> Result<EngineData<Self::Value>, EngineException>;
}

// ============================================================================
// Object store
// ============================================================================

/// The engine's id-to-value mapping.
///
/// Ids are issued from a single monotonic counter, shared between
/// `StoreExpr` results and values stored as a side effect of transmitting
/// nested `Object` data. Ids are never reused within a session.
#[derive(Debug)]
pub struct ObjectTable<V> {
    entries: HashMap<u64, V>,
    next_id: u64,
}

impl<V> ObjectTable<V> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn insert(&mut self, value: V) -> ObjectId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, value);
        ObjectId::from_raw(id)
    }

    pub fn get(&self, id: ObjectId) -> Option<&V> {
        self.entries.get(&id.as_u64())
    }

    /// Erase an entry. Removal is not idempotent: erasing an unknown id is
    /// an engine-level failure.
    pub fn remove(&mut self, id: ObjectId) -> Result<V, EngineException> {
        self.entries
            .remove(&id.as_u64())
            .ok_or_else(|| EngineException::new(format!("no object {id}")))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V> Default for ObjectTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Loop
// ============================================================================

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Longest string body the engine will accept; longer ones are
    /// discarded from the stream and answered with a failure reply.
    pub max_string_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_string_len: u32::MAX as usize,
        }
    }
}

/// Run the engine loop until the command stream ends.
///
/// Commands are processed to completion, in receive order, one at a time;
/// the reply is written and flushed before the next command is read.
pub async fn run_engine<E, R, W>(runtime: E, input: R, output: W) -> io::Result<()>
where
    E: EngineRuntime,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    run_engine_with(EngineConfig::default(), runtime, input, output).await
}

/// [`run_engine`] with an explicit configuration.
pub async fn run_engine_with<E, R, W>(
    config: EngineConfig,
    mut runtime: E,
    input: R,
    output: W,
) -> io::Result<()>
where
    E: EngineRuntime,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut commands = FramedRead::new(
        input,
        CommandCodec::with_max_string_len(config.max_string_len),
    );
    let mut replies = FramedWrite::new(output, ReplyCodec::new());
    let mut table: ObjectTable<E::Value> = ObjectTable::new();

    while let Some(event) = commands.next().await {
        let (seq, reply) = match event? {
            CommandEvent::Command(CommandFrame { seq, command }) => {
                tracing::trace!(seq, kind = command.kind(), "dispatching command");
                let reply = match dispatch(&mut runtime, &mut table, command) {
                    Ok(data) => Reply::Success(data),
                    Err(e) => {
                        tracing::debug!(seq, error = %e, "command failed");
                        Reply::Failure(e.to_string())
                    }
                };
                (seq, reply)
            }
            CommandEvent::Rejected { seq, reason } => {
                tracing::warn!(seq, %reason, "rejected oversized command");
                (seq, Reply::Failure(reason))
            }
        };
        // send flushes the frame before the next command is read.
        replies.send(ReplyFrame { seq, reply }).await?;
    }

    tracing::debug!(objects = table.len(), "engine loop exiting");
    Ok(())
}

fn dispatch<E: EngineRuntime>(
    runtime: &mut E,
    table: &mut ObjectTable<E::Value>,
    command: Command,
) -> Result<Data, EngineException> {
    match command {
        Command::Eval { code } => {
            runtime.eval(&code)?;
            Ok(Data::List(Vec::new()))
        }
        Command::Store { expr } => {
            let value = runtime.eval_value(&expr)?;
            Ok(Data::Object(table.insert(value)))
        }
        Command::Apply { function, arg } => {
            let function = table
                .get(function)
                .cloned()
                .ok_or_else(|| EngineException::new(format!("no object {function}")))?;
            let argument = resolve(table, arg)?;
            let result = runtime.apply(&function, argument)?;
            Ok(absorb(table, result))
        }
        Command::Remove { ids } => {
            for id in id_list(ids)? {
                table.remove(id)?;
            }
            Ok(Data::List(Vec::new()))
        }
    }
}

fn id_list(data: Data) -> Result<Vec<ObjectId>, EngineException> {
    let items = match data {
        Data::List(items) => items,
        other => {
            return Err(EngineException::new(format!(
                "remove expects a list of ids, got {other:?}"
            )));
        }
    };
    items
        .into_iter()
        .map(|item| match item {
            Data::Int(id) if id >= 0 => Ok(ObjectId::from_raw(id as u64)),
            other => Err(EngineException::new(format!(
                "remove expects integer ids, got {other:?}"
            ))),
        })
        .collect()
}

/// Incoming wire data: look up every object id in the store.
fn resolve<V: Clone>(table: &ObjectTable<V>, data: Data) -> Result<EngineData<V>, EngineException> {
    Ok(match data {
        Data::Int(value) => EngineData::Int(value),
        Data::String(text) => EngineData::String(text),
        Data::List(items) => EngineData::List(
            items
                .into_iter()
                .map(|item| resolve(table, item))
                .collect::<Result<_, _>>()?,
        ),
        Data::Object(id) => EngineData::Object(
            table
                .get(id)
                .cloned()
                .ok_or_else(|| EngineException::new(format!("no object {id}")))?,
        ),
    })
}

/// Outgoing data: store every fresh value and write its id.
fn absorb<V>(table: &mut ObjectTable<V>, data: EngineData<V>) -> Data {
    match data {
        EngineData::Int(value) => Data::Int(value),
        EngineData::String(text) => Data::String(text),
        EngineData::List(items) => Data::List(
            items
                .into_iter()
                .map(|item| absorb(table, item))
                .collect(),
        ),
        EngineData::Object(value) => Data::Object(table.insert(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::miniml::MiniMl;

    fn store(runtime: &mut MiniMl, table: &mut ObjectTable<crate::miniml::Value>, expr: &str) -> ObjectId {
        match dispatch(runtime, table, Command::Store { expr: expr.to_string() }) {
            Ok(Data::Object(id)) => id,
            other => panic!("expected stored object, got {other:?}"),
        }
    }

    #[test]
    fn store_issues_monotonic_ids() {
        let mut runtime = MiniMl::new();
        let mut table = ObjectTable::new();
        let a = store(&mut runtime, &mut table, "SOME 1");
        let b = store(&mut runtime, &mut table, "SOME 2");
        let c = store(&mut runtime, &mut table, "SOME 3");
        assert!(a < b && b < c);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn eval_replies_with_empty_list() {
        let mut runtime = MiniMl::new();
        let mut table: ObjectTable<crate::miniml::Value> = ObjectTable::new();
        let reply = dispatch(
            &mut runtime,
            &mut table,
            Command::Eval {
                code: "[]".to_string(),
            },
        )
        .unwrap();
        assert_eq!(reply, Data::List(Vec::new()));
    }

    #[test]
    fn remove_is_not_idempotent() {
        let mut runtime = MiniMl::new();
        let mut table = ObjectTable::new();
        let id = store(&mut runtime, &mut table, "SOME 1");
        let remove = Command::Remove {
            ids: Data::List(vec![Data::Int(id.as_u64() as i64)]),
        };
        dispatch(&mut runtime, &mut table, remove.clone()).unwrap();
        let err = dispatch(&mut runtime, &mut table, remove).unwrap_err();
        assert_eq!(err.to_string(), format!("no object {id}"));
    }

    #[test]
    fn remove_rejects_non_integer_ids() {
        let mut runtime = MiniMl::new();
        let mut table: ObjectTable<crate::miniml::Value> = ObjectTable::new();
        let err = dispatch(
            &mut runtime,
            &mut table,
            Command::Remove {
                ids: Data::List(vec![Data::String("x".to_string())]),
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("integer ids"));
    }

    #[test]
    fn apply_unknown_function_names_the_id() {
        let mut runtime = MiniMl::new();
        let mut table: ObjectTable<crate::miniml::Value> = ObjectTable::new();
        let err = dispatch(
            &mut runtime,
            &mut table,
            Command::Apply {
                function: ObjectId::from_raw(99),
                arg: Data::Int(0),
            },
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "no object 99");
    }

    #[test]
    fn apply_non_function_names_the_value() {
        let mut runtime = MiniMl::new();
        let mut table = ObjectTable::new();
        let id = store(&mut runtime, &mut table, "SOME 7");
        let err = dispatch(
            &mut runtime,
            &mut table,
            Command::Apply {
                function: id,
                arg: Data::Int(0),
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("not a function"));
        assert!(err.to_string().contains("SOME 7"));
    }

    #[test]
    fn apply_stores_result_objects_before_transmission() {
        let mut runtime = MiniMl::new();
        let mut table = ObjectTable::new();
        let f = store(
            &mut runtime,
            &mut table,
            "E_Function (fn DInt i => DObject (SOME i) | _ => raise Fail \"t\")",
        );
        let reply = dispatch(
            &mut runtime,
            &mut table,
            Command::Apply {
                function: f,
                arg: Data::Int(4),
            },
        )
        .unwrap();
        match reply {
            Data::Object(id) => assert!(table.get(id).is_some()),
            other => panic!("expected object reply, got {other:?}"),
        }
    }
}
