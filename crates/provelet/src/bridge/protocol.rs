//! Wire protocol types for driver-engine communication.
//!
//! Frames are `u64 seq || u8 tag || body`, all integers big-endian.
//! Outbound (driver to engine) bodies are commands; inbound bodies are
//! replies. Every command elicits exactly one reply carrying the same
//! sequence number; replies need not arrive in issue order.

use std::fmt;

// ============================================================================
// ObjectId - reference into the engine's object store
// ============================================================================

/// Identifier of an entry in the engine's object store.
///
/// Ids are issued by the engine, strictly increasing from 0, and never
/// reused within a session. The driver treats them as opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Data - the recursive wire value
// ============================================================================

/// Tag bytes for [`Data`] variants. Any other tag is a fatal protocol error.
pub const DATA_INT: u8 = 0x01;
pub const DATA_STRING: u8 = 0x02;
pub const DATA_LIST: u8 = 0x03;
pub const DATA_OBJECT: u8 = 0x04;

/// The recursive value transported on the wire.
///
/// An `Object` carries only an id; the referenced contents never cross the
/// pipe. A `Data` is well-formed on the wire iff every id it transports
/// refers to a live store entry at the moment of transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Data {
    /// 64-bit signed integer.
    Int(i64),
    /// Length-prefixed bytes interpreted as text (UTF-8 expected, not enforced).
    String(String),
    /// Ordered finite sequence; length encoded as 64-bit.
    List(Vec<Data>),
    /// Reference to an existing engine-store entry.
    Object(ObjectId),
}

// ============================================================================
// Commands (driver to engine)
// ============================================================================

pub const CMD_EVAL: u8 = 0x01;
pub const CMD_STORE: u8 = 0x04;
pub const CMD_APPLY: u8 = 0x07;
pub const CMD_REMOVE: u8 = 0x08;

/// A command body, following the sequence number on the outbound pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Evaluate engine code for its side effects; replies with an empty list.
    Eval { code: String },
    /// Evaluate engine code to a storable value; replies with its new id.
    Store { expr: String },
    /// Apply a stored function-from-data-to-data to an argument; replies
    /// with the resulting `Data`.
    Apply { function: ObjectId, arg: Data },
    /// Erase store entries. The payload must be a `List` of `Int` ids;
    /// shape violations and unknown ids are engine-level failures.
    Remove { ids: Data },
}

impl Command {
    /// Short label for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Eval { .. } => "eval",
            Command::Store { .. } => "store",
            Command::Apply { .. } => "apply",
            Command::Remove { .. } => "remove",
        }
    }
}

/// A sequenced command as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    pub seq: u64,
    pub command: Command,
}

// ============================================================================
// Replies (engine to driver)
// ============================================================================

pub const REPLY_SUCCESS: u8 = 0x01;
pub const REPLY_FAILURE: u8 = 0x02;

/// A reply body, following the sequence number on the inbound pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The command completed; payload is one `Data`.
    Success(Data),
    /// The engine raised; payload is its exception description, unchanged.
    Failure(String),
}

/// A sequenced reply as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyFrame {
    pub seq: u64,
    pub reply: Reply,
}
