//! Wire protocol between driver and engine.
//!
//! Two layers:
//! - **protocol**: the data model — `Data`, commands, replies, and the
//!   normative tag bytes.
//! - **codec**: `tokio_util` codecs that frame those types over any
//!   `AsyncRead`/`AsyncWrite` pair (pipes, sockets, in-process duplex).

pub mod codec;
pub mod protocol;
