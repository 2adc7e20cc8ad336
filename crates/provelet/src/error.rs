/// Errors surfaced on driver-side futures.
///
/// `TransportClosed` is global and sticky: once the session observes it,
/// every outstanding and subsequent request fails with the same kind.
/// The other variants are per-request; unaffected requests proceed normally.
///
/// The type is `Clone` because a single failure may be broadcast through a
/// shared pending-id future to every handle derived from it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    /// The engine's byte streams reached EOF or broke mid-frame.
    #[error("transport closed")]
    TransportClosed,

    /// A frame violated the wire protocol (unknown tag, malformed length,
    /// or a reply whose shape disagrees with the issued command).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The engine answered with a failure reply; the message is the
    /// engine's own exception description, unchanged.
    #[error("engine error: {0}")]
    Engine(String),

    /// Driver-side decoding of a reply payload failed: the data shape
    /// disagrees with what the converter expected.
    #[error("conversion error: {0}")]
    Convert(String),
}
