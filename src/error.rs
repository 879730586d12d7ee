use std::net::SocketAddr;

use thiserror::Error;

/// Error taxonomy for the transport: transient (caller retries), protocol
/// (malformed peer data, dropped), transport (socket failure), terminal
/// (closed), programmer (precondition violation).
#[derive(Debug, Error)]
pub enum Error {
    /// The engine has nothing to deliver right now; the caller should retry.
    #[error("would block")]
    WouldBlock,

    /// A deadline elapsed before the operation could complete.
    #[error("operation timed out")]
    Timeout,

    /// A datagram failed to parse as a valid segment stream.
    #[error("malformed segment: {0}")]
    MalformedSegment(&'static str),

    /// A segment's conversation id did not match the stream it arrived on.
    #[error("conversation id mismatch: expected {expected}, got {got}")]
    ConvMismatch { expected: u32, got: u32 },

    /// A payload exceeded the negotiated MSS or the engine's framing limits.
    #[error("oversize payload: {0} bytes")]
    OversizePayload(usize),

    /// The underlying UDP socket failed on read or write.
    #[error("transport I/O error on {addr:?}: {source}")]
    Io {
        addr: Option<SocketAddr>,
        #[source]
        source: std::io::Error,
    },

    /// The stream or transport has been closed; all further operations fail.
    #[error("closed pipe")]
    ClosedPipe,

    /// Retransmission count exceeded `IKCP_DEADLINK`; the stream is unusable.
    #[error("dead link")]
    DeadLink,

    /// A precondition was violated by the caller (invalid mode, duplicate
    /// tunnel address, null selector, ...).
    #[error("programmer error: {0}")]
    Programmer(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
