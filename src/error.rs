use std::net::SocketAddr;

/// Error taxonomy for the engine boundary (see spec §7). Low-level
/// failures are caught at the session/worker boundary and converted to
/// state transitions; only the variants below are allowed to cross out of
/// the engine into a coordinator.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("handshake rejected by {addr}: {reason}")]
    HandshakeRejected { addr: SocketAddr, reason: String },

    #[error("peer unreachable: {addr}: {source}")]
    PeerUnreachable {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("piece {index} failed hash verification")]
    PieceHashMismatch { index: u32 },

    #[error("invalid metainfo: {0}")]
    InvalidMetainfo(String),

    #[error("tracker announce failed: {0}")]
    Tracker(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl From<serde_bencode::Error> for EngineError {
    fn from(err: serde_bencode::Error) -> Self {
        EngineError::MalformedInput(err.to_string())
    }
}
