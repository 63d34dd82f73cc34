//! The crate-wide error taxonomy.
//!
//! Per the error handling design, only an unreadable or unparsable metainfo
//! file is fatal to the process. Everything else (a bad peer, a failing
//! tracker, a corrupt piece) is contained and logged at the call site, and
//! surfaces here only as a `Result` the caller chooses to unwrap into a
//! disconnect or a retry.

use std::io;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top level error type returned by the engine's public entry points.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The `.torrent` file could not be read or did not parse as a valid
    /// bencoded metainfo dictionary. This is the one error the process
    /// cannot route around.
    #[error("invalid metainfo: {0}")]
    InvalidMetainfo(String),

    /// A peer violated the wire protocol (bad frame, unknown message id,
    /// info-hash mismatch, bitfield length mismatch, block offset overflow).
    /// Fatal to the offending peer session, never to the swarm.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A TCP-level failure: connect refused, read/write failure, or the
    /// remote end closing the connection.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The tracker announce failed (HTTP failure, non-200, bencode decode
    /// failure, or a `failure reason` key in the response).
    #[error("tracker error: {0}")]
    Tracker(String),

    /// A completed piece's SHA-1 did not match the metainfo's expected hash.
    #[error("piece {0} failed verification")]
    Verification(crate::PieceIndex),

    /// Scatter-writing a verified piece to disk failed.
    #[error("disk error: {0}")]
    Disk(io::Error),
}

impl From<crate::piece_store::SaveError> for Error {
    fn from(e: crate::piece_store::SaveError) -> Self {
        Error::Protocol(e.to_string())
    }
}
