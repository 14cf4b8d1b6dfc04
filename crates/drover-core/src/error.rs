//! Error types for the mirror and its transports.
//!
//! Almost every failure in this crate is recovered locally by forcing a
//! resync (discard the mirror, refetch the full state), so these errors
//! rarely cross the crate boundary; they mostly feed warning logs and the
//! `should_resync` flag.

use thiserror::Error;

/// Errors raised while talking to the backend or applying its updates.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Socket-level failure on either channel.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// OSC packet could not be encoded or decoded.
    #[error("osc error: {0}")]
    Osc(#[from] rosc::OscError),

    /// A JSON command payload could not be encoded.
    #[error("payload encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    /// A reliable-channel frame did not match `address:payload`.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A markup fragment or snapshot failed to parse.
    #[error("malformed fragment: {0}")]
    MalformedFragment(String),

    /// A fragment used a tag name outside the known node vocabulary.
    #[error("unknown node tag <{0}>")]
    UnknownTag(String),

    /// An update referenced a uuid that is not in the mirror.
    #[error("no node with uuid {0}")]
    LookupMiss(String),
}
