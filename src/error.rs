//! Error taxonomy for the transfer engine
//!
//! Transport-level failures are retried once inside the scheduler; anything
//! that reaches the caller through these variants is terminal for the
//! session.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The source image cannot be opened or read. Fatal for the session.
    #[error("cannot open source {path}: {source}")]
    SourceUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No viable backend remained after the full negotiation chain
    /// (primary URL, then proxy URL if supplied).
    #[error("no reachable endpoint: {reason}")]
    EndpointUnreachable { reason: String },

    /// The named entry does not exist in the OVA archive.
    #[error("member {member:?} not found in archive {archive}")]
    MemberNotFound { member: String, archive: PathBuf },

    /// An item-level I/O failure that persisted across the retry. Carries
    /// the failing item's position for diagnostics; the target state is
    /// undefined.
    #[error("transfer failed at offset {offset} length {length}: {reason}")]
    Transfer {
        offset: u64,
        length: u64,
        reason: String,
    },

    /// The image-conversion tool (qemu-img / qemu-nbd) failed or produced
    /// output we cannot use.
    #[error("image tool error: {0}")]
    Image(String),

    /// The remote endpoint violated the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }
}
