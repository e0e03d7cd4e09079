//! PDML/PSML emission and the PxML reader
//!
//! The decoder hands over a field tree; this crate serializes it to the
//! PDML (full tree) and PSML (one-line summary) XML formats, and reads
//! such documents back with an offset index so packets stream to disk
//! instead of accumulating in memory.

use thiserror::Error;

mod index;
pub mod pdml;
pub mod psml;

pub use index::PxmlReader;
pub use pdml::{PdmlField, PdmlPacket, PdmlProto};

#[derive(Debug, Error)]
pub enum ReaderError {
    /// Recoverable: the caller asked past the end of the capture.
    #[error("packet {0} is out of range")]
    OutOfRange(u64),

    #[error("document is not valid PDML/PSML: {0}")]
    Parse(String),

    #[error("cannot read the packet store: {0}")]
    Io(#[from] std::io::Error),
}
