pub mod orset;
pub mod snapfile;
pub mod vclock;

pub use orset::{OrSet, Tag};
pub use snapfile::SnapFile;
pub use vclock::VectorClock;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrdtError {
    /// Remove was asked for a value no tag is bound to.
    #[error("value is not present in the set")]
    NotPresent,

    /// A snapshot file exists but cannot be decoded.
    #[error("corrupted snapshot: {0}")]
    BadSnapshot(String),

    /// The snapshot could not be made durable. The in-memory effect has
    /// been rolled back when this is returned from a mutation.
    #[error("snapshot write failed")]
    Fatal(#[source] std::io::Error),
}
