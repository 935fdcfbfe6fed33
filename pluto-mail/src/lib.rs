pub mod flags;
pub mod maildir;
pub mod mailbox;
pub mod seqset;
pub mod user;

pub use flags::Flag;
pub use mailbox::{AppendInProgress, SelectSummary, StoreOperator, UserMailbox};
pub use seqset::{Seq, SeqRange, SeqSet};
pub use user::UserStore;

use thiserror::Error;

/// Error kinds a mailbox command can fail with. The IMAP layer turns these
/// into tagged `NO` lines; `Fatal` means the node has no consistent way to
/// continue and must exit after flushing logs.
#[derive(Debug, Error)]
pub enum MailError {
    #[error("mailbox does not exist")]
    NoSuchMailbox,
    #[error("message does not exist")]
    NoSuchMessage,
    #[error("mailbox already exists")]
    MailboxExists,
    #[error("{0}")]
    Forbidden(&'static str),
    #[error("{0}")]
    Precondition(String),
    #[error("fatal mailbox state error: {0}")]
    Fatal(#[source] anyhow::Error),
}

impl From<pluto_crdt::CrdtError> for MailError {
    fn from(e: pluto_crdt::CrdtError) -> Self {
        // Call sites check presence under the user lock before removing, so
        // NotPresent here means the state is inconsistent.
        MailError::Fatal(e.into())
    }
}

impl From<std::io::Error> for MailError {
    fn from(e: std::io::Error) -> Self {
        MailError::Fatal(e.into())
    }
}
