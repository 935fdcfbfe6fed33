pub mod clock;
pub mod frame;
pub mod journal;
pub mod msg;
pub mod receiver;
pub mod sender;

pub use clock::{Clock, ClockHandle};
pub use journal::Journal;
pub use msg::{MailPayload, Msg, Op, TaggedValue};
pub use receiver::{ApplyReq, Eligibility, ReceiverLink, SyncListener};
pub use sender::{Peer, SenderLink, SyncHandle, SyncRouter};

use std::path::{Path, PathBuf};

/// Journals and the clock snapshot of a replication link all live next to
/// the CRDT root, named after the link's subnet.
pub fn sending_log_path(crdt_root: &Path, subnet: &str) -> PathBuf {
    crdt_root.join(format!("{}-sending.log", subnet))
}

pub fn receiving_log_path(crdt_root: &Path, subnet: &str) -> PathBuf {
    crdt_root.join(format!("{}-receiving.log", subnet))
}

pub fn vclock_path(crdt_root: &Path, subnet: &str) -> PathBuf {
    crdt_root.join(format!("{}-vclock.log", subnet))
}
