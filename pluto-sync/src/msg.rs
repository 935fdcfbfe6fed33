use serde::{Deserialize, Serialize};

use pluto_crdt::{Tag, VectorClock};

/// A `(value, tag)` pair of an OR-Set entry crossing the wire.
pub type TaggedValue = (String, Tag);

/// A replicated message: the OR-Set entry plus the raw mail bytes so the
/// peer can materialize the Maildir file.
#[derive(Clone, Serialize, Deserialize)]
pub struct MailPayload {
    pub value: String,
    pub tag: Tag,
    pub contents: Vec<u8>,
}

impl std::fmt::Debug for MailPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailPayload")
            .field("value", &self.value)
            .field("tag", &self.tag)
            .field("contents", &format_args!("<{} bytes>", self.contents.len()))
            .finish()
    }
}

/// One CRDT update operation, as prepared by the originating replica.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Op {
    Create {
        user: String,
        mailbox: String,
        add_mailbox: TaggedValue,
    },
    Delete {
        user: String,
        mailbox: String,
        rmv_mailbox: Vec<TaggedValue>,
        /// Per-mail tags swept together with the mailbox, so the
        /// observed-remove cascade reaches the folder set on the peer.
        rmv_mails: Vec<TaggedValue>,
    },
    Rename {
        user: String,
        mailbox: String,
        new_name: String,
        rmv_mailbox: Vec<TaggedValue>,
        add_mailbox: TaggedValue,
    },
    Append {
        user: String,
        mailbox: String,
        add_mail: MailPayload,
    },
    Expunge {
        user: String,
        mailbox: String,
        rmv_mails: Vec<TaggedValue>,
    },
    /// Flag edits are remove-old-value + add-new-value on the folder set,
    /// because the Maildir filename encodes the flags.
    Store {
        user: String,
        mailbox: String,
        rmv_mails: Vec<TaggedValue>,
        add_mails: Vec<TaggedValue>,
    },
    Copy {
        user: String,
        mailbox: String,
        add_mails: Vec<MailPayload>,
    },
}

impl Op {
    pub fn user(&self) -> &str {
        match self {
            Op::Create { user, .. }
            | Op::Delete { user, .. }
            | Op::Rename { user, .. }
            | Op::Append { user, .. }
            | Op::Expunge { user, .. }
            | Op::Store { user, .. }
            | Op::Copy { user, .. } => user,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Op::Create { .. } => "create",
            Op::Delete { .. } => "delete",
            Op::Rename { .. } => "rename",
            Op::Append { .. } => "append",
            Op::Expunge { .. } => "expunge",
            Op::Store { .. } => "store",
            Op::Copy { .. } => "copy",
        }
    }
}

/// The wire envelope: who originated the operation and the vector clock
/// snapshot taken right after the originating increment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Msg {
    pub sender: String,
    pub vclock: VectorClock,
    pub op: Op,
}

impl Msg {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Msg> {
        Ok(rmp_serde::from_read_ref(bytes)?)
    }
}
