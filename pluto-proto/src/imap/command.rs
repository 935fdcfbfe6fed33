use serde::{Deserialize, Serialize};

use pluto_mail::{Flag, SeqSet, StoreOperator};

/// One parsed IMAP command. The distributor parses the client line once and
/// forwards this over the internal RPC, so the worker never re-parses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Command {
    Capability,
    Noop,
    Logout,
    Login {
        username: String,
        password: String,
    },
    Select {
        mailbox: String,
    },
    Create {
        mailbox: String,
    },
    Delete {
        mailbox: String,
    },
    Rename {
        from: String,
        to: String,
    },
    List {
        reference: String,
        pattern: String,
    },
    /// First half of APPEND: the literal announcement. The bytes follow on
    /// a dedicated RPC call once the server has invited them.
    Append {
        mailbox: String,
        flags: Vec<Flag>,
        size: usize,
    },
    Expunge,
    Store {
        seqset: SeqSet,
        operator: StoreOperator,
        silent: bool,
        flags: Vec<Flag>,
    },
    Copy {
        seqset: SeqSet,
        mailbox: String,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Capability => "CAPABILITY",
            Command::Noop => "NOOP",
            Command::Logout => "LOGOUT",
            Command::Login { .. } => "LOGIN",
            Command::Select { .. } => "SELECT",
            Command::Create { .. } => "CREATE",
            Command::Delete { .. } => "DELETE",
            Command::Rename { .. } => "RENAME",
            Command::List { .. } => "LIST",
            Command::Append { .. } => "APPEND",
            Command::Expunge => "EXPUNGE",
            Command::Store { .. } => "STORE",
            Command::Copy { .. } => "COPY",
        }
    }
}
