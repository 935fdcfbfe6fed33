pub mod client;
pub mod server;
pub mod service;

pub use client::{RpcClient, RpcError};
pub use server::NodeServer;
pub use service::MailService;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::imap::command::Command;

/// Everything a serving node needs to know about one proxied session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionCtx {
    pub client_id: String,
    pub user: String,
    /// Name of the worker owning the user (the reply-pipe routing tag).
    pub resp_worker: String,
    /// Mailbox already selected when the session is (re)prepared, so a
    /// failed-over session resumes in the right state.
    pub selected: Option<String>,
}

/// One internal RPC request, length-delimited MessagePack on the wire.
#[derive(Debug, Serialize, Deserialize)]
pub enum Request {
    Prepare(SessionCtx),
    Close { client_id: String },
    Command {
        client_id: String,
        tag: String,
        command: Command,
    },
    AppendEnd { client_id: String, mail: Vec<u8> },
    AppendAbort { client_id: String },
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Reply {
    /// Prepare/Close/Abort confirmation.
    Confirm,
    /// IMAP response lines to relay to the client verbatim.
    Lines(Vec<String>),
    /// APPEND accepted; invite the announced number of literal bytes.
    AwaitLiteral(usize),
    /// The node cannot serve this session; the distributor says BYE.
    Refused(String),
}

impl Request {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Request> {
        Ok(rmp_serde::from_read_ref(bytes)?)
    }
}

impl Reply {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Reply> {
        Ok(rmp_serde::from_read_ref(bytes)?)
    }
}

/// The command surface worker and storage expose identically, which is what
/// lets the distributor treat primary and failover as two instances of the
/// same thing.
#[async_trait]
pub trait NodeApi: Send + Sync {
    async fn prepare(&self, ctx: SessionCtx) -> Reply;
    async fn close(&self, client_id: &str) -> Reply;
    async fn command(&self, client_id: &str, tag: &str, command: Command) -> Reply;
    async fn append_end(&self, client_id: &str, mail: Vec<u8>) -> Reply;
    async fn append_abort(&self, client_id: &str) -> Reply;
}

pub(crate) async fn dispatch(api: &std::sync::Arc<dyn NodeApi>, req: Request) -> Reply {
    match req {
        Request::Prepare(ctx) => api.prepare(ctx).await,
        Request::Close { client_id } => api.close(&client_id).await,
        Request::Command {
            client_id,
            tag,
            command,
        } => api.command(&client_id, &tag, command).await,
        Request::AppendEnd { client_id, mail } => api.append_end(&client_id, mail).await,
        Request::AppendAbort { client_id } => api.append_abort(&client_id).await,
    }
}
