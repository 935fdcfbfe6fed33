use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use pluto_mail::UserStore;

use crate::imap::command::Command;
use crate::imap::session::{CommandOutcome, Session};
use crate::rpc::{NodeApi, Reply, SessionCtx};

/// The mailbox service worker and storage both run: a session table in
/// front of the node's `UserStore`. Only the addresses differ between the
/// two roles.
pub struct MailService {
    node_name: String,
    store: Arc<UserStore>,
    sessions: Mutex<HashMap<String, Arc<Mutex<Session>>>>,
    /// Signalled when a command hits a fatal persistence error; the node
    /// shuts down non-zero and resumes from its journals on restart.
    fatal: mpsc::UnboundedSender<String>,
}

impl MailService {
    pub fn new(
        node_name: &str,
        store: Arc<UserStore>,
        fatal: mpsc::UnboundedSender<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_name: node_name.to_string(),
            store,
            sessions: Mutex::new(HashMap::new()),
            fatal,
        })
    }

    async fn session(&self, client_id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.lock().await.get(client_id).cloned()
    }

    fn reply_for(&self, outcome: CommandOutcome) -> Reply {
        match outcome {
            CommandOutcome::Done(response) => Reply::Lines(response.lines),
            CommandOutcome::AwaitLiteral(size) => Reply::AwaitLiteral(size),
            CommandOutcome::Fatal(msg) => {
                let _ = self.fatal.send(msg.clone());
                Reply::Refused(msg)
            }
        }
    }
}

#[async_trait]
impl NodeApi for MailService {
    async fn prepare(&self, ctx: SessionCtx) -> Reply {
        if self.store.get(&ctx.user).is_none() {
            return Reply::Refused(format!("user {} is not served here", ctx.user));
        }
        tracing::debug!(
            node = %self.node_name,
            client = %ctx.client_id,
            user = %ctx.user,
            "session prepared"
        );
        let session = Session::new(&ctx.user, &ctx.resp_worker, ctx.selected);
        self.sessions
            .lock()
            .await
            .insert(ctx.client_id, Arc::new(Mutex::new(session)));
        Reply::Confirm
    }

    async fn close(&self, client_id: &str) -> Reply {
        // Dropping the session also drops a pending append and its lock
        self.sessions.lock().await.remove(client_id);
        tracing::debug!(node = %self.node_name, client = %client_id, "session closed");
        Reply::Confirm
    }

    async fn command(&self, client_id: &str, tag: &str, command: Command) -> Reply {
        let session = match self.session(client_id).await {
            Some(s) => s,
            None => return Reply::Refused("no such session".to_string()),
        };
        let mut session = session.lock().await;
        let mailbox = match self.store.get(&session.user) {
            Some(m) => m,
            None => return Reply::Refused("user state is gone".to_string()),
        };
        tracing::debug!(
            node = %self.node_name,
            client = %client_id,
            user = %session.user,
            command = command.name(),
            "dispatch"
        );
        let outcome = session.command(&mailbox, tag, command).await;
        self.reply_for(outcome)
    }

    async fn append_end(&self, client_id: &str, mail: Vec<u8>) -> Reply {
        let session = match self.session(client_id).await {
            Some(s) => s,
            None => return Reply::Refused("no such session".to_string()),
        };
        let mut session = session.lock().await;
        let mailbox = match self.store.get(&session.user) {
            Some(m) => m,
            None => return Reply::Refused("user state is gone".to_string()),
        };
        let outcome = session.append_literal(&mailbox, &mail).await;
        self.reply_for(outcome)
    }

    async fn append_abort(&self, client_id: &str) -> Reply {
        if let Some(session) = self.session(client_id).await {
            session.lock().await.append_abort();
        }
        Reply::Confirm
    }
}
