use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;

use pluto_sync::msg::Msg;
use pluto_sync::receiver::ApplyReq;
use pluto_sync::sender::SyncRouter;

use crate::mailbox::UserMailbox;
use crate::MailError;

/// The process-global owner of every user's mailbox state on this node.
/// Built once at boot from the user list; workers hold their id range,
/// storage holds everybody.
pub struct UserStore {
    users: HashMap<String, Arc<UserMailbox>>,
}

impl UserStore {
    /// Boot scan: load or provision every assigned user. `assignments`
    /// pairs each user name with the subnet its mutations broadcast on
    /// (the owning worker's name).
    pub fn open(
        crdt_root: &Path,
        maildir_root: &Path,
        sync: SyncRouter,
        assignments: &[(String, String)],
    ) -> Result<Self, MailError> {
        let mut users = HashMap::new();
        for (user, subnet) in assignments {
            let mailbox = UserMailbox::open(user, subnet, crdt_root, maildir_root, sync.clone())?;
            users.insert(user.clone(), Arc::new(mailbox));
        }
        tracing::info!("{} users loaded", users.len());
        Ok(Self { users })
    }

    pub fn get(&self, user: &str) -> Option<Arc<UserMailbox>> {
        self.users.get(user).cloned()
    }

    pub async fn apply(&self, msg: &Msg) -> anyhow::Result<()> {
        let user = msg.op.user();
        match self.users.get(user) {
            Some(mailbox) => mailbox.apply(&msg.op).await,
            None => anyhow::bail!("replicated operation for unknown user {}", user),
        }
    }

    /// The apply-CRDT task of one link: drains the receiver's dispatch
    /// channel, one effect at a time, answering when the effect is durable.
    pub async fn run_apply(self: Arc<Self>, mut rx: mpsc::Receiver<ApplyReq>) {
        while let Some(req) = rx.recv().await {
            let res = self.apply(&req.msg).await;
            if let Err(e) = &res {
                tracing::error!("failed to apply replicated operation: {:#}", e);
            }
            let _ = req.done.send(res);
        }
    }
}
