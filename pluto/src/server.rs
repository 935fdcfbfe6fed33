use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, watch};

use pluto_mail::UserStore;
use pluto_proto::distributor::Distributor;
use pluto_proto::rpc::{MailService, NodeServer};
use pluto_sync::clock::Clock;
use pluto_sync::receiver::{ReceiverLink, SyncListener};
use pluto_sync::sender::{Peer, SenderLink, SyncRouter};
use pluto_sync::vclock_path;
use pluto_user::config::{read_config, Config, UserList, STORAGE_NAME};
use pluto_user::login::static_provider::StaticLoginProvider;
use pluto_user::login::ArcLoginProvider;
use pluto_user::tls;

pub async fn run_distributor(config: Arc<Config>, must_exit: watch::Receiver<bool>) -> Result<()> {
    let acceptor = tls::public_acceptor(&config.tls)?;
    let connector = tls::internal_connector(&config.tls)?;
    let login: ArcLoginProvider =
        Arc::new(StaticLoginProvider::new(config.auth.user_list.clone())?);

    Distributor::new(
        config.distributor.mail_bind,
        acceptor,
        connector,
        login,
        config.clone(),
    )
    .run(must_exit)
    .await
}

pub async fn run_worker(
    config: Arc<Config>,
    name: &str,
    must_exit: watch::Receiver<bool>,
) -> Result<()> {
    let worker = config
        .workers
        .get(name)
        .ok_or_else(|| anyhow!("no worker named {} in the configuration", name))?;

    let ulist: UserList = read_config(config.auth.user_list.clone())?;
    let assignments: Vec<(String, String)> = ulist
        .iter()
        .filter(|(_, e)| worker.user_id_min <= e.user_id && e.user_id <= worker.user_id_max)
        .map(|(user, _)| (user.clone(), name.to_string()))
        .collect();

    let connector = tls::internal_connector(&config.tls)?;

    // The single replication link of a worker: its own subnet, peered with
    // storage.
    let clock = Clock::spawn(name, [name, STORAGE_NAME], &vclock_path(&worker.crdt_root, name))?;
    let (apply_tx, apply_rx) = mpsc::channel(16);
    let receiver = ReceiverLink::open(name, &worker.crdt_root, clock.clone(), apply_tx)?;
    let (sender, intake_rx, handle) = SenderLink::open(
        name,
        name,
        vec![Peer {
            name: STORAGE_NAME.to_string(),
            addr: config.storage.sync_public.clone(),
        }],
        &worker.crdt_root,
        clock,
        connector,
    )?;

    let mut router = SyncRouter::default();
    router.insert(name, handle);
    let store = Arc::new(UserStore::open(
        &worker.crdt_root,
        &worker.maildir_root,
        router,
        &assignments,
    )?);
    tokio::spawn(store.clone().run_apply(apply_rx));

    let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
    let service = MailService::new(name, store, fatal_tx);

    let sync_listener = SyncListener::new(
        worker.sync_bind,
        tls::internal_acceptor(&config.tls)?,
        HashMap::from([(STORAGE_NAME.to_string(), receiver.clone())]),
    );
    let rpc = NodeServer::new(worker.rpc_bind, tls::internal_acceptor(&config.tls)?, service);

    let mut tasks: FuturesUnordered<BoxFuture<'static, Result<()>>> = FuturesUnordered::new();
    tasks.push(Box::pin(receiver.run(must_exit.clone())));
    tasks.push(Box::pin(
        sender.clone().run_intake(intake_rx, must_exit.clone()),
    ));
    tasks.push(Box::pin(sender.run_pusher(must_exit.clone())));
    tasks.push(Box::pin(sync_listener.run(must_exit.clone())));
    tasks.push(Box::pin(rpc.run(must_exit)));

    supervise(tasks, fatal_rx).await
}

pub async fn run_storage(config: Arc<Config>, must_exit: watch::Receiver<bool>) -> Result<()> {
    let st = &config.storage;
    let ulist: UserList = read_config(config.auth.user_list.clone())?;
    let connector = tls::internal_connector(&config.tls)?;

    // One replication link per worker subnet; storage is everybody's hub.
    let mut router = SyncRouter::default();
    let mut links = HashMap::new();
    let mut link_parts = Vec::new();
    for (wname, wcfg) in &config.workers {
        let clock = Clock::spawn(
            STORAGE_NAME,
            [wname.as_str(), STORAGE_NAME],
            &vclock_path(&st.crdt_root, wname),
        )?;
        let (apply_tx, apply_rx) = mpsc::channel(16);
        let receiver = ReceiverLink::open(wname, &st.crdt_root, clock.clone(), apply_tx)?;
        links.insert(wname.clone(), receiver.clone());

        let (sender, intake_rx, handle) = SenderLink::open(
            STORAGE_NAME,
            wname,
            vec![Peer {
                name: wname.clone(),
                addr: wcfg.sync_public.clone(),
            }],
            &st.crdt_root,
            clock,
            connector.clone(),
        )?;
        router.insert(wname, handle);
        link_parts.push((receiver, apply_rx, sender, intake_rx));
    }

    let mut assignments = Vec::new();
    for (user, entry) in &ulist {
        match config.worker_for_user(entry.user_id) {
            Some((wname, _)) => assignments.push((user.clone(), wname.to_string())),
            None => tracing::warn!(
                user = %user,
                id = entry.user_id,
                "no worker range covers this user, skipping"
            ),
        }
    }

    let store = Arc::new(UserStore::open(
        &st.crdt_root,
        &st.maildir_root,
        router,
        &assignments,
    )?);

    let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
    let service = MailService::new(STORAGE_NAME, store.clone(), fatal_tx);

    let mut tasks: FuturesUnordered<BoxFuture<'static, Result<()>>> = FuturesUnordered::new();
    for (receiver, apply_rx, sender, intake_rx) in link_parts {
        tokio::spawn(store.clone().run_apply(apply_rx));
        tasks.push(Box::pin(receiver.run(must_exit.clone())));
        tasks.push(Box::pin(
            sender.clone().run_intake(intake_rx, must_exit.clone()),
        ));
        tasks.push(Box::pin(sender.run_pusher(must_exit.clone())));
    }
    tasks.push(Box::pin(
        SyncListener::new(st.sync_bind, tls::internal_acceptor(&config.tls)?, links)
            .run(must_exit.clone()),
    ));
    tasks.push(Box::pin(
        NodeServer::new(st.rpc_bind, tls::internal_acceptor(&config.tls)?, service)
            .run(must_exit),
    ));

    supervise(tasks, fatal_rx).await
}

/// Run the node's tasks to completion. The first task error, or a fatal
/// mailbox failure reported by the command surface, takes the node down
/// (non-zero exit); a requested shutdown lets every task drain to Ok.
async fn supervise(
    mut tasks: FuturesUnordered<BoxFuture<'static, Result<()>>>,
    mut fatal_rx: mpsc::UnboundedReceiver<String>,
) -> Result<()> {
    loop {
        tokio::select! {
            maybe = tasks.next() => match maybe {
                Some(Ok(())) => {
                    if tasks.is_empty() {
                        return Ok(());
                    }
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            },
            Some(msg) = fatal_rx.recv() => bail!("fatal mailbox failure: {}", msg),
        }
    }
}
