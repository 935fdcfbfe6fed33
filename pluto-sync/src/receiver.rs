use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify};
use tokio_rustls::TlsAcceptor;

use pluto_crdt::VectorClock;

use crate::clock::ClockHandle;
use crate::frame::{read_frame, write_frame, ACK, NACK, PING};
use crate::journal::Journal;
use crate::msg::Msg;
use crate::receiving_log_path;

/// Fallback wake-up for the apply loop, in case a bell ring was missed.
const APPLY_TICK: Duration = Duration::from_secs(5);

/// A message handed to the CRDT apply task, answered when the effect is
/// durable on this replica.
pub struct ApplyReq {
    pub msg: Msg,
    pub done: oneshot::Sender<Result<()>>,
}

/// What the causal-order check says about a journaled message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Eligibility {
    /// `vclock[sender]` is exactly one ahead of us and no other coordinate
    /// is: apply the effect now.
    Apply,
    /// We have already seen this message; purge without re-applying.
    Duplicate,
    /// A causal predecessor is still missing; leave it in the journal.
    Defer,
}

/// Decide whether a message can be consumed given our clock `local`.
///
/// Apply iff `msg_clock[s] ∈ {local[s], local[s]+1}` and every other
/// coordinate of `msg_clock` is ≤ ours (no unseen prerequisite).
pub fn eligibility(local: &VectorClock, sender: &str, msg_clock: &VectorClock) -> Eligibility {
    let k = msg_clock.get(sender);
    let seen = local.get(sender);
    if k != seen && k != seen + 1 {
        return Eligibility::Defer;
    }
    for (peer, count) in msg_clock.iter() {
        if peer != sender && count > local.get(peer) {
            return Eligibility::Defer;
        }
    }
    if k == seen {
        Eligibility::Duplicate
    } else {
        Eligibility::Apply
    }
}

/// The receiving half of one replication link: a durable inbound journal
/// fed by the sync listener, drained in causal order by `run`.
pub struct ReceiverLink {
    subnet: String,
    journal: Mutex<Journal>,
    bell: Notify,
    clock: ClockHandle,
    apply: mpsc::Sender<ApplyReq>,
}

impl ReceiverLink {
    pub fn open(
        subnet: &str,
        crdt_root: &Path,
        clock: ClockHandle,
        apply: mpsc::Sender<ApplyReq>,
    ) -> Result<Arc<Self>> {
        let path = receiving_log_path(crdt_root, subnet);
        let journal = Journal::open(&path)
            .with_context(|| format!("opening inbound journal {}", path.display()))?;
        Ok(Arc::new(Self {
            subnet: subnet.to_string(),
            journal: Mutex::new(journal),
            bell: Notify::new(),
            clock,
            apply,
        }))
    }

    pub fn subnet(&self) -> &str {
        &self.subnet
    }

    /// Quarantine one wire frame: append to the inbound journal (durable)
    /// and ring the bell. Called by the sync listener before it acks.
    pub async fn accept(&self, frame: &[u8]) -> Result<()> {
        {
            let mut journal = self.journal.lock().await;
            journal.append(frame)?;
        }
        self.bell.notify_one();
        Ok(())
    }

    /// The apply loop. Wakes on the bell or on a periodic tick (which also
    /// replays the journal once at boot), then consumes every record that
    /// has become causally eligible.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) -> Result<()> {
        let mut tick = tokio::time::interval(APPLY_TICK);
        loop {
            tokio::select! {
                _ = self.bell.notified() => (),
                _ = tick.tick() => (),
                _ = stop.changed() => {
                    if *stop.borrow() {
                        tracing::debug!(subnet = %self.subnet, "receiver apply loop stopping");
                        return Ok(());
                    }
                }
            }
            self.drain()
                .await
                .with_context(|| format!("applying inbound journal of subnet {}", self.subnet))?;
        }
    }

    /// One pass over the journal. Deferring a record advances the read
    /// cursor past it; consuming one resets the cursor to the start, since
    /// the consumption may have made earlier-deferred records eligible.
    async fn drain(&self) -> Result<()> {
        let mut cursor = 0u64;
        loop {
            let mut journal = self.journal.lock().await;
            let (record, next) = match journal.read_at(cursor)? {
                Some(v) => v,
                None => return Ok(()),
            };
            let msg = Msg::decode(&record)?;

            let local = self.clock.read().await?;
            match eligibility(&local, &msg.sender, &msg.vclock) {
                Eligibility::Defer => {
                    cursor = next;
                    continue;
                }
                Eligibility::Apply => {
                    tracing::debug!(
                        subnet = %self.subnet,
                        sender = %msg.sender,
                        op = msg.op.kind(),
                        "applying replicated operation"
                    );
                    let (done_tx, done_rx) = oneshot::channel();
                    let vclock = msg.vclock.clone();
                    self.apply
                        .send(ApplyReq { msg, done: done_tx })
                        .await
                        .map_err(|_| anyhow!("apply task is gone"))?;
                    done_rx.await.map_err(|_| anyhow!("apply task is gone"))??;
                    self.clock.merge(vclock).await?;
                }
                Eligibility::Duplicate => {
                    tracing::debug!(
                        subnet = %self.subnet,
                        sender = %msg.sender,
                        "purging duplicate message"
                    );
                    self.clock.merge(msg.vclock).await?;
                }
            }

            // Only now that the effect is applied (or proven duplicate) and
            // the merged clock is durable may the record leave the journal.
            journal.remove_at(cursor, next)?;
            cursor = 0;
        }
    }
}

/// The node-wide sync listener. Accepts mutually-authenticated streams and
/// routes each inbound message to the link owned by its sender.
pub struct SyncListener {
    bind_addr: SocketAddr,
    acceptor: TlsAcceptor,
    links: Arc<HashMap<String, Arc<ReceiverLink>>>,
}

impl SyncListener {
    pub fn new(
        bind_addr: SocketAddr,
        acceptor: TlsAcceptor,
        links: HashMap<String, Arc<ReceiverLink>>,
    ) -> Self {
        Self {
            bind_addr,
            acceptor,
            links: Arc::new(links),
        }
    }

    pub async fn run(self, mut must_exit: watch::Receiver<bool>) -> Result<()> {
        let tcp = TcpListener::bind(self.bind_addr)
            .await
            .with_context(|| format!("binding sync listener on {}", self.bind_addr))?;
        tracing::info!("sync listener on {}", self.bind_addr);

        let mut connections = FuturesUnordered::new();
        while !*must_exit.borrow() {
            let wait_conn_finished = async {
                if connections.is_empty() {
                    futures::future::pending().await
                } else {
                    connections.next().await
                }
            };
            let (socket, remote_addr) = tokio::select! {
                a = tcp.accept() => a?,
                _ = wait_conn_finished => continue,
                _ = must_exit.changed() => continue,
            };
            tracing::debug!("sync connection from {}", remote_addr);

            let acceptor = self.acceptor.clone();
            let links = self.links.clone();
            connections.push(tokio::spawn(async move {
                match acceptor.accept(socket).await {
                    Ok(tls) => {
                        if let Err(e) = handle_sync_conn(links, tls).await {
                            tracing::debug!("sync connection from {} ended: {}", remote_addr, e);
                        }
                    }
                    Err(e) => tracing::warn!("sync TLS handshake with {} failed: {}", remote_addr, e),
                }
            }));
        }
        drop(tcp);

        while connections.next().await.is_some() {}
        Ok(())
    }
}

async fn handle_sync_conn<S>(
    links: Arc<HashMap<String, Arc<ReceiverLink>>>,
    mut stream: S,
) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        let frame = read_frame(&mut stream).await?;
        if frame == PING {
            write_frame(&mut stream, ACK).await?;
            continue;
        }

        // Peek at the envelope to find the owning link
        let sender = match Msg::decode(&frame) {
            Ok(msg) => msg.sender,
            Err(e) => {
                tracing::warn!("undecodable sync message: {}", e);
                write_frame(&mut stream, NACK).await?;
                continue;
            }
        };
        match links.get(&sender) {
            Some(link) => {
                link.accept(&frame).await?;
                write_frame(&mut stream, ACK).await?;
            }
            None => {
                tracing::warn!("sync message from unknown replica {}", sender);
                write_frame(&mut stream, NACK).await?;
            }
        }
    }
}

/// An in-process stand-in for the sync listener, used by tests to feed a
/// link the exact bytes a peer would have sent.
pub async fn inject(link: &ReceiverLink, msg: &Msg) -> Result<()> {
    let frame = msg.encode()?;
    link.accept(&frame).await?;
    link.drain().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::Op;

    fn clock(pairs: &[(&str, u32)]) -> VectorClock {
        let mut v = VectorClock::default();
        for (name, count) in pairs {
            for _ in 0..*count {
                v.inc(name);
            }
        }
        v
    }

    #[test]
    fn eligibility_cases() {
        let local = clock(&[("w", 2), ("s", 1)]);

        // Next message from w, no unseen prerequisite: apply
        assert_eq!(
            eligibility(&local, "w", &clock(&[("w", 3), ("s", 1)])),
            Eligibility::Apply
        );
        // Already seen: duplicate
        assert_eq!(
            eligibility(&local, "w", &clock(&[("w", 2), ("s", 0)])),
            Eligibility::Duplicate
        );
        // Gap in the sender's own sequence: defer
        assert_eq!(
            eligibility(&local, "w", &clock(&[("w", 4), ("s", 1)])),
            Eligibility::Defer
        );
        // Unseen causal prerequisite from another replica: defer
        assert_eq!(
            eligibility(&local, "w", &clock(&[("w", 3), ("s", 2)])),
            Eligibility::Defer
        );
    }

    #[tokio::test]
    async fn drain_applies_in_causal_order_and_purges_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let clock_handle = crate::clock::Clock::spawn(
            "storage",
            ["w", "storage"],
            &dir.path().join("w-vclock.log"),
        )
        .unwrap();

        let (apply_tx, mut apply_rx) = mpsc::channel::<ApplyReq>(8);
        let applied = Arc::new(Mutex::new(Vec::new()));
        let applied2 = applied.clone();
        tokio::spawn(async move {
            while let Some(req) = apply_rx.recv().await {
                applied2.lock().await.push(req.msg.vclock.get("w"));
                let _ = req.done.send(Ok(()));
            }
        });

        let link =
            ReceiverLink::open("w", dir.path(), clock_handle.clone(), apply_tx).unwrap();

        let op = |n: u32| Op::Create {
            user: "u".to_string(),
            mailbox: format!("m{}", n),
            add_mailbox: (format!("m{}", n), uuid::Uuid::new_v4()),
        };
        let msg = |n: u32| Msg {
            sender: "w".to_string(),
            vclock: clock(&[("w", n)]),
            op: op(n),
        };

        // Deliver out of order: 2 arrives before 1, then 1 unblocks both.
        link.accept(&msg(2).encode().unwrap()).await.unwrap();
        link.drain().await.unwrap();
        assert!(applied.lock().await.is_empty());

        link.accept(&msg(1).encode().unwrap()).await.unwrap();
        link.drain().await.unwrap();
        assert_eq!(*applied.lock().await, vec![1, 2]);

        // A replay of 1 is purged without effect
        link.accept(&msg(1).encode().unwrap()).await.unwrap();
        link.drain().await.unwrap();
        assert_eq!(*applied.lock().await, vec![1, 2]);
        assert!(link.journal.lock().await.is_empty().unwrap());

        assert_eq!(clock_handle.read().await.unwrap().get("w"), 2);
    }

    #[tokio::test]
    async fn journaled_messages_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let clock_handle = crate::clock::Clock::spawn(
            "storage",
            ["w", "storage"],
            &dir.path().join("w-vclock.log"),
        )
        .unwrap();

        let msg = Msg {
            sender: "w".to_string(),
            vclock: clock(&[("w", 1)]),
            op: Op::Create {
                user: "u".to_string(),
                mailbox: "Sports".to_string(),
                add_mailbox: ("Sports".to_string(), uuid::Uuid::new_v4()),
            },
        };

        // First incarnation quarantines the message but dies before the
        // apply loop ever runs.
        {
            let (apply_tx, _apply_rx) = mpsc::channel::<ApplyReq>(8);
            let link = ReceiverLink::open("w", dir.path(), clock_handle.clone(), apply_tx).unwrap();
            link.accept(&msg.encode().unwrap()).await.unwrap();
        }

        // The restarted link finds the record in its journal and applies it.
        let (apply_tx, mut apply_rx) = mpsc::channel::<ApplyReq>(8);
        tokio::spawn(async move {
            while let Some(req) = apply_rx.recv().await {
                let _ = req.done.send(Ok(()));
            }
        });
        let link = ReceiverLink::open("w", dir.path(), clock_handle.clone(), apply_tx).unwrap();
        link.drain().await.unwrap();

        assert!(link.journal.lock().await.is_empty().unwrap());
        assert_eq!(clock_handle.read().await.unwrap().get("w"), 1);
    }
}
