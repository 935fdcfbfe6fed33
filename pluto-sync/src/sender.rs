use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::clock::ClockHandle;
use crate::frame::{read_frame, write_frame, ACK, PING};
use crate::journal::Journal;
use crate::msg::{Msg, Op};
use crate::sending_log_path;

/// An idle peer is probed within a minute and written off within 30-60s.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(45);
const ACK_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(32);

/// A peer of the subnet: its replica name and its public sync address.
#[derive(Clone, Debug)]
pub struct Peer {
    pub name: String,
    pub addr: String,
}

/// Cloneable handle used by the mailbox service to submit a local mutation
/// for broadcast. The mutation is durable in the outbound journal before
/// `submit` resolves past the intake task's queue.
#[derive(Clone)]
pub struct SyncHandle {
    tx: mpsc::Sender<Op>,
}

impl SyncHandle {
    pub async fn submit(&self, op: Op) -> Result<()> {
        self.tx
            .send(op)
            .await
            .map_err(|_| anyhow!("sender link is gone"))
    }

    /// A handle backed by a bare channel, with no link task behind it. The
    /// caller drains the submitted operations itself.
    pub fn detached() -> (SyncHandle, mpsc::Receiver<Op>) {
        let (tx, rx) = mpsc::channel(64);
        (SyncHandle { tx }, rx)
    }
}

/// Routes a submitted operation to the sender link of the user's subnet.
/// A worker has exactly one entry; storage has one per worker.
#[derive(Clone, Default)]
pub struct SyncRouter {
    links: HashMap<String, SyncHandle>,
}

impl SyncRouter {
    pub fn insert(&mut self, subnet: &str, handle: SyncHandle) {
        self.links.insert(subnet.to_string(), handle);
    }

    pub async fn submit(&self, subnet: &str, op: Op) -> Result<()> {
        match self.links.get(subnet) {
            Some(handle) => handle.submit(op).await,
            None => bail!("no broadcast link for subnet {}", subnet),
        }
    }
}

/// The sending half of one replication link: stamps local mutations with a
/// fresh vector clock, journals them durably, and pushes the journal
/// head-first to every peer with unbounded retry.
pub struct SenderLink {
    self_name: String,
    subnet: String,
    peers: Vec<Peer>,
    journal: Mutex<Journal>,
    bell: Notify,
    clock: ClockHandle,
    connector: TlsConnector,
}

impl SenderLink {
    pub fn open(
        self_name: &str,
        subnet: &str,
        peers: Vec<Peer>,
        crdt_root: &Path,
        clock: ClockHandle,
        connector: TlsConnector,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Op>, SyncHandle)> {
        let path = sending_log_path(crdt_root, subnet);
        let journal = Journal::open(&path)
            .with_context(|| format!("opening outbound journal {}", path.display()))?;
        let (tx, rx) = mpsc::channel(64);
        let link = Arc::new(Self {
            self_name: self_name.to_string(),
            subnet: subnet.to_string(),
            peers,
            journal: Mutex::new(journal),
            bell: Notify::new(),
            clock,
            connector,
        });
        Ok((link, rx, SyncHandle { tx }))
    }

    /// Intake loop: stamp, journal, ring the pusher. Runs until every
    /// `SyncHandle` is dropped or a stop is requested.
    pub async fn run_intake(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Op>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            let op = tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(op) => op,
                    None => break,
                },
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                    continue;
                }
            };

            let vclock = self.clock.inc().await?;
            let msg = Msg {
                sender: self.self_name.clone(),
                vclock,
                op,
            };
            let frame = msg.encode()?;
            {
                let mut journal = self.journal.lock().await;
                journal
                    .append(&frame)
                    .context("appending to outbound journal")?;
            }
            tracing::debug!(
                subnet = %self.subnet,
                op = msg.op.kind(),
                "journaled outbound operation"
            );
            self.bell.notify_one();
        }
        tracing::debug!(subnet = %self.subnet, "sender intake exiting");
        Ok(())
    }

    /// Pusher loop: drain the outbound journal head-first. The head is only
    /// truncated once every peer has acked it, so same-sender delivery
    /// order matches emission order.
    pub async fn run_pusher(self: Arc<Self>, mut stop: watch::Receiver<bool>) -> Result<()> {
        let mut conns: HashMap<String, TlsStream<TcpStream>> = HashMap::new();
        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            loop {
                let head = {
                    let mut journal = self.journal.lock().await;
                    journal.head()?
                };
                let Some(frame) = head else { break };
                if !self.push_to_all(&mut conns, &frame, &mut stop).await? {
                    return Ok(()); // stopped mid-retry; journal keeps the rest
                }
                let mut journal = self.journal.lock().await;
                journal.pop_head()?;
            }

            tokio::select! {
                _ = self.bell.notified() => (),
                _ = keepalive.tick() => self.ping_all(&mut conns).await,
                _ = stop.changed() => {
                    if *stop.borrow() {
                        tracing::debug!(subnet = %self.subnet, "sender pusher stopping");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Push one frame to every peer, retrying each with exponential backoff
    /// until it acks. Returns false if a stop was requested while waiting.
    async fn push_to_all(
        &self,
        conns: &mut HashMap<String, TlsStream<TcpStream>>,
        frame: &[u8],
        stop: &mut watch::Receiver<bool>,
    ) -> Result<bool> {
        for peer in &self.peers {
            let mut backoff = BACKOFF_MIN;
            loop {
                match self.call(conns, peer, frame).await {
                    Ok(()) => break,
                    Err(e) => {
                        conns.remove(&peer.name);
                        tracing::warn!(
                            subnet = %self.subnet,
                            peer = %peer.name,
                            "push failed ({}), retrying in {:?}",
                            e,
                            backoff
                        );
                        let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 4);
                        tokio::select! {
                            _ = tokio::time::sleep(backoff + Duration::from_millis(jitter)) => (),
                            _ = stop.changed() => {
                                if *stop.borrow() {
                                    return Ok(false);
                                }
                            }
                        }
                        backoff = (backoff * 2).min(BACKOFF_MAX);
                    }
                }
            }
        }
        Ok(true)
    }

    /// Send one frame on the (re)connected stream and wait for the ack.
    async fn call(
        &self,
        conns: &mut HashMap<String, TlsStream<TcpStream>>,
        peer: &Peer,
        frame: &[u8],
    ) -> Result<()> {
        if !conns.contains_key(&peer.name) {
            let stream = self.connect(peer).await?;
            conns.insert(peer.name.clone(), stream);
        }
        let stream = conns.get_mut(&peer.name).unwrap();

        let reply = tokio::time::timeout(ACK_TIMEOUT, async {
            write_frame(stream, frame).await?;
            read_frame(stream).await
        })
        .await
        .map_err(|_| anyhow!("timed out waiting for ack from {}", peer.name))??;

        if reply != ACK {
            bail!("peer {} refused the message", peer.name);
        }
        Ok(())
    }

    async fn connect(&self, peer: &Peer) -> Result<TlsStream<TcpStream>> {
        let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&peer.addr))
            .await
            .map_err(|_| anyhow!("timed out connecting to {}", peer.addr))??;
        let host = peer
            .addr
            .rsplit_once(':')
            .map(|(h, _)| h)
            .unwrap_or(peer.addr.as_str());
        let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
            .with_context(|| format!("bad peer host name {}", host))?;
        let stream = self.connector.connect(server_name, tcp).await?;
        tracing::debug!(subnet = %self.subnet, peer = %peer.name, "sync stream connected");
        Ok(stream)
    }

    /// Probe idle streams; a dead one is dropped and will be redialed by
    /// the next push.
    async fn ping_all(&self, conns: &mut HashMap<String, TlsStream<TcpStream>>) {
        let mut dead = Vec::new();
        for (name, stream) in conns.iter_mut() {
            let probe = tokio::time::timeout(ACK_TIMEOUT, async {
                write_frame(stream, PING).await?;
                read_frame(stream).await
            })
            .await;
            match probe {
                Ok(Ok(reply)) if reply == ACK => (),
                _ => {
                    tracing::debug!(subnet = %self.subnet, peer = %name, "keepalive failed");
                    dead.push(name.clone());
                }
            }
        }
        for name in dead {
            conns.remove(&name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;

    fn connector() -> TlsConnector {
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }

    #[tokio::test]
    async fn intake_stamps_and_journals_before_any_push() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Clock::spawn(
            "worker-1",
            ["worker-1", "storage"],
            &dir.path().join("worker-1-vclock.log"),
        )
        .unwrap();

        let (link, intake_rx, handle) = SenderLink::open(
            "worker-1",
            "worker-1",
            Vec::new(),
            dir.path(),
            clock.clone(),
            connector(),
        )
        .unwrap();
        let (_stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(link.clone().run_intake(intake_rx, stop_rx));

        handle
            .submit(Op::Create {
                user: "u".to_string(),
                mailbox: "Sports".to_string(),
                add_mailbox: ("Sports".to_string(), uuid::Uuid::new_v4()),
            })
            .await
            .unwrap();

        // The intake runs concurrently; wait for the record to land.
        let frame = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(head) = link.journal.lock().await.head().unwrap() {
                    return head;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("journaled record");

        let msg = Msg::decode(&frame).unwrap();
        assert_eq!(msg.sender, "worker-1");
        assert_eq!(msg.vclock.get("worker-1"), 1);
        assert_eq!(msg.op.kind(), "create");

        // The stamping increment is already durable in the clock snapshot
        assert_eq!(clock.read().await.unwrap().get("worker-1"), 1);
    }
}
