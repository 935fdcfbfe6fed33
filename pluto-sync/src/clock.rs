use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{mpsc, oneshot};

use pluto_crdt::{SnapFile, VectorClock};

/// The vector clock of a replication link is owned by a single task; the
/// sender and the receiver talk to it over a channel. Every mutation is
/// persisted before the reply is sent, so the on-disk clock is never behind
/// anything another task could have observed.
pub struct Clock {
    name: String,
    clock: VectorClock,
    file: SnapFile,
}

enum ClockReq {
    /// Increment our own coordinate, reply with a snapshot of the result.
    Inc(oneshot::Sender<std::io::Result<VectorClock>>),
    /// Coordinate-wise max with the given clock.
    Merge(VectorClock, oneshot::Sender<std::io::Result<VectorClock>>),
    /// Current snapshot, no mutation.
    Read(oneshot::Sender<VectorClock>),
}

#[derive(Clone)]
pub struct ClockHandle {
    tx: mpsc::Sender<ClockReq>,
}

impl Clock {
    /// Load (or initialize) the clock snapshot at `path` and spawn the
    /// owning task. `replicas` is the full subnet membership, self included.
    pub fn spawn<I, S>(name: &str, replicas: I, path: &Path) -> Result<ClockHandle>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut file = SnapFile::open(path)
            .with_context(|| format!("opening clock snapshot {}", path.display()))?;
        let raw = file.load()?;
        let mut clock = VectorClock::decode(&raw)
            .with_context(|| format!("decoding clock snapshot {}", path.display()))?;
        // Seed missing subnet members at zero
        clock.merge(&VectorClock::new(replicas));

        let mut owner = Clock {
            name: name.to_string(),
            clock,
            file,
        };
        let (tx, mut rx) = mpsc::channel::<ClockReq>(16);
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                owner.serve(req);
            }
            tracing::debug!(replica = %owner.name, "clock task exiting");
        });
        Ok(ClockHandle { tx })
    }

    fn serve(&mut self, req: ClockReq) {
        match req {
            ClockReq::Inc(reply) => {
                let before = self.clock.clone();
                self.clock.inc(&self.name);
                let res = match self.persist() {
                    Ok(()) => Ok(self.clock.clone()),
                    Err(e) => {
                        self.clock = before;
                        Err(e)
                    }
                };
                let _ = reply.send(res);
            }
            ClockReq::Merge(other, reply) => {
                let before = self.clock.clone();
                self.clock.merge(&other);
                let res = match self.persist() {
                    Ok(()) => Ok(self.clock.clone()),
                    Err(e) => {
                        self.clock = before;
                        Err(e)
                    }
                };
                let _ = reply.send(res);
            }
            ClockReq::Read(reply) => {
                let _ = reply.send(self.clock.clone());
            }
        }
    }

    fn persist(&mut self) -> std::io::Result<()> {
        self.file.save(self.clock.encode().as_bytes())
    }
}

impl ClockHandle {
    pub async fn inc(&self) -> Result<VectorClock> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ClockReq::Inc(tx))
            .await
            .map_err(|_| anyhow!("clock task is gone"))?;
        rx.await
            .map_err(|_| anyhow!("clock task is gone"))?
            .context("persisting vector clock")
    }

    pub async fn merge(&self, other: VectorClock) -> Result<VectorClock> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ClockReq::Merge(other, tx))
            .await
            .map_err(|_| anyhow!("clock task is gone"))?;
        rx.await
            .map_err(|_| anyhow!("clock task is gone"))?
            .context("persisting vector clock")
    }

    pub async fn read(&self) -> Result<VectorClock> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ClockReq::Read(tx))
            .await
            .map_err(|_| anyhow!("clock task is gone"))?;
        rx.await.map_err(|_| anyhow!("clock task is gone"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inc_merge_read_through_the_handle() {
        let dir = tempfile::tempdir().unwrap();
        let handle = Clock::spawn(
            "worker-1",
            ["worker-1", "storage"],
            &dir.path().join("w1-vclock.log"),
        )
        .unwrap();

        let v1 = handle.inc().await.unwrap();
        assert_eq!(v1.get("worker-1"), 1);
        assert_eq!(v1.get("storage"), 0);

        let mut remote = VectorClock::new(["worker-1", "storage"]);
        remote.inc("storage");
        remote.inc("storage");
        let merged = handle.merge(remote).await.unwrap();
        assert_eq!(merged.get("storage"), 2);
        assert_eq!(merged.get("worker-1"), 1);

        assert_eq!(handle.read().await.unwrap(), merged);
    }

    #[tokio::test]
    async fn clock_is_reloaded_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w1-vclock.log");

        let handle = Clock::spawn("worker-1", ["worker-1", "storage"], &path).unwrap();
        handle.inc().await.unwrap();
        handle.inc().await.unwrap();
        drop(handle);

        let handle = Clock::spawn("worker-1", ["worker-1", "storage"], &path).unwrap();
        assert_eq!(handle.read().await.unwrap().get("worker-1"), 2);
    }
}
