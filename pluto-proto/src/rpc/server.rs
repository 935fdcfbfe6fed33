use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use pluto_sync::frame::{read_frame, write_frame};

use crate::rpc::{dispatch, NodeApi, Request};

/// The internal RPC listener of a worker or storage node. Mutually
/// authenticated; the distributor is the only legitimate caller.
pub struct NodeServer {
    bind_addr: SocketAddr,
    acceptor: TlsAcceptor,
    api: Arc<dyn NodeApi>,
}

impl NodeServer {
    pub fn new(bind_addr: SocketAddr, acceptor: TlsAcceptor, api: Arc<dyn NodeApi>) -> Self {
        Self {
            bind_addr,
            acceptor,
            api,
        }
    }

    pub async fn run(self, mut must_exit: watch::Receiver<bool>) -> Result<()> {
        let tcp = TcpListener::bind(self.bind_addr)
            .await
            .with_context(|| format!("binding RPC listener on {}", self.bind_addr))?;
        tracing::info!("RPC listener on {}", self.bind_addr);

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
            tracing::debug!("RPC connection from {}", remote_addr);

            let acceptor = self.acceptor.clone();
            let api = self.api.clone();
            connections.push(tokio::spawn(async move {
                match acceptor.accept(socket).await {
                    Ok(tls) => {
                        if let Err(e) = serve_conn(api, tls).await {
                            tracing::debug!("RPC connection from {} ended: {}", remote_addr, e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("RPC TLS handshake with {} failed: {}", remote_addr, e)
                    }
                }
            }));
        }
        drop(tcp);

        while connections.next().await.is_some() {}
        Ok(())
    }
}

async fn serve_conn<S>(api: Arc<dyn NodeApi>, mut stream: S) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        let frame = read_frame(&mut stream).await?;
        let request = Request::decode(&frame)?;
        let reply = dispatch(&api, request).await;
        write_frame(&mut stream, &reply.encode()?).await?;
    }
}
