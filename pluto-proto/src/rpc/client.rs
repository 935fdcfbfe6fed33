use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use pluto_sync::frame::{read_frame, write_frame};

use crate::rpc::{Reply, Request};

/// Per-call deadline. A call that blows it counts as a transport failure,
/// which is what triggers the distributor's failover.
const CALL_DEADLINE: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RpcError {
    /// Peer unreachable, connection broken, or deadline exceeded.
    #[error("transport failure talking to {peer}: {reason}")]
    Transport { peer: String, reason: String },
    /// The peer answered something undecodable.
    #[error("protocol failure talking to {peer}: {reason}")]
    Protocol { peer: String, reason: String },
}

/// One logical connection to a serving node. Calls are serialized on the
/// connection; a failed call drops it so the next one redials.
pub struct RpcClient {
    addr: String,
    connector: TlsConnector,
    conn: Mutex<Option<TlsStream<TcpStream>>>,
}

impl RpcClient {
    pub fn new(addr: &str, connector: TlsConnector) -> Self {
        Self {
            addr: addr.to_string(),
            connector,
            conn: Mutex::new(None),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn call(&self, request: &Request) -> Result<Reply, RpcError> {
        let mut guard = self.conn.lock().await;

        // A pooled stream may be stale (peer restarted); retry once on a
        // fresh connection before declaring the peer unreachable.
        let reused = guard.is_some();
        match self.call_on(&mut guard, request).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                *guard = None;
                if !reused {
                    return Err(e);
                }
                match self.call_on(&mut guard, request).await {
                    Ok(reply) => Ok(reply),
                    Err(e) => {
                        *guard = None;
                        Err(e)
                    }
                }
            }
        }
    }

    async fn call_on(
        &self,
        conn: &mut Option<TlsStream<TcpStream>>,
        request: &Request,
    ) -> Result<Reply, RpcError> {
        if conn.is_none() {
            *conn = Some(self.connect().await?);
        }
        let stream = conn.as_mut().unwrap();

        let frame = request.encode().map_err(|e| RpcError::Protocol {
            peer: self.addr.clone(),
            reason: e.to_string(),
        })?;

        let reply_frame = tokio::time::timeout(CALL_DEADLINE, async {
            write_frame(stream, &frame).await?;
            read_frame(stream).await
        })
        .await
        .map_err(|_| self.transport("call deadline exceeded"))?
        .map_err(|e| self.transport(&e.to_string()))?;

        Reply::decode(&reply_frame).map_err(|e| RpcError::Protocol {
            peer: self.addr.clone(),
            reason: e.to_string(),
        })
    }

    async fn connect(&self) -> Result<TlsStream<TcpStream>, RpcError> {
        let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| self.transport("connect timeout"))?
            .map_err(|e| self.transport(&e.to_string()))?;

        let host = self
            .addr
            .rsplit_once(':')
            .map(|(h, _)| h)
            .unwrap_or(self.addr.as_str());
        let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
            .map_err(|e| self.transport(&e.to_string()))?;

        self.connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| self.transport(&e.to_string()))
    }

    fn transport(&self, reason: &str) -> RpcError {
        RpcError::Transport {
            peer: self.addr.clone(),
            reason: reason.to_string(),
        }
    }
}
