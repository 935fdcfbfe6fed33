use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use uuid::Uuid;

use pluto_mail::mailbox::normalize_name;
use pluto_sync::frame::MAX_FRAME;
use pluto_user::config::Config;
use pluto_user::login::{ArcLoginProvider, AuthError};

use crate::imap::command::Command;
use crate::imap::parse::{parse_command, split_tag};
use crate::rpc::{Reply, Request, RpcClient, RpcError, SessionCtx};

/// Longest accepted command line. Literals are not lines and are bounded by
/// the frame ceiling instead.
const MAX_LINE: usize = 16 * 1024;

/// The public IMAP front-end: authenticates clients, routes each session to
/// the worker owning the user, and relays replies verbatim. Stateless
/// beyond the live connections, so it can be replicated freely.
pub struct Distributor {
    bind_addr: SocketAddr,
    acceptor: TlsAcceptor,
    connector: TlsConnector,
    login: ArcLoginProvider,
    config: Arc<Config>,
}

#[derive(Clone)]
struct ClientContext {
    connector: TlsConnector,
    login: ArcLoginProvider,
    config: Arc<Config>,
}

impl Distributor {
    pub fn new(
        bind_addr: SocketAddr,
        acceptor: TlsAcceptor,
        connector: TlsConnector,
        login: ArcLoginProvider,
        config: Arc<Config>,
    ) -> Self {
        Self {
            bind_addr,
            acceptor,
            connector,
            login,
            config,
        }
    }

    pub async fn run(self, mut must_exit: watch::Receiver<bool>) -> Result<()> {
        let tcp = TcpListener::bind(self.bind_addr)
            .await
            .with_context(|| format!("binding IMAP listener on {}", self.bind_addr))?;
        tracing::info!("IMAP listener on {}", self.bind_addr);

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
            tracing::info!("IMAP connection from {}", remote_addr);

            let acceptor = self.acceptor.clone();
            let ctx = ClientContext {
                connector: self.connector.clone(),
                login: self.login.clone(),
                config: self.config.clone(),
            };
            connections.push(tokio::spawn(async move {
                match acceptor.accept(socket).await {
                    Ok(tls) => {
                        if let Err(e) = handle_client(ctx, tls).await {
                            tracing::debug!("session from {} ended: {:#}", remote_addr, e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("TLS handshake with {} failed: {}", remote_addr, e)
                    }
                }
            }));
        }
        drop(tcp);

        tracing::info!("IMAP front-end draining remaining sessions");
        while connections.next().await.is_some() {}
        Ok(())
    }
}

async fn handle_client<S>(ctx: ClientContext, stream: S) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (rd, mut wr) = tokio::io::split(stream);
    let mut rd = BufReader::new(rd);

    send_line(&mut wr, "* OK IMAP4rev1 Pluto ready").await?;

    // Pre-auth dialog, ends with a successful LOGIN or the client leaving
    let (login_tag, who) = loop {
        let line = match read_client_line(&mut rd).await? {
            Some(line) => line,
            None => return Ok(()),
        };
        let Some((tag, rest)) = split_tag(&line) else {
            send_line(&mut wr, "* BAD Invalid command line").await?;
            continue;
        };
        let command = match parse_command(rest) {
            Ok(c) => c,
            Err(e) => {
                send_line(&mut wr, &format!("{} BAD {}", tag, e)).await?;
                continue;
            }
        };
        match command {
            Command::Capability => {
                send_line(&mut wr, "* CAPABILITY IMAP4rev1").await?;
                send_line(&mut wr, &format!("{} OK CAPABILITY completed", tag)).await?;
            }
            Command::Noop => {
                send_line(&mut wr, &format!("{} OK NOOP completed", tag)).await?;
            }
            Command::Logout => {
                send_line(&mut wr, "* BYE Terminating connection").await?;
                send_line(&mut wr, &format!("{} OK LOGOUT completed", tag)).await?;
                return Ok(());
            }
            Command::Login { username, password } => {
                match ctx.login.login(&username, &password).await {
                    Ok(who) => break (tag.to_string(), who),
                    Err(AuthError::Failed) => {
                        send_line(&mut wr, &format!("{} NO Name and / or password wrong", tag))
                            .await?;
                    }
                    Err(AuthError::Internal(e)) => {
                        tracing::error!("authenticator failure: {}", e);
                        send_line(&mut wr, &format!("{} NO LOGIN failed", tag)).await?;
                    }
                }
            }
            _ => {
                send_line(&mut wr, &format!("{} BAD Please login first", tag)).await?;
            }
        }
    };

    // Route to the owning worker; storage is the failover twin
    let Some((worker_name, worker)) = ctx.config.worker_for_user(who.user_id) else {
        tracing::error!(user = %who.username, id = who.user_id, "no worker covers this user id");
        send_line(&mut wr, &format!("{} NO LOGIN failed", login_tag)).await?;
        return Ok(());
    };

    let mut upstream = Upstream {
        ctx: SessionCtx {
            client_id: Uuid::new_v4().to_string(),
            user: who.username.clone(),
            resp_worker: worker_name.to_string(),
            selected: None,
        },
        primary: RpcClient::new(&worker.rpc_public, ctx.connector.clone()),
        fallback: RpcClient::new(&ctx.config.storage.rpc_public, ctx.connector.clone()),
        on_fallback: false,
    };

    match upstream.prepare().await {
        Ok(()) => {
            tracing::info!(
                user = %who.username,
                worker = %worker_name,
                client = %upstream.ctx.client_id,
                "session established"
            );
            send_line(&mut wr, &format!("{} OK LOGIN completed", login_tag)).await?;
        }
        Err(e) => {
            tracing::error!("unable to prepare session anywhere: {:#}", e);
            send_line(&mut wr, "* BYE No node can serve this session").await?;
            return Ok(());
        }
    }

    let result = proxy_loop(&mut rd, &mut wr, &mut upstream).await;
    let _ = upstream.close().await;
    result
}

async fn proxy_loop<R, W>(
    rd: &mut BufReader<R>,
    wr: &mut W,
    upstream: &mut Upstream,
) -> Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    loop {
        let line = match read_client_line(rd).await? {
            Some(line) => line,
            None => return Ok(()), // client hung up
        };
        let Some((tag, rest)) = split_tag(&line) else {
            send_line(wr, "* BAD Invalid command line").await?;
            continue;
        };
        let command = match parse_command(rest) {
            Ok(c) => c,
            Err(e) => {
                send_line(wr, &format!("{} BAD {}", tag, e)).await?;
                continue;
            }
        };

        match command {
            Command::Login { .. } => {
                send_line(wr, &format!("{} BAD Already logged in", tag)).await?;
                continue;
            }
            Command::Append { size, .. } if size > MAX_FRAME => {
                send_line(wr, &format!("{} NO Message exceeds the size ceiling", tag)).await?;
                continue;
            }
            _ => (),
        }

        let is_logout = matches!(command, Command::Logout);
        let select_target = match &command {
            Command::Select { mailbox } => Some(normalize_name(mailbox)),
            _ => None,
        };
        let delete_target = match &command {
            Command::Delete { mailbox } => Some(normalize_name(mailbox)),
            _ => None,
        };
        let append_command = match &command {
            Command::Append { .. } => Some(command.clone()),
            _ => None,
        };

        let reply = match upstream
            .call(Request::Command {
                client_id: upstream.ctx.client_id.clone(),
                tag: tag.to_string(),
                command,
            })
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!("session lost both nodes: {:#}", e);
                send_line(wr, "* BYE Service unavailable").await?;
                return Ok(());
            }
        };

        match reply {
            Reply::Lines(lines) => {
                let completed_ok = lines
                    .last()
                    .map(|l| l.starts_with(&format!("{} OK", tag)))
                    .unwrap_or(false);
                relay(wr, &lines).await?;

                // Track the selection for failover re-preparation
                if let Some(mailbox) = select_target {
                    upstream.ctx.selected = completed_ok.then_some(mailbox);
                }
                if let Some(mailbox) = delete_target {
                    if completed_ok && upstream.ctx.selected.as_deref() == Some(mailbox.as_str()) {
                        upstream.ctx.selected = None;
                    }
                }
                if is_logout {
                    return Ok(());
                }
            }
            Reply::AwaitLiteral(size) => {
                send_line(wr, "+ Ready for literal data").await?;

                let mut mail = vec![0u8; size];
                if let Err(e) = rd.read_exact(&mut mail).await {
                    tracing::info!("client left during APPEND literal: {}", e);
                    let _ = upstream.abort_append().await;
                    return Ok(());
                }
                // The command line's closing CRLF follows the literal
                let _ = read_client_line(rd).await;

                let append_command = append_command.expect("literal invited outside APPEND");
                match upstream.append_end(tag, append_command, mail).await {
                    Ok(Reply::Lines(lines)) => relay(wr, &lines).await?,
                    Ok(Reply::Refused(msg)) => {
                        send_line(wr, &format!("* BYE {}", msg)).await?;
                        return Ok(());
                    }
                    Ok(other) => {
                        tracing::error!("unexpected append reply: {:?}", other);
                        send_line(wr, "* BYE Internal proxy error").await?;
                        return Ok(());
                    }
                    Err(e) => {
                        tracing::error!("session lost both nodes: {:#}", e);
                        send_line(wr, "* BYE Service unavailable").await?;
                        return Ok(());
                    }
                }
            }
            Reply::Refused(msg) => {
                send_line(wr, &format!("* BYE {}", msg)).await?;
                return Ok(());
            }
            Reply::Confirm => {
                tracing::error!("confirmation where a command reply was expected");
                send_line(wr, "* BYE Internal proxy error").await?;
                return Ok(());
            }
        }
    }
}

/// The pair of serving nodes behind one client session. Every call goes to
/// the primary worker until a transport failure, then the session is
/// re-prepared on storage and the call replayed there.
struct Upstream {
    ctx: SessionCtx,
    primary: RpcClient,
    fallback: RpcClient,
    on_fallback: bool,
}

impl Upstream {
    fn active(&self) -> &RpcClient {
        if self.on_fallback {
            &self.fallback
        } else {
            &self.primary
        }
    }

    async fn prepare(&mut self) -> Result<()> {
        if !self.on_fallback {
            match self.primary.call(&Request::Prepare(self.ctx.clone())).await {
                Ok(Reply::Confirm) => return Ok(()),
                Ok(other) => bail!("prepare refused by worker: {:?}", other),
                Err(RpcError::Transport { peer, reason }) => {
                    tracing::warn!("worker {} unreachable ({}), failing over", peer, reason);
                    self.on_fallback = true;
                }
                Err(e) => return Err(e.into()),
            }
        }
        match self.fallback.call(&Request::Prepare(self.ctx.clone())).await? {
            Reply::Confirm => Ok(()),
            other => bail!("prepare refused by storage: {:?}", other),
        }
    }

    async fn call(&mut self, request: Request) -> Result<Reply> {
        if !self.on_fallback {
            match self.primary.call(&request).await {
                Ok(reply) => return Ok(reply),
                Err(RpcError::Transport { peer, reason }) => {
                    tracing::warn!("worker {} unreachable ({}), failing over", peer, reason);
                    self.fail_over().await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(self.fallback.call(&request).await?)
    }

    /// Re-prepare the session on storage with the tracked context, so the
    /// replayed call finds the same session state.
    async fn fail_over(&mut self) -> Result<()> {
        self.on_fallback = true;
        match self.fallback.call(&Request::Prepare(self.ctx.clone())).await? {
            Reply::Confirm => Ok(()),
            other => bail!("failover prepare refused: {:?}", other),
        }
    }

    /// Finish an APPEND. If the worker dies between the two halves, both
    /// halves are replayed against storage.
    async fn append_end(
        &mut self,
        tag: &str,
        append_command: Command,
        mail: Vec<u8>,
    ) -> Result<Reply> {
        let request = Request::AppendEnd {
            client_id: self.ctx.client_id.clone(),
            mail: mail.clone(),
        };
        match self.active().call(&request).await {
            Ok(reply) => Ok(reply),
            Err(RpcError::Transport { peer, reason }) if !self.on_fallback => {
                tracing::warn!("worker {} unreachable ({}), failing over", peer, reason);
                self.fail_over().await?;
                let begin = self
                    .fallback
                    .call(&Request::Command {
                        client_id: self.ctx.client_id.clone(),
                        tag: tag.to_string(),
                        command: append_command,
                    })
                    .await?;
                match begin {
                    Reply::AwaitLiteral(_) => Ok(self.fallback.call(&request).await?),
                    other => Ok(other),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn abort_append(&mut self) -> Result<()> {
        let _ = self
            .active()
            .call(&Request::AppendAbort {
                client_id: self.ctx.client_id.clone(),
            })
            .await;
        self.close().await
    }

    async fn close(&mut self) -> Result<()> {
        let _ = self
            .active()
            .call(&Request::Close {
                client_id: self.ctx.client_id.clone(),
            })
            .await;
        Ok(())
    }
}

async fn send_line<W: tokio::io::AsyncWrite + Unpin>(wr: &mut W, line: &str) -> Result<()> {
    wr.write_all(line.as_bytes()).await?;
    wr.write_all(b"\r\n").await?;
    wr.flush().await?;
    Ok(())
}

async fn relay<W: tokio::io::AsyncWrite + Unpin>(wr: &mut W, lines: &[String]) -> Result<()> {
    for line in lines {
        wr.write_all(line.as_bytes()).await?;
        wr.write_all(b"\r\n").await?;
    }
    wr.flush().await?;
    Ok(())
}

/// One client line, or `None` on a clean disconnect. The length cap is
/// enforced while reading: a client that never sends the terminating
/// newline cannot grow the buffer past `MAX_LINE`.
async fn read_client_line<R: tokio::io::AsyncRead + Unpin>(
    rd: &mut BufReader<R>,
) -> Result<Option<String>> {
    let mut line = Vec::new();
    loop {
        let (consumed, at_end) = {
            let buf = rd.fill_buf().await?;
            if buf.is_empty() {
                // EOF; a clean disconnect only if nothing was pending
                if line.is_empty() {
                    return Ok(None);
                }
                (0, true)
            } else {
                match buf.iter().position(|&b| b == b'\n') {
                    Some(pos) => {
                        line.extend_from_slice(&buf[..=pos]);
                        (pos + 1, true)
                    }
                    None => {
                        line.extend_from_slice(buf);
                        (buf.len(), false)
                    }
                }
            }
        };
        rd.consume(consumed);
        if line.len() > MAX_LINE {
            bail!("command line exceeds {} bytes", MAX_LINE);
        }
        if at_end {
            return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
        }
    }
}
