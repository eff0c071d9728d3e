use crate::ber;
use crate::config::Config;
use crate::directory::{CredentialStore, SyntheticDirectory};
use crate::event::{self, Event, EventLog, EventSink, EventValue};
use crate::ldap_handler::{HandlerChain, Session, TlsState};
use crate::ldap_protocol::{self, is_unbind_request};
use crate::metrics::Metrics;
use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Client stream: either plain or TLS-wrapped, so one loop serves ldap://, ldaps:// and StartTLS upgrades.
pub enum ClientStream<S> {
    Plain(S),
    Tls(Box<TlsStream<S>>),
}

impl<S> ClientStream<S> {
    pub fn is_tls(&self) -> bool {
        matches!(self, ClientStream::Tls(_))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for ClientStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for ClientStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            ClientStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Everything a connection loop needs; shared read-only between connections.
pub struct ServerContext {
    pub chain: HandlerChain,
    pub sink: Arc<dyn EventSink>,
    pub metrics: Arc<Metrics>,
    pub tls_acceptor: Option<TlsAcceptor>,
    pub cancel: CancellationToken,
}

impl ServerContext {
    pub fn new(
        chain: HandlerChain,
        sink: Arc<dyn EventSink>,
        metrics: Arc<Metrics>,
        tls_acceptor: Option<TlsAcceptor>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            chain,
            sink,
            metrics,
            tls_acceptor,
            cancel,
        }
    }

    /// Standard handler chain over the configured credentials and RootDSE.
    pub fn from_config(
        config: &Config,
        sink: Arc<dyn EventSink>,
        metrics: Arc<Metrics>,
        tls_acceptor: Option<TlsAcceptor>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let credentials = CredentialStore::new(&config.credentials, config.anonymous_bind)
            .context("Invalid credentials list")?;
        info!(
            "Loaded {} credentials (anonymous bind {})",
            credentials.len(),
            if config.anonymous_bind { "allowed" } else { "refused" }
        );
        if credentials.is_empty() {
            warn!("No credentials configured, only anonymous binds can succeed");
        }
        let directory = SyntheticDirectory::new(config.root_dse.clone());
        let chain = HandlerChain::standard(Arc::new(credentials), Arc::new(directory));
        Ok(Self::new(chain, sink, metrics, tls_acceptor, cancel))
    }
}

pub struct HoneypotServer {
    listen_url: String,
    ctx: Arc<ServerContext>,
}

impl HoneypotServer {
    pub fn new(listen_url: String, ctx: Arc<ServerContext>) -> Self {
        Self { listen_url, ctx }
    }

    fn implicit_tls(&self) -> bool {
        self.listen_url.starts_with("ldaps://")
    }

    pub async fn start(&self) -> Result<()> {
        let addr = parse_listen_url(&self.listen_url)?;
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;
        info!("LDAP honeypot listening on {} ({})", addr, self.listen_url);
        self.serve(listener).await
    }

    /// Accept connections until cancelled.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let implicit_tls = self.implicit_tls();
        if implicit_tls && self.ctx.tls_acceptor.is_none() {
            bail!("{} requires a TLS certificate", self.listen_url);
        }

        loop {
            let accepted = tokio::select! {
                _ = self.ctx.cancel.cancelled() => {
                    info!("Listener {} shutting down", self.listen_url);
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };
            let (stream, peer_addr) = match accepted {
                Ok(a) => a,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            debug!("New connection from {}", peer_addr);
            self.ctx.metrics.inc_connections();
            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(async move {
                let local = stream.local_addr().ok();
                let client_stream = match (&ctx.tls_acceptor, implicit_tls) {
                    (Some(acceptor), true) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => ClientStream::Tls(Box::new(tls_stream)),
                        Err(e) => {
                            error!("TLS handshake failed for {}: {}", peer_addr, e);
                            return;
                        }
                    },
                    _ => ClientStream::<TcpStream>::Plain(stream),
                };
                if let Err(e) = handle_connection(client_stream, peer_addr, local, ctx).await {
                    warn!("Connection {} closed: {:#}", peer_addr, e);
                }
            });
        }
    }
}

pub fn parse_listen_url(url: &str) -> Result<SocketAddr> {
    // Parse ldap://host:port or ldaps://host:port
    let url = url
        .strip_prefix("ldap://")
        .or_else(|| url.strip_prefix("ldaps://"))
        .ok_or_else(|| anyhow::anyhow!("Invalid URL scheme, expected ldap:// or ldaps://"))?;

    let url = url.trim_start_matches('/');

    if let Some(port) = url.strip_prefix(':') {
        // Just port specified, bind to all interfaces
        let port: u16 = port.parse().context("Invalid port number")?;
        Ok(SocketAddr::from(([0, 0, 0, 0], port)))
    } else {
        url.parse()
            .with_context(|| format!("Failed to parse address: {}", url))
    }
}

async fn upgrade<S>(stream: ClientStream<S>, acceptor: &TlsAcceptor) -> Result<ClientStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match stream {
        ClientStream::Plain(s) => {
            let tls_stream = acceptor.accept(s).await.context("StartTLS handshake failed")?;
            Ok(ClientStream::Tls(Box::new(tls_stream)))
        }
        ClientStream::Tls(_) => bail!("StartTLS on an encrypted stream"),
    }
}

/// Serve one client: read a request, answer it, report it, repeat.
///
/// Returns Ok on EOF, unbind or cancellation. Undecodable input and I/O failures end
/// the connection with an error.
pub async fn handle_connection<S>(
    mut stream: ClientStream<S>,
    peer: SocketAddr,
    local: Option<SocketAddr>,
    ctx: Arc<ServerContext>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let tls_state = if stream.is_tls() {
        TlsState::Active
    } else if ctx.tls_acceptor.is_some() {
        TlsState::Available
    } else {
        TlsState::Unavailable
    };
    let mut session = Session::new(peer, local, tls_state);
    let mut buffer = BytesMut::with_capacity(4096);

    loop {
        let read = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => None,
            read = ber::read_packet(&mut stream, &mut buffer) => Some(read),
        };
        let Some(read) = read else {
            debug!("Closing connection from {} on shutdown", peer);
            let _ = stream.shutdown().await;
            return Ok(());
        };
        let packet = match read {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                debug!("Client {} disconnected", peer);
                return Ok(());
            }
            Err(e) => {
                ctx.metrics.inc_decode_error();
                return Err(e).with_context(|| format!("Undecodable request from {}", peer));
            }
        };
        let started = Instant::now();

        let message_id = match ldap_protocol::message_id(&packet) {
            Ok(id) => id,
            Err(e) => {
                ctx.metrics.inc_decode_error();
                return Err(e).with_context(|| format!("Unreadable envelope from {}", peer));
            }
        };

        let mut log = EventLog::new();
        log.insert(event::MESSAGE_ID, message_id);

        if is_unbind_request(&packet) {
            debug!("Unbind from {} (message {})", peer, message_id);
            log.insert(event::REQUEST_TYPE, "unbind");
            ctx.metrics.record_request("unbind", started.elapsed());
            ctx.sink.send(Event::new(peer, local, log));
            return Ok(());
        }

        match ctx.chain.dispatch(&packet, &mut session, &mut log) {
            Some(responses) => {
                let mut out = Vec::new();
                for response in &responses {
                    out.extend_from_slice(&ber::encode(response));
                }
                if !out.is_empty() {
                    stream.write_all(&out).await.context("Failed to send response")?;
                    stream.flush().await.context("Failed to flush response")?;
                }
                debug!("Message {} from {}: {} response packets", message_id, peer, responses.len());
            }
            None => {
                warn!("No handler claimed message {} from {}", message_id, peer);
                ctx.metrics.inc_unclaimed();
            }
        }

        if let Some(EventValue::Text(result)) = log.get(event::BIND_RESULT) {
            ctx.metrics.record_bind(result == "success");
        }

        let request_type = log.request_type().unwrap_or_else(|| "unknown".to_string());
        ctx.metrics.record_request(&request_type, started.elapsed());
        ctx.sink.send(Event::new(peer, local, log));

        if session.take_tls_request() {
            let Some(acceptor) = ctx.tls_acceptor.as_ref() else {
                bail!("StartTLS accepted without a TLS configuration");
            };
            // Anything pipelined behind the StartTLS request is plaintext and must not survive the upgrade.
            buffer.clear();
            stream = upgrade(stream, acceptor).await?;
            ctx.metrics.inc_starttls();
            debug!("StartTLS upgrade completed for {}", peer);
        }
    }
}
