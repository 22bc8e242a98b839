//! WebSocket server accepting clients and wiring each one to the registry.
//!
//! Every accepted socket gets its own task: handshake, a writer task that
//! drains the client's outbound queue into the socket, and the connection
//! lifecycle reading inbound messages.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace};

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::handler::MessageHandler;
use crate::lifecycle::ConnectionLifecycle;
use crate::registry::{ClientHandle, ClientRegistry};

/// Listen backlog for the server socket
const LISTEN_BACKLOG: i32 = 1024;

/// Startup failures; the server cannot listen.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to resolve listen address '{addr}': {err}")]
    Resolve {
        addr: String,
        #[source]
        err: io::Error,
    },
    #[error("Listen address '{0}' resolved to nothing")]
    NoAddress(String),
    #[error("Failed to read bound address: {0}")]
    LocalAddr(#[source] io::Error),
    #[error("Failed to bind {addr}: {err}")]
    Bind {
        addr: SocketAddr,
        #[source]
        err: io::Error,
    },
}

/// Server instance
pub struct Server {
    config: Config,
    registry: Arc<ClientRegistry>,
    handler: MessageHandler,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        Server {
            config,
            registry: Arc::new(ClientRegistry::new()),
            handler: MessageHandler::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Dispatcher broadcasting to this server's clients.
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(Arc::clone(&self.registry))
    }

    /// Resolve the configured address and bind the listener.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let listen = self.config.listen_addr();
        let resolved = tokio::net::lookup_host(listen.as_str())
            .await
            .map_err(|err| ServerError::Resolve {
                addr: listen.clone(),
                err,
            })?;
        let addr =
            pick_listen_addr(resolved).ok_or_else(|| ServerError::NoAddress(listen.clone()))?;

        let listener = create_listener(addr)
            .and_then(TcpListener::from_std)
            .map_err(|err| ServerError::Bind { addr, err })?;

        let local = listener.local_addr().unwrap_or(addr);
        info!(address = %local, "Server listening on ws://{local}");
        Ok(listener)
    }

    /// Accept connections until the process exits.
    pub async fn serve(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "New connection");

                    let registry = Arc::clone(&self.registry);
                    let handler = self.handler;
                    let queue = self.config.client_queue;

                    tokio::spawn(async move {
                        handle_connection(stream, peer, registry, handler, queue).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    /// Bind, then run the accept loop on its own task.
    ///
    /// Returns the bound address and the accept loop's handle. Bind failures
    /// are returned before anything is spawned.
    pub async fn spawn(self) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let listener = self.bind().await?;
        let addr = listener
            .local_addr()
            .map_err(ServerError::LocalAddr)?;
        Ok((addr, tokio::spawn(self.serve(listener))))
    }
}

/// First IPv4 address if any, otherwise the first address.
fn pick_listen_addr(addrs: impl IntoIterator<Item = SocketAddr>) -> Option<SocketAddr> {
    let mut first = None;
    for addr in addrs {
        if addr.is_ipv4() {
            return Some(addr);
        }
        first.get_or_insert(addr);
    }
    first
}

/// Create a TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

/// Handle a single client connection
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<ClientRegistry>,
    handler: MessageHandler,
    queue: usize,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(peer = %peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    let (mut sink, inbound) = ws.split();
    let (tx, mut rx) = mpsc::channel::<Message>(queue);
    let handle = ClientHandle::new(registry.next_id(), peer, tx);

    // Runs until every handle clone is dropped or the socket stops
    // accepting writes; dropping `rx` then fails further sends.
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = sink.send(msg).await {
                trace!(peer = %peer, error = %e, "Write failed");
                return;
            }
        }
        if let Err(e) = sink.close().await {
            trace!(peer = %peer, error = %e, "Close failed");
        }
    });

    let mut lifecycle = ConnectionLifecycle::new(registry, handler, handle);
    lifecycle.run(inbound).await;

    // The lifecycle owned the last long-lived handle; the writer finishes
    // once in-flight broadcasts release their snapshot clones.
    drop(lifecycle);
    if let Err(e) = writer.await {
        debug!(peer = %peer, error = %e, "Writer task failed");
    }
}
