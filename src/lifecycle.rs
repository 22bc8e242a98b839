//! Per-connection control loop, from accept to cleanup.
//!
//! ```text
//! Connecting -> Registered -> Receiving -> Closing -> Closed
//! ```
//!
//! Registration is held by a [`Registration`] guard, so the client is
//! unregistered exactly once however the receive loop ends.

use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, trace, warn};

use crate::handler::MessageHandler;
use crate::registry::{ClientHandle, ClientRegistry, Registration};

/// Lifecycle state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Registered,
    Receiving,
    Closing,
    Closed,
}

/// One classified read from the inbound stream.
#[derive(Debug)]
pub enum Inbound {
    /// Payload of a text or binary message.
    Message(Vec<u8>),
    /// The peer closed the connection or the stream ended.
    Closed,
    /// The transport failed.
    TransportError(WsError),
}

/// Why a receive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed or the stream ended.
    Remote,
    /// The transport failed while reading.
    Transport,
    /// A reply could not be queued because the writer had stopped.
    SendFailed,
}

/// Read the next message-bearing item from `inbound`.
///
/// Control frames are skipped; the transport answers pings on its own.
pub async fn next_inbound<S>(inbound: &mut S) -> Inbound
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        match inbound.next().await {
            Some(Ok(Message::Text(text))) => return Inbound::Message(text.as_bytes().to_vec()),
            Some(Ok(Message::Binary(data))) => return Inbound::Message(data.to_vec()),
            Some(Ok(Message::Close(frame))) => {
                trace!(?frame, "Close frame received");
                return Inbound::Closed;
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
            Some(Err(e)) if is_disconnect(&e) => return Inbound::Closed,
            Some(Err(e)) => return Inbound::TransportError(e),
            None => return Inbound::Closed,
        }
    }
}

/// Errors that only mean the peer went away.
fn is_disconnect(e: &WsError) -> bool {
    matches!(
        e,
        WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake)
    )
}

/// Drives one connection: register, handle messages in order, unregister.
pub struct ConnectionLifecycle {
    registry: Arc<ClientRegistry>,
    handler: MessageHandler,
    handle: ClientHandle,
    state: ConnState,
}

impl ConnectionLifecycle {
    pub fn new(registry: Arc<ClientRegistry>, handler: MessageHandler, handle: ClientHandle) -> Self {
        Self {
            registry,
            handler,
            handle,
            state: ConnState::Connecting,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    fn transition(&mut self, next: ConnState) {
        trace!(client = %self.handle.id(), from = ?self.state, to = ?next, "Connection state");
        self.state = next;
    }

    /// Run the connection to completion.
    ///
    /// Each inbound message is fully handled before the next one is read.
    pub async fn run<S>(&mut self, mut inbound: S) -> CloseReason
    where
        S: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        let registration = Registration::new(Arc::clone(&self.registry), self.handle.clone());
        self.transition(ConnState::Registered);
        self.transition(ConnState::Receiving);

        let reason = loop {
            match next_inbound(&mut inbound).await {
                Inbound::Message(raw) => {
                    if let Err(e) = self.handler.handle(&self.handle, &raw).await {
                        debug!(error = %e, "Reply failed, closing connection");
                        break CloseReason::SendFailed;
                    }
                }
                Inbound::Closed => break CloseReason::Remote,
                Inbound::TransportError(e) => {
                    warn!(client = %self.handle.id(), error = %e, "Transport error");
                    break CloseReason::Transport;
                }
            }
        };

        self.transition(ConnState::Closing);
        drop(registration);
        self.transition(ConnState::Closed);
        debug!(client = %self.handle.id(), ?reason, "Connection closed");
        reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use serde_json::{json, Value};
    use std::net::SocketAddr;
    use tokio::sync::mpsc;

    fn client(registry: &ClientRegistry) -> (ClientHandle, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(8);
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        (ClientHandle::new(registry.next_id(), peer, tx), rx)
    }

    fn reply_json(msg: Message) -> Value {
        match msg {
            Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_next_inbound_classification() {
        let mut inbound = stream::iter(vec![
            Ok(Message::Ping(Default::default())),
            Ok(Message::text("a")),
            Ok(Message::binary(b"b".to_vec())),
            Err(WsError::ConnectionClosed),
            Err(WsError::Io(std::io::Error::other("boom"))),
            Ok(Message::Close(None)),
        ]);

        assert!(matches!(next_inbound(&mut inbound).await, Inbound::Message(m) if m == b"a"));
        assert!(matches!(next_inbound(&mut inbound).await, Inbound::Message(m) if m == b"b"));
        assert!(matches!(next_inbound(&mut inbound).await, Inbound::Closed));
        assert!(matches!(
            next_inbound(&mut inbound).await,
            Inbound::TransportError(_)
        ));
        assert!(matches!(next_inbound(&mut inbound).await, Inbound::Closed));
        assert!(matches!(next_inbound(&mut inbound).await, Inbound::Closed));
    }

    #[tokio::test]
    async fn test_session_echoes_and_cleans_up() {
        let registry = Arc::new(ClientRegistry::new());
        let (handle, mut rx) = client(&registry);
        let inbound = stream::iter(vec![
            Ok(Message::text(r#"{"a":1}"#)),
            Ok(Message::text("not json")),
            Ok(Message::text(r#"{"b":2}"#)),
            Ok(Message::Close(None)),
        ]);

        let mut lifecycle =
            ConnectionLifecycle::new(Arc::clone(&registry), MessageHandler::new(), handle);
        assert_eq!(lifecycle.state(), ConnState::Connecting);

        assert_eq!(lifecycle.run(inbound).await, CloseReason::Remote);
        assert_eq!(lifecycle.state(), ConnState::Closed);
        assert!(registry.is_empty());

        assert_eq!(
            reply_json(rx.recv().await.unwrap()),
            json!({"message": "echo", "data": {"a": 1}})
        );
        assert_eq!(
            reply_json(rx.recv().await.unwrap()),
            json!({"message": "error", "error": "Invalid JSON"})
        );
        assert_eq!(
            reply_json(rx.recv().await.unwrap()),
            json!({"message": "echo", "data": {"b": 2}})
        );
    }

    #[tokio::test]
    async fn test_registered_while_receiving() {
        let registry = Arc::new(ClientRegistry::new());
        let (handle, _rx) = client(&registry);
        let id = handle.id();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Result<Message, WsError>>();
        let inbound = channel_stream(in_rx);

        let task_registry = Arc::clone(&registry);
        let task = tokio::spawn(async move {
            let mut lifecycle =
                ConnectionLifecycle::new(task_registry, MessageHandler::new(), handle);
            lifecycle.run(inbound).await
        });

        while !registry.contains(id) {
            tokio::task::yield_now().await;
        }
        assert_eq!(registry.len(), 1);

        drop(in_tx);
        assert_eq!(task.await.unwrap(), CloseReason::Remote);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_transport_error_unregisters() {
        let registry = Arc::new(ClientRegistry::new());
        let (handle, _rx) = client(&registry);
        let inbound = stream::iter(vec![Err(WsError::Io(std::io::Error::other("boom")))]);

        let mut lifecycle =
            ConnectionLifecycle::new(Arc::clone(&registry), MessageHandler::new(), handle);
        assert_eq!(lifecycle.run(inbound).await, CloseReason::Transport);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_dead_writer_ends_session() {
        let registry = Arc::new(ClientRegistry::new());
        let (handle, rx) = client(&registry);
        drop(rx);
        let inbound = stream::iter(vec![
            Ok(Message::text(r#"{"a":1}"#)),
            Ok(Message::text(r#"{"a":2}"#)),
        ]);

        let mut lifecycle =
            ConnectionLifecycle::new(Arc::clone(&registry), MessageHandler::new(), handle);
        assert_eq!(lifecycle.run(inbound).await, CloseReason::SendFailed);
        assert!(registry.is_empty());
    }

    fn channel_stream<T>(
        mut rx: mpsc::UnboundedReceiver<T>,
    ) -> impl Stream<Item = T> + Unpin {
        Box::pin(futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx)))
    }
}
