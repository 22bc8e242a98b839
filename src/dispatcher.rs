//! Fan-out of outbound messages to every registered client.

use std::sync::Arc;

use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

use crate::envelope::Envelope;
use crate::registry::ClientRegistry;

/// Outcome of one broadcast call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Clients in the snapshot, one send attempt each.
    pub attempted: usize,
    pub delivered: usize,
    /// Clients whose connection had already closed.
    pub failed: usize,
}

/// Delivers messages to all clients in the registry.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<ClientRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self { registry }
    }

    /// Send `msg` once to every client in the current snapshot.
    ///
    /// A failed send is logged and skipped; it never stops delivery to the
    /// remaining clients. Failed clients are left for their own connection
    /// task to unregister. A client with a full queue holds up the call
    /// until it drains.
    pub async fn broadcast(&self, msg: Message) -> BroadcastReport {
        let clients = self.registry.snapshot();
        let mut report = BroadcastReport {
            attempted: clients.len(),
            ..BroadcastReport::default()
        };

        for client in &clients {
            match client.send(msg.clone()).await {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    debug!(error = %e, peer = %client.peer(), "Broadcast send failed");
                    report.failed += 1;
                }
            }
        }

        trace!(
            attempted = report.attempted,
            delivered = report.delivered,
            failed = report.failed,
            "Broadcast complete"
        );
        report
    }

    /// Broadcast one encoded JPEG frame as an image envelope.
    pub async fn send_frame(&self, jpeg: &[u8]) -> BroadcastReport {
        let envelope = Envelope::image(jpeg);
        match envelope.to_message() {
            Ok(msg) => {
                trace!(kind = envelope.kind(), bytes = jpeg.len(), "Sending frame");
                self.broadcast(msg).await
            }
            Err(e) => {
                warn!(kind = envelope.kind(), error = %e, "Failed to serialize envelope");
                BroadcastReport::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ClientHandle, Registration};
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde_json::Value;
    use std::net::SocketAddr;
    use tokio::sync::mpsc;

    fn connect(registry: &Arc<ClientRegistry>) -> (ClientHandle, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(4);
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let handle = ClientHandle::new(registry.next_id(), peer, tx);
        registry.register(handle.clone());
        (handle, rx)
    }

    fn text(msg: Message) -> String {
        match msg {
            Message::Text(text) => text.as_str().to_string(),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_client_once() {
        let registry = Arc::new(ClientRegistry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry));
        let mut receivers: Vec<_> = (0..3).map(|_| connect(&registry).1).collect();

        let report = dispatcher.broadcast(Message::text("hello")).await;
        assert_eq!(
            report,
            BroadcastReport {
                attempted: 3,
                delivered: 3,
                failed: 0
            }
        );

        for rx in &mut receivers {
            assert_eq!(text(rx.recv().await.unwrap()), "hello");
            assert!(rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn test_failed_client_does_not_block_others() {
        let registry = Arc::new(ClientRegistry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry));
        let (_, mut rx1) = connect(&registry);
        let (_, rx2) = connect(&registry);
        let (_, mut rx3) = connect(&registry);
        drop(rx2);

        let report = dispatcher.broadcast(Message::text("frame")).await;
        assert_eq!(report.attempted, 3);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 1);

        assert_eq!(text(rx1.recv().await.unwrap()), "frame");
        assert_eq!(text(rx3.recv().await.unwrap()), "frame");

        // The dispatcher leaves removal to the connection task.
        assert_eq!(registry.len(), 3);
    }

    #[tokio::test]
    async fn test_broadcast_skips_unregistered_client() {
        let registry = Arc::new(ClientRegistry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry));
        let (gone, mut rx_gone) = connect(&registry);
        let (_, mut rx_kept) = connect(&registry);

        registry.unregister(gone.id()).unwrap();
        let report = dispatcher.broadcast(Message::text("after")).await;

        assert_eq!(report.attempted, 1);
        assert!(rx_gone.try_recv().is_err());
        assert_eq!(text(rx_kept.recv().await.unwrap()), "after");
    }

    #[tokio::test]
    async fn test_broadcast_with_no_clients() {
        let registry = Arc::new(ClientRegistry::new());
        let dispatcher = Dispatcher::new(registry);
        assert_eq!(
            dispatcher.broadcast(Message::text("nobody")).await,
            BroadcastReport::default()
        );
    }

    #[tokio::test]
    async fn test_send_frame_envelope() {
        let registry = Arc::new(ClientRegistry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry));
        let (_, mut rx) = connect(&registry);
        let jpeg = b"\xFF\xD8\xFF\xE0fake-jpeg\xFF\xD9";

        let report = dispatcher.send_frame(jpeg).await;
        assert_eq!(report.delivered, 1);

        let value: Value = serde_json::from_str(&text(rx.recv().await.unwrap())).unwrap();
        assert_eq!(value["message"], "image");
        let data = value["data"].as_str().unwrap();
        assert_eq!(STANDARD.decode(data).unwrap(), jpeg);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_broadcast_during_concurrent_churn() {
        let registry = Arc::new(ClientRegistry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry));
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();

        // Queues are deeper than the number of broadcasts, so no send waits.
        let churners: Vec<_> = (0..4)
            .map(|worker| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    for round in 0..100 {
                        let (tx, rx) = mpsc::channel(256);
                        let handle = ClientHandle::new(registry.next_id(), peer, tx);
                        let registration = Registration::new(Arc::clone(&registry), handle);
                        tokio::task::yield_now().await;

                        if (worker + round) % 2 == 0 {
                            drop(rx);
                            tokio::task::yield_now().await;
                            drop(registration);
                        } else {
                            drop(registration);
                            drop(rx);
                        }
                    }
                })
            })
            .collect();

        let broadcaster = tokio::spawn(async move {
            let mut reports = Vec::with_capacity(200);
            for _ in 0..200 {
                reports.push(dispatcher.broadcast(Message::text("tick")).await);
                tokio::task::yield_now().await;
            }
            reports
        });

        for churner in churners {
            churner.await.unwrap();
        }
        let reports = broadcaster.await.unwrap();

        assert_eq!(reports.len(), 200);
        for report in &reports {
            assert_eq!(report.attempted, report.delivered + report.failed);
        }
        assert!(registry.is_empty());
    }
}
