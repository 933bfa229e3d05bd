//! Master and Worker transports over WebSockets.
//!
//! Every message is one JSON text frame. The Master listens, and learns which
//! connection reaches which Worker from the `sender_id` of the messages it receives.
//! A Worker keeps trying to connect, and reconnects after losing its connection.

use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::gaggle::common::Envelope;
use crate::gaggle::transport::{ManagerTransport, TransportEvent, WorkerTransport};
use crate::FlockError;

/// How long a Worker waits before trying to connect again.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

// Events from connection tasks to the Master's transport.
enum Inbound {
    Opened(u64, flume::Sender<String>),
    Frame(u64, String),
    Closed(u64),
}

/// The Master's end: accepts Worker connections.
pub struct WebSocketManagerTransport {
    inbound_rx: flume::Receiver<Inbound>,
    connections: HashMap<u64, flume::Sender<String>>,
    routes: HashMap<String, u64>,
    local_addr: SocketAddr,
    listener: JoinHandle<()>,
}
impl WebSocketManagerTransport {
    /// Listen for Workers on `address`, such as `0.0.0.0:5115`.
    pub async fn bind(address: &str) -> Result<Self, FlockError> {
        let listener = TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?;
        info!("master listening for workers on {}", local_addr);
        let (inbound_tx, inbound_rx) = flume::unbounded();
        Ok(WebSocketManagerTransport {
            inbound_rx,
            connections: HashMap::new(),
            routes: HashMap::new(),
            local_addr,
            listener: tokio::spawn(accept_workers(listener, inbound_tx)),
        })
    }

    /// The address actually bound, useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
impl Drop for WebSocketManagerTransport {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn accept_workers(listener: TcpListener, inbound_tx: flume::Sender<Inbound>) {
    let mut connection_id = 0;
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                connection_id += 1;
                debug!("worker connection {} from {}", connection_id, peer);
                tokio::spawn(worker_connection(
                    connection_id,
                    socket,
                    inbound_tx.clone(),
                ));
            }
            Err(e) => warn!("failed to accept worker connection: {}", e),
        }
    }
}

async fn worker_connection(id: u64, socket: TcpStream, inbound_tx: flume::Sender<Inbound>) {
    let stream = match tokio_tungstenite::accept_async(socket).await {
        Ok(stream) => stream,
        Err(e) => {
            info!("invalid worker connection: {}", e);
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = stream.split();
    let (outbound_tx, outbound_rx) = flume::unbounded::<String>();
    if inbound_tx.send(Inbound::Opened(id, outbound_tx)).is_err() {
        return;
    }

    let writer = tokio::spawn(async move {
        while let Ok(text) = outbound_rx.recv_async().await {
            if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                debug!("failed to write to worker connection {}: {}", id, e);
                break;
            }
        }
    });

    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if inbound_tx
                    .send(Inbound::Frame(id, text.as_str().to_string()))
                    .is_err()
                {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            // Pings are answered by tungstenite, nothing else is expected.
            Ok(_) => (),
            Err(e) => {
                info!("worker connection {} failed: {}", id, e);
                break;
            }
        }
    }
    writer.abort();
    let _ = inbound_tx.send(Inbound::Closed(id));
}

impl ManagerTransport for WebSocketManagerTransport {
    fn try_recv(&mut self) -> Option<Envelope> {
        while let Ok(inbound) = self.inbound_rx.try_recv() {
            match inbound {
                Inbound::Opened(id, outbound_tx) => {
                    self.connections.insert(id, outbound_tx);
                }
                Inbound::Closed(id) => {
                    self.connections.remove(&id);
                    self.routes.retain(|_, connection| *connection != id);
                }
                Inbound::Frame(id, text) => match Envelope::from_json(&text) {
                    Ok(envelope) => {
                        self.routes.insert(envelope.sender_id.clone(), id);
                        return Some(envelope);
                    }
                    Err(e) => warn!("dropping malformed message from worker: {}", e),
                },
            }
        }
        None
    }

    fn send_to(&mut self, worker_id: &str, envelope: &Envelope) -> Result<(), FlockError> {
        let connection = self
            .routes
            .get(worker_id)
            .and_then(|id| self.connections.get(id))
            .ok_or(FlockError::Transport {
                detail: format!("no connection to worker {}", worker_id),
            })?;
        connection
            .send(envelope.to_json()?)
            .map_err(|_| FlockError::Transport {
                detail: format!("connection to worker {} closed", worker_id),
            })
    }
}

/// A Worker's end: connects to the Master, reconnecting as needed.
pub struct WebSocketWorkerTransport {
    events_rx: flume::Receiver<TransportEvent>,
    outbound_tx: flume::Sender<String>,
    connected: Arc<AtomicBool>,
}
impl WebSocketWorkerTransport {
    /// Start connecting to the Master at `url`, such as `ws://127.0.0.1:5115`.
    ///
    /// Must be called from within a tokio runtime. Once the transport is dropped the
    /// connection task flushes what was already sent, closes the connection and exits.
    pub fn connect(url: Url) -> Self {
        let (events_tx, events_rx) = flume::unbounded();
        let (outbound_tx, outbound_rx) = flume::unbounded();
        let connected = Arc::new(AtomicBool::new(false));
        tokio::spawn(maintain_connection(
            url,
            events_tx,
            outbound_rx,
            Arc::clone(&connected),
        ));
        WebSocketWorkerTransport {
            events_rx,
            outbound_tx,
            connected,
        }
    }
}

async fn maintain_connection(
    url: Url,
    events_tx: flume::Sender<TransportEvent>,
    outbound_rx: flume::Receiver<String>,
    connected: Arc<AtomicBool>,
) {
    loop {
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                info!("connected to master at {}", url);
                // Anything queued before this connection is stale.
                outbound_rx.drain();
                connected.store(true, Ordering::SeqCst);
                if events_tx.send(TransportEvent::Connected).is_err() {
                    return;
                }

                let (mut ws_sender, mut ws_receiver) = stream.split();
                loop {
                    tokio::select! {
                        outbound = outbound_rx.recv_async() => match outbound {
                            Ok(text) => {
                                if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                                    info!("failed to write to master: {}", e);
                                    break;
                                }
                            }
                            // The transport was dropped.
                            Err(_) => {
                                let _ = ws_sender.close().await;
                                return;
                            }
                        },
                        inbound = ws_receiver.next() => match inbound {
                            Some(Ok(Message::Text(text))) => match Envelope::from_json(text.as_str()) {
                                Ok(envelope) => {
                                    if events_tx.send(TransportEvent::Message(envelope)).is_err() {
                                        return;
                                    }
                                }
                                Err(e) => warn!("dropping malformed message from master: {}", e),
                            },
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => (),
                            Some(Err(e)) => {
                                info!("connection to master failed: {}", e);
                                break;
                            }
                        },
                    }
                }

                connected.store(false, Ordering::SeqCst);
                warn!("lost connection to master at {}", url);
                if events_tx.send(TransportEvent::Disconnected).is_err() {
                    return;
                }
            }
            Err(e) => debug!("failed to connect to master at {}: {}", url, e),
        }
        if outbound_rx.is_disconnected() {
            return;
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

impl WorkerTransport for WebSocketWorkerTransport {
    fn try_recv(&mut self) -> Option<TransportEvent> {
        self.events_rx.try_recv().ok()
    }

    fn send(&mut self, envelope: &Envelope) -> Result<(), FlockError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(FlockError::Transport {
                detail: "not connected to master".to_string(),
            });
        }
        self.outbound_tx
            .send(envelope.to_json()?)
            .map_err(|_| FlockError::Transport {
                detail: "connection task exited".to_string(),
            })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::gaggle::common::{MessageKind, Sequencer};

    async fn next_envelope(master: &mut WebSocketManagerTransport) -> Envelope {
        loop {
            if let Some(envelope) = master.try_recv() {
                return envelope;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn next_event(worker: &mut WebSocketWorkerTransport) -> TransportEvent {
        loop {
            if let Some(event) = worker.try_recv() {
                return event;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn websocket_round_trip() {
        let mut master = WebSocketManagerTransport::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("ws://{}", master.local_addr())).unwrap();
        let mut worker = WebSocketWorkerTransport::connect(url);
        let timeout = Duration::from_secs(5);

        let event = tokio::time::timeout(timeout, next_event(&mut worker))
            .await
            .unwrap();
        assert_eq!(event, TransportEvent::Connected);

        let mut worker_sequence = Sequencer::new("worker_1");
        let ready = worker_sequence
            .envelope(MessageKind::ClientReady, &())
            .unwrap();
        worker.send(&ready).unwrap();
        let received = tokio::time::timeout(timeout, next_envelope(&mut master))
            .await
            .unwrap();
        assert_eq!(received, ready);

        let mut master_sequence = Sequencer::new("master");
        let stop = master_sequence.envelope(MessageKind::Stop, &()).unwrap();
        master.send_to("worker_1", &stop).unwrap();
        let event = tokio::time::timeout(timeout, next_event(&mut worker))
            .await
            .unwrap();
        assert_eq!(event, TransportEvent::Message(stop));

        // Unknown workers can't be addressed.
        assert!(master.send_to("worker_2", &ready).is_err());
    }

    #[tokio::test]
    async fn bind_failure() {
        let master = WebSocketManagerTransport::bind("127.0.0.1:0").await.unwrap();
        let address = master.local_addr().to_string();
        assert!(WebSocketManagerTransport::bind(&address).await.is_err());
    }
}
