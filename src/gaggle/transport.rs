//! The transport contract between a Master and its Workers.
//!
//! A transport delivers [`Envelope`]s in order per sender, and reports lost
//! connections where it can. Two transports are provided: a WebSocket transport for
//! real deployments, and an in-memory transport for tests and single-process setups.
//!
//! # Example
//! ```rust
//! use flock::gaggle::transport::{memory_transport, TransportEvent, WorkerTransport};
//!
//! let (master, connector) = memory_transport();
//! let mut worker = connector.connect();
//! assert!(matches!(worker.try_recv(), Some(TransportEvent::Connected)));
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::gaggle::common::Envelope;
use crate::FlockError;

/// The Master's end of a transport.
pub trait ManagerTransport: Send {
    /// The next message from any Worker, if one is waiting.
    fn try_recv(&mut self) -> Option<Envelope>;
    /// Send a message to one Worker, addressed by the id it sends with.
    fn send_to(&mut self, worker_id: &str, envelope: &Envelope) -> Result<(), FlockError>;
}

/// What a Worker's end of a transport can report.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// Connected, or connected again, to the Master.
    Connected,
    /// Lost the connection to the Master.
    Disconnected,
    Message(Envelope),
}

/// A Worker's end of a transport.
pub trait WorkerTransport: Send {
    fn try_recv(&mut self) -> Option<TransportEvent>;
    fn send(&mut self, envelope: &Envelope) -> Result<(), FlockError>;
}

// A message from a Worker, and where replies go.
struct MemoryFrame {
    text: String,
    reply_tx: flume::Sender<String>,
}

/// The Master's end of an in-memory transport.
pub struct MemoryManagerTransport {
    inbound_rx: flume::Receiver<MemoryFrame>,
    routes: HashMap<String, flume::Sender<String>>,
}

/// Creates Worker ends of an in-memory transport.
#[derive(Clone)]
pub struct MemoryConnector {
    inbound_tx: flume::Sender<MemoryFrame>,
}

/// A Worker's end of an in-memory transport.
pub struct MemoryWorkerTransport {
    inbound_tx: flume::Sender<MemoryFrame>,
    reply_tx: flume::Sender<String>,
    reply_rx: flume::Receiver<String>,
    link: MemoryLink,
    was_connected: bool,
}

/// Simulates losing and restoring a Worker's connection.
#[derive(Clone, Debug)]
pub struct MemoryLink {
    connected: Arc<AtomicBool>,
}
impl MemoryLink {
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// An in-memory transport: one Master end, and a connector creating Worker ends.
pub fn memory_transport() -> (MemoryManagerTransport, MemoryConnector) {
    let (inbound_tx, inbound_rx) = flume::unbounded();
    (
        MemoryManagerTransport {
            inbound_rx,
            routes: HashMap::new(),
        },
        MemoryConnector { inbound_tx },
    )
}

impl MemoryConnector {
    pub fn connect(&self) -> MemoryWorkerTransport {
        let (reply_tx, reply_rx) = flume::unbounded();
        MemoryWorkerTransport {
            inbound_tx: self.inbound_tx.clone(),
            reply_tx,
            reply_rx,
            link: MemoryLink {
                connected: Arc::new(AtomicBool::new(true)),
            },
            was_connected: false,
        }
    }
}

impl MemoryWorkerTransport {
    /// A handle to break and restore this Worker's connection.
    pub fn link(&self) -> MemoryLink {
        self.link.clone()
    }
}

impl ManagerTransport for MemoryManagerTransport {
    fn try_recv(&mut self) -> Option<Envelope> {
        while let Ok(frame) = self.inbound_rx.try_recv() {
            match Envelope::from_json(&frame.text) {
                Ok(envelope) => {
                    self.routes
                        .insert(envelope.sender_id.clone(), frame.reply_tx);
                    return Some(envelope);
                }
                Err(e) => warn!("dropping malformed message from worker: {}", e),
            }
        }
        None
    }

    fn send_to(&mut self, worker_id: &str, envelope: &Envelope) -> Result<(), FlockError> {
        let route = self.routes.get(worker_id).ok_or(FlockError::Transport {
            detail: format!("no route to worker {}", worker_id),
        })?;
        route
            .send(envelope.to_json()?)
            .map_err(|_| FlockError::Transport {
                detail: format!("worker {} is gone", worker_id),
            })
    }
}

impl WorkerTransport for MemoryWorkerTransport {
    fn try_recv(&mut self) -> Option<TransportEvent> {
        let connected = self.link.is_connected();
        if connected != self.was_connected {
            self.was_connected = connected;
            if connected {
                return Some(TransportEvent::Connected);
            }
            // Whatever was in flight is lost with the connection.
            self.reply_rx.drain();
            return Some(TransportEvent::Disconnected);
        }
        if !connected {
            self.reply_rx.drain();
            return None;
        }
        while let Ok(text) = self.reply_rx.try_recv() {
            match Envelope::from_json(&text) {
                Ok(envelope) => return Some(TransportEvent::Message(envelope)),
                Err(e) => warn!("dropping malformed message from master: {}", e),
            }
        }
        None
    }

    fn send(&mut self, envelope: &Envelope) -> Result<(), FlockError> {
        if !self.link.is_connected() {
            return Err(FlockError::Transport {
                detail: "not connected to master".to_string(),
            });
        }
        self.inbound_tx
            .send(MemoryFrame {
                text: envelope.to_json()?,
                reply_tx: self.reply_tx.clone(),
            })
            .map_err(|_| FlockError::Transport {
                detail: "master is gone".to_string(),
            })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::gaggle::common::{MessageKind, Sequencer};

    #[test]
    fn memory_round_trip() {
        let (mut master, connector) = memory_transport();
        let mut worker = connector.connect();
        let mut worker_sequence = Sequencer::new("worker_1");
        let mut master_sequence = Sequencer::new("master");

        assert_eq!(worker.try_recv(), Some(TransportEvent::Connected));
        assert_eq!(worker.try_recv(), None);

        // The Master can't address a Worker it hasn't heard from.
        let stop = master_sequence.envelope(MessageKind::Stop, &()).unwrap();
        assert!(master.send_to("worker_1", &stop).is_err());

        let ready = worker_sequence
            .envelope(MessageKind::ClientReady, &())
            .unwrap();
        worker.send(&ready).unwrap();
        assert_eq!(master.try_recv(), Some(ready));

        master.send_to("worker_1", &stop).unwrap();
        assert_eq!(worker.try_recv(), Some(TransportEvent::Message(stop)));
    }

    #[test]
    fn lost_connection() {
        let (mut master, connector) = memory_transport();
        let mut worker = connector.connect();
        let link = worker.link();
        let mut worker_sequence = Sequencer::new("worker_1");
        let mut master_sequence = Sequencer::new("master");
        assert_eq!(worker.try_recv(), Some(TransportEvent::Connected));
        worker
            .send(&worker_sequence.envelope(MessageKind::ClientReady, &()).unwrap())
            .unwrap();
        master.try_recv().unwrap();

        link.disconnect();
        assert!(worker
            .send(&worker_sequence.envelope(MessageKind::Heartbeat, &()).unwrap())
            .is_err());
        master
            .send_to("worker_1", &master_sequence.envelope(MessageKind::Stop, &()).unwrap())
            .unwrap();
        assert_eq!(worker.try_recv(), Some(TransportEvent::Disconnected));
        // Messages sent while disconnected are lost.
        link.reconnect();
        assert_eq!(worker.try_recv(), Some(TransportEvent::Connected));
        assert_eq!(worker.try_recv(), None);
    }
}
