//! Typed event fan-out for UI and observability layers
//!
//! The core pushes, observers only consume. Each subscriber gets its own
//! unbounded channel; subscribers that hang up are pruned on the next publish.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::network::client::ConnectionState;
use crate::network::server::ServerState;

/// Events emitted by the transport pipeline
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "value", rename_all = "snake_case")]
pub enum Event {
    ConnectionChanged(ConnectionState),
    AudioLevel(f32),
    Error(String),
    PacketCount(u64),
    ServerStateChanged(ServerState),
    ClientConnected(SocketAddr),
    ClientDisconnected(SocketAddr),
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::ConnectionChanged(state) => write!(f, "connection {}", state),
            Event::AudioLevel(level) => write!(f, "level {:.3}", level),
            Event::Error(message) => write!(f, "error: {}", message),
            Event::PacketCount(count) => write!(f, "{} packets", count),
            Event::ServerStateChanged(state) => write!(f, "server {}", state),
            Event::ClientConnected(addr) => write!(f, "client {} connected", addr),
            Event::ClientDisconnected(addr) => write!(f, "client {} disconnected", addr),
        }
    }
}

/// Print events to stdout, one per line, until every publisher is gone.
///
/// JSON lines carry every event; plain text skips the per-frame levels.
pub fn spawn_printer(events: Receiver<Event>, json: bool) -> io::Result<JoinHandle<()>> {
    thread::Builder::new().name("event-printer".into()).spawn(move || {
        let stdout = io::stdout();
        for event in events {
            let line = if json {
                match serde_json::to_string(&event) {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::warn!("Cannot serialize {:?}: {}", event, e);
                        continue;
                    }
                }
            } else if matches!(event, Event::AudioLevel(_)) {
                continue;
            } else {
                event.to_string()
            };

            if writeln!(stdout.lock(), "{}", line).is_err() {
                break;
            }
        }
    })
}

/// Cloneable publisher handle
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<Event>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new observer
    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver an event to every live subscriber
    pub fn publish(&self, event: Event) {
        let mut subscribers = self.subscribers.lock();
        match subscribers.len() {
            0 => {}
            1 => {
                if subscribers[0].send(event).is_err() {
                    subscribers.clear();
                }
            }
            _ => subscribers.retain(|tx| tx.send(event.clone()).is_ok()),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
