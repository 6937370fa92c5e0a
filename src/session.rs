//! Start/stop orchestration for both ends of the link
//!
//! A sender session chains capture and send on one thread; a receiver
//! session owns the server loop and its playout device. Explicit stop,
//! fatal send errors and capture failures all end in the same teardown.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::audio::{CaptureConfig, CpalPlayout, FrameSource, PlayoutConfig, PlayoutSink, StopHandle};
use crate::config::AppConfig;
use crate::error::{AudioError, Error, NetworkError, Result};
use crate::events::{Event, EventBus};
use crate::network::{
    ClientInfo, ClientOptions, Connector, ServerHandle, ServerOptions, ServerState, ServerStats,
    TransportClient, TransportServer, UdpConnector,
};

/// Why a sender session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// `stop()` was called
    Stopped,
    /// The link failed or was closed underneath the session
    Disconnected(String),
    /// The capture device stopped delivering
    CaptureFailed(String),
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::Stopped => f.write_str("stopped"),
            SessionEnd::Disconnected(reason) => write!(f, "disconnected: {}", reason),
            SessionEnd::CaptureFailed(reason) => write!(f, "capture failed: {}", reason),
        }
    }
}

/// Capture → send pipeline running on its own thread
pub struct SenderSession<C: Connector = UdpConnector> {
    client: Arc<TransportClient<C>>,
    stop: StopHandle,
    thread: Option<JoinHandle<SessionEnd>>,
    outcome: Option<SessionEnd>,
}

impl SenderSession<UdpConnector> {
    /// Connect to the configured receiver, then open the microphone.
    ///
    /// Nothing is touched when capture is not authorized.
    pub fn start(config: &AppConfig, capture_authorized: bool, events: EventBus) -> Result<Self> {
        config.validate()?;
        if !capture_authorized {
            return Err(AudioError::PermissionDenied.into());
        }

        let client = Arc::new(TransportClient::new(
            ClientOptions::from(&config.network),
            events.clone(),
        ));
        client.connect(&config.network.host, config.network.port)?;

        let source = match FrameSource::open(&CaptureConfig::from(&config.audio), capture_authorized) {
            Ok(source) => source.with_events(events.clone()),
            Err(e) => {
                tracing::error!("Cannot open capture: {}", e);
                events.publish(Event::Error(e.to_string()));
                client.disconnect();
                return Err(e.into());
            }
        };

        Self::with_source(client, source)
    }
}

impl<C: Connector> SenderSession<C> {
    /// Run the send loop over an already connected client
    pub fn with_source(client: Arc<TransportClient<C>>, source: FrameSource) -> Result<Self> {
        let stop = source.stop_handle();
        let loop_client = client.clone();

        let thread = thread::Builder::new()
            .name("sender".into())
            .spawn(move || {
                let mut source = source;
                let end = run_sender(&loop_client, &mut source);
                drop(source);
                loop_client.shutdown();
                tracing::info!("Sender session ended: {}", end);
                end
            })
            .map_err(Error::Io)?;

        Ok(Self {
            client,
            stop,
            thread: Some(thread),
            outcome: None,
        })
    }

    /// Stop capturing and close the link. Idempotent.
    pub fn stop(&mut self) -> SessionEnd {
        self.stop.stop();
        self.wait()
    }

    /// Wait for the session to end on its own
    pub fn wait(&mut self) -> SessionEnd {
        if let Some(thread) = self.thread.take() {
            let end = thread
                .join()
                .unwrap_or_else(|_| SessionEnd::CaptureFailed("sender thread panicked".into()));
            self.outcome = Some(end);
        }
        self.outcome.clone().unwrap_or(SessionEnd::Stopped)
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    pub fn client(&self) -> &Arc<TransportClient<C>> {
        &self.client
    }
}

impl<C: Connector> Drop for SenderSession<C> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_sender<C: Connector>(client: &TransportClient<C>, source: &mut FrameSource) -> SessionEnd {
    loop {
        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return SessionEnd::Stopped,
            Err(e) => {
                tracing::error!("Capture failed: {}", e);
                client.events().publish(Event::Error(e.to_string()));
                return SessionEnd::CaptureFailed(e.to_string());
            }
        };

        match client.send(&frame) {
            Ok(()) => {}
            Err(e) if e.is_fatal() || matches!(e, NetworkError::NotConnected) => {
                return SessionEnd::Disconnected(e.to_string());
            }
            // transient, already logged by the client
            Err(_) => {}
        }
    }
}

/// Server loop feeding a playout device
pub struct ReceiverSession {
    handle: ServerHandle,
}

impl ReceiverSession {
    /// Open the output device, bind the port and start receiving
    pub fn start(config: &AppConfig, events: EventBus) -> Result<Self> {
        config.validate()?;
        let options = ServerOptions::from_config(config)?;

        let playout = match CpalPlayout::open(&PlayoutConfig::from(&config.audio)) {
            Ok(playout) => playout,
            Err(e) => {
                tracing::error!("Cannot open playout: {}", e);
                events.publish(Event::Error(e.to_string()));
                return Err(e.into());
            }
        };

        Self::with_sink(options, playout, events)
    }

    /// Receive into any sink
    pub fn with_sink<S: PlayoutSink + 'static>(options: ServerOptions, sink: S, events: EventBus) -> Result<Self> {
        let server = TransportServer::bind(options, events)?;
        let handle = server.spawn(sink)?;
        Ok(Self { handle })
    }

    /// Stop receiving and release the device. Idempotent.
    pub fn stop(&mut self) -> Result<()> {
        self.handle.stop()
    }

    /// Wait for the loop to end on its own (playout or socket failure)
    pub fn join(&mut self) -> Result<()> {
        self.handle.join()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }

    pub fn state(&self) -> ServerState {
        self.handle.state()
    }

    pub fn stats(&self) -> ServerStats {
        self.handle.stats()
    }

    pub fn active_client(&self) -> Option<ClientInfo> {
        self.handle.active_client()
    }
}
