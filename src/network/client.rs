//! Transport client
//!
//! Owns the outbound socket and the connection state machine:
//!
//! ```text
//! Disconnected ──connect()──▶ Probing ──probe sent──▶ Connected
//!      ▲                         │                        │
//!      └────── probe failed ─────┘     fatal send error / disconnect()
//!      └──────────────────────────────────────────────────┘
//! ```
//!
//! Reachability is judged from the probe send alone; the receiver never
//! answers. State and counters are atomics so observers can read them while
//! the capture thread sends.

use parking_lot::Mutex;
use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use crate::audio::AudioFrame;
use crate::config::NetworkConfig;
use crate::constants::{PACKET_COUNT_INTERVAL, PROBE_TIMEOUT, STEADY_TIMEOUT};
use crate::error::NetworkError;
use crate::events::{Event, EventBus};
use crate::network::socket::{resolve, Connector, DatagramSocket, UdpConnector};
use crate::protocol;

/// Link health as seen by the sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Probing,
    Connected,
}

impl ConnectionState {
    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Probing => 1,
            ConnectionState::Connected => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Probing,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Probing => "probing",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Client timing settings
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Bounded wait for the probe send
    pub probe_timeout: Duration,
    /// How long to listen for an ICMP report after the probe
    pub probe_settle: Duration,
    /// Socket timeout once connected
    pub steady_timeout: Duration,
    /// Packets between two packet-count events, 0 disables them
    pub packet_count_interval: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            probe_timeout: PROBE_TIMEOUT,
            probe_settle: Duration::from_millis(100),
            steady_timeout: STEADY_TIMEOUT,
            packet_count_interval: PACKET_COUNT_INTERVAL,
        }
    }
}

impl From<&NetworkConfig> for ClientOptions {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            probe_timeout: config.probe_timeout(),
            steady_timeout: config.steady_timeout(),
            packet_count_interval: config.packet_count_interval.max(1),
            ..Self::default()
        }
    }
}

/// Read-only diagnostics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub state: ConnectionState,
    pub target: Option<SocketAddr>,
    pub packets_sent: u64,
    pub send_errors: u64,
    pub next_sequence: u32,
}

/// Outbound half of the audio link
pub struct TransportClient<C: Connector = UdpConnector> {
    connector: C,
    options: ClientOptions,
    events: EventBus,
    state: AtomicU8,
    sequence: AtomicU32,
    packets_sent: AtomicU64,
    send_errors: AtomicU64,
    socket: Mutex<Option<C::Socket>>,
    target: Mutex<Option<SocketAddr>>,
}

impl TransportClient<UdpConnector> {
    /// Client over real UDP sockets
    pub fn new(options: ClientOptions, events: EventBus) -> Self {
        Self::with_connector(UdpConnector, options, events)
    }
}

impl<C: Connector> TransportClient<C> {
    pub fn with_connector(connector: C, options: ClientOptions, events: EventBus) -> Self {
        Self {
            connector,
            options,
            events,
            state: AtomicU8::new(ConnectionState::Disconnected.as_u8()),
            sequence: AtomicU32::new(0),
            packets_sent: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            socket: Mutex::new(None),
            target: Mutex::new(None),
        }
    }

    /// Open a socket to `host:port` and run the liveness handshake
    pub fn connect(&self, host: &str, port: u16) -> Result<SocketAddr, NetworkError> {
        self.close_socket();

        let target = match resolve(host, port) {
            Ok(target) => target,
            Err(e) => {
                tracing::warn!("Cannot resolve {}:{}: {}", host, port, e);
                self.transition(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let socket = match self.connector.open(target) {
            Ok(socket) => socket,
            Err(e) => return Err(self.fail_connect(target, &e)),
        };

        self.transition(ConnectionState::Probing);

        if let Err(e) = self.probe(&socket) {
            return Err(self.fail_connect(target, &e));
        }

        if let Err(e) = socket
            .set_write_timeout(Some(self.options.steady_timeout))
            .and_then(|_| socket.set_read_timeout(Some(self.options.steady_timeout)))
        {
            return Err(self.fail_connect(target, &e));
        }

        self.sequence.store(0, Ordering::SeqCst);
        self.packets_sent.store(0, Ordering::SeqCst);
        self.send_errors.store(0, Ordering::SeqCst);
        *self.socket.lock() = Some(socket);
        *self.target.lock() = Some(target);

        tracing::info!("Connected to {}", target);
        self.transition(ConnectionState::Connected);
        Ok(target)
    }

    /// Send one probe and surface any error the network reports for it
    fn probe(&self, socket: &C::Socket) -> io::Result<()> {
        socket.set_write_timeout(Some(self.options.probe_timeout))?;

        let probe = protocol::encode_probe();
        let sent = socket.send(&probe)?;
        if sent != probe.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "short probe send"));
        }

        if !self.options.probe_settle.is_zero() {
            socket.set_read_timeout(Some(self.options.probe_settle))?;
            let mut scratch = [0u8; 16];
            match socket.recv(&mut scratch) {
                Ok(_) => {}
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
                Err(e) => return Err(e),
            }
        }

        match socket.take_error()? {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn fail_connect(&self, target: SocketAddr, err: &io::Error) -> NetworkError {
        let error = NetworkError::from_send(err).into_connect_error();
        tracing::warn!("Handshake with {} failed: {}", target, error);
        self.transition(ConnectionState::Disconnected);
        error
    }

    /// Encode and send one frame with the next sequence number
    pub fn send(&self, frame: &AudioFrame) -> Result<(), NetworkError> {
        if self.state() != ConnectionState::Connected {
            return Err(NetworkError::NotConnected);
        }

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let packet = protocol::encode(sequence, frame);

        let result = {
            let socket = self.socket.lock();
            match socket.as_ref() {
                Some(socket) => socket.send(&packet),
                None => return Err(NetworkError::NotConnected),
            }
        };

        match result {
            Ok(sent) if sent == packet.len() => {
                let total = self.packets_sent.fetch_add(1, Ordering::SeqCst) + 1;
                let interval = self.options.packet_count_interval;
                if interval != 0 && total % interval == 0 {
                    self.events.publish(Event::PacketCount(total));
                }
                Ok(())
            }
            Ok(sent) => {
                self.send_errors.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Short send: {} of {} bytes", sent, packet.len());
                Err(NetworkError::SendFailed(format!(
                    "short send: {} of {} bytes",
                    sent,
                    packet.len()
                )))
            }
            Err(e) => {
                self.send_errors.fetch_add(1, Ordering::Relaxed);
                let error = NetworkError::from_send(&e);
                if error.is_fatal() {
                    self.fail_session(&error);
                } else {
                    tracing::debug!("Dropped packet {}: {}", sequence, error);
                }
                Err(error)
            }
        }
    }

    /// Fatal send error: report once and tear the link down
    fn fail_session(&self, error: &NetworkError) {
        let was_connected = self
            .state
            .compare_exchange(
                ConnectionState::Connected.as_u8(),
                ConnectionState::Disconnected.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();

        if !was_connected {
            return;
        }

        tracing::error!("Link lost: {}", error);
        self.close_socket();
        self.events.publish(Event::Error(error.to_string()));
        self.events
            .publish(Event::ConnectionChanged(ConnectionState::Disconnected));
    }

    /// Close the socket and force `Disconnected`. Always notifies observers.
    pub fn disconnect(&self) {
        self.close_socket();
        let previous = self.swap_state(ConnectionState::Disconnected);
        if previous != ConnectionState::Disconnected {
            tracing::info!("Disconnected");
        }
        self.events
            .publish(Event::ConnectionChanged(ConnectionState::Disconnected));
    }

    /// Like [`disconnect`](Self::disconnect) but only notifies on an actual transition
    pub fn shutdown(&self) {
        self.close_socket();
        self.transition(ConnectionState::Disconnected);
    }

    fn close_socket(&self) {
        self.socket.lock().take();
        self.target.lock().take();
    }

    fn swap_state(&self, next: ConnectionState) -> ConnectionState {
        ConnectionState::from_u8(self.state.swap(next.as_u8(), Ordering::SeqCst))
    }

    fn transition(&self, next: ConnectionState) {
        let previous = self.swap_state(next);
        if previous != next {
            tracing::debug!("Connection state {} -> {}", previous, next);
            self.events.publish(Event::ConnectionChanged(next));
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Packets sent since the last successful connect
    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::SeqCst)
    }

    /// Sequence number the next packet will carry
    pub fn sequence(&self) -> u32 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn target(&self) -> Option<SocketAddr> {
        *self.target.lock()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            state: self.state(),
            target: self.target(),
            packets_sent: self.packets_sent(),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            next_sequence: self.sequence(),
        }
    }

    #[cfg(test)]
    pub(crate) fn set_sequence(&self, value: u32) {
        self.sequence.store(value, Ordering::SeqCst);
    }
}

impl<C: Connector> Drop for TransportClient<C> {
    fn drop(&mut self) {
        self.close_socket();
    }
}
