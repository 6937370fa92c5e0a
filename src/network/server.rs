//! Transport server
//!
//! Receives datagrams from the single active sender and hands frames to a
//! [`PlayoutSink`] in arrival order. Receive and playout are chained on one
//! thread, so a slow device backpressures the socket; the kernel receive
//! buffer is the only place packets get lost.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::PlayoutSink;
use crate::config::AppConfig;
use crate::constants::*;
use crate::error::{Error, NetworkError, Result};
use crate::events::{Event, EventBus};
use crate::network::socket::bind_server_socket;
use crate::protocol;

/// Server lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ServerState {
    fn as_u8(self) -> u8 {
        match self {
            ServerState::Stopped => 0,
            ServerState::Starting => 1,
            ServerState::Running => 2,
            ServerState::Stopping => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ServerState::Starting,
            2 => ServerState::Running,
            3 => ServerState::Stopping,
            _ => ServerState::Stopped,
        }
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Receiver settings
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub bind_addr: SocketAddr,
    pub frame_samples: usize,
    pub recv_buffer_size: usize,
    pub poll_interval: Duration,
    pub client_idle_timeout: Duration,
    pub packet_count_interval: u64,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_UDP_PORT)),
            frame_samples: DEFAULT_FRAME_SAMPLES,
            recv_buffer_size: RECV_BUFFER_SIZE,
            poll_interval: SERVER_POLL_INTERVAL,
            client_idle_timeout: CLIENT_IDLE_TIMEOUT,
            packet_count_interval: PACKET_COUNT_INTERVAL,
        }
    }
}

impl ServerOptions {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let network = &config.network;
        let bind_addr = format!("{}:{}", network.bind_address, network.port)
            .parse()
            .map_err(|e| {
                NetworkError::AddressInvalid(format!("{}: {}", network.bind_address, e))
            })?;

        Ok(Self {
            bind_addr,
            frame_samples: config.audio.frame_samples,
            recv_buffer_size: network.recv_buffer_size,
            poll_interval: SERVER_POLL_INTERVAL,
            client_idle_timeout: network.client_idle_timeout(),
            packet_count_interval: network.packet_count_interval.max(1),
        })
    }
}

/// The sender currently feeding playout
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub address: SocketAddr,
    pub connected_at: DateTime<Utc>,
    #[serde(skip)]
    pub last_seen: Instant,
    pub packet_count: u64,
    pub last_sequence: Option<u32>,
}

impl ClientInfo {
    fn new(address: SocketAddr) -> Self {
        Self {
            address,
            connected_at: Utc::now(),
            last_seen: Instant::now(),
            packet_count: 0,
            last_sequence: None,
        }
    }
}

/// Receive-side diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServerStats {
    pub packets_received: u64,
    pub bytes_received: u64,
    pub frames_forwarded: u64,
    pub probes_received: u64,
    pub malformed_packets: u64,
    pub sequence_gaps: u64,
}

#[derive(Default)]
struct Counters {
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    frames_forwarded: AtomicU64,
    probes_received: AtomicU64,
    malformed_packets: AtomicU64,
    sequence_gaps: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ServerStats {
        ServerStats {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_forwarded: self.frames_forwarded.load(Ordering::Relaxed),
            probes_received: self.probes_received.load(Ordering::Relaxed),
            malformed_packets: self.malformed_packets.load(Ordering::Relaxed),
            sequence_gaps: self.sequence_gaps.load(Ordering::Relaxed),
        }
    }
}

struct Shared {
    running: AtomicBool,
    state: AtomicU8,
    counters: Counters,
    active: Mutex<Option<ClientInfo>>,
    events: EventBus,
}

impl Shared {
    fn set_state(&self, state: ServerState) {
        let previous = ServerState::from_u8(self.state.swap(state.as_u8(), Ordering::SeqCst));
        if previous != state {
            tracing::debug!("Server state {:?} -> {:?}", previous, state);
            self.events.publish(Event::ServerStateChanged(state));
        }
    }

    fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn stats(&self) -> ServerStats {
        self.counters.snapshot()
    }

    fn active_client(&self) -> Option<ClientInfo> {
        self.active.lock().clone()
    }
}

/// Bound, not yet running receiver
pub struct TransportServer {
    socket: UdpSocket,
    local_addr: SocketAddr,
    options: ServerOptions,
    shared: Arc<Shared>,
}

impl TransportServer {
    /// Bind the receive socket.
    ///
    /// Frames must fit in one datagram; larger sizes are rejected up front.
    pub fn bind(options: ServerOptions, events: EventBus) -> Result<Self> {
        if options.frame_samples == 0 || protocol::packet_len(options.frame_samples) > MAX_DATAGRAM_SIZE {
            return Err(Error::Config(format!(
                "frame of {} samples does not fit a datagram",
                options.frame_samples
            )));
        }

        let shared = Arc::new(Shared {
            running: AtomicBool::new(false),
            state: AtomicU8::new(ServerState::Stopped.as_u8()),
            counters: Counters::default(),
            active: Mutex::new(None),
            events,
        });
        shared.set_state(ServerState::Starting);

        let socket = match bind_server_socket(
            options.bind_addr,
            options.recv_buffer_size,
            options.poll_interval,
        ) {
            Ok(socket) => socket,
            Err(e) => {
                shared.events.publish(Event::Error(e.to_string()));
                shared.set_state(ServerState::Stopped);
                return Err(e.into());
            }
        };
        let local_addr = socket.local_addr()?;

        tracing::info!("Audio server bound to {}", local_addr);

        Ok(Self {
            socket,
            local_addr,
            options,
            shared,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> ServerStats {
        self.shared.stats()
    }

    /// Run the receive loop on a dedicated thread
    pub fn spawn<S: PlayoutSink + 'static>(self, mut sink: S) -> Result<ServerHandle> {
        let shared = self.shared.clone();
        let local_addr = self.local_addr;
        shared.running.store(true, Ordering::SeqCst);

        let thread = thread::Builder::new()
            .name("audio-receiver".into())
            .spawn(move || self.serve(&mut sink))
            .map_err(|e| {
                self_stop(&shared);
                Error::Io(e)
            })?;

        Ok(ServerHandle {
            shared,
            local_addr,
            thread: Some(thread),
        })
    }

    /// Blocking receive loop; returns once stopped or on a playout/socket error
    fn serve(self, sink: &mut dyn PlayoutSink) -> Result<()> {
        self.shared.set_state(ServerState::Running);

        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let mut outcome = Ok(());

        while self.shared.running.load(Ordering::SeqCst) {
            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    if let Err(e) = self.handle_datagram(&buf[..len], from, sink) {
                        tracing::error!("Playout failed: {}", e);
                        self.shared.events.publish(Event::Error(e.to_string()));
                        outcome = Err(e);
                        break;
                    }
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
                // Windows reports ICMP port-unreachable for earlier sends here
                Err(e) if matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::ConnectionReset) => {}
                Err(e) => {
                    let error = NetworkError::ReceiveFailed(e.to_string());
                    tracing::error!("Receive loop aborted: {}", error);
                    self.shared.events.publish(Event::Error(error.to_string()));
                    outcome = Err(error.into());
                    break;
                }
            }

            // Traffic from other peers must not keep a silent sender alive
            self.expire_idle_client();
        }

        self.shared.set_state(ServerState::Stopping);
        self.shared.running.store(false, Ordering::SeqCst);

        if let Err(e) = sink.close() {
            tracing::warn!("Closing playout failed: {}", e);
        }
        if let Some(client) = self.shared.active.lock().take() {
            self.shared.events.publish(Event::ClientDisconnected(client.address));
        }

        self.shared.set_state(ServerState::Stopped);
        tracing::info!("Audio server stopped");
        outcome
    }

    fn handle_datagram(&self, datagram: &[u8], from: SocketAddr, sink: &mut dyn PlayoutSink) -> Result<()> {
        let counters = &self.shared.counters;
        counters.packets_received.fetch_add(1, Ordering::Relaxed);
        counters.bytes_received.fetch_add(datagram.len() as u64, Ordering::Relaxed);

        let packet = match protocol::decode(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                counters.malformed_packets.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Dropping datagram from {}: {}", from, e);
                return Ok(());
            }
        };

        if packet.is_probe() {
            counters.probes_received.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Liveness probe from {}", from);
            self.note_probe(from);
            return Ok(());
        }

        let sequence = packet.sequence;
        let frame = match packet.into_frame(self.options.frame_samples) {
            Ok(frame) => frame,
            Err(e) => {
                counters.malformed_packets.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Dropping packet {} from {}: {}", sequence, from, e);
                return Ok(());
            }
        };

        self.note_frame(from, sequence);

        let level = frame.level();
        sink.write(frame)?;

        let forwarded = counters.frames_forwarded.fetch_add(1, Ordering::Relaxed) + 1;
        self.shared.events.publish(Event::AudioLevel(level));
        let interval = self.options.packet_count_interval;
        if interval != 0 && forwarded % interval == 0 {
            self.shared.events.publish(Event::PacketCount(forwarded));
        }
        Ok(())
    }

    /// A probe refreshes the active sender, or claims the slot when it is free
    fn note_probe(&self, from: SocketAddr) {
        let mut active = self.shared.active.lock();
        match active.as_mut() {
            Some(client) if client.address == from => client.last_seen = Instant::now(),
            Some(_) => {}
            None => {
                tracing::info!("Client connected from {}", from);
                *active = Some(ClientInfo::new(from));
                self.shared.events.publish(Event::ClientConnected(from));
            }
        }
    }

    /// Valid frames always make their sender the active one
    fn note_frame(&self, from: SocketAddr, sequence: u32) {
        let mut active = self.shared.active.lock();

        if active.as_ref().map(|c| c.address) != Some(from) {
            if let Some(previous) = active.take() {
                tracing::info!("Client {} replaced by {}", previous.address, from);
                self.shared.events.publish(Event::ClientDisconnected(previous.address));
            } else {
                tracing::info!("Client connected from {}", from);
            }
            *active = Some(ClientInfo::new(from));
            self.shared.events.publish(Event::ClientConnected(from));
        }

        if let Some(client) = active.as_mut() {
            if let Some(last) = client.last_sequence {
                if sequence != last.wrapping_add(1) {
                    self.shared.counters.sequence_gaps.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!("Sequence gap: {} after {}", sequence, last);
                }
            }
            client.last_sequence = Some(sequence);
            client.last_seen = Instant::now();
            client.packet_count += 1;
        }
    }

    fn expire_idle_client(&self) {
        let mut active = self.shared.active.lock();
        let expired = active
            .as_ref()
            .is_some_and(|c| c.last_seen.elapsed() > self.options.client_idle_timeout);

        if expired {
            if let Some(client) = active.take() {
                tracing::info!("Client {} timed out", client.address);
                self.shared.events.publish(Event::ClientDisconnected(client.address));
                self.shared.events.publish(Event::AudioLevel(0.0));
            }
        }
    }
}

fn self_stop(shared: &Shared) {
    shared.running.store(false, Ordering::SeqCst);
    shared.set_state(ServerState::Stopped);
}

/// Handle to a running receive loop
pub struct ServerHandle {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    thread: Option<JoinHandle<Result<()>>>,
}

impl ServerHandle {
    /// Stop the loop and wait for it. Idempotent; the loop's own error is
    /// returned by the first call only.
    ///
    /// The loop checks the stop flag between datagrams, so a sink whose
    /// `write` never returns keeps this call waiting.
    pub fn stop(&mut self) -> Result<()> {
        self.shared.running.store(false, Ordering::SeqCst);
        self.join()
    }

    /// Wait for the loop to end on its own
    pub fn join(&mut self) -> Result<()> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .unwrap_or_else(|_| Err(NetworkError::ReceiveFailed("receiver thread panicked".into()).into())),
            None => Ok(()),
        }
    }

    /// True once the loop has exited
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    pub fn state(&self) -> ServerState {
        self.shared.state()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> ServerStats {
        self.shared.stats()
    }

    pub fn active_client(&self) -> Option<ClientInfo> {
        self.shared.active_client()
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioFrame, ChannelSink};
    use crate::error::AudioError;
    use crossbeam_channel::Receiver;

    const FRAME: usize = 16;

    fn options() -> ServerOptions {
        ServerOptions {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            frame_samples: FRAME,
            poll_interval: Duration::from_millis(20),
            client_idle_timeout: Duration::from_millis(150),
            ..ServerOptions::default()
        }
    }

    fn start() -> (ServerHandle, Receiver<AudioFrame>, Receiver<Event>, UdpSocket) {
        let events = EventBus::new();
        let event_rx = events.subscribe();
        let server = TransportServer::bind(options(), events).unwrap();
        let (sink, frames) = ChannelSink::new(64);
        let handle = server.spawn(sink).unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.connect(handle.local_addr()).unwrap();
        (handle, frames, event_rx, sender)
    }

    fn frame(value: i16) -> AudioFrame {
        AudioFrame::new(vec![value; FRAME])
    }

    fn recv(frames: &Receiver<AudioFrame>) -> AudioFrame {
        frames.recv_timeout(Duration::from_secs(2)).unwrap()
    }

    fn wait_for<F: Fn() -> bool>(condition: F) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_forwards_in_arrival_order() {
        let (mut handle, frames, _events, sender) = start();

        for seq in [5u32, 7, 6] {
            sender.send(&protocol::encode(seq, &frame(seq as i16))).unwrap();
        }

        assert_eq!(recv(&frames), frame(5));
        assert_eq!(recv(&frames), frame(7));
        assert_eq!(recv(&frames), frame(6));

        wait_for(|| handle.stats().frames_forwarded == 3);
        assert_eq!(handle.stats().sequence_gaps, 2);
        handle.stop().unwrap();
    }

    #[test]
    fn test_duplicates_are_played() {
        let (mut handle, frames, _events, sender) = start();

        sender.send(&protocol::encode(1, &frame(1))).unwrap();
        sender.send(&protocol::encode(1, &frame(1))).unwrap();

        assert_eq!(recv(&frames), frame(1));
        assert_eq!(recv(&frames), frame(1));
        handle.stop().unwrap();
    }

    #[test]
    fn test_probe_is_not_forwarded() {
        let (mut handle, frames, _events, sender) = start();

        sender.send(&protocol::encode_probe()).unwrap();
        sender.send(&protocol::encode(0, &frame(9))).unwrap();

        assert_eq!(recv(&frames), frame(9));
        wait_for(|| handle.stats().probes_received == 1);
        assert!(frames.try_recv().is_err());
        assert_eq!(handle.stats().frames_forwarded, 1);
        handle.stop().unwrap();
    }

    #[test]
    fn test_malformed_packets_are_counted() {
        let (mut handle, frames, _events, sender) = start();

        sender.send(&[0x01, 0x02]).unwrap();
        sender.send(&protocol::encode(0, &AudioFrame::silence(FRAME + 1))).unwrap();
        sender.send(&protocol::encode(1, &frame(3))).unwrap();

        assert_eq!(recv(&frames), frame(3));
        wait_for(|| handle.stats().malformed_packets == 2);
        assert_eq!(handle.state(), ServerState::Running);
        handle.stop().unwrap();
    }

    #[test]
    fn test_client_tracking() {
        let (mut handle, frames, events, sender) = start();

        sender.send(&protocol::encode_probe()).unwrap();
        sender.send(&protocol::encode(0, &frame(1))).unwrap();
        recv(&frames);

        let client = handle.active_client().unwrap();
        assert_eq!(client.address, sender.local_addr().unwrap());
        assert_eq!(client.packet_count, 1);

        // idle timeout drops the client
        wait_for(|| handle.active_client().is_none());

        let seen: Vec<Event> = events.try_iter().collect();
        assert!(seen.contains(&Event::ClientConnected(sender.local_addr().unwrap())));
        assert!(seen.contains(&Event::ClientDisconnected(sender.local_addr().unwrap())));
        handle.stop().unwrap();
    }

    #[test]
    fn test_lifecycle_events() {
        let (mut handle, _frames, events, _sender) = start();
        wait_for(|| handle.state() == ServerState::Running);

        handle.stop().unwrap();
        handle.stop().unwrap();
        assert_eq!(handle.state(), ServerState::Stopped);
        assert!(handle.is_finished());

        let states: Vec<ServerState> = events
            .try_iter()
            .filter_map(|e| match e {
                Event::ServerStateChanged(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                ServerState::Starting,
                ServerState::Running,
                ServerState::Stopping,
                ServerState::Stopped,
            ]
        );
    }

    #[test]
    fn test_playout_error_ends_loop() {
        let events = EventBus::new();
        let server = TransportServer::bind(options(), events).unwrap();
        let (sink, frames) = ChannelSink::new(1);
        drop(frames);
        let mut handle = server.spawn(sink).unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&protocol::encode(0, &frame(1)), handle.local_addr()).unwrap();

        wait_for(|| handle.is_finished());
        assert!(matches!(handle.join(), Err(Error::Audio(_))));
        assert_eq!(handle.state(), ServerState::Stopped);
    }

    #[test]
    fn test_silent_client_expires_despite_other_traffic() {
        let (mut handle, frames, events, sender) = start();

        sender.send(&protocol::encode(0, &frame(1))).unwrap();
        recv(&frames);

        // a second peer keeps the socket busy with garbage faster than the poll interval
        let noisy = UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = handle.local_addr();
        let deadline = Instant::now() + Duration::from_secs(2);
        while handle.active_client().is_some() {
            assert!(Instant::now() < deadline, "silent client was never expired");
            noisy.send_to(&[0x01, 0x02], target).unwrap();
            thread::sleep(Duration::from_millis(5));
        }

        let seen: Vec<Event> = events.try_iter().collect();
        assert!(seen.contains(&Event::ClientDisconnected(sender.local_addr().unwrap())));
        assert!(seen.contains(&Event::AudioLevel(0.0)));
        assert!(handle.stats().malformed_packets > 0);
        handle.stop().unwrap();
    }

    #[test]
    fn test_zero_packet_count_interval_disables_events() {
        let events = EventBus::new();
        let event_rx = events.subscribe();
        let options = ServerOptions {
            packet_count_interval: 0,
            ..options()
        };
        let server = TransportServer::bind(options, events).unwrap();
        let (sink, frames) = ChannelSink::new(8);
        let mut handle = server.spawn(sink).unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        for seq in 0..3u32 {
            sender.send_to(&protocol::encode(seq, &frame(1)), handle.local_addr()).unwrap();
        }
        for _ in 0..3 {
            recv(&frames);
        }

        assert_eq!(handle.state(), ServerState::Running);
        handle.stop().unwrap();
        assert!(!event_rx.try_iter().any(|e| matches!(e, Event::PacketCount(_))));
    }

    #[test]
    fn test_rejects_frames_larger_than_a_datagram() {
        for frame_samples in [0, 1200] {
            let options = ServerOptions {
                frame_samples,
                ..options()
            };
            let result = TransportServer::bind(options, EventBus::new());
            assert!(matches!(result, Err(Error::Config(_))), "{frame_samples}");
        }
    }

    #[test]
    fn test_stop_with_stalled_consumer() {
        let server = TransportServer::bind(options(), EventBus::new()).unwrap();
        let (sink, _frames) = ChannelSink::new(1);
        let mut handle = server
            .spawn(sink.with_write_timeout(Duration::from_millis(100)))
            .unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        for seq in 0..3u32 {
            sender.send_to(&protocol::encode(seq, &frame(1)), handle.local_addr()).unwrap();
        }

        // nobody drains the channel, the second write gives up
        wait_for(|| handle.is_finished());
        assert!(matches!(handle.stop(), Err(Error::Audio(AudioError::PlayoutError(_)))));
        assert_eq!(handle.state(), ServerState::Stopped);
    }
}
