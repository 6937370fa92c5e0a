//! End-to-end transport tests over loopback UDP

use crossbeam_channel::{bounded, Receiver};
use std::net::UdpSocket;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pulselink::audio::{AudioFrame, ChannelSink, FrameSource};
use pulselink::constants::{DEFAULT_FRAME_SAMPLES, PROBE_SEQUENCE};
use pulselink::error::NetworkError;
use pulselink::events::{Event, EventBus};
use pulselink::network::{
    ClientOptions, ConnectionState, ServerHandle, ServerOptions, TransportClient, TransportServer,
};
use pulselink::protocol;
use pulselink::session::{SenderSession, SessionEnd};

fn server_options() -> ServerOptions {
    ServerOptions {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        poll_interval: Duration::from_millis(20),
        ..ServerOptions::default()
    }
}

fn start_server() -> (ServerHandle, Receiver<AudioFrame>) {
    let server = TransportServer::bind(server_options(), EventBus::new()).unwrap();
    let (sink, frames) = ChannelSink::new(256);
    (server.spawn(sink).unwrap(), frames)
}

fn client() -> (TransportClient, Receiver<Event>) {
    let events = EventBus::new();
    let rx = events.subscribe();
    (TransportClient::new(ClientOptions::default(), events), rx)
}

fn ramp(start: i16) -> AudioFrame {
    AudioFrame::new((0..DEFAULT_FRAME_SAMPLES as i16).map(|i| start.wrapping_add(i)).collect())
}

fn wait_for<F: Fn() -> bool>(condition: F) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_connect_to_live_listener() {
    let (mut server, frames) = start_server();
    let (client, events) = client();

    let target = client.connect("127.0.0.1", server.local_addr().port()).unwrap();

    assert_eq!(target, server.local_addr());
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(client.sequence(), 0);

    let states: Vec<Event> = events.try_iter().collect();
    assert_eq!(
        states,
        vec![
            Event::ConnectionChanged(ConnectionState::Probing),
            Event::ConnectionChanged(ConnectionState::Connected),
        ]
    );

    // the probe reaches the server but never playout
    wait_for(|| server.stats().probes_received == 1);
    assert!(frames.try_recv().is_err());
    server.stop().unwrap();
}

#[cfg(target_os = "linux")]
#[test]
fn test_connect_without_listener_is_host_unreachable() {
    let port = {
        let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let (client, _events) = client();

    let result = client.connect("127.0.0.1", port);

    assert!(matches!(result, Err(NetworkError::HostUnreachable(_))), "{result:?}");
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

/// Plain UDP listener with room for a burst of full frames
fn raw_listener() -> UdpSocket {
    let socket = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::DGRAM, None).unwrap();
    let _ = socket.set_recv_buffer_size(1 << 20);
    let addr: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
    socket.bind(&addr.into()).unwrap();
    let socket: UdpSocket = socket.into();
    socket.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    socket
}

#[test]
fn test_hundred_frames_on_the_wire() {
    let listener = raw_listener();
    let port = listener.local_addr().unwrap().port();
    let reader = thread::spawn(move || {
        let mut buf = [0u8; 4096];
        (0..101)
            .map(|_| {
                let len = listener.recv(&mut buf).unwrap();
                buf[..len].to_vec()
            })
            .collect::<Vec<_>>()
    });

    let (client, _events) = client();
    client.connect("127.0.0.1", port).unwrap();
    for i in 0..100 {
        client.send(&ramp(i)).unwrap();
    }
    assert_eq!(client.packets_sent(), 100);
    assert_eq!(client.sequence(), 100);

    let datagrams = reader.join().unwrap();
    assert_eq!(datagrams[0], PROBE_SEQUENCE.to_be_bytes());

    for (expected, datagram) in datagrams[1..].iter().enumerate() {
        assert_eq!(datagram.len(), 4 + 1920);
        let packet = protocol::decode(datagram).unwrap();
        assert_eq!(packet.sequence, expected as u32);
        assert_eq!(packet.into_frame(DEFAULT_FRAME_SAMPLES).unwrap(), ramp(expected as i16));
    }
}

#[test]
fn test_reordered_packets_play_in_arrival_order() {
    let (mut server, frames) = start_server();
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();

    for seq in [5u32, 7, 6] {
        sender
            .send_to(&protocol::encode(seq, &ramp(seq as i16)), server.local_addr())
            .unwrap();
    }

    for seq in [5i16, 7, 6] {
        let frame = frames.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(frame, ramp(seq));
    }
    server.stop().unwrap();
}

#[test]
fn test_sender_session_to_server() {
    let (mut server, frames) = start_server();
    let (client, events) = client();
    client.connect("127.0.0.1", server.local_addr().port()).unwrap();

    let (chunks, chunks_rx) = bounded(16);
    let mut session = SenderSession::with_source(
        Arc::new(client),
        FrameSource::from_chunks(chunks_rx, DEFAULT_FRAME_SAMPLES).unwrap(),
    )
    .unwrap();

    for i in 0..3 {
        chunks.send(ramp(i * 10).into_samples()).unwrap();
    }
    for i in 0..3 {
        let frame = frames.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(frame, ramp(i * 10));
    }

    assert_eq!(session.stop(), SessionEnd::Stopped);
    assert_eq!(session.client().state(), ConnectionState::Disconnected);
    assert!(events
        .try_iter()
        .any(|e| e == Event::ConnectionChanged(ConnectionState::Disconnected)));

    wait_for(|| server.stats().frames_forwarded == 3);
    let stats = server.stats();
    assert_eq!(stats.probes_received, 1);
    assert_eq!(stats.sequence_gaps, 0);
    server.stop().unwrap();
}
