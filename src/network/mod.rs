//! Network subsystem for UDP audio transport

pub mod client;
pub mod server;
pub mod socket;

pub use client::{ClientOptions, ClientStats, ConnectionState, TransportClient};
pub use server::{ClientInfo, ServerHandle, ServerOptions, ServerState, ServerStats, TransportServer};
pub use socket::{Connector, DatagramSocket, UdpConnector};
