//! Wire format
//!
//! ```text
//! offset 0   u32 sequence, big-endian (0xFFFFFFFF = liveness probe)
//! offset 4   PCM payload, i16 little-endian mono; empty for a probe
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::audio::AudioFrame;
use crate::constants::{HEADER_LEN, PROBE_SEQUENCE};
use crate::error::PacketError;

/// A decoded datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub sequence: u32,
    pub payload: Bytes,
}

impl Packet {
    /// Probes are recognized by their empty payload.
    pub fn is_probe(&self) -> bool {
        self.payload.is_empty()
    }

    /// Convert the payload into a frame of `expected_samples` samples
    pub fn into_frame(self, expected_samples: usize) -> Result<AudioFrame, PacketError> {
        if self.payload.len() != expected_samples * 2 {
            return Err(PacketError::MalformedPacket {
                len: HEADER_LEN + self.payload.len(),
            });
        }
        AudioFrame::from_le_bytes(&self.payload)
    }
}

/// Encoded size of a data packet
pub fn packet_len(frame_samples: usize) -> usize {
    HEADER_LEN + frame_samples * 2
}

/// Encode a data packet
pub fn encode(sequence: u32, frame: &AudioFrame) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + frame.byte_len());
    buf.put_u32(sequence);
    for &sample in frame.samples() {
        buf.put_i16_le(sample);
    }
    buf.freeze()
}

/// Encode a liveness probe
pub fn encode_probe() -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN);
    buf.put_u32(PROBE_SEQUENCE);
    buf.freeze()
}

/// Decode a datagram
pub fn decode(datagram: &[u8]) -> Result<Packet, PacketError> {
    if datagram.len() < HEADER_LEN {
        return Err(PacketError::MalformedPacket { len: datagram.len() });
    }

    let mut buf = datagram;
    let sequence = buf.get_u32();
    let payload = Bytes::copy_from_slice(buf);

    Ok(Packet { sequence, payload })
}
