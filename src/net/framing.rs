use std::io::Read;

use crate::net::packet::{PacketReader, PacketWriter};

/// Header bytes preceding every Auth/Margin TCP payload: type + length.
pub const TCP_HEADER_LEN: usize = 6;
/// Header bytes preceding every Game UDP payload: flags, seq, ack, type, length.
pub const GAME_HEADER_LEN: usize = 11;

#[derive(Debug)]
pub enum FrameReadError {
    /// Peer closed the connection at a frame boundary.
    Closed,
    /// Read timed out with no bytes consumed.
    Timeout,
    /// Declared payload length exceeds the configured maximum.
    TooLarge(usize),
    Io(String),
}

impl std::fmt::Display for FrameReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameReadError::Closed => write!(f, "connection closed"),
            FrameReadError::Timeout => write!(f, "frame read timed out"),
            FrameReadError::TooLarge(len) => write!(f, "frame payload too large: {} bytes", len),
            FrameReadError::Io(err) => write!(f, "frame read failed: {}", err),
        }
    }
}

/// Builds a `[type:u16][length:u32][payload]` frame. Length excludes the
/// header itself.
pub fn build_tcp_frame(msg_type: u16, payload: &[u8]) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(TCP_HEADER_LEN + payload.len());
    writer.write_u16_le(msg_type);
    writer.write_u32_le(payload.len() as u32);
    writer.write_bytes(payload);
    writer.into_vec()
}

/// Blocking frame read. `Closed` is only reported when the peer disconnects
/// cleanly between frames; EOF inside a frame is an IO error.
pub fn read_tcp_frame(
    stream: &mut impl Read,
    max_payload: usize,
) -> Result<(u16, Vec<u8>), FrameReadError> {
    let mut header = [0u8; TCP_HEADER_LEN];
    read_exact_frame(stream, &mut header, true)?;
    let mut reader = PacketReader::new(&header);
    let msg_type = reader.read_u16_le().unwrap_or(0);
    let length = reader.read_u32_le().unwrap_or(0) as usize;
    if length > max_payload {
        return Err(FrameReadError::TooLarge(length));
    }
    let mut payload = vec![0u8; length];
    if length > 0 {
        read_exact_frame(stream, &mut payload, false)?;
    }
    Ok((msg_type, payload))
}

fn read_exact_frame(
    stream: &mut impl Read,
    buf: &mut [u8],
    at_boundary: bool,
) -> Result<(), FrameReadError> {
    match stream.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof && at_boundary => {
            Err(FrameReadError::Closed)
        }
        Err(err)
            if err.kind() == std::io::ErrorKind::WouldBlock
                || err.kind() == std::io::ErrorKind::TimedOut =>
        {
            Err(FrameReadError::Timeout)
        }
        Err(err) => Err(FrameReadError::Io(err.to_string())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GameHeader {
    pub flags: u8,
    pub seq: u16,
    pub ack: u16,
    pub msg_type: u16,
    pub length: u32,
}

impl GameHeader {
    pub fn is_reliable(&self) -> bool {
        self.flags & crate::net::messages::PACKET_FLAG_RELIABLE != 0
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & crate::net::messages::PACKET_FLAG_ENCRYPTED != 0
    }
}

/// Splits a datagram into header and payload. The declared length must match
/// the bytes actually present.
pub fn parse_game_datagram(data: &[u8]) -> Option<(GameHeader, &[u8])> {
    let mut reader = PacketReader::new(data);
    let header = GameHeader {
        flags: reader.read_u8()?,
        seq: reader.read_u16_le()?,
        ack: reader.read_u16_le()?,
        msg_type: reader.read_u16_le()?,
        length: reader.read_u32_le()?,
    };
    let payload = reader.read_bytes(header.length as usize)?;
    if reader.remaining() != 0 {
        return None;
    }
    Some((header, payload))
}

pub fn build_game_datagram(
    flags: u8,
    seq: u16,
    ack: u16,
    msg_type: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(GAME_HEADER_LEN + payload.len());
    writer.write_u8(flags);
    writer.write_u16_le(seq);
    writer.write_u16_le(ack);
    writer.write_u16_le(msg_type);
    writer.write_u32_le(payload.len() as u32);
    writer.write_bytes(payload);
    writer.into_vec()
}
