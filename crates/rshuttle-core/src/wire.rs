//! Mux wire frame header and command codes.
//!
//! Frame: `magic:u16 | cmd:u16 | channel:u16 | length:u16 | payload[length]`,
//! all integers big-endian. A magic mismatch on an established stream is
//! fatal for that stream.

use zerocopy::byteorder::big_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result};

/// Constant magic value identifying a well-formed frame header.
pub const MAGIC: u16 = 0x5348; // "SH"

/// Size in bytes of [`FrameHeader`] on the wire.
pub const HEADER_LEN: usize = 8;

/// Fixed 8-byte frame header (mirrors the wire layout exactly).
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct FrameHeader {
    magic: U16,
    cmd: U16,
    channel: U16,
    length: U16,
}

impl FrameHeader {
    /// Build a header for `cmd` on `channel` with a `length`-byte payload.
    pub fn new(cmd: Command, channel: u16, length: u16) -> Self {
        Self {
            magic: U16::new(MAGIC),
            cmd: U16::new(cmd as u16),
            channel: U16::new(channel),
            length: U16::new(length),
        }
    }

    pub fn magic(&self) -> u16 {
        self.magic.get()
    }

    pub fn channel(&self) -> u16 {
        self.channel.get()
    }

    pub fn length(&self) -> u16 {
        self.length.get()
    }

    /// Decode the raw command code; `None` if it doesn't match a known
    /// [`Command`] variant (the frame is logged and dropped by the caller,
    /// not treated as fatal).
    pub fn command(&self) -> Option<Command> {
        Command::from_u16(self.cmd.get())
    }

    /// Serialize this header to its 8-byte wire representation.
    pub fn as_bytes(&self) -> &[u8] {
        <Self as IntoBytes>::as_bytes(self)
    }

    /// Parse a header from the front of `data`. Returns the header and the
    /// number of bytes consumed (always [`HEADER_LEN`] on success).
    pub fn parse(data: &[u8]) -> Result<&Self> {
        let (hdr, _rest) = Self::ref_from_prefix(data).map_err(|_| {
            Error::InvalidFrame(format!(
                "truncated header: need {HEADER_LEN} bytes, got {}",
                data.len()
            ))
        })?;
        if hdr.magic() != MAGIC {
            return Err(Error::InvalidFrame(format!(
                "bad magic: expected {MAGIC:#06x}, got {:#06x}",
                hdr.magic()
            )));
        }
        Ok(hdr)
    }
}

/// Mux commands. Values are part of the wire format; do not renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Command {
    Exit = 1,
    TcpConnect = 2,
    TcpStopSending = 3,
    TcpEof = 4,
    TcpData = 5,
    Routes = 6,
    HostReq = 7,
    HostList = 8,
    DnsReq = 9,
    DnsResponse = 10,
    UdpOpen = 11,
    UdpData = 12,
    UdpClose = 13,
    Ping = 14,
    Pong = 15,
}

impl Command {
    fn from_u16(v: u16) -> Option<Self> {
        use Command::*;
        Some(match v {
            1 => Exit,
            2 => TcpConnect,
            3 => TcpStopSending,
            4 => TcpEof,
            5 => TcpData,
            6 => Routes,
            7 => HostReq,
            8 => HostList,
            9 => DnsReq,
            10 => DnsResponse,
            11 => UdpOpen,
            12 => UdpData,
            13 => UdpClose,
            14 => Ping,
            15 => Pong,
            _ => return None,
        })
    }
}

/// A fully decoded frame: header plus owned payload bytes.
#[derive(Debug, Clone)]
pub struct Frame {
    pub cmd: Command,
    pub channel: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(cmd: Command, channel: u16, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            cmd,
            channel,
            payload: payload.into(),
        }
    }

    /// Encode this frame (header + payload) to the wire format.
    pub fn encode(&self) -> Vec<u8> {
        let len = self.payload.len() as u16;
        let hdr = FrameHeader::new(self.cmd, self.channel, len);
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(hdr.as_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Build the ASCII payload for `TCP_CONNECT`: `"<family>,<ip>,<port>"`.
pub fn tcp_connect_payload(family: i32, ip: std::net::IpAddr, port: u16) -> Vec<u8> {
    format!("{family},{ip},{port}").into_bytes()
}

/// Build the ASCII payload for `UDP_OPEN`: `"<family>"`.
pub fn udp_open_payload(family: i32) -> Vec<u8> {
    family.to_string().into_bytes()
}

/// Build the payload for outgoing `UDP_DATA`: `"<dst_ip>,<dst_port>,<raw>"`.
pub fn udp_data_payload(dst: std::net::SocketAddr, raw: &[u8]) -> Vec<u8> {
    let mut out = format!("{},{},", dst.ip(), dst.port()).into_bytes();
    out.extend_from_slice(raw);
    out
}

/// Parse the payload of an inbound `UDP_DATA` frame: `"<src_ip>,<src_port>,<raw>"`.
pub fn parse_udp_data(payload: &[u8]) -> Result<(std::net::SocketAddr, &[u8])> {
    let comma1 = payload
        .iter()
        .position(|&b| b == b',')
        .ok_or_else(|| Error::InvalidFrame("UDP_DATA: missing first comma".into()))?;
    let rest = &payload[comma1 + 1..];
    let comma2 = rest
        .iter()
        .position(|&b| b == b',')
        .ok_or_else(|| Error::InvalidFrame("UDP_DATA: missing second comma".into()))?;

    let ip_str = std::str::from_utf8(&payload[..comma1])
        .map_err(|e| Error::InvalidFrame(format!("UDP_DATA: bad ip utf8: {e}")))?;
    let port_str = std::str::from_utf8(&rest[..comma2])
        .map_err(|e| Error::InvalidFrame(format!("UDP_DATA: bad port utf8: {e}")))?;

    let ip: std::net::IpAddr = ip_str
        .parse()
        .map_err(|e| Error::InvalidFrame(format!("UDP_DATA: bad ip '{ip_str}': {e}")))?;
    let port: u16 = port_str
        .parse()
        .map_err(|e| Error::InvalidFrame(format!("UDP_DATA: bad port '{port_str}': {e}")))?;

    Ok((std::net::SocketAddr::new(ip, port), &rest[comma2 + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_header() {
        let hdr = FrameHeader::new(Command::TcpData, 42, 7);
        let bytes = hdr.as_bytes().to_vec();
        assert_eq!(bytes.len(), HEADER_LEN);
        let parsed = FrameHeader::parse(&bytes).unwrap();
        assert_eq!(parsed.channel(), 42);
        assert_eq!(parsed.length(), 7);
        assert_eq!(parsed.command(), Some(Command::TcpData));
    }

    #[test]
    fn round_trip_frame_every_command() {
        let commands = [
            Command::Exit,
            Command::TcpConnect,
            Command::TcpStopSending,
            Command::TcpEof,
            Command::TcpData,
            Command::Routes,
            Command::HostReq,
            Command::HostList,
            Command::DnsReq,
            Command::DnsResponse,
            Command::UdpOpen,
            Command::UdpData,
            Command::UdpClose,
            Command::Ping,
            Command::Pong,
        ];
        for cmd in commands {
            let frame = Frame::new(cmd, 3, b"payload".to_vec());
            let encoded = frame.encode();
            let hdr = FrameHeader::parse(&encoded).unwrap();
            assert_eq!(hdr.command(), Some(cmd));
            assert_eq!(hdr.channel(), 3);
            assert_eq!(
                &encoded[HEADER_LEN..HEADER_LEN + hdr.length() as usize],
                b"payload"
            );
        }
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = FrameHeader::new(Command::Ping, 0, 0).as_bytes().to_vec();
        bytes[0] ^= 0xff;
        assert!(FrameHeader::parse(&bytes).is_err());
    }

    #[test]
    fn unknown_command_decodes_to_none() {
        let mut bytes = FrameHeader::new(Command::Ping, 0, 0).as_bytes().to_vec();
        bytes[2] = 0xff;
        bytes[3] = 0xff;
        let hdr = FrameHeader::parse(&bytes).unwrap();
        assert_eq!(hdr.command(), None);
    }

    #[test]
    fn tcp_connect_payload_formats_family_ip_port() {
        let ip: std::net::IpAddr = "93.184.216.34".parse().unwrap();
        let payload = tcp_connect_payload(2, ip, 80);
        assert_eq!(payload, b"2,93.184.216.34,80");
    }

    #[test]
    fn udp_data_payload_round_trips_through_parse() {
        let dst: std::net::SocketAddr = "10.0.0.5:5353".parse().unwrap();
        let encoded = udp_data_payload(dst, b"hello");
        let (parsed, raw) = parse_udp_data(&encoded).unwrap();
        assert_eq!(parsed, dst);
        assert_eq!(raw, b"hello");
    }
}
