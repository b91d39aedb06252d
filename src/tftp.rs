use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// Largest payload carried by a single DATA packet.
pub const DATA_BUFFER_SIZE: usize = 512;

/// DATA header (opcode + block number) plus a full payload.
pub const MAX_PACKET_SIZE: usize = DATA_BUFFER_SIZE + 4;

/// Well-known port every transfer starts on.
pub const TFTP_PORT: u16 = 69;

/// The only transfer mode this client speaks.
pub const OCTET_MODE: &str = "octet";

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error returned from the codec or the TFTP Socket handler
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    PacketParse(String),
    Encoding(String),
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {}", e),
            SocketError::PacketParse(e) => write!(f, "Packet parsing error: {}", e),
            SocketError::Encoding(e) => write!(f, "Packet encoding error: {}", e),
            SocketError::Timeout(e) => write!(f, "Socket IO timeout: {}", e),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

/// Represents a TFTP Error code surfaced by a TFTP Error packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Undefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    Illegal,
    UnknownTid,
    FileAlreadyExists,
    NoSuchUser,
    /// A code outside of RFC 1350, kept verbatim.
    Unknown(u16),
}

impl ErrorCode {
    pub fn as_u16(&self) -> u16 {
        match self {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::Illegal => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
            ErrorCode::Unknown(code) => *code,
        }
    }
}

impl From<u16> for ErrorCode {
    fn from(raw: u16) -> Self {
        match raw {
            0 => ErrorCode::Undefined,
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::Illegal,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            other => ErrorCode::Unknown(other),
        }
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
            _ => ErrorCode::Undefined,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorCode::Unknown(code) => write!(f, "{code}"),
            known => write!(f, "{} ({:?})", known.as_u16(), known),
        }
    }
}

/// The TFTP opcode, i.e. the kind of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode { Rrq, Wrq, Data, Ack, Error }

impl OpCode {
    pub fn as_u16(&self) -> u16 {
        match self {
            OpCode::Rrq => 1,
            OpCode::Wrq => 2,
            OpCode::Data => 3,
            OpCode::Ack => 4,
            OpCode::Error => 5,
        }
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file path on the server.
        path: String,

        /// The transfer mode, lowercased.
        mode: String,
    },

    /// A write request packet
    WriteReq {
        path: String,
        mode: String,
    },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error {
        code: ErrorCode,
        message: String,
    },
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Given a buffer, assumes the string begins at the beginning of the buffer and reads until it
/// finds a 0 byte, which it assumes terminates the string.
///
/// Returns the string extracted from the buffer as well as the position of the 0 byte in the
/// buffer it was given (or the size of the buffer, if no 0 byte was encountered)
fn string_from_buffer(buf: &[u8]) -> (String, usize) {
    let end = buf.iter().position(|&b| b == 0x00).unwrap_or(buf.len());
    (String::from_utf8_lossy(&buf[..end]).into_owned(), end)
}

fn retrieve_op_code(buf: &[u8]) -> TftpResult<OpCode> {
    let rawcode = u16_from_buffer(&buf[..2]);
    match rawcode {
        1 => Ok(OpCode::Rrq),
        2 => Ok(OpCode::Wrq),
        3 => Ok(OpCode::Data),
        4 => Ok(OpCode::Ack),
        5 => Ok(OpCode::Error),
        _ => Err(SocketError::PacketParse(format!("Unknown opcode retrieved: {rawcode}"))),
    }
}

fn parse_path_and_mode(buf: &[u8]) -> TftpResult<(String, String)> {
    let (path, path_end) = string_from_buffer(buf);

    if path_end == buf.len() {
        return Err(SocketError::PacketParse("Request does not contain a mode, but it needs to!".to_string()));
    }

    let (mode, mode_end) = string_from_buffer(&buf[path_end + 1..]);

    if path_end + 1 + mode_end >= buf.len() {
        return Err(SocketError::PacketParse("Mode must be terminated with a null byte!".to_string()));
    }

    Ok((path, mode.to_lowercase()))
}

fn parse_read_req(buf: &[u8]) -> TftpResult<Packet> {
    let (path, mode) = parse_path_and_mode(&buf[2..])?;
    Ok(Packet::ReadReq { path, mode })
}

fn parse_write_req(buf: &[u8]) -> TftpResult<Packet> {
    let (path, mode) = parse_path_and_mode(&buf[2..])?;
    Ok(Packet::WriteReq { path, mode })
}

fn parse_data(buf: &[u8]) -> TftpResult<Packet> {
    let block = u16_from_buffer(&buf[2..4]);
    if buf.len() > MAX_PACKET_SIZE {
        return Err(SocketError::PacketParse(format!(
            "Data payload of {} bytes exceeds {DATA_BUFFER_SIZE}",
            buf.len() - 4
        )));
    }
    Ok(Packet::Data { block, data: Vec::from(&buf[4..]) })
}

fn parse_ack(buf: &[u8]) -> TftpResult<Packet> {
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Ack { block })
}

fn parse_error(buf: &[u8]) -> TftpResult<Packet> {
    let code = ErrorCode::from(u16_from_buffer(&buf[2..4]));
    // Servers don't always NUL-terminate the message, take whatever is there.
    let (message, _) = string_from_buffer(&buf[4..]);
    Ok(Packet::Error { code, message })
}

fn check_field(name: &str, value: &str) -> TftpResult<()> {
    if value.is_empty() {
        return Err(SocketError::Encoding(format!("{name} must not be empty")));
    }
    if value.bytes().any(|b| b == 0x00) {
        return Err(SocketError::Encoding(format!("{name} {value:?} contains a NUL byte")));
    }
    Ok(())
}

/// Builds a RRQ or WRQ: opcode | filename | 0 | mode | 0.
pub fn encode_request(kind: OpCode, filename: &str, mode: &str) -> TftpResult<Vec<u8>> {
    if kind != OpCode::Rrq && kind != OpCode::Wrq {
        return Err(SocketError::Encoding(format!("{kind:?} is not a request opcode")));
    }
    check_field("Filename", filename)?;
    check_field("Mode", mode)?;

    let mut v = Vec::with_capacity(2 + filename.len() + 1 + mode.len() + 1);
    v.extend_from_slice(&kind.as_u16().to_be_bytes());
    v.extend_from_slice(filename.as_bytes());
    v.push(0);
    v.extend_from_slice(mode.as_bytes());
    v.push(0);
    Ok(v)
}

pub fn encode_data(block: u16, payload: &[u8]) -> Vec<u8> {
    let mut v = Vec::with_capacity(4 + payload.len());
    v.extend_from_slice(&OpCode::Data.as_u16().to_be_bytes());
    v.extend_from_slice(&block.to_be_bytes());
    v.extend_from_slice(payload);
    v
}

pub fn encode_ack(block: u16) -> Vec<u8> {
    let mut v = Vec::with_capacity(4);
    v.extend_from_slice(&OpCode::Ack.as_u16().to_be_bytes());
    v.extend_from_slice(&block.to_be_bytes());
    v
}

pub fn encode_error(code: ErrorCode, message: &str) -> Vec<u8> {
    let mut v = Vec::with_capacity(4 + message.len() + 1);
    v.extend_from_slice(&OpCode::Error.as_u16().to_be_bytes());
    v.extend_from_slice(&code.as_u16().to_be_bytes());
    // The terminator is what ends the message on the wire, so drop anything past an inner NUL.
    let (message, _) = string_from_buffer(message.as_bytes());
    v.extend_from_slice(message.as_bytes());
    v.push(0);
    v
}

impl Packet {
    pub fn kind(&self) -> OpCode {
        match self {
            Packet::ReadReq { .. } => OpCode::Rrq,
            Packet::WriteReq { .. } => OpCode::Wrq,
            Packet::Data { .. } => OpCode::Data,
            Packet::Ack { .. } => OpCode::Ack,
            Packet::Error { .. } => OpCode::Error,
        }
    }

    /// Decodes one datagram. Every kind needs at least a 4 byte header.
    pub fn decode(buf: &[u8]) -> TftpResult<Packet> {
        if buf.len() < 4 {
            return Err(SocketError::PacketParse(format!("Packet too short! ({} bytes)", buf.len())));
        }

        match retrieve_op_code(&buf[..2])? {
            OpCode::Rrq => parse_read_req(buf),
            OpCode::Wrq => parse_write_req(buf),
            OpCode::Data => parse_data(buf),
            OpCode::Ack => parse_ack(buf),
            OpCode::Error => parse_error(buf),
        }
    }

    pub fn encode(&self) -> TftpResult<Vec<u8>> {
        match self {
            Packet::ReadReq { path, mode } => encode_request(OpCode::Rrq, path, mode),
            Packet::WriteReq { path, mode } => encode_request(OpCode::Wrq, path, mode),
            Packet::Data { block, data } => {
                if data.len() > DATA_BUFFER_SIZE {
                    return Err(SocketError::Encoding(format!(
                        "Data payload of {} bytes exceeds {DATA_BUFFER_SIZE}",
                        data.len()
                    )));
                }
                Ok(encode_data(*block, data))
            }
            Packet::Ack { block } => Ok(encode_ack(*block)),
            Packet::Error { code, message } => Ok(encode_error(*code, message)),
        }
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that parses TFTP headers and
/// returns the packets in a more structured format.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    pub async fn send(&self, packet: &Packet, dst: SocketAddr) -> TftpResult<()> {
        let buf = packet.encode()?;
        self.sock.send_to(&buf, dst).await?;
        Ok(())
    }

    /// Waits up to `ttl` for one datagram and decodes it.
    ///
    /// The outer result fails on socket errors and timeouts. A datagram that arrived but does not
    /// decode comes back as an inner error, still paired with its source.
    pub async fn recv_with_timeout(&self, ttl: Duration) -> TftpResult<(TftpResult<Packet>, SocketAddr)> {
        // One spare byte so an oversized datagram shows up as such instead of being cut to size.
        let mut buf = [0; MAX_PACKET_SIZE + 1];
        let (total_written, src) = timeout(ttl, self.sock.recv_from(&mut buf)).await??;

        Ok((Packet::decode(&buf[..total_written]), src))
    }
}
