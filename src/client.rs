// Client side of a transfer.
//
// Every call to download or upload owns a fresh socket bound to a random port (our TID) and a
// Session that lives exactly as long as the call. The request goes to the server's well-known
// port; whichever port the server answers from becomes the peer TID for the rest of the transfer.
//
// The exchange is lock-step: send one packet, then wait for the reply that moves the transfer
// forward. Garbage and stale packets are handed to the processor or dropped without resetting the
// wait. When the wait runs out, the last packet is sent again, up to `max_retries` times.

use crate::processor::{PacketProcessor, ResultAction};
use crate::tftp;
use rand::Rng;
use std::error;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_MAX_RETRIES: usize = 3;
const MAX_BIND_ATTEMPTS: usize = 16;

pub type TransferResult<T> = Result<T, TransferError>;

/// Knobs for a transfer.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Port the request is sent to.
    pub port: u16,

    /// How long to wait for each reply.
    pub timeout: Duration,

    /// How many times the last packet is re-sent after a timeout before giving up.
    pub max_retries: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            port: tftp::TFTP_PORT,
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// A TFTP client for one server. Holds no connection state, each transfer gets its own socket.
#[derive(Debug, Clone)]
pub struct TftpClient {
    server: String,
    config: TransferConfig,
}

impl TftpClient {
    pub fn new(server: impl Into<String>) -> TftpClient {
        Self::with_config(server, TransferConfig::default())
    }

    pub fn with_config(server: impl Into<String>, config: TransferConfig) -> TftpClient {
        TftpClient {
            server: server.into(),
            config,
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Fetches `remote` from the server into the local file at `local`.
    ///
    /// The local file is only created once the first block arrives. If the transfer fails
    /// afterwards it keeps whatever was written up to that point.
    pub async fn download(&self, remote: &str, local: impl AsRef<Path>) -> TransferResult<()> {
        let local = local.as_ref();
        let request = tftp::Packet::ReadReq {
            path: remote.to_string(),
            mode: tftp::OCTET_MODE.to_string(),
        };
        request.encode()?;

        let server = self.resolve().await?;
        log::info!("Downloading {remote} from {server} into {:?}", local);

        let mut processor = PacketProcessor::new_for_download(local);
        Session::open(server, &self.config)?.run(request, &mut processor).await?;

        log::info!("Download of {remote} complete");
        Ok(())
    }

    /// Sends the local file at `local` to the server, stored as `remote`.
    pub async fn upload(&self, local: impl AsRef<Path>, remote: &str) -> TransferResult<()> {
        let local = local.as_ref();
        let request = tftp::Packet::WriteReq {
            path: remote.to_string(),
            mode: tftp::OCTET_MODE.to_string(),
        };
        request.encode()?;

        // The source must be readable before anything goes on the wire.
        let mut processor = PacketProcessor::new_for_upload(local).await?;

        let server = self.resolve().await?;
        log::info!("Uploading {:?} to {server} as {remote}", local);

        Session::open(server, &self.config)?.run(request, &mut processor).await?;

        log::info!("Upload of {remote} complete");
        Ok(())
    }

    /// Blocking form of [`TftpClient::download`]. Must not be called from inside a tokio runtime.
    pub fn download_blocking(&self, remote: &str, local: impl AsRef<Path>) -> TransferResult<()> {
        blocking_runtime()?.block_on(self.download(remote, local))
    }

    /// Blocking form of [`TftpClient::upload`]. Must not be called from inside a tokio runtime.
    pub fn upload_blocking(&self, local: impl AsRef<Path>, remote: &str) -> TransferResult<()> {
        blocking_runtime()?.block_on(self.upload(local, remote))
    }

    async fn resolve(&self) -> TransferResult<SocketAddr> {
        tokio::net::lookup_host((self.server.as_str(), self.config.port))
            .await
            .map_err(TransferError::Network)?
            .next()
            .ok_or_else(|| {
                TransferError::Network(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("No address found for {}", self.server),
                ))
            })
    }
}

/// Downloads `remote` from `server` with the default configuration.
pub async fn download(server: &str, remote: &str, local: impl AsRef<Path>) -> TransferResult<()> {
    TftpClient::new(server).download(remote, local).await
}

/// Uploads `local` to `server` as `remote` with the default configuration.
pub async fn upload(server: &str, local: impl AsRef<Path>, remote: &str) -> TransferResult<()> {
    TftpClient::new(server).upload(local, remote).await
}

fn blocking_runtime() -> TransferResult<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(TransferError::Network)
}

/// Attempts to bind to a random UDP port, leaving the choice to the OS if none is free.
fn bind_random_socket(server: SocketAddr) -> TransferResult<tftp::TftpSocket> {
    let ip: IpAddr = match server {
        SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    };

    let mut rng = rand::thread_rng();
    for _ in 0..MAX_BIND_ATTEMPTS {
        match tftp::TftpSocket::bind((ip, rng.gen_range(1024..65535_u16)).into()) {
            Ok(sock) => return Ok(sock),
            Err(e) => log::warn!("Couldn't bind socket: {e}"),
        }
    }
    Ok(tftp::TftpSocket::bind((ip, 0).into())?)
}

async fn send_error_packet(sock: &tftp::TftpSocket, dst: SocketAddr, code: tftp::ErrorCode, message: &str) {
    // Error packet is sent as a courtesy, we don't care how it goes.
    let _ = sock
        .send(&tftp::Packet::Error { code, message: message.to_string() }, dst)
        .await;
}

/// What came out of waiting for a reply.
enum Wait {
    Send(tftp::Packet),
    Done,
    TimedOut,
}

/// State of one transfer.
struct Session<'a> {
    sock: tftp::TftpSocket,

    /// Where requests go, the server's well-known port.
    server: SocketAddr,

    /// The server's TID, set from the first reply the processor acts on and never changed after.
    peer: Option<SocketAddr>,

    config: &'a TransferConfig,
}

impl<'a> Session<'a> {
    fn open(server: SocketAddr, config: &'a TransferConfig) -> TransferResult<Session<'a>> {
        let sock = bind_random_socket(server)?;
        if let Ok(local) = sock.local_addr() {
            log::debug!("Bound transfer socket to {local}");
        }
        Ok(Session {
            sock,
            server,
            peer: None,
            config,
        })
    }

    fn destination(&self) -> SocketAddr {
        self.peer.unwrap_or(self.server)
    }

    /// Sends `request` and drives the exchange until the processor is done or something fails.
    async fn run(&mut self, request: tftp::Packet, processor: &mut PacketProcessor) -> TransferResult<()> {
        let mut out_packet = request;
        let mut retries = 0;

        // Used for sending as well as retransmitting, depending on whether |out_packet| changed.
        loop {
            self.sock.send(&out_packet, self.destination()).await?;

            match self.await_reply(processor).await? {
                Wait::Send(p) => {
                    out_packet = p;
                    retries = 0;
                }
                Wait::Done => return Ok(()),
                Wait::TimedOut if retries < self.config.max_retries => {
                    retries += 1;
                    log::info!(
                        "Timed out waiting on {}, retransmitting {:?} ({retries}/{})",
                        self.destination(),
                        out_packet.kind(),
                        self.config.max_retries
                    );
                }
                Wait::TimedOut => {
                    return Err(TransferError::Timeout {
                        waited: self.config.timeout,
                        attempts: retries + 1,
                    })
                }
            }
        }
    }

    async fn await_reply(&mut self, processor: &mut PacketProcessor) -> TransferResult<Wait> {
        let deadline = Instant::now() + self.config.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Wait::TimedOut);
            }

            let (decoded, src) = match self.sock.recv_with_timeout(remaining).await {
                Ok(received) => received,
                Err(tftp::SocketError::Timeout(_)) => return Ok(Wait::TimedOut),
                Err(e) => return Err(e.into()),
            };

            if !self.accept_source(src).await {
                continue;
            }

            let packet = match decoded {
                Ok(packet) => packet,
                // Only the server's first reply has to make sense, later noise is dropped.
                Err(e) if self.peer.is_some() => {
                    log::debug!("Ignoring malformed datagram from {src}: {e}");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let action = processor.process_packet(&packet).await;
            if self.peer.is_none() && !matches!(action, ResultAction::RetryRecv) {
                log::debug!("Server answered from {src}");
                self.peer = Some(src);
            }

            match action {
                ResultAction::SendPacketAndAwait(p) => return Ok(Wait::Send(p)),
                ResultAction::RetryRecv => continue,
                ResultAction::Complete(last) => {
                    if let Some(p) = last {
                        self.sock.send(&p, src).await?;
                    }
                    return Ok(Wait::Done);
                }
                ResultAction::Fail(e, courtesy) => {
                    if let Some(p) = courtesy {
                        let _ = self.sock.send(&p, src).await;
                    }
                    log::warn!("Transfer with {src} failed: {e}");
                    return Err(e);
                }
            }
        }
    }

    /// Checks the source of a datagram against the peer. Until the peer is fixed, anything from
    /// the server's address is let through.
    async fn accept_source(&self, src: SocketAddr) -> bool {
        match self.peer {
            Some(peer) if peer == src => true,
            Some(peer) => {
                log::warn!("Rejecting datagram from {src}, this transfer is with {peer}");
                send_error_packet(&self.sock, src, tftp::ErrorCode::UnknownTid, "Unknown transfer ID").await;
                false
            }
            None if src.ip() == self.server.ip() => true,
            None => {
                log::warn!("Ignoring datagram from {src} while waiting on {}", self.server);
                false
            }
        }
    }
}

/// Why a transfer ended in failure.
#[derive(Debug)]
pub enum TransferError {
    /// The request could not be put on the wire, e.g. a filename containing NUL.
    Encoding(String),
    /// The first reply to a request could not be decoded.
    MalformedPacket(String),
    /// The server sent an Error packet.
    Remote { code: tftp::ErrorCode, message: String },
    /// The upload source could not be opened.
    LocalFileNotFound { path: PathBuf, source: io::Error },
    /// Reading or writing the local file failed mid-transfer.
    LocalIo(io::Error),
    /// No valid reply arrived within the timeout, after all retransmissions.
    Timeout { waited: Duration, attempts: usize },
    Network(io::Error),
    /// The server replied with something that makes no sense at this point.
    ProtocolViolation(String),
}

impl error::Error for TransferError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::LocalFileNotFound { source, .. } => Some(source),
            Self::LocalIo(e) | Self::Network(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Encoding(msg) => write!(f, "Cannot encode request: {msg}"),
            Self::MalformedPacket(msg) => write!(f, "Malformed reply from server: {msg}"),
            Self::Remote { code, message } => write!(f, "Server error {code}: {message}"),
            Self::LocalFileNotFound { path, source } => {
                write!(f, "Local file not found: {} ({source})", path.display())
            }
            Self::LocalIo(e) => write!(f, "Local file IO error: {e}"),
            Self::Timeout { waited, attempts } => {
                write!(f, "Timed out after {attempts} attempt(s) of {waited:?} each")
            }
            Self::Network(e) => write!(f, "Network error: {e}"),
            Self::ProtocolViolation(msg) => write!(f, "Protocol violation: {msg}"),
        }
    }
}

impl From<tftp::SocketError> for TransferError {
    fn from(e: tftp::SocketError) -> TransferError {
        match e {
            tftp::SocketError::IO(e) => TransferError::Network(e),
            tftp::SocketError::PacketParse(msg) => TransferError::MalformedPacket(msg),
            tftp::SocketError::Encoding(msg) => TransferError::Encoding(msg),
            // Sessions handle their own waits, a bare socket timeout is just a network failure.
            tftp::SocketError::Timeout(e) => TransferError::Network(io::Error::new(io::ErrorKind::TimedOut, e)),
        }
    }
}
