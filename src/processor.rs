use crate::client::TransferError;
use crate::tftp;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{self, AsyncReadExt, AsyncWriteExt};

/// An entity that consumes the packets of one transfer and decides the response.
#[derive(Debug)]
pub enum PacketProcessor {
    Download(DownloadProcessor),
    Upload(UploadProcessor),
}

impl PacketProcessor {
    /// The destination is not touched until the first block arrives.
    pub fn new_for_download(path: &Path) -> PacketProcessor {
        PacketProcessor::Download(DownloadProcessor::new(path))
    }

    pub async fn new_for_upload(path: &Path) -> Result<PacketProcessor, TransferError> {
        match File::open(path).await {
            Ok(f) => Ok(PacketProcessor::Upload(UploadProcessor::new(f))),
            Err(source) => Err(TransferError::LocalFileNotFound {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Given an incoming packet, processes it and describes the action the caller should take.
    pub async fn process_packet(&mut self, packet: &tftp::Packet) -> ResultAction {
        match self {
            PacketProcessor::Download(p) => p.process_data(packet).await,
            PacketProcessor::Upload(p) => p.process_ack(packet).await,
        }
    }
}

/// Represents an action that the caller of PacketProcessor should take in
/// response to processing a packet.
#[derive(Debug)]
pub enum ResultAction {
    /// Caller should send the packet and await a response.
    SendPacketAndAwait(tftp::Packet),

    /// Caller should keep waiting for the packet it expects.
    RetryRecv,

    /// The transfer is done. Caller sends the packet, if any, and stops.
    Complete(Option<tftp::Packet>),

    /// The transfer failed. Caller sends the packet, if any, as a courtesy and stops.
    Fail(TransferError, Option<tftp::Packet>),
}

fn courtesy_error(e: &io::Error, what: &str) -> tftp::Packet {
    tftp::Packet::Error {
        code: e.kind().into(),
        message: format!("Client failed to {what}: {e}"),
    }
}

fn remote_error(code: tftp::ErrorCode, message: &str) -> ResultAction {
    ResultAction::Fail(
        TransferError::Remote {
            code,
            message: message.to_string(),
        },
        None,
    )
}

#[derive(Debug)]
pub struct DownloadProcessor {
    path: PathBuf,
    f: Option<File>,
    /// Block number of the next DATA packet we accept.
    expected_block: u16,
    received_any: bool,
}

impl DownloadProcessor {
    fn new(path: &Path) -> DownloadProcessor {
        DownloadProcessor {
            path: path.to_path_buf(),
            f: None,
            expected_block: 1,
            received_any: false,
        }
    }

    async fn process_data(&mut self, packet: &tftp::Packet) -> ResultAction {
        match packet {
            tftp::Packet::Data { block, data } if *block == self.expected_block => {
                if let Err(e) = self.append(data).await {
                    let courtesy = courtesy_error(&e, "write the destination file");
                    return ResultAction::Fail(TransferError::LocalIo(e), Some(courtesy));
                }
                log::debug!("Received block {block} ({} bytes)", data.len());

                self.received_any = true;
                self.expected_block = self.expected_block.wrapping_add(1);
                let ack = tftp::Packet::Ack { block: *block };

                if data.len() < tftp::DATA_BUFFER_SIZE {
                    if let Some(f) = self.f.as_mut() {
                        if let Err(e) = f.flush().await {
                            let courtesy = courtesy_error(&e, "write the destination file");
                            return ResultAction::Fail(TransferError::LocalIo(e), Some(courtesy));
                        }
                    }
                    ResultAction::Complete(Some(ack))
                } else {
                    ResultAction::SendPacketAndAwait(ack)
                }
            }
            tftp::Packet::Data { block, .. } => {
                if !self.received_any {
                    log::debug!("Ignoring block {block} before block 1 arrived");
                    return ResultAction::RetryRecv;
                }
                // The peer probably lost our last ack, repeat it without writing anything.
                let prev = self.expected_block.wrapping_sub(1);
                log::debug!("Got block {block} while expecting {}, re-acking {prev}", self.expected_block);
                ResultAction::SendPacketAndAwait(tftp::Packet::Ack { block: prev })
            }
            tftp::Packet::Error { code, message } => remote_error(*code, message),
            other => {
                log::debug!("Ignoring unexpected {:?} packet during download", other.kind());
                ResultAction::RetryRecv
            }
        }
    }

    async fn append(&mut self, data: &[u8]) -> Result<(), io::Error> {
        let f = match self.f.take() {
            Some(f) => f,
            None => {
                log::info!("Writing to {:?}", self.path);
                File::create(&self.path).await?
            }
        };
        self.f.insert(f).write_all(data).await
    }
}

#[derive(Debug)]
pub struct UploadProcessor {
    f: File,
    /// The block most recently sent, 0 until the server accepted the request.
    curr_block: u16,
    accepted: bool,
    awaiting_final_ack: bool,
}

impl UploadProcessor {
    fn new(f: File) -> UploadProcessor {
        UploadProcessor {
            f,
            curr_block: 0,
            accepted: false,
            awaiting_final_ack: false,
        }
    }

    async fn process_ack(&mut self, packet: &tftp::Packet) -> ResultAction {
        match packet {
            &tftp::Packet::Ack { block } if block == self.curr_block => {
                if self.awaiting_final_ack {
                    return ResultAction::Complete(None);
                }
                self.accepted = true;
                match read_block_from_file(&mut self.f).await {
                    Ok(data) => {
                        self.curr_block = self.curr_block.wrapping_add(1);
                        if data.len() < tftp::DATA_BUFFER_SIZE {
                            if data.is_empty() && self.curr_block > 1 {
                                log::debug!(
                                    "Source ended on a block boundary, sending empty block {}",
                                    self.curr_block
                                );
                            }
                            self.awaiting_final_ack = true;
                        }
                        log::debug!("Sending block {} ({} bytes)", self.curr_block, data.len());
                        ResultAction::SendPacketAndAwait(tftp::Packet::Data {
                            block: self.curr_block,
                            data,
                        })
                    }
                    Err(e) => {
                        let courtesy = courtesy_error(&e, "read the source file");
                        ResultAction::Fail(TransferError::LocalIo(e), Some(courtesy))
                    }
                }
            }
            tftp::Packet::Error { code, message } => remote_error(*code, message),
            other if !self.accepted => ResultAction::Fail(
                TransferError::ProtocolViolation(format!(
                    "Expected Ack for block 0 in reply to the write request, but got {:?} instead",
                    other
                )),
                None,
            ),
            tftp::Packet::Ack { block } => {
                // Stale or early ack. Do not resend, that way lies the Sorcerer's Apprentice.
                log::debug!("Ignoring ack for block {block} while waiting on {}", self.curr_block);
                ResultAction::RetryRecv
            }
            other => {
                log::debug!("Ignoring unexpected {:?} packet during upload", other.kind());
                ResultAction::RetryRecv
            }
        }
    }
}

async fn read_block_from_file(f: &mut File) -> Result<Vec<u8>, io::Error> {
    let mut buf = vec![0_u8; tftp::DATA_BUFFER_SIZE];
    let mut cursor = 0;

    // A single read may return fewer bytes than asked for without being at EOF, so keep reading
    // into the remainder until the block is full or the file ends.
    loop {
        let s = f.read(&mut buf[cursor..]).await?;
        cursor += s;
        if cursor == buf.len() || s == 0 {
            buf.truncate(cursor);
            return Ok(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;
    use tokio_test::assert_err;

    async fn upload_processor_for(contents: &[u8]) -> (TempDir, PacketProcessor) {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("test.bin");
        tokio::fs::write(&path, contents).await.unwrap();
        let processor = PacketProcessor::new_for_upload(&path).await.unwrap();
        (tmpdir, processor)
    }

    fn expect_send(action: ResultAction) -> tftp::Packet {
        match action {
            ResultAction::SendPacketAndAwait(p) => p,
            other => panic!("expected SendPacketAndAwait, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_new_for_upload_invalid_path() {
        let res = PacketProcessor::new_for_upload(Path::new("/some/invalid/file.txt")).await;
        match assert_err!(res) {
            TransferError::LocalFileNotFound { path, source } => {
                assert_eq!(path, PathBuf::from("/some/invalid/file.txt"));
                assert_eq!(source.kind(), io::ErrorKind::NotFound);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_upload_multiple_blocks() {
        let mut contents = vec![0x78; 1024];
        contents.extend_from_slice(b"testing");
        let (_tmpdir, mut processor) = upload_processor_for(&contents).await;

        assert_eq!(
            expect_send(processor.process_packet(&tftp::Packet::Ack { block: 0 }).await),
            tftp::Packet::Data { block: 1, data: vec![0x78; 512] }
        );
        assert_eq!(
            expect_send(processor.process_packet(&tftp::Packet::Ack { block: 1 }).await),
            tftp::Packet::Data { block: 2, data: vec![0x78; 512] }
        );
        assert_eq!(
            expect_send(processor.process_packet(&tftp::Packet::Ack { block: 2 }).await),
            tftp::Packet::Data { block: 3, data: b"testing".to_vec() }
        );
        assert!(matches!(
            processor.process_packet(&tftp::Packet::Ack { block: 3 }).await,
            ResultAction::Complete(None)
        ));
    }

    #[tokio::test]
    async fn test_upload_block_boundary_sends_empty_block() {
        let (_tmpdir, mut processor) = upload_processor_for(&[0x11; 512]).await;

        assert_eq!(
            expect_send(processor.process_packet(&tftp::Packet::Ack { block: 0 }).await),
            tftp::Packet::Data { block: 1, data: vec![0x11; 512] }
        );
        assert_eq!(
            expect_send(processor.process_packet(&tftp::Packet::Ack { block: 1 }).await),
            tftp::Packet::Data { block: 2, data: vec![] }
        );
        assert!(matches!(
            processor.process_packet(&tftp::Packet::Ack { block: 2 }).await,
            ResultAction::Complete(None)
        ));
    }

    #[tokio::test]
    async fn test_upload_ignores_stale_ack() {
        let (_tmpdir, mut processor) = upload_processor_for(&[0x11; 600]).await;

        let _ = processor.process_packet(&tftp::Packet::Ack { block: 0 }).await;
        assert!(matches!(
            processor.process_packet(&tftp::Packet::Ack { block: 0 }).await,
            ResultAction::RetryRecv
        ));
        assert!(matches!(
            processor.process_packet(&tftp::Packet::Ack { block: 7 }).await,
            ResultAction::RetryRecv
        ));
    }

    #[tokio::test]
    async fn test_upload_rejects_non_ack_reply_to_request() {
        let (_tmpdir, mut processor) = upload_processor_for(b"abc").await;

        match processor.process_packet(&tftp::Packet::Data { block: 1, data: vec![0x01] }).await {
            ResultAction::Fail(TransferError::ProtocolViolation(_), None) => {}
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_upload_recv_error() {
        let (_tmpdir, mut processor) = upload_processor_for(&[0x11; 600]).await;

        let _ = processor.process_packet(&tftp::Packet::Ack { block: 0 }).await;
        match processor
            .process_packet(&tftp::Packet::Error {
                code: tftp::ErrorCode::DiskFull,
                message: "whoops".to_string(),
            })
            .await
        {
            ResultAction::Fail(TransferError::Remote { code, message }, None) => {
                assert_eq!(code, tftp::ErrorCode::DiskFull);
                assert_eq!(message, "whoops");
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_download_creates_file_lazily() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("out.bin");
        let mut processor = PacketProcessor::new_for_download(&path);

        assert!(!path.exists());
        assert!(matches!(
            processor.process_packet(&tftp::Packet::Data { block: 2, data: vec![1] }).await,
            ResultAction::RetryRecv
        ));
        assert!(!path.exists());

        assert_eq!(
            expect_send(processor.process_packet(&tftp::Packet::Data { block: 1, data: vec![0x78; 512] }).await),
            tftp::Packet::Ack { block: 1 }
        );
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_download_multiple_blocks() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("out.bin");
        let mut processor = PacketProcessor::new_for_download(&path);

        assert_eq!(
            expect_send(processor.process_packet(&tftp::Packet::Data { block: 1, data: vec![0x78; 512] }).await),
            tftp::Packet::Ack { block: 1 }
        );
        match processor.process_packet(&tftp::Packet::Data { block: 2, data: b"testing".to_vec() }).await {
            ResultAction::Complete(Some(tftp::Packet::Ack { block: 2 })) => {}
            other => panic!("unexpected action {:?}", other),
        }
        drop(processor);

        let mut expected = vec![0x78; 512];
        expected.extend_from_slice(b"testing");
        assert_eq!(tokio::fs::read(&path).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_download_duplicate_block_is_reacked_not_written() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("out.bin");
        let mut processor = PacketProcessor::new_for_download(&path);

        let _ = processor.process_packet(&tftp::Packet::Data { block: 1, data: vec![0x01; 512] }).await;
        assert_eq!(
            expect_send(processor.process_packet(&tftp::Packet::Data { block: 1, data: vec![0x01; 512] }).await),
            tftp::Packet::Ack { block: 1 }
        );
        assert!(matches!(
            processor.process_packet(&tftp::Packet::Data { block: 2, data: vec![] }).await,
            ResultAction::Complete(Some(tftp::Packet::Ack { block: 2 }))
        ));
        drop(processor);

        assert_eq!(tokio::fs::read(&path).await.unwrap(), vec![0x01; 512]);
    }

    #[tokio::test]
    async fn test_download_recv_error() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("out.bin");
        let mut processor = PacketProcessor::new_for_download(&path);

        match processor
            .process_packet(&tftp::Packet::Error {
                code: tftp::ErrorCode::FileNotFound,
                message: "File not found".to_string(),
            })
            .await
        {
            ResultAction::Fail(TransferError::Remote { code, message }, None) => {
                assert_eq!(code, tftp::ErrorCode::FileNotFound);
                assert_eq!(message, "File not found");
            }
            other => panic!("unexpected action {:?}", other),
        }
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_download_unwritable_destination() {
        let mut processor = PacketProcessor::new_for_download(Path::new("/some/invalid/out.bin"));

        match processor.process_packet(&tftp::Packet::Data { block: 1, data: vec![1] }).await {
            ResultAction::Fail(TransferError::LocalIo(_), Some(tftp::Packet::Error { code, .. })) => {
                assert_eq!(code, tftp::ErrorCode::FileNotFound);
            }
            other => panic!("unexpected action {:?}", other),
        }
    }
}
