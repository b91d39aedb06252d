// A TFTP client (RFC 1350), octet mode only.
//
// Transfer begins with a request to read (RRQ) or write (WRQ) a file, sent to port 69 of the
// server. The server answers from a port of its own choosing, and the rest of the transfer
// happens between that port and ours. Files move in blocks of 512 bytes. Each DATA packet is
// acked before the next one is sent, and a DATA packet shorter than 512 bytes ends the transfer,
// so a file whose length is a multiple of 512 is followed by one empty DATA packet.
//
// Packets (all integers big-endian):
//
// opcode   operation
// 1        Read req (RRQ)    0x01 | Filename | 0x00 | Mode | 0x00
// 2        Write req (WRQ)   0x02 | Filename | 0x00 | Mode | 0x00
// 3        Data (DATA)       0x03 | Block # (2 bytes) | Data (0-512 bytes)
// 4        ACK               0x04 | Block # (2 bytes)
// 5        ERROR             0x05 | ErrorCode (2 bytes) | ErrMsg | 0x00
//
// An ERROR packet ends the transfer. It is never acked or retransmitted.

pub mod client;
pub mod processor;
pub mod tftp;

pub use client::{download, upload, TftpClient, TransferConfig, TransferError, TransferResult};
