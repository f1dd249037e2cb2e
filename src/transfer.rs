//! Block engines shared by both roles.
//!
//! A transfer has exactly two sides: the one emitting DATA blocks and
//! consuming ACKs ([`Sender`]), and the one consuming DATA blocks and
//! emitting ACKs ([`Receiver`]). The client uses a `Sender` when putting a
//! file and a `Receiver` when getting one; the server uses the opposite side
//! of the same pair. Handlers never touch the network: they consume one
//! decoded packet and return an [`Action`] describing the effect the event
//! loop should carry out, which keeps the state machines testable without
//! sockets.

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::wire::{ErrorCode, Packet, BLOCK_SIZE};

/// Effect requested by a state machine after consuming one event.
#[derive(Debug, PartialEq)]
pub enum Action {
    /// Send the packet to the session peer and restart the ack timer.
    Reply(Packet),
    /// Send the packet, then tear the session down as completed.
    FinishWith(Packet),
    /// Transfer completed with nothing left to send.
    Finish,
    /// Stale or duplicate block number: no state change, no reply.
    Ignore,
    /// Resend the last transmitted datagram verbatim and restart the ack timer.
    Retransmit,
    /// Send the error packet as a courtesy, then tear the session down as failed.
    Fail(Packet),
    /// The peer reported an error: tear down without replying.
    Abort(String),
}

/// One side of an active transfer, driven by the event loop.
#[allow(async_fn_in_trait)] // only ever used through generics
pub trait BlockHandler {
    /// Short tag for trace logging.
    fn label(&self) -> &'static str;

    /// Cumulative payload bytes moved, for progress reports.
    fn bytes_moved(&self) -> u64;

    /// Consumes one decoded packet from the session peer.
    async fn handle(&mut self, packet: &Packet) -> Action;
}

fn unexpected_opcode(packet: &Packet) -> Action {
    Action::Fail(Packet::Error {
        code: ErrorCode::NotDefined,
        message: format!("unexpected {} packet", packet.kind()),
    })
}

fn peer_error(code: ErrorCode, message: &str) -> Action {
    Action::Abort(format!("peer sent error {code}: {message}"))
}

/// Reads the next file chunk, at most one block. A returned length shorter
/// than [`BLOCK_SIZE`] means the file is exhausted. Loops because a single
/// read may fill only part of the buffer.
async fn read_block(f: &mut File) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; BLOCK_SIZE];
    let mut filled = 0;
    loop {
        let n = f.read(&mut buf[filled..]).await?;
        if n == 0 {
            buf.truncate(filled);
            return Ok(buf);
        }
        filled += n;
        if filled == buf.len() {
            return Ok(buf);
        }
    }
}

/// Emits DATA blocks from an open file, one in flight at a time.
#[derive(Debug)]
pub struct Sender {
    file: File,
    /// Block number of the last DATA sent; the ack we are waiting for.
    block: u16,
    /// Payload length of the last DATA sent. A short block means the file is
    /// done once it has been acknowledged.
    last_len: usize,
    started: bool,
    bytes_sent: u64,
}

impl Sender {
    /// Sender that has not transmitted yet. Used for uploads, where the
    /// baseline ACK carries block number 0.
    pub fn new(file: File) -> Sender {
        Sender { file, block: 0, last_len: 0, started: false, bytes_sent: 0 }
    }

    /// Sender that transmits DATA block 1 immediately. Used by the server
    /// when it grants a read request.
    pub async fn start(file: File) -> io::Result<(Sender, Packet)> {
        let mut sender = Sender::new(file);
        let payload = read_block(&mut sender.file).await?;
        sender.block = 1;
        sender.last_len = payload.len();
        sender.started = true;
        sender.bytes_sent = payload.len() as u64;
        Ok((sender, Packet::Data { block: 1, payload }))
    }

    async fn next_data(&mut self) -> Action {
        let payload = match read_block(&mut self.file).await {
            Ok(p) => p,
            Err(e) => {
                return Action::Fail(Packet::Error {
                    code: ErrorCode::NotDefined,
                    message: format!("error reading source file: {e}"),
                })
            }
        };

        // Nothing left to read and the last block was already short: the
        // short block carried the end of the file, so its ack completes the
        // transfer. Otherwise an empty DATA block goes out as the explicit
        // terminator (file length an exact multiple of the block size).
        if payload.is_empty() && self.started && self.last_len < BLOCK_SIZE {
            return Action::Finish;
        }

        self.block = self.block.wrapping_add(1);
        self.last_len = payload.len();
        self.started = true;
        self.bytes_sent += payload.len() as u64;
        Action::Reply(Packet::Data { block: self.block, payload })
    }

    async fn on_ack(&mut self, block: u16) -> Action {
        if block != self.block {
            log::debug!("ignoring ack for block {block}, awaiting {}", self.block);
            return Action::Ignore;
        }
        self.next_data().await
    }
}

impl BlockHandler for Sender {
    fn label(&self) -> &'static str {
        "sending-data"
    }

    fn bytes_moved(&self) -> u64 {
        self.bytes_sent
    }

    async fn handle(&mut self, packet: &Packet) -> Action {
        match packet {
            Packet::Ack { block } => self.on_ack(*block).await,
            Packet::Error { code, message } => peer_error(*code, message),
            other => unexpected_opcode(other),
        }
    }
}

#[derive(Debug)]
enum Sink {
    /// Destination path, opened on the first accepted block so that a
    /// transfer that never produces data never creates a file.
    Pending(PathBuf),
    Open(File),
}

/// Consumes DATA blocks into a file and acknowledges each one.
#[derive(Debug)]
pub struct Receiver {
    sink: Sink,
    /// Next expected DATA block number, starting at 1.
    expected: u16,
    bytes_written: u64,
}

impl Receiver {
    /// Receiver that opens `path` for writing when the first block arrives.
    pub fn pending(path: &Path) -> Receiver {
        Receiver { sink: Sink::Pending(path.to_path_buf()), expected: 1, bytes_written: 0 }
    }

    /// Receiver around an already opened destination file.
    pub fn open(file: File) -> Receiver {
        Receiver { sink: Sink::Open(file), expected: 1, bytes_written: 0 }
    }

    async fn on_data(&mut self, block: u16, payload: &[u8]) -> Action {
        if block != self.expected {
            log::debug!("ignoring data block {block}, expecting {}", self.expected);
            return Action::Ignore;
        }

        if let Sink::Pending(path) = &self.sink {
            match File::create(path).await {
                Ok(f) => self.sink = Sink::Open(f),
                Err(e) => {
                    return Action::Fail(Packet::Error {
                        code: ErrorCode::FileNotFound,
                        message: format!("failed to open file for writing: {e}"),
                    })
                }
            }
        }
        let file = match &mut self.sink {
            Sink::Open(f) => f,
            Sink::Pending(_) => unreachable!("sink opened above"),
        };

        if let Err(e) = file.write_all(payload).await {
            return Action::Fail(Packet::Error {
                code: ErrorCode::NotDefined,
                message: format!("error writing file data: {e}"),
            });
        }

        self.expected = self.expected.wrapping_add(1);
        self.bytes_written += payload.len() as u64;

        let ack = Packet::Ack { block };
        if payload.len() < BLOCK_SIZE {
            // Final block. Every byte must reach the file before the final
            // ack goes out: write_all only queues the write, and the peer
            // treats that ack as proof the whole file landed.
            if let Err(e) = file.flush().await {
                return Action::Fail(Packet::Error {
                    code: ErrorCode::NotDefined,
                    message: format!("error writing file data: {e}"),
                });
            }
            Action::FinishWith(ack)
        } else {
            Action::Reply(ack)
        }
    }
}

impl BlockHandler for Receiver {
    fn label(&self) -> &'static str {
        "receiving-data"
    }

    fn bytes_moved(&self) -> u64 {
        self.bytes_written
    }

    async fn handle(&mut self, packet: &Packet) -> Action {
        match packet {
            Packet::Data { block, payload } => self.on_data(*block, payload).await,
            Packet::Error { code, message } => peer_error(*code, message),
            other => unexpected_opcode(other),
        }
    }
}
