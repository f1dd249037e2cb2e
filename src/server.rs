//! Server session state machine.
//!
//! The server polls its well-known port while in `WaitingForRequest`. A
//! granted RRQ or WRQ binds a fresh ephemeral socket whose port becomes the
//! session TID; every reply of that session, including the very first one,
//! leaves from the TID port. The listening socket is not polled while a
//! transfer is active: one session at a time, and a request arriving
//! mid-transfer simply waits in the listening socket's queue.
//!
//! Whatever way a session ends, the server returns to `WaitingForRequest`
//! and keeps serving; only the stop flag ends the process.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use tokio::fs::File;

use crate::config::ServerConfig;
use crate::session::{drive, Outcome, Session, POLL_INTERVAL};
use crate::socket::{SocketError, TftpSocket};
use crate::transfer::{BlockHandler, Receiver, Sender};
use crate::wire::{ErrorCode, Packet};

pub struct Server {
    sock: TftpSocket,
    max_retries: u32,
}

impl Server {
    pub fn bind(cfg: &ServerConfig) -> anyhow::Result<Server> {
        let sock = TftpSocket::bind((Ipv4Addr::UNSPECIFIED, cfg.port).into())
            .with_context(|| format!("could not bind UDP port {}", cfg.port))?;
        Ok(Server { sock, max_retries: cfg.max_retries })
    }

    /// The actual listening address, useful when the configured port was 0.
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.sock.local_addr()?)
    }

    /// Serves requests until the stop flag is raised.
    pub async fn serve(&mut self, stop: &AtomicBool) -> anyhow::Result<()> {
        log::info!("server up, waiting for client requests");
        log::trace!("server state: WaitingForRequest");

        loop {
            if stop.load(Ordering::Relaxed) {
                log::info!("stop requested, shutting down");
                return Ok(());
            }

            match self.sock.recv_with_timeout(POLL_INTERVAL).await {
                Ok((packet, src)) => self.on_request(packet, src, stop).await,
                Err(SocketError::Timeout(_)) => {}
                Err(SocketError::Malformed(e)) => {
                    log::debug!("dropping undecodable datagram: {e}");
                }
                Err(e) => return Err(e).context("listening socket failed"),
            }
        }
    }

    async fn on_request(&mut self, packet: Packet, src: SocketAddr, stop: &AtomicBool) {
        log::trace!("WaitingForRequest: PDU_RECEIVED {}", packet.kind());
        match packet {
            Packet::ReadReq { filename, mode } => {
                log::info!("received request to read '{filename}' ({mode}) from {src}");
                self.serve_download(&filename, src, stop).await;
            }
            Packet::WriteReq { filename, mode } => {
                log::info!("received request to write '{filename}' ({mode}) from {src}");
                self.serve_upload(&filename, src, stop).await;
            }
            other => {
                log::warn!("unexpected {} packet from {src} while waiting", other.kind());
                let reject = Packet::Error {
                    code: ErrorCode::NotDefined,
                    message: format!("unexpected {} packet", other.kind()),
                };
                if let Err(e) = self.sock.send(&reject, src).await {
                    log::debug!("could not send rejection: {e}");
                }
            }
        }
        log::trace!("server state: WaitingForRequest");
    }

    /// Grants an RRQ: DATA block 1 goes out with the first reply, from the
    /// freshly bound TID port.
    async fn serve_download(&mut self, filename: &str, peer: SocketAddr, stop: &AtomicBool) {
        let mut sock = match TftpSocket::bind_ephemeral() {
            Ok(s) => s,
            Err(e) => {
                log::error!("could not bind a session port: {e}");
                return;
            }
        };

        let file = match File::open(filename).await {
            Ok(f) => f,
            Err(e) => {
                log::warn!("failed to open '{filename}' for reading: {e}");
                let reject = Packet::Error {
                    code: ErrorCode::FileNotFound,
                    message: "file not found".to_string(),
                };
                if let Err(e) = sock.send(&reject, peer).await {
                    log::debug!("could not send rejection: {e}");
                }
                return;
            }
        };

        let (mut sender, first) = match Sender::start(file).await {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("failed to read '{filename}': {e}");
                let reject = Packet::Error {
                    code: ErrorCode::NotDefined,
                    message: "error reading source file".to_string(),
                };
                if let Err(e) = sock.send(&reject, peer).await {
                    log::debug!("could not send rejection: {e}");
                }
                return;
            }
        };

        log::trace!("server state: ServingDownload");
        let mut session = Session::new(sock, peer, true, self.max_retries);
        if let Err(e) = session.send(&first).await {
            log::warn!("error sending first data packet: {e}");
            return;
        }
        self.finish_session(drive(&mut session, &mut sender, stop).await, filename, &sender);
    }

    /// Grants a WRQ: the destination file opens immediately and ACK 0 is the
    /// first reply.
    async fn serve_upload(&mut self, filename: &str, peer: SocketAddr, stop: &AtomicBool) {
        let mut sock = match TftpSocket::bind_ephemeral() {
            Ok(s) => s,
            Err(e) => {
                log::error!("could not bind a session port: {e}");
                return;
            }
        };

        let file = match File::create(filename).await {
            Ok(f) => f,
            Err(e) => {
                log::warn!("failed to open '{filename}' for writing: {e}");
                let reject = Packet::Error {
                    code: ErrorCode::FileNotFound,
                    message: "file not found".to_string(),
                };
                if let Err(e) = sock.send(&reject, peer).await {
                    log::debug!("could not send rejection: {e}");
                }
                return;
            }
        };
        let mut receiver = Receiver::open(file);

        log::trace!("server state: ServingUpload");
        let mut session = Session::new(sock, peer, true, self.max_retries);
        if let Err(e) = session.send(&Packet::Ack { block: 0 }).await {
            log::warn!("error sending first ack: {e}");
            return;
        }
        self.finish_session(drive(&mut session, &mut receiver, stop).await, filename, &receiver);
    }

    fn finish_session<H: BlockHandler>(
        &self,
        result: Result<Outcome, SocketError>,
        filename: &str,
        handler: &H,
    ) {
        match result {
            Ok(Outcome::Completed) => {
                log::info!(
                    "'{filename}' transfer complete ({} bytes), waiting for next request",
                    handler.bytes_moved()
                );
            }
            Ok(Outcome::Failed) => {
                log::warn!("'{filename}' transfer failed, waiting for next request");
            }
            Ok(Outcome::Interrupted) => {}
            Err(e) => log::warn!("session transport error: {e}"),
        }
    }
}
