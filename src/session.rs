//! Per-transfer session state and the event dispatch loop.
//!
//! A [`Session`] owns exactly one socket, the peer TID, the last-sent
//! datagram (kept for verbatim retransmission) and the two per-session
//! timers. [`drive`] merges "datagram ready" and "timer expired" into an
//! ordered event stream for a [`BlockHandler`]: within one loop iteration,
//! receive processing always runs before timeout processing, so a reply that
//! is already in flight can never race a spurious retransmission. That
//! ordering is a contract, not an accident.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::socket::{SocketError, TftpSocket};
use crate::timer::TickTimer;
use crate::transfer::{Action, BlockHandler};
use crate::wire::{ErrorCode, Packet};

/// How long to wait for the peer's reply before retransmitting.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(3);

/// Interval of the observational progress report.
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(3);

/// Bounded readiness wait per loop iteration. Short enough to keep the loop
/// responsive to timer expiry and the stop flag.
pub const POLL_INTERVAL: Duration = Duration::from_millis(15);

/// Consecutive-timeout budget before a session gives up.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Counts consecutive ack timeouts. Reset whenever the peer's reply is
/// accepted, so only a silent peer exhausts the budget.
#[derive(Debug)]
pub struct RetryPolicy {
    tries: u32,
    max: u32,
}

impl RetryPolicy {
    pub fn new(max: u32) -> RetryPolicy {
        RetryPolicy { tries: 0, max }
    }

    pub fn reset(&mut self) {
        self.tries = 0;
    }

    /// One ack timeout elapsed. Yields `Retransmit` until the budget runs
    /// out, then exactly one `Fail` carrying the courtesy ERROR packet.
    pub fn on_timeout(&mut self) -> Action {
        self.tries += 1;
        if self.tries >= self.max {
            self.tries = 0;
            Action::Fail(Packet::Error {
                code: ErrorCode::NotDefined,
                message: "timeout waiting for reply, closing session".to_string(),
            })
        } else {
            Action::Retransmit
        }
    }
}

/// How a driven session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Transfer ran to completion.
    Completed,
    /// Protocol error, resource error or exhausted retry budget.
    Failed,
    /// The process-wide stop flag was raised.
    Interrupted,
}

/// State owned by one active transfer: socket, peer TID, retransmission
/// buffer and timers. Created when a transfer starts and dropped when it
/// ends, which releases the port binding.
pub struct Session {
    sock: TftpSocket,
    peer: SocketAddr,
    /// False only on the client before the server's first reply fixes the
    /// session TID. Once true, `peer` never changes back to the well-known
    /// port and traffic from any other source is rejected.
    peer_locked: bool,
    last_sent: Vec<u8>,
    ack_timer: TickTimer,
    progress_timer: TickTimer,
    retry: RetryPolicy,
}

impl Session {
    pub fn new(sock: TftpSocket, peer: SocketAddr, peer_locked: bool, max_retries: u32) -> Session {
        Session {
            sock,
            peer,
            peer_locked,
            last_sent: Vec::new(),
            ack_timer: TickTimer::stopped(),
            progress_timer: TickTimer::stopped(),
            retry: RetryPolicy::new(max_retries),
        }
    }

    /// Sends a packet to the session peer, keeps the encoded bytes for
    /// retransmission and restarts the ack timer.
    pub async fn send(&mut self, packet: &Packet) -> Result<(), SocketError> {
        log::trace!("sending {} to {}", packet.kind(), self.peer);
        self.last_sent = self.sock.send(packet, self.peer).await?;
        self.ack_timer.start(ACK_TIMEOUT);
        Ok(())
    }

    /// Resends the last datagram byte-for-byte to the last-known peer. The
    /// peer is the learned TID once one exists, never the well-known port.
    async fn retransmit(&mut self) -> Result<(), SocketError> {
        self.sock.send_raw(&self.last_sent, self.peer).await?;
        self.ack_timer.start(ACK_TIMEOUT);
        Ok(())
    }

    /// Best-effort send that neither arms the ack timer nor disturbs the
    /// retransmission buffer. ERROR packets are a courtesy and are never
    /// retransmitted.
    async fn send_courtesy(&mut self, packet: &Packet, dst: SocketAddr) {
        if let Err(e) = self.sock.send(packet, dst).await {
            log::debug!("could not send courtesy {}: {e}", packet.kind());
        }
    }
}

/// Runs one session to its end.
///
/// Each iteration: observe the stop flag, wait (bounded) for one datagram
/// and feed it to the handler, then and only then check the ack timer and
/// the progress timer. Undecodable datagrams are dropped without affecting
/// the session; datagrams from a source other than the locked TID get a
/// courtesy ERROR and are otherwise ignored.
pub async fn drive<H: BlockHandler>(
    session: &mut Session,
    handler: &mut H,
    stop: &AtomicBool,
) -> Result<Outcome, SocketError> {
    session.progress_timer.start(PROGRESS_INTERVAL);

    loop {
        if stop.load(Ordering::Relaxed) {
            log::info!("stop requested, closing session");
            return Ok(Outcome::Interrupted);
        }

        match session.sock.recv_with_timeout(POLL_INTERVAL).await {
            Ok((packet, src)) => {
                if session.peer_locked && src != session.peer {
                    log::warn!("datagram from unexpected source {src}, session peer is {}", session.peer);
                    let reject = Packet::Error {
                        code: ErrorCode::UnknownTid,
                        message: "unknown transfer id".to_string(),
                    };
                    session.send_courtesy(&reject, src).await;
                    continue;
                }
                if !session.peer_locked {
                    log::debug!("session TID fixed to {src}");
                    session.peer = src;
                    session.peer_locked = true;
                }

                log::trace!("{}: PDU_RECEIVED {}", handler.label(), packet.kind());
                match handler.handle(&packet).await {
                    Action::Reply(p) => {
                        session.retry.reset();
                        session.send(&p).await?;
                    }
                    Action::FinishWith(p) => {
                        session.send(&p).await?;
                        return Ok(Outcome::Completed);
                    }
                    Action::Finish => return Ok(Outcome::Completed),
                    Action::Ignore => {}
                    Action::Retransmit => session.retransmit().await?,
                    Action::Fail(p) => {
                        let dst = session.peer;
                        session.send_courtesy(&p, dst).await;
                        return Ok(Outcome::Failed);
                    }
                    Action::Abort(reason) => {
                        log::warn!("{reason}");
                        return Ok(Outcome::Failed);
                    }
                }
            }
            Err(SocketError::Timeout(_)) => {}
            Err(SocketError::Malformed(e)) => {
                log::debug!("dropping undecodable datagram: {e}");
            }
            Err(e) => return Err(e),
        }

        if session.ack_timer.expired() {
            log::trace!("{}: TIMEOUT", handler.label());
            match session.retry.on_timeout() {
                Action::Retransmit => {
                    log::info!("timed out, retransmitting last packet to {}", session.peer);
                    session.retransmit().await?;
                }
                Action::Fail(p) => {
                    log::warn!("reached max number of timeouts, closing session");
                    let dst = session.peer;
                    session.send_courtesy(&p, dst).await;
                    return Ok(Outcome::Failed);
                }
                _ => {}
            }
        }

        if session.progress_timer.expired() {
            log::info!("{}: {} bytes transferred", handler.label(), handler.bytes_moved());
            session.progress_timer.start(PROGRESS_INTERVAL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_budget_emits_exactly_one_error() {
        let mut retry = RetryPolicy::new(3);
        assert_eq!(retry.on_timeout(), Action::Retransmit);
        assert_eq!(retry.on_timeout(), Action::Retransmit);
        match retry.on_timeout() {
            Action::Fail(Packet::Error { code: ErrorCode::NotDefined, .. }) => {}
            other => panic!("expected failure after third timeout, got {other:?}"),
        }
    }

    #[test]
    fn accepted_reply_resets_the_budget() {
        let mut retry = RetryPolicy::new(3);
        assert_eq!(retry.on_timeout(), Action::Retransmit);
        assert_eq!(retry.on_timeout(), Action::Retransmit);
        retry.reset();
        assert_eq!(retry.on_timeout(), Action::Retransmit);
        assert_eq!(retry.on_timeout(), Action::Retransmit);
        assert!(matches!(retry.on_timeout(), Action::Fail(_)));
    }

    #[test]
    fn budget_of_one_fails_immediately() {
        let mut retry = RetryPolicy::new(1);
        assert!(matches!(retry.on_timeout(), Action::Fail(_)));
    }
}
