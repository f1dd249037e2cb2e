//! Client session state machine.
//!
//! A client drives exactly one transfer and then the process ends. Both
//! operations follow the same shape: bind an ephemeral socket, send the
//! request to the server's well-known port, then hand the session to the
//! shared dispatch loop. The first reply fixes the session TID; everything
//! after that, including retransmissions, targets the learned port.
//!
//! States per the protocol machine: `GettingFile` (download, driven by a
//! [`Receiver`]) and `PuttingFile` (upload, driven by a [`Sender`]).
//! Completion and failure are terminal actions, not states.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::AtomicBool;

use anyhow::Context;
use tokio::fs::File;

use crate::config::{ClientConfig, Operation};
use crate::session::{drive, Outcome, Session};
use crate::socket::TftpSocket;
use crate::transfer::{Receiver, Sender};
use crate::wire::{ErrorCode, Packet, MODE_OCTET};

/// Runs one transfer to completion, using the configured filename both as
/// the name requested from the server and as the local path.
pub async fn run(cfg: &ClientConfig, stop: &AtomicBool) -> anyhow::Result<()> {
    match cfg.operation {
        Operation::GetFile => get_file(cfg, &cfg.filename, Path::new(&cfg.filename), stop).await,
        Operation::PutFile => put_file(cfg, Path::new(&cfg.filename), &cfg.filename, stop).await,
    }
}

fn new_session(cfg: &ClientConfig) -> anyhow::Result<Session> {
    let sock = TftpSocket::bind_ephemeral().context("could not bind a local port")?;
    let server = SocketAddr::from((cfg.remote, cfg.port));
    // The peer is not locked yet: the server's first reply carries the TID.
    Ok(Session::new(sock, server, false, cfg.max_retries))
}

/// Downloads `remote_name` from the server into `local_path`.
pub async fn get_file(
    cfg: &ClientConfig,
    remote_name: &str,
    local_path: &Path,
    stop: &AtomicBool,
) -> anyhow::Result<()> {
    log::info!("starting file download: remote {}:{}, file '{remote_name}'", cfg.remote, cfg.port);

    let mut session = new_session(cfg)?;
    let mut receiver = Receiver::pending(local_path);

    log::trace!("client state: GettingFile");
    session
        .send(&Packet::ReadReq { filename: remote_name.to_string(), mode: MODE_OCTET.to_string() })
        .await?;

    match drive(&mut session, &mut receiver, stop).await? {
        Outcome::Completed => {
            log::info!("'{}' successfully downloaded", local_path.display());
            Ok(())
        }
        Outcome::Failed => anyhow::bail!("download of '{remote_name}' failed"),
        Outcome::Interrupted => Ok(()),
    }
}

/// Uploads `local_path` to the server under `remote_name`.
pub async fn put_file(
    cfg: &ClientConfig,
    local_path: &Path,
    remote_name: &str,
    stop: &AtomicBool,
) -> anyhow::Result<()> {
    log::info!("starting file upload: remote {}:{}, file '{remote_name}'", cfg.remote, cfg.port);

    let mut session = new_session(cfg)?;

    // The source file must open before anything goes on the wire. On failure
    // the server gets a courtesy ERROR so it is not left waiting for a WRQ
    // that never comes. (It never does, but the original client did this.)
    let file = match File::open(local_path).await {
        Ok(f) => f,
        Err(e) => {
            let notice = Packet::Error {
                code: ErrorCode::FileNotFound,
                message: "failed to open file for reading".to_string(),
            };
            let _ = session.send(&notice).await;
            return Err(e).context(format!("could not open '{}'", local_path.display()));
        }
    };
    let mut sender = Sender::new(file);

    log::trace!("client state: PuttingFile");
    session
        .send(&Packet::WriteReq { filename: remote_name.to_string(), mode: MODE_OCTET.to_string() })
        .await?;

    match drive(&mut session, &mut sender, stop).await? {
        Outcome::Completed => {
            log::info!("'{remote_name}' successfully uploaded");
            Ok(())
        }
        Outcome::Failed => anyhow::bail!("upload of '{remote_name}' failed"),
        Outcome::Interrupted => Ok(()),
    }
}
