//! End-to-end transfers between a real client and a real server over
//! loopback UDP, exercising TID learning, block sequencing and teardown.

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempdir::TempDir;

use minitftp::client;
use minitftp::config::{ClientConfig, Operation, ServerConfig};
use minitftp::server::Server;
use minitftp::socket::TftpSocket;
use minitftp::wire::{ErrorCode, Packet, MODE_OCTET};

struct TestServer {
    port: u16,
    stop: Arc<AtomicBool>,
    handle: tokio::task::JoinHandle<anyhow::Result<()>>,
}

fn start_server() -> TestServer {
    let cfg = ServerConfig { port: 0, max_retries: 3 };
    let mut server = Server::bind(&cfg).unwrap();
    let port = server.local_addr().unwrap().port();
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();
    let handle = tokio::spawn(async move { server.serve(&stop_flag).await });
    TestServer { port, stop, handle }
}

impl TestServer {
    async fn shut_down(self) {
        self.stop.store(true, Ordering::Relaxed);
        tokio::time::timeout(Duration::from_secs(2), self.handle)
            .await
            .expect("server did not observe the stop flag")
            .unwrap()
            .unwrap();
    }
}

fn client_config(port: u16, operation: Operation, filename: &Path) -> ClientConfig {
    ClientConfig {
        remote: Ipv4Addr::LOCALHOST,
        port,
        operation,
        filename: filename.to_string_lossy().into_owned(),
        max_retries: 3,
    }
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn download_reproduces_source_byte_for_byte() {
    let dir = TempDir::new("loopback").unwrap();
    let src = dir.path().join("a.bin");
    let dst = dir.path().join("a-copy.bin");
    let contents = patterned(1000);
    tokio::fs::write(&src, &contents).await.unwrap();

    let server = start_server();
    let stop = AtomicBool::new(false);
    let cfg = client_config(server.port, Operation::GetFile, &src);

    client::get_file(&cfg, &src.to_string_lossy(), &dst, &stop).await.unwrap();

    let copied = tokio::fs::read(&dst).await.unwrap();
    assert_eq!(copied.len(), 1000);
    assert_eq!(copied, contents);

    server.shut_down().await;
}

#[tokio::test]
async fn upload_of_exact_block_multiple_arrives_complete() {
    let dir = TempDir::new("loopback").unwrap();
    let src = dir.path().join("b.bin");
    let dst = dir.path().join("b-up.bin");
    let contents = patterned(512);
    tokio::fs::write(&src, &contents).await.unwrap();

    let server = start_server();
    let stop = AtomicBool::new(false);
    let cfg = client_config(server.port, Operation::PutFile, &src);

    client::put_file(&cfg, &src, &dst.to_string_lossy(), &stop).await.unwrap();

    assert_eq!(tokio::fs::read(&dst).await.unwrap(), contents);

    server.shut_down().await;
}

#[tokio::test]
async fn server_keeps_serving_after_rejecting_unwritable_path() {
    let dir = TempDir::new("loopback").unwrap();

    let server = start_server();
    let server_addr = (Ipv4Addr::LOCALHOST, server.port).into();

    // A write request for a path that cannot be opened gets an ERROR back.
    let mut probe = TftpSocket::bind((Ipv4Addr::LOCALHOST, 0).into()).unwrap();
    let wrq = Packet::WriteReq {
        filename: "/no/such/dir/out.bin".to_string(),
        mode: MODE_OCTET.to_string(),
    };
    probe.send(&wrq, server_addr).await.unwrap();

    let (reply, _) = probe.recv_with_timeout(Duration::from_secs(2)).await.unwrap();
    match reply {
        Packet::Error { code: ErrorCode::FileNotFound, .. } => {}
        other => panic!("expected error reply, got {other:?}"),
    }

    // The rejection left the server in its waiting state: a normal transfer
    // still succeeds afterwards.
    let src = dir.path().join("c.bin");
    let dst = dir.path().join("c-copy.bin");
    tokio::fs::write(&src, patterned(100)).await.unwrap();

    let stop = AtomicBool::new(false);
    let cfg = client_config(server.port, Operation::GetFile, &src);
    client::get_file(&cfg, &src.to_string_lossy(), &dst, &stop).await.unwrap();
    assert_eq!(tokio::fs::read(&dst).await.unwrap(), patterned(100));

    server.shut_down().await;
}

#[tokio::test]
async fn server_serves_multiple_transfers_in_sequence() {
    let dir = TempDir::new("loopback").unwrap();
    let server = start_server();
    let stop = AtomicBool::new(false);

    for (name, len) in [("one.bin", 7usize), ("two.bin", 512), ("three.bin", 1300)] {
        let src = dir.path().join(name);
        let dst = dir.path().join(format!("{name}.copy"));
        let contents = patterned(len);
        tokio::fs::write(&src, &contents).await.unwrap();

        let cfg = client_config(server.port, Operation::GetFile, &src);
        client::get_file(&cfg, &src.to_string_lossy(), &dst, &stop).await.unwrap();
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), contents);
    }

    server.shut_down().await;
}

#[tokio::test]
async fn download_from_missing_file_fails_without_creating_one() {
    let dir = TempDir::new("loopback").unwrap();
    let src = dir.path().join("missing.bin");
    let dst = dir.path().join("missing-copy.bin");

    let server = start_server();
    let stop = AtomicBool::new(false);
    let cfg = client_config(server.port, Operation::GetFile, &src);

    let result = client::get_file(&cfg, &src.to_string_lossy(), &dst, &stop).await;
    assert!(result.is_err());
    assert!(!dst.exists());

    server.shut_down().await;
}

#[tokio::test]
async fn server_replies_from_a_fresh_port_not_the_listening_one() {
    let dir = TempDir::new("loopback").unwrap();
    let src = dir.path().join("tid.bin");
    let contents = patterned(700);
    tokio::fs::write(&src, &contents).await.unwrap();

    let server = start_server();
    let server_addr = (Ipv4Addr::LOCALHOST, server.port).into();

    let mut probe = TftpSocket::bind((Ipv4Addr::LOCALHOST, 0).into()).unwrap();
    let rrq = Packet::ReadReq {
        filename: src.to_string_lossy().into_owned(),
        mode: MODE_OCTET.to_string(),
    };
    probe.send(&rrq, server_addr).await.unwrap();

    // The first DATA fixes the session TID: it must come from a port the
    // server bound for this transfer, never from the well-known port.
    let (first, tid_addr) = probe.recv_with_timeout(Duration::from_secs(2)).await.unwrap();
    assert_ne!(tid_addr.port(), server.port);
    let mut collected = match first {
        Packet::Data { block: 1, payload } => {
            assert_eq!(payload.len(), 512);
            payload
        }
        other => panic!("expected first data block, got {other:?}"),
    };
    probe.send(&Packet::Ack { block: 1 }, tid_addr).await.unwrap();

    // The rest of the session stays on the same TID pair to completion.
    let (second, src_addr) = probe.recv_with_timeout(Duration::from_secs(2)).await.unwrap();
    assert_eq!(src_addr, tid_addr);
    match second {
        Packet::Data { block: 2, payload } => collected.extend_from_slice(&payload),
        other => panic!("expected second data block, got {other:?}"),
    }
    probe.send(&Packet::Ack { block: 2 }, tid_addr).await.unwrap();

    assert_eq!(collected, contents);

    server.shut_down().await;
}

#[tokio::test]
async fn silent_server_exhausts_retries_with_single_error_packet() {
    let dir = TempDir::new("loopback").unwrap();
    let dst = dir.path().join("never.bin");

    // A bound socket that never answers stands in for a dead server.
    let mut silent = TftpSocket::bind((Ipv4Addr::LOCALHOST, 0).into()).unwrap();
    let silent_port = silent.local_addr().unwrap().port();

    let stop = AtomicBool::new(false);
    let mut cfg = client_config(silent_port, Operation::GetFile, &dst);
    cfg.max_retries = 1;

    let result = client::get_file(&cfg, "never.bin", &dst, &stop).await;
    assert!(result.is_err());

    // The dead server saw the request and then exactly one courtesy ERROR.
    let (first, _) = silent.recv_with_timeout(Duration::from_secs(1)).await.unwrap();
    assert!(matches!(first, Packet::ReadReq { .. }));
    let (second, _) = silent.recv_with_timeout(Duration::from_secs(1)).await.unwrap();
    assert!(matches!(second, Packet::Error { .. }));
    assert!(silent.recv_with_timeout(Duration::from_millis(100)).await.is_err());
}

#[tokio::test]
async fn silent_server_fails_an_upload_the_same_way() {
    let dir = TempDir::new("loopback").unwrap();
    let src = dir.path().join("up.bin");
    tokio::fs::write(&src, patterned(64)).await.unwrap();

    let mut silent = TftpSocket::bind((Ipv4Addr::LOCALHOST, 0).into()).unwrap();
    let silent_port = silent.local_addr().unwrap().port();

    let stop = AtomicBool::new(false);
    let mut cfg = client_config(silent_port, Operation::PutFile, &src);
    cfg.max_retries = 1;

    let result = client::put_file(&cfg, &src, "up.bin", &stop).await;
    assert!(result.is_err());

    // The write request went out, then exactly one courtesy ERROR.
    let (first, _) = silent.recv_with_timeout(Duration::from_secs(1)).await.unwrap();
    assert!(matches!(first, Packet::WriteReq { .. }));
    let (second, _) = silent.recv_with_timeout(Duration::from_secs(1)).await.unwrap();
    assert!(matches!(second, Packet::Error { .. }));
    assert!(silent.recv_with_timeout(Duration::from_millis(100)).await.is_err());
}
