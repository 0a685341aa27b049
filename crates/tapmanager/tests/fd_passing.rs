// Copyright (c) 2025 The vmtap Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Protocol-level tests of the FD server and client, driven through a fake
//! source so no namespaces or privileges are needed.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use tapmanager::frame::{FrameHeader, FD_ADD, HEADER_LEN};
use tapmanager::{ClientError, FdClient, FdServer, FdSource};

/// Hands out descriptors of anonymous temp files and echoes the ADD payload
/// back as the response, so tests can check payload round-trips.
struct FakeSource {
    files: Mutex<HashMap<String, File>>,
    add_delay: Duration,
}

impl FakeSource {
    fn new() -> Self {
        FakeSource {
            files: Mutex::new(HashMap::new()),
            add_delay: Duration::ZERO,
        }
    }

    fn with_add_delay(delay: Duration) -> Self {
        FakeSource {
            files: Mutex::new(HashMap::new()),
            add_delay: delay,
        }
    }

    fn inode_of(&self, key: &str) -> u64 {
        let files = self.files.lock().unwrap();
        let file = files.get(key).expect("no file for key");
        nix::sys::stat::fstat(file.as_raw_fd()).unwrap().st_ino
    }
}

#[async_trait]
impl FdSource for FakeSource {
    async fn add(&self, key: &str, data: &[u8]) -> Result<(RawFd, Vec<u8>)> {
        if !self.add_delay.is_zero() {
            tokio::time::sleep(self.add_delay).await;
        }
        let file = tempfile::tempfile()?;
        let fd = file.as_raw_fd();
        self.files.lock().unwrap().insert(key.to_string(), file);
        Ok((fd, data.to_vec()))
    }

    async fn release(&self, key: &str) -> Result<()> {
        self.files
            .lock()
            .unwrap()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| anyhow!("bad fd key: {:?}", key))
    }

    async fn info(&self, key: &str) -> Result<Vec<u8>> {
        if self.files.lock().unwrap().contains_key(key) {
            Ok(b"fake-info".to_vec())
        } else {
            Err(anyhow!("bad fd key: {:?}", key))
        }
    }
}

async fn start_server(source: Arc<FakeSource>) -> (FdServer, tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("tapmanager.sock");
    let server = FdServer::new(&socket_path, source);
    server.serve().await.unwrap();
    (server, dir, socket_path)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_add_get_release_round_trip() {
    let source = Arc::new(FakeSource::new());
    let (server, _dir, socket_path) = start_server(source.clone()).await;

    let mut client = FdClient::new(&socket_path);
    client.connect().unwrap();

    let payload = serde_json::json!({"podId": "p1", "podNs": "default", "podName": "vm-1"});
    let response = client.add_fd("p1", &payload).unwrap();
    assert_eq!(
        serde_json::from_slice::<serde_json::Value>(&response).unwrap(),
        payload
    );

    let (fd, info) = client.get_fd("p1").unwrap();
    assert_eq!(info, b"fake-info");
    // the lent descriptor points at the same open-file description
    let stat = nix::sys::stat::fstat(fd).unwrap();
    assert_eq!(stat.st_ino, source.inode_of("p1"));
    nix::unistd::close(fd).unwrap();

    client.release_fd("p1").unwrap();
    match client.get_fd("p1") {
        Err(ClientError::Server(msg)) => assert!(msg.contains("bad fd key"), "got: {}", msg),
        other => panic!("expected server error, got {:?}", other.map(|_| ())),
    }

    client.close().unwrap();
    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_duplicate_add_is_rejected() {
    let source = Arc::new(FakeSource::new());
    let (server, _dir, socket_path) = start_server(source).await;

    let mut client = FdClient::new(&socket_path);
    client.connect().unwrap();

    client.add_fd_bytes("p1", b"{}").unwrap();
    match client.add_fd_bytes("p1", b"{}") {
        Err(ClientError::Server(msg)) => {
            assert!(msg.contains("fd key already exists"), "got: {}", msg)
        }
        other => panic!("expected server error, got {:?}", other.map(|_| ())),
    }

    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_release_unknown_key_keeps_connection_usable() {
    let source = Arc::new(FakeSource::new());
    let (server, _dir, socket_path) = start_server(source).await;

    let mut client = FdClient::new(&socket_path);
    client.connect().unwrap();

    match client.release_fd("ghost") {
        Err(ClientError::Server(msg)) => assert!(msg.contains("bad fd key"), "got: {}", msg),
        other => panic!("expected server error, got {:?}", other),
    }

    // the error must not poison the connection
    client.add_fd_bytes("p1", b"{}").unwrap();
    client.release_fd("p1").unwrap();

    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bad_magic_closes_connection() {
    let source = Arc::new(FakeSource::new());
    let (server, _dir, socket_path) = start_server(source).await;

    let mut conn = UnixStream::connect(&socket_path).unwrap();
    let mut bad = FrameHeader::new(FD_ADD, "p1", 0, 0).unwrap().encode();
    bad[0..4].copy_from_slice(&0u32.to_be_bytes());
    conn.write_all(&bad).unwrap();

    // server drops the connection without answering
    let mut buf = [0u8; HEADER_LEN];
    let n = conn.read(&mut buf).unwrap();
    assert_eq!(n, 0);

    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_get_fds_share_open_file_description() {
    let source = Arc::new(FakeSource::new());
    let (server, _dir, socket_path) = start_server(source).await;

    let mut client = FdClient::new(&socket_path);
    client.connect().unwrap();
    client.add_fd_bytes("p1", b"{}").unwrap();

    let (fd1, _) = client.get_fd("p1").unwrap();
    let (fd2, _) = client.get_fd("p1").unwrap();
    assert_ne!(fd1, fd2);

    let stat1 = nix::sys::stat::fstat(fd1).unwrap();
    let stat2 = nix::sys::stat::fstat(fd2).unwrap();
    assert_eq!(stat1.st_ino, stat2.st_ino);
    assert_eq!(stat1.st_dev, stat2.st_dev);

    nix::unistd::close(fd1).unwrap();
    nix::unistd::close(fd2).unwrap();
    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_adds_one_winner() {
    let source = Arc::new(FakeSource::with_add_delay(Duration::from_millis(100)));
    let (server, _dir, socket_path) = start_server(source).await;

    let mut workers = Vec::new();
    for _ in 0..2 {
        let socket_path = socket_path.clone();
        workers.push(std::thread::spawn(move || {
            let mut client = FdClient::new(&socket_path);
            client.connect().unwrap();
            client.add_fd_bytes("p1", b"{}").map(|_| ())
        }));
    }

    let outcomes: Vec<_> = workers
        .into_iter()
        .map(|w| w.join().unwrap())
        .collect();
    let wins = outcomes.iter().filter(|r| r.is_ok()).count();
    assert_eq!(wins, 1, "outcomes: {:?}", outcomes);
    match outcomes.iter().find(|r| r.is_err()).unwrap() {
        Err(ClientError::Server(msg)) => {
            assert!(msg.contains("fd key already exists"), "got: {}", msg)
        }
        other => panic!("expected server error, got {:?}", other),
    }

    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_closes_listener() {
    let source = Arc::new(FakeSource::new());
    let (server, _dir, socket_path) = start_server(source).await;

    // a connection accepted before stop keeps draining
    let mut client = FdClient::new(&socket_path);
    client.connect().unwrap();
    client.add_fd_bytes("p0", b"{}").unwrap();
    server.stop();

    client.add_fd_bytes("p1", b"{}").unwrap();

    // but new connections are eventually refused
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut late = FdClient::new(&socket_path);
    assert!(late.connect().is_err());
}
