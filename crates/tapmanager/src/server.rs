// Copyright (c) 2025 The vmtap Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The FD server: accepts connections on a local stream socket, keeps the
//! key→descriptor registry, and lends descriptors to clients as out-of-band
//! socket rights.
//!
//! Sending a descriptor duplicates it in the kernel; the registry keeps its
//! own copy alive (through the source's per-pod state) until RELEASE, and
//! every client-side duplicate is independently owned.

use std::collections::{HashMap, HashSet};
use std::io::IoSlice;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
use slog::{error, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt, Interest};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;

use crate::frame::{
    FrameHeader, FD_ADD, FD_ERROR, FD_GET, FD_RELEASE, FD_RESPONSE, HEADER_LEN,
};

macro_rules! sl {
    () => {
        slog_scope::logger().new(slog::o!("subsystem" => "fdserver"))
    };
}

const MIN_ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(5);
const MAX_ACCEPT_ERROR_DELAY: Duration = Duration::from_secs(1);
const MAX_PAYLOAD: u32 = 1 << 20;

/// Where the server gets its descriptors from. `release` is not driven by
/// the connection that sends RELEASE: full teardown belongs to the pod
/// controller, which owns the source.
#[async_trait]
pub trait FdSource: Send + Sync + 'static {
    /// Produce a descriptor and a response payload for `key`.
    async fn add(&self, key: &str, data: &[u8]) -> Result<(RawFd, Vec<u8>)>;

    /// Tear down everything `add` built for `key`.
    async fn release(&self, key: &str) -> Result<()>;

    /// Per-key info served to GET clients.
    async fn info(&self, key: &str) -> Result<Vec<u8>>;
}

#[derive(Default)]
struct Registry {
    fds: HashMap<String, RawFd>,
    // Keys whose ADD is still running in the source. Reserving the key up
    // front makes a concurrent ADD fail instead of racing the slow path.
    pending: HashSet<String>,
}

pub struct FdServer {
    socket_path: PathBuf,
    source: Arc<dyn FdSource>,
    registry: Arc<Mutex<Registry>>,
    stop_tx: Mutex<Option<broadcast::Sender<()>>>,
}

impl FdServer {
    pub fn new<P: AsRef<Path>>(socket_path: P, source: Arc<dyn FdSource>) -> Self {
        FdServer {
            socket_path: socket_path.as_ref().to_owned(),
            source,
            registry: Arc::new(Mutex::new(Registry::default())),
            stop_tx: Mutex::new(None),
        }
    }

    /// Bind the socket and spawn the accept loop. Returns once the socket is
    /// ready for connections.
    pub async fn serve(&self) -> Result<()> {
        let mut stop_guard = self.stop_tx.lock().unwrap();
        if stop_guard.is_some() {
            bail!("already listening");
        }
        if self.socket_path.exists() {
            // stale socket from a previous run
            let _ = std::fs::remove_file(&self.socket_path);
        }
        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("listen on socket {:?}", self.socket_path))?;
        let (stop_tx, stop_rx) = broadcast::channel(1);
        *stop_guard = Some(stop_tx);
        drop(stop_guard);

        tokio::spawn(accept_loop(
            listener,
            stop_rx,
            self.source.clone(),
            self.registry.clone(),
            self.socket_path.clone(),
        ));
        Ok(())
    }

    /// Close the listener. In-flight connection handlers drain on their own.
    pub fn stop(&self) {
        if let Some(stop_tx) = self.stop_tx.lock().unwrap().take() {
            let _ = stop_tx.send(());
        }
    }
}

fn is_transient_accept_error(e: &std::io::Error) -> bool {
    if matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
    ) {
        return true;
    }
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
    )
}

async fn accept_loop(
    listener: UnixListener,
    mut stop_rx: broadcast::Receiver<()>,
    source: Arc<dyn FdSource>,
    registry: Arc<Mutex<Registry>>,
    socket_path: PathBuf,
) {
    let mut delay = Duration::ZERO;
    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    delay = Duration::ZERO;
                    let source = source.clone();
                    let registry = registry.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_conn(stream, source, registry).await {
                            error!(sl!(), "connection handler: {:#}", e);
                        }
                    });
                }
                Err(e) if is_transient_accept_error(&e) => {
                    warn!(sl!(), "accept error: {:?}", e);
                    delay = if delay.is_zero() {
                        MIN_ACCEPT_ERROR_DELAY
                    } else {
                        (delay * 2).min(MAX_ACCEPT_ERROR_DELAY)
                    };
                    tokio::select! {
                        _ = stop_rx.recv() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    error!(sl!(), "accept failed: {:?}", e);
                    break;
                }
            }
        }
    }
    drop(listener);
    let _ = std::fs::remove_file(&socket_path);
}

async fn serve_conn(
    mut stream: UnixStream,
    source: Arc<dyn FdSource>,
    registry: Arc<Mutex<Registry>>,
) -> Result<()> {
    let mut hdr_buf = [0u8; HEADER_LEN];
    loop {
        match stream.read_exact(&mut hdr_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e).context("read request header"),
        }
        let hdr = FrameHeader::decode(&hdr_buf).context("decode request header")?;
        if hdr.data_size > MAX_PAYLOAD {
            bail!("oversized request payload: {} bytes", hdr.data_size);
        }
        let mut data = vec![0u8; hdr.data_size as usize];
        if !data.is_empty() {
            stream
                .read_exact(&mut data)
                .await
                .context("read request payload")?;
        }

        let (resp, payload, fd) = match dispatch(&hdr, &data, &source, &registry).await {
            Ok(reply) => reply,
            Err(e) => {
                let payload = format!("{:#}", e).into_bytes();
                let resp =
                    FrameHeader::with_raw_key(FD_ERROR, hdr.raw_key(), payload.len() as u32, 0);
                (resp, payload, None)
            }
        };

        stream
            .write_all(&resp.encode())
            .await
            .context("write response header")?;
        if resp.data_size > 0 || resp.oob_size > 0 {
            send_payload(&stream, &payload, fd)
                .await
                .context("write response payload")?;
        }
    }
}

async fn dispatch(
    hdr: &FrameHeader,
    data: &[u8],
    source: &Arc<dyn FdSource>,
    registry: &Arc<Mutex<Registry>>,
) -> Result<(FrameHeader, Vec<u8>, Option<RawFd>)> {
    let key = hdr.key();
    match hdr.command {
        FD_ADD => {
            {
                let mut reg = registry.lock().unwrap();
                if reg.fds.contains_key(&key) || !reg.pending.insert(key.clone()) {
                    bail!("fd key already exists: {:?}", key);
                }
            }
            // The source's slow work runs without the registry lock held.
            let added = source.add(&key, data).await;
            let mut reg = registry.lock().unwrap();
            reg.pending.remove(&key);
            let (fd, resp_data) = added.context("error getting fd")?;
            // Insertion happens before the response is written, so a GET
            // racing this ADD either errors or sees the descriptor.
            reg.fds.insert(key, fd);
            let resp = FrameHeader::with_raw_key(
                FD_ADD | FD_RESPONSE,
                hdr.raw_key(),
                resp_data.len() as u32,
                0,
            );
            Ok((resp, resp_data, None))
        }
        FD_RELEASE => {
            // Only the registry entry goes away here; the source's teardown
            // is driven by the pod controller that owns it.
            if registry.lock().unwrap().fds.remove(&key).is_none() {
                bail!("bad fd key: {:?}", key);
            }
            let resp = FrameHeader::with_raw_key(FD_RELEASE | FD_RESPONSE, hdr.raw_key(), 0, 0);
            Ok((resp, Vec::new(), None))
        }
        FD_GET => {
            let fd = registry
                .lock()
                .unwrap()
                .fds
                .get(&key)
                .copied()
                .ok_or_else(|| anyhow!("bad fd key: {:?}", key))?;
            let info = source.info(&key).await.context("can't get key info")?;
            let resp = FrameHeader::with_raw_key(
                FD_GET | FD_RESPONSE,
                hdr.raw_key(),
                info.len() as u32,
                unix_rights_space(),
            );
            Ok((resp, info, Some(fd)))
        }
        _ => bail!("bad command"),
    }
}

fn unix_rights_space() -> u32 {
    // SAFETY: CMSG_SPACE is a pure length computation.
    unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as libc::c_uint) }
}

/// Write one datagram carrying `data` plus, optionally, descriptor rights.
/// An empty payload is padded with a single filler byte so the ancillary
/// data still has bytes to ride on; the client discards it.
async fn send_payload(stream: &UnixStream, data: &[u8], fd: Option<RawFd>) -> Result<()> {
    let data = if data.is_empty() { &[0u8][..] } else { data };
    let mut sent = 0;
    loop {
        stream.writable().await?;
        let res = stream.try_io(Interest::WRITABLE, || {
            let iov = [IoSlice::new(&data[sent..])];
            let fds = fd.map(|fd| [fd]);
            let cmsgs: Vec<ControlMessage> = match (&fds, sent) {
                // rights ride on the first byte only
                (Some(fds), 0) => vec![ControlMessage::ScmRights(fds)],
                _ => Vec::new(),
            };
            sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
        });
        match res {
            Ok(n) => {
                sent += n;
                if sent >= data.len() {
                    return Ok(());
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e).context("sendmsg"),
        }
    }
}
