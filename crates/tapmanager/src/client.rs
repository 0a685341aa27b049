// Copyright (c) 2025 The vmtap Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Blocking client for the FD brokerage protocol.
//!
//! Used by VM launchers to fetch a pod's tap descriptor and by the pod
//! controller to register and release pod networks. Descriptors received
//! from [`FdClient::get_fd`] are kernel-side duplicates owned by the caller,
//! who must close them.

use std::io::{IoSliceMut, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};
use serde::Serialize;

use crate::frame::{FrameError, FrameHeader, FD_ADD, FD_ERROR, FD_GET, FD_RELEASE, FD_RESPONSE, HEADER_LEN};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,

    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] FrameError),

    #[error("error marshalling json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server returned error: {0}")]
    Server(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

pub struct FdClient {
    socket_path: PathBuf,
    conn: Option<UnixStream>,
}

impl FdClient {
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        FdClient {
            socket_path: socket_path.as_ref().to_owned(),
            conn: None,
        }
    }

    /// Connect to the server. A no-op when already connected.
    pub fn connect(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        self.conn = Some(UnixStream::connect(&self.socket_path)?);
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        self.conn.take();
        Ok(())
    }

    /// Register `data` under `key`, returning the server's response payload
    /// (the JSON-serialized network result).
    pub fn add_fd<T: Serialize>(&mut self, key: &str, data: &T) -> Result<Vec<u8>> {
        let bs = serde_json::to_vec(data)?;
        self.add_fd_bytes(key, &bs)
    }

    /// Like [`FdClient::add_fd`] for callers that already hold raw bytes.
    pub fn add_fd_bytes(&mut self, key: &str, data: &[u8]) -> Result<Vec<u8>> {
        let hdr = FrameHeader::new(FD_ADD, key, data.len() as u32, 0)?;
        let (resp, payload, _) = self.request(hdr, data)?;
        if resp.key() != key {
            return Err(ClientError::Protocol(
                "fd key mismatch in the server response".to_string(),
            ));
        }
        Ok(payload)
    }

    pub fn release_fd(&mut self, key: &str) -> Result<()> {
        let hdr = FrameHeader::new(FD_RELEASE, key, 0, 0)?;
        self.request(hdr, &[])?;
        Ok(())
    }

    /// Fetch the descriptor registered under `key` plus its info payload.
    /// The returned fd is a fresh duplicate; the caller owns it.
    pub fn get_fd(&mut self, key: &str) -> Result<(RawFd, Vec<u8>)> {
        let hdr = FrameHeader::new(FD_GET, key, 0, 0)?;
        let (_, payload, rights) = self.request(hdr, &[])?;
        if rights.len() != 1 {
            return Err(ClientError::Protocol(format!(
                "unexpected number of socket control messages: {} instead of 1",
                rights.len()
            )));
        }
        if rights[0].len() != 1 {
            return Err(ClientError::Protocol(format!(
                "unexpected number of file descriptors: {} instead of 1",
                rights[0].len()
            )));
        }
        Ok((rights[0][0], payload))
    }

    fn request(
        &mut self,
        hdr: FrameHeader,
        data: &[u8],
    ) -> Result<(FrameHeader, Vec<u8>, Vec<Vec<RawFd>>)> {
        let conn = self.conn.as_mut().ok_or(ClientError::NotConnected)?;

        conn.write_all(&hdr.encode())?;
        if !data.is_empty() {
            conn.write_all(data)?;
        }

        let mut hdr_buf = [0u8; HEADER_LEN];
        conn.read_exact(&mut hdr_buf)?;
        let resp = FrameHeader::decode(&hdr_buf)?;

        let mut payload = Vec::new();
        let mut rights: Vec<Vec<RawFd>> = Vec::new();
        if resp.data_size > 0 || resp.oob_size > 0 {
            let expect = resp.data_size as usize;
            // a single filler byte stands in for an empty payload
            let mut recv_buf = vec![0u8; expect.max(1)];
            let mut cmsg_buf = nix::cmsg_space!([RawFd; 2]);
            let n = {
                let mut iov = [IoSliceMut::new(&mut recv_buf)];
                let msg = recvmsg::<()>(
                    conn.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsg_buf),
                    MsgFlags::empty(),
                )
                .map_err(|e| {
                    ClientError::Connection(std::io::Error::from_raw_os_error(e as i32))
                })?;
                for cmsg in msg.cmsgs() {
                    match cmsg {
                        ControlMessageOwned::ScmRights(fds) => rights.push(fds),
                        other => {
                            return Err(ClientError::Protocol(format!(
                                "unexpected control message: {:?}",
                                other
                            )))
                        }
                    }
                }
                msg.bytes
            };
            if n != expect && (expect != 0 || n != 1) {
                return Err(ClientError::Protocol(format!(
                    "bad data size: {} instead of {}",
                    n, expect
                )));
            }
            if expect > 0 {
                payload = recv_buf;
            }
        }

        if resp.command == FD_ERROR {
            return Err(ClientError::Server(
                String::from_utf8_lossy(&payload).into_owned(),
            ));
        }
        if resp.command != hdr.command | FD_RESPONSE {
            return Err(ClientError::Protocol(format!(
                "unexpected command {:02x}",
                resp.command
            )));
        }

        Ok((resp, payload, rights))
    }
}
