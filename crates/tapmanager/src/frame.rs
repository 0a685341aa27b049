// Copyright (c) 2025 The vmtap Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Wire framing for the FD brokerage protocol.
//!
//! Every message is a fixed 77-byte big-endian header, optionally followed
//! by a payload and, on responses that lend a descriptor, ancillary socket
//! rights. The key is ASCII, left-justified and space-padded to 64 bytes.

pub const FD_MAGIC: u32 = 0x4242_4242;

pub const FD_ADD: u8 = 0x00;
pub const FD_RELEASE: u8 = 0x01;
pub const FD_GET: u8 = 0x02;
pub const FD_RESPONSE: u8 = 0x80;
pub const FD_ADD_RESPONSE: u8 = FD_ADD | FD_RESPONSE;
pub const FD_RELEASE_RESPONSE: u8 = FD_RELEASE | FD_RESPONSE;
pub const FD_GET_RESPONSE: u8 = FD_GET | FD_RESPONSE;
pub const FD_ERROR: u8 = 0xff;

pub const KEY_LEN: usize = 64;
pub const HEADER_LEN: usize = 4 + 1 + 4 + 4 + KEY_LEN;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("bad magic")]
    BadMagic,

    #[error("fd key too long: {0} bytes")]
    KeyTooLong(usize),

    #[error("truncated header: {0} bytes")]
    TruncatedHeader(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub command: u8,
    pub data_size: u32,
    pub oob_size: u32,
    key: [u8; KEY_LEN],
}

fn encode_key(key: &str) -> Result<[u8; KEY_LEN], FrameError> {
    let bytes = key.as_bytes();
    if bytes.len() > KEY_LEN {
        return Err(FrameError::KeyTooLong(bytes.len()));
    }
    let mut out = [0x20u8; KEY_LEN];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

impl FrameHeader {
    pub fn new(command: u8, key: &str, data_size: u32, oob_size: u32) -> Result<Self, FrameError> {
        Ok(FrameHeader {
            command,
            data_size,
            oob_size,
            key: encode_key(key)?,
        })
    }

    /// Build a response header echoing an already-encoded request key.
    pub fn with_raw_key(command: u8, key: [u8; KEY_LEN], data_size: u32, oob_size: u32) -> Self {
        FrameHeader {
            command,
            data_size,
            oob_size,
            key,
        }
    }

    pub fn key(&self) -> String {
        String::from_utf8_lossy(&self.key)
            .trim_end()
            .to_string()
    }

    pub fn raw_key(&self) -> [u8; KEY_LEN] {
        self.key
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&FD_MAGIC.to_be_bytes());
        buf[4] = self.command;
        buf[5..9].copy_from_slice(&self.data_size.to_be_bytes());
        buf[9..13].copy_from_slice(&self.oob_size.to_be_bytes());
        buf[13..].copy_from_slice(&self.key);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < HEADER_LEN {
            return Err(FrameError::TruncatedHeader(buf.len()));
        }
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != FD_MAGIC {
            return Err(FrameError::BadMagic);
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&buf[13..HEADER_LEN]);
        Ok(FrameHeader {
            command: buf[4],
            data_size: u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]),
            oob_size: u32::from_be_bytes([buf[9], buf[10], buf[11], buf[12]]),
            key,
        })
    }
}
