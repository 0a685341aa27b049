// Copyright (c) 2025 The vmtap Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::ffi::CStr;
use std::fs::File;
use std::io::Error as IoError;
use std::os::raw::{c_char, c_int, c_short, c_uint};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

use libc::ifreq;
use vmm_sys_util::ioctl::ioctl_with_mut_ref;
use vmm_sys_util::{ioctl_ioc_nr, ioctl_iow_nr};

// As defined in the Linux UAPI:
// https://elixir.bootlin.com/linux/v4.17/source/include/uapi/linux/if.h#L33
pub(crate) const IFACE_NAME_MAX_LEN: usize = 16;

/// List of errors the tap implementation can throw.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unable to create tap interface.
    #[error("cannot create tap device. {0}")]
    CreateTap(IoError),

    /// Invalid interface name.
    #[error("invalid network interface name")]
    InvalidIfname,

    /// Couldn't open /dev/net/tun.
    #[error("cannot open tap device. {0}")]
    OpenTun(#[source] IoError),
}

pub type Result<T> = std::result::Result<T, Error>;

const TUNTAP: c_uint = 84;
ioctl_iow_nr!(TUNSETIFF, TUNTAP, 202, c_int);

/// Handle for a tap interface.
///
/// Wraps the file descriptor backing the device. The interface stays up for
/// as long as the descriptor (or any kernel duplicate of it) is open; when
/// the last copy goes away the kernel removes the link automatically.
#[derive(Debug)]
pub struct Tap {
    /// tap device file handle
    pub tap_file: File,
    if_name: [c_char; IFACE_NAME_MAX_LEN],
}

// Returns an array representing the contents of a null-terminated C string
// containing if_name.
fn build_terminated_if_name(if_name: &str) -> Result<[c_char; IFACE_NAME_MAX_LEN]> {
    let if_name_bytes = if_name.as_bytes();

    if if_name_bytes.len() >= IFACE_NAME_MAX_LEN {
        return Err(Error::InvalidIfname);
    }

    let mut terminated_if_name = [0 as c_char; IFACE_NAME_MAX_LEN];
    for (i, &byte) in if_name_bytes.iter().enumerate() {
        terminated_if_name[i] = byte as c_char;
    }

    // 0 is the null terminator for c_char type
    terminated_if_name[if_name_bytes.len()] = 0 as c_char;

    Ok(terminated_if_name)
}

impl Tap {
    /// Create a tap device given the interface name.
    pub fn open_named(if_name: &str) -> Result<Tap> {
        let terminated_if_name = build_terminated_if_name(if_name)?;

        let mut ifr = ifreq {
            ifr_name: terminated_if_name,
            ifr_ifru: libc::__c_anonymous_ifr_ifru {
                ifru_flags: (libc::IFF_TAP | libc::IFF_NO_PI) as c_short,
            },
        };

        let fd = unsafe {
            let dev_net_tun = CStr::from_bytes_with_nul(b"/dev/net/tun\0").unwrap_or_else(|_| {
                unreachable!("The string is guaranteed to be null-terminated and valid.")
            });

            // Open calls are safe because we use a CStr, which guarantees a
            // constant null-terminated string.
            libc::open(
                dev_net_tun.as_ptr(),
                libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(Error::OpenTun(IoError::last_os_error()));
        }

        // We just checked that the fd is valid.
        let tuntap = unsafe { File::from_raw_fd(fd) };

        // ioctl is safe since we call it with a valid tap fd and check the
        // return value.
        let ret = unsafe { ioctl_with_mut_ref(&tuntap, TUNSETIFF(), &mut ifr) };
        if ret < 0 {
            return Err(Error::CreateTap(IoError::last_os_error()));
        }

        Ok(Tap {
            tap_file: tuntap,
            if_name: ifr.ifr_name,
        })
    }

    /// Interface name the kernel actually assigned.
    pub fn name(&self) -> String {
        let bytes: Vec<u8> = self
            .if_name
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl AsRawFd for Tap {
    fn as_raw_fd(&self) -> RawFd {
        self.tap_file.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_terminated_if_name() {
        let name = build_terminated_if_name("vtap0").unwrap();
        assert_eq!(name[5], 0);

        // IFNAMSIZ leaves room for the terminator
        assert!(build_terminated_if_name("0123456789abcdef").is_err());
        assert!(build_terminated_if_name("0123456789abcde").is_ok());
    }
}
