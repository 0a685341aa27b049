// Copyright (c) 2025 The vmtap Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! File-descriptor brokerage for VM pod networking.
//!
//! The [`server::FdServer`] listens on a local stream socket and brokers
//! live file descriptors between the process that creates them and the VM
//! launchers that consume them, using out-of-band socket rights. Descriptors
//! come from the [`source::TapFdSource`]: for every ADD it builds a pod
//! network namespace, has a provisioner populate it, rewires the result into
//! a tap the VM can consume (`vmnet`), and serves DHCP inside the namespace
//! so the VM learns its container-assigned addressing.

pub mod client;
pub mod dhcp;
pub mod frame;
pub mod server;
pub mod source;

pub use client::{ClientError, FdClient};
pub use dhcp::DhcpServer;
pub use server::{FdServer, FdSource};
pub use source::{PodNetworkDesc, TapFdSource};
