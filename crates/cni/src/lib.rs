// Copyright (c) 2025 The vmtap Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Container-network provisioner interface.
//!
//! A provisioner attaches a pod network namespace to the container network
//! and reports back a [`NetworkResult`]: the interfaces it configured, their
//! addresses, routes and DNS. The tap manager consumes only this result
//! document; how the provisioner obtains it (usually by executing CNI plugin
//! binaries) is not its concern.

mod provisioner;
mod types;

pub use provisioner::Provisioner;
pub use types::{Dns, Interface, IpConfig, NetworkResult, Route, SANDBOX_PLACEHOLDER};
