// Copyright (c) 2025 The vmtap Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::path::Path;

use anyhow::Result;

use crate::types::NetworkResult;

/// Attaches pod sandboxes to the container network and detaches them again.
///
/// Implementations typically execute CNI plugin binaries; the tap manager
/// only relies on the [`NetworkResult`] contract. Both calls block and are
/// always made from a blocking context.
pub trait Provisioner: Send + Sync {
    /// Attach the pod's namespace (already created at `netns_path`) to the
    /// network and report the resulting configuration.
    fn add_sandbox(
        &self,
        pod_id: &str,
        pod_name: &str,
        pod_ns: &str,
        netns_path: &Path,
    ) -> Result<NetworkResult>;

    /// Detach the pod from the network. Called with the same identifiers as
    /// the matching `add_sandbox`, after the namespace has been rewired back
    /// to the state this provisioner left it in.
    fn remove_sandbox(&self, pod_id: &str, pod_name: &str, pod_ns: &str) -> Result<()>;
}
