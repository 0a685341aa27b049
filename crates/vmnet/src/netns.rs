// Copyright (c) 2025 The vmtap Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Pod network namespace lifecycle and scoped entry.
//!
//! Namespace switching is a per-thread affair: every function here that
//! enters a namespace does so on the calling thread and restores the
//! original namespace on all exit paths. Callers are expected to run on a
//! dedicated or blocking-pool thread, never on an async worker.

use std::future::Future;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use netns_rs::NetNs;
use scopeguard::defer;

/// Directory where pod namespaces are bind-mounted.
pub const NETNS_DIR: &str = "/var/run/netns";

/// Namespace name prefix distinguishing pod namespaces owned by this service.
pub const POD_NS_PREFIX: &str = "vmtap-";

pub fn pod_netns_name(pod_id: &str) -> String {
    format!("{}{}", POD_NS_PREFIX, pod_id)
}

/// Deterministic path of a pod's namespace; the pod id is embedded in the
/// last component.
pub fn pod_netns_path(pod_id: &str) -> PathBuf {
    Path::new(NETNS_DIR).join(pod_netns_name(pod_id))
}

pub fn create_pod_netns(pod_id: &str) -> Result<NetNs> {
    NetNs::new(pod_netns_name(pod_id))
        .with_context(|| format!("create netns for pod {:?}", pod_id))
}

pub fn get_pod_netns(pod_id: &str) -> Result<NetNs> {
    NetNs::get(pod_netns_name(pod_id))
        .with_context(|| format!("open netns for pod {:?}", pod_id))
}

pub fn destroy_pod_netns(pod_id: &str) -> Result<()> {
    get_pod_netns(pod_id)?
        .remove()
        .with_context(|| format!("remove netns for pod {:?}", pod_id))
}

/// Run `f` with a netlink handle in the current namespace. Builds a
/// throwaway current-thread runtime so it can be called from blocking
/// threads.
pub fn with_netlink<T, F, Fut>(f: F) -> Result<T>
where
    F: FnOnce(rtnetlink::Handle) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
        .context("build netlink runtime")?;
    rt.block_on(async move {
        let (connection, handle, _) =
            rtnetlink::new_connection().context("new netlink connection")?;
        let conn_task = tokio::spawn(connection);
        defer!({
            conn_task.abort();
        });
        f(handle).await
    })
}

/// Enter `ns` on the current thread, run `f` with a netlink handle bound
/// inside it, and restore the original namespace even when `f` fails.
pub fn with_netlink_in<T, F, Fut>(ns: &NetNs, f: F) -> Result<T>
where
    F: FnOnce(rtnetlink::Handle) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    run_in_netns(ns, || with_netlink(f))
}

/// Enter `ns` on the current thread and run a synchronous closure inside it.
pub fn run_in_netns<T, F>(ns: &NetNs, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    let mut f = Some(f);
    ns.run(move |_| match f.take() {
        Some(f) => f(),
        None => Err(anyhow::anyhow!("netns scope invoked twice")),
    })
    .with_context(|| format!("enter netns {:?}", ns.path()))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_netns_path() {
        assert_eq!(pod_netns_name("f7a3"), "vmtap-f7a3");
        assert_eq!(
            pod_netns_path("f7a3"),
            Path::new("/var/run/netns/vmtap-f7a3")
        );
    }
}
