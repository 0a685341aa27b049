// Copyright (c) 2025 The vmtap Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The tap FD source: turns an ADD into a pod namespace wired for a VM.
//!
//! For every key the source creates a namespace, has the provisioner attach
//! it to the container network, rewires the resulting veth into a
//! tap-plus-bridge topology, and starts a DHCP responder pinned inside the
//! namespace. The tap descriptor and the serialized network result are what
//! the FD server hands back to the caller.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use netns_rs::NetNs;
use serde::{Deserialize, Serialize};
use slog::{debug, error, info, warn};

use cni::{Dns, Provisioner};
use vmnet::link::parse_mac;
use vmnet::netns;
use vmnet::rewire::ContainerSideNetwork;

use crate::dhcp::DhcpServer;
use crate::server::FdSource;

macro_rules! sl {
    () => {
        slog_scope::logger().new(slog::o!("subsystem" => "tapfdsource"))
    };
}

// Head start the DHCP responder gets over the VM's first DISCOVER.
// FIXME: there's some very small possibility for a race here (the VM asks
// before the responder is ready); replace the sleep with a bind-then-probe
// readiness check.
const DHCP_WARMUP: Duration = Duration::from_millis(500);

/// Pod identity plus an optional DNS override, as carried by ADD payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodNetworkDesc {
    #[serde(rename = "podId")]
    pub pod_id: String,
    #[serde(rename = "podNs", default)]
    pub pod_ns: String,
    #[serde(rename = "podName", default)]
    pub pod_name: String,
    #[serde(rename = "DNS", default)]
    pub dns: Option<Dns>,
}

/// Everything the source owns for one live pod network.
struct PodNetwork {
    desc: PodNetworkDesc,
    csn: ContainerSideNetwork,
    dhcp: Arc<DhcpServer>,
    done_rx: mpsc::Receiver<Result<()>>,
}

pub struct TapFdSource {
    provisioner: Arc<dyn Provisioner>,
    pods: Mutex<HashMap<String, Arc<Mutex<PodNetwork>>>>,
}

impl TapFdSource {
    pub fn new(provisioner: Arc<dyn Provisioner>) -> Self {
        TapFdSource {
            provisioner,
            pods: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl FdSource for TapFdSource {
    async fn add(&self, key: &str, data: &[u8]) -> Result<(RawFd, Vec<u8>)> {
        let desc: PodNetworkDesc =
            serde_json::from_slice(data).context("error unmarshalling pod network desc")?;
        if desc.pod_id.is_empty() {
            bail!("pod network desc carries no podId");
        }
        if self.pods.lock().unwrap().contains_key(key) {
            bail!("fd key already exists: {:?}", key);
        }
        info!(
            sl!(),
            "setting up networking for pod {} ({})", desc.pod_name, desc.pod_id
        );

        let provisioner = self.provisioner.clone();
        let setup_desc = desc.clone();
        let pod = tokio::task::spawn_blocking(move || setup_pod_network(provisioner, setup_desc))
            .await
            .context("join pod network setup")??;

        // Give the responder a head start over the VM's first DISCOVER;
        // best-effort, see DHCP_WARMUP.
        tokio::time::sleep(DHCP_WARMUP).await;

        let fd = pod.csn.tap_fd();
        let response = serde_json::to_vec(&pod.csn.result).context("error marshalling result")?;
        self.pods
            .lock()
            .unwrap()
            .insert(key.to_string(), Arc::new(Mutex::new(pod)));
        Ok((fd, response))
    }

    async fn release(&self, key: &str) -> Result<()> {
        let pod = self
            .pods
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("bad fd key: {:?}", key))?;
        {
            let pod = pod.lock().unwrap();
            info!(
                sl!(),
                "releasing networking of pod {} ({})", pod.desc.pod_name, pod.desc.pod_id
            );
        }

        let provisioner = self.provisioner.clone();
        let teardown_pod = pod.clone();
        tokio::task::spawn_blocking(move || {
            let mut pod = teardown_pod.lock().unwrap();
            teardown_pod_network(provisioner, &mut pod)
        })
        .await
        .context("join pod network teardown")??;

        // The entry goes away only once teardown has fully succeeded; on
        // failure it stays, so the key keeps rejecting duplicate ADDs and a
        // retried release resumes where teardown stopped.
        self.pods.lock().unwrap().remove(key);
        Ok(())
    }

    async fn info(&self, key: &str) -> Result<Vec<u8>> {
        let pod = self
            .pods
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("bad fd key: {:?}", key))?;
        let pod = pod
            .try_lock()
            .map_err(|_| anyhow!("pod network {:?} is being released", key))?;
        let mac = parse_mac(pod.csn.container_mac())
            .ok_or_else(|| anyhow!("bad container mac {:?}", pod.csn.container_mac()))?;
        Ok(mac.to_vec())
    }
}

/// Ordered setup; every step undoes all earlier ones before erroring out.
fn setup_pod_network(
    provisioner: Arc<dyn Provisioner>,
    desc: PodNetworkDesc,
) -> Result<PodNetwork> {
    let ns = netns::create_pod_netns(&desc.pod_id).with_context(|| {
        format!(
            "error creating new netns for pod {} ({})",
            desc.pod_name, desc.pod_id
        )
    })?;

    match attach_pod(&provisioner, &desc, &ns) {
        Ok(pod) => Ok(pod),
        Err(e) => {
            if let Err(destroy_err) = ns.remove() {
                warn!(
                    sl!(),
                    "failed to remove netns of pod {}: {:?}", desc.pod_id, destroy_err
                );
            }
            Err(e)
        }
    }
}

fn attach_pod(
    provisioner: &Arc<dyn Provisioner>,
    desc: &PodNetworkDesc,
    ns: &NetNs,
) -> Result<PodNetwork> {
    let ns_path = netns::pod_netns_path(&desc.pod_id);
    let mut result = provisioner
        .add_sandbox(&desc.pod_id, &desc.pod_name, &desc.pod_ns, &ns_path)
        .with_context(|| {
            format!(
                "error adding pod {} ({}) to the container network",
                desc.pod_name, desc.pod_id
            )
        })?;
    debug!(sl!(), "provisioner result for pod {}: {:?}", desc.pod_id, result);

    // a DNS override replaces the provisioner's DNS block wholesale
    if let Some(dns) = &desc.dns {
        result.dns = dns.clone();
    }
    result.set_sandbox_paths(&ns_path.to_string_lossy());

    match wire_vm_network(desc, ns, &result) {
        Ok(pod) => Ok(pod),
        Err(e) => {
            if let Err(detach_err) =
                provisioner.remove_sandbox(&desc.pod_id, &desc.pod_name, &desc.pod_ns)
            {
                warn!(
                    sl!(),
                    "failed to detach pod {} after setup error: {:?}", desc.pod_id, detach_err
                );
            }
            Err(e)
        }
    }
}

fn wire_vm_network(
    desc: &PodNetworkDesc,
    ns: &NetNs,
    result: &cni::NetworkResult,
) -> Result<PodNetwork> {
    let setup_result = result.clone();
    let csn = netns::with_netlink_in(ns, |handle| async move {
        ContainerSideNetwork::setup(&handle, &setup_result).await
    })
    .context("rewire container-side network")?;

    let dhcp = match DhcpServer::new(result, csn.container_mac())
        .context("prepare dhcp responder")
        .and_then(|dhcp| {
            netns::run_in_netns(ns, || dhcp.bind())
                .context("failed to set up dhcp listener")?;
            Ok(Arc::new(dhcp))
        }) {
        Ok(dhcp) => dhcp,
        Err(e) => {
            if let Err(undo_err) = netns::with_netlink_in(ns, |handle| async move {
                let mut csn = csn;
                csn.teardown(&handle).await
            }) {
                warn!(
                    sl!(),
                    "failed to unwire pod {} after dhcp error: {:?}", desc.pod_id, undo_err
                );
            }
            return Err(e);
        }
    };

    let done_rx = spawn_dhcp_task(&desc.pod_id, dhcp.clone())?;
    Ok(PodNetwork {
        desc: desc.clone(),
        csn,
        dhcp,
        done_rx,
    })
}

/// Run the DHCP serve loop on its own thread, entered in the pod namespace
/// for the loop's entire lifetime.
fn spawn_dhcp_task(pod_id: &str, dhcp: Arc<DhcpServer>) -> Result<mpsc::Receiver<Result<()>>> {
    let (done_tx, done_rx) = mpsc::channel();
    let ns_name = netns::pod_netns_name(pod_id);
    let pod_id = pod_id.to_string();
    std::thread::Builder::new()
        .name(format!("dhcp-{}", pod_id))
        .spawn(move || {
            let served = NetNs::get(&ns_name)
                .map_err(anyhow::Error::from)
                .and_then(|ns| {
                    ns.run(|_| dhcp.serve())
                        .map_err(anyhow::Error::from)
                        .and_then(|r| r)
                });
            if let Err(e) = &served {
                error!(sl!(), "dhcp server error for pod {}: {:?}", pod_id, e);
            }
            let _ = done_tx.send(served);
        })
        .context("spawn dhcp serve thread")?;
    Ok(done_rx)
}

/// Reverse order of setup: stop DHCP, unwire, detach, drop the namespace.
/// The caller deletes its map entry only after this returns Ok; on failure
/// the pod state is left behind for a retry.
fn teardown_pod_network(provisioner: Arc<dyn Provisioner>, pod: &mut PodNetwork) -> Result<()> {
    let desc = pod.desc.clone();
    let ns = netns::get_pod_netns(&desc.pod_id)?;

    pod.dhcp.close();
    match pod.done_rx.recv() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(
            sl!(),
            "dhcp responder of pod {} ended with error: {:?}", desc.pod_id, e
        ),
        Err(_) => warn!(
            sl!(),
            "dhcp responder thread of pod {} is already gone", desc.pod_id
        ),
    }

    let csn = &mut pod.csn;
    let captured = netns::with_netlink_in(&ns, |handle| async move {
        csn.teardown(&handle).await
    })
    .context("unwire container-side network")?;
    if let Some(after) = captured {
        debug!(
            sl!(),
            "link state of pod {} after teardown: {:?}", desc.pod_id, after
        );
    }

    provisioner
        .remove_sandbox(&desc.pod_id, &desc.pod_name, &desc.pod_ns)
        .with_context(|| {
            format!(
                "error removing pod sandbox {:?} from the container network",
                desc.pod_id
            )
        })?;

    ns.remove()
        .with_context(|| format!("error removing netns of pod {:?}", desc.pod_id))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_network_desc_json_names() {
        let desc: PodNetworkDesc = serde_json::from_str(
            r#"{"podId": "p1", "podNs": "default", "podName": "vm-1",
                "DNS": {"nameservers": ["1.1.1.1"]}}"#,
        )
        .unwrap();
        assert_eq!(desc.pod_id, "p1");
        assert_eq!(desc.pod_ns, "default");
        assert_eq!(desc.pod_name, "vm-1");
        assert_eq!(
            desc.dns.unwrap().nameservers,
            vec!["1.1.1.1".to_string()]
        );
    }

    #[test]
    fn test_pod_network_desc_dns_defaults_to_none() {
        let desc: PodNetworkDesc =
            serde_json::from_str(r#"{"podId": "p1", "podNs": "ns", "podName": "n"}"#).unwrap();
        assert!(desc.dns.is_none());
    }
}
