// Copyright (c) 2025 The vmtap Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use serde::{Deserialize, Serialize};

/// Sandbox value a provisioner reports before the pod namespace exists.
/// Rewritten to the real netns path with [`NetworkResult::set_sandbox_paths`].
pub const SANDBOX_PLACEHOLDER: &str = "placeholder";

/// An interface the provisioner configured. `sandbox` is the netns path for
/// in-pod interfaces and empty for host-side ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub sandbox: String,
}

/// One address assignment: `address` is in CIDR form ("10.1.90.5/24") and
/// `interface` indexes into [`NetworkResult::interfaces`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpConfig {
    #[serde(default)]
    pub interface: usize,
    pub address: String,
    #[serde(default)]
    pub gateway: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub dst: String,
    #[serde(default)]
    pub gw: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dns {
    #[serde(default)]
    pub nameservers: Vec<String>,
    #[serde(default)]
    pub search: Vec<String>,
    #[serde(default)]
    pub options: Vec<String>,
}

/// The document a provisioner produces after attaching a pod to the network.
/// Round-trips through JSON unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkResult {
    #[serde(default)]
    pub interfaces: Vec<Interface>,
    #[serde(default)]
    pub ips: Vec<IpConfig>,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub dns: Dns,
}

impl NetworkResult {
    /// Substitute the sandbox placeholder with the actual netns path.
    pub fn set_sandbox_paths(&mut self, netns_path: &str) {
        for iface in &mut self.interfaces {
            if iface.sandbox == SANDBOX_PLACEHOLDER {
                iface.sandbox = netns_path.to_string();
            }
        }
    }

    /// Interfaces that live inside the pod namespace.
    pub fn sandbox_interfaces(&self) -> impl Iterator<Item = (usize, &Interface)> {
        self.interfaces
            .iter()
            .enumerate()
            .filter(|(_, iface)| !iface.sandbox.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_result() -> NetworkResult {
        NetworkResult {
            interfaces: vec![Interface {
                name: "eth0".to_string(),
                mac: "aa:bb:cc:00:11:22".to_string(),
                sandbox: SANDBOX_PLACEHOLDER.to_string(),
            }],
            ips: vec![IpConfig {
                interface: 0,
                address: "10.1.90.5/24".to_string(),
                gateway: "10.1.90.1".to_string(),
            }],
            routes: vec![Route {
                dst: "0.0.0.0/0".to_string(),
                gw: "10.1.90.1".to_string(),
            }],
            dns: Dns {
                nameservers: vec!["8.8.8.8".to_string()],
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_result_json_round_trip() {
        let result = sample_result();
        let bs = serde_json::to_vec(&result).unwrap();
        let decoded: NetworkResult = serde_json::from_slice(&bs).unwrap();
        assert_eq!(result, decoded);
    }

    #[test]
    fn test_set_sandbox_paths() {
        let mut result = sample_result();
        result.interfaces.push(Interface {
            name: "cni0".to_string(),
            mac: String::new(),
            sandbox: String::new(),
        });

        result.set_sandbox_paths("/var/run/netns/vmtap-p1");
        assert_eq!(result.interfaces[0].sandbox, "/var/run/netns/vmtap-p1");
        // host-side interfaces are left alone
        assert_eq!(result.interfaces[1].sandbox, "");

        let in_pod: Vec<_> = result.sandbox_interfaces().collect();
        assert_eq!(in_pod.len(), 1);
        assert_eq!(in_pod[0].0, 0);
    }
}
