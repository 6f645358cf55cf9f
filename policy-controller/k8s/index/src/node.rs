//! Node -> management port addresses

use crate::{Index, Key};
use anyhow::{anyhow, Context, Result};
use kubert::index::ClusterRemoved;
use sdn_policy_controller_core::{IpMode, IpNet};
use sdn_policy_controller_k8s_api::{self as k8s, ResourceExt};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::{debug, instrument, warn};

/// Management ports take the second host address of each node subnet.
const MANAGEMENT_PORT_OFFSET: u128 = 2;

// === impl Index ===

impl Index {
    /// Tracks the management port addresses of each node.
    ///
    /// Traffic sourced from a node's management port (kubelet probes, host-network clients) must
    /// reach its local pods regardless of policy, so each address gets an allow ACL on the node's
    /// switch.
    #[instrument(skip(self, node), fields(name = ?node.metadata.name))]
    pub fn apply_node(&mut self, node: k8s::Node) {
        let name = node.name_unchecked();
        let ips = match management_ips(&node, self.cluster_info().ip_mode) {
            Ok(ips) => ips,
            Err(error) => {
                warn!(%error, "Ignoring node subnets");
                Vec::new()
            }
        };

        if ips.is_empty() {
            if self.nodes.remove(&name).is_some() {
                debug!("Node has no management address");
                self.enqueue(Key::Node(name));
            }
            return;
        }

        if self.nodes.get(&name) == Some(&ips) {
            return;
        }
        debug!(?ips, "Indexed node");
        self.nodes.insert(name.clone(), ips);
        self.enqueue(Key::Node(name));
    }

    #[instrument(skip(self))]
    pub fn delete_node(&mut self, name: String) {
        if self.nodes.remove(&name).is_some() {
            debug!("Deleted");
            self.enqueue(Key::Node(name));
        }
    }

    pub(crate) fn node_ips(&self, name: &str) -> Option<&[IpAddr]> {
        self.nodes.get(name).map(Vec::as_slice)
    }

    pub(crate) fn node_names(&self) -> impl Iterator<Item = &String> {
        self.nodes.keys()
    }
}

impl kubert::index::IndexClusterResource<k8s::Node> for Index {
    fn apply(&mut self, node: k8s::Node) {
        self.apply_node(node);
    }

    fn delete(&mut self, name: String) {
        self.delete_node(name);
    }

    fn reset(&mut self, nodes: Vec<k8s::Node>, removed: ClusterRemoved) {
        for name in removed {
            self.delete_node(name);
        }
        for node in nodes {
            self.apply_node(node);
        }
        self.mark_synced(|s| s.nodes = true);
    }
}

/// Derives the management port address of each of the node's pod subnets in an enabled family.
fn management_ips(node: &k8s::Node, ip_mode: IpMode) -> Result<Vec<IpAddr>> {
    let Some(spec) = node.spec.as_ref() else {
        return Ok(Vec::new());
    };
    let cidrs = match spec.pod_cidrs.as_ref().filter(|c| !c.is_empty()) {
        Some(cidrs) => cidrs.clone(),
        None => spec.pod_cidr.iter().cloned().collect(),
    };

    let mut ips = Vec::with_capacity(cidrs.len());
    for cidr in cidrs {
        let net = cidr
            .parse::<IpNet>()
            .with_context(|| format!("invalid pod CIDR {cidr}"))?;
        let enabled = match net {
            IpNet::V4(_) => ip_mode.ipv4,
            IpNet::V6(_) => ip_mode.ipv6,
        };
        if enabled {
            ips.push(management_ip(net)?);
        }
    }
    Ok(ips)
}

fn management_ip(net: IpNet) -> Result<IpAddr> {
    let ip = match net.network() {
        IpAddr::V4(network) => u32::try_from(MANAGEMENT_PORT_OFFSET)
            .ok()
            .and_then(|offset| u32::from(network).checked_add(offset))
            .map(|ip| IpAddr::V4(Ipv4Addr::from(ip))),
        IpAddr::V6(network) => u128::from(network)
            .checked_add(MANAGEMENT_PORT_OFFSET)
            .map(|ip| IpAddr::V6(Ipv6Addr::from(ip))),
    };
    ip.filter(|ip| net.contains(ip))
        .ok_or_else(|| anyhow!("pod CIDR {net} is too small for a management port"))
}
