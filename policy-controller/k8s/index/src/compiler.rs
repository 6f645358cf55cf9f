//! Turns indexed cluster state into the rows that must exist in the backend.
//!
//! Everything here is a pure function of its inputs: compiling the same state twice yields
//! identical rows, so the engine may always re-issue the full set of upserts.

use crate::ClusterInfo;
use sdn_policy_controller_core::{
    acl::{DEFAULT_ALLOW_PRIORITY, DEFAULT_DENY_PRIORITY},
    port_group::{cluster_port_group, default_deny_port_group, network_policy_port_group},
    Acl, AclAction, AclLogging, AclRole, GressRule, IdsType, IndexKey, ObjectIdentity, Op,
    PolicyDirection, PortGroup,
};
use std::{collections::BTreeSet, net::IpAddr};

pub const HAIRPIN_MASQUERADE_V4: &str = "169.254.169.5";
pub const HAIRPIN_MASQUERADE_V6: &str = "fd69::5";

const ARP_ALLOW_MATCH: &str = "(arp || nd)";

/// The desired backend state for one reconcile key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Desired {
    Policy(CompiledPolicy),
    /// The policy no longer exists; its port group must be removed.
    PolicyAbsent { port_group: String },
    Namespace(NamespaceDefaults),
    /// No policy remains in the namespace; its default-deny groups must be removed.
    NamespaceAbsent { port_groups: [String; 2] },
    ClusterDefaults(ClusterDefaults),
    Node(NodeAcls),
    /// The node has no management address. Its switch goes away with the node, so nothing is
    /// written.
    NodeAbsent,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompiledPolicy {
    pub port_group: PortGroup,
    pub acls: Vec<Acl>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamespaceDefaults {
    pub ingress: PortGroup,
    pub egress: PortGroup,
    pub acls: Vec<Acl>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterDefaults {
    pub port_group: PortGroup,
    pub acls: Vec<Acl>,
}

/// ACLs admitting traffic from a node's management port, attached to the node's logical switch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeAcls {
    pub switch: String,
    pub acls: Vec<Acl>,
}

// === impl Desired ===

impl Desired {
    /// True if this state only removes objects.
    pub fn is_absent(&self) -> bool {
        matches!(
            self,
            Self::PolicyAbsent { .. } | Self::NamespaceAbsent { .. } | Self::NodeAbsent
        )
    }

    pub fn acls(&self) -> &[Acl] {
        match self {
            Self::Policy(p) => &p.acls,
            Self::Namespace(n) => &n.acls,
            Self::ClusterDefaults(c) => &c.acls,
            Self::Node(n) => &n.acls,
            Self::PolicyAbsent { .. } | Self::NamespaceAbsent { .. } | Self::NodeAbsent => &[],
        }
    }

    pub fn port_groups(&self) -> Vec<&PortGroup> {
        match self {
            Self::Policy(p) => vec![&p.port_group],
            Self::Namespace(n) => vec![&n.ingress, &n.egress],
            Self::ClusterDefaults(c) => vec![&c.port_group],
            Self::Node(_)
            | Self::PolicyAbsent { .. }
            | Self::NamespaceAbsent { .. }
            | Self::NodeAbsent => vec![],
        }
    }

    /// The operations that converge the backend to this state.
    ///
    /// ACLs are upserted before the groups and switches that reference them.
    pub fn into_ops(self) -> Vec<Op> {
        match self {
            Self::Policy(CompiledPolicy { port_group, acls })
            | Self::ClusterDefaults(ClusterDefaults { port_group, acls }) => acls
                .into_iter()
                .map(Op::UpsertAcl)
                .chain(Some(Op::UpsertPortGroup(port_group)))
                .collect(),
            Self::Namespace(NamespaceDefaults {
                ingress,
                egress,
                acls,
            }) => acls
                .into_iter()
                .map(Op::UpsertAcl)
                .chain([Op::UpsertPortGroup(ingress), Op::UpsertPortGroup(egress)])
                .collect(),
            Self::Node(NodeAcls { switch, acls }) => {
                let keys = acls
                    .iter()
                    .filter_map(|acl| acl.key().map(str::to_string))
                    .collect();
                acls.into_iter()
                    .map(Op::UpsertAcl)
                    .chain(Some(Op::AddAclsToSwitch { switch, acls: keys }))
                    .collect()
            }
            Self::NodeAbsent => vec![],
            Self::PolicyAbsent { port_group } => vec![Op::DeletePortGroup { name: port_group }],
            Self::NamespaceAbsent { port_groups } => port_groups
                .into_iter()
                .map(|name| Op::DeletePortGroup { name })
                .collect(),
        }
    }
}

/// Builds the port group and ACLs of one policy.
///
/// Rules of both directions always produce ACLs, regardless of the policy's declared types; the
/// types only decide default-deny membership.
pub fn compile_policy<'r>(
    cluster: &ClusterInfo,
    namespace: &str,
    name: &str,
    rules: impl IntoIterator<Item = &'r GressRule>,
    local_ports: BTreeSet<String>,
    logging: AclLogging,
) -> CompiledPolicy {
    let pg_id = network_policy_port_group(&cluster.controller_name, namespace, name);
    let pg_name = pg_id.short_name();
    let acls = rules
        .into_iter()
        .flat_map(|rule| rule.build_acls(&pg_name, logging.allow))
        .collect::<Vec<_>>();
    let port_group = PortGroup::build(&pg_id, local_ports, &acls);
    CompiledPolicy { port_group, acls }
}

pub fn policy_absent(cluster: &ClusterInfo, namespace: &str, name: &str) -> Desired {
    Desired::PolicyAbsent {
        port_group: network_policy_port_group(&cluster.controller_name, namespace, name)
            .short_name(),
    }
}

/// Builds a namespace's default-deny scaffolding: per direction, a group holding the isolated
/// pods, a drop-all ACL and an ARP/ND allow ACL.
pub fn namespace_defaults(
    cluster: &ClusterInfo,
    namespace: &str,
    ingress_ports: BTreeSet<String>,
    egress_ports: BTreeSet<String>,
    logging: AclLogging,
) -> NamespaceDefaults {
    let mut acls = Vec::with_capacity(4);
    let mut groups = Vec::with_capacity(2);
    for (direction, ports) in [
        (PolicyDirection::Ingress, ingress_ports),
        (PolicyDirection::Egress, egress_ports),
    ] {
        let pg_id = default_deny_port_group(&cluster.controller_name, namespace, direction);
        let pg_name = pg_id.short_name();
        let lport = direction.port_match(&pg_name);

        let deny = Acl::build(
            &default_acl_id(cluster, namespace, direction, AclRole::DefaultDeny),
            direction.acl_direction(),
            DEFAULT_DENY_PRIORITY,
            lport.clone(),
            AclAction::Drop,
            logging.deny,
            direction.acl_options(),
        );
        let arp = Acl::build(
            &default_acl_id(cluster, namespace, direction, AclRole::ArpAllow),
            direction.acl_direction(),
            DEFAULT_ALLOW_PRIORITY,
            format!("{lport} && {ARP_ALLOW_MATCH}"),
            AclAction::Allow,
            None,
            direction.acl_options(),
        );

        groups.push(PortGroup::build(&pg_id, ports, [&deny, &arp]));
        acls.push(deny);
        acls.push(arp);
    }

    let egress = groups.pop().unwrap_or_default();
    let ingress = groups.pop().unwrap_or_default();
    NamespaceDefaults {
        ingress,
        egress,
        acls,
    }
}

pub fn namespace_absent(cluster: &ClusterInfo, namespace: &str) -> Desired {
    Desired::NamespaceAbsent {
        port_groups: [PolicyDirection::Ingress, PolicyDirection::Egress]
            .map(|d| default_deny_port_group(&cluster.controller_name, namespace, d).short_name()),
    }
}

pub fn default_acl_id(
    cluster: &ClusterInfo,
    namespace: &str,
    direction: PolicyDirection,
    role: AclRole,
) -> ObjectIdentity {
    ObjectIdentity::new(
        IdsType::ACL_NETPOL_NAMESPACE,
        cluster.controller_name.clone(),
        namespace,
    )
    .with_index(IndexKey::PolicyDirection, direction)
    .with_index(IndexKey::Role, role.as_str())
}

/// Builds the cluster port group and the ACLs admitting hairpinned service traffic, which is
/// masqueraded to a well-known source address and must never be dropped by policy.
pub fn cluster_defaults(cluster: &ClusterInfo, ports: BTreeSet<String>) -> ClusterDefaults {
    let v4 = format!("ip4.src == {HAIRPIN_MASQUERADE_V4}");
    let v6 = format!("ip6.src == {HAIRPIN_MASQUERADE_V6}");
    let hairpin = match (cluster.ip_mode.ipv4, cluster.ip_mode.ipv6) {
        (true, true) => format!("({v4} || {v6})"),
        (false, true) => v6,
        _ => v4,
    };

    let acls = [PolicyDirection::Egress, PolicyDirection::Ingress]
        .into_iter()
        .map(|direction| {
            let id = ObjectIdentity::new(
                IdsType::ACL_NETPOL_DEFAULT,
                cluster.controller_name.clone(),
                "",
            )
            .with_index(IndexKey::PolicyDirection, direction);
            Acl::build(
                &id,
                direction.acl_direction(),
                DEFAULT_ALLOW_PRIORITY,
                hairpin.clone(),
                AclAction::AllowRelated,
                None,
                direction.acl_options(),
            )
        })
        .collect::<Vec<_>>();

    let pg_id = cluster_port_group(&cluster.controller_name);
    ClusterDefaults {
        port_group: PortGroup::build(&pg_id, ports, &acls),
        acls,
    }
}

/// Builds one ACL per management address of `node`, admitting traffic it sources to local pods.
/// Kubelet probes come from these addresses and must pass regardless of policy.
pub fn node_acls(cluster: &ClusterInfo, node: &str, ips: &[IpAddr]) -> NodeAcls {
    let acls = ips
        .iter()
        .map(|ip| {
            let family = match ip {
                IpAddr::V4(_) => "ip4",
                IpAddr::V6(_) => "ip6",
            };
            let id = ObjectIdentity::new(
                IdsType::ACL_NETPOL_NODE,
                cluster.controller_name.clone(),
                node,
            )
            .with_index(IndexKey::Ip, ip);
            Acl::build(
                &id,
                PolicyDirection::Ingress.acl_direction(),
                DEFAULT_ALLOW_PRIORITY,
                format!("{family}.src=={ip}"),
                AclAction::AllowRelated,
                None,
                PolicyDirection::Ingress.acl_options(),
            )
        })
        .collect();
    NodeAcls {
        switch: node.to_string(),
        acls,
    }
}
