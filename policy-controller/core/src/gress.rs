//! Per-rule state for one ingress or egress rule of a policy.
//!
//! A [`GressRule`] tracks the address-set references its selector peers currently resolve to,
//! along with its literal CIDR peers and port restrictions, and renders the ACLs that enforce it.
//! Reference names are sorted before rendering so that the same logical rule always produces the
//! same match text, which is what allows unchanged rules to be recognized as no-ops downstream.

use crate::{
    acl::{Acl, AclAction, PolicyDirection, Severity, DEFAULT_ALLOW_PRIORITY},
    address_set::AddressSetRef,
    identity::{IdsType, IndexKey, ObjectIdentity},
    port::PortRestriction,
    IpMode,
};
use ipnet::IpNet;
use std::collections::BTreeMap;

/// A literal CIDR peer with optional exclusions.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IpBlock {
    pub cidr: IpNet,
    pub except: Vec<IpNet>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GressRule {
    namespace: String,
    policy: String,
    direction: PolicyDirection,
    index: usize,
    controller: String,
    ip_mode: IpMode,
    stateless: bool,
    has_peer_selector: bool,
    /// Keyed by primary id so that membership checks do not depend on the hashed names.
    peers: BTreeMap<String, AddressSetRef>,
    ip_blocks: Vec<IpBlock>,
    ports: Vec<PortRestriction>,
}

// === impl IpBlock ===

impl IpBlock {
    fn family(net: &IpNet) -> &'static str {
        match net {
            IpNet::V4(_) => "ip4",
            IpNet::V6(_) => "ip6",
        }
    }

    /// Renders the L3 clause for this block, e.g. `ip4.src == 10.0.0.0/8 && ip4.src != {10.1.0.0/16}`.
    pub fn l3_match(&self, direction: PolicyDirection) -> String {
        let field = format!("{}.{}", Self::family(&self.cidr), direction.peer_field());
        let mut m = format!("{field} == {}", self.cidr);
        let except = self
            .except
            .iter()
            .filter(|e| Self::family(e) == Self::family(&self.cidr))
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        if !except.is_empty() {
            m.push_str(&format!(" && {field} != {{{}}}", except.join(", ")));
        }
        m
    }
}

// === impl GressRule ===

impl GressRule {
    pub fn new(
        namespace: impl Into<String>,
        policy: impl Into<String>,
        direction: PolicyDirection,
        index: usize,
        controller: impl Into<String>,
        ip_mode: IpMode,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            policy: policy.into(),
            direction,
            index,
            controller: controller.into(),
            ip_mode,
            stateless: false,
            has_peer_selector: false,
            peers: BTreeMap::new(),
            ip_blocks: Vec::new(),
            ports: Vec::new(),
        }
    }

    pub fn direction(&self) -> PolicyDirection {
        self.direction
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn set_stateless(&mut self, stateless: bool) {
        self.stateless = stateless;
    }

    /// Records that the rule has at least one selector peer, even if none has resolved yet.
    pub fn set_has_peer_selector(&mut self) {
        self.has_peer_selector = true;
    }

    pub fn has_peer_selector(&self) -> bool {
        self.has_peer_selector
    }

    pub fn add_ip_block(&mut self, block: IpBlock) {
        self.ip_blocks.push(block);
    }

    pub fn add_port(&mut self, port: PortRestriction) {
        self.ports.push(port);
    }

    /// Returns true iff the reference was not already present.
    pub fn add_peer_address_set(&mut self, set: AddressSetRef) -> bool {
        let key = set.identity().primary_id();
        if self.peers.contains_key(&key) {
            return false;
        }
        self.peers.insert(key, set);
        true
    }

    /// Returns true iff the reference was present.
    pub fn remove_peer_address_set(&mut self, id: &ObjectIdentity) -> bool {
        self.peers.remove(&id.primary_id()).is_some()
    }

    pub fn peer_address_sets(&self) -> impl Iterator<Item = &AddressSetRef> + '_ {
        self.peers.values()
    }

    /// Renders the selector-branch match for this rule, scoped to `port_group`, without any L4
    /// restriction.
    ///
    /// Returns `None` when the rule has selector peers that currently resolve to nothing, in which
    /// case no selector ACL should exist.
    pub fn render_match(&self, port_group: &str) -> Option<String> {
        let l3 = self.l3_match()?;
        Some(format!("{l3} && {}", self.direction.port_match(port_group)))
    }

    /// Builds every ACL enforcing this rule on `port_group`.
    ///
    /// Each selector, CIDR and port combination gets a distinct identity so that an entry that
    /// becomes empty can never be conflated with a sibling.
    pub fn build_acls(&self, port_group: &str, allow: Option<Severity>) -> Vec<Acl> {
        let lport = self.direction.port_match(port_group);
        let l3 = self.l3_match();
        // An IP-block-only rule has no selector branch.
        let selector_branch = self.has_peer_selector || self.ip_blocks.is_empty();

        let mut acls = Vec::new();
        let mut push = |port_idx: i32, block_idx: i32, m: String| {
            acls.push(self.acl(port_idx, block_idx, m, allow));
        };

        if self.ports.is_empty() {
            for (i, block) in self.ip_blocks.iter().enumerate() {
                push(
                    -1,
                    i as i32,
                    format!("{} && {lport}", block.l3_match(self.direction)),
                );
            }
            if selector_branch {
                if let Some(l3) = &l3 {
                    push(-1, -1, format!("{l3} && {lport}"));
                }
            }
        } else {
            for (p, port) in self.ports.iter().enumerate() {
                let l4 = port.l4_match();
                for (i, block) in self.ip_blocks.iter().enumerate() {
                    push(
                        p as i32,
                        i as i32,
                        format!("{} && {l4} && {lport}", block.l3_match(self.direction)),
                    );
                }
                if selector_branch {
                    if let Some(l3) = &l3 {
                        push(p as i32, -1, format!("{l3} && {l4} && {lport}"));
                    }
                }
            }
        }

        acls
    }

    /// The identity of one of this rule's ACLs; `-1` marks an unused index.
    pub fn acl_identity(&self, port_idx: i32, block_idx: i32) -> ObjectIdentity {
        ObjectIdentity::new(
            IdsType::ACL_NETWORK_POLICY,
            self.controller.clone(),
            format!("{}:{}", self.namespace, self.policy),
        )
        .with_index(IndexKey::PolicyDirection, self.direction)
        .with_index(IndexKey::GressIndex, self.index)
        .with_index(IndexKey::PortPolicyIndex, port_idx)
        .with_index(IndexKey::IpBlockIndex, block_idx)
    }

    fn acl(&self, port_idx: i32, block_idx: i32, m: String, allow: Option<Severity>) -> Acl {
        // Only the address-set branch honors the stateless opt-in.
        let action = if self.stateless && self.has_peer_selector && block_idx == -1 {
            AclAction::AllowStateless
        } else {
            AclAction::AllowRelated
        };
        Acl::build(
            &self.acl_identity(port_idx, block_idx),
            self.direction.acl_direction(),
            DEFAULT_ALLOW_PRIORITY,
            m,
            action,
            allow,
            self.direction.acl_options(),
        )
    }

    fn l3_match(&self) -> Option<String> {
        let field = self.direction.peer_field();
        if !self.has_peer_selector {
            return Some(match (self.ip_mode.ipv4, self.ip_mode.ipv6) {
                (true, true) => "(ip4 || ip6)".to_string(),
                (false, true) => "ip6".to_string(),
                _ => "ip4".to_string(),
            });
        }
        if self.peers.is_empty() {
            return None;
        }

        let render = |family: &str, names: Vec<&str>| {
            let sets = names
                .into_iter()
                .map(|n| format!("${n}"))
                .collect::<Vec<_>>()
                .join(", ");
            format!("{family}.{field} == {{{sets}}}")
        };
        let mut v4 = self.peers.values().map(AddressSetRef::v4_name).collect::<Vec<_>>();
        v4.sort_unstable();
        let mut v6 = self.peers.values().map(AddressSetRef::v6_name).collect::<Vec<_>>();
        v6.sort_unstable();

        Some(match (self.ip_mode.ipv4, self.ip_mode.ipv6) {
            (true, true) => format!("({} || {})", render("ip4", v4), render("ip6", v6)),
            (false, true) => render("ip6", v6),
            _ => render("ip4", v4),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{acl::AclDirection, port::Protocol};
    use pretty_assertions::assert_eq;

    fn rule(direction: PolicyDirection) -> GressRule {
        GressRule::new("ns1", "pol", direction, 0, "ctrl", IpMode::default())
    }

    #[test]
    fn add_and_remove_references() {
        let mut r = rule(PolicyDirection::Ingress);
        r.set_has_peer_selector();
        let a = AddressSetRef::namespace("ctrl", "ns2");
        assert!(r.add_peer_address_set(a.clone()));
        let before = r.render_match("pg");
        assert!(!r.add_peer_address_set(a.clone()));
        assert_eq!(r.render_match("pg"), before);

        assert!(r.remove_peer_address_set(a.identity()));
        assert!(!r.remove_peer_address_set(a.identity()));
        assert_eq!(r.render_match("pg"), None);
    }

    #[test]
    fn render_is_order_independent() {
        let sets = ["a", "b", "c"].map(|ns| AddressSetRef::namespace("ctrl", ns));
        let orders = [[0, 1, 2], [2, 1, 0], [1, 2, 0]];
        let rendered = orders
            .iter()
            .map(|order| {
                let mut r = rule(PolicyDirection::Ingress);
                r.set_has_peer_selector();
                for i in order {
                    r.add_peer_address_set(sets[*i].clone());
                }
                r.render_match("pg").expect("must render")
            })
            .collect::<Vec<_>>();
        assert_eq!(rendered[0], rendered[1]);
        assert_eq!(rendered[1], rendered[2]);

        let mut names = sets.iter().map(|s| s.v4_name().to_string()).collect::<Vec<_>>();
        names.sort();
        assert_eq!(
            rendered[0],
            format!(
                "ip4.src == {{${}, ${}, ${}}} && outport == @pg",
                names[0], names[1], names[2]
            )
        );
    }

    #[test]
    fn selector_acl() {
        let mut r = rule(PolicyDirection::Ingress);
        r.set_has_peer_selector();
        let ns2 = AddressSetRef::namespace("ctrl", "ns2");
        r.add_peer_address_set(ns2.clone());
        let acls = r.build_acls("pg", None);
        assert_eq!(acls.len(), 1);
        assert_eq!(
            acls[0].match_expr,
            format!("ip4.src == {{${}}} && outport == @pg", ns2.v4_name())
        );
        assert_eq!(acls[0].action, AclAction::AllowRelated);
        assert_eq!(acls[0].direction, AclDirection::ToLport);
        assert_eq!(acls[0].priority, DEFAULT_ALLOW_PRIORITY);
        assert_eq!(acls[0].name, "NP:ns1:pol:Ingress:0");
        assert!(!acls[0].log);
    }

    #[test]
    fn unresolved_selector_omits_acl() {
        let mut r = rule(PolicyDirection::Ingress);
        r.set_has_peer_selector();
        assert!(r.build_acls("pg", None).is_empty());
    }

    #[test]
    fn port_only_egress_acl() {
        let mut r = rule(PolicyDirection::Egress);
        r.add_port(PortRestriction::new(Protocol::Tcp, Some(81), None).unwrap());
        let acls = r.build_acls("pg", None);
        assert_eq!(acls.len(), 1);
        assert_eq!(acls[0].match_expr, "ip4 && tcp && tcp.dst==81 && inport == @pg");
        assert_eq!(acls[0].direction, AclDirection::FromLport);
        assert_eq!(acls[0].name, "NP:ns1:pol:Egress:0:0");
        assert_eq!(
            acls[0].options.get(crate::acl::APPLY_AFTER_LB).map(String::as_str),
            Some("true")
        );
    }

    #[test]
    fn empty_rule_allows_all() {
        let r = rule(PolicyDirection::Ingress);
        let acls = r.build_acls("pg", None);
        assert_eq!(acls.len(), 1);
        assert_eq!(acls[0].match_expr, "ip4 && outport == @pg");
    }

    #[test]
    fn ip_blocks_get_their_own_acls() {
        let mut r = rule(PolicyDirection::Ingress);
        r.set_has_peer_selector();
        r.add_peer_address_set(AddressSetRef::namespace("ctrl", "ns2"));
        r.add_ip_block(IpBlock {
            cidr: "10.0.0.0/8".parse().unwrap(),
            except: vec!["10.1.0.0/16".parse().unwrap()],
        });
        let acls = r.build_acls("pg", None);
        assert_eq!(acls.len(), 2);
        assert_eq!(
            acls[0].match_expr,
            "ip4.src == 10.0.0.0/8 && ip4.src != {10.1.0.0/16} && outport == @pg"
        );
        assert_eq!(acls[0].name, "NP:ns1:pol:Ingress:0:0");
        assert_ne!(acls[0].name, acls[1].name);

        // Without selector peers only the block ACL remains.
        let mut r = rule(PolicyDirection::Ingress);
        r.add_ip_block(IpBlock {
            cidr: "10.0.0.0/8".parse().unwrap(),
            except: vec![],
        });
        let acls = r.build_acls("pg", None);
        assert_eq!(acls.len(), 1);
        assert_eq!(acls[0].match_expr, "ip4.src == 10.0.0.0/8 && outport == @pg");
    }

    #[test]
    fn stateless_applies_to_selector_acls() {
        let mut r = rule(PolicyDirection::Ingress);
        r.set_stateless(true);
        r.set_has_peer_selector();
        let ns2 = AddressSetRef::namespace("ctrl", "ns2");
        r.add_peer_address_set(ns2.clone());
        r.add_ip_block(IpBlock {
            cidr: "10.0.0.0/8".parse().unwrap(),
            except: vec![],
        });
        r.add_port(PortRestriction::new(Protocol::Tcp, Some(81), None).unwrap());
        let acls = r.build_acls("pg", Some(Severity::Notice));
        assert_eq!(acls.len(), 2);

        assert_eq!(
            acls[0].match_expr,
            "ip4.src == 10.0.0.0/8 && tcp && tcp.dst==81 && outport == @pg"
        );
        assert_eq!(acls[0].action, AclAction::AllowRelated);
        assert_eq!(
            acls[1].match_expr,
            format!("ip4.src == {{${}}} && tcp && tcp.dst==81 && outport == @pg", ns2.v4_name())
        );
        assert_eq!(acls[1].action, AclAction::AllowStateless);
        for acl in &acls {
            assert!(acl.log);
            assert_eq!(acl.severity, Some(Severity::Notice));
        }

        // Rules without selector peers stay stateful.
        let mut r = rule(PolicyDirection::Egress);
        r.set_stateless(true);
        r.add_port(PortRestriction::new(Protocol::Tcp, Some(81), None).unwrap());
        let acls = r.build_acls("pg", None);
        assert_eq!(acls.len(), 1);
        assert_eq!(acls[0].action, AclAction::AllowRelated);

        let mut r = rule(PolicyDirection::Ingress);
        r.set_stateless(true);
        r.add_ip_block(IpBlock {
            cidr: "10.0.0.0/8".parse().unwrap(),
            except: vec![],
        });
        let acls = r.build_acls("pg", None);
        assert_eq!(acls.len(), 1);
        assert_eq!(acls[0].action, AclAction::AllowRelated);
    }

    #[test]
    fn dual_stack() {
        let mut r = GressRule::new(
            "ns1",
            "pol",
            PolicyDirection::Egress,
            0,
            "ctrl",
            IpMode {
                ipv4: true,
                ipv6: true,
            },
        );
        r.set_has_peer_selector();
        let set = AddressSetRef::namespace("ctrl", "ns2");
        r.add_peer_address_set(set.clone());
        assert_eq!(
            r.render_match("pg").unwrap(),
            format!(
                "(ip4.dst == {{${}}} || ip6.dst == {{${}}}) && inport == @pg",
                set.v4_name(),
                set.v6_name()
            )
        );
    }

    #[test]
    fn idempotent() {
        let build = || {
            let mut r = rule(PolicyDirection::Ingress);
            r.set_has_peer_selector();
            r.add_peer_address_set(AddressSetRef::namespace("ctrl", "b"));
            r.add_peer_address_set(AddressSetRef::namespace("ctrl", "a"));
            r.add_port(PortRestriction::new(Protocol::Udp, Some(53), None).unwrap());
            r.build_acls("pg", None)
        };
        assert_eq!(build(), build());
    }
}
