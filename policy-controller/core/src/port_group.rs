use crate::{
    acl::{Acl, PolicyDirection},
    identity::{ExternalIds, IdsType, IndexKey, ObjectIdentity, ObjectKind},
};
use std::collections::BTreeSet;

/// Readable name recorded on the cluster-wide port group.
pub const CLUSTER_PORT_GROUP: &str = "clusterPortGroup";

/// A named set of logical ports that ACLs are attached to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PortGroup {
    pub name: String,
    /// Logical port names.
    pub ports: BTreeSet<String>,
    /// Primary ids of the ACLs attached to this group.
    pub acls: BTreeSet<String>,
    pub external_ids: ExternalIds,
}

impl PortGroup {
    pub fn build<'a>(
        id: &ObjectIdentity,
        ports: impl IntoIterator<Item = String>,
        acls: impl IntoIterator<Item = &'a Acl>,
    ) -> Self {
        Self {
            name: id.short_name(),
            ports: ports.into_iter().collect(),
            acls: acls
                .into_iter()
                .filter_map(|acl| acl.key().map(str::to_string))
                .collect(),
            external_ids: id.external_ids(),
        }
    }

    pub fn identity(&self) -> Option<ObjectIdentity> {
        ObjectIdentity::from_external_ids(ObjectKind::PortGroup, &self.external_ids)
    }
}

pub fn network_policy_port_group(
    controller: &str,
    namespace: &str,
    policy: &str,
) -> ObjectIdentity {
    ObjectIdentity::new(
        IdsType::PORT_GROUP_NETWORK_POLICY,
        controller,
        format!("{namespace}:{policy}"),
    )
}

pub fn default_deny_port_group(
    controller: &str,
    namespace: &str,
    direction: PolicyDirection,
) -> ObjectIdentity {
    ObjectIdentity::new(IdsType::PORT_GROUP_NETPOL_NAMESPACE, controller, namespace)
        .with_index(IndexKey::PolicyDirection, direction)
}

pub fn cluster_port_group(controller: &str) -> ObjectIdentity {
    ObjectIdentity::new(IdsType::PORT_GROUP_CLUSTER, controller, CLUSTER_PORT_GROUP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::hash_for_backend;

    #[test]
    fn names() {
        assert_eq!(
            network_policy_port_group("c", "ns1", "pol").short_name(),
            hash_for_backend("ns1_pol")
        );
        assert_eq!(
            cluster_port_group("c").short_name(),
            hash_for_backend(CLUSTER_PORT_GROUP)
        );
        assert_eq!(
            default_deny_port_group("c", "ns1", PolicyDirection::Ingress).short_name(),
            format!("{}_ingressDefaultDeny", hash_for_backend("ns1"))
        );
    }

    #[test]
    fn build_tracks_acl_keys() {
        let id = network_policy_port_group("c", "ns1", "pol");
        let pg = PortGroup::build(&id, vec!["ns1_pod1".to_string()], None);
        assert_eq!(pg.identity(), Some(id));
        assert!(pg.acls.is_empty());
        assert_eq!(pg.ports.len(), 1);
    }
}
