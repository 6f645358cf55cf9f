//! Deterministic, versioned identities for every object this controller writes to the backend.
//!
//! An [`ObjectIdentity`] is a structured key: the owning controller, the ids type (which pairs an
//! object kind with an owner type and declares the secondary index keys that type carries), the
//! owner reference, and the secondary index values. The identity is stored on each row as external
//! ids so that ownership can be recomputed from a live row independently of its display name. Short
//! names are derived from the identity with a stable hash, so they never depend on process state.

use sha2::{Digest, Sha256};
use std::{collections::BTreeMap, fmt};

/// Key-value metadata attached to backend rows.
pub type ExternalIds = BTreeMap<String, String>;

pub const OWNER_CONTROLLER_KEY: &str = "sdn.policy.io/owner-controller";
pub const OWNER_TYPE_KEY: &str = "sdn.policy.io/owner-type";
pub const OWNER_NAME_KEY: &str = "sdn.policy.io/name";
pub const PRIMARY_ID_KEY: &str = "sdn.policy.io/id";

/// Backend names (ACL names in particular) may not exceed this many bytes.
pub const MAX_NAME_LEN: usize = 63;

/// Number of hex characters of digest appended to names that overflow `MAX_NAME_LEN`.
const NAME_DIGEST_LEN: usize = 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    Acl,
    PortGroup,
    AddressSet,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OwnerType {
    /// Owned by a single `NetworkPolicy`.
    NetworkPolicy,
    /// Owned by a namespace's default-deny scaffolding.
    NetpolNamespace,
    /// Cluster-wide network policy defaults.
    NetpolDefault,
    /// Admits traffic from a node's management port to the pods on that node.
    NetpolNode,
    /// Cluster-wide groupings.
    Cluster,
    /// A namespace's address collection.
    Namespace,
    /// A pod-selector (and namespace-selector) address collection.
    PodSelector,
}

/// Secondary indices, declared in the order they appear in primary ids.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexKey {
    PolicyDirection,
    GressIndex,
    PortPolicyIndex,
    IpBlockIndex,
    Role,
    Ip,
}

/// Pairs an object kind with an owner type and the index keys that type carries.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdsType {
    kind: ObjectKind,
    owner_type: OwnerType,
    keys: &'static [IndexKey],
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectIdentity {
    ids_type: IdsType,
    controller: String,
    owner: String,
    indices: BTreeMap<IndexKey, String>,
}

/// Returns a stable, backend-safe hashed name for `s`.
///
/// The first eight bytes of the SHA-256 digest are rendered as a decimal integer prefixed with `a`
/// so that the result is always a valid identifier.
pub fn hash_for_backend(s: &str) -> String {
    let digest = Sha256::digest(s.as_bytes());
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[..8]);
    format!("a{}", u64::from_be_bytes(buf))
}

/// Caps a readable name at `MAX_NAME_LEN`.
///
/// Names that fit are returned untouched. Longer names keep a prefix and are suffixed with a digest
/// of the full name, so two long names sharing a prefix still map to distinct results.
pub fn cap_name(name: String) -> String {
    if name.len() <= MAX_NAME_LEN {
        return name;
    }

    let digest = Sha256::digest(name.as_bytes());
    let suffix = digest[..NAME_DIGEST_LEN / 2]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>();
    let mut prefix_len = MAX_NAME_LEN - NAME_DIGEST_LEN - 1;
    while !name.is_char_boundary(prefix_len) {
        prefix_len -= 1;
    }
    format!("{}_{}", &name[..prefix_len], suffix)
}

// === impl OwnerType ===

impl OwnerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkPolicy => "NetworkPolicy",
            Self::NetpolNamespace => "NetpolNamespace",
            Self::NetpolDefault => "NetpolDefault",
            Self::NetpolNode => "NetpolNode",
            Self::Cluster => "Cluster",
            Self::Namespace => "Namespace",
            Self::PodSelector => "PodSelector",
        }
    }
}

impl fmt::Display for OwnerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

// === impl IndexKey ===

impl IndexKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PolicyDirection => "sdn.policy.io/direction",
            Self::GressIndex => "sdn.policy.io/gress-index",
            Self::PortPolicyIndex => "sdn.policy.io/port-policy-index",
            Self::IpBlockIndex => "sdn.policy.io/ip-block-index",
            Self::Role => "sdn.policy.io/type",
            Self::Ip => "sdn.policy.io/ip",
        }
    }
}

// === impl IdsType ===

impl IdsType {
    pub const ACL_NETWORK_POLICY: Self = Self {
        kind: ObjectKind::Acl,
        owner_type: OwnerType::NetworkPolicy,
        keys: &[
            IndexKey::PolicyDirection,
            IndexKey::GressIndex,
            IndexKey::PortPolicyIndex,
            IndexKey::IpBlockIndex,
        ],
    };

    pub const ACL_NETPOL_NAMESPACE: Self = Self {
        kind: ObjectKind::Acl,
        owner_type: OwnerType::NetpolNamespace,
        keys: &[IndexKey::PolicyDirection, IndexKey::Role],
    };

    pub const ACL_NETPOL_DEFAULT: Self = Self {
        kind: ObjectKind::Acl,
        owner_type: OwnerType::NetpolDefault,
        keys: &[IndexKey::PolicyDirection],
    };

    pub const ACL_NETPOL_NODE: Self = Self {
        kind: ObjectKind::Acl,
        owner_type: OwnerType::NetpolNode,
        keys: &[IndexKey::Ip],
    };

    pub const PORT_GROUP_NETWORK_POLICY: Self = Self {
        kind: ObjectKind::PortGroup,
        owner_type: OwnerType::NetworkPolicy,
        keys: &[],
    };

    pub const PORT_GROUP_NETPOL_NAMESPACE: Self = Self {
        kind: ObjectKind::PortGroup,
        owner_type: OwnerType::NetpolNamespace,
        keys: &[IndexKey::PolicyDirection],
    };

    pub const PORT_GROUP_CLUSTER: Self = Self {
        kind: ObjectKind::PortGroup,
        owner_type: OwnerType::Cluster,
        keys: &[],
    };

    pub const ADDRESS_SET_NAMESPACE: Self = Self {
        kind: ObjectKind::AddressSet,
        owner_type: OwnerType::Namespace,
        keys: &[],
    };

    pub const ADDRESS_SET_POD_SELECTOR: Self = Self {
        kind: ObjectKind::AddressSet,
        owner_type: OwnerType::PodSelector,
        keys: &[],
    };

    const ALL: [Self; 9] = [
        Self::ACL_NETWORK_POLICY,
        Self::ACL_NETPOL_NAMESPACE,
        Self::ACL_NETPOL_DEFAULT,
        Self::ACL_NETPOL_NODE,
        Self::PORT_GROUP_NETWORK_POLICY,
        Self::PORT_GROUP_NETPOL_NAMESPACE,
        Self::PORT_GROUP_CLUSTER,
        Self::ADDRESS_SET_NAMESPACE,
        Self::ADDRESS_SET_POD_SELECTOR,
    ];

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn owner_type(&self) -> OwnerType {
        self.owner_type
    }

    pub fn keys(&self) -> &'static [IndexKey] {
        self.keys
    }

    fn lookup(kind: ObjectKind, owner_type: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.kind == kind && t.owner_type.as_str() == owner_type)
    }
}

// === impl ObjectIdentity ===

impl ObjectIdentity {
    pub fn new(ids_type: IdsType, controller: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            ids_type,
            controller: controller.into(),
            owner: owner.into(),
            indices: BTreeMap::new(),
        }
    }

    /// Sets a secondary index.
    ///
    /// Keys that the ids type does not declare are ignored; they would not participate in the
    /// primary id and could otherwise make two distinct identities render the same name.
    pub fn with_index(mut self, key: IndexKey, value: impl ToString) -> Self {
        debug_assert!(
            self.ids_type.keys.contains(&key),
            "{key:?} is not an index of {:?}",
            self.ids_type
        );
        if self.ids_type.keys.contains(&key) {
            self.indices.insert(key, value.to_string());
        }
        self
    }

    pub fn ids_type(&self) -> IdsType {
        self.ids_type
    }

    pub fn controller(&self) -> &str {
        &self.controller
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn index(&self, key: IndexKey) -> Option<&str> {
        self.indices.get(&key).map(String::as_str)
    }

    /// The unique key of this identity: `controller:owner-type:owner[:index...]`.
    pub fn primary_id(&self) -> String {
        let mut id = format!(
            "{}:{}:{}",
            self.controller, self.ids_type.owner_type, self.owner
        );
        for key in self.ids_type.keys {
            id.push(':');
            if let Some(v) = self.indices.get(key) {
                id.push_str(v);
            }
        }
        id
    }

    pub fn external_ids(&self) -> ExternalIds {
        let mut ids = ExternalIds::new();
        ids.insert(OWNER_CONTROLLER_KEY.to_string(), self.controller.clone());
        ids.insert(
            OWNER_TYPE_KEY.to_string(),
            self.ids_type.owner_type.as_str().to_string(),
        );
        ids.insert(OWNER_NAME_KEY.to_string(), self.owner.clone());
        ids.insert(PRIMARY_ID_KEY.to_string(), self.primary_id());
        for (key, value) in &self.indices {
            ids.insert(key.as_str().to_string(), value.clone());
        }
        ids
    }

    /// Recomputes an identity from a row's external ids.
    ///
    /// Returns `None` when the row was not written with this scheme, or when the stored primary id
    /// disagrees with the one recomputed from the individual keys (i.e. the row was tampered with
    /// or written by an incompatible version).
    pub fn from_external_ids(kind: ObjectKind, ids: &ExternalIds) -> Option<Self> {
        let controller = ids.get(OWNER_CONTROLLER_KEY)?;
        let ids_type = IdsType::lookup(kind, ids.get(OWNER_TYPE_KEY)?)?;
        let owner = ids.get(OWNER_NAME_KEY)?;

        let mut identity = Self::new(ids_type, controller.clone(), owner.clone());
        for key in ids_type.keys {
            if let Some(value) = ids.get(key.as_str()) {
                identity.indices.insert(*key, value.clone());
            }
        }

        if ids.get(PRIMARY_ID_KEY) != Some(&identity.primary_id()) {
            return None;
        }
        Some(identity)
    }

    /// Returns true if this identity belongs to the owner described by `predicate`.
    ///
    /// The ids type and controller must match exactly. An empty predicate owner matches any owner,
    /// and only the indices set on the predicate are compared.
    pub fn has_prefix(&self, predicate: &Self) -> bool {
        if self.ids_type != predicate.ids_type || self.controller != predicate.controller {
            return false;
        }
        if !predicate.owner.is_empty() && self.owner != predicate.owner {
            return false;
        }
        predicate
            .indices
            .iter()
            .all(|(k, v)| self.indices.get(k) == Some(v))
    }

    /// The human-readable form of the name, before any length capping or hashing.
    pub fn readable_name(&self) -> String {
        let idx = |key| self.index(key).unwrap_or("");
        match self.ids_type.owner_type {
            OwnerType::NetworkPolicy if self.ids_type.kind == ObjectKind::Acl => {
                let mut name = format!(
                    "NP:{}:{}:{}",
                    self.owner,
                    idx(IndexKey::PolicyDirection),
                    idx(IndexKey::GressIndex),
                );
                for key in [IndexKey::PortPolicyIndex, IndexKey::IpBlockIndex] {
                    let v = idx(key);
                    if !v.is_empty() && v != "-1" {
                        name.push(':');
                        name.push_str(v);
                    }
                }
                name
            }
            OwnerType::NetworkPolicy => self.owner.replacen(':', "_", 1),
            OwnerType::NetpolNamespace if self.ids_type.kind == ObjectKind::Acl => format!(
                "NP:{}:{}:{}",
                self.owner,
                idx(IndexKey::PolicyDirection),
                idx(IndexKey::Role)
            ),
            OwnerType::NetpolNamespace => format!(
                "{}_{}",
                self.owner,
                default_deny_suffix(idx(IndexKey::PolicyDirection))
            ),
            // Hairpin ACLs are unnamed.
            OwnerType::NetpolDefault => String::new(),
            OwnerType::NetpolNode => format!("NPNode:{}:{}", self.owner, idx(IndexKey::Ip)),
            OwnerType::Cluster | OwnerType::Namespace | OwnerType::PodSelector => {
                self.owner.clone()
            }
        }
    }

    /// The canonical backend name of the object.
    pub fn short_name(&self) -> String {
        match self.ids_type.kind {
            ObjectKind::Acl => cap_name(self.readable_name()),
            ObjectKind::PortGroup => match self.ids_type.owner_type {
                OwnerType::NetpolNamespace => format!(
                    "{}_{}",
                    hash_for_backend(&self.owner),
                    default_deny_suffix(self.index(IndexKey::PolicyDirection).unwrap_or(""))
                ),
                _ => hash_for_backend(&self.readable_name()),
            },
            ObjectKind::AddressSet => self.address_set_names().0,
        }
    }

    /// The hashed IPv4 and IPv6 names of an address collection.
    pub fn address_set_names(&self) -> (String, String) {
        let id = self.primary_id();
        (
            hash_for_backend(&format!("{id}_v4")),
            hash_for_backend(&format!("{id}_v6")),
        )
    }
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.primary_id().fmt(f)
    }
}

fn default_deny_suffix(direction: &str) -> &'static str {
    if direction == "Egress" {
        "egressDefaultDeny"
    } else {
        "ingressDefaultDeny"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_acl(ns: &str, name: &str, gress: i32, port: i32, block: i32) -> ObjectIdentity {
        ObjectIdentity::new(
            IdsType::ACL_NETWORK_POLICY,
            "default-network-controller",
            format!("{ns}:{name}"),
        )
        .with_index(IndexKey::PolicyDirection, "Ingress")
        .with_index(IndexKey::GressIndex, gress)
        .with_index(IndexKey::PortPolicyIndex, port)
        .with_index(IndexKey::IpBlockIndex, block)
    }

    #[test]
    fn short_names_are_deterministic() {
        let a = policy_acl("ns1", "pol", 0, -1, -1);
        let b = policy_acl("ns1", "pol", 0, -1, -1);
        assert_eq!(a, b);
        assert_eq!(a.short_name(), b.short_name());
        assert_eq!(a.short_name(), "NP:ns1:pol:Ingress:0");
        assert_eq!(
            policy_acl("ns1", "pol", 0, 2, -1).short_name(),
            "NP:ns1:pol:Ingress:0:2"
        );
    }

    #[test]
    fn distinct_indices_never_collide() {
        let ids = [
            policy_acl("ns1", "pol", 0, -1, -1),
            policy_acl("ns1", "pol", 0, 0, -1),
            policy_acl("ns1", "pol", 0, -1, 0),
            policy_acl("ns1", "pol", 1, -1, -1),
        ];
        let names = ids
            .iter()
            .map(ObjectIdentity::short_name)
            .collect::<std::collections::BTreeSet<_>>();
        assert_eq!(names.len(), ids.len());
        let primary = ids
            .iter()
            .map(ObjectIdentity::primary_id)
            .collect::<std::collections::BTreeSet<_>>();
        assert_eq!(primary.len(), ids.len());
    }

    #[test]
    fn long_names_are_capped_without_collisions() {
        let ns = "abcdefghijklmnopqrstuvwxyzabcdefghijklmnopqrstuvwxyzabcdefghijk";
        assert_eq!(ns.len(), 63);
        let a = policy_acl(ns, "networkpolicy1", 0, -1, -1).short_name();
        let b = policy_acl(ns, "networkpolicy1", 0, 1, -1).short_name();
        assert!(a.len() <= MAX_NAME_LEN, "{a}");
        assert!(b.len() <= MAX_NAME_LEN, "{b}");
        assert_ne!(a, b);
        assert!(a.starts_with("NP:abcdefghij"));
    }

    #[test]
    fn identity_round_trips_through_external_ids() {
        let ids = [
            policy_acl("ns1", "pol", 3, 1, -1),
            ObjectIdentity::new(IdsType::ACL_NETPOL_NAMESPACE, "ctrl", "ns1")
                .with_index(IndexKey::PolicyDirection, "Egress")
                .with_index(IndexKey::Role, "defaultDeny"),
            ObjectIdentity::new(IdsType::PORT_GROUP_NETWORK_POLICY, "ctrl", "ns1:pol"),
            ObjectIdentity::new(IdsType::ACL_NETPOL_NODE, "ctrl", "node1")
                .with_index(IndexKey::Ip, "fd01::1234"),
        ];
        for id in ids {
            let kind = id.ids_type().kind();
            let parsed = ObjectIdentity::from_external_ids(kind, &id.external_ids())
                .expect("identity must parse");
            assert_eq!(parsed, id);
        }
    }

    #[test]
    fn tampered_external_ids_are_rejected() {
        let id = policy_acl("ns1", "pol", 0, -1, -1);
        let mut ext = id.external_ids();
        ext.insert(IndexKey::GressIndex.as_str().to_string(), "7".to_string());
        assert_eq!(ObjectIdentity::from_external_ids(ObjectKind::Acl, &ext), None);
        assert_eq!(
            ObjectIdentity::from_external_ids(ObjectKind::PortGroup, &id.external_ids()),
            None,
            "an ACL identity must not parse as a port group"
        );
    }

    #[test]
    fn prefix_matching() {
        let id = policy_acl("ns1", "pol", 0, -1, -1);
        let any_policy = ObjectIdentity::new(
            IdsType::ACL_NETWORK_POLICY,
            "default-network-controller",
            "",
        );
        assert!(id.has_prefix(&any_policy));
        let ingress = ObjectIdentity::new(
            IdsType::ACL_NETWORK_POLICY,
            "default-network-controller",
            "ns1:pol",
        )
        .with_index(IndexKey::PolicyDirection, "Ingress");
        assert!(id.has_prefix(&ingress));
        let egress = ingress.with_index(IndexKey::PolicyDirection, "Egress");
        assert!(!id.has_prefix(&egress));
    }

    #[test]
    fn port_group_names_are_hashed() {
        let pg = ObjectIdentity::new(IdsType::PORT_GROUP_NETWORK_POLICY, "ctrl", "ns1:pol");
        assert_eq!(pg.readable_name(), "ns1_pol");
        assert_eq!(pg.short_name(), hash_for_backend("ns1_pol"));

        let deny = ObjectIdentity::new(IdsType::PORT_GROUP_NETPOL_NAMESPACE, "ctrl", "ns1")
            .with_index(IndexKey::PolicyDirection, "Egress");
        assert_eq!(
            deny.short_name(),
            format!("{}_egressDefaultDeny", hash_for_backend("ns1"))
        );
    }

    #[test]
    fn node_and_hairpin_acl_names() {
        let node = ObjectIdentity::new(IdsType::ACL_NETPOL_NODE, "ctrl", "node1")
            .with_index(IndexKey::Ip, "192.168.10.10");
        assert_eq!(node.short_name(), "NPNode:node1:192.168.10.10");
        assert_eq!(node.primary_id(), "ctrl:NetpolNode:node1:192.168.10.10");

        let hairpin = ObjectIdentity::new(IdsType::ACL_NETPOL_DEFAULT, "ctrl", "")
            .with_index(IndexKey::PolicyDirection, "Egress");
        assert_eq!(hairpin.short_name(), "");
        assert_eq!(hairpin.primary_id(), "ctrl:NetpolDefault::Egress");
    }
}
