//! SDN Policy Controller Index
//!
//! Indexes the cluster resources that determine which firewall objects must exist in the SDN
//! backend:
//!
//! - Each `NetworkPolicy` selects pods in its namespace. Its rules admit peers selected by pod and
//!   namespace labels, literal CIDRs, and port restrictions.
//! - Each `Pod` contributes a logical port to the groups of the policies selecting it and to its
//!   namespace's default-deny groups.
//! - Each `Namespace` carries labels that namespace selectors match against, and may be annotated
//!   with ACL logging severities.
//! - Each `Node` has a management port whose traffic is always admitted to the node's pods.
//!
//! ```text
//! [ Namespace ] <- [ NetworkPolicy ] -> [ Pod ]
//! ```
//!
//! Updates are translated into reconcile [`Key`]s, published on a channel. The index compiles the
//! desired backend state of a key on demand.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cluster_info;
pub mod compiler;
mod index;
pub mod metrics;
mod namespace;
mod node;
pub mod pod;
pub mod policy;


pub use self::{
    cluster_info::ClusterInfo,
    compiler::Desired,
    index::{Index, SharedIndex, Synced},
};
use std::fmt;

/// Identifies a unit of reconciliation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
    /// A policy's port group and rule ACLs.
    Policy { namespace: String, name: String },

    /// A namespace's default-deny scaffolding, shared by all of its policies.
    Namespace(String),

    /// The cluster-wide hairpin ACLs.
    ClusterDefaults,

    /// The ACLs admitting a node's management port traffic, attached to its switch.
    Node(String),
}

// === impl Key ===

impl Key {
    pub fn policy(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Policy {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Policy { .. } => "policy",
            Self::Namespace(_) => "namespace",
            Self::ClusterDefaults => "cluster",
            Self::Node(_) => "node",
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        match self {
            Self::Policy { namespace, .. } | Self::Namespace(namespace) => Some(namespace),
            Self::ClusterDefaults | Self::Node(_) => None,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Policy { namespace, name } => write!(f, "policy/{namespace}/{name}"),
            Self::Namespace(namespace) => write!(f, "namespace/{namespace}"),
            Self::ClusterDefaults => f.write_str("cluster"),
            Self::Node(name) => write!(f, "node/{name}"),
        }
    }
}
