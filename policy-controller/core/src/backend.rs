use crate::{acl::Acl, port_group::PortGroup};
use std::{collections::BTreeSet, sync::Arc, time::Duration};

mod memory;

pub use self::memory::MemoryBackend;

/// A single write in a backend transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    /// Creates the ACL, or updates the existing row carrying the same primary id.
    UpsertAcl(Acl),
    /// Rewrites an existing row in place.
    UpdateAcl { uuid: String, acl: Acl },
    /// Creates the port group, or replaces the ports and ACLs of the existing group with this name.
    UpsertPortGroup(PortGroup),
    /// Attaches ACLs (by primary id) to a logical switch owned by another component, keeping the
    /// ACLs already attached to it.
    AddAclsToSwitch { switch: String, acls: BTreeSet<String> },
    DeletePortGroup { name: String },
}

/// A stored row and its backend-assigned UUID.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Row<T> {
    pub uuid: String,
    pub row: T,
}

/// A node's logical switch. Switches are created and removed by node management; this controller
/// only attaches ACLs to them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogicalSwitch {
    pub name: String,
    pub acls: BTreeSet<String>,
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend is disconnected")]
    Disconnected,

    #[error("transaction timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0} does not exist yet")]
    Missing(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("fatal backend error: {0}")]
    Fatal(String),
}

/// The transactional database holding ACLs and port groups.
///
/// A transaction commits all of its operations or none of them.
#[async_trait::async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn transact(&self, ops: Vec<Op>) -> Result<(), BackendError>;

    async fn list_acls(&self) -> Result<Vec<Row<Acl>>, BackendError>;

    async fn list_port_groups(&self) -> Result<Vec<Row<PortGroup>>, BackendError>;

    fn is_connected(&self) -> bool;
}

// === impl BackendError ===

impl BackendError {
    /// Transient errors are expected to resolve on their own.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Timeout(_) | Self::Missing(_))
    }
}

// === impl Backend ===

#[async_trait::async_trait]
impl<B: Backend + ?Sized> Backend for Arc<B> {
    async fn transact(&self, ops: Vec<Op>) -> Result<(), BackendError> {
        (**self).transact(ops).await
    }

    async fn list_acls(&self) -> Result<Vec<Row<Acl>>, BackendError> {
        (**self).list_acls().await
    }

    async fn list_port_groups(&self) -> Result<Vec<Row<PortGroup>>, BackendError> {
        (**self).list_port_groups().await
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}
