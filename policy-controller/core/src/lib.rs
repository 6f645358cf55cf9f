#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod acl;
pub mod address_set;
pub mod backend;
pub mod gress;
pub mod identity;
pub mod port;
pub mod port_group;

pub use self::{
    acl::{Acl, AclAction, AclDirection, AclLogging, AclRole, PolicyDirection, Severity},
    address_set::AddressSetRef,
    backend::{Backend, BackendError, LogicalSwitch, MemoryBackend, Op, Row},
    gress::{GressRule, IpBlock},
    identity::{ExternalIds, IdsType, IndexKey, ObjectIdentity, ObjectKind, OwnerType},
    port::{PortRestriction, Protocol},
    port_group::PortGroup,
};
pub use ipnet::{IpNet, Ipv4Net, Ipv6Net};

pub const DEFAULT_CONTROLLER_NAME: &str = "default-network-controller";

/// The IP families the cluster network carries.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct IpMode {
    pub ipv4: bool,
    pub ipv6: bool,
}

impl Default for IpMode {
    fn default() -> Self {
        Self {
            ipv4: true,
            ipv6: false,
        }
    }
}
