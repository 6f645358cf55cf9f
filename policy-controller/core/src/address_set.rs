use crate::identity::{IdsType, ObjectIdentity};
use std::fmt;

/// A reference to an address collection, which the backend materializes as a pair of per-family
/// sets named by a stable hash of the identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressSetRef {
    id: ObjectIdentity,
    v4: String,
    v6: String,
}

impl AddressSetRef {
    pub fn new(id: ObjectIdentity) -> Self {
        let (v4, v6) = id.address_set_names();
        Self { id, v4, v6 }
    }

    /// The collection holding every pod address in a namespace.
    pub fn namespace(controller: &str, namespace: &str) -> Self {
        Self::new(ObjectIdentity::new(
            IdsType::ADDRESS_SET_NAMESPACE,
            controller,
            namespace,
        ))
    }

    /// The collection holding the addresses selected by a peer's pod (and namespace) selector.
    ///
    /// `selector` must be a canonical rendering of the selectors so that equivalent peers share a
    /// collection.
    pub fn pod_selector(controller: &str, selector: &str) -> Self {
        Self::new(ObjectIdentity::new(
            IdsType::ADDRESS_SET_POD_SELECTOR,
            controller,
            selector,
        ))
    }

    pub fn identity(&self) -> &ObjectIdentity {
        &self.id
    }

    pub fn v4_name(&self) -> &str {
        &self.v4
    }

    pub fn v6_name(&self) -> &str {
        &self.v6
    }
}

impl fmt::Display for AddressSetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.id.fmt(f)
    }
}
