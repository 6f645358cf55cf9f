use crate::identity::{ExternalIds, ObjectIdentity, ObjectKind, PRIMARY_ID_KEY};
use anyhow::{bail, Result};
use std::{collections::BTreeMap, fmt, str::FromStr};

pub const DEFAULT_DENY_PRIORITY: u16 = 1000;
pub const DEFAULT_ALLOW_PRIORITY: u16 = 1001;

/// Meter applied to every ACL so that logging is rate limited.
pub const ACL_LOGGING_METER: &str = "acl-logging";

/// Option that makes egress ACLs evaluate after load balancing.
pub const APPLY_AFTER_LB: &str = "apply-after-lb";

/// The direction of a policy rule, relative to the selected pods.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PolicyDirection {
    Ingress,
    Egress,
}

/// The direction an ACL is evaluated in, relative to the logical switch port.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AclDirection {
    ToLport,
    FromLport,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AclAction {
    Allow,
    AllowRelated,
    AllowStateless,
    Drop,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Severity {
    Alert,
    Warning,
    Notice,
    Info,
    Debug,
}

/// Per-namespace ACL logging configuration.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct AclLogging {
    pub deny: Option<Severity>,
    pub allow: Option<Severity>,
}

/// Distinguishes the namespace-scoped ACLs that share an owner and direction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AclRole {
    DefaultDeny,
    ArpAllow,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Acl {
    pub name: String,
    pub direction: AclDirection,
    pub priority: u16,
    pub match_expr: String,
    pub action: AclAction,
    pub log: bool,
    pub severity: Option<Severity>,
    pub meter: Option<String>,
    pub options: BTreeMap<String, String>,
    pub external_ids: ExternalIds,
}

// === impl PolicyDirection ===

impl PolicyDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingress => "Ingress",
            Self::Egress => "Egress",
        }
    }

    /// Ingress policy is enforced as traffic leaves the switch towards the pod; egress policy as
    /// traffic enters the switch from the pod.
    pub fn acl_direction(&self) -> AclDirection {
        match self {
            Self::Ingress => AclDirection::ToLport,
            Self::Egress => AclDirection::FromLport,
        }
    }

    /// The clause restricting an ACL to the ports of a port group.
    pub fn port_match(&self, port_group: &str) -> String {
        match self {
            Self::Ingress => format!("outport == @{port_group}"),
            Self::Egress => format!("inport == @{port_group}"),
        }
    }

    /// The address field that identifies the remote peer.
    pub fn peer_field(&self) -> &'static str {
        match self {
            Self::Ingress => "src",
            Self::Egress => "dst",
        }
    }

    pub fn acl_options(&self) -> BTreeMap<String, String> {
        let mut options = BTreeMap::new();
        if *self == Self::Egress {
            options.insert(APPLY_AFTER_LB.to_string(), "true".to_string());
        }
        options
    }
}

impl fmt::Display for PolicyDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

impl FromStr for PolicyDirection {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Ingress" => Ok(Self::Ingress),
            "Egress" => Ok(Self::Egress),
            s => bail!("invalid policy direction: {s}"),
        }
    }
}

// === impl AclDirection ===

impl AclDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToLport => "to-lport",
            Self::FromLport => "from-lport",
        }
    }
}

// === impl AclAction ===

impl AclAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::AllowRelated => "allow-related",
            Self::AllowStateless => "allow-stateless",
            Self::Drop => "drop",
        }
    }

    pub fn is_allow(&self) -> bool {
        !matches!(self, Self::Drop)
    }
}

// === impl Severity ===

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alert => "alert",
            Self::Warning => "warning",
            Self::Notice => "notice",
            Self::Info => "info",
            Self::Debug => "debug",
        }
    }
}

impl FromStr for Severity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "alert" => Ok(Self::Alert),
            "warning" => Ok(Self::Warning),
            "notice" => Ok(Self::Notice),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            s => bail!("invalid ACL log severity: {s}"),
        }
    }
}

// === impl AclRole ===

impl AclRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DefaultDeny => "defaultDeny",
            Self::ArpAllow => "arpAllow",
        }
    }
}

// === impl Acl ===

impl Acl {
    /// Builds an ACL whose name and external ids are derived from `id`.
    ///
    /// Logging is enabled iff a severity is configured.
    pub fn build(
        id: &ObjectIdentity,
        direction: AclDirection,
        priority: u16,
        match_expr: impl Into<String>,
        action: AclAction,
        severity: Option<Severity>,
        options: BTreeMap<String, String>,
    ) -> Self {
        Self {
            name: id.short_name(),
            direction,
            priority,
            match_expr: match_expr.into(),
            action,
            log: severity.is_some(),
            severity,
            meter: Some(ACL_LOGGING_METER.to_string()),
            options,
            external_ids: id.external_ids(),
        }
    }

    /// The primary id recorded on the ACL, if it was written with the identity scheme.
    pub fn key(&self) -> Option<&str> {
        self.external_ids.get(PRIMARY_ID_KEY).map(String::as_str)
    }

    pub fn identity(&self) -> Option<ObjectIdentity> {
        ObjectIdentity::from_external_ids(ObjectKind::Acl, &self.external_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{IdsType, IndexKey};

    #[test]
    fn build_derives_name_and_ids() {
        let id = ObjectIdentity::new(IdsType::ACL_NETPOL_NAMESPACE, "ctrl", "ns1")
            .with_index(IndexKey::PolicyDirection, PolicyDirection::Egress)
            .with_index(IndexKey::Role, AclRole::DefaultDeny.as_str());
        let acl = Acl::build(
            &id,
            PolicyDirection::Egress.acl_direction(),
            DEFAULT_DENY_PRIORITY,
            "inport == @pg",
            AclAction::Drop,
            Some(Severity::Alert),
            PolicyDirection::Egress.acl_options(),
        );
        assert_eq!(acl.name, "NP:ns1:Egress:defaultDeny");
        assert_eq!(acl.direction, AclDirection::FromLport);
        assert!(acl.log);
        assert_eq!(acl.options.get(APPLY_AFTER_LB).map(String::as_str), Some("true"));
        assert_eq!(acl.identity(), Some(id.clone()));
        assert_eq!(acl.key(), Some(id.primary_id().as_str()));
    }

    #[test]
    fn parse_severity() {
        assert_eq!("alert".parse::<Severity>().unwrap(), Severity::Alert);
        assert_eq!("debug".parse::<Severity>().unwrap(), Severity::Debug);
        assert!("loud".parse::<Severity>().is_err());
    }
}
