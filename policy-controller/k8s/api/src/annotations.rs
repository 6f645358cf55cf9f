use crate::ObjectMeta;
use anyhow::{Context, Result};
use serde::Deserialize;

/// Namespace annotation configuring ACL log severities, e.g. `{"deny": "alert", "allow": "notice"}`.
pub const ACL_LOGGING: &str = "sdn.policy.io/acl-logging";

/// Policy annotation opting the policy into stateless allow ACLs.
pub const ACL_STATELESS: &str = "sdn.policy.io/acl-stateless";

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct AclLoggingAnnotation {
    #[serde(default)]
    pub deny: Option<String>,
    #[serde(default)]
    pub allow: Option<String>,
}

/// Parses the namespace's ACL logging annotation, if set.
pub fn acl_logging(meta: &ObjectMeta) -> Result<Option<AclLoggingAnnotation>> {
    let Some(value) = meta.annotations.as_ref().and_then(|a| a.get(ACL_LOGGING)) else {
        return Ok(None);
    };
    let parsed = serde_json::from_str(value)
        .with_context(|| format!("invalid {ACL_LOGGING} annotation: {value}"))?;
    Ok(Some(parsed))
}

/// Returns true if the policy opts into stateless ACLs.
pub fn acl_stateless(meta: &ObjectMeta) -> bool {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(ACL_STATELESS))
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
