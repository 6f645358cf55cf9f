use crate::{index::PolicyState, pod::Pod};
use ahash::AHashMap as HashMap;
use sdn_policy_controller_core::{AclLogging, PolicyDirection, Severity};
use sdn_policy_controller_k8s_api::{self as k8s, annotations, Labels, ResourceExt, Selector};
use std::collections::BTreeSet;

/// Everything indexed within a single namespace.
///
/// Pods and policies may be indexed before the namespace resource itself has been observed.
#[derive(Debug, Default)]
pub(crate) struct Namespace {
    /// `None` until the namespace resource has been observed.
    pub labels: Option<Labels>,
    pub logging: AclLogging,
    pub pods: HashMap<String, Pod>,
    pub policies: HashMap<String, PolicyState>,
}

// === impl Namespace ===

impl Namespace {
    pub(crate) fn is_empty(&self) -> bool {
        self.labels.is_none() && self.pods.is_empty() && self.policies.is_empty()
    }

    /// The logical ports of the selectable pods matching `selector`.
    pub(crate) fn selected_ports(&self, selector: &Selector) -> BTreeSet<String> {
        self.pods
            .values()
            .filter(|pod| pod.selectable && selector.matches(&pod.labels))
            .map(|pod| pod.logical_port.clone())
            .collect()
    }

    /// The logical ports of pods isolated in `direction` by at least one policy.
    pub(crate) fn isolated_ports(&self, direction: PolicyDirection) -> BTreeSet<String> {
        self.policies
            .values()
            .filter(|state| state.policy.isolates(direction))
            .flat_map(|state| self.selected_ports(&state.policy.pod_selector))
            .collect()
    }
}

/// Reads the ACL logging configuration of a namespace.
///
/// Invalid configuration disables logging for the affected action rather than failing.
pub(crate) fn parse_logging(ns: &k8s::Namespace) -> AclLogging {
    let name = ns.name_unchecked();
    let annotation = match annotations::acl_logging(&ns.metadata) {
        Ok(Some(annotation)) => annotation,
        Ok(None) => return AclLogging::default(),
        Err(error) => {
            tracing::warn!(namespace = %name, %error, "Ignoring ACL logging annotation");
            return AclLogging::default();
        }
    };

    let severity = |value: Option<String>| {
        let value = value.filter(|v| !v.is_empty())?;
        match value.parse::<Severity>() {
            Ok(severity) => Some(severity),
            Err(error) => {
                tracing::warn!(namespace = %name, %error, "Ignoring ACL log severity");
                None
            }
        }
    };

    AclLogging {
        deny: severity(annotation.deny),
        allow: severity(annotation.allow),
    }
}
