use sdn_policy_controller_k8s_api::{self as k8s, Labels};

/// The indexed state of a pod.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Pod {
    pub labels: Labels,
    pub logical_port: String,

    /// Only scheduled, running pods on the cluster network are subject to policy.
    pub selectable: bool,
}

pub fn logical_port(namespace: &str, name: &str) -> String {
    format!("{namespace}_{name}")
}

// === impl Pod ===

impl Pod {
    pub(crate) fn from_resource(pod: &k8s::Pod, namespace: &str, name: &str) -> Self {
        let scheduled = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.node_name.as_deref())
            .is_some_and(|node| !node.is_empty());
        let host_network = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.host_network)
            .unwrap_or(false);
        let completed = matches!(
            pod.status.as_ref().and_then(|s| s.phase.as_deref()),
            Some("Succeeded" | "Failed")
        );

        Self {
            labels: pod.metadata.labels.clone().into(),
            logical_port: logical_port(namespace, name),
            selectable: scheduled && !host_network && !completed,
        }
    }
}
