use crate::{
    index::{ClusterInfo, Index, Key, SharedIndex},
    k8s::{
        self, LabelSelector, NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule,
        NetworkPolicyPeer, NetworkPolicyPort, NetworkPolicySpec, ObjectMeta, PodSpec, PodStatus,
    },
};
use maplit::btreemap;
use sdn_policy_controller_core::{IpMode, DEFAULT_CONTROLLER_NAME};
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, time};

pub fn index() -> (SharedIndex, mpsc::UnboundedReceiver<Key>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let cluster = ClusterInfo {
        controller_name: DEFAULT_CONTROLLER_NAME.to_string(),
        ip_mode: IpMode::default(),
    };
    (Index::shared(Arc::new(cluster), tx), rx)
}

pub fn mk_ns(name: &str, label: (&str, &str)) -> k8s::Namespace {
    k8s::Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(btreemap! { label.0.to_string() => label.1.to_string() }),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn mk_pod(ns: &str, name: &str) -> k8s::Pod {
    k8s::Pod {
        metadata: ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some("node-0".to_string()),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        }),
    }
}

pub fn mk_node(name: &str, cidr: &str) -> k8s::Node {
    k8s::Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(k8s::NodeSpec {
            pod_cidrs: Some(vec![cidr.to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Selects every pod in `ns`, admits ingress from namespaces labeled `name=ns2` and egress to
/// TCP port 81.
pub fn mk_policy(ns: &str, name: &str) -> NetworkPolicy {
    NetworkPolicy {
        metadata: ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(NetworkPolicySpec {
            pod_selector: Default::default(),
            policy_types: Some(vec!["Ingress".to_string(), "Egress".to_string()]),
            ingress: Some(vec![NetworkPolicyIngressRule {
                from: Some(vec![NetworkPolicyPeer {
                    namespace_selector: Some(LabelSelector {
                        match_labels: Some(btreemap! {
                            "name".to_string() => "ns2".to_string(),
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
            egress: Some(vec![NetworkPolicyEgressRule {
                ports: Some(vec![NetworkPolicyPort {
                    port: Some(k8s::IntOrString::Int(81)),
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
        }),
    }
}

/// Polls `f` until it holds, letting (paused) time advance in small steps.
pub async fn until(what: &str, mut f: impl FnMut() -> bool) {
    for _ in 0..100_000 {
        if f() {
            return;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
