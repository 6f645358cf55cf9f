//! The cluster-state index.
//!
//! Watches on namespaces, pods, network policies and nodes update the index. Each update records the
//! reconcile keys whose desired backend state may have changed and publishes them to the engine;
//! the engine later calls [`Index::compile`] to obtain the current desired state of a key. Keys
//! are coarse: it is always safe to emit a key whose state did not actually change.

use crate::{
    compiler::{self, Desired},
    namespace::{self, Namespace},
    pod::Pod,
    policy::{Policy, Rule, RuleTerm, SelectorPeer},
    ClusterInfo, Key,
};
use ahash::AHashMap as HashMap;
use kubert::index::{ClusterRemoved, NamespacedRemoved};
use parking_lot::RwLock;
use sdn_policy_controller_core::{AddressSetRef, AclLogging, GressRule, PolicyDirection};
use sdn_policy_controller_k8s_api::{self as k8s, Labels, ResourceExt};
use std::{collections::BTreeSet, net::IpAddr, sync::Arc};
use tokio::sync::{mpsc::UnboundedSender, watch};

pub type SharedIndex = Arc<RwLock<Index>>;

#[derive(Debug)]
pub struct Index {
    cluster_info: Arc<ClusterInfo>,
    namespaces: HashMap<String, Namespace>,
    /// Management port addresses by node name. Nodes without one are not tracked.
    pub(crate) nodes: HashMap<String, Vec<IpAddr>>,
    reconciles: UnboundedSender<Key>,
    synced: watch::Sender<Synced>,
}

/// Tracks which watches have completed their initial list.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Synced {
    pub namespaces: bool,
    pub pods: bool,
    pub policies: bool,
    pub nodes: bool,
}

/// A policy and the per-rule state derived from it, in the order of [`Policy::rules`].
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct PolicyState {
    pub policy: Policy,
    pub rules: Vec<GressRule>,
}

// === impl Synced ===

impl Synced {
    pub fn all(&self) -> bool {
        self.namespaces && self.pods && self.policies && self.nodes
    }
}

// === impl Index ===

impl Index {
    pub fn new(cluster_info: Arc<ClusterInfo>, reconciles: UnboundedSender<Key>) -> Self {
        let (synced, _) = watch::channel(Synced::default());
        let index = Self {
            cluster_info,
            namespaces: HashMap::default(),
            nodes: HashMap::default(),
            reconciles,
            synced,
        };
        index.enqueue(Key::ClusterDefaults);
        index
    }

    pub fn shared(cluster_info: Arc<ClusterInfo>, reconciles: UnboundedSender<Key>) -> SharedIndex {
        Arc::new(RwLock::new(Self::new(cluster_info, reconciles)))
    }

    pub fn cluster_info(&self) -> &ClusterInfo {
        &self.cluster_info
    }

    /// Watches the initial-list state of the index's resource watches.
    pub fn synced(&self) -> watch::Receiver<Synced> {
        self.synced.subscribe()
    }

    /// Every key that currently has desired state.
    pub fn keys(&self) -> Vec<Key> {
        let mut keys = vec![Key::ClusterDefaults];
        for (ns_name, ns) in self.namespaces.iter() {
            if ns.policies.is_empty() {
                continue;
            }
            keys.push(Key::Namespace(ns_name.clone()));
            keys.extend(ns.policies.keys().map(|name| Key::policy(ns_name, name)));
        }
        keys.extend(self.node_names().cloned().map(Key::Node));
        keys.sort();
        keys
    }

    /// Compiles the current desired state of `key`.
    pub fn compile(&self, key: &Key) -> Desired {
        match key {
            Key::Policy { namespace, name } => {
                let found = self
                    .namespaces
                    .get(namespace)
                    .and_then(|ns| ns.policies.get(name).map(|state| (ns, state)));
                match found {
                    None => compiler::policy_absent(&self.cluster_info, namespace, name),
                    Some((ns, state)) => Desired::Policy(compiler::compile_policy(
                        &self.cluster_info,
                        namespace,
                        name,
                        &state.rules,
                        ns.selected_ports(&state.policy.pod_selector),
                        ns.logging,
                    )),
                }
            }

            Key::Namespace(namespace) => {
                match self
                    .namespaces
                    .get(namespace)
                    .filter(|ns| !ns.policies.is_empty())
                {
                    None => compiler::namespace_absent(&self.cluster_info, namespace),
                    Some(ns) => Desired::Namespace(compiler::namespace_defaults(
                        &self.cluster_info,
                        namespace,
                        ns.isolated_ports(PolicyDirection::Ingress),
                        ns.isolated_ports(PolicyDirection::Egress),
                        ns.logging,
                    )),
                }
            }

            Key::ClusterDefaults => {
                let ports = self
                    .namespaces
                    .values()
                    .flat_map(|ns| ns.pods.values())
                    .filter(|pod| pod.selectable)
                    .map(|pod| pod.logical_port.clone())
                    .collect();
                Desired::ClusterDefaults(compiler::cluster_defaults(&self.cluster_info, ports))
            }

            Key::Node(name) => match self.node_ips(name) {
                None => Desired::NodeAbsent,
                Some(ips) => Desired::Node(compiler::node_acls(&self.cluster_info, name, ips)),
            },
        }
    }

    pub(crate) fn namespaces(&self) -> impl Iterator<Item = (&String, &Namespace)> {
        self.namespaces.iter()
    }

    pub(crate) fn enqueue(&self, key: Key) {
        tracing::trace!(?key, "Enqueueing");
        if self.reconciles.send(key).is_err() {
            tracing::debug!("Reconciler has shut down");
        }
    }

    pub(crate) fn mark_synced(&self, f: impl FnOnce(&mut Synced)) {
        self.synced.send_if_modified(|synced| {
            let before = *synced;
            f(synced);
            before != *synced
        });
    }

    /// Namespaces whose resource has been observed, with their labels.
    fn labeled_namespaces(&self) -> Vec<(String, Labels)> {
        self.namespaces
            .iter()
            .filter_map(|(name, ns)| ns.labels.clone().map(|labels| (name.clone(), labels)))
            .collect()
    }

    // === Namespaces ===

    pub fn apply_namespace(&mut self, ns: k8s::Namespace) {
        let name = ns.name_unchecked();
        let labels = Labels::from(ns.metadata.labels.clone());
        let logging = namespace::parse_logging(&ns);

        let entry = self.namespaces.entry(name.clone()).or_default();
        let labels_changed = entry.labels.as_ref() != Some(&labels);
        let logging_changed = entry.logging != logging;
        entry.labels = Some(labels);
        entry.logging = logging;

        if logging_changed {
            tracing::debug!(namespace = %name, ?logging, "ACL logging changed");
            let policies = entry.policies.keys().cloned().collect::<Vec<_>>();
            if !policies.is_empty() {
                self.enqueue(Key::Namespace(name.clone()));
            }
            for policy in policies {
                self.enqueue(Key::policy(&name, policy));
            }
        }

        if labels_changed {
            self.resolve_namespace_peers();
        }
    }

    pub fn delete_namespace(&mut self, name: String) {
        let Some(ns) = self.namespaces.get_mut(&name) else {
            return;
        };
        ns.labels = None;
        ns.logging = AclLogging::default();
        if ns.is_empty() {
            self.namespaces.remove(&name);
        }
        self.resolve_namespace_peers();
    }

    /// Re-resolves every rule's selector peers against the current namespace labels and enqueues
    /// the policies whose references changed.
    fn resolve_namespace_peers(&mut self) {
        let labeled = self.labeled_namespaces();
        let controller = self.cluster_info.controller_name.clone();
        let mut changed = Vec::new();
        for (ns_name, ns) in self.namespaces.iter_mut() {
            for (policy_name, state) in ns.policies.iter_mut() {
                let mut dirty = false;
                for (rule, gress) in state.policy.rules().zip(&mut state.rules) {
                    let desired = resolve_rule(&controller, ns_name, rule, &labeled);
                    dirty |= sync_references(gress, desired);
                }
                if dirty {
                    changed.push(Key::policy(ns_name, policy_name));
                }
            }
        }
        for key in changed {
            self.enqueue(key);
        }
    }

    // === Pods ===

    pub fn apply_pod(&mut self, pod: k8s::Pod) {
        let name = pod.name_unchecked();
        let Some(namespace) = pod.namespace() else {
            tracing::warn!(%name, "Ignoring pod without a namespace");
            return;
        };

        let new = Pod::from_resource(&pod, &namespace, &name);
        let old = self
            .namespaces
            .entry(namespace.clone())
            .or_default()
            .pods
            .insert(name, new.clone());
        if old.as_ref() == Some(&new) {
            return;
        }
        self.pod_changed(&namespace, old.as_ref(), Some(&new));
    }

    pub fn delete_pod(&mut self, namespace: String, name: String) {
        let Some(ns) = self.namespaces.get_mut(&namespace) else {
            return;
        };
        let Some(old) = ns.pods.remove(&name) else {
            return;
        };
        self.pod_changed(&namespace, Some(&old), None);
        if self.namespaces.get(&namespace).is_some_and(Namespace::is_empty) {
            self.namespaces.remove(&namespace);
        }
    }

    fn pod_changed(&self, namespace: &str, old: Option<&Pod>, new: Option<&Pod>) {
        let Some(ns) = self.namespaces.get(namespace) else {
            return;
        };

        let selected = |pod: Option<&Pod>, state: &PolicyState| {
            pod.is_some_and(|p| p.selectable && state.policy.pod_selector.matches(&p.labels))
        };
        let mut keys = ns
            .policies
            .iter()
            .filter(|(_, state)| selected(old, state) || selected(new, state))
            .map(|(name, _)| Key::policy(namespace, name))
            .collect::<Vec<_>>();
        if !keys.is_empty() {
            keys.push(Key::Namespace(namespace.to_string()));
        }

        let was = old.filter(|p| p.selectable).map(|p| &p.logical_port);
        let is = new.filter(|p| p.selectable).map(|p| &p.logical_port);
        if was != is {
            keys.push(Key::ClusterDefaults);
        }

        for key in keys {
            self.enqueue(key);
        }
    }

    // === Policies ===

    pub fn apply_policy(&mut self, np: k8s::NetworkPolicy) {
        let name = np.name_unchecked();
        let Some(namespace) = np.namespace() else {
            tracing::warn!(%name, "Ignoring NetworkPolicy without a namespace");
            return;
        };

        let policy = match Policy::parse(&np) {
            Ok(policy) => policy,
            Err(error) => {
                tracing::warn!(%namespace, %name, %error, "Ignoring malformed NetworkPolicy");
                self.delete_policy(namespace, name);
                return;
            }
        };

        let labeled = self.labeled_namespaces();
        let rules = policy
            .rules()
            .map(|rule| self.build_rule(&namespace, &name, &policy, rule, &labeled))
            .collect();
        let state = PolicyState { policy, rules };

        let ns = self.namespaces.entry(namespace.clone()).or_default();
        if ns.policies.get(&name) == Some(&state) {
            return;
        }
        tracing::debug!(%namespace, %name, "Indexed NetworkPolicy");
        ns.policies.insert(name.clone(), state);
        self.enqueue(Key::policy(&namespace, name));
        self.enqueue(Key::Namespace(namespace));
    }

    pub fn delete_policy(&mut self, namespace: String, name: String) {
        let Some(ns) = self.namespaces.get_mut(&namespace) else {
            return;
        };
        if ns.policies.remove(&name).is_none() {
            return;
        }
        tracing::debug!(%namespace, %name, "Removed NetworkPolicy");
        if ns.is_empty() {
            self.namespaces.remove(&namespace);
        }
        self.enqueue(Key::policy(&namespace, name));
        self.enqueue(Key::Namespace(namespace));
    }

    fn build_rule(
        &self,
        namespace: &str,
        name: &str,
        policy: &Policy,
        rule: &Rule,
        labeled: &[(String, Labels)],
    ) -> GressRule {
        let mut gress = GressRule::new(
            namespace,
            name,
            rule.direction,
            rule.index,
            self.cluster_info.controller_name.clone(),
            self.cluster_info.ip_mode,
        );
        gress.set_stateless(policy.stateless);
        for term in &rule.terms {
            match term {
                RuleTerm::Selector(_) => gress.set_has_peer_selector(),
                RuleTerm::Cidr(block) => gress.add_ip_block(block.clone()),
                RuleTerm::Port(port) => gress.add_port(*port),
            }
        }
        let refs = resolve_rule(&self.cluster_info.controller_name, namespace, rule, labeled);
        sync_references(&mut gress, refs);
        gress
    }
}

/// Resolves all of a rule's selector peers to address-set references.
fn resolve_rule(
    controller: &str,
    namespace: &str,
    rule: &Rule,
    labeled: &[(String, Labels)],
) -> BTreeSet<AddressSetRef> {
    rule.terms
        .iter()
        .filter_map(|term| match term {
            RuleTerm::Selector(peer) => Some(peer),
            _ => None,
        })
        .flat_map(|peer| resolve_peer(controller, namespace, peer, labeled))
        .collect()
}

fn resolve_peer(
    controller: &str,
    namespace: &str,
    peer: &SelectorPeer,
    labeled: &[(String, Labels)],
) -> Vec<AddressSetRef> {
    let pods = peer.pods.as_ref().filter(|s| !s.is_empty());
    match (pods, &peer.namespaces) {
        // Every pod in the policy's namespace.
        (None, None) => vec![AddressSetRef::namespace(controller, namespace)],

        // Every pod in each matching namespace.
        (None, Some(selector)) if peer.pods.is_none() || !selector.is_empty() => labeled
            .iter()
            .filter(|(_, labels)| selector.matches(labels))
            .map(|(name, _)| AddressSetRef::namespace(controller, name))
            .collect(),

        // Pods selected by labels. The address set tracks the selected pods itself, so the
        // reference only depends on the selectors.
        (pods, namespaces) => {
            let pods = pods.map(ToString::to_string).unwrap_or_default();
            let scope = match namespaces {
                None => namespace.to_string(),
                Some(selector) if selector.is_empty() => "*".to_string(),
                Some(selector) => format!("[{selector}]"),
            };
            vec![AddressSetRef::pod_selector(
                controller,
                &format!("{scope}/{pods}"),
            )]
        }
    }
}

/// Updates the rule's references to exactly `desired`, returning true if anything changed.
fn sync_references(gress: &mut GressRule, desired: BTreeSet<AddressSetRef>) -> bool {
    let stale = gress
        .peer_address_sets()
        .filter(|set| !desired.contains(*set))
        .map(|set| set.identity().clone())
        .collect::<Vec<_>>();
    let mut changed = false;
    for id in stale {
        changed |= gress.remove_peer_address_set(&id);
    }
    for set in desired {
        changed |= gress.add_peer_address_set(set);
    }
    changed
}

impl kubert::index::IndexClusterResource<k8s::Namespace> for Index {
    fn apply(&mut self, ns: k8s::Namespace) {
        self.apply_namespace(ns);
    }

    fn delete(&mut self, name: String) {
        self.delete_namespace(name);
    }

    fn reset(&mut self, namespaces: Vec<k8s::Namespace>, removed: ClusterRemoved) {
        for name in removed {
            self.delete_namespace(name);
        }
        for ns in namespaces {
            self.apply_namespace(ns);
        }
        self.mark_synced(|s| s.namespaces = true);
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Pod> for Index {
    fn apply(&mut self, pod: k8s::Pod) {
        self.apply_pod(pod);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_pod(namespace, name);
    }

    fn reset(&mut self, pods: Vec<k8s::Pod>, removed: NamespacedRemoved) {
        for (namespace, names) in removed {
            for name in names {
                self.delete_pod(namespace.clone(), name);
            }
        }
        for pod in pods {
            self.apply_pod(pod);
        }
        self.mark_synced(|s| s.pods = true);
    }
}

impl kubert::index::IndexNamespacedResource<k8s::NetworkPolicy> for Index {
    fn apply(&mut self, np: k8s::NetworkPolicy) {
        self.apply_policy(np);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_policy(namespace, name);
    }

    fn reset(&mut self, policies: Vec<k8s::NetworkPolicy>, removed: NamespacedRemoved) {
        for (namespace, names) in removed {
            for name in names {
                self.delete_policy(namespace.clone(), name);
            }
        }
        for np in policies {
            self.apply_policy(np);
        }
        self.mark_synced(|s| s.policies = true);
    }
}
