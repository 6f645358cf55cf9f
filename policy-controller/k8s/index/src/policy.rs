use anyhow::{bail, Context, Result};
use sdn_policy_controller_core::{IpBlock, IpNet, PolicyDirection, PortRestriction, Protocol};
use sdn_policy_controller_k8s_api::{
    self as k8s, annotations, IntOrString, LabelSelector, NetworkPolicyPeer, NetworkPolicyPort,
    ResourceExt, Selector,
};

/// A parsed `NetworkPolicy`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Policy {
    pub pod_selector: Selector,
    pub isolates_ingress: bool,
    pub isolates_egress: bool,
    pub stateless: bool,
    pub ingress: Vec<Rule>,
    pub egress: Vec<Rule>,
    /// Rules dropped because they could not be parsed.
    pub skipped: usize,
}

/// One ingress or egress rule. `index` is the rule's position in the resource, which is preserved
/// even when earlier rules are skipped so that identities stay stable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Rule {
    pub direction: PolicyDirection,
    pub index: usize,
    pub terms: Vec<RuleTerm>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RuleTerm {
    Selector(SelectorPeer),
    Cidr(IpBlock),
    Port(PortRestriction),
}

/// A peer selected by labels.
///
/// `None` means the selector was not set, which differs from an empty selector: an unset namespace
/// selector scopes the peer to the policy's namespace, while an empty one matches all namespaces.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SelectorPeer {
    pub pods: Option<Selector>,
    pub namespaces: Option<Selector>,
}

type RawRule = (Vec<NetworkPolicyPeer>, Vec<NetworkPolicyPort>);

// === impl Policy ===

impl Policy {
    pub(crate) fn parse(policy: &k8s::NetworkPolicy) -> Result<Self> {
        let spec = policy.spec.clone().unwrap_or_default();
        let pod_selector = Option::<LabelSelector>::from(spec.pod_selector).unwrap_or_default();
        let pod_selector = Selector::try_from(&pod_selector).context("invalid podSelector")?;

        let has_egress_rules = spec.egress.as_ref().is_some_and(|rules| !rules.is_empty());
        let (isolates_ingress, isolates_egress) = match spec.policy_types {
            None => (true, has_egress_rules),
            Some(types) => {
                let mut ingress = false;
                let mut egress = false;
                for t in &types {
                    match t.parse::<PolicyDirection>()? {
                        PolicyDirection::Ingress => ingress = true,
                        PolicyDirection::Egress => egress = true,
                    }
                }
                (ingress, egress)
            }
        };

        let name = policy.name_unchecked();
        let namespace = policy.namespace().unwrap_or_default();
        let mut skipped = 0;
        let mut parse_rules = |direction: PolicyDirection, rules: Vec<RawRule>| {
            rules
                .into_iter()
                .enumerate()
                .filter_map(|(index, (peers, ports))| match parse_terms(&peers, &ports) {
                    Ok(terms) => Some(Rule {
                        direction,
                        index,
                        terms,
                    }),
                    Err(error) => {
                        tracing::warn!(
                            %namespace,
                            %name,
                            %direction,
                            index,
                            %error,
                            "Skipping malformed rule"
                        );
                        skipped += 1;
                        None
                    }
                })
                .collect::<Vec<_>>()
        };

        let ingress = parse_rules(
            PolicyDirection::Ingress,
            spec.ingress
                .into_iter()
                .flatten()
                .map(|r| (r.from.unwrap_or_default(), r.ports.unwrap_or_default()))
                .collect(),
        );
        let egress = parse_rules(
            PolicyDirection::Egress,
            spec.egress
                .into_iter()
                .flatten()
                .map(|r| (r.to.unwrap_or_default(), r.ports.unwrap_or_default()))
                .collect(),
        );

        Ok(Self {
            pod_selector,
            isolates_ingress,
            isolates_egress,
            stateless: annotations::acl_stateless(&policy.metadata),
            ingress,
            egress,
            skipped,
        })
    }

    pub(crate) fn isolates(&self, direction: PolicyDirection) -> bool {
        match direction {
            PolicyDirection::Ingress => self.isolates_ingress,
            PolicyDirection::Egress => self.isolates_egress,
        }
    }

    pub(crate) fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.ingress.iter().chain(&self.egress)
    }
}

fn parse_terms(
    peers: &[NetworkPolicyPeer],
    ports: &[NetworkPolicyPort],
) -> Result<Vec<RuleTerm>> {
    let mut terms = Vec::with_capacity(peers.len() + ports.len());
    for peer in peers {
        terms.push(parse_peer(peer)?);
    }
    for port in ports {
        terms.push(RuleTerm::Port(parse_port(port)?));
    }
    Ok(terms)
}

fn parse_peer(peer: &NetworkPolicyPeer) -> Result<RuleTerm> {
    if let Some(block) = &peer.ip_block {
        if peer.pod_selector.is_some() || peer.namespace_selector.is_some() {
            bail!("ipBlock may not be combined with selectors");
        }
        let cidr = block
            .cidr
            .parse::<IpNet>()
            .with_context(|| format!("invalid ipBlock cidr: {}", block.cidr))?;
        let except = block
            .except
            .iter()
            .flatten()
            .map(|e| {
                e.parse::<IpNet>()
                    .with_context(|| format!("invalid ipBlock except: {e}"))
            })
            .collect::<Result<Vec<_>>>()?;
        return Ok(RuleTerm::Cidr(IpBlock { cidr, except }));
    }

    let pods = peer
        .pod_selector
        .as_ref()
        .map(Selector::try_from)
        .transpose()
        .context("invalid podSelector")?;
    let namespaces = peer
        .namespace_selector
        .as_ref()
        .map(Selector::try_from)
        .transpose()
        .context("invalid namespaceSelector")?;
    if pods.is_none() && namespaces.is_none() {
        bail!("peer must set ipBlock, podSelector or namespaceSelector");
    }
    Ok(RuleTerm::Selector(SelectorPeer { pods, namespaces }))
}

fn parse_port(port: &NetworkPolicyPort) -> Result<PortRestriction> {
    let protocol = match port.protocol.as_deref() {
        None => Protocol::Tcp,
        Some(p) => p.parse()?,
    };
    let number = match &port.port {
        None => None,
        Some(IntOrString::Int(n)) => Some(port_number(*n)?),
        Some(IntOrString::String(name)) => bail!("named port {name} is not supported"),
    };
    let end = port.end_port.map(port_number).transpose()?;
    PortRestriction::new(protocol, number, end)
}

fn port_number(n: i32) -> Result<u16> {
    match u16::try_from(n) {
        Ok(port) if port != 0 => Ok(port),
        _ => bail!("invalid port number: {n}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s::{
        IPBlock, NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule,
        NetworkPolicySpec, ObjectMeta,
    };
    use maplit::btreemap;

    fn mk_policy(spec: NetworkPolicySpec) -> NetworkPolicy {
        NetworkPolicy {
            metadata: ObjectMeta {
                namespace: Some("ns1".to_string()),
                name: Some("pol".to_string()),
                ..Default::default()
            },
            spec: Some(spec),
        }
    }

    fn selector(k: &str, v: &str) -> LabelSelector {
        LabelSelector {
            match_labels: Some(btreemap! { k.to_string() => v.to_string() }),
            ..Default::default()
        }
    }

    #[test]
    fn policy_types_default() {
        let ingress_only = Policy::parse(&mk_policy(NetworkPolicySpec {
            ingress: Some(vec![NetworkPolicyIngressRule::default()]),
            ..Default::default()
        }))
        .unwrap();
        assert!(ingress_only.isolates_ingress);
        assert!(!ingress_only.isolates_egress);

        let with_egress = Policy::parse(&mk_policy(NetworkPolicySpec {
            egress: Some(vec![NetworkPolicyEgressRule::default()]),
            ..Default::default()
        }))
        .unwrap();
        assert!(with_egress.isolates_ingress);
        assert!(with_egress.isolates_egress);

        let explicit = Policy::parse(&mk_policy(NetworkPolicySpec {
            policy_types: Some(vec!["Egress".to_string()]),
            ..Default::default()
        }))
        .unwrap();
        assert!(!explicit.isolates_ingress);
        assert!(explicit.isolates_egress);
    }

    #[test]
    fn malformed_rules_are_skipped() {
        let policy = Policy::parse(&mk_policy(NetworkPolicySpec {
            ingress: Some(vec![
                NetworkPolicyIngressRule {
                    from: Some(vec![NetworkPolicyPeer {
                        ip_block: Some(IPBlock {
                            cidr: "not-a-cidr".to_string(),
                            except: None,
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                },
                NetworkPolicyIngressRule {
                    from: Some(vec![NetworkPolicyPeer {
                        namespace_selector: Some(selector("name", "ns2")),
                        ..Default::default()
                    }]),
                    ..Default::default()
                },
            ]),
            egress: Some(vec![NetworkPolicyEgressRule {
                ports: Some(vec![NetworkPolicyPort {
                    port: Some(IntOrString::String("http".to_string())),
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
            ..Default::default()
        }))
        .unwrap();

        assert_eq!(policy.skipped, 2);
        assert!(policy.egress.is_empty());
        assert_eq!(policy.ingress.len(), 1);
        // The surviving rule keeps its position.
        assert_eq!(policy.ingress[0].index, 1);
        assert!(matches!(
            &policy.ingress[0].terms[..],
            [RuleTerm::Selector(SelectorPeer { pods: None, namespaces: Some(_) })]
        ));
    }

    #[test]
    fn ports_and_blocks() {
        let policy = Policy::parse(&mk_policy(NetworkPolicySpec {
            egress: Some(vec![NetworkPolicyEgressRule {
                to: Some(vec![NetworkPolicyPeer {
                    ip_block: Some(IPBlock {
                        cidr: "10.0.0.0/8".to_string(),
                        except: Some(vec!["10.1.0.0/16".to_string()]),
                    }),
                    ..Default::default()
                }]),
                ports: Some(vec![NetworkPolicyPort {
                    port: Some(IntOrString::Int(81)),
                    ..Default::default()
                }]),
            }]),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(policy.skipped, 0);
        assert_eq!(
            policy.egress[0].terms,
            vec![
                RuleTerm::Cidr(IpBlock {
                    cidr: "10.0.0.0/8".parse().unwrap(),
                    except: vec!["10.1.0.0/16".parse().unwrap()],
                }),
                RuleTerm::Port(PortRestriction::new(Protocol::Tcp, Some(81), None).unwrap()),
            ]
        );
    }

    #[test]
    fn stateless_annotation() {
        let mut np = mk_policy(NetworkPolicySpec::default());
        np.metadata.annotations = Some(btreemap! {
            annotations::ACL_STATELESS.to_string() => "true".to_string(),
        });
        assert!(Policy::parse(&np).unwrap().stateless);
    }
}
