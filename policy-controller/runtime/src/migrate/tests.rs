use super::*;
use crate::{
    index::Desired,
    test_util::{index, mk_node, mk_ns, mk_pod, mk_policy},
};
use maplit::btreemap;
use pretty_assertions::assert_eq;
use sdn_policy_controller_core::{
    acl::APPLY_AFTER_LB,
    port_group::{default_deny_port_group, network_policy_port_group},
    AclDirection, MemoryBackend, PortGroup, Severity, DEFAULT_CONTROLLER_NAME,
};
use std::sync::Arc;

fn indexed() -> SharedIndex {
    let (index, _rx) = index();
    {
        let mut index = index.write();
        index.apply_namespace(mk_ns("ns1", ("name", "ns1")));
        index.apply_namespace(mk_ns("ns2", ("name", "ns2")));
        index.apply_pod(mk_pod("ns1", "pod1"));
        index.apply_policy(mk_policy("ns1", "pol"));
    }
    index
}

fn namespace_acls(index: &SharedIndex) -> Vec<Acl> {
    match index.read().compile(&Key::Namespace("ns1".to_string())) {
        Desired::Namespace(defaults) => defaults.acls,
        desired => panic!("unexpected {desired:?}"),
    }
}

fn policy_acls(index: &SharedIndex) -> Vec<Acl> {
    match index.read().compile(&Key::policy("ns1", "pol")) {
        Desired::Policy(policy) => policy.acls,
        desired => panic!("unexpected {desired:?}"),
    }
}

/// Rewrites an ACL into the shape written before identities existed.
fn legacy(mut acl: Acl, name: String, ids: BTreeMap<String, String>) -> Acl {
    acl.name = name;
    acl.options.clear();
    acl.direction = AclDirection::ToLport;
    acl.external_ids = ids;
    acl
}

#[tokio::test(start_paused = true)]
async fn migrates_legacy_default_deny_in_place() {
    let index = indexed();
    let backend = Arc::new(MemoryBackend::new());

    let acls = namespace_acls(&index);
    // Egress default deny, written with the wrong direction, no options and a severity although
    // logging is disabled.
    let mut stale_deny = legacy(
        acls[2].clone(),
        "ns1_pol".to_string(),
        btreemap! { LEGACY_DEFAULT_DENY_TYPE.to_string() => "Egress".to_string() },
    );
    stale_deny.severity = Some(Severity::Info);
    let deny_uuid = backend.insert_acl(stale_deny);
    let arp_uuid = backend.insert_acl(legacy(
        acls[3].clone(),
        "ns1_ARPallowPolicy".to_string(),
        btreemap! { LEGACY_DEFAULT_DENY_TYPE.to_string() => "Egress".to_string() },
    ));

    let report = Scanner::new(index.clone(), backend.clone(), Backoff::default())
        .run()
        .await
        .expect("scan must succeed");
    assert_eq!(report.updated_acls, 2);

    let deny = backend.acl(&deny_uuid).expect("ACL must not be recreated");
    assert_eq!(deny, acls[2]);
    assert_eq!(deny.name, "NP:ns1:Egress:defaultDeny");
    assert_eq!(deny.direction, AclDirection::FromLport);
    assert_eq!(
        deny.options.get(APPLY_AFTER_LB).map(String::as_str),
        Some("true")
    );
    assert_eq!(deny.severity, None);
    assert!(!deny.log);

    let arp = backend.acl(&arp_uuid).expect("ACL must not be recreated");
    assert_eq!(arp.name, "NP:ns1:Egress:arpAllow");
    assert_eq!(backend.acls().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn migrates_legacy_rule_acls() {
    let index = indexed();
    let backend = Arc::new(MemoryBackend::new());

    let acls = policy_acls(&index);
    let egress = acls
        .iter()
        .find(|acl| acl.name == "NP:ns1:pol:Egress:0:0")
        .expect("egress ACL must compile")
        .clone();
    let uuid = backend.insert_acl(legacy(
        egress.clone(),
        "ns1_pol_1".to_string(),
        btreemap! {
            LEGACY_NAMESPACE.to_string() => "ns1".to_string(),
            LEGACY_POLICY.to_string() => "pol".to_string(),
            LEGACY_POLICY_TYPE.to_string() => "Egress".to_string(),
            "Egress_num".to_string() => "0".to_string(),
        },
    ));
    // A rule that no longer exists is left alone.
    let orphan = backend.insert_acl(legacy(
        egress.clone(),
        "ns1_pol_7".to_string(),
        btreemap! {
            LEGACY_NAMESPACE.to_string() => "ns1".to_string(),
            LEGACY_POLICY.to_string() => "pol".to_string(),
            LEGACY_POLICY_TYPE.to_string() => "Egress".to_string(),
            "Egress_num".to_string() => "7".to_string(),
        },
    ));

    let report = Scanner::new(index, backend.clone(), Backoff::default())
        .run()
        .await
        .unwrap();
    assert_eq!(report.updated_acls, 1);
    assert_eq!(backend.acl(&uuid), Some(egress));
    assert_eq!(
        backend.acl(&orphan).map(|acl| acl.name),
        Some("ns1_pol_7".to_string())
    );
}

#[tokio::test(start_paused = true)]
async fn updates_current_rows_with_stale_shape() {
    let index = indexed();
    let backend = Arc::new(MemoryBackend::new());

    let acls = policy_acls(&index);
    let mut stale = acls[0].clone();
    stale.name = "ns1_pol_0".to_string();
    stale.severity = Some(Severity::Info);
    let uuid = backend.insert_acl(stale);
    let current = backend.insert_acl(acls[1].clone());

    let report = Scanner::new(index, backend.clone(), Backoff::default())
        .run()
        .await
        .unwrap();
    assert_eq!(report.updated_acls, 1);
    assert_eq!(backend.acl(&uuid), Some(acls[0].clone()));
    assert_eq!(backend.acl(&current), Some(acls[1].clone()));
}

#[tokio::test(start_paused = true)]
async fn deletes_stale_port_groups() {
    let index = indexed();
    let backend = Arc::new(MemoryBackend::new());

    let live = PortGroup::build(
        &network_policy_port_group(DEFAULT_CONTROLLER_NAME, "ns1", "pol"),
        None,
        None,
    );
    backend.insert_port_group(live.clone());
    let gone = PortGroup::build(
        &network_policy_port_group(DEFAULT_CONTROLLER_NAME, "ns1", "gone"),
        None,
        None,
    );
    backend.insert_port_group(gone.clone());
    // ns2 has no policies, so its default-deny groups are stale.
    let ns2_deny = PortGroup::build(
        &default_deny_port_group(DEFAULT_CONTROLLER_NAME, "ns2", PolicyDirection::Ingress),
        None,
        None,
    );
    backend.insert_port_group(ns2_deny.clone());
    // Groups owned by another controller are not ours to delete.
    let foreign = PortGroup::build(
        &network_policy_port_group("other-controller", "ns1", "gone"),
        None,
        None,
    );
    backend.insert_port_group(foreign.clone());
    // An ACL of the deleted policy stays behind.
    let acl = backend.insert_acl(policy_acls(&index)[0].clone());

    let report = Scanner::new(index, backend.clone(), Backoff::default())
        .run()
        .await
        .unwrap();
    assert_eq!(report.deleted_port_groups, 2);
    assert_eq!(
        report.live.into_iter().collect::<Vec<_>>(),
        vec![Key::policy("ns1", "pol")]
    );

    assert!(backend.port_group(&live.name).is_some());
    assert!(backend.port_group(&gone.name).is_none());
    assert!(backend.port_group(&ns2_deny.name).is_none());
    assert!(backend.port_group(&foreign.name).is_some());
    assert!(backend.acl(&acl).is_some());
}

#[tokio::test(start_paused = true)]
async fn retries_transient_failures() {
    let index = indexed();
    let backend = Arc::new(MemoryBackend::new());
    backend.insert_port_group(PortGroup::build(
        &network_policy_port_group(DEFAULT_CONTROLLER_NAME, "ns1", "gone"),
        None,
        None,
    ));
    backend.fail_next(2);

    let start = time::Instant::now();
    let report = Scanner::new(index, backend.clone(), Backoff::default())
        .run()
        .await
        .unwrap();
    assert_eq!(report.deleted_port_groups, 1);
    assert!(backend.port_groups().is_empty());
    // Two failures back off for 1s and then 2s.
    assert!(start.elapsed() >= std::time::Duration::from_secs(3));
    assert_eq!(backend.commits(), 1);
}

#[tokio::test(start_paused = true)]
async fn migrates_unnamed_node_acl_in_place() {
    let index = indexed();
    index
        .write()
        .apply_node(mk_node("node1", "10.244.0.0/24"));
    let want = match index.read().compile(&Key::Node("node1".to_string())) {
        Desired::Node(node) => node.acls[0].clone(),
        desired => panic!("unexpected {desired:?}"),
    };
    assert_eq!(want.name, "NPNode:node1:10.244.0.2");

    let backend = Arc::new(MemoryBackend::new());
    let mut stale = want.clone();
    stale.name = String::new();
    let uuid = backend.insert_acl(stale);

    let report = Scanner::new(index.clone(), backend.clone(), Backoff::default())
        .run()
        .await
        .expect("scan must succeed");
    assert_eq!(report.updated_acls, 1);
    assert_eq!(backend.acls().len(), 1);
    assert_eq!(backend.acl(&uuid), Some(want));

    // A second scan finds nothing to do.
    let report = Scanner::new(index, backend.clone(), Backoff::default())
        .run()
        .await
        .expect("scan must succeed");
    assert_eq!(report.updated_acls, 0);
}
