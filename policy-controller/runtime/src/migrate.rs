//! Brings rows written by earlier versions of the controller up to date before reconciliation
//! starts.
//!
//! Rows are rewritten in place by UUID so that enforcement is never interrupted. This covers
//! rows whose identity is current but whose contents are not, such as node ACLs written without
//! a name. Port groups that
//! no longer correspond to any policy or namespace are deleted; ACLs are never deleted, since
//! nothing references them once their group is gone.

use crate::{
    index::{Desired, Key, SharedIndex},
    retry::Backoff,
};
use sdn_policy_controller_core::{
    Acl, AclRole, Backend, BackendError, IdsType, IndexKey, ObjectIdentity, Op, PolicyDirection,
};
use std::collections::{BTreeMap, BTreeSet};
use tokio::time;
use tracing::{debug, info, warn};

/// External ids written before rows carried an identity.
const LEGACY_NAMESPACE: &str = "namespace";
const LEGACY_POLICY: &str = "policy";
const LEGACY_POLICY_TYPE: &str = "policy_type";
const LEGACY_DEFAULT_DENY_TYPE: &str = "default-deny-policy-type";
const LEGACY_ARP_ALLOW_SUFFIX: &str = "_ARPallowPolicy";

#[derive(Debug)]
pub struct Scanner<B> {
    index: SharedIndex,
    backend: B,
    backoff: Backoff,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Report {
    pub updated_acls: usize,
    pub deleted_port_groups: usize,
    /// Keys whose port groups exist in the backend after the scan.
    pub live: BTreeSet<Key>,
}

/// The rows the current index compiles to.
#[derive(Debug, Default)]
struct Snapshot {
    /// ACLs by primary id.
    acls: BTreeMap<String, Acl>,
    /// Port group names and the keys that own them.
    port_groups: BTreeMap<String, Key>,
}

// === impl Scanner ===

impl<B: Backend> Scanner<B> {
    pub fn new(index: SharedIndex, backend: B, backoff: Backoff) -> Self {
        Self {
            index,
            backend,
            backoff,
        }
    }

    /// Scans the backend, retrying transient failures until the scan completes.
    pub async fn run(&self) -> Result<Report, BackendError> {
        let mut failures = 0;
        loop {
            match self.scan().await {
                Ok(report) => {
                    info!(
                        updated_acls = report.updated_acls,
                        deleted_port_groups = report.deleted_port_groups,
                        "Migrated backend state"
                    );
                    return Ok(report);
                }
                Err(error) if error.is_transient() => {
                    failures += 1;
                    let delay = self.backoff.delay(failures);
                    warn!(%error, ?delay, "Migration scan failed; retrying");
                    time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn scan(&self) -> Result<Report, BackendError> {
        let (controller, snapshot) = {
            let index = self.index.read();
            let controller = index.cluster_info().controller_name.clone();
            (controller, Snapshot::compile(&index.keys(), |k| index.compile(k)))
        };
        let acls = self.backend.list_acls().await?;
        let port_groups = self.backend.list_port_groups().await?;

        let mut report = Report::default();
        let mut ops = Vec::new();

        // Rows that already carry an identity are matched by primary id.
        let mut claimed = BTreeSet::new();
        for row in &acls {
            let Some(id) = row.row.identity() else {
                continue;
            };
            if id.controller() != controller {
                continue;
            }
            let primary_id = id.primary_id();
            if let Some(want) = snapshot.acls.get(&primary_id) {
                if row.row != *want {
                    debug!(uuid = %row.uuid, name = %row.row.name, "Updating ACL");
                    ops.push(Op::UpdateAcl {
                        uuid: row.uuid.clone(),
                        acl: want.clone(),
                    });
                }
            }
            claimed.insert(primary_id);
        }

        // Legacy rows are matched to the first unclaimed ACL their owner compiles to.
        for row in &acls {
            if row.row.identity().is_some() {
                continue;
            }
            let Some(predicate) = legacy_identity(&controller, &row.row) else {
                continue;
            };
            let found = snapshot.acls.iter().find(|(primary_id, acl)| {
                !claimed.contains(*primary_id)
                    && acl.identity().is_some_and(|id| id.has_prefix(&predicate))
            });
            match found {
                Some((primary_id, want)) => {
                    debug!(
                        uuid = %row.uuid,
                        from = %row.row.name,
                        to = %want.name,
                        "Migrating legacy ACL"
                    );
                    claimed.insert(primary_id.clone());
                    ops.push(Op::UpdateAcl {
                        uuid: row.uuid.clone(),
                        acl: want.clone(),
                    });
                }
                None => debug!(uuid = %row.uuid, name = %row.row.name, "Leaving stale legacy ACL"),
            }
        }
        report.updated_acls = ops.len();

        for row in &port_groups {
            let owned = row
                .row
                .identity()
                .is_some_and(|id| id.controller() == controller);
            if !owned {
                continue;
            }
            match snapshot.port_groups.get(&row.row.name) {
                Some(key) => {
                    report.live.insert(key.clone());
                }
                None => {
                    debug!(name = %row.row.name, "Deleting stale port group");
                    report.deleted_port_groups += 1;
                    ops.push(Op::DeletePortGroup {
                        name: row.row.name.clone(),
                    });
                }
            }
        }

        if !ops.is_empty() {
            self.backend.transact(ops).await?;
        }
        Ok(report)
    }
}

// === impl Snapshot ===

impl Snapshot {
    fn compile(keys: &[Key], compile: impl Fn(&Key) -> Desired) -> Self {
        let mut snapshot = Self::default();
        for key in keys {
            let desired = compile(key);
            for acl in desired.acls() {
                if let Some(id) = acl.key() {
                    snapshot.acls.insert(id.to_string(), acl.clone());
                }
            }
            for pg in desired.port_groups() {
                snapshot.port_groups.insert(pg.name.clone(), key.clone());
            }
        }
        snapshot
    }
}

/// Recovers the owner of an ACL written before rows carried identities.
///
/// Rule ACLs recorded their policy, namespace, direction and rule number. Default-deny ACLs only
/// recorded their direction; the namespace is recovered from their name.
fn legacy_identity(controller: &str, acl: &Acl) -> Option<ObjectIdentity> {
    let ids = &acl.external_ids;

    if let Some(direction) = ids.get(LEGACY_DEFAULT_DENY_TYPE) {
        let direction = direction.parse::<PolicyDirection>().ok()?;
        let (namespace, role) = match acl.name.strip_suffix(LEGACY_ARP_ALLOW_SUFFIX) {
            Some(ns) => (ns, AclRole::ArpAllow),
            None => {
                let ns = match ids.get(LEGACY_NAMESPACE) {
                    Some(ns) => ns.as_str(),
                    None => acl.name.split_once('_').map(|(ns, _)| ns)?,
                };
                (ns, AclRole::DefaultDeny)
            }
        };
        return Some(
            ObjectIdentity::new(IdsType::ACL_NETPOL_NAMESPACE, controller, namespace)
                .with_index(IndexKey::PolicyDirection, direction)
                .with_index(IndexKey::Role, role.as_str()),
        );
    }

    let namespace = ids.get(LEGACY_NAMESPACE)?;
    let policy = ids.get(LEGACY_POLICY)?;
    let direction = ids.get(LEGACY_POLICY_TYPE)?.parse::<PolicyDirection>().ok()?;
    let gress = ids.get(&format!("{direction}_num"))?;
    Some(
        ObjectIdentity::new(
            IdsType::ACL_NETWORK_POLICY,
            controller,
            format!("{namespace}:{policy}"),
        )
        .with_index(IndexKey::PolicyDirection, direction)
        .with_index(IndexKey::GressIndex, gress),
    )
}

#[cfg(test)]
mod tests;
