use crate::k8s::{self, api::apps::v1::Deployment, ObjectMeta, Resource};
use anyhow::Result;
use k8s_openapi::api::coordination::v1 as coordv1;
use kube::api::{Patch, PatchParams};
use std::sync::Arc;
use tokio::{sync::watch, time};

const LEASE_DURATION: time::Duration = time::Duration::from_secs(30);
pub const LEASE_NAME: &str = "sdn-policy-controller-write";
const RENEW_GRACE_PERIOD: time::Duration = time::Duration::from_secs(1);

/// Creates the write lease, if needed, and starts competing for it.
pub async fn init<T>(
    runtime: &kubert::Runtime<T>,
    ns: &str,
    deployment_name: &str,
    hostname: &str,
) -> Result<watch::Receiver<Arc<kubert::lease::Claim>>> {
    // The controller's deployment owns the Lease so that it is removed with the controller.
    let api = k8s::Api::<Deployment>::namespaced(runtime.client(), ns);
    let deployment = api.get(deployment_name).await?;

    let lease = coordv1::Lease {
        metadata: ObjectMeta {
            name: Some(LEASE_NAME.to_string()),
            namespace: Some(ns.to_string()),
            // A resource version of "0" only creates the Lease if it does not already exist.
            resource_version: Some("0".to_string()),
            owner_references: deployment.controller_owner_ref(&()).map(|r| vec![r]),
            labels: Some(
                [(
                    "app.kubernetes.io/component".to_string(),
                    "sdn-policy-controller".to_string(),
                )]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        spec: None,
    };
    let api = k8s::Api::<coordv1::Lease>::namespaced(runtime.client(), ns);
    let params = PatchParams {
        field_manager: Some("sdn-policy-controller".to_string()),
        ..Default::default()
    };
    match api.patch(LEASE_NAME, &params, &Patch::Apply(lease)).await {
        Ok(lease) => tracing::info!(?lease, "Created Lease resource"),
        Err(k8s::Error::Api(_)) => tracing::debug!("Lease already exists, no need to create it"),
        Err(error) => return Err(error.into()),
    };

    let params = kubert::lease::ClaimParams {
        lease_duration: LEASE_DURATION,
        renew_grace_period: RENEW_GRACE_PERIOD,
    };
    let (claims, _task) = kubert::lease::LeaseManager::init(api, LEASE_NAME)
        .await?
        .spawn(hostname, params)
        .await?;
    Ok(claims)
}

/// Waits until `hostname` holds the lease.
pub async fn acquired(claims: &mut watch::Receiver<Arc<kubert::lease::Claim>>, hostname: &str) {
    loop {
        if claims.borrow_and_update().is_current_for(hostname) {
            return;
        }
        if claims.changed().await.is_err() {
            // The lease manager has stopped; keep waiting for shutdown.
            std::future::pending::<()>().await;
        }
    }
}

/// Completes when `hostname` no longer holds the lease.
pub async fn lost(mut claims: watch::Receiver<Arc<kubert::lease::Claim>>, hostname: &str) {
    loop {
        if !claims.borrow_and_update().is_current_for(hostname) {
            return;
        }
        if claims.changed().await.is_err() {
            return;
        }
    }
}
