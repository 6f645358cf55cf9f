use crate::{
    core::{IpMode, MemoryBackend, DEFAULT_CONTROLLER_NAME},
    index::{metrics as index_metrics, ClusterInfo, Index, Key, SharedIndex},
    k8s, lease,
    metrics::EngineMetrics,
    migrate::Scanner,
    reconcile::{Engine, EngineConfig},
    retry::Backoff,
};
use anyhow::{bail, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::{sync::mpsc, time::Duration};
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "sdn-policy-controller",
    about = "Compiles Kubernetes NetworkPolicies into SDN ACLs and port groups"
)]
pub struct Args {
    #[clap(long, default_value = "sdn=info,warn", env = "SDN_POLICY_CONTROLLER_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Recorded as the owner of every backend object this controller writes.
    #[clap(long, default_value = DEFAULT_CONTROLLER_NAME)]
    controller_name: String,

    /// Enables IPv4 matches. IPv4 is used when no family is enabled.
    #[clap(long)]
    ipv4: bool,

    /// Enables IPv6 matches.
    #[clap(long)]
    ipv6: bool,

    /// The maximum number of concurrent reconciliations.
    #[clap(long, default_value = "16")]
    workers: usize,

    #[clap(long, default_value = "10000")]
    transact_timeout_ms: u64,

    #[clap(long, default_value = "1000")]
    retry_initial_backoff_ms: u64,

    #[clap(long, default_value = "60000")]
    retry_max_backoff_ms: u64,

    /// How often failed reconciliations are redriven.
    #[clap(long, default_value = "60")]
    retry_interval_secs: u64,

    #[clap(long, default_value = "sdn-system")]
    control_plane_namespace: String,

    #[clap(long, default_value = "sdn-policy-controller")]
    controller_deployment_name: String,

    /// Writes to the backend without holding the write lease.
    #[clap(long)]
    lease_disabled: bool,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            controller_name,
            ipv4,
            ipv6,
            workers,
            transact_timeout_ms,
            retry_initial_backoff_ms,
            retry_max_backoff_ms,
            retry_interval_secs,
            control_plane_namespace,
            controller_deployment_name,
            lease_disabled,
        } = self;

        let cluster_info = Arc::new(ClusterInfo {
            controller_name,
            ip_mode: IpMode {
                ipv4: ipv4 || !ipv6,
                ipv6,
            },
        });
        let backoff = Backoff::new(
            Duration::from_millis(retry_initial_backoff_ms),
            Duration::from_millis(retry_max_backoff_ms),
        );
        let config = EngineConfig {
            workers,
            transact_timeout: Duration::from_millis(transact_timeout_ms),
            backoff,
            retry_interval: Duration::from_secs(retry_interval_secs),
        };

        let (keys_tx, keys_rx) = mpsc::unbounded_channel();
        let index = Index::shared(cluster_info, keys_tx);

        let mut prom = <Registry>::default();
        index_metrics::register(prom.sub_registry_with_prefix("index"), index.clone());
        let engine_metrics = EngineMetrics::register(prom.sub_registry_with_prefix("engine"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let claims = if lease_disabled {
            None
        } else {
            let Ok(hostname) = std::env::var("HOSTNAME") else {
                bail!("HOSTNAME must be set to claim the write lease");
            };
            let claims = lease::init(
                &runtime,
                &control_plane_namespace,
                &controller_deployment_name,
                &hostname,
            )
            .await?;
            Some((claims, hostname))
        };

        // Every replica indexes; only the lease holder writes.
        let namespaces = runtime.watch_all::<k8s::Namespace>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(index.clone(), namespaces).instrument(info_span!("namespaces")),
        );

        let pods = runtime.watch_all::<k8s::Pod>(watcher::Config::default());
        tokio::spawn(kubert::index::namespaced(index.clone(), pods).instrument(info_span!("pods")));

        let policies = runtime.watch_all::<k8s::NetworkPolicy>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), policies)
                .instrument(info_span!("networkpolicies")),
        );

        let nodes = runtime.watch_all::<k8s::Node>(watcher::Config::default());
        tokio::spawn(kubert::index::cluster(index.clone(), nodes).instrument(info_span!("nodes")));

        // The transactional database client is provided by the deployment; without one, state is
        // kept in process.
        warn!("No SDN database configured; using the in-memory backend");
        let backend = Arc::new(MemoryBackend::new());

        let controller = tokio::spawn(
            controller(index, backend, config, engine_metrics, keys_rx, claims)
                .instrument(info_span!("controller")),
        );

        tokio::select! {
            res = runtime.run() => {
                if res.is_err() {
                    bail!("Aborted");
                }
            }
            res = controller => match res {
                Ok(Ok(())) => info!("Controller stopped"),
                Ok(Err(error)) => bail!(error),
                Err(error) => bail!("controller task failed: {error}"),
            },
        }

        Ok(())
    }
}

/// Waits for the write lease and the initial resource lists, migrates existing backend state, and
/// then reconciles until the lease is lost.
async fn controller(
    index: SharedIndex,
    backend: Arc<MemoryBackend>,
    config: EngineConfig,
    metrics: EngineMetrics,
    mut keys: mpsc::UnboundedReceiver<Key>,
    claims: Option<(
        tokio::sync::watch::Receiver<Arc<kubert::lease::Claim>>,
        String,
    )>,
) -> Result<()> {
    // Keys emitted before the engine starts are covered by its initial pass over the index.
    let discard = async {
        while keys.recv().await.is_some() {}
    };
    let ready = async {
        if let Some((claims, hostname)) = &claims {
            let mut claims = claims.clone();
            lease::acquired(&mut claims, hostname).await;
            info!(%hostname, "Acquired write lease");
        }
        let mut synced = index.read().synced();
        if synced.wait_for(|s| s.all()).await.is_err() {
            warn!("Index dropped before it synced");
        }
        info!("Index synced");
    };
    tokio::select! {
        () = ready => {}
        () = discard => return Ok(()),
    }

    let scanner = Scanner::new(index.clone(), backend.clone(), config.backoff);
    let report = match scanner.run().await {
        Ok(report) => report,
        Err(error) => {
            // Reconciliation rewrites every current row anyway.
            warn!(%error, "Migration scan failed");
            Default::default()
        }
    };

    let engine = Engine::new(index, backend, config, metrics);
    engine.mark_committed(report.live);
    let run = engine.run(keys);

    match claims {
        None => run.await,
        Some((claims, hostname)) => {
            tokio::select! {
                () = run => {}
                () = lease::lost(claims, &hostname) => bail!("lost the write lease"),
            }
        }
    }
    Ok(())
}
