#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::{bail, Result};
use clap::Parser;
use dynakube_csi::{
    bind::Resolver,
    cluster::{Cluster, KubeCluster},
    controller::Controller,
    csi::{self, NodeService},
    dtclient::{ClientFactory, SecretClientFactory},
    gc::GarbageCollector,
    installer::Package,
    metrics::Metrics,
    mount::HostMounter,
    provisioner::{self, Provisioner},
    CsiOptions, DynaKube, Filesystem, Layout, OsFs, Publisher,
};
use kube::runtime::watcher;
use std::{path::PathBuf, sync::Arc};
use tokio::time;
use tracing::Instrument;

#[derive(Clone, Parser)]
#[clap(version, about)]
struct Args {
    /// The tracing filter used for logs
    #[clap(
        long,
        env = "DYNAKUBE_CSI_LOG",
        default_value = "dynakube_csi=info,warn"
    )]
    log_level: kubert::LogFilter,

    /// The logging format
    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The name of the node this plugin runs on
    #[clap(long, env = "NODE_NAME")]
    node_id: String,

    /// The unix socket the kubelet connects to
    #[clap(long, default_value = "unix:///csi/csi.sock")]
    endpoint: String,

    /// The plugin's state directory on the host
    #[clap(
        long,
        default_value = "/var/lib/kubelet/plugins/csi.oneagent.dynatrace.com"
    )]
    root_dir: PathBuf,

    /// The time between garbage collection passes over a DynaKube
    #[clap(long, default_value = "1h")]
    gc_interval: Timeout,

    /// The deadline for each Dynatrace API call and agent download
    #[clap(long, default_value = "30s")]
    api_timeout: Timeout,

    /// The agent package type to install: `zip` or `script`
    #[clap(long, default_value = "zip")]
    agent_package: Package,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Args {
        log_level,
        log_format,
        client,
        admin,
        node_id,
        endpoint,
        root_dir,
        gc_interval: Timeout(gc_interval),
        api_timeout: Timeout(api_timeout),
        agent_package,
    } = Args::parse();

    let opts = CsiOptions {
        node_id,
        endpoint: socket_path(&endpoint),
        root_dir,
    };

    let mut prom = prometheus_client::registry::Registry::default();

    // Register application metrics before configuring the admin server.
    let metrics = Metrics::register(prom.sub_registry_with_prefix("dynakube_csi"));

    let mut rt = kubert::Runtime::builder()
        .with_log(log_level, log_format)
        .with_admin(admin.into_builder().with_prometheus(prom))
        .with_client(client)
        .build()
        .await?;

    let layout = Layout::new(&opts.root_dir);
    let fs: Arc<dyn Filesystem> = Arc::new(OsFs::new());
    let cluster: Arc<dyn Cluster> = Arc::new(KubeCluster::new(rt.client()));
    let clients: Arc<dyn ClientFactory> =
        Arc::new(SecretClientFactory::new(cluster.clone(), api_timeout));
    let arch = provisioner::host_arch();
    tracing::info!(
        node = %opts.node_id,
        root = %opts.root_dir.display(),
        %arch,
        package = %agent_package,
        "Starting"
    );

    let publisher = Publisher::new(
        Resolver::new(cluster.clone(), fs.clone(), layout.clone()),
        fs.clone(),
        Arc::new(HostMounter::new()),
        clients.clone(),
        layout.clone(),
        arch,
        api_timeout,
        metrics.clone(),
    )
    .with_package(agent_package);
    let node = NodeService::new(opts.node_id.clone(), publisher);

    // Provision and collect every DynaKube as it changes and then periodically.
    //
    // The watch completes when shutdown is signaled, which stops the controller.
    let controller = Controller::new(
        cluster,
        clients,
        Provisioner::new(fs.clone(), layout.clone(), arch, api_timeout, metrics.clone())
            .with_package(agent_package),
        GarbageCollector::new(fs, layout),
        metrics,
    )
    .with_interval(gc_interval)
    .with_api_timeout(api_timeout);
    let dynakubes = rt.watch_all::<DynaKube>(watcher::Config::default());
    tokio::spawn(
        controller
            .run(dynakubes)
            .instrument(tracing::info_span!("controller")),
    );

    let shutdown = rt.shutdown_handle();
    let server = tokio::spawn(
        async move {
            let signaled = async move {
                let _ = shutdown.signaled().await;
            };
            csi::serve(&opts.endpoint, node, signaled).await
        }
        .instrument(tracing::info_span!("csi")),
    );

    tokio::select! {
        // Block the main thread on the shutdown signal. If a second signal is
        // received before the controller stops, the future fails.
        res = rt.run() => {
            if res.is_err() {
                bail!("aborted");
            }
        }

        res = server => match res {
            Err(error) => bail!("CSI server task failed: {}", error),
            Ok(Err(error)) => return Err(error.into()),
            Ok(Ok(())) => {
                tracing::debug!("CSI server stopped");
            }
        },
    }

    Ok(())
}

/// Accepts both `unix:///path` and plain paths.
fn socket_path(endpoint: &str) -> PathBuf {
    PathBuf::from(endpoint.strip_prefix("unix://").unwrap_or(endpoint))
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Timeout(time::Duration);

#[derive(Copy, Clone, Debug, thiserror::Error)]
#[error("invalid duration")]
struct InvalidTimeout;

impl std::str::FromStr for Timeout {
    type Err = InvalidTimeout;

    fn from_str(s: &str) -> Result<Self, InvalidTimeout> {
        let re = regex::Regex::new(r"^\s*(\d+)(ms|s|m|h)?\s*$").map_err(|_| InvalidTimeout)?;
        let cap = re.captures(s).ok_or(InvalidTimeout)?;
        let magnitude: u64 = cap[1].parse().map_err(|_| InvalidTimeout)?;
        let secs = |unit: u64| {
            magnitude
                .checked_mul(unit)
                .map(time::Duration::from_secs)
                .ok_or(InvalidTimeout)
        };
        let t = match cap.get(2).map(|m| m.as_str()) {
            None if magnitude == 0 => time::Duration::from_millis(0),
            Some("ms") => time::Duration::from_millis(magnitude),
            Some("s") => secs(1)?,
            Some("m") => secs(60)?,
            Some("h") => secs(60 * 60)?,
            _ => return Err(InvalidTimeout),
        };
        Ok(Self(t))
    }
}
