//! Keeps every DynaKube's environment provisioned and collected
//!
//! Each DynaKube is reconciled when it changes and then again after a fixed
//! interval, whether or not the previous pass succeeded. A pass fetches the
//! tenant and the latest agent version from the Dynatrace API, provisions the
//! environment and finally removes agent versions that no pod uses. Collection
//! only depends on knowing the latest version, so it also runs when
//! provisioning fails.

use crate::{
    cluster::Cluster,
    crd::DynaKube,
    dtclient::{self, ClientFactory},
    gc::{self, GarbageCollector},
    metrics::Metrics,
    provisioner::{self, Provisioner},
    requeue,
};
use futures_util::{Stream, StreamExt};
use kube::runtime::{reflector::ObjectRef, watcher::Event};
use std::{future::Future, sync::Arc, time::Duration};
use tracing::Instrument;

/// How long to wait between passes over the same DynaKube.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// The default deadline for each Dynatrace API call.
pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(30);

const REQUEUE_CAPACITY: usize = 1_000;

/// Why a pass was aborted.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No API client could be built for the DynaKube.
    #[error("failed to create Dynatrace client: {0}")]
    Client(#[source] dtclient::Error),

    /// The tenant could not be determined.
    #[error("failed to fetch connection info: {0}")]
    ConnectionInfo(#[source] dtclient::Error),

    /// The latest agent version could not be determined.
    #[error("failed to query OneAgent version: {0}")]
    LatestVersion(#[source] dtclient::Error),

    /// An API call did not finish in time.
    #[error("{call} timed out after {timeout:?}")]
    Timeout {
        /// The call that timed out.
        call: &'static str,
        /// The deadline.
        timeout: Duration,
    },

    /// The environment could not be provisioned.
    #[error(transparent)]
    Provision(#[from] provisioner::Error),

    /// Garbage collection failed.
    #[error("garbage collection failed: {0}")]
    Collect(#[from] gc::Error),

    /// The garbage collection task panicked.
    #[error("garbage collection task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// The result of a successful pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Code modules are disabled; nothing was done.
    Disabled,

    /// The environment is provisioned and collected.
    Reconciled {
        /// The DynaKube's tenant.
        tenant_uuid: String,
        /// The version the environment now points at.
        version: String,
        /// Whether the agent had to be downloaded.
        installed: bool,
        /// What garbage collection did.
        summary: gc::Summary,
    },
}

/// Reconciles DynaKubes.
#[derive(Clone)]
pub struct Controller {
    cluster: Arc<dyn Cluster>,
    clients: Arc<dyn ClientFactory>,
    provisioner: Provisioner,
    gc: GarbageCollector,
    metrics: Metrics,
    interval: Duration,
    api_timeout: Duration,
}

// === impl Controller ===

impl Controller {
    /// Creates a controller with the default interval and API deadline.
    pub fn new(
        cluster: Arc<dyn Cluster>,
        clients: Arc<dyn ClientFactory>,
        provisioner: Provisioner,
        gc: GarbageCollector,
        metrics: Metrics,
    ) -> Self {
        Self {
            cluster,
            clients,
            provisioner,
            gc,
            metrics,
            interval: DEFAULT_INTERVAL,
            api_timeout: DEFAULT_API_TIMEOUT,
        }
    }

    /// Sets the time between passes over the same DynaKube.
    pub fn with_interval(self, interval: Duration) -> Self {
        Self { interval, ..self }
    }

    /// Sets the deadline for each Dynatrace API call.
    pub fn with_api_timeout(self, api_timeout: Duration) -> Self {
        Self {
            api_timeout,
            ..self
        }
    }

    /// Reconciles DynaKubes as they are announced by `events` until the
    /// stream ends.
    pub async fn run(self, events: impl Stream<Item = Event<DynaKube>>) {
        let (tx, mut rx) = requeue::channel(REQUEUE_CAPACITY);
        tokio::pin!(events);

        loop {
            tokio::select! {
                ev = events.next() => match ev {
                    Some(Event::Apply(dk) | Event::InitApply(dk)) => {
                        let key = ObjectRef::from_obj(&dk);
                        tracing::debug!(dynakube = %key, "Scheduling pass");
                        let _ = tx.requeue(key, Duration::ZERO).await;
                    }
                    Some(Event::Delete(dk)) => {
                        tracing::debug!(dynakube = %ObjectRef::from_obj(&dk), "Deleted");
                    }
                    Some(Event::Init | Event::InitDone) => {}
                    None => {
                        tracing::debug!("DynaKube watch completed");
                        return;
                    }
                },

                Some(key) = rx.recv() => {
                    let span = tracing::info_span!(
                        "dynakube",
                        namespace = key.namespace.as_deref().unwrap_or_default(),
                        name = %key.name,
                    );
                    if self.reconcile_ref(&key).instrument(span).await {
                        let _ = tx.requeue(key, self.interval).await;
                    }
                }
            }
        }
    }

    /// Returns false if the DynaKube no longer exists.
    async fn reconcile_ref(&self, key: &ObjectRef<DynaKube>) -> bool {
        let namespace = key.namespace.as_deref().unwrap_or_default();
        let dk = match self.cluster.dynakube(namespace, &key.name).await {
            Ok(Some(dk)) => dk,
            Ok(None) => {
                tracing::debug!("DynaKube no longer exists");
                return false;
            }
            Err(error) => {
                tracing::warn!(%error, "Failed to fetch DynaKube");
                return true;
            }
        };

        match self.reconcile(&dk).await {
            Ok(outcome) => tracing::debug!(?outcome, "Reconciled"),
            Err(error) => tracing::warn!(%error, "Reconciliation failed"),
        }
        true
    }

    /// Runs one pass over `dk`.
    pub async fn reconcile(&self, dk: &DynaKube) -> Result<Outcome, Error> {
        if !dk.code_modules_enabled() {
            tracing::debug!("Code modules disabled");
            return Ok(Outcome::Disabled);
        }

        let client = self
            .deadline("client setup", self.clients.client(dk))
            .await?
            .map_err(Error::Client)?;
        let info = self
            .deadline("connection info", client.get_connection_info())
            .await?
            .map_err(Error::ConnectionInfo)?;
        let version = self
            .deadline(
                "latest version",
                client.get_latest_agent_version(dtclient::OS_UNIX, dtclient::INSTALLER_TYPE_PAAS),
            )
            .await?
            .map_err(Error::LatestVersion)?;

        let provisioned = self
            .provisioner
            .provision(dk, client, &info.tenant_uuid, &version)
            .await;

        let collected = {
            let gc = self.gc.clone();
            let tenant_uuid = info.tenant_uuid.clone();
            let version = version.clone();
            tokio::task::spawn_blocking(move || gc.collect(&tenant_uuid, &version)).await?
        };
        self.metrics
            .gc_pass(collected.as_ref().ok().map(|summary| summary.removed.len()));
        if let Ok(summary) = &collected {
            if !summary.removed.is_empty() {
                tracing::info!(removed = ?summary.removed, "Collected unused versions");
            }
        }

        let (installed, summary) = match (provisioned, collected) {
            (Ok(installed), Ok(summary)) => (installed, summary),
            (Ok(_), Err(error)) => return Err(error.into()),
            (Err(error), Ok(_)) => return Err(error.into()),
            (Err(error), Err(collect)) => {
                tracing::warn!(error = %collect, "Garbage collection failed");
                return Err(error.into());
            }
        };

        Ok(Outcome::Reconciled {
            tenant_uuid: info.tenant_uuid,
            version,
            installed,
            summary,
        })
    }

    async fn deadline<T>(
        &self,
        call: &'static str,
        fut: impl Future<Output = T>,
    ) -> Result<T, Error> {
        tokio::time::timeout(self.api_timeout, fut)
            .await
            .map_err(|_| Error::Timeout {
                call,
                timeout: self.api_timeout,
            })
    }
}
