//! Reads from the Kubernetes API
//!
//! Everything the plugin needs to know about the cluster is behind
//! [`Cluster`] so that resolution can be tested without an API server.

use crate::{crd::DynaKube, labels::Labels};
use k8s_openapi::api::core::v1::{Namespace, Secret};
use kube::{api::ListParams, Api, ResourceExt};
use std::collections::BTreeMap;

/// Errors from the Kubernetes API.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The object does not exist.
    #[error("{kind} {name} not found")]
    NotFound {
        /// The object's kind.
        kind: &'static str,
        /// The object's name.
        name: String,
    },

    /// The API request failed.
    #[error(transparent)]
    Api(#[from] kube::Error),
}

/// Cluster state consumed by the plugin.
#[async_trait::async_trait]
pub trait Cluster: Send + Sync + 'static {
    /// Returns the labels of a namespace.
    async fn namespace_labels(&self, namespace: &str) -> Result<Labels, Error>;

    /// Lists the DynaKubes in all namespaces.
    async fn dynakubes(&self) -> Result<Vec<DynaKube>, Error>;

    /// Fetches one DynaKube, or `None` if it no longer exists.
    async fn dynakube(&self, namespace: &str, name: &str) -> Result<Option<DynaKube>, Error>;

    /// Reads the data of a secret.
    async fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, Error>;
}

/// A [`Cluster`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeCluster {
    client: kube::Client,
}

// === impl KubeCluster ===

impl KubeCluster {
    /// Wraps a Kubernetes client.
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Cluster for KubeCluster {
    async fn namespace_labels(&self, namespace: &str) -> Result<Labels, Error> {
        let api = Api::<Namespace>::all(self.client.clone());
        let ns = api.get_opt(namespace).await?.ok_or_else(|| Error::NotFound {
            kind: "namespace",
            name: namespace.to_string(),
        })?;
        Ok(ns.labels().clone())
    }

    async fn dynakubes(&self) -> Result<Vec<DynaKube>, Error> {
        let api = Api::<DynaKube>::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn dynakube(&self, namespace: &str, name: &str) -> Result<Option<DynaKube>, Error> {
        let api = Api::<DynaKube>::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, Error> {
        let api = Api::<Secret>::namespaced(self.client.clone(), namespace);
        let secret = api.get_opt(name).await?.ok_or_else(|| Error::NotFound {
            kind: "secret",
            name: format!("{namespace}/{name}"),
        })?;
        Ok(secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect())
    }
}
