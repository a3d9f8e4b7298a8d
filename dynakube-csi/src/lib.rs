//! A CSI node plugin that shares monitoring-agent binaries with pods
//!
//! Agent payloads are downloaded once per tenant and version into a shared
//! directory tree and bind-mounted read-only into every pod that requests
//! them. Pods record their use of a version in a ledger so that outdated,
//! unreferenced versions can be garbage-collected without racing live mounts.
//!
//! # Modules
//!
//! - [`layout`]: where everything lives on disk.
//! - [`fs`]: the injectable [`Filesystem`] capability.
//! - [`bind`]: resolves a pod's namespace to the paths it should mount.
//! - [`installer`]: downloads and unpacks agent packages.
//! - [`publish`]: the node publish/unpublish state machine.
//! - [`csi`]: the gRPC `Identity` and `Node` services.
//! - [`provisioner`]: installs the latest agent and records the current version.
//! - [`gc`]: removes unreferenced, outdated agent versions.
//! - [`controller`]: drives provisioning and garbage collection per DynaKube.

#![deny(rust_2018_idioms)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod bind;
pub mod cluster;
pub mod controller;
pub mod crd;
pub mod csi;
pub mod dtclient;
pub mod fs;
pub mod gc;
pub mod installer;
pub mod labels;
pub mod layout;
pub mod metrics;
pub mod mount;
pub mod provisioner;
pub mod publish;
pub mod requeue;

pub use self::{
    bind::BindConfig,
    crd::DynaKube,
    fs::{Filesystem, MemFs, OsFs},
    layout::{CsiOptions, Layout},
    publish::Publisher,
};

/// The name the plugin registers with the kubelet.
pub const DRIVER_NAME: &str = "csi.oneagent.dynatrace.com";
