//! Prometheus metrics

use crate::{layout::Flavor, publish};
use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue},
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

/// Metrics shared by the node service and the controller.
///
/// The default value is not registered anywhere, which is useful in tests.
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    volume_ops: Family<VolumeOpLabels, Counter>,
    installs: Family<InstallLabels, Counter>,
    gc_passes: Family<ResultLabels, Counter>,
    gc_removed_versions: Counter,
}

/// A node volume operation.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum VolumeOp {
    /// `NodePublishVolume`.
    Publish,
    /// `NodeUnpublishVolume`.
    Unpublish,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct VolumeOpLabels {
    op: VolumeOp,
    result: Outcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct InstallLabels {
    flavor: &'static str,
    result: Outcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ResultLabels {
    result: Outcome,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
enum Outcome {
    Ok,
    FailedPrecondition,
    Unavailable,
    Internal,
    InvalidArgument,
    Error,
}

// === impl Metrics ===

impl Metrics {
    /// Creates a new set of metrics and registers them.
    pub fn register(registry: &mut Registry) -> Self {
        let volume_ops = Family::default();
        registry.register(
            "volume_operations",
            "Count of node volume operations by result",
            volume_ops.clone(),
        );

        let installs = Family::default();
        registry.register(
            "agent_installs",
            "Count of agent package installations",
            installs.clone(),
        );

        let gc_passes = Family::default();
        registry.register(
            "gc_passes",
            "Count of garbage collection passes",
            gc_passes.clone(),
        );

        let gc_removed_versions = Counter::default();
        registry.register(
            "gc_removed_versions",
            "Count of agent versions removed by garbage collection",
            gc_removed_versions.clone(),
        );

        Self {
            volume_ops,
            installs,
            gc_passes,
            gc_removed_versions,
        }
    }

    pub(crate) fn volume_op(&self, op: VolumeOp, result: &Result<(), publish::Error>) {
        let result = match result {
            Ok(()) => Outcome::Ok,
            Err(publish::Error::FailedPrecondition(_)) => Outcome::FailedPrecondition,
            Err(publish::Error::Unavailable(_)) => Outcome::Unavailable,
            Err(publish::Error::Internal(_)) => Outcome::Internal,
            Err(publish::Error::InvalidArgument(_)) => Outcome::InvalidArgument,
        };
        self.volume_ops
            .get_or_create(&VolumeOpLabels { op, result })
            .inc();
    }

    pub(crate) fn install(&self, flavor: Flavor, ok: bool) {
        let labels = InstallLabels {
            flavor: flavor.as_str(),
            result: if ok { Outcome::Ok } else { Outcome::Error },
        };
        self.installs.get_or_create(&labels).inc();
    }

    pub(crate) fn gc_pass(&self, removed: Option<usize>) {
        let result = match removed {
            Some(n) => {
                self.gc_removed_versions.inc_by(n as u64);
                Outcome::Ok
            }
            None => Outcome::Error,
        };
        self.gc_passes.get_or_create(&ResultLabels { result }).inc();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encodes_registered_metrics() {
        let mut registry = Registry::default();
        let metrics = Metrics::register(registry.sub_registry_with_prefix("dynakube_csi"));
        metrics.volume_op(VolumeOp::Publish, &Ok(()));
        metrics.volume_op(
            VolumeOp::Publish,
            &Err(publish::Error::Unavailable("later".to_string())),
        );
        metrics.install(Flavor::Musl, true);
        metrics.gc_pass(Some(2));
        metrics.gc_pass(None);

        let mut text = String::new();
        prometheus_client::encoding::text::encode(&mut text, &registry).unwrap();
        assert!(text.contains(
            r#"dynakube_csi_volume_operations_total{op="Publish",result="Ok"} 1"#
        ));
        assert!(text.contains(
            r#"dynakube_csi_volume_operations_total{op="Publish",result="Unavailable"} 1"#
        ));
        assert!(text.contains(r#"dynakube_csi_agent_installs_total{flavor="musl",result="Ok"} 1"#));
        assert!(text.contains("dynakube_csi_gc_removed_versions_total 2"));
        assert!(text.contains(r#"dynakube_csi_gc_passes_total{result="Error"} 1"#));
    }
}
