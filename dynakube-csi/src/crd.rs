//! The subset of the `DynaKube` custom resource read by the plugin

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{CustomResource, ResourceExt};
use serde::{Deserialize, Serialize};

/// Describes a monitored Dynatrace environment.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize)]
#[kube(
    group = "dynatrace.com",
    version = "v1alpha1",
    kind = "DynaKube",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct DynaKubeSpec {
    /// The environment's API endpoint, e.g. `https://<tenant>.live.dynatrace.com/api`.
    pub api_url: String,

    /// Name of the secret holding the `apiToken` and `paasToken` keys.
    /// Defaults to the DynaKube's name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<String>,

    /// Disables TLS verification of the API endpoint.
    #[serde(default)]
    pub skip_cert_check: bool,

    /// Code-module injection settings.
    #[serde(default)]
    pub code_modules: CodeModulesSpec,
}

/// Selects the namespaces whose pods receive agent binaries.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeModulesSpec {
    /// Whether the CSI driver serves this DynaKube at all.
    #[serde(default)]
    pub enabled: bool,

    /// Matches the labels of opted-in namespaces.
    #[serde(default)]
    pub selector: LabelSelector,
}

// === impl DynaKube ===

impl DynaKube {
    /// The name of the secret holding the API tokens.
    pub fn tokens_secret(&self) -> String {
        self.spec
            .tokens
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| self.name_any())
    }

    /// Returns true if code modules are enabled.
    pub fn code_modules_enabled(&self) -> bool {
        self.spec.code_modules.enabled
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn deserializes_camel_case() {
        let dk: DynaKube = serde_json::from_value(serde_json::json!({
            "apiVersion": "dynatrace.com/v1alpha1",
            "kind": "DynaKube",
            "metadata": { "name": "dk", "namespace": "dynatrace" },
            "spec": {
                "apiUrl": "https://tenant.live.dynatrace.com/api",
                "skipCertCheck": true,
                "codeModules": {
                    "enabled": true,
                    "selector": { "matchLabels": { "inject": "dk" } }
                }
            }
        }))
        .unwrap();

        assert_eq!(dk.spec.api_url, "https://tenant.live.dynatrace.com/api");
        assert!(dk.spec.skip_cert_check);
        assert!(dk.code_modules_enabled());
        assert_eq!(dk.tokens_secret(), "dk");
        assert_eq!(
            dk.spec
                .code_modules
                .selector
                .match_labels
                .as_ref()
                .and_then(|l| l.get("inject"))
                .map(String::as_str),
            Some("dk")
        );
    }

    #[test]
    fn tokens_secret_overrides_name() {
        let mut dk = DynaKube::new("dk", DynaKubeSpec::default());
        dk.spec.tokens = Some("dk-tokens".to_string());
        assert_eq!(dk.tokens_secret(), "dk-tokens");
        dk.spec.tokens = Some(String::new());
        assert_eq!(dk.tokens_secret(), "dk");
    }
}
