//! Label selector matching for namespaces
//!
//! A DynaKube opts namespaces into code-module injection with a standard
//! [`LabelSelector`]. An empty selector selects nothing: namespaces must be
//! opted in explicitly.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use std::collections::BTreeMap;

/// Namespace labels.
pub type Labels = BTreeMap<String, String>;

/// Indicates that a selector requirement is malformed.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidSelector {
    /// The operator is not one of `In`, `NotIn`, `Exists` or `DoesNotExist`.
    #[error("unknown operator {operator:?} for key {key}")]
    UnknownOperator {
        /// The requirement's key.
        key: String,
        /// The unrecognized operator.
        operator: String,
    },

    /// `In` and `NotIn` require values; `Exists` and `DoesNotExist` forbid them.
    #[error("operator {operator} for key {key} {expectation}")]
    Values {
        /// The requirement's key.
        key: String,
        /// The requirement's operator.
        operator: String,
        /// What was expected of the values.
        expectation: &'static str,
    },
}

/// Returns true if `labels` satisfies the selector.
pub fn selector_matches(selector: &LabelSelector, labels: &Labels) -> Result<bool, InvalidSelector> {
    let match_labels = selector.match_labels.as_ref().filter(|m| !m.is_empty());
    let expressions = selector
        .match_expressions
        .as_deref()
        .filter(|e| !e.is_empty());

    if match_labels.is_none() && expressions.is_none() {
        return Ok(false);
    }

    if let Some(match_labels) = match_labels {
        if !are_labels_matching(match_labels, labels) {
            return Ok(false);
        }
    }

    match expressions {
        Some(expressions) => are_expressions_matching(expressions, labels),
        None => Ok(true),
    }
}

/// Returns true if every entry of `to_match` is present in `labels` with the
/// same value. An empty `to_match` matches nothing.
pub fn are_labels_matching(to_match: &Labels, labels: &Labels) -> bool {
    !to_match.is_empty() && to_match.iter().all(|(k, v)| labels.get(k) == Some(v))
}

/// Returns true if every requirement is satisfied by `labels`.
pub fn are_expressions_matching(
    requirements: &[LabelSelectorRequirement],
    labels: &Labels,
) -> Result<bool, InvalidSelector> {
    for req in requirements {
        if !requirement_matches(req, labels)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn requirement_matches(
    req: &LabelSelectorRequirement,
    labels: &Labels,
) -> Result<bool, InvalidSelector> {
    let values = req.values.as_deref().unwrap_or_default();
    let value = labels.get(&req.key);
    let expect = |expectation: &'static str| InvalidSelector::Values {
        key: req.key.clone(),
        operator: req.operator.clone(),
        expectation,
    };

    match req.operator.as_str() {
        "In" | "NotIn" if values.is_empty() => Err(expect("requires values")),
        "Exists" | "DoesNotExist" if !values.is_empty() => Err(expect("forbids values")),
        "In" => Ok(value.is_some_and(|v| values.contains(v))),
        "NotIn" => Ok(!value.is_some_and(|v| values.contains(v))),
        "Exists" => Ok(value.is_some()),
        "DoesNotExist" => Ok(value.is_none()),
        _ => Err(InvalidSelector::UnknownOperator {
            key: req.key.clone(),
            operator: req.operator.clone(),
        }),
    }
}
