//! Feature and experiment definitions as served by the upstream feature API.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Raw upstream payload. Always a JSON object; fields other than `features` and `experiments`
/// are opaque metadata.
pub type Payload = serde_json::Map<String, Value>;

/// Visitor attributes supplied per evaluation request.
///
/// Values are arbitrary JSON so that nested attributes (`company.plan`) and arrays can be
/// targeted.
pub type Attributes = serde_json::Map<String, Value>;

/// Bucket range `[start, end)` in the `0..1` hash space.
pub type BucketRange = (f64, f64);

/// Namespace `(id, start, end)`. Experiments in the same namespace with non-overlapping ranges
/// are mutually exclusive.
pub type Namespace = (String, f64, f64);

/// Typed view of a [`Payload`].
///
/// `features` and `experiments` are kept optional so that a payload carrying neither can be
/// detected without guessing.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionSet {
    /// Feature definitions by feature key.
    ///
    /// Each value is wrapped in `TryParse` so that one malformed feature does not prevent serving
    /// the rest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<BTreeMap<String, TryParse<FeatureDefinition>>>,
    /// Auto experiments (visual editor / URL redirect experiments).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiments: Option<Vec<TryParse<ExperimentDefinition>>>,
    /// Any other top-level field. Passed through untouched.
    #[serde(flatten)]
    pub extra: Payload,
}

impl DefinitionSet {
    /// Interpret a raw payload.
    pub fn from_payload(payload: &Payload) -> serde_json::Result<DefinitionSet> {
        serde_json::from_value(Value::Object(payload.clone()))
    }

    /// Returns `true` if the payload has no feature and no experiment collection.
    pub fn is_empty(&self) -> bool {
        self.features.is_none() && self.experiments.is_none()
    }

    /// Successfully parsed features. Malformed ones are reported and skipped.
    pub fn parsed_features(&self) -> BTreeMap<String, FeatureDefinition> {
        self.features
            .iter()
            .flatten()
            .filter_map(|(key, feature)| {
                let Some(feature) = Option::<&FeatureDefinition>::from(feature) else {
                    log::warn!(target: "feature_proxy", feature_key = key.as_str(); "skipping unparseable feature definition");
                    return None;
                };
                Some((key.clone(), feature.clone()))
            })
            .collect()
    }

    /// Successfully parsed experiments, in payload order. Malformed ones are reported and
    /// skipped.
    pub fn parsed_experiments(&self) -> Vec<ExperimentDefinition> {
        self.experiments
            .iter()
            .flatten()
            .enumerate()
            .filter_map(|(index, experiment)| {
                let experiment: Option<&ExperimentDefinition> = experiment.into();
                if experiment.is_none() {
                    log::warn!(target: "feature_proxy", index; "skipping unparseable experiment definition");
                }
                experiment.cloned()
            })
            .collect()
    }
}

/// `TryParse` allows the subfield to fail parsing without failing the parsing of the whole
/// structure.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum TryParse<T> {
    /// Successfully parsed.
    Parsed(T),
    /// Parsing failed.
    ParseFailed(Value),
}

impl<'a, T> From<&'a TryParse<T>> for Option<&'a T> {
    fn from(value: &'a TryParse<T>) -> Option<&'a T> {
        match value {
            TryParse::Parsed(definition) => Some(definition),
            TryParse::ParseFailed(_) => None,
        }
    }
}

/// A feature: default value plus an ordered list of override rules.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct FeatureDefinition {
    #[serde(default)]
    pub default_value: Value,
    #[serde(default)]
    pub rules: Vec<FeatureRule>,
}

/// A single feature rule. A rule either forces a value (`force`) or runs an experiment
/// (`variations`).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct FeatureRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Vec<Filter>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variations: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_attribute: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<BucketRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ranges: Option<Vec<BucketRange>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<Namespace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Vec<VariationMeta>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

/// An experiment, either declared at the top level of the payload or derived from a feature
/// rule.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct ExperimentDefinition {
    pub key: String,
    pub variations: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_attribute: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ranges: Option<Vec<BucketRange>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_patterns: Option<Vec<UrlPattern>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Vec<Filter>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<Namespace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Vec<VariationMeta>>,
}

impl ExperimentDefinition {
    /// Attribute used to hash the visitor into a bucket. Defaults to `id`.
    pub fn hash_attribute(&self) -> &str {
        self.hash_attribute.as_deref().unwrap_or("id")
    }

    /// Hash seed. Defaults to the experiment key.
    pub fn seed(&self) -> &str {
        self.seed.as_deref().unwrap_or(&self.key)
    }
}

/// Per-variation metadata.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct VariationMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passthrough: Option<bool>,
}

/// Hash-based filter. The visitor passes the filter if its hash falls into one of `ranges`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    pub seed: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_version: Option<u32>,
    pub ranges: Vec<BucketRange>,
}

/// URL targeting pattern of an auto experiment.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct UrlPattern {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<bool>,
    #[serde(rename = "type")]
    pub kind: UrlPatternKind,
    pub pattern: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum UrlPatternKind {
    Simple,
    Regex,
}
