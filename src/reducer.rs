//! Per-visitor reduction of a full definition set into a payload that is safe to hand to an
//! untrusted client.
//!
//! The reduced shapes are explicit structs: any field not declared here can't leak into the
//! output. In particular, feature rules, experiment conditions, names, `active` flags and forced
//! variations never make it to the client.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    config::EvaluationOptions,
    definitions::{Attributes, BucketRange, DefinitionSet, ExperimentDefinition, Payload, UrlPattern},
    engine::{EvaluationContext, EvaluationEngine, ExperimentResult, FeatureResult, FeatureSource},
};

/// Definition set narrowed to what one visitor is entitled to see.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReducedDefinitionSet {
    /// Top-level metadata of the raw payload, passed through untouched.
    #[serde(flatten)]
    pub extra: Payload,
    pub features: BTreeMap<String, ReducedFeature>,
    pub experiments: Vec<ReducedExperiment>,
}

/// A feature that is "on" for the visitor.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReducedFeature {
    pub default_value: Value,
    /// Present only when the value was decided by an experiment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<Vec<ForcedRule>>,
}

impl ReducedFeature {
    /// Reduce an evaluation result. Returns `None` when the feature is off.
    ///
    /// Original rules are always dropped; only the resolved value is kept.
    pub fn from_result(result: &FeatureResult) -> Option<ReducedFeature> {
        if result.off() {
            return None;
        }

        let rules = match (&result.source, &result.experiment, &result.experiment_result) {
            (FeatureSource::Experiment, Some(experiment), Some(experiment_result)) => {
                Some(vec![ForcedRule {
                    force: result.value.clone(),
                    tracks: vec![Track {
                        experiment: ReducedExperiment::builder(experiment)
                            .assigned(experiment_result.variation_id)
                            .placeholder(Value::Null)
                            .build(),
                        result: experiment_result.clone(),
                    }],
                }])
            }
            _ => None,
        };

        Some(ReducedFeature {
            default_value: result.value.clone(),
            rules,
        })
    }
}

/// Synthetic rule that forces the already-resolved value and lets the client record the
/// exposure.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ForcedRule {
    pub force: Value,
    pub tracks: Vec<Track>,
}

/// Exposure to report through the client's tracking callback.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub experiment: ReducedExperiment,
    pub result: ExperimentResult,
}

/// An experiment the visitor is part of. Carries only what the client needs to replay the
/// assignment; unassigned variations are replaced with placeholders.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReducedExperiment {
    pub key: String,
    pub variations: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ranges: Option<Vec<BucketRange>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_patterns: Option<Vec<UrlPattern>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_attribute: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_version: Option<u32>,
}

impl ReducedExperiment {
    /// Start building a reduced view of `experiment`.
    pub fn builder(experiment: &ExperimentDefinition) -> ReducedExperimentBuilder<'_> {
        ReducedExperimentBuilder {
            experiment,
            assigned: None,
            placeholder: Value::Object(Default::default()),
        }
    }
}

/// Builder for [`ReducedExperiment`].
pub struct ReducedExperimentBuilder<'a> {
    experiment: &'a ExperimentDefinition,
    assigned: Option<usize>,
    placeholder: Value,
}

impl<'a> ReducedExperimentBuilder<'a> {
    /// Variation index the visitor was assigned. Every other variation gets replaced by the
    /// placeholder. Without an assignment, all variations are replaced.
    pub fn assigned(mut self, variation: usize) -> Self {
        self.assigned = Some(variation);
        self
    }

    /// Placeholder for unassigned variations. Defaults to an empty object.
    pub fn placeholder(mut self, placeholder: Value) -> Self {
        self.placeholder = placeholder;
        self
    }

    pub fn build(self) -> ReducedExperiment {
        let experiment = self.experiment;
        let variations = experiment
            .variations
            .iter()
            .enumerate()
            .map(|(i, variation)| {
                if Some(i) == self.assigned {
                    variation.clone()
                } else {
                    self.placeholder.clone()
                }
            })
            .collect();

        ReducedExperiment {
            key: experiment.key.clone(),
            variations,
            ranges: experiment.ranges.clone(),
            seed: experiment.seed.clone(),
            phase: experiment.phase.clone(),
            url_patterns: experiment.url_patterns.clone(),
            weights: experiment.weights.clone(),
            coverage: experiment.coverage,
            hash_attribute: experiment.hash_attribute.clone(),
            hash_version: experiment.hash_version,
        }
    }
}

/// Reduce `payload` for a visitor with `attributes` using engine `E`.
///
/// This is a pure function of its inputs: the same payload and attributes always produce the
/// same output.
pub fn reduce<E: EvaluationEngine>(
    payload: &Payload,
    attributes: &Attributes,
    options: &EvaluationOptions,
) -> ReducedDefinitionSet {
    let definitions = match DefinitionSet::from_payload(payload) {
        Ok(definitions) => definitions,
        Err(err) => {
            log::warn!(target: "feature_proxy", "malformed features/experiments collections, serving none: {:?}", err);
            return ReducedDefinitionSet {
                extra: without_collections(payload),
                ..ReducedDefinitionSet::default()
            };
        }
    };

    if definitions.is_empty() {
        return ReducedDefinitionSet {
            extra: definitions.extra,
            ..ReducedDefinitionSet::default()
        };
    }

    let mut engine = E::new(EvaluationContext {
        attributes: attributes.clone(),
        features: definitions.parsed_features(),
        experiments: definitions.parsed_experiments(),
        forced_variations: options.forced_variations.clone(),
        url: options.url.clone(),
        debug: options.verbose_debugging,
    });
    engine.set_debug(options.verbose_debugging);

    let features: BTreeMap<String, ReducedFeature> = engine
        .feature_keys()
        .into_iter()
        .filter_map(|key| {
            let result = engine.eval_feature(&key);
            ReducedFeature::from_result(&result).map(|feature| (key, feature))
        })
        .collect();

    let experiments: Vec<ReducedExperiment> = engine
        .experiments()
        .iter()
        .filter_map(|experiment| {
            let result = engine.run(experiment);
            result.in_experiment.then(|| {
                ReducedExperiment::builder(experiment)
                    .assigned(result.variation_id)
                    .build()
            })
        })
        .collect();

    log::trace!(target: "feature_proxy",
                features = features.len(),
                experiments = experiments.len();
                "reduced definitions for visitor");

    ReducedDefinitionSet {
        extra: definitions.extra,
        features,
        experiments,
    }
}

fn without_collections(payload: &Payload) -> Payload {
    payload
        .iter()
        .filter(|(key, _)| !matches!(key.as_str(), "features" | "experiments"))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}
