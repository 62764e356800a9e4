//! Evaluation engine contract.
//!
//! The reducer treats the engine as a deterministic black box: given definitions and visitor
//! attributes, it reports per-feature values and per-experiment assignments. [`GrowthBookEngine`]
//! is the built-in implementation.
//!
//! [`GrowthBookEngine`]: crate::eval::GrowthBookEngine
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::definitions::{Attributes, ExperimentDefinition, FeatureDefinition};

/// Everything an engine needs to evaluate one visitor.
#[derive(Debug, Clone, Default)]
pub struct EvaluationContext {
    pub attributes: Attributes,
    pub features: BTreeMap<String, FeatureDefinition>,
    pub experiments: Vec<ExperimentDefinition>,
    pub forced_variations: HashMap<String, usize>,
    pub url: Option<String>,
    /// Diagnostics hint. Must not affect results.
    pub debug: bool,
}

/// An evaluation engine instantiated for a single visitor.
pub trait EvaluationEngine {
    /// Create an engine for `context`.
    fn new(context: EvaluationContext) -> Self
    where
        Self: Sized;

    /// Toggle verbose diagnostics.
    fn set_debug(&mut self, debug: bool);

    /// All feature keys known to the engine, in a stable order.
    fn feature_keys(&self) -> Vec<String>;

    /// Evaluate a feature for the visitor.
    fn eval_feature(&self, key: &str) -> FeatureResult;

    /// All experiments known to the engine, in a stable order.
    fn experiments(&self) -> &[ExperimentDefinition];

    /// Run an experiment for the visitor.
    fn run(&self, experiment: &ExperimentDefinition) -> ExperimentResult;
}

/// What decided a feature's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FeatureSource {
    UnknownFeature,
    DefaultValue,
    Force,
    Experiment,
}

/// Result of evaluating a feature.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureResult {
    pub value: Value,
    pub source: FeatureSource,
    pub rule_id: Option<String>,
    /// Experiment that decided the value (when `source` is [`FeatureSource::Experiment`]).
    pub experiment: Option<ExperimentDefinition>,
    pub experiment_result: Option<ExperimentResult>,
}

impl FeatureResult {
    /// A feature is "on" when its value is truthy.
    pub fn on(&self) -> bool {
        is_truthy(&self.value)
    }

    /// Opposite of [`FeatureResult::on`].
    pub fn off(&self) -> bool {
        !self.on()
    }
}

/// Result of running an experiment for a visitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentResult {
    pub in_experiment: bool,
    pub variation_id: usize,
    pub value: Value,
    pub hash_used: bool,
    pub hash_attribute: String,
    pub hash_value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_id: Option<String>,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passthrough: Option<bool>,
}

/// JavaScript truthiness: everything except `null`, `false`, `0` and `""` is truthy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn truthiness() {
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!(0.0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!(-1)));
        assert!(is_truthy(&json!("off")));
        assert!(is_truthy(&json!([])));
        assert!(is_truthy(&json!({})));
    }

    #[test]
    fn experiment_result_wire_format() {
        let result = ExperimentResult {
            in_experiment: true,
            variation_id: 1,
            value: json!("b"),
            hash_used: true,
            hash_attribute: "id".to_owned(),
            hash_value: "123".to_owned(),
            feature_id: None,
            key: "1".to_owned(),
            bucket: Some(0.7),
            name: None,
            passthrough: None,
        };

        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({
                "inExperiment": true,
                "variationId": 1,
                "value": "b",
                "hashUsed": true,
                "hashAttribute": "id",
                "hashValue": "123",
                "key": "1",
                "bucket": 0.7
            })
        );
    }
}
