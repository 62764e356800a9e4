//! Built-in evaluation engine compatible with GrowthBook SDK payloads.
use regex::Regex;
use serde_json::Value;
use url::{Position, Url};

use crate::{
    conditions::{eval_condition, to_js_string},
    definitions::{
        BucketRange, ExperimentDefinition, FeatureRule, Filter, Namespace, UrlPattern,
        UrlPatternKind,
    },
    engine::{EvaluationContext, EvaluationEngine, ExperimentResult, FeatureResult, FeatureSource},
    hash::{bucket_ranges, choose_variation, hash, in_range},
};

/// Deterministic engine: identical context always yields identical results.
#[derive(Debug, Clone)]
pub struct GrowthBookEngine {
    context: EvaluationContext,
}

impl EvaluationEngine for GrowthBookEngine {
    fn new(context: EvaluationContext) -> Self {
        GrowthBookEngine { context }
    }

    fn set_debug(&mut self, debug: bool) {
        self.context.debug = debug;
    }

    fn feature_keys(&self) -> Vec<String> {
        self.context.features.keys().cloned().collect()
    }

    fn eval_feature(&self, key: &str) -> FeatureResult {
        let Some(feature) = self.context.features.get(key) else {
            self.trace(key, "unknown feature");
            return FeatureResult {
                value: Value::Null,
                source: FeatureSource::UnknownFeature,
                rule_id: None,
                experiment: None,
                experiment_result: None,
            };
        };

        for rule in &feature.rules {
            if let Some(condition) = &rule.condition {
                if !eval_condition(&self.context.attributes, condition) {
                    self.trace(key, "skip rule because of condition");
                    continue;
                }
            }

            if self.is_filtered_out(rule.filters.as_deref()) {
                self.trace(key, "skip rule because of filters");
                continue;
            }

            if let Some(force) = &rule.force {
                if !self.is_included_in_rollout(
                    rule.seed.as_deref().unwrap_or(key),
                    rule.hash_attribute.as_deref(),
                    rule.range,
                    rule.coverage,
                    rule.hash_version,
                ) {
                    self.trace(key, "skip rule because user not included in rollout");
                    continue;
                }

                self.trace(key, "force value from rule");
                return FeatureResult {
                    value: force.clone(),
                    source: FeatureSource::Force,
                    rule_id: rule.id.clone(),
                    experiment: None,
                    experiment_result: None,
                };
            }

            let Some(experiment) = experiment_from_rule(key, rule) else {
                continue;
            };

            let result = self.run_experiment(&experiment, Some(key));
            if result.in_experiment && !result.passthrough.unwrap_or(false) {
                self.trace(key, "use feature value from experiment");
                return FeatureResult {
                    value: result.value.clone(),
                    source: FeatureSource::Experiment,
                    rule_id: rule.id.clone(),
                    experiment: Some(experiment),
                    experiment_result: Some(result),
                };
            }
        }

        self.trace(key, "use default value");
        FeatureResult {
            value: feature.default_value.clone(),
            source: FeatureSource::DefaultValue,
            rule_id: None,
            experiment: None,
            experiment_result: None,
        }
    }

    fn experiments(&self) -> &[ExperimentDefinition] {
        &self.context.experiments
    }

    fn run(&self, experiment: &ExperimentDefinition) -> ExperimentResult {
        self.run_experiment(experiment, None)
    }
}

/// Build the experiment described by an experiment rule. Returns `None` for rules without
/// variations.
///
/// Condition and filters are left out as they are checked before running the experiment.
fn experiment_from_rule(feature_key: &str, rule: &FeatureRule) -> Option<ExperimentDefinition> {
    let variations = rule.variations.clone()?;
    Some(ExperimentDefinition {
        key: rule.key.clone().unwrap_or_else(|| feature_key.to_owned()),
        variations,
        weights: rule.weights.clone(),
        coverage: rule.coverage,
        hash_attribute: rule.hash_attribute.clone(),
        hash_version: rule.hash_version,
        seed: rule.seed.clone(),
        ranges: rule.ranges.clone(),
        namespace: rule.namespace.clone(),
        meta: rule.meta.clone(),
        name: rule.name.clone(),
        phase: rule.phase.clone(),
        ..ExperimentDefinition::default()
    })
}

impl GrowthBookEngine {
    fn run_experiment(
        &self,
        experiment: &ExperimentDefinition,
        feature_id: Option<&str>,
    ) -> ExperimentResult {
        let key = experiment.key.as_str();

        if experiment.variations.len() < 2 {
            self.trace(key, "invalid experiment");
            return self.result(experiment, None, false, feature_id, None);
        }

        if let Some(&forced) = self.context.forced_variations.get(key) {
            self.trace(key, "force via dev tools");
            return self.result(experiment, Some(forced), false, feature_id, None);
        }

        if experiment.active == Some(false) {
            self.trace(key, "skip because inactive");
            return self.result(experiment, None, false, feature_id, None);
        }

        let hash_value = self.hash_value(experiment.hash_attribute());
        if hash_value.is_empty() {
            self.trace(key, "skip because missing hashAttribute");
            return self.result(experiment, None, false, feature_id, None);
        }

        if experiment.filters.is_some() {
            if self.is_filtered_out(experiment.filters.as_deref()) {
                self.trace(key, "skip because of filters");
                return self.result(experiment, None, false, feature_id, None);
            }
        } else if let Some(namespace) = &experiment.namespace {
            if !in_namespace(&hash_value, namespace) {
                self.trace(key, "skip because of namespace");
                return self.result(experiment, None, false, feature_id, None);
            }
        }

        if let Some(patterns) = &experiment.url_patterns {
            if !self.is_url_targeted(patterns) {
                self.trace(key, "skip because of url targeting");
                return self.result(experiment, None, false, feature_id, None);
            }
        }

        if let Some(condition) = &experiment.condition {
            if !eval_condition(&self.context.attributes, condition) {
                self.trace(key, "skip because of condition");
                return self.result(experiment, None, false, feature_id, None);
            }
        }

        let Some(n) = hash(
            experiment.seed(),
            &hash_value,
            experiment.hash_version.unwrap_or(1),
        ) else {
            self.trace(key, "skip because of invalid hash version");
            return self.result(experiment, None, false, feature_id, None);
        };

        let ranges = experiment.ranges.clone().unwrap_or_else(|| {
            bucket_ranges(
                experiment.variations.len(),
                experiment.coverage,
                experiment.weights.as_deref(),
            )
        });

        let Some(assigned) = choose_variation(n, &ranges) else {
            self.trace(key, "skip because of coverage");
            return self.result(experiment, None, false, feature_id, None);
        };

        if let Some(force) = experiment.force {
            self.trace(key, "force variation");
            return self.result(experiment, Some(force), false, feature_id, None);
        }

        self.trace(key, "in experiment");
        self.result(experiment, Some(assigned), true, feature_id, Some(n))
    }

    fn result(
        &self,
        experiment: &ExperimentDefinition,
        variation: Option<usize>,
        hash_used: bool,
        feature_id: Option<&str>,
        bucket: Option<f64>,
    ) -> ExperimentResult {
        let (variation_id, in_experiment) = match variation {
            Some(index) if index < experiment.variations.len() => (index, true),
            _ => (0, false),
        };

        let meta = experiment
            .meta
            .as_ref()
            .and_then(|meta| meta.get(variation_id));

        ExperimentResult {
            in_experiment,
            variation_id,
            value: experiment
                .variations
                .get(variation_id)
                .cloned()
                .unwrap_or(Value::Null),
            hash_used,
            hash_attribute: experiment.hash_attribute().to_owned(),
            hash_value: self.hash_value(experiment.hash_attribute()),
            feature_id: feature_id.map(ToOwned::to_owned),
            key: meta
                .and_then(|meta| meta.key.clone())
                .unwrap_or_else(|| variation_id.to_string()),
            bucket,
            name: meta.and_then(|meta| meta.name.clone()),
            passthrough: meta.and_then(|meta| meta.passthrough).filter(|p| *p),
        }
    }

    fn hash_value(&self, hash_attribute: &str) -> String {
        self.context
            .attributes
            .get(hash_attribute)
            .and_then(to_js_string)
            .unwrap_or_default()
    }

    fn is_filtered_out(&self, filters: Option<&[Filter]>) -> bool {
        filters.unwrap_or_default().iter().any(|filter| {
            let hash_value = self.hash_value(filter.attribute.as_deref().unwrap_or("id"));
            if hash_value.is_empty() {
                return true;
            }
            match hash(&filter.seed, &hash_value, filter.hash_version.unwrap_or(2)) {
                Some(n) => !filter.ranges.iter().any(|range| in_range(n, *range)),
                None => true,
            }
        })
    }

    fn is_included_in_rollout(
        &self,
        seed: &str,
        hash_attribute: Option<&str>,
        range: Option<BucketRange>,
        coverage: Option<f64>,
        hash_version: Option<u32>,
    ) -> bool {
        if range.is_none() && coverage.is_none() {
            return true;
        }

        let hash_value = self.hash_value(hash_attribute.unwrap_or("id"));
        if hash_value.is_empty() {
            return false;
        }

        let Some(n) = hash(seed, &hash_value, hash_version.unwrap_or(1)) else {
            return false;
        };

        match (range, coverage) {
            (Some(range), _) => in_range(n, range),
            (None, Some(coverage)) => n <= coverage,
            (None, None) => true,
        }
    }

    fn is_url_targeted(&self, patterns: &[UrlPattern]) -> bool {
        let Some(url) = self.context.url.as_deref().and_then(|u| Url::parse(u).ok()) else {
            return false;
        };
        if patterns.is_empty() {
            return false;
        }

        let mut has_include_rules = false;
        let mut is_included = false;
        for pattern in patterns {
            let matches = url_pattern_matches(&url, pattern);
            if pattern.include == Some(false) {
                if matches {
                    return false;
                }
            } else {
                has_include_rules = true;
                is_included |= matches;
            }
        }

        is_included || !has_include_rules
    }

    fn trace(&self, key: &str, message: &str) {
        if self.context.debug {
            log::debug!(target: "feature_proxy", key; "{}", message);
        }
    }
}

fn in_namespace(hash_value: &str, (id, start, end): &Namespace) -> bool {
    match hash(&format!("__{id}"), hash_value, 1) {
        Some(n) => n >= *start && n < *end,
        None => false,
    }
}

fn url_pattern_matches(url: &Url, pattern: &UrlPattern) -> bool {
    match pattern.kind {
        UrlPatternKind::Regex => match Regex::new(&pattern.pattern) {
            Ok(regex) => regex.is_match(url.as_str()) || regex.is_match(&url[Position::BeforePath..]),
            Err(_) => false,
        },
        UrlPatternKind::Simple => simple_pattern_matches(url, &pattern.pattern),
    }
}

/// Simple patterns compare host and path (or only the path for patterns starting with `/`),
/// ignore query strings and trailing slashes, and support `*` wildcards.
fn simple_pattern_matches(url: &Url, pattern: &str) -> bool {
    let pattern = pattern
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let pattern = pattern.split(['?', '#']).next().unwrap_or_default();
    let pattern = pattern.trim_end_matches('/');

    let path = url.path().trim_end_matches('/');
    let target = if pattern.starts_with('/') || pattern.is_empty() {
        path.to_owned()
    } else {
        format!("{}{}", url.host_str().unwrap_or_default(), path)
    };

    let escaped = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    match Regex::new(&format!("^{escaped}$")) {
        Ok(regex) => regex.is_match(&target),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;
    use crate::definitions::{Attributes, FeatureDefinition, VariationMeta};

    fn attributes(value: Value) -> Attributes {
        match value {
            Value::Object(map) => map,
            _ => panic!("attributes must be an object"),
        }
    }

    fn engine(attrs: Value, features: Value, experiments: Value) -> GrowthBookEngine {
        let features: BTreeMap<String, FeatureDefinition> =
            serde_json::from_value(features).unwrap();
        let experiments: Vec<ExperimentDefinition> = serde_json::from_value(experiments).unwrap();
        GrowthBookEngine::new(EvaluationContext {
            attributes: attributes(attrs),
            features,
            experiments,
            ..EvaluationContext::default()
        })
    }

    fn experiment(key: &str, variations: usize) -> ExperimentDefinition {
        ExperimentDefinition {
            key: key.to_owned(),
            variations: (0..variations).map(|i| json!({ "v": i })).collect(),
            ..ExperimentDefinition::default()
        }
    }

    #[test]
    fn unknown_feature() {
        let gb = engine(json!({}), json!({}), json!([]));
        let result = gb.eval_feature("nope");
        assert_eq!(result.source, FeatureSource::UnknownFeature);
        assert_eq!(result.value, Value::Null);
        assert!(result.off());
    }

    #[test]
    fn default_value() {
        let gb = engine(json!({}), json!({ "f": { "defaultValue": "blue" } }), json!([]));
        let result = gb.eval_feature("f");
        assert_eq!(result.source, FeatureSource::DefaultValue);
        assert_eq!(result.value, json!("blue"));
        assert!(result.on());
    }

    #[test]
    fn force_rule_with_condition() {
        let features = json!({
            "f1": { "defaultValue": false, "rules": [{ "force": true, "condition": { "plan": "pro" } }] }
        });

        let pro = engine(json!({ "plan": "pro" }), features.clone(), json!([]));
        let result = pro.eval_feature("f1");
        assert_eq!(result.source, FeatureSource::Force);
        assert_eq!(result.value, json!(true));

        let free = engine(json!({ "plan": "free" }), features, json!([]));
        let result = free.eval_feature("f1");
        assert_eq!(result.source, FeatureSource::DefaultValue);
        assert_eq!(result.value, json!(false));
    }

    #[test]
    fn force_rule_with_coverage() {
        // hash("f", "1", 1) == 0.894, hash("f", "3", 1) == 0.372
        let features = json!({
            "f": { "defaultValue": 0, "rules": [{ "force": 1, "coverage": 0.5 }] }
        });
        let excluded = engine(json!({ "id": "1" }), features.clone(), json!([]));
        assert_eq!(excluded.eval_feature("f").value, json!(0));

        let included = engine(json!({ "id": "3" }), features.clone(), json!([]));
        assert_eq!(included.eval_feature("f").value, json!(1));

        let anonymous = engine(json!({}), features, json!([]));
        assert_eq!(anonymous.eval_feature("f").value, json!(0));
    }

    #[test]
    fn experiment_rule() {
        // hash("exp1", "1", 1) == 0.39, hash("exp1", "alice", 1) == 0.837
        let features = json!({
            "checkout": {
                "defaultValue": "old",
                "rules": [{ "key": "exp1", "variations": ["control", "treatment"] }]
            }
        });

        let gb = engine(json!({ "id": "1" }), features.clone(), json!([]));
        let result = gb.eval_feature("checkout");
        assert_eq!(result.source, FeatureSource::Experiment);
        assert_eq!(result.value, json!("control"));
        let experiment_result = result.experiment_result.unwrap();
        assert_eq!(experiment_result.variation_id, 0);
        assert_eq!(experiment_result.feature_id.as_deref(), Some("checkout"));
        assert_eq!(experiment_result.bucket, Some(0.39));
        assert_eq!(result.experiment.unwrap().key, "exp1");

        let gb = engine(json!({ "id": "alice" }), features, json!([]));
        let result = gb.eval_feature("checkout");
        assert_eq!(result.value, json!("treatment"));
    }

    #[test]
    fn passthrough_variation_falls_through() {
        let features = json!({
            "checkout": {
                "defaultValue": "old",
                "rules": [{
                    "key": "exp1",
                    "variations": ["control", "treatment"],
                    "meta": [{ "passthrough": true }, { "key": "t" }]
                }]
            }
        });

        let gb = engine(json!({ "id": "1" }), features, json!([]));
        let result = gb.eval_feature("checkout");
        assert_eq!(result.source, FeatureSource::DefaultValue);
        assert_eq!(result.value, json!("old"));
    }

    #[test]
    fn run_assigns_by_hash() {
        // hash("three", _, 1): "4" -> 0.249, "2" -> 0.579, "1" -> 0.732
        let exp = experiment("three", 3);
        for (id, expected) in [("4", 0), ("2", 1), ("1", 2)] {
            let gb = engine(json!({ "id": id }), json!({}), json!([]));
            let result = gb.run(&exp);
            assert!(result.in_experiment, "{id} must be in experiment");
            assert!(result.hash_used);
            assert_eq!(result.variation_id, expected);
            assert_eq!(result.value, json!({ "v": expected }));
            assert_eq!(result.key, expected.to_string());
        }
    }

    #[test]
    fn run_requires_hash_attribute() {
        let gb = engine(json!({}), json!({}), json!([]));
        let result = gb.run(&experiment("three", 3));
        assert!(!result.in_experiment);
        assert_eq!(result.variation_id, 0);
        assert!(!result.hash_used);
    }

    #[test]
    fn run_skips_invalid_and_inactive() {
        let gb = engine(json!({ "id": "1" }), json!({}), json!([]));

        assert!(!gb.run(&experiment("single", 1)).in_experiment);

        let mut inactive = experiment("three", 3);
        inactive.active = Some(false);
        assert!(!gb.run(&inactive).in_experiment);
    }

    #[test]
    fn run_respects_condition() {
        let mut exp = experiment("three", 3);
        exp.condition = Some(json!({ "country": "US" }));

        let us = engine(json!({ "id": "1", "country": "US" }), json!({}), json!([]));
        assert!(us.run(&exp).in_experiment);

        let ca = engine(json!({ "id": "1", "country": "CA" }), json!({}), json!([]));
        assert!(!ca.run(&exp).in_experiment);
    }

    #[test]
    fn run_respects_coverage() {
        // hash("exp1", "alice", 1) == 0.837 which is outside of [0, 0.25) and [0.5, 0.75)
        let mut exp = experiment("exp1", 2);
        exp.coverage = Some(0.5);
        let gb = engine(json!({ "id": "alice" }), json!({}), json!([]));
        assert!(!gb.run(&exp).in_experiment);
    }

    #[test]
    fn run_respects_namespace() {
        // hash("__pricing", "3", 1) == 0.054, hash("__pricing", "1", 1) == 0.764
        let mut exp = experiment("three", 3);
        exp.namespace = Some(("pricing".to_owned(), 0.0, 0.5));

        let inside = engine(json!({ "id": "3" }), json!({}), json!([]));
        assert!(inside.run(&exp).in_experiment);

        let outside = engine(json!({ "id": "1" }), json!({}), json!([]));
        assert!(!outside.run(&exp).in_experiment);
    }

    #[test]
    fn filters_apply_to_rules_and_experiments() {
        // hash("flt", "3", 2) == 0.2933, hash("flt", "1", 2) == 0.7137
        let filters = vec![Filter {
            attribute: None,
            seed: "flt".to_owned(),
            hash_version: None,
            ranges: vec![(0.0, 0.5)],
        }];
        let mut exp = experiment("three", 3);
        exp.filters = Some(filters);

        let features = json!({
            "f": {
                "defaultValue": "off",
                "rules": [{ "force": "on", "filters": [{ "seed": "flt", "ranges": [[0, 0.5]] }] }]
            }
        });

        let passing = engine(json!({ "id": "3" }), features.clone(), json!([]));
        assert!(passing.run(&exp).in_experiment);
        assert_eq!(passing.eval_feature("f").value, json!("on"));

        let filtered = engine(json!({ "id": "1" }), features, json!([]));
        assert!(!filtered.run(&exp).in_experiment);
        assert_eq!(filtered.eval_feature("f").value, json!("off"));
    }

    #[test]
    fn run_with_forced_variation() {
        let mut gb = engine(json!({}), json!({}), json!([]));
        gb.context.forced_variations.insert("three".to_owned(), 2);
        let result = gb.run(&experiment("three", 3));
        assert!(result.in_experiment);
        assert!(!result.hash_used);
        assert_eq!(result.variation_id, 2);
    }

    #[test]
    fn experiment_force_is_applied_after_assignment() {
        let mut exp = experiment("three", 3);
        exp.force = Some(0);
        let gb = engine(json!({ "id": "1" }), json!({}), json!([]));
        let result = gb.run(&exp);
        assert!(result.in_experiment);
        assert!(!result.hash_used);
        assert_eq!(result.variation_id, 0);
    }

    #[test]
    fn run_uses_meta() {
        let mut exp = experiment("three", 3);
        exp.meta = Some(vec![
            VariationMeta::default(),
            VariationMeta {
                key: Some("blue".to_owned()),
                name: Some("Blue button".to_owned()),
                passthrough: None,
            },
            VariationMeta::default(),
        ]);
        let gb = engine(json!({ "id": "2" }), json!({}), json!([]));
        let result = gb.run(&exp);
        assert_eq!(result.key, "blue");
        assert_eq!(result.name.as_deref(), Some("Blue button"));
    }

    #[test]
    fn run_with_url_patterns() {
        let mut exp = experiment("three", 3);
        exp.url_patterns = Some(vec![UrlPattern {
            include: Some(true),
            kind: UrlPatternKind::Simple,
            pattern: "/pricing".to_owned(),
        }]);

        let mut gb = engine(json!({ "id": "1" }), json!({}), json!([]));
        assert!(!gb.run(&exp).in_experiment);

        gb.context.url = Some("https://example.com/pricing/?ref=ad".to_owned());
        assert!(gb.run(&exp).in_experiment);

        gb.context.url = Some("https://example.com/about".to_owned());
        assert!(!gb.run(&exp).in_experiment);
    }

    #[test]
    fn url_pattern_kinds() {
        let url = Url::parse("https://shop.example.com/products/42?color=red").unwrap();
        let pattern = |kind, pattern: &str, include| UrlPattern {
            include,
            kind,
            pattern: pattern.to_owned(),
        };

        assert!(url_pattern_matches(&url, &pattern(UrlPatternKind::Simple, "/products/*", None)));
        assert!(url_pattern_matches(
            &url,
            &pattern(UrlPatternKind::Simple, "https://shop.example.com/products/42", None)
        ));
        assert!(!url_pattern_matches(&url, &pattern(UrlPatternKind::Simple, "/products", None)));
        assert!(url_pattern_matches(&url, &pattern(UrlPatternKind::Regex, "^/products/\\d+", None)));
        assert!(!url_pattern_matches(&url, &pattern(UrlPatternKind::Regex, "(", None)));
    }

    #[test]
    fn exclude_patterns_win() {
        let mut exp = experiment("three", 3);
        exp.url_patterns = Some(vec![
            UrlPattern {
                include: None,
                kind: UrlPatternKind::Simple,
                pattern: "/products/*".to_owned(),
            },
            UrlPattern {
                include: Some(false),
                kind: UrlPatternKind::Simple,
                pattern: "/products/42".to_owned(),
            },
        ]);

        let mut gb = engine(json!({ "id": "1" }), json!({}), json!([]));
        gb.context.url = Some("https://example.com/products/7".to_owned());
        assert!(gb.run(&exp).in_experiment);
        gb.context.url = Some("https://example.com/products/42".to_owned());
        assert!(!gb.run(&exp).in_experiment);
    }

    #[test]
    fn debug_does_not_change_results() {
        let features = json!({
            "checkout": { "defaultValue": "old", "rules": [{ "key": "exp1", "variations": ["a", "b"] }] }
        });
        let quiet = engine(json!({ "id": "alice" }), features.clone(), json!([]));
        let mut verbose = engine(json!({ "id": "alice" }), features, json!([]));
        verbose.set_debug(true);

        assert_eq!(quiet.eval_feature("checkout"), verbose.eval_feature("checkout"));
    }
}
