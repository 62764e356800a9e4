//! Targeting conditions in the MongoDB-like format used by feature rules and experiments.
//!
//! Only the subset needed by the built-in engine is supported. Unknown operators make the
//! condition fail rather than pass.
use regex::Regex;
use semver::Version;
use serde_json::{Map, Value};

use crate::definitions::Attributes;

/// Evaluate `condition` against `attributes`.
pub fn eval_condition(attributes: &Attributes, condition: &Value) -> bool {
    match condition {
        Value::Object(condition) => eval_condition_map(attributes, condition),
        // A non-object condition is a misconfiguration.
        _ => false,
    }
}

fn eval_condition_map(attributes: &Attributes, condition: &Map<String, Value>) -> bool {
    condition.iter().all(|(key, value)| match key.as_str() {
        "$or" => eval_or(attributes, value),
        "$nor" => !eval_or(attributes, value),
        "$and" => eval_and(attributes, value),
        "$not" => !eval_condition(attributes, value),
        path => eval_condition_value(value, get_path(attributes, path)),
    })
}

fn eval_or(attributes: &Attributes, conditions: &Value) -> bool {
    let Value::Array(conditions) = conditions else {
        return false;
    };
    conditions.is_empty()
        || conditions
            .iter()
            .any(|condition| eval_condition(attributes, condition))
}

fn eval_and(attributes: &Attributes, conditions: &Value) -> bool {
    let Value::Array(conditions) = conditions else {
        return false;
    };
    conditions
        .iter()
        .all(|condition| eval_condition(attributes, condition))
}

/// Resolve a dotted attribute path (`company.plan`).
fn get_path<'a>(attributes: &'a Attributes, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = attributes.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn is_operator_object(value: &Value) -> Option<&Map<String, Value>> {
    let map = value.as_object()?;
    (!map.is_empty() && map.keys().all(|k| k.starts_with('$'))).then_some(map)
}

fn eval_condition_value(condition_value: &Value, attribute: Option<&Value>) -> bool {
    if let Value::String(expected) = condition_value {
        return attribute.and_then(to_js_string).as_deref() == Some(expected.as_str());
    }

    if let Some(operators) = is_operator_object(condition_value) {
        return operators.iter().all(|(operator, expected)| {
            match Operator::parse(operator) {
                Some(operator) => operator.eval(attribute, expected),
                None => {
                    log::warn!(target: "feature_proxy", operator = operator.as_str(); "unsupported condition operator");
                    false
                }
            }
        });
    }

    attribute.unwrap_or(&Value::Null) == condition_value
}

/// Condition operators understood by the built-in engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Nin,
    All,
    Exists,
    Regex,
    Size,
    ElemMatch,
    Not,
    Type,
    VersionEq,
    VersionNe,
    VersionGt,
    VersionGte,
    VersionLt,
    VersionLte,
}

impl Operator {
    /// Parse an operator key such as `$gte`.
    pub fn parse(s: &str) -> Option<Operator> {
        Some(match s {
            "$eq" => Operator::Eq,
            "$ne" => Operator::Ne,
            "$gt" => Operator::Gt,
            "$gte" => Operator::Gte,
            "$lt" => Operator::Lt,
            "$lte" => Operator::Lte,
            "$in" => Operator::In,
            "$nin" => Operator::Nin,
            "$all" => Operator::All,
            "$exists" => Operator::Exists,
            "$regex" => Operator::Regex,
            "$size" => Operator::Size,
            "$elemMatch" => Operator::ElemMatch,
            "$not" => Operator::Not,
            "$type" => Operator::Type,
            "$veq" => Operator::VersionEq,
            "$vne" => Operator::VersionNe,
            "$vgt" => Operator::VersionGt,
            "$vgte" => Operator::VersionGte,
            "$vlt" => Operator::VersionLt,
            "$vlte" => Operator::VersionLte,
            _ => return None,
        })
    }

    /// Applying `Operator` to the values. Returns `false` if the operator cannot be applied or
    /// there's a misconfiguration.
    pub fn eval(&self, attribute: Option<&Value>, expected: &Value) -> bool {
        self.try_eval(attribute, expected).unwrap_or(false)
    }

    /// Try applying `Operator` to the values, returning `None` if the operator cannot be applied.
    fn try_eval(&self, attribute: Option<&Value>, expected: &Value) -> Option<bool> {
        let attribute = attribute.filter(|v| !v.is_null());
        match self {
            Self::Eq => Some(attribute.unwrap_or(&Value::Null) == expected),
            Self::Ne => Some(attribute.unwrap_or(&Value::Null) != expected),

            Self::Gt | Self::Gte | Self::Lt | Self::Lte => {
                let ordering = compare(attribute?, expected)?;
                Some(match self {
                    Self::Gt => ordering.is_gt(),
                    Self::Gte => ordering.is_ge(),
                    Self::Lt => ordering.is_lt(),
                    Self::Lte => ordering.is_le(),
                    _ => return None,
                })
            }

            Self::In | Self::Nin => {
                let values = expected.as_array()?;
                let is_in = match attribute {
                    Some(Value::Array(actual)) => actual.iter().any(|a| values.contains(a)),
                    Some(actual) => values.contains(actual),
                    None => false,
                };
                Some(if *self == Self::In { is_in } else { !is_in })
            }

            Self::All => {
                let actual = attribute?.as_array()?;
                let expected = expected.as_array()?;
                Some(expected.iter().all(|condition| {
                    actual
                        .iter()
                        .any(|item| eval_condition_value(condition, Some(item)))
                }))
            }

            Self::Exists => {
                let should_exist = expected.as_bool()?;
                Some(attribute.is_some() == should_exist)
            }

            Self::Regex => {
                let regex = Regex::new(expected.as_str()?).ok()?;
                let actual = to_js_string(attribute?)?;
                Some(regex.is_match(&actual))
            }

            Self::Size => {
                let len = attribute?.as_array()?.len();
                Some(eval_condition_value(expected, Some(&Value::from(len))))
            }

            Self::ElemMatch => {
                let actual = attribute?.as_array()?;
                Some(actual.iter().any(|item| {
                    if is_operator_object(expected).is_some() {
                        eval_condition_value(expected, Some(item))
                    } else {
                        match (item, expected) {
                            (Value::Object(item), Value::Object(condition)) => {
                                eval_condition_map(item, condition)
                            }
                            _ => false,
                        }
                    }
                }))
            }

            Self::Not => Some(!eval_condition_value(expected, attribute)),

            Self::Type => Some(type_name(attribute) == expected.as_str()?),

            Self::VersionEq
            | Self::VersionNe
            | Self::VersionGt
            | Self::VersionGte
            | Self::VersionLt
            | Self::VersionLte => {
                let actual = parse_version(attribute?.as_str()?)?;
                let expected = parse_version(expected.as_str()?)?;
                Some(match self {
                    Self::VersionEq => actual == expected,
                    Self::VersionNe => actual != expected,
                    Self::VersionGt => actual > expected,
                    Self::VersionGte => actual >= expected,
                    Self::VersionLt => actual < expected,
                    Self::VersionLte => actual <= expected,
                    _ => return None,
                })
            }
        }
    }
}

/// Numeric comparison when either side is a number, string comparison otherwise.
fn compare(actual: &Value, expected: &Value) -> Option<std::cmp::Ordering> {
    match (actual, expected) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => {
            let a = as_number(actual)?;
            let b = as_number(expected)?;
            a.partial_cmp(&b)
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Lenient version parsing: leading `v` and missing minor/patch components are accepted.
fn parse_version(s: &str) -> Option<Version> {
    let s = s.trim().trim_start_matches(['v', 'V']);
    if let Ok(version) = Version::parse(s) {
        return Some(version);
    }
    let (core, rest) = match s.find(['-', '+']) {
        Some(i) => s.split_at(i),
        None => (s, ""),
    };
    let mut parts: Vec<&str> = core.split('.').collect();
    while parts.len() < 3 {
        parts.push("0");
    }
    Version::parse(&format!("{}{}", parts.join("."), rest)).ok()
}

fn type_name(value: Option<&Value>) -> &'static str {
    match value {
        None | Some(Value::Null) => "null",
        Some(Value::Bool(_)) => "boolean",
        Some(Value::Number(_)) => "number",
        Some(Value::String(_)) => "string",
        Some(Value::Array(_)) => "array",
        Some(Value::Object(_)) => "object",
    }
}

/// String form of a scalar attribute, matching how JavaScript SDKs stringify values.
///
/// Returns `None` for null, arrays and objects.
pub fn to_js_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e21 => {
                format!("{}", f as i64)
            }
            _ => n.to_string(),
        }),
        _ => None,
    }
}
