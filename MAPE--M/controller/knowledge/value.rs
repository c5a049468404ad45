use std::fmt;

use serde::{Deserialize, Serialize};

/// Value stored under a knowledge key.
///
/// Serialized untagged so JSON and TOML scalars map onto it directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KnowledgeValue {
    /// Signed integer.
    Integer(i64),
    /// Floating point number.
    Double(f64),
    /// Array of doubles (positions, vectors).
    Doubles(Vec<f64>),
    /// Free text.
    Text(String),
}

impl KnowledgeValue {
    /// Integer view; doubles truncate, text parses, arrays use their first element.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn to_integer(&self) -> i64 {
        match self {
            Self::Integer(value) => *value,
            Self::Double(value) => *value as i64,
            Self::Doubles(values) => values.first().map_or(0, |value| *value as i64),
            Self::Text(text) => text.trim().parse().unwrap_or(0),
        }
    }

    /// Double view following the same coercions as [`Self::to_integer`].
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn to_double(&self) -> f64 {
        match self {
            Self::Integer(value) => *value as f64,
            Self::Double(value) => *value,
            Self::Doubles(values) => values.first().copied().unwrap_or(0.0),
            Self::Text(text) => text.trim().parse().unwrap_or(0.0),
        }
    }

    /// Array view; scalars become a single-element array, text is empty.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn to_doubles(&self) -> Vec<f64> {
        match self {
            Self::Integer(value) => vec![*value as f64],
            Self::Double(value) => vec![*value],
            Self::Doubles(values) => values.clone(),
            Self::Text(_) => Vec::new(),
        }
    }

    /// Truthiness: non-zero numbers and non-empty text or arrays.
    #[must_use]
    pub fn is_true(&self) -> bool {
        match self {
            Self::Integer(value) => *value != 0,
            Self::Double(value) => *value != 0.0,
            Self::Doubles(values) => !values.is_empty(),
            Self::Text(text) => !text.is_empty(),
        }
    }

    /// Decodes a JSON value, rejecting objects, nulls and mixed arrays.
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    /// Encodes as JSON.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Integer(value) => serde_json::Value::from(*value),
            Self::Double(value) => serde_json::Value::from(*value),
            Self::Doubles(values) => serde_json::Value::from(values.clone()),
            Self::Text(text) => serde_json::Value::from(text.clone()),
        }
    }
}

impl Default for KnowledgeValue {
    fn default() -> Self {
        Self::Integer(0)
    }
}

impl fmt::Display for KnowledgeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(value) => write!(f, "{value}"),
            Self::Double(value) => write!(f, "{value}"),
            Self::Doubles(values) => {
                let joined = values
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "[{joined}]")
            }
            Self::Text(text) => f.write_str(text),
        }
    }
}

impl From<i64> for KnowledgeValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for KnowledgeValue {
    fn from(value: i32) -> Self {
        Self::Integer(value.into())
    }
}

impl From<u32> for KnowledgeValue {
    fn from(value: u32) -> Self {
        Self::Integer(value.into())
    }
}

impl From<bool> for KnowledgeValue {
    fn from(value: bool) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for KnowledgeValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<Vec<f64>> for KnowledgeValue {
    fn from(values: Vec<f64>) -> Self {
        Self::Doubles(values)
    }
}

impl From<&str> for KnowledgeValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for KnowledgeValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coercions_follow_value_kind() {
        assert_eq!(KnowledgeValue::from("42").to_integer(), 42);
        assert_eq!(KnowledgeValue::from(2.9).to_integer(), 2);
        assert_eq!(KnowledgeValue::from(vec![1.5, 2.0]).to_double(), 1.5);
        assert!(!KnowledgeValue::from("").is_true());
        assert!(KnowledgeValue::from(true).is_true());
    }

    #[test]
    fn json_decoding_is_untagged() {
        let parsed: Vec<KnowledgeValue> =
            serde_json::from_str(r#"[3, 0.5, "hold", [1.0, 2.0, 3.0]]"#).unwrap();
        assert_eq!(
            parsed,
            vec![
                KnowledgeValue::Integer(3),
                KnowledgeValue::Double(0.5),
                KnowledgeValue::from("hold"),
                KnowledgeValue::Doubles(vec![1.0, 2.0, 3.0]),
            ]
        );
        assert!(KnowledgeValue::from_json(&serde_json::json!({ "a": 1 })).is_none());
        assert_eq!(KnowledgeValue::from(vec![1.0, 2.5]).to_string(), "[1, 2.5]");
    }
}
