//! Job arguments, always stored as a list of lists.
//!
//! Older records kept arguments as a flat array, which made
//! `["id", "id_convert_to_bigint"]` impossible to tell apart from a single
//! two-element argument. Every value goes through [`JobArguments::normalize`]
//! before it is compared or stored.

use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Ordered arguments handed to a transformation, one inner list per argument.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct JobArguments(Vec<Vec<Value>>);

impl JobArguments {
    /// No arguments.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build arguments from already nested lists.
    pub fn new(arguments: Vec<Vec<Value>>) -> Self {
        Self(arguments)
    }

    /// Build arguments from any serializable value, normalizing its shape.
    pub fn from_serialize<T: Serialize>(value: &T) -> serde_json::Result<Self> {
        Ok(Self::normalize(serde_json::to_value(value)?))
    }

    /// Coerce a stored value into the nested form.
    ///
    /// - `null` becomes no arguments
    /// - a scalar or object `x` becomes `[[x]]`
    /// - inside an array, every element that is not itself an array is wrapped
    pub fn normalize(value: Value) -> Self {
        match value {
            Value::Null => Self::empty(),
            Value::Array(elements) => Self(
                elements
                    .into_iter()
                    .map(|element| match element {
                        Value::Array(inner) => inner,
                        other => vec![other],
                    })
                    .collect(),
            ),
            other => Self(vec![vec![other]]),
        }
    }

    /// Whether `value` is already in the nested form.
    pub fn is_normalized(value: &Value) -> bool {
        match value {
            Value::Array(elements) => elements.iter().all(Value::is_array),
            _ => false,
        }
    }

    /// Number of arguments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no arguments.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The nested argument lists.
    pub fn as_slice(&self) -> &[Vec<Value>] {
        &self.0
    }

    /// JSON form, as stored in the `job_arguments` column.
    pub fn to_value(&self) -> Value {
        Value::Array(self.0.iter().cloned().map(Value::Array).collect())
    }

    /// Deserialize the arguments into a transformation's own type.
    ///
    /// Tuple structs map naturally: `struct Copy(Vec<String>, Vec<String>)`
    /// reads `[["id"], ["id_convert_to_bigint"]]`.
    pub fn deserialize_into<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.to_value())
    }
}

impl<'de> Deserialize<'de> for JobArguments {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::normalize)
    }
}

impl From<Vec<Vec<Value>>> for JobArguments {
    fn from(arguments: Vec<Vec<Value>>) -> Self {
        Self(arguments)
    }
}

impl From<Value> for JobArguments {
    fn from(value: Value) -> Self {
        Self::normalize(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flat_arrays_are_wrapped_per_element() {
        let arguments = JobArguments::normalize(json!(["id", "id_convert_to_bigint"]));
        assert_eq!(
            arguments.to_value(),
            json!([["id"], ["id_convert_to_bigint"]])
        );
    }

    #[test]
    fn a_single_scalar_becomes_one_argument() {
        let arguments = JobArguments::normalize(json!("project_id"));
        assert_eq!(arguments.len(), 1);
        assert_eq!(arguments.to_value(), json!([["project_id"]]));
    }

    #[test]
    fn nested_arrays_are_kept() {
        let value = json!([["id", "other_id"], ["id_tmp", "other_id_tmp"]]);
        assert!(JobArguments::is_normalized(&value));
        assert_eq!(JobArguments::normalize(value.clone()).to_value(), value);
    }

    #[test]
    fn null_means_no_arguments() {
        assert!(JobArguments::normalize(Value::Null).is_empty());
        assert!(!JobArguments::is_normalized(&json!("x")));
        assert!(JobArguments::is_normalized(&json!([])));
    }

    #[test]
    fn deserializing_normalizes_legacy_shapes() {
        let arguments: JobArguments = serde_json::from_value(json!([1, [2, 3]])).unwrap();
        assert_eq!(arguments.to_value(), json!([[1], [2, 3]]));
    }

    #[test]
    fn arguments_deserialize_into_tuple_structs() {
        #[derive(Deserialize)]
        struct CopyColumns(Vec<String>, Vec<String>);

        let arguments = JobArguments::normalize(json!([["id"], ["id_convert_to_bigint"]]));
        let CopyColumns(from, to) = arguments.deserialize_into().unwrap();
        assert_eq!(from, ["id"]);
        assert_eq!(to, ["id_convert_to_bigint"]);
    }
}
