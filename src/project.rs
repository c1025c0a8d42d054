//! Allow-list projection of response payloads.

use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Recursively filters object fields down to an allow-list.
///
/// Arrays keep their structure with each element projected; scalars pass
/// through untouched. Projection runs last in the pipeline, after the cache
/// and dedup guard have stored their copies, so stored payloads always retain
/// every field.
#[derive(Debug, Clone)]
pub struct ResponseProjector {
    allowed: BTreeSet<String>,
}

impl Default for ResponseProjector {
    /// Identifiers plus a small set of display fields.
    fn default() -> Self {
        Self::new([
            "id",
            "_id",
            "name",
            "username",
            "displayName",
            "avatarUrl",
            "createdAt",
            "updatedAt",
        ])
    }
}

impl ResponseProjector {
    /// Create a projector keeping exactly the given fields, at every depth.
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { allowed: fields.into_iter().map(Into::into).collect() }
    }

    /// Extend the allow-list with one more field.
    pub fn allow(mut self, field: impl Into<String>) -> Self {
        self.allowed.insert(field.into());
        self
    }

    /// Project a payload, returning the trimmed copy.
    pub fn project(&self, value: &Value) -> Value {
        match value {
            Value::Object(fields) => Value::Object(
                fields
                    .iter()
                    .filter(|(key, _)| self.allowed.contains(key.as_str()))
                    .map(|(key, nested)| (key.clone(), self.project(nested)))
                    .collect::<Map<String, Value>>(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(|item| self.project(item)).collect()),
            other => other.clone(),
        }
    }
}
